#![forbid(unsafe_code)]

use anyhow::Context as _;
use relay_domain::{CheerEvent, Event, RewardEvent, SubEvent};

use super::wire::{TOPIC_BITS_PREFIX, TOPIC_POINTS_PREFIX, TOPIC_SUBS_PREFIX, unescape_message};

/// Points to credit to a single user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Award {
	pub username: String,
	pub amount: i64,
}

/// What a topic message asks the relay to do.
#[derive(Debug)]
pub(crate) enum Classified {
	/// Fan the event out to dashboards, optionally crediting points first.
	Forward { event: Event, award: Option<Award> },
	/// Credit points only; nothing reaches dashboards. Order matters for
	/// gift subs (gifter before recipient).
	AwardOnly { awards: Vec<Award> },
	/// Topic we did not subscribe to or a context we do not handle.
	Ignore,
}

const POINTS_PER_BIT: i64 = 10;
const POINTS_SUB: i64 = 2500;
const POINTS_GIFTER: i64 = 5000;

/// Classify the inner message of a `MESSAGE` frame by its topic prefix.
pub(crate) fn classify(topic: &str, raw_message: &str) -> anyhow::Result<Classified> {
	let message = unescape_message(raw_message);

	if topic.starts_with(TOPIC_POINTS_PREFIX) {
		let reward: RewardEvent = serde_json::from_str(&message).context("parse reward redemption")?;
		return Ok(classify_reward(reward));
	}

	if topic.starts_with(TOPIC_BITS_PREFIX) {
		let cheer: CheerEvent = serde_json::from_str(&message).context("parse cheer")?;
		return Ok(classify_cheer(cheer));
	}

	if topic.starts_with(TOPIC_SUBS_PREFIX) {
		let sub: SubEvent = serde_json::from_str(&message).context("parse subscription")?;
		return Ok(classify_sub(sub));
	}

	Ok(Classified::Ignore)
}

/// Redemptions always reach dashboards. Rewards whose title mentions
/// "reputation" additionally credit the reward cost to the redeemer.
fn classify_reward(reward: RewardEvent) -> Classified {
	let redemption = &reward.data.redemption;

	let award = if redemption.reward.title.to_lowercase().contains("reputation") {
		Some(Award {
			username: redemption.user.login.clone(),
			amount: redemption.reward.cost,
		})
	} else {
		None
	};

	Classified::Forward {
		event: Event::RewardRedemption(reward),
		award,
	}
}

fn classify_cheer(cheer: CheerEvent) -> Classified {
	Classified::AwardOnly {
		awards: vec![Award {
			username: cheer.data.user_name.clone(),
			amount: cheer.data.bits_used * POINTS_PER_BIT,
		}],
	}
}

fn classify_sub(sub: SubEvent) -> Classified {
	let context = sub.context.as_str();

	// anonsubgift also ends in "gift"; check the anonymous case first
	let awards = if context.starts_with("anon") {
		vec![Award {
			username: sub.recipient_user_name.clone(),
			amount: POINTS_SUB,
		}]
	} else if context.ends_with("gift") {
		vec![
			Award {
				username: sub.user_name.clone(),
				amount: POINTS_GIFTER,
			},
			Award {
				username: sub.recipient_user_name.clone(),
				amount: POINTS_SUB,
			},
		]
	} else if context.ends_with("sub") {
		vec![Award {
			username: sub.user_name.clone(),
			amount: POINTS_SUB,
		}]
	} else {
		return Classified::Ignore;
	};

	Classified::AwardOnly { awards }
}
