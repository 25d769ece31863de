#![forbid(unsafe_code)]

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors for decoding frames received from dashboard clients.
#[derive(Debug, Error)]
pub enum FrameError {
	#[error("empty frame")]
	Empty,
	#[error("invalid client frame: {0}")]
	Invalid(#[from] serde_json::Error),
}

/// The only frame shape accepted from dashboard clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientMessage {
	pub content: String,
}

impl ClientMessage {
	/// Decode a client frame. Callers are expected to skip frames that fail here.
	pub fn parse(raw: &str) -> Result<Self, FrameError> {
		let raw = raw.trim();
		if raw.is_empty() {
			return Err(FrameError::Empty);
		}
		Ok(serde_json::from_str(raw)?)
	}
}

/// Everything the relay can deliver to dashboard clients or act on internally.
///
/// The enum is closed on purpose: the wire tag and broadcast policy are both
/// exhaustive matches, so a new variant cannot be added without deciding them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Event {
	ChatMessage(ChatMessage),
	ClearChat(ClearChat),
	ClearMsg(ClearMsg),
	RewardRedemption(RewardEvent),
	Cheer(CheerEvent),
	Subscription(SubEvent),
}

impl Event {
	/// Tag placed in the envelope `type` field.
	///
	/// Reward redemptions reuse the upstream payload's own type string so
	/// dashboards can distinguish redemption kinds without a second field.
	pub fn wire_type(&self) -> &str {
		match self {
			Event::ChatMessage(_) => "message",
			Event::ClearChat(_) => "clearchat",
			Event::ClearMsg(_) => "clearmsg",
			Event::RewardRedemption(ev) => ev.kind.as_str(),
			Event::Cheer(_) => "cheer",
			Event::Subscription(_) => "sub",
		}
	}

	/// Whether this event is fanned out to dashboard clients.
	///
	/// Cheers and subscriptions only drive point awards; they never reach
	/// dashboards.
	pub const fn is_broadcast(&self) -> bool {
		match self {
			Event::ChatMessage(_) | Event::ClearChat(_) | Event::ClearMsg(_) | Event::RewardRedemption(_) => true,
			Event::Cheer(_) | Event::Subscription(_) => false,
		}
	}

	/// Serialize the `{"type": ..., "data": ...}` envelope sent downstream.
	pub fn to_wire_json(&self) -> Result<String, serde_json::Error> {
		#[derive(Serialize)]
		struct Envelope<'a, T> {
			r#type: &'a str,
			data: &'a T,
		}

		fn envelope<T: Serialize>(tag: &str, data: &T) -> Result<String, serde_json::Error> {
			serde_json::to_string(&Envelope { r#type: tag, data })
		}

		match self {
			Event::ChatMessage(ev) => envelope(self.wire_type(), ev),
			Event::ClearChat(ev) => envelope(self.wire_type(), ev),
			Event::ClearMsg(ev) => envelope(self.wire_type(), ev),
			Event::RewardRedemption(ev) => envelope(self.wire_type(), ev),
			Event::Cheer(ev) => envelope(self.wire_type(), ev),
			Event::Subscription(ev) => envelope(self.wire_type(), ev),
		}
	}
}

/// A chat message enriched for dashboard rendering.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
	pub id: String,
	pub timestamp: DateTime<Utc>,
	pub content: String,
	#[serde(rename = "isCommand")]
	pub is_command: bool,
	#[serde(default)]
	pub emotes: Vec<Emote>,
	#[serde(rename = "channelName")]
	pub channel_name: String,
	#[serde(default)]
	pub highlighted: bool,
	#[serde(default)]
	pub me: bool,
	pub user: ChatUser,
}

/// Author details attached to a chat message.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ChatUser {
	pub id: String,
	#[serde(rename = "displayName")]
	pub display_name: String,
	pub username: String,
	pub color: String,
	#[serde(rename = "isPartner")]
	pub is_partner: bool,
	#[serde(rename = "isFounder")]
	pub is_founder: bool,
	#[serde(rename = "isMod")]
	pub is_mod: bool,
	#[serde(rename = "isVIP")]
	pub is_vip: bool,
	#[serde(rename = "isSubscriber")]
	pub is_subscriber: bool,
	#[serde(rename = "isBroadcaster")]
	pub is_broadcaster: bool,
	#[serde(rename = "subscriberMonths")]
	pub subscriber_months: i64,
	#[serde(rename = "subscriberBadgeMonths")]
	pub subscriber_badge_months: i64,
	#[serde(rename = "subscriberBadgeURL")]
	pub subscriber_badge_url: String,
	/// badge name -> amount
	pub badges: BTreeMap<String, String>,
	#[serde(rename = "badgeURLs")]
	pub badge_urls: Vec<String>,
	#[serde(rename = "logoURL")]
	pub logo_url: String,
	pub status: String,
	pub team: String,
	#[serde(rename = "reputationPoints")]
	pub reputation_points: i64,
}

/// Emote occurrence inside a chat message.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Emote {
	pub id: String,
	#[serde(default)]
	pub ranges: Vec<EmoteRange>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EmoteRange {
	pub from: i64,
	pub to: i64,
}

/// All of a user's messages were purged (timeout/ban).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClearChat {
	pub username: String,
}

/// A single message was deleted.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClearMsg {
	pub username: String,
	#[serde(rename = "msgID")]
	pub msg_id: String,
}

/// Channel-points redemption as delivered by the upstream feed.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RewardEvent {
	/// Upstream event type (e.g. `reward-redeemed`); doubles as the wire tag.
	#[serde(rename = "type")]
	pub kind: String,
	pub data: RewardData,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RewardData {
	pub timestamp: Option<DateTime<Utc>>,
	pub redemption: Redemption,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Redemption {
	pub id: String,
	pub user: RewardUser,
	pub channel_id: String,
	pub redeemed_at: Option<DateTime<Utc>>,
	pub reward: Reward,
	pub user_input: String,
	pub status: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RewardUser {
	pub id: String,
	pub login: String,
	pub display_name: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Reward {
	pub id: String,
	pub channel_id: String,
	pub title: String,
	pub prompt: String,
	pub cost: i64,
	pub is_user_input_required: bool,
	pub is_sub_only: bool,
	pub image: RewardImages,
	pub default_image: RewardImages,
	pub background_color: String,
	pub is_enabled: bool,
	pub is_paused: bool,
	pub is_in_stock: bool,
	pub max_per_stream: MaxPerStream,
	pub should_redemptions_skip_request_queue: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RewardImages {
	pub url_1x: String,
	pub url_2x: String,
	pub url_4x: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MaxPerStream {
	pub is_enabled: bool,
	pub max_per_stream: i64,
}

/// Bits cheer notification. Drives point awards only.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CheerEvent {
	pub data: CheerData,
	pub version: String,
	pub message_type: String,
	pub message_id: String,
	pub is_anonymous: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CheerData {
	pub user_name: String,
	pub channel_name: String,
	pub user_id: String,
	pub channel_id: String,
	pub time: Option<DateTime<Utc>>,
	pub chat_message: String,
	pub bits_used: i64,
	pub total_bits_used: i64,
	pub context: String,
	pub badge_entitlement: BadgeEntitlement,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BadgeEntitlement {
	pub new_version: i64,
	pub previous_version: i64,
}

/// Subscription notification (new sub, resub, gift, anonymous gift).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SubEvent {
	pub user_name: String,
	pub display_name: String,
	pub channel_name: String,
	pub user_id: String,
	pub channel_id: String,
	pub time: Option<DateTime<Utc>>,
	pub sub_plan: String,
	pub sub_plan_name: String,
	pub months: i64,
	pub cumulative_months: i64,
	pub streak_months: i64,
	/// `sub`, `resub`, `subgift`, `anonsubgift`, ...
	pub context: String,
	pub is_gift: bool,
	pub sub_message: SubMessage,
	pub recipient_id: String,
	pub recipient_user_name: String,
	pub recipient_display_name: String,
	pub multi_month_duration: i64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SubMessage {
	pub message: String,
	pub emotes: Vec<SubMessageEmote>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SubMessageEmote {
	pub start: i64,
	pub end: i64,
	pub id: i64,
}
