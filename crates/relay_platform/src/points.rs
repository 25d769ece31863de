#![forbid(unsafe_code)]

use anyhow::Context as _;
use tracing::{debug, warn};

use crate::PointsAwarder;

/// Points service client: `PUT {base}/user/{username}/reputation_points`.
///
/// Awards are best-effort. A non-2xx response is logged and dropped; the
/// caller never retries.
pub struct HttpPointsAwarder {
	base_url: String,
	client: reqwest::Client,
}

impl HttpPointsAwarder {
	pub fn new(base_url: impl Into<String>) -> Self {
		let base_url = base_url.into().trim_end_matches('/').to_string();
		Self {
			base_url,
			client: reqwest::Client::new(),
		}
	}

	fn award_url(&self, username: &str, amount: i64) -> String {
		format!(
			"{}/user/{}/reputation_points?reputation_points={}",
			self.base_url, username, amount
		)
	}
}

#[async_trait::async_trait]
impl PointsAwarder for HttpPointsAwarder {
	async fn award(&self, username: &str, amount: i64) -> anyhow::Result<()> {
		let url = self.award_url(username, amount);

		let resp = self
			.client
			.put(&url)
			.send()
			.await
			.with_context(|| format!("put reputation points for {username}"))?;

		let status = resp.status();
		if !status.is_success() {
			warn!(username, amount, %status, "points service rejected award");
			metrics::counter!("relay_points_award_failures_total").increment(1);
			return Ok(());
		}

		debug!(username, amount, "awarded reputation points");
		metrics::counter!("relay_points_awarded_total").increment(amount.max(0) as u64);
		Ok(())
	}
}

/// Awarder that does nothing. Used when no points service is configured.
pub struct NullPointsAwarder;

#[async_trait::async_trait]
impl PointsAwarder for NullPointsAwarder {
	async fn award(&self, username: &str, amount: i64) -> anyhow::Result<()> {
		debug!(username, amount, "null points awarder dropping award");
		Ok(())
	}
}
