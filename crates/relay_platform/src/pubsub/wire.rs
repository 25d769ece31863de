#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};

use crate::SecretString;

pub(crate) const TYPE_RESPONSE: &str = "RESPONSE";
pub(crate) const TYPE_RECONNECT: &str = "RECONNECT";
pub(crate) const TYPE_PONG: &str = "PONG";
pub(crate) const TYPE_MESSAGE: &str = "MESSAGE";

pub(crate) const TOPIC_POINTS_PREFIX: &str = "channel-points-channel-v1";
pub(crate) const TOPIC_SUBS_PREFIX: &str = "channel-subscribe-events-v1";
pub(crate) const TOPIC_BITS_PREFIX: &str = "channel-bits-events-v2";

/// Client -> upstream request frame (`LISTEN` / `PING`).
#[derive(Debug, Clone, Serialize)]
pub(crate) struct PubSubRequest {
	#[serde(rename = "type")]
	pub kind: String,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub nonce: Option<String>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub data: Option<PubSubRequestData>,
}

#[derive(Debug, Clone, Serialize)]
pub(crate) struct PubSubRequestData {
	pub topics: Vec<String>,
	pub auth_token: String,
}

impl PubSubRequest {
	pub fn listen(topics: Vec<String>, token: &SecretString) -> Self {
		Self {
			kind: "LISTEN".to_string(),
			nonce: None,
			data: Some(PubSubRequestData {
				topics,
				auth_token: token.expose().to_string(),
			}),
		}
	}

	pub fn ping() -> Self {
		Self {
			kind: "PING".to_string(),
			nonce: None,
			data: None,
		}
	}
}

/// Upstream -> client frame.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub(crate) struct PubSubResponse {
	#[serde(rename = "type")]
	pub kind: String,
	#[allow(dead_code)]
	pub nonce: String,
	pub error: String,
	pub data: PubSubResponseData,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub(crate) struct PubSubResponseData {
	pub topic: String,
	pub message: String,
}

/// Topics subscribed for a channel: points redemptions, subs, bits.
pub(crate) fn topics_for_channel(channel_id: &str) -> Vec<String> {
	vec![
		format!("{TOPIC_POINTS_PREFIX}.{channel_id}"),
		format!("{TOPIC_SUBS_PREFIX}.{channel_id}"),
		format!("{TOPIC_BITS_PREFIX}.{channel_id}"),
	]
}

/// The inner `data.message` payload arrives JSON-encoded twice; quotes in the
/// nested document are still backslash-escaped after the first decode.
pub(crate) fn unescape_message(raw: &str) -> String {
	raw.replace("\\\"", "\"")
}
