#![forbid(unsafe_code)]

pub mod points;
pub mod pubsub;
pub mod scheduler;

use std::fmt;

use relay_domain::Event;
use tokio::sync::mpsc;
use uuid::Uuid;

/// Wrapper that redacts in logs.
#[derive(Clone)]
pub struct SecretString(String);

impl SecretString {
	pub fn new(s: impl Into<String>) -> Self {
		Self(s.into())
	}

	/// Access the inner secret string.
	pub fn expose(&self) -> &str {
		&self.0
	}
}

impl fmt::Debug for SecretString {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str("SecretString(<redacted>)")
	}
}

impl fmt::Display for SecretString {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str("<redacted>")
	}
}

impl serde::Serialize for SecretString {
	fn serialize<S>(&self, serializer: S) -> Result<<S as serde::Serializer>::Ok, <S as serde::Serializer>::Error>
	where
		S: serde::Serializer,
	{
		serializer.serialize_str("")
	}
}

impl<'de> serde::Deserialize<'de> for SecretString {
	fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
	where
		D: serde::Deserializer<'de>,
	{
		let s = String::deserialize(deserializer)?;
		Ok(SecretString::new(s))
	}
}

/// Source of the upstream OAuth access token.
///
/// Token acquisition and refresh live outside this crate; the subscriber only
/// polls for whatever is currently available.
#[async_trait::async_trait]
pub trait CredentialProvider: Send + Sync + 'static {
	/// Current access token, if one is available yet.
	async fn access_token(&self) -> Option<SecretString>;
}

/// Provider backed by a fixed (possibly absent) token, e.g. from config.
pub struct StaticCredentialProvider {
	token: Option<SecretString>,
}

impl StaticCredentialProvider {
	pub fn new(token: Option<SecretString>) -> Self {
		let token = token.filter(|t| !t.expose().trim().is_empty());
		Self { token }
	}
}

#[async_trait::async_trait]
impl CredentialProvider for StaticCredentialProvider {
	async fn access_token(&self) -> Option<SecretString> {
		self.token.clone()
	}
}

/// Forwards dashboard replies into the streaming platform's chat.
#[async_trait::async_trait]
pub trait ChatSender: Send + Sync + 'static {
	async fn send(&self, channel: &str, text: &str) -> anyhow::Result<()>;
}

/// Chat sender that drops everything. Stands in when no chat client is wired.
pub struct NullChatSender;

#[async_trait::async_trait]
impl ChatSender for NullChatSender {
	async fn send(&self, channel: &str, text: &str) -> anyhow::Result<()> {
		tracing::debug!(channel, len = text.len(), "null chat sender dropping message");
		Ok(())
	}
}

/// Awards reputation points to a user.
#[async_trait::async_trait]
pub trait PointsAwarder: Send + Sync + 'static {
	async fn award(&self, username: &str, amount: i64) -> anyhow::Result<()>;
}

/// Helper types for wiring the subscriber to the server.
pub type EventTx = mpsc::Sender<Event>;
pub type EventRx = mpsc::Receiver<Event>;

/// Build a standard bounded event channel.
pub fn bounded_event_channel(capacity: usize) -> (EventTx, EventRx) {
	mpsc::channel(capacity)
}

/// Generate an opaque session id.
pub fn new_session_id() -> String {
	Uuid::new_v4().to_string()
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn secret_string_redacts() {
		let s = SecretString::new("oauth-token");
		assert_eq!(format!("{s}"), "<redacted>");
		assert_eq!(format!("{s:?}"), "SecretString(<redacted>)");
		assert_eq!(s.expose(), "oauth-token");
		assert_eq!(serde_json::to_string(&s).unwrap(), "\"\"");
	}

	#[tokio::test]
	async fn static_provider_filters_blank_tokens() {
		let none = StaticCredentialProvider::new(Some(SecretString::new("   ")));
		assert!(none.access_token().await.is_none());

		let some = StaticCredentialProvider::new(Some(SecretString::new("tok")));
		assert_eq!(some.access_token().await.unwrap().expose(), "tok");
	}
}
