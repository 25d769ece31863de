#![forbid(unsafe_code)]

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context as _, anyhow};
use relay_platform::SecretString;
use relay_util::endpoint::validate_ws_endpoint;
use serde::Deserialize;
use tracing::{info, warn};

/// Default config path: `~/.relay/config.toml`.
pub fn default_config_path() -> anyhow::Result<PathBuf> {
	let home = dirs::home_dir().ok_or_else(|| anyhow!("could not determine home directory"))?;
	Ok(home.join(".relay").join("config.toml"))
}

/// Load the server config from TOML and env overrides.
#[allow(dead_code)]
pub fn load_server_config() -> anyhow::Result<ServerConfig> {
	let path = default_config_path()?;
	load_server_config_from_path(&path)
}

/// Same as `load_server_config` but with an explicit config path.
pub fn load_server_config_from_path(path: &Path) -> anyhow::Result<ServerConfig> {
	let file_cfg = read_toml_if_exists(path)
		.with_context(|| format!("read config from {}", path.display()))?
		.unwrap_or_default();

	let mut cfg = ServerConfig::from_file(file_cfg);

	apply_env_overrides(&mut cfg);

	Ok(cfg)
}

/// Server config (v1).
#[derive(Debug, Clone)]
pub struct ServerConfig {
	pub server: ServerSettings,
	pub upstream: UpstreamSettings,
	pub points: PointsSettings,
}

/// Downstream/server settings.
#[derive(Debug, Clone)]
pub struct ServerSettings {
	/// Downstream websocket listen endpoint (`ws://host:port`).
	pub listen: String,
	/// Capacity of each dashboard client's outbound queue.
	pub client_queue_capacity: usize,
	/// Channel name dashboard replies are sent to.
	pub default_channel: Option<String>,
	/// Optional metrics exporter bind address (host:port).
	pub metrics_bind: Option<String>,
	/// Optional health/readiness HTTP bind address (host:port).
	pub health_bind: Option<String>,
	/// Log every routed event at debug level.
	pub debug_log_events: bool,
}

impl Default for ServerSettings {
	fn default() -> Self {
		Self {
			listen: "ws://127.0.0.1:4670".to_string(),
			client_queue_capacity: 256,
			default_channel: None,
			metrics_bind: None,
			health_bind: None,
			debug_log_events: false,
		}
	}
}

/// Upstream subscriber settings.
#[derive(Debug, Clone, Default)]
pub struct UpstreamSettings {
	/// Numeric channel id the pubsub topics are scoped to.
	pub channel_id: Option<String>,
	/// OAuth access token for the LISTEN request.
	pub access_token: Option<SecretString>,
	/// Pubsub websocket URL (optional override).
	pub ws_url: Option<String>,
	/// Credential poll interval while no token exists (optional override).
	pub credential_poll_interval: Option<Duration>,
}

/// Points service settings.
#[derive(Debug, Clone, Default)]
pub struct PointsSettings {
	/// Base URL of the reputation points service. Absent disables awards.
	pub base_url: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileConfig {
	#[serde(default)]
	server: FileServerSettings,

	#[serde(default)]
	upstream: FileUpstreamSettings,

	#[serde(default)]
	points: FilePointsSettings,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileServerSettings {
	listen: Option<String>,
	client_queue_capacity: Option<usize>,
	default_channel: Option<String>,
	metrics_bind: Option<String>,
	health_bind: Option<String>,
	debug_log_events: Option<bool>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileUpstreamSettings {
	channel_id: Option<String>,
	access_token: Option<String>,
	ws_url: Option<String>,
	credential_poll_interval_secs: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FilePointsSettings {
	base_url: Option<String>,
}

impl ServerConfig {
	fn from_file(file: FileConfig) -> Self {
		let defaults = ServerSettings::default();

		Self {
			server: ServerSettings {
				listen: file
					.server
					.listen
					.filter(|s| !s.trim().is_empty())
					.and_then(|s| match validate_ws_endpoint(&s) {
						Ok(()) => Some(s),
						Err(e) => {
							warn!(error = %e, "ignoring invalid [server].listen from config file");
							None
						}
					})
					.unwrap_or(defaults.listen),
				client_queue_capacity: file
					.server
					.client_queue_capacity
					.filter(|c| *c > 0)
					.unwrap_or(defaults.client_queue_capacity),
				default_channel: file.server.default_channel.filter(|s| !s.trim().is_empty()),
				metrics_bind: file.server.metrics_bind.filter(|s| !s.trim().is_empty()),
				health_bind: file.server.health_bind.filter(|s| !s.trim().is_empty()),
				debug_log_events: file.server.debug_log_events.unwrap_or(false),
			},
			upstream: UpstreamSettings {
				channel_id: file.upstream.channel_id.filter(|s| !s.trim().is_empty()),
				access_token: file
					.upstream
					.access_token
					.filter(|s| !s.trim().is_empty())
					.map(SecretString::new),
				ws_url: file.upstream.ws_url.filter(|s| !s.trim().is_empty()),
				credential_poll_interval: file
					.upstream
					.credential_poll_interval_secs
					.filter(|v| *v > 0)
					.map(Duration::from_secs),
			},
			points: PointsSettings {
				base_url: file.points.base_url.filter(|s| !s.trim().is_empty()),
			},
		}
	}
}

fn parse_env_bool(v: &str) -> Option<bool> {
	match v.trim().to_ascii_lowercase().as_str() {
		"1" | "true" | "yes" | "on" => Some(true),
		"0" | "false" | "no" | "off" => Some(false),
		_ => None,
	}
}

fn read_toml_if_exists(path: &Path) -> anyhow::Result<Option<FileConfig>> {
	match fs::read_to_string(path) {
		Ok(s) => {
			let cfg: FileConfig = toml::from_str(&s).context("parse TOML")?;
			Ok(Some(cfg))
		}
		Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
		Err(e) => Err(anyhow!(e).context("read config file")),
	}
}

fn apply_env_overrides(cfg: &mut ServerConfig) {
	if let Ok(v) = std::env::var("RELAY_LISTEN") {
		let v = v.trim().to_string();
		if !v.is_empty() {
			match validate_ws_endpoint(&v) {
				Ok(()) => {
					cfg.server.listen = v;
					info!("server config: listen overridden by env");
				}
				Err(e) => warn!(error = %e, "ignoring invalid RELAY_LISTEN"),
			}
		}
	}

	if let Ok(v) = std::env::var("RELAY_CLIENT_QUEUE_CAPACITY")
		&& let Ok(capacity) = v.trim().parse::<usize>()
		&& capacity > 0
	{
		cfg.server.client_queue_capacity = capacity;
		info!(capacity, "server config: client_queue_capacity overridden by env");
	}

	if let Ok(v) = std::env::var("RELAY_DEFAULT_CHANNEL") {
		let v = v.trim().to_string();
		if !v.is_empty() {
			cfg.server.default_channel = Some(v);
			info!("server config: default_channel overridden by env");
		}
	}

	if let Ok(v) = std::env::var("RELAY_METRICS_BIND") {
		let v = v.trim().to_string();
		if !v.is_empty() {
			cfg.server.metrics_bind = Some(v);
			info!("server config: metrics_bind overridden by env");
		}
	}

	if let Ok(v) = std::env::var("RELAY_HEALTH_BIND") {
		let v = v.trim().to_string();
		if !v.is_empty() {
			cfg.server.health_bind = Some(v);
			info!("server config: health_bind overridden by env");
		}
	}

	if let Ok(v) = std::env::var("RELAY_DEBUG_LOG_EVENTS")
		&& let Some(flag) = parse_env_bool(&v)
	{
		cfg.server.debug_log_events = flag;
		info!(flag, "server config: debug_log_events overridden by env");
	}

	if let Ok(v) = std::env::var("RELAY_CHANNEL_ID") {
		let v = v.trim().to_string();
		if !v.is_empty() {
			cfg.upstream.channel_id = Some(v);
			info!("upstream config: channel_id overridden by env");
		}
	}

	if let Ok(v) = std::env::var("RELAY_ACCESS_TOKEN") {
		let v = v.trim().to_string();
		if !v.is_empty() {
			cfg.upstream.access_token = Some(SecretString::new(v));
			info!("upstream config: access_token overridden by env");
		}
	}

	if let Ok(v) = std::env::var("RELAY_PUBSUB_URL") {
		let v = v.trim().to_string();
		if !v.is_empty() {
			cfg.upstream.ws_url = Some(v);
			info!("upstream config: ws_url overridden by env");
		}
	}

	if let Ok(v) = std::env::var("RELAY_POINTS_URL") {
		let v = v.trim().to_string();
		if !v.is_empty() {
			cfg.points.base_url = Some(v);
			info!("points config: base_url overridden by env");
		}
	}
}
