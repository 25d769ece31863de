#![forbid(unsafe_code)]

mod config;
mod server;

use std::sync::Arc;

use relay_platform::pubsub::{ConnectionState, PubSubConfig, PubSubSubscriber};
use relay_platform::points::{HttpPointsAwarder, NullPointsAwarder};
use relay_platform::scheduler::TaskScheduler;
use relay_platform::{NullChatSender, PointsAwarder, StaticCredentialProvider, bounded_event_channel};
use relay_util::endpoint::WsEndpoint;
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use crate::server::client::{ClientConnection, websocket_config};
use crate::server::health::{HealthState, spawn_health_server};
use crate::server::hub::{Hub, HubConfig};
use crate::server::router::{RouterConfig, spawn_event_router};

/// Capacity of the upstream event channel between the subscriber and router.
const EVENT_CHANNEL_CAPACITY: usize = 256;

fn usage_and_exit() -> ! {
	eprintln!(
		"Usage: relay_server [--bind ws://host:port]\n\
\n\
Options:\n\
\t--bind    Bind endpoint (default: ws://127.0.0.1:4670, or [server].listen from config)\n\
\t         Format: ws://host:port\n\
\t--help   Show this help\n\
"
	);
	std::process::exit(2)
}

fn parse_args() -> Option<String> {
	let mut bind_endpoint = None;

	let mut it = std::env::args().skip(1);
	while let Some(arg) = it.next() {
		match arg.as_str() {
			"--help" | "-h" => usage_and_exit(),
			"--bind" | "--listen" => {
				let v = it.next().unwrap_or_else(|| usage_and_exit());
				if v.trim().is_empty() {
					eprintln!("--bind must be non-empty (expected ws://host:port)");
					usage_and_exit();
				}
				bind_endpoint = Some(v);
			}
			other => {
				eprintln!("Unknown argument: {other}");
				usage_and_exit();
			}
		}
	}

	bind_endpoint
}

fn init_tracing() {
	let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| "info,relay_server=debug".to_string());

	tracing_subscriber::registry()
		.with(tracing_subscriber::EnvFilter::new(filter))
		.with(tracing_subscriber::fmt::layer().with_target(false))
		.init();
}

fn init_metrics(bind: Option<&str>) {
	let Some(bind) = bind else {
		return;
	};

	match bind.parse::<std::net::SocketAddr>() {
		Ok(addr) => {
			if let Err(e) = metrics_exporter_prometheus::PrometheusBuilder::new()
				.with_http_listener(addr)
				.install()
			{
				warn!(error = %e, "failed to start metrics exporter");
			} else {
				info!(%addr, "metrics exporter listening");
			}
		}
		Err(e) => {
			warn!(error = %e, %bind, "invalid metrics bind address (expected host:port)");
		}
	}
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
	init_tracing();

	let cli_bind = parse_args();

	let config_path = crate::config::default_config_path()?;
	let server_cfg = crate::config::load_server_config_from_path(&config_path)?;
	info!(path = %config_path.display(), "loaded server config (toml + env overrides)");

	let bind_endpoint = cli_bind.unwrap_or_else(|| server_cfg.server.listen.clone());
	let bind = WsEndpoint::parse(&bind_endpoint).unwrap_or_else(|e| {
		eprintln!("{e}");
		usage_and_exit();
	});
	let bind_addr = bind.to_socket_addr_if_ip_literal().unwrap_or_else(|e| {
		eprintln!("{e}");
		usage_and_exit();
	});

	init_metrics(server_cfg.server.metrics_bind.as_deref());

	let health_state = HealthState::new();
	if let Some(bind) = server_cfg.server.health_bind.as_deref() {
		match bind.parse::<std::net::SocketAddr>() {
			Ok(addr) => {
				spawn_health_server(addr, health_state.clone());
				info!(%addr, "health server listening");
			}
			Err(e) => warn!(error = %e, %bind, "invalid health bind address (expected host:port)"),
		}
	}

	let Some(channel_id) = server_cfg.upstream.channel_id.clone() else {
		return Err(anyhow::anyhow!(
			"no upstream channel id configured (set [upstream].channel_id or RELAY_CHANNEL_ID)"
		));
	};

	let hub = Hub::new(HubConfig {
		client_queue_capacity: server_cfg.server.client_queue_capacity,
		debug_logs: server_cfg.server.debug_log_events,
	});

	let scheduler = TaskScheduler::new();

	let credentials = Arc::new(StaticCredentialProvider::new(server_cfg.upstream.access_token.clone()));

	let awarder: Arc<dyn PointsAwarder> = match server_cfg.points.base_url.as_deref() {
		Some(base_url) => {
			info!(base_url, "points awards enabled");
			Arc::new(HttpPointsAwarder::new(base_url))
		}
		None => {
			info!("points awards disabled (no [points].base_url configured)");
			Arc::new(NullPointsAwarder)
		}
	};

	let mut pubsub_cfg = PubSubConfig::new(channel_id);
	if let Some(ws_url) = server_cfg.upstream.ws_url.clone() {
		pubsub_cfg.ws_url = ws_url;
	}
	if let Some(poll) = server_cfg.upstream.credential_poll_interval {
		pubsub_cfg.credential_poll_interval = poll;
	}

	let subscriber = PubSubSubscriber::new(pubsub_cfg, credentials, awarder, scheduler.clone());

	// readiness follows the upstream link: ready only while it is listening
	let mut upstream_state = subscriber.state();
	{
		let health_state = health_state.clone();
		tokio::spawn(async move {
			loop {
				match *upstream_state.borrow_and_update() {
					ConnectionState::Listening => health_state.mark_ready(),
					_ => health_state.mark_not_ready(),
				}
				if upstream_state.changed().await.is_err() {
					break;
				}
			}
		});
	}

	let (events_tx, events_rx) = bounded_event_channel(EVENT_CHANNEL_CAPACITY);

	tokio::spawn(async move {
		if let Err(e) = subscriber.run(events_tx).await {
			warn!(error = %e, "pubsub subscriber exited with error");
		}
	});

	let _router = spawn_event_router(
		events_rx,
		hub.clone(),
		RouterConfig {
			debug_log_events: server_cfg.server.debug_log_events,
		},
	);

	let chat = Arc::new(NullChatSender);
	let default_channel = server_cfg.server.default_channel.clone().unwrap_or_default();

	let listener = tokio::net::TcpListener::bind(bind_addr).await?;
	info!(bind = %bind_addr, "relay_server: websocket endpoint ready");

	let mut next_conn_id: u64 = 1;

	loop {
		let (stream, remote) = match listener.accept().await {
			Ok(conn) => conn,
			Err(e) => {
				// accept failures (fd exhaustion etc.) are transient; keep serving
				warn!(error = %e, "accept failed");
				continue;
			}
		};

		let conn_id = next_conn_id;
		next_conn_id += 1;
		metrics::counter!("relay_server_connections_total").increment(1);

		let hub = hub.clone();
		let chat = Arc::clone(&chat);
		let default_channel = default_channel.clone();
		tokio::spawn(async move {
			match tokio_tungstenite::accept_async_with_config(stream, Some(websocket_config())).await {
				Ok(ws) => {
					info!(conn_id, remote = %remote, "accepted connection");
					let conn = ClientConnection::new(conn_id, hub, chat, default_channel);
					conn.run(ws).await;
				}
				Err(e) => {
					warn!(conn_id, remote = %remote, error = %e, "websocket handshake failed");
				}
			}
		});
	}
}
