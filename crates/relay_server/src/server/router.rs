#![forbid(unsafe_code)]

use relay_platform::EventRx;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::server::hub::Hub;

/// Settings for the event router.
#[derive(Debug, Clone, Default)]
pub struct RouterConfig {
	pub debug_log_events: bool,
}

/// Router that consumes the upstream event channel and fans out into the hub.
pub struct EventRouter {
	cfg: RouterConfig,
	hub: Hub,
	events_rx: EventRx,
}

impl EventRouter {
	pub fn new(events_rx: EventRx, hub: Hub, cfg: RouterConfig) -> Self {
		Self { cfg, hub, events_rx }
	}

	/// Run the routing loop until the upstream channel is closed.
	pub async fn run(mut self) {
		info!("event router started");

		while let Some(event) = self.events_rx.recv().await {
			// cheers and subs only drive awards upstream; nothing to fan out
			if !event.is_broadcast() {
				debug!(wire_type = event.wire_type(), "skipping non-broadcast event");
				continue;
			}

			if self.cfg.debug_log_events {
				debug!(wire_type = event.wire_type(), "routing event to hub");
			}

			self.hub.broadcast(&event).await;
		}

		info!("event router exiting (upstream event channel closed)");
	}
}

/// Spawn a background task that routes upstream events into the hub.
pub fn spawn_event_router(events_rx: EventRx, hub: Hub, cfg: RouterConfig) -> JoinHandle<()> {
	let router = EventRouter::new(events_rx, hub, cfg);
	tokio::spawn(router.run())
}
