#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::sync::Arc;

use relay_domain::Event;
use tokio::sync::{Mutex, mpsc};
use tracing::{debug, error, warn};

/// Server-assigned client identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ClientId(pub u64);

impl std::fmt::Display for ClientId {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		write!(f, "{}", self.0)
	}
}

/// Settings for the broadcast hub.
#[derive(Debug, Clone)]
pub struct HubConfig {
	/// Capacity of each client's outbound queue.
	pub client_queue_capacity: usize,

	pub debug_logs: bool,
}

impl Default for HubConfig {
	fn default() -> Self {
		Self {
			client_queue_capacity: 256,
			debug_logs: false,
		}
	}
}

struct Inner {
	clients: HashMap<ClientId, mpsc::Sender<String>>,
	dropped_total: u64,
}

/// Fan-out hub: every broadcast event goes to every registered client.
///
/// Each client gets a bounded queue. A full queue drops the payload for that
/// client only; delivered payloads keep their broadcast order per client.
#[derive(Clone)]
pub struct Hub {
	inner: Arc<Mutex<Inner>>,
	cfg: HubConfig,
}

impl Hub {
	pub fn new(cfg: HubConfig) -> Self {
		Self {
			inner: Arc::new(Mutex::new(Inner {
				clients: HashMap::new(),
				dropped_total: 0,
			})),
			cfg,
		}
	}

	/// Register a client and hand back its outbound queue.
	///
	/// An id can be registered at most once; re-registering replaces (and
	/// closes) the previous queue.
	pub async fn register(&self, id: ClientId) -> mpsc::Receiver<String> {
		let (tx, rx) = mpsc::channel(self.cfg.client_queue_capacity);

		let mut inner = self.inner.lock().await;
		if inner.clients.insert(id, tx).is_some() {
			warn!(client = %id, "client id re-registered; previous queue closed");
		}
		metrics::gauge!("relay_hub_clients").set(inner.clients.len() as f64);
		rx
	}

	/// Remove a client. Safe to call more than once; only the first call
	/// drops the sender and thereby closes the client's queue.
	pub async fn unregister(&self, id: ClientId) {
		let mut inner = self.inner.lock().await;
		if inner.clients.remove(&id).is_some() {
			if self.cfg.debug_logs {
				debug!(client = %id, "client unregistered");
			}
			metrics::gauge!("relay_hub_clients").set(inner.clients.len() as f64);
		}
	}

	/// Serialize once and enqueue the identical payload to every client.
	///
	/// Serialization failure aborts the whole broadcast: no client sees a
	/// partial or inconsistent delivery.
	pub async fn broadcast(&self, event: &Event) {
		let payload = match event.to_wire_json() {
			Ok(p) => p,
			Err(e) => {
				error!(error = %e, wire_type = event.wire_type(), "failed to serialize event; broadcast aborted");
				return;
			}
		};

		let mut guard = self.inner.lock().await;
		let inner = &mut *guard;
		let mut stale: Vec<ClientId> = Vec::new();

		for (id, tx) in inner.clients.iter() {
			match tx.try_send(payload.clone()) {
				Ok(()) => {}
				Err(mpsc::error::TrySendError::Full(_)) => {
					inner.dropped_total += 1;
					metrics::counter!("relay_hub_dropped_total").increment(1);
					debug!(client = %id, "client queue full; dropping event for this client");
				}
				Err(mpsc::error::TrySendError::Closed(_)) => {
					stale.push(*id);
				}
			}
		}

		for id in stale {
			inner.clients.remove(&id);
			if self.cfg.debug_logs {
				debug!(client = %id, "pruned closed client during broadcast");
			}
		}
		metrics::gauge!("relay_hub_clients").set(inner.clients.len() as f64);
		metrics::counter!("relay_hub_broadcasts_total").increment(1);
	}

	/// Number of registered clients.
	pub async fn client_count(&self) -> usize {
		self.inner.lock().await.clients.len()
	}

	/// Total payloads dropped because a client queue was full.
	#[allow(dead_code)]
	pub async fn dropped_total(&self) -> u64 {
		self.inner.lock().await.dropped_total
	}
}
