#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use relay_domain::ClientMessage;
use relay_platform::ChatSender;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::{MissedTickBehavior, timeout};
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::Bytes;
use tokio_tungstenite::tungstenite::protocol::{Message, WebSocketConfig};
use tracing::{debug, warn};

use crate::server::hub::{ClientId, Hub};

/// Deadline for a single outbound write.
const WRITE_WAIT: Duration = Duration::from_secs(10);
/// A connection with no inbound frame (data or pong) for this long is dead.
const PONG_WAIT: Duration = Duration::from_secs(60);
/// Ping cadence; must fire comfortably inside `PONG_WAIT`.
const PING_PERIOD: Duration = Duration::from_secs(54);
/// Dashboard clients only ever send tiny `{"content"}` frames.
const MAX_FRAME_BYTES: usize = 512;

type WsSink = SplitSink<WebSocketStream<TcpStream>, Message>;
type WsStream = SplitStream<WebSocketStream<TcpStream>>;

/// Protocol-level limits for accepted dashboard sockets. An inbound message
/// above `MAX_FRAME_BYTES` fails the read instead of being buffered first,
/// so a hostile client cannot make the server hold a large frame in memory.
/// Outbound frames (coalesced broadcasts) are not limited.
pub fn websocket_config() -> WebSocketConfig {
	WebSocketConfig::default()
		.max_message_size(Some(MAX_FRAME_BYTES))
		.max_frame_size(Some(MAX_FRAME_BYTES))
}

/// Decrements the connection gauge when the connection winds down.
struct ConnectionGaugeGuard;

impl ConnectionGaugeGuard {
	fn new() -> Self {
		metrics::gauge!("relay_server_active_connections").increment(1.0);
		Self
	}
}

impl Drop for ConnectionGaugeGuard {
	fn drop(&mut self) {
		metrics::gauge!("relay_server_active_connections").decrement(1.0);
	}
}

/// One accepted dashboard connection: a read loop and a write loop over the
/// same websocket, joined through the hub registration.
pub struct ClientConnection {
	conn_id: u64,
	hub: Hub,
	chat: Arc<dyn ChatSender>,
	default_channel: String,
}

impl ClientConnection {
	pub fn new(conn_id: u64, hub: Hub, chat: Arc<dyn ChatSender>, default_channel: impl Into<String>) -> Self {
		Self {
			conn_id,
			hub,
			chat,
			default_channel: default_channel.into(),
		}
	}

	/// Drive the connection until either loop exits, then unregister.
	pub async fn run(self, ws: WebSocketStream<TcpStream>) {
		let id = ClientId(self.conn_id);
		let conn_id = self.conn_id;
		let _gauge = ConnectionGaugeGuard::new();

		let outbound_rx = self.hub.register(id).await;
		let (sink, stream) = ws.split();

		let mut write_task = tokio::spawn(write_loop(sink, outbound_rx, conn_id));
		let mut read_task = tokio::spawn(read_loop(
			stream,
			Arc::clone(&self.chat),
			self.default_channel.clone(),
			conn_id,
		));

		tokio::select! {
			_ = &mut read_task => {
				// dropping the hub sender lets the write loop send Close and exit
				self.hub.unregister(id).await;
				let _ = timeout(WRITE_WAIT, &mut write_task).await;
				write_task.abort();
			}
			_ = &mut write_task => {
				read_task.abort();
			}
		}

		self.hub.unregister(id).await;
		debug!(conn_id, "connection closed");
	}
}

async fn read_loop(mut stream: WsStream, chat: Arc<dyn ChatSender>, default_channel: String, conn_id: u64) {
	loop {
		// any inbound frame (pongs included) refreshes the read deadline
		let msg = match timeout(PONG_WAIT, stream.next()).await {
			Err(_) => {
				debug!(conn_id, "read deadline exceeded; closing");
				break;
			}
			Ok(None) => break,
			Ok(Some(Err(e))) => {
				debug!(conn_id, error = %e, "read error; closing");
				break;
			}
			Ok(Some(Ok(msg))) => msg,
		};

		match msg {
			Message::Text(text) => {
				if text.len() > MAX_FRAME_BYTES {
					warn!(conn_id, len = text.len(), "frame exceeds limit; closing connection");
					break;
				}
				metrics::counter!("relay_server_frames_in_total").increment(1);
				handle_client_frame(&text, chat.as_ref(), &default_channel, conn_id).await;
			}
			Message::Binary(data) => {
				if data.len() > MAX_FRAME_BYTES {
					warn!(conn_id, len = data.len(), "frame exceeds limit; closing connection");
					break;
				}
				debug!(conn_id, len = data.len(), "ignoring binary frame");
			}
			Message::Close(_) => break,
			Message::Ping(_) | Message::Pong(_) => {}
			_ => {}
		}
	}
}

/// Decode a `{"content"}` frame and relay non-empty content into chat.
/// Malformed frames are skipped; the connection stays up.
async fn handle_client_frame(raw: &str, chat: &dyn ChatSender, default_channel: &str, conn_id: u64) {
	let cleaned = raw.replace('\n', " ");
	let cleaned = cleaned.trim();

	let parsed = match ClientMessage::parse(cleaned) {
		Ok(m) => m,
		Err(e) => {
			debug!(conn_id, error = %e, "skipping malformed client frame");
			return;
		}
	};

	if parsed.content.trim().is_empty() {
		return;
	}

	if let Err(e) = chat.send(default_channel, &parsed.content).await {
		warn!(conn_id, error = %e, "failed to relay client message to chat");
	}
}

async fn write_loop(mut sink: WsSink, mut outbound_rx: mpsc::Receiver<String>, conn_id: u64) {
	let mut ping = tokio::time::interval(PING_PERIOD);
	ping.set_missed_tick_behavior(MissedTickBehavior::Delay);
	// interval fires immediately; the first ping belongs one period out
	ping.tick().await;

	loop {
		tokio::select! {
			maybe_payload = outbound_rx.recv() => {
				let Some(mut payload) = maybe_payload else {
					// queue closed by unregister: tell the peer and stop
					let _ = timeout(WRITE_WAIT, sink.send(Message::Close(None))).await;
					break;
				};

				// coalesce whatever else is already queued into one frame
				let mut coalesced: u64 = 1;
				while let Ok(next) = outbound_rx.try_recv() {
					payload.push('\n');
					payload.push_str(&next);
					coalesced += 1;
				}

				match timeout(WRITE_WAIT, sink.send(Message::Text(payload.into()))).await {
					Ok(Ok(())) => {
						metrics::counter!("relay_server_frames_out_total").increment(coalesced);
					}
					Ok(Err(e)) => {
						debug!(conn_id, error = %e, "write error; closing");
						break;
					}
					Err(_) => {
						debug!(conn_id, "write deadline exceeded; closing");
						break;
					}
				}
			}
			_ = ping.tick() => {
				match timeout(WRITE_WAIT, sink.send(Message::Ping(Bytes::new()))).await {
					Ok(Ok(())) => {}
					_ => {
						debug!(conn_id, "ping failed; closing");
						break;
					}
				}
			}
		}
	}

	let _ = sink.close().await;
}
