#![forbid(unsafe_code)]

mod classify;
pub(crate) mod wire;

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::Context as _;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use relay_domain::Event;
use tokio::sync::{mpsc, watch};
use tokio::time::{Instant, sleep};
use tokio_tungstenite::tungstenite::protocol::Message;
use tracing::{debug, info, warn};
use url::Url;

use crate::scheduler::TaskScheduler;
use crate::{CredentialProvider, EventTx, PointsAwarder, new_session_id};
use classify::{Award, Classified};
use wire::{PubSubRequest, PubSubResponse, TYPE_MESSAGE, TYPE_PONG, TYPE_RECONNECT, TYPE_RESPONSE};

pub(crate) type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;
pub type PubSubWs = tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;
pub type WsConnector = Arc<dyn Fn(Url) -> BoxFuture<'static, anyhow::Result<PubSubWs>> + Send + Sync>;

const HEARTBEAT_TASK: &str = "pubsub:ping";

/// Upstream subscriber configuration.
#[derive(Clone)]
pub struct PubSubConfig {
	/// Numeric channel id the topics are scoped to.
	pub channel_id: String,
	pub ws_url: String,
	/// How often to re-poll the credential provider while no token exists.
	pub credential_poll_interval: Duration,
	/// Application-level PING cadence.
	pub heartbeat_interval: Duration,
	/// A PONG arriving later than this after the PING counts as stale.
	pub pong_grace: Duration,
	/// How often the supervisor checks whether both link tasks have exited.
	pub supervisor_poll_interval: Duration,
	pub ws_connector: Option<WsConnector>,
}

impl PubSubConfig {
	pub fn new(channel_id: impl Into<String>) -> Self {
		Self {
			channel_id: channel_id.into(),
			ws_url: "wss://pubsub-edge.twitch.tv".to_string(),
			credential_poll_interval: Duration::from_secs(30),
			heartbeat_interval: Duration::from_secs(270),
			pong_grace: Duration::from_secs(10),
			supervisor_poll_interval: Duration::from_secs(5),
			ws_connector: None,
		}
	}
}

/// Lifecycle of one upstream connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
	Idle,
	AwaitingCredentials,
	Connecting,
	Subscribing,
	Listening,
	Closing,
}

/// Flags shared between the reader task, writer task and supervisor.
#[derive(Default)]
struct LinkState {
	reader_closed: AtomicBool,
	writer_closed: AtomicBool,
	last_ping: parking_lot::Mutex<Option<Instant>>,
}

impl LinkState {
	fn both_closed(&self) -> bool {
		self.reader_closed.load(Ordering::Relaxed) && self.writer_closed.load(Ordering::Relaxed)
	}

	fn record_ping(&self) {
		*self.last_ping.lock() = Some(Instant::now());
	}

	fn pong_is_stale(&self, grace: Duration) -> bool {
		self.last_ping.lock().is_some_and(|sent| sent.elapsed() > grace)
	}
}

enum CycleEnd {
	Reconnect,
	Shutdown,
}

#[derive(Debug, PartialEq, Eq)]
enum Flow {
	Continue,
	Close,
}

/// Resilient upstream subscriber.
///
/// Runs connection cycles until the event receiver is dropped: wait for
/// credentials, connect, LISTEN, then relay topic messages while a scheduled
/// heartbeat pings the upstream. When the link dies (reconnect request, stale
/// pong, read/write error) the whole connection is torn down and rebuilt.
pub struct PubSubSubscriber {
	cfg: PubSubConfig,
	credentials: Arc<dyn CredentialProvider>,
	awarder: Arc<dyn PointsAwarder>,
	scheduler: TaskScheduler,
	state_tx: watch::Sender<ConnectionState>,
}

impl PubSubSubscriber {
	pub fn new(
		cfg: PubSubConfig,
		credentials: Arc<dyn CredentialProvider>,
		awarder: Arc<dyn PointsAwarder>,
		scheduler: TaskScheduler,
	) -> Self {
		let (state_tx, _) = watch::channel(ConnectionState::Idle);
		Self {
			cfg,
			credentials,
			awarder,
			scheduler,
			state_tx,
		}
	}

	/// Observe connection state transitions (readiness, tests).
	pub fn state(&self) -> watch::Receiver<ConnectionState> {
		self.state_tx.subscribe()
	}

	fn set_state(&self, state: ConnectionState) {
		debug!(?state, "pubsub state");
		let _ = self.state_tx.send(state);
	}

	fn ws_connector(&self) -> WsConnector {
		if let Some(c) = &self.cfg.ws_connector {
			return c.clone();
		}

		Arc::new(|url: Url| {
			Box::pin(async move {
				let (ws, _resp) = tokio_tungstenite::connect_async(url.as_str())
					.await
					.context("connect_async to pubsub ws")?;
				Ok(ws)
			}) as BoxFuture<'static, anyhow::Result<PubSubWs>>
		})
	}

	/// Run until the event receiver is dropped. The very first connect failure
	/// is fatal; once a connection has been established, later cycles retry.
	pub async fn run(self, events_tx: EventTx) -> anyhow::Result<()> {
		let session_id = new_session_id();
		info!(session_id = %session_id, channel_id = %self.cfg.channel_id, "pubsub subscriber starting");

		let mut first_cycle = true;
		loop {
			match self.run_cycle(&events_tx).await {
				Ok(CycleEnd::Shutdown) => {
					self.set_state(ConnectionState::Idle);
					info!("pubsub subscriber exiting (event channel closed)");
					return Ok(());
				}
				Ok(CycleEnd::Reconnect) => {
					metrics::counter!("relay_pubsub_reconnects_total").increment(1);
					info!("pubsub connection ended; starting a fresh cycle");
				}
				Err(e) if first_cycle => {
					self.set_state(ConnectionState::Idle);
					return Err(e.context("pubsub first connect"));
				}
				Err(e) => {
					warn!(error = %e, "pubsub cycle failed; retrying");
					sleep(self.cfg.supervisor_poll_interval).await;
				}
			}
			first_cycle = false;
			self.set_state(ConnectionState::Idle);
		}
	}

	async fn run_cycle(&self, events_tx: &EventTx) -> anyhow::Result<CycleEnd> {
		self.set_state(ConnectionState::AwaitingCredentials);
		let token = loop {
			if events_tx.is_closed() {
				return Ok(CycleEnd::Shutdown);
			}
			match self.credentials.access_token().await {
				Some(t) if !t.expose().trim().is_empty() => break t,
				_ => {
					debug!("waiting for upstream access token");
					sleep(self.cfg.credential_poll_interval).await;
				}
			}
		};

		self.set_state(ConnectionState::Connecting);
		let url = Url::parse(&self.cfg.ws_url).context("parse pubsub ws url")?;
		let ws = (self.ws_connector())(url).await.context("connect pubsub ws")?;
		let (sink, stream) = ws.split();

		let link = Arc::new(LinkState::default());
		let (out_tx, out_rx) = mpsc::channel::<PubSubRequest>(16);
		let (close_tx, close_rx) = watch::channel(false);

		self.set_state(ConnectionState::Subscribing);
		let listen = PubSubRequest::listen(wire::topics_for_channel(&self.cfg.channel_id), &token);
		out_tx
			.send(listen)
			.await
			.map_err(|_| anyhow::anyhow!("writer queue closed before LISTEN"))?;

		let writer = tokio::spawn(write_loop(
			sink,
			out_rx,
			close_tx.clone(),
			close_rx.clone(),
			Arc::clone(&link),
		));
		let reader = tokio::spawn(read_loop(
			stream,
			Arc::clone(&link),
			events_tx.clone(),
			Arc::clone(&self.awarder),
			close_tx.clone(),
			close_rx,
			self.cfg.pong_grace,
		));

		// replaces the previous cycle's heartbeat under the same name
		{
			let link = Arc::clone(&link);
			let out_tx = out_tx.clone();
			self.scheduler
				.schedule(HEARTBEAT_TASK, self.cfg.heartbeat_interval, move || {
					let link = Arc::clone(&link);
					let out_tx = out_tx.clone();
					async move {
						link.record_ping();
						if out_tx.try_send(PubSubRequest::ping()).is_err() {
							debug!("heartbeat skipped; writer queue unavailable");
						}
					}
				});
		}

		self.set_state(ConnectionState::Listening);
		info!(channel_id = %self.cfg.channel_id, "pubsub listening");

		let end = loop {
			sleep(self.cfg.supervisor_poll_interval).await;

			if link.both_closed() {
				break CycleEnd::Reconnect;
			}
			if events_tx.is_closed() {
				break CycleEnd::Shutdown;
			}
		};

		self.set_state(ConnectionState::Closing);
		self.scheduler.cancel(HEARTBEAT_TASK);
		let _ = close_tx.send(true);
		drop(out_tx);
		let _ = writer.await;
		let _ = reader.await;

		Ok(end)
	}
}

async fn write_loop(
	mut sink: SplitSink<PubSubWs, Message>,
	mut out_rx: mpsc::Receiver<PubSubRequest>,
	close_tx: watch::Sender<bool>,
	mut close_rx: watch::Receiver<bool>,
	link: Arc<LinkState>,
) {
	loop {
		tokio::select! {
			changed = close_rx.changed() => {
				if changed.is_err() || *close_rx.borrow() {
					let _ = sink.send(Message::Close(None)).await;
					break;
				}
			}
			req = out_rx.recv() => {
				let Some(req) = req else {
					let _ = sink.send(Message::Close(None)).await;
					break;
				};
				let json = match serde_json::to_string(&req) {
					Ok(j) => j,
					Err(e) => {
						warn!(error = %e, "failed to encode pubsub request");
						continue;
					}
				};
				if let Err(e) = sink.send(Message::Text(json.into())).await {
					warn!(error = %e, "pubsub write error");
					break;
				}
			}
		}
	}

	link.writer_closed.store(true, Ordering::Relaxed);
	let _ = close_tx.send(true);
	debug!("pubsub writer exited");
}

async fn read_loop(
	mut stream: SplitStream<PubSubWs>,
	link: Arc<LinkState>,
	events_tx: EventTx,
	awarder: Arc<dyn PointsAwarder>,
	close_tx: watch::Sender<bool>,
	mut close_rx: watch::Receiver<bool>,
	pong_grace: Duration,
) {
	loop {
		tokio::select! {
			changed = close_rx.changed() => {
				if changed.is_err() || *close_rx.borrow() {
					break;
				}
			}
			msg = stream.next() => {
				let Some(msg) = msg else {
					debug!("pubsub stream ended");
					break;
				};
				let msg = match msg {
					Ok(m) => m,
					Err(e) => {
						warn!(error = %e, "pubsub read error");
						break;
					}
				};

				match msg {
					Message::Text(t) => {
						if handle_text(&t, &link, &events_tx, &awarder, pong_grace) == Flow::Close {
							break;
						}
					}
					Message::Close(frame) => {
						debug!(?frame, "pubsub close frame");
						break;
					}
					Message::Ping(_) | Message::Pong(_) => {}
					_ => {}
				}
			}
		}
	}

	link.reader_closed.store(true, Ordering::Relaxed);
	// drag the writer down with us so the supervisor sees both flags
	let _ = close_tx.send(true);
	debug!("pubsub reader exited");
}

fn handle_text(raw: &str, link: &LinkState, events_tx: &EventTx, awarder: &Arc<dyn PointsAwarder>, pong_grace: Duration) -> Flow {
	let resp: PubSubResponse = match serde_json::from_str(raw) {
		Ok(r) => r,
		Err(e) => {
			debug!(error = %e, "undecodable pubsub frame");
			return Flow::Continue;
		}
	};

	if !resp.error.is_empty() {
		warn!(kind = %resp.kind, error = %resp.error, "pubsub error frame");
		return Flow::Continue;
	}

	match resp.kind.as_str() {
		TYPE_RESPONSE => {
			debug!("pubsub LISTEN acknowledged");
			Flow::Continue
		}
		TYPE_RECONNECT => {
			info!("upstream requested reconnect");
			Flow::Close
		}
		TYPE_PONG => {
			if link.pong_is_stale(pong_grace) {
				warn!("stale pong; closing pubsub connection");
				Flow::Close
			} else {
				Flow::Continue
			}
		}
		TYPE_MESSAGE => {
			dispatch_message(&resp.data.topic, &resp.data.message, events_tx, awarder);
			Flow::Continue
		}
		other => {
			debug!(kind = other, "ignoring pubsub frame");
			Flow::Continue
		}
	}
}

fn dispatch_message(topic: &str, raw: &str, events_tx: &EventTx, awarder: &Arc<dyn PointsAwarder>) {
	match classify::classify(topic, raw) {
		Err(e) => warn!(topic, error = %e, "dropping undecodable topic message"),
		Ok(Classified::Ignore) => debug!(topic, "ignoring topic message"),
		Ok(Classified::Forward { event, award }) => {
			if let Some(award) = award {
				spawn_awards(Arc::clone(awarder), vec![award]);
			}
			forward_event(event, events_tx);
		}
		Ok(Classified::AwardOnly { awards }) => spawn_awards(Arc::clone(awarder), awards),
	}
}

fn forward_event(event: Event, events_tx: &EventTx) {
	match events_tx.try_send(event) {
		Ok(()) => {
			metrics::counter!("relay_pubsub_events_total").increment(1);
		}
		Err(mpsc::error::TrySendError::Full(_)) => {
			metrics::counter!("relay_pubsub_events_dropped_total").increment(1);
			warn!("event channel full; dropping upstream event");
		}
		Err(mpsc::error::TrySendError::Closed(_)) => {
			debug!("event channel closed; dropping upstream event");
		}
	}
}

/// One task per award batch keeps the batch order (gifter before recipient).
fn spawn_awards(awarder: Arc<dyn PointsAwarder>, awards: Vec<Award>) {
	let awards: Vec<Award> = awards.into_iter().filter(|a| !a.username.trim().is_empty()).collect();
	if awards.is_empty() {
		return;
	}

	tokio::spawn(async move {
		for award in awards {
			if let Err(e) = awarder.award(&award.username, award.amount).await {
				warn!(username = %award.username, amount = award.amount, error = %e, "failed to award points");
			}
		}
	});
}
