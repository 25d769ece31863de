#![forbid(unsafe_code)]

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use relay_domain::{ChatMessage, ChatUser, Event};
use relay_platform::{ChatSender, NullChatSender};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::protocol::Message;

use crate::server::client::{ClientConnection, websocket_config};
use crate::server::hub::{Hub, HubConfig};

struct RecordingChatSender {
	sent: Mutex<Vec<(String, String)>>,
}

impl RecordingChatSender {
	fn new() -> Arc<Self> {
		Arc::new(Self {
			sent: Mutex::new(Vec::new()),
		})
	}
}

#[async_trait::async_trait]
impl ChatSender for RecordingChatSender {
	async fn send(&self, channel: &str, text: &str) -> anyhow::Result<()> {
		self.sent.lock().unwrap().push((channel.to_string(), text.to_string()));
		Ok(())
	}
}

async fn spawn_server(hub: Hub, chat: Arc<dyn ChatSender>) -> SocketAddr {
	let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
	let addr = listener.local_addr().expect("addr");

	tokio::spawn(async move {
		let mut next_conn_id: u64 = 1;
		while let Ok((stream, _)) = listener.accept().await {
			let ws = match tokio_tungstenite::accept_async_with_config(stream, Some(websocket_config())).await {
				Ok(ws) => ws,
				Err(_) => continue,
			};
			let conn = ClientConnection::new(next_conn_id, hub.clone(), Arc::clone(&chat), "somechannel");
			next_conn_id += 1;
			tokio::spawn(conn.run(ws));
		}
	});

	addr
}

async fn connect(addr: SocketAddr) -> tokio_tungstenite::WebSocketStream<TcpStream> {
	let stream = TcpStream::connect(addr).await.expect("connect");
	let (ws, _resp) = tokio_tungstenite::client_async(format!("ws://{addr}/"), stream)
		.await
		.expect("handshake");
	ws
}

async fn wait_for_clients(hub: &Hub, expected: usize) {
	timeout(Duration::from_secs(2), async {
		loop {
			if hub.client_count().await == expected {
				break;
			}
			tokio::time::sleep(Duration::from_millis(5)).await;
		}
	})
	.await
	.unwrap_or_else(|_| panic!("hub never reached {expected} client(s)"));
}

fn chat_event(text: &str) -> Event {
	Event::ChatMessage(ChatMessage {
		id: "m1".to_string(),
		timestamp: Utc::now(),
		content: text.to_string(),
		is_command: false,
		emotes: Vec::new(),
		channel_name: "somechannel".to_string(),
		highlighted: false,
		me: false,
		user: ChatUser {
			id: "u1".to_string(),
			username: "viewer".to_string(),
			display_name: "Viewer".to_string(),
			..ChatUser::default()
		},
	})
}

#[tokio::test]
async fn broadcasts_reach_connected_clients_as_envelopes() {
	let hub = Hub::new(HubConfig::default());
	let addr = spawn_server(hub.clone(), Arc::new(NullChatSender)).await;

	let mut ws = connect(addr).await;
	wait_for_clients(&hub, 1).await;

	hub.broadcast(&chat_event("hello dashboards")).await;

	let msg = timeout(Duration::from_secs(2), ws.next())
		.await
		.expect("frame within timeout")
		.expect("stream open")
		.expect("frame ok");

	match msg {
		Message::Text(t) => {
			let v: serde_json::Value = serde_json::from_str(&t).expect("valid envelope");
			assert_eq!(v["type"], "message");
			assert_eq!(v["data"]["content"], "hello dashboards");
		}
		other => panic!("expected text frame, got: {other:?}"),
	}
}

#[tokio::test]
async fn client_content_is_relayed_to_chat_and_malformed_frames_are_skipped() {
	let hub = Hub::new(HubConfig::default());
	let recorder = RecordingChatSender::new();
	let addr = spawn_server(hub.clone(), recorder.clone()).await;

	let mut ws = connect(addr).await;
	wait_for_clients(&hub, 1).await;

	ws.send(Message::Text("not json".to_string().into())).await.expect("send");
	ws.send(Message::Text(r#"{"content": ""}"#.to_string().into()))
		.await
		.expect("send");
	ws.send(Message::Text(r#"{"content": "hello chat"}"#.to_string().into()))
		.await
		.expect("send");

	timeout(Duration::from_secs(2), async {
		loop {
			if !recorder.sent.lock().unwrap().is_empty() {
				break;
			}
			tokio::time::sleep(Duration::from_millis(5)).await;
		}
	})
	.await
	.expect("chat sender called");

	let sent = recorder.sent.lock().unwrap().clone();
	assert_eq!(sent, vec![("somechannel".to_string(), "hello chat".to_string())]);

	// malformed frames must not kill the connection
	assert_eq!(hub.client_count().await, 1);
}

#[tokio::test]
async fn oversized_frames_close_the_connection() {
	let hub = Hub::new(HubConfig::default());
	let addr = spawn_server(hub.clone(), Arc::new(NullChatSender)).await;

	let mut ws = connect(addr).await;
	wait_for_clients(&hub, 1).await;

	let big = "x".repeat(600);
	ws.send(Message::Text(big.into())).await.expect("send");

	// server tears the connection down; the client sees Close or EOF
	let ended = timeout(Duration::from_secs(2), async {
		loop {
			match ws.next().await {
				None | Some(Err(_)) | Some(Ok(Message::Close(_))) => break,
				Some(Ok(_)) => {}
			}
		}
	})
	.await;
	assert!(ended.is_ok(), "connection should close after oversized frame");

	wait_for_clients(&hub, 0).await;
}

#[tokio::test]
async fn oversized_binary_frames_close_the_connection() {
	let hub = Hub::new(HubConfig::default());
	let addr = spawn_server(hub.clone(), Arc::new(NullChatSender)).await;

	let mut ws = connect(addr).await;
	wait_for_clients(&hub, 1).await;

	// binary frames are ignored, but the size limit still applies
	let big = vec![0u8; 600];
	ws.send(Message::Binary(big.into())).await.expect("send");

	let ended = timeout(Duration::from_secs(2), async {
		loop {
			match ws.next().await {
				None | Some(Err(_)) | Some(Ok(Message::Close(_))) => break,
				Some(Ok(_)) => {}
			}
		}
	})
	.await;
	assert!(ended.is_ok(), "connection should close after oversized binary frame");

	wait_for_clients(&hub, 0).await;
}

#[tokio::test]
async fn disconnecting_client_is_unregistered() {
	let hub = Hub::new(HubConfig::default());
	let addr = spawn_server(hub.clone(), Arc::new(NullChatSender)).await;

	let mut ws = connect(addr).await;
	wait_for_clients(&hub, 1).await;

	ws.close(None).await.expect("close");
	wait_for_clients(&hub, 0).await;

	// broadcasting after the disconnect must not wedge or re-add the client
	hub.broadcast(&chat_event("after disconnect")).await;
	assert_eq!(hub.client_count().await, 0);
}
