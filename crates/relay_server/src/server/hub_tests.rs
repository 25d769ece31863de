#![forbid(unsafe_code)]

use std::time::Duration;

use chrono::Utc;
use relay_domain::{ChatMessage, ChatUser, ClearChat, Event};
use tokio::time::timeout;

use crate::server::hub::{ClientId, Hub, HubConfig};

fn hub(capacity: usize) -> Hub {
	Hub::new(HubConfig {
		client_queue_capacity: capacity,
		debug_logs: false,
	})
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

fn content_of(payload: &str) -> String {
	let v: serde_json::Value = serde_json::from_str(payload).expect("valid envelope");
	assert_eq!(v["type"], "message");
	v["data"]["content"].as_str().expect("content is a string").to_string()
}

#[tokio::test]
async fn delivers_in_broadcast_order_per_client() {
	let hub = hub(16);
	let mut rx = hub.register(ClientId(1)).await;

	hub.broadcast(&chat_event("one")).await;
	hub.broadcast(&chat_event("two")).await;
	hub.broadcast(&chat_event("three")).await;

	for expected in ["one", "two", "three"] {
		let payload = timeout(Duration::from_millis(250), rx.recv())
			.await
			.expect("expected payload within timeout")
			.expect("queue open");
		assert_eq!(content_of(&payload), expected);
	}
}

#[tokio::test]
async fn all_clients_receive_identical_bytes() {
	let hub = hub(16);
	let mut rx1 = hub.register(ClientId(1)).await;
	let mut rx2 = hub.register(ClientId(2)).await;
	let mut rx3 = hub.register(ClientId(3)).await;

	hub.broadcast(&chat_event("same for everyone")).await;

	let p1 = timeout(Duration::from_millis(250), rx1.recv()).await.unwrap().unwrap();
	let p2 = timeout(Duration::from_millis(250), rx2.recv()).await.unwrap().unwrap();
	let p3 = timeout(Duration::from_millis(250), rx3.recv()).await.unwrap().unwrap();

	assert_eq!(p1, p2);
	assert_eq!(p2, p3);
}

#[tokio::test]
async fn broadcast_with_no_clients_is_a_noop() {
	let hub = hub(16);
	hub.broadcast(&chat_event("into the void")).await;
	assert_eq!(hub.client_count().await, 0);
}

#[tokio::test]
async fn unregister_is_idempotent() {
	let hub = hub(16);
	let _rx = hub.register(ClientId(7)).await;
	assert_eq!(hub.client_count().await, 1);

	hub.unregister(ClientId(7)).await;
	hub.unregister(ClientId(7)).await;
	assert_eq!(hub.client_count().await, 0);
}

#[tokio::test]
async fn unregister_closes_the_client_queue() {
	let hub = hub(16);
	let mut rx = hub.register(ClientId(7)).await;

	hub.unregister(ClientId(7)).await;

	let got = timeout(Duration::from_millis(250), rx.recv())
		.await
		.expect("recv should resolve once the sender is dropped");
	assert!(got.is_none(), "queue must be closed after unregister");
}

#[tokio::test]
async fn full_queue_drops_for_that_client_only() {
	let hub = hub(1);
	let mut slow = hub.register(ClientId(1)).await;
	let mut fast = hub.register(ClientId(2)).await;

	hub.broadcast(&chat_event("first")).await;

	// the fast client drains its queue, the slow one does not
	let fast_first = timeout(Duration::from_millis(250), fast.recv()).await.unwrap().unwrap();
	assert_eq!(content_of(&fast_first), "first");

	// slow client's queue (capacity 1) is still full; this one is dropped for it
	hub.broadcast(&chat_event("second")).await;

	let fast_second = timeout(Duration::from_millis(250), fast.recv()).await.unwrap().unwrap();
	assert_eq!(content_of(&fast_second), "second");

	let slow_first = timeout(Duration::from_millis(250), slow.recv()).await.unwrap().unwrap();
	assert_eq!(content_of(&slow_first), "first");

	assert_eq!(hub.dropped_total().await, 1);

	// the slow client stays registered and receives later events
	hub.broadcast(&chat_event("third")).await;
	let slow_third = timeout(Duration::from_millis(250), slow.recv()).await.unwrap().unwrap();
	assert_eq!(content_of(&slow_third), "third");
	assert_eq!(hub.client_count().await, 2);
}

#[tokio::test]
async fn closed_clients_are_pruned_during_broadcast() {
	let hub = hub(16);
	let rx = hub.register(ClientId(1)).await;
	drop(rx);

	hub.broadcast(&Event::ClearChat(ClearChat {
		username: "viewer".to_string(),
	}))
	.await;

	assert_eq!(hub.client_count().await, 0);
}
