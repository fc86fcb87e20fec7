#![forbid(unsafe_code)]

use std::time::Duration;

use tidemark_domain::{Message, MessageId, Seq, Topic, UserId};
use tidemark_protocol::{Event, EventEnvelope};
use tokio::time::timeout;

use crate::server::hub::{RoomHub, RoomHubConfig, RoomHubItem};

fn topic(s: &str) -> Topic {
	Topic::parse(s).expect("valid topic")
}

fn user(s: &str) -> UserId {
	UserId::new(s).expect("valid user id")
}

fn message_env(topic: &Topic, sender: &str, seq: u64, body: &str) -> EventEnvelope {
	EventEnvelope {
		topic: topic.clone(),
		seq: Seq(seq),
		server_time_unix_ms: 1_700_000_000_000 + seq as i64,
		event: Event::MessageNew {
			message: Message {
				id: MessageId::new_v4(),
				topic: topic.clone(),
				sender: user(sender),
				body: body.to_string(),
				attachments: Vec::new(),
				quoted_message_id: None,
				quoted_text: None,
				seq: Seq(seq),
				created_at_unix_ms: 1_700_000_000_000 + seq as i64,
			},
		},
	}
}

fn body_of(item: RoomHubItem) -> String {
	match item {
		RoomHubItem::Event(env) => match env.event {
			Event::MessageNew { message } => message.body,
			other => panic!("expected MessageNew, got: {other:?}"),
		},
		other => panic!("expected Event item, got: {other:?}"),
	}
}

#[tokio::test]
async fn subscribers_receive_events_for_their_room_only() {
	let hub = RoomHub::new(RoomHubConfig {
		subscriber_queue_capacity: 16,
		debug_logs: false,
	});

	let topic_a = topic("dm:a");
	let topic_b = topic("dm:b");

	let mut rx_a = hub.subscribe_room(topic_a.clone(), user("u1")).await;

	hub.publish_to_room(&topic_b, message_env(&topic_b, "u2", 1, "b-1"), None).await;

	let got_unexpected = timeout(Duration::from_millis(50), rx_a.recv()).await;
	assert!(
		got_unexpected.is_err(),
		"subscriber for topic A unexpectedly received an event for topic B"
	);

	hub.publish_to_room(&topic_a, message_env(&topic_a, "u2", 1, "a-1"), None).await;

	let item = timeout(Duration::from_millis(250), rx_a.recv())
		.await
		.expect("expected to receive within timeout")
		.expect("channel open");
	assert_eq!(body_of(item), "a-1");
}

#[tokio::test]
async fn per_topic_delivery_is_fifo() {
	let hub = RoomHub::new(RoomHubConfig {
		subscriber_queue_capacity: 16,
		debug_logs: false,
	});

	let t = topic("dm:a");
	let mut rx = hub.subscribe_room(t.clone(), user("u1")).await;

	for i in 1..=5u64 {
		hub.publish_to_room(&t, message_env(&t, "u2", i, &format!("m-{i}")), None).await;
	}

	for i in 1..=5u64 {
		let item = timeout(Duration::from_millis(250), rx.recv())
			.await
			.expect("expected event")
			.expect("channel open");
		assert_eq!(body_of(item), format!("m-{i}"));
	}
}

#[tokio::test]
async fn exclude_user_suppresses_own_subscriptions_only() {
	let hub = RoomHub::new(RoomHubConfig {
		subscriber_queue_capacity: 16,
		debug_logs: false,
	});

	let t = topic("dm:a");
	let mut rx_sender = hub.subscribe_room(t.clone(), user("u1")).await;
	let mut rx_other = hub.subscribe_room(t.clone(), user("u2")).await;

	let env = EventEnvelope {
		topic: t.clone(),
		seq: Seq::ZERO,
		server_time_unix_ms: 0,
		event: Event::TypingUpdate {
			user: user("u1"),
			is_typing: true,
		},
	};
	hub.publish_to_room(&t, env, Some(&user("u1"))).await;

	let suppressed = timeout(Duration::from_millis(50), rx_sender.recv()).await;
	assert!(suppressed.is_err(), "originating user received their own typing event");

	let item = timeout(Duration::from_millis(250), rx_other.recv())
		.await
		.expect("expected typing event")
		.expect("channel open");
	match item {
		RoomHubItem::Event(env) => assert!(matches!(env.event, Event::TypingUpdate { is_typing: true, .. })),
		other => panic!("expected Event item, got: {other:?}"),
	}
}

#[tokio::test]
async fn message_events_reach_the_senders_own_subscriptions() {
	let hub = RoomHub::new(RoomHubConfig {
		subscriber_queue_capacity: 16,
		debug_logs: false,
	});

	let t = topic("dm:a");
	let mut rx_sender = hub.subscribe_room(t.clone(), user("u1")).await;

	hub.publish_to_room(&t, message_env(&t, "u1", 1, "mine"), None).await;

	let item = timeout(Duration::from_millis(250), rx_sender.recv())
		.await
		.expect("expected own message event")
		.expect("channel open");
	assert_eq!(body_of(item), "mine");
}

#[tokio::test]
async fn bounded_queue_drops_and_emits_lagged_marker() {
	let hub = RoomHub::new(RoomHubConfig {
		subscriber_queue_capacity: 2,
		debug_logs: false,
	});

	let t = topic("dm:a");
	let mut rx = hub.subscribe_room(t.clone(), user("u1")).await;

	hub.publish_to_room(&t, message_env(&t, "u2", 1, "m-1"), None).await;
	hub.publish_to_room(&t, message_env(&t, "u2", 2, "m-2"), None).await;
	// Queue is full; this one is dropped and recorded as pending lag.
	hub.publish_to_room(&t, message_env(&t, "u2", 3, "m-3"), None).await;

	let first = timeout(Duration::from_millis(250), rx.recv())
		.await
		.expect("expected first event")
		.expect("channel open");
	assert_eq!(body_of(first), "m-1");

	let second = timeout(Duration::from_millis(250), rx.recv())
		.await
		.expect("expected second event")
		.expect("channel open");
	assert_eq!(body_of(second), "m-2");

	// The next publish finds spare capacity and flushes the lag marker.
	hub.publish_to_room(&t, message_env(&t, "u2", 4, "m-4"), None).await;

	let fourth = timeout(Duration::from_millis(250), rx.recv())
		.await
		.expect("expected fourth event")
		.expect("channel open");
	assert_eq!(body_of(fourth), "m-4");

	let marker = timeout(Duration::from_millis(250), rx.recv())
		.await
		.expect("expected lag marker")
		.expect("channel open");
	match marker {
		RoomHubItem::Lagged { dropped } => assert!(dropped >= 1, "expected dropped >= 1, got {dropped}"),
		other => panic!("expected Lagged marker, got: {other:?}"),
	}
}

#[tokio::test]
async fn dropped_subscribers_are_pruned() {
	let hub = RoomHub::new(RoomHubConfig {
		subscriber_queue_capacity: 16,
		debug_logs: false,
	});

	let t = topic("dm:a");

	{
		let _rx = hub.subscribe_room(t.clone(), user("u1")).await;
	}

	hub.prune_room(&t).await;
	hub.publish_to_room(&t, message_env(&t, "u2", 1, "m-1"), None).await;

	let counts = hub.room_subscriber_counts().await;
	assert_eq!(counts.get(&t).copied().unwrap_or(0), 0);
}
