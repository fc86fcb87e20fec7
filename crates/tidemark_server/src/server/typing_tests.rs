#![forbid(unsafe_code)]

use std::time::Duration;

use tidemark_domain::{Topic, UserId};

use crate::server::typing::TypingTracker;

fn topic(s: &str) -> Topic {
	Topic::parse(s).expect("valid topic")
}

fn user(s: &str) -> UserId {
	UserId::new(s).expect("valid user id")
}

#[tokio::test]
async fn stop_signal_clears_the_entry() {
	let tracker = TypingTracker::new(Duration::from_secs(3));
	let t = topic("dm:a");

	tracker.signal(t.clone(), user("u1"), true).await;
	assert_eq!(tracker.typers(&t).await, vec![user("u1")]);

	tracker.signal(t.clone(), user("u1"), false).await;
	assert!(tracker.typers(&t).await.is_empty());
}

#[tokio::test]
async fn entries_expire_unconditionally_after_the_ttl() {
	let tracker = TypingTracker::new(Duration::from_millis(40));
	let t = topic("dm:a");

	tracker.signal(t.clone(), user("u1"), true).await;
	assert!(tracker.sweep_expired().await.is_empty());

	tokio::time::sleep(Duration::from_millis(80)).await;

	let expired = tracker.sweep_expired().await;
	assert_eq!(expired, vec![(t.clone(), user("u1"))]);
	assert!(tracker.typers(&t).await.is_empty());
}

#[tokio::test]
async fn refresh_signal_extends_the_ttl() {
	let tracker = TypingTracker::new(Duration::from_millis(60));
	let t = topic("dm:a");

	tracker.signal(t.clone(), user("u1"), true).await;
	tokio::time::sleep(Duration::from_millis(40)).await;
	tracker.signal(t.clone(), user("u1"), true).await;
	tokio::time::sleep(Duration::from_millis(40)).await;

	assert!(tracker.sweep_expired().await.is_empty());
	assert_eq!(tracker.typers(&t).await, vec![user("u1")]);
}

#[tokio::test]
async fn typers_is_scoped_per_topic() {
	let tracker = TypingTracker::new(Duration::from_secs(3));

	tracker.signal(topic("dm:a"), user("u1"), true).await;
	tracker.signal(topic("dm:b"), user("u2"), true).await;

	assert_eq!(tracker.typers(&topic("dm:a")).await, vec![user("u1")]);
	assert_eq!(tracker.typers(&topic("dm:b")).await, vec![user("u2")]);
}

#[tokio::test]
async fn clear_user_returns_the_topics_they_were_typing_in() {
	let tracker = TypingTracker::new(Duration::from_secs(3));

	tracker.signal(topic("dm:a"), user("u1"), true).await;
	tracker.signal(topic("dm:b"), user("u1"), true).await;
	tracker.signal(topic("dm:a"), user("u2"), true).await;

	let mut cleared = tracker.clear_user(&user("u1")).await;
	cleared.sort_by_key(|t| t.to_string());
	assert_eq!(cleared, vec![topic("dm:a"), topic("dm:b")]);

	assert_eq!(tracker.typers(&topic("dm:a")).await, vec![user("u2")]);
	assert!(tracker.typers(&topic("dm:b")).await.is_empty());
}
