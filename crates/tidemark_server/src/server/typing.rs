#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tidemark_domain::{Topic, UserId};
use tokio::sync::Mutex;

use crate::server::router::BroadcastRouter;

/// How long a typing signal stays live without a refresh.
pub const TYPING_TTL: Duration = Duration::from_secs(3);

/// Ephemeral typing state keyed by (topic, user). Entries expire
/// unconditionally after the TTL; an explicit stop signal is only a latency
/// optimization.
#[derive(Debug, Clone)]
pub struct TypingTracker {
	inner: Arc<Mutex<HashMap<(Topic, UserId), Instant>>>,
	ttl: Duration,
}

impl TypingTracker {
	pub fn new(ttl: Duration) -> Self {
		Self {
			inner: Arc::new(Mutex::new(HashMap::new())),
			ttl,
		}
	}

	/// Record a typing signal. A `true` signal starts or refreshes the TTL;
	/// a `false` signal clears the entry immediately.
	pub async fn signal(&self, topic: Topic, user: UserId, is_typing: bool) {
		let mut map = self.inner.lock().await;
		if is_typing {
			map.insert((topic, user), Instant::now());
		} else {
			map.remove(&(topic, user));
		}
	}

	/// Users currently typing in a topic. Sweeps expired entries first.
	pub async fn typers(&self, topic: &Topic) -> Vec<UserId> {
		let now = Instant::now();
		let mut map = self.inner.lock().await;
		map.retain(|_, last| now.duration_since(*last) < self.ttl);
		map.keys()
			.filter(|(t, _)| t == topic)
			.map(|(_, user)| user.clone())
			.collect()
	}

	/// Remove and return entries older than the TTL.
	pub async fn sweep_expired(&self) -> Vec<(Topic, UserId)> {
		let now = Instant::now();
		let mut map = self.inner.lock().await;

		let expired: Vec<(Topic, UserId)> = map
			.iter()
			.filter(|(_, last)| now.duration_since(**last) >= self.ttl)
			.map(|(key, _)| key.clone())
			.collect();

		for key in &expired {
			map.remove(key);
		}

		expired
	}

	/// Clear every entry for a user (disconnect cleanup). Returns the topics
	/// the user was typing in so stop events can be broadcast.
	pub async fn clear_user(&self, user: &UserId) -> Vec<Topic> {
		let mut map = self.inner.lock().await;

		let topics: Vec<Topic> = map
			.keys()
			.filter(|(_, u)| u == user)
			.map(|(topic, _)| topic.clone())
			.collect();

		for topic in &topics {
			map.remove(&(topic.clone(), user.clone()));
		}

		topics
	}
}

impl Default for TypingTracker {
	fn default() -> Self {
		Self::new(TYPING_TTL)
	}
}

/// Background sweeper that expires stale typing entries and broadcasts the
/// corresponding stop events.
pub fn spawn_typing_sweeper(tracker: TypingTracker, router: BroadcastRouter) -> tokio::task::JoinHandle<()> {
	tokio::spawn(async move {
		let mut tick = tokio::time::interval(Duration::from_millis(500));
		loop {
			tick.tick().await;
			for (topic, user) in tracker.sweep_expired().await {
				router.route_typing(topic, user, false).await;
			}
		}
	})
}
