#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::sync::Arc;

use tidemark_domain::{Topic, UserId};
use tidemark_protocol::EventEnvelope;
use tokio::sync::{Mutex, mpsc};
use tracing::debug;

/// Per-topic hub that fans out events to subscribed connections.
///
/// Publishing happens under the room lock and each subscriber is a bounded
/// FIFO queue, so a given subscriber observes a topic's events in publish
/// order.
#[derive(Debug, Clone)]
pub struct RoomHub {
	inner: Arc<Mutex<Inner>>,
	cfg: RoomHubConfig,
}

/// Configuration for `RoomHub`.
#[derive(Debug, Clone)]
pub struct RoomHubConfig {
	/// Maximum number of queued events per subscriber.
	pub subscriber_queue_capacity: usize,

	pub debug_logs: bool,
}

impl Default for RoomHubConfig {
	fn default() -> Self {
		Self {
			subscriber_queue_capacity: 1024,
			debug_logs: false,
		}
	}
}

/// Items emitted on a subscriber stream.
#[derive(Debug, Clone)]
pub enum RoomHubItem {
	Event(Box<EventEnvelope>),

	/// Indicates the subscriber is lagging and events were dropped.
	Lagged {
		dropped: u64,
	},
}

impl RoomHub {
	pub fn new(cfg: RoomHubConfig) -> Self {
		Self {
			inner: Arc::new(Mutex::new(Inner::default())),
			cfg,
		}
	}

	/// Subscribe a connection to a topic's room. The subscriber's user
	/// identity is recorded so publishes can suppress self-echo.
	pub async fn subscribe_room(&self, topic: Topic, user: UserId) -> mpsc::Receiver<RoomHubItem> {
		let (tx, rx) = mpsc::channel(self.cfg.subscriber_queue_capacity);

		let mut inner = self.inner.lock().await;
		let entry = inner.rooms.entry(topic.clone()).or_default();

		prune_closed_subscribers(entry);

		entry.subscribers.push(Subscriber {
			user,
			tx,
			pending_lag: 0,
		});

		if self.cfg.debug_logs {
			debug!(topic = %topic, subs = entry.subscribers.len(), "room hub: subscribed");
		}

		rx
	}

	/// Drop closed subscribers of a room; removes the room when empty.
	pub async fn prune_room(&self, topic: &Topic) {
		let mut inner = self.inner.lock().await;
		if let Some(entry) = inner.rooms.get_mut(topic) {
			prune_closed_subscribers(entry);

			if entry.subscribers.is_empty() {
				inner.rooms.remove(topic);
			}
		}
	}

	/// Publish an event to every subscriber of a room, skipping subscribers
	/// registered under `exclude_user` (typing self-echo suppression).
	pub async fn publish_to_room(&self, topic: &Topic, env: EventEnvelope, exclude_user: Option<&UserId>) {
		let mut inner = self.inner.lock().await;
		let Some(entry) = inner.rooms.get_mut(topic) else {
			return;
		};

		prune_closed_subscribers(entry);

		if entry.subscribers.is_empty() {
			inner.rooms.remove(topic);
			return;
		}

		let item = RoomHubItem::Event(Box::new(env));
		let mut dropped_total: u64 = 0;

		for sub in entry.subscribers.iter_mut() {
			if exclude_user.is_some_and(|user| *user == sub.user) {
				continue;
			}

			match sub.tx.try_send(item.clone()) {
				Ok(()) => {
					if sub.pending_lag > 0
						&& sub
							.tx
							.try_send(RoomHubItem::Lagged {
								dropped: sub.pending_lag,
							})
							.is_ok()
					{
						sub.pending_lag = 0;
					}
				}
				Err(mpsc::error::TrySendError::Full(_)) => {
					dropped_total += 1;
					sub.pending_lag = sub.pending_lag.saturating_add(1);
				}
				Err(mpsc::error::TrySendError::Closed(_)) => {}
			}
		}

		prune_closed_subscribers(entry);

		if entry.subscribers.is_empty() {
			inner.rooms.remove(topic);
		}

		if self.cfg.debug_logs && dropped_total > 0 {
			debug!(
				topic = %topic,
				dropped = dropped_total,
				"room hub: dropped due to full subscriber queues"
			);
		}
	}

	/// Get a snapshot of live subscriber counts per room.
	pub async fn room_subscriber_counts(&self) -> HashMap<Topic, usize> {
		let inner = self.inner.lock().await;
		inner
			.rooms
			.iter()
			.map(|(k, v)| (k.clone(), v.subscribers.iter().filter(|s| !s.tx.is_closed()).count()))
			.collect()
	}
}

#[derive(Debug, Default)]
struct Inner {
	rooms: HashMap<Topic, RoomEntry>,
}

#[derive(Debug, Default)]
struct RoomEntry {
	subscribers: Vec<Subscriber>,
}

#[derive(Debug)]
struct Subscriber {
	user: UserId,
	tx: mpsc::Sender<RoomHubItem>,

	/// Events dropped while this subscriber's queue was full; surfaced as a
	/// `Lagged` marker once the queue drains.
	pending_lag: u64,
}

fn prune_closed_subscribers(entry: &mut RoomEntry) {
	entry.subscribers.retain(|s| !s.tx.is_closed());
}
