#![forbid(unsafe_code)]

use std::collections::BTreeMap;

use tidemark_domain::{Seq, Topic, UserId};

use crate::server::store::SyncStore;

/// Computes authoritative unread counts from durable sequence comparison:
/// `count(seq > last_ack AND sender != user)` per topic. Never derived from
/// wall-clock heuristics.
#[derive(Clone)]
pub struct UnreadAggregator {
	store: SyncStore,
}

impl UnreadAggregator {
	pub fn new(store: SyncStore) -> Self {
		Self { store }
	}

	pub async fn unread_for(&self, user: &UserId, topic: &Topic) -> anyhow::Result<u64> {
		let after = self
			.store
			.read_position(user, topic)
			.await?
			.map(|p| p.last_ack_seq)
			.unwrap_or(Seq::ZERO);

		self.store.count_unread(topic, after, user).await
	}

	/// Full per-topic unread summary over the given membership set. The
	/// global scope is an activity feed, not a conversation, and is skipped.
	pub async fn summary(&self, user: &UserId, topics: &[Topic]) -> anyhow::Result<BTreeMap<Topic, u64>> {
		let mut counts = BTreeMap::new();
		for topic in topics {
			if topic.is_global() {
				continue;
			}
			counts.insert(topic.clone(), self.unread_for(user, topic).await?);
		}
		Ok(counts)
	}
}
