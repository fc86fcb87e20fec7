#![forbid(unsafe_code)]

//! Client-side reconciliation between optimistic local updates and
//! authoritative server state.
//!
//! Local actions (sending, marking read) adjust the view immediately and
//! put the affected topic into a pending phase. The next authoritative
//! summary replaces the optimistic values outright; pending values are
//! never merged into server counts, which is what keeps badges from
//! double-counting a message that was bumped locally and then reported by
//! the server as well.

use std::collections::BTreeMap;

use tidemark_domain::{Message, Seq, Topic, UserId};
use tracing::debug;

/// Whether a topic's view reflects confirmed server state or carries
/// unconfirmed local adjustments.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TopicPhase {
	/// The view matches the last authoritative summary.
	Clean,
	/// Local adjustments were applied and await the next authoritative
	/// refresh. A failed refresh leaves the topic here; it never falls
	/// back to zeroed state.
	OptimisticPending,
}

/// Per-topic view state.
#[derive(Debug, Clone)]
pub struct TopicView {
	pub unread: u64,
	pub latest_seq: Seq,
	pub phase: TopicPhase,
}

impl TopicView {
	fn clean() -> Self {
		Self {
			unread: 0,
			latest_seq: Seq::ZERO,
			phase: TopicPhase::Clean,
		}
	}
}

/// Reconciliation model for one user's session.
///
/// All mutations are synchronous; the caller feeds in wire events and
/// authoritative summaries as they arrive.
#[derive(Debug)]
pub struct SyncModel {
	self_user: UserId,
	active_topic: Option<Topic>,
	topics: BTreeMap<Topic, TopicView>,
}

impl SyncModel {
	pub fn new(self_user: UserId) -> Self {
		Self {
			self_user,
			active_topic: None,
			topics: BTreeMap::new(),
		}
	}

	/// The topic the user is currently looking at. Messages arriving in
	/// the active topic are considered seen and never bump its badge.
	pub fn set_active_topic(&mut self, topic: Option<Topic>) {
		self.active_topic = topic;
	}

	pub fn view(&self, topic: &Topic) -> Option<&TopicView> {
		self.topics.get(topic)
	}

	pub fn unread(&self, topic: &Topic) -> u64 {
		self.topics.get(topic).map(|v| v.unread).unwrap_or(0)
	}

	pub fn phase(&self, topic: &Topic) -> TopicPhase {
		self.topics.get(topic).map(|v| v.phase).unwrap_or(TopicPhase::Clean)
	}

	/// Total badge across all tracked topics.
	pub fn total_unread(&self) -> u64 {
		self.topics.values().map(|v| v.unread).sum()
	}

	/// A message of ours was sent (optimistically or confirmed). The
	/// topic becomes pending but its unread count never advances for own
	/// messages.
	pub fn note_local_send(&mut self, topic: &Topic) {
		let view = self.topics.entry(topic.clone()).or_insert_with(TopicView::clean);
		view.phase = TopicPhase::OptimisticPending;
	}

	/// A `message:new` event arrived on the wire.
	pub fn apply_remote_message(&mut self, message: &Message) {
		let own = message.sender == self.self_user;
		let active = self.active_topic.as_ref() == Some(&message.topic);

		let view = self.topics.entry(message.topic.clone()).or_insert_with(TopicView::clean);
		if message.seq > view.latest_seq {
			view.latest_seq = message.seq;
		}

		if own || active {
			return;
		}

		view.unread += 1;
		view.phase = TopicPhase::OptimisticPending;
	}

	/// The user acknowledged everything in a topic. The badge clears
	/// immediately; the authoritative summary after the server applies
	/// the mark confirms (or corrects) it.
	pub fn note_local_mark_read(&mut self, topic: &Topic) {
		let view = self.topics.entry(topic.clone()).or_insert_with(TopicView::clean);
		view.unread = 0;
		view.phase = TopicPhase::OptimisticPending;
	}

	/// Apply an authoritative unread summary. Counts are replaced, never
	/// merged: topics in the summary take its values, topics we track
	/// that the summary omits drop to zero. Every touched topic returns
	/// to `Clean`.
	pub fn apply_unread_summary(&mut self, counts: &BTreeMap<Topic, u64>) {
		for view in self.topics.values_mut() {
			view.unread = 0;
			view.phase = TopicPhase::Clean;
		}

		for (topic, unread) in counts {
			let view = self.topics.entry(topic.clone()).or_insert_with(TopicView::clean);
			view.unread = *unread;
			view.phase = TopicPhase::Clean;
		}

		debug!(topics = counts.len(), "applied authoritative unread summary");
	}

	/// An authoritative refresh failed. Optimistic state is retained as
	/// the best available approximation; the caller retries. Returns
	/// whether any topic still awaits confirmation.
	pub fn note_refresh_failed(&mut self) -> bool {
		self.topics.values().any(|v| v.phase == TopicPhase::OptimisticPending)
	}
}
