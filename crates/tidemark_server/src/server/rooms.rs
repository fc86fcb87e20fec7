#![forbid(unsafe_code)]

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tidemark_domain::{ConnectionId, Topic};
use tokio::sync::Mutex;
use tracing::debug;

/// Result of a join request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinOutcome {
	Joined,
	AlreadyJoined,
}

/// Result of a leave request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaveOutcome {
	Left,
	NotJoined,

	/// The global scope is a standing subscription for the lifetime of the
	/// connection and cannot be left.
	RefusedGlobal,
}

/// Process-local room membership, keyed by the (topic, connection) pair.
///
/// Membership is a many-to-many relation: leaving one topic never touches
/// membership in any other topic for the same connection.
#[derive(Debug, Clone, Default)]
pub struct RoomRegistry {
	inner: Arc<Mutex<Inner>>,
}

#[derive(Debug, Default)]
struct Inner {
	topics_by_conn: HashMap<ConnectionId, HashSet<Topic>>,
	conns_by_topic: HashMap<Topic, HashSet<ConnectionId>>,
}

impl RoomRegistry {
	pub fn new() -> Self {
		Self::default()
	}

	/// Add a connection to a topic's room. Idempotent.
	pub async fn join(&self, conn: ConnectionId, topic: Topic) -> JoinOutcome {
		let mut inner = self.inner.lock().await;
		let newly = inner.topics_by_conn.entry(conn).or_default().insert(topic.clone());
		inner.conns_by_topic.entry(topic.clone()).or_default().insert(conn);

		if newly {
			debug!(conn = %conn, topic = %topic, "room joined");
			JoinOutcome::Joined
		} else {
			JoinOutcome::AlreadyJoined
		}
	}

	/// Remove a connection from a topic's room. Refuses the global scope.
	pub async fn leave(&self, conn: ConnectionId, topic: &Topic) -> LeaveOutcome {
		if topic.is_global() {
			return LeaveOutcome::RefusedGlobal;
		}

		let mut inner = self.inner.lock().await;
		let removed = inner
			.topics_by_conn
			.get_mut(&conn)
			.map(|topics| topics.remove(topic))
			.unwrap_or(false);

		if !removed {
			return LeaveOutcome::NotJoined;
		}

		if let Some(conns) = inner.conns_by_topic.get_mut(topic) {
			conns.remove(&conn);
			if conns.is_empty() {
				inner.conns_by_topic.remove(topic);
			}
		}

		debug!(conn = %conn, topic = %topic, "room left");
		LeaveOutcome::Left
	}

	pub async fn is_member(&self, conn: ConnectionId, topic: &Topic) -> bool {
		let inner = self.inner.lock().await;
		inner
			.topics_by_conn
			.get(&conn)
			.map(|topics| topics.contains(topic))
			.unwrap_or(false)
	}

	pub async fn members_of(&self, topic: &Topic) -> HashSet<ConnectionId> {
		let inner = self.inner.lock().await;
		inner.conns_by_topic.get(topic).cloned().unwrap_or_default()
	}

	pub async fn topics_for_conn(&self, conn: ConnectionId) -> HashSet<Topic> {
		let inner = self.inner.lock().await;
		inner.topics_by_conn.get(&conn).cloned().unwrap_or_default()
	}

	/// Drop every membership of a connection, the global scope included.
	/// Called on disconnect; idempotent.
	pub async fn remove_conn(&self, conn: ConnectionId) -> HashSet<Topic> {
		let mut inner = self.inner.lock().await;
		let topics = inner.topics_by_conn.remove(&conn).unwrap_or_default();

		for topic in &topics {
			if let Some(conns) = inner.conns_by_topic.get_mut(topic) {
				conns.remove(&conn);
				if conns.is_empty() {
					inner.conns_by_topic.remove(topic);
				}
			}
		}

		topics
	}
}
