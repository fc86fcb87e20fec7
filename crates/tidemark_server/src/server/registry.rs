#![forbid(unsafe_code)]

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tidemark_domain::{ConnectionId, Topic, UserId};
use tidemark_protocol::ServerEnvelope;
use tokio::sync::{Mutex, mpsc};
use tracing::debug;

use crate::server::rooms::RoomRegistry;

/// Tracks live connections per user. A user may hold several simultaneous
/// connections (multi-tab, multi-device); all of them receive identical
/// user-directed pushes.
#[derive(Debug, Clone)]
pub struct ConnectionRegistry {
	rooms: RoomRegistry,
	inner: Arc<Mutex<Inner>>,
}

#[derive(Debug, Default)]
struct Inner {
	user_by_conn: HashMap<ConnectionId, UserId>,
	conns_by_user: HashMap<UserId, HashSet<ConnectionId>>,
	senders: HashMap<ConnectionId, mpsc::Sender<ServerEnvelope>>,
}

impl ConnectionRegistry {
	pub fn new(rooms: RoomRegistry) -> Self {
		Self {
			rooms,
			inner: Arc::new(Mutex::new(Inner::default())),
		}
	}

	/// Register an authenticated connection. Every registered connection is
	/// automatically joined to the global scope for its lifetime.
	pub async fn register(&self, conn: ConnectionId, user: UserId, sender: mpsc::Sender<ServerEnvelope>) {
		{
			let mut inner = self.inner.lock().await;
			inner.user_by_conn.insert(conn, user.clone());
			inner.conns_by_user.entry(user.clone()).or_default().insert(conn);
			inner.senders.insert(conn, sender);
		}

		self.rooms.join(conn, Topic::Global).await;

		metrics::gauge!("tidemark_server_registered_connections").increment(1.0);
		debug!(conn = %conn, user = %user, "connection registered");
	}

	/// Remove a connection and all of its room memberships. Idempotent;
	/// duplicate disconnect events are safe.
	pub async fn unregister(&self, conn: ConnectionId) -> Option<UserId> {
		let user = {
			let mut inner = self.inner.lock().await;
			inner.senders.remove(&conn);
			let user = inner.user_by_conn.remove(&conn)?;

			if let Some(conns) = inner.conns_by_user.get_mut(&user) {
				conns.remove(&conn);
				if conns.is_empty() {
					inner.conns_by_user.remove(&user);
				}
			}
			user
		};

		self.rooms.remove_conn(conn).await;

		metrics::gauge!("tidemark_server_registered_connections").decrement(1.0);
		debug!(conn = %conn, user = %user, "connection unregistered");
		Some(user)
	}

	pub async fn user_of(&self, conn: ConnectionId) -> Option<UserId> {
		let inner = self.inner.lock().await;
		inner.user_by_conn.get(&conn).cloned()
	}

	pub async fn connections_for(&self, user: &UserId) -> HashSet<ConnectionId> {
		let inner = self.inner.lock().await;
		inner.conns_by_user.get(user).cloned().unwrap_or_default()
	}

	/// Push an envelope to every live connection of a user. Returns how many
	/// connections accepted it; slow consumers are skipped, not awaited.
	pub async fn send_to_user(&self, user: &UserId, env: ServerEnvelope) -> usize {
		let senders = {
			let inner = self.inner.lock().await;
			let Some(conns) = inner.conns_by_user.get(user) else {
				return 0;
			};
			conns
				.iter()
				.filter_map(|conn| inner.senders.get(conn).cloned())
				.collect::<Vec<_>>()
		};

		let mut delivered = 0usize;
		for sender in senders {
			match sender.try_send(env.clone()) {
				Ok(()) => delivered += 1,
				Err(_) => {
					metrics::counter!("tidemark_server_user_push_dropped_total").increment(1);
				}
			}
		}

		delivered
	}
}
