#![forbid(unsafe_code)]

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use tidemark_domain::{Topic, UserId};
use tokio::sync::Mutex;

/// External collaborator that resolves which topics a user belongs to and is
/// authorized to join or send into. The global scope is open to every
/// authenticated user.
#[async_trait::async_trait]
pub trait MembershipDirectory: Send + Sync {
	async fn can_access(&self, user: &UserId, topic: &Topic) -> anyhow::Result<bool>;

	/// Topics the user is a member of; excludes the global scope.
	async fn topics_for(&self, user: &UserId) -> anyhow::Result<Vec<Topic>>;
}

/// In-process directory backed by explicit grants. With `allow_unlisted` set
/// it authorizes any topic but still only enumerates granted ones.
#[derive(Debug, Default)]
pub struct StaticDirectory {
	allow_unlisted: bool,
	grants: Mutex<HashMap<UserId, BTreeSet<Topic>>>,
}

impl StaticDirectory {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn permissive() -> Self {
		Self {
			allow_unlisted: true,
			grants: Mutex::new(HashMap::new()),
		}
	}

	pub async fn grant(&self, user: UserId, topic: Topic) {
		let mut grants = self.grants.lock().await;
		grants.entry(user).or_default().insert(topic);
	}

	pub async fn revoke(&self, user: &UserId, topic: &Topic) {
		let mut grants = self.grants.lock().await;
		if let Some(topics) = grants.get_mut(user) {
			topics.remove(topic);
			if topics.is_empty() {
				grants.remove(user);
			}
		}
	}
}

#[async_trait::async_trait]
impl MembershipDirectory for StaticDirectory {
	async fn can_access(&self, user: &UserId, topic: &Topic) -> anyhow::Result<bool> {
		if topic.is_global() {
			return Ok(true);
		}

		let grants = self.grants.lock().await;
		let granted = grants.get(user).map(|topics| topics.contains(topic)).unwrap_or(false);

		Ok(granted || self.allow_unlisted)
	}

	async fn topics_for(&self, user: &UserId) -> anyhow::Result<Vec<Topic>> {
		let grants = self.grants.lock().await;
		Ok(grants.get(user).map(|topics| topics.iter().cloned().collect()).unwrap_or_default())
	}
}

/// Shared trait-object alias used across the server.
pub type SharedDirectory = Arc<dyn MembershipDirectory>;
