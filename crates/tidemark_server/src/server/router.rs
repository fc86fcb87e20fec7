#![forbid(unsafe_code)]

use tidemark_domain::{Message, Seq, Topic, UserId};
use tidemark_protocol::{Event, EventEnvelope};

use crate::server::hub::RoomHub;
use crate::util::time::unix_ms_now;

/// Routes events into topic rooms.
///
/// New-message events go to the message's topic room and, for scoped topics,
/// also to the global-scope room so activity listeners observe cross-topic
/// traffic without joining every topic. The sender's own connections are
/// included. Typing events stay topic-local and suppress the originating
/// user's own connections.
#[derive(Debug, Clone)]
pub struct BroadcastRouter {
	hub: RoomHub,
}

impl BroadcastRouter {
	pub fn new(hub: RoomHub) -> Self {
		Self { hub }
	}

	pub async fn route_message(&self, message: Message) {
		let topic = message.topic.clone();
		let env = EventEnvelope {
			topic: topic.clone(),
			seq: message.seq,
			server_time_unix_ms: unix_ms_now(),
			event: Event::MessageNew { message },
		};

		metrics::counter!("tidemark_server_messages_routed_total").increment(1);

		self.hub.publish_to_room(&topic, env.clone(), None).await;

		if !topic.is_global() {
			self.hub.publish_to_room(&Topic::Global, env, None).await;
		}
	}

	pub async fn route_typing(&self, topic: Topic, user: UserId, is_typing: bool) {
		let env = EventEnvelope {
			topic: topic.clone(),
			seq: Seq::ZERO,
			server_time_unix_ms: unix_ms_now(),
			event: Event::TypingUpdate {
				user: user.clone(),
				is_typing,
			},
		};

		self.hub.publish_to_room(&topic, env, Some(&user)).await;
	}
}
