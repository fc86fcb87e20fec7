#![forbid(unsafe_code)]

pub mod framing;

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tidemark_domain::{Message, MessageId, Seq, Topic, UserId};

pub use framing::{
	DEFAULT_MAX_FRAME_SIZE, FramingError, decode_frame, encode_frame, encode_frame_default, encode_frame_into,
	frame_len_from_payload_len, try_decode_frame_from_buffer,
};

/// Protocol version constants.
pub mod version {
	/// Current protocol major version (v1).
	pub const PROTOCOL_MAJOR: u32 = 1;
	/// Current protocol minor version.
	pub const PROTOCOL_MINOR: u32 = 0;

	/// Compact representation useful for logs/metrics.
	pub const PROTOCOL_VERSION_U32: u32 = (PROTOCOL_MAJOR << 16) | PROTOCOL_MINOR;
}

/// v1 protocol version written into envelope headers.
pub const PROTOCOL_VERSION: u32 = 1;

/// Client-to-server envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientEnvelope {
	pub version: u32,

	/// Correlates responses on the control path; empty when unused.
	#[serde(default)]
	pub request_id: String,

	pub frame: ClientFrame,
}

/// Server-to-client envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerEnvelope {
	pub version: u32,

	#[serde(default)]
	pub request_id: String,

	pub frame: ServerFrame,
}

/// Client-originated frames.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
	/// First frame on every connection. `user` is advisory; with HMAC auth
	/// enabled the token's `sub` claim wins.
	Hello {
		client_name: String,
		client_instance_id: String,
		#[serde(default)]
		auth_token: String,
		#[serde(default)]
		user: String,
	},

	/// Room membership request. Joining an already-joined topic is a no-op.
	Join {
		topic: Topic,
	},

	/// Leave a scoped topic. The global scope refuses leaves.
	Leave {
		topic: Topic,
	},

	/// Publish a new message into a topic.
	Send {
		topic: Topic,
		body: String,
		#[serde(default, skip_serializing_if = "Vec::is_empty")]
		attachments: Vec<String>,
		#[serde(default, skip_serializing_if = "Option::is_none")]
		quoted_message_id: Option<MessageId>,
		#[serde(default, skip_serializing_if = "Option::is_none")]
		quoted_text: Option<String>,
	},

	/// Ephemeral presence signal; expires server-side after 3 seconds.
	Typing {
		topic: Topic,
		is_typing: bool,
	},

	/// Advance the durable read position. Stale watermarks are ignored.
	MarkRead {
		topic: Topic,
		up_to: Seq,
	},

	/// Request a fresh authoritative unread summary.
	FetchUnread,

	Ping {
		client_time_unix_ms: i64,
	},
}

/// Server-originated frames.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
	Welcome {
		server_name: String,
		server_instance_id: String,
		server_time_unix_ms: i64,
		max_frame_bytes: u32,
		/// The authenticated user this connection is registered under.
		user: UserId,
	},

	Joined {
		topic: Topic,
		status: JoinStatus,
		/// Highest sequence currently persisted for the topic.
		latest_seq: Seq,
		#[serde(default)]
		detail: String,
	},

	Left {
		topic: Topic,
		status: LeaveStatus,
		#[serde(default)]
		detail: String,
	},

	SendResult {
		status: SendStatus,
		#[serde(default, skip_serializing_if = "Option::is_none")]
		message_id: Option<MessageId>,
		#[serde(default, skip_serializing_if = "Option::is_none")]
		seq: Option<Seq>,
		#[serde(default)]
		detail: String,
	},

	/// Acknowledges a `MarkRead`. `watermark` is the effective stored value,
	/// which may exceed the requested one when the request was stale.
	MarkReadResult {
		topic: Topic,
		watermark: Seq,
		applied: bool,
	},

	Pong {
		client_time_unix_ms: i64,
		server_time_unix_ms: i64,
	},

	Error {
		code: String,
		message: String,
		#[serde(default, skip_serializing_if = "Option::is_none")]
		topic: Option<Topic>,
	},

	Event(EventEnvelope),
}

/// Result status for `Join`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JoinStatus {
	Ok,
	NotAuthorized,
	InvalidTopic,
}

/// Result status for `Leave`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LeaveStatus {
	Ok,
	NotJoined,
	/// The global scope is a standing subscription and cannot be left.
	Refused,
}

/// Result status for `Send`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SendStatus {
	Ok,
	NotAuthorized,
	InvalidTopic,
	InvalidMessage,
	InternalError,
}

/// Wrapper around every pushed event, carrying its topic and ordering key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventEnvelope {
	pub topic: Topic,

	/// Per-topic sequence of the event's message; zero for events that carry
	/// no ordering (typing, summaries).
	pub seq: Seq,

	pub server_time_unix_ms: i64,

	pub event: Event,
}

/// Pushed events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Event {
	MessageNew {
		message: Message,
	},

	TypingUpdate {
		user: UserId,
		is_typing: bool,
	},

	/// Authoritative per-topic unread counts for the receiving user. Always
	/// a full replacement of client-side state, never a delta.
	UnreadSummary {
		counts: BTreeMap<Topic, u64>,
	},

	/// The subscriber queue overflowed; a full refresh is required.
	Lagged {
		dropped: u64,
		#[serde(default)]
		detail: String,
	},
}

impl Event {
	/// Stable kind label for logs/metrics.
	pub fn kind(&self) -> &'static str {
		match self {
			Event::MessageNew { .. } => "message:new",
			Event::TypingUpdate { .. } => "typing:update",
			Event::UnreadSummary { .. } => "unread:summary",
			Event::Lagged { .. } => "lagged",
		}
	}
}

/// Conversation row returned by the HTTP query surface.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationEntry {
	pub topic: Topic,
	pub unread: u64,
	pub latest_seq: Seq,
}

/// Response body for `GET /conversations`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationList {
	pub conversations: Vec<ConversationEntry>,
}

/// Response body for `GET /messages`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageHistory {
	pub topic: Topic,
	pub messages: Vec<Message>,
	/// Highest sequence persisted for the topic at read time.
	pub latest_seq: Seq,
}
