#![forbid(unsafe_code)]

use core::fmt;
use core::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors for parsing identifiers from strings.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseIdError {
	#[error("empty value")]
	Empty,
	#[error("invalid format: {0}")]
	InvalidFormat(String),
}

/// Stable user identifier, assigned by the authentication collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(String);

impl UserId {
	/// Create a non-empty `UserId`.
	pub fn new(id: impl Into<String>) -> Result<Self, ParseIdError> {
		let id = id.into();
		if id.trim().is_empty() {
			return Err(ParseIdError::Empty);
		}
		Ok(Self(id))
	}
	pub fn as_str(&self) -> &str {
		&self.0
	}
	pub fn into_string(self) -> String {
		self.0
	}
}

impl fmt::Display for UserId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.0)
	}
}

impl FromStr for UserId {
	type Err = ParseIdError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		UserId::new(s.to_string())
	}
}

/// Server-local connection identifier. Not stable across reconnects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectionId(pub u64);

impl fmt::Display for ConnectionId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}", self.0)
	}
}

/// Direct-conversation identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConversationId(String);

impl ConversationId {
	pub fn new(id: impl Into<String>) -> Result<Self, ParseIdError> {
		let id = id.into();
		if id.trim().is_empty() {
			return Err(ParseIdError::Empty);
		}
		Ok(Self(id))
	}
	pub fn as_str(&self) -> &str {
		&self.0
	}
}

impl fmt::Display for ConversationId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.0)
	}
}

/// Group identifier, owner scope of channels.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GroupId(String);

impl GroupId {
	pub fn new(id: impl Into<String>) -> Result<Self, ParseIdError> {
		let id = id.into();
		if id.trim().is_empty() {
			return Err(ParseIdError::Empty);
		}
		Ok(Self(id))
	}
	pub fn as_str(&self) -> &str {
		&self.0
	}
}

impl fmt::Display for GroupId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.0)
	}
}

/// Channel identifier. A channel belongs to exactly one group.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChannelId(String);

impl ChannelId {
	pub fn new(id: impl Into<String>) -> Result<Self, ParseIdError> {
		let id = id.into();
		if id.trim().is_empty() {
			return Err(ParseIdError::Empty);
		}
		Ok(Self(id))
	}
	pub fn as_str(&self) -> &str {
		&self.0
	}
}

impl fmt::Display for ChannelId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.0)
	}
}

/// Addressable broadcast scope.
///
/// Canonical string forms: `dm:<conversation>`, `group:<group>/<channel>`,
/// `global`. Topics are never nested.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Topic {
	Direct(ConversationId),
	Channel(GroupId, ChannelId),
	Global,
}

impl Topic {
	/// Prefix for direct-conversation topics.
	pub const DIRECT_PREFIX: &'static str = "dm:";

	/// Prefix for group-channel topics.
	pub const CHANNEL_PREFIX: &'static str = "group:";

	/// The standing global scope topic string.
	pub const GLOBAL: &'static str = "global";

	pub fn is_global(&self) -> bool {
		matches!(self, Topic::Global)
	}

	/// Parse a canonical topic string.
	pub fn parse(s: &str) -> Result<Self, ParseIdError> {
		let s = s.trim();
		if s.is_empty() {
			return Err(ParseIdError::Empty);
		}

		if s == Self::GLOBAL {
			return Ok(Topic::Global);
		}

		if let Some(rest) = s.strip_prefix(Self::DIRECT_PREFIX) {
			let id = ConversationId::new(rest.to_string())?;
			return Ok(Topic::Direct(id));
		}

		if let Some(rest) = s.strip_prefix(Self::CHANNEL_PREFIX) {
			let (group_s, channel_s) = rest
				.split_once('/')
				.ok_or_else(|| ParseIdError::InvalidFormat("expected group:<group>/<channel>".into()))?;
			let group = GroupId::new(group_s.to_string())?;
			let channel = ChannelId::new(channel_s.to_string())?;
			return Ok(Topic::Channel(group, channel));
		}

		Err(ParseIdError::InvalidFormat(
			"expected dm:<id>, group:<group>/<channel>, or global".into(),
		))
	}
}

impl fmt::Display for Topic {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			Topic::Direct(id) => write!(f, "{}{}", Self::DIRECT_PREFIX, id),
			Topic::Channel(group, channel) => write!(f, "{}{}{}{}", Self::CHANNEL_PREFIX, group, '/', channel),
			Topic::Global => f.write_str(Self::GLOBAL),
		}
	}
}

impl FromStr for Topic {
	type Err = ParseIdError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		Topic::parse(s)
	}
}

impl TryFrom<String> for Topic {
	type Error = ParseIdError;

	fn try_from(s: String) -> Result<Self, Self::Error> {
		Topic::parse(&s)
	}
}

impl From<Topic> for String {
	fn from(t: Topic) -> Self {
		t.to_string()
	}
}

/// Server-assigned message identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(pub uuid::Uuid);

impl MessageId {
	/// Create a new random message id.
	pub fn new_v4() -> Self {
		Self(uuid::Uuid::new_v4())
	}
}

impl fmt::Display for MessageId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}", self.0)
	}
}

/// Per-topic message sequence number: strictly increasing, gap-free, the
/// sole ordering key. Wall-clock timestamps are display-only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Seq(pub u64);

impl Seq {
	pub const ZERO: Seq = Seq(0);

	pub fn next(self) -> Seq {
		Seq(self.0.saturating_add(1))
	}
}

impl fmt::Display for Seq {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}", self.0)
	}
}

/// A chat message. Immutable once created; `seq` orders it within its topic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
	pub id: MessageId,
	pub topic: Topic,
	pub sender: UserId,
	pub body: String,

	/// Opaque attachment references (storage is an external collaborator).
	#[serde(default, skip_serializing_if = "Vec::is_empty")]
	pub attachments: Vec<String>,

	/// Soft reference to an earlier message in the same topic. Has no effect
	/// on ordering or unread accounting.
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub quoted_message_id: Option<MessageId>,

	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub quoted_text: Option<String>,

	pub seq: Seq,

	/// Absolute instant, converted to viewer-local time at render time only.
	pub created_at_unix_ms: i64,
}

/// Durable watermark of the last message a user has acknowledged in a topic.
/// Exactly one row per (user, topic); writes are monotonic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadPosition {
	pub user: UserId,
	pub topic: Topic,
	pub last_ack_seq: Seq,
	pub updated_at_unix_ms: i64,
}
