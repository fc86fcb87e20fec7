#![forbid(unsafe_code)]

use std::collections::{BTreeMap, VecDeque};
use std::net::SocketAddr;
use std::time::Duration;

use bytes::BytesMut;
use tidemark_domain::{MessageId, Seq, Topic, UserId};
use tidemark_protocol::framing::{DEFAULT_MAX_FRAME_SIZE, FramingError, encode_frame, try_decode_frame_from_buffer};
use tidemark_protocol::{
	ClientEnvelope, ClientFrame, Event, EventEnvelope, JoinStatus, LeaveStatus, PROTOCOL_VERSION, SendStatus,
	ServerEnvelope, ServerFrame,
};
use tidemark_util::endpoint::TcpEndpoint;
use tokio::io::{AsyncReadExt as _, AsyncWriteExt as _};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tracing::{debug, info, warn};

pub mod sync;

/// Client session configuration (v1).
#[derive(Debug, Clone)]
pub struct ClientConfig {
	/// Remote server host (DNS name or IP literal).
	pub server_host: String,

	/// Remote server TCP port.
	pub server_port: u16,

	/// Resolved remote server address override.
	pub server_addr: Option<SocketAddr>,

	/// Client identifier.
	pub client_name: String,

	/// Client instance id.
	pub client_instance_id: String,

	/// Optional access token for server auth.
	pub auth_token: Option<String>,

	/// Advisory user id; only trusted by servers running without token auth.
	pub user: Option<String>,

	/// Maximum inbound/outbound frame size.
	pub max_frame_bytes: usize,

	/// Timeout for connect + handshake.
	pub connect_timeout: Duration,
}

impl ClientConfig {
	/// Parse a `tcp://host:port` endpoint into `(host, port)`.
	pub fn parse_tcp_endpoint(endpoint: &str) -> Result<(String, u16), ClientCoreError> {
		let e = TcpEndpoint::parse(endpoint)
			.map_err(|msg| ClientCoreError::Protocol(format!("invalid endpoint (expected tcp://host:port): {msg}")))?;
		Ok((e.host, e.port))
	}

	/// Convenience: create a config from `tcp://host:port`.
	pub fn from_tcp_endpoint(endpoint: &str) -> Result<Self, ClientCoreError> {
		let (host, port) = Self::parse_tcp_endpoint(endpoint)?;
		Ok(Self {
			server_host: host,
			server_port: port,
			server_addr: None,
			..Self::default()
		})
	}
}

impl Default for ClientConfig {
	fn default() -> Self {
		Self {
			server_host: "localhost".to_string(),
			server_port: 18310,
			server_addr: Some("127.0.0.1:18310".parse().expect("valid default addr")),
			client_name: format!("tidemark-client-core/{}", env!("CARGO_PKG_VERSION")),
			client_instance_id: "dev-instance".to_string(),
			auth_token: None,
			user: None,
			max_frame_bytes: DEFAULT_MAX_FRAME_SIZE,
			connect_timeout: Duration::from_secs(15),
		}
	}
}

/// Errors for client core operations.
#[derive(Debug, thiserror::Error)]
pub enum ClientCoreError {
	/// Connection establishment failed.
	#[error("failed to connect: {0}")]
	Connect(String),

	/// Protocol framing error.
	#[error(transparent)]
	Framing(#[from] FramingError),

	/// Protocol error (unexpected message ordering/types).
	#[error("protocol error: {0}")]
	Protocol(String),

	/// The server rejected an operation.
	#[error("rejected: {0}")]
	Rejected(String),

	/// IO error.
	#[error("io error: {0}")]
	Io(String),

	/// Other error.
	#[error("error: {0}")]
	Other(String),
}

impl From<anyhow::Error> for ClientCoreError {
	fn from(e: anyhow::Error) -> Self {
		ClientCoreError::Other(format!("{e:#}"))
	}
}

/// Handshake result.
#[derive(Debug, Clone)]
pub struct Welcome {
	pub server_name: String,
	pub server_instance_id: String,
	pub server_time_unix_ms: i64,
	pub max_frame_bytes: u32,
	pub user: UserId,
}

/// Result of a successful join.
#[derive(Debug, Clone)]
pub struct Joined {
	pub topic: Topic,
	pub latest_seq: Seq,
}

/// Confirmation of a sent message.
#[derive(Debug, Clone)]
pub struct SendReceipt {
	pub message_id: MessageId,
	pub seq: Seq,
}

/// Outcome of a `mark_read` request.
#[derive(Debug, Clone, Copy)]
pub struct ReadAck {
	pub watermark: Seq,
	pub applied: bool,
}

/// A connected client session over a single framed TCP stream.
///
/// Control requests and pushed events share the stream; request/response
/// pairing is done by `request_id`, and events that arrive in between are
/// buffered for `next_event`.
pub struct Session {
	read_half: OwnedReadHalf,
	write_half: OwnedWriteHalf,
	buf: BytesMut,
	pending_events: VecDeque<EventEnvelope>,
	max_frame_bytes: usize,
	next_request_id: u64,
	user: UserId,
}

impl Session {
	/// Connect and perform the v1 handshake.
	pub async fn connect(cfg: ClientConfig) -> Result<(Self, Welcome), ClientCoreError> {
		let connect_timeout = cfg.connect_timeout;

		let target = match cfg.server_addr {
			Some(addr) => addr.to_string(),
			None => format!("{}:{}", cfg.server_host, cfg.server_port),
		};

		let stream = match tokio::time::timeout(connect_timeout, TcpStream::connect(&target)).await {
			Ok(Ok(stream)) => stream,
			Ok(Err(e)) => return Err(ClientCoreError::Connect(format!("connect to {target} failed: {e}"))),
			Err(_) => {
				return Err(ClientCoreError::Connect(format!(
					"connect timeout after {connect_timeout:?} ({target})"
				)));
			}
		};
		info!(remote = %target, "connected");

		let (read_half, write_half) = stream.into_split();

		let mut session = Self {
			read_half,
			write_half,
			buf: BytesMut::with_capacity(16 * 1024),
			pending_events: VecDeque::new(),
			max_frame_bytes: cfg.max_frame_bytes,
			next_request_id: 1,
			// Placeholder until the Welcome confirms the registered identity.
			user: UserId::new("pending").expect("valid placeholder"),
		};

		let hello = ClientFrame::Hello {
			client_name: cfg.client_name,
			client_instance_id: cfg.client_instance_id,
			auth_token: cfg.auth_token.unwrap_or_default(),
			user: cfg.user.unwrap_or_default(),
		};

		let frame = tokio::time::timeout(connect_timeout, session.roundtrip(hello))
			.await
			.map_err(|_| ClientCoreError::Protocol(format!("timeout waiting for Welcome after {connect_timeout:?}")))??;

		let welcome = match frame {
			ServerFrame::Welcome {
				server_name,
				server_instance_id,
				server_time_unix_ms,
				max_frame_bytes,
				user,
			} => Welcome {
				server_name,
				server_instance_id,
				server_time_unix_ms,
				max_frame_bytes,
				user,
			},
			ServerFrame::Error { code, message, .. } => {
				return Err(ClientCoreError::Rejected(format!("{code}: {message}")));
			}
			other => return Err(ClientCoreError::Protocol(format!("expected Welcome, got {other:?}"))),
		};

		debug!(
			server_name = %welcome.server_name,
			server_instance_id = %welcome.server_instance_id,
			max_frame_bytes = welcome.max_frame_bytes,
			"received Welcome"
		);

		session.max_frame_bytes = (welcome.max_frame_bytes as usize).min(cfg.max_frame_bytes);
		session.user = welcome.user.clone();

		Ok((session, welcome))
	}

	/// The identity this session is registered under.
	pub fn user(&self) -> &UserId {
		&self.user
	}

	/// Join a topic's room.
	pub async fn join(&mut self, topic: Topic) -> Result<Joined, ClientCoreError> {
		match self.roundtrip(ClientFrame::Join { topic }).await? {
			ServerFrame::Joined {
				topic,
				status: JoinStatus::Ok,
				latest_seq,
				..
			} => Ok(Joined { topic, latest_seq }),
			ServerFrame::Joined { status, detail, .. } => {
				Err(ClientCoreError::Rejected(format!("join {status:?}: {detail}")))
			}
			other => Err(ClientCoreError::Protocol(format!("expected Joined, got {other:?}"))),
		}
	}

	/// Leave a topic's room. The server refuses to drop the global scope's
	/// standing subscription; that refusal is a no-op here.
	pub async fn leave(&mut self, topic: Topic) -> Result<(), ClientCoreError> {
		match self.roundtrip(ClientFrame::Leave { topic }).await? {
			ServerFrame::Left {
				status: LeaveStatus::Ok | LeaveStatus::Refused,
				..
			} => Ok(()),
			ServerFrame::Left { status, detail, .. } => {
				Err(ClientCoreError::Rejected(format!("leave {status:?}: {detail}")))
			}
			other => Err(ClientCoreError::Protocol(format!("expected Left, got {other:?}"))),
		}
	}

	/// Publish a message and await its confirmation.
	pub async fn send_message(
		&mut self,
		topic: Topic,
		body: impl Into<String>,
		quoted_message_id: Option<MessageId>,
		quoted_text: Option<String>,
	) -> Result<SendReceipt, ClientCoreError> {
		let frame = ClientFrame::Send {
			topic,
			body: body.into(),
			attachments: Vec::new(),
			quoted_message_id,
			quoted_text,
		};

		match self.roundtrip(frame).await? {
			ServerFrame::SendResult {
				status: SendStatus::Ok,
				message_id: Some(message_id),
				seq: Some(seq),
				..
			} => Ok(SendReceipt { message_id, seq }),
			ServerFrame::SendResult { status, detail, .. } => {
				Err(ClientCoreError::Rejected(format!("send {status:?}: {detail}")))
			}
			other => Err(ClientCoreError::Protocol(format!("expected SendResult, got {other:?}"))),
		}
	}

	/// Fire-and-forget typing signal.
	pub async fn typing(&mut self, topic: Topic, is_typing: bool) -> Result<(), ClientCoreError> {
		self.write_frame(String::new(), ClientFrame::Typing { topic, is_typing }).await
	}

	/// Advance the durable read position. A stale watermark is not an error;
	/// `applied` is false and `watermark` carries the authoritative value.
	pub async fn mark_read(&mut self, topic: Topic, up_to: Seq) -> Result<ReadAck, ClientCoreError> {
		match self.roundtrip(ClientFrame::MarkRead { topic, up_to }).await? {
			ServerFrame::MarkReadResult { watermark, applied, .. } => Ok(ReadAck { watermark, applied }),
			ServerFrame::Error { code, message, .. } => Err(ClientCoreError::Rejected(format!("{code}: {message}"))),
			other => Err(ClientCoreError::Protocol(format!("expected MarkReadResult, got {other:?}"))),
		}
	}

	/// Fetch a fresh authoritative unread summary.
	pub async fn fetch_unread(&mut self) -> Result<BTreeMap<Topic, u64>, ClientCoreError> {
		match self.roundtrip(ClientFrame::FetchUnread).await? {
			ServerFrame::Event(EventEnvelope {
				event: Event::UnreadSummary { counts },
				..
			}) => Ok(counts),
			ServerFrame::Error { code, message, .. } => Err(ClientCoreError::Rejected(format!("{code}: {message}"))),
			other => Err(ClientCoreError::Protocol(format!("expected unread summary, got {other:?}"))),
		}
	}

	/// Send a keepalive ping and await the pong response.
	pub async fn ping(&mut self, client_time_unix_ms: i64) -> Result<i64, ClientCoreError> {
		match self.roundtrip(ClientFrame::Ping { client_time_unix_ms }).await? {
			ServerFrame::Pong { server_time_unix_ms, .. } => Ok(server_time_unix_ms),
			other => Err(ClientCoreError::Protocol(format!("expected Pong, got {other:?}"))),
		}
	}

	/// Next pushed event; drains buffered events first.
	pub async fn next_event(&mut self) -> Result<EventEnvelope, ClientCoreError> {
		if let Some(ev) = self.pending_events.pop_front() {
			return Ok(ev);
		}

		loop {
			let env = self.read_envelope().await?;
			match env.frame {
				ServerFrame::Event(ev) => return Ok(ev),
				other => warn!("unexpected non-event frame while waiting for events: {other:?}"),
			}
		}
	}

	/// Close the write side; the server observes EOF and tears the session
	/// down.
	pub async fn close(&mut self) -> Result<(), ClientCoreError> {
		self.write_half.shutdown().await.map_err(|e| ClientCoreError::Io(e.to_string()))
	}

	async fn roundtrip(&mut self, frame: ClientFrame) -> Result<ServerFrame, ClientCoreError> {
		let request_id = format!("r{}", self.next_request_id);
		self.next_request_id += 1;

		self.write_frame(request_id.clone(), frame).await?;

		loop {
			let env = self.read_envelope().await?;
			if env.request_id == request_id {
				return Ok(env.frame);
			}

			match env.frame {
				ServerFrame::Event(ev) => self.pending_events.push_back(ev),
				other => debug!(request_id = %env.request_id, "dropping unmatched response: {other:?}"),
			}
		}
	}

	async fn write_frame(&mut self, request_id: String, frame: ClientFrame) -> Result<(), ClientCoreError> {
		let env = ClientEnvelope {
			version: PROTOCOL_VERSION,
			request_id,
			frame,
		};

		let bytes = encode_frame(&env, self.max_frame_bytes).map_err(ClientCoreError::Framing)?;
		self.write_half
			.write_all(&bytes)
			.await
			.map_err(|e| ClientCoreError::Io(e.to_string()))?;
		self.write_half.flush().await.map_err(|e| ClientCoreError::Io(e.to_string()))?;
		Ok(())
	}

	async fn read_envelope(&mut self) -> Result<ServerEnvelope, ClientCoreError> {
		loop {
			match try_decode_frame_from_buffer::<ServerEnvelope>(&mut self.buf, self.max_frame_bytes) {
				Ok(Some(env)) => return Ok(env),
				Ok(None) => {}
				Err(e) => return Err(ClientCoreError::Framing(e)),
			}

			let n = self
				.read_half
				.read_buf(&mut self.buf)
				.await
				.map_err(|e| ClientCoreError::Io(e.to_string()))?;
			if n == 0 {
				return Err(ClientCoreError::Io("connection closed".to_string()));
			}
		}
	}
}
