#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::time::Duration;

use anyhow::{Context as _, anyhow};
use bytes::BytesMut;
use tidemark_domain::{ConnectionId, Seq, Topic, UserId};
use tidemark_protocol::{
	ClientEnvelope, ClientFrame, DEFAULT_MAX_FRAME_SIZE, Event, EventEnvelope, JoinStatus, LeaveStatus,
	PROTOCOL_VERSION, SendStatus, ServerEnvelope, ServerFrame, encode_frame, try_decode_frame_from_buffer,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::server::auth::verify_token;
use crate::server::directory::SharedDirectory;
use crate::server::hub::{RoomHub, RoomHubItem};
use crate::server::registry::ConnectionRegistry;
use crate::server::rooms::{LeaveOutcome, RoomRegistry};
use crate::server::router::BroadcastRouter;
use crate::server::store::{NewMessage, SyncStore};
use crate::server::typing::TypingTracker;
use crate::server::unread::UnreadAggregator;
use crate::util::time::unix_ms_now;

/// Per-session server settings.
#[derive(Debug, Clone)]
pub struct SessionSettings {
	pub max_frame_bytes: u32,

	/// Capacity of the per-connection outbound queue.
	pub outbound_queue_capacity: usize,

	/// HMAC secret for access tokens; when unset, the advisory `user` field
	/// of the hello frame is trusted (dev mode).
	pub auth_hmac_secret: Option<String>,

	pub server_name: String,
}

impl Default for SessionSettings {
	fn default() -> Self {
		Self {
			max_frame_bytes: DEFAULT_MAX_FRAME_SIZE as u32,
			outbound_queue_capacity: 256,
			auth_hmac_secret: None,
			server_name: format!("tidemark-server/{}", env!("CARGO_PKG_VERSION")),
		}
	}
}

/// Shared server components a session operates against.
#[derive(Clone)]
pub struct SessionDeps {
	pub registry: ConnectionRegistry,
	pub rooms: RoomRegistry,
	pub hub: RoomHub,
	pub router: BroadcastRouter,
	pub store: SyncStore,
	pub unread: UnreadAggregator,
	pub typing: TypingTracker,
	pub directory: SharedDirectory,
}

struct Hello {
	request_id: String,
	client_name: String,
	auth_token: String,
	user: String,
}

pub async fn handle_session(
	conn_id: ConnectionId,
	stream: TcpStream,
	deps: SessionDeps,
	settings: SessionSettings,
) -> anyhow::Result<()> {
	struct ConnectionGaugeGuard;
	impl Drop for ConnectionGaugeGuard {
		fn drop(&mut self) {
			metrics::gauge!("tidemark_server_active_connections").decrement(1.0);
		}
	}

	metrics::gauge!("tidemark_server_active_connections").increment(1.0);
	let _conn_guard = ConnectionGaugeGuard;

	let max_frame = settings.max_frame_bytes as usize;
	let (mut read_half, mut write_half) = stream.into_split();

	let (ctrl_tx, mut ctrl_rx) = mpsc::unbounded_channel::<ClientEnvelope>();
	let reader_task = tokio::spawn(async move {
		let mut buf = BytesMut::with_capacity(16 * 1024);

		loop {
			loop {
				match try_decode_frame_from_buffer::<ClientEnvelope>(&mut buf, max_frame) {
					Ok(Some(env)) => {
						metrics::counter!("tidemark_server_envelopes_in_total").increment(1);
						if ctrl_tx.send(env).is_err() {
							return Ok::<(), anyhow::Error>(());
						}
					}
					Ok(None) => break,
					Err(e) => {
						metrics::counter!("tidemark_server_decode_errors_total").increment(1);
						return Err(anyhow!(e).context("failed to decode inbound frame"));
					}
				}
			}

			let n = read_half.read_buf(&mut buf).await.context("socket read failed")?;
			if n == 0 {
				return Ok(());
			}
			metrics::counter!("tidemark_server_bytes_in_total").increment(n as u64);
		}
	});

	let (out_tx, mut out_rx) = mpsc::channel::<ServerEnvelope>(settings.outbound_queue_capacity);
	let writer_task = tokio::spawn(async move {
		while let Some(env) = out_rx.recv().await {
			let frame = encode_frame(&env, max_frame).context("encode outbound frame")?;
			metrics::counter!("tidemark_server_envelopes_out_total").increment(1);
			write_half.write_all(&frame).await.context("socket write failed")?;
		}
		Ok::<(), anyhow::Error>(())
	});

	let hello = match tokio::time::timeout(Duration::from_secs(10), wait_for_hello(&mut ctrl_rx)).await {
		Ok(Ok(hello)) => hello,
		Ok(Err(e)) => {
			reader_task.abort();
			return Err(e);
		}
		Err(_) => {
			reader_task.abort();
			return Err(anyhow!("timed out waiting for hello"));
		}
	};

	let user = match resolve_user(&hello, settings.auth_hmac_secret.as_deref()) {
		Ok(user) => user,
		Err(e) => {
			warn!(conn = %conn_id, error = %e, "rejecting unauthenticated connection");
			let _ = send_frame(
				&out_tx,
				hello.request_id,
				ServerFrame::Error {
					code: "UNAUTHORIZED".to_string(),
					message: e.to_string(),
					topic: None,
				},
			)
			.await;
			reader_task.abort();
			return Ok(());
		}
	};

	info!(conn = %conn_id, user = %user, client = %hello.client_name, "session authenticated");

	// Registration joins the global scope as a side effect; the standing
	// global subscription task mirrors that below.
	deps.registry.register(conn_id, user.clone(), out_tx.clone()).await;

	send_frame(
		&out_tx,
		hello.request_id,
		ServerFrame::Welcome {
			server_name: settings.server_name.clone(),
			server_instance_id: format!("conn-{conn_id}"),
			server_time_unix_ms: unix_ms_now(),
			max_frame_bytes: settings.max_frame_bytes,
			user: user.clone(),
		},
	)
	.await?;

	let mut room_tasks: HashMap<Topic, tokio::task::JoinHandle<()>> = HashMap::new();
	ensure_room_task(conn_id, &Topic::Global, &user, &deps, &out_tx, &mut room_tasks).await;

	while let Some(env) = ctrl_rx.recv().await {
		let request_id = env.request_id;

		match env.frame {
			ClientFrame::Hello { .. } => {
				debug!(conn = %conn_id, "ignoring duplicate hello");
			}

			ClientFrame::Ping { client_time_unix_ms } => {
				if send_frame(
					&out_tx,
					request_id,
					ServerFrame::Pong {
						client_time_unix_ms,
						server_time_unix_ms: unix_ms_now(),
					},
				)
				.await
				.is_err()
				{
					break;
				}
			}

			ClientFrame::Join { topic } => {
				let allowed = match deps.directory.can_access(&user, &topic).await {
					Ok(allowed) => allowed,
					Err(e) => {
						warn!(conn = %conn_id, topic = %topic, error = %e, "directory lookup failed");
						false
					}
				};

				let frame = if allowed {
					deps.rooms.join(conn_id, topic.clone()).await;
					ensure_room_task(conn_id, &topic, &user, &deps, &out_tx, &mut room_tasks).await;

					let latest_seq = deps.store.latest_seq(&topic).await.unwrap_or_else(|e| {
						warn!(conn = %conn_id, topic = %topic, error = %e, "latest_seq lookup failed");
						Seq::ZERO
					});

					ServerFrame::Joined {
						topic,
						status: JoinStatus::Ok,
						latest_seq,
						detail: String::new(),
					}
				} else {
					ServerFrame::Joined {
						topic,
						status: JoinStatus::NotAuthorized,
						latest_seq: Seq::ZERO,
						detail: "not a member of this topic".to_string(),
					}
				};

				if send_frame(&out_tx, request_id, frame).await.is_err() {
					break;
				}
			}

			ClientFrame::Leave { topic } => {
				let (status, detail) = match deps.rooms.leave(conn_id, &topic).await {
					LeaveOutcome::Left => {
						if let Some(handle) = room_tasks.remove(&topic) {
							handle.abort();
						}
						deps.hub.prune_room(&topic).await;
						(LeaveStatus::Ok, String::new())
					}
					LeaveOutcome::NotJoined => (LeaveStatus::NotJoined, String::new()),
					LeaveOutcome::RefusedGlobal => {
						(LeaveStatus::Refused, "the global scope cannot be left".to_string())
					}
				};

				if send_frame(&out_tx, request_id, ServerFrame::Left { topic, status, detail })
					.await
					.is_err()
				{
					break;
				}
			}

			ClientFrame::Send {
				topic,
				body,
				attachments,
				quoted_message_id,
				quoted_text,
			} => {
				let frame = handle_send(
					conn_id,
					&deps,
					&user,
					topic,
					body,
					attachments,
					quoted_message_id,
					quoted_text,
				)
				.await;

				if send_frame(&out_tx, request_id, frame).await.is_err() {
					break;
				}
			}

			ClientFrame::Typing { topic, is_typing } => {
				// Typing is only meaningful inside rooms the connection has
				// actually joined; anything else is dropped silently.
				if !deps.rooms.is_member(conn_id, &topic).await {
					continue;
				}

				deps.typing.signal(topic.clone(), user.clone(), is_typing).await;
				deps.router.route_typing(topic, user.clone(), is_typing).await;
			}

			ClientFrame::MarkRead { topic, up_to } => {
				match deps.store.mark_read(&user, &topic, up_to, unix_ms_now()).await {
					Ok(outcome) => {
						let ack = ServerFrame::MarkReadResult {
							topic: topic.clone(),
							watermark: outcome.watermark,
							applied: outcome.applied,
						};
						if send_frame(&out_tx, request_id, ack).await.is_err() {
							break;
						}

						// The write is durable at this point; only now may
						// updated counts be reported to any of the user's
						// connections.
						push_unread_summary(&deps, &user).await;
					}
					Err(e) => {
						error!(conn = %conn_id, topic = %topic, error = %e, "mark_read failed");
						let frame = ServerFrame::Error {
							code: "INTERNAL".to_string(),
							message: "failed to persist read position".to_string(),
							topic: Some(topic),
						};
						if send_frame(&out_tx, request_id, frame).await.is_err() {
							break;
						}
					}
				}
			}

			ClientFrame::FetchUnread => match unread_summary(&deps, &user).await {
				Ok(counts) => {
					let frame = ServerFrame::Event(EventEnvelope {
						topic: Topic::Global,
						seq: Seq::ZERO,
						server_time_unix_ms: unix_ms_now(),
						event: Event::UnreadSummary { counts },
					});
					if send_frame(&out_tx, request_id, frame).await.is_err() {
						break;
					}
				}
				Err(e) => {
					error!(conn = %conn_id, error = %e, "unread summary failed");
					let frame = ServerFrame::Error {
						code: "INTERNAL".to_string(),
						message: "failed to compute unread summary".to_string(),
						topic: None,
					};
					if send_frame(&out_tx, request_id, frame).await.is_err() {
						break;
					}
				}
			},
		}
	}

	for (_, handle) in room_tasks.drain() {
		handle.abort();
	}
	reader_task.abort();

	deps.registry.unregister(conn_id).await;
	for topic in deps.typing.clear_user(&user).await {
		deps.router.route_typing(topic, user.clone(), false).await;
	}

	drop(out_tx);
	let _ = writer_task.await;

	info!(conn = %conn_id, user = %user, "session closed");
	Ok(())
}

#[allow(clippy::too_many_arguments)]
async fn handle_send(
	conn_id: ConnectionId,
	deps: &SessionDeps,
	user: &UserId,
	topic: Topic,
	body: String,
	attachments: Vec<String>,
	quoted_message_id: Option<tidemark_domain::MessageId>,
	quoted_text: Option<String>,
) -> ServerFrame {
	if body.trim().is_empty() && attachments.is_empty() {
		return send_result(SendStatus::InvalidMessage, None, None, "empty message body");
	}

	if topic.is_global() {
		return send_result(SendStatus::InvalidTopic, None, None, "the global scope is not writable");
	}

	let allowed = match deps.directory.can_access(user, &topic).await {
		Ok(allowed) => allowed,
		Err(e) => {
			warn!(conn = %conn_id, topic = %topic, error = %e, "directory lookup failed");
			false
		}
	};
	if !allowed {
		return send_result(SendStatus::NotAuthorized, None, None, "not a member of this topic");
	}

	let new = NewMessage {
		topic,
		sender: user.clone(),
		body,
		attachments,
		quoted_message_id,
		quoted_text,
	};

	match deps.store.append_message(new, unix_ms_now()).await {
		Ok(message) => {
			let (id, seq) = (message.id, message.seq);
			deps.router.route_message(message).await;
			metrics::counter!("tidemark_server_messages_total").increment(1);
			send_result(SendStatus::Ok, Some(id), Some(seq), "")
		}
		Err(e) => {
			error!(conn = %conn_id, error = %e, "message append failed");
			send_result(SendStatus::InternalError, None, None, "failed to persist message")
		}
	}
}

fn send_result(
	status: SendStatus,
	message_id: Option<tidemark_domain::MessageId>,
	seq: Option<Seq>,
	detail: &str,
) -> ServerFrame {
	ServerFrame::SendResult {
		status,
		message_id,
		seq,
		detail: detail.to_string(),
	}
}

async fn wait_for_hello(ctrl_rx: &mut mpsc::UnboundedReceiver<ClientEnvelope>) -> anyhow::Result<Hello> {
	match ctrl_rx.recv().await {
		Some(env) => match env.frame {
			ClientFrame::Hello {
				client_name,
				auth_token,
				user,
				..
			} => Ok(Hello {
				request_id: env.request_id,
				client_name,
				auth_token,
				user,
			}),
			other => Err(anyhow!("expected hello as first frame, got {other:?}")),
		},
		None => Err(anyhow!("connection closed before hello")),
	}
}

fn resolve_user(hello: &Hello, hmac_secret: Option<&str>) -> anyhow::Result<UserId> {
	match hmac_secret {
		Some(secret) => {
			let claims = verify_token(hello.auth_token.trim(), secret)?;
			UserId::new(claims.sub).context("token sub is not a valid user id")
		}
		None => UserId::new(hello.user.trim()).context("hello carried no user id"),
	}
}

async fn send_frame(out_tx: &mpsc::Sender<ServerEnvelope>, request_id: String, frame: ServerFrame) -> anyhow::Result<()> {
	out_tx
		.send(ServerEnvelope {
			version: PROTOCOL_VERSION,
			request_id,
			frame,
		})
		.await
		.map_err(|_| anyhow!("connection output closed"))
}

/// Spawn (once per topic) a forwarder from the hub subscription into this
/// connection's outbound queue.
async fn ensure_room_task(
	conn_id: ConnectionId,
	topic: &Topic,
	user: &UserId,
	deps: &SessionDeps,
	out_tx: &mpsc::Sender<ServerEnvelope>,
	room_tasks: &mut HashMap<Topic, tokio::task::JoinHandle<()>>,
) {
	if room_tasks.contains_key(topic) {
		return;
	}

	let mut rx = deps.hub.subscribe_room(topic.clone(), user.clone()).await;
	let topic_for_task = topic.clone();
	let is_global = topic.is_global();
	let rooms = deps.rooms.clone();
	let tx = out_tx.clone();

	let handle = tokio::spawn(async move {
		while let Some(item) = rx.recv().await {
			let frame = match item {
				RoomHubItem::Event(env) => {
					// The global room mirrors scoped-topic traffic for
					// activity listeners. A connection joined to the topic
					// already gets the event from the topic's own room.
					if is_global && !env.topic.is_global() && rooms.is_member(conn_id, &env.topic).await {
						continue;
					}
					ServerFrame::Event(*env)
				}
				RoomHubItem::Lagged { dropped } => ServerFrame::Event(EventEnvelope {
					topic: topic_for_task.clone(),
					seq: Seq::ZERO,
					server_time_unix_ms: unix_ms_now(),
					event: Event::Lagged {
						dropped,
						detail: "subscriber queue overflowed; refresh required".to_string(),
					},
				}),
			};

			let env = ServerEnvelope {
				version: PROTOCOL_VERSION,
				request_id: String::new(),
				frame,
			};
			if tx.send(env).await.is_err() {
				break;
			}
		}
	});

	room_tasks.insert(topic.clone(), handle);
}

async fn unread_summary(
	deps: &SessionDeps,
	user: &UserId,
) -> anyhow::Result<std::collections::BTreeMap<Topic, u64>> {
	let mut topics = deps.directory.topics_for(user).await?;

	// A permissive dev-mode directory enumerates no memberships; fold in
	// the topics the user's live connections have joined so summaries
	// still cover the conversations they are in.
	for conn in deps.registry.connections_for(user).await {
		for topic in deps.rooms.topics_for_conn(conn).await {
			if !topics.contains(&topic) {
				topics.push(topic);
			}
		}
	}

	deps.unread.summary(user, &topics).await
}

/// Push a fresh authoritative summary to every live connection of the user.
async fn push_unread_summary(deps: &SessionDeps, user: &UserId) {
	match unread_summary(deps, user).await {
		Ok(counts) => {
			let env = ServerEnvelope {
				version: PROTOCOL_VERSION,
				request_id: String::new(),
				frame: ServerFrame::Event(EventEnvelope {
					topic: Topic::Global,
					seq: Seq::ZERO,
					server_time_unix_ms: unix_ms_now(),
					event: Event::UnreadSummary { counts },
				}),
			};

			let delivered = deps.registry.send_to_user(user, env).await;
			debug!(user = %user, delivered, "pushed unread summary");
		}
		Err(e) => {
			warn!(user = %user, error = %e, "failed to push unread summary");
		}
	}
}
