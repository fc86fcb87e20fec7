#![forbid(unsafe_code)]

use std::net::SocketAddr;
use std::sync::{Arc, OnceLock};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::{Context as _, anyhow};
use bytes::BytesMut;
use tidemark_client_core::{ClientConfig, Session};
use tidemark_domain::{Message, MessageId, Seq, Topic, UserId};
use tidemark_protocol::framing::{DEFAULT_MAX_FRAME_SIZE, encode_frame, try_decode_frame_from_buffer};
use tidemark_protocol::{
	ClientEnvelope, ClientFrame, Event, EventEnvelope, JoinStatus, PROTOCOL_VERSION, SendStatus, ServerEnvelope,
	ServerFrame,
};
use tokio::io::{AsyncReadExt as _, AsyncWriteExt as _};
use tokio::net::TcpListener;
use tokio::sync::{RwLock, mpsc, oneshot};

static LOG_INIT: OnceLock<()> = OnceLock::new();

fn init_test_logging() {
	LOG_INIT.get_or_init(|| {
		if std::env::var_os("TIDEMARK_TEST_LOG").is_none() {
			return;
		}

		let _ = tracing_subscriber::fmt()
			.with_env_filter(std::env::var("RUST_LOG").unwrap_or_else(|_| "debug".to_string()))
			.with_target(false)
			.try_init();
	});
}

#[derive(Debug, Default)]
struct GlobalState {
	joined: bool,
	marked_read: bool,
}

fn unix_ms_now() -> i64 {
	SystemTime::now()
		.duration_since(UNIX_EPOCH)
		.unwrap_or(Duration::from_secs(0))
		.as_millis() as i64
}

fn topic(s: &str) -> Topic {
	Topic::parse(s).expect("valid topic")
}

fn user(s: &str) -> UserId {
	UserId::new(s).expect("valid user id")
}

async fn send_envelope(stream: &mut tokio::net::tcp::OwnedWriteHalf, env: ServerEnvelope) -> anyhow::Result<()> {
	let frame = encode_frame(&env, DEFAULT_MAX_FRAME_SIZE).map_err(|e| anyhow!(e))?;
	stream.write_all(&frame).await.context("write frame")?;
	stream.flush().await.context("flush frame")?;
	Ok(())
}

fn event_envelope(t: &Topic, seq: Seq, event: Event) -> ServerEnvelope {
	ServerEnvelope {
		version: PROTOCOL_VERSION,
		request_id: String::new(),
		frame: ServerFrame::Event(EventEnvelope {
			topic: t.clone(),
			seq,
			server_time_unix_ms: unix_ms_now(),
			event,
		}),
	}
}

/// Minimal in-test server speaking the framed session protocol: hello,
/// join, send with a pushed message event, mark-read with a pushed
/// unread summary. Exercises the real client core over real TCP.
async fn run_minimal_server(
	listener: TcpListener,
	state: Arc<RwLock<GlobalState>>,
	ready_tx: oneshot::Sender<SocketAddr>,
) -> anyhow::Result<()> {
	init_test_logging();

	let local_addr = listener.local_addr().context("server local_addr")?;
	tracing::info!(?local_addr, "server: listener bound");
	let _ = ready_tx.send(local_addr);

	let (stream, remote) = listener.accept().await.context("accept tcp connection")?;
	tracing::info!(%remote, "server: accepted connection");

	let (mut read_half, mut write_half) = stream.into_split();

	let (tx, mut rx) = mpsc::unbounded_channel::<ClientEnvelope>();
	let reader = tokio::spawn(async move {
		let mut buf = BytesMut::with_capacity(16 * 1024);

		loop {
			loop {
				match try_decode_frame_from_buffer::<ClientEnvelope>(&mut buf, DEFAULT_MAX_FRAME_SIZE) {
					Ok(Some(env)) => {
						if tx.send(env).is_err() {
							return Ok::<(), anyhow::Error>(());
						}
					}
					Ok(None) => break,
					Err(e) => return Err(anyhow!(e).context("decode client frame failed")),
				}
			}

			let n = read_half.read_buf(&mut buf).await.context("read failed")?;
			if n == 0 {
				return Ok(());
			}
		}
	});

	tracing::debug!("server: waiting for Hello");
	let hello_request_id = loop {
		let env = rx.recv().await.ok_or_else(|| anyhow!("no Hello received"))?;
		if let ClientFrame::Hello { client_name, user, .. } = env.frame {
			tracing::info!(%client_name, %user, "server: received Hello");
			break env.request_id;
		}
	};

	let alice = user("alice");

	send_envelope(
		&mut write_half,
		ServerEnvelope {
			version: PROTOCOL_VERSION,
			request_id: hello_request_id,
			frame: ServerFrame::Welcome {
				server_name: "tidemark-server-test".to_string(),
				server_instance_id: "test-instance".to_string(),
				server_time_unix_ms: unix_ms_now(),
				max_frame_bytes: DEFAULT_MAX_FRAME_SIZE as u32,
				user: alice.clone(),
			},
		},
	)
	.await
	.context("send Welcome")?;
	tracing::info!("server: sent Welcome");

	tracing::debug!("server: waiting for Join");
	let joined_topic = loop {
		let env = rx.recv().await.ok_or_else(|| anyhow!("no Join received"))?;
		if let ClientFrame::Join { topic } = env.frame {
			{
				let mut st = state.write().await;
				st.joined = true;
			}

			send_envelope(
				&mut write_half,
				ServerEnvelope {
					version: PROTOCOL_VERSION,
					request_id: env.request_id,
					frame: ServerFrame::Joined {
						topic: topic.clone(),
						status: JoinStatus::Ok,
						latest_seq: Seq::ZERO,
						detail: String::new(),
					},
				},
			)
			.await
			.context("send Joined")?;

			tracing::info!(%topic, "server: processed Join");
			break topic;
		}
	};

	tracing::debug!("server: waiting for Send");
	let (send_request_id, body) = loop {
		let env = rx.recv().await.ok_or_else(|| anyhow!("no Send received"))?;
		if let ClientFrame::Send { body, .. } = env.frame {
			break (env.request_id, body);
		}
	};

	let message_id = MessageId::new_v4();
	send_envelope(
		&mut write_half,
		ServerEnvelope {
			version: PROTOCOL_VERSION,
			request_id: send_request_id,
			frame: ServerFrame::SendResult {
				status: SendStatus::Ok,
				message_id: Some(message_id),
				seq: Some(Seq(1)),
				detail: String::new(),
			},
		},
	)
	.await
	.context("send SendResult")?;

	// Pushed immediately so it is in flight while the client performs
	// its next request; the client must buffer it.
	let message = Message {
		id: message_id,
		topic: joined_topic.clone(),
		sender: alice.clone(),
		body,
		attachments: Vec::new(),
		quoted_message_id: None,
		quoted_text: None,
		seq: Seq(1),
		created_at_unix_ms: unix_ms_now(),
	};
	send_envelope(
		&mut write_half,
		event_envelope(&joined_topic, Seq(1), Event::MessageNew { message }),
	)
	.await
	.context("send message event")?;
	tracing::info!("server: sent SendResult and message event");

	tracing::debug!("server: waiting for MarkRead");
	let (mark_request_id, up_to) = loop {
		let env = rx.recv().await.ok_or_else(|| anyhow!("no MarkRead received"))?;
		if let ClientFrame::MarkRead { up_to, .. } = env.frame {
			break (env.request_id, up_to);
		}
	};

	{
		let mut st = state.write().await;
		st.marked_read = true;
	}

	send_envelope(
		&mut write_half,
		ServerEnvelope {
			version: PROTOCOL_VERSION,
			request_id: mark_request_id,
			frame: ServerFrame::MarkReadResult {
				topic: joined_topic.clone(),
				watermark: up_to,
				applied: true,
			},
		},
	)
	.await
	.context("send MarkReadResult")?;

	let counts = std::collections::BTreeMap::from([(joined_topic.clone(), 0u64)]);
	send_envelope(
		&mut write_half,
		event_envelope(&Topic::Global, Seq::ZERO, Event::UnreadSummary { counts }),
	)
	.await
	.context("send unread summary event")?;
	tracing::info!("server: sent MarkReadResult and unread summary");

	let _ = write_half.shutdown().await;

	match reader.await {
		Ok(Ok(())) => {}
		Ok(Err(e)) => {
			tracing::debug!(error = %e, "server: reader ended (expected during shutdown)");
		}
		Err(join_err) => {
			tracing::debug!(error = %join_err, "server: reader task join error (ignored in smoke test)");
		}
	}

	Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn tcp_smoke_client_sends_reads_and_receives_events() -> anyhow::Result<()> {
	init_test_logging();

	let listener = TcpListener::bind("127.0.0.1:0").await.context("bind listener")?;

	let state = Arc::new(RwLock::new(GlobalState::default()));
	let (ready_tx, ready_rx) = oneshot::channel::<SocketAddr>();

	let server_state = Arc::clone(&state);
	let server_task = tokio::spawn(async move { run_minimal_server(listener, server_state, ready_tx).await });

	let server_addr = ready_rx.await.context("server ready")?;
	tracing::info!(?server_addr, "client(test): server ready");

	let cfg = ClientConfig {
		server_host: "127.0.0.1".to_string(),
		server_port: server_addr.port(),
		server_addr: Some(server_addr),
		client_name: "tidemark-test-client".to_string(),
		client_instance_id: "test-instance".to_string(),
		user: Some("alice".to_string()),
		..ClientConfig::default()
	};

	let (mut session, welcome) = Session::connect(cfg).await.context("client connect")?;
	assert_eq!(welcome.server_name, "tidemark-server-test");
	assert_eq!(session.user(), &user("alice"));

	let t = topic("dm:smoke");
	let joined = session.join(t.clone()).await.context("join")?;
	assert_eq!(joined.topic, t);
	assert_eq!(joined.latest_seq, Seq::ZERO);

	let receipt = session
		.send_message(t.clone(), "synthetic smoke-test message", None, None)
		.await
		.context("send message")?;
	assert_eq!(receipt.seq, Seq(1));

	// The message event was pushed before this request's response; the
	// mark-read roundtrip must buffer it rather than lose it.
	let ack = session.mark_read(t.clone(), Seq(1)).await.context("mark read")?;
	assert!(ack.applied);
	assert_eq!(ack.watermark, Seq(1));

	let ev = tokio::time::timeout(Duration::from_secs(5), session.next_event())
		.await
		.context("timeout waiting for message event")?
		.context("next event")?;
	assert_eq!(ev.topic, t);
	assert_eq!(ev.seq, Seq(1));
	match ev.event {
		Event::MessageNew { message } => {
			assert_eq!(message.id, receipt.message_id);
			assert_eq!(message.sender, user("alice"));
			assert_eq!(message.body, "synthetic smoke-test message");
		}
		other => panic!("expected MessageNew event, got: {other:?}"),
	}

	let summary = tokio::time::timeout(Duration::from_secs(5), session.next_event())
		.await
		.context("timeout waiting for unread summary")?
		.context("next event")?;
	match summary.event {
		Event::UnreadSummary { counts } => {
			assert_eq!(counts.get(&t).copied(), Some(0));
		}
		other => panic!("expected UnreadSummary event, got: {other:?}"),
	}

	{
		let st = state.read().await;
		assert!(st.joined, "server should have processed Join");
		assert!(st.marked_read, "server should have processed MarkRead");
	}

	let _ = session.close().await;

	let server_res = server_task.await.context("server join")?;
	server_res.context("server run")?;

	Ok(())
}
