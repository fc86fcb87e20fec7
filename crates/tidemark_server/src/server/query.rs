#![forbid(unsafe_code)]

use std::net::SocketAddr;

use bytes::Bytes;
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use serde::Serialize;
use tidemark_domain::{Seq, Topic, UserId};
use tidemark_protocol::{ConversationEntry, ConversationList, MessageHistory};
use tokio::net::TcpListener;
use tracing::warn;

use crate::server::auth::verify_token;
use crate::server::directory::SharedDirectory;
use crate::server::store::SyncStore;
use crate::server::unread::UnreadAggregator;

const DEFAULT_PAGE_LIMIT: u32 = 200;
const MAX_PAGE_LIMIT: u32 = 1000;

/// Read-only HTTP surface for authoritative state. All endpoints are
/// idempotent and safe to poll.
#[derive(Clone)]
pub struct QueryContext {
	pub store: SyncStore,
	pub unread: UnreadAggregator,
	pub directory: SharedDirectory,

	/// When set, requests must carry a `Bearer` token; the caller identity
	/// comes from the token's `sub` claim. Without it the `user` query
	/// parameter is trusted (dev mode).
	pub auth_hmac_secret: Option<String>,
}

pub fn spawn_query_server(bind: SocketAddr, ctx: QueryContext) {
	tokio::spawn(async move {
		if let Err(err) = run_query_server(bind, ctx).await {
			warn!(error = %err, "query server stopped");
		}
	});
}

async fn run_query_server(bind: SocketAddr, ctx: QueryContext) -> anyhow::Result<()> {
	let listener = TcpListener::bind(bind).await?;
	loop {
		let (stream, _addr) = listener.accept().await?;
		let io = TokioIo::new(stream);
		let ctx = ctx.clone();
		tokio::spawn(async move {
			let service = service_fn(move |req| handle_query(req, ctx.clone()));
			if let Err(err) = http1::Builder::new().serve_connection(io, service).await {
				warn!(error = %err, "query connection error");
			}
		});
	}
}

async fn handle_query(req: Request<Incoming>, ctx: QueryContext) -> Result<Response<Full<Bytes>>, hyper::Error> {
	if req.method() != Method::GET {
		return Ok(text_response(StatusCode::METHOD_NOT_ALLOWED, ""));
	}

	let user = match resolve_query_user(&req, &ctx) {
		Ok(user) => user,
		Err((status, detail)) => return Ok(text_response(status, detail)),
	};

	match req.uri().path() {
		"/conversations" => Ok(handle_conversations(&ctx, &user).await),
		"/messages" => {
			let query = req.uri().query().unwrap_or("").to_string();
			Ok(handle_messages(&ctx, &user, &query).await)
		}
		_ => Ok(text_response(StatusCode::NOT_FOUND, "")),
	}
}

async fn handle_conversations(ctx: &QueryContext, user: &UserId) -> Response<Full<Bytes>> {
	let topics = match ctx.directory.topics_for(user).await {
		Ok(topics) => topics,
		Err(e) => {
			warn!(user = %user, error = %e, "directory lookup failed");
			return text_response(StatusCode::INTERNAL_SERVER_ERROR, "internal error");
		}
	};

	let mut conversations = Vec::with_capacity(topics.len());
	for topic in topics {
		if topic.is_global() {
			continue;
		}

		let unread = match ctx.unread.unread_for(user, &topic).await {
			Ok(n) => n,
			Err(e) => {
				warn!(user = %user, topic = %topic, error = %e, "unread lookup failed");
				return text_response(StatusCode::INTERNAL_SERVER_ERROR, "internal error");
			}
		};
		let latest_seq = match ctx.store.latest_seq(&topic).await {
			Ok(seq) => seq,
			Err(e) => {
				warn!(topic = %topic, error = %e, "latest_seq lookup failed");
				return text_response(StatusCode::INTERNAL_SERVER_ERROR, "internal error");
			}
		};

		conversations.push(ConversationEntry {
			topic,
			unread,
			latest_seq,
		});
	}

	json_response(StatusCode::OK, &ConversationList { conversations })
}

async fn handle_messages(ctx: &QueryContext, user: &UserId, query: &str) -> Response<Full<Bytes>> {
	let Some(topic_s) = query_param(query, "topic") else {
		return text_response(StatusCode::BAD_REQUEST, "missing topic parameter");
	};
	let Ok(topic) = Topic::parse(&topic_s) else {
		return text_response(StatusCode::BAD_REQUEST, "invalid topic");
	};

	let since = query_param(query, "since")
		.and_then(|v| v.parse::<u64>().ok())
		.map(Seq)
		.unwrap_or(Seq::ZERO);
	let limit = query_param(query, "limit")
		.and_then(|v| v.parse::<u32>().ok())
		.unwrap_or(DEFAULT_PAGE_LIMIT)
		.min(MAX_PAGE_LIMIT);

	match ctx.directory.can_access(user, &topic).await {
		Ok(true) => {}
		Ok(false) => return text_response(StatusCode::FORBIDDEN, "not a member of this topic"),
		Err(e) => {
			warn!(user = %user, topic = %topic, error = %e, "directory lookup failed");
			return text_response(StatusCode::INTERNAL_SERVER_ERROR, "internal error");
		}
	}

	let messages = match ctx.store.messages_since(&topic, since, limit).await {
		Ok(messages) => messages,
		Err(e) => {
			warn!(topic = %topic, error = %e, "message listing failed");
			return text_response(StatusCode::INTERNAL_SERVER_ERROR, "internal error");
		}
	};
	let latest_seq = match ctx.store.latest_seq(&topic).await {
		Ok(seq) => seq,
		Err(e) => {
			warn!(topic = %topic, error = %e, "latest_seq lookup failed");
			return text_response(StatusCode::INTERNAL_SERVER_ERROR, "internal error");
		}
	};

	json_response(
		StatusCode::OK,
		&MessageHistory {
			topic,
			messages,
			latest_seq,
		},
	)
}

fn resolve_query_user(req: &Request<Incoming>, ctx: &QueryContext) -> Result<UserId, (StatusCode, &'static str)> {
	match ctx.auth_hmac_secret.as_deref() {
		Some(secret) => {
			let header = req
				.headers()
				.get(hyper::header::AUTHORIZATION)
				.and_then(|v| v.to_str().ok())
				.unwrap_or("");
			let token = header.strip_prefix("Bearer ").unwrap_or("").trim();

			let claims = verify_token(token, secret).map_err(|_| (StatusCode::UNAUTHORIZED, "invalid token"))?;
			UserId::new(claims.sub).map_err(|_| (StatusCode::UNAUTHORIZED, "invalid token subject"))
		}
		None => {
			let query = req.uri().query().unwrap_or("");
			let user = query_param(query, "user").unwrap_or_default();
			UserId::new(user).map_err(|_| (StatusCode::BAD_REQUEST, "missing user parameter"))
		}
	}
}

fn query_param(query: &str, key: &str) -> Option<String> {
	query.split('&').find_map(|pair| {
		let (k, v) = pair.split_once('=')?;
		(k == key).then(|| percent_decode(v))
	})
}

/// Decode `%XX` escapes and `+`-encoded spaces. Malformed escapes are kept
/// verbatim rather than rejected.
fn percent_decode(value: &str) -> String {
	let bytes = value.as_bytes();
	let mut out = Vec::with_capacity(bytes.len());

	let mut i = 0;
	while i < bytes.len() {
		if bytes[i] == b'+' {
			out.push(b' ');
			i += 1;
			continue;
		}

		if bytes[i] == b'%' && i + 2 < bytes.len() {
			if let (Some(hi), Some(lo)) = (hex_digit(bytes[i + 1]), hex_digit(bytes[i + 2])) {
				out.push(hi << 4 | lo);
				i += 3;
				continue;
			}
		}

		out.push(bytes[i]);
		i += 1;
	}

	String::from_utf8_lossy(&out).into_owned()
}

fn hex_digit(b: u8) -> Option<u8> {
	match b {
		b'0'..=b'9' => Some(b - b'0'),
		b'a'..=b'f' => Some(b - b'a' + 10),
		b'A'..=b'F' => Some(b - b'A' + 10),
		_ => None,
	}
}

fn json_response<T: Serialize>(status: StatusCode, body: &T) -> Response<Full<Bytes>> {
	match serde_json::to_vec(body) {
		Ok(bytes) => Response::builder()
			.status(status)
			.header(hyper::header::CONTENT_TYPE, "application/json")
			.body(Full::new(Bytes::from(bytes)))
			.unwrap(),
		Err(e) => {
			warn!(error = %e, "failed to serialize response body");
			text_response(StatusCode::INTERNAL_SERVER_ERROR, "internal error")
		}
	}
}

fn text_response(status: StatusCode, body: &'static str) -> Response<Full<Bytes>> {
	Response::builder()
		.status(status)
		.body(Full::new(Bytes::from_static(body.as_bytes())))
		.unwrap()
}
