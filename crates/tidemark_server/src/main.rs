#![forbid(unsafe_code)]

mod config;
mod server;
mod util;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tidemark_domain::ConnectionId;
use tidemark_util::endpoint::TcpEndpoint;
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use crate::server::directory::{SharedDirectory, StaticDirectory};
use crate::server::health::{HealthState, spawn_health_server};
use crate::server::hub::{RoomHub, RoomHubConfig};
use crate::server::query::{QueryContext, spawn_query_server};
use crate::server::registry::ConnectionRegistry;
use crate::server::rooms::RoomRegistry;
use crate::server::router::BroadcastRouter;
use crate::server::session::{SessionDeps, SessionSettings, handle_session};
use crate::server::store::SyncStore;
use crate::server::typing::{TYPING_TTL, TypingTracker, spawn_typing_sweeper};
use crate::server::unread::UnreadAggregator;

fn usage_and_exit() -> ! {
	eprintln!(
		"Usage: tidemark_server [--bind tcp://host:port]\n\
\n\
Options:\n\
\t--bind    Bind endpoint (default: tcp://127.0.0.1:18310)\n\
\t         Format: tcp://host:port\n\
\t--help   Show this help\n\
"
	);
	std::process::exit(2)
}

fn parse_args() -> SocketAddr {
	let mut bind_endpoint = "tcp://127.0.0.1:18310".to_string();

	let mut it = std::env::args().skip(1);
	while let Some(arg) = it.next() {
		match arg.as_str() {
			"--help" | "-h" => usage_and_exit(),
			"--bind" | "--listen" => {
				let v = it.next().unwrap_or_else(|| usage_and_exit());
				if v.trim().is_empty() {
					eprintln!("--bind must be non-empty (expected tcp://host:port)");
					usage_and_exit();
				}
				bind_endpoint = v;
			}
			other => {
				eprintln!("Unknown argument: {other}");
				usage_and_exit();
			}
		}
	}

	let bind = TcpEndpoint::parse(&bind_endpoint).unwrap_or_else(|e| {
		eprintln!("{e}");
		usage_and_exit();
	});

	let addr: SocketAddr = bind.to_socket_addr_if_ip_literal().unwrap_or_else(|e| {
		eprintln!("{e}");
		usage_and_exit();
	});

	addr
}

fn init_tracing() {
	let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| "info,tidemark_server=debug".to_string());

	let otlp_endpoint = std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT")
		.ok()
		.map(|v| v.trim().to_string())
		.filter(|v| !v.is_empty());
	let base = tracing_subscriber::registry()
		.with(tracing_subscriber::EnvFilter::new(filter))
		.with(tracing_subscriber::fmt::layer().with_target(false));

	if let Some(endpoint) = otlp_endpoint {
		use opentelemetry::global;
		use opentelemetry::trace::TracerProvider as _;
		use opentelemetry_otlp::WithExportConfig;

		match opentelemetry_otlp::SpanExporter::builder()
			.with_tonic()
			.with_endpoint(endpoint.clone())
			.build()
		{
			Ok(exporter) => {
				let tracer_provider = opentelemetry_sdk::trace::SdkTracerProvider::builder()
					.with_batch_exporter(exporter)
					.build();
				let tracer = tracer_provider.tracer("tidemark_server");
				global::set_tracer_provider(tracer_provider);

				let otel_layer = tracing_opentelemetry::layer().with_tracer(tracer);
				base.with(otel_layer).init();
				info!(endpoint = %endpoint, "otlp tracing enabled");
			}
			Err(e) => {
				base.init();
				warn!(error = %e, "failed to initialize otlp tracing");
			}
		}
	} else {
		base.init();
	}
}

fn init_metrics(bind: Option<&str>) {
	let Some(bind) = bind else {
		return;
	};

	match bind.parse::<std::net::SocketAddr>() {
		Ok(addr) => {
			if let Err(e) = metrics_exporter_prometheus::PrometheusBuilder::new()
				.with_http_listener(addr)
				.install()
			{
				warn!(error = %e, "failed to start metrics exporter");
			} else {
				info!(%addr, "metrics exporter listening");
			}
		}
		Err(e) => {
			warn!(error = %e, %bind, "invalid metrics bind address (expected host:port)");
		}
	}
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
	init_tracing();

	let bind_addr = parse_args();

	let config_path = crate::config::default_config_path()?;
	let server_cfg = crate::config::load_server_config_from_path(&config_path)?;
	info!(path = %config_path.display(), "loaded server config (toml + env overrides)");

	init_metrics(server_cfg.server.metrics_bind.as_deref());

	let health_state = HealthState::new();
	if let Some(bind) = server_cfg.server.health_bind.as_deref() {
		match bind.parse::<std::net::SocketAddr>() {
			Ok(addr) => {
				spawn_health_server(addr, health_state.clone());
				info!(%addr, "health server listening");
			}
			Err(e) => warn!(error = %e, %bind, "invalid health bind address (expected host:port)"),
		}
	}

	let database_url = server_cfg.persistence.database_url.clone().unwrap_or_else(|| {
		warn!("no database_url configured; using in-memory sqlite (state lost on restart)");
		"sqlite::memory:".to_string()
	});
	let store = SyncStore::connect(&database_url).await?;

	let hub = RoomHub::new(RoomHubConfig {
		subscriber_queue_capacity: server_cfg
			.server
			.subscriber_queue_capacity
			.unwrap_or(RoomHubConfig::default().subscriber_queue_capacity),
		debug_logs: false,
	});
	let rooms = RoomRegistry::new();
	let registry = ConnectionRegistry::new(rooms.clone());
	let router = BroadcastRouter::new(hub.clone());
	let typing = TypingTracker::new(
		server_cfg
			.server
			.typing_ttl_ms
			.map(Duration::from_millis)
			.unwrap_or(TYPING_TTL),
	);
	let unread = UnreadAggregator::new(store.clone());

	// The group/membership directory is an external collaborator; until one
	// is wired in, any authenticated user may join any topic. Unread
	// summaries fall back to the topics a user's connections have joined
	// when the directory enumerates nothing.
	let directory: SharedDirectory = Arc::new(StaticDirectory::permissive());
	info!("membership directory: permissive in-process default");

	spawn_typing_sweeper(typing.clone(), router.clone());

	if let Some(bind) = server_cfg.server.query_bind.as_deref() {
		match bind.parse::<std::net::SocketAddr>() {
			Ok(addr) => {
				spawn_query_server(
					addr,
					QueryContext {
						store: store.clone(),
						unread: unread.clone(),
						directory: directory.clone(),
						auth_hmac_secret: server_cfg.server.auth_hmac_secret.clone(),
					},
				);
				info!(%addr, "query server listening");
			}
			Err(e) => warn!(error = %e, %bind, "invalid query bind address (expected host:port)"),
		}
	}

	let session_settings = SessionSettings {
		auth_hmac_secret: server_cfg.server.auth_hmac_secret.clone(),
		..SessionSettings::default()
	};

	let deps = SessionDeps {
		registry,
		rooms,
		hub,
		router,
		store,
		unread,
		typing,
		directory,
	};

	let listener = tokio::net::TcpListener::bind(bind_addr).await?;
	info!(bind = %bind_addr, "tidemark_server: listening");
	health_state.mark_ready();

	let mut next_conn_id: u64 = 1;

	loop {
		let (stream, remote) = listener.accept().await?;

		let conn_id = ConnectionId(next_conn_id);
		next_conn_id += 1;
		metrics::counter!("tidemark_server_connections_total").increment(1);
		info!(conn = %conn_id, remote = %remote, "accepted connection");

		let deps = deps.clone();
		let settings = session_settings.clone();
		tokio::spawn(async move {
			if let Err(e) = handle_session(conn_id, stream, deps, settings).await {
				warn!(conn = %conn_id, error = %e, "session handler exited with error");
			}
		});
	}
}
