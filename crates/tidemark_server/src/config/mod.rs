#![forbid(unsafe_code)]

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context as _, anyhow};
use serde::Deserialize;
use tracing::info;

/// Default config path: `~/.tidemark/config.toml`.
pub fn default_config_path() -> anyhow::Result<PathBuf> {
	let home = dirs::home_dir().ok_or_else(|| anyhow!("could not determine home directory"))?;
	Ok(home.join(".tidemark").join("config.toml"))
}

/// Load the server config from TOML and env overrides.
#[allow(dead_code)]
pub fn load_server_config() -> anyhow::Result<ServerConfig> {
	let path = default_config_path()?;
	load_server_config_from_path(&path)
}

/// Same as `load_server_config` but with an explicit config path.
pub fn load_server_config_from_path(path: &Path) -> anyhow::Result<ServerConfig> {
	let file_cfg = read_toml_if_exists(path)
		.with_context(|| format!("read config from {}", path.display()))?
		.unwrap_or_default();

	let mut cfg = ServerConfig::from_file(file_cfg);

	apply_env_overrides(&mut cfg);

	Ok(cfg)
}

/// Server config (v1).
#[derive(Debug, Clone, Default)]
pub struct ServerConfig {
	pub server: ServerSettings,
	pub persistence: PersistenceSettings,
}

/// Server settings loaded by the server.
#[derive(Debug, Clone, Default)]
pub struct ServerSettings {
	/// Optional metrics exporter bind address (host:port).
	pub metrics_bind: Option<String>,
	/// Optional health/readiness HTTP bind address (host:port).
	pub health_bind: Option<String>,
	/// Optional HTTP query surface bind address (host:port).
	pub query_bind: Option<String>,
	/// HMAC secret for stateless access tokens.
	pub auth_hmac_secret: Option<String>,
	/// Per-subscriber event queue capacity for room fan-out.
	pub subscriber_queue_capacity: Option<usize>,
	/// Typing TTL override in milliseconds.
	pub typing_ttl_ms: Option<u64>,
}

/// Persistence settings loaded by the server.
#[derive(Debug, Clone, Default)]
pub struct PersistenceSettings {
	/// Database URL (sqlite: or postgres:).
	pub database_url: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileConfig {
	#[serde(default)]
	server: FileServerSettings,

	#[serde(default)]
	persistence: FilePersistenceSettings,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileServerSettings {
	metrics_bind: Option<String>,
	health_bind: Option<String>,
	query_bind: Option<String>,
	auth_hmac_secret: Option<String>,
	subscriber_queue_capacity: Option<usize>,
	typing_ttl_ms: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FilePersistenceSettings {
	database_url: Option<String>,
}

impl ServerConfig {
	fn from_file(file: FileConfig) -> Self {
		Self {
			server: ServerSettings {
				metrics_bind: file.server.metrics_bind.filter(|s| !s.trim().is_empty()),
				health_bind: file.server.health_bind.filter(|s| !s.trim().is_empty()),
				query_bind: file.server.query_bind.filter(|s| !s.trim().is_empty()),
				auth_hmac_secret: file.server.auth_hmac_secret.filter(|s| !s.trim().is_empty()),
				subscriber_queue_capacity: file.server.subscriber_queue_capacity,
				typing_ttl_ms: file.server.typing_ttl_ms.filter(|v| *v > 0),
			},
			persistence: PersistenceSettings {
				database_url: file.persistence.database_url.filter(|s| !s.trim().is_empty()),
			},
		}
	}
}

fn read_toml_if_exists(path: &Path) -> anyhow::Result<Option<FileConfig>> {
	match fs::read_to_string(path) {
		Ok(s) => {
			let cfg: FileConfig = toml::from_str(&s).context("parse TOML")?;
			Ok(Some(cfg))
		}
		Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
		Err(e) => Err(anyhow!(e).context("read config file")),
	}
}

fn apply_env_overrides(cfg: &mut ServerConfig) {
	if let Ok(v) = std::env::var("TIDEMARK_METRICS_BIND") {
		let v = v.trim().to_string();
		if !v.is_empty() {
			cfg.server.metrics_bind = Some(v);
			info!("server config: metrics_bind overridden by env");
		}
	}

	if let Ok(v) = std::env::var("TIDEMARK_HEALTH_BIND") {
		let v = v.trim().to_string();
		if !v.is_empty() {
			cfg.server.health_bind = Some(v);
			info!("server config: health_bind overridden by env");
		}
	}

	if let Ok(v) = std::env::var("TIDEMARK_QUERY_BIND") {
		let v = v.trim().to_string();
		if !v.is_empty() {
			cfg.server.query_bind = Some(v);
			info!("server config: query_bind overridden by env");
		}
	}

	if let Ok(v) = std::env::var("TIDEMARK_AUTH_HMAC_SECRET") {
		let v = v.trim().to_string();
		if !v.is_empty() {
			cfg.server.auth_hmac_secret = Some(v);
			info!("server auth: auth_hmac_secret overridden by env");
		}
	}

	if let Ok(v) = std::env::var("TIDEMARK_SUBSCRIBER_QUEUE_CAPACITY")
		&& let Ok(capacity) = v.trim().parse::<usize>()
	{
		cfg.server.subscriber_queue_capacity = Some(capacity);
		info!(capacity, "server config: subscriber_queue_capacity overridden by env");
	}

	if let Ok(v) = std::env::var("TIDEMARK_TYPING_TTL_MS")
		&& let Ok(ttl_ms) = v.trim().parse::<u64>()
		&& ttl_ms > 0
	{
		cfg.server.typing_ttl_ms = Some(ttl_ms);
		info!(ttl_ms, "server config: typing_ttl_ms overridden by env");
	}

	if let Ok(v) = std::env::var("TIDEMARK_DATABASE_URL") {
		let v = v.trim().to_string();
		if !v.is_empty() {
			cfg.persistence.database_url = Some(v);
			info!("persistence: database_url overridden by env");
		}
	}
}
