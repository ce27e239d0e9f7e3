#![forbid(unsafe_code)]

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context as _, anyhow};
use parley_util::SecretString;
use serde::Deserialize;
use tracing::{info, warn};

/// Default config path: `~/.parley/config.toml`.
pub fn default_config_path() -> anyhow::Result<PathBuf> {
	let home = dirs::home_dir().ok_or_else(|| anyhow!("could not determine home directory"))?;
	Ok(home.join(".parley").join("config.toml"))
}

/// Load the server config from TOML and env overrides.
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
	pub hub: HubSettings,
	pub persistence: PersistenceSettings,
}

#[derive(Debug, Clone)]
pub struct ServerSettings {
	/// Name reported in `Welcome`.
	pub server_name: String,
	/// PEM-encoded certificate path for QUIC/TLS.
	pub tls_cert_path: Option<PathBuf>,
	/// PEM-encoded private key path for QUIC/TLS.
	pub tls_key_path: Option<PathBuf>,
	/// Optional metrics exporter bind address (host:port).
	pub metrics_bind: Option<String>,
	/// Optional health/readiness HTTP bind address (host:port).
	pub health_bind: Option<String>,
	/// HMAC secret for identity tokens. Without it the dev verifier is used.
	pub auth_hmac_secret: Option<SecretString>,
	/// Inbound event rate limiting: per-connection burst size.
	pub event_rate_limit_per_conn_burst: u32,
	/// Inbound event rate limiting: per-connection events per minute.
	pub event_rate_limit_per_conn_per_minute: u32,
	/// Bounded outbound queue per connection; full queues drop events.
	pub outbound_queue_capacity: usize,
	pub max_frame_bytes: usize,
}

impl Default for ServerSettings {
	fn default() -> Self {
		Self {
			server_name: "parley".to_string(),
			tls_cert_path: None,
			tls_key_path: None,
			metrics_bind: None,
			health_bind: None,
			auth_hmac_secret: None,
			event_rate_limit_per_conn_burst: 40,
			event_rate_limit_per_conn_per_minute: 1200,
			outbound_queue_capacity: 256,
			max_frame_bytes: parley_protocol::DEFAULT_MAX_FRAME_SIZE,
		}
	}
}

#[derive(Debug, Clone)]
pub struct HubSettings {
	/// How long a 1:1 call request may ring before it times out.
	pub ring_timeout: Duration,
	/// Number of stripes in each keyed lock table.
	pub lock_stripes: usize,
}

impl Default for HubSettings {
	fn default() -> Self {
		Self {
			ring_timeout: Duration::from_secs(30),
			lock_stripes: 64,
		}
	}
}

#[derive(Debug, Clone, Default)]
pub struct PersistenceSettings {
	/// Store messages in the database instead of memory.
	pub enabled: bool,
	/// Database URL (sqlite: or postgres:).
	pub database_url: Option<String>,
	/// Record call lifecycle rows (requires `database_url`).
	pub call_log_enabled: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileConfig {
	#[serde(default)]
	server: FileServerSettings,

	#[serde(default)]
	hub: FileHubSettings,

	#[serde(default)]
	persistence: FilePersistenceSettings,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileServerSettings {
	server_name: Option<String>,
	tls_cert_path: Option<String>,
	tls_key_path: Option<String>,
	metrics_bind: Option<String>,
	health_bind: Option<String>,
	auth_hmac_secret: Option<String>,
	event_rate_limit_per_conn_burst: Option<u32>,
	event_rate_limit_per_conn_per_minute: Option<u32>,
	outbound_queue_capacity: Option<usize>,
	max_frame_bytes: Option<usize>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileHubSettings {
	ring_timeout_secs: Option<u64>,
	lock_stripes: Option<usize>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FilePersistenceSettings {
	enabled: Option<bool>,
	database_url: Option<String>,
	call_log_enabled: Option<bool>,
}

fn non_blank(s: Option<String>) -> Option<String> {
	s.filter(|s| !s.trim().is_empty())
}

impl ServerConfig {
	fn from_file(file: FileConfig) -> Self {
		let defaults = ServerSettings::default();
		let hub_defaults = HubSettings::default();

		Self {
			server: ServerSettings {
				server_name: non_blank(file.server.server_name).unwrap_or(defaults.server_name),
				tls_cert_path: non_blank(file.server.tls_cert_path).map(PathBuf::from),
				tls_key_path: non_blank(file.server.tls_key_path).map(PathBuf::from),
				metrics_bind: non_blank(file.server.metrics_bind),
				health_bind: non_blank(file.server.health_bind),
				auth_hmac_secret: non_blank(file.server.auth_hmac_secret).map(SecretString::new),
				event_rate_limit_per_conn_burst: file
					.server
					.event_rate_limit_per_conn_burst
					.unwrap_or(defaults.event_rate_limit_per_conn_burst),
				event_rate_limit_per_conn_per_minute: file
					.server
					.event_rate_limit_per_conn_per_minute
					.unwrap_or(defaults.event_rate_limit_per_conn_per_minute),
				outbound_queue_capacity: file
					.server
					.outbound_queue_capacity
					.filter(|c| *c > 0)
					.unwrap_or(defaults.outbound_queue_capacity),
				max_frame_bytes: file
					.server
					.max_frame_bytes
					.filter(|c| *c > 0)
					.unwrap_or(defaults.max_frame_bytes),
			},
			hub: HubSettings {
				ring_timeout: file
					.hub
					.ring_timeout_secs
					.filter(|s| *s > 0)
					.map(Duration::from_secs)
					.unwrap_or(hub_defaults.ring_timeout),
				lock_stripes: file
					.hub
					.lock_stripes
					.filter(|s| *s > 0)
					.unwrap_or(hub_defaults.lock_stripes),
			},
			persistence: PersistenceSettings {
				enabled: file.persistence.enabled.unwrap_or(false),
				database_url: non_blank(file.persistence.database_url),
				call_log_enabled: file.persistence.call_log_enabled.unwrap_or(false),
			},
		}
	}
}

fn parse_env_bool(v: &str) -> Option<bool> {
	match v.trim().to_ascii_lowercase().as_str() {
		"1" | "true" | "yes" | "on" => Some(true),
		"0" | "false" | "no" | "off" => Some(false),
		_ => None,
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

fn env_non_blank(key: &str) -> Option<String> {
	std::env::var(key).ok().map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

fn apply_env_overrides(cfg: &mut ServerConfig) {
	if let Some(v) = env_non_blank("PARLEY_SERVER_NAME") {
		cfg.server.server_name = v;
		info!("server config: server_name overridden by env");
	}

	if let Some(v) = env_non_blank("PARLEY_SERVER_TLS_CERT") {
		cfg.server.tls_cert_path = Some(PathBuf::from(v));
		info!("server config: tls_cert_path overridden by env");
	}

	if let Some(v) = env_non_blank("PARLEY_SERVER_TLS_KEY") {
		cfg.server.tls_key_path = Some(PathBuf::from(v));
		info!("server config: tls_key_path overridden by env");
	}

	if let Some(v) = env_non_blank("PARLEY_SERVER_AUTH_HMAC_SECRET") {
		cfg.server.auth_hmac_secret = Some(SecretString::new(v));
		info!("server auth: auth_hmac_secret overridden by env");
	}

	if let Some(v) = env_non_blank("PARLEY_METRICS_BIND") {
		cfg.server.metrics_bind = Some(v);
		info!("server config: metrics_bind overridden by env");
	}

	if let Some(v) = env_non_blank("PARLEY_HEALTH_BIND") {
		cfg.server.health_bind = Some(v);
		info!("server config: health_bind overridden by env");
	}

	if let Ok(v) = std::env::var("PARLEY_EVENT_RATE_LIMIT_PER_CONN_BURST")
		&& let Ok(burst) = v.trim().parse::<u32>()
	{
		cfg.server.event_rate_limit_per_conn_burst = burst;
		info!(burst, "server config: event_rate_limit_per_conn_burst overridden by env");
	}

	if let Ok(v) = std::env::var("PARLEY_EVENT_RATE_LIMIT_PER_CONN_PER_MINUTE")
		&& let Ok(rate) = v.trim().parse::<u32>()
	{
		cfg.server.event_rate_limit_per_conn_per_minute = rate;
		info!(rate, "server config: event_rate_limit_per_conn_per_minute overridden by env");
	}

	if let Ok(v) = std::env::var("PARLEY_OUTBOUND_QUEUE_CAPACITY")
		&& let Ok(capacity) = v.trim().parse::<usize>()
		&& capacity > 0
	{
		cfg.server.outbound_queue_capacity = capacity;
		info!(capacity, "server config: outbound_queue_capacity overridden by env");
	}

	if let Ok(v) = std::env::var("PARLEY_RING_TIMEOUT_SECS")
		&& let Ok(secs) = v.trim().parse::<u64>()
		&& secs > 0
	{
		cfg.hub.ring_timeout = Duration::from_secs(secs);
		info!(secs, "hub config: ring_timeout overridden by env");
	}

	if let Ok(v) = std::env::var("PARLEY_LOCK_STRIPES")
		&& let Ok(stripes) = v.trim().parse::<usize>()
		&& stripes > 0
	{
		cfg.hub.lock_stripes = stripes;
		info!(stripes, "hub config: lock_stripes overridden by env");
	}

	if let Ok(v) = std::env::var("PARLEY_PERSISTENCE_ENABLED")
		&& let Some(enabled) = parse_env_bool(&v)
	{
		cfg.persistence.enabled = enabled;
		info!(enabled, "persistence: enabled overridden by env");
	}

	if let Some(v) = env_non_blank("PARLEY_PERSISTENCE_DATABASE_URL") {
		cfg.persistence.database_url = Some(v);
		info!("persistence: database_url overridden by env");
	}

	if let Ok(v) = std::env::var("PARLEY_CALL_LOG_ENABLED")
		&& let Some(enabled) = parse_env_bool(&v)
	{
		cfg.persistence.call_log_enabled = enabled;
		info!(enabled, "persistence: call_log_enabled overridden by env");
	}

	if cfg.server.auth_hmac_secret.is_none() {
		warn!("server auth: no auth_hmac_secret configured; using dev identity verifier");
	}

	if cfg.server.tls_cert_path.is_some() != cfg.server.tls_key_path.is_some() {
		warn!("server config: tls_cert_path and tls_key_path must both be set; falling back to dev cert");
		cfg.server.tls_cert_path = None;
		cfg.server.tls_key_path = None;
	}
}
