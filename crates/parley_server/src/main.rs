#![forbid(unsafe_code)]

mod config;
mod hub;
mod quic;
mod server;
mod store;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::anyhow;
use parley_util::endpoint::QuicEndpoint;
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use crate::config::ServerConfig;
use crate::hub::Hub;
use crate::quic::config::QuicServerConfig;
use crate::server::call_log::CallLog;
use crate::server::connection::{ConnectionSettings, handle_connection};
use crate::server::health::{HealthState, spawn_health_server};
use crate::server::identity::{DevIdentityVerifier, HmacIdentityVerifier, IdentityClaims, IdentityVerifier};
use crate::store::{InMemoryMessageStore, MessageStore, SqlMessageStore, SqlPool};

/// Lifetime of tokens printed by `--mint-token`.
const DEFAULT_TOKEN_TTL_SECS: u64 = 24 * 60 * 60;

fn usage_and_exit() -> ! {
	eprintln!(
		"Usage: parley_server [--bind quic://host:port] [--config path] [--mint-token user[:name]]\n\
\n\
Options:\n\
\t--bind        Bind endpoint (default: quic://127.0.0.1:18420)\n\
\t             Format: quic://host:port\n\
\t--config      Config file (default: ~/.parley/config.toml)\n\
\t--mint-token  Print an identity token signed with the configured secret and exit\n\
\t--help       Show this help\n\
"
	);
	std::process::exit(2)
}

struct Args {
	bind: SocketAddr,
	config_path: Option<PathBuf>,
	mint_token: Option<String>,
}

fn parse_args() -> Args {
	let mut bind_endpoint = "quic://127.0.0.1:18420".to_string();
	let mut config_path = None;
	let mut mint_token = None;

	let mut it = std::env::args().skip(1);
	while let Some(arg) = it.next() {
		match arg.as_str() {
			"--help" | "-h" => usage_and_exit(),
			"--bind" | "--listen" => {
				let v = it.next().unwrap_or_else(|| usage_and_exit());
				if v.trim().is_empty() {
					eprintln!("--bind must be non-empty (expected quic://host:port)");
					usage_and_exit();
				}
				bind_endpoint = v;
			}
			"--config" => {
				let v = it.next().unwrap_or_else(|| usage_and_exit());
				config_path = Some(PathBuf::from(v));
			}
			"--mint-token" => {
				mint_token = Some(it.next().unwrap_or_else(|| usage_and_exit()));
			}
			other => {
				eprintln!("Unknown argument: {other}");
				usage_and_exit();
			}
		}
	}

	let bind = QuicEndpoint::parse(&bind_endpoint).unwrap_or_else(|e| {
		eprintln!("{e}");
		usage_and_exit();
	});

	let bind = bind.to_socket_addr_if_ip_literal().unwrap_or_else(|e| {
		eprintln!("{e}");
		usage_and_exit();
	});

	Args {
		bind,
		config_path,
		mint_token,
	}
}

fn init_rustls_crypto_provider() {
	let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();
}

fn init_tracing() {
	let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| "info,parley_server=debug".to_string());

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
				let tracer = tracer_provider.tracer("parley_server");
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

	match bind.parse::<SocketAddr>() {
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

/// Print a signed identity token for `subject` (`user[:display name]`).
fn mint_token(cfg: &ServerConfig, subject: &str) -> anyhow::Result<()> {
	let Some(secret) = cfg.server.auth_hmac_secret.clone() else {
		return Err(anyhow!("--mint-token needs server.auth_hmac_secret (or PARLEY_AUTH_HMAC_SECRET)"));
	};
	let (sub, name) = match subject.split_once(':') {
		Some((sub, name)) => (sub.trim(), Some(name.trim().to_string()).filter(|n| !n.is_empty())),
		None => (subject.trim(), None),
	};
	if sub.is_empty() {
		return Err(anyhow!("--mint-token needs a non-empty user id"));
	}

	let now_secs = (parley_util::unix_ms_now() / 1000).max(0) as u64;
	let token = HmacIdentityVerifier::new(secret).mint(&IdentityClaims {
		sub: sub.to_string(),
		name,
		exp: now_secs + DEFAULT_TOKEN_TTL_SECS,
	})?;
	println!("{token}");
	Ok(())
}

async fn build_store(cfg: &ServerConfig) -> anyhow::Result<(Arc<dyn MessageStore>, CallLog)> {
	let pool = match cfg.persistence.database_url.as_deref() {
		Some(url) if cfg.persistence.enabled || cfg.persistence.call_log_enabled => Some(SqlPool::connect(url).await?),
		_ => None,
	};

	let store: Arc<dyn MessageStore> = match (&pool, cfg.persistence.enabled) {
		(Some(pool), true) => {
			info!("message store: sql");
			Arc::new(SqlMessageStore::new(pool.clone()))
		}
		(None, true) => return Err(anyhow!("persistence enabled but no database_url configured")),
		(_, false) => {
			warn!("message store: in-memory (messages are lost on restart)");
			Arc::new(InMemoryMessageStore::new())
		}
	};

	let call_log = match pool {
		Some(pool) if cfg.persistence.call_log_enabled => CallLog::new(pool),
		_ => CallLog::disabled(),
	};
	info!(enabled = call_log.is_enabled(), "call log");
	Ok((store, call_log))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
	init_rustls_crypto_provider();

	let args = parse_args();
	// Keep stdout clean for the minted token.
	if args.mint_token.is_none() {
		init_tracing();
	}

	let config_path = match args.config_path {
		Some(path) => path,
		None => crate::config::default_config_path()?,
	};
	let server_cfg = crate::config::load_server_config_from_path(&config_path)?;

	if let Some(subject) = args.mint_token.as_deref() {
		return mint_token(&server_cfg, subject);
	}

	info!(path = %config_path.display(), "loaded server config (toml + env overrides)");

	init_metrics(server_cfg.server.metrics_bind.as_deref());

	let (store, call_log) = build_store(&server_cfg).await?;
	let hub = Hub::new(server_cfg.hub.clone(), store, call_log);

	let verifier: Arc<dyn IdentityVerifier> = match server_cfg.server.auth_hmac_secret.clone() {
		Some(secret) => Arc::new(HmacIdentityVerifier::new(secret)),
		None => {
			warn!("no auth_hmac_secret configured; accepting unsigned dev credentials");
			Arc::new(DevIdentityVerifier)
		}
	};

	let health_state = HealthState::new(hub.clone());
	if let Some(bind) = server_cfg.server.health_bind.as_deref() {
		match bind.parse::<SocketAddr>() {
			Ok(addr) => spawn_health_server(addr, health_state.clone()),
			Err(e) => warn!(error = %e, %bind, "invalid health bind address (expected host:port)"),
		}
	}

	let quic_cfg = QuicServerConfig::new(args.bind);
	let endpoint = if let (Some(cert_path), Some(key_path)) = (
		server_cfg.server.tls_cert_path.as_deref(),
		server_cfg.server.tls_key_path.as_deref(),
	) {
		info!(cert = %cert_path.display(), key = %key_path.display(), "loading TLS cert/key");
		quic_cfg.bind_endpoint_with_tls(cert_path, key_path)?
	} else {
		let (endpoint, server_cert_der) = quic_cfg.bind_dev_endpoint()?;
		info!(
			bind = %args.bind,
			cert_der_len = server_cert_der.len(),
			"parley_server: QUIC endpoint ready (dev self-signed cert)"
		);
		endpoint
	};

	let conn_settings = ConnectionSettings::from_server(&server_cfg.server);

	health_state.mark_ready();

	while let Some(incoming) = endpoint.accept().await {
		metrics::counter!("parley_server_connections_total").increment(1);

		let hub = hub.clone();
		let verifier = Arc::clone(&verifier);
		let conn_settings = conn_settings.clone();
		tokio::spawn(async move {
			match incoming.await {
				Ok(connection) => {
					let remote = connection.remote_address();
					info!(%remote, "accepted connection");
					if let Err(e) = handle_connection(connection, hub, verifier, conn_settings).await {
						warn!(%remote, error = %e, "connection handler exited with error");
					}
				}
				Err(e) => {
					warn!(error = %e, "failed to establish QUIC connection");
				}
			}
		});
	}

	Ok(())
}
