#![forbid(unsafe_code)]

use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use bytes::BytesMut;
use parley_protocol::version::PROTOCOL_MAJOR;
use parley_protocol::{
	ALPN, ClientEnvelope, ClientEvent, ClientMsg, DEFAULT_MAX_FRAME_SIZE, FramingError, Hello, ServerEnvelope, ServerEvent,
	ServerMsg, Welcome, encode_frame, try_decode_frame_from_buffer,
};
use parley_util::endpoint::{DEFAULT_PORT, QuicEndpoint};
use quinn::{ClientConfig, Endpoint};
use tracing::{debug, info};

pub mod coordinator;
pub mod negotiation;
pub mod reconcile;

pub use coordinator::{
	ActiveCall, CallCoordinator, CallPeer, CoordinatorError, IncomingCall, IncomingDecision, TabChannel, TabMessage,
};
pub use negotiation::{
	NegotiationError, NegotiationGuard, NegotiationTimings, PeerEngine, SdpKind, Signal, SignalOutcome, SignalSink,
	SignalingState,
};
pub use reconcile::{LedgerChange, LedgerEntry, MessageLedger};

/// Client session configuration (v1).
#[derive(Debug, Clone)]
pub struct ClientConfigV1 {
	/// Remote server host (DNS name or IP literal).
	pub server_host: String,

	/// Remote server UDP port.
	pub server_port: u16,

	/// Resolved remote server address override.
	pub server_addr: Option<SocketAddr>,

	pub client_name: String,

	/// Distinguishes tabs/devices of the same user in server logs.
	pub client_instance_id: String,

	/// Identity credential presented in `Hello`.
	pub credential: String,

	/// Maximum inbound/outbound frame size.
	pub max_frame_bytes: usize,

	/// Timeout for connect + handshake.
	pub connect_timeout: Duration,
}

impl ClientConfigV1 {
	/// Parse a `quic://host:port` endpoint into `(host, port)`.
	pub fn parse_quic_endpoint(endpoint: &str) -> Result<(String, u16), ClientCoreError> {
		let e = QuicEndpoint::parse(endpoint)
			.map_err(|msg| ClientCoreError::Protocol(format!("invalid endpoint (expected quic://host:port): {msg}")))?;
		Ok((e.server_name().to_string(), e.port))
	}

	/// Convenience: create a config from `quic://host:port`.
	pub fn from_quic_endpoint(endpoint: &str) -> Result<Self, ClientCoreError> {
		let e = QuicEndpoint::parse(endpoint)
			.map_err(|msg| ClientCoreError::Protocol(format!("invalid endpoint (expected quic://host:port): {msg}")))?;
		Ok(Self {
			server_addr: e.to_socket_addr_if_ip_literal().ok(),
			server_host: e.server_name().to_string(),
			server_port: e.port,
			..Self::default()
		})
	}
}

impl Default for ClientConfigV1 {
	fn default() -> Self {
		Self {
			server_host: "localhost".to_string(),
			server_port: DEFAULT_PORT,
			server_addr: None,
			client_name: format!("parley-client-core/{}", env!("CARGO_PKG_VERSION")),
			client_instance_id: "dev-instance".to_string(),
			credential: String::new(),
			max_frame_bytes: DEFAULT_MAX_FRAME_SIZE,
			connect_timeout: Duration::from_secs(15),
		}
	}
}

/// Errors for client core operations.
#[derive(Debug, thiserror::Error)]
pub enum ClientCoreError {
	/// QUIC endpoint setup failed.
	#[error("failed to create QUIC endpoint: {0}")]
	Endpoint(String),

	/// Connection establishment failed.
	#[error("failed to connect: {0}")]
	Connect(String),

	/// Protocol framing error.
	#[error(transparent)]
	Framing(#[from] FramingError),

	/// Protocol error (unexpected message ordering/types).
	#[error("protocol error: {0}")]
	Protocol(String),

	/// The server refused the connection (e.g. `unauthorized`).
	#[error("server error {code}: {message}")]
	Server { code: String, message: String },

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

/// One authenticated connection to the hub.
pub struct Session {
	conn: quinn::Connection,
	send: quinn::SendStream,
	recv: quinn::RecvStream,
	buf: BytesMut,
	max_frame_bytes: usize,
}

impl Session {
	/// Connect and perform the v1 handshake.
	pub async fn connect(cfg: ClientConfigV1) -> Result<(Self, Welcome), ClientCoreError> {
		let endpoint = make_client_endpoint().map_err(|e| ClientCoreError::Endpoint(format!("{e:#}")))?;
		let quinn_cfg = make_insecure_client_config().map_err(|e| ClientCoreError::Endpoint(format!("{e:#}")))?;

		let connect_timeout = cfg.connect_timeout;
		let server_name = cfg.server_host.clone();

		let candidates: Vec<SocketAddr> = match cfg.server_addr {
			Some(addr) => vec![addr],
			None => {
				let hostport = format!("{}:{}", cfg.server_host, cfg.server_port);
				let addrs: Vec<SocketAddr> = hostport
					.to_socket_addrs()
					.map_err(|e| ClientCoreError::Connect(format!("failed to resolve {hostport}: {e}")))?
					.collect();
				if addrs.is_empty() {
					return Err(ClientCoreError::Connect(format!(
						"DNS resolution returned no addresses for {hostport}"
					)));
				}
				addrs
			}
		};

		let mut last_err: Option<String> = None;
		let mut conn: Option<quinn::Connection> = None;

		for server_addr in candidates {
			let connecting = endpoint
				.connect_with(quinn_cfg.clone(), server_addr, &server_name)
				.map_err(|e| ClientCoreError::Connect(format!("connect_with({server_addr}, sni={server_name}): {e}")))?;

			match tokio::time::timeout(connect_timeout, connecting).await {
				Ok(Ok(c)) => {
					conn = Some(c);
					break;
				}
				Ok(Err(e)) => {
					last_err = Some(format!("connect failed (addr={server_addr}, sni={server_name}): {e}"));
				}
				Err(_) => {
					last_err = Some(format!(
						"connect timeout after {connect_timeout:?} (addr={server_addr}, sni={server_name})"
					));
				}
			}
		}

		let conn = conn.ok_or_else(|| {
			ClientCoreError::Connect(
				last_err.unwrap_or_else(|| format!("connect failed (no addresses attempted) (sni={server_name})")),
			)
		})?;

		info!(remote = %conn.remote_address(), "connected");

		let (send, recv) = tokio::time::timeout(connect_timeout, conn.open_bi())
			.await
			.map_err(|_| ClientCoreError::Io(format!("timeout opening control stream after {connect_timeout:?}")))?
			.map_err(|e| ClientCoreError::Io(format!("open_bi(control) failed: {e}")))?;

		let mut session = Self {
			conn,
			send,
			recv,
			buf: BytesMut::with_capacity(16 * 1024),
			max_frame_bytes: cfg.max_frame_bytes,
		};

		let hello = ClientEnvelope {
			version: PROTOCOL_MAJOR,
			msg: ClientMsg::Hello(Hello {
				client_name: cfg.client_name,
				client_instance_id: cfg.client_instance_id,
				credential: cfg.credential,
			}),
		};
		session
			.write_envelope(&hello)
			.await
			.map_err(|e| ClientCoreError::Io(format!("send Hello failed: {e}")))?;

		let welcome_env = tokio::time::timeout(connect_timeout, session.read_envelope())
			.await
			.map_err(|_| ClientCoreError::Protocol(format!("timeout waiting for Welcome after {connect_timeout:?}")))??;

		let welcome = match welcome_env {
			Some(ServerEnvelope {
				msg: ServerMsg::Welcome(w),
				..
			}) => w,
			Some(ServerEnvelope {
				msg: ServerMsg::Error(e), ..
			}) => {
				return Err(ClientCoreError::Server {
					code: e.code,
					message: e.message,
				});
			}
			Some(other) => {
				return Err(ClientCoreError::Protocol(format!("expected Welcome, got {:?}", other.msg)));
			}
			None => return Err(ClientCoreError::Protocol("stream closed before Welcome".to_string())),
		};

		debug!(
			user_id = %welcome.user_id,
			server_name = %welcome.server_name,
			max_frame_bytes = welcome.max_frame_bytes,
			online = welcome.online_users.len(),
			"received Welcome"
		);

		session.max_frame_bytes = (welcome.max_frame_bytes as usize).min(session.max_frame_bytes);
		Ok((session, welcome))
	}

	/// Send one event to the hub.
	pub async fn send(&mut self, ev: ClientEvent) -> Result<(), ClientCoreError> {
		debug!(event = ev.name(), "sending event");
		self.write_envelope(&ClientEnvelope::event(ev)).await
	}

	/// Next event from the hub; `None` once the server closes the stream.
	pub async fn next_event(&mut self) -> Result<Option<ServerEvent>, ClientCoreError> {
		loop {
			match self.read_envelope().await? {
				None => return Ok(None),
				Some(env) => match env.msg {
					ServerMsg::Event(ev) => return Ok(Some(ev)),
					ServerMsg::Error(e) => {
						return Err(ClientCoreError::Server {
							code: e.code,
							message: e.message,
						});
					}
					ServerMsg::Welcome(_) => debug!("ignoring repeated Welcome"),
				},
			}
		}
	}

	pub fn close(&self, code: u32, reason: &str) {
		self.conn.close(quinn::VarInt::from_u32(code), reason.as_bytes());
	}

	async fn write_envelope(&mut self, env: &ClientEnvelope) -> Result<(), ClientCoreError> {
		let frame = encode_frame(env, self.max_frame_bytes)?;
		self.send
			.write_all(&frame)
			.await
			.map_err(|e| ClientCoreError::Io(e.to_string()))?;
		Ok(())
	}

	async fn read_envelope(&mut self) -> Result<Option<ServerEnvelope>, ClientCoreError> {
		let mut tmp = [0u8; 8192];

		loop {
			// A previous read may already hold a full frame.
			if let Some(env) = try_decode_frame_from_buffer::<ServerEnvelope>(&mut self.buf, self.max_frame_bytes)? {
				return Ok(Some(env));
			}

			let n = match self.recv.read(&mut tmp).await {
				Ok(Some(n)) => n,
				Ok(None) => {
					if self.buf.is_empty() {
						return Ok(None);
					}
					return Err(ClientCoreError::Protocol(
						"stream closed before receiving full message".to_string(),
					));
				}
				Err(e) => return Err(ClientCoreError::Io(e.to_string())),
			};

			self.buf.extend_from_slice(&tmp[..n]);
		}
	}
}

fn make_client_endpoint() -> anyhow::Result<Endpoint> {
	let addr = SocketAddr::from(([0, 0, 0, 0], 0));
	let endpoint = Endpoint::client(addr).context("create client endpoint")?;
	Ok(endpoint)
}

/// Dev-only TLS config that skips server cert validation.
fn make_insecure_client_config() -> anyhow::Result<ClientConfig> {
	let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();

	#[derive(Debug)]
	struct NoVerifier;

	impl rustls::client::danger::ServerCertVerifier for NoVerifier {
		fn verify_server_cert(
			&self,
			_end_entity: &rustls::pki_types::CertificateDer<'_>,
			_intermediates: &[rustls::pki_types::CertificateDer<'_>],
			_server_name: &rustls::pki_types::ServerName<'_>,
			_ocsp_response: &[u8],
			_now: rustls::pki_types::UnixTime,
		) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
			Ok(rustls::client::danger::ServerCertVerified::assertion())
		}

		fn verify_tls12_signature(
			&self,
			_message: &[u8],
			_cert: &rustls::pki_types::CertificateDer<'_>,
			_dss: &rustls::DigitallySignedStruct,
		) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
			Err(rustls::Error::General("TLS1.2 not supported".into()))
		}

		fn verify_tls13_signature(
			&self,
			_message: &[u8],
			_cert: &rustls::pki_types::CertificateDer<'_>,
			_dss: &rustls::DigitallySignedStruct,
		) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
			Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
		}

		fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
			vec![
				rustls::SignatureScheme::ECDSA_NISTP256_SHA256,
				rustls::SignatureScheme::ECDSA_NISTP384_SHA384,
				rustls::SignatureScheme::RSA_PSS_SHA256,
				rustls::SignatureScheme::RSA_PSS_SHA384,
				rustls::SignatureScheme::RSA_PSS_SHA512,
				rustls::SignatureScheme::ED25519,
			]
		}
	}

	let mut tls = rustls::ClientConfig::builder()
		.with_root_certificates(rustls::RootCertStore::empty())
		.with_no_client_auth();

	tls.dangerous().set_certificate_verifier(Arc::new(NoVerifier));
	tls.alpn_protocols = vec![ALPN.to_vec()];

	let quic_tls = quinn::crypto::rustls::QuicClientConfig::try_from(tls)?;
	Ok(ClientConfig::new(Arc::new(quic_tls)))
}
