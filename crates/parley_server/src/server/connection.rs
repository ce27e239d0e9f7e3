#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context as _, anyhow};
use bytes::BytesMut;
use parley_protocol::version::PROTOCOL_MAJOR;
use parley_protocol::{
	ClientEnvelope, ClientMsg, FramingError, Hello, ServerEnvelope, ServerEvent, ServerMsg, Welcome, encode_frame,
	try_decode_frame_from_buffer,
};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::config::ServerSettings;
use crate::hub::{Hub, HubError};
use crate::server::identity::IdentityVerifier;

/// Per-connection server settings.
#[derive(Debug, Clone)]
pub struct ConnectionSettings {
	pub server_name: String,
	pub max_frame_bytes: usize,
	pub outbound_queue_capacity: usize,
	pub handshake_timeout: Duration,

	pub event_rate_limit_per_conn_burst: u32,
	pub event_rate_limit_per_conn_per_minute: u32,
}

impl Default for ConnectionSettings {
	fn default() -> Self {
		Self {
			server_name: "parley".to_string(),
			max_frame_bytes: parley_protocol::DEFAULT_MAX_FRAME_SIZE,
			outbound_queue_capacity: 256,
			handshake_timeout: Duration::from_secs(10),
			event_rate_limit_per_conn_burst: 0,
			event_rate_limit_per_conn_per_minute: 0,
		}
	}
}

impl ConnectionSettings {
	pub fn from_server(settings: &ServerSettings) -> Self {
		Self {
			server_name: settings.server_name.clone(),
			max_frame_bytes: settings.max_frame_bytes,
			outbound_queue_capacity: settings.outbound_queue_capacity.max(1),
			event_rate_limit_per_conn_burst: settings.event_rate_limit_per_conn_burst,
			event_rate_limit_per_conn_per_minute: settings.event_rate_limit_per_conn_per_minute,
			..Self::default()
		}
	}
}

#[derive(Debug, Clone)]
struct TokenBucket {
	capacity: f64,
	tokens: f64,
	refill_per_sec: f64,
	last: Instant,
}

impl TokenBucket {
	fn new(capacity: u32, refill_per_minute: u32) -> Option<Self> {
		if capacity == 0 || refill_per_minute == 0 {
			return None;
		}
		Some(Self {
			capacity: capacity as f64,
			tokens: capacity as f64,
			refill_per_sec: refill_per_minute as f64 / 60.0,
			last: Instant::now(),
		})
	}

	fn allow(&mut self) -> bool {
		let now = Instant::now();
		let elapsed = now.duration_since(self.last).as_secs_f64();
		if elapsed > 0.0 {
			self.tokens = (self.tokens + elapsed * self.refill_per_sec).min(self.capacity);
			self.last = now;
		}
		if self.tokens >= 1.0 {
			self.tokens -= 1.0;
			true
		} else {
			false
		}
	}
}

/// What the reader task hands to the dispatch loop.
enum Inbound {
	Envelope(ClientEnvelope),
	/// A whole frame arrived but did not parse; the stream stays usable.
	Malformed(String),
}

/// Serve one QUIC connection: handshake, then events until the peer goes away.
pub async fn handle_connection(
	connection: quinn::Connection,
	hub: Hub,
	verifier: Arc<dyn IdentityVerifier>,
	settings: ConnectionSettings,
) -> anyhow::Result<()> {
	struct ConnectionGaugeGuard;
	impl Drop for ConnectionGaugeGuard {
		fn drop(&mut self) {
			metrics::gauge!("parley_server_quic_connections").decrement(1.0);
		}
	}

	metrics::gauge!("parley_server_quic_connections").increment(1.0);
	let _conn_guard = ConnectionGaugeGuard;

	let remote = connection.remote_address();
	let (mut control_send, control_recv) =
		connection.accept_bi().await.context("accept control bidirectional stream")?;

	let (in_tx, mut in_rx) = mpsc::channel::<Inbound>(64);
	let max_frame_bytes = settings.max_frame_bytes;
	let reader_task = tokio::spawn(read_frames(control_recv, in_tx, max_frame_bytes));

	let hello = match tokio::time::timeout(settings.handshake_timeout, wait_for_hello(&mut in_rx)).await {
		Ok(Ok(hello)) => hello,
		Ok(Err(e)) => {
			reader_task.abort();
			return Err(e);
		}
		Err(_) => {
			warn!(%remote, "handshake timed out");
			send_envelope(&mut control_send, &ServerEnvelope::error("timeout", "no Hello received"), max_frame_bytes)
				.await
				.ok();
			reader_task.abort();
			return Ok(());
		}
	};

	info!(
		%remote,
		client_name = %hello.client_name,
		client_instance_id = %hello.client_instance_id,
		"received Hello"
	);
	metrics::counter!("parley_server_hello_total").increment(1);

	let identity = match verifier.verify(hello.credential.trim()) {
		Ok(identity) => identity,
		Err(e) => {
			warn!(%remote, error = %e, "unauthorized: credential rejected");
			metrics::counter!("parley_server_auth_failures_total").increment(1);
			send_envelope(&mut control_send, &ServerEnvelope::error("unauthorized", e.to_string()), max_frame_bytes)
				.await
				.ok();
			control_send.finish().ok();
			// Let the error frame reach the peer before the connection drops.
			tokio::time::timeout(Duration::from_secs(2), control_send.stopped()).await.ok();
			reader_task.abort();
			return Ok(());
		}
	};

	let (out_tx, mut out_rx) = mpsc::channel::<ServerEvent>(settings.outbound_queue_capacity);
	let local_tx = out_tx.clone();
	let connected = hub.connect(&identity, out_tx).await;
	let conn_id = connected.conn_id;

	let welcome = ServerEnvelope {
		version: PROTOCOL_MAJOR,
		msg: ServerMsg::Welcome(Welcome {
			user_id: identity.user_id.clone(),
			display_name: identity.display_name.clone(),
			server_name: settings.server_name.clone(),
			server_time_unix_ms: parley_util::unix_ms_now(),
			max_frame_bytes: u32::try_from(max_frame_bytes).unwrap_or(u32::MAX),
			online_users: connected.online_users,
		}),
	};
	if let Err(e) = send_envelope(&mut control_send, &welcome, max_frame_bytes).await {
		hub.disconnect(conn_id).await;
		reader_task.abort();
		return Err(e.context("send Welcome"));
	}
	info!(conn_id, user_id = %identity.user_id, "connection established");

	let writer_task = tokio::spawn(async move {
		while let Some(ev) = out_rx.recv().await {
			if let Err(e) = send_envelope(&mut control_send, &ServerEnvelope::event(ev), max_frame_bytes).await {
				debug!(conn_id, error = %e, "writer stopped");
				break;
			}
		}
		control_send.finish().ok();
	});

	let mut limiter = TokenBucket::new(
		settings.event_rate_limit_per_conn_burst,
		settings.event_rate_limit_per_conn_per_minute,
	);

	while let Some(inbound) = in_rx.recv().await {
		let env = match inbound {
			Inbound::Envelope(env) => env,
			Inbound::Malformed(reason) => {
				let err = HubError::Validation(format!("malformed frame: {reason}"));
				local_tx.try_send(err.to_event(None)).ok();
				continue;
			}
		};

		match env.msg {
			ClientMsg::Event(ev) => {
				if let Some(bucket) = limiter.as_mut()
					&& !bucket.allow()
				{
					metrics::counter!("parley_server_events_rate_limited_total").increment(1);
					debug!(conn_id, event = ev.name(), "event rate limited");
					local_tx.try_send(HubError::RateLimited.to_event(None)).ok();
					continue;
				}
				hub.dispatch(conn_id, ev).await;
			}
			ClientMsg::Hello(_) => {
				debug!(conn_id, "duplicate Hello ignored");
			}
		}
	}

	hub.disconnect(conn_id).await;
	drop(local_tx);

	let reader_result = reader_task.await;
	let _ = writer_task.await;

	info!(conn_id, user_id = %identity.user_id, "connection closed");
	match reader_result {
		Ok(result) => result,
		Err(join_err) => Err(anyhow!(join_err).context("reader task")),
	}
}

async fn read_frames(mut recv: quinn::RecvStream, tx: mpsc::Sender<Inbound>, max_frame_bytes: usize) -> anyhow::Result<()> {
	let mut buf = BytesMut::with_capacity(16 * 1024);
	let mut tmp = [0u8; 8192];

	loop {
		let n = match recv.read(&mut tmp).await {
			Ok(Some(n)) => n,
			Ok(None) => return Ok(()),
			Err(e) => return Err(anyhow!(e).context("control stream read failed")),
		};

		metrics::counter!("parley_server_control_bytes_in_total").increment(n as u64);
		buf.extend_from_slice(&tmp[..n]);

		loop {
			let inbound = match try_decode_frame_from_buffer::<ClientEnvelope>(&mut buf, max_frame_bytes) {
				Ok(Some(env)) => {
					metrics::counter!("parley_server_envelopes_in_total").increment(1);
					Inbound::Envelope(env)
				}
				Ok(None) => break,
				Err(FramingError::Json(e)) => {
					metrics::counter!("parley_server_control_decode_errors_total").increment(1);
					Inbound::Malformed(e.to_string())
				}
				Err(e) => {
					metrics::counter!("parley_server_control_decode_errors_total").increment(1);
					return Err(anyhow!(e).context("failed to decode control frame"));
				}
			};
			if tx.send(inbound).await.is_err() {
				return Ok(());
			}
		}
	}
}

async fn wait_for_hello(rx: &mut mpsc::Receiver<Inbound>) -> anyhow::Result<Hello> {
	while let Some(inbound) = rx.recv().await {
		let Inbound::Envelope(env) = inbound else { continue };
		if env.version != PROTOCOL_MAJOR {
			return Err(anyhow!("unsupported protocol version {}", env.version));
		}
		if let ClientMsg::Hello(h) = env.msg {
			return Ok(h);
		}
	}
	Err(anyhow!("connection closed before Hello"))
}

async fn send_envelope(send: &mut quinn::SendStream, env: &ServerEnvelope, max_frame_bytes: usize) -> anyhow::Result<()> {
	let frame = encode_frame(env, max_frame_bytes).map_err(|e| anyhow!(e))?;
	metrics::counter!("parley_server_envelopes_out_total").increment(1);
	metrics::counter!("parley_server_control_bytes_out_total").increment(frame.len() as u64);

	send.write_all(&frame).await.context("stream write")?;
	Ok(())
}
