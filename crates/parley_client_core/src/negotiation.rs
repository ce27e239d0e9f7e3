#![forbid(unsafe_code)]

//! Per-peer offer/answer ordering for call media negotiation.
//!
//! The hub relays call signals as opaque JSON. This module is the only place
//! that reads their `type` tag; the media stack itself sits behind
//! [`PeerEngine`].

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use parley_domain::UserId;
use parley_protocol::ClientEvent;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

/// Errors raised while negotiating with one peer.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum NegotiationError {
	#[error("malformed signal: {0}")]
	MalformedSignal(String),

	/// The media engine refused an operation.
	#[error("engine error: {0}")]
	Engine(String),

	#[error("a negotiation is already in flight")]
	AlreadyNegotiating,

	#[error("no connection within {0:?}")]
	ConnectTimeout(Duration),

	/// The signal channel or the guard itself was closed.
	#[error("negotiation closed")]
	Closed,
}

/// A decoded call signal payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Signal {
	Offer { sdp: String },
	Answer { sdp: String },
	Candidate { candidate: Value },
}

impl Signal {
	pub fn from_payload(payload: &Value) -> Result<Self, NegotiationError> {
		Signal::deserialize(payload).map_err(|e| NegotiationError::MalformedSignal(e.to_string()))
	}

	pub fn to_payload(&self) -> Value {
		match self {
			Self::Offer { sdp } => json!({ "type": "offer", "sdp": sdp }),
			Self::Answer { sdp } => json!({ "type": "answer", "sdp": sdp }),
			Self::Candidate { candidate } => json!({ "type": "candidate", "candidate": candidate }),
		}
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SdpKind {
	Offer,
	Answer,
}

/// Local signaling state, mirroring the media engine's.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SignalingState {
	#[default]
	Stable,
	HaveLocalOffer,
	HaveRemoteOffer,
}

/// The media stack for one peer connection.
#[async_trait]
pub trait PeerEngine: Send {
	async fn create_offer(&mut self) -> Result<String, NegotiationError>;
	async fn create_answer(&mut self) -> Result<String, NegotiationError>;
	async fn set_local_description(&mut self, kind: SdpKind, sdp: &str) -> Result<(), NegotiationError>;
	async fn set_remote_description(&mut self, kind: SdpKind, sdp: &str) -> Result<(), NegotiationError>;
	async fn add_candidate(&mut self, candidate: &Value) -> Result<(), NegotiationError>;
}

/// Where outgoing signals go (normally the hub session).
#[async_trait]
pub trait SignalSink: Send + Sync {
	async fn send_signal(&self, to: &UserId, payload: Value) -> Result<(), NegotiationError>;
}

#[async_trait]
impl SignalSink for mpsc::Sender<ClientEvent> {
	async fn send_signal(&self, to: &UserId, payload: Value) -> Result<(), NegotiationError> {
		self.send(ClientEvent::CallSignal {
			to: to.clone(),
			payload,
			from: None,
		})
		.await
		.map_err(|_| NegotiationError::Closed)
	}
}

/// Timers for an outbound call attempt.
#[derive(Debug, Clone, Copy)]
pub struct NegotiationTimings {
	/// Delay before the offer is sent a second (and last) time.
	pub offer_retry_after: Duration,
	/// Abort the attempt if the transport is not connected by then.
	pub connect_deadline: Duration,
}

impl Default for NegotiationTimings {
	fn default() -> Self {
		Self {
			offer_retry_after: Duration::from_secs(2),
			connect_deadline: Duration::from_secs(30),
		}
	}
}

/// What happened to one inbound signal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignalOutcome {
	/// An offer was applied and an answer sent back.
	Answered,
	/// An answer or candidate reached the engine.
	Applied,
	/// A candidate is waiting for the remote description.
	Queued,
	/// Dropped without touching the engine.
	Ignored(&'static str),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Link {
	Connecting,
	Connected,
	Closed,
}

#[derive(Debug, Default)]
struct GuardState {
	signaling: SignalingState,
	negotiating: bool,
	remote_applied: bool,
	pending: VecDeque<Value>,
	local_offer: Option<String>,
	closed: bool,
}

/// Negotiation state machine for one remote peer.
///
/// Methods take `&self` so the signal loop and the retry timer can share
/// one guard; the engine lock is the only lock held across `.await`.
pub struct NegotiationGuard<E> {
	peer: UserId,
	state: Mutex<GuardState>,
	engine: tokio::sync::Mutex<E>,
	link: watch::Sender<Link>,
}

impl<E: PeerEngine> NegotiationGuard<E> {
	pub fn new(peer: UserId, engine: E) -> Self {
		Self {
			peer,
			state: Mutex::new(GuardState::default()),
			engine: tokio::sync::Mutex::new(engine),
			link: watch::Sender::new(Link::Connecting),
		}
	}

	pub fn peer(&self) -> &UserId {
		&self.peer
	}

	pub fn signaling_state(&self) -> SignalingState {
		self.state().signaling
	}

	pub fn pending_candidates(&self) -> usize {
		self.state().pending.len()
	}

	pub fn is_connected(&self) -> bool {
		*self.link.borrow() == Link::Connected
	}

	fn state(&self) -> MutexGuard<'_, GuardState> {
		self.state.lock().unwrap_or_else(PoisonError::into_inner)
	}

	/// The transport reached its connected state.
	pub fn mark_connected(&self) {
		info!(peer = %self.peer, "peer connected");
		self.link.send_replace(Link::Connected);
	}

	/// Stop handling signals; pending waits return `Closed`.
	pub fn close(&self) {
		{
			let mut st = self.state();
			st.closed = true;
			st.pending.clear();
		}
		self.link.send_if_modified(|link| {
			if *link == Link::Connecting {
				*link = Link::Closed;
				true
			} else {
				false
			}
		});
	}

	/// Route one relayed payload from the peer.
	pub async fn handle_signal(&self, payload: &Value, sink: &dyn SignalSink) -> Result<SignalOutcome, NegotiationError> {
		match Signal::from_payload(payload)? {
			Signal::Offer { sdp } => self.on_offer(&sdp, sink).await,
			Signal::Answer { sdp } => self.on_answer(&sdp).await,
			Signal::Candidate { candidate } => self.on_candidate(candidate).await,
		}
	}

	async fn on_offer(&self, sdp: &str, sink: &dyn SignalSink) -> Result<SignalOutcome, NegotiationError> {
		{
			let mut st = self.state();
			if st.closed {
				return Ok(SignalOutcome::Ignored("closed"));
			}
			if st.signaling != SignalingState::Stable || st.negotiating {
				debug!(peer = %self.peer, state = ?st.signaling, negotiating = st.negotiating, "ignoring offer");
				return Ok(SignalOutcome::Ignored("not stable"));
			}
			st.negotiating = true;
			st.signaling = SignalingState::HaveRemoteOffer;
		}

		let answered = self.answer_offer(sdp).await;

		let answer = {
			let mut st = self.state();
			st.negotiating = false;
			st.signaling = SignalingState::Stable;
			answered?
		};

		sink.send_signal(&self.peer, Signal::Answer { sdp: answer }.to_payload()).await?;
		debug!(peer = %self.peer, "answer sent");
		Ok(SignalOutcome::Answered)
	}

	async fn answer_offer(&self, sdp: &str) -> Result<String, NegotiationError> {
		let mut engine = self.engine.lock().await;
		engine.set_remote_description(SdpKind::Offer, sdp).await?;
		self.drain_pending(&mut *engine).await?;
		let answer = engine.create_answer().await?;
		engine.set_local_description(SdpKind::Answer, &answer).await?;
		Ok(answer)
	}

	async fn on_answer(&self, sdp: &str) -> Result<SignalOutcome, NegotiationError> {
		{
			let mut st = self.state();
			if st.closed || st.signaling != SignalingState::HaveLocalOffer {
				debug!(peer = %self.peer, state = ?st.signaling, "discarding stale answer");
				return Ok(SignalOutcome::Ignored("stale answer"));
			}
			st.signaling = SignalingState::Stable;
		}

		let mut engine = self.engine.lock().await;
		if let Err(e) = engine.set_remote_description(SdpKind::Answer, sdp).await {
			self.state().signaling = SignalingState::HaveLocalOffer;
			return Err(e);
		}
		self.drain_pending(&mut *engine).await?;
		Ok(SignalOutcome::Applied)
	}

	async fn on_candidate(&self, candidate: Value) -> Result<SignalOutcome, NegotiationError> {
		{
			let mut st = self.state();
			if st.closed {
				return Ok(SignalOutcome::Ignored("closed"));
			}
			if !st.remote_applied {
				st.pending.push_back(candidate);
				debug!(peer = %self.peer, queued = st.pending.len(), "candidate queued");
				return Ok(SignalOutcome::Queued);
			}
		}

		self.engine.lock().await.add_candidate(&candidate).await?;
		Ok(SignalOutcome::Applied)
	}

	/// Apply queued candidates in arrival order.
	///
	/// `remote_applied` flips only once the queue is empty, so candidates that
	/// arrive mid-drain still land behind the earlier ones.
	async fn drain_pending(&self, engine: &mut E) -> Result<(), NegotiationError> {
		loop {
			let next = {
				let mut st = self.state();
				match st.pending.pop_front() {
					Some(c) => c,
					None => {
						st.remote_applied = true;
						return Ok(());
					}
				}
			};
			engine.add_candidate(&next).await?;
		}
	}

	/// Create, apply and send a local offer.
	pub async fn start_offer(&self, sink: &dyn SignalSink) -> Result<(), NegotiationError> {
		{
			let mut st = self.state();
			if st.closed {
				return Err(NegotiationError::Closed);
			}
			if st.signaling != SignalingState::Stable || st.negotiating {
				return Err(NegotiationError::AlreadyNegotiating);
			}
			st.negotiating = true;
		}

		let created = async {
			let mut engine = self.engine.lock().await;
			let offer = engine.create_offer().await?;
			engine.set_local_description(SdpKind::Offer, &offer).await?;
			Ok::<_, NegotiationError>(offer)
		}
		.await;

		let offer = {
			let mut st = self.state();
			st.negotiating = false;
			let offer = created?;
			st.signaling = SignalingState::HaveLocalOffer;
			st.local_offer = Some(offer.clone());
			offer
		};

		sink.send_signal(&self.peer, Signal::Offer { sdp: offer }.to_payload()).await?;
		debug!(peer = %self.peer, "offer sent");
		Ok(())
	}

	/// Send the current local offer again if the call is still connecting.
	pub async fn resend_offer(&self, sink: &dyn SignalSink) -> Result<bool, NegotiationError> {
		if self.is_connected() {
			return Ok(false);
		}
		let offer = {
			let st = self.state();
			match (&st.local_offer, st.signaling, st.closed) {
				(Some(offer), SignalingState::HaveLocalOffer, false) => offer.clone(),
				_ => return Ok(false),
			}
		};
		sink.send_signal(&self.peer, Signal::Offer { sdp: offer }.to_payload()).await?;
		Ok(true)
	}

	/// Wait until [`mark_connected`](Self::mark_connected) or the deadline.
	///
	/// On timeout the guard is closed.
	pub async fn wait_connected(&self, within: Duration) -> Result<(), NegotiationError> {
		let mut rx = self.link.subscribe();
		match tokio::time::timeout(within, rx.wait_for(|l| *l != Link::Connecting)).await {
			Ok(Ok(link)) if *link == Link::Connected => Ok(()),
			Ok(_) => Err(NegotiationError::Closed),
			Err(_) => {
				warn!(peer = %self.peer, ?within, "connection timeout");
				self.close();
				Err(NegotiationError::ConnectTimeout(within))
			}
		}
	}

	/// Caller side of a call: offer, one retry after the grace period, then
	/// wait for the transport up to the connection deadline.
	pub async fn run_outbound(&self, sink: &dyn SignalSink, timings: NegotiationTimings) -> Result<(), NegotiationError> {
		let started = tokio::time::Instant::now();
		self.start_offer(sink).await?;

		if self.wait_connected_quietly(timings.offer_retry_after).await {
			return Ok(());
		}
		if self.resend_offer(sink).await? {
			info!(peer = %self.peer, "offer re-sent");
		}

		let remaining = timings.connect_deadline.saturating_sub(started.elapsed());
		self.wait_connected(remaining).await.map_err(|e| match e {
			NegotiationError::ConnectTimeout(_) => NegotiationError::ConnectTimeout(timings.connect_deadline),
			other => other,
		})
	}

	async fn wait_connected_quietly(&self, within: Duration) -> bool {
		let mut rx = self.link.subscribe();
		matches!(
			tokio::time::timeout(within, rx.wait_for(|l| *l == Link::Connected)).await,
			Ok(Ok(_))
		)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn signal_wire_shape() {
		let offer = Signal::Offer { sdp: "v=0".into() };
		assert_eq!(offer.to_payload(), json!({ "type": "offer", "sdp": "v=0" }));
		assert_eq!(Signal::from_payload(&offer.to_payload()).unwrap(), offer);

		let cand = Signal::from_payload(&json!({ "type": "candidate", "candidate": { "candidate": "a=1", "sdpMid": "0" } }))
			.unwrap();
		assert!(matches!(cand, Signal::Candidate { .. }));

		assert!(matches!(
			Signal::from_payload(&json!({ "type": "renegotiate" })),
			Err(NegotiationError::MalformedSignal(_))
		));
	}

	#[test]
	fn default_timings() {
		let t = NegotiationTimings::default();
		assert_eq!(t.offer_retry_after, Duration::from_secs(2));
		assert_eq!(t.connect_deadline, Duration::from_secs(30));
	}
}
