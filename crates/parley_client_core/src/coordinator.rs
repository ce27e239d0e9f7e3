#![forbid(unsafe_code)]

//! One call at a time across every tab of a user agent.
//!
//! Tabs share a [`TabChannel`]; each tab owns a [`CallCoordinator`] that keeps
//! a local view of the shared "call active" flag and of its own ringing prompt.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parley_domain::{MediaKind, RejectReason, RoomId, UserId};
use parley_protocol::{ClientEvent, ServerEvent};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

pub type TabId = u64;

const DEFAULT_CHANNEL_CAPACITY: usize = 64;

/// Who a call is with.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum CallPeer {
	User(UserId),
	Room(RoomId),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActiveCall {
	pub with: CallPeer,
	pub media: MediaKind,
	/// Tab running the media session.
	pub owner: TabId,
}

/// Messages exchanged between sibling tabs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum TabMessage {
	CallStarted(ActiveCall),
	CallEnded,
	IncomingAccepted { caller: UserId },
	IncomingRejected { caller: UserId },
	/// Sent by a tab when it joins; the owner of an active call answers with `StateSync`.
	SyncRequest,
	StateSync { active: Option<ActiveCall> },
}

#[derive(Debug, Clone)]
pub struct TabEnvelope {
	pub from: TabId,
	pub msg: TabMessage,
}

/// Local pub/sub shared by the tabs of one user.
#[derive(Debug, Clone)]
pub struct TabChannel {
	tx: broadcast::Sender<TabEnvelope>,
	next_tab: Arc<AtomicU64>,
}

impl Default for TabChannel {
	fn default() -> Self {
		Self::new(DEFAULT_CHANNEL_CAPACITY)
	}
}

impl TabChannel {
	pub fn new(capacity: usize) -> Self {
		let (tx, _rx) = broadcast::channel(capacity.max(1));
		Self {
			tx,
			next_tab: Arc::new(AtomicU64::new(1)),
		}
	}

	fn subscribe(&self) -> (TabId, broadcast::Receiver<TabEnvelope>) {
		let tab = self.next_tab.fetch_add(1, Ordering::Relaxed);
		(tab, self.tx.subscribe())
	}

	fn publish(&self, from: TabId, msg: TabMessage) {
		debug!(tab = from, ?msg, "tab broadcast");
		// Sending only fails when no tab is listening.
		self.tx.send(TabEnvelope { from, msg }).ok();
	}
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CoordinatorError {
	#[error("a call is already active in tab {}", .0.owner)]
	CallActive(ActiveCall),
	#[error("no incoming call to answer")]
	NothingRinging,
}

/// A call request shown (or about to be shown) in this tab.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IncomingCall {
	pub caller: UserId,
	pub caller_name: String,
	pub media: MediaKind,
	/// Set for group calls.
	pub room: Option<RoomId>,
}

impl IncomingCall {
	pub fn from_event(ev: &ServerEvent) -> Option<Self> {
		match ev {
			ServerEvent::CallRequest {
				caller_id,
				caller_name,
				media,
			} => Some(Self {
				caller: caller_id.clone(),
				caller_name: caller_name.clone(),
				media: *media,
				room: None,
			}),
			ServerEvent::GroupCallRequest {
				room_id,
				caller_id,
				caller_name,
				media,
			} => Some(Self {
				caller: caller_id.clone(),
				caller_name: caller_name.clone(),
				media: *media,
				room: Some(room_id.clone()),
			}),
			_ => None,
		}
	}

	fn peer(&self) -> CallPeer {
		match &self.room {
			Some(room) => CallPeer::Room(room.clone()),
			None => CallPeer::User(self.caller.clone()),
		}
	}

	fn accept_event(&self) -> ClientEvent {
		match &self.room {
			Some(room) => ClientEvent::GroupCallAccept {
				room_id: room.clone(),
				to: self.caller.clone(),
			},
			None => ClientEvent::CallAccept {
				caller: self.caller.clone(),
				from: None,
			},
		}
	}

	fn reject_event(&self, reason: RejectReason) -> ClientEvent {
		match &self.room {
			Some(room) => ClientEvent::GroupCallReject {
				room_id: room.clone(),
				to: self.caller.clone(),
			},
			None => ClientEvent::CallReject {
				caller: self.caller.clone(),
				reason: Some(reason),
				from: None,
			},
		}
	}
}

/// What to do with an incoming call request.
#[derive(Debug, Clone, PartialEq)]
pub enum IncomingDecision {
	/// Show the prompt in this tab.
	Ring,
	/// Send this reply to the hub right away.
	Busy(ClientEvent),
}

/// Per-tab view of the shared call state.
#[derive(Debug)]
pub struct CallCoordinator {
	tab: TabId,
	channel: TabChannel,
	rx: broadcast::Receiver<TabEnvelope>,
	active: Option<ActiveCall>,
	ringing: Option<IncomingCall>,
}

impl CallCoordinator {
	/// Attach a new tab and ask its siblings for the current call.
	pub fn join(channel: &TabChannel) -> Self {
		let (tab, rx) = channel.subscribe();
		channel.publish(tab, TabMessage::SyncRequest);
		Self {
			tab,
			channel: channel.clone(),
			rx,
			active: None,
			ringing: None,
		}
	}

	pub fn tab_id(&self) -> TabId {
		self.tab
	}

	pub fn active_call(&self) -> Option<&ActiveCall> {
		self.active.as_ref()
	}

	pub fn ringing(&self) -> Option<&IncomingCall> {
		self.ringing.as_ref()
	}

	/// True when this tab runs the media session.
	pub fn owns_call(&self) -> bool {
		self.active.as_ref().is_some_and(|a| a.owner == self.tab)
	}

	pub fn is_busy(&mut self) -> bool {
		self.sync();
		self.active.is_some() || self.ringing.is_some()
	}

	/// Apply every message sibling tabs have published so far.
	pub fn sync(&mut self) {
		loop {
			match self.rx.try_recv() {
				Ok(env) => self.apply(env),
				Err(broadcast::error::TryRecvError::Lagged(n)) => {
					warn!(tab = self.tab, lagged = n, "tab channel lagged");
				}
				Err(broadcast::error::TryRecvError::Empty | broadcast::error::TryRecvError::Closed) => break,
			}
		}
	}

	/// Wait for the next sibling message, apply it and return it.
	pub async fn recv(&mut self) -> Option<TabMessage> {
		loop {
			match self.rx.recv().await {
				Ok(env) if env.from == self.tab => continue,
				Ok(env) => {
					let msg = env.msg.clone();
					self.apply(env);
					return Some(msg);
				}
				Err(broadcast::error::RecvError::Lagged(n)) => {
					warn!(tab = self.tab, lagged = n, "tab channel lagged");
				}
				Err(broadcast::error::RecvError::Closed) => return None,
			}
		}
	}

	fn apply(&mut self, env: TabEnvelope) {
		if env.from == self.tab {
			return;
		}
		match env.msg {
			TabMessage::CallStarted(call) => {
				self.active = Some(call);
			}
			TabMessage::CallEnded => {
				self.active = None;
				self.ringing = None;
			}
			TabMessage::IncomingAccepted { caller } | TabMessage::IncomingRejected { caller } => {
				if self.ringing.as_ref().is_some_and(|r| r.caller == caller) {
					debug!(tab = self.tab, %caller, "prompt handled by a sibling tab");
					self.ringing = None;
				}
			}
			TabMessage::SyncRequest => {
				if let Some(active) = self.active.as_ref().filter(|a| a.owner == self.tab) {
					self.channel.publish(
						self.tab,
						TabMessage::StateSync {
							active: Some(active.clone()),
						},
					);
				}
			}
			TabMessage::StateSync { active: Some(active) } => {
				if self.active.is_none() {
					self.active = Some(active);
				}
			}
			TabMessage::StateSync { active: None } => {}
		}
	}

	/// Claim the shared flag for an outgoing call.
	pub fn start_call(&mut self, with: CallPeer, media: MediaKind) -> Result<(), CoordinatorError> {
		self.sync();
		if let Some(active) = &self.active {
			return Err(CoordinatorError::CallActive(active.clone()));
		}
		let call = ActiveCall {
			with,
			media,
			owner: self.tab,
		};
		info!(tab = self.tab, with = ?call.with, "call started");
		self.active = Some(call.clone());
		self.channel.publish(self.tab, TabMessage::CallStarted(call));
		Ok(())
	}

	/// Release the shared flag.
	pub fn end_call(&mut self) -> Option<ActiveCall> {
		self.ringing = None;
		let ended = self.active.take();
		if ended.is_some() {
			info!(tab = self.tab, "call ended");
			self.channel.publish(self.tab, TabMessage::CallEnded);
		}
		ended
	}

	/// Decide whether a call request rings here or is refused as busy.
	pub fn on_incoming_call(&mut self, call: IncomingCall) -> IncomingDecision {
		if self.is_busy() {
			info!(tab = self.tab, caller = %call.caller, "auto-rejecting call while busy");
			return IncomingDecision::Busy(call.reject_event(RejectReason::Busy));
		}
		self.ringing = Some(call);
		IncomingDecision::Ring
	}

	/// Answer the ringing call; sibling tabs drop their prompt.
	pub fn accept(&mut self) -> Result<ClientEvent, CoordinatorError> {
		self.sync();
		let call = self.ringing.take().ok_or(CoordinatorError::NothingRinging)?;
		if let Some(active) = &self.active {
			return Err(CoordinatorError::CallActive(active.clone()));
		}
		self.channel.publish(
			self.tab,
			TabMessage::IncomingAccepted {
				caller: call.caller.clone(),
			},
		);
		self.start_call(call.peer(), call.media)?;
		Ok(call.accept_event())
	}

	/// Decline the ringing call.
	pub fn reject(&mut self) -> Result<ClientEvent, CoordinatorError> {
		self.sync();
		let call = self.ringing.take().ok_or(CoordinatorError::NothingRinging)?;
		self.channel.publish(
			self.tab,
			TabMessage::IncomingRejected {
				caller: call.caller.clone(),
			},
		);
		Ok(call.reject_event(RejectReason::Declined))
	}

	/// The hub ended or refused the call this tab was part of.
	pub fn on_hangup(&mut self) {
		self.ringing = None;
		if self.owns_call() {
			self.end_call();
		}
	}
}
