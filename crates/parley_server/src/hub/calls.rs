#![forbid(unsafe_code)]

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;

use parley_domain::{CallKind, CallRoomId, CallState, MediaKind, RejectReason, RoomId, UserId};
use parley_protocol::ServerEvent;
use serde_json::Value;
use tracing::{debug, info};

use super::connections::{ConnId, ConnIdentity};
use super::locks::lock;
use super::{Hub, HubError};
use crate::server::call_log::{CallLogEntry, CallLogEvent};

/// A 1:1 request that has not been answered yet.
#[derive(Debug, Clone)]
pub struct PendingCall {
	/// Distinguishes repeated requests between the same pair.
	pub attempt: u64,
	/// The connection that placed the call; answers go only there.
	pub caller_conn: ConnId,
	pub media: MediaKind,
	pub requested_at_unix_ms: i64,
}

/// An accepted call and the connections taking part in it.
#[derive(Debug, Clone)]
pub struct CallSession {
	pub id: CallRoomId,
	pub kind: CallKind,
	pub caller: UserId,
	pub callee: Option<UserId>,
	pub room: Option<RoomId>,
	pub media: MediaKind,
	pub state: CallState,
	participants: HashMap<ConnId, UserId>,
}

impl CallSession {
	pub fn direct(id: CallRoomId, caller: UserId, callee: UserId, media: MediaKind) -> Self {
		Self {
			id,
			kind: CallKind::Direct,
			caller,
			callee: Some(callee),
			room: None,
			media,
			state: CallState::Accepted,
			participants: HashMap::new(),
		}
	}

	pub fn group(room: &RoomId, caller: UserId, media: MediaKind) -> Self {
		Self {
			id: CallRoomId::group(room),
			kind: CallKind::Group,
			caller,
			callee: None,
			room: Some(room.clone()),
			media,
			state: CallState::Active,
			participants: HashMap::new(),
		}
	}

	pub fn participants(&self) -> impl Iterator<Item = (ConnId, &UserId)> {
		self.participants.iter().map(|(c, u)| (*c, u))
	}

	pub fn has_user(&self, user: &UserId) -> bool {
		self.participants.values().any(|u| u == user)
	}

	/// A 1:1 call needs both ends; a group call lives while anyone is left.
	fn is_viable(&self) -> bool {
		match self.kind {
			CallKind::Direct => self.participants.len() >= 2,
			CallKind::Group => !self.participants.is_empty(),
		}
	}

	fn transition(&mut self, next: CallState) -> bool {
		if self.state.can_transition_to(next) {
			self.state = next;
			true
		} else {
			false
		}
	}
}

/// What remains after a connection left a call room.
#[derive(Debug, Clone)]
pub struct Departure {
	pub session: CallSession,
	pub remaining: Vec<(ConnId, UserId)>,
	pub dissolved: bool,
}

type PendingKey = (UserId, UserId);

/// Pending 1:1 requests and live call rooms.
///
/// A user is busy while any of their connections participates in a call
/// room; pending requests do not make anyone busy.
#[derive(Debug, Default)]
pub struct CallRegistry {
	pending: HashMap<PendingKey, PendingCall>,
	sessions: HashMap<CallRoomId, CallSession>,
	conn_calls: HashMap<ConnId, HashSet<CallRoomId>>,
	user_calls: HashMap<UserId, usize>,
}

impl CallRegistry {
	pub fn is_busy(&self, user: &UserId) -> bool {
		self.user_calls.get(user).is_some_and(|n| *n > 0)
	}

	pub fn pending_count(&self) -> usize {
		self.pending.len()
	}

	pub fn session_count(&self) -> usize {
		self.sessions.len()
	}

	pub fn session(&self, id: &CallRoomId) -> Option<&CallSession> {
		self.sessions.get(id)
	}

	#[cfg(test)]
	pub fn pending(&self, caller: &UserId, callee: &UserId) -> Option<&PendingCall> {
		self.pending.get(&(caller.clone(), callee.clone()))
	}

	/// Returns the attempt this one replaced, if any.
	pub fn insert_pending(&mut self, caller: &UserId, callee: &UserId, call: PendingCall) -> Option<PendingCall> {
		self.pending.insert((caller.clone(), callee.clone()), call)
	}

	pub fn take_pending(&mut self, caller: &UserId, callee: &UserId) -> Option<PendingCall> {
		self.pending.remove(&(caller.clone(), callee.clone()))
	}

	/// Remove the pending request only if it is still the given attempt.
	pub fn take_pending_if(&mut self, caller: &UserId, callee: &UserId, attempt: u64) -> Option<PendingCall> {
		let key = (caller.clone(), callee.clone());
		if self.pending.get(&key).is_some_and(|p| p.attempt == attempt) {
			self.pending.remove(&key)
		} else {
			None
		}
	}

	fn drain_pending_where(&mut self, pred: impl Fn(&PendingKey, &PendingCall) -> bool) -> Vec<(PendingKey, PendingCall)> {
		let keys: Vec<PendingKey> = self
			.pending
			.iter()
			.filter(|(k, p)| pred(*k, *p))
			.map(|(k, _)| k.clone())
			.collect();
		keys.into_iter()
			.filter_map(|k| self.pending.remove(&k).map(|p| (k, p)))
			.collect()
	}

	/// Every pending request where `user` is caller or callee.
	pub fn drain_pending_involving(&mut self, user: &UserId) -> Vec<(PendingKey, PendingCall)> {
		self.drain_pending_where(|(caller, callee), _| caller == user || callee == user)
	}

	/// Requests placed from one connection.
	pub fn drain_pending_from_conn(&mut self, conn_id: ConnId) -> Vec<(PendingKey, PendingCall)> {
		self.drain_pending_where(|_, p| p.caller_conn == conn_id)
	}

	/// Requests ringing `callee`.
	pub fn drain_pending_to(&mut self, callee: &UserId) -> Vec<(PendingKey, PendingCall)> {
		self.drain_pending_where(|(_, c), _| c == callee)
	}

	/// A direct call-room id not currently in use.
	pub fn unused_direct_id(&self, caller: &UserId, callee: &UserId, now_unix_ms: i64) -> CallRoomId {
		let mut ms = now_unix_ms;
		loop {
			let id = CallRoomId::direct(caller, callee, ms);
			if !self.sessions.contains_key(&id) {
				return id;
			}
			ms += 1;
		}
	}

	pub fn open_session(&mut self, session: CallSession, participants: &[(ConnId, UserId)]) {
		let id = session.id.clone();
		self.sessions.insert(id.clone(), session);
		for (conn_id, user) in participants {
			self.join_session(&id, *conn_id, user);
		}
	}

	/// Add a connection to a call room. Returns false if it was already in.
	pub fn join_session(&mut self, id: &CallRoomId, conn_id: ConnId, user: &UserId) -> bool {
		let Some(session) = self.sessions.get_mut(id) else {
			return false;
		};
		if session.participants.insert(conn_id, user.clone()).is_some() {
			return false;
		}
		self.conn_calls.entry(conn_id).or_default().insert(id.clone());
		*self.user_calls.entry(user.clone()).or_default() += 1;
		true
	}

	/// Join the room's group call, opening it if nobody is in it yet.
	/// Returns true when this call opened the group call.
	pub fn join_group(&mut self, room: &RoomId, conn_id: ConnId, user: &UserId, media: MediaKind) -> bool {
		let id = CallRoomId::group(room);
		let opened = !self.sessions.contains_key(&id);
		if opened {
			self.sessions.insert(id.clone(), CallSession::group(room, user.clone(), media));
		}
		self.join_session(&id, conn_id, user);
		opened
	}

	/// Remove a connection from a call room, dissolving it when it is no
	/// longer viable.
	pub fn leave_session(&mut self, id: &CallRoomId, conn_id: ConnId) -> Option<Departure> {
		let session = self.sessions.get_mut(id)?;
		let user = session.participants.remove(&conn_id)?;

		self.release(conn_id, id, &user);

		let session = self.sessions.get(id)?;
		if session.is_viable() {
			return Some(Departure {
				session: session.clone(),
				remaining: session.participants().map(|(c, u)| (c, u.clone())).collect(),
				dissolved: false,
			});
		}

		let mut session = self.sessions.remove(id)?;
		let remaining: Vec<(ConnId, UserId)> = session.participants.drain().collect();
		for (c, u) in &remaining {
			self.release(*c, id, u);
		}
		session.transition(CallState::Ended);
		Some(Departure {
			session,
			remaining,
			dissolved: true,
		})
	}

	/// Remove a connection from every call room it is in.
	pub fn leave_all(&mut self, conn_id: ConnId) -> Vec<Departure> {
		let ids: Vec<CallRoomId> = self
			.conn_calls
			.get(&conn_id)
			.map(|s| s.iter().cloned().collect())
			.unwrap_or_default();
		ids.iter().filter_map(|id| self.leave_session(id, conn_id)).collect()
	}

	fn release(&mut self, conn_id: ConnId, id: &CallRoomId, user: &UserId) {
		if let Some(set) = self.conn_calls.get_mut(&conn_id) {
			set.remove(id);
			if set.is_empty() {
				self.conn_calls.remove(&conn_id);
			}
		}
		if let Some(n) = self.user_calls.get_mut(user) {
			*n = n.saturating_sub(1);
			if *n == 0 {
				self.user_calls.remove(user);
			}
		}
	}

	/// Connections of `peer` that share a call room with `conn_id`.
	pub fn peer_conns_sharing(&self, conn_id: ConnId, peer: &UserId) -> Vec<ConnId> {
		let mut out = BTreeSet::new();
		for id in self.conn_calls.get(&conn_id).into_iter().flatten() {
			if let Some(session) = self.sessions.get(id) {
				out.extend(session.participants().filter(|(_, u)| *u == peer).map(|(c, _)| c));
			}
		}
		out.into_iter().collect()
	}

	/// Mark accepted 1:1 calls between `conn_id` and `peer` active.
	pub fn activate_between(&mut self, conn_id: ConnId, peer: &UserId) -> Vec<CallRoomId> {
		let Some(ids) = self.conn_calls.get(&conn_id) else {
			return Vec::new();
		};
		let mut activated = Vec::new();
		for id in ids {
			if let Some(session) = self.sessions.get_mut(id)
				&& session.kind == CallKind::Direct
				&& session.state == CallState::Accepted
				&& session.has_user(peer)
				&& session.transition(CallState::Active)
			{
				activated.push(id.clone());
			}
		}
		activated
	}
}

impl Hub {
	fn log_call(&self, entry: CallLogEntry) {
		self.inner.call_log.record(entry);
	}

	/// Check that `callee` can be rung by `caller` right now.
	fn call_precheck(&self, caller: &UserId, callee: &UserId) -> Result<(), HubError> {
		if !self.inner.connections.is_connected(callee) {
			return Err(HubError::Offline(callee.clone()));
		}
		let calls = lock(&self.inner.calls);
		if calls.is_busy(callee) {
			return Err(HubError::Busy(callee.clone()));
		}
		if calls.is_busy(caller) {
			return Err(HubError::Busy(caller.clone()));
		}
		Ok(())
	}

	fn reject_to(&self, conn_id: ConnId, from: &UserId, reason: RejectReason) {
		self.inner.connections.send(
			conn_id,
			ServerEvent::CallRejected {
				from: from.clone(),
				reason,
				message: reason.describe().to_string(),
			},
		);
		metrics::counter!("parley_server_calls_rejected_total", "reason" => reason.as_str()).increment(1);
	}

	/// Tell a user's connections, except `skip`, that a call went away.
	fn end_to_user_except(&self, user: &UserId, skip: Option<ConnId>, from: &UserId) {
		let targets: Vec<ConnId> = self
			.inner
			.connections
			.user_conns(user)
			.into_iter()
			.filter(|c| Some(*c) != skip)
			.collect();
		self.inner
			.connections
			.send_many(targets, &ServerEvent::CallEnded { from: from.clone() });
	}

	pub(super) async fn request_call(&self, me: &ConnIdentity, to: UserId, media: MediaKind) -> Result<(), HubError> {
		if to == me.user_id {
			return Err(HubError::Validation("cannot call yourself".to_string()));
		}
		let inner = &self.inner;
		let _pair = inner.user_locks.lock_many(&[&me.user_id, &to]).await;

		metrics::counter!("parley_server_calls_requested_total").increment(1);

		let refusal = match self.call_precheck(&me.user_id, &to) {
			Ok(()) => None,
			Err(HubError::Offline(_)) => Some(RejectReason::Offline),
			Err(HubError::Busy(user)) if user == to => Some(RejectReason::Busy),
			Err(other) => return Err(other),
		};
		if let Some(reason) = refusal {
			self.reject_to(me.conn_id, &to, reason);
			self.log_call(
				CallLogEntry::direct(CallLogEvent::Rejected, &me.user_id, &to)
					.with_media(media)
					.with_reason(reason.as_str()),
			);
			info!(caller = %me.user_id, callee = %to, reason = reason.as_str(), "call: request rejected");
			return Ok(());
		}

		let attempt = inner.next_attempt.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
		let replaced = lock(&inner.calls).insert_pending(
			&me.user_id,
			&to,
			PendingCall {
				attempt,
				caller_conn: me.conn_id,
				media,
				requested_at_unix_ms: parley_util::unix_ms_now(),
			},
		);
		if let Some(prev) = replaced
			&& prev.caller_conn != me.conn_id
		{
			// The other tab's ring is superseded.
			self.reject_to(prev.caller_conn, &to, RejectReason::Busy);
		}

		inner.connections.send_to_user(
			&to,
			&ServerEvent::CallRequest {
				caller_id: me.user_id.clone(),
				caller_name: me.display_name.clone(),
				media,
			},
		);
		self.log_call(CallLogEntry::direct(CallLogEvent::Requested, &me.user_id, &to).with_media(media));
		info!(caller = %me.user_id, callee = %to, attempt, ?media, "call: requested");

		self.spawn_ring_timeout(me.user_id.clone(), to, attempt);
		Ok(())
	}

	fn spawn_ring_timeout(&self, caller: UserId, callee: UserId, attempt: u64) {
		let weak = Arc::downgrade(&self.inner);
		let ring_timeout = self.inner.settings.ring_timeout;
		tokio::spawn(async move {
			tokio::time::sleep(ring_timeout).await;
			if let Some(inner) = weak.upgrade() {
				Hub { inner }.expire_call(&caller, &callee, attempt).await;
			}
		});
	}

	async fn expire_call(&self, caller: &UserId, callee: &UserId, attempt: u64) {
		let _pair = self.inner.user_locks.lock_many(&[caller, callee]).await;

		let Some(pending) = lock(&self.inner.calls).take_pending_if(caller, callee, attempt) else {
			return;
		};

		self.reject_to(pending.caller_conn, callee, RejectReason::TimedOut);
		self.end_to_user_except(callee, None, caller);
		self.log_call(CallLogEntry::direct(CallLogEvent::TimedOut, caller, callee).with_media(pending.media));
		info!(caller = %caller, callee = %callee, attempt, "call: ring timed out");
	}

	pub(super) async fn accept_call(&self, me: &ConnIdentity, caller: UserId) -> Result<(), HubError> {
		let inner = &self.inner;
		let _pair = inner.user_locks.lock_many(&[&caller, &me.user_id]).await;

		let Some(pending) = lock(&inner.calls).take_pending(&caller, &me.user_id) else {
			inner
				.connections
				.send(me.conn_id, ServerEvent::CallAcceptIgnored { caller: caller.clone() });
			debug!(callee = %me.user_id, caller = %caller, "call: accept with nothing pending ignored");
			return Ok(());
		};

		if inner.connections.identity(pending.caller_conn).is_none() {
			inner
				.connections
				.send(me.conn_id, ServerEvent::CallEnded { from: caller.clone() });
			debug!(callee = %me.user_id, caller = %caller, "call: caller connection gone before accept");
			return Ok(());
		}

		let now = parley_util::unix_ms_now();
		let (call_room_id, superseded) = {
			let mut calls = lock(&inner.calls);
			let id = calls.unused_direct_id(&caller, &me.user_id, now);
			calls.open_session(
				CallSession::direct(id.clone(), caller.clone(), me.user_id.clone(), pending.media),
				&[(pending.caller_conn, caller.clone()), (me.conn_id, me.user_id.clone())],
			);
			let mut superseded = calls.drain_pending_involving(&caller);
			superseded.extend(calls.drain_pending_involving(&me.user_id));
			(id, superseded)
		};

		inner.connections.send(
			pending.caller_conn,
			ServerEvent::CallAccepted {
				from: me.user_id.clone(),
				call_room_id: call_room_id.clone(),
			},
		);
		self.end_to_user_except(&me.user_id, Some(me.conn_id), &caller);

		for ((other_caller, other_callee), p) in superseded {
			if other_caller == caller || other_caller == me.user_id {
				self.end_to_user_except(&other_callee, None, &other_caller);
			} else {
				self.reject_to(p.caller_conn, &other_callee, RejectReason::Busy);
			}
		}

		metrics::counter!("parley_server_calls_accepted_total").increment(1);
		self.log_call(
			CallLogEntry::direct(CallLogEvent::Accepted, &caller, &me.user_id)
				.with_call_room(&call_room_id)
				.with_media(pending.media),
		);
		info!(
			caller = %caller,
			callee = %me.user_id,
			call_room_id = %call_room_id,
			ring_ms = now - pending.requested_at_unix_ms,
			"call: accepted"
		);
		Ok(())
	}

	pub(super) async fn reject_call(&self, me: &ConnIdentity, caller: UserId, reason: Option<RejectReason>) -> Result<(), HubError> {
		let inner = &self.inner;
		let _pair = inner.user_locks.lock_many(&[&caller, &me.user_id]).await;

		let Some(pending) = lock(&inner.calls).take_pending(&caller, &me.user_id) else {
			debug!(callee = %me.user_id, caller = %caller, "call: reject with nothing pending ignored");
			return Ok(());
		};

		let reason = reason.unwrap_or(RejectReason::Declined);
		self.reject_to(pending.caller_conn, &me.user_id, reason);
		self.end_to_user_except(&me.user_id, Some(me.conn_id), &caller);
		self.log_call(
			CallLogEntry::direct(CallLogEvent::Rejected, &caller, &me.user_id)
				.with_media(pending.media)
				.with_reason(reason.as_str()),
		);
		info!(caller = %caller, callee = %me.user_id, reason = reason.as_str(), "call: rejected");
		Ok(())
	}

	pub(super) async fn end_call(&self, me: &ConnIdentity, peer: UserId) -> Result<(), HubError> {
		let inner = &self.inner;
		let _pair = inner.user_locks.lock_many(&[&me.user_id, &peer]).await;

		let (outgoing, incoming, departures) = {
			let mut calls = lock(&inner.calls);
			let outgoing = calls.take_pending(&me.user_id, &peer);
			let incoming = calls.take_pending(&peer, &me.user_id);
			(outgoing, incoming, calls.leave_all(me.conn_id))
		};

		if let Some(p) = &incoming {
			self.reject_to(p.caller_conn, &me.user_id, RejectReason::Declined);
		}

		let mut notified: BTreeSet<ConnId> = inner.connections.user_conns(&peer).into_iter().collect();
		inner
			.connections
			.send_many(notified.iter().copied(), &ServerEvent::CallEnded { from: me.user_id.clone() });

		for dep in departures {
			self.finish_departure(me, &dep, &mut notified);
		}

		if outgoing.is_some() {
			self.log_call(CallLogEntry::direct(CallLogEvent::Ended, &me.user_id, &peer).with_reason("cancelled"));
		}
		info!(user_id = %me.user_id, peer = %peer, cancelled = outgoing.is_some(), declined = incoming.is_some(), "call: ended");
		Ok(())
	}

	/// Notify whoever is left after `me` left a call room.
	fn finish_departure(&self, me: &ConnIdentity, dep: &Departure, notified: &mut BTreeSet<ConnId>) {
		match dep.session.kind {
			CallKind::Direct => {
				if !dep.dissolved {
					return;
				}
				let targets: Vec<ConnId> = dep
					.remaining
					.iter()
					.map(|(c, _)| *c)
					.filter(|c| notified.insert(*c))
					.collect();
				self.inner
					.connections
					.send_many(targets, &ServerEvent::CallEnded { from: me.user_id.clone() });

				let callee = dep.session.callee.as_ref().unwrap_or(&me.user_id);
				self.log_call(
					CallLogEntry::direct(CallLogEvent::Ended, &dep.session.caller, callee)
						.with_call_room(&dep.session.id)
						.with_media(dep.session.media),
				);
				metrics::counter!("parley_server_calls_ended_total").increment(1);
				info!(call_room_id = %dep.session.id, by = %me.user_id, "call: room dissolved");
			}
			CallKind::Group => {
				let Some(room) = &dep.session.room else {
					return;
				};
				let targets = lock(&self.inner.rooms).conns(room);
				self.inner.connections.send_many(
					targets,
					&ServerEvent::GroupCallEnded {
						room_id: room.clone(),
						from: me.user_id.clone(),
					},
				);
				if dep.dissolved {
					self.log_call(
						CallLogEntry::group(CallLogEvent::GroupEnded, &me.user_id, room).with_call_room(&dep.session.id),
					);
					info!(call_room_id = %dep.session.id, room_id = %room, "call: group call dissolved");
				}
			}
		}
	}

	/// Relay a signaling event to `to`, preferring the connections that
	/// share a call room with the sender.
	pub(super) fn relay_signal(&self, me: &ConnIdentity, to: &UserId, ev: ServerEvent) {
		let inner = &self.inner;
		let (sharing, activated) = {
			let mut calls = lock(&inner.calls);
			(calls.peer_conns_sharing(me.conn_id, to), calls.activate_between(me.conn_id, to))
		};
		let targets = if sharing.is_empty() {
			inner.connections.user_conns(to)
		} else {
			sharing
		};

		if targets.is_empty() {
			metrics::counter!("parley_server_signals_dropped_total").increment(1);
			debug!(from = %me.user_id, to = %to, event = ev.name(), "call: signal target offline; dropped");
			return;
		}

		for id in activated {
			info!(call_room_id = %id, "call: active");
		}
		inner.connections.send_many(targets, &ev);
	}

	/// Relays to `to`, dropping silently when they are gone.
	fn relay_to_user(&self, to: &UserId, ev: ServerEvent) {
		if self.inner.connections.send_to_user(to, &ev) == 0 {
			metrics::counter!("parley_server_signals_dropped_total").increment(1);
			debug!(to = %to, event = ev.name(), "call: relay target offline; dropped");
		}
	}

	pub(super) async fn group_request(&self, me: &ConnIdentity, room: RoomId, media: MediaKind) -> Result<(), HubError> {
		let inner = &self.inner;
		if !inner.connections.in_room(me.conn_id, &room) {
			return Err(HubError::Unauthorized(format!("join room {room} before starting a call there")));
		}
		let _room_guard = inner.room_locks.lock(&room).await;

		let opened = lock(&inner.calls).join_group(&room, me.conn_id, &me.user_id, media);
		let targets = lock(&inner.rooms).conns_except_user(&room, &me.user_id);
		inner.connections.send_many(
			targets,
			&ServerEvent::GroupCallRequest {
				room_id: room.clone(),
				caller_id: me.user_id.clone(),
				caller_name: me.display_name.clone(),
				media,
			},
		);

		metrics::counter!("parley_server_group_calls_requested_total").increment(1);
		self.log_call(
			CallLogEntry::group(CallLogEvent::GroupRequested, &me.user_id, &room)
				.with_call_room(&CallRoomId::group(&room))
				.with_media(media),
		);
		info!(caller = %me.user_id, room_id = %room, opened, "call: group call requested");
		Ok(())
	}

	pub(super) async fn group_accept(&self, me: &ConnIdentity, room: RoomId, to: UserId) -> Result<(), HubError> {
		let inner = &self.inner;
		if !inner.connections.in_room(me.conn_id, &room) {
			return Err(HubError::Unauthorized(format!("join room {room} before joining its call")));
		}
		let _room_guard = inner.room_locks.lock(&room).await;

		let call_room_id = CallRoomId::group(&room);
		{
			let mut calls = lock(&inner.calls);
			let media = calls.session(&call_room_id).map(|s| s.media).unwrap_or_default();
			calls.join_group(&room, me.conn_id, &me.user_id, media);
		}

		self.relay_to_user(
			&to,
			ServerEvent::GroupCallAccepted {
				room_id: room.clone(),
				from: me.user_id.clone(),
				call_room_id,
			},
		);
		info!(user_id = %me.user_id, room_id = %room, to = %to, "call: group call joined");
		Ok(())
	}

	pub(super) fn group_reject(&self, me: &ConnIdentity, room: RoomId, to: UserId) {
		debug!(user_id = %me.user_id, room_id = %room, to = %to, "call: group call declined");
		self.relay_to_user(
			&to,
			ServerEvent::GroupCallRejected {
				room_id: room,
				from: me.user_id.clone(),
			},
		);
	}

	pub(super) async fn group_end(&self, me: &ConnIdentity, room: RoomId) -> Result<(), HubError> {
		let inner = &self.inner;
		let _room_guard = inner.room_locks.lock(&room).await;

		let departure = lock(&inner.calls).leave_session(&CallRoomId::group(&room), me.conn_id);
		match departure {
			Some(dep) => {
				let mut notified = BTreeSet::new();
				self.finish_departure(me, &dep, &mut notified);
			}
			None => {
				// Not in the call; still tell the room, as a hang-up before joining.
				let targets = lock(&inner.rooms).conns(&room);
				inner.connections.send_many(
					targets,
					&ServerEvent::GroupCallEnded {
						room_id: room.clone(),
						from: me.user_id.clone(),
					},
				);
			}
		}
		Ok(())
	}

	pub(super) fn group_signal(&self, me: &ConnIdentity, room: RoomId, to: UserId, payload: Value) {
		self.relay_to_user(
			&to,
			ServerEvent::GroupCallSignal {
				room_id: room,
				from: me.user_id.clone(),
				payload,
			},
		);
	}

	/// Drop every call obligation of a closing connection.
	///
	/// `last_conn` is true when the user has no other live connection, in
	/// which case calls ringing them are answered as offline.
	pub(super) fn teardown_calls(&self, me: &ConnIdentity, last_conn: bool) {
		let inner = &self.inner;
		let (pending, departures) = {
			let mut calls = lock(&inner.calls);
			let mut pending = calls.drain_pending_from_conn(me.conn_id);
			if last_conn {
				pending.extend(calls.drain_pending_to(&me.user_id));
			}
			(pending, calls.leave_all(me.conn_id))
		};

		for ((caller, callee), p) in pending {
			if caller == me.user_id {
				self.end_to_user_except(&callee, None, &caller);
				self.log_call(CallLogEntry::direct(CallLogEvent::Ended, &caller, &callee).with_reason("caller_disconnected"));
			} else {
				self.reject_to(p.caller_conn, &me.user_id, RejectReason::Offline);
				self.log_call(
					CallLogEntry::direct(CallLogEvent::Rejected, &caller, &callee)
						.with_media(p.media)
						.with_reason(RejectReason::Offline.as_str()),
				);
			}
		}

		let mut notified = BTreeSet::new();
		for dep in departures {
			self.finish_departure(me, &dep, &mut notified);
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn uid(s: &str) -> UserId {
		UserId::new(s).unwrap()
	}

	fn pending(attempt: u64, conn: ConnId) -> PendingCall {
		PendingCall {
			attempt,
			caller_conn: conn,
			media: MediaKind::Video,
			requested_at_unix_ms: 0,
		}
	}

	#[test]
	fn stale_attempt_is_not_taken() {
		let mut reg = CallRegistry::default();
		reg.insert_pending(&uid("a"), &uid("b"), pending(1, 10));
		reg.insert_pending(&uid("a"), &uid("b"), pending(2, 10));
		assert!(reg.take_pending_if(&uid("a"), &uid("b"), 1).is_none());
		assert_eq!(reg.take_pending_if(&uid("a"), &uid("b"), 2).map(|p| p.attempt), Some(2));
		assert_eq!(reg.pending_count(), 0);
	}

	#[test]
	fn direct_room_dissolves_when_one_side_leaves() {
		let mut reg = CallRegistry::default();
		let id = reg.unused_direct_id(&uid("a"), &uid("b"), 100);
		reg.open_session(
			CallSession::direct(id.clone(), uid("a"), uid("b"), MediaKind::Audio),
			&[(1, uid("a")), (2, uid("b"))],
		);
		assert!(reg.is_busy(&uid("a")));
		assert!(reg.is_busy(&uid("b")));

		let dep = reg.leave_session(&id, 1).unwrap();
		assert!(dep.dissolved);
		assert_eq!(dep.remaining, vec![(2, uid("b"))]);
		assert_eq!(dep.session.state, CallState::Ended);
		assert!(!reg.is_busy(&uid("a")));
		assert!(!reg.is_busy(&uid("b")));
		assert_eq!(reg.session_count(), 0);
		assert!(reg.leave_all(2).is_empty());
	}

	#[test]
	fn direct_ids_do_not_collide() {
		let mut reg = CallRegistry::default();
		let first = reg.unused_direct_id(&uid("a"), &uid("b"), 5);
		reg.open_session(CallSession::direct(first.clone(), uid("a"), uid("b"), MediaKind::Video), &[]);
		let second = reg.unused_direct_id(&uid("a"), &uid("b"), 5);
		assert_ne!(first, second);
		assert_eq!(second.as_str(), "call_a_b_6");
	}

	#[test]
	fn group_call_lives_until_last_participant() {
		let mut reg = CallRegistry::default();
		let room = RoomId::new("lobby").unwrap();
		assert!(reg.join_group(&room, 1, &uid("a"), MediaKind::Video));
		assert!(!reg.join_group(&room, 2, &uid("b"), MediaKind::Video));

		let id = CallRoomId::group(&room);
		let dep = reg.leave_session(&id, 1).unwrap();
		assert!(!dep.dissolved);
		assert!(reg.is_busy(&uid("b")));

		let dep = reg.leave_session(&id, 2).unwrap();
		assert!(dep.dissolved);
		assert!(dep.remaining.is_empty());
		assert!(reg.session(&id).is_none());
	}

	#[test]
	fn first_signal_activates_accepted_call_once() {
		let mut reg = CallRegistry::default();
		let id = reg.unused_direct_id(&uid("a"), &uid("b"), 1);
		reg.open_session(
			CallSession::direct(id.clone(), uid("a"), uid("b"), MediaKind::Video),
			&[(1, uid("a")), (2, uid("b"))],
		);
		assert_eq!(reg.peer_conns_sharing(1, &uid("b")), vec![2]);
		assert_eq!(reg.activate_between(1, &uid("b")), vec![id.clone()]);
		assert!(reg.activate_between(2, &uid("a")).is_empty());
		assert_eq!(reg.session(&id).map(|s| s.state), Some(CallState::Active));
	}

	#[test]
	fn drains_by_user_and_by_conn() {
		let mut reg = CallRegistry::default();
		reg.insert_pending(&uid("a"), &uid("b"), pending(1, 10));
		reg.insert_pending(&uid("c"), &uid("a"), pending(2, 30));
		reg.insert_pending(&uid("c"), &uid("d"), pending(3, 31));

		assert_eq!(reg.drain_pending_from_conn(31).len(), 1);
		let involving = reg.drain_pending_involving(&uid("a"));
		assert_eq!(involving.len(), 2);
		assert_eq!(reg.pending_count(), 0);
	}
}
