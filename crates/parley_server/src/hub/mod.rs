#![forbid(unsafe_code)]

//! The connection hub: presence, runtime room membership, message fan-out
//! and call signaling for every live connection of this process.
//!
//! Events from one connection are dispatched sequentially by its handler,
//! and `disconnect` runs after the last of them. Shared tables are guarded
//! by short critical sections; multi-step operations are serialized per key
//! through striped locks, always taken user -> room.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use parley_domain::{CorrelationId, RoomId, UserId, ValidationError};
use parley_protocol::{ClientEvent, ServerEvent};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::config::HubSettings;
use crate::server::call_log::CallLog;
use crate::server::identity::Identity;
use crate::store::{MessageStore, StoreError};

pub mod calls;
pub mod connections;
pub mod locks;
pub mod messages;
pub mod presence;
pub mod rooms;

#[cfg(test)]
mod calls_tests;
#[cfg(test)]
mod test_support;

pub use connections::{ConnId, ConnIdentity};

use self::calls::CallRegistry;
use self::connections::ConnectionTable;
use self::locks::{KeyedLocks, lock};
use self::presence::PresenceRegistry;
use self::rooms::{JoinOutcome, LeaveOutcome, RoomMembership};

/// Errors surfaced to the connection that sent the offending event.
#[derive(Debug, Error)]
pub enum HubError {
	#[error("{0}")]
	Validation(String),
	#[error("{0}")]
	Unauthorized(String),
	#[error("{0}")]
	NotFound(String),
	#[error("user {0} is offline")]
	Offline(UserId),
	#[error("user {0} is busy")]
	Busy(UserId),
	#[error("{0}")]
	Persistence(String),
	#[error("too many events; slow down")]
	RateLimited,
}

impl HubError {
	/// Stable wire code.
	pub fn code(&self) -> &'static str {
		match self {
			Self::Validation(_) => "validation",
			Self::Unauthorized(_) => "unauthorized",
			Self::NotFound(_) => "not_found",
			Self::Offline(_) => "offline",
			Self::Busy(_) => "busy",
			Self::Persistence(_) => "persistence",
			Self::RateLimited => "rate_limited",
		}
	}

	pub fn to_event(&self, correlation_id: Option<CorrelationId>) -> ServerEvent {
		ServerEvent::Error {
			code: self.code().to_string(),
			message: self.to_string(),
			correlation_id,
		}
	}
}

impl From<ValidationError> for HubError {
	fn from(e: ValidationError) -> Self {
		Self::Validation(e.to_string())
	}
}

impl From<StoreError> for HubError {
	fn from(e: StoreError) -> Self {
		match e {
			StoreError::NotFound(id) => Self::NotFound(format!("message {id} not found")),
			other => Self::Persistence(other.to_string()),
		}
	}
}

/// Result of registering a connection.
#[derive(Debug, Clone)]
pub struct Connected {
	pub conn_id: ConnId,
	/// Users online at registration time, excluding the connecting user.
	pub online_users: Vec<UserId>,
}

/// Point-in-time counters served on `/stats`.
#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct HubStats {
	pub connections: usize,
	pub online_users: usize,
	pub rooms: usize,
	pub pending_calls: usize,
	pub call_sessions: usize,
}

#[derive(Clone)]
pub struct Hub {
	inner: Arc<HubInner>,
}

struct HubInner {
	settings: HubSettings,
	store: Arc<dyn MessageStore>,
	call_log: CallLog,

	connections: ConnectionTable,
	presence: Mutex<PresenceRegistry>,
	rooms: Mutex<RoomMembership>,
	calls: Mutex<CallRegistry>,

	user_locks: KeyedLocks,
	room_locks: KeyedLocks,
	send_locks: KeyedLocks,

	next_conn_id: AtomicU64,
	next_attempt: AtomicU64,
}

impl Hub {
	pub fn new(settings: HubSettings, store: Arc<dyn MessageStore>, call_log: CallLog) -> Self {
		let stripes = settings.lock_stripes;
		Self {
			inner: Arc::new(HubInner {
				settings,
				store,
				call_log,
				connections: ConnectionTable::default(),
				presence: Mutex::new(PresenceRegistry::default()),
				rooms: Mutex::new(RoomMembership::default()),
				calls: Mutex::new(CallRegistry::default()),
				user_locks: KeyedLocks::new(stripes),
				room_locks: KeyedLocks::new(stripes),
				send_locks: KeyedLocks::new(stripes),
				next_conn_id: AtomicU64::new(1),
				next_attempt: AtomicU64::new(1),
			}),
		}
	}

	pub fn is_online(&self, user: &UserId) -> bool {
		lock(&self.inner.presence).is_online(user)
	}

	pub fn room_members(&self, room: &RoomId) -> Vec<UserId> {
		lock(&self.inner.rooms).members(room)
	}

	pub fn stats(&self) -> HubStats {
		let online_users = lock(&self.inner.presence).online_count();
		let rooms = lock(&self.inner.rooms).room_count();
		let (pending_calls, call_sessions) = {
			let calls = lock(&self.inner.calls);
			(calls.pending_count(), calls.session_count())
		};
		HubStats {
			connections: self.inner.connections.len(),
			online_users,
			rooms,
			pending_calls,
			call_sessions,
		}
	}

	/// Register a verified connection and announce the user if they just came online.
	pub async fn connect(&self, identity: &Identity, outbound: mpsc::Sender<ServerEvent>) -> Connected {
		let inner = &self.inner;
		let conn_id = inner.next_conn_id.fetch_add(1, Ordering::Relaxed);
		let user = &identity.user_id;

		let _user_guard = inner.user_locks.lock(user).await;

		inner
			.connections
			.insert(conn_id, user.clone(), identity.display_name.clone(), outbound);

		let came_online = lock(&inner.presence).register(user, conn_id);
		if came_online {
			inner
				.connections
				.broadcast_except_user(user, &ServerEvent::UserOnline { user_id: user.clone() });
		}

		let (online_users, online_count) = {
			let presence = lock(&inner.presence);
			let users: Vec<UserId> = presence.online_users().into_iter().filter(|u| u != user).collect();
			(users, presence.online_count())
		};

		metrics::gauge!("parley_server_active_connections").set(inner.connections.len() as f64);
		metrics::gauge!("parley_server_online_users").set(online_count as f64);
		info!(conn_id, user_id = %user, came_online, "hub: connection registered");

		Connected { conn_id, online_users }
	}

	/// Tear down everything a connection owned: rooms, calls, presence.
	///
	/// Runs as one unit under the user's lock so a reconnect cannot
	/// interleave with it.
	pub async fn disconnect(&self, conn_id: ConnId) {
		let inner = &self.inner;
		let Some(me) = inner.connections.identity(conn_id) else {
			return;
		};

		let _user_guard = inner.user_locks.lock(&me.user_id).await;

		for room in inner.connections.rooms_of(conn_id) {
			self.leave_room(&me, &room, false).await;
		}

		let last_conn = inner.connections.user_conns(&me.user_id).iter().all(|c| *c == conn_id);
		self.teardown_calls(&me, last_conn);

		inner.connections.remove(conn_id);

		let now = parley_util::unix_ms_now();
		let went_offline = lock(&inner.presence).unregister(&me.user_id, conn_id, now);
		if let Some(last_seen_unix_ms) = went_offline {
			inner.connections.broadcast_except_user(
				&me.user_id,
				&ServerEvent::UserOffline {
					user_id: me.user_id.clone(),
					last_seen_unix_ms,
				},
			);
		}

		let online_count = lock(&inner.presence).online_count();
		metrics::gauge!("parley_server_active_connections").set(inner.connections.len() as f64);
		metrics::gauge!("parley_server_online_users").set(online_count as f64);
		info!(
			conn_id,
			user_id = %me.user_id,
			went_offline = went_offline.is_some(),
			"hub: connection unregistered"
		);
	}

	/// Handle one inbound event. Failures go back to the sender only.
	pub async fn dispatch(&self, conn_id: ConnId, ev: ClientEvent) {
		let Some(me) = self.inner.connections.identity(conn_id) else {
			debug!(conn_id, "hub: event for unknown connection ignored");
			return;
		};

		metrics::counter!("parley_server_events_in_total").increment(1);
		let event = ev.name();

		if let Some(claimed) = ev.claimed_sender()
			&& claimed != &me.user_id
		{
			warn!(conn_id, user_id = %me.user_id, claimed = %claimed, event, "hub: identity mismatch on call event");
			let err = HubError::Unauthorized(format!("cannot act on behalf of {claimed}"));
			self.inner.connections.send(conn_id, err.to_event(None));
			return;
		}

		let (send_correlation, other_correlation) = match &ev {
			ClientEvent::SendDirectMessage(body) | ClientEvent::SendRoomMessage(body) => {
				(body.correlation_id.clone().filter(|c| !c.is_blank()), None)
			}
			ClientEvent::DeleteMessage { correlation_id, .. } => (None, correlation_id.clone()),
			_ => (None, None),
		};

		let result = match ev {
			ClientEvent::JoinRoom { room_id } => self.join_room(&me, &room_id).await,
			ClientEvent::LeaveRoom { room_id } => {
				self.leave_room(&me, &room_id, true).await;
				Ok(())
			}
			ClientEvent::SendDirectMessage(body) => self.send_direct(&me, body).await,
			ClientEvent::SendRoomMessage(body) => self.send_room(&me, body).await,
			ClientEvent::DeleteMessage {
				message_id,
				scope,
				correlation_id,
			} => self.delete_message(&me, message_id, &scope, correlation_id).await,
			ClientEvent::CallRequest { to, media, .. } => self.request_call(&me, to, media).await,
			ClientEvent::CallAccept { caller, .. } => self.accept_call(&me, caller).await,
			ClientEvent::CallReject { caller, reason, .. } => self.reject_call(&me, caller, reason).await,
			ClientEvent::CallEnd { peer, .. } => self.end_call(&me, peer).await,
			ClientEvent::CallSignal { to, payload, .. } => {
				self.relay_signal(&me, &to, ServerEvent::CallSignal {
					from: me.user_id.clone(),
					payload,
				});
				Ok(())
			}
			ClientEvent::CalleeReady { to } => {
				self.relay_signal(&me, &to, ServerEvent::CalleeReady {
					from: me.user_id.clone(),
				});
				Ok(())
			}
			ClientEvent::GroupCallRequest { room_id, media } => self.group_request(&me, room_id, media).await,
			ClientEvent::GroupCallAccept { room_id, to } => self.group_accept(&me, room_id, to).await,
			ClientEvent::GroupCallReject { room_id, to } => {
				self.group_reject(&me, room_id, to);
				Ok(())
			}
			ClientEvent::GroupCallEnd { room_id } => self.group_end(&me, room_id).await,
			ClientEvent::GroupCallSignal { room_id, to, payload } => {
				self.group_signal(&me, room_id, to, payload);
				Ok(())
			}
			ClientEvent::Ping { client_time_unix_ms } => {
				self.inner.connections.send(
					conn_id,
					ServerEvent::Pong {
						client_time_unix_ms,
						server_time_unix_ms: parley_util::unix_ms_now(),
					},
				);
				Ok(())
			}
		};

		if let Err(err) = result {
			debug!(conn_id, user_id = %me.user_id, event, code = err.code(), error = %err, "hub: event rejected");
			let reply = match send_correlation {
				Some(correlation_id) => ServerEvent::MessageSendError {
					correlation_id,
					code: err.code().to_string(),
					error: err.to_string(),
				},
				None => err.to_event(other_correlation),
			};
			self.inner.connections.send(conn_id, reply);
		}
	}

	async fn join_room(&self, me: &ConnIdentity, room: &RoomId) -> Result<(), HubError> {
		if room.is_blank() {
			return Err(HubError::Validation("room_id must be non-empty".to_string()));
		}

		let inner = &self.inner;
		let _room_guard = inner.room_locks.lock(room).await;

		inner.connections.add_room(me.conn_id, room);
		let (outcome, targets) = {
			let mut rooms = lock(&inner.rooms);
			let outcome = rooms.join(room, &me.user_id, me.conn_id);
			(outcome, rooms.conns(room))
		};

		if outcome == JoinOutcome::UserJoined {
			inner.connections.send_many(
				targets,
				&ServerEvent::UserJoinedRoom {
					room_id: room.clone(),
					user_id: me.user_id.clone(),
					display_name: me.display_name.clone(),
				},
			);
		}
		debug!(conn_id = me.conn_id, user_id = %me.user_id, room_id = %room, ?outcome, "hub: join room");
		Ok(())
	}

	/// Leave a room; `notify_self` also tells the leaving connection.
	async fn leave_room(&self, me: &ConnIdentity, room: &RoomId, notify_self: bool) {
		let inner = &self.inner;
		let _room_guard = inner.room_locks.lock(room).await;

		inner.connections.remove_room(me.conn_id, room);
		let (outcome, remaining) = {
			let mut rooms = lock(&inner.rooms);
			let outcome = rooms.leave(room, &me.user_id, me.conn_id);
			(outcome, rooms.conns(room))
		};

		if outcome == LeaveOutcome::UserLeft {
			let mut targets: BTreeSet<ConnId> = remaining.into_iter().collect();
			if notify_self {
				targets.insert(me.conn_id);
			}
			inner.connections.send_many(
				targets,
				&ServerEvent::UserLeftRoom {
					room_id: room.clone(),
					user_id: me.user_id.clone(),
					display_name: me.display_name.clone(),
				},
			);
		}
		debug!(conn_id = me.conn_id, user_id = %me.user_id, room_id = %room, ?outcome, "hub: leave room");
	}
}
