#![forbid(unsafe_code)]

use std::collections::{BTreeSet, HashMap};
use std::sync::RwLock;
use std::sync::PoisonError;

use parley_domain::{RoomId, UserId};
use parley_protocol::ServerEvent;
use tokio::sync::mpsc;
use tracing::debug;

/// Hub-assigned connection id, unique for the process lifetime.
pub type ConnId = u64;

struct ConnEntry {
	user_id: UserId,
	display_name: String,
	outbound: mpsc::Sender<ServerEvent>,
	rooms: BTreeSet<RoomId>,
}

#[derive(Default)]
struct Tables {
	conns: HashMap<ConnId, ConnEntry>,
	by_user: HashMap<UserId, BTreeSet<ConnId>>,
}

/// Live connections plus the user -> connections index.
#[derive(Default)]
pub struct ConnectionTable {
	inner: RwLock<Tables>,
}

/// Who is behind a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnIdentity {
	pub conn_id: ConnId,
	pub user_id: UserId,
	pub display_name: String,
}

impl ConnectionTable {
	fn read(&self) -> std::sync::RwLockReadGuard<'_, Tables> {
		self.inner.read().unwrap_or_else(PoisonError::into_inner)
	}

	fn write(&self) -> std::sync::RwLockWriteGuard<'_, Tables> {
		self.inner.write().unwrap_or_else(PoisonError::into_inner)
	}

	pub fn insert(&self, conn_id: ConnId, user_id: UserId, display_name: String, outbound: mpsc::Sender<ServerEvent>) {
		let mut t = self.write();
		t.by_user.entry(user_id.clone()).or_default().insert(conn_id);
		t.conns.insert(
			conn_id,
			ConnEntry {
				user_id,
				display_name,
				outbound,
				rooms: BTreeSet::new(),
			},
		);
	}

	/// Remove a connection and return its identity.
	pub fn remove(&self, conn_id: ConnId) -> Option<ConnIdentity> {
		let mut t = self.write();
		let entry = t.conns.remove(&conn_id)?;
		if let Some(set) = t.by_user.get_mut(&entry.user_id) {
			set.remove(&conn_id);
			if set.is_empty() {
				t.by_user.remove(&entry.user_id);
			}
		}
		Some(ConnIdentity {
			conn_id,
			user_id: entry.user_id,
			display_name: entry.display_name,
		})
	}

	pub fn identity(&self, conn_id: ConnId) -> Option<ConnIdentity> {
		self.read().conns.get(&conn_id).map(|e| ConnIdentity {
			conn_id,
			user_id: e.user_id.clone(),
			display_name: e.display_name.clone(),
		})
	}

	pub fn user_conns(&self, user: &UserId) -> Vec<ConnId> {
		self.read()
			.by_user
			.get(user)
			.map(|s| s.iter().copied().collect())
			.unwrap_or_default()
	}

	pub fn is_connected(&self, user: &UserId) -> bool {
		self.read().by_user.contains_key(user)
	}

	pub fn len(&self) -> usize {
		self.read().conns.len()
	}

	/// Record that a connection joined a room. Returns false if it already had.
	pub fn add_room(&self, conn_id: ConnId, room: &RoomId) -> bool {
		self.write()
			.conns
			.get_mut(&conn_id)
			.map(|e| e.rooms.insert(room.clone()))
			.unwrap_or(false)
	}

	pub fn remove_room(&self, conn_id: ConnId, room: &RoomId) -> bool {
		self.write()
			.conns
			.get_mut(&conn_id)
			.map(|e| e.rooms.remove(room))
			.unwrap_or(false)
	}

	pub fn rooms_of(&self, conn_id: ConnId) -> Vec<RoomId> {
		self.read()
			.conns
			.get(&conn_id)
			.map(|e| e.rooms.iter().cloned().collect())
			.unwrap_or_default()
	}

	pub fn in_room(&self, conn_id: ConnId, room: &RoomId) -> bool {
		self.read()
			.conns
			.get(&conn_id)
			.map(|e| e.rooms.contains(room))
			.unwrap_or(false)
	}

	/// Queue an event for one connection without waiting.
	///
	/// A full queue drops the event; a closed one means the connection is
	/// already going away.
	pub fn send(&self, conn_id: ConnId, ev: ServerEvent) -> bool {
		let t = self.read();
		let Some(entry) = t.conns.get(&conn_id) else {
			return false;
		};
		deliver(conn_id, entry, ev)
	}

	/// Queue an event for every connection in `targets`.
	pub fn send_many(&self, targets: impl IntoIterator<Item = ConnId>, ev: &ServerEvent) -> usize {
		let t = self.read();
		let mut delivered = 0;
		for conn_id in targets {
			if let Some(entry) = t.conns.get(&conn_id)
				&& deliver(conn_id, entry, ev.clone())
			{
				delivered += 1;
			}
		}
		delivered
	}

	pub fn send_to_user(&self, user: &UserId, ev: &ServerEvent) -> usize {
		let targets = self.user_conns(user);
		self.send_many(targets, ev)
	}

	/// Queue an event for every connection not owned by `user`.
	pub fn broadcast_except_user(&self, user: &UserId, ev: &ServerEvent) -> usize {
		let t = self.read();
		let mut delivered = 0;
		for (conn_id, entry) in t.conns.iter() {
			if &entry.user_id != user && deliver(*conn_id, entry, ev.clone()) {
				delivered += 1;
			}
		}
		delivered
	}
}

fn deliver(conn_id: ConnId, entry: &ConnEntry, ev: ServerEvent) -> bool {
	let name = ev.name();
	match entry.outbound.try_send(ev) {
		Ok(()) => {
			metrics::counter!("parley_server_events_out_total").increment(1);
			true
		}
		Err(mpsc::error::TrySendError::Full(_)) => {
			metrics::counter!("parley_server_events_dropped_total").increment(1);
			debug!(conn_id, user_id = %entry.user_id, event = name, "outbound queue full; dropped event");
			false
		}
		Err(mpsc::error::TrySendError::Closed(_)) => false,
	}
}
