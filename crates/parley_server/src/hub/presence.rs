#![forbid(unsafe_code)]

use std::collections::{HashMap, HashSet};

use parley_domain::UserId;

use super::connections::ConnId;

#[derive(Debug, Default, Clone)]
pub struct PresenceRecord {
	connections: HashSet<ConnId>,
	/// Set when the last connection went away.
	pub last_seen_unix_ms: Option<i64>,
}

impl PresenceRecord {
	pub fn is_online(&self) -> bool {
		!self.connections.is_empty()
	}
}

/// Online flag per user, derived from live connection counts.
///
/// Callers serialize register/unregister per user; this type only keeps
/// the counts and reports 0 <-> 1 transitions.
#[derive(Debug, Default)]
pub struct PresenceRegistry {
	users: HashMap<UserId, PresenceRecord>,
}

impl PresenceRegistry {
	/// Returns true when this registration brought the user online.
	pub fn register(&mut self, user: &UserId, conn_id: ConnId) -> bool {
		let rec = self.users.entry(user.clone()).or_default();
		let was_online = rec.is_online();
		rec.connections.insert(conn_id);
		!was_online
	}

	/// Returns the last-seen stamp when this took the user offline.
	pub fn unregister(&mut self, user: &UserId, conn_id: ConnId, now_unix_ms: i64) -> Option<i64> {
		let rec = self.users.get_mut(user)?;
		if !rec.connections.remove(&conn_id) || rec.is_online() {
			return None;
		}
		rec.last_seen_unix_ms = Some(now_unix_ms);
		Some(now_unix_ms)
	}

	pub fn is_online(&self, user: &UserId) -> bool {
		self.users.get(user).is_some_and(PresenceRecord::is_online)
	}

	#[cfg(test)]
	pub fn record(&self, user: &UserId) -> Option<&PresenceRecord> {
		self.users.get(user)
	}

	pub fn online_users(&self) -> Vec<UserId> {
		let mut out: Vec<UserId> = self
			.users
			.iter()
			.filter(|(_, r)| r.is_online())
			.map(|(u, _)| u.clone())
			.collect();
		out.sort();
		out
	}

	pub fn online_count(&self) -> usize {
		self.users.values().filter(|r| r.is_online()).count()
	}
}
