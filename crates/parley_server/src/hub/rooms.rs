#![forbid(unsafe_code)]

use std::collections::{HashMap, HashSet};

use parley_domain::{RoomId, UserId};

use super::connections::ConnId;

/// Transport-level room membership, rebuilt from scratch on restart.
///
/// A user is a member while at least one of their connections has joined.
/// Entries with no members are removed.
#[derive(Debug, Default)]
pub struct RoomMembership {
	rooms: HashMap<RoomId, HashMap<UserId, HashSet<ConnId>>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinOutcome {
	/// First connection of this user in the room.
	UserJoined,
	/// The user was already a member through another connection.
	ConnAdded,
	AlreadyJoined,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaveOutcome {
	/// Last connection of this user left the room.
	UserLeft,
	ConnRemoved,
	NotJoined,
}

impl RoomMembership {
	pub fn join(&mut self, room: &RoomId, user: &UserId, conn_id: ConnId) -> JoinOutcome {
		let members = self.rooms.entry(room.clone()).or_default();
		let conns = members.entry(user.clone()).or_default();
		let first = conns.is_empty();
		if !conns.insert(conn_id) {
			JoinOutcome::AlreadyJoined
		} else if first {
			JoinOutcome::UserJoined
		} else {
			JoinOutcome::ConnAdded
		}
	}

	pub fn leave(&mut self, room: &RoomId, user: &UserId, conn_id: ConnId) -> LeaveOutcome {
		let Some(members) = self.rooms.get_mut(room) else {
			return LeaveOutcome::NotJoined;
		};
		let Some(conns) = members.get_mut(user) else {
			return LeaveOutcome::NotJoined;
		};
		if !conns.remove(&conn_id) {
			return LeaveOutcome::NotJoined;
		}

		let outcome = if conns.is_empty() {
			members.remove(user);
			LeaveOutcome::UserLeft
		} else {
			LeaveOutcome::ConnRemoved
		};

		if members.is_empty() {
			self.rooms.remove(room);
		}
		outcome
	}

	pub fn members(&self, room: &RoomId) -> Vec<UserId> {
		let mut out: Vec<UserId> = self
			.rooms
			.get(room)
			.map(|m| m.keys().cloned().collect())
			.unwrap_or_default();
		out.sort();
		out
	}

	#[cfg(test)]
	pub fn is_member(&self, room: &RoomId, user: &UserId) -> bool {
		self.rooms.get(room).is_some_and(|m| m.contains_key(user))
	}

	/// Every connection that joined the room.
	pub fn conns(&self, room: &RoomId) -> Vec<ConnId> {
		let mut out: Vec<ConnId> = self
			.rooms
			.get(room)
			.map(|m| m.values().flat_map(|c| c.iter().copied()).collect())
			.unwrap_or_default();
		out.sort_unstable();
		out
	}

	/// Connections in the room that are not owned by `user`.
	pub fn conns_except_user(&self, room: &RoomId, user: &UserId) -> Vec<ConnId> {
		let mut out: Vec<ConnId> = self
			.rooms
			.get(room)
			.map(|m| {
				m.iter()
					.filter(|(u, _)| *u != user)
					.flat_map(|(_, c)| c.iter().copied())
					.collect()
			})
			.unwrap_or_default();
		out.sort_unstable();
		out
	}

	pub fn room_count(&self) -> usize {
		self.rooms.len()
	}
}
