#![forbid(unsafe_code)]

use anyhow::Context;
use parley_domain::{CallRoomId, MediaKind, RoomId, UserId};
use tracing::warn;

use crate::store::SqlPool;

/// Lifecycle row kinds written to `call_log`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallLogEvent {
	Requested,
	Accepted,
	Rejected,
	TimedOut,
	Ended,
	GroupRequested,
	GroupEnded,
}

impl CallLogEvent {
	pub const fn as_str(self) -> &'static str {
		match self {
			Self::Requested => "requested",
			Self::Accepted => "accepted",
			Self::Rejected => "rejected",
			Self::TimedOut => "timed_out",
			Self::Ended => "ended",
			Self::GroupRequested => "group_requested",
			Self::GroupEnded => "group_ended",
		}
	}
}

#[derive(Debug, Clone)]
pub struct CallLogEntry {
	pub event: CallLogEvent,
	pub caller: UserId,
	pub callee: Option<UserId>,
	pub room: Option<RoomId>,
	pub call_room: Option<CallRoomId>,
	pub media: Option<MediaKind>,
	pub reason: Option<String>,
}

impl CallLogEntry {
	pub fn direct(event: CallLogEvent, caller: &UserId, callee: &UserId) -> Self {
		Self {
			event,
			caller: caller.clone(),
			callee: Some(callee.clone()),
			room: None,
			call_room: None,
			media: None,
			reason: None,
		}
	}

	pub fn group(event: CallLogEvent, caller: &UserId, room: &RoomId) -> Self {
		Self {
			event,
			caller: caller.clone(),
			callee: None,
			room: Some(room.clone()),
			call_room: Some(CallRoomId::group(room)),
			media: None,
			reason: None,
		}
	}

	pub fn with_call_room(mut self, id: &CallRoomId) -> Self {
		self.call_room = Some(id.clone());
		self
	}

	pub fn with_media(mut self, media: MediaKind) -> Self {
		self.media = Some(media);
		self
	}

	pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
		self.reason = Some(reason.into());
		self
	}
}

/// Best-effort call metadata log. Disabled means every call is a no-op.
#[derive(Clone, Default)]
pub struct CallLog {
	pool: Option<SqlPool>,
}

impl CallLog {
	pub fn new(pool: SqlPool) -> Self {
		Self { pool: Some(pool) }
	}

	pub fn disabled() -> Self {
		Self { pool: None }
	}

	pub fn is_enabled(&self) -> bool {
		self.pool.is_some()
	}

	/// Write in the background; failures are logged and dropped.
	pub fn record(&self, entry: CallLogEntry) {
		if self.pool.is_none() {
			return;
		}
		let this = self.clone();
		tokio::spawn(async move {
			if let Err(e) = this.write(&entry).await {
				warn!(error = %e, event = entry.event.as_str(), caller = %entry.caller, "call log write failed");
			}
		});
	}

	pub async fn write(&self, entry: &CallLogEntry) -> anyhow::Result<()> {
		let Some(pool) = &self.pool else {
			return Ok(());
		};

		let callee = entry.callee.as_ref().map(|u| u.as_str());
		let room = entry.room.as_ref().map(|r| r.as_str());
		let call_room = entry.call_room.as_ref().map(|c| c.as_str());
		let media = entry.media.map(|m| match m {
			MediaKind::Audio => "audio",
			MediaKind::Video => "video",
		});

		match pool {
			SqlPool::Sqlite(pool) => {
				sqlx::query(
					"INSERT INTO call_log (event, caller_id, callee_id, room_id, call_room_id, media, reason, created_at) \
					VALUES (?, ?, ?, ?, ?, ?, ?, strftime('%s','now'))",
				)
				.bind(entry.event.as_str())
				.bind(entry.caller.as_str())
				.bind(callee)
				.bind(room)
				.bind(call_room)
				.bind(media)
				.bind(entry.reason.as_deref())
				.execute(pool)
				.await
				.context("insert call_log (sqlite)")?;
			}
			SqlPool::Postgres(pool) => {
				sqlx::query(
					"INSERT INTO call_log (event, caller_id, callee_id, room_id, call_room_id, media, reason, created_at) \
					VALUES ($1, $2, $3, $4, $5, $6, $7, NOW())",
				)
				.bind(entry.event.as_str())
				.bind(entry.caller.as_str())
				.bind(callee)
				.bind(room)
				.bind(call_room)
				.bind(media)
				.bind(entry.reason.as_deref())
				.execute(pool)
				.await
				.context("insert call_log (postgres)")?;
			}
		}

		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn uid(s: &str) -> UserId {
		UserId::new(s).unwrap()
	}

	#[tokio::test]
	async fn disabled_log_is_a_noop() {
		let log = CallLog::disabled();
		assert!(!log.is_enabled());
		log.write(&CallLogEntry::direct(CallLogEvent::Requested, &uid("a"), &uid("b")))
			.await
			.unwrap();
	}

	#[tokio::test]
	async fn rows_are_written() {
		let pool = SqlPool::connect("sqlite::memory:").await.unwrap();
		let log = CallLog::new(pool.clone());

		let room = CallRoomId::direct(&uid("a"), &uid("b"), 1);
		log.write(
			&CallLogEntry::direct(CallLogEvent::Accepted, &uid("a"), &uid("b"))
				.with_call_room(&room)
				.with_media(MediaKind::Audio),
		)
		.await
		.unwrap();
		log.write(&CallLogEntry::direct(CallLogEvent::Rejected, &uid("a"), &uid("c")).with_reason("busy"))
			.await
			.unwrap();

		let SqlPool::Sqlite(pool) = pool else {
			panic!("expected sqlite");
		};
		let rows: Vec<(String, Option<String>)> = sqlx::query_as("SELECT event, reason FROM call_log ORDER BY id")
			.fetch_all(&pool)
			.await
			.unwrap();
		assert_eq!(
			rows,
			vec![
				("accepted".to_string(), None),
				("rejected".to_string(), Some("busy".to_string()))
			]
		);
	}
}
