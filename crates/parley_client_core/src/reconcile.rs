#![forbid(unsafe_code)]

//! Client-side message list that folds optimistic copies into stored ones.
//!
//! Copies of one logical send share `(sender, correlation_id)`. The stored copy
//! replaces a provisional one in place; a second stored copy is a no-op.

use parley_domain::{CorrelationId, Message, RoomId, UserId};
use parley_protocol::ServerEvent;
use tracing::debug;

#[derive(Debug, Clone, PartialEq)]
pub struct LedgerEntry {
	pub message: Message,
	/// Not yet confirmed by the store.
	pub provisional: bool,
}

/// Effect of one event on the ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LedgerChange {
	Inserted,
	/// A provisional entry became the stored copy.
	Replaced,
	/// The stored copy was already present.
	Reconciled,
	Retracted,
	/// The hub reported a failed send for one of our entries.
	Failed,
	Deleted,
	Ignored,
}

#[derive(Debug, Clone)]
pub struct MessageLedger {
	me: UserId,
	entries: Vec<LedgerEntry>,
}

impl MessageLedger {
	pub fn new(me: UserId) -> Self {
		Self {
			me,
			entries: Vec::new(),
		}
	}

	pub fn entries(&self) -> &[LedgerEntry] {
		&self.entries
	}

	pub fn len(&self) -> usize {
		self.entries.len()
	}

	pub fn is_empty(&self) -> bool {
		self.entries.is_empty()
	}

	pub fn find(&self, sender: &UserId, correlation_id: &CorrelationId) -> Option<&LedgerEntry> {
		self.position(sender, correlation_id).map(|i| &self.entries[i])
	}

	fn position(&self, sender: &UserId, correlation_id: &CorrelationId) -> Option<usize> {
		self.entries
			.iter()
			.position(|e| &e.message.sender == sender && &e.message.correlation_id == correlation_id)
	}

	/// Show a message this client is about to send.
	pub fn push_local(&mut self, message: Message) -> LedgerChange {
		if self.position(&message.sender, &message.correlation_id).is_some() {
			return LedgerChange::Ignored;
		}
		self.entries.push(LedgerEntry {
			message,
			provisional: true,
		});
		LedgerChange::Inserted
	}

	pub fn apply(&mut self, ev: &ServerEvent) -> LedgerChange {
		match ev {
			ServerEvent::NewMessage {
				message,
				correlation_id,
				provisional,
			} => self.on_new(message, correlation_id, *provisional),
			ServerEvent::MessageRetracted { room_id, correlation_id } => self.on_retracted(room_id, correlation_id),
			ServerEvent::MessageSendError { correlation_id, .. } => self.on_failed(correlation_id),
			ServerEvent::MessageDeleted { message, .. } => match self.entries.iter_mut().find(|e| e.message.id == message.id) {
				Some(entry) => {
					entry.message = message.clone();
					LedgerChange::Deleted
				}
				None => LedgerChange::Ignored,
			},
			_ => LedgerChange::Ignored,
		}
	}

	fn on_new(&mut self, message: &Message, correlation_id: &CorrelationId, provisional: bool) -> LedgerChange {
		let Some(i) = self.position(&message.sender, correlation_id) else {
			self.entries.push(LedgerEntry {
				message: message.clone(),
				provisional,
			});
			return LedgerChange::Inserted;
		};

		let entry = &mut self.entries[i];
		match (entry.provisional, provisional) {
			(true, false) => {
				debug!(%correlation_id, id = %message.id, "provisional copy replaced");
				entry.message = message.clone();
				entry.provisional = false;
				LedgerChange::Replaced
			}
			(false, false) => LedgerChange::Reconciled,
			(_, true) => LedgerChange::Ignored,
		}
	}

	fn on_retracted(&mut self, room: &RoomId, correlation_id: &CorrelationId) -> LedgerChange {
		let before = self.entries.len();
		self.entries.retain(|e| {
			!(e.provisional && &e.message.correlation_id == correlation_id && e.message.room() == Some(room))
		});
		if self.entries.len() < before {
			LedgerChange::Retracted
		} else {
			LedgerChange::Ignored
		}
	}

	fn on_failed(&mut self, correlation_id: &CorrelationId) -> LedgerChange {
		match self.position(&self.me, correlation_id) {
			Some(i) if self.entries[i].provisional => {
				self.entries.remove(i);
				LedgerChange::Failed
			}
			_ => LedgerChange::Ignored,
		}
	}
}
