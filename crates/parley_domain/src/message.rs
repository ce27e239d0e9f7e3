#![forbid(unsafe_code)]

use core::fmt;
use core::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{CorrelationId, MessageId, ParseIdError, RoomId, UserId};

/// Text that replaces the body of a globally deleted message.
pub const DELETED_PLACEHOLDER: &str = "[Message deleted]";

/// Reference to an uploaded file; the bytes live in the attachment store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
	pub url: String,
	#[serde(default, alias = "mimetype", skip_serializing_if = "Option::is_none")]
	pub mime: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub size: Option<u64>,
	#[serde(default, alias = "filename", skip_serializing_if = "Option::is_none")]
	pub name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Location {
	pub latitude: f64,
	pub longitude: f64,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub address: Option<String>,
}

/// Message type tag.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
	#[default]
	Text,
	Location,
	Attachment,
	#[serde(other)]
	Other,
}

/// Where a message goes: exactly one of a receiver or a room.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum MessageTarget {
	Direct(UserId),
	Room(RoomId),
}

impl MessageTarget {
	/// Build a target from the two optional wire fields.
	pub fn from_parts(receiver: Option<UserId>, room: Option<RoomId>) -> Result<Self, ValidationError> {
		let receiver = receiver.filter(|r| !r.is_blank());
		let room = room.filter(|r| !r.is_blank());
		match (receiver, room) {
			(Some(r), None) => Ok(Self::Direct(r)),
			(None, Some(r)) => Ok(Self::Room(r)),
			_ => Err(ValidationError::AmbiguousTarget),
		}
	}

	pub fn receiver(&self) -> Option<&UserId> {
		match self {
			Self::Direct(u) => Some(u),
			Self::Room(_) => None,
		}
	}

	pub fn room(&self) -> Option<&RoomId> {
		match self {
			Self::Direct(_) => None,
			Self::Room(r) => Some(r),
		}
	}
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ValidationError {
	#[error("missing required field: {0}")]
	MissingField(&'static str),
	#[error("exactly one of receiver_id or room_id must be set")]
	AmbiguousTarget,
	#[error("location messages require a location payload")]
	MissingLocation,
	#[error("invalid delete scope: {0}")]
	InvalidScope(String),
	#[error("{0}")]
	Other(String),
}

/// A message as submitted by a sender, before the store assigns an id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewMessage {
	pub sender: UserId,
	pub target: MessageTarget,
	pub text: String,
	pub attachments: Vec<Attachment>,
	pub kind: MessageKind,
	pub location: Option<Location>,
	pub correlation_id: CorrelationId,
	pub created_at_unix_ms: i64,
}

impl NewMessage {
	pub fn validate(&self) -> Result<(), ValidationError> {
		if self.correlation_id.is_blank() {
			return Err(ValidationError::MissingField("correlation_id"));
		}

		if self.kind == MessageKind::Location && self.location.is_none() {
			return Err(ValidationError::MissingLocation);
		}

		Ok(())
	}

	/// Location payloads are only kept on location messages.
	pub fn normalized(mut self) -> Self {
		if self.kind != MessageKind::Location {
			self.location = None;
		}
		self
	}
}

/// A persisted message with its soft-delete flags.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
	pub id: MessageId,
	pub sender: UserId,
	pub target: MessageTarget,
	pub text: String,
	pub attachments: Vec<Attachment>,
	pub kind: MessageKind,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub location: Option<Location>,
	pub correlation_id: CorrelationId,
	pub created_at_unix_ms: i64,
	#[serde(default)]
	pub deleted_for_sender: bool,
	#[serde(default)]
	pub deleted_for_receiver: bool,
	#[serde(default)]
	pub deleted_globally: bool,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub deleted_at_unix_ms: Option<i64>,
}

impl Message {
	pub fn from_new(id: MessageId, new: NewMessage) -> Self {
		Self {
			id,
			sender: new.sender,
			target: new.target,
			text: new.text,
			attachments: new.attachments,
			kind: new.kind,
			location: new.location,
			correlation_id: new.correlation_id,
			created_at_unix_ms: new.created_at_unix_ms,
			deleted_for_sender: false,
			deleted_for_receiver: false,
			deleted_globally: false,
			deleted_at_unix_ms: None,
		}
	}

	pub fn receiver(&self) -> Option<&UserId> {
		self.target.receiver()
	}

	pub fn room(&self) -> Option<&RoomId> {
		self.target.room()
	}

	pub fn apply(&mut self, patch: &MessagePatch) {
		if let Some(text) = &patch.text {
			self.text = text.clone();
		}
		if let Some(attachments) = &patch.attachments {
			self.attachments = attachments.clone();
		}
		if let Some(v) = patch.deleted_for_sender {
			self.deleted_for_sender = v;
		}
		if let Some(v) = patch.deleted_for_receiver {
			self.deleted_for_receiver = v;
		}
		if let Some(v) = patch.deleted_globally {
			self.deleted_globally = v;
		}
		if let Some(at) = patch.deleted_at_unix_ms {
			self.deleted_at_unix_ms = Some(at);
		}
	}

	/// Check whether `requester` may delete this message with `scope`.
	pub fn authorize_delete(&self, requester: &UserId, scope: DeleteScope) -> Result<(), DeleteDenied> {
		let is_sender = &self.sender == requester;
		let is_receiver = self.receiver() == Some(requester);

		if !is_sender && !is_receiver {
			return Err(DeleteDenied::NotAParty);
		}

		match scope {
			DeleteScope::Both | DeleteScope::SenderOnly if is_sender => Ok(()),
			DeleteScope::ReceiverOnly if self.room().is_some() => Err(DeleteDenied::ScopeInvalidForRoom),
			DeleteScope::ReceiverOnly if is_receiver => Ok(()),
			scope => Err(DeleteDenied::ScopeNotPermitted(scope)),
		}
	}
}

/// Why a delete request was refused.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum DeleteDenied {
	#[error("requester is neither the sender nor the receiver")]
	NotAParty,
	#[error("scope {0} is not permitted for this requester")]
	ScopeNotPermitted(DeleteScope),
	#[error("receiver-only deletion does not apply to room messages")]
	ScopeInvalidForRoom,
}

/// Partial update applied by the store.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MessagePatch {
	pub text: Option<String>,
	pub attachments: Option<Vec<Attachment>>,
	pub deleted_for_sender: Option<bool>,
	pub deleted_for_receiver: Option<bool>,
	pub deleted_globally: Option<bool>,
	pub deleted_at_unix_ms: Option<i64>,
}

impl MessagePatch {
	/// The patch that implements a deletion with the given scope.
	pub fn for_delete(scope: DeleteScope, now_unix_ms: i64) -> Self {
		let mut patch = Self {
			deleted_at_unix_ms: Some(now_unix_ms),
			..Self::default()
		};
		match scope {
			DeleteScope::Both => {
				patch.deleted_globally = Some(true);
				patch.text = Some(DELETED_PLACEHOLDER.to_string());
				patch.attachments = Some(Vec::new());
			}
			DeleteScope::SenderOnly => patch.deleted_for_sender = Some(true),
			DeleteScope::ReceiverOnly => patch.deleted_for_receiver = Some(true),
		}
		patch
	}
}

/// Who a deletion applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DeleteScope {
	#[serde(rename = "both")]
	Both,
	#[serde(rename = "sender", alias = "sender-only", alias = "sender_only")]
	SenderOnly,
	#[serde(rename = "receiver", alias = "receiver-only", alias = "receiver_only")]
	ReceiverOnly,
}

impl DeleteScope {
	pub const fn as_str(self) -> &'static str {
		match self {
			Self::Both => "both",
			Self::SenderOnly => "sender",
			Self::ReceiverOnly => "receiver",
		}
	}
}

impl fmt::Display for DeleteScope {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

impl FromStr for DeleteScope {
	type Err = ParseIdError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		let s = s.trim();
		if s.is_empty() {
			return Err(ParseIdError::Empty);
		}
		match s.to_ascii_lowercase().as_str() {
			"both" => Ok(Self::Both),
			"sender" | "sender-only" | "sender_only" => Ok(Self::SenderOnly),
			"receiver" | "receiver-only" | "receiver_only" => Ok(Self::ReceiverOnly),
			other => Err(ParseIdError::Unknown(other.to_string())),
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn uid(s: &str) -> UserId {
		UserId::new(s).unwrap()
	}

	fn direct(sender: &str, receiver: &str) -> Message {
		Message::from_new(
			MessageId::new("m1").unwrap(),
			NewMessage {
				sender: uid(sender),
				target: MessageTarget::Direct(uid(receiver)),
				text: "hi".to_string(),
				attachments: vec![Attachment {
					url: "/uploads/a.png".to_string(),
					mime: Some("image/png".to_string()),
					size: Some(10),
					name: None,
				}],
				kind: MessageKind::Text,
				location: None,
				correlation_id: CorrelationId::new("c1").unwrap(),
				created_at_unix_ms: 1,
			},
		)
	}

	#[test]
	fn target_requires_exactly_one_side() {
		assert_eq!(
			MessageTarget::from_parts(None, None),
			Err(ValidationError::AmbiguousTarget)
		);
		assert_eq!(
			MessageTarget::from_parts(Some(uid("b")), Some(RoomId::new("r").unwrap())),
			Err(ValidationError::AmbiguousTarget)
		);
		assert_eq!(
			MessageTarget::from_parts(Some(uid("b")), None),
			Ok(MessageTarget::Direct(uid("b")))
		);
	}

	#[test]
	fn sender_cannot_use_receiver_scope() {
		let m = direct("a", "b");
		assert_eq!(
			m.authorize_delete(&uid("a"), DeleteScope::ReceiverOnly),
			Err(DeleteDenied::ScopeNotPermitted(DeleteScope::ReceiverOnly))
		);
		assert!(m.authorize_delete(&uid("a"), DeleteScope::Both).is_ok());
		assert!(m.authorize_delete(&uid("a"), DeleteScope::SenderOnly).is_ok());
	}

	#[test]
	fn receiver_may_only_hide_for_themselves() {
		let m = direct("a", "b");
		assert!(m.authorize_delete(&uid("b"), DeleteScope::ReceiverOnly).is_ok());
		assert!(m.authorize_delete(&uid("b"), DeleteScope::Both).is_err());
		assert!(m.authorize_delete(&uid("b"), DeleteScope::SenderOnly).is_err());
		assert_eq!(
			m.authorize_delete(&uid("c"), DeleteScope::SenderOnly),
			Err(DeleteDenied::NotAParty)
		);
	}

	#[test]
	fn global_delete_patch_scrubs_content() {
		let mut m = direct("a", "b");
		m.apply(&MessagePatch::for_delete(DeleteScope::Both, 42));
		assert!(m.deleted_globally);
		assert_eq!(m.text, DELETED_PLACEHOLDER);
		assert!(m.attachments.is_empty());
		assert_eq!(m.deleted_at_unix_ms, Some(42));
		assert!(!m.deleted_for_sender && !m.deleted_for_receiver);
	}

	#[test]
	fn private_delete_leaves_content() {
		let mut m = direct("a", "b");
		m.apply(&MessagePatch::for_delete(DeleteScope::ReceiverOnly, 7));
		assert!(m.deleted_for_receiver);
		assert!(!m.deleted_globally);
		assert_eq!(m.text, "hi");
		assert_eq!(m.attachments.len(), 1);
	}

	#[test]
	fn scope_parsing_accepts_aliases() {
		assert_eq!("sender-only".parse::<DeleteScope>().unwrap(), DeleteScope::SenderOnly);
		assert_eq!("RECEIVER".parse::<DeleteScope>().unwrap(), DeleteScope::ReceiverOnly);
		assert!("everyone".parse::<DeleteScope>().is_err());
		let s: DeleteScope = serde_json::from_str("\"receiver-only\"").unwrap();
		assert_eq!(s, DeleteScope::ReceiverOnly);
	}

	#[test]
	fn new_message_validation() {
		let mut m = NewMessage {
			sender: uid("a"),
			target: MessageTarget::Direct(uid("b")),
			text: "  ".to_string(),
			attachments: Vec::new(),
			kind: MessageKind::Text,
			location: None,
			correlation_id: CorrelationId::new("c").unwrap(),
			created_at_unix_ms: 0,
		};
		// Blank text with nothing attached is still a valid send.
		assert!(m.validate().is_ok());

		m.kind = MessageKind::Location;
		assert_eq!(m.validate(), Err(ValidationError::MissingLocation));

		m.location = Some(Location {
			latitude: 1.0,
			longitude: 2.0,
			address: None,
		});
		assert!(m.validate().is_ok());

		m.kind = MessageKind::Text;
		m.text = "x".to_string();
		assert!(m.normalized().location.is_none());
	}

	#[test]
	fn unknown_kind_deserializes_as_other() {
		let k: MessageKind = serde_json::from_str("\"sticker\"").unwrap();
		assert_eq!(k, MessageKind::Other);
	}
}
