#![forbid(unsafe_code)]

use core::fmt;
use core::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod call;
pub mod message;

pub use call::{CallKind, CallState, MediaKind, RejectReason};
pub use message::{
	Attachment, DELETED_PLACEHOLDER, DeleteDenied, DeleteScope, Location, Message, MessageKind, MessagePatch, MessageTarget, NewMessage,
	ValidationError,
};

/// Errors for parsing identifiers from strings.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseIdError {
	#[error("empty value")]
	Empty,
	#[error("invalid format: {0}")]
	InvalidFormat(String),
	#[error("unknown value: {0}")]
	Unknown(String),
}

macro_rules! string_id {
	($(#[$meta:meta])* $name:ident) => {
		$(#[$meta])*
		#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
		#[serde(transparent)]
		pub struct $name(String);

		impl $name {
			/// Create a non-empty id.
			pub fn new(id: impl Into<String>) -> Result<Self, ParseIdError> {
				let id = id.into();
				if id.trim().is_empty() {
					return Err(ParseIdError::Empty);
				}
				Ok(Self(id))
			}

			pub fn as_str(&self) -> &str {
				&self.0
			}

			pub fn into_string(self) -> String {
				self.0
			}

			/// Empty ids can still arrive through deserialization.
			pub fn is_blank(&self) -> bool {
				self.0.trim().is_empty()
			}
		}

		impl fmt::Display for $name {
			fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
				f.write_str(&self.0)
			}
		}

		impl FromStr for $name {
			type Err = ParseIdError;

			fn from_str(s: &str) -> Result<Self, Self::Err> {
				$name::new(s.to_string())
			}
		}
	};
}

string_id!(
	/// Authenticated user identifier, as yielded by the identity collaborator.
	UserId
);

string_id!(
	/// Chat room identifier.
	RoomId
);

string_id!(
	/// Client-generated token that reconciles optimistic and authoritative message copies.
	CorrelationId
);

string_id!(
	/// Store-assigned message identifier.
	MessageId
);

impl MessageId {
	/// Prefix of ids carried by unpersisted optimistic copies.
	pub const PROVISIONAL_PREFIX: &'static str = "tmp:";

	/// Random id for a newly persisted message.
	pub fn new_v4() -> Self {
		Self(uuid::Uuid::new_v4().to_string())
	}

	/// Id of the optimistic copy emitted before persistence completes.
	pub fn provisional(correlation_id: &CorrelationId) -> Self {
		Self(format!("{}{}", Self::PROVISIONAL_PREFIX, correlation_id))
	}

	pub fn is_provisional(&self) -> bool {
		self.0.starts_with(Self::PROVISIONAL_PREFIX)
	}
}

string_id!(
	/// Ephemeral grouping of connections for the duration of one call.
	CallRoomId
);

impl CallRoomId {
	pub const PREFIX: &'static str = "call_";

	/// Synthesize a 1:1 call-room id, unique per attempt.
	pub fn direct(caller: &UserId, callee: &UserId, unix_ms: i64) -> Self {
		Self(format!("{}{}_{}_{}", Self::PREFIX, caller, callee, unix_ms))
	}

	/// The call-room grouping the participants of a room's group call.
	pub fn group(room: &RoomId) -> Self {
		Self(format!("{}group_{}", Self::PREFIX, room))
	}

	pub fn is_group(&self) -> bool {
		self.0.starts_with("call_group_")
	}

	/// Parse a call-room id; it must carry the `call_` prefix.
	pub fn parse(s: &str) -> Result<Self, ParseIdError> {
		let s = s.trim();
		if s.is_empty() {
			return Err(ParseIdError::Empty);
		}
		if !s.starts_with(Self::PREFIX) || s.len() == Self::PREFIX.len() {
			return Err(ParseIdError::InvalidFormat(format!("expected {}<id>", Self::PREFIX)));
		}
		Ok(Self(s.to_string()))
	}
}
