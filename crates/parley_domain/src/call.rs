#![forbid(unsafe_code)]

use core::fmt;
use core::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::ParseIdError;

/// Whether a call is between two users or spans a room.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallKind {
	Direct,
	Group,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaKind {
	Audio,
	#[default]
	Video,
}

impl FromStr for MediaKind {
	type Err = ParseIdError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		match s.trim().to_ascii_lowercase().as_str() {
			"" => Err(ParseIdError::Empty),
			"audio" => Ok(Self::Audio),
			"video" => Ok(Self::Video),
			other => Err(ParseIdError::Unknown(other.to_string())),
		}
	}
}

/// Per-attempt lifecycle of a call, as seen by the hub.
///
/// ```text
/// Idle -> Requested -> Accepted -> Active -> Ended
///             |            |
///             +-> Rejected +-> Ended
///             +-> TimedOut
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallState {
	Idle,
	Requested,
	Accepted,
	Active,
	Ended,
	Rejected,
	TimedOut,
}

impl CallState {
	pub const fn is_terminal(self) -> bool {
		matches!(self, Self::Ended | Self::Rejected | Self::TimedOut)
	}

	pub const fn can_transition_to(self, next: CallState) -> bool {
		use CallState::*;
		matches!(
			(self, next),
			(Idle, Requested)
				| (Requested, Accepted)
				| (Requested, Rejected)
				| (Requested, TimedOut)
				| (Requested, Ended)
				| (Accepted, Active)
				| (Accepted, Ended)
				| (Active, Ended)
		)
	}
}

/// Why a call request did not connect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RejectReason {
	#[serde(rename = "offline")]
	Offline,
	#[serde(rename = "busy")]
	Busy,
	#[serde(rename = "declined")]
	Declined,
	#[serde(rename = "timeout")]
	TimedOut,
}

impl RejectReason {
	pub const fn as_str(self) -> &'static str {
		match self {
			Self::Offline => "offline",
			Self::Busy => "busy",
			Self::Declined => "declined",
			Self::TimedOut => "timeout",
		}
	}

	/// Human-readable text shown to the caller.
	pub const fn describe(self) -> &'static str {
		match self {
			Self::Offline => "User is offline",
			Self::Busy => "User is busy",
			Self::Declined => "Call declined",
			Self::TimedOut => "No answer",
		}
	}
}

impl fmt::Display for RejectReason {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn lifecycle_transitions() {
		assert!(CallState::Idle.can_transition_to(CallState::Requested));
		assert!(CallState::Requested.can_transition_to(CallState::Accepted));
		assert!(CallState::Accepted.can_transition_to(CallState::Active));
		assert!(CallState::Active.can_transition_to(CallState::Ended));

		assert!(!CallState::Idle.can_transition_to(CallState::Active));
		assert!(!CallState::Rejected.can_transition_to(CallState::Accepted));
		assert!(!CallState::Ended.can_transition_to(CallState::Requested));
	}

	#[test]
	fn terminal_states() {
		for s in [CallState::Ended, CallState::Rejected, CallState::TimedOut] {
			assert!(s.is_terminal());
		}
		assert!(!CallState::Active.is_terminal());
	}

	#[test]
	fn reject_reason_wire_codes() {
		assert_eq!(serde_json::to_string(&RejectReason::TimedOut).unwrap(), "\"timeout\"");
		assert_eq!(RejectReason::Offline.describe(), "User is offline");
		assert_eq!(RejectReason::Busy.to_string(), "busy");
	}

	#[test]
	fn media_kind_parse() {
		assert_eq!("Audio".parse::<MediaKind>().unwrap(), MediaKind::Audio);
		assert!("screen".parse::<MediaKind>().is_err());
	}
}
