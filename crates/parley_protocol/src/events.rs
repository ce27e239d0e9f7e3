#![forbid(unsafe_code)]

use parley_domain::{
	CallRoomId, CorrelationId, DeleteScope, Location, MediaKind, Message, MessageId, MessageKind, MessageTarget,
	NewMessage, RejectReason, RoomId, UserId, ValidationError,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::attachments::normalize_attachments;

/// Frame sent by clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientEnvelope {
	pub version: u32,
	pub msg: ClientMsg,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "body", rename_all = "snake_case")]
pub enum ClientMsg {
	Hello(Hello),
	Event(ClientEvent),
}

/// Frame sent by the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerEnvelope {
	pub version: u32,
	pub msg: ServerMsg,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "body", rename_all = "snake_case")]
pub enum ServerMsg {
	Welcome(Welcome),
	Error(ErrorFrame),
	Event(ServerEvent),
}

impl ClientEnvelope {
	pub fn event(ev: ClientEvent) -> Self {
		Self {
			version: crate::version::PROTOCOL_MAJOR,
			msg: ClientMsg::Event(ev),
		}
	}
}

impl ServerEnvelope {
	pub fn event(ev: ServerEvent) -> Self {
		Self {
			version: crate::version::PROTOCOL_MAJOR,
			msg: ServerMsg::Event(ev),
		}
	}

	pub fn error(code: impl Into<String>, message: impl Into<String>) -> Self {
		Self {
			version: crate::version::PROTOCOL_MAJOR,
			msg: ServerMsg::Error(ErrorFrame {
				code: code.into(),
				message: message.into(),
			}),
		}
	}
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hello {
	pub client_name: String,
	pub client_instance_id: String,
	pub credential: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Welcome {
	pub user_id: UserId,
	pub display_name: String,
	pub server_name: String,
	pub server_time_unix_ms: i64,
	pub max_frame_bytes: u32,
	/// Users online at handshake time, excluding the connecting user.
	#[serde(default)]
	pub online_users: Vec<UserId>,
}

/// Connection-level error; the server closes the connection after sending it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorFrame {
	pub code: String,
	pub message: String,
}

/// Body of a direct or room send.
///
/// `attachments` is kept raw so that malformed input degrades instead of
/// failing the whole frame.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OutgoingMessage {
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub receiver_id: Option<UserId>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub room_id: Option<RoomId>,
	#[serde(default)]
	pub text: String,
	#[serde(default)]
	pub attachments: Value,
	#[serde(default)]
	pub kind: MessageKind,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub location: Option<Location>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub correlation_id: Option<CorrelationId>,
}

impl OutgoingMessage {
	pub fn target(&self) -> Result<MessageTarget, ValidationError> {
		MessageTarget::from_parts(self.receiver_id.clone(), self.room_id.clone())
	}

	/// Validate and turn the wire body into a message ready for the store.
	pub fn into_new_message(self, sender: UserId, now_unix_ms: i64) -> Result<NewMessage, ValidationError> {
		let target = self.target()?;
		let correlation_id = self
			.correlation_id
			.filter(|c| !c.is_blank())
			.ok_or(ValidationError::MissingField("correlation_id"))?;

		let new = NewMessage {
			sender,
			target,
			text: self.text,
			attachments: normalize_attachments(&self.attachments),
			kind: self.kind,
			location: self.location,
			correlation_id,
			created_at_unix_ms: now_unix_ms,
		}
		.normalized();

		new.validate()?;
		Ok(new)
	}
}

/// Inbound events on an established connection.
///
/// Call events may carry `from`; when present it must match the
/// connection's authenticated user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientEvent {
	JoinRoom {
		room_id: RoomId,
	},
	LeaveRoom {
		room_id: RoomId,
	},
	SendDirectMessage(OutgoingMessage),
	SendRoomMessage(OutgoingMessage),
	DeleteMessage {
		message_id: MessageId,
		#[serde(default = "default_scope")]
		scope: String,
		#[serde(default, skip_serializing_if = "Option::is_none")]
		correlation_id: Option<CorrelationId>,
	},

	CallRequest {
		to: UserId,
		#[serde(default)]
		media: MediaKind,
		#[serde(default, skip_serializing_if = "Option::is_none")]
		from: Option<UserId>,
	},
	CallAccept {
		caller: UserId,
		#[serde(default, skip_serializing_if = "Option::is_none")]
		from: Option<UserId>,
	},
	CallReject {
		caller: UserId,
		#[serde(default, skip_serializing_if = "Option::is_none")]
		reason: Option<RejectReason>,
		#[serde(default, skip_serializing_if = "Option::is_none")]
		from: Option<UserId>,
	},
	CallEnd {
		peer: UserId,
		#[serde(default, skip_serializing_if = "Option::is_none")]
		from: Option<UserId>,
	},
	CallSignal {
		to: UserId,
		payload: Value,
		#[serde(default, skip_serializing_if = "Option::is_none")]
		from: Option<UserId>,
	},
	CalleeReady {
		to: UserId,
	},

	GroupCallRequest {
		room_id: RoomId,
		#[serde(default)]
		media: MediaKind,
	},
	GroupCallAccept {
		room_id: RoomId,
		to: UserId,
	},
	GroupCallReject {
		room_id: RoomId,
		to: UserId,
	},
	GroupCallEnd {
		room_id: RoomId,
	},
	GroupCallSignal {
		room_id: RoomId,
		to: UserId,
		payload: Value,
	},

	Ping {
		#[serde(default)]
		client_time_unix_ms: i64,
	},
}

fn default_scope() -> String {
	DeleteScope::Both.as_str().to_string()
}

impl ClientEvent {
	/// Short name for logs and metric labels.
	pub fn name(&self) -> &'static str {
		match self {
			Self::JoinRoom { .. } => "join_room",
			Self::LeaveRoom { .. } => "leave_room",
			Self::SendDirectMessage(_) => "send_direct_message",
			Self::SendRoomMessage(_) => "send_room_message",
			Self::DeleteMessage { .. } => "delete_message",
			Self::CallRequest { .. } => "call_request",
			Self::CallAccept { .. } => "call_accept",
			Self::CallReject { .. } => "call_reject",
			Self::CallEnd { .. } => "call_end",
			Self::CallSignal { .. } => "call_signal",
			Self::CalleeReady { .. } => "callee_ready",
			Self::GroupCallRequest { .. } => "group_call_request",
			Self::GroupCallAccept { .. } => "group_call_accept",
			Self::GroupCallReject { .. } => "group_call_reject",
			Self::GroupCallEnd { .. } => "group_call_end",
			Self::GroupCallSignal { .. } => "group_call_signal",
			Self::Ping { .. } => "ping",
		}
	}

	/// The `from` claim carried by call events, if any.
	pub fn claimed_sender(&self) -> Option<&UserId> {
		match self {
			Self::CallRequest { from, .. }
			| Self::CallAccept { from, .. }
			| Self::CallReject { from, .. }
			| Self::CallEnd { from, .. }
			| Self::CallSignal { from, .. } => from.as_ref(),
			_ => None,
		}
	}
}

/// Outbound events delivered to connections.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerEvent {
	UserOnline {
		user_id: UserId,
	},
	UserOffline {
		user_id: UserId,
		last_seen_unix_ms: i64,
	},
	UserJoinedRoom {
		room_id: RoomId,
		user_id: UserId,
		display_name: String,
	},
	UserLeftRoom {
		room_id: RoomId,
		user_id: UserId,
		display_name: String,
	},

	/// `provisional` marks the unpersisted first copy of a room send.
	NewMessage {
		message: Message,
		correlation_id: CorrelationId,
		#[serde(default)]
		provisional: bool,
	},
	MessageDeleted {
		message_id: MessageId,
		scope: DeleteScope,
		message: Message,
		#[serde(default, skip_serializing_if = "Option::is_none")]
		correlation_id: Option<CorrelationId>,
	},
	MessageSendError {
		correlation_id: CorrelationId,
		code: String,
		error: String,
	},
	MessageRetracted {
		room_id: RoomId,
		correlation_id: CorrelationId,
	},

	CallRequest {
		caller_id: UserId,
		caller_name: String,
		media: MediaKind,
	},
	CallAccepted {
		from: UserId,
		call_room_id: CallRoomId,
	},
	CallRejected {
		from: UserId,
		reason: RejectReason,
		message: String,
	},
	CallEnded {
		from: UserId,
	},
	CallSignal {
		from: UserId,
		payload: Value,
	},
	CalleeReady {
		from: UserId,
	},
	/// Sent to a late acceptor when the request was already accepted or is gone.
	CallAcceptIgnored {
		caller: UserId,
	},

	GroupCallRequest {
		room_id: RoomId,
		caller_id: UserId,
		caller_name: String,
		media: MediaKind,
	},
	GroupCallAccepted {
		room_id: RoomId,
		from: UserId,
		call_room_id: CallRoomId,
	},
	GroupCallRejected {
		room_id: RoomId,
		from: UserId,
	},
	GroupCallEnded {
		room_id: RoomId,
		from: UserId,
	},
	GroupCallSignal {
		room_id: RoomId,
		from: UserId,
		payload: Value,
	},

	Error {
		code: String,
		message: String,
		#[serde(default, skip_serializing_if = "Option::is_none")]
		correlation_id: Option<CorrelationId>,
	},
	Pong {
		client_time_unix_ms: i64,
		server_time_unix_ms: i64,
	},
}

impl ServerEvent {
	pub fn name(&self) -> &'static str {
		match self {
			Self::UserOnline { .. } => "user_online",
			Self::UserOffline { .. } => "user_offline",
			Self::UserJoinedRoom { .. } => "user_joined_room",
			Self::UserLeftRoom { .. } => "user_left_room",
			Self::NewMessage { .. } => "new_message",
			Self::MessageDeleted { .. } => "message_deleted",
			Self::MessageSendError { .. } => "message_send_error",
			Self::MessageRetracted { .. } => "message_retracted",
			Self::CallRequest { .. } => "call_request",
			Self::CallAccepted { .. } => "call_accepted",
			Self::CallRejected { .. } => "call_rejected",
			Self::CallEnded { .. } => "call_ended",
			Self::CallSignal { .. } => "call_signal",
			Self::CalleeReady { .. } => "callee_ready",
			Self::CallAcceptIgnored { .. } => "call_accept_ignored",
			Self::GroupCallRequest { .. } => "group_call_request",
			Self::GroupCallAccepted { .. } => "group_call_accepted",
			Self::GroupCallRejected { .. } => "group_call_rejected",
			Self::GroupCallEnded { .. } => "group_call_ended",
			Self::GroupCallSignal { .. } => "group_call_signal",
			Self::Error { .. } => "error",
			Self::Pong { .. } => "pong",
		}
	}
}

#[cfg(test)]
mod tests {
	use serde_json::json;

	use super::*;

	#[test]
	fn client_event_wire_shape() {
		let ev: ClientEvent = serde_json::from_value(json!({
			"type": "call_request",
			"to": "bob",
			"media": "audio"
		}))
		.unwrap();
		assert_eq!(
			ev,
			ClientEvent::CallRequest {
				to: UserId::new("bob").unwrap(),
				media: MediaKind::Audio,
				from: None,
			}
		);
		assert_eq!(ev.name(), "call_request");
	}

	#[test]
	fn delete_scope_defaults_to_both() {
		let ev: ClientEvent = serde_json::from_value(json!({
			"type": "delete_message",
			"message_id": "m1"
		}))
		.unwrap();
		match ev {
			ClientEvent::DeleteMessage { scope, correlation_id, .. } => {
				assert_eq!(scope, "both");
				assert!(correlation_id.is_none());
			}
			other => panic!("unexpected: {other:?}"),
		}
	}

	#[test]
	fn send_with_string_attachments() {
		let ev: ClientEvent = serde_json::from_value(json!({
			"type": "send_direct_message",
			"receiver_id": "bob",
			"text": "hi",
			"attachments": "[{\"url\":\"/u/1\"}]",
			"correlation_id": "c1"
		}))
		.unwrap();
		let ClientEvent::SendDirectMessage(body) = ev else {
			panic!("expected a direct send");
		};
		let new = body.into_new_message(UserId::new("alice").unwrap(), 5).unwrap();
		assert_eq!(new.attachments.len(), 1);
		assert_eq!(new.target, MessageTarget::Direct(UserId::new("bob").unwrap()));
		assert_eq!(new.correlation_id.as_str(), "c1");
	}

	#[test]
	fn send_requires_correlation_and_single_target() {
		let body = OutgoingMessage {
			receiver_id: Some(UserId::new("bob").unwrap()),
			text: "hi".into(),
			..Default::default()
		};
		assert_eq!(
			body.clone().into_new_message(UserId::new("a").unwrap(), 0),
			Err(ValidationError::MissingField("correlation_id"))
		);

		let both = OutgoingMessage {
			room_id: Some(RoomId::new("r").unwrap()),
			correlation_id: Some(CorrelationId::new("c").unwrap()),
			..body
		};
		assert_eq!(
			both.into_new_message(UserId::new("a").unwrap(), 0),
			Err(ValidationError::AmbiguousTarget)
		);
	}

	#[test]
	fn claimed_sender_only_on_call_events() {
		let ev = ClientEvent::CallEnd {
			peer: UserId::new("b").unwrap(),
			from: Some(UserId::new("x").unwrap()),
		};
		assert_eq!(ev.claimed_sender().map(UserId::as_str), Some("x"));
		assert!(ClientEvent::Ping { client_time_unix_ms: 0 }.claimed_sender().is_none());
	}

	#[test]
	fn envelope_is_adjacently_tagged() {
		let env = ServerEnvelope::error("unauthorized", "bad token");
		let v = serde_json::to_value(&env).unwrap();
		assert_eq!(v["msg"]["kind"], "error");
		assert_eq!(v["msg"]["body"]["code"], "unauthorized");
	}
}
