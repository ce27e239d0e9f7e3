#![forbid(unsafe_code)]

use std::collections::BTreeSet;

use parley_domain::{CorrelationId, DeleteDenied, DeleteScope, Message, MessageId, MessagePatch, MessageTarget, RoomId};
use parley_protocol::{OutgoingMessage, ServerEvent};
use tracing::{debug, warn};

use super::connections::{ConnId, ConnIdentity};
use super::locks::lock;
use super::{Hub, HubError};

impl Hub {
	/// Persist a direct message, then deliver it once to every connection
	/// of the receiver and the sender.
	pub(super) async fn send_direct(&self, me: &ConnIdentity, body: OutgoingMessage) -> Result<(), HubError> {
		let inner = &self.inner;
		let new = body.into_new_message(me.user_id.clone(), parley_util::unix_ms_now())?;
		let Some(receiver) = new.target.receiver().cloned() else {
			return Err(HubError::Validation("direct messages take receiver_id, not room_id".to_string()));
		};

		// Per-sender ordering holds across the persistence await.
		let _order = inner.send_locks.lock(&me.user_id).await;

		let correlation_id = new.correlation_id.clone();
		let saved = match inner.store.save_message(new).await {
			Ok(saved) => saved,
			Err(e) => {
				metrics::counter!("parley_server_message_persist_failures_total").increment(1);
				warn!(user_id = %me.user_id, correlation_id = %correlation_id, error = %e, "message: persist failed");
				return Err(e.into());
			}
		};
		metrics::counter!("parley_server_messages_persisted_total").increment(1);

		let targets: BTreeSet<ConnId> = inner
			.connections
			.user_conns(&receiver)
			.into_iter()
			.chain(inner.connections.user_conns(&me.user_id))
			.collect();
		let delivered = inner.connections.send_many(
			targets,
			&ServerEvent::NewMessage {
				message: saved,
				correlation_id: correlation_id.clone(),
				provisional: false,
			},
		);
		debug!(sender = %me.user_id, receiver = %receiver, correlation_id = %correlation_id, delivered, "message: direct delivered");
		Ok(())
	}

	/// Emit an optimistic copy to the room, persist, then emit the stored
	/// copy under the same correlation id. A failed save retracts the
	/// optimistic copy. The sending connection gets every copy even when it
	/// has not joined the room.
	pub(super) async fn send_room(&self, me: &ConnIdentity, body: OutgoingMessage) -> Result<(), HubError> {
		let inner = &self.inner;
		let new = body.into_new_message(me.user_id.clone(), parley_util::unix_ms_now())?;
		let Some(room) = new.target.room().cloned() else {
			return Err(HubError::Validation("room messages take room_id, not receiver_id".to_string()));
		};
		let _order = inner.send_locks.lock(&me.user_id).await;

		let correlation_id = new.correlation_id.clone();
		let optimistic = Message::from_new(MessageId::provisional(&correlation_id), new.clone());
		let targets = room_targets(self, &room, me.conn_id);
		inner.connections.send_many(
			targets,
			&ServerEvent::NewMessage {
				message: optimistic,
				correlation_id: correlation_id.clone(),
				provisional: true,
			},
		);

		match inner.store.save_message(new).await {
			Ok(saved) => {
				metrics::counter!("parley_server_messages_persisted_total").increment(1);
				let targets = room_targets(self, &room, me.conn_id);
				let delivered = inner.connections.send_many(
					targets,
					&ServerEvent::NewMessage {
						message: saved,
						correlation_id: correlation_id.clone(),
						provisional: false,
					},
				);
				debug!(sender = %me.user_id, room_id = %room, correlation_id = %correlation_id, delivered, "message: room delivered");
				Ok(())
			}
			Err(e) => {
				metrics::counter!("parley_server_message_persist_failures_total").increment(1);
				warn!(user_id = %me.user_id, room_id = %room, correlation_id = %correlation_id, error = %e, "message: persist failed; retracting");

				inner.connections.send_many(
					room_targets(self, &room, me.conn_id),
					&ServerEvent::MessageRetracted {
						room_id: room,
						correlation_id,
					},
				);
				Err(e.into())
			}
		}
	}

	/// Apply a scoped deletion after checking who may do it.
	pub(super) async fn delete_message(
		&self,
		me: &ConnIdentity,
		message_id: MessageId,
		scope: &str,
		correlation_id: Option<CorrelationId>,
	) -> Result<(), HubError> {
		let inner = &self.inner;
		let scope: DeleteScope = scope
			.parse()
			.map_err(|e| HubError::Validation(format!("invalid delete scope: {e}")))?;

		let _order = inner.send_locks.lock(&me.user_id).await;

		let Some(existing) = inner.store.find_message(&message_id).await? else {
			return Err(HubError::NotFound(format!("message {message_id} not found")));
		};

		existing.authorize_delete(&me.user_id, scope).map_err(|denied| match denied {
			DeleteDenied::ScopeInvalidForRoom => HubError::Validation(denied.to_string()),
			other => HubError::Unauthorized(other.to_string()),
		})?;

		let updated = inner
			.store
			.update_message(&message_id, MessagePatch::for_delete(scope, parley_util::unix_ms_now()))
			.await?;
		metrics::counter!("parley_server_messages_deleted_total", "scope" => scope.as_str()).increment(1);

		let mut targets: BTreeSet<ConnId> = inner.connections.user_conns(&me.user_id).into_iter().collect();
		if scope == DeleteScope::Both {
			match &updated.target {
				MessageTarget::Direct(receiver) => {
					targets.extend(inner.connections.user_conns(&updated.sender));
					targets.extend(inner.connections.user_conns(receiver));
				}
				MessageTarget::Room(room) => {
					targets.extend(lock(&inner.rooms).conns(room));
				}
			}
		}

		let delivered = inner.connections.send_many(
			targets,
			&ServerEvent::MessageDeleted {
				message_id: message_id.clone(),
				scope,
				message: updated,
				correlation_id,
			},
		);
		debug!(user_id = %me.user_id, message_id = %message_id, scope = scope.as_str(), delivered, "message: deleted");
		Ok(())
	}
}

/// Current runtime connections of `room`, plus the sender's.
fn room_targets(hub: &Hub, room: &RoomId, sender: ConnId) -> BTreeSet<ConnId> {
	let mut targets: BTreeSet<ConnId> = lock(&hub.inner.rooms).conns(room).into_iter().collect();
	targets.insert(sender);
	targets
}
