#![forbid(unsafe_code)]

use std::collections::HashMap;

use parley_domain::{Message, MessageId, MessagePatch, NewMessage};
use tokio::sync::Mutex;

use super::{MessageStore, StoreError};

/// Process-local store used when persistence is disabled.
#[derive(Default)]
pub struct InMemoryMessageStore {
	inner: Mutex<HashMap<MessageId, Message>>,
}

impl InMemoryMessageStore {
	pub fn new() -> Self {
		Self::default()
	}

	pub async fn len(&self) -> usize {
		self.inner.lock().await.len()
	}
}

#[async_trait::async_trait]
impl MessageStore for InMemoryMessageStore {
	async fn save_message(&self, new: NewMessage) -> Result<Message, StoreError> {
		let msg = Message::from_new(MessageId::new_v4(), new);
		self.inner.lock().await.insert(msg.id.clone(), msg.clone());
		Ok(msg)
	}

	async fn update_message(&self, id: &MessageId, patch: MessagePatch) -> Result<Message, StoreError> {
		let mut guard = self.inner.lock().await;
		let msg = guard.get_mut(id).ok_or_else(|| StoreError::NotFound(id.clone()))?;
		msg.apply(&patch);
		Ok(msg.clone())
	}

	async fn find_message(&self, id: &MessageId) -> Result<Option<Message>, StoreError> {
		Ok(self.inner.lock().await.get(id).cloned())
	}
}

#[cfg(test)]
mod tests {
	use parley_domain::{CorrelationId, DeleteScope, MessageKind, MessageTarget, UserId};

	use super::*;

	fn new_message() -> NewMessage {
		NewMessage {
			sender: UserId::new("a").unwrap(),
			target: MessageTarget::Direct(UserId::new("b").unwrap()),
			text: "hello".to_string(),
			attachments: Vec::new(),
			kind: MessageKind::Text,
			location: None,
			correlation_id: CorrelationId::new("c1").unwrap(),
			created_at_unix_ms: 10,
		}
	}

	#[tokio::test]
	async fn save_then_patch() {
		let store = InMemoryMessageStore::new();
		let saved = store.save_message(new_message()).await.unwrap();
		assert!(!saved.id.is_provisional());
		assert_eq!(store.len().await, 1);

		let updated = store
			.update_message(&saved.id, MessagePatch::for_delete(DeleteScope::SenderOnly, 20))
			.await
			.unwrap();
		assert!(updated.deleted_for_sender);

		let found = store.find_message(&saved.id).await.unwrap().unwrap();
		assert_eq!(found, updated);
	}

	#[tokio::test]
	async fn patching_unknown_id_fails() {
		let store = InMemoryMessageStore::new();
		let err = store
			.update_message(&MessageId::new("nope").unwrap(), MessagePatch::default())
			.await
			.unwrap_err();
		assert!(matches!(err, StoreError::NotFound(_)));
	}
}
