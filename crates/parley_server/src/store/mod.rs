#![forbid(unsafe_code)]

//! Durable message storage as seen by the hub.
//!
//! The hub only saves, patches and looks up single messages; history
//! queries belong to the storage service itself.

use parley_domain::{Message, MessageId, MessagePatch, NewMessage};
use thiserror::Error;

pub mod memory;
pub mod sql;

pub use memory::InMemoryMessageStore;
pub use sql::{SqlMessageStore, SqlPool};

#[derive(Debug, Error)]
pub enum StoreError {
	#[error("message not found: {0}")]
	NotFound(MessageId),
	#[error("database error: {0}")]
	Database(#[from] sqlx::Error),
	#[error("stored document is invalid: {0}")]
	Document(#[from] serde_json::Error),
	#[error("store unavailable: {0}")]
	Unavailable(String),
}

#[async_trait::async_trait]
pub trait MessageStore: Send + Sync {
	/// Persist a new message and return it with its assigned id.
	async fn save_message(&self, new: NewMessage) -> Result<Message, StoreError>;

	/// Apply a patch and return the updated message.
	async fn update_message(&self, id: &MessageId, patch: MessagePatch) -> Result<Message, StoreError>;

	async fn find_message(&self, id: &MessageId) -> Result<Option<Message>, StoreError>;
}
