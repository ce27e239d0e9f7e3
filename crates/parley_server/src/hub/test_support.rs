#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use parley_domain::{CorrelationId, Message, MessageId, MessagePatch, NewMessage, RoomId, UserId};
use parley_protocol::{ClientEvent, OutgoingMessage, ServerEvent};
use tokio::sync::mpsc;
use tokio::time::timeout;

use super::{ConnId, Hub};
use crate::config::HubSettings;
use crate::server::call_log::CallLog;
use crate::server::identity::Identity;
use crate::store::{InMemoryMessageStore, MessageStore, StoreError};

pub(super) fn uid(s: &str) -> UserId {
	UserId::new(s).expect("valid UserId")
}

pub(super) fn rid(s: &str) -> RoomId {
	RoomId::new(s).expect("valid RoomId")
}

pub(super) fn cid(s: &str) -> CorrelationId {
	CorrelationId::new(s).expect("valid CorrelationId")
}

pub(super) fn hub() -> Hub {
	hub_with(HubSettings::default(), Arc::new(InMemoryMessageStore::new()))
}

pub(super) fn hub_with(settings: HubSettings, store: Arc<dyn MessageStore>) -> Hub {
	Hub::new(settings, store, CallLog::disabled())
}

/// One fake connection: the hub side id plus its outbound queue.
pub(super) struct TestConn {
	pub conn_id: ConnId,
	pub user: UserId,
	pub welcome_online: Vec<UserId>,
	rx: mpsc::Receiver<ServerEvent>,
}

impl TestConn {
	pub async fn next(&mut self) -> ServerEvent {
		timeout(Duration::from_millis(500), self.rx.recv())
			.await
			.expect("expected an event within timeout")
			.expect("outbound channel open")
	}

	/// Everything queued right now.
	pub fn drain(&mut self) -> Vec<ServerEvent> {
		let mut out = Vec::new();
		while let Ok(ev) = self.rx.try_recv() {
			out.push(ev);
		}
		out
	}

	pub fn assert_quiet(&mut self) {
		let pending = self.drain();
		assert!(pending.is_empty(), "unexpected events for {}: {pending:?}", self.user);
	}

	pub async fn send(&self, hub: &Hub, ev: ClientEvent) {
		hub.dispatch(self.conn_id, ev).await;
	}
}

pub(super) async fn connect(hub: &Hub, user: &str) -> TestConn {
	let (tx, rx) = mpsc::channel(64);
	let identity = Identity {
		user_id: uid(user),
		display_name: user.to_uppercase(),
	};
	let connected = hub.connect(&identity, tx).await;
	TestConn {
		conn_id: connected.conn_id,
		user: identity.user_id,
		welcome_online: connected.online_users,
		rx,
	}
}

pub(super) fn direct_body(to: &str, text: &str, correlation: &str) -> OutgoingMessage {
	OutgoingMessage {
		receiver_id: Some(uid(to)),
		text: text.to_string(),
		correlation_id: Some(cid(correlation)),
		..Default::default()
	}
}

pub(super) fn room_body(room: &str, text: &str, correlation: &str) -> OutgoingMessage {
	OutgoingMessage {
		room_id: Some(rid(room)),
		text: text.to_string(),
		correlation_id: Some(cid(correlation)),
		..Default::default()
	}
}

/// A store whose writes always fail.
pub(super) struct FailingStore;

#[async_trait::async_trait]
impl MessageStore for FailingStore {
	async fn save_message(&self, _new: NewMessage) -> Result<Message, StoreError> {
		Err(StoreError::Unavailable("disk full".to_string()))
	}

	async fn update_message(&self, _id: &MessageId, _patch: MessagePatch) -> Result<Message, StoreError> {
		Err(StoreError::Unavailable("disk full".to_string()))
	}

	async fn find_message(&self, _id: &MessageId) -> Result<Option<Message>, StoreError> {
		Ok(None)
	}
}

/// Holds back saves of messages whose text is `"slow"`.
pub(super) struct DelayingStore {
	inner: InMemoryMessageStore,
	delay: Duration,
}

impl DelayingStore {
	pub fn new(delay: Duration) -> Self {
		Self {
			inner: InMemoryMessageStore::new(),
			delay,
		}
	}
}

#[async_trait::async_trait]
impl MessageStore for DelayingStore {
	async fn save_message(&self, new: NewMessage) -> Result<Message, StoreError> {
		if new.text == "slow" {
			tokio::time::sleep(self.delay).await;
		}
		self.inner.save_message(new).await
	}

	async fn update_message(&self, id: &MessageId, patch: MessagePatch) -> Result<Message, StoreError> {
		self.inner.update_message(id, patch).await
	}

	async fn find_message(&self, id: &MessageId) -> Result<Option<Message>, StoreError> {
		self.inner.find_message(id).await
	}
}
