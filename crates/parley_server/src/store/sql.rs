#![forbid(unsafe_code)]

use std::str::FromStr as _;

use anyhow::{Context, anyhow};
use parley_domain::{Message, MessageId, MessagePatch, NewMessage};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};

use super::{MessageStore, StoreError};

/// Connection pool for the supported databases, migrated on connect.
#[derive(Clone)]
pub enum SqlPool {
	Sqlite(sqlx::SqlitePool),
	Postgres(sqlx::PgPool),
}

impl SqlPool {
	pub async fn connect(database_url: &str) -> anyhow::Result<Self> {
		if database_url.starts_with("sqlite:") {
			let opts = SqliteConnectOptions::from_str(database_url)
				.context("parse sqlite url")?
				.create_if_missing(true);
			// Each in-memory connection is its own database.
			let max_connections = if database_url.contains(":memory:") { 1 } else { 8 };
			let pool = SqlitePoolOptions::new()
				.max_connections(max_connections)
				.connect_with(opts)
				.await
				.context("connect sqlite")?;
			sqlx::migrate!("migrations/sqlite")
				.run(&pool)
				.await
				.context("run sqlite migrations")?;
			Ok(Self::Sqlite(pool))
		} else if database_url.starts_with("postgres:") || database_url.starts_with("postgresql:") {
			let pool = sqlx::PgPool::connect(database_url).await.context("connect postgres")?;
			sqlx::migrate!("migrations/postgres")
				.run(&pool)
				.await
				.context("run postgres migrations")?;
			Ok(Self::Postgres(pool))
		} else {
			Err(anyhow!("unsupported database_url (use sqlite: or postgres:)"))
		}
	}
}

/// Messages stored as JSON documents with a few indexed columns.
#[derive(Clone)]
pub struct SqlMessageStore {
	pool: SqlPool,
}

impl SqlMessageStore {
	pub fn new(pool: SqlPool) -> Self {
		Self { pool }
	}

	async fn insert(&self, msg: &Message) -> Result<(), StoreError> {
		let body = serde_json::to_string(msg)?;
		let receiver = msg.receiver().map(|u| u.as_str());
		let room = msg.room().map(|r| r.as_str());

		match &self.pool {
			SqlPool::Sqlite(pool) => {
				sqlx::query(
					"INSERT INTO messages (id, sender_id, receiver_id, room_id, correlation_id, created_at_unix_ms, updated_at_unix_ms, body) \
					VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
				)
				.bind(msg.id.as_str())
				.bind(msg.sender.as_str())
				.bind(receiver)
				.bind(room)
				.bind(msg.correlation_id.as_str())
				.bind(msg.created_at_unix_ms)
				.bind(msg.created_at_unix_ms)
				.bind(body)
				.execute(pool)
				.await?;
			}
			SqlPool::Postgres(pool) => {
				sqlx::query(
					"INSERT INTO messages (id, sender_id, receiver_id, room_id, correlation_id, created_at_unix_ms, updated_at_unix_ms, body) \
					VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
				)
				.bind(msg.id.as_str())
				.bind(msg.sender.as_str())
				.bind(receiver)
				.bind(room)
				.bind(msg.correlation_id.as_str())
				.bind(msg.created_at_unix_ms)
				.bind(msg.created_at_unix_ms)
				.bind(body)
				.execute(pool)
				.await?;
			}
		}

		Ok(())
	}
}

#[async_trait::async_trait]
impl MessageStore for SqlMessageStore {
	async fn save_message(&self, new: NewMessage) -> Result<Message, StoreError> {
		let msg = Message::from_new(MessageId::new_v4(), new);
		self.insert(&msg).await?;
		Ok(msg)
	}

	async fn update_message(&self, id: &MessageId, patch: MessagePatch) -> Result<Message, StoreError> {
		let now = parley_util::unix_ms_now();

		match &self.pool {
			SqlPool::Sqlite(pool) => {
				let mut tx = pool.begin().await?;
				let row: Option<(String,)> = sqlx::query_as("SELECT body FROM messages WHERE id = ?")
					.bind(id.as_str())
					.fetch_optional(&mut *tx)
					.await?;
				let Some((body,)) = row else {
					return Err(StoreError::NotFound(id.clone()));
				};

				let mut msg: Message = serde_json::from_str(&body)?;
				msg.apply(&patch);

				sqlx::query("UPDATE messages SET body = ?, updated_at_unix_ms = ? WHERE id = ?")
					.bind(serde_json::to_string(&msg)?)
					.bind(now)
					.bind(id.as_str())
					.execute(&mut *tx)
					.await?;
				tx.commit().await?;
				Ok(msg)
			}
			SqlPool::Postgres(pool) => {
				let mut tx = pool.begin().await?;
				let row: Option<(String,)> = sqlx::query_as("SELECT body FROM messages WHERE id = $1 FOR UPDATE")
					.bind(id.as_str())
					.fetch_optional(&mut *tx)
					.await?;
				let Some((body,)) = row else {
					return Err(StoreError::NotFound(id.clone()));
				};

				let mut msg: Message = serde_json::from_str(&body)?;
				msg.apply(&patch);

				sqlx::query("UPDATE messages SET body = $1, updated_at_unix_ms = $2 WHERE id = $3")
					.bind(serde_json::to_string(&msg)?)
					.bind(now)
					.bind(id.as_str())
					.execute(&mut *tx)
					.await?;
				tx.commit().await?;
				Ok(msg)
			}
		}
	}

	async fn find_message(&self, id: &MessageId) -> Result<Option<Message>, StoreError> {
		let row: Option<(String,)> = match &self.pool {
			SqlPool::Sqlite(pool) => {
				sqlx::query_as("SELECT body FROM messages WHERE id = ?")
					.bind(id.as_str())
					.fetch_optional(pool)
					.await?
			}
			SqlPool::Postgres(pool) => {
				sqlx::query_as("SELECT body FROM messages WHERE id = $1")
					.bind(id.as_str())
					.fetch_optional(pool)
					.await?
			}
		};

		row.map(|(body,)| serde_json::from_str(&body).map_err(StoreError::from))
			.transpose()
	}
}
