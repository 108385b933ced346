#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use cartero_domain::{ChatError, ConversationId, MessageId, UserId};
use sqlx::Row as _;
use tokio::sync::Mutex;

use crate::server::db::{SqlPool, storage_err, with_timeout};
use crate::util::time::unix_ms_now;

/// A message as committed to storage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredMessage {
	pub id: MessageId,
	pub conversation: ConversationId,
	pub sender: UserId,
	pub text: String,
	pub timestamp_unix_ms: i64,
}

/// Append-only store of conversation messages.
///
/// `list` returns messages ordered by `(timestamp_unix_ms, id)` ascending,
/// so two messages committed within one millisecond still have a stable
/// order.
#[async_trait]
pub trait MessageStore: Send + Sync {
	async fn append(&self, conversation: ConversationId, sender: UserId, text: &str) -> Result<StoredMessage, ChatError>;

	async fn list(&self, conversation: ConversationId) -> Result<Vec<StoredMessage>, ChatError>;
}

pub struct SqlMessageStore {
	pool: SqlPool,
	timeout: Duration,

	// Last assigned timestamp. Held across the insert so rows commit in
	// timestamp order; without it a slow insert can commit after a later
	// append that read a larger clock value, and `list` would then invert
	// commit order.
	last_timestamp: Mutex<i64>,
}

impl SqlMessageStore {
	pub(crate) fn new(pool: SqlPool, timeout: Duration) -> Self {
		Self {
			pool,
			timeout,
			last_timestamp: Mutex::new(0),
		}
	}

	#[cfg(test)]
	pub(crate) async fn set_last_timestamp(&self, timestamp_unix_ms: i64) {
		*self.last_timestamp.lock().await = timestamp_unix_ms;
	}
}

#[async_trait]
impl MessageStore for SqlMessageStore {
	async fn append(&self, conversation: ConversationId, sender: UserId, text: &str) -> Result<StoredMessage, ChatError> {
		with_timeout("append message", self.timeout, async move {
			let mut last = self.last_timestamp.lock().await;
			let timestamp_unix_ms = unix_ms_now().max(*last);

			let id = match &self.pool {
				SqlPool::Sqlite(p) => {
					let result = sqlx::query(
						"INSERT INTO messages (conversation_id, sender_id, body, sent_at_unix_ms) VALUES (?, ?, ?, ?)",
					)
					.bind(conversation.0)
					.bind(sender.0)
					.bind(text)
					.bind(timestamp_unix_ms)
					.execute(p)
					.await
					.map_err(|e| storage_err("append message", e))?;
					result.last_insert_rowid()
				}
				SqlPool::Postgres(p) => sqlx::query_scalar(
					"INSERT INTO messages (conversation_id, sender_id, body, sent_at_unix_ms) VALUES ($1, $2, $3, $4) RETURNING id",
				)
				.bind(conversation.0)
				.bind(sender.0)
				.bind(text)
				.bind(timestamp_unix_ms)
				.fetch_one(p)
				.await
				.map_err(|e| storage_err("append message", e))?,
				SqlPool::Mysql(p) => {
					let result = sqlx::query(
						"INSERT INTO messages (conversation_id, sender_id, body, sent_at_unix_ms) VALUES (?, ?, ?, ?)",
					)
					.bind(conversation.0)
					.bind(sender.0)
					.bind(text)
					.bind(timestamp_unix_ms)
					.execute(p)
					.await
					.map_err(|e| storage_err("append message", e))?;
					result.last_insert_id() as i64
				}
			};

			*last = timestamp_unix_ms;

			Ok(StoredMessage {
				id: MessageId(id),
				conversation,
				sender,
				text: text.to_string(),
				timestamp_unix_ms,
			})
		})
		.await
	}

	async fn list(&self, conversation: ConversationId) -> Result<Vec<StoredMessage>, ChatError> {
		with_timeout("list messages", self.timeout, async move {
			let sql_qmark = "SELECT id, sender_id, body, sent_at_unix_ms FROM messages \
				WHERE conversation_id = ? ORDER BY sent_at_unix_ms ASC, id ASC";
			let sql_dollar = "SELECT id, sender_id, body, sent_at_unix_ms FROM messages \
				WHERE conversation_id = $1 ORDER BY sent_at_unix_ms ASC, id ASC";

			let rows: Vec<(i64, i64, String, i64)> = match &self.pool {
				SqlPool::Sqlite(p) => sqlx::query(sql_qmark)
					.bind(conversation.0)
					.fetch_all(p)
					.await
					.map_err(|e| storage_err("list messages", e))?
					.into_iter()
					.map(|r| (r.get(0), r.get(1), r.get(2), r.get(3)))
					.collect(),
				SqlPool::Postgres(p) => sqlx::query(sql_dollar)
					.bind(conversation.0)
					.fetch_all(p)
					.await
					.map_err(|e| storage_err("list messages", e))?
					.into_iter()
					.map(|r| (r.get(0), r.get(1), r.get(2), r.get(3)))
					.collect(),
				SqlPool::Mysql(p) => sqlx::query(sql_qmark)
					.bind(conversation.0)
					.fetch_all(p)
					.await
					.map_err(|e| storage_err("list messages", e))?
					.into_iter()
					.map(|r| (r.get(0), r.get(1), r.get(2), r.get(3)))
					.collect(),
			};

			Ok(rows
				.into_iter()
				.map(|(id, sender_id, body, sent_at_unix_ms)| StoredMessage {
					id: MessageId(id),
					conversation,
					sender: UserId(sender_id),
					text: body,
					timestamp_unix_ms: sent_at_unix_ms,
				})
				.collect())
		})
		.await
	}
}

/// In-memory store for tests and persistence-disabled deployments.
#[derive(Default)]
pub struct MemoryMessageStore {
	inner: Mutex<MemoryInner>,
}

#[derive(Default)]
struct MemoryInner {
	by_conversation: HashMap<ConversationId, Vec<StoredMessage>>,
	next_id: i64,
	last_timestamp: i64,
}

impl MemoryMessageStore {
	pub fn new() -> Self {
		Self::default()
	}
}

#[async_trait]
impl MessageStore for MemoryMessageStore {
	async fn append(&self, conversation: ConversationId, sender: UserId, text: &str) -> Result<StoredMessage, ChatError> {
		let mut inner = self.inner.lock().await;

		inner.next_id += 1;
		// Clamp to monotone so list order matches append order even when the
		// clock reads the same millisecond twice.
		inner.last_timestamp = unix_ms_now().max(inner.last_timestamp);

		let message = StoredMessage {
			id: MessageId(inner.next_id),
			conversation,
			sender,
			text: text.to_string(),
			timestamp_unix_ms: inner.last_timestamp,
		};
		inner.by_conversation.entry(conversation).or_default().push(message.clone());
		Ok(message)
	}

	async fn list(&self, conversation: ConversationId) -> Result<Vec<StoredMessage>, ChatError> {
		let inner = self.inner.lock().await;
		Ok(inner.by_conversation.get(&conversation).cloned().unwrap_or_default())
	}
}
