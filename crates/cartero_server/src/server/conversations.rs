#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use cartero_domain::{ChatError, ConversationId, ConversationKey};
use sqlx::Row as _;
use tokio::sync::Mutex;
use tracing::debug;

use crate::server::db::{SqlPool, is_unique_violation, storage_err, with_timeout};

/// Stores the one conversation per unordered pair of users.
#[async_trait]
pub trait ConversationStore: Send + Sync {
	/// Return the conversation for `key`, creating it if absent.
	///
	/// Idempotent: any number of concurrent callers with the same key end up
	/// with the same id.
	async fn get_or_create(&self, key: ConversationKey) -> Result<ConversationId, ChatError>;
}

/// SQL-backed store. The canonical `(user_low, user_high)` pair carries a
/// unique index, so a creation race loses cleanly and re-reads the winner.
pub struct SqlConversationStore {
	pool: SqlPool,
	timeout: Duration,
}

impl SqlConversationStore {
	pub(crate) fn new(pool: SqlPool, timeout: Duration) -> Self {
		Self { pool, timeout }
	}

	async fn find(&self, key: ConversationKey) -> Result<Option<ConversationId>, ChatError> {
		let row = match &self.pool {
			SqlPool::Sqlite(p) => sqlx::query("SELECT id FROM conversations WHERE user_low = ? AND user_high = ?")
				.bind(key.low().0)
				.bind(key.high().0)
				.fetch_optional(p)
				.await
				.map_err(|e| storage_err("find conversation", e))?
				.map(|r| r.get::<i64, _>(0)),
			SqlPool::Postgres(p) => sqlx::query("SELECT id FROM conversations WHERE user_low = $1 AND user_high = $2")
				.bind(key.low().0)
				.bind(key.high().0)
				.fetch_optional(p)
				.await
				.map_err(|e| storage_err("find conversation", e))?
				.map(|r| r.get::<i64, _>(0)),
			SqlPool::Mysql(p) => sqlx::query("SELECT id FROM conversations WHERE user_low = ? AND user_high = ?")
				.bind(key.low().0)
				.bind(key.high().0)
				.fetch_optional(p)
				.await
				.map_err(|e| storage_err("find conversation", e))?
				.map(|r| r.get::<i64, _>(0)),
		};

		Ok(row.map(ConversationId))
	}

	async fn insert(&self, key: ConversationKey) -> Result<ConversationId, sqlx::Error> {
		match &self.pool {
			SqlPool::Sqlite(p) => {
				let result = sqlx::query("INSERT INTO conversations (user_low, user_high) VALUES (?, ?)")
					.bind(key.low().0)
					.bind(key.high().0)
					.execute(p)
					.await?;
				Ok(ConversationId(result.last_insert_rowid()))
			}
			SqlPool::Postgres(p) => {
				let id: i64 = sqlx::query_scalar("INSERT INTO conversations (user_low, user_high) VALUES ($1, $2) RETURNING id")
					.bind(key.low().0)
					.bind(key.high().0)
					.fetch_one(p)
					.await?;
				Ok(ConversationId(id))
			}
			SqlPool::Mysql(p) => {
				let result = sqlx::query("INSERT INTO conversations (user_low, user_high) VALUES (?, ?)")
					.bind(key.low().0)
					.bind(key.high().0)
					.execute(p)
					.await?;
				Ok(ConversationId(result.last_insert_id() as i64))
			}
		}
	}

	/// Insert path taken after a lookup miss. A unique-violation means a
	/// concurrent caller created the row first; re-read it once.
	pub(crate) async fn insert_or_recover(&self, key: ConversationKey) -> Result<ConversationId, ChatError> {
		match self.insert(key).await {
			Ok(id) => {
				metrics::counter!("cartero_server_conversations_created_total").increment(1);
				Ok(id)
			}
			Err(e) if is_unique_violation(&e) => {
				debug!(low = key.low().0, high = key.high().0, "conversation insert raced, re-reading");
				metrics::counter!("cartero_server_conversation_create_races_total").increment(1);
				Self::recover_after_race(self.find(key).await?)
			}
			Err(e) => Err(storage_err("insert conversation", e)),
		}
	}

	/// The re-read after a lost creation race must find the winner's row;
	/// a miss means storage is misbehaving, never a client conflict.
	pub(crate) fn recover_after_race(found: Option<ConversationId>) -> Result<ConversationId, ChatError> {
		found.ok_or_else(|| ChatError::StorageUnavailable("conversation row missing after creation race".to_string()))
	}
}

#[async_trait]
impl ConversationStore for SqlConversationStore {
	async fn get_or_create(&self, key: ConversationKey) -> Result<ConversationId, ChatError> {
		with_timeout("get or create conversation", self.timeout, async move {
			if let Some(id) = self.find(key).await? {
				return Ok(id);
			}

			self.insert_or_recover(key).await
		})
		.await
	}
}

/// In-memory store for tests and persistence-disabled deployments.
#[derive(Default)]
pub struct MemoryConversationStore {
	inner: Mutex<MemoryInner>,
}

#[derive(Default)]
struct MemoryInner {
	by_key: HashMap<ConversationKey, ConversationId>,
	next_id: i64,
}

impl MemoryConversationStore {
	pub fn new() -> Self {
		Self::default()
	}
}

#[async_trait]
impl ConversationStore for MemoryConversationStore {
	async fn get_or_create(&self, key: ConversationKey) -> Result<ConversationId, ChatError> {
		let mut inner = self.inner.lock().await;
		if let Some(id) = inner.by_key.get(&key) {
			return Ok(*id);
		}

		inner.next_id += 1;
		let id = ConversationId(inner.next_id);
		inner.by_key.insert(key, id);
		Ok(id)
	}
}
