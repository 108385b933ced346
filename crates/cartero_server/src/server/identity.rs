#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use cartero_domain::{ChatError, Handle, UserId};
use sqlx::Row as _;
use tokio::sync::Mutex;

use crate::server::db::{SqlPool, storage_err, with_timeout};

/// Resolves user-facing handles to durable identities.
#[async_trait]
pub trait IdentityResolver: Send + Sync {
	async fn resolve(&self, handle: &Handle) -> Result<UserId, ChatError>;
}

/// SQL-backed resolver over the community's existing user table.
pub struct SqlIdentityResolver {
	pool: SqlPool,
	timeout: Duration,
}

impl SqlIdentityResolver {
	pub(crate) fn new(pool: SqlPool, timeout: Duration) -> Self {
		Self { pool, timeout }
	}
}

#[async_trait]
impl IdentityResolver for SqlIdentityResolver {
	async fn resolve(&self, handle: &Handle) -> Result<UserId, ChatError> {
		let pool = self.pool.clone();
		let name = handle.as_str().to_string();

		with_timeout("resolve handle", self.timeout, async move {
			let row = match &pool {
				SqlPool::Sqlite(p) => sqlx::query("SELECT id FROM users WHERE handle = ?")
					.bind(&name)
					.fetch_optional(p)
					.await
					.map_err(|e| storage_err("resolve handle", e))?
					.map(|r| r.get::<i64, _>(0)),
				SqlPool::Postgres(p) => sqlx::query("SELECT id FROM users WHERE handle = $1")
					.bind(&name)
					.fetch_optional(p)
					.await
					.map_err(|e| storage_err("resolve handle", e))?
					.map(|r| r.get::<i64, _>(0)),
				SqlPool::Mysql(p) => sqlx::query("SELECT id FROM users WHERE handle = ?")
					.bind(&name)
					.fetch_optional(p)
					.await
					.map_err(|e| storage_err("resolve handle", e))?
					.map(|r| r.get::<i64, _>(0)),
			};

			match row {
				Some(id) => Ok(UserId(id)),
				None => Err(ChatError::NotFound(format!("no user with handle {name:?}"))),
			}
		})
		.await
	}
}

/// In-memory resolver for tests and persistence-disabled deployments.
///
/// With `auto_register` set, unseen handles are assigned fresh ids on first
/// resolve; without it, they fail with `NotFound`.
pub struct MemoryIdentityResolver {
	users: Mutex<HashMap<String, UserId>>,
	next_id: AtomicI64,
	auto_register: bool,
}

impl MemoryIdentityResolver {
	pub fn new() -> Self {
		Self {
			users: Mutex::new(HashMap::new()),
			next_id: AtomicI64::new(1),
			auto_register: false,
		}
	}

	pub fn auto_registering() -> Self {
		Self {
			auto_register: true,
			..Self::new()
		}
	}

	/// Register a handle, returning its id. Resolves to the same id when the
	/// handle already exists.
	pub async fn register(&self, handle: &Handle) -> UserId {
		let mut users = self.users.lock().await;
		if let Some(id) = users.get(handle.as_str()) {
			return *id;
		}

		let id = UserId(self.next_id.fetch_add(1, Ordering::Relaxed));
		users.insert(handle.as_str().to_string(), id);
		id
	}
}

impl Default for MemoryIdentityResolver {
	fn default() -> Self {
		Self::new()
	}
}

#[async_trait]
impl IdentityResolver for MemoryIdentityResolver {
	async fn resolve(&self, handle: &Handle) -> Result<UserId, ChatError> {
		{
			let users = self.users.lock().await;
			if let Some(id) = users.get(handle.as_str()) {
				return Ok(*id);
			}
		}

		if self.auto_register {
			return Ok(self.register(handle).await);
		}

		Err(ChatError::NotFound(format!("no user with handle {:?}", handle.as_str())))
	}
}
