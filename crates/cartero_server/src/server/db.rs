#![forbid(unsafe_code)]

use std::future::Future;
use std::time::Duration;

use anyhow::Context as _;
use cartero_domain::ChatError;
use sqlx::mysql::MySqlPoolOptions;
use sqlx::postgres::PgPoolOptions;
use sqlx::sqlite::SqlitePoolOptions;
use tracing::info;

/// Shared connection pool over the supported backends.
///
/// The backend is picked from the URL scheme; migrations run on connect so
/// every store sees the same schema.
#[derive(Debug, Clone)]
pub(crate) enum SqlPool {
	Sqlite(sqlx::SqlitePool),
	Postgres(sqlx::PgPool),
	Mysql(sqlx::MySqlPool),
}

impl SqlPool {
	pub(crate) async fn connect(database_url: &str) -> anyhow::Result<Self> {
		if database_url.starts_with("sqlite:") {
			// A pooled :memory: database would hand each connection its own
			// empty database, so keep in-memory pools at one connection.
			let max_connections = if database_url.contains(":memory:") { 1 } else { 5 };
			let pool = SqlitePoolOptions::new()
				.max_connections(max_connections)
				.connect(database_url)
				.await
				.context("connect sqlite pool")?;
			sqlx::migrate!("migrations/sqlite")
				.run(&pool)
				.await
				.context("run sqlite migrations")?;
			info!("connected sqlite storage");
			Ok(Self::Sqlite(pool))
		} else if database_url.starts_with("postgres:") || database_url.starts_with("postgresql:") {
			let pool = PgPoolOptions::new()
				.max_connections(5)
				.connect(database_url)
				.await
				.context("connect postgres pool")?;
			sqlx::migrate!("migrations/postgres")
				.run(&pool)
				.await
				.context("run postgres migrations")?;
			info!("connected postgres storage");
			Ok(Self::Postgres(pool))
		} else if database_url.starts_with("mysql:") {
			let pool = MySqlPoolOptions::new()
				.max_connections(5)
				.connect(database_url)
				.await
				.context("connect mysql pool")?;
			sqlx::migrate!("migrations/mysql")
				.run(&pool)
				.await
				.context("run mysql migrations")?;
			info!("connected mysql storage");
			Ok(Self::Mysql(pool))
		} else {
			anyhow::bail!("unsupported database url scheme: {database_url}");
		}
	}
}

/// Bound a storage future; an overrun surfaces as `StorageUnavailable`
/// instead of stalling the caller's session.
pub(crate) async fn with_timeout<T, F>(what: &str, limit: Duration, fut: F) -> Result<T, ChatError>
where
	F: Future<Output = Result<T, ChatError>>,
{
	match tokio::time::timeout(limit, fut).await {
		Ok(res) => res,
		Err(_) => {
			metrics::counter!("cartero_server_storage_timeouts_total").increment(1);
			Err(ChatError::StorageUnavailable(format!(
				"{what} timed out after {}ms",
				limit.as_millis()
			)))
		}
	}
}

pub(crate) fn storage_err(context: &str, e: sqlx::Error) -> ChatError {
	metrics::counter!("cartero_server_storage_errors_total").increment(1);
	ChatError::StorageUnavailable(format!("{context}: {e}"))
}

pub(crate) fn is_unique_violation(e: &sqlx::Error) -> bool {
	matches!(e, sqlx::Error::Database(db) if db.is_unique_violation())
}
