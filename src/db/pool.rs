// src/db/pool.rs
// Async connection pool using deadpool-sqlite
//
// All database access goes through `interact()` (or a wrapper): the closure
// runs on a blocking thread pool, so SQLite work never blocks the async
// runtime. In-memory pools use a shared-cache URI so every pooled
// connection sees the same database, which is what the tests rely on.

use crate::config::StorageConfig;
use crate::error::is_sqlite_contention;
use anyhow::{Context, Result};
use deadpool_sqlite::{Config, Hook, Pool, Runtime};
use rusqlite::Connection;
use std::path::{Path, PathBuf};

/// Retry delays for SQLite contention backoff (100ms, 500ms, 2s).
const RETRY_DELAYS: [std::time::Duration; 3] = [
    std::time::Duration::from_millis(100),
    std::time::Duration::from_millis(500),
    std::time::Duration::from_millis(2000),
];

/// Check if an anyhow::Error chain contains a SQLite contention error.
fn is_contention(err: &anyhow::Error) -> bool {
    err.downcast_ref::<rusqlite::Error>()
        .map(is_sqlite_contention)
        .unwrap_or(false)
}

/// Generic retry-with-backoff for operations that may hit SQLite contention.
async fn retry_with_backoff<F, Fut, R>(mut op: F) -> Result<R>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<R>>,
{
    for (attempt, delay) in RETRY_DELAYS.iter().enumerate() {
        match op().await {
            Ok(result) => return Ok(result),
            Err(e) => {
                if is_contention(&e) {
                    tracing::warn!(
                        "SQLite contention on attempt {}/{}, retrying in {:?}",
                        attempt + 1,
                        RETRY_DELAYS.len(),
                        delay
                    );
                    tokio::time::sleep(*delay).await;
                } else {
                    return Err(e);
                }
            }
        }
    }

    // Final attempt, no retry after this
    op().await
}

/// Database pool wrapper with per-connection PRAGMA setup.
pub struct DatabasePool {
    pool: Pool,
    path: Option<PathBuf>,
    /// URI for in-memory databases (used to share state in tests)
    memory_uri: Option<String>,
}

impl DatabasePool {
    /// Open a pooled database at the given path and run schema migrations.
    pub async fn open(path: &Path, config: &StorageConfig) -> Result<Self> {
        ensure_parent_directory(path)?;

        let conn_str = path.to_string_lossy().to_string();
        let hook = make_post_create_hook(config.clone());

        let cfg = Config::new(&conn_str);
        let pool = cfg
            .builder(Runtime::Tokio1)
            .context("Failed to create pool builder")?
            .max_size(8)
            .post_create(hook)
            .build()
            .context("Failed to build connection pool")?;

        let db_pool = Self {
            pool,
            path: Some(path.to_path_buf()),
            memory_uri: None,
        };

        db_pool.run_migrations().await?;
        Ok(db_pool)
    }

    /// Open a pooled in-memory database.
    ///
    /// Uses a shared cache URI so all connections access the same in-memory
    /// database. Without shared cache, each connection would get its own
    /// separate empty database.
    pub async fn open_in_memory() -> Result<Self> {
        let uri = format!("file:memdb_{}?mode=memory&cache=shared", uuid::Uuid::new_v4());
        let hook = make_memory_post_create_hook();

        let cfg = Config::new(&uri);
        let pool = cfg
            .builder(Runtime::Tokio1)
            .context("Failed to create pool builder")?
            .max_size(8)
            .post_create(hook)
            .build()
            .context("Failed to build connection pool")?;

        let db_pool = Self {
            pool,
            path: None,
            memory_uri: Some(uri),
        };

        db_pool.run_migrations().await?;
        Ok(db_pool)
    }

    /// Get the memory URI (for sharing state in tests)
    pub fn memory_uri(&self) -> Option<&str> {
        self.memory_uri.as_deref()
    }

    /// Get the database file path (None for in-memory).
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Run a closure with a connection from the pool.
    ///
    /// This is the primary API for database access. The closure runs on a
    /// blocking thread pool, so it won't block the async runtime.
    pub async fn interact<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&Connection) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let conn = self
            .pool
            .get()
            .await
            .context("Failed to get connection from pool")?;

        conn.interact(move |conn| f(conn))
            .await
            .map_err(|e| anyhow::anyhow!("interact failed: {e}"))?
    }

    /// Run a closure that may return a rusqlite::Error.
    pub async fn interact_raw<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&Connection) -> rusqlite::Result<R> + Send + 'static,
        R: Send + 'static,
    {
        self.interact(move |conn| f(conn).map_err(Into::into)).await
    }

    /// Run a closure on a pooled connection, logging errors at debug but not
    /// propagating. Use for low-priority best-effort operations (cache
    /// population, heartbeats).
    pub async fn try_interact<F, R>(&self, label: &str, f: F) -> Option<R>
    where
        F: FnOnce(&Connection) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let label = label.to_string();
        match self.interact(move |conn| f(conn)).await {
            Ok(v) => Some(v),
            Err(e) => {
                tracing::debug!("{}: {}", label, e);
                None
            }
        }
    }

    /// Run a closure with retry on SQLite contention errors.
    ///
    /// Uses backoff (100ms, 500ms, 2000ms) for up to 3 retries. Use this for
    /// critical writes that must not be lost. The closure must be `Clone` to
    /// support retries.
    pub async fn interact_with_retry<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&Connection) -> Result<R> + Send + Clone + 'static,
        R: Send + 'static,
    {
        retry_with_backoff(|| {
            let f_clone = f.clone();
            self.interact(f_clone)
        })
        .await
    }

    /// Run schema migrations. Called during pool creation.
    async fn run_migrations(&self) -> Result<()> {
        self.interact(|conn| {
            super::schema::run_migrations(conn)?;
            if let Err(e) = conn.execute_batch("PRAGMA optimize") {
                tracing::debug!("PRAGMA optimize skipped: {}", e);
            }
            Ok(())
        })
        .await
    }
}

/// Ensure parent directory exists.
fn ensure_parent_directory(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent)?;
    }
    Ok(())
}

/// Create a post_create hook for file-based databases.
///
/// WAL and cache_size come from the storage config; busy_timeout gives
/// writers a 5s retry window and NORMAL synchronous is safe with WAL.
fn make_post_create_hook(config: StorageConfig) -> Hook {
    Hook::async_fn(move |conn, _metrics| {
        let config = config.clone();
        Box::pin(async move {
            conn.interact(move |conn| setup_connection(conn, &config))
                .await
                .map_err(|e| {
                    deadpool_sqlite::HookError::Message(format!("interact failed: {e}").into())
                })?
                .map_err(|e| {
                    deadpool_sqlite::HookError::Message(
                        format!("connection setup failed: {e}").into(),
                    )
                })
        })
    })
}

/// Create a post_create hook for in-memory databases.
///
/// WAL mode is not applicable to in-memory DBs; only busy_timeout matters.
fn make_memory_post_create_hook() -> Hook {
    Hook::async_fn(|conn, _metrics| {
        Box::pin(async move {
            conn.interact(|conn| {
                conn.execute_batch("PRAGMA busy_timeout=5000;")?;
                Ok::<_, rusqlite::Error>(())
            })
            .await
            .map_err(|e| {
                deadpool_sqlite::HookError::Message(format!("interact failed: {e}").into())
            })?
            .map_err(|e| {
                deadpool_sqlite::HookError::Message(format!("connection setup failed: {e}").into())
            })
        })
    })
}

/// Configure a connection after it's created.
fn setup_connection(conn: &Connection, config: &StorageConfig) -> rusqlite::Result<()> {
    if config.enable_wal {
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
    }
    conn.execute_batch(&format!(
        "PRAGMA cache_size={}; \
         PRAGMA busy_timeout=5000; \
         PRAGMA synchronous=NORMAL;",
        config.cache_size
    ))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_pool_in_memory() {
        let pool = DatabasePool::open_in_memory()
            .await
            .expect("Failed to open in-memory pool");

        pool.interact(|conn| {
            conn.execute(
                "INSERT INTO devices (device_id, hardware_tier, last_seen, status)
                 VALUES (?1, ?2, ?3, ?4)",
                rusqlite::params!["dev-a", "laptop", "2026-01-01T00:00:00Z", "online"],
            )?;
            Ok(())
        })
        .await
        .expect("Failed to insert");

        // Verify from another connection in the pool (tests shared cache)
        let tier: String = pool
            .interact(|conn| {
                conn.query_row(
                    "SELECT hardware_tier FROM devices WHERE device_id = 'dev-a'",
                    [],
                    |row| row.get(0),
                )
                .map_err(Into::into)
            })
            .await
            .expect("Failed to query");

        assert_eq!(tier, "laptop");
    }

    #[tokio::test]
    async fn test_open_file_backed_pool() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("brain.db");

        let pool = DatabasePool::open(&db_path, &StorageConfig::default())
            .await
            .expect("Failed to open file pool");

        assert_eq!(pool.path(), Some(db_path.as_path()));
        assert!(db_path.exists());

        // WAL mode should be active on file-backed pools
        let mode: String = pool
            .interact(|conn| {
                conn.query_row("PRAGMA journal_mode", [], |row| row.get(0))
                    .map_err(Into::into)
            })
            .await
            .unwrap();
        assert_eq!(mode.to_lowercase(), "wal");
    }

    #[tokio::test]
    async fn test_concurrent_access() {
        let pool = std::sync::Arc::new(
            DatabasePool::open_in_memory()
                .await
                .expect("Failed to open pool"),
        );

        let mut handles = Vec::new();
        for i in 0..10 {
            let pool = pool.clone();
            handles.push(tokio::spawn(async move {
                pool.interact_with_retry(move |conn| {
                    conn.execute(
                        "INSERT INTO devices (device_id, hardware_tier, last_seen, status)
                         VALUES (?1, 'laptop', '2026-01-01T00:00:00Z', 'online')",
                        rusqlite::params![format!("dev-{i}")],
                    )?;
                    Ok(())
                })
                .await
            }));
        }

        for handle in handles {
            handle.await.unwrap().expect("Insert failed");
        }

        let count: i64 = pool
            .interact(|conn| {
                conn.query_row("SELECT COUNT(*) FROM devices", [], |row| row.get(0))
                    .map_err(Into::into)
            })
            .await
            .expect("Count failed");

        assert_eq!(count, 10);
    }

    #[tokio::test]
    async fn test_non_busy_error_fails_fast() {
        let pool = DatabasePool::open_in_memory()
            .await
            .expect("Failed to open pool");

        let result = pool
            .interact_with_retry(|conn| {
                conn.execute("INSERT INTO nonexistent_table VALUES (1)", [])?;
                Ok(())
            })
            .await;

        assert!(result.is_err());
    }
}
