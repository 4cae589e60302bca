// src/storage/sqlite.rs
// SQLite backend: thin async trait impl delegating to the db operation fns

use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::info;

use crate::config::StorageConfig;
use crate::db::{self, DatabasePool};
use crate::error::{HivemindError, Result};
use crate::storage::StorageBackend;
use crate::types::{Conversation, DeviceContext, KnowledgeItem, MemoryItem, SyncOperation};

/// Where the backend keeps its data.
enum Target {
    File(StorageConfig),
    InMemory,
}

/// Single-file embedded SQL store, WAL-journaled, pooled.
///
/// The pool is acquired on `initialize()` and released on `close()`;
/// operations in between go through pooled connections. Reopening after
/// close requires a fresh `initialize()`.
pub struct SqliteStorage {
    target: Target,
    pool: RwLock<Option<Arc<DatabasePool>>>,
}

impl SqliteStorage {
    pub fn new(config: StorageConfig) -> Self {
        Self {
            target: Target::File(config),
            pool: RwLock::new(None),
        }
    }

    /// In-memory backend for tests and for use as a cache tier.
    pub fn in_memory() -> Self {
        Self {
            target: Target::InMemory,
            pool: RwLock::new(None),
        }
    }

    async fn pool(&self) -> Result<Arc<DatabasePool>> {
        self.pool
            .read()
            .await
            .clone()
            .ok_or(HivemindError::NotInitialized)
    }
}

/// Re-type an anyhow chain from the pool: bare rusqlite errors become `Db`
/// so transient-vs-fatal classification keeps working.
fn from_pool_error(e: anyhow::Error) -> HivemindError {
    match e.downcast::<rusqlite::Error>() {
        Ok(db) => HivemindError::Db(db),
        Err(e) => match e.downcast::<HivemindError>() {
            Ok(inner) => inner,
            Err(e) => HivemindError::Anyhow(e),
        },
    }
}

#[async_trait]
impl StorageBackend for SqliteStorage {
    async fn initialize(&self) -> Result<()> {
        let mut guard = self.pool.write().await;
        if guard.is_some() {
            return Ok(());
        }

        let pool = match &self.target {
            Target::File(config) => {
                info!(path = %config.local_db_path.display(), "Opening SQLite storage");
                DatabasePool::open(&config.local_db_path, config).await?
            }
            Target::InMemory => DatabasePool::open_in_memory().await?,
        };
        *guard = Some(Arc::new(pool));
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        let mut guard = self.pool.write().await;
        *guard = None;
        Ok(())
    }

    async fn store_memory(&self, memory: &MemoryItem) -> Result<()> {
        let memory = memory.clone();
        self.pool()
            .await?
            .interact_with_retry(move |conn| {
                db::memory::store_memory_sync(conn, &memory).map_err(Into::into)
            })
            .await
            .map_err(from_pool_error)
    }

    async fn retrieve_memories(
        &self,
        query_embedding: &[f32],
        top_k: usize,
        device_filter: Option<&str>,
    ) -> Result<Vec<MemoryItem>> {
        let query = query_embedding.to_vec();
        let filter = device_filter.map(str::to_string);
        self.pool()
            .await?
            .interact(move |conn| {
                db::memory::retrieve_memories_sync(conn, &query, top_k, filter.as_deref())
            })
            .await
            .map_err(from_pool_error)
    }

    async fn get_memory_by_id(&self, memory_id: &str) -> Result<Option<MemoryItem>> {
        let id = memory_id.to_string();
        self.pool()
            .await?
            .interact_raw(move |conn| db::memory::get_memory_by_id_sync(conn, &id))
            .await
            .map_err(from_pool_error)
    }

    async fn delete_memory(&self, memory_id: &str) -> Result<bool> {
        let id = memory_id.to_string();
        self.pool()
            .await?
            .interact_raw(move |conn| db::memory::delete_memory_sync(conn, &id))
            .await
            .map_err(from_pool_error)
    }

    async fn get_memory_count(&self) -> Result<i64> {
        self.pool()
            .await?
            .interact_raw(db::memory::get_memory_count_sync)
            .await
            .map_err(from_pool_error)
    }

    async fn store_knowledge(&self, knowledge: &KnowledgeItem) -> Result<()> {
        let knowledge = knowledge.clone();
        self.pool()
            .await?
            .interact_with_retry(move |conn| {
                db::knowledge::store_knowledge_sync(conn, &knowledge).map_err(Into::into)
            })
            .await
            .map_err(from_pool_error)
    }

    async fn retrieve_knowledge(
        &self,
        query_embedding: &[f32],
        top_k: usize,
        source_filter: Option<&str>,
    ) -> Result<Vec<KnowledgeItem>> {
        let query = query_embedding.to_vec();
        let filter = source_filter.map(str::to_string);
        self.pool()
            .await?
            .interact(move |conn| {
                db::knowledge::retrieve_knowledge_sync(conn, &query, top_k, filter.as_deref())
            })
            .await
            .map_err(from_pool_error)
    }

    async fn get_knowledge_by_id(&self, knowledge_id: &str) -> Result<Option<KnowledgeItem>> {
        let id = knowledge_id.to_string();
        self.pool()
            .await?
            .interact_raw(move |conn| db::knowledge::get_knowledge_by_id_sync(conn, &id))
            .await
            .map_err(from_pool_error)
    }

    async fn delete_knowledge(&self, knowledge_id: &str) -> Result<bool> {
        let id = knowledge_id.to_string();
        self.pool()
            .await?
            .interact_raw(move |conn| db::knowledge::delete_knowledge_sync(conn, &id))
            .await
            .map_err(from_pool_error)
    }

    async fn get_knowledge_count(&self) -> Result<i64> {
        self.pool()
            .await?
            .interact_raw(db::knowledge::get_knowledge_count_sync)
            .await
            .map_err(from_pool_error)
    }

    async fn register_device(&self, device: &DeviceContext) -> Result<()> {
        let device = device.clone();
        self.pool()
            .await?
            .interact_with_retry(move |conn| {
                db::device::register_device_sync(conn, &device).map_err(Into::into)
            })
            .await
            .map_err(from_pool_error)
    }

    async fn get_device(&self, device_id: &str) -> Result<Option<DeviceContext>> {
        let id = device_id.to_string();
        self.pool()
            .await?
            .interact_raw(move |conn| db::device::get_device_sync(conn, &id))
            .await
            .map_err(from_pool_error)
    }

    async fn list_devices(&self) -> Result<Vec<DeviceContext>> {
        self.pool()
            .await?
            .interact_raw(db::device::list_devices_sync)
            .await
            .map_err(from_pool_error)
    }

    async fn store_sync_operation(&self, operation: &SyncOperation) -> Result<()> {
        let operation = operation.clone();
        self.pool()
            .await?
            .interact_with_retry(move |conn| {
                db::sync::store_sync_operation_sync(conn, &operation).map_err(Into::into)
            })
            .await
            .map_err(from_pool_error)
    }

    async fn get_pending_sync_operations(&self, device_id: &str) -> Result<Vec<SyncOperation>> {
        let id = device_id.to_string();
        self.pool()
            .await?
            .interact_raw(move |conn| db::sync::get_pending_sync_operations_sync(conn, &id))
            .await
            .map_err(from_pool_error)
    }

    async fn mark_sync_operation_resolved(&self, operation_id: &str) -> Result<()> {
        let id = operation_id.to_string();
        let known = self
            .pool()
            .await?
            .interact_raw({
                let id = id.clone();
                move |conn| db::sync::mark_sync_operation_resolved_sync(conn, &id)
            })
            .await
            .map_err(from_pool_error)?;

        if known {
            Ok(())
        } else {
            Err(HivemindError::NotFound(format!("sync operation {id}")))
        }
    }

    async fn store_conversation(&self, conversation: &Conversation) -> Result<()> {
        let conversation = conversation.clone();
        self.pool()
            .await?
            .interact_with_retry(move |conn| {
                db::conversation::store_conversation_sync(conn, &conversation).map_err(Into::into)
            })
            .await
            .map_err(from_pool_error)
    }

    async fn load_conversation(&self, session_id: &str) -> Result<Option<Conversation>> {
        let id = session_id.to_string();
        self.pool()
            .await?
            .interact_raw(move |conn| db::conversation::load_conversation_sync(conn, &id))
            .await
            .map_err(from_pool_error)
    }

    async fn list_conversations(&self, limit: usize) -> Result<Vec<Conversation>> {
        self.pool()
            .await?
            .interact_raw(move |conn| db::conversation::list_conversations_sync(conn, limit))
            .await
            .map_err(from_pool_error)
    }

    async fn delete_conversation(&self, session_id: &str) -> Result<bool> {
        let id = session_id.to_string();
        self.pool()
            .await?
            .interact_raw(move |conn| db::conversation::delete_conversation_sync(conn, &id))
            .await
            .map_err(from_pool_error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_operations_require_initialize() {
        let backend = SqliteStorage::in_memory();
        let err = backend.get_memory_count().await.unwrap_err();
        assert!(matches!(err, HivemindError::NotInitialized));
    }

    #[tokio::test]
    async fn test_initialize_is_idempotent() {
        let backend = SqliteStorage::in_memory();
        backend.initialize().await.unwrap();

        let memory = MemoryItem::new("dev-a", "q", "a", vec![1.0]);
        backend.store_memory(&memory).await.unwrap();

        // Second initialize must not wipe state
        backend.initialize().await.unwrap();
        assert_eq!(backend.get_memory_count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_close_then_reopen() {
        let backend = SqliteStorage::in_memory();
        backend.initialize().await.unwrap();
        backend.close().await.unwrap();

        let err = backend.get_memory_count().await.unwrap_err();
        assert!(matches!(err, HivemindError::NotInitialized));

        // A fresh initialize brings the backend back (empty, it's in-memory)
        backend.initialize().await.unwrap();
        assert_eq!(backend.get_memory_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_mark_unknown_sync_op_is_not_found() {
        let backend = SqliteStorage::in_memory();
        backend.initialize().await.unwrap();

        let err = backend
            .mark_sync_operation_resolved("ghost")
            .await
            .unwrap_err();
        assert!(matches!(err, HivemindError::NotFound(_)));
    }
}
