// src/storage/mod.rs
// Storage contract and the primary/cache fan-out layer

mod sqlite;

pub use sqlite::SqliteStorage;

use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::config::StorageConfig;
use crate::error::{HivemindError, Result};
use crate::types::{Conversation, DeviceContext, KnowledgeItem, MemoryItem, SyncOperation};

/// Durable typed store for the five record kinds, with similarity retrieval.
///
/// Backends rank by normalized cosine over a bounded candidate set and
/// truncate to `top_k`; similarity-threshold filtering is the façade's job.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    async fn initialize(&self) -> Result<()>;
    async fn close(&self) -> Result<()>;

    async fn store_memory(&self, memory: &MemoryItem) -> Result<()>;
    async fn retrieve_memories(
        &self,
        query_embedding: &[f32],
        top_k: usize,
        device_filter: Option<&str>,
    ) -> Result<Vec<MemoryItem>>;
    async fn get_memory_by_id(&self, memory_id: &str) -> Result<Option<MemoryItem>>;
    async fn delete_memory(&self, memory_id: &str) -> Result<bool>;
    async fn get_memory_count(&self) -> Result<i64>;

    async fn store_knowledge(&self, knowledge: &KnowledgeItem) -> Result<()>;
    async fn retrieve_knowledge(
        &self,
        query_embedding: &[f32],
        top_k: usize,
        source_filter: Option<&str>,
    ) -> Result<Vec<KnowledgeItem>>;
    async fn get_knowledge_by_id(&self, knowledge_id: &str) -> Result<Option<KnowledgeItem>>;
    async fn delete_knowledge(&self, knowledge_id: &str) -> Result<bool>;
    async fn get_knowledge_count(&self) -> Result<i64>;

    async fn register_device(&self, device: &DeviceContext) -> Result<()>;
    async fn get_device(&self, device_id: &str) -> Result<Option<DeviceContext>>;
    async fn list_devices(&self) -> Result<Vec<DeviceContext>>;

    async fn store_sync_operation(&self, operation: &SyncOperation) -> Result<()>;
    async fn get_pending_sync_operations(&self, device_id: &str) -> Result<Vec<SyncOperation>>;
    /// Errors with `NotFound` for an unknown operation id.
    async fn mark_sync_operation_resolved(&self, operation_id: &str) -> Result<()>;

    async fn store_conversation(&self, conversation: &Conversation) -> Result<()>;
    async fn load_conversation(&self, session_id: &str) -> Result<Option<Conversation>>;
    async fn list_conversations(&self, limit: usize) -> Result<Vec<Conversation>>;
    async fn delete_conversation(&self, session_id: &str) -> Result<bool>;
}

/// Fan-out over a primary backend and an optional read-through cache.
///
/// Writes go primary-first, cache best-effort (cache errors are logged and
/// never surfaced). Similarity reads try the cache; a non-empty hit is
/// returned as-is, otherwise the primary answers and the cache is
/// opportunistically populated. Point reads and mutations bypass the cache.
/// No consistency reconciliation happens here; the cache is expected to be
/// reseeded from primary.
pub struct Storage {
    primary: Arc<dyn StorageBackend>,
    cache: Option<Arc<dyn StorageBackend>>,
}

impl Storage {
    pub fn new(primary: Arc<dyn StorageBackend>, cache: Option<Arc<dyn StorageBackend>>) -> Self {
        Self { primary, cache }
    }

    /// Build from config. Only the local SQLite backend is available; the
    /// remote backend slot in the config exists for other deployments.
    pub fn from_config(config: &StorageConfig) -> Result<Self> {
        config.validate().map_err(HivemindError::Config)?;
        match config.primary_backend.as_str() {
            "local" => Ok(Self::new(Arc::new(SqliteStorage::new(config.clone())), None)),
            other => Err(HivemindError::Config(format!(
                "backend '{other}' is not available in this build"
            ))),
        }
    }

    pub async fn initialize(&self) -> Result<()> {
        self.primary.initialize().await?;
        if let Some(cache) = &self.cache {
            cache.initialize().await?;
        }
        Ok(())
    }

    pub async fn close(&self) -> Result<()> {
        self.primary.close().await?;
        if let Some(cache) = &self.cache {
            cache.close().await?;
        }
        Ok(())
    }

    pub async fn store_memory(&self, memory: &MemoryItem) -> Result<()> {
        self.primary.store_memory(memory).await?;

        if let Some(cache) = &self.cache
            && let Err(e) = cache.store_memory(memory).await
        {
            warn!("cache store_memory failed: {e}");
        }
        Ok(())
    }

    pub async fn retrieve_memories(
        &self,
        query_embedding: &[f32],
        top_k: usize,
        device_filter: Option<&str>,
    ) -> Result<Vec<MemoryItem>> {
        if let Some(cache) = &self.cache {
            match cache
                .retrieve_memories(query_embedding, top_k, device_filter)
                .await
            {
                Ok(cached) if !cached.is_empty() => {
                    debug!("memory retrieval served from cache ({} rows)", cached.len());
                    return Ok(cached);
                }
                Ok(_) => {}
                Err(e) => warn!("cache retrieve_memories failed: {e}"),
            }
        }

        let results = self
            .primary
            .retrieve_memories(query_embedding, top_k, device_filter)
            .await?;

        if let Some(cache) = &self.cache {
            for memory in &results {
                if let Err(e) = cache.store_memory(memory).await {
                    warn!("cache population failed for memory {}: {e}", memory.id);
                }
            }
        }

        Ok(results)
    }

    pub async fn store_knowledge(&self, knowledge: &KnowledgeItem) -> Result<()> {
        self.primary.store_knowledge(knowledge).await?;

        if let Some(cache) = &self.cache
            && let Err(e) = cache.store_knowledge(knowledge).await
        {
            warn!("cache store_knowledge failed: {e}");
        }
        Ok(())
    }

    pub async fn retrieve_knowledge(
        &self,
        query_embedding: &[f32],
        top_k: usize,
        source_filter: Option<&str>,
    ) -> Result<Vec<KnowledgeItem>> {
        if let Some(cache) = &self.cache {
            match cache
                .retrieve_knowledge(query_embedding, top_k, source_filter)
                .await
            {
                Ok(cached) if !cached.is_empty() => {
                    debug!(
                        "knowledge retrieval served from cache ({} rows)",
                        cached.len()
                    );
                    return Ok(cached);
                }
                Ok(_) => {}
                Err(e) => warn!("cache retrieve_knowledge failed: {e}"),
            }
        }

        let results = self
            .primary
            .retrieve_knowledge(query_embedding, top_k, source_filter)
            .await?;

        if let Some(cache) = &self.cache {
            for knowledge in &results {
                if let Err(e) = cache.store_knowledge(knowledge).await {
                    warn!("cache population failed for knowledge {}: {e}", knowledge.id);
                }
            }
        }

        Ok(results)
    }

    pub async fn get_memory_by_id(&self, memory_id: &str) -> Result<Option<MemoryItem>> {
        self.primary.get_memory_by_id(memory_id).await
    }

    pub async fn get_knowledge_by_id(&self, knowledge_id: &str) -> Result<Option<KnowledgeItem>> {
        self.primary.get_knowledge_by_id(knowledge_id).await
    }

    pub async fn delete_memory(&self, memory_id: &str) -> Result<bool> {
        self.primary.delete_memory(memory_id).await
    }

    pub async fn delete_knowledge(&self, knowledge_id: &str) -> Result<bool> {
        self.primary.delete_knowledge(knowledge_id).await
    }

    pub async fn get_memory_count(&self) -> Result<i64> {
        self.primary.get_memory_count().await
    }

    pub async fn get_knowledge_count(&self) -> Result<i64> {
        self.primary.get_knowledge_count().await
    }

    pub async fn register_device(&self, device: &DeviceContext) -> Result<()> {
        self.primary.register_device(device).await
    }

    pub async fn get_device(&self, device_id: &str) -> Result<Option<DeviceContext>> {
        self.primary.get_device(device_id).await
    }

    pub async fn list_devices(&self) -> Result<Vec<DeviceContext>> {
        self.primary.list_devices().await
    }

    pub async fn store_sync_operation(&self, operation: &SyncOperation) -> Result<()> {
        self.primary.store_sync_operation(operation).await
    }

    pub async fn get_pending_sync_operations(&self, device_id: &str) -> Result<Vec<SyncOperation>> {
        self.primary.get_pending_sync_operations(device_id).await
    }

    pub async fn mark_sync_operation_resolved(&self, operation_id: &str) -> Result<()> {
        self.primary.mark_sync_operation_resolved(operation_id).await
    }

    pub async fn store_conversation(&self, conversation: &Conversation) -> Result<()> {
        self.primary.store_conversation(conversation).await
    }

    pub async fn load_conversation(&self, session_id: &str) -> Result<Option<Conversation>> {
        self.primary.load_conversation(session_id).await
    }

    pub async fn list_conversations(&self, limit: usize) -> Result<Vec<Conversation>> {
        self.primary.list_conversations(limit).await
    }

    pub async fn delete_conversation(&self, session_id: &str) -> Result<bool> {
        self.primary.delete_conversation(session_id).await
    }
}
