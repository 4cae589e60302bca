// src/brain.rs
// Communal brain façade: the operations chatbots and agents call to share
// memory, knowledge, and conversations across the fleet.

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tracing::{info, warn};

use crate::config::HivemindConfig;
use crate::error::{HivemindError, Result};
use crate::identity::DeviceIdentity;
use crate::llm::{Generator, HttpGenerator};
use crate::storage::Storage;
use crate::summarizer::{SummarizerAgent, SummarizerStats};
use crate::sync::{NoopTransport, SyncTransport, SyncWorker, enqueue_payload};
use crate::types::{
    Conversation, DeviceContext, DeviceStatus, KnowledgeItem, MemoryItem, MemoryStats, Metadata,
    SyncOperationType, SyncPayload,
};

/// Central intelligence hub coordinating knowledge and memory across devices.
pub struct Brain {
    config: HivemindConfig,
    device_id: String,
    device_context: RwLock<DeviceContext>,
    storage: Storage,
    generator: Arc<dyn Generator>,
    summarizer: RwLock<Option<Arc<SummarizerAgent>>>,
    sync_worker: Mutex<Option<SyncWorker>>,
    sync_transport: Arc<dyn SyncTransport>,
    initialized: AtomicBool,
}

impl Brain {
    /// Build a brain from config: local SQLite storage and the configured
    /// HTTP generator.
    pub fn new(config: HivemindConfig) -> Result<Self> {
        let storage = Storage::from_config(&config.storage)?;
        let generator = Arc::new(HttpGenerator::from_config(&config.generator));
        Ok(Self::with_parts(
            config,
            storage,
            generator,
            Arc::new(NoopTransport),
        ))
    }

    /// Explicit wiring for tests and alternative deployments.
    pub fn with_parts(
        config: HivemindConfig,
        storage: Storage,
        generator: Arc<dyn Generator>,
        sync_transport: Arc<dyn SyncTransport>,
    ) -> Self {
        let device_id = config
            .brain
            .device_id
            .clone()
            .unwrap_or_else(|| DeviceIdentity::generate_device_id(None));

        let mut device_context = DeviceIdentity::create_device_context(
            Some(&device_id),
            config.brain.device_name.as_deref(),
            &config.brain.device_location,
        );
        device_context.status = DeviceStatus::Online;

        Self {
            config,
            device_id,
            device_context: RwLock::new(device_context),
            storage,
            generator,
            summarizer: RwLock::new(None),
            sync_worker: Mutex::new(None),
            sync_transport,
            initialized: AtomicBool::new(false),
        }
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub async fn device_context(&self) -> DeviceContext {
        self.device_context.read().await.clone()
    }

    /// Open storage, register this device, and start the enabled workers.
    /// Idempotent.
    pub async fn initialize(&self) -> Result<()> {
        if self.initialized.load(Ordering::SeqCst) {
            return Ok(());
        }

        self.storage.initialize().await?;
        self.storage
            .register_device(&*self.device_context.read().await)
            .await?;

        if self.config.brain.enable_summarizer {
            let agent = Arc::new(SummarizerAgent::new(
                &self.config.data_dir(),
                self.config.summarizer.clone(),
                self.generator.clone(),
            )?);
            agent.clone().start_background_monitoring().await;
            if let Err(e) = agent.summarize_on_startup().await {
                warn!("Startup summarization sweep failed: {e}");
            }
            *self.summarizer.write().await = Some(agent);
        }

        if self.config.brain.enable_sync {
            let worker = SyncWorker::spawn(
                Duration::from_secs(self.config.brain.sync_interval),
                self.sync_transport.clone(),
            );
            *self.sync_worker.lock().await = Some(worker);
        }

        self.initialized.store(true, Ordering::SeqCst);
        info!(device_id = %self.device_id, "Communal brain initialized");
        Ok(())
    }

    /// Stop workers and close storage. Operations after this fail with
    /// `NotInitialized` until a fresh `initialize()`.
    pub async fn close(&self) -> Result<()> {
        if let Some(worker) = self.sync_worker.lock().await.take() {
            worker.stop().await;
        }
        if let Some(summarizer) = self.summarizer.write().await.take() {
            summarizer.stop_background_monitoring().await;
        }

        self.storage.close().await?;
        self.initialized.store(false, Ordering::SeqCst);
        info!(device_id = %self.device_id, "Communal brain closed");
        Ok(())
    }

    fn ensure_initialized(&self) -> Result<()> {
        if self.initialized.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(HivemindError::NotInitialized)
        }
    }

    fn check_dimension(&self, embedding: &[f32]) -> Result<()> {
        let expected = self.config.embeddings.dimensions;
        if embedding.len() != expected {
            return Err(HivemindError::InvalidArgument(format!(
                "embedding has dimension {}, deployment expects {expected}",
                embedding.len()
            )));
        }
        Ok(())
    }

    /// Store a conversation memory. Returns the generated memory id.
    pub async fn store_memory(
        &self,
        user_message: &str,
        bot_response: &str,
        embedding: Vec<f32>,
        context: Option<&str>,
        tags: Option<Vec<String>>,
        metadata: Option<Metadata>,
    ) -> Result<String> {
        self.ensure_initialized()?;
        self.check_dimension(&embedding)?;

        let mut memory = MemoryItem::new(&self.device_id, user_message, bot_response, embedding);
        memory.context = context.unwrap_or_default().to_string();
        memory.tags = tags.unwrap_or_default();
        memory.metadata = metadata.unwrap_or_default();
        let memory_id = memory.id.clone();

        self.storage.store_memory(&memory).await?;
        self.enqueue_change(SyncPayload::Memory(memory)).await;
        self.update_device_heartbeat().await?;

        Ok(memory_id)
    }

    /// Retrieve similar memories, filtered by a minimum similarity.
    ///
    /// The backend is asked for twice the requested count so threshold
    /// filtering here still leaves enough results.
    pub async fn retrieve_memories(
        &self,
        query_embedding: &[f32],
        top_k: usize,
        device_filter: Option<&str>,
        min_similarity: f32,
    ) -> Result<Vec<MemoryItem>> {
        self.ensure_initialized()?;
        self.check_dimension(query_embedding)?;

        let mut memories = self
            .storage
            .retrieve_memories(query_embedding, top_k * 2, device_filter)
            .await?;
        memories.retain(|m| m.relevance_score.unwrap_or(0.0) >= min_similarity);
        memories.truncate(top_k);
        Ok(memories)
    }

    /// Store a knowledge chunk. Returns the generated knowledge id.
    #[allow(clippy::too_many_arguments)]
    pub async fn store_knowledge(
        &self,
        content: &str,
        embedding: Vec<f32>,
        source: &str,
        chunk_index: i64,
        total_chunks: i64,
        tags: Option<Vec<String>>,
        metadata: Option<Metadata>,
    ) -> Result<String> {
        self.ensure_initialized()?;
        self.check_dimension(&embedding)?;
        if chunk_index < 0 || chunk_index >= total_chunks {
            return Err(HivemindError::InvalidArgument(format!(
                "chunk_index {chunk_index} out of range for {total_chunks} chunks"
            )));
        }

        let mut knowledge = KnowledgeItem::new(&self.device_id, content, source, embedding);
        knowledge.chunk_index = chunk_index;
        knowledge.total_chunks = total_chunks;
        knowledge.tags = tags.unwrap_or_default();
        knowledge.metadata = metadata.unwrap_or_default();
        let knowledge_id = knowledge.id.clone();

        self.storage.store_knowledge(&knowledge).await?;
        self.enqueue_change(SyncPayload::Knowledge(knowledge)).await;
        self.update_device_heartbeat().await?;

        Ok(knowledge_id)
    }

    /// Retrieve similar knowledge, filtered by a minimum similarity.
    pub async fn retrieve_knowledge(
        &self,
        query_embedding: &[f32],
        top_k: usize,
        source_filter: Option<&str>,
        min_similarity: f32,
    ) -> Result<Vec<KnowledgeItem>> {
        self.ensure_initialized()?;
        self.check_dimension(query_embedding)?;

        let mut items = self
            .storage
            .retrieve_knowledge(query_embedding, top_k * 2, source_filter)
            .await?;
        items.retain(|k| k.relevance_score.unwrap_or(0.0) >= min_similarity);
        items.truncate(top_k);
        Ok(items)
    }

    pub async fn get_memory_by_id(&self, memory_id: &str) -> Result<Option<MemoryItem>> {
        self.ensure_initialized()?;
        self.storage.get_memory_by_id(memory_id).await
    }

    pub async fn delete_memory(&self, memory_id: &str) -> Result<bool> {
        self.ensure_initialized()?;
        self.storage.delete_memory(memory_id).await
    }

    pub async fn get_knowledge_by_id(&self, knowledge_id: &str) -> Result<Option<KnowledgeItem>> {
        self.ensure_initialized()?;
        self.storage.get_knowledge_by_id(knowledge_id).await
    }

    pub async fn delete_knowledge(&self, knowledge_id: &str) -> Result<bool> {
        self.ensure_initialized()?;
        self.storage.delete_knowledge(knowledge_id).await
    }

    /// Aggregate statistics about the communal store.
    pub async fn get_memory_stats(&self) -> Result<MemoryStats> {
        self.ensure_initialized()?;

        let memory_count = self.storage.get_memory_count().await?;
        let knowledge_count = self.storage.get_knowledge_count().await?;
        let devices = self.storage.list_devices().await?;

        Ok(MemoryStats {
            memory_count,
            knowledge_count,
            device_count: devices.len(),
            devices,
            this_device: self.device_context.read().await.clone(),
        })
    }

    pub async fn list_devices(&self) -> Result<Vec<DeviceContext>> {
        self.ensure_initialized()?;
        self.storage.list_devices().await
    }

    pub async fn get_device(&self, device_id: &str) -> Result<Option<DeviceContext>> {
        self.ensure_initialized()?;
        self.storage.get_device(device_id).await
    }

    /// Update this device's context and re-register it.
    pub async fn update_device_context(
        &self,
        update: impl FnOnce(&mut DeviceContext),
    ) -> Result<()> {
        self.ensure_initialized()?;

        let snapshot = {
            let mut context = self.device_context.write().await;
            update(&mut context);
            context.clone()
        };
        self.storage.register_device(&snapshot).await
    }

    // Conversation delegation: pure pass-through to storage

    pub async fn store_conversation(&self, conversation: &Conversation) -> Result<()> {
        self.ensure_initialized()?;
        self.storage.store_conversation(conversation).await
    }

    pub async fn load_conversation(&self, session_id: &str) -> Result<Option<Conversation>> {
        self.ensure_initialized()?;
        self.storage.load_conversation(session_id).await
    }

    pub async fn list_conversations(&self, limit: usize) -> Result<Vec<Conversation>> {
        self.ensure_initialized()?;
        self.storage.list_conversations(limit).await
    }

    pub async fn delete_conversation(&self, session_id: &str) -> Result<bool> {
        self.ensure_initialized()?;
        self.storage.delete_conversation(session_id).await
    }

    // Summarizer delegation

    /// Check whether a context block needs compression. Absent summarizer
    /// yields `(false, None)`.
    pub async fn check_context_size(&self, context_text: &str) -> Result<(bool, Option<String>)> {
        self.ensure_initialized()?;
        match &*self.summarizer.read().await {
            Some(agent) => Ok(agent.check_context_size(context_text).await),
            None => Ok((false, None)),
        }
    }

    /// Manually summarize one conversation file.
    pub async fn manual_summarize_file(&self, path: &Path) -> Result<bool> {
        self.ensure_initialized()?;
        match &*self.summarizer.read().await {
            Some(agent) => agent.manual_summarize_file(path).await,
            None => Ok(false),
        }
    }

    /// Re-run the startup summarization sweep.
    pub async fn trigger_startup_summarization(&self) -> Result<()> {
        self.ensure_initialized()?;
        if let Some(agent) = &*self.summarizer.read().await {
            agent.summarize_on_startup().await?;
        }
        Ok(())
    }

    pub async fn summarizer_stats(&self) -> Option<SummarizerStats> {
        self.summarizer.read().await.as_ref().map(|a| a.stats())
    }

    /// Force a sync tick outside the schedule.
    pub async fn force_sync(&self) -> Result<()> {
        self.ensure_initialized()?;
        if let Some(worker) = &*self.sync_worker.lock().await {
            worker
                .force_sync()
                .await
                .map_err(HivemindError::Anyhow)?;
        }
        Ok(())
    }

    /// Queue a change record for other devices. Best-effort: a full or
    /// failing queue must not fail the write that produced the change.
    async fn enqueue_change(&self, payload: SyncPayload) {
        if !self.config.brain.enable_sync {
            return;
        }
        if let Err(e) = enqueue_payload(
            &self.storage,
            &self.device_id,
            SyncOperationType::Create,
            &payload,
        )
        .await
        {
            warn!("Failed to enqueue sync operation: {e}");
        }
    }

    /// Refresh `last_seen` and re-register this device. Last-write-wins.
    async fn update_device_heartbeat(&self) -> Result<()> {
        let snapshot = {
            let mut context = self.device_context.write().await;
            context.touch();
            context.clone()
        };
        self.storage.register_device(&snapshot).await
    }
}
