// src/sync.rs
// Background sync worker: per-device pending-op queue plus a tick loop.
// The wire protocol lives behind SyncTransport; the default is a no-op.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, error, info};

use crate::error::Result;
use crate::storage::Storage;
use crate::types::{SyncItemType, SyncOperation, SyncOperationType, SyncPayload};

/// Delivers pending change records to other devices.
///
/// Conforming implementations must deliver at-least-once per remote device;
/// receivers are expected to apply ops idempotently (upserts by id).
#[async_trait]
pub trait SyncTransport: Send + Sync {
    async fn perform_sync(&self) -> anyhow::Result<()>;
}

/// Transport that does nothing. Keeps the queue and loop exercisable before
/// a wire protocol exists.
pub struct NoopTransport;

#[async_trait]
impl SyncTransport for NoopTransport {
    async fn perform_sync(&self) -> anyhow::Result<()> {
        debug!("sync tick (noop transport)");
        Ok(())
    }
}

/// Background synchronization worker
pub struct SyncWorker {
    transport: Arc<dyn SyncTransport>,
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl SyncWorker {
    /// Spawn the tick loop. Errors in a tick are logged and the loop waits
    /// for the next interval; the worker never dies on a transport error.
    pub fn spawn(interval: Duration, transport: Arc<dyn SyncTransport>) -> Self {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let loop_transport = transport.clone();

        let handle = tokio::spawn(async move {
            info!("Sync worker started (interval: {:?})", interval);

            let mut ticker = time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            // The first tick of tokio's interval fires immediately; consume
            // it so syncing starts one interval after spawn.
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = loop_transport.perform_sync().await {
                            error!("Sync tick failed: {e}");
                        }
                    }
                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() {
                            info!("Sync worker shutting down");
                            break;
                        }
                    }
                }
            }
        });

        Self {
            transport,
            shutdown: shutdown_tx,
            handle,
        }
    }

    /// Force an immediate sync outside the tick schedule.
    pub async fn force_sync(&self) -> anyhow::Result<()> {
        self.transport.perform_sync().await
    }

    /// Cooperative stop: signal the loop and wait for it to exit.
    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        let _ = self.handle.await;
    }
}

/// Enqueue a change record for later delivery (`resolved = false`).
pub async fn enqueue_operation(
    storage: &Storage,
    device_id: &str,
    operation_type: SyncOperationType,
    item_type: SyncItemType,
    item_id: &str,
    payload: serde_json::Value,
) -> Result<SyncOperation> {
    let operation = SyncOperation::new(operation_type, item_type, item_id, device_id, payload);
    storage.store_sync_operation(&operation).await?;
    debug!(
        operation_id = %operation.operation_id,
        item_type = %operation.item_type,
        "Enqueued sync operation"
    );
    Ok(operation)
}

/// Enqueue a typed payload through the canonical serializer.
pub async fn enqueue_payload(
    storage: &Storage,
    device_id: &str,
    operation_type: SyncOperationType,
    payload: &SyncPayload,
) -> Result<SyncOperation> {
    let item_type = payload.item_type();
    let item_id = payload.item_id().to_string();
    let blob = payload.encode()?;
    enqueue_operation(storage, device_id, operation_type, item_type, &item_id, blob).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{SqliteStorage, Storage};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingTransport {
        ticks: AtomicUsize,
    }

    #[async_trait]
    impl SyncTransport for CountingTransport {
        async fn perform_sync(&self) -> anyhow::Result<()> {
            self.ticks.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct FailingTransport {
        ticks: AtomicUsize,
    }

    #[async_trait]
    impl SyncTransport for FailingTransport {
        async fn perform_sync(&self) -> anyhow::Result<()> {
            self.ticks.fetch_add(1, Ordering::SeqCst);
            anyhow::bail!("wire is down")
        }
    }

    #[tokio::test]
    async fn test_worker_ticks_and_stops() {
        let transport = Arc::new(CountingTransport {
            ticks: AtomicUsize::new(0),
        });
        let worker = SyncWorker::spawn(Duration::from_millis(20), transport.clone());

        tokio::time::sleep(Duration::from_millis(90)).await;
        worker.stop().await;

        let ticks = transport.ticks.load(Ordering::SeqCst);
        assert!(ticks >= 2, "expected at least 2 ticks, got {ticks}");
    }

    #[tokio::test]
    async fn test_worker_survives_transport_errors() {
        let transport = Arc::new(FailingTransport {
            ticks: AtomicUsize::new(0),
        });
        let worker = SyncWorker::spawn(Duration::from_millis(20), transport.clone());

        tokio::time::sleep(Duration::from_millis(90)).await;
        worker.stop().await;

        // More than one tick proves the loop outlived the first failure
        assert!(transport.ticks.load(Ordering::SeqCst) >= 2);
    }

    #[tokio::test]
    async fn test_force_sync() {
        let transport = Arc::new(CountingTransport {
            ticks: AtomicUsize::new(0),
        });
        let worker = SyncWorker::spawn(Duration::from_secs(3600), transport.clone());

        worker.force_sync().await.unwrap();
        assert_eq!(transport.ticks.load(Ordering::SeqCst), 1);
        worker.stop().await;
    }

    #[tokio::test]
    async fn test_enqueue_payload_round_trip() {
        let storage = Storage::new(Arc::new(SqliteStorage::in_memory()), None);
        storage.initialize().await.unwrap();

        let memory = crate::types::MemoryItem::new("dev-a", "q", "a", vec![1.0, 0.0]);
        let op = enqueue_payload(
            &storage,
            "dev-a",
            SyncOperationType::Create,
            &SyncPayload::Memory(memory.clone()),
        )
        .await
        .unwrap();

        let pending = storage.get_pending_sync_operations("dev-a").await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].operation_id, op.operation_id);
        assert_eq!(pending[0].item_type, SyncItemType::Memory);

        let decoded = SyncPayload::decode(pending[0].item_type, &pending[0].data).unwrap();
        assert_eq!(decoded.item_id(), memory.id);
    }
}
