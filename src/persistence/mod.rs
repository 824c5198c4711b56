//! Persistence for the session engine.
//!
//! Provides durable storage for:
//! - Retained messages
//! - Sessions of disconnected clients (subscriptions, queued messages,
//!   in-flight QoS 1/2 exchanges and the will)
//!
//! Uses a trait-based design allowing different backends:
//! - `MemoryBackend` - process memory
//! - Anything implementing `StorageBackend`

mod backend;
mod error;
mod memory;
mod models;

pub use backend::{PersistenceOp, StorageBackend};
pub use error::{PersistenceError, Result};
pub use memory::MemoryBackend;
pub use models::{
    LoadedData, StoredInflightMessage, StoredProperties, StoredPublish, StoredRetainedMessage,
    StoredSession, StoredSubscription, StoredWillMessage,
};

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Persistence manager that handles background writes
pub struct PersistenceManager {
    backend: Arc<dyn StorageBackend>,
    tx: mpsc::Sender<PersistenceOp>,
    shutdown_tx: mpsc::Sender<()>,
    writer: Mutex<Option<JoinHandle<()>>>,
}

impl PersistenceManager {
    /// Create a new persistence manager with the given backend
    ///
    /// This spawns a background task that batches and commits writes.
    pub fn new(
        backend: Arc<dyn StorageBackend>,
        flush_interval: Duration,
        max_batch_size: usize,
    ) -> Self {
        let (tx, rx) = mpsc::channel(10_000);
        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);

        // Spawn background writer task
        let backend_clone = backend.clone();
        let writer = tokio::spawn(Self::writer_loop(
            backend_clone,
            rx,
            shutdown_rx,
            flush_interval,
            max_batch_size,
        ));

        Self {
            backend,
            tx,
            shutdown_tx,
            writer: Mutex::new(Some(writer)),
        }
    }

    /// Fire-and-forget write operation (non-blocking for hot path)
    ///
    /// If the channel is full, the operation is dropped (backpressure).
    pub fn write(&self, op: PersistenceOp) {
        if let Err(e) = self.tx.try_send(op) {
            warn!("Persistence channel full, dropping operation: {:?}", e);
        }
    }

    /// Load all data at startup
    pub async fn load_all(&self) -> Result<LoadedData> {
        self.backend.load_all().await
    }

    /// Gracefully shutdown the persistence manager
    ///
    /// This flushes all pending writes and closes the backend.
    pub async fn shutdown(&self) -> Result<()> {
        info!("Shutting down persistence manager");

        // Signal writer task to stop
        let _ = self.shutdown_tx.send(()).await;

        // Wait for the writer task to flush its batch
        let writer = self.writer.lock().take();
        if let Some(writer) = writer {
            if let Err(e) = writer.await {
                error!("Persistence writer task failed: {}", e);
            }
        }

        // Final flush
        self.backend.flush().await?;
        self.backend.close().await?;

        info!("Persistence manager shutdown complete");
        Ok(())
    }

    /// Background writer loop that batches and commits writes
    async fn writer_loop(
        backend: Arc<dyn StorageBackend>,
        mut rx: mpsc::Receiver<PersistenceOp>,
        mut shutdown_rx: mpsc::Receiver<()>,
        flush_interval: Duration,
        max_batch_size: usize,
    ) {
        let mut batch = Vec::with_capacity(max_batch_size);
        let mut interval = tokio::time::interval(flush_interval);

        loop {
            tokio::select! {
                // Receive operations
                op = rx.recv() => {
                    match op {
                        Some(op) => {
                            batch.push(op);

                            // Flush immediately if batch is large
                            if batch.len() >= max_batch_size {
                                let count = batch.len();
                                if let Err(e) = backend.batch_write(std::mem::take(&mut batch)).await {
                                    error!("Failed to write batch: {}", e);
                                } else {
                                    debug!("Flushed {} operations (max batch)", count);
                                }
                            }
                        }
                        None => {
                            // Channel closed, flush remaining and exit
                            if !batch.is_empty() {
                                if let Err(e) = backend.batch_write(std::mem::take(&mut batch)).await {
                                    error!("Failed to write final batch: {}", e);
                                }
                            }
                            break;
                        }
                    }
                }

                // Periodic flush
                _ = interval.tick() => {
                    if !batch.is_empty() {
                        let count = batch.len();
                        if let Err(e) = backend.batch_write(std::mem::take(&mut batch)).await {
                            error!("Failed to write batch: {}", e);
                        } else {
                            debug!("Flushed {} operations (interval)", count);
                        }
                    }
                }

                // Shutdown signal
                _ = shutdown_rx.recv() => {
                    info!("Persistence writer received shutdown signal");
                    // Operations queued before the signal belong to this batch
                    while let Ok(op) = rx.try_recv() {
                        batch.push(op);
                    }
                    if !batch.is_empty() {
                        let count = batch.len();
                        if let Err(e) = backend.batch_write(std::mem::take(&mut batch)).await {
                            error!("Failed to write final batch on shutdown: {}", e);
                        } else {
                            info!("Flushed {} operations on shutdown", count);
                        }
                    }
                    break;
                }
            }
        }

        info!("Persistence writer loop exited");
    }
}
