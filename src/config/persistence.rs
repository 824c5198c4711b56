//! Persistence configuration.

use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;

use crate::persistence::{MemoryBackend, PersistenceManager, StorageBackend};

/// Backend type for persistence
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendType {
    /// Process memory
    #[default]
    Memory,
}

fn default_flush_interval() -> Duration {
    Duration::from_millis(100)
}

fn default_max_batch_size() -> usize {
    100
}

/// Persistence configuration
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct PersistenceConfig {
    /// Enable persistence
    pub enabled: bool,

    /// Backend type
    pub backend: BackendType,

    /// Flush interval (e.g., "100ms", "1s")
    #[serde(default = "default_flush_interval", with = "humantime_serde")]
    pub flush_interval: Duration,

    /// Maximum batch size before forced flush
    #[serde(default = "default_max_batch_size")]
    pub max_batch_size: usize,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            backend: BackendType::Memory,
            flush_interval: default_flush_interval(),
            max_batch_size: default_max_batch_size(),
        }
    }
}

impl PersistenceConfig {
    /// Start the background writer for the configured backend.
    ///
    /// Returns `None` when persistence is disabled. Must be called within a
    /// Tokio runtime.
    pub fn start(&self) -> Option<Arc<PersistenceManager>> {
        if !self.enabled {
            return None;
        }
        let backend: Arc<dyn StorageBackend> = match self.backend {
            BackendType::Memory => Arc::new(MemoryBackend::new()),
        };
        Some(Arc::new(PersistenceManager::new(
            backend,
            self.flush_interval,
            self.max_batch_size.max(1),
        )))
    }
}
