//! In-memory storage backend.
//!
//! Keeps everything in process memory. Useful for tests and for embedding
//! processes that only need state to survive a `Broker` being rebuilt.

use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use dashmap::DashMap;

use super::backend::StorageBackend;
use super::error::{PersistenceError, Result};
use super::models::{StoredRetainedMessage, StoredSession};

#[derive(Debug, Default)]
pub struct MemoryBackend {
    retained: DashMap<String, StoredRetainedMessage>,
    sessions: DashMap<String, StoredSession>,
    closed: AtomicBool,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn check_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(PersistenceError::Closed);
        }
        Ok(())
    }
}

#[async_trait]
impl StorageBackend for MemoryBackend {
    async fn get_retained(&self, topic: &str) -> Result<Option<StoredRetainedMessage>> {
        Ok(self.retained.get(topic).map(|r| r.clone()))
    }

    async fn set_retained(&self, topic: &str, message: &StoredRetainedMessage) -> Result<()> {
        self.check_open()?;
        self.retained.insert(topic.to_string(), message.clone());
        Ok(())
    }

    async fn delete_retained(&self, topic: &str) -> Result<()> {
        self.check_open()?;
        self.retained.remove(topic);
        Ok(())
    }

    async fn list_retained(&self) -> Result<Vec<(String, StoredRetainedMessage)>> {
        Ok(self
            .retained
            .iter()
            .map(|r| (r.key().clone(), r.value().clone()))
            .collect())
    }

    async fn get_session(&self, client_id: &str) -> Result<Option<StoredSession>> {
        Ok(self.sessions.get(client_id).map(|r| r.clone()))
    }

    async fn set_session(&self, client_id: &str, session: &StoredSession) -> Result<()> {
        self.check_open()?;
        self.sessions.insert(client_id.to_string(), session.clone());
        Ok(())
    }

    async fn delete_session(&self, client_id: &str) -> Result<()> {
        self.check_open()?;
        self.sessions.remove(client_id);
        Ok(())
    }

    async fn list_sessions(&self) -> Result<Vec<(String, StoredSession)>> {
        Ok(self
            .sessions
            .iter()
            .map(|r| (r.key().clone(), r.value().clone()))
            .collect())
    }

    async fn flush(&self) -> Result<()> {
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::Release);
        Ok(())
    }
}
