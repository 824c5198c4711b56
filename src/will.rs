//! Will Scheduler
//!
//! A will is armed at CONNECT and held by the session. When the connection
//! ends without a normal DISCONNECT the will is handed here and published after
//! `min(will delay, session expiry)` seconds, unless the client resumes the
//! session first. Each pending will is a cancellable tokio task keyed by client
//! id; removal from the map decides the race between firing and cancellation.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::session::{WillMessage, SESSION_NEVER_EXPIRES};

/// Injects a will message into the publish pipeline
pub trait WillPublisher: Send + Sync + 'static {
    fn publish_will(&self, client_id: &Arc<str>, will: WillMessage);
}

struct PendingWill {
    token: u64,
    will: WillMessage,
    task: JoinHandle<()>,
}

/// Delay before a will is published
pub fn will_delay(will: &WillMessage, session_expiry_interval: u32) -> Duration {
    let secs = if session_expiry_interval == SESSION_NEVER_EXPIRES {
        will.delay_interval
    } else {
        will.delay_interval.min(session_expiry_interval)
    };
    Duration::from_secs(u64::from(secs))
}

pub struct WillScheduler {
    pending: Arc<DashMap<Arc<str>, PendingWill>>,
    next_token: AtomicU64,
    publisher: Arc<dyn WillPublisher>,
}

impl WillScheduler {
    pub fn new(publisher: Arc<dyn WillPublisher>) -> Self {
        Self {
            pending: Arc::new(DashMap::new()),
            next_token: AtomicU64::new(1),
            publisher,
        }
    }

    /// Publish `will` for `client_id` after its effective delay.
    ///
    /// A zero delay publishes immediately. Any will already pending for the
    /// client is published first.
    pub fn schedule(&self, client_id: Arc<str>, will: WillMessage, session_expiry_interval: u32) {
        self.fire_now(&client_id);

        let delay = will_delay(&will, session_expiry_interval);
        if delay.is_zero() {
            debug!(client_id = %client_id, topic = %will.topic, "publishing will");
            self.publisher.publish_will(&client_id, will);
            return;
        }

        debug!(client_id = %client_id, delay = ?delay, "will scheduled");
        let token = self.next_token.fetch_add(1, Ordering::Relaxed);
        let pending = self.pending.clone();
        let publisher = self.publisher.clone();
        let task_client_id = client_id.clone();

        // Hold the map shard while spawning so the task cannot remove the
        // entry before it is inserted.
        let entry = self.pending.entry(client_id);
        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some((client_id, fired)) =
                pending.remove_if(&task_client_id, |_, p| p.token == token)
            {
                debug!(client_id = %client_id, topic = %fired.will.topic, "will delay elapsed");
                publisher.publish_will(&client_id, fired.will);
            }
        });
        entry.insert(PendingWill { token, will, task });
    }

    /// Cancel a pending will; returns true when one was pending
    pub fn cancel(&self, client_id: &str) -> bool {
        match self.pending.remove(client_id) {
            Some((_, pending)) => {
                pending.task.abort();
                debug!(client_id = %client_id, "pending will cancelled");
                true
            }
            None => false,
        }
    }

    /// Publish a pending will right away; returns true when one was pending
    pub fn fire_now(&self, client_id: &str) -> bool {
        match self.pending.remove(client_id) {
            Some((client_id, pending)) => {
                pending.task.abort();
                self.publisher.publish_will(&client_id, pending.will);
                true
            }
            None => false,
        }
    }

    pub fn is_pending(&self, client_id: &str) -> bool {
        self.pending.contains_key(client_id)
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }
}
