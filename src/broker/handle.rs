//! Handle to a live connection
//!
//! The router never writes to a connection directly. It queues into the
//! session and pokes the owning connection task through this handle; the task
//! then pumps the session queue through its in-flight window.

use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::protocol::ReasonCode;

pub struct ConnectionHandle {
    connection_id: u64,
    /// Signalled when the session queue has new messages
    deliver: Notify,
    /// Signalled when the connection must close
    close: Notify,
    close_reason: Mutex<Option<ReasonCode>>,
    alive: AtomicBool,
}

impl ConnectionHandle {
    pub fn new(connection_id: u64) -> Self {
        Self {
            connection_id,
            deliver: Notify::new(),
            close: Notify::new(),
            close_reason: Mutex::new(None),
            alive: AtomicBool::new(true),
        }
    }

    pub fn connection_id(&self) -> u64 {
        self.connection_id
    }

    /// Wake the connection task to pump its session queue
    #[inline]
    pub fn notify(&self) {
        self.deliver.notify_one();
    }

    pub async fn notified(&self) {
        self.deliver.notified().await;
    }

    /// Ask the connection to send DISCONNECT with `reason` and close.
    ///
    /// Only the first request is kept.
    pub fn close(&self, reason: ReasonCode) {
        if self.alive.swap(false, Ordering::AcqRel) {
            *self.close_reason.lock() = Some(reason);
            self.close.notify_one();
        }
    }

    /// Resolves once [`close`](Self::close) was called, yielding its reason
    pub async fn closed(&self) -> ReasonCode {
        loop {
            let reason = *self.close_reason.lock();
            if let Some(reason) = reason {
                return reason;
            }
            self.close.notified().await;
        }
    }

    #[inline]
    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }
}

impl std::fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("connection_id", &self.connection_id)
            .field("alive", &self.is_alive())
            .finish()
    }
}
