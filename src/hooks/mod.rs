//! Hooks Module
//!
//! Extension points for the administrative policy the engine consults but does
//! not own: whether a client may subscribe to a filter or publish to a topic,
//! plus connection lifecycle notifications.

use std::fmt;

use async_trait::async_trait;

use crate::protocol::QoS;


/// Hook error types
#[derive(Debug)]
pub enum HookError {
    /// Internal error
    Internal(String),
    /// Authorization denied
    AuthorizationDenied,
}

impl fmt::Display for HookError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HookError::Internal(msg) => write!(f, "Internal error: {}", msg),
            HookError::AuthorizationDenied => write!(f, "Authorization denied"),
        }
    }
}

impl std::error::Error for HookError {}

/// Hook result type
pub type HookResult<T> = Result<T, HookError>;

/// Engine hooks trait
///
/// All methods have default implementations that allow everything. A denied
/// check or a hook error is reported to the client as "not authorized" (0x87)
/// on PUBLISH acks and "unspecified error" (0x80) on SUBACK entries.
#[async_trait]
pub trait Hooks: Send + Sync {
    /// Called for every PUBLISH received from a client
    ///
    /// # Returns
    /// * `Ok(true)` - Publish allowed
    /// * `Ok(false)` - Publish denied
    /// * `Err(_)` - Internal error occurred
    async fn on_publish_check(
        &self,
        _client_id: &str,
        _topic: &str,
        _qos: QoS,
        _retain: bool,
    ) -> HookResult<bool> {
        Ok(true)
    }

    /// Called for every filter in a SUBSCRIBE
    ///
    /// # Returns
    /// * `Ok(true)` - Subscribe allowed
    /// * `Ok(false)` - Subscribe denied
    /// * `Err(_)` - Internal error occurred
    async fn on_subscribe_check(
        &self,
        _client_id: &str,
        _filter: &str,
        _qos: QoS,
    ) -> HookResult<bool> {
        Ok(true)
    }

    /// Called after CONNACK is sent
    async fn on_client_connected(&self, _client_id: &str, _session_present: bool) {}

    /// Called after a connection ends
    ///
    /// `graceful` is true when the client sent DISCONNECT.
    async fn on_client_disconnected(&self, _client_id: &str, _graceful: bool) {}

    /// Called after a message has been routed to subscribers
    async fn on_message_published(&self, _topic: &str, _payload: &[u8], _qos: QoS) {}
}

/// Default hooks implementation that allows everything
#[derive(Debug, Default)]
pub struct DefaultHooks;

#[async_trait]
impl Hooks for DefaultHooks {}

#[async_trait]
impl<T: Hooks + ?Sized> Hooks for std::sync::Arc<T> {
    async fn on_publish_check(
        &self,
        client_id: &str,
        topic: &str,
        qos: QoS,
        retain: bool,
    ) -> HookResult<bool> {
        (**self)
            .on_publish_check(client_id, topic, qos, retain)
            .await
    }

    async fn on_subscribe_check(&self, client_id: &str, filter: &str, qos: QoS) -> HookResult<bool> {
        (**self).on_subscribe_check(client_id, filter, qos).await
    }

    async fn on_client_connected(&self, client_id: &str, session_present: bool) {
        (**self)
            .on_client_connected(client_id, session_present)
            .await;
    }

    async fn on_client_disconnected(&self, client_id: &str, graceful: bool) {
        (**self).on_client_disconnected(client_id, graceful).await;
    }

    async fn on_message_published(&self, topic: &str, payload: &[u8], qos: QoS) {
        (**self).on_message_published(topic, payload, qos).await;
    }
}

/// Chains several hook implementations
///
/// Checks pass only if every hook allows; events go to all hooks in order.
pub struct CompositeHooks {
    hooks: Vec<Box<dyn Hooks>>,
}

impl CompositeHooks {
    pub fn new() -> Self {
        Self { hooks: Vec::new() }
    }

    pub fn add<H: Hooks + 'static>(&mut self, hooks: H) {
        self.hooks.push(Box::new(hooks));
    }

    pub fn with<H: Hooks + 'static>(mut self, hooks: H) -> Self {
        self.add(hooks);
        self
    }
}

impl Default for CompositeHooks {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Hooks for CompositeHooks {
    async fn on_publish_check(
        &self,
        client_id: &str,
        topic: &str,
        qos: QoS,
        retain: bool,
    ) -> HookResult<bool> {
        for hooks in &self.hooks {
            if !hooks.on_publish_check(client_id, topic, qos, retain).await? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    async fn on_subscribe_check(&self, client_id: &str, filter: &str, qos: QoS) -> HookResult<bool> {
        for hooks in &self.hooks {
            if !hooks.on_subscribe_check(client_id, filter, qos).await? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    async fn on_client_connected(&self, client_id: &str, session_present: bool) {
        for hooks in &self.hooks {
            hooks.on_client_connected(client_id, session_present).await;
        }
    }

    async fn on_client_disconnected(&self, client_id: &str, graceful: bool) {
        for hooks in &self.hooks {
            hooks.on_client_disconnected(client_id, graceful).await;
        }
    }

    async fn on_message_published(&self, topic: &str, payload: &[u8], qos: QoS) {
        for hooks in &self.hooks {
            hooks.on_message_published(topic, payload, qos).await;
        }
    }
}
