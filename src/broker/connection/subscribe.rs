//! SUBSCRIBE and UNSUBSCRIBE packet handling

use std::sync::Arc;

use parking_lot::RwLock;
use tokio::time::Instant;
use tracing::{debug, error};

use super::{Connection, ConnectionError};
use crate::protocol::{
    Packet, Properties, ProtocolError, Publish, ReasonCode, RetainHandling, SubAck, Subscribe,
    SubscriptionOptions, UnsubAck, Unsubscribe,
};
use crate::session::Session;
use crate::topic::{self, is_wildcard_filter, parse_shared_subscription, validate_topic_filter};

impl Connection {
    /// Handle SUBSCRIBE packet
    pub(crate) async fn handle_subscribe(
        &mut self,
        client_id: &Arc<str>,
        session: &Arc<RwLock<Session>>,
        subscribe: Subscribe,
    ) -> Result<(), ConnectionError> {
        if subscribe.subscriptions.is_empty() {
            return Err(ProtocolError::Violation("SUBSCRIBE without topic filters").into());
        }

        let sub_id = subscribe
            .properties
            .subscription_identifiers
            .first()
            .copied();
        if sub_id.is_some() && !self.ctx.config.subscription_identifiers_available {
            return Err(ProtocolError::Violation("subscription identifiers not available").into());
        }

        let mut reason_codes = Vec::with_capacity(subscribe.subscriptions.len());
        let mut retained = Vec::new();

        for sub in &subscribe.subscriptions {
            let reason_code = self
                .subscribe_filter(client_id, session, &sub.filter, sub.options, sub_id, &mut retained)
                .await?;
            reason_codes.push(reason_code);
        }

        self.send(Packet::SubAck(SubAck {
            packet_id: subscribe.packet_id,
            reason_codes,
            properties: Properties::default(),
        }))
        .await?;

        // Retained messages follow the SUBACK through the normal flow control path
        if !retained.is_empty() {
            let mut s = session.write();
            for publish in retained {
                s.queue_message(publish);
            }
        }
        self.pump_pending(client_id, session).await
    }

    /// Subscribe one filter, returning its SUBACK reason code.
    ///
    /// Retained messages owed to this subscription are appended to `retained`.
    async fn subscribe_filter(
        &self,
        client_id: &Arc<str>,
        session: &Arc<RwLock<Session>>,
        filter: &str,
        options: SubscriptionOptions,
        sub_id: Option<u32>,
        retained: &mut Vec<Publish>,
    ) -> Result<ReasonCode, ConnectionError> {
        let config = &self.ctx.config;

        if validate_topic_filter(filter).is_err() {
            debug!(client_id = %client_id, filter, "invalid topic filter");
            return Ok(ReasonCode::TopicFilterInvalid);
        }

        let shared = parse_shared_subscription(filter);
        let actual = match shared {
            Some((_, actual)) => {
                if !config.shared_subscriptions_available {
                    return Ok(ReasonCode::SharedSubsNotSupported);
                }
                if options.no_local {
                    return Err(ProtocolError::Violation("no local on shared subscription").into());
                }
                actual
            }
            None => filter,
        };

        if !config.wildcard_subscription_available && is_wildcard_filter(actual) {
            return Ok(ReasonCode::WildcardSubsNotSupported);
        }

        if config.disallowed_filters.iter().any(|f| f == filter) {
            debug!(client_id = %client_id, filter, "filter not permitted");
            return Ok(ReasonCode::UnspecifiedError);
        }

        match self
            .ctx
            .hooks
            .on_subscribe_check(client_id, filter, options.qos)
            .await
        {
            Ok(true) => {}
            Ok(false) => {
                debug!(client_id = %client_id, filter, "SUBSCRIBE denied");
                return Ok(ReasonCode::UnspecifiedError);
            }
            Err(e) => {
                error!(client_id = %client_id, "subscribe check failed: {}", e);
                return Ok(ReasonCode::UnspecifiedError);
            }
        }

        let granted = options.qos.min(config.max_qos);
        let options = SubscriptionOptions {
            qos: granted,
            ..options
        };

        let existed = session
            .write()
            .add_subscription(filter.to_string(), options, sub_id);
        self.ctx.subscriptions.subscribe(
            filter,
            topic::Subscription {
                client_id: client_id.clone(),
                filter: Arc::from(actual),
                qos: granted,
                no_local: options.no_local,
                retain_as_published: options.retain_as_published,
                subscription_id: sub_id,
                share_group: None,
            },
        );
        debug!(
            client_id = %client_id,
            filter,
            qos = ?granted,
            existed,
            "subscribed"
        );

        let send_retained = shared.is_none()
            && match options.retain_handling {
                RetainHandling::SendAtSubscribe => true,
                RetainHandling::SendAtSubscribeIfNew => !existed,
                RetainHandling::DoNotSend => false,
            };
        if send_retained {
            let now = Instant::now();
            for message in self.ctx.retained.match_all(actual) {
                let mut publish = message.to_publish(now);
                publish.qos = publish.qos.min(granted);
                publish.properties.subscription_identifiers.extend(sub_id);
                retained.push(publish);
            }
        }

        Ok(ReasonCode::granted(granted))
    }

    /// Handle UNSUBSCRIBE packet
    pub(crate) async fn handle_unsubscribe(
        &mut self,
        client_id: &Arc<str>,
        session: &Arc<RwLock<Session>>,
        unsubscribe: Unsubscribe,
    ) -> Result<(), ConnectionError> {
        if unsubscribe.filters.is_empty() {
            return Err(ProtocolError::Violation("UNSUBSCRIBE without topic filters").into());
        }

        let reason_codes = unsubscribe
            .filters
            .iter()
            .map(|filter| {
                let in_session = session.write().remove_subscription(filter);
                let in_index = self.ctx.subscriptions.unsubscribe(filter, client_id);
                if in_session || in_index {
                    debug!(client_id = %client_id, filter = %filter, "unsubscribed");
                    ReasonCode::Success
                } else {
                    ReasonCode::NoSubscriptionExisted
                }
            })
            .collect();

        self.send(Packet::UnsubAck(UnsubAck {
            packet_id: unsubscribe.packet_id,
            reason_codes,
            properties: Properties::default(),
        }))
        .await
    }
}
