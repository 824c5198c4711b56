//! DISCONNECT handling and connection teardown

use std::sync::Arc;

use parking_lot::RwLock;
use tracing::debug;

use super::{Connection, ConnectionError, Exit};
use crate::broker::BrokerEvent;
use crate::persistence::{PersistenceOp, StoredSession};
use crate::protocol::{Disconnect, ProtocolError, ReasonCode};
use crate::session::Session;

impl Connection {
    /// Handle a client DISCONNECT
    pub(crate) fn handle_client_disconnect(
        &mut self,
        client_id: &Arc<str>,
        session: &Arc<RwLock<Session>>,
        disconnect: Disconnect,
    ) -> Result<Exit, ConnectionError> {
        debug!(
            client_id = %client_id,
            "DISCONNECT (reason: {})",
            disconnect.reason_code
        );

        if let Some(expiry) = disconnect.properties.session_expiry_interval {
            let mut s = session.write();
            if s.connect_expiry_was_zero && expiry != 0 {
                return Err(ProtocolError::InvalidSessionExpiry.into());
            }
            let max = self.ctx.config.max_session_expiry;
            s.session_expiry_interval = if max > 0 { expiry.min(max) } else { expiry };
        }

        // 0x04 is graceful but keeps the will
        Ok(Exit::Disconnect {
            publish_will: disconnect.reason_code == ReasonCode::DisconnectWithWill,
        })
    }

    /// Tear down after the connection ended.
    ///
    /// Does nothing to the session when a newer connection has taken it over.
    pub(crate) async fn handle_disconnect(
        &mut self,
        client_id: &Arc<str>,
        session: &Arc<RwLock<Session>>,
        result: &Result<Exit, ConnectionError>,
    ) {
        let (graceful, publish_will) = match result {
            Ok(Exit::Disconnect { publish_will }) => (true, *publish_will),
            Err(_) => (false, true),
        };
        let connection_id = self.connection_id;

        self.ctx
            .connections
            .remove_if(client_id, |_, handle| handle.connection_id() == connection_id);

        let owned = {
            let mut s = session.write();
            (s.connection_id == connection_id).then(|| (s.will.take(), s.session_expiry_interval))
        };

        match owned {
            Some((will, session_expiry)) => {
                let ctx = &self.ctx;
                let outcome = ctx.sessions.disconnect(client_id, connection_id, |client_id| {
                    ctx.subscriptions.unsubscribe_all(client_id);
                    ctx.persist(PersistenceOp::DeleteSession {
                        client_id: client_id.to_string(),
                    });
                });
                match outcome {
                    Some(true) => {
                        debug!(client_id = %client_id, "session removed");
                    }
                    Some(false) => {
                        if self.ctx.persistence.is_some() {
                            let stored = StoredSession::from(&*session.read());
                            self.ctx.persist(PersistenceOp::SetSession {
                                client_id: client_id.to_string(),
                                session: stored,
                            });
                        }
                        debug!(client_id = %client_id, session_expiry, "session kept");
                    }
                    None => {}
                }

                if publish_will {
                    if let Some(will) = will {
                        self.ctx.wills.schedule(client_id.clone(), will, session_expiry);
                    }
                }
            }
            None => {
                debug!(client_id = %client_id, "session owned by a newer connection");
            }
        }

        self.ctx
            .hooks
            .on_client_disconnected(client_id, graceful)
            .await;
        let _ = self.ctx.events.send(BrokerEvent::ClientDisconnected {
            client_id: client_id.clone(),
            graceful,
        });
    }
}
