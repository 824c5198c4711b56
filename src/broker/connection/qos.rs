//! QoS 1/2 acknowledgement handling (PUBACK, PUBREC, PUBREL, PUBCOMP)

use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, trace};

use super::{Connection, ConnectionError};
use crate::protocol::{Packet, PubAck, PubComp, PubRec, PubRel, ReasonCode};
use crate::session::Session;

impl Connection {
    /// Handle PUBACK; frees a window slot
    pub(crate) async fn handle_puback(
        &mut self,
        client_id: &Arc<str>,
        session: &Arc<RwLock<Session>>,
        puback: PubAck,
    ) -> Result<(), ConnectionError> {
        let released = session.write().outbound.puback(puback.packet_id);
        match released {
            Some(_) => {
                trace!(client_id = %client_id, packet_id = puback.packet_id, "PUBACK");
                self.pump_pending(client_id, session).await
            }
            None => {
                debug!(client_id = %client_id, packet_id = puback.packet_id, "PUBACK for unknown packet id");
                Ok(())
            }
        }
    }

    /// Handle PUBREC; answers PUBREL, or frees the slot when the client refused the message
    pub(crate) async fn handle_pubrec(
        &mut self,
        client_id: &Arc<str>,
        session: &Arc<RwLock<Session>>,
        pubrec: PubRec,
    ) -> Result<(), ConnectionError> {
        let packet_id = pubrec.packet_id;
        let accepted = !pubrec.reason_code.is_error();

        let (release, before, after) = {
            let mut s = session.write();
            let before = s.outbound.len();
            let release = s.outbound.pubrec(packet_id, accepted);
            (release, before, s.outbound.len())
        };

        if release {
            return self.send(Packet::PubRel(PubRel::new(packet_id))).await;
        }
        if after < before {
            debug!(client_id = %client_id, packet_id, "PUBREC {}", pubrec.reason_code);
            return self.pump_pending(client_id, session).await;
        }
        if accepted {
            // Unknown exchange
            return self
                .send(Packet::PubRel(PubRel::with_reason(
                    packet_id,
                    ReasonCode::PacketIdNotFound,
                )))
                .await;
        }
        Ok(())
    }

    /// Handle PUBREL; routes the stored QoS 2 message and answers PUBCOMP
    pub(crate) async fn handle_pubrel(
        &mut self,
        client_id: &Arc<str>,
        session: &Arc<RwLock<Session>>,
        pubrel: PubRel,
    ) -> Result<(), ConnectionError> {
        let packet_id = pubrel.packet_id;
        let released = session.write().inbound.release(packet_id);

        let pubcomp = match released {
            Some(publish) => {
                self.route(client_id, publish).await;
                PubComp::new(packet_id)
            }
            None => {
                debug!(client_id = %client_id, packet_id, "PUBREL for unknown packet id");
                PubComp::with_reason(packet_id, ReasonCode::PacketIdNotFound)
            }
        };
        self.send(Packet::PubComp(pubcomp)).await
    }

    /// Handle PUBCOMP; frees a window slot
    pub(crate) async fn handle_pubcomp(
        &mut self,
        client_id: &Arc<str>,
        session: &Arc<RwLock<Session>>,
        pubcomp: PubComp,
    ) -> Result<(), ConnectionError> {
        let released = session.write().outbound.pubcomp(pubcomp.packet_id);
        match released {
            Some(_) => {
                trace!(client_id = %client_id, packet_id = pubcomp.packet_id, "PUBCOMP");
                self.pump_pending(client_id, session).await
            }
            None => {
                debug!(client_id = %client_id, packet_id = pubcomp.packet_id, "PUBCOMP for unknown packet id");
                Ok(())
            }
        }
    }
}
