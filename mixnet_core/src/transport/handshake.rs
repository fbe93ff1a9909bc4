/*! Circuit handshake over the connection pool.
*/

use std::sync::Arc;

use async_trait::async_trait;
use log::debug;

use mixnet_crypto::SessionKey;
use mixnet_packet::packet::Packet;
use mixnet_packet::relay_node::RelayNode;

use crate::circuit::{hop_request, CircuitError, HopHandshake};
use crate::transport::pool::ConnectionPool;

/// [`HopHandshake`] that talks to real relays through the pool.
pub struct NetHandshake {
    pool: Arc<ConnectionPool>,
}

impl NetHandshake {
    /// New `NetHandshake` on top of a pool.
    pub fn new(pool: Arc<ConnectionPool>) -> NetHandshake {
        NetHandshake { pool }
    }
}

#[async_trait]
impl HopHandshake for NetHandshake {
    async fn establish(
        &self,
        node: &RelayNode,
        link_id: u32,
        session_key: &SessionKey,
        expires_at: u64,
    ) -> Result<(), CircuitError> {
        let request = hop_request(&node.pk, link_id, session_key, expires_at);
        let response = self
            .pool
            .call(node.saddr, Packet::CircuitRequest(request))
            .await
            .map_err(|error| CircuitError::HandshakeFailed {
                saddr: node.saddr,
                reason: error.to_string(),
            })?;

        match response {
            Packet::CircuitResponse(response)
                if response.link_id == link_id && response.is_valid(session_key) =>
            {
                Ok(())
            }
            Packet::CircuitResponse(_) => Err(CircuitError::HandshakeFailed {
                saddr: node.saddr,
                reason: "confirmation MAC mismatch".to_string(),
            }),
            _ => Err(CircuitError::HandshakeFailed {
                saddr: node.saddr,
                reason: "unexpected response packet".to_string(),
            }),
        }
    }

    async fn release(&self, node: &RelayNode, link_id: u32) {
        // no teardown message on the wire; the hop expires the link by
        // the deadline it accepted
        debug!("leaving link {} at {} to expire", link_id, node.saddr);
    }
}
