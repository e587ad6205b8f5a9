//! Peer transport used by server modules to push bytes to a client

use std::sync::Arc;

use async_trait::async_trait;
use log::trace;
use shared::{DeliveryMethod, Packet, PeerId};
use thiserror::Error;
use tokio::sync::{mpsc, RwLock};

use crate::client_manager::ClientManager;
use crate::network::OutgoingMessage;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("peer {0} is not connected")]
    NotConnected(PeerId),

    #[error("outgoing queue closed")]
    Closed,
}

#[async_trait]
pub trait PeerTransport: Send + Sync {
    async fn send(
        &self,
        peer: PeerId,
        op_code: u16,
        payload: Vec<u8>,
        delivery: DeliveryMethod,
    ) -> Result<(), TransportError>;

    async fn is_connected(&self, peer: PeerId) -> bool;
}

/// Sends through the UDP server's outgoing queue
#[derive(Clone)]
pub struct UdpTransport {
    clients: Arc<RwLock<ClientManager>>,
    outgoing: mpsc::UnboundedSender<OutgoingMessage>,
}

impl UdpTransport {
    pub fn new(
        clients: Arc<RwLock<ClientManager>>,
        outgoing: mpsc::UnboundedSender<OutgoingMessage>,
    ) -> Self {
        Self { clients, outgoing }
    }
}

#[async_trait]
impl PeerTransport for UdpTransport {
    async fn send(
        &self,
        peer: PeerId,
        op_code: u16,
        payload: Vec<u8>,
        delivery: DeliveryMethod,
    ) -> Result<(), TransportError> {
        let addr = {
            let clients = self.clients.read().await;
            clients
                .get_addr(peer)
                .ok_or(TransportError::NotConnected(peer))?
        };

        trace!(
            "Queueing op {} ({} bytes, {:?}) for peer {}",
            op_code,
            payload.len(),
            delivery,
            peer
        );
        let packet = Packet::Message {
            op_code,
            delivery,
            payload,
        };
        self.outgoing
            .send(OutgoingMessage::SendPacket { packet, addr })
            .map_err(|_| TransportError::Closed)
    }

    async fn is_connected(&self, peer: PeerId) -> bool {
        self.clients.read().await.get_addr(peer).is_some()
    }
}
