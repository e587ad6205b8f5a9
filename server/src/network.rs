//! Server network layer handling UDP communications and request dispatch

use crate::client_manager::ClientManager;
use crate::config::ServerConfig;
use crate::modules::{AuthModule, ProfilesModule};
use crate::registry::DependencyError;
use crate::router::{MessageRouter, Request};
use crate::store::ProfileStore;
use crate::transport::{PeerTransport, UdpTransport};
use bincode::{deserialize, serialize};
use log::{debug, error, info, warn};
use shared::{Packet, PeerId, Status, MAX_DATAGRAM, PROTOCOL_VERSION};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, RwLock};

/// Errors that stop the server from starting or running
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("socket error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Dependency(#[from] DependencyError),

    #[error("packet encoding failed: {0}")]
    Encode(#[from] bincode::Error),
}

/// Messages sent from network tasks to main server loop
#[derive(Debug)]
pub enum ServerMessage {
    /// A decoded packet arrived from `addr`
    PacketReceived { packet: Packet, addr: SocketAddr },
    /// The client went silent for longer than the timeout
    ClientTimeout { client_id: PeerId },
    /// Saves every active profile and stops the main loop
    Shutdown,
}

/// Messages queued for the network sender
#[derive(Debug)]
pub enum OutgoingMessage {
    SendPacket { packet: Packet, addr: SocketAddr },
}

/// Main server coordinating networking and module dispatch
pub struct Server {
    socket: Arc<UdpSocket>,
    clients: Arc<RwLock<ClientManager>>,
    router: Arc<MessageRouter>,
    auth: Arc<AuthModule>,
    profiles: Arc<ProfilesModule>,

    // Communication channels
    server_tx: mpsc::UnboundedSender<ServerMessage>,
    server_rx: mpsc::UnboundedReceiver<ServerMessage>,
    outgoing_tx: mpsc::UnboundedSender<OutgoingMessage>,
    outgoing_rx: Option<mpsc::UnboundedReceiver<OutgoingMessage>>,
}

impl Server {
    /// Binds the socket and initializes every module
    pub async fn new(
        config: &ServerConfig,
        store: Arc<dyn ProfileStore>,
    ) -> Result<Self, ServerError> {
        let socket = Arc::new(UdpSocket::bind(config.bind_addr()).await?);
        info!("Server listening on {}", socket.local_addr()?);

        let clients = Arc::new(RwLock::new(ClientManager::with_timeout(
            config.max_clients,
            config.client_timeout(),
        )));
        let (server_tx, server_rx) = mpsc::unbounded_channel();
        let (outgoing_tx, outgoing_rx) = mpsc::unbounded_channel();

        let transport: Arc<dyn PeerTransport> =
            Arc::new(UdpTransport::new(Arc::clone(&clients), outgoing_tx.clone()));
        let services = crate::build_services(config, store, transport)?;

        Ok(Server {
            socket,
            clients,
            router: services.router,
            auth: services.auth,
            profiles: services.profiles,
            server_tx,
            server_rx,
            outgoing_tx,
            outgoing_rx: Some(outgoing_rx),
        })
    }

    /// Address the socket is bound to; useful when the config asked for port 0
    pub fn local_addr(&self) -> Result<SocketAddr, ServerError> {
        Ok(self.socket.local_addr()?)
    }

    /// Sender that can stop a running server with [`ServerMessage::Shutdown`]
    pub fn control(&self) -> mpsc::UnboundedSender<ServerMessage> {
        self.server_tx.clone()
    }

    /// The profiles module, for inspecting server state from tests and tools
    pub fn profiles(&self) -> Arc<ProfilesModule> {
        Arc::clone(&self.profiles)
    }

    /// Spawns task that continuously listens for incoming packets
    fn spawn_network_receiver(&self) {
        let socket = Arc::clone(&self.socket);
        let server_tx = self.server_tx.clone();

        tokio::spawn(async move {
            let mut buffer = vec![0u8; MAX_DATAGRAM];

            loop {
                match socket.recv_from(&mut buffer).await {
                    Ok((len, addr)) => {
                        if let Ok(packet) = deserialize::<Packet>(&buffer[0..len]) {
                            if let Err(e) =
                                server_tx.send(ServerMessage::PacketReceived { packet, addr })
                            {
                                error!("Failed to send packet to main loop: {}", e);
                                break;
                            }
                        } else {
                            warn!("Failed to deserialize packet from {}", addr);
                        }
                    }
                    Err(e) => {
                        error!("Error receiving packet: {}", e);
                        tokio::time::sleep(Duration::from_millis(10)).await;
                    }
                }
            }
        });
    }

    /// Spawns task that processes outgoing packet queue
    fn spawn_network_sender(&mut self) {
        let socket = Arc::clone(&self.socket);
        let Some(mut outgoing_rx) = self.outgoing_rx.take() else {
            return;
        };

        tokio::spawn(async move {
            while let Some(message) = outgoing_rx.recv().await {
                match message {
                    OutgoingMessage::SendPacket { packet, addr } => {
                        if let Err(e) = Self::send_packet_impl(&socket, &packet, addr).await {
                            error!("Failed to send packet to {}: {}", addr, e);
                        }
                    }
                }
            }
        });
    }

    /// Spawns task that monitors client timeouts
    fn spawn_timeout_checker(&self) {
        let clients = Arc::clone(&self.clients);
        let server_tx = self.server_tx.clone();

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(1));

            loop {
                interval.tick().await;

                let timed_out = {
                    let mut clients_guard = clients.write().await;
                    clients_guard.check_timeouts()
                };

                for client_id in timed_out {
                    if let Err(e) = server_tx.send(ServerMessage::ClientTimeout { client_id }) {
                        error!("Failed to send timeout message: {}", e);
                        return;
                    }
                }
            }
        });
    }

    async fn send_packet_impl(
        socket: &UdpSocket,
        packet: &Packet,
        addr: SocketAddr,
    ) -> Result<(), ServerError> {
        let data = serialize(packet)?;
        socket.send_to(&data, addr).await?;
        Ok(())
    }

    fn send_packet(&self, packet: Packet, addr: SocketAddr) {
        if let Err(e) = self
            .outgoing_tx
            .send(OutgoingMessage::SendPacket { packet, addr })
        {
            error!("Failed to queue packet for sending: {}", e);
        }
    }

    /// Processes one incoming packet
    async fn handle_packet(&mut self, packet: Packet, addr: SocketAddr) {
        let client_id = {
            let mut clients = self.clients.write().await;
            let client_id = clients.find_client_by_addr(addr);
            if let Some(client_id) = client_id {
                clients.touch(client_id);
            }
            client_id
        };

        match packet {
            Packet::Connect { client_version } => {
                info!(
                    "Client connecting from {} (version: {})",
                    addr, client_version
                );

                if client_version != PROTOCOL_VERSION {
                    let reason = format!(
                        "Protocol version {} not supported, expected {}",
                        client_version, PROTOCOL_VERSION
                    );
                    self.send_packet(Packet::Disconnected { reason }, addr);
                    return;
                }

                // Remove existing connection if present
                if let Some(existing_id) = client_id {
                    info!("Removing existing client {} from {}", existing_id, addr);
                    self.drop_client(existing_id).await;
                }

                let client_id = {
                    let mut clients = self.clients.write().await;
                    clients.add_client(addr)
                };

                let response = match client_id {
                    Some(client_id) => Packet::Connected { client_id },
                    None => Packet::Disconnected {
                        reason: "Server full".to_string(),
                    },
                };
                self.send_packet(response, addr);
            }

            Packet::Heartbeat => {
                if client_id.is_none() {
                    debug!("Heartbeat from unknown address {}", addr);
                }
            }

            Packet::Request {
                request_id,
                op_code,
                payload,
            } => {
                let extensions = match client_id {
                    Some(client_id) => self.clients.read().await.extensions(client_id),
                    None => None,
                };
                let (Some(client_id), Some(extensions)) = (client_id, extensions) else {
                    self.send_packet(
                        Packet::Response {
                            request_id,
                            status: Status::Unauthorized,
                            message: Some("not connected".to_string()),
                            payload: Vec::new(),
                        },
                        addr,
                    );
                    return;
                };

                let router = Arc::clone(&self.router);
                let outgoing_tx = self.outgoing_tx.clone();
                let request = Request::new(client_id, op_code, payload, extensions);
                tokio::spawn(async move {
                    let response = router.dispatch(request).await;
                    let packet = Packet::Response {
                        request_id,
                        status: response.status,
                        message: response.message,
                        payload: response.payload,
                    };
                    if let Err(e) = outgoing_tx.send(OutgoingMessage::SendPacket { packet, addr }) {
                        error!("Failed to queue response for {}: {}", addr, e);
                    }
                });
            }

            Packet::Disconnect => {
                if let Some(client_id) = client_id {
                    self.drop_client(client_id).await;
                }
            }

            _ => {
                warn!("Unexpected packet type from client at {}", addr);
            }
        }
    }

    /// Forgets a client and ends its session
    async fn drop_client(&self, client_id: PeerId) {
        {
            let mut clients = self.clients.write().await;
            clients.remove_client(&client_id);
        }
        self.auth.disconnect(client_id).await;
    }

    /// Tells every client the server is going away and saves all profiles
    async fn shutdown(&self) {
        let client_addrs = self.clients.read().await.get_client_addrs();
        let packet = Packet::Disconnected {
            reason: "Server shutting down".to_string(),
        };
        for (client_id, addr) in client_addrs {
            if let Err(e) = Self::send_packet_impl(&self.socket, &packet, addr).await {
                error!("Failed to notify client {}: {}", client_id, e);
            }
        }

        let failures = self.profiles.save_all().await;
        if failures > 0 {
            error!("{} profiles could not be saved on shutdown", failures);
        }
    }

    /// Main server loop
    pub async fn run(&mut self) -> Result<(), ServerError> {
        // Initialize concurrent tasks
        self.spawn_network_receiver();
        self.spawn_network_sender();
        self.spawn_timeout_checker();

        info!("Server started successfully");

        loop {
            tokio::select! {
                message = self.server_rx.recv() => {
                    match message {
                        Some(ServerMessage::PacketReceived { packet, addr }) => {
                            self.handle_packet(packet, addr).await;
                        },
                        Some(ServerMessage::ClientTimeout { client_id }) => {
                            info!("Client {} timed out", client_id);
                            self.auth.disconnect(client_id).await;
                        },
                        Some(ServerMessage::Shutdown) | None => {
                            info!("Server shutting down");
                            break;
                        }
                    }
                },

                _ = tokio::signal::ctrl_c() => {
                    info!("Received Ctrl+C, shutting down gracefully...");
                    break;
                }
            }
        }

        self.shutdown().await;
        Ok(())
    }
}
