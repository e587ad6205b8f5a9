use crate::mirror::ProfileMirror;
use bincode::{deserialize, serialize};
use log::{debug, error, info, warn};
use shared::{
    codec, op_codes, Encode, Packet, PeerId, Status, Writer, MAX_DATAGRAM, PROTOCOL_VERSION,
};
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;
use tokio::net::UdpSocket;
use tokio::time::{timeout_at, Instant};

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Error)]
/// Errors surfaced by the headless client
pub enum ClientError {
    #[error("socket error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid server address: {0}")]
    Address(#[from] std::net::AddrParseError),

    #[error("packet encoding failed: {0}")]
    Encode(#[from] bincode::Error),

    #[error("not connected")]
    NotConnected,

    #[error("server refused the connection: {0}")]
    Refused(String),

    #[error("timed out waiting for the server")]
    Timeout,
}

/// Answer to a request
#[derive(Debug, Clone, PartialEq)]
pub struct Reply {
    pub status: Status,
    pub message: Option<String>,
    pub payload: Vec<u8>,
}

impl Reply {
    /// Whether the server answered with `Success`
    pub fn is_success(&self) -> bool {
        self.status == Status::Success
    }
}

/// Gameplay requests the client can script
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    Rename(String),
    AddItem(String),
    RemoveItem(String),
    SpendGold(i64),
    GainExperience(i64),
    GrantGold { target: String, amount: i64 },
    GrantItem { target: String, item: String },
}

impl Action {
    /// Op code and payload of the request performing this action
    pub fn request(&self) -> (u16, Vec<u8>) {
        match self {
            Action::Rename(name) => (op_codes::SET_DISPLAY_NAME, codec::to_bytes(name)),
            Action::AddItem(item) => (op_codes::ADD_ITEM, codec::to_bytes(item)),
            Action::RemoveItem(item) => (op_codes::REMOVE_ITEM, codec::to_bytes(item)),
            Action::SpendGold(amount) => (op_codes::SPEND_GOLD, codec::to_bytes(amount)),
            Action::GainExperience(amount) => (op_codes::GAIN_EXPERIENCE, codec::to_bytes(amount)),
            Action::GrantGold { target, amount } => {
                (op_codes::ADMIN_GRANT_GOLD, grant_payload(target, amount))
            }
            Action::GrantItem { target, item } => {
                (op_codes::ADMIN_GRANT_ITEM, grant_payload(target, item))
            }
        }
    }
}

fn grant_payload<T: Encode>(target: &String, value: &T) -> Vec<u8> {
    let mut writer = Writer::new();
    target.encode(&mut writer);
    value.encode(&mut writer);
    writer.into_vec()
}

/// UDP client that keeps a mirror of its own profile
pub struct Client {
    socket: UdpSocket,
    server_addr: SocketAddr,
    client_id: Option<PeerId>,
    connected: bool,
    user_id: Option<String>,

    next_request_id: u32,
    request_timeout: Duration,
    last_heartbeat: Instant,

    mirror: ProfileMirror,
}

impl Client {
    /// Binds a local socket for talking to `server_addr`; does not connect yet
    pub async fn new(server_addr: &str) -> Result<Self, ClientError> {
        let server_addr: SocketAddr = server_addr.parse()?;
        let bind_addr = if server_addr.is_ipv4() {
            "0.0.0.0:0"
        } else {
            "[::]:0"
        };
        let socket = UdpSocket::bind(bind_addr).await?;

        Ok(Client {
            socket,
            server_addr,
            client_id: None,
            connected: false,
            user_id: None,
            next_request_id: 1,
            request_timeout: Duration::from_secs(2),
            last_heartbeat: Instant::now(),
            mirror: ProfileMirror::new(),
        })
    }

    /// How long to wait for a response before giving up
    pub fn with_request_timeout(mut self, request_timeout: Duration) -> Self {
        self.request_timeout = request_timeout;
        self
    }

    /// Id the server assigned on connect
    pub fn client_id(&self) -> Option<PeerId> {
        self.client_id
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    /// The locally mirrored profile
    pub fn mirror(&self) -> &ProfileMirror {
        &self.mirror
    }

    async fn send_packet(&self, packet: &Packet) -> Result<(), ClientError> {
        let data = serialize(packet)?;
        self.socket.send_to(&data, self.server_addr).await?;
        Ok(())
    }

    /// Receives one packet, or None once `deadline` passes
    async fn recv_packet(&self, deadline: Instant) -> Result<Option<Packet>, ClientError> {
        let mut buffer = vec![0u8; MAX_DATAGRAM];
        loop {
            let (len, from) = match timeout_at(deadline, self.socket.recv_from(&mut buffer)).await {
                Ok(result) => result?,
                Err(_) => return Ok(None),
            };
            if from != self.server_addr {
                debug!("Ignoring packet from {}", from);
                continue;
            }
            match deserialize::<Packet>(&buffer[0..len]) {
                Ok(packet) => return Ok(Some(packet)),
                Err(e) => warn!("Failed to deserialize packet: {}", e),
            }
        }
    }

    /// Handles packets that are not an awaited response
    fn handle_packet(&mut self, packet: Packet) {
        match packet {
            Packet::Connected { client_id } => {
                info!("Connected! Client ID: {}", client_id);
                self.client_id = Some(client_id);
                self.connected = true;
            }

            Packet::Message {
                op_code, payload, ..
            } => {
                let owner = self.user_id.clone().unwrap_or_default();
                match self.mirror.handle_message(&owner, op_code, &payload) {
                    Ok(true) => debug!("Profile now: {}", self.mirror.summary()),
                    Ok(false) => warn!("Unhandled message op {}", op_code),
                    Err(e) => error!("Failed to apply profile message: {}", e),
                }
            }

            Packet::Disconnected { reason } => {
                warn!("Disconnected: {}", reason);
                self.connected = false;
                self.client_id = None;
            }

            Packet::Response { request_id, .. } => {
                debug!("Late response to request {}", request_id);
            }

            _ => {
                warn!("Unexpected packet type");
            }
        }
    }

    async fn heartbeat_if_due(&mut self) -> Result<(), ClientError> {
        if self.connected && self.last_heartbeat.elapsed() >= HEARTBEAT_INTERVAL {
            self.send_packet(&Packet::Heartbeat).await?;
            self.last_heartbeat = Instant::now();
        }
        Ok(())
    }

    /// Performs the connect handshake and returns the assigned client id
    pub async fn connect(&mut self) -> Result<PeerId, ClientError> {
        info!("Connecting to server at {}...", self.server_addr);
        self.send_packet(&Packet::Connect {
            client_version: PROTOCOL_VERSION,
        })
        .await?;

        let deadline = Instant::now() + self.request_timeout;
        while let Some(packet) = self.recv_packet(deadline).await? {
            match packet {
                Packet::Disconnected { reason } => return Err(ClientError::Refused(reason)),
                other => self.handle_packet(other),
            }
            if let Some(client_id) = self.client_id {
                self.last_heartbeat = Instant::now();
                return Ok(client_id);
            }
        }
        Err(ClientError::Timeout)
    }

    /// Sends a request and waits for its response, applying pushes meanwhile
    pub async fn request(&mut self, op_code: u16, payload: Vec<u8>) -> Result<Reply, ClientError> {
        if !self.connected {
            return Err(ClientError::NotConnected);
        }

        let request_id = self.next_request_id;
        self.next_request_id = self.next_request_id.wrapping_add(1);
        self.send_packet(&Packet::Request {
            request_id,
            op_code,
            payload,
        })
        .await?;

        let deadline = Instant::now() + self.request_timeout;
        while let Some(packet) = self.recv_packet(deadline).await? {
            match packet {
                Packet::Response {
                    request_id: id,
                    status,
                    message,
                    payload,
                } if id == request_id => {
                    return Ok(Reply {
                        status,
                        message,
                        payload,
                    });
                }
                other => self.handle_packet(other),
            }
            if !self.connected {
                return Err(ClientError::NotConnected);
            }
        }
        Err(ClientError::Timeout)
    }

    /// Logs in as `user_id`; the snapshot push arrives before the reply
    pub async fn login(&mut self, user_id: &str) -> Result<Reply, ClientError> {
        self.user_id = Some(user_id.to_string());
        let reply = self
            .request(op_codes::LOGIN, codec::to_bytes(&user_id.to_string()))
            .await?;
        if reply.is_success() {
            info!("Logged in as {}", user_id);
        } else {
            warn!("Login refused: {:?} {:?}", reply.status, reply.message);
        }
        Ok(reply)
    }

    /// Sends the request for `action` and waits for the reply
    pub async fn perform(&mut self, action: &Action) -> Result<Reply, ClientError> {
        let (op_code, payload) = action.request();
        let reply = self.request(op_code, payload).await?;
        info!("{:?} -> {:?} {}", action, reply.status, reply.message.as_deref().unwrap_or(""));
        Ok(reply)
    }

    /// Asks for a full snapshot and replaces the mirror with it
    pub async fn resync(&mut self) -> Result<Reply, ClientError> {
        let reply = self.request(op_codes::GET_PROFILE, Vec::new()).await?;
        if reply.is_success() {
            let owner = self.user_id.clone().unwrap_or_default();
            if let Err(e) = self.mirror.apply_snapshot(&owner, &reply.payload) {
                error!("Resync snapshot did not apply: {}", e);
            }
        }
        Ok(reply)
    }

    /// Processes pushes and sends heartbeats for `duration`
    pub async fn poll(&mut self, duration: Duration) -> Result<(), ClientError> {
        let deadline = Instant::now() + duration;
        loop {
            self.heartbeat_if_due().await?;
            let wake = if self.connected {
                (self.last_heartbeat + HEARTBEAT_INTERVAL).min(deadline)
            } else {
                deadline
            };
            match self.recv_packet(wake).await? {
                Some(packet) => self.handle_packet(packet),
                None if Instant::now() >= deadline => return Ok(()),
                None => {}
            }
        }
    }

    /// Polls until `condition` holds for the mirror or `duration` passes
    pub async fn wait_for(
        &mut self,
        duration: Duration,
        condition: impl Fn(&ProfileMirror) -> bool,
    ) -> Result<bool, ClientError> {
        let deadline = Instant::now() + duration;
        while !condition(&self.mirror) {
            match self.recv_packet(deadline).await? {
                Some(packet) => self.handle_packet(packet),
                None => return Ok(false),
            }
        }
        Ok(true)
    }

    /// Tells the server the client is leaving
    pub async fn disconnect(&mut self) -> Result<(), ClientError> {
        if self.connected {
            self.send_packet(&Packet::Disconnect).await?;
            self.connected = false;
            self.client_id = None;
            info!("Disconnected from server");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::{Decode, Reader};

    #[test]
    fn test_action_payloads() {
        let (op_code, payload) = Action::SpendGold(30).request();
        assert_eq!(op_code, op_codes::SPEND_GOLD);
        assert_eq!(codec::from_bytes::<i64>(&payload).unwrap(), 30);

        let (op_code, payload) = Action::GrantItem {
            target: "eve".into(),
            item: "crown".into(),
        }
        .request();
        assert_eq!(op_code, op_codes::ADMIN_GRANT_ITEM);

        let mut reader = Reader::new(&payload);
        assert_eq!(String::decode(&mut reader).unwrap(), "eve");
        assert_eq!(String::decode(&mut reader).unwrap(), "crown");
        assert!(reader.finish().is_ok());
    }

    #[tokio::test]
    async fn test_request_requires_connection() {
        let mut client = Client::new("127.0.0.1:9").await.unwrap();
        assert!(matches!(
            client.request(op_codes::GET_PROFILE, Vec::new()).await,
            Err(ClientError::NotConnected)
        ));
    }

    #[tokio::test]
    async fn test_connect_times_out_without_server() {
        let silent = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = silent.local_addr().unwrap().to_string();

        let mut client = Client::new(&addr)
            .await
            .unwrap()
            .with_request_timeout(Duration::from_millis(50));
        assert!(matches!(client.connect().await, Err(ClientError::Timeout)));
    }

    #[test]
    fn test_invalid_address() {
        let result = tokio_test::block_on(Client::new("not-an-address"));
        assert!(matches!(result, Err(ClientError::Address(_))));
    }
}
