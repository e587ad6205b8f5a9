//! Types shared by the profile server and its clients
//!
//! The transport envelope ([`Packet`]) is serialized with bincode. Profile
//! payloads carried inside it use the network-order [`codec`] so that record
//! framing stays stable independently of the envelope format.

pub mod codec;
pub mod observable;
pub mod player;
pub mod profile;

use serde::{Deserialize, Serialize};

pub use codec::{Decode, DecodeError, Encode, Reader, Writer};
pub use observable::{ListError, ListOp, Observable, ObservableList, ObservableValue, Value};
pub use profile::{Profile, ProfileBuilder, ProfileError, SchemaMode};

pub const PROTOCOL_VERSION: u32 = 1;

/// Largest UDP payload; every packet, snapshots included, must fit in one
pub const MAX_DATAGRAM: usize = 65_507;

/// Identifier the server assigns to each connected client
pub type PeerId = u32;

/// Operation codes carried by requests and server pushes
pub mod op_codes {
    pub const LOGIN: u16 = 1;
    pub const GET_PROFILE: u16 = 2;

    /// Server push: full profile snapshot
    pub const PROFILE_SNAPSHOT: u16 = 10;
    /// Server push: incremental profile update
    pub const PROFILE_UPDATE: u16 = 11;

    pub const SET_DISPLAY_NAME: u16 = 20;
    pub const ADD_ITEM: u16 = 21;
    pub const REMOVE_ITEM: u16 = 22;
    pub const SPEND_GOLD: u16 = 23;
    pub const GAIN_EXPERIENCE: u16 = 24;

    pub const ADMIN_GRANT_GOLD: u16 = 40;
    pub const ADMIN_GRANT_ITEM: u16 = 41;
}

/// Outcome of a request, one per response
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum Status {
    Success = 0,
    Failed = 1,
    Error = 2,
    Unauthorized = 3,
    /// Nothing handled the request, or the target does not exist
    Default = 4,
}

/// Delivery guarantee requested for a server push
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeliveryMethod {
    Reliable,
    Unreliable,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub enum Packet {
    Connect {
        client_version: u32,
    },
    Heartbeat,
    Request {
        request_id: u32,
        op_code: u16,
        payload: Vec<u8>,
    },
    Disconnect,

    Connected {
        client_id: PeerId,
    },
    Response {
        request_id: u32,
        status: Status,
        message: Option<String>,
        payload: Vec<u8>,
    },
    Message {
        op_code: u16,
        delivery: DeliveryMethod,
        payload: Vec<u8>,
    },
    Disconnected {
        reason: String,
    },
}
