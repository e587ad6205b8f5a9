//! Server modules taking part in dependency resolution
//!
//! - `auth` logs peers in and tracks their sessions
//! - `profiles` keeps active profiles and runs their push/persist pipelines
//! - `inventory` handles gameplay requests against the caller's profile
//! - `admin` grants gold and items to other players

pub mod admin;
pub mod auth;
pub mod inventory;
pub mod profiles;

pub use admin::AdminModule;
pub use auth::{AccessLevel, AuthConfig, AuthEvent, AuthModule, Session};
pub use inventory::InventoryModule;
pub use profiles::{ProfileHandle, ProfilesConfig, ProfilesError, ProfilesModule};
