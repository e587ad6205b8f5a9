//! # Profile Server Library
//!
//! This library provides the authoritative server for player profiles. Game
//! logic mutates a player's profile on the server; the server keeps the
//! owning client in sync with small incremental updates and saves the
//! profile to a backing store, each on its own debounce timer.
//!
//! ## Core Responsibilities
//!
//! ### Profile Synchronization
//! Every profile is a set of keyed observable properties. Changes are
//! tracked per property and shipped as deltas, so a client that received a
//! full snapshot at login stays identical to the server without ever being
//! sent the whole profile again.
//!
//! ### Persistence
//! Full snapshots are written to a [`store::ProfileStore`] after a quiet
//! period. Failed writes are retried, and profiles are saved one last time
//! before being evicted from memory.
//!
//! ### Module Hosting
//! Features are implemented as modules that declare their dependencies on
//! each other. The [`registry`] initializes them in dependency order and the
//! [`router`] routes client requests to the handlers they register.
//!
//! ## Architecture Design
//!
//! ### Event Loop
//! The network server runs one event loop for incoming packets, client
//! timeouts and shutdown. Requests are dispatched on their own tasks and
//! answered with exactly one response each.
//!
//! ### UDP-Based Communication
//! Uses UDP sockets with a bincode-encoded [`shared::Packet`] envelope.
//! Profile payloads inside the envelope use the network-order codec from
//! [`shared::codec`].
//!
//! ### Debounced Pipelines
//! The [`scheduler`] coalesces any number of changes within a window into a
//! single push and a single save per profile. The delay counts from the first
//! change and is never extended.
//!
//! ## Module Organization
//!
//! ### Client Manager Module (`client_manager`)
//! Connection tracking, client ID assignment and timeout detection, plus
//! the per-connection [`extensions`] table.
//!
//! ### Server Modules (`modules`)
//! - `auth`: login and sessions
//! - `profiles`: active profiles, snapshots, push and persist pipelines
//! - `inventory`: gameplay requests against the caller's own profile
//! - `admin`: grants to other players, gated by access level
//!
//! ### Network Module (`network`)
//! UDP socket management, packet processing and the main loop.
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use clap::Parser;
//! use server::config::ServerConfig;
//! use server::network::Server;
//! use server::store::MemoryStore;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = ServerConfig::parse_from(["server", "--port", "8080"]);
//!     let mut server = Server::new(&config, Arc::new(MemoryStore::new())).await?;
//!
//!     // Runs until Ctrl+C, then saves every active profile
//!     server.run().await?;
//!     Ok(())
//! }
//! ```

pub mod client_manager;
pub mod config;
pub mod events;
pub mod extensions;
pub mod modules;
pub mod network;
pub mod registry;
pub mod router;
pub mod scheduler;
pub mod store;
pub mod transport;

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use log::warn;

use crate::config::ServerConfig;
use crate::modules::{AdminModule, AuthModule, InventoryModule, ProfilesModule};
use crate::registry::{DependencyError, InitReport, ModuleRegistry};
use crate::router::MessageRouter;
use crate::store::ProfileStore;
use crate::transport::PeerTransport;

pub type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send + 'static>>;

/// The initialized module graph
pub struct Services {
    pub router: Arc<MessageRouter>,
    pub registry: ModuleRegistry,
    pub auth: Arc<AuthModule>,
    pub profiles: Arc<ProfilesModule>,
    pub report: InitReport,
}

/// Composition root: builds every module around the given store and transport
///
/// Must run inside a tokio runtime. Auth and profiles are mandatory; any
/// other module that fails to initialize is logged and left out.
pub fn build_services(
    config: &ServerConfig,
    store: Arc<dyn ProfileStore>,
    transport: Arc<dyn PeerTransport>,
) -> Result<Services, DependencyError> {
    let mut registry = ModuleRegistry::new();
    registry.register(AdminModule::new());
    registry.register(InventoryModule::new());
    registry.register(ProfilesModule::new(config.profiles(), store, transport));
    registry.register(AuthModule::new(config.auth()));

    let mut router = MessageRouter::new();
    let report = registry.resolve_and_initialize(&mut router);
    for failure in &report.failures {
        warn!("Running without a module: {}", failure);
    }

    let auth = registry
        .get::<AuthModule>()
        .ok_or_else(|| mandatory_failure(&report, "auth"))?;
    let profiles = registry
        .get::<ProfilesModule>()
        .ok_or_else(|| mandatory_failure(&report, "profiles"))?;

    Ok(Services {
        router: Arc::new(router),
        registry,
        auth,
        profiles,
        report,
    })
}

fn mandatory_failure(report: &InitReport, module: &'static str) -> DependencyError {
    report
        .failures
        .iter()
        .find(|failure| failure.module() == module)
        .cloned()
        .unwrap_or(DependencyError::Initialization {
            module,
            reason: "not initialized".to_string(),
        })
}
