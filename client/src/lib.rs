//! # Profile Client Library
//!
//! This library provides a headless client for the profile server. It
//! connects over UDP, logs in, sends gameplay requests and keeps a local
//! mirror of the player's profile up to date from the server's pushes.
//!
//! ## Architecture Overview
//!
//! ### Snapshot Then Deltas
//! After login the server sends one full snapshot of the profile. Every later
//! change arrives as an incremental update containing only the properties
//! that changed, and list changes as a short log of operations. The
//! [`mirror::ProfileMirror`] applies both in arrival order.
//!
//! ### Request/Response
//! Each request carries an ID and is answered by exactly one response with a
//! status code. Pushes that arrive while a response is awaited are applied to
//! the mirror before the response is returned.
//!
//! ## Module Organization
//!
//! ### Mirror Module (`mirror`)
//! The client-side copy of the profile and the snapshot/update handling.
//!
//! ### Network Module (`network`)
//! Manages all client-server communication:
//! - UDP socket management and connection handling
//! - Packet serialization and deserialization
//! - Request IDs and response matching
//! - Heartbeats while idle
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use client::network::{Action, Client};
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut client = Client::new("127.0.0.1:8080").await?;
//!     client.connect().await?;
//!     client.login("alice").await?;
//!
//!     client.perform(&Action::AddItem("torch".into())).await?;
//!
//!     // Give the server's push window time to deliver the change
//!     client.poll(Duration::from_millis(300)).await?;
//!     println!("{}", client.mirror().summary());
//!
//!     client.disconnect().await?;
//!     Ok(())
//! }
//! ```

pub mod mirror;
pub mod network;
