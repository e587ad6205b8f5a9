//! Pipeline tests for the assembled server modules
//!
//! These tests build the full module graph around an in-process transport
//! and a store that can be made to fail, then drive it through the router
//! on a paused clock.

use async_trait::async_trait;
use clap::Parser;
use server::extensions::Extensions;
use server::router::Request;
use server::scheduler::Pipeline;
use server::store::{MemoryStore, ProfileStore, StoreError};
use server::transport::{PeerTransport, TransportError};
use server::{build_services, config::ServerConfig, Services};
use shared::{codec, op_codes, player, DeliveryMethod, PeerId, Profile, SchemaMode, Status};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Store that fails a configurable number of writes before working again
#[derive(Default)]
struct FlakyStore {
    inner: MemoryStore,
    failures_left: AtomicUsize,
    attempts: AtomicUsize,
    unreadable: AtomicBool,
}

impl FlakyStore {
    fn failing(times: usize) -> Arc<Self> {
        let store = FlakyStore::default();
        store.failures_left.store(times, Ordering::SeqCst);
        Arc::new(store)
    }

    fn unreadable() -> Arc<Self> {
        let store = FlakyStore::default();
        store.unreadable.store(true, Ordering::SeqCst);
        Arc::new(store)
    }

    fn heal(&self) {
        self.failures_left.store(0, Ordering::SeqCst);
        self.unreadable.store(false, Ordering::SeqCst);
    }

    fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ProfileStore for FlakyStore {
    async fn restore(&self, owner_id: &str) -> Result<Option<Vec<u8>>, StoreError> {
        if self.unreadable.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("disk is on fire".to_string()));
        }
        self.inner.restore(owner_id).await
    }

    async fn insert_or_update(&self, owner_id: &str, snapshot: &[u8]) -> Result<(), StoreError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let failing = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if failing {
            return Err(StoreError::Unavailable("disk is on fire".to_string()));
        }
        self.inner.insert_or_update(owner_id, snapshot).await
    }
}

/// Transport that records what would have been sent
#[derive(Default)]
struct LoopbackTransport {
    connected: Mutex<HashSet<PeerId>>,
    sent: Mutex<Vec<(PeerId, u16, Vec<u8>)>>,
}

impl LoopbackTransport {
    fn connect(&self, peer: PeerId) {
        self.connected.lock().unwrap().insert(peer);
    }

    fn drop_peer(&self, peer: PeerId) {
        self.connected.lock().unwrap().remove(&peer);
    }

    fn sent_to(&self, peer: PeerId, op_code: u16) -> Vec<Vec<u8>> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .filter(|(to, op, _)| *to == peer && *op == op_code)
            .map(|(_, _, payload)| payload.clone())
            .collect()
    }
}

#[async_trait]
impl PeerTransport for LoopbackTransport {
    async fn send(
        &self,
        peer: PeerId,
        op_code: u16,
        payload: Vec<u8>,
        _delivery: DeliveryMethod,
    ) -> Result<(), TransportError> {
        if !self.connected.lock().unwrap().contains(&peer) {
            return Err(TransportError::NotConnected(peer));
        }
        self.sent.lock().unwrap().push((peer, op_code, payload));
        Ok(())
    }

    async fn is_connected(&self, peer: PeerId) -> bool {
        self.connected.lock().unwrap().contains(&peer)
    }
}

struct Harness {
    services: Services,
    transport: Arc<LoopbackTransport>,
}

impl Harness {
    fn new(store: Arc<dyn ProfileStore>) -> Self {
        let config = ServerConfig::parse_from([
            "server",
            "--push-delay-ms",
            "100",
            "--save-delay-ms",
            "500",
            "--unload-delay-ms",
            "2000",
            "--admin",
            "root",
        ]);
        let transport = Arc::new(LoopbackTransport::default());
        let services = build_services(&config, store, transport.clone()).unwrap();
        Harness {
            services,
            transport,
        }
    }

    /// A connected peer with its own extension table
    fn peer(&self, peer: PeerId) -> Peer {
        self.transport.connect(peer);
        Peer {
            id: peer,
            extensions: Arc::new(Extensions::new()),
        }
    }

    async fn call(&self, peer: &Peer, op_code: u16, payload: Vec<u8>) -> (Status, Vec<u8>) {
        let response = self
            .services
            .router
            .dispatch(Request::new(
                peer.id,
                op_code,
                payload,
                Arc::clone(&peer.extensions),
            ))
            .await;
        (response.status, response.payload)
    }

    async fn login(&self, peer: &Peer, user: &str) {
        let (status, _) = self
            .call(peer, op_codes::LOGIN, codec::to_bytes(&user.to_string()))
            .await;
        assert_eq!(status, Status::Success);
    }
}

struct Peer {
    id: PeerId,
    extensions: Arc<Extensions>,
}

/// Rebuilds what a client would see from everything sent to `peer`
fn mirror_of(transport: &LoopbackTransport, peer: PeerId, owner: &str) -> Profile {
    let sent = transport.sent.lock().unwrap().clone();
    let mut mirror = player::new_profile(owner);
    for (to, op_code, payload) in sent {
        if to != peer {
            continue;
        }
        match op_code {
            op_codes::PROFILE_SNAPSHOT => mirror.restore_full(&payload, SchemaMode::Strict).unwrap(),
            op_codes::PROFILE_UPDATE => mirror.apply_updates(&payload).unwrap(),
            _ => {}
        }
    }
    mirror
}

/// MODULE GRAPH TESTS
mod graph_tests {
    use super::*;

    /// Tests that every module initializes, dependencies first
    #[tokio::test(start_paused = true)]
    async fn modules_initialize_in_dependency_order() {
        let harness = Harness::new(Arc::new(MemoryStore::new()));
        let report = &harness.services.report;

        assert!(report.is_ok());
        let position = |name: &str| report.order.iter().position(|m| *m == name).unwrap();
        assert!(position("auth") < position("profiles"));
        assert!(position("profiles") < position("inventory"));
        assert!(position("inventory") < position("admin"));
        assert_eq!(harness.services.registry.len(), 4);
    }

    /// Tests the status code contract of the router
    #[tokio::test(start_paused = true)]
    async fn status_codes() {
        let harness = Harness::new(Arc::new(MemoryStore::new()));
        let peer = harness.peer(1);

        let (status, _) = harness.call(&peer, 999, Vec::new()).await;
        assert_eq!(status, Status::Default);

        let (status, _) = harness
            .call(&peer, op_codes::ADD_ITEM, codec::to_bytes(&"torch".to_string()))
            .await;
        assert_eq!(status, Status::Unauthorized);

        let (status, _) = harness
            .call(&peer, op_codes::LOGIN, codec::to_bytes(&"no spaces".to_string()))
            .await;
        assert_eq!(status, Status::Failed);

        harness.login(&peer, "alice").await;

        let (status, _) = harness.call(&peer, op_codes::ADD_ITEM, vec![0, 0]).await;
        assert_eq!(status, Status::Failed);

        let (status, payload) = harness
            .call(&peer, op_codes::ADD_ITEM, codec::to_bytes(&"torch".to_string()))
            .await;
        assert_eq!(status, Status::Success);
        assert_eq!(codec::from_bytes::<i32>(&payload).unwrap(), 1);

        let (status, _) = harness
            .call(&peer, op_codes::REMOVE_ITEM, codec::to_bytes(&"lamp".to_string()))
            .await;
        assert_eq!(status, Status::Default);

        let (status, _) = harness
            .call(&peer, op_codes::GAIN_EXPERIENCE, codec::to_bytes(&i64::MAX))
            .await;
        assert_eq!(status, Status::Failed);
    }

    /// Tests that a login whose profile cannot be loaded is refused and undone
    #[tokio::test(start_paused = true)]
    async fn login_fails_when_profile_cannot_load() {
        let store = FlakyStore::unreadable();
        let harness = Harness::new(store.clone());
        let peer = harness.peer(1);

        let (status, _) = harness
            .call(&peer, op_codes::LOGIN, codec::to_bytes(&"alice".to_string()))
            .await;
        assert_eq!(status, Status::Error);
        assert_eq!(harness.services.auth.session_count(), 0);
        assert!(!harness.services.profiles.is_active("alice"));
        assert!(harness.transport.sent_to(1, op_codes::PROFILE_SNAPSHOT).is_empty());

        let (status, _) = harness
            .call(&peer, op_codes::ADD_ITEM, codec::to_bytes(&"torch".to_string()))
            .await;
        assert_eq!(status, Status::Unauthorized);

        store.heal();
        harness.login(&peer, "alice").await;
        assert!(harness.services.profiles.is_active("alice"));
        assert_eq!(harness.transport.sent_to(1, op_codes::PROFILE_SNAPSHOT).len(), 1);
    }
}

/// SYNC PIPELINE TESTS
mod push_tests {
    use super::*;

    /// Tests that a burst of requests produces a single update
    #[tokio::test(start_paused = true)]
    async fn burst_is_pushed_once() {
        let harness = Harness::new(Arc::new(MemoryStore::new()));
        let peer = harness.peer(1);
        harness.login(&peer, "alice").await;

        for item in ["torch", "rope", "map"] {
            harness
                .call(&peer, op_codes::ADD_ITEM, codec::to_bytes(&item.to_string()))
                .await;
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        harness
            .call(&peer, op_codes::SPEND_GOLD, codec::to_bytes(&25i64))
            .await;
        tokio::time::sleep(Duration::from_millis(300)).await;

        assert_eq!(harness.transport.sent_to(1, op_codes::PROFILE_UPDATE).len(), 1);

        let handle = harness.services.profiles.handle("alice").unwrap();
        assert_eq!(mirror_of(&harness.transport, 1, "alice"), *handle.lock().await);
    }

    /// Tests that a resync snapshot supersedes the pending delta
    #[tokio::test(start_paused = true)]
    async fn snapshot_clears_pending_delta() {
        let harness = Harness::new(Arc::new(MemoryStore::new()));
        let peer = harness.peer(1);
        harness.login(&peer, "alice").await;

        harness
            .call(&peer, op_codes::ADD_ITEM, codec::to_bytes(&"torch".to_string()))
            .await;
        let (status, snapshot) = harness.call(&peer, op_codes::GET_PROFILE, Vec::new()).await;
        assert_eq!(status, Status::Success);
        tokio::time::sleep(Duration::from_millis(300)).await;

        assert!(harness.transport.sent_to(1, op_codes::PROFILE_UPDATE).is_empty());

        let mut mirror = player::new_profile("alice");
        mirror.restore_full(&snapshot, SchemaMode::Strict).unwrap();
        assert_eq!(
            mirror.list::<String>(player::INVENTORY).unwrap(),
            &["torch".to_string()]
        );
    }

    /// Tests that changes made while the owner is away arrive in the next snapshot
    #[tokio::test(start_paused = true)]
    async fn changes_while_offline_arrive_by_snapshot() {
        let harness = Harness::new(Arc::new(MemoryStore::new()));
        let admin = harness.peer(1);
        let bob = harness.peer(2);
        harness.login(&admin, "root").await;
        harness.login(&bob, "bob").await;

        harness.services.auth.disconnect(bob.id).await;
        harness.transport.drop_peer(bob.id);

        let mut grant = shared::Writer::new();
        shared::Encode::encode(&"bob".to_string(), &mut grant);
        shared::Encode::encode(&75i64, &mut grant);
        let (status, _) = harness
            .call(&admin, op_codes::ADMIN_GRANT_GOLD, grant.into_vec())
            .await;
        assert_eq!(status, Status::Success);
        tokio::time::sleep(Duration::from_millis(300)).await;

        let bob = harness.peer(3);
        harness.login(&bob, "bob").await;

        let mirror = mirror_of(&harness.transport, 3, "bob");
        assert_eq!(
            *mirror.value::<i64>(player::GOLD).unwrap(),
            player::STARTING_GOLD + 75
        );
    }
}

/// PERSISTENCE PIPELINE TESTS
mod persist_tests {
    use super::*;

    /// Tests that a failed save is retried until the store recovers
    #[tokio::test(start_paused = true)]
    async fn failed_saves_are_retried() {
        let store = FlakyStore::failing(2);
        let harness = Harness::new(store.clone());
        let peer = harness.peer(1);
        harness.login(&peer, "alice").await;

        tokio::time::sleep(Duration::from_millis(2_000)).await;

        assert_eq!(store.attempts(), 3);
        assert!(store.restore("alice").await.unwrap().is_some());
        assert!(!harness.services.profiles.is_armed("alice", Pipeline::Persist));
    }

    /// Tests that a profile is only evicted after its final save succeeds
    #[tokio::test(start_paused = true)]
    async fn unload_waits_for_final_save() {
        let store = FlakyStore::failing(usize::MAX);
        let harness = Harness::new(store.clone());
        let peer = harness.peer(1);
        harness.login(&peer, "alice").await;
        harness
            .call(&peer, op_codes::GAIN_EXPERIENCE, codec::to_bytes(&120i64))
            .await;

        harness.services.auth.disconnect(peer.id).await;
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(harness.services.profiles.is_active("alice"));

        store.heal();
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(!harness.services.profiles.is_active("alice"));

        let saved = store.restore("alice").await.unwrap().unwrap();
        let mut restored = player::new_profile("alice");
        restored.restore_full(&saved, SchemaMode::Strict).unwrap();
        assert_eq!(*restored.value::<i32>(player::LEVEL).unwrap(), 2);
        assert_eq!(*restored.value::<i64>(player::EXPERIENCE).unwrap(), 20);
    }

    /// Tests that logging back in during the grace period keeps the same profile
    #[tokio::test(start_paused = true)]
    async fn relogin_within_grace_reuses_profile() {
        let harness = Harness::new(Arc::new(MemoryStore::new()));
        let first = harness.peer(1);
        harness.login(&first, "alice").await;
        let before = harness.services.profiles.handle("alice").unwrap();

        harness.services.auth.disconnect(first.id).await;
        tokio::time::sleep(Duration::from_millis(1_000)).await;

        let second = harness.peer(2);
        harness.login(&second, "alice").await;
        let after = harness.services.profiles.handle("alice").unwrap();
        assert!(Arc::ptr_eq(&before, &after));

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(harness.services.profiles.is_active("alice"));
        assert_eq!(harness.services.profiles.peer_of("alice"), Some(2));
    }
}
