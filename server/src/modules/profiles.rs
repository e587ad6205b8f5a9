//! Active player profiles and their two flush pipelines
//!
//! # Lifecycle
//!
//! A profile becomes active when its owner logs in: it is reused if still in
//! memory, otherwise restored from the [`ProfileStore`] (or created with
//! default values). The owner receives a full snapshot right away. On logout
//! the peer association is dropped and an unload timer starts; a login
//! within that grace period cancels the timer and keeps the in-memory
//! profile, dirty state included. A logout that lands while the profile is
//! still being read from the store is remembered, and the loaded profile
//! starts its grace period right away. When the timer expires the profile is
//! saved one last time, its pipelines are cancelled and it is evicted. The
//! profile stays locked from the final snapshot until eviction, and mutations
//! that were waiting on it then find it inactive.
//!
//! Store writes of one profile never overlap: each one takes the profile's
//! save gate before cutting its snapshot, so they land in cut order.
//!
//! # Pipelines
//!
//! Every mutation made through [`ProfilesModule::mutate`] arms two debounced
//! pipelines through the [`DebounceScheduler`]:
//!
//! - **Push** sends the accumulated delta to the owner's peer and clears it.
//!   Deltas for a peer that is gone are dropped; the next login sends a full
//!   snapshot instead.
//! - **Persist** writes a full snapshot to the store. A failed write is
//!   logged and Persist is armed again.
//!
//! The flush loop receives expired timers, returns their slot to idle and
//! runs each flush on its own task, so a slow store never delays pushes.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use log::{debug, error, info, warn};
use shared::{op_codes, player, DecodeError, DeliveryMethod, PeerId, Profile, SchemaMode};
use thiserror::Error;
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tokio::task::JoinHandle;

use crate::modules::auth::{self, AuthEvent, AuthModule};
use crate::registry::{Dependency, DependencyError, InitContext, Module};
use crate::router::{HandlerError, HandlerResult, Request};
use crate::scheduler::{DebounceScheduler, Delays, FlushRequest, Pipeline};
use crate::store::{ProfileStore, StoreError};
use crate::transport::PeerTransport;

pub type ProfileHandle = Arc<AsyncMutex<Profile>>;

type SaveGate = Arc<AsyncMutex<()>>;

#[derive(Debug, Error)]
pub enum ProfilesError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("stored profile of {owner_id} does not decode: {source}")]
    Decode {
        owner_id: String,
        #[source]
        source: DecodeError,
    },
}

/// Timing and schema settings of the profiles module
#[derive(Debug, Clone, Copy)]
pub struct ProfilesConfig {
    /// Delay between the first change and the push to the peer
    pub push_delay: Duration,
    /// Delay between the first change and the save to the store
    pub save_delay: Duration,
    /// Grace period between logout and eviction
    pub unload_delay: Duration,
    pub schema_mode: SchemaMode,
}

impl Default for ProfilesConfig {
    fn default() -> Self {
        Self {
            push_delay: Duration::from_millis(100),
            save_delay: Duration::from_secs(5),
            unload_delay: Duration::from_secs(10),
            schema_mode: SchemaMode::Strict,
        }
    }
}

struct ActiveProfile {
    profile: ProfileHandle,
    saving: SaveGate,
    peer: Option<PeerId>,
    unload: Option<JoinHandle<()>>,
}

/// A login that is reading its profile from the store
struct PendingRestore {
    owner_id: String,
    logged_out: bool,
}

/// Owns every active profile and drives its push and persist pipelines
pub struct ProfilesModule {
    config: ProfilesConfig,
    store: Arc<dyn ProfileStore>,
    transport: Arc<dyn PeerTransport>,
    // lock order: `active` before `restoring`
    active: Mutex<HashMap<String, ActiveProfile>>,
    restoring: Mutex<HashMap<u64, PendingRestore>>,
    next_restore: AtomicU64,
    scheduler: DebounceScheduler<String>,
    flush_rx: Mutex<Option<mpsc::UnboundedReceiver<FlushRequest<String>>>>,
    me: Weak<ProfilesModule>,
}

impl ProfilesModule {
    pub fn new(
        config: ProfilesConfig,
        store: Arc<dyn ProfileStore>,
        transport: Arc<dyn PeerTransport>,
    ) -> Arc<Self> {
        let (scheduler, flush_rx) = DebounceScheduler::new(Delays {
            persist: config.save_delay,
            push: config.push_delay,
        });

        Arc::new_cyclic(|me| Self {
            config,
            store,
            transport,
            active: Mutex::new(HashMap::new()),
            restoring: Mutex::new(HashMap::new()),
            next_restore: AtomicU64::new(0),
            scheduler,
            flush_rx: Mutex::new(Some(flush_rx)),
            me: me.clone(),
        })
    }

    /// Settings the module was built with
    pub fn config(&self) -> &ProfilesConfig {
        &self.config
    }

    /// The in-memory profile of `owner_id`, if it is active
    ///
    /// Callers that mutate through the handle bypass both pipelines; use
    /// [`ProfilesModule::mutate`] instead.
    pub fn handle(&self, owner_id: &str) -> Option<ProfileHandle> {
        self.table()
            .get(owner_id)
            .map(|entry| Arc::clone(&entry.profile))
    }

    /// Whether `owner_id` has a profile in memory, logged in or not
    pub fn is_active(&self, owner_id: &str) -> bool {
        self.table().contains_key(owner_id)
    }

    /// Peer the profile of `owner_id` is pushed to; None while logged out
    pub fn peer_of(&self, owner_id: &str) -> Option<PeerId> {
        self.table().get(owner_id).and_then(|entry| entry.peer)
    }

    /// Number of profiles in memory
    pub fn active_count(&self) -> usize {
        self.table().len()
    }

    /// Whether `pipeline` has a flush pending for `owner_id`
    pub fn is_armed(&self, owner_id: &str, pipeline: Pipeline) -> bool {
        self.scheduler.is_armed(&owner_id.to_string(), pipeline)
    }

    fn table(&self) -> std::sync::MutexGuard<'_, HashMap<String, ActiveProfile>> {
        self.active.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn pending(&self) -> std::sync::MutexGuard<'_, HashMap<u64, PendingRestore>> {
        self.restoring.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn entry(&self, owner_id: &str) -> Option<(ProfileHandle, SaveGate)> {
        self.table()
            .get(owner_id)
            .map(|entry| (Arc::clone(&entry.profile), Arc::clone(&entry.saving)))
    }

    /// Whether `handle` is still the active profile of `owner_id`
    fn is_current(&self, owner_id: &str, handle: &ProfileHandle) -> bool {
        self.table()
            .get(owner_id)
            .is_some_and(|entry| Arc::ptr_eq(&entry.profile, handle))
    }

    /// Activates the profile of `owner_id` for `peer` and sends it a snapshot
    pub async fn login(&self, owner_id: &str, peer: PeerId) -> Result<ProfileHandle, ProfilesError> {
        if let Some(handle) = self.attach(owner_id, peer) {
            info!("Reusing in-memory profile of {} for peer {}", owner_id, peer);
            self.send_snapshot(owner_id, peer, &handle).await;
            return Ok(handle);
        }

        let attempt = self.begin_restore(owner_id);
        let (profile, fresh) = match self.restore(owner_id).await {
            Ok(restored) => restored,
            Err(err) => {
                self.pending().remove(&attempt);
                return Err(err);
            }
        };

        let (handle, logged_out) = self.insert_restored(owner_id, peer, profile, attempt);
        if fresh {
            self.scheduler.trigger(&owner_id.to_string(), Pipeline::Persist);
        }
        if logged_out {
            info!("{} logged out while the profile was loading", owner_id);
            return Ok(handle);
        }

        self.send_snapshot(owner_id, peer, &handle).await;
        Ok(handle)
    }

    fn begin_restore(&self, owner_id: &str) -> u64 {
        let attempt = self.next_restore.fetch_add(1, Ordering::Relaxed);
        self.pending().insert(
            attempt,
            PendingRestore {
                owner_id: owner_id.to_string(),
                logged_out: false,
            },
        );
        attempt
    }

    /// Reuses an active profile, cancelling a pending unload
    fn attach(&self, owner_id: &str, peer: PeerId) -> Option<ProfileHandle> {
        let mut table = self.table();
        let entry = table.get_mut(owner_id)?;
        if let Some(unload) = entry.unload.take() {
            unload.abort();
            debug!("Cancelled unload of {}", owner_id);
        }
        entry.peer = Some(peer);
        Some(Arc::clone(&entry.profile))
    }

    async fn restore(&self, owner_id: &str) -> Result<(Profile, bool), ProfilesError> {
        let mut profile = player::new_profile(owner_id);
        match self.store.restore(owner_id).await? {
            Some(snapshot) => {
                profile
                    .restore_full(&snapshot, self.config.schema_mode)
                    .map_err(|source| ProfilesError::Decode {
                        owner_id: owner_id.to_string(),
                        source,
                    })?;
                info!("Restored profile of {} ({} bytes)", owner_id, snapshot.len());
                Ok((profile, false))
            }
            None => {
                info!("Created profile for {}", owner_id);
                Ok((profile, true))
            }
        }
    }

    /// Activates a restored profile; also reports whether its login already ended
    fn insert_restored(
        &self,
        owner_id: &str,
        peer: PeerId,
        profile: Profile,
        attempt: u64,
    ) -> (ProfileHandle, bool) {
        let mut table = self.table();
        let logged_out = self
            .pending()
            .remove(&attempt)
            .is_some_and(|pending| pending.logged_out);

        // another login may have activated it while the store was read
        if let Some(entry) = table.get_mut(owner_id) {
            if !logged_out {
                if let Some(unload) = entry.unload.take() {
                    unload.abort();
                }
                entry.peer = Some(peer);
            }
            return (Arc::clone(&entry.profile), logged_out);
        }

        let handle = Arc::new(AsyncMutex::new(profile));
        let unload = logged_out.then(|| self.spawn_unload(owner_id.to_string()));
        table.insert(
            owner_id.to_string(),
            ActiveProfile {
                profile: Arc::clone(&handle),
                saving: Arc::new(AsyncMutex::new(())),
                peer: (!logged_out).then_some(peer),
                unload,
            },
        );
        (handle, logged_out)
    }

    /// Sends a full snapshot, which supersedes any pending delta
    async fn send_snapshot(&self, owner_id: &str, peer: PeerId, handle: &ProfileHandle) {
        let mut profile = handle.lock().await;
        let snapshot = profile.serialize_full();
        profile.clear_updates();

        // sent under the lock so snapshots and deltas reach the peer in cut order
        if let Err(err) = self
            .transport
            .send(peer, op_codes::PROFILE_SNAPSHOT, snapshot, DeliveryMethod::Reliable)
            .await
        {
            warn!("Snapshot of {} to peer {} not sent: {}", owner_id, peer, err);
        }
    }

    /// Full snapshot for a client-requested resync
    pub async fn snapshot(&self, owner_id: &str) -> Option<Vec<u8>> {
        let handle = self.handle(owner_id)?;
        let mut profile = handle.lock().await;
        let snapshot = profile.serialize_full();
        profile.clear_updates();
        Some(snapshot)
    }

    /// Drops the peer association and starts the unload timer
    pub fn logout(&self, owner_id: &str) {
        let mut table = self.table();
        let Some(entry) = table.get_mut(owner_id) else {
            // a login may still be reading the profile from the store
            for pending in self.pending().values_mut() {
                if pending.owner_id == owner_id {
                    pending.logged_out = true;
                }
            }
            return;
        };

        entry.peer = None;
        if let Some(previous) = entry.unload.take() {
            previous.abort();
        }
        entry.unload = Some(self.spawn_unload(owner_id.to_string()));
        debug!(
            "{} logged out, unloading in {:?}",
            owner_id, self.config.unload_delay
        );
    }

    fn spawn_unload(&self, owner_id: String) -> JoinHandle<()> {
        let me = self.me.clone();
        let delay = self.config.unload_delay;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(module) = me.upgrade() {
                module.unload(&owner_id).await;
            }
        })
    }

    /// Saves and evicts a profile whose owner did not come back
    async fn unload(&self, owner_id: &str) {
        let Some((handle, saving)) = self.entry(owner_id) else {
            return;
        };

        let _saving = saving.lock().await;
        // held until eviction so nothing changes after the final snapshot
        let profile = handle.lock().await;
        let snapshot = profile.serialize_full();
        if let Err(err) = self.store.insert_or_update(owner_id, &snapshot).await {
            error!(
                "Final save of {} failed, keeping it loaded: {}",
                owner_id, err
            );
            let mut table = self.table();
            if let Some(entry) = table.get_mut(owner_id) {
                if entry.peer.is_none() {
                    entry.unload = Some(self.spawn_unload(owner_id.to_string()));
                }
            }
            return;
        }

        {
            let mut table = self.table();
            match table.get(owner_id) {
                Some(entry) if entry.peer.is_none() && Arc::ptr_eq(&entry.profile, &handle) => {
                    table.remove(owner_id);
                }
                _ => {
                    debug!("{} came back during the final save", owner_id);
                    return;
                }
            }
        }

        drop(profile);
        self.scheduler.cancel(&owner_id.to_string());
        info!("Unloaded profile of {}", owner_id);
    }

    /// Runs `f` against the active profile of `owner_id` and arms both pipelines
    ///
    /// Returns None when the profile is not active, including when it was
    /// evicted while this call waited for it.
    pub async fn mutate<R>(&self, owner_id: &str, f: impl FnOnce(&mut Profile) -> R) -> Option<R> {
        let handle = self.handle(owner_id)?;
        let mut profile = handle.lock().await;
        if !self.is_current(owner_id, &handle) {
            return None;
        }
        let result = f(&mut profile);

        if profile.has_updates() {
            let owner = owner_id.to_string();
            self.scheduler.trigger(&owner, Pipeline::Push);
            self.scheduler.trigger(&owner, Pipeline::Persist);
        }
        Some(result)
    }

    /// Mutates the profile of the requesting session
    pub async fn mutate_for<R>(
        &self,
        request: &Request,
        f: impl FnOnce(&mut Profile) -> Result<R, HandlerError>,
    ) -> Result<R, HandlerError> {
        let session = auth::session(request)?;
        self.mutate(&session.user_id, f)
            .await
            .unwrap_or_else(|| Err(HandlerError::NotFound("profile is not loaded".to_string())))
    }

    /// Saves every active profile; returns how many saves failed
    pub async fn save_all(&self) -> usize {
        let entries: Vec<(String, ProfileHandle, SaveGate)> = self
            .table()
            .iter()
            .map(|(owner, entry)| {
                (
                    owner.clone(),
                    Arc::clone(&entry.profile),
                    Arc::clone(&entry.saving),
                )
            })
            .collect();

        let mut failures = 0;
        for (owner_id, handle, saving) in entries {
            let _saving = saving.lock().await;
            let snapshot = handle.lock().await.serialize_full();
            if let Err(err) = self.store.insert_or_update(&owner_id, &snapshot).await {
                error!("Saving {} failed: {}", owner_id, err);
                failures += 1;
            }
        }
        info!("Saved active profiles, {} failures", failures);
        failures
    }

    fn spawn_flush_loop(&self) {
        let Some(mut flush_rx) = self
            .flush_rx
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        else {
            warn!("Flush loop already running");
            return;
        };

        let me = self.me.clone();
        tokio::spawn(async move {
            while let Some(request) = flush_rx.recv().await {
                let Some(module) = me.upgrade() else {
                    break;
                };
                if !module.scheduler.fire(&request) {
                    continue;
                }
                tokio::spawn(async move {
                    match request.pipeline {
                        Pipeline::Push => module.flush_push(&request.owner).await,
                        Pipeline::Persist => module.flush_persist(&request.owner).await,
                    }
                });
            }
            debug!("Flush loop stopped");
        });
    }

    async fn flush_push(&self, owner_id: &str) {
        let (handle, peer) = {
            let table = self.table();
            let Some(entry) = table.get(owner_id) else {
                return;
            };
            (Arc::clone(&entry.profile), entry.peer)
        };

        let mut profile = handle.lock().await;
        if !profile.has_updates() {
            return;
        }
        let updates = profile.get_updates();
        profile.clear_updates();

        let Some(peer) = peer else {
            debug!("push: {} has no peer, dropping {} bytes", owner_id, updates.len());
            return;
        };
        if !self.transport.is_connected(peer).await {
            debug!("push: peer {} of {} is gone, dropping update", peer, owner_id);
            return;
        }

        debug!("push: {} bytes to {} (peer {})", updates.len(), owner_id, peer);
        if let Err(err) = self
            .transport
            .send(peer, op_codes::PROFILE_UPDATE, updates, DeliveryMethod::Reliable)
            .await
        {
            warn!("push: update of {} to peer {} lost: {}", owner_id, peer, err);
        }
    }

    async fn flush_persist(&self, owner_id: &str) {
        let Some((handle, saving)) = self.entry(owner_id) else {
            return;
        };
        let _saving = saving.lock().await;
        if !self.is_current(owner_id, &handle) {
            return;
        }
        let snapshot = handle.lock().await.serialize_full();

        match self.store.insert_or_update(owner_id, &snapshot).await {
            Ok(()) => debug!("persist: saved {} ({} bytes)", owner_id, snapshot.len()),
            Err(err) => {
                error!("persist: saving {} failed, retrying: {}", owner_id, err);
                if self.is_active(owner_id) {
                    self.scheduler.trigger(&owner_id.to_string(), Pipeline::Persist);
                }
            }
        }
    }

    async fn on_auth_event(&self, event: AuthEvent) {
        match event {
            // profiles load through the login hook
            AuthEvent::Login { .. } => {}
            AuthEvent::Logout { user_id, .. } => self.logout(&user_id),
        }
    }

    async fn on_login(&self, peer: PeerId, user_id: String) -> Result<(), HandlerError> {
        match self.login(&user_id, peer).await {
            Ok(_) => Ok(()),
            Err(err) => {
                error!("Loading profile of {} failed: {}", user_id, err);
                Err(HandlerError::Internal(err.to_string()))
            }
        }
    }

    async fn handle_get_profile(self: Arc<Self>, request: Request) -> HandlerResult {
        let session = auth::session(&request)?;
        self.snapshot(&session.user_id)
            .await
            .ok_or_else(|| HandlerError::NotFound("profile is not loaded".to_string()))
    }
}

impl Module for ProfilesModule {
    fn name(&self) -> &'static str {
        "profiles"
    }

    fn dependencies(&self) -> Vec<Dependency> {
        vec![Dependency::required::<AuthModule>()]
    }

    fn initialize(self: Arc<Self>, ctx: &mut InitContext<'_>) -> Result<(), DependencyError> {
        let auth = ctx.require::<AuthModule>()?;

        let me = Arc::downgrade(&self);
        auth.add_login_hook(move |peer, user_id| {
            let me = me.clone();
            async move {
                match me.upgrade() {
                    Some(module) => module.on_login(peer, user_id).await,
                    None => Err(HandlerError::Internal("profiles module is gone".to_string())),
                }
            }
        });

        let me = Arc::downgrade(&self);
        auth.events().subscribe(move |event| {
            let me = me.clone();
            async move {
                if let Some(module) = me.upgrade() {
                    module.on_auth_event(event).await;
                }
            }
        });

        let module = Arc::clone(&self);
        ctx.router()
            .register_handler(op_codes::GET_PROFILE, move |request| {
                Arc::clone(&module).handle_get_profile(request)
            });

        self.spawn_flush_loop();
        Ok(())
    }
}
