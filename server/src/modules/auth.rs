//! Login and session tracking
//!
//! A successful `LOGIN` attaches a [`Session`] to the connection's extension
//! table, runs every login hook and publishes [`AuthEvent::Login`]. A failing
//! hook rolls the session back and fails the login. Disconnects and timeouts
//! go through [`AuthModule::disconnect`], which drops the session and
//! publishes [`AuthEvent::Logout`].

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::{Arc, Mutex};

use log::{debug, info, warn};
use shared::{codec, op_codes, PeerId};

use crate::events::EventBus;
use crate::extensions::{ExtensionKey, ExtensionTag, Extensions};
use crate::registry::{DependencyError, InitContext, Module};
use crate::router::{HandlerError, HandlerResult, Request};
use crate::BoxFuture;

pub const SESSION: ExtensionKey<Session> = ExtensionKey::new(ExtensionTag::Session);

const MAX_USER_ID_LEN: usize = 32;

type LoginHook = Arc<dyn Fn(PeerId, String) -> BoxFuture<Result<(), HandlerError>> + Send + Sync>;

/// What a session may do; sent to the client as the LOGIN payload
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum AccessLevel {
    Player = 0,
    Admin = 1,
}

/// Identity attached to a connection after LOGIN
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub user_id: String,
    pub access_level: AccessLevel,
}

/// Published after a login completes and after a session ends
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthEvent {
    Login { peer: PeerId, user_id: String },
    Logout { peer: PeerId, user_id: String },
}

#[derive(Debug, Clone, Default)]
pub struct AuthConfig {
    /// Users granted [`AccessLevel::Admin`] on login
    pub admins: HashSet<String>,
}

struct LoggedIn {
    user_id: String,
    extensions: Arc<Extensions>,
}

pub struct AuthModule {
    config: AuthConfig,
    sessions: Mutex<HashMap<PeerId, LoggedIn>>,
    login_hooks: Mutex<Vec<LoginHook>>,
    events: EventBus<AuthEvent>,
}

impl AuthModule {
    pub fn new(config: AuthConfig) -> Arc<Self> {
        Arc::new(Self {
            config,
            sessions: Mutex::new(HashMap::new()),
            login_hooks: Mutex::new(Vec::new()),
            events: EventBus::new(),
        })
    }

    /// Login and logout notifications
    pub fn events(&self) -> &EventBus<AuthEvent> {
        &self.events
    }

    /// Adds a step every login must pass before it succeeds
    ///
    /// Hooks run in registration order once the session exists. The first
    /// error rolls the session back and becomes the LOGIN response.
    pub fn add_login_hook<F, Fut>(&self, hook: F)
    where
        F: Fn(PeerId, String) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
    {
        let hook: LoginHook = Arc::new(move |peer, user_id| Box::pin(hook(peer, user_id)));
        self.login_hooks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(hook);
    }

    /// Peer currently logged in as `user_id`
    pub fn peer_of(&self, user_id: &str) -> Option<PeerId> {
        let sessions = self.sessions.lock().unwrap_or_else(|e| e.into_inner());
        sessions
            .iter()
            .find(|(_, logged_in)| logged_in.user_id == user_id)
            .map(|(peer, _)| *peer)
    }

    /// Number of logged in connections
    pub fn session_count(&self) -> usize {
        self.sessions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }

    /// Opens a session for `user_id` on `peer` and runs the login hooks
    ///
    /// Fails when the peer already has a session or the user is logged in
    /// elsewhere.
    pub async fn login(
        &self,
        peer: PeerId,
        user_id: String,
        extensions: Arc<Extensions>,
    ) -> Result<Arc<Session>, HandlerError> {
        validate_user_id(&user_id)?;

        let access_level = if self.config.admins.contains(&user_id) {
            AccessLevel::Admin
        } else {
            AccessLevel::Player
        };
        let session = Arc::new(Session {
            user_id: user_id.clone(),
            access_level,
        });

        {
            let mut sessions = self.sessions.lock().unwrap_or_else(|e| e.into_inner());
            if sessions.contains_key(&peer) {
                return Err(HandlerError::Failed("already logged in".to_string()));
            }
            if sessions.values().any(|logged_in| logged_in.user_id == user_id) {
                return Err(HandlerError::Failed(format!(
                    "{} is logged in elsewhere",
                    user_id
                )));
            }
            extensions.insert(&SESSION, Arc::clone(&session));
            sessions.insert(
                peer,
                LoggedIn {
                    user_id: user_id.clone(),
                    extensions,
                },
            );
        }

        let hooks = self
            .login_hooks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        for hook in hooks {
            if let Err(err) = hook(peer, user_id.clone()).await {
                warn!("Login of {} on peer {} rolled back: {}", user_id, peer, err);
                self.end_session(peer, &user_id);
                return Err(err);
            }
        }

        if !self.has_session(peer, &user_id) {
            return Err(HandlerError::Failed(
                "disconnected while logging in".to_string(),
            ));
        }

        info!("Peer {} logged in as {} ({:?})", peer, user_id, access_level);
        self.events.publish(AuthEvent::Login { peer, user_id }).await;
        Ok(session)
    }

    fn has_session(&self, peer: PeerId, user_id: &str) -> bool {
        self.sessions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&peer)
            .is_some_and(|logged_in| logged_in.user_id == user_id)
    }

    /// Drops the session of `peer` if it still belongs to `user_id`
    fn end_session(&self, peer: PeerId, user_id: &str) {
        let mut sessions = self.sessions.lock().unwrap_or_else(|e| e.into_inner());
        if sessions
            .get(&peer)
            .is_some_and(|logged_in| logged_in.user_id == user_id)
        {
            if let Some(logged_in) = sessions.remove(&peer) {
                logged_in.extensions.remove(&SESSION);
            }
        }
    }

    /// Ends the session of `peer`, if any
    pub async fn disconnect(&self, peer: PeerId) {
        let logged_in = self
            .sessions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&peer);

        let Some(logged_in) = logged_in else {
            debug!("Peer {} disconnected without a session", peer);
            return;
        };

        logged_in.extensions.remove(&SESSION);
        info!("Peer {} ({}) logged out", peer, logged_in.user_id);
        self.events
            .publish(AuthEvent::Logout {
                peer,
                user_id: logged_in.user_id,
            })
            .await;
    }

    async fn handle_login(self: Arc<Self>, request: Request) -> HandlerResult {
        let user_id: String = request.decode()?;
        let session = self
            .login(request.peer, user_id, Arc::clone(&request.extensions))
            .await?;
        Ok(codec::to_bytes(&(session.access_level as u8)))
    }
}

/// Session of the requesting connection
pub fn session(request: &Request) -> Result<Arc<Session>, HandlerError> {
    request
        .extensions
        .get(&SESSION)
        .ok_or_else(|| HandlerError::Unauthorized("not logged in".to_string()))
}

/// Session of the requesting connection, which must be an admin
pub fn admin_session(request: &Request) -> Result<Arc<Session>, HandlerError> {
    let session = session(request)?;
    if session.access_level < AccessLevel::Admin {
        return Err(HandlerError::Unauthorized("admin access required".to_string()));
    }
    Ok(session)
}

fn validate_user_id(user_id: &str) -> Result<(), HandlerError> {
    if user_id.is_empty() || user_id.len() > MAX_USER_ID_LEN {
        return Err(HandlerError::Failed(format!(
            "user id must be 1 to {} characters",
            MAX_USER_ID_LEN
        )));
    }
    if !user_id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        return Err(HandlerError::Failed(
            "user id may only contain letters, digits, '-' and '_'".to_string(),
        ));
    }
    Ok(())
}

impl Module for AuthModule {
    fn name(&self) -> &'static str {
        "auth"
    }

    fn initialize(self: Arc<Self>, ctx: &mut InitContext<'_>) -> Result<(), DependencyError> {
        ctx.router()
            .register_handler(op_codes::LOGIN, move |request| {
                Arc::clone(&self).handle_login(request)
            });
        Ok(())
    }
}
