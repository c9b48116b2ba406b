//! Process-wide session state.
//!
//! `SessionStore` owns the agent's session and moves it between three
//! phases: Anonymous, Authenticating (a login or validation call is in
//! flight) and Authenticated. Every transition goes through one of
//! `login`, `logout`, `check_auth` or `set_user`; readers take a copy of
//! the state or subscribe to changes.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use thiserror::Error;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::api::{ApiClient, ApiError, GatewayEvent, TokenResponse};
use crate::models::UserProfile;

use super::credentials::{CredentialSlot, CredentialStore};
use super::session::{SessionSnapshot, SnapshotStore};

const LOGIN_FALLBACK_MESSAGE: &str = "Unable to sign in. Check your credentials.";
const LOGIN_IN_PROGRESS_MESSAGE: &str = "A sign-in is already in progress.";
const CREDENTIAL_STORAGE_MESSAGE: &str = "The credentials could not be saved. Sign in again.";

/// Body fields consulted for a login failure message, in priority order
const LOGIN_MESSAGE_FIELDS: [&str; 2] = ["detail", "message"];

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SessionState {
    pub user: Option<UserProfile>,
    /// In-memory copy of the stored access credential
    pub token: Option<String>,
    pub is_authenticated: bool,
    pub loading: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    Anonymous,
    Authenticating,
    Authenticated,
}

impl SessionState {
    pub fn phase(&self) -> SessionPhase {
        if self.loading {
            SessionPhase::Authenticating
        } else if self.is_authenticated {
            SessionPhase::Authenticated
        } else {
            SessionPhase::Anonymous
        }
    }

    fn from_snapshot(snapshot: SessionSnapshot) -> Self {
        Self {
            user: snapshot.user,
            token: None,
            is_authenticated: snapshot.is_authenticated,
            loading: false,
        }
    }

    fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            user: self.user.clone(),
            is_authenticated: self.is_authenticated,
        }
    }
}

/// Failed login, with a message fit for the user.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{message}")]
pub struct LoginFailure {
    message: String,
}

impl LoginFailure {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    /// Backend `detail`, then backend `message`, then a generic message.
    pub fn from_api_error(error: &ApiError) -> Self {
        let message = error
            .body()
            .and_then(|body| body.first_field(&LOGIN_MESSAGE_FIELDS))
            .unwrap_or(LOGIN_FALLBACK_MESSAGE);
        Self::new(message)
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

pub struct SessionStore {
    api: ApiClient,
    snapshots: SnapshotStore,
    state: watch::Sender<SessionState>,
    // Login/validation calls in flight; `loading` mirrors `in_flight > 0`.
    // Only touched inside watch updates, which are serialized.
    in_flight: AtomicUsize,
}

impl SessionStore {
    /// Create the store, restoring `user` and `is_authenticated` from the
    /// last snapshot. The credential itself is validated by `check_auth`.
    pub fn new(api: ApiClient, snapshots: SnapshotStore) -> Self {
        let snapshot = match snapshots.load() {
            Ok(snapshot) => snapshot,
            Err(e) => {
                warn!(error = %e, "Failed to load session snapshot, starting signed out");
                SessionSnapshot::default()
            }
        };
        debug!(is_authenticated = snapshot.is_authenticated, "Session snapshot restored");

        let (state, _) = watch::channel(SessionState::from_snapshot(snapshot));
        Self {
            api,
            snapshots,
            state,
            in_flight: AtomicUsize::new(0),
        }
    }

    pub fn api(&self) -> &ApiClient {
        &self.api
    }

    fn credentials(&self) -> &dyn CredentialStore {
        self.api.gateway().credentials().as_ref()
    }

    /// Copy of the current state
    pub fn state(&self) -> SessionState {
        self.state.borrow().clone()
    }

    pub fn is_authenticated(&self) -> bool {
        self.state.borrow().is_authenticated
    }

    /// Receiver notified on every state change
    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    // =========================================================================
    // Transitions
    // =========================================================================

    /// Sign in. Never panics or propagates transport errors: the outcome is
    /// the returned `Result`. Rejected while another login or validation is
    /// in flight.
    pub async fn login(&self, identifier: &str, secret: &str) -> Result<UserProfile, LoginFailure> {
        let started = self.state.send_if_modified(|state| {
            if state.loading {
                return false;
            }
            self.in_flight.fetch_add(1, Ordering::SeqCst);
            state.loading = true;
            true
        });
        if !started {
            return Err(LoginFailure::new(LOGIN_IN_PROGRESS_MESSAGE));
        }

        let tokens = match self.api.obtain_token(identifier, secret).await {
            Ok(tokens) => tokens,
            Err(e) => {
                warn!(error = %e, "Login failed");
                self.finish(|_| {});
                return Err(LoginFailure::from_api_error(&e));
            }
        };

        if let Err(e) = self.store_credentials(&tokens) {
            warn!(error = %e, "Failed to store credentials");
            // The previous pair may be half overwritten; no session survives this
            self.logout();
            self.finish(|_| {});
            return Err(LoginFailure::new(CREDENTIAL_STORAGE_MESSAGE));
        }

        let TokenResponse { access, user, .. } = tokens;
        let user = user.unwrap_or_else(|| UserProfile::from_identifier(identifier));
        let profile = user.clone();
        self.finish(move |state| {
            state.user = Some(user);
            state.token = Some(access);
            state.is_authenticated = true;
        });
        self.persist();

        info!("Login successful");
        Ok(profile)
    }

    /// Sign out: delete both credentials and clear the session. Idempotent.
    pub fn logout(&self) {
        for slot in CredentialSlot::ALL {
            if let Err(e) = self.credentials().remove(slot) {
                warn!(error = %e, slot = slot.key(), "Failed to delete credential");
            }
        }
        self.state.send_if_modified(|state| {
            let changed = state.user.is_some() || state.token.is_some() || state.is_authenticated;
            state.user = None;
            state.token = None;
            state.is_authenticated = false;
            changed
        });
        self.persist();
        info!("Logged out");
    }

    /// Re-validate the stored credential against the backend. With no
    /// stored access credential this returns `false` without a network call.
    /// Any failure, including a failed renewal, signs the user out.
    pub async fn check_auth(&self) -> bool {
        let token = match self.credentials().get(CredentialSlot::Access) {
            Ok(token) => token,
            Err(e) => {
                warn!(error = %e, "Failed to read access credential");
                None
            }
        };
        if token.is_none() {
            debug!("No stored access credential");
            self.state.send_if_modified(|state| {
                let changed = state.is_authenticated;
                state.is_authenticated = false;
                changed
            });
            self.persist();
            return false;
        }

        self.state.send_modify(|state| {
            self.in_flight.fetch_add(1, Ordering::SeqCst);
            state.loading = true;
        });

        match self.api.current_user().await {
            Ok(user) => {
                // A renewal during the call replaced the stored credential
                let token = self.credentials().get(CredentialSlot::Access).ok().flatten();
                self.finish(move |state| {
                    state.user = Some(user);
                    state.token = token;
                    state.is_authenticated = true;
                });
                self.persist();
                debug!("Session validated");
                true
            }
            Err(e) => {
                warn!(error = %e, "Session validation failed");
                self.logout();
                self.finish(|_| {});
                false
            }
        }
    }

    /// Replace the cached profile, e.g. after the user edited it elsewhere
    pub fn set_user(&self, user: UserProfile) {
        self.state.send_modify(|state| state.user = Some(user));
        self.persist();
    }

    // =========================================================================
    // Gateway events
    // =========================================================================

    /// React to gateway events until the store is dropped: a renewal
    /// refreshes the cached token, an unrecoverable session signs out.
    pub fn spawn_expiry_watch(self: &Arc<Self>) -> JoinHandle<()> {
        let events = self.api.gateway().subscribe();
        let store = Arc::downgrade(self);
        tokio::spawn(Self::watch_gateway(store, events))
    }

    async fn watch_gateway(store: Weak<Self>, mut events: broadcast::Receiver<GatewayEvent>) {
        loop {
            let event = match events.recv().await {
                Ok(event) => event,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Missed gateway events");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => break,
            };
            let Some(store) = store.upgrade() else {
                break;
            };
            store.handle_gateway_event(event);
        }
    }

    pub fn handle_gateway_event(&self, event: GatewayEvent) {
        match event {
            GatewayEvent::CredentialRenewed => {
                let token = self.credentials().get(CredentialSlot::Access).ok().flatten();
                self.state.send_if_modified(|state| {
                    if state.token == token {
                        return false;
                    }
                    state.token = token;
                    true
                });
            }
            GatewayEvent::LoginRequired => {
                info!("Session expired, signing out");
                self.logout();
            }
        }
    }

    // =========================================================================
    // Internals
    // =========================================================================

    fn store_credentials(&self, tokens: &TokenResponse) -> anyhow::Result<()> {
        self.credentials().set(CredentialSlot::Access, &tokens.access)?;
        self.credentials().set(CredentialSlot::Refresh, &tokens.refresh)?;
        Ok(())
    }

    /// Apply the outcome of an in-flight call and drop `loading` once no
    /// other call is pending.
    fn finish(&self, update: impl FnOnce(&mut SessionState)) {
        self.state.send_modify(|state| {
            update(state);
            let remaining = self.in_flight.fetch_sub(1, Ordering::SeqCst).saturating_sub(1);
            state.loading = remaining > 0;
        });
    }

    fn persist(&self) {
        let snapshot = self.state.borrow().snapshot();
        if let Err(e) = self.snapshots.save(&snapshot) {
            warn!(error = %e, "Failed to save session snapshot");
        }
    }
}
