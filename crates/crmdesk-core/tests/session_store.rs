mod common;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use common::{BackendState, MockBackend, PASSWORD, PROFILE_ID};
use crmdesk_core::auth::{
    CredentialSlot, CredentialStore, FileCredentials, MemoryCredentials, SessionPhase, SessionSnapshot,
    SessionStore, SnapshotStore,
};
use crmdesk_core::models::{QueueFilters, UserProfile};

fn session(backend: &MockBackend, credentials: Arc<MemoryCredentials>) -> SessionStore {
    SessionStore::new(backend.client(credentials), SnapshotStore::ephemeral())
}

/// Memory store whose writes to the refresh slot can be switched off
#[derive(Default)]
struct FlakyCredentials {
    inner: MemoryCredentials,
    refuse_refresh: AtomicBool,
}

impl CredentialStore for FlakyCredentials {
    fn get(&self, slot: CredentialSlot) -> anyhow::Result<Option<String>> {
        self.inner.get(slot)
    }

    fn set(&self, slot: CredentialSlot, value: &str) -> anyhow::Result<()> {
        if slot == CredentialSlot::Refresh && self.refuse_refresh.load(Ordering::SeqCst) {
            anyhow::bail!("keychain is locked");
        }
        self.inner.set(slot, value)
    }

    fn remove(&self, slot: CredentialSlot) -> anyhow::Result<()> {
        self.inner.remove(slot)
    }
}

#[tokio::test]
async fn test_login_stores_credentials_and_profile() {
    let backend = MockBackend::start().await;
    let credentials = Arc::new(MemoryCredentials::new());
    let dir = tempfile::tempdir().unwrap();
    let store = SessionStore::new(backend.client(credentials.clone()), SnapshotStore::new(dir.path()));
    let mut changes = store.subscribe();

    let user = store.login("agent@x.com", PASSWORD).await.unwrap();

    assert_eq!(user.id(), Some(PROFILE_ID));
    let state = store.state();
    assert_eq!(state.token.as_deref(), Some("A1"));
    assert!(state.is_authenticated);
    assert!(!state.loading);
    assert_eq!(state.phase(), SessionPhase::Authenticated);
    assert!(changes.has_changed().unwrap());
    assert!(!changes.borrow_and_update().loading);

    assert_eq!(credentials.get(CredentialSlot::Access).unwrap().as_deref(), Some("A1"));
    assert_eq!(credentials.get(CredentialSlot::Refresh).unwrap().as_deref(), Some("R1"));

    // The snapshot keeps the profile and flag, never the credentials
    let persisted = std::fs::read_to_string(dir.path().join("session.json")).unwrap();
    assert!(!persisted.contains("A1"));
    assert!(!persisted.contains("R1"));
    let snapshot: SessionSnapshot = serde_json::from_str(&persisted).unwrap();
    assert!(snapshot.is_authenticated);
    assert_eq!(snapshot.user.and_then(|u| u.id()), Some(PROFILE_ID));
}

#[tokio::test]
async fn test_login_without_profile_uses_identifier() {
    let backend = MockBackend::start().await;
    backend.state.token_includes_user.store(false, Ordering::SeqCst);
    let store = session(&backend, Arc::new(MemoryCredentials::new()));

    let user = store.login("agent@x.com", PASSWORD).await.unwrap();

    assert_eq!(user, UserProfile::from_identifier("agent@x.com"));
    assert_eq!(store.state().user.unwrap().email(), Some("agent@x.com"));
}

#[tokio::test]
async fn test_login_failure_keeps_state() {
    let backend = MockBackend::start().await;
    let credentials = Arc::new(MemoryCredentials::new());
    let store = session(&backend, credentials.clone());

    let failure = store.login("agent@x.com", "wrong").await.unwrap_err();

    assert_eq!(failure.message(), "No active account found with the given credentials");
    let state = store.state();
    assert!(!state.is_authenticated);
    assert!(!state.loading);
    assert!(state.user.is_none());
    assert_eq!(credentials.get(CredentialSlot::Access).unwrap(), None);
    assert_eq!(BackendState::hits(&backend.state.refresh_hits), 0);
}

#[tokio::test]
async fn test_relogin_after_failure_keeps_session() {
    let backend = MockBackend::start().await;
    let store = session(&backend, Arc::new(MemoryCredentials::new()));
    store.login("agent@x.com", PASSWORD).await.unwrap();

    store.login("agent@x.com", "wrong").await.unwrap_err();

    // A failed re-login leaves the existing session alone
    let state = store.state();
    assert!(state.is_authenticated);
    assert_eq!(state.token.as_deref(), Some("A1"));
}

#[tokio::test]
async fn test_relogin_with_unsaved_credentials_signs_out() {
    let backend = MockBackend::start().await;
    let credentials = Arc::new(FlakyCredentials::default());
    let store = SessionStore::new(backend.client(credentials.clone()), SnapshotStore::ephemeral());
    store.login("agent@x.com", PASSWORD).await.unwrap();

    credentials.refuse_refresh.store(true, Ordering::SeqCst);
    let failure = store.login("agent@x.com", PASSWORD).await.unwrap_err();

    assert_eq!(failure.message(), "The credentials could not be saved. Sign in again.");
    let state = store.state();
    assert_eq!(state.phase(), SessionPhase::Anonymous);
    assert!(state.token.is_none());
    assert!(state.user.is_none());
    assert_eq!(credentials.get(CredentialSlot::Access).unwrap(), None);
    assert_eq!(credentials.get(CredentialSlot::Refresh).unwrap(), None);
    assert!(!store.check_auth().await);
    assert_eq!(BackendState::hits(&backend.state.me_hits), 0);
}

#[tokio::test]
async fn test_file_credentials_survive_a_restart() {
    let backend = MockBackend::start().await;
    let dir = tempfile::tempdir().unwrap();
    let first = SessionStore::new(
        backend.client(Arc::new(FileCredentials::new(dir.path()))),
        SnapshotStore::new(dir.path()),
    );
    first.login("agent@x.com", PASSWORD).await.unwrap();
    drop(first);

    let second = SessionStore::new(
        backend.client(Arc::new(FileCredentials::new(dir.path()))),
        SnapshotStore::new(dir.path()),
    );
    assert!(second.is_authenticated());
    assert!(second.check_auth().await);

    assert_eq!(second.state().token.as_deref(), Some("A1"));
    assert_eq!(BackendState::hits(&backend.state.me_hits), 1);
    assert_eq!(BackendState::hits(&backend.state.token_hits), 1);
}

#[tokio::test]
async fn test_overlapping_login_is_rejected() {
    let backend = MockBackend::start().await;
    backend.state.token_delay_ms.store(300, Ordering::SeqCst);
    let store = session(&backend, Arc::new(MemoryCredentials::new()));

    let (first, second) = tokio::join!(store.login("agent@x.com", PASSWORD), async {
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(store.state().loading);
        store.login("agent@x.com", PASSWORD).await
    });

    assert!(first.is_ok());
    assert!(second.unwrap_err().message().contains("in progress"));
    assert_eq!(BackendState::hits(&backend.state.token_hits), 1);
    assert!(!store.state().loading);
}

#[tokio::test]
async fn test_check_auth_without_token_makes_no_call() {
    let backend = MockBackend::start().await;
    let store = session(&backend, Arc::new(MemoryCredentials::new()));

    assert!(!store.check_auth().await);

    assert_eq!(BackendState::hits(&backend.state.me_hits), 0);
    assert_eq!(store.state().phase(), SessionPhase::Anonymous);
}

#[tokio::test]
async fn test_check_auth_restores_profile() {
    let backend = MockBackend::start().await;
    let store = session(&backend, Arc::new(MemoryCredentials::with_tokens("A1", "R1")));

    assert!(store.check_auth().await);

    let state = store.state();
    assert!(state.is_authenticated);
    assert!(!state.loading);
    assert_eq!(state.token.as_deref(), Some("A1"));
    assert_eq!(state.user.and_then(|u| u.display_name()).as_deref(), Some("Ana Souza"));
}

#[tokio::test]
async fn test_check_auth_picks_up_renewed_token() {
    let backend = MockBackend::start().await;
    let store = session(&backend, Arc::new(MemoryCredentials::with_tokens("A0", "R1")));

    assert!(store.check_auth().await);

    assert_eq!(store.state().token.as_deref(), Some("A2"));
    assert_eq!(BackendState::hits(&backend.state.refresh_hits), 1);
}

#[tokio::test]
async fn test_check_auth_failure_signs_out() {
    let backend = MockBackend::start().await;
    backend.state.refresh_accepted.store(false, Ordering::SeqCst);
    let credentials = Arc::new(MemoryCredentials::with_tokens("A0", "R1"));
    let dir = tempfile::tempdir().unwrap();
    let snapshots = SnapshotStore::new(dir.path());
    snapshots
        .save(&SessionSnapshot {
            user: Some(UserProfile::from_identifier("agent@x.com")),
            is_authenticated: true,
        })
        .unwrap();
    let store = SessionStore::new(backend.client(credentials.clone()), snapshots);
    assert!(store.is_authenticated());

    assert!(!store.check_auth().await);

    let state = store.state();
    assert_eq!(state.phase(), SessionPhase::Anonymous);
    assert!(state.user.is_none());
    assert_eq!(credentials.get(CredentialSlot::Refresh).unwrap(), None);
    let persisted = SnapshotStore::new(dir.path()).load().unwrap();
    assert!(!persisted.is_authenticated);
}

#[tokio::test]
async fn test_logout_is_idempotent() {
    let backend = MockBackend::start().await;
    let credentials = Arc::new(MemoryCredentials::new());
    let store = session(&backend, credentials.clone());
    store.login("agent@x.com", PASSWORD).await.unwrap();

    store.logout();
    store.logout();

    let state = store.state();
    assert!(state.user.is_none());
    assert!(state.token.is_none());
    assert!(!state.is_authenticated);
    assert_eq!(credentials.get(CredentialSlot::Access).unwrap(), None);
    assert_eq!(credentials.get(CredentialSlot::Refresh).unwrap(), None);
}

#[tokio::test]
async fn test_expiry_watch_signs_out_when_renewal_fails() {
    let backend = MockBackend::start().await;
    let credentials = Arc::new(MemoryCredentials::new());
    let store = Arc::new(session(&backend, credentials.clone()));
    store.login("agent@x.com", PASSWORD).await.unwrap();
    let watch = store.spawn_expiry_watch();

    // The access credential expires and the refresh credential is revoked
    backend.state.accept_only(&[]);
    backend.state.refresh_accepted.store(false, Ordering::SeqCst);
    let mut changes = store.subscribe();
    store.api().fetch_queue(&QueueFilters::inbox()).await.unwrap_err();

    let state = tokio::time::timeout(Duration::from_secs(2), changes.wait_for(|s| !s.is_authenticated))
        .await
        .unwrap()
        .unwrap()
        .clone();
    assert!(state.user.is_none());
    assert_eq!(credentials.get(CredentialSlot::Access).unwrap(), None);

    drop(store);
    tokio::time::timeout(Duration::from_secs(2), watch).await.unwrap().unwrap();
}

#[tokio::test]
async fn test_expiry_watch_tracks_renewed_token() {
    let backend = MockBackend::start().await;
    let store = Arc::new(session(&backend, Arc::new(MemoryCredentials::new())));
    store.login("agent@x.com", PASSWORD).await.unwrap();
    let _watch = store.spawn_expiry_watch();

    // A1 expires; the next call renews to A2
    backend.state.accept_only(&["A2"]);
    let mut changes = store.subscribe();
    store.api().fetch_queue(&QueueFilters::inbox()).await.unwrap();

    let state = tokio::time::timeout(
        Duration::from_secs(2),
        changes.wait_for(|s| s.token.as_deref() == Some("A2")),
    )
    .await
    .unwrap()
    .unwrap()
    .clone();
    assert!(state.is_authenticated);
}
