//! Authentication module for managing the agent's session.
//!
//! This module provides:
//! - `CredentialStore`: durable storage for the access/refresh pair
//!   (OS keychain, private file, or memory)
//! - `SnapshotStore`: the persisted `{user, is_authenticated}` snapshot
//! - `SessionStore`: the session state machine (login, logout, check_auth)

pub mod credentials;
pub mod session;
pub mod store;

use std::sync::Arc;

use anyhow::Result;

use crate::config::{Config, CredentialBackend};

pub use credentials::{
    CredentialSlot, CredentialStore, FileCredentials, KeyringCredentials, MemoryCredentials,
};
pub use session::{SessionSnapshot, SnapshotStore};
pub use store::{LoginFailure, SessionPhase, SessionState, SessionStore};

/// Open the credential backend selected in the configuration
pub fn open_credential_store(config: &Config) -> Result<Arc<dyn CredentialStore>> {
    Ok(match config.credential_backend {
        CredentialBackend::Keyring => Arc::new(KeyringCredentials::new()),
        CredentialBackend::File => Arc::new(FileCredentials::new(&config.data_dir()?)),
        CredentialBackend::Memory => Arc::new(MemoryCredentials::new()),
    })
}
