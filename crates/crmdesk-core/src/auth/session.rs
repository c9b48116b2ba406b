use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::models::UserProfile;

/// Session file name in the data directory
const SESSION_FILE: &str = "session.json";

/// The part of the session that survives a restart. Credentials are stored
/// separately and `loading` is never persisted.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionSnapshot {
    #[serde(default)]
    pub user: Option<UserProfile>,
    #[serde(default)]
    pub is_authenticated: bool,
}

pub struct SnapshotStore {
    path: Option<PathBuf>,
}

impl SnapshotStore {
    pub fn new(data_dir: &Path) -> Self {
        Self {
            path: Some(data_dir.join(SESSION_FILE)),
        }
    }

    /// A store that persists nothing
    pub fn ephemeral() -> Self {
        Self { path: None }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Load the snapshot from disk; a missing file is an empty snapshot
    pub fn load(&self) -> Result<SessionSnapshot> {
        let Some(ref path) = self.path else {
            return Ok(SessionSnapshot::default());
        };
        if !path.exists() {
            return Ok(SessionSnapshot::default());
        }
        let contents = std::fs::read_to_string(path).context("Failed to read session file")?;
        serde_json::from_str(&contents).context("Failed to parse session file")
    }

    /// Save snapshot to disk
    pub fn save(&self, snapshot: &SessionSnapshot) -> Result<()> {
        let Some(ref path) = self.path else {
            return Ok(());
        };
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let contents = serde_json::to_string_pretty(snapshot)?;
        std::fs::write(path, contents).context("Failed to write session file")?;
        Ok(())
    }
}
