//! Durable storage for the access/refresh credential pair.
//!
//! The credential pair lives only here; the session store keeps the access
//! credential in memory as a cache of the stored value.

use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use anyhow::{Context, Result};
use keyring::Entry;
use tempfile::NamedTempFile;

const SERVICE_NAME: &str = "crmdesk";

/// Credentials file name in the data directory
const CREDENTIALS_FILE: &str = "credentials.json";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CredentialSlot {
    Access,
    Refresh,
}

impl CredentialSlot {
    pub const ALL: [CredentialSlot; 2] = [CredentialSlot::Access, CredentialSlot::Refresh];

    /// Storage key of this slot
    pub fn key(&self) -> &'static str {
        match self {
            CredentialSlot::Access => "access_token",
            CredentialSlot::Refresh => "refresh_token",
        }
    }
}

/// Key-value store shared by every request in flight.
///
/// Writes are last-write-wins. Removing an absent slot succeeds.
pub trait CredentialStore: Send + Sync {
    fn get(&self, slot: CredentialSlot) -> Result<Option<String>>;
    fn set(&self, slot: CredentialSlot, value: &str) -> Result<()>;
    fn remove(&self, slot: CredentialSlot) -> Result<()>;

    fn clear(&self) -> Result<()> {
        for slot in CredentialSlot::ALL {
            self.remove(slot)?;
        }
        Ok(())
    }
}

/// OS keychain backend.
pub struct KeyringCredentials {
    service: String,
}

impl KeyringCredentials {
    pub fn new() -> Self {
        Self::with_service(SERVICE_NAME)
    }

    pub fn with_service(service: &str) -> Self {
        Self {
            service: service.to_string(),
        }
    }

    fn entry(&self, slot: CredentialSlot) -> Result<Entry> {
        Entry::new(&self.service, slot.key()).context("Failed to create keyring entry")
    }
}

impl Default for KeyringCredentials {
    fn default() -> Self {
        Self::new()
    }
}

impl CredentialStore for KeyringCredentials {
    fn get(&self, slot: CredentialSlot) -> Result<Option<String>> {
        match self.entry(slot)?.get_password() {
            Ok(value) => Ok(Some(value)),
            Err(keyring::Error::NoEntry) => Ok(None),
            Err(e) => Err(e).context("Failed to retrieve credential from keychain"),
        }
    }

    fn set(&self, slot: CredentialSlot, value: &str) -> Result<()> {
        self.entry(slot)?
            .set_password(value)
            .context("Failed to store credential in keychain")
    }

    fn remove(&self, slot: CredentialSlot) -> Result<()> {
        match self.entry(slot)?.delete_credential() {
            Ok(()) | Err(keyring::Error::NoEntry) => Ok(()),
            Err(e) => Err(e).context("Failed to delete credential from keychain"),
        }
    }
}

/// Private JSON file in the data directory. The default backend.
pub struct FileCredentials {
    path: PathBuf,
    // Serializes read-modify-write cycles within this process
    lock: Mutex<()>,
}

impl FileCredentials {
    pub fn new(data_dir: &Path) -> Self {
        Self::at(data_dir.join(CREDENTIALS_FILE))
    }

    pub fn at(path: PathBuf) -> Self {
        Self {
            path,
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read(&self) -> Result<HashMap<String, String>> {
        if !self.path.exists() {
            return Ok(HashMap::new());
        }
        let contents =
            std::fs::read_to_string(&self.path).context("Failed to read credentials file")?;
        serde_json::from_str(&contents).context("Failed to parse credentials file")
    }

    /// Replace the file atomically through a temp file in the same
    /// directory. tempfile creates it with mode 0600 on unix.
    fn write(&self, values: &HashMap<String, String>) -> Result<()> {
        let parent = self
            .path
            .parent()
            .filter(|dir| !dir.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        std::fs::create_dir_all(parent)?;

        let contents = serde_json::to_string_pretty(values)?;
        let mut temp_file =
            NamedTempFile::new_in(parent).context("Failed to create temp credentials file")?;
        temp_file
            .write_all(contents.as_bytes())
            .context("Failed to write credentials file")?;
        temp_file
            .persist(&self.path)
            .context("Failed to persist credentials file")?;
        Ok(())
    }
}

impl CredentialStore for FileCredentials {
    fn get(&self, slot: CredentialSlot) -> Result<Option<String>> {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(self.read()?.remove(slot.key()))
    }

    fn set(&self, slot: CredentialSlot, value: &str) -> Result<()> {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        let mut values = self.read()?;
        values.insert(slot.key().to_string(), value.to_string());
        self.write(&values)
    }

    fn remove(&self, slot: CredentialSlot) -> Result<()> {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        let mut values = self.read()?;
        if values.remove(slot.key()).is_some() {
            self.write(&values)?;
        }
        Ok(())
    }
}

/// Process-local backend; nothing survives a restart.
#[derive(Default)]
pub struct MemoryCredentials {
    values: Mutex<HashMap<CredentialSlot, String>>,
}

impl MemoryCredentials {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_tokens(access: &str, refresh: &str) -> Self {
        let store = Self::new();
        {
            let mut values = store.values.lock().unwrap_or_else(PoisonError::into_inner);
            values.insert(CredentialSlot::Access, access.to_string());
            values.insert(CredentialSlot::Refresh, refresh.to_string());
        }
        store
    }
}

impl CredentialStore for MemoryCredentials {
    fn get(&self, slot: CredentialSlot) -> Result<Option<String>> {
        let values = self.values.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(values.get(&slot).cloned())
    }

    fn set(&self, slot: CredentialSlot, value: &str) -> Result<()> {
        let mut values = self.values.lock().unwrap_or_else(PoisonError::into_inner);
        values.insert(slot, value.to_string());
        Ok(())
    }

    fn remove(&self, slot: CredentialSlot) -> Result<()> {
        let mut values = self.values.lock().unwrap_or_else(PoisonError::into_inner);
        values.remove(&slot);
        Ok(())
    }
}
