use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::session::SessionStore;

const SESSION_FILE_NAME: &str = "session.json";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("session storage unavailable")]
    Unavailable,
    #[error("session storage io failed: {0}")]
    Io(String),
    #[error("session storage encode failed: {0}")]
    Encode(String),
}

/// In-process store. Clones share the same slot, like tabs sharing an origin.
#[derive(Debug, Clone, Default)]
pub struct MemorySessionStore {
    slot: Arc<Mutex<Option<String>>>,
    unavailable: Arc<AtomicBool>,
}

impl MemorySessionStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_sid(sid: &str) -> Self {
        let store = Self::default();
        *store.lock_slot() = Some(sid.to_string());
        store
    }

    /// Simulates storage disabled by the environment (privacy modes).
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    #[must_use]
    pub fn peek(&self) -> Option<String> {
        self.lock_slot().clone()
    }

    fn lock_slot(&self) -> std::sync::MutexGuard<'_, Option<String>> {
        self.slot
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn check_available(&self) -> Result<(), StoreError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable);
        }
        Ok(())
    }
}

impl SessionStore for MemorySessionStore {
    type Error = StoreError;

    fn load_sid(&self) -> Result<Option<String>, Self::Error> {
        self.check_available()?;
        Ok(self.peek())
    }

    fn persist_sid(&self, sid: &str) -> Result<(), Self::Error> {
        self.check_available()?;
        *self.lock_slot() = Some(sid.to_string());
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
struct SessionDocument {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    oblivion_sid: Option<String>,
}

/// JSON file holding the `oblivion_sid` slot.
#[derive(Debug, Clone)]
pub struct FileSessionStore {
    path: PathBuf,
}

impl FileSessionStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn open_default() -> Self {
        Self::new(default_session_path())
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read_document(&self) -> Result<SessionDocument, StoreError> {
        let raw = match fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(error) if error.kind() == ErrorKind::NotFound => {
                return Ok(SessionDocument::default());
            }
            Err(error) => return Err(StoreError::Io(error.to_string())),
        };
        match serde_json::from_str::<SessionDocument>(&raw) {
            Ok(document) => Ok(document),
            Err(error) => {
                warn!(
                    path = %self.path.display(),
                    %error,
                    "session file is corrupt; treating as empty"
                );
                Ok(SessionDocument::default())
            }
        }
    }

    fn write_document(&self, document: &SessionDocument) -> Result<(), StoreError> {
        let parent = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        fs::create_dir_all(&parent).map_err(|error| StoreError::Io(error.to_string()))?;

        let encoded = serde_json::to_string_pretty(document)
            .map_err(|error| StoreError::Encode(error.to_string()))?;
        let mut staged = tempfile::NamedTempFile::new_in(&parent)
            .map_err(|error| StoreError::Io(error.to_string()))?;
        staged
            .write_all(encoded.as_bytes())
            .map_err(|error| StoreError::Io(error.to_string()))?;
        staged
            .persist(&self.path)
            .map_err(|error| StoreError::Io(error.error.to_string()))?;
        Ok(())
    }
}

impl SessionStore for FileSessionStore {
    type Error = StoreError;

    fn load_sid(&self) -> Result<Option<String>, Self::Error> {
        Ok(self.read_document()?.oblivion_sid)
    }

    fn persist_sid(&self, sid: &str) -> Result<(), Self::Error> {
        self.write_document(&SessionDocument {
            oblivion_sid: Some(sid.to_string()),
        })
    }
}

pub fn default_session_path() -> PathBuf {
    if let Some(mut data_dir) = dirs::data_local_dir() {
        data_dir.push("oblivion");
        data_dir.push(SESSION_FILE_NAME);
        return data_dir;
    }

    if let Some(mut home_dir) = dirs::home_dir() {
        home_dir.push(".oblivion");
        home_dir.push(SESSION_FILE_NAME);
        return home_dir;
    }

    PathBuf::from(SESSION_FILE_NAME)
}
