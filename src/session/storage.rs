//! Durable client-side storage for the session record

use super::{Session, SessionError};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

/// The one stable name the session record is stored under
pub const SESSION_KEY: &str = "session";

/// Backend holding the persisted session record
pub trait SessionStorage: Send + Sync {
    /// Read the record; `None` means unauthenticated
    fn load(&self) -> Result<Option<Session>, SessionError>;

    /// Replace the record
    fn save(&self, session: &Session) -> Result<(), SessionError>;

    /// Remove the record; removing an absent record is not an error
    fn remove(&self) -> Result<(), SessionError>;
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct StorageFile {
    #[serde(default)]
    records: HashMap<String, Session>,
}

/// JSON file storage, replaced atomically through a temp file + rename
#[derive(Debug, Clone)]
pub struct FileStorage {
    path: PathBuf,
}

impl FileStorage {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn tmp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}

impl SessionStorage for FileStorage {
    fn load(&self) -> Result<Option<Session>, SessionError> {
        let content = match std::fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let mut file: StorageFile = serde_json::from_str(&content)?;
        Ok(file.records.remove(SESSION_KEY))
    }

    fn save(&self, session: &Session) -> Result<(), SessionError> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut file = StorageFile::default();
        file.records.insert(SESSION_KEY.to_string(), session.clone());

        let tmp = self.tmp_path();
        std::fs::write(&tmp, serde_json::to_vec_pretty(&file)?)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }

    fn remove(&self) -> Result<(), SessionError> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Process-local storage; clones share the same record
#[derive(Debug, Clone, Default)]
pub struct MemoryStorage {
    record: Arc<Mutex<Option<Session>>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pre-populated storage, as if a previous run had persisted `session`
    pub fn with_session(session: Session) -> Self {
        Self {
            record: Arc::new(Mutex::new(Some(session))),
        }
    }

    /// Current record, for inspection
    pub fn peek(&self) -> Option<Session> {
        self.record
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl SessionStorage for MemoryStorage {
    fn load(&self) -> Result<Option<Session>, SessionError> {
        Ok(self.peek())
    }

    fn save(&self, session: &Session) -> Result<(), SessionError> {
        *self.record.lock().unwrap_or_else(PoisonError::into_inner) = Some(session.clone());
        Ok(())
    }

    fn remove(&self) -> Result<(), SessionError> {
        self.record
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        Ok(())
    }
}
