//! Persistence contract and the two bundled stores.
//!
//! A store maps profile ids to finalized profiles. Saving is an overwrite,
//! so re-saving a profile after its viewed flag changes is safe. Loading an
//! unknown id is `Ok(None)`, not an error.

use std::backtrace::Backtrace;
use std::collections::HashMap;
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use chrono::{DateTime, Utc};
use itertools::Itertools;
use miniprof_schemas::Profile;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::host::RequestInfo;

/// Order in which [`Storage::list`] returns ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ListOrder {
    /// Most recently started first.
    #[default]
    Descending,
    /// Oldest first.
    Ascending,
}

/// Filter for [`Storage::list`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ListOptions {
    /// Maximum number of ids returned.
    pub max_results: usize,
    /// Only profiles started at or after this instant.
    pub start: Option<DateTime<Utc>>,
    /// Only profiles started at or before this instant.
    pub finish: Option<DateTime<Utc>>,
    /// Result order, by start time.
    pub order: ListOrder,
}

impl Default for ListOptions {
    fn default() -> Self {
        Self {
            max_results: 100,
            start: None,
            finish: None,
            order: ListOrder::Descending,
        }
    }
}

impl ListOptions {
    fn admits(&self, started: DateTime<Utc>) -> bool {
        self.start.is_none_or(|start| started >= start)
            && self.finish.is_none_or(|finish| started <= finish)
    }

    /// Applies window, order and limit to `(id, started)` pairs.
    fn select(&self, entries: impl IntoIterator<Item = (Uuid, DateTime<Utc>)>) -> Vec<Uuid> {
        let sorted = entries
            .into_iter()
            .filter(|&(_, started)| self.admits(started))
            .sorted_by(|a, b| match self.order {
                ListOrder::Ascending => a.1.cmp(&b.1).then(a.0.cmp(&b.0)),
                ListOrder::Descending => b.1.cmp(&a.1).then(b.0.cmp(&a.0)),
            });
        sorted.map(|(id, _)| id).take(self.max_results).collect()
    }
}

/// Persistence for finalized profiles, keyed by [`Profile::id`].
///
/// Implementations are shared between requests, so they take `&self` and
/// must be `Send + Sync`. The request is passed through for stores that
/// partition by user or tenant; the bundled stores ignore it.
pub trait Storage: Send + Sync {
    /// Stores `profile`, replacing any profile with the same id.
    fn save(&self, request: &RequestInfo, profile: &Profile) -> Result<(), StorageError>;

    /// Fetches a stored profile, or `None` if the id is unknown.
    fn load(&self, request: &RequestInfo, id: Uuid) -> Result<Option<Profile>, StorageError>;

    /// Lists stored ids matching `options`.
    fn list(&self, options: &ListOptions) -> Result<Vec<Uuid>, StorageError>;
}

/// In-process store backed by a map.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    profiles: RwLock<HashMap<Uuid, Profile>>,
}

impl MemoryStorage {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored profiles.
    pub fn len(&self) -> usize {
        self.profiles.read().expect("storage lock poisoned").len()
    }

    /// Whether nothing has been stored.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Storage for MemoryStorage {
    fn save(&self, _request: &RequestInfo, profile: &Profile) -> Result<(), StorageError> {
        self.profiles
            .write()
            .expect("storage lock poisoned")
            .insert(profile.id, profile.clone());
        Ok(())
    }

    fn load(&self, _request: &RequestInfo, id: Uuid) -> Result<Option<Profile>, StorageError> {
        let profiles = self.profiles.read().expect("storage lock poisoned");
        Ok(profiles.get(&id).cloned())
    }

    fn list(&self, options: &ListOptions) -> Result<Vec<Uuid>, StorageError> {
        let profiles = self.profiles.read().expect("storage lock poisoned");
        Ok(options.select(profiles.values().map(|p| (p.id, p.started))))
    }
}

/// Store that keeps one `<id>.json` file per profile in a directory.
#[derive(Debug, Clone)]
pub struct FileStorage {
    dir: PathBuf,
}

impl FileStorage {
    /// Opens (creating if needed) a store rooted at `dir`.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    /// Directory the profiles live in.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, id: Uuid) -> PathBuf {
        self.dir.join(format!("{id}.json"))
    }

    fn read(path: &Path) -> Result<Profile, StorageError> {
        let bytes = std::fs::read(path)?;
        Profile::from_slice(&bytes).map_err(StorageError::deserialize)
    }
}

impl Storage for FileStorage {
    fn save(&self, _request: &RequestInfo, profile: &Profile) -> Result<(), StorageError> {
        let json = profile.to_json().map_err(StorageError::serialize)?;
        // Write then rename so readers never see a half-written file.
        let path = self.path_for(profile.id);
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, json)?;
        std::fs::rename(&tmp, &path)?;
        debug!(path = %path.display(), "stored profile");
        Ok(())
    }

    fn load(&self, _request: &RequestInfo, id: Uuid) -> Result<Option<Profile>, StorageError> {
        match Self::read(&self.path_for(id)) {
            Ok(profile) => Ok(Some(profile)),
            Err(err) if err.is_not_found() => Ok(None),
            Err(err) => Err(err),
        }
    }

    fn list(&self, options: &ListOptions) -> Result<Vec<Uuid>, StorageError> {
        let mut entries = Vec::new();
        for entry in std::fs::read_dir(&self.dir)? {
            let path = entry?.path();
            let Some(id) = path
                .file_name()
                .and_then(|name| name.to_str())
                .and_then(|name| name.strip_suffix(".json"))
                .and_then(|stem| Uuid::parse_str(stem).ok())
            else {
                continue;
            };
            match Self::read(&path) {
                Ok(profile) => entries.push((id, profile.started)),
                Err(err) => {
                    warn!(path = %path.display(), error = %err, "skipping unreadable profile");
                }
            }
        }
        Ok(options.select(entries))
    }
}

/// Error type for persistence failures.
///
/// Uses the canonical struct pattern with backtrace capture and `is_xxx()`
/// helper methods.
#[derive(Debug)]
pub struct StorageError {
    kind: StorageErrorKind,
    backtrace: Backtrace,
}

/// Internal error variants. Not exposed publicly; use `is_xxx()` methods.
#[derive(Debug)]
enum StorageErrorKind {
    /// Encoding a profile failed.
    Serialization(serde_json::Error),
    /// A stored profile could not be decoded.
    Deserialization(serde_json::Error),
    /// Reading or writing the backing medium failed.
    Io(io::Error),
    /// A custom store failed for its own reasons.
    Backend(String),
}

impl StorageError {
    fn new(kind: StorageErrorKind) -> Self {
        Self {
            kind,
            backtrace: Backtrace::capture(),
        }
    }

    pub(crate) fn serialize(err: serde_json::Error) -> Self {
        Self::new(StorageErrorKind::Serialization(err))
    }

    pub(crate) fn deserialize(err: serde_json::Error) -> Self {
        Self::new(StorageErrorKind::Deserialization(err))
    }

    /// Creates an error for a store-specific failure.
    ///
    /// For [`Storage`] implementations outside this crate.
    pub fn backend(message: impl Into<String>) -> Self {
        Self::new(StorageErrorKind::Backend(message.into()))
    }

    /// Returns true if encoding a profile failed.
    pub fn is_serialization(&self) -> bool {
        matches!(self.kind, StorageErrorKind::Serialization(_))
    }

    /// Returns true if a stored profile could not be decoded.
    pub fn is_deserialization(&self) -> bool {
        matches!(self.kind, StorageErrorKind::Deserialization(_))
    }

    /// Returns true if this error is due to I/O failure.
    pub fn is_io(&self) -> bool {
        matches!(self.kind, StorageErrorKind::Io(_))
    }

    /// Returns true if a store-specific failure occurred.
    pub fn is_backend(&self) -> bool {
        matches!(self.kind, StorageErrorKind::Backend(_))
    }

    /// Returns true if the underlying I/O error is "not found".
    pub(crate) fn is_not_found(&self) -> bool {
        matches!(&self.kind, StorageErrorKind::Io(e) if e.kind() == io::ErrorKind::NotFound)
    }

    /// Returns the backtrace captured when this error was created.
    pub fn backtrace(&self) -> &Backtrace {
        &self.backtrace
    }
}

impl fmt::Display for StorageErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StorageErrorKind::Serialization(err) => {
                write!(f, "failed to serialize profile: {err}")
            }
            StorageErrorKind::Deserialization(err) => {
                write!(f, "failed to deserialize profile: {err}")
            }
            StorageErrorKind::Io(err) => write!(f, "I/O error: {err}"),
            StorageErrorKind::Backend(msg) => write!(f, "storage backend error: {msg}"),
        }
    }
}

impl fmt::Display for StorageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{}", self.kind)?;

        // Backtrace (will be empty unless RUST_BACKTRACE is set).
        write!(f, "{}", self.backtrace)
    }
}

impl std::error::Error for StorageError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match &self.kind {
            StorageErrorKind::Serialization(err)
            | StorageErrorKind::Deserialization(err) => Some(err),
            StorageErrorKind::Io(err) => Some(err),
            StorageErrorKind::Backend(_) => None,
        }
    }
}

impl From<io::Error> for StorageError {
    fn from(err: io::Error) -> Self {
        Self::new(StorageErrorKind::Io(err))
    }
}
