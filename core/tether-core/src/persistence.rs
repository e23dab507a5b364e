//! Per-project message history and session metadata on disk.
//!
//! # Layout
//!
//! ```text
//! projects/<project>/metadata.json              current SessionMetadataRecord
//! projects/<project>/<session>_messages.json    MessageFile
//! projects/<project>/archive/                   superseded sessions
//! ```
//!
//! # Recovery
//!
//! - Files that fail to parse are renamed to `<name>.corrupt-<timestamp>`
//!   and treated as empty. They are never deleted.
//! - Metadata is validated on every read; records that can't be resolved to
//!   content are purged so callers start a fresh session instead.
//! - Writes go through a temp file + rename, serialized by one write lock.
//!
//! All methods block on disk I/O. The engine calls them from
//! `spawn_blocking`.

use std::collections::{HashMap, HashSet};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use chrono::Utc;
use fs_err as fs;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tempfile::NamedTempFile;

use crate::error::{Result, SyncError};
use crate::storage::{sanitize_component, StorageConfig};
use crate::types::{new_id, Message, ProjectDescriptor, SessionMetadataRecord};

const MESSAGE_FILE_VERSION: u32 = 1;
const MESSAGES_SUFFIX: &str = "_messages.json";

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MessageFile {
    version: u32,
    session_id: String,
    messages: Vec<Message>,
}

pub struct PersistenceStore {
    storage: StorageConfig,
    cache: Mutex<HashMap<String, SessionMetadataRecord>>,
    write_lock: Mutex<()>,
}

impl PersistenceStore {
    pub fn new(storage: StorageConfig) -> Self {
        Self {
            storage,
            cache: Mutex::new(HashMap::new()),
            write_lock: Mutex::new(()),
        }
    }

    pub fn storage(&self) -> &StorageConfig {
        &self.storage
    }

    // ─────────────────────────────────────────────────────────────────────
    // Messages
    // ─────────────────────────────────────────────────────────────────────

    /// Writes the full message list for `session_id` and upserts the
    /// project's metadata record.
    pub fn save(
        &self,
        project_id: &str,
        messages: &[Message],
        session_id: &str,
        project: &ProjectDescriptor,
    ) -> Result<SessionMetadataRecord> {
        let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);
        self.save_locked(project_id, messages, session_id, project)
    }

    /// Returns the stored messages, or an empty list if the file is missing
    /// or corrupt.
    pub fn load(&self, project_id: &str, session_id: &str) -> Vec<Message> {
        let path = self.storage.messages_file(project_id, session_id);
        read_or_quarantine::<MessageFile>(&path)
            .map(|file| file.messages)
            .unwrap_or_default()
    }

    /// Upserts one message by id, keeping the list ordered by timestamp
    /// whichever order concurrent writers take the lock in.
    pub fn append(
        &self,
        project: &ProjectDescriptor,
        session_id: &str,
        message: Message,
    ) -> Result<SessionMetadataRecord> {
        let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let mut messages = self.load(&project.id, session_id);
        match messages.iter_mut().find(|existing| existing.id == message.id) {
            Some(existing) => *existing = message,
            None => messages.push(message),
        }
        messages.sort_by_key(|m| m.timestamp);
        self.save_locked(&project.id, &messages, session_id, project)
    }

    /// Merges fetched history into the stored list: unknown ids are added,
    /// known ids keep their local copy, and the result is ordered by
    /// timestamp.
    pub fn merge_history(
        &self,
        project: &ProjectDescriptor,
        session_id: &str,
        fetched: Vec<Message>,
    ) -> Result<SessionMetadataRecord> {
        let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let mut messages = self.load(&project.id, session_id);
        let mut known: HashSet<String> = messages.iter().map(|m| m.id.clone()).collect();
        for message in fetched {
            if known.insert(message.id.clone()) {
                messages.push(message);
            }
        }
        messages.sort_by_key(|message| message.timestamp);
        self.save_locked(&project.id, &messages, session_id, project)
    }

    fn save_locked(
        &self,
        project_id: &str,
        messages: &[Message],
        session_id: &str,
        project: &ProjectDescriptor,
    ) -> Result<SessionMetadataRecord> {
        self.storage
            .ensure_project_dir(project_id)
            .map_err(|err| SyncError::io("create project dir", err))?;

        let file = MessageFile {
            version: MESSAGE_FILE_VERSION,
            session_id: session_id.to_string(),
            messages: messages.to_vec(),
        };
        write_json_atomic(&self.storage.messages_file(project_id, session_id), &file)?;

        let prior = self.cached_or_disk(project_id);
        let last_message_date = messages
            .last()
            .map(|message| message.timestamp)
            .or_else(|| prior.as_ref().map(|record| record.last_message_date))
            .unwrap_or_else(Utc::now);

        let record = SessionMetadataRecord {
            session_id: prior
                .as_ref()
                .map(|record| record.session_id.clone())
                .filter(|id| !id.is_empty())
                .unwrap_or_else(new_id),
            project_id: project_id.to_string(),
            project_name: project.name.clone(),
            project_path: project.path.clone(),
            last_message_date,
            message_count: messages.len(),
            remote_session_id: Some(session_id.to_string()),
            created_at: prior
                .as_ref()
                .map(|record| record.created_at)
                .unwrap_or_else(Utc::now),
        };
        write_json_atomic(&self.storage.metadata_file(project_id), &record)?;

        self.cache
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(project_id.to_string(), record.clone());

        tracing::debug!(
            project_id = %project_id,
            session_id = %session_id,
            message_count = record.message_count,
            "Saved session messages"
        );
        Ok(record)
    }

    // ─────────────────────────────────────────────────────────────────────
    // Metadata
    // ─────────────────────────────────────────────────────────────────────

    /// Returns the project's current record if it still resolves to
    /// content. Invalid records are purged and reported as `None`.
    pub fn get_metadata(&self, project_id: &str) -> Option<SessionMetadataRecord> {
        let record = self.cached_or_disk(project_id)?;
        match self.validate(project_id, &record) {
            Ok(()) => Some(record),
            Err(err) => {
                tracing::warn!(error = %err, "Purging unresolvable session metadata");
                self.purge_metadata(project_id);
                None
            }
        }
    }

    fn cached_or_disk(&self, project_id: &str) -> Option<SessionMetadataRecord> {
        if let Some(record) = self
            .cache
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(project_id)
        {
            return Some(record.clone());
        }

        let record =
            read_or_quarantine::<SessionMetadataRecord>(&self.storage.metadata_file(project_id))?;
        self.cache
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(project_id.to_string(), record.clone());
        Some(record)
    }

    fn validate(&self, project_id: &str, record: &SessionMetadataRecord) -> Result<()> {
        let reject = |reason: &str| SyncError::ValidationFailure {
            project_id: project_id.to_string(),
            reason: reason.to_string(),
        };

        let required = [
            ("sessionId", &record.session_id),
            ("projectId", &record.project_id),
            ("projectName", &record.project_name),
            ("projectPath", &record.project_path),
        ];
        if let Some((field, _)) = required.iter().find(|(_, value)| value.trim().is_empty()) {
            return Err(reject(&format!("empty {field}")));
        }

        if !self.storage.metadata_file(project_id).exists() {
            return Err(reject("metadata file missing"));
        }

        if let Some(remote) = record.remote_session_id.as_deref() {
            if remote.trim().is_empty() {
                return Err(reject("empty remoteSessionId"));
            }
            if !self.storage.messages_file(project_id, remote).exists() {
                return Err(reject("message file missing"));
            }
        }
        Ok(())
    }

    fn purge_metadata(&self, project_id: &str) {
        self.cache
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(project_id);
        let path = self.storage.metadata_file(project_id);
        if let Err(err) = fs::remove_file(&path) {
            if err.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!(error = %err, "Failed to remove invalid metadata file");
            }
        }
    }

    // ─────────────────────────────────────────────────────────────────────
    // Clear / archive
    // ─────────────────────────────────────────────────────────────────────

    pub fn clear(&self, project_id: &str) -> Result<()> {
        let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);
        self.cache
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(project_id);
        let dir = self.storage.project_dir(project_id);
        match fs::remove_dir_all(&dir) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(SyncError::io("clear project", err)),
        }
    }

    /// Moves the current session's message file and metadata into
    /// `archive/`. Returns the archived paths.
    pub fn archive(&self, project_id: &str) -> Result<Vec<PathBuf>> {
        let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let record = self.cached_or_disk(project_id);
        self.cache
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(project_id);

        let Some(record) = record else {
            return Ok(Vec::new());
        };

        let archive_dir = self.storage.archive_dir(project_id);
        fs::create_dir_all(&archive_dir).map_err(|err| SyncError::io("create archive dir", err))?;
        let stamp = file_timestamp();

        let mut archived = Vec::new();
        if let Some(remote) = record.remote_session_id.as_deref() {
            let source = self.storage.messages_file(project_id, remote);
            if source.exists() {
                let target = archive_dir.join(format!(
                    "{stamp}_{}{MESSAGES_SUFFIX}",
                    sanitize_component(remote)
                ));
                fs::rename(&source, &target)
                    .map_err(|err| SyncError::io("archive messages", err))?;
                archived.push(target);
            }
        }

        let metadata = self.storage.metadata_file(project_id);
        if metadata.exists() {
            let target = archive_dir.join(format!("{stamp}_metadata.json"));
            fs::rename(&metadata, &target).map_err(|err| SyncError::io("archive metadata", err))?;
            archived.push(target);
        }

        tracing::info!(project_id = %project_id, files = archived.len(), "Archived session");
        Ok(archived)
    }

    /// Archived message files, oldest first.
    pub fn list_archives(&self, project_id: &str) -> Result<Vec<PathBuf>> {
        let dir = self.storage.archive_dir(project_id);
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(SyncError::io("list archives", err)),
        };

        let mut files: Vec<PathBuf> = entries
            .filter_map(|entry| entry.ok().map(|entry| entry.path()))
            .filter(|path| {
                path.file_name()
                    .and_then(|name| name.to_str())
                    .is_some_and(|name| name.ends_with(MESSAGES_SUFFIX))
            })
            .collect();
        files.sort();
        Ok(files)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// File helpers
// ─────────────────────────────────────────────────────────────────────────────

fn file_timestamp() -> String {
    Utc::now().format("%Y%m%dT%H%M%S%3fZ").to_string()
}

fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let content = serde_json::to_string_pretty(value)
        .map_err(|err| SyncError::json(format!("serialize {}", path.display()), err))?;

    let parent = path
        .parent()
        .ok_or_else(|| SyncError::Config(format!("{} has no parent directory", path.display())))?;
    let mut temp_file =
        NamedTempFile::new_in(parent).map_err(|err| SyncError::io("create temp file", err))?;
    temp_file
        .write_all(content.as_bytes())
        .map_err(|err| SyncError::io("write temp file", err))?;
    temp_file
        .flush()
        .map_err(|err| SyncError::io("flush temp file", err))?;
    temp_file
        .persist(path)
        .map_err(|err| SyncError::io(format!("persist {}", path.display()), err.error))?;
    Ok(())
}

/// Reads and parses `path`. Missing files yield `None`; unparseable files
/// are quarantined and also yield `None`.
fn read_or_quarantine<T: DeserializeOwned>(path: &Path) -> Option<T> {
    let content = match fs::read(path) {
        Ok(content) => content,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return None,
        Err(err) => {
            tracing::warn!(error = %err, "Failed to read persisted file");
            return None;
        }
    };

    match serde_json::from_slice::<T>(&content) {
        Ok(value) => Some(value),
        Err(parse_err) => {
            match quarantine(path) {
                Ok(quarantined) => {
                    let err = SyncError::PersistenceCorruption {
                        original: path.to_path_buf(),
                        quarantined,
                    };
                    tracing::warn!(error = %err, cause = %parse_err, "Quarantined corrupt file");
                }
                Err(err) => {
                    tracing::error!(error = %err, cause = %parse_err, "Failed to quarantine corrupt file");
                }
            }
            None
        }
    }
}

fn quarantine(path: &Path) -> Result<PathBuf> {
    let name = path
        .file_name()
        .and_then(|name| name.to_str())
        .unwrap_or("unknown");
    let target = path.with_file_name(format!("{name}.corrupt-{}", file_timestamp()));
    fs::rename(path, &target).map_err(|err| SyncError::io("quarantine", err))?;
    Ok(target)
}
