//! Content-addressed configuration snapshots.
//!
//! Every successful mutating write snapshots the previous config bytes
//! into a backup directory. Snapshots are deduplicated by SHA-256
//! fingerprint, carry a `.meta.json` sidecar with the full record, and
//! are rotated so at most `max_count` survive.
//!
//! # Example
//!
//! ```
//! use orbit_backup::BackupStore;
//!
//! let dir = tempfile::tempdir().unwrap();
//! let store = BackupStore::new(dir.path().to_path_buf(), 10);
//!
//! let backup = store.create(br#"{"log":{}}"#, "manual").expect("create");
//! let again = store.create(br#"{"log":{}}"#, "manual").expect("dedup");
//! assert_eq!(backup.id, again.id);
//! ```

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

const BASE36: &[u8; 36] = b"0123456789abcdefghijklmnopqrstuvwxyz";
const SUFFIX_LEN: usize = 6;

/// Snapshot record persisted in the `.meta.json` sidecar.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Backup {
    /// Timestamp-prefixed identifier with a random base36 suffix.
    pub id: String,
    /// Hex SHA-256 over the exact snapshotted bytes.
    pub config_hash: String,
    /// Why the snapshot was taken, e.g. `before-create-inbound`.
    pub reason: String,
    /// Snapshot size in bytes.
    pub size: u64,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Data file name inside the backup directory.
    pub filename: String,
}

/// Directory of deduplicated, rotated configuration snapshots.
#[derive(Debug, Clone)]
pub struct BackupStore {
    dir: PathBuf,
    max_count: usize,
}

impl BackupStore {
    /// Create a store over `dir`, keeping at most `max_count` snapshots.
    pub fn new(dir: PathBuf, max_count: usize) -> Self {
        Self {
            dir,
            max_count: max_count.max(1),
        }
    }

    /// The backup directory.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Fingerprint content as hex SHA-256.
    pub fn fingerprint(content: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(content);
        hex::encode(hasher.finalize())
    }

    /// Snapshot `content` under `reason`.
    ///
    /// If a snapshot with the same fingerprint already exists, the
    /// existing record is returned unchanged and `reason` is discarded.
    pub fn create(&self, content: &[u8], reason: &str) -> Result<Backup> {
        let hash = Self::fingerprint(content);
        if let Some(existing) = self.list().into_iter().find(|b| b.config_hash == hash) {
            return Ok(existing);
        }

        std::fs::create_dir_all(&self.dir)
            .with_context(|| format!("failed to create backup dir {}", self.dir.display()))?;

        let id = new_backup_id();
        let filename = format!("config-{}.json", id);
        let backup = Backup {
            id: id.clone(),
            config_hash: hash,
            reason: reason.to_string(),
            size: content.len() as u64,
            created_at: Utc::now(),
            filename: filename.clone(),
        };

        let data_path = self.dir.join(&filename);
        std::fs::write(&data_path, content)
            .with_context(|| format!("failed to write backup {}", data_path.display()))?;

        let meta_path = self.meta_path(&id);
        let meta = serde_json::to_string_pretty(&backup)
            .context("failed to serialize backup metadata")?;
        std::fs::write(&meta_path, meta)
            .with_context(|| format!("failed to write backup metadata {}", meta_path.display()))?;

        self.rotate();
        Ok(backup)
    }

    /// All snapshot records, newest first. Corrupt sidecars are skipped.
    pub fn list(&self) -> Vec<Backup> {
        let mut backups = Vec::new();
        let entries = match std::fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(_) => return backups,
        };

        for entry in entries.flatten() {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if !name.starts_with("config-") || !name.ends_with(".meta.json") {
                continue;
            }
            match std::fs::read(entry.path())
                .map_err(anyhow::Error::from)
                .and_then(|bytes| serde_json::from_slice::<Backup>(&bytes).map_err(Into::into))
            {
                Ok(backup) => backups.push(backup),
                Err(e) => {
                    debug!(file = name, error = %e, "skipping unreadable backup metadata");
                }
            }
        }

        // Ties on created_at fall back to the id's random suffix so the
        // ordering is stable within one list call.
        backups.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        backups
    }

    /// Load a snapshot record; absent when the sidecar is missing or corrupt.
    pub fn get(&self, id: &str) -> Option<Backup> {
        let bytes = std::fs::read(self.meta_path(id)).ok()?;
        serde_json::from_slice(&bytes).ok()
    }

    /// Load a snapshot's bytes; absent when either file is missing.
    pub fn get_content(&self, id: &str) -> Option<Vec<u8>> {
        let backup = self.get(id)?;
        std::fs::read(self.dir.join(&backup.filename)).ok()
    }

    /// Remove a snapshot and its sidecar.
    ///
    /// Returns true iff the sidecar existed beforehand. Already-missing
    /// files are treated as deleted, so concurrent rotation races are
    /// no-ops for the loser.
    pub fn delete(&self, id: &str) -> bool {
        let meta_path = self.meta_path(id);
        let existed = meta_path.exists();

        let data_path = self.dir.join(format!("config-{}.json", id));
        if let Err(e) = std::fs::remove_file(&data_path)
            && e.kind() != std::io::ErrorKind::NotFound
        {
            warn!(id, error = %e, "failed to remove backup data file");
        }
        if let Err(e) = std::fs::remove_file(&meta_path)
            && e.kind() != std::io::ErrorKind::NotFound
        {
            warn!(id, error = %e, "failed to remove backup metadata");
            return false;
        }
        existed
    }

    /// Delete the oldest surplus snapshots past `max_count`.
    ///
    /// Invoked after every create; failures are logged and never fail
    /// the create that triggered them.
    fn rotate(&self) {
        let backups = self.list();
        if backups.len() <= self.max_count {
            return;
        }
        for backup in &backups[self.max_count..] {
            debug!(id = %backup.id, reason = %backup.reason, "rotating out old backup");
            self.delete(&backup.id);
        }
    }

    fn meta_path(&self, id: &str) -> PathBuf {
        self.dir.join(format!("config-{}.meta.json", id))
    }
}

/// `<ISO timestamp sans separators>_<6 random base36 chars>`.
fn new_backup_id() -> String {
    let stamp = Utc::now().format("%Y%m%dT%H%M%S%3fZ");
    let mut value = rand::random::<u64>();
    let mut suffix = String::with_capacity(SUFFIX_LEN);
    for _ in 0..SUFFIX_LEN {
        suffix.push(BASE36[(value % 36) as usize] as char);
        value /= 36;
    }
    format!("{}_{}", stamp, suffix)
}
