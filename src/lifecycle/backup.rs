//! Per-owner backup storage.
//!
//! Backups are pretty-printed JSON snapshots named
//! `backup_user<owner>_<timestamp>.json`. With `per_owner_subfolder` enabled each
//! owner gets `<root>/user_<owner>/`; otherwise every file shares `<root>` and the
//! owner id embedded in the filename is the only isolation. Listings and reads
//! always filter on that embedded id.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Duration, Utc};
use fs2::FileExt;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use super::{days_before, LifecycleError};
use crate::config::BackupConfig;
use crate::metrics;
use crate::model::{RecordId, Snapshot};
use crate::validation::{backup_filename, parse_backup_filename, BackupNameError};

const LOCK_FILE: &str = ".backup.lock";

/// Metadata for one backup file on disk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupFile {
    pub owner_id: RecordId,
    pub filename: String,
    pub created_at: DateTime<Utc>,
    pub size_bytes: u64,
    /// SHA256 of the file contents, lowercase hex
    pub checksum: String,
}

#[derive(Debug, Clone)]
pub struct BackupStorage {
    config: BackupConfig,
}

impl BackupStorage {
    pub fn new(config: BackupConfig) -> Self {
        Self { config }
    }

    pub fn root(&self) -> PathBuf {
        PathBuf::from(&self.config.root)
    }

    /// Directory holding `owner_id`'s backups. Depends on nothing but the id.
    pub fn owner_dir(&self, owner_id: RecordId) -> PathBuf {
        if self.config.per_owner_subfolder {
            self.root().join(format!("user_{}", owner_id))
        } else {
            self.root()
        }
    }

    /// Create the owner's backup directory if needed. Part of the write path,
    /// so failures are `BackupPersistFailed`.
    pub fn ensure_directory(&self, owner_id: RecordId) -> Result<PathBuf, LifecycleError> {
        let dir = self.owner_dir(owner_id);
        fs::create_dir_all(&dir).map_err(|source| LifecycleError::BackupPersistFailed {
            path: dir.clone(),
            source,
        })?;
        Ok(dir)
    }

    /// Persist `snapshot` as a new backup for `owner_id`, then apply retention.
    ///
    /// The file is written to a temp name and renamed into place while holding an
    /// exclusive lock on the owner directory. Names are strictly increasing per
    /// owner, so two writes in the same millisecond still get distinct names. Pruning failures are logged and never fail the write.
    pub fn write_backup(
        &self,
        owner_id: RecordId,
        snapshot: &Snapshot,
    ) -> Result<BackupFile, LifecycleError> {
        let dir = self.ensure_directory(owner_id)?;
        let persist_err = |source: io::Error| LifecycleError::BackupPersistFailed {
            path: dir.clone(),
            source,
        };

        let body = serde_json::to_vec_pretty(snapshot)
            .map_err(|e| persist_err(io::Error::new(io::ErrorKind::InvalidData, e)))?;
        let checksum = checksum_bytes(&body);

        let lock_file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(dir.join(LOCK_FILE))
            .map_err(persist_err)?;
        lock_file.lock_exclusive().map_err(persist_err)?;

        let mut created_at = truncate_to_millis(Utc::now());
        if let Some(latest) = latest_backup_time(&dir, owner_id).map_err(persist_err)? {
            if created_at <= latest {
                created_at = latest + Duration::milliseconds(1);
            }
        }
        let filename = backup_filename(owner_id, created_at);
        let path = dir.join(&filename);

        let tmp_path = dir.join(format!(".{}.tmp-{}", filename, std::process::id()));
        let written = write_then_rename(&tmp_path, &path, &body);
        if written.is_err() {
            let _ = fs::remove_file(&tmp_path);
        }
        written.map_err(persist_err)?;

        if let Ok(dir_file) = File::open(&dir) {
            let _ = dir_file.sync_all();
        }

        match self.prune(owner_id, &dir, &filename) {
            Ok(0) => {}
            Ok(pruned) => info!("Pruned {} old backups for owner #{}", pruned, owner_id),
            Err(e) => warn!("Backup retention for owner #{} failed: {}", owner_id, e),
        }
        drop(lock_file);

        metrics::inc_backup_written();
        info!(
            "Wrote backup {} for owner #{} ({} bytes)",
            filename,
            owner_id,
            body.len()
        );
        Ok(BackupFile {
            owner_id,
            filename,
            created_at,
            size_bytes: body.len() as u64,
            checksum,
        })
    }

    /// `owner_id`'s backups, newest first. A missing directory lists as empty.
    pub fn list_backups(&self, owner_id: RecordId) -> Result<Vec<BackupFile>, LifecycleError> {
        let dir = self.owner_dir(owner_id);
        let mut files = scan_dir(&dir, Some(owner_id))?;
        sort_newest_first(&mut files);
        Ok(files)
    }

    /// Every owner's backups, newest first. Administrative use only.
    pub fn list_all_backups(&self) -> Result<Vec<BackupFile>, LifecycleError> {
        let root = self.root();
        let mut files = Vec::new();
        if self.config.per_owner_subfolder {
            let entries = match fs::read_dir(&root) {
                Ok(entries) => entries,
                Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(files),
                Err(source) => {
                    return Err(LifecycleError::BackupStorageUnavailable { path: root, source })
                }
            };
            for entry in entries.flatten() {
                let name = entry.file_name();
                let Some(owner_id) = name
                    .to_str()
                    .and_then(|n| n.strip_prefix("user_"))
                    .and_then(|id| id.parse::<RecordId>().ok())
                else {
                    continue;
                };
                files.extend(scan_dir(&entry.path(), Some(owner_id))?);
            }
        } else {
            files = scan_dir(&root, None)?;
        }
        sort_newest_first(&mut files);
        Ok(files)
    }

    /// Load one of `owner_id`'s backups.
    ///
    /// Malformed names, traversal attempts and names belonging to another owner
    /// all report `BackupNotFound`; the latter two are also logged to the
    /// security target.
    pub fn read_backup(&self, owner_id: RecordId, filename: &str) -> Result<Snapshot, LifecycleError> {
        let path = self.resolve(owner_id, filename)?;
        let body = match fs::read(&path) {
            Ok(body) => body,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(LifecycleError::BackupNotFound {
                    filename: filename.to_string(),
                })
            }
            Err(source) => return Err(LifecycleError::BackupStorageUnavailable { path, source }),
        };

        let snapshot: Snapshot =
            serde_json::from_slice(&body).map_err(|e| LifecycleError::BackupCorrupt {
                filename: filename.to_string(),
                reason: e.to_string(),
            })?;
        if !snapshot.has_supported_version() {
            return Err(LifecycleError::InvalidSnapshotFormat(format!(
                "unsupported snapshot version '{}' in {}",
                snapshot.metadata.version, filename
            )));
        }
        debug!("Read backup {} for owner #{}", filename, owner_id);
        Ok(snapshot)
    }

    /// Remove one of `owner_id`'s backups.
    pub fn delete_backup(&self, owner_id: RecordId, filename: &str) -> Result<(), LifecycleError> {
        let path = self.resolve(owner_id, filename)?;
        match fs::remove_file(&path) {
            Ok(()) => {
                info!("Deleted backup {} for owner #{}", filename, owner_id);
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Err(LifecycleError::BackupNotFound {
                filename: filename.to_string(),
            }),
            Err(source) => Err(LifecycleError::BackupPersistFailed { path, source }),
        }
    }

    /// Map a caller-supplied filename to a path inside the owner's directory.
    fn resolve(&self, owner_id: RecordId, filename: &str) -> Result<PathBuf, LifecycleError> {
        let not_found = || LifecycleError::BackupNotFound {
            filename: filename.to_string(),
        };
        let name = match parse_backup_filename(filename) {
            Ok(name) => name,
            Err(e) => {
                if e == BackupNameError::PathTraversal {
                    warn!(
                        target: "security",
                        "Rejected backup path traversal attempt by owner #{}: {:?}",
                        owner_id, filename
                    );
                }
                return Err(not_found());
            }
        };
        if name.owner_id != owner_id {
            warn!(
                target: "security",
                "Owner #{} asked for backup {} of owner #{}",
                owner_id, filename, name.owner_id
            );
            return Err(not_found());
        }
        Ok(self.owner_dir(owner_id).join(filename))
    }

    /// Delete backups beyond the count limit or older than the age limit.
    /// `keep` (the file just written) is never deleted.
    fn prune(&self, owner_id: RecordId, dir: &Path, keep: &str) -> io::Result<usize> {
        let max = self.config.max_backups_per_user;
        // a horizon beyond chrono's range keeps everything
        let cutoff = (self.config.retention_days > 0)
            .then(|| days_before(Utc::now(), self.config.retention_days))
            .flatten();
        if max == 0 && cutoff.is_none() {
            return Ok(0);
        }

        let mut names = owner_backup_names(dir, owner_id)?;
        names.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| b.0.cmp(&a.0)));

        let mut pruned = 0;
        for (index, (filename, created_at)) in names.iter().enumerate() {
            if filename == keep {
                continue;
            }
            let over_count = max > 0 && index >= max;
            let too_old = cutoff.map_or(false, |cutoff| *created_at < cutoff);
            if over_count || too_old {
                fs::remove_file(dir.join(filename))?;
                metrics::inc_backup_pruned();
                debug!("Pruned backup {}", filename);
                pruned += 1;
            }
        }
        Ok(pruned)
    }
}

fn write_then_rename(tmp_path: &Path, path: &Path, body: &[u8]) -> io::Result<()> {
    let mut tmp = OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(tmp_path)?;
    tmp.write_all(body)?;
    tmp.flush()?;
    tmp.sync_all()?;
    fs::rename(tmp_path, path)
}

/// Backup files in `dir`, optionally restricted to one embedded owner id.
fn scan_dir(dir: &Path, owner: Option<RecordId>) -> Result<Vec<BackupFile>, LifecycleError> {
    let unavailable = |source: io::Error| LifecycleError::BackupStorageUnavailable {
        path: dir.to_path_buf(),
        source,
    };
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(source) => return Err(unavailable(source)),
    };

    let mut files = Vec::new();
    for entry in entries {
        let entry = entry.map_err(unavailable)?;
        let Some(filename) = entry.file_name().to_str().map(str::to_string) else {
            continue;
        };
        let Ok(name) = parse_backup_filename(&filename) else {
            continue;
        };
        if owner.map_or(false, |owner| owner != name.owner_id) {
            continue;
        }
        let path = entry.path();
        let metadata = entry.metadata().map_err(unavailable)?;
        if !metadata.is_file() {
            continue;
        }
        files.push(BackupFile {
            owner_id: name.owner_id,
            filename,
            created_at: name.created_at,
            size_bytes: metadata.len(),
            checksum: calculate_checksum(&path).map_err(unavailable)?,
        });
    }
    Ok(files)
}

/// Names and timestamps of `owner_id`'s backups in `dir`, read from the
/// filenames alone. File contents are never opened.
fn owner_backup_names(dir: &Path, owner_id: RecordId) -> io::Result<Vec<(String, DateTime<Utc>)>> {
    let mut names = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let Some(filename) = entry.file_name().to_str().map(str::to_string) else {
            continue;
        };
        let Ok(name) = parse_backup_filename(&filename) else {
            continue;
        };
        if name.owner_id != owner_id || !entry.file_type()?.is_file() {
            continue;
        }
        names.push((filename, name.created_at));
    }
    Ok(names)
}

/// Newest timestamp among `owner_id`'s backup names in `dir`.
fn latest_backup_time(dir: &Path, owner_id: RecordId) -> io::Result<Option<DateTime<Utc>>> {
    Ok(owner_backup_names(dir, owner_id)?
        .into_iter()
        .map(|(_, created_at)| created_at)
        .max())
}

fn sort_newest_first(files: &mut [BackupFile]) {
    files.sort_by(|a, b| {
        b.created_at
            .cmp(&a.created_at)
            .then_with(|| b.filename.cmp(&a.filename))
    });
}

fn truncate_to_millis(at: DateTime<Utc>) -> DateTime<Utc> {
    let millis = at.timestamp_millis();
    DateTime::from_timestamp_millis(millis).unwrap_or(at)
}

/// Calculate SHA256 checksum of a file
fn calculate_checksum(path: &Path) -> io::Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buffer = vec![0; 8192];

    loop {
        let n = file.read(&mut buffer)?;
        if n == 0 {
            break;
        }
        hasher.update(&buffer[..n]);
    }

    Ok(format!("{:x}", hasher.finalize()))
}

fn checksum_bytes(bytes: &[u8]) -> String {
    format!("{:x}", Sha256::digest(bytes))
}
