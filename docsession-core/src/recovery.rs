//! Temp snapshot recovery.
//!
//! Every snapshot written by the disconnect policy has a JSON sidecar next to
//! it (`<snapshot>.meta.json`). The pair is the unit of existence: it is
//! listed, recovered and deleted together. Snapshots live in one directory
//! per owner bucket under the configured temp directory.
//!
//! Writes of the two files are not atomic. A crash in between leaves either
//! an orphan snapshot (removed by the mtime-based orphan sweep) or a sidecar
//! without a snapshot (hidden from listings, removed on expiry).

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use chrono::{DateTime, TimeDelta, Utc};
use docsession_types::{DocumentType, Identity, IsolationMode, SessionId};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::config::{is_valid_temp_prefix, SessionConfig};
use crate::error::{Result, SessionError};
use crate::identity::can_access;

/// Suffix appended to a snapshot path to name its sidecar.
pub const SIDECAR_SUFFIX: &str = ".meta.json";

const NOT_FOUND_MESSAGE: &str = "no recoverable session found";

/// Sidecar metadata describing one snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecoveryEntry {
    pub session_id: SessionId,
    pub original_path: PathBuf,
    pub temp_path: PathBuf,
    pub document_type: DocumentType,
    pub saved_at: DateTime<Utc>,
    pub prompt_on_reconnect: bool,
    pub owner_group_id: Option<String>,
    pub owner_user_id: Option<String>,
}

impl RecoveryEntry {
    pub fn owner(&self) -> Identity {
        Identity::new(self.owner_group_id.clone(), self.owner_user_id.clone())
    }
}

/// Path of the sidecar belonging to `snapshot`.
pub fn sidecar_path(snapshot: &Path) -> PathBuf {
    let mut os = snapshot.as_os_str().to_owned();
    os.push(SIDECAR_SUFFIX);
    PathBuf::from(os)
}

/// Path of the snapshot a sidecar describes, if `sidecar` is one.
pub fn snapshot_path(sidecar: &Path) -> Option<PathBuf> {
    let name = sidecar.file_name()?.to_str()?;
    let stem = name.strip_suffix(SIDECAR_SUFFIX)?;
    Some(sidecar.with_file_name(stem))
}

/// Serialize `entry` next to its snapshot as pretty-printed UTF-8 JSON.
pub fn write_snapshot_metadata(entry: &RecoveryEntry) -> Result<PathBuf> {
    let path = sidecar_path(&entry.temp_path);
    let json = serde_json::to_vec_pretty(entry).map_err(|e| SessionError::MetadataCorrupt {
        path: path.clone(),
        reason: e.to_string(),
    })?;
    fs::write(&path, json)?;
    Ok(path)
}

/// Parse a sidecar. Unreadable or malformed files are `MetadataCorrupt`.
pub fn read_sidecar(path: &Path) -> Result<RecoveryEntry> {
    let raw = fs::read(path).map_err(|e| SessionError::MetadataCorrupt {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })?;
    serde_json::from_slice(&raw).map_err(|e| SessionError::MetadataCorrupt {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })
}

// =============================================================================
// Results
// =============================================================================

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CleanupReport {
    /// Sidecars examined.
    pub scanned: usize,
    /// Snapshot + sidecar pairs removed (expired or corrupt).
    pub deleted: usize,
    /// Snapshots without a sidecar removed by the orphan sweep.
    pub orphans_deleted: usize,
    pub errors: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct RecoverableFileInfo {
    pub session_id: SessionId,
    pub original_path: PathBuf,
    pub temp_path: PathBuf,
    pub document_type: DocumentType,
    pub saved_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub prompt_on_reconnect: bool,
    pub size_bytes: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct RecoverResult {
    pub success: bool,
    pub message: String,
    pub session_id: SessionId,
    pub restored_path: Option<PathBuf>,
    pub document_type: Option<DocumentType>,
}

impl RecoverResult {
    fn failed(session_id: &SessionId, message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
            session_id: session_id.clone(),
            restored_path: None,
            document_type: None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct DeleteResult {
    pub success: bool,
    pub message: String,
    pub deleted: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RecoveryStats {
    pub total_count: usize,
    pub total_size_bytes: u64,
    pub expired_count: usize,
}

// =============================================================================
// Store
// =============================================================================

/// Scans, expires, lists and restores temp snapshots.
///
/// All methods do blocking filesystem work; async callers should run them
/// on the blocking pool (see [`RecoveryStore::spawn_cleanup`]).
#[derive(Debug, Clone)]
pub struct RecoveryStore {
    temp_dir: PathBuf,
    temp_prefix: String,
    retention: TimeDelta,
    isolation_mode: IsolationMode,
}

impl RecoveryStore {
    pub fn new(config: &SessionConfig) -> Self {
        Self {
            temp_dir: config.temp_dir.clone(),
            temp_prefix: config.temp_prefix.clone(),
            retention: config.retention(),
            isolation_mode: config.isolation_mode,
        }
    }

    pub fn temp_dir(&self) -> &Path {
        &self.temp_dir
    }

    fn cutoff(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        now.checked_sub_signed(self.retention)
    }

    fn expires_at(&self, saved_at: DateTime<Utc>) -> DateTime<Utc> {
        saved_at
            .checked_add_signed(self.retention)
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }

    fn is_expired(&self, saved_at: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        self.cutoff(now).is_some_and(|cutoff| saved_at < cutoff)
    }

    /// Files under the temp directory carrying our prefix: `(path, name)`.
    fn owned_files(&self) -> Vec<(PathBuf, String)> {
        if !is_valid_temp_prefix(&self.temp_prefix) {
            warn!(prefix = %self.temp_prefix, "refusing to scan temp dir with unsafe prefix");
            return Vec::new();
        }
        if !self.temp_dir.is_dir() {
            return Vec::new();
        }
        WalkDir::new(&self.temp_dir)
            .max_depth(2)
            .into_iter()
            .filter_map(|entry| match entry {
                Ok(e) => Some(e),
                Err(err) => {
                    debug!(?err, "skipping unreadable temp entry");
                    None
                }
            })
            .filter(|e| e.file_type().is_file())
            .filter_map(|e| {
                let name = e.file_name().to_str()?.to_string();
                name.starts_with(&self.temp_prefix)
                    .then(|| (e.into_path(), name))
            })
            .collect()
    }

    fn sidecars(&self) -> Vec<PathBuf> {
        self.owned_files()
            .into_iter()
            .filter(|(_, name)| name.ends_with(SIDECAR_SUFFIX))
            .map(|(path, _)| path)
            .collect()
    }

    /// Sidecars whose file name belongs to `session_id`, readable or not.
    fn sidecars_for(&self, session_id: &SessionId) -> Vec<PathBuf> {
        let stem = format!("{}{}_", self.temp_prefix, session_id);
        self.owned_files()
            .into_iter()
            .filter(|(_, name)| name.ends_with(SIDECAR_SUFFIX) && name.starts_with(&stem))
            .map(|(path, _)| path)
            .collect()
    }

    /// Remove a snapshot + sidecar pair. A missing snapshot is not an error.
    fn delete_pair(sidecar: &Path) -> io::Result<()> {
        if let Some(snapshot) = snapshot_path(sidecar) {
            match fs::remove_file(&snapshot) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(e),
            }
        }
        fs::remove_file(sidecar)
    }

    fn modified(path: &Path) -> Option<SystemTime> {
        fs::metadata(path).and_then(|m| m.modified()).ok()
    }

    // -------------------------------------------------------------------------
    // Cleanup
    // -------------------------------------------------------------------------

    pub fn cleanup_expired_files(&self) -> CleanupReport {
        self.cleanup_expired_files_at(Utc::now())
    }

    /// Delete expired or corrupt pairs, then orphan snapshots older than the
    /// retention cutoff. Individual failures are counted, never fatal.
    pub fn cleanup_expired_files_at(&self, now: DateTime<Utc>) -> CleanupReport {
        let mut report = CleanupReport::default();

        for sidecar in self.sidecars() {
            report.scanned += 1;
            let expired = match read_sidecar(&sidecar) {
                Ok(entry) => self.is_expired(entry.saved_at, now),
                Err(err) => {
                    warn!(path = %sidecar.display(), %err, "removing corrupt recovery metadata");
                    true
                }
            };
            if !expired {
                continue;
            }
            match Self::delete_pair(&sidecar) {
                Ok(()) => report.deleted += 1,
                Err(err) => {
                    warn!(path = %sidecar.display(), %err, "failed to delete expired snapshot");
                    report.errors += 1;
                }
            }
        }

        let Some(cutoff) = self.cutoff(now) else {
            return report;
        };
        let cutoff: SystemTime = cutoff.into();
        for (path, name) in self.owned_files() {
            if name.ends_with(SIDECAR_SUFFIX) || sidecar_path(&path).exists() {
                continue;
            }
            let Some(mtime) = Self::modified(&path) else {
                report.errors += 1;
                continue;
            };
            if mtime >= cutoff {
                continue;
            }
            match fs::remove_file(&path) {
                Ok(()) => {
                    debug!(path = %path.display(), "removed orphan snapshot");
                    report.orphans_deleted += 1;
                }
                Err(err) => {
                    warn!(path = %path.display(), %err, "failed to delete orphan snapshot");
                    report.errors += 1;
                }
            }
        }

        report
    }

    // -------------------------------------------------------------------------
    // Listing
    // -------------------------------------------------------------------------

    /// Snapshots `requestor` may recover, newest first.
    pub fn list_recoverable_files(&self, requestor: &Identity) -> Vec<RecoverableFileInfo> {
        let mut files: Vec<RecoverableFileInfo> = self
            .sidecars()
            .into_iter()
            .filter_map(|sidecar| {
                let entry = read_sidecar(&sidecar).ok()?;
                if !can_access(requestor, &entry.owner(), self.isolation_mode) {
                    return None;
                }
                let snapshot = snapshot_path(&sidecar)?;
                let size_bytes = fs::metadata(&snapshot).ok()?.len();
                Some(RecoverableFileInfo {
                    expires_at: self.expires_at(entry.saved_at),
                    session_id: entry.session_id,
                    original_path: entry.original_path,
                    temp_path: snapshot,
                    document_type: entry.document_type,
                    saved_at: entry.saved_at,
                    prompt_on_reconnect: entry.prompt_on_reconnect,
                    size_bytes,
                })
            })
            .collect();
        files.sort_by(|a, b| b.saved_at.cmp(&a.saved_at));
        files
    }

    // -------------------------------------------------------------------------
    // Recovery
    // -------------------------------------------------------------------------

    /// Copy the newest snapshot of `session_id` that `requestor` may see to
    /// `target_path` (or its original path). Denied and unknown sessions are
    /// indistinguishable.
    pub fn recover_session(
        &self,
        session_id: &SessionId,
        requestor: &Identity,
        target_path: Option<&Path>,
        delete_after_recover: bool,
    ) -> RecoverResult {
        let newest = self
            .sidecars_for(session_id)
            .into_iter()
            .filter_map(|sidecar| {
                let entry = read_sidecar(&sidecar).ok()?;
                if &entry.session_id != session_id {
                    return None;
                }
                if !can_access(requestor, &entry.owner(), self.isolation_mode) {
                    debug!(session = %session_id, requestor = %requestor, "recovery denied");
                    return None;
                }
                let snapshot = snapshot_path(&sidecar)?;
                let mtime = Self::modified(&snapshot)
                    .or_else(|| Self::modified(&sidecar))
                    .unwrap_or(SystemTime::UNIX_EPOCH);
                Some((mtime, sidecar, snapshot, entry))
            })
            .max_by_key(|(mtime, ..)| *mtime);

        let Some((_, sidecar, snapshot, entry)) = newest else {
            return RecoverResult::failed(session_id, NOT_FOUND_MESSAGE);
        };
        if !snapshot.is_file() {
            let err = SessionError::SnapshotMissing(snapshot);
            return RecoverResult::failed(session_id, err.to_string());
        }

        let target = target_path
            .map(Path::to_path_buf)
            .unwrap_or_else(|| entry.original_path.clone());
        if let Err(err) = copy_snapshot(&snapshot, &target) {
            warn!(session = %session_id, %err, "recovery copy failed");
            return RecoverResult::failed(session_id, format!("failed to restore snapshot: {err}"));
        }

        let mut message = format!("restored to {}", target.display());
        if delete_after_recover {
            if let Err(err) = Self::delete_pair(&sidecar) {
                warn!(session = %session_id, %err, "failed to remove recovered snapshot");
                message.push_str(&format!(" (snapshot not removed: {err})"));
            }
        }

        info!(session = %session_id, target = %target.display(), "session recovered");
        RecoverResult {
            success: true,
            message,
            session_id: session_id.clone(),
            restored_path: Some(target),
            document_type: Some(entry.document_type),
        }
    }

    /// Delete every pair for `session_id` the requestor may delete.
    ///
    /// Corrupt sidecars matching the id are always removed.
    pub fn delete_temp_session(&self, session_id: &SessionId, requestor: &Identity) -> DeleteResult {
        let mut deleted = 0;
        let mut failures = Vec::new();

        for sidecar in self.sidecars_for(session_id) {
            let eligible = match read_sidecar(&sidecar) {
                Ok(entry) => {
                    &entry.session_id == session_id
                        && can_access(requestor, &entry.owner(), self.isolation_mode)
                }
                Err(_) => true,
            };
            if !eligible {
                continue;
            }
            match Self::delete_pair(&sidecar) {
                Ok(()) => deleted += 1,
                Err(err) => failures.push(err.to_string()),
            }
        }

        if !failures.is_empty() {
            return DeleteResult {
                success: false,
                message: format!("failed to delete snapshot: {}", failures.join("; ")),
                deleted,
            };
        }
        if deleted == 0 {
            return DeleteResult {
                success: false,
                message: NOT_FOUND_MESSAGE.to_string(),
                deleted,
            };
        }
        DeleteResult {
            success: true,
            message: format!("deleted {deleted} snapshot(s)"),
            deleted,
        }
    }

    /// Best-effort totals; unreadable entries are skipped or counted expired.
    pub fn stats(&self) -> RecoveryStats {
        let now = Utc::now();
        let mut stats = RecoveryStats::default();
        for sidecar in self.sidecars() {
            stats.total_count += 1;
            if let Some(len) = snapshot_path(&sidecar)
                .and_then(|p| fs::metadata(p).ok())
                .map(|m| m.len())
            {
                stats.total_size_bytes += len;
            }
            match read_sidecar(&sidecar) {
                Ok(entry) if !self.is_expired(entry.saved_at, now) => {}
                _ => stats.expired_count += 1,
            }
        }
        stats
    }

    // -------------------------------------------------------------------------
    // Background sweep
    // -------------------------------------------------------------------------

    /// Run a cleanup now and then every `interval` until `token` fires.
    pub fn spawn_cleanup(self: Arc<Self>, interval: Duration, token: CancellationToken) -> JoinHandle<()> {
        info!(
            dir = %self.temp_dir.display(),
            interval_secs = interval.as_secs(),
            "starting recovery cleanup task"
        );
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        let store = self.clone();
                        match tokio::task::spawn_blocking(move || store.cleanup_expired_files()).await {
                            Ok(report) if report.deleted + report.orphans_deleted + report.errors > 0 => {
                                info!(?report, "recovery cleanup finished");
                            }
                            Ok(report) => debug!(?report, "recovery cleanup finished"),
                            Err(err) => warn!(%err, "recovery cleanup task failed"),
                        }
                    }
                }
            }
            debug!("recovery cleanup task stopped");
        })
    }
}

fn copy_snapshot(snapshot: &Path, target: &Path) -> io::Result<()> {
    if let Some(parent) = target.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    fs::copy(snapshot, target)?;
    Ok(())
}
