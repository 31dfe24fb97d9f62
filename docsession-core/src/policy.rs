//! What happens to unsaved work when a session is relinquished without an
//! explicit close.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use docsession_types::{DisconnectBehavior, IsolationMode};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::SessionConfig;
use crate::error::Result;
use crate::handle::SessionHandle;
use crate::identity::storage_key;
use crate::recovery::{write_snapshot_metadata, RecoveryEntry};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum DisconnectReason {
    IdleTimeout,
    ClientDisconnect,
    Shutdown,
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            DisconnectReason::IdleTimeout => "idle-timeout",
            DisconnectReason::ClientDisconnect => "client-disconnect",
            DisconnectReason::Shutdown => "shutdown",
        })
    }
}

/// Result of applying the policy to one handle.
#[derive(Debug, Clone, PartialEq)]
pub enum PolicyOutcome {
    /// Nothing unsaved.
    Clean,
    /// Someone else tore the handle down first.
    AlreadyDisposed,
    Discarded,
    AutoSaved(PathBuf),
    Snapshot(RecoveryEntry),
}

#[derive(Debug, Clone)]
pub struct DisconnectPolicy {
    behavior: DisconnectBehavior,
    isolation_mode: IsolationMode,
    temp_dir: PathBuf,
    temp_prefix: String,
}

impl DisconnectPolicy {
    pub fn from_config(config: &SessionConfig) -> Self {
        Self {
            behavior: config.disconnect_behavior,
            isolation_mode: config.isolation_mode,
            temp_dir: config.temp_dir.clone(),
            temp_prefix: config.temp_prefix.clone(),
        }
    }

    pub fn behavior(&self) -> DisconnectBehavior {
        self.behavior
    }

    /// Snapshot location for `handle` saved at `at`.
    pub fn snapshot_path(&self, handle: &SessionHandle, at: DateTime<Utc>) -> PathBuf {
        let bucket = storage_key(handle.owner(), self.isolation_mode);
        let ext = handle
            .source_path()
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| format!(".{e}"))
            .unwrap_or_default();
        let name = format!(
            "{}{}_{}{}",
            self.temp_prefix,
            handle.id(),
            at.format("%Y%m%d%H%M%S"),
            ext
        );
        self.temp_dir.join(bucket).join(name)
    }

    /// Apply the configured behavior, then dispose the handle.
    ///
    /// Disposal happens on every path, including errors.
    pub async fn apply(&self, handle: &SessionHandle, reason: DisconnectReason) -> Result<PolicyOutcome> {
        let outcome = self.apply_behavior(handle, reason).await;
        handle.dispose().await;
        outcome
    }

    async fn apply_behavior(&self, handle: &SessionHandle, reason: DisconnectReason) -> Result<PolicyOutcome> {
        let guard = match handle.lock().await {
            Ok(guard) => guard,
            Err(_) if handle.is_disposed() => return Ok(PolicyOutcome::AlreadyDisposed),
            Err(e) => return Err(e),
        };
        if !guard.is_dirty() {
            return Ok(PolicyOutcome::Clean);
        }

        match self.behavior {
            DisconnectBehavior::Discard => {
                info!(session = %handle.id(), %reason, "discarding unsaved changes");
                Ok(PolicyOutcome::Discarded)
            }
            DisconnectBehavior::AutoSave if handle.mode().is_readonly() => {
                warn!(
                    session = %handle.id(),
                    %reason,
                    "read-only session has unsaved changes; discarding instead of auto-saving"
                );
                Ok(PolicyOutcome::Discarded)
            }
            DisconnectBehavior::AutoSave => {
                let target = handle.source_path().to_path_buf();
                let out = target.clone();
                let (guard, ()) = guard.blocking(move |doc| Ok(doc.save(&out)?)).await?;
                guard.mark_clean();
                info!(session = %handle.id(), %reason, path = %target.display(), "auto-saved session");
                Ok(PolicyOutcome::AutoSaved(target))
            }
            DisconnectBehavior::SaveToTemp | DisconnectBehavior::PromptOnReconnect => {
                let saved_at = Utc::now();
                let temp_path = self.snapshot_path(handle, saved_at);
                let entry = RecoveryEntry {
                    session_id: handle.id().clone(),
                    original_path: handle.source_path().to_path_buf(),
                    temp_path,
                    document_type: handle.document_type(),
                    saved_at,
                    prompt_on_reconnect: self.behavior == DisconnectBehavior::PromptOnReconnect,
                    owner_group_id: handle.owner().group_id().map(str::to_string),
                    owner_user_id: handle.owner().user_id().map(str::to_string),
                };
                let pending = entry.clone();
                let (guard, sidecar) = guard
                    .blocking(move |doc| {
                        ensure_parent(&pending.temp_path)?;
                        doc.save(&pending.temp_path)?;
                        write_snapshot_metadata(&pending)
                    })
                    .await?;
                guard.mark_clean();
                debug!(sidecar = %sidecar.display(), "wrote recovery metadata");
                info!(
                    session = %handle.id(),
                    %reason,
                    snapshot = %entry.temp_path.display(),
                    "saved session snapshot"
                );
                Ok(PolicyOutcome::Snapshot(entry))
            }
        }
    }
}

fn ensure_parent(path: &Path) -> std::io::Result<()> {
    match path.parent() {
        Some(parent) => fs::create_dir_all(parent),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::BytesDocument;
    use crate::recovery::sidecar_path;
    use docsession_types::{AccessMode, DocumentType, Identity};
    use tempfile::TempDir;

    struct Fixture {
        dir: TempDir,
        source: PathBuf,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("report.docx");
        fs::write(&source, b"original").unwrap();
        Fixture { dir, source }
    }

    fn policy(fx: &Fixture, behavior: DisconnectBehavior, isolation: IsolationMode) -> DisconnectPolicy {
        DisconnectPolicy::from_config(&SessionConfig {
            disconnect_behavior: behavior,
            isolation_mode: isolation,
            temp_dir: fx.dir.path().join("temp"),
            ..SessionConfig::default()
        })
    }

    fn handle(fx: &Fixture, mode: AccessMode, owner: Identity) -> SessionHandle {
        let doc = BytesDocument::new(DocumentType::Word, b"original".to_vec());
        SessionHandle::open(&fx.source, mode, DocumentType::Word, Box::new(doc), owner)
    }

    async fn edit(h: &SessionHandle) {
        h.execute_mut(|doc| {
            doc.as_any_mut()
                .downcast_mut::<BytesDocument>()
                .unwrap()
                .set_bytes(b"edited".to_vec())
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_clean_handle_is_noop_but_disposed() {
        let fx = fixture();
        let h = handle(&fx, AccessMode::ReadWrite, Identity::anonymous());
        let p = policy(&fx, DisconnectBehavior::SaveToTemp, IsolationMode::None);

        let outcome = p.apply(&h, DisconnectReason::IdleTimeout).await.unwrap();
        assert_eq!(outcome, PolicyOutcome::Clean);
        assert!(h.is_disposed());
        assert!(!fx.dir.path().join("temp").exists());
    }

    #[tokio::test]
    async fn test_discard_leaves_source_untouched() {
        let fx = fixture();
        let h = handle(&fx, AccessMode::ReadWrite, Identity::anonymous());
        edit(&h).await;
        let p = policy(&fx, DisconnectBehavior::Discard, IsolationMode::None);

        let outcome = p.apply(&h, DisconnectReason::ClientDisconnect).await.unwrap();
        assert_eq!(outcome, PolicyOutcome::Discarded);
        assert_eq!(fs::read(&fx.source).unwrap(), b"original");
        assert_eq!(h.teardowns(), 1);
    }

    #[tokio::test]
    async fn test_auto_save_writes_source() {
        let fx = fixture();
        let h = handle(&fx, AccessMode::ReadWrite, Identity::anonymous());
        edit(&h).await;
        let p = policy(&fx, DisconnectBehavior::AutoSave, IsolationMode::None);

        let outcome = p.apply(&h, DisconnectReason::Shutdown).await.unwrap();
        assert_eq!(outcome, PolicyOutcome::AutoSaved(fx.source.clone()));
        assert_eq!(fs::read(&fx.source).unwrap(), b"edited");
    }

    #[tokio::test]
    async fn test_auto_save_on_readonly_discards() {
        let fx = fixture();
        let h = handle(&fx, AccessMode::ReadOnly, Identity::anonymous());
        edit(&h).await;
        let p = policy(&fx, DisconnectBehavior::AutoSave, IsolationMode::None);

        let outcome = p.apply(&h, DisconnectReason::Shutdown).await.unwrap();
        assert_eq!(outcome, PolicyOutcome::Discarded);
        assert_eq!(fs::read(&fx.source).unwrap(), b"original");
    }

    #[tokio::test]
    async fn test_save_to_temp_writes_pair_in_owner_bucket() {
        let fx = fixture();
        let owner = Identity::user("group-a", "alice");
        let h = handle(&fx, AccessMode::ReadWrite, owner.clone());
        edit(&h).await;
        let p = policy(&fx, DisconnectBehavior::SaveToTemp, IsolationMode::Group);

        let outcome = p.apply(&h, DisconnectReason::IdleTimeout).await.unwrap();
        let PolicyOutcome::Snapshot(entry) = outcome else {
            panic!("expected snapshot");
        };
        assert!(!entry.prompt_on_reconnect);
        assert_eq!(entry.owner(), owner);
        assert_eq!(entry.original_path, fx.source);

        let bucket = storage_key(&owner, IsolationMode::Group);
        assert_eq!(entry.temp_path.parent().unwrap(), fx.dir.path().join("temp").join(bucket));
        let name = entry.temp_path.file_name().unwrap().to_str().unwrap();
        assert!(name.starts_with(&format!("docsession_{}_", h.id())));
        assert!(name.ends_with(".docx"));

        assert_eq!(fs::read(&entry.temp_path).unwrap(), b"edited");
        assert!(sidecar_path(&entry.temp_path).exists());
        assert_eq!(fs::read(&fx.source).unwrap(), b"original");
    }

    #[tokio::test]
    async fn test_prompt_on_reconnect_flags_entry() {
        let fx = fixture();
        let h = handle(&fx, AccessMode::ReadWrite, Identity::anonymous());
        edit(&h).await;
        let p = policy(&fx, DisconnectBehavior::PromptOnReconnect, IsolationMode::None);

        let PolicyOutcome::Snapshot(entry) = p.apply(&h, DisconnectReason::ClientDisconnect).await.unwrap()
        else {
            panic!("expected snapshot");
        };
        assert!(entry.prompt_on_reconnect);
        assert!(entry.temp_path.starts_with(fx.dir.path().join("temp").join("__anonymous__")));
    }

    #[tokio::test]
    async fn test_failed_save_still_disposes() {
        let fx = fixture();
        let h = handle(&fx, AccessMode::ReadWrite, Identity::anonymous());
        edit(&h).await;
        // A regular file where the temp directory should be.
        fs::write(fx.dir.path().join("temp"), b"blocker").unwrap();
        let p = policy(&fx, DisconnectBehavior::SaveToTemp, IsolationMode::None);

        assert!(p.apply(&h, DisconnectReason::IdleTimeout).await.is_err());
        assert!(h.is_disposed());
    }

    #[tokio::test]
    async fn test_already_disposed() {
        let fx = fixture();
        let h = handle(&fx, AccessMode::ReadWrite, Identity::anonymous());
        edit(&h).await;
        assert!(h.dispose().await);
        let p = policy(&fx, DisconnectBehavior::AutoSave, IsolationMode::None);

        let outcome = p.apply(&h, DisconnectReason::Shutdown).await.unwrap();
        assert_eq!(outcome, PolicyOutcome::AlreadyDisposed);
        assert_eq!(h.teardowns(), 1);
    }
}
