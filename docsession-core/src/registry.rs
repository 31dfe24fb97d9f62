//! Process-wide map of resident sessions.
//!
//! Removal from the map is the single point that decides who tears a handle
//! down: whichever path (close, idle sweep, client disconnect, shutdown)
//! removes the entry runs the disposal for it, and every other path sees the
//! session as gone.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use docsession_types::{AccessMode, DocumentType, Identity, SessionId};
use serde::Serialize;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::SessionConfig;
use crate::engine::DocumentEngine;
use crate::error::{Result, SessionError};
use crate::handle::{SessionHandle, SessionStatus};
use crate::identity::can_access;
use crate::policy::{DisconnectPolicy, DisconnectReason, PolicyOutcome};

const EVENT_CAPACITY: usize = 64;

/// Lifecycle notifications. Delivery is best effort.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum SessionEvent {
    Opened {
        session_id: SessionId,
        document_type: DocumentType,
        mode: AccessMode,
    },
    Saved {
        session_id: SessionId,
        path: PathBuf,
    },
    Closed {
        session_id: SessionId,
        discarded: bool,
    },
    Evicted {
        session_id: SessionId,
        reason: DisconnectReason,
        snapshot: Option<PathBuf>,
    },
}

/// A claimed capacity slot, returned to the pool on drop unless committed.
struct SlotReservation<'a> {
    counter: &'a AtomicUsize,
    committed: bool,
}

impl SlotReservation<'_> {
    fn commit(mut self) {
        self.committed = true;
    }
}

impl Drop for SlotReservation<'_> {
    fn drop(&mut self) {
        if !self.committed {
            self.counter.fetch_sub(1, Ordering::AcqRel);
        }
    }
}

pub struct SessionRegistry {
    config: SessionConfig,
    engine: Arc<dyn DocumentEngine>,
    sessions: DashMap<SessionId, Arc<SessionHandle>>,
    /// Registered sessions plus opens in flight.
    reserved: AtomicUsize,
    policy: DisconnectPolicy,
    events: broadcast::Sender<SessionEvent>,
    shutdown: CancellationToken,
    reaper: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl SessionRegistry {
    pub fn new(config: SessionConfig, engine: Arc<dyn DocumentEngine>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            policy: DisconnectPolicy::from_config(&config),
            config,
            engine,
            sessions: DashMap::new(),
            reserved: AtomicUsize::new(0),
            events,
            shutdown: CancellationToken::new(),
            reaper: parking_lot::Mutex::new(None),
        }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Number of registered sessions.
    pub fn count(&self) -> usize {
        self.sessions.len()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    fn emit(&self, event: SessionEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    fn reserve_slot(&self) -> Result<SlotReservation<'_>> {
        let max = self.config.max_sessions;
        self.reserved
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| (n < max).then_some(n + 1))
            .map_err(|_| SessionError::CapacityExceeded { max })?;
        Ok(SlotReservation {
            counter: &self.reserved,
            committed: false,
        })
    }

    fn release_slot(&self) {
        self.reserved.fetch_sub(1, Ordering::AcqRel);
    }

    /// Remove `id` only if it still maps to `handle`.
    fn take_exact(&self, id: &SessionId, handle: &Arc<SessionHandle>) -> bool {
        let removed = self
            .sessions
            .remove_if(id, |_, h| Arc::ptr_eq(h, handle))
            .is_some();
        if removed {
            self.release_slot();
        }
        removed
    }

    // -------------------------------------------------------------------------
    // Open
    // -------------------------------------------------------------------------

    /// Load `path` and register it as a new session owned by `owner`.
    pub async fn open(&self, path: impl AsRef<Path>, mode: AccessMode, owner: &Identity) -> Result<SessionId> {
        self.open_inner(path.as_ref(), mode, owner, None).await
    }

    /// Like [`open`](Self::open), tagging the session with the client
    /// connection so [`on_client_disconnect`](Self::on_client_disconnect)
    /// can find it.
    pub async fn open_for_client(
        &self,
        path: impl AsRef<Path>,
        mode: AccessMode,
        owner: &Identity,
        client_id: impl Into<String>,
    ) -> Result<SessionId> {
        self.open_inner(path.as_ref(), mode, owner, Some(client_id.into()))
            .await
    }

    async fn open_inner(
        &self,
        path: &Path,
        mode: AccessMode,
        owner: &Identity,
        client_id: Option<String>,
    ) -> Result<SessionId> {
        if self.shutdown.is_cancelled() {
            return Err(SessionError::InvalidOperation(
                "registry is shutting down".to_string(),
            ));
        }
        if !self.config.enabled {
            return Err(SessionError::Disabled);
        }

        let slot = self.reserve_slot()?;

        let metadata = match tokio::fs::metadata(path).await {
            Ok(m) if m.is_file() => m,
            _ => return Err(SessionError::NotFound(path.to_path_buf())),
        };
        if metadata.len() > self.config.max_file_size_bytes() {
            return Err(SessionError::FileTooLarge {
                path: path.to_path_buf(),
                size_bytes: metadata.len(),
                limit_mb: self.config.max_file_size_mb,
            });
        }
        let document_type = DocumentType::from_path(path)
            .ok_or_else(|| SessionError::UnsupportedDocumentType(path.to_path_buf()))?;

        let engine = self.engine.clone();
        let load_path = path.to_path_buf();
        let payload =
            tokio::task::spawn_blocking(move || engine.load(&load_path, document_type)).await??;

        let handle = Arc::new(
            SessionHandle::open(path, mode, document_type, payload, owner.clone())
                .with_client(client_id)
                .with_estimated_bytes(metadata.len()),
        );
        let id = handle.id().clone();

        match self.sessions.entry(id.clone()) {
            Entry::Occupied(_) => panic!("session id collision: {id}"),
            Entry::Vacant(vacant) => {
                vacant.insert(handle.clone());
            }
        }
        slot.commit();

        // Shutdown may have drained the map between the first check and the insert.
        if self.shutdown.is_cancelled() {
            if self.take_exact(&id, &handle) {
                handle.dispose().await;
            }
            return Err(SessionError::InvalidOperation(
                "registry is shutting down".to_string(),
            ));
        }

        info!(
            session = %id,
            path = %path.display(),
            doc_type = %document_type,
            ?mode,
            owner = %owner,
            "opened session"
        );
        self.emit(SessionEvent::Opened {
            session_id: id.clone(),
            document_type,
            mode,
        });
        Ok(id)
    }

    // -------------------------------------------------------------------------
    // Lookup
    // -------------------------------------------------------------------------

    /// Fetch a session visible to `requestor`.
    ///
    /// Sessions owned by someone else are reported as not found.
    pub fn get(&self, id: &SessionId, requestor: &Identity) -> Result<Arc<SessionHandle>> {
        let handle = self
            .sessions
            .get(id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| SessionError::SessionNotFound(id.clone()))?;
        if !can_access(requestor, handle.owner(), self.config.isolation_mode) {
            debug!(session = %id, requestor = %requestor, "session access denied");
            return Err(SessionError::SessionNotFound(id.clone()));
        }
        Ok(handle)
    }

    /// Run `op` against the payload viewed as a `T`.
    pub async fn get_document<T, R>(
        &self,
        id: &SessionId,
        requestor: &Identity,
        op: impl FnOnce(&T) -> R,
    ) -> Result<R>
    where
        T: 'static,
    {
        let handle = self.get(id, requestor)?;
        let guard = handle.lock().await?;
        let doc = guard
            .document()
            .as_any()
            .downcast_ref::<T>()
            .ok_or_else(|| type_mismatch::<T>(id))?;
        Ok(op(doc))
    }

    /// Mutable counterpart of [`get_document`](Self::get_document). Marks
    /// the session dirty.
    pub async fn get_document_mut<T, R>(
        &self,
        id: &SessionId,
        requestor: &Identity,
        op: impl FnOnce(&mut T) -> R,
    ) -> Result<R>
    where
        T: 'static,
    {
        let handle = self.get(id, requestor)?;
        let mut guard = handle.lock().await?;
        if !guard.document().as_any().is::<T>() {
            return Err(type_mismatch::<T>(id));
        }
        let doc = guard
            .document_mut()
            .as_any_mut()
            .downcast_mut::<T>()
            .ok_or_else(|| type_mismatch::<T>(id))?;
        Ok(op(doc))
    }

    pub fn status(&self, id: &SessionId, requestor: &Identity) -> Result<SessionStatus> {
        Ok(self.get(id, requestor)?.status())
    }

    /// Sessions visible to `requestor`, oldest first.
    pub fn list_sessions(&self, requestor: &Identity) -> Vec<SessionStatus> {
        let mut list: Vec<SessionStatus> = self
            .sessions
            .iter()
            .filter(|entry| can_access(requestor, entry.value().owner(), self.config.isolation_mode))
            .map(|entry| entry.value().status())
            .collect();
        list.sort_by(|a, b| a.opened_at.cmp(&b.opened_at));
        list
    }

    // -------------------------------------------------------------------------
    // Save / close
    // -------------------------------------------------------------------------

    /// Persist the session to `output_path`, or its source path.
    pub async fn save(
        &self,
        id: &SessionId,
        requestor: &Identity,
        output_path: Option<&Path>,
    ) -> Result<PathBuf> {
        let handle = self.get(id, requestor)?;
        if handle.mode().is_readonly() {
            return Err(SessionError::ReadonlySessionWriteAttempt(id.clone()));
        }
        let target = output_path
            .map(Path::to_path_buf)
            .unwrap_or_else(|| handle.source_path().to_path_buf());

        let guard = handle.lock().await?;
        let out = target.clone();
        let (guard, ()) = guard
            .blocking(move |doc| {
                if let Some(parent) = out.parent().filter(|p| !p.as_os_str().is_empty()) {
                    std::fs::create_dir_all(parent)?;
                }
                Ok(doc.save(&out)?)
            })
            .await?;
        guard.mark_clean();
        drop(guard);

        info!(session = %id, path = %target.display(), "saved session");
        self.emit(SessionEvent::Saved {
            session_id: id.clone(),
            path: target.clone(),
        });
        Ok(target)
    }

    /// Close a session, saving unsaved changes to the source path unless
    /// `discard` is set. A failed save leaves the session open.
    pub async fn close(&self, id: &SessionId, requestor: &Identity, discard: bool) -> Result<()> {
        let handle = self.get(id, requestor)?;

        let mut guard = handle.lock().await?;
        let dirty = guard.is_dirty();
        if dirty && !discard {
            if handle.mode().is_readonly() {
                warn!(session = %id, "read-only session has unsaved changes; discarding on close");
            } else {
                let source = handle.source_path().to_path_buf();
                (guard, _) = guard
                    .blocking(move |doc| Ok(doc.save(&source)?))
                    .await?;
                guard.mark_clean();
            }
        }
        let removed = self.take_exact(id, &handle);
        drop(guard);

        if !removed {
            // Evicted concurrently; that path owns teardown.
            return Err(SessionError::SessionNotFound(id.clone()));
        }
        handle.dispose().await;

        info!(session = %id, discard, "closed session");
        self.emit(SessionEvent::Closed {
            session_id: id.clone(),
            discarded: discard && dirty,
        });
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Eviction
    // -------------------------------------------------------------------------

    /// Apply the disconnect policy to a handle already removed from the map.
    async fn relinquish(&self, handle: &SessionHandle, reason: DisconnectReason) {
        let snapshot = match self.policy.apply(handle, reason).await {
            Ok(PolicyOutcome::Snapshot(entry)) => Some(entry.temp_path),
            Ok(PolicyOutcome::AutoSaved(path)) => Some(path),
            Ok(outcome) => {
                debug!(session = %handle.id(), %reason, ?outcome, "session relinquished");
                None
            }
            Err(err) => {
                warn!(session = %handle.id(), %reason, %err, "disconnect policy failed");
                None
            }
        };
        self.emit(SessionEvent::Evicted {
            session_id: handle.id().clone(),
            reason,
            snapshot,
        });
    }

    /// Evict every session idle for longer than the configured timeout at
    /// `now`. Returns the number evicted by this call.
    pub async fn reap_idle(&self, now: DateTime<Utc>) -> usize {
        let Some(timeout) = self.config.idle_timeout() else {
            return 0;
        };

        let candidates: Vec<SessionId> = self
            .sessions
            .iter()
            .filter(|entry| entry.value().idle_for(now) > timeout)
            .map(|entry| entry.key().clone())
            .collect();

        let mut evicted = 0;
        for id in candidates {
            // Re-check under the shard lock: the session may have been used since.
            let Some((_, handle)) = self
                .sessions
                .remove_if(&id, |_, h| h.idle_for(now) > timeout)
            else {
                continue;
            };
            self.release_slot();
            info!(session = %id, "evicting idle session");
            self.relinquish(&handle, DisconnectReason::IdleTimeout).await;
            evicted += 1;
        }
        evicted
    }

    /// Start the periodic idle sweep. Runs until `token` is cancelled or the
    /// registry shuts down. Returns `false` if idle eviction is disabled.
    pub fn spawn_idle_reaper(self: &Arc<Self>, token: CancellationToken) -> bool {
        if !self.config.enabled || self.config.idle_timeout().is_none() {
            return false;
        }

        let registry = Arc::downgrade(self);
        let shutdown = self.shutdown.clone();
        let period = self.config.reaper_interval;
        info!(interval_secs = period.as_secs(), "starting idle reaper");

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            // The first tick completes immediately.
            ticker.tick().await;
            loop {
                tokio::select! {
                    biased;
                    _ = shutdown.cancelled() => break,
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        let Some(registry) = registry.upgrade() else {
                            break;
                        };
                        let evicted = registry.reap_idle(Utc::now()).await;
                        if evicted > 0 {
                            info!(evicted, "idle sweep finished");
                        }
                    }
                }
            }
            debug!("idle reaper stopped");
        });

        if let Some(previous) = self.reaper.lock().replace(task) {
            previous.abort();
        }
        true
    }

    /// Relinquish every session opened by `client_id`. For transport-level
    /// callers that already own the connection.
    pub async fn on_client_disconnect(&self, client_id: &str) -> usize {
        self.disconnect_matching(client_id, |_| true).await
    }

    /// Like [`on_client_disconnect`](Self::on_client_disconnect), limited to
    /// sessions `requestor` is allowed to see.
    pub async fn on_client_disconnect_for(&self, client_id: &str, requestor: &Identity) -> usize {
        let mode = self.config.isolation_mode;
        self.disconnect_matching(client_id, |handle| can_access(requestor, handle.owner(), mode))
            .await
    }

    async fn disconnect_matching(
        &self,
        client_id: &str,
        allowed: impl Fn(&SessionHandle) -> bool,
    ) -> usize {
        let ids: Vec<SessionId> = self
            .sessions
            .iter()
            .filter(|entry| entry.value().client_id() == Some(client_id) && allowed(entry.value().as_ref()))
            .map(|entry| entry.key().clone())
            .collect();

        let mut relinquished = 0;
        for id in ids {
            let Some((_, handle)) = self.sessions.remove(&id) else {
                continue;
            };
            self.release_slot();
            self.relinquish(&handle, DisconnectReason::ClientDisconnect).await;
            relinquished += 1;
        }
        if relinquished > 0 {
            info!(client = client_id, relinquished, "client disconnected");
        }
        relinquished
    }

    /// Stop background work and drain every session through the disconnect
    /// policy. Never fails; per-session errors are logged.
    pub async fn on_server_shutdown(&self) -> usize {
        self.shutdown.cancel();

        let reaper = self.reaper.lock().take();
        if let Some(task) = reaper {
            if let Err(err) = task.await {
                if !err.is_cancelled() {
                    warn!(%err, "idle reaper terminated abnormally");
                }
            }
        }

        let mut drained = 0;
        loop {
            let ids: Vec<SessionId> = self.sessions.iter().map(|e| e.key().clone()).collect();
            if ids.is_empty() {
                break;
            }
            for id in ids {
                let Some((_, handle)) = self.sessions.remove(&id) else {
                    continue;
                };
                self.release_slot();
                self.relinquish(&handle, DisconnectReason::Shutdown).await;
                drained += 1;
            }
        }
        info!(drained, "session registry shut down");
        drained
    }
}

fn type_mismatch<T>(id: &SessionId) -> SessionError {
    SessionError::InvalidOperation(format!(
        "session {id} does not hold a {}",
        std::any::type_name::<T>()
    ))
}
