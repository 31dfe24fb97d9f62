//! A single resident document and its exclusive-access guard.
//!
//! All access to the payload goes through [`SessionHandle::lock`] (or the
//! `execute*` helpers built on it). The guard is a FIFO async mutex, so two
//! operations against the same session never interleave while different
//! sessions proceed in parallel.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};
use std::sync::Arc;

use chrono::{DateTime, TimeDelta, Utc};
use docsession_types::{AccessMode, DocumentType, Identity, SessionId};
use futures::future::BoxFuture;
use serde::Serialize;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio_util::sync::CancellationToken;
use tracing::debug;
use uuid::Uuid;

use crate::engine::Document;
use crate::error::{Result, SessionError};

/// Generate a fresh, unguessable session id (122 random bits).
pub fn generate_session_id() -> SessionId {
    SessionId(Uuid::new_v4().simple().to_string())
}

pub struct SessionHandle {
    id: SessionId,
    source_path: PathBuf,
    document_type: DocumentType,
    mode: AccessMode,
    owner: Identity,
    client_id: Option<String>,
    estimated_bytes: u64,
    opened_at: DateTime<Utc>,
    /// Written only while the guard is held; read optimistically by sweeps.
    last_accessed_ms: AtomicI64,
    dirty: AtomicBool,
    disposed: AtomicBool,
    teardowns: AtomicUsize,
    /// Closed in place on teardown; `disposed` is the source of truth.
    payload: Arc<Mutex<Box<dyn Document>>>,
}

impl SessionHandle {
    /// Wrap a freshly loaded payload. The handle starts clean.
    pub fn open(
        source_path: impl Into<PathBuf>,
        mode: AccessMode,
        document_type: DocumentType,
        payload: Box<dyn Document>,
        owner: Identity,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: generate_session_id(),
            source_path: source_path.into(),
            document_type,
            mode,
            owner,
            client_id: None,
            estimated_bytes: 0,
            opened_at: now,
            last_accessed_ms: AtomicI64::new(now.timestamp_millis()),
            dirty: AtomicBool::new(false),
            disposed: AtomicBool::new(false),
            teardowns: AtomicUsize::new(0),
            payload: Arc::new(Mutex::new(payload)),
        }
    }

    /// Tag the session with the client connection that opened it.
    pub fn with_client(mut self, client_id: Option<String>) -> Self {
        self.client_id = client_id;
        self
    }

    pub fn with_estimated_bytes(mut self, bytes: u64) -> Self {
        self.estimated_bytes = bytes;
        self
    }

    pub fn id(&self) -> &SessionId {
        &self.id
    }

    pub fn source_path(&self) -> &Path {
        &self.source_path
    }

    pub fn document_type(&self) -> DocumentType {
        self.document_type
    }

    pub fn mode(&self) -> AccessMode {
        self.mode
    }

    pub fn owner(&self) -> &Identity {
        &self.owner
    }

    pub fn client_id(&self) -> Option<&str> {
        self.client_id.as_deref()
    }

    pub fn estimated_bytes(&self) -> u64 {
        self.estimated_bytes
    }

    pub fn opened_at(&self) -> DateTime<Utc> {
        self.opened_at
    }

    pub fn last_accessed_at(&self) -> DateTime<Utc> {
        DateTime::from_timestamp_millis(self.last_accessed_ms.load(Ordering::Acquire))
            .unwrap_or(self.opened_at)
    }

    /// Time since last access as seen at `now`.
    pub fn idle_for(&self, now: DateTime<Utc>) -> TimeDelta {
        now - self.last_accessed_at()
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Acquire)
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    /// Number of times teardown actually ran. Never exceeds one.
    pub fn teardowns(&self) -> usize {
        self.teardowns.load(Ordering::Acquire)
    }

    // -------------------------------------------------------------------------
    // Guarded access
    // -------------------------------------------------------------------------

    /// Wait for exclusive access to the payload.
    ///
    /// Fails with [`SessionError::Disposed`] if the handle was torn down
    /// before or while waiting. Dropping the returned future while it waits
    /// removes the waiter from the queue.
    pub async fn lock(&self) -> Result<SessionGuard<'_>> {
        if self.is_disposed() {
            return Err(SessionError::Disposed(self.id.clone()));
        }
        let doc = self.payload.clone().lock_owned().await;
        self.guard_from(doc)
    }

    /// Like [`lock`](Self::lock), but gives up with
    /// [`SessionError::Cancelled`] when `token` fires first.
    pub async fn lock_cancellable(&self, token: &CancellationToken) -> Result<SessionGuard<'_>> {
        if self.is_disposed() {
            return Err(SessionError::Disposed(self.id.clone()));
        }
        tokio::select! {
            biased;
            _ = token.cancelled() => Err(SessionError::Cancelled(self.id.clone())),
            doc = self.payload.clone().lock_owned() => self.guard_from(doc),
        }
    }

    fn guard_from(&self, doc: OwnedMutexGuard<Box<dyn Document>>) -> Result<SessionGuard<'_>> {
        // Teardown flips the flag before it queues for the lock.
        if self.is_disposed() {
            return Err(SessionError::Disposed(self.id.clone()));
        }
        self.touch();
        Ok(SessionGuard { handle: self, doc })
    }

    #[cfg(test)]
    pub(crate) fn backdate(&self, by: TimeDelta) {
        let at = self.last_accessed_at() - by;
        self.last_accessed_ms
            .store(at.timestamp_millis(), Ordering::Release);
    }

    fn touch(&self) {
        self.last_accessed_ms
            .store(Utc::now().timestamp_millis(), Ordering::Release);
    }

    /// Run a read-only operation against the payload.
    pub async fn execute<T>(&self, op: impl FnOnce(&dyn Document) -> T) -> Result<T> {
        let guard = self.lock().await?;
        Ok(op(guard.document()))
    }

    /// Run a mutating operation against the payload; marks the session dirty.
    pub async fn execute_mut<T>(&self, op: impl FnOnce(&mut dyn Document) -> T) -> Result<T> {
        let mut guard = self.lock().await?;
        Ok(op(guard.document_mut()))
    }

    /// Run an async mutating operation while holding the guard.
    pub async fn execute_async<T, F>(&self, op: F) -> Result<T>
    where
        F: for<'a> FnOnce(&'a mut dyn Document) -> BoxFuture<'a, T>,
    {
        let mut guard = self.lock().await?;
        Ok(op(guard.document_mut()).await)
    }

    /// Mutating operation whose wait for the guard can be cancelled.
    pub async fn execute_cancellable<T>(
        &self,
        token: &CancellationToken,
        op: impl FnOnce(&mut dyn Document) -> T,
    ) -> Result<T> {
        let mut guard = self.lock_cancellable(token).await?;
        Ok(op(guard.document_mut()))
    }

    /// Flag a change made through a side channel that bypassed `execute`.
    pub async fn mark_dirty(&self) -> Result<()> {
        let guard = self.lock().await?;
        guard.mark_dirty();
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Teardown
    // -------------------------------------------------------------------------

    /// Tear the session down. Idempotent.
    ///
    /// Returns `true` for the single caller that performed teardown and
    /// `false` for every other caller, concurrent or later. Teardown waits
    /// for any in-flight operation to release the guard.
    pub async fn dispose(&self) -> bool {
        if self
            .disposed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }

        let mut doc = self.payload.lock().await;
        doc.close();
        drop(doc);

        self.teardowns.fetch_add(1, Ordering::AcqRel);
        debug!(session = %self.id, "session disposed");
        true
    }

    /// Read-only snapshot for listings. Does not touch `last_accessed_at`.
    pub fn status(&self) -> SessionStatus {
        SessionStatus {
            session_id: self.id.clone(),
            source_path: self.source_path.clone(),
            document_type: self.document_type,
            mode: self.mode,
            dirty: self.is_dirty(),
            opened_at: self.opened_at,
            last_accessed_at: self.last_accessed_at(),
            owner_group_id: self.owner.group_id().map(str::to_string),
            owner_user_id: self.owner.user_id().map(str::to_string),
            client_id: self.client_id.clone(),
            estimated_bytes: self.estimated_bytes,
        }
    }
}

impl std::fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionHandle")
            .field("id", &self.id)
            .field("source_path", &self.source_path)
            .field("document_type", &self.document_type)
            .field("mode", &self.mode)
            .field("dirty", &self.is_dirty())
            .field("disposed", &self.is_disposed())
            .finish_non_exhaustive()
    }
}

/// Exclusive access to a session's payload. Released on drop.
pub struct SessionGuard<'a> {
    handle: &'a SessionHandle,
    doc: OwnedMutexGuard<Box<dyn Document>>,
}

impl std::fmt::Debug for SessionGuard<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionGuard")
            .field("handle", &self.handle)
            .finish_non_exhaustive()
    }
}

impl SessionGuard<'_> {
    pub fn document(&self) -> &dyn Document {
        &**self.doc
    }

    /// Mutable access. Marks the session dirty.
    pub fn document_mut(&mut self) -> &mut dyn Document {
        self.mark_dirty();
        &mut **self.doc
    }

    /// Run blocking work against the payload (engine saves, file writes) on
    /// the blocking pool. The session stays locked throughout and the guard
    /// is handed back afterwards.
    pub async fn blocking<T, F>(self, op: F) -> Result<(Self, T)>
    where
        F: FnOnce(&dyn Document) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let SessionGuard { handle, doc } = self;
        let (doc, out) = tokio::task::spawn_blocking(move || {
            let out = op(&**doc);
            (doc, out)
        })
        .await?;
        Ok((SessionGuard { handle, doc }, out?))
    }

    pub fn handle(&self) -> &SessionHandle {
        self.handle
    }

    pub fn is_dirty(&self) -> bool {
        self.handle.is_dirty()
    }

    pub fn mark_dirty(&self) {
        self.handle.dirty.store(true, Ordering::Release);
    }

    pub fn mark_clean(&self) {
        self.handle.dirty.store(false, Ordering::Release);
    }
}

/// Point-in-time view of a session.
#[derive(Debug, Clone, Serialize)]
pub struct SessionStatus {
    pub session_id: SessionId,
    pub source_path: PathBuf,
    pub document_type: DocumentType,
    pub mode: AccessMode,
    pub dirty: bool,
    pub opened_at: DateTime<Utc>,
    pub last_accessed_at: DateTime<Utc>,
    pub owner_group_id: Option<String>,
    pub owner_user_id: Option<String>,
    pub client_id: Option<String>,
    pub estimated_bytes: u64,
}
