//! Resident document sessions.
//!
//! Large documents are expensive to reopen, so this crate keeps them loaded
//! across independent client requests and governs what happens to them:
//!
//! - **Registry**: bounded map of open sessions, each guarded by a FIFO
//!   async lock so operations on one document never interleave
//! - **Disconnect policy**: what to do with unsaved work when a session is
//!   evicted for idleness, client disconnect or shutdown
//! - **Recovery**: temp snapshots with JSON sidecars that can be listed,
//!   restored and expired later
//! - **Isolation**: optional per-group ownership checks on all of the above
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use docsession_core::prelude::*;
//!
//! let registry = Arc::new(SessionRegistry::new(SessionConfig::default(), Arc::new(BytesEngine)));
//! let me = Identity::anonymous();
//! let id = registry.open("report.docx", AccessMode::ReadWrite, &me).await?;
//! registry
//!     .get_document_mut::<BytesDocument, _>(&id, &me, |doc| doc.append(b"more"))
//!     .await?;
//! registry.close(&id, &me, false).await?;
//! ```

pub mod config;
pub mod engine;
pub mod error;
pub mod handle;
pub mod identity;
pub mod policy;
pub mod recovery;
pub mod registry;

pub use config::{ConfigError, SessionConfig};
pub use engine::{BytesDocument, BytesEngine, Document, DocumentEngine};
pub use error::{EngineError, Result, SessionError};
pub use handle::{SessionGuard, SessionHandle, SessionStatus};
pub use identity::{can_access, storage_key, EnvIdentityProvider, IdentityProvider, StaticIdentityProvider};
pub use policy::{DisconnectPolicy, DisconnectReason, PolicyOutcome};
pub use recovery::{
    CleanupReport, DeleteResult, RecoverResult, RecoverableFileInfo, RecoveryEntry, RecoveryStats,
    RecoveryStore,
};
pub use registry::{SessionEvent, SessionRegistry};

/// Prelude for common imports
pub mod prelude {
    pub use crate::config::SessionConfig;
    pub use crate::engine::{BytesDocument, BytesEngine, Document, DocumentEngine};
    pub use crate::error::{Result, SessionError};
    pub use crate::identity::IdentityProvider;
    pub use crate::recovery::RecoveryStore;
    pub use crate::registry::{SessionEvent, SessionRegistry};
    pub use docsession_types::{
        AccessMode, DisconnectBehavior, DocumentType, Identity, IsolationMode, SessionId,
    };
}
