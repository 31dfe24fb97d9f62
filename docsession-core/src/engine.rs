//! Document engine abstraction layer.
//!
//! The registry never inspects concrete document libraries. Every open
//! document is a boxed [`Document`] produced by a [`DocumentEngine`], and the
//! only capabilities the session layer needs are save, close and downcast.

use std::any::Any;
use std::path::Path;

use docsession_types::DocumentType;

use crate::error::EngineError;

/// An open, in-memory document.
pub trait Document: Any + Send {
    /// Family this document belongs to.
    fn document_type(&self) -> DocumentType;

    /// Serialize the current in-memory state to `path`.
    fn save(&self, path: &Path) -> Result<(), EngineError>;

    /// Release engine resources. Called exactly once, on session teardown.
    fn close(&mut self) {}

    fn as_any(&self) -> &dyn Any;

    fn as_any_mut(&mut self) -> &mut dyn Any;
}

/// Loads documents from disk.
pub trait DocumentEngine: Send + Sync + 'static {
    fn load(&self, path: &Path, doc_type: DocumentType) -> Result<Box<dyn Document>, EngineError>;
}

// =============================================================================
// Byte buffer engine
// =============================================================================

/// A document held as its raw file bytes.
///
/// Used by the daemon when no format-aware engine is plugged in: sessions
/// still get residency, locking and recovery, and saves are byte-exact.
#[derive(Debug, Clone)]
pub struct BytesDocument {
    doc_type: DocumentType,
    bytes: Vec<u8>,
    closed: bool,
}

impl BytesDocument {
    pub fn new(doc_type: DocumentType, bytes: Vec<u8>) -> Self {
        Self {
            doc_type,
            bytes,
            closed: false,
        }
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn set_bytes(&mut self, bytes: Vec<u8>) {
        self.bytes = bytes;
    }

    pub fn append(&mut self, more: &[u8]) {
        self.bytes.extend_from_slice(more);
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }
}

impl Document for BytesDocument {
    fn document_type(&self) -> DocumentType {
        self.doc_type
    }

    fn save(&self, path: &Path) -> Result<(), EngineError> {
        if self.closed {
            return Err(EngineError::Closed);
        }
        std::fs::write(path, &self.bytes).map_err(|e| EngineError::Save {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })
    }

    fn close(&mut self) {
        self.closed = true;
        self.bytes = Vec::new();
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// Engine that reads files into [`BytesDocument`]s.
#[derive(Debug, Clone, Copy, Default)]
pub struct BytesEngine;

impl DocumentEngine for BytesEngine {
    fn load(&self, path: &Path, doc_type: DocumentType) -> Result<Box<dyn Document>, EngineError> {
        let bytes = std::fs::read(path).map_err(|e| EngineError::Load {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        Ok(Box::new(BytesDocument::new(doc_type, bytes)))
    }
}
