//! Shared types for docsession
//!
//! This crate provides the value types passed between the session registry,
//! the recovery store and the daemon: session identifiers, document kinds,
//! access modes and requestor identities.

use std::fmt;
use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Error returned when a configuration enum cannot be parsed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid {kind}: '{value}' (expected one of: {expected})")]
pub struct ParseEnumError {
    pub kind: &'static str,
    pub value: String,
    pub expected: &'static str,
}

/// Lowercase and strip separators so `save-to-temp`, `SaveToTemp` and
/// `save_to_temp` all compare equal.
fn normalize(s: &str) -> String {
    s.chars()
        .filter(|c| !matches!(c, '-' | '_' | ' '))
        .flat_map(char::to_lowercase)
        .collect()
}

// =============================================================================
// Session identifier
// =============================================================================

/// Opaque session identifier
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(pub String);

impl SessionId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for SessionId {
    fn from(id: String) -> Self {
        SessionId(id)
    }
}

impl From<&str> for SessionId {
    fn from(id: &str) -> Self {
        SessionId(id.to_string())
    }
}

// =============================================================================
// Document kinds
// =============================================================================

/// Closed set of document families the engine can hold open.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DocumentType {
    Word,
    Excel,
    PowerPoint,
    Pdf,
}

impl DocumentType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DocumentType::Word => "Word",
            DocumentType::Excel => "Excel",
            DocumentType::PowerPoint => "PowerPoint",
            DocumentType::Pdf => "Pdf",
        }
    }

    /// Infer the document type from a file extension (without the dot).
    pub fn from_extension(ext: &str) -> Option<Self> {
        match ext.to_ascii_lowercase().as_str() {
            "docx" | "doc" | "docm" | "dotx" => Some(DocumentType::Word),
            "xlsx" | "xls" | "xlsm" | "csv" => Some(DocumentType::Excel),
            "pptx" | "ppt" | "pptm" => Some(DocumentType::PowerPoint),
            "pdf" => Some(DocumentType::Pdf),
            _ => None,
        }
    }

    pub fn from_path(path: &Path) -> Option<Self> {
        path.extension()
            .and_then(|e| e.to_str())
            .and_then(Self::from_extension)
    }
}

impl fmt::Display for DocumentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Whether a session may be written back to disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccessMode {
    ReadOnly,
    #[default]
    ReadWrite,
}

impl AccessMode {
    pub fn is_readonly(&self) -> bool {
        matches!(self, AccessMode::ReadOnly)
    }
}

impl FromStr for AccessMode {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match normalize(s).as_str() {
            "readonly" | "ro" => Ok(AccessMode::ReadOnly),
            "readwrite" | "rw" => Ok(AccessMode::ReadWrite),
            _ => Err(ParseEnumError {
                kind: "access mode",
                value: s.to_string(),
                expected: "readonly, readwrite",
            }),
        }
    }
}

// =============================================================================
// Policy enums
// =============================================================================

/// What happens to a dirty session that is relinquished involuntarily.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DisconnectBehavior {
    /// Drop unsaved changes.
    Discard,
    /// Write changes back to the original file.
    AutoSave,
    /// Snapshot changes into the temp directory for later recovery.
    #[default]
    SaveToTemp,
    /// Snapshot, and flag the snapshot so the client is asked on reconnect.
    PromptOnReconnect,
}

impl DisconnectBehavior {
    /// Behaviors that leave a snapshot + sidecar pair behind.
    pub fn writes_snapshot(&self) -> bool {
        matches!(
            self,
            DisconnectBehavior::SaveToTemp | DisconnectBehavior::PromptOnReconnect
        )
    }
}

impl FromStr for DisconnectBehavior {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match normalize(s).as_str() {
            "discard" => Ok(DisconnectBehavior::Discard),
            "autosave" => Ok(DisconnectBehavior::AutoSave),
            "savetotemp" => Ok(DisconnectBehavior::SaveToTemp),
            "promptonreconnect" => Ok(DisconnectBehavior::PromptOnReconnect),
            _ => Err(ParseEnumError {
                kind: "disconnect behavior",
                value: s.to_string(),
                expected: "discard, auto-save, save-to-temp, prompt-on-reconnect",
            }),
        }
    }
}

/// Granularity at which ownership is compared for access control.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IsolationMode {
    /// Every requestor may act on every resource.
    #[default]
    None,
    /// Requestors only see resources owned by their own group.
    Group,
}

impl FromStr for IsolationMode {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match normalize(s).as_str() {
            "none" => Ok(IsolationMode::None),
            "group" => Ok(IsolationMode::Group),
            _ => Err(ParseEnumError {
                kind: "isolation mode",
                value: s.to_string(),
                expected: "none, group",
            }),
        }
    }
}

// =============================================================================
// Identity
// =============================================================================

/// A requestor or resource owner.
///
/// Both fields absent means anonymous. There is no shared anonymous
/// instance: use [`Identity::anonymous`] wherever "no identity" is meant.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Identity {
    group_id: Option<String>,
    user_id: Option<String>,
}

impl Identity {
    /// Build an identity. Blank components are treated as absent.
    pub fn new(group_id: Option<String>, user_id: Option<String>) -> Self {
        fn clean(v: Option<String>) -> Option<String> {
            v.filter(|s| !s.trim().is_empty())
        }
        Self {
            group_id: clean(group_id),
            user_id: clean(user_id),
        }
    }

    pub fn anonymous() -> Self {
        Self::default()
    }

    pub fn user(group_id: impl Into<String>, user_id: impl Into<String>) -> Self {
        Self::new(Some(group_id.into()), Some(user_id.into()))
    }

    pub fn group_id(&self) -> Option<&str> {
        self.group_id.as_deref()
    }

    pub fn user_id(&self) -> Option<&str> {
        self.user_id.as_deref()
    }

    pub fn is_anonymous(&self) -> bool {
        self.group_id.is_none() && self.user_id.is_none()
    }

    /// Same owner: both group and user match.
    pub fn same_owner(&self, other: &Identity) -> bool {
        self == other
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_anonymous() {
            return f.write_str("anonymous");
        }
        write!(
            f,
            "{}/{}",
            self.group_id.as_deref().unwrap_or("-"),
            self.user_id.as_deref().unwrap_or("-")
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_document_type_from_path() {
        assert_eq!(
            DocumentType::from_path(Path::new("/a/report.DOCX")),
            Some(DocumentType::Word)
        );
        assert_eq!(
            DocumentType::from_path(Path::new("sheet.xlsx")),
            Some(DocumentType::Excel)
        );
        assert_eq!(
            DocumentType::from_path(Path::new("deck.pptx")),
            Some(DocumentType::PowerPoint)
        );
        assert_eq!(
            DocumentType::from_path(Path::new("scan.pdf")),
            Some(DocumentType::Pdf)
        );
        assert_eq!(DocumentType::from_path(Path::new("notes.txt")), None);
        assert_eq!(DocumentType::from_path(Path::new("no_extension")), None);
    }

    #[test]
    fn test_behavior_parsing_accepts_common_spellings() {
        for s in ["save-to-temp", "SaveToTemp", "save_to_temp", "SAVETOTEMP"] {
            assert_eq!(s.parse::<DisconnectBehavior>(), Ok(DisconnectBehavior::SaveToTemp));
        }
        assert_eq!(
            "auto-save".parse::<DisconnectBehavior>(),
            Ok(DisconnectBehavior::AutoSave)
        );
        assert!("later".parse::<DisconnectBehavior>().is_err());
    }

    #[test]
    fn test_isolation_mode_parsing() {
        assert_eq!("Group".parse::<IsolationMode>(), Ok(IsolationMode::Group));
        assert_eq!("none".parse::<IsolationMode>(), Ok(IsolationMode::None));
        let err = "tenant".parse::<IsolationMode>().unwrap_err();
        assert!(err.to_string().contains("tenant"));
    }

    #[test]
    fn test_identity_blank_components_are_absent() {
        let id = Identity::new(Some("  ".into()), Some(String::new()));
        assert!(id.is_anonymous());
        assert_eq!(id, Identity::anonymous());

        let id = Identity::new(None, Some("alice".into()));
        assert!(!id.is_anonymous());
        assert_eq!(id.user_id(), Some("alice"));
    }

    #[test]
    fn test_same_owner_requires_both_fields() {
        let a = Identity::user("g1", "alice");
        assert!(a.same_owner(&Identity::user("g1", "alice")));
        assert!(!a.same_owner(&Identity::user("g1", "bob")));
        assert!(!a.same_owner(&Identity::user("g2", "alice")));
    }

    #[test]
    fn test_access_mode_serde_names() {
        let json = serde_json::to_string(&AccessMode::ReadOnly).unwrap();
        assert_eq!(json, "\"readonly\"");
        assert_eq!(
            serde_json::to_string(&DocumentType::PowerPoint).unwrap(),
            "\"PowerPoint\""
        );
    }
}
