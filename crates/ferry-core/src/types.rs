//! Core types for Ferry
//!
//! Defines the identifiers and value types shared by every component:
//! - Resource and entity identifiers
//! - Fingerprints and captured snapshots
//! - Remote acknowledgements

use ferry_resilience::SyncError;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use ulid::Ulid;

/// Identifier of a continuously edited document (a canvas, a board, ...)
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ResourceId(pub String);

impl ResourceId {
    /// Create resource ID
    #[inline]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Borrow as str
    #[inline]
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ResourceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ResourceId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for ResourceId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Identifier of a discrete entity (a Kanban card, a column, ...)
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EntityId(pub String);

impl EntityId {
    /// Create entity ID
    #[inline]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Borrow as str
    #[inline]
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for EntityId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for EntityId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for EntityId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Unique operation identifier (ULID for sortability)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct OperationId(pub Ulid);

impl OperationId {
    /// Generate new operation ID
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self(Ulid::new())
    }
}

impl Default for OperationId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for OperationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Change-detection digest of a serialized snapshot
///
/// Only equality matters; the digest is not used for integrity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Fingerprint([u8; 32]);

impl Fingerprint {
    /// Fingerprint raw serialized bytes
    #[inline]
    #[must_use]
    pub fn of_bytes(bytes: &[u8]) -> Self {
        Self(*blake3::hash(bytes).as_bytes())
    }

    /// Fingerprint a JSON value
    ///
    /// # Errors
    /// `SyncError::Validation` if the value cannot be serialized
    pub fn of_value(value: &serde_json::Value) -> Result<Self, SyncError> {
        serde_json::to_vec(value)
            .map(|bytes| Self::of_bytes(&bytes))
            .map_err(|e| SyncError::validation(format!("snapshot not serializable: {e}")))
    }

    /// Short hex prefix for logs
    #[must_use]
    pub fn short(&self) -> String {
        self.0[..6].iter().map(|b| format!("{b:02x}")).collect()
    }
}

impl std::fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for b in &self.0 {
            write!(f, "{b:02x}")?;
        }
        Ok(())
    }
}

/// Captured resource state: the body to transmit and its fingerprint
#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot {
    fingerprint: Fingerprint,
    body: Arc<serde_json::Value>,
}

impl Snapshot {
    /// Capture a JSON value
    ///
    /// # Errors
    /// `SyncError::Validation` if the value cannot be serialized
    pub fn capture(body: serde_json::Value) -> Result<Self, SyncError> {
        let fingerprint = Fingerprint::of_value(&body)?;
        Ok(Self {
            fingerprint,
            body: Arc::new(body),
        })
    }

    /// Capture any serializable state
    ///
    /// # Errors
    /// `SyncError::Validation` if the state cannot be serialized
    pub fn of<T: Serialize>(state: &T) -> Result<Self, SyncError> {
        let body = serde_json::to_value(state)
            .map_err(|e| SyncError::validation(format!("snapshot not serializable: {e}")))?;
        Self::capture(body)
    }

    /// Fingerprint of the body
    #[inline]
    #[must_use]
    pub fn fingerprint(&self) -> Fingerprint {
        self.fingerprint
    }

    /// Serialized body
    #[inline]
    #[must_use]
    pub fn body(&self) -> &serde_json::Value {
        &self.body
    }

    /// Shared handle to the body
    #[inline]
    #[must_use]
    pub fn shared_body(&self) -> Arc<serde_json::Value> {
        Arc::clone(&self.body)
    }
}

/// Remote acknowledgement of a write
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ack {
    /// Revision assigned by the remote store, when it reports one
    pub revision: Option<String>,
}

impl Ack {
    /// Acknowledgement with no revision
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Acknowledgement carrying a revision
    #[inline]
    pub fn with_revision(revision: impl Into<String>) -> Self {
        Self {
            revision: Some(revision.into()),
        }
    }
}
