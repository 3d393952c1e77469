//! Error types for versions-store

use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::model::{EntityId, EntityKind, ValueKind};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("I/O error on `{path}`: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("WAL record encoding error: {0}")]
    Encoding(#[from] bincode::Error),

    #[error("`{path}` is not a versions graph log: {message}")]
    Format { path: PathBuf, message: String },

    #[error(
        "schema conflict: {kind}.{attribute} is declared as {declared}, refusing {requested}"
    )]
    SchemaConflict {
        kind: EntityKind,
        attribute: String,
        declared: ValueKind,
        requested: ValueKind,
    },

    #[error("blob {hash} exists with {found_len} bytes, expected {expected_len}")]
    ContentCorrupted {
        hash: String,
        expected_len: u64,
        found_len: u64,
    },

    #[error("invalid content hash `{0}` (expected 64 lowercase hex chars)")]
    InvalidHash(String),

    #[error("invalid containment edge: {0}")]
    InvalidEdge(String),

    #[error("entity {0} is not staged in this transaction")]
    UnknownEntity(EntityId),

    #[error("entity {0} is already staged in this transaction")]
    DuplicateEntity(EntityId),

    #[error("attribute `{attribute}` is declared for {handle_kind}, not {entity_kind}")]
    HandleMismatch {
        attribute: String,
        handle_kind: EntityKind,
        entity_kind: EntityKind,
    },

    /// A failed append could not be cut back; the log tail is torn.
    #[error("session log `{0}` is poisoned by a torn append and refuses further writes")]
    Poisoned(PathBuf),

    #[error("store `{0}` was opened read-only")]
    ReadOnly(PathBuf),

    #[error("invalid query: {0}")]
    InvalidQuery(String),

    #[error("no session matches `{0}`")]
    SessionNotFound(String),

    #[error("session prefix `{0}` is ambiguous")]
    AmbiguousSession(String),

    #[error("no home directory available for default state paths")]
    NoHomeDir,
}

impl StoreError {
    pub fn io(path: impl AsRef<Path>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.as_ref().to_path_buf(),
            source,
        }
    }

    /// Schema conflicts are rejected per attribute; every other variant means
    /// the store itself could not be read or written.
    pub fn is_schema_conflict(&self) -> bool {
        matches!(self, Self::SchemaConflict { .. })
    }

    /// The store can no longer accept writes from this process.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Poisoned(_))
    }
}

/// Result type alias
pub type Result<T> = std::result::Result<T, StoreError>;
