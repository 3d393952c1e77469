//! Versions storage layer
//!
//! Durable state for captured file snapshots:
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                      VERSIONS STORE                          │
//! ├──────────────────────────────────────────────────────────────┤
//! │                                                              │
//! │   bytes ───────► ContentStore   <snapshot_dir>/<sha256>      │
//! │                                                              │
//! │   attributes ──► SchemaRegistry ─┐                           │
//! │                                  ▼                           │
//! │   entities ────► GraphStore ──► <state_dir>/<session>.wal    │
//! │                  (Snapshot ─files─► File)                    │
//! │                                                              │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Key Properties
//!
//! - **Content-addressed**: a blob is written at most once per SHA-256
//! - **Append-only**: Snapshots and Files are immutable once committed
//! - **Atomic batches**: readers see a whole transaction or none of it
//! - **Shared access**: one writer and any number of read-only handles

pub mod content;
pub mod error;
pub mod graph;
pub mod layout;
pub mod model;
pub mod query;
pub mod schema;
pub mod wal;

pub use content::{ContentHash, ContentStore};
pub use error::{Result, StoreError};
pub use graph::{
    AccessMode, CommitSummary, EntityRecord, GraphStore, StoreStats, Transaction, FILES_RELATION,
};
pub use layout::{Session, SessionInfo, StateLayout};
pub use model::{EntityId, EntityKind, ScalarValue, ValueKind};
pub use query::{EntityQuery, EntityView, SnapshotDetail};
pub use schema::{AttributeDecl, AttributeHandle, SchemaRegistry};
