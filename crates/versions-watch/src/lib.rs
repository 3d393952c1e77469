//! Versions watch pipeline
//!
//! ```text
//! BatchSource ──EventBatch──► SnapshotBuilder ──► ContentStore (blobs)
//!  (notify /                     │
//!   recorded)                    └──────────────► GraphStore (one commit)
//! ```
//!
//! [`WatchRunner`] drives the pipeline one batch at a time.

pub mod batch;
pub mod builder;
pub mod resolver;
pub mod runner;
pub mod transport;


pub use batch::{EventBatch, FILES_KEY};
pub use builder::{
    BatchOutcome, BatchReport, BatchWarning, BuildError, BuildPhase, SnapshotBuilder,
    CONTENT_HASH_ATTR, FILENAME_ATTR,
};
pub use resolver::{ContentResolver, FsResolver, ResolveError};
pub use runner::{RunError, RunnerSummary, WatchRunner, DEFAULT_RECEIVE_TIMEOUT};
pub use transport::{
    BatchSource, JsonLinesSource, NotifyTransport, TransportError, CONTENT_DIGEST_KEY,
};
