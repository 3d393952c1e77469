//! Sequential watch loop: receive a batch, build it, repeat.

use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{error, info, trace, warn};

use crate::builder::{BatchOutcome, BuildError, SnapshotBuilder};
use crate::resolver::ContentResolver;
use crate::transport::{BatchSource, TransportError};

pub const DEFAULT_RECEIVE_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RunnerSummary {
    pub batches: u64,
    pub snapshots: u64,
    pub no_ops: u64,
    pub files: u64,
    pub warnings: u64,
    pub storage_failures: u64,
    pub timeouts: u64,
    pub malformed: u64,
}

#[derive(Debug, Error)]
pub enum RunError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// The session log cannot take further commits.
    #[error("batch {batch} left the session log unusable: {source}")]
    Storage {
        batch: u64,
        #[source]
        source: BuildError,
    },
}

pub struct WatchRunner<S, R> {
    source: S,
    builder: SnapshotBuilder<R>,
    receive_timeout: Duration,
    shutdown: Arc<AtomicBool>,
}

impl<S: BatchSource, R: ContentResolver> WatchRunner<S, R> {
    pub fn new(source: S, builder: SnapshotBuilder<R>) -> Self {
        Self {
            source,
            builder,
            receive_timeout: DEFAULT_RECEIVE_TIMEOUT,
            shutdown: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn with_receive_timeout(mut self, timeout: Duration) -> Self {
        self.receive_timeout = timeout;
        self
    }

    /// Use an externally owned stop flag (e.g. set from a ctrl-c handler).
    pub fn with_shutdown(mut self, flag: Arc<AtomicBool>) -> Self {
        self.shutdown = flag;
        self
    }

    pub fn shutdown_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.shutdown)
    }

    pub fn builder(&self) -> &SnapshotBuilder<R> {
        &self.builder
    }

    pub fn into_builder(self) -> SnapshotBuilder<R> {
        self.builder
    }

    /// Run until shutdown is requested or a finite source ends.
    ///
    /// The stop flag is checked between batches only, so an in-flight batch
    /// always finishes. Malformed batches are skipped. A storage failure
    /// abandons that batch and the loop carries on, unless the log is
    /// poisoned. A lost transport ends the run with an error.
    pub fn run(&mut self) -> Result<RunnerSummary, RunError> {
        let mut summary = RunnerSummary::default();

        while !self.shutdown.load(Ordering::SeqCst) {
            let batch = match self.source.next_batch(self.receive_timeout) {
                Ok(Some(batch)) => batch,
                Ok(None) => {
                    summary.timeouts += 1;
                    trace!("no batch within receive timeout");
                    continue;
                }
                Err(TransportError::EndOfStream) => {
                    info!("batch stream ended");
                    break;
                }
                Err(e @ TransportError::Malformed { .. }) => {
                    summary.malformed += 1;
                    warn!(error = %e, "skipping malformed batch");
                    continue;
                }
                Err(e) => {
                    error!(error = %e, "watch transport failed");
                    return Err(e.into());
                }
            };

            summary.batches += 1;
            tally(&mut summary, self.builder.process(&batch))?;
        }

        info!(
            batches = summary.batches,
            snapshots = summary.snapshots,
            storage_failures = summary.storage_failures,
            malformed = summary.malformed,
            "watch runner stopped"
        );
        Ok(summary)
    }
}

/// Fold one batch result into `summary`. Only a poisoned log is returned as
/// an error.
pub(crate) fn tally(
    summary: &mut RunnerSummary,
    result: Result<BatchOutcome, BuildError>,
) -> Result<(), RunError> {
    match result {
        Ok(BatchOutcome::NoOp) => summary.no_ops += 1,
        Ok(BatchOutcome::Committed(report)) => {
            summary.snapshots += 1;
            summary.files += report.files.len() as u64;
            summary.warnings += report.warnings.len() as u64;
        }
        Err(e) if e.is_fatal() => {
            summary.storage_failures += 1;
            error!(batch = summary.batches, error = %e, "session log poisoned, stopping");
            return Err(RunError::Storage {
                batch: summary.batches,
                source: e,
            });
        }
        Err(e) => {
            summary.storage_failures += 1;
            error!(batch = summary.batches, error = %e, "batch abandoned");
        }
    }
    Ok(())
}
