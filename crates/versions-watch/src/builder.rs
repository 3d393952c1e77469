//! Turns one change batch into one committed Snapshot.
//!
//! Per batch: one Snapshot carrying the batch's scalar fields, and one File
//! per readable entry of `files`, all staged in a single transaction and
//! committed once. Anything that is wrong with a single key or entry is
//! reported as a [`BatchWarning`] and skipped; only storage failures abort.

use serde_json::{Map, Value};
use std::fmt;
use thiserror::Error;
use tracing::{debug, error, info, info_span, trace, warn};
use versions_store::{
    ContentStore, EntityId, EntityKind, GraphStore, ScalarValue, StoreError, Transaction,
    ValueKind,
};

use crate::batch::{json_type_name, EventBatch, FILES_KEY};
use crate::resolver::ContentResolver;

/// File attribute holding the SHA-256 of the captured bytes.
pub const CONTENT_HASH_ATTR: &str = "sha256";
/// File attribute the entry's `name` is stored under.
pub const FILENAME_ATTR: &str = "filename";

const NAME_KEY: &str = "name";

#[derive(Debug, Error)]
pub enum BuildError {
    /// The content store or the log could not be written. Nothing from the
    /// batch became visible.
    #[error("storage failure: {0}")]
    Storage(#[from] StoreError),
}

impl BuildError {
    /// The log refuses further commits; retrying later batches is pointless.
    pub fn is_fatal(&self) -> bool {
        match self {
            BuildError::Storage(e) => e.is_fatal(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum BatchWarning {
    UnsupportedValue {
        entity: EntityKind,
        key: String,
        found: &'static str,
    },
    MalformedEntry {
        index: usize,
        found: &'static str,
    },
    UnreadableFile {
        index: usize,
        name: Option<String>,
        reason: String,
    },
    SchemaConflict {
        entity: EntityKind,
        key: String,
        declared: ValueKind,
        found: ValueKind,
    },
    ReservedKey {
        index: usize,
        key: String,
    },
}

impl fmt::Display for BatchWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BatchWarning::UnsupportedValue { entity, key, found } => {
                write!(f, "{entity}.{key}: unsupported {found} value")
            }
            BatchWarning::MalformedEntry { index, found } => {
                write!(f, "files[{index}]: expected object, found {found}")
            }
            BatchWarning::UnreadableFile {
                index,
                name: Some(name),
                reason,
            } => write!(f, "files[{index}] `{name}`: {reason}"),
            BatchWarning::UnreadableFile {
                index,
                name: None,
                reason,
            } => write!(f, "files[{index}]: {reason}"),
            BatchWarning::SchemaConflict {
                entity,
                key,
                declared,
                found,
            } => write!(f, "{entity}.{key}: declared {declared}, found {found}"),
            BatchWarning::ReservedKey { index, key } => {
                write!(f, "files[{index}]: key `{key}` is reserved")
            }
        }
    }
}

/// Where the builder is in a batch. Emitted at trace level.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildPhase {
    Idle,
    AllocatingSnapshot,
    ProcessingFiles,
    Committed,
    NoOp,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BatchReport {
    pub snapshot_id: EntityId,
    pub tx_id: u64,
    pub files: Vec<EntityId>,
    pub warnings: Vec<BatchWarning>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum BatchOutcome {
    /// The batch had no `files` key; the graph is unchanged.
    NoOp,
    Committed(BatchReport),
}

pub struct SnapshotBuilder<R> {
    graph: GraphStore,
    content: ContentStore,
    resolver: R,
}

impl<R: ContentResolver> SnapshotBuilder<R> {
    pub fn new(graph: GraphStore, content: ContentStore, resolver: R) -> Self {
        Self {
            graph,
            content,
            resolver,
        }
    }

    pub fn graph(&self) -> &GraphStore {
        &self.graph
    }

    pub fn content(&self) -> &ContentStore {
        &self.content
    }

    pub fn into_parts(self) -> (GraphStore, ContentStore, R) {
        (self.graph, self.content, self.resolver)
    }

    pub fn process(&mut self, batch: &EventBatch) -> Result<BatchOutcome, BuildError> {
        let span = info_span!("batch", clock = batch.clock().unwrap_or("-"));
        let _enter = span.enter();
        trace!(phase = ?BuildPhase::Idle);

        let Some(files) = batch.files() else {
            info!(keys = batch.len(), "batch has no `files` entry; nothing to record");
            trace!(phase = ?BuildPhase::NoOp);
            return Ok(BatchOutcome::NoOp);
        };

        trace!(phase = ?BuildPhase::AllocatingSnapshot);
        let mut tx = self.graph.begin()?;
        let snapshot_id = tx.create_entity(EntityKind::Snapshot);
        let mut warnings = Vec::new();

        for (key, value) in batch.iter() {
            if key == FILES_KEY {
                continue;
            }
            self.stage_json(&mut tx, EntityKind::Snapshot, snapshot_id, key, value, &mut warnings)?;
        }

        trace!(phase = ?BuildPhase::ProcessingFiles);
        let mut recorded = Vec::new();
        match files {
            Value::Array(entries) => {
                for (index, entry) in entries.iter().enumerate() {
                    match entry {
                        Value::Object(fields) => {
                            if let Some(id) =
                                self.stage_file(&mut tx, snapshot_id, index, fields, &mut warnings)?
                            {
                                recorded.push(id);
                            }
                        }
                        other => {
                            let found = json_type_name(other);
                            warn!(index, found, "files entry is not an object; skipping");
                            warnings.push(BatchWarning::MalformedEntry { index, found });
                        }
                    }
                }
            }
            other => {
                let found = json_type_name(other);
                warn!(found, "`files` is not a list; recording snapshot without files");
                warnings.push(BatchWarning::UnsupportedValue {
                    entity: EntityKind::Snapshot,
                    key: FILES_KEY.to_string(),
                    found,
                });
            }
        }

        let summary = self.graph.commit(tx)?;
        trace!(phase = ?BuildPhase::Committed);
        info!(
            snapshot = %snapshot_id,
            tx_id = summary.tx_id,
            files = recorded.len(),
            warnings = warnings.len(),
            "recorded snapshot"
        );

        Ok(BatchOutcome::Committed(BatchReport {
            snapshot_id,
            tx_id: summary.tx_id,
            files: recorded,
            warnings,
        }))
    }

    /// Capture one entry. `Ok(None)` when the entry is discarded.
    fn stage_file(
        &mut self,
        tx: &mut Transaction,
        snapshot_id: EntityId,
        index: usize,
        fields: &Map<String, Value>,
        warnings: &mut Vec<BatchWarning>,
    ) -> Result<Option<EntityId>, BuildError> {
        let file_id = EntityId::generate();

        let name = match fields.get(NAME_KEY) {
            Some(Value::String(name)) => name.as_str(),
            other => {
                let reason = match other {
                    None => "entry has no `name`".to_string(),
                    Some(v) => format!("`name` is {}, not a string", json_type_name(v)),
                };
                warn!(index, %reason, "cannot capture file; discarding entry");
                warnings.push(BatchWarning::UnreadableFile {
                    index,
                    name: None,
                    reason,
                });
                return Ok(None);
            }
        };

        let bytes = match self.resolver.resolve(name) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(index, name, error = %e, "cannot capture file; discarding entry");
                debug!(file = %file_id, "dropping allocated file identity");
                warnings.push(BatchWarning::UnreadableFile {
                    index,
                    name: Some(name.to_string()),
                    reason: e.to_string(),
                });
                return Ok(None);
            }
        };

        let hash = self.content.put(&bytes)?;
        tx.create_entity_with_id(file_id, EntityKind::File)?;
        self.stage_scalar(
            tx,
            EntityKind::File,
            file_id,
            CONTENT_HASH_ATTR,
            ScalarValue::Text(hash.to_string()),
            warnings,
        )?;
        tx.add_member(snapshot_id, file_id);

        for (key, value) in fields {
            if key == CONTENT_HASH_ATTR {
                warn!(index, name, key = %key, "entry key collides with the computed hash; ignoring it");
                warnings.push(BatchWarning::ReservedKey {
                    index,
                    key: key.clone(),
                });
                continue;
            }
            let attribute = if key == NAME_KEY { FILENAME_ATTR } else { key.as_str() };
            self.stage_json(tx, EntityKind::File, file_id, attribute, value, warnings)?;
        }

        debug!(index, name, hash = %hash, file = %file_id, bytes = bytes.len(), "captured file");
        Ok(Some(file_id))
    }

    fn stage_json(
        &mut self,
        tx: &mut Transaction,
        entity: EntityKind,
        id: EntityId,
        key: &str,
        value: &Value,
        warnings: &mut Vec<BatchWarning>,
    ) -> Result<(), BuildError> {
        match ScalarValue::from_json(value) {
            Some(scalar) => self.stage_scalar(tx, entity, id, key, scalar, warnings),
            None if value.is_null() => {
                debug!(entity = %entity, key, "null value; skipping attribute");
                Ok(())
            }
            None => {
                let found = json_type_name(value);
                warn!(entity = %entity, key, found, "unsupported value type; skipping attribute");
                warnings.push(BatchWarning::UnsupportedValue {
                    entity,
                    key: key.to_string(),
                    found,
                });
                Ok(())
            }
        }
    }

    fn stage_scalar(
        &mut self,
        tx: &mut Transaction,
        entity: EntityKind,
        id: EntityId,
        key: &str,
        value: ScalarValue,
        warnings: &mut Vec<BatchWarning>,
    ) -> Result<(), BuildError> {
        match self.graph.ensure_attribute(entity, key, value.kind()) {
            Ok(handle) => {
                tx.set_attribute(id, &handle, value)?;
                Ok(())
            }
            Err(StoreError::SchemaConflict {
                declared,
                requested,
                ..
            }) => {
                error!(
                    entity = %entity,
                    key,
                    declared = %declared,
                    found = %requested,
                    "schema conflict; attribute not recorded"
                );
                warnings.push(BatchWarning::SchemaConflict {
                    entity,
                    key: key.to_string(),
                    declared,
                    found: requested,
                });
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }
}
