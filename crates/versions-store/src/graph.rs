//! Append-only graph of Snapshot and File entities.
//!
//! The in-memory view is always a replay of committed transactions from the
//! WAL. A writer extends the log and applies its own commits directly; a
//! read-only handle catches up with [`GraphStore::refresh`].
//!
//! ```text
//! Transaction (staged, in memory)
//!        │ commit: one buffer, one write, sync_data
//!        ▼
//!   <session>.wal ──refresh──▶ read-only GraphStore (query server)
//! ```

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{Result, StoreError};
use crate::model::{EntityId, EntityKind, ScalarValue, ValueKind};
use crate::schema::{AttributeHandle, Lookup, SchemaRegistry};
use crate::wal::{WalRecord, WriteAheadLog, WAL_FORMAT_V1};

/// Name of the Snapshot → File containment edge.
pub const FILES_RELATION: &str = "files";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessMode {
    /// Append without taking any exclusive lock; readers may attach.
    Shared,
    ReadOnly,
}

#[derive(Debug, Clone, PartialEq)]
pub struct EntityRecord {
    pub id: EntityId,
    pub kind: EntityKind,
    pub attributes: BTreeMap<String, ScalarValue>,
    pub tx_id: u64,
    pub committed_at: DateTime<Utc>,
}

impl EntityRecord {
    pub fn attribute(&self, name: &str) -> Option<&ScalarValue> {
        self.attributes.get(name)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StoreStats {
    pub session_id: Option<Uuid>,
    pub snapshots: usize,
    pub files: usize,
    pub attributes_declared: usize,
    pub transactions: u64,
    pub wal_bytes: u64,
}

/// Writes staged for one commit. Dropping a transaction discards them.
#[derive(Debug)]
pub struct Transaction {
    id: u64,
    started_at: DateTime<Utc>,
    created: Vec<(EntityId, EntityKind)>,
    kinds: HashMap<EntityId, EntityKind>,
    attributes: Vec<(EntityId, String, ScalarValue)>,
    members: Vec<(EntityId, EntityId)>,
}

impl Transaction {
    fn new(id: u64) -> Self {
        Self {
            id,
            started_at: Utc::now(),
            created: Vec::new(),
            kinds: HashMap::new(),
            attributes: Vec::new(),
            members: Vec::new(),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn create_entity(&mut self, kind: EntityKind) -> EntityId {
        let id = EntityId::generate();
        self.created.push((id, kind));
        self.kinds.insert(id, kind);
        id
    }

    /// Stage an entity under an identity the caller allocated earlier.
    pub fn create_entity_with_id(&mut self, id: EntityId, kind: EntityKind) -> Result<()> {
        if self.kinds.contains_key(&id) {
            return Err(StoreError::DuplicateEntity(id));
        }
        self.created.push((id, kind));
        self.kinds.insert(id, kind);
        Ok(())
    }

    pub fn set_attribute(
        &mut self,
        id: EntityId,
        handle: &AttributeHandle,
        value: ScalarValue,
    ) -> Result<()> {
        let entity_kind = *self.kinds.get(&id).ok_or(StoreError::UnknownEntity(id))?;
        if entity_kind != handle.entity_kind() {
            return Err(StoreError::HandleMismatch {
                attribute: handle.name().to_string(),
                handle_kind: handle.entity_kind(),
                entity_kind,
            });
        }
        if value.kind() != handle.value_kind() {
            return Err(StoreError::SchemaConflict {
                kind: entity_kind,
                attribute: handle.name().to_string(),
                declared: handle.value_kind(),
                requested: value.kind(),
            });
        }
        self.attributes.push((id, handle.name().to_string(), value));
        Ok(())
    }

    /// Stage a `files` edge. Checked against the graph at commit.
    pub fn add_member(&mut self, owner: EntityId, member: EntityId) {
        self.members.push((owner, member));
    }

    pub fn staged_entities(&self) -> usize {
        self.created.len()
    }

    pub fn is_empty(&self) -> bool {
        self.created.is_empty() && self.attributes.is_empty() && self.members.is_empty()
    }

    fn into_records(self) -> Vec<WalRecord> {
        let tx_id = self.id;
        let mut records =
            Vec::with_capacity(2 + self.created.len() + self.attributes.len() + self.members.len());
        records.push(WalRecord::BeginTx {
            tx_id,
            timestamp: self.started_at.timestamp_millis(),
        });
        for (id, kind) in self.created {
            records.push(WalRecord::CreateEntity { tx_id, id, kind });
        }
        for (id, name, value) in self.attributes {
            records.push(WalRecord::SetAttribute {
                tx_id,
                id,
                name,
                value,
            });
        }
        for (owner, member) in self.members {
            records.push(WalRecord::AddMember {
                tx_id,
                owner,
                member,
            });
        }
        records.push(WalRecord::CommitTx { tx_id });
        records
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CommitSummary {
    pub tx_id: u64,
    pub entities: usize,
    pub edges: usize,
}

#[derive(Debug)]
struct PendingTx {
    tx_id: u64,
    begin_offset: u64,
    timestamp: i64,
    records: Vec<WalRecord>,
}

fn abandon(tx: Option<PendingTx>) {
    if let Some(tx) = tx {
        warn!(
            tx_id = tx.tx_id,
            offset = tx.begin_offset,
            "transaction never committed; ignoring it"
        );
    }
}

pub struct GraphStore {
    wal: WriteAheadLog,
    mode: AccessMode,
    session_id: Option<Uuid>,
    schema: SchemaRegistry,
    entities: HashMap<EntityId, EntityRecord>,
    order: Vec<EntityId>,
    members: HashMap<EntityId, Vec<EntityId>>,
    owners: HashMap<EntityId, EntityId>,
    pending_tail: Option<u64>,
    next_tx_id: u64,
    committed_txs: u64,
    read_offset: u64,
}

impl GraphStore {
    /// Open a session log. `Shared` creates the file (and writes its header)
    /// when missing; `ReadOnly` requires it to exist.
    pub fn open(path: &Path, mode: AccessMode) -> Result<Self> {
        let wal = match mode {
            AccessMode::Shared => WriteAheadLog::open(path)?,
            AccessMode::ReadOnly => WriteAheadLog::open_read_only(path)?,
        };

        let mut store = Self {
            wal,
            mode,
            session_id: None,
            schema: SchemaRegistry::new(),
            entities: HashMap::new(),
            order: Vec::new(),
            members: HashMap::new(),
            owners: HashMap::new(),
            pending_tail: None,
            next_tx_id: 1,
            committed_txs: 0,
            read_offset: 0,
        };
        store.refresh()?;

        if mode == AccessMode::Shared {
            let len = store.wal.len()?;
            if len > store.read_offset {
                warn!(
                    path = %path.display(),
                    unfinished_tx = ?store.pending_tail,
                    bytes = len - store.read_offset,
                    "discarding incomplete tail of log"
                );
                store.wal.truncate_to(store.read_offset)?;
                store.pending_tail = None;
            }
            if store.read_offset == 0 {
                let session_id = path
                    .file_stem()
                    .and_then(|s| Uuid::parse_str(&s.to_string_lossy()).ok())
                    .unwrap_or_else(Uuid::new_v4);
                store.read_offset = store.wal.append(&WalRecord::Header {
                    format: WAL_FORMAT_V1.to_string(),
                    session_id,
                    created_at: Utc::now().timestamp_millis(),
                })?;
                store.session_id = Some(session_id);
                info!(path = %path.display(), session = %session_id, "created session log");
            }
        }

        Ok(store)
    }

    pub fn open_read_only(path: &Path) -> Result<Self> {
        Self::open(path, AccessMode::ReadOnly)
    }

    pub fn path(&self) -> &Path {
        self.wal.path()
    }

    pub fn mode(&self) -> AccessMode {
        self.mode
    }

    pub fn session_id(&self) -> Option<Uuid> {
        self.session_id
    }

    pub fn schema(&self) -> &SchemaRegistry {
        &self.schema
    }

    fn require_writable(&self) -> Result<()> {
        match self.mode {
            AccessMode::Shared => Ok(()),
            AccessMode::ReadOnly => Err(StoreError::ReadOnly(self.wal.path().to_path_buf())),
        }
    }

    // ========================================================================
    // Schema
    // ========================================================================

    /// Return the handle for `(kind, name)`, declaring it first if needed.
    ///
    /// A new declaration is durable before this returns and is independent
    /// of any open transaction.
    pub fn ensure_attribute(
        &mut self,
        kind: EntityKind,
        name: &str,
        value_kind: ValueKind,
    ) -> Result<AttributeHandle> {
        match self.schema.lookup(kind, name, value_kind)? {
            Lookup::Existing(handle) => Ok(handle),
            Lookup::Missing => {
                self.require_writable()?;
                self.read_offset = self.wal.append(&WalRecord::DeclareAttribute {
                    kind,
                    name: name.to_string(),
                    value_kind,
                })?;
                info!(kind = %kind, attribute = name, value_kind = %value_kind, "registered attribute");
                self.schema.record(kind, name, value_kind)
            }
        }
    }

    // ========================================================================
    // Transactions
    // ========================================================================

    pub fn begin(&mut self) -> Result<Transaction> {
        self.require_writable()?;
        let id = self.next_tx_id;
        self.next_tx_id += 1;
        Ok(Transaction::new(id))
    }

    /// Validate, persist and apply `tx`. Nothing is applied unless the whole
    /// transaction is durable.
    pub fn commit(&mut self, tx: Transaction) -> Result<CommitSummary> {
        self.require_writable()?;
        self.validate(&tx)?;

        let summary = CommitSummary {
            tx_id: tx.id,
            entities: tx.created.len(),
            edges: tx.members.len(),
        };
        let timestamp = tx.started_at.timestamp_millis();
        let records = tx.into_records();

        self.read_offset = self.wal.append_all(&records)?;
        self.apply_committed(summary.tx_id, timestamp, records);

        debug!(
            tx_id = summary.tx_id,
            entities = summary.entities,
            edges = summary.edges,
            "committed transaction"
        );
        Ok(summary)
    }

    fn validate(&self, tx: &Transaction) -> Result<()> {
        let mut owned = HashSet::new();
        for (owner, member) in &tx.members {
            let owner_kind = tx
                .kinds
                .get(owner)
                .copied()
                .or_else(|| self.entities.get(owner).map(|e| e.kind));
            match owner_kind {
                Some(EntityKind::Snapshot) => {}
                Some(other) => {
                    return Err(StoreError::InvalidEdge(format!(
                        "owner {owner} is a {other}, not a Snapshot"
                    )))
                }
                None => {
                    return Err(StoreError::InvalidEdge(format!("owner {owner} does not exist")))
                }
            }

            match tx.kinds.get(member) {
                Some(EntityKind::File) => {}
                Some(other) => {
                    return Err(StoreError::InvalidEdge(format!(
                        "member {member} is a {other}, not a File"
                    )))
                }
                None => {
                    return Err(StoreError::InvalidEdge(format!(
                        "member {member} was not created in transaction {}",
                        tx.id
                    )))
                }
            }

            if !owned.insert(*member) {
                return Err(StoreError::InvalidEdge(format!(
                    "file {member} is added to more than one snapshot"
                )));
            }
        }
        Ok(())
    }

    // ========================================================================
    // Replay
    // ========================================================================

    /// Apply every transaction committed since the last call. Returns how
    /// many were applied.
    ///
    /// A commit is one contiguous append, so an unfinished transaction can
    /// only sit at the tail of the log. The read offset never moves past the
    /// start of such a transaction; it is re-read on the next call, which
    /// also covers a writer cutting a failed append back.
    pub fn refresh(&mut self) -> Result<usize> {
        let len = self.wal.len()?;
        if len < self.read_offset {
            return Err(StoreError::Format {
                path: self.wal.path().to_path_buf(),
                message: format!(
                    "log shrank to {len} bytes, below already applied data at {}",
                    self.read_offset
                ),
            });
        }

        let (frames, end) = self.wal.read_from(self.read_offset)?;
        let mut open_tx: Option<PendingTx> = None;
        let mut applied = 0;
        for (offset, record) in frames {
            if self.replay_record(&mut open_tx, offset, record)? {
                applied += 1;
            }
        }
        self.read_offset = match &open_tx {
            Some(tx) => tx.begin_offset,
            None => end,
        };
        self.pending_tail = open_tx.map(|tx| tx.tx_id);

        if applied > 0 {
            debug!(applied, offset = self.read_offset, "caught up with log");
        }
        Ok(applied)
    }

    fn replay_record(
        &mut self,
        open_tx: &mut Option<PendingTx>,
        offset: u64,
        record: WalRecord,
    ) -> Result<bool> {
        if let Some(tx_id) = record.tx_id() {
            self.next_tx_id = self.next_tx_id.max(tx_id + 1);
        }

        match record {
            WalRecord::BeginTx { tx_id, timestamp } => {
                abandon(open_tx.take());
                *open_tx = Some(PendingTx {
                    tx_id,
                    begin_offset: offset,
                    timestamp,
                    records: Vec::new(),
                });
            }
            WalRecord::CommitTx { tx_id } => match open_tx.take() {
                Some(tx) if tx.tx_id == tx_id => {
                    self.apply_committed(tx_id, tx.timestamp, tx.records);
                    return Ok(true);
                }
                other => {
                    abandon(other);
                    warn!(tx_id, offset, "commit marker without matching begin");
                }
            },
            WalRecord::Header {
                format, session_id, ..
            } => {
                abandon(open_tx.take());
                if format != WAL_FORMAT_V1 {
                    return Err(StoreError::Format {
                        path: self.wal.path().to_path_buf(),
                        message: format!("unsupported format `{format}`"),
                    });
                }
                self.session_id = Some(session_id);
            }
            WalRecord::DeclareAttribute {
                kind,
                name,
                value_kind,
            } => {
                abandon(open_tx.take());
                if let Err(e) = self.schema.record(kind, &name, value_kind) {
                    warn!(error = %e, "ignoring conflicting declaration in log");
                }
            }
            other => match open_tx {
                Some(tx) if other.tx_id() == Some(tx.tx_id) => tx.records.push(other),
                _ => warn!(tx_id = ?other.tx_id(), offset, "record outside any transaction"),
            },
        }
        Ok(false)
    }

    fn apply_committed(&mut self, tx_id: u64, timestamp: i64, records: Vec<WalRecord>) {
        let committed_at = DateTime::<Utc>::from_timestamp_millis(timestamp).unwrap_or_default();

        for record in records {
            match record {
                WalRecord::CreateEntity { id, kind, .. } => {
                    self.entities.insert(
                        id,
                        EntityRecord {
                            id,
                            kind,
                            attributes: BTreeMap::new(),
                            tx_id,
                            committed_at,
                        },
                    );
                    self.order.push(id);
                }
                WalRecord::SetAttribute {
                    id, name, value, ..
                } => match self.entities.get_mut(&id) {
                    Some(entity) => {
                        entity.attributes.insert(name, value);
                    }
                    None => warn!(tx_id, entity = %id, "attribute for unknown entity"),
                },
                WalRecord::AddMember { owner, member, .. } => {
                    self.members.entry(owner).or_default().push(member);
                    self.owners.insert(member, owner);
                }
                _ => {}
            }
        }
        self.committed_txs += 1;
    }

    // ========================================================================
    // Reads
    // ========================================================================

    pub fn get(&self, id: &EntityId) -> Option<&EntityRecord> {
        self.entities.get(id)
    }

    /// All committed entities in commit order.
    pub fn entities(&self) -> impl Iterator<Item = &EntityRecord> + '_ {
        self.order.iter().filter_map(|id| self.entities.get(id))
    }

    pub fn entities_of_kind(&self, kind: EntityKind) -> impl Iterator<Item = &EntityRecord> + '_ {
        self.entities().filter(move |e| e.kind == kind)
    }

    pub fn members(&self, owner: &EntityId) -> Vec<&EntityRecord> {
        self.members
            .get(owner)
            .map(|ids| ids.iter().filter_map(|id| self.entities.get(id)).collect())
            .unwrap_or_default()
    }

    pub fn owner_of(&self, member: &EntityId) -> Option<&EntityRecord> {
        self.owners.get(member).and_then(|id| self.entities.get(id))
    }

    pub fn entity_count(&self) -> usize {
        self.entities.len()
    }

    pub fn committed_transactions(&self) -> u64 {
        self.committed_txs
    }

    pub fn stats(&self) -> StoreStats {
        let snapshots = self.entities_of_kind(EntityKind::Snapshot).count();
        StoreStats {
            session_id: self.session_id,
            snapshots,
            files: self.entities.len() - snapshots,
            attributes_declared: self.schema.len(),
            transactions: self.committed_txs,
            wal_bytes: self.read_offset,
        }
    }
}
