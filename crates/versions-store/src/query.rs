//! Structured reads over the committed graph.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

use crate::error::{Result, StoreError};
use crate::graph::{EntityRecord, GraphStore};
use crate::model::{EntityId, EntityKind, ScalarValue};

/// `kind` and attribute equality filters, ANDed together.
///
/// ```json
/// {"kind": "File", "filters": {"filename": "src/main.rs"}, "limit": 10}
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EntityQuery {
    #[serde(default)]
    pub kind: Option<EntityKind>,
    #[serde(default)]
    pub filters: BTreeMap<String, Value>,
    #[serde(default)]
    pub limit: Option<usize>,
}

impl EntityQuery {
    pub fn of_kind(kind: EntityKind) -> Self {
        Self {
            kind: Some(kind),
            ..Self::default()
        }
    }

    pub fn filter(mut self, attribute: &str, value: impl Into<Value>) -> Self {
        self.filters.insert(attribute.to_string(), value.into());
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Matching entities in commit order.
    pub fn run(&self, store: &GraphStore) -> Result<Vec<EntityView>> {
        let mut filters = Vec::with_capacity(self.filters.len());
        for (name, raw) in &self.filters {
            let value = ScalarValue::from_json(raw).ok_or_else(|| {
                StoreError::InvalidQuery(format!(
                    "filter `{name}` must be an integer, float, boolean or string"
                ))
            })?;
            filters.push((name.as_str(), value));
        }

        let limit = self.limit.unwrap_or(usize::MAX);
        Ok(store
            .entities()
            .filter(|e| self.kind.map_or(true, |k| e.kind == k))
            .filter(|e| {
                filters
                    .iter()
                    .all(|(name, value)| e.attribute(name) == Some(value))
            })
            .take(limit)
            .map(|e| EntityView::new(store, e))
            .collect())
    }
}

/// JSON-facing rendering of an [`EntityRecord`].
#[derive(Debug, Clone, Serialize)]
pub struct EntityView {
    pub id: String,
    pub kind: EntityKind,
    pub committed_at: DateTime<Utc>,
    pub attributes: BTreeMap<String, Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub snapshot: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_count: Option<usize>,
}

impl EntityView {
    pub fn new(store: &GraphStore, record: &EntityRecord) -> Self {
        let (snapshot, file_count) = match record.kind {
            EntityKind::Snapshot => (None, Some(store.members(&record.id).len())),
            EntityKind::File => (store.owner_of(&record.id).map(|s| s.id.to_string()), None),
        };
        Self {
            id: record.id.to_string(),
            kind: record.kind,
            committed_at: record.committed_at,
            attributes: record
                .attributes
                .iter()
                .map(|(k, v)| (k.clone(), v.to_json()))
                .collect(),
            snapshot,
            file_count,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SnapshotDetail {
    pub snapshot: EntityView,
    pub files: Vec<EntityView>,
}

/// Newest snapshots first.
pub fn recent_snapshots(store: &GraphStore, limit: usize) -> Vec<EntityView> {
    let snapshots: Vec<&EntityRecord> = store.entities_of_kind(EntityKind::Snapshot).collect();
    snapshots
        .into_iter()
        .rev()
        .take(limit)
        .map(|s| EntityView::new(store, s))
        .collect()
}

pub fn snapshot_detail(store: &GraphStore, id: &EntityId) -> Option<SnapshotDetail> {
    let record = store.get(id).filter(|r| r.kind == EntityKind::Snapshot)?;
    Some(SnapshotDetail {
        snapshot: EntityView::new(store, record),
        files: store
            .members(id)
            .into_iter()
            .map(|f| EntityView::new(store, f))
            .collect(),
    })
}
