//! Attribute registry: one value kind per `(entity kind, attribute name)`.
//!
//! A declaration is permanent for the life of a log. Redeclaring with the
//! same kind is a no-op; redeclaring with a different kind is a conflict.

use serde::Serialize;
use std::collections::BTreeMap;

use crate::error::{Result, StoreError};
use crate::model::{EntityKind, ValueKind};

/// Proof that an attribute is declared. Only the registry hands these out,
/// so a value can never be staged against an undeclared attribute.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttributeHandle {
    kind: EntityKind,
    name: String,
    value_kind: ValueKind,
}

impl AttributeHandle {
    pub fn entity_kind(&self) -> EntityKind {
        self.kind
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn value_kind(&self) -> ValueKind {
        self.value_kind
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AttributeDecl {
    pub kind: EntityKind,
    pub name: String,
    pub value_kind: ValueKind,
}

#[derive(Debug)]
pub(crate) enum Lookup {
    Existing(AttributeHandle),
    Missing,
}

#[derive(Debug, Default, Clone)]
pub struct SchemaRegistry {
    entries: BTreeMap<(EntityKind, String), ValueKind>,
}

impl SchemaRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn value_kind(&self, kind: EntityKind, name: &str) -> Option<ValueKind> {
        self.entries.get(&(kind, name.to_string())).copied()
    }

    pub fn handle(&self, kind: EntityKind, name: &str) -> Option<AttributeHandle> {
        self.value_kind(kind, name).map(|value_kind| AttributeHandle {
            kind,
            name: name.to_string(),
            value_kind,
        })
    }

    pub(crate) fn lookup(&self, kind: EntityKind, name: &str, requested: ValueKind) -> Result<Lookup> {
        match self.value_kind(kind, name) {
            Some(declared) if declared == requested => Ok(Lookup::Existing(AttributeHandle {
                kind,
                name: name.to_string(),
                value_kind: declared,
            })),
            Some(declared) => Err(StoreError::SchemaConflict {
                kind,
                attribute: name.to_string(),
                declared,
                requested,
            }),
            None => Ok(Lookup::Missing),
        }
    }

    /// Record a declaration that is already durable.
    pub(crate) fn record(
        &mut self,
        kind: EntityKind,
        name: &str,
        value_kind: ValueKind,
    ) -> Result<AttributeHandle> {
        if let Lookup::Existing(handle) = self.lookup(kind, name, value_kind)? {
            return Ok(handle);
        }
        self.entries.insert((kind, name.to_string()), value_kind);
        Ok(AttributeHandle {
            kind,
            name: name.to_string(),
            value_kind,
        })
    }

    pub fn declarations(&self) -> Vec<AttributeDecl> {
        self.entries
            .iter()
            .map(|((kind, name), value_kind)| AttributeDecl {
                kind: *kind,
                name: name.clone(),
                value_kind: *value_kind,
            })
            .collect()
    }
}
