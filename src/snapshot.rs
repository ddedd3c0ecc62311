//! Snapshot back end: one JSON document holding the whole store.
//!
//! The document has two top-level keys: `data` (entity name → list of raw
//! records) and `schemas` (entity name → field-def echo, re-checked after
//! restart). Everything lives in memory; `init` loads the document,
//! `commit` and `close` write it back.
//!
//! Declared constraints (`not null`, `unique`, type tags) are enforced by
//! the adapter itself since there is no store underneath to do it.
//! Transactions deep-copy the state to a shadow and restore it on
//! rollback. Orphan-removal triggers are a documented no-op: orphan GC is
//! not available on this back end.

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::adapter::{Adapter, Criteria, JunctionLayout, OwnerCheck, Record};
use crate::datatype::Raw;
use crate::error::{EntwineError, Result};
use crate::schema::EntityDef;

/// Field-def echo persisted next to the data so a reopened store can be
/// re-validated against the declared schema.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct FieldEcho {
    name: String,
    raw_type: String,
    attributes: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    default_value: Option<String>,
}

impl FieldEcho {
    fn of(def: &EntityDef) -> Vec<FieldEcho> {
        def.fields
            .iter()
            .map(|field| FieldEcho {
                name: field.name.clone(),
                raw_type: field.raw_type.clone(),
                attributes: field
                    .attributes
                    .iter()
                    .map(|a| a.as_str().to_string())
                    .collect(),
                default_value: field.default_value.clone(),
            })
            .collect()
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct SnapshotState {
    data: BTreeMap<String, Vec<Record>>,
    schemas: BTreeMap<String, Vec<FieldEcho>>,
}

pub struct SnapshotAdapter {
    db_path: Option<PathBuf>,
    state: SnapshotState,
    shadow: Option<SnapshotState>,
    in_transaction: bool,
    /// Entity definitions seen through `ensure_table`, used for the
    /// adapter-side constraint checks.
    defs: BTreeMap<String, EntityDef>,
}

impl SnapshotAdapter {
    /// A store backed by a document at `db_path`.
    pub fn new(db_path: impl Into<PathBuf>) -> SnapshotAdapter {
        SnapshotAdapter {
            db_path: Some(db_path.into()),
            state: SnapshotState::default(),
            shadow: None,
            in_transaction: false,
            defs: BTreeMap::new(),
        }
    }

    /// A purely in-memory store; nothing ever reaches disk.
    pub fn in_memory() -> SnapshotAdapter {
        SnapshotAdapter {
            db_path: None,
            state: SnapshotState::default(),
            shadow: None,
            in_transaction: false,
            defs: BTreeMap::new(),
        }
    }

    fn flush(&self) -> Result<()> {
        if let Some(path) = &self.db_path {
            let text = serde_json::to_string_pretty(&self.state)?;
            std::fs::write(path, text)?;
        }
        Ok(())
    }

    fn rows(&self, name: &str) -> Result<&Vec<Record>> {
        self.state.data.get(name).ok_or_else(|| {
            EntwineError::Storage(format!("no table '{}' in the snapshot store", name))
        })
    }

    fn matches(record: &Record, criteria: &Criteria) -> bool {
        criteria.iter().all(|(column, raw)| {
            record.get(column).cloned().unwrap_or(Raw::Null) == *raw
        })
    }

    /// Enforce the declared constraints for a full row image. `skip_row`
    /// excludes the row being rewritten from the uniqueness scan.
    fn check_constraints(
        &self,
        name: &str,
        record: &Record,
        skip_row: Option<usize>,
    ) -> Result<()> {
        let def = match self.defs.get(name) {
            Some(def) => def,
            // tables without a declared schema (junction rows seeded by
            // callers) only get duplicate-row protection
            None => {
                let duplicate = self
                    .state
                    .data
                    .get(name)
                    .map(|rows| {
                        rows.iter().enumerate().any(|(index, row)| {
                            Some(index) != skip_row && row == record
                        })
                    })
                    .unwrap_or(false);
                if duplicate {
                    return Err(EntwineError::Constraint(format!(
                        "duplicate row in '{}'",
                        name
                    )));
                }
                return Ok(());
            }
        };
        for field in &def.fields {
            let raw = record.get(&field.name).cloned().unwrap_or(Raw::Null);
            if raw.is_null() {
                if field.is_not_null() || field.is_primary() {
                    return Err(EntwineError::Validation(format!(
                        "field '{}' of '{}' must not be null",
                        field.name, name
                    )));
                }
                continue;
            }
            // type tag check: the raw datum must wrap under the declared kind
            field.kind.wrap(&raw).map_err(|e| {
                EntwineError::Validation(format!(
                    "field '{}' of '{}' rejects stored value: {}",
                    field.name, name, e
                ))
            })?;
            if field.is_unique() || field.is_primary() {
                let clash = self
                    .state
                    .data
                    .get(name)
                    .map(|rows| {
                        rows.iter().enumerate().any(|(index, row)| {
                            Some(index) != skip_row
                                && row.get(&field.name).cloned().unwrap_or(Raw::Null) == raw
                        })
                    })
                    .unwrap_or(false);
                if clash {
                    return Err(EntwineError::Validation(format!(
                        "field '{}' of '{}' violates uniqueness",
                        field.name, name
                    )));
                }
            }
        }
        Ok(())
    }
}

impl Adapter for SnapshotAdapter {
    fn init(&mut self) -> Result<()> {
        if let Some(path) = &self.db_path {
            if path.exists() {
                let text = std::fs::read_to_string(path)?;
                self.state = serde_json::from_str(&text)?;
            }
        }
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        if self.in_transaction {
            return Err(EntwineError::Transaction(
                "close inside an open transaction".into(),
            ));
        }
        self.flush()
    }

    fn ensure_table(&mut self, name: &str, def: &EntityDef) -> Result<()> {
        let echo = FieldEcho::of(def);
        if let Some(existing) = self.state.schemas.get(name) {
            if *existing != echo {
                return Err(EntwineError::Schema(format!(
                    "stored schema of '{}' does not match the declared one",
                    name
                )));
            }
        } else {
            self.state.schemas.insert(name.to_string(), echo);
        }
        self.state.data.entry(name.to_string()).or_default();
        self.defs.insert(name.to_string(), def.clone());
        Ok(())
    }

    fn ensure_relation_table(&mut self, e1: &str, pk1: &str, e2: &str, pk2: &str) -> Result<()> {
        let layout = JunctionLayout::of(e1, pk1, e2, pk2);
        self.state.data.entry(layout.table).or_default();
        Ok(())
    }

    fn ensure_orphan_trigger(
        &mut self,
        target_entity: &str,
        _target_pk: &str,
        trigger_table: &str,
        _target_id_col: &str,
        _all_checks: &[OwnerCheck],
    ) -> Result<()> {
        // no trigger machinery here; owned rows are not reclaimed
        debug!(
            entity = %target_entity,
            junction = %trigger_table,
            "orphan removal is not available on the snapshot back end"
        );
        Ok(())
    }

    fn find_one(&self, name: &str, criteria: &Criteria) -> Result<Option<Record>> {
        Ok(self
            .rows(name)?
            .iter()
            .find(|record| Self::matches(record, criteria))
            .cloned())
    }

    fn find(&self, name: &str, criteria: &Criteria) -> Result<Vec<Record>> {
        Ok(self
            .rows(name)?
            .iter()
            .filter(|record| Self::matches(record, criteria))
            .cloned()
            .collect())
    }

    fn insert(&mut self, name: &str, record: &Record) -> Result<()> {
        if !self.state.data.contains_key(name) {
            return Err(EntwineError::Storage(format!(
                "no table '{}' in the snapshot store",
                name
            )));
        }
        self.check_constraints(name, record, None)?;
        self.state
            .data
            .get_mut(name)
            .unwrap()
            .push(record.clone());
        Ok(())
    }

    fn update(&mut self, name: &str, pk_criteria: &Criteria, updates: &Record) -> Result<()> {
        let position = self
            .rows(name)?
            .iter()
            .position(|record| Self::matches(record, pk_criteria));
        let index = match position {
            Some(index) => index,
            None => return Ok(()),
        };
        let mut merged = self.state.data[name][index].clone();
        for (column, raw) in updates {
            merged.insert(column.clone(), raw.clone());
        }
        self.check_constraints(name, &merged, Some(index))?;
        self.state.data.get_mut(name).unwrap()[index] = merged;
        Ok(())
    }

    fn begin_transaction(&mut self) -> Result<()> {
        if self.in_transaction {
            return Err(EntwineError::Transaction(
                "a transaction is already open".into(),
            ));
        }
        self.shadow = Some(self.state.clone());
        self.in_transaction = true;
        Ok(())
    }

    fn commit(&mut self) -> Result<()> {
        if !self.in_transaction {
            return Err(EntwineError::Transaction("commit without a begin".into()));
        }
        self.shadow = None;
        self.in_transaction = false;
        self.flush()
    }

    fn rollback(&mut self) -> Result<()> {
        if !self.in_transaction {
            return Err(EntwineError::Transaction("rollback without a begin".into()));
        }
        self.state = self
            .shadow
            .take()
            .expect("shadow state exists while a transaction is open");
        self.in_transaction = false;
        Ok(())
    }
}
