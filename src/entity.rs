//! In-memory rows. An [`Entity`] mirrors one persisted row of a declared
//! type: scalar fields are wrapped into typed values on every read,
//! relation fields are fetched lazily through the adapter on first access
//! and cached thereafter.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tracing::warn;

use crate::adapter::{Adapter, Record};
use crate::datatype::{Raw, Value};
use crate::error::{EntwineError, Result};
use crate::schema::{EntityDef, NameHasher, RelationRegistry, SchemaDict};

/// Shared lookup capability handed to every entity so relation reads can
/// resolve target definitions and junction layouts transitively.
#[derive(Debug)]
pub(crate) struct Binder {
    pub schema: Arc<SchemaDict>,
    pub registry: Arc<RelationRegistry>,
}

/// A relation slot is empty until first read, `Loading` while a fetch is
/// in progress (a re-entrant read during the fetch would mean a cycle),
/// and holds the resolved list afterwards. A failed fetch clears the slot.
#[derive(Debug)]
enum RelationSlot {
    Loading,
    Loaded(Vec<Arc<Entity>>),
}

/// One row in memory, bound to its entity definition.
#[derive(Debug)]
pub struct Entity {
    def: Arc<EntityDef>,
    data: Mutex<Record>,
    relations: Mutex<HashMap<String, RelationSlot, NameHasher>>,
    dirty: AtomicBool,
    binder: Arc<Binder>,
}

impl Entity {
    pub(crate) fn from_record(def: Arc<EntityDef>, record: Record, binder: Arc<Binder>) -> Entity {
        Entity {
            def,
            data: Mutex::new(record),
            relations: Mutex::new(HashMap::default()),
            dirty: AtomicBool::new(false),
            binder,
        }
    }

    pub fn def(&self) -> &EntityDef {
        &self.def
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Relaxed)
    }

    /// Current raw datum of a declared column.
    pub fn raw(&self, field: &str) -> Result<Raw> {
        self.def.field(field).ok_or_else(|| {
            EntwineError::Resolution(format!(
                "entity '{}' has no field '{}'",
                self.def.name, field
            ))
        })?;
        Ok(self
            .data
            .lock()
            .unwrap()
            .get(field)
            .cloned()
            .unwrap_or(Raw::Null))
    }

    /// The primary-key column and its current raw value, used as update
    /// criteria and for junction lookups.
    pub fn pk_raw(&self) -> Result<(String, Raw)> {
        let pk = self.def.require_primary()?;
        let raw = self.raw(&pk.name)?;
        if raw.is_null() {
            return Err(EntwineError::Resolution(format!(
                "row of '{}' has no primary key value",
                self.def.name
            )));
        }
        Ok((pk.name.clone(), raw))
    }

    /// Read a non-relation field as a freshly wrapped typed value.
    /// `None` means the stored datum is null/absent.
    pub fn get(&self, field: &str) -> Result<Option<Value>> {
        let def = self.def.field(field).ok_or_else(|| {
            EntwineError::Resolution(format!(
                "entity '{}' has no field '{}'",
                self.def.name, field
            ))
        })?;
        let raw = self
            .data
            .lock()
            .unwrap()
            .get(field)
            .cloned()
            .unwrap_or(Raw::Null);
        if raw.is_null() {
            return Ok(None);
        }
        Ok(Some(def.kind.wrap(&raw)?))
    }

    /// Write a non-relation field. The value is coerced to the declared
    /// kind (revalidating every cap) before its raw form is stored.
    pub fn set(&self, field: &str, value: &Value) -> Result<()> {
        let def = self.def.field(field).ok_or_else(|| {
            EntwineError::Resolution(format!(
                "entity '{}' has no field '{}'",
                self.def.name, field
            ))
        })?;
        let coerced = def.kind.wrap(&value.to_raw())?;
        self.data
            .lock()
            .unwrap()
            .insert(field.to_string(), coerced.to_raw());
        self.dirty.store(true, Ordering::Relaxed);
        Ok(())
    }

    /// Read a relation field, fetching through the adapter on first
    /// access. The resolved list is cached; later reads return it without
    /// touching storage.
    pub fn relation(&self, field: &str, adapter: &dyn Adapter) -> Result<Vec<Arc<Entity>>> {
        {
            let slots = self.relations.lock().unwrap();
            match slots.get(field) {
                Some(RelationSlot::Loaded(list)) => return Ok(list.clone()),
                Some(RelationSlot::Loading) => {
                    return Err(EntwineError::Resolution(format!(
                        "relation '{}' of '{}' is read while it is being loaded",
                        field, self.def.name
                    )))
                }
                None => {}
            }
        }
        self.relations
            .lock()
            .unwrap()
            .insert(field.to_string(), RelationSlot::Loading);
        match self.fetch_relation(field, adapter) {
            Ok(list) => {
                self.relations
                    .lock()
                    .unwrap()
                    .insert(field.to_string(), RelationSlot::Loaded(list.clone()));
                Ok(list)
            }
            Err(e) => {
                self.relations.lock().unwrap().remove(field);
                Err(e)
            }
        }
    }

    fn fetch_relation(&self, field: &str, adapter: &dyn Adapter) -> Result<Vec<Arc<Entity>>> {
        let decl = self.def.relation(field).ok_or_else(|| {
            EntwineError::Resolution(format!(
                "entity '{}' has no relation field '{}'",
                self.def.name, field
            ))
        })?;
        let target = self.binder.schema.resolve(&decl.target).ok_or_else(|| {
            EntwineError::Resolution(format!("unknown relation target '{}'", decl.target))
        })?;
        let link = self
            .binder
            .registry
            .get(&self.def.name, &target.name)
            .ok_or_else(|| {
                EntwineError::Resolution(format!(
                    "no synthesized relation between '{}' and '{}'",
                    self.def.name, target.name
                ))
            })?;
        let (_, pk_raw) = self.pk_raw()?;
        let target_pk = target.require_primary()?;

        let junction_rows =
            adapter.find(&link.table, &vec![(link.source_col.clone(), pk_raw)])?;
        let mut resolved = Vec::with_capacity(junction_rows.len());
        for row in junction_rows {
            let target_raw = row.get(&link.target_col).cloned().ok_or_else(|| {
                EntwineError::Storage(format!(
                    "junction '{}' row is missing column '{}'",
                    link.table, link.target_col
                ))
            })?;
            let criteria = vec![(target_pk.name.clone(), target_raw.clone())];
            match adapter.find_one(&target.name, &criteria)? {
                Some(record) => resolved.push(Arc::new(Entity::from_record(
                    Arc::clone(&target),
                    record,
                    Arc::clone(&self.binder),
                ))),
                None => {
                    warn!(
                        junction = %link.table,
                        entity = %target.name,
                        key = %target_raw,
                        "junction row points at a missing target row"
                    );
                }
            }
        }
        Ok(resolved)
    }

    /// Serialize to a plain tree: every declared field as its raw scalar,
    /// every already-materialized relation recursively. Unresolved slots
    /// are omitted, which also bounds expansion over cyclic graphs.
    pub fn to_tree(&self) -> serde_json::Value {
        let mut map = serde_json::Map::new();
        {
            let data = self.data.lock().unwrap();
            for field in &self.def.fields {
                let raw = data.get(&field.name).cloned().unwrap_or(Raw::Null);
                map.insert(field.name.clone(), raw_to_json(&raw));
            }
        }
        {
            let slots = self.relations.lock().unwrap();
            for decl in &self.def.relations {
                if let Some(RelationSlot::Loaded(list)) = slots.get(&decl.field) {
                    let items: Vec<serde_json::Value> =
                        list.iter().map(|entity| entity.to_tree()).collect();
                    map.insert(decl.field.clone(), serde_json::Value::Array(items));
                }
            }
        }
        serde_json::Value::Object(map)
    }
}

/// Raw scalar to JSON, for result trees.
pub(crate) fn raw_to_json(raw: &Raw) -> serde_json::Value {
    match raw {
        Raw::Null => serde_json::Value::Null,
        Raw::Integer(i) => serde_json::Value::Number((*i).into()),
        Raw::Text(t) => serde_json::Value::String(t.clone()),
    }
}
