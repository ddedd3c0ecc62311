//! Schema model and synthesis: entity definitions, the relation registry,
//! and the validation / table / junction / orphan-trigger passes that run
//! inside `Engine::parse` once the schema text has been read.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::Arc;

use core::hash::BuildHasherDefault;
use seahash::SeaHasher;
use tracing::warn;

use crate::adapter::{Adapter, JunctionLayout, OwnerCheck};
use crate::datatype::{Value, ValueKind};
use crate::error::{EntwineError, Result};

/// Hasher for engine-internal maps keyed by names.
pub type NameHasher = BuildHasherDefault<SeaHasher>;

// ------------- Field -------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldAttribute {
    Primary,
    NotNull,
    Unique,
}

impl FieldAttribute {
    pub fn parse(text: &str) -> Result<FieldAttribute> {
        match text.trim().to_ascii_lowercase().as_str() {
            "primary" => Ok(FieldAttribute::Primary),
            "not null" => Ok(FieldAttribute::NotNull),
            "unique" => Ok(FieldAttribute::Unique),
            other => Err(EntwineError::Schema(format!(
                "unknown field attribute '{}'",
                other
            ))),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            FieldAttribute::Primary => "primary",
            FieldAttribute::NotNull => "not null",
            FieldAttribute::Unique => "unique",
        }
    }
}

/// One declared column. The default value stays textual and is parsed
/// lazily, at first use, by the declared kind.
#[derive(Debug, Clone)]
pub struct FieldDef {
    pub name: String,
    /// The type token as written, e.g. `number[10.2]`.
    pub raw_type: String,
    pub kind: ValueKind,
    pub default_value: Option<String>,
    pub attributes: Vec<FieldAttribute>,
}

impl FieldDef {
    pub fn new(
        name: String,
        raw_type: String,
        default_value: Option<String>,
        attributes: Vec<FieldAttribute>,
    ) -> Result<FieldDef> {
        let kind = ValueKind::parse(&raw_type)?;
        Ok(FieldDef {
            name,
            raw_type,
            kind,
            default_value,
            attributes,
        })
    }

    pub fn is_primary(&self) -> bool {
        self.attributes.contains(&FieldAttribute::Primary)
    }
    pub fn is_not_null(&self) -> bool {
        self.attributes.contains(&FieldAttribute::NotNull)
    }
    pub fn is_unique(&self) -> bool {
        self.attributes.contains(&FieldAttribute::Unique)
    }

    /// Parse the declared default, if any.
    pub fn default(&self) -> Result<Option<Value>> {
        match &self.default_value {
            Some(text) => Ok(Some(self.kind.parse_literal(text)?)),
            None => Ok(None),
        }
    }
}

// ------------- Entity -------------

/// A declared relation: a `List[Target]` field on this entity.
#[derive(Debug, Clone)]
pub struct RelationDecl {
    pub field: String,
    pub target: String,
}

/// One schema type: its declared fields in order, its relation fields, and
/// the owner annotation that makes it subject to orphan removal.
#[derive(Debug, Clone)]
pub struct EntityDef {
    pub name: String,
    pub fields: Vec<FieldDef>,
    pub relations: Vec<RelationDecl>,
    pub owners: Vec<String>,
}

impl EntityDef {
    pub fn field(&self, name: &str) -> Option<&FieldDef> {
        self.fields.iter().find(|f| f.name == name)
    }

    pub fn relation(&self, field: &str) -> Option<&RelationDecl> {
        self.relations.iter().find(|r| r.field == field)
    }

    pub fn primary_field(&self) -> Option<&FieldDef> {
        self.fields.iter().find(|f| f.is_primary())
    }

    /// The primary-key field, required for identity-based operations.
    pub fn require_primary(&self) -> Result<&FieldDef> {
        self.primary_field().ok_or_else(|| {
            EntwineError::Schema(format!("entity '{}' has no primary key field", self.name))
        })
    }

    /// An entity with owners is reclaimed once its last owner link drops.
    pub fn is_owned(&self) -> bool {
        !self.owners.is_empty()
    }
}

// ------------- Schema dictionary -------------

/// All declared entities, resolvable case-insensitively. Immutable after
/// `parse` returns.
#[derive(Debug, Default)]
pub struct SchemaDict {
    entities: HashMap<String, Arc<EntityDef>, NameHasher>,
    order: Vec<String>,
}

impl SchemaDict {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, def: EntityDef) -> Result<()> {
        let key = def.name.to_lowercase();
        match self.entities.entry(key.clone()) {
            Entry::Vacant(entry) => {
                entry.insert(Arc::new(def));
                self.order.push(key);
                Ok(())
            }
            Entry::Occupied(_) => Err(EntwineError::Schema(format!(
                "duplicate entity name '{}'",
                def.name
            ))),
        }
    }

    pub fn resolve(&self, name: &str) -> Option<Arc<EntityDef>> {
        self.entities.get(&name.to_lowercase()).cloned()
    }

    /// Entities in declaration order.
    pub fn iter(&self) -> impl Iterator<Item = Arc<EntityDef>> + '_ {
        self.order
            .iter()
            .map(move |key| Arc::clone(&self.entities[key]))
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }
    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }
}

// ------------- Relation registry -------------

/// One direction of a synthesized relation: from `source` rows to `target`
/// rows through `table`, where `source_col`/`target_col` are the junction
/// columns carrying the respective primary keys.
#[derive(Debug, Clone)]
pub struct RelationLink {
    pub source: String,
    pub target: String,
    pub table: String,
    pub source_col: String,
    pub target_col: String,
}

/// Both directions of every synthesized relation, even when the schema
/// declared only one side. Immutable after `parse` returns.
#[derive(Debug, Default)]
pub struct RelationRegistry {
    links: HashMap<(String, String), RelationLink, NameHasher>,
}

impl RelationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn register(&mut self, link: RelationLink) {
        let key = (link.source.to_lowercase(), link.target.to_lowercase());
        self.links.entry(key).or_insert(link);
    }

    pub fn get(&self, source: &str, target: &str) -> Option<&RelationLink> {
        self.links
            .get(&(source.to_lowercase(), target.to_lowercase()))
    }

    pub fn len(&self) -> usize {
        self.links.len()
    }
}

// ------------- Synthesis passes -------------

/// Pass 2: schema validation. Raised errors name the offending entity and
/// field; an owner that is declared but never linked by a relation is only
/// worth a warning.
pub fn validate(dict: &SchemaDict) -> Result<()> {
    for entity in dict.iter() {
        let mut primaries = entity.fields.iter().filter(|f| f.is_primary());
        if primaries.nth(1).is_some() {
            return Err(EntwineError::Schema(format!(
                "entity '{}' declares more than one [primary] field",
                entity.name
            )));
        }
        for relation in &entity.relations {
            if dict.resolve(&relation.target).is_none() {
                return Err(EntwineError::Schema(format!(
                    "entity '{}' field '{}' references unknown entity '{}'",
                    entity.name, relation.field, relation.target
                )));
            }
        }
        for owner in &entity.owners {
            let owner_def = dict.resolve(owner).ok_or_else(|| {
                EntwineError::Schema(format!(
                    "entity '{}' names unknown owner '{}'",
                    entity.name, owner
                ))
            })?;
            let linked = entity
                .relations
                .iter()
                .any(|r| r.target.eq_ignore_ascii_case(owner))
                || owner_def
                    .relations
                    .iter()
                    .any(|r| r.target.eq_ignore_ascii_case(&entity.name));
            if !linked {
                warn!(
                    entity = %entity.name,
                    owner = %owner,
                    "owner is not referenced by any relation between the two entities"
                );
            }
        }
    }
    Ok(())
}

/// Synthesize the physical table of every entity (runs after validation;
/// parsing never touches the adapter).
pub fn synthesize_tables(dict: &SchemaDict, adapter: &mut dyn Adapter) -> Result<()> {
    for entity in dict.iter() {
        adapter.ensure_table(&entity.name, &entity)?;
    }
    Ok(())
}

/// Pass 3: relation synthesis. Each declared `List[Target]` produces one
/// junction table (shared by both directions) and registers both
/// directions in the registry.
pub fn synthesize_relations(
    dict: &SchemaDict,
    adapter: &mut dyn Adapter,
) -> Result<RelationRegistry> {
    let mut registry = RelationRegistry::new();
    for entity in dict.iter() {
        for relation in &entity.relations {
            let target = dict.resolve(&relation.target).ok_or_else(|| {
                EntwineError::Schema(format!("unknown relation target '{}'", relation.target))
            })?;
            let source_pk = entity.require_primary()?;
            let target_pk = target.require_primary()?;
            adapter.ensure_relation_table(
                &entity.name,
                &source_pk.name,
                &target.name,
                &target_pk.name,
            )?;
            let layout =
                JunctionLayout::of(&entity.name, &source_pk.name, &target.name, &target_pk.name);
            registry.register(RelationLink {
                source: entity.name.clone(),
                target: target.name.clone(),
                table: layout.table.clone(),
                source_col: layout.column_for(&entity.name).to_string(),
                target_col: layout.column_for(&target.name).to_string(),
            });
            registry.register(RelationLink {
                source: target.name.clone(),
                target: entity.name.clone(),
                table: layout.table.clone(),
                source_col: layout.column_for(&target.name).to_string(),
                target_col: layout.column_for(&entity.name).to_string(),
            });
        }
    }
    Ok(registry)
}

/// Pass 4: orphan-trigger synthesis. For an owned entity `E`, every owner
/// junction gets one `AFTER DELETE` trigger whose body probes **all**
/// owner junctions, so an `E` row is removed exactly when its last owner
/// link is dropped.
pub fn synthesize_orphan_triggers(
    dict: &SchemaDict,
    registry: &RelationRegistry,
    adapter: &mut dyn Adapter,
) -> Result<()> {
    for entity in dict.iter() {
        if !entity.is_owned() {
            continue;
        }
        let pk = entity.require_primary()?;
        let mut checks: Vec<OwnerCheck> = Vec::new();
        let mut seen_tables: Vec<String> = Vec::new();
        for owner in &entity.owners {
            let link = match registry.get(owner, &entity.name) {
                Some(link) => link,
                // unlinked owner, already warned during validation
                None => continue,
            };
            if seen_tables.contains(&link.table) {
                continue;
            }
            seen_tables.push(link.table.clone());
            checks.push(OwnerCheck {
                table: link.table.clone(),
                target_col: link.target_col.clone(),
            });
        }
        for check in &checks {
            adapter.ensure_orphan_trigger(
                &entity.name,
                &pk.name,
                &check.table,
                &check.target_col,
                &checks,
            )?;
        }
    }
    Ok(())
}
