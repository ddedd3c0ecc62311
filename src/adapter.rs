//! Storage adapter contract shared by the relational and snapshot back
//! ends. The engine only ever talks to storage through this trait; a new
//! back end implements every operation (orphan triggers may be a
//! documented no-op).

use std::collections::BTreeMap;

use crate::datatype::Raw;
use crate::error::Result;
use crate::schema::EntityDef;

/// One persisted row in raw form, keyed by column name.
pub type Record = BTreeMap<String, Raw>;

/// Equality criteria over raw column values.
pub type Criteria = Vec<(String, Raw)>;

/// One `NOT EXISTS` probe of an orphan-removal trigger: a junction table
/// connecting the owned entity to one of its owners, and the column in
/// that junction referring to the owned entity's primary key.
#[derive(Debug, Clone)]
pub struct OwnerCheck {
    pub table: String,
    pub target_col: String,
}

/// The physical layout of a junction table. Naming depends only on the
/// case-insensitive lexicographic order of the two entity names, so
/// declaring a relation from either side synthesizes the same table.
#[derive(Debug, Clone)]
pub struct JunctionLayout {
    pub table: String,
    /// Lexicographically first entity: declared name, junction column.
    pub first_entity: String,
    pub first_col: String,
    /// Lexicographically second entity: declared name, junction column.
    pub second_entity: String,
    pub second_col: String,
}

impl JunctionLayout {
    pub fn of(e1: &str, pk1: &str, e2: &str, pk2: &str) -> JunctionLayout {
        let a = (e1.to_lowercase(), e1, pk1);
        let b = (e2.to_lowercase(), e2, pk2);
        let ((first_lower, first, first_pk), (second_lower, second, second_pk)) =
            if a.0 <= b.0 { (a, b) } else { (b, a) };
        JunctionLayout {
            table: format!("{}_{}", first_lower, second_lower),
            first_entity: first.to_string(),
            first_col: format!("{}_{}", first_lower, first_pk),
            second_entity: second.to_string(),
            second_col: format!("{}_{}", second_lower, second_pk),
        }
    }

    /// The junction column referring to the given entity.
    pub fn column_for(&self, entity: &str) -> &str {
        if self.first_entity.eq_ignore_ascii_case(entity) {
            &self.first_col
        } else {
            &self.second_col
        }
    }
}

/// The storage contract of §adapter. Reads take `&self`, writes take
/// `&mut self`; a transaction holds the adapter exclusively from
/// `begin_transaction` to `commit` or `rollback`, and a nested begin is a
/// `Transaction` error on every back end.
pub trait Adapter {
    /// Open or create the store.
    fn init(&mut self) -> Result<()>;
    /// Flush and finalize. The adapter is unusable afterwards.
    fn close(&mut self) -> Result<()>;

    /// Idempotently create the physical table for an entity.
    fn ensure_table(&mut self, name: &str, def: &EntityDef) -> Result<()>;
    /// Idempotently create the junction table for a relation between two
    /// entities, identified by their declared names and primary-key field
    /// names.
    fn ensure_relation_table(&mut self, e1: &str, pk1: &str, e2: &str, pk2: &str) -> Result<()>;
    /// Install the orphan-removal trigger for one owner junction. Back
    /// ends without trigger support treat this as a no-op and document
    /// that orphan removal is unavailable.
    fn ensure_orphan_trigger(
        &mut self,
        target_entity: &str,
        target_pk: &str,
        trigger_table: &str,
        target_id_col: &str,
        all_checks: &[OwnerCheck],
    ) -> Result<()>;

    fn find_one(&self, name: &str, criteria: &Criteria) -> Result<Option<Record>>;
    fn find(&self, name: &str, criteria: &Criteria) -> Result<Vec<Record>>;
    fn insert(&mut self, name: &str, record: &Record) -> Result<()>;
    /// Update at most one row matching the criteria.
    fn update(&mut self, name: &str, pk_criteria: &Criteria, updates: &Record) -> Result<()>;

    fn begin_transaction(&mut self) -> Result<()>;
    fn commit(&mut self) -> Result<()>;
    fn rollback(&mut self) -> Result<()>;
}
