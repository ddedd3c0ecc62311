//! Relational back end: SQLite schema synthesis and row storage.
//!
//! The `SqliteAdapter` turns entity definitions into `STRICT` tables,
//! relations into junction tables with cascade-delete foreign keys and
//! per-column indexes, and ownership annotations into `AFTER DELETE`
//! triggers that reclaim orphaned rows at the storage layer. Decimals and
//! datetimes are stored as text for exact fidelity, booleans as 0/1.
//!
//! # Transactions
//! One logical transaction at a time, taken with `BEGIN EXCLUSIVE` (the
//! strictest isolation SQLite offers). A nested begin is a `Transaction`
//! error; commit/rollback without a begin likewise.
//!
//! # Identifier quoting
//! Every identifier reaching SQL text is quoted. Declared names are plain
//! identifiers in practice, but the adapter does not rely on that.

// used for persistence
use rusqlite::{params_from_iter, Connection};

// our own stuff
use crate::adapter::{Adapter, Criteria, OwnerCheck, Record};
use crate::datatype::{Raw, ValueKind};
use crate::error::{EntwineError, Result};
use crate::schema::EntityDef;

/// Where the relational store lives. In-memory databases vanish on close;
/// file-backed databases survive reopening.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PersistenceMode {
    InMemory,
    File(String),
}

pub struct SqliteAdapter {
    mode: PersistenceMode,
    connection: Option<Connection>,
    in_transaction: bool,
}

fn quote(identifier: &str) -> String {
    format!("\"{}\"", identifier.replace('"', "\"\""))
}

fn column_type(kind: &ValueKind) -> &'static str {
    match kind {
        ValueKind::Bool => "INTEGER",
        ValueKind::Number { .. } | ValueKind::String { .. } | ValueKind::DateTime => "TEXT",
    }
}

impl SqliteAdapter {
    pub fn new(mode: PersistenceMode) -> Result<SqliteAdapter> {
        let connection = match &mode {
            PersistenceMode::InMemory => Connection::open_in_memory()?,
            PersistenceMode::File(path) => Connection::open(path)?,
        };
        Ok(SqliteAdapter {
            mode,
            connection: Some(connection),
            in_transaction: false,
        })
    }

    pub fn mode(&self) -> &PersistenceMode {
        &self.mode
    }

    fn connection(&self) -> Result<&Connection> {
        self.connection
            .as_ref()
            .ok_or_else(|| EntwineError::Storage("adapter is closed".into()))
    }

    /// Run arbitrary SQL against the store. Outside the adapter contract;
    /// exists so callers can reach rows the DSL does not cover (seeding
    /// junction rows, dropping owner links, inspection).
    pub fn execute_raw(&self, sql: &str) -> Result<usize> {
        Ok(self.connection()?.execute(sql, [])?)
    }

    fn where_clause<'a>(criteria: &'a Criteria) -> (String, Vec<&'a Raw>) {
        if criteria.is_empty() {
            return (String::new(), Vec::new());
        }
        let mut parts = Vec::new();
        let mut params: Vec<&Raw> = Vec::new();
        for (column, raw) in criteria {
            if raw.is_null() {
                parts.push(format!("{} is null", quote(column)));
            } else {
                params.push(raw);
                parts.push(format!("{} = ?{}", quote(column), params.len()));
            }
        }
        (format!(" where {}", parts.join(" and ")), params)
    }

    fn select(&self, name: &str, criteria: &Criteria, limit_one: bool) -> Result<Vec<Record>> {
        let (where_sql, params) = Self::where_clause(criteria);
        let sql = format!(
            "select * from {}{}{}",
            quote(name),
            where_sql,
            if limit_one { " limit 1" } else { "" }
        );
        let connection = self.connection()?;
        let mut statement = connection.prepare(&sql)?;
        let names: Vec<String> = statement
            .column_names()
            .iter()
            .map(|n| n.to_string())
            .collect();
        let mut rows = statement.query(params_from_iter(params))?;
        let mut records = Vec::new();
        while let Some(row) = rows.next()? {
            let mut record = Record::new();
            for (index, column) in names.iter().enumerate() {
                record.insert(column.clone(), row.get::<_, Raw>(index)?);
            }
            records.push(record);
        }
        Ok(records)
    }
}

impl Adapter for SqliteAdapter {
    fn init(&mut self) -> Result<()> {
        let connection = self.connection()?;
        // WAL only matters for file-backed stores; in-memory ignores it
        let _ = connection.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;");
        connection.execute_batch("PRAGMA foreign_keys=ON;")?;
        connection.busy_timeout(std::time::Duration::from_millis(5000))?;
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        if self.in_transaction {
            return Err(EntwineError::Transaction(
                "close inside an open transaction".into(),
            ));
        }
        if let Some(connection) = self.connection.take() {
            connection
                .close()
                .map_err(|(_, e)| EntwineError::Storage(e.to_string()))?;
        }
        Ok(())
    }

    fn ensure_table(&mut self, name: &str, def: &EntityDef) -> Result<()> {
        let mut columns = Vec::new();
        let mut primary = Vec::new();
        for field in &def.fields {
            let mut column = format!("{} {}", quote(&field.name), column_type(&field.kind));
            if field.is_primary() || field.is_not_null() {
                column.push_str(" not null");
            }
            if field.is_unique() {
                column.push_str(" unique");
            }
            columns.push(column);
            if field.is_primary() {
                primary.push(quote(&field.name));
            }
        }
        if !primary.is_empty() {
            columns.push(format!(
                "constraint {} primary key ({})",
                quote(&format!("{}_pk", name)),
                primary.join(", ")
            ));
        }
        let sql = format!(
            "create table if not exists {} (\n    {}\n) STRICT;",
            quote(name),
            columns.join(",\n    ")
        );
        self.connection()?.execute_batch(&sql)?;
        Ok(())
    }

    fn ensure_relation_table(&mut self, e1: &str, pk1: &str, e2: &str, pk2: &str) -> Result<()> {
        let layout = crate::adapter::JunctionLayout::of(e1, pk1, e2, pk2);
        let (first_pk, second_pk) = if layout.first_entity.eq_ignore_ascii_case(e1) {
            (pk1, pk2)
        } else {
            (pk2, pk1)
        };
        let sql = format!(
            "create table if not exists {table} (\n    \
                {c1} TEXT not null,\n    \
                {c2} TEXT not null,\n    \
                \"create_time\" TEXT not null default (datetime('now')),\n    \
                constraint {pk} primary key ({c1}, {c2}),\n    \
                foreign key ({c1}) references {p1}({k1}) on delete cascade,\n    \
                foreign key ({c2}) references {p2}({k2}) on delete cascade\n\
            ) STRICT;\n\
            create index if not exists {i1} on {table}({c1});\n\
            create index if not exists {i2} on {table}({c2});",
            table = quote(&layout.table),
            c1 = quote(&layout.first_col),
            c2 = quote(&layout.second_col),
            pk = quote(&format!("{}_pk", layout.table)),
            p1 = quote(&layout.first_entity),
            k1 = quote(first_pk),
            p2 = quote(&layout.second_entity),
            k2 = quote(second_pk),
            i1 = quote(&format!("idx_{}_{}", layout.table, layout.first_col)),
            i2 = quote(&format!("idx_{}_{}", layout.table, layout.second_col)),
        );
        self.connection()?.execute_batch(&sql)?;
        Ok(())
    }

    fn ensure_orphan_trigger(
        &mut self,
        target_entity: &str,
        target_pk: &str,
        trigger_table: &str,
        target_id_col: &str,
        all_checks: &[OwnerCheck],
    ) -> Result<()> {
        let mut probes = Vec::new();
        for check in all_checks {
            probes.push(format!(
                "and not exists (select 1 from {} where {}.{} = OLD.{})",
                quote(&check.table),
                quote(&check.table),
                quote(&check.target_col),
                quote(target_id_col)
            ));
        }
        let trigger_name = format!(
            "auto_gc_{}_from_{}",
            target_entity.to_lowercase(),
            trigger_table
        );
        let sql = format!(
            "create trigger if not exists {name}\n\
             after delete on {table}\n\
             begin\n    \
                delete from {target} where {pk} = OLD.{id_col}\n    {probes};\n\
             end;",
            name = quote(&trigger_name),
            table = quote(trigger_table),
            target = quote(target_entity),
            pk = quote(target_pk),
            id_col = quote(target_id_col),
            probes = probes.join("\n    "),
        );
        self.connection()?.execute_batch(&sql)?;
        Ok(())
    }

    fn find_one(&self, name: &str, criteria: &Criteria) -> Result<Option<Record>> {
        Ok(self.select(name, criteria, true)?.into_iter().next())
    }

    fn find(&self, name: &str, criteria: &Criteria) -> Result<Vec<Record>> {
        self.select(name, criteria, false)
    }

    fn insert(&mut self, name: &str, record: &Record) -> Result<()> {
        let columns: Vec<String> = record.keys().map(|k| quote(k)).collect();
        let placeholders: Vec<String> = (1..=record.len()).map(|i| format!("?{}", i)).collect();
        let sql = format!(
            "insert into {} ({}) values ({})",
            quote(name),
            columns.join(", "),
            placeholders.join(", ")
        );
        self.connection()?
            .execute(&sql, params_from_iter(record.values()))?;
        Ok(())
    }

    fn update(&mut self, name: &str, pk_criteria: &Criteria, updates: &Record) -> Result<()> {
        if updates.is_empty() {
            return Ok(());
        }
        let mut assignments = Vec::new();
        let mut params: Vec<&Raw> = Vec::new();
        for (column, raw) in updates {
            params.push(raw);
            assignments.push(format!("{} = ?{}", quote(column), params.len()));
        }
        let mut conditions = Vec::new();
        for (column, raw) in pk_criteria {
            if raw.is_null() {
                conditions.push(format!("{} is null", quote(column)));
            } else {
                params.push(raw);
                conditions.push(format!("{} = ?{}", quote(column), params.len()));
            }
        }
        let sql = format!(
            "update {} set {}{}",
            quote(name),
            assignments.join(", "),
            if conditions.is_empty() {
                String::new()
            } else {
                format!(" where {}", conditions.join(" and "))
            }
        );
        self.connection()?
            .execute(&sql, params_from_iter(params))?;
        Ok(())
    }

    fn begin_transaction(&mut self) -> Result<()> {
        if self.in_transaction {
            return Err(EntwineError::Transaction(
                "a transaction is already open".into(),
            ));
        }
        self.connection()?.execute_batch("BEGIN EXCLUSIVE;")?;
        self.in_transaction = true;
        Ok(())
    }

    fn commit(&mut self) -> Result<()> {
        if !self.in_transaction {
            return Err(EntwineError::Transaction("commit without a begin".into()));
        }
        self.connection()?.execute_batch("COMMIT;")?;
        self.in_transaction = false;
        Ok(())
    }

    fn rollback(&mut self) -> Result<()> {
        if !self.in_transaction {
            return Err(EntwineError::Transaction("rollback without a begin".into()));
        }
        self.connection()?.execute_batch("ROLLBACK;")?;
        self.in_transaction = false;
        Ok(())
    }
}
