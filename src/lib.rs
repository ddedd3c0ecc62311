//! Entwine – a declarative persistence engine driven by the Parley DSL.
//!
//! Entwine ingests one source text containing two kinds of blocks:
//! * *Schema blocks* declare entity types with typed fields
//!   (`number[P.S]`, `str[L]`, `bool`, `datetime`), primary-key /
//!   not-null / unique constraints, many-to-many relations
//!   (`List[Target]`) and a life-cycle ownership annotation
//!   (`Owned (Owner1, Owner2) { … }`).
//! * *Procedure blocks* define executable procedures over that schema in
//!   a natural-language-like vocabulary (`Get`, `Create`, `Update`,
//!   `Set`, `If`, `For Each`, `return`). Each invocation runs as one
//!   ACID transaction.
//!
//! ## Modules
//! * [`datatype`] – the tagged [`datatype::Value`] union with
//!   precision-exact decimal arithmetic (scale/precision caps are
//!   construction-time errors, never silent rounding).
//! * [`entity`] – in-memory rows with typed access and lazily loaded,
//!   cached relation lists.
//! * [`adapter`] – the storage contract both back ends implement.
//! * [`persist`] – the relational back end (SQLite): table synthesis,
//!   junction tables with cascade-delete foreign keys, and the
//!   `AFTER DELETE` orphan-removal triggers that reclaim owned rows the
//!   moment their last owner link drops.
//! * [`snapshot`] – the JSON snapshot back end: one in-memory document,
//!   shadow-copy transactions, self-enforced constraints (no orphan GC).
//! * [`parley`] – the DSL parser + evaluator and the [`parley::Engine`]
//!   entry point (`parse → call* → close`).
//! * [`interface`] – a cloneable runtime handle serializing invocations.
//!
//! ## Quick Start
//! ```no_run
//! use entwine::parley::{Argument, Engine};
//! use entwine::persist::{PersistenceMode, SqliteAdapter};
//!
//! let source = "
//! Item { number:id [primary], str[50]:name, number[10.2]:price }
//!
//! CreateItem(number:id, str[50]:name, number:price):
//!     Create a Item with id of {id} and name of {name} and price of {price} as item
//!     return {item}
//! ";
//! let adapter = SqliteAdapter::new(PersistenceMode::InMemory).unwrap();
//! let engine = Engine::parse(source, adapter).unwrap();
//! let mut args = std::collections::HashMap::new();
//! args.insert("id".to_string(), Argument::from(1));
//! args.insert("name".to_string(), Argument::from("Sword"));
//! args.insert("price".to_string(), Argument::from("100.50"));
//! let item = engine.call("CreateItem", args).unwrap();
//! assert_eq!(item["price"], "100.50");
//! ```
//!
//! ## Ownership and orphan removal
//! An entity declared as `Student (Class) { … }` is *owned*: junction
//! deletions trigger storage-level garbage collection that removes a
//! student row exactly when its last owner link is gone. The rule lives
//! in triggers so any path to the junction table — DSL, raw SQL,
//! cascade — observes it.
//!
//! ## Status
//! The engine is deliberately small: no planner, no migrations of
//! pre-existing tables, no replication. The adapter contract is the
//! extension point for further back ends.

pub mod adapter;
pub mod datatype;
pub mod entity;
pub mod error;
pub mod interface;
pub mod parley;
pub mod persist;
pub mod schema;
pub mod snapshot;
