//! # tablemap
//!
//! A schema-driven object-relational mapping engine.
//!
//! Entity types are described once as declarative descriptors (table,
//! columns, primary key, indexes, references, key generator); the engine
//! resolves them into an immutable registry, validates and compiles every
//! query against it, and materializes rows back into tracked records with
//! dirty tracking, lazy loading and transactional ownership. Storage is
//! pluggable behind the synchronous [`StorageBackend`] seam; the bundled
//! [`MemoryBackend`] is a complete reference implementation.
//!
//! ## Features
//!
//! - **Descriptor registry**: per-entity metadata built once, replaced
//!   atomically, shared process-wide
//! - **Composable conditions**: a validated boolean expression tree over
//!   columns, constants, functions, ranges, sets and sub-queries
//! - **Fail-fast query builder**: joins, projections, grouping, sort-coded
//!   ordering, paging and pessimistic locking, checked call by call
//! - **Record lifecycle**: load/modify tracking, write-once transaction
//!   binding, lazy columns and references with contained failures
//! - **Transaction-scoped clients**: time-ordered transactional codes,
//!   rollback policy per error kind, wholesale timeout rollback
//!
//! ## Quick Start
//!
//! ```rust
//! use std::sync::Arc;
//! use tablemap::{
//!     ColumnDescriptor, ColumnKind, Condition, DatabaseManager, EngineConfig,
//!     MemoryBackend, QueryBuilder, Record, SortDirection, TableDescriptor,
//! };
//!
//! fn main() -> tablemap::Result<()> {
//!     let manager = DatabaseManager::new(Arc::new(MemoryBackend::new()), EngineConfig::default());
//!     manager.initialize();
//!
//!     manager.register_tables([TableDescriptor::new("product", "products")
//!         .column(ColumnDescriptor::new("id", ColumnKind::Number).primary_key())
//!         .column(ColumnDescriptor::new("name", ColumnKind::Text).not_null())
//!         .column(ColumnDescriptor::new("price", ColumnKind::decimal(10, 2)))])?;
//!
//!     let client = manager.generate_client();
//!     let mut record = Record::new("product");
//!     record.set("id", 1i64);
//!     record.set("name", "Blue Widget");
//!     record.set("price", 30i64);
//!     client.save_records(std::slice::from_mut(&mut record))?;
//!     client.end_transactional()?;
//!
//!     let spec = QueryBuilder::new(manager.registry(), "product")?
//!         .filter(Condition::like(manager.registry(), "product", "name", "Blue%")?)?
//!         .order_by("product", "price", 1, SortDirection::Desc)?
//!         .page(1, 10)?
//!         .confirm()?;
//!
//!     let results = manager.read_only_client().query(&spec)?;
//!     assert_eq!(results.total, 1);
//!     Ok(())
//! }
//! ```

pub mod backend;
pub mod client;
pub mod condition;
pub mod config;
pub mod context;
pub mod error;
mod eval;
pub mod ident;
pub mod manager;
pub mod memory;
pub mod metadata;
pub mod provider;
pub mod query;
pub mod record;
pub mod registry;
pub mod value;

// Re-export main types for convenience
pub use backend::{cell_key, QueryRow, Row, StorageBackend};
pub use client::{DatabaseClient, OperationMode, Operator, PartialCollection};
pub use condition::{CompareOp, Condition, Connector, Param};
pub use config::{EngineConfig, EngineConfigBuilder};
pub use context::{
    ContextRegistry, IsolationLevel, RollbackTrigger, TransactionContext, TransactionOptions,
};
pub use error::{
    BuilderError, ExecError, LifecycleError, OrmError, Result, TableConfigError,
};
pub use manager::DatabaseManager;
pub use memory::MemoryBackend;
pub use metadata::{
    Cardinality, Cascade, ColumnDescriptor, ColumnKind, DropPolicy, GeneratorDescriptor,
    IndexDescriptor, LockPolicy, ReferenceDescriptor, SequenceSpec, TableDescriptor,
};
pub use provider::{DataProvider, VerifyProvider};
pub use query::{
    GroupEntry, Join, JoinKind, LockOption, OrderEntry, Pager, Projection, QueryBuilder,
    QuerySpec, SortDirection,
};
pub use record::{Entity, LazyResolver, Record, RecordState};
pub use registry::Registry;
pub use value::Value;

// Re-export identifier utilities for backend implementations
pub use ident::{quote_identifier, validate_identifier};
