//! Storage backend seam
//!
//! The engine compiles and validates queries; a [`StorageBackend`] executes
//! them. Backends receive pre-validated descriptors and specs and are free
//! to render them into any dialect (or, like [`crate::memory::MemoryBackend`],
//! evaluate them directly). All calls are synchronous and block the invoking
//! thread.

use std::collections::BTreeMap;

use uuid::Uuid;

use crate::error::ExecError;
use crate::metadata::TableDescriptor;
use crate::query::QuerySpec;
use crate::registry::Registry;
use crate::value::Value;

/// A stored row: field name to value.
pub type Row = BTreeMap<String, Value>;

/// A joined result row: `entity.field` (or a function alias) to value.
pub type QueryRow = BTreeMap<String, Value>;

/// Key of a cell in a [`QueryRow`].
pub fn cell_key(entity: &str, field: &str) -> String {
    format!("{entity}.{field}")
}

/// Contract every relational backend implements.
///
/// Write operations carry the transactional code of the issuing client so
/// the backend can scope its undo/visibility bookkeeping; `None` marks an
/// auto-committed write. `fetch` and `select` take an optional lock owner
/// for pessimistic reads.
pub trait StorageBackend: Send + Sync {
    fn drop_table(&self, table: &TableDescriptor) -> Result<(), ExecError>;

    fn insert(
        &self,
        table: &TableDescriptor,
        rows: Vec<Row>,
        txn: Option<Uuid>,
    ) -> Result<usize, ExecError>;

    /// Update the row identified by `key`; returns affected row count.
    fn update(
        &self,
        table: &TableDescriptor,
        key: &Row,
        changes: &Row,
        txn: Option<Uuid>,
    ) -> Result<u64, ExecError>;

    fn delete(&self, table: &TableDescriptor, key: &Row, txn: Option<Uuid>)
        -> Result<u64, ExecError>;

    /// Single-row fetch by equality on `params`. A `lock` owner takes a
    /// pessimistic lock on the matched row.
    fn fetch(
        &self,
        table: &TableDescriptor,
        params: &Row,
        lock: Option<Uuid>,
    ) -> Result<Option<Row>, ExecError>;

    /// Execute a compiled spec; the pager limits the materialized window.
    fn select(
        &self,
        spec: &QuerySpec,
        registry: &Registry,
        lock: Option<Uuid>,
    ) -> Result<Vec<QueryRow>, ExecError>;

    /// Row count for the spec's predicate, ignoring the pager.
    fn count(&self, spec: &QuerySpec, registry: &Registry) -> Result<u64, ExecError>;

    /// Make the transaction's writes durable and release its locks.
    fn commit(&self, txn: Uuid) -> Result<(), ExecError>;

    /// Undo the transaction's writes and release its locks.
    fn rollback(&self, txn: Uuid) -> Result<(), ExecError>;
}
