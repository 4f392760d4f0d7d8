//! Record instances and lifecycle state
//!
//! Every row the engine materializes is wrapped in a [`Record`]: a dynamic
//! field map plus the per-instance [`RecordState`] that tracks which fields
//! are loaded, which have been overwritten, and which transaction owns the
//! instance. Lazy columns and references resolve synchronously on first
//! access through an attached [`LazyResolver`]; resolution failures are
//! contained (the field lands on its zero value, the error is logged and
//! parked on a last-error channel), never thrown from an accessor.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::backend::Row;
use crate::error::{OrmError, Result};
use crate::metadata::TableDescriptor;
use crate::value::Value;

static NULL_VALUE: Value = Value::Null;

/// Per-instance bookkeeping of the record lifecycle.
///
/// `for_update` and `transactional_code` are write-once: the first binding
/// wins and later bindings are ignored. A field enters the modified set only
/// when an already-loaded value is overwritten; the first write of an
/// unloaded field establishes the baseline instead.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordState {
    is_new: bool,
    for_update: Option<bool>,
    transactional_code: Option<Uuid>,
    loaded: BTreeSet<String>,
    modified: BTreeSet<String>,
}

impl RecordState {
    pub(crate) fn new_record() -> Self {
        Self {
            is_new: true,
            for_update: None,
            transactional_code: None,
            loaded: BTreeSet::new(),
            modified: BTreeSet::new(),
        }
    }

    pub(crate) fn attached(loaded: BTreeSet<String>) -> Self {
        Self {
            is_new: false,
            for_update: None,
            transactional_code: None,
            loaded,
            modified: BTreeSet::new(),
        }
    }

    pub const fn is_new(&self) -> bool {
        self.is_new
    }

    pub fn for_update(&self) -> bool {
        self.for_update.unwrap_or(false)
    }

    pub const fn transactional_code(&self) -> Option<Uuid> {
        self.transactional_code
    }

    /// Bind the for-update flag; first assignment wins.
    pub fn bind_for_update(&mut self, for_update: bool) {
        if self.for_update.is_none() {
            self.for_update = Some(for_update);
        }
    }

    /// Bind the owning transactional code; first assignment wins.
    pub fn bind_transactional_code(&mut self, code: Uuid) {
        if self.transactional_code.is_none() {
            self.transactional_code = Some(code);
        }
    }

    pub fn is_loaded(&self, field: &str) -> bool {
        self.loaded.contains(field)
    }

    pub fn is_modified(&self, field: &str) -> bool {
        self.modified.contains(field)
    }

    pub fn loaded_fields(&self) -> impl Iterator<Item = &str> {
        self.loaded.iter().map(String::as_str)
    }

    pub fn modified_fields(&self) -> impl Iterator<Item = &str> {
        self.modified.iter().map(String::as_str)
    }

    pub(crate) fn mark_loaded(&mut self, field: &str) {
        self.loaded.insert(field.to_string());
    }

    /// Record a write: overwriting a loaded field marks it modified,
    /// writing an unloaded field only establishes the baseline.
    pub(crate) fn record_write(&mut self, field: &str) {
        if self.loaded.contains(field) {
            self.modified.insert(field.to_string());
        } else {
            self.loaded.insert(field.to_string());
        }
    }

    /// True iff the record needs persisting: brand new, or owned for update
    /// with at least one modified field.
    pub fn data_modified(&self) -> bool {
        self.is_new || (self.for_update() && !self.modified.is_empty())
    }

    pub(crate) fn mark_saved(&mut self) {
        self.is_new = false;
        self.modified.clear();
    }

    pub(crate) fn clear_modified(&mut self) {
        self.modified.clear();
    }
}

/// Resolves lazy columns and references on behalf of a record.
///
/// Implemented by the engine core: resolution re-enters execution through
/// the record's owning transaction context when it is held for update, or a
/// read-only client otherwise.
pub trait LazyResolver: Send + Sync {
    /// Whether `field` is a lazily-resolved column or reference of `entity`.
    fn is_lazy_field(&self, entity: &str, field: &str) -> bool;

    fn resolve_column(&self, record: &Record, field: &str) -> Result<Value>;

    fn resolve_reference(&self, record: &Record, reference: &str) -> Result<Vec<Record>>;
}

/// A materialized (or to-be-inserted) entity instance.
#[derive(Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Record {
    entity: String,
    values: BTreeMap<String, Value>,
    /// Resolved association collections, keyed by reference name.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    associations: BTreeMap<String, Vec<Record>>,
    state: RecordState,
    #[serde(skip)]
    resolver: Option<Arc<dyn LazyResolver>>,
    #[serde(skip)]
    lazy_error: Option<String>,
}

impl Record {
    /// A fresh record with no backing row.
    pub fn new(entity: impl Into<String>) -> Self {
        Self {
            entity: entity.into(),
            values: BTreeMap::new(),
            associations: BTreeMap::new(),
            state: RecordState::new_record(),
            resolver: None,
            lazy_error: None,
        }
    }

    /// Wrap a fetched row; every present field counts as loaded.
    pub(crate) fn materialized(entity: impl Into<String>, values: BTreeMap<String, Value>) -> Self {
        let loaded = values.keys().cloned().collect();
        Self {
            entity: entity.into(),
            values,
            associations: BTreeMap::new(),
            state: RecordState::attached(loaded),
            resolver: None,
            lazy_error: None,
        }
    }

    pub(crate) fn attach_resolver(&mut self, resolver: Arc<dyn LazyResolver>) {
        self.resolver = Some(resolver);
    }

    pub fn entity(&self) -> &str {
        &self.entity
    }

    pub fn state(&self) -> &RecordState {
        &self.state
    }

    pub(crate) fn state_mut(&mut self) -> &mut RecordState {
        &mut self.state
    }

    pub fn data_modified(&self) -> bool {
        self.state.data_modified()
    }

    /// Most recent contained lazy-resolution failure, cleared on read.
    pub fn take_lazy_error(&mut self) -> Option<String> {
        self.lazy_error.take()
    }

    // =========================================================================
    // Field access
    // =========================================================================

    /// Current value of a field without triggering lazy resolution.
    pub fn peek(&self, field: &str) -> Option<&Value> {
        self.values.get(field)
    }

    /// All loaded values, for materializing typed entities.
    pub fn values(&self) -> &BTreeMap<String, Value> {
        &self.values
    }

    /// Read a field, resolving it first when it is a lazy column read for
    /// the first time. This accessor never fails: a failed resolution
    /// leaves the field at its zero value and parks the error.
    pub fn get(&mut self, field: &str) -> &Value {
        if !self.state.is_loaded(field) && !self.state.is_new() {
            if let Some(resolver) = self.resolver.clone() {
                if resolver.is_lazy_field(&self.entity, field) {
                    match resolver.resolve_column(self, field) {
                        Ok(value) => {
                            self.values.insert(field.to_string(), value);
                        }
                        Err(error) => {
                            tracing::warn!(
                                entity = %self.entity,
                                field,
                                %error,
                                "lazy column resolution failed; field set to zero value"
                            );
                            self.values.insert(field.to_string(), Value::zero());
                            self.lazy_error = Some(error.to_string());
                        }
                    }
                    // Loaded either way: a second read never re-fetches.
                    self.state.mark_loaded(field);
                }
            }
        }
        self.values.get(field).unwrap_or(&NULL_VALUE)
    }

    /// Write a field, tracking the load/modify transition.
    pub fn set(&mut self, field: impl Into<String>, value: impl Into<Value>) {
        let field = field.into();
        self.state.record_write(&field);
        self.values.insert(field, value.into());
    }

    /// Read an association, resolving it on first access. One-cardinality
    /// references yield zero or one record. Never fails; a failed
    /// resolution leaves the association empty and parks the error.
    pub fn reference(&mut self, name: &str) -> &[Record] {
        if !self.state.is_loaded(name) && !self.state.is_new() {
            if let Some(resolver) = self.resolver.clone() {
                match resolver.resolve_reference(self, name) {
                    Ok(records) => {
                        self.associations.insert(name.to_string(), records);
                    }
                    Err(error) => {
                        tracing::warn!(
                            entity = %self.entity,
                            reference = name,
                            %error,
                            "lazy reference resolution failed; association left empty"
                        );
                        self.associations.insert(name.to_string(), Vec::new());
                        self.lazy_error = Some(error.to_string());
                    }
                }
                self.state.mark_loaded(name);
            }
        }
        self.associations.get(name).map_or(&[], Vec::as_slice)
    }

    // =========================================================================
    // Keys
    // =========================================================================

    /// Primary key values, when all key fields are present and non-null.
    pub fn key(&self, table: &TableDescriptor) -> Option<Row> {
        let mut key = Row::new();
        for column in table.primary_key() {
            match self.values.get(&column.name) {
                Some(value) if !value.is_null() => {
                    key.insert(column.name.clone(), value.clone());
                }
                _ => return None,
            }
        }
        Some(key)
    }
}

impl fmt::Debug for Record {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Record")
            .field("entity", &self.entity)
            .field("values", &self.values)
            .field("associations", &self.associations)
            .field("state", &self.state)
            .field("lazy_error", &self.lazy_error)
            .finish_non_exhaustive()
    }
}

impl PartialEq for Record {
    fn eq(&self, other: &Self) -> bool {
        self.entity == other.entity
            && self.values == other.values
            && self.associations == other.associations
            && self.state == other.state
    }
}

/// Capability implemented by typed entities.
///
/// The descriptor is declarative and built once; `from_record` reads loaded
/// fields only (it must not trigger lazy resolution).
pub trait Entity: Sized {
    fn entity_name() -> &'static str;

    fn descriptor() -> TableDescriptor;

    fn from_record(record: &Record) -> Result<Self>;

    fn to_record(&self) -> Record;
}

/// Convenience for `from_record` implementations: a loaded field or a typed
/// error naming what is missing.
pub fn required_field<'a>(record: &'a Record, field: &str) -> Result<&'a Value> {
    record.peek(field).ok_or_else(|| {
        OrmError::Exec(crate::error::ExecError::retrieve(format!(
            "field '{}' of entity '{}' is not loaded",
            field,
            record.entity()
        )))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    // =========================================================================
    // Dirty Tracking Tests
    // =========================================================================

    #[test]
    fn test_new_record_is_modified_without_writes() {
        let record = Record::new("order");
        assert!(record.state().is_new());
        assert!(record.data_modified());
    }

    #[test]
    fn test_attached_record_without_modifications() {
        let mut values = BTreeMap::new();
        values.insert("id".to_string(), Value::Int(1));
        let mut record = Record::materialized("order", values);
        record.state_mut().bind_for_update(true);

        assert!(!record.state().is_new());
        assert!(!record.data_modified());
    }

    #[test]
    fn test_first_write_establishes_baseline() {
        let mut record = Record::materialized("order", BTreeMap::new());
        record.state_mut().bind_for_update(true);

        record.set("total", 10i64);
        assert!(record.state().is_loaded("total"));
        assert!(!record.state().is_modified("total"));
        assert!(!record.data_modified());

        // Overwriting the now-loaded field counts as a modification.
        record.set("total", 20i64);
        assert!(record.state().is_modified("total"));
        assert!(record.data_modified());
    }

    #[test]
    fn test_repeated_writes_mark_modified_once() {
        let mut values = BTreeMap::new();
        values.insert("total".to_string(), Value::Int(10));
        let mut record = Record::materialized("order", values);
        record.state_mut().bind_for_update(true);

        record.set("total", 10i64);
        record.set("total", 10i64);
        assert_eq!(record.state().modified_fields().count(), 1);
    }

    #[test]
    fn test_modification_without_for_update_is_not_dirty() {
        let mut values = BTreeMap::new();
        values.insert("total".to_string(), Value::Int(10));
        let mut record = Record::materialized("order", values);
        record.state_mut().bind_for_update(false);

        record.set("total", 20i64);
        assert!(record.state().is_modified("total"));
        assert!(!record.data_modified());
    }

    // =========================================================================
    // Write-Once Binding Tests
    // =========================================================================

    #[test]
    fn test_for_update_binds_once() {
        let mut state = RecordState::attached(BTreeSet::new());
        state.bind_for_update(true);
        state.bind_for_update(false);
        assert!(state.for_update());
    }

    #[test]
    fn test_transactional_code_binds_once() {
        let first = Uuid::now_v7();
        let second = Uuid::now_v7();
        let mut state = RecordState::attached(BTreeSet::new());
        state.bind_transactional_code(first);
        state.bind_transactional_code(second);
        assert_eq!(state.transactional_code(), Some(first));
    }

    // =========================================================================
    // Lazy Resolution Tests
    // =========================================================================

    struct CountingResolver {
        calls: std::sync::atomic::AtomicUsize,
        fail: bool,
    }

    impl LazyResolver for CountingResolver {
        fn is_lazy_field(&self, _entity: &str, field: &str) -> bool {
            field == "notes"
        }

        fn resolve_column(&self, _record: &Record, _field: &str) -> Result<Value> {
            self.calls
                .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            if self.fail {
                Err(crate::error::ExecError::retrieve("backend unavailable").into())
            } else {
                Ok(Value::from("resolved"))
            }
        }

        fn resolve_reference(&self, _record: &Record, _reference: &str) -> Result<Vec<Record>> {
            Ok(Vec::new())
        }
    }

    #[test]
    fn test_lazy_read_is_idempotent() {
        let resolver = Arc::new(CountingResolver {
            calls: std::sync::atomic::AtomicUsize::new(0),
            fail: false,
        });
        let mut record = Record::materialized("order", BTreeMap::new());
        record.attach_resolver(resolver.clone());

        assert_eq!(record.get("notes"), &Value::from("resolved"));
        assert_eq!(record.get("notes"), &Value::from("resolved"));
        assert_eq!(resolver.calls.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[test]
    fn test_lazy_failure_is_contained() {
        let resolver = Arc::new(CountingResolver {
            calls: std::sync::atomic::AtomicUsize::new(0),
            fail: true,
        });
        let mut record = Record::materialized("order", BTreeMap::new());
        record.attach_resolver(resolver.clone());

        // Accessor does not raise; field lands on its zero value.
        assert_eq!(record.get("notes"), &Value::Null);
        assert!(record.take_lazy_error().is_some());
        assert!(record.take_lazy_error().is_none());

        // Failed resolution is not retried.
        assert_eq!(record.get("notes"), &Value::Null);
        assert_eq!(resolver.calls.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[test]
    fn test_non_lazy_unloaded_field_reads_null() {
        let mut record = Record::materialized("order", BTreeMap::new());
        assert_eq!(record.get("total"), &Value::Null);
    }

    // =========================================================================
    // Serialization Tests
    // =========================================================================

    #[test]
    fn test_record_round_trip_preserves_state() {
        let mut values = BTreeMap::new();
        values.insert("id".to_string(), Value::Int(7));
        let mut record = Record::materialized("order", values);
        record.state_mut().bind_for_update(true);
        record.state_mut().bind_transactional_code(Uuid::now_v7());
        record.set("id", 8i64);

        let json = serde_json::to_string(&record).unwrap();
        let back: Record = serde_json::from_str(&json).unwrap();
        assert_eq!(record, back);
        assert!(back.state().is_modified("id"));
    }
}
