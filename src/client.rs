//! Transaction-scoped execution
//!
//! A [`DatabaseClient`] binds operations to an [`Operator`]: either read-only
//! (retrieve/query only) or a transactional context whose code stamps every
//! write and materialized record. The client validates lifecycle state before
//! touching the backend, materializes rows back into [`Record`]s (stripping
//! lazy columns so they resolve on first access), consults the verify
//! provider after materialization, and applies the context's rollback policy
//! when an operation fails.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::backend::{cell_key, Row, StorageBackend};
use crate::condition::{CompareOp, Condition, Param};
use crate::config::EngineConfig;
use crate::context::{ContextRegistry, TransactionContext};
use crate::error::{ExecError, LifecycleError, OrmError, Result};
use crate::metadata::{
    Cardinality, Cascade, ColumnDescriptor, GeneratorDescriptor, LockPolicy, TableDescriptor,
};
use crate::provider::VerifyProvider;
use crate::query::{Pager, QueryBuilder, QuerySpec};
use crate::record::{Entity, LazyResolver, Record};
use crate::registry::Registry;
use crate::value::Value;

/// The operation kinds a client executes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationMode {
    Insert,
    Update,
    Delete,
    Retrieve,
    Query,
}

impl OperationMode {
    const fn is_write(self) -> bool {
        matches!(self, Self::Insert | Self::Update | Self::Delete)
    }

    fn error(self, msg: impl Into<String>) -> ExecError {
        match self {
            Self::Insert => ExecError::insert(msg),
            Self::Update => ExecError::update(msg),
            Self::Delete => ExecError::delete(msg),
            Self::Retrieve => ExecError::retrieve(msg),
            Self::Query => ExecError::query(msg),
        }
    }
}

/// How a client is bound: read-only, or owning a transactional context.
#[derive(Clone)]
pub enum Operator {
    /// Valid for retrieve/query only.
    ReadOnly,
    Transactional(Arc<TransactionContext>),
}

impl Operator {
    pub fn transactional_code(&self) -> Option<Uuid> {
        match self {
            Self::ReadOnly => None,
            Self::Transactional(context) => Some(context.code()),
        }
    }
}

/// Shared engine state: registry, backend, open contexts, providers.
pub(crate) struct EngineCore {
    pub(crate) registry: Arc<Registry>,
    pub(crate) backend: Arc<dyn StorageBackend>,
    pub(crate) contexts: Arc<ContextRegistry>,
    pub(crate) verify: Option<Arc<dyn VerifyProvider>>,
    pub(crate) config: EngineConfig,
    /// Lazy-resolution handle attached to every materialized record.
    /// Holds a weak back-reference, installed right after construction.
    pub(crate) resolver: std::sync::OnceLock<Arc<Resolver>>,
}

impl EngineCore {
    pub(crate) fn client(self: &Arc<Self>, operator: Operator) -> DatabaseClient {
        DatabaseClient {
            core: self.clone(),
            operator,
        }
    }
}

/// A page of query results together with the unpaged total.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PartialCollection {
    pub records: Vec<Record>,
    /// Row count for the predicate, ignoring the pager.
    pub total: u64,
    pub page: u64,
    pub size: u64,
}

impl PartialCollection {
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Record> {
        self.records.iter()
    }
}

/// Executes operations against storage under one operator.
#[derive(Clone)]
pub struct DatabaseClient {
    core: Arc<EngineCore>,
    operator: Operator,
}

impl DatabaseClient {
    pub fn operator(&self) -> &Operator {
        &self.operator
    }

    pub fn transactional_code(&self) -> Option<Uuid> {
        self.operator.transactional_code()
    }

    /// Validate the operator for `mode` and return the transactional code
    /// for stamping writes. An expired context is rolled back wholesale.
    fn guard(&self, mode: OperationMode) -> Result<Option<Uuid>> {
        match &self.operator {
            Operator::ReadOnly => {
                if mode.is_write() {
                    return Err(mode.error("operator is read-only").into());
                }
                Ok(None)
            }
            Operator::Transactional(context) => {
                let code = context.code();
                if self.core.contexts.lookup(code).is_none() {
                    return Err(ExecError::StaleContext(code).into());
                }
                if context.expired() {
                    if let Err(error) = self.core.backend.rollback(code) {
                        tracing::warn!(%code, %error, "rollback of timed-out transaction failed");
                    }
                    self.core.contexts.close(code);
                    return Err(ExecError::Timeout(code).into());
                }
                Ok(Some(code))
            }
        }
    }

    fn descriptor(&self, entity: &str, mode: OperationMode) -> Result<Arc<TableDescriptor>> {
        self.core
            .registry
            .descriptor(entity)
            .ok_or_else(|| mode.error(format!("entity '{entity}' is not registered")).into())
    }

    /// Apply the context's rollback policy to a failed operation.
    fn fail(&self, error: OrmError) -> OrmError {
        if let Operator::Transactional(context) = &self.operator {
            if context.should_roll_back(&error) {
                if let Err(rollback_error) = self.rollback_transactional(&error) {
                    tracing::warn!(%rollback_error, "rollback after failed operation also failed");
                }
            }
        }
        error
    }

    // =========================================================================
    // Batch writes
    // =========================================================================

    /// Insert new records. Each record must be `is_new`; its generator fills
    /// the key when unassigned. On success records become attached, bound
    /// for update to this transaction.
    pub fn save_records(&self, records: &mut [Record]) -> Result<usize> {
        let txn = self.guard(OperationMode::Insert)?;
        let mut saved = 0;
        for record in records.iter_mut() {
            let table = self.descriptor(record.entity(), OperationMode::Insert)?;
            if !record.state().is_new() {
                return Err(self.fail(
                    LifecycleError::IllegalState {
                        operation: "save",
                        detail: format!(
                            "record of '{}' is already attached to a row",
                            record.entity()
                        ),
                    }
                    .into(),
                ));
            }

            self.fill_generated_key(record, &table)?;
            let row = self.row_for_insert(record, &table).map_err(|e| self.fail(e))?;
            self.core
                .backend
                .insert(&table, vec![row], txn)
                .map_err(|e| self.fail(e.into()))?;

            if let Some(verify) = &self.core.verify {
                verify.sign(record).map_err(|e| self.fail(e))?;
            }

            let state = record.state_mut();
            state.mark_saved();
            state.bind_for_update(true);
            if let Some(code) = txn {
                state.bind_transactional_code(code);
            }
            if let Some(resolver) = self.core.resolver.get() {
                record.attach_resolver(resolver.clone());
            }
            saved += 1;
        }
        Ok(saved)
    }

    /// Persist modified fields of attached records. Each record must report
    /// `data_modified()` and carry its full key.
    pub fn update_records(&self, records: &mut [Record]) -> Result<usize> {
        let txn = self.guard(OperationMode::Update)?;
        let mut updated = 0;
        for record in records.iter_mut() {
            let table = self.descriptor(record.entity(), OperationMode::Update)?;
            if record.state().is_new() || !record.data_modified() {
                return Err(self.fail(
                    LifecycleError::IllegalState {
                        operation: "update",
                        detail: format!(
                            "record of '{}' has no modified data to persist",
                            record.entity()
                        ),
                    }
                    .into(),
                ));
            }
            let key = record.key(&table).ok_or_else(|| {
                self.fail(ExecError::update("record is missing its primary key").into())
            })?;

            let mut changes = Row::new();
            let modified: Vec<String> = record
                .state()
                .modified_fields()
                .map(str::to_string)
                .collect();
            for field in modified {
                let column = table.find_column(&field).ok_or_else(|| {
                    self.fail(
                        ExecError::update(format!(
                            "modified field '{field}' is not a column of '{}'",
                            record.entity()
                        ))
                        .into(),
                    )
                })?;
                let value = record.peek(&field).cloned().unwrap_or(Value::Null);
                self.check_value(column, &value, OperationMode::Update)
                    .map_err(|e| self.fail(e))?;
                changes.insert(field, value);
            }

            let affected = self
                .core
                .backend
                .update(&table, &key, &changes, txn)
                .map_err(|e| self.fail(e.into()))?;
            if affected == 0 {
                return Err(self.fail(
                    ExecError::update(format!(
                        "no row of '{}' matches the record key",
                        record.entity()
                    ))
                    .into(),
                ));
            }

            if let Some(verify) = &self.core.verify {
                verify.sign(record).map_err(|e| self.fail(e))?;
            }
            record.state_mut().clear_modified();
            updated += 1;
        }
        Ok(updated)
    }

    /// Delete attached records by key, applying declared cascade behavior
    /// of references targeting the dropped entity.
    pub fn drop_records(&self, records: &mut [Record]) -> Result<usize> {
        let txn = self.guard(OperationMode::Delete)?;
        let mut dropped = 0;
        for record in records.iter_mut() {
            let table = self.descriptor(record.entity(), OperationMode::Delete)?;
            if record.state().is_new() {
                return Err(self.fail(
                    LifecycleError::IllegalState {
                        operation: "drop",
                        detail: format!("record of '{}' has no backing row", record.entity()),
                    }
                    .into(),
                ));
            }
            let key = record.key(&table).ok_or_else(|| {
                self.fail(ExecError::delete("record is missing its primary key").into())
            })?;

            self.cascade(&table, record, txn).map_err(|e| self.fail(e))?;

            let affected = self
                .core
                .backend
                .delete(&table, &key, txn)
                .map_err(|e| self.fail(e.into()))?;
            if affected == 0 {
                return Err(self.fail(
                    ExecError::delete(format!(
                        "no row of '{}' matches the record key",
                        record.entity()
                    ))
                    .into(),
                ));
            }
            dropped += 1;
        }
        Ok(dropped)
    }

    // =========================================================================
    // Reads
    // =========================================================================

    /// Fetch a single record by equality on `params`. With `for_update` the
    /// row is locked and the result is bound to this transaction.
    pub fn retrieve(
        &self,
        params: Row,
        entity: &str,
        for_update: bool,
    ) -> Result<Option<Record>> {
        let txn = self.guard(OperationMode::Retrieve)?;
        if for_update && txn.is_none() {
            return Err(ExecError::retrieve("for-update retrieval requires a transactional operator").into());
        }
        let table = self.descriptor(entity, OperationMode::Retrieve)?;
        if for_update && table.lock_policy == LockPolicy::Deny {
            return Err(ExecError::retrieve(format!(
                "entity '{entity}' does not permit for-update locking"
            ))
            .into());
        }

        let lock = if for_update { txn } else { None };
        let Some(row) = self
            .core
            .backend
            .fetch(&table, &params, lock)
            .map_err(|e| self.fail(e.into()))?
        else {
            return Ok(None);
        };

        let mut record = self.materialize(&table, row);
        if for_update {
            record.state_mut().bind_for_update(true);
            if let Some(code) = txn {
                record.state_mut().bind_transactional_code(code);
            }
        }
        self.verify_record(&record).map_err(|e| self.fail(e))?;
        Ok(Some(record))
    }

    /// Retrieve a typed entity by key parameters.
    pub fn retrieve_as<T: Entity>(&self, params: Row, for_update: bool) -> Result<Option<T>> {
        match self.retrieve(params, T::entity_name(), for_update)? {
            Some(record) => Ok(Some(T::from_record(&record)?)),
            None => Ok(None),
        }
    }

    /// Execute a spec and materialize the driving entity's records.
    ///
    /// Specs without a pager run under the configured default page size.
    /// The cacheable flag is advisory and skipped for `for_update` specs.
    pub fn query(&self, spec: &QuerySpec) -> Result<PartialCollection> {
        let txn = self.guard(OperationMode::Query)?;
        if spec.for_update && txn.is_none() {
            return Err(ExecError::query("for-update query requires a transactional operator").into());
        }
        if spec.cacheable && spec.for_update {
            tracing::debug!(entity = %spec.entity, "for-update query: cacheable flag ignored");
        }

        let table = self.descriptor(&spec.entity, OperationMode::Query)?;
        if spec.for_update && table.lock_policy == LockPolicy::Deny {
            return Err(ExecError::query(format!(
                "entity '{}' does not permit for-update locking",
                spec.entity
            ))
            .into());
        }

        let pager = spec.pager.unwrap_or(Pager {
            page: 1,
            size: self.core.config.default_page_size,
        });
        let mut effective = spec.clone();
        effective.pager = Some(pager);

        let total = self
            .core
            .backend
            .count(&spec.count_shape(), &self.core.registry)
            .map_err(|e| self.fail(e.into()))?;

        let lock = if spec.for_update { txn } else { None };
        let rows = self
            .core
            .backend
            .select(&effective, &self.core.registry, lock)
            .map_err(|e| self.fail(e.into()))?;

        let prefix = format!("{}.", spec.entity);
        let mut records = Vec::with_capacity(rows.len());
        for row in rows {
            let mut values = BTreeMap::new();
            for (key, value) in row {
                if let Some(field) = key.strip_prefix(&prefix) {
                    values.insert(field.to_string(), value);
                } else if !key.contains('.') {
                    // Function aliases project straight onto the record.
                    values.insert(key, value);
                }
            }
            let mut record = self.materialize(&table, values);
            if spec.for_update {
                record.state_mut().bind_for_update(true);
                if let Some(code) = txn {
                    record.state_mut().bind_transactional_code(code);
                }
            }
            self.verify_record(&record).map_err(|e| self.fail(e))?;
            records.push(record);
        }

        Ok(PartialCollection {
            records,
            total,
            page: pager.page,
            size: pager.size,
        })
    }

    /// Execute a spec and materialize typed entities.
    pub fn query_as<T: Entity>(&self, spec: &QuerySpec) -> Result<Vec<T>> {
        if spec.entity != T::entity_name() {
            return Err(ExecError::query(format!(
                "spec drives entity '{}' but '{}' was requested",
                spec.entity,
                T::entity_name()
            ))
            .into());
        }
        self.query(spec)?
            .records
            .iter()
            .map(T::from_record)
            .collect()
    }

    /// Row count for the spec's predicate, ignoring the pager.
    pub fn query_total(&self, spec: &QuerySpec) -> Result<u64> {
        self.guard(OperationMode::Query)?;
        self.core
            .backend
            .count(&spec.count_shape(), &self.core.registry)
            .map_err(|e| self.fail(e.into()))
    }

    // =========================================================================
    // Transaction boundary
    // =========================================================================

    /// Roll back the owning transaction, logging the triggering error.
    pub fn rollback_transactional(&self, cause: &OrmError) -> Result<()> {
        let Operator::Transactional(context) = &self.operator else {
            return Err(ExecError::query("read-only operator has no transaction to roll back").into());
        };
        let code = context.code();
        tracing::info!(%code, %cause, "rolling back transaction");
        self.core.backend.rollback(code)?;
        self.core.contexts.close(code);
        Ok(())
    }

    /// Commit the owning transaction and release its context.
    pub fn end_transactional(&self) -> Result<()> {
        let Operator::Transactional(context) = &self.operator else {
            return Err(ExecError::query("read-only operator has no transaction to end").into());
        };
        let code = context.code();
        self.core.backend.commit(code)?;
        self.core.contexts.close(code);
        Ok(())
    }

    // =========================================================================
    // Internal helpers
    // =========================================================================

    /// Wrap a fetched row, excluding lazy columns so they resolve on first
    /// access.
    fn materialize(&self, table: &TableDescriptor, mut values: BTreeMap<String, Value>) -> Record {
        for lazy in table.lazy_fields() {
            values.remove(lazy);
        }
        let mut record = Record::materialized(table.entity.clone(), values);
        if let Some(resolver) = self.core.resolver.get() {
            record.attach_resolver(resolver.clone());
        }
        record
    }

    fn verify_record(&self, record: &Record) -> Result<()> {
        if !self.core.config.verify_reads {
            return Ok(());
        }
        let Some(verify) = &self.core.verify else {
            return Ok(());
        };
        if verify.verify(record)? {
            Ok(())
        } else {
            Err(LifecycleError::DataModified {
                entity: record.entity().to_string(),
            }
            .into())
        }
    }

    fn check_value(
        &self,
        column: &ColumnDescriptor,
        value: &Value,
        mode: OperationMode,
    ) -> Result<()> {
        if value.is_null() {
            if !column.nullable {
                return Err(mode
                    .error(format!("column '{}' does not allow NULL values", column.name))
                    .into());
            }
            return Ok(());
        }
        if !value.coercible_to(&column.kind) {
            return Err(mode
                .error(format!(
                    "value {value} does not fit {} column '{}'",
                    column.kind.name(),
                    column.name
                ))
                .into());
        }
        Ok(())
    }

    fn row_for_insert(&self, record: &Record, table: &TableDescriptor) -> Result<Row> {
        let mut row = Row::new();
        for column in &table.columns {
            match record.peek(&column.name) {
                Some(value) => {
                    self.check_value(column, value, OperationMode::Insert)?;
                    row.insert(column.name.clone(), value.clone());
                }
                None if !column.nullable && !column.lazy => {
                    return Err(ExecError::insert(format!(
                        "required column '{}' of '{}' is missing",
                        column.name, table.entity
                    ))
                    .into());
                }
                None => {}
            }
        }
        Ok(row)
    }

    /// Fill unassigned key fields from the entity's generator.
    fn fill_generated_key(&self, record: &mut Record, table: &TableDescriptor) -> Result<()> {
        let unset: Vec<String> = table
            .primary_key()
            .iter()
            .filter(|column| {
                record
                    .peek(&column.name)
                    .map_or(true, Value::is_null)
            })
            .map(|column| column.name.clone())
            .collect();
        if unset.is_empty() {
            return Ok(());
        }

        match &table.generator {
            GeneratorDescriptor::Assigned => Err(self.fail(
                ExecError::insert(format!(
                    "entity '{}' uses assigned keys but '{}' is unset",
                    table.entity,
                    unset.join(", ")
                ))
                .into(),
            )),
            GeneratorDescriptor::Sequence(_) => {
                for field in unset {
                    let value = self
                        .core
                        .registry
                        .next_sequence_value(&table.entity)
                        .map_err(|e| self.fail(e.into()))?;
                    record.set(field, value);
                }
                Ok(())
            }
            GeneratorDescriptor::Generated => {
                for field in unset {
                    record.set(field, Uuid::new_v4().to_string());
                }
                Ok(())
            }
        }
    }

    /// Apply declared cascade behavior of references targeting the entity a
    /// record is being dropped from. Single-level by design.
    fn cascade(
        &self,
        table: &TableDescriptor,
        record: &Record,
        txn: Option<Uuid>,
    ) -> Result<()> {
        let registry = &self.core.registry;
        for entity in registry.entities() {
            let Some(child) = registry.descriptor(&entity) else {
                continue;
            };
            for reference in &child.references {
                if reference.target != table.entity || reference.cascade == Cascade::None {
                    continue;
                }

                let mut builder = QueryBuilder::new(registry, &entity)?;
                let mut resolvable = true;
                for (local, remote) in &reference.pairs {
                    let value = record.peek(remote).cloned().unwrap_or(Value::Null);
                    if value.is_null() {
                        resolvable = false;
                        break;
                    }
                    builder = builder.filter(Condition::column(
                        registry,
                        &entity,
                        local,
                        CompareOp::Eq,
                        Param::Constant(value),
                    )?)?;
                }
                if !resolvable {
                    continue;
                }

                let spec = builder.confirm()?;
                let rows = self.core.backend.select(&spec, registry, None)?;
                for row in rows {
                    let mut key = Row::new();
                    for column in child.primary_key() {
                        if let Some(value) = row.get(&cell_key(&entity, &column.name)) {
                            key.insert(column.name.clone(), value.clone());
                        }
                    }
                    if key.len() != child.primary_key().len() {
                        continue;
                    }
                    match reference.cascade {
                        Cascade::Delete => {
                            self.core.backend.delete(&child, &key, txn)?;
                        }
                        Cascade::Nullify => {
                            let mut changes = Row::new();
                            for (local, _) in &reference.pairs {
                                changes.insert(local.clone(), Value::Null);
                            }
                            self.core.backend.update(&child, &key, &changes, txn)?;
                        }
                        Cascade::None => {}
                    }
                }
            }
        }
        Ok(())
    }
}

// =============================================================================
// Lazy resolution re-entry
// =============================================================================

/// Resolves lazy fields by re-entering execution through the engine core.
///
/// Holds a weak reference so record handles outliving the engine fail their
/// resolutions (contained by the accessor) instead of keeping the engine
/// alive.
pub(crate) struct Resolver {
    core: std::sync::Weak<EngineCore>,
}

impl Resolver {
    pub(crate) fn new(core: std::sync::Weak<EngineCore>) -> Self {
        Self { core }
    }

    fn core(&self) -> Result<Arc<EngineCore>> {
        self.core
            .upgrade()
            .ok_or_else(|| ExecError::retrieve("engine has been destroyed").into())
    }

    /// The client a lazy resolution runs under: the record's owning
    /// transaction when it is held for update, a read-only client otherwise.
    fn client_for_record(core: &Arc<EngineCore>, record: &Record) -> Result<DatabaseClient> {
        if record.state().for_update() {
            let code = record
                .state()
                .transactional_code()
                .ok_or_else(|| ExecError::retrieve("for-update record carries no transactional code"))?;
            let context = core
                .contexts
                .lookup(code)
                .ok_or(ExecError::StaleContext(code))?;
            Ok(core.client(Operator::Transactional(context)))
        } else {
            Ok(core.client(Operator::ReadOnly))
        }
    }
}

impl LazyResolver for Resolver {
    fn is_lazy_field(&self, entity: &str, field: &str) -> bool {
        let Some(core) = self.core.upgrade() else {
            return false;
        };
        core.registry.descriptor(entity).is_some_and(|table| {
            table.find_column(field).map_or_else(
                || table.find_reference(field).is_some(),
                |column| column.lazy,
            )
        })
    }

    fn resolve_column(&self, record: &Record, field: &str) -> Result<Value> {
        let core = self.core()?;
        let client = Self::client_for_record(&core, record)?;
        let table = client.descriptor(record.entity(), OperationMode::Retrieve)?;
        let key = record
            .key(&table)
            .ok_or_else(|| ExecError::retrieve("record carries no primary key"))?;

        client.guard(OperationMode::Retrieve)?;
        let row = core
            .backend
            .fetch(&table, &key, None)?
            .ok_or_else(|| ExecError::retrieve("backing row no longer exists"))?;
        Ok(row.get(field).cloned().unwrap_or(Value::Null))
    }

    fn resolve_reference(&self, record: &Record, reference: &str) -> Result<Vec<Record>> {
        let core = self.core()?;
        let client = Self::client_for_record(&core, record)?;
        let table = client.descriptor(record.entity(), OperationMode::Retrieve)?;
        let descriptor = table
            .find_reference(reference)
            .ok_or_else(|| {
                ExecError::retrieve(format!(
                    "entity '{}' declares no reference '{reference}'",
                    record.entity()
                ))
            })?
            .clone();

        let registry = &core.registry;
        let mut builder = QueryBuilder::new(registry, &descriptor.target)?;
        for (local, remote) in &descriptor.pairs {
            let value = record.peek(local).cloned().unwrap_or(Value::Null);
            if value.is_null() {
                return Ok(Vec::new());
            }
            builder = builder.filter(Condition::column(
                registry,
                &descriptor.target,
                remote,
                CompareOp::Eq,
                Param::Constant(value),
            )?)?;
        }
        if descriptor.cardinality == Cardinality::One {
            builder = builder.page(1, 1)?;
        }
        let spec = builder.confirm()?;

        let collection = client.query(&spec)?;
        let mut records = collection.records;
        if record.state().for_update() {
            for resolved in &mut records {
                resolved.state_mut().bind_for_update(true);
                if let Some(code) = record.state().transactional_code() {
                    resolved.state_mut().bind_transactional_code(code);
                }
            }
        }
        Ok(records)
    }
}
