//! Reference in-memory backend
//!
//! A complete, synchronous [`StorageBackend`] that evaluates query specs
//! directly: nested-loop joins, predicate evaluation through [`crate::eval`],
//! grouping with aggregates, distinct, sort-coded ordering, paging and
//! per-transaction pessimistic locks with an undo log for rollback. It backs
//! the integration suite and doubles as an embeddable store.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, RwLock};

use rust_decimal::Decimal;
use uuid::Uuid;

use crate::backend::{cell_key, QueryRow, Row, StorageBackend};
use crate::error::ExecError;
use crate::eval::{eval_condition, scalar_param};
use crate::metadata::{ColumnKind, TableDescriptor};
use crate::query::{Join, JoinKind, Pager, Projection, QuerySpec, SortDirection};
use crate::registry::Registry;
use crate::value::Value;

type TableRows = BTreeMap<String, Row>;

#[derive(Debug)]
enum UndoOp {
    Insert { table: String, key: String },
    Update { table: String, key: String, before: Row },
    Delete { table: String, key: String, before: Row },
}

/// In-memory storage keyed by encoded primary key per table.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    tables: RwLock<HashMap<String, TableRows>>,
    /// (table, encoded key) -> owning transactional code.
    locks: Mutex<HashMap<(String, String), Uuid>>,
    undo: Mutex<HashMap<Uuid, Vec<UndoOp>>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn encode_key(table: &TableDescriptor, row: &Row) -> Result<String, String> {
        let mut parts = Vec::new();
        for column in table.primary_key() {
            match row.get(&column.name) {
                Some(value) if !value.is_null() => parts.push(value.to_string()),
                _ => {
                    return Err(format!(
                        "row of '{}' is missing key field '{}'",
                        table.entity, column.name
                    ));
                }
            }
        }
        Ok(parts.join("\u{1f}"))
    }

    fn push_undo(&self, txn: Option<Uuid>, op: UndoOp) {
        if let Some(code) = txn {
            self.undo
                .lock()
                .expect("undo lock poisoned")
                .entry(code)
                .or_default()
                .push(op);
        }
    }

    /// Take a pessimistic lock; fails when another transaction holds it.
    fn acquire_lock(&self, table: &str, key: &str, owner: Uuid) -> Result<(), ExecError> {
        let mut locks = self.locks.lock().expect("lock table poisoned");
        match locks.get(&(table.to_string(), key.to_string())) {
            Some(holder) if *holder != owner => Err(ExecError::query(format!(
                "row '{key}' of '{table}' is locked by transaction {holder}"
            ))),
            _ => {
                locks.insert((table.to_string(), key.to_string()), owner);
                Ok(())
            }
        }
    }

    fn lock_conflict(&self, table: &str, key: &str, txn: Option<Uuid>) -> bool {
        let locks = self.locks.lock().expect("lock table poisoned");
        locks
            .get(&(table.to_string(), key.to_string()))
            .is_some_and(|holder| Some(*holder) != txn)
    }

    fn release_locks(&self, owner: Uuid) {
        self.locks
            .lock()
            .expect("lock table poisoned")
            .retain(|_, holder| *holder != owner);
    }

    /// Snapshot the rows of one entity as prefixed query rows.
    fn entity_rows(
        &self,
        registry: &Registry,
        entity: &str,
    ) -> Result<Vec<QueryRow>, ExecError> {
        let table = registry
            .descriptor(entity)
            .ok_or_else(|| ExecError::query(format!("entity '{entity}' is not registered")))?;
        let tables = self.tables.read().expect("table lock poisoned");
        let rows = tables
            .get(&table.table_name)
            .map(|rows| {
                rows.values()
                    .map(|row| {
                        row.iter()
                            .map(|(field, value)| (cell_key(entity, field), value.clone()))
                            .collect()
                    })
                    .collect()
            })
            .unwrap_or_default();
        Ok(rows)
    }

    // =========================================================================
    // Query pipeline
    // =========================================================================

    fn run(
        &self,
        spec: &QuerySpec,
        registry: &Registry,
        lock: Option<Uuid>,
        with_pager: bool,
    ) -> Result<Vec<QueryRow>, ExecError> {
        let mut rows = self.entity_rows(registry, &spec.entity)?;

        for join in &spec.joins {
            rows = self.apply_join(rows, join, registry)?;
        }

        if let Some(condition) = &spec.condition {
            let sub = |sub_spec: &QuerySpec| self.first_column_values(sub_spec, registry);
            let mut kept = Vec::with_capacity(rows.len());
            for row in rows {
                if eval_condition(condition, &row, registry, &sub)? {
                    kept.push(row);
                }
            }
            rows = kept;
        }

        if spec.group_by.is_empty() {
            rows = self.apply_scalar_projections(spec, rows, registry)?;
        } else {
            rows = self.apply_grouping(spec, rows, registry)?;
        }

        if spec
            .projections
            .iter()
            .any(|projection| match projection {
                Projection::Column { distinct, .. } | Projection::Function { distinct, .. } => {
                    *distinct
                }
            })
        {
            rows = Self::dedupe(spec, rows);
        }

        self.apply_ordering(spec, &mut rows, registry)?;

        if with_pager {
            if let Some(Pager { page, size }) = spec.pager {
                let start = usize::try_from((page - 1).saturating_mul(size)).unwrap_or(usize::MAX);
                let take = usize::try_from(size).unwrap_or(usize::MAX);
                rows = rows.into_iter().skip(start).take(take).collect();
            }
        }

        if let Some(owner) = lock {
            self.lock_driving_rows(spec, &rows, registry, owner)?;
        }

        Ok(Self::trim_projection(spec, rows))
    }

    fn apply_join(
        &self,
        left_rows: Vec<QueryRow>,
        join: &Join,
        registry: &Registry,
    ) -> Result<Vec<QueryRow>, ExecError> {
        let right_rows = self.entity_rows(registry, &join.right)?;

        let pair_kinds: Vec<ColumnKind> = join
            .on
            .iter()
            .map(|(left_field, _)| {
                registry
                    .resolve_column(&join.left, left_field)
                    .map(|(_, column)| column.kind)
                    .map_err(|e| ExecError::query(e.to_string()))
            })
            .collect::<Result<_, _>>()?;

        let pairs_match = |left: &QueryRow, right: &QueryRow| -> bool {
            join.on.iter().zip(&pair_kinds).all(|((lf, rf), kind)| {
                let lv = left.get(&cell_key(&join.left, lf)).cloned().unwrap_or(Value::Null);
                let rv = right.get(&cell_key(&join.right, rf)).cloned().unwrap_or(Value::Null);
                lv.equals(&rv, kind)
            })
        };

        let merge = |left: &QueryRow, right: &QueryRow| -> QueryRow {
            let mut merged = left.clone();
            merged.extend(right.clone());
            merged
        };

        let mut out = Vec::new();
        match join.kind {
            JoinKind::Cross => {
                for left in &left_rows {
                    for right in &right_rows {
                        out.push(merge(left, right));
                    }
                }
            }
            JoinKind::Inner | JoinKind::Left => {
                for left in &left_rows {
                    let mut matched = false;
                    for right in &right_rows {
                        if pairs_match(left, right) {
                            out.push(merge(left, right));
                            matched = true;
                        }
                    }
                    if !matched && join.kind == JoinKind::Left {
                        out.push(left.clone());
                    }
                }
            }
            JoinKind::Right => {
                for right in &right_rows {
                    let mut matched = false;
                    for left in &left_rows {
                        if pairs_match(left, right) {
                            out.push(merge(left, right));
                            matched = true;
                        }
                    }
                    if !matched {
                        out.push(right.clone());
                    }
                }
            }
            JoinKind::Full => {
                let mut right_matched = vec![false; right_rows.len()];
                for left in &left_rows {
                    let mut matched = false;
                    for (index, right) in right_rows.iter().enumerate() {
                        if pairs_match(left, right) {
                            out.push(merge(left, right));
                            matched = true;
                            right_matched[index] = true;
                        }
                    }
                    if !matched {
                        out.push(left.clone());
                    }
                }
                for (index, right) in right_rows.iter().enumerate() {
                    if !right_matched[index] {
                        out.push(right.clone());
                    }
                }
            }
        }
        Ok(out)
    }

    /// Evaluate non-aggregate function projections per row.
    fn apply_scalar_projections(
        &self,
        spec: &QuerySpec,
        rows: Vec<QueryRow>,
        registry: &Registry,
    ) -> Result<Vec<QueryRow>, ExecError> {
        let functions: Vec<_> = spec
            .projections
            .iter()
            .filter_map(|projection| match projection {
                Projection::Function { name, args, alias, .. } => Some((name, args, alias)),
                Projection::Column { .. } => None,
            })
            .collect();
        if functions.is_empty() {
            return Ok(rows);
        }

        let sub = |sub_spec: &QuerySpec| self.first_column_values(sub_spec, registry);
        let mut out = Vec::with_capacity(rows.len());
        for mut row in rows {
            for (name, args, alias) in &functions {
                if is_aggregate(name) {
                    return Err(ExecError::query(format!(
                        "aggregate function '{name}' requires a group-by list"
                    )));
                }
                let value = scalar_param(
                    &crate::condition::Param::Function {
                        name: (*name).clone(),
                        args: (*args).clone(),
                    },
                    &row,
                    registry,
                    &sub,
                )?;
                row.insert((*alias).clone(), value);
            }
            out.push(row);
        }
        Ok(out)
    }

    fn apply_grouping(
        &self,
        spec: &QuerySpec,
        rows: Vec<QueryRow>,
        registry: &Registry,
    ) -> Result<Vec<QueryRow>, ExecError> {
        // Entries are already sorted by code; the key order follows it.
        let key_fields: Vec<String> = spec
            .group_by
            .iter()
            .map(|entry| cell_key(&entry.entity, &entry.field))
            .collect();

        let mut groups: Vec<(String, Vec<QueryRow>)> = Vec::new();
        let mut index: HashMap<String, usize> = HashMap::new();
        for row in rows {
            let key = key_fields
                .iter()
                .map(|field| row.get(field).cloned().unwrap_or(Value::Null).to_string())
                .collect::<Vec<_>>()
                .join("\u{1f}");
            match index.get(&key) {
                Some(&slot) => groups[slot].1.push(row),
                None => {
                    index.insert(key.clone(), groups.len());
                    groups.push((key, vec![row]));
                }
            }
        }

        let sub = |sub_spec: &QuerySpec| self.first_column_values(sub_spec, registry);
        let mut out = Vec::with_capacity(groups.len());
        for (_, members) in groups {
            let first = members.first().expect("group is non-empty").clone();
            let mut output: QueryRow = key_fields
                .iter()
                .filter_map(|field| first.get(field).map(|v| (field.clone(), v.clone())))
                .collect();

            for projection in &spec.projections {
                match projection {
                    Projection::Column { entity, field, .. } => {
                        let key = cell_key(entity, field);
                        if let Some(value) = first.get(&key) {
                            output.insert(key, value.clone());
                        }
                    }
                    Projection::Function { name, args, alias, .. } => {
                        let value = if is_aggregate(name) {
                            aggregate(name, args, &members, registry, &sub)?
                        } else {
                            scalar_param(
                                &crate::condition::Param::Function {
                                    name: name.clone(),
                                    args: args.clone(),
                                },
                                &first,
                                registry,
                                &sub,
                            )?
                        };
                        output.insert(alias.clone(), value);
                    }
                }
            }
            out.push(output);
        }
        Ok(out)
    }

    fn dedupe(spec: &QuerySpec, rows: Vec<QueryRow>) -> Vec<QueryRow> {
        let keys: Vec<String> = spec
            .projections
            .iter()
            .map(|projection| match projection {
                Projection::Column { entity, field, .. } => cell_key(entity, field),
                Projection::Function { alias, .. } => alias.clone(),
            })
            .collect();

        let mut seen = std::collections::HashSet::new();
        rows.into_iter()
            .filter(|row| {
                let key = keys
                    .iter()
                    .map(|k| row.get(k).cloned().unwrap_or(Value::Null).to_string())
                    .collect::<Vec<_>>()
                    .join("\u{1f}");
                seen.insert(key)
            })
            .collect()
    }

    fn apply_ordering(
        &self,
        spec: &QuerySpec,
        rows: &mut [QueryRow],
        registry: &Registry,
    ) -> Result<(), ExecError> {
        if spec.order_by.is_empty() {
            return Ok(());
        }

        let entries: Vec<(String, ColumnKind, SortDirection)> = spec
            .order_by
            .iter()
            .map(|entry| {
                registry
                    .resolve_column(&entry.entity, &entry.field)
                    .map(|(_, column)| {
                        (
                            cell_key(&entry.entity, &entry.field),
                            column.kind,
                            entry.direction,
                        )
                    })
                    .map_err(|e| ExecError::query(e.to_string()))
            })
            .collect::<Result<_, _>>()?;

        rows.sort_by(|a, b| {
            for (key, kind, direction) in &entries {
                let av = a.get(key).cloned().unwrap_or(Value::Null);
                let bv = b.get(key).cloned().unwrap_or(Value::Null);
                // Nulls sort first ascending.
                let ordering = match (av.is_null(), bv.is_null()) {
                    (true, true) => std::cmp::Ordering::Equal,
                    (true, false) => std::cmp::Ordering::Less,
                    (false, true) => std::cmp::Ordering::Greater,
                    (false, false) => av.compare(&bv, kind).unwrap_or(std::cmp::Ordering::Equal),
                };
                let ordering = match direction {
                    SortDirection::Asc => ordering,
                    SortDirection::Desc => ordering.reverse(),
                };
                if ordering != std::cmp::Ordering::Equal {
                    return ordering;
                }
            }
            std::cmp::Ordering::Equal
        });
        Ok(())
    }

    fn lock_driving_rows(
        &self,
        spec: &QuerySpec,
        rows: &[QueryRow],
        registry: &Registry,
        owner: Uuid,
    ) -> Result<(), ExecError> {
        let table = registry
            .descriptor(&spec.entity)
            .ok_or_else(|| ExecError::query(format!("entity '{}' is not registered", spec.entity)))?;
        for row in rows {
            let mut key_row = Row::new();
            for column in table.primary_key() {
                if let Some(value) = row.get(&cell_key(&spec.entity, &column.name)) {
                    key_row.insert(column.name.clone(), value.clone());
                }
            }
            if key_row.len() == table.primary_key().len() {
                let key = Self::encode_key(&table, &key_row).map_err(ExecError::query)?;
                self.acquire_lock(&table.table_name, &key, owner)?;
            }
        }
        Ok(())
    }

    /// Keep only projected cells when the spec projects explicitly.
    fn trim_projection(spec: &QuerySpec, rows: Vec<QueryRow>) -> Vec<QueryRow> {
        if spec.projections.is_empty() {
            return rows;
        }
        let keys: Vec<String> = spec
            .projections
            .iter()
            .map(|projection| match projection {
                Projection::Column { entity, field, .. } => cell_key(entity, field),
                Projection::Function { alias, .. } => alias.clone(),
            })
            .collect();
        rows.into_iter()
            .map(|row| {
                keys.iter()
                    .filter_map(|key| row.get(key).map(|v| (key.clone(), v.clone())))
                    .collect()
            })
            .collect()
    }

    /// Values of a sub-query's first projected column.
    fn first_column_values(
        &self,
        spec: &QuerySpec,
        registry: &Registry,
    ) -> Result<Vec<Value>, ExecError> {
        let rows = self.run(spec, registry, None, true)?;
        let key = match spec.projections.first() {
            Some(Projection::Column { entity, field, .. }) => cell_key(entity, field),
            Some(Projection::Function { alias, .. }) => alias.clone(),
            None => {
                let table = registry.descriptor(&spec.entity).ok_or_else(|| {
                    ExecError::query(format!("entity '{}' is not registered", spec.entity))
                })?;
                let first_key = table
                    .primary_key()
                    .first()
                    .map(|c| c.name.clone())
                    .ok_or_else(|| ExecError::query("sub-query entity has no key"))?;
                cell_key(&spec.entity, &first_key)
            }
        };
        Ok(rows
            .into_iter()
            .map(|row| row.get(&key).cloned().unwrap_or(Value::Null))
            .collect())
    }
}

fn is_aggregate(name: &str) -> bool {
    matches!(
        name.to_ascii_lowercase().as_str(),
        "count" | "sum" | "min" | "max" | "avg"
    )
}

fn aggregate(
    name: &str,
    args: &[crate::condition::Param],
    rows: &[QueryRow],
    registry: &Registry,
    sub: &crate::eval::SubQueryExec<'_>,
) -> Result<Value, ExecError> {
    let mut values = Vec::with_capacity(rows.len());
    if let Some(arg) = args.first() {
        for row in rows {
            let value = scalar_param(arg, row, registry, sub)?;
            if !value.is_null() {
                values.push(value);
            }
        }
    }

    match name.to_ascii_lowercase().as_str() {
        "count" => {
            if args.is_empty() {
                Ok(Value::Int(rows.len() as i64))
            } else {
                Ok(Value::Int(values.len() as i64))
            }
        }
        "sum" | "avg" => {
            let mut total = Decimal::ZERO;
            let mut counted = 0i64;
            for value in &values {
                match value {
                    Value::Int(n) => total += Decimal::from(*n),
                    Value::Decimal(d) => total += *d,
                    other => {
                        return Err(ExecError::query(format!(
                            "{name}() is not defined for {}",
                            other.variant_name()
                        )));
                    }
                }
                counted += 1;
            }
            if name.eq_ignore_ascii_case("avg") {
                if counted == 0 {
                    return Ok(Value::Null);
                }
                return Ok(Value::Decimal(total / Decimal::from(counted)));
            }
            Ok(Value::Decimal(total))
        }
        "min" | "max" => {
            let take_min = name.eq_ignore_ascii_case("min");
            let mut best: Option<Value> = None;
            for value in values {
                let kind = kind_of(&value);
                best = Some(match best.take() {
                    None => value,
                    Some(current) => match value.compare(&current, &kind) {
                        Some(std::cmp::Ordering::Less) if take_min => value,
                        Some(std::cmp::Ordering::Greater) if !take_min => value,
                        _ => current,
                    },
                });
            }
            Ok(best.unwrap_or(Value::Null))
        }
        other => Err(ExecError::query(format!("unknown aggregate '{other}'"))),
    }
}

/// Infer a comparison kind from a runtime value, for aggregates whose
/// argument is not a plain column.
fn kind_of(value: &Value) -> ColumnKind {
    match value {
        Value::Int(_) | Value::Decimal(_) => ColumnKind::Number,
        Value::Bool(_) => ColumnKind::Boolean,
        Value::DateTime(_) => ColumnKind::DateTime,
        Value::Bytes(_) => ColumnKind::Binary,
        _ => ColumnKind::Text,
    }
}

impl StorageBackend for MemoryBackend {
    fn drop_table(&self, table: &TableDescriptor) -> Result<(), ExecError> {
        self.tables
            .write()
            .expect("table lock poisoned")
            .remove(&table.table_name);
        self.locks
            .lock()
            .expect("lock table poisoned")
            .retain(|(locked_table, _), _| locked_table != &table.table_name);
        Ok(())
    }

    fn insert(
        &self,
        table: &TableDescriptor,
        rows: Vec<Row>,
        txn: Option<Uuid>,
    ) -> Result<usize, ExecError> {
        let mut tables = self.tables.write().expect("table lock poisoned");
        let stored = tables.entry(table.table_name.clone()).or_default();
        let mut inserted = 0;
        for row in rows {
            let key = Self::encode_key(table, &row).map_err(ExecError::insert)?;
            if stored.contains_key(&key) {
                return Err(ExecError::insert(format!(
                    "duplicate key '{key}' in table '{}'",
                    table.table_name
                )));
            }
            stored.insert(key.clone(), row);
            inserted += 1;
            self.push_undo(
                txn,
                UndoOp::Insert {
                    table: table.table_name.clone(),
                    key,
                },
            );
        }
        Ok(inserted)
    }

    fn update(
        &self,
        table: &TableDescriptor,
        key: &Row,
        changes: &Row,
        txn: Option<Uuid>,
    ) -> Result<u64, ExecError> {
        let encoded = Self::encode_key(table, key).map_err(ExecError::update)?;
        if self.lock_conflict(&table.table_name, &encoded, txn) {
            return Err(ExecError::update(format!(
                "row '{encoded}' of '{}' is locked by another transaction",
                table.table_name
            )));
        }

        let mut tables = self.tables.write().expect("table lock poisoned");
        let Some(stored) = tables.get_mut(&table.table_name) else {
            return Ok(0);
        };
        let Some(row) = stored.get_mut(&encoded) else {
            return Ok(0);
        };

        self.push_undo(
            txn,
            UndoOp::Update {
                table: table.table_name.clone(),
                key: encoded,
                before: row.clone(),
            },
        );
        for (field, value) in changes {
            row.insert(field.clone(), value.clone());
        }
        Ok(1)
    }

    fn delete(
        &self,
        table: &TableDescriptor,
        key: &Row,
        txn: Option<Uuid>,
    ) -> Result<u64, ExecError> {
        let encoded = Self::encode_key(table, key).map_err(ExecError::delete)?;
        if self.lock_conflict(&table.table_name, &encoded, txn) {
            return Err(ExecError::delete(format!(
                "row '{encoded}' of '{}' is locked by another transaction",
                table.table_name
            )));
        }

        let mut tables = self.tables.write().expect("table lock poisoned");
        let Some(stored) = tables.get_mut(&table.table_name) else {
            return Ok(0);
        };
        let Some(before) = stored.remove(&encoded) else {
            return Ok(0);
        };
        self.push_undo(
            txn,
            UndoOp::Delete {
                table: table.table_name.clone(),
                key: encoded,
                before,
            },
        );
        Ok(1)
    }

    fn fetch(
        &self,
        table: &TableDescriptor,
        params: &Row,
        lock: Option<Uuid>,
    ) -> Result<Option<Row>, ExecError> {
        let found = {
            let tables = self.tables.read().expect("table lock poisoned");
            tables.get(&table.table_name).and_then(|stored| {
                stored
                    .values()
                    .find(|row| {
                        params.iter().all(|(field, expected)| {
                            let kind = table
                                .find_column(field)
                                .map_or(ColumnKind::Text, |c| c.kind.clone());
                            row.get(field)
                                .is_some_and(|actual| actual.equals(expected, &kind))
                        })
                    })
                    .cloned()
            })
        };

        if let (Some(row), Some(owner)) = (&found, lock) {
            let key = Self::encode_key(table, row).map_err(ExecError::retrieve)?;
            self.acquire_lock(&table.table_name, &key, owner)
                .map_err(|e| ExecError::retrieve(e.to_string()))?;
        }
        Ok(found)
    }

    fn select(
        &self,
        spec: &QuerySpec,
        registry: &Registry,
        lock: Option<Uuid>,
    ) -> Result<Vec<QueryRow>, ExecError> {
        self.run(spec, registry, lock, true)
    }

    fn count(&self, spec: &QuerySpec, registry: &Registry) -> Result<u64, ExecError> {
        Ok(self.run(spec, registry, None, false)?.len() as u64)
    }

    fn commit(&self, txn: Uuid) -> Result<(), ExecError> {
        self.undo.lock().expect("undo lock poisoned").remove(&txn);
        self.release_locks(txn);
        Ok(())
    }

    fn rollback(&self, txn: Uuid) -> Result<(), ExecError> {
        let ops = self
            .undo
            .lock()
            .expect("undo lock poisoned")
            .remove(&txn)
            .unwrap_or_default();
        let mut tables = self.tables.write().expect("table lock poisoned");
        for op in ops.into_iter().rev() {
            match op {
                UndoOp::Insert { table, key } => {
                    if let Some(stored) = tables.get_mut(&table) {
                        stored.remove(&key);
                    }
                }
                UndoOp::Update { table, key, before } | UndoOp::Delete { table, key, before } => {
                    tables.entry(table).or_default().insert(key, before);
                }
            }
        }
        drop(tables);
        self.release_locks(txn);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::{ColumnDescriptor, TableDescriptor};
    use crate::query::QueryBuilder;

    fn registry() -> Registry {
        let registry = Registry::new();
        registry
            .register(
                TableDescriptor::new("item", "items")
                    .column(ColumnDescriptor::new("id", ColumnKind::Number).primary_key())
                    .column(ColumnDescriptor::new("label", ColumnKind::Text))
                    .column(ColumnDescriptor::new("qty", ColumnKind::Number)),
            )
            .unwrap();
        registry
    }

    fn item(id: i64, label: &str, qty: i64) -> Row {
        let mut row = Row::new();
        row.insert("id".into(), Value::Int(id));
        row.insert("label".into(), Value::from(label));
        row.insert("qty".into(), Value::Int(qty));
        row
    }

    fn seeded() -> (Registry, MemoryBackend) {
        let registry = registry();
        let backend = MemoryBackend::new();
        let table = registry.descriptor("item").unwrap();
        backend
            .insert(
                &table,
                vec![item(1, "apple", 5), item(2, "banana", 3), item(3, "avocado", 9)],
                None,
            )
            .unwrap();
        (registry, backend)
    }

    // =========================================================================
    // CRUD Tests
    // =========================================================================

    #[test]
    fn test_insert_rejects_duplicate_keys() {
        let (registry, backend) = seeded();
        let table = registry.descriptor("item").unwrap();
        assert!(matches!(
            backend.insert(&table, vec![item(1, "dup", 0)], None),
            Err(ExecError::Insert(_))
        ));
    }

    #[test]
    fn test_fetch_by_non_key_field() {
        let (registry, backend) = seeded();
        let table = registry.descriptor("item").unwrap();
        let mut params = Row::new();
        params.insert("label".into(), Value::from("banana"));

        let row = backend.fetch(&table, &params, None).unwrap().unwrap();
        assert_eq!(row.get("id"), Some(&Value::Int(2)));
    }

    #[test]
    fn test_update_and_delete_affected_counts() {
        let (registry, backend) = seeded();
        let table = registry.descriptor("item").unwrap();
        let mut key = Row::new();
        key.insert("id".into(), Value::Int(2));
        let mut changes = Row::new();
        changes.insert("qty".into(), Value::Int(7));

        assert_eq!(backend.update(&table, &key, &changes, None).unwrap(), 1);
        assert_eq!(backend.delete(&table, &key, None).unwrap(), 1);
        assert_eq!(backend.delete(&table, &key, None).unwrap(), 0);
    }

    // =========================================================================
    // Query Tests
    // =========================================================================

    #[test]
    fn test_select_filter_order_page() {
        let (registry, backend) = seeded();
        let spec = QueryBuilder::new(&registry, "item")
            .unwrap()
            .filter(crate::condition::Condition::like(&registry, "item", "label", "a%").unwrap())
            .unwrap()
            .order_by("item", "qty", 1, SortDirection::Desc)
            .unwrap()
            .page(1, 1)
            .unwrap()
            .confirm()
            .unwrap();

        let rows = backend.select(&spec, &registry, None).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].get("item.label"), Some(&Value::from("avocado")));

        // Count ignores the pager.
        assert_eq!(backend.count(&spec, &registry).unwrap(), 2);
    }

    #[test]
    fn test_grouping_with_aggregates() {
        let (registry, backend) = seeded();
        let table = registry.descriptor("item").unwrap();
        backend.insert(&table, vec![item(4, "apple", 2)], None).unwrap();

        let spec = QueryBuilder::new(&registry, "item")
            .unwrap()
            .select("item", "label")
            .unwrap()
            .select_function(
                "sum",
                vec![crate::condition::Param::column("item", "qty")],
                "total_qty",
            )
            .unwrap()
            .group_by("item", "label", 1)
            .unwrap()
            .order_by("item", "label", 1, SortDirection::Asc)
            .unwrap()
            .confirm()
            .unwrap();

        let rows = backend.select(&spec, &registry, None).unwrap();
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[0].get("item.label"), Some(&Value::from("apple")));
        assert_eq!(
            rows[0].get("total_qty"),
            Some(&Value::Decimal(Decimal::from(7)))
        );
    }

    // =========================================================================
    // Transaction Tests
    // =========================================================================

    #[test]
    fn test_rollback_restores_rows() {
        let (registry, backend) = seeded();
        let table = registry.descriptor("item").unwrap();
        let txn = Uuid::now_v7();

        let mut key = Row::new();
        key.insert("id".into(), Value::Int(1));
        let mut changes = Row::new();
        changes.insert("qty".into(), Value::Int(100));

        backend.update(&table, &key, &changes, Some(txn)).unwrap();
        backend.delete(&table, &key, Some(txn)).unwrap();
        backend.insert(&table, vec![item(9, "new", 1)], Some(txn)).unwrap();

        backend.rollback(txn).unwrap();

        let row = backend.fetch(&table, &key, None).unwrap().unwrap();
        assert_eq!(row.get("qty"), Some(&Value::Int(5)));
        let mut nine = Row::new();
        nine.insert("id".into(), Value::Int(9));
        assert!(backend.fetch(&table, &nine, None).unwrap().is_none());
    }

    #[test]
    fn test_lock_conflicts() {
        let (registry, backend) = seeded();
        let table = registry.descriptor("item").unwrap();
        let first = Uuid::now_v7();
        let second = Uuid::now_v7();

        let mut key = Row::new();
        key.insert("id".into(), Value::Int(1));

        backend.fetch(&table, &key, Some(first)).unwrap();
        assert!(backend.fetch(&table, &key, Some(second)).is_err());

        let mut changes = Row::new();
        changes.insert("qty".into(), Value::Int(1));
        assert!(backend.update(&table, &key, &changes, Some(second)).is_err());
        assert_eq!(backend.update(&table, &key, &changes, Some(first)).unwrap(), 1);

        backend.commit(first).unwrap();
        assert!(backend.fetch(&table, &key, Some(second)).is_ok());
    }
}
