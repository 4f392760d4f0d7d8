//! Process-wide descriptor registry
//!
//! The registry owns one immutable [`TableDescriptor`] per registered entity
//! and the runtime cursors of sequence generators. Lookups are read-mostly:
//! descriptors live behind `Arc` in a map guarded by an `RwLock`, and
//! registration builds and validates the replacement descriptor entirely
//! outside the lock, so concurrent readers observe either the old or the new
//! descriptor, never partial state, and unrelated entities stay available
//! while one entry is swapped.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

use crate::error::{BuilderError, TableConfigError};
use crate::ident::{validate_entity_name, validate_identifier};
use crate::metadata::{ColumnDescriptor, GeneratorDescriptor, TableDescriptor};

#[derive(Debug, Default)]
pub struct Registry {
    tables: RwLock<HashMap<String, Arc<TableDescriptor>>>,
    /// Next value each registered sequence will issue, keyed by entity.
    sequences: Mutex<HashMap<String, i64>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    // =========================================================================
    // Registration
    // =========================================================================

    /// Validate and install a descriptor, replacing any previous one for the
    /// same entity atomically.
    ///
    /// Fails with a [`TableConfigError`] when the primary key is missing, a
    /// column name is duplicated or malformed, a reference does not
    /// type-check against both endpoints, an index names an unknown field,
    /// or sequence bounds are inconsistent.
    pub fn register(&self, descriptor: TableDescriptor) -> Result<(), TableConfigError> {
        self.validate(&descriptor)?;

        if let GeneratorDescriptor::Sequence(seq) = &descriptor.generator {
            // Re-registration resets the cursor to the declared start.
            self.sequences
                .lock()
                .expect("sequence lock poisoned")
                .insert(descriptor.entity.clone(), seq.start);
        }

        let entity = descriptor.entity.clone();
        let descriptor = Arc::new(descriptor);
        self.tables
            .write()
            .expect("registry lock poisoned")
            .insert(entity, descriptor);
        Ok(())
    }

    /// Remove descriptors. Returns how many were actually removed.
    ///
    /// Safe to call while clients hold transactions: records already
    /// materialized keep their own `Arc` to the descriptor.
    pub fn remove(&self, entities: &[&str]) -> usize {
        let mut tables = self.tables.write().expect("registry lock poisoned");
        let mut sequences = self.sequences.lock().expect("sequence lock poisoned");
        let mut removed = 0;
        for entity in entities {
            if tables.remove(*entity).is_some() {
                removed += 1;
            }
            sequences.remove(*entity);
        }
        removed
    }

    // =========================================================================
    // Lookups
    // =========================================================================

    pub fn descriptor(&self, entity: &str) -> Option<Arc<TableDescriptor>> {
        self.tables
            .read()
            .expect("registry lock poisoned")
            .get(entity)
            .cloned()
    }

    pub fn contains(&self, entity: &str) -> bool {
        self.tables
            .read()
            .expect("registry lock poisoned")
            .contains_key(entity)
    }

    pub fn entities(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .tables
            .read()
            .expect("registry lock poisoned")
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }

    /// Resolve `(entity, field)` to its descriptor pair for builder-time
    /// validation.
    pub fn resolve_column(
        &self,
        entity: &str,
        field: &str,
    ) -> Result<(Arc<TableDescriptor>, ColumnDescriptor), BuilderError> {
        let table = self
            .descriptor(entity)
            .ok_or_else(|| BuilderError::UnknownEntity(entity.to_string()))?;
        let column = table
            .find_column(field)
            .ok_or_else(|| BuilderError::UnknownField {
                entity: entity.to_string(),
                field: field.to_string(),
            })?
            .clone();
        Ok((table, column))
    }

    // =========================================================================
    // Sequences
    // =========================================================================

    /// Issue the next value of the entity's sequence generator.
    pub fn next_sequence_value(&self, entity: &str) -> Result<i64, TableConfigError> {
        let table = self
            .descriptor(entity)
            .ok_or_else(|| TableConfigError::UnknownEntity(entity.to_string()))?;
        let GeneratorDescriptor::Sequence(seq) = &table.generator else {
            return Err(TableConfigError::BadSequence {
                sequence: entity.to_string(),
                detail: "entity has no sequence generator".to_string(),
            });
        };

        let mut cursors = self.sequences.lock().expect("sequence lock poisoned");
        let cursor = cursors.entry(table.entity.clone()).or_insert(seq.start);

        let value = if *cursor > seq.max {
            if !seq.cycle {
                return Err(TableConfigError::SequenceExhausted(seq.name.clone()));
            }
            seq.min
        } else {
            *cursor
        };

        // Overflow can only step past max, which the next call handles.
        *cursor = value.checked_add(seq.step).unwrap_or(i64::MAX);
        Ok(value)
    }

    // =========================================================================
    // Validation
    // =========================================================================

    fn validate(&self, descriptor: &TableDescriptor) -> Result<(), TableConfigError> {
        validate_entity_name(&descriptor.entity).map_err(TableConfigError::InvalidIdentifier)?;
        validate_identifier(&descriptor.table_name).map_err(TableConfigError::InvalidIdentifier)?;

        let mut seen = std::collections::HashSet::new();
        for column in &descriptor.columns {
            validate_identifier(&column.column_name)
                .map_err(TableConfigError::InvalidIdentifier)?;
            if !seen.insert(column.name.as_str()) {
                return Err(TableConfigError::DuplicateColumn {
                    entity: descriptor.entity.clone(),
                    column: column.name.clone(),
                });
            }
        }

        if descriptor.primary_key().is_empty() {
            return Err(TableConfigError::MissingPrimaryKey(descriptor.entity.clone()));
        }

        for index in &descriptor.indexes {
            for field in &index.fields {
                if descriptor.find_column(field).is_none() {
                    return Err(TableConfigError::BadIndex {
                        entity: descriptor.entity.clone(),
                        index: index.name.clone(),
                        field: field.clone(),
                    });
                }
            }
        }

        for reference in &descriptor.references {
            self.validate_reference(descriptor, reference)?;
        }

        if let GeneratorDescriptor::Sequence(seq) = &descriptor.generator {
            if seq.min > seq.max || seq.start < seq.min || seq.start > seq.max {
                return Err(TableConfigError::BadSequence {
                    sequence: seq.name.clone(),
                    detail: format!(
                        "bounds must satisfy min <= start <= max (min {}, start {}, max {})",
                        seq.min, seq.start, seq.max
                    ),
                });
            }
            if seq.step < 1 {
                return Err(TableConfigError::BadSequence {
                    sequence: seq.name.clone(),
                    detail: format!("step must be >= 1 (got {})", seq.step),
                });
            }
        }

        Ok(())
    }

    fn validate_reference(
        &self,
        descriptor: &TableDescriptor,
        reference: &crate::metadata::ReferenceDescriptor,
    ) -> Result<(), TableConfigError> {
        let bad = |detail: String| TableConfigError::BadReference {
            entity: descriptor.entity.clone(),
            reference: reference.name.clone(),
            detail,
        };

        if reference.pairs.is_empty() {
            return Err(bad("reference declares no join pairs".to_string()));
        }
        if descriptor.find_column(&reference.name).is_some() {
            return Err(bad(format!(
                "reference name '{}' collides with a column",
                reference.name
            )));
        }

        // Self-references type-check against the descriptor being installed.
        let target = if reference.target == descriptor.entity {
            None
        } else {
            Some(self.descriptor(&reference.target).ok_or_else(|| {
                bad(format!("target entity '{}' is not registered", reference.target))
            })?)
        };
        let target: &TableDescriptor = target.as_deref().unwrap_or(descriptor);

        for (local, remote) in &reference.pairs {
            let local_col = descriptor
                .find_column(local)
                .ok_or_else(|| bad(format!("local field '{local}' does not exist")))?;
            let remote_col = target.find_column(remote).ok_or_else(|| {
                bad(format!(
                    "target field '{}.{remote}' does not exist",
                    reference.target
                ))
            })?;
            if !local_col.kind.same_family(&remote_col.kind) {
                return Err(bad(format!(
                    "join pair '{local}' ({}) and '{remote}' ({}) have incompatible kinds",
                    local_col.kind.name(),
                    remote_col.kind.name()
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::{ColumnKind, ReferenceDescriptor, SequenceSpec};

    fn customer() -> TableDescriptor {
        TableDescriptor::new("customer", "customers")
            .column(ColumnDescriptor::new("id", ColumnKind::Number).primary_key())
            .column(ColumnDescriptor::new("name", ColumnKind::Text))
    }

    fn order() -> TableDescriptor {
        TableDescriptor::new("order", "orders")
            .column(ColumnDescriptor::new("id", ColumnKind::Number).primary_key())
            .column(ColumnDescriptor::new("total", ColumnKind::decimal(10, 2)))
            .column(ColumnDescriptor::new("customer_id", ColumnKind::Number))
            .reference(ReferenceDescriptor::new(
                "customer",
                "customer",
                vec![("customer_id".into(), "id".into())],
            ))
    }

    // =========================================================================
    // Registration Tests
    // =========================================================================

    #[test]
    fn test_register_and_lookup() {
        let registry = Registry::new();
        registry.register(customer()).unwrap();
        registry.register(order()).unwrap();

        let table = registry.descriptor("order").unwrap();
        assert_eq!(table.table_name, "orders");
        assert!(registry.descriptor("ghost").is_none());
    }

    #[test]
    fn test_missing_primary_key_rejected() {
        let registry = Registry::new();
        let table = TableDescriptor::new("note", "notes")
            .column(ColumnDescriptor::new("body", ColumnKind::Text));
        assert!(matches!(
            registry.register(table),
            Err(TableConfigError::MissingPrimaryKey(_))
        ));
    }

    #[test]
    fn test_duplicate_column_rejected() {
        let registry = Registry::new();
        let table = TableDescriptor::new("note", "notes")
            .column(ColumnDescriptor::new("id", ColumnKind::Number).primary_key())
            .column(ColumnDescriptor::new("id", ColumnKind::Text));
        assert!(matches!(
            registry.register(table),
            Err(TableConfigError::DuplicateColumn { .. })
        ));
    }

    #[test]
    fn test_reference_requires_registered_target() {
        let registry = Registry::new();
        assert!(matches!(
            registry.register(order()),
            Err(TableConfigError::BadReference { .. })
        ));

        registry.register(customer()).unwrap();
        registry.register(order()).unwrap();
    }

    #[test]
    fn test_reference_pairs_type_check() {
        let registry = Registry::new();
        registry.register(customer()).unwrap();

        let table = TableDescriptor::new("order", "orders")
            .column(ColumnDescriptor::new("id", ColumnKind::Number).primary_key())
            .column(ColumnDescriptor::new("customer_id", ColumnKind::Text))
            .reference(ReferenceDescriptor::new(
                "customer",
                "customer",
                vec![("customer_id".into(), "id".into())],
            ));
        assert!(matches!(
            registry.register(table),
            Err(TableConfigError::BadReference { .. })
        ));
    }

    #[test]
    fn test_index_must_name_known_fields() {
        let registry = Registry::new();
        let table = customer().index(crate::metadata::IndexDescriptor::new(
            "customers_ghost_idx",
            vec!["ghost".into()],
        ));
        assert!(matches!(
            registry.register(table),
            Err(TableConfigError::BadIndex { .. })
        ));
    }

    #[test]
    fn test_reregistration_replaces() {
        let registry = Registry::new();
        registry.register(customer()).unwrap();

        let replacement = TableDescriptor::new("customer", "customers_v2")
            .column(ColumnDescriptor::new("id", ColumnKind::Number).primary_key());
        registry.register(replacement).unwrap();

        assert_eq!(registry.descriptor("customer").unwrap().table_name, "customers_v2");
        assert_eq!(registry.entities().len(), 1);
    }

    #[test]
    fn test_remove_returns_count() {
        let registry = Registry::new();
        registry.register(customer()).unwrap();
        assert_eq!(registry.remove(&["customer", "ghost"]), 1);
        assert!(registry.descriptor("customer").is_none());
    }

    // =========================================================================
    // Sequence Tests
    // =========================================================================

    fn sequenced(cycle: bool) -> TableDescriptor {
        let mut seq = SequenceSpec::new("ticket_seq").range(1, 3);
        if cycle {
            seq = seq.cycle();
        }
        TableDescriptor::new("ticket", "tickets")
            .column(ColumnDescriptor::new("id", ColumnKind::Number).primary_key())
            .generator(GeneratorDescriptor::Sequence(seq))
    }

    #[test]
    fn test_sequence_cycles_in_order() {
        let registry = Registry::new();
        registry.register(sequenced(true)).unwrap();

        let issued: Vec<i64> = (0..5)
            .map(|_| registry.next_sequence_value("ticket").unwrap())
            .collect();
        assert_eq!(issued, vec![1, 2, 3, 1, 2]);
    }

    #[test]
    fn test_sequence_exhaustion_without_cycle() {
        let registry = Registry::new();
        registry.register(sequenced(false)).unwrap();

        for expected in 1..=3 {
            assert_eq!(registry.next_sequence_value("ticket").unwrap(), expected);
        }
        assert!(matches!(
            registry.next_sequence_value("ticket"),
            Err(TableConfigError::SequenceExhausted(_))
        ));
    }

    #[test]
    fn test_sequence_bounds_validated() {
        let registry = Registry::new();
        let table = TableDescriptor::new("ticket", "tickets")
            .column(ColumnDescriptor::new("id", ColumnKind::Number).primary_key())
            .generator(GeneratorDescriptor::Sequence(
                SequenceSpec::new("bad_seq").range(10, 5),
            ));
        assert!(matches!(
            registry.register(table),
            Err(TableConfigError::BadSequence { .. })
        ));
    }
}
