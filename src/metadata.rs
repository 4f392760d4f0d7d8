//! Descriptor model for entity metadata
//!
//! An entity type is described once, declaratively, as a [`TableDescriptor`]:
//! its table name, ordered columns, primary key, indexes, references and key
//! generator. Descriptors are built with the fluent constructors below,
//! validated by the registry at registration time, and immutable afterwards.

use serde::{Deserialize, Serialize};

/// Logical type of a column.
///
/// Comparison and coercion semantics are derived from this kind, never from
/// the runtime variant of a value alone.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum ColumnKind {
    /// Integer-ranged number (stores `Int` or `Decimal` values).
    Number,
    /// Fixed-point number with explicit precision and scale.
    Decimal { precision: u8, scale: u8 },
    Boolean,
    DateTime,
    Binary,
    Text,
    /// Backend-opaque type decoded by a named value parser.
    Custom,
}

impl ColumnKind {
    /// Decimal kind with the given precision and scale.
    pub const fn decimal(precision: u8, scale: u8) -> Self {
        Self::Decimal { precision, scale }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Number => "number",
            Self::Decimal { .. } => "decimal",
            Self::Boolean => "boolean",
            Self::DateTime => "datetime",
            Self::Binary => "binary",
            Self::Text => "text",
            Self::Custom => "custom",
        }
    }

    /// Whether two kinds share a comparison family, used to type-check
    /// reference join pairs and column-to-column parameters.
    pub fn same_family(&self, other: &Self) -> bool {
        matches!(
            (self, other),
            (
                Self::Number | Self::Decimal { .. },
                Self::Number | Self::Decimal { .. }
            ) | (Self::Boolean, Self::Boolean)
                | (Self::DateTime, Self::DateTime)
                | (Self::Binary, Self::Binary)
                | (Self::Text | Self::Custom, Self::Text | Self::Custom)
        )
    }
}

/// One persisted field of an entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ColumnDescriptor {
    /// Field name on the entity.
    pub name: String,
    /// Storage column name (defaults to the field name).
    pub column_name: String,
    pub kind: ColumnKind,
    /// Whether the column allows NULL values (default: true).
    #[serde(default = "default_true")]
    pub nullable: bool,
    /// Maximum length for text/binary columns.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub length: Option<u32>,
    #[serde(default)]
    pub primary_key: bool,
    /// Lazy columns are excluded from materialization and fetched on first
    /// access.
    #[serde(default)]
    pub lazy: bool,
    /// Marks data subject to external masking/encryption policy.
    #[serde(default)]
    pub sensitive: bool,
    /// Name of the value parser for `Custom` columns.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parser: Option<String>,
}

fn default_true() -> bool {
    true
}

impl ColumnDescriptor {
    pub fn new(name: impl Into<String>, kind: ColumnKind) -> Self {
        let name = name.into();
        Self {
            column_name: name.clone(),
            name,
            kind,
            nullable: true,
            length: None,
            primary_key: false,
            lazy: false,
            sensitive: false,
            parser: None,
        }
    }

    /// Override the storage column name.
    pub fn column_name(mut self, column_name: impl Into<String>) -> Self {
        self.column_name = column_name.into();
        self
    }

    pub fn not_null(mut self) -> Self {
        self.nullable = false;
        self
    }

    pub fn length(mut self, length: u32) -> Self {
        self.length = Some(length);
        self
    }

    /// Mark the column as (part of) the primary key. Implies not-null.
    pub fn primary_key(mut self) -> Self {
        self.primary_key = true;
        self.nullable = false;
        self
    }

    pub fn lazy(mut self) -> Self {
        self.lazy = true;
        self
    }

    pub fn sensitive(mut self) -> Self {
        self.sensitive = true;
        self
    }

    pub fn parser(mut self, parser: impl Into<String>) -> Self {
        self.parser = Some(parser.into());
        self
    }
}

/// Cardinality of a reference, seen from the declaring entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Cardinality {
    /// At most one target record.
    One,
    /// A collection of target records.
    Many,
}

/// What happens to referencing records when their target is dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Cascade {
    None,
    Delete,
    Nullify,
}

/// A declared association to another entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReferenceDescriptor {
    /// Field name the association is accessed under.
    pub name: String,
    /// Target entity name.
    pub target: String,
    /// Ordered (local field, target field) join pairs.
    pub pairs: Vec<(String, String)>,
    pub cardinality: Cardinality,
    /// References resolve lazily by default.
    #[serde(default = "default_true")]
    pub lazy: bool,
    #[serde(default = "default_cascade")]
    pub cascade: Cascade,
}

fn default_cascade() -> Cascade {
    Cascade::None
}

impl ReferenceDescriptor {
    pub fn new(
        name: impl Into<String>,
        target: impl Into<String>,
        pairs: Vec<(String, String)>,
    ) -> Self {
        Self {
            name: name.into(),
            target: target.into(),
            pairs,
            cardinality: Cardinality::One,
            lazy: true,
            cascade: Cascade::None,
        }
    }

    pub fn many(mut self) -> Self {
        self.cardinality = Cardinality::Many;
        self
    }

    pub fn eager(mut self) -> Self {
        self.lazy = false;
        self
    }

    pub fn cascade(mut self, cascade: Cascade) -> Self {
        self.cascade = cascade;
        self
    }
}

/// A declared index over entity fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexDescriptor {
    pub name: String,
    pub fields: Vec<String>,
    #[serde(default)]
    pub unique: bool,
}

impl IndexDescriptor {
    pub fn new(name: impl Into<String>, fields: Vec<String>) -> Self {
        Self {
            name: name.into(),
            fields,
            unique: false,
        }
    }

    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }
}

/// Bounds and stepping of a named sequence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SequenceSpec {
    pub name: String,
    pub min: i64,
    pub max: i64,
    pub step: i64,
    /// First value the sequence issues.
    pub start: i64,
    /// Wrap to `min` instead of failing when stepping past `max`.
    pub cycle: bool,
}

impl SequenceSpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            min: 1,
            max: i64::MAX,
            step: 1,
            start: 1,
            cycle: false,
        }
    }

    pub fn range(mut self, min: i64, max: i64) -> Self {
        self.min = min;
        self.max = max;
        self.start = self.start.clamp(min, max);
        self
    }

    pub fn step(mut self, step: i64) -> Self {
        self.step = step;
        self
    }

    pub fn start(mut self, start: i64) -> Self {
        self.start = start;
        self
    }

    pub fn cycle(mut self) -> Self {
        self.cycle = true;
        self
    }
}

/// How primary key values are produced for new records.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "strategy", rename_all = "lowercase")]
pub enum GeneratorDescriptor {
    /// The caller assigns keys before saving.
    Assigned,
    /// The engine issues keys from a bounded sequence.
    Sequence(SequenceSpec),
    /// The engine generates opaque unique keys (UUID text).
    Generated,
}

/// Whether `drop_tables` may drop this entity's table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DropPolicy {
    Allow,
    Deny,
}

/// Whether rows of this entity may be locked for update.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LockPolicy {
    Allow,
    Deny,
}

/// Complete metadata for one entity type.
///
/// Built once with the fluent constructors, validated and frozen by the
/// registry. All lookups during query building and materialization go
/// through this descriptor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TableDescriptor {
    /// Logical entity name (registry key).
    pub entity: String,
    /// Storage table name.
    pub table_name: String,
    pub columns: Vec<ColumnDescriptor>,
    #[serde(default)]
    pub indexes: Vec<IndexDescriptor>,
    #[serde(default)]
    pub references: Vec<ReferenceDescriptor>,
    pub generator: GeneratorDescriptor,
    pub lock_policy: LockPolicy,
    pub drop_policy: DropPolicy,
}

impl TableDescriptor {
    pub fn new(entity: impl Into<String>, table_name: impl Into<String>) -> Self {
        Self {
            entity: entity.into(),
            table_name: table_name.into(),
            columns: Vec::new(),
            indexes: Vec::new(),
            references: Vec::new(),
            generator: GeneratorDescriptor::Assigned,
            lock_policy: LockPolicy::Allow,
            drop_policy: DropPolicy::Allow,
        }
    }

    pub fn column(mut self, column: ColumnDescriptor) -> Self {
        self.columns.push(column);
        self
    }

    pub fn index(mut self, index: IndexDescriptor) -> Self {
        self.indexes.push(index);
        self
    }

    pub fn reference(mut self, reference: ReferenceDescriptor) -> Self {
        self.references.push(reference);
        self
    }

    pub fn generator(mut self, generator: GeneratorDescriptor) -> Self {
        self.generator = generator;
        self
    }

    pub fn lock_policy(mut self, policy: LockPolicy) -> Self {
        self.lock_policy = policy;
        self
    }

    pub fn drop_policy(mut self, policy: DropPolicy) -> Self {
        self.drop_policy = policy;
        self
    }

    // =========================================================================
    // Lookups
    // =========================================================================

    pub fn find_column(&self, field: &str) -> Option<&ColumnDescriptor> {
        self.columns.iter().find(|c| c.name == field)
    }

    pub fn find_reference(&self, name: &str) -> Option<&ReferenceDescriptor> {
        self.references.iter().find(|r| r.name == name)
    }

    /// Primary key columns, in declaration order.
    pub fn primary_key(&self) -> Vec<&ColumnDescriptor> {
        self.columns.iter().filter(|c| c.primary_key).collect()
    }

    /// Field names of lazy columns.
    pub fn lazy_fields(&self) -> impl Iterator<Item = &str> {
        self.columns
            .iter()
            .filter(|c| c.lazy)
            .map(|c| c.name.as_str())
    }
}
