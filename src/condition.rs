//! Condition and parameter model
//!
//! A condition is a recursive boolean expression tree: column leaves compare
//! a field against a parameter, groups combine children with AND/OR. Leaf
//! constructors validate against the registry before anything is built, so
//! an installed condition tree only ever references known columns with
//! parameters that fit the column's declared kind.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::error::BuilderError;
use crate::metadata::{ColumnDescriptor, ColumnKind};
use crate::query::QuerySpec;
use crate::registry::Registry;
use crate::value::Value;

/// Boolean connector for condition groups.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Connector {
    And,
    Or,
}

/// Comparison operator of a column leaf.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CompareOp {
    Eq,
    Ne,
    Gt,
    Ge,
    Lt,
    Le,
    Like,
    NotLike,
    Between,
    NotBetween,
    In,
    NotIn,
    IsNull,
    NotNull,
}

impl CompareOp {
    pub const fn name(self) -> &'static str {
        match self {
            Self::Eq => "eq",
            Self::Ne => "ne",
            Self::Gt => "gt",
            Self::Ge => "ge",
            Self::Lt => "lt",
            Self::Le => "le",
            Self::Like => "like",
            Self::NotLike => "not-like",
            Self::Between => "between",
            Self::NotBetween => "not-between",
            Self::In => "in",
            Self::NotIn => "not-in",
            Self::IsNull => "is-null",
            Self::NotNull => "not-null",
        }
    }
}

/// Right-hand side of a column comparison.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Param {
    Constant(Value),
    /// Reference to another column in the query's scope.
    Column { entity: String, field: String },
    /// Scalar function over nested parameters.
    Function { name: String, args: Vec<Param> },
    Range { low: Value, high: Value },
    Array(Vec<Value>),
    SubQuery(Box<QuerySpec>),
}

impl Param {
    pub fn constant(value: impl Into<Value>) -> Self {
        Self::Constant(value.into())
    }

    pub fn column(entity: impl Into<String>, field: impl Into<String>) -> Self {
        Self::Column {
            entity: entity.into(),
            field: field.into(),
        }
    }

    pub fn function(name: impl Into<String>, args: Vec<Param>) -> Self {
        Self::Function {
            name: name.into(),
            args,
        }
    }

    pub fn range(low: impl Into<Value>, high: impl Into<Value>) -> Self {
        Self::Range {
            low: low.into(),
            high: high.into(),
        }
    }

    pub fn array(values: Vec<Value>) -> Self {
        Self::Array(values)
    }

    pub fn sub_query(spec: QuerySpec) -> Self {
        Self::SubQuery(Box::new(spec))
    }

    pub const fn variant_name(&self) -> &'static str {
        match self {
            Self::Constant(_) => "constant",
            Self::Column { .. } => "column",
            Self::Function { .. } => "function",
            Self::Range { .. } => "range",
            Self::Array(_) => "array",
            Self::SubQuery(_) => "sub-query",
        }
    }

    /// Entities referenced directly by this parameter (sub-queries validate
    /// their own scope when confirmed and are not walked).
    pub(crate) fn collect_entities(&self, out: &mut BTreeSet<String>) {
        match self {
            Self::Column { entity, .. } => {
                out.insert(entity.clone());
            }
            Self::Function { args, .. } => {
                for arg in args {
                    arg.collect_entities(out);
                }
            }
            _ => {}
        }
    }
}

/// A node in the condition tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Condition {
    Column {
        entity: String,
        field: String,
        op: CompareOp,
        param: Param,
    },
    Group {
        connector: Connector,
        children: Vec<Condition>,
    },
}

impl Condition {
    /// Build a validated column leaf.
    ///
    /// Fails before construction when the field is unknown, the parameter
    /// shape does not fit the operator, a constant does not coerce to the
    /// column's declared kind, or a range is inverted.
    pub fn column(
        registry: &Registry,
        entity: &str,
        field: &str,
        op: CompareOp,
        param: Param,
    ) -> Result<Self, BuilderError> {
        let (_, column) = registry.resolve_column(entity, field)?;
        Self::check_param(registry, entity, &column, op, &param)?;
        Ok(Self::Column {
            entity: entity.to_string(),
            field: field.to_string(),
            op,
            param,
        })
    }

    /// Build a group with an explicit connector. Requires at least one child.
    pub fn group(connector: Connector, children: Vec<Condition>) -> Result<Self, BuilderError> {
        if children.is_empty() {
            return Err(BuilderError::EmptyGroup);
        }
        Ok(Self::Group {
            connector,
            children,
        })
    }

    pub fn and(children: Vec<Condition>) -> Result<Self, BuilderError> {
        Self::group(Connector::And, children)
    }

    pub fn or(children: Vec<Condition>) -> Result<Self, BuilderError> {
        Self::group(Connector::Or, children)
    }

    // =========================================================================
    // Leaf shortcuts
    // =========================================================================

    pub fn eq(
        registry: &Registry,
        entity: &str,
        field: &str,
        value: impl Into<Value>,
    ) -> Result<Self, BuilderError> {
        Self::column(registry, entity, field, CompareOp::Eq, Param::constant(value))
    }

    pub fn ne(
        registry: &Registry,
        entity: &str,
        field: &str,
        value: impl Into<Value>,
    ) -> Result<Self, BuilderError> {
        Self::column(registry, entity, field, CompareOp::Ne, Param::constant(value))
    }

    pub fn gt(
        registry: &Registry,
        entity: &str,
        field: &str,
        value: impl Into<Value>,
    ) -> Result<Self, BuilderError> {
        Self::column(registry, entity, field, CompareOp::Gt, Param::constant(value))
    }

    pub fn ge(
        registry: &Registry,
        entity: &str,
        field: &str,
        value: impl Into<Value>,
    ) -> Result<Self, BuilderError> {
        Self::column(registry, entity, field, CompareOp::Ge, Param::constant(value))
    }

    pub fn lt(
        registry: &Registry,
        entity: &str,
        field: &str,
        value: impl Into<Value>,
    ) -> Result<Self, BuilderError> {
        Self::column(registry, entity, field, CompareOp::Lt, Param::constant(value))
    }

    pub fn le(
        registry: &Registry,
        entity: &str,
        field: &str,
        value: impl Into<Value>,
    ) -> Result<Self, BuilderError> {
        Self::column(registry, entity, field, CompareOp::Le, Param::constant(value))
    }

    /// SQL LIKE with `%`/`_` wildcards.
    pub fn like(
        registry: &Registry,
        entity: &str,
        field: &str,
        pattern: impl Into<String>,
    ) -> Result<Self, BuilderError> {
        Self::column(
            registry,
            entity,
            field,
            CompareOp::Like,
            Param::constant(pattern.into()),
        )
    }

    pub fn not_like(
        registry: &Registry,
        entity: &str,
        field: &str,
        pattern: impl Into<String>,
    ) -> Result<Self, BuilderError> {
        Self::column(
            registry,
            entity,
            field,
            CompareOp::NotLike,
            Param::constant(pattern.into()),
        )
    }

    pub fn between(
        registry: &Registry,
        entity: &str,
        field: &str,
        low: impl Into<Value>,
        high: impl Into<Value>,
    ) -> Result<Self, BuilderError> {
        Self::column(
            registry,
            entity,
            field,
            CompareOp::Between,
            Param::range(low, high),
        )
    }

    pub fn in_values(
        registry: &Registry,
        entity: &str,
        field: &str,
        values: Vec<Value>,
    ) -> Result<Self, BuilderError> {
        Self::column(registry, entity, field, CompareOp::In, Param::array(values))
    }

    pub fn is_null(registry: &Registry, entity: &str, field: &str) -> Result<Self, BuilderError> {
        Self::column(
            registry,
            entity,
            field,
            CompareOp::IsNull,
            Param::Constant(Value::Null),
        )
    }

    pub fn not_null(registry: &Registry, entity: &str, field: &str) -> Result<Self, BuilderError> {
        Self::column(
            registry,
            entity,
            field,
            CompareOp::NotNull,
            Param::Constant(Value::Null),
        )
    }

    /// Entities referenced anywhere in this tree, for builder scope checks.
    pub(crate) fn collect_entities(&self, out: &mut BTreeSet<String>) {
        match self {
            Self::Column { entity, param, .. } => {
                out.insert(entity.clone());
                param.collect_entities(out);
            }
            Self::Group { children, .. } => {
                for child in children {
                    child.collect_entities(out);
                }
            }
        }
    }

    // =========================================================================
    // Parameter validation
    // =========================================================================

    fn check_param(
        registry: &Registry,
        entity: &str,
        column: &ColumnDescriptor,
        op: CompareOp,
        param: &Param,
    ) -> Result<(), BuilderError> {
        let mismatch = || BuilderError::OperatorParamMismatch {
            operator: op.name(),
            parameter: param.variant_name(),
        };
        let kind_mismatch = |value: &Value| BuilderError::KindMismatch {
            entity: entity.to_string(),
            field: column.name.clone(),
            kind: column.kind.name().to_string(),
            value: value.to_string(),
        };

        match op {
            CompareOp::IsNull | CompareOp::NotNull => match param {
                Param::Constant(Value::Null) => Ok(()),
                _ => Err(mismatch()),
            },
            CompareOp::Between | CompareOp::NotBetween => match param {
                Param::Range { low, high } => {
                    if low.is_null() || !low.coercible_to(&column.kind) {
                        return Err(kind_mismatch(low));
                    }
                    if high.is_null() || !high.coercible_to(&column.kind) {
                        return Err(kind_mismatch(high));
                    }
                    match low.compare(high, &column.kind) {
                        Some(ordering) if ordering != std::cmp::Ordering::Greater => Ok(()),
                        _ => Err(BuilderError::InvalidRange),
                    }
                }
                _ => Err(mismatch()),
            },
            CompareOp::In | CompareOp::NotIn => match param {
                Param::Array(values) => {
                    for value in values {
                        if value.is_null() || !value.coercible_to(&column.kind) {
                            return Err(kind_mismatch(value));
                        }
                    }
                    Ok(())
                }
                Param::SubQuery(_) => Ok(()),
                _ => Err(mismatch()),
            },
            CompareOp::Like | CompareOp::NotLike => match param {
                Param::Constant(value @ Value::Text(_)) => {
                    if matches!(column.kind, ColumnKind::Text | ColumnKind::Custom) {
                        Ok(())
                    } else {
                        Err(kind_mismatch(value))
                    }
                }
                Param::Constant(_) | Param::Range { .. } | Param::Array(_) => Err(mismatch()),
                _ => Ok(()),
            },
            CompareOp::Eq
            | CompareOp::Ne
            | CompareOp::Gt
            | CompareOp::Ge
            | CompareOp::Lt
            | CompareOp::Le => match param {
                Param::Constant(value) => {
                    if value.coercible_to(&column.kind) {
                        Ok(())
                    } else {
                        Err(kind_mismatch(value))
                    }
                }
                Param::Column {
                    entity: ref_entity,
                    field: ref_field,
                } => {
                    let (_, referenced) = registry.resolve_column(ref_entity, ref_field)?;
                    if referenced.kind.same_family(&column.kind) {
                        Ok(())
                    } else {
                        Err(BuilderError::KindMismatch {
                            entity: ref_entity.clone(),
                            field: ref_field.clone(),
                            kind: column.kind.name().to_string(),
                            value: format!("{} column", referenced.kind.name()),
                        })
                    }
                }
                Param::Function { .. } | Param::SubQuery(_) => Ok(()),
                Param::Range { .. } | Param::Array(_) => Err(mismatch()),
            },
        }
    }
}
