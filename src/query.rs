//! Query spec and fluent builder
//!
//! A [`QuerySpec`] is the complete, immutable, serializable description of a
//! query: driving entity, joins, projections, condition tree, grouping,
//! ordering, pager, lock option and cache flag. Specs are produced by the
//! single-use [`QueryBuilder`], which validates every call against the
//! registry as it is made rather than deferring problems to `confirm()`.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::condition::{Condition, Connector, Param};
use crate::error::BuilderError;
use crate::registry::Registry;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JoinKind {
    Inner,
    Left,
    Right,
    Full,
    Cross,
}

/// One entry of the ordered join list. `on` pairs are (left field, right
/// field); cross joins carry no pairs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Join {
    pub kind: JoinKind,
    pub left: String,
    pub right: String,
    pub on: Vec<(String, String)>,
}

/// A projected output column or function.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Projection {
    Column {
        entity: String,
        field: String,
        #[serde(default)]
        distinct: bool,
    },
    Function {
        name: String,
        args: Vec<Param>,
        alias: String,
        #[serde(default)]
        distinct: bool,
    },
}

/// Group-by entry; `code` is the explicit sort code used to order entries
/// in the output (lower first, ties by insertion order).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupEntry {
    pub entity: String,
    pub field: String,
    pub code: i32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortDirection {
    Asc,
    Desc,
}

/// Order-by entry, sort-coded like [`GroupEntry`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderEntry {
    pub entity: String,
    pub field: String,
    pub code: i32,
    pub direction: SortDirection,
}

/// 1-based page window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pager {
    pub page: u64,
    pub size: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub enum LockOption {
    #[default]
    None,
    PessimisticRead,
    PessimisticUpgrade,
}

/// Complete, validated description of a query.
///
/// `cacheable` is advisory: execution skips caching for `for_update` specs
/// regardless of the flag, since a locked read must not be served stale.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuerySpec {
    pub entity: String,
    pub joins: Vec<Join>,
    pub projections: Vec<Projection>,
    pub condition: Option<Condition>,
    pub group_by: Vec<GroupEntry>,
    pub order_by: Vec<OrderEntry>,
    pub pager: Option<Pager>,
    pub lock: LockOption,
    pub cacheable: bool,
    pub for_update: bool,
}

impl QuerySpec {
    /// Entities in scope: the driving entity plus every joined entity.
    pub fn scope(&self) -> BTreeSet<&str> {
        let mut scope = BTreeSet::new();
        scope.insert(self.entity.as_str());
        for join in &self.joins {
            scope.insert(join.left.as_str());
            scope.insert(join.right.as_str());
        }
        scope
    }

    /// The shape used for `query_total`: same predicate, no pager, no
    /// ordering, no locking.
    pub(crate) fn count_shape(&self) -> Self {
        let mut shape = self.clone();
        shape.pager = None;
        shape.order_by.clear();
        shape.lock = LockOption::None;
        shape.for_update = false;
        shape.cacheable = false;
        shape
    }
}

/// Stateful, single-use builder for [`QuerySpec`].
///
/// Every method consumes the builder and returns it on success, so
/// construction chains with `?`; the first invalid call aborts the chain.
#[derive(Debug)]
pub struct QueryBuilder<'r> {
    registry: &'r Registry,
    spec: QuerySpec,
}

impl<'r> QueryBuilder<'r> {
    /// Start a query driven by `entity`.
    pub fn new(registry: &'r Registry, entity: &str) -> Result<Self, BuilderError> {
        if !registry.contains(entity) {
            return Err(BuilderError::UnknownEntity(entity.to_string()));
        }
        Ok(Self {
            registry,
            spec: QuerySpec {
                entity: entity.to_string(),
                joins: Vec::new(),
                projections: Vec::new(),
                condition: None,
                group_by: Vec::new(),
                order_by: Vec::new(),
                pager: None,
                lock: LockOption::None,
                cacheable: false,
                for_update: false,
            },
        })
    }

    fn in_scope(&self, entity: &str) -> bool {
        self.spec.scope().contains(entity)
    }

    fn check_scope(&self, entity: &str) -> Result<(), BuilderError> {
        if self.in_scope(entity) {
            Ok(())
        } else if self.registry.contains(entity) {
            Err(BuilderError::UnjoinedEntity(entity.to_string()))
        } else {
            Err(BuilderError::UnknownEntity(entity.to_string()))
        }
    }

    fn check_field(&self, entity: &str, field: &str) -> Result<(), BuilderError> {
        self.check_scope(entity)?;
        self.registry.resolve_column(entity, field)?;
        Ok(())
    }

    // =========================================================================
    // Joins
    // =========================================================================

    /// Join `right` to `left` on the given (left field, right field) pairs.
    ///
    /// `left` must be the driving entity or already joined; both sides of
    /// every pair must resolve and share a kind family.
    pub fn join(
        mut self,
        kind: JoinKind,
        left: &str,
        right: &str,
        on: &[(&str, &str)],
    ) -> Result<Self, BuilderError> {
        if !self.in_scope(left) {
            return Err(BuilderError::DisconnectedJoin(left.to_string()));
        }
        if !self.registry.contains(right) {
            return Err(BuilderError::UnknownEntity(right.to_string()));
        }

        let mut pairs = Vec::with_capacity(on.len());
        for (left_field, right_field) in on {
            let (_, left_col) = self.registry.resolve_column(left, left_field)?;
            let (_, right_col) = self.registry.resolve_column(right, right_field)?;
            if !left_col.kind.same_family(&right_col.kind) {
                return Err(BuilderError::KindMismatch {
                    entity: right.to_string(),
                    field: (*right_field).to_string(),
                    kind: left_col.kind.name().to_string(),
                    value: format!("{} column", right_col.kind.name()),
                });
            }
            pairs.push(((*left_field).to_string(), (*right_field).to_string()));
        }

        self.spec.joins.push(Join {
            kind,
            left: left.to_string(),
            right: right.to_string(),
            on: pairs,
        });
        Ok(self)
    }

    /// Join along a declared reference of an in-scope entity.
    pub fn join_reference(
        self,
        kind: JoinKind,
        entity: &str,
        reference: &str,
    ) -> Result<Self, BuilderError> {
        self.check_scope(entity)?;
        let table = self
            .registry
            .descriptor(entity)
            .ok_or_else(|| BuilderError::UnknownEntity(entity.to_string()))?;
        let reference = table
            .find_reference(reference)
            .ok_or_else(|| BuilderError::UnknownField {
                entity: entity.to_string(),
                field: reference.to_string(),
            })?
            .clone();

        let on: Vec<(&str, &str)> = reference
            .pairs
            .iter()
            .map(|(local, remote)| (local.as_str(), remote.as_str()))
            .collect();
        self.join(kind, entity, &reference.target, &on)
    }

    // =========================================================================
    // Projections
    // =========================================================================

    pub fn select(mut self, entity: &str, field: &str) -> Result<Self, BuilderError> {
        self.check_field(entity, field)?;
        self.spec.projections.push(Projection::Column {
            entity: entity.to_string(),
            field: field.to_string(),
            distinct: false,
        });
        Ok(self)
    }

    pub fn select_distinct(mut self, entity: &str, field: &str) -> Result<Self, BuilderError> {
        self.check_field(entity, field)?;
        self.spec.projections.push(Projection::Column {
            entity: entity.to_string(),
            field: field.to_string(),
            distinct: true,
        });
        Ok(self)
    }

    /// Project a function over parameters, exposed under `alias`.
    pub fn select_function(
        mut self,
        name: &str,
        args: Vec<Param>,
        alias: &str,
    ) -> Result<Self, BuilderError> {
        let mut entities = BTreeSet::new();
        for arg in &args {
            arg.collect_entities(&mut entities);
        }
        for entity in &entities {
            self.check_scope(entity)?;
        }
        self.spec.projections.push(Projection::Function {
            name: name.to_string(),
            args,
            alias: alias.to_string(),
            distinct: false,
        });
        Ok(self)
    }

    // =========================================================================
    // Predicate, grouping, ordering
    // =========================================================================

    /// Add a condition; multiple calls AND together in insertion order.
    pub fn filter(mut self, condition: Condition) -> Result<Self, BuilderError> {
        let mut entities = BTreeSet::new();
        condition.collect_entities(&mut entities);
        for entity in &entities {
            self.check_scope(entity)?;
        }

        self.spec.condition = Some(match self.spec.condition.take() {
            None => condition,
            Some(existing) => Condition::Group {
                connector: Connector::And,
                children: vec![existing, condition],
            },
        });
        Ok(self)
    }

    pub fn group_by(mut self, entity: &str, field: &str, code: i32) -> Result<Self, BuilderError> {
        self.check_field(entity, field)?;
        self.spec.group_by.push(GroupEntry {
            entity: entity.to_string(),
            field: field.to_string(),
            code,
        });
        Ok(self)
    }

    pub fn order_by(
        mut self,
        entity: &str,
        field: &str,
        code: i32,
        direction: SortDirection,
    ) -> Result<Self, BuilderError> {
        self.check_field(entity, field)?;
        self.spec.order_by.push(OrderEntry {
            entity: entity.to_string(),
            field: field.to_string(),
            code,
            direction,
        });
        Ok(self)
    }

    // =========================================================================
    // Paging, locking, caching
    // =========================================================================

    pub fn page(mut self, page: u64, size: u64) -> Result<Self, BuilderError> {
        if page < 1 || size < 1 {
            return Err(BuilderError::InvalidPager { page, size });
        }
        self.spec.pager = Some(Pager { page, size });
        Ok(self)
    }

    /// Mark the spec for update; required before any lock option.
    pub fn for_update(mut self) -> Self {
        self.spec.for_update = true;
        self
    }

    pub fn lock(mut self, option: LockOption) -> Result<Self, BuilderError> {
        if option != LockOption::None && !self.spec.for_update {
            return Err(BuilderError::LockWithoutForUpdate);
        }
        self.spec.lock = option;
        Ok(self)
    }

    pub fn cacheable(mut self, cacheable: bool) -> Self {
        self.spec.cacheable = cacheable;
        self
    }

    // =========================================================================
    // Confirmation
    // =========================================================================

    /// Freeze the accumulated state into an immutable spec.
    ///
    /// Group and order entries are sorted by their sort code here; the
    /// stable sort keeps insertion order for equal codes.
    pub fn confirm(mut self) -> Result<QuerySpec, BuilderError> {
        self.spec.group_by.sort_by_key(|entry| entry.code);
        self.spec.order_by.sort_by_key(|entry| entry.code);
        Ok(self.spec)
    }
}
