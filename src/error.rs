//! Error types for the mapping engine
//!
//! Errors are split along the lifecycle of a query: configuration errors at
//! registration time, builder errors during query construction, execution
//! errors at the client boundary, and lifecycle errors for concurrent
//! modification conflicts. `OrmError` aggregates all of them.

use thiserror::Error;
use uuid::Uuid;

/// Errors raised while registering an entity descriptor.
///
/// A configuration error is fatal to the affected entity: the descriptor is
/// not installed and the entity stays unusable until corrected.
#[derive(Debug, Error)]
pub enum TableConfigError {
    #[error("entity '{0}' declares no primary key column")]
    MissingPrimaryKey(String),

    #[error("entity '{entity}' declares duplicate column '{column}'")]
    DuplicateColumn { entity: String, column: String },

    #[error("invalid identifier: {0}")]
    InvalidIdentifier(String),

    #[error("reference '{reference}' on entity '{entity}': {detail}")]
    BadReference {
        entity: String,
        reference: String,
        detail: String,
    },

    #[error("index '{index}' on entity '{entity}' names unknown field '{field}'")]
    BadIndex {
        entity: String,
        index: String,
        field: String,
    },

    #[error("sequence '{sequence}': {detail}")]
    BadSequence { sequence: String, detail: String },

    #[error("sequence '{0}' is exhausted")]
    SequenceExhausted(String),

    #[error("entity '{0}' is not registered")]
    UnknownEntity(String),
}

/// Errors raised synchronously while building a condition or query spec.
///
/// Builder errors are never coerced or deferred; the offending call fails
/// immediately.
#[derive(Debug, Error)]
pub enum BuilderError {
    #[error("unknown entity '{0}'")]
    UnknownEntity(String),

    #[error("unknown field '{entity}.{field}'")]
    UnknownField { entity: String, field: String },

    #[error("entity '{0}' is neither the driving entity nor joined")]
    UnjoinedEntity(String),

    #[error("join endpoint '{0}' must be the driving entity or an already-joined entity")]
    DisconnectedJoin(String),

    #[error("range bounds are inverted: low must not exceed high")]
    InvalidRange,

    #[error("group condition requires at least one child")]
    EmptyGroup,

    #[error("pager requires page >= 1 and size >= 1 (got page {page}, size {size})")]
    InvalidPager { page: u64, size: u64 },

    #[error("a lock option other than None requires the spec to be marked for update")]
    LockWithoutForUpdate,

    #[error("operator {operator} cannot be used with parameter {parameter}")]
    OperatorParamMismatch {
        operator: &'static str,
        parameter: &'static str,
    },

    #[error("value {value} cannot be compared against {kind} column '{entity}.{field}'")]
    KindMismatch {
        entity: String,
        field: String,
        kind: String,
        value: String,
    },
}

/// Errors raised while executing operations against storage.
///
/// Execution errors are recoverable by the caller; the engine performs no
/// internal retries.
#[derive(Debug, Error)]
pub enum ExecError {
    #[error("insert failed: {0}")]
    Insert(String),

    #[error("update failed: {0}")]
    Update(String),

    #[error("delete failed: {0}")]
    Delete(String),

    #[error("retrieve failed: {0}")]
    Retrieve(String),

    #[error("query failed: {0}")]
    Query(String),

    #[error("transaction {0} timed out")]
    Timeout(Uuid),

    #[error("no transaction context registered for code {0}")]
    StaleContext(Uuid),
}

impl ExecError {
    pub fn insert(msg: impl Into<String>) -> Self {
        Self::Insert(msg.into())
    }

    pub fn update(msg: impl Into<String>) -> Self {
        Self::Update(msg.into())
    }

    pub fn delete(msg: impl Into<String>) -> Self {
        Self::Delete(msg.into())
    }

    pub fn retrieve(msg: impl Into<String>) -> Self {
        Self::Retrieve(msg.into())
    }

    pub fn query(msg: impl Into<String>) -> Self {
        Self::Query(msg.into())
    }
}

/// Errors indicating a record-level conflict.
///
/// A data-modified error signals a concurrent modification (or tamper
/// evidence mismatch) and must abort the enclosing transaction.
#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error("record of entity '{entity}' failed verification: data modified")]
    DataModified { entity: String },

    #[error("record state does not permit {operation}: {detail}")]
    IllegalState {
        operation: &'static str,
        detail: String,
    },
}

/// Top-level error for the engine.
#[derive(Debug, Error)]
pub enum OrmError {
    #[error(transparent)]
    Config(#[from] TableConfigError),

    #[error(transparent)]
    Builder(#[from] BuilderError),

    #[error(transparent)]
    Exec(#[from] ExecError),

    #[error(transparent)]
    Lifecycle(#[from] LifecycleError),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, OrmError>;
