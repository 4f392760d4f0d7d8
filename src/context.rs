//! Transactional contexts
//!
//! A [`TransactionContext`] binds a set of operations (and the lazy
//! resolutions they spawn) to one transactional code: a time-ordered unique
//! id issued when a transactional client is generated. Contexts live in the
//! process-wide [`ContextRegistry`] so lazy-load paths can re-enter the same
//! transaction by code, and are removed on commit or rollback.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{ExecError, LifecycleError, OrmError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub enum IsolationLevel {
    #[default]
    ReadCommitted,
    RepeatableRead,
    Serializable,
}

/// Error kinds that force the enclosing transaction to roll back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RollbackTrigger {
    Insert,
    Update,
    Delete,
    Retrieve,
    Query,
    /// Data-modified / verification conflicts.
    Lifecycle,
}

impl RollbackTrigger {
    /// The trigger matching an error, if any.
    pub fn of(error: &OrmError) -> Option<Self> {
        match error {
            OrmError::Exec(ExecError::Insert(_)) => Some(Self::Insert),
            OrmError::Exec(ExecError::Update(_)) => Some(Self::Update),
            OrmError::Exec(ExecError::Delete(_)) => Some(Self::Delete),
            OrmError::Exec(ExecError::Retrieve(_)) => Some(Self::Retrieve),
            OrmError::Exec(ExecError::Query(_) | ExecError::Timeout(_)) => Some(Self::Query),
            OrmError::Lifecycle(LifecycleError::DataModified { .. }) => Some(Self::Lifecycle),
            _ => None,
        }
    }
}

/// Options a transactional context is opened with.
#[derive(Debug, Clone)]
pub struct TransactionOptions {
    pub timeout: Duration,
    pub isolation: IsolationLevel,
    pub rollback_triggers: BTreeSet<RollbackTrigger>,
}

impl Default for TransactionOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            isolation: IsolationLevel::default(),
            // Lifecycle conflicts always abort; write failures do by default.
            rollback_triggers: [
                RollbackTrigger::Insert,
                RollbackTrigger::Update,
                RollbackTrigger::Delete,
                RollbackTrigger::Lifecycle,
            ]
            .into(),
        }
    }
}

impl TransactionOptions {
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn isolation(mut self, isolation: IsolationLevel) -> Self {
        self.isolation = isolation;
        self
    }

    pub fn rollback_on(mut self, trigger: RollbackTrigger) -> Self {
        self.rollback_triggers.insert(trigger);
        self
    }
}

/// One logical transaction's identity and policy.
///
/// Owned by exactly one logical transaction; the registry hands out `Arc`s
/// for lazy-load paths but all mutation happens through the owning client.
#[derive(Debug)]
pub struct TransactionContext {
    code: Uuid,
    started: Instant,
    timeout: Duration,
    isolation: IsolationLevel,
    rollback_triggers: BTreeSet<RollbackTrigger>,
}

impl TransactionContext {
    fn open(options: TransactionOptions) -> Self {
        Self {
            // v7 codes are time-ordered, so codes sort by transaction start.
            code: Uuid::now_v7(),
            started: Instant::now(),
            timeout: options.timeout,
            isolation: options.isolation,
            rollback_triggers: options.rollback_triggers,
        }
    }

    pub const fn code(&self) -> Uuid {
        self.code
    }

    pub const fn isolation(&self) -> IsolationLevel {
        self.isolation
    }

    pub fn expired(&self) -> bool {
        self.started.elapsed() > self.timeout
    }

    /// Whether this error kind forces the transaction to roll back.
    pub fn should_roll_back(&self, error: &OrmError) -> bool {
        RollbackTrigger::of(error)
            .is_some_and(|trigger| self.rollback_triggers.contains(&trigger))
    }
}

/// Process-wide map of open transactions, keyed by code.
#[derive(Debug, Default)]
pub struct ContextRegistry {
    inner: Mutex<HashMap<Uuid, Arc<TransactionContext>>>,
}

impl ContextRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn open(&self, options: TransactionOptions) -> Arc<TransactionContext> {
        let context = Arc::new(TransactionContext::open(options));
        self.inner
            .lock()
            .expect("context lock poisoned")
            .insert(context.code(), context.clone());
        context
    }

    pub fn lookup(&self, code: Uuid) -> Option<Arc<TransactionContext>> {
        self.inner
            .lock()
            .expect("context lock poisoned")
            .get(&code)
            .cloned()
    }

    /// Remove a context on commit/rollback. Returns whether it was open.
    pub fn close(&self, code: Uuid) -> bool {
        self.inner
            .lock()
            .expect("context lock poisoned")
            .remove(&code)
            .is_some()
    }

    /// Codes of all open contexts, for shutdown sweeps.
    pub fn open_codes(&self) -> Vec<Uuid> {
        self.inner
            .lock()
            .expect("context lock poisoned")
            .keys()
            .copied()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes_are_time_ordered() {
        let registry = ContextRegistry::new();
        let first = registry.open(TransactionOptions::default());
        // v7 ordering is millisecond-granular.
        std::thread::sleep(Duration::from_millis(2));
        let second = registry.open(TransactionOptions::default());
        assert!(first.code() < second.code());
    }

    #[test]
    fn test_lookup_and_close() {
        let registry = ContextRegistry::new();
        let context = registry.open(TransactionOptions::default());
        let code = context.code();

        assert!(registry.lookup(code).is_some());
        assert!(registry.close(code));
        assert!(registry.lookup(code).is_none());
        assert!(!registry.close(code));
    }

    #[test]
    fn test_timeout_expiry() {
        let registry = ContextRegistry::new();
        let context = registry.open(TransactionOptions::default().timeout(Duration::ZERO));
        std::thread::sleep(Duration::from_millis(5));
        assert!(context.expired());
    }

    #[test]
    fn test_rollback_triggers() {
        let registry = ContextRegistry::new();
        let context = registry.open(TransactionOptions::default());

        let insert_failure: OrmError = ExecError::insert("boom").into();
        assert!(context.should_roll_back(&insert_failure));

        // Query failures are recoverable by default.
        let query_failure: OrmError = ExecError::query("boom").into();
        assert!(!context.should_roll_back(&query_failure));

        let strict = registry.open(
            TransactionOptions::default().rollback_on(RollbackTrigger::Query),
        );
        assert!(strict.should_roll_back(&query_failure));
    }
}
