//! External provider interfaces
//!
//! Collaborators the engine drives but does not implement: a durable-write
//! staging backend keyed by process code, and a per-record tamper-evidence
//! provider consulted after materialization.

use crate::error::Result;
use crate::record::Record;

/// Two-phase staging protocol for bulk durable writes.
///
/// Items are staged under a caller-supplied process code and become durable
/// only on `submit_process`; `rollback_process` discards the stage. The
/// engine treats the implementation as an opaque backend.
pub trait DataProvider: Send + Sync {
    fn register_items(&self, process_code: &str, items: &[Record]) -> Result<()>;

    fn update_items(&self, process_code: &str, items: &[Record]) -> Result<()>;

    fn remove_items(&self, process_code: &str, items: &[Record]) -> Result<()>;

    fn submit_process(&self, process_code: &str) -> Result<()>;

    fn rollback_process(&self, process_code: &str) -> Result<()>;
}

/// Per-record tamper evidence.
///
/// `sign` is invoked when a record is persisted, `verify` after each
/// materialization. A failed verification surfaces as
/// [`crate::error::LifecycleError::DataModified`], not as a query error, and
/// aborts the enclosing transaction.
pub trait VerifyProvider: Send + Sync {
    fn sign(&self, record: &Record) -> Result<()>;

    fn verify(&self, record: &Record) -> Result<bool>;
}
