//! DatabaseManager - Main entry point for the mapping engine
//!
//! The manager owns the engine's shared state (descriptor registry, storage
//! backend, open transaction contexts, providers) behind an explicit
//! `initialize`/`destroy` lifecycle, and hands out read-only and
//! transactional [`DatabaseClient`]s. It is an injectable handle, not a
//! process singleton: tests and embedders may run several independent
//! managers side by side.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::backend::StorageBackend;
use crate::client::{DatabaseClient, EngineCore, Operator, Resolver};
use crate::config::EngineConfig;
use crate::context::{ContextRegistry, TransactionOptions};
use crate::error::Result;
use crate::metadata::{DropPolicy, TableDescriptor};
use crate::provider::VerifyProvider;
use crate::record::Entity;
use crate::registry::Registry;

pub struct DatabaseManager {
    core: Arc<EngineCore>,
    initialized: AtomicBool,
}

impl DatabaseManager {
    /// Create a manager over a backend with the given configuration.
    pub fn new(backend: Arc<dyn StorageBackend>, config: EngineConfig) -> Self {
        Self::with_verify_provider(backend, config, None)
    }

    /// Create a manager with a tamper-evidence provider installed.
    pub fn with_verify_provider(
        backend: Arc<dyn StorageBackend>,
        config: EngineConfig,
        verify: Option<Arc<dyn VerifyProvider>>,
    ) -> Self {
        let core = Arc::new(EngineCore {
            registry: Arc::new(Registry::new()),
            backend,
            contexts: Arc::new(ContextRegistry::new()),
            verify,
            config,
            resolver: std::sync::OnceLock::new(),
        });
        let resolver = Arc::new(Resolver::new(Arc::downgrade(&core)));
        core.resolver.set(resolver).ok();

        Self {
            core,
            initialized: AtomicBool::new(false),
        }
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Bring the engine up. Idempotent; returns whether this call performed
    /// the transition.
    pub fn initialize(&self) -> bool {
        let transitioned = self
            .initialized
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok();
        if transitioned {
            tracing::info!("database manager initialized");
        }
        transitioned
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::SeqCst)
    }

    /// Tear the engine down: roll back every open transaction and clear the
    /// registry. Records already materialized keep their descriptors but
    /// lose lazy resolution once the manager is dropped.
    pub fn destroy(&self) {
        for code in self.core.contexts.open_codes() {
            if let Err(error) = self.core.backend.rollback(code) {
                tracing::warn!(%code, %error, "rollback during destroy failed");
            }
            self.core.contexts.close(code);
        }
        let entities = self.core.registry.entities();
        let names: Vec<&str> = entities.iter().map(String::as_str).collect();
        self.core.registry.remove(&names);
        self.initialized.store(false, Ordering::SeqCst);
        tracing::info!("database manager destroyed");
    }

    // =========================================================================
    // Table management
    // =========================================================================

    /// Register descriptors in order; returns how many were installed.
    /// Stops at the first configuration error, leaving earlier
    /// registrations in place.
    pub fn register_tables(
        &self,
        descriptors: impl IntoIterator<Item = TableDescriptor>,
    ) -> Result<usize> {
        let mut registered = 0;
        for descriptor in descriptors {
            self.core.registry.register(descriptor)?;
            registered += 1;
        }
        Ok(registered)
    }

    /// Register a typed entity's declarative descriptor.
    pub fn register_entity<T: Entity>(&self) -> Result<usize> {
        self.register_tables([T::descriptor()])
    }

    /// Remove registrations; returns how many were removed.
    pub fn remove_tables(&self, entities: &[&str]) -> usize {
        self.core.registry.remove(entities)
    }

    /// Drop the backing tables of the named entities. Entities whose
    /// descriptor sets [`DropPolicy::Deny`] are skipped (and logged), as are
    /// unknown names; returns how many tables were dropped. Registrations
    /// stay in place so tables can be repopulated.
    pub fn drop_tables(&self, entities: &[&str]) -> Result<usize> {
        let mut dropped = 0;
        for entity in entities {
            let Some(table) = self.core.registry.descriptor(entity) else {
                continue;
            };
            if table.drop_policy == DropPolicy::Deny {
                tracing::warn!(entity, "drop refused by descriptor policy");
                continue;
            }
            self.core.backend.drop_table(&table)?;
            dropped += 1;
        }
        Ok(dropped)
    }

    /// Shared descriptor registry, for building queries and conditions.
    pub fn registry(&self) -> &Registry {
        &self.core.registry
    }

    // =========================================================================
    // Clients
    // =========================================================================

    /// A client restricted to retrieve/query operations.
    pub fn read_only_client(&self) -> DatabaseClient {
        self.core.client(Operator::ReadOnly)
    }

    /// A client bound to a fresh transactional context using the configured
    /// defaults.
    pub fn generate_client(&self) -> DatabaseClient {
        self.generate_client_with(self.core.config.transaction_options())
    }

    /// A client bound to a fresh transactional context with explicit
    /// options.
    pub fn generate_client_with(&self, options: TransactionOptions) -> DatabaseClient {
        let context = self.core.contexts.open(options);
        self.core.client(Operator::Transactional(context))
    }
}
