//! Engine configuration
//!
//! Provides a builder pattern for configuring the engine's defaults:
//! pagination, transaction policy and read verification.

use std::time::Duration;

use crate::context::{IsolationLevel, TransactionOptions};

/// Configuration for the mapping engine.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Page size used when a spec carries no pager.
    pub default_page_size: u64,
    /// Default timeout for generated transactional contexts.
    pub transaction_timeout: Duration,
    /// Default isolation level for generated transactional contexts.
    pub isolation: IsolationLevel,
    /// Whether materialized records pass through the verify provider.
    pub verify_reads: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            default_page_size: 100,
            transaction_timeout: Duration::from_secs(30),
            isolation: IsolationLevel::default(),
            verify_reads: true,
        }
    }
}

impl EngineConfig {
    /// Create a new configuration builder.
    pub fn builder() -> EngineConfigBuilder {
        EngineConfigBuilder::new()
    }

    /// Transaction options derived from the configured defaults.
    pub fn transaction_options(&self) -> TransactionOptions {
        TransactionOptions::default()
            .timeout(self.transaction_timeout)
            .isolation(self.isolation)
    }
}

/// Builder for [`EngineConfig`].
#[derive(Debug, Default)]
pub struct EngineConfigBuilder {
    config: EngineConfig,
}

impl EngineConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: EngineConfig::default(),
        }
    }

    /// Set the page size used when a spec carries no pager (default: 100).
    pub fn default_page_size(mut self, size: u64) -> Self {
        self.config.default_page_size = size.max(1);
        self
    }

    /// Set the default transaction timeout (default: 30s).
    pub fn transaction_timeout(mut self, timeout: Duration) -> Self {
        self.config.transaction_timeout = timeout;
        self
    }

    /// Set the default isolation level (default: read committed).
    pub fn isolation(mut self, isolation: IsolationLevel) -> Self {
        self.config.isolation = isolation;
        self
    }

    /// Enable or disable verification of materialized records (default: on).
    pub fn verify_reads(mut self, enabled: bool) -> Self {
        self.config.verify_reads = enabled;
        self
    }

    /// Build the configuration.
    pub fn build(self) -> EngineConfig {
        self.config
    }
}
