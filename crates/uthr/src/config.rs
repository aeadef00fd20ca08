//! Runtime configuration.

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Sizing and policy knobs for a [`Runtime`](crate::Runtime).
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct RuntimeConfig {
    /// Prefix for kernel semaphore and thread names.
    pub name: String,
    /// Number of kernel semaphores created each time the pool runs dry.
    pub sem_batch: usize,
    /// Capacity of the thread-specific data key table.
    pub max_keys: usize,
    /// Upper bound on TSD destructor passes at thread exit.
    pub destructor_passes: usize,
    pub default_stack_size: usize,
    pub min_stack_size: usize,
    pub guard_size: usize,
    /// Live threads created by the runtime before spawn fails.
    pub max_threads: usize,
    /// Lets a Normal mutex be released by a thread that does not own it.
    pub legacy_normal_unlock: bool,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            name: String::from("uthr"),
            sem_batch: 16,
            max_keys: 128,
            destructor_passes: 4,
            default_stack_size: 256 * 1024,
            min_stack_size: 16 * 1024,
            guard_size: 4096,
            max_threads: 1024,
            legacy_normal_unlock: false,
        }
    }
}

impl RuntimeConfig {
    pub fn builder() -> RuntimeConfigBuilder {
        RuntimeConfigBuilder::default()
    }

    pub fn validate(&self) -> Result<()> {
        if self.sem_batch == 0 {
            return Err(Error::InvalidArgument("sem_batch must be non-zero"));
        }
        if self.max_keys == 0 {
            return Err(Error::InvalidArgument("max_keys must be non-zero"));
        }
        if self.destructor_passes == 0 {
            return Err(Error::InvalidArgument("destructor_passes must be non-zero"));
        }
        if self.min_stack_size == 0 {
            return Err(Error::InvalidArgument("min_stack_size must be non-zero"));
        }
        if self.default_stack_size < self.min_stack_size {
            return Err(Error::InvalidArgument(
                "default_stack_size below min_stack_size",
            ));
        }
        if self.max_threads == 0 {
            return Err(Error::InvalidArgument("max_threads must be non-zero"));
        }
        Ok(())
    }
}

/// Builder for [`RuntimeConfig`].
#[derive(Debug, Clone, Default)]
pub struct RuntimeConfigBuilder {
    config: RuntimeConfig,
}

impl RuntimeConfigBuilder {
    /// Sets the name prefix for kernel objects.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.config.name = name.into();
        self
    }

    /// Sets the semaphore pool growth batch.
    pub fn sem_batch(mut self, batch: usize) -> Self {
        self.config.sem_batch = batch;
        self
    }

    /// Sets the TSD key table capacity.
    pub fn max_keys(mut self, max: usize) -> Self {
        self.config.max_keys = max;
        self
    }

    pub fn destructor_passes(mut self, passes: usize) -> Self {
        self.config.destructor_passes = passes;
        self
    }

    /// Sets the stack size used when a thread attribute gives none.
    pub fn default_stack_size(mut self, bytes: usize) -> Self {
        self.config.default_stack_size = bytes;
        self
    }

    pub fn min_stack_size(mut self, bytes: usize) -> Self {
        self.config.min_stack_size = bytes;
        self
    }

    pub fn guard_size(mut self, bytes: usize) -> Self {
        self.config.guard_size = bytes;
        self
    }

    pub fn max_threads(mut self, max: usize) -> Self {
        self.config.max_threads = max;
        self
    }

    pub fn legacy_normal_unlock(mut self, enabled: bool) -> Self {
        self.config.legacy_normal_unlock = enabled;
        self
    }

    pub fn build(self) -> RuntimeConfig {
        self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = RuntimeConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.sem_batch, 16);
        assert_eq!(config.destructor_passes, 4);
        assert!(!config.legacy_normal_unlock);
    }

    #[test]
    fn builder_overrides() {
        let config = RuntimeConfig::builder()
            .name("svc")
            .sem_batch(4)
            .max_keys(8)
            .destructor_passes(2)
            .default_stack_size(64 * 1024)
            .min_stack_size(32 * 1024)
            .guard_size(8192)
            .max_threads(3)
            .legacy_normal_unlock(true)
            .build();

        assert_eq!(config.name, "svc");
        assert_eq!(config.sem_batch, 4);
        assert_eq!(config.max_keys, 8);
        assert_eq!(config.destructor_passes, 2);
        assert_eq!(config.default_stack_size, 64 * 1024);
        assert_eq!(config.min_stack_size, 32 * 1024);
        assert_eq!(config.guard_size, 8192);
        assert_eq!(config.max_threads, 3);
        assert!(config.legacy_normal_unlock);
    }

    #[test]
    fn rejects_inconsistent_sizes() {
        let zero_batch = RuntimeConfig::builder().sem_batch(0).build();
        assert!(matches!(
            zero_batch.validate(),
            Err(Error::InvalidArgument(_))
        ));

        let tiny_default = RuntimeConfig::builder()
            .min_stack_size(64 * 1024)
            .default_stack_size(32 * 1024)
            .build();
        assert!(tiny_default.validate().is_err());
    }
}
