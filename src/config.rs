//! Configuration for [`RepositoryMutex`](crate::RepositoryMutex).
//!
//! This module provides:
//! - The [`MutexConfig`] type with defaults and builder-style setters
//! - Validation of guardrail invariants
//! - Layered loading (defaults, then environment overrides)
//!
//! Environment variables:
//!
//! | Variable | Field |
//! |----------|-------|
//! | `REPO_MUTEX_VIOLATION_POLICY` | [`MutexConfig::violation_policy`] (`panic` or `warn`) |
//! | `REPO_MUTEX_QUEUE_CAPACITY` | [`MutexConfig::queue_capacity`] |

use core::fmt;
use std::str::FromStr;

/// Environment variable selecting the [`ViolationPolicy`].
pub const ENV_VIOLATION_POLICY: &str = "REPO_MUTEX_VIOLATION_POLICY";
/// Environment variable for the initial wait-queue capacity.
pub const ENV_QUEUE_CAPACITY: &str = "REPO_MUTEX_QUEUE_CAPACITY";

/// Upper bound accepted for [`MutexConfig::queue_capacity`].
pub const MAX_QUEUE_CAPACITY: usize = 4096;

/// What to do when a release does not match the holder bookkeeping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ViolationPolicy {
    /// Panic, unless the thread is already unwinding.
    #[default]
    Panic,
    /// Leave the state untouched and log a warning.
    Warn,
}

impl ViolationPolicy {
    /// Returns the name used in configuration.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Panic => "panic",
            Self::Warn => "warn",
        }
    }
}

impl fmt::Display for ViolationPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for ViolationPolicy {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "panic" | "assert" => Ok(Self::Panic),
            "warn" | "warning" => Ok(Self::Warn),
            _ => Err(ConfigError::InvalidViolationPolicy(s.to_owned())),
        }
    }
}

/// Tuning for a [`RepositoryMutex`](crate::RepositoryMutex).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MutexConfig {
    /// Handling of releases that do not match the holder state.
    pub violation_policy: ViolationPolicy,
    /// Capacity reserved for a key's wait queue when its first request queues.
    pub queue_capacity: usize,
}

impl Default for MutexConfig {
    fn default() -> Self {
        Self {
            violation_policy: ViolationPolicy::Panic,
            queue_capacity: 4,
        }
    }
}

impl MutexConfig {
    /// Sets the violation policy.
    #[must_use]
    pub const fn violation_policy(mut self, policy: ViolationPolicy) -> Self {
        self.violation_policy = policy;
        self
    }

    /// Sets the initial wait-queue capacity.
    #[must_use]
    pub const fn queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity;
        self
    }

    /// Validates the configuration.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::QueueCapacityTooLarge`] if the queue capacity
    /// exceeds [`MAX_QUEUE_CAPACITY`].
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.queue_capacity > MAX_QUEUE_CAPACITY {
            return Err(ConfigError::QueueCapacityTooLarge(self.queue_capacity));
        }
        Ok(())
    }

    /// Loads defaults overlaid with the process environment.
    ///
    /// # Errors
    ///
    /// Returns an error if a variable is set but cannot be parsed, or the
    /// resulting configuration fails [`validate`](Self::validate).
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::default().with_overrides(|name| std::env::var(name).ok())
    }

    /// Applies overrides from `lookup`, then validates.
    ///
    /// `lookup` maps a variable name to its value; unset variables leave the
    /// current field untouched.
    ///
    /// # Errors
    ///
    /// Same as [`from_env`](Self::from_env).
    pub fn with_overrides<F>(mut self, lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(raw) = lookup(ENV_VIOLATION_POLICY) {
            self.violation_policy = raw.parse()?;
        }
        if let Some(raw) = lookup(ENV_QUEUE_CAPACITY) {
            self.queue_capacity = raw
                .trim()
                .parse()
                .map_err(|_| ConfigError::InvalidQueueCapacity(raw.clone()))?;
        }
        self.validate()?;
        Ok(self)
    }
}

/// Configuration validation or parsing failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// Unknown violation policy name.
    InvalidViolationPolicy(String),
    /// Queue capacity is not a non-negative integer.
    InvalidQueueCapacity(String),
    /// Queue capacity exceeds [`MAX_QUEUE_CAPACITY`].
    QueueCapacityTooLarge(usize),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidViolationPolicy(raw) => {
                write!(f, "unknown violation policy {raw:?} (expected panic or warn)")
            }
            Self::InvalidQueueCapacity(raw) => write!(f, "invalid queue capacity {raw:?}"),
            Self::QueueCapacityTooLarge(n) => {
                write!(f, "queue capacity {n} exceeds maximum {MAX_QUEUE_CAPACITY}")
            }
        }
    }
}

impl std::error::Error for ConfigError {}
