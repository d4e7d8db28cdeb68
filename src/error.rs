//! Error types for the buffer pool
//!
//! Errors fall into three severities:
//!
//! - **Transient**: pressure that the caller may retry (no free slot yet,
//!   read-ahead refused).
//! - **Degraded**: the operation was skipped with a warning (stale tablespace
//!   during read-ahead or async completion).
//! - **Fatal**: pool exhaustion, invariant violations, deadlocks and
//!   over-long semaphore waits. Fatal errors pass through
//!   [`FatalPolicy::escalate`], which logs a diagnostic snapshot and then
//!   aborts the process or hands the error back, depending on configuration.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::error;

use crate::page::{PageId, SpaceId};

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the buffer pool
#[derive(Error, Debug)]
pub enum Error {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// YAML configuration could not be parsed
    #[error("Failed to parse YAML configuration: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// JSON configuration could not be parsed
    #[error("Failed to parse JSON configuration: {0}")]
    Json(#[from] serde_json::Error),

    /// Metrics registry error
    #[error("Metrics registry error: {0}")]
    Metrics(#[from] prometheus::Error),

    /// Logging could not be initialized
    #[error("Failed to initialize logging: {0}")]
    Logging(String),

    // =========================================================================
    // Page Store Errors
    // =========================================================================
    /// Tablespace does not exist (dropped or never created)
    #[error("Tablespace {space} does not exist")]
    TablespaceNotFound { space: SpaceId },

    /// Page number beyond the end of its tablespace
    #[error("Page {page} is beyond the end of its tablespace ({size} pages)")]
    PageOutOfRange { page: PageId, size: u32 },

    /// Page buffer has the wrong length
    #[error("Page buffer for {page} has {actual} bytes, expected {expected}")]
    PageSizeMismatch {
        page: PageId,
        expected: usize,
        actual: usize,
    },

    // =========================================================================
    // Pool Pressure Errors
    // =========================================================================
    /// No free slot could be produced on this attempt
    #[error("No free page slot available after {attempts} attempts")]
    NoFreeSlot { attempts: u32 },

    /// Almost the whole pool is consumed by non-evictable memory
    #[error(
        "Buffer pool exhausted: free {free} + LRU {lru} slots below 1/{divisor} of capacity {capacity}"
    )]
    PoolExhausted {
        free: usize,
        lru: usize,
        capacity: usize,
        divisor: usize,
    },

    /// Requested buddy block size is not a valid size class
    #[error("Invalid buddy block size {size}: must be between {min} and {max} bytes")]
    InvalidBlockSize { size: usize, min: usize, max: usize },

    // =========================================================================
    // Synchronization Errors
    // =========================================================================
    /// Cycle in the wait-for graph
    #[error("Deadlock detected: {chain}")]
    Deadlock { chain: String },

    /// Every wait cell is occupied
    #[error("Wait array exhausted: all {cells} cells are reserved")]
    WaitArrayExhausted { cells: usize },

    /// A thread waited longer than the fatal threshold
    #[error("Semaphore wait of {waited_secs}s on {object} by thread {thread} exceeds the {limit_secs}s limit")]
    LongWait {
        object: String,
        thread: String,
        waited_secs: u64,
        limit_secs: u64,
    },

    /// A structural invariant does not hold
    #[error("Invariant violation in {component}: {detail}")]
    InvariantViolation {
        component: &'static str,
        detail: String,
    },

    // =========================================================================
    // Compression Errors
    // =========================================================================
    /// Compression failed
    #[error("Compression with {algorithm} failed: {reason}")]
    CompressionFailed { algorithm: String, reason: String },

    /// Decompression failed
    #[error("Decompression with {algorithm} failed: {reason}")]
    DecompressionFailed { algorithm: String, reason: String },
}

/// How bad an error is for the pool as a whole
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    /// Retry or skip
    Transient,
    /// Operation skipped, pool healthy
    Degraded,
    /// Pool state can no longer be trusted
    Fatal,
}

impl Error {
    /// Classify this error
    pub fn severity(&self) -> Severity {
        match self {
            Error::NoFreeSlot { .. } => Severity::Transient,
            Error::TablespaceNotFound { .. } | Error::PageOutOfRange { .. } => Severity::Degraded,
            Error::PoolExhausted { .. }
            | Error::Deadlock { .. }
            | Error::WaitArrayExhausted { .. }
            | Error::LongWait { .. }
            | Error::InvariantViolation { .. } => Severity::Fatal,
            _ => Severity::Degraded,
        }
    }

    /// Whether this error terminates the process under [`FatalPolicy::Abort`]
    pub fn is_fatal(&self) -> bool {
        self.severity() == Severity::Fatal
    }

    /// Shorthand for an invariant violation
    pub fn invariant(component: &'static str, detail: impl Into<String>) -> Self {
        Error::InvariantViolation {
            component,
            detail: detail.into(),
        }
    }
}

// =============================================================================
// Fatal Policy
// =============================================================================

/// What to do once a fatal condition has been logged
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FatalPolicy {
    /// Abort the process (production default)
    #[default]
    Abort,
    /// Return the error to the caller (tests and embedding hosts)
    Propagate,
}

impl FatalPolicy {
    /// Log `err` together with a diagnostic snapshot, then abort or return it.
    ///
    /// The snapshot closure runs only on this path, so callers can afford to
    /// build an expensive dump.
    pub fn escalate<F>(self, err: Error, snapshot: F) -> Error
    where
        F: FnOnce() -> String,
    {
        let diagnostics = snapshot();
        error!(error = %err, policy = ?self, "fatal buffer pool condition\n{}", diagnostics);
        match self {
            FatalPolicy::Abort => std::process::abort(),
            FatalPolicy::Propagate => err,
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_severity_classification() {
        assert_eq!(
            Error::NoFreeSlot { attempts: 3 }.severity(),
            Severity::Transient
        );
        assert_eq!(
            Error::TablespaceNotFound { space: SpaceId(4) }.severity(),
            Severity::Degraded
        );
        assert!(Error::Deadlock {
            chain: "t1 -> t2".into()
        }
        .is_fatal());
        assert!(Error::invariant("lru", "broken link").is_fatal());
    }

    #[test]
    fn test_propagate_policy_returns_error() {
        let mut called = false;
        let err = FatalPolicy::Propagate.escalate(Error::WaitArrayExhausted { cells: 8 }, || {
            called = true;
            "cells: 8/8".to_string()
        });
        assert!(called);
        assert!(matches!(err, Error::WaitArrayExhausted { cells: 8 }));
    }

    #[test]
    fn test_error_display() {
        let err = Error::PoolExhausted {
            free: 1,
            lru: 2,
            capacity: 100,
            divisor: 10,
        };
        let msg = err.to_string();
        assert!(msg.contains("capacity 100"));
        assert!(msg.contains("1/10"));
    }

    #[test]
    fn test_fatal_policy_serde() {
        let policy: FatalPolicy = serde_json::from_str("\"propagate\"").unwrap();
        assert_eq!(policy, FatalPolicy::Propagate);
        assert_eq!(FatalPolicy::default(), FatalPolicy::Abort);
    }
}
