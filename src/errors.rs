//! Error types for transaction coordination

use std::path::PathBuf;

/// Error raised by a [`Resource`](crate::Resource) callback.
///
/// Resources report failures as plain reasons; the owning transaction wraps
/// them with the resource name and the phase before anything escapes to the
/// caller.
#[derive(Clone, Debug, thiserror::Error)]
#[error("{0}")]
pub struct ResourceError(
    /// Failure reason
    pub Box<str>,
);

impl From<&str> for ResourceError {
    fn from(reason: &str) -> Self {
        Self(reason.into())
    }
}

impl From<String> for ResourceError {
    fn from(reason: String) -> Self {
        Self(reason.into_boxed_str())
    }
}

/// One failed participant in an aggregate rollback.
#[derive(Clone, Debug)]
pub struct ResourceFailure {
    /// Name of the resource whose rollback failed
    pub resource: Box<str>,
    /// Failure reason as reported by the resource
    pub reason: Box<str>,
}

impl std::fmt::Display for ResourceFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.resource, self.reason)
    }
}

/// Error taxonomy for the coordinator.
#[derive(Debug, thiserror::Error)]
pub enum TransactionError {
    /// No ambient transaction existed and a new native handle could not be allocated
    #[error("failed to begin transaction: {reason}")]
    BeginFailed {
        /// Why allocation failed
        reason: Box<str>,
    },

    /// Operation attempted in a state that forbids it
    #[error("invalid operation '{operation}': {reason}")]
    InvalidState {
        /// The operation that was attempted
        operation: &'static str,
        /// Why the current state forbids it
        reason: Box<str>,
    },

    /// Complete was called after rollback-only had been set
    #[error("cannot commit after rollback-only has been set")]
    RollbackOnly,

    /// NotSupported propagation requested while an ambient transaction is active
    #[error("propagation mode NotSupported forbids an active ambient transaction")]
    ModeUnsupported,

    /// An operation that needs a topmost transaction found none
    #[error("no active transaction in the current activity")]
    NoAmbientTransaction,

    /// A resource's Start callback failed during enlistment
    #[error("resource '{resource}' failed to start: {source}")]
    StartResourceFailed {
        /// Resource that refused enlistment
        resource: Box<str>,
        /// Underlying reason
        #[source]
        source: ResourceError,
    },

    /// Fail-fast commit failure naming the first resource whose Commit raised.
    ///
    /// Resources enlisted before the named one are committed; the named one
    /// and everything after it are not.
    #[error("commit failed at resource '{resource}': {source}")]
    CommitResourceFailed {
        /// First resource whose Commit failed
        resource: Box<str>,
        /// Underlying reason
        #[source]
        source: ResourceError,
    },

    /// Aggregate rollback failure; the transaction still reached `Aborted`
    #[error("rollback failed for {} resource(s)", .failures.len())]
    RollbackResourceFailed {
        /// Every participant whose Rollback raised
        failures: Vec<ResourceFailure>,
    },

    /// An enlisted dependent task was abandoned or timed out
    #[error("dependent task '{task}' did not complete: {reason}")]
    DependentFailed {
        /// Name the task was enlisted under
        task: Box<str>,
        /// Abandoned, timed out, ...
        reason: Box<str>,
    },

    /// A non-transacted access raced a transacted one on the same path
    #[error("transactional conflict on '{}': {reason}", .path.display())]
    Conflict {
        /// Path both sides touched
        path: PathBuf,
        /// What the witness check observed
        reason: Box<str>,
    },

    /// Plain I/O failure from a transacted filesystem operation
    #[error("I/O error on '{}'", .path.display())]
    Io {
        /// Path the operation targeted
        path: PathBuf,
        /// Underlying OS error
        #[source]
        source: std::io::Error,
    },
}

impl TransactionError {
    pub(crate) fn invalid(operation: &'static str, reason: impl Into<Box<str>>) -> Self {
        Self::InvalidState {
            operation,
            reason: reason.into(),
        }
    }

    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}
