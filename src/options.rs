//! Transaction creation options

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// How a new transaction relates to an already-active ambient one.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Propagation {
    /// Join the ambient transaction as a child, or become a root if none is active
    Requires,
    /// Always create a new, independent root transaction
    RequiresNew,
    /// Forbid an ambient transaction; error if one is active, otherwise run without one
    NotSupported,
    /// Never create or join a transaction
    Suppress,
}

/// Isolation hint threaded through to the underlying coordinator.
///
/// The coordinator itself does not enforce isolation.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum IsolationHint {
    /// No preference
    #[default]
    Unspecified,
    /// Serializable
    Serializable,
    /// Repeatable read
    RepeatableRead,
    /// Read committed
    ReadCommitted,
    /// Read uncommitted
    ReadUncommitted,
}

/// What a parent does when it finishes before a dependent has resolved.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum DependentPolicy {
    /// Block until every enlisted dependent task resolves
    #[default]
    BlockUntilComplete,
    /// Drop unresolved dependents and proceed
    AbortIfNotComplete,
}

/// Immutable value describing how a transaction is created.
///
/// Equality is field-wise.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionOptions {
    /// Isolation hint for the underlying coordinator
    pub isolation: IsolationHint,
    /// Propagation mode (defaults to [`Propagation::Requires`])
    pub propagation: Propagation,
    /// What to do with unresolved dependents at completion time
    pub dependent_policy: DependentPolicy,
    /// Request completion on a different execution context
    pub fork: bool,
    /// Bound on dependent-task waits; `None` blocks indefinitely
    pub timeout: Option<Duration>,
    /// Staging directory root for filesystem-backed transactions; the system
    /// temp directory when unset. Staging on the same filesystem as the
    /// mutated paths keeps deletes as renames.
    pub staging_root: Option<PathBuf>,
    /// Hint that commit may run asynchronously (threaded through, not acted on)
    pub async_commit: bool,
    /// Hint that rollback may run asynchronously (threaded through, not acted on)
    pub async_rollback: bool,
}

impl Default for Propagation {
    fn default() -> Self {
        Propagation::Requires
    }
}

impl TransactionOptions {
    /// Options with the given propagation mode, everything else default.
    pub fn with_propagation(propagation: Propagation) -> Self {
        Self {
            propagation,
            ..Self::default()
        }
    }

    /// Shorthand for `Requires` (the default).
    pub fn requires() -> Self {
        Self::with_propagation(Propagation::Requires)
    }

    /// Shorthand for `RequiresNew`.
    pub fn requires_new() -> Self {
        Self::with_propagation(Propagation::RequiresNew)
    }

    /// Same options with the fork flag set.
    pub fn forked(mut self) -> Self {
        self.fork = true;
        self
    }

    /// Same options with a dependent-wait timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Same options with a staging root for filesystem-backed transactions.
    pub fn with_staging_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.staging_root = Some(root.into());
        self
    }
}
