//! Transaction state machine

use serde::{Deserialize, Serialize};

/// Lifecycle states of a transaction.
///
/// Transitions are monotonic:
/// `NoTransaction → Active → {CommittedOrCompleted | Aborted} → Disposed`,
/// with `Disposed` reachable from any state. A transaction never re-enters
/// `Active` after leaving it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransactionState {
    /// Created but not yet begun
    NoTransaction,
    /// Begun; resources may be enlisted, operations may run
    Active,
    /// Complete succeeded for every enlisted resource
    CommittedOrCompleted,
    /// Rolled back, or commit failed part-way
    Aborted,
    /// Handles released; terminal
    Disposed,
}

impl TransactionState {
    /// Whether `begin` is legal from this state.
    pub fn can_begin(self) -> bool {
        matches!(self, Self::NoTransaction)
    }

    /// Whether `complete` / `rollback` are legal from this state.
    pub fn is_active(self) -> bool {
        matches!(self, Self::Active)
    }

    /// Whether the transaction has reached an outcome (committed or aborted).
    pub fn is_resolved(self) -> bool {
        matches!(self, Self::CommittedOrCompleted | Self::Aborted | Self::Disposed)
    }

    /// Whether resource enlistment is still allowed.
    pub fn can_enlist(self) -> bool {
        matches!(self, Self::NoTransaction | Self::Active)
    }
}

impl std::fmt::Display for TransactionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::NoTransaction => "NoTransaction",
            Self::Active => "Active",
            Self::CommittedOrCompleted => "CommittedOrCompleted",
            Self::Aborted => "Aborted",
            Self::Disposed => "Disposed",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn begin_only_from_no_transaction() {
        assert!(TransactionState::NoTransaction.can_begin());
        assert!(!TransactionState::Active.can_begin());
        assert!(!TransactionState::Aborted.can_begin());
        assert!(!TransactionState::Disposed.can_begin());
    }

    #[test]
    fn enlistment_window() {
        assert!(TransactionState::NoTransaction.can_enlist());
        assert!(TransactionState::Active.can_enlist());
        assert!(!TransactionState::CommittedOrCompleted.can_enlist());
        assert!(!TransactionState::Disposed.can_enlist());
    }
}
