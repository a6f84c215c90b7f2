//! Nested Transaction Coordination
//!
//! A transaction activity/propagation coordinator: each execution context owns
//! a stack of active transactions (its [`Activity`]), the
//! [`TransactionManager`] decides whether a new unit of work reuses the
//! ambient transaction, creates a new one, or forbids one, and every backend
//! honors one state machine and one resource protocol: sequential fail-fast
//! commit, exhaustive aggregating rollback.
//!
//! Two backends ship: [`LocalTransaction`] over the in-process ambient
//! coordinator, and [`FileTransaction`] over a transacted filesystem session
//! whose operations are undone on rollback.
//!
//! # Quick Start
//!
//! ```rust,ignore
//! // Open (or join) a transaction with the default Requires propagation
//! let tx = TransactionManager::create_transaction(TransactionOptions::default())?
//!     .expect("Requires always yields a transaction");
//!
//! // Enlist participants; Start runs immediately
//! lock_transaction(tx.transaction()).register_resource(Box::new(my_resource))?;
//!
//! // Commit in enlistment order, fail-fast
//! tx.complete()?;
//! // Dropping the result pops it off this context's activity
//! drop(tx);
//! ```

#![warn(missing_docs)]

// === Core Types ===
mod errors;
mod options;
mod state;

// === Participants ===
mod dependent;
mod resource;

// === Transactions ===
mod fs;
mod transaction;

// === Coordination ===
mod activity;
mod manager;

// === Re-exports ===

// Errors
pub use errors::{ResourceError, ResourceFailure, TransactionError};

// Options
pub use options::{DependentPolicy, IsolationHint, Propagation, TransactionOptions};

// State
pub use state::TransactionState;

// Participants
pub use dependent::{CompletionToken, DependentTask};
pub use resource::Resource;

// Transactions
pub use fs::{FileTransaction, FsSession, SharedFsSession, TransactedFs};
pub use transaction::{
    lock_transaction, LocalTransaction, ManagedTransaction, NativeHandle, SharedTransaction,
    Synchronization, TransactionOutcome,
};

// Coordination
pub use activity::{Activity, ActivityManager};
pub use manager::{CreatedTransaction, ForkGuard, ForkScope, TransactionManager};
