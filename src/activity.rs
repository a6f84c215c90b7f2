//! Per-execution-context transaction stacks

use crate::dependent::DependentTask;
use crate::errors::TransactionError;
use crate::state::TransactionState;
use crate::transaction::{lock_transaction, SharedTransaction};
use std::cell::RefCell;
use std::sync::Arc;

/// Ordered stack of active transactions owned by one execution context.
///
/// The topmost (root) transaction of the current session is cached: set
/// exactly once when the count goes 0→1 and cleared exactly when it goes 1→0,
/// so the cache and the stack can never disagree.
#[derive(Default)]
pub struct Activity {
    entries: Vec<(SharedTransaction, Box<str>)>,
    topmost: Option<SharedTransaction>,
}

impl Activity {
    /// Empty activity.
    pub fn new() -> Self {
        Self::default()
    }

    /// Stack depth.
    pub fn count(&self) -> usize {
        self.entries.len()
    }

    /// Stack top, none if empty.
    pub fn current_transaction(&self) -> Option<SharedTransaction> {
        self.entries.last().map(|(tx, _)| tx.clone())
    }

    /// First transaction pushed in this session, none if empty.
    pub fn top_transaction(&self) -> Option<SharedTransaction> {
        self.topmost.clone()
    }

    /// Push a transaction onto the stack.
    ///
    /// Fails if the transaction is already disposed; the stack is untouched on
    /// error.
    pub fn push(&mut self, transaction: SharedTransaction) -> Result<(), TransactionError> {
        let (state, label) = {
            let guard = lock_transaction(&transaction);
            (guard.state(), Box::<str>::from(guard.local_id()))
        };
        if state == TransactionState::Disposed {
            return Err(TransactionError::invalid(
                "push",
                format!("transaction '{label}' is already disposed"),
            ));
        }
        if self.entries.is_empty() {
            self.topmost = Some(transaction.clone());
        }
        tracing::trace!(tx = %label, depth = self.entries.len() + 1, "pushed onto activity");
        self.entries.push((transaction, label));
        Ok(())
    }

    /// Remove and return the top entry.
    pub fn pop(&mut self) -> Result<SharedTransaction, TransactionError> {
        let (transaction, label) = self
            .entries
            .pop()
            .ok_or_else(|| TransactionError::invalid("pop", "activity stack is empty"))?;
        if self.entries.is_empty() {
            self.topmost = None;
        }
        tracing::trace!(tx = %label, depth = self.entries.len(), "popped from activity");
        Ok(transaction)
    }

    /// Register a task the topmost transaction must await before it is done.
    ///
    /// Errors when no transaction is active. A topmost transaction that opted
    /// out of dependent tracking is not fatal; the registration is dropped
    /// with a warning.
    pub fn enlist_dependent_task(&mut self, task: DependentTask) -> Result<(), TransactionError> {
        let topmost = self
            .topmost
            .as_ref()
            .ok_or(TransactionError::NoAmbientTransaction)?;
        let mut guard = lock_transaction(topmost);
        let name = Box::<str>::from(task.name());
        if !guard.track_dependent_task(task) {
            tracing::warn!(
                tx = %guard.local_id(),
                task = %name,
                "topmost transaction does not track dependent tasks; registration dropped"
            );
        }
        Ok(())
    }

    pub(crate) fn top_is(&self, transaction: &SharedTransaction) -> bool {
        self.entries
            .last()
            .map(|(tx, _)| Arc::ptr_eq(tx, transaction))
            .unwrap_or(false)
    }
}

thread_local! {
    static ACTIVITY: RefCell<Option<Activity>> = const { RefCell::new(None) };
}

/// Supplies the one [`Activity`] bound to the calling execution context.
///
/// Created lazily on first use, discarded as soon as its stack empties; never
/// shared across concurrently running contexts, so no locking is involved.
pub struct ActivityManager;

impl ActivityManager {
    /// Run `f` against this context's activity, creating it on demand and
    /// discarding it afterwards if it ended up empty.
    ///
    /// `f` must not re-enter the activity manager.
    pub fn with_activity<R>(f: impl FnOnce(&mut Activity) -> R) -> R {
        ACTIVITY.with(|cell| {
            let mut slot = cell.borrow_mut();
            let activity = slot.get_or_insert_with(Activity::new);
            let out = f(activity);
            if activity.count() == 0 {
                *slot = None;
            }
            out
        })
    }

    /// Read-only view that never creates an activity.
    pub fn peek<R>(f: impl FnOnce(Option<&Activity>) -> R) -> R {
        ACTIVITY.with(|cell| f(cell.borrow().as_ref()))
    }

    /// Stack depth of this context's activity, zero when none exists.
    pub fn depth() -> usize {
        Self::peek(|activity| activity.map(Activity::count).unwrap_or(0))
    }
}
