//! Propagation-mode decision engine and transaction forking

use crate::activity::{Activity, ActivityManager};
use crate::dependent::DependentTask;
use crate::errors::TransactionError;
use crate::fs::{FileTransaction, TransactedFs};
use crate::options::{Propagation, TransactionOptions};
use crate::state::TransactionState;
use crate::transaction::{lock_transaction, LocalTransaction, SharedTransaction};
use std::marker::PhantomData;
use std::sync::{Arc, Mutex};

/// Where a new transaction lands relative to the current activity.
enum Placement {
    Root,
    Child,
}

/// The propagation-mode decision engine.
///
/// Creates and joins transactions against the calling context's activity and
/// implements forking. All functions act on the ambient activity of the
/// calling execution context.
pub struct TransactionManager;

impl TransactionManager {
    /// Open a transaction per the options' propagation mode.
    ///
    /// `Suppress` and ambient-free `NotSupported` return `None`; `Requires`
    /// reuses the ambient transaction by creating a child cloned from its
    /// handle; `RequiresNew` always creates an independent root. With
    /// `fork` set at nesting depth > 1 the transaction is excluded from this
    /// activity and the result carries a [`ForkScope`] instead.
    pub fn create_transaction(
        options: TransactionOptions,
    ) -> Result<Option<CreatedTransaction>, TransactionError> {
        Self::create(options, Backend::Local)
    }

    /// Same decision logic with the transacted-filesystem backend.
    ///
    /// A child placement joins the ambient transaction's filesystem session
    /// when it has one.
    pub fn create_file_transaction(
        options: TransactionOptions,
    ) -> Result<Option<CreatedTransaction>, TransactionError> {
        Self::create(options, Backend::File)
    }

    fn create(
        options: TransactionOptions,
        backend: Backend,
    ) -> Result<Option<CreatedTransaction>, TransactionError> {
        let depth = ActivityManager::depth();
        let placement = match options.propagation {
            Propagation::Suppress => return Ok(None),
            Propagation::NotSupported => {
                if depth > 0 {
                    return Err(TransactionError::ModeUnsupported);
                }
                return Ok(None);
            }
            Propagation::Requires => {
                if depth == 0 {
                    Placement::Root
                } else {
                    Placement::Child
                }
            }
            Propagation::RequiresNew => Placement::Root,
        };

        let transaction = backend.instantiate(&options, placement, depth + 1)?;
        lock_transaction(&transaction).begin()?;

        // Forking a would-be-root transaction is meaningless; run sequentially.
        let forked = options.fork && depth > 1;
        if options.fork && !forked {
            tracing::warn!(
                depth,
                "fork requested at root level; running the transaction sequentially"
            );
        }
        if forked {
            Ok(Some(CreatedTransaction::forked(transaction)))
        } else {
            ActivityManager::with_activity(|a| a.push(transaction.clone()))?;
            Ok(Some(CreatedTransaction::scoped(transaction)))
        }
    }

    /// Top of the calling context's stack, none if empty.
    pub fn current_transaction() -> Option<SharedTransaction> {
        ActivityManager::peek(|a| a.and_then(Activity::current_transaction))
    }

    /// Root of the calling context's current session, none if empty.
    pub fn current_top_transaction() -> Option<SharedTransaction> {
        ActivityManager::peek(|a| a.and_then(Activity::top_transaction))
    }

    /// Stack depth of the calling context's activity.
    pub fn count() -> usize {
        ActivityManager::depth()
    }

    /// Register a task the topmost transaction must await before it is done.
    pub fn enlist_dependent_task(task: DependentTask) -> Result<(), TransactionError> {
        ActivityManager::with_activity(|a| a.enlist_dependent_task(task))
    }
}

enum Backend {
    Local,
    File,
}

impl Backend {
    fn instantiate(
        &self,
        options: &TransactionOptions,
        placement: Placement,
        depth: usize,
    ) -> Result<SharedTransaction, TransactionError> {
        Ok(match (self, placement) {
            (Backend::Local, Placement::Root) => {
                Arc::new(Mutex::new(LocalTransaction::root(options.clone(), depth)))
            }
            (Backend::Local, Placement::Child) => {
                let current = TransactionManager::current_transaction()
                    .ok_or(TransactionError::NoAmbientTransaction)?;
                let handle = lock_transaction(&current).native_handle();
                match handle {
                    Some(handle) => Arc::new(Mutex::new(LocalTransaction::child(
                        options.clone(),
                        depth,
                        handle,
                    ))),
                    None => {
                        tracing::warn!(
                            "ambient transaction has no native handle; creating an independent transaction"
                        );
                        Arc::new(Mutex::new(LocalTransaction::root(options.clone(), depth)))
                    }
                }
            }
            (Backend::File, Placement::Root) => {
                Arc::new(Mutex::new(FileTransaction::root(options.clone(), depth)))
            }
            (Backend::File, Placement::Child) => {
                let current = TransactionManager::current_transaction()
                    .ok_or(TransactionError::NoAmbientTransaction)?;
                let ambient_session = lock_transaction(&current).fs_session();
                match ambient_session {
                    Some(session) => Arc::new(Mutex::new(FileTransaction::joined(
                        options.clone(),
                        depth,
                        session,
                    ))),
                    None => {
                        tracing::warn!(
                            "ambient transaction has no filesystem session; allocating a new one"
                        );
                        Arc::new(Mutex::new(FileTransaction::root(options.clone(), depth)))
                    }
                }
            }
        })
    }
}

/// Result of [`TransactionManager::create_transaction`].
///
/// A non-forked result has already been pushed onto the creating activity and
/// pops it (after disposing the transaction) when dropped. A forked result is
/// excluded from the creating activity; take its [`ForkScope`] and invoke it
/// on whichever execution context completes the work.
///
/// Not `Send`: it must be dropped on the context that created it.
pub struct CreatedTransaction {
    transaction: SharedTransaction,
    forked: bool,
    scope: Option<ForkScope>,
    _not_send: PhantomData<*const ()>,
}

impl CreatedTransaction {
    fn scoped(transaction: SharedTransaction) -> Self {
        Self {
            transaction,
            forked: false,
            scope: None,
            _not_send: PhantomData,
        }
    }

    fn forked(transaction: SharedTransaction) -> Self {
        Self {
            scope: Some(ForkScope::new(transaction.clone())),
            transaction,
            forked: true,
            _not_send: PhantomData,
        }
    }

    /// The transaction handle.
    pub fn transaction(&self) -> &SharedTransaction {
        &self.transaction
    }

    /// Whether the transaction was created forked.
    pub fn is_forked(&self) -> bool {
        self.forked
    }

    /// Take the fork scope; present exactly once on forked results.
    pub fn take_scope(&mut self) -> Option<ForkScope> {
        self.scope.take()
    }

    /// Transacted filesystem surface, when the backend is filesystem-backed.
    pub fn transacted_fs(&self) -> Option<TransactedFs> {
        TransactedFs::for_transaction(&self.transaction)
    }

    /// Current state of the transaction.
    pub fn state(&self) -> TransactionState {
        lock_transaction(&self.transaction).state()
    }

    /// Complete the transaction (sequential fail-fast commit).
    pub fn complete(&self) -> Result<(), TransactionError> {
        lock_transaction(&self.transaction).complete()
    }

    /// Roll the transaction back (exhaustive, aggregating).
    pub fn rollback(&self) -> Result<(), TransactionError> {
        lock_transaction(&self.transaction).rollback()
    }

    /// Forbid a later complete.
    pub fn set_rollback_only(&self) {
        lock_transaction(&self.transaction).set_rollback_only();
    }
}

impl std::fmt::Debug for CreatedTransaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CreatedTransaction")
            .field("tx", &lock_transaction(&self.transaction).local_id())
            .field("forked", &self.forked)
            .finish_non_exhaustive()
    }
}

impl Drop for CreatedTransaction {
    fn drop(&mut self) {
        if self.forked {
            // The fork scope owns disposal.
            return;
        }
        ActivityManager::with_activity(|a| {
            if a.top_is(&self.transaction) {
                let _ = a.pop();
            } else {
                tracing::error!("transaction disposed out of stack order; activity left unbalanced");
            }
        });
        if let Err(err) = lock_transaction(&self.transaction).dispose() {
            tracing::warn!(error = %err, "dispose during scope exit failed");
        }
    }
}

/// Push-token for a forked transaction, sendable across an executor boundary
/// and invocable exactly once.
///
/// Entering pushes the transaction onto the *invoking* context's activity and
/// returns a guard that pops it on disposal. Dropping a never-entered scope
/// disposes the transaction so no handle leaks.
pub struct ForkScope {
    transaction: Option<SharedTransaction>,
}

impl ForkScope {
    fn new(transaction: SharedTransaction) -> Self {
        Self {
            transaction: Some(transaction),
        }
    }

    /// Push the forked transaction onto this context's activity.
    ///
    /// Fails if the scope was already entered.
    pub fn enter(&mut self) -> Result<ForkGuard, TransactionError> {
        let transaction = self
            .transaction
            .take()
            .ok_or_else(|| TransactionError::invalid("enter", "fork scope already consumed"))?;
        ActivityManager::with_activity(|a| a.push(transaction.clone()))?;
        Ok(ForkGuard {
            transaction,
            _not_send: PhantomData,
        })
    }
}

impl Drop for ForkScope {
    fn drop(&mut self) {
        if let Some(transaction) = self.transaction.take() {
            tracing::warn!("fork scope dropped without being entered; disposing the transaction");
            if let Err(err) = lock_transaction(&transaction).dispose() {
                tracing::warn!(error = %err, "dispose of unentered forked transaction failed");
            }
        }
    }
}

/// Pops the forked transaction off the entering context's activity and
/// disposes it on drop. Not `Send`.
pub struct ForkGuard {
    transaction: SharedTransaction,
    _not_send: PhantomData<*const ()>,
}

impl ForkGuard {
    /// The forked transaction.
    pub fn transaction(&self) -> &SharedTransaction {
        &self.transaction
    }

    /// Complete the forked transaction.
    pub fn complete(&self) -> Result<(), TransactionError> {
        lock_transaction(&self.transaction).complete()
    }
}

impl Drop for ForkGuard {
    fn drop(&mut self) {
        ActivityManager::with_activity(|a| {
            if a.top_is(&self.transaction) {
                let _ = a.pop();
            } else {
                tracing::error!("fork guard dropped out of stack order; activity left unbalanced");
            }
        });
        if let Err(err) = lock_transaction(&self.transaction).dispose() {
            tracing::warn!(error = %err, "dispose of forked transaction failed");
        }
    }
}
