//! The transaction contract and the ambient-coordinator backend

use crate::dependent::{DependentSet, DependentTask};
use crate::errors::TransactionError;
use crate::fs::SharedFsSession;
use crate::options::TransactionOptions;
use crate::resource::{Resource, ResourceSet};
use crate::state::TransactionState;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Outcome passed to synchronization callbacks after a transaction resolves.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransactionOutcome {
    /// The transaction completed and every resource committed
    Committed,
    /// The transaction rolled back
    Aborted,
}

/// Completion callback registered via `register_synchronization`.
pub type Synchronization = Box<dyn FnOnce(TransactionOutcome) + Send>;

/// The one contract every transaction backend implements.
///
/// Callers never branch on backend identity except through this trait; the
/// ambient-coordinator backend ([`LocalTransaction`]) and the transacted
/// filesystem backend ([`FileTransaction`](crate::FileTransaction)) both honor
/// the same state machine and resource protocol.
pub trait ManagedTransaction: Send {
    /// Unique local identifier, stable even after disposal.
    fn local_id(&self) -> &str;

    /// Current state.
    fn state(&self) -> TransactionState;

    /// Options the transaction was created with.
    fn creation_options(&self) -> &TransactionOptions;

    /// Stack position at creation time, 1-based.
    fn depth(&self) -> usize;

    /// Whether this transaction is a child/dependent of an ambient one.
    fn is_child(&self) -> bool;

    /// `NoTransaction → Active`; allocates or joins the native handle.
    fn begin(&mut self) -> Result<(), TransactionError>;

    /// Commit: sequential, enlistment-ordered, fail-fast.
    fn complete(&mut self) -> Result<(), TransactionError>;

    /// Roll back: exhaustive and aggregating.
    fn rollback(&mut self) -> Result<(), TransactionError>;

    /// Forbid a later `complete` without rolling back yet.
    fn set_rollback_only(&mut self);

    /// Release handles; rolls back first if still Active. Idempotent.
    fn dispose(&mut self) -> Result<(), TransactionError>;

    /// Enlist a resource and invoke its `start` callback.
    fn register_resource(&mut self, resource: Box<dyn Resource>) -> Result<(), TransactionError>;

    /// Register a callback to run after the transaction resolves.
    fn register_synchronization(&mut self, callback: Synchronization);

    /// Track a dependent task to be awaited at completion time.
    ///
    /// Returns `false` when the implementation opted out of dependent-task
    /// tracking; the registration is dropped in that case.
    fn track_dependent_task(&mut self, task: DependentTask) -> bool {
        drop(task);
        false
    }

    /// Native handle of the in-process coordinator, when this backend has one.
    fn native_handle(&self) -> Option<Arc<NativeHandle>> {
        None
    }

    /// Filesystem session, when this backend is the transacted-fs adapter.
    fn fs_session(&self) -> Option<SharedFsSession> {
        None
    }
}

/// Shared, sendable handle to a transaction behind the contract.
pub type SharedTransaction = Arc<Mutex<dyn ManagedTransaction>>;

/// Lock a shared transaction, recovering from poisoning.
///
/// A poisoned lock only means some caller panicked mid-operation; the state
/// machine stays consistent because every transition is applied as a whole.
pub fn lock_transaction(tx: &SharedTransaction) -> MutexGuard<'_, dyn ManagedTransaction + 'static> {
    tx.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Underlying handle of the in-process (ambient) coordinator.
///
/// Shared between a root transaction and every child cloned from it: a child's
/// rollback dooms the handle so the root cannot commit, and the root can see
/// how many dependents are still unresolved.
pub struct NativeHandle {
    id: u64,
    doomed: AtomicBool,
    dependents: AtomicU64,
}

impl NativeHandle {
    pub(crate) fn allocate() -> Arc<Self> {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Arc::new(Self {
            id: COUNTER.fetch_add(1, Ordering::Relaxed),
            doomed: AtomicBool::new(false),
            dependents: AtomicU64::new(0),
        })
    }

    /// Coordinator-local handle id.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Whether some participant has doomed the whole transaction.
    pub fn is_doomed(&self) -> bool {
        self.doomed.load(Ordering::SeqCst)
    }

    /// Dependents cloned from this handle that have not resolved yet.
    pub fn unresolved_dependents(&self) -> u64 {
        self.dependents.load(Ordering::SeqCst)
    }

    pub(crate) fn doom(&self) {
        self.doomed.store(true, Ordering::SeqCst);
    }

    pub(crate) fn register_dependent(&self) {
        self.dependents.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn resolve_dependent(&self) {
        self.dependents.fetch_sub(1, Ordering::SeqCst);
    }
}

fn next_local_id(prefix: &str) -> Box<str> {
    static COUNTER: AtomicU64 = AtomicU64::new(1);
    format!("{prefix}-{}", COUNTER.fetch_add(1, Ordering::Relaxed)).into_boxed_str()
}

/// Transaction backed by the in-process ambient coordinator.
pub struct LocalTransaction {
    id: Box<str>,
    state: TransactionState,
    options: TransactionOptions,
    depth: usize,
    parent_handle: Option<Arc<NativeHandle>>,
    handle: Option<Arc<NativeHandle>>,
    rollback_only: bool,
    dependent_resolved: bool,
    resources: ResourceSet,
    dependents: DependentSet,
    synchronizations: Vec<Synchronization>,
}

impl LocalTransaction {
    /// New root transaction at the given stack depth.
    pub fn root(options: TransactionOptions, depth: usize) -> Self {
        Self::new(options, depth, None)
    }

    /// New child transaction cloned from an ambient transaction's handle.
    pub fn child(options: TransactionOptions, depth: usize, parent: Arc<NativeHandle>) -> Self {
        Self::new(options, depth, Some(parent))
    }

    fn new(
        options: TransactionOptions,
        depth: usize,
        parent_handle: Option<Arc<NativeHandle>>,
    ) -> Self {
        Self {
            id: next_local_id("tx"),
            state: TransactionState::NoTransaction,
            options,
            depth,
            parent_handle,
            handle: None,
            rollback_only: false,
            dependent_resolved: false,
            resources: ResourceSet::default(),
            dependents: DependentSet::default(),
            synchronizations: Vec::new(),
        }
    }

    fn run_synchronizations(&mut self, outcome: TransactionOutcome) {
        for callback in self.synchronizations.drain(..) {
            callback(outcome);
        }
    }

    /// Resolve this child against the shared handle, exactly once.
    fn resolve_as_dependent(&mut self) {
        if self.is_child() && !self.dependent_resolved {
            self.dependent_resolved = true;
            if let Some(handle) = &self.handle {
                handle.resolve_dependent();
            }
        }
    }
}

impl ManagedTransaction for LocalTransaction {
    fn local_id(&self) -> &str {
        &self.id
    }

    fn state(&self) -> TransactionState {
        self.state
    }

    fn creation_options(&self) -> &TransactionOptions {
        &self.options
    }

    fn depth(&self) -> usize {
        self.depth
    }

    fn is_child(&self) -> bool {
        self.parent_handle.is_some()
    }

    fn begin(&mut self) -> Result<(), TransactionError> {
        if !self.state.can_begin() {
            return Err(TransactionError::invalid(
                "begin",
                format!("transaction is {}, not NoTransaction", self.state),
            ));
        }
        let handle = match self.parent_handle.clone() {
            Some(parent) => {
                parent.register_dependent();
                parent
            }
            None => NativeHandle::allocate(),
        };
        tracing::debug!(tx = %self.id, handle = handle.id(), child = self.is_child(), "transaction began");
        self.handle = Some(handle);
        self.state = TransactionState::Active;
        Ok(())
    }

    fn complete(&mut self) -> Result<(), TransactionError> {
        if !self.state.is_active() {
            return Err(TransactionError::invalid(
                "complete",
                format!("transaction is {}, not Active", self.state),
            ));
        }
        let doomed = self
            .handle
            .as_ref()
            .map(|h| h.is_doomed())
            .unwrap_or(false);
        if self.rollback_only || doomed {
            return Err(TransactionError::RollbackOnly);
        }
        if let Err(err) = self
            .dependents
            .resolve(self.options.dependent_policy, self.options.timeout)
        {
            // An unresolved dependent leaves the outcome unknowable; doom the
            // transaction rather than commit over it.
            self.rollback_only = true;
            return Err(err);
        }
        if let Err(err) = self.resources.commit_all() {
            // Fail-fast: resources before the failure stay committed, the rest
            // were never asked. The state is determinate; the caller may need
            // to compensate.
            self.state = TransactionState::Aborted;
            self.resolve_as_dependent();
            tracing::warn!(tx = %self.id, error = %err, "commit failed part-way");
            self.run_synchronizations(TransactionOutcome::Aborted);
            return Err(err);
        }
        self.state = TransactionState::CommittedOrCompleted;
        self.resolve_as_dependent();
        if let Some(handle) = &self.handle {
            if !self.is_child() && handle.unresolved_dependents() > 0 {
                tracing::warn!(
                    tx = %self.id,
                    outstanding = handle.unresolved_dependents(),
                    "root completed with unresolved dependent transactions"
                );
            }
        }
        tracing::info!(tx = %self.id, resources = self.resources.len(), "transaction completed");
        self.run_synchronizations(TransactionOutcome::Committed);
        Ok(())
    }

    fn rollback(&mut self) -> Result<(), TransactionError> {
        if !self.state.is_active() {
            return Err(TransactionError::invalid(
                "rollback",
                format!("transaction is {}, not Active", self.state),
            ));
        }
        let failures = self.resources.rollback_all();
        self.state = TransactionState::Aborted;
        if self.is_child() {
            if let Some(handle) = &self.handle {
                handle.doom();
            }
        }
        self.resolve_as_dependent();
        tracing::info!(tx = %self.id, failed = failures.len(), "transaction rolled back");
        self.run_synchronizations(TransactionOutcome::Aborted);
        if failures.is_empty() {
            Ok(())
        } else {
            Err(TransactionError::RollbackResourceFailed { failures })
        }
    }

    fn set_rollback_only(&mut self) {
        if !self.state.is_active() {
            tracing::warn!(tx = %self.id, state = %self.state, "set_rollback_only outside Active");
            return;
        }
        self.rollback_only = true;
        if self.is_child() {
            if let Some(handle) = &self.handle {
                handle.doom();
            }
        }
    }

    fn dispose(&mut self) -> Result<(), TransactionError> {
        if self.state == TransactionState::Disposed {
            return Ok(());
        }
        let mut rollback_error = None;
        if self.state.is_active() {
            if let Err(err) = self.rollback() {
                tracing::warn!(tx = %self.id, error = %err, "rollback during dispose failed");
                rollback_error = Some(err);
            }
        }
        self.resources.dispose_all();
        self.resolve_as_dependent();
        self.handle = None;
        self.state = TransactionState::Disposed;
        tracing::debug!(tx = %self.id, "transaction disposed");
        match rollback_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn register_resource(&mut self, resource: Box<dyn Resource>) -> Result<(), TransactionError> {
        if !self.state.can_enlist() {
            return Err(TransactionError::invalid(
                "register_resource",
                format!("transaction is {}", self.state),
            ));
        }
        self.resources.enlist(resource)
    }

    fn register_synchronization(&mut self, callback: Synchronization) {
        self.synchronizations.push(callback);
    }

    fn track_dependent_task(&mut self, task: DependentTask) -> bool {
        self.dependents.track(task);
        true
    }

    fn native_handle(&self) -> Option<Arc<NativeHandle>> {
        self.handle.clone()
    }
}

impl Drop for LocalTransaction {
    fn drop(&mut self) {
        if self.state != TransactionState::Disposed {
            let _ = self.dispose();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::scripted::ScriptedResource;
    use std::sync::atomic::Ordering as AtomicOrdering;

    fn active_root() -> LocalTransaction {
        let mut tx = LocalTransaction::root(TransactionOptions::default(), 1);
        tx.begin().unwrap();
        tx
    }

    #[test]
    fn fail_fast_commit_names_the_failed_resource() {
        let mut tx = active_root();
        let r1 = ScriptedResource::new("r1");
        let r2 = ScriptedResource::new("r2").failing_commit();
        let r3 = ScriptedResource::new("r3");
        let (f1, f2, f3) = (r1.flags(), r2.flags(), r3.flags());
        tx.register_resource(Box::new(r1)).unwrap();
        tx.register_resource(Box::new(r2)).unwrap();
        tx.register_resource(Box::new(r3)).unwrap();

        let err = tx.complete().unwrap_err();
        match err {
            TransactionError::CommitResourceFailed { resource, .. } => {
                assert_eq!(&*resource, "r2")
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(f1.1.load(AtomicOrdering::SeqCst));
        assert!(!f2.1.load(AtomicOrdering::SeqCst));
        assert!(!f3.1.load(AtomicOrdering::SeqCst));
        assert_eq!(tx.state(), TransactionState::Aborted);
    }

    #[test]
    fn rollback_aggregates_and_still_aborts() {
        let mut tx = active_root();
        let bad = ScriptedResource::new("bad").failing_rollback();
        tx.register_resource(Box::new(bad)).unwrap();

        let err = tx.rollback().unwrap_err();
        match err {
            TransactionError::RollbackResourceFailed { failures } => {
                assert_eq!(failures.len(), 1);
                assert_eq!(&*failures[0].resource, "bad");
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(tx.state(), TransactionState::Aborted);
    }

    #[test]
    fn complete_after_rollback_only_fails() {
        let mut tx = active_root();
        tx.set_rollback_only();
        assert!(matches!(
            tx.complete().unwrap_err(),
            TransactionError::RollbackOnly
        ));
    }

    #[test]
    fn dispose_is_idempotent() {
        let mut tx = active_root();
        tx.dispose().unwrap();
        assert_eq!(tx.state(), TransactionState::Disposed);
        tx.dispose().unwrap();
        assert_eq!(tx.state(), TransactionState::Disposed);
    }

    #[test]
    fn dispose_while_active_rolls_back_resources() {
        let mut tx = active_root();
        let r = ScriptedResource::new("r");
        let flags = r.flags();
        tx.register_resource(Box::new(r)).unwrap();
        tx.dispose().unwrap();
        assert!(flags.2.load(AtomicOrdering::SeqCst), "rollback ran");
        assert_eq!(tx.state(), TransactionState::Disposed);
    }

    #[test]
    fn local_id_is_stable_after_disposal() {
        let mut tx = active_root();
        let id = tx.local_id().to_owned();
        tx.dispose().unwrap();
        assert_eq!(tx.local_id(), id);
    }

    #[test]
    fn child_rollback_dooms_the_shared_handle() {
        let mut root = active_root();
        let handle = root.native_handle().unwrap();
        let mut child =
            LocalTransaction::child(TransactionOptions::default(), 2, handle.clone());
        child.begin().unwrap();
        assert!(child.is_child());
        assert_eq!(handle.unresolved_dependents(), 1);

        child.rollback().unwrap();
        assert_eq!(handle.unresolved_dependents(), 0);
        assert!(handle.is_doomed());
        assert!(matches!(
            root.complete().unwrap_err(),
            TransactionError::RollbackOnly
        ));
    }

    #[test]
    fn synchronizations_run_with_the_outcome() {
        use std::sync::atomic::AtomicBool;
        use std::sync::Arc;

        let mut tx = active_root();
        let saw_commit = Arc::new(AtomicBool::new(false));
        let flag = saw_commit.clone();
        tx.register_synchronization(Box::new(move |outcome| {
            flag.store(outcome == TransactionOutcome::Committed, AtomicOrdering::SeqCst);
        }));
        tx.complete().unwrap();
        assert!(saw_commit.load(AtomicOrdering::SeqCst));
    }

    #[test]
    fn synchronizations_see_an_abort_when_commit_fails_part_way() {
        use std::sync::atomic::AtomicBool;
        use std::sync::Arc;

        let mut tx = active_root();
        tx.register_resource(Box::new(ScriptedResource::new("bad").failing_commit()))
            .unwrap();
        let saw_abort = Arc::new(AtomicBool::new(false));
        let flag = saw_abort.clone();
        tx.register_synchronization(Box::new(move |outcome| {
            flag.store(outcome == TransactionOutcome::Aborted, AtomicOrdering::SeqCst);
        }));
        tx.complete().unwrap_err();
        assert_eq!(tx.state(), TransactionState::Aborted);
        assert!(saw_abort.load(AtomicOrdering::SeqCst));
    }

    #[test]
    fn abandoned_dependent_blocks_completion() {
        let mut tx = active_root();
        let (task, token) = DependentTask::pair("worker");
        assert!(tx.track_dependent_task(task));
        drop(token);
        assert!(matches!(
            tx.complete().unwrap_err(),
            TransactionError::DependentFailed { .. }
        ));
        // Doomed by the failed wait; a retry cannot commit either.
        assert!(matches!(
            tx.complete().unwrap_err(),
            TransactionError::RollbackOnly
        ));
    }
}
