//! Resource enlistment and the sequential commit/rollback protocol

use crate::errors::{ResourceError, ResourceFailure, TransactionError};

/// A participant enlisted in exactly one transaction.
///
/// `start` runs at enlistment time; `commit` or `rollback` runs exactly once
/// during the owning transaction's completion phase; `dispose` runs when the
/// transaction is disposed. Errors from any callback are caught at the
/// transaction boundary and re-wrapped with the resource name and phase;
/// they never escape raw.
pub trait Resource: Send {
    /// Name used for failure attribution.
    fn name(&self) -> &str;

    /// Called once, immediately, when the resource is enlisted.
    fn start(&mut self) -> Result<(), ResourceError>;

    /// Make this participant's work durable.
    fn commit(&mut self) -> Result<(), ResourceError>;

    /// Undo this participant's work.
    fn rollback(&mut self) -> Result<(), ResourceError>;

    /// Release anything the resource still holds.
    fn dispose(&mut self) {}
}

/// Ordered enlistment list, insertion order load-bearing.
///
/// Commit is sequential and fail-fast; rollback is sequential and exhaustive.
/// The asymmetry is deliberate: a failed commit must stop immediately so the
/// caller can reason about which participants applied, while a failed rollback
/// must still try to release every other participant.
#[derive(Default)]
pub(crate) struct ResourceSet {
    entries: Vec<Box<dyn Resource>>,
}

impl ResourceSet {
    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    /// Append a resource and invoke its `start` callback.
    pub(crate) fn enlist(&mut self, mut resource: Box<dyn Resource>) -> Result<(), TransactionError> {
        if let Err(source) = resource.start() {
            return Err(TransactionError::StartResourceFailed {
                resource: resource.name().into(),
                source,
            });
        }
        self.entries.push(resource);
        Ok(())
    }

    /// Commit every resource in enlistment order, stopping at the first failure.
    ///
    /// Resources before the failure remain committed; resources after it are
    /// never asked to commit.
    pub(crate) fn commit_all(&mut self) -> Result<(), TransactionError> {
        for resource in &mut self.entries {
            if let Err(source) = resource.commit() {
                return Err(TransactionError::CommitResourceFailed {
                    resource: resource.name().into(),
                    source,
                });
            }
        }
        Ok(())
    }

    /// Roll back every resource, collecting failures instead of stopping.
    pub(crate) fn rollback_all(&mut self) -> Vec<ResourceFailure> {
        let mut failures = Vec::new();
        for resource in &mut self.entries {
            if let Err(err) = resource.rollback() {
                failures.push(ResourceFailure {
                    resource: resource.name().into(),
                    reason: err.0,
                });
            }
        }
        failures
    }

    /// Dispose and drop every resource.
    pub(crate) fn dispose_all(&mut self) {
        for resource in &mut self.entries {
            resource.dispose();
        }
        self.entries.clear();
    }
}


#[cfg(test)]
mod tests {
    use super::scripted::ScriptedResource;
    use super::*;
    use std::sync::atomic::Ordering;

    #[test]
    fn commit_is_fail_fast_in_enlistment_order() {
        let r1 = ScriptedResource::new("r1");
        let r2 = ScriptedResource::new("r2").failing_commit();
        let r3 = ScriptedResource::new("r3");
        let (f1, f2, f3) = (r1.flags(), r2.flags(), r3.flags());

        let mut set = ResourceSet::default();
        set.enlist(Box::new(r1)).unwrap();
        set.enlist(Box::new(r2)).unwrap();
        set.enlist(Box::new(r3)).unwrap();
        assert_eq!(set.len(), 3);

        let err = set.commit_all().unwrap_err();
        match err {
            TransactionError::CommitResourceFailed { resource, .. } => {
                assert_eq!(&*resource, "r2");
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(f1.1.load(Ordering::SeqCst), "r1 committed before the failure");
        assert!(!f2.1.load(Ordering::SeqCst));
        assert!(!f3.1.load(Ordering::SeqCst), "r3 never asked to commit");
    }

    #[test]
    fn rollback_is_exhaustive_and_aggregating() {
        let r1 = ScriptedResource::new("r1").failing_rollback();
        let r2 = ScriptedResource::new("r2");
        let f2 = r2.flags();

        let mut set = ResourceSet::default();
        set.enlist(Box::new(r1)).unwrap();
        set.enlist(Box::new(r2)).unwrap();

        let failures = set.rollback_all();
        assert_eq!(failures.len(), 1);
        assert_eq!(&*failures[0].resource, "r1");
        assert!(
            f2.2.load(Ordering::SeqCst),
            "r2 rolled back despite r1's failure"
        );
    }
}
