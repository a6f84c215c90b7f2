//! Completion signals for work forked onto other execution contexts

use crate::errors::TransactionError;
use crate::options::DependentPolicy;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender, TryRecvError};
use std::time::Duration;

/// Receiver half of a dependent-completion pair.
///
/// Enlisted on a topmost transaction; the transaction waits on it before it is
/// considered fully done.
pub struct DependentTask {
    name: Box<str>,
    done: Receiver<()>,
}

/// Sender half carried by the forked work.
///
/// Calling [`complete`](CompletionToken::complete) resolves the dependent;
/// dropping the token without completing signals abandonment (the waiting
/// transaction treats the dependent as aborted).
pub struct CompletionToken {
    sender: Option<Sender<()>>,
}

impl DependentTask {
    /// Create a named completion pair.
    pub fn pair(name: &str) -> (DependentTask, CompletionToken) {
        let (sender, done) = mpsc::channel();
        (
            DependentTask {
                name: name.into(),
                done,
            },
            CompletionToken {
                sender: Some(sender),
            },
        )
    }

    /// Name the task was enlisted under.
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl CompletionToken {
    /// Mark the dependent work as complete.
    pub fn complete(mut self) {
        if let Some(sender) = self.sender.take() {
            let _ = sender.send(());
        }
    }
}

impl std::fmt::Debug for DependentTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DependentTask")
            .field("name", &self.name)
            .finish()
    }
}

/// Dependent tasks enlisted on one transaction.
#[derive(Default)]
pub(crate) struct DependentSet {
    tasks: Vec<DependentTask>,
}

impl DependentSet {
    pub(crate) fn track(&mut self, task: DependentTask) {
        self.tasks.push(task);
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Resolve every tracked task per the dependent-completion policy.
    ///
    /// `BlockUntilComplete` waits (bounded by `timeout` when given); an
    /// abandoned or timed-out dependent fails the wait. `AbortIfNotComplete`
    /// polls once and drops whatever has not resolved yet.
    pub(crate) fn resolve(
        &mut self,
        policy: DependentPolicy,
        timeout: Option<Duration>,
    ) -> Result<(), TransactionError> {
        for task in self.tasks.drain(..) {
            match policy {
                DependentPolicy::BlockUntilComplete => {
                    let outcome = match timeout {
                        Some(limit) => task.done.recv_timeout(limit).map_err(|e| match e {
                            RecvTimeoutError::Timeout => "timed out",
                            RecvTimeoutError::Disconnected => "abandoned without completing",
                        }),
                        None => task
                            .done
                            .recv()
                            .map_err(|_| "abandoned without completing"),
                    };
                    if let Err(reason) = outcome {
                        return Err(TransactionError::DependentFailed {
                            task: task.name,
                            reason: reason.into(),
                        });
                    }
                }
                DependentPolicy::AbortIfNotComplete => match task.done.try_recv() {
                    Ok(()) => {}
                    Err(TryRecvError::Empty) => {
                        tracing::warn!(task = %task.name, "aborting unresolved dependent task");
                    }
                    Err(TryRecvError::Disconnected) => {
                        tracing::warn!(task = %task.name, "dependent task abandoned");
                    }
                },
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn completed_dependent_resolves() {
        let (task, token) = DependentTask::pair("worker");
        let mut set = DependentSet::default();
        set.track(task);
        token.complete();
        set.resolve(DependentPolicy::BlockUntilComplete, None).unwrap();
    }

    #[test]
    fn abandoned_dependent_fails_blocking_wait() {
        let (task, token) = DependentTask::pair("worker");
        let mut set = DependentSet::default();
        set.track(task);
        drop(token);
        let err = set
            .resolve(DependentPolicy::BlockUntilComplete, None)
            .unwrap_err();
        assert!(matches!(err, TransactionError::DependentFailed { .. }));
    }

    #[test]
    fn abort_policy_drops_pending_dependents() {
        let (task, token) = DependentTask::pair("worker");
        let mut set = DependentSet::default();
        set.track(task);
        // Token still live and incomplete; policy proceeds anyway.
        set.resolve(DependentPolicy::AbortIfNotComplete, None).unwrap();
        assert!(set.is_empty());
        drop(token);
    }

    #[test]
    fn blocking_wait_honors_timeout() {
        let (task, token) = DependentTask::pair("slow");
        let mut set = DependentSet::default();
        set.track(task);
        let err = set
            .resolve(
                DependentPolicy::BlockUntilComplete,
                Some(Duration::from_millis(10)),
            )
            .unwrap_err();
        match err {
            TransactionError::DependentFailed { reason, .. } => {
                assert_eq!(&*reason, "timed out");
            }
            other => panic!("unexpected error: {other}"),
        }
        drop(token);
    }
}
