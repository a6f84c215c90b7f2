//! Transacted-filesystem backend
//!
//! [`FileTransaction`] honors the same [`ManagedTransaction`] contract as the
//! ambient-coordinator backend, but its resources are implicit: every file and
//! directory operation issued through [`TransactedFs`] is routed through the
//! transaction's [`FsSession`], so individual operations need no explicit
//! enlistment; the adapter itself is the resource.
//!
//! The session applies operations immediately and records their inverse in an
//! undo log, with a staging directory holding backups of deleted or
//! overwritten entries. Commit verifies per-path witnesses and discards the
//! log; rollback replays it in reverse, best-effort. A witness mismatch means
//! a non-transacted access raced this session on the same path and surfaces as
//! the distinct [`TransactionError::Conflict`].

use crate::dependent::{DependentSet, DependentTask};
use crate::errors::{ResourceFailure, TransactionError};
use crate::options::TransactionOptions;
use crate::resource::{Resource, ResourceSet};
use crate::state::TransactionState;
use crate::transaction::{ManagedTransaction, Synchronization, TransactionOutcome};
use std::collections::{BTreeMap, HashSet};
use std::fs::{self, File, OpenOptions};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::SystemTime;
use tempfile::TempDir;

/// Shared handle to a filesystem session; joined by every adapter enlisted in
/// the same ambient transaction.
pub type SharedFsSession = Arc<Mutex<FsSession>>;

fn lock_session(session: &SharedFsSession) -> MutexGuard<'_, FsSession> {
    session.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum SessionState {
    Active,
    Committed,
    RolledBack,
}

/// Inverse of one applied operation, replayed on rollback.
enum UndoOp {
    /// Remove a directory this session created
    RemoveDir(PathBuf),
    /// Remove a file this session created
    RemoveFile(PathBuf),
    /// Rename a moved entry back to where it came from
    MoveBack { from: PathBuf, to: PathBuf },
    /// Move a staged backup over the original location (deletes)
    Restore { backup: PathBuf, original: PathBuf },
    /// Copy a staged backup over the original location (overwrites)
    RestoreCopy { backup: PathBuf, original: PathBuf },
}

impl UndoOp {
    /// Path whose pre-transaction state this op restores.
    fn target(&self) -> &Path {
        match self {
            Self::RemoveDir(path) | Self::RemoveFile(path) => path,
            Self::MoveBack { to, .. } => to,
            Self::Restore { original, .. } | Self::RestoreCopy { original, .. } => original,
        }
    }

    fn apply(&self) -> std::io::Result<()> {
        match self {
            Self::RemoveDir(path) => fs::remove_dir(path),
            Self::RemoveFile(path) => fs::remove_file(path),
            Self::MoveBack { from, to } => fs::rename(from, to),
            Self::Restore { backup, original } => move_entry(backup, original),
            Self::RestoreCopy { backup, original } => fs::copy(backup, original).map(|_| ()),
        }
    }
}

/// Move an entry into or out of staging.
///
/// Rename when possible; when the staging directory sits on a different
/// filesystem than the target path, fall back to copy and remove.
fn move_entry(src: &Path, dst: &Path) -> std::io::Result<()> {
    match fs::rename(src, dst) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::CrossesDevices => {
            let meta = fs::symlink_metadata(src)?;
            if meta.is_dir() {
                copy_dir_all(src, dst)?;
                fs::remove_dir_all(src)
            } else {
                fs::copy(src, dst)?;
                fs::remove_file(src)
            }
        }
        Err(e) => Err(e),
    }
}

fn copy_dir_all(src: &Path, dst: &Path) -> std::io::Result<()> {
    fs::create_dir_all(dst)?;
    for entry in fs::read_dir(src)? {
        let entry = entry?;
        let target = dst.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            copy_dir_all(&entry.path(), &target)?;
        } else {
            fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}

/// What a path looked like after this session last touched it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Witness {
    /// Path must not exist
    Absent,
    /// Path must exist as a directory
    Dir,
    /// Path must exist as a file; content written through the session is not
    /// fingerprinted
    File,
    /// Path must exist as a file with exactly this size and mtime
    FileExact {
        len: u64,
        modified: Option<SystemTime>,
    },
}

impl Witness {
    fn presence(path: &Path) -> Self {
        match fs::symlink_metadata(path) {
            Ok(meta) if meta.is_dir() => Self::Dir,
            Ok(_) => Self::File,
            Err(_) => Self::Absent,
        }
    }

    fn exact(path: &Path) -> Self {
        match fs::symlink_metadata(path) {
            Ok(meta) if meta.is_dir() => Self::Dir,
            Ok(meta) => Self::FileExact {
                len: meta.len(),
                modified: meta.modified().ok(),
            },
            Err(_) => Self::Absent,
        }
    }

    /// Check the path against this witness; `None` means it still matches.
    fn check(&self, path: &Path) -> Option<Box<str>> {
        let actual = match self {
            Self::FileExact { .. } => Self::exact(path),
            _ => Self::presence(path),
        };
        let mismatch = match (self, &actual) {
            (Self::Absent, Self::Absent) => None,
            (Self::Absent, _) => Some("path was recreated by a non-transacted writer"),
            (Self::Dir, Self::Dir) => None,
            (Self::Dir | Self::File | Self::FileExact { .. }, Self::Absent) => {
                Some("path was removed by a non-transacted writer")
            }
            (Self::File, Self::File | Self::FileExact { .. }) => None,
            (Self::FileExact { .. }, a) if a == self => None,
            (Self::FileExact { .. }, _) => Some("path was modified by a non-transacted writer"),
            _ => Some("path changed kind under the transaction"),
        };
        mismatch.map(Into::into)
    }
}

/// Native handle of the transacted filesystem: staging directory, undo log,
/// and per-path conflict witnesses.
///
/// Deletes are staged by rename when the staging directory shares a
/// filesystem with the target, and by copy and remove otherwise.
pub struct FsSession {
    id: u64,
    state: SessionState,
    doomed: bool,
    staging: TempDir,
    undo: Vec<UndoOp>,
    witnesses: BTreeMap<PathBuf, Witness>,
    backup_seq: u64,
}

impl FsSession {
    /// Allocate a fresh session, staging under `staging_root` when given.
    pub fn allocate(staging_root: Option<&Path>) -> Result<SharedFsSession, TransactionError> {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        let staging = match staging_root {
            Some(root) => TempDir::new_in(root),
            None => TempDir::new(),
        }
        .map_err(|e| TransactionError::BeginFailed {
            reason: format!("could not allocate staging directory: {e}").into(),
        })?;
        let session = Self {
            id: COUNTER.fetch_add(1, Ordering::Relaxed),
            state: SessionState::Active,
            doomed: false,
            staging,
            undo: Vec::new(),
            witnesses: BTreeMap::new(),
            backup_seq: 0,
        };
        tracing::debug!(session = session.id, "filesystem session allocated");
        Ok(Arc::new(Mutex::new(session)))
    }

    /// Session id, unique per process.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Forbid a later commit. Set when a joined transaction rolls back or
    /// marks itself rollback-only; the owner then fails its complete.
    fn doom(&mut self) {
        self.doomed = true;
    }

    fn is_doomed(&self) -> bool {
        self.doomed
    }

    fn ensure_active(&self, operation: &'static str) -> Result<(), TransactionError> {
        if self.state == SessionState::Active {
            Ok(())
        } else {
            Err(TransactionError::invalid(
                operation,
                format!("filesystem session is {:?}, not Active", self.state),
            ))
        }
    }

    fn backup_path(&mut self) -> PathBuf {
        self.backup_seq += 1;
        self.staging.path().join(format!("undo-{}", self.backup_seq))
    }

    fn observe(&mut self, path: &Path, witness: Witness) {
        self.witnesses.insert(path.to_path_buf(), witness);
    }

    fn verify_witnesses(&self) -> Vec<(PathBuf, Box<str>)> {
        self.witnesses
            .iter()
            .filter_map(|(path, witness)| witness.check(path).map(|r| (path.clone(), r)))
            .collect()
    }

    fn create_directory(&mut self, path: &Path) -> Result<(), TransactionError> {
        self.ensure_active("create_directory")?;
        if path.exists() && !path.is_dir() {
            return Err(TransactionError::io(
                path,
                std::io::Error::new(ErrorKind::AlreadyExists, "path exists and is not a directory"),
            ));
        }
        // Walk up collecting not-yet-existing ancestors, then create them
        // root-to-leaf, treating "already exists" as success.
        let mut missing = Vec::new();
        let mut cursor = path;
        while !cursor.exists() {
            missing.push(cursor.to_path_buf());
            match cursor.parent() {
                Some(parent) if !parent.as_os_str().is_empty() => cursor = parent,
                _ => break,
            }
        }
        for dir in missing.iter().rev() {
            match fs::create_dir(dir) {
                Ok(()) => {
                    self.undo.push(UndoOp::RemoveDir(dir.clone()));
                    self.observe(dir, Witness::Dir);
                }
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {}
                Err(e) => return Err(TransactionError::io(dir, e)),
            }
        }
        Ok(())
    }

    fn delete_directory(&mut self, path: &Path, recursive: bool) -> Result<(), TransactionError> {
        self.ensure_active("delete_directory")?;
        let meta = fs::symlink_metadata(path).map_err(|e| TransactionError::io(path, e))?;
        if !meta.is_dir() {
            return Err(TransactionError::io(
                path,
                std::io::Error::other("not a directory"),
            ));
        }
        if !recursive {
            let mut entries = fs::read_dir(path).map_err(|e| TransactionError::io(path, e))?;
            if entries.next().is_some() {
                return Err(TransactionError::io(
                    path,
                    std::io::Error::other("directory not empty"),
                ));
            }
        }
        let backup = self.backup_path();
        move_entry(path, &backup).map_err(|e| TransactionError::io(path, e))?;
        self.undo.push(UndoOp::Restore {
            backup,
            original: path.to_path_buf(),
        });
        self.observe(path, Witness::Absent);
        Ok(())
    }

    fn directory_exists(&self, path: &Path) -> Result<bool, TransactionError> {
        self.ensure_active("directory_exists")?;
        Ok(path.is_dir())
    }

    fn file_exists(&self, path: &Path) -> Result<bool, TransactionError> {
        self.ensure_active("file_exists")?;
        Ok(path.is_file())
    }

    fn move_path(
        &mut self,
        operation: &'static str,
        src: &Path,
        dst: &Path,
    ) -> Result<(), TransactionError> {
        self.ensure_active(operation)?;
        fs::rename(src, dst).map_err(|e| TransactionError::io(src, e))?;
        self.undo.push(UndoOp::MoveBack {
            from: dst.to_path_buf(),
            to: src.to_path_buf(),
        });
        self.observe(src, Witness::Absent);
        self.observe(dst, Witness::exact(dst));
        Ok(())
    }

    fn create_file(&mut self, path: &Path) -> Result<File, TransactionError> {
        self.ensure_active("create_file")?;
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(path)
            .map_err(|e| TransactionError::io(path, e))?;
        self.undo.push(UndoOp::RemoveFile(path.to_path_buf()));
        // Presence only: the caller writes through the returned handle.
        self.observe(path, Witness::File);
        Ok(file)
    }

    fn open_file(&mut self, path: &Path, writable: bool) -> Result<File, TransactionError> {
        self.ensure_active("open_file")?;
        if !writable {
            return File::open(path).map_err(|e| TransactionError::io(path, e));
        }
        let backup = self.backup_path();
        fs::copy(path, &backup).map_err(|e| TransactionError::io(path, e))?;
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(|e| TransactionError::io(path, e))?;
        self.undo.push(UndoOp::RestoreCopy {
            backup,
            original: path.to_path_buf(),
        });
        self.observe(path, Witness::File);
        Ok(file)
    }

    fn delete_file(&mut self, path: &Path) -> Result<(), TransactionError> {
        self.ensure_active("delete_file")?;
        let meta = fs::symlink_metadata(path).map_err(|e| TransactionError::io(path, e))?;
        if meta.is_dir() {
            return Err(TransactionError::io(
                path,
                std::io::Error::other("is a directory"),
            ));
        }
        let backup = self.backup_path();
        move_entry(path, &backup).map_err(|e| TransactionError::io(path, e))?;
        self.undo.push(UndoOp::Restore {
            backup,
            original: path.to_path_buf(),
        });
        self.observe(path, Witness::Absent);
        Ok(())
    }

    /// Verify witnesses and make every applied operation final.
    fn commit(&mut self) -> Result<(), TransactionError> {
        self.ensure_active("commit")?;
        if let Some((path, reason)) = self.verify_witnesses().into_iter().next() {
            return Err(TransactionError::Conflict { path, reason });
        }
        self.state = SessionState::Committed;
        self.undo.clear();
        self.witnesses.clear();
        tracing::debug!(session = self.id, "filesystem session committed");
        Ok(())
    }

    /// Replay the undo log in reverse, best-effort.
    ///
    /// Conflicted paths are skipped rather than clobbered; the first conflict
    /// wins error attribution, then aggregated undo failures.
    fn rollback(&mut self) -> Result<(), TransactionError> {
        self.ensure_active("rollback")?;
        let conflicts = self.verify_witnesses();
        let conflicted: HashSet<PathBuf> = conflicts.iter().map(|(p, _)| p.clone()).collect();
        let mut failures = Vec::new();
        for op in self.undo.drain(..).rev() {
            if conflicted.contains(op.target()) {
                continue;
            }
            if let Err(e) = op.apply() {
                failures.push(ResourceFailure {
                    resource: op.target().display().to_string().into_boxed_str(),
                    reason: e.to_string().into_boxed_str(),
                });
            }
        }
        self.state = SessionState::RolledBack;
        self.witnesses.clear();
        tracing::debug!(
            session = self.id,
            conflicts = conflicts.len(),
            failed = failures.len(),
            "filesystem session rolled back"
        );
        if let Some((path, reason)) = conflicts.into_iter().next() {
            Err(TransactionError::Conflict { path, reason })
        } else if failures.is_empty() {
            Ok(())
        } else {
            Err(TransactionError::RollbackResourceFailed { failures })
        }
    }
}

fn next_file_tx_id() -> Box<str> {
    static COUNTER: AtomicU64 = AtomicU64::new(1);
    format!("ftx-{}", COUNTER.fetch_add(1, Ordering::Relaxed)).into_boxed_str()
}

/// Transaction backed by a transacted filesystem session.
///
/// Begin either joins the session of an already-active ambient transaction or
/// allocates a new one. Only the owning (allocating) transaction commits or
/// rolls the session back; a joined transaction marks itself done and leaves
/// the durable decision to the owner.
pub struct FileTransaction {
    id: Box<str>,
    state: TransactionState,
    options: TransactionOptions,
    depth: usize,
    joined: bool,
    pending_session: Option<SharedFsSession>,
    session: Option<SharedFsSession>,
    rollback_only: bool,
    resources: ResourceSet,
    dependents: DependentSet,
    synchronizations: Vec<Synchronization>,
}

impl FileTransaction {
    /// New root file transaction owning a fresh session.
    pub fn root(options: TransactionOptions, depth: usize) -> Self {
        Self::new(options, depth, None)
    }

    /// New file transaction joining an ambient transaction's session.
    pub fn joined(options: TransactionOptions, depth: usize, session: SharedFsSession) -> Self {
        Self::new(options, depth, Some(session))
    }

    fn new(
        options: TransactionOptions,
        depth: usize,
        pending_session: Option<SharedFsSession>,
    ) -> Self {
        Self {
            id: next_file_tx_id(),
            state: TransactionState::NoTransaction,
            options,
            depth,
            joined: pending_session.is_some(),
            pending_session,
            session: None,
            rollback_only: false,
            resources: ResourceSet::default(),
            dependents: DependentSet::default(),
            synchronizations: Vec::new(),
        }
    }

    /// Operation surface bound to this transaction's session.
    pub fn transacted_fs(&self) -> Option<TransactedFs> {
        self.session.clone().map(TransactedFs::from_session)
    }

    fn run_synchronizations(&mut self, outcome: TransactionOutcome) {
        for callback in self.synchronizations.drain(..) {
            callback(outcome);
        }
    }

    fn session_doomed(&self) -> bool {
        self.session
            .as_ref()
            .map(|session| lock_session(session).is_doomed())
            .unwrap_or(false)
    }
}

impl ManagedTransaction for FileTransaction {
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
        self.joined
    }

    fn begin(&mut self) -> Result<(), TransactionError> {
        if !self.state.can_begin() {
            return Err(TransactionError::invalid(
                "begin",
                format!("transaction is {}, not NoTransaction", self.state),
            ));
        }
        let session = match self.pending_session.take() {
            Some(ambient) => ambient,
            None => FsSession::allocate(self.options.staging_root.as_deref())?,
        };
        tracing::debug!(
            tx = %self.id,
            session = lock_session(&session).id(),
            joined = self.joined,
            "file transaction began"
        );
        self.session = Some(session);
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
        if self.rollback_only || self.session_doomed() {
            return Err(TransactionError::RollbackOnly);
        }
        if let Err(err) = self
            .dependents
            .resolve(self.options.dependent_policy, self.options.timeout)
        {
            self.rollback_only = true;
            return Err(err);
        }
        if let Err(err) = self.resources.commit_all() {
            self.state = TransactionState::Aborted;
            tracing::warn!(tx = %self.id, error = %err, "commit failed part-way");
            self.run_synchronizations(TransactionOutcome::Aborted);
            return Err(err);
        }
        if !self.joined {
            if let Some(session) = &self.session {
                let mut guard = lock_session(session);
                if let Err(err) = guard.commit() {
                    // A conflict at commit: undo what we can and abort.
                    if let Err(undo_err) = guard.rollback() {
                        tracing::warn!(tx = %self.id, error = %undo_err, "undo after conflict incomplete");
                    }
                    drop(guard);
                    self.state = TransactionState::Aborted;
                    self.run_synchronizations(TransactionOutcome::Aborted);
                    return Err(err);
                }
            }
        }
        self.state = TransactionState::CommittedOrCompleted;
        tracing::info!(tx = %self.id, joined = self.joined, "file transaction completed");
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
        let mut failures = self.resources.rollback_all();
        let mut session_error = None;
        if let Some(session) = &self.session {
            if self.joined {
                // The owner holds the undo log; make sure it cannot commit
                // over this transaction's aborted work.
                lock_session(session).doom();
            } else {
                match lock_session(session).rollback() {
                    Ok(()) => {}
                    Err(TransactionError::RollbackResourceFailed { failures: mut fs_failures }) => {
                        failures.append(&mut fs_failures);
                    }
                    Err(err) => session_error = Some(err),
                }
            }
        }
        self.state = TransactionState::Aborted;
        tracing::info!(tx = %self.id, failed = failures.len(), "file transaction rolled back");
        self.run_synchronizations(TransactionOutcome::Aborted);
        if let Some(err) = session_error {
            Err(err)
        } else if failures.is_empty() {
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
        if self.joined {
            if let Some(session) = &self.session {
                lock_session(session).doom();
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
        // Releasing the session drops the staging directory once the last
        // joined adapter lets go.
        self.session = None;
        self.pending_session = None;
        self.state = TransactionState::Disposed;
        tracing::debug!(tx = %self.id, "file transaction disposed");
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

    fn fs_session(&self) -> Option<SharedFsSession> {
        self.session.clone()
    }
}

impl Drop for FileTransaction {
    fn drop(&mut self) {
        if self.state != TransactionState::Disposed {
            let _ = self.dispose();
        }
    }
}

/// Transacted file and directory operations, cheaply cloneable.
///
/// All operations require the backing session to be Active and fail with a
/// state error otherwise.
#[derive(Clone)]
pub struct TransactedFs {
    session: SharedFsSession,
}

impl TransactedFs {
    pub(crate) fn from_session(session: SharedFsSession) -> Self {
        Self { session }
    }

    /// Operation surface for a shared transaction, if it is filesystem-backed.
    pub fn for_transaction(tx: &crate::SharedTransaction) -> Option<Self> {
        crate::lock_transaction(tx).fs_session().map(Self::from_session)
    }

    /// Create a directory and any missing ancestors; already-existing
    /// directories are success.
    pub fn create_directory(&self, path: impl AsRef<Path>) -> Result<(), TransactionError> {
        lock_session(&self.session).create_directory(path.as_ref())
    }

    /// Delete a directory, staging it for restore on rollback.
    pub fn delete_directory(
        &self,
        path: impl AsRef<Path>,
        recursive: bool,
    ) -> Result<(), TransactionError> {
        lock_session(&self.session).delete_directory(path.as_ref(), recursive)
    }

    /// Whether the path is a directory.
    pub fn directory_exists(&self, path: impl AsRef<Path>) -> Result<bool, TransactionError> {
        lock_session(&self.session).directory_exists(path.as_ref())
    }

    /// Rename a directory.
    pub fn move_directory(
        &self,
        src: impl AsRef<Path>,
        dst: impl AsRef<Path>,
    ) -> Result<(), TransactionError> {
        lock_session(&self.session).move_path("move_directory", src.as_ref(), dst.as_ref())
    }

    /// Create a new file; fails if it already exists.
    pub fn create_file(&self, path: impl AsRef<Path>) -> Result<File, TransactionError> {
        lock_session(&self.session).create_file(path.as_ref())
    }

    /// Open an existing file; a writable open stages a backup first.
    pub fn open_file(
        &self,
        path: impl AsRef<Path>,
        writable: bool,
    ) -> Result<File, TransactionError> {
        lock_session(&self.session).open_file(path.as_ref(), writable)
    }

    /// Rename a file.
    pub fn move_file(
        &self,
        src: impl AsRef<Path>,
        dst: impl AsRef<Path>,
    ) -> Result<(), TransactionError> {
        lock_session(&self.session).move_path("move_file", src.as_ref(), dst.as_ref())
    }

    /// Delete a file, staging it for restore on rollback.
    pub fn delete_file(&self, path: impl AsRef<Path>) -> Result<(), TransactionError> {
        lock_session(&self.session).delete_file(path.as_ref())
    }

    /// Whether the path is a file.
    pub fn file_exists(&self, path: impl AsRef<Path>) -> Result<bool, TransactionError> {
        lock_session(&self.session).file_exists(path.as_ref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};

    fn active_root_tx() -> (FileTransaction, TransactedFs, tempfile::TempDir) {
        let workspace = tempfile::tempdir().unwrap();
        let mut tx = FileTransaction::root(TransactionOptions::default(), 1);
        tx.begin().unwrap();
        let fs_ops = tx.transacted_fs().unwrap();
        (tx, fs_ops, workspace)
    }

    #[test]
    fn create_directory_is_idempotent_and_creates_ancestors() {
        let (mut tx, ops, ws) = active_root_tx();
        let deep = ws.path().join("a/b/c");
        ops.create_directory(&deep).unwrap();
        assert!(ops.directory_exists(&deep).unwrap());
        // Second creation of an existing tree is success.
        ops.create_directory(&deep).unwrap();
        tx.complete().unwrap();
        assert!(deep.is_dir());
    }

    #[test]
    fn rollback_removes_created_directories_leaf_first() {
        let (mut tx, ops, ws) = active_root_tx();
        let deep = ws.path().join("x/y/z");
        ops.create_directory(&deep).unwrap();
        tx.rollback().unwrap();
        assert!(!ws.path().join("x").exists());
    }

    #[test]
    fn rollback_restores_deleted_file() {
        let (mut tx, ops, ws) = active_root_tx();
        let path = ws.path().join("keep.txt");
        std::fs::write(&path, b"important").unwrap();

        ops.delete_file(&path).unwrap();
        assert!(!path.exists());
        tx.rollback().unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"important");
    }

    #[test]
    fn commit_makes_operations_final() {
        let (mut tx, ops, ws) = active_root_tx();
        let path = ws.path().join("out.txt");
        let mut file = ops.create_file(&path).unwrap();
        file.write_all(b"hello").unwrap();
        drop(file);
        tx.complete().unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"hello");
    }

    #[test]
    fn rollback_restores_overwritten_file() {
        let (mut tx, ops, ws) = active_root_tx();
        let path = ws.path().join("data.txt");
        std::fs::write(&path, b"before").unwrap();

        let mut file = ops.open_file(&path, true).unwrap();
        file.write_all(b"after!").unwrap();
        drop(file);
        tx.rollback().unwrap();

        let mut content = String::new();
        std::fs::File::open(&path)
            .unwrap()
            .read_to_string(&mut content)
            .unwrap();
        assert_eq!(content, "before");
    }

    #[test]
    fn move_file_rolls_back_to_origin() {
        let (mut tx, ops, ws) = active_root_tx();
        let src = ws.path().join("src.txt");
        let dst = ws.path().join("dst.txt");
        std::fs::write(&src, b"payload").unwrap();

        ops.move_file(&src, &dst).unwrap();
        assert!(!src.exists());
        assert!(dst.exists());
        tx.rollback().unwrap();
        assert!(src.exists());
        assert!(!dst.exists());
    }

    #[test]
    fn non_transacted_writer_racing_a_delete_is_a_conflict() {
        let (mut tx, ops, ws) = active_root_tx();
        let path = ws.path().join("contested.txt");
        std::fs::write(&path, b"ours").unwrap();

        ops.delete_file(&path).unwrap();
        // Non-transacted writer recreates the path before commit.
        std::fs::write(&path, b"intruder").unwrap();

        let err = tx.complete().unwrap_err();
        assert!(matches!(err, TransactionError::Conflict { .. }));
        assert_eq!(tx.state(), TransactionState::Aborted);
        // The conflicted path is not clobbered by the undo sweep.
        assert_eq!(std::fs::read(&path).unwrap(), b"intruder");
    }

    #[test]
    fn non_transacted_delete_of_created_file_is_a_conflict() {
        let (mut tx, ops, ws) = active_root_tx();
        let path = ws.path().join("mine.txt");
        ops.create_file(&path).unwrap();
        std::fs::remove_file(&path).unwrap();
        assert!(matches!(
            tx.complete().unwrap_err(),
            TransactionError::Conflict { .. }
        ));
    }

    #[test]
    fn operations_require_active_state() {
        let (mut tx, ops, ws) = active_root_tx();
        tx.complete().unwrap();
        let err = ops.create_directory(ws.path().join("late")).unwrap_err();
        assert!(matches!(err, TransactionError::InvalidState { .. }));
    }

    #[test]
    fn delete_directory_requires_empty_unless_recursive() {
        let (mut tx, ops, ws) = active_root_tx();
        let dir = ws.path().join("full");
        std::fs::create_dir(&dir).unwrap();
        std::fs::write(dir.join("f.txt"), b"x").unwrap();

        assert!(ops.delete_directory(&dir, false).is_err());
        ops.delete_directory(&dir, true).unwrap();
        assert!(!dir.exists());
        tx.rollback().unwrap();
        assert!(dir.join("f.txt").exists());
    }

    #[test]
    fn joined_transaction_shares_the_session_and_defers_commit() {
        let (mut owner, ops, ws) = active_root_tx();
        let session = owner.fs_session().unwrap();
        let mut joined =
            FileTransaction::joined(TransactionOptions::default(), 2, session.clone());
        joined.begin().unwrap();
        assert!(joined.is_child());
        assert!(Arc::ptr_eq(&joined.fs_session().unwrap(), &session));

        let path = ws.path().join("shared.txt");
        joined.transacted_fs().unwrap().create_file(&path).unwrap();
        joined.complete().unwrap();
        // The owner still decides durability.
        assert!(path.exists());
        owner.rollback().unwrap();
        assert!(!path.exists());
        drop(ops);
    }

    #[test]
    fn resource_commit_failure_aborts_with_synchronizations() {
        use crate::resource::scripted::ScriptedResource;
        use std::sync::atomic::AtomicBool;

        let (mut tx, _ops, _ws) = active_root_tx();
        tx.register_resource(Box::new(ScriptedResource::new("bad").failing_commit()))
            .unwrap();
        let saw_abort = Arc::new(AtomicBool::new(false));
        let flag = saw_abort.clone();
        tx.register_synchronization(Box::new(move |outcome| {
            flag.store(outcome == TransactionOutcome::Aborted, Ordering::SeqCst);
        }));
        tx.complete().unwrap_err();
        assert_eq!(tx.state(), TransactionState::Aborted);
        assert!(saw_abort.load(Ordering::SeqCst));
    }

    #[test]
    fn joined_rollback_blocks_the_owner_commit() {
        let (mut owner, _ops, ws) = active_root_tx();
        let session = owner.fs_session().unwrap();
        let mut joined = FileTransaction::joined(TransactionOptions::default(), 2, session);
        joined.begin().unwrap();

        let path = ws.path().join("halfway.txt");
        joined.transacted_fs().unwrap().create_file(&path).unwrap();
        joined.rollback().unwrap();

        let err = owner.complete().unwrap_err();
        assert!(matches!(err, TransactionError::RollbackOnly));
        // Disposal of the still-active owner undoes the aborted child's work.
        owner.dispose().unwrap();
        assert!(!path.exists());
    }

    #[test]
    fn joined_rollback_only_blocks_the_owner_commit() {
        let (mut owner, _ops, _ws) = active_root_tx();
        let session = owner.fs_session().unwrap();
        let mut joined = FileTransaction::joined(TransactionOptions::default(), 2, session);
        joined.begin().unwrap();
        joined.set_rollback_only();
        assert!(matches!(
            joined.complete().unwrap_err(),
            TransactionError::RollbackOnly
        ));
        assert!(matches!(
            owner.complete().unwrap_err(),
            TransactionError::RollbackOnly
        ));
    }

    #[test]
    fn delete_staged_across_filesystems_falls_back_to_copy() {
        // A separate mount from the default temp directory on most Linux
        // systems; skip where it is missing.
        let shm = Path::new("/dev/shm");
        if !shm.is_dir() {
            return;
        }
        let ws = tempfile::tempdir_in(shm).unwrap();
        let mut tx = FileTransaction::root(TransactionOptions::default(), 1);
        tx.begin().unwrap();
        let ops = tx.transacted_fs().unwrap();

        let file = ws.path().join("other-device.txt");
        std::fs::write(&file, b"elsewhere").unwrap();
        ops.delete_file(&file).unwrap();
        assert!(!file.exists());

        let dir = ws.path().join("tree");
        std::fs::create_dir(&dir).unwrap();
        std::fs::write(dir.join("leaf.txt"), b"deep").unwrap();
        ops.delete_directory(&dir, true).unwrap();
        assert!(!dir.exists());

        tx.rollback().unwrap();
        assert_eq!(std::fs::read(&file).unwrap(), b"elsewhere");
        assert_eq!(std::fs::read(dir.join("leaf.txt")).unwrap(), b"deep");
    }

    #[test]
    fn staging_root_option_places_backups_beside_the_data() {
        let ws = tempfile::tempdir().unwrap();
        let staging = ws.path().join("staging");
        std::fs::create_dir(&staging).unwrap();
        let options = TransactionOptions::default().with_staging_root(&staging);
        let mut tx = FileTransaction::root(options, 1);
        tx.begin().unwrap();
        let ops = tx.transacted_fs().unwrap();

        let path = ws.path().join("doc.txt");
        std::fs::write(&path, b"v1").unwrap();
        ops.delete_file(&path).unwrap();
        let session_dir = std::fs::read_dir(&staging)
            .unwrap()
            .next()
            .unwrap()
            .unwrap()
            .path();
        assert_eq!(std::fs::read(session_dir.join("undo-1")).unwrap(), b"v1");
        tx.rollback().unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"v1");
    }
}
