//! Scripted [`Transport`] for unit tests.

use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;

use crate::error::TransportError;
use crate::transport::{
    FetchStatus, MergeAttempt, PushReport, RebaseAttempt, RefFlag, RefUpdate, RepoState, Transport,
};

/// Transport call recorded by [`ScriptedTransport`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    CommitPaths(Vec<PathBuf>, String),
    Fetch,
    FastForward,
    Merge,
    Stage(Vec<PathBuf>),
    Commit(String),
    AbortMerge,
    Push,
    Rebase,
    AbortRebase,
}

/// Answers from a script and records every mutating call.
pub struct ScriptedTransport {
    workdir: PathBuf,
    state: Mutex<RepoState>,
    changes: Mutex<Vec<PathBuf>>,
    remote: bool,
    fetch: FetchStatus,
    fetch_error: Option<String>,
    merge_error: Option<String>,
    commit_error: Option<String>,
    conflicts: Vec<PathBuf>,
    bases: HashMap<PathBuf, String>,
    pushes: Mutex<VecDeque<PushReport>>,
    rebases: Mutex<VecDeque<RebaseAttempt>>,
    calls: Mutex<Vec<Call>>,
}

impl ScriptedTransport {
    pub fn new(workdir: &Path) -> Self {
        std::fs::create_dir_all(workdir.join(".git")).unwrap();
        Self {
            workdir: workdir.to_path_buf(),
            state: Mutex::new(RepoState::Clean),
            changes: Mutex::new(Vec::new()),
            remote: true,
            fetch: FetchStatus {
                ahead: 0,
                behind: 0,
                remote_branch: true,
            },
            fetch_error: None,
            merge_error: None,
            commit_error: None,
            conflicts: Vec::new(),
            bases: HashMap::new(),
            pushes: Mutex::new(VecDeque::new()),
            rebases: Mutex::new(VecDeque::new()),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn without_remote(mut self) -> Self {
        self.remote = false;
        self
    }

    /// A locally edited task file.
    pub fn dirty(self) -> Self {
        self.with_changes(&["tasks/task-local.md"])
    }

    pub fn with_changes(self, paths: &[&str]) -> Self {
        self.changes
            .lock()
            .unwrap()
            .extend(paths.iter().map(PathBuf::from));
        self
    }

    pub fn with_state(self, state: RepoState) -> Self {
        *self.state.lock().unwrap() = state;
        self
    }

    pub fn with_fetch(mut self, status: FetchStatus) -> Self {
        self.fetch = status;
        self
    }

    pub fn failing_fetch(mut self, stderr: &str) -> Self {
        self.fetch_error = Some(stderr.to_string());
        self
    }

    pub fn failing_merge(mut self, stderr: &str) -> Self {
        self.merge_error = Some(stderr.to_string());
        self
    }

    pub fn failing_commit(mut self, stderr: &str) -> Self {
        self.commit_error = Some(stderr.to_string());
        self
    }

    /// Leave `text` (with markers) in the working tree and report the path
    /// as conflicted when the remote is merged.
    pub fn with_conflict(mut self, path: &Path, text: &str, base: Option<&str>) -> Self {
        let full = self.workdir.join(path);
        if let Some(parent) = full.parent() {
            std::fs::create_dir_all(parent).unwrap();
        }
        std::fs::write(&full, text).unwrap();
        self.conflicts.push(path.to_path_buf());
        if let Some(base) = base {
            self.bases.insert(path.to_path_buf(), base.to_string());
        }
        self
    }

    pub fn with_push(self, report: PushReport) -> Self {
        self.pushes.lock().unwrap().push_back(report);
        self
    }

    pub fn with_rebase(self, attempt: RebaseAttempt) -> Self {
        self.rebases.lock().unwrap().push_back(attempt);
        self
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    fn record(&self, call: Call) {
        self.calls.lock().unwrap().push(call);
    }
}

fn failure(command: &str, stderr: &str) -> TransportError {
    TransportError::Command {
        command: command.to_string(),
        code: 128,
        stderr: stderr.to_string(),
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    fn workdir(&self) -> &Path {
        &self.workdir
    }

    async fn git_dir(&self) -> Result<PathBuf, TransportError> {
        Ok(self.workdir.join(".git"))
    }

    async fn repo_state(&self) -> Result<RepoState, TransportError> {
        Ok(self.state.lock().unwrap().clone())
    }

    async fn changed_files(&self) -> Result<Vec<PathBuf>, TransportError> {
        Ok(self.changes.lock().unwrap().clone())
    }

    async fn commit_paths(&self, paths: &[PathBuf], message: &str) -> Result<(), TransportError> {
        self.record(Call::CommitPaths(paths.to_vec(), message.to_string()));
        self.changes.lock().unwrap().retain(|p| !paths.contains(p));
        Ok(())
    }

    async fn has_remote(&self, _remote: &str) -> Result<bool, TransportError> {
        Ok(self.remote)
    }

    async fn fetch(&self, _remote: &str) -> Result<FetchStatus, TransportError> {
        self.record(Call::Fetch);
        match &self.fetch_error {
            Some(stderr) => Err(failure("fetch", stderr)),
            None => Ok(self.fetch),
        }
    }

    async fn fast_forward(&self, _remote: &str) -> Result<(), TransportError> {
        self.record(Call::FastForward);
        Ok(())
    }

    async fn merge_remote(&self, _remote: &str, _message: &str) -> Result<MergeAttempt, TransportError> {
        self.record(Call::Merge);
        if let Some(stderr) = &self.merge_error {
            return Err(failure("merge", stderr));
        }
        if self.conflicts.is_empty() {
            Ok(MergeAttempt::Merged)
        } else {
            Ok(MergeAttempt::Conflicted(self.conflicts.clone()))
        }
    }

    async fn read_base(&self, path: &Path) -> Result<Option<String>, TransportError> {
        Ok(self.bases.get(path).cloned())
    }

    async fn stage(&self, paths: &[PathBuf]) -> Result<(), TransportError> {
        self.record(Call::Stage(paths.to_vec()));
        Ok(())
    }

    async fn commit(&self, message: &str) -> Result<(), TransportError> {
        self.record(Call::Commit(message.to_string()));
        match &self.commit_error {
            Some(stderr) => Err(failure("commit", stderr)),
            None => Ok(()),
        }
    }

    async fn abort_merge(&self) -> Result<(), TransportError> {
        self.record(Call::AbortMerge);
        Ok(())
    }

    async fn push(&self, _remote: &str) -> Result<PushReport, TransportError> {
        self.record(Call::Push);
        let scripted = self.pushes.lock().unwrap().pop_front();
        Ok(scripted.unwrap_or_else(|| {
            PushReport::new(vec![RefUpdate::new("HEAD", "refs/heads/main", RefFlag::FastForward)])
        }))
    }

    async fn rebase_onto_remote(&self, _remote: &str) -> Result<RebaseAttempt, TransportError> {
        self.record(Call::Rebase);
        let scripted = self.rebases.lock().unwrap().pop_front();
        Ok(scripted.unwrap_or(RebaseAttempt::Rebased))
    }

    async fn abort_rebase(&self) -> Result<(), TransportError> {
        self.record(Call::AbortRebase);
        Ok(())
    }
}
