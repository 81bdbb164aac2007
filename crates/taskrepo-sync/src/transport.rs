//! Version-control transport seam.
//!
//! The sync engine never shells out itself; everything goes through a
//! [`Transport`]. [`crate::git::GitTransport`] drives the `git` binary and
//! tests use a scripted implementation.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::Serialize;

use crate::error::TransportError;

/// Working tree state before a sync starts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RepoState {
    Clean,
    /// Unmerged paths without an in-progress merge (e.g. a failed stash pop).
    Conflicted(Vec<PathBuf>),
    /// A merge was left in progress.
    MidMerge(Vec<PathBuf>),
    /// A rebase was left in progress.
    MidRebase,
}

/// Relationship between the local branch and its remote counterpart after a fetch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct FetchStatus {
    pub ahead: usize,
    pub behind: usize,
    /// False when the remote has no branch of this name yet.
    pub remote_branch: bool,
}

impl FetchStatus {
    pub fn is_diverged(&self) -> bool {
        self.ahead > 0 && self.behind > 0
    }

    pub fn is_behind_only(&self) -> bool {
        self.behind > 0 && self.ahead == 0
    }
}

/// Result of merging the remote branch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MergeAttempt {
    Merged,
    Conflicted(Vec<PathBuf>),
}

/// Result of rebasing local commits onto the remote branch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RebaseAttempt {
    Rebased,
    Conflicted(Vec<PathBuf>),
}

/// Per-ref flag reported by a push.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RefFlag {
    UpToDate,
    FastForward,
    New,
    Forced,
    Deleted,
    RejectedNonFastForward,
    RemoteRejected,
    RemoteFailure,
    Error,
}

/// Outcome of one ref update.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RefUpdate {
    pub local_ref: String,
    pub remote_ref: String,
    pub flags: Vec<RefFlag>,
    pub summary: String,
}

impl RefUpdate {
    pub fn new(local_ref: impl Into<String>, remote_ref: impl Into<String>, flag: RefFlag) -> Self {
        Self {
            local_ref: local_ref.into(),
            remote_ref: remote_ref.into(),
            flags: vec![flag],
            summary: String::new(),
        }
    }

    pub fn with_summary(mut self, summary: impl Into<String>) -> Self {
        self.summary = summary.into();
        self
    }
}

/// Classification of a whole push.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PushClass {
    Pushed,
    UpToDate,
    NonFastForward,
    Rejected,
    Failed,
}

/// Flag precedence, highest first. The first flag present on any ref
/// decides the class, so a non-fast-forward rejection that git also
/// reported as an error is still retried.
pub const PUSH_PRECEDENCE: &[(RefFlag, PushClass)] = &[
    (RefFlag::RejectedNonFastForward, PushClass::NonFastForward),
    (RefFlag::RemoteRejected, PushClass::Rejected),
    (RefFlag::RemoteFailure, PushClass::Failed),
    (RefFlag::Error, PushClass::Failed),
    (RefFlag::UpToDate, PushClass::UpToDate),
    (RefFlag::Forced, PushClass::Pushed),
    (RefFlag::New, PushClass::Pushed),
    (RefFlag::FastForward, PushClass::Pushed),
    (RefFlag::Deleted, PushClass::Pushed),
];

/// Everything the remote said about a push.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PushReport {
    pub updates: Vec<RefUpdate>,
}

impl PushReport {
    pub fn new(updates: Vec<RefUpdate>) -> Self {
        Self { updates }
    }

    /// Classify by [`PUSH_PRECEDENCE`]. A push with no ref updates is up to date.
    pub fn classify(&self) -> PushClass {
        PUSH_PRECEDENCE
            .iter()
            .find(|(flag, _)| self.updates.iter().any(|u| u.flags.contains(flag)))
            .map(|(_, class)| *class)
            .unwrap_or(PushClass::UpToDate)
    }

    /// Summary of the first ref carrying the deciding flag.
    pub fn message(&self) -> String {
        let class = self.classify();
        self.updates
            .iter()
            .find(|u| {
                PUSH_PRECEDENCE
                    .iter()
                    .any(|(flag, c)| *c == class && u.flags.contains(flag))
            })
            .map(|u| {
                if u.summary.is_empty() {
                    u.remote_ref.clone()
                } else {
                    u.summary.clone()
                }
            })
            .unwrap_or_default()
    }
}

#[async_trait]
pub trait Transport: Send + Sync {
    /// Working directory of the repository.
    fn workdir(&self) -> &Path;

    /// Private directory for engine state (identifier cache, lock file).
    async fn git_dir(&self) -> Result<PathBuf, TransportError>;

    async fn repo_state(&self) -> Result<RepoState, TransportError>;

    /// Modified, deleted and untracked paths, relative to the working tree.
    async fn changed_files(&self) -> Result<Vec<PathBuf>, TransportError>;

    /// Stage exactly `paths` and commit them.
    async fn commit_paths(&self, paths: &[PathBuf], message: &str) -> Result<(), TransportError>;

    async fn has_remote(&self, remote: &str) -> Result<bool, TransportError>;

    async fn fetch(&self, remote: &str) -> Result<FetchStatus, TransportError>;

    async fn fast_forward(&self, remote: &str) -> Result<(), TransportError>;

    /// Merge the remote branch, leaving conflicts in the working tree.
    async fn merge_remote(&self, remote: &str, message: &str) -> Result<MergeAttempt, TransportError>;

    /// Common-ancestor content of a conflicted path, if it had one.
    async fn read_base(&self, path: &Path) -> Result<Option<String>, TransportError>;

    async fn stage(&self, paths: &[PathBuf]) -> Result<(), TransportError>;

    /// Commit the index (concludes an in-progress merge).
    async fn commit(&self, message: &str) -> Result<(), TransportError>;

    async fn abort_merge(&self) -> Result<(), TransportError>;

    async fn push(&self, remote: &str) -> Result<PushReport, TransportError>;

    async fn rebase_onto_remote(&self, remote: &str) -> Result<RebaseAttempt, TransportError>;

    async fn abort_rebase(&self) -> Result<(), TransportError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_uses_precedence_across_refs() {
        let report = PushReport::new(vec![
            RefUpdate::new("refs/heads/main", "refs/heads/main", RefFlag::FastForward),
            RefUpdate::new("refs/heads/x", "refs/heads/x", RefFlag::RejectedNonFastForward)
                .with_summary("[rejected] (fetch first)"),
        ]);
        assert_eq!(report.classify(), PushClass::NonFastForward);
        assert_eq!(report.message(), "[rejected] (fetch first)");
    }

    #[test]
    fn test_non_fast_forward_beats_error() {
        let mut update = RefUpdate::new("HEAD", "refs/heads/main", RefFlag::RejectedNonFastForward);
        update.flags.push(RefFlag::Error);
        assert_eq!(PushReport::new(vec![update]).classify(), PushClass::NonFastForward);

        let mut update = RefUpdate::new("HEAD", "refs/heads/main", RefFlag::RemoteRejected);
        update.flags.push(RefFlag::Error);
        assert_eq!(PushReport::new(vec![update]).classify(), PushClass::Rejected);
    }

    #[test]
    fn test_empty_push_is_up_to_date() {
        assert_eq!(PushReport::default().classify(), PushClass::UpToDate);
    }

    #[test]
    fn test_fetch_status_predicates() {
        let status = FetchStatus {
            ahead: 1,
            behind: 2,
            remote_branch: true,
        };
        assert!(status.is_diverged());
        assert!(!status.is_behind_only());
    }
}
