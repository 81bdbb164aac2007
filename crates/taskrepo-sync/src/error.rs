//! Error types for the sync engine.

use std::path::PathBuf;

use serde::Serialize;
use taskrepo_core::CoreError;
use thiserror::Error;

/// How bad an outcome is. Ordered so the session severity is the maximum.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    #[default]
    Ok,
    Warning,
    Failed,
}

/// Errors raised by the version-control transport.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The transport binary could not be started.
    #[error("Failed to spawn git: {0}")]
    Spawn(#[from] std::io::Error),

    /// A transport command exited unsuccessfully.
    #[error("git {command} failed (exit code {code}): {stderr}")]
    Command {
        command: String,
        code: i32,
        stderr: String,
    },

    /// The transport produced output we could not interpret.
    #[error("Unexpected git output for {command}: {output}")]
    UnexpectedOutput { command: String, output: String },
}

/// Repository-scoped sync errors.
///
/// None of these abort a multi-repository session; the orchestrator records
/// them in the repository report and moves on.
#[derive(Debug, Error)]
pub enum SyncError {
    /// Network, authentication or other transport failure.
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// The working tree is in a state that blocks reconciliation.
    #[error("Repository state blocks sync: {reason}")]
    RepositoryState { reason: String, files: Vec<PathBuf> },

    /// Manual-required fields remain after automatic merging.
    #[error("Unresolvable conflicts in {} file(s)", files.len())]
    UnresolvableConflict { files: Vec<PathBuf> },

    /// A record file is malformed.
    #[error("Invalid record {}: {source}", path.display())]
    Validation {
        path: PathBuf,
        #[source]
        source: CoreError,
    },

    /// The recovery rebase itself conflicted and was aborted.
    #[error("Rebase onto remote conflicted in {} file(s); rebase aborted", files.len())]
    RebaseConflict { files: Vec<PathBuf> },

    /// The remote refused the push and the refusal is not recoverable.
    #[error("Push rejected: {0}")]
    PushRejected(String),

    /// Filesystem error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Identifier cache could not be read or written.
    #[error("Identifier cache error: {0}")]
    Cache(#[from] serde_json::Error),

    /// A record could not be rendered.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_yaml::Error),

    /// The interactive collaborator failed or gave up.
    #[error("Interactive resolution failed: {0}")]
    Interactive(String),
}

impl SyncError {
    /// Severity this error contributes to the repository report.
    pub fn severity(&self) -> Severity {
        match self {
            Self::Validation { .. } => Severity::Warning,
            _ => Severity::Failed,
        }
    }

    /// Files the user has to look at, if any.
    pub fn files(&self) -> &[PathBuf] {
        match self {
            Self::RepositoryState { files, .. }
            | Self::UnresolvableConflict { files }
            | Self::RebaseConflict { files } => files,
            Self::Validation { path, .. } => std::slice::from_ref(path),
            _ => &[],
        }
    }

    /// Short instructions for getting the repository unstuck.
    pub fn hint(&self) -> Option<&'static str> {
        match self {
            Self::RepositoryState { .. } => Some(
                "Finish or abort the pending git operation (git merge --abort / git rebase --abort) and sync again",
            ),
            Self::UnresolvableConflict { .. } => {
                Some("Edit the listed tasks on one side or sync with --strategy interactive")
            }
            Self::RebaseConflict { .. } => Some(
                "The repository was returned to its pre-rebase state; pull and resolve the listed files manually",
            ),
            Self::Transport(_) => Some("Check network access and credentials for the remote"),
            _ => None,
        }
    }
}
