//! Per-repository and session reports.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::error::{Severity, SyncError};
use crate::recovery::{PullStatus, PushStatus, RecoveryState, RecoverySummary, ResolvedFile};
use crate::store::{ChangeCounts, ValidationIssue};

/// What happened to one repository.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RepositoryOutcome {
    Synced,
    LocalOnly,
    Failed,
    /// Not started because the session was cancelled.
    Skipped,
}

/// An invalid record reported as a warning.
#[derive(Debug, Clone, Serialize)]
pub struct ValidationWarning {
    pub path: PathBuf,
    pub message: String,
}

impl From<&ValidationIssue> for ValidationWarning {
    fn from(issue: &ValidationIssue) -> Self {
        Self {
            path: issue.path.clone(),
            message: issue.error.to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RepositoryReport {
    pub name: String,
    pub path: PathBuf,
    pub outcome: RepositoryOutcome,
    pub severity: Severity,
    pub counts: ChangeCounts,
    pub auto_committed: bool,
    /// Stray working-tree files left out of the auto-commit.
    pub uncommitted: Vec<PathBuf>,
    pub auto_merged: Vec<ResolvedFile>,
    pub manual: Vec<PathBuf>,
    pub needs_review: Vec<PathBuf>,
    pub validation: Vec<ValidationWarning>,
    pub warnings: Vec<String>,
    pub trail: Vec<RecoveryState>,
    pub pull: PullStatus,
    pub push: PushStatus,
    /// Display ids that changed in this sync.
    pub renumbered: usize,
    pub error: Option<String>,
    pub hint: Option<String>,
    pub duration_ms: u64,
}

impl RepositoryReport {
    pub fn new(name: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            path: path.into(),
            outcome: RepositoryOutcome::Synced,
            severity: Severity::Ok,
            counts: ChangeCounts::default(),
            auto_committed: false,
            uncommitted: Vec::new(),
            auto_merged: Vec::new(),
            manual: Vec::new(),
            needs_review: Vec::new(),
            validation: Vec::new(),
            warnings: Vec::new(),
            trail: Vec::new(),
            pull: PullStatus::NotAttempted,
            push: PushStatus::NotAttempted,
            renumbered: 0,
            error: None,
            hint: None,
            duration_ms: 0,
        }
    }

    pub fn skipped(name: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        let mut report = Self::new(name, path);
        report.outcome = RepositoryOutcome::Skipped;
        report.warnings.push("session cancelled before this repository started".to_string());
        report.severity = Severity::Warning;
        report
    }

    /// Fold in what the recovery controller did.
    pub fn absorb(&mut self, trail: Vec<RecoveryState>, summary: RecoverySummary) {
        if trail.contains(&RecoveryState::LocalOnly) {
            self.outcome = RepositoryOutcome::LocalOnly;
        }
        self.trail = trail;
        self.auto_committed = summary.auto_committed;
        self.uncommitted = summary.unexpected;
        self.pull = summary.pull;
        self.push = summary.push;
        self.needs_review = summary
            .resolved
            .iter()
            .filter(|f| f.needs_review)
            .map(|f| f.path.clone())
            .collect();
        self.auto_merged = summary.resolved;
        self.manual = summary.unresolved;
        self.warnings.extend(summary.warnings);
    }

    /// Record a repository-scoped failure.
    pub fn fail(&mut self, err: &SyncError) {
        if err.severity() == Severity::Failed {
            self.outcome = RepositoryOutcome::Failed;
        }
        self.error = Some(err.to_string());
        self.hint = err.hint().map(str::to_string);
        if self.manual.is_empty() && matches!(err, SyncError::UnresolvableConflict { .. }) {
            self.manual = err.files().to_vec();
        }
        self.severity = self.severity.max(err.severity());
    }

    /// Derive severity from warnings, review flags and validation issues.
    pub fn finish(&mut self) {
        let soft = !self.warnings.is_empty() || !self.needs_review.is_empty() || !self.validation.is_empty();
        if soft {
            self.severity = self.severity.max(Severity::Warning);
        }
        if self.outcome == RepositoryOutcome::Failed {
            self.severity = Severity::Failed;
        }
    }
}

/// Outcome of one `sync` call across repositories.
#[derive(Debug, Clone, Serialize)]
pub struct SessionReport {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub severity: Severity,
    /// In completion order.
    pub repositories: Vec<RepositoryReport>,
}

impl SessionReport {
    pub fn new(started_at: DateTime<Utc>, repositories: Vec<RepositoryReport>) -> Self {
        let severity = repositories
            .iter()
            .map(|r| r.severity)
            .max()
            .unwrap_or_default();
        Self {
            started_at,
            finished_at: Utc::now(),
            severity,
            repositories,
        }
    }

    pub fn is_ok(&self) -> bool {
        self.severity != Severity::Failed
    }

    pub fn failed(&self) -> impl Iterator<Item = &RepositoryReport> {
        self.repositories
            .iter()
            .filter(|r| r.outcome == RepositoryOutcome::Failed)
    }

    pub fn get(&self, name: &str) -> Option<&RepositoryReport> {
        self.repositories.iter().find(|r| r.name == name)
    }
}
