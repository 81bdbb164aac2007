//! Divergence recovery for one repository.
//!
//! The controller walks a fixed state machine: preflight, auto-commit,
//! fetch, fast-forward or merge, push, and at most one retry. The retry
//! rebases onto the new remote tip, or re-merges it when this run already
//! created a merge commit (a rebase would drop that commit and replay the
//! conflict it settled).
//! Every state visited is recorded in the trail that ends up in the report.

use std::io;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::{MergeStrategy, SyncConfig, SyncPolicy};
use crate::error::SyncError;
use crate::markers::{AppliedStrategy, MarkerResolver};
use crate::merge::FieldDecision;
use crate::resolver::{ConflictPrompt, InteractiveResolver};
use crate::store::{
    is_expected_file, is_task_file, parse_record, render_record, unexpected_patterns, RecordStore,
};
use crate::transport::{FetchStatus, MergeAttempt, PushClass, PushReport, RebaseAttempt, RepoState, Transport};

/// States of the recovery machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryState {
    Clean,
    StaleRebaseAborted,
    PendingMergeResolved,
    AutoCommitted,
    LocalOnly,
    Fetched,
    UpToDate,
    FastForwarded,
    Diverged,
    PullFailed,
    ConflictsResolved,
    Pushed,
    PushRejected,
    Rebasing,
    RebaseClean,
    RebaseConflicted,
    Remerged,
    Aborted,
}

/// Final pull status of a repository.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PullStatus {
    #[default]
    NotAttempted,
    LocalOnly,
    UpToDate,
    FastForwarded,
    Merged,
    Failed,
}

/// Final push status of a repository.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PushStatus {
    #[default]
    NotAttempted,
    Disabled,
    NothingToPush,
    UpToDate,
    Pushed,
    PushedAfterRebase,
    PushedAfterRemerge,
    Rejected,
}

/// A conflicted file that was settled automatically or interactively.
#[derive(Debug, Clone, Serialize)]
pub struct ResolvedFile {
    pub path: PathBuf,
    pub uuid: Option<String>,
    pub strategy: AppliedStrategy,
    pub decisions: Vec<FieldDecision>,
    pub interactive: bool,
    pub needs_review: bool,
}

/// What the controller did, available even when it failed.
#[derive(Debug, Clone, Default)]
pub struct RecoverySummary {
    pub auto_committed: bool,
    pub pull: PullStatus,
    pub push: PushStatus,
    pub resolved: Vec<ResolvedFile>,
    pub unresolved: Vec<PathBuf>,
    /// Changed paths left out of the auto-commit.
    pub unexpected: Vec<PathBuf>,
    pub warnings: Vec<String>,
}

/// Push typestate marker: nothing retried yet.
#[derive(Debug)]
pub struct FirstAttempt;

/// Push typestate marker: the single retry after a rebase or re-merge.
#[derive(Debug)]
pub struct Retried;

/// A push that can be performed once in state `S`.
#[derive(Debug)]
pub struct PushAttempt<S> {
    remote: String,
    _state: PhantomData<S>,
}

/// Outcome of the first push.
#[derive(Debug)]
pub enum FirstPush {
    Accepted(PushReport),
    /// Rejected as non-fast-forward; the tip must be rebased or re-merged.
    NeedsRebase(PendingRebase),
}

/// Permission to bring in the new remote tip once and retry the push.
#[derive(Debug)]
pub struct PendingRebase {
    remote: String,
    pub rejection: PushReport,
}

fn settle(report: PushReport) -> Result<PushReport, SyncError> {
    match report.classify() {
        PushClass::Pushed | PushClass::UpToDate => Ok(report),
        PushClass::NonFastForward | PushClass::Rejected | PushClass::Failed => {
            Err(SyncError::PushRejected(report.message()))
        }
    }
}

impl PushAttempt<FirstAttempt> {
    pub fn new(remote: impl Into<String>) -> Self {
        Self {
            remote: remote.into(),
            _state: PhantomData,
        }
    }

    pub async fn push(self, transport: &dyn Transport) -> Result<FirstPush, SyncError> {
        let report = transport.push(&self.remote).await?;
        if report.classify() == PushClass::NonFastForward {
            return Ok(FirstPush::NeedsRebase(PendingRebase {
                remote: self.remote,
                rejection: report,
            }));
        }
        settle(report).map(FirstPush::Accepted)
    }
}

impl PendingRebase {
    /// Fetch the new remote tip and rebase onto it. A conflicting rebase is
    /// aborted before returning.
    pub async fn rebase(self, transport: &dyn Transport) -> Result<PushAttempt<Retried>, SyncError> {
        transport.fetch(&self.remote).await?;
        match transport.rebase_onto_remote(&self.remote).await? {
            RebaseAttempt::Rebased => Ok(PushAttempt {
                remote: self.remote,
                _state: PhantomData,
            }),
            RebaseAttempt::Conflicted(files) => {
                transport.abort_rebase().await?;
                Err(SyncError::RebaseConflict { files })
            }
        }
    }

    /// Retry after the caller merged the new remote tip instead of rebasing.
    pub fn remerged(self) -> PushAttempt<Retried> {
        PushAttempt {
            remote: self.remote,
            _state: PhantomData,
        }
    }
}

impl PushAttempt<Retried> {
    /// Final push. Any rejection, including another non-fast-forward, is reported.
    pub async fn push(self, transport: &dyn Transport) -> Result<PushReport, SyncError> {
        let report = transport.push(&self.remote).await?;
        settle(report)
    }
}

/// Collaborators the controller works with.
#[derive(Clone, Copy)]
pub struct RecoveryContext<'a> {
    pub transport: &'a dyn Transport,
    pub config: &'a SyncConfig,
    pub policy: &'a SyncPolicy,
    pub resolver: Option<&'a dyn InteractiveResolver>,
}

struct PlannedWrite {
    text: String,
    file: ResolvedFile,
}

#[derive(Default)]
struct ResolutionPlan {
    writes: Vec<PlannedWrite>,
    unresolved: Vec<PathBuf>,
    warnings: Vec<String>,
}

/// Drives one repository from its current state to pushed, local-only or failed.
pub struct DivergenceController<'a> {
    ctx: RecoveryContext<'a>,
    markers: MarkerResolver,
    trail: Vec<RecoveryState>,
    summary: RecoverySummary,
}

impl<'a> DivergenceController<'a> {
    pub fn new(ctx: RecoveryContext<'a>) -> Self {
        Self {
            markers: MarkerResolver::new(ctx.policy.clone()),
            ctx,
            trail: Vec::new(),
            summary: RecoverySummary::default(),
        }
    }

    pub fn trail(&self) -> &[RecoveryState] {
        &self.trail
    }

    pub fn summary(&self) -> &RecoverySummary {
        &self.summary
    }

    pub fn into_parts(self) -> (Vec<RecoveryState>, RecoverySummary) {
        (self.trail, self.summary)
    }

    fn enter(&mut self, state: RecoveryState) {
        debug!(workdir = %self.workdir().display(), ?state, "Recovery state");
        self.trail.push(state);
    }

    fn workdir(&self) -> &Path {
        self.ctx.transport.workdir()
    }

    /// Run every step. The trail and summary stay readable on error.
    pub async fn run(&mut self) -> Result<(), SyncError> {
        self.preflight().await?;
        self.auto_commit().await?;

        let remote = self.ctx.config.remote.clone();
        if !self.ctx.transport.has_remote(&remote).await? {
            info!(workdir = %self.workdir().display(), "No remote configured; local-only repository");
            self.enter(RecoveryState::LocalOnly);
            self.summary.pull = PullStatus::LocalOnly;
            self.summary.push = PushStatus::NothingToPush;
            return Ok(());
        }

        let status = self.pull(&remote).await?;

        let local_ahead = status.ahead > 0 || !status.remote_branch || self.summary.pull == PullStatus::Merged;
        if !self.ctx.config.push {
            self.summary.push = PushStatus::Disabled;
            return Ok(());
        }
        if !local_ahead {
            self.summary.push = PushStatus::NothingToPush;
            return Ok(());
        }
        self.push(&remote).await
    }

    async fn preflight(&mut self) -> Result<(), SyncError> {
        let transport = self.ctx.transport;
        match transport.repo_state().await? {
            RepoState::Clean => self.enter(RecoveryState::Clean),
            RepoState::MidRebase => {
                warn!(workdir = %self.workdir().display(), "Aborting interrupted rebase");
                transport.abort_rebase().await?;
                self.summary
                    .warnings
                    .push("aborted a rebase left by an interrupted sync".to_string());
                self.enter(RecoveryState::StaleRebaseAborted);
            }
            RepoState::MidMerge(files) | RepoState::Conflicted(files) => {
                warn!(
                    workdir = %self.workdir().display(),
                    files = files.len(),
                    "Repository has pending conflicts; attempting resolution"
                );
                let plan = self.plan(&files).await?;
                if !plan.unresolved.is_empty() {
                    self.summary.unresolved = plan.unresolved.clone();
                    return Err(SyncError::RepositoryState {
                        reason: "unresolved conflicts from an earlier merge".to_string(),
                        files: plan.unresolved,
                    });
                }
                let message = self.ctx.config.merge_commit_message.clone();
                self.conclude_merge(plan, &message).await?;
                self.enter(RecoveryState::PendingMergeResolved);
            }
        }
        Ok(())
    }

    /// Commit local edits to repository files. Anything else is left in
    /// the working tree and reported.
    async fn auto_commit(&mut self) -> Result<(), SyncError> {
        let transport = self.ctx.transport;
        let (expected, unexpected): (Vec<PathBuf>, Vec<PathBuf>) = transport
            .changed_files()
            .await?
            .into_iter()
            .partition(|path| is_expected_file(path));

        if !unexpected.is_empty() {
            let groups: Vec<String> = unexpected_patterns(&unexpected)
                .iter()
                .map(|(pattern, files)| format!("{pattern} ({})", files.len()))
                .collect();
            warn!(
                workdir = %self.workdir().display(),
                files = unexpected.len(),
                "Leaving unexpected files out of the auto-commit"
            );
            self.summary.warnings.push(format!(
                "not committed, unexpected files: {}",
                groups.join(", ")
            ));
            self.summary.unexpected = unexpected;
        }

        if !expected.is_empty() {
            transport
                .commit_paths(&expected, &self.ctx.config.auto_commit_message)
                .await?;
            self.summary.auto_committed = true;
            self.enter(RecoveryState::AutoCommitted);
        }
        Ok(())
    }

    async fn pull(&mut self, remote: &str) -> Result<FetchStatus, SyncError> {
        let transport = self.ctx.transport;
        let status = match transport.fetch(remote).await {
            Ok(status) => status,
            Err(err) => {
                self.pull_failed();
                return Err(err.into());
            }
        };
        self.enter(RecoveryState::Fetched);
        debug!(ahead = status.ahead, behind = status.behind, "Fetched remote");

        if status.is_behind_only() {
            if let Err(err) = transport.fast_forward(remote).await {
                self.pull_failed();
                return Err(err.into());
            }
            self.enter(RecoveryState::FastForwarded);
            self.summary.pull = PullStatus::FastForwarded;
        } else if status.is_diverged() {
            self.enter(RecoveryState::Diverged);
            self.merge(remote).await?;
            self.enter(RecoveryState::ConflictsResolved);
            self.summary.pull = PullStatus::Merged;
        } else {
            self.enter(RecoveryState::UpToDate);
            self.summary.pull = PullStatus::UpToDate;
        }
        Ok(status)
    }

    fn pull_failed(&mut self) {
        self.enter(RecoveryState::PullFailed);
        self.summary.pull = PullStatus::Failed;
    }

    async fn merge(&mut self, remote: &str) -> Result<(), SyncError> {
        let transport = self.ctx.transport;
        let message = self.ctx.config.merge_commit_message.clone();
        let files = match transport.merge_remote(remote, &message).await {
            Ok(MergeAttempt::Merged) => return Ok(()),
            Ok(MergeAttempt::Conflicted(files)) => files,
            Err(err) => {
                warn!(error = %err, "Merge of remote branch failed");
                self.pull_failed();
                return Err(err.into());
            }
        };
        info!(files = files.len(), "Merge produced conflicts");

        let plan = match self.plan(&files).await {
            Ok(plan) => plan,
            Err(err) => {
                self.abort_merge().await;
                return Err(err);
            }
        };
        if !plan.unresolved.is_empty() {
            self.summary.unresolved = plan.unresolved.clone();
            self.abort_merge().await;
            return Err(SyncError::UnresolvableConflict {
                files: plan.unresolved,
            });
        }
        self.conclude_merge(plan, &message).await
    }

    /// Write, stage and commit a resolution plan. Any failure aborts the
    /// merge and drops the files from the summary.
    async fn conclude_merge(&mut self, plan: ResolutionPlan, message: &str) -> Result<(), SyncError> {
        let resolved_before = self.summary.resolved.len();
        let result = match self.apply(plan).await {
            Ok(()) => self.ctx.transport.commit(message).await.map_err(SyncError::from),
            Err(err) => Err(err),
        };
        if let Err(err) = result {
            warn!(error = %err, "Could not conclude merge; aborting");
            self.summary.resolved.truncate(resolved_before);
            self.abort_merge().await;
            return Err(err);
        }
        Ok(())
    }

    async fn abort_merge(&mut self) {
        if let Err(err) = self.ctx.transport.abort_merge().await {
            warn!(error = %err, "Failed to abort merge");
            self.summary.warnings.push(format!("merge abort failed: {err}"));
        }
        self.enter(RecoveryState::Aborted);
    }

    async fn push(&mut self, remote: &str) -> Result<(), SyncError> {
        let transport = self.ctx.transport;
        let pending = match PushAttempt::new(remote).push(transport).await {
            Ok(FirstPush::Accepted(report)) => {
                self.record_push(&report, PushStatus::Pushed);
                return Ok(());
            }
            Ok(FirstPush::NeedsRebase(pending)) => pending,
            Err(err) => {
                self.enter(RecoveryState::PushRejected);
                self.summary.push = PushStatus::Rejected;
                return Err(err);
            }
        };

        self.enter(RecoveryState::PushRejected);

        let (retry, pushed) = if self.summary.pull == PullStatus::Merged {
            info!(reason = %pending.rejection.message(), "Push rejected as non-fast-forward; merging new remote tip");
            match self.remerge(remote).await {
                Ok(()) => (pending.remerged(), PushStatus::PushedAfterRemerge),
                Err(err) => {
                    self.summary.push = PushStatus::Rejected;
                    return Err(err);
                }
            }
        } else {
            info!(reason = %pending.rejection.message(), "Push rejected as non-fast-forward; rebasing");
            self.enter(RecoveryState::Rebasing);
            match pending.rebase(transport).await {
                Ok(retry) => {
                    self.enter(RecoveryState::RebaseClean);
                    (retry, PushStatus::PushedAfterRebase)
                }
                Err(err) => {
                    if matches!(err, SyncError::RebaseConflict { .. }) {
                        self.enter(RecoveryState::RebaseConflicted);
                        self.enter(RecoveryState::Aborted);
                    }
                    self.summary.push = PushStatus::Rejected;
                    return Err(err);
                }
            }
        };

        match retry.push(transport).await {
            Ok(report) => {
                self.record_push(&report, pushed);
                Ok(())
            }
            Err(err) => {
                self.enter(RecoveryState::PushRejected);
                self.summary.push = PushStatus::Rejected;
                Err(err)
            }
        }
    }

    /// Fetch and merge the remote again, through the same conflict resolution.
    async fn remerge(&mut self, remote: &str) -> Result<(), SyncError> {
        let status = self.ctx.transport.fetch(remote).await?;
        if status.behind > 0 {
            self.merge(remote).await?;
        }
        self.enter(RecoveryState::Remerged);
        Ok(())
    }

    fn record_push(&mut self, report: &PushReport, pushed: PushStatus) {
        self.summary.push = match report.classify() {
            PushClass::UpToDate => PushStatus::UpToDate,
            _ => pushed,
        };
        self.enter(RecoveryState::Pushed);
    }

    /// Work out a resolution for every conflicted file without touching the tree.
    async fn plan(&mut self, files: &[PathBuf]) -> Result<ResolutionPlan, SyncError> {
        let mut plan = ResolutionPlan::default();
        let store = RecordStore::open(self.workdir())?;

        for path in files {
            if !is_task_file(path) {
                plan.unresolved.push(path.clone());
                continue;
            }
            let text = match store.read_raw(path) {
                Ok(text) => text,
                Err(err) if err.kind() == io::ErrorKind::NotFound => {
                    plan.unresolved.push(path.clone());
                    continue;
                }
                Err(err) => return Err(err.into()),
            };
            let base = self
                .ctx
                .transport
                .read_base(path)
                .await?
                .and_then(|b| parse_record(&b).ok());

            let mut resolution = self.markers.resolve(&text, base.as_ref());
            plan.warnings.extend(
                resolution
                    .warnings
                    .drain(..)
                    .map(|w| format!("{}: {w}", path.display())),
            );

            let mut interactive = false;
            if resolution.requires_manual && self.ctx.policy.strategy == MergeStrategy::Interactive {
                if let (Some(resolver), Some(outcome)) = (self.ctx.resolver, resolution.outcome.as_mut()) {
                    let prompt = ConflictPrompt::from_outcome(path, outcome);
                    let selections = resolver.resolve(&prompt).await?;
                    outcome.apply(&selections);
                    if outcome.is_resolved() {
                        resolution.text = Some(render_record(&outcome.merged)?);
                        resolution.requires_manual = false;
                        interactive = true;
                    }
                }
            }

            // Merged text must load back; a verbatim side is flagged for review instead.
            let verbatim = matches!(resolution.strategy, AppliedStrategy::Verbatim(_));
            if let (Some(text), false) = (&resolution.text, verbatim) {
                if let Err(err) = parse_record(text) {
                    plan.warnings.push(format!("{}: resolved record is invalid: {err}", path.display()));
                    plan.unresolved.push(path.clone());
                    continue;
                }
            }

            match resolution.text {
                Some(text) if !resolution.requires_manual => {
                    let outcome = resolution.outcome.as_ref();
                    plan.writes.push(PlannedWrite {
                        text,
                        file: ResolvedFile {
                            path: path.clone(),
                            uuid: outcome.map(|o| o.merged.uuid.to_string()),
                            strategy: resolution.strategy,
                            decisions: outcome.map(|o| o.decisions.clone()).unwrap_or_default(),
                            interactive,
                            needs_review: resolution.needs_review,
                        },
                    });
                }
                _ => plan.unresolved.push(path.clone()),
            }
        }
        Ok(plan)
    }

    /// Write and stage every planned resolution.
    async fn apply(&mut self, plan: ResolutionPlan) -> Result<(), SyncError> {
        let store = RecordStore::open(self.workdir())?;
        let mut staged = Vec::with_capacity(plan.writes.len());
        for write in plan.writes {
            store.write_raw(&write.file.path, &write.text)?;
            staged.push(write.file.path.clone());
            self.summary.resolved.push(write.file);
        }
        self.summary.warnings.extend(plan.warnings);
        self.ctx.transport.stage(&staged).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::markers::contains_markers;
    use crate::merge::{Field, FieldResolution};
    use crate::testing::{Call, ScriptedTransport};
    use crate::transport::{RefFlag, RefUpdate};
    use async_trait::async_trait;
    use tempfile::TempDir;

    const LOCAL: &str = "---\nuuid: t1\ntitle: Fix login\nstatus: in-progress\n\
created: 2025-10-01T10:00:00Z\nmodified: 2025-10-02T10:00:00Z\n---\n\nBody\n";

    fn conflicted_title() -> String {
        "---\nuuid: t1\n\
<<<<<<< HEAD\ntitle: Fix login page\n=======\ntitle: Zzz\n>>>>>>> origin/main\n\
status: pending\ncreated: 2025-10-01T10:00:00Z\nmodified: 2025-10-02T10:00:00Z\n---\n\nBody\n"
            .to_string()
    }

    fn conflicted_status() -> String {
        "---\nuuid: t1\ntitle: Fix login\n\
<<<<<<< HEAD\nstatus: in-progress\n=======\nstatus: done\n>>>>>>> origin/main\n\
created: 2025-10-01T10:00:00Z\nmodified: 2025-10-02T10:00:00Z\n---\n\nBody\n"
            .to_string()
    }

    fn diverged() -> FetchStatus {
        FetchStatus {
            ahead: 1,
            behind: 1,
            remote_branch: true,
        }
    }

    fn nff() -> PushReport {
        let mut update = RefUpdate::new("HEAD", "refs/heads/main", RefFlag::RejectedNonFastForward)
            .with_summary("[rejected] (fetch first)");
        update.flags.push(RefFlag::Error);
        PushReport::new(vec![update])
    }

    fn ahead_only() -> FetchStatus {
        FetchStatus {
            ahead: 1,
            behind: 0,
            remote_branch: true,
        }
    }

    fn pushed() -> PushReport {
        PushReport::new(vec![RefUpdate::new("HEAD", "refs/heads/main", RefFlag::FastForward)])
    }

    async fn run(
        transport: &ScriptedTransport,
        policy: &SyncPolicy,
        resolver: Option<&dyn InteractiveResolver>,
    ) -> (Result<(), SyncError>, Vec<RecoveryState>, RecoverySummary) {
        let config = SyncConfig::default();
        let mut controller = DivergenceController::new(RecoveryContext {
            transport,
            config: &config,
            policy,
            resolver,
        });
        let result = controller.run().await;
        let (trail, summary) = controller.into_parts();
        (result, trail, summary)
    }

    #[tokio::test]
    async fn test_local_only_repository() {
        let dir = TempDir::new().unwrap();
        let transport = ScriptedTransport::new(dir.path()).without_remote().dirty();

        let (result, trail, summary) = run(&transport, &SyncPolicy::default(), None).await;
        assert!(result.is_ok());
        assert!(summary.auto_committed);
        assert_eq!(summary.pull, PullStatus::LocalOnly);
        assert_eq!(
            trail,
            vec![RecoveryState::Clean, RecoveryState::AutoCommitted, RecoveryState::LocalOnly]
        );
        assert!(transport.calls().contains(&Call::CommitPaths(
            vec![PathBuf::from("tasks/task-local.md")],
            "Auto-commit: TaskRepo sync".to_string()
        )));
    }

    #[tokio::test]
    async fn test_behind_only_fast_forwards_without_push() {
        let dir = TempDir::new().unwrap();
        let transport = ScriptedTransport::new(dir.path()).with_fetch(FetchStatus {
            ahead: 0,
            behind: 3,
            remote_branch: true,
        });

        let (result, _, summary) = run(&transport, &SyncPolicy::default(), None).await;
        assert!(result.is_ok());
        assert_eq!(summary.pull, PullStatus::FastForwarded);
        assert_eq!(summary.push, PushStatus::NothingToPush);
        assert!(!transport.calls().iter().any(|c| matches!(c, Call::Push)));
    }

    #[tokio::test]
    async fn test_non_fast_forward_triggers_exactly_one_rebase_retry() {
        let dir = TempDir::new().unwrap();
        let transport = ScriptedTransport::new(dir.path())
            .with_fetch(ahead_only())
            .with_push(nff())
            .with_push(pushed());

        let (result, trail, summary) = run(&transport, &SyncPolicy::default(), None).await;
        assert!(result.is_ok());
        assert_eq!(summary.push, PushStatus::PushedAfterRebase);
        let calls = transport.calls();
        assert_eq!(calls.iter().filter(|c| matches!(c, Call::Push)).count(), 2);
        assert_eq!(calls.iter().filter(|c| matches!(c, Call::Rebase)).count(), 1);
        assert!(trail.ends_with(&[
            RecoveryState::PushRejected,
            RecoveryState::Rebasing,
            RecoveryState::RebaseClean,
            RecoveryState::Pushed,
        ]));
    }

    #[tokio::test]
    async fn test_second_non_fast_forward_is_not_retried() {
        let dir = TempDir::new().unwrap();
        let transport = ScriptedTransport::new(dir.path())
            .with_fetch(ahead_only())
            .with_push(nff())
            .with_push(nff());

        let (result, _, summary) = run(&transport, &SyncPolicy::default(), None).await;
        assert!(matches!(result, Err(SyncError::PushRejected(_))));
        assert_eq!(summary.push, PushStatus::Rejected);
        let calls = transport.calls();
        assert_eq!(calls.iter().filter(|c| matches!(c, Call::Push)).count(), 2);
        assert_eq!(calls.iter().filter(|c| matches!(c, Call::Rebase)).count(), 1);
    }

    #[tokio::test]
    async fn test_rebase_conflict_aborts_and_reports_files() {
        let dir = TempDir::new().unwrap();
        let transport = ScriptedTransport::new(dir.path())
            .with_fetch(ahead_only())
            .with_push(nff())
            .with_rebase(RebaseAttempt::Conflicted(vec![PathBuf::from("tasks/task-t1.md")]));

        let (result, trail, _) = run(&transport, &SyncPolicy::default(), None).await;
        match result {
            Err(SyncError::RebaseConflict { files }) => {
                assert_eq!(files, vec![PathBuf::from("tasks/task-t1.md")])
            }
            other => panic!("expected rebase conflict, got {other:?}"),
        }
        assert!(transport.calls().contains(&Call::AbortRebase));
        assert!(trail.ends_with(&[RecoveryState::RebaseConflicted, RecoveryState::Aborted]));
    }

    #[tokio::test]
    async fn test_remote_rejected_is_not_retried() {
        let dir = TempDir::new().unwrap();
        let transport = ScriptedTransport::new(dir.path())
            .with_fetch(diverged())
            .with_push(PushReport::new(vec![RefUpdate::new(
                "HEAD",
                "refs/heads/main",
                RefFlag::RemoteRejected,
            )
            .with_summary("[remote rejected] (protected branch)")]));

        let (result, _, _) = run(&transport, &SyncPolicy::default(), None).await;
        match result {
            Err(SyncError::PushRejected(message)) => assert!(message.contains("protected branch")),
            other => panic!("expected push rejection, got {other:?}"),
        }
        assert!(!transport.calls().contains(&Call::Rebase));
    }

    #[tokio::test]
    async fn test_diverged_merge_resolves_markers_and_commits() {
        let dir = TempDir::new().unwrap();
        let path = PathBuf::from("tasks/task-t1.md");
        let transport = ScriptedTransport::new(dir.path())
            .with_fetch(diverged())
            .with_conflict(&path, &conflicted_status(), Some(LOCAL))
            .with_push(pushed());

        let (result, trail, summary) = run(&transport, &SyncPolicy::default(), None).await;
        assert!(result.is_ok(), "{result:?}");
        assert_eq!(summary.pull, PullStatus::Merged);
        assert_eq!(summary.resolved.len(), 1);
        assert_eq!(summary.resolved[0].uuid.as_deref(), Some("t1"));
        assert!(trail.contains(&RecoveryState::ConflictsResolved));

        let written = std::fs::read_to_string(dir.path().join(&path)).unwrap();
        assert!(written.contains("status: done"));
        let calls = transport.calls();
        assert!(calls.contains(&Call::Stage(vec![path.clone()])));
        assert!(calls.contains(&Call::Commit("TaskRepo sync: merge remote changes".to_string())));
    }

    #[tokio::test]
    async fn test_unresolvable_conflict_aborts_merge_without_commit() {
        let dir = TempDir::new().unwrap();
        let path = PathBuf::from("tasks/task-t1.md");
        let original = conflicted_title();
        let transport = ScriptedTransport::new(dir.path())
            .with_fetch(diverged())
            .with_conflict(&path, &original, Some(LOCAL));

        let (result, trail, summary) = run(&transport, &SyncPolicy::default(), None).await;
        assert!(matches!(result, Err(SyncError::UnresolvableConflict { .. })));
        assert_eq!(summary.unresolved, vec![path.clone()]);
        assert!(trail.ends_with(&[RecoveryState::Diverged, RecoveryState::Aborted]));

        let calls = transport.calls();
        assert!(calls.contains(&Call::AbortMerge));
        assert!(!calls.iter().any(|c| matches!(c, Call::Commit(_) | Call::Stage(_) | Call::Push)));
        assert_eq!(std::fs::read_to_string(dir.path().join(&path)).unwrap(), original);
    }

    struct TakeRemote;

    #[async_trait]
    impl InteractiveResolver for TakeRemote {
        async fn resolve(&self, prompt: &ConflictPrompt) -> Result<Vec<FieldDecision>, SyncError> {
            Ok(prompt
                .choices
                .iter()
                .map(|c| FieldDecision {
                    field: c.field,
                    resolution: FieldResolution::RemoteWins,
                })
                .collect())
        }
    }

    #[tokio::test]
    async fn test_interactive_strategy_asks_collaborator() {
        let dir = TempDir::new().unwrap();
        let path = PathBuf::from("tasks/task-t1.md");
        let transport = ScriptedTransport::new(dir.path())
            .with_fetch(diverged())
            .with_conflict(&path, &conflicted_title(), Some(LOCAL))
            .with_push(pushed());
        let policy = SyncPolicy {
            strategy: MergeStrategy::Interactive,
            ..SyncPolicy::default()
        };

        let (result, _, summary) = run(&transport, &policy, Some(&TakeRemote)).await;
        assert!(result.is_ok(), "{result:?}");
        assert!(summary.resolved[0].interactive);
        assert!(summary.resolved[0]
            .decisions
            .iter()
            .any(|d| d.field == Field::Title && d.resolution == FieldResolution::RemoteWins));
        let written = std::fs::read_to_string(dir.path().join(&path)).unwrap();
        assert!(written.contains("title: Zzz"));
    }

    #[tokio::test]
    async fn test_stale_rebase_aborted_in_preflight() {
        let dir = TempDir::new().unwrap();
        let transport = ScriptedTransport::new(dir.path())
            .with_state(RepoState::MidRebase)
            .with_fetch(FetchStatus {
                ahead: 0,
                behind: 0,
                remote_branch: true,
            });

        let (result, trail, summary) = run(&transport, &SyncPolicy::default(), None).await;
        assert!(result.is_ok());
        assert_eq!(trail[0], RecoveryState::StaleRebaseAborted);
        assert_eq!(summary.warnings.len(), 1);
        assert!(transport.calls().contains(&Call::AbortRebase));
    }

    #[tokio::test]
    async fn test_pending_unresolvable_merge_blocks_sync() {
        let dir = TempDir::new().unwrap();
        let path = PathBuf::from("README.md");
        let transport = ScriptedTransport::new(dir.path()).with_state(RepoState::MidMerge(vec![path.clone()]));

        let (result, _, _) = run(&transport, &SyncPolicy::default(), None).await;
        match result {
            Err(SyncError::RepositoryState { files, .. }) => assert_eq!(files, vec![path]),
            other => panic!("expected repository state error, got {other:?}"),
        }
        assert!(!transport.calls().iter().any(|c| matches!(c, Call::Fetch | Call::AbortMerge)));
    }

    #[tokio::test]
    async fn test_push_disabled() {
        let dir = TempDir::new().unwrap();
        let transport = ScriptedTransport::new(dir.path()).with_fetch(diverged());
        let config = SyncConfig::default().with_push(false);
        let policy = SyncPolicy::default();
        let mut controller = DivergenceController::new(RecoveryContext {
            transport: &transport,
            config: &config,
            policy: &policy,
            resolver: None,
        });
        controller.run().await.unwrap();
        assert_eq!(controller.summary().push, PushStatus::Disabled);
        assert!(!transport.calls().iter().any(|c| matches!(c, Call::Push)));
    }

    #[tokio::test]
    async fn test_fetch_failure_marks_pull_failed() {
        let dir = TempDir::new().unwrap();
        let transport = ScriptedTransport::new(dir.path()).failing_fetch("Could not resolve host: github.com");

        let (result, trail, summary) = run(&transport, &SyncPolicy::default(), None).await;
        assert!(matches!(result, Err(SyncError::Transport(_))));
        assert_eq!(trail, vec![RecoveryState::Clean, RecoveryState::PullFailed]);
        assert_eq!(summary.pull, PullStatus::Failed);
        assert!(!transport.calls().iter().any(|c| matches!(c, Call::Merge | Call::Push)));
    }

    #[tokio::test]
    async fn test_merge_error_marks_pull_failed() {
        let dir = TempDir::new().unwrap();
        let transport = ScriptedTransport::new(dir.path())
            .with_fetch(diverged())
            .failing_merge("fatal: refusing to merge unrelated histories");

        let (result, trail, summary) = run(&transport, &SyncPolicy::default(), None).await;
        assert!(matches!(result, Err(SyncError::Transport(_))));
        assert_eq!(summary.pull, PullStatus::Failed);
        assert!(trail.ends_with(&[RecoveryState::Diverged, RecoveryState::PullFailed]));
        assert!(!transport.calls().contains(&Call::Push));
    }

    #[tokio::test]
    async fn test_commit_failure_after_resolution_aborts_merge() {
        let dir = TempDir::new().unwrap();
        let path = PathBuf::from("tasks/task-t1.md");
        let transport = ScriptedTransport::new(dir.path())
            .with_fetch(diverged())
            .with_conflict(&path, &conflicted_status(), Some(LOCAL))
            .failing_commit("error: unable to write index");

        let (result, trail, summary) = run(&transport, &SyncPolicy::default(), None).await;
        assert!(matches!(result, Err(SyncError::Transport(_))));
        assert!(summary.resolved.is_empty());
        assert!(trail.ends_with(&[RecoveryState::Diverged, RecoveryState::Aborted]));

        let calls = transport.calls();
        assert!(calls.contains(&Call::Stage(vec![path.clone()])));
        assert!(calls.contains(&Call::AbortMerge));
        assert!(!calls.contains(&Call::Push));
    }

    #[tokio::test]
    async fn test_pending_merge_resolved_in_preflight() {
        let dir = TempDir::new().unwrap();
        let path = PathBuf::from("tasks/task-t1.md");
        let transport = ScriptedTransport::new(dir.path())
            .with_state(RepoState::MidMerge(vec![path.clone()]))
            .with_conflict(&path, &conflicted_status(), Some(LOCAL));

        let (result, trail, summary) = run(&transport, &SyncPolicy::default(), None).await;
        assert!(result.is_ok(), "{result:?}");
        assert_eq!(trail[0], RecoveryState::PendingMergeResolved);
        assert_eq!(summary.resolved.len(), 1);

        let calls = transport.calls();
        assert!(calls.contains(&Call::Stage(vec![path.clone()])));
        assert!(calls.contains(&Call::Commit("TaskRepo sync: merge remote changes".to_string())));

        let written = std::fs::read_to_string(dir.path().join(&path)).unwrap();
        assert!(written.contains("status: done"));
        assert!(!contains_markers(&written));
        let names: Vec<String> = std::fs::read_dir(dir.path().join("tasks"))
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["task-t1.md".to_string()]);
    }

    #[tokio::test]
    async fn test_auto_commit_leaves_unexpected_files_out() {
        let dir = TempDir::new().unwrap();
        let transport = ScriptedTransport::new(dir.path())
            .without_remote()
            .with_changes(&["tasks/task-a.md", ".task-a.md.swp", "debug.log", "README.md"]);

        let (result, trail, summary) = run(&transport, &SyncPolicy::default(), None).await;
        assert!(result.is_ok());
        assert!(summary.auto_committed);
        assert!(trail.contains(&RecoveryState::AutoCommitted));
        assert_eq!(
            summary.unexpected,
            vec![PathBuf::from(".task-a.md.swp"), PathBuf::from("debug.log")]
        );
        assert_eq!(summary.warnings.len(), 1);
        assert!(summary.warnings[0].contains("*.log (1)"));
        assert!(summary.warnings[0].contains("*.swp (1)"));
        assert!(transport.calls().contains(&Call::CommitPaths(
            vec![PathBuf::from("tasks/task-a.md"), PathBuf::from("README.md")],
            "Auto-commit: TaskRepo sync".to_string()
        )));
    }

    #[tokio::test]
    async fn test_only_unexpected_changes_commit_nothing() {
        let dir = TempDir::new().unwrap();
        let transport = ScriptedTransport::new(dir.path())
            .without_remote()
            .with_changes(&["scratch.txt"]);

        let (result, trail, summary) = run(&transport, &SyncPolicy::default(), None).await;
        assert!(result.is_ok());
        assert!(!summary.auto_committed);
        assert!(!trail.contains(&RecoveryState::AutoCommitted));
        assert!(!transport.calls().iter().any(|c| matches!(c, Call::CommitPaths(..))));
    }

    #[tokio::test]
    async fn test_rejected_push_after_merge_remerges_instead_of_rebasing() {
        let dir = TempDir::new().unwrap();
        let path = PathBuf::from("tasks/task-t1.md");
        let transport = ScriptedTransport::new(dir.path())
            .with_fetch(diverged())
            .with_conflict(&path, &conflicted_status(), Some(LOCAL))
            .with_push(nff())
            .with_push(pushed());

        let (result, trail, summary) = run(&transport, &SyncPolicy::default(), None).await;
        assert!(result.is_ok(), "{result:?}");
        assert_eq!(summary.push, PushStatus::PushedAfterRemerge);
        assert!(trail.ends_with(&[
            RecoveryState::PushRejected,
            RecoveryState::Remerged,
            RecoveryState::Pushed,
        ]));
        assert!(!trail.contains(&RecoveryState::Rebasing));

        let calls = transport.calls();
        assert_eq!(calls.iter().filter(|c| matches!(c, Call::Merge)).count(), 2);
        assert_eq!(calls.iter().filter(|c| matches!(c, Call::Fetch)).count(), 2);
        assert_eq!(calls.iter().filter(|c| matches!(c, Call::Push)).count(), 2);
        assert!(!calls.contains(&Call::Rebase));
    }
}
