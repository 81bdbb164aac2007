//! [`Transport`] backed by the `git` command line.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, info};

use crate::error::TransportError;
use crate::transport::{
    FetchStatus, MergeAttempt, PushReport, RebaseAttempt, RefFlag, RefUpdate, RepoState, Transport,
};

/// Captured result of one git invocation.
#[derive(Debug)]
struct GitOutput {
    code: i32,
    stdout: String,
    stderr: String,
}

impl GitOutput {
    fn success(&self) -> bool {
        self.code == 0
    }
}

/// Runs `git -C <workdir> ...`.
#[derive(Debug, Clone)]
pub struct GitTransport {
    workdir: PathBuf,
    binary: String,
}

impl GitTransport {
    pub fn new(workdir: impl Into<PathBuf>) -> Self {
        Self {
            workdir: workdir.into(),
            binary: "git".to_string(),
        }
    }

    /// Builder method to use a different git executable.
    pub fn with_binary(mut self, binary: impl Into<String>) -> Self {
        self.binary = binary.into();
        self
    }

    async fn run(&self, args: &[&str]) -> Result<GitOutput, TransportError> {
        let mut cmd = Command::new(&self.binary);
        cmd.arg("-C").arg(&self.workdir).args(args);
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .env("GIT_TERMINAL_PROMPT", "0")
            .env("LC_ALL", "C");

        debug!(workdir = %self.workdir.display(), ?args, "Running git");
        let output = cmd.output().await?;

        Ok(GitOutput {
            code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        })
    }

    /// Run and require success; returns stdout.
    async fn git(&self, args: &[&str]) -> Result<String, TransportError> {
        let output = self.run(args).await?;
        if output.success() {
            Ok(output.stdout)
        } else {
            Err(command_error(args, output))
        }
    }

    async fn current_branch(&self) -> Result<String, TransportError> {
        let branch = self.git(&["rev-parse", "--abbrev-ref", "HEAD"]).await?;
        let branch = branch.trim();
        if branch.is_empty() || branch == "HEAD" {
            return Err(TransportError::UnexpectedOutput {
                command: "rev-parse --abbrev-ref HEAD".to_string(),
                output: "detached HEAD".to_string(),
            });
        }
        Ok(branch.to_string())
    }

    async fn remote_ref(&self, remote: &str) -> Result<String, TransportError> {
        Ok(format!("{remote}/{}", self.current_branch().await?))
    }

    async fn path_exists_in_git_dir(&self, name: &str) -> Result<bool, TransportError> {
        let dir = self.git_dir().await?;
        Ok(tokio::fs::try_exists(dir.join(name)).await.unwrap_or(false))
    }

    async fn unmerged(&self) -> Result<Vec<PathBuf>, TransportError> {
        let out = self.git(&["diff", "--name-only", "--diff-filter=U"]).await?;
        Ok(out.lines().filter(|l| !l.is_empty()).map(PathBuf::from).collect())
    }
}

fn command_error(args: &[&str], output: GitOutput) -> TransportError {
    TransportError::Command {
        command: args.first().copied().unwrap_or_default().to_string(),
        code: output.code,
        stderr: if output.stderr.is_empty() {
            output.stdout.trim().to_string()
        } else {
            output.stderr
        },
    }
}

/// Parse `git push --porcelain` output.
pub fn parse_push_porcelain(stdout: &str) -> Vec<RefUpdate> {
    let mut updates = Vec::new();
    for line in stdout.lines() {
        let mut parts = line.splitn(3, '\t');
        let (Some(flag), Some(refs), summary) = (parts.next(), parts.next(), parts.next()) else {
            continue;
        };
        let summary = summary.unwrap_or_default().trim();
        let flag = match flag {
            " " => RefFlag::FastForward,
            "+" => RefFlag::Forced,
            "-" => RefFlag::Deleted,
            "*" => RefFlag::New,
            "=" => RefFlag::UpToDate,
            "!" if summary.starts_with("[remote rejected]") => RefFlag::RemoteRejected,
            "!" if summary.starts_with("[remote failure]") => RefFlag::RemoteFailure,
            "!" if summary.contains("non-fast-forward") || summary.contains("fetch first") => {
                RefFlag::RejectedNonFastForward
            }
            "!" => RefFlag::Error,
            _ => continue,
        };
        let (local_ref, remote_ref) = refs.split_once(':').unwrap_or((refs, refs));
        updates.push(RefUpdate::new(local_ref, remote_ref, flag).with_summary(summary));
    }
    updates
}

/// Parse `git status --porcelain=v1 -z`. Renames and copies contribute
/// both their new and original path.
fn parse_status_z(out: &str) -> Vec<PathBuf> {
    let mut paths = Vec::new();
    let mut entries = out.split('\0').filter(|e| !e.is_empty());
    while let Some(entry) = entries.next() {
        let (Some(code), Some(path)) = (entry.get(..2), entry.get(3..)) else {
            continue;
        };
        paths.push(PathBuf::from(path));
        if code.starts_with(['R', 'C']) {
            if let Some(source) = entries.next() {
                paths.push(PathBuf::from(source));
            }
        }
    }
    paths
}

/// Parse `git rev-list --left-right --count A...B`.
fn parse_left_right(out: &str) -> Option<(usize, usize)> {
    let mut counts = out.split_whitespace().map(str::parse::<usize>);
    match (counts.next(), counts.next()) {
        (Some(Ok(ahead)), Some(Ok(behind))) => Some((ahead, behind)),
        _ => None,
    }
}

#[async_trait]
impl Transport for GitTransport {
    fn workdir(&self) -> &Path {
        &self.workdir
    }

    async fn git_dir(&self) -> Result<PathBuf, TransportError> {
        let out = self.git(&["rev-parse", "--absolute-git-dir"]).await?;
        Ok(PathBuf::from(out.trim()))
    }

    async fn repo_state(&self) -> Result<RepoState, TransportError> {
        if self.path_exists_in_git_dir("rebase-merge").await?
            || self.path_exists_in_git_dir("rebase-apply").await?
        {
            return Ok(RepoState::MidRebase);
        }
        let unmerged = self.unmerged().await?;
        if self.path_exists_in_git_dir("MERGE_HEAD").await? {
            return Ok(RepoState::MidMerge(unmerged));
        }
        if !unmerged.is_empty() {
            return Ok(RepoState::Conflicted(unmerged));
        }
        Ok(RepoState::Clean)
    }

    async fn changed_files(&self) -> Result<Vec<PathBuf>, TransportError> {
        let out = self
            .git(&["status", "--porcelain=v1", "-z", "--untracked-files=all"])
            .await?;
        Ok(parse_status_z(&out))
    }

    async fn commit_paths(&self, paths: &[PathBuf], message: &str) -> Result<(), TransportError> {
        if paths.is_empty() {
            return Ok(());
        }
        let pathspec: Vec<String> = paths.iter().map(|p| p.display().to_string()).collect();

        let mut add = vec!["add", "-A", "--"];
        add.extend(pathspec.iter().map(String::as_str));
        self.git(&add).await?;

        let mut commit = vec!["commit", "-m", message, "--"];
        commit.extend(pathspec.iter().map(String::as_str));
        self.git(&commit).await?;
        info!(workdir = %self.workdir.display(), files = paths.len(), "Committed local changes");
        Ok(())
    }

    async fn has_remote(&self, remote: &str) -> Result<bool, TransportError> {
        let out = self.git(&["remote"]).await?;
        Ok(out.lines().any(|l| l.trim() == remote))
    }

    async fn fetch(&self, remote: &str) -> Result<FetchStatus, TransportError> {
        self.git(&["fetch", "--prune", remote]).await?;

        let remote_ref = self.remote_ref(remote).await?;
        let exists = self
            .run(&["rev-parse", "--verify", "--quiet", &remote_ref])
            .await?
            .success();
        if !exists {
            let out = self.git(&["rev-list", "--count", "HEAD"]).await?;
            return Ok(FetchStatus {
                ahead: out.trim().parse().unwrap_or(0),
                behind: 0,
                remote_branch: false,
            });
        }

        let range = format!("HEAD...{remote_ref}");
        let out = self.git(&["rev-list", "--left-right", "--count", &range]).await?;
        let (ahead, behind) = parse_left_right(&out).ok_or_else(|| TransportError::UnexpectedOutput {
            command: "rev-list --left-right --count".to_string(),
            output: out.trim().to_string(),
        })?;
        Ok(FetchStatus {
            ahead,
            behind,
            remote_branch: true,
        })
    }

    async fn fast_forward(&self, remote: &str) -> Result<(), TransportError> {
        let remote_ref = self.remote_ref(remote).await?;
        self.git(&["merge", "--ff-only", &remote_ref]).await?;
        Ok(())
    }

    async fn merge_remote(&self, remote: &str, message: &str) -> Result<MergeAttempt, TransportError> {
        let remote_ref = self.remote_ref(remote).await?;
        let args = ["merge", "--no-ff", "-m", message, remote_ref.as_str()];
        let output = self.run(&args).await?;
        if output.success() {
            return Ok(MergeAttempt::Merged);
        }
        let files = self.unmerged().await?;
        if files.is_empty() {
            return Err(command_error(&args, output));
        }
        Ok(MergeAttempt::Conflicted(files))
    }

    async fn read_base(&self, path: &Path) -> Result<Option<String>, TransportError> {
        let object = format!(":1:{}", path.display());
        let output = self.run(&["show", &object]).await?;
        Ok(output.success().then_some(output.stdout))
    }

    async fn stage(&self, paths: &[PathBuf]) -> Result<(), TransportError> {
        if paths.is_empty() {
            return Ok(());
        }
        let mut args = vec!["add".to_string(), "--".to_string()];
        args.extend(paths.iter().map(|p| p.display().to_string()));
        let args: Vec<&str> = args.iter().map(String::as_str).collect();
        self.git(&args).await?;
        Ok(())
    }

    async fn commit(&self, message: &str) -> Result<(), TransportError> {
        self.git(&["commit", "--no-edit", "-m", message]).await?;
        Ok(())
    }

    async fn abort_merge(&self) -> Result<(), TransportError> {
        self.git(&["merge", "--abort"]).await?;
        Ok(())
    }

    async fn push(&self, remote: &str) -> Result<PushReport, TransportError> {
        let output = self
            .run(&["push", "--porcelain", "--set-upstream", remote, "HEAD"])
            .await?;
        let mut updates = parse_push_porcelain(&output.stdout);
        if !output.success() {
            match updates.first_mut() {
                Some(update) => {
                    if !update.flags.contains(&RefFlag::Error) {
                        update.flags.push(RefFlag::Error);
                    }
                }
                None => updates.push(
                    RefUpdate::new("HEAD", remote, RefFlag::Error).with_summary(output.stderr),
                ),
            }
        }
        Ok(PushReport::new(updates))
    }

    async fn rebase_onto_remote(&self, remote: &str) -> Result<RebaseAttempt, TransportError> {
        let remote_ref = self.remote_ref(remote).await?;
        let args = ["rebase", remote_ref.as_str()];
        let output = self.run(&args).await?;
        if output.success() {
            return Ok(RebaseAttempt::Rebased);
        }
        let files = self.unmerged().await?;
        if files.is_empty() && !self.path_exists_in_git_dir("rebase-merge").await? {
            return Err(command_error(&args, output));
        }
        Ok(RebaseAttempt::Conflicted(files))
    }

    async fn abort_rebase(&self) -> Result<(), TransportError> {
        self.git(&["rebase", "--abort"]).await?;
        Ok(())
    }
}
