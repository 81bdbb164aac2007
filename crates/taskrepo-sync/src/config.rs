//! Sync policy and engine configuration.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tracing::warn;

/// How field conflicts are settled.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MergeStrategy {
    /// Field-level rules; manual-required fields fail the repository.
    #[default]
    Auto,
    /// Every differing field takes the local value.
    PreferLocal,
    /// Every differing field takes the remote value.
    PreferRemote,
    /// Field-level rules, then ask the interactive collaborator.
    Interactive,
}

impl std::str::FromStr for MergeStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "auto" => Ok(Self::Auto),
            "prefer-local" | "local" => Ok(Self::PreferLocal),
            "prefer-remote" | "remote" => Ok(Self::PreferRemote),
            "interactive" => Ok(Self::Interactive),
            other => Err(format!("unknown merge strategy '{other}'")),
        }
    }
}

/// Policy supplied by the caller for one session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SyncPolicy {
    /// Run the field merge engine on conflicting records.
    pub auto_merge: bool,

    /// Conflict strategy.
    pub strategy: MergeStrategy,

    /// Renumber display ids 1..N after a successful sync.
    pub rebalance_ids: bool,
}

impl Default for SyncPolicy {
    fn default() -> Self {
        Self {
            auto_merge: true,
            strategy: MergeStrategy::Auto,
            rebalance_ids: true,
        }
    }
}

/// Engine configuration.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Name of the remote to sync with.
    pub remote: String,

    /// Push local commits after pulling.
    pub push: bool,

    /// Path to the git executable.
    pub git_binary: String,

    /// Maximum repositories processed at the same time.
    pub max_parallel: usize,

    /// Commit message for auto-committed local edits.
    pub auto_commit_message: String,

    /// Commit message for merge resolutions.
    pub merge_commit_message: String,

    /// Identifier cache location, relative to the repository's git directory.
    pub id_cache_file: PathBuf,

    /// Lock file location, relative to the repository's git directory.
    pub lock_file: PathBuf,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            remote: "origin".to_string(),
            push: true,
            git_binary: "git".to_string(),
            max_parallel: 1,
            auto_commit_message: "Auto-commit: TaskRepo sync".to_string(),
            merge_commit_message: "TaskRepo sync: merge remote changes".to_string(),
            id_cache_file: PathBuf::from("taskrepo/id_cache.json"),
            lock_file: PathBuf::from("taskrepo/sync.lock"),
        }
    }
}

impl SyncConfig {
    /// Defaults overlaid with `TASKREPO_*` environment variables.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Some(remote) = env_value("TASKREPO_REMOTE") {
            config.remote = remote;
        }
        if let Some(git) = env_value("TASKREPO_GIT") {
            config.git_binary = git;
        }
        if let Some(raw) = env_value("TASKREPO_MAX_PARALLEL") {
            match raw.parse::<usize>() {
                Ok(n) if n > 0 => config.max_parallel = n,
                Ok(_) => warn!(raw = %raw, "TASKREPO_MAX_PARALLEL must be positive; ignoring"),
                Err(err) => {
                    warn!(raw = %raw, error = %err, "invalid TASKREPO_MAX_PARALLEL; ignoring")
                }
            }
        }
        if let Some(raw) = env_value("TASKREPO_NO_PUSH") {
            match raw.as_str() {
                "1" | "true" | "yes" => config.push = false,
                "0" | "false" | "no" => config.push = true,
                _ => warn!(raw = %raw, "invalid TASKREPO_NO_PUSH; ignoring"),
            }
        }

        config
    }

    /// Builder method to set the remote name.
    pub fn with_remote(mut self, remote: impl Into<String>) -> Self {
        self.remote = remote.into();
        self
    }

    /// Builder method to enable or disable pushing.
    pub fn with_push(mut self, push: bool) -> Self {
        self.push = push;
        self
    }

    /// Builder method to set the worker pool size.
    pub fn with_max_parallel(mut self, n: usize) -> Self {
        self.max_parallel = n.max(1);
        self
    }
}

fn env_value(key: &str) -> Option<String> {
    let raw = std::env::var(key).ok()?;
    let trimmed = raw.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}
