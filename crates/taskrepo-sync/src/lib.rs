//! TaskRepo Sync Engine
//!
//! Reconciles task repositories with their remotes:
//! - field-level three-way merge of diverged records
//! - recovery of files left with conflict markers
//! - push rejection and divergence recovery (one rebase retry)
//! - stable short display ids across syncs
//!
//! Everything version-control specific sits behind [`Transport`];
//! [`GitTransport`] drives the `git` binary.

pub mod config;
pub mod error;
pub mod git;
pub mod idcache;
pub mod lock;
pub mod markers;
pub mod merge;
pub mod orchestrator;
pub mod recovery;
pub mod report;
pub mod resolver;
pub mod store;
pub mod transport;

#[cfg(test)]
mod testing;

// Re-export commonly used types
pub use config::{MergeStrategy, SyncConfig, SyncPolicy};
pub use error::{Severity, SyncError, TransportError};
pub use git::GitTransport;
pub use idcache::{reconcile, IdCache, IdCacheStore, IdMode, ListingOrder};
pub use markers::{AppliedStrategy, MarkerResolution, MarkerResolver};
pub use merge::{merge, merge_with_policy, Field, FieldDecision, FieldResolution, MergeOutcome, Side};
pub use orchestrator::{discover_repositories, Repository, SyncEngine, TransportFactory};
pub use recovery::{DivergenceController, RecoveryState};
pub use report::{RepositoryOutcome, RepositoryReport, SessionReport};
pub use resolver::{ConflictPrompt, FieldChoice, InteractiveResolver};
pub use store::{RecordStore, Snapshot};
pub use transport::{PushClass, RefFlag, Transport};
