//! Multi-repository sync sessions.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use futures_util::stream::{self, StreamExt};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::{SyncConfig, SyncPolicy};
use crate::error::SyncError;
use crate::git::GitTransport;
use crate::idcache::{reconcile, IdCacheStore, IdMode, ListingOrder};
use crate::lock::LockRegistry;
use crate::recovery::{DivergenceController, RecoveryContext};
use crate::report::{RepositoryReport, SessionReport};
use crate::resolver::InteractiveResolver;
use crate::store::{LoadReport, RecordStore};
use crate::transport::Transport;

const REPOSITORY_PREFIX: &str = "tasks-";

/// A repository taking part in a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Repository {
    pub name: String,
    pub path: PathBuf,
}

impl Repository {
    pub fn new(name: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            path: path.into(),
        }
    }

    /// Name a repository after its directory, dropping the `tasks-` prefix.
    pub fn from_path(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let dir = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let name = dir.strip_prefix(REPOSITORY_PREFIX).unwrap_or(&dir).to_string();
        Self { name, path }
    }
}

/// Find `tasks-*` repositories directly under `parent`, sorted by name.
pub fn discover_repositories(parent: &Path) -> io::Result<Vec<Repository>> {
    let mut repositories = Vec::new();
    for entry in std::fs::read_dir(parent)? {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().into_owned();
        if !entry.file_type()?.is_dir() {
            continue;
        }
        if let Some(suffix) = name.strip_prefix(REPOSITORY_PREFIX) {
            if !suffix.is_empty() {
                repositories.push(Repository::new(suffix, entry.path()));
            }
        }
    }
    repositories.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(repositories)
}

/// Creates the transport for a repository.
pub trait TransportFactory: Send + Sync {
    fn open(&self, repository: &Repository) -> Box<dyn Transport>;
}

/// Opens a [`GitTransport`] per repository.
#[derive(Debug, Clone)]
pub struct GitTransportFactory {
    binary: String,
}

impl GitTransportFactory {
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }
}

impl TransportFactory for GitTransportFactory {
    fn open(&self, repository: &Repository) -> Box<dyn Transport> {
        Box::new(GitTransport::new(&repository.path).with_binary(&self.binary))
    }
}

/// Runs sync sessions.
pub struct SyncEngine {
    config: SyncConfig,
    factory: Arc<dyn TransportFactory>,
    resolver: Option<Arc<dyn InteractiveResolver>>,
    locks: LockRegistry,
    order: ListingOrder,
    cancel: CancellationToken,
}

impl SyncEngine {
    pub fn new(config: SyncConfig) -> Self {
        let factory = Arc::new(GitTransportFactory::new(config.git_binary.clone()));
        Self {
            config,
            factory,
            resolver: None,
            locks: LockRegistry::new(),
            order: ListingOrder::default(),
            cancel: CancellationToken::new(),
        }
    }

    /// Builder method to replace the transport factory.
    pub fn with_transport_factory(mut self, factory: Arc<dyn TransportFactory>) -> Self {
        self.factory = factory;
        self
    }

    /// Builder method to set the interactive collaborator.
    pub fn with_resolver(mut self, resolver: Arc<dyn InteractiveResolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    /// Builder method to set the listing order used for display ids.
    pub fn with_listing_order(mut self, order: ListingOrder) -> Self {
        self.order = order;
        self
    }

    /// Builder method to share a lock registry with other engines.
    pub fn with_lock_registry(mut self, locks: LockRegistry) -> Self {
        self.locks = locks;
        self
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn locks(&self) -> &LockRegistry {
        &self.locks
    }

    /// Token that cancels repositories not yet started.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Sync every repository. Failures are recorded per repository and
    /// never stop the batch.
    pub async fn sync(&self, repositories: &[Repository], policy: &SyncPolicy) -> SessionReport {
        let started_at = Utc::now();
        info!(
            repositories = repositories.len(),
            max_parallel = self.config.max_parallel,
            strategy = ?policy.strategy,
            "Starting sync session"
        );

        let reports: Vec<RepositoryReport> = stream::iter(repositories)
            .map(|repository| self.sync_one(repository, policy))
            .buffer_unordered(self.config.max_parallel.max(1))
            .collect()
            .await;

        let session = SessionReport::new(started_at, reports);
        info!(
            severity = ?session.severity,
            failed = session.failed().count(),
            "Sync session finished"
        );
        session
    }

    async fn sync_one(&self, repository: &Repository, policy: &SyncPolicy) -> RepositoryReport {
        if self.cancel.is_cancelled() {
            info!(repository = %repository.name, "Session cancelled; skipping repository");
            return RepositoryReport::skipped(&repository.name, &repository.path);
        }

        let started = Instant::now();
        let mut report = RepositoryReport::new(&repository.name, &repository.path);
        let transport = self.factory.open(repository);

        match self.sync_locked(repository, transport.as_ref(), policy, &mut report).await {
            Ok(()) => info!(
                repository = %repository.name,
                pull = ?report.pull,
                push = ?report.push,
                "Repository synced"
            ),
            Err(err) => {
                warn!(repository = %repository.name, error = %err, "Repository sync failed");
                report.fail(&err);
            }
        }

        report.duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
        report.finish();
        report
    }

    async fn sync_locked(
        &self,
        repository: &Repository,
        transport: &dyn Transport,
        policy: &SyncPolicy,
        report: &mut RepositoryReport,
    ) -> Result<(), SyncError> {
        let git_dir = transport.git_dir().await?;
        let _lock = self.locks.try_acquire(&git_dir.join(&self.config.lock_file))?;

        let store = RecordStore::open(&repository.path)?;
        let before = store.snapshot()?;

        let mut controller = DivergenceController::new(RecoveryContext {
            transport,
            config: &self.config,
            policy,
            resolver: self.resolver.as_deref(),
        });
        let result = controller.run().await;
        let (trail, summary) = controller.into_parts();
        report.absorb(trail, summary);
        result?;

        let after = store.snapshot()?;
        report.counts = before.diff(&after);

        let listing = store.list(false)?;
        report.validation = listing.issues.iter().map(Into::into).collect();

        let cache_store = IdCacheStore::new(&git_dir, &self.config.id_cache_file);
        let previous = cache_store.load()?;
        let mode = if policy.rebalance_ids {
            IdMode::Rebalance
        } else {
            IdMode::Stable
        };
        let (cache, assignment) = reconcile(&listing.records, &previous, mode, |a, b| {
            self.order.compare(a, b)
        });
        cache_store.save(&cache)?;
        report.renumbered = assignment.changed;
        Ok(())
    }

    /// Read a repository's records, waiting for any running sync to finish.
    /// Files under `tasks/archive/` are listed only with `include_archived`.
    pub async fn read_snapshot(
        &self,
        repository: &Repository,
        include_archived: bool,
    ) -> Result<LoadReport, SyncError> {
        let transport = self.factory.open(repository);
        let git_dir = transport.git_dir().await?;
        let _lock = self.locks.acquire(&git_dir.join(&self.config.lock_file)).await?;

        let store = RecordStore::open(&repository.path)?;
        let mut listing = store.list(include_archived)?;
        let cache = IdCacheStore::new(&git_dir, &self.config.id_cache_file).load()?;
        for record in &mut listing.records {
            record.display_id = cache.display_id_of(&record.uuid);
        }
        Ok(listing)
    }
}
