use std::time::Instant;

use crate::Project;
use crate::config::Settings;
use crate::core::CancellationToken;
use crate::engine::{BuildReport, Executor};
use crate::error::{BuildError, KilnError, StoreError};
use crate::io::as_overhead;
use crate::snapshot::Snapshotter;
use crate::store::{HistoryStore, OutputFilesRepository, Store};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Created,
    Running,
    Completed,
}

/// One build against a cache directory.
///
/// Opening a session takes the exclusive lock on the cache directory, and
/// dropping it releases the lock. A session runs at most one build.
pub struct BuildSession {
    settings: Settings,
    store: Store,
    state: SessionState,
    cancel: CancellationToken,
}

impl BuildSession {
    pub fn open(settings: Settings) -> Result<Self, KilnError> {
        let cache_dir =
            crate::io::absolute(&settings.cache_dir).map_err(|source| StoreError::Io {
                path: settings.cache_dir.clone(),
                source,
            })?;

        let store = Store::open(&cache_dir)?;
        tracing::debug!("Opened build store at {}", cache_dir);

        Ok(Self {
            settings,
            store,
            state: SessionState::Created,
            cancel: CancellationToken::new(),
        })
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Token to cancel the build from another thread.
    pub fn cancellation(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn history(&self) -> &HistoryStore {
        self.store.history()
    }

    pub fn outputs(&self) -> &OutputFilesRepository {
        self.store.outputs()
    }

    /// Forgets the recorded execution of `identity`, forcing it to execute on
    /// the next build.
    pub fn evict(&self, identity: &str) -> Result<bool, KilnError> {
        let removed = self.store.history().remove(identity)?;
        self.store.history().flush()?;
        Ok(removed)
    }

    /// Builds the project. Failed work items don't make this fail, they are
    /// listed in the report.
    pub fn run(&mut self, project: &Project) -> Result<BuildReport, KilnError> {
        if self.state != SessionState::Created {
            return Err(KilnError::SessionReused);
        }

        self.state = SessionState::Running;
        let result = self.run_project(project);
        self.state = SessionState::Completed;
        result
    }

    fn run_project(&self, project: &Project) -> Result<BuildReport, KilnError> {
        let start = Instant::now();

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.settings.threads)
            .thread_name(|i| format!("kiln-worker-{i}"))
            .build()
            .map_err(BuildError::from)?;

        let executor = Executor::new(&self.store, Snapshotter::new(self.settings.symlinks));
        let report = crate::engine::run_work_parallel(
            project,
            &executor,
            &pool,
            self.settings.fail_fast,
            &self.cancel,
        );

        // Records of every attempted item, cancelled builds included.
        self.store.flush()?;

        tracing::info!(
            "Build complete: {} executed, {} up to date, {} failed {}",
            report.executed().len(),
            report.skipped().len(),
            report.failures().len(),
            as_overhead(start)
        );

        Ok(report)
    }
}
