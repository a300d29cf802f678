use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use arc_swap::ArcSwapOption;
use screening_core::{EntitySource, IndexSnapshot};
use screening_sources::{ListFetcher, LoadedEntities, SourceError};
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::error::ApiError;
use crate::worker::WorkerPool;

/// Where snapshots come from. Implementations block.
pub trait SnapshotSource: Send + Sync {
    /// Startup load: latest lists with cached fallback; never fails.
    fn load_startup(&self) -> LoadedEntities;

    /// Strict load used by an explicit refresh.
    ///
    /// # Errors
    /// Returns the download or parse failure.
    fn load_latest(&self) -> Result<LoadedEntities, SourceError>;
}

impl SnapshotSource for ListFetcher {
    fn load_startup(&self) -> LoadedEntities {
        self.load_latest_or_cached()
    }

    fn load_latest(&self) -> Result<LoadedEntities, SourceError> {
        self.fetch_latest()
    }
}

/// A built index plus the list metadata it was built from.
#[derive(Debug)]
pub struct PublishedIndex {
    pub index: IndexSnapshot,
    pub source_counts: BTreeMap<EntitySource, usize>,
    pub list_dates: BTreeMap<EntitySource, String>,
}

impl PublishedIndex {
    #[must_use]
    pub fn build(generation: u64, loaded: LoadedEntities) -> Self {
        Self {
            source_counts: loaded.source_counts,
            list_dates: loaded.published,
            index: IndexSnapshot::build(generation, loaded.entities),
        }
    }
}

/// The single current snapshot. Readers take one `Arc` per operation.
#[derive(Debug, Default)]
pub struct SnapshotCell {
    current: ArcSwapOption<PublishedIndex>,
}

impl SnapshotCell {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn current(&self) -> Option<Arc<PublishedIndex>> {
        self.current.load_full()
    }

    #[must_use]
    pub fn generation(&self) -> Option<u64> {
        self.current.load_full().map(|published| published.index.generation())
    }

    fn publish(&self, published: Arc<PublishedIndex>) {
        self.current.store(Some(published));
    }
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct RefreshReport {
    pub success: bool,
    pub generation: u64,
    pub source_counts: BTreeMap<EntitySource, usize>,
    pub total_entities: usize,
    pub validation_errors: Vec<String>,
    pub validation_warnings: Vec<String>,
    pub processing_time_ms: u64,
}

/// Owns the in-memory index lifecycle: load, build, publish.
pub struct RefreshCoordinator {
    cell: Arc<SnapshotCell>,
    source: Arc<dyn SnapshotSource>,
    workers: WorkerPool,
    /// Guards the last published generation; held for a whole refresh.
    last_generation: Mutex<u64>,
}

impl RefreshCoordinator {
    #[must_use]
    pub fn new(
        cell: Arc<SnapshotCell>,
        source: Arc<dyn SnapshotSource>,
        workers: WorkerPool,
    ) -> Self {
        Self { cell, source, workers, last_generation: Mutex::new(0) }
    }

    #[must_use]
    pub fn cell(&self) -> &Arc<SnapshotCell> {
        &self.cell
    }

    /// Load the first snapshot at startup, falling back to cached lists and
    /// then to an empty index.
    ///
    /// # Errors
    /// Returns [`ApiError::Internal`] only if the worker pool fails.
    pub async fn load_initial(&self) -> Result<RefreshReport, ApiError> {
        let started = Instant::now();
        let mut last = self.last_generation.lock().await;

        let source = Arc::clone(&self.source);
        let loaded = self.workers.run(move || source.load_startup()).await?;
        if loaded.total() == 0 {
            warn!("no sanctions entities available at startup; serving an empty index");
        }

        let report = self.build_and_publish(&mut last, loaded, started).await?;
        for warning in &report.validation_warnings {
            warn!(warning = %warning, "startup list warning");
        }
        Ok(report)
    }

    /// Download and parse fresh lists, then atomically replace the snapshot.
    ///
    /// Concurrent calls run one at a time. On failure the published snapshot
    /// is left untouched.
    ///
    /// # Errors
    /// Returns [`ApiError::RefreshFailed`] when the lists cannot be loaded.
    pub async fn refresh(&self) -> Result<RefreshReport, ApiError> {
        let started = Instant::now();
        let mut last = self.last_generation.lock().await;

        let source = Arc::clone(&self.source);
        let loaded = match self.workers.run(move || source.load_latest()).await? {
            Ok(loaded) => loaded,
            Err(err) => {
                warn!(error = %err, "refresh failed; keeping current snapshot");
                return Err(self.refresh_failed(err.to_string(), vec![err.to_string()]));
            }
        };
        if loaded.total() == 0 {
            return Err(self.refresh_failed(
                "no entities loaded".to_string(),
                loaded.report.errors.clone(),
            ));
        }

        self.build_and_publish(&mut last, loaded, started).await
    }

    async fn build_and_publish(
        &self,
        last: &mut u64,
        loaded: LoadedEntities,
        started: Instant,
    ) -> Result<RefreshReport, ApiError> {
        let generation = *last + 1;
        let total_entities = loaded.total();
        let source_counts = loaded.source_counts.clone();
        let validation = loaded.report.clone();

        let published =
            self.workers.run(move || PublishedIndex::build(generation, loaded)).await?;
        self.cell.publish(Arc::new(published));
        *last = generation;

        info!(
            generation,
            total_entities,
            errors = validation.errors.len(),
            warnings = validation.warnings.len(),
            "published sanctions snapshot"
        );
        Ok(RefreshReport {
            success: validation.errors.is_empty(),
            generation,
            source_counts,
            total_entities,
            validation_errors: validation.errors,
            validation_warnings: validation.warnings,
            processing_time_ms: u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
        })
    }

    fn refresh_failed(&self, message: String, validation_errors: Vec<String>) -> ApiError {
        ApiError::RefreshFailed {
            message,
            validation_errors,
            active_generation: self.cell.generation(),
        }
    }
}
