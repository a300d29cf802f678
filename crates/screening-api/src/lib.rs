use std::fmt::Display;
use std::sync::Arc;
use std::time::SystemTime;

use futures::Stream;
use screening_core::{EntitySource, ScreeningOutcome, ScreeningSubject, SubjectInput};
use screening_sources::ListFetcher;
use time::OffsetDateTime;
use tracing::{info, warn};

mod config;
mod error;
mod gateway;
mod health;
mod ingest;
mod mode;
mod refresh;
mod report;
mod worker;

pub use config::{default_upload_tmp_dir, parse_bool_flag, ScreeningConfig, ServiceConfig};
pub use error::{ApiError, ErrorBody, ErrorKind};
pub use gateway::{hit_rate, BulkInput, BulkItem, BulkSummary, ProviderGateway, SkippedRow};
pub use health::{DataFileInfo, DataModeReport, HealthReport, HealthStatus};
pub use ingest::{
    check_content_type, read_rows, sweep_stale, UploadIngestor, UploadRow, ValidatedFile,
    CHUNK_SIZE, REQUIRED_COLUMN, STALE_UPLOAD_AGE,
};
pub use mode::{probe_store, DataMode, ModeSelector, StoreProbe};
pub use refresh::{PublishedIndex, RefreshCoordinator, RefreshReport, SnapshotCell, SnapshotSource};
pub use report::{
    html_escape, render_bulk, render_individual, BulkReportRequest, ReportRequest, ReportResponse,
    ReportScreening, ReportType,
};
pub use worker::WorkerPool;

/// Application context built once by [`AppState::initialize`] and shared by
/// every request handler.
pub struct AppState {
    config: ServiceConfig,
    screening: ScreeningConfig,
    workers: WorkerPool,
    selector: ModeSelector,
    refresher: RefreshCoordinator,
    gateway: ProviderGateway,
    ingestor: UploadIngestor,
    started: SystemTime,
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState")
            .field("mode", &self.selector.resolve())
            .field("workers", &self.workers.size())
            .field("upload_tmp_dir", &self.ingestor.tmp_dir())
            .finish_non_exhaustive()
    }
}

impl AppState {
    /// Validate configuration, read the YAML file and start with the
    /// configured list sources.
    ///
    /// # Errors
    /// Returns [`ApiError::Configuration`] for invalid or missing configuration.
    /// Data-source failures never fail startup.
    pub async fn initialize(config: ServiceConfig) -> Result<Self, ApiError> {
        config.validate()?;
        let screening = ScreeningConfig::load(&config.config_path)?;
        let fetcher = ListFetcher::new(
            screening.sources.clone(),
            config.data_dir.clone(),
            screening.download.clone(),
        );
        Self::initialize_with(config, screening, Arc::new(fetcher)).await
    }

    /// Startup with an explicit list source.
    ///
    /// Order: sweep stale uploads, probe the persistent store once, fix the
    /// mode, then load the first snapshot when serving from memory.
    ///
    /// # Errors
    /// Returns [`ApiError::Configuration`] for invalid configuration, or
    /// [`ApiError::Internal`] if the worker pool fails.
    pub async fn initialize_with(
        config: ServiceConfig,
        screening: ScreeningConfig,
        source: Arc<dyn SnapshotSource>,
    ) -> Result<Self, ApiError> {
        config.validate()?;
        screening.validate()?;
        let workers = WorkerPool::new(config.blocking_workers);

        let tmp_dir = config.upload_tmp_dir.clone();
        let swept = workers.run(move || sweep_stale(&tmp_dir, STALE_UPLOAD_AGE)).await?;
        if swept > 0 {
            info!(removed = swept, "removed stale upload files");
        }

        let probe_config = config.clone();
        let probe = workers.run(move || probe_store(&probe_config)).await?;
        let selector = ModeSelector::from_probe(probe);
        let mode = selector.resolve();

        let cell = Arc::new(SnapshotCell::new());
        let refresher = RefreshCoordinator::new(Arc::clone(&cell), source, workers.clone());
        if mode == DataMode::Xml {
            let report = refresher.load_initial().await?;
            info!(
                generation = report.generation,
                entities = report.total_entities,
                sources = ?report.source_counts,
                "in-memory index ready"
            );
        }

        let gateway = ProviderGateway::new(
            mode,
            selector.database_url().map(str::to_string),
            cell,
            workers.clone(),
            screening.algorithm.clone(),
        );
        let ingestor = UploadIngestor::new(&config, workers.clone());
        info!(
            mode = mode.as_str(),
            auth = config.api_key().is_some(),
            workers = workers.size(),
            "screening service initialized"
        );

        Ok(Self {
            config,
            screening,
            workers,
            selector,
            refresher,
            gateway,
            ingestor,
            started: SystemTime::now(),
        })
    }

    /// Release resources after the server has drained.
    ///
    /// Store connections are per call, so none are held here.
    pub async fn shutdown(&self) {
        self.workers.close();
        let tmp_dir = self.ingestor.tmp_dir().to_path_buf();
        let sweep = tokio::task::spawn_blocking(move || sweep_stale(&tmp_dir, STALE_UPLOAD_AGE));
        match sweep.await {
            Ok(removed) if removed > 0 => info!(removed, "removed leftover upload files"),
            Ok(_) => {}
            Err(err) => warn!(error = %err, "upload cleanup at shutdown failed"),
        }
        info!(mode = self.mode().as_str(), "screening service stopped");
    }

    #[must_use]
    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    #[must_use]
    pub fn mode(&self) -> DataMode {
        self.selector.resolve()
    }

    #[must_use]
    pub fn gateway(&self) -> &ProviderGateway {
        &self.gateway
    }

    #[must_use]
    pub fn snapshot_cell(&self) -> &Arc<SnapshotCell> {
        self.refresher.cell()
    }

    /// Check a request credential against the configured key.
    ///
    /// # Errors
    /// Returns [`ApiError::Unauthenticated`] when the key is required but
    /// absent, [`ApiError::Forbidden`] when it does not match.
    pub fn authorize(&self, provided: Option<&str>) -> Result<(), ApiError> {
        let Some(expected) = self.config.api_key() else {
            return Ok(());
        };
        match provided.map(str::trim).filter(|key| !key.is_empty()) {
            None => Err(ApiError::Unauthenticated),
            Some(key) if constant_time_eq(key.as_bytes(), expected.as_bytes()) => Ok(()),
            Some(_) => Err(ApiError::Forbidden),
        }
    }

    /// # Errors
    /// Returns [`ApiError::Validation`] for invalid input, or the provider error.
    pub async fn screen(&self, input: SubjectInput) -> Result<ScreeningOutcome, ApiError> {
        let subject = ScreeningSubject::new(input)?;
        self.gateway.screen_one(subject).await
    }

    /// Ingest an uploaded CSV and screen each row. The upload file is gone
    /// when this returns, on every path.
    ///
    /// # Errors
    /// Returns the ingestion error or the provider error.
    pub async fn screen_upload<S, B, E>(
        &self,
        body: S,
        content_type: Option<&str>,
    ) -> Result<BulkSummary, ApiError>
    where
        S: Stream<Item = Result<B, E>>,
        B: AsRef<[u8]>,
        E: Display,
    {
        let file = self.ingestor.ingest(body, content_type).await?;
        let summary = self.gateway.screen_bulk(&file).await;
        self.ingestor.discard(file).await;
        summary
    }

    /// # Errors
    /// Returns [`ApiError::RefreshFailed`] when fresh lists cannot be loaded.
    pub async fn refresh(&self) -> Result<RefreshReport, ApiError> {
        self.refresher.refresh().await
    }

    /// Never fails: problems are reported inside the payload.
    pub async fn health(&self) -> HealthReport {
        let mode = self.mode();
        let uptime = health::uptime_seconds(self.started);

        let data_dir = self.config.data_dir.clone();
        let files = match self.workers.run(move || health::scan_data_files(&data_dir)).await {
            Ok(Ok(files)) => files,
            Ok(Err(err)) => {
                warn!(error = %err, "health: cannot scan data directory");
                let message = format!("cannot scan data directory: {err}");
                return HealthReport::failed(mode, uptime, message);
            }
            Err(err) => {
                warn!(error = %err, "health: worker pool failure");
                return HealthReport::failed(mode, uptime, err.to_string());
            }
        };

        let published = self.snapshot_cell().current();
        let list_dates = published.as_ref().map(|p| p.list_dates.clone()).unwrap_or_default();
        let updated = health::last_updated(&self.screening.sources, &list_dates, &files);

        let (status, entities_loaded, error_message) = match self.gateway.entity_count().await {
            Ok(count) => (HealthStatus::Healthy, count, None),
            Err(err) => {
                warn!(error = %err, "health: active provider cannot report entity count");
                (HealthStatus::Degraded, 0, Some(err.body().error))
            }
        };

        HealthReport {
            status,
            data_mode: mode,
            entities_loaded,
            snapshot_generation: published.map(|p| p.index.generation()),
            data_age_days: health::data_age_days(&files, OffsetDateTime::now_utc()),
            data_files: files,
            ofac_last_updated: updated.get(&EntitySource::Ofac).cloned(),
            un_last_updated: updated.get(&EntitySource::Un).cloned(),
            algorithm_version: self.screening.algorithm.version.clone(),
            uptime_seconds: uptime,
            error_message,
        }
    }

    /// Active mode and per-provider entity counts.
    pub async fn data_mode_report(&self) -> DataModeReport {
        let mode = self.mode();
        let database_entities = if mode == DataMode::Database {
            match self.gateway.store_entity_count().await {
                Ok(count) => Some(count),
                Err(err) => {
                    warn!(error = %err, "data-mode: store count failed");
                    None
                }
            }
        } else {
            None
        };

        DataModeReport {
            data_mode: mode,
            database_connected: database_entities.is_some(),
            database_entities,
            xml_entities: self.gateway.snapshot_entity_count(),
            use_database_env: self.config.use_database,
            database_url_set: self.config.database_url().is_some(),
            fallback_reason: self.selector.fallback_reason().map(str::to_string),
            timestamp: health::now_rfc3339(),
        }
    }
}

fn constant_time_eq(left: &[u8], right: &[u8]) -> bool {
    if left.len() != right.len() {
        return false;
    }
    left.iter().zip(right).fold(0_u8, |acc, (a, b)| acc | (a ^ b)) == 0
}
