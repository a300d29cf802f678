use std::sync::Arc;
use std::time::Instant;

use screening_core::{
    AlgorithmConfig, MatchRecord, ScreeningId, ScreeningOutcome, ScreeningSubject, SubjectInput,
};
use screening_store_sqlite::{SqliteStore, StoreError, StoreSession};
use serde::Serialize;
use tracing::{debug, info};

use crate::error::ApiError;
use crate::ingest::{read_rows, UploadRow, ValidatedFile};
use crate::mode::DataMode;
use crate::refresh::{PublishedIndex, SnapshotCell};
use crate::worker::WorkerPool;

/// Echo of the CSV columns a bulk row was screened with.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct BulkInput {
    pub nombre: String,
    pub cedula: Option<String>,
    pub pais: Option<String>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct BulkItem {
    pub row: usize,
    pub screening_id: ScreeningId,
    pub input: BulkInput,
    pub is_hit: bool,
    pub hit_count: usize,
    pub matches: Vec<MatchRecord>,
}

/// A data row that never reached the provider because its fields failed validation.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct SkippedRow {
    pub row: usize,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct BulkSummary {
    pub screening_id: ScreeningId,
    pub total_processed: usize,
    pub hits: usize,
    pub hit_rate: String,
    pub results: Vec<BulkItem>,
    pub skipped: Vec<SkippedRow>,
    pub processing_time_ms: u64,
}

/// Screens against whichever provider the startup mode decision selected.
///
/// There is no per-call fallback: a provider that disappears after startup
/// surfaces as [`ApiError::ProviderUnavailable`].
#[derive(Debug, Clone)]
pub struct ProviderGateway {
    mode: DataMode,
    database_url: Option<String>,
    cell: Arc<SnapshotCell>,
    workers: WorkerPool,
    algorithm: Arc<AlgorithmConfig>,
}

impl ProviderGateway {
    #[must_use]
    pub fn new(
        mode: DataMode,
        database_url: Option<String>,
        cell: Arc<SnapshotCell>,
        workers: WorkerPool,
        algorithm: AlgorithmConfig,
    ) -> Self {
        Self { mode, database_url, cell, workers, algorithm: Arc::new(algorithm) }
    }

    #[must_use]
    pub fn mode(&self) -> DataMode {
        self.mode
    }

    /// # Errors
    /// Returns [`ApiError::ProviderUnavailable`] when the active provider cannot
    /// answer, or [`ApiError::Internal`] if the worker pool fails.
    pub async fn screen_one(
        &self,
        subject: ScreeningSubject,
    ) -> Result<ScreeningOutcome, ApiError> {
        let started = Instant::now();
        let algorithm = Arc::clone(&self.algorithm);
        let (matches, generation) = match self.mode {
            DataMode::Xml => {
                let published = self.published()?;
                let generation = published.index.generation();
                let matches = self
                    .workers
                    .run(move || published.index.screen(&subject, &algorithm))
                    .await?;
                (matches, Some(generation))
            }
            DataMode::Database => {
                let url = self.require_database_url()?;
                let matches = self
                    .workers
                    .run(move || {
                        with_session(&url, |session| {
                            session.screen(&subject, &algorithm).map_err(store_error)
                        })
                    })
                    .await??;
                (matches, None)
            }
        };

        let outcome = ScreeningOutcome::from_matches(
            matches,
            &self.algorithm.version,
            generation,
            started.elapsed(),
        );
        debug!(
            screening_id = %outcome.screening_id,
            mode = self.mode.as_str(),
            is_hit = outcome.is_hit,
            matches = outcome.matches.len(),
            "subject screened"
        );
        Ok(outcome)
    }

    /// Screen every row of a validated upload against one provider view: one
    /// snapshot in memory mode, one store session in database mode.
    ///
    /// # Errors
    /// Returns [`ApiError::InvalidCsv`] for unreadable rows, or the provider
    /// errors of [`ProviderGateway::screen_one`].
    pub async fn screen_bulk(&self, file: &ValidatedFile) -> Result<BulkSummary, ApiError> {
        let started = Instant::now();
        let path = file.path().to_path_buf();
        let algorithm = Arc::clone(&self.algorithm);

        let (results, skipped) = match self.mode {
            DataMode::Xml => {
                let published = self.published()?;
                self.workers
                    .run(move || {
                        let rows = read_rows(&path)?;
                        screen_rows(rows, |subject| {
                            Ok(published.index.screen(subject, &algorithm))
                        })
                    })
                    .await??
            }
            DataMode::Database => {
                let url = self.require_database_url()?;
                self.workers
                    .run(move || {
                        let rows = read_rows(&path)?;
                        with_session(&url, |session| {
                            screen_rows(rows, |subject| {
                                session.screen(subject, &algorithm).map_err(store_error)
                            })
                        })
                    })
                    .await??
            }
        };

        let hits = results.iter().filter(|item| item.is_hit).count();
        let summary = BulkSummary {
            screening_id: ScreeningId::new(),
            total_processed: results.len(),
            hits,
            hit_rate: hit_rate(hits, results.len()),
            results,
            skipped,
            processing_time_ms: u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
        };
        info!(
            screening_id = %summary.screening_id,
            mode = self.mode.as_str(),
            total = summary.total_processed,
            hits = summary.hits,
            skipped = summary.skipped.len(),
            "bulk screening completed"
        );
        Ok(summary)
    }

    /// Entity count of the active provider.
    ///
    /// # Errors
    /// Returns [`ApiError::ProviderUnavailable`] when the provider cannot report.
    pub async fn entity_count(&self) -> Result<u64, ApiError> {
        match self.mode {
            DataMode::Xml => self
                .snapshot_entity_count()
                .map(|count| u64::try_from(count).unwrap_or(u64::MAX))
                .ok_or_else(not_loaded),
            DataMode::Database => self.store_entity_count().await,
        }
    }

    /// Entities in the current in-memory snapshot, if one is published.
    #[must_use]
    pub fn snapshot_entity_count(&self) -> Option<usize> {
        self.cell.current().map(|published| published.index.len())
    }

    /// # Errors
    /// Returns [`ApiError::ProviderUnavailable`] outside database mode or when
    /// the store cannot be reached.
    pub async fn store_entity_count(&self) -> Result<u64, ApiError> {
        let url = self.require_database_url()?;
        self.workers
            .run(move || {
                let store = SqliteStore::connect(&url)?;
                store.entity_count()
            })
            .await?
            .map_err(store_error)
    }

    fn published(&self) -> Result<Arc<PublishedIndex>, ApiError> {
        self.cell.current().ok_or_else(not_loaded)
    }

    fn require_database_url(&self) -> Result<String, ApiError> {
        self.database_url.clone().ok_or_else(|| {
            ApiError::ProviderUnavailable("persistent store is not active".to_string())
        })
    }
}

fn not_loaded() -> ApiError {
    ApiError::ProviderUnavailable("in-memory index is not loaded".to_string())
}

/// Open a connection and one read session, run `work`, then close both.
///
/// The session rolls back on drop, so an error inside `work` still releases it.
fn with_session<T>(
    url: &str,
    work: impl FnOnce(&StoreSession<'_>) -> Result<T, ApiError>,
) -> Result<T, ApiError> {
    let mut store = SqliteStore::connect(url).map_err(store_error)?;
    let session = store.session().map_err(store_error)?;
    let value = work(&session)?;
    session.finish().map_err(store_error)?;
    Ok(value)
}

fn store_error(err: StoreError) -> ApiError {
    match err {
        StoreError::Payload { .. } => ApiError::Internal(err.to_string()),
        other => ApiError::ProviderUnavailable(other.to_string()),
    }
}

type BulkRows = (Vec<BulkItem>, Vec<SkippedRow>);

fn screen_rows(
    rows: Vec<UploadRow>,
    mut screen: impl FnMut(&ScreeningSubject) -> Result<Vec<MatchRecord>, ApiError>,
) -> Result<BulkRows, ApiError> {
    let mut results = Vec::with_capacity(rows.len());
    let mut skipped = Vec::new();
    for row in rows {
        let input = BulkInput { nombre: row.nombre, cedula: row.cedula, pais: row.pais };
        let subject = match ScreeningSubject::new(SubjectInput {
            name: input.nombre.clone(),
            document_number: input.cedula.clone(),
            country: input.pais.clone(),
            ..SubjectInput::default()
        }) {
            Ok(subject) => subject,
            Err(err) => {
                skipped.push(SkippedRow { row: row.row, reason: err.to_string() });
                continue;
            }
        };

        let matches = screen(&subject)?;
        let hit_count = matches.iter().filter(|m| m.recommendation.counts_as_hit()).count();
        results.push(BulkItem {
            row: row.row,
            screening_id: ScreeningId::new(),
            input,
            is_hit: hit_count > 0,
            hit_count,
            matches,
        });
    }
    Ok((results, skipped))
}

/// Percentage with one decimal, e.g. `12.5%`.
#[must_use]
pub fn hit_rate(hits: usize, total: usize) -> String {
    if total == 0 {
        return "0.0%".to_string();
    }
    let hits = f64::from(u32::try_from(hits).unwrap_or(u32::MAX));
    let total = f64::from(u32::try_from(total).unwrap_or(u32::MAX));
    format!("{:.1}%", hits / total * 100.0)
}

#[cfg(test)]
mod tests {
    use std::convert::Infallible;
    use std::path::Path;

    use screening_core::{Entity, EntitySource, EntityType, IdentityDocument};
    use screening_sources::LoadedEntities;

    use super::*;
    use crate::config::ServiceConfig;
    use crate::ingest::UploadIngestor;
    use crate::refresh::{RefreshCoordinator, SnapshotSource};

    fn entity(id: &str, name: &str, document: Option<&str>) -> Entity {
        Entity {
            id: id.to_string(),
            source: EntitySource::Ofac,
            entity_type: EntityType::Individual,
            name: name.to_string(),
            all_names: vec![name.to_string()],
            aliases: Vec::new(),
            first_name: None,
            last_name: None,
            countries: Vec::new(),
            identity_documents: document
                .map(|number| IdentityDocument {
                    doc_type: Some("Passport".to_string()),
                    number: number.to_string(),
                    country: None,
                })
                .into_iter()
                .collect(),
            program: Some("SDGT".to_string()),
            date_of_birth: None,
            nationality: None,
        }
    }

    fn fixture() -> Vec<Entity> {
        vec![
            entity("100", "Nicolas Maduro Moros", Some("V5892464")),
            entity("200", "Banco Nacional de Cuba", None),
        ]
    }

    struct FixedSource;

    impl SnapshotSource for FixedSource {
        fn load_startup(&self) -> LoadedEntities {
            let mut loaded = LoadedEntities::default();
            for entity in fixture() {
                *loaded.source_counts.entry(entity.source).or_default() += 1;
                loaded.entities.push(entity);
            }
            loaded
        }

        fn load_latest(&self) -> Result<LoadedEntities, screening_sources::SourceError> {
            Ok(self.load_startup())
        }
    }

    async fn xml_gateway() -> Result<ProviderGateway, ApiError> {
        let workers = WorkerPool::new(2);
        let cell = Arc::new(SnapshotCell::new());
        RefreshCoordinator::new(Arc::clone(&cell), Arc::new(FixedSource), workers.clone())
            .load_initial()
            .await?;
        Ok(ProviderGateway::new(DataMode::Xml, None, cell, workers, AlgorithmConfig::default()))
    }

    fn database_gateway(db_path: &Path, workers: WorkerPool) -> ProviderGateway {
        ProviderGateway::new(
            DataMode::Database,
            Some(format!("sqlite://{}", db_path.display())),
            Arc::new(SnapshotCell::new()),
            workers,
            AlgorithmConfig::default(),
        )
    }

    async fn uploaded(
        dir: &Path,
        workers: WorkerPool,
        csv: &str,
    ) -> Result<(UploadIngestor, ValidatedFile), ApiError> {
        let config = ServiceConfig {
            upload_tmp_dir: dir.join("uploads"),
            max_upload_size_mb: 1,
            ..ServiceConfig::default()
        };
        let ingestor = UploadIngestor::new(&config, workers);
        let body = futures::stream::iter(vec![Ok::<_, Infallible>(csv.as_bytes().to_vec())]);
        let file = ingestor.ingest(body, Some("text/csv")).await?;
        Ok((ingestor, file))
    }

    #[test]
    fn hit_rate_formats_one_decimal() {
        assert_eq!(hit_rate(0, 0), "0.0%");
        assert_eq!(hit_rate(1, 8), "12.5%");
        assert_eq!(hit_rate(2, 3), "66.7%");
    }

    #[tokio::test]
    async fn xml_mode_screens_hit_and_clear() -> Result<(), Box<dyn std::error::Error>> {
        let gateway = xml_gateway().await?;

        let hit = gateway.screen_one(ScreeningSubject::named("Nicolas Maduro Moros")?).await?;
        assert!(hit.is_hit);
        assert_eq!(hit.snapshot_generation, Some(1));
        assert!(hit.matches.iter().all(|m| m.confidence.is_bounded()));

        let clear = gateway.screen_one(ScreeningSubject::named("Maria Fernanda Lopez")?).await?;
        assert!(!clear.is_hit);
        assert!(clear.matches.is_empty());
        assert_eq!(gateway.entity_count().await?, 2);
        Ok(())
    }

    #[tokio::test]
    async fn xml_mode_without_snapshot_is_unavailable() -> Result<(), Box<dyn std::error::Error>> {
        let gateway = ProviderGateway::new(
            DataMode::Xml,
            None,
            Arc::new(SnapshotCell::new()),
            WorkerPool::new(1),
            AlgorithmConfig::default(),
        );
        let result = gateway.screen_one(ScreeningSubject::named("Juan Perez")?).await;
        assert!(matches!(result, Err(ApiError::ProviderUnavailable(_))));
        assert!(matches!(gateway.entity_count().await, Err(ApiError::ProviderUnavailable(_))));
        Ok(())
    }

    #[tokio::test]
    async fn database_mode_does_not_fall_back_when_store_disappears(
    ) -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempfile::tempdir()?;
        let db_path = dir.path().join("gone.db");
        let gateway = ProviderGateway::new(
            DataMode::Database,
            Some(format!("sqlite://{}", db_path.display())),
            Arc::new(SnapshotCell::new()),
            WorkerPool::new(1),
            AlgorithmConfig::default(),
        );
        let result = gateway.screen_one(ScreeningSubject::named("Juan Perez")?).await;
        assert!(matches!(result, Err(ApiError::ProviderUnavailable(_))));
        Ok(())
    }

    #[tokio::test]
    async fn database_mode_matches_in_memory_results() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempfile::tempdir()?;
        let db_path = dir.path().join("screening.db");
        let mut store = SqliteStore::open(&db_path)?;
        store.migrate()?;
        store.replace_entities(&fixture())?;
        drop(store);

        let gateway = ProviderGateway::new(
            DataMode::Database,
            Some(db_path.display().to_string()),
            Arc::new(SnapshotCell::new()),
            WorkerPool::new(2),
            AlgorithmConfig::default(),
        );
        let outcome = gateway.screen_one(ScreeningSubject::named("Banco Nacional de Cuba")?).await?;
        assert!(outcome.is_hit);
        assert_eq!(outcome.snapshot_generation, None);
        assert_eq!(gateway.entity_count().await?, 2);
        Ok(())
    }

    #[tokio::test]
    async fn database_mode_bulk_screens_rows_and_releases_session(
    ) -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempfile::tempdir()?;
        let db_path = dir.path().join("screening.db");
        let mut store = SqliteStore::open(&db_path)?;
        store.migrate()?;
        store.replace_entities(&fixture())?;
        drop(store);

        let workers = WorkerPool::new(2);
        let gateway = database_gateway(&db_path, workers.clone());
        let csv = "nombre,cedula,pais\n\
                   Nicolas Maduro Moros,V5892464,VE\n\
                   Maria Fernanda Lopez,,VE\n\
                   Banco Nacional de Cuba,,CU\n";
        let (ingestor, file) = uploaded(dir.path(), workers, csv).await?;

        let summary = gateway.screen_bulk(&file).await?;
        ingestor.discard(file).await;
        assert_eq!(summary.total_processed, 3);
        assert_eq!(summary.hits, 2);
        assert_eq!(summary.hit_rate, "66.7%");
        assert!(summary.results[0].is_hit);
        assert!(!summary.results[1].is_hit);
        assert!(summary.results[2].is_hit);
        assert!(summary.skipped.is_empty());

        let mut writer = SqliteStore::open(&db_path)?;
        let replaced = writer.replace_entities(&fixture()[..1])?;
        assert_eq!(replaced.imported_entities, 1);
        drop(writer);
        assert_eq!(gateway.entity_count().await?, 1);
        Ok(())
    }

    #[tokio::test]
    async fn database_mode_bulk_without_store_is_unavailable(
    ) -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempfile::tempdir()?;
        let workers = WorkerPool::new(1);
        let gateway = database_gateway(&dir.path().join("gone.db"), workers.clone());
        let (ingestor, file) = uploaded(dir.path(), workers, "nombre\nJuan Perez\n").await?;

        let result = gateway.screen_bulk(&file).await;
        ingestor.discard(file).await;
        assert!(matches!(result, Err(ApiError::ProviderUnavailable(_))));
        assert!(!dir.path().join("gone.db").exists());
        Ok(())
    }

    #[test]
    fn invalid_rows_are_skipped_not_fatal() -> Result<(), ApiError> {
        let rows = vec![
            UploadRow { row: 1, nombre: String::new(), cedula: None, pais: None },
            UploadRow { row: 2, nombre: "Juan Perez".to_string(), cedula: None, pais: None },
        ];
        let (results, skipped) = screen_rows(rows, |_| Ok(Vec::new()))?;
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].row, 2);
        assert_eq!(skipped.len(), 1);
        assert_eq!(skipped[0].row, 1);
        Ok(())
    }
}
