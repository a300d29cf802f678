// Test IDs: TAPI-001..TAPI-010
use std::convert::Infallible;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use anyhow::{bail, Result};
use futures::stream;
use screening_api::{
    ApiError, AppState, DataMode, HealthStatus, ScreeningConfig, ServiceConfig, SnapshotSource,
};
use screening_core::{Entity, EntitySource, EntityType, IdentityDocument, SubjectInput};
use screening_sources::{LoadOrigin, LoadedEntities, ParsedList, SourceError, ValidationReport};
use screening_store_sqlite::SqliteStore;

fn entity(source: EntitySource, id: &str, name: &str, document: Option<&str>) -> Entity {
    Entity {
        id: id.to_string(),
        source,
        entity_type: EntityType::Individual,
        name: name.to_string(),
        all_names: vec![name.to_string()],
        aliases: Vec::new(),
        first_name: None,
        last_name: None,
        countries: vec!["Venezuela".to_string()],
        identity_documents: document
            .map(|number| IdentityDocument {
                doc_type: Some("Cedula".to_string()),
                number: number.to_string(),
                country: None,
            })
            .into_iter()
            .collect(),
        program: Some("VENEZUELA-EO13692".to_string()),
        date_of_birth: None,
        nationality: None,
    }
}

fn lists(extra: usize) -> LoadedEntities {
    let mut ofac = vec![
        entity(EntitySource::Ofac, "9001", "Diosdado Cabello Rondon", Some("V-8370825")),
        entity(EntitySource::Ofac, "9002", "Tareck Zaidan El Aissami Maddah", None),
    ];
    ofac.extend((0..extra).map(|n| {
        entity(EntitySource::Ofac, &format!("x{n}"), &format!("Refresh Person {n}"), None)
    }));
    let un = vec![entity(EntitySource::Un, "QDi.001", "Abdul Rahman Yasin", None)];

    let mut loaded = LoadedEntities::default();
    for (source, entities, published) in
        [(EntitySource::Ofac, ofac, "10/01/2026"), (EntitySource::Un, un, "2026-10-01")]
    {
        loaded.push(
            ParsedList {
                source,
                entities,
                published: Some(published.to_string()),
                report: ValidationReport::default(),
            },
            LoadOrigin::Downloaded,
        );
    }
    loaded
}

/// Every strict load adds one synthetic entity so generations are distinguishable.
struct FixtureSource {
    refreshes: AtomicUsize,
}

impl SnapshotSource for FixtureSource {
    fn load_startup(&self) -> LoadedEntities {
        lists(0)
    }

    fn load_latest(&self) -> Result<LoadedEntities, SourceError> {
        let call = self.refreshes.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(lists(call))
    }
}

fn named(name: &str) -> SubjectInput {
    SubjectInput { name: name.to_string(), ..SubjectInput::default() }
}

fn scratch(name: &str) -> PathBuf {
    std::env::temp_dir().join(format!("screening-api-{name}-{}", ulid::Ulid::new()))
}

fn config(upload_dir: &Path) -> ServiceConfig {
    ServiceConfig {
        max_upload_size_mb: 1,
        upload_tmp_dir: upload_dir.to_path_buf(),
        data_dir: scratch("data"),
        ..ServiceConfig::default()
    }
}

async fn start(config: ServiceConfig) -> Result<AppState> {
    let source = Arc::new(FixtureSource { refreshes: AtomicUsize::new(0) });
    Ok(AppState::initialize_with(config, ScreeningConfig::default(), source).await?)
}

fn csv_body(raw: &str) -> impl futures::Stream<Item = Result<Vec<u8>, Infallible>> {
    stream::iter(vec![Ok(raw.as_bytes().to_vec())])
}

fn files_in(dir: &Path) -> usize {
    std::fs::read_dir(dir).map(|entries| entries.flatten().count()).unwrap_or(0)
}

#[tokio::test]
async fn screen_round_trip_hit_and_clear() -> Result<()> {
    let upload_dir = scratch("uploads");
    let state = start(config(&upload_dir)).await?;

    let hit = state.screen(named("Diosdado Cabello Rondon")).await?;
    assert!(hit.is_hit);
    assert!(!hit.matches.is_empty());
    assert!(hit.matches.iter().all(|record| record.confidence.is_bounded()));

    let clear = state.screen(named("Lucia Hernandez Ortiz")).await?;
    assert!(!clear.is_hit);
    assert!(clear.matches.is_empty());

    match state.screen(named(" ")).await {
        Err(ApiError::Validation(_)) => {}
        other => bail!("expected validation error, got {other:?}"),
    }
    Ok(())
}

#[tokio::test]
async fn bulk_upload_with_full_and_minimal_headers() -> Result<()> {
    let upload_dir = scratch("uploads");
    let state = start(config(&upload_dir)).await?;

    let upload = csv_body("nombre,cedula,pais\nDiosdado Cabello Rondon,V-8370825,VE\n");
    let summary = state.screen_upload(upload, Some("text/csv")).await?;
    assert_eq!(summary.total_processed, 1);
    assert_eq!(summary.hits, 1);
    assert_eq!(summary.hit_rate, "100.0%");
    assert_eq!(summary.results[0].input.cedula.as_deref(), Some("V-8370825"));

    let minimal = state.screen_upload(csv_body("Nombre\nAna Maria Rojas\n"), None).await?;
    assert_eq!(minimal.total_processed, 1);
    assert_eq!(minimal.hits, 0);
    assert_eq!(files_in(&upload_dir), 0);
    Ok(())
}

#[tokio::test]
async fn bulk_upload_without_nombre_is_rejected_before_screening() -> Result<()> {
    let upload_dir = scratch("uploads");
    let state = start(config(&upload_dir)).await?;

    match state.screen_upload(csv_body("name,cedula\nJuan,1\n"), Some("text/csv")).await {
        Err(ApiError::MissingRequiredColumn { column, .. }) => assert_eq!(column, "nombre"),
        other => bail!("expected missing column, got {other:?}"),
    }
    assert_eq!(files_in(&upload_dir), 0);
    Ok(())
}

#[tokio::test]
async fn two_mib_upload_against_one_mib_limit_leaves_no_files() -> Result<()> {
    let upload_dir = scratch("uploads");
    let state = start(config(&upload_dir)).await?;

    let mut chunks = vec![Ok::<_, Infallible>(b"nombre\n".to_vec())];
    chunks.extend((0..32).map(|_| Ok(vec![b'z'; 64 * 1024])));
    match state.screen_upload(stream::iter(chunks), Some("text/csv")).await {
        Err(ApiError::PayloadTooLarge { limit_mb }) => assert_eq!(limit_mb, 1),
        other => bail!("expected payload too large, got {other:?}"),
    }
    assert_eq!(files_in(&upload_dir), 0);
    Ok(())
}

#[tokio::test]
async fn unreachable_store_falls_back_to_in_memory_counts() -> Result<()> {
    let upload_dir = scratch("uploads");
    let state = start(ServiceConfig {
        use_database: true,
        database_url: Some(format!("sqlite://{}", scratch("missing").join("gone.db").display())),
        ..config(&upload_dir)
    })
    .await?;

    assert_eq!(state.mode(), DataMode::Xml);
    let health = state.health().await;
    assert_eq!(health.data_mode, DataMode::Xml);
    assert_eq!(health.status, HealthStatus::Healthy);
    assert_eq!(health.entities_loaded, 3);

    let report = state.data_mode_report().await;
    assert!(!report.database_connected);
    assert_eq!(report.xml_entities, Some(3));
    assert!(report.use_database_env);
    assert!(report.fallback_reason.is_some());
    Ok(())
}

#[tokio::test]
async fn health_is_idempotent_and_reports_list_dates() -> Result<()> {
    let upload_dir = scratch("uploads");
    let state = start(config(&upload_dir)).await?;

    let first = state.health().await;
    let second = state.health().await;
    assert_eq!(first.entities_loaded, second.entities_loaded);
    assert_eq!(first.data_mode, second.data_mode);
    assert_eq!(first.snapshot_generation, second.snapshot_generation);
    assert_eq!(first.ofac_last_updated.as_deref(), Some("10/01/2026"));
    assert_eq!(first.un_last_updated.as_deref(), Some("2026-10-01"));
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn screening_during_concurrent_refreshes_sees_whole_snapshots() -> Result<()> {
    let upload_dir = scratch("uploads");
    let state = Arc::new(start(config(&upload_dir)).await?);

    let mut refreshes = Vec::new();
    for _ in 0..4 {
        let state = Arc::clone(&state);
        refreshes.push(tokio::spawn(async move { state.refresh().await }));
    }
    let mut readers = Vec::new();
    for _ in 0..16 {
        let state = Arc::clone(&state);
        readers.push(tokio::spawn(async move {
            state.screen(named("Abdul Rahman Yasin")).await
        }));
    }

    let mut generations = Vec::new();
    for handle in refreshes {
        generations.push(handle.await??.generation);
    }
    generations.sort_unstable();
    assert_eq!(generations, vec![2, 3, 4, 5]);

    for handle in readers {
        let outcome = handle.await??;
        assert!(outcome.is_hit);
        let generation = outcome.snapshot_generation.unwrap_or_default();
        assert!((1..=5).contains(&generation), "unexpected generation {generation}");
    }

    let health = state.health().await;
    assert_eq!(health.snapshot_generation, Some(5));
    assert_eq!(health.entities_loaded, 3 + 4);
    Ok(())
}

#[tokio::test]
async fn wrong_content_type_is_rejected_without_touching_disk() -> Result<()> {
    let upload_dir = scratch("uploads");
    let state = start(config(&upload_dir)).await?;
    match state.screen_upload(csv_body("nombre\nAna\n"), Some("image/png")).await {
        Err(ApiError::UnsupportedMediaType(_)) => {}
        other => bail!("expected unsupported media type, got {other:?}"),
    }
    assert_eq!(files_in(&upload_dir), 0);
    state.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn bulk_upload_after_store_disappears_is_unavailable_and_cleaned() -> Result<()> {
    let upload_dir = scratch("uploads");
    let db_dir = scratch("store");
    std::fs::create_dir_all(&db_dir)?;
    let db_path = db_dir.join("screening.db");
    let mut store = SqliteStore::open(&db_path)?;
    store.migrate()?;
    store.replace_entities(&lists(0).entities)?;
    drop(store);

    let state = start(ServiceConfig {
        database_url: Some(format!("sqlite://{}", db_path.display())),
        ..config(&upload_dir)
    })
    .await?;
    assert_eq!(state.mode(), DataMode::Database);

    std::fs::remove_file(&db_path)?;
    let upload = csv_body("nombre\nDiosdado Cabello Rondon\n");
    match state.screen_upload(upload, Some("text/csv")).await {
        Err(ApiError::ProviderUnavailable(_)) => {}
        other => bail!("expected provider unavailable, got {other:?}"),
    }
    assert_eq!(state.mode(), DataMode::Database);
    assert_eq!(files_in(&upload_dir), 0);
    Ok(())
}

#[tokio::test]
async fn startup_keeps_recent_uploads_in_shared_directory() -> Result<()> {
    let upload_dir = scratch("uploads");
    std::fs::create_dir_all(&upload_dir)?;
    let in_flight = upload_dir.join("01INFLIGHT.csv");
    std::fs::write(&in_flight, "nombre\nAna\n")?;

    let state = start(config(&upload_dir)).await?;
    assert!(in_flight.exists());
    state.shutdown().await;
    assert!(in_flight.exists());
    std::fs::remove_file(&in_flight)?;
    Ok(())
}
