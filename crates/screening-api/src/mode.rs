use screening_store_sqlite::SqliteStore;
use serde::Serialize;
use tracing::{info, warn};

use crate::config::ServiceConfig;

/// Which provider answers screening requests for the life of the process.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum DataMode {
    Xml,
    Database,
}

impl DataMode {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Xml => "xml",
            Self::Database => "database",
        }
    }
}

/// Result of the one-time persistent store probe at startup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreProbe {
    NotRequested,
    Ready { url: String, entities: u64 },
    Unavailable { reason: String },
}

/// Connect, health-check and count entities once.
///
/// Blocking. The connection is dropped before returning on every branch.
#[must_use]
pub fn probe_store(config: &ServiceConfig) -> StoreProbe {
    if !config.database_requested() {
        return StoreProbe::NotRequested;
    }
    let Some(url) = config.database_url() else {
        return StoreProbe::Unavailable {
            reason: "USE_DATABASE is set but DATABASE_URL is empty".to_string(),
        };
    };

    let probe = SqliteStore::connect(url).and_then(|store| {
        store.health_check()?;
        store.entity_count()
    });
    match probe {
        Ok(entities) => StoreProbe::Ready { url: url.to_string(), entities },
        Err(err) => StoreProbe::Unavailable { reason: err.to_string() },
    }
}

/// Write-once record of the startup mode decision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModeSelector {
    mode: DataMode,
    database_url: Option<String>,
    fallback_reason: Option<String>,
}

impl ModeSelector {
    #[must_use]
    pub fn from_probe(probe: StoreProbe) -> Self {
        match probe {
            StoreProbe::Ready { url, entities } => {
                info!(entities, "persistent store ready; using database mode");
                Self { mode: DataMode::Database, database_url: Some(url), fallback_reason: None }
            }
            StoreProbe::Unavailable { reason } => {
                warn!(reason = %reason, "persistent store unavailable; falling back to xml mode");
                Self { mode: DataMode::Xml, database_url: None, fallback_reason: Some(reason) }
            }
            StoreProbe::NotRequested => {
                Self { mode: DataMode::Xml, database_url: None, fallback_reason: None }
            }
        }
    }

    #[must_use]
    pub fn resolve(&self) -> DataMode {
        self.mode
    }

    /// Connection string of the active store; `None` outside database mode.
    #[must_use]
    pub fn database_url(&self) -> Option<&str> {
        self.database_url.as_deref()
    }

    #[must_use]
    pub fn fallback_reason(&self) -> Option<&str> {
        self.fallback_reason.as_deref()
    }
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use super::*;

    #[test]
    fn unrequested_store_selects_xml_without_fallback() {
        let selector = ModeSelector::from_probe(probe_store(&ServiceConfig::default()));
        assert_eq!(selector.resolve(), DataMode::Xml);
        assert_eq!(selector.fallback_reason(), None);
    }

    #[test]
    fn flag_without_url_falls_back_to_xml() {
        let config = ServiceConfig { use_database: true, ..ServiceConfig::default() };
        let selector = ModeSelector::from_probe(probe_store(&config));
        assert_eq!(selector.resolve(), DataMode::Xml);
        assert!(selector.fallback_reason().is_some_and(|reason| reason.contains("DATABASE_URL")));
    }

    #[test]
    fn unsupported_driver_falls_back_to_xml() {
        let config = ServiceConfig {
            database_url: Some("postgresql://sanctions@127.0.0.1:1/db".to_string()),
            ..ServiceConfig::default()
        };
        let selector = ModeSelector::from_probe(probe_store(&config));
        assert_eq!(selector.resolve(), DataMode::Xml);
        assert_eq!(selector.database_url(), None);
    }

    #[test]
    fn migrated_store_selects_database_mode() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempfile::tempdir()?;
        let db_path = dir.path().join("screening.db");
        SqliteStore::open(&db_path)?.migrate()?;

        let config = ServiceConfig {
            use_database: true,
            database_url: Some(format!("sqlite://{}", db_path.display())),
            ..ServiceConfig::default()
        };
        match probe_store(&config) {
            StoreProbe::Ready { entities, .. } => assert_eq!(entities, 0),
            other => panic!("expected ready store, got {other:?}"),
        }
        assert!(Path::new(&db_path).exists());
        Ok(())
    }

    #[test]
    fn unmigrated_store_is_unavailable() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempfile::tempdir()?;
        let db_path = dir.path().join("blank.db");
        drop(SqliteStore::open(&db_path)?);

        let config = ServiceConfig {
            database_url: Some(db_path.display().to_string()),
            ..ServiceConfig::default()
        };
        assert!(matches!(probe_store(&config), StoreProbe::Unavailable { .. }));
        Ok(())
    }
}
