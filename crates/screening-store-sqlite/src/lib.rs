use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use rusqlite::{params, Connection, OpenFlags, OptionalExtension, Transaction, TransactionBehavior};
use screening_core::{
    screen_candidates, subject_keys, AlgorithmConfig, Entity, EntityKeys, EntitySource,
    MatchRecord, ScreeningSubject,
};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tracing::{debug, info};

const LATEST_SCHEMA_VERSION: i64 = 1;

const CREATE_SCHEMA_MIGRATIONS_SQL: &str = r"
CREATE TABLE IF NOT EXISTS schema_migrations (
  version INTEGER PRIMARY KEY,
  applied_at TEXT NOT NULL
);
";

const MIGRATION_001_SQL: &str = r"
CREATE TABLE IF NOT EXISTS entities (
  source TEXT NOT NULL CHECK (source IN ('OFAC','UN')),
  entity_id TEXT NOT NULL,
  name TEXT NOT NULL,
  payload_json TEXT NOT NULL,
  imported_at TEXT NOT NULL,
  PRIMARY KEY (source, entity_id)
);

CREATE TABLE IF NOT EXISTS entity_name_keys (
  source TEXT NOT NULL,
  entity_id TEXT NOT NULL,
  name_key TEXT NOT NULL,
  PRIMARY KEY (source, entity_id, name_key),
  FOREIGN KEY (source, entity_id) REFERENCES entities(source, entity_id) ON DELETE CASCADE
);

CREATE TABLE IF NOT EXISTS entity_document_keys (
  source TEXT NOT NULL,
  entity_id TEXT NOT NULL,
  document_key TEXT NOT NULL,
  PRIMARY KEY (source, entity_id, document_key),
  FOREIGN KEY (source, entity_id) REFERENCES entities(source, entity_id) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_entity_name_keys_key ON entity_name_keys(name_key);
CREATE INDEX IF NOT EXISTS idx_entity_document_keys_key ON entity_document_keys(document_key);
";

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("invalid database url: {0}")]
    InvalidUrl(String),
    #[error("unsupported database driver `{0}`; only sqlite is available")]
    UnsupportedScheme(String),
    #[error("database unavailable at {path}: {reason}")]
    Unavailable { path: PathBuf, reason: String },
    #[error("database schema is not initialized; run `sscli store migrate`")]
    NotMigrated,
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("entity payload {id} could not be decoded: {reason}")]
    Payload { id: String, reason: String },
}

pub type Result<T> = std::result::Result<T, StoreError>;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ImportSummary {
    pub imported_entities: usize,
    pub by_source: BTreeMap<EntitySource, usize>,
}

/// Resolve a connection string to a database file.
///
/// Accepts `sqlite://<path>`, `sqlite:<path>` or a bare filesystem path.
///
/// # Errors
/// Returns [`StoreError::InvalidUrl`] for an empty string and
/// [`StoreError::UnsupportedScheme`] for any other `scheme://` prefix.
pub fn parse_database_url(url: &str) -> Result<PathBuf> {
    let trimmed = url.trim();
    if trimmed.is_empty() {
        return Err(StoreError::InvalidUrl("connection string is empty".to_string()));
    }
    let rest = trimmed.strip_prefix("sqlite://").or_else(|| trimmed.strip_prefix("sqlite:"));
    if let Some(rest) = rest {
        if rest.is_empty() {
            return Err(StoreError::InvalidUrl(format!("no database path in `{trimmed}`")));
        }
        return Ok(PathBuf::from(rest));
    }
    if let Some((scheme, _)) = trimmed.split_once("://") {
        return Err(StoreError::UnsupportedScheme(scheme.to_string()));
    }
    Ok(PathBuf::from(trimmed))
}

pub struct SqliteStore {
    conn: Connection,
}

impl SqliteStore {
    /// Open or create a SQLite screening store and configure runtime pragmas.
    ///
    /// # Errors
    /// Returns an error when the database cannot be opened or pragmas cannot be applied.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path).map_err(|err| StoreError::Unavailable {
            path: path.to_path_buf(),
            reason: err.to_string(),
        })?;
        Self::configure(conn)
    }

    /// Open an existing database without creating it.
    ///
    /// # Errors
    /// Returns [`StoreError::Unavailable`] when the file is missing or unreadable.
    pub fn open_existing(path: &Path) -> Result<Self> {
        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )
        .map_err(|err| StoreError::Unavailable {
            path: path.to_path_buf(),
            reason: err.to_string(),
        })?;
        Self::configure(conn)
    }

    /// Parse a connection string and open the existing database it names.
    ///
    /// # Errors
    /// Returns an error when the string is not a sqlite location or the database is missing.
    pub fn connect(url: &str) -> Result<Self> {
        let path = parse_database_url(url)?;
        Self::open_existing(&path)
    }

    fn configure(conn: Connection) -> Result<Self> {
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )?;
        Ok(Self { conn })
    }

    /// Apply forward migrations up to the latest schema version.
    ///
    /// # Errors
    /// Returns an error when a migration statement fails.
    pub fn migrate(&mut self) -> Result<()> {
        self.conn.execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)?;
        if current_schema_version(&self.conn)? < 1 {
            let tx = self.conn.transaction()?;
            tx.execute_batch(MIGRATION_001_SQL)?;
            record_schema_version(&tx, 1)?;
            tx.commit()?;
            info!(version = 1, "applied screening store migration");
        }
        Ok(())
    }

    /// # Errors
    /// Returns an error when schema metadata cannot be read.
    pub fn schema_version(&self) -> Result<i64> {
        if !table_exists(&self.conn, "schema_migrations")? {
            return Ok(0);
        }
        current_schema_version(&self.conn)
    }

    /// Round-trip a trivial query and confirm the schema is current.
    ///
    /// # Errors
    /// Returns [`StoreError::NotMigrated`] on an uninitialized database.
    pub fn health_check(&self) -> Result<()> {
        self.conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0))?;
        if self.schema_version()? < LATEST_SCHEMA_VERSION {
            return Err(StoreError::NotMigrated);
        }
        Ok(())
    }

    /// # Errors
    /// Returns an error when the count query fails.
    pub fn entity_count(&self) -> Result<u64> {
        let count = self.conn.query_row("SELECT COUNT(*) FROM entities", [], |row| {
            row.get::<_, i64>(0)
        })?;
        Ok(u64::try_from(count).unwrap_or(0))
    }

    /// # Errors
    /// Returns an error when the count query fails.
    pub fn entity_count_by_source(&self) -> Result<BTreeMap<EntitySource, u64>> {
        let mut stmt =
            self.conn.prepare("SELECT source, COUNT(*) FROM entities GROUP BY source")?;
        let mut rows = stmt.query([])?;
        let mut counts = BTreeMap::new();
        while let Some(row) = rows.next()? {
            let source: String = row.get(0)?;
            let count: i64 = row.get(1)?;
            if let Some(source) = EntitySource::parse(&source) {
                counts.insert(source, u64::try_from(count).unwrap_or(0));
            }
        }
        Ok(counts)
    }

    /// Replace the full entity set in one transaction.
    ///
    /// # Errors
    /// Returns an error when any insert fails; the previous contents are kept.
    pub fn replace_entities(&mut self, entities: &[Entity]) -> Result<ImportSummary> {
        let imported_at = OffsetDateTime::now_utc()
            .format(&time::format_description::well_known::Rfc3339)
            .map_err(|err| StoreError::Payload { id: "-".to_string(), reason: err.to_string() })?;

        let tx = self.conn.transaction()?;
        tx.execute("DELETE FROM entities", [])?;

        let mut by_source = BTreeMap::new();
        {
            let mut insert_entity = tx.prepare(
                "INSERT OR REPLACE INTO entities(source, entity_id, name, payload_json, imported_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
            )?;
            let mut insert_name_key = tx.prepare(
                "INSERT OR IGNORE INTO entity_name_keys(source, entity_id, name_key)
                 VALUES (?1, ?2, ?3)",
            )?;
            let mut insert_document_key = tx.prepare(
                "INSERT OR IGNORE INTO entity_document_keys(source, entity_id, document_key)
                 VALUES (?1, ?2, ?3)",
            )?;

            for entity in entities {
                let payload = serde_json::to_string(entity).map_err(|err| StoreError::Payload {
                    id: entity.id.clone(),
                    reason: err.to_string(),
                })?;
                let source = entity.source.as_str();
                insert_entity.execute(params![
                    source,
                    entity.id,
                    entity.name,
                    payload,
                    imported_at
                ])?;

                let keys = EntityKeys::for_entity(entity);
                for key in &keys.name_keys {
                    insert_name_key.execute(params![source, entity.id, key])?;
                }
                for key in &keys.document_keys {
                    insert_document_key.execute(params![source, entity.id, key])?;
                }
                *by_source.entry(entity.source).or_insert(0) += 1;
            }
        }
        tx.commit()?;

        let imported_entities = by_source.values().sum();
        info!(imported_entities, "replaced screening store entities");
        Ok(ImportSummary { imported_entities, by_source })
    }

    /// Begin a session scoped to one logical operation.
    ///
    /// The session rolls back when dropped without [`StoreSession::finish`].
    ///
    /// # Errors
    /// Returns an error when the transaction cannot be started.
    pub fn session(&mut self) -> Result<StoreSession<'_>> {
        let tx = self.conn.transaction_with_behavior(TransactionBehavior::Deferred)?;
        Ok(StoreSession { tx })
    }
}

pub struct StoreSession<'conn> {
    tx: Transaction<'conn>,
}

impl StoreSession<'_> {
    /// Entities sharing a name key or document number with the subject.
    ///
    /// # Errors
    /// Returns an error when a lookup fails or a stored payload cannot be decoded.
    pub fn candidates(&self, subject: &ScreeningSubject) -> Result<Vec<Entity>> {
        let keys = subject_keys(subject);
        let mut ids: BTreeSet<(String, String)> = BTreeSet::new();

        let mut by_name = self
            .tx
            .prepare_cached("SELECT source, entity_id FROM entity_name_keys WHERE name_key = ?1")?;
        for key in &keys.name_keys {
            let rows = by_name.query_map(params![key], |row| Ok((row.get(0)?, row.get(1)?)))?;
            for row in rows {
                ids.insert(row?);
            }
        }

        let mut by_document = self.tx.prepare_cached(
            "SELECT source, entity_id FROM entity_document_keys WHERE document_key = ?1",
        )?;
        for key in &keys.document_keys {
            let rows = by_document.query_map(params![key], |row| Ok((row.get(0)?, row.get(1)?)))?;
            for row in rows {
                ids.insert(row?);
            }
        }

        let mut load = self.tx.prepare_cached(
            "SELECT payload_json FROM entities WHERE source = ?1 AND entity_id = ?2",
        )?;
        let mut entities = Vec::with_capacity(ids.len());
        for (source, id) in ids {
            let payload: Option<String> =
                load.query_row(params![source, id], |row| row.get(0)).optional()?;
            let Some(payload) = payload else { continue };
            let entity = serde_json::from_str::<Entity>(&payload)
                .map_err(|err| StoreError::Payload { id: id.clone(), reason: err.to_string() })?;
            entities.push(entity);
        }
        debug!(candidates = entities.len(), "store candidate lookup");
        Ok(entities)
    }

    /// # Errors
    /// Returns an error when the candidate lookup fails.
    pub fn screen(
        &self,
        subject: &ScreeningSubject,
        config: &AlgorithmConfig,
    ) -> Result<Vec<MatchRecord>> {
        let candidates = self.candidates(subject)?;
        Ok(screen_candidates(subject, &candidates, config))
    }

    /// End the session.
    ///
    /// # Errors
    /// Returns an error when the transaction cannot be closed.
    pub fn finish(self) -> Result<()> {
        self.tx.commit()?;
        Ok(())
    }
}

fn table_exists(conn: &Connection, table_name: &str) -> Result<bool> {
    let exists = conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1)",
        params![table_name],
        |row| row.get::<_, i64>(0),
    )?;
    Ok(exists == 1)
}

fn current_schema_version(conn: &Connection) -> Result<i64> {
    let version = conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM schema_migrations",
        [],
        |row| row.get::<_, i64>(0),
    )?;
    Ok(version)
}

fn record_schema_version(conn: &Connection, version: i64) -> Result<()> {
    let now = OffsetDateTime::now_utc()
        .format(&time::format_description::well_known::Rfc3339)
        .map_err(|err| StoreError::Payload { id: "schema".to_string(), reason: err.to_string() })?;
    conn.execute(
        "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
        params![version, now],
    )?;
    Ok(())
}
