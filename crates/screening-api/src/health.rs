use std::collections::BTreeMap;
use std::path::Path;
use std::time::SystemTime;

use screening_core::EntitySource;
use screening_sources::SourceSpec;
use serde::Serialize;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use tracing::debug;

use crate::mode::DataMode;

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Error,
}

/// A cached list file found in the data directory.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct DataFileInfo {
    pub filename: String,
    pub last_modified: String,
    pub size_bytes: u64,
    #[serde(skip)]
    pub(crate) modified: Option<OffsetDateTime>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub data_mode: DataMode,
    pub entities_loaded: u64,
    pub snapshot_generation: Option<u64>,
    pub data_files: Vec<DataFileInfo>,
    pub data_age_days: Option<u64>,
    pub ofac_last_updated: Option<String>,
    pub un_last_updated: Option<String>,
    pub algorithm_version: String,
    pub uptime_seconds: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

impl HealthReport {
    /// Payload used when assembling the report itself failed.
    #[must_use]
    pub fn failed(data_mode: DataMode, uptime_seconds: u64, message: String) -> Self {
        Self {
            status: HealthStatus::Error,
            data_mode,
            entities_loaded: 0,
            snapshot_generation: None,
            data_files: Vec::new(),
            data_age_days: None,
            ofac_last_updated: None,
            un_last_updated: None,
            algorithm_version: "unknown".to_string(),
            uptime_seconds,
            error_message: Some(message),
        }
    }
}

/// Which provider is active and what each one holds.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct DataModeReport {
    pub data_mode: DataMode,
    pub database_connected: bool,
    pub database_entities: Option<u64>,
    pub xml_entities: Option<usize>,
    pub use_database_env: bool,
    pub database_url_set: bool,
    pub fallback_reason: Option<String>,
    pub timestamp: String,
}

#[must_use]
pub fn format_time(value: OffsetDateTime) -> String {
    value.format(&Rfc3339).unwrap_or_else(|_| value.unix_timestamp().to_string())
}

#[must_use]
pub fn now_rfc3339() -> String {
    format_time(OffsetDateTime::now_utc())
}

/// List `*.xml` and `*.zip` files in `data_dir`, sorted by name. Blocking.
///
/// A missing directory yields an empty list.
///
/// # Errors
/// Returns the I/O error when the directory exists but cannot be read.
pub fn scan_data_files(data_dir: &Path) -> std::io::Result<Vec<DataFileInfo>> {
    let entries = match std::fs::read_dir(data_dir) {
        Ok(entries) => entries,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => return Err(err),
    };

    let mut files = Vec::new();
    for entry in entries.flatten() {
        let path = entry.path();
        let is_list = path.extension().and_then(|ext| ext.to_str()).is_some_and(|ext| {
            ext.eq_ignore_ascii_case("xml") || ext.eq_ignore_ascii_case("zip")
        });
        if !is_list {
            continue;
        }
        let Ok(metadata) = entry.metadata() else {
            continue;
        };
        if !metadata.is_file() {
            continue;
        }
        let modified = metadata.modified().ok().map(OffsetDateTime::from);
        files.push(DataFileInfo {
            filename: entry.file_name().to_string_lossy().into_owned(),
            last_modified: modified.map(format_time).unwrap_or_default(),
            size_bytes: metadata.len(),
            modified,
        });
    }
    files.sort_by(|a, b| a.filename.cmp(&b.filename));
    debug!(count = files.len(), path = %data_dir.display(), "scanned data files");
    Ok(files)
}

/// Whole days since the oldest file was modified.
#[must_use]
pub fn data_age_days(files: &[DataFileInfo], now: OffsetDateTime) -> Option<u64> {
    let oldest = files.iter().filter_map(|file| file.modified).min()?;
    u64::try_from((now - oldest).whole_days()).ok()
}

/// Last update per source: the list's own publish date when the snapshot has
/// one, else the modification time of its cached file.
#[must_use]
pub fn last_updated(
    sources: &[SourceSpec],
    list_dates: &BTreeMap<EntitySource, String>,
    files: &[DataFileInfo],
) -> BTreeMap<EntitySource, String> {
    let mut updated = BTreeMap::new();
    for spec in sources {
        let value = list_dates.get(&spec.source).cloned().or_else(|| {
            files
                .iter()
                .find(|file| file.filename == spec.file_name)
                .map(|file| file.last_modified.clone())
        });
        if let Some(value) = value {
            updated.entry(spec.source).or_insert(value);
        }
    }
    updated
}

#[must_use]
pub fn uptime_seconds(started: SystemTime) -> u64 {
    SystemTime::now().duration_since(started).map(|elapsed| elapsed.as_secs()).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use time::Duration;

    use super::*;

    #[test]
    fn scan_lists_only_xml_and_zip_files() -> Result<(), std::io::Error> {
        let dir = tempfile::tempdir()?;
        std::fs::write(dir.path().join("sdn.xml"), "<sdnList/>")?;
        std::fs::write(dir.path().join("archive.ZIP"), "zip")?;
        std::fs::write(dir.path().join("notes.txt"), "x")?;
        std::fs::write(dir.path().join("sdn.xml.partial"), "x")?;

        let files = scan_data_files(dir.path())?;
        let names = files.iter().map(|file| file.filename.as_str()).collect::<Vec<_>>();
        assert_eq!(names, vec!["archive.ZIP", "sdn.xml"]);
        assert_eq!(files[1].size_bytes, 10);
        assert!(!files[1].last_modified.is_empty());
        assert!(scan_data_files(&dir.path().join("missing"))?.is_empty());
        Ok(())
    }

    #[test]
    fn age_uses_oldest_file() {
        let now = OffsetDateTime::now_utc();
        let file = |days: i64| DataFileInfo {
            filename: format!("{days}.xml"),
            last_modified: String::new(),
            size_bytes: 0,
            modified: Some(now - Duration::days(days)),
        };
        assert_eq!(data_age_days(&[file(1), file(3)], now), Some(3));
        assert_eq!(data_age_days(&[], now), None);
    }

    #[test]
    fn list_date_wins_over_file_time() {
        let sources = SourceSpec::default_catalog();
        let files = sources
            .iter()
            .map(|spec| DataFileInfo {
                filename: spec.file_name.clone(),
                last_modified: "2026-01-01T00:00:00Z".to_string(),
                size_bytes: 1,
                modified: None,
            })
            .collect::<Vec<_>>();
        let list_dates = BTreeMap::from([(EntitySource::Un, "2026-10-01".to_string())]);

        let updated = last_updated(&sources, &list_dates, &files);
        assert_eq!(updated.get(&EntitySource::Un).map(String::as_str), Some("2026-10-01"));
        assert_eq!(
            updated.get(&EntitySource::Ofac).map(String::as_str),
            Some("2026-01-01T00:00:00Z")
        );
    }
}
