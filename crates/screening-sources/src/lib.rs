use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use screening_core::{Entity, EntitySource};
use serde::{Deserialize, Serialize};

mod download;
mod parse;

pub use download::{DownloadSettings, ListFetcher};
pub use parse::{parse_list, parse_ofac_sdn, parse_un_consolidated};

pub const OFAC_SDN_URL: &str = "https://www.treasury.gov/ofac/downloads/sdn.xml";
pub const UN_CONSOLIDATED_URL: &str =
    "https://scsanctions.un.org/resources/xml/en/consolidated.xml";

#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    #[error("download of {url} failed: {reason}")]
    Download { url: String, reason: String },
    #[error("download of {url} exceeded {limit} bytes")]
    TooLarge { url: String, limit: u64 },
    #[error("i/o error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("{source_name} list is malformed: {reason}")]
    Malformed { source_name: EntitySource, reason: String },
    #[error("{source_name} list contains no entities")]
    Empty { source_name: EntitySource },
}

impl SourceError {
    pub(crate) fn io(path: &Path, source: std::io::Error) -> Self {
        Self::Io { path: path.to_path_buf(), source }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum SourceFormat {
    OfacSdn,
    UnConsolidated,
}

/// One configured sanctions list and where its cached copy lives.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct SourceSpec {
    pub source: EntitySource,
    pub format: SourceFormat,
    pub url: String,
    pub file_name: String,
}

impl SourceSpec {
    #[must_use]
    pub fn default_catalog() -> Vec<Self> {
        vec![
            Self {
                source: EntitySource::Ofac,
                format: SourceFormat::OfacSdn,
                url: OFAC_SDN_URL.to_string(),
                file_name: "sdn.xml".to_string(),
            },
            Self {
                source: EntitySource::Un,
                format: SourceFormat::UnConsolidated,
                url: UN_CONSOLIDATED_URL.to_string(),
                file_name: "un_consolidated.xml".to_string(),
            },
        ]
    }

    #[must_use]
    pub fn cache_path(&self, data_dir: &Path) -> PathBuf {
        data_dir.join(&self.file_name)
    }

    #[must_use]
    pub fn partial_path(&self, data_dir: &Path) -> PathBuf {
        data_dir.join(format!("{}.partial", self.file_name))
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct ValidationReport {
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl ValidationReport {
    pub fn extend(&mut self, other: Self) {
        self.errors.extend(other.errors);
        self.warnings.extend(other.warnings);
    }
}

/// Entities parsed from one list file.
#[derive(Debug, Clone)]
pub struct ParsedList {
    pub source: EntitySource,
    pub entities: Vec<Entity>,
    /// `dateGenerated` / `Publish_Date` as written in the file.
    pub published: Option<String>,
    pub report: ValidationReport,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum LoadOrigin {
    Downloaded,
    Cached,
    Missing,
}

/// Merged result of loading every configured list.
#[derive(Debug, Clone, Default)]
pub struct LoadedEntities {
    pub entities: Vec<Entity>,
    pub source_counts: BTreeMap<EntitySource, usize>,
    pub published: BTreeMap<EntitySource, String>,
    pub origins: BTreeMap<EntitySource, LoadOrigin>,
    pub report: ValidationReport,
}

impl LoadedEntities {
    pub fn push(&mut self, list: ParsedList, origin: LoadOrigin) {
        *self.source_counts.entry(list.source).or_insert(0) += list.entities.len();
        if let Some(published) = list.published {
            self.published.insert(list.source, published);
        }
        self.origins.insert(list.source, origin);
        self.report.extend(list.report);
        self.entities.extend(list.entities);
    }

    pub fn mark_missing(&mut self, source: EntitySource, reason: String) {
        self.source_counts.entry(source).or_insert(0);
        self.origins.insert(source, LoadOrigin::Missing);
        self.report.warnings.push(reason);
    }

    #[must_use]
    pub fn total(&self) -> usize {
        self.entities.len()
    }
}
