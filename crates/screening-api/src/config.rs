use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use screening_core::AlgorithmConfig;
use screening_sources::{DownloadSettings, SourceSpec};
use serde::{Deserialize, Serialize};

use crate::error::ApiError;

const BYTES_PER_MB: u64 = 1024 * 1024;

/// Process-level options, normally filled from the command line and environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceConfig {
    pub host: String,
    pub port: u16,
    pub data_dir: PathBuf,
    pub max_upload_size_mb: u64,
    pub config_path: PathBuf,
    /// Empty or absent disables authentication.
    pub api_key: Option<String>,
    pub use_database: bool,
    pub database_url: Option<String>,
    pub blocking_workers: usize,
    pub upload_tmp_dir: PathBuf,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8000,
            data_dir: PathBuf::from("sanctions_data"),
            max_upload_size_mb: 10,
            config_path: PathBuf::from("config.yaml"),
            api_key: None,
            use_database: false,
            database_url: None,
            blocking_workers: 4,
            upload_tmp_dir: default_upload_tmp_dir(),
        }
    }
}

impl ServiceConfig {
    #[must_use]
    pub fn max_upload_bytes(&self) -> u64 {
        self.max_upload_size_mb.saturating_mul(BYTES_PER_MB)
    }

    /// Shared secret, when one is configured.
    #[must_use]
    pub fn api_key(&self) -> Option<&str> {
        self.api_key.as_deref().map(str::trim).filter(|key| !key.is_empty())
    }

    #[must_use]
    pub fn database_url(&self) -> Option<&str> {
        self.database_url.as_deref().map(str::trim).filter(|url| !url.is_empty())
    }

    /// A persistent store is requested by the flag or by a connection string.
    #[must_use]
    pub fn database_requested(&self) -> bool {
        self.use_database || self.database_url().is_some()
    }

    /// # Errors
    /// Returns [`ApiError::Configuration`] for a zero upload limit or worker count.
    pub fn validate(&self) -> Result<(), ApiError> {
        if self.max_upload_size_mb == 0 {
            return Err(ApiError::Configuration("MAX_UPLOAD_SIZE_MB MUST be >= 1".to_string()));
        }
        if self.blocking_workers == 0 {
            return Err(ApiError::Configuration("BLOCKING_WORKERS MUST be >= 1".to_string()));
        }
        if self.host.trim().is_empty() {
            return Err(ApiError::Configuration("API_HOST MUST NOT be empty".to_string()));
        }
        Ok(())
    }
}

#[must_use]
pub fn default_upload_tmp_dir() -> PathBuf {
    std::env::temp_dir().join("sanctions_bulk")
}

/// `true`, `1` and `yes` in any case enable a flag; anything else disables it.
#[must_use]
pub fn parse_bool_flag(raw: &str) -> bool {
    matches!(raw.trim().to_ascii_lowercase().as_str(), "true" | "1" | "yes")
}

/// Screening settings read from the YAML file at `CONFIG_PATH`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ScreeningConfig {
    pub algorithm: AlgorithmConfig,
    pub sources: Vec<SourceSpec>,
    pub download: DownloadSettings,
}

impl Default for ScreeningConfig {
    fn default() -> Self {
        Self {
            algorithm: AlgorithmConfig::default(),
            sources: SourceSpec::default_catalog(),
            download: DownloadSettings::default(),
        }
    }
}

impl ScreeningConfig {
    /// Read and validate the YAML configuration file.
    ///
    /// # Errors
    /// Returns [`ApiError::Configuration`] when the file is missing, malformed or invalid.
    pub fn load(path: &Path) -> Result<Self, ApiError> {
        let raw = std::fs::read_to_string(path).map_err(|err| {
            ApiError::Configuration(format!("cannot read {}: {err}", path.display()))
        })?;
        Self::from_yaml_str(&raw)
            .map_err(|err| ApiError::Configuration(format!("{}: {err}", path.display())))
    }

    /// # Errors
    /// Returns [`ApiError::Configuration`] on malformed YAML or invalid values.
    pub fn from_yaml_str(raw: &str) -> Result<Self, ApiError> {
        let config: Self = serde_yaml::from_str(raw)
            .map_err(|err| ApiError::Configuration(format!("malformed YAML: {err}")))?;
        config.validate()?;
        Ok(config)
    }

    /// # Errors
    /// Returns [`ApiError::Configuration`] for invalid thresholds, an empty
    /// source list or two sources sharing a cache file.
    pub fn validate(&self) -> Result<(), ApiError> {
        self.algorithm.validate().map_err(|err| ApiError::Configuration(err.to_string()))?;
        if self.sources.is_empty() {
            return Err(ApiError::Configuration("sources MUST list at least one list".to_string()));
        }
        let mut file_names = BTreeSet::new();
        for spec in &self.sources {
            if spec.url.trim().is_empty() {
                return Err(ApiError::Configuration(format!("{} source has no url", spec.source)));
            }
            let valid_name = Path::new(&spec.file_name)
                .file_name()
                .is_some_and(|name| name == spec.file_name.as_str());
            if !valid_name {
                return Err(ApiError::Configuration(format!(
                    "source file_name `{}` MUST be a plain file name",
                    spec.file_name
                )));
            }
            if !file_names.insert(spec.file_name.as_str()) {
                return Err(ApiError::Configuration(format!(
                    "source file_name `{}` is used twice",
                    spec.file_name
                )));
            }
        }
        if self.download.max_bytes == 0 {
            return Err(ApiError::Configuration("download.max_bytes MUST be >= 1".to_string()));
        }
        Ok(())
    }
}
