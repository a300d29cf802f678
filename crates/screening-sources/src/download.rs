use std::fs::{self, File};
use std::io::{BufReader, Read, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::parse::parse_list;
use crate::{LoadOrigin, LoadedEntities, ParsedList, SourceError, SourceSpec};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct DownloadSettings {
    pub timeout_secs: u64,
    pub max_bytes: u64,
}

impl Default for DownloadSettings {
    fn default() -> Self {
        Self { timeout_secs: 120, max_bytes: 256 * 1024 * 1024 }
    }
}

/// Downloads configured lists into `data_dir` and parses them.
///
/// All methods block; callers on an async runtime run them on a blocking worker.
#[derive(Debug, Clone)]
pub struct ListFetcher {
    specs: Vec<SourceSpec>,
    data_dir: PathBuf,
    settings: DownloadSettings,
    agent: ureq::Agent,
}

impl ListFetcher {
    #[must_use]
    pub fn new(specs: Vec<SourceSpec>, data_dir: PathBuf, settings: DownloadSettings) -> Self {
        let agent =
            ureq::AgentBuilder::new().timeout(Duration::from_secs(settings.timeout_secs)).build();
        Self { specs, data_dir, settings, agent }
    }

    #[must_use]
    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    /// Download and parse every list; any failure fails the whole fetch.
    ///
    /// Each list is written to a `.partial` file and only renamed over the
    /// cached copy once it parsed successfully.
    ///
    /// # Errors
    /// Returns the first download, I/O or parse failure.
    pub fn fetch_latest(&self) -> Result<LoadedEntities, SourceError> {
        let mut loaded = LoadedEntities::default();
        for spec in &self.specs {
            let list = self.fetch_one(spec)?;
            loaded.push(list, LoadOrigin::Downloaded);
        }
        Ok(loaded)
    }

    /// Download each list, falling back to its cached copy; never fails.
    #[must_use]
    pub fn load_latest_or_cached(&self) -> LoadedEntities {
        let mut loaded = LoadedEntities::default();
        for spec in &self.specs {
            match self.fetch_one(spec) {
                Ok(list) => loaded.push(list, LoadOrigin::Downloaded),
                Err(err) => {
                    warn!(
                        source = %spec.source,
                        error = %err,
                        "download failed; using cached list"
                    );
                    self.push_cached(spec, &mut loaded, Some(err.to_string()));
                }
            }
        }
        loaded
    }

    /// Parse only the cached copies.
    #[must_use]
    pub fn load_cached(&self) -> LoadedEntities {
        let mut loaded = LoadedEntities::default();
        for spec in &self.specs {
            self.push_cached(spec, &mut loaded, None);
        }
        loaded
    }

    fn push_cached(
        &self,
        spec: &SourceSpec,
        loaded: &mut LoadedEntities,
        download_error: Option<String>,
    ) {
        match parse_file(spec, &spec.cache_path(&self.data_dir)) {
            Ok(list) => {
                if let Some(reason) = download_error {
                    loaded.report.warnings.push(format!(
                        "{} download failed ({reason}); loaded cached list",
                        spec.source
                    ));
                }
                loaded.push(list, LoadOrigin::Cached);
            }
            Err(err) => {
                warn!(source = %spec.source, error = %err, "cached list unavailable");
                let reason = format!("{} list unavailable: {err}", spec.source);
                loaded.mark_missing(spec.source, reason);
            }
        }
    }

    fn fetch_one(&self, spec: &SourceSpec) -> Result<ParsedList, SourceError> {
        fs::create_dir_all(&self.data_dir).map_err(|err| SourceError::io(&self.data_dir, err))?;
        let partial = spec.partial_path(&self.data_dir);

        let result = self.download(spec, &partial).and_then(|bytes| {
            let list = parse_file(spec, &partial)?;
            let cache = spec.cache_path(&self.data_dir);
            fs::rename(&partial, &cache).map_err(|err| SourceError::io(&cache, err))?;
            info!(source = %spec.source, bytes, entities = list.entities.len(), "list downloaded");
            Ok(list)
        });

        if result.is_err() && partial.exists() {
            if let Err(err) = fs::remove_file(&partial) {
                warn!(path = %partial.display(), error = %err, "failed to remove partial download");
            }
        }
        result
    }

    fn download(&self, spec: &SourceSpec, partial: &Path) -> Result<u64, SourceError> {
        let response = self.agent.get(&spec.url).call().map_err(|err| SourceError::Download {
            url: spec.url.clone(),
            reason: err.to_string(),
        })?;

        let limit = self.settings.max_bytes;
        let mut body = response.into_reader().take(limit.saturating_add(1));
        let mut file = File::create(partial).map_err(|err| SourceError::io(partial, err))?;
        let written = std::io::copy(&mut body, &mut file).map_err(|err| SourceError::Download {
            url: spec.url.clone(),
            reason: err.to_string(),
        })?;
        file.flush().map_err(|err| SourceError::io(partial, err))?;

        if written > limit {
            return Err(SourceError::TooLarge { url: spec.url.clone(), limit });
        }
        Ok(written)
    }
}

fn parse_file(spec: &SourceSpec, path: &Path) -> Result<ParsedList, SourceError> {
    let file = File::open(path).map_err(|err| SourceError::io(path, err))?;
    parse_list(spec.format, spec.source, BufReader::new(file))
}
