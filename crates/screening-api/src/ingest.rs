use std::fmt::Display;
use std::fs::File;
use std::io::ErrorKind as IoErrorKind;
use std::path::{Component, Path, PathBuf};
use std::time::{Duration, SystemTime};

use futures::{Stream, StreamExt};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};
use ulid::Ulid;

use crate::config::ServiceConfig;
use crate::error::ApiError;
use crate::worker::WorkerPool;

pub const REQUIRED_COLUMN: &str = "nombre";
pub const DOCUMENT_COLUMN: &str = "cedula";
pub const COUNTRY_COLUMN: &str = "pais";

/// Upload bodies are written in slices of at most this many bytes.
pub const CHUNK_SIZE: usize = 8 * 1024;

/// Uploads this old are left over from a finished or crashed request.
pub const STALE_UPLOAD_AGE: Duration = Duration::from_secs(60 * 60);

const ALLOWED_CONTENT_TYPES: [&str; 4] =
    ["text/csv", "text/plain", "application/octet-stream", "application/csv"];

/// Accept the allow-list, any type mentioning `csv`, or no declared type.
///
/// # Errors
/// Returns [`ApiError::UnsupportedMediaType`] for anything else.
pub fn check_content_type(declared: Option<&str>) -> Result<(), ApiError> {
    let Some(declared) = declared.map(str::trim).filter(|value| !value.is_empty()) else {
        return Ok(());
    };
    let lowered = declared.to_ascii_lowercase();
    let essence = lowered.split(';').next().unwrap_or_default().trim();
    if ALLOWED_CONTENT_TYPES.contains(&essence) || lowered.contains("csv") {
        return Ok(());
    }
    Err(ApiError::UnsupportedMediaType(declared.to_string()))
}

/// An uploaded CSV on disk whose header has been checked.
///
/// Owns its file: dropping the value deletes it inline. Request paths hand it
/// to [`UploadIngestor::discard`] instead.
#[derive(Debug)]
pub struct ValidatedFile {
    path: PathBuf,
    size_bytes: u64,
    headers: Vec<String>,
    removed: bool,
}

impl ValidatedFile {
    fn new(path: PathBuf) -> Self {
        Self { path, size_bytes: 0, headers: Vec::new(), removed: false }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    #[must_use]
    pub fn size_bytes(&self) -> u64 {
        self.size_bytes
    }

    #[must_use]
    pub fn headers(&self) -> &[String] {
        &self.headers
    }

    fn remove(&mut self) {
        if self.removed {
            return;
        }
        self.removed = true;
        remove_upload(&self.path);
    }
}

impl Drop for ValidatedFile {
    fn drop(&mut self) {
        self.remove();
    }
}

fn remove_upload(path: &Path) {
    match std::fs::remove_file(path) {
        Ok(()) => debug!(path = %path.display(), "removed upload file"),
        Err(err) if err.kind() == IoErrorKind::NotFound => {}
        Err(err) => warn!(path = %path.display(), error = %err, "failed to remove upload file"),
    }
}

/// Streams untrusted uploads to a private temporary directory under a byte ceiling.
#[derive(Debug, Clone)]
pub struct UploadIngestor {
    tmp_dir: PathBuf,
    max_bytes: u64,
    limit_mb: u64,
    workers: WorkerPool,
}

impl UploadIngestor {
    #[must_use]
    pub fn new(config: &ServiceConfig, workers: WorkerPool) -> Self {
        Self {
            tmp_dir: config.upload_tmp_dir.clone(),
            max_bytes: config.max_upload_bytes(),
            limit_mb: config.max_upload_size_mb,
            workers,
        }
    }

    #[must_use]
    pub fn tmp_dir(&self) -> &Path {
        &self.tmp_dir
    }

    #[must_use]
    pub fn limit_mb(&self) -> u64 {
        self.limit_mb
    }

    /// Write `body` to a fresh file and validate its header row.
    ///
    /// The file is removed before any error is returned.
    ///
    /// # Errors
    /// Returns [`ApiError::UnsupportedMediaType`], [`ApiError::InvalidPath`],
    /// [`ApiError::PayloadTooLarge`], [`ApiError::EmptyUpload`],
    /// [`ApiError::InvalidCsv`] or [`ApiError::MissingRequiredColumn`].
    pub async fn ingest<S, B, E>(
        &self,
        body: S,
        content_type: Option<&str>,
    ) -> Result<ValidatedFile, ApiError>
    where
        S: Stream<Item = Result<B, E>>,
        B: AsRef<[u8]>,
        E: Display,
    {
        check_content_type(content_type)?;

        let (mut upload, file) = self.create_upload_file().await?;
        let filled = self.fill(&mut upload, file, body).await;
        match filled {
            Ok(()) => {
                let columns = upload.headers.len();
                debug!(bytes = upload.size_bytes, columns, "upload validated");
                Ok(upload)
            }
            Err(err) => {
                self.discard(upload).await;
                Err(err)
            }
        }
    }

    /// Delete an upload on the worker pool. If the pool is closed the file is
    /// removed when `file` drops instead.
    pub async fn discard(&self, mut file: ValidatedFile) {
        let path = file.path.clone();
        match self.workers.run(move || remove_upload(&path)).await {
            Ok(()) => file.removed = true,
            Err(err) => warn!(error = %err, "upload removal fell back to drop"),
        }
    }

    async fn fill<S, B, E>(
        &self,
        upload: &mut ValidatedFile,
        mut file: tokio::fs::File,
        body: S,
    ) -> Result<(), ApiError>
    where
        S: Stream<Item = Result<B, E>>,
        B: AsRef<[u8]>,
        E: Display,
    {
        let mut body = std::pin::pin!(body);
        let mut written: u64 = 0;

        while let Some(chunk) = body.next().await {
            let chunk =
                chunk.map_err(|err| ApiError::InvalidCsv(format!("upload interrupted: {err}")))?;
            for piece in chunk.as_ref().chunks(CHUNK_SIZE) {
                let next_total = written.saturating_add(piece.len() as u64);
                if next_total > self.max_bytes {
                    info!(limit_mb = self.limit_mb, "upload exceeded size limit; aborted");
                    return Err(ApiError::PayloadTooLarge { limit_mb: self.limit_mb });
                }
                file.write_all(piece).await.map_err(|err| internal_io(upload.path(), &err))?;
                written = next_total;
            }
        }
        file.flush().await.map_err(|err| internal_io(upload.path(), &err))?;
        drop(file);
        upload.size_bytes = written;

        if written == 0 {
            return Err(ApiError::EmptyUpload);
        }

        let path = upload.path.clone();
        upload.headers = self.workers.run(move || read_header(&path)).await??;
        Ok(())
    }

    async fn create_upload_file(&self) -> Result<(ValidatedFile, tokio::fs::File), ApiError> {
        tokio::fs::create_dir_all(&self.tmp_dir)
            .await
            .map_err(|err| internal_io(&self.tmp_dir, &err))?;
        let root = tokio::fs::canonicalize(&self.tmp_dir)
            .await
            .map_err(|err| internal_io(&self.tmp_dir, &err))?;

        let file_name = format!("{}.csv", Ulid::new());
        let candidate = resolve_within(&root, &file_name)?;
        let file = tokio::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&candidate)
            .await
            .map_err(|err| internal_io(&candidate, &err))?;
        let upload = ValidatedFile::new(candidate);

        let resolved = tokio::fs::canonicalize(upload.path())
            .await
            .map_err(|err| internal_io(upload.path(), &err))?;
        if !resolved.starts_with(&root) {
            warn!(path = %resolved.display(), root = %root.display(), "upload escaped tmp dir");
            drop(file);
            self.discard(upload).await;
            return Err(ApiError::InvalidPath(resolved.display().to_string()));
        }
        Ok((upload, file))
    }
}

/// Join a single plain file name onto `root`, refusing anything that could escape it.
///
/// # Errors
/// Returns [`ApiError::InvalidPath`] when `file_name` is not one normal path component.
pub fn resolve_within(root: &Path, file_name: &str) -> Result<PathBuf, ApiError> {
    let mut components = Path::new(file_name).components();
    match (components.next(), components.next()) {
        (Some(Component::Normal(_)), None) => Ok(root.join(file_name)),
        _ => Err(ApiError::InvalidPath(file_name.to_string())),
    }
}

fn internal_io(path: &Path, err: &std::io::Error) -> ApiError {
    ApiError::Internal(format!("upload i/o on {}: {err}", path.display()))
}

fn normalize_header(raw: &str) -> String {
    raw.trim_start_matches('\u{feff}').trim().to_lowercase()
}

fn read_header(path: &Path) -> Result<Vec<String>, ApiError> {
    let file = File::open(path).map_err(|err| internal_io(path, &err))?;
    let mut reader = csv::ReaderBuilder::new().has_headers(false).flexible(true).from_reader(file);
    let mut record = csv::StringRecord::new();
    let has_row = reader
        .read_record(&mut record)
        .map_err(|err| ApiError::InvalidCsv(err.to_string()))?;
    if !has_row {
        return Err(ApiError::EmptyUpload);
    }

    let headers = record
        .iter()
        .map(|field| field.trim_start_matches('\u{feff}').to_string())
        .collect::<Vec<_>>();
    if !headers.iter().any(|header| normalize_header(header) == REQUIRED_COLUMN) {
        return Err(ApiError::MissingRequiredColumn { column: REQUIRED_COLUMN, found: headers });
    }
    Ok(headers)
}

/// One data row of a bulk upload, numbered from 1.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadRow {
    pub row: usize,
    pub nombre: String,
    pub cedula: Option<String>,
    pub pais: Option<String>,
}

/// Read every data row. Blocking.
///
/// # Errors
/// Returns [`ApiError::InvalidCsv`] when the file is not valid CSV.
pub fn read_rows(path: &Path) -> Result<Vec<UploadRow>, ApiError> {
    let file = File::open(path).map_err(|err| internal_io(path, &err))?;
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .trim(csv::Trim::All)
        .from_reader(file);

    let headers = reader.headers().map_err(|err| ApiError::InvalidCsv(err.to_string()))?.clone();
    let position = |name: &str| headers.iter().position(|header| normalize_header(header) == name);
    let Some(name_index) = position(REQUIRED_COLUMN) else {
        return Err(ApiError::MissingRequiredColumn {
            column: REQUIRED_COLUMN,
            found: headers.iter().map(str::to_string).collect(),
        });
    };
    let document_index = position(DOCUMENT_COLUMN);
    let country_index = position(COUNTRY_COLUMN);

    let optional = |record: &csv::StringRecord, index: Option<usize>| {
        index
            .and_then(|index| record.get(index))
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(str::to_string)
    };

    let mut rows = Vec::new();
    for (offset, record) in reader.records().enumerate() {
        let record = record.map_err(|err| ApiError::InvalidCsv(err.to_string()))?;
        rows.push(UploadRow {
            row: offset + 1,
            nombre: record.get(name_index).unwrap_or_default().trim().to_string(),
            cedula: optional(&record, document_index),
            pais: optional(&record, country_index),
        });
    }
    Ok(rows)
}

/// Remove `*.csv` uploads last modified at least `min_age` ago. Blocking.
///
/// Younger files may belong to another process sharing `tmp_dir` and are kept.
/// Returns the number of files removed.
#[must_use]
pub fn sweep_stale(tmp_dir: &Path, min_age: Duration) -> usize {
    let entries = match std::fs::read_dir(tmp_dir) {
        Ok(entries) => entries,
        Err(err) if err.kind() == IoErrorKind::NotFound => return 0,
        Err(err) => {
            warn!(path = %tmp_dir.display(), error = %err, "cannot scan upload directory");
            return 0;
        }
    };

    let now = SystemTime::now();
    let mut removed = 0;
    for entry in entries.flatten() {
        let path = entry.path();
        let Ok(metadata) = entry.metadata() else {
            continue;
        };
        let is_upload = metadata.is_file() && path.extension().is_some_and(|ext| ext == "csv");
        let old_enough = metadata
            .modified()
            .ok()
            .and_then(|modified| now.duration_since(modified).ok())
            .is_some_and(|age| age >= min_age);
        if !is_upload || !old_enough {
            continue;
        }
        match std::fs::remove_file(&path) {
            Ok(()) => removed += 1,
            Err(err) => warn!(path = %path.display(), error = %err, "cannot remove stale upload"),
        }
    }
    removed
}
