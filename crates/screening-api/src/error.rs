use screening_core::ScreeningError;
use serde::Serialize;

/// Category used by the transport layer to choose a status code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Configuration,
    InvalidUpload,
    InvalidSubject,
    UnsupportedMediaType,
    PayloadTooLarge,
    Unauthenticated,
    Forbidden,
    ProviderUnavailable,
    RefreshFailed,
    Internal,
}

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("{0}")]
    Validation(String),
    #[error("unsupported content type `{0}`; upload a CSV file")]
    UnsupportedMediaType(String),
    #[error("invalid upload path: {0}")]
    InvalidPath(String),
    #[error("CSV file is empty")]
    EmptyUpload,
    #[error("invalid CSV: {0}")]
    InvalidCsv(String),
    #[error("missing required header: '{column}'. Found: {found:?}")]
    MissingRequiredColumn { column: &'static str, found: Vec<String> },
    #[error("file too large; maximum size is {limit_mb}MB")]
    PayloadTooLarge { limit_mb: u64 },
    #[error("screening provider unavailable: {0}")]
    ProviderUnavailable(String),
    #[error("data refresh failed: {message}")]
    RefreshFailed {
        message: String,
        validation_errors: Vec<String>,
        active_generation: Option<u64>,
    },
    #[error("missing API key")]
    Unauthenticated,
    #[error("invalid API key")]
    Forbidden,
    #[error("internal error: {0}")]
    Internal(String),
}

impl ApiError {
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Configuration(_) => ErrorKind::Configuration,
            Self::Validation(_) => ErrorKind::InvalidSubject,
            Self::UnsupportedMediaType(_) => ErrorKind::UnsupportedMediaType,
            Self::InvalidPath(_)
            | Self::EmptyUpload
            | Self::InvalidCsv(_)
            | Self::MissingRequiredColumn { .. } => ErrorKind::InvalidUpload,
            Self::PayloadTooLarge { .. } => ErrorKind::PayloadTooLarge,
            Self::ProviderUnavailable(_) => ErrorKind::ProviderUnavailable,
            Self::RefreshFailed { .. } => ErrorKind::RefreshFailed,
            Self::Unauthenticated => ErrorKind::Unauthenticated,
            Self::Forbidden => ErrorKind::Forbidden,
            Self::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Stable machine-readable code for the error body.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::Configuration(_) => "configuration_error",
            Self::Validation(_) => "validation_error",
            Self::UnsupportedMediaType(_) => "unsupported_media_type",
            Self::InvalidPath(_) => "invalid_path",
            Self::EmptyUpload => "empty_upload",
            Self::InvalidCsv(_) => "invalid_csv",
            Self::MissingRequiredColumn { .. } => "missing_required_column",
            Self::PayloadTooLarge { .. } => "payload_too_large",
            Self::ProviderUnavailable(_) => "provider_unavailable",
            Self::RefreshFailed { .. } => "refresh_failed",
            Self::Unauthenticated => "unauthenticated",
            Self::Forbidden => "forbidden",
            Self::Internal(_) => "internal_error",
        }
    }

    /// Client-visible body. Internal, provider and path detail stays in the log.
    #[must_use]
    pub fn body(&self) -> ErrorBody {
        let error = match self {
            Self::Internal(_) => "internal server error".to_string(),
            Self::InvalidPath(_) => "invalid upload path".to_string(),
            Self::ProviderUnavailable(_) => "screening provider unavailable".to_string(),
            Self::Configuration(_) => "service misconfigured".to_string(),
            other => other.to_string(),
        };
        let (limit_mb, validation_errors, active_generation) = match self {
            Self::PayloadTooLarge { limit_mb } => (Some(*limit_mb), None, None),
            Self::RefreshFailed { validation_errors, active_generation, .. } => {
                (None, Some(validation_errors.clone()), *active_generation)
            }
            _ => (None, None, None),
        };
        ErrorBody { error, code: self.code(), limit_mb, validation_errors, active_generation }
    }
}

impl From<ScreeningError> for ApiError {
    fn from(value: ScreeningError) -> Self {
        match value {
            ScreeningError::Validation(message) => Self::Validation(message),
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ErrorBody {
    pub error: String,
    pub code: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit_mb: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub validation_errors: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub active_generation: Option<u64>,
}
