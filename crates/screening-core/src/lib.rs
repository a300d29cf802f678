use std::fmt::{Display, Formatter};
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use ulid::Ulid;

mod matching;
mod snapshot;

pub use matching::{
    normalize_document, normalize_name, score_entity, screen_candidates, subject_keys,
    AlgorithmConfig, EntityKeys,
};
pub use snapshot::IndexSnapshot;

pub const NAME_MIN_CHARS: usize = 2;
pub const NAME_MAX_CHARS: usize = 200;
pub const FIELD_MAX_CHARS: usize = 100;

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum ScreeningError {
    #[error("validation error: {0}")]
    Validation(String),
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct ScreeningId(pub Ulid);

impl ScreeningId {
    #[must_use]
    pub fn new() -> Self {
        Self(Ulid::new())
    }
}

impl Default for ScreeningId {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for ScreeningId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for ScreeningId {
    type Err = ScreeningError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Ulid::from_string(value)
            .map(Self)
            .map_err(|err| ScreeningError::Validation(format!("invalid screening id: {err}")))
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum EntitySource {
    #[serde(rename = "OFAC")]
    Ofac,
    #[serde(rename = "UN")]
    Un,
}

impl EntitySource {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Ofac => "OFAC",
            Self::Un => "UN",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_uppercase().as_str() {
            "OFAC" => Some(Self::Ofac),
            "UN" => Some(Self::Un),
            _ => None,
        }
    }
}

impl Display for EntitySource {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum EntityType {
    Individual,
    Entity,
    Vessel,
    Aircraft,
    #[default]
    Unknown,
}

impl EntityType {
    #[must_use]
    pub fn parse(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "individual" => Self::Individual,
            "entity" => Self::Entity,
            "vessel" => Self::Vessel,
            "aircraft" => Self::Aircraft,
            _ => Self::Unknown,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IdentityDocument {
    #[serde(rename = "type")]
    pub doc_type: Option<String>,
    pub number: String,
    #[serde(default)]
    pub country: Option<String>,
}

/// One screenable record from a source sanctions list.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Entity {
    pub id: String,
    pub source: EntitySource,
    #[serde(rename = "type", default)]
    pub entity_type: EntityType,
    pub name: String,
    #[serde(default)]
    pub all_names: Vec<String>,
    #[serde(default)]
    pub aliases: Vec<String>,
    #[serde(default)]
    pub first_name: Option<String>,
    #[serde(default)]
    pub last_name: Option<String>,
    #[serde(default)]
    pub countries: Vec<String>,
    #[serde(default)]
    pub identity_documents: Vec<IdentityDocument>,
    #[serde(default)]
    pub program: Option<String>,
    #[serde(default)]
    pub date_of_birth: Option<String>,
    #[serde(default)]
    pub nationality: Option<String>,
}

impl Entity {
    /// Primary name followed by every distinct alternate spelling and alias.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        let mut seen = std::collections::BTreeSet::new();
        std::iter::once(self.name.as_str())
            .chain(self.all_names.iter().map(String::as_str))
            .chain(self.aliases.iter().map(String::as_str))
            .filter(move |name| !name.trim().is_empty() && seen.insert(*name))
    }

    #[must_use]
    pub fn is_alias(&self, name: &str) -> bool {
        name != self.name && self.aliases.iter().any(|alias| alias == name)
    }
}

/// Raw, unvalidated screening request fields.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct SubjectInput {
    pub name: String,
    #[serde(default)]
    pub document_number: Option<String>,
    #[serde(default)]
    pub document_type: Option<String>,
    #[serde(default)]
    pub date_of_birth: Option<String>,
    #[serde(default)]
    pub nationality: Option<String>,
    #[serde(default)]
    pub country: Option<String>,
    #[serde(default)]
    pub analyst: Option<String>,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ScreeningSubject {
    name: String,
    document_number: Option<String>,
    document_type: Option<String>,
    date_of_birth: Option<String>,
    nationality: Option<String>,
    country: Option<String>,
    analyst: Option<String>,
}

impl ScreeningSubject {
    /// Validate raw input into an immutable subject.
    ///
    /// # Errors
    /// Returns [`ScreeningError::Validation`] when the name is missing, too short, too long,
    /// has no letters or digits, or when an optional field exceeds its length limit.
    pub fn new(input: SubjectInput) -> Result<Self, ScreeningError> {
        let name = input.name.trim().to_string();
        let name_chars = name.chars().count();
        if name.is_empty() {
            return Err(ScreeningError::Validation("name MUST be provided".to_string()));
        }
        if name_chars < NAME_MIN_CHARS {
            return Err(ScreeningError::Validation(format!(
                "name MUST be at least {NAME_MIN_CHARS} characters"
            )));
        }
        if name_chars > NAME_MAX_CHARS {
            return Err(ScreeningError::Validation(format!(
                "name MUST be at most {NAME_MAX_CHARS} characters"
            )));
        }
        if name.chars().any(char::is_control) {
            return Err(ScreeningError::Validation(
                "name MUST NOT contain control characters".to_string(),
            ));
        }
        if !name.chars().any(char::is_alphanumeric) {
            return Err(ScreeningError::Validation(
                "name MUST contain at least one letter or digit".to_string(),
            ));
        }

        Ok(Self {
            name,
            document_number: optional_field("document_number", input.document_number)?,
            document_type: optional_field("document_type", input.document_type)?,
            date_of_birth: optional_field("date_of_birth", input.date_of_birth)?,
            nationality: optional_field("nationality", input.nationality)?,
            country: optional_field("country", input.country)?,
            analyst: optional_field("analyst", input.analyst)?,
        })
    }

    /// Subject with only a name.
    ///
    /// # Errors
    /// Same as [`ScreeningSubject::new`].
    pub fn named(name: &str) -> Result<Self, ScreeningError> {
        Self::new(SubjectInput { name: name.to_string(), ..SubjectInput::default() })
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn document_number(&self) -> Option<&str> {
        self.document_number.as_deref()
    }

    #[must_use]
    pub fn document_type(&self) -> Option<&str> {
        self.document_type.as_deref()
    }

    #[must_use]
    pub fn date_of_birth(&self) -> Option<&str> {
        self.date_of_birth.as_deref()
    }

    #[must_use]
    pub fn nationality(&self) -> Option<&str> {
        self.nationality.as_deref()
    }

    #[must_use]
    pub fn country(&self) -> Option<&str> {
        self.country.as_deref()
    }

    #[must_use]
    pub fn analyst(&self) -> Option<&str> {
        self.analyst.as_deref()
    }
}

fn optional_field(field: &str, value: Option<String>) -> Result<Option<String>, ScreeningError> {
    let Some(value) = value else {
        return Ok(None);
    };
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Ok(None);
    }
    if trimmed.chars().count() > FIELD_MAX_CHARS {
        return Err(ScreeningError::Validation(format!(
            "{field} MUST be at most {FIELD_MAX_CHARS} characters"
        )));
    }
    Ok(Some(trimmed.to_string()))
}

/// Per-field match strength, each a percentage in `[0, 100]`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Default)]
pub struct ConfidenceBreakdown {
    pub overall: f64,
    pub name: f64,
    pub document: f64,
    pub dob: f64,
    pub nationality: f64,
    pub address: f64,
}

impl ConfidenceBreakdown {
    #[must_use]
    pub fn clamped(self) -> Self {
        Self {
            overall: clamp_percentage(self.overall),
            name: clamp_percentage(self.name),
            document: clamp_percentage(self.document),
            dob: clamp_percentage(self.dob),
            nationality: clamp_percentage(self.nationality),
            address: clamp_percentage(self.address),
        }
    }

    #[must_use]
    pub fn is_bounded(&self) -> bool {
        [self.overall, self.name, self.document, self.dob, self.nationality, self.address]
            .iter()
            .all(|value| (0.0..=100.0).contains(value))
    }
}

fn clamp_percentage(value: f64) -> f64 {
    if value.is_nan() {
        return 0.0;
    }
    (value.clamp(0.0, 100.0) * 10.0).round() / 10.0
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Recommendation {
    AutoClear,
    Approve,
    ManualReview,
    LowConfidenceReview,
    AutoEscalate,
    Reject,
}

impl Recommendation {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::AutoClear => "AUTO_CLEAR",
            Self::Approve => "APPROVE",
            Self::ManualReview => "MANUAL_REVIEW",
            Self::LowConfidenceReview => "LOW_CONFIDENCE_REVIEW",
            Self::AutoEscalate => "AUTO_ESCALATE",
            Self::Reject => "REJECT",
        }
    }

    /// Cleared and approved matches are returned for audit but are not hits.
    #[must_use]
    pub fn counts_as_hit(self) -> bool {
        !matches!(self, Self::AutoClear | Self::Approve)
    }
}

/// Ordinal of the matching stage that produced a match, `1..=4`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(try_from = "u8", into = "u8")]
pub struct MatchLayer(u8);

impl MatchLayer {
    pub const DOCUMENT: Self = Self(1);
    pub const EXACT_NAME: Self = Self(2);
    pub const FUZZY_NAME: Self = Self(3);
    pub const CONTRADICTED: Self = Self(4);

    #[must_use]
    pub fn get(self) -> u8 {
        self.0
    }
}

impl TryFrom<u8> for MatchLayer {
    type Error = ScreeningError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        if (1..=4).contains(&value) {
            Ok(Self(value))
        } else {
            Err(ScreeningError::Validation(format!("match_layer MUST be in 1..=4, got {value}")))
        }
    }
}

impl From<MatchLayer> for u8 {
    fn from(value: MatchLayer) -> Self {
        value.0
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MatchRecord {
    pub entity: Entity,
    pub confidence: ConfidenceBreakdown,
    #[serde(default)]
    pub flags: Vec<String>,
    pub recommendation: Recommendation,
    pub match_layer: MatchLayer,
    pub matched_name: String,
    #[serde(default)]
    pub matched_document: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ScreeningOutcome {
    pub screening_id: ScreeningId,
    #[serde(with = "time::serde::rfc3339")]
    pub screening_date: OffsetDateTime,
    pub is_hit: bool,
    pub hit_count: usize,
    pub matches: Vec<MatchRecord>,
    pub algorithm_version: String,
    pub processing_time_ms: u64,
    #[serde(default)]
    pub snapshot_generation: Option<u64>,
}

impl ScreeningOutcome {
    #[must_use]
    pub fn from_matches(
        matches: Vec<MatchRecord>,
        algorithm_version: &str,
        snapshot_generation: Option<u64>,
        elapsed: Duration,
    ) -> Self {
        let hit_count = matches.iter().filter(|m| m.recommendation.counts_as_hit()).count();
        Self {
            screening_id: ScreeningId::new(),
            screening_date: OffsetDateTime::now_utc(),
            is_hit: hit_count > 0,
            hit_count,
            matches,
            algorithm_version: algorithm_version.to_string(),
            processing_time_ms: u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX),
            snapshot_generation,
        }
    }
}
