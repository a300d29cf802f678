use std::cmp::Ordering;
use std::collections::{BTreeSet, HashMap};

use serde::{Deserialize, Serialize};

use crate::{
    ConfidenceBreakdown, Entity, MatchLayer, MatchRecord, Recommendation, ScreeningError,
    ScreeningSubject,
};

const NAME_KEY_CHARS: usize = 4;
const NAME_WEIGHT: f64 = 0.55;
const DOCUMENT_WEIGHT: f64 = 0.2;
const DOB_WEIGHT: f64 = 0.15;
const NATIONALITY_WEIGHT: f64 = 0.07;
const ADDRESS_WEIGHT: f64 = 0.03;
const DOCUMENT_MATCH_FLOOR: f64 = 95.0;
const SUBSET_NAME_SCORE: f64 = 90.0;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AlgorithmConfig {
    pub name: String,
    pub version: String,
    pub name_threshold: f64,
    pub short_name_threshold: f64,
    pub max_matches: usize,
}

impl Default for AlgorithmConfig {
    fn default() -> Self {
        Self {
            name: "layered-name-document".to_string(),
            version: "2.0.0".to_string(),
            name_threshold: 85.0,
            short_name_threshold: 95.0,
            max_matches: 10,
        }
    }
}

impl AlgorithmConfig {
    /// Check thresholds and limits.
    ///
    /// # Errors
    /// Returns [`ScreeningError::Validation`] when a threshold falls outside `[0, 100]`,
    /// `max_matches` is zero, or the version tag is blank.
    pub fn validate(&self) -> Result<(), ScreeningError> {
        for (field, value) in [
            ("name_threshold", self.name_threshold),
            ("short_name_threshold", self.short_name_threshold),
        ] {
            if !(0.0..=100.0).contains(&value) {
                return Err(ScreeningError::Validation(format!(
                    "algorithm.{field} MUST be in [0, 100], got {value}"
                )));
            }
        }
        if self.max_matches == 0 {
            return Err(ScreeningError::Validation(
                "algorithm.max_matches MUST be >= 1".to_string(),
            ));
        }
        if self.version.trim().is_empty() {
            return Err(ScreeningError::Validation(
                "algorithm.version MUST be provided".to_string(),
            ));
        }
        Ok(())
    }
}

/// Lookup keys shared by the in-memory index and the persistent store.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EntityKeys {
    pub name_keys: BTreeSet<String>,
    pub document_keys: BTreeSet<String>,
}

impl EntityKeys {
    #[must_use]
    pub fn for_entity(entity: &Entity) -> Self {
        let mut keys = Self::default();
        for name in entity.names() {
            keys.name_keys.extend(name_keys(&normalize_name(name)));
        }
        for document in &entity.identity_documents {
            let normalized = normalize_document(&document.number);
            if !normalized.is_empty() {
                keys.document_keys.insert(normalized);
            }
        }
        keys
    }
}

#[must_use]
pub fn subject_keys(subject: &ScreeningSubject) -> EntityKeys {
    let mut keys = EntityKeys {
        name_keys: name_keys(&normalize_name(subject.name())),
        document_keys: BTreeSet::new(),
    };
    if let Some(document) = subject.document_number() {
        let normalized = normalize_document(document);
        if !normalized.is_empty() {
            keys.document_keys.insert(normalized);
        }
    }
    keys
}

fn name_keys(normalized: &str) -> BTreeSet<String> {
    normalized
        .split(' ')
        .filter(|token| token.chars().count() >= 2)
        .map(|token| token.chars().take(NAME_KEY_CHARS).collect())
        .collect()
}

/// Lowercase, fold common Latin accents, and collapse punctuation to single spaces.
#[must_use]
pub fn normalize_name(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut pending_space = false;
    for ch in raw.chars().flat_map(char::to_lowercase) {
        let folded = fold_accent(ch);
        if folded.is_alphanumeric() {
            if pending_space && !out.is_empty() {
                out.push(' ');
            }
            pending_space = false;
            out.push(folded);
        } else {
            pending_space = true;
        }
    }
    out
}

#[must_use]
pub fn normalize_document(raw: &str) -> String {
    raw.chars().filter(char::is_ascii_alphanumeric).map(|ch| ch.to_ascii_uppercase()).collect()
}

fn fold_accent(ch: char) -> char {
    match ch {
        'á' | 'à' | 'â' | 'ä' | 'ã' | 'å' => 'a',
        'é' | 'è' | 'ê' | 'ë' => 'e',
        'í' | 'ì' | 'î' | 'ï' => 'i',
        'ó' | 'ò' | 'ô' | 'ö' | 'õ' | 'ø' => 'o',
        'ú' | 'ù' | 'û' | 'ü' => 'u',
        'ñ' => 'n',
        'ç' => 'c',
        'ý' | 'ÿ' => 'y',
        other => other,
    }
}

#[allow(clippy::cast_precision_loss)]
fn ratio(numerator: usize, denominator: usize) -> f64 {
    if denominator == 0 {
        return 0.0;
    }
    numerator as f64 / denominator as f64
}

fn bigrams(value: &str) -> Vec<(char, char)> {
    let chars = value.chars().collect::<Vec<_>>();
    chars.windows(2).map(|pair| (pair[0], pair[1])).collect()
}

fn bigram_dice(left: &str, right: &str) -> f64 {
    let left_bigrams = bigrams(left);
    let right_bigrams = bigrams(right);
    if left_bigrams.is_empty() || right_bigrams.is_empty() {
        return if left == right { 1.0 } else { 0.0 };
    }

    let mut counts: HashMap<(char, char), usize> = HashMap::new();
    for bigram in &left_bigrams {
        *counts.entry(*bigram).or_insert(0) += 1;
    }
    let mut overlap = 0;
    for bigram in &right_bigrams {
        if let Some(count) = counts.get_mut(bigram) {
            if *count > 0 {
                *count -= 1;
                overlap += 1;
            }
        }
    }
    ratio(2 * overlap, left_bigrams.len() + right_bigrams.len())
}

/// Similarity of two normalized names as a percentage.
fn name_similarity(subject: &str, candidate: &str) -> f64 {
    if subject.is_empty() || candidate.is_empty() {
        return 0.0;
    }
    if subject == candidate {
        return 100.0;
    }

    let subject_tokens = subject.split(' ').collect::<BTreeSet<_>>();
    let candidate_tokens = candidate.split(' ').collect::<BTreeSet<_>>();
    let shared = subject_tokens.intersection(&candidate_tokens).count();
    let token_set = ratio(shared, subject_tokens.len().max(candidate_tokens.len()));
    if (token_set - 1.0).abs() < f64::EPSILON {
        return 100.0;
    }

    let sorted_subject = subject_tokens.iter().copied().collect::<Vec<_>>().join(" ");
    let sorted_candidate = candidate_tokens.iter().copied().collect::<Vec<_>>().join(" ");
    let dice = bigram_dice(&sorted_subject, &sorted_candidate);

    let mut score = token_set.max(dice) * 100.0;
    if subject_tokens.len() >= 2 && shared == subject_tokens.len() {
        score = score.max(SUBSET_NAME_SCORE);
    }
    score.clamp(0.0, 100.0)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct DateParts {
    year: i32,
    month: Option<u8>,
    day: Option<u8>,
}

fn month_from_word(word: &str) -> Option<u8> {
    let prefix = word.chars().take(3).collect::<String>().to_ascii_lowercase();
    let month = match prefix.as_str() {
        "jan" | "ene" => 1,
        "feb" => 2,
        "mar" => 3,
        "apr" | "abr" => 4,
        "may" => 5,
        "jun" => 6,
        "jul" => 7,
        "aug" | "ago" => 8,
        "sep" | "set" => 9,
        "oct" => 10,
        "nov" => 11,
        "dec" | "dic" => 12,
        _ => return None,
    };
    Some(month)
}

/// Accepts `YYYY-MM-DD`, `DD/MM/YYYY`, `12 Jan 1960`, and bare years.
fn parse_date(raw: &str) -> Option<DateParts> {
    let tokens = raw
        .split(|ch: char| !ch.is_alphanumeric())
        .filter(|token| !token.is_empty())
        .collect::<Vec<_>>();

    let year_index = tokens
        .iter()
        .position(|t| t.len() == 4 && t.chars().all(|c| c.is_ascii_digit()))?;
    let year = tokens[year_index].parse::<i32>().ok()?;
    let word_month = tokens.iter().find_map(|t| month_from_word(t));
    let small_numbers = tokens
        .iter()
        .enumerate()
        .filter(|(index, token)| {
            *index != year_index && token.len() <= 2 && token.chars().all(|c| c.is_ascii_digit())
        })
        .filter_map(|(_, token)| token.parse::<u8>().ok())
        .collect::<Vec<_>>();

    let (month, day) = match (word_month, small_numbers.as_slice()) {
        (Some(month), [day, ..]) => (Some(month), Some(*day)),
        (Some(month), []) => (Some(month), None),
        (None, [first, second, ..]) if year_index == 0 => (Some(*first), Some(*second)),
        (None, [first, second, ..]) => (Some(*second), Some(*first)),
        (None, [only]) => (Some(*only), None),
        (None, []) => (None, None),
    };

    Some(DateParts { year, month, day })
}

fn dob_score(subject: Option<&str>, entity: Option<&str>) -> Option<f64> {
    let subject = parse_date(subject?)?;
    let entity = parse_date(entity?)?;
    if subject.year != entity.year {
        return Some(0.0);
    }
    let both_complete = subject.month.is_some()
        && subject.day.is_some()
        && entity.month.is_some()
        && entity.day.is_some();
    if !both_complete {
        return Some(60.0);
    }
    if subject.month == entity.month && subject.day == entity.day {
        Some(100.0)
    } else {
        Some(20.0)
    }
}

fn place_score<'a>(
    subject: Option<&str>,
    candidates: impl Iterator<Item = &'a str>,
) -> Option<f64> {
    let subject = normalize_name(subject?);
    if subject.is_empty() {
        return None;
    }
    let candidates = candidates.map(normalize_name).filter(|c| !c.is_empty()).collect::<Vec<_>>();
    if candidates.is_empty() {
        return None;
    }
    if candidates.iter().any(|candidate| *candidate == subject) {
        Some(100.0)
    } else {
        Some(0.0)
    }
}

fn weighted_overall(parts: &[(Option<f64>, f64)]) -> f64 {
    let (sum, weight) = parts.iter().fold((0.0, 0.0), |(sum, weight), (score, w)| match score {
        Some(score) => (sum + score * w, weight + w),
        None => (sum, weight),
    });
    if weight <= 0.0 {
        0.0
    } else {
        sum / weight
    }
}

/// Score one entity against a subject; `None` when it is not a match.
#[must_use]
pub fn score_entity(
    subject: &ScreeningSubject,
    entity: &Entity,
    config: &AlgorithmConfig,
) -> Option<MatchRecord> {
    let subject_name = normalize_name(subject.name());
    let short_name = !subject_name.contains(' ');
    let threshold = if short_name { config.short_name_threshold } else { config.name_threshold };

    let (name_score, matched_name) = entity
        .names()
        .map(|name| (name_similarity(&subject_name, &normalize_name(name)), name))
        .max_by(|left, right| left.0.total_cmp(&right.0))?;

    let subject_document = subject.document_number().map(normalize_document);
    let matched_document = subject_document.as_ref().and_then(|wanted| {
        entity
            .identity_documents
            .iter()
            .find(|document| !wanted.is_empty() && normalize_document(&document.number) == *wanted)
            .map(|document| document.number.clone())
    });
    let document_score = match (&subject_document, &matched_document) {
        (_, Some(_)) => Some(100.0),
        (Some(_), None) if !entity.identity_documents.is_empty() => Some(0.0),
        _ => None,
    };
    let document_match = matched_document.is_some();

    if !document_match && name_score < threshold {
        return None;
    }

    let dob = dob_score(subject.date_of_birth(), entity.date_of_birth.as_deref());
    let nationality = place_score(
        subject.nationality(),
        entity
            .nationality
            .iter()
            .map(String::as_str)
            .chain(entity.countries.iter().map(String::as_str)),
    );
    let address = place_score(subject.country(), entity.countries.iter().map(String::as_str));

    let dob_contradicts = dob.is_some_and(|score| score < 50.0);
    let nationality_contradicts = nationality.is_some_and(|score| score < 50.0);
    let contradicted = dob_contradicts || nationality_contradicts;
    let corroborated = dob.is_some_and(|score| score >= 100.0)
        || nationality.is_some_and(|score| score >= 100.0);

    let mut overall = weighted_overall(&[
        (Some(name_score), NAME_WEIGHT),
        (document_score, DOCUMENT_WEIGHT),
        (dob, DOB_WEIGHT),
        (nationality, NATIONALITY_WEIGHT),
        (address, ADDRESS_WEIGHT),
    ]);
    if document_match {
        overall = overall.max(DOCUMENT_MATCH_FLOOR);
    }

    let exact_name = name_score >= 100.0;
    let (match_layer, recommendation) = if document_match {
        let recommendation = if name_score < threshold {
            Recommendation::ManualReview
        } else if corroborated && !contradicted {
            Recommendation::Reject
        } else {
            Recommendation::AutoEscalate
        };
        (MatchLayer::DOCUMENT, recommendation)
    } else if contradicted {
        let recommendation = if dob_contradicts && nationality_contradicts {
            Recommendation::AutoClear
        } else {
            Recommendation::LowConfidenceReview
        };
        (MatchLayer::CONTRADICTED, recommendation)
    } else if exact_name {
        let recommendation =
            if corroborated { Recommendation::AutoEscalate } else { Recommendation::ManualReview };
        (MatchLayer::EXACT_NAME, recommendation)
    } else {
        let recommendation = if name_score >= (threshold + 100.0) / 2.0 {
            Recommendation::ManualReview
        } else {
            Recommendation::LowConfidenceReview
        };
        (MatchLayer::FUZZY_NAME, recommendation)
    };

    let mut flags = Vec::new();
    if document_match {
        flags.push("DOCUMENT_MATCH".to_string());
    }
    if exact_name {
        flags.push("EXACT_NAME".to_string());
    }
    if entity.is_alias(matched_name) {
        flags.push("ALIAS_MATCH".to_string());
    }
    if short_name {
        flags.push("SHORT_NAME".to_string());
    }
    match dob {
        Some(score) if score >= 100.0 => flags.push("DOB_MATCH".to_string()),
        Some(score) if score < 50.0 => flags.push("DOB_MISMATCH".to_string()),
        _ => {}
    }
    match nationality {
        Some(score) if score >= 100.0 => flags.push("NATIONALITY_MATCH".to_string()),
        Some(_) => flags.push("NATIONALITY_MISMATCH".to_string()),
        None => {}
    }

    Some(MatchRecord {
        entity: entity.clone(),
        confidence: ConfidenceBreakdown {
            overall,
            name: name_score,
            document: document_score.unwrap_or(0.0),
            dob: dob.unwrap_or(0.0),
            nationality: nationality.unwrap_or(0.0),
            address: address.unwrap_or(0.0),
        }
        .clamped(),
        flags,
        recommendation,
        match_layer,
        matched_name: matched_name.to_string(),
        matched_document,
    })
}

/// Score every candidate and return ranked matches, best first.
#[must_use]
pub fn screen_candidates<'a>(
    subject: &ScreeningSubject,
    candidates: impl IntoIterator<Item = &'a Entity>,
    config: &AlgorithmConfig,
) -> Vec<MatchRecord> {
    let mut matches = candidates
        .into_iter()
        .filter_map(|entity| score_entity(subject, entity, config))
        .collect::<Vec<_>>();
    matches.sort_by(|left, right| {
        right
            .confidence
            .overall
            .total_cmp(&left.confidence.overall)
            .then_with(|| left.match_layer.cmp(&right.match_layer))
            .then_with(|| match left.entity.source.cmp(&right.entity.source) {
                Ordering::Equal => left.entity.id.cmp(&right.entity.id),
                other => other,
            })
    });
    matches.truncate(config.max_matches);
    matches
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;
    use crate::{EntitySource, EntityType, IdentityDocument, SubjectInput};

    fn entity(id: &str, name: &str) -> Entity {
        Entity {
            id: id.to_string(),
            source: EntitySource::Ofac,
            entity_type: EntityType::Individual,
            name: name.to_string(),
            all_names: vec![name.to_string()],
            aliases: Vec::new(),
            first_name: None,
            last_name: None,
            countries: vec!["Venezuela".to_string()],
            identity_documents: vec![IdentityDocument {
                doc_type: Some("Cedula No.".to_string()),
                number: "V-12.345.678".to_string(),
                country: Some("Venezuela".to_string()),
            }],
            program: Some("VENEZUELA".to_string()),
            date_of_birth: Some("12 Jan 1960".to_string()),
            nationality: Some("Venezuela".to_string()),
        }
    }

    fn subject(input: SubjectInput) -> ScreeningSubject {
        match ScreeningSubject::new(input) {
            Ok(subject) => subject,
            Err(err) => panic!("fixture subject should validate: {err}"),
        }
    }

    fn named(name: &str) -> ScreeningSubject {
        subject(SubjectInput { name: name.to_string(), ..SubjectInput::default() })
    }

    fn ymd(year: i32, month: u8, day: u8) -> Option<DateParts> {
        Some(DateParts { year, month: Some(month), day: Some(day) })
    }

    #[test]
    fn normalize_name_folds_accents_and_punctuation() {
        assert_eq!(normalize_name("  José  María O'Neil-Núñez "), "jose maria o neil nunez");
        assert_eq!(normalize_document("v-12.345.678"), "V12345678");
    }

    #[test]
    fn parse_date_handles_common_layouts() {
        assert_eq!(parse_date("1960-01-12"), ymd(1960, 1, 12));
        assert_eq!(parse_date("12/01/1960"), ymd(1960, 1, 12));
        assert_eq!(parse_date("12 Jan 1960"), ymd(1960, 1, 12));
        let bare_year = DateParts { year: 1960, month: None, day: None };
        assert_eq!(parse_date("circa 1960"), Some(bare_year));
        assert_eq!(parse_date("unknown"), None);
    }

    #[test]
    fn reordered_name_is_an_exact_match() {
        let candidate = entity("100", "PEREZ GOMEZ, Juan Carlos");
        let matched = score_entity(
            &named("Juan Carlos Perez Gomez"),
            &candidate,
            &AlgorithmConfig::default(),
        );
        let Some(matched) = matched else {
            panic!("reordered name should match");
        };
        assert_eq!(matched.match_layer, MatchLayer::EXACT_NAME);
        assert!(matched.flags.iter().any(|flag| flag == "EXACT_NAME"));
    }

    #[test]
    fn document_match_wins_layer_one_even_with_different_name() {
        let candidate = entity("100", "Juan Carlos Perez Gomez");
        let matched = score_entity(
            &subject(SubjectInput {
                name: "Pedro Ramirez".to_string(),
                document_number: Some("V12345678".to_string()),
                ..SubjectInput::default()
            }),
            &candidate,
            &AlgorithmConfig::default(),
        );
        let Some(matched) = matched else {
            panic!("document number should match");
        };
        assert_eq!(matched.match_layer, MatchLayer::DOCUMENT);
        assert_eq!(matched.recommendation, Recommendation::ManualReview);
        assert!(matched.confidence.overall >= DOCUMENT_MATCH_FLOOR);
        assert_eq!(matched.matched_document.as_deref(), Some("V-12.345.678"));
    }

    #[test]
    fn contradicting_dob_and_nationality_auto_clears() {
        let candidate = entity("100", "Juan Carlos Perez Gomez");
        let matched = score_entity(
            &subject(SubjectInput {
                name: "Juan Carlos Perez Gomez".to_string(),
                date_of_birth: Some("1991-05-05".to_string()),
                nationality: Some("Chile".to_string()),
                ..SubjectInput::default()
            }),
            &candidate,
            &AlgorithmConfig::default(),
        );
        let Some(matched) = matched else {
            panic!("name should still match");
        };
        assert_eq!(matched.match_layer, MatchLayer::CONTRADICTED);
        assert_eq!(matched.recommendation, Recommendation::AutoClear);
        assert!(!matched.recommendation.counts_as_hit());
    }

    #[test]
    fn unrelated_name_is_not_a_match() {
        let candidate = entity("100", "Juan Carlos Perez Gomez");
        let matched = score_entity(
            &named("Maria Fernanda Lopez"),
            &candidate,
            &AlgorithmConfig::default(),
        );
        assert!(matched.is_none());
    }

    #[test]
    fn short_names_use_the_stricter_threshold() {
        let candidate = entity("100", "Hamas");
        let config = AlgorithmConfig::default();
        assert!(score_entity(&named("Hamad"), &candidate, &config).is_none());
        assert!(score_entity(&named("HAMAS"), &candidate, &config).is_some());
    }

    #[test]
    fn screen_candidates_ranks_and_truncates() {
        let entities = vec![
            entity("1", "Juan Carlos Perez Gomez"),
            entity("2", "Juan Carlos Perez"),
            entity("3", "Juan Perez Gomez"),
        ];
        let config =
            AlgorithmConfig { max_matches: 2, name_threshold: 70.0, ..AlgorithmConfig::default() };
        let matches = screen_candidates(
            &named("Juan Carlos Perez Gomez"),
            &entities,
            &config,
        );
        assert_eq!(matches.len(), 2);
        assert_eq!(matches[0].entity.id, "1");
        assert!(matches[0].confidence.overall >= matches[1].confidence.overall);
    }

    #[test]
    fn algorithm_config_validation_rejects_bad_thresholds() {
        let config = AlgorithmConfig { name_threshold: 120.0, ..AlgorithmConfig::default() };
        assert!(config.validate().is_err());
        let config = AlgorithmConfig { max_matches: 0, ..AlgorithmConfig::default() };
        assert!(config.validate().is_err());
        assert!(AlgorithmConfig::default().validate().is_ok());
    }

    proptest! {
        #[test]
        fn sub_scores_stay_within_percentage_bounds(
            name in "[A-Za-z]{2,12}( [A-Za-z]{2,12}){0,3}",
            document in proptest::option::of("[A-Z0-9-]{1,12}"),
            dob in proptest::option::of("(19|20)[0-9]{2}-(0[1-9]|1[0-2])-(0[1-9]|1[0-9])"),
        ) {
            let subject = ScreeningSubject::new(SubjectInput {
                name: name.clone(),
                document_number: document,
                date_of_birth: dob,
                nationality: Some("Venezuela".to_string()),
                ..SubjectInput::default()
            });
            prop_assume!(subject.is_ok());
            let Ok(subject) = subject else { return Ok(()); };
            let config = AlgorithmConfig {
                name_threshold: 0.0,
                short_name_threshold: 0.0,
                ..AlgorithmConfig::default()
            };
            let candidates = vec![entity("1", &name), entity("2", "Juan Carlos Perez Gomez")];
            for matched in screen_candidates(&subject, &candidates, &config) {
                prop_assert!(matched.confidence.is_bounded());
                prop_assert!((1..=4).contains(&matched.match_layer.get()));
            }
        }
    }
}
