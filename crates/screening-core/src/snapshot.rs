use std::collections::{BTreeMap, BTreeSet, HashMap};

use sha2::{Digest, Sha256};
use time::OffsetDateTime;

use crate::matching::{screen_candidates, subject_keys, AlgorithmConfig, EntityKeys};
use crate::{Entity, EntitySource, MatchRecord, ScreeningSubject};

/// Immutable, fully built in-memory index over one generation of entities.
#[derive(Debug)]
pub struct IndexSnapshot {
    generation: u64,
    built_at: OffsetDateTime,
    fingerprint: String,
    entities: Vec<Entity>,
    by_name_key: HashMap<String, Vec<usize>>,
    by_document: HashMap<String, Vec<usize>>,
}

impl IndexSnapshot {
    #[must_use]
    pub fn build(generation: u64, entities: Vec<Entity>) -> Self {
        let mut by_name_key: HashMap<String, Vec<usize>> = HashMap::new();
        let mut by_document: HashMap<String, Vec<usize>> = HashMap::new();

        for (index, entity) in entities.iter().enumerate() {
            let keys = EntityKeys::for_entity(entity);
            for key in keys.name_keys {
                by_name_key.entry(key).or_default().push(index);
            }
            for key in keys.document_keys {
                by_document.entry(key).or_default().push(index);
            }
        }

        Self {
            generation,
            built_at: OffsetDateTime::now_utc(),
            fingerprint: compute_fingerprint(&entities),
            entities,
            by_name_key,
            by_document,
        }
    }

    #[must_use]
    pub fn empty(generation: u64) -> Self {
        Self::build(generation, Vec::new())
    }

    #[must_use]
    pub fn generation(&self) -> u64 {
        self.generation
    }

    #[must_use]
    pub fn built_at(&self) -> OffsetDateTime {
        self.built_at
    }

    #[must_use]
    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entities.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    #[must_use]
    pub fn entities(&self) -> &[Entity] {
        &self.entities
    }

    #[must_use]
    pub fn counts_by_source(&self) -> BTreeMap<EntitySource, usize> {
        let mut counts = BTreeMap::new();
        for entity in &self.entities {
            *counts.entry(entity.source).or_insert(0) += 1;
        }
        counts
    }

    /// Entities sharing at least one name key or document number with the subject.
    #[must_use]
    pub fn candidates(&self, subject: &ScreeningSubject) -> Vec<&Entity> {
        let keys = subject_keys(subject);
        let mut indexes = BTreeSet::new();
        for key in &keys.name_keys {
            if let Some(found) = self.by_name_key.get(key) {
                indexes.extend(found.iter().copied());
            }
        }
        for key in &keys.document_keys {
            if let Some(found) = self.by_document.get(key) {
                indexes.extend(found.iter().copied());
            }
        }
        indexes.into_iter().filter_map(|index| self.entities.get(index)).collect()
    }

    #[must_use]
    pub fn screen(&self, subject: &ScreeningSubject, config: &AlgorithmConfig) -> Vec<MatchRecord> {
        screen_candidates(subject, self.candidates(subject), config)
    }
}

fn compute_fingerprint(entities: &[Entity]) -> String {
    let mut ids = entities
        .iter()
        .map(|entity| format!("{}:{}", entity.source, entity.id))
        .collect::<Vec<_>>();
    ids.sort_unstable();

    let mut hasher = Sha256::new();
    for id in ids {
        hasher.update(id.as_bytes());
        hasher.update(b"\n");
    }
    let digest_hex = format!("{:x}", hasher.finalize());
    format!("snap_{}", &digest_hex[..16])
}
