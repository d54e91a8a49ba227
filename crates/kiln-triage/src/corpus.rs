//! In-memory failure signature corpus.
//!
//! Signatures live in a `DashMap` keyed by [`TemplateKey`]. Updates to one
//! key lock only that key's shard entry, so unrelated signatures are updated
//! concurrently and racing creations of the same template merge.

use crate::parser::normalize;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use kiln_core::ids::{SignatureId, TemplateKey};
use kiln_core::ports::CorpusStore;
use kiln_core::triage::{FailureCategory, FailureSignature};
use kiln_core::Result;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use tracing::info;

/// Stable arena key for a normalized template within a category.
pub fn template_key(category: FailureCategory, template: &str) -> TemplateKey {
    let mut hasher = Sha256::new();
    hasher.update(category.as_str().as_bytes());
    hasher.update([0u8]);
    hasher.update(template.as_bytes());
    let hash = hasher.finalize();
    TemplateKey::new(hex::encode(&hash[..16]))
}

#[derive(Default)]
pub struct SignatureCorpus {
    entries: DashMap<TemplateKey, FailureSignature>,
}

impl SignatureCorpus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert signatures, re-keying them by normalized template.
    ///
    /// Signatures that collide on a key are merged. Returns the number of
    /// distinct keys touched.
    pub fn seed(&self, signatures: impl IntoIterator<Item = FailureSignature>) -> usize {
        let mut touched = 0;
        for mut signature in signatures {
            signature.template = normalize(&signature.template);
            signature.key = template_key(signature.category, &signature.template);
            match self.entries.entry(signature.key.clone()) {
                Entry::Occupied(mut existing) => existing.get_mut().merge(signature),
                Entry::Vacant(slot) => {
                    slot.insert(signature);
                    touched += 1;
                }
            }
        }
        touched
    }

    /// Load every persisted signature from the store.
    pub async fn load(&self, store: &dyn CorpusStore) -> Result<usize> {
        let signatures = store.load_corpus().await?;
        let loaded = self.seed(signatures);
        info!(signatures = loaded, "Failure corpus loaded");
        Ok(loaded)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, key: &TemplateKey) -> Option<FailureSignature> {
        self.entries.get(key).map(|entry| entry.value().clone())
    }

    pub fn find_by_id(&self, id: SignatureId) -> Option<FailureSignature> {
        self.entries
            .iter()
            .find(|entry| entry.id == id)
            .map(|entry| entry.value().clone())
    }

    /// All signatures, most frequent first.
    pub fn snapshot(&self) -> Vec<FailureSignature> {
        let mut signatures: Vec<FailureSignature> =
            self.entries.iter().map(|entry| entry.value().clone()).collect();
        signatures.sort_by(|a, b| {
            b.occurrence_count
                .cmp(&a.occurrence_count)
                .then_with(|| a.key.cmp(&b.key))
        });
        signatures
    }

    /// Total occurrences per category.
    pub fn category_counts(&self) -> HashMap<FailureCategory, u64> {
        let mut counts = HashMap::new();
        for entry in self.entries.iter() {
            *counts.entry(entry.category).or_insert(0) += entry.occurrence_count;
        }
        counts
    }

    pub(crate) fn entries(&self) -> &DashMap<TemplateKey, FailureSignature> {
        &self.entries
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kiln_adapters::MemoryCorpusStore;
    use kiln_core::triage::Fix;
    use pretty_assertions::assert_eq;

    fn raw_signature(template: &str, occurrences: u64) -> FailureSignature {
        FailureSignature::new(
            TemplateKey::new("unset"),
            FailureCategory::Link,
            template,
            "Missing HIP runtime library",
        )
        .with_occurrences(occurrences)
    }

    #[test]
    fn test_template_key_is_stable_and_category_scoped() {
        let a = template_key(FailureCategory::Link, "undefined reference to `hip*`");
        let b = template_key(FailureCategory::Link, "undefined reference to `hip*`");
        let c = template_key(FailureCategory::Compilation, "undefined reference to `hip*`");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.as_str().len(), 32);
    }

    #[test]
    fn test_seed_normalizes_and_merges() {
        let corpus = SignatureCorpus::new();
        let touched = corpus.seed(vec![
            raw_signature("undefined reference to `hipMalloc'", 2)
                .with_fix(Fix::new("link libamdhip64").with_history(3, 2)),
            raw_signature("undefined reference to `hipFree'", 3),
        ]);

        assert_eq!(touched, 1);
        assert_eq!(corpus.len(), 1);
        let key = template_key(FailureCategory::Link, "undefined reference to `hip*`");
        let merged = corpus.get(&key).unwrap();
        assert_eq!(merged.template, "undefined reference to `hip*`");
        assert_eq!(merged.occurrence_count, 5);
        assert_eq!(merged.fixes.len(), 1);
    }

    #[test]
    fn test_category_counts_and_snapshot_order() {
        let corpus = SignatureCorpus::new();
        corpus.seed(vec![
            raw_signature("undefined reference to `hip*`", 4),
            raw_signature("multiple definition of `main`", 1),
            FailureSignature::new(
                TemplateKey::new("unset"),
                FailureCategory::Config,
                "CMake Error at CMakeLists.txt",
                "CMake failed",
            )
            .with_occurrences(2),
        ]);

        let counts = corpus.category_counts();
        assert_eq!(counts.get(&FailureCategory::Link), Some(&5));
        assert_eq!(counts.get(&FailureCategory::Config), Some(&2));

        let snapshot = corpus.snapshot();
        assert_eq!(snapshot[0].occurrence_count, 4);
        assert_eq!(snapshot[2].occurrence_count, 1);
        assert!(corpus.find_by_id(snapshot[1].id).is_some());
    }

    #[tokio::test]
    async fn test_load_from_store() {
        let store = MemoryCorpusStore::with_signatures(vec![raw_signature(
            "undefined reference to `hip*`",
            7,
        )]);
        let corpus = SignatureCorpus::new();
        assert_eq!(corpus.load(&store).await.unwrap(), 1);
        assert!(!corpus.is_empty());
    }
}
