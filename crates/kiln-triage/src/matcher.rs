//! Pattern matcher: ranks corpus signatures against an event and folds the
//! event back into the corpus.

use crate::config::TriageConfig;
use crate::corpus::{SignatureCorpus, template_key};
use crate::similarity::cosine_similarity;
use chrono::Utc;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use kiln_core::events::{Event, SignatureCreatedPayload};
use kiln_core::ids::{SignatureId, TemplateKey};
use kiln_core::ports::{CorpusStore, EventBus};
use kiln_core::triage::{ErrorEvent, FailureCategory, FailureSignature, Fix};
use kiln_core::{Error, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

const PERSIST_BACKOFF_MS: u64 = 10;

/// A ranked candidate signature for one event.
#[derive(Debug, Clone)]
pub struct SignatureMatch {
    pub signature: FailureSignature,
    pub score: f64,
    /// Same category and equal template or cosine at or above the threshold.
    pub strong: bool,
}

/// Result of folding one event into the corpus.
#[derive(Debug, Clone)]
pub struct Observation {
    /// Existing signatures ranked by score, best first.
    pub matches: Vec<SignatureMatch>,
    pub key: Option<TemplateKey>,
    pub created: bool,
    /// False when the corpus store rejected the write. The in-memory corpus
    /// keeps the update and the next write of the key carries it.
    pub persisted: bool,
}

impl Observation {
    pub fn best(&self) -> Option<&SignatureMatch> {
        self.matches.first()
    }
}

pub struct PatternMatcher {
    corpus: Arc<SignatureCorpus>,
    store: Arc<dyn CorpusStore>,
    event_bus: Option<Arc<dyn EventBus>>,
    similarity_threshold: f32,
    max_candidates: usize,
    persist_attempts: u32,
    /// Per-key write locks. Snapshot-then-write of one key is serialized so
    /// its newest snapshot lands last; distinct keys write concurrently.
    persist_locks: DashMap<TemplateKey, Arc<Mutex<()>>>,
}

impl PatternMatcher {
    pub fn new(
        config: &TriageConfig,
        corpus: Arc<SignatureCorpus>,
        store: Arc<dyn CorpusStore>,
    ) -> Self {
        Self {
            corpus,
            store,
            event_bus: None,
            similarity_threshold: config.similarity_threshold,
            max_candidates: config.max_candidates.max(1),
            persist_attempts: config.persist_attempts.max(1),
            persist_locks: DashMap::new(),
        }
    }

    pub fn with_event_bus(mut self, event_bus: Arc<dyn EventBus>) -> Self {
        self.event_bus = Some(event_bus);
        self
    }

    pub fn corpus(&self) -> &Arc<SignatureCorpus> {
        &self.corpus
    }

    /// Rank existing signatures against an event without mutating the corpus.
    pub fn match_event(&self, event: &ErrorEvent) -> Vec<SignatureMatch> {
        let mut matches: Vec<SignatureMatch> = self
            .corpus
            .entries()
            .iter()
            .filter_map(|entry| self.score(event, entry.value()))
            .collect();

        matches.sort_by(|a, b| {
            b.score
                .total_cmp(&a.score)
                .then_with(|| b.signature.occurrence_count.cmp(&a.signature.occurrence_count))
                .then_with(|| a.signature.key.cmp(&b.signature.key))
        });
        matches.truncate(self.max_candidates);
        matches
    }

    fn score(&self, event: &ErrorEvent, signature: &FailureSignature) -> Option<SignatureMatch> {
        let template_equal = signature.template == event.template;
        let cosine = match (&event.embedding, &signature.centroid) {
            (Some(embedding), Some(centroid)) => cosine_similarity(embedding, centroid),
            _ => None,
        };

        let mut score = match (template_equal, cosine) {
            (true, Some(cos)) => 0.9 + 0.1 * f64::from(cos.max(0.0)),
            (true, None) => 1.0,
            (false, Some(cos)) => 0.9 * f64::from(cos.max(0.0)),
            (false, None) => 0.0,
        };
        let same_category = signature.category == event.category;
        if !same_category {
            score *= 0.5;
        }
        if score <= 0.0 {
            return None;
        }

        let strong = same_category
            && (template_equal || cosine.is_some_and(|cos| cos >= self.similarity_threshold));
        Some(SignatureMatch {
            signature: signature.clone(),
            score,
            strong,
        })
    }

    /// Match an event and record it in the corpus.
    ///
    /// A strong match increments the best strongly-matching signature.
    /// Otherwise the event's template becomes a new signature, or joins one
    /// created concurrently under the same key. Events of the unknown
    /// category are ranked but never recorded.
    ///
    /// Store failures do not fail the observation; see
    /// [`Observation::persisted`].
    pub async fn observe(&self, event: &ErrorEvent) -> Observation {
        let mut matches = self.match_event(event);
        if event.category == FailureCategory::Unknown {
            return Observation {
                matches,
                key: None,
                created: false,
                persisted: true,
            };
        }

        let embedding = event.embedding.as_deref();
        let strong_key = matches
            .iter()
            .find(|m| m.strong)
            .map(|m| m.signature.key.clone());

        if let Some(key) = strong_key
            && let Some(updated) = self.increment(&key, embedding)
        {
            debug!(
                key = %key,
                occurrences = updated.occurrence_count,
                "Event matched existing signature"
            );
            for m in matches.iter_mut().filter(|m| m.signature.key == key) {
                m.signature = updated.clone();
            }
            let persisted = self.persist_or_warn(&key).await;
            return Observation {
                matches,
                key: Some(key),
                created: false,
                persisted,
            };
        }

        let key = template_key(event.category, &event.template);
        let created = match self.corpus.entries().entry(key.clone()) {
            Entry::Occupied(mut existing) => {
                existing.get_mut().record_occurrence(embedding);
                None
            }
            Entry::Vacant(slot) => {
                let mut signature = FailureSignature::new(
                    key.clone(),
                    event.category,
                    event.template.clone(),
                    event.template.clone(),
                )
                .with_transient(event.transient);
                signature.record_occurrence(embedding);
                let created = signature.clone();
                slot.insert(signature);
                Some(created)
            }
        };

        if let Some(signature) = &created {
            info!(
                key = %key,
                category = %signature.category,
                template = %signature.template,
                "New failure signature created"
            );
            self.publish_created(signature).await;
        }
        let persisted = self.persist_or_warn(&key).await;

        Observation {
            matches,
            key: Some(key),
            created: created.is_some(),
            persisted,
        }
    }

    fn increment(&self, key: &TemplateKey, embedding: Option<&[f32]>) -> Option<FailureSignature> {
        let mut entry = self.corpus.entries().get_mut(key)?;
        entry.record_occurrence(embedding);
        Some(entry.value().clone())
    }

    /// Record whether applying a fix resolved a failure of this signature.
    pub async fn record_fix_outcome(
        &self,
        signature_id: SignatureId,
        fix: &str,
        success: bool,
    ) -> Result<FailureSignature> {
        let key = self
            .corpus
            .find_by_id(signature_id)
            .map(|s| s.key)
            .ok_or_else(|| Error::SignatureNotFound(signature_id.to_string()))?;

        let updated = {
            let mut entry = self
                .corpus
                .entries()
                .get_mut(&key)
                .ok_or_else(|| Error::SignatureNotFound(signature_id.to_string()))?;
            let signature = entry.value_mut();
            let index = match signature.fixes.iter().position(|f| f.description == fix) {
                Some(index) => index,
                None => {
                    signature.fixes.push(Fix::new(fix));
                    signature.fixes.len() - 1
                }
            };
            signature.fixes[index].applied += 1;
            if success {
                signature.fixes[index].succeeded += 1;
            }
            signature.last_seen = Utc::now();
            signature.clone()
        };

        info!(
            signature_id = %signature_id,
            fix = %fix,
            success,
            "Fix outcome recorded"
        );
        self.persist(&key).await?;
        Ok(updated)
    }

    async fn persist_or_warn(&self, key: &TemplateKey) -> bool {
        match self.persist(key).await {
            Ok(()) => true,
            Err(e) => {
                error!(key = %key, error = %e, "Failed to persist signature");
                false
            }
        }
    }

    /// Persist the current value of a key, retrying write conflicts.
    async fn persist(&self, key: &TemplateKey) -> Result<()> {
        let lock = Arc::clone(self.persist_locks.entry(key.clone()).or_default().value());
        let _guard = lock.lock().await;
        let Some(signature) = self.corpus.get(key) else {
            return Ok(());
        };

        let mut attempt = 1;
        loop {
            match self.store.persist(&signature).await {
                Ok(()) => return Ok(()),
                Err(e @ Error::CorpusWriteConflict { .. }) if attempt < self.persist_attempts => {
                    warn!(key = %key, attempt, error = %e, "Corpus write conflict, retrying");
                    tokio::time::sleep(Duration::from_millis(PERSIST_BACKOFF_MS * u64::from(attempt)))
                        .await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn publish_created(&self, signature: &FailureSignature) {
        let Some(bus) = &self.event_bus else {
            return;
        };
        let event = Event::SignatureCreated(SignatureCreatedPayload {
            signature_id: signature.id,
            key: signature.key.clone(),
            category: signature.category,
            template: signature.template.clone(),
        });
        if let Err(e) = bus.publish(event).await {
            warn!(error = %e, "Failed to publish signature event");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use kiln_adapters::{BroadcastEventBus, MemoryCorpusStore};
    use kiln_core::triage::LineRange;
    use pretty_assertions::assert_eq;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn event(category: FailureCategory, template: &str) -> ErrorEvent {
        ErrorEvent {
            lines: LineRange::single(0),
            category,
            rule: "test".to_string(),
            raw_text: template.to_string(),
            template: template.to_string(),
            transient: false,
            embedding: None,
        }
    }

    fn matcher_with(signatures: Vec<FailureSignature>) -> (PatternMatcher, Arc<MemoryCorpusStore>) {
        let corpus = Arc::new(SignatureCorpus::new());
        corpus.seed(signatures);
        let store = Arc::new(MemoryCorpusStore::new());
        let matcher = PatternMatcher::new(&TriageConfig::default(), corpus, store.clone());
        (matcher, store)
    }

    fn link_signature() -> FailureSignature {
        FailureSignature::new(
            TemplateKey::new("unset"),
            FailureCategory::Link,
            "undefined reference to `hip*`",
            "Missing HIP runtime library",
        )
        .with_occurrences(4)
    }

    #[test]
    fn test_empty_corpus_has_no_matches() {
        let (matcher, _) = matcher_with(Vec::new());
        assert!(matcher
            .match_event(&event(FailureCategory::Link, "anything"))
            .is_empty());
    }

    #[test]
    fn test_template_equality_scores() {
        let (matcher, _) = matcher_with(vec![link_signature()]);
        let same = matcher.match_event(&event(FailureCategory::Link, "undefined reference to `hip*`"));
        assert_eq!(same.len(), 1);
        assert_eq!(same[0].score, 1.0);
        assert!(same[0].strong);

        let other_category =
            matcher.match_event(&event(FailureCategory::Compilation, "undefined reference to `hip*`"));
        assert_eq!(other_category[0].score, 0.5);
        assert!(!other_category[0].strong);
    }

    #[test]
    fn test_embedding_similarity_scores() {
        let sig = link_signature().with_centroid(vec![1.0, 0.0]);
        let (matcher, _) = matcher_with(vec![sig]);

        let near = event(FailureCategory::Link, "undefined reference to `rocblas*`")
            .with_embedding(Some(vec![1.0, 0.1]));
        let ranked = matcher.match_event(&near);
        assert!(ranked[0].strong);
        assert!(ranked[0].score > 0.85 && ranked[0].score < 0.9);

        let far = event(FailureCategory::Link, "multiple definition of `main`")
            .with_embedding(Some(vec![0.2, 1.0]));
        let ranked = matcher.match_event(&far);
        assert!(!ranked[0].strong);
    }

    #[tokio::test]
    async fn test_strong_match_increments_existing() {
        let (matcher, store) = matcher_with(vec![link_signature()]);
        let observation = matcher
            .observe(&event(FailureCategory::Link, "undefined reference to `hip*`"))
            .await;

        assert!(!observation.created);
        assert_eq!(observation.best().unwrap().signature.occurrence_count, 5);
        assert_eq!(matcher.corpus().len(), 1);
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn test_unmatched_event_creates_signature() {
        let (matcher, store) = matcher_with(vec![link_signature()]);
        let bus = Arc::new(BroadcastEventBus::new(16));
        let matcher = matcher.with_event_bus(bus.clone());

        let observation = matcher
            .observe(&event(FailureCategory::Config, "CMake Error at CMakeLists.txt"))
            .await;

        assert!(observation.created);
        assert!(observation.matches.is_empty());
        let key = observation.key.unwrap();
        let created = matcher.corpus().get(&key).unwrap();
        assert_eq!(created.occurrence_count, 1);
        assert!(created.fixes.is_empty());
        assert_eq!(store.get(&key).await.unwrap().occurrence_count, 1);
        assert_eq!(bus.metrics().messages_published(), 1);
    }

    #[tokio::test]
    async fn test_unknown_events_are_not_recorded() {
        let (matcher, store) = matcher_with(Vec::new());
        let observation = matcher
            .observe(&event(FailureCategory::Unknown, "exit status <n>"))
            .await;
        assert!(observation.key.is_none());
        assert!(matcher.corpus().is_empty());
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn test_record_fix_outcome() {
        let (matcher, store) = matcher_with(vec![link_signature()]);
        let id = matcher.corpus().snapshot()[0].id;

        matcher.record_fix_outcome(id, "link libamdhip64", true).await.unwrap();
        let updated = matcher
            .record_fix_outcome(id, "link libamdhip64", false)
            .await
            .unwrap();

        assert_eq!(updated.fixes.len(), 1);
        assert_eq!(updated.fixes[0].applied, 2);
        assert_eq!(updated.fixes[0].succeeded, 1);
        assert_eq!(store.get(&updated.key).await.unwrap().fixes[0].applied, 2);

        assert!(matches!(
            matcher.record_fix_outcome(SignatureId::new(), "x", true).await,
            Err(Error::SignatureNotFound(_))
        ));
    }

    /// Store that reports a write conflict a fixed number of times.
    struct FlakyStore {
        conflicts: AtomicU32,
        inner: MemoryCorpusStore,
    }

    #[async_trait]
    impl CorpusStore for FlakyStore {
        async fn load_corpus(&self) -> Result<Vec<FailureSignature>> {
            self.inner.load_corpus().await
        }

        async fn persist(&self, signature: &FailureSignature) -> Result<()> {
            if self.conflicts.load(Ordering::SeqCst) > 0 {
                self.conflicts.fetch_sub(1, Ordering::SeqCst);
                return Err(Error::CorpusWriteConflict {
                    key: signature.key.to_string(),
                    message: "busy".to_string(),
                });
            }
            self.inner.persist(signature).await
        }
    }

    #[tokio::test]
    async fn test_persist_retries_conflicts() {
        let store = Arc::new(FlakyStore {
            conflicts: AtomicU32::new(2),
            inner: MemoryCorpusStore::new(),
        });
        let matcher = PatternMatcher::new(
            &TriageConfig::default(),
            Arc::new(SignatureCorpus::new()),
            store.clone(),
        );
        let first = matcher
            .observe(&event(FailureCategory::Runtime, "Segmentation fault"))
            .await;
        assert!(first.persisted);
        assert_eq!(store.inner.len().await, 1);
    }

    #[tokio::test]
    async fn test_store_failure_keeps_evidence() {
        let store = Arc::new(FlakyStore {
            conflicts: AtomicU32::new(0),
            inner: MemoryCorpusStore::new(),
        });
        let matcher = PatternMatcher::new(
            &TriageConfig::default(),
            Arc::new(SignatureCorpus::new()),
            store.clone(),
        );
        let created = matcher
            .observe(&event(FailureCategory::Runtime, "Segmentation fault"))
            .await;
        let key = created.key.unwrap();

        store.conflicts.store(5, Ordering::SeqCst);
        let rejected = matcher
            .observe(&event(FailureCategory::Runtime, "Segmentation fault"))
            .await;
        assert!(!rejected.persisted);
        assert_eq!(rejected.best().unwrap().signature.occurrence_count, 2);
        assert_eq!(matcher.corpus().get(&key).unwrap().occurrence_count, 2);
        assert_eq!(store.inner.get(&key).await.unwrap().occurrence_count, 1);

        store.conflicts.store(0, Ordering::SeqCst);
        let healed = matcher
            .observe(&event(FailureCategory::Runtime, "Segmentation fault"))
            .await;
        assert!(healed.persisted);
        assert_eq!(store.inner.get(&key).await.unwrap().occurrence_count, 3);
    }

    /// Store that holds every write for a while and tracks overlap.
    #[derive(Default)]
    struct SlowStore {
        in_flight: AtomicU32,
        peak: AtomicU32,
        inner: MemoryCorpusStore,
    }

    #[async_trait]
    impl CorpusStore for SlowStore {
        async fn load_corpus(&self) -> Result<Vec<FailureSignature>> {
            self.inner.load_corpus().await
        }

        async fn persist(&self, signature: &FailureSignature) -> Result<()> {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(50)).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            self.inner.persist(signature).await
        }
    }

    fn slow_matcher() -> (PatternMatcher, Arc<SlowStore>) {
        let store = Arc::new(SlowStore::default());
        let matcher = PatternMatcher::new(
            &TriageConfig::default(),
            Arc::new(SignatureCorpus::new()),
            store.clone(),
        );
        (matcher, store)
    }

    #[tokio::test]
    async fn test_distinct_keys_persist_concurrently() {
        let (matcher, store) = slow_matcher();
        let events = [
            event(FailureCategory::Runtime, "Segmentation fault"),
            event(FailureCategory::Link, "undefined reference to `hip*`"),
            event(FailureCategory::Config, "CMake Error at <path>"),
            event(FailureCategory::Test, "[ FAILED ] GemmTest"),
        ];
        let (a, b, c, d) = tokio::join!(
            matcher.observe(&events[0]),
            matcher.observe(&events[1]),
            matcher.observe(&events[2]),
            matcher.observe(&events[3]),
        );

        assert!(a.persisted && b.persisted && c.persisted && d.persisted);
        assert_eq!(store.peak.load(Ordering::SeqCst), 4);
        assert_eq!(store.inner.len().await, 4);
    }

    #[tokio::test]
    async fn test_same_key_writes_in_order() {
        let (matcher, store) = slow_matcher();
        let segfault = event(FailureCategory::Runtime, "Segmentation fault");
        let (first, second) = tokio::join!(matcher.observe(&segfault), matcher.observe(&segfault));

        assert!(first.created);
        assert!(!second.created);
        assert_eq!(store.peak.load(Ordering::SeqCst), 1);
        let key = first.key.unwrap();
        assert_eq!(store.inner.get(&key).await.unwrap().occurrence_count, 2);
    }
}
