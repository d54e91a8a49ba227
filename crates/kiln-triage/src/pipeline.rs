//! End-to-end analysis of one failed build.

use crate::config::TriageConfig;
use crate::corpus::SignatureCorpus;
use crate::inference::{Evidence, InferenceEngine};
use crate::matcher::PatternMatcher;
use crate::parser::{LogParser, ParseRule};
use kiln_core::ids::BuildId;
use kiln_core::ports::{CorpusStore, EmbeddingProvider, EventBus, LogStore};
use kiln_core::triage::{AnalysisResult, ErrorEvent, FailureCategory};
use kiln_core::Result;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Parse, embed, match and infer.
///
/// [`TriagePipeline::analyze`] never fails. An unreadable log produces an
/// `unknown` result, and corpus write failures only cost durability.
pub struct TriagePipeline {
    parser: LogParser,
    matcher: PatternMatcher,
    engine: InferenceEngine,
    log_store: Arc<dyn LogStore>,
    embedder: Option<Arc<dyn EmbeddingProvider>>,
}

impl TriagePipeline {
    pub fn new(
        config: &TriageConfig,
        log_store: Arc<dyn LogStore>,
        corpus: Arc<SignatureCorpus>,
        corpus_store: Arc<dyn CorpusStore>,
    ) -> Self {
        Self {
            parser: LogParser::new(config),
            matcher: PatternMatcher::new(config, corpus, corpus_store),
            engine: InferenceEngine::new(config),
            log_store,
            embedder: None,
        }
    }

    pub fn with_embedder(mut self, embedder: Arc<dyn EmbeddingProvider>) -> Self {
        self.embedder = Some(embedder);
        self
    }

    pub fn with_event_bus(mut self, event_bus: Arc<dyn EventBus>) -> Self {
        self.matcher = self.matcher.with_event_bus(event_bus);
        self
    }

    pub fn add_rule(&mut self, rule: ParseRule) -> Result<()> {
        self.parser.add_rule(rule)
    }

    pub fn parser(&self) -> &LogParser {
        &self.parser
    }

    pub fn matcher(&self) -> &PatternMatcher {
        &self.matcher
    }

    /// Analyze the log of one dispatch attempt of a build.
    pub async fn analyze(&self, build_id: BuildId, attempt: u32) -> AnalysisResult {
        let log = match self.log_store.read_all(build_id, attempt).await {
            Ok(log) => log,
            Err(e) => {
                warn!(build_id = %build_id, attempt, error = %e, "Failed to read build log");
                return AnalysisResult::unknown(build_id, 0);
            }
        };
        self.analyze_log(build_id, &log).await
    }

    /// Analyze log text directly.
    pub async fn analyze_log(&self, build_id: BuildId, log: &str) -> AnalysisResult {
        let mut evidence = Vec::new();
        let mut unpersisted = 0;
        for event in self.parser.parse(log) {
            let event = self.embed(event).await;
            let observation = self.matcher.observe(&event).await;
            if !observation.persisted {
                unpersisted += 1;
            }
            evidence.push(Evidence { event, observation });
        }
        debug!(build_id = %build_id, events = evidence.len(), "Log parsed");
        if unpersisted > 0 {
            warn!(build_id = %build_id, unpersisted, "Corpus updates kept in memory only");
        }

        let result = self.engine.infer(build_id, self.matcher.corpus(), &evidence);
        info!(
            build_id = %build_id,
            category = %result.category,
            confidence = result.confidence,
            events = result.events_analyzed,
            "Triage completed"
        );
        result
    }

    async fn embed(&self, event: ErrorEvent) -> ErrorEvent {
        let Some(embedder) = &self.embedder else {
            return event;
        };
        if event.category == FailureCategory::Unknown || event.template.is_empty() {
            return event;
        }
        match embedder.embed(&event.template).await {
            Ok(vector) => event.with_embedding(Some(vector)),
            Err(e) => {
                debug!(rule = %event.rule, error = %e, "Embedding unavailable, matching on template only");
                event
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kiln_adapters::{HashingEmbedder, MemoryCorpusStore, MemoryLogStore};
    use kiln_core::ids::TemplateKey;
    use kiln_core::triage::{FailureSignature, Fix};
    use pretty_assertions::assert_eq;

    async fn pipeline_with(
        signatures: Vec<FailureSignature>,
    ) -> (TriagePipeline, Arc<MemoryLogStore>) {
        let logs = Arc::new(MemoryLogStore::new());
        let corpus = Arc::new(SignatureCorpus::new());
        corpus.seed(signatures);
        let pipeline = TriagePipeline::new(
            &TriageConfig::default(),
            logs.clone(),
            corpus,
            Arc::new(MemoryCorpusStore::new()),
        )
        .with_embedder(Arc::new(HashingEmbedder::default()));
        (pipeline, logs)
    }

    #[tokio::test]
    async fn test_missing_log_is_unknown() {
        let (pipeline, _) = pipeline_with(Vec::new()).await;
        let result = pipeline.analyze(BuildId::new(), 1).await;
        assert_eq!(result.category, FailureCategory::Unknown);
        assert_eq!(result.confidence, 0.0);
        assert!((result.posterior_sum() - 1.0).abs() < 1e-6);
    }

    #[tokio::test]
    async fn test_transient_signature_carries_through() {
        let oom = FailureSignature::new(
            TemplateKey::new("unset"),
            FailureCategory::Runtime,
            "out of memory",
            "GPU memory exhausted by a co-tenant",
        )
        .with_occurrences(9)
        .with_transient(true)
        .with_fix(Fix::new("retry on an idle slot").with_history(6, 5));
        let (pipeline, logs) = pipeline_with(vec![oom]).await;

        let build_id = BuildId::new();
        logs.append_chunk(build_id, 1, b"running gemm benchmark\nHIP error: out of memory\n")
            .await
            .unwrap();
        let result = pipeline.analyze(build_id, 1).await;

        assert_eq!(result.category, FailureCategory::Runtime);
        assert!(result.is_transient());
        assert!(result.is_known_fixable());
        assert_eq!(result.top().unwrap().cause, "GPU memory exhausted by a co-tenant");
    }

    struct UnavailableStore;

    #[async_trait::async_trait]
    impl CorpusStore for UnavailableStore {
        async fn load_corpus(&self) -> Result<Vec<FailureSignature>> {
            Ok(Vec::new())
        }

        async fn persist(&self, _signature: &FailureSignature) -> Result<()> {
            Err(kiln_core::Error::CorpusStore("disk full".to_string()))
        }
    }

    #[tokio::test]
    async fn test_store_outage_keeps_analysis() {
        let corpus = Arc::new(SignatureCorpus::new());
        corpus.seed(vec![
            FailureSignature::new(
                TemplateKey::new("unset"),
                FailureCategory::Runtime,
                "out of memory",
                "GPU memory exhausted by a co-tenant",
            )
            .with_occurrences(9)
            .with_transient(true)
            .with_fix(Fix::new("retry on an idle slot").with_history(6, 5)),
        ]);
        let pipeline = TriagePipeline::new(
            &TriageConfig::default(),
            Arc::new(MemoryLogStore::new()),
            corpus.clone(),
            Arc::new(UnavailableStore),
        );

        let result = pipeline
            .analyze_log(BuildId::new(), "HIP error: out of memory
")
            .await;

        assert_eq!(result.category, FailureCategory::Runtime);
        assert!(result.is_transient());
        assert_eq!(corpus.snapshot()[0].occurrence_count, 10);
    }

    #[tokio::test]
    async fn test_novel_failure_seeds_corpus() {
        let (pipeline, _) = pipeline_with(Vec::new()).await;
        let build_id = BuildId::new();

        let result = pipeline
            .analyze_log(build_id, "CMake Error at CMakeLists.txt:4 (project):\n")
            .await;

        assert_eq!(result.category, FailureCategory::Unknown);
        assert_eq!(result.events_analyzed, 1);
        assert_eq!(pipeline.matcher().corpus().len(), 1);

        let again = pipeline
            .analyze_log(BuildId::new(), "CMake Error at CMakeLists.txt:4 (project):\n")
            .await;
        assert_eq!(again.category, FailureCategory::Config);
        assert!(again.evidence_capped);
        assert!(again.confidence <= 0.5);
    }
}
