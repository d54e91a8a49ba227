//! End-to-end triage behavior over real adapters.

use kiln_adapters::{HashingEmbedder, JsonFileCorpusStore, MemoryCorpusStore, MemoryLogStore};
use kiln_core::ids::{BuildId, TemplateKey};
use kiln_core::ports::{CorpusStore, LogStore};
use kiln_core::triage::{FailureCategory, FailureSignature, Fix};
use kiln_triage::{SignatureCorpus, TriageConfig, TriagePipeline};
use pretty_assertions::assert_eq;
use std::sync::Arc;
use tempfile::TempDir;

fn hip_link_signature() -> FailureSignature {
    FailureSignature::new(
        TemplateKey::new("seed"),
        FailureCategory::Link,
        "undefined reference to `hipMalloc'",
        "Missing HIP runtime library",
    )
    .with_occurrences(5)
    .with_fix(Fix::new("Add -lamdhip64 to the link line").with_history(10, 8))
    .with_fix(Fix::new("Rebuild against the installed ROCm").with_history(4, 1))
}

fn pipeline(
    corpus: Arc<SignatureCorpus>,
    store: Arc<dyn CorpusStore>,
    logs: Arc<MemoryLogStore>,
) -> TriagePipeline {
    TriagePipeline::new(&TriageConfig::default(), logs, corpus, store)
        .with_embedder(Arc::new(HashingEmbedder::default()))
}

#[tokio::test]
async fn test_known_link_failure_is_diagnosed() {
    let corpus = Arc::new(SignatureCorpus::new());
    corpus.seed(vec![hip_link_signature()]);
    let logs = Arc::new(MemoryLogStore::new());
    let pipeline = pipeline(corpus, Arc::new(MemoryCorpusStore::new()), logs.clone());

    let build_id = BuildId::new();
    logs.append_chunk(
        build_id,
        1,
        b"[ 50%] Linking HIP executable matmul\n\
          /usr/bin/ld: CMakeFiles/matmul.dir/main.cpp.o: in function `main':\n\
          main.cpp:(.text+0x4f): undefined reference to `hipMalloc'\n\
          clang: error: linker command failed with exit code 1 (use -v to see invocation)\n",
    )
    .await
    .unwrap();

    let result = pipeline.analyze(build_id, 1).await;

    assert_eq!(result.build_id, build_id);
    assert_eq!(result.category, FailureCategory::Link);
    assert_eq!(result.top().unwrap().cause, "Missing HIP runtime library");
    assert!(result.confidence > 0.0);
    assert!(!result.evidence_capped);
    assert_eq!(
        result.recommendations[0].description,
        "Add -lamdhip64 to the link line"
    );
    assert!((result.posterior_sum() - 1.0).abs() < 1e-6);
}

#[tokio::test]
async fn test_retry_is_diagnosed_from_its_own_log() {
    let oom = FailureSignature::new(
        TemplateKey::new("seed"),
        FailureCategory::Runtime,
        "out of memory",
        "GPU memory exhausted by a co-tenant",
    )
    .with_occurrences(6)
    .with_transient(true)
    .with_fix(Fix::new("Retry on an idle slot").with_history(6, 5));
    let corpus = Arc::new(SignatureCorpus::new());
    corpus.seed(vec![hip_link_signature(), oom]);
    let logs = Arc::new(MemoryLogStore::new());
    let pipeline = pipeline(corpus.clone(), Arc::new(MemoryCorpusStore::new()), logs.clone());
    let occurrences = |template: &str| {
        corpus
            .snapshot()
            .into_iter()
            .find(|s| s.template.contains(template))
            .map(|s| s.occurrence_count)
    };

    let build_id = BuildId::new();
    logs.append_chunk(build_id, 1, b"HIP error: out of memory\n")
        .await
        .unwrap();
    let first = pipeline.analyze(build_id, 1).await;
    assert_eq!(first.category, FailureCategory::Runtime);
    assert!(first.is_transient());

    logs.append_chunk(build_id, 2, b"main.cpp:(.text+0x4f): undefined reference to `hipMalloc'\n")
        .await
        .unwrap();
    let second = pipeline.analyze(build_id, 2).await;

    assert_eq!(second.category, FailureCategory::Link);
    assert_eq!(second.events_analyzed, 1);
    assert!(!second.is_transient());
    assert_eq!(occurrences("out of memory"), Some(7));
    assert_eq!(occurrences("undefined reference"), Some(6));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_identical_failures_share_one_signature() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("corpus.json");
    let store: Arc<dyn CorpusStore> = Arc::new(JsonFileCorpusStore::new(path.clone()));
    let corpus = Arc::new(SignatureCorpus::new());
    let pipeline = Arc::new(pipeline(corpus.clone(), store, Arc::new(MemoryLogStore::new())));

    let first = {
        let pipeline = Arc::clone(&pipeline);
        tokio::spawn(async move {
            pipeline
                .analyze_log(
                    BuildId::new(),
                    "CMake Error at /home/ci/build-17/CMakeLists.txt:12 (find_package):\n",
                )
                .await
        })
    };
    let second = {
        let pipeline = Arc::clone(&pipeline);
        tokio::spawn(async move {
            pipeline
                .analyze_log(
                    BuildId::new(),
                    "CMake Error at /home/ci/build-42/CMakeLists.txt:98 (find_package):\n",
                )
                .await
        })
    };
    first.await.unwrap();
    second.await.unwrap();

    assert_eq!(corpus.len(), 1);
    let signature = &corpus.snapshot()[0];
    assert_eq!(signature.category, FailureCategory::Config);
    assert_eq!(signature.template, "CMake Error at <path> (find_package):");
    assert_eq!(signature.occurrence_count, 2);

    let persisted = JsonFileCorpusStore::new(path).load_corpus().await.unwrap();
    assert_eq!(persisted.len(), 1);
    assert_eq!(persisted[0].occurrence_count, 2);
}

#[tokio::test]
async fn test_posteriors_always_sum_to_one() {
    let corpus = Arc::new(SignatureCorpus::new());
    corpus.seed(vec![
        hip_link_signature(),
        FailureSignature::new(
            TemplateKey::new("seed"),
            FailureCategory::Runtime,
            "Segmentation fault",
            "Kernel wrote past a device buffer",
        )
        .with_occurrences(3),
    ]);
    let pipeline = pipeline(
        corpus,
        Arc::new(MemoryCorpusStore::new()),
        Arc::new(MemoryLogStore::new()),
    );

    let logs = [
        "",
        "all good\n",
        "Segmentation fault (core dumped)\n",
        "main.cpp:(.text+0x1): undefined reference to `hipFree'\nSegmentation fault\n",
        "[  FAILED  ] GemmTest.Fp16\nAssertion `err < 1e-3' failed.\n",
    ];
    for log in logs {
        let result = pipeline.analyze_log(BuildId::new(), log).await;
        assert!(
            (result.posterior_sum() - 1.0).abs() < 1e-6,
            "posteriors for {log:?} sum to {}",
            result.posterior_sum()
        );
        assert!(result.confidence >= 0.0 && result.confidence <= 1.0);
        assert!(result.events_analyzed >= 1);
    }
}

#[tokio::test]
async fn test_corpus_survives_restart() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("corpus.json");

    {
        let store: Arc<dyn CorpusStore> = Arc::new(JsonFileCorpusStore::new(path.clone()));
        let corpus = Arc::new(SignatureCorpus::new());
        let pipeline = pipeline(corpus, store, Arc::new(MemoryLogStore::new()));
        pipeline
            .analyze_log(BuildId::new(), "ModuleNotFoundError: No module named 'torch'\n")
            .await;
    }

    let store: Arc<dyn CorpusStore> = Arc::new(JsonFileCorpusStore::new(path));
    let corpus = Arc::new(SignatureCorpus::new());
    assert_eq!(corpus.load(store.as_ref()).await.unwrap(), 1);
    let pipeline = pipeline(corpus, store, Arc::new(MemoryLogStore::new()));

    let result = pipeline
        .analyze_log(BuildId::new(), "ModuleNotFoundError: No module named 'torch'\n")
        .await;
    assert_eq!(result.category, FailureCategory::Config);
    assert!(result.evidence_capped);
}
