//! Command handlers.

use crate::config::{BuildsFile, CONFIG_FILE, KilnConfig};
use anyhow::{Context, Result};
use console::style;
use futures::StreamExt;
use kiln_adapters::{
    BroadcastEventBus, FileLogStore, HashingEmbedder, JsonFileCorpusStore, ProcessExecutor,
    ProcessExecutorConfig,
};
use kiln_core::build::{BuildRecord, BuildState};
use kiln_core::events::Event;
use kiln_core::ids::{BuildId, SignatureId};
use kiln_core::ports::{CorpusStore, EventBus, LogStore};
use kiln_core::triage::{AnalysisResult, FailureCategory};
use kiln_scheduler::{ResourcePool, Scheduler};
use kiln_triage::{LogParser, PatternMatcher, SignatureCorpus, TriagePipeline, TriageWorkers};
use std::path::Path;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::time::{Duration, sleep};
use tracing::{debug, info, warn};

/// Run every build in the file to a terminal state.
pub async fn run(config: &KilnConfig, builds_path: &Path) -> Result<()> {
    config.validate(true)?;
    let builds = BuildsFile::from_file(builds_path)?.builds;

    let event_bus = Arc::new(BroadcastEventBus::default());
    let log_store: Arc<dyn LogStore> = Arc::new(FileLogStore::new(config.storage.log_dir.clone()));
    let (corpus, corpus_store) = load_corpus(config).await?;

    let pipeline = TriagePipeline::new(&config.triage, log_store.clone(), corpus, corpus_store)
        .with_embedder(Arc::new(HashingEmbedder::default()))
        .with_event_bus(event_bus.clone());
    let (report_tx, report_rx) = mpsc::unbounded_channel();
    let (workers, workers_handle) =
        TriageWorkers::spawn(Arc::new(pipeline), config.triage.worker_count, report_tx);

    let executor = ProcessExecutor::new(
        ProcessExecutorConfig::default()
            .with_workspace_root(config.storage.workspace_dir.clone()),
        log_store,
    );
    let pool = Arc::new(ResourcePool::new(
        config.pool.slots.clone(),
        config.scheduler.quarantine_after_timeouts,
    ));
    let (scheduler, outcomes) = Scheduler::new(
        config.scheduler.clone(),
        pool,
        Arc::new(executor),
        Arc::new(workers),
        event_bus.clone(),
    );
    let scheduler = Arc::new(scheduler);

    let mut events = event_bus.subscribe(">").await?;
    let printer = tokio::spawn(async move {
        while let Some(event) = events.next().await {
            match event {
                Ok(event) => print_event(&event),
                Err(e) => debug!(error = %e, "Event stream error"),
            }
        }
    });

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let looped = scheduler.clone();
    let loop_handle =
        tokio::spawn(async move { looped.run(outcomes, report_rx, shutdown_rx).await });

    let mut ids = Vec::with_capacity(builds.len());
    for spec in builds {
        ids.push(scheduler.submit(spec.into_request()).await?);
    }
    info!(builds = ids.len(), "Builds submitted");

    let mut cancelling = false;
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                if cancelling {
                    warn!("Second interrupt, exiting without waiting");
                    break;
                }
                cancelling = true;
                println!("{} Cancelling builds (Ctrl+C again to exit)", style("!").yellow());
                for id in &ids {
                    if let Err(e) = scheduler.cancel(*id).await {
                        debug!(build_id = %id, error = %e, "Cancel skipped");
                    }
                }
            }
            _ = sleep(Duration::from_millis(250)) => {
                if scheduler.all_terminal().await || scheduler.is_halted().await {
                    break;
                }
            }
        }
    }

    let halted = scheduler.is_halted().await;
    let _ = shutdown_tx.send(true);
    loop_handle.await.context("Scheduler loop panicked")?;

    let mut records = scheduler.records().await;
    records.sort_by_key(|r| r.request.submitted_at);
    let stats = scheduler.stats().await;
    drop(scheduler);
    if workers_handle.await.is_err() {
        warn!("Triage workers ended abnormally");
    }
    printer.abort();

    println!();
    for record in &records {
        print_record(record);
    }
    println!(
        "\n{} succeeded, {} failed, {} timed out, {} cancelled, {} retries (failure rate {:.0}%)",
        stats.succeeded,
        stats.failed,
        stats.timed_out,
        stats.cancelled,
        stats.retried,
        stats.failure_rate() * 100.0
    );

    if halted {
        anyhow::bail!("admission halted after repeated executor start failures");
    }
    let unsuccessful = records
        .iter()
        .filter(|r| r.state != BuildState::Succeeded)
        .count();
    if unsuccessful > 0 {
        anyhow::bail!("{unsuccessful} of {} builds did not succeed", records.len());
    }
    Ok(())
}

/// Analyze a log file against the corpus. Matches are recorded in the corpus.
pub async fn triage(config: &KilnConfig, log: &Path, json: bool) -> Result<()> {
    config.triage.validate()?;
    let text = read_log(log).await?;
    let (corpus, corpus_store) = load_corpus(config).await?;

    let pipeline = TriagePipeline::new(
        &config.triage,
        Arc::new(FileLogStore::new(config.storage.log_dir.clone())),
        corpus,
        corpus_store,
    )
    .with_embedder(Arc::new(HashingEmbedder::default()));
    let result = pipeline.analyze_log(BuildId::new(), &text).await;

    if json {
        println!("{}", serde_json::to_string_pretty(&result)?);
    } else {
        print_analysis(&result);
    }
    Ok(())
}

/// Print the error events the parser extracts from a log.
pub async fn parse(config: &KilnConfig, log: &Path) -> Result<()> {
    config.triage.validate()?;
    let text = read_log(log).await?;
    let parser = LogParser::new(&config.triage);

    let mut count = 0;
    for event in parser.parse(&text) {
        count += 1;
        println!(
            "{} {:<12} {:<24} lines {}-{}",
            style("●").cyan(),
            event.category.to_string(),
            event.rule,
            event.lines.start + 1,
            event.lines.end
        );
        println!("    {}", style(&event.template).dim());
    }
    println!("\n{count} event(s)");
    Ok(())
}

pub async fn corpus_list(config: &KilnConfig, category: Option<&str>) -> Result<()> {
    let filter = category
        .map(|c| c.parse::<FailureCategory>().map_err(anyhow::Error::msg))
        .transpose()?;
    let (corpus, _) = load_corpus(config).await?;

    let signatures: Vec<_> = corpus
        .snapshot()
        .into_iter()
        .filter(|s| filter.is_none_or(|c| s.category == c))
        .collect();

    if signatures.is_empty() {
        println!("{} No signatures recorded", style("i").blue());
        return Ok(());
    }

    for signature in &signatures {
        println!(
            "{} {} [{}] seen {}x{}",
            style("●").cyan(),
            style(&signature.label).bold(),
            signature.category,
            signature.occurrence_count,
            if signature.transient { ", transient" } else { "" }
        );
        println!("    id:       {}", signature.id);
        println!("    template: {}", style(&signature.template).dim());
        for fix in signature.ranked_fixes() {
            println!(
                "    fix:      {} ({}/{} succeeded)",
                fix.description, fix.succeeded, fix.applied
            );
        }
    }
    println!("\n{} signature(s)", signatures.len());
    Ok(())
}

pub async fn corpus_record_fix(
    config: &KilnConfig,
    signature: &str,
    fix: &str,
    success: bool,
) -> Result<()> {
    let signature_id: SignatureId = signature
        .parse()
        .with_context(|| format!("Invalid signature id: {signature}"))?;
    let (corpus, corpus_store) = load_corpus(config).await?;
    let matcher = PatternMatcher::new(&config.triage, corpus, corpus_store);

    let updated = matcher
        .record_fix_outcome(signature_id, fix, success)
        .await?;
    let recorded = updated.fixes.iter().find(|f| f.description == fix);

    println!(
        "{} Recorded {} for {}",
        style("✓").green(),
        if success { "success" } else { "failure" },
        style(&updated.label).bold()
    );
    if let Some(recorded) = recorded {
        println!(
            "  {}: {}/{} succeeded",
            recorded.description, recorded.succeeded, recorded.applied
        );
    }
    Ok(())
}

pub fn show_config(config: &KilnConfig) -> Result<()> {
    print!("{}", serde_yaml::to_string(config)?);
    Ok(())
}

pub fn init_config(force: bool) -> Result<()> {
    let path = Path::new(CONFIG_FILE);
    if path.exists() && !force {
        println!("{} {CONFIG_FILE} already exists", style("!").yellow());
        return Ok(());
    }

    let yaml = serde_yaml::to_string(&KilnConfig::starter())?;
    std::fs::write(path, yaml).with_context(|| format!("Failed to write {CONFIG_FILE}"))?;
    println!("{} Created {CONFIG_FILE}", style("✓").green());
    Ok(())
}

async fn load_corpus(config: &KilnConfig) -> Result<(Arc<SignatureCorpus>, Arc<dyn CorpusStore>)> {
    let store: Arc<dyn CorpusStore> =
        Arc::new(JsonFileCorpusStore::new(config.storage.corpus_file.clone()));
    let corpus = Arc::new(SignatureCorpus::new());
    corpus
        .load(store.as_ref())
        .await
        .with_context(|| format!("Failed to load corpus {}", config.storage.corpus_file.display()))?;
    Ok((corpus, store))
}

async fn read_log(path: &Path) -> Result<String> {
    let bytes = tokio::fs::read(path)
        .await
        .with_context(|| format!("Failed to read log {}", path.display()))?;
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

fn print_analysis(result: &AnalysisResult) {
    let heading = match result.category {
        FailureCategory::Unknown => style(result.category.to_string()).yellow(),
        _ => style(result.category.to_string()).red(),
    };
    println!(
        "{} {} (confidence {:.2}{})",
        style("▶").cyan(),
        heading.bold(),
        result.confidence,
        if result.evidence_capped { ", limited history" } else { "" }
    );
    println!("  events analyzed: {}", result.events_analyzed);

    for hypothesis in result.hypotheses.iter().take(5) {
        println!(
            "  {:>5.1}%  {} [{}]{}",
            hypothesis.posterior * 100.0,
            hypothesis.cause,
            hypothesis.category,
            if hypothesis.transient { " transient" } else { "" }
        );
    }

    if !result.recommendations.is_empty() {
        println!("  recommended fixes:");
        for (i, rec) in result.recommendations.iter().enumerate() {
            println!(
                "    {}. {} ({:.0}% of {} applications)",
                i + 1,
                rec.description,
                rec.success_rate * 100.0,
                rec.applied
            );
        }
    }
}

fn print_record(record: &BuildRecord) {
    let state = match record.state {
        BuildState::Succeeded => style(record.state.to_string()).green(),
        BuildState::Cancelled => style(record.state.to_string()).dim(),
        _ => style(record.state.to_string()).red(),
    };
    let cause = record
        .analysis
        .as_ref()
        .map(|a| match a.top() {
            Some(top) if a.category != FailureCategory::Unknown => {
                format!("{}: {}", a.category, top.cause)
            }
            _ => a.category.to_string(),
        })
        .unwrap_or_default();
    println!(
        "{}  {:<10} retries {}  {}  {}",
        record.id(),
        state,
        record.retry_count,
        record.request.source.repository,
        style(cause).dim()
    );
}

fn print_event(event: &Event) {
    match event {
        Event::BuildStarted(p) => println!(
            "{} {} started on {} (attempt {})",
            style("▶").cyan(),
            p.build_id,
            p.node,
            p.dispatch_seq
        ),
        Event::BuildCompleted(p) => println!(
            "{} {} {:?}",
            style("■").bold(),
            p.build_id,
            p.status
        ),
        Event::BuildRetrying(p) => println!(
            "{} {} retry {} at {}",
            style("↻").yellow(),
            p.build_id,
            p.attempt,
            p.not_before.format("%H:%M:%S")
        ),
        Event::TriageCompleted(p) => println!(
            "{} {} {} ({:.2}) {}",
            style("?").magenta(),
            p.build_id,
            p.category,
            p.confidence,
            p.cause.as_deref().unwrap_or("")
        ),
        Event::SlotQuarantined(p) => println!(
            "{} slot {} on {} quarantined after {} timeouts",
            style("!").red(),
            p.slot_id,
            p.node,
            p.consecutive_timeouts
        ),
        Event::AdmissionHalted(p) => println!(
            "{} admission halted after {} start failures",
            style("!").red(),
            p.consecutive_failures
        ),
        other => debug!(subject = %other.subject(), "Event"),
    }
}
