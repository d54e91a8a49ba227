//! Port traits (hexagonal architecture).
//!
//! These traits define the interfaces between the core domain and external adapters.

use crate::build::{BuildOutcome, BuildRequest};
use crate::events::Event;
use crate::ids::*;
use crate::slot::SlotHandle;
use crate::triage::{FailureSignature, TriageRequest};
use crate::{Error, Result};
use async_trait::async_trait;
use futures::Stream;
use std::pin::Pin;
use tokio::sync::mpsc;

/// Stream of events.
pub type EventStream = Pin<Box<dyn Stream<Item = Result<Event>> + Send>>;

/// Event bus for publishing and subscribing to events.
#[async_trait]
pub trait EventBus: Send + Sync {
    /// Publish an event.
    async fn publish(&self, event: Event) -> Result<()>;

    /// Subscribe to events matching a pattern.
    /// Pattern supports wildcards: `build.*.bld_...`, `slot.>`
    async fn subscribe(&self, pattern: &str) -> Result<EventStream>;
}

/// Append-only storage for raw build logs.
///
/// Every dispatch of a build writes its own log, addressed by the dispatch
/// sequence number (`attempt`), so a retry never sees earlier output.
#[async_trait]
pub trait LogStore: Send + Sync {
    /// Append a chunk of raw output to one attempt's log.
    async fn append_chunk(&self, build_id: BuildId, attempt: u32, bytes: &[u8]) -> Result<()>;

    /// Read the complete log of one attempt. Missing logs read as empty.
    async fn read_all(&self, build_id: BuildId, attempt: u32) -> Result<String>;
}

/// Maps normalized token text to a fixed-length vector.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    async fn embed(&self, text: &str) -> Result<Vec<f32>>;

    /// Length of every vector this provider returns.
    fn dimension(&self) -> usize;
}

/// Durable storage for failure signatures.
#[async_trait]
pub trait CorpusStore: Send + Sync {
    async fn load_corpus(&self) -> Result<Vec<FailureSignature>>;

    /// Upsert one signature by its template key.
    async fn persist(&self, signature: &FailureSignature) -> Result<()>;
}

/// One terminal outcome for one executor start.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OutcomeReport {
    pub build_id: BuildId,
    pub dispatch_seq: u32,
    pub outcome: BuildOutcome,
    pub exit_code: Option<i32>,
}

/// Channel through which executors deliver outcomes to the scheduler.
#[derive(Debug, Clone)]
pub struct OutcomeSink {
    tx: mpsc::UnboundedSender<OutcomeReport>,
}

impl OutcomeSink {
    pub fn new(tx: mpsc::UnboundedSender<OutcomeReport>) -> Self {
        Self { tx }
    }

    /// Deliver an outcome. Fails only when the scheduler is gone.
    pub fn report(&self, report: OutcomeReport) -> Result<()> {
        self.tx
            .send(report)
            .map_err(|_| Error::Internal("outcome channel closed".to_string()))
    }
}

/// Opaque handle for a started execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionHandle {
    pub build_id: BuildId,
    pub slot_id: SlotId,
    pub dispatch_seq: u32,
    /// Executor-specific reference, e.g. a process id.
    pub reference: Option<String>,
}

/// Runs builds on allocated slots.
///
/// Implementations must report exactly one outcome through the sink per
/// successful `start`.
#[async_trait]
pub trait BuildExecutor: Send + Sync {
    async fn start(
        &self,
        slot: &SlotHandle,
        request: &BuildRequest,
        dispatch_seq: u32,
        sink: OutcomeSink,
    ) -> Result<ExecutionHandle>;

    /// Best-effort cancellation. The outcome still arrives through the sink.
    async fn cancel(&self, handle: &ExecutionHandle) -> Result<()>;
}

/// Non-blocking hand-off of failed builds to the triage engine.
pub trait TriageDispatcher: Send + Sync {
    fn dispatch(&self, request: TriageRequest) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_outcome_sink_reports_until_closed() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let sink = OutcomeSink::new(tx);
        let report = OutcomeReport {
            build_id: BuildId::new(),
            dispatch_seq: 1,
            outcome: BuildOutcome::Succeeded,
            exit_code: Some(0),
        };
        sink.report(report).unwrap();
        assert_eq!(rx.try_recv().unwrap(), report);
        drop(rx);
        assert!(sink.report(report).is_err());
    }
}
