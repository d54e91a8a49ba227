//! Shared fixtures for scheduler scenarios.

#![allow(dead_code)]

use async_trait::async_trait;
use kiln_core::build::{BuildOutcome, BuildRequest, Priority, ResourceProfile, SourceRef};
use kiln_core::events::Event;
use kiln_core::ids::{BuildId, SlotId};
use kiln_core::ports::{
    BuildExecutor, EventBus, EventStream, ExecutionHandle, OutcomeReport, OutcomeSink,
    TriageDispatcher,
};
use kiln_core::slot::{Capacity, SlotHandle, SlotSpec};
use kiln_core::triage::{
    AnalysisResult, CauseHypothesis, FailureCategory, Recommendation, TriageRequest,
};
use kiln_core::{Error, Result};
use kiln_scheduler::{ResourcePool, Scheduler, SchedulerConfig};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

/// One accepted `start` call.
#[derive(Debug, Clone)]
pub struct Started {
    pub build_id: BuildId,
    pub slot_id: SlotId,
    pub dispatch_seq: u32,
    pub sink: OutcomeSink,
}

/// Executor that records starts and never finishes a build on its own.
#[derive(Default)]
pub struct MockExecutor {
    started: Mutex<Vec<Started>>,
    cancelled: Mutex<Vec<ExecutionHandle>>,
    fail_starts: AtomicBool,
}

impl MockExecutor {
    pub fn set_fail_starts(&self, fail: bool) {
        self.fail_starts.store(fail, Ordering::SeqCst);
    }

    pub fn started(&self) -> Vec<Started> {
        self.started.lock().unwrap().clone()
    }

    pub fn cancelled(&self) -> Vec<ExecutionHandle> {
        self.cancelled.lock().unwrap().clone()
    }

    /// Finish the latest start of a build through its sink.
    pub fn finish(&self, build_id: BuildId, outcome: BuildOutcome) {
        let started = self.started();
        let start = started
            .iter()
            .rev()
            .find(|s| s.build_id == build_id)
            .expect("build was never started");
        start
            .sink
            .report(OutcomeReport {
                build_id,
                dispatch_seq: start.dispatch_seq,
                outcome,
                exit_code: match outcome {
                    BuildOutcome::Succeeded => Some(0),
                    _ => Some(1),
                },
            })
            .unwrap();
    }
}

#[async_trait]
impl BuildExecutor for MockExecutor {
    async fn start(
        &self,
        slot: &SlotHandle,
        request: &BuildRequest,
        dispatch_seq: u32,
        sink: OutcomeSink,
    ) -> Result<ExecutionHandle> {
        if self.fail_starts.load(Ordering::SeqCst) {
            return Err(Error::ExecutorStartFailure("node agent unreachable".to_string()));
        }
        self.started.lock().unwrap().push(Started {
            build_id: request.id,
            slot_id: slot.slot_id,
            dispatch_seq,
            sink,
        });
        Ok(ExecutionHandle {
            build_id: request.id,
            slot_id: slot.slot_id,
            dispatch_seq,
            reference: None,
        })
    }

    async fn cancel(&self, handle: &ExecutionHandle) -> Result<()> {
        self.cancelled.lock().unwrap().push(handle.clone());
        Ok(())
    }
}

/// Dispatcher that only remembers what it was asked to analyze.
#[derive(Default)]
pub struct RecordingDispatcher {
    requests: Mutex<Vec<TriageRequest>>,
}

impl RecordingDispatcher {
    pub fn requests(&self) -> Vec<TriageRequest> {
        self.requests.lock().unwrap().clone()
    }
}

impl TriageDispatcher for RecordingDispatcher {
    fn dispatch(&self, request: TriageRequest) -> Result<()> {
        self.requests.lock().unwrap().push(request);
        Ok(())
    }
}

#[derive(Default)]
pub struct RecordingEventBus {
    events: Mutex<Vec<Event>>,
}

impl RecordingEventBus {
    pub fn subjects(&self) -> Vec<String> {
        self.events.lock().unwrap().iter().map(Event::subject).collect()
    }

    pub fn events(&self) -> Vec<Event> {
        self.events.lock().unwrap().clone()
    }
}

#[async_trait]
impl EventBus for RecordingEventBus {
    async fn publish(&self, event: Event) -> Result<()> {
        self.events.lock().unwrap().push(event);
        Ok(())
    }

    async fn subscribe(&self, _pattern: &str) -> Result<EventStream> {
        Err(Error::Internal("recording bus has no subscribers".to_string()))
    }
}

pub fn slot(node: &str, gpus: u32) -> SlotSpec {
    SlotSpec {
        node: node.to_string(),
        capacity: Capacity::new(64, 512, gpus),
        gpu_arch: "gfx90a".to_string(),
        rocm_version: Some("6.1".to_string()),
    }
}

pub fn request(gpus: u32, priority: Priority) -> BuildRequest {
    BuildRequest::new(
        SourceRef {
            repository: "https://git.example.com/rocm/kernels.git".to_string(),
            git_ref: "main".to_string(),
            script: None,
            ..Default::default()
        },
        ResourceProfile::gpus(gpus),
        priority,
    )
}

pub struct Harness {
    pub scheduler: Arc<Scheduler>,
    pub pool: Arc<ResourcePool>,
    pub executor: Arc<MockExecutor>,
    pub dispatcher: Arc<RecordingDispatcher>,
    pub bus: Arc<RecordingEventBus>,
    pub outcomes: mpsc::UnboundedReceiver<OutcomeReport>,
}

impl Harness {
    pub fn new(config: SchedulerConfig, slots: Vec<SlotSpec>) -> Self {
        let pool = Arc::new(ResourcePool::new(slots, config.quarantine_after_timeouts));
        let executor = Arc::new(MockExecutor::default());
        let dispatcher = Arc::new(RecordingDispatcher::default());
        let bus = Arc::new(RecordingEventBus::default());
        let (scheduler, outcomes) = Scheduler::new(
            config,
            pool.clone(),
            executor.clone(),
            dispatcher.clone(),
            bus.clone(),
        );
        Self {
            scheduler: Arc::new(scheduler),
            pool,
            executor,
            dispatcher,
            bus,
            outcomes,
        }
    }

    /// Deliver every outcome reported so far.
    pub async fn drain_outcomes(&mut self) -> usize {
        let mut delivered = 0;
        while let Ok(report) = self.outcomes.try_recv() {
            self.scheduler.on_outcome(report).await;
            delivered += 1;
        }
        delivered
    }
}

/// Analysis whose top cause is a transient runtime fault with a known fix.
pub fn transient_analysis(build_id: BuildId) -> AnalysisResult {
    let mut result = AnalysisResult::unknown(build_id, 1);
    result.category = FailureCategory::Runtime;
    result.confidence = 0.9;
    result.hypotheses = vec![CauseHypothesis {
        category: FailureCategory::Runtime,
        cause: "GPU memory exhausted by a co-tenant".to_string(),
        signature: None,
        transient: true,
        prior: 0.4,
        posterior: 1.0,
    }];
    result.recommendations = vec![Recommendation {
        description: "Retry on an idle slot".to_string(),
        success_rate: 0.8,
        applied: 10,
    }];
    result
}
