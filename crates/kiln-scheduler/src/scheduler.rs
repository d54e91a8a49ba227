//! Main scheduler orchestration.
//!
//! All scheduling state lives behind one async mutex. `tick` additionally
//! holds a dedicated lock for its whole duration so two ticks never
//! interleave, while outcome and triage handling only contend for the
//! state mutex. Executors and the triage engine are never awaited while
//! the state mutex is held.

use crate::config::SchedulerConfig;
use crate::pool::ResourcePool;
use crate::queue::{BuildQueue, QueuedBuild};
use chrono::{DateTime, Utc};
use kiln_core::build::{BuildOutcome, BuildRecord, BuildRequest, BuildState, TerminalStatus};
use kiln_core::events::{
    AdmissionHaltedPayload, BuildCancelledPayload, BuildCompletedPayload, BuildQueuedPayload,
    BuildRetryingPayload, BuildStartedPayload, Event, SlotQuarantinedPayload,
    TriageCompletedPayload,
};
use kiln_core::ids::BuildId;
use kiln_core::ports::{
    BuildExecutor, EventBus, ExecutionHandle, OutcomeReport, OutcomeSink, TriageDispatcher,
};
use kiln_core::slot::SlotHandle;
use kiln_core::triage::{AnalysisResult, TriageReport, TriageRequest};
use kiln_core::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, mpsc, watch};
use tokio::time::{Duration, MissedTickBehavior, interval};
use tracing::{debug, error, info, warn};

/// Counters over finished builds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchedulerStats {
    pub submitted: u64,
    pub dispatched: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub timed_out: u64,
    pub cancelled: u64,
    pub retried: u64,
    pub infra_failures: u64,
}

impl SchedulerStats {
    /// Share of finished builds that failed or timed out. Cancelled builds
    /// are not counted.
    pub fn failure_rate(&self) -> f64 {
        let finished = self.succeeded + self.failed + self.timed_out;
        if finished == 0 {
            0.0
        } else {
            (self.failed + self.timed_out) as f64 / finished as f64
        }
    }
}

struct SchedulerState {
    records: HashMap<BuildId, BuildRecord>,
    queue: BuildQueue,
    /// Slot grants of allocated and running builds.
    slots: HashMap<BuildId, SlotHandle>,
    executions: HashMap<BuildId, ExecutionHandle>,
    submission_order: HashMap<BuildId, u64>,
    next_seq: u64,
    halted: bool,
    consecutive_infra_failures: u32,
    stats: SchedulerStats,
}

impl SchedulerState {
    fn new() -> Self {
        Self {
            records: HashMap::new(),
            queue: BuildQueue::new(),
            slots: HashMap::new(),
            executions: HashMap::new(),
            submission_order: HashMap::new(),
            next_seq: 0,
            halted: false,
            consecutive_infra_failures: 0,
            stats: SchedulerStats::default(),
        }
    }

    fn active_count(&self) -> usize {
        self.records
            .values()
            .filter(|r| r.state.is_active())
            .count()
    }

    fn enqueue(&mut self, build_id: BuildId) {
        let Some(record) = self.records.get(&build_id) else {
            return;
        };
        self.queue.enqueue(QueuedBuild {
            build_id,
            priority: record.priority,
            submitted_at: record.request.submitted_at,
            seq: self.submission_order.get(&build_id).copied().unwrap_or(u64::MAX),
            profile: record.request.profile.clone(),
        });
    }
}

/// The build scheduler.
pub struct Scheduler {
    config: SchedulerConfig,
    pool: Arc<ResourcePool>,
    executor: Arc<dyn BuildExecutor>,
    triage: Arc<dyn TriageDispatcher>,
    event_bus: Arc<dyn EventBus>,
    state: Mutex<SchedulerState>,
    tick_lock: Mutex<()>,
    outcome_tx: mpsc::UnboundedSender<OutcomeReport>,
}

impl Scheduler {
    /// Create a scheduler and the receiver its executors report into.
    pub fn new(
        config: SchedulerConfig,
        pool: Arc<ResourcePool>,
        executor: Arc<dyn BuildExecutor>,
        triage: Arc<dyn TriageDispatcher>,
        event_bus: Arc<dyn EventBus>,
    ) -> (Self, mpsc::UnboundedReceiver<OutcomeReport>) {
        let (outcome_tx, outcome_rx) = mpsc::unbounded_channel();
        let scheduler = Self {
            config,
            pool,
            executor,
            triage,
            event_bus,
            state: Mutex::new(SchedulerState::new()),
            tick_lock: Mutex::new(()),
            outcome_tx,
        };
        (scheduler, outcome_rx)
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    pub fn pool(&self) -> &Arc<ResourcePool> {
        &self.pool
    }

    /// Sink that feeds this scheduler's outcome channel.
    pub fn outcome_sink(&self) -> OutcomeSink {
        OutcomeSink::new(self.outcome_tx.clone())
    }

    /// Admit a build. The record starts `Queued`.
    ///
    /// A request without a tier gets one from the configured
    /// [`PriorityPolicy`](crate::priority::PriorityPolicy).
    pub async fn submit(&self, request: BuildRequest) -> Result<BuildId> {
        let build_id = request.id;
        let priority = match request.priority {
            Some(priority) => priority,
            None => {
                let assessment = self.config.priority.assess(&request.source);
                debug!(
                    build_id = %build_id,
                    score = assessment.score,
                    tier = ?assessment.tier,
                    factors = ?assessment.factors,
                    "Priority derived"
                );
                assessment.tier
            }
        };

        if !self.pool.fits_cluster(&request.profile).await {
            warn!(
                build_id = %build_id,
                profile = %request.profile,
                "No declared slot can host this build; it stays queued until capacity changes"
            );
        }

        let event = {
            let mut state = self.state.lock().await;
            if state.records.contains_key(&build_id) {
                return Err(Error::Internal(format!("build {build_id} already submitted")));
            }

            let seq = state.next_seq;
            state.next_seq += 1;
            state.submission_order.insert(build_id, seq);

            let event = Event::BuildQueued(BuildQueuedPayload {
                build_id,
                priority,
                repository: request.source.repository.clone(),
                git_ref: request.source.git_ref.clone(),
                queued_at: request.submitted_at,
            });
            let mut record = BuildRecord::new(request);
            record.priority = priority;
            state.records.insert(build_id, record);
            state.enqueue(build_id);
            state.stats.submitted += 1;
            event
        };

        info!(build_id = %build_id, priority = ?priority, "Build queued");
        self.publish(vec![event]).await;
        Ok(build_id)
    }

    /// Read-only snapshot of a build record.
    pub async fn status(&self, build_id: BuildId) -> Result<BuildRecord> {
        self.state
            .lock()
            .await
            .records
            .get(&build_id)
            .cloned()
            .ok_or_else(|| Error::BuildNotFound(build_id.to_string()))
    }

    pub async fn records(&self) -> Vec<BuildRecord> {
        self.state.lock().await.records.values().cloned().collect()
    }

    pub async fn stats(&self) -> SchedulerStats {
        self.state.lock().await.stats
    }

    pub async fn queue_len(&self) -> usize {
        self.state.lock().await.queue.len()
    }

    pub async fn queue_position(&self, build_id: BuildId) -> Option<usize> {
        self.state.lock().await.queue.position(build_id)
    }

    pub async fn running_count(&self) -> usize {
        self.state.lock().await.active_count()
    }

    /// Whether every submitted build has reached a terminal state.
    pub async fn all_terminal(&self) -> bool {
        self.state
            .lock()
            .await
            .records
            .values()
            .all(|r| r.is_terminal())
    }

    pub async fn is_halted(&self) -> bool {
        self.state.lock().await.halted
    }

    /// Clear an operational halt after external intervention.
    pub async fn resume_admission(&self) {
        let mut state = self.state.lock().await;
        if state.halted {
            info!(
                failures = state.consecutive_infra_failures,
                "Admission resumed"
            );
        }
        state.halted = false;
        state.consecutive_infra_failures = 0;
    }

    /// Run one scheduling pass.
    pub async fn tick(&self) -> Result<usize> {
        self.tick_at(Utc::now()).await
    }

    /// Run one scheduling pass as of `now`. Returns the number of builds
    /// dispatched.
    pub async fn tick_at(&self, now: DateTime<Utc>) -> Result<usize> {
        let _tick = self.tick_lock.lock().await;
        let mut dispatches = Vec::new();

        {
            let mut guard = self.state.lock().await;
            let state = &mut *guard;

            let due: Vec<BuildId> = state
                .records
                .values()
                .filter(|r| {
                    r.state == BuildState::Retrying
                        && r.retry_not_before.is_none_or(|t| t <= now)
                })
                .map(|r| r.id())
                .collect();
            for build_id in due {
                if let Some(record) = state.records.get_mut(&build_id) {
                    advance(record, BuildState::Queued);
                    record.retry_not_before = None;
                    debug!(build_id = %build_id, attempt = record.retry_count, "Retry requeued");
                }
                state.enqueue(build_id);
            }

            if state.halted {
                return Err(Error::AdmissionHalted {
                    failures: state.consecutive_infra_failures,
                });
            }

            let mut active = state.active_count();
            let mut skipped = Vec::new();

            while active < self.config.concurrency_ceiling {
                let Some(entry) = state.queue.dequeue() else {
                    break;
                };

                match self.pool.reserve(entry.build_id, &entry.profile).await {
                    Ok(handle) => {
                        let Some(record) = state.records.get_mut(&entry.build_id) else {
                            self.release_slot(&handle).await;
                            continue;
                        };
                        if let Err(e) = record.transition(BuildState::Allocated) {
                            warn!(build_id = %entry.build_id, error = %e, "Dequeued build is not queued");
                            self.release_slot(&handle).await;
                            continue;
                        }
                        record.slot = Some(handle.slot_id);
                        record.dispatch_seq += 1;

                        advance(record, BuildState::Running);
                        record.started_at = Some(now);
                        record.ended_at = None;

                        dispatches.push((handle.clone(), record.request.clone(), record.dispatch_seq));
                        state.slots.insert(entry.build_id, handle);
                        active += 1;
                    }
                    Err(Error::ResourceUnavailable(_)) => skipped.push(entry),
                    Err(e) => {
                        warn!(build_id = %entry.build_id, error = %e, "Reservation failed");
                        skipped.push(entry);
                    }
                }
            }

            // Put back builds that couldn't be placed
            for entry in skipped {
                state.queue.enqueue(entry);
            }
        }

        let dispatched = dispatches.len();
        for (handle, request, dispatch_seq) in dispatches {
            self.dispatch(handle, request, dispatch_seq).await;
        }
        Ok(dispatched)
    }

    async fn dispatch(&self, handle: SlotHandle, request: BuildRequest, dispatch_seq: u32) {
        let build_id = handle.build_id;
        let sink = self.outcome_sink();

        match self
            .executor
            .start(&handle, &request, dispatch_seq, sink)
            .await
        {
            Ok(execution) => {
                let cancel_now = {
                    let mut guard = self.state.lock().await;
                    let state = &mut *guard;
                    state.consecutive_infra_failures = 0;
                    state.stats.dispatched += 1;
                    match state.records.get(&build_id) {
                        Some(r) if r.dispatch_seq == dispatch_seq && r.state == BuildState::Running => {
                            state.executions.insert(build_id, execution.clone());
                            r.cancel_requested
                        }
                        _ => false,
                    }
                };

                info!(
                    build_id = %build_id,
                    slot_id = %handle.slot_id,
                    node = %handle.node,
                    dispatch_seq,
                    "Build started"
                );
                self.publish(vec![Event::BuildStarted(BuildStartedPayload {
                    build_id,
                    slot_id: handle.slot_id,
                    node: handle.node.clone(),
                    dispatch_seq,
                    started_at: Utc::now(),
                })])
                .await;

                if cancel_now {
                    self.cancel_execution(&execution).await;
                }
            }
            Err(e) => self.on_start_failure(handle, dispatch_seq, e).await,
        }
    }

    async fn on_start_failure(&self, handle: SlotHandle, dispatch_seq: u32, err: Error) {
        let build_id = handle.build_id;
        let now = Utc::now();
        let mut events = Vec::new();

        error!(build_id = %build_id, error = %err, "Executor failed to start build");

        {
            let mut guard = self.state.lock().await;
            let state = &mut *guard;
            state.stats.infra_failures += 1;
            state.consecutive_infra_failures += 1;

            let mut requeue = false;
            if let Some(record) = state.records.get_mut(&build_id)
                && record.dispatch_seq == dispatch_seq
                && record.state == BuildState::Running
            {
                if let Some(granted) = state.slots.remove(&build_id) {
                    self.release_slot(&granted).await;
                }
                record.infra_failures += 1;
                record.slot = None;
                record.started_at = None;

                if record.cancel_requested {
                    events.push(finish(&mut state.stats, record, TerminalStatus::Cancelled, now));
                } else {
                    advance(record, BuildState::Queued);
                    requeue = true;
                }
            }
            if requeue {
                state.enqueue(build_id);
            }

            let ceiling = self.config.max_consecutive_infra_failures;
            if !state.halted && state.consecutive_infra_failures >= ceiling {
                state.halted = true;
                error!(
                    failures = state.consecutive_infra_failures,
                    "Admission halted after consecutive executor start failures"
                );
                events.push(Event::AdmissionHalted(AdmissionHaltedPayload {
                    consecutive_failures: state.consecutive_infra_failures,
                    halted_at: now,
                }));
            }
        }

        self.publish(events).await;
    }

    /// Apply an executor outcome. Stale outcomes are ignored.
    pub async fn on_outcome(&self, report: OutcomeReport) {
        let build_id = report.build_id;
        let now = Utc::now();
        let mut events = Vec::new();
        let mut triage_request = None;

        {
            let mut guard = self.state.lock().await;
            let state = &mut *guard;

            let Some(record) = state.records.get_mut(&build_id) else {
                debug!(build_id = %build_id, "Outcome for unknown build ignored");
                return;
            };
            if record.dispatch_seq != report.dispatch_seq || record.state != BuildState::Running {
                debug!(
                    build_id = %build_id,
                    dispatch_seq = report.dispatch_seq,
                    state = %record.state,
                    "Stale outcome ignored"
                );
                return;
            }

            state.executions.remove(&build_id);
            let handle = state.slots.remove(&build_id);

            let outcome = if record.cancel_requested {
                BuildOutcome::Cancelled
            } else {
                report.outcome
            };

            match outcome {
                BuildOutcome::Succeeded => {
                    if let Some(handle) = &handle {
                        self.release_slot(handle).await;
                        self.clean_exit(handle).await;
                    }
                    events.push(finish(&mut state.stats, record, TerminalStatus::Succeeded, now));
                }
                BuildOutcome::Failed => {
                    if let Some(handle) = &handle {
                        self.release_slot(handle).await;
                        self.clean_exit(handle).await;
                    }
                    advance(record, BuildState::Failed);
                    record.slot = None;
                    record.ended_at = Some(now);
                    info!(
                        build_id = %build_id,
                        exit_code = ?report.exit_code,
                        "Build failed; triage requested"
                    );
                    triage_request = Some(TriageRequest {
                        build_id,
                        dispatch_seq: report.dispatch_seq,
                    });
                }
                BuildOutcome::TimedOut => {
                    let request = self
                        .time_out(&mut state.stats, record, handle, now, &mut events)
                        .await;
                    triage_request = Some(request);
                }
                BuildOutcome::Cancelled => {
                    if let Some(handle) = &handle {
                        self.release_slot(handle).await;
                    }
                    events.push(finish(&mut state.stats, record, TerminalStatus::Cancelled, now));
                }
            }
        }

        self.publish(events).await;
        if let Some(request) = triage_request {
            self.request_triage(request).await;
        }
    }

    /// Apply a completed analysis to the build it was requested for.
    pub async fn on_triage_report(&self, report: TriageReport) {
        let build_id = report.build_id;
        let now = Utc::now();
        let mut events = Vec::new();

        {
            let mut guard = self.state.lock().await;
            let state = &mut *guard;

            let Some(record) = state.records.get_mut(&build_id) else {
                debug!(build_id = %build_id, "Triage report for unknown build ignored");
                return;
            };
            if record.dispatch_seq != report.dispatch_seq {
                debug!(build_id = %build_id, "Stale triage report ignored");
                return;
            }

            let result = report.result;
            let current = record.state;
            match current {
                BuildState::Failed if !record.is_terminal() => {
                    events.push(triage_completed(build_id, &result));

                    if record.retry_count < self.config.max_retries && result.is_transient() {
                        record.retry_count += 1;
                        let delay = self.config.retry_delay(record.retry_count);
                        let not_before = now
                            + chrono::Duration::from_std(delay)
                                .unwrap_or_else(|_| chrono::Duration::zero());

                        if self.config.bump_priority_on_known_fix && result.is_known_fixable() {
                            record.priority = record.priority.bump();
                        }
                        advance(record, BuildState::Retrying);
                        record.retry_not_before = Some(not_before);
                        record.analysis = Some(result);
                        state.stats.retried += 1;

                        info!(
                            build_id = %build_id,
                            attempt = record.retry_count,
                            delay_secs = delay.as_secs(),
                            priority = ?record.priority,
                            "Transient failure; retry scheduled"
                        );
                        events.push(Event::BuildRetrying(BuildRetryingPayload {
                            build_id,
                            attempt: record.retry_count,
                            priority: record.priority,
                            not_before,
                        }));
                    } else {
                        record.analysis = Some(result);
                        events.push(finish(&mut state.stats, record, TerminalStatus::Failed, now));
                    }
                }
                BuildState::TimedOut if record.analysis.is_none() => {
                    events.push(triage_completed(build_id, &result));
                    record.analysis = Some(result);
                }
                other => {
                    debug!(build_id = %build_id, state = %other, "Triage report dropped");
                }
            }
        }

        self.publish(events).await;
    }

    /// Enforce the per-build time budget.
    pub async fn check_timeouts(&self) -> usize {
        self.check_timeouts_at(Utc::now()).await
    }

    /// Enforce the per-build time budget as of `now`. Returns the number of
    /// builds timed out.
    pub async fn check_timeouts_at(&self, now: DateTime<Utc>) -> usize {
        let budget = self.config.build_timeout();
        let mut events = Vec::new();
        let mut cancels = Vec::new();
        let mut triage_requests = Vec::new();

        {
            let mut guard = self.state.lock().await;
            let state = &mut *guard;

            let expired: Vec<BuildId> = state
                .records
                .values()
                .filter(|r| {
                    r.state == BuildState::Running
                        && r.started_at.is_some_and(|t| now - t >= budget)
                })
                .map(|r| r.id())
                .collect();

            for build_id in expired {
                let handle = state.slots.remove(&build_id);
                if let Some(execution) = state.executions.remove(&build_id) {
                    cancels.push(execution);
                }
                let Some(record) = state.records.get_mut(&build_id) else {
                    continue;
                };

                if record.cancel_requested {
                    if let Some(handle) = &handle {
                        self.release_slot(handle).await;
                    }
                    events.push(finish(&mut state.stats, record, TerminalStatus::Cancelled, now));
                    continue;
                }

                let request = self
                    .time_out(&mut state.stats, record, handle, now, &mut events)
                    .await;
                triage_requests.push(request);
            }
        }

        let timed_out = triage_requests.len();
        self.publish(events).await;
        for execution in &cancels {
            self.cancel_execution(execution).await;
        }
        for request in triage_requests {
            self.request_triage(request).await;
        }
        timed_out
    }

    /// Cancel a build.
    ///
    /// Queued, retrying and triage-pending builds are cancelled at once.
    /// Running builds are signalled and become `Cancelled` when the
    /// executor acknowledges.
    pub async fn cancel(&self, build_id: BuildId) -> Result<()> {
        let now = Utc::now();
        let mut events = Vec::new();
        let mut execution = None;

        {
            let mut guard = self.state.lock().await;
            let state = &mut *guard;

            let Some(record) = state.records.get_mut(&build_id) else {
                return Err(Error::BuildNotFound(build_id.to_string()));
            };
            if record.is_terminal() {
                return Err(Error::InvalidTransition {
                    build: build_id.to_string(),
                    from: record.state.to_string(),
                    to: BuildState::Cancelled.to_string(),
                });
            }

            let mut dequeue = false;
            let current = record.state;
            match current {
                BuildState::Allocated | BuildState::Running => {
                    record.cancel_requested = true;
                    execution = state.executions.get(&build_id).cloned();
                    info!(build_id = %build_id, "Cancellation requested for running build");
                }
                _ => {
                    events.push(finish(&mut state.stats, record, TerminalStatus::Cancelled, now));
                    dequeue = true;
                }
            }
            if dequeue {
                state.queue.remove(build_id);
            }
        }

        self.publish(events).await;
        if let Some(execution) = execution {
            self.cancel_execution(&execution).await;
        }
        Ok(())
    }

    /// Drive the scheduler until shutdown.
    pub async fn run(
        &self,
        mut outcomes: mpsc::UnboundedReceiver<OutcomeReport>,
        mut reports: mpsc::UnboundedReceiver<TriageReport>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut ticker = interval(Duration::from_millis(self.config.tick_interval_ms));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut watchdog = interval(Duration::from_secs(self.config.watchdog_interval_secs));
        watchdog.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut capacity = self.pool.subscribe();
        let mut reports_open = true;

        info!(
            concurrency_ceiling = self.config.concurrency_ceiling,
            build_timeout_secs = self.config.build_timeout_secs,
            "Starting scheduler loop"
        );

        loop {
            tokio::select! {
                _ = ticker.tick() => self.run_tick().await,
                // Freed capacity is scheduled without waiting for the next interval.
                Ok(()) = capacity.changed() => self.run_tick().await,
                _ = watchdog.tick() => {
                    let timed_out = self.check_timeouts().await;
                    if timed_out > 0 {
                        warn!(timed_out, "Watchdog timed out builds");
                    }
                }
                Some(report) = outcomes.recv() => {
                    self.on_outcome(report).await;
                }
                report = reports.recv(), if reports_open => {
                    match report {
                        Some(report) => self.on_triage_report(report).await,
                        None => {
                            warn!("Triage report channel closed");
                            reports_open = false;
                        }
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("Scheduler shutting down");
                        break;
                    }
                }
            }
        }
    }

    async fn run_tick(&self) {
        match self.tick().await {
            Ok(0) | Err(Error::AdmissionHalted { .. }) => {}
            Ok(dispatched) => debug!(dispatched, "Tick dispatched builds"),
            Err(e) => error!(error = %e, "Tick failed"),
        }
    }

    async fn time_out(
        &self,
        stats: &mut SchedulerStats,
        record: &mut BuildRecord,
        handle: Option<SlotHandle>,
        now: DateTime<Utc>,
        events: &mut Vec<Event>,
    ) -> TriageRequest {
        let build_id = record.id();
        let slot_id = handle.as_ref().map(|h| h.slot_id).or(record.slot);

        warn!(
            build_id = %build_id,
            timeout_secs = self.config.build_timeout_secs,
            "Build timed out"
        );

        if let Some(slot_id) = slot_id {
            if let Err(e) = self.pool.force_release(slot_id).await {
                error!(slot_id = %slot_id, error = %e, "Failed to force-release slot");
            }
            match self.pool.record_timeout(slot_id).await {
                Ok(true) => {
                    let consecutive_timeouts = self.config.quarantine_after_timeouts;
                    let node = self
                        .pool
                        .slot(slot_id)
                        .await
                        .map(|s| s.node)
                        .unwrap_or_default();
                    events.push(Event::SlotQuarantined(SlotQuarantinedPayload {
                        slot_id,
                        node,
                        consecutive_timeouts,
                        snapshot: self.pool.capacity_snapshot().await,
                    }));
                }
                Ok(false) => {}
                Err(e) => error!(slot_id = %slot_id, error = %e, "Failed to record slot timeout"),
            }
        }

        events.push(finish(stats, record, TerminalStatus::TimedOut, now));
        TriageRequest {
            build_id,
            dispatch_seq: record.dispatch_seq,
        }
    }

    async fn request_triage(&self, request: TriageRequest) {
        if let Err(e) = self.triage.dispatch(request) {
            warn!(
                build_id = %request.build_id,
                error = %e,
                "Triage dispatch failed; recording unknown analysis"
            );
            self.on_triage_report(TriageReport {
                build_id: request.build_id,
                dispatch_seq: request.dispatch_seq,
                result: AnalysisResult::unknown(request.build_id, 0),
            })
            .await;
        }
    }

    async fn release_slot(&self, handle: &SlotHandle) {
        if let Err(e) = self.pool.release(handle).await {
            error!(build_id = %handle.build_id, slot_id = %handle.slot_id, error = %e, "Failed to release slot");
        }
    }

    async fn clean_exit(&self, handle: &SlotHandle) {
        if let Err(e) = self.pool.record_clean_exit(handle.slot_id).await {
            error!(slot_id = %handle.slot_id, error = %e, "Failed to reset slot timeouts");
        }
    }

    async fn cancel_execution(&self, execution: &ExecutionHandle) {
        if let Err(e) = self.executor.cancel(execution).await {
            warn!(build_id = %execution.build_id, error = %e, "Executor cancel failed");
        }
    }

    async fn publish(&self, events: Vec<Event>) {
        for event in events {
            if let Err(e) = self.event_bus.publish(event).await {
                error!(error = %e, "Failed to publish event");
            }
        }
    }
}

/// Apply a state change the caller has already checked against the record.
fn advance(record: &mut BuildRecord, next: BuildState) {
    if let Err(e) = record.transition(next) {
        debug_assert!(false, "{e}");
        error!(build_id = %record.id(), error = %e, "Illegal state change skipped");
    }
}

/// Move a record to a terminal state and count it.
fn finish(
    stats: &mut SchedulerStats,
    record: &mut BuildRecord,
    status: TerminalStatus,
    now: DateTime<Utc>,
) -> Event {
    let next = match status {
        TerminalStatus::Succeeded => BuildState::Succeeded,
        TerminalStatus::Failed => BuildState::Failed,
        TerminalStatus::TimedOut => BuildState::TimedOut,
        TerminalStatus::Cancelled => BuildState::Cancelled,
    };
    // A triaged failure is already `Failed` and only becomes terminal.
    if record.state != next {
        advance(record, next);
    }
    record.terminal = Some(status);
    record.slot = None;
    record.retry_not_before = None;
    let ended_at = *record.ended_at.get_or_insert(now);

    match status {
        TerminalStatus::Succeeded => stats.succeeded += 1,
        TerminalStatus::Failed => stats.failed += 1,
        TerminalStatus::TimedOut => stats.timed_out += 1,
        TerminalStatus::Cancelled => stats.cancelled += 1,
    }

    let build_id = record.id();
    info!(
        build_id = %build_id,
        state = %record.state,
        retries = record.retry_count,
        "Build finished"
    );

    match status {
        TerminalStatus::Cancelled => Event::BuildCancelled(BuildCancelledPayload {
            build_id,
            cancelled_at: ended_at,
        }),
        _ => Event::BuildCompleted(BuildCompletedPayload {
            build_id,
            status,
            retry_count: record.retry_count,
            duration_ms: record.duration_ms(),
            category: record.analysis.as_ref().map(|a| a.category),
            completed_at: ended_at,
        }),
    }
}

fn triage_completed(build_id: BuildId, result: &AnalysisResult) -> Event {
    Event::TriageCompleted(TriageCompletedPayload {
        build_id,
        category: result.category,
        confidence: result.confidence,
        cause: result.top().map(|h| h.cause.clone()),
        transient: result.is_transient(),
        recommendations: result.recommendations.len(),
    })
}
