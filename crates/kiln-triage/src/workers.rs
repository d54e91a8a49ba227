//! Triage worker pool.
//!
//! The scheduler hands failed dispatches to [`TriageWorkers::dispatch`], which
//! only enqueues. A dispatcher task runs each request on its own task, bounded
//! by a semaphore, and sends the finished [`TriageReport`] back over a channel.

use crate::pipeline::TriagePipeline;
use kiln_core::ports::TriageDispatcher;
use kiln_core::triage::{TriageReport, TriageRequest};
use kiln_core::{Error, Result};
use std::sync::Arc;
use tokio::sync::{Semaphore, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

#[derive(Clone)]
pub struct TriageWorkers {
    tx: mpsc::UnboundedSender<TriageRequest>,
}

impl TriageWorkers {
    /// Start the dispatcher task.
    ///
    /// The returned handle completes once every `TriageWorkers` clone is
    /// dropped and all in-flight analyses have reported.
    pub fn spawn(
        pipeline: Arc<TriagePipeline>,
        worker_count: usize,
        reports: mpsc::UnboundedSender<TriageReport>,
    ) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = tokio::spawn(dispatch_loop(pipeline, worker_count.max(1), rx, reports));
        (Self { tx }, handle)
    }
}

impl TriageDispatcher for TriageWorkers {
    fn dispatch(&self, request: TriageRequest) -> Result<()> {
        debug!(build_id = %request.build_id, dispatch = request.dispatch_seq, "Triage requested");
        self.tx
            .send(request)
            .map_err(|_| Error::Internal("Triage workers have stopped".to_string()))
    }
}

async fn dispatch_loop(
    pipeline: Arc<TriagePipeline>,
    worker_count: usize,
    mut requests: mpsc::UnboundedReceiver<TriageRequest>,
    reports: mpsc::UnboundedSender<TriageReport>,
) {
    let semaphore = Arc::new(Semaphore::new(worker_count));
    info!(workers = worker_count, "Triage workers started");

    while let Some(request) = requests.recv().await {
        let Ok(permit) = Arc::clone(&semaphore).acquire_owned().await else {
            break;
        };
        let pipeline = Arc::clone(&pipeline);
        let reports = reports.clone();

        tokio::spawn(async move {
            let result = pipeline.analyze(request.build_id, request.dispatch_seq).await;
            let report = TriageReport {
                build_id: request.build_id,
                dispatch_seq: request.dispatch_seq,
                result,
            };
            if reports.send(report).is_err() {
                warn!(build_id = %request.build_id, "Triage report dropped, receiver closed");
            }
            drop(permit);
        });
    }

    // Wait for in-flight analyses before reporting shutdown.
    let _ = semaphore.acquire_many(worker_count as u32).await;
    info!("Triage workers stopped");
}
