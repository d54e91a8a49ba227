//! Priority queue of builds waiting for a slot.

use chrono::{DateTime, Utc};
use kiln_core::build::{Priority, ResourceProfile};
use kiln_core::ids::BuildId;
use std::cmp::Ordering;
use std::collections::BinaryHeap;

/// A queued build waiting for allocation.
#[derive(Debug, Clone)]
pub struct QueuedBuild {
    pub build_id: BuildId,
    pub priority: Priority,
    pub submitted_at: DateTime<Utc>,
    /// Submission order, used when timestamps tie.
    pub seq: u64,
    pub profile: ResourceProfile,
}

impl PartialEq for QueuedBuild {
    fn eq(&self, other: &Self) -> bool {
        self.build_id == other.build_id
    }
}

impl Eq for QueuedBuild {}

impl PartialOrd for QueuedBuild {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueuedBuild {
    fn cmp(&self, other: &Self) -> Ordering {
        // Higher priority first, then earlier submission, then earlier seq
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.submitted_at.cmp(&self.submitted_at))
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

/// Queue of builds ordered by priority and submission time.
#[derive(Debug, Default)]
pub struct BuildQueue {
    queue: BinaryHeap<QueuedBuild>,
}

impl BuildQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enqueue(&mut self, build: QueuedBuild) {
        self.queue.push(build);
    }

    /// Remove and return the highest-ranked build.
    pub fn dequeue(&mut self) -> Option<QueuedBuild> {
        self.queue.pop()
    }

    /// Remove a build from the queue. Returns whether it was present.
    pub fn remove(&mut self, build_id: BuildId) -> bool {
        let before = self.queue.len();
        self.queue.retain(|b| b.build_id != build_id);
        self.queue.len() != before
    }

    pub fn contains(&self, build_id: BuildId) -> bool {
        self.queue.iter().any(|b| b.build_id == build_id)
    }

    /// Zero-based dispatch position of a build.
    pub fn position(&self, build_id: BuildId) -> Option<usize> {
        let mut sorted: Vec<_> = self.queue.iter().collect();
        sorted.sort_by(|a, b| b.cmp(a));
        sorted.iter().position(|b| b.build_id == build_id)
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}
