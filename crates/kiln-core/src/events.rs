//! Events published on the event bus at every build and corpus transition.

use crate::build::{Priority, TerminalStatus};
use crate::ids::*;
use crate::slot::CapacitySnapshot;
use crate::triage::FailureCategory;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// All events in the Kiln system.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    // Build lifecycle
    BuildQueued(BuildQueuedPayload),
    BuildStarted(BuildStartedPayload),
    BuildCompleted(BuildCompletedPayload),
    BuildRetrying(BuildRetryingPayload),
    BuildCancelled(BuildCancelledPayload),

    // Triage
    TriageCompleted(TriageCompletedPayload),
    SignatureCreated(SignatureCreatedPayload),

    // Operations
    SlotQuarantined(SlotQuarantinedPayload),
    AdmissionHalted(AdmissionHaltedPayload),
}

impl Event {
    /// Returns the subject this event is addressed to.
    pub fn subject(&self) -> String {
        match self {
            Event::BuildQueued(p) => format!("build.queued.{}", p.build_id),
            Event::BuildStarted(p) => format!("build.started.{}", p.build_id),
            Event::BuildCompleted(p) => format!("build.completed.{}", p.build_id),
            Event::BuildRetrying(p) => format!("build.retrying.{}", p.build_id),
            Event::BuildCancelled(p) => format!("build.cancelled.{}", p.build_id),
            Event::TriageCompleted(p) => format!("triage.completed.{}", p.build_id),
            Event::SignatureCreated(p) => format!("corpus.signature.created.{}", p.category),
            Event::SlotQuarantined(p) => format!("slot.quarantined.{}", p.slot_id),
            Event::AdmissionHalted(_) => "scheduler.admission.halted".to_string(),
        }
    }
}

/// Whether `subject` matches a dot-separated `pattern`.
///
/// `*` matches exactly one token, `>` matches one or more trailing tokens.
pub fn subject_matches(pattern: &str, subject: &str) -> bool {
    let mut pattern_tokens = pattern.split('.');
    let mut subject_tokens = subject.split('.');
    loop {
        match (pattern_tokens.next(), subject_tokens.next()) {
            (Some(">"), Some(_)) => return true,
            (Some("*"), Some(_)) => continue,
            (Some(p), Some(s)) if p == s => continue,
            (None, None) => return true,
            _ => return false,
        }
    }
}

// === Build Payloads ===

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildQueuedPayload {
    pub build_id: BuildId,
    pub priority: Priority,
    pub repository: String,
    pub git_ref: String,
    pub queued_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildStartedPayload {
    pub build_id: BuildId,
    pub slot_id: SlotId,
    pub node: String,
    pub dispatch_seq: u32,
    pub started_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildCompletedPayload {
    pub build_id: BuildId,
    pub status: TerminalStatus,
    pub retry_count: u32,
    pub duration_ms: Option<u64>,
    pub category: Option<FailureCategory>,
    pub completed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildRetryingPayload {
    pub build_id: BuildId,
    pub attempt: u32,
    pub priority: Priority,
    pub not_before: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildCancelledPayload {
    pub build_id: BuildId,
    pub cancelled_at: DateTime<Utc>,
}

// === Triage Payloads ===

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriageCompletedPayload {
    pub build_id: BuildId,
    pub category: FailureCategory,
    pub confidence: f64,
    pub cause: Option<String>,
    pub transient: bool,
    pub recommendations: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignatureCreatedPayload {
    pub signature_id: SignatureId,
    pub key: TemplateKey,
    pub category: FailureCategory,
    pub template: String,
}

// === Operational Payloads ===

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SlotQuarantinedPayload {
    pub slot_id: SlotId,
    pub node: String,
    pub consecutive_timeouts: u32,
    pub snapshot: CapacitySnapshot,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdmissionHaltedPayload {
    pub consecutive_failures: u32,
    pub halted_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_subject_patterns() {
        assert!(subject_matches("build.>", "build.queued.bld_1"));
        assert!(subject_matches("build.*.bld_1", "build.started.bld_1"));
        assert!(!subject_matches("build.*", "build.started.bld_1"));
        assert!(!subject_matches("slot.>", "build.started.bld_1"));
        assert!(subject_matches(
            "scheduler.admission.halted",
            "scheduler.admission.halted"
        ));
    }

    #[test]
    fn test_event_serialization_is_tagged() {
        let event = Event::AdmissionHalted(AdmissionHaltedPayload {
            consecutive_failures: 5,
            halted_at: Utc::now(),
        });
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "admission_halted");
        assert_eq!(event.subject(), "scheduler.admission.halted");
    }
}
