//! Build request and record types.

use crate::ids::{BuildId, SlotId};
use crate::triage::AnalysisResult;
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Scheduling tier of a build. Higher tiers are dispatched first.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low = 0,
    #[default]
    Normal = 1,
    High = 2,
    Critical = 3,
}

impl Priority {
    /// The next tier up, saturating at `Critical`.
    pub fn bump(self) -> Self {
        match self {
            Priority::Low => Priority::Normal,
            Priority::Normal => Priority::High,
            Priority::High | Priority::Critical => Priority::Critical,
        }
    }
}

/// Resources a build asks for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceProfile {
    #[serde(default = "default_cpu_cores")]
    pub cpu_cores: u32,
    #[serde(default)]
    pub memory_gb: u32,
    #[serde(default = "default_gpu_count")]
    pub gpu_count: u32,
    /// GPU architecture tag such as `gfx90a`. `None` accepts any architecture.
    #[serde(default)]
    pub gpu_arch: Option<String>,
    /// ROCm version tag such as `6.1`. `None` accepts any version.
    #[serde(default)]
    pub rocm_version: Option<String>,
}

fn default_cpu_cores() -> u32 {
    1
}

fn default_gpu_count() -> u32 {
    1
}

impl Default for ResourceProfile {
    fn default() -> Self {
        Self {
            cpu_cores: default_cpu_cores(),
            memory_gb: 0,
            gpu_count: default_gpu_count(),
            gpu_arch: None,
            rocm_version: None,
        }
    }
}

impl ResourceProfile {
    pub fn gpus(gpu_count: u32) -> Self {
        Self {
            gpu_count,
            ..Default::default()
        }
    }

    pub fn with_arch(mut self, arch: impl Into<String>) -> Self {
        self.gpu_arch = Some(arch.into());
        self
    }

    pub fn with_rocm(mut self, version: impl Into<String>) -> Self {
        self.rocm_version = Some(version.into());
        self
    }

    pub fn with_cpu(mut self, cores: u32, memory_gb: u32) -> Self {
        self.cpu_cores = cores;
        self.memory_gb = memory_gb;
        self
    }
}

impl fmt::Display for ResourceProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "cpu={} mem={}G gpu={}",
            self.cpu_cores, self.memory_gb, self.gpu_count
        )?;
        if let Some(arch) = &self.gpu_arch {
            write!(f, " arch={arch}")?;
        }
        if let Some(rocm) = &self.rocm_version {
            write!(f, " rocm={rocm}")?;
        }
        Ok(())
    }
}

/// Where the build's sources come from and what to run.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SourceRef {
    pub repository: String,
    #[serde(default = "default_git_ref")]
    pub git_ref: String,
    /// Shell script executed by local executors.
    #[serde(default)]
    pub script: Option<String>,
    /// Labels carried by the change under build, e.g. `urgent`.
    #[serde(default)]
    pub labels: Vec<String>,
    #[serde(default)]
    pub draft: bool,
    #[serde(default)]
    pub ready_for_review: bool,
    /// Account that triggered the build, e.g. `dependabot[bot]`.
    #[serde(default)]
    pub triggered_by: Option<String>,
}

fn default_git_ref() -> String {
    "main".to_string()
}

/// An immutable request to build something.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuildRequest {
    pub id: BuildId,
    pub submitted_at: DateTime<Utc>,
    pub profile: ResourceProfile,
    /// Requested tier. `None` lets the scheduler derive one from the source.
    #[serde(default)]
    pub priority: Option<Priority>,
    pub source: SourceRef,
}

impl BuildRequest {
    pub fn new(source: SourceRef, profile: ResourceProfile, priority: Priority) -> Self {
        Self {
            priority: Some(priority),
            ..Self::unprioritized(source, profile)
        }
    }

    /// A request whose tier the scheduler derives at submission.
    pub fn unprioritized(source: SourceRef, profile: ResourceProfile) -> Self {
        Self {
            id: BuildId::new(),
            submitted_at: Utc::now(),
            profile,
            priority: None,
            source,
        }
    }
}

/// Lifecycle state of a build record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BuildState {
    Queued,
    Allocated,
    Running,
    Succeeded,
    Failed,
    TimedOut,
    Retrying,
    Cancelled,
}

impl BuildState {
    /// Whether the build currently counts against the concurrency ceiling.
    pub fn is_active(&self) -> bool {
        matches!(self, BuildState::Allocated | BuildState::Running)
    }

    pub fn can_transition_to(&self, next: BuildState) -> bool {
        use BuildState::*;
        matches!(
            (self, next),
            (Queued, Allocated)
                | (Queued, Cancelled)
                | (Allocated, Running)
                | (Allocated, Queued)
                | (Running, Queued)
                | (Running, Succeeded)
                | (Running, Failed)
                | (Running, TimedOut)
                | (Running, Cancelled)
                | (Failed, Retrying)
                | (Failed, Cancelled)
                | (Retrying, Queued)
                | (Retrying, Cancelled)
        )
    }
}

impl fmt::Display for BuildState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            BuildState::Queued => "queued",
            BuildState::Allocated => "allocated",
            BuildState::Running => "running",
            BuildState::Succeeded => "succeeded",
            BuildState::Failed => "failed",
            BuildState::TimedOut => "timed_out",
            BuildState::Retrying => "retrying",
            BuildState::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// Final disposition of a build once no further transitions will happen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminalStatus {
    Succeeded,
    Failed,
    TimedOut,
    Cancelled,
}

/// Outcome reported by an executor for one dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BuildOutcome {
    Succeeded,
    Failed,
    TimedOut,
    Cancelled,
}

/// Mutable scheduling record that owns a request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildRecord {
    pub request: BuildRequest,
    pub state: BuildState,
    /// Effective priority; may be raised above the requested tier on retry.
    pub priority: Priority,
    /// Non-owning reference to the occupied slot.
    pub slot: Option<SlotId>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub terminal: Option<TerminalStatus>,
    pub retry_count: u32,
    pub infra_failures: u32,
    /// Incremented on every dispatch; outcomes carrying an older value are stale.
    pub dispatch_seq: u32,
    pub retry_not_before: Option<DateTime<Utc>>,
    pub cancel_requested: bool,
    pub analysis: Option<AnalysisResult>,
}

impl BuildRecord {
    pub fn new(request: BuildRequest) -> Self {
        let priority = request.priority.unwrap_or_default();
        Self {
            request,
            state: BuildState::Queued,
            priority,
            slot: None,
            started_at: None,
            ended_at: None,
            terminal: None,
            retry_count: 0,
            infra_failures: 0,
            dispatch_seq: 0,
            retry_not_before: None,
            cancel_requested: false,
            analysis: None,
        }
    }

    pub fn id(&self) -> BuildId {
        self.request.id
    }

    pub fn is_terminal(&self) -> bool {
        self.terminal.is_some()
    }

    /// Move to `next`. Moves outside the lifecycle leave the record as is.
    pub fn transition(&mut self, next: BuildState) -> Result<()> {
        if !self.state.can_transition_to(next) {
            return Err(Error::InvalidTransition {
                build: self.id().to_string(),
                from: self.state.to_string(),
                to: next.to_string(),
            });
        }
        self.state = next;
        Ok(())
    }

    /// Milliseconds spent running, if the build has started.
    pub fn duration_ms(&self) -> Option<u64> {
        let started = self.started_at?;
        let ended = self.ended_at.unwrap_or_else(Utc::now);
        Some((ended - started).num_milliseconds().max(0) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_priority_ordering_and_bump() {
        assert!(Priority::Critical > Priority::High);
        assert!(Priority::High > Priority::Normal);
        assert_eq!(Priority::Low.bump(), Priority::Normal);
        assert_eq!(Priority::Critical.bump(), Priority::Critical);
    }

    #[test]
    fn test_state_transitions() {
        assert!(BuildState::Queued.can_transition_to(BuildState::Allocated));
        assert!(BuildState::Failed.can_transition_to(BuildState::Retrying));
        assert!(BuildState::Retrying.can_transition_to(BuildState::Queued));
        assert!(!BuildState::Succeeded.can_transition_to(BuildState::Queued));
        assert!(!BuildState::Queued.can_transition_to(BuildState::Running));
    }

    #[test]
    fn test_record_transition_rejects_illegal_moves() {
        let mut record = BuildRecord::new(BuildRequest::unprioritized(
            SourceRef::default(),
            ResourceProfile::default(),
        ));
        assert_eq!(record.priority, Priority::Normal);

        assert!(matches!(
            record.transition(BuildState::Running),
            Err(Error::InvalidTransition { .. })
        ));
        assert_eq!(record.state, BuildState::Queued);

        record.transition(BuildState::Allocated).unwrap();
        record.transition(BuildState::Running).unwrap();
        record.transition(BuildState::Succeeded).unwrap();
        assert!(record.transition(BuildState::Queued).is_err());
        assert_eq!(record.state, BuildState::Succeeded);
    }

    #[test]
    fn test_new_record_is_queued() {
        let request = BuildRequest::new(
            SourceRef::default(),
            ResourceProfile::gpus(2).with_arch("gfx90a"),
            Priority::High,
        );
        let record = BuildRecord::new(request);
        assert_eq!(record.state, BuildState::Queued);
        assert_eq!(record.priority, Priority::High);
        assert!(!record.is_terminal());
        assert!(record.duration_ms().is_none());
    }

    #[test]
    fn test_profile_from_yaml_defaults() {
        let profile: ResourceProfile = serde_json::from_str(r#"{"gpu_arch":"gfx942"}"#).unwrap();
        assert_eq!(profile.gpu_count, 1);
        assert_eq!(profile.cpu_cores, 1);
        assert_eq!(profile.gpu_arch.as_deref(), Some("gfx942"));
    }
}
