//! Scheduler and pool configuration.

use crate::priority::PriorityPolicy;
use kiln_core::slot::SlotSpec;
use kiln_core::{Error, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Scheduler configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Maximum number of builds allocated or running at once.
    #[serde(default = "default_concurrency_ceiling")]
    pub concurrency_ceiling: usize,
    /// Watchdog budget per running build, in seconds.
    #[serde(default = "default_build_timeout")]
    pub build_timeout_secs: u64,
    /// Maximum retries of transient failures per build.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Delay before the first retry, doubled on each subsequent one.
    #[serde(default = "default_retry_base_delay")]
    pub retry_base_delay_secs: u64,
    /// Upper bound on the retry delay.
    #[serde(default = "default_retry_max_delay")]
    pub retry_max_delay_secs: u64,
    /// Consecutive executor start failures before admission halts.
    #[serde(default = "default_max_infra_failures")]
    pub max_consecutive_infra_failures: u32,
    /// Consecutive timeouts on one slot before it is quarantined.
    #[serde(default = "default_quarantine_after")]
    pub quarantine_after_timeouts: u32,
    #[serde(default = "default_tick_interval")]
    pub tick_interval_ms: u64,
    #[serde(default = "default_watchdog_interval")]
    pub watchdog_interval_secs: u64,
    /// Raise the priority of a retried build whose failure has a known fix.
    #[serde(default = "default_true")]
    pub bump_priority_on_known_fix: bool,
    /// Rules deriving a tier for builds submitted without one.
    #[serde(default)]
    pub priority: PriorityPolicy,
}

fn default_concurrency_ceiling() -> usize {
    8
}

fn default_build_timeout() -> u64 {
    7200
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_base_delay() -> u64 {
    30
}

fn default_retry_max_delay() -> u64 {
    600
}

fn default_max_infra_failures() -> u32 {
    5
}

fn default_quarantine_after() -> u32 {
    3
}

fn default_tick_interval() -> u64 {
    1000
}

fn default_watchdog_interval() -> u64 {
    5
}

fn default_true() -> bool {
    true
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            concurrency_ceiling: default_concurrency_ceiling(),
            build_timeout_secs: default_build_timeout(),
            max_retries: default_max_retries(),
            retry_base_delay_secs: default_retry_base_delay(),
            retry_max_delay_secs: default_retry_max_delay(),
            max_consecutive_infra_failures: default_max_infra_failures(),
            quarantine_after_timeouts: default_quarantine_after(),
            tick_interval_ms: default_tick_interval(),
            watchdog_interval_secs: default_watchdog_interval(),
            bump_priority_on_known_fix: default_true(),
            priority: PriorityPolicy::default(),
        }
    }
}

impl SchedulerConfig {
    pub fn with_concurrency_ceiling(mut self, ceiling: usize) -> Self {
        self.concurrency_ceiling = ceiling;
        self
    }

    pub fn with_build_timeout(mut self, secs: u64) -> Self {
        self.build_timeout_secs = secs;
        self
    }

    pub fn with_max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    pub fn with_retry_delays(mut self, base_secs: u64, max_secs: u64) -> Self {
        self.retry_base_delay_secs = base_secs;
        self.retry_max_delay_secs = max_secs;
        self
    }

    pub fn with_max_consecutive_infra_failures(mut self, failures: u32) -> Self {
        self.max_consecutive_infra_failures = failures;
        self
    }

    pub fn with_tick_interval(mut self, millis: u64) -> Self {
        self.tick_interval_ms = millis;
        self
    }

    pub fn with_watchdog_interval(mut self, secs: u64) -> Self {
        self.watchdog_interval_secs = secs;
        self
    }

    pub fn with_priority_bump(mut self, enabled: bool) -> Self {
        self.bump_priority_on_known_fix = enabled;
        self
    }

    pub fn with_priority_policy(mut self, policy: PriorityPolicy) -> Self {
        self.priority = policy;
        self
    }

    pub fn build_timeout(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.build_timeout_secs.min(i64::MAX as u64) as i64)
    }

    /// Delay before retry number `attempt` (1-based).
    pub fn retry_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(32);
        let secs = self
            .retry_base_delay_secs
            .saturating_mul(1u64 << exponent)
            .min(self.retry_max_delay_secs);
        Duration::from_secs(secs)
    }

    pub fn validate(&self) -> Result<()> {
        if self.concurrency_ceiling == 0 {
            return Err(Error::Config(
                "scheduler.concurrency_ceiling must be at least 1".to_string(),
            ));
        }
        if self.build_timeout_secs == 0 {
            return Err(Error::Config(
                "scheduler.build_timeout_secs must be positive".to_string(),
            ));
        }
        if self.retry_max_delay_secs < self.retry_base_delay_secs {
            return Err(Error::Config(
                "scheduler.retry_max_delay_secs must not be below retry_base_delay_secs"
                    .to_string(),
            ));
        }
        if self.max_consecutive_infra_failures == 0 || self.quarantine_after_timeouts == 0 {
            return Err(Error::Config(
                "scheduler failure thresholds must be at least 1".to_string(),
            ));
        }
        if self.tick_interval_ms == 0 || self.watchdog_interval_secs == 0 {
            return Err(Error::Config(
                "scheduler intervals must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// Declared execution slots.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PoolConfig {
    #[serde(default)]
    pub slots: Vec<SlotSpec>,
}

impl PoolConfig {
    pub fn with_slot(mut self, slot: SlotSpec) -> Self {
        self.slots.push(slot);
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.slots.is_empty() {
            return Err(Error::Config("pool.slots must declare at least one slot".to_string()));
        }
        for slot in &self.slots {
            if slot.node.trim().is_empty() {
                return Err(Error::Config("pool slot node name must not be empty".to_string()));
            }
        }
        Ok(())
    }
}
