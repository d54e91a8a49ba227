//! Triage configuration.

use kiln_core::triage::FailureCategory;
use kiln_core::{Error, Result};
use serde::{Deserialize, Serialize};

/// Log parsing, matching and inference settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriageConfig {
    /// Minimum cosine similarity for a strong match on a differing template.
    #[serde(default = "default_similarity_threshold")]
    pub similarity_threshold: f32,
    /// Occurrences a signature needs before its confidence is uncapped.
    #[serde(default = "default_min_occurrences")]
    pub min_occurrences: u64,
    #[serde(default = "default_confidence_cap")]
    pub confidence_cap: f64,
    /// Lines covered by the fallback event when no rule fires.
    #[serde(default = "default_unknown_tail_lines")]
    pub unknown_tail_lines: usize,
    /// Order in which rule categories are tried against each line.
    #[serde(default = "default_category_order")]
    pub category_order: Vec<FailureCategory>,
    /// Maximum events extracted from a single log.
    #[serde(default = "default_max_events")]
    pub max_events: usize,
    /// Maximum ranked matches kept per event.
    #[serde(default = "default_max_candidates")]
    pub max_candidates: usize,
    /// Posterior at which later same-category events stop contributing.
    #[serde(default = "default_dominance_threshold")]
    pub dominance_threshold: f64,
    /// Likelihood floor for hypotheses an event does not support.
    #[serde(default = "default_likelihood_floor")]
    pub likelihood_floor: f64,
    /// Concurrent triage jobs.
    #[serde(default = "default_worker_count")]
    pub worker_count: usize,
    /// Attempts per corpus write before giving up on a conflict.
    #[serde(default = "default_persist_attempts")]
    pub persist_attempts: u32,
}

fn default_similarity_threshold() -> f32 {
    0.85
}

fn default_min_occurrences() -> u64 {
    3
}

fn default_confidence_cap() -> f64 {
    0.5
}

fn default_unknown_tail_lines() -> usize {
    20
}

fn default_category_order() -> Vec<FailureCategory> {
    FailureCategory::RECOGNIZED.to_vec()
}

fn default_max_events() -> usize {
    50
}

fn default_max_candidates() -> usize {
    5
}

fn default_dominance_threshold() -> f64 {
    0.6
}

fn default_likelihood_floor() -> f64 {
    0.01
}

fn default_worker_count() -> usize {
    4
}

fn default_persist_attempts() -> u32 {
    3
}

impl Default for TriageConfig {
    fn default() -> Self {
        Self {
            similarity_threshold: default_similarity_threshold(),
            min_occurrences: default_min_occurrences(),
            confidence_cap: default_confidence_cap(),
            unknown_tail_lines: default_unknown_tail_lines(),
            category_order: default_category_order(),
            max_events: default_max_events(),
            max_candidates: default_max_candidates(),
            dominance_threshold: default_dominance_threshold(),
            likelihood_floor: default_likelihood_floor(),
            worker_count: default_worker_count(),
            persist_attempts: default_persist_attempts(),
        }
    }
}

impl TriageConfig {
    pub fn with_similarity_threshold(mut self, threshold: f32) -> Self {
        self.similarity_threshold = threshold;
        self
    }

    pub fn with_min_occurrences(mut self, count: u64) -> Self {
        self.min_occurrences = count;
        self
    }

    pub fn with_category_order(mut self, order: Vec<FailureCategory>) -> Self {
        self.category_order = order;
        self
    }

    pub fn with_dominance_threshold(mut self, threshold: f64) -> Self {
        self.dominance_threshold = threshold;
        self
    }

    pub fn with_max_events(mut self, max: usize) -> Self {
        self.max_events = max;
        self
    }

    pub fn with_unknown_tail_lines(mut self, lines: usize) -> Self {
        self.unknown_tail_lines = lines;
        self
    }

    pub fn with_worker_count(mut self, workers: usize) -> Self {
        self.worker_count = workers;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if !(self.similarity_threshold > 0.0 && self.similarity_threshold <= 1.0) {
            return Err(Error::Config(format!(
                "triage.similarity_threshold must be in (0, 1], got {}",
                self.similarity_threshold
            )));
        }
        for (name, value) in [
            ("confidence_cap", self.confidence_cap),
            ("dominance_threshold", self.dominance_threshold),
        ] {
            if !(value > 0.0 && value <= 1.0) {
                return Err(Error::Config(format!(
                    "triage.{name} must be in (0, 1], got {value}"
                )));
            }
        }
        if !(self.likelihood_floor > 0.0 && self.likelihood_floor < 1.0) {
            return Err(Error::Config(
                "triage.likelihood_floor must be in (0, 1)".to_string(),
            ));
        }
        if self.category_order.is_empty() {
            return Err(Error::Config(
                "triage.category_order must name at least one category".to_string(),
            ));
        }
        if self.category_order.contains(&FailureCategory::Unknown) {
            return Err(Error::Config(
                "triage.category_order cannot contain unknown".to_string(),
            ));
        }
        for (i, category) in self.category_order.iter().enumerate() {
            if self.category_order[..i].contains(category) {
                return Err(Error::Config(format!(
                    "triage.category_order lists {category} twice"
                )));
            }
        }
        if self.max_events == 0 || self.max_candidates == 0 {
            return Err(Error::Config(
                "triage.max_events and triage.max_candidates must be positive".to_string(),
            ));
        }
        if self.worker_count == 0 {
            return Err(Error::Config("triage.worker_count must be positive".to_string()));
        }
        if self.persist_attempts == 0 {
            return Err(Error::Config(
                "triage.persist_attempts must be positive".to_string(),
            ));
        }
        Ok(())
    }
}
