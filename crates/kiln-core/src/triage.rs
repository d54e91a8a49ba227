//! Failure triage types: parsed error events, corpus signatures and analysis results.

use crate::ids::{BuildId, SignatureId, TemplateKey};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Failure category assigned by the log parser.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureCategory {
    Compilation,
    Link,
    Runtime,
    Config,
    Test,
    Unknown,
}

impl FailureCategory {
    /// Recognizable categories in default matcher priority order.
    pub const RECOGNIZED: [FailureCategory; 5] = [
        FailureCategory::Compilation,
        FailureCategory::Link,
        FailureCategory::Runtime,
        FailureCategory::Config,
        FailureCategory::Test,
    ];

    /// Every category including `Unknown`.
    pub const ALL: [FailureCategory; 6] = [
        FailureCategory::Compilation,
        FailureCategory::Link,
        FailureCategory::Runtime,
        FailureCategory::Config,
        FailureCategory::Test,
        FailureCategory::Unknown,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            FailureCategory::Compilation => "compilation",
            FailureCategory::Link => "link",
            FailureCategory::Runtime => "runtime",
            FailureCategory::Config => "config",
            FailureCategory::Test => "test",
            FailureCategory::Unknown => "unknown",
        }
    }
}

impl fmt::Display for FailureCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FailureCategory {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "compilation" | "compile" => Ok(FailureCategory::Compilation),
            "link" | "linker" => Ok(FailureCategory::Link),
            "runtime" => Ok(FailureCategory::Runtime),
            "config" | "configuration" => Ok(FailureCategory::Config),
            "test" => Ok(FailureCategory::Test),
            "unknown" => Ok(FailureCategory::Unknown),
            other => Err(format!("unknown failure category: {other}")),
        }
    }
}

/// Zero-based, end-exclusive range of log lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineRange {
    pub start: usize,
    pub end: usize,
}

impl LineRange {
    pub fn single(line: usize) -> Self {
        Self {
            start: line,
            end: line + 1,
        }
    }

    pub fn len(&self) -> usize {
        self.end.saturating_sub(self.start)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Structured unit extracted from a build log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorEvent {
    pub lines: LineRange,
    pub category: FailureCategory,
    /// Name of the parser rule that produced the event.
    pub rule: String,
    pub raw_text: String,
    /// Normalized token template with volatile tokens removed.
    pub template: String,
    /// Whether the rule marks this failure as environmental rather than a code defect.
    pub transient: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embedding: Option<Vec<f32>>,
}

impl ErrorEvent {
    pub fn with_embedding(mut self, embedding: Option<Vec<f32>>) -> Self {
        self.embedding = embedding;
        self
    }
}

/// A remediation associated with a signature and its observed track record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Fix {
    pub description: String,
    #[serde(default)]
    pub applied: u64,
    #[serde(default)]
    pub succeeded: u64,
}

impl Fix {
    pub fn new(description: impl Into<String>) -> Self {
        Self {
            description: description.into(),
            applied: 0,
            succeeded: 0,
        }
    }

    pub fn with_history(mut self, applied: u64, succeeded: u64) -> Self {
        self.applied = applied;
        self.succeeded = succeeded.min(applied);
        self
    }

    /// Observed success rate; zero until the fix has been applied.
    pub fn success_rate(&self) -> f64 {
        if self.applied == 0 {
            0.0
        } else {
            self.succeeded as f64 / self.applied as f64
        }
    }
}

/// A stored representative of a previously seen failure pattern.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureSignature {
    pub id: SignatureId,
    pub key: TemplateKey,
    pub category: FailureCategory,
    pub template: String,
    /// Human-readable cause label.
    pub label: String,
    #[serde(default)]
    pub centroid: Option<Vec<f32>>,
    /// Number of embeddings folded into the centroid.
    #[serde(default)]
    pub embedded_count: u64,
    pub occurrence_count: u64,
    #[serde(default)]
    pub fixes: Vec<Fix>,
    #[serde(default)]
    pub transient: bool,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

impl FailureSignature {
    pub fn new(
        key: TemplateKey,
        category: FailureCategory,
        template: impl Into<String>,
        label: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: SignatureId::new(),
            key,
            category,
            template: template.into(),
            label: label.into(),
            centroid: None,
            embedded_count: 0,
            occurrence_count: 0,
            fixes: Vec::new(),
            transient: false,
            first_seen: now,
            last_seen: now,
        }
    }

    pub fn with_fix(mut self, fix: Fix) -> Self {
        self.fixes.push(fix);
        self
    }

    pub fn with_occurrences(mut self, count: u64) -> Self {
        self.occurrence_count = count;
        self
    }

    pub fn with_transient(mut self, transient: bool) -> Self {
        self.transient = transient;
        self
    }

    pub fn with_centroid(mut self, centroid: Vec<f32>) -> Self {
        self.centroid = Some(centroid);
        self.embedded_count = self.embedded_count.max(1);
        self
    }

    /// Fold one matched event into the signature.
    pub fn record_occurrence(&mut self, embedding: Option<&[f32]>) {
        self.occurrence_count += 1;
        self.last_seen = Utc::now();
        if let Some(vector) = embedding {
            self.fold_embedding(vector);
        }
    }

    /// Incremental mean of the centroid over embedded occurrences.
    fn fold_embedding(&mut self, vector: &[f32]) {
        match &mut self.centroid {
            Some(centroid) if centroid.len() == vector.len() => {
                self.embedded_count += 1;
                let n = self.embedded_count as f32;
                for (c, v) in centroid.iter_mut().zip(vector) {
                    *c += (v - *c) / n;
                }
            }
            _ => {
                self.centroid = Some(vector.to_vec());
                self.embedded_count = 1;
            }
        }
    }

    /// Merge another record of the same template into this one.
    pub fn merge(&mut self, other: FailureSignature) {
        self.occurrence_count += other.occurrence_count;
        self.first_seen = self.first_seen.min(other.first_seen);
        self.last_seen = self.last_seen.max(other.last_seen);
        self.transient |= other.transient;
        if let Some(theirs) = other.centroid {
            match &mut self.centroid {
                Some(ours) if ours.len() == theirs.len() => {
                    let total = (self.embedded_count + other.embedded_count).max(1) as f32;
                    let w_ours = self.embedded_count as f32 / total;
                    let w_theirs = other.embedded_count as f32 / total;
                    for (a, b) in ours.iter_mut().zip(&theirs) {
                        *a = *a * w_ours + b * w_theirs;
                    }
                    self.embedded_count += other.embedded_count;
                }
                _ => {
                    self.centroid = Some(theirs);
                    self.embedded_count = other.embedded_count;
                }
            }
        }
        for fix in other.fixes {
            match self
                .fixes
                .iter_mut()
                .find(|f| f.description == fix.description)
            {
                Some(existing) => {
                    existing.applied += fix.applied;
                    existing.succeeded += fix.succeeded;
                }
                None => self.fixes.push(fix),
            }
        }
    }

    /// Laplace-smoothed aggregate success rate of the signature's fixes.
    pub fn fix_success_rate(&self) -> f64 {
        let applied: u64 = self.fixes.iter().map(|f| f.applied).sum();
        let succeeded: u64 = self.fixes.iter().map(|f| f.succeeded).sum();
        (succeeded as f64 + 1.0) / (applied as f64 + 2.0)
    }

    /// Fixes ordered by observed success rate, best first.
    pub fn ranked_fixes(&self) -> Vec<&Fix> {
        let mut fixes: Vec<&Fix> = self.fixes.iter().collect();
        fixes.sort_by(|a, b| {
            b.success_rate()
                .total_cmp(&a.success_rate())
                .then_with(|| b.succeeded.cmp(&a.succeeded))
                .then_with(|| a.description.cmp(&b.description))
        });
        fixes
    }
}

/// A candidate root cause with its prior and posterior belief.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CauseHypothesis {
    pub category: FailureCategory,
    pub cause: String,
    pub signature: Option<SignatureId>,
    pub transient: bool,
    pub prior: f64,
    pub posterior: f64,
}

/// A recommended fix inherited from the top-matching signature.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Recommendation {
    pub description: String,
    pub success_rate: f64,
    pub applied: u64,
}

/// Ranked root-cause analysis attached to a failed build.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisResult {
    pub build_id: BuildId,
    /// Hypotheses ordered by posterior, highest first.
    pub hypotheses: Vec<CauseHypothesis>,
    pub category: FailureCategory,
    pub confidence: f64,
    /// Confidence was capped because the top signature lacks history.
    pub evidence_capped: bool,
    pub top_signature: Option<SignatureId>,
    pub recommendations: Vec<Recommendation>,
    pub events_analyzed: usize,
    pub analyzed_at: DateTime<Utc>,
}

impl AnalysisResult {
    /// Result used when nothing could be matched or triage failed.
    pub fn unknown(build_id: BuildId, events_analyzed: usize) -> Self {
        Self {
            build_id,
            hypotheses: vec![CauseHypothesis {
                category: FailureCategory::Unknown,
                cause: "No recognizable failure pattern".to_string(),
                signature: None,
                transient: false,
                prior: 1.0,
                posterior: 1.0,
            }],
            category: FailureCategory::Unknown,
            confidence: 0.0,
            evidence_capped: false,
            top_signature: None,
            recommendations: Vec::new(),
            events_analyzed,
            analyzed_at: Utc::now(),
        }
    }

    pub fn top(&self) -> Option<&CauseHypothesis> {
        self.hypotheses.first()
    }

    /// Whether the top cause is environmental and worth retrying.
    pub fn is_transient(&self) -> bool {
        self.top().is_some_and(|h| h.transient)
    }

    pub fn is_known_fixable(&self) -> bool {
        !self.recommendations.is_empty()
    }

    pub fn posterior_sum(&self) -> f64 {
        self.hypotheses.iter().map(|h| h.posterior).sum()
    }
}

/// Work item asking the triage engine to analyze a failed dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TriageRequest {
    pub build_id: BuildId,
    pub dispatch_seq: u32,
}

/// Completed triage for one dispatch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriageReport {
    pub build_id: BuildId,
    pub dispatch_seq: u32,
    pub result: AnalysisResult,
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn signature() -> FailureSignature {
        FailureSignature::new(
            TemplateKey::new("k1"),
            FailureCategory::Link,
            "undefined reference to `hip*`",
            "Missing HIP runtime library",
        )
    }

    #[test]
    fn test_category_parse() {
        assert_eq!("linker".parse::<FailureCategory>(), Ok(FailureCategory::Link));
        assert_eq!(FailureCategory::Config.to_string(), "config");
        assert!("nonsense".parse::<FailureCategory>().is_err());
    }

    #[test]
    fn test_centroid_incremental_mean() {
        let mut sig = signature();
        sig.record_occurrence(Some(&[1.0, 0.0]));
        sig.record_occurrence(Some(&[0.0, 1.0]));
        sig.record_occurrence(None);
        assert_eq!(sig.occurrence_count, 3);
        assert_eq!(sig.embedded_count, 2);
        assert_eq!(sig.centroid, Some(vec![0.5, 0.5]));
    }

    #[test]
    fn test_ranked_fixes() {
        let sig = signature()
            .with_fix(Fix::new("pin rocm 6.0").with_history(10, 3))
            .with_fix(Fix::new("link libamdhip64").with_history(10, 9))
            .with_fix(Fix::new("untested"));
        let ranked: Vec<_> = sig.ranked_fixes().iter().map(|f| f.description.as_str()).collect();
        assert_eq!(ranked, vec!["link libamdhip64", "pin rocm 6.0", "untested"]);
    }

    #[test]
    fn test_fix_success_rate_smoothing() {
        assert_eq!(signature().fix_success_rate(), 0.5);
        let sig = signature().with_fix(Fix::new("a").with_history(8, 8));
        assert_eq!(sig.fix_success_rate(), 0.9);
    }

    #[test]
    fn test_merge_sums_counts_and_fixes() {
        let mut a = signature().with_occurrences(2).with_fix(Fix::new("x").with_history(2, 1));
        let b = signature().with_occurrences(3).with_fix(Fix::new("x").with_history(1, 1));
        a.merge(b);
        assert_eq!(a.occurrence_count, 5);
        assert_eq!(a.fixes.len(), 1);
        assert_eq!(a.fixes[0].applied, 3);
        assert_eq!(a.fixes[0].succeeded, 2);
    }

    #[test]
    fn test_unknown_result() {
        let result = AnalysisResult::unknown(BuildId::new(), 1);
        assert_eq!(result.category, FailureCategory::Unknown);
        assert_eq!(result.confidence, 0.0);
        assert!(result.recommendations.is_empty());
        assert!((result.posterior_sum() - 1.0).abs() < 1e-9);
        assert!(!result.is_transient());
    }
}
