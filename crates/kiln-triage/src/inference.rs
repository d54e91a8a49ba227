//! Bayesian root-cause inference over matched signatures.

use crate::config::TriageConfig;
use crate::corpus::SignatureCorpus;
use crate::matcher::Observation;
use chrono::Utc;
use kiln_core::ids::{BuildId, SignatureId};
use kiln_core::triage::{
    AnalysisResult, CauseHypothesis, ErrorEvent, FailureCategory, FailureSignature,
    Recommendation,
};
use std::collections::HashMap;
use tracing::debug;

const RESIDUAL_CAUSE: &str = "Unrecognized failure";

/// One parsed event with its corpus observation.
#[derive(Debug, Clone)]
pub struct Evidence {
    pub event: ErrorEvent,
    pub observation: Observation,
}

/// Laplace-smoothed prior over failure categories.
#[derive(Debug, Clone)]
pub struct CategoryPrior {
    probabilities: HashMap<FailureCategory, f64>,
}

impl CategoryPrior {
    pub fn from_counts(counts: &HashMap<FailureCategory, u64>) -> Self {
        let total: u64 = counts.values().sum();
        let denom = total as f64 + FailureCategory::ALL.len() as f64;
        let probabilities = FailureCategory::ALL
            .iter()
            .map(|c| {
                let count = counts.get(c).copied().unwrap_or(0) as f64;
                (*c, (count + 1.0) / denom)
            })
            .collect();
        Self { probabilities }
    }

    pub fn probability(&self, category: FailureCategory) -> f64 {
        self.probabilities.get(&category).copied().unwrap_or(0.0)
    }
}

struct Hypothesis {
    category: FailureCategory,
    cause: String,
    signature: Option<FailureSignature>,
    transient: bool,
    prior: f64,
    posterior: f64,
}

impl Hypothesis {
    fn signature_id(&self) -> Option<SignatureId> {
        self.signature.as_ref().map(|s| s.id)
    }
}

pub struct InferenceEngine {
    min_occurrences: u64,
    confidence_cap: f64,
    dominance_threshold: f64,
    likelihood_floor: f64,
}

impl InferenceEngine {
    pub fn new(config: &TriageConfig) -> Self {
        Self {
            min_occurrences: config.min_occurrences,
            confidence_cap: config.confidence_cap,
            dominance_threshold: config.dominance_threshold,
            likelihood_floor: config.likelihood_floor,
        }
    }

    /// Rank root-cause hypotheses for a build from its events in log order.
    pub fn infer(
        &self,
        build_id: BuildId,
        corpus: &SignatureCorpus,
        evidence: &[Evidence],
    ) -> AnalysisResult {
        let supported: Vec<(&ErrorEvent, &FailureSignature, f64)> = evidence
            .iter()
            .filter_map(|e| {
                e.observation
                    .best()
                    .map(|best| (&e.event, &best.signature, best.score))
            })
            .collect();
        if supported.is_empty() {
            return AnalysisResult::unknown(build_id, evidence.len());
        }

        let prior = CategoryPrior::from_counts(&corpus.category_counts());
        let mut hypotheses = self.initial_hypotheses(&supported, &prior);

        let mut applied = 0usize;
        for (event, signature, score) in &supported {
            if applied > 0
                && let Some(top) = leader(&hypotheses)
                && top.posterior >= self.dominance_threshold
                && top.category == event.category
            {
                debug!(
                    build_id = %build_id,
                    rule = %event.rule,
                    "Skipping event already explained by dominant hypothesis"
                );
                continue;
            }

            let likelihood = (score * signature.fix_success_rate()).clamp(self.likelihood_floor, 1.0);
            let otherwise = (1.0 - likelihood).max(self.likelihood_floor);
            for h in hypotheses.iter_mut() {
                h.posterior *= if h.signature_id() == Some(signature.id) {
                    likelihood
                } else {
                    otherwise
                };
            }
            normalize(&mut hypotheses);
            applied += 1;
        }

        hypotheses.sort_by(|a, b| {
            b.posterior
                .total_cmp(&a.posterior)
                .then_with(|| b.prior.total_cmp(&a.prior))
                .then_with(|| a.cause.cmp(&b.cause))
        });

        self.conclude(build_id, evidence.len(), hypotheses)
    }

    fn initial_hypotheses(
        &self,
        supported: &[(&ErrorEvent, &FailureSignature, f64)],
        prior: &CategoryPrior,
    ) -> Vec<Hypothesis> {
        let mut signatures: Vec<&FailureSignature> = Vec::new();
        for (_, signature, _) in supported {
            if !signatures.iter().any(|s| s.id == signature.id) {
                signatures.push(signature);
            }
        }

        let mut per_category: HashMap<FailureCategory, usize> = HashMap::new();
        for signature in &signatures {
            *per_category.entry(signature.category).or_insert(0) += 1;
        }

        let mut hypotheses: Vec<Hypothesis> = signatures
            .into_iter()
            .map(|signature| {
                let share = per_category.get(&signature.category).copied().unwrap_or(1) as f64;
                Hypothesis {
                    category: signature.category,
                    cause: signature.label.clone(),
                    signature: Some(signature.clone()),
                    transient: signature.transient,
                    prior: prior.probability(signature.category) / share,
                    posterior: 0.0,
                }
            })
            .collect();
        hypotheses.push(Hypothesis {
            category: FailureCategory::Unknown,
            cause: RESIDUAL_CAUSE.to_string(),
            signature: None,
            transient: false,
            prior: prior.probability(FailureCategory::Unknown),
            posterior: 0.0,
        });

        let total: f64 = hypotheses.iter().map(|h| h.prior).sum();
        for h in hypotheses.iter_mut() {
            h.prior /= total;
            h.posterior = h.prior;
        }
        hypotheses
    }

    fn conclude(
        &self,
        build_id: BuildId,
        events_analyzed: usize,
        hypotheses: Vec<Hypothesis>,
    ) -> AnalysisResult {
        let top_signature = hypotheses.first().and_then(|h| h.signature.clone());

        let (category, confidence, evidence_capped, recommendations) = match &top_signature {
            Some(signature) => {
                let posterior = hypotheses.first().map_or(0.0, |h| h.posterior);
                let capped = signature.occurrence_count < self.min_occurrences;
                let confidence = if capped {
                    posterior.min(self.confidence_cap)
                } else {
                    posterior
                };
                let recommendations = signature
                    .ranked_fixes()
                    .into_iter()
                    .map(|fix| Recommendation {
                        description: fix.description.clone(),
                        success_rate: fix.success_rate(),
                        applied: fix.applied,
                    })
                    .collect();
                (signature.category, confidence, capped, recommendations)
            }
            None => (FailureCategory::Unknown, 0.0, false, Vec::new()),
        };

        AnalysisResult {
            build_id,
            hypotheses: hypotheses
                .into_iter()
                .map(|h| CauseHypothesis {
                    signature: h.signature_id(),
                    category: h.category,
                    cause: h.cause,
                    transient: h.transient,
                    prior: h.prior,
                    posterior: h.posterior,
                })
                .collect(),
            category,
            confidence,
            evidence_capped,
            top_signature: top_signature.map(|s| s.id),
            recommendations,
            events_analyzed,
            analyzed_at: Utc::now(),
        }
    }
}

fn leader(hypotheses: &[Hypothesis]) -> Option<&Hypothesis> {
    hypotheses
        .iter()
        .max_by(|a, b| a.posterior.total_cmp(&b.posterior))
}

fn normalize(hypotheses: &mut [Hypothesis]) {
    let total: f64 = hypotheses.iter().map(|h| h.posterior).sum();
    if total > 0.0 {
        for h in hypotheses.iter_mut() {
            h.posterior /= total;
        }
    }
}
