//! Tier assignment for builds submitted without one.
//!
//! A request starts from a base score. The branch kind, change labels,
//! review state and triggering account adjust it, and the total maps onto a
//! [`Priority`] tier.

use kiln_core::build::{Priority, SourceRef};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

const BASE_SCORE: i32 = 50;
const MAIN_BRANCH: i32 = 100;
const HOTFIX_BRANCH: i32 = 90;
const RELEASE_BRANCH: i32 = 80;
const READY_FOR_REVIEW: i32 = 30;
const DRAFT: i32 = -20;
const BOT_TRIGGERED: i32 = -10;

const CRITICAL_SCORE: i32 = 150;
const HIGH_SCORE: i32 = 80;
const NORMAL_SCORE: i32 = 20;

/// One contribution to a priority score.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PriorityFactor {
    pub name: &'static str,
    pub delta: i32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PriorityAssessment {
    pub score: i32,
    pub tier: Priority,
    pub factors: Vec<PriorityFactor>,
}

/// Scoring rules for deriving a tier from a [`SourceRef`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriorityPolicy {
    #[serde(default = "default_main_branches")]
    pub main_branches: Vec<String>,
    /// Branch prefixes of release lines. Version tags such as `v6.1` also count.
    #[serde(default = "default_release_prefixes")]
    pub release_prefixes: Vec<String>,
    #[serde(default = "default_hotfix_prefixes")]
    pub hotfix_prefixes: Vec<String>,
    /// Boost per label substring. Only the largest matching boost applies.
    #[serde(default = "default_label_boosts")]
    pub label_boosts: BTreeMap<String, i32>,
    /// Substrings of `triggered_by` that mark automated dependency updates.
    #[serde(default = "default_bot_accounts")]
    pub bot_accounts: Vec<String>,
}

fn strings(values: &[&str]) -> Vec<String> {
    values.iter().map(|v| v.to_string()).collect()
}

fn default_main_branches() -> Vec<String> {
    strings(&["main", "master", "develop", "release"])
}

fn default_release_prefixes() -> Vec<String> {
    strings(&["release/", "release-"])
}

fn default_hotfix_prefixes() -> Vec<String> {
    strings(&["hotfix/", "hotfix-", "fix/"])
}

fn default_label_boosts() -> BTreeMap<String, i32> {
    [
        ("critical", 100),
        ("urgent", 80),
        ("high-priority", 60),
        ("quick-test", 40),
    ]
    .into_iter()
    .map(|(label, boost)| (label.to_string(), boost))
    .collect()
}

fn default_bot_accounts() -> Vec<String> {
    strings(&["dependabot", "renovate"])
}

impl Default for PriorityPolicy {
    fn default() -> Self {
        Self {
            main_branches: default_main_branches(),
            release_prefixes: default_release_prefixes(),
            hotfix_prefixes: default_hotfix_prefixes(),
            label_boosts: default_label_boosts(),
            bot_accounts: default_bot_accounts(),
        }
    }
}

impl PriorityPolicy {
    /// Score a source and map the score onto a tier.
    pub fn assess(&self, source: &SourceRef) -> PriorityAssessment {
        let branch = source
            .git_ref
            .strip_prefix("refs/heads/")
            .unwrap_or(&source.git_ref);
        let mut factors = Vec::new();
        let mut add = |name, delta| factors.push(PriorityFactor { name, delta });

        if self.main_branches.iter().any(|b| b == branch) {
            add("main_branch", MAIN_BRANCH);
        }
        if self.is_release(branch) {
            add("release_branch", RELEASE_BRANCH);
        }
        if self.hotfix_prefixes.iter().any(|p| branch.starts_with(p.as_str())) {
            add("hotfix_branch", HOTFIX_BRANCH);
        }
        if let Some(boost) = self.label_boost(&source.labels) {
            add("label", boost);
        }
        if source.ready_for_review {
            add("ready_for_review", READY_FOR_REVIEW);
        }
        if source.draft {
            add("draft", DRAFT);
        }
        if source
            .triggered_by
            .as_deref()
            .is_some_and(|who| self.is_bot(who))
        {
            add("dependency_bot", BOT_TRIGGERED);
        }

        let score = BASE_SCORE + factors.iter().map(|f| f.delta).sum::<i32>();
        PriorityAssessment {
            score,
            tier: tier_for(score),
            factors,
        }
    }

    fn is_release(&self, branch: &str) -> bool {
        let version_tag = branch
            .strip_prefix('v')
            .and_then(|rest| rest.chars().next())
            .is_some_and(|c| c.is_ascii_digit());
        version_tag
            || self
                .release_prefixes
                .iter()
                .any(|p| branch.starts_with(p.as_str()))
    }

    fn label_boost(&self, labels: &[String]) -> Option<i32> {
        labels
            .iter()
            .map(|label| label.to_lowercase())
            .flat_map(|label| {
                self.label_boosts
                    .iter()
                    .filter(move |(key, _)| label.contains(key.as_str()))
                    .map(|(_, boost)| *boost)
            })
            .max()
            .filter(|boost| *boost > 0)
    }

    fn is_bot(&self, who: &str) -> bool {
        let who = who.to_lowercase();
        self.bot_accounts
            .iter()
            .any(|bot| who.contains(&bot.to_lowercase()))
    }
}

pub fn tier_for(score: i32) -> Priority {
    if score >= CRITICAL_SCORE {
        Priority::Critical
    } else if score >= HIGH_SCORE {
        Priority::High
    } else if score >= NORMAL_SCORE {
        Priority::Normal
    } else {
        Priority::Low
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn source(git_ref: &str) -> SourceRef {
        SourceRef {
            repository: "rocm/kernels".to_string(),
            git_ref: git_ref.to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_branch_kinds() {
        let policy = PriorityPolicy::default();
        assert_eq!(policy.assess(&source("main")).tier, Priority::Critical);
        assert_eq!(policy.assess(&source("refs/heads/develop")).tier, Priority::Critical);
        assert_eq!(policy.assess(&source("hotfix/oom-guard")).score, 140);
        assert_eq!(policy.assess(&source("release/6.2")).tier, Priority::High);
        assert_eq!(policy.assess(&source("v6.1.2")).tier, Priority::High);
        assert_eq!(policy.assess(&source("very-long-feature")).tier, Priority::Normal);
        assert_eq!(policy.assess(&source("feature/gemm")).score, 50);
    }

    #[test]
    fn test_largest_label_boost_applies() {
        let policy = PriorityPolicy::default();
        let mut labelled = source("feature/gemm");
        labelled.labels = vec!["quick-test".to_string(), "URGENT-fix".to_string()];

        let assessment = policy.assess(&labelled);
        assert_eq!(assessment.score, 130);
        assert_eq!(assessment.tier, Priority::High);
        assert_eq!(
            assessment.factors,
            vec![PriorityFactor {
                name: "label",
                delta: 80
            }]
        );
    }

    #[test]
    fn test_review_state_and_bots() {
        let policy = PriorityPolicy::default();

        let mut ready = source("feature/gemm");
        ready.ready_for_review = true;
        assert_eq!(policy.assess(&ready).score, 80);
        assert_eq!(policy.assess(&ready).tier, Priority::High);

        let mut bump = source("dependabot/cargo/serde-1.0.200");
        bump.draft = true;
        bump.triggered_by = Some("Dependabot[bot]".to_string());
        let assessment = policy.assess(&bump);
        assert_eq!(assessment.score, 20);
        assert_eq!(assessment.tier, Priority::Normal);
        assert_eq!(assessment.factors.len(), 2);
    }

    #[test]
    fn test_score_thresholds() {
        assert_eq!(tier_for(150), Priority::Critical);
        assert_eq!(tier_for(149), Priority::High);
        assert_eq!(tier_for(80), Priority::High);
        assert_eq!(tier_for(79), Priority::Normal);
        assert_eq!(tier_for(20), Priority::Normal);
        assert_eq!(tier_for(19), Priority::Low);
    }

    #[test]
    fn test_policy_from_yaml() {
        let policy: PriorityPolicy =
            serde_yaml::from_str("main_branches: [trunk]\nlabel_boosts: {perf: 30}\n").unwrap();
        assert_eq!(policy.hotfix_prefixes, default_hotfix_prefixes());

        let mut labelled = source("trunk");
        labelled.labels = vec!["perf".to_string()];
        assert_eq!(policy.assess(&labelled).score, 180);
        assert_eq!(policy.assess(&source("main")).tier, Priority::Normal);
    }
}
