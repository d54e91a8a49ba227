//! Kiln failure triage.
//!
//! A failed build's log flows through the [`parser::LogParser`], each event is
//! matched against the shared [`corpus::SignatureCorpus`] by the
//! [`matcher::PatternMatcher`], and the [`inference::InferenceEngine`] ranks
//! root causes. [`workers::TriageWorkers`] run this off the scheduler's path.

pub mod config;
pub mod corpus;
pub mod inference;
pub mod matcher;
pub mod parser;
pub mod pipeline;
pub mod similarity;
pub mod workers;

pub use config::TriageConfig;
pub use corpus::{SignatureCorpus, template_key};
pub use inference::{CategoryPrior, Evidence, InferenceEngine};
pub use matcher::{Observation, PatternMatcher, SignatureMatch};
pub use parser::{LogParser, ParseRule, ParsedEvents, normalize};
pub use pipeline::TriagePipeline;
pub use workers::TriageWorkers;
