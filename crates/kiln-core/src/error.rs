//! Error types for Kiln.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    // Resource errors
    #[error("No slot satisfies the requested profile: {0}")]
    ResourceUnavailable(String),

    #[error("Slot not found: {0}")]
    SlotNotFound(String),

    #[error("Slot {slot} is not occupied by build {build}")]
    SlotOccupantMismatch { slot: String, build: String },

    // Build lifecycle errors
    #[error("Build not found: {0}")]
    BuildNotFound(String),

    #[error("Invalid transition for build {build}: {from} -> {to}")]
    InvalidTransition {
        build: String,
        from: String,
        to: String,
    },

    #[error("Executor failed to start build: {0}")]
    ExecutorStartFailure(String),

    #[error("Build timed out after {seconds} seconds")]
    BuildTimeout { seconds: u64 },

    #[error("Admission halted after {failures} consecutive executor start failures")]
    AdmissionHalted { failures: u32 },

    // Triage errors
    #[error("No failure pattern recognized in log")]
    ParseNoMatch,

    #[error("Signature not found: {0}")]
    SignatureNotFound(String),

    #[error("Embedding unavailable: {0}")]
    EmbeddingUnavailable(String),

    #[error("Corpus write conflict on {key}: {message}")]
    CorpusWriteConflict { key: String, message: String },

    // Infrastructure errors
    #[error("Log store error: {0}")]
    LogStore(String),

    #[error("Corpus store error: {0}")]
    CorpusStore(String),

    #[error("Event bus error: {0}")]
    EventBus(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    // Generic
    #[error("Internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Whether the caller can recover by requeueing or retrying the operation.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Error::ResourceUnavailable(_)
                | Error::ExecutorStartFailure(_)
                | Error::EmbeddingUnavailable(_)
                | Error::CorpusWriteConflict { .. }
                | Error::ParseNoMatch
        )
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recoverable_kinds() {
        assert!(Error::ResourceUnavailable("gpu".into()).is_recoverable());
        assert!(
            Error::CorpusWriteConflict {
                key: "k".into(),
                message: "busy".into()
            }
            .is_recoverable()
        );
        assert!(!Error::AdmissionHalted { failures: 5 }.is_recoverable());
        assert!(!Error::BuildTimeout { seconds: 10 }.is_recoverable());
    }

    #[test]
    fn test_display() {
        let err = Error::AdmissionHalted { failures: 3 };
        assert_eq!(
            err.to_string(),
            "Admission halted after 3 consecutive executor start failures"
        );
    }
}
