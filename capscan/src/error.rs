//! Error taxonomy
//!
//! Only [`CapabilityError`] crosses the engine boundary. Per-shape failures
//! are [`AttemptError`] values carried inside invocation outcomes and folded
//! into the aggregate when every candidate is exhausted.

use crate::host::HostError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CapabilityError {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("no candidates found for capability '{query}' ({diagnostics})")]
    NoCandidatesFound { query: String, diagnostics: String },

    #[error(
        "all {tried} candidate(s) for capability '{query}' exhausted: [{}] ({diagnostics})",
        .failures.join("; ")
    )]
    AllCandidatesExhausted {
        query: String,
        tried: usize,
        /// Short per-candidate messages, bounded to the first few.
        failures: Vec<String>,
        diagnostics: String,
    },

    #[error("resolve re-entered while resolving '{0}'")]
    ReentrantResolve(String),

    #[error("failed to stage payload: {0}")]
    Staging(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("invalid host fixture: {0}")]
    Fixture(String),
}

impl CapabilityError {
    /// Notice safe to show to an end user. Never names candidates or scores.
    pub fn user_message(&self) -> String {
        match self {
            CapabilityError::InvalidInput(reason) => reason.clone(),
            CapabilityError::NoCandidatesFound { .. } => {
                "This action isn't available in the current session.".to_string()
            }
            CapabilityError::AllCandidatesExhausted { .. } => {
                "The action could not be completed. Please try again.".to_string()
            }
            CapabilityError::Staging(_) => "The file could not be prepared.".to_string(),
            CapabilityError::ReentrantResolve(_)
            | CapabilityError::Config(_)
            | CapabilityError::Fixture(_) => {
                "Something went wrong. Please try again.".to_string()
            }
        }
    }
}

/// Why one call shape did not take effect.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum AttemptError {
    #[error("{shape}: threw: {error}")]
    Threw { shape: String, error: HostError },

    #[error("{shape}: rejected: {error}")]
    Rejected { shape: String, error: HostError },

    #[error("{shape}: no return within {after_ms}ms")]
    SettleTimeout { shape: String, after_ms: u64 },

    #[error("{shape}: not confirmed within {after_ms}ms")]
    ConfirmationTimeout { shape: String, after_ms: u64 },

    #[error("no call shapes to try")]
    NoShapes,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_aggregate_message_lists_failures() {
        let err = CapabilityError::AllCandidatesExhausted {
            query: "file-queue".into(),
            tried: 2,
            failures: vec!["addFile: threw: nope".into(), "promptToUpload: rejected".into()],
            diagnostics: "known=1".into(),
        };
        let text = err.to_string();
        assert!(text.contains("all 2 candidate(s)"));
        assert!(text.contains("addFile: threw: nope; promptToUpload: rejected"));
        assert!(!err.user_message().contains("addFile"));
    }
}
