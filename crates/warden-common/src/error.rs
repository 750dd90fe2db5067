//! Error types for the warden core

use crate::verdict::{Decision, Verdict};
use thiserror::Error;

/// Warden error type
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WardenError {
    /// The caller cancelled the call
    #[error("call cancelled")]
    Cancelled,

    /// The call did not finish before its deadline
    #[error("deadline exceeded")]
    DeadlineExceeded,

    /// The transport to a plugin failed or closed
    #[error("transport error: {0}")]
    Transport(String),

    /// A plugin sent something that does not follow the protocol
    #[error("protocol error: {0}")]
    Protocol(String),

    /// A plugin handler returned an error
    #[error("plugin {plugin} returned an error: {message}")]
    Remote {
        /// Plugin name
        plugin: String,
        /// Error message from the plugin
        message: String,
    },

    /// The capability was not advertised at handshake
    #[error("capability {0} is not implemented")]
    Unimplemented(String),

    /// A chained decider returned `Failed` without an error
    #[error("chained decider at index {index} returned verdict failed")]
    DeciderFailed {
        /// Position in the chain
        index: usize,
    },

    /// Own executable path could not be determined
    #[error("failed to get executable path: {0}")]
    Identity(String),

    /// A terminal verdict would be overwritten outside re-evaluation
    #[error("connection {0} already has a final verdict")]
    VerdictFinal(String),

    /// Inspector failure
    #[error("inspector {name}: {message}")]
    Inspector {
        /// Inspector name
        name: String,
        /// Failure description
        message: String,
    },

    /// Configuration error
    #[error("config error: {0}")]
    Config(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(String),
}

impl WardenError {
    /// Whether the error comes from cancellation or a deadline
    pub fn is_cancellation(&self) -> bool {
        matches!(self, Self::Cancelled | Self::DeadlineExceeded)
    }

    /// Verdict that accompanies this error on a decide call
    ///
    /// Cancellation is classified as `Failed`, every other error leaves the
    /// connection `Undeterminable`.
    pub fn verdict_hint(&self) -> Verdict {
        if self.is_cancellation() {
            Verdict::Failed
        } else {
            Verdict::Undeterminable
        }
    }
}

impl From<std::io::Error> for WardenError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

/// Result type for warden
pub type WardenResult<T> = Result<T, WardenError>;

/// A decide failure together with the verdict and reason that came with it
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{source}")]
pub struct DecisionError {
    /// Verdict returned alongside the error
    pub verdict: Verdict,
    /// Reason returned alongside the error
    pub reason: String,
    /// Underlying error
    pub source: WardenError,
}

impl DecisionError {
    /// Wrap an error with an explicit verdict and reason
    pub fn new(verdict: Verdict, reason: impl Into<String>, source: WardenError) -> Self {
        Self {
            verdict,
            reason: reason.into(),
            source,
        }
    }

    /// Decision part of the failure
    pub fn decision(&self) -> Decision {
        Decision::new(self.verdict, self.reason.clone())
    }
}

impl From<WardenError> for DecisionError {
    fn from(source: WardenError) -> Self {
        Self {
            verdict: source.verdict_hint(),
            reason: String::new(),
            source,
        }
    }
}

/// Result of a decide call
pub type DecisionResult = Result<Decision, DecisionError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_error_is_undeterminable() {
        let err = DecisionError::from(WardenError::Transport("reset".into()));
        assert_eq!(err.verdict, Verdict::Undeterminable);
        assert!(err.reason.is_empty());
    }

    #[test]
    fn test_cancellation_is_failed() {
        assert_eq!(DecisionError::from(WardenError::Cancelled).verdict, Verdict::Failed);
        assert_eq!(
            DecisionError::from(WardenError::DeadlineExceeded).verdict,
            Verdict::Failed
        );
    }

    #[test]
    fn test_display_passes_through_source() {
        let err = DecisionError::from(WardenError::DeciderFailed { index: 2 });
        assert_eq!(err.to_string(), "chained decider at index 2 returned verdict failed");
    }
}
