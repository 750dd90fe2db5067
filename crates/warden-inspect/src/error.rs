//! Inspection errors

use thiserror::Error;
use warden_common::WardenError;

/// Inspection error type
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum InspectError {
    /// An inspector with this name is already registered
    #[error("inspector {0} is already registered")]
    Duplicate(String),

    /// Factory could not build the inspector
    #[error("factory of {name} failed: {message}")]
    Factory {
        /// Inspector name
        name: String,
        /// Failure description
        message: String,
    },

    /// Packet handling failed
    #[error("{name} failed on packet: {message}")]
    Packet {
        /// Inspector name
        name: String,
        /// Failure description
        message: String,
    },

    /// Teardown failed
    #[error("{name} failed to destroy: {message}")]
    Destroy {
        /// Inspector name
        name: String,
        /// Failure description
        message: String,
    },
}

impl InspectError {
    /// Name of the inspector involved
    pub fn inspector(&self) -> &str {
        match self {
            Self::Duplicate(name) => name,
            Self::Factory { name, .. } | Self::Packet { name, .. } | Self::Destroy { name, .. } => {
                name
            }
        }
    }
}

impl From<InspectError> for WardenError {
    fn from(err: InspectError) -> Self {
        WardenError::Inspector {
            name: err.inspector().to_string(),
            message: err.to_string(),
        }
    }
}

/// Result type for inspection
pub type Result<T> = std::result::Result<T, InspectError>;
