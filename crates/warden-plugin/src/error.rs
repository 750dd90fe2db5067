//! Plugin bridge errors

use thiserror::Error;
use warden_common::{Capability, WardenError};

/// Plugin bridge error type
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PluginError {
    /// The plugin process could not be started
    #[error("failed to launch plugin {name}: {reason}")]
    Launch {
        /// Plugin name
        name: String,
        /// Failure description
        reason: String,
    },

    /// Handshake failed or was rejected
    #[error("handshake with plugin {name} failed: {reason}")]
    Handshake {
        /// Plugin name
        name: String,
        /// Failure description
        reason: String,
    },

    /// Plugin advertised no capabilities
    #[error("plugin {0} advertises no capabilities")]
    NoCapabilities(String),

    /// Capability was not advertised at handshake
    #[error("plugin {plugin} does not implement {capability}")]
    Unimplemented {
        /// Plugin name
        plugin: String,
        /// Requested capability
        capability: Capability,
    },

    /// Transport is closed, usually because the plugin exited
    #[error("transport closed: {0}")]
    Closed(String),

    /// Reading or writing the transport failed
    #[error("transport IO error: {0}")]
    Io(String),

    /// Frame could not be encoded or decoded
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The plugin answered with an error
    #[error("remote error ({code}): {message}")]
    Remote {
        /// Error code
        code: String,
        /// Error message
        message: String,
    },

    /// The call was cancelled by the caller
    #[error("call cancelled")]
    Cancelled,

    /// The call hit its deadline
    #[error("deadline exceeded")]
    DeadlineExceeded,

    /// The plugin did not exit within the shutdown grace period and was killed
    #[error("plugin {0} ignored shutdown and was killed")]
    Unresponsive(String),
}

impl PluginError {
    /// Convert into the shared error type, tagging remote errors with the plugin name
    pub fn into_warden(self, plugin: &str) -> WardenError {
        match self {
            Self::Cancelled => WardenError::Cancelled,
            Self::DeadlineExceeded => WardenError::DeadlineExceeded,
            Self::Closed(reason) => WardenError::Transport(format!("{}: {}", plugin, reason)),
            Self::Io(reason) => WardenError::Transport(format!("{}: {}", plugin, reason)),
            Self::Protocol(reason) => WardenError::Protocol(format!("{}: {}", plugin, reason)),
            Self::Remote { message, .. } => WardenError::Remote {
                plugin: plugin.to_string(),
                message,
            },
            Self::Unimplemented { capability, .. } => {
                WardenError::Unimplemented(capability.to_string())
            }
            other => WardenError::Transport(other.to_string()),
        }
    }
}

impl From<WardenError> for PluginError {
    fn from(err: WardenError) -> Self {
        match err {
            WardenError::Cancelled => Self::Cancelled,
            WardenError::DeadlineExceeded => Self::DeadlineExceeded,
            other => Self::Io(other.to_string()),
        }
    }
}

impl From<std::io::Error> for PluginError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

/// Result type for the plugin bridge
pub type Result<T> = std::result::Result<T, PluginError>;
