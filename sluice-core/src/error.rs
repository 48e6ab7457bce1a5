//! Error types for the Sluice harness.

use thiserror::Error;

/// Main error type for Sluice operations.
///
/// Variants fall into two groups. Boot-time failures (`ConnectionFailure`,
/// `SubscriptionFailure`, `Configuration`) abort fleet startup and surface to
/// the process entry point. Steady-state receive failures (`Timeout`,
/// `ConnectionLost`, `HandleInvalid`) are handled inside the worker loop and
/// never propagate out of it; see [`Error::receive_disposition`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// The client could not reach the broker
    #[error("Connection failure to {address}: {message}")]
    ConnectionFailure {
        /// Service address that was dialled
        address: String,
        /// Underlying cause
        message: String,
    },

    /// A specific topic could not be subscribed
    #[error("Subscription failure on {topic}: {message}")]
    SubscriptionFailure {
        /// Topic the subscription was requested for
        topic: String,
        /// Underlying cause
        message: String,
    },

    /// A receive did not complete within its timeout
    #[error("Receive timed out after {timeout_ms}ms")]
    Timeout {
        /// Timeout that elapsed, in milliseconds
        timeout_ms: u64,
    },

    /// The connection backing a subscription dropped mid-operation
    #[error("Connection lost: {message}")]
    ConnectionLost {
        /// Underlying cause
        message: String,
    },

    /// The broker reports the subscription can never be served again
    #[error("Subscription {subscription} on {topic} is permanently invalid: {message}")]
    HandleInvalid {
        /// Topic of the invalid subscription
        topic: String,
        /// Subscription identifier
        subscription: String,
        /// Underlying cause
        message: String,
    },

    /// Downstream action reported a processing error
    #[error("Action failed: {message}")]
    Action {
        /// Underlying cause
        message: String,
    },

    /// Acknowledgment was rejected by the broker
    #[error("Acknowledge failed: {message}")]
    Acknowledge {
        /// Underlying cause
        message: String,
    },

    /// Configuration errors
    #[error("Configuration error: {message}")]
    Configuration {
        /// Description of the invalid setting
        message: String,
    },

    /// Internal system errors
    #[error("Internal error: {message}")]
    Internal {
        /// Description of the failure
        message: String,
    },
}

/// Result type alias for Sluice operations.
pub type Result<T> = std::result::Result<T, Error>;

/// How a pull worker reacts to a failed receive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiveDisposition {
    /// Release the permit, log, and move on to the next handle
    Retry,
    /// Remove the handle from the worker's rotation for good
    DropHandle,
}

impl Error {
    /// Create a configuration error from any displayable message.
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration { message: message.into() }
    }

    /// Create an action error from any displayable message.
    pub fn action(message: impl Into<String>) -> Self {
        Self::Action { message: message.into() }
    }

    /// Create an internal error from any displayable message.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal { message: message.into() }
    }

    /// Classify a receive failure.
    ///
    /// Only [`Error::HandleInvalid`] removes a handle; everything else is
    /// retried on the next pass of the round-robin.
    #[must_use]
    pub const fn receive_disposition(&self) -> ReceiveDisposition {
        match self {
            Self::HandleInvalid { .. } => ReceiveDisposition::DropHandle,
            _ => ReceiveDisposition::Retry,
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::Configuration { message: err.to_string() }
    }
}

impl From<toml::de::Error> for Error {
    fn from(err: toml::de::Error) -> Self {
        Self::Configuration { message: format!("Failed to parse config: {err}") }
    }
}

impl From<toml::ser::Error> for Error {
    fn from(err: toml::ser::Error) -> Self {
        Self::Configuration { message: format!("Failed to serialize config: {err}") }
    }
}

impl From<validator::ValidationErrors> for Error {
    fn from(err: validator::ValidationErrors) -> Self {
        Self::Configuration { message: err.to_string() }
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Self::Internal { message: err.to_string() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_receive_disposition() {
        assert_eq!(Error::Timeout { timeout_ms: 10 }.receive_disposition(), ReceiveDisposition::Retry);
        assert_eq!(
            Error::ConnectionLost { message: "reset".into() }.receive_disposition(),
            ReceiveDisposition::Retry
        );
        let invalid = Error::HandleInvalid {
            topic: "persistent://t/ns/a".into(),
            subscription: "s".into(),
            message: "deleted".into(),
        };
        assert_eq!(invalid.receive_disposition(), ReceiveDisposition::DropHandle);
    }

    #[test]
    fn test_display() {
        let err = Error::Timeout { timeout_ms: 250 };
        assert_eq!(err.to_string(), "Receive timed out after 250ms");
    }
}
