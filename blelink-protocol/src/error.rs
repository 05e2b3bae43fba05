//! Error handling for blelink sessions
//!
//! All fallible operations in this crate return [`Result`]. Adapter and
//! protocol level failures are caught at the component boundary and turned
//! into user-visible notices via [`SessionError::user_message`]; they never
//! escape to the presentation layer as uncaught failures.

use thiserror::Error;

/// Result type for session operations
pub type Result<T> = std::result::Result<T, SessionError>;

/// Errors that can occur during scan and connection orchestration
#[derive(Error, Debug)]
pub enum SessionError {
    /// The radio is disabled or no usable adapter is present.
    ///
    /// Reported as a transient user notice; the requested operation is
    /// aborted without any state change.
    #[error("Bluetooth adapter unavailable")]
    AdapterUnavailable,

    /// A connection attempt did not complete within the configured timeout.
    #[error("Connection attempt cancelled")]
    ConnectionTimedOut,

    /// The adapter reported a connection failure other than a timeout.
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// A GATT operation (service enumeration, characteristic write) failed
    /// after the connection was established.
    ///
    /// This does not close the connection by itself; only an adapter
    /// reported disconnect does that.
    #[error("GATT operation failed: {0}")]
    Gatt(String),

    /// Input supplied by the caller could not be parsed (e.g. odd-length or
    /// non-hex text for a characteristic write). Rejected before any
    /// transport call is made.
    #[error("Malformed input: {0}")]
    MalformedInput(String),

    /// An operation was attempted in a state that does not allow it.
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Underlying platform adapter error.
    #[error("Adapter error: {0}")]
    Adapter(String),
}

impl SessionError {
    /// Check if this error is recoverable (transient error that can be
    /// retried without user intervention).
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            SessionError::ConnectionTimedOut
                | SessionError::ConnectionFailed(_)
                | SessionError::Gatt(_)
                | SessionError::Adapter(_)
        )
    }

    /// Get a user-friendly message suitable for display in a notice or
    /// toast.
    pub fn user_message(&self) -> String {
        match self {
            SessionError::AdapterUnavailable => {
                "Cannot start scan, Bluetooth is turned off".to_string()
            }
            SessionError::ConnectionTimedOut => "Connection attempt cancelled".to_string(),
            SessionError::ConnectionFailed(reason) => {
                format!("Error connecting to device: {}", reason)
            }
            SessionError::Gatt(msg) => format!("GATT operation failed: {}", msg),
            SessionError::MalformedInput(msg) => {
                format!("Invalid value: {}", msg)
            }
            SessionError::InvalidState(msg) => format!("Invalid state: {}", msg),
            SessionError::Adapter(msg) => format!("Bluetooth error: {}", msg),
        }
    }

    /// Create an invalid state error
    pub fn invalid_state(msg: impl Into<String>) -> Self {
        SessionError::InvalidState(msg.into())
    }

    /// Create a GATT operation error
    pub fn gatt(msg: impl Into<String>) -> Self {
        SessionError::Gatt(msg.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let error = SessionError::ConnectionFailed("adapter gone".to_string());
        assert_eq!(error.to_string(), "Connection failed: adapter gone");

        let error = SessionError::AdapterUnavailable;
        assert_eq!(error.to_string(), "Bluetooth adapter unavailable");

        let error = SessionError::MalformedInput("odd length".to_string());
        assert_eq!(error.to_string(), "Malformed input: odd length");
    }

    #[test]
    fn test_recoverable_classification() {
        assert!(SessionError::ConnectionTimedOut.is_recoverable());
        assert!(SessionError::Gatt("write rejected".to_string()).is_recoverable());
        assert!(!SessionError::AdapterUnavailable.is_recoverable());
        assert!(!SessionError::MalformedInput("x".to_string()).is_recoverable());
    }

    #[test]
    fn test_user_message_adapter_disabled() {
        assert_eq!(
            SessionError::AdapterUnavailable.user_message(),
            "Cannot start scan, Bluetooth is turned off"
        );
    }
}
