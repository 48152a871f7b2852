//! Error types for the client.
//!
//! Two layers: [`ErrorInfo`] is the service-level error value carried on
//! state changes, nacks and listener failures; [`ClientError`] is what local
//! calls return synchronously.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::channel::ChannelState;
use crate::connection::ConnectionState;

/// Error reported by the service, or synthesized locally to describe why a
/// state transition or a message failed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Error)]
#[serde(rename_all = "camelCase")]
#[error("{message} (code {code}, status {status_code})")]
pub struct ErrorInfo {
    /// Service error code (e.g. 80003).
    pub code: u32,
    /// HTTP-style status code.
    pub status_code: u16,
    /// Human-readable description.
    pub message: String,
    /// Link to further documentation, if the service supplied one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub href: Option<String>,
}

impl ErrorInfo {
    pub fn new(message: impl Into<String>, status_code: u16, code: u32) -> Self {
        Self {
            code,
            status_code,
            message: message.into(),
            href: None,
        }
    }

    /// Server-side and network failures are worth retrying on another host;
    /// client errors (4xx) are not.
    pub fn is_retriable(&self) -> bool {
        self.status_code >= 500
    }

    pub fn disconnected() -> Self {
        Self::new("Connection temporarily unavailable", 503, 80003)
    }

    pub fn suspended() -> Self {
        Self::new("Connection unavailable", 503, 80002)
    }

    pub fn closed() -> Self {
        Self::new("Connection closed", 400, 80017)
    }

    pub fn failed() -> Self {
        Self::new("Connection failed", 503, 80000)
    }

    pub fn timed_out() -> Self {
        Self::new("Connection timed out", 504, 50003)
    }

    pub fn not_connected(state: ConnectionState) -> Self {
        Self::new(
            format!("Unable to send message in {} state", state),
            400,
            80000,
        )
    }

    pub fn nack_default() -> Self {
        Self::new("Unknown error", 500, 50000)
    }

    pub fn ping_timeout() -> Self {
        Self::new("Timed out waiting for heartbeat response", 504, 50003)
    }

    pub fn channel_timeout(operation: &str) -> Self {
        Self::new(format!("Channel {} timed out", operation), 408, 90007)
    }

    pub fn channel_operation_failed(message: impl Into<String>) -> Self {
        Self::new(message, 400, 90001)
    }
}

/// Errors returned synchronously by client calls.
#[derive(Debug, Clone, Error)]
pub enum ClientError {
    /// The connection is in a state that neither sends nor queues, or
    /// queueing was disallowed for this call.
    #[error("Not connected: connection is {state}")]
    NotConnected { state: ConnectionState },

    #[error("Operation '{operation}' not permitted while channel '{channel}' is {state}")]
    InvalidChannelState {
        channel: String,
        state: ChannelState,
        operation: &'static str,
    },

    /// The service rejected a message.
    #[error("Message rejected: {0}")]
    Nack(ErrorInfo),

    /// An operation failed with a service-level reason.
    #[error("Service error: {0}")]
    Service(ErrorInfo),

    #[error("Timed out after {0:?}")]
    Timeout(std::time::Duration),

    /// The connection worker is gone; the client has been dropped.
    #[error("Connection worker has shut down")]
    Closed,

    #[error("Transport error: {message}")]
    Transport { message: String },

    #[error("Codec error: {message}")]
    Codec { message: String },
}

impl ClientError {
    /// Classifies a failed outcome. Connection-level codes (800xx) mean the
    /// message never reached a verdict; anything else is the service's
    /// rejection.
    pub fn from_failure(reason: ErrorInfo) -> Self {
        if (80000..80100).contains(&reason.code) {
            ClientError::Service(reason)
        } else {
            ClientError::Nack(reason)
        }
    }
}

impl From<serde_json::Error> for ClientError {
    fn from(err: serde_json::Error) -> Self {
        ClientError::Codec {
            message: err.to_string(),
        }
    }
}

/// Configuration-related errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file '{path}': {source}")]
    IoError {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config: {message}")]
    ParseError { message: String },

    #[error("Config validation failed: {message}")]
    ValidationError { message: String },
}

/// Result type alias for client operations.
pub type Result<T> = std::result::Result<T, ClientError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_info_display() {
        let err = ErrorInfo::disconnected();
        assert_eq!(
            err.to_string(),
            "Connection temporarily unavailable (code 80003, status 503)"
        );
    }

    #[test]
    fn test_retriable_by_status() {
        assert!(ErrorInfo::disconnected().is_retriable());
        assert!(!ErrorInfo::closed().is_retriable());
        assert!(!ErrorInfo::new("Token expired", 401, 40142).is_retriable());
    }

    #[test]
    fn test_error_info_wire_shape() {
        let err: ErrorInfo =
            serde_json::from_str(r#"{"code":40160,"statusCode":401,"message":"denied"}"#)
                .unwrap();
        assert_eq!(err.code, 40160);
        assert_eq!(err.status_code, 401);
        assert_eq!(err.href, None);
    }

    #[test]
    fn test_failure_classification() {
        assert!(matches!(
            ClientError::from_failure(ErrorInfo::nack_default()),
            ClientError::Nack(_)
        ));
        assert!(matches!(
            ClientError::from_failure(ErrorInfo::suspended()),
            ClientError::Service(_)
        ));
    }

    #[test]
    fn test_not_connected_message_names_state() {
        let err = ClientError::NotConnected {
            state: ConnectionState::Failed,
        };
        assert!(err.to_string().contains("failed"));
    }
}
