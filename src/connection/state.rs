//! Connection states and their static metadata.

use std::fmt;
use std::time::Duration;

use crate::common::error::ErrorInfo;

/// Lifecycle state of the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    Initialized,
    Connecting,
    Connected,
    Disconnected,
    Suspended,
    Closing,
    Closed,
    Failed,
}

impl ConnectionState {
    pub const ALL: [ConnectionState; 8] = [
        ConnectionState::Initialized,
        ConnectionState::Connecting,
        ConnectionState::Connected,
        ConnectionState::Disconnected,
        ConnectionState::Suspended,
        ConnectionState::Closing,
        ConnectionState::Closed,
        ConnectionState::Failed,
    ];

    /// Static metadata for this state.
    pub fn info(self) -> &'static StateInfo {
        &STATE_TABLE[self as usize]
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ConnectionState::Initialized => "initialized",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Suspended => "suspended",
            ConnectionState::Closing => "closing",
            ConnectionState::Closed => "closed",
            ConnectionState::Failed => "failed",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error template that can live in a `const` table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StaticError {
    pub message: &'static str,
    pub status_code: u16,
    pub code: u32,
}

impl StaticError {
    pub fn to_error_info(self) -> ErrorInfo {
        ErrorInfo::new(self.message, self.status_code, self.code)
    }
}

const REASON_DISCONNECTED: StaticError = StaticError {
    message: "Connection temporarily unavailable",
    status_code: 503,
    code: 80003,
};
const REASON_SUSPENDED: StaticError = StaticError {
    message: "Connection unavailable",
    status_code: 503,
    code: 80002,
};
const REASON_CLOSED: StaticError = StaticError {
    message: "Connection closed",
    status_code: 400,
    code: 80017,
};
const REASON_FAILED: StaticError = StaticError {
    message: "Connection failed",
    status_code: 503,
    code: 80000,
};

/// Behaviour attached to a [`ConnectionState`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StateInfo {
    pub state: ConnectionState,
    /// Outbound messages may be buffered.
    pub queue_events: bool,
    /// Outbound messages may be written to the transport.
    pub send_events: bool,
    /// No automatic transitions leave this state.
    pub terminal: bool,
    /// Reconnect automatically when the state times out.
    pub retry: bool,
    /// Default time spent in the state before a forced transition.
    /// Zero waits indefinitely. Seeds the `ClientOptions` timeout defaults;
    /// the connection arms its deadlines from the options.
    pub timeout: Duration,
    pub default_error: Option<StaticError>,
}

impl StateInfo {
    pub fn default_error(&self) -> Option<ErrorInfo> {
        self.default_error.map(StaticError::to_error_info)
    }
}

/// Indexed by `ConnectionState as usize`.
const STATE_TABLE: [StateInfo; 8] = [
    StateInfo {
        state: ConnectionState::Initialized,
        queue_events: true,
        send_events: false,
        terminal: false,
        retry: false,
        timeout: Duration::ZERO,
        default_error: None,
    },
    StateInfo {
        state: ConnectionState::Connecting,
        queue_events: true,
        send_events: false,
        terminal: false,
        retry: false,
        timeout: Duration::from_secs(15),
        default_error: None,
    },
    StateInfo {
        state: ConnectionState::Connected,
        queue_events: false,
        send_events: true,
        terminal: false,
        retry: false,
        timeout: Duration::ZERO,
        default_error: None,
    },
    StateInfo {
        state: ConnectionState::Disconnected,
        queue_events: true,
        send_events: false,
        terminal: false,
        retry: true,
        timeout: Duration::from_secs(15),
        default_error: Some(REASON_DISCONNECTED),
    },
    StateInfo {
        state: ConnectionState::Suspended,
        queue_events: false,
        send_events: false,
        terminal: false,
        retry: true,
        timeout: Duration::from_secs(30),
        default_error: Some(REASON_SUSPENDED),
    },
    StateInfo {
        state: ConnectionState::Closing,
        queue_events: false,
        send_events: false,
        terminal: false,
        retry: false,
        timeout: Duration::from_secs(15),
        default_error: Some(REASON_CLOSED),
    },
    StateInfo {
        state: ConnectionState::Closed,
        queue_events: false,
        send_events: false,
        terminal: true,
        retry: false,
        timeout: Duration::ZERO,
        default_error: Some(REASON_CLOSED),
    },
    StateInfo {
        state: ConnectionState::Failed,
        queue_events: false,
        send_events: false,
        terminal: true,
        retry: false,
        timeout: Duration::ZERO,
        default_error: Some(REASON_FAILED),
    },
];

/// Record of one connection state transition.
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionStateChange {
    pub previous: ConnectionState,
    pub current: ConnectionState,
    /// When the client will next try to connect, for retrying states.
    pub retry_in: Option<Duration>,
    pub reason: Option<ErrorInfo>,
}

/// Snapshot of the live connection, published by the connection worker.
#[derive(Debug, Clone, PartialEq)]
pub struct Connection {
    /// Service-assigned id; changes when a resume fails.
    pub id: Option<String>,
    /// Resume token.
    pub key: Option<String>,
    /// Last connection serial seen on an inbound message.
    pub serial: Option<i64>,
    pub state: ConnectionState,
    pub error_reason: Option<ErrorInfo>,
    /// Host of the transport currently in use.
    pub host: Option<String>,
}

impl Default for Connection {
    fn default() -> Self {
        Self {
            id: None,
            key: None,
            serial: None,
            state: ConnectionState::Initialized,
            error_reason: None,
            host: None,
        }
    }
}
