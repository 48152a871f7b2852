//! Transport abstraction driven by the connection core.
//!
//! A transport is one physical connection attempt. It reports back through a
//! [`TransportListener`], which tags every event with the transport's id so
//! the core can ignore events from transports it has already abandoned.

pub mod websocket;

use tokio::sync::mpsc;
use tracing::debug;

use crate::common::error::{ClientError, ErrorInfo};
use crate::connection::core::Event;
use crate::protocol::ProtocolMessage;

pub use websocket::{WebSocketFactory, WebSocketTransport};

/// Protocol version sent as the `v` query parameter.
pub const PROTOCOL_VERSION: &str = "1.2";

/// Lifecycle callbacks from a transport.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// The socket is open; the service's CONNECTED follows.
    Available,
    /// The socket closed or could not be opened.
    Unavailable(Option<ErrorInfo>),
    Message(ProtocolMessage),
}

/// Everything a transport needs to open a connection.
#[derive(Debug, Clone, PartialEq)]
pub struct TransportParams {
    pub host: String,
    pub port: u16,
    pub tls: bool,
    pub key: Option<String>,
    pub client_id: Option<String>,
    /// Connection key of the previous connection, to resume it.
    pub resume: Option<String>,
    pub connection_serial: Option<i64>,
    pub echo: bool,
}

impl TransportParams {
    /// Query parameters for the connect request.
    pub fn query(&self) -> Vec<(&'static str, String)> {
        let mut params = vec![
            ("format", "json".to_string()),
            ("v", PROTOCOL_VERSION.to_string()),
        ];
        if let Some(ref key) = self.key {
            params.push(("key", key.clone()));
        }
        if let Some(ref client_id) = self.client_id {
            params.push(("clientId", client_id.clone()));
        }
        if !self.echo {
            params.push(("echo", "false".to_string()));
        }
        if let Some(ref resume) = self.resume {
            params.push(("resume", resume.clone()));
            if let Some(serial) = self.connection_serial {
                params.push(("connectionSerial", serial.to_string()));
            }
        }
        params
    }

    pub fn base_url(&self) -> String {
        let scheme = if self.tls { "wss" } else { "ws" };
        format!("{}://{}:{}/", scheme, self.host, self.port)
    }
}

/// One physical connection attempt.
pub trait Transport: Send {
    /// Starts connecting; progress is reported through `listener`.
    fn connect(&mut self, listener: TransportListener);

    fn send(&mut self, message: ProtocolMessage) -> Result<(), ClientError>;

    /// Closes the connection. `graceful` lets the peer see an orderly close.
    fn close(&mut self, graceful: bool);

    /// Tears the connection down immediately.
    fn abort(&mut self, reason: ErrorInfo);

    fn host(&self) -> &str;
}

/// Creates transports; injected into the connection manager.
pub trait TransportFactory: Send + Sync {
    fn create(&self, params: TransportParams) -> Box<dyn Transport>;
}

/// Posts transport events into the connection worker's inbox.
#[derive(Debug, Clone)]
pub struct TransportListener {
    id: u64,
    inbox: mpsc::UnboundedSender<Event>,
}

impl TransportListener {
    pub fn new(id: u64, inbox: mpsc::UnboundedSender<Event>) -> Self {
        Self { id, inbox }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn available(&self) {
        self.post(TransportEvent::Available);
    }

    pub fn unavailable(&self, reason: Option<ErrorInfo>) {
        self.post(TransportEvent::Unavailable(reason));
    }

    pub fn message(&self, message: ProtocolMessage) {
        self.post(TransportEvent::Message(message));
    }

    fn post(&self, event: TransportEvent) {
        let event = Event::Transport {
            transport_id: self.id,
            event,
        };
        if self.inbox.send(event).is_err() {
            debug!("Transport {} event dropped: connection worker gone", self.id);
        }
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    fn make_test_params() -> TransportParams {
        TransportParams {
            host: "realtime.ably.io".to_string(),
            port: 443,
            tls: true,
            key: Some("app.key:secret".to_string()),
            client_id: None,
            resume: None,
            connection_serial: Some(4),
            echo: true,
        }
    }

    #[test]
    fn test_base_url() {
        let mut params = make_test_params();
        assert_eq!(params.base_url(), "wss://realtime.ably.io:443/");
        params.tls = false;
        params.port = 80;
        assert_eq!(params.base_url(), "ws://realtime.ably.io:80/");
    }

    #[test]
    fn test_query_without_resume() {
        let query = make_test_params().query();
        assert!(query.contains(&("format", "json".to_string())));
        assert!(query.contains(&("key", "app.key:secret".to_string())));
        // Serial is only meaningful alongside a resume key.
        assert!(!query.iter().any(|(name, _)| *name == "connectionSerial"));
        assert!(!query.iter().any(|(name, _)| *name == "echo"));
    }

    #[test]
    fn test_query_with_resume() {
        let mut params = make_test_params();
        params.resume = Some("abc!123".to_string());
        params.echo = false;
        let query = params.query();
        assert!(query.contains(&("resume", "abc!123".to_string())));
        assert!(query.contains(&("connectionSerial", "4".to_string())));
        assert!(query.contains(&("echo", "false".to_string())));
    }

    #[test]
    fn test_listener_tags_events() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let listener = TransportListener::new(7, tx);
        listener.available();

        match rx.try_recv().unwrap() {
            Event::Transport {
                transport_id,
                event,
            } => {
                assert_eq!(transport_id, 7);
                assert_eq!(event, TransportEvent::Available);
            }
            other => panic!("unexpected event {:?}", other),
        }
    }
}
