//! WebSocket transport over tokio-tungstenite.

use std::sync::Arc;

use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::protocol::Message as WsMessage;
use tracing::{debug, info, warn};

use crate::common::error::{ClientError, ErrorInfo};
use crate::protocol::{FrameCodec, JsonCodec, ProtocolMessage};
use crate::transport::{Transport, TransportFactory, TransportListener, TransportParams};

/// Instructions from the transport handle to its socket task.
#[derive(Debug)]
enum Command {
    Frame(String),
    Close,
}

/// Builds [`WebSocketTransport`]s sharing one codec.
#[derive(Clone)]
pub struct WebSocketFactory {
    codec: Arc<dyn FrameCodec>,
}

impl WebSocketFactory {
    pub fn new(codec: impl FrameCodec + 'static) -> Self {
        Self {
            codec: Arc::new(codec),
        }
    }
}

impl Default for WebSocketFactory {
    fn default() -> Self {
        Self::new(JsonCodec)
    }
}

impl TransportFactory for WebSocketFactory {
    fn create(&self, params: TransportParams) -> Box<dyn Transport> {
        Box::new(WebSocketTransport::new(params, self.codec.clone()))
    }
}

/// A single WebSocket connection. The socket lives in a spawned task;
/// dropping the transport ends the task.
pub struct WebSocketTransport {
    params: TransportParams,
    codec: Arc<dyn FrameCodec>,
    outbound: Option<mpsc::UnboundedSender<Command>>,
}

impl WebSocketTransport {
    pub fn new(params: TransportParams, codec: Arc<dyn FrameCodec>) -> Self {
        Self {
            params,
            codec,
            outbound: None,
        }
    }

    fn url(&self) -> Result<String, ClientError> {
        let url = reqwest::Url::parse_with_params(&self.params.base_url(), self.params.query())
            .map_err(|e| ClientError::Transport {
                message: format!("Invalid connect URL: {}", e),
            })?;
        Ok(url.to_string())
    }
}

impl Transport for WebSocketTransport {
    fn connect(&mut self, listener: TransportListener) {
        let url = match self.url() {
            Ok(url) => url,
            Err(e) => {
                listener.unavailable(Some(ErrorInfo::new(e.to_string(), 400, 80000)));
                return;
            }
        };
        let (tx, rx) = mpsc::unbounded_channel();
        self.outbound = Some(tx);
        let codec = self.codec.clone();
        let host = self.params.host.clone();
        tokio::spawn(run_socket(url, host, codec, listener, rx));
    }

    fn send(&mut self, message: ProtocolMessage) -> Result<(), ClientError> {
        let outbound = self.outbound.as_ref().ok_or_else(|| ClientError::Transport {
            message: "Transport not connected".to_string(),
        })?;
        let frame = self.codec.encode(&message)?;
        outbound
            .send(Command::Frame(frame))
            .map_err(|_| ClientError::Transport {
                message: "Socket task has exited".to_string(),
            })
    }

    fn close(&mut self, graceful: bool) {
        if let Some(outbound) = self.outbound.take() {
            if graceful {
                // Task already gone means the socket is already closed.
                let _ = outbound.send(Command::Close);
            }
        }
    }

    fn abort(&mut self, reason: ErrorInfo) {
        debug!("Aborting transport to {}: {}", self.params.host, reason);
        // Dropping the sender ends the socket task without a close frame.
        self.outbound = None;
    }

    fn host(&self) -> &str {
        &self.params.host
    }
}

async fn run_socket(
    url: String,
    host: String,
    codec: Arc<dyn FrameCodec>,
    listener: TransportListener,
    mut commands: mpsc::UnboundedReceiver<Command>,
) {
    debug!("Opening WebSocket to {}", host);
    let ws = match connect_async(url.as_str()).await {
        Ok((ws, _response)) => ws,
        Err(e) => {
            warn!("WebSocket connect to {} failed: {}", host, e);
            listener.unavailable(Some(ErrorInfo::new(
                format!("Unable to connect to {}: {}", host, e),
                503,
                80003,
            )));
            return;
        }
    };
    info!("WebSocket open to {}", host);
    listener.available();

    let (mut sink, mut stream) = ws.split();

    loop {
        tokio::select! {
            command = commands.recv() => {
                match command {
                    Some(Command::Frame(frame)) => {
                        if let Err(e) = sink.send(WsMessage::Text(frame)).await {
                            warn!("WebSocket send to {} failed: {}", host, e);
                            listener.unavailable(Some(ErrorInfo::new(e.to_string(), 503, 80003)));
                            return;
                        }
                    }
                    Some(Command::Close) => {
                        if let Err(e) = sink.send(WsMessage::Close(None)).await {
                            debug!("Close frame to {} not sent: {}", host, e);
                        }
                        return;
                    }
                    // Transport handle dropped or aborted.
                    None => return,
                }
            }

            frame = stream.next() => {
                match frame {
                    Some(Ok(WsMessage::Text(text))) => match codec.decode(&text) {
                        Ok(message) => listener.message(message),
                        Err(e) => warn!("Undecodable frame from {}: {}", host, e),
                    },
                    Some(Ok(WsMessage::Binary(data))) => {
                        match std::str::from_utf8(&data).map_err(|e| e.to_string()).and_then(|text| {
                            codec.decode(text).map_err(|e| e.to_string())
                        }) {
                            Ok(message) => listener.message(message),
                            Err(e) => warn!("Undecodable binary frame from {}: {}", host, e),
                        }
                    }
                    Some(Ok(WsMessage::Ping(payload))) => {
                        let _ = sink.send(WsMessage::Pong(payload)).await;
                    }
                    Some(Ok(WsMessage::Close(frame))) => {
                        debug!("WebSocket to {} closed by peer: {:?}", host, frame);
                        listener.unavailable(None);
                        return;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        warn!("WebSocket to {} failed: {}", host, e);
                        listener.unavailable(Some(ErrorInfo::new(e.to_string(), 503, 80003)));
                        return;
                    }
                    None => {
                        listener.unavailable(None);
                        return;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connect_url() {
        let params = TransportParams {
            host: "sandbox-realtime.ably.io".to_string(),
            port: 443,
            tls: true,
            key: Some("app.key:secret".to_string()),
            client_id: Some("worker 1".to_string()),
            resume: Some("abc!def".to_string()),
            connection_serial: Some(12),
            echo: true,
        };
        let transport = WebSocketTransport::new(params, Arc::new(JsonCodec));
        let url = transport.url().unwrap();

        assert!(url.starts_with("wss://sandbox-realtime.ably.io/?"), "{}", url);
        assert!(url.contains("format=json"));
        assert!(url.contains("clientId=worker+1"));
        assert!(url.contains("resume=abc%21def"));
        assert!(url.contains("connectionSerial=12"));
    }

    #[test]
    fn test_send_before_connect_fails() {
        let params = TransportParams {
            host: "localhost".to_string(),
            port: 80,
            tls: false,
            key: None,
            client_id: None,
            resume: None,
            connection_serial: None,
            echo: true,
        };
        let mut transport = WebSocketFactory::default().create(params);
        let result = transport.send(ProtocolMessage::close());
        assert!(matches!(result, Err(ClientError::Transport { .. })));
    }
}
