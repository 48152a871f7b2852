//! The connection worker and the handle the rest of the client talks to.
//!
//! [`ConnectionManager::spawn`] moves a [`ConnectionCore`] onto a tokio task
//! that owns it exclusively. Everything else holds a cloneable
//! [`ConnectionHandle`]: requests go in through the worker's inbox, state
//! comes back through a watch snapshot and a broadcast of changes.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::common::error::ClientError;
use crate::common::types::Completion;
use crate::config::ClientOptions;
use crate::connection::core::{ConnectionCore, Effect, Event, Request};
use crate::connection::probe::ConnectivityProbe;
use crate::connection::state::{Connection, ConnectionState, ConnectionStateChange};
use crate::channel::ChannelRegistry;
use crate::protocol::ProtocolMessage;
use crate::transport::TransportFactory;

/// Cloneable access to a running connection.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    inbox: mpsc::UnboundedSender<Event>,
    snapshot: watch::Receiver<Connection>,
    state_tx: broadcast::Sender<ConnectionStateChange>,
}

impl ConnectionHandle {
    pub(crate) fn new(
        inbox: mpsc::UnboundedSender<Event>,
        snapshot: watch::Receiver<Connection>,
        state_tx: broadcast::Sender<ConnectionStateChange>,
    ) -> Self {
        Self {
            inbox,
            snapshot,
            state_tx,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.snapshot.borrow().state
    }

    /// Copy of the current connection snapshot.
    pub fn connection(&self) -> Connection {
        self.snapshot.borrow().clone()
    }

    pub fn watch(&self) -> watch::Receiver<Connection> {
        self.snapshot.clone()
    }

    /// Every state change from now on, in order.
    pub fn on_state_change(&self) -> broadcast::Receiver<ConnectionStateChange> {
        self.state_tx.subscribe()
    }

    pub fn connect(&self) -> Result<(), ClientError> {
        self.post(Request::Connect)
    }

    pub fn close(&self) -> Result<(), ClientError> {
        self.post(Request::Close)
    }

    /// Closes and waits until the connection is closed or failed.
    pub async fn close_and_wait(&self, timeout: Duration) -> Result<ConnectionState, ClientError> {
        let mut snapshot = self.watch();
        self.close()?;
        let reached = tokio::time::timeout(
            timeout,
            snapshot.wait_for(|connection| connection.state.info().terminal),
        )
        .await
        .map_err(|_| ClientError::Timeout(timeout))?;
        match reached {
            Ok(connection) => Ok(connection.state),
            Err(_) => Err(ClientError::Closed),
        }
    }

    /// Sends a protocol message. Fails straight away when the connection
    /// can neither send nor queue (`queue_events` false disallows queueing);
    /// otherwise `completion` hears the outcome.
    pub fn send(
        &self,
        message: ProtocolMessage,
        queue_events: bool,
        completion: Completion,
    ) -> Result<(), ClientError> {
        let state = self.state();
        let info = state.info();
        if !(info.send_events || (queue_events && info.queue_events)) {
            return Err(ClientError::NotConnected { state });
        }
        self.post(Request::Send {
            message,
            queue_events,
            completion,
        })
    }

    /// Sends a heartbeat; `completion` hears whether the service answered.
    pub fn ping_with(&self, completion: Completion) -> Result<(), ClientError> {
        self.post(Request::Ping { completion })
    }

    /// Round-trip time of a heartbeat.
    pub async fn ping(&self) -> Result<Duration, ClientError> {
        let started = Instant::now();
        let (completion, outcome) = Completion::channel();
        self.ping_with(completion)?;
        match outcome.await {
            Ok(Ok(())) => Ok(started.elapsed()),
            Ok(Err(reason)) => Err(ClientError::Service(reason)),
            Err(_) => Err(ClientError::Closed),
        }
    }

    pub(crate) fn dispose(&self) {
        if self.post(Request::Dispose).is_err() {
            debug!("Connection worker already stopped");
        }
    }

    fn post(&self, request: Request) -> Result<(), ClientError> {
        self.inbox
            .send(Event::Request(request))
            .map_err(|_| ClientError::Closed)
    }
}

/// Owns the connection worker task. Dropping it disposes the connection.
pub struct ConnectionManager {
    handle: ConnectionHandle,
    channels: Arc<ChannelRegistry>,
    task: Option<JoinHandle<()>>,
}

impl ConnectionManager {
    /// Starts the worker. Must be called inside a tokio runtime.
    pub fn spawn(
        options: ClientOptions,
        factory: Arc<dyn TransportFactory>,
        probe: Arc<dyn ConnectivityProbe>,
    ) -> Self {
        let (core, inbox) = ConnectionCore::new(options, factory);
        let handle = core.handle();
        let channels = core.channels();
        let task = tokio::spawn(run_worker(core, inbox, probe));
        Self {
            handle,
            channels,
            task: Some(task),
        }
    }

    pub fn handle(&self) -> &ConnectionHandle {
        &self.handle
    }

    pub fn channels(&self) -> &Arc<ChannelRegistry> {
        &self.channels
    }

    /// Disposes the connection and waits for the worker to stop.
    pub async fn shutdown(mut self) {
        self.handle.dispose();
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                debug!("Connection worker ended abnormally: {}", e);
            }
        }
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        if self.task.is_some() {
            self.handle.dispose();
        }
    }
}

async fn run_worker(
    mut core: ConnectionCore,
    mut inbox: mpsc::UnboundedReceiver<Event>,
    probe: Arc<dyn ConnectivityProbe>,
) {
    let results = core.inbox();
    debug!("Connection worker started");

    loop {
        let deadline = core.next_deadline();
        tokio::select! {
            event = inbox.recv() => {
                let Some(event) = event else {
                    break;
                };
                if core.handle_event(event, Instant::now()).is_break() {
                    break;
                }
            }
            _ = sleep_until(deadline), if deadline.is_some() => {
                core.on_deadline(Instant::now());
            }
        }

        for effect in core.take_effects() {
            match effect {
                Effect::CheckConnectivity { probe_id } => {
                    let check = probe.check();
                    let results = results.clone();
                    tokio::spawn(async move {
                        let ok = check.await;
                        // Worker may have stopped meanwhile.
                        let _ = results.send(Event::ConnectivityChecked { probe_id, ok });
                    });
                }
            }
        }
    }

    info!("Connection worker stopped");
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::probe::StaticProbe;
    use crate::protocol::{Action, ConnectionDetails};
    use crate::transport::mock::MockFactory;

    fn make_test_manager(probe_ok: bool) -> (ConnectionManager, MockFactory) {
        let factory = MockFactory::default();
        let mut options = ClientOptions::with_key("app.key:secret");
        options.fallback_hosts = Some(vec!["fb1.example.com".into()]);
        let manager = ConnectionManager::spawn(
            options,
            Arc::new(factory.clone()),
            Arc::new(StaticProbe(probe_ok)),
        );
        (manager, factory)
    }

    async fn wait_for_state(handle: &ConnectionHandle, state: ConnectionState) {
        let mut snapshot = handle.watch();
        tokio::time::timeout(
            Duration::from_secs(5),
            snapshot.wait_for(|connection| connection.state == state),
        )
        .await
        .unwrap()
        .unwrap();
    }

    async fn wait_for_transports(factory: &MockFactory, count: usize) {
        for _ in 0..1000 {
            if factory.wire.lock().unwrap().listeners.len() >= count {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("transport {} never created", count);
    }

    fn connected(id: &str) -> ProtocolMessage {
        let mut message = ProtocolMessage::new(Action::Connected);
        message.connection_id = Some(id.to_string());
        message.connection_details = Some(ConnectionDetails {
            connection_key: Some(format!("{}!key", id)),
            ..Default::default()
        });
        message
    }

    #[tokio::test]
    async fn test_worker_connects_and_closes() {
        let (manager, factory) = make_test_manager(true);
        let handle = manager.handle().clone();
        handle.connect().unwrap();
        wait_for_transports(&factory, 1).await;

        let listener = factory.wire.lock().unwrap().listener();
        listener.message(connected("conn-1"));
        wait_for_state(&handle, ConnectionState::Connected).await;

        let close = {
            let handle = handle.clone();
            tokio::spawn(async move { handle.close_and_wait(Duration::from_secs(5)).await })
        };
        wait_for_state(&handle, ConnectionState::Closing).await;
        listener.message(ProtocolMessage::new(Action::Closed));
        assert_eq!(close.await.unwrap().unwrap(), ConnectionState::Closed);

        manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_worker_runs_connectivity_probe() {
        let (manager, factory) = make_test_manager(true);
        let handle = manager.handle().clone();
        handle.connect().unwrap();
        wait_for_transports(&factory, 1).await;

        factory.wire.lock().unwrap().listener().unavailable(None);
        wait_for_transports(&factory, 2).await;
        let host = factory.wire.lock().unwrap().params[1].host.clone();
        assert_eq!(host, "fb1.example.com");
        assert_eq!(handle.state(), ConnectionState::Connecting);

        manager.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_worker_retries_after_disconnect() {
        let (manager, factory) = make_test_manager(false);
        let handle = manager.handle().clone();
        let mut changes = handle.on_state_change();
        handle.connect().unwrap();
        wait_for_transports(&factory, 1).await;

        factory.wire.lock().unwrap().listener().unavailable(None);
        wait_for_state(&handle, ConnectionState::Disconnected).await;

        // Paused clock: the retry timer fires as soon as the worker idles.
        wait_for_transports(&factory, 2).await;
        let mut seen = Vec::new();
        while let Ok(change) = changes.try_recv() {
            seen.push(change.current);
        }
        assert_eq!(
            seen,
            vec![
                ConnectionState::Connecting,
                ConnectionState::Disconnected,
                ConnectionState::Connecting
            ]
        );

        manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_handle_fails_after_shutdown() {
        let (manager, _factory) = make_test_manager(true);
        let handle = manager.handle().clone();
        manager.shutdown().await;
        assert!(matches!(handle.connect(), Err(ClientError::Closed)));
        assert_eq!(handle.state(), ConnectionState::Closed);
    }
}
