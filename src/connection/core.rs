//! The connection state machine.
//!
//! A synchronous reducer: every input arrives as an [`Event`] and all state
//! lives in [`ConnectionCore`], mutated only by [`ConnectionCore::handle`] and
//! [`ConnectionCore::on_deadline`]. Work that needs the runtime (connectivity
//! probes) is handed back as [`Effect`]s for the worker to run.

use std::collections::VecDeque;
use std::ops::ControlFlow;
use std::sync::Arc;
use std::time::Duration;

use backon::BackoffBuilder;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::channel::ChannelRegistry;
use crate::common::error::ErrorInfo;
use crate::common::reconnect::{BackoffStrategy, RetryBackoff, RetryBackoffBuilder};
use crate::common::types::{Completion, QueuedMessage};
use crate::config::ClientOptions;
use crate::connection::hosts::HostRegistry;
use crate::connection::manager::ConnectionHandle;
use crate::connection::pending::PendingMessageQueue;
use crate::connection::state::{Connection, ConnectionState, ConnectionStateChange};
use crate::protocol::{Action, ProtocolMessage};
use crate::transport::{Transport, TransportEvent, TransportFactory, TransportListener, TransportParams};

/// How long a ping waits for a heartbeat before failing.
pub const PING_TIMEOUT: Duration = Duration::from_secs(10);

const STATE_CHANGE_CAPACITY: usize = 64;

/// Application requests.
#[derive(Debug)]
pub enum Request {
    Connect,
    Close,
    Send {
        message: ProtocolMessage,
        /// Whether the message may wait in the outbound queue.
        queue_events: bool,
        completion: Completion,
    },
    Ping {
        completion: Completion,
    },
    /// Stop the worker.
    Dispose,
}

/// Everything the reducer reacts to.
#[derive(Debug)]
pub enum Event {
    Request(Request),
    Transport {
        transport_id: u64,
        event: TransportEvent,
    },
    ConnectivityChecked {
        probe_id: u64,
        ok: bool,
    },
}

/// Work the reducer asks the worker to perform.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Effect {
    /// Run the connectivity probe and post [`Event::ConnectivityChecked`].
    CheckConnectivity { probe_id: u64 },
}

struct ActiveTransport {
    id: u64,
    host: String,
    transport: Box<dyn Transport>,
}

struct PendingPing {
    id: String,
    completion: Completion,
    deadline: Instant,
}

/// A disconnect waiting on a connectivity check before deciding between
/// falling back and settling into disconnected/suspended.
struct PendingProbe {
    id: u64,
    host: String,
    reason: Option<ErrorInfo>,
}

pub struct ConnectionCore {
    options: ClientOptions,
    hosts: HostRegistry,
    factory: Arc<dyn TransportFactory>,
    inbox: mpsc::UnboundedSender<Event>,
    snapshot: watch::Sender<Connection>,
    state_tx: broadcast::Sender<ConnectionStateChange>,
    handle: ConnectionHandle,
    channels: Arc<ChannelRegistry>,

    now: Instant,
    state: ConnectionState,
    error_reason: Option<ErrorInfo>,
    connection_id: Option<String>,
    connection_key: Option<String>,
    connection_serial: Option<i64>,
    connection_state_ttl: Duration,

    transport: Option<ActiveTransport>,
    next_transport_id: u64,
    /// Messages not yet handed to a transport.
    queue: VecDeque<QueuedMessage>,
    /// Messages handed to a transport and awaiting ACK/NACK.
    pending: PendingMessageQueue,
    pings: Vec<PendingPing>,
    next_ping_id: u64,
    probe: Option<PendingProbe>,
    next_probe_id: u64,

    /// Expiry of the current state.
    deadline: Option<Instant>,
    /// Past this point a lost connection is reported as suspended.
    suspend_deadline: Instant,
    retry_backoff: RetryBackoff,
    effects: Vec<Effect>,
}

impl ConnectionCore {
    /// Builds a core in `initialized` and the receiving end of its inbox.
    pub fn new(
        options: ClientOptions,
        factory: Arc<dyn TransportFactory>,
    ) -> (Self, mpsc::UnboundedReceiver<Event>) {
        let now = Instant::now();
        let (inbox, inbox_rx) = mpsc::unbounded_channel();
        let (snapshot, snapshot_rx) = watch::channel(Connection::default());
        let (state_tx, _) = broadcast::channel(STATE_CHANGE_CAPACITY);
        let handle = ConnectionHandle::new(inbox.clone(), snapshot_rx, state_tx.clone());
        let channels = Arc::new(ChannelRegistry::new(
            handle.clone(),
            options.channel_request_timeout(),
            options.queue_messages,
        ));
        let hosts = HostRegistry::new(&options);
        let connection_state_ttl = options.connection_state_ttl();
        let retry_backoff = RetryBackoffBuilder::new(options.disconnected_retry_timeout()).build();

        let core = Self {
            options,
            hosts,
            factory,
            inbox,
            snapshot,
            state_tx,
            handle,
            channels,
            now,
            state: ConnectionState::Initialized,
            error_reason: None,
            connection_id: None,
            connection_key: None,
            connection_serial: None,
            connection_state_ttl,
            transport: None,
            next_transport_id: 0,
            queue: VecDeque::new(),
            pending: PendingMessageQueue::new(),
            pings: Vec::new(),
            next_ping_id: 0,
            probe: None,
            next_probe_id: 0,
            deadline: None,
            suspend_deadline: now + connection_state_ttl,
            retry_backoff,
            effects: Vec::new(),
        };
        (core, inbox_rx)
    }

    pub fn handle(&self) -> ConnectionHandle {
        self.handle.clone()
    }

    pub fn channels(&self) -> Arc<ChannelRegistry> {
        self.channels.clone()
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn pending(&self) -> &PendingMessageQueue {
        &self.pending
    }

    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    pub(crate) fn inbox(&self) -> mpsc::UnboundedSender<Event> {
        self.inbox.clone()
    }

    /// Reduces one event. Breaks once the core has been disposed.
    pub fn handle_event(&mut self, event: Event, now: Instant) -> ControlFlow<()> {
        self.now = now;
        match event {
            Event::Request(request) => return self.on_request(request),
            Event::Transport {
                transport_id,
                event,
            } => {
                if self.transport.as_ref().map(|t| t.id) != Some(transport_id) {
                    debug!("Ignoring {:?} from stale transport {}", event, transport_id);
                    return ControlFlow::Continue(());
                }
                match event {
                    TransportEvent::Available => debug!("Transport {} available", transport_id),
                    TransportEvent::Unavailable(reason) => self.on_transport_unavailable(reason),
                    TransportEvent::Message(message) => self.on_protocol_message(message),
                }
            }
            Event::ConnectivityChecked { probe_id, ok } => self.on_connectivity_checked(probe_id, ok),
        }
        ControlFlow::Continue(())
    }

    /// Earliest point at which [`ConnectionCore::on_deadline`] has work.
    pub fn next_deadline(&self) -> Option<Instant> {
        [
            self.deadline,
            self.pings.iter().map(|ping| ping.deadline).min(),
            self.channels.next_deadline(),
        ]
        .into_iter()
        .flatten()
        .min()
    }

    /// Applies every deadline that has passed by `now`.
    pub fn on_deadline(&mut self, now: Instant) {
        self.now = now;
        if let Some(deadline) = self.deadline {
            if deadline <= now {
                self.deadline = None;
                self.on_state_timeout();
            }
        }
        self.expire_pings();
        self.channels.expire(now);
    }

    pub fn take_effects(&mut self) -> Vec<Effect> {
        std::mem::take(&mut self.effects)
    }

    fn on_request(&mut self, request: Request) -> ControlFlow<()> {
        match request {
            Request::Connect => self.connect(),
            Request::Close => self.close(),
            Request::Send {
                message,
                queue_events,
                completion,
            } => self.send(QueuedMessage::new(message, completion), queue_events),
            Request::Ping { completion } => self.ping(completion),
            Request::Dispose => {
                self.dispose();
                return ControlFlow::Break(());
            }
        }
        ControlFlow::Continue(())
    }

    fn connect(&mut self) {
        match self.state {
            ConnectionState::Connecting | ConnectionState::Connected => {
                debug!("Connect ignored while {}", self.state);
                return;
            }
            ConnectionState::Initialized
            | ConnectionState::Closed
            | ConnectionState::Failed
            | ConnectionState::Suspended => {
                self.suspend_deadline = self.now + self.connection_state_ttl;
            }
            ConnectionState::Disconnected | ConnectionState::Closing => {}
        }
        self.probe = None;
        let host = self.hosts.primary().to_string();
        self.start_transport(host);
    }

    fn close(&mut self) {
        self.probe = None;
        match self.state {
            ConnectionState::Closed | ConnectionState::Closing => {
                debug!("Close ignored while {}", self.state);
            }
            ConnectionState::Connected if self.transport.is_some() => {
                let sent = match self.transport.as_mut() {
                    Some(active) => active.transport.send(ProtocolMessage::close()),
                    None => Ok(()),
                };
                match sent {
                    Ok(()) => self.set_state(ConnectionState::Closing, None),
                    Err(e) => {
                        warn!("CLOSE not sent: {}", e);
                        self.close_transport(false);
                        self.set_closed();
                    }
                }
            }
            _ => {
                self.abort_transport(ErrorInfo::closed());
                self.set_closed();
            }
        }
    }

    fn send(&mut self, mut message: QueuedMessage, queue_events: bool) {
        let info = self.state.info();
        if info.send_events && self.transport.is_some() {
            if self.queue.is_empty() {
                match self.send_now(message) {
                    Ok(()) => return,
                    Err(unsent) => message = unsent,
                }
            }
            self.queue.push_back(message);
        } else if (info.queue_events || info.send_events) && queue_events {
            self.enqueue(message);
        } else {
            debug!("Rejecting {:?} while {}", message.message.action, self.state);
            message.completion.fail(ErrorInfo::not_connected(self.state));
        }
    }

    /// Hands a message to the transport, tracking it for ACK if needed.
    /// Gives the message back untouched when the transport refuses it.
    fn send_now(&mut self, mut queued: QueuedMessage) -> Result<(), QueuedMessage> {
        let Some(active) = self.transport.as_mut() else {
            return Err(queued);
        };
        let needs_ack = queued.message.requires_ack();
        if needs_ack {
            queued.message.msg_serial = Some(self.pending.next_serial());
        }
        match active.transport.send(queued.message.clone()) {
            Ok(()) => {
                if needs_ack {
                    self.pending.push(queued);
                } else {
                    queued.completion.succeed();
                }
                Ok(())
            }
            Err(e) => {
                warn!("Send on transport {} failed: {}", active.id, e);
                queued.message.msg_serial = None;
                Err(queued)
            }
        }
    }

    /// Appends to the outbound queue, folding into the tail when compatible.
    fn enqueue(&mut self, message: QueuedMessage) {
        let message = match self.queue.back_mut() {
            Some(last) => match last.try_merge(message) {
                Ok(()) => return,
                Err(message) => message,
            },
            None => message,
        };
        self.queue.push_back(message);
    }

    fn flush_queue(&mut self) {
        if !self.queue.is_empty() {
            debug!("Flushing {} queued messages", self.queue.len());
        }
        while let Some(message) = self.queue.pop_front() {
            if let Err(message) = self.send_now(message) {
                self.queue.push_front(message);
                break;
            }
        }
    }

    fn ping(&mut self, completion: Completion) {
        if self.state != ConnectionState::Connected {
            completion.fail(ErrorInfo::not_connected(self.state));
            return;
        }
        let Some(active) = self.transport.as_mut() else {
            completion.fail(ErrorInfo::not_connected(self.state));
            return;
        };
        self.next_ping_id += 1;
        let id = format!("ping-{}", self.next_ping_id);
        match active.transport.send(ProtocolMessage::heartbeat(id.clone())) {
            Ok(()) => self.pings.push(PendingPing {
                id,
                completion,
                deadline: self.now + PING_TIMEOUT,
            }),
            Err(e) => completion.fail(ErrorInfo::new(e.to_string(), 503, 80003)),
        }
    }

    fn on_heartbeat(&mut self) {
        for ping in self.pings.drain(..) {
            debug!("Ping {} answered", ping.id);
            ping.completion.succeed();
        }
    }

    fn expire_pings(&mut self) {
        let now = self.now;
        let (expired, live): (Vec<_>, Vec<_>) = std::mem::take(&mut self.pings)
            .into_iter()
            .partition(|ping| ping.deadline <= now);
        self.pings = live;
        for ping in expired {
            debug!("Ping {} timed out", ping.id);
            ping.completion.fail(ErrorInfo::ping_timeout());
        }
    }

    fn on_state_timeout(&mut self) {
        match self.state {
            state if state.info().retry => {
                info!("Retrying connection from {}", state);
                let host = self.hosts.primary().to_string();
                self.start_transport(host);
            }
            ConnectionState::Connecting => {
                info!("Connection attempt timed out");
                let host = self.transport.as_ref().map(|t| t.host.clone());
                self.abort_transport(ErrorInfo::timed_out());
                self.probe = None;
                self.on_disconnected_indication(None, host);
            }
            ConnectionState::Closing => {
                info!("No CLOSED from service; closing anyway");
                self.close_transport(false);
                self.set_closed();
            }
            _ => {}
        }
    }

    fn on_transport_unavailable(&mut self, reason: Option<ErrorInfo>) {
        let host = self.transport.take().map(|t| t.host);
        match self.state {
            ConnectionState::Closing => self.set_closed(),
            ConnectionState::Connecting | ConnectionState::Connected => {
                if let Some(ref reason) = reason {
                    info!("Transport lost: {}", reason);
                }
                if self.state == ConnectionState::Connected {
                    self.suspend_deadline = self.now + self.connection_state_ttl;
                }
                self.on_disconnected_indication(reason, host);
            }
            state => debug!("Transport unavailable while {}", state),
        }
    }

    /// Decides what a lost or failed transport turns into: a fallback
    /// attempt (after a connectivity check), disconnected, or suspended.
    fn on_disconnected_indication(&mut self, reason: Option<ErrorInfo>, host: Option<String>) {
        let retriable = reason.as_ref().map_or(true, ErrorInfo::is_retriable);
        if let Some(host) = host {
            if retriable && self.hosts.fallback(&host).is_some() {
                self.next_probe_id += 1;
                let id = self.next_probe_id;
                debug!("Checking connectivity before leaving {}", host);
                self.probe = Some(PendingProbe { id, host, reason });
                self.effects.push(Effect::CheckConnectivity { probe_id: id });
                return;
            }
        }
        self.settle_disconnected(reason);
    }

    fn on_connectivity_checked(&mut self, probe_id: u64, ok: bool) {
        if self.probe.as_ref().map(|p| p.id) != Some(probe_id) {
            debug!("Ignoring stale connectivity result {}", probe_id);
            return;
        }
        let Some(probe) = self.probe.take() else {
            return;
        };
        if ok {
            if let Some(next) = self.hosts.fallback(&probe.host).map(str::to_string) {
                info!("{} unreachable, falling back to {}", probe.host, next);
                self.start_transport(next);
                return;
            }
        } else {
            info!("No internet connectivity");
        }
        self.settle_disconnected(probe.reason);
    }

    fn settle_disconnected(&mut self, reason: Option<ErrorInfo>) {
        if self.now >= self.suspend_deadline {
            self.set_state(ConnectionState::Suspended, None);
        } else {
            self.set_state(ConnectionState::Disconnected, reason);
        }
    }

    fn on_protocol_message(&mut self, message: ProtocolMessage) {
        if message.connection_serial.is_some() && message.connection_serial != self.connection_serial {
            self.connection_serial = message.connection_serial;
            self.publish_snapshot();
        }

        match message.action {
            Action::Connected => self.on_connected(message),
            Action::Disconnected => self.on_disconnected_message(message),
            Action::Closed if message.error.is_none() => {
                self.close_transport(true);
                self.set_closed();
            }
            Action::Closed | Action::Error => self.on_error(message),
            Action::Ack | Action::Nack => self.on_ack(message),
            Action::Heartbeat => self.on_heartbeat(),
            _ => self.channels.on_message(message, self.now),
        }
    }

    fn on_connected(&mut self, message: ProtocolMessage) {
        let ProtocolMessage {
            connection_id,
            connection_details,
            error,
            ..
        } = message;
        let details = connection_details.unwrap_or_default();
        let was_connected = self.state == ConnectionState::Connected;
        let resumed = self.connection_id.is_some() && connection_id == self.connection_id;

        if was_connected {
            debug!("Connection details updated");
        } else if resumed {
            debug!(
                "Connection {:?} resumed; resending {} pending",
                connection_id,
                self.pending.len()
            );
            self.resend_pending();
        } else {
            if self.connection_id.is_some() {
                if let Some(ref error) = error {
                    warn!("Connection not resumed: {}", error);
                    self.channels.suspend_all(Some(error.clone()));
                }
            }
            // Old serials mean nothing to the new connection.
            let stale = self.pending.reset(0);
            for mut queued in stale.into_iter().rev() {
                queued.message.msg_serial = None;
                self.queue.push_front(queued);
            }
        }

        self.connection_id = connection_id;
        if details.connection_key.is_some() {
            self.connection_key = details.connection_key;
        }
        if let Some(ttl) = details.connection_state_ttl {
            self.connection_state_ttl = Duration::from_millis(ttl);
        }
        self.suspend_deadline = self.now + self.connection_state_ttl;
        self.retry_backoff = RetryBackoffBuilder::new(self.options.disconnected_retry_timeout()).build();

        if was_connected {
            self.error_reason = error;
            self.publish_snapshot();
            return;
        }
        self.set_state(ConnectionState::Connected, error);
        self.channels.on_connected(self.now);
    }

    fn resend_pending(&mut self) {
        let Some(active) = self.transport.as_mut() else {
            return;
        };
        for queued in self.pending.iter() {
            if let Err(e) = active.transport.send(queued.message.clone()) {
                warn!("Resend on transport {} failed: {}", active.id, e);
                break;
            }
        }
    }

    fn on_disconnected_message(&mut self, message: ProtocolMessage) {
        let host = self.transport.as_ref().map(|t| t.host.clone());
        self.close_transport(false);
        if self.state == ConnectionState::Connected {
            self.suspend_deadline = self.now + self.connection_state_ttl;
        }
        self.on_disconnected_indication(message.error, host);
    }

    fn on_error(&mut self, message: ProtocolMessage) {
        if message.channel.is_some() {
            self.channels.on_message(message, self.now);
            return;
        }
        let reason = message.error.unwrap_or_else(ErrorInfo::failed);
        warn!("Connection failed: {}", reason);
        self.connection_key = None;
        self.close_transport(false);
        self.probe = None;
        self.set_state(ConnectionState::Failed, Some(reason));
    }

    fn on_ack(&mut self, message: ProtocolMessage) {
        let Some(serial) = message.msg_serial else {
            warn!("{:?} without msgSerial", message.action);
            return;
        };
        let count = message.count.unwrap_or(1);
        match message.action {
            Action::Ack => self.pending.ack(serial, count, message.error),
            _ => self.pending.nack(serial, count, message.error),
        }
    }

    fn dispose(&mut self) {
        info!("Disposing connection");
        self.probe = None;
        self.abort_transport(ErrorInfo::closed());
        if !self.state.info().terminal {
            self.set_closed();
        }
        self.deadline = None;
    }

    fn start_transport(&mut self, host: String) {
        self.abort_transport(ErrorInfo::disconnected());
        self.next_transport_id += 1;
        let id = self.next_transport_id;

        let params = TransportParams {
            host: host.clone(),
            port: self.options.effective_port(),
            tls: self.options.tls,
            key: self.options.key.clone(),
            client_id: self.options.client_id.clone(),
            resume: self.connection_key.clone(),
            connection_serial: self.connection_serial,
            echo: self.options.echo_messages,
        };
        info!("Connecting to {} (transport {})", host, id);
        let mut transport = self.factory.create(params);
        transport.connect(TransportListener::new(id, self.inbox.clone()));
        self.transport = Some(ActiveTransport {
            id,
            host,
            transport,
        });
        self.set_state(ConnectionState::Connecting, None);
    }

    fn abort_transport(&mut self, reason: ErrorInfo) {
        if let Some(mut active) = self.transport.take() {
            active.transport.abort(reason);
        }
    }

    fn close_transport(&mut self, graceful: bool) {
        if let Some(mut active) = self.transport.take() {
            active.transport.close(graceful);
        }
    }

    fn set_closed(&mut self) {
        self.connection_key = None;
        self.connection_serial = None;
        self.set_state(ConnectionState::Closed, None);
    }

    fn set_state(&mut self, state: ConnectionState, reason: Option<ErrorInfo>) {
        let previous = self.state;
        let info = state.info();
        let retry_in = self.arm_deadline(state);
        let reason = reason.or_else(|| info.default_error());

        self.state = state;
        self.error_reason = reason.clone();
        self.publish_snapshot();

        match (&reason, retry_in) {
            (Some(reason), Some(retry_in)) => info!(
                "Connection: {} -> {} ({}); retrying in {:.1}s",
                previous,
                state,
                reason,
                retry_in.as_secs_f64()
            ),
            (Some(reason), None) => info!("Connection: {} -> {} ({})", previous, state, reason),
            (None, _) => info!("Connection: {} -> {}", previous, state),
        }

        // No listeners is fine.
        let _ = self.state_tx.send(ConnectionStateChange {
            previous,
            current: state,
            retry_in,
            reason: reason.clone(),
        });

        if info.send_events {
            self.flush_queue();
        } else if !info.queue_events {
            let failure = reason
                .clone()
                .unwrap_or_else(|| ErrorInfo::not_connected(state));
            self.fail_outbound(&failure);
        }

        self.channels.on_connection_state(state, reason.as_ref());
    }

    /// Arms the expiry of `state` and returns the retry delay for
    /// retrying states.
    fn arm_deadline(&mut self, state: ConnectionState) -> Option<Duration> {
        let timeout = match state {
            ConnectionState::Connecting | ConnectionState::Closing => {
                Some(self.options.connecting_timeout())
            }
            ConnectionState::Disconnected => self.retry_backoff.next(),
            ConnectionState::Suspended => Some(BackoffStrategy::delay(
                self.options.suspended_retry_timeout(),
                1,
            )),
            _ => None,
        };
        self.deadline = timeout.map(|timeout| self.now + timeout);
        timeout.filter(|_| state.info().retry)
    }

    fn fail_outbound(&mut self, reason: &ErrorInfo) {
        let queued = self.queue.len();
        let pending = self.pending.len();
        if queued + pending > 0 {
            info!(
                "Failing {} queued and {} pending messages: {}",
                queued, pending, reason
            );
        }
        for message in self.queue.drain(..) {
            message.completion.fail(reason.clone());
        }
        self.pending.fail_all(reason);
        for ping in self.pings.drain(..) {
            ping.completion.fail(reason.clone());
        }
    }

    fn publish_snapshot(&self) {
        self.snapshot.send_replace(Connection {
            id: self.connection_id.clone(),
            key: self.connection_key.clone(),
            serial: self.connection_serial,
            state: self.state,
            error_reason: self.error_reason.clone(),
            host: self.transport.as_ref().map(|t| t.host.clone()),
        });
    }
}
