//! Per-channel attach/detach state machine.
//!
//! Application calls (`attach`, `detach`, `publish`) run on the caller's
//! thread and only post requests to the connection worker. Everything else
//! (`on_message`, connection state propagation, deadline expiry) is called by
//! the connection worker through the [`ChannelRegistry`].
//!
//! [`ChannelRegistry`]: crate::channel::ChannelRegistry

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::channel::state::{ChannelEvent, ChannelState, ChannelStateChange};
use crate::common::error::{ClientError, ErrorInfo};
use crate::common::types::Completion;
use crate::connection::{ConnectionHandle, ConnectionState};
use crate::protocol::{Action, Message, ProtocolMessage, FLAG_HAS_PRESENCE, FLAG_RESUMED};

const EVENT_CAPACITY: usize = 64;
const MESSAGE_CAPACITY: usize = 256;

/// Handle to one named channel. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct Channel {
    inner: Arc<ChannelInner>,
}

struct ChannelInner {
    name: String,
    connection: ConnectionHandle,
    request_timeout: Duration,
    queue_messages: bool,
    status: Mutex<Status>,
    state_tx: broadcast::Sender<ChannelStateChange>,
    message_tx: broadcast::Sender<Message>,
}

#[derive(Debug)]
struct Status {
    state: ChannelState,
    reason: Option<ErrorInfo>,
    /// Expiry of the outstanding ATTACH/DETACH, or the retry time of a
    /// channel suspended by a failed attach.
    deadline: Option<Instant>,
    channel_serial: Option<String>,
    presence_sync_pending: bool,
}

impl Channel {
    pub(crate) fn new(
        name: impl Into<String>,
        connection: ConnectionHandle,
        request_timeout: Duration,
        queue_messages: bool,
    ) -> Self {
        let (state_tx, _) = broadcast::channel(EVENT_CAPACITY);
        let (message_tx, _) = broadcast::channel(MESSAGE_CAPACITY);
        Self {
            inner: Arc::new(ChannelInner {
                name: name.into(),
                connection,
                request_timeout,
                queue_messages,
                status: Mutex::new(Status {
                    state: ChannelState::Initialized,
                    reason: None,
                    deadline: None,
                    channel_serial: None,
                    presence_sync_pending: false,
                }),
                state_tx,
                message_tx,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn state(&self) -> ChannelState {
        self.lock().state
    }

    pub fn error_reason(&self) -> Option<ErrorInfo> {
        self.lock().reason.clone()
    }

    /// Set when the service announced members on attach and the presence
    /// set has not finished syncing.
    pub fn presence_sync_pending(&self) -> bool {
        self.lock().presence_sync_pending
    }

    pub fn on_state_change(&self) -> broadcast::Receiver<ChannelStateChange> {
        self.inner.state_tx.subscribe()
    }

    /// Messages delivered on this channel while attached.
    pub fn subscribe(&self) -> broadcast::Receiver<Message> {
        self.inner.message_tx.subscribe()
    }

    /// Requests attachment. While the connection is still coming up the
    /// channel waits in `attaching` and the ATTACH goes out once connected.
    pub fn attach(&self) -> Result<(), ClientError> {
        let mut status = self.lock();
        if matches!(status.state, ChannelState::Attached | ChannelState::Attaching) {
            return Ok(());
        }

        let connection_state = self.inner.connection.state();
        let info = connection_state.info();
        if info.send_events {
            self.send_attach(&mut status, None, Instant::now())
        } else if info.queue_events {
            debug!(
                "Channel {}: attach deferred until connected ({})",
                self.inner.name, connection_state
            );
            status.deadline = None;
            self.set_state(&mut status, ChannelState::Attaching, None, false);
            Ok(())
        } else {
            Err(ClientError::NotConnected {
                state: connection_state,
            })
        }
    }

    /// Attaches and waits for the outcome.
    pub async fn attach_and_wait(&self, timeout: Duration) -> Result<(), ClientError> {
        let mut changes = self.on_state_change();
        self.attach()?;

        let wait = async {
            loop {
                if let Some(outcome) = self.attach_outcome() {
                    return outcome;
                }
                match changes.recv().await {
                    Ok(_) | Err(RecvError::Lagged(_)) => continue,
                    Err(RecvError::Closed) => return Err(ClientError::Closed),
                }
            }
        };
        tokio::time::timeout(timeout, wait)
            .await
            .map_err(|_| ClientError::Timeout(timeout))?
    }

    pub fn detach(&self) -> Result<(), ClientError> {
        let mut status = self.lock();
        match status.state {
            ChannelState::Initialized | ChannelState::Detached | ChannelState::Failed => {
                Err(ClientError::InvalidChannelState {
                    channel: self.inner.name.clone(),
                    state: status.state,
                    operation: "detach",
                })
            }
            ChannelState::Detaching => Ok(()),
            ChannelState::Suspended => {
                status.deadline = None;
                self.set_state(&mut status, ChannelState::Detached, None, false);
                Ok(())
            }
            ChannelState::Attaching | ChannelState::Attached => {
                if self.inner.connection.state().info().send_events {
                    self.send_detach(&mut status, Instant::now())
                } else {
                    // Nothing attached on the service side yet.
                    status.deadline = None;
                    self.set_state(&mut status, ChannelState::Detached, None, false);
                    Ok(())
                }
            }
        }
    }

    /// Publishes and waits for the service's ACK or NACK.
    pub async fn publish(&self, messages: Vec<Message>) -> Result<(), ClientError> {
        let (completion, outcome) = Completion::channel();
        self.publish_with_listener(messages, completion)?;
        match outcome.await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(reason)) => Err(ClientError::from_failure(reason)),
            Err(_) => Err(ClientError::Closed),
        }
    }

    /// Publishes without waiting; `completion` hears the outcome.
    pub fn publish_with_listener(
        &self,
        messages: Vec<Message>,
        completion: Completion,
    ) -> Result<(), ClientError> {
        let state = self.state();
        if matches!(state, ChannelState::Failed | ChannelState::Suspended) {
            return Err(ClientError::InvalidChannelState {
                channel: self.inner.name.clone(),
                state,
                operation: "publish",
            });
        }
        let message = ProtocolMessage::publish(&self.inner.name, messages);
        self.inner
            .connection
            .send(message, self.inner.queue_messages, completion)
    }

    /// Handles a channel-scoped protocol message.
    pub(crate) fn on_message(&self, message: ProtocolMessage, now: Instant) {
        let mut status = self.lock();
        match message.action {
            Action::Attached => self.on_attached(&mut status, message),
            Action::Detached => self.on_detached(&mut status, message, now),
            Action::Error => {
                let reason = message.error.unwrap_or_else(|| {
                    ErrorInfo::channel_operation_failed(format!(
                        "Channel {} failed",
                        self.inner.name
                    ))
                });
                warn!("Channel {} error: {}", self.inner.name, reason);
                status.deadline = None;
                self.set_state(&mut status, ChannelState::Failed, Some(reason), false);
            }
            Action::Message => {
                if status.state != ChannelState::Attached {
                    debug!(
                        "Channel {}: dropping message while {}",
                        self.inner.name, status.state
                    );
                    return;
                }
                if message.channel_serial.is_some() {
                    status.channel_serial = message.channel_serial.clone();
                }
                for item in message.messages.unwrap_or_default() {
                    // No subscribers is fine.
                    let _ = self.inner.message_tx.send(item);
                }
            }
            Action::Sync => {
                if message
                    .channel_serial
                    .as_deref()
                    .map_or(true, sync_cursor_exhausted)
                {
                    status.presence_sync_pending = false;
                }
            }
            Action::Presence => {
                debug!("Channel {}: presence update", self.inner.name);
            }
            other => {
                debug!("Channel {}: ignoring {:?}", self.inner.name, other);
            }
        }
    }

    /// Re-drives the channel after the connection (re)connects.
    pub(crate) fn on_connected(&self, now: Instant) {
        let mut status = self.lock();
        let result = match status.state {
            ChannelState::Attaching | ChannelState::Attached | ChannelState::Suspended => {
                self.send_attach(&mut status, None, now)
            }
            ChannelState::Detaching => self.send_detach(&mut status, now),
            _ => Ok(()),
        };
        if let Err(e) = result {
            debug!("Channel {}: request not sent: {}", self.inner.name, e);
        }
    }

    /// Follows the connection into a state that breaks attachment.
    pub(crate) fn on_connection_state(&self, state: ConnectionState, reason: Option<&ErrorInfo>) {
        match state {
            ConnectionState::Suspended => self.suspend(reason.cloned()),
            ConnectionState::Closed => {
                let mut status = self.lock();
                if matches!(
                    status.state,
                    ChannelState::Attaching
                        | ChannelState::Attached
                        | ChannelState::Suspended
                        | ChannelState::Detaching
                ) {
                    status.deadline = None;
                    self.set_state(&mut status, ChannelState::Detached, None, false);
                }
            }
            ConnectionState::Failed => {
                let mut status = self.lock();
                if !matches!(
                    status.state,
                    ChannelState::Initialized | ChannelState::Detached | ChannelState::Failed
                ) {
                    status.deadline = None;
                    self.set_state(&mut status, ChannelState::Failed, reason.cloned(), false);
                }
            }
            _ => {}
        }
    }

    /// Suspends an attaching or attached channel; it reattaches on the next
    /// connection.
    pub(crate) fn suspend(&self, reason: Option<ErrorInfo>) {
        let mut status = self.lock();
        if matches!(status.state, ChannelState::Attaching | ChannelState::Attached) {
            status.deadline = None;
            self.set_state(&mut status, ChannelState::Suspended, reason, false);
        }
    }

    pub(crate) fn next_deadline(&self) -> Option<Instant> {
        self.lock().deadline
    }

    /// Applies an expired request or retry deadline.
    pub(crate) fn expire(&self, now: Instant) {
        let mut status = self.lock();
        match status.deadline {
            Some(deadline) if deadline <= now => status.deadline = None,
            _ => return,
        }

        match status.state {
            ChannelState::Attaching => {
                warn!("Channel {}: attach timed out", self.inner.name);
                self.set_state(
                    &mut status,
                    ChannelState::Suspended,
                    Some(ErrorInfo::channel_timeout("attach")),
                    false,
                );
                status.deadline = Some(now + self.inner.request_timeout);
            }
            ChannelState::Detaching => {
                warn!("Channel {}: detach timed out", self.inner.name);
                self.set_state(
                    &mut status,
                    ChannelState::Attached,
                    Some(ErrorInfo::channel_timeout("detach")),
                    true,
                );
            }
            ChannelState::Suspended => {
                if self.inner.connection.state() == ConnectionState::Connected {
                    if let Err(e) = self.send_attach(&mut status, None, now) {
                        debug!("Channel {}: retry attach not sent: {}", self.inner.name, e);
                    }
                }
            }
            _ => {}
        }
    }

    fn on_attached(&self, status: &mut Status, message: ProtocolMessage) {
        let resumed = message.has_flag(FLAG_RESUMED);
        match status.state {
            ChannelState::Attached => {
                status.presence_sync_pending = message.has_flag(FLAG_HAS_PRESENCE);
                if message.channel_serial.is_some() {
                    status.channel_serial = message.channel_serial;
                }
                if message.error.is_some() {
                    status.reason = message.error.clone();
                }
                let _ = self.inner.state_tx.send(ChannelStateChange {
                    event: ChannelEvent::Update,
                    current: ChannelState::Attached,
                    previous: ChannelState::Attached,
                    reason: message.error,
                    resumed,
                });
            }
            ChannelState::Attaching | ChannelState::Suspended => {
                status.presence_sync_pending = message.has_flag(FLAG_HAS_PRESENCE);
                if message.channel_serial.is_some() {
                    status.channel_serial = message.channel_serial;
                }
                status.deadline = None;
                self.set_state(status, ChannelState::Attached, message.error, resumed);
            }
            other => {
                debug!("Channel {}: ignoring ATTACHED while {}", self.inner.name, other);
            }
        }
    }

    fn on_detached(&self, status: &mut Status, message: ProtocolMessage, now: Instant) {
        match status.state {
            ChannelState::Detaching => {
                status.deadline = None;
                self.set_state(status, ChannelState::Detached, message.error, false);
            }
            ChannelState::Attached | ChannelState::Suspended => {
                warn!("Channel {}: detached by service, reattaching", self.inner.name);
                if let Err(e) = self.send_attach(status, message.error.clone(), now) {
                    debug!("Channel {}: reattach not sent: {}", self.inner.name, e);
                    self.set_state(status, ChannelState::Suspended, message.error, false);
                }
            }
            ChannelState::Attaching => {
                let reason = message.error.unwrap_or_else(|| {
                    ErrorInfo::channel_operation_failed(format!(
                        "Attach to {} refused",
                        self.inner.name
                    ))
                });
                warn!("Channel {}: attach refused: {}", self.inner.name, reason);
                self.set_state(status, ChannelState::Suspended, Some(reason), false);
                status.deadline = Some(now + self.inner.request_timeout);
            }
            other => {
                debug!("Channel {}: ignoring DETACHED while {}", self.inner.name, other);
            }
        }
    }

    fn send_attach(
        &self,
        status: &mut Status,
        reason: Option<ErrorInfo>,
        now: Instant,
    ) -> Result<(), ClientError> {
        let message = ProtocolMessage::attach(&self.inner.name, status.channel_serial.clone());
        // Not queued: a channel left attaching is re-driven on reconnect.
        self.inner.connection.send(message, false, Completion::Ignore)?;
        status.deadline = Some(now + self.inner.request_timeout);
        if status.state != ChannelState::Attaching || reason.is_some() {
            self.set_state(status, ChannelState::Attaching, reason, false);
        }
        Ok(())
    }

    fn send_detach(&self, status: &mut Status, now: Instant) -> Result<(), ClientError> {
        let message = ProtocolMessage::detach(&self.inner.name);
        self.inner.connection.send(message, false, Completion::Ignore)?;
        status.deadline = Some(now + self.inner.request_timeout);
        if status.state != ChannelState::Detaching {
            self.set_state(status, ChannelState::Detaching, None, false);
        }
        Ok(())
    }

    fn set_state(
        &self,
        status: &mut Status,
        state: ChannelState,
        reason: Option<ErrorInfo>,
        resumed: bool,
    ) {
        let previous = status.state;
        status.state = state;
        status.reason = reason.clone();

        match reason {
            Some(ref reason) => info!(
                "Channel {}: {} -> {} ({})",
                self.inner.name, previous, state, reason
            ),
            None => info!("Channel {}: {} -> {}", self.inner.name, previous, state),
        }

        let _ = self.inner.state_tx.send(ChannelStateChange {
            event: state.event(),
            current: state,
            previous,
            reason,
            resumed,
        });
    }

    fn attach_outcome(&self) -> Option<Result<(), ClientError>> {
        let status = self.lock();
        match status.state {
            ChannelState::Attached => Some(Ok(())),
            ChannelState::Failed | ChannelState::Suspended | ChannelState::Detached => {
                let reason = status.reason.clone().unwrap_or_else(|| {
                    ErrorInfo::channel_operation_failed(format!(
                        "Channel {} is {}",
                        self.inner.name, status.state
                    ))
                });
                Some(Err(ClientError::Service(reason)))
            }
            _ => None,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Status> {
        self.inner
            .status
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("name", &self.inner.name)
            .field("state", &self.state())
            .finish()
    }
}

/// SYNC serials are `<sequence>:<cursor>`; an empty cursor ends the sync.
fn sync_cursor_exhausted(serial: &str) -> bool {
    serial
        .split_once(':')
        .map_or(true, |(_, cursor)| cursor.is_empty())
}
