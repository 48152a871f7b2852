//! All channels of one client, and the fan-out of connection events to them.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::time::Instant;
use tracing::debug;

use crate::channel::channel::Channel;
use crate::common::error::ErrorInfo;
use crate::connection::{ConnectionHandle, ConnectionState};
use crate::protocol::ProtocolMessage;

pub struct ChannelRegistry {
    connection: ConnectionHandle,
    request_timeout: Duration,
    queue_messages: bool,
    channels: Mutex<HashMap<String, Channel>>,
}

impl ChannelRegistry {
    pub fn new(connection: ConnectionHandle, request_timeout: Duration, queue_messages: bool) -> Self {
        Self {
            connection,
            request_timeout,
            queue_messages,
            channels: Mutex::new(HashMap::new()),
        }
    }

    /// Returns the channel called `name`, creating it on first use.
    pub fn get(&self, name: &str) -> Channel {
        self.lock()
            .entry(name.to_string())
            .or_insert_with(|| {
                Channel::new(
                    name,
                    self.connection.clone(),
                    self.request_timeout,
                    self.queue_messages,
                )
            })
            .clone()
    }

    pub fn existing(&self, name: &str) -> Option<Channel> {
        self.lock().get(name).cloned()
    }

    /// Forgets a channel. Outstanding clones keep working but no longer
    /// receive connection events.
    pub fn release(&self, name: &str) -> Option<Channel> {
        self.lock().remove(name)
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.lock().keys().cloned().collect();
        names.sort();
        names
    }

    pub(crate) fn on_connected(&self, now: Instant) {
        for channel in self.all() {
            channel.on_connected(now);
        }
    }

    pub(crate) fn on_connection_state(&self, state: ConnectionState, reason: Option<&ErrorInfo>) {
        for channel in self.all() {
            channel.on_connection_state(state, reason);
        }
    }

    pub(crate) fn suspend_all(&self, reason: Option<ErrorInfo>) {
        for channel in self.all() {
            channel.suspend(reason.clone());
        }
    }

    /// Routes a channel-scoped message to its channel.
    pub(crate) fn on_message(&self, message: ProtocolMessage, now: Instant) {
        let Some(name) = message.channel.as_deref() else {
            debug!("Dropping {:?} without a channel", message.action);
            return;
        };
        let Some(channel) = self.existing(name) else {
            debug!("Dropping {:?} for unknown channel {}", message.action, name);
            return;
        };
        channel.on_message(message, now);
    }

    pub(crate) fn next_deadline(&self) -> Option<Instant> {
        self.all().iter().filter_map(Channel::next_deadline).min()
    }

    pub(crate) fn expire(&self, now: Instant) {
        for channel in self.all() {
            channel.expire(now);
        }
    }

    /// Snapshot taken so channel callbacks never run under the map lock.
    fn all(&self) -> Vec<Channel> {
        self.lock().values().cloned().collect()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Channel>> {
        self.channels.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use tokio::sync::{broadcast, mpsc, watch};

    use super::*;
    use crate::channel::ChannelState;
    use crate::connection::core::Event;
    use crate::connection::Connection;
    use crate::protocol::Action;

    struct TestRegistry {
        registry: ChannelRegistry,
        _snapshot: watch::Sender<Connection>,
        _inbox: mpsc::UnboundedReceiver<Event>,
    }

    fn make_test_registry() -> TestRegistry {
        let (inbox_tx, inbox) = mpsc::unbounded_channel();
        let (snapshot, snapshot_rx) = watch::channel(Connection {
            state: ConnectionState::Connected,
            ..Connection::default()
        });
        let (state_tx, _) = broadcast::channel(8);
        let handle = ConnectionHandle::new(inbox_tx, snapshot_rx, state_tx);
        TestRegistry {
            registry: ChannelRegistry::new(handle, Duration::from_secs(10), true),
            _snapshot: snapshot,
            _inbox: inbox,
        }
    }

    #[test]
    fn test_get_returns_same_channel() {
        let test = make_test_registry();
        let registry = &test.registry;
        let first = registry.get("chat");
        first.attach().unwrap();
        let second = registry.get("chat");
        assert_eq!(second.state(), ChannelState::Attaching);
        assert_eq!(registry.names(), vec!["chat"]);
    }

    #[test]
    fn test_release() {
        let test = make_test_registry();
        let registry = &test.registry;
        registry.get("chat");
        assert!(registry.release("chat").is_some());
        assert!(registry.existing("chat").is_none());
    }

    #[test]
    fn test_routes_by_name() {
        let test = make_test_registry();
        let registry = &test.registry;
        let chat = registry.get("chat");
        let news = registry.get("news");
        chat.attach().unwrap();
        news.attach().unwrap();

        registry.on_message(
            ProtocolMessage::for_channel(Action::Attached, "news"),
            Instant::now(),
        );
        assert_eq!(chat.state(), ChannelState::Attaching);
        assert_eq!(news.state(), ChannelState::Attached);

        // Unknown channels are ignored.
        registry.on_message(
            ProtocolMessage::for_channel(Action::Attached, "other"),
            Instant::now(),
        );
        assert!(registry.existing("other").is_none());
    }

    #[test]
    fn test_suspend_all_and_deadlines() {
        let test = make_test_registry();
        let registry = &test.registry;
        let chat = registry.get("chat");
        let idle = registry.get("idle");
        chat.attach().unwrap();
        assert!(registry.next_deadline().is_some());

        registry.suspend_all(Some(ErrorInfo::suspended()));
        assert_eq!(chat.state(), ChannelState::Suspended);
        assert_eq!(idle.state(), ChannelState::Initialized);
        assert!(registry.next_deadline().is_none());
    }
}
