//! Shared types used across the client.

use std::fmt;

use tokio::sync::oneshot;

use crate::common::error::ErrorInfo;
use crate::protocol::ProtocolMessage;

/// Outcome delivered to whoever is waiting on an outbound operation.
pub type Outcome = Result<(), ErrorInfo>;

/// A one-shot callback invoked with an [`Outcome`].
pub type Callback = Box<dyn FnOnce(Outcome) + Send + 'static>;

/// Who to notify when an outbound message is acked, nacked or failed.
///
/// Merging two queued messages joins their completions into a
/// [`Completion::Multicast`], so every original caller still hears back.
#[derive(Default)]
pub enum Completion {
    #[default]
    Ignore,
    Single(Callback),
    Multicast(Vec<Callback>),
}

impl Completion {
    pub fn from_fn(callback: impl FnOnce(Outcome) + Send + 'static) -> Self {
        Completion::Single(Box::new(callback))
    }

    /// A completion paired with a receiver that yields the outcome.
    pub fn channel() -> (Self, oneshot::Receiver<Outcome>) {
        let (tx, rx) = oneshot::channel();
        let completion = Completion::from_fn(move |outcome| {
            // Receiver dropped means the caller stopped caring.
            let _ = tx.send(outcome);
        });
        (completion, rx)
    }

    /// Fan-out of `self` and `other`.
    pub fn join(self, other: Completion) -> Completion {
        let mut callbacks = self.into_callbacks();
        callbacks.extend(other.into_callbacks());
        match callbacks.len() {
            0 => Completion::Ignore,
            _ => Completion::Multicast(callbacks),
        }
    }

    pub fn listener_count(&self) -> usize {
        match self {
            Completion::Ignore => 0,
            Completion::Single(_) => 1,
            Completion::Multicast(callbacks) => callbacks.len(),
        }
    }

    pub fn resolve(self, outcome: Outcome) {
        match self {
            Completion::Ignore => {}
            Completion::Single(callback) => callback(outcome),
            Completion::Multicast(callbacks) => {
                for callback in callbacks {
                    callback(outcome.clone());
                }
            }
        }
    }

    pub fn succeed(self) {
        self.resolve(Ok(()));
    }

    pub fn fail(self, reason: ErrorInfo) {
        self.resolve(Err(reason));
    }

    fn into_callbacks(self) -> Vec<Callback> {
        match self {
            Completion::Ignore => Vec::new(),
            Completion::Single(callback) => vec![callback],
            Completion::Multicast(callbacks) => callbacks,
        }
    }
}

impl fmt::Debug for Completion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Completion::Ignore => write!(f, "Ignore"),
            Completion::Single(_) => write!(f, "Single"),
            Completion::Multicast(callbacks) => write!(f, "Multicast({})", callbacks.len()),
        }
    }
}

/// An outbound message waiting to be sent or acknowledged.
#[derive(Debug)]
pub struct QueuedMessage {
    pub message: ProtocolMessage,
    pub completion: Completion,
    /// Set once another queued message has been folded into this one.
    pub merged: bool,
}

impl QueuedMessage {
    pub fn new(message: ProtocolMessage, completion: Completion) -> Self {
        Self {
            message,
            completion,
            merged: false,
        }
    }

    /// Folds `other` into this entry if the two messages are compatible.
    /// Returns `other` untouched when they are not.
    pub fn try_merge(&mut self, other: QueuedMessage) -> Result<(), QueuedMessage> {
        if !self.message.can_merge(&other.message) {
            return Err(other);
        }
        self.message.merge(other.message);
        let completion = std::mem::take(&mut self.completion);
        self.completion = completion.join(other.completion);
        self.merged = true;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use super::*;
    use crate::protocol::{Message, ProtocolMessage};

    fn recording(log: &Arc<Mutex<Vec<(usize, Outcome)>>>, tag: usize) -> Completion {
        let log = log.clone();
        Completion::from_fn(move |outcome| log.lock().unwrap().push((tag, outcome)))
    }

    #[test]
    fn test_multicast_notifies_every_listener() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let joined = recording(&log, 1).join(recording(&log, 2)).join(recording(&log, 3));
        assert_eq!(joined.listener_count(), 3);

        joined.fail(ErrorInfo::nack_default());
        let log = log.lock().unwrap();
        assert_eq!(log.len(), 3);
        assert!(log.iter().all(|(_, outcome)| outcome.is_err()));
    }

    #[test]
    fn test_join_with_ignore() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let joined = Completion::Ignore.join(recording(&log, 1));
        assert_eq!(joined.listener_count(), 1);
        assert_eq!(Completion::Ignore.join(Completion::Ignore).listener_count(), 0);
    }

    #[test]
    fn test_channel_completion() {
        let (completion, mut rx) = Completion::channel();
        completion.succeed();
        assert_eq!(rx.try_recv().unwrap(), Ok(()));
    }

    #[test]
    fn test_try_merge_marks_merged() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut head = QueuedMessage::new(
            ProtocolMessage::publish("chat", vec![Message::new("a", serde_json::json!(1))]),
            recording(&log, 1),
        );
        let tail = QueuedMessage::new(
            ProtocolMessage::publish("chat", vec![Message::new("b", serde_json::json!(2))]),
            recording(&log, 2),
        );
        assert!(head.try_merge(tail).is_ok());
        assert!(head.merged);
        assert_eq!(head.message.messages.as_ref().unwrap().len(), 2);

        head.completion.succeed();
        assert_eq!(log.lock().unwrap().len(), 2);
    }

    #[test]
    fn test_try_merge_rejects_incompatible() {
        let mut head = QueuedMessage::new(
            ProtocolMessage::attach("chat", None),
            Completion::Ignore,
        );
        let tail = QueuedMessage::new(
            ProtocolMessage::publish("chat", Vec::new()),
            Completion::Ignore,
        );
        let returned = head.try_merge(tail).unwrap_err();
        assert_eq!(returned.message.channel.as_deref(), Some("chat"));
        assert!(!head.merged);
    }
}
