//! Serial-indexed queue of messages awaiting ACK/NACK.

use std::collections::VecDeque;

use tracing::{debug, warn};

use crate::common::error::ErrorInfo;
use crate::common::types::QueuedMessage;

/// In-flight messages in serial order. The head always carries
/// `start_serial`; entry `i` carries `start_serial + i`.
#[derive(Debug, Default)]
pub struct PendingMessageQueue {
    start_serial: i64,
    queue: VecDeque<QueuedMessage>,
    clip_events: u64,
}

impl PendingMessageQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Serial of the oldest unacknowledged message.
    pub fn start_serial(&self) -> i64 {
        self.start_serial
    }

    /// Serial the next pushed message must carry.
    pub fn next_serial(&self) -> i64 {
        self.start_serial + self.queue.len() as i64
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// How many ACK/NACK ranges had to be clipped to fit the queue.
    pub fn clip_events(&self) -> u64 {
        self.clip_events
    }

    pub fn iter(&self) -> impl Iterator<Item = &QueuedMessage> {
        self.queue.iter()
    }

    /// Appends a message whose `msg_serial` was taken from
    /// [`PendingMessageQueue::next_serial`].
    pub fn push(&mut self, message: QueuedMessage) {
        debug_assert_eq!(message.message.msg_serial, Some(self.next_serial()));
        self.queue.push_back(message);
    }

    /// Resolves `[serial, serial + count)` as delivered. Anything older than
    /// `serial` still in the queue is treated as rejected.
    pub fn ack(&mut self, serial: i64, count: u32, reason: Option<ErrorInfo>) {
        let (mut serial, mut count) = self.clip_underflow("ack", serial, count as i64);

        if serial > self.start_serial {
            let gap = serial.saturating_sub(self.start_serial);
            warn!(
                serial,
                start_serial = self.start_serial,
                gap,
                "ACK skips unacknowledged messages; treating them as rejected"
            );
            let nacked = self.take_head("ack", gap);
            if (nacked.len() as i64) < gap {
                // Queue ran dry before reaching the acked serial.
                serial = self.start_serial;
                count = 0;
            }
            let reason = reason.clone().unwrap_or_else(ErrorInfo::nack_default);
            for message in nacked {
                message.completion.fail(reason.clone());
            }
        }

        if serial == self.start_serial && count > 0 {
            let acked = self.take_head("ack", count);
            debug!(serial, count = acked.len(), "ACK");
            for message in acked {
                message.completion.succeed();
            }
        }
    }

    /// Resolves `[start_serial, serial + count)` as rejected with `reason`.
    pub fn nack(&mut self, serial: i64, count: u32, reason: Option<ErrorInfo>) {
        let (serial, count) = self.clip_underflow("nack", serial, count as i64);
        // A NACK beyond the head also rejects everything before it.
        let count = count.saturating_add(serial.saturating_sub(self.start_serial));

        let reason = reason.unwrap_or_else(ErrorInfo::nack_default);
        let nacked = self.take_head("nack", count);
        debug!(serial, count = nacked.len(), reason = %reason, "NACK");
        for message in nacked {
            message.completion.fail(reason.clone());
        }
    }

    /// Fails every pending message and empties the queue. `start_serial`
    /// advances past them.
    pub fn fail_all(&mut self, reason: &ErrorInfo) {
        let count = self.queue.len() as i64;
        for message in self.take_head("fail", count) {
            message.completion.fail(reason.clone());
        }
    }

    /// Removes every pending message without resolving it and restarts
    /// serial numbering at `start_serial`. Used when a new connection
    /// identity makes the old serials meaningless.
    pub fn reset(&mut self, start_serial: i64) -> Vec<QueuedMessage> {
        self.start_serial = start_serial;
        self.queue.drain(..).collect()
    }

    /// Brings a range that starts before `start_serial` into the queue.
    fn clip_underflow(&mut self, kind: &str, serial: i64, count: i64) -> (i64, i64) {
        if serial >= self.start_serial {
            return (serial, count);
        }
        self.clip_events += 1;
        warn!(
            kind,
            serial,
            count,
            start_serial = self.start_serial,
            "Range starts before oldest pending message; clipping"
        );
        let clipped = count
            .saturating_sub(self.start_serial.saturating_sub(serial))
            .max(0);
        (self.start_serial, clipped)
    }

    /// Removes up to `count` messages from the head, advancing
    /// `start_serial` by the number actually removed.
    fn take_head(&mut self, kind: &str, count: i64) -> Vec<QueuedMessage> {
        let available = self.queue.len() as i64;
        if count > available {
            self.clip_events += 1;
            warn!(
                kind,
                count,
                pending = available,
                start_serial = self.start_serial,
                "Range extends past newest pending message; clipping"
            );
        }
        let take = count.clamp(0, available) as usize;
        self.start_serial += take as i64;
        self.queue.drain(..take).collect()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use super::*;
    use crate::common::types::{Completion, Outcome};
    use crate::protocol::{Message, ProtocolMessage};

    type Log = Arc<Mutex<Vec<(usize, Outcome)>>>;

    fn make_test_queue(count: usize, start: i64) -> (PendingMessageQueue, Log) {
        let log: Log = Arc::new(Mutex::new(Vec::new()));
        let mut queue = PendingMessageQueue::new();
        queue.reset(start);
        for i in 0..count {
            let mut message = ProtocolMessage::publish(
                "chat",
                vec![Message::new("m", serde_json::json!(i))],
            );
            message.msg_serial = Some(queue.next_serial());
            let log = log.clone();
            let completion = Completion::from_fn(move |outcome| log.lock().unwrap().push((i, outcome)));
            queue.push(QueuedMessage::new(message, completion));
        }
        (queue, log)
    }

    fn outcomes(log: &Log) -> Vec<(usize, bool)> {
        log.lock()
            .unwrap()
            .iter()
            .map(|(i, outcome)| (*i, outcome.is_ok()))
            .collect()
    }

    #[test]
    fn test_ack_everything() {
        let (mut queue, log) = make_test_queue(4, 0);
        queue.ack(0, 4, None);

        assert!(queue.is_empty());
        assert_eq!(queue.start_serial(), 4);
        assert_eq!(outcomes(&log), vec![(0, true), (1, true), (2, true), (3, true)]);
        assert_eq!(queue.clip_events(), 0);
    }

    #[test]
    fn test_ack_gap_nacks_head() {
        let (mut queue, log) = make_test_queue(4, 0);
        queue.ack(1, 3, None);

        assert!(queue.is_empty());
        assert_eq!(queue.start_serial(), 4);
        assert_eq!(outcomes(&log), vec![(0, false), (1, true), (2, true), (3, true)]);
        let failure = log.lock().unwrap()[0].1.clone().unwrap_err();
        assert_eq!(failure, ErrorInfo::nack_default());
    }

    #[test]
    fn test_nack_oldest() {
        let (mut queue, log) = make_test_queue(3, 0);
        let reason = ErrorInfo::new("rejected", 400, 40000);
        queue.nack(0, 1, Some(reason.clone()));

        assert_eq!(queue.start_serial(), 1);
        assert_eq!(queue.len(), 2);
        assert_eq!(log.lock().unwrap().as_slice(), &[(0, Err(reason))]);
    }

    #[test]
    fn test_ack_underflow_is_clipped() {
        let (mut queue, log) = make_test_queue(3, 5);
        // Serials 3 and 4 were already resolved; only 5 and 6 remain in range.
        queue.ack(3, 4, None);

        assert_eq!(queue.start_serial(), 7);
        assert_eq!(queue.len(), 1);
        assert_eq!(outcomes(&log), vec![(0, true), (1, true)]);
        assert_eq!(queue.clip_events(), 1);
    }

    #[test]
    fn test_ack_entirely_stale_is_noop() {
        let (mut queue, log) = make_test_queue(2, 10);
        queue.ack(2, 3, None);

        assert_eq!(queue.start_serial(), 10);
        assert_eq!(queue.len(), 2);
        assert!(log.lock().unwrap().is_empty());
    }

    #[test]
    fn test_nack_underflow_is_clipped() {
        let (mut queue, log) = make_test_queue(3, 5);
        queue.nack(4, 2, None);

        assert_eq!(queue.start_serial(), 6);
        assert_eq!(outcomes(&log), vec![(0, false)]);
        assert_eq!(queue.clip_events(), 1);
    }

    #[test]
    fn test_nack_at_max_serial_rejects_everything() {
        let (mut queue, log) = make_test_queue(3, 0);
        queue.nack(i64::MAX, 5, None);

        assert!(queue.is_empty());
        assert_eq!(queue.start_serial(), 3);
        assert_eq!(outcomes(&log), vec![(0, false), (1, false), (2, false)]);
        assert_eq!(queue.clip_events(), 1);
    }

    #[test]
    fn test_ack_at_min_serial_is_clipped_away() {
        let (mut queue, log) = make_test_queue(3, 5);
        queue.ack(i64::MIN, 1, None);

        assert_eq!(queue.start_serial(), 5);
        assert_eq!(queue.len(), 3);
        assert!(log.lock().unwrap().is_empty());
        assert_eq!(queue.clip_events(), 1);
    }

    #[test]
    fn test_ack_at_max_serial_rejects_everything() {
        let (mut queue, log) = make_test_queue(2, 0);
        queue.ack(i64::MAX, u32::MAX, None);

        assert!(queue.is_empty());
        assert_eq!(queue.start_serial(), 2);
        assert_eq!(outcomes(&log), vec![(0, false), (1, false)]);
    }

    #[test]
    fn test_nack_ahead_of_head_covers_gap() {
        let (mut queue, log) = make_test_queue(4, 0);
        queue.nack(2, 1, None);

        assert_eq!(queue.start_serial(), 3);
        assert_eq!(outcomes(&log), vec![(0, false), (1, false), (2, false)]);
    }

    #[test]
    fn test_overrun_is_bounded_by_queue() {
        let (mut queue, log) = make_test_queue(2, 0);
        queue.ack(0, 10, None);

        assert!(queue.is_empty());
        assert_eq!(queue.start_serial(), 2);
        assert_eq!(queue.next_serial(), 2);
        assert_eq!(outcomes(&log).len(), 2);
        assert_eq!(queue.clip_events(), 1);
    }

    #[test]
    fn test_ack_beyond_queue_nacks_all() {
        let (mut queue, log) = make_test_queue(2, 0);
        queue.ack(5, 1, None);

        assert!(queue.is_empty());
        assert_eq!(queue.start_serial(), 2);
        assert_eq!(outcomes(&log), vec![(0, false), (1, false)]);
    }

    #[test]
    fn test_reset_returns_messages_unresolved() {
        let (mut queue, log) = make_test_queue(3, 7);
        let drained = queue.reset(0);

        assert_eq!(drained.len(), 3);
        assert_eq!(queue.start_serial(), 0);
        assert_eq!(queue.next_serial(), 0);
        assert!(log.lock().unwrap().is_empty());
    }

    #[test]
    fn test_fail_all() {
        let (mut queue, log) = make_test_queue(2, 0);
        queue.fail_all(&ErrorInfo::failed());

        assert!(queue.is_empty());
        assert_eq!(queue.start_serial(), 2);
        assert_eq!(outcomes(&log), vec![(0, false), (1, false)]);
    }
}
