//! Backpressure buffering of event groups.
//!
//! Groups produced while the consumer is not accepting data are queued and
//! handed over in production order once it is. A group the consumer refuses
//! goes back to the front of the queue, so nothing is lost, reordered or
//! delivered twice.

use std::collections::VecDeque;

use tokio::sync::mpsc;

use crate::event::EventGroup;

/// Result of offering a group to the consumer.
#[derive(Debug)]
pub enum Offer {
    /// The consumer took the group.
    Accepted,

    /// The consumer cannot take more right now; the group is handed back.
    Full(EventGroup),

    /// The consumer is gone; the group is handed back.
    Closed(EventGroup),
}

/// The consumer side of event delivery.
pub trait EventSink {
    /// Offer a group without waiting.
    fn offer(&mut self, group: EventGroup) -> Offer;
}

impl EventSink for mpsc::Sender<EventGroup> {
    fn offer(&mut self, group: EventGroup) -> Offer {
        match self.try_send(group) {
            Ok(()) => Offer::Accepted,
            Err(mpsc::error::TrySendError::Full(group)) => Offer::Full(group),
            Err(mpsc::error::TrySendError::Closed(group)) => Offer::Closed(group),
        }
    }
}

/// How a flush ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushOutcome {
    /// Every queued group was delivered.
    Drained,

    /// The consumer stopped accepting; the rest stays queued.
    Blocked,

    /// The consumer disconnected.
    Disconnected,
}

/// FIFO of undelivered event groups.
#[derive(Debug, Default)]
pub struct BackpressureBuffer {
    queue: VecDeque<EventGroup>,
}

impl BackpressureBuffer {
    /// Create an empty buffer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a group behind everything already buffered.
    pub fn enqueue(&mut self, group: EventGroup) {
        self.queue.push_back(group);
    }

    /// Deliver queued groups in order until drained or refused.
    pub fn flush<S: EventSink + ?Sized>(&mut self, sink: &mut S) -> FlushOutcome {
        while let Some(group) = self.queue.pop_front() {
            match sink.offer(group) {
                Offer::Accepted => {}
                Offer::Full(group) => {
                    self.queue.push_front(group);
                    return FlushOutcome::Blocked;
                }
                Offer::Closed(group) => {
                    self.queue.push_front(group);
                    return FlushOutcome::Disconnected;
                }
            }
        }
        FlushOutcome::Drained
    }

    /// Number of queued groups.
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    /// Whether nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}
