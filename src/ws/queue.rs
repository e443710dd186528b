use std::collections::VecDeque;

use super::message::Message;

/// Outbound messages waiting for a connection, oldest first.
///
/// When a limit is set and the queue is full, pushing evicts the oldest entry.
#[derive(Debug, Default)]
pub(crate) struct OutboundQueue {
    items: VecDeque<Message>,
    limit: Option<usize>,
    dropped: u64,
}

impl OutboundQueue {
    pub(crate) fn new(limit: Option<usize>) -> Self {
        Self {
            items: VecDeque::new(),
            limit,
            dropped: 0,
        }
    }

    /// Append a message, returning the one evicted to make room, if any.
    pub(crate) fn push(&mut self, message: Message) -> Option<Message> {
        if self.limit == Some(0) {
            self.dropped = self.dropped.saturating_add(1);
            return Some(message);
        }

        self.items.push_back(message);
        self.evict_overflow().pop()
    }

    /// Put messages back at the front, keeping their relative order.
    ///
    /// Used for messages a dead socket accepted but never wrote; they are older than
    /// anything queued since.
    pub(crate) fn requeue_front(&mut self, messages: Vec<Message>) -> Vec<Message> {
        for message in messages.into_iter().rev() {
            self.items.push_front(message);
        }
        self.evict_overflow()
    }

    pub(crate) fn drain(&mut self) -> impl Iterator<Item = Message> + '_ {
        self.items.drain(..)
    }

    pub(crate) fn clear(&mut self) {
        self.items.clear();
    }

    pub(crate) fn len(&self) -> usize {
        self.items.len()
    }

    /// Total messages evicted since creation.
    pub(crate) fn dropped(&self) -> u64 {
        self.dropped
    }

    fn evict_overflow(&mut self) -> Vec<Message> {
        let Some(limit) = self.limit else {
            return Vec::new();
        };

        let excess = self.items.len().saturating_sub(limit);
        self.dropped = self.dropped.saturating_add(excess as u64);
        self.items.drain(..excess).collect()
    }
}
