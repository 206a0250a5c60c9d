//! Bounded per-destination envelope queue.

use std::collections::VecDeque;

use super::{Delivery, Message};
use crate::error::{Error, Result};

/// FIFO of envelopes waiting for their consumer.
///
/// When full, discardable envelopes are dropped and counted; important ones
/// are refused with [`Error::QueueFull`] so the sender learns about it.
#[derive(Debug)]
pub struct MessageQueue {
    items: VecDeque<Message>,
    capacity: usize,
    dropped: u64,
}

impl MessageQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            items: VecDeque::new(),
            capacity,
            dropped: 0,
        }
    }

    /// Enqueue an envelope, applying the backpressure policy.
    pub fn push(&mut self, message: Message) -> Result<Delivery> {
        if self.items.len() >= self.capacity {
            if message.is_discardable() {
                self.dropped += 1;
                crate::debug_router!(to = %message.to(), dropped = self.dropped, "queue full, dropping");
                return Ok(Delivery::Dropped);
            }
            return Err(Error::QueueFull(message.to()));
        }
        self.items.push_back(message);
        Ok(Delivery::Delivered)
    }

    pub fn pop(&mut self) -> Option<Message> {
        self.items.pop_front()
    }

    pub fn peek(&self) -> Option<&Message> {
        self.items.front()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.items.len() >= self.capacity
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Discardable envelopes dropped because the queue was full.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    /// Drop everything queued.
    pub fn flush(&mut self) {
        self.items.clear();
    }
}
