//! Bounded replay buffer bridging the gap between "socket open" and
//! "workspace paired".
//!
//! Entries are kept in submission order. Past capacity the oldest entry is
//! evicted; entries older than the TTL are discarded at drain time instead of
//! being delivered.

use std::{
    collections::VecDeque,
    time::{Duration, Instant},
};

use crate::protocol::{InputRequest, PeerMessage};

pub const DEFAULT_QUEUE_CAPACITY: usize = 100;
pub const DEFAULT_QUEUE_TTL: Duration = Duration::from_secs(300);
pub const DEFAULT_MAX_RETRIES: u32 = 3;

#[derive(Debug, Clone, PartialEq)]
pub enum QueuedMessage {
    /// A request that reached us before pairing was confirmed.
    Inbound(InputRequest),
    /// A message waiting for a live, paired socket.
    Outbound(PeerMessage),
}

#[derive(Debug, Clone, PartialEq)]
pub struct MessageQueueEntry {
    pub message: QueuedMessage,
    pub timestamp: Instant,
    pub retry_count: u32,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct DrainReport {
    pub expired: usize,
}

#[derive(Debug)]
pub struct MessageQueue {
    capacity: usize,
    ttl: Duration,
    max_retries: u32,
    entries: VecDeque<MessageQueueEntry>,
}

impl MessageQueue {
    pub fn new(capacity: usize, ttl: Duration, max_retries: u32) -> Self {
        Self {
            capacity: capacity.max(1),
            ttl,
            max_retries,
            entries: VecDeque::new(),
        }
    }

    /// Append a message. Returns the entry evicted to make room, if any.
    pub fn push(&mut self, message: QueuedMessage, now: Instant) -> Option<MessageQueueEntry> {
        self.entries.push_back(MessageQueueEntry {
            message,
            timestamp: now,
            retry_count: 0,
        });
        if self.entries.len() > self.capacity {
            let evicted = self.entries.pop_front();
            if evicted.is_some() {
                tracing::warn!(
                    target = "ask_broker::queue",
                    capacity = self.capacity,
                    "message queue full, evicted oldest entry"
                );
            }
            return evicted;
        }
        None
    }

    /// Take every entry still within its TTL, oldest first. Expired entries
    /// are dropped and counted.
    pub fn drain_live(&mut self, now: Instant) -> (Vec<MessageQueueEntry>, DrainReport) {
        let mut report = DrainReport::default();
        let mut live = Vec::with_capacity(self.entries.len());
        for entry in self.entries.drain(..) {
            if now.saturating_duration_since(entry.timestamp) >= self.ttl {
                report.expired += 1;
                continue;
            }
            live.push(entry);
        }
        (live, report)
    }

    /// Put back an entry whose delivery failed. Once the retry limit is
    /// exceeded the entry is handed back to the caller as dropped.
    pub fn requeue(&mut self, mut entry: MessageQueueEntry) -> Result<(), MessageQueueEntry> {
        entry.retry_count += 1;
        if entry.retry_count > self.max_retries {
            return Err(entry);
        }
        self.entries.push_back(entry);
        if self.entries.len() > self.capacity {
            self.entries.pop_front();
        }
        Ok(())
    }

    pub fn clear(&mut self) -> usize {
        let dropped = self.entries.len();
        self.entries.clear();
        dropped
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
