use std::collections::{HashSet, VecDeque};
use std::sync::Arc;

use serde_json::Value;

use crate::message::Message;

/// Bounded, ordered ring of the most recent messages.
///
/// Ids are strictly increasing and allocated from one global counter, not
/// per-channel. Eviction is FIFO and silent: a subscriber whose watermark
/// predates the oldest retained message resumes with a gap — bounded lossy
/// replay is the contract, not a defect.
#[derive(Debug)]
pub struct ReplayBuffer {
    entries: VecDeque<Arc<Message>>,
    last_id: u64,
    max_queue: usize,
}

impl ReplayBuffer {
    pub fn new(max_queue: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(max_queue),
            last_id: 0,
            max_queue,
        }
    }

    /// Allocate the next id, append, evict the oldest past capacity.
    pub fn post(&mut self, channel: String, payload: Value) -> Arc<Message> {
        self.last_id += 1;
        let msg = Arc::new(Message {
            id: self.last_id,
            channel,
            payload,
        });
        self.entries.push_back(Arc::clone(&msg));
        while self.entries.len() > self.max_queue {
            self.entries.pop_front();
        }
        msg
    }

    /// Every retained message with `id > last_seen` on one of `channels`,
    /// ascending. Entries are stored in id order, so no sort is needed.
    pub fn catch_up(&self, last_seen: u64, channels: &HashSet<String>) -> Vec<Arc<Message>> {
        self.entries
            .iter()
            .filter(|m| m.id > last_seen && channels.contains(&m.channel))
            .cloned()
            .collect()
    }

    /// Id of the most recent post, 0 if none.
    pub fn last_id(&self) -> u64 {
        self.last_id
    }
}
