//! Offline buffer for changes made while the channel is down.
//!
//! Bounded FIFO. When full, the oldest entry is evicted so the most recent
//! edits survive. On reconnect the buffer is flushed in order with a short
//! pause between sends; entries whose send fails are requeued at the front
//! in their original order.

use std::collections::VecDeque;
use std::time::Duration;

use crate::clock::Sleep;
use crate::error::SyncError;
use crate::protocol::ChangeMessage;

#[derive(Debug, Clone, PartialEq)]
pub struct OfflineEntry {
    pub message: ChangeMessage,
    pub enqueued_at: u64,
}

/// Outcome of a flush.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FlushReport {
    pub sent: usize,
    pub requeued: usize,
}

pub struct OfflineBuffer {
    queue: VecDeque<OfflineEntry>,
    max_size: usize,
}

impl OfflineBuffer {
    pub fn new(max_size: usize) -> Self {
        Self {
            queue: VecDeque::with_capacity(max_size.min(1024)),
            max_size: max_size.max(1),
        }
    }

    /// Queue a change. Returns the entry evicted to make room, if any.
    pub fn enqueue(&mut self, message: ChangeMessage, now_ms: u64) -> Option<OfflineEntry> {
        let evicted = if self.queue.len() >= self.max_size {
            self.queue.pop_front()
        } else {
            None
        };
        if let Some(old) = &evicted {
            log::warn!(
                "Offline buffer full ({}), dropped change {} for {}",
                self.max_size,
                old.message.message_id,
                old.message.path
            );
        }
        self.queue.push_back(OfflineEntry {
            message,
            enqueued_at: now_ms,
        });
        evicted
    }

    /// Take everything, oldest first.
    pub fn drain(&mut self) -> Vec<OfflineEntry> {
        self.queue.drain(..).collect()
    }

    /// Send every entry in order through `send`, pausing `delay` between sends.
    ///
    /// Failed entries go back to the front of the buffer, order preserved.
    pub async fn flush<F, S>(&mut self, mut send: F, sleep: &S, delay: Duration) -> FlushReport
    where
        F: FnMut(&ChangeMessage) -> Result<(), SyncError> + Send,
        S: Sleep,
    {
        let pending = self.drain();
        if pending.is_empty() {
            return FlushReport::default();
        }
        log::info!("Flushing {} offline changes", pending.len());

        let mut report = FlushReport::default();
        let mut failed = Vec::new();
        for (index, entry) in pending.into_iter().enumerate() {
            if index > 0 && !delay.is_zero() {
                sleep.sleep(delay).await;
            }
            match send(&entry.message) {
                Ok(()) => report.sent += 1,
                Err(e) => {
                    log::warn!("Offline flush of {} failed: {e}", entry.message.message_id);
                    failed.push(entry);
                }
            }
        }

        report.requeued = failed.len();
        for entry in failed.into_iter().rev() {
            self.queue.push_front(entry);
        }
        report
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn clear(&mut self) {
        self.queue.clear();
    }

    /// Sum of the diff payload sizes waiting to be sent.
    pub fn total_bytes(&self) -> usize {
        self.queue.iter().map(|e| e.message.diff.size).sum()
    }

    pub fn iter(&self) -> impl Iterator<Item = &OfflineEntry> {
        self.queue.iter()
    }
}
