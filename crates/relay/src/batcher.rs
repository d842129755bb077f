//! Time-windowed batch accumulator
//!
//! The first item enqueued on an idle channel opens a window; everything enqueued before the
//! window's deadline rides along in the same flush, in enqueue order.

use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

use crate::message::AdmittedItem;
use crate::scheduler::FlushScheduler;

#[derive(Debug)]
pub struct BatchAccumulator {
    scheduler: FlushScheduler,
    buffers: HashMap<String, Vec<AdmittedItem>>,
}

impl BatchAccumulator {
    pub fn new(window: Duration) -> Self {
        Self {
            scheduler: FlushScheduler::new(window),
            buffers: HashMap::new(),
        }
    }

    /// Append to the channel buffer. Returns true if this item opened a new window.
    pub fn enqueue(&mut self, channel: &str, item: AdmittedItem, now: Instant) -> bool {
        self.buffers.entry(channel.to_string()).or_default().push(item);
        let opened = self.scheduler.arm(channel, now);
        if opened {
            debug!(
                channel = %channel,
                window_ms = self.scheduler.window().as_millis() as u64,
                "Batch window opened"
            );
        }
        opened
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.scheduler.next_deadline()
    }

    pub fn pending(&self, channel: &str) -> usize {
        self.buffers.get(channel).map_or(0, Vec::len)
    }

    pub fn is_armed(&self, channel: &str) -> bool {
        self.scheduler.is_armed(channel)
    }

    /// Swap out the buffers of every channel whose window has closed. Channels whose buffer
    /// turned out empty are skipped.
    pub fn take_due(&mut self, now: Instant) -> Vec<(String, Vec<AdmittedItem>)> {
        self.scheduler
            .take_due(now)
            .into_iter()
            .filter_map(|channel| {
                let items = self
                    .buffers
                    .get_mut(&channel)
                    .map(std::mem::take)
                    .unwrap_or_default();
                (!items.is_empty()).then_some((channel, items))
            })
            .collect()
    }

    /// Clear every pending window and drop the buffered items. Returns how many were dropped.
    pub fn cancel_all(&mut self) -> usize {
        self.scheduler.cancel_all();
        self.buffers.values_mut().map(|b| std::mem::take(b).len()).sum()
    }
}
