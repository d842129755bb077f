//! Arm-once timers
//!
//! A [`OneShot`] holds at most one pending deadline; arming while armed is a no-op. The
//! [`FlushScheduler`] keeps one `OneShot` per channel, which is what guarantees a single
//! pending flush per channel. Deadlines are plain values, the owning event loop sleeps until
//! [`FlushScheduler::next_deadline`].

use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct OneShot {
    deadline: Option<Instant>,
}

impl OneShot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Arm for `now + delay`. Returns false (and keeps the existing deadline) when already armed.
    pub fn arm(&mut self, now: Instant, delay: Duration) -> bool {
        if self.deadline.is_some() {
            return false;
        }
        self.deadline = Some(now + delay);
        true
    }

    pub fn is_armed(&self) -> bool {
        self.deadline.is_some()
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Clears and returns true if the deadline has passed.
    pub fn fire_if_due(&mut self, now: Instant) -> bool {
        match self.deadline {
            Some(deadline) if deadline <= now => {
                self.deadline = None;
                true
            }
            _ => false,
        }
    }

    pub fn clear(&mut self) {
        self.deadline = None;
    }
}

/// One flush timer per channel
#[derive(Debug)]
pub struct FlushScheduler {
    window: Duration,
    timers: HashMap<String, OneShot>,
}

impl FlushScheduler {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            timers: HashMap::new(),
        }
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    /// Arm the channel's timer if it is idle. Returns true when a new window was opened.
    pub fn arm(&mut self, channel: &str, now: Instant) -> bool {
        match self.timers.get_mut(channel) {
            Some(timer) => timer.arm(now, self.window),
            None => {
                let mut timer = OneShot::new();
                timer.arm(now, self.window);
                self.timers.insert(channel.to_string(), timer);
                true
            }
        }
    }

    pub fn is_armed(&self, channel: &str) -> bool {
        self.timers.get(channel).is_some_and(OneShot::is_armed)
    }

    pub fn armed_count(&self) -> usize {
        self.timers.values().filter(|t| t.is_armed()).count()
    }

    /// Earliest pending deadline across all channels
    pub fn next_deadline(&self) -> Option<Instant> {
        self.timers.values().filter_map(OneShot::deadline).min()
    }

    /// Fire every due timer, returning the channels in deadline order.
    pub fn take_due(&mut self, now: Instant) -> Vec<String> {
        let mut due: Vec<(Instant, String)> = self
            .timers
            .iter_mut()
            .filter_map(|(channel, timer)| {
                let deadline = timer.deadline()?;
                timer.fire_if_due(now).then(|| (deadline, channel.clone()))
            })
            .collect();
        due.sort();
        due.into_iter().map(|(_, channel)| channel).collect()
    }

    pub fn cancel_all(&mut self) {
        for timer in self.timers.values_mut() {
            timer.clear();
        }
    }
}
