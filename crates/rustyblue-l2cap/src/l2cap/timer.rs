//! Deadline queue for channel and connection timers
//!
//! The engine owns no threads. Timers are armed against a deadline and the
//! host fires them by calling `L2capManager::process_timers` with the
//! current instant. Keys are never reused: an owner remembers the key of
//! the timer it armed, and a firing whose key the owner no longer holds is
//! stale and ignored.

use std::collections::BTreeMap;
use std::time::Instant;

use super::types::{ChannelId, ConnectionId};

/// Unique handle of an armed timer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerKey(u64);

/// What a timer acts on when it fires
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerTarget {
    /// Connect/configure or disconnect-ack timeout of a channel
    Channel {
        connection: ConnectionId,
        cid: ChannelId,
    },
    /// Idle teardown of a connection with no channels left
    Idle { connection: ConnectionId },
}

/// A timer that came due
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Expired {
    pub key: TimerKey,
    pub target: TimerTarget,
}

#[derive(Debug, Default)]
pub struct TimerQueue {
    next_key: u64,
    deadlines: BTreeMap<(Instant, TimerKey), TimerTarget>,
    armed: BTreeMap<TimerKey, Instant>,
}

impl TimerQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Arm a timer and return its key
    pub fn arm(&mut self, deadline: Instant, target: TimerTarget) -> TimerKey {
        self.next_key += 1;
        let key = TimerKey(self.next_key);
        self.deadlines.insert((deadline, key), target);
        self.armed.insert(key, deadline);
        key
    }

    /// Disarm a timer. Returns false if it already fired or was cancelled.
    pub fn cancel(&mut self, key: TimerKey) -> bool {
        match self.armed.remove(&key) {
            Some(deadline) => {
                self.deadlines.remove(&(deadline, key));
                true
            }
            None => false,
        }
    }

    pub fn is_armed(&self, key: TimerKey) -> bool {
        self.armed.contains_key(&key)
    }

    pub fn len(&self) -> usize {
        self.armed.len()
    }

    pub fn is_empty(&self) -> bool {
        self.armed.is_empty()
    }

    /// Earliest pending deadline
    pub fn next_deadline(&self) -> Option<Instant> {
        self.deadlines.keys().next().map(|(deadline, _)| *deadline)
    }

    /// Remove and return every timer due at or before `now`, earliest first
    pub fn expire(&mut self, now: Instant) -> Vec<Expired> {
        let mut expired = Vec::new();

        loop {
            match self.deadlines.first_key_value() {
                Some((&(deadline, _), _)) if deadline <= now => {}
                _ => break,
            }
            if let Some(((_, key), target)) = self.deadlines.pop_first() {
                self.armed.remove(&key);
                expired.push(Expired { key, target });
            }
        }

        expired
    }
}
