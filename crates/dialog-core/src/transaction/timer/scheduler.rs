//! Deadline queue shared by every transaction and dialog of a user agent.
//!
//! State machines never own a running timer, only the [`TimerToken`] the
//! scheduler hands out. Cancelling a token removes its entry, so a
//! cancelled timer can never fire.

use std::collections::{BTreeMap, HashMap};
use std::fmt;

use tokio::time::Instant;
use tracing::trace;

use super::types::TimerTarget;

/// Handle to a scheduled timer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerToken(u64);

impl fmt::Display for TimerToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "timer#{}", self.0)
    }
}

/// Timer that reached its deadline
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExpiredTimer {
    pub token: TimerToken,
    pub deadline: Instant,
    pub target: TimerTarget,
}

#[derive(Debug, Default)]
pub struct TimerScheduler {
    next_token: u64,
    // Ordered by deadline, then by creation order
    queue: BTreeMap<(Instant, TimerToken), TimerTarget>,
    deadlines: HashMap<TimerToken, Instant>,
}

impl TimerScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn schedule(&mut self, deadline: Instant, target: TimerTarget) -> TimerToken {
        self.next_token += 1;
        let token = TimerToken(self.next_token);
        trace!(%token, %target, "Scheduling timer");
        self.queue.insert((deadline, token), target);
        self.deadlines.insert(token, deadline);
        token
    }

    /// Cancels a pending timer. Returns `false` if it already fired or was cancelled.
    pub fn cancel(&mut self, token: TimerToken) -> bool {
        match self.deadlines.remove(&token) {
            Some(deadline) => {
                self.queue.remove(&(deadline, token));
                true
            }
            None => false,
        }
    }

    pub fn is_pending(&self, token: TimerToken) -> bool {
        self.deadlines.contains_key(&token)
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.queue.keys().next().map(|(deadline, _)| *deadline)
    }

    /// Removes and returns the earliest timer due at `now`, if any
    pub fn pop_expired(&mut self, now: Instant) -> Option<ExpiredTimer> {
        let (&(deadline, token), _) = self.queue.iter().next()?;
        if deadline > now {
            return None;
        }
        let target = self.queue.remove(&(deadline, token))?;
        self.deadlines.remove(&token);
        Some(ExpiredTimer { token, deadline, target })
    }

    /// Removes every timer due at `now`, earliest first
    pub fn expire(&mut self, now: Instant) -> Vec<ExpiredTimer> {
        let mut expired = Vec::new();
        while let Some(timer) = self.pop_expired(now) {
            expired.push(timer);
        }
        expired
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}
