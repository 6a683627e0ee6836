//! Application-level liveness over PING/PONG envelopes.
//!
//! While the connection is open the monitor ticks every `interval`. Each tick
//! asks the actor to send a PING carrying a fresh correlation ID. A PONG
//! echoing any unanswered PING's correlation ID clears the miss counter. A
//! tick that finds the previous PING still unanswered counts as a miss, and
//! `max_missed` consecutive misses declare the connection dead. With
//! `max_missed == 0` misses are only logged.
//!
//! The monitor owns its interval timer; [`KeepaliveMonitor::tick`] pends
//! forever while stopped, so the actor can always select on it. A zero
//! interval disables the monitor.

use std::collections::VecDeque;
use std::time::Duration;

use figlink_core::CorrelationId;
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tracing::{debug, warn};

use crate::registry::{FAR_FUTURE, deadline_after};

/// What the actor should do after a tick.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum KeepaliveTick {
    /// Send a PING with this correlation ID.
    Ping(CorrelationId),
    /// Too many PINGs went unanswered.
    Dead {
        /// Consecutive misses observed.
        missed: u32,
    },
}

/// PING scheduler and PONG bookkeeping for one client.
pub struct KeepaliveMonitor {
    interval: Duration,
    max_missed: u32,
    timer: Option<Interval>,
    unanswered: VecDeque<CorrelationId>,
    missed: u32,
}

impl KeepaliveMonitor {
    /// Stopped monitor.
    #[must_use]
    pub fn new(interval: Duration, max_missed: u32) -> Self {
        Self {
            interval: interval.min(FAR_FUTURE),
            max_missed,
            timer: None,
            unanswered: VecDeque::new(),
            missed: 0,
        }
    }

    /// Start ticking; the first tick is one interval from now.
    ///
    /// Restarting resets all counters, so a monitor never carries state from
    /// one connection into the next.
    pub fn start(&mut self) {
        self.unanswered.clear();
        self.missed = 0;
        if self.interval.is_zero() {
            debug!("keepalive disabled");
            self.timer = None;
            return;
        }
        let first = deadline_after(Instant::now(), self.interval);
        let mut timer = tokio::time::interval_at(first, self.interval);
        timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
        self.timer = Some(timer);
        debug!(interval = ?self.interval, "keepalive started");
    }

    /// Stop ticking and forget outstanding PINGs.
    pub fn stop(&mut self) {
        if self.timer.take().is_some() {
            debug!("keepalive stopped");
        }
        self.unanswered.clear();
        self.missed = 0;
    }

    /// Whether the monitor is running.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.timer.is_some()
    }

    /// Consecutive unanswered PINGs so far.
    #[must_use]
    pub fn missed(&self) -> u32 {
        self.missed
    }

    /// Wait for the next tick. Pends forever while stopped.
    pub async fn tick(&mut self) -> KeepaliveTick {
        match self.timer.as_mut() {
            Some(timer) => {
                let _ = timer.tick().await;
            }
            None => std::future::pending::<()>().await,
        }
        self.on_tick()
    }

    /// Tick bookkeeping, separated from the timer for tests.
    pub fn on_tick(&mut self) -> KeepaliveTick {
        if !self.unanswered.is_empty() {
            self.missed += 1;
            warn!(missed = self.missed, max_missed = self.max_missed, "keepalive PONG missed");
            if self.max_missed > 0 && self.missed >= self.max_missed {
                return KeepaliveTick::Dead {
                    missed: self.missed,
                };
            }
        }
        let id = CorrelationId::new();
        self.unanswered.push_back(id.clone());
        let keep = usize::try_from(self.max_missed).unwrap_or(usize::MAX).max(1) + 1;
        while self.unanswered.len() > keep {
            let _ = self.unanswered.pop_front();
        }
        KeepaliveTick::Ping(id)
    }

    /// Record a PONG. Returns whether it answered one of our PINGs.
    pub fn on_pong(&mut self, correlation_id: &CorrelationId) -> bool {
        if !self.unanswered.contains(correlation_id) {
            return false;
        }
        self.unanswered.clear();
        self.missed = 0;
        true
    }
}
