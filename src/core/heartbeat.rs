use std::time::Duration;

use tokio::time::Instant;

/// Outcome of one heartbeat interval tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatTick {
    /// Send a heartbeat now.
    Send,
    /// Too many consecutive acknowledgements went missing; the connection is dead.
    Dead { missed: u32 },
}

/// Tracks heartbeat cadence and acknowledgements for one connection.
#[derive(Debug, Clone)]
pub struct HeartbeatTracker {
    grace: u32,
    interval: Option<Duration>,
    awaiting_ack: bool,
    missed: u32,
    last_sent: Option<Instant>,
    last_ack: Option<Instant>,
}

impl HeartbeatTracker {
    pub fn new(grace: u32) -> Self {
        Self {
            grace: grace.max(1),
            interval: None,
            awaiting_ack: false,
            missed: 0,
            last_sent: None,
            last_ack: None,
        }
    }

    pub fn set_interval(&mut self, interval: Duration) {
        self.interval = Some(interval);
    }

    pub fn interval(&self) -> Option<Duration> {
        self.interval
    }

    pub fn on_tick(&mut self) -> HeartbeatTick {
        if self.awaiting_ack {
            self.missed = self.missed.saturating_add(1);
            if self.missed >= self.grace {
                return HeartbeatTick::Dead {
                    missed: self.missed,
                };
            }
        }
        HeartbeatTick::Send
    }

    pub fn record_sent(&mut self, now: Instant) {
        self.awaiting_ack = true;
        self.last_sent = Some(now);
    }

    /// Returns the round-trip time when the ack answers an outstanding heartbeat.
    pub fn record_ack(&mut self, now: Instant) -> Option<Duration> {
        let outstanding = self.awaiting_ack;
        self.awaiting_ack = false;
        self.missed = 0;
        self.last_ack = Some(now);
        if outstanding {
            self.last_sent
                .map(|sent| now.saturating_duration_since(sent))
        } else {
            None
        }
    }

    pub fn missed(&self) -> u32 {
        self.missed
    }

    pub fn last_ack(&self) -> Option<Instant> {
        self.last_ack
    }

    pub fn reset(&mut self) {
        self.interval = None;
        self.awaiting_ack = false;
        self.missed = 0;
        self.last_sent = None;
        self.last_ack = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drive(tracker: &mut HeartbeatTracker, now: Instant) -> HeartbeatTick {
        let tick = tracker.on_tick();
        if tick == HeartbeatTick::Send {
            tracker.record_sent(now);
        }
        tick
    }

    #[test]
    fn dead_only_after_grace_missed_acks() {
        let start = Instant::now();
        let mut tracker = HeartbeatTracker::new(2);

        assert_eq!(drive(&mut tracker, start), HeartbeatTick::Send);
        assert_eq!(drive(&mut tracker, start), HeartbeatTick::Send);
        assert_eq!(tracker.missed(), 1);
        assert_eq!(
            drive(&mut tracker, start),
            HeartbeatTick::Dead { missed: 2 }
        );
    }

    #[test]
    fn ack_resets_the_missed_counter() {
        let start = Instant::now();
        let mut tracker = HeartbeatTracker::new(2);

        for step in 0..10u64 {
            let now = start + Duration::from_millis(step * 100);
            assert_eq!(drive(&mut tracker, now), HeartbeatTick::Send);
            if step % 2 == 0 {
                let rtt = tracker.record_ack(now + Duration::from_millis(7));
                assert_eq!(rtt, Some(Duration::from_millis(7)));
            }
        }
        // beat 9 is still outstanding; it counts as missed on the next tick
        assert_eq!(tracker.missed(), 0);
        assert_eq!(drive(&mut tracker, start), HeartbeatTick::Send);
        assert_eq!(tracker.missed(), 1);
    }

    #[test]
    fn unsolicited_ack_has_no_rtt() {
        let mut tracker = HeartbeatTracker::new(1);
        assert_eq!(tracker.record_ack(Instant::now()), None);
        assert!(tracker.last_ack().is_some());
        tracker.reset();
        assert!(tracker.last_ack().is_none());
    }
}
