use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;

/// Process-wide pause set by a global 429. Every request observes it before its next attempt.
#[derive(Debug, Clone, Default)]
pub struct GlobalCooldown {
    until: Arc<Mutex<Option<Instant>>>,
}

impl GlobalCooldown {
    pub fn new() -> Self {
        Self::default()
    }

    /// Extend the cooldown to `until`. An earlier instant never shortens it.
    pub fn trigger(&self, until: Instant) {
        let mut current = self.until.lock();
        *current = Some(current.map_or(until, |existing| existing.max(until)));
    }

    pub fn remaining(&self, now: Instant) -> Option<Duration> {
        let mut current = self.until.lock();
        match *current {
            Some(until) if until > now => Some(until - now),
            Some(_) => {
                *current = None;
                None
            }
            None => None,
        }
    }

    pub fn is_active(&self) -> bool {
        self.remaining(Instant::now()).is_some()
    }

    /// Resolve once no cooldown is active.
    pub async fn wait(&self) {
        while let Some(delay) = self.remaining(Instant::now()) {
            tokio::time::sleep(delay).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn wait_blocks_until_the_latest_trigger() {
        let cooldown = GlobalCooldown::new();
        let start = Instant::now();
        cooldown.wait().await;
        assert_eq!(Instant::now(), start);

        cooldown.trigger(start + Duration::from_secs(2));
        cooldown.trigger(start + Duration::from_secs(1));
        assert_eq!(cooldown.remaining(start), Some(Duration::from_secs(2)));

        let extender = cooldown.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            extender.trigger(Instant::now() + Duration::from_secs(3));
        });

        cooldown.wait().await;
        assert!(Instant::now() >= start + Duration::from_secs(4));
        assert!(!cooldown.is_active());
    }
}
