use std::time::Duration;

use tokio::time::Instant;

use super::types::{ClientError, ClientResult};

/// Windowed rate limiter.
///
/// A window opens at the first grant after the previous one expired, so a limiter with
/// `max_per_window = 1` spaces grants at least `window` apart.
#[derive(Debug, Clone)]
pub struct WindowLimiter {
    scope: &'static str,
    max_per_window: u32,
    window: Duration,
    window_start: Option<Instant>,
    remaining: u32,
}

impl WindowLimiter {
    pub fn new(scope: &'static str, max_per_window: u32, window: Duration) -> Self {
        Self {
            scope,
            max_per_window,
            window,
            window_start: None,
            remaining: max_per_window,
        }
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    fn time_until_reset(&self, now: Instant) -> Duration {
        match self.window_start {
            Some(start) => self
                .window
                .checked_sub(now.saturating_duration_since(start))
                .unwrap_or(Duration::ZERO),
            None => Duration::ZERO,
        }
    }

    fn rate_limited(&self, retry_after: Duration) -> ClientError {
        ClientError::RateLimited {
            scope: self.scope.to_string(),
            global: false,
            retry_after,
        }
    }

    pub fn try_acquire(&mut self) -> ClientResult<()> {
        self.try_acquire_at(Instant::now())
    }

    pub fn try_acquire_at(&mut self, now: Instant) -> ClientResult<()> {
        if self.max_per_window == 0 {
            return Err(self.rate_limited(self.window));
        }

        let expired = self
            .window_start
            .is_none_or(|start| now.saturating_duration_since(start) >= self.window);
        if expired {
            self.window_start = Some(now);
            self.remaining = self.max_per_window;
        }

        if self.remaining == 0 {
            return Err(self.rate_limited(self.time_until_reset(now)));
        }

        self.remaining -= 1;
        Ok(())
    }
}
