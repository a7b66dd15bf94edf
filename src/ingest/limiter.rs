//! Fixed-window request limiter shared by warm-up and retry fetches.

use parking_lot::Mutex;
use std::time::Duration;
use tokio::time::Instant;

pub struct RateLimiter {
    max_requests: u32,
    window: Duration,
    state: Mutex<WindowState>,
}

struct WindowState {
    count: u32,
    window_start: Instant,
}

impl RateLimiter {
    pub fn new(max_requests: u32, window: Duration) -> Self {
        Self {
            max_requests: max_requests.max(1),
            window,
            state: Mutex::new(WindowState {
                count: 0,
                window_start: Instant::now(),
            }),
        }
    }

    /// Take a permit without waiting. On refusal returns how long until the
    /// current window resets.
    pub fn try_acquire(&self) -> Result<(), Duration> {
        let mut state = self.state.lock();
        let now = Instant::now();

        // Reset window if expired
        if now.duration_since(state.window_start) >= self.window {
            state.count = 0;
            state.window_start = now;
        }

        if state.count < self.max_requests {
            state.count += 1;
            Ok(())
        } else {
            Err((state.window_start + self.window).saturating_duration_since(now))
        }
    }

    /// Wait until a permit is available and take it.
    pub async fn acquire(&self) {
        loop {
            match self.try_acquire() {
                Ok(()) => return,
                Err(wait) => {
                    tracing::trace!(wait_ms = wait.as_millis() as u64, "rate limit reached");
                    tokio::time::sleep(wait.max(Duration::from_millis(1))).await;
                }
            }
        }
    }

    /// Permits already taken in the current window
    pub fn used(&self) -> u32 {
        self.state.lock().count
    }
}
