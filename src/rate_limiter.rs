use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// Global fixed-window rate limiter shared by every attack sender
///
/// Fixed-window algorithm:
/// - A window opens on the first acquisition after the previous one expired
/// - At most `max_rate` acquisitions are granted per window
/// - The counter resets when the window rolls over
///
/// `try_acquire` never waits. A rejected caller is expected to back off and
/// retry on its own schedule.
#[derive(Clone)]
pub struct RateLimiter {
    state: Arc<Mutex<RateLimiterState>>,
    window: Duration,
}

/// Point-in-time view of the limiter window
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimiterState {
    pub window_start: Option<Instant>,
    pub count_in_window: u32,
    pub max_rate: u32,
}

impl RateLimiter {
    /// Create a limiter granting `max_rate` acquisitions per `window`
    pub fn new(max_rate: u32, window: Duration) -> Self {
        Self {
            state: Arc::new(Mutex::new(RateLimiterState {
                window_start: None,
                count_in_window: 0,
                max_rate,
            })),
            window,
        }
    }

    /// Create a limiter with a one second window
    pub fn per_second(max_rate: u32) -> Self {
        Self::new(max_rate, Duration::from_secs(1))
    }

    /// Try to take one slot in the current window
    ///
    /// Returns false once the window is full. The check and the increment
    /// happen under one lock, so concurrent callers can never push the count
    /// past `max_rate`.
    pub fn try_acquire(&self) -> bool {
        let now = Instant::now();
        let mut state = self.state.lock();

        let rolled_over = match state.window_start {
            Some(start) => now.duration_since(start) >= self.window,
            None => true,
        };
        if rolled_over {
            state.window_start = Some(now);
            state.count_in_window = 0;
        }

        if state.count_in_window < state.max_rate {
            state.count_in_window += 1;
            true
        } else {
            false
        }
    }

    /// Copy of the current window (for reporting)
    pub fn snapshot(&self) -> RateLimiterState {
        *self.state.lock()
    }

    pub fn max_rate(&self) -> u32 {
        self.state.lock().max_rate
    }

    pub fn window(&self) -> Duration {
        self.window
    }
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("window", &self.window)
            .field("state", &self.snapshot())
            .finish()
    }
}
