//! Sliding-window rate limiter.
//!
//! One window per user: the timestamps of requests admitted in the trailing
//! hour. Admission prunes the window, compares against the role ceiling,
//! and appends on success. `unlimited` roles short-circuit. A housekeeping
//! sweep drops users with no recent requests so the map never grows without
//! bound.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;
use tracing::{debug, warn};

use switchboard_types::config::RateCeiling;
use switchboard_types::errors::RateLimitDenied;

/// Window length: one hour.
const WINDOW: Duration = Duration::from_secs(3600);

/// Housekeeping interval for the idle-user sweep.
const CLEANUP_INTERVAL: Duration = Duration::from_secs(300);

struct LimiterState {
    windows: HashMap<String, Vec<Instant>>,
    last_cleanup: Instant,
}

/// Sliding-window limiter keyed by user id.
pub struct RateLimiter {
    window: Duration,
    state: Mutex<LimiterState>,
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new()
    }
}

impl RateLimiter {
    pub fn new() -> Self {
        Self::with_window(WINDOW)
    }

    /// Custom window length, for tests.
    pub fn with_window(window: Duration) -> Self {
        Self {
            window,
            state: Mutex::new(LimiterState {
                windows: HashMap::new(),
                last_cleanup: Instant::now(),
            }),
        }
    }

    /// Admit or reject one request.
    ///
    /// On rejection the window is left untouched and the caller gets the
    /// observed count, the ceiling, and the reset delay.
    pub async fn admit(
        &self,
        user_id: &str,
        ceiling: RateCeiling,
    ) -> Result<(), RateLimitDenied> {
        let limit = match ceiling {
            RateCeiling::Unlimited => {
                debug!(user = %user_id, "rate limit check skipped (unlimited)");
                return Ok(());
            }
            RateCeiling::Limited(n) => n,
        };

        let now = Instant::now();
        let mut state = self.state.lock().await;
        self.maybe_cleanup(&mut state, now);

        let window = state.windows.entry(user_id.to_string()).or_default();
        window.retain(|ts| now.duration_since(*ts) < self.window);

        let current = window.len() as u32;
        if current >= limit {
            // Reset when the oldest in-window request ages out.
            let retry_after = window
                .iter()
                .min()
                .map(|oldest| self.window.saturating_sub(now.duration_since(*oldest)))
                .unwrap_or_default();
            warn!(user = %user_id, current, limit, "rate limit exceeded");
            return Err(RateLimitDenied {
                user_id: user_id.to_string(),
                current,
                limit,
                retry_after_secs: retry_after.as_secs(),
            });
        }

        window.push(now);
        debug!(user = %user_id, count = current + 1, limit, "request admitted");
        Ok(())
    }

    /// Requests left in the current window; `None` means unlimited.
    pub async fn remaining(&self, user_id: &str, ceiling: RateCeiling) -> Option<u32> {
        let limit = match ceiling {
            RateCeiling::Unlimited => return None,
            RateCeiling::Limited(n) => n,
        };
        let now = Instant::now();
        let state = self.state.lock().await;
        let used = state
            .windows
            .get(user_id)
            .map(|w| {
                w.iter()
                    .filter(|ts| now.duration_since(**ts) < self.window)
                    .count() as u32
            })
            .unwrap_or(0);
        Some(limit.saturating_sub(used))
    }

    /// Clear one user's window (admin override).
    pub async fn reset_user(&self, user_id: &str) {
        self.state.lock().await.windows.remove(user_id);
    }

    /// Users with at least one in-window request.
    pub async fn active_users(&self) -> usize {
        let now = Instant::now();
        let state = self.state.lock().await;
        state
            .windows
            .values()
            .filter(|w| w.iter().any(|ts| now.duration_since(*ts) < self.window))
            .count()
    }

    fn maybe_cleanup(&self, state: &mut LimiterState, now: Instant) {
        if now.duration_since(state.last_cleanup) < CLEANUP_INTERVAL {
            return;
        }
        state.last_cleanup = now;

        let window = self.window;
        let before = state.windows.len();
        state.windows.retain(|_, timestamps| {
            timestamps.retain(|ts| now.duration_since(*ts) < window);
            !timestamps.is_empty()
        });
        let removed = before - state.windows.len();
        if removed > 0 {
            debug!(removed, remaining = state.windows.len(), "rate window sweep");
        }
    }
}
