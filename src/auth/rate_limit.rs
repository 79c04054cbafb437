//! Per-client fixed-window rate limiting for authentication attempts.
//!
//! Counters live in a `DashMap` keyed by client (IP or forwarded-for value),
//! so checking and recording is one lock-free entry operation per request.
//! Memory is bounded by a periodic sweeper that drops windows which have
//! already reset.
//!
//! Fixed windows admit up to `2 * limit - 1` requests across a window
//! boundary in the worst case. That burst is accepted: the limiter protects
//! against sustained credential stuffing, not single-burst shaping, and in
//! exchange every decision can report exact `remaining` and `reset` values
//! for `X-RateLimit-*` headers.

use std::time::{Duration, Instant};

use dashmap::DashMap;
use tracing::debug;

/// How often the sweeper drops expired windows.
const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Outcome of a rate-limit check, carrying header material.
#[derive(Debug, Clone, Copy)]
pub struct RateLimitDecision {
    /// Whether the request may proceed.
    pub allowed: bool,
    /// Configured window limit.
    pub limit: u32,
    /// Requests left in the current window (0 when denied).
    pub remaining: u32,
    /// Time until the current window resets.
    pub reset_after: Duration,
}

impl RateLimitDecision {
    /// Whole seconds until retry is worthwhile, rounded up, for `Retry-After`.
    #[must_use]
    pub fn retry_after_secs(&self) -> u64 {
        let secs = self.reset_after.as_secs();
        if self.reset_after.subsec_nanos() > 0 {
            secs + 1
        } else {
            secs
        }
    }
}

/// One client's window state.
struct Window {
    started_at: Instant,
    count: u32,
}

/// Fixed-window rate limiter keyed by client identifier.
pub struct RateLimiter {
    windows: DashMap<String, Window>,
    limit: u32,
    window: Duration,
}

impl RateLimiter {
    /// Create a limiter allowing `limit` requests per `window` per client.
    #[must_use]
    pub fn new(limit: u32, window: Duration) -> Self {
        Self {
            windows: DashMap::new(),
            limit,
            window,
        }
    }

    /// Check the client's budget and record this attempt.
    ///
    /// Check-and-record is a single `entry` operation, so two concurrent
    /// requests from the same client can never both take the last slot.
    pub fn check_and_record(&self, client_key: &str) -> RateLimitDecision {
        let now = Instant::now();
        let mut entry = self
            .windows
            .entry(client_key.to_string())
            .or_insert_with(|| Window {
                started_at: now,
                count: 0,
            });

        // A lapsed window starts over rather than carrying stale counts.
        if now.duration_since(entry.started_at) >= self.window {
            entry.started_at = now;
            entry.count = 0;
        }

        let reset_after = self
            .window
            .saturating_sub(now.duration_since(entry.started_at));

        if entry.count >= self.limit {
            return RateLimitDecision {
                allowed: false,
                limit: self.limit,
                remaining: 0,
                reset_after,
            };
        }

        entry.count += 1;
        RateLimitDecision {
            allowed: true,
            limit: self.limit,
            remaining: self.limit - entry.count,
            reset_after,
        }
    }

    /// Drop windows that have already reset. Correctness does not depend on
    /// this running; it only bounds memory under many distinct clients.
    pub fn sweep_expired(&self) {
        let window = self.window;
        let before = self.windows.len();
        self.windows
            .retain(|_, w| w.started_at.elapsed() < window);
        let swept = before - self.windows.len();
        if swept > 0 {
            debug!(swept, "Swept expired rate-limit windows");
        }
    }

    /// Spawn the background sweeper, stopping on shutdown signal.
    pub fn spawn_sweeper(
        self: std::sync::Arc<Self>,
        mut shutdown: tokio::sync::broadcast::Receiver<()>,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(SWEEP_INTERVAL);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = tick.tick() => self.sweep_expired(),
                    _ = shutdown.recv() => break,
                }
            }
        })
    }
}
