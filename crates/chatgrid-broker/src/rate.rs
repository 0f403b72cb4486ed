//! Bounded-points rate limiting.
//!
//! Placement throughput (joins, client creation) is throttled against
//! an external budget. The local variant keeps its window in process
//! memory; the shared variant keeps the counter in the shared store so
//! every supervisor replica draws from one fleet-wide budget, which is
//! what the chat network's join-rate limit actually applies to.

use std::future::Future;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::error::BrokerResult;
use crate::shared::{SetOptions, SharedStore};

/// A consumable points budget with a fixed reset window.
pub trait RateLimiter: Send + Sync {
    /// Points left in the current window. Establishes a fresh window if
    /// none is active.
    fn remaining(&self) -> impl Future<Output = BrokerResult<u32>> + Send;

    /// Consume `n` points; floors at zero. Returns the new remainder.
    fn decrement(&self, n: u32) -> impl Future<Output = BrokerResult<u32>> + Send;

    /// Return `n` points (e.g. a delivery that didn't go out), capped at
    /// the configured allowance.
    fn increment(&self, n: u32) -> impl Future<Output = BrokerResult<u32>> + Send;
}

// ── Local ──────────────────────────────────────────────────────────

struct LocalWindow {
    started: Instant,
    remaining: u32,
}

/// Process-local fixed-window limiter.
pub struct LocalRateLimiter {
    allow: u32,
    every: Duration,
    window: Mutex<LocalWindow>,
}

impl LocalRateLimiter {
    pub fn new(allow: u32, every: Duration) -> Self {
        Self {
            allow,
            every,
            window: Mutex::new(LocalWindow {
                started: Instant::now(),
                remaining: allow,
            }),
        }
    }

    fn with_window<T>(&self, f: impl FnOnce(&mut LocalWindow) -> T) -> T {
        let mut window = self.window.lock().expect("rate window poisoned");
        if window.started.elapsed() >= self.every {
            window.started = Instant::now();
            window.remaining = self.allow;
        }
        f(&mut window)
    }
}

impl RateLimiter for LocalRateLimiter {
    async fn remaining(&self) -> BrokerResult<u32> {
        Ok(self.with_window(|w| w.remaining))
    }

    async fn decrement(&self, n: u32) -> BrokerResult<u32> {
        Ok(self.with_window(|w| {
            w.remaining = w.remaining.saturating_sub(n);
            w.remaining
        }))
    }

    async fn increment(&self, n: u32) -> BrokerResult<u32> {
        let allow = self.allow;
        Ok(self.with_window(|w| {
            w.remaining = (w.remaining + n).min(allow);
            w.remaining
        }))
    }
}

// ── Shared ─────────────────────────────────────────────────────────

/// Fleet-wide limiter; the counter lives under `rate-limit:{name}` in
/// the shared store with the window as its TTL.
///
/// The window is (re)established with a set-if-absent, so even when
/// many replicas race at a window boundary the full budget is written
/// exactly once per window.
pub struct SharedRateLimiter<S: SharedStore> {
    name: String,
    allow: u32,
    every: Duration,
    store: S,
}

impl<S: SharedStore> SharedRateLimiter<S> {
    pub fn new(store: S, name: impl Into<String>, allow: u32, every: Duration) -> Self {
        Self {
            name: name.into(),
            allow,
            every,
            store,
        }
    }

    fn key(&self) -> String {
        format!("rate-limit:{}", self.name)
    }

    async fn current(&self) -> BrokerResult<Option<u32>> {
        let raw = self.store.get(&self.key()).await?;
        Ok(raw.and_then(|v| v.parse::<i64>().ok()).map(clamp))
    }

    /// Start a fresh window with the full budget unless one is already
    /// active. Returns true if this call opened the window.
    async fn establish_window(&self) -> BrokerResult<bool> {
        self.store
            .set(
                &self.key(),
                &self.allow.to_string(),
                SetOptions::if_absent().with_ttl(self.every),
            )
            .await
    }
}

impl<S: SharedStore> RateLimiter for SharedRateLimiter<S> {
    async fn remaining(&self) -> BrokerResult<u32> {
        if let Some(remaining) = self.current().await? {
            return Ok(remaining);
        }
        // No active window: try to establish one with the full budget.
        if self.establish_window().await? {
            Ok(self.allow)
        } else {
            // Lost the race; someone else just wrote the window.
            Ok(self.current().await?.unwrap_or(0))
        }
    }

    async fn decrement(&self, n: u32) -> BrokerResult<u32> {
        // The window may have expired since the caller checked
        // remaining(); a bare incr_by would then mint a counter with no
        // TTL that pins the budget forever. Re-establish the window
        // first so the counter always carries the window's expiry.
        self.establish_window().await?;
        let next = self.store.incr_by(&self.key(), -(n as i64)).await?;
        Ok(clamp(next))
    }

    async fn increment(&self, n: u32) -> BrokerResult<u32> {
        self.establish_window().await?;
        let next = self.store.incr_by(&self.key(), n as i64).await?;
        Ok(clamp(next).min(self.allow))
    }
}

fn clamp(value: i64) -> u32 {
    value.max(0) as u32
}
