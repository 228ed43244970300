//! Request throttle shared by every request of a session.
//!
//! Requests wait for a governor permit via `until_ready()`. The quota refills
//! at the configured rate and holds a burst of [`REQUEST_BURST`], so the
//! requests of one lookup go out back to back. On 429 the governor is
//! swapped for a slower one.

use std::num::NonZeroU32;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use arc_swap::ArcSwap;
use governor::clock::DefaultClock;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter};

use crate::ScholarError;

type DirectLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

/// Permits held in reserve: one results page, its cite fragment and the
/// citation file.
pub const REQUEST_BURST: u32 = 3;

/// Largest slowdown applied after repeated 429s.
const MAX_FACTOR: u32 = 16;
/// Quiet period after the last 429 before the base rate is restored.
const COOLDOWN: Duration = Duration::from_secs(60);

/// Rate limiter that slows down on 429 and recovers after a quiet minute.
pub struct AdaptiveLimiter {
    limiter: ArcSwap<DirectLimiter>,
    base_period: Duration,
    /// 1 = normal, 2 = half rate, and so on.
    current_factor: AtomicU32,
    last_429: Mutex<Option<Instant>>,
}

impl AdaptiveLimiter {
    /// A limiter refilling one permit per `period`. Zero periods are raised
    /// to one millisecond.
    pub fn new(period: Duration) -> Self {
        let base_period = period.max(Duration::from_millis(1));
        Self {
            limiter: ArcSwap::from(Arc::new(direct(base_period))),
            base_period,
            current_factor: AtomicU32::new(1),
            last_429: Mutex::new(None),
        }
    }

    pub fn per_second(n: u32) -> Self {
        Self::new(Duration::from_millis(1000 / n.max(1) as u64))
    }

    /// Wait until a request may be sent.
    pub async fn acquire(&self) {
        self.try_decay();
        let limiter = self.limiter.load();
        limiter.until_ready().await;
    }

    /// Double the slowdown factor and swap in the slower governor.
    pub fn on_rate_limited(&self) {
        *self.last_429.lock().unwrap_or_else(PoisonError::into_inner) = Some(Instant::now());

        let _ = self
            .current_factor
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |f| {
                Some((f * 2).min(MAX_FACTOR))
            });

        let factor = self.current_factor.load(Ordering::SeqCst);
        if let Some(scaled) = self.base_period.checked_mul(factor) {
            tracing::info!(factor, period_ms = scaled.as_millis() as u64, "rate limited, slowing down");
            self.limiter.store(Arc::new(direct(scaled)));
        }
    }

    pub fn factor(&self) -> u32 {
        self.current_factor.load(Ordering::SeqCst)
    }

    fn try_decay(&self) {
        let should_restore = self
            .last_429
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some_and(|t| t.elapsed() >= COOLDOWN);

        if should_restore && self.current_factor.load(Ordering::SeqCst) > 1 {
            self.current_factor.store(1, Ordering::SeqCst);
            self.limiter.store(Arc::new(direct(self.base_period)));
            tracing::debug!("rate limit cooled down, restoring base rate");
        }
    }
}

fn quota(period: Duration) -> Quota {
    // `period` is never zero here, so the quota always exists.
    let quota = Quota::with_period(period).unwrap_or_else(|| Quota::per_second(NonZeroU32::MIN));
    quota.allow_burst(NonZeroU32::new(REQUEST_BURST).unwrap_or(NonZeroU32::MIN))
}

fn direct(period: Duration) -> DirectLimiter {
    DirectLimiter::direct(quota(period))
}

/// Map a 429 reply to [`ScholarError::RateLimited`] with its Retry-After.
pub fn check_rate_limit_response(resp: &reqwest::Response) -> Result<(), ScholarError> {
    if resp.status() == reqwest::StatusCode::TOO_MANY_REQUESTS {
        let retry_after = resp
            .headers()
            .get(reqwest::header::RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(parse_retry_after);
        Err(ScholarError::RateLimited { retry_after })
    } else {
        Ok(())
    }
}

/// Parse a Retry-After header value (seconds or HTTP-date).
pub fn parse_retry_after(value: &str) -> Option<Duration> {
    if let Ok(secs) = value.trim().parse::<u64>() {
        return Some(Duration::from_secs(secs));
    }
    // HTTP-date: use a conservative fixed wait rather than parsing it.
    if value.contains(',') || value.contains("GMT") {
        return Some(Duration::from_secs(5));
    }
    None
}
