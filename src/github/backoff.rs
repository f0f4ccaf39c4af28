//! GitHub API rate-limit backoff.
//!
//! Two independent brakes: an exponential window opened by 403/429
//! rate-limit responses (base delay doubles on each hit, capped, reset on
//! any success), and a proactive pause when `X-RateLimit-Remaining` hits
//! zero, lasting until `X-RateLimit-Reset`.

use reqwest::header::HeaderMap;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

pub const DEFAULT_BASE_SECONDS: u64 = 30;
pub const DEFAULT_MAX_SECONDS: u64 = 900;

pub struct GhBackoff {
    /// When the current backoff window expires (None = not in backoff).
    until: Option<Instant>,
    /// Last delay applied (doubles on each consecutive hit).
    delay: Duration,
    base: Duration,
    max: Duration,
    /// Remaining requests in the current window.
    remaining: Option<u32>,
    /// UTC epoch second when the window resets.
    reset_at: Option<u64>,
}

impl GhBackoff {
    /// Delays from `gh.backoff.base_seconds` / `gh.backoff.max_seconds`.
    pub fn from_config() -> Self {
        let base = crate::config::get_u64("gh.backoff.base_seconds").unwrap_or(DEFAULT_BASE_SECONDS);
        let max = crate::config::get_u64("gh.backoff.max_seconds").unwrap_or(DEFAULT_MAX_SECONDS);
        Self::new(Duration::from_secs(base), Duration::from_secs(max))
    }

    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            until: None,
            delay: Duration::ZERO,
            base,
            max: max.max(base),
            remaining: None,
            reset_at: None,
        }
    }

    /// Returns remaining wait time if either brake is on.
    pub fn is_active(&self) -> Option<Duration> {
        if let Some(until) = self.until {
            let now = Instant::now();
            if now < until {
                return Some(until - now);
            }
        }
        if self.remaining == Some(0) {
            if let Some(reset_epoch) = self.reset_at {
                let now_epoch = SystemTime::now()
                    .duration_since(UNIX_EPOCH)
                    .unwrap_or_default()
                    .as_secs();
                if now_epoch < reset_epoch {
                    return Some(Duration::from_secs(reset_epoch - now_epoch));
                }
            }
        }
        None
    }

    pub fn update_from_headers(&mut self, headers: &HeaderMap) {
        if let Some(v) = header_u64(headers, "x-ratelimit-remaining") {
            self.remaining = u32::try_from(v).ok();
        }
        if let Some(v) = header_u64(headers, "x-ratelimit-reset") {
            self.reset_at = Some(v);
        }
    }

    /// Record a rate-limit hit and widen the backoff window.
    pub fn record_rate_limit(&mut self) -> Duration {
        self.delay = if self.delay.is_zero() {
            self.base
        } else {
            (self.delay * 2).min(self.max)
        };
        self.until = Some(Instant::now() + self.delay);
        tracing::warn!(
            delay_secs = self.delay.as_secs(),
            "GitHub rate limit hit, backing off"
        );
        self.delay
    }

    pub fn record_success(&mut self) {
        if self.delay > Duration::ZERO {
            tracing::info!("GitHub backoff cleared after successful API call");
        }
        self.delay = Duration::ZERO;
        self.until = None;
    }
}

fn header_u64(headers: &HeaderMap, name: &str) -> Option<u64> {
    headers.get(name)?.to_str().ok()?.trim().parse().ok()
}

/// Whether a 403 body is a rate-limit / abuse-detection response rather
/// than a permission error.
pub fn is_rate_limit_body(body: &str) -> bool {
    let lower = body.to_lowercase();
    lower.contains("rate limit")
        || lower.contains("abuse detection")
        || lower.contains("secondary rate")
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::HeaderValue;

    fn backoff(base: u64, max: u64) -> GhBackoff {
        GhBackoff::new(Duration::from_secs(base), Duration::from_secs(max))
    }

    #[test]
    fn new_backoff_is_inactive() {
        assert!(backoff(30, 900).is_active().is_none());
    }

    #[test]
    fn backoff_doubles_then_caps() {
        let mut b = backoff(5, 15);
        assert_eq!(b.record_rate_limit(), Duration::from_secs(5));
        assert_eq!(b.record_rate_limit(), Duration::from_secs(10));
        assert_eq!(b.record_rate_limit(), Duration::from_secs(15));
        assert_eq!(b.record_rate_limit(), Duration::from_secs(15));
        assert!(b.is_active().is_some());
    }

    #[test]
    fn record_success_resets_backoff() {
        let mut b = backoff(5, 60);
        b.record_rate_limit();
        b.record_success();
        assert!(b.is_active().is_none());
        assert_eq!(b.record_rate_limit(), Duration::from_secs(5));
    }

    #[test]
    fn proactive_pause_when_quota_exhausted() {
        let mut b = backoff(30, 900);
        let reset = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_secs()
            + 60;
        let mut headers = HeaderMap::new();
        headers.insert("x-ratelimit-remaining", HeaderValue::from_static("0"));
        headers.insert(
            "x-ratelimit-reset",
            HeaderValue::from_str(&reset.to_string()).unwrap(),
        );
        b.update_from_headers(&headers);
        let pause = b.is_active().unwrap();
        assert!(pause.as_secs() <= 61);

        headers.insert("x-ratelimit-remaining", HeaderValue::from_static("4999"));
        b.update_from_headers(&headers);
        assert!(b.is_active().is_none());
    }

    #[test]
    fn rate_limit_body_detection() {
        assert!(is_rate_limit_body("API rate limit exceeded for user"));
        assert!(is_rate_limit_body("You have triggered an abuse detection mechanism"));
        assert!(is_rate_limit_body("secondary rate limit"));
        assert!(!is_rate_limit_body("Resource not accessible by integration"));
    }
}
