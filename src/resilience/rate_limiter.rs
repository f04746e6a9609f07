use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::debug;

#[derive(Debug, Clone)]
pub struct RateLimiterSnapshot {
    pub rps: f64,
    pub burst: f64,
    pub tokens: f64,
    /// Estimated wait time until a dispatch is allowed (ms), if currently throttled.
    pub estimated_wait_ms: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct RateLimiterConfig {
    /// Dispatches per second.
    pub rps: f64,
    /// Maximum burst size (tokens).
    pub burst: f64,
}

impl RateLimiterConfig {
    pub fn from_rps(rps: f64) -> Option<Self> {
        if !rps.is_finite() || rps < 0.0 {
            return None;
        }
        Some(Self {
            rps,
            burst: rps.max(1.0), // default burst: 1 second worth, at least 1
        })
    }

    /// No steady-state throttle; only backend rate-limit windows pause dispatch.
    pub fn unlimited() -> Self {
        Self { rps: 0.0, burst: 1.0 }
    }

    pub fn with_burst(mut self, burst: u32) -> Self {
        self.burst = burst.max(1) as f64;
        self
    }
}

#[derive(Debug)]
struct State {
    tokens: f64,
    last: Instant,
    /// Set when the backend signalled a rate-limit window (e.g. HTTP 429).
    blocked_until: Option<Instant>,
}

/// Token-bucket throttle in front of the batch processor.
///
/// Each dispatched batch consumes one token; `rps == 0` disables the steady-state throttle
/// but still honours windows set through [`RateLimiter::block_for`].
pub struct RateLimiter {
    cfg: RateLimiterConfig,
    state: Mutex<State>,
}

impl RateLimiter {
    pub fn new(cfg: RateLimiterConfig) -> Self {
        let state = Mutex::new(State {
            tokens: cfg.burst,
            last: Instant::now(),
            blocked_until: None,
        });
        Self { cfg, state }
    }

    fn refill_locked(cfg: &RateLimiterConfig, st: &mut State) {
        let now = Instant::now();
        let elapsed = now.duration_since(st.last).as_secs_f64();
        if elapsed > 0.0 {
            st.tokens = (st.tokens + elapsed * cfg.rps).min(cfg.burst);
            st.last = now;
        }
    }

    /// Acquire one dispatch token (may sleep).
    pub async fn acquire(&self) {
        let cfg = &self.cfg;
        loop {
            let wait_duration = {
                let mut st = self.state.lock().await;
                let now = Instant::now();
                match st.blocked_until {
                    Some(until) if until > now => until.duration_since(now),
                    _ => {
                        st.blocked_until = None;
                        if cfg.rps <= 0.0 {
                            return;
                        }
                        Self::refill_locked(cfg, &mut st);
                        if st.tokens >= 1.0 {
                            st.tokens -= 1.0;
                            return;
                        }
                        let missing = 1.0 - st.tokens;
                        Duration::from_secs_f64(missing / cfg.rps)
                    }
                }
            };
            if !wait_duration.is_zero() {
                debug!(wait_ms = wait_duration.as_millis() as u64, "dispatch throttled");
                tokio::time::sleep(wait_duration).await;
            }
        }
    }

    /// Pause all dispatches for `window`, e.g. after the backend answered 429.
    pub async fn block_for(&self, window: Duration) {
        let mut st = self.state.lock().await;
        let until = Instant::now() + window;
        st.blocked_until = Some(st.blocked_until.map_or(until, |cur| cur.max(until)));
    }

    pub async fn snapshot(&self) -> RateLimiterSnapshot {
        let cfg = &self.cfg;
        let mut st = self.state.lock().await;
        let now = Instant::now();

        let mut wait_ms = st
            .blocked_until
            .filter(|until| *until > now)
            .map(|until| until.duration_since(now).as_millis() as u64);

        if cfg.rps > 0.0 {
            Self::refill_locked(cfg, &mut st);
            if st.tokens < 1.0 {
                let missing = 1.0 - st.tokens;
                let local_wait_ms = (missing / cfg.rps * 1000.0) as u64;
                wait_ms = Some(wait_ms.unwrap_or(0).max(local_wait_ms));
            }
        }

        RateLimiterSnapshot {
            rps: cfg.rps,
            burst: cfg.burst,
            tokens: st.tokens,
            estimated_wait_ms: wait_ms,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rate_limiter_config_from_rps() {
        let config = RateLimiterConfig::from_rps(10.0).unwrap();
        assert_eq!(config.rps, 10.0);
        assert_eq!(config.burst, 10.0);

        let low = RateLimiterConfig::from_rps(0.5).unwrap();
        assert_eq!(low.burst, 1.0);
    }

    #[test]
    fn test_rate_limiter_config_from_rps_invalid() {
        assert!(RateLimiterConfig::from_rps(-1.0).is_none());
        assert!(RateLimiterConfig::from_rps(f64::NAN).is_none());
        assert!(RateLimiterConfig::from_rps(f64::INFINITY).is_none());
    }

    #[tokio::test]
    async fn test_burst_then_empty() {
        let config = RateLimiterConfig::from_rps(1.0).unwrap().with_burst(3);
        let limiter = RateLimiter::new(config);

        for _ in 0..3 {
            limiter.acquire().await;
        }
        let snapshot = limiter.snapshot().await;
        assert!(snapshot.tokens < 1.0);
        assert!(snapshot.estimated_wait_ms.is_some());
    }

    #[tokio::test]
    async fn test_unlimited_never_waits() {
        let limiter = RateLimiter::new(RateLimiterConfig::unlimited());
        let start = Instant::now();
        for _ in 0..100 {
            limiter.acquire().await;
        }
        assert!(start.elapsed() < Duration::from_millis(50));
        assert!(limiter.snapshot().await.estimated_wait_ms.is_none());
    }

    #[tokio::test]
    async fn test_block_for_pauses_dispatch() {
        let limiter = RateLimiter::new(RateLimiterConfig::unlimited());
        limiter.block_for(Duration::from_millis(40)).await;
        assert!(limiter.snapshot().await.estimated_wait_ms.is_some());

        let start = Instant::now();
        limiter.acquire().await;
        assert!(start.elapsed() >= Duration::from_millis(30));
    }

    #[tokio::test]
    async fn test_rate_limiter_refill() {
        let config = RateLimiterConfig::from_rps(100.0).unwrap().with_burst(5);
        let limiter = RateLimiter::new(config);

        for _ in 0..5 {
            limiter.acquire().await;
        }
        assert!(limiter.snapshot().await.tokens < 1.0);

        // 100 rps = 1 token / 10ms
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(limiter.snapshot().await.tokens >= 1.0);
    }
}
