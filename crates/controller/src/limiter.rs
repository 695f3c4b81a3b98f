use std::fmt;
use std::num::NonZeroU32;
use std::time::Duration;

use governor::clock::DefaultClock;
use governor::middleware::NoOpMiddleware;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter};

use crate::ConfigError;

type DirectLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock, NoOpMiddleware>;

/// Token bucket shared by every requeue of one controller.
///
/// Refills at `qps` tokens per second up to `burst`. Not per key: one hot key
/// can hold back the requeues of unrelated keys.
pub struct TokenBucket {
    qps: f64,
    burst: u32,
    limiter: DirectLimiter,
}

impl fmt::Debug for TokenBucket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenBucket").field("qps", &self.qps).field("burst", &self.burst).finish()
    }
}

impl TokenBucket {
    pub fn new(qps: f64, burst: u32) -> Result<Self, ConfigError> {
        let invalid = || ConfigError::InvalidRate { qps, burst };
        if !(qps.is_finite() && qps > 0.0) {
            return Err(invalid());
        }
        let period = Duration::try_from_secs_f64(qps.recip()).map_err(|_| invalid())?;
        let burst_size = NonZeroU32::new(burst).ok_or_else(invalid)?;
        let quota = Quota::with_period(period).ok_or_else(invalid)?.allow_burst(burst_size);
        Ok(Self { qps, burst, limiter: RateLimiter::direct(quota) })
    }

    pub fn qps(&self) -> f64 {
        self.qps
    }

    pub fn burst(&self) -> u32 {
        self.burst
    }

    /// Take a token if one is available right now.
    pub fn try_accept(&self) -> bool {
        self.limiter.check().is_ok()
    }

    /// Take a token, waiting until the bucket has produced it.
    pub async fn accept(&self) {
        self.limiter.until_ready().await;
    }
}

#[cfg(test)]
mod tests {
    use std::time::Instant;

    use super::*;

    #[test]
    fn rejects_degenerate_rates() {
        assert!(TokenBucket::new(0.0, 10).is_err());
        assert!(TokenBucket::new(-1.0, 10).is_err());
        assert!(TokenBucket::new(f64::NAN, 10).is_err());
        assert!(TokenBucket::new(f64::INFINITY, 10).is_err());
        assert!(TokenBucket::new(1e-320, 10).is_err());
        assert!(TokenBucket::new(1.0, 0).is_err());
        let tb = TokenBucket::new(2.5, 4).unwrap();
        assert_eq!((tb.qps(), tb.burst()), (2.5, 4));
    }

    #[tokio::test]
    async fn burst_then_steady_rate() {
        let tb = TokenBucket::new(20.0, 3).unwrap();
        let t0 = Instant::now();
        for _ in 0..3 {
            tb.accept().await;
        }
        assert!(t0.elapsed() < Duration::from_millis(40), "{:?}", t0.elapsed());
        tb.accept().await;
        tb.accept().await;
        // Two more tokens at 50ms apiece.
        let waited = t0.elapsed();
        assert!(waited >= Duration::from_millis(80), "{waited:?}");
        assert!(waited < Duration::from_secs(1), "{waited:?}");
    }

    #[tokio::test]
    async fn try_accept_refills_over_time() {
        let tb = TokenBucket::new(20.0, 1).unwrap();
        assert!(tb.try_accept());
        assert!(!tb.try_accept());
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert!(tb.try_accept());
    }
}
