//! Token bucket rate limiting for DoS protection.

use std::time::Instant;

#[derive(Debug, Clone)]
pub struct TokenBucket {
    tokens: f64,
    capacity: f64,
    rate_per_sec: f64,
    last_update: Instant,
}

impl TokenBucket {
    pub fn new(capacity: f64, rate_per_sec: f64) -> Self {
        Self {
            tokens: capacity,
            capacity,
            rate_per_sec,
            last_update: Instant::now(),
        }
    }

    fn refill(&mut self) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_update).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.rate_per_sec).min(self.capacity);
        self.last_update = now;
    }

    pub fn try_consume(&mut self, tokens: f64) -> bool {
        self.refill();
        if self.tokens >= tokens {
            self.tokens -= tokens;
            true
        } else {
            false
        }
    }

    pub fn available(&mut self) -> f64 {
        self.refill();
        self.tokens
    }
}

/// Per-connection limiter for malformed / unauthenticated frames.
///
/// A peer repeatedly failing ingress checks is not banned (bans are reserved
/// for verification-prompt failures) but its connection is dropped once the
/// bucket runs dry.
#[derive(Debug, Clone)]
pub struct IngressAbuseLimiter {
    bucket: TokenBucket,
}

impl IngressAbuseLimiter {
    /// 20 bad frames burst, refilling at 1 per second.
    pub fn new() -> Self {
        Self {
            bucket: TokenBucket::new(20.0, 1.0),
        }
    }

    /// Record one rejected frame; returns false when the peer has exhausted
    /// its allowance and should be disconnected.
    pub fn record_bad_frame(&mut self) -> bool {
        self.bucket.try_consume(1.0)
    }
}

impl Default for IngressAbuseLimiter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bucket_consumes_and_refuses() {
        let mut bucket = TokenBucket::new(2.0, 0.0);
        assert!(bucket.try_consume(1.0));
        assert!(bucket.try_consume(1.0));
        assert!(!bucket.try_consume(1.0));
    }

    #[test]
    fn abuse_limiter_exhausts() {
        let mut limiter = IngressAbuseLimiter {
            bucket: TokenBucket::new(3.0, 0.0),
        };
        assert!(limiter.record_bad_frame());
        assert!(limiter.record_bad_frame());
        assert!(limiter.record_bad_frame());
        assert!(!limiter.record_bad_frame());
    }
}
