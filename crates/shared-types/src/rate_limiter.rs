//! # Rate Limiter
//!
//! Token bucket with deterministic integer refill, one bucket per exchange.
//! Exhaustion surfaces as a `rate_limited` rejection at the pipeline, never
//! as blocking.

use std::collections::HashMap;

/// Token bucket with millisecond-resolution deterministic refill.
///
/// Refill arithmetic is pure integer math over elapsed milliseconds, so two
/// buckets fed the same clock observations always agree. Callers pass the
/// clock in (`try_acquire_at`), which is also what makes the bucket testable
/// without sleeping.
#[derive(Debug, Clone)]
pub struct TokenBucket {
    /// Maximum tokens (burst size).
    capacity: u64,
    /// Tokens added per second.
    refill_per_sec: u64,
    /// Current whole tokens.
    tokens: u64,
    /// Milliseconds of refill credit not yet worth a whole token.
    remainder_ms: u64,
    /// Clock value at the last refill observation.
    last_refill_ms: i64,
}

impl TokenBucket {
    /// Create a full bucket.
    ///
    /// `capacity` is the burst size; `refill_per_sec` the sustained rate.
    #[must_use]
    pub fn new(capacity: u64, refill_per_sec: u64, now_ms: i64) -> Self {
        Self {
            capacity,
            refill_per_sec,
            tokens: capacity,
            remainder_ms: 0,
            last_refill_ms: now_ms,
        }
    }

    /// Try to take `cost` tokens at the given clock reading.
    ///
    /// Returns `true` if the tokens were available.
    pub fn try_acquire_at(&mut self, cost: u64, now_ms: i64) -> bool {
        self.refill(now_ms);
        if self.tokens >= cost {
            self.tokens -= cost;
            true
        } else {
            false
        }
    }

    /// Tokens currently available at the given clock reading.
    pub fn available_at(&mut self, now_ms: i64) -> u64 {
        self.refill(now_ms);
        self.tokens
    }

    fn refill(&mut self, now_ms: i64) {
        let elapsed = now_ms.saturating_sub(self.last_refill_ms);
        if elapsed <= 0 || self.refill_per_sec == 0 {
            return;
        }
        self.last_refill_ms = now_ms;

        let credit_ms = self.remainder_ms + (elapsed as u64) * self.refill_per_sec;
        let new_tokens = credit_ms / 1_000;
        self.remainder_ms = credit_ms % 1_000;
        self.tokens = (self.tokens + new_tokens).min(self.capacity);
        if self.tokens == self.capacity {
            // Full bucket carries no fractional credit.
            self.remainder_ms = 0;
        }
    }
}

/// Buckets keyed by exchange name, created on first use from a shared
/// default rate.
#[derive(Debug)]
pub struct BucketRegistry {
    default_capacity: u64,
    default_rate: u64,
    buckets: HashMap<String, TokenBucket>,
}

impl BucketRegistry {
    /// Registry where every exchange gets `rate` tokens/sec with an equal
    /// burst, unless overridden.
    #[must_use]
    pub fn new(rate: u64) -> Self {
        Self {
            default_capacity: rate,
            default_rate: rate,
            buckets: HashMap::new(),
        }
    }

    /// Override the bucket for one exchange.
    pub fn set(&mut self, exchange: &str, capacity: u64, rate: u64, now_ms: i64) {
        self.buckets
            .insert(exchange.to_string(), TokenBucket::new(capacity, rate, now_ms));
    }

    /// Acquire one token for an exchange at the given clock reading.
    pub fn try_acquire_at(&mut self, exchange: &str, cost: u64, now_ms: i64) -> bool {
        let (capacity, rate) = (self.default_capacity, self.default_rate);
        self.buckets
            .entry(exchange.to_string())
            .or_insert_with(|| TokenBucket::new(capacity, rate, now_ms))
            .try_acquire_at(cost, now_ms)
    }
}
