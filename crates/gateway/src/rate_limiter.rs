//! Per-account token buckets for broker traffic.
//!
//! Reads, order submissions, and cancels draw from separate buckets so a
//! chatty poller cannot starve order flow. Buckets are keyed by account and
//! created lazily; waiting on one account never blocks another.

use std::collections::HashMap;
use std::num::NonZeroU32;
use std::sync::Arc;

use governor::{
    clock::DefaultClock,
    state::{InMemoryState, NotKeyed},
    Quota, RateLimiter,
};
use parking_lot::Mutex;

type DirectLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

/// Requests-per-second budget for one account.
#[derive(Debug, Clone, Copy)]
pub struct RateBudget {
    pub read_rps: NonZeroU32,
    pub order_rps: NonZeroU32,
    pub cancel_rps: NonZeroU32,
}

impl Default for RateBudget {
    fn default() -> Self {
        Self {
            read_rps: nonzero_ext::nonzero!(20u32),
            order_rps: nonzero_ext::nonzero!(5u32),
            cancel_rps: nonzero_ext::nonzero!(5u32),
        }
    }
}

impl RateBudget {
    /// Builds a budget from plain config integers, clamping zeros to one.
    #[must_use]
    pub fn from_config(read_rps: u32, order_rps: u32, cancel_rps: u32) -> Self {
        let clamp = |v: u32| NonZeroU32::new(v.max(1)).expect("clamped to >= 1");
        Self {
            read_rps: clamp(read_rps),
            order_rps: clamp(order_rps),
            cancel_rps: clamp(cancel_rps),
        }
    }
}

struct AccountLimiter {
    read: DirectLimiter,
    order: DirectLimiter,
    cancel: DirectLimiter,
}

impl AccountLimiter {
    fn new(budget: RateBudget) -> Self {
        Self {
            read: RateLimiter::direct(Quota::per_second(budget.read_rps)),
            order: RateLimiter::direct(Quota::per_second(budget.order_rps)),
            cancel: RateLimiter::direct(Quota::per_second(budget.cancel_rps)),
        }
    }
}

/// Lazily-populated map of per-account limiters.
pub struct AccountRateLimiters {
    budget: RateBudget,
    accounts: Mutex<HashMap<String, Arc<AccountLimiter>>>,
}

impl AccountRateLimiters {
    #[must_use]
    pub fn new(budget: RateBudget) -> Self {
        Self {
            budget,
            accounts: Mutex::new(HashMap::new()),
        }
    }

    fn limiter(&self, account_id: &str) -> Arc<AccountLimiter> {
        let mut accounts = self.accounts.lock();
        accounts
            .entry(account_id.to_string())
            .or_insert_with(|| Arc::new(AccountLimiter::new(self.budget)))
            .clone()
    }

    /// Waits for a read token for `account_id`.
    pub async fn wait_for_read(&self, account_id: &str) {
        // The map lock is released before awaiting; only the per-account
        // bucket is waited on.
        let limiter = self.limiter(account_id);
        limiter.read.until_ready().await;
    }

    /// Waits for an order-submission token for `account_id`.
    pub async fn wait_for_order(&self, account_id: &str) {
        let limiter = self.limiter(account_id);
        limiter.order.until_ready().await;
    }

    /// Waits for a cancel token for `account_id`.
    pub async fn wait_for_cancel(&self, account_id: &str) {
        let limiter = self.limiter(account_id);
        limiter.cancel.until_ready().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, Instant};

    #[tokio::test]
    async fn tokens_available_immediately() {
        let limiters = AccountRateLimiters::new(RateBudget::default());
        let start = Instant::now();
        limiters.wait_for_read("a").await;
        limiters.wait_for_order("a").await;
        limiters.wait_for_cancel("a").await;
        assert!(start.elapsed() < Duration::from_millis(50));
    }

    #[tokio::test]
    async fn accounts_have_independent_buckets() {
        let budget = RateBudget::from_config(1, 1, 1);
        let limiters = AccountRateLimiters::new(budget);

        // Drain account a's only order token.
        limiters.wait_for_order("a").await;

        // Account b is unaffected.
        let start = Instant::now();
        limiters.wait_for_order("b").await;
        assert!(start.elapsed() < Duration::from_millis(50));
    }

    #[tokio::test]
    async fn exhausted_bucket_delays() {
        let budget = RateBudget::from_config(2, 2, 2);
        let limiters = AccountRateLimiters::new(budget);

        limiters.wait_for_read("a").await;
        limiters.wait_for_read("a").await;

        let start = Instant::now();
        limiters.wait_for_read("a").await;
        assert!(start.elapsed() >= Duration::from_millis(300));
    }
}
