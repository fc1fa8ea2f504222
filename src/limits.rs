//! Daily transaction rate limiting
//!
//! Advisory rolling 24-hour window per user, kept in a fast expiring
//! key-value store. The window is recorded only after a transfer's
//! risky step succeeds, so a crash between wallet mutation and window
//! update under-counts rather than over-counts.

use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use crate::stores::{RateStore, StoreError};

/// Rolling window length.
pub const DAILY_WINDOW: Duration = Duration::from_secs(24 * 60 * 60);

/// Advisory enforcement of the daily transacted-amount cap.
#[derive(Clone)]
pub struct RateLimiter {
    store: Arc<dyn RateStore>,
    cap: u64,
}

impl RateLimiter {
    pub fn new(store: Arc<dyn RateStore>, cap: u64) -> Self {
        Self { store, cap }
    }

    /// Would transacting `amount` push the user over the daily cap?
    ///
    /// Read-only; a total that lands exactly on the cap is allowed.
    pub async fn exceeds_daily_cap(&self, user_id: u64, amount: u64) -> Result<bool, StoreError> {
        let total = self.store.get(user_id).await?.unwrap_or(0);
        Ok(total.saturating_add(amount) > self.cap)
    }

    /// Add `amount` to the rolling total and reset its 24-hour expiry.
    pub async fn record_transacted(&self, user_id: u64, amount: u64) -> Result<(), StoreError> {
        let total = self.store.get(user_id).await?.unwrap_or(0);
        let new_total = total.saturating_add(amount);
        self.store.set(user_id, new_total, DAILY_WINDOW).await?;
        debug!(user_id, total = new_total, "Daily window updated");
        Ok(())
    }

    /// Current rolling total (zero when absent or expired).
    pub async fn current_total(&self, user_id: u64) -> Result<u64, StoreError> {
        Ok(self.store.get(user_id).await?.unwrap_or(0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stores::MemoryRateStore;

    fn limiter(cap: u64) -> RateLimiter {
        RateLimiter::new(Arc::new(MemoryRateStore::new()), cap)
    }

    #[tokio::test]
    async fn test_cap_boundary() {
        let limiter = limiter(1000);
        limiter.record_transacted(1, 900).await.unwrap();

        // total + amount == cap is allowed
        assert!(!limiter.exceeds_daily_cap(1, 100).await.unwrap());
        // one over is rejected
        assert!(limiter.exceeds_daily_cap(1, 101).await.unwrap());
    }

    #[tokio::test]
    async fn test_check_does_not_mutate() {
        let limiter = limiter(1000);
        assert!(!limiter.exceeds_daily_cap(1, 600).await.unwrap());
        assert!(!limiter.exceeds_daily_cap(1, 600).await.unwrap());
        assert_eq!(limiter.current_total(1).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_accumulation() {
        let limiter = limiter(1000);
        limiter.record_transacted(1, 300).await.unwrap();
        limiter.record_transacted(1, 300).await.unwrap();
        assert_eq!(limiter.current_total(1).await.unwrap(), 600);
        assert!(limiter.exceeds_daily_cap(1, 500).await.unwrap());
    }

    #[tokio::test]
    async fn test_missing_window_defaults_to_zero() {
        let limiter = limiter(100);
        assert!(!limiter.exceeds_daily_cap(42, 100).await.unwrap());
        assert!(limiter.exceeds_daily_cap(42, 101).await.unwrap());
    }

    #[tokio::test]
    async fn test_saturating_totals() {
        let limiter = limiter(u64::MAX);
        limiter.record_transacted(1, u64::MAX - 1).await.unwrap();
        limiter.record_transacted(1, 10).await.unwrap();
        assert_eq!(limiter.current_total(1).await.unwrap(), u64::MAX);
    }
}
