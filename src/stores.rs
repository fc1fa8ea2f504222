//! Ledger store interfaces
//!
//! The wallet, money-token, and history stores, the linked external
//! account mover, and the rate-limiter backing store are external
//! collaborators. The orchestrator and recovery loop only ever see
//! these traits.
//!
//! # Safety Invariants
//!
//! 1. **CAS, not locks**: wallet balance changes go through
//!    `update_amount_if` and callers retry on conflict
//! 2. Every store serializes its own internal access
//! 3. `TokenStore::delete` reports whether the row existed, so
//!    delete-then-use gives exactly-once redemption

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::models::{HistoryDraft, HistoryRecord, MoneyToken, Wallet};

/// Failures surfaced by the backing stores.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("Row not found")]
    NotFound,

    #[error("Row already exists")]
    AlreadyExists,

    #[error("Concurrent update conflict")]
    Conflict,

    #[error("Store unavailable: {0}")]
    Unavailable(String),
}

// ============================================================
// TRAITS
// ============================================================

#[async_trait]
pub trait WalletStore: Send + Sync {
    async fn find(&self, user_id: u64) -> Result<Option<Wallet>, StoreError>;

    async fn create(&self, wallet: Wallet) -> Result<(), StoreError>;

    /// Atomic conditional update: set `amount`/`seen` only if the stored
    /// amount still equals `expected`. Returns false on mismatch.
    async fn update_amount_if(
        &self,
        user_id: u64,
        expected: u64,
        new_amount: u64,
        seen: bool,
    ) -> Result<bool, StoreError>;
}

#[async_trait]
pub trait TokenStore: Send + Sync {
    async fn find(&self, code: &str) -> Result<Option<MoneyToken>, StoreError>;

    async fn create(&self, token: MoneyToken) -> Result<(), StoreError>;

    /// Delete by code. Returns whether a row was removed, so a raced
    /// second redemption observes `false` and fails.
    async fn delete(&self, code: &str) -> Result<bool, StoreError>;

    /// Out-of-band sweep of expired tokens. Returns rows purged.
    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<usize, StoreError>;
}

#[async_trait]
pub trait HistoryStore: Send + Sync {
    /// Append a record; the store assigns the id.
    async fn create(&self, draft: HistoryDraft) -> Result<HistoryRecord, StoreError>;

    async fn find(&self, id: u64) -> Result<Option<HistoryRecord>, StoreError>;

    async fn list_for_user(&self, user_id: u64) -> Result<Vec<HistoryRecord>, StoreError>;
}

/// Third-party linked account provider: moves funds across the ledger
/// boundary for recharge/withdraw/drain.
#[async_trait]
pub trait LinkedAccountGateway: Send + Sync {
    async fn debit(&self, account_id: &str, amount: u64) -> Result<(), StoreError>;

    async fn credit(&self, account_id: &str, amount: u64) -> Result<(), StoreError>;
}

/// Fast expiring key-value store backing the daily window.
#[async_trait]
pub trait RateStore: Send + Sync {
    /// Current rolling total, `None` if absent or expired.
    async fn get(&self, user_id: u64) -> Result<Option<u64>, StoreError>;

    /// Store a total, resetting its expiry.
    async fn set(&self, user_id: u64, total: u64, ttl: Duration) -> Result<(), StoreError>;
}

// ============================================================
// CAS DELTA HELPER
// ============================================================

/// Why a balance change could not be applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApplyError {
    WalletNotFound,
    InsufficientBalance,
    Store(StoreError),
}

impl From<StoreError> for ApplyError {
    fn from(e: StoreError) -> Self {
        ApplyError::Store(e)
    }
}

/// Apply a signed delta to a wallet balance via CAS, retrying on
/// conflict up to `retries` times.
///
/// A credit flips `seen` to false (the owner has not viewed it); a
/// debit leaves the flag alone. Returns the wallet as written.
pub async fn apply_wallet_delta(
    store: &dyn WalletStore,
    user_id: u64,
    delta: i64,
    retries: u32,
) -> Result<Wallet, ApplyError> {
    for _ in 0..=retries {
        let wallet = store
            .find(user_id)
            .await?
            .ok_or(ApplyError::WalletNotFound)?;

        let new_amount = if delta >= 0 {
            wallet
                .amount
                .checked_add(delta as u64)
                .ok_or(ApplyError::Store(StoreError::Conflict))?
        } else {
            wallet
                .amount
                .checked_sub(delta.unsigned_abs())
                .ok_or(ApplyError::InsufficientBalance)?
        };

        let seen = if delta > 0 { false } else { wallet.seen };

        if store
            .update_amount_if(user_id, wallet.amount, new_amount, seen)
            .await?
        {
            return Ok(Wallet {
                user_id,
                amount: new_amount,
                seen,
            });
        }
        // Lost the CAS race, re-read and retry
    }

    Err(ApplyError::Store(StoreError::Conflict))
}

// ============================================================
// IN-MEMORY IMPLEMENTATIONS
// ============================================================
//
// Used by the daemon skeleton and by tests. Failure flags let tests
// force the mutation/compensation branches.

#[derive(Default)]
pub struct MemoryWalletStore {
    inner: Mutex<HashMap<u64, Wallet>>,
    /// Users whose updates are forced to fail
    fail_updates: Mutex<std::collections::HashSet<u64>>,
    /// Users whose balance *increases* are forced to fail; debits pass
    fail_credits: Mutex<std::collections::HashSet<u64>>,
}

impl MemoryWalletStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_fail_updates(&self, user_id: u64, fail: bool) {
        let mut set = self.fail_updates.lock().unwrap();
        if fail {
            set.insert(user_id);
        } else {
            set.remove(&user_id);
        }
    }

    pub fn set_fail_credits(&self, user_id: u64, fail: bool) {
        let mut set = self.fail_credits.lock().unwrap();
        if fail {
            set.insert(user_id);
        } else {
            set.remove(&user_id);
        }
    }

    fn update_fails_for(&self, user_id: u64, increases: bool) -> bool {
        if self.fail_updates.lock().unwrap().contains(&user_id) {
            return true;
        }
        increases && self.fail_credits.lock().unwrap().contains(&user_id)
    }
}

#[async_trait]
impl WalletStore for MemoryWalletStore {
    async fn find(&self, user_id: u64) -> Result<Option<Wallet>, StoreError> {
        Ok(self.inner.lock().unwrap().get(&user_id).cloned())
    }

    async fn create(&self, wallet: Wallet) -> Result<(), StoreError> {
        let mut map = self.inner.lock().unwrap();
        if map.contains_key(&wallet.user_id) {
            return Err(StoreError::AlreadyExists);
        }
        map.insert(wallet.user_id, wallet);
        Ok(())
    }

    async fn update_amount_if(
        &self,
        user_id: u64,
        expected: u64,
        new_amount: u64,
        seen: bool,
    ) -> Result<bool, StoreError> {
        if self.update_fails_for(user_id, new_amount > expected) {
            return Err(StoreError::Unavailable("wallet update forced failure".into()));
        }
        let mut map = self.inner.lock().unwrap();
        let wallet = map.get_mut(&user_id).ok_or(StoreError::NotFound)?;
        if wallet.amount != expected {
            return Ok(false);
        }
        wallet.amount = new_amount;
        wallet.seen = seen;
        Ok(true)
    }
}

#[derive(Default)]
pub struct MemoryTokenStore {
    inner: Mutex<HashMap<String, MoneyToken>>,
    fail_create: Mutex<bool>,
}

impl MemoryTokenStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_fail_create(&self, fail: bool) {
        *self.fail_create.lock().unwrap() = fail;
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl TokenStore for MemoryTokenStore {
    async fn find(&self, code: &str) -> Result<Option<MoneyToken>, StoreError> {
        Ok(self.inner.lock().unwrap().get(code).cloned())
    }

    async fn create(&self, token: MoneyToken) -> Result<(), StoreError> {
        if *self.fail_create.lock().unwrap() {
            return Err(StoreError::Unavailable("token create forced failure".into()));
        }
        let mut map = self.inner.lock().unwrap();
        if map.contains_key(&token.code) {
            return Err(StoreError::AlreadyExists);
        }
        map.insert(token.code.clone(), token);
        Ok(())
    }

    async fn delete(&self, code: &str) -> Result<bool, StoreError> {
        Ok(self.inner.lock().unwrap().remove(code).is_some())
    }

    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<usize, StoreError> {
        let mut map = self.inner.lock().unwrap();
        let before = map.len();
        map.retain(|_, t| !t.is_expired(now));
        Ok(before - map.len())
    }
}

#[derive(Default)]
pub struct MemoryHistoryStore {
    inner: Mutex<Vec<HistoryRecord>>,
    next_id: AtomicU64,
    fail_create: Mutex<bool>,
}

impl MemoryHistoryStore {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            ..Self::default()
        }
    }

    pub fn set_fail_create(&self, fail: bool) {
        *self.fail_create.lock().unwrap() = fail;
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl HistoryStore for MemoryHistoryStore {
    async fn create(&self, draft: HistoryDraft) -> Result<HistoryRecord, StoreError> {
        if *self.fail_create.lock().unwrap() {
            return Err(StoreError::Unavailable("history create forced failure".into()));
        }
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let record = draft.into_record(id);
        self.inner.lock().unwrap().push(record.clone());
        Ok(record)
    }

    async fn find(&self, id: u64) -> Result<Option<HistoryRecord>, StoreError> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .iter()
            .find(|r| r.id == id)
            .cloned())
    }

    async fn list_for_user(&self, user_id: u64) -> Result<Vec<HistoryRecord>, StoreError> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .iter()
            .filter(|r| r.sender_id == user_id || r.receiver_id == user_id)
            .cloned()
            .collect())
    }
}

#[derive(Default)]
pub struct MemoryLinkedAccounts {
    balances: Mutex<HashMap<String, u64>>,
    fail_debit: Mutex<bool>,
    fail_credit: Mutex<bool>,
}

impl MemoryLinkedAccounts {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_balance(self, account_id: &str, amount: u64) -> Self {
        self.balances
            .lock()
            .unwrap()
            .insert(account_id.to_string(), amount);
        self
    }

    pub fn set_fail_debit(&self, fail: bool) {
        *self.fail_debit.lock().unwrap() = fail;
    }

    pub fn set_fail_credit(&self, fail: bool) {
        *self.fail_credit.lock().unwrap() = fail;
    }

    pub fn balance(&self, account_id: &str) -> u64 {
        self.balances
            .lock()
            .unwrap()
            .get(account_id)
            .copied()
            .unwrap_or(0)
    }
}

#[async_trait]
impl LinkedAccountGateway for MemoryLinkedAccounts {
    async fn debit(&self, account_id: &str, amount: u64) -> Result<(), StoreError> {
        if *self.fail_debit.lock().unwrap() {
            return Err(StoreError::Unavailable("linked debit forced failure".into()));
        }
        let mut map = self.balances.lock().unwrap();
        let balance = map.get_mut(account_id).ok_or(StoreError::NotFound)?;
        *balance = balance
            .checked_sub(amount)
            .ok_or(StoreError::Unavailable("linked account overdrawn".into()))?;
        Ok(())
    }

    async fn credit(&self, account_id: &str, amount: u64) -> Result<(), StoreError> {
        if *self.fail_credit.lock().unwrap() {
            return Err(StoreError::Unavailable("linked credit forced failure".into()));
        }
        let mut map = self.balances.lock().unwrap();
        *map.entry(account_id.to_string()).or_insert(0) += amount;
        Ok(())
    }
}

#[derive(Default)]
pub struct MemoryRateStore {
    inner: Mutex<HashMap<u64, (u64, Instant)>>,
}

impl MemoryRateStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RateStore for MemoryRateStore {
    async fn get(&self, user_id: u64) -> Result<Option<u64>, StoreError> {
        let mut map = self.inner.lock().unwrap();
        match map.get(&user_id) {
            Some((total, deadline)) if Instant::now() < *deadline => Ok(Some(*total)),
            Some(_) => {
                map.remove(&user_id);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn set(&self, user_id: u64, total: u64, ttl: Duration) -> Result<(), StoreError> {
        self.inner
            .lock()
            .unwrap()
            .insert(user_id, (total, Instant::now() + ttl));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::TransferMethod;

    #[tokio::test]
    async fn test_wallet_cas() {
        let store = MemoryWalletStore::new();
        store.create(Wallet::new(1, 100)).await.unwrap();

        // Matching expectation succeeds
        assert!(store.update_amount_if(1, 100, 80, true).await.unwrap());
        // Stale expectation fails without mutating
        assert!(!store.update_amount_if(1, 100, 60, true).await.unwrap());
        assert_eq!(store.find(1).await.unwrap().unwrap().amount, 80);
    }

    #[tokio::test]
    async fn test_apply_delta_credit_clears_seen() {
        let store = MemoryWalletStore::new();
        store.create(Wallet::new(1, 100)).await.unwrap();

        let w = apply_wallet_delta(&store, 1, 50, 3).await.unwrap();
        assert_eq!(w.amount, 150);
        assert!(!w.seen);

        let w = apply_wallet_delta(&store, 1, -150, 3).await.unwrap();
        assert_eq!(w.amount, 0);
    }

    #[tokio::test]
    async fn test_apply_delta_insufficient() {
        let store = MemoryWalletStore::new();
        store.create(Wallet::new(1, 10)).await.unwrap();

        let err = apply_wallet_delta(&store, 1, -11, 3).await.unwrap_err();
        assert_eq!(err, ApplyError::InsufficientBalance);

        let err = apply_wallet_delta(&store, 9, 5, 3).await.unwrap_err();
        assert_eq!(err, ApplyError::WalletNotFound);
    }

    #[tokio::test]
    async fn test_token_delete_reports_presence() {
        let store = MemoryTokenStore::new();
        let token = MoneyToken::new(500, TransferMethod::TransactionQrCode, 1);
        let code = token.code.clone();
        store.create(token).await.unwrap();

        assert!(store.delete(&code).await.unwrap());
        assert!(!store.delete(&code).await.unwrap());
    }

    #[tokio::test]
    async fn test_token_purge_expired() {
        let store = MemoryTokenStore::new();
        let token = MoneyToken::new(500, TransferMethod::PaymentQrCode, 1);
        store.create(token.clone()).await.unwrap();

        assert_eq!(store.purge_expired(Utc::now()).await.unwrap(), 0);
        assert_eq!(store.purge_expired(token.expires_at).await.unwrap(), 1);
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_history_assigns_ids() {
        let store = MemoryHistoryStore::new();
        let draft = HistoryDraft::new(1, 2, TransferMethod::OnePayId, None, 10, Utc::now());
        let a = store.create(draft.clone()).await.unwrap();
        let b = store.create(draft).await.unwrap();
        assert_eq!(a.id, 1);
        assert_eq!(b.id, 2);
        assert_eq!(store.list_for_user(2).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_rate_store_expiry() {
        let store = MemoryRateStore::new();
        store.set(1, 500, Duration::from_secs(60)).await.unwrap();
        assert_eq!(store.get(1).await.unwrap(), Some(500));

        store.set(2, 300, Duration::from_millis(0)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert_eq!(store.get(2).await.unwrap(), None);
    }
}
