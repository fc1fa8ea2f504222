//! Transfer orchestrator
//!
//! Executes each financial operation as an ordered sequence of store
//! mutations with a single point-of-no-return step, and leaves the
//! system provably recoverable when anything after that point fails.
//!
//! # Safety Invariants
//!
//! 1. **Checkpoint-before-risky**: the before-image is durable in the
//!    checkpoint log before the risky mutation is attempted
//! 2. **Removal is the commit point**: an entry is removed only once
//!    its outcome is confirmed safe (mutation landed, or compensation
//!    undid it)
//! 3. **Double failure leaves the entry**: when a mutation and its
//!    compensation both fail, the entry stays, a distinguished
//!    checkpoint error is returned, and the recovery loop is signaled
//! 4. **Funds beat bookkeeping**: a history-append failure never rolls
//!    back an already-settled funds movement

mod external;
mod qr;

use std::io;
use std::sync::Arc;

use tracing::{error, info, warn};

use crate::checkpoint::{CheckpointEntry, CheckpointLog};
use crate::config::LedgerConfig;
use crate::error::LedgerError;
use crate::limits::RateLimiter;
use crate::models::{HistoryDraft, TransferMethod, Wallet};
use crate::recovery::RecoverySignal;
use crate::stores::{
    ApplyError, HistoryStore, LinkedAccountGateway, StoreError, TokenStore, WalletStore,
    apply_wallet_delta,
};

/// Orchestrates every balance-affecting operation.
pub struct Orchestrator {
    wallets: Arc<dyn WalletStore>,
    tokens: Arc<dyn TokenStore>,
    history: Arc<dyn HistoryStore>,
    linked: Arc<dyn LinkedAccountGateway>,
    log: Arc<CheckpointLog>,
    limiter: RateLimiter,
    config: LedgerConfig,
    recovery: RecoverySignal,
}

impl Orchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        wallets: Arc<dyn WalletStore>,
        tokens: Arc<dyn TokenStore>,
        history: Arc<dyn HistoryStore>,
        linked: Arc<dyn LinkedAccountGateway>,
        log: Arc<CheckpointLog>,
        limiter: RateLimiter,
        config: LedgerConfig,
        recovery: RecoverySignal,
    ) -> Self {
        Self {
            wallets,
            tokens,
            history,
            linked,
            log,
            limiter,
            config,
            recovery,
        }
    }

    pub fn config(&self) -> &LedgerConfig {
        &self.config
    }

    /// Send `amount` directly to another user's wallet.
    ///
    /// Sender is debited `amount + fee`; receiver is credited `amount`.
    pub async fn send_to_user(
        &self,
        sender_id: u64,
        receiver_id: u64,
        amount: u64,
    ) -> Result<(), LedgerError> {
        if sender_id == receiver_id {
            return Err(LedgerError::TransactionWithSelf);
        }
        self.ensure_base_limit(amount, self.config.base_limit)?;
        self.require_wallet(sender_id, LedgerError::SenderNotFound)
            .await?;
        self.require_wallet(receiver_id, LedgerError::ReceiverNotFound)
            .await?;
        let charged = amount
            .checked_add(self.config.fee)
            .ok_or(LedgerError::DailyTransactionLimit)?;
        self.ensure_daily_cap(sender_id, charged).await?;

        // Debit first; nothing else has changed if this fails
        self.debit(sender_id, charged, LedgerError::SenderNotFound)
            .await?;

        // Risky step: the receiver credit
        let leg = self
            .pair_credit_leg(receiver_id, amount, sender_id, charged)
            .await;

        match leg {
            Ok(()) => {
                if let Err(e) = self.limiter.record_transacted(sender_id, amount).await {
                    // Advisory window only; never fails the transfer
                    warn!(sender_id, error = %e, "Failed to update daily window");
                }
                info!(sender_id, receiver_id, amount, "Direct transfer settled");
                self.append_history(HistoryDraft::new(
                    sender_id,
                    receiver_id,
                    TransferMethod::OnePayId,
                    None,
                    amount,
                    chrono::Utc::now(),
                ))
                .await
            }
            Err(e) if e.is_checkpoint() => {
                // Funds will settle forward via recovery; history still owed
                let _ = self
                    .append_history(HistoryDraft::new(
                        sender_id,
                        receiver_id,
                        TransferMethod::OnePayId,
                        None,
                        amount,
                        chrono::Utc::now(),
                    ))
                    .await;
                Err(e)
            }
            Err(e) => Err(e), // clean rollback, no funds moved
        }
    }

    // ============================================================
    // SHARED LEGS
    // ============================================================

    /// The wallet-pair credit leg: checkpoint the credit, attempt it,
    /// and compensate the already-applied debit on failure.
    ///
    /// Returns a checkpoint error (entry left, recovery signaled) when
    /// both the credit and the compensation fail; any other error means
    /// the debit was cleanly undone.
    pub(crate) async fn pair_credit_leg(
        &self,
        credit_user: u64,
        credit_amount: u64,
        debit_user: u64,
        debit_amount: u64,
    ) -> Result<(), LedgerError> {
        let entry = CheckpointEntry::WalletDelta {
            user_id: credit_user,
            delta: credit_amount as i64,
        };
        if let Err(e) = self.append_cp(&entry) {
            // Log is down before the risky step: undo the debit and bail
            if self.credit(debit_user, debit_amount).await.is_err() {
                error!(
                    debit_user,
                    debit_amount, "Debit stuck with checkpoint log down; manual reconciliation"
                );
            }
            return Err(e);
        }

        match self.credit(credit_user, credit_amount).await {
            Ok(()) => {
                self.remove_cp(&entry);
                Ok(())
            }
            Err(e) => {
                warn!(
                    credit_user,
                    credit_amount,
                    error = %e,
                    "Credit failed, compensating debit"
                );
                match self.credit(debit_user, debit_amount).await {
                    Ok(()) => {
                        self.remove_cp(&entry);
                        Err(e)
                    }
                    Err(undo_err) => {
                        // The checkpoint entry is now the only durable
                        // record that the credit is owed
                        error!(
                            credit_user,
                            debit_user,
                            error = %undo_err,
                            "Compensation failed, leaving wallet checkpoint"
                        );
                        Err(self.raise_checkpoint(LedgerError::WalletCheckpoint))
                    }
                }
            }
        }
    }

    /// Checkpoint-guarded history append. Never rolls funds back.
    pub(crate) async fn append_history(&self, draft: HistoryDraft) -> Result<(), LedgerError> {
        let entry = CheckpointEntry::HistorySnapshot(draft.clone());
        let logged = match self.append_cp(&entry) {
            Ok(()) => true,
            Err(e) => {
                warn!(error = %e, "History checkpoint append failed, trying store directly");
                false
            }
        };

        match self.history.create(draft).await {
            Ok(record) => {
                if logged {
                    self.remove_cp(&entry);
                }
                info!(id = record.id, "History appended");
                Ok(())
            }
            Err(e) => {
                warn!(error = %e, "History append failed, leaving checkpoint");
                Err(self.raise_checkpoint(LedgerError::HistoryCheckpoint))
            }
        }
    }

    // ============================================================
    // VALIDATION HELPERS
    // ============================================================

    pub(crate) fn ensure_base_limit(&self, amount: u64, limit: u64) -> Result<(), LedgerError> {
        if amount < limit {
            return Err(LedgerError::TransactionBaseLimit);
        }
        Ok(())
    }

    pub(crate) async fn ensure_daily_cap(&self, user_id: u64, amount: u64) -> Result<(), LedgerError> {
        if self.limiter.exceeds_daily_cap(user_id, amount).await? {
            return Err(LedgerError::DailyTransactionLimit);
        }
        Ok(())
    }

    pub(crate) async fn require_wallet(
        &self,
        user_id: u64,
        missing: LedgerError,
    ) -> Result<Wallet, LedgerError> {
        self.wallets.find(user_id).await?.ok_or(missing)
    }

    // ============================================================
    // MUTATION HELPERS
    // ============================================================

    pub(crate) async fn debit(
        &self,
        user_id: u64,
        amount: u64,
        missing: LedgerError,
    ) -> Result<(), LedgerError> {
        apply_wallet_delta(
            self.wallets.as_ref(),
            user_id,
            -(amount as i64),
            self.config.cas_retries,
        )
        .await
        .map(|_| ())
        .map_err(|e| map_apply(e, missing))
    }

    pub(crate) async fn credit(&self, user_id: u64, amount: u64) -> Result<(), LedgerError> {
        apply_wallet_delta(
            self.wallets.as_ref(),
            user_id,
            amount as i64,
            self.config.cas_retries,
        )
        .await
        .map(|_| ())
        .map_err(|e| map_apply(e, LedgerError::ReceiverNotFound))
    }

    // ============================================================
    // CHECKPOINT HELPERS
    // ============================================================

    pub(crate) fn append_cp(&self, entry: &CheckpointEntry) -> Result<(), LedgerError> {
        self.log
            .append(entry.clone())
            .map(|_| ())
            .map_err(checkpoint_io_err)
    }

    /// Best effort: a failed removal leaves a spurious entry that a
    /// later pass may re-apply, so it is logged loudly.
    pub(crate) fn remove_cp(&self, entry: &CheckpointEntry) {
        match self.log.remove_one(entry) {
            Ok(true) => {}
            Ok(false) => warn!("Checkpoint entry already gone on removal"),
            Err(e) => error!(error = %e, "Failed to remove checkpoint entry"),
        }
    }

    /// Attach the recovery side effect to a checkpoint error.
    pub(crate) fn raise_checkpoint(&self, err: LedgerError) -> LedgerError {
        if let Some(trigger) = err.recovery_trigger() {
            self.recovery.notify(trigger);
        }
        err
    }

    // Store accessors for the facade modules
    pub(crate) fn tokens(&self) -> &dyn TokenStore {
        self.tokens.as_ref()
    }

    pub(crate) fn linked(&self) -> &dyn LinkedAccountGateway {
        self.linked.as_ref()
    }

    pub(crate) fn limiter(&self) -> &RateLimiter {
        &self.limiter
    }
}

pub(crate) fn map_apply(e: ApplyError, missing: LedgerError) -> LedgerError {
    match e {
        ApplyError::WalletNotFound => missing,
        ApplyError::InsufficientBalance => LedgerError::InsufficientBalance,
        ApplyError::Store(s) => LedgerError::Store(s),
    }
}

pub(crate) fn checkpoint_io_err(e: io::Error) -> LedgerError {
    LedgerError::Store(StoreError::Unavailable(format!("checkpoint log: {}", e)))
}
