//! Linked-account operations: recharge, withdraw, drain
//!
//! Funds cross the ledger boundary through the external account mover.
//! The external leg and the wallet leg cannot share a transaction, so
//! the second leg is the risky step and gets the checkpoint guard.

use chrono::Utc;
use tracing::{error, info, warn};

use super::Orchestrator;
use crate::checkpoint::CheckpointEntry;
use crate::error::LedgerError;
use crate::models::{HistoryDraft, TransferMethod};

impl Orchestrator {
    /// Move `amount` from a linked external account into the wallet.
    pub async fn recharge(
        &self,
        user_id: u64,
        account_id: &str,
        amount: u64,
    ) -> Result<(), LedgerError> {
        self.ensure_base_limit(amount, self.config().base_limit)?;
        self.require_wallet(user_id, LedgerError::SenderNotFound)
            .await?;

        // External debit first; a failure here has no side effects
        self.linked().debit(account_id, amount).await?;

        let entry = CheckpointEntry::WalletDelta {
            user_id,
            delta: amount as i64,
        };
        if let Err(e) = self.append_cp(&entry) {
            if self.linked().credit(account_id, amount).await.is_err() {
                error!(
                    user_id,
                    account_id, "External debit stuck with checkpoint log down; manual reconciliation"
                );
            }
            return Err(e);
        }

        match self.credit(user_id, amount).await {
            Ok(()) => {
                self.remove_cp(&entry);
                info!(user_id, account_id, amount, "Recharge settled");
                self.append_history(HistoryDraft::new(
                    user_id,
                    user_id,
                    TransferMethod::Recharge,
                    None,
                    amount,
                    Utc::now(),
                ))
                .await
            }
            Err(e) => {
                warn!(user_id, error = %e, "Recharge credit failed, refunding external account");
                match self.linked().credit(account_id, amount).await {
                    Ok(()) => {
                        self.remove_cp(&entry);
                        Err(e)
                    }
                    Err(undo_err) => {
                        // External funds already taken; the wallet
                        // credit completes forward via recovery
                        error!(
                            user_id,
                            account_id,
                            error = %undo_err,
                            "External refund failed, leaving wallet checkpoint"
                        );
                        let err = self.raise_checkpoint(LedgerError::WalletCheckpoint);
                        let _ = self
                            .append_history(HistoryDraft::new(
                                user_id,
                                user_id,
                                TransferMethod::Recharge,
                                None,
                                amount,
                                Utc::now(),
                            ))
                            .await;
                        Err(err)
                    }
                }
            }
        }
    }

    /// Move `amount` from the wallet out to a linked external account.
    pub async fn withdraw(
        &self,
        user_id: u64,
        account_id: &str,
        amount: u64,
    ) -> Result<(), LedgerError> {
        self.ensure_base_limit(amount, self.config().withdraw_base_limit)?;
        self.require_wallet(user_id, LedgerError::SenderNotFound)
            .await?;
        self.ensure_daily_cap(user_id, amount).await?;

        self.withdraw_inner(user_id, account_id, amount).await?;

        if let Err(e) = self.limiter().record_transacted(user_id, amount).await {
            warn!(user_id, error = %e, "Failed to update daily window");
        }
        self.append_history(HistoryDraft::new(
            user_id,
            user_id,
            TransferMethod::Withdraw,
            None,
            amount,
            Utc::now(),
        ))
        .await
    }

    /// Empty the wallet into a linked external account.
    ///
    /// No base-limit or daily-cap check: draining moves whatever is
    /// there, typically when closing the account.
    pub async fn drain(&self, user_id: u64, account_id: &str) -> Result<(), LedgerError> {
        let wallet = self
            .require_wallet(user_id, LedgerError::SenderNotFound)
            .await?;
        if wallet.amount == 0 {
            return Err(LedgerError::InsufficientBalance);
        }
        let amount = wallet.amount;

        self.withdraw_inner(user_id, account_id, amount).await?;

        info!(user_id, account_id, amount, "Wallet drained");
        self.append_history(HistoryDraft::new(
            user_id,
            user_id,
            TransferMethod::Withdraw,
            None,
            amount,
            Utc::now(),
        ))
        .await
    }

    /// Shared wallet-to-external leg: debit the wallet, then the risky
    /// external credit under a refund checkpoint.
    async fn withdraw_inner(
        &self,
        user_id: u64,
        account_id: &str,
        amount: u64,
    ) -> Result<(), LedgerError> {
        self.debit(user_id, amount, LedgerError::SenderNotFound)
            .await?;

        // If the external credit cannot be confirmed and the refund
        // also fails, this entry is the owed refund
        let entry = CheckpointEntry::WalletDelta {
            user_id,
            delta: amount as i64,
        };
        if let Err(e) = self.append_cp(&entry) {
            if self.credit(user_id, amount).await.is_err() {
                error!(
                    user_id,
                    amount, "Wallet debit stuck with checkpoint log down; manual reconciliation"
                );
            }
            return Err(e);
        }

        match self.linked().credit(account_id, amount).await {
            Ok(()) => {
                self.remove_cp(&entry);
                Ok(())
            }
            Err(e) => {
                warn!(user_id, error = %e, "External credit failed, refunding wallet");
                match self.credit(user_id, amount).await {
                    Ok(()) => {
                        self.remove_cp(&entry);
                        Err(LedgerError::Store(e))
                    }
                    Err(undo_err) => {
                        error!(
                            user_id,
                            error = %undo_err,
                            "Wallet refund failed, leaving wallet checkpoint"
                        );
                        Err(self.raise_checkpoint(LedgerError::WalletCheckpoint))
                    }
                }
            }
        }
    }
}
