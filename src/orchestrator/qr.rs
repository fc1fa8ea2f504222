//! QR-code operations: send, request, pay, receive
//!
//! Tokens are consumed with delete-then-use ordering, so a code is
//! redeemable at most once even under concurrent redemption attempts.

use chrono::Utc;
use tracing::{error, info, warn};

use super::Orchestrator;
use crate::checkpoint::CheckpointEntry;
use crate::error::LedgerError;
use crate::models::{HistoryDraft, MoneyToken, TransferMethod};
use crate::stores::StoreError;

impl Orchestrator {
    /// Create a transaction QR token worth `amount`, debiting the
    /// sender `amount + fee` up front.
    pub async fn send(&self, sender_id: u64, amount: u64) -> Result<MoneyToken, LedgerError> {
        self.ensure_base_limit(amount, self.config().base_limit)?;
        self.require_wallet(sender_id, LedgerError::SenderNotFound)
            .await?;
        let charged = amount
            .checked_add(self.config().fee)
            .ok_or(LedgerError::DailyTransactionLimit)?;
        self.ensure_daily_cap(sender_id, charged).await?;

        self.debit(sender_id, charged, LedgerError::SenderNotFound)
            .await?;

        let token = MoneyToken::new(amount, TransferMethod::TransactionQrCode, sender_id);
        let entry = CheckpointEntry::TokenSnapshot(token.clone());
        if let Err(e) = self.append_cp(&entry) {
            // Log is down before the risky step: undo the debit and bail
            if self.credit(sender_id, charged).await.is_err() {
                error!(
                    sender_id,
                    charged, "Debit stuck with checkpoint log down; manual reconciliation"
                );
            }
            return Err(e);
        }

        match self.tokens().create(token.clone()).await {
            Ok(()) => {
                self.remove_cp(&entry);
                if let Err(e) = self.limiter().record_transacted(sender_id, amount).await {
                    warn!(sender_id, error = %e, "Failed to update daily window");
                }
                info!(sender_id, amount, code = %token.code, "Money token issued");
                Ok(token)
            }
            Err(e) => {
                warn!(sender_id, error = %e, "Token create failed, refunding sender");
                match self.credit(sender_id, charged).await {
                    Ok(()) => {
                        self.remove_cp(&entry);
                        Err(LedgerError::Store(e))
                    }
                    Err(undo_err) => {
                        // Entry stays: it is the only record the sender
                        // is owed this token
                        error!(
                            sender_id,
                            error = %undo_err,
                            "Refund failed, leaving money-token checkpoint"
                        );
                        Err(self.raise_checkpoint(LedgerError::MoneyTokenCheckpoint))
                    }
                }
            }
        }
    }

    /// Create a payment QR token: a request that [`Orchestrator::pay`]
    /// later settles. No wallet mutation happens here.
    pub async fn request_payment(
        &self,
        user_id: u64,
        amount: u64,
    ) -> Result<MoneyToken, LedgerError> {
        self.ensure_base_limit(amount, self.config().base_limit)?;
        self.require_wallet(user_id, LedgerError::SenderNotFound)
            .await?;

        let token = MoneyToken::new(amount, TransferMethod::PaymentQrCode, user_id);
        self.tokens().create(token.clone()).await?;
        info!(user_id, amount, code = %token.code, "Payment request issued");
        Ok(token)
    }

    /// Pay a payment QR token: the payer is debited the token amount,
    /// the token's creator is credited the amount minus the fee.
    pub async fn pay(&self, payer_id: u64, code: &str) -> Result<(), LedgerError> {
        let token = self.validate_token(code, TransferMethod::PaymentQrCode).await?;
        let payee_id = token.sender_id;
        if payer_id == payee_id {
            return Err(LedgerError::TransactionWithSelf);
        }
        self.require_wallet(payer_id, LedgerError::ReceiverNotFound)
            .await?;
        self.require_wallet(payee_id, LedgerError::SenderNotFound)
            .await?;
        self.ensure_daily_cap(payer_id, token.amount).await?;

        // Point of no return for the token: delete before use
        if !self.tokens().delete(code).await? {
            return Err(LedgerError::TokenNotFound);
        }

        if let Err(e) = self
            .debit(payer_id, token.amount, LedgerError::ReceiverNotFound)
            .await
        {
            // No funds moved; put the claim check back
            self.restore_token(&token).await?;
            return Err(e);
        }

        let credited = token.amount.saturating_sub(self.config().fee);
        let leg = self
            .pair_credit_leg(payee_id, credited, payer_id, token.amount)
            .await;

        let draft = HistoryDraft::new(
            payer_id,
            payee_id,
            TransferMethod::PaymentQrCode,
            Some(token.code.clone()),
            token.amount,
            token.sent_at,
        );

        match leg {
            Ok(()) => {
                if let Err(e) = self.limiter().record_transacted(payer_id, token.amount).await {
                    warn!(payer_id, error = %e, "Failed to update daily window");
                }
                info!(payer_id, payee_id, amount = token.amount, "Payment settled");
                self.append_history(draft).await
            }
            Err(e) if e.is_checkpoint() => {
                // Payer debited, payee credit owed via recovery
                let _ = self.append_history(draft).await;
                Err(e)
            }
            Err(e) => {
                // Clean rollback: payer refunded, token goes back
                self.restore_token(&token).await?;
                Err(e)
            }
        }
    }

    /// Redeem a transaction QR token into the receiver's wallet.
    pub async fn receive(&self, receiver_id: u64, code: &str) -> Result<(), LedgerError> {
        let token = self
            .validate_token(code, TransferMethod::TransactionQrCode)
            .await?;
        if token.sender_id == receiver_id {
            return Err(LedgerError::TransactionWithSelf);
        }
        self.require_wallet(receiver_id, LedgerError::ReceiverNotFound)
            .await?;

        if !self.tokens().delete(code).await? {
            return Err(LedgerError::TokenNotFound);
        }

        let entry = CheckpointEntry::WalletDelta {
            user_id: receiver_id,
            delta: token.amount as i64,
        };
        if let Err(e) = self.append_cp(&entry) {
            if self.tokens().create(token.clone()).await.is_err() {
                error!(code = %token.code, "Token lost with checkpoint log down; manual reconciliation");
            }
            return Err(e);
        }

        match self.credit(receiver_id, token.amount).await {
            Ok(()) => {
                self.remove_cp(&entry);
                info!(
                    receiver_id,
                    amount = token.amount,
                    code = %token.code,
                    "Token redeemed"
                );
                self.append_history(HistoryDraft::new(
                    token.sender_id,
                    receiver_id,
                    TransferMethod::TransactionQrCode,
                    Some(token.code.clone()),
                    token.amount,
                    token.sent_at,
                ))
                .await
            }
            Err(e) => {
                warn!(receiver_id, error = %e, "Redeem credit failed, restoring token");
                match self.tokens().create(token.clone()).await {
                    Ok(()) | Err(StoreError::AlreadyExists) => {
                        self.remove_cp(&entry);
                        Err(e)
                    }
                    Err(restore_err) => {
                        // Token stays consumed; the credit completes
                        // forward via the wallet pass
                        error!(
                            code = %token.code,
                            error = %restore_err,
                            "Token restore failed, leaving wallet checkpoint"
                        );
                        let err = self.raise_checkpoint(LedgerError::WalletCheckpoint);
                        let _ = self
                            .append_history(HistoryDraft::new(
                                token.sender_id,
                                receiver_id,
                                TransferMethod::TransactionQrCode,
                                Some(token.code.clone()),
                                token.amount,
                                token.sent_at,
                            ))
                            .await;
                        Err(err)
                    }
                }
            }
        }
    }

    /// Look up a token and check method and expiry.
    async fn validate_token(
        &self,
        code: &str,
        expected: TransferMethod,
    ) -> Result<MoneyToken, LedgerError> {
        let token = self
            .tokens()
            .find(code)
            .await?
            .ok_or(LedgerError::TokenNotFound)?;
        if token.method != expected {
            return Err(LedgerError::TokenMethodMismatch {
                expected,
                actual: token.method,
            });
        }
        if token.is_expired(Utc::now()) {
            return Err(LedgerError::TokenExpired);
        }
        Ok(token)
    }

    /// Recreate a consumed token under a checkpoint: the snapshot entry
    /// stays behind (and recovery is signaled) if recreation fails.
    async fn restore_token(&self, token: &MoneyToken) -> Result<(), LedgerError> {
        let entry = CheckpointEntry::TokenSnapshot(token.clone());
        if let Err(e) = self.append_cp(&entry) {
            // Log is down: recreate the token unguarded rather than lose it
            if !matches!(
                self.tokens().create(token.clone()).await,
                Ok(()) | Err(StoreError::AlreadyExists)
            ) {
                error!(code = %token.code, "Token lost with checkpoint log down; manual reconciliation");
            }
            return Err(e);
        }
        match self.tokens().create(token.clone()).await {
            Ok(()) | Err(StoreError::AlreadyExists) => {
                self.remove_cp(&entry);
                Ok(())
            }
            Err(e) => {
                error!(code = %token.code, error = %e, "Token restore failed, leaving checkpoint");
                Err(self.raise_checkpoint(LedgerError::MoneyTokenCheckpoint))
            }
        }
    }
}
