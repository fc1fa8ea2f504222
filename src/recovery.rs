//! Recovery loop
//!
//! Drives the ledger back to consistency using only the checkpoint log
//! and the live stores. One consumer task blocks on a control channel
//! of symbolic triggers; a timer task posts `all` every two hours
//! regardless of external signals. Identical pending triggers are
//! coalesced before a pass runs.
//!
//! The commit point of every reconciliation action is the checkpoint
//! entry *removal*, never the store mutation, so re-running a pass any
//! number of times with no new entries changes nothing.

use std::collections::HashSet;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::checkpoint::{CheckpointEntry, CheckpointKind, CheckpointLog};
use crate::stores::{
    ApplyError, HistoryStore, StoreError, TokenStore, WalletStore, apply_wallet_delta,
};

// ============================================================
// TRIGGERS
// ============================================================

/// Symbolic reconciliation trigger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReloadTrigger {
    All,
    Wallet,
    MoneyToken,
    History,
}

impl ReloadTrigger {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReloadTrigger::All => "all",
            ReloadTrigger::Wallet => "reload_wallet",
            ReloadTrigger::MoneyToken => "reload_money_token",
            ReloadTrigger::History => "reload_history",
        }
    }

    fn matches(&self, kind: CheckpointKind) -> bool {
        match self {
            ReloadTrigger::All => true,
            ReloadTrigger::Wallet => kind == CheckpointKind::Wallet,
            ReloadTrigger::MoneyToken => kind == CheckpointKind::MoneyToken,
            ReloadTrigger::History => kind == CheckpointKind::History,
        }
    }
}

impl FromStr for ReloadTrigger {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "all" => Ok(ReloadTrigger::All),
            "reload_wallet" => Ok(ReloadTrigger::Wallet),
            "reload_money_token" => Ok(ReloadTrigger::MoneyToken),
            "reload_history" => Ok(ReloadTrigger::History),
            other => Err(format!("unknown reload trigger: {}", other)),
        }
    }
}

impl std::fmt::Display for ReloadTrigger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ============================================================
// CONTROL CHANNEL
// ============================================================

/// Sender half of the recovery control channel.
#[derive(Clone)]
pub struct RecoverySignal {
    tx: mpsc::Sender<ReloadTrigger>,
}

impl RecoverySignal {
    /// Post a trigger without waiting. A full channel drops the signal;
    /// the periodic `all` pass covers every stream anyway.
    pub fn notify(&self, trigger: ReloadTrigger) {
        match self.tx.try_send(trigger) {
            Ok(()) => debug!(trigger = %trigger, "Recovery trigger posted"),
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(trigger = %trigger, "Recovery channel full, relying on periodic pass")
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                error!(trigger = %trigger, "Recovery channel closed")
            }
        }
    }
}

/// Receiver half, owned by the worker loop.
pub struct RecoveryReceiver {
    rx: mpsc::Receiver<ReloadTrigger>,
}

/// Create the recovery control channel pair.
pub fn recovery_channel(capacity: usize) -> (RecoverySignal, RecoveryReceiver) {
    let (tx, rx) = mpsc::channel(capacity);
    (RecoverySignal { tx }, RecoveryReceiver { rx })
}

/// Spawn the timer task posting `all` every `interval`.
pub fn spawn_periodic(signal: RecoverySignal, interval: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(interval).await;
            signal.notify(ReloadTrigger::All);
        }
    })
}

// ============================================================
// WORKER
// ============================================================

/// Outcome counts of one reconciliation pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PassStats {
    /// Entries replayed and removed
    pub applied: usize,
    /// Entries left for a later pass
    pub left: usize,
}

/// Replays outstanding checkpoint entries against the live stores.
pub struct RecoveryWorker {
    log: Arc<CheckpointLog>,
    wallets: Arc<dyn WalletStore>,
    tokens: Arc<dyn TokenStore>,
    history: Arc<dyn HistoryStore>,
    cas_retries: u32,
}

impl RecoveryWorker {
    pub fn new(
        log: Arc<CheckpointLog>,
        wallets: Arc<dyn WalletStore>,
        tokens: Arc<dyn TokenStore>,
        history: Arc<dyn HistoryStore>,
        cas_retries: u32,
    ) -> Self {
        Self {
            log,
            wallets,
            tokens,
            history,
            cas_retries,
        }
    }

    /// Consume triggers until the control channel closes.
    pub async fn run(self, mut receiver: RecoveryReceiver) {
        info!("Recovery worker started");
        while let Some(first) = receiver.rx.recv().await {
            // Coalesce whatever else is already queued
            let mut pending: HashSet<ReloadTrigger> = HashSet::from([first]);
            while let Ok(next) = receiver.rx.try_recv() {
                pending.insert(next);
            }

            if pending.contains(&ReloadTrigger::All) {
                self.run_pass(ReloadTrigger::All).await;
            } else {
                for trigger in [
                    ReloadTrigger::Wallet,
                    ReloadTrigger::MoneyToken,
                    ReloadTrigger::History,
                ] {
                    if pending.contains(&trigger) {
                        self.run_pass(trigger).await;
                    }
                }
            }
        }
        info!("Recovery worker stopped (channel closed)");
    }

    /// Run one reconciliation pass for `trigger`.
    ///
    /// Walks the log snapshot in append order so replay is causal.
    pub async fn run_pass(&self, trigger: ReloadTrigger) -> PassStats {
        let entries = self.log.list_all();
        let mut stats = PassStats::default();

        for entry in entries {
            if !trigger.matches(entry.kind()) {
                continue;
            }
            if self.replay_entry(&entry).await {
                stats.applied += 1;
            } else {
                stats.left += 1;
            }
        }

        if stats.applied > 0 || stats.left > 0 {
            info!(
                trigger = %trigger,
                applied = stats.applied,
                left = stats.left,
                "Recovery pass finished"
            );
        } else {
            debug!(trigger = %trigger, "Recovery pass found nothing to do");
        }
        stats
    }

    /// Replay one entry. True when the obligation was settled and the
    /// entry removed; false leaves it for a later pass.
    async fn replay_entry(&self, entry: &CheckpointEntry) -> bool {
        let settled = match entry {
            CheckpointEntry::WalletDelta { user_id, delta } => {
                match apply_wallet_delta(self.wallets.as_ref(), *user_id, *delta, self.cas_retries)
                    .await
                {
                    Ok(wallet) => {
                        info!(
                            user_id,
                            delta, balance = wallet.amount, "Replayed wallet delta"
                        );
                        true
                    }
                    Err(ApplyError::WalletNotFound) => {
                        // Wallet may not exist yet or the store is down
                        debug!(user_id, delta, "Wallet not found, leaving checkpoint");
                        false
                    }
                    Err(e) => {
                        warn!(user_id, delta, error = ?e, "Wallet replay failed");
                        false
                    }
                }
            }
            CheckpointEntry::TokenSnapshot(token) => {
                match self.tokens.create(token.clone()).await {
                    Ok(()) => {
                        info!(code = %token.code, "Recreated money token");
                        true
                    }
                    // A previous pass already recreated it
                    Err(StoreError::AlreadyExists) => true,
                    Err(e) => {
                        warn!(code = %token.code, error = %e, "Token replay failed");
                        false
                    }
                }
            }
            CheckpointEntry::HistorySnapshot(draft) => {
                match self.history.create(draft.clone()).await {
                    Ok(record) => {
                        info!(id = record.id, "Replayed history record");
                        true
                    }
                    Err(e) => {
                        warn!(error = %e, "History replay failed");
                        false
                    }
                }
            }
        };

        if settled {
            match self.log.remove_one(entry) {
                Ok(_) => true,
                Err(e) => {
                    // Store mutation landed but the tombstone write failed.
                    // The entry stays; wallet replays would double-apply,
                    // so surface loudly.
                    error!(error = %e, "Failed to retire checkpoint after replay");
                    true
                }
            }
        } else {
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::CheckpointConfig;
    use crate::models::{MoneyToken, TransferMethod, Wallet};
    use crate::stores::{MemoryHistoryStore, MemoryTokenStore, MemoryWalletStore};
    use std::fs;

    fn open_log(tag: &str) -> (Arc<CheckpointLog>, String) {
        let path = format!("target/test_recovery_{}_{}.log", tag, std::process::id());
        let _ = fs::remove_file(&path);
        let log = CheckpointLog::open(CheckpointConfig {
            path: path.clone(),
            sync_on_write: false,
            ..CheckpointConfig::default()
        })
        .unwrap();
        (Arc::new(log), path)
    }

    fn worker(
        log: Arc<CheckpointLog>,
    ) -> (
        RecoveryWorker,
        Arc<MemoryWalletStore>,
        Arc<MemoryTokenStore>,
        Arc<MemoryHistoryStore>,
    ) {
        let wallets = Arc::new(MemoryWalletStore::new());
        let tokens = Arc::new(MemoryTokenStore::new());
        let history = Arc::new(MemoryHistoryStore::new());
        let worker = RecoveryWorker::new(
            log,
            wallets.clone(),
            tokens.clone(),
            history.clone(),
            4,
        );
        (worker, wallets, tokens, history)
    }

    #[test]
    fn test_trigger_strings() {
        assert_eq!(ReloadTrigger::All.as_str(), "all");
        assert_eq!(
            "reload_money_token".parse::<ReloadTrigger>().unwrap(),
            ReloadTrigger::MoneyToken
        );
        assert!("reload_everything".parse::<ReloadTrigger>().is_err());
    }

    #[tokio::test]
    async fn test_wallet_pass_applies_delta_and_retires_entry() {
        let (log, path) = open_log("wallet");
        let (worker, wallets, _, _) = worker(log.clone());
        wallets.create(Wallet::new(2, 100)).await.unwrap();

        log.append(CheckpointEntry::WalletDelta { user_id: 2, delta: 50 })
            .unwrap();

        let stats = worker.run_pass(ReloadTrigger::Wallet).await;
        assert_eq!(stats, PassStats { applied: 1, left: 0 });
        assert_eq!(wallets.find(2).await.unwrap().unwrap().amount, 150);
        assert!(log.is_empty());

        let _ = fs::remove_file(&path);
    }

    #[tokio::test]
    async fn test_wallet_pass_leaves_entry_for_missing_wallet() {
        let (log, path) = open_log("missing");
        let (worker, wallets, _, _) = worker(log.clone());

        log.append(CheckpointEntry::WalletDelta { user_id: 9, delta: 50 })
            .unwrap();

        let stats = worker.run_pass(ReloadTrigger::Wallet).await;
        assert_eq!(stats, PassStats { applied: 0, left: 1 });
        assert_eq!(log.len(), 1);

        // The wallet shows up later; a re-run settles it
        wallets.create(Wallet::new(9, 0)).await.unwrap();
        let stats = worker.run_pass(ReloadTrigger::Wallet).await;
        assert_eq!(stats.applied, 1);
        assert_eq!(wallets.find(9).await.unwrap().unwrap().amount, 50);

        let _ = fs::remove_file(&path);
    }

    #[tokio::test]
    async fn test_token_pass_recreates_token() {
        let (log, path) = open_log("token");
        let (worker, _, tokens, _) = worker(log.clone());

        let token = MoneyToken::new(700, TransferMethod::TransactionQrCode, 3);
        log.append(CheckpointEntry::TokenSnapshot(token.clone()))
            .unwrap();

        let stats = worker.run_pass(ReloadTrigger::MoneyToken).await;
        assert_eq!(stats.applied, 1);
        assert_eq!(tokens.find(&token.code).await.unwrap(), Some(token));
        assert!(log.is_empty());

        let _ = fs::remove_file(&path);
    }

    #[tokio::test]
    async fn test_passes_are_idempotent() {
        let (log, path) = open_log("idem");
        let (worker, wallets, _, history) = worker(log.clone());
        wallets.create(Wallet::new(1, 100)).await.unwrap();

        log.append(CheckpointEntry::WalletDelta { user_id: 1, delta: 25 })
            .unwrap();
        let stats = worker.run_pass(ReloadTrigger::All).await;
        assert_eq!(stats.applied, 1);

        // Second run with no new entries: no further state change
        let stats = worker.run_pass(ReloadTrigger::All).await;
        assert_eq!(stats, PassStats::default());
        assert_eq!(wallets.find(1).await.unwrap().unwrap().amount, 125);
        assert!(history.is_empty());

        let _ = fs::remove_file(&path);
    }

    #[tokio::test]
    async fn test_worker_consumes_and_coalesces_triggers() {
        let (log, path) = open_log("chan");
        let (worker, wallets, _, _) = worker(log.clone());
        wallets.create(Wallet::new(5, 0)).await.unwrap();
        log.append(CheckpointEntry::WalletDelta { user_id: 5, delta: 10 })
            .unwrap();

        let (signal, receiver) = recovery_channel(16);
        let handle = tokio::spawn(worker.run(receiver));

        // Duplicate triggers queued before the worker wakes coalesce
        signal.notify(ReloadTrigger::Wallet);
        signal.notify(ReloadTrigger::Wallet);
        signal.notify(ReloadTrigger::All);

        // Give the worker a moment, then close the channel
        tokio::time::sleep(Duration::from_millis(50)).await;
        drop(signal);
        handle.await.unwrap();

        assert_eq!(wallets.find(5).await.unwrap().unwrap().amount, 10);
        assert!(log.is_empty());

        let _ = fs::remove_file(&path);
    }
}
