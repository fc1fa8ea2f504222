//! Ledger daemon skeleton
//!
//! Boots the consistency engine: config, logging, checkpoint-log
//! replay, the recovery worker, its periodic trigger, and an hourly
//! expired-token sweep. The request-facing surface (HTTP, auth) lives
//! in a separate service and drives [`Orchestrator`] directly.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chrono::Utc;
use tracing::{info, warn};

use onepay_ledger::checkpoint::{CheckpointConfig, CheckpointLog};
use onepay_ledger::config::AppConfig;
use onepay_ledger::limits::RateLimiter;
use onepay_ledger::logging::init_logging;
use onepay_ledger::money::format_amount;
use onepay_ledger::orchestrator::Orchestrator;
use onepay_ledger::recovery::{RecoveryWorker, ReloadTrigger, recovery_channel, spawn_periodic};
use onepay_ledger::stores::{
    MemoryHistoryStore, MemoryLinkedAccounts, MemoryRateStore, MemoryTokenStore,
    MemoryWalletStore, TokenStore,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let env = std::env::var("APP_ENV").unwrap_or_else(|_| "dev".to_string());
    let config = AppConfig::load_or_default(&env);
    let _guard = init_logging(&config);

    info!(
        env = %env,
        base_limit = %format_amount(config.ledger.base_limit),
        daily_cap = %format_amount(config.ledger.daily_cap),
        fee = %format_amount(config.ledger.fee),
        "Starting onepay_ledger"
    );

    let log = Arc::new(
        CheckpointLog::open(CheckpointConfig {
            path: config.checkpoint_path.clone(),
            ..CheckpointConfig::default()
        })
        .context("failed to open checkpoint log")?,
    );
    if !log.is_empty() {
        warn!(
            outstanding = log.len(),
            "Outstanding checkpoint entries from a previous run; recovery will replay them"
        );
    }

    // In-memory stores stand in until the real repositories are wired up
    let wallets = Arc::new(MemoryWalletStore::new());
    let tokens = Arc::new(MemoryTokenStore::new());
    let history = Arc::new(MemoryHistoryStore::new());
    let linked = Arc::new(MemoryLinkedAccounts::new());
    let rates = Arc::new(MemoryRateStore::new());

    let (signal, receiver) = recovery_channel(config.recovery.channel_capacity);
    let worker = RecoveryWorker::new(
        log.clone(),
        wallets.clone(),
        tokens.clone(),
        history.clone(),
        config.ledger.cas_retries,
    );
    let worker_handle = tokio::spawn(worker.run(receiver));
    let _periodic = spawn_periodic(
        signal.clone(),
        Duration::from_secs(config.recovery.periodic_interval_secs),
    );

    // Clear anything the previous run left behind
    signal.notify(ReloadTrigger::All);

    let _orchestrator = Orchestrator::new(
        wallets,
        tokens.clone(),
        history,
        linked,
        log,
        RateLimiter::new(rates, config.ledger.daily_cap),
        config.ledger,
        signal,
    );

    // Hourly sweep of expired money tokens
    let sweep = tokio::spawn(async move {
        loop {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            match tokens.purge_expired(Utc::now()).await {
                Ok(0) => {}
                Ok(purged) => info!(purged, "Expired money tokens purged"),
                Err(e) => warn!(error = %e, "Token sweep failed"),
            }
        }
    });

    info!("onepay_ledger running; ctrl-c to stop");
    tokio::signal::ctrl_c().await?;
    info!("Shutting down");

    sweep.abort();
    worker_handle.abort();
    Ok(())
}
