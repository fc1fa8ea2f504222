//! Configuration
//!
//! Limits are explicit fields on [`LedgerConfig`] handed to the
//! orchestrator at construction time, never string-keyed environment
//! lookups.

use serde::{Deserialize, Serialize};
use std::fs;

/// Transaction limits and fee, in minor units.
#[derive(Debug, Serialize, Deserialize, Clone, Copy)]
pub struct LedgerConfig {
    /// Minimum amount for transfers/payments (inclusive)
    pub base_limit: u64,
    /// Minimum amount for withdrawals (inclusive)
    pub withdraw_base_limit: u64,
    /// Rolling 24-hour cap on a user's transacted total (inclusive)
    pub daily_cap: u64,
    /// Flat fee charged to the fee holder of each fee-bearing operation
    pub fee: u64,
    /// Retries for the wallet compare-and-swap before giving up
    #[serde(default = "default_cas_retries")]
    pub cas_retries: u32,
}

fn default_cas_retries() -> u32 {
    8
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            base_limit: 1_000,          // 10.00
            withdraw_base_limit: 5_000, // 50.00
            daily_cap: 100_000,         // 1000.00
            fee: 100,                   // 1.00
            cas_retries: default_cas_retries(),
        }
    }
}

/// Recovery loop settings.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct RecoveryConfig {
    /// Seconds between periodic `all` passes
    pub periodic_interval_secs: u64,
    /// Trigger channel capacity
    pub channel_capacity: usize,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            periodic_interval_secs: 2 * 60 * 60, // 2 hours
            channel_capacity: 64,
        }
    }
}

/// Top-level daemon configuration, loaded from `config/{env}.yaml`.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct AppConfig {
    pub log_level: String,
    pub log_dir: String,
    pub log_file: String,
    pub use_json: bool,
    pub rotation: String,
    pub enable_tracing: bool,
    /// Checkpoint log file path
    pub checkpoint_path: String,
    #[serde(default)]
    pub ledger: LedgerConfig,
    #[serde(default)]
    pub recovery: RecoveryConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_dir: "logs".to_string(),
            log_file: "onepay_ledger.log".to_string(),
            use_json: false,
            rotation: "daily".to_string(),
            enable_tracing: true,
            checkpoint_path: "data/checkpoint.log".to_string(),
            ledger: LedgerConfig::default(),
            recovery: RecoveryConfig::default(),
        }
    }
}

impl AppConfig {
    pub fn load(env: &str) -> Self {
        let config_path = format!("config/{}.yaml", env);
        let content = fs::read_to_string(&config_path)
            .unwrap_or_else(|_| panic!("Failed to read config file: {}", config_path));
        serde_yaml::from_str(&content).expect("Failed to parse config yaml")
    }

    /// Load `config/{env}.yaml`, falling back to defaults when absent.
    pub fn load_or_default(env: &str) -> Self {
        let config_path = format!("config/{}.yaml", env);
        match fs::read_to_string(&config_path) {
            Ok(content) => {
                serde_yaml::from_str(&content).expect("Failed to parse config yaml")
            }
            Err(_) => Self::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cfg = LedgerConfig::default();
        assert!(cfg.base_limit > 0);
        assert!(cfg.withdraw_base_limit >= cfg.base_limit);
        assert!(cfg.daily_cap > cfg.base_limit);
        assert_eq!(cfg.cas_retries, 8);

        let rec = RecoveryConfig::default();
        assert_eq!(rec.periodic_interval_secs, 7200);
    }

    #[test]
    fn test_yaml_roundtrip() {
        let yaml = r#"
log_level: debug
log_dir: logs
log_file: test.log
use_json: true
rotation: hourly
enable_tracing: true
checkpoint_path: data/cp.log
ledger:
  base_limit: 10
  withdraw_base_limit: 20
  daily_cap: 1000
  fee: 1
"#;
        let cfg: AppConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(cfg.ledger.base_limit, 10);
        assert_eq!(cfg.ledger.fee, 1);
        assert_eq!(cfg.ledger.cas_retries, 8); // serde default
        assert_eq!(cfg.recovery.channel_capacity, 64); // section default
    }
}
