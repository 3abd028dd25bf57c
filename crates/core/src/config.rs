//! Application configuration schema.
//!
//! One frozen value constructed at startup; every knob has a default so a
//! minimal config file only needs the accounts list.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// How reversal transitions (long->short, short->long) are executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RollPolicy {
    /// Close the existing position, then open the opposite one (two orders).
    CloseThenOpen,
    /// Hand the engine a single roll intent.
    SingleOrder,
}

impl Default for RollPolicy {
    fn default() -> Self {
        Self::CloseThenOpen
    }
}

/// Mapping from position transitions to option rights.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RightMapping {
    /// Long entries and short exits trade calls; short entries and long
    /// exits trade puts.
    Standard,
    Inverted,
}

impl Default for RightMapping {
    fn default() -> Self {
        Self::Standard
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerConfig,
    /// Replace the broker gateway with the in-memory simulator.
    #[serde(default)]
    pub mock_mode: bool,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub accounts: Vec<AccountConfig>,
    #[serde(default)]
    pub polling: PollingConfig,
    #[serde(default)]
    pub spread: SpreadConfig,
    #[serde(default)]
    pub execution: ExecutionConfig,
    #[serde(default)]
    pub delta: DeltaConfig,
    #[serde(default)]
    pub dispatch: DispatchConfig,
    #[serde(default)]
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub contract_selection: ContractSelectionConfig,
    #[serde(default = "default_shutdown_grace_seconds")]
    pub shutdown_grace_seconds: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 3001,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "sqlite://data/delta_records.db".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountConfig {
    pub name: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Opaque reference resolved by the credential store; never the secret
    /// itself.
    pub broker_credentials_ref: String,
    /// Webhook URL for this account's notification channel.
    #[serde(default)]
    pub notifier_channel: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollingConfig {
    pub position_interval_minutes: u64,
    pub order_interval_minutes: u64,
    pub max_consecutive_errors: u32,
    pub auto_start: bool,
    /// Per-tick account fan-out bound; 0 means "one slot per account".
    pub concurrency_limit: usize,
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            position_interval_minutes: 15,
            order_interval_minutes: 5,
            max_consecutive_errors: 5,
            auto_start: true,
            concurrency_limit: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpreadConfig {
    pub ratio_threshold: Decimal,
    pub tick_multiple_threshold: i64,
}

impl Default for SpreadConfig {
    fn default() -> Self {
        Self {
            ratio_threshold: Decimal::new(15, 2),
            tick_multiple_threshold: 2,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionConfig {
    pub max_steps: u32,
    pub step_interval_seconds: u64,
    pub enable_market_fallback: bool,
    pub max_place_retries: u32,
    /// Extra intervals an order may hold at its current step while the
    /// spread is unreasonable (or the step budget is exhausted).
    pub hold_budget: u32,
    /// Advance past an unreasonable spread once the hold budget is spent
    /// instead of failing.
    pub force_progress: bool,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            max_steps: 5,
            step_interval_seconds: 8,
            enable_market_fallback: false,
            max_place_retries: 3,
            hold_budget: 3,
            force_progress: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeltaConfig {
    /// Minimum observed-delta move before the position poller writes a new
    /// observation.
    pub change_threshold: f64,
    pub retention_days: u32,
}

impl Default for DeltaConfig {
    fn default() -> Self {
        Self {
            change_threshold: 0.01,
            retention_days: 90,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchConfig {
    pub dedupe_window_seconds: u64,
    pub signal_timeout_seconds: u64,
    #[serde(default)]
    pub roll_policy: RollPolicy,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            dedupe_window_seconds: 60,
            signal_timeout_seconds: 60,
            roll_policy: RollPolicy::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    pub base_url: String,
    pub call_timeout_seconds: u64,
    pub read_rps: u32,
    pub order_rps: u32,
    pub cancel_rps: u32,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.broker.example/v2".to_string(),
            call_timeout_seconds: 10,
            read_rps: 20,
            order_rps: 5,
            cancel_rps: 5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContractSelectionConfig {
    pub min_days_to_expiry: i64,
    pub max_days_to_expiry: i64,
    pub target_days_to_expiry: i64,
    /// |delta| target for opening trades; closes pick closest-to-ATM.
    pub target_delta_open: f64,
    #[serde(default)]
    pub right_mapping: RightMapping,
}

impl Default for ContractSelectionConfig {
    fn default() -> Self {
        Self {
            min_days_to_expiry: 7,
            max_days_to_expiry: 45,
            target_days_to_expiry: 30,
            target_delta_open: 0.30,
            right_mapping: RightMapping::default(),
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            mock_mode: false,
            database: DatabaseConfig::default(),
            accounts: Vec::new(),
            polling: PollingConfig::default(),
            spread: SpreadConfig::default(),
            execution: ExecutionConfig::default(),
            delta: DeltaConfig::default(),
            dispatch: DispatchConfig::default(),
            gateway: GatewayConfig::default(),
            contract_selection: ContractSelectionConfig::default(),
            shutdown_grace_seconds: default_shutdown_grace_seconds(),
        }
    }
}

impl AppConfig {
    /// Total validation of the frozen configuration value.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.accounts.is_empty() {
            return Err(ConfigError::Invalid("at least one account is required".into()));
        }
        let mut names = std::collections::HashSet::new();
        for account in &self.accounts {
            if account.name.trim().is_empty() {
                return Err(ConfigError::Invalid("account name cannot be empty".into()));
            }
            if !names.insert(account.name.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate account name: {}",
                    account.name
                )));
            }
        }
        if self.spread.ratio_threshold <= Decimal::ZERO {
            return Err(ConfigError::Invalid("spread.ratio_threshold must be positive".into()));
        }
        if self.spread.tick_multiple_threshold < 0 {
            return Err(ConfigError::Invalid(
                "spread.tick_multiple_threshold cannot be negative".into(),
            ));
        }
        if self.polling.position_interval_minutes == 0 || self.polling.order_interval_minutes == 0 {
            return Err(ConfigError::Invalid("polling intervals must be positive".into()));
        }
        if self.polling.max_consecutive_errors == 0 {
            return Err(ConfigError::Invalid(
                "polling.max_consecutive_errors must be positive".into(),
            ));
        }
        if self.execution.step_interval_seconds == 0 {
            return Err(ConfigError::Invalid(
                "execution.step_interval_seconds must be positive".into(),
            ));
        }
        if self.delta.change_threshold < 0.0 {
            return Err(ConfigError::Invalid(
                "delta.change_threshold cannot be negative".into(),
            ));
        }
        if self.delta.retention_days == 0 {
            return Err(ConfigError::Invalid("delta.retention_days must be positive".into()));
        }
        let sel = &self.contract_selection;
        if sel.min_days_to_expiry < 0
            || sel.max_days_to_expiry < sel.min_days_to_expiry
            || sel.target_days_to_expiry < sel.min_days_to_expiry
            || sel.target_days_to_expiry > sel.max_days_to_expiry
        {
            return Err(ConfigError::Invalid(
                "contract_selection expiry window is inconsistent".into(),
            ));
        }
        if !(0.0..=1.0).contains(&sel.target_delta_open) {
            return Err(ConfigError::Invalid(
                "contract_selection.target_delta_open must be in [0, 1]".into(),
            ));
        }
        if self.gateway.call_timeout_seconds == 0 {
            return Err(ConfigError::Invalid(
                "gateway.call_timeout_seconds must be positive".into(),
            ));
        }
        Ok(())
    }

    /// Names of the enabled accounts, in config order.
    #[must_use]
    pub fn enabled_accounts(&self) -> Vec<&AccountConfig> {
        self.accounts.iter().filter(|a| a.enabled).collect()
    }

    #[must_use]
    pub fn account(&self, name: &str) -> Option<&AccountConfig> {
        self.accounts.iter().find(|a| a.name == name)
    }

    /// Effective per-tick polling fan-out bound.
    #[must_use]
    pub fn polling_concurrency(&self) -> usize {
        if self.polling.concurrency_limit == 0 {
            self.enabled_accounts().len().max(1)
        } else {
            self.polling.concurrency_limit
        }
    }
}

const fn default_true() -> bool {
    true
}

const fn default_shutdown_grace_seconds() -> u64 {
    5
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config_with_account() -> AppConfig {
        AppConfig {
            accounts: vec![AccountConfig {
                name: "main".to_string(),
                enabled: true,
                broker_credentials_ref: "main_credentials".to_string(),
                notifier_channel: None,
            }],
            ..AppConfig::default()
        }
    }

    #[test]
    fn defaults_validate_with_one_account() {
        assert!(config_with_account().validate().is_ok());
    }

    #[test]
    fn empty_accounts_rejected() {
        assert!(AppConfig::default().validate().is_err());
    }

    #[test]
    fn duplicate_account_names_rejected() {
        let mut config = config_with_account();
        config.accounts.push(config.accounts[0].clone());
        assert!(config.validate().is_err());
    }

    #[test]
    fn inconsistent_expiry_window_rejected() {
        let mut config = config_with_account();
        config.contract_selection.min_days_to_expiry = 50;
        assert!(config.validate().is_err());
    }

    #[test]
    fn concurrency_defaults_to_account_count() {
        let mut config = config_with_account();
        assert_eq!(config.polling_concurrency(), 1);
        config.polling.concurrency_limit = 4;
        assert_eq!(config.polling_concurrency(), 4);
    }
}
