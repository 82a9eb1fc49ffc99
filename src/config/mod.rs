//! Configuration management for Pricewire
//!
//! Loads a config file (YAML or JSON) layered with environment variables
//! via .env, then validates key material and timing before any runner
//! starts. Construction-time problems fail fast here.

use std::time::Duration;

use anyhow::{bail, Context, Result};
use config::{Config, Environment, File};
use serde::Deserialize;

use crate::signer::SignatureType;
use crate::types::{AuthToken, OracleId};

const DEFAULT_CLOCK_PERIOD_MS: u64 = 500;
const DEFAULT_DELTA_CHECK_PERIOD_MS: u64 = 10;
const DEFAULT_CHANGE_THRESHOLD_PERCENT: f64 = 0.1;
const DEFAULT_REGISTRY_BASE_URL: &str = "https://rest.pricewire.network";
const DEFAULT_REGISTRY_REFRESH_INTERVAL_SECS: u64 = 600;
const DEFAULT_METADATA_REPORT_INTERVAL_SECS: u64 = 3600;
const DEFAULT_BROKER_RECONNECT_DELAY_SECS: u64 = 5;
const DEFAULT_PULL_RECONNECT_DELAY_SECS: u64 = 5;
const DEFAULT_PULL_READ_TIMEOUT_SECS: u64 = 10;

/// Environment prefix for layered overrides (e.g. PRICEWIRE__KEYS__ORACLE_ID).
const ENV_PREFIX: &str = "PRICEWIRE";

/// Main application configuration
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub agent: AgentConfig,
    #[serde(default)]
    pub keys: KeysConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AgentConfig {
    /// Signature schemes to run; one runner per scheme
    pub signature_types: Vec<SignatureType>,
    /// Clock trigger period in milliseconds; 0 disables clock updates
    #[serde(default = "default_clock_period_ms")]
    pub clock_period_ms: u64,
    /// Delta check period in milliseconds
    #[serde(default = "default_delta_check_period_ms")]
    pub delta_check_period_ms: u64,
    /// Relative-change threshold in percent (0-100)
    #[serde(default = "default_change_threshold_percent")]
    pub change_threshold_percent: f64,
    /// Sign every incoming update, bypassing the trigger timers
    #[serde(default)]
    pub sign_every_update: bool,
    /// Registry REST base url
    #[serde(default = "default_registry_base_url")]
    pub registry_base_url: String,
    /// Registry refresh interval in seconds
    #[serde(default = "default_registry_refresh_interval_secs")]
    pub registry_refresh_interval_secs: u64,
    /// Broker redial delay in seconds (fixed, no backoff)
    #[serde(default = "default_broker_reconnect_delay_secs")]
    pub broker_reconnect_delay_secs: u64,
    /// Metadata report interval in seconds
    #[serde(default = "default_metadata_report_interval_secs")]
    pub metadata_report_interval_secs: u64,
    /// Port for the incoming publisher websocket endpoint; 0 disables it
    #[serde(default)]
    pub incoming_ws_port: u16,
    /// Url of a pull-based publisher feed; empty disables the puller
    #[serde(default)]
    pub pull_based_ws_url: String,
    /// Optional subscription request sent after the pull feed connects
    #[serde(default)]
    pub pull_based_ws_subscription_request: String,
    /// Pull feed redial delay in seconds
    #[serde(default = "default_pull_reconnect_delay_secs")]
    pub pull_based_ws_reconnect_delay_secs: u64,
    /// Pull feed read timeout in seconds; 0 disables the timeout
    #[serde(default = "default_pull_read_timeout_secs")]
    pub pull_based_ws_read_timeout_secs: u64,
}

/// Key material and credentials. File values are overridden by flat
/// environment variables (PRICEWIRE_EVM_PRIVATE_KEY etc).
#[derive(Debug, Clone, Default, Deserialize)]
pub struct KeysConfig {
    #[serde(default)]
    pub evm_private_key: String,
    #[serde(default)]
    pub evm_public_key: String,
    #[serde(default)]
    pub stark_private_key: String,
    #[serde(default)]
    pub stark_public_key: String,
    #[serde(default)]
    pub oracle_id: String,
    #[serde(default)]
    pub auth_token: String,
    #[serde(default)]
    pub pull_based_auth_token: String,
}

fn default_clock_period_ms() -> u64 {
    DEFAULT_CLOCK_PERIOD_MS
}
fn default_delta_check_period_ms() -> u64 {
    DEFAULT_DELTA_CHECK_PERIOD_MS
}
fn default_change_threshold_percent() -> f64 {
    DEFAULT_CHANGE_THRESHOLD_PERCENT
}
fn default_registry_base_url() -> String {
    DEFAULT_REGISTRY_BASE_URL.to_string()
}
fn default_registry_refresh_interval_secs() -> u64 {
    DEFAULT_REGISTRY_REFRESH_INTERVAL_SECS
}
fn default_broker_reconnect_delay_secs() -> u64 {
    DEFAULT_BROKER_RECONNECT_DELAY_SECS
}
fn default_metadata_report_interval_secs() -> u64 {
    DEFAULT_METADATA_REPORT_INTERVAL_SECS
}
fn default_pull_reconnect_delay_secs() -> u64 {
    DEFAULT_PULL_RECONNECT_DELAY_SECS
}
fn default_pull_read_timeout_secs() -> u64 {
    DEFAULT_PULL_READ_TIMEOUT_SECS
}

impl AppConfig {
    /// Load, layer with the environment and validate.
    pub fn load(config_path: &str) -> Result<Self> {
        let settings = Config::builder()
            .add_source(File::with_name(config_path))
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .with_context(|| format!("failed to load config from {}", config_path))?;

        let mut app: AppConfig = settings
            .try_deserialize()
            .context("failed to deserialize config")?;
        app.keys.apply_env_overrides();
        app.validate()?;
        Ok(app)
    }

    pub fn validate(&self) -> Result<()> {
        if self.agent.signature_types.is_empty() {
            bail!("must specify at least one signature type");
        }
        for signature_type in &self.agent.signature_types {
            match signature_type {
                SignatureType::Evm => {
                    if !is_hex_key(&self.keys.evm_private_key) {
                        bail!("must pass a valid EVM private key");
                    }
                    if !is_hex_key(&self.keys.evm_public_key) {
                        bail!("must pass a valid EVM public key");
                    }
                }
                SignatureType::Stark => {
                    if !is_hex_key(&self.keys.stark_private_key) {
                        bail!("must pass a valid Stark private key");
                    }
                    if !is_hex_key(&self.keys.stark_public_key) {
                        bail!("must pass a valid Stark public key");
                    }
                }
            }
        }

        if self.keys.oracle_id.len() != 5 {
            bail!("oracle id length must be 5");
        }
        if self.agent.delta_check_period_ms == 0 {
            bail!("delta check period must be positive");
        }
        if self.agent.change_threshold_percent <= 0.0 {
            bail!("change threshold percent must be positive");
        }
        if self.agent.registry_refresh_interval_secs == 0 {
            bail!("registry refresh interval must be positive");
        }
        if self.agent.broker_reconnect_delay_secs == 0 {
            bail!("broker reconnect delay must be positive");
        }
        if self.agent.incoming_ws_port == 0 && self.agent.pull_based_ws_url.is_empty() {
            bail!("must specify an incoming ws port to expose or a pull-based ws url to pull from");
        }
        Ok(())
    }

    pub fn oracle_id(&self) -> OracleId {
        OracleId(self.keys.oracle_id.clone())
    }

    pub fn auth_token(&self) -> AuthToken {
        AuthToken(self.keys.auth_token.clone())
    }
}

impl AgentConfig {
    pub fn clock_period(&self) -> Duration {
        Duration::from_millis(self.clock_period_ms)
    }

    pub fn delta_check_period(&self) -> Duration {
        Duration::from_millis(self.delta_check_period_ms)
    }

    /// Threshold as the 0-1 proportion the trigger engine compares against.
    pub fn change_threshold_proportion(&self) -> f64 {
        self.change_threshold_percent / 100.0
    }

    pub fn registry_refresh_interval(&self) -> Duration {
        Duration::from_secs(self.registry_refresh_interval_secs)
    }

    pub fn broker_reconnect_delay(&self) -> Duration {
        Duration::from_secs(self.broker_reconnect_delay_secs)
    }

    pub fn metadata_report_interval(&self) -> Duration {
        Duration::from_secs(self.metadata_report_interval_secs)
    }

    pub fn pull_based_ws_reconnect_delay(&self) -> Duration {
        Duration::from_secs(self.pull_based_ws_reconnect_delay_secs)
    }

    pub fn pull_based_ws_read_timeout(&self) -> Duration {
        Duration::from_secs(self.pull_based_ws_read_timeout_secs)
    }
}

impl KeysConfig {
    /// Flat environment variables beat file-provided keys, so secrets can
    /// stay out of the config file entirely.
    fn apply_env_overrides(&mut self) {
        override_from_env(&mut self.evm_private_key, "PRICEWIRE_EVM_PRIVATE_KEY");
        override_from_env(&mut self.evm_public_key, "PRICEWIRE_EVM_PUBLIC_KEY");
        override_from_env(&mut self.stark_private_key, "PRICEWIRE_STARK_PRIVATE_KEY");
        override_from_env(&mut self.stark_public_key, "PRICEWIRE_STARK_PUBLIC_KEY");
        override_from_env(&mut self.oracle_id, "PRICEWIRE_ORACLE_ID");
        override_from_env(&mut self.auth_token, "PRICEWIRE_AUTH_TOKEN");
        override_from_env(&mut self.pull_based_auth_token, "PRICEWIRE_PULL_BASED_AUTH_TOKEN");
    }
}

fn override_from_env(field: &mut String, var: &str) {
    if let Ok(value) = std::env::var(var) {
        if !value.is_empty() {
            *field = value;
        }
    }
}

/// 0x-prefixed hex, at least one digit.
fn is_hex_key(s: &str) -> bool {
    match s.strip_prefix("0x") {
        Some(digits) => !digits.is_empty() && digits.bytes().all(|b| b.is_ascii_hexdigit()),
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_config() -> AppConfig {
        serde_json::from_str(
            r#"{
                "agent": {
                    "signature_types": ["evm"],
                    "incoming_ws_port": 5216
                },
                "keys": {
                    "evm_private_key": "0x8b558d5fc31eb64bb51d44b4b28658180e96764d5d5ac68e6d124f86f576d9de",
                    "evm_public_key": "0x99e295e85cb07c16b7bb62a44df532a7f2620237",
                    "oracle_id": "czowx"
                }
            }"#,
        )
        .unwrap()
    }

    #[test]
    fn valid_config_passes_validation() {
        valid_config().validate().unwrap();
    }

    #[test]
    fn defaults_are_applied() {
        let config = valid_config();
        assert_eq!(config.agent.clock_period(), Duration::from_millis(500));
        assert_eq!(config.agent.delta_check_period(), Duration::from_millis(10));
        assert_eq!(config.agent.change_threshold_percent, 0.1);
        assert_eq!(
            config.agent.registry_refresh_interval(),
            Duration::from_secs(600)
        );
        assert!(!config.agent.sign_every_update);
    }

    #[test]
    fn threshold_percent_converts_to_proportion() {
        let config = valid_config();
        assert!((config.agent.change_threshold_proportion() - 0.001).abs() < 1e-12);
    }

    #[test]
    fn rejects_missing_signature_types() {
        let mut config = valid_config();
        config.agent.signature_types.clear();
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_bad_evm_key() {
        let mut config = valid_config();
        config.keys.evm_private_key = "not-a-key".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_missing_stark_keys_when_stark_enabled() {
        let mut config = valid_config();
        config.agent.signature_types.push(SignatureType::Stark);
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_bad_oracle_id_length() {
        let mut config = valid_config();
        config.keys.oracle_id = "abcdef".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_zero_delta_period() {
        let mut config = valid_config();
        config.agent.delta_check_period_ms = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_config_without_any_ingress() {
        let mut config = valid_config();
        config.agent.incoming_ws_port = 0;
        config.agent.pull_based_ws_url.clear();
        assert!(config.validate().is_err());
    }

    #[test]
    fn hex_key_check() {
        assert!(is_hex_key("0xabc123"));
        assert!(!is_hex_key("abc123"));
        assert!(!is_hex_key("0x"));
        assert!(!is_hex_key("0xzz"));
    }
}
