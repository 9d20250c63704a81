//! Environment configuration
//!
//! Process-wide settings use plain variables (`ANCHOR_CHAIN_ID`,
//! `DATABASE_URL`, ...). Chains are indexed: `CHAINS_COUNT=N` followed by
//! `CHAIN_1_*` .. `CHAIN_N_*`.

use std::collections::HashSet;
use std::env;
use std::fmt;
use std::net::SocketAddr;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use alloy::primitives::Address;
use alloy::signers::local::PrivateKeySigner;
use eyre::{eyre, Result, WrapErr};

use crate::adapters::ChainContracts;
use crate::connection::evm::parse_rpc_urls;
use crate::connection::GasPolicy;
use crate::sync::EpochSchedule;
use crate::types::ChainId;
use crate::watchers::{MaintainerConfig, MessengerConfig};
use crate::writers::{RetryPolicy, WriterConfig};

/// Main configuration for the relayer
#[derive(Debug, Clone)]
pub struct Config {
    pub relayer: RelayerConfig,
    /// Block cursors are kept in memory when unset
    pub database: Option<DatabaseConfig>,
    pub api: ApiConfig,
    pub chains: Vec<ChainConfig>,
}

/// Database configuration
#[derive(Clone)]
pub struct DatabaseConfig {
    pub url: String,
}

/// Custom Debug that redacts the database URL (may contain credentials).
impl fmt::Debug for DatabaseConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DatabaseConfig")
            .field("url", &"<redacted>")
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct ApiConfig {
    pub bind_address: String,
    pub port: u16,
}

impl ApiConfig {
    pub fn socket_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.bind_address, self.port)
            .parse()
            .map_err(|e| eyre!("Invalid API address {}:{}: {}", self.bind_address, self.port, e))
    }
}

/// Settings shared by every chain
#[derive(Clone)]
pub struct RelayerConfig {
    pub anchor_chain_id: ChainId,
    /// Light client manager on the anchor chain
    pub light_client_manager: Address,
    pub poll_interval_ms: u64,
    /// Consecutive block-fetch failures before a chain is declared dead
    pub retry_attempts: u32,
    pub retry_delay_ms: u64,
    pub alarm_threshold: u32,
    pub receipt_poll_interval_ms: u64,
    pub max_receipt_polls: u32,
    /// Revert reasons treated as success on top of the built-in ones
    pub ignorable_reasons: Vec<String>,
    pub order_cache_size: usize,
    pub order_cache_ttl_secs: u64,
    pub alarm_webhook_url: Option<String>,
}

/// Custom Debug that redacts the webhook URL (may embed a token).
impl fmt::Debug for RelayerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RelayerConfig")
            .field("anchor_chain_id", &self.anchor_chain_id)
            .field("light_client_manager", &self.light_client_manager)
            .field("poll_interval_ms", &self.poll_interval_ms)
            .field("retry_attempts", &self.retry_attempts)
            .field("retry_delay_ms", &self.retry_delay_ms)
            .field("alarm_threshold", &self.alarm_threshold)
            .field("receipt_poll_interval_ms", &self.receipt_poll_interval_ms)
            .field("max_receipt_polls", &self.max_receipt_polls)
            .field("ignorable_reasons", &self.ignorable_reasons)
            .field("order_cache_size", &self.order_cache_size)
            .field("order_cache_ttl_secs", &self.order_cache_ttl_secs)
            .field(
                "alarm_webhook_url",
                &self.alarm_webhook_url.as_ref().map(|_| "<redacted>"),
            )
            .finish()
    }
}

impl RelayerConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn writer_config(&self) -> WriterConfig {
        WriterConfig {
            retry: RetryPolicy {
                retry_interval: Duration::from_millis(self.retry_delay_ms),
                alarm_threshold: self.alarm_threshold,
                max_receipt_polls: self.max_receipt_polls,
                receipt_poll_interval: Duration::from_millis(self.receipt_poll_interval_ms),
            },
            ignorable_reasons: self.ignorable_reasons.clone(),
            order_cache_size: self.order_cache_size,
            order_cache_ttl_secs: self.order_cache_ttl_secs,
        }
    }
}

/// One chain the relayer serves
#[derive(Clone)]
pub struct ChainConfig {
    pub name: String,
    pub chain_id: ChainId,
    /// Tried in order, first is primary
    pub rpc_urls: Vec<String>,
    pub message_contract: Address,
    /// Light node verifying anchor headers on this chain
    pub light_node: Option<Address>,
    /// Receipts-root oracle, for chains without a light node
    pub oracle: Option<Address>,
    pub private_key: String,
    pub start_block: u64,
    pub confirmations: u64,
    pub epoch_size: u64,
    pub epoch_window: u64,
    pub epoch_offset: Option<u64>,
    pub lookahead: u64,
    pub stride: u64,
    /// Relay this chain's headers to the anchor's light client
    pub sync_headers: bool,
    pub gas: GasPolicy,
}

/// Custom Debug that redacts the private key.
impl fmt::Debug for ChainConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChainConfig")
            .field("name", &self.name)
            .field("chain_id", &self.chain_id)
            .field("rpc_urls", &self.rpc_urls.len())
            .field("message_contract", &self.message_contract)
            .field("light_node", &self.light_node)
            .field("oracle", &self.oracle)
            .field("private_key", &"<redacted>")
            .field("start_block", &self.start_block)
            .field("confirmations", &self.confirmations)
            .field("epoch_size", &self.epoch_size)
            .field("epoch_window", &self.epoch_window)
            .field("epoch_offset", &self.epoch_offset)
            .field("lookahead", &self.lookahead)
            .field("stride", &self.stride)
            .field("sync_headers", &self.sync_headers)
            .field("gas", &self.gas)
            .finish()
    }
}

impl ChainConfig {
    pub fn signer(&self) -> Result<PrivateKeySigner> {
        self.private_key
            .parse()
            .map_err(|e| eyre!("{}: invalid private key: {}", self.name, e))
    }

    pub fn contracts(&self) -> ChainContracts {
        ChainContracts {
            message_contract: self.message_contract,
            light_node: self.light_node,
            oracle: self.oracle,
        }
    }

    pub fn schedule(&self) -> EpochSchedule {
        let schedule = EpochSchedule::new(self.epoch_size, self.epoch_window);
        match self.epoch_offset {
            Some(offset) => schedule.with_offset(offset),
            None => schedule,
        }
    }

    pub fn maintainer_config(&self) -> MaintainerConfig {
        MaintainerConfig {
            start_block: self.start_block,
            confirmations: self.confirmations,
            stride: self.stride,
            lookahead: self.lookahead,
            schedule: self.schedule(),
            sync_headers: self.sync_headers,
        }
    }

    pub fn messenger_config(&self) -> MessengerConfig {
        MessengerConfig {
            start_block: self.start_block,
            confirmations: self.confirmations,
        }
    }
}

fn default_poll_interval() -> u64 {
    3000
}

fn default_retry_attempts() -> u32 {
    10
}

fn default_retry_delay() -> u64 {
    5000
}

fn default_alarm_threshold() -> u32 {
    10
}

fn default_receipt_poll_interval() -> u64 {
    3000
}

fn default_max_receipt_polls() -> u32 {
    60
}

fn default_api_port() -> u16 {
    9090
}

fn default_stride() -> u64 {
    1
}

/// Source of configuration variables
trait Vars {
    fn get(&self, key: &str) -> Option<String>;

    fn required(&self, key: &str) -> Result<String> {
        self.get(key)
            .filter(|v| !v.trim().is_empty())
            .ok_or_else(|| eyre!("{} environment variable is required", key))
    }

    fn parsed<T>(&self, key: &str) -> Result<Option<T>>
    where
        T: FromStr,
        T::Err: fmt::Display,
    {
        match self.get(key).filter(|v| !v.trim().is_empty()) {
            Some(raw) => raw
                .trim()
                .parse()
                .map(Some)
                .map_err(|e| eyre!("{} is invalid ({}): {}", key, raw, e)),
            None => Ok(None),
        }
    }

    fn parsed_or<T>(&self, key: &str, default: T) -> Result<T>
    where
        T: FromStr,
        T::Err: fmt::Display,
    {
        Ok(self.parsed(key)?.unwrap_or(default))
    }
}

impl<F: Fn(&str) -> Option<String>> Vars for F {
    fn get(&self, key: &str) -> Option<String> {
        self(key)
    }
}

impl Config {
    /// Load configuration from environment variables
    /// Loads .env file if present, then reads from environment
    pub fn load() -> Result<Self> {
        Self::load_from_file(".env")
    }

    /// Load from a specific .env file path
    pub fn load_from_file(path: &str) -> Result<Self> {
        if Path::new(path).exists() {
            dotenvy::from_filename(path)
                .wrap_err_with(|| format!("Failed to load .env file from {}", path))?;
        }
        Self::load_from_env()
    }

    /// Load configuration from environment variables
    pub fn load_from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build from an arbitrary variable lookup
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        Self::from_vars(&lookup)
    }

    fn from_vars<V: Vars>(vars: &V) -> Result<Self> {
        let relayer = RelayerConfig {
            anchor_chain_id: vars
                .parsed("ANCHOR_CHAIN_ID")?
                .ok_or_else(|| eyre!("ANCHOR_CHAIN_ID environment variable is required"))?,
            light_client_manager: vars
                .parsed("LIGHT_CLIENT_MANAGER")?
                .ok_or_else(|| eyre!("LIGHT_CLIENT_MANAGER environment variable is required"))?,
            poll_interval_ms: vars.parsed_or("POLL_INTERVAL_MS", default_poll_interval())?,
            retry_attempts: vars.parsed_or("RETRY_ATTEMPTS", default_retry_attempts())?,
            retry_delay_ms: vars.parsed_or("RETRY_DELAY_MS", default_retry_delay())?,
            alarm_threshold: vars.parsed_or("ALARM_THRESHOLD", default_alarm_threshold())?,
            receipt_poll_interval_ms: vars
                .parsed_or("RECEIPT_POLL_INTERVAL_MS", default_receipt_poll_interval())?,
            max_receipt_polls: vars.parsed_or("MAX_RECEIPT_POLLS", default_max_receipt_polls())?,
            ignorable_reasons: vars
                .get("IGNORABLE_REASONS")
                .map(|raw| {
                    raw.split(',')
                        .map(|s| s.trim().to_string())
                        .filter(|s| !s.is_empty())
                        .collect()
                })
                .unwrap_or_default(),
            order_cache_size: vars.parsed_or(
                "ORDER_CACHE_SIZE",
                crate::bounded_cache::DEFAULT_ORDER_CACHE_SIZE,
            )?,
            order_cache_ttl_secs: vars.parsed_or(
                "ORDER_CACHE_TTL_SECS",
                crate::bounded_cache::DEFAULT_ORDER_CACHE_TTL_SECS,
            )?,
            alarm_webhook_url: vars.get("ALARM_WEBHOOK_URL").filter(|v| !v.is_empty()),
        };

        let database = vars
            .get("DATABASE_URL")
            .filter(|v| !v.is_empty())
            .map(|url| DatabaseConfig { url });

        let api = ApiConfig {
            bind_address: vars
                .get("API_BIND_ADDRESS")
                .unwrap_or_else(|| "0.0.0.0".to_string()),
            port: vars.parsed_or("API_PORT", default_api_port())?,
        };

        let count: usize = vars
            .parsed("CHAINS_COUNT")?
            .ok_or_else(|| eyre!("CHAINS_COUNT environment variable is required"))?;
        let default_key = vars.get("RELAYER_PRIVATE_KEY");
        let chains = (1..=count)
            .map(|i| load_chain(vars, i, default_key.as_deref()))
            .collect::<Result<Vec<_>>>()?;

        let config = Config {
            relayer,
            database,
            api,
            chains,
        };
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    fn validate(&self) -> Result<()> {
        if self.chains.is_empty() {
            return Err(eyre!("CHAINS_COUNT must be at least 1"));
        }

        let mut seen = HashSet::new();
        for chain in &self.chains {
            if !seen.insert(chain.chain_id) {
                return Err(eyre!(
                    "Duplicate chain id {} ({})",
                    chain.chain_id,
                    chain.name
                ));
            }
            if chain.rpc_urls.is_empty() {
                return Err(eyre!("{}: at least one RPC URL is required", chain.name));
            }
            if chain.private_key.len() != 66 || !chain.private_key.starts_with("0x") {
                return Err(eyre!(
                    "{}: private key must be 66 chars (0x + 64 hex chars)",
                    chain.name
                ));
            }
            if chain.epoch_size > 0 && chain.epoch_window > chain.epoch_size {
                return Err(eyre!(
                    "{}: epoch window {} exceeds epoch size {}",
                    chain.name,
                    chain.epoch_window,
                    chain.epoch_size
                ));
            }
            if chain.epoch_size > 0 && chain.stride > 1 && chain.epoch_size % chain.stride != 0 {
                return Err(eyre!(
                    "{}: stride {} does not divide epoch size {}",
                    chain.name,
                    chain.stride,
                    chain.epoch_size
                ));
            }
            if chain.light_node.is_some() && chain.oracle.is_some() {
                return Err(eyre!(
                    "{}: configure either a light node or an oracle, not both",
                    chain.name
                ));
            }
        }

        if !seen.contains(&self.relayer.anchor_chain_id) {
            return Err(eyre!(
                "Anchor chain {} is not among the configured chains",
                self.relayer.anchor_chain_id
            ));
        }
        if self.relayer.retry_attempts == 0 {
            return Err(eyre!("RETRY_ATTEMPTS must be at least 1"));
        }
        if self.relayer.alarm_threshold == 0 {
            return Err(eyre!("ALARM_THRESHOLD must be at least 1"));
        }
        Ok(())
    }

    pub fn anchor(&self) -> Result<&ChainConfig> {
        self.chain(self.relayer.anchor_chain_id)
            .ok_or_else(|| eyre!("anchor chain {} not configured", self.relayer.anchor_chain_id))
    }

    pub fn chain(&self, chain_id: ChainId) -> Option<&ChainConfig> {
        self.chains.iter().find(|c| c.chain_id == chain_id)
    }
}

fn load_chain<V: Vars>(vars: &V, index: usize, default_key: Option<&str>) -> Result<ChainConfig> {
    let prefix = format!("CHAIN_{}", index);
    let key = |suffix: &str| format!("{}_{}", prefix, suffix);

    let chain_id: ChainId = vars
        .parsed(&key("CHAIN_ID"))?
        .ok_or_else(|| eyre!("Missing {}", key("CHAIN_ID")))?;
    let name = vars
        .get(&key("NAME"))
        .unwrap_or_else(|| format!("chain_{}", chain_id));

    let rpc_urls = parse_rpc_urls(&vars.required(&key("RPC_URL"))?);

    let private_key = vars
        .get(&key("PRIVATE_KEY"))
        .or_else(|| default_key.map(str::to_string))
        .ok_or_else(|| eyre!("Missing {} and RELAYER_PRIVATE_KEY", key("PRIVATE_KEY")))?;

    let epoch_size = vars.parsed_or(&key("EPOCH_SIZE"), 0)?;
    let defaults = GasPolicy::default();
    let gas = GasPolicy {
        price_multiplier: vars.parsed_or(&key("GAS_PRICE_MULTIPLIER"), defaults.price_multiplier)?,
        limit_multiplier: vars.parsed_or(&key("GAS_LIMIT_MULTIPLIER"), defaults.limit_multiplier)?,
        min_gas_price: vars.parsed(&key("MIN_GAS_PRICE"))?,
        max_gas_price: vars.parsed(&key("MAX_GAS_PRICE"))?,
        max_gas_limit: vars.parsed(&key("MAX_GAS_LIMIT"))?,
        legacy_only: vars.parsed_or(&key("LEGACY_GAS"), false)?,
    };

    Ok(ChainConfig {
        name,
        chain_id,
        rpc_urls,
        message_contract: vars
            .parsed(&key("MESSAGE_CONTRACT"))?
            .ok_or_else(|| eyre!("Missing {}", key("MESSAGE_CONTRACT")))?,
        light_node: vars.parsed(&key("LIGHT_NODE"))?,
        oracle: vars.parsed(&key("ORACLE"))?,
        private_key,
        start_block: vars.parsed_or(&key("START_BLOCK"), 0)?,
        confirmations: vars.parsed_or(&key("CONFIRMATIONS"), 0)?,
        epoch_size,
        epoch_window: vars.parsed_or(&key("EPOCH_WINDOW"), 1)?,
        epoch_offset: vars.parsed(&key("EPOCH_OFFSET"))?,
        lookahead: vars.parsed_or(&key("LOOKAHEAD"), 0)?,
        stride: vars.parsed_or(&key("STRIDE"), default_stride())?.max(1),
        sync_headers: vars.parsed_or(&key("SYNC_HEADERS"), true)?,
        gas,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    const KEY: &str = "0x0000000000000000000000000000000000000000000000000000000000000001";

    fn base() -> HashMap<String, String> {
        [
            ("ANCHOR_CHAIN_ID", "22776"),
            ("LIGHT_CLIENT_MANAGER", "0x00000000000000000000000000000000000000aa"),
            ("RELAYER_PRIVATE_KEY", KEY),
            ("CHAINS_COUNT", "2"),
            ("CHAIN_1_NAME", "map"),
            ("CHAIN_1_CHAIN_ID", "22776"),
            ("CHAIN_1_RPC_URL", "http://localhost:8545"),
            ("CHAIN_1_MESSAGE_CONTRACT", "0x0000000000000000000000000000000000000001"),
            ("CHAIN_2_NAME", "bsc"),
            ("CHAIN_2_CHAIN_ID", "56"),
            ("CHAIN_2_RPC_URL", "http://a:8545, http://b:8545"),
            ("CHAIN_2_MESSAGE_CONTRACT", "0x0000000000000000000000000000000000000002"),
            ("CHAIN_2_LIGHT_NODE", "0x0000000000000000000000000000000000000003"),
            ("CHAIN_2_EPOCH_SIZE", "200"),
            ("CHAIN_2_EPOCH_WINDOW", "12"),
            ("CHAIN_2_CONFIRMATIONS", "15"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
    }

    fn load(vars: &HashMap<String, String>) -> Result<Config> {
        Config::from_lookup(|k| vars.get(k).cloned())
    }

    #[test]
    fn test_defaults() {
        assert_eq!(default_poll_interval(), 3000);
        assert_eq!(default_retry_attempts(), 10);
        assert_eq!(default_retry_delay(), 5000);
        assert_eq!(default_api_port(), 9090);
    }

    #[test]
    fn test_load_indexed_chains() {
        let config = load(&base()).unwrap();
        assert_eq!(config.relayer.anchor_chain_id, 22776);
        assert!(config.database.is_none());
        assert_eq!(config.chains.len(), 2);
        assert_eq!(config.anchor().unwrap().name, "map");

        let bsc = config.chain(56).unwrap();
        assert_eq!(bsc.rpc_urls, vec!["http://a:8545", "http://b:8545"]);
        assert_eq!(bsc.private_key, KEY);
        assert_eq!(bsc.confirmations, 15);
        assert_eq!(bsc.light_node, Some(Address::with_last_byte(3)));
        assert!(bsc.schedule().is_aligned(211));
        assert_eq!(bsc.maintainer_config().stride, 1);
        assert_eq!(config.api.socket_addr().unwrap().port(), 9090);
    }

    #[test]
    fn test_missing_anchor_chain_rejected() {
        let mut vars = base();
        vars.insert("ANCHOR_CHAIN_ID".into(), "1".into());
        let err = load(&vars).unwrap_err();
        assert!(err.to_string().contains("Anchor chain 1"), "{err}");
    }

    #[test]
    fn test_duplicate_chain_id_rejected() {
        let mut vars = base();
        vars.insert("CHAIN_2_CHAIN_ID".into(), "22776".into());
        let err = load(&vars).unwrap_err();
        assert!(err.to_string().contains("22776"), "{err}");
    }

    #[test]
    fn test_invalid_values_name_the_variable() {
        let mut vars = base();
        vars.insert("CHAIN_2_CONFIRMATIONS".into(), "many".into());
        let err = load(&vars).unwrap_err();
        assert!(err.to_string().contains("CHAIN_2_CONFIRMATIONS"), "{err}");

        let mut vars = base();
        vars.remove("CHAIN_1_RPC_URL");
        let err = load(&vars).unwrap_err();
        assert!(err.to_string().contains("CHAIN_1_RPC_URL"), "{err}");
    }

    #[test]
    fn test_per_chain_key_overrides_default() {
        let mut vars = base();
        let other = "0x0000000000000000000000000000000000000000000000000000000000000002";
        vars.insert("CHAIN_2_PRIVATE_KEY".into(), other.into());
        vars.insert("IGNORABLE_REASONS".into(), "already relayed, ".into());
        let config = load(&vars).unwrap();
        assert_eq!(config.chain(56).unwrap().private_key, other);
        assert_eq!(config.chain(22776).unwrap().private_key, KEY);
        assert_eq!(config.relayer.ignorable_reasons, vec!["already relayed"]);
        assert!(config.chain(56).unwrap().signer().is_ok());
    }

    #[test]
    fn test_debug_redacts_secrets() {
        let mut vars = base();
        vars.insert("DATABASE_URL".into(), "postgres://user:secret@db/relayer".into());
        vars.insert("ALARM_WEBHOOK_URL".into(), "https://hooks.example/token".into());
        let config = load(&vars).unwrap();
        let debug = format!("{:?}", config);
        assert!(!debug.contains("secret"));
        assert!(!debug.contains("token"));
        assert!(!debug.contains(KEY));
    }

    #[test]
    fn test_epoch_window_larger_than_epoch_rejected() {
        let mut vars = base();
        vars.insert("CHAIN_2_EPOCH_WINDOW".into(), "300".into());
        assert!(load(&vars).is_err());
    }

    #[test]
    fn test_stride_must_divide_epoch() {
        let mut vars = base();
        vars.insert("CHAIN_2_STRIDE".into(), "150".into());
        let err = load(&vars).unwrap_err();
        assert!(err.to_string().contains("stride 150"));

        vars.insert("CHAIN_2_STRIDE".into(), "50".into());
        assert_eq!(load(&vars).unwrap().chain(56).unwrap().stride, 50);
    }
}
