use anyhow::{anyhow, Context, Result};
use ethers::types::{Address, U256};
use ethers::utils::{parse_ether, parse_units};
use std::env;
use std::fs;
use std::str::FromStr;
use std::time::Duration;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DetectionMode {
    Polling,
    Subscription,
}

impl FromStr for DetectionMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "polling" | "poll" => Ok(Self::Polling),
            "subscription" | "subscribe" | "ws" => Ok(Self::Subscription),
            other => Err(anyhow!("Unknown DETECTION_MODE '{}'", other)),
        }
    }
}

#[derive(Clone, Debug)]
pub struct Config {
    pub http_rpc_url: String,
    pub ws_rpc_urls: Vec<String>,
    /// One buy is placed per key on every matching launch.
    pub wallet_private_keys: Vec<String>,
    pub chain_id: u64,

    pub bonding_contract: Address,
    pub router_contract: Address,
    pub asset_token: Address,

    pub detection_mode: DetectionMode,
    pub stake_amount: U256,
    pub profit_threshold: f64,
    pub symbol_prefix: Option<String>,

    pub poll_interval_ms: u64,
    /// Widest block range asked of a single log query.
    pub log_chunk_blocks: u64,
    pub monitor_interval_ms: u64,
    pub health_check_interval_ms: u64,

    pub max_reconnect_attempts: u32,
    pub reconnect_delay_ms: u64,
    pub max_reconnect_delay_ms: u64,

    pub rpc_timeout_secs: u64,
    pub confirmation_timeout_secs: u64,

    pub dedup_capacity: usize,
    pub dedup_ttl_secs: u64,

    // Fee policy for submitted calls
    pub gas_limit: u64,
    pub max_fee_per_gas: U256,
    pub max_priority_fee_per_gas: U256,

    pub db_path: String,
}

fn required(key: &str) -> Result<String> {
    env::var(key).with_context(|| format!("{} not set in environment", key))
}

fn parsed_or<T: FromStr>(key: &str, default: T) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    match env::var(key) {
        Ok(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse::<T>()
            .map_err(|e| anyhow!("Failed to parse {}: {}", key, e)),
        _ => Ok(default),
    }
}

fn address(key: &str) -> Result<Address> {
    required(key)?
        .trim()
        .parse::<Address>()
        .with_context(|| format!("{} is not a valid address", key))
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(String::from)
        .collect()
}

/// `WALLET_KEYS_FILE` (a JSON array of keys) wins over the comma separated
/// `WALLET_PRIVATE_KEYS`.
fn wallet_keys() -> Result<Vec<String>> {
    if let Ok(path) = env::var("WALLET_KEYS_FILE") {
        let raw = fs::read_to_string(path.trim()).with_context(|| format!("Failed to read {}", path))?;
        let keys: Vec<String> =
            serde_json::from_str(&raw).with_context(|| format!("{} must hold a JSON array of keys", path))?;
        return Ok(keys.into_iter().map(|k| k.trim().to_string()).filter(|k| !k.is_empty()).collect());
    }
    Ok(split_list(&required("WALLET_PRIVATE_KEYS")?))
}

fn gwei_or(key: &str, default: &str) -> Result<U256> {
    let raw = env::var(key).unwrap_or_else(|_| default.to_string());
    let units = parse_units(raw.trim(), "gwei").with_context(|| format!("Failed to parse {}", key))?;
    Ok(units.into())
}

impl Config {
    pub fn load() -> Result<Self> {
        let ws_rpc_urls = split_list(&env::var("WS_RPC_URLS").unwrap_or_default());

        let stake_raw = required("STAKE_AMOUNT")?;
        let stake_amount = parse_ether(stake_raw.trim()).context("Failed to parse STAKE_AMOUNT")?;

        let profit_threshold = required("PROFIT_THRESHOLD")?
            .trim()
            .parse::<f64>()
            .context("Failed to parse PROFIT_THRESHOLD as a ratio")?;

        let config = Self {
            http_rpc_url: required("HTTP_RPC_URL")?,
            ws_rpc_urls,
            wallet_private_keys: wallet_keys()?,
            chain_id: parsed_or("CHAIN_ID", 8453)?,

            bonding_contract: address("BONDING_CONTRACT_ADDRESS")?,
            router_contract: address("ROUTER_CONTRACT_ADDRESS")?,
            asset_token: address("ASSET_TOKEN_ADDRESS")?,

            detection_mode: parsed_or("DETECTION_MODE", DetectionMode::Polling)?,
            stake_amount,
            profit_threshold,
            symbol_prefix: env::var("SYMBOL_PREFIX")
                .ok()
                .map(|p| p.trim().to_lowercase())
                .filter(|p| !p.is_empty()),

            poll_interval_ms: parsed_or("POLL_INTERVAL_MS", 1_000)?,
            log_chunk_blocks: parsed_or("LOG_CHUNK_BLOCKS", 2_000)?,
            monitor_interval_ms: parsed_or("MONITOR_INTERVAL_MS", 5_000)?,
            health_check_interval_ms: parsed_or("HEALTH_CHECK_INTERVAL_MS", 30_000)?,

            max_reconnect_attempts: parsed_or("MAX_RECONNECT_ATTEMPTS", 10)?,
            reconnect_delay_ms: parsed_or("RECONNECT_DELAY_MS", 5_000)?,
            max_reconnect_delay_ms: parsed_or("MAX_RECONNECT_DELAY_MS", 60_000)?,

            rpc_timeout_secs: parsed_or("RPC_TIMEOUT_SECS", 15)?,
            confirmation_timeout_secs: parsed_or("CONFIRMATION_TIMEOUT_SECS", 60)?,

            dedup_capacity: parsed_or("DEDUP_CAPACITY", 1_000)?,
            dedup_ttl_secs: parsed_or("DEDUP_TTL_SECS", 600)?,

            gas_limit: parsed_or("GAS_LIMIT", 800_000)?,
            max_fee_per_gas: gwei_or("MAX_FEE_PER_GAS_GWEI", "0.03")?,
            max_priority_fee_per_gas: gwei_or("MAX_PRIORITY_FEE_GWEI", "0.03")?,

            db_path: Self::db_path_from_env(),
        };

        config.validate()?;
        Ok(config)
    }

    /// Ledger location alone, for commands that never touch the chain.
    pub fn db_path_from_env() -> String {
        env::var("DB_PATH").unwrap_or_else(|_| "data/trades".to_string())
    }

    pub fn validate(&self) -> Result<()> {
        if self.stake_amount.is_zero() {
            return Err(anyhow!("STAKE_AMOUNT must be greater than zero"));
        }
        if !self.profit_threshold.is_finite() || self.profit_threshold < 1.0 {
            return Err(anyhow!(
                "PROFIT_THRESHOLD must be a ratio >= 1.0, got {}",
                self.profit_threshold
            ));
        }
        if self.poll_interval_ms == 0 || self.monitor_interval_ms == 0 || self.health_check_interval_ms == 0 {
            return Err(anyhow!("Poll, monitor and health-check intervals must be non-zero"));
        }
        if self.wallet_private_keys.is_empty() {
            return Err(anyhow!("At least one wallet key is required"));
        }
        if self.log_chunk_blocks == 0 {
            return Err(anyhow!("LOG_CHUNK_BLOCKS must be at least 1"));
        }
        if self.max_reconnect_attempts == 0 {
            return Err(anyhow!("MAX_RECONNECT_ATTEMPTS must be at least 1"));
        }
        if self.rpc_timeout_secs == 0 || self.confirmation_timeout_secs == 0 {
            return Err(anyhow!("RPC and confirmation timeouts must be bounded and non-zero"));
        }
        if self.dedup_capacity == 0 {
            return Err(anyhow!("DEDUP_CAPACITY must be at least 1"));
        }
        if self.detection_mode == DetectionMode::Subscription && self.ws_rpc_urls.is_empty() {
            return Err(anyhow!("DETECTION_MODE=subscription requires WS_RPC_URLS"));
        }
        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn monitor_interval(&self) -> Duration {
        Duration::from_millis(self.monitor_interval_ms)
    }

    pub fn health_check_interval(&self) -> Duration {
        Duration::from_millis(self.health_check_interval_ms)
    }

    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_secs(self.rpc_timeout_secs)
    }

    pub fn confirmation_timeout(&self) -> Duration {
        Duration::from_secs(self.confirmation_timeout_secs)
    }

    pub fn dedup_ttl(&self) -> Duration {
        Duration::from_secs(self.dedup_ttl_secs)
    }
}

#[cfg(test)]
pub(crate) fn test_config() -> Config {
    Config {
        http_rpc_url: "http://127.0.0.1:8545".to_string(),
        ws_rpc_urls: vec!["ws://127.0.0.1:8546".to_string()],
        wallet_private_keys: vec!["0x0123456789012345678901234567890123456789012345678901234567890123".to_string()],
        chain_id: 8453,
        bonding_contract: Address::repeat_byte(0xb0),
        router_contract: Address::repeat_byte(0x70),
        asset_token: Address::repeat_byte(0xa5),
        detection_mode: DetectionMode::Polling,
        stake_amount: U256::exp10(17),
        profit_threshold: 1.5,
        symbol_prefix: None,
        poll_interval_ms: 1_000,
        log_chunk_blocks: 2_000,
        monitor_interval_ms: 5_000,
        health_check_interval_ms: 30_000,
        max_reconnect_attempts: 3,
        reconnect_delay_ms: 10,
        max_reconnect_delay_ms: 40,
        rpc_timeout_secs: 15,
        confirmation_timeout_secs: 60,
        dedup_capacity: 1_000,
        dedup_ttl_secs: 600,
        gas_limit: 800_000,
        max_fee_per_gas: U256::from(30_000_000u64),
        max_priority_fee_per_gas: U256::from(30_000_000u64),
        db_path: "data/trades".to_string(),
    }
}
