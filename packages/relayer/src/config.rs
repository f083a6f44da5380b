use alloy::primitives::Address;
use alloy::signers::local::PrivateKeySigner;
use eyre::{eyre, Result, WrapErr};
use std::env;
use std::fmt;
use std::net::SocketAddr;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use crate::retry::RetryConfig;

/// Main configuration for the relayer
#[derive(Debug, Clone)]
pub struct Config {
    pub database: DatabaseConfig,
    /// Chain holding the vault (emits `Locked`, accepts `release`)
    pub source: ChainConfig,
    /// Chain holding the wrapped token bridge (emits `Burned`, accepts `mint`)
    pub destination: ChainConfig,
    pub relayer: RelayerConfig,
    pub quorum: QuorumConfig,
    pub api: ApiConfig,
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

/// One side of the bridge
#[derive(Debug, Clone)]
pub struct ChainConfig {
    pub name: String,
    pub rpc_url: String,
    pub chain_id: u64,
    pub bridge_address: String,
    /// First block scanned when no cursor has been persisted
    pub genesis_block: u64,
}

impl ChainConfig {
    pub fn bridge_address(&self) -> Result<Address> {
        Address::from_str(&self.bridge_address)
            .wrap_err_with(|| format!("{}: invalid bridge address", self.name))
    }
}

/// Relay pipeline tuning
#[derive(Clone)]
pub struct RelayerConfig {
    pub private_key: String,
    pub confirmation_depth: u64,
    pub poll_interval_ms: u64,
    pub max_block_range: u64,
    pub max_retries: u32,
    pub retry_initial_backoff_ms: u64,
    pub retry_max_backoff_ms: u64,
    pub max_in_flight_per_chain: usize,
    pub confirmation_timeout_secs: u64,
}

/// Custom Debug that redacts private_key to prevent accidental log leakage.
impl fmt::Debug for RelayerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RelayerConfig")
            .field("private_key", &"<redacted>")
            .field("confirmation_depth", &self.confirmation_depth)
            .field("poll_interval_ms", &self.poll_interval_ms)
            .field("max_block_range", &self.max_block_range)
            .field("max_retries", &self.max_retries)
            .field("retry_initial_backoff_ms", &self.retry_initial_backoff_ms)
            .field("retry_max_backoff_ms", &self.retry_max_backoff_ms)
            .field("max_in_flight_per_chain", &self.max_in_flight_per_chain)
            .field("confirmation_timeout_secs", &self.confirmation_timeout_secs)
            .finish()
    }
}

impl RelayerConfig {
    pub fn signer(&self) -> Result<PrivateKeySigner> {
        PrivateKeySigner::from_str(&self.private_key).wrap_err("Invalid RELAYER_PRIVATE_KEY")
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn confirmation_timeout(&self) -> Duration {
        Duration::from_secs(self.confirmation_timeout_secs)
    }

    pub fn retry_config(&self) -> RetryConfig {
        RetryConfig {
            max_retries: self.max_retries,
            initial_backoff: Duration::from_millis(self.retry_initial_backoff_ms),
            max_backoff: Duration::from_millis(self.retry_max_backoff_ms),
            ..RetryConfig::default()
        }
    }
}

/// k-of-n attestation gate in front of dispatch
#[derive(Clone, Default)]
pub struct QuorumConfig {
    /// Required distinct attestations (0 disables the gate)
    pub threshold: usize,
    pub validators: Vec<Address>,
    /// Keys of validators co-hosted with the relayer
    pub local_keys: Vec<String>,
}

impl fmt::Debug for QuorumConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QuorumConfig")
            .field("threshold", &self.threshold)
            .field("validators", &self.validators)
            .field("local_keys", &format!("<{} redacted>", self.local_keys.len()))
            .finish()
    }
}

impl QuorumConfig {
    pub fn enabled(&self) -> bool {
        self.threshold > 0
    }
}

/// Operator HTTP surface
#[derive(Debug, Clone)]
pub struct ApiConfig {
    pub bind_addr: SocketAddr,
    /// "json" or "pretty"
    pub log_format: String,
}

/// Default functions
fn default_confirmation_depth() -> u64 {
    5
}

fn default_poll_interval() -> u64 {
    1000
}

fn default_max_block_range() -> u64 {
    1000
}

fn default_max_retries() -> u32 {
    5
}

fn default_retry_initial_backoff() -> u64 {
    2000
}

fn default_retry_max_backoff() -> u64 {
    60_000
}

fn default_max_in_flight() -> usize {
    4
}

fn default_confirmation_timeout() -> u64 {
    300
}

fn default_api_bind_addr() -> &'static str {
    "0.0.0.0:9090"
}

fn required(name: &str) -> Result<String> {
    env::var(name).map_err(|_| eyre!("{} environment variable is required", name))
}

fn optional<T>(name: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: fmt::Display,
{
    match env::var(name) {
        Ok(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse()
            .map_err(|e| eyre!("{} has an invalid value {:?}: {}", name, raw, e)),
        _ => Ok(default),
    }
}

/// Parse a comma-separated address list, ignoring blank entries
pub fn parse_address_list(raw: &str) -> Result<Vec<Address>> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| Address::from_str(s).wrap_err_with(|| format!("invalid address {}", s)))
        .collect()
}

fn parse_key_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

fn is_private_key(key: &str) -> bool {
    key.len() == 66
        && key.starts_with("0x")
        && key[2..].chars().all(|c| c.is_ascii_hexdigit())
}

fn load_chain(prefix: &str, default_name: &str) -> Result<ChainConfig> {
    Ok(ChainConfig {
        name: optional(&format!("{}_CHAIN_NAME", prefix), default_name.to_string())?,
        rpc_url: required(&format!("{}_RPC_URL", prefix))?,
        chain_id: required(&format!("{}_CHAIN_ID", prefix))?
            .parse()
            .wrap_err_with(|| format!("{}_CHAIN_ID must be a valid u64", prefix))?,
        bridge_address: required(&format!("{}_BRIDGE_ADDRESS", prefix))?,
        genesis_block: optional(&format!("{}_GENESIS_BLOCK", prefix), 0)?,
    })
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
        let database = DatabaseConfig {
            url: required("DATABASE_URL")?,
        };

        let source = load_chain("SOURCE", "source")?;
        let destination = load_chain("DEST", "destination")?;

        let relayer = RelayerConfig {
            private_key: required("RELAYER_PRIVATE_KEY")?,
            confirmation_depth: optional("CONFIRMATION_DEPTH", default_confirmation_depth())?,
            poll_interval_ms: optional("POLL_INTERVAL_MS", default_poll_interval())?,
            max_block_range: optional("MAX_BLOCK_RANGE", default_max_block_range())?,
            max_retries: optional("MAX_RETRIES", default_max_retries())?,
            retry_initial_backoff_ms: optional(
                "RETRY_INITIAL_BACKOFF_MS",
                default_retry_initial_backoff(),
            )?,
            retry_max_backoff_ms: optional("RETRY_MAX_BACKOFF_MS", default_retry_max_backoff())?,
            max_in_flight_per_chain: optional("MAX_IN_FLIGHT_PER_CHAIN", default_max_in_flight())?,
            confirmation_timeout_secs: optional(
                "CONFIRMATION_TIMEOUT_SECS",
                default_confirmation_timeout(),
            )?,
        };

        let quorum = QuorumConfig {
            threshold: optional("QUORUM_THRESHOLD", 0)?,
            validators: parse_address_list(&env::var("QUORUM_VALIDATORS").unwrap_or_default())
                .wrap_err("QUORUM_VALIDATORS")?,
            local_keys: parse_key_list(&env::var("QUORUM_LOCAL_KEYS").unwrap_or_default()),
        };

        let api = ApiConfig {
            bind_addr: optional(
                "API_BIND_ADDR",
                default_api_bind_addr()
                    .parse()
                    .wrap_err("default API bind address")?,
            )?,
            log_format: optional("LOG_FORMAT", "pretty".to_string())?,
        };

        let config = Config {
            database,
            source,
            destination,
            relayer,
            quorum,
            api,
        };

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.database.url.is_empty() {
            return Err(eyre!("database.url cannot be empty"));
        }

        for chain in [&self.source, &self.destination] {
            if chain.rpc_url.is_empty() {
                return Err(eyre!("{}: rpc_url cannot be empty", chain.name));
            }
            if chain.bridge_address.len() != 42 || !chain.bridge_address.starts_with("0x") {
                return Err(eyre!(
                    "{}: bridge_address must be a valid hex address (42 chars with 0x prefix)",
                    chain.name
                ));
            }
            chain.bridge_address()?;
        }

        // Both pipelines key cursors and nonces by chain id.
        if self.source.chain_id == self.destination.chain_id {
            return Err(eyre!(
                "source and destination share chain id {}",
                self.source.chain_id
            ));
        }

        if !is_private_key(&self.relayer.private_key) {
            return Err(eyre!("relayer.private_key must be 66 chars (0x + 64 hex chars)"));
        }

        if self.relayer.confirmation_depth == 0 {
            return Err(eyre!("confirmation_depth must be at least 1"));
        }
        if self.relayer.max_block_range == 0 {
            return Err(eyre!("max_block_range must be at least 1"));
        }
        if self.relayer.max_retries == 0 {
            return Err(eyre!("max_retries must be at least 1"));
        }
        if self.relayer.max_in_flight_per_chain == 0 {
            return Err(eyre!("max_in_flight_per_chain must be at least 1"));
        }
        if self.relayer.retry_initial_backoff_ms > self.relayer.retry_max_backoff_ms {
            return Err(eyre!("retry_initial_backoff_ms exceeds retry_max_backoff_ms"));
        }

        if self.quorum.enabled() {
            if self.quorum.validators.is_empty() {
                return Err(eyre!("QUORUM_THRESHOLD > 0 requires QUORUM_VALIDATORS"));
            }
            if self.quorum.threshold > self.quorum.validators.len() {
                return Err(eyre!(
                    "quorum threshold {} exceeds validator count {}",
                    self.quorum.threshold,
                    self.quorum.validators.len()
                ));
            }
        }
        if self.quorum.local_keys.iter().any(|k| !is_private_key(k)) {
            return Err(eyre!("QUORUM_LOCAL_KEYS entries must be 0x + 64 hex chars"));
        }

        if !matches!(self.api.log_format.as_str(), "json" | "pretty") {
            return Err(eyre!("LOG_FORMAT must be json or pretty"));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: &str = "0x0000000000000000000000000000000000000000000000000000000000000001";

    fn sample() -> Config {
        Config {
            database: DatabaseConfig {
                url: "postgres://localhost/test".to_string(),
            },
            source: ChainConfig {
                name: "source".to_string(),
                rpc_url: "http://localhost:8545".to_string(),
                chain_id: 31337,
                bridge_address: "0x0000000000000000000000000000000000000001".to_string(),
                genesis_block: 0,
            },
            destination: ChainConfig {
                name: "destination".to_string(),
                rpc_url: "http://localhost:8546".to_string(),
                chain_id: 31338,
                bridge_address: "0x0000000000000000000000000000000000000002".to_string(),
                genesis_block: 0,
            },
            relayer: RelayerConfig {
                private_key: KEY.to_string(),
                confirmation_depth: default_confirmation_depth(),
                poll_interval_ms: default_poll_interval(),
                max_block_range: default_max_block_range(),
                max_retries: default_max_retries(),
                retry_initial_backoff_ms: default_retry_initial_backoff(),
                retry_max_backoff_ms: default_retry_max_backoff(),
                max_in_flight_per_chain: default_max_in_flight(),
                confirmation_timeout_secs: default_confirmation_timeout(),
            },
            quorum: QuorumConfig::default(),
            api: ApiConfig {
                bind_addr: default_api_bind_addr().parse().unwrap(),
                log_format: "pretty".to_string(),
            },
        }
    }

    #[test]
    fn test_defaults() {
        assert_eq!(default_confirmation_depth(), 5);
        assert_eq!(default_poll_interval(), 1000);
        assert_eq!(default_max_retries(), 5);
        assert_eq!(default_max_in_flight(), 4);
    }

    #[test]
    fn test_valid_config_passes() {
        let config = sample();
        assert!(config.validate().is_ok());
        assert!(config.relayer.signer().is_ok());
        assert_eq!(config.relayer.retry_config().max_retries, 5);
    }

    #[test]
    fn test_rejects_malformed_values() {
        let mut config = sample();
        config.relayer.private_key = "0x123".to_string();
        assert!(config.validate().is_err());

        let mut config = sample();
        config.source.bridge_address = "invalid".to_string();
        assert!(config.validate().is_err());

        let mut config = sample();
        config.destination.chain_id = config.source.chain_id;
        assert!(config.validate().is_err());

        let mut config = sample();
        config.relayer.confirmation_depth = 0;
        assert!(config.validate().is_err());

        let mut config = sample();
        config.relayer.max_in_flight_per_chain = 0;
        assert!(config.validate().is_err());

        let mut config = sample();
        config.api.log_format = "xml".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_quorum_validation() {
        let mut config = sample();
        config.quorum.threshold = 1;
        assert!(config.validate().is_err());

        config.quorum.validators = vec![Address::repeat_byte(1), Address::repeat_byte(2)];
        assert!(config.validate().is_ok());

        config.quorum.threshold = 3;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_debug_redacts_secrets() {
        let mut config = sample();
        config.quorum.local_keys = vec![KEY.to_string()];
        let rendered = format!("{:?}", config);
        assert!(!rendered.contains(KEY));
        assert!(!rendered.contains("postgres://"));
    }

    #[test]
    fn test_parse_address_list() {
        let parsed = parse_address_list(
            " 0x0000000000000000000000000000000000000001, ,0x0000000000000000000000000000000000000002",
        )
        .unwrap();
        assert_eq!(parsed.len(), 2);
        assert!(parse_address_list("nope").is_err());
        assert!(parse_address_list("").unwrap().is_empty());
    }
}
