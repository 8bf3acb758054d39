//! Configuration for a validator node

use crate::{Error, Result};
use ledger_core::{NodeIdentity, SignatureProvider};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Validator node configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Secret key (hex); takes precedence over `secret_key_file`
    pub secret_key: Option<String>,

    /// File holding the hex secret key
    pub secret_key_file: Option<PathBuf>,

    /// How peers reach this node; must carry an IPv4 address
    pub connection_string: String,

    /// Peer RPC listen address
    pub listen_addr: String,

    /// Start a new ledger from this genesis file
    pub genesis_path: Option<PathBuf>,

    /// Join the ledger served by this validator
    pub join_target: Option<String>,

    /// Finalized blocks kept in history
    pub history_retention_blocks: u64,

    /// Actor mailbox capacity
    pub mailbox_capacity: usize,

    /// Peer networking
    pub network: NetworkConfig,
}

/// Peer networking configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Timeout of one peer request (ms)
    pub fetch_timeout_ms: u64,

    /// Pause before the single retry of a failed fetch (ms)
    pub retry_backoff_ms: u64,

    /// Peers pulled in parallel
    pub pull_concurrency: usize,

    /// Workers notifying newly admitted validators
    pub notify_concurrency: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            secret_key: None,
            secret_key_file: None,
            connection_string: "http://127.0.0.1:8080".to_string(),
            listen_addr: "0.0.0.0:8080".to_string(),
            genesis_path: None,
            join_target: None,
            history_retention_blocks: 1_000,
            mailbox_capacity: 1_000,
            network: NetworkConfig::default(),
        }
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            fetch_timeout_ms: 500,
            retry_backoff_ms: 100,
            pull_concurrency: 4,
            notify_concurrency: 3,
        }
    }
}

impl NetworkConfig {
    /// Peer request timeout
    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_millis(self.fetch_timeout_ms)
    }

    /// Retry backoff
    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }
}

/// How the node obtains its first snapshot
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Startup {
    /// Create a new ledger
    Genesis(PathBuf),
    /// Ask an existing validator to admit us
    Join(String),
    /// Wait for a pushed snapshot
    Await,
}

impl Config {
    /// Load from file
    pub fn from_file(path: impl AsRef<std::path::Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)
            .map_err(|e| Error::Configuration(format!("Failed to parse config: {}", e)))?;
        Ok(config)
    }

    /// Load from environment variables
    pub fn from_env() -> Result<Self> {
        let mut config = Config::default();

        if let Ok(key) = std::env::var("VALIDATOR_SECRET_KEY") {
            config.secret_key = Some(key);
        }

        if let Ok(path) = std::env::var("VALIDATOR_SECRET_KEY_FILE") {
            config.secret_key_file = Some(PathBuf::from(path));
        }

        if let Ok(conn) = std::env::var("VALIDATOR_CONNECTION_STRING") {
            config.connection_string = conn;
        }

        if let Ok(addr) = std::env::var("VALIDATOR_LISTEN_ADDR") {
            config.listen_addr = addr;
        }

        if let Ok(path) = std::env::var("VALIDATOR_GENESIS") {
            config.genesis_path = Some(PathBuf::from(path));
        }

        if let Ok(target) = std::env::var("VALIDATOR_JOIN_TARGET") {
            config.join_target = Some(target);
        }

        if let Ok(blocks) = std::env::var("VALIDATOR_HISTORY_RETENTION") {
            config.history_retention_blocks = blocks
                .parse()
                .map_err(|e| Error::Configuration(format!("Invalid history retention: {}", e)))?;
        }

        Ok(config)
    }

    /// Hex secret key from the config or its file
    pub fn secret_key_hex(&self) -> Result<String> {
        if let Some(key) = &self.secret_key {
            return Ok(key.trim().to_string());
        }
        match &self.secret_key_file {
            Some(path) => Ok(std::fs::read_to_string(path)?.trim().to_string()),
            None => Err(Error::Configuration(
                "no secret key: set VALIDATOR_SECRET_KEY or secret_key_file".to_string(),
            )),
        }
    }

    /// Signing identity of this node
    pub fn identity(&self, provider: Arc<dyn SignatureProvider>) -> Result<NodeIdentity> {
        Ok(NodeIdentity::from_hex(provider, &self.secret_key_hex()?)?)
    }

    /// Startup mode; genesis and join target are mutually exclusive
    pub fn startup(&self) -> Result<Startup> {
        match (&self.genesis_path, &self.join_target) {
            (Some(_), Some(_)) => Err(Error::Configuration(
                "genesis_path and join_target are mutually exclusive".to_string(),
            )),
            (Some(path), None) => Ok(Startup::Genesis(path.clone())),
            (None, Some(target)) => Ok(Startup::Join(target.clone())),
            (None, None) => Ok(Startup::Await),
        }
    }

    /// Reject settings the node cannot run with
    pub fn validate(&self) -> Result<()> {
        if !ledger_core::types::is_valid_connection_string(&self.connection_string) {
            return Err(Error::Configuration(format!(
                "connection string {} carries no IPv4 address",
                self.connection_string
            )));
        }
        if self.network.pull_concurrency == 0 || self.network.notify_concurrency == 0 {
            return Err(Error::Configuration("concurrency settings must be positive".to_string()));
        }
        self.startup().map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ledger_core::Ed25519Provider;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.network.notify_concurrency, 3);
        assert_eq!(config.startup().unwrap(), Startup::Await);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_toml() {
        let config: Config = toml::from_str(
            r#"
connection_string = "http://10.0.0.5:9000"
join_target = "10.0.0.1:8080"

[network]
fetch_timeout_ms = 250
"#,
        )
        .unwrap();
        assert_eq!(config.network.fetch_timeout_ms, 250);
        assert_eq!(config.network.pull_concurrency, 4);
        assert_eq!(config.startup().unwrap(), Startup::Join("10.0.0.1:8080".to_string()));
    }

    #[test]
    fn test_conflicting_startup() {
        let config = Config {
            genesis_path: Some(PathBuf::from("genesis.toml")),
            join_target: Some("10.0.0.1".to_string()),
            ..Default::default()
        };
        assert!(config.validate().unwrap_err().is_fatal());
    }

    #[test]
    fn test_secret_key_from_file() {
        let identity = NodeIdentity::generate_ed25519();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("key");
        std::fs::write(&path, format!("{}\n", identity.secret_key_hex())).unwrap();

        let config = Config {
            secret_key_file: Some(path),
            ..Default::default()
        };
        let restored = config.identity(Arc::new(Ed25519Provider)).unwrap();
        assert_eq!(restored.public_key(), identity.public_key());
    }

    #[test]
    fn test_missing_secret_key() {
        assert!(Config::default().secret_key_hex().unwrap_err().is_fatal());
    }
}
