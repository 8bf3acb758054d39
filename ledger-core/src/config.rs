//! Genesis configuration for a new ledger

use crate::crypto::SignatureProvider;
use crate::types::{Account, LedgerParameters, LedgerSnapshot, ValidatorNode};
use crate::{Error, Result};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;

/// Starting state of a ledger
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GenesisConfig {
    /// Parameters in force from block 0
    #[serde(default)]
    pub parameters: LedgerParameters,

    /// Initial accounts
    #[serde(default)]
    pub accounts: Vec<Account>,

    /// Initial validators; each must carry its self-signature
    #[serde(default)]
    pub validators: Vec<ValidatorNode>,
}

impl GenesisConfig {
    /// Load from file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// Parse TOML
    pub fn from_toml_str(content: &str) -> Result<Self> {
        toml::from_str(content)
            .map_err(|e| Error::Configuration(format!("Failed to parse genesis: {}", e)))
    }

    /// Check the accounts and validator signatures
    pub fn validate(&self, provider: &dyn SignatureProvider) -> Result<()> {
        let mut keys = HashSet::new();
        let mut names = HashSet::new();
        for account in &self.accounts {
            if !keys.insert(account.public_key.as_str()) {
                return Err(Error::Configuration(format!(
                    "Duplicate genesis account {}",
                    account.public_key
                )));
            }
            if !account.name.is_empty() && !names.insert(account.name.as_str()) {
                return Err(Error::Configuration(format!("Duplicate account name {}", account.name)));
            }
            if account.amount < Decimal::ZERO {
                return Err(Error::Configuration(format!(
                    "Negative balance for {}",
                    account.public_key
                )));
            }
        }

        if let Some(node) = self.validators.iter().find(|v| !v.validate(provider)) {
            return Err(Error::Configuration(format!(
                "Invalid genesis validator {} at {}",
                node.public_key, node.connection_string
            )));
        }

        let accounts: HashSet<Account> = self.accounts.iter().cloned().collect();
        self.parameters
            .validate(&accounts)
            .map_err(|e| Error::Configuration(format!("Invalid genesis parameters: {}", e)))
    }

    /// Build snapshot 0
    pub fn into_snapshot(self, provider: &dyn SignatureProvider) -> Result<LedgerSnapshot> {
        self.validate(provider)?;
        LedgerSnapshot::genesis(provider, self.accounts, self.validators, self.parameters)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{Ed25519Provider, NodeIdentity};
    use rust_decimal_macros::dec;
    use std::io::Write;

    #[test]
    fn test_parse_genesis_file() {
        let identity = NodeIdentity::ed25519_from_seed([7u8; 32]);
        let node = ValidatorNode::announce(&identity, "http://10.0.0.1:8080").unwrap();
        let toml = format!(
            r#"
[parameters]
transactionCost = "1"
maxConnections = 10

[[accounts]]
publicKey = "{key}"
name = "genesis"
amount = "1000"
delegatedValidator = "{key}"

[[validators]]
publicKey = "{key}"
connectionString = "{conn}"
signature = "{sig}"
"#,
            key = identity.public_key(),
            conn = node.connection_string,
            sig = node.signature,
        );

        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(toml.as_bytes()).unwrap();

        let genesis = GenesisConfig::from_file(file.path()).unwrap();
        let snapshot = genesis.into_snapshot(&Ed25519Provider).unwrap();

        assert_eq!(snapshot.id, 0);
        assert_eq!(snapshot.total_value(), dec!(1000));
        assert_eq!(snapshot.validators.len(), 1);
        assert!(snapshot.verify_hash(&Ed25519Provider));
    }

    #[test]
    fn test_unsigned_validator_rejected() {
        let genesis = GenesisConfig {
            validators: vec![ValidatorNode {
                public_key: "00".repeat(32),
                connection_string: "http://10.0.0.1:8080".to_string(),
                address: Default::default(),
                signature: "00".repeat(64),
            }],
            ..Default::default()
        };
        let err = genesis.into_snapshot(&Ed25519Provider).unwrap_err();
        assert!(err.is_fatal());
    }

    #[test]
    fn test_duplicate_account_rejected() {
        let genesis = GenesisConfig {
            accounts: vec![
                Account::new("a", "", dec!(1), "a"),
                Account::new("a", "", dec!(2), "a"),
            ],
            ..Default::default()
        };
        assert!(genesis.validate(&Ed25519Provider).is_err());
    }

    #[test]
    fn test_negative_cost_rejected() {
        let mut genesis = GenesisConfig::default();
        genesis.parameters.transaction_cost = dec!(-1);
        assert!(matches!(
            genesis.validate(&Ed25519Provider),
            Err(Error::Configuration(_))
        ));
    }

    #[test]
    fn test_bad_toml() {
        assert!(matches!(
            GenesisConfig::from_toml_str("accounts = 5"),
            Err(Error::Configuration(_))
        ));
    }
}
