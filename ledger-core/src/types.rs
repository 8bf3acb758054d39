//! Core types for the ledger
//!
//! All types are designed for:
//! - Deterministic canonical strings (see [`crate::canonical`])
//! - JSON transport between validators (serde, camelCase)
//! - Exact arithmetic (Decimal for money)

use crate::canonical::{strip_whitespace, Canonical, CanonicalWriter};
use crate::crypto::{self, NodeIdentity, SignatureProvider};
use crate::topology::{self, Address, GroupShape};
use crate::{Error, Result};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::net::Ipv4Addr;

/// Hex-encoded public key; the identity of accounts and validators
pub type PublicKey = String;

/// Block height
pub type BlockId = u64;

/// Longest account alias kept
pub const MAX_NAME_LENGTH: usize = 200;

/// Longest account description kept
pub const MAX_DESCRIPTION_LENGTH: usize = 2000;

/// Finality is attempted only from this revision on
pub const MESSAGE_TRANSMISSIONS_PER_BLOCK: u32 = 3;

fn truncate_chars(value: &str, max: usize) -> String {
    value.chars().take(max).collect()
}

// =========================================================================
// ACCOUNTS
// =========================================================================

/// Ledger account
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Account {
    /// Owner key, unique within a snapshot
    pub public_key: PublicKey,

    /// Optional unique alias (empty when unset)
    #[serde(default)]
    pub name: String,

    /// Free text set by the holder
    #[serde(default)]
    pub description: String,

    /// Balance, never negative in a finalized snapshot
    pub amount: Decimal,

    /// Validator whose stake this balance counts toward
    pub delegated_validator: PublicKey,
}

impl Account {
    /// Create new account; the name is truncated to [`MAX_NAME_LENGTH`]
    pub fn new(
        public_key: impl Into<PublicKey>,
        name: impl AsRef<str>,
        amount: Decimal,
        delegated_validator: impl Into<PublicKey>,
    ) -> Self {
        Self {
            public_key: public_key.into(),
            name: truncate_chars(name.as_ref(), MAX_NAME_LENGTH),
            description: String::new(),
            amount,
            delegated_validator: delegated_validator.into(),
        }
    }

    /// Fresh account created by an incoming credit, delegating to itself
    pub fn unnamed(public_key: &str) -> Self {
        Self::new(public_key, "", Decimal::ZERO, public_key)
    }
}

impl Canonical for Account {
    fn write_canonical(&self, writer: &mut CanonicalWriter) {
        writer
            .field(&self.public_key)
            .field(&self.name)
            .field(&self.description)
            .decimal(&self.amount)
            .field(&self.delegated_validator);
    }
}

/// Account lookup result for clients
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountInfo {
    /// The account
    pub account: Account,

    /// Its validator entry, when the account also validates
    pub node: Option<ValidatorNode>,
}

// =========================================================================
// SIGNATURES
// =========================================================================

/// A signature, optionally carrying the message it was made over
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Signature {
    /// Signer
    pub public_key: PublicKey,

    /// Bound message; empty when the message is implied by context
    #[serde(default)]
    pub message_value: String,

    /// Hex signature bytes
    pub signature_value: String,
}

impl Signature {
    /// Re-verify against the bound message
    pub fn validate(&self, provider: &dyn SignatureProvider) -> bool {
        self.validate_message(provider, &self.message_value)
    }

    /// Verify against a message supplied by the caller
    pub fn validate_message(&self, provider: &dyn SignatureProvider, message: &str) -> bool {
        crypto::verify_hex(provider, message, &self.public_key, &self.signature_value)
    }
}

impl Canonical for Signature {
    fn write_canonical(&self, writer: &mut CanonicalWriter) {
        writer
            .field(&self.public_key)
            .field(&self.message_value)
            .field(&self.signature_value);
    }
}

// =========================================================================
// VALIDATORS
// =========================================================================

/// Validator membership entry
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidatorNode {
    /// Validator key
    pub public_key: PublicKey,

    /// Where peers reach this validator
    pub connection_string: String,

    /// Hierarchical address, least significant digit first
    #[serde(default)]
    pub address: Address,

    /// Self-signature over `public_key + connection_string`
    pub signature: String,
}

impl ValidatorNode {
    /// Signed announcement of `identity` reachable at `connection_string`
    pub fn announce(identity: &NodeIdentity, connection_string: impl Into<String>) -> Result<Self> {
        let connection_string = connection_string.into();
        let signature = identity.sign(&Self::signing_string_for(identity.public_key(), &connection_string))?;
        Ok(Self {
            public_key: identity.public_key().clone(),
            connection_string,
            address: Address::default(),
            signature,
        })
    }

    fn signing_string_for(public_key: &str, connection_string: &str) -> String {
        format!("{}{}", public_key, connection_string)
    }

    /// String covered by the self-signature
    pub fn signing_string(&self) -> String {
        Self::signing_string_for(&self.public_key, &self.connection_string)
    }

    /// Connection string well formed and self-signature valid
    pub fn validate(&self, provider: &dyn SignatureProvider) -> bool {
        is_valid_connection_string(&self.connection_string)
            && crypto::verify_hex(provider, &self.signing_string(), &self.public_key, &self.signature)
    }
}

impl Canonical for ValidatorNode {
    fn write_canonical(&self, writer: &mut CanonicalWriter) {
        writer
            .field(self.address.to_string())
            .field(&self.connection_string)
            .field(&self.public_key)
            .field(&self.signature);
    }
}

/// Extract the IPv4 address embedded in a connection string
pub fn connection_ip(connection_string: &str) -> Option<Ipv4Addr> {
    connection_string
        .split(|c: char| !(c.is_ascii_digit() || c == '.'))
        .find_map(|token| token.parse::<Ipv4Addr>().ok())
}

/// A connection string must carry an IPv4 address
pub fn is_valid_connection_string(connection_string: &str) -> bool {
    connection_ip(connection_string).is_some()
}

// =========================================================================
// PAYMENTS
// =========================================================================

/// Transfer between two accounts
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Payment {
    /// Payer, as public key or alias
    pub from: String,

    /// Receiver, as public key or alias
    pub to: String,

    /// Resolved payer key
    #[serde(default)]
    pub public_key_from: PublicKey,

    /// Resolved receiver key
    #[serde(default)]
    pub public_key_to: PublicKey,

    /// Free text, bounded by `max_message_length`
    #[serde(default)]
    pub comment: String,

    /// Amount debited from the payer
    pub amount: Decimal,

    /// Block the payment is meant for
    pub block_id: BlockId,

    /// Payer signature
    pub signature: String,

    /// Countersignature of the proposing validator
    #[serde(default)]
    pub validator_signature: String,

    /// Previous-block hash bound by the countersignature
    #[serde(default)]
    pub last_status_hash: String,
}

impl Payment {
    /// Build and sign a payment as `payer`; `from` defaults to the payer key
    pub fn signed(
        payer: &NodeIdentity,
        to: impl Into<String>,
        comment: impl Into<String>,
        amount: Decimal,
        block_id: BlockId,
    ) -> Result<Self> {
        let mut payment = Self {
            from: payer.public_key().clone(),
            to: to.into(),
            public_key_from: String::new(),
            public_key_to: String::new(),
            comment: comment.into(),
            amount,
            block_id,
            signature: String::new(),
            validator_signature: String::new(),
            last_status_hash: String::new(),
        };
        payment.signature = payer.sign(&payment.signing_string())?;
        Ok(payment)
    }

    /// String covered by the payer signature
    pub fn signing_string(&self) -> String {
        let mut writer = CanonicalWriter::new();
        writer
            .field(&self.from)
            .decimal(&self.amount)
            .field(&self.to)
            .field(&self.comment)
            .field(self.block_id);
        writer.finish()
    }

    /// String covered by the validator countersignature
    pub fn validator_signing_string(&self) -> String {
        let mut writer = CanonicalWriter::new();
        writer
            .field(self.signing_string())
            .field(&self.signature)
            .field(&self.last_status_hash);
        writer.finish()
    }

    /// Key credited by this payment
    pub fn receiver_key(&self) -> &str {
        if self.public_key_to.is_empty() {
            &self.to
        } else {
            &self.public_key_to
        }
    }

    /// Key used to check the payer signature
    pub fn payer_key(&self) -> &str {
        if self.public_key_from.is_empty() {
            &self.from
        } else {
            &self.public_key_from
        }
    }

    /// Resolve aliases to keys against the given accounts
    pub fn resolve_keys(&mut self, names: &HashMap<String, PublicKey>) {
        self.public_key_from = names.get(&self.from).cloned().unwrap_or_else(|| self.from.clone());
        self.public_key_to = names.get(&self.to).cloned().unwrap_or_else(|| self.to.clone());
    }

    /// Countersign, binding the payer signature to `previous_hash`
    pub fn countersign(&mut self, validator: &NodeIdentity, previous_hash: &str) -> Result<()> {
        self.last_status_hash = previous_hash.to_string();
        self.validator_signature = validator.sign(&self.validator_signing_string())?;
        Ok(())
    }

    /// Check the payer signature
    pub fn check_payer_signature(&self, provider: &dyn SignatureProvider) -> Result<()> {
        if crypto::verify_hex(provider, &self.signing_string(), self.payer_key(), &self.signature) {
            Ok(())
        } else {
            Err(Error::Validation(format!("bad payer signature from {}", self.from)))
        }
    }

    /// Check the validator countersignature and its previous-hash binding
    pub fn check_countersignature(
        &self,
        provider: &dyn SignatureProvider,
        validator: &str,
        previous_hash: &str,
    ) -> Result<()> {
        if self.last_status_hash != previous_hash {
            return Err(Error::Replay(format!(
                "payment from {} bound to hash {}, expected {}",
                self.from, self.last_status_hash, previous_hash
            )));
        }
        if crypto::verify_hex(provider, &self.validator_signing_string(), validator, &self.validator_signature) {
            Ok(())
        } else {
            Err(Error::Validation(format!(
                "bad countersignature by {} on payment from {}",
                validator, self.from
            )))
        }
    }
}

impl Canonical for Payment {
    fn write_canonical(&self, writer: &mut CanonicalWriter) {
        writer
            .field(&self.from)
            .field(&self.to)
            .field(&self.comment)
            .decimal(&self.amount)
            .field(&self.signature)
            .field(&self.validator_signature)
            .field(self.block_id)
            .field(&self.last_status_hash);
    }
}

// =========================================================================
// ACCOUNT ATTRIBUTES
// =========================================================================

/// Signed change of an account's alias, description or delegation
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountAttributesUpdate {
    /// Account key
    pub from: PublicKey,

    /// New alias
    #[serde(default)]
    pub name: Option<String>,

    /// New description
    #[serde(default)]
    pub description: Option<String>,

    /// New delegated validator
    #[serde(default)]
    pub delegated: Option<PublicKey>,

    /// Snapshot id this update is bound to
    pub block_id: BlockId,

    /// Previous-block hash this update is bound to
    pub previous_block_hash: String,

    /// Account holder signature
    pub signature: String,
}

impl AccountAttributesUpdate {
    /// Build and sign an update as `owner`
    pub fn signed(
        owner: &NodeIdentity,
        name: Option<&str>,
        description: Option<&str>,
        delegated: Option<&str>,
        block_id: BlockId,
        previous_block_hash: impl Into<String>,
    ) -> Result<Self> {
        let mut update = Self {
            from: owner.public_key().clone(),
            name: name.map(|n| truncate_chars(n, MAX_NAME_LENGTH)),
            description: description.map(|d| truncate_chars(d, MAX_DESCRIPTION_LENGTH)),
            delegated: delegated.map(str::to_string),
            block_id,
            previous_block_hash: previous_block_hash.into(),
            signature: String::new(),
        };
        update.signature = owner.sign(&update.signing_string())?;
        Ok(update)
    }

    /// String covered by the signature
    pub fn signing_string(&self) -> String {
        let mut writer = CanonicalWriter::new();
        writer
            .field(&self.from)
            .optional(self.delegated.as_deref())
            .optional(self.name.as_deref())
            .optional(self.description.as_deref())
            .field(self.block_id)
            .field(&self.previous_block_hash);
        writer.finish()
    }

    /// Check binding to `(block_id, previous_hash)` and the signature
    pub fn check(&self, provider: &dyn SignatureProvider, block_id: BlockId, previous_hash: &str) -> Result<()> {
        if self.block_id != block_id || self.previous_block_hash != previous_hash {
            return Err(Error::Replay(format!(
                "attribute update from {} bound to block {}, expected {}",
                self.from, self.block_id, block_id
            )));
        }
        if crypto::verify_hex(provider, &self.signing_string(), &self.from, &self.signature) {
            Ok(())
        } else {
            Err(Error::Validation(format!("bad attribute update signature from {}", self.from)))
        }
    }

    /// Requested alias, if any and non-empty
    pub fn requested_name(&self) -> Option<&str> {
        self.name.as_deref().filter(|n| !n.is_empty())
    }
}

impl Canonical for AccountAttributesUpdate {
    fn write_canonical(&self, writer: &mut CanonicalWriter) {
        writer
            .field(&self.from)
            .optional(self.name.as_deref())
            .optional(self.description.as_deref())
            .optional(self.delegated.as_deref())
            .field(self.block_id)
            .field(&self.previous_block_hash)
            .field(&self.signature);
    }
}

// =========================================================================
// PARAMETERS
// =========================================================================

/// Voted ledger parameters
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LedgerParameters {
    /// Longest payment comment; 0 disables the check
    pub max_message_length: usize,

    /// Accounts spliced into the ledger when these parameters win
    pub account_reassignments: HashSet<Account>,

    /// Advisory client refresh rate
    pub message_update_frequency_per_hour: u32,

    /// Frame length
    pub frame_processing_time_ms: u64,

    /// Peer degree bound for the topology
    pub max_connections: i64,

    /// Extra gossip sub-steps per revision on top of the topology depth
    pub transmit_redundancy: u32,

    /// Balance a candidate must exceed to join as validator
    pub validator_stake_requirement: Decimal,

    /// Burned from every payment
    pub transaction_cost: Decimal,

    /// Payments per contribution
    pub max_transactions_per_block: usize,
}

impl Default for LedgerParameters {
    fn default() -> Self {
        Self {
            max_message_length: 256,
            account_reassignments: HashSet::new(),
            message_update_frequency_per_hour: 60,
            frame_processing_time_ms: 2_000,
            max_connections: 10,
            transmit_redundancy: 1,
            validator_stake_requirement: Decimal::ZERO,
            transaction_cost: Decimal::ONE,
            max_transactions_per_block: 1_000,
        }
    }
}

impl LedgerParameters {
    /// Group shape for `participants` validators under these parameters
    pub fn group_shape(&self, participants: usize) -> Result<GroupShape> {
        topology::compute_group_shape(participants as u64, self.max_connections)
    }

    /// Gossip sub-steps (temp versions) per revision
    pub fn transmissions_per_revision(&self, participants: usize) -> Result<u32> {
        let shape = self.group_shape(participants)?;
        Ok((shape.depth + self.transmit_redundancy).max(1))
    }

    /// Check these parameters against the accounts they would apply to
    ///
    /// Costs and the stake requirement must not be negative. Reassigned
    /// accounts need unique keys and names, a positive amount, and no name
    /// held by an account they do not replace.
    pub fn validate(&self, accounts: &HashSet<Account>) -> Result<()> {
        if self.transaction_cost < Decimal::ZERO {
            return Err(Error::Validation(format!(
                "negative transaction cost {}",
                self.transaction_cost
            )));
        }
        if self.validator_stake_requirement < Decimal::ZERO {
            return Err(Error::Validation(format!(
                "negative validator stake requirement {}",
                self.validator_stake_requirement
            )));
        }

        let mut keys = HashSet::new();
        let mut names = HashSet::new();
        for account in &self.account_reassignments {
            if account.amount <= Decimal::ZERO {
                return Err(Error::Validation(format!(
                    "reassigned account {} has non-positive amount {}",
                    account.public_key, account.amount
                )));
            }
            if !keys.insert(account.public_key.as_str()) {
                return Err(Error::Validation(format!(
                    "account {} reassigned more than once",
                    account.public_key
                )));
            }
            if account.name.chars().count() > MAX_NAME_LENGTH {
                return Err(Error::Validation(format!(
                    "reassigned name for {} exceeds {} characters",
                    account.public_key, MAX_NAME_LENGTH
                )));
            }
            if !account.name.is_empty() && !names.insert(account.name.as_str()) {
                return Err(Error::Validation(format!("name {} reassigned more than once", account.name)));
            }
        }

        if let Some(holder) = accounts
            .iter()
            .find(|a| !a.name.is_empty() && !keys.contains(a.public_key.as_str()) && names.contains(a.name.as_str()))
        {
            return Err(Error::Validation(format!(
                "reassigned name {} is held by {}",
                holder.name, holder.public_key
            )));
        }
        Ok(())
    }
}

impl Canonical for LedgerParameters {
    fn write_canonical(&self, writer: &mut CanonicalWriter) {
        writer
            .decimal(&self.validator_stake_requirement)
            .decimal(&self.transaction_cost)
            .field(self.message_update_frequency_per_hour)
            .field(self.max_transactions_per_block)
            .field(self.max_connections)
            .field(self.frame_processing_time_ms)
            .field(self.max_message_length)
            .field(self.transmit_redundancy)
            .set(&self.account_reassignments);
    }
}

// =========================================================================
// SNAPSHOT
// =========================================================================

/// Full ledger state at one block id
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LedgerSnapshot {
    /// Block id, +1 per finalized block
    pub id: BlockId,

    /// Accounts, unique by key
    pub accounts: HashSet<Account>,

    /// Validators ordered by key, addresses assigned
    pub validators: Vec<ValidatorNode>,

    /// Parameters in force
    pub current_params: LedgerParameters,

    /// Parameters taking effect at the next block
    pub next_params: LedgerParameters,

    /// `digest(canonical_string)`
    #[serde(default)]
    pub hash: String,

    /// Hash of the snapshot this one was derived from
    #[serde(default)]
    pub hash_previous_block: String,

    /// Signature of the node that produced this copy
    #[serde(default)]
    pub signature: Option<Signature>,
}

impl LedgerSnapshot {
    /// Genesis snapshot: addresses assigned, next = current, hash computed
    pub fn genesis(
        provider: &dyn SignatureProvider,
        accounts: impl IntoIterator<Item = Account>,
        validators: Vec<ValidatorNode>,
        params: LedgerParameters,
    ) -> Result<Self> {
        let validators = topology::assign_addresses(validators, &params)?;
        let mut snapshot = Self {
            id: 0,
            accounts: accounts.into_iter().collect(),
            validators,
            next_params: params.clone(),
            current_params: params,
            hash: String::new(),
            hash_previous_block: String::new(),
            signature: None,
        };
        snapshot.compute_hash(provider);
        Ok(snapshot)
    }

    /// Recompute `hash`
    pub fn compute_hash(&mut self, provider: &dyn SignatureProvider) {
        self.hash = crypto::digest(provider, &self.canonical_string());
    }

    /// Whether `hash` matches the content
    pub fn verify_hash(&self, provider: &dyn SignatureProvider) -> bool {
        self.hash == crypto::digest(provider, &self.canonical_string())
    }

    /// Sign the canonical string as `identity`
    pub fn sign(&mut self, identity: &NodeIdentity) -> Result<()> {
        self.signature = Some(identity.signature(&self.canonical_string(), false)?);
        Ok(())
    }

    /// Account by key
    pub fn account(&self, public_key: &str) -> Option<&Account> {
        self.accounts.iter().find(|a| a.public_key == public_key)
    }

    /// Account by alias
    pub fn account_by_name(&self, name: &str) -> Option<&Account> {
        if name.is_empty() {
            return None;
        }
        self.accounts.iter().find(|a| a.name == name)
    }

    /// Alias → key map for payment resolution
    pub fn names(&self) -> HashMap<String, PublicKey> {
        self.accounts
            .iter()
            .filter(|a| !a.name.is_empty())
            .map(|a| (a.name.clone(), a.public_key.clone()))
            .collect()
    }

    /// Validator by key
    pub fn validator(&self, public_key: &str) -> Option<&ValidatorNode> {
        self.validators.iter().find(|v| v.public_key == public_key)
    }

    /// Sum of all balances
    pub fn total_value(&self) -> Decimal {
        self.accounts.iter().map(|a| a.amount).sum()
    }

    /// Stake per validator: balances summed by delegate
    pub fn delegated_stake(&self) -> HashMap<PublicKey, Decimal> {
        let mut stake: HashMap<PublicKey, Decimal> = HashMap::new();
        for account in &self.accounts {
            *stake.entry(account.delegated_validator.clone()).or_default() += account.amount;
        }
        stake
    }

    /// Group shape of the current membership
    pub fn group_shape(&self) -> Result<GroupShape> {
        self.current_params.group_shape(self.validators.len())
    }
}

impl Canonical for LedgerSnapshot {
    fn write_canonical(&self, writer: &mut CanonicalWriter) {
        writer
            .field(self.id)
            .set(&self.accounts)
            .set(&self.validators)
            .field(self.current_params.canonical_string())
            .field(self.next_params.canonical_string())
            .field(&self.hash_previous_block);
    }

    fn canonical_string(&self) -> String {
        let mut writer = CanonicalWriter::new();
        self.write_canonical(&mut writer);
        strip_whitespace(&writer.finish())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::Ed25519Provider;
    use rust_decimal_macros::dec;

    fn reassigning(accounts: &[Account]) -> LedgerParameters {
        let mut params = LedgerParameters::default();
        params.account_reassignments = accounts.iter().cloned().collect();
        params
    }

    #[test]
    fn test_parameters_validate() {
        let ledger = HashSet::from([Account::new("a", "alice", dec!(1), "a")]);
        assert!(LedgerParameters::default().validate(&ledger).is_ok());

        // replacing the holder of a name may keep it
        let own = reassigning(&[Account::new("a", "alice", dec!(9), "a"), Account::new("z", "zed", dec!(50), "z")]);
        assert!(own.validate(&ledger).is_ok());

        let mut cost = LedgerParameters::default();
        cost.transaction_cost = dec!(-1);
        assert!(matches!(cost.validate(&ledger), Err(Error::Validation(_))));

        let mut requirement = LedgerParameters::default();
        requirement.validator_stake_requirement = dec!(-0.5);
        assert!(requirement.validate(&ledger).is_err());
    }

    #[test]
    fn test_malformed_reassignments_refused() {
        let ledger = HashSet::from([Account::new("a", "alice", dec!(1), "a")]);
        let cases = [
            vec![Account::new("z", "", dec!(50), "z"), Account::new("z", "", dec!(70), "z")],
            vec![Account::new("y", "alice", dec!(5), "y")],
            vec![Account::new("x", "", dec!(-5), "x")],
            vec![Account::new("w", "", dec!(0), "w")],
            vec![Account::new("u", "twin", dec!(1), "u"), Account::new("v", "twin", dec!(1), "v")],
        ];
        for accounts in cases {
            assert!(
                reassigning(&accounts).validate(&ledger).is_err(),
                "accepted {:?}",
                accounts
            );
        }
    }

    #[test]
    fn test_account_name_truncated() {
        let long = "n".repeat(250);
        let account = Account::new("k", &long, dec!(1), "k");
        assert_eq!(account.name.chars().count(), MAX_NAME_LENGTH);
    }

    #[test]
    fn test_validator_announcement() {
        let identity = NodeIdentity::generate_ed25519();
        let node = ValidatorNode::announce(&identity, "http://10.0.0.1:8080").unwrap();
        assert!(node.validate(&Ed25519Provider));

        let mut forged = node.clone();
        forged.connection_string = "http://10.0.0.2:8080".to_string();
        assert!(!forged.validate(&Ed25519Provider));
    }

    #[test]
    fn test_connection_string_needs_ipv4() {
        assert!(is_valid_connection_string("http://192.168.1.10:8080/"));
        assert!(is_valid_connection_string("10.0.0.1"));
        assert!(!is_valid_connection_string("http://localhost:8080"));
        assert!(!is_valid_connection_string(""));
        assert_eq!(connection_ip("http://10.1.2.3:80"), Some(Ipv4Addr::new(10, 1, 2, 3)));
    }

    #[test]
    fn test_payment_signatures() {
        let payer = NodeIdentity::generate_ed25519();
        let validator = NodeIdentity::generate_ed25519();
        let provider = Ed25519Provider;

        let mut payment = Payment::signed(&payer, "receiver", "rent", dec!(10), 2).unwrap();
        assert!(payment.check_payer_signature(&provider).is_ok());

        payment.countersign(&validator, "prev").unwrap();
        assert!(payment.check_countersignature(&provider, validator.public_key(), "prev").is_ok());
        assert!(matches!(
            payment.check_countersignature(&provider, validator.public_key(), "other"),
            Err(Error::Replay(_))
        ));
        assert!(matches!(
            payment.check_countersignature(&provider, payer.public_key(), "prev"),
            Err(Error::Validation(_))
        ));

        payment.amount = dec!(11);
        assert!(payment.check_payer_signature(&provider).is_err());
    }

    #[test]
    fn test_payment_alias_resolution() {
        let payer = NodeIdentity::generate_ed25519();
        let mut payment = Payment::signed(&payer, "bob", "", dec!(5), 1).unwrap();
        let names = HashMap::from([("bob".to_string(), "bobkey".to_string())]);
        payment.resolve_keys(&names);

        assert_eq!(payment.public_key_to, "bobkey");
        assert_eq!(&payment.public_key_from, payer.public_key());
        assert!(payment.check_payer_signature(&Ed25519Provider).is_ok());
    }

    #[test]
    fn test_attribute_update_binding() {
        let owner = NodeIdentity::generate_ed25519();
        let provider = Ed25519Provider;
        let update =
            AccountAttributesUpdate::signed(&owner, Some("alice"), None, Some("v1"), 4, "h3").unwrap();

        assert!(update.check(&provider, 4, "h3").is_ok());
        assert!(matches!(update.check(&provider, 5, "h3"), Err(Error::Replay(_))));
        assert!(matches!(update.check(&provider, 4, "h2"), Err(Error::Replay(_))));

        let mut tampered = update.clone();
        tampered.delegated = Some("v2".to_string());
        assert!(matches!(tampered.check(&provider, 4, "h3"), Err(Error::Validation(_))));
    }

    #[test]
    fn test_snapshot_hash_ignores_account_order() {
        let provider = Ed25519Provider;
        let accounts = vec![
            Account::new("a", "", dec!(1), "a"),
            Account::new("b", "", dec!(2), "b"),
            Account::new("c", "", dec!(3), "c"),
        ];
        let mut reversed = accounts.clone();
        reversed.reverse();

        let s1 = LedgerSnapshot::genesis(&provider, accounts, vec![], LedgerParameters::default()).unwrap();
        let s2 = LedgerSnapshot::genesis(&provider, reversed, vec![], LedgerParameters::default()).unwrap();
        assert_eq!(s1.hash, s2.hash);
        assert!(s1.verify_hash(&provider));
    }

    #[test]
    fn test_delegated_stake() {
        let provider = Ed25519Provider;
        let accounts = vec![
            Account::new("a", "", dec!(10), "v1"),
            Account::new("b", "", dec!(5), "v1"),
            Account::new("c", "", dec!(7), "v2"),
        ];
        let snapshot = LedgerSnapshot::genesis(&provider, accounts, vec![], LedgerParameters::default()).unwrap();
        let stake = snapshot.delegated_stake();

        assert_eq!(stake["v1"], dec!(15));
        assert_eq!(stake["v2"], dec!(7));
        assert_eq!(snapshot.total_value(), dec!(22));
    }

    #[test]
    fn test_transmissions_per_revision() {
        let params = LedgerParameters::default();
        // 3 validators with degree bound 10 form one flat group
        assert_eq!(params.transmissions_per_revision(3).unwrap(), 2);
        let mut none = params.clone();
        none.transmit_redundancy = 0;
        assert_eq!(none.transmissions_per_revision(0).unwrap(), 1);
    }
}
