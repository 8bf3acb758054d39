//! Round messages exchanged between validators
//!
//! - [`ValidatorMessage`]: one validator's proposal for a block
//! - [`SignedValidatorMessage`]: a proposal with its originator signature and
//!   the countersignatures of every validator that relayed it
//! - [`TransportEnvelope`]: the per-frame wire unit a validator publishes

use crate::canonical::{canonical_set, Canonical, CanonicalWriter};
use crate::crypto::{self, NodeIdentity, SignatureProvider};
use crate::types::{
    AccountAttributesUpdate, BlockId, LedgerParameters, LedgerSnapshot, Payment, Signature, ValidatorNode,
};
use crate::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// One validator's proposal for block `id`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidatorMessage {
    /// Block this proposal targets
    pub id: BlockId,

    /// Validator announcements
    #[serde(default)]
    pub validator_nodes: HashSet<ValidatorNode>,

    /// Proposed payments
    #[serde(default)]
    pub payments: HashSet<Payment>,

    /// Alias, description and delegation changes
    #[serde(default)]
    pub attribute_updates: HashSet<AccountAttributesUpdate>,

    /// Parameters this validator votes for
    pub voted_parameters: LedgerParameters,
}

impl ValidatorMessage {
    /// Empty proposal for block `id`
    pub fn empty(id: BlockId, voted_parameters: LedgerParameters) -> Self {
        Self {
            id,
            validator_nodes: HashSet::new(),
            payments: HashSet::new(),
            attribute_updates: HashSet::new(),
            voted_parameters,
        }
    }

    /// Union the payments, announcements and updates of `other` into this one
    pub fn merge(&mut self, other: &ValidatorMessage) {
        self.validator_nodes.extend(other.validator_nodes.iter().cloned());
        self.payments.extend(other.payments.iter().cloned());
        self.attribute_updates.extend(other.attribute_updates.iter().cloned());
    }

    /// Nothing but the parameter vote
    pub fn is_empty(&self) -> bool {
        self.validator_nodes.is_empty() && self.payments.is_empty() && self.attribute_updates.is_empty()
    }
}

impl Canonical for ValidatorMessage {
    fn write_canonical(&self, writer: &mut CanonicalWriter) {
        writer
            .field(self.id)
            .set(&self.validator_nodes)
            .set(&self.payments)
            .set(&self.attribute_updates)
            .field(self.voted_parameters.canonical_string());
    }
}

/// A proposal signed by its originator and countersigned by relayers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignedValidatorMessage {
    /// The proposal
    pub contract: ValidatorMessage,

    /// Originator signature over the proposal's canonical string
    pub original_signature: Signature,

    /// Signatures of every validator that relayed the proposal
    #[serde(default)]
    pub countersignatures: HashSet<Signature>,
}

impl SignedValidatorMessage {
    /// Seal a pending proposal against `snapshot`
    ///
    /// Payment aliases are resolved against the snapshot accounts and every
    /// payment is countersigned, binding it to `snapshot.hash_previous_block`.
    pub fn create(pending: &ValidatorMessage, identity: &NodeIdentity, snapshot: &LedgerSnapshot) -> Result<Self> {
        let names = snapshot.names();
        let mut contract = ValidatorMessage::empty(pending.id, pending.voted_parameters.clone());
        contract.validator_nodes = pending.validator_nodes.clone();
        contract.attribute_updates = pending.attribute_updates.clone();
        for payment in &pending.payments {
            let mut payment = payment.clone();
            payment.resolve_keys(&names);
            payment.countersign(identity, &snapshot.hash_previous_block)?;
            contract.payments.insert(payment);
        }

        let original_signature = identity.signature(&contract.canonical_string(), false)?;
        let countersignatures = HashSet::from([original_signature.clone()]);
        Ok(Self {
            contract,
            original_signature,
            countersignatures,
        })
    }

    /// Public key of the originator
    pub fn originator(&self) -> &str {
        &self.original_signature.public_key
    }

    /// Originator signature matches the proposal
    pub fn validate_signature(&self, provider: &dyn SignatureProvider) -> bool {
        self.original_signature
            .validate_message(provider, &self.contract.canonical_string())
    }

    /// Add this node's relay signature
    pub fn countersign(&mut self, identity: &NodeIdentity) -> Result<()> {
        let signature = identity.signature(&self.contract.canonical_string(), false)?;
        self.countersignatures.insert(signature);
        Ok(())
    }

    /// Adopt the valid relay signatures carried by another copy
    pub fn absorb_countersignatures(&mut self, other: &SignedValidatorMessage, provider: &dyn SignatureProvider) {
        let message = self.contract.canonical_string();
        self.countersignatures.extend(
            other
                .countersignatures
                .iter()
                .filter(|s| s.validate_message(provider, &message))
                .cloned(),
        );
    }
}

impl Canonical for SignedValidatorMessage {
    fn write_canonical(&self, writer: &mut CanonicalWriter) {
        writer
            .field(self.original_signature.canonical_string())
            .set(&self.countersignatures)
            .field(self.contract.canonical_string());
    }
}

/// Wire envelope published once per frame
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransportEnvelope {
    /// Block under decision
    pub block_id: BlockId,

    /// Finality attempt within the block
    pub block_revision: u32,

    /// Gossip sub-step within the revision
    pub block_temp_version: u32,

    /// Contributions gathered so far, unique by originator signature
    #[serde(default)]
    pub contributions: Vec<SignedValidatorMessage>,

    /// Finality signatures from the previous revision
    #[serde(default)]
    pub finality_signatures: HashSet<Signature>,

    /// Publisher signature over [`TransportEnvelope::signing_string`]
    #[serde(default)]
    pub signature: Option<Signature>,

    /// When the publisher signed it
    #[serde(default)]
    pub sent_at: Option<DateTime<Utc>>,

    /// When this node fetched it
    #[serde(default)]
    pub received_at: Option<DateTime<Utc>>,
}

impl TransportEnvelope {
    /// Empty envelope for `(block_id, revision)` at temp version 1
    pub fn new(block_id: BlockId, block_revision: u32) -> Self {
        Self {
            block_id,
            block_revision,
            block_temp_version: 1,
            contributions: Vec::new(),
            finality_signatures: HashSet::new(),
            signature: None,
            sent_at: None,
            received_at: None,
        }
    }

    /// `ID{block}R{revision}V{temp}`
    pub fn round_id(&self) -> String {
        format!("ID{}R{}V{}", self.block_id, self.block_revision, self.block_temp_version)
    }

    /// Same block, revision and temp version
    pub fn same_round(&self, other: &TransportEnvelope) -> bool {
        self.block_id == other.block_id
            && self.block_revision == other.block_revision
            && self.block_temp_version == other.block_temp_version
    }

    /// String covered by the publisher signature
    pub fn signing_string(&self, provider: &dyn SignatureProvider) -> String {
        let mut writer = CanonicalWriter::new();
        writer
            .field(self.round_id())
            .field(crypto::digest(provider, &canonical_set(&self.contributions)))
            .field(crypto::digest(provider, &canonical_set(&self.finality_signatures)));
        writer.finish()
    }

    /// Sign as publisher and stamp the send time
    pub fn sign(&mut self, identity: &NodeIdentity) -> Result<()> {
        let message = self.signing_string(identity.provider().as_ref());
        self.signature = Some(identity.signature(&message, false)?);
        self.sent_at = Some(Utc::now());
        Ok(())
    }

    /// Publisher signature present and valid
    pub fn verify_signature(&self, provider: &dyn SignatureProvider) -> bool {
        match &self.signature {
            Some(signature) => signature.validate_message(provider, &self.signing_string(provider)),
            None => false,
        }
    }

    /// Publisher key, if signed
    pub fn publisher(&self) -> Option<&str> {
        self.signature.as_ref().map(|s| s.public_key.as_str())
    }

    /// Contribution with the given originator signature
    pub fn contribution_mut(&mut self, original: &Signature) -> Option<&mut SignedValidatorMessage> {
        self.contributions
            .iter_mut()
            .find(|c| &c.original_signature == original)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::Ed25519Provider;
    use crate::types::Account;
    use rust_decimal_macros::dec;

    fn snapshot_for(identities: &[&NodeIdentity]) -> LedgerSnapshot {
        let accounts = identities
            .iter()
            .map(|i| Account::new(i.public_key().clone(), "", dec!(100), i.public_key().clone()));
        LedgerSnapshot::genesis(&Ed25519Provider, accounts, vec![], LedgerParameters::default()).unwrap()
    }

    #[test]
    fn test_create_countersigns_payments() {
        let validator = NodeIdentity::generate_ed25519();
        let payer = NodeIdentity::generate_ed25519();
        let mut snapshot = snapshot_for(&[&validator, &payer]);
        snapshot.hash_previous_block = "prev".to_string();

        let mut pending = ValidatorMessage::empty(1, LedgerParameters::default());
        pending
            .payments
            .insert(Payment::signed(&payer, validator.public_key().clone(), "", dec!(5), 1).unwrap());

        let signed = SignedValidatorMessage::create(&pending, &validator, &snapshot).unwrap();
        let provider = Ed25519Provider;
        assert!(signed.validate_signature(&provider));
        assert_eq!(signed.originator(), validator.public_key());
        assert_eq!(signed.countersignatures.len(), 1);

        let payment = signed.contract.payments.iter().next().unwrap();
        assert!(payment
            .check_countersignature(&provider, validator.public_key(), "prev")
            .is_ok());
    }

    #[test]
    fn test_tampered_contract_fails() {
        let validator = NodeIdentity::generate_ed25519();
        let snapshot = snapshot_for(&[&validator]);
        let pending = ValidatorMessage::empty(1, LedgerParameters::default());
        let mut signed = SignedValidatorMessage::create(&pending, &validator, &snapshot).unwrap();

        signed.contract.voted_parameters.transaction_cost = dec!(0);
        assert!(!signed.validate_signature(&Ed25519Provider));
    }

    #[test]
    fn test_absorb_only_valid_countersignatures() {
        let a = NodeIdentity::generate_ed25519();
        let b = NodeIdentity::generate_ed25519();
        let snapshot = snapshot_for(&[&a, &b]);
        let pending = ValidatorMessage::empty(1, LedgerParameters::default());

        let mut mine = SignedValidatorMessage::create(&pending, &a, &snapshot).unwrap();
        let mut theirs = mine.clone();
        theirs.countersign(&b).unwrap();
        theirs.countersignatures.insert(Signature {
            public_key: b.public_key().clone(),
            message_value: String::new(),
            signature_value: "00".repeat(64),
        });

        mine.absorb_countersignatures(&theirs, &Ed25519Provider);
        assert_eq!(mine.countersignatures.len(), 2);
    }

    #[test]
    fn test_envelope_signature() {
        let identity = NodeIdentity::generate_ed25519();
        let mut envelope = TransportEnvelope::new(4, 3);
        envelope.block_temp_version = 2;
        assert_eq!(envelope.round_id(), "ID4R3V2");

        envelope.sign(&identity).unwrap();
        assert!(envelope.verify_signature(&Ed25519Provider));
        assert_eq!(envelope.publisher(), Some(identity.public_key().as_str()));

        envelope.block_temp_version = 3;
        assert!(!envelope.verify_signature(&Ed25519Provider));
    }

    #[test]
    fn test_merge_unions_sets() {
        let mut first = ValidatorMessage::empty(1, LedgerParameters::default());
        let mut second = ValidatorMessage::empty(1, LedgerParameters::default());
        let a = NodeIdentity::generate_ed25519();
        let b = NodeIdentity::generate_ed25519();
        first.validator_nodes.insert(ValidatorNode::announce(&a, "http://10.0.0.1:80").unwrap());
        second.validator_nodes.insert(ValidatorNode::announce(&b, "http://10.0.0.2:80").unwrap());

        first.merge(&second);
        assert_eq!(first.validator_nodes.len(), 2);
        assert!(!first.is_empty());
    }
}
