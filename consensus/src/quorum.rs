//! Quorum engine
//!
//! Evaluates a fully gossiped envelope against the snapshot it builds on:
//!
//! 1. Ban validators that sent conflicting or invalid contributions, or that
//!    signed two different finality digests for the previous revision
//! 2. Tally the previous revision's finality signatures by delegated stake
//! 3. Declare finality when the finality gate is open and the winning digest
//!    carries strictly more than half of all account value
//!
//! A validator's stake is the sum of the balances delegated to it.

use ledger_core::canonical::Canonical;
use ledger_core::crypto::{self, SignatureProvider};
use ledger_core::types::{BlockId, MESSAGE_TRANSMISSIONS_PER_BLOCK};
use ledger_core::{
    Error as LedgerError, LedgerParameters, LedgerSnapshot, PublicKey, Result as LedgerResult, Signature,
    SignedValidatorMessage, TransportEnvelope, ValidatorMessage,
};
use rust_decimal::Decimal;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use tracing::{debug, warn};

/// `ID{block}R{revision}:{snapshot hash}:`, the prefix of a finality digest
pub fn finality_prefix(block_id: BlockId, revision: u32, snapshot_hash: &str) -> String {
    format!("ID{}R{}:{}:", block_id, revision, snapshot_hash)
}

/// Finality is attempted on odd revisions once enough revisions have passed
pub fn finality_gate_open(revision: u32) -> bool {
    revision >= MESSAGE_TRANSMISSIONS_PER_BLOCK && revision % 2 == 1
}

/// Content check of a contribution proposed by `proposer` on top of `snapshot`
pub fn check_contribution(
    provider: &dyn SignatureProvider,
    contribution: &SignedValidatorMessage,
    proposer: &str,
    snapshot: &LedgerSnapshot,
) -> LedgerResult<()> {
    let contract = &contribution.contract;
    let params = &snapshot.current_params;
    let expected_block = snapshot.id + 1;

    if contract.id != expected_block {
        return Err(LedgerError::Replay(format!(
            "contribution targets block {}, expected {}",
            contract.id, expected_block
        )));
    }
    if contract.payments.len() > params.max_transactions_per_block {
        return Err(LedgerError::Validation(format!(
            "{} payments exceed the limit of {}",
            contract.payments.len(),
            params.max_transactions_per_block
        )));
    }
    if let Some(node) = contract.validator_nodes.iter().find(|n| !n.validate(provider)) {
        return Err(LedgerError::Validation(format!(
            "validator announcement for {} is not self-signed",
            node.public_key
        )));
    }
    for payment in &contract.payments {
        if payment.block_id != expected_block {
            return Err(LedgerError::Replay(format!(
                "payment from {} targets block {}, expected {}",
                payment.from, payment.block_id, expected_block
            )));
        }
        if params.max_message_length > 0 && payment.comment.chars().count() > params.max_message_length {
            return Err(LedgerError::Validation(format!(
                "payment comment from {} exceeds {} characters",
                payment.from, params.max_message_length
            )));
        }
        payment.check_payer_signature(provider)?;
        payment.check_countersignature(provider, proposer, &snapshot.hash_previous_block)?;
    }
    for update in &contract.attribute_updates {
        update.check(provider, snapshot.id, &snapshot.hash_previous_block)?;
    }
    contract.voted_parameters.validate(&snapshot.accounts)
}

/// Boolean form of [`check_contribution`]
pub fn is_valid(
    provider: &dyn SignatureProvider,
    contribution: &SignedValidatorMessage,
    proposer: &str,
    snapshot: &LedgerSnapshot,
) -> bool {
    check_contribution(provider, contribution, proposer, snapshot).is_ok()
}

/// Result of evaluating one revision
#[derive(Debug, Clone)]
pub struct RevisionOutcome {
    /// Block under decision
    pub block_id: BlockId,

    /// Evaluated revision
    pub revision: u32,

    /// Hash of the snapshot the round builds on
    pub snapshot_hash: String,

    /// Validators excluded from this round
    pub banned: BTreeSet<PublicKey>,

    /// Whether the block is final
    pub valid: bool,

    /// Signers of the winning digest
    pub valid_validators: BTreeSet<PublicKey>,

    /// Digest with most stake, if any signature counted
    pub winning_digest: Option<String>,

    /// Stake behind the winning digest
    pub winning_stake: Decimal,

    /// Sum of all balances in the snapshot
    pub total_value: Decimal,

    /// Stake per validator
    pub delegated_stake: HashMap<PublicKey, Decimal>,

    /// Contributions of the winning validators
    winning_contributions: Vec<SignedValidatorMessage>,

    /// Parameters carried when no vote wins
    fallback_parameters: LedgerParameters,
}

impl RevisionOutcome {
    /// Union of the winning validators' contributions
    pub fn resulting_message(&self) -> ValidatorMessage {
        let mut message = ValidatorMessage::empty(self.block_id, self.fallback_parameters.clone());
        for contribution in &self.winning_contributions {
            message.merge(&contribution.contract);
        }
        message
    }

    /// Parameters backed by more than half of all delegated stake
    pub fn resulting_parameters(&self) -> Option<LedgerParameters> {
        let total: Decimal = self.delegated_stake.values().copied().sum();
        let mut votes: BTreeMap<String, (Decimal, &LedgerParameters)> = BTreeMap::new();
        for contribution in &self.winning_contributions {
            let stake = self
                .delegated_stake
                .get(contribution.originator())
                .copied()
                .unwrap_or_default();
            let params = &contribution.contract.voted_parameters;
            votes
                .entry(params.canonical_string())
                .or_insert((Decimal::ZERO, params))
                .0 += stake;
        }

        let (_, (stake, params)) = pick_max(votes.into_iter(), |(stake, _)| *stake)?;
        if stake > total / Decimal::TWO {
            Some(params.clone())
        } else {
            None
        }
    }

    /// The string each validator signs to vote for this outcome
    pub fn digest_string(&self, provider: &dyn SignatureProvider) -> String {
        let banned: Vec<&str> = self.banned.iter().map(String::as_str).collect();
        let body = format!("{}:{}", banned.join("|"), self.resulting_message().canonical_string());
        format!(
            "{}{}",
            finality_prefix(self.block_id, self.revision, &self.snapshot_hash),
            crypto::digest(provider, &body)
        )
    }
}

/// Highest-valued entry; ties go to the smallest key
fn pick_max<K: Ord, V>(entries: impl Iterator<Item = (K, V)>, value: impl Fn(&V) -> Decimal) -> Option<(K, V)> {
    let mut best: Option<(K, V)> = None;
    for (key, entry) in entries {
        let better = match &best {
            None => true,
            Some((best_key, best_entry)) => {
                let (v, b) = (value(&entry), value(best_entry));
                v > b || (v == b && key < *best_key)
            }
        };
        if better {
            best = Some((key, entry));
        }
    }
    best
}

/// Evaluate `envelope` against the snapshot it builds on
pub fn process_revision(
    provider: &dyn SignatureProvider,
    envelope: &TransportEnvelope,
    snapshot: &LedgerSnapshot,
) -> RevisionOutcome {
    let mut banned: BTreeSet<PublicKey> = BTreeSet::new();

    // Contributions with a bad originator signature prove nothing about
    // their claimed originator and are ignored
    let signed: Vec<&SignedValidatorMessage> = envelope
        .contributions
        .iter()
        .filter(|c| c.validate_signature(provider))
        .collect();

    let mut by_originator: HashMap<&str, HashSet<String>> = HashMap::new();
    for contribution in &signed {
        by_originator
            .entry(contribution.originator())
            .or_default()
            .insert(contribution.contract.canonical_string());
    }
    for (originator, contracts) in &by_originator {
        if contracts.len() > 1 {
            warn!(public_key = %originator, count = contracts.len(), "Conflicting contributions, banning");
            banned.insert(originator.to_string());
        }
    }

    for contribution in &signed {
        if let Err(e) = check_contribution(provider, contribution, contribution.originator(), snapshot) {
            warn!(
                public_key = %contribution.originator(),
                block_id = envelope.block_id,
                error = %e,
                "Invalid contribution, banning"
            );
            banned.insert(contribution.originator().to_string());
        }
    }

    let previous_revision = envelope.block_revision.saturating_sub(1);
    let prefix = finality_prefix(envelope.block_id, previous_revision, &snapshot.hash);
    let votes: Vec<&Signature> = envelope
        .finality_signatures
        .iter()
        .filter(|s| s.message_value.starts_with(&prefix) && s.validate(provider))
        .collect();

    let mut digests_by_signer: HashMap<&str, HashSet<&str>> = HashMap::new();
    for vote in &votes {
        digests_by_signer
            .entry(vote.public_key.as_str())
            .or_default()
            .insert(vote.message_value.as_str());
    }
    for (signer, digests) in &digests_by_signer {
        if digests.len() > 1 {
            warn!(public_key = %signer, count = digests.len(), "Signed conflicting finality digests, banning");
            banned.insert(signer.to_string());
        }
    }

    let delegated_stake = snapshot.delegated_stake();
    let total_value = snapshot.total_value();

    let mut tally: BTreeMap<&str, (Decimal, BTreeSet<PublicKey>)> = BTreeMap::new();
    for (signer, digests) in &digests_by_signer {
        if banned.contains(*signer) {
            continue;
        }
        let stake = delegated_stake.get(*signer).copied().unwrap_or_default();
        for digest in digests {
            let entry = tally.entry(*digest).or_insert((Decimal::ZERO, BTreeSet::new()));
            entry.0 += stake;
            entry.1.insert(signer.to_string());
        }
    }

    let (winning_digest, winning_stake, valid_validators) =
        match pick_max(tally.into_iter(), |(stake, _)| *stake) {
            Some((digest, (stake, signers))) => (Some(digest.to_string()), stake, signers),
            None => (None, Decimal::ZERO, BTreeSet::new()),
        };

    let valid = finality_gate_open(envelope.block_revision) && winning_stake > total_value / Decimal::TWO;

    let winning_contributions: Vec<SignedValidatorMessage> = signed
        .iter()
        .filter(|c| valid_validators.contains(c.originator()))
        .map(|c| (*c).clone())
        .collect();

    debug!(
        block_id = envelope.block_id,
        revision = envelope.block_revision,
        banned = banned.len(),
        winning_stake = %winning_stake,
        total_value = %total_value,
        valid,
        "Evaluated revision"
    );

    RevisionOutcome {
        block_id: envelope.block_id,
        revision: envelope.block_revision,
        snapshot_hash: snapshot.hash.clone(),
        banned,
        valid,
        valid_validators,
        winning_digest,
        winning_stake,
        total_value,
        delegated_stake,
        winning_contributions,
        fallback_parameters: snapshot.next_params.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ledger_core::{Account, Ed25519Provider, NodeIdentity, Payment, ValidatorNode};
    use rust_decimal_macros::dec;

    struct Fixture {
        ids: Vec<NodeIdentity>,
        snapshot: LedgerSnapshot,
    }

    fn fixture(stakes: &[Decimal]) -> Fixture {
        let ids: Vec<NodeIdentity> = (0..stakes.len())
            .map(|i| NodeIdentity::ed25519_from_seed([i as u8 + 1; 32]))
            .collect();
        let accounts = ids
            .iter()
            .zip(stakes)
            .map(|(i, s)| Account::new(i.public_key().clone(), "", *s, i.public_key().clone()));
        let nodes = ids
            .iter()
            .enumerate()
            .map(|(n, i)| ValidatorNode::announce(i, format!("http://10.0.0.{}:80", n + 1)).unwrap())
            .collect();
        let snapshot =
            LedgerSnapshot::genesis(&Ed25519Provider, accounts, nodes, LedgerParameters::default()).unwrap();
        Fixture { ids, snapshot }
    }

    fn envelope_with_votes(f: &Fixture, revision: u32, votes: &[(usize, &str)]) -> TransportEnvelope {
        let mut envelope = TransportEnvelope::new(f.snapshot.id + 1, revision);
        let prefix = finality_prefix(f.snapshot.id + 1, revision - 1, &f.snapshot.hash);
        for (signer, suffix) in votes {
            let vote = f.ids[*signer].signature(&format!("{}{}", prefix, suffix), true).unwrap();
            envelope.finality_signatures.insert(vote);
        }
        envelope
    }

    fn contribution(f: &Fixture, signer: usize) -> SignedValidatorMessage {
        let pending = ValidatorMessage::empty(f.snapshot.id + 1, LedgerParameters::default());
        SignedValidatorMessage::create(&pending, &f.ids[signer], &f.snapshot).unwrap()
    }

    #[test]
    fn test_gate() {
        assert!(!finality_gate_open(1));
        assert!(!finality_gate_open(2));
        assert!(finality_gate_open(3));
        assert!(!finality_gate_open(4));
        assert!(finality_gate_open(5));
    }

    #[test]
    fn test_unanimous_vote_finalizes_after_gate() {
        let f = fixture(&[dec!(100), dec!(100), dec!(100)]);
        let votes = [(0, "d"), (1, "d"), (2, "d")];

        let early = process_revision(&Ed25519Provider, &envelope_with_votes(&f, 2, &votes), &f.snapshot);
        assert!(!early.valid);
        assert_eq!(early.valid_validators.len(), 3);

        let outcome = process_revision(&Ed25519Provider, &envelope_with_votes(&f, 3, &votes), &f.snapshot);
        assert!(outcome.valid);
        assert_eq!(outcome.winning_stake, dec!(300));
        assert!(outcome.banned.is_empty());
    }

    #[test]
    fn test_exact_half_does_not_finalize() {
        let f = fixture(&[dec!(50), dec!(50)]);
        let outcome = process_revision(&Ed25519Provider, &envelope_with_votes(&f, 3, &[(0, "d")]), &f.snapshot);
        assert!(!outcome.valid);
        assert_eq!(outcome.winning_stake, dec!(50));

        let f = fixture(&[dec!(50.01), dec!(49.99)]);
        let outcome = process_revision(&Ed25519Provider, &envelope_with_votes(&f, 3, &[(0, "d")]), &f.snapshot);
        assert!(outcome.valid);
    }

    #[test]
    fn test_double_vote_banned_and_weightless() {
        let f = fixture(&[dec!(60), dec!(40)]);
        let envelope = envelope_with_votes(&f, 3, &[(0, "d1"), (0, "d2"), (1, "d1")]);
        let outcome = process_revision(&Ed25519Provider, &envelope, &f.snapshot);

        assert!(outcome.banned.contains(f.ids[0].public_key()));
        assert_eq!(outcome.winning_stake, dec!(40));
        assert!(!outcome.valid);
        assert!(!outcome.valid_validators.contains(f.ids[0].public_key()));
    }

    #[test]
    fn test_wrong_prefix_ignored() {
        let f = fixture(&[dec!(100)]);
        let mut envelope = TransportEnvelope::new(1, 3);
        let stale = finality_prefix(1, 1, &f.snapshot.hash);
        envelope
            .finality_signatures
            .insert(f.ids[0].signature(&format!("{}x", stale), true).unwrap());

        let outcome = process_revision(&Ed25519Provider, &envelope, &f.snapshot);
        assert!(outcome.winning_digest.is_none());
        assert!(!outcome.valid);
    }

    #[test]
    fn test_tie_goes_to_smallest_digest() {
        let f = fixture(&[dec!(10), dec!(10)]);
        let envelope = envelope_with_votes(&f, 3, &[(0, "bbb"), (1, "aaa")]);
        let outcome = process_revision(&Ed25519Provider, &envelope, &f.snapshot);

        assert!(outcome.winning_digest.unwrap().ends_with("aaa"));
        assert_eq!(outcome.valid_validators.len(), 1);
        assert!(outcome.valid_validators.contains(f.ids[1].public_key()));
    }

    #[test]
    fn test_conflicting_contributions_banned() {
        let f = fixture(&[dec!(100), dec!(100)]);
        let mut envelope = TransportEnvelope::new(1, 1);
        envelope.contributions.push(contribution(&f, 0));

        let mut other = ValidatorMessage::empty(1, LedgerParameters::default());
        other.voted_parameters.transaction_cost = dec!(5);
        envelope
            .contributions
            .push(SignedValidatorMessage::create(&other, &f.ids[0], &f.snapshot).unwrap());
        envelope.contributions.push(contribution(&f, 1));

        let outcome = process_revision(&Ed25519Provider, &envelope, &f.snapshot);
        assert_eq!(outcome.banned.len(), 1);
        assert!(outcome.banned.contains(f.ids[0].public_key()));
    }

    #[test]
    fn test_invalid_payment_bans_proposer() {
        let f = fixture(&[dec!(100), dec!(100)]);
        let mut pending = ValidatorMessage::empty(1, LedgerParameters::default());
        // targets the wrong block
        pending
            .payments
            .insert(Payment::signed(&f.ids[1], f.ids[0].public_key().clone(), "", dec!(5), 7).unwrap());
        let bad = SignedValidatorMessage::create(&pending, &f.ids[0], &f.snapshot).unwrap();

        assert!(matches!(
            check_contribution(&Ed25519Provider, &bad, f.ids[0].public_key(), &f.snapshot),
            Err(LedgerError::Replay(_))
        ));

        let mut envelope = TransportEnvelope::new(1, 1);
        envelope.contributions.push(bad);
        let outcome = process_revision(&Ed25519Provider, &envelope, &f.snapshot);
        assert!(outcome.banned.contains(f.ids[0].public_key()));
    }

    #[test]
    fn test_malformed_parameter_vote_bans_proposer() {
        let f = fixture(&[dec!(100), dec!(100)]);
        let mut voted = LedgerParameters::default();
        voted.account_reassignments.insert(Account::new("z", "", dec!(50), "z"));
        voted.account_reassignments.insert(Account::new("z", "", dec!(70), "z"));
        let pending = ValidatorMessage::empty(1, voted);
        let bad = SignedValidatorMessage::create(&pending, &f.ids[0], &f.snapshot).unwrap();

        assert!(matches!(
            check_contribution(&Ed25519Provider, &bad, f.ids[0].public_key(), &f.snapshot),
            Err(LedgerError::Validation(_))
        ));

        let mut cheap = LedgerParameters::default();
        cheap.transaction_cost = dec!(-1);
        let pending = ValidatorMessage::empty(1, cheap);
        let negative = SignedValidatorMessage::create(&pending, &f.ids[1], &f.snapshot).unwrap();
        assert!(!is_valid(&Ed25519Provider, &negative, f.ids[1].public_key(), &f.snapshot));

        let mut envelope = TransportEnvelope::new(1, 1);
        envelope.contributions.push(bad);
        envelope.contributions.push(contribution(&f, 1));
        let outcome = process_revision(&Ed25519Provider, &envelope, &f.snapshot);
        assert!(outcome.banned.contains(f.ids[0].public_key()));
        assert!(!outcome.banned.contains(f.ids[1].public_key()));
    }

    #[test]
    fn test_contribution_limits() {
        let f = fixture(&[dec!(100)]);
        let mut snapshot = f.snapshot.clone();
        snapshot.current_params.max_message_length = 3;

        let mut pending = ValidatorMessage::empty(1, LedgerParameters::default());
        pending
            .payments
            .insert(Payment::signed(&f.ids[0], "x", "too long", dec!(5), 1).unwrap());
        let signed = SignedValidatorMessage::create(&pending, &f.ids[0], &snapshot).unwrap();
        assert!(!is_valid(&Ed25519Provider, &signed, f.ids[0].public_key(), &snapshot));

        snapshot.current_params.max_message_length = 0;
        assert!(is_valid(&Ed25519Provider, &signed, f.ids[0].public_key(), &snapshot));

        snapshot.current_params.max_transactions_per_block = 0;
        assert!(!is_valid(&Ed25519Provider, &signed, f.ids[0].public_key(), &snapshot));
    }

    #[test]
    fn test_resulting_message_and_parameters() {
        let f = fixture(&[dec!(60), dec!(40)]);
        let mut voted = LedgerParameters::default();
        voted.transaction_cost = dec!(2);

        let mut envelope = envelope_with_votes(&f, 3, &[(0, "d"), (1, "d")]);
        let mut pending = ValidatorMessage::empty(1, voted.clone());
        pending
            .validator_nodes
            .insert(ValidatorNode::announce(&NodeIdentity::generate_ed25519(), "http://10.9.9.9:80").unwrap());
        envelope
            .contributions
            .push(SignedValidatorMessage::create(&pending, &f.ids[0], &f.snapshot).unwrap());
        envelope.contributions.push(contribution(&f, 1));

        let outcome = process_revision(&Ed25519Provider, &envelope, &f.snapshot);
        assert!(outcome.valid);
        assert_eq!(outcome.resulting_message().validator_nodes.len(), 1);
        // 60 of 100 voted for the new cost
        assert_eq!(outcome.resulting_parameters(), Some(voted));

        let digest = outcome.digest_string(&Ed25519Provider);
        assert!(digest.starts_with(&finality_prefix(1, 3, &f.snapshot.hash)));
    }
}
