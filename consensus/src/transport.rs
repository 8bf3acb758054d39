//! Envelope construction and merge rules
//!
//! A working envelope only absorbs envelopes from the exact same
//! `(block, revision, temp version)` that were signed by one of its peers.

use crate::quorum::finality_prefix;
use crate::{Error, Result};
use ledger_core::{LedgerSnapshot, NodeIdentity, Signature, SignedValidatorMessage, TransportEnvelope};
use std::collections::HashSet;
use tracing::debug;

/// What a merge added to the working envelope
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MergeReport {
    /// Contributions seen for the first time
    pub contributions_added: usize,

    /// Finality signatures seen for the first time
    pub signatures_added: usize,
}

/// Fresh envelope for `(block_id, revision)` at temp version 1
pub fn create_envelope(
    block_id: u64,
    revision: u32,
    contributions: Vec<SignedValidatorMessage>,
    finality_signatures: HashSet<Signature>,
) -> TransportEnvelope {
    let mut envelope = TransportEnvelope::new(block_id, revision);
    envelope.contributions = contributions;
    envelope.finality_signatures = finality_signatures;
    envelope
}

/// Merge `incoming` into `working`
///
/// `peers` holds the keys allowed to publish to this node and `snapshot` is
/// the snapshot the round builds on. Contributions are countersigned by
/// `identity` on first sight.
pub fn merge(
    working: &mut TransportEnvelope,
    incoming: &TransportEnvelope,
    peers: &HashSet<&str>,
    identity: &NodeIdentity,
    snapshot: &LedgerSnapshot,
) -> Result<MergeReport> {
    if !working.same_round(incoming) {
        return Err(Error::ProtocolMismatch {
            expected: working.round_id(),
            actual: incoming.round_id(),
        });
    }

    let provider = identity.provider().as_ref();
    let publisher = incoming
        .publisher()
        .ok_or_else(|| Error::Validation(format!("unsigned envelope {}", incoming.round_id())))?;
    if !peers.contains(publisher) {
        return Err(Error::Validation(format!("envelope published by non-peer {}", publisher)));
    }
    if !incoming.verify_signature(provider) {
        return Err(Error::Validation(format!("bad envelope signature from {}", publisher)));
    }

    let mut report = MergeReport::default();
    for contribution in &incoming.contributions {
        if !contribution.validate_signature(provider) {
            debug!(
                publisher = %publisher,
                originator = %contribution.originator(),
                "Skipping contribution with bad originator signature"
            );
            continue;
        }
        match working.contribution_mut(&contribution.original_signature) {
            Some(existing) => existing.absorb_countersignatures(contribution, provider),
            None => {
                let mut relayed = contribution.clone();
                relayed.countersign(identity)?;
                working.contributions.push(relayed);
                report.contributions_added += 1;
            }
        }
    }

    let prefix = finality_prefix(
        working.block_id,
        working.block_revision.saturating_sub(1),
        &snapshot.hash,
    );
    for signature in &incoming.finality_signatures {
        if !signature.message_value.starts_with(&prefix) || !signature.validate(provider) {
            debug!(
                publisher = %publisher,
                signer = %signature.public_key,
                "Skipping finality signature for another round"
            );
            continue;
        }
        if working.finality_signatures.insert(signature.clone()) {
            report.signatures_added += 1;
        }
    }

    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ledger_core::{Account, Ed25519Provider, LedgerParameters, ValidatorMessage, ValidatorNode};
    use rust_decimal_macros::dec;

    struct Pair {
        local: NodeIdentity,
        remote: NodeIdentity,
        snapshot: LedgerSnapshot,
    }

    fn pair() -> Pair {
        let local = NodeIdentity::ed25519_from_seed([1; 32]);
        let remote = NodeIdentity::ed25519_from_seed([2; 32]);
        let accounts = [&local, &remote]
            .iter()
            .map(|i| Account::new(i.public_key().clone(), "", dec!(100), i.public_key().clone()))
            .collect::<Vec<_>>();
        let nodes = vec![
            ValidatorNode::announce(&local, "http://10.0.0.1:80").unwrap(),
            ValidatorNode::announce(&remote, "http://10.0.0.2:80").unwrap(),
        ];
        let snapshot =
            LedgerSnapshot::genesis(&Ed25519Provider, accounts, nodes, LedgerParameters::default()).unwrap();
        Pair { local, remote, snapshot }
    }

    fn contribution(identity: &NodeIdentity, snapshot: &LedgerSnapshot) -> SignedValidatorMessage {
        let pending = ValidatorMessage::empty(snapshot.id + 1, LedgerParameters::default());
        SignedValidatorMessage::create(&pending, identity, snapshot).unwrap()
    }

    #[test]
    fn test_merge_adds_and_countersigns() {
        let p = pair();
        let mut working = create_envelope(1, 2, vec![contribution(&p.local, &p.snapshot)], HashSet::new());

        let prefix = finality_prefix(1, 1, &p.snapshot.hash);
        let vote = p.remote.signature(&format!("{}abc", prefix), true).unwrap();
        let mut incoming = create_envelope(
            1,
            2,
            vec![contribution(&p.remote, &p.snapshot)],
            HashSet::from([vote]),
        );
        incoming.sign(&p.remote).unwrap();

        let peers = HashSet::from([p.remote.public_key().as_str()]);
        let report = merge(&mut working, &incoming, &peers, &p.local, &p.snapshot).unwrap();

        assert_eq!(report.contributions_added, 1);
        assert_eq!(report.signatures_added, 1);
        assert_eq!(working.contributions.len(), 2);
        let relayed = &working.contributions[1];
        assert_eq!(relayed.countersignatures.len(), 2);

        let again = merge(&mut working, &incoming, &peers, &p.local, &p.snapshot).unwrap();
        assert_eq!(again, MergeReport::default());
    }

    #[test]
    fn test_round_mismatch() {
        let p = pair();
        let mut working = create_envelope(1, 1, vec![], HashSet::new());
        let mut incoming = create_envelope(1, 1, vec![], HashSet::new());
        incoming.block_temp_version = 2;
        incoming.sign(&p.remote).unwrap();

        let peers = HashSet::from([p.remote.public_key().as_str()]);
        let err = merge(&mut working, &incoming, &peers, &p.local, &p.snapshot).unwrap_err();
        assert!(matches!(err, Error::ProtocolMismatch { .. }));
        assert!(!err.is_fatal());
    }

    #[test]
    fn test_rejects_non_peer_and_unsigned() {
        let p = pair();
        let mut working = create_envelope(1, 1, vec![], HashSet::new());
        let mut incoming = create_envelope(1, 1, vec![], HashSet::new());

        let peers = HashSet::from([p.remote.public_key().as_str()]);
        assert!(merge(&mut working, &incoming, &peers, &p.local, &p.snapshot).is_err());

        let stranger = NodeIdentity::ed25519_from_seed([9; 32]);
        incoming.sign(&stranger).unwrap();
        assert!(merge(&mut working, &incoming, &peers, &p.local, &p.snapshot).is_err());
    }

    #[test]
    fn test_stale_finality_signature_ignored() {
        let p = pair();
        let mut working = create_envelope(1, 3, vec![], HashSet::new());
        let stale = finality_prefix(1, 1, &p.snapshot.hash);
        let vote = p.remote.signature(&format!("{}abc", stale), true).unwrap();
        let mut incoming = create_envelope(1, 3, vec![], HashSet::from([vote]));
        incoming.sign(&p.remote).unwrap();

        let peers = HashSet::from([p.remote.public_key().as_str()]);
        let report = merge(&mut working, &incoming, &peers, &p.local, &p.snapshot).unwrap();
        assert_eq!(report.signatures_added, 0);
        assert!(working.finality_signatures.is_empty());
    }
}
