//! Ledger state transition
//!
//! Turns a finalized block decision into the next [`LedgerSnapshot`]:
//!
//! 1. Drop accounts of banned validators
//! 2. Apply payments at the cost in force
//! 3. Apply attribute updates
//! 4. Promote `next_params` to `current_params`, install the voted parameters
//!    as the new `next_params`
//! 5. Splice in any account reassignment carried by the voted parameters
//! 6. Recompute membership and addresses
//! 7. Advance `id`, chain `hash_previous_block`, recompute `hash`

use crate::canonical::Canonical;
use crate::crypto::SignatureProvider;
use crate::messages::ValidatorMessage;
use crate::payments::process_payments;
use crate::topology::assign_addresses;
use crate::types::{Account, AccountAttributesUpdate, LedgerParameters, LedgerSnapshot, PublicKey, ValidatorNode};
use crate::Result;
use rust_decimal::Decimal;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use tracing::{debug, info, warn};

/// What a finalized round decided
#[derive(Debug, Clone)]
pub struct BlockDecision<'a> {
    /// Validators excluded this round
    pub banned: &'a BTreeSet<PublicKey>,

    /// Signers of the winning finality digest
    pub valid_validators: &'a BTreeSet<PublicKey>,

    /// Union of the winning validators' contributions
    pub message: &'a ValidatorMessage,

    /// Parameters that won the stake vote, if any did
    pub winning_parameters: Option<LedgerParameters>,
}

/// Derive the snapshot following `previous`
pub fn next_snapshot(
    provider: &dyn SignatureProvider,
    previous: &LedgerSnapshot,
    decision: BlockDecision<'_>,
) -> Result<LedgerSnapshot> {
    let accounts: HashSet<Account> = previous
        .accounts
        .iter()
        .filter(|a| !decision.banned.contains(&a.public_key))
        .cloned()
        .collect();

    let accounts = process_payments(
        accounts,
        &decision.message.payments,
        previous.current_params.transaction_cost,
    );
    let mut accounts = apply_attribute_updates(accounts, &decision.message.attribute_updates);

    let current_params = previous.next_params.clone();
    let mut next_params = decision
        .winning_parameters
        .unwrap_or_else(|| previous.next_params.clone());

    if !next_params.account_reassignments.is_empty() {
        let reassigned = std::mem::take(&mut next_params.account_reassignments);
        info!(count = reassigned.len(), "Applying account reassignment");
        accounts = splice_accounts(accounts, reassigned);
    }

    let retained = previous
        .validators
        .iter()
        .filter(|v| decision.valid_validators.contains(&v.public_key));
    let validators = merge_validators(retained, &decision.message.validator_nodes, &current_params)?;

    let mut snapshot = LedgerSnapshot {
        id: previous.id + 1,
        accounts,
        validators,
        current_params,
        next_params,
        hash: String::new(),
        hash_previous_block: previous.hash.clone(),
        signature: None,
    };
    snapshot.compute_hash(provider);

    debug!(
        block_id = snapshot.id,
        accounts = snapshot.accounts.len(),
        validators = snapshot.validators.len(),
        "Computed next snapshot"
    );
    Ok(snapshot)
}

/// Membership: announcements win over retained entries with the same key
fn merge_validators<'a>(
    retained: impl Iterator<Item = &'a ValidatorNode>,
    announced: &HashSet<ValidatorNode>,
    params: &LedgerParameters,
) -> Result<Vec<ValidatorNode>> {
    let mut nodes: Vec<ValidatorNode> = announced
        .iter()
        .filter(|v| !v.connection_string.trim().is_empty())
        .cloned()
        .collect();
    // Stable sort keeps the first of equal keys, so order announcements
    // deterministically before the retained entries
    nodes.sort_by(|a, b| a.public_key.cmp(&b.public_key).then_with(|| a.signature.cmp(&b.signature)));
    let announced_keys: HashSet<PublicKey> = nodes.iter().map(|v| v.public_key.clone()).collect();
    nodes.extend(retained.filter(|v| !announced_keys.contains(&v.public_key)).cloned());
    assign_addresses(nodes, params)
}

/// Replace same-key accounts with the reassigned ones
///
/// One override per key survives: the one with the smallest canonical string.
/// An override at or below zero removes the account. An override whose name
/// is already held by another account keeps its balance but loses the name.
fn splice_accounts(accounts: HashSet<Account>, reassigned: HashSet<Account>) -> HashSet<Account> {
    let mut ordered: Vec<Account> = reassigned.into_iter().collect();
    ordered.sort_by_cached_key(|a| a.canonical_string());

    let mut overrides: BTreeMap<PublicKey, Account> = BTreeMap::new();
    for account in ordered {
        if overrides.contains_key(&account.public_key) {
            warn!(public_key = %account.public_key, "Duplicate reassignment dropped");
            continue;
        }
        overrides.insert(account.public_key.clone(), account);
    }

    let mut spliced: HashSet<Account> = accounts
        .into_iter()
        .filter(|a| !overrides.contains_key(&a.public_key))
        .collect();
    let mut taken: HashSet<String> = spliced
        .iter()
        .filter(|a| !a.name.is_empty())
        .map(|a| a.name.clone())
        .collect();

    for (key, mut account) in overrides {
        if account.amount <= Decimal::ZERO {
            warn!(public_key = %key, amount = %account.amount, "Reassignment removes account");
            continue;
        }
        if !account.name.is_empty() && !taken.insert(account.name.clone()) {
            warn!(public_key = %key, name = %account.name, "Reassigned name taken, dropping it");
            account.name.clear();
        }
        spliced.insert(account);
    }
    spliced
}

/// Apply alias, description and delegation changes
///
/// A rename is dropped when the name is already taken or requested by another
/// update in the same batch. Updates from unknown accounts are ignored, as is
/// every update of an account that sent more than one.
pub fn apply_attribute_updates<'a, I>(accounts: HashSet<Account>, updates: I) -> HashSet<Account>
where
    I: IntoIterator<Item = &'a AccountAttributesUpdate>,
{
    let mut by_account: HashMap<&str, Vec<&AccountAttributesUpdate>> = HashMap::new();
    for update in updates {
        by_account.entry(update.from.as_str()).or_default().push(update);
    }
    let single: HashMap<&str, &AccountAttributesUpdate> = by_account
        .into_iter()
        .filter_map(|(from, list)| {
            if list.len() == 1 {
                Some((from, list[0]))
            } else {
                warn!(public_key = %from, count = list.len(), "Conflicting attribute updates dropped");
                None
            }
        })
        .collect();

    let existing: HashSet<&str> = accounts
        .iter()
        .map(|a| a.name.as_str())
        .filter(|n| !n.is_empty())
        .collect();
    let mut requested: HashMap<&str, usize> = HashMap::new();
    for update in single.values() {
        if let Some(name) = update.requested_name() {
            *requested.entry(name).or_default() += 1;
        }
    }
    let allowed = |name: &str| requested.get(name) == Some(&1) && !existing.contains(name);

    let updated: Vec<Account> = accounts
        .iter()
        .map(|account| {
            let Some(update) = single.get(account.public_key.as_str()) else {
                return account.clone();
            };
            let mut account = account.clone();
            if let Some(delegated) = &update.delegated {
                account.delegated_validator = delegated.clone();
            }
            if let Some(description) = &update.description {
                account.description = description.clone();
            }
            match update.requested_name() {
                Some(name) if allowed(name) => account.name = name.to_string(),
                Some(name) => debug!(public_key = %account.public_key, requested = name, "Rename collides, keeping old name"),
                None => {}
            }
            account
        })
        .collect();

    updated.into_iter().collect()
}
