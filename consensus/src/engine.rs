//! Round state machine
//!
//! [`RoundEngine`] is the single owner of a node's consensus state: the
//! ledger history, the working envelope for the block under decision and the
//! pending message collected for the block after it. Every mutation goes
//! through it on one timeline; peers only ever see the immutable copy
//! produced by [`RoundEngine::publish`].
//!
//! # Round cadence
//!
//! ```text
//! temp 1 .. target        GATHERING   pull peers, merge, bump temp version
//! temp == target          REVISING    evaluate the revision
//!   gate closed / no majority  -> revision + 1, carrying this node's vote
//!   gate open + majority       -> finalize, start revision 1 of the next block
//! ```
//!
//! A client payment submitted while on snapshot `n` targets block `n + 2`:
//! it is sealed into this node's contribution when block `n + 1` finalizes
//! and decided in the round for `n + 2`.

use crate::history::{HistoryEntry, LedgerHistory};
use crate::join::{self, AuthenticationRequest};
use crate::metrics::Metrics;
use crate::quorum::{self, RevisionOutcome};
use crate::transport::{self, MergeReport};
use crate::{Error, Result};
use chrono::Utc;
use ledger_core::ledger::{next_snapshot, BlockDecision};
use ledger_core::topology::peers_of;
use ledger_core::types::{BlockId, MAX_NAME_LENGTH};
use ledger_core::{
    AccountAttributesUpdate, AccountInfo, Error as LedgerError, LedgerParameters, LedgerSnapshot, NodeIdentity,
    Payment, PublicKey, SignatureProvider, SignedValidatorMessage, TransportEnvelope, ValidatorMessage,
    ValidatorNode,
};
use parking_lot::RwLock;
use rust_decimal::Decimal;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Latest envelope a node has published, shared with the peer server
pub type PublishedEnvelope = Arc<RwLock<Option<Arc<TransportEnvelope>>>>;

/// Frame length used before any ledger is known
pub const DEFAULT_FRAME: Duration = Duration::from_millis(2_000);

/// What one call to [`RoundEngine::advance`] did
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoundStep {
    /// No ledger yet
    Idle,

    /// Still gossiping within the revision
    Gathering {
        /// Temp version now in progress
        temp_version: u32,
    },

    /// Finality not reached; a new revision started
    NewRevision {
        /// Revision now in progress
        revision: u32,
        /// Validators banned in the evaluated revision
        banned: usize,
    },

    /// A block was finalized
    Finalized {
        /// Id of the new snapshot
        block_id: BlockId,
        /// Validators that joined with this block
        admitted: Vec<ValidatorNode>,
    },
}

#[derive(Debug)]
struct RoundState {
    history: LedgerHistory,
    working: TransportEnvelope,
    pending: ValidatorMessage,
    transmissions: u32,
}

/// Single owner of a validator's consensus state
#[derive(Debug)]
pub struct RoundEngine {
    identity: NodeIdentity,
    connection_string: String,
    metrics: Metrics,
    retention: u64,
    published: PublishedEnvelope,
    round: Option<RoundState>,
}

fn no_ledger() -> Error {
    Error::Validation("no ledger initialized".to_string())
}

impl RoundEngine {
    /// Engine for `identity`, reachable at `connection_string`, keeping
    /// `retention` finalized blocks of history
    pub fn new(identity: NodeIdentity, connection_string: impl Into<String>, metrics: Metrics, retention: u64) -> Self {
        Self {
            identity,
            connection_string: connection_string.into(),
            metrics,
            retention: retention.max(1),
            published: Arc::new(RwLock::new(None)),
            round: None,
        }
    }

    /// This node's key
    pub fn public_key(&self) -> &PublicKey {
        self.identity.public_key()
    }

    /// This node's signing identity
    pub fn identity(&self) -> &NodeIdentity {
        &self.identity
    }

    /// How peers reach this node
    pub fn connection_string(&self) -> &str {
        &self.connection_string
    }

    /// Handle on the published envelope
    pub fn published(&self) -> PublishedEnvelope {
        self.published.clone()
    }

    /// Metrics collector
    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    /// A ledger has been created or received
    pub fn is_ready(&self) -> bool {
        self.round.is_some()
    }

    /// Newest finalized snapshot
    pub fn snapshot(&self) -> Option<&LedgerSnapshot> {
        self.round.as_ref().map(|r| r.history.latest())
    }

    /// Finalized history
    pub fn history(&self) -> Option<&LedgerHistory> {
        self.round.as_ref().map(|r| &r.history)
    }

    /// Envelope for the block under decision
    pub fn working(&self) -> Option<&TransportEnvelope> {
        self.round.as_ref().map(|r| &r.working)
    }

    /// Message collected for the following block
    pub fn pending(&self) -> Option<&ValidatorMessage> {
        self.round.as_ref().map(|r| &r.pending)
    }

    /// Frame length under the parameters in force
    pub fn frame_duration(&self) -> Duration {
        self.snapshot()
            .map(|s| Duration::from_millis(s.current_params.frame_processing_time_ms.max(1)))
            .unwrap_or(DEFAULT_FRAME)
    }

    fn provider(&self) -> Arc<dyn SignatureProvider> {
        self.identity.provider().clone()
    }

    fn state(&self) -> Result<&RoundState> {
        self.round.as_ref().ok_or_else(no_ledger)
    }

    // =====================================================================
    // LEDGER LIFECYCLE
    // =====================================================================

    /// Start a new ledger from `genesis`
    pub fn create_ledger(&mut self, genesis: LedgerSnapshot) -> Result<()> {
        if !genesis.verify_hash(self.provider().as_ref()) {
            return Err(Error::Validation("genesis hash does not match its content".to_string()));
        }
        info!(block_id = genesis.id, validators = genesis.validators.len(), "Creating ledger");
        self.reset(genesis)
    }

    /// Restart the round state from a snapshot pushed by a peer
    pub fn initialize(&mut self, snapshot: LedgerSnapshot) -> Result<()> {
        if !snapshot.verify_hash(self.provider().as_ref()) {
            return Err(Error::Validation(format!(
                "pushed snapshot {} does not match its hash",
                snapshot.id
            )));
        }
        if snapshot.validator(self.public_key()).is_none() {
            return Err(Error::Validation(format!(
                "pushed snapshot {} does not list this node",
                snapshot.id
            )));
        }
        if let Some(current) = self.snapshot() {
            if snapshot.id <= current.id {
                return Err(Error::Validation(format!(
                    "pushed snapshot {} is not newer than {}",
                    snapshot.id, current.id
                )));
            }
        }
        info!(block_id = snapshot.id, "Initializing from pushed snapshot");
        self.reset(snapshot)
    }

    fn reset(&mut self, snapshot: LedgerSnapshot) -> Result<()> {
        let transmissions = snapshot
            .current_params
            .transmissions_per_revision(snapshot.validators.len())?;
        let params = snapshot.next_params.clone();
        let opening = ValidatorMessage::empty(snapshot.id + 1, params.clone());
        let contribution = SignedValidatorMessage::create(&opening, &self.identity, &snapshot)?;

        let working = transport::create_envelope(snapshot.id + 1, 1, vec![contribution], HashSet::new());
        let pending = ValidatorMessage::empty(snapshot.id + 2, params);
        self.metrics.block_id.set(snapshot.id as i64);
        self.round = Some(RoundState {
            history: LedgerHistory::new(snapshot),
            working,
            pending,
            transmissions,
        });
        *self.published.write() = None;
        Ok(())
    }

    // =====================================================================
    // ROUND PROTOCOL
    // =====================================================================

    /// Current peers of this node
    pub fn peers(&self) -> Result<Vec<ValidatorNode>> {
        let snapshot = self.state()?.history.latest();
        let Some(own) = snapshot.validator(self.public_key()) else {
            return Ok(Vec::new());
        };
        let shape = snapshot.group_shape()?;
        Ok(peers_of(&snapshot.validators, &own.address, shape)
            .into_iter()
            .cloned()
            .collect())
    }

    /// Sign a copy of the working envelope and make it visible to peers
    pub fn publish(&mut self) -> Result<Arc<TransportEnvelope>> {
        let mut envelope = self.state()?.working.clone();
        envelope.received_at = None;
        envelope.sign(&self.identity)?;
        let envelope = Arc::new(envelope);
        *self.published.write() = Some(envelope.clone());
        Ok(envelope)
    }

    /// Merge an envelope pulled from a peer
    pub fn receive(&mut self, mut incoming: TransportEnvelope) -> Result<MergeReport> {
        incoming.received_at = Some(Utc::now());
        let peers = self.peers()?;
        let keys: HashSet<&str> = peers.iter().map(|p| p.public_key.as_str()).collect();

        let state = self.round.as_mut().ok_or_else(no_ledger)?;
        let snapshot = state.history.latest();
        match transport::merge(&mut state.working, &incoming, &keys, &self.identity, snapshot) {
            Ok(report) => {
                debug!(
                    round = %state.working.round_id(),
                    contributions = report.contributions_added,
                    signatures = report.signatures_added,
                    "Merged peer envelope"
                );
                Ok(report)
            }
            Err(e) => {
                self.metrics.merge_rejections.inc();
                warn!(
                    operation = "receive",
                    publisher = incoming.publisher().unwrap_or("unsigned"),
                    error = %e,
                    "Discarding peer envelope"
                );
                Err(e)
            }
        }
    }

    /// Move the round forward by one step
    pub fn advance(&mut self) -> Result<RoundStep> {
        let provider = self.provider();
        let Some(state) = self.round.as_mut() else {
            return Ok(RoundStep::Idle);
        };

        if state.working.block_temp_version < state.transmissions {
            state.working.block_temp_version += 1;
            return Ok(RoundStep::Gathering {
                temp_version: state.working.block_temp_version,
            });
        }

        let outcome = quorum::process_revision(provider.as_ref(), &state.working, state.history.latest());
        if outcome.valid {
            self.finalize(outcome)
        } else {
            self.start_revision(outcome)
        }
    }

    fn start_revision(&mut self, outcome: RevisionOutcome) -> Result<RoundStep> {
        let digest = outcome.digest_string(self.provider().as_ref());
        let vote = self.identity.signature(&digest, true)?;
        let state = self.round.as_mut().ok_or_else(no_ledger)?;

        let contributions = std::mem::take(&mut state.working.contributions);
        let revision = outcome.revision + 1;
        state.working = transport::create_envelope(outcome.block_id, revision, contributions, HashSet::from([vote]));
        self.metrics.record_new_revision(outcome.banned.len());
        debug!(
            block_id = outcome.block_id,
            revision,
            winning_stake = %outcome.winning_stake,
            banned = outcome.banned.len(),
            "Starting new revision"
        );
        Ok(RoundStep::NewRevision {
            revision,
            banned: outcome.banned.len(),
        })
    }

    fn finalize(&mut self, outcome: RevisionOutcome) -> Result<RoundStep> {
        let provider = self.provider();
        let state = self.round.as_ref().ok_or_else(no_ledger)?;
        let previous = state.history.latest();

        let message = outcome.resulting_message();
        let winning_parameters = outcome.resulting_parameters();
        let mut snapshot = next_snapshot(
            provider.as_ref(),
            previous,
            BlockDecision {
                banned: &outcome.banned,
                valid_validators: &outcome.valid_validators,
                message: &message,
                winning_parameters: winning_parameters.clone(),
            },
        )?;
        snapshot.sign(&self.identity)?;

        let known: HashSet<&str> = previous.validators.iter().map(|v| v.public_key.as_str()).collect();
        let admitted: Vec<ValidatorNode> = snapshot
            .validators
            .iter()
            .filter(|v| !known.contains(v.public_key.as_str()) && v.public_key != *self.identity.public_key())
            .cloned()
            .collect();

        let mut sealed = state.pending.clone();
        if let Some(won) = &winning_parameters {
            if !won.account_reassignments.is_empty()
                && won.account_reassignments == sealed.voted_parameters.account_reassignments
            {
                sealed.voted_parameters.account_reassignments.clear();
            }
        }
        if let Err(e) = sealed.voted_parameters.validate(&snapshot.accounts) {
            warn!(operation = "finalize", error = %e, "Parameter vote no longer applies, withdrawing it");
            sealed.voted_parameters = snapshot.next_params.clone();
        }
        let contribution = SignedValidatorMessage::create(&sealed, &self.identity, &snapshot)?;
        let transmissions = snapshot
            .current_params
            .transmissions_per_revision(snapshot.validators.len())?;

        let entry = HistoryEntry {
            revision: outcome.revision,
            digest: outcome.digest_string(provider.as_ref()),
            banned: outcome.banned.clone(),
            valid_validators: outcome.valid_validators.clone(),
            message,
            snapshot: snapshot.clone(),
            finalized_at: Utc::now(),
        };

        let state = self.round.as_mut().ok_or_else(no_ledger)?;
        state.history.append(entry)?;
        state.history.retain_last(self.retention);
        state.pending = ValidatorMessage::empty(snapshot.id + 2, sealed.voted_parameters);
        state.transmissions = transmissions;
        state.working = transport::create_envelope(snapshot.id + 1, 1, vec![contribution], HashSet::new());

        self.metrics.record_block_finalized(snapshot.id);
        info!(
            block_id = snapshot.id,
            revision = outcome.revision,
            accounts = snapshot.accounts.len(),
            validators = snapshot.validators.len(),
            banned = outcome.banned.len(),
            admitted = admitted.len(),
            "Block finalized"
        );
        Ok(RoundStep::Finalized {
            block_id: snapshot.id,
            admitted,
        })
    }

    // =====================================================================
    // CLIENT INTAKE
    // =====================================================================

    /// Queue client payments for the next contribution; returns how many
    /// were accepted
    ///
    /// Payments failing an intake rule are dropped individually. A batch
    /// that would overflow the per-block limit is refused as a whole.
    pub fn submit_payments(&mut self, payments: Vec<Payment>) -> Result<usize> {
        let provider = self.provider();
        let own_key = self.identity.public_key().clone();
        let state = self.round.as_mut().ok_or_else(no_ledger)?;
        let snapshot = state.history.latest();
        let names = snapshot.names();

        let mut accepted = Vec::new();
        for payment in payments {
            match check_payment_intake(provider.as_ref(), &payment, snapshot, &names, &own_key) {
                Ok(()) => accepted.push(payment),
                Err(e) => warn!(
                    operation = "submit_payments",
                    public_key = %payment.from,
                    error = %e,
                    "Payment refused"
                ),
            }
        }

        let limit = snapshot.next_params.max_transactions_per_block;
        if state.pending.payments.len() + accepted.len() > limit {
            return Err(Error::Validation(format!(
                "batch of {} payments would exceed the block limit of {}",
                accepted.len(),
                limit
            )));
        }

        let count = accepted.len();
        state.pending.payments.extend(accepted);
        Ok(count)
    }

    /// Queue an attribute update bound to the current snapshot
    pub fn submit_attribute_update(&mut self, update: AccountAttributesUpdate) -> Result<()> {
        let provider = self.provider();
        let state = self.round.as_mut().ok_or_else(no_ledger)?;
        let snapshot = state.history.latest();

        update.check(provider.as_ref(), snapshot.id + 1, &snapshot.hash)?;
        if snapshot.account(&update.from).is_none() {
            return Err(Error::Validation(format!("no account {}", update.from)));
        }
        state.pending.attribute_updates.insert(update);
        Ok(())
    }

    /// Vote for `params` from the next contribution on
    pub fn propose_parameters(&mut self, params: LedgerParameters) -> Result<()> {
        let state = self.round.as_mut().ok_or_else(no_ledger)?;
        params.validate(&state.history.latest().accounts)?;
        info!(operation = "propose_parameters", "Voting for new ledger parameters");
        state.pending.voted_parameters = params;
        Ok(())
    }

    /// Account by name, falling back to public key
    pub fn account_info(&self, id: &str) -> Option<AccountInfo> {
        let snapshot = self.snapshot()?;
        let by_name = if id.chars().count() < MAX_NAME_LENGTH {
            snapshot.account_by_name(id)
        } else {
            None
        };
        let account = by_name.or_else(|| snapshot.account(id))?;
        Some(AccountInfo {
            node: snapshot.validator(&account.public_key).cloned(),
            account: account.clone(),
        })
    }

    /// Balance of `public_key`; zero when unknown
    pub fn balance(&self, public_key: &str) -> Decimal {
        self.snapshot()
            .and_then(|s| s.account(public_key))
            .map(|a| a.amount)
            .unwrap_or_default()
    }

    // =====================================================================
    // JOINS
    // =====================================================================

    /// Challenge join candidates must sign
    pub fn challenge(&self) -> Result<String> {
        let snapshot = self.state()?.history.latest();
        Ok(join::challenge(self.provider().as_ref(), snapshot))
    }

    /// Local checks of a join request; the identity of the announced
    /// address is confirmed separately
    pub fn check_candidate(&self, request: &AuthenticationRequest) -> Result<ValidatorNode> {
        let result = self.evaluate_candidate(request);
        if let Err(e) = &result {
            self.metrics.record_join(false);
            warn!(operation = "authenticate", public_key = %request.public_key, error = %e, "Join refused");
        }
        result
    }

    fn evaluate_candidate(&self, request: &AuthenticationRequest) -> Result<ValidatorNode> {
        let state = self.state()?;
        let snapshot = state.history.latest();
        let challenge = join::challenge(self.provider().as_ref(), snapshot);
        let node = request.verify(self.provider().as_ref(), &challenge)?;

        if snapshot.validator(&node.public_key).is_some() {
            return Err(Error::Validation(format!("{} already validates", node.public_key)));
        }
        let own = self.public_key().as_str();
        let announced = |nodes: &HashSet<ValidatorNode>| nodes.iter().any(|n| n.public_key == node.public_key);
        let queued = announced(&state.pending.validator_nodes)
            || state
                .working
                .contributions
                .iter()
                .any(|c| c.originator() == own && announced(&c.contract.validator_nodes));
        if queued {
            return Err(Error::Validation(format!("{} is already pending", node.public_key)));
        }

        let stake = snapshot.account(&node.public_key).map(|a| a.amount).unwrap_or_default();
        let requirement = snapshot.current_params.validator_stake_requirement;
        if stake <= requirement {
            return Err(Error::Validation(format!(
                "stake {} of {} does not exceed the requirement of {}",
                stake, node.public_key, requirement
            )));
        }
        Ok(node)
    }

    /// Queue a checked candidate for the next round
    pub fn admit_candidate(&mut self, node: ValidatorNode) -> Result<()> {
        let state = self.round.as_mut().ok_or_else(no_ledger)?;
        info!(
            operation = "authenticate",
            public_key = %node.public_key,
            connection = %node.connection_string,
            "Join accepted, announcing in next contribution"
        );
        state.pending.validator_nodes.insert(node);
        self.metrics.record_join(true);
        Ok(())
    }
}

fn check_payment_intake(
    provider: &dyn SignatureProvider,
    payment: &Payment,
    snapshot: &LedgerSnapshot,
    names: &HashMap<String, PublicKey>,
    validator: &str,
) -> ledger_core::Result<()> {
    let mut resolved = payment.clone();
    resolved.resolve_keys(names);
    resolved.check_payer_signature(provider)?;

    let expected_block = snapshot.id + 2;
    if payment.block_id != expected_block {
        return Err(LedgerError::Replay(format!(
            "payment targets block {}, expected {}",
            payment.block_id, expected_block
        )));
    }

    let params = &snapshot.next_params;
    if payment.amount < params.transaction_cost {
        return Err(LedgerError::Validation(format!(
            "amount {} below transaction cost {}",
            payment.amount, params.transaction_cost
        )));
    }
    if params.max_message_length > 0 && payment.comment.chars().count() > params.max_message_length {
        return Err(LedgerError::Validation(format!(
            "comment exceeds {} characters",
            params.max_message_length
        )));
    }

    let payer = snapshot
        .account(resolved.payer_key())
        .ok_or_else(|| LedgerError::Validation(format!("unknown payer {}", payment.from)))?;
    if payer.delegated_validator != validator {
        return Err(LedgerError::Validation(format!(
            "payer {} delegates to {}",
            payment.from, payer.delegated_validator
        )));
    }
    Ok(())
}
