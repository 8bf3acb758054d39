//! Node actor
//!
//! The [`RoundEngine`] lives inside one Tokio task. Everything that touches it,
//! whether a client call, a peer call or a frame tick, arrives through the
//! mailbox, so there is never more than one writer.
//!
//! # Architecture
//!
//! ```text
//!   peer server / clients            frame ticks (epoch aligned)
//!            │                          publish ─┐   pull ─┐
//!            ▼                                   │         │
//!      NodeHandle (Clone) ── mpsc (bounded) ──►  NodeActor (single task)
//!                                                │         │
//!                                     sign + store copy    spawn pull fan-out
//!                                                          (k workers, 1 retry)
//!                                                          │
//!                            PullComplete ◄────────────────┘
//!                            merge one by one, advance
//!                            finalized? notify admitted (bounded pool)
//! ```

use crate::config::NetworkConfig;
use crate::engine::{RoundEngine, RoundStep};
use crate::history::HistoryEntry;
use crate::join::{self, AuthenticationRequest};
use crate::metrics::Metrics;
use crate::peer::PeerClient;
use crate::scheduler::FrameSchedule;
use crate::{Error, Result};
use ledger_core::types::BlockId;
use ledger_core::{
    AccountAttributesUpdate, AccountInfo, LedgerParameters, LedgerSnapshot, Payment, TransportEnvelope,
    ValidatorNode,
};
use rust_decimal::Decimal;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};

/// Message sent to the node actor
#[derive(Debug)]
pub enum NodeMessage {
    /// Queue client payments
    SubmitPayments {
        payments: Vec<Payment>,
        response: oneshot::Sender<Result<usize>>,
    },

    /// Queue an attribute update
    SubmitAttributeUpdate {
        update: AccountAttributesUpdate,
        response: oneshot::Sender<Result<()>>,
    },

    /// Vote for new parameters
    ProposeParameters {
        params: LedgerParameters,
        response: oneshot::Sender<Result<()>>,
    },

    /// Account lookup
    AccountInfo {
        id: String,
        response: oneshot::Sender<Option<AccountInfo>>,
    },

    /// Balance lookup
    Balance {
        public_key: String,
        response: oneshot::Sender<Decimal>,
    },

    /// Newest snapshot
    Snapshot {
        response: oneshot::Sender<Option<LedgerSnapshot>>,
    },

    /// Finalized blocks in `start..=end`
    History {
        start: BlockId,
        end: BlockId,
        response: oneshot::Sender<Vec<HistoryEntry>>,
    },

    /// Join challenge
    Challenge {
        response: oneshot::Sender<Result<String>>,
    },

    /// Join request from a candidate
    Authenticate {
        request: AuthenticationRequest,
        response: oneshot::Sender<bool>,
    },

    /// Candidate whose identity check finished
    Admit {
        request: AuthenticationRequest,
        confirmed: bool,
        response: oneshot::Sender<bool>,
    },

    /// Snapshot pushed by a peer
    PushSnapshot {
        snapshot: LedgerSnapshot,
        response: oneshot::Sender<Result<()>>,
    },

    /// Start a new ledger
    CreateLedger {
        genesis: LedgerSnapshot,
        response: oneshot::Sender<Result<()>>,
    },

    /// Envelopes pulled for the round `round`
    PullComplete {
        round: String,
        envelopes: Vec<TransportEnvelope>,
    },

    /// Shutdown actor
    Shutdown,
}

/// Actor owning a [`RoundEngine`]
pub struct NodeActor {
    engine: RoundEngine,
    mailbox: mpsc::Receiver<NodeMessage>,
    feedback: mpsc::WeakSender<NodeMessage>,
    client: Arc<dyn PeerClient>,
    network: NetworkConfig,
    notify_permits: Arc<Semaphore>,
    pull_in_flight: bool,
}

impl std::fmt::Debug for NodeActor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeActor")
            .field("public_key", self.engine.public_key())
            .field("pull_in_flight", &self.pull_in_flight)
            .finish()
    }
}

impl NodeActor {
    /// Run the actor event loop
    pub async fn run(mut self) {
        let mut frame = self.engine.frame_duration();
        let mut publish_tick = FrameSchedule::publish(frame).interval();
        let mut pull_tick = FrameSchedule::pull(frame).interval();

        loop {
            let outcome = tokio::select! {
                msg = self.mailbox.recv() => match msg {
                    Some(NodeMessage::Shutdown) | None => break,
                    Some(msg) => self.handle_message(msg),
                },

                _ = publish_tick.tick() => {
                    self.on_publish();
                    Ok(())
                }

                _ = pull_tick.tick() => self.on_pull(),
            };

            if let Err(e) = outcome {
                if e.is_fatal() {
                    error!(error = %e, "Unrecoverable error, stopping node");
                    break;
                }
                warn!(error = %e, "Frame step failed");
            }

            let current = self.engine.frame_duration();
            if current != frame {
                info!(frame_ms = current.as_millis() as u64, "Frame length changed, rescheduling");
                frame = current;
                publish_tick = FrameSchedule::publish(frame).interval();
                pull_tick = FrameSchedule::pull(frame).interval();
            }
        }

        info!(public_key = %self.engine.public_key(), "Node actor stopped");
    }

    fn handle_message(&mut self, msg: NodeMessage) -> Result<()> {
        match msg {
            NodeMessage::SubmitPayments { payments, response } => {
                let _ = response.send(self.engine.submit_payments(payments));
            }

            NodeMessage::SubmitAttributeUpdate { update, response } => {
                let _ = response.send(self.engine.submit_attribute_update(update));
            }

            NodeMessage::ProposeParameters { params, response } => {
                let _ = response.send(self.engine.propose_parameters(params));
            }

            NodeMessage::AccountInfo { id, response } => {
                let _ = response.send(self.engine.account_info(&id));
            }

            NodeMessage::Balance { public_key, response } => {
                let _ = response.send(self.engine.balance(&public_key));
            }

            NodeMessage::Snapshot { response } => {
                let _ = response.send(self.engine.snapshot().cloned());
            }

            NodeMessage::History { start, end, response } => {
                let entries = self
                    .engine
                    .history()
                    .map(|h| h.interval(start, end).into_iter().cloned().collect())
                    .unwrap_or_default();
                let _ = response.send(entries);
            }

            NodeMessage::Challenge { response } => {
                let _ = response.send(self.engine.challenge());
            }

            NodeMessage::Authenticate { request, response } => self.on_authenticate(request, response),

            NodeMessage::Admit {
                request,
                confirmed,
                response,
            } => {
                let accepted = if confirmed {
                    match self.engine.check_candidate(&request) {
                        Ok(node) => self.engine.admit_candidate(node).is_ok(),
                        Err(_) => false,
                    }
                } else {
                    self.engine.metrics().record_join(false);
                    false
                };
                let _ = response.send(accepted);
            }

            NodeMessage::PushSnapshot { snapshot, response } => {
                let result = self.engine.initialize(snapshot);
                if let Err(e) = &result {
                    warn!(operation = "push_snapshot", error = %e, "Refusing pushed snapshot");
                }
                let _ = response.send(result);
            }

            NodeMessage::CreateLedger { genesis, response } => {
                let _ = response.send(self.engine.create_ledger(genesis));
            }

            NodeMessage::PullComplete { round, envelopes } => return self.on_pull_complete(round, envelopes),

            NodeMessage::Shutdown => {
                // Handled in main loop
            }
        }
        Ok(())
    }

    fn on_publish(&mut self) {
        if !self.engine.is_ready() {
            return;
        }
        match self.engine.publish() {
            Ok(envelope) => debug!(round = %envelope.round_id(), "Published envelope"),
            Err(e) => warn!(operation = "publish", error = %e, "Publishing failed"),
        }
    }

    fn on_pull(&mut self) -> Result<()> {
        if !self.engine.is_ready() {
            return Ok(());
        }
        if self.pull_in_flight {
            debug!("Previous pull still running, skipping frame");
            return Ok(());
        }
        let Some(round) = self.engine.working().map(|w| w.round_id()) else {
            return Ok(());
        };

        let peers = self.engine.peers()?;
        if peers.is_empty() {
            return self.on_pull_complete(round, Vec::new());
        }

        self.pull_in_flight = true;
        let client = self.client.clone();
        let network = self.network.clone();
        let metrics = self.engine.metrics().clone();
        let feedback = self.feedback.clone();
        tokio::spawn(async move {
            let envelopes = pull_peers(client, peers, &network, &metrics).await;
            if let Some(sender) = feedback.upgrade() {
                let _ = sender.send(NodeMessage::PullComplete { round, envelopes }).await;
            }
        });
        Ok(())
    }

    fn on_pull_complete(&mut self, round: String, envelopes: Vec<TransportEnvelope>) -> Result<()> {
        self.pull_in_flight = false;
        if self.engine.working().map(|w| w.round_id()).as_deref() != Some(round.as_str()) {
            debug!(round = %round, "Dropping pull for a round that is already over");
            return Ok(());
        }

        for envelope in envelopes {
            // rejections are logged and counted by the engine
            let _ = self.engine.receive(envelope);
        }

        match self.engine.advance()? {
            RoundStep::Finalized { block_id, admitted } => {
                debug!(block_id, admitted = admitted.len(), "Round committed");
                self.notify_admitted(admitted);
            }
            step => debug!(?step, "Round advanced"),
        }
        Ok(())
    }

    fn on_authenticate(&mut self, request: AuthenticationRequest, response: oneshot::Sender<bool>) {
        let node = match self.engine.check_candidate(&request) {
            Ok(node) => node,
            Err(_) => {
                let _ = response.send(false);
                return;
            }
        };

        let client = self.client.clone();
        let feedback = self.feedback.clone();
        tokio::spawn(async move {
            let confirmed = match join::confirm_identity(client.as_ref(), &node).await {
                Ok(()) => true,
                Err(e) => {
                    warn!(operation = "authenticate", public_key = %node.public_key, error = %e, "Identity check failed");
                    false
                }
            };
            if let Some(sender) = feedback.upgrade() {
                let _ = sender
                    .send(NodeMessage::Admit {
                        request,
                        confirmed,
                        response,
                    })
                    .await;
            }
        });
    }

    fn notify_admitted(&self, admitted: Vec<ValidatorNode>) {
        let Some(snapshot) = self.engine.snapshot() else {
            return;
        };
        let snapshot = Arc::new(snapshot.clone());
        for node in admitted {
            let client = self.client.clone();
            let permits = self.notify_permits.clone();
            let snapshot = snapshot.clone();
            tokio::spawn(async move {
                let Ok(_permit) = permits.acquire_owned().await else {
                    return;
                };
                match client.push_snapshot(&node.connection_string, &snapshot).await {
                    Ok(()) => info!(public_key = %node.public_key, block_id = snapshot.id, "Pushed snapshot to new validator"),
                    Err(e) => warn!(
                        operation = "push_snapshot",
                        public_key = %node.public_key,
                        error = %e,
                        "Could not notify new validator"
                    ),
                }
            });
        }
    }
}

async fn fetch_with_retry(
    client: &dyn PeerClient,
    peer: &str,
    backoff: Duration,
) -> Result<Option<TransportEnvelope>> {
    match client.current_envelope(peer).await {
        Ok(envelope) => Ok(envelope),
        Err(first) => {
            debug!(peer = %peer, error = %first, "Retrying peer fetch");
            tokio::time::sleep(backoff).await;
            client.current_envelope(peer).await
        }
    }
}

/// Fetch every peer's envelope with bounded parallelism
async fn pull_peers(
    client: Arc<dyn PeerClient>,
    peers: Vec<ValidatorNode>,
    network: &NetworkConfig,
    metrics: &Metrics,
) -> Vec<TransportEnvelope> {
    let permits = Arc::new(Semaphore::new(network.pull_concurrency.max(1)));
    let mut tasks = JoinSet::new();
    for peer in peers {
        let client = client.clone();
        let permits = permits.clone();
        let metrics = metrics.clone();
        let backoff = network.retry_backoff();
        tasks.spawn(async move {
            let _permit = permits.acquire_owned().await.ok()?;
            let timer = metrics.peer_fetch_duration.start_timer();
            let result = fetch_with_retry(client.as_ref(), &peer.connection_string, backoff).await;
            timer.observe_duration();
            match result {
                Ok(envelope) => envelope,
                Err(e) => {
                    metrics.peer_fetch_failures.inc();
                    warn!(peer = %peer.connection_string, error = %e, "Peer silent this frame");
                    None
                }
            }
        });
    }

    let mut envelopes = Vec::new();
    while let Some(joined) = tasks.join_next().await {
        if let Ok(Some(envelope)) = joined {
            envelopes.push(envelope);
        }
    }
    envelopes
}

/// Handle for sending messages to the actor
#[derive(Clone, Debug)]
pub struct NodeHandle {
    sender: mpsc::Sender<NodeMessage>,
}

impl NodeHandle {
    async fn request<T>(&self, build: impl FnOnce(oneshot::Sender<T>) -> NodeMessage) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(build(tx))
            .await
            .map_err(|_| Error::Concurrency("Actor mailbox closed".to_string()))?;

        rx.await
            .map_err(|_| Error::Concurrency("Response channel closed".to_string()))
    }

    /// Queue client payments
    pub async fn submit_payments(&self, payments: Vec<Payment>) -> Result<usize> {
        self.request(|response| NodeMessage::SubmitPayments { payments, response })
            .await?
    }

    /// Queue an attribute update
    pub async fn submit_attribute_update(&self, update: AccountAttributesUpdate) -> Result<()> {
        self.request(|response| NodeMessage::SubmitAttributeUpdate { update, response })
            .await?
    }

    /// Vote for new parameters
    pub async fn propose_parameters(&self, params: LedgerParameters) -> Result<()> {
        self.request(|response| NodeMessage::ProposeParameters { params, response })
            .await?
    }

    /// Account by name or key
    pub async fn account_info(&self, id: impl Into<String>) -> Result<Option<AccountInfo>> {
        let id = id.into();
        self.request(|response| NodeMessage::AccountInfo { id, response }).await
    }

    /// Balance of a key
    pub async fn balance(&self, public_key: impl Into<String>) -> Result<Decimal> {
        let public_key = public_key.into();
        self.request(|response| NodeMessage::Balance { public_key, response })
            .await
    }

    /// Newest snapshot
    pub async fn snapshot(&self) -> Result<Option<LedgerSnapshot>> {
        self.request(|response| NodeMessage::Snapshot { response }).await
    }

    /// Finalized blocks in `start..=end`
    pub async fn history(&self, start: BlockId, end: BlockId) -> Result<Vec<HistoryEntry>> {
        self.request(|response| NodeMessage::History { start, end, response })
            .await
    }

    /// Join challenge
    pub async fn challenge(&self) -> Result<String> {
        self.request(|response| NodeMessage::Challenge { response }).await?
    }

    /// Handle a join request
    pub async fn authenticate(&self, request: AuthenticationRequest) -> Result<bool> {
        self.request(|response| NodeMessage::Authenticate { request, response })
            .await
    }

    /// Initialize from a pushed snapshot
    pub async fn push_snapshot(&self, snapshot: LedgerSnapshot) -> Result<()> {
        self.request(|response| NodeMessage::PushSnapshot { snapshot, response })
            .await?
    }

    /// Start a new ledger
    pub async fn create_ledger(&self, genesis: LedgerSnapshot) -> Result<()> {
        self.request(|response| NodeMessage::CreateLedger { genesis, response })
            .await?
    }

    /// Shutdown actor
    pub async fn shutdown(&self) -> Result<()> {
        self.sender
            .send(NodeMessage::Shutdown)
            .await
            .map_err(|_| Error::Concurrency("Actor mailbox closed".to_string()))?;
        Ok(())
    }
}

/// Spawn the node actor
pub fn spawn_node(
    engine: RoundEngine,
    client: Arc<dyn PeerClient>,
    network: NetworkConfig,
    mailbox_capacity: usize,
) -> (NodeHandle, JoinHandle<()>) {
    let (tx, rx) = mpsc::channel(mailbox_capacity.max(1)); // Bounded channel for backpressure
    let actor = NodeActor {
        engine,
        mailbox: rx,
        feedback: tx.downgrade(),
        client,
        notify_permits: Arc::new(Semaphore::new(network.notify_concurrency.max(1))),
        network,
        pull_in_flight: false,
    };

    let task = tokio::spawn(async move {
        actor.run().await;
    });

    (NodeHandle { sender: tx }, task)
}
