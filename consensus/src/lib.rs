//! Stake-weighted round consensus for a federated ledger
//!
//! Validators agree on each block through repeated gossip rounds. Every node
//! publishes one signed envelope per frame, pulls its peers' envelopes and
//! merges them; once enough revisions have passed, the finality digest
//! signed by more than half of all delegated stake wins and the block is
//! applied.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │        Peer RPC (axum)  /  client calls             │
//! └────────────────────┬────────────────────────────────┘
//!                      │ NodeHandle
//!                      ↓
//! ┌─────────────────────────────────────────────────────┐
//! │  NodeActor: mailbox + epoch-aligned frame ticks     │
//! │    RoundEngine: history, working envelope, pending  │
//! │      transport (merge) → quorum (tally, bans)       │
//! └────────────────────┬────────────────────────────────┘
//!                      │ next_snapshot
//!                      ↓
//! ┌─────────────────────────────────────────────────────┐
//! │              Ledger Core                             │
//! │  Snapshots, payments, topology, canonical signing   │
//! └─────────────────────────────────────────────────────┘
//! ```
//!
//! # Finality
//!
//! - A revision is only evaluated after `depth + redundancy` gossip steps
//! - Finality is attempted on odd revisions from the third on
//! - Strictly more than half of the total account value must back one digest
//! - Validators that equivocate are banned for the round and carry no weight

#![forbid(unsafe_code)]
#![warn(
    missing_docs,
    rust_2018_idioms,
    missing_debug_implementations,
    clippy::all
)]

pub mod actor;
pub mod config;
pub mod engine;
pub mod error;
pub mod history;
pub mod join;
pub mod metrics;
pub mod peer;
pub mod quorum;
pub mod scheduler;
pub mod server;
pub mod transport;

// Re-exports
pub use actor::{spawn_node, NodeHandle};
pub use config::{Config, NetworkConfig, Startup};
pub use engine::{RoundEngine, RoundStep};
pub use error::{Error, Result};
pub use history::{HistoryEntry, LedgerHistory};
pub use join::AuthenticationRequest;
pub use metrics::Metrics;
pub use peer::{HttpPeerClient, PeerClient};
pub use quorum::RevisionOutcome;
