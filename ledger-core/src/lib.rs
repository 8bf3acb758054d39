//! Hypernode Ledger Core
//!
//! Data model and deterministic state machine of a stake-weighted federated
//! ledger.
//!
//! # Architecture
//!
//! - **Canonical strings**: every signable entity renders a deterministic
//!   string; set-valued fields are sorted so independent nodes agree
//! - **Pluggable signatures**: [`crypto::SignatureProvider`] hides the scheme
//! - **Group topology**: validators are addressed in a mixed-radix hierarchy
//!   bounding each node's peer count
//! - **State transition**: a finalized block decision yields the next
//!   snapshot through [`ledger::next_snapshot`]
//!
//! # Invariants
//!
//! - `hash == digest(canonical_string)` for every snapshot
//! - Snapshot ids grow by exactly one per finalized block
//! - Balances never go negative; the transaction cost is burned

#![forbid(unsafe_code)]
#![warn(
    missing_docs,
    rust_2018_idioms,
    missing_debug_implementations,
    clippy::all
)]

pub mod canonical;
pub mod config;
pub mod crypto;
pub mod error;
pub mod ledger;
pub mod messages;
pub mod payments;
pub mod topology;
pub mod types;

// Re-exports
pub use canonical::Canonical;
pub use config::GenesisConfig;
pub use crypto::{Ed25519Provider, NodeIdentity, SignatureProvider};
pub use error::{Error, Result};
pub use messages::{SignedValidatorMessage, TransportEnvelope, ValidatorMessage};
pub use types::{
    Account, AccountAttributesUpdate, AccountInfo, BlockId, LedgerParameters, LedgerSnapshot, Payment,
    PublicKey, Signature, ValidatorNode,
};
