//! Validator join handshake
//!
//! 1. The candidate fetches a challenge from a target validator
//! 2. It signs the challenge and its own announcement and submits both
//! 3. The target checks signatures, stake and that the announced address
//!    really answers with the candidate's key, then queues the announcement
//!    for the next round
//!
//! Membership only changes once a round carrying the announcement finalizes.

use crate::peer::PeerClient;
use crate::{Error, Result};
use ledger_core::canonical::Canonical;
use ledger_core::crypto::{self, SignatureProvider};
use ledger_core::types::is_valid_connection_string;
use ledger_core::{Error as LedgerError, LedgerSnapshot, NodeIdentity, PublicKey, ValidatorNode};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

/// Challenge a candidate must sign: the digest of the current snapshot
pub fn challenge(provider: &dyn SignatureProvider, snapshot: &LedgerSnapshot) -> String {
    crypto::digest(provider, &snapshot.canonical_string())
}

/// Signed join request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthenticationRequest {
    /// Candidate key
    pub public_key: PublicKey,

    /// Signature over the challenge
    pub challenge_signature: String,

    /// Where the candidate is reachable
    pub connection_string: String,

    /// Self-signature of the candidate's announcement
    pub connection_string_signature: String,
}

impl AuthenticationRequest {
    /// Sign `challenge` and the announcement for `connection_string`
    pub fn sign(identity: &NodeIdentity, challenge: &str, connection_string: &str) -> Result<Self> {
        let announcement = ValidatorNode::announce(identity, connection_string)?;
        Ok(Self {
            public_key: identity.public_key().clone(),
            challenge_signature: identity.sign(challenge)?,
            connection_string: announcement.connection_string,
            connection_string_signature: announcement.signature,
        })
    }

    /// Announcement carried by the request
    pub fn announcement(&self) -> ValidatorNode {
        ValidatorNode {
            public_key: self.public_key.clone(),
            connection_string: self.connection_string.clone(),
            address: Default::default(),
            signature: self.connection_string_signature.clone(),
        }
    }

    /// Both signatures valid and the connection string well formed
    pub fn verify(&self, provider: &dyn SignatureProvider, challenge: &str) -> ledger_core::Result<ValidatorNode> {
        if !crypto::verify_hex(provider, challenge, &self.public_key, &self.challenge_signature) {
            return Err(LedgerError::Validation(format!(
                "bad challenge signature from {}",
                self.public_key
            )));
        }
        if !is_valid_connection_string(&self.connection_string) {
            return Err(LedgerError::Validation(format!(
                "connection string {} carries no IPv4 address",
                self.connection_string
            )));
        }
        let node = self.announcement();
        if !node.validate(provider) {
            return Err(LedgerError::Validation(format!(
                "bad connection string signature from {}",
                self.public_key
            )));
        }
        Ok(node)
    }
}

/// The announced connection string must answer with the announced key
pub async fn confirm_identity(client: &dyn PeerClient, node: &ValidatorNode) -> Result<()> {
    let answered = client.who_am_i(&node.connection_string).await?;
    if answered != node.public_key {
        return Err(Error::Validation(format!(
            "{} answers as {}, not {}",
            node.connection_string, answered, node.public_key
        )));
    }
    Ok(())
}

/// Ask `target` to admit this node as a validator
pub async fn join_existing_ledger(
    client: &dyn PeerClient,
    identity: &NodeIdentity,
    target: &str,
    own_connection: &str,
) -> Result<bool> {
    let challenge = client.request_challenge(target).await?;
    let request = AuthenticationRequest::sign(identity, &challenge, own_connection)?;
    let accepted = client.authenticate(target, &request).await?;
    if accepted {
        info!(target = %target, public_key = %identity.public_key(), "Join request accepted");
    } else {
        warn!(target = %target, public_key = %identity.public_key(), "Join request rejected");
    }
    Ok(accepted)
}
