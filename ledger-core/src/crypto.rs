//! Signing primitives for the ledger
//!
//! The rest of the crate only talks to [`SignatureProvider`], so the
//! asymmetric scheme is pluggable. [`Ed25519Provider`] is the shipped
//! implementation:
//! - Ed25519 signing and verification
//! - SHA-256 digests rendered as lowercase hex
//!
//! Keys and signatures travel through the data model as hex strings.

use crate::types::{PublicKey, Signature};
use crate::{Error, Result};
use ed25519_dalek::{Signature as DalekSignature, Signer, SigningKey, Verifier, VerifyingKey};
use sha2::{Digest, Sha256};
use std::fmt;
use std::sync::Arc;

/// Pluggable sign/verify/digest primitives
pub trait SignatureProvider: Send + Sync {
    /// Sign `message` with the raw private key material
    fn sign(&self, message: &[u8], secret_key: &[u8]) -> Result<Vec<u8>>;

    /// Verify `signature` over `message` for the raw public key
    fn verify(&self, message: &[u8], public_key: &[u8], signature: &[u8]) -> bool;

    /// Fixed-length hex digest of `message`
    fn digest(&self, message: &[u8]) -> String;

    /// Derive the public key that belongs to `secret_key`
    fn public_key(&self, secret_key: &[u8]) -> Result<Vec<u8>>;

    /// Scheme name, for logs
    fn name(&self) -> &'static str;
}

/// Ed25519 signatures with SHA-256 digests
#[derive(Debug, Clone, Copy, Default)]
pub struct Ed25519Provider;

impl Ed25519Provider {
    fn signing_key(secret_key: &[u8]) -> Result<SigningKey> {
        let seed: [u8; 32] = secret_key
            .try_into()
            .map_err(|_| Error::Signature(format!("expected 32 byte seed, got {}", secret_key.len())))?;
        Ok(SigningKey::from_bytes(&seed))
    }
}

impl SignatureProvider for Ed25519Provider {
    fn sign(&self, message: &[u8], secret_key: &[u8]) -> Result<Vec<u8>> {
        let signing_key = Self::signing_key(secret_key)?;
        Ok(signing_key.sign(message).to_bytes().to_vec())
    }

    fn verify(&self, message: &[u8], public_key: &[u8], signature: &[u8]) -> bool {
        let key_bytes: [u8; 32] = match public_key.try_into() {
            Ok(bytes) => bytes,
            Err(_) => return false,
        };
        let verifying_key = match VerifyingKey::from_bytes(&key_bytes) {
            Ok(key) => key,
            Err(_) => return false,
        };
        let dalek_sig = match DalekSignature::from_slice(signature) {
            Ok(sig) => sig,
            Err(_) => return false,
        };

        verifying_key.verify(message, &dalek_sig).is_ok()
    }

    fn digest(&self, message: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(message);
        hex::encode(hasher.finalize())
    }

    fn public_key(&self, secret_key: &[u8]) -> Result<Vec<u8>> {
        let signing_key = Self::signing_key(secret_key)?;
        Ok(signing_key.verifying_key().to_bytes().to_vec())
    }

    fn name(&self) -> &'static str {
        "ed25519-sha256"
    }
}

/// Verify a hex-encoded signature over a string message
///
/// Malformed hex is treated as a failed verification.
pub fn verify_hex(
    provider: &dyn SignatureProvider,
    message: &str,
    public_key: &str,
    signature: &str,
) -> bool {
    let (Ok(key), Ok(sig)) = (hex::decode(public_key), hex::decode(signature)) else {
        return false;
    };
    provider.verify(message.as_bytes(), &key, &sig)
}

/// Digest of a string message
pub fn digest(provider: &dyn SignatureProvider, message: &str) -> String {
    provider.digest(message.as_bytes())
}

/// A validator's or account holder's signing identity
#[derive(Clone)]
pub struct NodeIdentity {
    provider: Arc<dyn SignatureProvider>,
    secret_key: Vec<u8>,
    public_key: PublicKey,
}

impl NodeIdentity {
    /// Build an identity from raw secret key material
    pub fn new(provider: Arc<dyn SignatureProvider>, secret_key: Vec<u8>) -> Result<Self> {
        let public_key = hex::encode(provider.public_key(&secret_key)?);
        Ok(Self {
            provider,
            secret_key,
            public_key,
        })
    }

    /// Build an identity from a hex-encoded secret key
    pub fn from_hex(provider: Arc<dyn SignatureProvider>, secret_key_hex: &str) -> Result<Self> {
        let secret_key = hex::decode(secret_key_hex.trim())
            .map_err(|e| Error::Configuration(format!("Invalid secret key hex: {}", e)))?;
        Self::new(provider, secret_key)
    }

    /// Deterministic Ed25519 identity from a 32 byte seed
    pub fn ed25519_from_seed(seed: [u8; 32]) -> Self {
        let provider: Arc<dyn SignatureProvider> = Arc::new(Ed25519Provider);
        let public_key = hex::encode(SigningKey::from_bytes(&seed).verifying_key().to_bytes());
        Self {
            provider,
            secret_key: seed.to_vec(),
            public_key,
        }
    }

    /// Fresh random Ed25519 identity
    pub fn generate_ed25519() -> Self {
        Self::ed25519_from_seed(rand::random::<[u8; 32]>())
    }

    /// Hex-encoded public key
    pub fn public_key(&self) -> &PublicKey {
        &self.public_key
    }

    /// Hex-encoded secret key (handle with care)
    pub fn secret_key_hex(&self) -> String {
        hex::encode(&self.secret_key)
    }

    /// Shared provider handle
    pub fn provider(&self) -> &Arc<dyn SignatureProvider> {
        &self.provider
    }

    /// Sign a string message, returning the hex signature
    pub fn sign(&self, message: &str) -> Result<String> {
        let signature = self.provider.sign(message.as_bytes(), &self.secret_key)?;
        Ok(hex::encode(signature))
    }

    /// Sign and wrap as a [`Signature`]; `bind_message` keeps the message inside
    pub fn signature(&self, message: &str, bind_message: bool) -> Result<Signature> {
        let signature_value = self.sign(message)?;
        Ok(Signature {
            public_key: self.public_key.clone(),
            message_value: if bind_message {
                message.to_string()
            } else {
                String::new()
            },
            signature_value,
        })
    }
}

impl fmt::Debug for NodeIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeIdentity")
            .field("scheme", &self.provider.name())
            .field("public_key", &self.public_key)
            .finish_non_exhaustive()
    }
}
