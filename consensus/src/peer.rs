//! Peer RPC client
//!
//! The node talks to other validators only through [`PeerClient`], so the
//! round protocol can run over HTTP or over an in-process network in tests.

use crate::join::AuthenticationRequest;
use crate::{Error, Result};
use async_trait::async_trait;
use ledger_core::{LedgerSnapshot, PublicKey, TransportEnvelope};
use reqwest::StatusCode;
use std::time::Duration;

/// Calls one validator can make on another
#[async_trait]
pub trait PeerClient: Send + Sync {
    /// The envelope `peer` currently publishes, if it publishes one
    async fn current_envelope(&self, peer: &str) -> Result<Option<TransportEnvelope>>;

    /// Join challenge of `peer`
    async fn request_challenge(&self, peer: &str) -> Result<String>;

    /// Ask `peer` to admit the requesting candidate
    async fn authenticate(&self, peer: &str, request: &AuthenticationRequest) -> Result<bool>;

    /// Hand `peer` a snapshot to initialize from
    async fn push_snapshot(&self, peer: &str, snapshot: &LedgerSnapshot) -> Result<()>;

    /// Public key `peer` claims
    async fn who_am_i(&self, peer: &str) -> Result<PublicKey>;
}

/// Base URL for a connection string: `http://` added when no scheme is
/// given, trailing slashes removed
pub fn base_url(connection_string: &str) -> String {
    let trimmed = connection_string.trim().trim_end_matches('/');
    if trimmed.contains("://") {
        trimmed.to_string()
    } else {
        format!("http://{}", trimmed)
    }
}

/// JSON-over-HTTP peer client
#[derive(Debug, Clone)]
pub struct HttpPeerClient {
    client: reqwest::Client,
}

impl HttpPeerClient {
    /// Client whose requests give up after `timeout`
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { client })
    }

    fn url(peer: &str, path: &str) -> String {
        format!("{}/peer/{}", base_url(peer), path)
    }

    fn check_status(peer: &str, status: StatusCode) -> Result<()> {
        if status.is_success() {
            Ok(())
        } else {
            Err(Error::network(peer, format!("status {}", status)))
        }
    }
}

#[async_trait]
impl PeerClient for HttpPeerClient {
    async fn current_envelope(&self, peer: &str) -> Result<Option<TransportEnvelope>> {
        let response = self.client.get(Self::url(peer, "envelope")).send().await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        Self::check_status(peer, response.status())?;
        Ok(Some(response.json().await?))
    }

    async fn request_challenge(&self, peer: &str) -> Result<String> {
        let response = self.client.get(Self::url(peer, "challenge")).send().await?;
        Self::check_status(peer, response.status())?;
        Ok(response.text().await?)
    }

    async fn authenticate(&self, peer: &str, request: &AuthenticationRequest) -> Result<bool> {
        let response = self
            .client
            .post(Self::url(peer, "authenticate"))
            .json(request)
            .send()
            .await?;
        Self::check_status(peer, response.status())?;
        Ok(response.json().await?)
    }

    async fn push_snapshot(&self, peer: &str, snapshot: &LedgerSnapshot) -> Result<()> {
        let response = self
            .client
            .post(Self::url(peer, "snapshot"))
            .json(snapshot)
            .send()
            .await?;
        Self::check_status(peer, response.status())
    }

    async fn who_am_i(&self, peer: &str) -> Result<PublicKey> {
        let response = self.client.get(Self::url(peer, "whoami")).send().await?;
        Self::check_status(peer, response.status())?;
        Ok(response.text().await?.trim().to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base_url_normalization() {
        assert_eq!(base_url("10.0.0.1:8080"), "http://10.0.0.1:8080");
        assert_eq!(base_url("http://10.0.0.1:8080/"), "http://10.0.0.1:8080");
        assert_eq!(base_url(" https://10.0.0.1// "), "https://10.0.0.1");
    }

    #[test]
    fn test_urls() {
        assert_eq!(
            HttpPeerClient::url("10.0.0.1:8080/", "envelope"),
            "http://10.0.0.1:8080/peer/envelope"
        );
    }
}
