//! Signing oracle interface.
//!
//! The wallet is external. The client hands it a [`SignRequest`] and receives a
//! hex signature or a rejection.

use async_trait::async_trait;
use nitrobet_core::message::Allowance;
use nitrobet_core::{Address, ChannelId, ChannelState};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Typed payload signed to answer an auth challenge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthPolicy {
    pub challenge: String,
    pub scope: String,
    pub wallet: Address,
    pub session_key: Address,
    pub application: String,
    pub expires_at: u64,
    pub allowances: Vec<Allowance>,
}

/// What the signer is asked to sign.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SignRequest {
    /// Auth challenge answer.
    Auth(AuthPolicy),
    /// Canonical bytes of an RPC `req` tuple, hex encoded.
    Rpc { payload: String },
    /// A channel state to be submitted on-chain.
    ChannelState {
        channel_id: ChannelId,
        state: ChannelState,
    },
    /// Canonical app-session payload (close or update).
    AppState { payload: String },
}

impl SignRequest {
    pub fn rpc(bytes: &[u8]) -> Self {
        Self::Rpc {
            payload: hex::encode(bytes),
        }
    }

    /// Deterministic byte encoding of the request.
    pub fn canonical_bytes(&self) -> Vec<u8> {
        serde_json::to_vec(self).unwrap_or_default()
    }
}

/// A hex signature (`0x...`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Signature(pub String);

impl Signature {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SignError {
    #[error("user rejected the signature request")]
    Rejected,
    #[error("signer failed: {0}")]
    Failed(String),
}

#[async_trait]
pub trait Signer: Send + Sync {
    /// The address this signer signs for.
    fn address(&self) -> Address;

    async fn sign(&self, request: &SignRequest) -> Result<Signature, SignError>;
}

/// Development signer: sha256 over a local secret and the request bytes.
///
/// Trusts the connection the same way a `local:` identity would; it proves
/// nothing cryptographically and exists for tests and local runs.
#[derive(Debug, Clone)]
pub struct LocalSigner {
    address: Address,
    secret: Vec<u8>,
    reject: bool,
}

impl LocalSigner {
    pub fn new(address: Address, secret: impl Into<Vec<u8>>) -> Self {
        Self {
            address,
            secret: secret.into(),
            reject: false,
        }
    }

    /// A signer that refuses every request.
    pub fn rejecting(address: Address) -> Self {
        Self {
            address,
            secret: Vec::new(),
            reject: true,
        }
    }
}

#[async_trait]
impl Signer for LocalSigner {
    fn address(&self) -> Address {
        self.address.clone()
    }

    async fn sign(&self, request: &SignRequest) -> Result<Signature, SignError> {
        if self.reject {
            return Err(SignError::Rejected);
        }
        let mut hasher = Sha256::new();
        hasher.update(&self.secret);
        hasher.update(request.canonical_bytes());
        Ok(Signature(format!("0x{}", hex::encode(hasher.finalize()))))
    }
}
