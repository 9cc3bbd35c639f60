//! Client error taxonomy.

use nitrobet_core::DecodeError;
use std::time::Duration;

pub type Result<T, E = ClientError> = std::result::Result<T, E>;

#[derive(Debug, Clone, thiserror::Error)]
pub enum ClientError {
    #[error("could not connect to {url}: {reason}")]
    Connect { url: String, reason: String },

    #[error("not connected to the clearnode")]
    NotConnected,

    #[error("'{method}' timed out after {}ms", after.as_millis())]
    Timeout { method: String, after: Duration },

    #[error("clearnode rejected '{method}': {message}")]
    Remote { method: String, message: String },

    #[error("signature denied: {0}")]
    SignatureDenied(String),

    #[error("authentication rejected: {0}")]
    AuthRejected(String),

    #[error("cannot {operation} while {state}")]
    InvalidState {
        operation: &'static str,
        state: String,
    },

    #[error("quorum not met: signatures weigh {have}, need {need}")]
    QuorumNotMet { have: u32, need: u32 },

    #[error("on-chain transaction failed: {0}")]
    OnChain(String),

    #[error(transparent)]
    Decode(#[from] DecodeError),

    #[error("channel store: {0}")]
    Store(String),
}

impl ClientError {
    pub(crate) fn invalid_state(operation: &'static str, state: impl std::fmt::Debug) -> Self {
        Self::InvalidState {
            operation,
            state: format!("{state:?}"),
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    pub fn is_disconnect(&self) -> bool {
        matches!(self, Self::NotConnected)
    }
}
