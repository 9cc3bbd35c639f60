//! Client for a Nitrolite clearnode.
//!
//! A [`Session`] owns one WebSocket connection and everything bound to it:
//!
//! - [`Correlator`] pairs replies with requests and hands pushes to the [`Router`].
//! - [`AuthHandshake`] proves control of the wallet.
//! - [`ChannelManager`] drives the funding channel through its lifecycle.
//! - [`AppSessionManager`] keeps the per-move game ledger.
//!
//! Wallet, chain and persistence are external and reached through the
//! [`Signer`], [`ChainClient`] and [`ChannelStore`] traits.

mod app_session;
mod auth;
mod chain;
mod channel;
mod correlator;
mod error;
mod router;
mod session;
mod signer;
mod store;
mod transport;

pub use app_session::{
    AppPhase, AppSessionManager, AppSessionSnapshot, ParticipantSignature, PendingMove,
};
pub use auth::{AuthFailure, AuthHandshake, AuthParams, AuthSession, AuthState};
pub use chain::{ChainCall, ChainClient, ChainError, SimulatedChain, TxReceipt};
pub use channel::{ChannelManager, ChannelPhase, ChannelSnapshot, StartOutcome};
pub use correlator::{Correlator, Dispatch};
pub use error::{ClientError, Result};
pub use router::{Balances, Notification, Router};
pub use session::Session;
pub use signer::{AuthPolicy, LocalSigner, SignError, SignRequest, Signature, Signer};
pub use store::{ChannelStore, MemoryStore, StoreError, StoredChannel};
pub use transport::{Transport, TransportEvent};

// Re-export so dependents need only one crate.
pub use async_trait::async_trait;
pub use nitrobet_core as core;

/// Result of offering a pushed update to its manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// Strictly newer version; local state now reflects it.
    Applied,
    /// Version at or below the held one; discarded.
    Stale,
    /// Not about anything this client holds.
    Ignored,
}
