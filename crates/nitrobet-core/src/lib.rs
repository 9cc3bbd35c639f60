//! Core types for the nitrobet state-channel client.
//!
//! This crate provides the protocol primitives: identifiers, amounts, channel and
//! app-session records, and the wire framing. The lifecycle logic lives in
//! `nitrobet-client`.

mod address;
mod amount;
mod app_session;
mod channel;
pub mod config;
pub mod message;

pub use address::{Address, AddressParseError, AppSessionId, ChannelId, HexId};
pub use amount::{Amount, AmountParseError, USD_DECIMALS};
pub use app_session::{
    AppDefinition, AppSession, AppSessionAllocation, AppSessionStatus, AppSessionUpdate,
    GameMove, MoveOutcome, MoveRecord, SettleError, allocation_of, settle_move,
};
pub use channel::{
    Allocation, Channel, ChannelDefinition, ChannelInfo, ChannelState, ChannelStatus,
    RemoteChannelStatus, SignedChannelState, StateIntent,
};
pub use config::{ClientConfig, ConfigError};
pub use message::{DecodeError, RequestFrame, ResponseFrame, RpcPayload, ServerMessage};

/// Connection lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Establishing connection.
    Connecting,
    /// Open and usable.
    Open,
    /// Closed, by either side.
    Closed,
}

/// Milliseconds since the Unix epoch.
pub fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
