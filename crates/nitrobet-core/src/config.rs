//! Protocol constants and client configuration.

use crate::Address;
use serde::{Deserialize, Serialize};
use std::time::Duration;

pub const DEFAULT_CLEARNODE_URL: &str = "wss://clearnet.yellow.com/ws";

pub const CONNECT_TIMEOUT_MS: u64 = 40_000;
pub const AUTH_CHALLENGE_TIMEOUT_MS: u64 = 40_000;
pub const CHANNEL_UPDATE_TIMEOUT_MS: u64 = 60_000;
pub const BALANCE_UPDATE_TIMEOUT_MS: u64 = 30_000;
pub const APP_SESSION_UPDATE_TIMEOUT_MS: u64 = 15_000;

/// Lower bound accepted by the adjudicator, in seconds.
pub const MIN_CHALLENGE_DURATION_SECS: u64 = 3_600;
pub const APP_SESSION_QUORUM: u32 = 2;
/// Signing weights of the player and the dealer in a game session.
pub const APP_SESSION_WEIGHTS: [u32; 2] = [1, 1];
pub const AUTH_SESSION_DURATION_SECS: u64 = 3_600;

pub const APP_PROTOCOL: &str = "NitroRPC/0.4";

/// Client configuration. Every field has a default.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub clearnode_url: String,
    /// Name presented during authentication.
    pub application: String,
    /// App name used for game sessions.
    pub game_application: String,
    pub scope: String,
    pub auth_session_secs: u64,
    pub chain_id: u64,
    pub token: Address,
    /// Asset symbol used inside app sessions.
    pub asset: String,
    pub custody: Address,
    pub adjudicator: Address,
    pub dealer: Address,
    pub challenge_secs: u64,
    pub quorum: u32,
    pub connect_timeout_ms: u64,
    pub auth_challenge_timeout_ms: u64,
    pub channel_update_timeout_ms: u64,
    pub balance_update_timeout_ms: u64,
    pub app_session_update_timeout_ms: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            clearnode_url: DEFAULT_CLEARNODE_URL.to_string(),
            application: "Omikuji".to_string(),
            game_application: "omikuji".to_string(),
            scope: "trading".to_string(),
            auth_session_secs: AUTH_SESSION_DURATION_SECS,
            chain_id: 8453,
            token: fixed("0x833589fcd6edb6e08f4c7c32d4f71b54bda02913"),
            asset: "usdc".to_string(),
            custody: fixed("0x490fb189dde3a01b00be9ba5f41e3447fbc838b6"),
            adjudicator: fixed("0x7de4a0736cf5740fd3ca2f2e9cc85c9ac223ef0c"),
            dealer: fixed("0xde8792e863d73c751e07c4a88a600d2c5ab0ff74"),
            challenge_secs: MIN_CHALLENGE_DURATION_SECS,
            quorum: APP_SESSION_QUORUM,
            connect_timeout_ms: CONNECT_TIMEOUT_MS,
            auth_challenge_timeout_ms: AUTH_CHALLENGE_TIMEOUT_MS,
            channel_update_timeout_ms: CHANNEL_UPDATE_TIMEOUT_MS,
            balance_update_timeout_ms: BALANCE_UPDATE_TIMEOUT_MS,
            app_session_update_timeout_ms: APP_SESSION_UPDATE_TIMEOUT_MS,
        }
    }
}

fn fixed(s: &str) -> Address {
    s.parse().unwrap_or_else(|_| Address::zero())
}

impl ClientConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn auth_challenge_timeout(&self) -> Duration {
        Duration::from_millis(self.auth_challenge_timeout_ms)
    }

    pub fn channel_update_timeout(&self) -> Duration {
        Duration::from_millis(self.channel_update_timeout_ms)
    }

    pub fn balance_update_timeout(&self) -> Duration {
        Duration::from_millis(self.balance_update_timeout_ms)
    }

    pub fn app_session_update_timeout(&self) -> Duration {
        Duration::from_millis(self.app_session_update_timeout_ms)
    }

    /// Check values the protocol refuses.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.challenge_secs < MIN_CHALLENGE_DURATION_SECS {
            return Err(ConfigError::ChallengeTooShort(self.challenge_secs));
        }
        if self.quorum == 0 {
            return Err(ConfigError::ZeroQuorum);
        }
        let total: u32 = APP_SESSION_WEIGHTS.iter().sum();
        if self.quorum > total {
            return Err(ConfigError::QuorumUnreachable {
                quorum: self.quorum,
                total,
            });
        }
        if self.clearnode_url.is_empty() {
            return Err(ConfigError::MissingUrl);
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("challenge duration must be at least {MIN_CHALLENGE_DURATION_SECS}s, got {0}s")]
    ChallengeTooShort(u64),
    #[error("quorum must be at least 1")]
    ZeroQuorum,
    #[error("quorum {quorum} exceeds the total signing weight {total}")]
    QuorumUnreachable { quorum: u32, total: u32 },
    #[error("clearnode url is empty")]
    MissingUrl,
}
