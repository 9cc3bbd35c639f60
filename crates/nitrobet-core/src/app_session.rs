//! App sessions: the off-chain game ledger layered on a funding channel.

use crate::{Address, Amount, AppSessionId, ChannelId};
use serde::{Deserialize, Serialize};

/// A participant's share of one asset inside an app session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppSessionAllocation {
    pub asset: String,
    pub amount: Amount,
    pub participant: Address,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AppSessionStatus {
    #[default]
    Open,
    Closed,
}

/// Fixed parameters of an app session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppDefinition {
    pub protocol: String,
    pub participants: Vec<Address>,
    pub weights: Vec<u32>,
    pub quorum: u32,
    /// Challenge period in seconds.
    pub challenge: u64,
    pub nonce: u64,
    pub application: String,
}

impl AppDefinition {
    /// Signing weight of `participant`, zero for non-participants.
    pub fn weight_of(&self, participant: &Address) -> u32 {
        self.participants
            .iter()
            .position(|p| p == participant)
            .and_then(|i| self.weights.get(i).copied())
            .unwrap_or(0)
    }
}

/// The client's record of its app session.
#[derive(Debug, Clone, PartialEq)]
pub struct AppSession {
    pub app_session_id: AppSessionId,
    pub channel_id: ChannelId,
    pub participants: Vec<Address>,
    pub allocations: Vec<AppSessionAllocation>,
    pub version: u64,
    pub status: AppSessionStatus,
}

impl AppSession {
    /// Amount of `asset` allocated to `participant`.
    pub fn allocation_of(&self, participant: &Address, asset: &str) -> Amount {
        allocation_of(&self.allocations, participant, asset)
    }
}

pub fn allocation_of(
    allocations: &[AppSessionAllocation],
    participant: &Address,
    asset: &str,
) -> Amount {
    allocations
        .iter()
        .find(|a| &a.participant == participant && a.asset == asset)
        .map(|a| a.amount)
        .unwrap_or(Amount::ZERO)
}

/// The `asu` push, also the record shape returned by `get_app_sessions`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppSessionUpdate {
    pub app_session_id: AppSessionId,
    pub version: u64,
    #[serde(default)]
    pub session_data: String,
    pub participant_allocations: Vec<AppSessionAllocation>,
    #[serde(default)]
    pub status: AppSessionStatus,
}

/// A single bet, carried as session data of an app-state update.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GameMove {
    pub cell_id: String,
    pub target_price: f64,
    pub bet_amount: Amount,
    pub multiplier: f64,
    #[serde(rename = "pythPriceId")]
    pub price_feed_id: String,
    /// Client timestamp, milliseconds since the epoch.
    pub timestamp: u64,
}

/// How a move settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MoveOutcome {
    Won,
    Lost,
}

/// Session data attached to an app-state update.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MoveRecord {
    #[serde(rename = "move")]
    pub game_move: GameMove,
    pub outcome: MoveOutcome,
}

/// Error computing the allocation change of a move.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SettleError {
    #[error("multiplier must be a finite value >= 1, got {0}")]
    BadMultiplier(String),
    #[error("{who} allocation of {have} cannot cover {need}")]
    Insufficient {
        who: &'static str,
        have: Amount,
        need: Amount,
    },
    #[error("bet amount must be positive")]
    ZeroBet,
    #[error("{who} allocation of {have} overflows when credited {credit}")]
    Overflow {
        who: &'static str,
        have: Amount,
        credit: Amount,
    },
}

/// Compute the allocations after settling `game_move` between player and dealer.
///
/// A loss moves the bet from player to dealer. A win moves
/// `bet * (multiplier - 1)` from dealer to player.
pub fn settle_move(
    allocations: &[AppSessionAllocation],
    asset: &str,
    player: &Address,
    dealer: &Address,
    game_move: &GameMove,
    outcome: MoveOutcome,
) -> Result<Vec<AppSessionAllocation>, SettleError> {
    if game_move.bet_amount == Amount::ZERO {
        return Err(SettleError::ZeroBet);
    }

    let player_has = allocation_of(allocations, player, asset);
    let dealer_has = allocation_of(allocations, dealer, asset);

    let (player_after, dealer_after) = match outcome {
        MoveOutcome::Lost => {
            let bet = game_move.bet_amount;
            let player_after = player_has.checked_sub(bet).ok_or(SettleError::Insufficient {
                who: "player",
                have: player_has,
                need: bet,
            })?;
            let dealer_after = dealer_has.checked_add(bet).ok_or(SettleError::Overflow {
                who: "dealer",
                have: dealer_has,
                credit: bet,
            })?;
            (player_after, dealer_after)
        }
        MoveOutcome::Won => {
            let m = game_move.multiplier;
            if !m.is_finite() || m < 1.0 {
                return Err(SettleError::BadMultiplier(m.to_string()));
            }
            let hundredths = ((m - 1.0) * 100.0).round() as u64;
            let profit = game_move
                .bet_amount
                .scale_hundredths(hundredths)
                .ok_or_else(|| SettleError::BadMultiplier(m.to_string()))?;
            let dealer_after = dealer_has.checked_sub(profit).ok_or(SettleError::Insufficient {
                who: "dealer",
                have: dealer_has,
                need: profit,
            })?;
            let player_after = player_has.checked_add(profit).ok_or(SettleError::Overflow {
                who: "player",
                have: player_has,
                credit: profit,
            })?;
            (player_after, dealer_after)
        }
    };

    let mut next: Vec<AppSessionAllocation> = allocations
        .iter()
        .filter(|a| a.asset != asset || (&a.participant != player && &a.participant != dealer))
        .cloned()
        .collect();
    next.push(AppSessionAllocation {
        asset: asset.to_string(),
        amount: player_after,
        participant: player.clone(),
    });
    next.push(AppSessionAllocation {
        asset: asset.to_string(),
        amount: dealer_after,
        participant: dealer.clone(),
    });
    Ok(next)
}
