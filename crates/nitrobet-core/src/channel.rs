//! Funding channel records.

use crate::{Address, Amount, ChannelId};
use serde::{Deserialize, Serialize};

/// One participant's share of a channel state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Allocation {
    pub destination: Address,
    pub token: Address,
    pub amount: Amount,
}

/// Local view of a channel's status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelStatus {
    Pending,
    Active,
    Closed,
    Challenged,
}

/// Channel status as reported by the clearnode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RemoteChannelStatus {
    Joining,
    Open,
    Resizing,
    Closed,
    Challenged,
}

impl From<RemoteChannelStatus> for ChannelStatus {
    fn from(status: RemoteChannelStatus) -> Self {
        match status {
            RemoteChannelStatus::Joining => ChannelStatus::Pending,
            RemoteChannelStatus::Open | RemoteChannelStatus::Resizing => ChannelStatus::Active,
            RemoteChannelStatus::Closed => ChannelStatus::Closed,
            RemoteChannelStatus::Challenged => ChannelStatus::Challenged,
        }
    }
}

/// Purpose of a signed channel state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StateIntent {
    Initialize,
    Operate,
    Resize,
    Finalize,
}

/// A versioned channel state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelState {
    pub intent: StateIntent,
    pub version: u64,
    #[serde(default)]
    pub state_data: String,
    pub allocations: Vec<Allocation>,
}

/// Fixed parameters of a channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelDefinition {
    pub participants: Vec<Address>,
    pub adjudicator: Address,
    /// Challenge period in seconds.
    pub challenge: u64,
    pub nonce: u64,
}

/// A channel state countersigned by the clearnode.
///
/// Returned by `create_channel`, `resize_channel` and `close_channel`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignedChannelState {
    pub channel_id: ChannelId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel: Option<ChannelDefinition>,
    pub state: ChannelState,
    pub server_signature: String,
}

/// Channel summary, used both by `get_channels` and the `cu` push.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelInfo {
    pub channel_id: ChannelId,
    pub participant: Address,
    pub status: RemoteChannelStatus,
    pub token: Address,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wallet: Option<String>,
    pub amount: Amount,
    pub chain_id: u64,
    pub adjudicator: Address,
    pub challenge: u64,
    pub nonce: u64,
    pub version: u64,
    #[serde(default)]
    pub created_at: String,
    #[serde(default)]
    pub updated_at: String,
}

/// The client's record of its funding channel.
#[derive(Debug, Clone, PartialEq)]
pub struct Channel {
    pub channel_id: ChannelId,
    pub participants: Vec<Address>,
    pub allocations: Vec<Allocation>,
    pub token: Address,
    pub status: ChannelStatus,
    pub version: u64,
    /// Last raw payload received from the clearnode for this channel.
    pub data: serde_json::Value,
}

impl Channel {
    /// Build from a clearnode-confirmed state.
    pub fn from_signed_state(signed: &SignedChannelState, token: Address) -> Self {
        let participants = match &signed.channel {
            Some(def) => def.participants.clone(),
            None => signed
                .state
                .allocations
                .iter()
                .map(|a| a.destination.clone())
                .collect(),
        };
        Self {
            channel_id: signed.channel_id.clone(),
            participants,
            allocations: signed.state.allocations.clone(),
            token,
            status: ChannelStatus::Active,
            version: signed.state.version,
            data: serde_json::to_value(signed).unwrap_or(serde_json::Value::Null),
        }
    }

    /// Build from a channel summary (used when reusing a persisted channel).
    pub fn from_info(info: &ChannelInfo, broker: &Address) -> Self {
        Self {
            channel_id: info.channel_id.clone(),
            participants: vec![info.participant.clone(), broker.clone()],
            allocations: vec![
                Allocation {
                    destination: info.participant.clone(),
                    token: info.token.clone(),
                    amount: info.amount,
                },
                Allocation {
                    destination: broker.clone(),
                    token: info.token.clone(),
                    amount: Amount::ZERO,
                },
            ],
            token: info.token.clone(),
            status: info.status.into(),
            version: info.version,
            data: serde_json::to_value(info).unwrap_or(serde_json::Value::Null),
        }
    }

    /// Allocation held by `participant`, zero if absent.
    pub fn allocation_of(&self, participant: &Address) -> Amount {
        self.allocations
            .iter()
            .find(|a| &a.destination == participant)
            .map(|a| a.amount)
            .unwrap_or(Amount::ZERO)
    }

    /// Replace state with a newer confirmed one.
    pub fn apply_state(&mut self, state: &ChannelState) {
        self.allocations = state.allocations.clone();
        self.version = state.version;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(c: char) -> Address {
        format!("0x{}", c.to_string().repeat(40)).parse().unwrap()
    }

    #[test]
    fn remote_status_maps_to_local() {
        assert_eq!(ChannelStatus::from(RemoteChannelStatus::Open), ChannelStatus::Active);
        assert_eq!(ChannelStatus::from(RemoteChannelStatus::Joining), ChannelStatus::Pending);
        assert_eq!(ChannelStatus::from(RemoteChannelStatus::Closed), ChannelStatus::Closed);
    }

    #[test]
    fn decode_signed_state() {
        let raw = serde_json::json!({
            "channel_id": format!("0x{}", "1".repeat(64)),
            "state": {
                "intent": "initialize",
                "version": 1,
                "state_data": "0x",
                "allocations": [
                    { "destination": format!("0x{}", "a".repeat(40)), "token": format!("0x{}", "c".repeat(40)), "amount": "1000000" },
                    { "destination": format!("0x{}", "b".repeat(40)), "token": format!("0x{}", "c".repeat(40)), "amount": "0" }
                ]
            },
            "server_signature": "0xsig"
        });
        let signed: SignedChannelState = serde_json::from_value(raw).unwrap();
        let channel = Channel::from_signed_state(&signed, addr('c'));
        assert_eq!(channel.version, 1);
        assert_eq!(channel.participants, vec![addr('a'), addr('b')]);
        assert_eq!(channel.allocation_of(&addr('a')).raw(), 1_000_000);
        assert_eq!(channel.allocation_of(&addr('d')), Amount::ZERO);
    }
}
