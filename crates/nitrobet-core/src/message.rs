//! Wire frames and typed protocol messages.
//!
//! Outbound frames are `{ "req": [id, method, params, timestamp], "sig": [...] }`.
//! Inbound frames are `{ "res": [id, method, params, timestamp], "sig": [...] }`.
//! Replies reuse the request id; pushes carry a method tag (`cu`, `asu`, `bu`).

use crate::{
    Address, Amount, AppDefinition, AppSessionAllocation, AppSessionId, AppSessionStatus,
    AppSessionUpdate, ChannelId, ChannelInfo, RemoteChannelStatus, SignedChannelState,
};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Method tags.
pub mod method {
    pub const AUTH_REQUEST: &str = "auth_request";
    pub const AUTH_CHALLENGE: &str = "auth_challenge";
    pub const AUTH_VERIFY: &str = "auth_verify";
    pub const GET_CONFIG: &str = "get_config";
    pub const GET_CHANNELS: &str = "get_channels";
    pub const CREATE_CHANNEL: &str = "create_channel";
    pub const RESIZE_CHANNEL: &str = "resize_channel";
    pub const CLOSE_CHANNEL: &str = "close_channel";
    pub const CREATE_APP_SESSION: &str = "create_app_session";
    pub const SUBMIT_APP_STATE: &str = "submit_app_state";
    pub const CLOSE_APP_SESSION: &str = "close_app_session";
    pub const GET_APP_SESSIONS: &str = "get_app_sessions";
    pub const CHANNEL_UPDATE: &str = "cu";
    pub const APP_SESSION_UPDATE: &str = "asu";
    pub const BALANCE_UPDATE: &str = "bu";
    pub const ERROR: &str = "error";
}

/// The `[id, method, params, timestamp]` tuple.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcPayload(pub u64, pub String, pub Value, pub u64);

impl RpcPayload {
    pub fn new(id: u64, method: impl Into<String>, params: Value, timestamp: u64) -> Self {
        Self(id, method.into(), params, timestamp)
    }

    pub fn id(&self) -> u64 {
        self.0
    }

    pub fn method(&self) -> &str {
        &self.1
    }

    pub fn params(&self) -> &Value {
        &self.2
    }

    pub fn timestamp(&self) -> u64 {
        self.3
    }

    /// Canonical bytes covered by a request signature.
    pub fn signing_bytes(&self) -> Vec<u8> {
        serde_json::to_vec(self).unwrap_or_default()
    }
}

/// Client to clearnode frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestFrame {
    pub req: RpcPayload,
    #[serde(default)]
    pub sig: Vec<String>,
}

/// Clearnode to client frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseFrame {
    pub res: RpcPayload,
    #[serde(default)]
    pub sig: Vec<String>,
}

impl ResponseFrame {
    pub fn new(id: u64, method: impl Into<String>, params: Value, timestamp: u64) -> Self {
        Self {
            res: RpcPayload::new(id, method, params, timestamp),
            sig: Vec::new(),
        }
    }

    pub fn error(id: u64, message: impl Into<String>, timestamp: u64) -> Self {
        Self::new(
            id,
            method::ERROR,
            serde_json::json!({ "error": message.into() }),
            timestamp,
        )
    }

    /// Decode a raw text frame.
    pub fn parse(raw: &str) -> Result<Self, DecodeError> {
        serde_json::from_str(raw).map_err(|e| DecodeError::Frame(e.to_string()))
    }

    /// The remote error message, if this frame reports one.
    pub fn error_message(&self) -> Option<String> {
        let params = self.res.params();
        match params.get("error") {
            Some(Value::String(s)) => Some(s.clone()),
            Some(other) => Some(other.to_string()),
            None if self.res.method() == method::ERROR => Some(params.to_string()),
            None => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Request params
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Allowance {
    pub asset: String,
    pub amount: Amount,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthRequestParams {
    pub address: Address,
    pub session_key: Address,
    pub application: String,
    pub scope: String,
    /// Unix seconds at which the requested session expires.
    pub expires_at: u64,
    #[serde(default)]
    pub allowances: Vec<Allowance>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthVerifyParams {
    pub challenge: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetChannelsParams {
    pub participant: Address,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<RemoteChannelStatus>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateChannelParams {
    pub chain_id: u64,
    pub token: Address,
    pub amount: Amount,
    pub allocations: Vec<crate::Allocation>,
    /// Challenge period in seconds.
    pub challenge: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResizeChannelParams {
    pub channel_id: ChannelId,
    /// Amount moved between custody and the channel; negative withdraws.
    pub resize_amount: i64,
    /// Amount moved between the channel and the unified balance; negative deallocates.
    pub allocate_amount: i64,
    pub funds_destination: Address,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CloseChannelParams {
    pub channel_id: ChannelId,
    pub funds_destination: Address,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreateAppSessionParams {
    pub definition: AppDefinition,
    pub allocations: Vec<AppSessionAllocation>,
    #[serde(default)]
    pub session_data: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubmitAppStateParams {
    pub app_session_id: AppSessionId,
    pub version: u64,
    pub allocations: Vec<AppSessionAllocation>,
    #[serde(default)]
    pub session_data: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CloseAppSessionParams {
    pub app_session_id: AppSessionId,
    pub allocations: Vec<AppSessionAllocation>,
    #[serde(default)]
    pub session_data: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetAppSessionsParams {
    pub participant: Address,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub app_session_id: Option<AppSessionId>,
}

// ---------------------------------------------------------------------------
// Inbound payloads
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthChallenge {
    pub challenge_message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthVerifyResult {
    pub success: bool,
    pub address: Address,
    pub session_key: Address,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jwt_token: Option<String>,
    /// Unix seconds.
    pub expires_at: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BrokerConfig {
    pub broker_address: Address,
    #[serde(default)]
    pub supported_chains: Vec<u64>,
    #[serde(default)]
    pub supported_tokens: Vec<Address>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelList {
    pub channels: Vec<ChannelInfo>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppSessionReply {
    pub app_session_id: AppSessionId,
    pub version: u64,
    pub status: AppSessionStatus,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppSessionList {
    pub app_sessions: Vec<AppSessionUpdate>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BalanceEntry {
    pub asset: String,
    pub amount: Amount,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BalanceUpdate {
    pub balance_updates: Vec<BalanceEntry>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteErrorPayload {
    pub error: String,
}

/// An inbound message, discriminated by its method tag.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerMessage {
    AuthChallenge(AuthChallenge),
    AuthVerify(AuthVerifyResult),
    Config(BrokerConfig),
    Channels(ChannelList),
    /// Reply to `create_channel`, `resize_channel` or `close_channel`.
    ChannelState(SignedChannelState),
    /// Reply to `create_app_session`, `submit_app_state` or `close_app_session`.
    AppSession(AppSessionReply),
    AppSessions(AppSessionList),
    ChannelUpdate(ChannelInfo),
    AppSessionUpdate(AppSessionUpdate),
    BalanceUpdate(BalanceUpdate),
    Error(RemoteErrorPayload),
    /// A method tag this client does not know.
    Unknown { method: String, params: Value },
}

impl ServerMessage {
    /// Validate `params` against the shape implied by `method`.
    pub fn decode(method_tag: &str, params: Value) -> Result<Self, DecodeError> {
        if let Some(error) = params.get("error") {
            let error = match error {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            return Ok(Self::Error(RemoteErrorPayload { error }));
        }

        Ok(match method_tag {
            method::AUTH_CHALLENGE => Self::AuthChallenge(field(method_tag, params)?),
            method::AUTH_VERIFY => Self::AuthVerify(field(method_tag, params)?),
            method::GET_CONFIG => Self::Config(field(method_tag, params)?),
            method::GET_CHANNELS => Self::Channels(field(method_tag, params)?),
            method::CREATE_CHANNEL | method::RESIZE_CHANNEL | method::CLOSE_CHANNEL => {
                Self::ChannelState(field(method_tag, params)?)
            }
            method::CREATE_APP_SESSION | method::SUBMIT_APP_STATE | method::CLOSE_APP_SESSION => {
                Self::AppSession(field(method_tag, params)?)
            }
            method::GET_APP_SESSIONS => Self::AppSessions(field(method_tag, params)?),
            method::CHANNEL_UPDATE => Self::ChannelUpdate(field(method_tag, params)?),
            method::APP_SESSION_UPDATE => Self::AppSessionUpdate(field(method_tag, params)?),
            method::BALANCE_UPDATE => Self::BalanceUpdate(field(method_tag, params)?),
            method::ERROR => Self::Error(RemoteErrorPayload {
                error: params.to_string(),
            }),
            other => Self::Unknown {
                method: other.to_string(),
                params,
            },
        })
    }
}

/// Whether `method_tag` names an unsolicited push. Pushes are never replies.
pub fn is_push(method_tag: &str) -> bool {
    matches!(
        method_tag,
        method::CHANNEL_UPDATE | method::APP_SESSION_UPDATE | method::BALANCE_UPDATE
    )
}

fn field<T: DeserializeOwned>(method_tag: &str, params: Value) -> Result<T, DecodeError> {
    serde_json::from_value(params).map_err(|e| DecodeError::Payload {
        method: method_tag.to_string(),
        reason: e.to_string(),
    })
}

/// Error decoding an inbound frame.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    #[error("malformed frame: {0}")]
    Frame(String),
    #[error("malformed '{method}' payload: {reason}")]
    Payload { method: String, reason: String },
}
