//! Clearnode-side bookkeeping: channels, app sessions, balances.

use nitrobet_core::message::{
    AppSessionList, AppSessionReply, AuthChallenge, AuthRequestParams, AuthVerifyResult,
    BalanceEntry, BalanceUpdate, BrokerConfig, ChannelList, CloseAppSessionParams,
    CloseChannelParams, CreateAppSessionParams, CreateChannelParams, GetAppSessionsParams,
    GetChannelsParams, ResizeChannelParams, SubmitAppStateParams, method,
};
use nitrobet_core::{
    Address, Allocation, Amount, AppDefinition, AppSessionId, AppSessionStatus, AppSessionUpdate,
    ChannelDefinition, ChannelId, ChannelInfo, ChannelState, RemoteChannelStatus, RequestFrame,
    ResponseFrame, SignedChannelState, StateIntent,
};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::{HashMap, HashSet};

/// Runtime knobs for exercising client failure paths.
#[derive(Debug, Clone)]
pub struct Behavior {
    pub broker: Address,
    pub asset: String,
    /// Refuse every `auth_verify`.
    pub reject_auth: bool,
    /// Methods that are processed but never answered.
    pub silent: HashSet<String>,
    /// Channels known before any client connects.
    pub channels: Vec<ChannelInfo>,
    /// Lifetime of an issued auth session, in seconds.
    pub session_secs: u64,
}

impl Default for Behavior {
    fn default() -> Self {
        Self {
            broker: "0xb40e0000000000000000000000000000000000b4"
                .parse()
                .unwrap_or_else(|_| Address::zero()),
            asset: "usdc".to_string(),
            reject_auth: false,
            silent: HashSet::new(),
            channels: Vec::new(),
            session_secs: 3600,
        }
    }
}

/// Per-connection state.
#[derive(Debug, Default)]
pub struct Peer {
    challenge: Option<(String, Address, Address)>,
    pub authenticated: Option<Address>,
}

struct SimChannel {
    info: ChannelInfo,
    state: ChannelState,
}

struct SimAppSession {
    definition: AppDefinition,
    record: AppSessionUpdate,
    /// Channel whose funds back the session, and the amount the opener put in.
    funding: Option<(ChannelId, Amount)>,
}

/// Frames produced by one request.
#[derive(Debug, Default)]
pub struct Reply {
    pub response: Option<ResponseFrame>,
    pub pushes: Vec<ResponseFrame>,
}

pub struct Ledger {
    pub behavior: Behavior,
    channels: HashMap<ChannelId, SimChannel>,
    app_sessions: HashMap<AppSessionId, SimAppSession>,
    received: Vec<String>,
    next_id: u64,
}

type Handled = Result<(Value, Vec<ResponseFrame>), String>;

impl Ledger {
    pub fn new(behavior: Behavior) -> Self {
        let mut ledger = Self {
            channels: HashMap::new(),
            app_sessions: HashMap::new(),
            received: Vec::new(),
            next_id: 0,
            behavior,
        };
        for info in ledger.behavior.channels.clone() {
            let state = ChannelState {
                intent: StateIntent::Operate,
                version: info.version,
                state_data: String::new(),
                allocations: vec![
                    Allocation {
                        destination: info.participant.clone(),
                        token: info.token.clone(),
                        amount: info.amount,
                    },
                    Allocation {
                        destination: ledger.behavior.broker.clone(),
                        token: info.token.clone(),
                        amount: Amount::ZERO,
                    },
                ],
            };
            ledger.channels.insert(info.channel_id.clone(), SimChannel { info, state });
        }
        ledger
    }

    /// Method tags received so far, in order.
    pub fn received(&self) -> &[String] {
        &self.received
    }

    pub fn channel(&self, id: &ChannelId) -> Option<ChannelInfo> {
        self.channels.get(id).map(|c| c.info.clone())
    }

    pub fn app_session(&self, id: &AppSessionId) -> Option<AppSessionUpdate> {
        self.app_sessions.get(id).map(|s| s.record.clone())
    }

    fn fresh_id(&mut self) -> String {
        self.next_id += 1;
        format!("0x{:064x}", 0xc1ea_0000_u64 + self.next_id)
    }

    /// Process one inbound text frame.
    pub fn handle(&mut self, peer: &mut Peer, raw: &str) -> Reply {
        let frame: RequestFrame = match serde_json::from_str(raw) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::warn!("undecodable request: {}", e);
                return Reply {
                    response: Some(ResponseFrame::error(0, format!("malformed request: {e}"), now())),
                    pushes: Vec::new(),
                };
            }
        };
        let id = frame.req.id();
        let method_tag = frame.req.method().to_string();
        self.received.push(method_tag.clone());
        tracing::debug!(request_id = id, method = %method_tag, "request");

        let outcome = self.dispatch(peer, &frame);
        if self.behavior.silent.contains(&method_tag) {
            tracing::info!(request_id = id, method = %method_tag, "staying silent");
            return Reply::default();
        }

        match outcome {
            Ok((params, pushes)) => {
                let reply_tag = match method_tag.as_str() {
                    method::AUTH_REQUEST => method::AUTH_CHALLENGE,
                    other => other,
                };
                Reply {
                    response: Some(ResponseFrame::new(id, reply_tag, params, now())),
                    pushes,
                }
            }
            Err(message) => {
                tracing::info!(request_id = id, method = %method_tag, %message, "request refused");
                Reply {
                    response: Some(ResponseFrame::error(id, message, now())),
                    pushes: Vec::new(),
                }
            }
        }
    }

    fn dispatch(&mut self, peer: &mut Peer, frame: &RequestFrame) -> Handled {
        let params = frame.req.params().clone();
        match frame.req.method() {
            method::AUTH_REQUEST => self.auth_request(peer, parse(params)?),
            method::AUTH_VERIFY => self.auth_verify(peer, params, &frame.sig),
            method::GET_CONFIG => reply(&BrokerConfig {
                broker_address: self.behavior.broker.clone(),
                supported_chains: vec![8453],
                supported_tokens: Vec::new(),
            }),
            other => {
                let Some(wallet) = peer.authenticated.clone() else {
                    return Err("authentication required".into());
                };
                if frame.sig.is_empty() {
                    return Err("missing request signature".into());
                }
                match other {
                    method::GET_CHANNELS => self.get_channels(parse(params)?),
                    method::CREATE_CHANNEL => self.create_channel(&wallet, parse(params)?),
                    method::RESIZE_CHANNEL => self.resize_channel(&wallet, parse(params)?),
                    method::CLOSE_CHANNEL => self.close_channel(&wallet, parse(params)?),
                    method::CREATE_APP_SESSION => self.create_app_session(&wallet, parse(params)?),
                    method::SUBMIT_APP_STATE => self.submit_app_state(parse(params)?),
                    method::CLOSE_APP_SESSION => {
                        self.close_app_session(&wallet, parse(params)?, frame.sig.len())
                    }
                    method::GET_APP_SESSIONS => self.get_app_sessions(parse(params)?),
                    unknown => Err(format!("unknown method '{unknown}'")),
                }
            }
        }
    }

    fn auth_request(&mut self, peer: &mut Peer, params: AuthRequestParams) -> Handled {
        let challenge = self.fresh_id();
        peer.challenge = Some((challenge.clone(), params.address, params.session_key));
        peer.authenticated = None;
        reply(&AuthChallenge {
            challenge_message: challenge,
        })
    }

    fn auth_verify(&mut self, peer: &mut Peer, params: Value, sig: &[String]) -> Handled {
        let challenge = params
            .get("challenge")
            .and_then(Value::as_str)
            .ok_or("missing challenge")?;
        let Some((expected, address, session_key)) = peer.challenge.take() else {
            return Err("no challenge outstanding".into());
        };
        if challenge != expected {
            return Err("challenge mismatch".into());
        }
        if self.behavior.reject_auth || sig.is_empty() {
            return Err("invalid challenge signature".into());
        }
        peer.authenticated = Some(address.clone());
        reply(&AuthVerifyResult {
            success: true,
            address,
            session_key,
            jwt_token: Some(format!("jwt-{challenge}")),
            expires_at: now() / 1000 + self.behavior.session_secs,
        })
    }

    fn get_channels(&self, params: GetChannelsParams) -> Handled {
        let channels = self
            .channels
            .values()
            .filter(|c| c.info.participant == params.participant)
            .map(|c| c.info.clone())
            .collect();
        reply(&ChannelList { channels })
    }

    fn create_channel(&mut self, wallet: &Address, params: CreateChannelParams) -> Handled {
        if params.challenge < nitrobet_core::config::MIN_CHALLENGE_DURATION_SECS {
            return Err(format!("challenge period {}s too short", params.challenge));
        }
        let open = self.channels.values().any(|c| {
            &c.info.participant == wallet && c.info.status == RemoteChannelStatus::Open
        });
        if open {
            return Err("an open channel already exists".into());
        }

        let channel_id: ChannelId = self.fresh_id().parse().map_err(|e| format!("{e}"))?;
        let nonce = self.next_id;
        let state = ChannelState {
            intent: StateIntent::Initialize,
            version: 1,
            state_data: String::new(),
            allocations: params.allocations.clone(),
        };
        let stamp = now().to_string();
        let info = ChannelInfo {
            channel_id: channel_id.clone(),
            participant: wallet.clone(),
            status: RemoteChannelStatus::Open,
            token: params.token.clone(),
            wallet: None,
            amount: params.amount,
            chain_id: params.chain_id,
            adjudicator: Address::zero(),
            challenge: params.challenge,
            nonce,
            version: 1,
            created_at: stamp.clone(),
            updated_at: stamp,
        };
        let signed = SignedChannelState {
            channel_id: channel_id.clone(),
            channel: Some(ChannelDefinition {
                participants: vec![wallet.clone(), self.behavior.broker.clone()],
                adjudicator: Address::zero(),
                challenge: params.challenge,
                nonce,
            }),
            state: state.clone(),
            server_signature: server_signature(&channel_id, 1),
        };
        tracing::info!(channel_id = %channel_id, amount = %params.amount, "channel created");
        self.channels.insert(channel_id, SimChannel { info: info.clone(), state });

        let pushes = vec![push(method::CHANNEL_UPDATE, &info), self.balance_push(wallet)];
        Ok((to_value(&signed)?, pushes))
    }

    fn resize_channel(&mut self, wallet: &Address, params: ResizeChannelParams) -> Handled {
        let channel = self
            .channels
            .get_mut(&params.channel_id)
            .filter(|c| &c.info.participant == wallet)
            .ok_or_else(|| format!("channel {} not found", params.channel_id))?;
        if channel.info.status != RemoteChannelStatus::Open {
            return Err(format!("channel is {:?}", channel.info.status));
        }
        let delta = params.resize_amount + params.allocate_amount;
        let current = channel.info.amount.raw() as i64;
        let next = current + delta;
        if next < 0 {
            return Err("resize would leave a negative allocation".into());
        }
        let amount = Amount::from_raw(next as u64);

        channel.state.version += 1;
        channel.state.intent = StateIntent::Resize;
        if let Some(a) = channel
            .state
            .allocations
            .iter_mut()
            .find(|a| &a.destination == wallet)
        {
            a.amount = amount;
        }
        channel.info.amount = amount;
        channel.info.version = channel.state.version;
        channel.info.updated_at = now().to_string();

        let signed = SignedChannelState {
            channel_id: params.channel_id.clone(),
            channel: None,
            state: channel.state.clone(),
            server_signature: server_signature(&params.channel_id, channel.state.version),
        };
        let info = channel.info.clone();
        tracing::info!(channel_id = %params.channel_id, version = info.version, %amount, "channel resized");
        let pushes = vec![push(method::CHANNEL_UPDATE, &info), self.balance_push(wallet)];
        Ok((to_value(&signed)?, pushes))
    }

    fn close_channel(&mut self, wallet: &Address, params: CloseChannelParams) -> Handled {
        let channel = self
            .channels
            .get_mut(&params.channel_id)
            .filter(|c| &c.info.participant == wallet)
            .ok_or_else(|| format!("channel {} not found", params.channel_id))?;
        if channel.info.status == RemoteChannelStatus::Closed {
            return Err("channel already closed".into());
        }
        channel.state.version += 1;
        channel.state.intent = StateIntent::Finalize;
        channel.info.status = RemoteChannelStatus::Closed;
        channel.info.version = channel.state.version;
        channel.info.updated_at = now().to_string();

        let signed = SignedChannelState {
            channel_id: params.channel_id.clone(),
            channel: None,
            state: channel.state.clone(),
            server_signature: server_signature(&params.channel_id, channel.state.version),
        };
        let info = channel.info.clone();
        tracing::info!(channel_id = %params.channel_id, version = info.version, "channel finalized");
        let pushes = vec![push(method::CHANNEL_UPDATE, &info), self.balance_push(wallet)];
        Ok((to_value(&signed)?, pushes))
    }

    fn create_app_session(&mut self, wallet: &Address, params: CreateAppSessionParams) -> Handled {
        let definition = params.definition;
        if definition.participants.len() != definition.weights.len() {
            return Err("participants and weights differ in length".into());
        }
        if definition.weights.iter().sum::<u32>() < definition.quorum {
            return Err("quorum unreachable".into());
        }
        let staked = params
            .allocations
            .iter()
            .filter(|a| &a.participant == wallet)
            .fold(Amount::ZERO, |acc, a| acc.checked_add(a.amount).unwrap_or(acc));
        let funding = self
            .channels
            .values()
            .find(|c| &c.info.participant == wallet && c.info.status == RemoteChannelStatus::Open)
            .map(|c| (c.info.channel_id.clone(), staked));
        if let Some((channel_id, _)) = &funding
            && self.channels.get(channel_id).is_some_and(|c| c.info.amount < staked)
        {
            return Err("app session allocation exceeds channel funds".into());
        }
        let id: AppSessionId = self.fresh_id().parse().map_err(|e| format!("{e}"))?;
        let record = AppSessionUpdate {
            app_session_id: id.clone(),
            version: 1,
            session_data: params.session_data,
            participant_allocations: params.allocations,
            status: AppSessionStatus::Open,
        };
        tracing::info!(app_session_id = %id, application = %definition.application, "app session created");
        self.app_sessions.insert(
            id.clone(),
            SimAppSession {
                definition,
                record: record.clone(),
                funding,
            },
        );
        let reply = AppSessionReply {
            app_session_id: id,
            version: 1,
            status: AppSessionStatus::Open,
        };
        Ok((to_value(&reply)?, vec![push(method::APP_SESSION_UPDATE, &record)]))
    }

    fn submit_app_state(&mut self, params: SubmitAppStateParams) -> Handled {
        let session = self
            .app_sessions
            .get_mut(&params.app_session_id)
            .ok_or_else(|| format!("app session {} not found", params.app_session_id))?;
        if session.record.status == AppSessionStatus::Closed {
            return Err("app session closed".into());
        }
        if params.version != session.record.version + 1 {
            return Err(format!(
                "version {} does not follow {}",
                params.version, session.record.version
            ));
        }
        if total(&params.allocations) != total(&session.record.participant_allocations) {
            return Err("allocations do not preserve the session total".into());
        }
        session.record.version = params.version;
        session.record.participant_allocations = params.allocations;
        session.record.session_data = params.session_data;
        tracing::info!(app_session_id = %params.app_session_id, version = params.version, "app state accepted");

        let reply = AppSessionReply {
            app_session_id: params.app_session_id,
            version: session.record.version,
            status: session.record.status,
        };
        Ok((
            to_value(&reply)?,
            vec![push(method::APP_SESSION_UPDATE, &session.record)],
        ))
    }

    fn close_app_session(
        &mut self,
        wallet: &Address,
        params: CloseAppSessionParams,
        signatures: usize,
    ) -> Handled {
        let session = self
            .app_sessions
            .get_mut(&params.app_session_id)
            .ok_or_else(|| format!("app session {} not found", params.app_session_id))?;
        if signatures < session.definition.quorum as usize {
            return Err(format!(
                "quorum not reached: {signatures} of {} signatures",
                session.definition.quorum
            ));
        }
        if total(&params.allocations) != total(&session.record.participant_allocations) {
            return Err("allocations do not preserve the session total".into());
        }
        session.record.version += 1;
        session.record.status = AppSessionStatus::Closed;
        session.record.participant_allocations = params.allocations;
        let record = session.record.clone();
        let funding = session.funding.clone();
        tracing::info!(app_session_id = %params.app_session_id, version = record.version, "app session closed");

        let reply = AppSessionReply {
            app_session_id: params.app_session_id,
            version: record.version,
            status: record.status,
        };
        let mut pushes = vec![push(method::APP_SESSION_UPDATE, &record)];
        if let Some((channel_id, staked)) = funding {
            let returned = record
                .participant_allocations
                .iter()
                .filter(|a| &a.participant == wallet)
                .fold(Amount::ZERO, |acc, a| acc.checked_add(a.amount).unwrap_or(acc));
            if let Some(info) = self.settle_into_channel(&channel_id, wallet, staked, returned) {
                pushes.push(push(method::CHANNEL_UPDATE, &info));
            }
        }
        pushes.push(self.balance_push(wallet));
        Ok((to_value(&reply)?, pushes))
    }

    /// Move the result of a closed app session back into its funding channel.
    fn settle_into_channel(
        &mut self,
        channel_id: &ChannelId,
        wallet: &Address,
        staked: Amount,
        returned: Amount,
    ) -> Option<ChannelInfo> {
        let channel = self.channels.get_mut(channel_id)?;
        if channel.info.status != RemoteChannelStatus::Open || staked == returned {
            return None;
        }
        let amount = channel
            .info
            .amount
            .checked_sub(staked)
            .and_then(|rest| rest.checked_add(returned))?;
        channel.state.version += 1;
        channel.state.intent = StateIntent::Operate;
        if let Some(a) = channel
            .state
            .allocations
            .iter_mut()
            .find(|a| &a.destination == wallet)
        {
            a.amount = amount;
        }
        channel.info.amount = amount;
        channel.info.version = channel.state.version;
        channel.info.updated_at = now().to_string();
        tracing::info!(channel_id = %channel_id, version = channel.info.version, %amount, "app session settled into channel");
        Some(channel.info.clone())
    }

    fn get_app_sessions(&self, params: GetAppSessionsParams) -> Handled {
        let app_sessions = self
            .app_sessions
            .values()
            .filter(|s| s.definition.participants.contains(&params.participant))
            .filter(|s| {
                params
                    .app_session_id
                    .as_ref()
                    .is_none_or(|id| id == &s.record.app_session_id)
            })
            .map(|s| s.record.clone())
            .collect();
        reply(&AppSessionList { app_sessions })
    }

    /// Unified balance: the sum of the wallet's open channels.
    fn balance_push(&self, wallet: &Address) -> ResponseFrame {
        let amount = self
            .channels
            .values()
            .filter(|c| &c.info.participant == wallet && c.info.status == RemoteChannelStatus::Open)
            .fold(Amount::ZERO, |acc, c| acc.checked_add(c.info.amount).unwrap_or(acc));
        push(
            method::BALANCE_UPDATE,
            &BalanceUpdate {
                balance_updates: vec![BalanceEntry {
                    asset: self.behavior.asset.clone(),
                    amount,
                }],
            },
        )
    }
}

fn parse<T: DeserializeOwned>(params: Value) -> Result<T, String> {
    serde_json::from_value(params).map_err(|e| format!("invalid params: {e}"))
}

fn to_value<T: Serialize>(payload: &T) -> Result<Value, String> {
    serde_json::to_value(payload).map_err(|e| e.to_string())
}

fn reply<T: Serialize>(payload: &T) -> Handled {
    Ok((to_value(payload)?, Vec::new()))
}

fn push<T: Serialize>(tag: &str, payload: &T) -> ResponseFrame {
    ResponseFrame::new(0, tag, serde_json::to_value(payload).unwrap_or(Value::Null), now())
}

fn total(allocations: &[nitrobet_core::AppSessionAllocation]) -> u64 {
    allocations.iter().map(|a| a.amount.raw()).sum()
}

fn server_signature(channel_id: &ChannelId, version: u64) -> String {
    format!("0x5e{:062x}{:02x}", channel_id.as_str().len(), version % 256)
}

fn now() -> u64 {
    nitrobet_core::now_millis()
}

#[cfg(test)]
mod tests {
    use super::*;
    use nitrobet_core::RpcPayload;
    use serde_json::json;

    fn addr(c: char) -> Address {
        format!("0x{}", c.to_string().repeat(40)).parse().unwrap()
    }

    fn request(id: u64, tag: &str, params: Value) -> String {
        serde_json::to_string(&RequestFrame {
            req: RpcPayload::new(id, tag, params, 0),
            sig: vec!["0xsig".into()],
        })
        .unwrap()
    }

    fn authenticate(ledger: &mut Ledger, peer: &mut Peer) {
        let reply = ledger.handle(
            peer,
            &request(
                1,
                method::AUTH_REQUEST,
                json!({
                    "address": addr('a'),
                    "session_key": addr('a'),
                    "application": "test",
                    "scope": "trading",
                    "expires_at": 0,
                    "allowances": []
                }),
            ),
        );
        let challenge = reply.response.unwrap().res.params()["challenge_message"].clone();
        let reply = ledger.handle(peer, &request(2, method::AUTH_VERIFY, json!({ "challenge": challenge })));
        assert_eq!(reply.response.unwrap().res.method(), method::AUTH_VERIFY);
        assert_eq!(peer.authenticated, Some(addr('a')));
    }

    #[test]
    fn channel_methods_require_auth() {
        let mut ledger = Ledger::new(Behavior::default());
        let mut peer = Peer::default();
        let reply = ledger.handle(&mut peer, &request(1, method::GET_CHANNELS, json!({ "participant": addr('a') })));
        assert_eq!(reply.response.unwrap().error_message().as_deref(), Some("authentication required"));
    }

    #[test]
    fn submit_must_follow_current_version() {
        let mut ledger = Ledger::new(Behavior::default());
        let mut peer = Peer::default();
        authenticate(&mut ledger, &mut peer);

        let alloc = |p: u64, d: u64| {
            json!([
                { "asset": "usdc", "amount": p.to_string(), "participant": addr('a') },
                { "asset": "usdc", "amount": d.to_string(), "participant": addr('d') }
            ])
        };
        let reply = ledger.handle(
            &mut peer,
            &request(
                3,
                method::CREATE_APP_SESSION,
                json!({
                    "definition": {
                        "protocol": "NitroRPC/0.4",
                        "participants": [addr('a'), addr('d')],
                        "weights": [1, 1],
                        "quorum": 2,
                        "challenge": 3600,
                        "nonce": 1,
                        "application": "test"
                    },
                    "allocations": alloc(100, 0)
                }),
            ),
        );
        let id = reply.response.unwrap().res.params()["app_session_id"].clone();
        assert_eq!(reply.pushes.len(), 1);

        let skip = ledger.handle(
            &mut peer,
            &request(4, method::SUBMIT_APP_STATE, json!({ "app_session_id": id, "version": 3, "allocations": alloc(75, 25) })),
        );
        assert!(skip.response.unwrap().error_message().is_some());

        let next = ledger.handle(
            &mut peer,
            &request(5, method::SUBMIT_APP_STATE, json!({ "app_session_id": id, "version": 2, "allocations": alloc(75, 25) })),
        );
        assert_eq!(next.response.unwrap().res.params()["version"], json!(2));
    }

    #[test]
    fn silent_methods_still_apply() {
        let mut behavior = Behavior::default();
        behavior.silent.insert(method::CREATE_CHANNEL.to_string());
        let mut ledger = Ledger::new(behavior);
        let mut peer = Peer::default();
        authenticate(&mut ledger, &mut peer);

        let reply = ledger.handle(
            &mut peer,
            &request(
                3,
                method::CREATE_CHANNEL,
                json!({
                    "chain_id": 8453,
                    "token": addr('c'),
                    "amount": "1000000",
                    "allocations": [],
                    "challenge": 3600
                }),
            ),
        );
        assert!(reply.response.is_none());
        assert!(reply.pushes.is_empty());
        assert_eq!(ledger.channels.len(), 1);
    }
}
