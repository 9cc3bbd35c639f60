//! Game ledger layered on the funding channel.
//!
//! Confirmed allocations change only on a clearnode reply or a newer `asu`
//! push. The projected result of an in-flight move is kept apart as a
//! [`PendingMove`] and dropped once the move resolves either way.

use crate::ApplyOutcome;
use crate::channel::{ChannelManager, ChannelPhase};
use crate::correlator::Correlator;
use crate::error::{ClientError, Result};
use crate::signer::{SignError, SignRequest, Signature, Signer};
use nitrobet_core::config::{APP_PROTOCOL, APP_SESSION_WEIGHTS};
use nitrobet_core::message::{
    CloseAppSessionParams, CreateAppSessionParams, GetAppSessionsParams, SubmitAppStateParams,
    method,
};
use nitrobet_core::{
    Address, Amount, AppDefinition, AppSession, AppSessionAllocation, AppSessionId,
    AppSessionStatus, AppSessionUpdate, ChannelId, ClientConfig, GameMove, MoveOutcome,
    MoveRecord, ServerMessage, settle_move,
};
use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::watch;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppPhase {
    Idle,
    Opening,
    Open,
    Updating,
    Closing,
    Closed,
}

/// Projected allocations of a move awaiting confirmation.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingMove {
    pub game_move: GameMove,
    pub outcome: MoveOutcome,
    pub allocations: Vec<AppSessionAllocation>,
    pub version: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AppSessionSnapshot {
    pub phase: AppPhase,
    pub session: Option<AppSession>,
    pub pending: Option<PendingMove>,
}

/// A counterparty's signature over [`AppSessionManager::close_payload`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParticipantSignature {
    pub participant: Address,
    pub signature: Signature,
}

#[derive(Debug)]
struct Inner {
    phase: AppPhase,
    session: Option<AppSession>,
    definition: Option<AppDefinition>,
    pending: Option<PendingMove>,
}

pub struct AppSessionManager {
    identity: Address,
    config: Arc<ClientConfig>,
    correlator: Arc<Correlator>,
    signer: Arc<dyn Signer>,
    channels: Arc<ChannelManager>,
    inner: Mutex<Inner>,
    snapshots: watch::Sender<AppSessionSnapshot>,
}

impl AppSessionManager {
    pub fn new(
        config: Arc<ClientConfig>,
        correlator: Arc<Correlator>,
        signer: Arc<dyn Signer>,
        channels: Arc<ChannelManager>,
    ) -> Self {
        let inner = Inner {
            phase: AppPhase::Idle,
            session: None,
            definition: None,
            pending: None,
        };
        let (snapshots, _) = watch::channel(snapshot_of(&inner));
        Self {
            identity: signer.address(),
            config,
            correlator,
            signer,
            channels,
            inner: Mutex::new(inner),
            snapshots,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn mutate<R>(&self, f: impl FnOnce(&mut Inner) -> R) -> R {
        let mut inner = self.lock();
        let result = f(&mut inner);
        self.snapshots.send_replace(snapshot_of(&inner));
        result
    }

    pub fn snapshot(&self) -> AppSessionSnapshot {
        snapshot_of(&self.lock())
    }

    pub fn subscribe(&self) -> watch::Receiver<AppSessionSnapshot> {
        self.snapshots.subscribe()
    }

    pub fn phase(&self) -> AppPhase {
        self.lock().phase
    }

    /// Allocation giving `amount` of the configured asset to the player and
    /// nothing to the dealer.
    pub fn player_allocation(&self, amount: Amount) -> Vec<AppSessionAllocation> {
        vec![
            AppSessionAllocation {
                asset: self.config.asset.clone(),
                amount,
                participant: self.identity.clone(),
            },
            AppSessionAllocation {
                asset: self.config.asset.clone(),
                amount: Amount::ZERO,
                participant: self.config.dealer.clone(),
            },
        ]
    }

    /// Open an app session on the active channel `channel_id`.
    pub async fn open(
        &self,
        channel_id: &ChannelId,
        initial: Vec<AppSessionAllocation>,
    ) -> Result<AppSession> {
        let channel = self.channels.snapshot();
        let channel_ready = channel.phase == ChannelPhase::Active
            && channel.channel.as_ref().is_some_and(|c| &c.channel_id == channel_id);
        if !channel_ready {
            return Err(ClientError::InvalidState {
                operation: "open an app session",
                state: format!("channel {channel_id} is not active ({:?})", channel.phase),
            });
        }

        self.mutate(|inner| match inner.phase {
            AppPhase::Idle | AppPhase::Closed => {
                inner.phase = AppPhase::Opening;
                Ok(())
            }
            phase => Err(ClientError::invalid_state("open an app session", phase)),
        })?;

        let definition = AppDefinition {
            protocol: APP_PROTOCOL.to_string(),
            participants: vec![self.identity.clone(), self.config.dealer.clone()],
            weights: APP_SESSION_WEIGHTS.to_vec(),
            quorum: self.config.quorum,
            challenge: self.config.challenge_secs,
            nonce: nitrobet_core::now_millis(),
            application: self.config.game_application.clone(),
        };
        let params = CreateAppSessionParams {
            definition: definition.clone(),
            allocations: initial.clone(),
            session_data: String::new(),
        };

        let reply = self
            .correlator
            .request(method::CREATE_APP_SESSION, &params, self.config.app_session_update_timeout())
            .await;

        self.mutate(|inner| match reply {
            Ok(ServerMessage::AppSession(reply)) => {
                let session = AppSession {
                    app_session_id: reply.app_session_id,
                    channel_id: channel_id.clone(),
                    participants: definition.participants.clone(),
                    allocations: initial,
                    version: reply.version,
                    status: reply.status,
                };
                tracing::info!(app_session_id = %session.app_session_id, version = session.version, "app session open");
                inner.phase = AppPhase::Open;
                inner.session = Some(session.clone());
                inner.definition = Some(definition);
                inner.pending = None;
                Ok(session)
            }
            Ok(other) => {
                inner.phase = AppPhase::Idle;
                Err(ClientError::Remote {
                    method: method::CREATE_APP_SESSION.to_string(),
                    message: format!("unexpected reply {other:?}"),
                })
            }
            Err(e) => {
                tracing::warn!("app session open failed: {}", e);
                inner.phase = AppPhase::Idle;
                Err(e)
            }
        })
    }

    /// Settle one move and submit the resulting allocations.
    ///
    /// On timeout the clearnode is asked for the authoritative session state;
    /// the move counts as applied only if that state carries its version.
    pub async fn update(&self, game_move: GameMove, outcome: MoveOutcome) -> Result<AppSession> {
        let (app_session_id, pending) = self.mutate(|inner| {
            let (AppPhase::Open, Some(session)) = (inner.phase, inner.session.as_ref()) else {
                return Err(ClientError::invalid_state("submit a move", inner.phase));
            };
            let allocations = settle_move(
                &session.allocations,
                &self.config.asset,
                &self.identity,
                &self.config.dealer,
                &game_move,
                outcome,
            )
            .map_err(|e| ClientError::InvalidState {
                operation: "submit a move",
                state: e.to_string(),
            })?;
            let pending = PendingMove {
                game_move: game_move.clone(),
                outcome,
                allocations,
                version: session.version + 1,
            };
            let id = session.app_session_id.clone();
            inner.phase = AppPhase::Updating;
            inner.pending = Some(pending.clone());
            Ok((id, pending))
        })?;

        let session_data = serde_json::to_string(&MoveRecord {
            game_move,
            outcome,
        })
        .unwrap_or_default();
        let params = SubmitAppStateParams {
            app_session_id: app_session_id.clone(),
            version: pending.version,
            allocations: pending.allocations.clone(),
            session_data: session_data.clone(),
        };
        let reply = self
            .correlator
            .request(method::SUBMIT_APP_STATE, &params, self.config.app_session_update_timeout())
            .await;

        let result = match reply {
            Ok(ServerMessage::AppSession(reply)) if reply.app_session_id == app_session_id => {
                let confirmed = AppSessionUpdate {
                    app_session_id: app_session_id.clone(),
                    version: reply.version,
                    session_data,
                    participant_allocations: pending.allocations.clone(),
                    status: reply.status,
                };
                self.apply(&confirmed);
                self.current()
            }
            Ok(other) => Err(ClientError::Remote {
                method: method::SUBMIT_APP_STATE.to_string(),
                message: format!("unexpected reply {other:?}"),
            }),
            Err(e) if e.is_timeout() => {
                tracing::warn!(app_session_id = %app_session_id, version = pending.version, "move outcome unknown, re-querying session");
                self.reconcile(&app_session_id, pending.version, e).await
            }
            Err(e) => Err(e),
        };

        self.mutate(|inner| {
            inner.pending = None;
            if inner.phase == AppPhase::Updating {
                inner.phase = AppPhase::Open;
            }
        });
        if let Err(e) = &result {
            tracing::warn!(app_session_id = %app_session_id, "move not applied: {}", e);
        }
        result
    }

    /// Fetch the clearnode's record after an unanswered update. Returns
    /// `timeout` unless the record has reached `expected`.
    async fn reconcile(
        &self,
        app_session_id: &AppSessionId,
        expected: u64,
        timeout: ClientError,
    ) -> Result<AppSession> {
        let params = GetAppSessionsParams {
            participant: self.identity.clone(),
            app_session_id: Some(app_session_id.clone()),
        };
        let reply = self
            .correlator
            .request(method::GET_APP_SESSIONS, &params, self.config.app_session_update_timeout())
            .await;
        let record = match reply {
            Ok(ServerMessage::AppSessions(list)) => list
                .app_sessions
                .into_iter()
                .find(|s| &s.app_session_id == app_session_id),
            Ok(other) => {
                tracing::warn!("unexpected get_app_sessions reply {:?}", other);
                None
            }
            Err(e) => {
                tracing::warn!("app session re-query failed: {}", e);
                None
            }
        };
        let Some(record) = record else {
            return Err(timeout);
        };
        let reached = record.version >= expected;
        self.apply(&record);
        if reached {
            self.current()
        } else {
            Err(timeout)
        }
    }

    fn current(&self) -> Result<AppSession> {
        let inner = self.lock();
        inner
            .session
            .clone()
            .ok_or_else(|| ClientError::invalid_state("read app session", inner.phase))
    }

    /// Canonical payload the participants sign to close with the current
    /// confirmed allocations.
    pub fn close_payload(&self) -> Result<String> {
        let inner = self.lock();
        let session = inner
            .session
            .as_ref()
            .ok_or_else(|| ClientError::invalid_state("close an app session", inner.phase))?;
        Ok(close_payload_of(session))
    }

    /// Close with the current confirmed allocations. `cosignatures` must bring
    /// the total signing weight up to the quorum.
    pub async fn close(&self, cosignatures: &[ParticipantSignature]) -> Result<AppSession> {
        let (session, definition) = self.mutate(|inner| {
            match (inner.phase, inner.session.clone(), inner.definition.clone()) {
                (AppPhase::Open, Some(session), Some(definition)) => {
                    inner.phase = AppPhase::Closing;
                    Ok((session, definition))
                }
                (phase, ..) => Err(ClientError::invalid_state("close an app session", phase)),
            }
        })?;

        let result = self.submit_close(&session, &definition, cosignatures).await;

        self.mutate(|inner| {
            match &result {
                Ok(version) => {
                    inner.phase = AppPhase::Closed;
                    if let Some(s) = inner.session.as_mut() {
                        s.status = AppSessionStatus::Closed;
                        s.version = s.version.max(*version);
                    }
                }
                Err(_) if inner.phase == AppPhase::Closing => inner.phase = AppPhase::Open,
                Err(_) => {}
            }
            result.clone().and_then(|_| {
                inner
                    .session
                    .clone()
                    .ok_or_else(|| ClientError::invalid_state("close an app session", inner.phase))
            })
        })
    }

    async fn submit_close(
        &self,
        session: &AppSession,
        definition: &AppDefinition,
        cosignatures: &[ParticipantSignature],
    ) -> Result<u64> {
        let payload = close_payload_of(session);
        let own = self
            .signer
            .sign(&SignRequest::AppState {
                payload: payload.clone(),
            })
            .await
            .map_err(|e| match e {
                SignError::Rejected => ClientError::SignatureDenied("close not signed".into()),
                SignError::Failed(m) => ClientError::SignatureDenied(m),
            })?;

        let mut signers = HashSet::new();
        signers.insert(self.identity.clone());
        let mut sig = vec![own.0];
        for cosig in cosignatures {
            if definition.weight_of(&cosig.participant) > 0 && signers.insert(cosig.participant.clone()) {
                sig.push(cosig.signature.0.clone());
            }
        }
        let weight: u32 = signers.iter().map(|p| definition.weight_of(p)).sum();
        if weight < definition.quorum {
            tracing::warn!(have = weight, need = definition.quorum, "app session close lacks quorum");
            return Err(ClientError::QuorumNotMet {
                have: weight,
                need: definition.quorum,
            });
        }

        let params = CloseAppSessionParams {
            app_session_id: session.app_session_id.clone(),
            allocations: session.allocations.clone(),
            session_data: String::new(),
        };
        match self
            .correlator
            .request_with_sig(
                method::CLOSE_APP_SESSION,
                &params,
                sig,
                self.config.app_session_update_timeout(),
            )
            .await?
        {
            ServerMessage::AppSession(reply) if reply.app_session_id == session.app_session_id => {
                tracing::info!(app_session_id = %reply.app_session_id, version = reply.version, "app session closed");
                Ok(reply.version)
            }
            other => Err(ClientError::Remote {
                method: method::CLOSE_APP_SESSION.to_string(),
                message: format!("unexpected reply {other:?}"),
            }),
        }
    }

    /// Apply an `asu` push or a confirmed reply. Only strictly newer versions
    /// of the held session apply.
    pub fn on_app_session_update(&self, update: &AppSessionUpdate) -> ApplyOutcome {
        self.apply(update)
    }

    fn apply(&self, update: &AppSessionUpdate) -> ApplyOutcome {
        self.mutate(|inner| {
            let Some(session) = inner.session.as_mut() else {
                return ApplyOutcome::Ignored;
            };
            if session.app_session_id != update.app_session_id {
                tracing::debug!(app_session_id = %update.app_session_id, "update for another app session");
                return ApplyOutcome::Ignored;
            }
            if update.version <= session.version {
                tracing::debug!(
                    app_session_id = %update.app_session_id,
                    version = update.version,
                    held = session.version,
                    "stale app session update discarded"
                );
                return ApplyOutcome::Stale;
            }
            session.version = update.version;
            session.allocations = update.participant_allocations.clone();
            session.status = update.status;
            if inner
                .pending
                .as_ref()
                .is_some_and(|p| p.version <= update.version)
            {
                inner.pending = None;
            }
            if update.status == AppSessionStatus::Closed {
                inner.phase = AppPhase::Closed;
            }
            tracing::debug!(app_session_id = %update.app_session_id, version = update.version, "app session update applied");
            ApplyOutcome::Applied
        })
    }
}

fn close_payload_of(session: &AppSession) -> String {
    serde_json::json!({
        "app_session_id": session.app_session_id,
        "allocations": session.allocations,
        "version": session.version,
    })
    .to_string()
}

fn snapshot_of(inner: &Inner) -> AppSessionSnapshot {
    AppSessionSnapshot {
        phase: inner.phase,
        session: inner.session.clone(),
        pending: inner.pending.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::SimulatedChain;
    use crate::channel::StartOutcome;
    use crate::signer::LocalSigner;
    use crate::store::MemoryStore;
    use crate::transport::Transport;
    use nitrobet_core::{RequestFrame, ResponseFrame};
    use serde_json::json;
    use tokio::sync::mpsc;
    use tokio_tungstenite::tungstenite::Message;

    fn addr(c: char) -> Address {
        format!("0x{}", c.to_string().repeat(40)).parse().unwrap()
    }

    fn id(c: char) -> ChannelId {
        format!("0x{}", c.to_string().repeat(64)).parse().unwrap()
    }

    fn dealer() -> Address {
        ClientConfig::default().dealer
    }

    struct Harness {
        apps: Arc<AppSessionManager>,
        channels: Arc<ChannelManager>,
        correlator: Arc<Correlator>,
        rx: mpsc::UnboundedReceiver<Message>,
    }

    impl Harness {
        async fn expect(&mut self, method_tag: &str) -> RequestFrame {
            let frame: RequestFrame = match self.rx.recv().await {
                Some(Message::Text(text)) => serde_json::from_str(text.as_str()).unwrap(),
                other => panic!("expected text frame, got {other:?}"),
            };
            assert_eq!(frame.req.method(), method_tag);
            frame
        }

        fn reply(&self, req: &RequestFrame, params: serde_json::Value) {
            let frame = ResponseFrame::new(req.req.id(), req.req.method(), params, 1);
            self.correlator.on_message(&serde_json::to_string(&frame).unwrap());
        }
    }

    fn harness() -> Harness {
        let (transport, rx) = Transport::loopback();
        let correlator = Arc::new(Correlator::new());
        correlator.attach(transport);
        let config = Arc::new(ClientConfig {
            channel_update_timeout_ms: 200,
            app_session_update_timeout_ms: 200,
            ..Default::default()
        });
        let signer: Arc<dyn Signer> = Arc::new(LocalSigner::new(addr('a'), "player"));
        let channels = Arc::new(ChannelManager::new(
            config.clone(),
            correlator.clone(),
            signer.clone(),
            Arc::new(SimulatedChain::new()),
            Arc::new(MemoryStore::new()),
        ));
        let apps = Arc::new(AppSessionManager::new(config, correlator.clone(), signer, channels.clone()));
        Harness { apps, channels, correlator, rx }
    }

    async fn active_channel(h: &mut Harness) {
        let channels = h.channels.clone();
        let task = tokio::spawn(async move { channels.start(Amount::from_raw(1_000_000)).await });
        let req = h.expect(method::GET_CONFIG).await;
        h.reply(&req, json!({ "broker_address": addr('b') }));
        let req = h.expect(method::CREATE_CHANNEL).await;
        h.reply(
            &req,
            json!({
                "channel_id": id('1'),
                "state": {
                    "intent": "initialize",
                    "version": 1,
                    "allocations": [
                        { "destination": addr('a'), "token": addr('c'), "amount": "1000000" },
                        { "destination": addr('b'), "token": addr('c'), "amount": "0" }
                    ]
                },
                "server_signature": "0xserver"
            }),
        );
        assert!(matches!(task.await.unwrap().unwrap(), StartOutcome::Created(_)));
    }

    async fn open_session(h: &mut Harness) -> AppSession {
        active_channel(h).await;
        let apps = h.apps.clone();
        let initial = apps.player_allocation(Amount::from_raw(1_000_000));
        let task = tokio::spawn(async move { apps.open(&id('1'), initial).await });
        let req = h.expect(method::CREATE_APP_SESSION).await;
        let definition = &req.req.params()["definition"];
        assert_eq!(definition["weights"], json!([1, 1]));
        assert_eq!(definition["quorum"], json!(2));
        assert_eq!(definition["protocol"], json!(APP_PROTOCOL));
        h.reply(&req, json!({ "app_session_id": id('9'), "version": 1, "status": "open" }));
        task.await.unwrap().unwrap()
    }

    fn bet(usd: &str, multiplier: f64) -> GameMove {
        GameMove {
            cell_id: "r3c4".into(),
            target_price: 3150.25,
            bet_amount: Amount::parse_usd(usd).unwrap(),
            multiplier,
            price_feed_id: "0xfeed".into(),
            timestamp: 1_700_000_000_000,
        }
    }

    fn asu(version: u64, player: u64, dealer_amount: u64) -> AppSessionUpdate {
        AppSessionUpdate {
            app_session_id: id('9'),
            version,
            session_data: String::new(),
            participant_allocations: vec![
                AppSessionAllocation {
                    asset: "usdc".into(),
                    amount: Amount::from_raw(player),
                    participant: addr('a'),
                },
                AppSessionAllocation {
                    asset: "usdc".into(),
                    amount: Amount::from_raw(dealer_amount),
                    participant: dealer(),
                },
            ],
            status: AppSessionStatus::Open,
        }
    }

    #[tokio::test]
    async fn open_requires_active_channel() {
        let h = harness();
        let err = h
            .apps
            .open(&id('1'), h.apps.player_allocation(Amount::from_raw(1)))
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::InvalidState { .. }));
        assert_eq!(h.apps.phase(), AppPhase::Idle);
    }

    #[tokio::test]
    async fn losing_move_shifts_bet_to_dealer() {
        let mut h = harness();
        open_session(&mut h).await;

        let apps = h.apps.clone();
        let task = tokio::spawn(async move { apps.update(bet("0.25", 2.0), MoveOutcome::Lost).await });
        let req = h.expect(method::SUBMIT_APP_STATE).await;
        assert_eq!(req.req.params()["version"], json!(2));

        let pending = h.apps.snapshot().pending.unwrap();
        assert_eq!(pending.version, 2);
        // Confirmed state is untouched while the move is in flight.
        assert_eq!(h.apps.snapshot().session.unwrap().version, 1);

        h.reply(&req, json!({ "app_session_id": id('9'), "version": 2, "status": "open" }));
        let session = task.await.unwrap().unwrap();
        assert_eq!(session.version, 2);
        assert_eq!(session.allocation_of(&addr('a'), "usdc").format_usd(), "0.75");
        assert_eq!(session.allocation_of(&dealer(), "usdc").format_usd(), "0.25");
        let snapshot = h.apps.snapshot();
        assert!(snapshot.pending.is_none());
        assert_eq!(snapshot.phase, AppPhase::Open);
    }

    #[tokio::test]
    async fn move_exceeding_allocation_is_rejected_locally() {
        let mut h = harness();
        open_session(&mut h).await;
        let err = h.apps.update(bet("2", 2.0), MoveOutcome::Lost).await.unwrap_err();
        assert!(matches!(err, ClientError::InvalidState { .. }));
        assert!(h.rx.try_recv().is_err());
        assert_eq!(h.apps.phase(), AppPhase::Open);
    }

    #[tokio::test]
    async fn timed_out_move_is_confirmed_by_requery() {
        let mut h = harness();
        open_session(&mut h).await;

        let apps = h.apps.clone();
        let task = tokio::spawn(async move { apps.update(bet("0.25", 2.0), MoveOutcome::Lost).await });
        h.expect(method::SUBMIT_APP_STATE).await;
        let req = h.expect(method::GET_APP_SESSIONS).await;
        h.reply(&req, json!({ "app_sessions": [asu(2, 750_000, 250_000)] }));

        let session = task.await.unwrap().unwrap();
        assert_eq!(session.version, 2);
        assert_eq!(session.allocation_of(&addr('a'), "usdc").raw(), 750_000);
    }

    #[tokio::test]
    async fn timed_out_move_not_applied_remotely() {
        let mut h = harness();
        open_session(&mut h).await;

        let apps = h.apps.clone();
        let task = tokio::spawn(async move { apps.update(bet("0.25", 2.0), MoveOutcome::Lost).await });
        h.expect(method::SUBMIT_APP_STATE).await;
        let req = h.expect(method::GET_APP_SESSIONS).await;
        h.reply(&req, json!({ "app_sessions": [asu(1, 1_000_000, 0)] }));

        let err = task.await.unwrap().unwrap_err();
        assert!(err.is_timeout());
        let snapshot = h.apps.snapshot();
        assert_eq!(snapshot.phase, AppPhase::Open);
        assert!(snapshot.pending.is_none());
        assert_eq!(snapshot.session.unwrap().version, 1);
    }

    #[tokio::test]
    async fn replayed_updates_are_stale() {
        let mut h = harness();
        open_session(&mut h).await;

        assert_eq!(h.apps.on_app_session_update(&asu(2, 750_000, 250_000)), ApplyOutcome::Applied);
        let before = h.apps.snapshot();
        assert_eq!(h.apps.on_app_session_update(&asu(2, 1, 1)), ApplyOutcome::Stale);
        assert_eq!(h.apps.on_app_session_update(&asu(1, 1, 1)), ApplyOutcome::Stale);
        assert_eq!(h.apps.snapshot(), before);
    }

    #[tokio::test]
    async fn close_without_cosigner_lacks_quorum() {
        let mut h = harness();
        open_session(&mut h).await;

        let err = h.apps.close(&[]).await.unwrap_err();
        assert!(matches!(err, ClientError::QuorumNotMet { have: 1, need: 2 }));
        assert_eq!(h.apps.phase(), AppPhase::Open);
        assert!(h.rx.try_recv().is_err(), "nothing sent without quorum");

        // A signature from a non-participant carries no weight.
        let stranger = ParticipantSignature {
            participant: addr('f'),
            signature: Signature("0x00".into()),
        };
        let err = h.apps.close(&[stranger]).await.unwrap_err();
        assert!(matches!(err, ClientError::QuorumNotMet { have: 1, .. }));
    }

    #[tokio::test]
    async fn close_with_dealer_signature() {
        let mut h = harness();
        open_session(&mut h).await;

        let dealer_signer = LocalSigner::new(dealer(), "dealer");
        let payload = h.apps.close_payload().unwrap();
        let cosig = ParticipantSignature {
            participant: dealer(),
            signature: dealer_signer.sign(&SignRequest::AppState { payload }).await.unwrap(),
        };

        let apps = h.apps.clone();
        let task = tokio::spawn(async move { apps.close(&[cosig]).await });
        let req = h.expect(method::CLOSE_APP_SESSION).await;
        assert_eq!(req.sig.len(), 2);
        h.reply(&req, json!({ "app_session_id": id('9'), "version": 2, "status": "closed" }));

        let session = task.await.unwrap().unwrap();
        assert_eq!(session.status, AppSessionStatus::Closed);
        assert_eq!(h.apps.phase(), AppPhase::Closed);
    }
}
