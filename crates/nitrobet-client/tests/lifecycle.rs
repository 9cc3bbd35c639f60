//! Full round-trips against the simulated clearnode over a real WebSocket.

use nitrobet_clearnode::{Behavior, Clearnode};
use nitrobet_client::core::message::method;
use nitrobet_client::core::{
    Address, Amount, AppSessionAllocation, AppSessionStatus, AppSessionUpdate, ChannelInfo,
    ChannelStatus, ClientConfig, GameMove, MoveOutcome, RemoteChannelStatus, ResponseFrame,
};
use nitrobet_client::{
    AppPhase, AuthFailure, AuthState, ChainCall, ChannelPhase, ChannelStore, ClientError,
    LocalSigner, MemoryStore, Notification, ParticipantSignature, Session, SignRequest, Signer,
    SimulatedChain, StartOutcome,
};
use std::sync::Arc;
use std::time::Duration;

fn player() -> Address {
    "0x00000000000000000000000000000000000a11ce".parse().unwrap()
}

fn config(node: &Clearnode) -> ClientConfig {
    ClientConfig {
        clearnode_url: node.url(),
        connect_timeout_ms: 2_000,
        auth_challenge_timeout_ms: 2_000,
        channel_update_timeout_ms: 400,
        balance_update_timeout_ms: 2_000,
        app_session_update_timeout_ms: 400,
        ..Default::default()
    }
}

struct Client {
    session: Session,
    chain: Arc<SimulatedChain>,
    store: Arc<MemoryStore>,
}

fn client_with(node: &Clearnode, signer: LocalSigner, store: Arc<MemoryStore>) -> Client {
    let chain = Arc::new(SimulatedChain::new());
    let session = Session::new(config(node), Arc::new(signer), chain.clone(), store.clone()).unwrap();
    Client { session, chain, store }
}

fn client(node: &Clearnode) -> Client {
    client_with(node, LocalSigner::new(player(), "player"), Arc::new(MemoryStore::new()))
}

fn usd(s: &str) -> Amount {
    Amount::parse_usd(s).unwrap()
}

fn bet(amount: &str) -> GameMove {
    GameMove {
        cell_id: "r2c7".into(),
        target_price: 3_201.5,
        bet_amount: usd(amount),
        multiplier: 1.8,
        price_feed_id: "0xff61491a".into(),
        timestamp: 1_700_000_000_000,
    }
}

fn open_channel_info(id: &str, version: u64) -> ChannelInfo {
    ChannelInfo {
        channel_id: id.parse().unwrap(),
        participant: player(),
        status: RemoteChannelStatus::Open,
        token: ClientConfig::default().token,
        wallet: None,
        amount: usd("2"),
        chain_id: 8453,
        adjudicator: Address::zero(),
        challenge: 3600,
        nonce: 7,
        version,
        created_at: String::new(),
        updated_at: String::new(),
    }
}

async fn wait_for_phase(client: &Client, phase: ChannelPhase) {
    let mut rx = client.session.channels().subscribe();
    tokio::time::timeout(Duration::from_secs(2), rx.wait_for(|s| s.phase == phase))
        .await
        .expect("phase not reached")
        .unwrap();
}

async fn wait_for_request(node: &Clearnode, tag: &str) {
    for _ in 0..200 {
        if node.received().iter().any(|m| m == tag) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("clearnode never received {tag}");
}

#[tokio::test]
async fn deposit_play_and_close() {
    let node = Clearnode::spawn(Behavior::default()).await.unwrap();
    let c = client(&node);
    let dealer = c.session.config().dealer.clone();

    let auth = c.session.connect().await.unwrap();
    assert_eq!(auth.address, player());
    assert!(matches!(c.session.auth_state(), AuthState::Authenticated(_)));

    let channel = match c.session.channels().start(usd("1")).await.unwrap() {
        StartOutcome::Created(channel) => channel,
        other => panic!("expected a new channel, got {other:?}"),
    };
    assert_eq!(channel.version, 1);
    assert_eq!(channel.status, ChannelStatus::Active);
    assert_eq!(channel.allocation_of(&player()), usd("1"));
    assert_eq!(
        c.store.load_channel(&player()).await.unwrap().unwrap().channel_id,
        channel.channel_id
    );

    let apps = c.session.apps();
    let opened = apps
        .open(&channel.channel_id, apps.player_allocation(usd("1")))
        .await
        .unwrap();
    assert_eq!(opened.allocation_of(&player(), "usdc"), usd("1"));

    let after = apps.update(bet("0.25"), MoveOutcome::Lost).await.unwrap();
    assert_eq!(after.version, 2);
    assert_eq!(after.allocation_of(&player(), "usdc"), usd("0.75"));
    assert_eq!(after.allocation_of(&dealer, "usdc"), usd("0.25"));

    let dealer_signer = LocalSigner::new(dealer.clone(), "dealer");
    let payload = apps.close_payload().unwrap();
    let cosig = ParticipantSignature {
        participant: dealer.clone(),
        signature: dealer_signer.sign(&SignRequest::AppState { payload }).await.unwrap(),
    };
    let closed = apps.close(&[cosig]).await.unwrap();
    assert_eq!(closed.status, AppSessionStatus::Closed);
    assert_eq!(apps.phase(), AppPhase::Closed);

    let receipt = c.session.channels().close().await.unwrap();
    assert!(receipt.success);
    let snapshot = c.session.channels().snapshot();
    assert_eq!(snapshot.phase, ChannelPhase::Closed);
    let final_channel = snapshot.channel.unwrap();
    assert_eq!(final_channel.allocation_of(&player()), usd("0.75"));
    assert!(
        c.chain
            .calls()
            .iter()
            .any(|call| matches!(call, ChainCall::Close { channel_id, .. } if channel_id == &channel.channel_id))
    );
    assert!(c.store.load_channel(&player()).await.unwrap().is_none());
    assert_eq!(
        node.channel(&channel.channel_id).unwrap().status,
        RemoteChannelStatus::Closed
    );
}

#[tokio::test]
async fn persisted_open_channel_is_reused() {
    let info = open_channel_info(&format!("0x{}", "7".repeat(64)), 4);
    let node = Clearnode::spawn(Behavior {
        channels: vec![info.clone()],
        ..Behavior::default()
    })
    .await
    .unwrap();
    let store = Arc::new(MemoryStore::new());
    store
        .save_channel(&player(), &info.channel_id, &Behavior::default().broker, ChannelStatus::Active)
        .await
        .unwrap();
    let c = client_with(&node, LocalSigner::new(player(), "player"), store);

    c.session.connect().await.unwrap();
    let outcome = c.session.channels().start(usd("1")).await.unwrap();
    match outcome {
        StartOutcome::Reused(channel) => {
            assert_eq!(channel.channel_id, info.channel_id);
            assert_eq!(channel.version, 4);
        }
        other => panic!("expected reuse, got {other:?}"),
    }
    assert_eq!(c.session.channels().phase(), ChannelPhase::Active);
    assert!(!node.received().iter().any(|m| m == method::CREATE_CHANNEL));
    assert!(c.chain.calls().is_empty());
}

#[tokio::test]
async fn unreachable_resume_requires_force_close() {
    let info = open_channel_info(&format!("0x{}", "8".repeat(64)), 2);
    let node = Clearnode::spawn(Behavior {
        channels: vec![info.clone()],
        ..Behavior::default()
    })
    .await
    .unwrap();
    node.set_silent(method::GET_CHANNELS, true);
    let store = Arc::new(MemoryStore::new());
    store
        .save_channel(&player(), &info.channel_id, &Behavior::default().broker, ChannelStatus::Active)
        .await
        .unwrap();
    let c = client_with(&node, LocalSigner::new(player(), "player"), store);
    c.session.connect().await.unwrap();

    let outcome = c.session.channels().start(usd("1")).await.unwrap();
    assert!(matches!(outcome, StartOutcome::Unreconciled { ref channel_id, .. } if channel_id == &info.channel_id));
    assert_eq!(c.session.channels().phase(), ChannelPhase::NoChannel);

    let refused = c.session.channels().start(usd("1")).await.unwrap_err();
    assert!(matches!(refused, ClientError::InvalidState { .. }));
    assert!(!node.received().iter().any(|m| m == method::CREATE_CHANNEL));

    c.session.channels().force_close().await.unwrap();
    assert_eq!(c.session.channels().phase(), ChannelPhase::Closed);
    assert!(c.chain.calls().contains(&ChainCall::ForceClose {
        channel_id: info.channel_id.clone()
    }));
    assert!(c.store.load_channel(&player()).await.unwrap().is_none());
}

#[tokio::test]
async fn stalled_close_can_be_forced() {
    let node = Clearnode::spawn(Behavior::default()).await.unwrap();
    let c = Arc::new(client(&node));
    c.session.connect().await.unwrap();
    c.session.channels().start(usd("1")).await.unwrap();

    node.set_silent(method::CLOSE_CHANNEL, true);
    let closing = {
        let c = c.clone();
        tokio::spawn(async move { c.session.channels().close().await })
    };
    wait_for_phase(&c, ChannelPhase::Closing).await;

    let receipt = c.session.channels().force_close().await.unwrap();
    assert!(receipt.success);
    assert_eq!(c.session.channels().phase(), ChannelPhase::Closed);

    let stalled = closing.await.unwrap().unwrap_err();
    assert!(matches!(stalled, ClientError::InvalidState { .. }));
    assert_eq!(c.session.channels().phase(), ChannelPhase::Closed);
}

#[tokio::test]
async fn rejected_auth_then_clean_reconnect() {
    let node = Clearnode::spawn(Behavior {
        reject_auth: true,
        ..Behavior::default()
    })
    .await
    .unwrap();
    let c = client(&node);

    let err = c.session.connect().await.unwrap_err();
    assert!(matches!(err, ClientError::AuthRejected(_)));
    assert!(matches!(c.session.auth_state(), AuthState::Failed(AuthFailure::AuthRejected(_))));
    assert!(!c.session.is_connected());

    node.set_reject_auth(false);
    c.session.connect().await.unwrap();
    assert!(matches!(c.session.auth_state(), AuthState::Authenticated(_)));
    assert!(c.session.is_connected());
}

#[tokio::test]
async fn expired_auth_session_must_be_redone() {
    let node = Clearnode::spawn(Behavior {
        session_secs: 2,
        ..Behavior::default()
    })
    .await
    .unwrap();
    let c = client(&node);
    let session = c.session.connect().await.unwrap();
    assert!(!session.is_expired());
    assert!(c.session.auth_session().is_some());

    tokio::time::sleep(Duration::from_millis(2_100)).await;
    assert_eq!(c.session.auth_state(), AuthState::Idle);
    assert!(c.session.auth_session().is_none());

    let err = c.session.channels().start(usd("1")).await.unwrap_err();
    assert!(matches!(err, ClientError::InvalidState { .. }));
    assert!(!node.received().iter().any(|m| m == method::GET_CONFIG));
    assert!(c.chain.calls().is_empty());

    c.session.disconnect();
    node.set_session_secs(3600);
    c.session.connect().await.unwrap();
    assert!(matches!(c.session.auth_state(), AuthState::Authenticated(_)));
    c.session.channels().start(usd("1")).await.unwrap();
    assert_eq!(c.session.channels().phase(), ChannelPhase::Active);
}

#[tokio::test]
async fn denied_signature_fails_handshake() {
    let node = Clearnode::spawn(Behavior::default()).await.unwrap();
    let c = client_with(&node, LocalSigner::rejecting(player()), Arc::new(MemoryStore::new()));

    let err = c.session.connect().await.unwrap_err();
    assert!(matches!(err, ClientError::SignatureDenied(_)));
    assert!(matches!(c.session.auth_state(), AuthState::Failed(AuthFailure::SignatureDenied(_))));
    assert!(!node.received().iter().any(|m| m == method::AUTH_VERIFY));
}

#[tokio::test]
async fn replayed_app_session_push_is_ignored() {
    let node = Clearnode::spawn(Behavior::default()).await.unwrap();
    let c = client(&node);
    c.session.connect().await.unwrap();
    let channel = match c.session.channels().start(usd("1")).await.unwrap() {
        StartOutcome::Created(channel) => channel,
        other => panic!("unexpected {other:?}"),
    };
    let apps = c.session.apps();
    apps.open(&channel.channel_id, apps.player_allocation(usd("1")))
        .await
        .unwrap();
    let confirmed = apps.update(bet("0.25"), MoveOutcome::Lost).await.unwrap();

    let mut events = c.session.subscribe();
    let replay = AppSessionUpdate {
        app_session_id: confirmed.app_session_id.clone(),
        version: 2,
        session_data: String::new(),
        participant_allocations: vec![AppSessionAllocation {
            asset: "usdc".into(),
            amount: usd("1"),
            participant: player(),
        }],
        status: AppSessionStatus::Open,
    };
    let frame = ResponseFrame::new(0, method::APP_SESSION_UPDATE, serde_json::to_value(&replay).unwrap(), 0);
    node.inject(serde_json::to_string(&frame).unwrap());
    // A balance push right behind it marks when the replay has been processed.
    let barrier = ResponseFrame::new(
        0,
        method::BALANCE_UPDATE,
        serde_json::json!({ "balance_updates": [{ "asset": "eth", "amount": "1" }] }),
        0,
    );
    node.inject(serde_json::to_string(&barrier).unwrap());

    loop {
        match tokio::time::timeout(Duration::from_secs(2), events.recv()).await.unwrap().unwrap() {
            Notification::BalanceUpdated(entries) if entries.iter().any(|e| e.asset == "eth") => break,
            Notification::AppSessionUpdated(update) => panic!("stale update surfaced: {update:?}"),
            _ => {}
        }
    }
    let session = apps.snapshot().session.unwrap();
    assert_eq!(session.version, 2);
    assert_eq!(session.allocation_of(&player(), "usdc"), usd("0.75"));
}

#[tokio::test]
async fn unanswered_move_is_resolved_by_requery() {
    let node = Clearnode::spawn(Behavior::default()).await.unwrap();
    let c = client(&node);
    c.session.connect().await.unwrap();
    let channel = match c.session.channels().start(usd("1")).await.unwrap() {
        StartOutcome::Created(channel) => channel,
        other => panic!("unexpected {other:?}"),
    };
    let apps = c.session.apps();
    let opened = apps
        .open(&channel.channel_id, apps.player_allocation(usd("1")))
        .await
        .unwrap();

    node.set_silent(method::SUBMIT_APP_STATE, true);
    let session = apps.update(bet("0.25"), MoveOutcome::Lost).await.unwrap();
    assert_eq!(session.version, 2);
    assert_eq!(session.allocation_of(&player(), "usdc"), usd("0.75"));
    assert!(node.received().iter().any(|m| m == method::GET_APP_SESSIONS));
    assert_eq!(node.app_session(&opened.app_session_id).unwrap().version, 2);

    let snapshot = apps.snapshot();
    assert_eq!(snapshot.phase, AppPhase::Open);
    assert!(snapshot.pending.is_none());
}

#[tokio::test]
async fn resize_reports_new_balance() {
    let node = Clearnode::spawn(Behavior::default()).await.unwrap();
    let c = client(&node);
    c.session.connect().await.unwrap();
    c.session.channels().start(usd("1")).await.unwrap();
    // The push that follows channel creation must be in before waiting for the next one.
    let mut balances = c.session.balances();
    tokio::time::timeout(
        Duration::from_secs(2),
        balances.wait_for(|b| b.get("usdc") == Some(&usd("1"))),
    )
    .await
    .unwrap()
    .unwrap();

    let (balance, resized) = tokio::join!(
        c.session.await_balance("usdc", Duration::from_secs(2)),
        c.session.channels().resize(500_000, 0),
    );
    let resized = resized.unwrap();
    assert_eq!(resized.version, 2);
    assert_eq!(resized.allocation_of(&player()), usd("1.5"));
    assert_eq!(balance.unwrap(), usd("1.5"));
}

#[tokio::test]
async fn lost_connection_fails_pending_request() {
    let node = Clearnode::spawn(Behavior::default()).await.unwrap();
    let chain = Arc::new(SimulatedChain::new());
    let config = ClientConfig {
        channel_update_timeout_ms: 10_000,
        ..config(&node)
    };
    let signer = Arc::new(LocalSigner::new(player(), "player"));
    let session = Session::new(config, signer, chain, Arc::new(MemoryStore::new())).unwrap();
    let session = Arc::new(session);
    session.connect().await.unwrap();
    session.channels().start(usd("1")).await.unwrap();
    let mut events = session.subscribe();

    node.set_silent(method::RESIZE_CHANNEL, true);
    let resizing = {
        let session = session.clone();
        tokio::spawn(async move { session.channels().resize(0, -100_000).await })
    };
    wait_for_request(&node, method::RESIZE_CHANNEL).await;
    drop(node);

    let err = resizing.await.unwrap().unwrap_err();
    assert!(err.is_disconnect(), "expected disconnect, got {err:?}");
    assert_eq!(session.channels().phase(), ChannelPhase::Active);
    loop {
        let event = tokio::time::timeout(Duration::from_secs(2), events.recv()).await.unwrap().unwrap();
        if matches!(event, Notification::Disconnected { .. }) {
            break;
        }
    }
    assert!(!session.is_connected());
}
