//! Funding channel lifecycle.
//!
//! ```text
//! NoChannel -> Creating -> Active <-> Resizing
//!                            Active -> Closing -> Closed
//! (any non-terminal) -> ForceClosing -> Closed
//! ```
//!
//! Channel state is only changed by clearnode-confirmed replies, confirmed
//! pushes with a newer version, or chain receipts. An operation attempted in a
//! transitional phase fails fast with `InvalidState`.

use crate::ApplyOutcome;
use crate::chain::{ChainClient, TxReceipt};
use crate::correlator::Correlator;
use crate::error::{ClientError, Result};
use crate::signer::{SignError, SignRequest, Signer, Signature};
use crate::store::ChannelStore;
use nitrobet_core::message::{
    CloseChannelParams, CreateChannelParams, GetChannelsParams, ResizeChannelParams, method,
};
use nitrobet_core::{
    Address, Allocation, Amount, Channel, ChannelId, ChannelInfo, ChannelState, ChannelStatus,
    ClientConfig, RemoteChannelStatus, ServerMessage, SignedChannelState,
};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::watch;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelPhase {
    NoChannel,
    Creating,
    Active,
    Resizing,
    Closing,
    ForceClosing,
    Closed,
}

impl ChannelPhase {
    pub fn is_terminal(self) -> bool {
        self == ChannelPhase::Closed
    }
}

/// Read-only view published to observers.
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelSnapshot {
    pub phase: ChannelPhase,
    pub channel: Option<Channel>,
    /// Persisted channel whose remote status could not be confirmed.
    pub unreconciled: Option<ChannelId>,
    pub broker: Option<Address>,
}

/// How `start` obtained a channel.
#[derive(Debug, Clone, PartialEq)]
pub enum StartOutcome {
    Reused(Channel),
    Created(Channel),
    /// The clearnode could not be asked about the persisted channel. No new
    /// channel is opened until it is force-closed.
    Unreconciled { channel_id: ChannelId, cause: String },
}

#[derive(Debug)]
struct Inner {
    phase: ChannelPhase,
    starting: bool,
    channel: Option<Channel>,
    last_state: Option<ChannelState>,
    unreconciled: Option<ChannelId>,
    broker: Option<Address>,
}

pub struct ChannelManager {
    identity: Address,
    config: Arc<ClientConfig>,
    correlator: Arc<Correlator>,
    signer: Arc<dyn Signer>,
    chain: Arc<dyn ChainClient>,
    store: Arc<dyn ChannelStore>,
    inner: Mutex<Inner>,
    snapshots: watch::Sender<ChannelSnapshot>,
}

impl ChannelManager {
    pub fn new(
        config: Arc<ClientConfig>,
        correlator: Arc<Correlator>,
        signer: Arc<dyn Signer>,
        chain: Arc<dyn ChainClient>,
        store: Arc<dyn ChannelStore>,
    ) -> Self {
        let inner = Inner {
            phase: ChannelPhase::NoChannel,
            starting: false,
            channel: None,
            last_state: None,
            unreconciled: None,
            broker: None,
        };
        let (snapshots, _) = watch::channel(snapshot_of(&inner));
        Self {
            identity: signer.address(),
            config,
            correlator,
            signer,
            chain,
            store,
            inner: Mutex::new(inner),
            snapshots,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Mutate under the lock, then publish.
    fn mutate<R>(&self, f: impl FnOnce(&mut Inner) -> R) -> R {
        let mut inner = self.lock();
        let result = f(&mut inner);
        self.snapshots.send_replace(snapshot_of(&inner));
        result
    }

    pub fn snapshot(&self) -> ChannelSnapshot {
        snapshot_of(&self.lock())
    }

    pub fn subscribe(&self) -> watch::Receiver<ChannelSnapshot> {
        self.snapshots.subscribe()
    }

    pub fn phase(&self) -> ChannelPhase {
        self.lock().phase
    }

    pub fn identity(&self) -> &Address {
        &self.identity
    }

    /// Reuse the persisted channel if the clearnode still reports it open,
    /// otherwise fund and open a new one with `deposit`.
    pub async fn start(&self, deposit: Amount) -> Result<StartOutcome> {
        self.mutate(|inner| {
            let idle = matches!(inner.phase, ChannelPhase::NoChannel | ChannelPhase::Closed);
            if !idle || inner.starting {
                return Err(ClientError::invalid_state("start a session", inner.phase));
            }
            if let Some(id) = &inner.unreconciled {
                return Err(ClientError::InvalidState {
                    operation: "start a session",
                    state: format!("channel {id} is unreconciled and must be force-closed"),
                });
            }
            inner.starting = true;
            Ok(())
        })?;

        let result = self.start_inner(deposit).await;
        self.mutate(|inner| inner.starting = false);
        result
    }

    async fn start_inner(&self, deposit: Amount) -> Result<StartOutcome> {
        let broker = self.fetch_broker().await?;
        self.mutate(|inner| {
            inner.phase = ChannelPhase::NoChannel;
            inner.channel = None;
            inner.last_state = None;
            inner.broker = Some(broker.clone());
        });

        if let Some(stored) = self.store.load_channel(&self.identity).await? {
            tracing::info!(channel_id = %stored.channel_id, "found persisted channel, reconciling");
            let params = GetChannelsParams {
                participant: self.identity.clone(),
                status: None,
            };
            let reply = self
                .correlator
                .request(method::GET_CHANNELS, &params, self.config.channel_update_timeout())
                .await;

            match reply {
                Ok(ServerMessage::Channels(list)) => {
                    let remote = list
                        .channels
                        .iter()
                        .find(|c| c.channel_id == stored.channel_id);
                    match remote {
                        Some(info)
                            if matches!(
                                info.status,
                                RemoteChannelStatus::Open | RemoteChannelStatus::Resizing
                            ) =>
                        {
                            return self.reuse(info, &broker).await;
                        }
                        Some(info) => {
                            tracing::info!(channel_id = %info.channel_id, status = ?info.status, "persisted channel no longer usable");
                        }
                        None => {
                            tracing::info!(channel_id = %stored.channel_id, "persisted channel unknown to clearnode");
                        }
                    }
                    self.store.clear_channel(&self.identity).await?;
                }
                Ok(other) => {
                    return Err(ClientError::Remote {
                        method: method::GET_CHANNELS.to_string(),
                        message: format!("unexpected reply {other:?}"),
                    });
                }
                Err(ClientError::Remote { message, .. }) => {
                    tracing::info!(channel_id = %stored.channel_id, %message, "clearnode does not know persisted channel");
                    self.store.clear_channel(&self.identity).await?;
                }
                Err(e) => {
                    tracing::warn!(channel_id = %stored.channel_id, "could not reconcile persisted channel: {}", e);
                    self.mutate(|inner| inner.unreconciled = Some(stored.channel_id.clone()));
                    return Ok(StartOutcome::Unreconciled {
                        channel_id: stored.channel_id,
                        cause: e.to_string(),
                    });
                }
            }
        }

        self.create(deposit, &broker).await.map(StartOutcome::Created)
    }

    async fn fetch_broker(&self) -> Result<Address> {
        let reply = self
            .correlator
            .request(
                method::GET_CONFIG,
                &serde_json::json!({}),
                self.config.channel_update_timeout(),
            )
            .await?;
        match reply {
            ServerMessage::Config(config) => Ok(config.broker_address),
            other => Err(ClientError::Remote {
                method: method::GET_CONFIG.to_string(),
                message: format!("unexpected reply {other:?}"),
            }),
        }
    }

    async fn reuse(&self, info: &ChannelInfo, broker: &Address) -> Result<StartOutcome> {
        let channel = Channel::from_info(info, broker);
        tracing::info!(channel_id = %channel.channel_id, version = channel.version, "reusing open channel");
        self.mutate(|inner| {
            inner.phase = ChannelPhase::Active;
            inner.channel = Some(channel.clone());
        });
        self.store
            .save_channel(&self.identity, &channel.channel_id, broker, ChannelStatus::Active)
            .await?;
        Ok(StartOutcome::Reused(channel))
    }

    async fn create(&self, deposit: Amount, broker: &Address) -> Result<Channel> {
        self.mutate(|inner| inner.phase = ChannelPhase::Creating);

        let result = self.fund_and_open(deposit, broker).await;
        match result {
            Ok(signed) => {
                let channel = Channel::from_signed_state(&signed, self.config.token.clone());
                tracing::info!(channel_id = %channel.channel_id, version = channel.version, "channel open");
                self.mutate(|inner| {
                    inner.phase = ChannelPhase::Active;
                    inner.channel = Some(channel.clone());
                    inner.last_state = Some(signed.state.clone());
                });
                if let Err(e) = self
                    .store
                    .save_channel(&self.identity, &channel.channel_id, broker, ChannelStatus::Active)
                    .await
                {
                    tracing::error!(channel_id = %channel.channel_id, "failed to persist channel: {}", e);
                }
                Ok(channel)
            }
            Err(e) => {
                tracing::warn!("channel creation failed: {}", e);
                self.mutate(|inner| inner.phase = ChannelPhase::NoChannel);
                Err(e)
            }
        }
    }

    async fn fund_and_open(&self, deposit: Amount, broker: &Address) -> Result<SignedChannelState> {
        let token = &self.config.token;
        let receipt = self.chain.approve(token, &self.config.custody, deposit).await?;
        ensure_success(&receipt, "approve")?;
        let receipt = self.chain.deposit(token, deposit).await?;
        ensure_success(&receipt, "deposit")?;

        let params = CreateChannelParams {
            chain_id: self.config.chain_id,
            token: token.clone(),
            amount: deposit,
            allocations: vec![
                Allocation {
                    destination: self.identity.clone(),
                    token: token.clone(),
                    amount: deposit,
                },
                Allocation {
                    destination: broker.clone(),
                    token: token.clone(),
                    amount: Amount::ZERO,
                },
            ],
            challenge: self.config.challenge_secs,
        };

        match self
            .correlator
            .request(method::CREATE_CHANNEL, &params, self.config.channel_update_timeout())
            .await?
        {
            ServerMessage::ChannelState(signed) => Ok(signed),
            other => Err(ClientError::Remote {
                method: method::CREATE_CHANNEL.to_string(),
                message: format!("unexpected reply {other:?}"),
            }),
        }
    }

    /// Adjust the channel's funding. Positive `resize_amount` deposits first.
    pub async fn resize(&self, resize_amount: i64, allocate_amount: i64) -> Result<Channel> {
        let channel_id = self.mutate(|inner| match (inner.phase, &inner.channel) {
            (ChannelPhase::Active, Some(channel)) => {
                inner.phase = ChannelPhase::Resizing;
                Ok(channel.channel_id.clone())
            }
            (phase, _) => Err(ClientError::invalid_state("resize", phase)),
        })?;

        let result = self.submit_resize(&channel_id, resize_amount, allocate_amount).await;

        let outcome = self.mutate(|inner| {
            if inner.phase != ChannelPhase::Resizing {
                return Err(ClientError::invalid_state("finish resize", inner.phase));
            }
            inner.phase = ChannelPhase::Active;
            let signed = result?;
            let channel = inner
                .channel
                .as_mut()
                .ok_or_else(|| ClientError::invalid_state("finish resize", ChannelPhase::NoChannel))?;
            if signed.state.version > channel.version {
                channel.apply_state(&signed.state);
                inner.last_state = Some(signed.state.clone());
            } else {
                tracing::debug!(version = signed.state.version, held = channel.version, "resize reply already superseded");
            }
            Ok(channel.clone())
        });

        match &outcome {
            Ok(channel) => {
                tracing::info!(channel_id = %channel.channel_id, version = channel.version, "channel resized");
                if let Err(e) = self.store.touch(&self.identity).await {
                    tracing::warn!("failed to touch stored channel: {}", e);
                }
            }
            Err(e) => tracing::warn!(channel_id = %channel_id, "resize failed: {}", e),
        }
        outcome
    }

    async fn submit_resize(
        &self,
        channel_id: &ChannelId,
        resize_amount: i64,
        allocate_amount: i64,
    ) -> Result<SignedChannelState> {
        if resize_amount > 0 {
            let amount = Amount::from_raw(resize_amount as u64);
            let receipt = self.chain.approve(&self.config.token, &self.config.custody, amount).await?;
            ensure_success(&receipt, "approve")?;
            let receipt = self.chain.deposit(&self.config.token, amount).await?;
            ensure_success(&receipt, "deposit")?;
        }

        let params = ResizeChannelParams {
            channel_id: channel_id.clone(),
            resize_amount,
            allocate_amount,
            funds_destination: self.identity.clone(),
        };
        match self
            .correlator
            .request(method::RESIZE_CHANNEL, &params, self.config.channel_update_timeout())
            .await?
        {
            ServerMessage::ChannelState(signed) if &signed.channel_id == channel_id => Ok(signed),
            other => Err(ClientError::Remote {
                method: method::RESIZE_CHANNEL.to_string(),
                message: format!("unexpected reply {other:?}"),
            }),
        }
    }

    /// Cooperative close: fetch the final state, countersign, submit on-chain.
    pub async fn close(&self) -> Result<TxReceipt> {
        let channel_id = self.mutate(|inner| match (inner.phase, &inner.channel) {
            (ChannelPhase::Active, Some(channel)) => {
                inner.phase = ChannelPhase::Closing;
                Ok(channel.channel_id.clone())
            }
            (phase, _) => Err(ClientError::invalid_state("close", phase)),
        })?;

        let result = self.close_cooperatively(&channel_id).await;

        let outcome = self.mutate(|inner| {
            if inner.phase != ChannelPhase::Closing {
                // A force-close took over while we were waiting.
                return Err(ClientError::invalid_state("finish close", inner.phase));
            }
            match result {
                Ok((receipt, final_state)) => {
                    inner.phase = ChannelPhase::Closed;
                    if let Some(channel) = inner.channel.as_mut() {
                        channel.apply_state(&final_state);
                        channel.status = ChannelStatus::Closed;
                    }
                    inner.last_state = Some(final_state);
                    Ok(receipt)
                }
                Err(e) => {
                    inner.phase = ChannelPhase::Active;
                    Err(e)
                }
            }
        });

        match &outcome {
            Ok(receipt) => {
                tracing::info!(channel_id = %channel_id, tx = %receipt.tx_hash, "channel closed");
                self.store.clear_channel(&self.identity).await?;
            }
            Err(e) => tracing::warn!(channel_id = %channel_id, "cooperative close failed: {}", e),
        }
        outcome
    }

    async fn close_cooperatively(&self, channel_id: &ChannelId) -> Result<(TxReceipt, ChannelState)> {
        let params = CloseChannelParams {
            channel_id: channel_id.clone(),
            funds_destination: self.identity.clone(),
        };
        let signed = match self
            .correlator
            .request(method::CLOSE_CHANNEL, &params, self.config.channel_update_timeout())
            .await?
        {
            ServerMessage::ChannelState(signed) if &signed.channel_id == channel_id => signed,
            other => {
                return Err(ClientError::Remote {
                    method: method::CLOSE_CHANNEL.to_string(),
                    message: format!("unexpected reply {other:?}"),
                });
            }
        };

        let own = self
            .signer
            .sign(&SignRequest::ChannelState {
                channel_id: channel_id.clone(),
                state: signed.state.clone(),
            })
            .await
            .map_err(|e| match e {
                SignError::Rejected => ClientError::SignatureDenied("final state not signed".into()),
                SignError::Failed(m) => ClientError::SignatureDenied(m),
            })?;

        let signatures = [own, Signature(signed.server_signature.clone())];
        let receipt = self.chain.close(channel_id, &signed.state, &signatures).await?;
        ensure_success(&receipt, "close")?;
        Ok((receipt, signed.state))
    }

    /// Unilateral on-chain close. Works from any non-terminal phase that has a
    /// channel id, including an unreconciled persisted channel, and does not
    /// talk to the clearnode.
    pub async fn force_close(&self) -> Result<TxReceipt> {
        let (channel_id, state, previous) = self.mutate(|inner| {
            let id = inner
                .channel
                .as_ref()
                .map(|c| c.channel_id.clone())
                .or_else(|| inner.unreconciled.clone());
            match (inner.phase, id) {
                (ChannelPhase::Closed | ChannelPhase::ForceClosing, _) | (_, None) => {
                    Err(ClientError::invalid_state("force-close", inner.phase))
                }
                (phase, Some(id)) => {
                    inner.phase = ChannelPhase::ForceClosing;
                    Ok((id, inner.last_state.clone(), phase))
                }
            }
        })?;

        tracing::warn!(channel_id = %channel_id, from = ?previous, "force-closing channel on-chain");
        let result = self
            .chain
            .force_close(&channel_id, state.as_ref())
            .await
            .map_err(ClientError::from)
            .and_then(|receipt| ensure_success(&receipt, "force-close").map(|_| receipt));

        match result {
            Ok(receipt) => {
                self.mutate(|inner| {
                    inner.phase = ChannelPhase::Closed;
                    inner.unreconciled = None;
                    if let Some(channel) = inner.channel.as_mut() {
                        channel.status = ChannelStatus::Closed;
                    }
                });
                tracing::info!(channel_id = %channel_id, tx = %receipt.tx_hash, "channel force-closed");
                self.store.clear_channel(&self.identity).await?;
                Ok(receipt)
            }
            Err(e) => {
                self.mutate(|inner| {
                    if inner.phase == ChannelPhase::ForceClosing {
                        inner.phase = match previous {
                            ChannelPhase::Resizing | ChannelPhase::Closing => ChannelPhase::Active,
                            other => other,
                        };
                    }
                });
                tracing::error!(channel_id = %channel_id, "force-close failed: {}", e);
                Err(e)
            }
        }
    }

    /// Apply a `cu` push. Only strictly newer versions of the held channel apply.
    pub fn on_channel_update(&self, info: &ChannelInfo) -> ApplyOutcome {
        self.mutate(|inner| {
            let Some(channel) = inner.channel.as_mut() else {
                tracing::debug!(channel_id = %info.channel_id, "channel update with no channel held");
                return ApplyOutcome::Ignored;
            };
            if channel.channel_id != info.channel_id {
                tracing::debug!(channel_id = %info.channel_id, "channel update for another channel");
                return ApplyOutcome::Ignored;
            }
            if info.version <= channel.version {
                tracing::debug!(
                    channel_id = %info.channel_id,
                    version = info.version,
                    held = channel.version,
                    "stale channel update discarded"
                );
                return ApplyOutcome::Stale;
            }

            channel.version = info.version;
            channel.status = info.status.into();
            channel.data = serde_json::to_value(info).unwrap_or(serde_json::Value::Null);
            if let Some(a) = channel
                .allocations
                .iter_mut()
                .find(|a| a.destination == info.participant)
            {
                a.amount = info.amount;
            }
            if channel.status == ChannelStatus::Closed && inner.phase == ChannelPhase::Active {
                inner.phase = ChannelPhase::Closed;
            }
            tracing::debug!(channel_id = %info.channel_id, version = info.version, status = ?info.status, "channel update applied");
            ApplyOutcome::Applied
        })
    }
}

fn snapshot_of(inner: &Inner) -> ChannelSnapshot {
    ChannelSnapshot {
        phase: inner.phase,
        channel: inner.channel.clone(),
        unreconciled: inner.unreconciled.clone(),
        broker: inner.broker.clone(),
    }
}

fn ensure_success(receipt: &TxReceipt, what: &str) -> Result<()> {
    if receipt.success {
        Ok(())
    } else {
        Err(ClientError::OnChain(format!("{what} reverted in {}", receipt.tx_hash)))
    }
}
