//! One authenticated clearnode session and the managers bound to it.
//!
//! Nothing here is global: every `Session` owns its own correlator,
//! managers and router, so several can run in one process.

use crate::app_session::AppSessionManager;
use crate::auth::{AuthHandshake, AuthParams, AuthSession, AuthState};
use crate::chain::ChainClient;
use crate::channel::ChannelManager;
use crate::correlator::{Correlator, Dispatch};
use crate::error::{ClientError, Result};
use crate::router::{Balances, Notification, Router};
use crate::signer::Signer;
use crate::store::ChannelStore;
use crate::transport::{Transport, TransportEvent};
use nitrobet_core::message::method;
use nitrobet_core::{Address, Amount, ClientConfig};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;

pub struct Session {
    config: Arc<ClientConfig>,
    signer: Arc<dyn Signer>,
    correlator: Arc<Correlator>,
    channels: Arc<ChannelManager>,
    apps: Arc<AppSessionManager>,
    router: Arc<Router>,
    transport: Mutex<Option<Transport>>,
    auth: Arc<Mutex<AuthState>>,
    dispatch: Mutex<Option<JoinHandle<()>>>,
}

impl Session {
    pub fn new(
        config: ClientConfig,
        signer: Arc<dyn Signer>,
        chain: Arc<dyn ChainClient>,
        store: Arc<dyn ChannelStore>,
    ) -> Result<Self> {
        config.validate().map_err(|e| ClientError::InvalidState {
            operation: "create a session",
            state: e.to_string(),
        })?;
        let config = Arc::new(config);
        let correlator = Arc::new(Correlator::new());
        let channels = Arc::new(ChannelManager::new(
            config.clone(),
            correlator.clone(),
            signer.clone(),
            chain,
            store,
        ));
        let apps = Arc::new(AppSessionManager::new(
            config.clone(),
            correlator.clone(),
            signer.clone(),
            channels.clone(),
        ));
        let router = Arc::new(Router::new(channels.clone(), apps.clone()));
        Ok(Self {
            config,
            signer,
            correlator,
            channels,
            apps,
            router,
            transport: Mutex::new(None),
            auth: Arc::new(Mutex::new(AuthState::Idle)),
            dispatch: Mutex::new(None),
        })
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn address(&self) -> Address {
        self.signer.address()
    }

    pub fn channels(&self) -> &Arc<ChannelManager> {
        &self.channels
    }

    pub fn apps(&self) -> &Arc<AppSessionManager> {
        &self.apps
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.router.subscribe()
    }

    pub fn balances(&self) -> watch::Receiver<Balances> {
        self.router.balances()
    }

    /// State the last handshake ended in. An expired session reads as `Idle`
    /// and stops request signing until the next `connect`.
    pub fn auth_state(&self) -> AuthState {
        let Ok(mut state) = self.auth.lock() else {
            return AuthState::Idle;
        };
        if let AuthState::Authenticated(session) = &*state
            && session.is_expired()
        {
            tracing::info!(expires_at = session.expires_at, "auth session expired");
            *state = AuthState::Idle;
            self.correlator.set_signer(None);
        }
        state.clone()
    }

    /// The live auth session, if any.
    pub fn auth_session(&self) -> Option<AuthSession> {
        match self.auth_state() {
            AuthState::Authenticated(session) => Some(session),
            _ => None,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.transport
            .lock()
            .ok()
            .and_then(|t| t.as_ref().map(Transport::is_open))
            .unwrap_or(false)
    }

    /// Connect and authenticate. Each call runs a fresh handshake from `Idle`.
    pub async fn connect(&self) -> Result<AuthSession> {
        if self.is_connected() {
            return Err(ClientError::invalid_state("connect", "connected"));
        }

        self.stop_dispatch();
        let (transport, events) =
            Transport::connect(&self.config.clearnode_url, self.config.connect_timeout()).await?;
        self.correlator.set_signer(None);
        self.correlator.set_session_expiry(None);
        self.correlator.attach(transport.clone());
        self.set_auth(AuthState::Idle);
        if let Ok(mut slot) = self.transport.lock() {
            *slot = Some(transport.clone());
        }
        self.spawn_dispatch(events);

        let params = AuthParams {
            address: self.signer.address(),
            session_key: self.signer.address(),
            application: self.config.application.clone(),
            scope: self.config.scope.clone(),
            duration_secs: self.config.auth_session_secs,
            allowances: Vec::new(),
        };
        let mut handshake = AuthHandshake::new();
        let result = handshake
            .run(
                &self.correlator,
                self.signer.as_ref(),
                &params,
                self.config.auth_challenge_timeout(),
            )
            .await;
        self.set_auth(handshake.state().clone());

        match result {
            Ok(session) => {
                self.correlator.set_signer(Some(self.signer.clone()));
                self.correlator.set_session_expiry(Some(session.expires_at));
                Ok(session)
            }
            Err(e) => {
                tracing::warn!("closing connection after failed authentication: {}", e);
                self.teardown();
                Err(e)
            }
        }
    }

    /// Close the connection. Outstanding requests fail with `NotConnected`.
    pub fn disconnect(&self) {
        tracing::info!("disconnecting from clearnode");
        self.teardown();
        if let Ok(mut state) = self.auth.lock()
            && matches!(*state, AuthState::Authenticated(_))
        {
            *state = AuthState::Idle;
        }
        self.router.disconnected(Some("closed by client".into()));
    }

    /// Stop dispatching before the transport goes, so a stale close event
    /// cannot detach a later connection.
    fn teardown(&self) {
        self.stop_dispatch();
        if let Some(transport) = self.transport.lock().ok().and_then(|mut t| t.take()) {
            transport.close();
        }
        self.correlator.set_signer(None);
        self.correlator.set_session_expiry(None);
        self.correlator.detach();
    }

    fn stop_dispatch(&self) {
        if let Ok(mut slot) = self.dispatch.lock()
            && let Some(handle) = slot.take()
        {
            handle.abort();
        }
    }

    fn set_auth(&self, state: AuthState) {
        if let Ok(mut slot) = self.auth.lock() {
            *slot = state;
        }
    }

    fn spawn_dispatch(&self, mut events: mpsc::UnboundedReceiver<TransportEvent>) {
        let correlator = self.correlator.clone();
        let router = self.router.clone();
        let auth = self.auth.clone();
        let handle = tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                match event {
                    TransportEvent::Open => tracing::debug!("transport open"),
                    TransportEvent::Message(raw) => match correlator.on_message(&raw) {
                        Dispatch::Unsolicited(message) => router.route(message),
                        Dispatch::Malformed(reason) => {
                            tracing::warn!(%reason, "dropping malformed frame");
                        }
                        Dispatch::Resolved(_) | Dispatch::Late(_) => {}
                    },
                    TransportEvent::Error(e) => tracing::warn!("transport error: {}", e),
                    TransportEvent::Closed { reason } => {
                        correlator.set_signer(None);
                        correlator.detach();
                        if let Ok(mut state) = auth.lock()
                            && matches!(*state, AuthState::Authenticated(_))
                        {
                            *state = AuthState::Idle;
                        }
                        router.disconnected(reason);
                        break;
                    }
                }
            }
        });
        if let Ok(mut slot) = self.dispatch.lock() {
            *slot = Some(handle);
        }
    }

    /// Wait for the next balance push carrying `asset`.
    pub async fn await_balance(&self, asset: &str, timeout: Duration) -> Result<Amount> {
        let mut balances = self.router.balances();
        balances.mark_unchanged();
        let wait = async {
            loop {
                if balances.changed().await.is_err() {
                    return Err(ClientError::NotConnected);
                }
                if let Some(amount) = balances.borrow_and_update().get(asset) {
                    return Ok(*amount);
                }
            }
        };
        tokio::time::timeout(timeout, wait)
            .await
            .map_err(|_| ClientError::Timeout {
                method: method::BALANCE_UPDATE.to_string(),
                after: timeout,
            })?
    }

    /// [`Session::await_balance`] bounded by the configured balance timeout.
    pub async fn await_default_balance(&self) -> Result<Amount> {
        self.await_balance(&self.config.asset, self.config.balance_update_timeout())
            .await
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.stop_dispatch();
    }
}
