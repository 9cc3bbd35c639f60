//! A local clearnode speaking the client's wire protocol.
//!
//! Good enough to drive the full channel and app-session lifecycle in tests
//! and local runs. It does not verify signatures and settles nothing on-chain.
//!
//! ```no_run
//! # async fn demo() -> anyhow::Result<()> {
//! use nitrobet_clearnode::{Behavior, Clearnode};
//! let node = Clearnode::spawn(Behavior::default()).await?;
//! println!("clearnode at {}", node.url());
//! # Ok(())
//! # }
//! ```

mod ledger;

pub use ledger::{Behavior, Ledger, Peer, Reply};

use futures_util::{SinkExt, StreamExt};
use nitrobet_core::{AppSessionId, AppSessionUpdate, ChannelId, ChannelInfo};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio::task::{JoinHandle, JoinSet};
use tokio_tungstenite::tungstenite::Message;

type SharedLedger = Arc<Mutex<Ledger>>;

/// Handle to a running simulated clearnode. Dropping it stops the listener.
pub struct Clearnode {
    addr: SocketAddr,
    ledger: SharedLedger,
    inject: broadcast::Sender<String>,
    task: JoinHandle<()>,
}

impl Clearnode {
    /// Listen on an ephemeral loopback port.
    pub async fn spawn(behavior: Behavior) -> anyhow::Result<Self> {
        Self::bind(([127, 0, 0, 1], 0).into(), behavior).await
    }

    pub async fn bind(addr: SocketAddr, behavior: Behavior) -> anyhow::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        let addr = listener.local_addr()?;
        let ledger = Arc::new(Mutex::new(Ledger::new(behavior)));
        let (inject, _) = broadcast::channel(64);
        tracing::info!("clearnode listening on ws://{}", addr);

        let task = tokio::spawn(accept_loop(listener, ledger.clone(), inject.clone()));
        Ok(Self {
            addr,
            ledger,
            inject,
            task,
        })
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn url(&self) -> String {
        format!("ws://{}", self.addr)
    }

    /// Send a raw text frame to every connected client.
    pub fn inject(&self, raw: impl Into<String>) {
        let _ = self.inject.send(raw.into());
    }

    /// Stop (or resume) answering `method_tag`. Requests are still applied.
    pub fn set_silent(&self, method_tag: &str, silent: bool) {
        self.with(|l| {
            if silent {
                l.behavior.silent.insert(method_tag.to_string());
            } else {
                l.behavior.silent.remove(method_tag);
            }
        });
    }

    /// Lifetime of auth sessions issued from now on.
    pub fn set_session_secs(&self, secs: u64) {
        self.with(|l| l.behavior.session_secs = secs);
    }

    pub fn set_reject_auth(&self, reject: bool) {
        self.with(|l| l.behavior.reject_auth = reject);
    }

    /// Method tags received so far, across all connections.
    pub fn received(&self) -> Vec<String> {
        self.with(|l| l.received().to_vec())
    }

    pub fn channel(&self, id: &ChannelId) -> Option<ChannelInfo> {
        self.with(|l| l.channel(id))
    }

    pub fn app_session(&self, id: &AppSessionId) -> Option<AppSessionUpdate> {
        self.with(|l| l.app_session(id))
    }

    fn with<R>(&self, f: impl FnOnce(&mut Ledger) -> R) -> R {
        let mut ledger = self.ledger.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut ledger)
    }
}

impl Drop for Clearnode {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn accept_loop(listener: TcpListener, ledger: SharedLedger, inject: broadcast::Sender<String>) {
    // Dropping the set when this task is aborted closes every connection.
    let mut connections = JoinSet::new();
    loop {
        let (stream, client_addr) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                tracing::warn!("accept failed: {}", e);
                continue;
            }
        };
        let ledger = ledger.clone();
        let inject = inject.subscribe();
        while connections.try_join_next().is_some() {}
        connections.spawn(async move {
            if let Err(e) = handle_connection(stream, client_addr, ledger, inject).await {
                tracing::warn!("connection error: {}", e);
            }
        });
    }
}

async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    ledger: SharedLedger,
    mut inject: broadcast::Receiver<String>,
) -> anyhow::Result<()> {
    let ws = tokio_tungstenite::accept_async(stream).await?;
    let (mut sink, mut stream) = ws.split();
    let mut peer = Peer::default();
    tracing::debug!("new connection from {}", addr);

    loop {
        tokio::select! {
            msg = stream.next() => {
                let msg = match msg {
                    Some(Ok(msg)) => msg,
                    _ => break,
                };
                let Message::Text(text) = msg else { continue };
                let reply = {
                    let mut ledger = ledger.lock().unwrap_or_else(|e| e.into_inner());
                    ledger.handle(&mut peer, text.as_str())
                };
                for frame in reply.response.into_iter().chain(reply.pushes) {
                    sink.send(Message::Text(serde_json::to_string(&frame)?.into())).await?;
                }
            }
            raw = inject.recv() => match raw {
                Ok(raw) => sink.send(Message::Text(raw.into())).await?,
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    tracing::warn!("{} dropped {} injected frames", addr, n);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
        }
    }

    tracing::debug!("{} disconnected", addr);
    Ok(())
}
