//! Duplex WebSocket connection to a single clearnode.
//!
//! The transport never reconnects on its own. A close is surfaced as
//! [`TransportEvent::Closed`] and the caller decides what to do.

use crate::error::{ClientError, Result};
use futures_util::{SinkExt, StreamExt};
use nitrobet_core::ConnectionState;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;

/// Lifecycle and data events emitted by the transport.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    Open,
    Message(String),
    Error(String),
    Closed { reason: Option<String> },
}

#[derive(Debug)]
struct Shared {
    state: ConnectionState,
    last_used: Instant,
}

/// Sending half of the connection. Inbound traffic arrives on the event
/// receiver returned by [`Transport::connect`].
#[derive(Debug, Clone)]
pub struct Transport {
    url: String,
    outbound: mpsc::UnboundedSender<Message>,
    shared: Arc<Mutex<Shared>>,
}

impl Transport {
    /// Open a connection, failing if the handshake does not complete within `timeout`.
    pub async fn connect(
        url: &str,
        timeout: Duration,
    ) -> Result<(Self, mpsc::UnboundedReceiver<TransportEvent>)> {
        tracing::debug!(url, "connecting");

        let ws = match tokio::time::timeout(timeout, tokio_tungstenite::connect_async(url)).await {
            Ok(Ok((ws, _response))) => ws,
            Ok(Err(e)) => {
                return Err(ClientError::Connect {
                    url: url.to_string(),
                    reason: e.to_string(),
                });
            }
            Err(_) => {
                return Err(ClientError::Connect {
                    url: url.to_string(),
                    reason: format!("no open acknowledgment within {}ms", timeout.as_millis()),
                });
            }
        };

        let (mut sink, mut stream) = ws.split();
        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<Message>();
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        let shared = Arc::new(Mutex::new(Shared {
            state: ConnectionState::Open,
            last_used: Instant::now(),
        }));

        // Writer
        let writer_shared = shared.clone();
        tokio::spawn(async move {
            while let Some(msg) = outbound_rx.recv().await {
                let closing = matches!(msg, Message::Close(_));
                if let Err(e) = sink.send(msg).await {
                    tracing::warn!("websocket send failed: {}", e);
                    break;
                }
                if closing {
                    break;
                }
            }
            mark_closed(&writer_shared);
        });

        // Reader
        let reader_shared = shared.clone();
        let _ = event_tx.send(TransportEvent::Open);
        tokio::spawn(async move {
            let mut reason = None;
            while let Some(msg) = stream.next().await {
                match msg {
                    Ok(Message::Text(text)) => {
                        let _ = event_tx.send(TransportEvent::Message(text.as_str().to_owned()));
                    }
                    Ok(Message::Binary(bytes)) => match String::from_utf8(bytes.to_vec()) {
                        Ok(text) => {
                            let _ = event_tx.send(TransportEvent::Message(text));
                        }
                        Err(_) => tracing::debug!("dropping non-utf8 binary frame"),
                    },
                    Ok(Message::Close(frame)) => {
                        reason = frame.map(|f| f.reason.as_str().to_owned());
                        break;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        let _ = event_tx.send(TransportEvent::Error(e.to_string()));
                        reason = Some(e.to_string());
                        break;
                    }
                }
            }
            mark_closed(&reader_shared);
            tracing::info!(?reason, "clearnode connection closed");
            let _ = event_tx.send(TransportEvent::Closed { reason });
        });

        tracing::info!(url, "connected to clearnode");

        Ok((
            Self {
                url: url.to_string(),
                outbound: outbound_tx,
                shared,
            },
            event_rx,
        ))
    }

    /// Write one text frame.
    pub fn send(&self, text: String) -> Result<()> {
        {
            let mut shared = self.shared.lock().map_err(|_| ClientError::NotConnected)?;
            if shared.state != ConnectionState::Open {
                return Err(ClientError::NotConnected);
            }
            shared.last_used = Instant::now();
        }
        self.outbound
            .send(Message::Text(text.into()))
            .map_err(|_| ClientError::NotConnected)
    }

    /// Initiate a close. Further sends fail with `NotConnected`.
    pub fn close(&self) {
        let _ = self.outbound.send(Message::Close(None));
        mark_closed(&self.shared);
    }

    pub fn state(&self) -> ConnectionState {
        self.shared
            .lock()
            .map(|s| s.state)
            .unwrap_or(ConnectionState::Closed)
    }

    pub fn is_open(&self) -> bool {
        self.state() == ConnectionState::Open
    }

    pub fn last_used(&self) -> Instant {
        self.shared
            .lock()
            .map(|s| s.last_used)
            .unwrap_or_else(|_| Instant::now())
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// A transport whose outbound frames land on the returned receiver.
    #[cfg(test)]
    pub(crate) fn loopback() -> (Self, mpsc::UnboundedReceiver<Message>) {
        let (outbound, rx) = mpsc::unbounded_channel();
        let transport = Self {
            url: "loopback".to_string(),
            outbound,
            shared: Arc::new(Mutex::new(Shared {
                state: ConnectionState::Open,
                last_used: Instant::now(),
            })),
        };
        (transport, rx)
    }
}

fn mark_closed(shared: &Mutex<Shared>) {
    if let Ok(mut shared) = shared.lock() {
        shared.state = ConnectionState::Closed;
    }
}
