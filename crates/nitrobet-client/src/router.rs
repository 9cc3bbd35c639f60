//! Routes unsolicited clearnode messages to their owning manager.

use crate::ApplyOutcome;
use crate::app_session::AppSessionManager;
use crate::channel::ChannelManager;
use nitrobet_core::message::BalanceEntry;
use nitrobet_core::{Amount, AppSessionUpdate, ChannelInfo, ServerMessage};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{broadcast, watch};

/// Unified balances by asset symbol.
pub type Balances = HashMap<String, Amount>;

/// Something observers may want to react to. Stale and unrelated pushes are
/// logged and never notified.
#[derive(Debug, Clone, PartialEq)]
pub enum Notification {
    ChannelUpdated(ChannelInfo),
    AppSessionUpdated(AppSessionUpdate),
    BalanceUpdated(Vec<BalanceEntry>),
    RemoteError(String),
    Disconnected { reason: Option<String> },
    /// A message with no handler, such as an unknown method tag.
    Unhandled(ServerMessage),
}

pub struct Router {
    channels: Arc<ChannelManager>,
    apps: Arc<AppSessionManager>,
    balances: watch::Sender<Balances>,
    notifications: broadcast::Sender<Notification>,
}

impl Router {
    pub fn new(channels: Arc<ChannelManager>, apps: Arc<AppSessionManager>) -> Self {
        let (balances, _) = watch::channel(Balances::new());
        let (notifications, _) = broadcast::channel(64);
        Self {
            channels,
            apps,
            balances,
            notifications,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.notifications.subscribe()
    }

    pub fn balances(&self) -> watch::Receiver<Balances> {
        self.balances.subscribe()
    }

    fn notify(&self, notification: Notification) {
        // No subscribers is fine.
        let _ = self.notifications.send(notification);
    }

    pub fn route(&self, message: ServerMessage) {
        match message {
            ServerMessage::ChannelUpdate(info) => {
                if self.channels.on_channel_update(&info) == ApplyOutcome::Applied {
                    self.notify(Notification::ChannelUpdated(info));
                }
            }
            ServerMessage::AppSessionUpdate(update) => {
                if self.apps.on_app_session_update(&update) == ApplyOutcome::Applied {
                    self.notify(Notification::AppSessionUpdated(update));
                }
            }
            ServerMessage::BalanceUpdate(update) => {
                self.balances.send_modify(|balances| {
                    for entry in &update.balance_updates {
                        balances.insert(entry.asset.clone(), entry.amount);
                    }
                });
                tracing::debug!(entries = update.balance_updates.len(), "balances updated");
                self.notify(Notification::BalanceUpdated(update.balance_updates));
            }
            ServerMessage::Error(payload) => {
                tracing::warn!(error = %payload.error, "unsolicited clearnode error");
                self.notify(Notification::RemoteError(payload.error));
            }
            other => {
                tracing::debug!(?other, "unhandled clearnode message");
                self.notify(Notification::Unhandled(other));
            }
        }
    }

    pub fn disconnected(&self, reason: Option<String>) {
        self.notify(Notification::Disconnected { reason });
    }
}
