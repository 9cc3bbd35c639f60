//! Persistence interface for the last known channel of an identity.

use async_trait::async_trait;
use nitrobet_core::{Address, ChannelId, ChannelStatus};
use std::collections::HashMap;
use std::sync::Mutex;

/// What survives a reload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredChannel {
    pub channel_id: ChannelId,
    pub clearnode_address: Address,
    pub status: ChannelStatus,
    /// Unix milliseconds.
    pub created_at: u64,
    /// Unix milliseconds.
    pub last_used: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{0}")]
pub struct StoreError(pub String);

#[async_trait]
pub trait ChannelStore: Send + Sync {
    async fn load_channel(&self, identity: &Address) -> Result<Option<StoredChannel>, StoreError>;

    async fn save_channel(
        &self,
        identity: &Address,
        channel_id: &ChannelId,
        clearnode_address: &Address,
        status: ChannelStatus,
    ) -> Result<(), StoreError>;

    async fn clear_channel(&self, identity: &Address) -> Result<(), StoreError>;

    /// Bump the last-used timestamp. No-op if nothing is stored.
    async fn touch(&self, identity: &Address) -> Result<(), StoreError>;
}

/// Volatile store, for tests and single-process runs.
#[derive(Debug, Default)]
pub struct MemoryStore {
    channels: Mutex<HashMap<Address, StoredChannel>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, HashMap<Address, StoredChannel>>, StoreError> {
        self.channels
            .lock()
            .map_err(|_| StoreError("memory store poisoned".into()))
    }
}

#[async_trait]
impl ChannelStore for MemoryStore {
    async fn load_channel(&self, identity: &Address) -> Result<Option<StoredChannel>, StoreError> {
        Ok(self.lock()?.get(identity).cloned())
    }

    async fn save_channel(
        &self,
        identity: &Address,
        channel_id: &ChannelId,
        clearnode_address: &Address,
        status: ChannelStatus,
    ) -> Result<(), StoreError> {
        let now = nitrobet_core::now_millis();
        let mut channels = self.lock()?;
        let created_at = channels
            .get(identity)
            .filter(|c| &c.channel_id == channel_id)
            .map(|c| c.created_at)
            .unwrap_or(now);
        channels.insert(
            identity.clone(),
            StoredChannel {
                channel_id: channel_id.clone(),
                clearnode_address: clearnode_address.clone(),
                status,
                created_at,
                last_used: now,
            },
        );
        Ok(())
    }

    async fn clear_channel(&self, identity: &Address) -> Result<(), StoreError> {
        self.lock()?.remove(identity);
        Ok(())
    }

    async fn touch(&self, identity: &Address) -> Result<(), StoreError> {
        if let Some(c) = self.lock()?.get_mut(identity) {
            c.last_used = nitrobet_core::now_millis();
        }
        Ok(())
    }
}

impl From<StoreError> for crate::error::ClientError {
    fn from(e: StoreError) -> Self {
        Self::Store(e.0)
    }
}
