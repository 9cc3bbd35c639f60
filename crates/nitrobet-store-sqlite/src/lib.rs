//! SQLite persistence for the last known channel of each identity.
//!
//! One row per identity. Calls run on the blocking pool so the async client
//! never waits on disk I/O inside the runtime.

use async_trait::async_trait;
use nitrobet_client::{ChannelStore, StoreError, StoredChannel};
use nitrobet_core::{Address, ChannelId, ChannelStatus};
use rusqlite::{Connection, OptionalExtension, params};
use std::path::Path;
use std::sync::{Arc, Mutex};

#[derive(Debug, thiserror::Error)]
pub enum SqliteStoreError {
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("corrupt row for {identity}: {reason}")]
    Corrupt { identity: String, reason: String },
    #[error("store task failed: {0}")]
    Join(String),
}

impl From<SqliteStoreError> for StoreError {
    fn from(e: SqliteStoreError) -> Self {
        StoreError(e.to_string())
    }
}

#[derive(Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, SqliteStoreError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|e| SqliteStoreError::Corrupt {
                identity: String::new(),
                reason: format!("cannot create {}: {e}", parent.display()),
            })?;
        }
        let conn = Connection::open(path)?;
        tracing::debug!(path = %path.display(), "opened channel store");
        Self::with_connection(conn)
    }

    pub fn in_memory() -> Result<Self, SqliteStoreError> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self, SqliteStoreError> {
        init_schema(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    async fn run<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T, SqliteStoreError> + Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let conn = conn.lock().unwrap_or_else(|e| e.into_inner());
            f(&conn)
        })
        .await
        .map_err(|e| SqliteStoreError::Join(e.to_string()))?
        .map_err(StoreError::from)
    }
}

fn init_schema(conn: &Connection) -> Result<(), SqliteStoreError> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS channels (
            identity TEXT PRIMARY KEY,
            channel_id TEXT NOT NULL,
            clearnode_address TEXT NOT NULL,
            status TEXT NOT NULL,
            created_at INTEGER NOT NULL,
            last_used INTEGER NOT NULL
        );
        "#,
    )?;
    Ok(())
}

fn status_str(status: ChannelStatus) -> &'static str {
    match status {
        ChannelStatus::Pending => "pending",
        ChannelStatus::Active => "active",
        ChannelStatus::Closed => "closed",
        ChannelStatus::Challenged => "challenged",
    }
}

fn parse_status(s: &str) -> Option<ChannelStatus> {
    Some(match s {
        "pending" => ChannelStatus::Pending,
        "active" => ChannelStatus::Active,
        "closed" => ChannelStatus::Closed,
        "challenged" => ChannelStatus::Challenged,
        _ => return None,
    })
}

fn load(conn: &Connection, identity: &str) -> Result<Option<StoredChannel>, SqliteStoreError> {
    let row = conn
        .query_row(
            "SELECT channel_id, clearnode_address, status, created_at, last_used
             FROM channels WHERE identity = ?1",
            params![identity],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, i64>(3)?,
                    row.get::<_, i64>(4)?,
                ))
            },
        )
        .optional()?;

    let Some((channel_id, clearnode, status, created_at, last_used)) = row else {
        return Ok(None);
    };
    let corrupt = |reason: String| SqliteStoreError::Corrupt {
        identity: identity.to_string(),
        reason,
    };
    Ok(Some(StoredChannel {
        channel_id: channel_id.parse().map_err(|e| corrupt(format!("channel id: {e}")))?,
        clearnode_address: clearnode.parse().map_err(|e| corrupt(format!("clearnode: {e}")))?,
        status: parse_status(&status).ok_or_else(|| corrupt(format!("status '{status}'")))?,
        created_at: created_at as u64,
        last_used: last_used as u64,
    }))
}

#[async_trait]
impl ChannelStore for SqliteStore {
    async fn load_channel(&self, identity: &Address) -> Result<Option<StoredChannel>, StoreError> {
        let identity = identity.to_string();
        self.run(move |conn| load(conn, &identity)).await
    }

    async fn save_channel(
        &self,
        identity: &Address,
        channel_id: &ChannelId,
        clearnode_address: &Address,
        status: ChannelStatus,
    ) -> Result<(), StoreError> {
        let identity = identity.to_string();
        let channel_id = channel_id.to_string();
        let clearnode = clearnode_address.to_string();
        let now = nitrobet_core::now_millis() as i64;
        tracing::debug!(%identity, %channel_id, ?status, "saving channel");
        self.run(move |conn| {
            // A different channel for the same identity restarts created_at.
            conn.execute(
                "INSERT INTO channels (identity, channel_id, clearnode_address, status, created_at, last_used)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?5)
                 ON CONFLICT(identity) DO UPDATE SET
                    created_at = CASE WHEN channels.channel_id = excluded.channel_id
                                      THEN channels.created_at ELSE excluded.created_at END,
                    channel_id = excluded.channel_id,
                    clearnode_address = excluded.clearnode_address,
                    status = excluded.status,
                    last_used = excluded.last_used",
                params![identity, channel_id, clearnode, status_str(status), now],
            )?;
            Ok(())
        })
        .await
    }

    async fn clear_channel(&self, identity: &Address) -> Result<(), StoreError> {
        let identity = identity.to_string();
        tracing::debug!(%identity, "clearing channel");
        self.run(move |conn| {
            conn.execute("DELETE FROM channels WHERE identity = ?1", params![identity])?;
            Ok(())
        })
        .await
    }

    async fn touch(&self, identity: &Address) -> Result<(), StoreError> {
        let identity = identity.to_string();
        let now = nitrobet_core::now_millis() as i64;
        self.run(move |conn| {
            conn.execute(
                "UPDATE channels SET last_used = ?2 WHERE identity = ?1",
                params![identity, now],
            )?;
            Ok(())
        })
        .await
    }
}
