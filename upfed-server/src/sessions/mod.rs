//! The session registry: store registration and heartbeat-based
//! liveness.
//!
//! Registration is idempotent on the store id. Each active store is
//! expected to heartbeat at a configured interval; a periodic sweep flips
//! stores that have been silent for longer than the liveness threshold to
//! `inactive`. The sweep is the only writer of `inactive` once a store
//! has been active. The coordinator takes its eligibility snapshot from
//! [`SessionRegistry::active_stores`] at round collection time.

use chrono::{DateTime, Duration, Utc};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::{
    settings::SessionSettings,
    storage::{ConnectionStatus, Storage, StorageError, StoreId, StoreRecord},
};

/// An error raised by the session registry.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("unknown store: {0}")]
    UnknownStore(String),
    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Tracks which stores are live.
#[derive(Debug, Clone)]
pub struct SessionRegistry<T> {
    storage: T,
    inactive_after: Duration,
}

impl<T> SessionRegistry<T>
where
    T: Storage,
{
    pub fn new(storage: T, settings: &SessionSettings) -> Self {
        Self {
            storage,
            inactive_after: Duration::seconds(settings.heartbeat_inactive_timeout as i64),
        }
    }

    /// Registers a store, idempotently on its id: a known id has its name
    /// and ip updated and its `last_seen` reset; an unknown id creates a
    /// new row.
    pub async fn register(
        &self,
        store_id: &str,
        name: &str,
        ip: Option<String>,
    ) -> Result<StoreRecord, SessionError> {
        let now = Utc::now();
        let registered_at = match self.storage.store_record(store_id).await? {
            Some(existing) => {
                debug!("store {} re-registered", store_id);
                existing.registered_at
            }
            None => now,
        };
        let record = StoreRecord {
            id: store_id.to_string(),
            name: name.to_string(),
            ip,
            connection_status: ConnectionStatus::Active,
            last_seen: now,
            registered_at,
        };
        self.storage.upsert_store(record.clone()).await?;
        Ok(record)
    }

    /// Records a heartbeat: `last_seen := now`, status active, ip from
    /// the source.
    pub async fn heartbeat(&self, store_id: &str, ip: &str) -> Result<DateTime<Utc>, SessionError> {
        let now = Utc::now();
        if self.storage.record_heartbeat(store_id, ip, now).await? {
            Ok(now)
        } else {
            Err(SessionError::UnknownStore(store_id.to_string()))
        }
    }

    /// All store rows with their derived status.
    pub async fn stores(&self) -> Result<Vec<StoreRecord>, SessionError> {
        Ok(self.storage.store_records().await?)
    }

    /// The authoritative snapshot of live store ids.
    pub async fn active_stores(&self) -> Result<Vec<StoreId>, SessionError> {
        let records = self.storage.store_records().await?;
        Ok(records
            .into_iter()
            .filter(|r| r.connection_status == ConnectionStatus::Active)
            .map(|r| r.id)
            .collect())
    }

    /// One liveness sweep: flips stores silent for longer than the
    /// threshold to inactive and returns the flipped ids.
    pub async fn sweep(&self) -> Result<Vec<StoreId>, SessionError> {
        let cutoff = Utc::now() - self.inactive_after;
        Ok(self.storage.sweep_inactive(cutoff).await?)
    }
}

/// Spawns the periodic liveness sweep.
pub fn spawn_sweeper<T>(
    registry: SessionRegistry<T>,
    settings: &SessionSettings,
) -> tokio::task::JoinHandle<()>
where
    T: Storage,
{
    let period = std::time::Duration::from_secs(settings.liveness_sweep_period);
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        loop {
            interval.tick().await;
            match registry.sweep().await {
                Ok(flipped) if !flipped.is_empty() => {
                    info!("liveness sweep: {} store(s) went inactive", flipped.len());
                }
                Ok(_) => {}
                Err(err) => warn!("liveness sweep failed: {}", err),
            }
        }
    })
}
