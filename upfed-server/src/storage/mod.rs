//! The persistence contract the core components consume.
//!
//! The trait is deliberately narrow. Multi-row writes are dedicated
//! operations (`complete_job`, `commit_round`) so that a reader can never
//! observe a partial write, and status transitions are compare-and-set so
//! that job and round lifecycles have a single writer. An implementation
//! may back this with an embedded engine or an external database; the
//! core assumes nothing beyond the documented behavior.

pub mod memory;
pub mod models;

pub use self::{
    memory::MemoryStorage,
    models::{
        ConnectionStatus,
        FederatedRound,
        GlobalPattern,
        JobStatus,
        LocalPattern,
        MiningJob,
        MiningParams,
        RoundStatus,
        StoreId,
        StoreRecord,
        StoredTransaction,
    },
};

use std::future::Future;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rand::Rng;
use thiserror::Error;
use tracing::warn;
use uuid::Uuid;

use upfed_core::Transaction;

/// An opaque storage failure. Only the message is kept so that backends
/// with different error types stay interchangeable.
#[derive(Debug, Error, Clone)]
#[error("storage error: {0}")]
pub struct StorageError(pub String);

impl StorageError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

pub type StorageResult<T> = Result<T, StorageError>;

/// The eligible, not-yet-attributed output of one store, as gathered by
/// the coordinator's collect step.
#[derive(Debug, Clone, PartialEq)]
pub struct StoreContribution {
    pub store_id: StoreId,
    /// Completed jobs not yet attributed to a round.
    pub job_ids: Vec<Uuid>,
    /// The patterns of the latest of those jobs.
    pub patterns: Vec<LocalPattern>,
    /// `|D_k|`: the store's transaction count, the weight of its support
    /// values in the aggregate.
    pub transaction_count: u64,
}

#[async_trait]
pub trait Storage
where
    Self: Clone + Send + Sync + 'static,
{
    // ///////// Stores

    /// Inserts or fully replaces a store row.
    async fn upsert_store(&self, record: StoreRecord) -> StorageResult<()>;

    async fn store_record(&self, id: &str) -> StorageResult<Option<StoreRecord>>;

    /// All store rows, ordered by id.
    async fn store_records(&self) -> StorageResult<Vec<StoreRecord>>;

    /// Updates `last_seen`, `ip` and the materialized status on a
    /// heartbeat. Returns `false` for an unknown store.
    async fn record_heartbeat(
        &self,
        id: &str,
        ip: &str,
        now: DateTime<Utc>,
    ) -> StorageResult<bool>;

    /// Flips every active store with `last_seen < cutoff` to inactive and
    /// returns the flipped ids. The liveness sweep is the only caller.
    async fn sweep_inactive(&self, cutoff: DateTime<Utc>) -> StorageResult<Vec<StoreId>>;

    // ///////// Transactions

    /// Appends transactions for a store and returns how many were
    /// written. One call is one atomic write.
    async fn add_transactions(
        &self,
        store_id: &str,
        transactions: Vec<Transaction>,
        now: DateTime<Utc>,
    ) -> StorageResult<usize>;

    /// A page of a store's transactions in `(store_id, recorded_at)`
    /// order.
    async fn transactions_page(
        &self,
        store_id: &str,
        offset: usize,
        limit: Option<usize>,
    ) -> StorageResult<Vec<StoredTransaction>>;

    async fn transaction_count(&self, store_id: &str) -> StorageResult<u64>;

    // ///////// Mining jobs

    /// Inserts a fresh `pending` job.
    ///
    /// # Errors
    /// Fails on a duplicate job id.
    async fn create_job(&self, job: MiningJob) -> StorageResult<()>;

    async fn job(&self, id: Uuid) -> StorageResult<Option<MiningJob>>;

    /// `pending -> running` compare-and-set. Returns `false` when the job
    /// is unknown or not `pending` (e.g. already claimed or cancelled).
    async fn claim_job(&self, id: Uuid, started_at: DateTime<Utc>) -> StorageResult<bool>;

    /// `pending -> failed` compare-and-set with `cancelled = true`.
    async fn cancel_job(&self, id: Uuid, now: DateTime<Utc>) -> StorageResult<bool>;

    /// Terminal success: writes every pattern and the `completed` job row
    /// in one transaction. Returns `false` when the job is not `running`.
    async fn complete_job(
        &self,
        id: Uuid,
        patterns: Vec<LocalPattern>,
        completed_at: DateTime<Utc>,
        execution_time_seconds: f64,
    ) -> StorageResult<bool>;

    /// `running -> failed` with the error message captured.
    async fn fail_job(
        &self,
        id: Uuid,
        error_message: &str,
        now: DateTime<Utc>,
    ) -> StorageResult<bool>;

    /// Moves `running` jobs started before `cutoff` to `failed` and
    /// returns their ids. The staleness reaper is the only caller.
    async fn reap_stale_jobs(&self, cutoff: DateTime<Utc>) -> StorageResult<Vec<Uuid>>;

    /// The patterns written by a job, in the order they were persisted.
    async fn local_patterns(&self, job_id: Uuid) -> StorageResult<Vec<LocalPattern>>;

    // ///////// Federated rounds

    /// Writes a `running` round row, assigning `round_number = max + 1`.
    ///
    /// # Errors
    /// Fails while another round is `running`: rounds are strictly
    /// serialized.
    async fn open_round(&self, round: FederatedRound) -> StorageResult<FederatedRound>;

    async fn round(&self, id: Uuid) -> StorageResult<Option<FederatedRound>>;

    /// All rounds ordered by `round_number`.
    async fn rounds(&self) -> StorageResult<Vec<FederatedRound>>;

    /// Marks a round `failed` with the given reason.
    async fn fail_round(
        &self,
        id: Uuid,
        reason: &str,
        now: DateTime<Utc>,
    ) -> StorageResult<bool>;

    /// Startup sweep: fails every round left `running` by a crash.
    async fn reap_running_rounds(
        &self,
        reason: &str,
        now: DateTime<Utc>,
    ) -> StorageResult<Vec<Uuid>>;

    /// Gathers, per store in `eligible`, the completed jobs not yet
    /// attributed to a round, together with the patterns of the latest
    /// such job (the store's freshest view; the older unattributed jobs
    /// are consumed by the commit all the same). Stores without such a
    /// job are absent from the result.
    async fn collect_contributions(
        &self,
        eligible: &[StoreId],
    ) -> StorageResult<Vec<StoreContribution>>;

    /// Terminal success of a round: writes every global pattern, marks
    /// the contributing jobs and patterns as attributed and writes the
    /// `completed` round row, all in one transaction.
    async fn commit_round(
        &self,
        round: FederatedRound,
        job_ids: &[Uuid],
        patterns: Vec<GlobalPattern>,
    ) -> StorageResult<()>;

    async fn global_patterns(&self, round_id: Uuid) -> StorageResult<Vec<GlobalPattern>>;

    /// The sum of ε over `completed` rounds.
    async fn consumed_privacy_budget(&self) -> StorageResult<f64>;
}

/// How often a transient storage failure is retried before surfacing.
const RETRY_ATTEMPTS: usize = 3;

/// Retries a storage operation with jittered backoff, then surfaces the
/// last error.
pub async fn with_retry<T, F, Fut>(mut op: F) -> StorageResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = StorageResult<T>>,
{
    let mut attempt = 0;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if attempt + 1 < RETRY_ATTEMPTS => {
                attempt += 1;
                let jitter = rand::thread_rng().gen_range(0..50);
                let backoff = std::time::Duration::from_millis(50 * attempt as u64 + jitter);
                warn!("transient storage failure (attempt {}): {}", attempt, err);
                tokio::time::sleep(backoff).await;
            }
            Err(err) => return Err(err),
        }
    }
}
