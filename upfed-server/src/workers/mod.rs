//! The local mining worker pool.
//!
//! Job-start handlers enqueue a job id on a bounded channel and return;
//! a fixed-size pool of workers drains it. For one job, a worker
//! materializes the store's transactions, runs the engine on the
//! blocking pool and persists the patterns together with the terminal
//! job update in one storage transaction. Jobs for the same store are
//! serialized through a per-store lock; jobs for distinct stores run in
//! parallel.
//!
//! A crashed worker leaves its job `running`; the staleness reaper moves
//! such jobs to `failed` after the configured bound.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex as StdMutex},
    time::Instant,
};

use chrono::{Duration as ChronoDuration, Utc};
use thiserror::Error;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};
use tracing_futures::Instrument;
use uuid::Uuid;

use upfed_core::{MinerConfig, Pattern, UpGrowthMiner};

use crate::{
    settings::MiningSettings,
    storage::{LocalPattern, MiningJob, Storage, StorageError, StoreId},
};

/// An error raised when a job cannot be queued.
#[derive(Debug, Error, PartialEq)]
pub enum EnqueueError {
    #[error("the mining queue is full")]
    QueueFull,
    #[error("the worker pool has shut down")]
    Closed,
}

/// An error raised while executing one job.
#[derive(Debug, Error)]
enum JobError {
    #[error("job not found")]
    UnknownJob,
    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// The sending half of the job queue.
#[derive(Debug, Clone)]
pub struct JobSender(mpsc::Sender<Uuid>);

impl JobSender {
    /// Enqueues a job without blocking.
    pub fn enqueue(&self, job_id: Uuid) -> Result<(), EnqueueError> {
        self.0.try_send(job_id).map_err(|err| match err {
            mpsc::error::TrySendError::Full(_) => EnqueueError::QueueFull,
            mpsc::error::TrySendError::Closed(_) => EnqueueError::Closed,
        })
    }
}

#[derive(Debug, Clone, Default)]
struct StoreLocks(Arc<StdMutex<HashMap<StoreId, Arc<Mutex<()>>>>>);

impl StoreLocks {
    fn for_store(&self, store_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.0.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        locks
            .entry(store_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }
}

/// Spawns the worker pool and returns the queue handle.
pub fn spawn_pool<T>(storage: T, settings: &MiningSettings) -> JobSender
where
    T: Storage,
{
    let (tx, rx) = mpsc::channel::<Uuid>(settings.worker_pool_size * 16);
    let rx = Arc::new(Mutex::new(rx));
    let locks = StoreLocks::default();
    let settings = *settings;

    for worker in 0..settings.worker_pool_size {
        let rx = rx.clone();
        let storage = storage.clone();
        let locks = locks.clone();
        tokio::spawn(async move {
            debug!("mining worker {} started", worker);
            loop {
                let job_id = { rx.lock().await.recv().await };
                let job_id = match job_id {
                    Some(job_id) => job_id,
                    None => break,
                };
                let span = tracing::error_span!("mining_job", job_id = %job_id);
                if let Err(err) = run_job(&storage, &locks, &settings, job_id)
                    .instrument(span)
                    .await
                {
                    warn!("job {} failed to execute: {}", job_id, err);
                }
            }
            debug!("mining worker {} stopped", worker);
        });
    }

    JobSender(tx)
}

/// Spawns the staleness reaper for abandoned `running` jobs.
pub fn spawn_reaper<T>(storage: T, settings: &MiningSettings) -> tokio::task::JoinHandle<()>
where
    T: Storage,
{
    let stale_after = ChronoDuration::seconds(settings.stale_job_timeout as i64);
    let period = std::time::Duration::from_secs((settings.stale_job_timeout / 2).max(1));
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        loop {
            interval.tick().await;
            match storage.reap_stale_jobs(Utc::now() - stale_after).await {
                Ok(reaped) if !reaped.is_empty() => {
                    warn!("reaped {} stale mining job(s)", reaped.len());
                }
                Ok(_) => {}
                Err(err) => warn!("stale job sweep failed: {}", err),
            }
        }
    })
}

/// Executes one mining job end to end.
async fn run_job<T>(
    storage: &T,
    locks: &StoreLocks,
    settings: &MiningSettings,
    job_id: Uuid,
) -> Result<(), JobError>
where
    T: Storage,
{
    let job = storage.job(job_id).await?.ok_or(JobError::UnknownJob)?;

    // Jobs of the same store linearize by submission order.
    let store_lock = locks.for_store(&job.store_id);
    let _guard = store_lock.lock().await;

    if !storage.claim_job(job_id, Utc::now()).await? {
        debug!("job {} is no longer claimable", job_id);
        return Ok(());
    }

    let started = Instant::now();
    let transactions = load_transactions(storage, &job).await?;
    let transaction_count = transactions.len() as u64;

    let config = MinerConfig {
        max_length: job.params.max_pattern_length,
        min_support: job.params.min_support,
        use_pruning: job.params.use_pruning,
        cache_size_bounds: settings.cache_size_bounds,
        cache_size_patterns: settings.cache_size_patterns,
        cache_size_projections: settings.cache_size_projections,
    };
    let min_utility = job.params.min_utility;
    let mined = tokio::task::spawn_blocking(move || {
        let mut miner = UpGrowthMiner::new(config);
        miner.mine(&transactions, min_utility)
    })
    .await;

    match mined {
        Ok(Ok(patterns)) => {
            let rows = pattern_rows(&job, patterns, transaction_count);
            let elapsed = started.elapsed().as_secs_f64();
            info!(
                "job {} completed: {} pattern(s) in {:.3}s",
                job_id,
                rows.len(),
                elapsed
            );
            storage.complete_job(job_id, rows, Utc::now(), elapsed).await?;
        }
        Ok(Err(err)) => {
            warn!("job {} rejected by the engine: {}", job_id, err);
            storage.fail_job(job_id, &err.to_string(), Utc::now()).await?;
        }
        Err(err) => {
            // A panicking engine (e.g. out of memory) fails the job but
            // never the process.
            warn!("job {} aborted: {}", job_id, err);
            storage
                .fail_job(job_id, "mining task aborted", Utc::now())
                .await?;
        }
    }
    Ok(())
}

/// Materializes the store's transactions, in batches when the job asks
/// for them.
async fn load_transactions<T>(
    storage: &T,
    job: &MiningJob,
) -> Result<Vec<upfed_core::Transaction>, StorageError>
where
    T: Storage,
{
    let mut transactions = Vec::new();
    match job.params.batch_size {
        None => {
            let rows = storage.transactions_page(&job.store_id, 0, None).await?;
            transactions.extend(rows.into_iter().map(|row| row.transaction));
        }
        Some(batch_size) => {
            let batch_size = batch_size.max(1);
            let mut offset = 0;
            loop {
                let rows = storage
                    .transactions_page(&job.store_id, offset, Some(batch_size))
                    .await?;
                let fetched = rows.len();
                transactions.extend(rows.into_iter().map(|row| row.transaction));
                if fetched < batch_size {
                    break;
                }
                offset += fetched;
            }
        }
    }
    Ok(transactions)
}

/// Converts engine output into pattern rows, ordered by utility
/// descending.
fn pattern_rows(job: &MiningJob, mut patterns: Vec<Pattern>, transaction_count: u64) -> Vec<LocalPattern> {
    patterns.sort_by(|a, b| {
        b.utility
            .partial_cmp(&a.utility)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.items.cmp(&b.items))
    });
    let now = Utc::now();
    patterns
        .into_iter()
        .map(|pattern| LocalPattern {
            job_id: job.id,
            store_id: job.store_id.clone(),
            confidence: if transaction_count == 0 {
                0.0
            } else {
                pattern.support as f64 / transaction_count as f64
            },
            items: pattern.items,
            utility: pattern.utility,
            support: pattern.support,
            round_id: None,
            created_at: now,
        })
        .collect()
}
