//! The embedded in-process storage backend.
//!
//! All tables live behind one `RwLock`; every trait operation takes the
//! lock exactly once, so a multi-row write is observed either fully or
//! not at all and compare-and-set transitions are serialized.

use std::{
    collections::HashMap,
    sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard},
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use upfed_core::Transaction;

use crate::storage::{
    models::{
        ConnectionStatus,
        FederatedRound,
        GlobalPattern,
        JobStatus,
        LocalPattern,
        MiningJob,
        RoundStatus,
        StoreId,
        StoreRecord,
        StoredTransaction,
    },
    Storage,
    StorageError,
    StorageResult,
    StoreContribution,
};

#[derive(Debug, Default)]
struct Tables {
    stores: HashMap<StoreId, StoreRecord>,
    transactions: HashMap<StoreId, Vec<StoredTransaction>>,
    jobs: HashMap<Uuid, MiningJob>,
    patterns: Vec<LocalPattern>,
    rounds: Vec<FederatedRound>,
    global_patterns: Vec<GlobalPattern>,
}

/// An embedded storage engine holding all tables in memory.
#[derive(Debug, Clone, Default)]
pub struct MemoryStorage {
    tables: Arc<RwLock<Tables>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> StorageResult<RwLockReadGuard<Tables>> {
        self.tables
            .read()
            .map_err(|_| StorageError::new("storage lock poisoned"))
    }

    fn write(&self) -> StorageResult<RwLockWriteGuard<Tables>> {
        self.tables
            .write()
            .map_err(|_| StorageError::new("storage lock poisoned"))
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn upsert_store(&self, record: StoreRecord) -> StorageResult<()> {
        let mut tables = self.write()?;
        tables.stores.insert(record.id.clone(), record);
        Ok(())
    }

    async fn store_record(&self, id: &str) -> StorageResult<Option<StoreRecord>> {
        Ok(self.read()?.stores.get(id).cloned())
    }

    async fn store_records(&self) -> StorageResult<Vec<StoreRecord>> {
        let tables = self.read()?;
        let mut records: Vec<StoreRecord> = tables.stores.values().cloned().collect();
        records.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(records)
    }

    async fn record_heartbeat(
        &self,
        id: &str,
        ip: &str,
        now: DateTime<Utc>,
    ) -> StorageResult<bool> {
        let mut tables = self.write()?;
        match tables.stores.get_mut(id) {
            Some(record) => {
                record.last_seen = now;
                record.connection_status = ConnectionStatus::Active;
                record.ip = Some(ip.to_string());
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn sweep_inactive(&self, cutoff: DateTime<Utc>) -> StorageResult<Vec<StoreId>> {
        let mut tables = self.write()?;
        let mut flipped = Vec::new();
        for record in tables.stores.values_mut() {
            if record.connection_status == ConnectionStatus::Active && record.last_seen < cutoff {
                record.connection_status = ConnectionStatus::Inactive;
                flipped.push(record.id.clone());
            }
        }
        flipped.sort();
        Ok(flipped)
    }

    async fn add_transactions(
        &self,
        store_id: &str,
        transactions: Vec<Transaction>,
        now: DateTime<Utc>,
    ) -> StorageResult<usize> {
        let mut tables = self.write()?;
        let count = transactions.len();
        let rows = tables
            .transactions
            .entry(store_id.to_string())
            .or_insert_with(Vec::new);
        rows.extend(transactions.into_iter().map(|transaction| StoredTransaction {
            store_id: store_id.to_string(),
            recorded_at: now,
            transaction,
        }));
        Ok(count)
    }

    async fn transactions_page(
        &self,
        store_id: &str,
        offset: usize,
        limit: Option<usize>,
    ) -> StorageResult<Vec<StoredTransaction>> {
        let tables = self.read()?;
        let rows = match tables.transactions.get(store_id) {
            Some(rows) => rows,
            None => return Ok(Vec::new()),
        };
        let page = rows
            .iter()
            .skip(offset)
            .take(limit.unwrap_or(usize::MAX))
            .cloned()
            .collect();
        Ok(page)
    }

    async fn transaction_count(&self, store_id: &str) -> StorageResult<u64> {
        let tables = self.read()?;
        Ok(tables
            .transactions
            .get(store_id)
            .map(|rows| rows.len() as u64)
            .unwrap_or(0))
    }

    async fn create_job(&self, job: MiningJob) -> StorageResult<()> {
        let mut tables = self.write()?;
        if tables.jobs.contains_key(&job.id) {
            return Err(StorageError::new(format!("duplicate job id {}", job.id)));
        }
        tables.jobs.insert(job.id, job);
        Ok(())
    }

    async fn job(&self, id: Uuid) -> StorageResult<Option<MiningJob>> {
        Ok(self.read()?.jobs.get(&id).cloned())
    }

    async fn claim_job(&self, id: Uuid, started_at: DateTime<Utc>) -> StorageResult<bool> {
        let mut tables = self.write()?;
        match tables.jobs.get_mut(&id) {
            Some(job) if job.status == JobStatus::Pending => {
                job.status = JobStatus::Running;
                job.started_at = Some(started_at);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn cancel_job(&self, id: Uuid, now: DateTime<Utc>) -> StorageResult<bool> {
        let mut tables = self.write()?;
        match tables.jobs.get_mut(&id) {
            Some(job) if job.status == JobStatus::Pending => {
                job.status = JobStatus::Failed;
                job.cancelled = true;
                job.error_message = Some("cancelled".to_string());
                job.completed_at = Some(now);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn complete_job(
        &self,
        id: Uuid,
        patterns: Vec<LocalPattern>,
        completed_at: DateTime<Utc>,
        execution_time_seconds: f64,
    ) -> StorageResult<bool> {
        let mut tables = self.write()?;
        let job = match tables.jobs.get_mut(&id) {
            Some(job) if job.status == JobStatus::Running => job,
            _ => return Ok(false),
        };
        job.status = JobStatus::Completed;
        job.completed_at = Some(completed_at);
        job.execution_time_seconds = Some(execution_time_seconds);
        job.patterns_found = patterns.len() as u64;
        tables.patterns.extend(patterns);
        Ok(true)
    }

    async fn fail_job(
        &self,
        id: Uuid,
        error_message: &str,
        now: DateTime<Utc>,
    ) -> StorageResult<bool> {
        let mut tables = self.write()?;
        match tables.jobs.get_mut(&id) {
            Some(job) if job.status == JobStatus::Running => {
                job.status = JobStatus::Failed;
                job.error_message = Some(error_message.to_string());
                job.completed_at = Some(now);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn reap_stale_jobs(&self, cutoff: DateTime<Utc>) -> StorageResult<Vec<Uuid>> {
        let mut tables = self.write()?;
        let mut reaped = Vec::new();
        for job in tables.jobs.values_mut() {
            let stale = job.status == JobStatus::Running
                && job.started_at.map(|t| t < cutoff).unwrap_or(true);
            if stale {
                job.status = JobStatus::Failed;
                job.error_message = Some("worker abandoned the job".to_string());
                job.completed_at = Some(cutoff);
                reaped.push(job.id);
            }
        }
        reaped.sort();
        Ok(reaped)
    }

    async fn local_patterns(&self, job_id: Uuid) -> StorageResult<Vec<LocalPattern>> {
        let tables = self.read()?;
        Ok(tables
            .patterns
            .iter()
            .filter(|p| p.job_id == job_id)
            .cloned()
            .collect())
    }

    async fn open_round(&self, mut round: FederatedRound) -> StorageResult<FederatedRound> {
        let mut tables = self.write()?;
        if tables
            .rounds
            .iter()
            .any(|r| r.status == RoundStatus::Running)
        {
            return Err(StorageError::new("another round is already running"));
        }
        round.round_number = tables
            .rounds
            .iter()
            .map(|r| r.round_number)
            .max()
            .unwrap_or(0)
            + 1;
        round.status = RoundStatus::Running;
        tables.rounds.push(round.clone());
        Ok(round)
    }

    async fn round(&self, id: Uuid) -> StorageResult<Option<FederatedRound>> {
        Ok(self.read()?.rounds.iter().find(|r| r.id == id).cloned())
    }

    async fn rounds(&self) -> StorageResult<Vec<FederatedRound>> {
        let tables = self.read()?;
        let mut rounds = tables.rounds.clone();
        rounds.sort_by_key(|r| r.round_number);
        Ok(rounds)
    }

    async fn fail_round(
        &self,
        id: Uuid,
        reason: &str,
        now: DateTime<Utc>,
    ) -> StorageResult<bool> {
        let mut tables = self.write()?;
        match tables.rounds.iter_mut().find(|r| r.id == id) {
            Some(round) if round.status == RoundStatus::Running => {
                round.status = RoundStatus::Failed;
                round.failure_reason = Some(reason.to_string());
                round.completed_at = Some(now);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn reap_running_rounds(
        &self,
        reason: &str,
        now: DateTime<Utc>,
    ) -> StorageResult<Vec<Uuid>> {
        let mut tables = self.write()?;
        let mut reaped = Vec::new();
        for round in tables.rounds.iter_mut() {
            if round.status == RoundStatus::Running {
                round.status = RoundStatus::Failed;
                round.failure_reason = Some(reason.to_string());
                round.completed_at = Some(now);
                reaped.push(round.id);
            }
        }
        Ok(reaped)
    }

    async fn collect_contributions(
        &self,
        eligible: &[StoreId],
    ) -> StorageResult<Vec<StoreContribution>> {
        let tables = self.read()?;
        let mut contributions = Vec::new();
        for store_id in eligible {
            let mut jobs: Vec<&MiningJob> = tables
                .jobs
                .values()
                .filter(|job| {
                    &job.store_id == store_id
                        && job.status == JobStatus::Completed
                        && job.round_id.is_none()
                })
                .collect();
            if jobs.is_empty() {
                continue;
            }
            jobs.sort_by_key(|job| job.created_at);
            let job_ids: Vec<Uuid> = jobs.iter().map(|job| job.id).collect();
            // The round aggregates the store's latest completed patterns;
            // the older unattributed jobs are consumed all the same.
            let latest = jobs[jobs.len() - 1].id;
            let patterns: Vec<LocalPattern> = tables
                .patterns
                .iter()
                .filter(|p| p.round_id.is_none() && p.job_id == latest)
                .cloned()
                .collect();
            let transaction_count = tables
                .transactions
                .get(store_id)
                .map(|rows| rows.len() as u64)
                .unwrap_or(0);
            contributions.push(StoreContribution {
                store_id: store_id.clone(),
                job_ids,
                patterns,
                transaction_count,
            });
        }
        Ok(contributions)
    }

    async fn commit_round(
        &self,
        round: FederatedRound,
        job_ids: &[Uuid],
        patterns: Vec<GlobalPattern>,
    ) -> StorageResult<()> {
        let mut tables = self.write()?;
        for job_id in job_ids {
            if let Some(job) = tables.jobs.get_mut(job_id) {
                job.round_id = Some(round.id);
            }
        }
        for pattern in tables.patterns.iter_mut() {
            if pattern.round_id.is_none() && job_ids.contains(&pattern.job_id) {
                pattern.round_id = Some(round.id);
            }
        }
        tables.global_patterns.extend(patterns);
        match tables.rounds.iter_mut().find(|r| r.id == round.id) {
            Some(row) => *row = round,
            None => tables.rounds.push(round),
        }
        Ok(())
    }

    async fn global_patterns(&self, round_id: Uuid) -> StorageResult<Vec<GlobalPattern>> {
        let tables = self.read()?;
        Ok(tables
            .global_patterns
            .iter()
            .filter(|p| p.round_id == round_id)
            .cloned()
            .collect())
    }

    async fn consumed_privacy_budget(&self) -> StorageResult<f64> {
        let tables = self.read()?;
        Ok(tables
            .rounds
            .iter()
            .filter(|r| r.status == RoundStatus::Completed)
            .map(|r| r.privacy_budget)
            .sum())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::models::MiningParams;

    fn params() -> MiningParams {
        MiningParams {
            min_utility: 20.0,
            min_support: None,
            max_pattern_length: None,
            use_pruning: true,
            batch_size: None,
        }
    }

    fn pattern(job: &MiningJob, items: Vec<u32>, utility: f64) -> LocalPattern {
        LocalPattern {
            job_id: job.id,
            store_id: job.store_id.clone(),
            items,
            utility,
            support: 1,
            confidence: 0.5,
            round_id: None,
            created_at: Utc::now(),
        }
    }

    async fn open(storage: &MemoryStorage) -> FederatedRound {
        storage
            .open_round(FederatedRound {
                id: Uuid::new_v4(),
                round_number: 0,
                status: RoundStatus::Pending,
                min_clients_required: 1,
                privacy_budget: 0.0,
                noise_seed: [0; 32],
                started_at: Utc::now(),
                completed_at: None,
                participating_clients: 0,
                patterns_aggregated: 0,
                failure_reason: None,
            })
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_job_status_transitions_are_cas() {
        let storage = MemoryStorage::new();
        let job = MiningJob::new("s1".into(), params(), Utc::now());
        let id = job.id;
        storage.create_job(job).await.unwrap();

        // Cannot complete or fail a pending job.
        assert!(!storage.complete_job(id, vec![], Utc::now(), 0.1).await.unwrap());
        assert!(!storage.fail_job(id, "boom", Utc::now()).await.unwrap());

        assert!(storage.claim_job(id, Utc::now()).await.unwrap());
        // A second claim loses the race.
        assert!(!storage.claim_job(id, Utc::now()).await.unwrap());
        // Cancellation only applies to pending jobs.
        assert!(!storage.cancel_job(id, Utc::now()).await.unwrap());

        assert!(storage.complete_job(id, vec![], Utc::now(), 0.1).await.unwrap());
        let job = storage.job(id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Completed);
    }

    #[tokio::test]
    async fn test_cancel_pending_job() {
        let storage = MemoryStorage::new();
        let job = MiningJob::new("s1".into(), params(), Utc::now());
        let id = job.id;
        storage.create_job(job).await.unwrap();
        assert!(storage.cancel_job(id, Utc::now()).await.unwrap());
        let job = storage.job(id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert!(job.cancelled);
        // A cancelled job cannot be claimed.
        assert!(!storage.claim_job(id, Utc::now()).await.unwrap());
    }

    #[tokio::test]
    async fn test_complete_job_writes_patterns_atomically() {
        let storage = MemoryStorage::new();
        let job = MiningJob::new("s1".into(), params(), Utc::now());
        let id = job.id;
        let rows = vec![pattern(&job, vec![2], 30.0), pattern(&job, vec![2, 3], 37.0)];
        storage.create_job(job).await.unwrap();
        assert!(storage.local_patterns(id).await.unwrap().is_empty());
        storage.claim_job(id, Utc::now()).await.unwrap();
        storage.complete_job(id, rows, Utc::now(), 0.2).await.unwrap();
        assert_eq!(storage.local_patterns(id).await.unwrap().len(), 2);
        assert_eq!(storage.job(id).await.unwrap().unwrap().patterns_found, 2);
    }

    #[tokio::test]
    async fn test_round_numbers_are_dense_and_single_running() {
        let storage = MemoryStorage::new();
        let first = open(&storage).await;
        assert_eq!(first.round_number, 1);
        // A second running round is refused.
        assert!(storage
            .open_round(FederatedRound {
                id: Uuid::new_v4(),
                ..first.clone()
            })
            .await
            .is_err());
        storage.fail_round(first.id, "insufficient_clients", Utc::now()).await.unwrap();
        let second = open(&storage).await;
        assert_eq!(second.round_number, 2);
    }

    #[tokio::test]
    async fn test_collect_and_commit_attribution() {
        let storage = MemoryStorage::new();
        let job = MiningJob::new("s1".into(), params(), Utc::now());
        let job_id = job.id;
        let rows = vec![pattern(&job, vec![2], 30.0)];
        storage.create_job(job).await.unwrap();
        storage.claim_job(job_id, Utc::now()).await.unwrap();
        storage.complete_job(job_id, rows, Utc::now(), 0.1).await.unwrap();

        let eligible = vec!["s1".to_string(), "s2".to_string()];
        let contributions = storage.collect_contributions(&eligible).await.unwrap();
        // s2 has no completed jobs and does not appear.
        assert_eq!(contributions.len(), 1);
        assert_eq!(contributions[0].store_id, "s1");
        assert_eq!(contributions[0].patterns.len(), 1);

        let mut round = open(&storage).await;
        round.status = RoundStatus::Completed;
        round.patterns_aggregated = 1;
        round.participating_clients = 1;
        let global = GlobalPattern {
            round_id: round.id,
            items: vec![2],
            aggregated_utility: 30.0,
            global_support: 1.0,
            contributing_stores: 1,
        };
        storage
            .commit_round(round.clone(), &contributions[0].job_ids, vec![global])
            .await
            .unwrap();

        // Patterns are attributed: a second collect yields nothing.
        let contributions = storage.collect_contributions(&eligible).await.unwrap();
        assert!(contributions.is_empty());
        assert_eq!(storage.global_patterns(round.id).await.unwrap().len(), 1);
        assert_eq!(
            storage.job(job_id).await.unwrap().unwrap().round_id,
            Some(round.id)
        );
    }

    #[tokio::test]
    async fn test_failed_round_leaves_patterns_eligible() {
        let storage = MemoryStorage::new();
        let job = MiningJob::new("s1".into(), params(), Utc::now());
        let job_id = job.id;
        let rows = vec![pattern(&job, vec![2], 30.0)];
        storage.create_job(job).await.unwrap();
        storage.claim_job(job_id, Utc::now()).await.unwrap();
        storage.complete_job(job_id, rows, Utc::now(), 0.1).await.unwrap();

        let round = open(&storage).await;
        storage.fail_round(round.id, "insufficient_clients", Utc::now()).await.unwrap();

        let contributions = storage
            .collect_contributions(&["s1".to_string()])
            .await
            .unwrap();
        assert_eq!(contributions.len(), 1);
        assert!(storage.global_patterns(round.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_sweep_flips_only_stale_active_stores() {
        let storage = MemoryStorage::new();
        let now = Utc::now();
        for (id, seen) in &[("old", now - chrono::Duration::seconds(120)), ("new", now)] {
            storage
                .upsert_store(StoreRecord {
                    id: id.to_string(),
                    name: id.to_string(),
                    ip: None,
                    connection_status: ConnectionStatus::Active,
                    last_seen: *seen,
                    registered_at: *seen,
                })
                .await
                .unwrap();
        }
        let cutoff = now - chrono::Duration::seconds(60);
        let flipped = storage.sweep_inactive(cutoff).await.unwrap();
        assert_eq!(flipped, vec!["old".to_string()]);
        let record = storage.store_record("new").await.unwrap().unwrap();
        assert_eq!(record.connection_status, ConnectionStatus::Active);
    }

    #[tokio::test]
    async fn test_consumed_budget_counts_completed_rounds_only() {
        let storage = MemoryStorage::new();
        let mut round = open(&storage).await;
        round.privacy_budget = 1.5;
        round.status = RoundStatus::Completed;
        storage.commit_round(round, &[], vec![]).await.unwrap();

        let failed = open(&storage).await;
        storage.fail_round(failed.id, "insufficient_clients", Utc::now()).await.unwrap();

        assert_eq!(storage.consumed_privacy_budget().await.unwrap(), 1.5);
    }
}
