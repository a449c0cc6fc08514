//! Persistent row types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use upfed_core::{ItemId, Transaction};

/// The identifier a store registers under.
pub type StoreId = String;

/// Derived liveness status of a store session, materialized for query
/// speed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    Active,
    Inactive,
}

/// A registered store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoreRecord {
    pub id: StoreId,
    pub name: String,
    pub ip: Option<String>,
    pub connection_status: ConnectionStatus,
    pub last_seen: DateTime<Utc>,
    pub registered_at: DateTime<Utc>,
}

/// A transaction persisted for a store. Immutable once written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredTransaction {
    pub store_id: StoreId,
    pub recorded_at: DateTime<Utc>,
    pub transaction: Transaction,
}

/// The lifecycle of a mining job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

/// Per-job mining parameters, as submitted with the job request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MiningParams {
    pub min_utility: f64,
    pub min_support: Option<u64>,
    pub max_pattern_length: Option<usize>,
    pub use_pruning: bool,
    /// How many transactions the worker materializes per storage read.
    pub batch_size: Option<usize>,
}

/// A mining job. Created by a job request; mutated only by the worker
/// that owns it (status transitions are compare-and-set).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MiningJob {
    pub id: Uuid,
    pub store_id: StoreId,
    pub params: MiningParams,
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub execution_time_seconds: Option<f64>,
    pub error_message: Option<String>,
    pub cancelled: bool,
    pub patterns_found: u64,
    /// The round this job's patterns were attributed to, once aggregated.
    pub round_id: Option<Uuid>,
}

impl MiningJob {
    /// A fresh `pending` job.
    pub fn new(store_id: StoreId, params: MiningParams, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            store_id,
            params,
            status: JobStatus::Pending,
            created_at: now,
            started_at: None,
            completed_at: None,
            execution_time_seconds: None,
            error_message: None,
            cancelled: false,
            patterns_found: 0,
            round_id: None,
        }
    }
}

/// A store-local high-utility itemset, written once by the mining worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocalPattern {
    pub job_id: Uuid,
    pub store_id: StoreId,
    /// The itemset, sorted ascending.
    pub items: Vec<ItemId>,
    pub utility: f64,
    pub support: u64,
    /// Informational metadata; aggregation does not propagate it.
    pub confidence: f64,
    /// The round this pattern was attributed to, once aggregated.
    pub round_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
}

/// The lifecycle of a federated round.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoundStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

/// A synchronous federated aggregation round. Round numbers are globally
/// unique and dense.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FederatedRound {
    pub id: Uuid,
    pub round_number: u64,
    pub status: RoundStatus,
    pub min_clients_required: usize,
    /// The ε consumed by this round. `0` disables noise.
    pub privacy_budget: f64,
    /// Seed of the per-round noise RNG, persisted for post-hoc
    /// reproducibility.
    pub noise_seed: [u8; 32],
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub participating_clients: u64,
    pub patterns_aggregated: u64,
    pub failure_reason: Option<String>,
}

/// An aggregated pattern, written once per `(round_id, items)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GlobalPattern {
    pub round_id: Uuid,
    /// The itemset, sorted ascending.
    pub items: Vec<ItemId>,
    pub aggregated_utility: f64,
    pub global_support: f64,
    pub contributing_stores: u64,
}
