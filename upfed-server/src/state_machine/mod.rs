//! The state machine that drives the federated round protocol.
//!
//! # Overview
//!
//! The coordinator owns the lifecycle of every [`FederatedRound`]. It
//! runs as a single task, moving through the following phases:
//!
//! - **Idle** waits on the request channel. A valid round request is
//!   checked against the cumulative privacy budget, assigned the next
//!   dense round number and written as a `running` round row; the
//!   requester receives `{round_id, round_number}` right away.
//! - **Collect** snapshots the active stores from the session registry
//!   and gathers, per store, the completed local patterns not yet
//!   attributed to a prior round. Too few contributing stores fail the
//!   round with `insufficient_clients`.
//! - **Aggregate** merges the patterns by canonical item set and, when
//!   the round's ε is positive, perturbs the aggregated utilities with
//!   Laplace noise drawn from a per-round seed persisted on the row.
//! - **Commit** writes all global patterns, the attribution marks and
//!   the completed round row in one storage transaction, then publishes
//!   the results on the event bus.
//! - **Failure** records a failed round (the row stays readable with its
//!   failure reason) and returns to Idle — or proceeds to **Shutdown**
//!   when the request channel is gone.
//!
//! Requests queued while a round is in flight are rejected with
//! `RoundInProgress` at every phase boundary, so at most one round is
//! ever `running` and rounds are strictly serialized by round number.
//!
//! [`FederatedRound`]: crate::storage::FederatedRound

pub mod coordinator;
pub mod events;
mod initializer;
pub mod phases;
pub mod requests;

pub use self::initializer::{StateMachineInitializationError, StateMachineInitializer};

use derive_more::From;

use self::phases::{
    Aggregate,
    Collect,
    Commit,
    Failure,
    Idle,
    PhaseState,
    Shutdown,
};
use crate::storage::Storage;

/// The state machine with all its states.
#[derive(From)]
pub enum StateMachine<T> {
    Idle(PhaseState<Idle, T>),
    Collect(PhaseState<Collect, T>),
    Aggregate(PhaseState<Aggregate, T>),
    Commit(PhaseState<Commit, T>),
    Failure(PhaseState<Failure, T>),
    Shutdown(PhaseState<Shutdown, T>),
}

impl<T> StateMachine<T>
where
    T: Storage,
{
    /// Moves the state machine to the next state and consumes the
    /// current one. Returns `None` once the machine reached `Shutdown`.
    pub async fn next(self) -> Option<Self> {
        match self {
            StateMachine::Idle(state) => state.run_phase().await,
            StateMachine::Collect(state) => state.run_phase().await,
            StateMachine::Aggregate(state) => state.run_phase().await,
            StateMachine::Commit(state) => state.run_phase().await,
            StateMachine::Failure(state) => state.run_phase().await,
            StateMachine::Shutdown(state) => state.run_phase().await,
        }
    }

    /// Runs the state machine until it shuts down, which happens once
    /// all request senders have been dropped.
    pub async fn run(mut self) -> Option<()> {
        loop {
            self = self.next().await?;
        }
    }

    #[cfg(test)]
    pub fn is_idle(&self) -> bool {
        matches!(self, StateMachine::Idle(_))
    }

    #[cfg(test)]
    pub fn is_collect(&self) -> bool {
        matches!(self, StateMachine::Collect(_))
    }

    #[cfg(test)]
    pub fn is_failure(&self) -> bool {
        matches!(self, StateMachine::Failure(_))
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use tracing::Span;
    use uuid::Uuid;

    use super::*;
    use crate::{
        sessions::SessionRegistry,
        settings::{FederationSettings, PrivacySettings, SessionSettings},
        state_machine::requests::{RequestError, StartRound},
        storage::{
            LocalPattern,
            MemoryStorage,
            MiningJob,
            MiningParams,
            RoundStatus,
            Storage,
        },
    };

    async fn seed_completed_job(
        storage: &MemoryStorage,
        store_id: &str,
        patterns: Vec<(Vec<u32>, f64, u64)>,
    ) -> Uuid {
        let job = MiningJob::new(
            store_id.to_string(),
            MiningParams {
                min_utility: 20.0,
                min_support: None,
                max_pattern_length: None,
                use_pruning: true,
                batch_size: None,
            },
            Utc::now(),
        );
        let job_id = job.id;
        storage.create_job(job).await.unwrap();
        storage.claim_job(job_id, Utc::now()).await.unwrap();
        let rows: Vec<LocalPattern> = patterns
            .into_iter()
            .map(|(items, utility, support)| LocalPattern {
                job_id,
                store_id: store_id.to_string(),
                items,
                utility,
                support,
                confidence: 0.0,
                round_id: None,
                created_at: Utc::now(),
            })
            .collect();
        storage.complete_job(job_id, rows, Utc::now(), 0.1).await.unwrap();
        job_id
    }

    async fn init(
        storage: MemoryStorage,
        federation: FederationSettings,
        privacy: PrivacySettings,
    ) -> (
        StateMachine<MemoryStorage>,
        crate::state_machine::requests::RequestSender,
        crate::state_machine::events::EventSubscriber,
    ) {
        let sessions = SessionRegistry::new(storage.clone(), &SessionSettings::default());
        StateMachineInitializer::new(federation, privacy, storage, sessions)
            .init()
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_round_with_two_clients() {
        let storage = MemoryStorage::new();
        let sessions = SessionRegistry::new(storage.clone(), &SessionSettings::default());
        sessions.register("s1", "one", None).await.unwrap();
        sessions.register("s2", "two", None).await.unwrap();
        seed_completed_job(&storage, "s1", vec![(vec![2], 30.0, 2), (vec![2, 3], 37.0, 2)]).await;
        seed_completed_job(&storage, "s2", vec![(vec![2], 12.0, 1), (vec![1, 2], 25.0, 1)]).await;

        let (machine, request_tx, _events) = init(
            storage.clone(),
            FederationSettings::default(),
            PrivacySettings::default(),
        )
        .await;
        assert!(machine.is_idle());

        let request = async {
            request_tx
                .start_round(
                    StartRound {
                        min_clients: Some(2),
                        privacy_budget: Some(0.0),
                    },
                    Span::none(),
                )
                .await
                .unwrap()
        };
        let transition = async { machine.next().await.unwrap() };
        let (started, machine) = tokio::join!(request, transition);
        assert_eq!(started.round_number, 1);
        assert!(machine.is_collect());

        // Collect -> Aggregate -> Commit -> Idle.
        let machine = machine.next().await.unwrap();
        let machine = machine.next().await.unwrap();
        let machine = machine.next().await.unwrap();
        assert!(machine.is_idle());

        let round = storage.round(started.round_id).await.unwrap().unwrap();
        assert_eq!(round.status, RoundStatus::Completed);
        assert_eq!(round.participating_clients, 2);
        assert_eq!(round.patterns_aggregated, 3);

        let globals = storage.global_patterns(started.round_id).await.unwrap();
        assert_eq!(globals.len(), 3);
        let b = globals.iter().find(|g| g.items == vec![2]).unwrap();
        assert_eq!(b.aggregated_utility, 42.0);
        assert_eq!(b.contributing_stores, 2);
    }

    #[tokio::test]
    async fn test_insufficient_clients_fails_round_and_keeps_patterns() {
        let storage = MemoryStorage::new();
        let sessions = SessionRegistry::new(storage.clone(), &SessionSettings::default());
        sessions.register("s1", "one", None).await.unwrap();
        seed_completed_job(&storage, "s1", vec![(vec![2], 30.0, 2)]).await;

        let (machine, request_tx, _events) = init(
            storage.clone(),
            FederationSettings::default(),
            PrivacySettings::default(),
        )
        .await;

        let request = async {
            request_tx
                .start_round(
                    StartRound {
                        min_clients: Some(2),
                        privacy_budget: Some(0.0),
                    },
                    Span::none(),
                )
                .await
                .unwrap()
        };
        let transition = async { machine.next().await.unwrap() };
        let (started, machine) = tokio::join!(request, transition);

        // Collect fails straight into the failure phase.
        let machine = machine.next().await.unwrap();
        assert!(machine.is_failure());
        let machine = machine.next().await.unwrap();
        assert!(machine.is_idle());

        let round = storage.round(started.round_id).await.unwrap().unwrap();
        assert_eq!(round.status, RoundStatus::Failed);
        assert_eq!(round.failure_reason.as_deref(), Some("insufficient_clients"));
        assert!(storage.global_patterns(started.round_id).await.unwrap().is_empty());

        // S1's patterns stay eligible for the next round.
        let contributions = storage
            .collect_contributions(&["s1".to_string()])
            .await
            .unwrap();
        assert_eq!(contributions.len(), 1);
    }

    #[tokio::test]
    async fn test_store_without_patterns_still_counts_as_participant() {
        let storage = MemoryStorage::new();
        let sessions = SessionRegistry::new(storage.clone(), &SessionSettings::default());
        sessions.register("s1", "one", None).await.unwrap();
        sessions.register("s2", "empty", None).await.unwrap();
        seed_completed_job(&storage, "s1", vec![(vec![2], 30.0, 2)]).await;
        // s2 mined an empty store: a completed job with zero patterns.
        seed_completed_job(&storage, "s2", vec![]).await;

        let (machine, request_tx, _events) = init(
            storage.clone(),
            FederationSettings::default(),
            PrivacySettings::default(),
        )
        .await;

        let request = async {
            request_tx
                .start_round(
                    StartRound {
                        min_clients: Some(2),
                        privacy_budget: Some(0.0),
                    },
                    Span::none(),
                )
                .await
                .unwrap()
        };
        let transition = async { machine.next().await.unwrap() };
        let (started, machine) = tokio::join!(request, transition);

        let machine = machine.next().await.unwrap();
        let machine = machine.next().await.unwrap();
        let machine = machine.next().await.unwrap();
        assert!(machine.is_idle());

        let round = storage.round(started.round_id).await.unwrap().unwrap();
        assert_eq!(round.status, RoundStatus::Completed);
        assert_eq!(round.participating_clients, 2);
        assert_eq!(round.patterns_aggregated, 1);
    }

    #[tokio::test]
    async fn test_privacy_budget_exhaustion_rejects_round_requests() {
        let storage = MemoryStorage::new();
        let sessions = SessionRegistry::new(storage.clone(), &SessionSettings::default());
        sessions.register("s1", "one", None).await.unwrap();
        seed_completed_job(&storage, "s1", vec![(vec![2], 30.0, 2)]).await;

        let privacy = PrivacySettings {
            budget_cap: 1.0,
            ..PrivacySettings::default()
        };
        let (machine, request_tx, events) =
            init(storage.clone(), FederationSettings::default(), privacy).await;
        let driver = tokio::spawn(machine.run());

        // The first round consumes the whole cap.
        let started = request_tx
            .start_round(
                StartRound {
                    min_clients: Some(1),
                    privacy_budget: Some(1.0),
                },
                Span::none(),
            )
            .await
            .unwrap();

        // Wait until the round is committed and the machine is idle
        // again, so the next request cannot be purged as outdated.
        let phase_events = events.phase_listener();
        for _ in 0..100 {
            let round = storage.round(started.round_id).await.unwrap().unwrap();
            if round.status == RoundStatus::Completed
                && phase_events.get_latest().event == phases::PhaseName::Idle
            {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }

        let err = request_tx
            .start_round(
                StartRound {
                    min_clients: Some(1),
                    privacy_budget: Some(0.5),
                },
                Span::none(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, RequestError::PrivacyBudgetExhausted));

        // An ε = 0 round still fits the exhausted budget and is opened
        // (it then fails for lack of fresh patterns, which is fine).
        let zero = request_tx
            .start_round(
                StartRound {
                    min_clients: Some(1),
                    privacy_budget: Some(0.0),
                },
                Span::none(),
            )
            .await
            .unwrap();
        assert_eq!(zero.round_number, 2);

        drop(request_tx);
        let _ = driver.await;
    }

    #[tokio::test]
    async fn test_inactive_store_does_not_count() {
        let storage = MemoryStorage::new();
        let sessions = SessionRegistry::new(storage.clone(), &SessionSettings::default());
        sessions.register("s1", "one", None).await.unwrap();
        seed_completed_job(&storage, "s1", vec![(vec![2], 30.0, 2)]).await;

        // Backdate the heartbeat past the liveness bound and sweep.
        let mut record = storage.store_record("s1").await.unwrap().unwrap();
        record.last_seen = Utc::now() - chrono::Duration::seconds(120);
        storage.upsert_store(record).await.unwrap();
        sessions.sweep().await.unwrap();

        let (machine, request_tx, _events) = init(
            storage.clone(),
            FederationSettings::default(),
            PrivacySettings::default(),
        )
        .await;

        let request = async {
            request_tx
                .start_round(
                    StartRound {
                        min_clients: Some(1),
                        privacy_budget: Some(0.0),
                    },
                    Span::none(),
                )
                .await
                .unwrap()
        };
        let transition = async { machine.next().await.unwrap() };
        let (started, machine) = tokio::join!(request, transition);

        let machine = machine.next().await.unwrap();
        assert!(machine.is_failure());
        let _ = machine.next().await.unwrap();

        let round = storage.round(started.round_id).await.unwrap().unwrap();
        assert_eq!(round.status, RoundStatus::Failed);
        assert_eq!(round.failure_reason.as_deref(), Some("insufficient_clients"));
    }

    #[tokio::test]
    async fn test_startup_sweep_reaps_running_rounds() {
        let storage = MemoryStorage::new();
        // A round left running by a crashed coordinator.
        let abandoned = storage
            .open_round(crate::storage::FederatedRound {
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
            .unwrap();

        let (_machine, _request_tx, _events) = init(
            storage.clone(),
            FederationSettings::default(),
            PrivacySettings::default(),
        )
        .await;

        let round = storage.round(abandoned.id).await.unwrap().unwrap();
        assert_eq!(round.status, RoundStatus::Failed);
        assert_eq!(round.failure_reason.as_deref(), Some("coordinator_restart"));
    }

    #[tokio::test]
    async fn test_shutdown_when_senders_are_dropped() {
        let storage = MemoryStorage::new();
        let (machine, request_tx, _events) = init(
            storage,
            FederationSettings::default(),
            PrivacySettings::default(),
        )
        .await;
        let driver = tokio::spawn(machine.run());
        drop(request_tx);
        assert!(driver.await.unwrap().is_none());
    }
}
