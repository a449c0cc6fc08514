//! The commit phase: persist the round outcome in one transaction.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tracing::info;
use uuid::Uuid;

use crate::{
    state_machine::{
        events::{GlobalPatternsUpdate, RoundUpdate},
        phases::{Idle, Phase, PhaseError, PhaseName, PhaseState, Shared},
        StateMachine,
    },
    storage::{FederatedRound, GlobalPattern, RoundStatus, Storage},
};

/// Commit state.
#[derive(Debug)]
pub struct Commit {
    round: FederatedRound,
    job_ids: Vec<Uuid>,
    globals: Vec<GlobalPattern>,
}

#[async_trait]
impl<T> Phase<T> for PhaseState<Commit, T>
where
    T: Storage,
{
    const NAME: PhaseName = PhaseName::Commit;

    /// Writes every global pattern, the attribution marks and the
    /// completed round row atomically, then publishes the results.
    async fn process(&mut self) -> Result<(), PhaseError> {
        self.private.round.status = RoundStatus::Completed;
        self.private.round.completed_at = Some(Utc::now());

        self.shared
            .store
            .commit_round(
                self.private.round.clone(),
                &self.private.job_ids,
                self.private.globals.clone(),
            )
            .await?;

        info!(
            "round {} committed: {} global pattern(s) from {} store(s)",
            self.private.round.round_number,
            self.private.round.patterns_aggregated,
            self.private.round.participating_clients
        );

        let events = &mut self.shared.events;
        events.broadcast_round(RoundUpdate::New(Arc::new(self.private.round.clone())));
        events.broadcast_patterns(GlobalPatternsUpdate::New(Arc::new(
            self.private.globals.clone(),
        )));
        Ok(())
    }

    async fn next(self) -> Option<StateMachine<T>> {
        Some(PhaseState::<Idle, _>::new(self.shared).into())
    }
}

impl<T> PhaseState<Commit, T>
where
    T: Storage,
{
    /// Creates a new commit state from the aggregated round.
    pub fn new(
        shared: Shared<T>,
        round: FederatedRound,
        job_ids: Vec<Uuid>,
        globals: Vec<GlobalPattern>,
    ) -> Self {
        Self {
            private: Commit {
                round,
                job_ids,
                globals,
            },
            shared,
        }
    }
}
