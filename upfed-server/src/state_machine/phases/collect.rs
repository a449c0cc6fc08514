//! The collect phase: gather eligible local patterns across stores.

use async_trait::async_trait;
use tracing::info;

use crate::{
    state_machine::{
        phases::{Aggregate, Phase, PhaseError, PhaseName, PhaseState, Shared},
        StateMachine,
    },
    storage::{FederatedRound, Storage, StoreContribution},
};

/// Collect state.
#[derive(Debug)]
pub struct Collect {
    round: FederatedRound,
    contributions: Vec<StoreContribution>,
}

#[async_trait]
impl<T> Phase<T> for PhaseState<Collect, T>
where
    T: Storage,
{
    const NAME: PhaseName = PhaseName::Collect;

    /// Snapshots the active stores and gathers their not-yet-attributed
    /// completed patterns. Not interruptible once started: round
    /// attribution stays atomic.
    async fn process(&mut self) -> Result<(), PhaseError> {
        let active = self.shared.sessions.active_stores().await?;
        info!("{} active store(s) at collect time", active.len());

        let contributions = self.shared.store.collect_contributions(&active).await?;
        let participating = contributions.len();
        info!(
            "{} store(s) contribute to round {}",
            participating, self.private.round.round_number
        );

        if participating < self.private.round.min_clients_required {
            return Err(PhaseError::InsufficientClients {
                participating,
                required: self.private.round.min_clients_required,
            });
        }

        self.private.round.participating_clients = participating as u64;
        self.private.contributions = contributions;
        Ok(())
    }

    async fn next(self) -> Option<StateMachine<T>> {
        Some(
            PhaseState::<Aggregate, _>::new(
                self.shared,
                self.private.round,
                self.private.contributions,
            )
            .into(),
        )
    }
}

impl<T> PhaseState<Collect, T>
where
    T: Storage,
{
    /// Creates a new collect state for the freshly opened round.
    pub fn new(shared: Shared<T>, round: FederatedRound) -> Self {
        Self {
            private: Collect {
                round,
                contributions: Vec::new(),
            },
            shared,
        }
    }
}
