//! The idle phase: waiting for a round request.

use async_trait::async_trait;
use chrono::Utc;
use rand::RngCore;
use tracing::{info, warn};
use tracing_futures::Instrument;
use uuid::Uuid;

use crate::{
    state_machine::{
        phases::{Collect, Phase, PhaseError, PhaseName, PhaseState, Shared},
        requests::{RequestError, RoundStarted, StartRound, StateMachineRequest},
        StateMachine,
    },
    storage::{FederatedRound, RoundStatus, Storage},
};

/// Idle state.
#[derive(Debug, Default)]
pub struct Idle {
    /// The round opened by the request that ended this phase.
    opened: Option<FederatedRound>,
}

#[async_trait]
impl<T> Phase<T> for PhaseState<Idle, T>
where
    T: Storage,
{
    const NAME: PhaseName = PhaseName::Idle;

    /// Waits for round requests, rejecting the ones that cannot be
    /// served, until one opens a round.
    async fn process(&mut self) -> Result<(), PhaseError> {
        loop {
            let (request, span, resp_tx) = self.next_request().await?;
            match self.handle_start_round(request).instrument(span).await {
                Ok(round) => {
                    let _ = resp_tx.send(Ok(RoundStarted {
                        round_id: round.id,
                        round_number: round.round_number,
                    }));
                    self.private.opened = Some(round);
                    return Ok(());
                }
                Err(err) => {
                    warn!("round request rejected: {}", err);
                    let _ = resp_tx.send(Err(err));
                }
            }
        }
    }

    async fn next(self) -> Option<StateMachine<T>> {
        match self.private.opened {
            Some(round) => Some(PhaseState::<Collect, _>::new(self.shared, round).into()),
            // Process only returns successfully once a round is open;
            // stay idle otherwise.
            None => Some(PhaseState::<Idle, _>::new(self.shared).into()),
        }
    }
}

impl<T> PhaseState<Idle, T>
where
    T: Storage,
{
    /// Creates a new idle state. Any previously owned round is done.
    pub fn new(mut shared: Shared<T>) -> Self {
        shared.state.current_round = None;
        Self {
            private: Idle::default(),
            shared,
        }
    }

    /// Validates a round request against the privacy budget and writes
    /// the `running` round row.
    async fn handle_start_round(
        &mut self,
        request: StateMachineRequest,
    ) -> Result<FederatedRound, RequestError> {
        let StateMachineRequest::StartRound(StartRound {
            min_clients,
            privacy_budget,
        }) = request;

        let epsilon = privacy_budget.unwrap_or(self.shared.state.epsilon_default);
        if !epsilon.is_finite() || epsilon < 0.0 {
            return Err(RequestError::InvalidPrivacyBudget);
        }
        let min_clients = min_clients
            .unwrap_or(self.shared.state.min_clients_default)
            .max(1);

        let consumed = self.shared.store.consumed_privacy_budget().await?;
        if consumed + epsilon > self.shared.state.budget_cap {
            info!(
                "rejecting round request: ε {} would exceed the remaining budget {}",
                epsilon,
                self.shared.state.budget_cap - consumed
            );
            return Err(RequestError::PrivacyBudgetExhausted);
        }

        let mut noise_seed = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut noise_seed);

        let round = self
            .shared
            .store
            .open_round(FederatedRound {
                id: Uuid::new_v4(),
                round_number: 0,
                status: RoundStatus::Pending,
                min_clients_required: min_clients,
                privacy_budget: epsilon,
                noise_seed,
                started_at: Utc::now(),
                completed_at: None,
                participating_clients: 0,
                patterns_aggregated: 0,
                failure_reason: None,
            })
            .await?;

        self.shared.set_round_number(round.round_number);
        self.shared.state.current_round = Some(round.id);
        info!(
            "opened round {} (number {}, min clients {}, ε {})",
            round.id, round.round_number, round.min_clients_required, round.privacy_budget
        );
        Ok(round)
    }
}
