//! The failure phase: record the failed round and recover.

use async_trait::async_trait;
use chrono::Utc;
use tracing::{info, warn};

use crate::{
    state_machine::{
        phases::{Idle, Phase, PhaseError, PhaseName, PhaseState, Shared, Shutdown},
        StateMachine,
    },
    storage::Storage,
};

/// Failure state.
#[derive(Debug)]
pub struct Failure {
    error: PhaseError,
}

#[async_trait]
impl<T> Phase<T> for PhaseState<Failure, T>
where
    T: Storage,
{
    const NAME: PhaseName = PhaseName::Failure;

    /// Marks the in-flight round (if any) as failed with a stable
    /// reason. The round row stays readable so callers can observe the
    /// failure's cause.
    async fn process(&mut self) -> Result<(), PhaseError> {
        warn!("round processing failed: {}", self.private.error);

        if let Some(round_id) = self.shared.state.current_round.take() {
            let reason = self.private.error.failure_reason();
            match self
                .shared
                .store
                .fail_round(round_id, reason, Utc::now())
                .await
            {
                Ok(true) => info!("round {} marked failed: {}", round_id, reason),
                Ok(false) => warn!("round {} was not running anymore", round_id),
                Err(err) => warn!("failed to record the round failure: {}", err),
            }
        }
        Ok(())
    }

    /// Recovers to idle, or shuts down when the request channel is gone.
    async fn next(self) -> Option<StateMachine<T>> {
        if let PhaseError::RequestChannel(_) = self.private.error {
            return Some(PhaseState::<Shutdown, _>::new(self.shared).into());
        }
        Some(PhaseState::<Idle, _>::new(self.shared).into())
    }
}

impl<T> PhaseState<Failure, T> {
    /// Creates a new failure state from the error that caused it.
    pub fn new(shared: Shared<T>, error: PhaseError) -> Self {
        Self {
            private: Failure { error },
            shared,
        }
    }
}
