//! The shutdown phase.

use async_trait::async_trait;
use tracing::debug;

use crate::{
    state_machine::{
        phases::{Phase, PhaseError, PhaseName, PhaseState, Shared},
        requests::RequestError,
        StateMachine,
    },
    storage::Storage,
};

/// Shutdown state.
#[derive(Debug)]
pub struct Shutdown;

#[async_trait]
impl<T> Phase<T> for PhaseState<Shutdown, T>
where
    T: Storage,
{
    const NAME: PhaseName = PhaseName::Shutdown;

    /// Closes the request channel and consumes the remaining requests.
    async fn process(&mut self) -> Result<(), PhaseError> {
        self.shared.request_rx.close();
        while let Some((_, _, resp_tx)) = self.shared.request_rx.recv().await {
            debug!("rejecting request received during shutdown");
            let _ = resp_tx.send(Err(RequestError::InternalError(
                "the coordinator is shutting down",
            )));
        }
        Ok(())
    }

    async fn next(self) -> Option<StateMachine<T>> {
        None
    }
}

impl<T> PhaseState<Shutdown, T> {
    /// Creates a new shutdown state.
    pub fn new(shared: Shared<T>) -> Self {
        Self {
            private: Shutdown,
            shared,
        }
    }
}
