//! Initialization of the round state machine.

use chrono::Utc;
use thiserror::Error;
use tracing::warn;

use crate::{
    sessions::SessionRegistry,
    settings::{FederationSettings, PrivacySettings},
    state_machine::{
        coordinator::CoordinatorState,
        events::{EventPublisher, EventSubscriber},
        phases::{Idle, PhaseName, PhaseState, Shared},
        requests::{RequestReceiver, RequestSender},
        StateMachine,
    },
    storage::{Storage, StorageError},
};

/// An error that can occur during the initialization of the
/// [`StateMachine`].
#[derive(Debug, Error)]
pub enum StateMachineInitializationError {
    #[error("reaping abandoned rounds failed: {0}")]
    ReapRounds(StorageError),
    #[error("restoring the round counter failed: {0}")]
    RestoreRoundNumber(StorageError),
}

/// Initializes a new [`StateMachine`].
pub struct StateMachineInitializer<T> {
    federation: FederationSettings,
    privacy: PrivacySettings,
    store: T,
    sessions: SessionRegistry<T>,
}

impl<T> StateMachineInitializer<T>
where
    T: Storage,
{
    pub fn new(
        federation: FederationSettings,
        privacy: PrivacySettings,
        store: T,
        sessions: SessionRegistry<T>,
    ) -> Self {
        Self {
            federation,
            privacy,
            store,
            sessions,
        }
    }

    /// Initializes the state machine:
    ///
    /// 1. fails every round left `running` by a crash (a running round
    ///    cannot be resumed: its collect snapshot is gone),
    /// 2. restores the round counter from the highest persisted round,
    /// 3. wires the request channel and the event bus.
    pub async fn init(
        self,
    ) -> Result<
        (StateMachine<T>, RequestSender, EventSubscriber),
        StateMachineInitializationError,
    > {
        let reaped = self
            .store
            .reap_running_rounds("coordinator_restart", Utc::now())
            .await
            .map_err(StateMachineInitializationError::ReapRounds)?;
        if !reaped.is_empty() {
            warn!("reaped {} round(s) left running by a previous run", reaped.len());
        }

        let round_number = self
            .store
            .rounds()
            .await
            .map_err(StateMachineInitializationError::RestoreRoundNumber)?
            .last()
            .map(|round| round.round_number)
            .unwrap_or(0);

        let state = CoordinatorState::new(round_number, self.federation, self.privacy);
        let (events, subscriber) = EventPublisher::init(round_number, PhaseName::Idle);
        let (request_rx, request_tx) = RequestReceiver::new();

        let shared = Shared::new(state, events, request_rx, self.store, self.sessions);
        let machine = StateMachine::from(PhaseState::<Idle, _>::new(shared));
        Ok((machine, request_tx, subscriber))
    }
}
