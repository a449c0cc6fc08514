//! The phase states of the round [`StateMachine`].
//!
//! [`StateMachine`]: crate::state_machine::StateMachine

mod aggregate;
mod collect;
mod commit;
mod failure;
mod idle;
mod shutdown;

pub use self::{
    aggregate::Aggregate,
    collect::Collect,
    commit::Commit,
    failure::Failure,
    idle::Idle,
    shutdown::Shutdown,
};

use std::fmt;

use async_trait::async_trait;
use derive_more::Display;
use thiserror::Error;
use tracing::{debug, error, error_span, info, warn, Span};
use tracing_futures::Instrument;

use crate::{
    sessions::{SessionError, SessionRegistry},
    state_machine::{
        coordinator::CoordinatorState,
        events::EventPublisher,
        requests::{RequestError, RequestReceiver, ResponseSender, StateMachineRequest},
        StateMachine,
    },
    storage::{Storage, StorageError},
};

/// The name of the current phase.
#[derive(Clone, Copy, Debug, Display, Eq, PartialEq)]
pub enum PhaseName {
    #[display(fmt = "Idle")]
    Idle,
    #[display(fmt = "Collect")]
    Collect,
    #[display(fmt = "Aggregate")]
    Aggregate,
    #[display(fmt = "Commit")]
    Commit,
    #[display(fmt = "Failure")]
    Failure,
    #[display(fmt = "Shutdown")]
    Shutdown,
}

/// An error that fails the phase (and with it, the in-flight round).
#[derive(Debug, Error)]
pub enum PhaseError {
    #[error("request channel error: {0}")]
    RequestChannel(&'static str),
    #[error("storage failed: {0}")]
    Storage(#[from] StorageError),
    #[error("insufficient clients: {participating} store(s) contributed, {required} required")]
    InsufficientClients {
        participating: usize,
        required: usize,
    },
}

impl PhaseError {
    /// The stable failure code recorded on the round row.
    pub fn failure_reason(&self) -> &'static str {
        match self {
            PhaseError::InsufficientClients { .. } => "insufficient_clients",
            PhaseError::Storage(_) => "storage_error",
            PhaseError::RequestChannel(_) => "coordinator_shutdown",
        }
    }
}

impl From<SessionError> for PhaseError {
    fn from(err: SessionError) -> Self {
        match err {
            SessionError::Storage(err) => PhaseError::Storage(err),
            SessionError::UnknownStore(id) => {
                PhaseError::Storage(StorageError::new(format!("unknown store {}", id)))
            }
        }
    }
}

/// A trait that must be implemented by a state in order to move to a next
/// state.
#[async_trait]
pub trait Phase<T>
where
    T: Storage,
{
    /// The name of the current phase.
    const NAME: PhaseName;

    /// Performs the tasks of this phase.
    async fn process(&mut self) -> Result<(), PhaseError>;

    /// Moves from this phase to the next phase.
    async fn next(self) -> Option<StateMachine<T>>;
}

/// The coordinator state and the I/O interfaces shared by all phase
/// states.
pub struct Shared<T> {
    /// The coordinator state.
    pub(in crate::state_machine) state: CoordinatorState,
    /// The request receiver half.
    pub(in crate::state_machine) request_rx: RequestReceiver,
    /// The event publisher.
    pub(in crate::state_machine) events: EventPublisher,
    /// The persistence interface.
    pub(in crate::state_machine) store: T,
    /// The session registry feeding the eligibility snapshot.
    pub(in crate::state_machine) sessions: SessionRegistry<T>,
}

impl<T> fmt::Debug for Shared<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Shared")
            .field("state", &self.state)
            .field("request_rx", &self.request_rx)
            .field("events", &self.events)
            .finish()
    }
}

impl<T> Shared<T> {
    /// Creates a new shared state.
    pub fn new(
        state: CoordinatorState,
        events: EventPublisher,
        request_rx: RequestReceiver,
        store: T,
        sessions: SessionRegistry<T>,
    ) -> Self {
        Self {
            state,
            request_rx,
            events,
            store,
            sessions,
        }
    }

    /// Sets the round number on the state and the event publisher.
    pub fn set_round_number(&mut self, round_number: u64) {
        self.state.round_number = round_number;
        self.events.set_round_number(round_number);
    }

    /// Returns the current round number.
    pub fn round_number(&self) -> u64 {
        self.state.round_number
    }
}

/// The state corresponding to a phase of the round protocol.
///
/// This contains the phase-dependent `private` state and the
/// state-independent `shared` state which is carried across transitions.
pub struct PhaseState<S, T> {
    /// The private state.
    pub(in crate::state_machine) private: S,
    /// The shared coordinator state and I/O interfaces.
    pub(in crate::state_machine) shared: Shared<T>,
}

impl<S, T> PhaseState<S, T>
where
    S: Send,
    T: Storage,
    Self: Phase<T>,
{
    /// Runs the current phase to completion.
    ///
    /// 1. Performs the phase tasks.
    /// 2. Purges round requests that queued up while the phase ran.
    /// 3. Transitions to the next phase.
    pub async fn run_phase(mut self) -> Option<StateMachine<T>> {
        let phase = Self::NAME;
        let span = error_span!("run_phase", phase = %phase);

        async move {
            info!("starting phase");
            self.shared.events.broadcast_phase(phase);

            if let Err(err) = self.process().await {
                warn!("failed to perform the phase tasks");
                return Some(self.into_failure_state(err));
            }
            info!("phase ran successfully");

            if let Err(err) = self.purge_outdated_requests() {
                warn!("failed to purge outdated requests");
                match phase {
                    PhaseName::Failure | PhaseName::Shutdown => {
                        debug!(
                            "already in {} phase: ignoring error while purging requests",
                            phase,
                        );
                    }
                    _ => return Some(self.into_failure_state(err)),
                }
            }

            info!("transitioning to the next phase");
            self.next().await
        }
        .instrument(span)
        .await
    }

    /// Rejects every round request that queued up during this phase: a
    /// round is in flight, so they cannot be served.
    fn purge_outdated_requests(&mut self) -> Result<(), PhaseError> {
        while let Some((_, span, resp_tx)) = self.try_next_request()? {
            let _span_guard = span.enter();
            debug!("discarding round request queued during the {} phase", Self::NAME);
            let _ = resp_tx.send(Err(RequestError::RoundInProgress));
        }
        Ok(())
    }
}

impl<S, T> PhaseState<S, T> {
    /// Receives the next [`StateMachineRequest`].
    ///
    /// # Errors
    /// Returns [`PhaseError::RequestChannel`] when all sender halves have
    /// been dropped.
    pub async fn next_request(
        &mut self,
    ) -> Result<(StateMachineRequest, Span, ResponseSender), PhaseError> {
        debug!("waiting for the next incoming request");
        self.shared.request_rx.recv().await.ok_or_else(|| {
            error!("request receiver broken: senders have been dropped");
            PhaseError::RequestChannel("all request senders have been dropped!")
        })
    }

    pub fn try_next_request(
        &mut self,
    ) -> Result<Option<(StateMachineRequest, Span, ResponseSender)>, PhaseError> {
        match self.shared.request_rx.try_recv() {
            Some(Some(item)) => Ok(Some(item)),
            None => {
                debug!("no pending request");
                Ok(None)
            }
            Some(None) => {
                warn!("failed to get next pending request: channel shut down");
                Err(PhaseError::RequestChannel(
                    "all request senders have been dropped!",
                ))
            }
        }
    }

    fn into_failure_state(self, err: PhaseError) -> StateMachine<T> {
        PhaseState::<Failure, _>::new(self.shared, err).into()
    }
}
