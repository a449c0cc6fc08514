//! The round request channel into the state machine.

use derive_more::From;
use displaydoc::Display;
use futures::future::FutureExt;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tracing::Span;
use uuid::Uuid;

use crate::storage::StorageError;

/// Errors which can occur while the coordinator handles a round request.
#[derive(Debug, Display, Error)]
pub enum RequestError {
    /// Another round is already in progress.
    RoundInProgress,
    /// The cumulative privacy budget is exhausted.
    PrivacyBudgetExhausted,
    /// The requested privacy budget is not a finite, non-negative number.
    InvalidPrivacyBudget,
    /// The request could not be processed due to an internal error: {0}.
    InternalError(&'static str),
    /// Storage request failed: {0}.
    Storage(#[from] StorageError),
}

/// A request to open a federated round.
#[derive(Debug, Clone, PartialEq)]
pub struct StartRound {
    /// Overrides the configured default for `min_clients_required`.
    pub min_clients: Option<usize>,
    /// The ε for this round. Overrides the configured default; `0`
    /// disables noise.
    pub privacy_budget: Option<f64>,
}

/// The acknowledgement returned once the round row has been written.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RoundStarted {
    pub round_id: Uuid,
    pub round_number: u64,
}

/// A [`StateMachine`] request.
///
/// [`StateMachine`]: crate::state_machine
#[derive(Debug, From)]
pub enum StateMachineRequest {
    StartRound(StartRound),
}

/// A channel for the state machine to send the response to a
/// [`StateMachineRequest`].
pub(in crate::state_machine) type ResponseSender =
    oneshot::Sender<Result<RoundStarted, RequestError>>;

/// A handle to send requests to the [`StateMachine`].
///
/// [`StateMachine`]: crate::state_machine
#[derive(Clone, From, Debug)]
pub struct RequestSender(mpsc::UnboundedSender<(StateMachineRequest, Span, ResponseSender)>);

impl RequestSender {
    /// Requests a new round and waits for the acknowledgement.
    ///
    /// # Errors
    /// Fails when the request is rejected (round in progress, privacy
    /// budget exhausted) or when the state machine has shut down.
    pub async fn start_round(
        &self,
        request: StartRound,
        span: Span,
    ) -> Result<RoundStarted, RequestError> {
        let (resp_tx, resp_rx) = oneshot::channel();
        self.0
            .send((request.into(), span, resp_tx))
            .map_err(|_| {
                RequestError::InternalError(
                    "failed to send request to the state machine: state machine is shutting down",
                )
            })?;
        resp_rx.await.map_err(|_| {
            RequestError::InternalError("failed to receive response from the state machine")
        })?
    }

    #[cfg(test)]
    pub fn is_closed(&self) -> bool {
        self.0.is_closed()
    }
}

/// The receiver half of the request channel.
#[derive(From, Debug)]
pub struct RequestReceiver(mpsc::UnboundedReceiver<(StateMachineRequest, Span, ResponseSender)>);

impl RequestReceiver {
    /// Creates a new request channel.
    pub fn new() -> (Self, RequestSender) {
        let (tx, rx) = mpsc::unbounded_channel();
        (RequestReceiver::from(rx), RequestSender::from(tx))
    }

    /// Closes the channel; already queued requests stay receivable.
    pub fn close(&mut self) {
        self.0.close()
    }

    /// Receives the next request.
    pub async fn recv(&mut self) -> Option<(StateMachineRequest, Span, ResponseSender)> {
        self.0.recv().await
    }

    /// Tries to retrieve the next request without blocking.
    ///
    /// `Some(None)` means the channel is closed and drained.
    pub fn try_recv(&mut self) -> Option<Option<(StateMachineRequest, Span, ResponseSender)>> {
        self.0.recv().now_or_never()
    }
}
