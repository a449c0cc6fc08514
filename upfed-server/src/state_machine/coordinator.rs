//! Coordinator state.

use uuid::Uuid;

use crate::settings::{FederationSettings, PrivacySettings};

/// The state shared across all phases of the round state machine.
#[derive(Debug, Clone, PartialEq)]
pub struct CoordinatorState {
    /// The number of the most recently opened round.
    pub round_number: u64,
    /// The round currently owned by the machine, while one is in flight.
    pub current_round: Option<Uuid>,
    /// Default `min_clients_required` for rounds that do not specify one.
    pub min_clients_default: usize,
    /// Default per-round ε for rounds that do not specify one.
    pub epsilon_default: f64,
    /// The declared global sensitivity Δ.
    pub sensitivity: f64,
    /// The cumulative ε cap across completed rounds.
    pub budget_cap: f64,
}

impl CoordinatorState {
    pub fn new(
        round_number: u64,
        federation: FederationSettings,
        privacy: PrivacySettings,
    ) -> Self {
        Self {
            round_number,
            current_round: None,
            min_clients_default: federation.min_clients_required_default,
            epsilon_default: privacy.epsilon_default,
            sensitivity: privacy.sensitivity,
            budget_cap: privacy.budget_cap,
        }
    }
}
