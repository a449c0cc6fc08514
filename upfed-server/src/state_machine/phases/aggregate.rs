//! The aggregate phase: merge store-local patterns and apply noise.

use std::collections::{BTreeMap, HashSet};

use async_trait::async_trait;
use rand::SeedableRng;
use rand_chacha::ChaCha20Rng;
use tracing::info;
use uuid::Uuid;

use upfed_core::ItemId;

use crate::{
    privacy::NoiseMechanism,
    state_machine::{
        phases::{Commit, Phase, PhaseError, PhaseName, PhaseState, Shared},
        StateMachine,
    },
    storage::{FederatedRound, GlobalPattern, Storage, StoreContribution},
};

/// Aggregate state.
#[derive(Debug)]
pub struct Aggregate {
    round: FederatedRound,
    contributions: Vec<StoreContribution>,
    job_ids: Vec<Uuid>,
    globals: Vec<GlobalPattern>,
}

#[async_trait]
impl<T> Phase<T> for PhaseState<Aggregate, T>
where
    T: Storage,
{
    const NAME: PhaseName = PhaseName::Aggregate;

    /// Groups the collected patterns by canonical item set, computes the
    /// aggregates and, when ε > 0, perturbs them with Laplace noise
    /// drawn from the persisted per-round seed.
    async fn process(&mut self) -> Result<(), PhaseError> {
        let mechanism = NoiseMechanism::for_round(
            self.private.round.privacy_budget,
            self.shared.state.sensitivity,
        );
        let mut rng = ChaCha20Rng::from_seed(self.private.round.noise_seed);

        self.private.job_ids = self
            .private
            .contributions
            .iter()
            .flat_map(|c| c.job_ids.iter().copied())
            .collect();
        self.private.globals = aggregate_contributions(
            self.private.round.id,
            &self.private.contributions,
            mechanism,
            &mut rng,
        );
        self.private.round.patterns_aggregated = self.private.globals.len() as u64;

        info!(
            "aggregated {} global pattern(s) for round {} (noise: {})",
            self.private.globals.len(),
            self.private.round.round_number,
            match mechanism {
                NoiseMechanism::None => "off",
                NoiseMechanism::Laplace { .. } => "laplace",
            }
        );
        Ok(())
    }

    async fn next(self) -> Option<StateMachine<T>> {
        Some(
            PhaseState::<Commit, _>::new(
                self.shared,
                self.private.round,
                self.private.job_ids,
                self.private.globals,
            )
            .into(),
        )
    }
}

impl<T> PhaseState<Aggregate, T>
where
    T: Storage,
{
    /// Creates a new aggregate state from the collected contributions.
    pub fn new(
        shared: Shared<T>,
        round: FederatedRound,
        contributions: Vec<StoreContribution>,
    ) -> Self {
        Self {
            private: Aggregate {
                round,
                contributions,
                job_ids: Vec::new(),
                globals: Vec::new(),
            },
            shared,
        }
    }
}

#[derive(Debug, Default)]
struct Group {
    utility: f64,
    /// `Σ_k support_k · |D_k|` over the stores contributing the pattern.
    weighted_support: f64,
    /// `Σ_k |D_k|` over the same stores.
    weight: f64,
    stores: HashSet<String>,
}

/// Merges the collected patterns by canonical item set.
///
/// For each group: `aggregated_utility = Σ_k u_k(X)`, `global_support`
/// is the `|D_k|`-weighted average of the per-store supports and
/// `contributing_stores` counts distinct stores. Groups are processed in
/// canonical item order so the injected noise is reproducible from the
/// round seed; groups whose perturbed utility is not positive are
/// dropped.
fn aggregate_contributions(
    round_id: Uuid,
    contributions: &[StoreContribution],
    mechanism: NoiseMechanism,
    rng: &mut ChaCha20Rng,
) -> Vec<GlobalPattern> {
    let mut groups: BTreeMap<Vec<ItemId>, Group> = BTreeMap::new();
    for contribution in contributions {
        for pattern in &contribution.patterns {
            let group = groups.entry(pattern.items.clone()).or_default();
            group.utility += pattern.utility;
            group.weighted_support +=
                pattern.support as f64 * contribution.transaction_count as f64;
            group.weight += contribution.transaction_count as f64;
            group.stores.insert(contribution.store_id.clone());
        }
    }

    let mut globals = Vec::with_capacity(groups.len());
    for (items, group) in groups {
        let aggregated_utility = mechanism.perturb(group.utility, rng);
        if let NoiseMechanism::Laplace { .. } = mechanism {
            if aggregated_utility <= 0.0 {
                continue;
            }
        }
        let global_support = if group.weight > 0.0 {
            group.weighted_support / group.weight
        } else {
            0.0
        };
        globals.push(GlobalPattern {
            round_id,
            items,
            aggregated_utility,
            global_support,
            contributing_stores: group.stores.len() as u64,
        });
    }
    globals
}
