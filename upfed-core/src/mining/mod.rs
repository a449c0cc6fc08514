//! The UP-Growth mining engine with pseudo-projection.
//!
//! Mining runs in three passes over an in-memory transaction snapshot:
//!
//! 1. **Global TWU.** Every item's transaction-weighted utility is
//!    accumulated; items below the threshold are discarded (DGU) — TWU is
//!    monotone over supersets, so none of them can appear in a result.
//!    The surviving items are ordered by TWU descending, ties broken by
//!    item id ascending. That ordering is fixed for the whole run.
//! 2. **Tree construction.** Each transaction is filtered and sorted into
//!    the global order and inserted into the master [`UpTree`]; the
//!    utility recorded at each node is the residual path utility (DGN).
//! 3. **Mining.** Suffix items are processed in reverse order (least TWU
//!    first). The conditional pattern base of a suffix is a
//!    [`PathProjection`] over the master tree; recursion narrows the
//!    projection instead of building conditional trees. Candidates are
//!    emitted only after their exact utility, read back out of the
//!    transaction index, meets the threshold.

mod cache;
mod projection;
mod tree;

pub use self::{
    cache::MiningCaches,
    projection::{PathProjection, ProjectionEntry},
    tree::{NodeRef, UpNode, UpTree},
};

use std::{
    collections::HashMap,
    time::{Duration, Instant},
};

use thiserror::Error;

use crate::{pattern::Pattern, transaction::Transaction, ItemId, Utility};

/// An error raised before the first mining pass.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum MiningError {
    #[error("minimum utility must be a finite, non-negative number (got {0})")]
    InvalidMinUtility(f64),
    #[error("minimum support must be at least 1 transaction when set")]
    InvalidMinSupport,
}

/// Per-job knobs of the mining engine.
#[derive(Debug, Clone, PartialEq)]
pub struct MinerConfig {
    /// Upper bound on the number of items in a returned pattern.
    pub max_length: Option<usize>,
    /// Minimum number of supporting transactions for a returned pattern.
    /// Filters output only; candidate generation is unaffected.
    pub min_support: Option<u64>,
    /// Enables the bound/emitted cache fast paths. The TWU filter and the
    /// projection branch bound are part of the algorithm and always on.
    pub use_pruning: bool,
    /// Capacity of the utility-bound cache.
    pub cache_size_bounds: usize,
    /// Capacity of the emitted-pattern cache.
    pub cache_size_patterns: usize,
    /// Capacity of the projection cache.
    pub cache_size_projections: usize,
}

impl Default for MinerConfig {
    fn default() -> Self {
        Self {
            max_length: None,
            min_support: None,
            use_pruning: true,
            cache_size_bounds: 4096,
            cache_size_patterns: 4096,
            cache_size_projections: 256,
        }
    }
}

/// Counters collected over one mining run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MiningStats {
    pub patterns_found: usize,
    pub candidates_generated: u64,
    pub items_pruned_by_twu: u64,
    pub branches_pruned_by_bound: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub elapsed: Duration,
}

/// The mining engine.
///
/// A miner is exclusively owned by one mining job; the tree and the
/// caches of a run are never shared.
#[derive(Debug)]
pub struct UpGrowthMiner {
    config: MinerConfig,
    stats: MiningStats,
}

impl UpGrowthMiner {
    pub fn new(config: MinerConfig) -> Self {
        Self {
            config,
            stats: MiningStats::default(),
        }
    }

    /// Statistics of the most recent [`mine`](Self::mine) call.
    pub fn stats(&self) -> &MiningStats {
        &self.stats
    }

    /// Mines all itemsets whose dataset-wide utility meets `min_utility`.
    ///
    /// The result is complete and sound with respect to the snapshot; no
    /// particular ordering is guaranteed. For a fixed input ordering the
    /// output is deterministic.
    pub fn mine(
        &mut self,
        transactions: &[Transaction],
        min_utility: Utility,
    ) -> Result<Vec<Pattern>, MiningError> {
        if !min_utility.is_finite() || min_utility < 0.0 {
            return Err(MiningError::InvalidMinUtility(min_utility));
        }
        if self.config.min_support == Some(0) {
            return Err(MiningError::InvalidMinSupport);
        }

        let started = Instant::now();
        self.stats = MiningStats::default();

        if transactions.is_empty() {
            self.stats.elapsed = started.elapsed();
            return Ok(Vec::new());
        }

        let mut run = Run::new(&self.config, transactions, min_utility);
        run.build_tree();
        run.mine_all();

        self.stats = run.finish(started.elapsed());
        Ok(run.output)
    }
}

/// The state of one mining run over a fixed snapshot.
struct Run<'a> {
    config: &'a MinerConfig,
    min_utility: Utility,
    /// Promising items in global order: TWU descending, id ascending.
    order: Vec<ItemId>,
    rank: HashMap<ItemId, u32>,
    /// Per-transaction item -> internal utility maps.
    tx_maps: Vec<HashMap<ItemId, Utility>>,
    /// Inverted index: item -> indices of containing transactions.
    postings: HashMap<ItemId, Vec<u32>>,
    tree: UpTree,
    caches: MiningCaches,
    output: Vec<Pattern>,
    stats: MiningStats,
}

impl<'a> Run<'a> {
    fn new(config: &'a MinerConfig, transactions: &[Transaction], min_utility: Utility) -> Self {
        // Pass 1: transaction utilities, global TWU, transaction index.
        let mut twu: HashMap<ItemId, Utility> = HashMap::new();
        let mut postings: HashMap<ItemId, Vec<u32>> = HashMap::new();
        let mut tx_maps = Vec::with_capacity(transactions.len());
        for (tx_idx, transaction) in transactions.iter().enumerate() {
            let tu = transaction.total_utility();
            let mut map = HashMap::with_capacity(transaction.len());
            for (idx, &item) in transaction.items().iter().enumerate() {
                *twu.entry(item).or_insert(0.0) += tu;
                map.insert(item, transaction.utility_at(idx));
                postings.entry(item).or_insert_with(Vec::new).push(tx_idx as u32);
            }
            tx_maps.push(map);
        }

        let total_items = twu.len();
        let mut order: Vec<ItemId> = twu
            .iter()
            .filter(|(_, &value)| value >= min_utility)
            .map(|(&item, _)| item)
            .collect();
        order.sort_by(|a, b| {
            twu[b]
                .partial_cmp(&twu[a])
                .expect("TWU values are finite")
                .then_with(|| a.cmp(b))
        });
        let rank: HashMap<ItemId, u32> = order
            .iter()
            .enumerate()
            .map(|(idx, &item)| (item, idx as u32))
            .collect();

        let mut stats = MiningStats::default();
        stats.items_pruned_by_twu = (total_items - order.len()) as u64;

        Self {
            config,
            min_utility,
            order,
            rank,
            tx_maps,
            postings,
            tree: UpTree::new(),
            caches: MiningCaches::new(
                config.cache_size_bounds,
                config.cache_size_patterns,
                config.cache_size_projections,
            ),
            output: Vec::new(),
            stats,
        }
    }

    /// Pass 2: insert every reorganized transaction into the tree.
    fn build_tree(&mut self) {
        for map in &self.tx_maps {
            let mut path: Vec<(ItemId, Utility)> = map
                .iter()
                .filter(|(item, _)| self.rank.contains_key(*item))
                .map(|(&item, &utility)| (item, utility))
                .collect();
            if path.is_empty() {
                continue;
            }
            path.sort_by_key(|&(item, _)| self.rank[&item]);
            self.tree.insert_transaction(&path);
        }
    }

    /// Pass 3: mine suffix items in reverse global order, releasing each
    /// item's tree region once its branch is exhausted.
    fn mine_all(&mut self) {
        let order = self.order.clone();
        for &alpha in order.iter().rev() {
            let chain = self.tree.header(alpha).to_vec();
            if !chain.is_empty() {
                let projection = PathProjection::from_header(&self.tree, &chain);
                let mut suffix = vec![alpha];
                self.descend(&mut suffix, &projection);
            }
            self.tree.retire_item(alpha);
        }
    }

    /// Mines the branch of `suffix`, whose conditional pattern base is
    /// `projection`.
    fn descend(&mut self, suffix: &mut Vec<ItemId>, projection: &PathProjection) {
        if projection.is_empty() {
            return;
        }
        // The projection total bounds the utility of the suffix extended
        // with anything reachable from this base, the suffix itself
        // included.
        if projection.total_utility < self.min_utility {
            self.stats.branches_pruned_by_bound += 1;
            return;
        }

        self.consider(suffix, projection.total_utility);

        if let Some(max) = self.config.max_length {
            if suffix.len() >= max {
                return;
            }
        }

        // Local TWU over the projection (local DGU).
        let mut local: HashMap<ItemId, Utility> = HashMap::new();
        for entry in &projection.entries {
            for (item, _) in self.tree.prefix_path(entry.node) {
                *local.entry(item).or_insert(0.0) += entry.path_utility;
            }
        }
        let mut survivors: Vec<ItemId> = local
            .iter()
            .filter(|(_, &twu)| twu >= self.min_utility)
            .map(|(&item, _)| item)
            .collect();
        // Reverse global order, like the top level.
        survivors.sort_by(|a, b| self.rank[b].cmp(&self.rank[a]));

        for beta in survivors {
            suffix.push(beta);
            let narrowed = self.narrowed_projection(suffix, projection, beta);
            self.descend(suffix, &narrowed);
            suffix.pop();
        }
    }

    /// Looks up or computes the projection narrowed to `beta`.
    fn narrowed_projection(
        &mut self,
        suffix: &[ItemId],
        parent: &PathProjection,
        beta: ItemId,
    ) -> PathProjection {
        let mut key = suffix.to_vec();
        key.sort_unstable();
        if let Some(cached) = self.caches.projection(&key) {
            if cached.is_valid(&self.tree) {
                self.stats.cache_hits += 1;
                return cached;
            }
        }
        let narrowed = parent.narrow(&self.tree, beta);
        self.caches.put_projection(key, narrowed.clone());
        narrowed
    }

    /// Emits `suffix` if its exact utility meets the threshold.
    fn consider(&mut self, suffix: &[ItemId], upper_bound: Utility) {
        self.stats.candidates_generated += 1;
        let mut key = suffix.to_vec();
        key.sort_unstable();

        if self.config.use_pruning {
            if self.caches.was_emitted(&key) {
                self.stats.cache_hits += 1;
                return;
            }
            match self.caches.bound(&key) {
                Some(bound) if bound < self.min_utility => {
                    self.stats.cache_hits += 1;
                    return;
                }
                Some(_) => self.stats.cache_hits += 1,
                None => {
                    self.stats.cache_misses += 1;
                    self.caches.put_bound(key.clone(), upper_bound);
                }
            }
        }

        let (utility, support) = self.exact_utility(&key);
        if utility < self.min_utility {
            return;
        }
        if let Some(min_support) = self.config.min_support {
            if support < min_support {
                return;
            }
        }
        if self.config.use_pruning {
            self.caches.mark_emitted(key.clone());
        }
        self.output.push(Pattern {
            items: key,
            utility,
            support,
        });
    }

    /// The exact dataset utility and support of `itemset`, summed over
    /// the contributing transactions reached through the index.
    fn exact_utility(&self, itemset: &[ItemId]) -> (Utility, u64) {
        let rarest = itemset
            .iter()
            .min_by_key(|item| self.postings.get(*item).map(Vec::len).unwrap_or(0));
        let rarest = match rarest {
            Some(item) => item,
            None => return (0.0, 0),
        };
        let candidates = match self.postings.get(rarest) {
            Some(candidates) => candidates,
            None => return (0.0, 0),
        };
        let mut utility = 0.0;
        let mut support = 0;
        for &tx_idx in candidates {
            let map = &self.tx_maps[tx_idx as usize];
            if itemset.iter().all(|item| map.contains_key(item)) {
                support += 1;
                utility += itemset.iter().map(|item| map[item]).sum::<Utility>();
            }
        }
        (utility, support)
    }

    fn finish(&mut self, elapsed: Duration) -> MiningStats {
        self.stats.patterns_found = self.output.len();
        self.stats.elapsed = elapsed;
        self.stats.clone()
    }
}
