//! Mined pattern types.

use serde::{Deserialize, Serialize};

use crate::{ItemId, Utility};

/// A high-utility itemset returned by the mining engine.
///
/// The item list is kept sorted ascending so that a pattern has a single
/// canonical representation; two patterns over the same items compare
/// equal on `items` regardless of the order they were discovered in.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Pattern {
    /// The items of the itemset, sorted ascending.
    pub items: Vec<ItemId>,
    /// The exact dataset-wide utility `u(X)`.
    pub utility: Utility,
    /// The number of transactions containing the itemset.
    pub support: u64,
}

impl Pattern {
    /// Creates a pattern, canonicalizing the item order.
    pub fn new(mut items: Vec<ItemId>, utility: Utility, support: u64) -> Self {
        items.sort_unstable();
        Self {
            items,
            utility,
            support,
        }
    }

    /// The canonical grouping key of this pattern.
    pub fn key(&self) -> &[ItemId] {
        &self.items
    }
}
