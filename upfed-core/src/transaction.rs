//! The transaction data model.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{ItemId, Utility};

/// An error raised when a transaction fails validation.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum TransactionError {
    #[error(
        "item, quantity and unit-utility arrays differ in length: {items} != {quantities} != {unit_utilities}"
    )]
    LengthMismatch {
        items: usize,
        quantities: usize,
        unit_utilities: usize,
    },
    #[error("a transaction must contain at least one item")]
    Empty,
    #[error("item {item} appears more than once")]
    DuplicateItem { item: ItemId },
    #[error("item {item} has a negative quantity")]
    NegativeQuantity { item: ItemId },
    #[error("item {item} has a negative unit utility")]
    NegativeUtility { item: ItemId },
    #[error("item {item} has a non-finite quantity or unit utility")]
    NonFinite { item: ItemId },
}

/// A single retail transaction: an ordered sequence of items with their
/// purchased quantities and per-item unit utilities.
///
/// The internal utility of item `i` is `quantity(i) * unit_utility(i)`;
/// the transaction utility `TU(T)` is the sum over all items. Transactions
/// are immutable once constructed, and deserialization runs the same
/// validation as [`Transaction::new`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawTransaction")]
pub struct Transaction {
    items: Vec<ItemId>,
    quantities: Vec<f64>,
    unit_utilities: Vec<f64>,
}

#[derive(Deserialize)]
struct RawTransaction {
    items: Vec<ItemId>,
    quantities: Vec<f64>,
    unit_utilities: Vec<f64>,
}

impl std::convert::TryFrom<RawTransaction> for Transaction {
    type Error = TransactionError;

    fn try_from(raw: RawTransaction) -> Result<Self, Self::Error> {
        Transaction::new(raw.items, raw.quantities, raw.unit_utilities)
    }
}

impl Transaction {
    /// Creates a validated transaction.
    ///
    /// # Errors
    /// Fails if the arrays differ in length, the transaction is empty, an
    /// item is repeated, or any quantity or unit utility is negative or
    /// non-finite.
    pub fn new(
        items: Vec<ItemId>,
        quantities: Vec<f64>,
        unit_utilities: Vec<f64>,
    ) -> Result<Self, TransactionError> {
        if items.len() != quantities.len() || items.len() != unit_utilities.len() {
            return Err(TransactionError::LengthMismatch {
                items: items.len(),
                quantities: quantities.len(),
                unit_utilities: unit_utilities.len(),
            });
        }
        if items.is_empty() {
            return Err(TransactionError::Empty);
        }
        for (idx, &item) in items.iter().enumerate() {
            if items[..idx].contains(&item) {
                return Err(TransactionError::DuplicateItem { item });
            }
            let quantity = quantities[idx];
            let unit_utility = unit_utilities[idx];
            if !quantity.is_finite() || !unit_utility.is_finite() {
                return Err(TransactionError::NonFinite { item });
            }
            if quantity < 0.0 {
                return Err(TransactionError::NegativeQuantity { item });
            }
            if unit_utility < 0.0 {
                return Err(TransactionError::NegativeUtility { item });
            }
        }
        Ok(Self {
            items,
            quantities,
            unit_utilities,
        })
    }

    /// The items of this transaction, in their original order.
    pub fn items(&self) -> &[ItemId] {
        &self.items
    }

    /// The number of items in this transaction.
    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// The internal utility of the item at `idx`: `q(i, T) * p(i)`.
    pub fn utility_at(&self, idx: usize) -> Utility {
        self.quantities[idx] * self.unit_utilities[idx]
    }

    /// The internal utility of `item` in this transaction, if present.
    pub fn utility_of(&self, item: ItemId) -> Option<Utility> {
        self.items
            .iter()
            .position(|&i| i == item)
            .map(|idx| self.utility_at(idx))
    }

    /// The transaction utility `TU(T)`, i.e. the sum of all internal
    /// utilities.
    pub fn total_utility(&self) -> Utility {
        (0..self.items.len()).map(|idx| self.utility_at(idx)).sum()
    }

    /// Whether this transaction contains every item of `itemset`.
    pub fn contains_all(&self, itemset: &[ItemId]) -> bool {
        itemset.iter().all(|item| self.items.contains(item))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_transaction() {
        let t = Transaction::new(vec![1, 2, 3], vec![2.0, 1.0, 3.0], vec![3.0, 10.0, 1.0]).unwrap();
        assert_eq!(t.len(), 3);
        assert_eq!(t.utility_at(0), 6.0);
        assert_eq!(t.utility_of(2), Some(10.0));
        assert_eq!(t.utility_of(9), None);
        assert_eq!(t.total_utility(), 19.0);
        assert!(t.contains_all(&[2, 3]));
        assert!(!t.contains_all(&[2, 9]));
    }

    #[test]
    fn test_length_mismatch() {
        let err = Transaction::new(vec![1, 2], vec![1.0], vec![1.0, 1.0]).unwrap_err();
        assert!(matches!(err, TransactionError::LengthMismatch { .. }));
    }

    #[test]
    fn test_empty_rejected() {
        let err = Transaction::new(vec![], vec![], vec![]).unwrap_err();
        assert_eq!(err, TransactionError::Empty);
    }

    #[test]
    fn test_duplicate_item_rejected() {
        let err =
            Transaction::new(vec![1, 1], vec![1.0, 2.0], vec![1.0, 1.0]).unwrap_err();
        assert_eq!(err, TransactionError::DuplicateItem { item: 1 });
    }

    #[test]
    fn test_negative_and_non_finite_rejected() {
        let err = Transaction::new(vec![1], vec![-1.0], vec![1.0]).unwrap_err();
        assert_eq!(err, TransactionError::NegativeQuantity { item: 1 });
        let err = Transaction::new(vec![1], vec![1.0], vec![-2.0]).unwrap_err();
        assert_eq!(err, TransactionError::NegativeUtility { item: 1 });
        let err = Transaction::new(vec![1], vec![f64::NAN], vec![1.0]).unwrap_err();
        assert_eq!(err, TransactionError::NonFinite { item: 1 });
    }
}
