//! # Upfed core: high-utility itemset mining
//!
//! This crate implements the mining half of the upfed platform: given a
//! transaction database with per-item quantities and unit utilities and a
//! minimum-utility threshold, it returns every itemset whose dataset-wide
//! utility meets the threshold.
//!
//! The algorithm is UP-Growth with pseudo-projection. A single master
//! [`UpTree`] is built in two passes (a global TWU pass that discards
//! unpromising items, then an insertion pass that stores residual path
//! utilities at every node). Mining then walks the header chains in
//! reverse TWU order and represents every conditional pattern base as a
//! [`PathProjection`]: weak handles into the master tree plus parallel
//! utility arrays. No conditional trees are ever constructed.
//!
//! The crate is purely computational: no I/O, no async. The federated
//! service built on top of it lives in `upfed-server`.
//!
//! [`UpTree`]: crate::mining::UpTree
//! [`PathProjection`]: crate::mining::PathProjection

pub mod mining;
pub mod pattern;
pub mod transaction;

pub use self::{
    mining::{MinerConfig, MiningError, MiningStats, UpGrowthMiner},
    pattern::Pattern,
    transaction::{Transaction, TransactionError},
};

/// The identifier of an item in a transaction database.
pub type ItemId = u32;

/// A utility amount (internal utility, TWU, thresholds).
pub type Utility = f64;
