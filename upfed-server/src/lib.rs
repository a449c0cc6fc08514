//! # Upfed server: federated high-utility itemset mining
//!
//! A regional coordinator for mining high-utility itemsets across a fleet
//! of retail stores. Each store mines locally on its private transactions
//! (see `upfed-core`); this crate hosts everything around that engine:
//!
//! - the [session registry](crate::sessions) tracking store registration
//!   and heartbeat-based liveness,
//! - the [mining worker pool](crate::workers) executing store-local
//!   mining jobs,
//! - the [round coordinator](crate::state_machine) that sequences
//!   synchronous federated rounds, aggregates store-local patterns into
//!   global patterns and optionally perturbs them with Laplace noise
//!   under a privacy budget,
//! - the [storage](crate::storage) contract those components persist
//!   through, and
//! - the [REST API](crate::rest) stores and operators talk to.

#[macro_use]
extern crate validator_derive;

pub mod privacy;
pub mod rest;
pub mod sessions;
pub mod settings;
pub mod state_machine;
pub mod storage;
pub mod workers;
