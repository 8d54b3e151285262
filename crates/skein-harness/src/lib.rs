//! Deterministic simulation harness for skein.
//!
//! - [`SimEnv`]: virtual clock and seeded RNG implementing
//!   [`skein_core::Environment`]
//! - [`SimCluster`]: several workers, several clients and one log stepped
//!   through a single FIFO work queue, with storage fault injection
//! - [`invariants`]: checks over a finished run (gap-free log, duplicate-free
//!   delivery, acknowledged-means-stored, local join notices)
//!
//! Network-level behavior of the coordinator link is tested separately under
//! turmoil (see this crate's `tests/`).

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod cluster;
pub mod invariants;
pub mod sim_env;

pub use cluster::{ClusterConfig, Observed, SimClient, SimCluster, WorkKind};
pub use invariants::{Violation, check_safety, connected_clients_caught_up};
pub use sim_env::SimEnv;
