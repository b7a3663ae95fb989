//! Task placement for the fleet scheduler.
//!
//! Given the declared tasks, the set of live hosts, and the previously
//! published topology, this crate decides which hosts run which tasks:
//!
//! - **`matching`** — label predicates and host staleness filtering
//! - **`scheduler`** — the two-pass replica-preserving placement
//! - **`diff`** — minimal write/delete set between two topologies
//!
//! # Invariants
//!
//! - Decisions are deterministic given the same inputs
//! - A task keeps running where it already runs whenever the host still
//!   matches, regardless of other hosts' load
//! - Host load accounting only grows within a single pass
//!
//! Everything here is pure: no I/O, no clocks, no errors. The agent
//! resolves store failures to empty snapshots before calling in.

pub mod diff;
pub mod matching;
pub mod scheduler;

pub use diff::{diff_topology, TopologyDelta};
pub use matching::{fresh_hosts, match_hosts, matches_labels, HostInfo};
pub use scheduler::{schedule, TaskDemand, Topology};
