//! rgrid-fabric: collective bootstrap fabric.
//!
//! N worker processes bootstrap a TCP tree overlay rooted at a launcher and
//! exchange data via MPI-like collectives. Three bootstrap paths exist: via
//! the launcher (flat N-to-1 hello, then tree wireup), via an external
//! key-value store, and via shared memory plus a leader tree on dense nodes.
//! Every process is single-threaded; all waits are bounded `poll`s.
//!
//! Local code never exits on failure: errors propagate as [`FabricError`]
//! and abort propagation across the tree is an explicit opcode broadcast.

pub mod auth;
pub mod client;
pub mod config;
mod error;
pub mod fdio;
pub mod kvs;
pub mod launcher;
pub mod net;
pub mod shm;
pub mod tree;

pub use client::Fabric;
pub use config::FabricConfig;
pub use error::{FabricError, Result};
pub use kvs::{KeyValueStore, MemKvs};
pub use tree::{ReduceOp, Tree, TreeShape};
