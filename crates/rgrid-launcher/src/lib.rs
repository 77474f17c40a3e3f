//! Launcher-side protocol engine.
//!
//! The launcher mediates the flat star before the worker tree exists and
//! serves as the abort channel of last resort.

pub mod engine;

pub use engine::{accept_workers, process_ops};
