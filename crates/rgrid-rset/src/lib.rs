//! rgrid-rset: resource-set algebra and simple-fit allocation
//!
//! Models heterogeneous inventories (nodes with core/gpu pools and string
//! properties) as composable sets with explicit ownership. An [`Rlist`] owns
//! its [`Rnode`]s; every operation is value-preserving and either succeeds or
//! unwinds to the pre-call state. Serialization follows the Rv1 "R" JSON
//! format; the opaque `scheduling` key survives byte-for-byte.

pub mod alloc;
mod error;
pub mod matcher;
pub mod rlist;
pub mod rnode;
pub mod rv1;

pub use alloc::{AllocInfo, AllocMode};
pub use error::RsetError;
pub use matcher::Constraint;
pub use rlist::{Rlist, VerifyConfig, VerifyMode, VerifyOutcome};
pub use rnode::{Ignore, Rnode, RnodeChild};
