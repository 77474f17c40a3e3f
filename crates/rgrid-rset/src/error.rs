//! Error type shared by the rset containers.

use thiserror::Error;

/// Errors raised by rnode/rlist operations.
///
/// The distinction between [`RsetError::NoSpace`] (a valid request that does
/// not fit right now) and [`RsetError::Unsatisfiable`] (a request that can
/// never fit) is load-bearing: the scheduler keeps the former queued and
/// denies the latter.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RsetError {
    /// Malformed input: bad JSON, bad idset/hostlist, contradictory request.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Ids being added already exist in the target child pool.
    #[error("ids overlap existing ids in child '{0}'")]
    Overlap(String),

    /// An id is not a member of the child pool at all.
    #[error("id {id} not found in child '{child}'")]
    UnknownId { child: String, id: u32 },

    /// Allocation of an id that is not available.
    #[error("id {0} is already allocated")]
    AlreadyAllocated(u32),

    /// Free of an id that is already free.
    #[error("id {0} is already free")]
    AlreadyFree(u32),

    /// Allocation attempt against a down node.
    #[error("rank {0} is down")]
    HostDown(u32),

    /// Valid request, but no fit in the current availability.
    #[error("insufficient resources")]
    NoSpace,

    /// Request exceeds what the resource set could ever provide.
    #[error("unsatisfiable request{}", fmt_detail(.0))]
    Unsatisfiable(String),

    /// A rank was not found in the resource list.
    #[error("rank {0} not found")]
    UnknownRank(u32),

    /// A hostname was not found in the resource list.
    #[error("host {0} not found in resources")]
    HostNotFound(String),

    /// rerank: more hosts than ranks.
    #[error("number of hosts ({hosts}) is greater than node count ({nodes})")]
    TooManyHosts { hosts: usize, nodes: usize },

    /// rerank: fewer hosts than ranks.
    #[error("number of hosts ({hosts}) is less than node count ({nodes})")]
    TooFewHosts { hosts: usize, nodes: usize },

    /// verify: expected resources missing from actual.
    #[error("{0}")]
    VerifyFailed(String),
}

fn fmt_detail(detail: &str) -> String {
    if detail.is_empty() {
        String::new()
    } else {
        format!(": {detail}")
    }
}

impl RsetError {
    /// True when the error is the transient "no fit right now" case.
    pub fn is_no_space(&self) -> bool {
        matches!(self, RsetError::NoSpace)
    }

    /// True when the error is the permanent "can never fit" case.
    pub fn is_unsatisfiable(&self) -> bool {
        matches!(self, RsetError::Unsatisfiable(_))
    }
}
