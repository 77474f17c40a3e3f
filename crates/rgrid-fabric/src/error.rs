//! Fabric error taxonomy.
//!
//! The poll-related variants mirror the wire I/O failure modes one-for-one
//! so that a failure report names exactly what the descriptor did.

use std::io;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, FabricError>;

#[derive(Debug, Error)]
pub enum FabricError {
    /// poll(2) itself failed.
    #[error("poll error: {0}")]
    Poll(io::Error),

    /// poll timed out before the descriptor became readable.
    #[error("poll timeout")]
    PollTimeout,

    /// POLLHUP: peer hung up.
    #[error("poll hangup")]
    PollHangup,

    /// POLLERR: error event on the descriptor.
    #[error("poll error event")]
    PollEvent,

    /// POLLNVAL: descriptor was not open.
    #[error("poll invalid request")]
    PollInvalidReq,

    /// poll returned without error but POLLIN was not set.
    #[error("poll ready but not readable")]
    PollNoRead,

    /// read returned zero after poll indicated readable.
    #[error("read returned zero bytes")]
    PollBadRead,

    /// write returned zero.
    #[error("write returned zero bytes")]
    WriteReturnedZero,

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Handshake mismatch or handshake read timeout.
    #[error("authentication failed")]
    AuthFailed,

    /// All connect attempts to an endpoint were exhausted.
    #[error("failed to connect to {0}")]
    ConnectFailed(String),

    /// Total wireup time limit exceeded.
    #[error("exceeded time limit for wireup")]
    OpenTimeout,

    /// An abort opcode arrived from a peer. The local process is not the
    /// failure originator and should exit with success after teardown.
    #[error("peer aborted")]
    PeerAbort,

    /// Unknown opcode, bad length, or a short read mid-packet.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Bad or missing configuration (environment or arguments).
    #[error("configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Range(#[from] rgrid_core::ranges::RangeError),
}

impl FabricError {
    /// True for failures that name this process as a non-originator.
    pub fn is_peer_abort(&self) -> bool {
        matches!(self, FabricError::PeerAbort)
    }
}
