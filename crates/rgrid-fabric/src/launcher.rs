//! Launcher protocol, client side.
//!
//! Before the tree exists (or when trees are disabled), every rank holds a
//! TCP connection to the launcher, which implements a flat star: each
//! collective is one opcode packet from every rank, answered in rank order.
//! All integers are little-endian u32; sizes are bytes per rank.

use std::net::{TcpStream, ToSocketAddrs};

use log::debug;

use crate::config::FabricConfig;
use crate::error::{FabricError, Result};
use crate::fdio;
use crate::net;

/// Protocol version announced on OPEN.
pub const PROTOCOL_VERSION: u32 = 8;

pub const OP_OPEN: u32 = 0;
pub const OP_CLOSE: u32 = 1;
pub const OP_ABORT: u32 = 2;
pub const OP_BARRIER: u32 = 3;
pub const OP_BCAST: u32 = 4;
pub const OP_GATHER: u32 = 5;
pub const OP_SCATTER: u32 = 6;
pub const OP_ALLGATHER: u32 = 7;
pub const OP_ALLTOALL: u32 = 8;

/// One rank's connection to the launcher.
pub struct LauncherConn {
    stream: TcpStream,
    rank: usize,
    ranks: usize,
}

impl LauncherConn {
    /// Connect to the launcher and announce protocol version and rank.
    pub fn open(cfg: &FabricConfig) -> Result<LauncherConn> {
        let id = cfg
            .identity
            .ok_or_else(|| FabricError::Config("launcher open requires identity".into()))?;
        let host = cfg
            .launcher_host
            .as_deref()
            .ok_or_else(|| FabricError::Config("launcher open requires MPIRUN_HOST".into()))?;
        let addr = (host, cfg.launcher_port)
            .to_socket_addrs()
            .map_err(|_| FabricError::ConnectFailed(format!("{host}:{}", cfg.launcher_port)))?
            .next()
            .ok_or_else(|| FabricError::ConnectFailed(format!("{host}:{}", cfg.launcher_port)))?;
        // stagger connects by rank so the launcher's listen queue survives
        // a wide job arriving at once
        std::thread::sleep(std::time::Duration::from_micros(5 * id.rank as u64));
        let mut stream = net::connect(cfg, addr)?;
        fdio::write_u32(&mut stream, PROTOCOL_VERSION)?;
        fdio::write_u32(&mut stream, id.rank as u32)?;
        debug!("rank {} connected to launcher at {addr}", id.rank);
        Ok(LauncherConn {
            stream,
            rank: id.rank,
            ranks: id.nprocs,
        })
    }

    pub fn rank(&self) -> usize {
        self.rank
    }

    pub fn ranks(&self) -> usize {
        self.ranks
    }

    /// Send CLOSE and drop the connection.
    pub fn close(mut self) -> Result<()> {
        fdio::write_u32(&mut self.stream, OP_CLOSE)?;
        Ok(())
    }

    /// Report a failure to the launcher.
    pub fn abort(&mut self, code: i32) -> Result<()> {
        fdio::write_u32(&mut self.stream, OP_ABORT)?;
        fdio::write_u32(&mut self.stream, code as u32)?;
        Ok(())
    }

    /// Flat barrier: write the opcode, wait for the echo.
    pub fn barrier(&mut self) -> Result<()> {
        fdio::write_u32(&mut self.stream, OP_BARRIER)?;
        let _ = fdio::read_u32(&mut self.stream)?;
        Ok(())
    }

    /// Broadcast `buf` from `root` to every rank.
    pub fn bcast(&mut self, buf: &mut [u8], root: usize) -> Result<()> {
        fdio::write_u32(&mut self.stream, OP_BCAST)?;
        fdio::write_u32(&mut self.stream, root as u32)?;
        fdio::write_u32(&mut self.stream, buf.len() as u32)?;
        if self.rank == root {
            fdio::write_fd(&mut self.stream, buf)?;
        }
        fdio::read_fd(&mut self.stream, buf)
    }

    /// Gather `sendbuf` from every rank; `root` receives `ranks *
    /// sendbuf.len()` bytes into `recvbuf`.
    pub fn gather(&mut self, sendbuf: &[u8], recvbuf: &mut [u8], root: usize) -> Result<()> {
        fdio::write_u32(&mut self.stream, OP_GATHER)?;
        fdio::write_u32(&mut self.stream, root as u32)?;
        fdio::write_u32(&mut self.stream, sendbuf.len() as u32)?;
        fdio::write_fd(&mut self.stream, sendbuf)?;
        if self.rank == root {
            fdio::read_fd(&mut self.stream, &mut recvbuf[..sendbuf.len() * self.ranks])?;
        }
        Ok(())
    }

    /// Scatter `size`-byte chunks from `root`'s `sendbuf` to every rank.
    pub fn scatter(
        &mut self,
        sendbuf: &[u8],
        size: usize,
        recvbuf: &mut [u8],
        root: usize,
    ) -> Result<()> {
        fdio::write_u32(&mut self.stream, OP_SCATTER)?;
        fdio::write_u32(&mut self.stream, root as u32)?;
        fdio::write_u32(&mut self.stream, size as u32)?;
        if self.rank == root {
            fdio::write_fd(&mut self.stream, &sendbuf[..size * self.ranks])?;
        }
        fdio::read_fd(&mut self.stream, &mut recvbuf[..size])
    }

    /// All ranks contribute `sendbuf`; all receive the concatenation.
    pub fn allgather(&mut self, sendbuf: &[u8], recvbuf: &mut [u8]) -> Result<()> {
        fdio::write_u32(&mut self.stream, OP_ALLGATHER)?;
        fdio::write_u32(&mut self.stream, sendbuf.len() as u32)?;
        fdio::write_fd(&mut self.stream, sendbuf)?;
        fdio::read_fd(&mut self.stream, &mut recvbuf[..sendbuf.len() * self.ranks])
    }

    /// Each rank sends `size` bytes to every rank and receives the
    /// transposed chunks.
    pub fn alltoall(&mut self, sendbuf: &[u8], size: usize, recvbuf: &mut [u8]) -> Result<()> {
        fdio::write_u32(&mut self.stream, OP_ALLTOALL)?;
        fdio::write_u32(&mut self.stream, size as u32)?;
        fdio::write_fd(&mut self.stream, &sendbuf[..size * self.ranks])?;
        fdio::read_fd(&mut self.stream, &mut recvbuf[..size * self.ranks])
    }
}
