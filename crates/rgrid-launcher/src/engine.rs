//! Flat-star collective engine.
//!
//! The launcher reads one opcode packet from every rank in rank order, then
//! completes the operation by writing data back to the destinations. The
//! strict read order is how synchronization emerges without per-packet
//! barriers: no rank's packet for operation k+1 is consumed before every
//! rank delivered operation k.

use std::net::{TcpListener, TcpStream};

use log::{debug, error, info};
use rgrid_fabric::launcher::{
    OP_ABORT, OP_ALLGATHER, OP_ALLTOALL, OP_BARRIER, OP_BCAST, OP_CLOSE, OP_GATHER, OP_OPEN,
    OP_SCATTER, PROTOCOL_VERSION,
};
use rgrid_fabric::{FabricError, Result, fdio};

/// Accept `nprocs` worker connections; each announces its protocol version
/// and rank. Returns the streams indexed by rank.
pub fn accept_workers(listener: &TcpListener, nprocs: usize) -> Result<Vec<TcpStream>> {
    let mut conns: Vec<Option<TcpStream>> = (0..nprocs).map(|_| None).collect();
    let mut remaining = nprocs;
    while remaining > 0 {
        let (mut stream, peer) = listener.accept()?;
        let version = fdio::read_u32(&mut stream)?;
        if version != PROTOCOL_VERSION {
            return Err(FabricError::Protocol(format!(
                "worker at {peer} speaks protocol {version}, expected {PROTOCOL_VERSION}"
            )));
        }
        let rank = fdio::read_u32(&mut stream)? as usize;
        if rank >= nprocs {
            return Err(FabricError::Protocol(format!(
                "worker at {peer} announced rank {rank} of {nprocs}"
            )));
        }
        if conns[rank].is_some() {
            return Err(FabricError::Protocol(format!(
                "rank {rank} connected twice (second from {peer})"
            )));
        }
        debug!("rank {rank} connected from {peer}");
        conns[rank] = Some(stream);
        remaining -= 1;
    }
    Ok(conns.into_iter().map(|c| c.expect("all accepted")).collect())
}

/// Enforce that every rank sent the same value for an opcode field.
fn set_current(current: &mut Option<u32>, new: u32, what: &str) -> Result<u32> {
    match *current {
        None => {
            *current = Some(new);
            Ok(new)
        }
        Some(v) if v == new => Ok(new),
        Some(v) => Err(FabricError::Protocol(format!(
            "inconsistent {what}: received {new}, expecting {v}"
        ))),
    }
}

/// Run collectives until every rank sends CLOSE (or any rank ABORTs).
///
/// `conns` are open sockets indexed by rank. On clean shutdown all sockets
/// are dropped before returning.
pub fn process_ops(conns: &mut [TcpStream]) -> Result<()> {
    let n = conns.len();
    info!("processing collective opcodes for {n} ranks");
    loop {
        let mut opcode = None;
        let mut root = None;
        let mut size = None;
        let mut abort_code: Option<u32> = None;
        let mut buf: Vec<u8> = Vec::new();

        // one packet from every rank, in rank order
        for i in 0..n {
            let op = set_current(&mut opcode, fdio::read_u32(&mut conns[i])?, "opcode")?;
            match op {
                OP_OPEN => {
                    let _rank = fdio::read_u32(&mut conns[i])?;
                }
                OP_CLOSE | OP_BARRIER => {}
                OP_ABORT => {
                    let code = fdio::read_u32(&mut conns[i])?;
                    error!("received abort code {code} from rank {i}");
                    abort_code = Some(code);
                }
                OP_BCAST => {
                    let r = set_current(&mut root, fdio::read_u32(&mut conns[i])?, "root")?;
                    let s = set_current(&mut size, fdio::read_u32(&mut conns[i])?, "size")?;
                    buf.resize(s as usize, 0);
                    if i == r as usize {
                        fdio::read_fd(&mut conns[i], &mut buf)?;
                    }
                }
                OP_GATHER => {
                    let _r = set_current(&mut root, fdio::read_u32(&mut conns[i])?, "root")?;
                    let s =
                        set_current(&mut size, fdio::read_u32(&mut conns[i])?, "size")? as usize;
                    buf.resize(s * n, 0);
                    fdio::read_fd(&mut conns[i], &mut buf[s * i..s * (i + 1)])?;
                }
                OP_SCATTER => {
                    let r = set_current(&mut root, fdio::read_u32(&mut conns[i])?, "root")?;
                    let s =
                        set_current(&mut size, fdio::read_u32(&mut conns[i])?, "size")? as usize;
                    buf.resize(s * n, 0);
                    if i == r as usize {
                        fdio::read_fd(&mut conns[i], &mut buf)?;
                    }
                }
                OP_ALLGATHER => {
                    let s =
                        set_current(&mut size, fdio::read_u32(&mut conns[i])?, "size")? as usize;
                    buf.resize(s * n, 0);
                    fdio::read_fd(&mut conns[i], &mut buf[s * i..s * (i + 1)])?;
                }
                OP_ALLTOALL => {
                    let s =
                        set_current(&mut size, fdio::read_u32(&mut conns[i])?, "size")? as usize;
                    buf.resize(s * n * n, 0);
                    fdio::read_fd(&mut conns[i], &mut buf[s * n * i..s * n * (i + 1)])?;
                }
                other => {
                    return Err(FabricError::Protocol(format!(
                        "unrecognized opcode {other} from rank {i}"
                    )));
                }
            }
        }

        // complete the operation
        match opcode.expect("n > 0") {
            OP_OPEN => {}
            OP_CLOSE => {
                debug!("all ranks closed");
                return Ok(());
            }
            OP_ABORT => {
                return Err(FabricError::Protocol(format!(
                    "job aborted with code {}",
                    abort_code.unwrap_or(0)
                )));
            }
            OP_BARRIER => {
                for conn in conns.iter_mut() {
                    fdio::write_u32(conn, OP_BARRIER)?;
                }
            }
            OP_BCAST | OP_ALLGATHER => {
                for conn in conns.iter_mut() {
                    fdio::write_fd(conn, &buf)?;
                }
            }
            OP_GATHER => {
                let r = root.expect("gather has root") as usize;
                fdio::write_fd(&mut conns[r], &buf)?;
            }
            OP_SCATTER => {
                let s = size.expect("scatter has size") as usize;
                for (i, conn) in conns.iter_mut().enumerate() {
                    fdio::write_fd(conn, &buf[s * i..s * (i + 1)])?;
                }
            }
            OP_ALLTOALL => {
                // transpose: destination i receives source-ordered chunks
                let s = size.expect("alltoall has size") as usize;
                let mut out = vec![0u8; s * n];
                for i in 0..n {
                    for src in 0..n {
                        out[s * src..s * (src + 1)]
                            .copy_from_slice(&buf[s * (src * n + i)..s * (src * n + i) + s]);
                    }
                    fdio::write_fd(&mut conns[i], &out)?;
                }
            }
            _ => unreachable!("validated above"),
        }
    }
}
