//! Bounded descriptor I/O.
//!
//! Reads are wrapped in a per-iteration `poll` so a wedged peer cannot hold
//! the process forever; writes retry short writes and restart on
//! EINTR/EAGAIN. The full poll failure taxonomy is surfaced to callers (see
//! [`FabricError`]).

use std::io::{self, ErrorKind, Read, Write};
use std::os::fd::AsRawFd;

use byteorder::{ByteOrder, LittleEndian};

use crate::error::{FabricError, Result};

/// Write all of `buf`, retrying short writes and EINTR/EAGAIN.
pub fn write_fd<W: Write>(w: &mut W, buf: &[u8]) -> Result<()> {
    let mut n = 0;
    while n < buf.len() {
        match w.write(&buf[n..]) {
            Ok(0) => return Err(FabricError::WriteReturnedZero),
            Ok(k) => n += k,
            Err(e) if matches!(e.kind(), ErrorKind::Interrupted | ErrorKind::WouldBlock) => {}
            Err(e) => return Err(FabricError::Io(e)),
        }
    }
    Ok(())
}

/// Read exactly `buf.len()` bytes, polling with `msecs` timeout before each
/// read. `msecs < 0` waits indefinitely.
pub fn read_fd_timeout<R: Read + AsRawFd>(r: &mut R, buf: &mut [u8], msecs: i32) -> Result<()> {
    let mut n = 0;
    while n < buf.len() {
        let mut fds = libc::pollfd {
            fd: r.as_raw_fd(),
            events: libc::POLLIN,
            revents: 0,
        };
        let rc = unsafe { libc::poll(&mut fds, 1, msecs) };
        if rc < 0 {
            let e = io::Error::last_os_error();
            if e.kind() == ErrorKind::Interrupted {
                continue;
            }
            return Err(FabricError::Poll(e));
        }
        if rc == 0 {
            return Err(FabricError::PollTimeout);
        }
        if fds.revents & libc::POLLHUP != 0 {
            return Err(FabricError::PollHangup);
        }
        if fds.revents & libc::POLLERR != 0 {
            return Err(FabricError::PollEvent);
        }
        if fds.revents & libc::POLLNVAL != 0 {
            return Err(FabricError::PollInvalidReq);
        }
        if fds.revents & libc::POLLIN == 0 {
            return Err(FabricError::PollNoRead);
        }
        match r.read(&mut buf[n..]) {
            Ok(0) => return Err(FabricError::PollBadRead),
            Ok(k) => n += k,
            Err(e) if matches!(e.kind(), ErrorKind::Interrupted | ErrorKind::WouldBlock) => {}
            Err(e) => return Err(FabricError::Io(e)),
        }
    }
    Ok(())
}

/// Read exactly `buf.len()` bytes with no time bound.
pub fn read_fd<R: Read + AsRawFd>(r: &mut R, buf: &mut [u8]) -> Result<()> {
    read_fd_timeout(r, buf, -1)
}

/// Write one little-endian u32.
pub fn write_u32<W: Write>(w: &mut W, v: u32) -> Result<()> {
    let mut buf = [0u8; 4];
    LittleEndian::write_u32(&mut buf, v);
    write_fd(w, &buf)
}

/// Read one little-endian u32 with a per-read timeout.
pub fn read_u32_timeout<R: Read + AsRawFd>(r: &mut R, msecs: i32) -> Result<u32> {
    let mut buf = [0u8; 4];
    read_fd_timeout(r, &mut buf, msecs)?;
    Ok(LittleEndian::read_u32(&buf))
}

/// Read one little-endian u32 with no time bound.
pub fn read_u32<R: Read + AsRawFd>(r: &mut R) -> Result<u32> {
    read_u32_timeout(r, -1)
}

/// Write one little-endian i64.
pub fn write_i64<W: Write>(w: &mut W, v: i64) -> Result<()> {
    let mut buf = [0u8; 8];
    LittleEndian::write_i64(&mut buf, v);
    write_fd(w, &buf)
}

/// Read one little-endian i64 with no time bound.
pub fn read_i64<R: Read + AsRawFd>(r: &mut R) -> Result<i64> {
    let mut buf = [0u8; 8];
    read_fd(r, &mut buf)?;
    Ok(LittleEndian::read_i64(&buf))
}
