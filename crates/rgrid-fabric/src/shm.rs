//! Shared-memory + leader-tree bootstrap driver.
//!
//! On dense nodes only one process per node does network wireup. The
//! locally-ranked-0 process creates an mmap'd segment sized for a barrier
//! scratchpad, a per-node endpoint table, a count cell, and the global
//! endpoint table. Every local rank checks in by appending its global rank
//! to a lock-held file; the first to check in becomes the node leader,
//! opens a listening socket, and joins a leader tree across nodes over a
//! configured port range. Leaders exchange aggregated `(rank, ip, port)`
//! triples, publish the global table in shared memory, and all local ranks
//! open the full tree by table lookup. A late-checkin loop admits
//! stragglers until the open timeout expires.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};

use byteorder::{ByteOrder, LittleEndian};
use log::debug;
use rgrid_core::ranges;

use crate::auth::AuthParams;
use crate::config::FabricConfig;
use crate::error::{FabricError, Result};
use crate::net::{self, ENDPOINT_LEN, Endpoint};
use crate::tree::Tree;

/// Bytes per (rank, endpoint) entry in the per-node table.
const ENTRY_LEN: usize = 4 + ENDPOINT_LEN;

/// Parse a tasks-per-node expression like `4(x3),2`.
///
/// Returns the maximum tasks on any node and whether every node carries
/// that exact count (`precise`).
pub fn parse_tasks_per_node(s: &str) -> Result<(usize, bool)> {
    let mut max = 0usize;
    let mut min = usize::MAX;
    for item in s.split(',') {
        let item = item.trim();
        let (count_s, _reps) = match item.split_once("(x") {
            Some((c, r)) => {
                let r = r
                    .strip_suffix(')')
                    .ok_or_else(|| FabricError::Config(format!("bad tasks-per-node '{s}'")))?;
                (c, r)
            }
            None => (item, "1"),
        };
        let count: usize = count_s
            .parse()
            .map_err(|_| FabricError::Config(format!("bad tasks-per-node '{s}'")))?;
        max = max.max(count);
        min = min.min(count);
    }
    if max == 0 {
        return Err(FabricError::Config(format!("bad tasks-per-node '{s}'")));
    }
    Ok((max, max == min))
}

/// A file-backed shared memory segment.
pub struct ShmSegment {
    ptr: *mut u8,
    len: usize,
}

// The segment is plain shared bytes; cross-thread handoff is safe, all
// synchronization goes through the atomics inside it.
unsafe impl Send for ShmSegment {}

impl ShmSegment {
    /// Create or open `path` at `len` bytes and map it shared.
    pub fn attach(path: &Path, len: usize) -> Result<ShmSegment> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        file.set_len(len as u64)?;
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                std::os::fd::AsRawFd::as_raw_fd(&file),
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(FabricError::Io(std::io::Error::last_os_error()));
        }
        Ok(ShmSegment {
            ptr: ptr as *mut u8,
            len,
        })
    }

    fn atomic(&self, offset: usize) -> &AtomicU32 {
        debug_assert!(offset + 4 <= self.len && offset % 4 == 0);
        unsafe { AtomicU32::from_ptr(self.ptr.add(offset) as *mut u32) }
    }

    fn write_bytes(&self, offset: usize, data: &[u8]) {
        debug_assert!(offset + data.len() <= self.len);
        unsafe {
            std::ptr::copy_nonoverlapping(data.as_ptr(), self.ptr.add(offset), data.len());
        }
    }

    fn read_bytes(&self, offset: usize, out: &mut [u8]) {
        debug_assert!(offset + out.len() <= self.len);
        unsafe {
            std::ptr::copy_nonoverlapping(self.ptr.add(offset), out.as_mut_ptr(), out.len());
        }
    }
}

impl Drop for ShmSegment {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.ptr as *mut libc::c_void, self.len);
        }
    }
}

/// Two-phase (signal, then release) barrier over the scratchpad.
///
/// Each local rank owns a `(signal, release)` u32 pair. Non-leaders raise
/// their signal flag and spin on the release flag; the leader collects
/// every signal, then raises every release. Spins yield the CPU and honor
/// the open-timeout deadline.
struct ShmBarrier<'a> {
    seg: &'a ShmSegment,
    offset: usize,
}

impl ShmBarrier<'_> {
    fn signal_off(&self, local: usize) -> usize {
        self.offset + local * 8
    }

    fn release_off(&self, local: usize) -> usize {
        self.offset + local * 8 + 4
    }

    fn spin_until_set(&self, off: usize, cfg: &FabricConfig) -> Result<()> {
        let a = self.seg.atomic(off);
        while a.swap(0, Ordering::AcqRel) == 0 {
            if cfg.open_timeout_exceeded() {
                return Err(FabricError::OpenTimeout);
            }
            std::thread::yield_now();
        }
        Ok(())
    }

    fn wait(&self, cfg: &FabricConfig, ranks: usize, local: usize) -> Result<()> {
        if local == 0 {
            for i in 1..ranks {
                self.spin_until_set(self.signal_off(i), cfg)?;
            }
            for i in 1..ranks {
                self.seg.atomic(self.release_off(i)).store(1, Ordering::Release);
            }
        } else {
            self.seg.atomic(self.signal_off(local)).store(1, Ordering::Release);
            self.spin_until_set(self.release_off(local), cfg)?;
        }
        Ok(())
    }
}

/// Append our global rank to the check-in file under an exclusive lock;
/// the position in the file is our local check-in order. Only localid 0
/// creates the file, so a successful open implies the shared segment has
/// been initialized.
fn check_in(path: &Path, localid: usize, rank: usize, cfg: &FabricConfig) -> Result<usize> {
    let mut file = if localid == 0 {
        OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?
    } else {
        loop {
            match OpenOptions::new().read(true).write(true).open(path) {
                Ok(f) => break f,
                Err(_) => {
                    if cfg.open_timeout_exceeded() {
                        return Err(FabricError::OpenTimeout);
                    }
                    std::thread::sleep(Duration::from_millis(1));
                }
            }
        }
    };
    file.lock()?;
    let slot = read_checked_in(&mut file)?.len();
    file.seek(SeekFrom::End(0))?;
    writeln!(file, "{rank}")?;
    file.flush()?;
    file.unlock()?;
    Ok(slot)
}

fn read_checked_in(file: &mut File) -> Result<Vec<usize>> {
    let mut text = String::new();
    file.seek(SeekFrom::Start(0))?;
    file.read_to_string(&mut text)?;
    Ok(text
        .lines()
        .filter_map(|line| line.trim().parse().ok())
        .collect())
}

/// Leader-side wait for local processes to check in.
///
/// With a precise task count this waits for exactly `max_local` entries;
/// otherwise it settles once the count stops growing. May return early
/// with a low count; the late-checkin loop picks up stragglers.
fn wait_check_in(
    path: &Path,
    max_local: usize,
    precise: bool,
    cfg: &FabricConfig,
) -> Result<usize> {
    let mut last = 0;
    let mut stable_since = Instant::now();
    loop {
        let count = {
            let mut file = OpenOptions::new().read(true).write(true).open(path)?;
            file.lock()?;
            let n = read_checked_in(&mut file)?.len();
            file.unlock()?;
            n
        };
        if precise && count >= max_local {
            return Ok(count);
        }
        if count != last {
            last = count;
            stable_since = Instant::now();
        } else if !precise && count > 0 && stable_since.elapsed() > Duration::from_millis(100) {
            return Ok(count);
        }
        if cfg.open_timeout_exceeded() {
            return Err(FabricError::OpenTimeout);
        }
        std::thread::sleep(Duration::from_millis(1));
    }
}

/// Identity of this process within its node, from configuration.
struct NodeIdentity {
    nodeid: usize,
    localid: usize,
    nodelist: String,
    max_local: usize,
    precise: bool,
}

fn node_identity(cfg: &FabricConfig) -> Result<NodeIdentity> {
    let nodeid = cfg
        .nodeid
        .ok_or_else(|| FabricError::Config("shared-memory bootstrap requires MPIRUN_NODEID".into()))?;
    let localid = cfg
        .localid
        .ok_or_else(|| FabricError::Config("shared-memory bootstrap requires MPIRUN_LOCALID".into()))?;
    let nodelist = cfg
        .nodelist
        .clone()
        .ok_or_else(|| FabricError::Config("shared-memory bootstrap requires MPIRUN_NODELIST".into()))?;
    let tasks = cfg
        .tasks_per_node
        .as_deref()
        .ok_or_else(|| FabricError::Config("shared-memory bootstrap requires MPIRUN_TASKS_PER_NODE".into()))?;
    let (max_local, precise) = parse_tasks_per_node(tasks)?;
    Ok(NodeIdentity {
        nodeid,
        localid,
        nodelist,
        max_local,
        precise,
    })
}

/// Open the full tree via shared memory and a leader tree.
pub fn open_via_shm(
    cfg: &FabricConfig,
    ranks: usize,
    rank: usize,
    auth: &AuthParams,
) -> Result<Tree> {
    let node = node_identity(cfg)?;
    let jobid = cfg.identity.map(|id| id.jobid).unwrap_or(0);
    let file_check_in = Path::new(&cfg.shm_prefix).join(format!("rgrid-{jobid}.checkin"));
    let file_table = Path::new(&cfg.shm_prefix).join(format!("rgrid-{jobid}.table"));

    // segment: barrier scratchpad, per-node (rank,endpoint) table, total
    // count cell, global endpoint table ordered by rank
    let barrier_offset = 0;
    let node_offset = barrier_offset + node.max_local * 8;
    let count_offset = node_offset + node.max_local * ENTRY_LEN;
    let table_offset = count_offset + 4;
    let segment_size = table_offset + ranks * ENDPOINT_LEN;

    // localid 0 creates and zeroes the segment before anyone checks in;
    // everyone else attaches only after check-in succeeds, which implies
    // the leader already initialized the mapping
    let mut segment = None;
    if node.localid == 0 {
        let seg = ShmSegment::attach(&file_table, segment_size)?;
        seg.write_bytes(0, &vec![0u8; segment_size]);
        segment = Some(seg);
    }
    let local = check_in(&file_check_in, node.localid, rank, cfg)?;
    let segment = match segment {
        Some(seg) => seg,
        None => ShmSegment::attach(&file_table, segment_size)?,
    };
    let barrier = ShmBarrier {
        seg: &segment,
        offset: barrier_offset,
    };

    // the first checked-in process is the node leader; it opens the leader
    // tree across nodes over the configured port range
    let nnodes = ranges::nodelist_size(&node.nodelist)?;
    let portoffset = (jobid as usize) % ranges::range_numbers_size(&cfg.shm_ports)?.max(1);
    let mut leader_tree = None;
    let mut leader_listener = None;
    if local == 0 {
        let (listener, _ep) = net::open_listener(Some(&cfg.shm_ports), portoffset)?;
        let t = Tree::open_via_nodelist_scan(
            cfg,
            &node.nodelist,
            &cfg.shm_ports,
            portoffset,
            &listener,
            auth,
            nnodes,
            node.nodeid,
        )?;
        debug!("rank {rank}: leader tree open across {nnodes} nodes");
        leader_tree = Some(t);
        leader_listener = Some(listener);
    }

    // late check-in loop: keep collecting local ranks and re-running the
    // leader exchange until the global table covers every rank
    let mut listener_ep: Option<(std::net::TcpListener, Endpoint)> = None;
    loop {
        if cfg.open_timeout_exceeded() {
            return Err(FabricError::OpenTimeout);
        }
        let ranks_checked_in = if local == 0 {
            wait_check_in(&file_check_in, node.max_local, node.precise, cfg)?
        } else {
            0 // only the leader's count matters; barrier below syncs us
        };

        // open listening sockets only after the leader tree is up so port
        // scans cannot connect to the wrong socket
        barrier.wait(cfg, ranks_checked_in.max(1), local)?;
        if listener_ep.is_none() {
            let (listener, ep) = net::open_listener(None, 0)?;
            let mut entry = [0u8; ENTRY_LEN];
            LittleEndian::write_u32(&mut entry[..4], rank as u32);
            entry[4..].copy_from_slice(&ep.to_bytes());
            segment.write_bytes(node_offset + local * ENTRY_LEN, &entry);
            listener_ep = Some((listener, ep));
        }
        barrier.wait(cfg, ranks_checked_in.max(1), local)?;

        if local == 0 {
            let tree = leader_tree.as_mut().expect("leader tree open");
            let mut send = vec![0u8; ranks_checked_in * ENTRY_LEN];
            segment.read_bytes(node_offset, &mut send);
            let data = tree.aggregate(&send)?;
            let mut num_ranks = 0u32;
            for entry in data.chunks_exact(ENTRY_LEN) {
                let r = LittleEndian::read_u32(&entry[..4]) as usize;
                segment.write_bytes(table_offset + r * ENDPOINT_LEN, &entry[4..]);
                num_ranks += 1;
            }
            let mut cell = [0u8; 4];
            LittleEndian::write_u32(&mut cell, num_ranks);
            segment.write_bytes(count_offset, &cell);
        }
        barrier.wait(cfg, ranks_checked_in.max(1), local)?;

        let mut cell = [0u8; 4];
        segment.read_bytes(count_offset, &mut cell);
        let table_ranks = LittleEndian::read_u32(&cell) as usize;
        if table_ranks == ranks {
            break;
        }
        if rank == 0 {
            debug!("missing processes after check in, have {table_ranks} expected {ranks}");
        }
    }

    // the files can go; the mapping stays alive underneath
    if node.localid == 0 {
        let _ = std::fs::remove_file(&file_check_in);
        let _ = std::fs::remove_file(&file_table);
    }

    let mut table = Vec::with_capacity(ranks);
    let mut buf = [0u8; ENDPOINT_LEN];
    for r in 0..ranks {
        segment.read_bytes(table_offset + r * ENDPOINT_LEN, &mut buf);
        table.push(Endpoint::from_bytes(&buf));
    }
    let (listener, _ep) = listener_ep.expect("listener opened in loop");
    let shape = crate::tree::TreeShape::binomial(ranks, rank);
    let tree = Tree::open_via_table(cfg, shape, &table, &listener, auth)?;

    if let Some(mut t) = leader_tree {
        t.close();
    }
    drop(leader_listener);
    Ok(tree)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_tasks_per_node() {
        assert_eq!(parse_tasks_per_node("4").unwrap(), (4, true));
        assert_eq!(parse_tasks_per_node("4(x3)").unwrap(), (4, true));
        assert_eq!(parse_tasks_per_node("4(x3),2").unwrap(), (4, false));
        assert!(parse_tasks_per_node("").is_err());
        assert!(parse_tasks_per_node("4(x3").is_err());
    }

    #[test]
    fn test_segment_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("seg");
        let seg = ShmSegment::attach(&path, 64).unwrap();
        seg.write_bytes(8, b"hello");
        let mut out = [0u8; 5];
        seg.read_bytes(8, &mut out);
        assert_eq!(&out, b"hello");
        // a second mapping sees the same bytes
        let seg2 = ShmSegment::attach(&path, 64).unwrap();
        let mut out2 = [0u8; 5];
        seg2.read_bytes(8, &mut out2);
        assert_eq!(&out2, b"hello");
    }

    #[test]
    fn test_check_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("checkin");
        let cfg = FabricConfig::default();
        assert_eq!(check_in(&path, 0, 7, &cfg).unwrap(), 0);
        assert_eq!(check_in(&path, 1, 3, &cfg).unwrap(), 1);
        assert_eq!(check_in(&path, 2, 9, &cfg).unwrap(), 2);
        let mut file = File::options().read(true).write(true).open(&path).unwrap();
        assert_eq!(read_checked_in(&mut file).unwrap(), vec![7, 3, 9]);
    }
}
