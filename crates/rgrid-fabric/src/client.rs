//! Fabric front door: one object per process tying together the launcher
//! connection, the tree overlay, and the collective dispatch.
//!
//! Collectives run over the tree when it is open, fall back to the
//! launcher's flat star when not, and degenerate to local no-ops for
//! single-process jobs. Every collective is a total order: all ranks must
//! invoke the same sequence with consistent parameters.

use byteorder::{ByteOrder, LittleEndian};
use log::debug;

use crate::auth::AuthParams;
use crate::config::FabricConfig;
use crate::error::{FabricError, Result};
use crate::kvs::KeyValueStore;
use crate::launcher::LauncherConn;
use crate::shm;
use crate::tree::{ReduceOp, Tree};

pub struct Fabric {
    cfg: FabricConfig,
    auth: AuthParams,
    rank: usize,
    nprocs: usize,
    launcher: Option<LauncherConn>,
    tree: Option<Tree>,
    is_open: bool,
}

impl Fabric {
    /// Build the per-process fabric context. Requires identity in the
    /// configuration.
    pub fn init(cfg: FabricConfig) -> Result<Fabric> {
        let id = cfg.identity.ok_or_else(|| {
            FabricError::Config("fabric requires MPIRUN_RANK/MPIRUN_NPROCS/MPIRUN_ID".into())
        })?;
        let auth = AuthParams::symmetric(&cfg.auth_text(), cfg.auth_enable, cfg.auth_timeout_ms);
        Ok(Fabric {
            rank: id.rank,
            nprocs: id.nprocs,
            auth,
            cfg,
            launcher: None,
            tree: None,
            is_open: false,
        })
    }

    pub fn rank(&self) -> usize {
        self.rank
    }

    pub fn nprocs(&self) -> usize {
        self.nprocs
    }

    /// Bootstrap connectivity: launcher hello and/or tree wireup depending
    /// on configuration. `kvs` must be provided when the KVS bootstrap
    /// path is enabled.
    pub fn open(&mut self, kvs: Option<&mut dyn KeyValueStore>) -> Result<()> {
        let shm_active = self.cfg.shm_enable && self.nprocs >= self.cfg.shm_threshold;
        // the launcher star is the bootstrap channel unless another driver
        // replaces it entirely
        if !self.cfg.kvs_enable && !shm_active && self.cfg.launcher_host.is_some() {
            self.launcher = Some(LauncherConn::open(&self.cfg)?);
        }
        if self.cfg.use_trees && self.nprocs > 1 {
            let tree = if self.cfg.kvs_enable {
                let kvs = kvs.ok_or_else(|| {
                    FabricError::Config("KVS bootstrap enabled but no store provided".into())
                })?;
                Tree::open_via_kvs(&self.cfg, kvs, self.nprocs, self.rank, &self.auth)?
            } else if shm_active {
                shm::open_via_shm(&self.cfg, self.nprocs, self.rank, &self.auth)?
            } else {
                let launcher = self.launcher.as_mut().ok_or_else(|| {
                    FabricError::Config("tree bootstrap requires a launcher connection".into())
                })?;
                Tree::open_via_launcher(&self.cfg, launcher, &self.auth)?
            };
            self.tree = Some(tree);
            // the tree carries everything from here on
            if let Some(launcher) = self.launcher.take() {
                launcher.close()?;
            }
            debug!("rank {}: tree overlay open", self.rank);
        }
        self.is_open = true;
        Ok(())
    }

    /// Tear down connectivity normally.
    pub fn close(&mut self) -> Result<()> {
        if let Some(mut tree) = self.tree.take() {
            tree.close();
        }
        if let Some(launcher) = self.launcher.take() {
            launcher.close()?;
        }
        self.is_open = false;
        Ok(())
    }

    /// Broadcast failure: abort the tree and tell the launcher.
    pub fn abort(&mut self, code: i32) {
        if let Some(tree) = self.tree.as_mut() {
            tree.abort();
        }
        if let Some(mut launcher) = self.launcher.take() {
            let _ = launcher.abort(code);
        }
        self.is_open = false;
    }

    fn ensure_open(&self) -> Result<()> {
        if !self.is_open {
            return Err(FabricError::Protocol(
                "collective invoked before open".into(),
            ));
        }
        Ok(())
    }

    fn no_path() -> FabricError {
        FabricError::Protocol("no communication path to other processes".into())
    }

    pub fn barrier(&mut self) -> Result<()> {
        self.ensure_open()?;
        if self.nprocs == 1 {
            return Ok(());
        }
        if let Some(tree) = self.tree.as_mut() {
            tree.check(true)
        } else if let Some(launcher) = self.launcher.as_mut() {
            launcher.barrier()
        } else {
            Err(Self::no_path())
        }
    }

    /// Broadcast `buf` from `root`. The tree path serves root 0 (the only
    /// root bootstrap uses); other roots require the launcher star.
    pub fn bcast(&mut self, buf: &mut [u8], root: usize) -> Result<()> {
        self.ensure_open()?;
        if self.nprocs == 1 {
            return Ok(());
        }
        match (self.tree.as_mut(), self.launcher.as_mut()) {
            (Some(tree), _) if root == 0 => tree.bcast(buf),
            (_, Some(launcher)) => launcher.bcast(buf, root),
            (Some(_), None) => Err(FabricError::Protocol(format!(
                "tree broadcast requires root 0, got {root}"
            ))),
            (None, None) => Err(Self::no_path()),
        }
    }

    pub fn gather(&mut self, sendbuf: &[u8], recvbuf: &mut [u8], root: usize) -> Result<()> {
        self.ensure_open()?;
        if self.nprocs == 1 {
            recvbuf[..sendbuf.len()].copy_from_slice(sendbuf);
            return Ok(());
        }
        match (self.tree.as_mut(), self.launcher.as_mut()) {
            (Some(tree), _) if root == 0 => tree.gather(sendbuf, recvbuf),
            (_, Some(launcher)) => launcher.gather(sendbuf, recvbuf, root),
            (Some(_), None) => Err(FabricError::Protocol(format!(
                "tree gather requires root 0, got {root}"
            ))),
            (None, None) => Err(Self::no_path()),
        }
    }

    pub fn scatter(
        &mut self,
        sendbuf: &[u8],
        size: usize,
        recvbuf: &mut [u8],
        root: usize,
    ) -> Result<()> {
        self.ensure_open()?;
        if self.nprocs == 1 {
            recvbuf[..size].copy_from_slice(&sendbuf[..size]);
            return Ok(());
        }
        match (self.tree.as_mut(), self.launcher.as_mut()) {
            (Some(tree), _) if root == 0 => tree.scatter(sendbuf, size, recvbuf),
            (_, Some(launcher)) => launcher.scatter(sendbuf, size, recvbuf, root),
            (Some(_), None) => Err(FabricError::Protocol(format!(
                "tree scatter requires root 0, got {root}"
            ))),
            (None, None) => Err(Self::no_path()),
        }
    }

    pub fn allgather(&mut self, sendbuf: &[u8], recvbuf: &mut [u8]) -> Result<()> {
        self.ensure_open()?;
        if self.nprocs == 1 {
            recvbuf[..sendbuf.len()].copy_from_slice(sendbuf);
            return Ok(());
        }
        if let Some(tree) = self.tree.as_mut() {
            tree.allgather(sendbuf, recvbuf)
        } else if let Some(launcher) = self.launcher.as_mut() {
            launcher.allgather(sendbuf, recvbuf)
        } else {
            Err(Self::no_path())
        }
    }

    pub fn alltoall(&mut self, sendbuf: &[u8], size: usize, recvbuf: &mut [u8]) -> Result<()> {
        self.ensure_open()?;
        if self.nprocs == 1 {
            recvbuf[..size].copy_from_slice(&sendbuf[..size]);
            return Ok(());
        }
        if let Some(tree) = self.tree.as_mut() {
            tree.alltoall(sendbuf, size, recvbuf)
        } else if let Some(launcher) = self.launcher.as_mut() {
            launcher.alltoall(sendbuf, size, recvbuf)
        } else {
            Err(Self::no_path())
        }
    }

    /// All-reduce one i64 with sum or max.
    pub fn allreduce_i64(&mut self, value: i64, op: ReduceOp) -> Result<i64> {
        self.ensure_open()?;
        if self.nprocs == 1 {
            return Ok(value);
        }
        if let Some(tree) = self.tree.as_mut() {
            return tree.allreduce_i64(value, op);
        }
        // no tree: gather every value to rank 0, reduce there, broadcast
        let mut sendbuf = [0u8; 8];
        LittleEndian::write_i64(&mut sendbuf, value);
        let mut all = vec![0u8; 8 * self.nprocs];
        self.gather(&sendbuf, &mut all, 0)?;
        let mut result = [0u8; 8];
        if self.rank == 0 {
            let mut acc = LittleEndian::read_i64(&all[..8]);
            for chunk in all.chunks_exact(8).skip(1) {
                let v = LittleEndian::read_i64(chunk);
                acc = match op {
                    ReduceOp::Sum => acc + v,
                    ReduceOp::Max => acc.max(v),
                };
            }
            LittleEndian::write_i64(&mut result, acc);
        }
        self.bcast(&mut result, 0)?;
        Ok(LittleEndian::read_i64(&result))
    }

    /// Gather per-rank byte payloads of differing sizes into one buffer,
    /// byte-identical on every rank.
    pub fn aggregate(&mut self, sendbuf: &[u8]) -> Result<Vec<u8>> {
        self.ensure_open()?;
        if self.nprocs == 1 {
            return Ok(sendbuf.to_vec());
        }
        if let Some(tree) = self.tree.as_mut() {
            return tree.aggregate(sendbuf);
        }
        // treeless path: exchange lengths, allgather padded chunks, then
        // compact in rank order (the byte order guarantee is only that the
        // result is identical on all ranks)
        let mut lenbuf = [0u8; 8];
        LittleEndian::write_i64(&mut lenbuf, sendbuf.len() as i64);
        let mut lengths = vec![0u8; 8 * self.nprocs];
        self.allgather(&lenbuf, &mut lengths)?;
        let sizes: Vec<usize> = lengths
            .chunks_exact(8)
            .map(|c| LittleEndian::read_i64(c) as usize)
            .collect();
        let maxlen = sizes.iter().copied().max().unwrap_or(0);
        let mut padded = vec![0u8; maxlen];
        padded[..sendbuf.len()].copy_from_slice(sendbuf);
        let mut all = vec![0u8; maxlen * self.nprocs];
        self.allgather(&padded, &mut all)?;
        let mut out = Vec::with_capacity(sizes.iter().sum());
        for (i, &size) in sizes.iter().enumerate() {
            out.extend_from_slice(&all[i * maxlen..i * maxlen + size]);
        }
        Ok(out)
    }

    /// Allgather of strings: every rank contributes one string and
    /// receives all of them in rank order.
    pub fn allgather_str(&mut self, s: &str) -> Result<Vec<String>> {
        self.ensure_open()?;
        if self.nprocs == 1 {
            return Ok(vec![s.to_string()]);
        }
        // include the terminator so the receiver can find each end
        let maxlen = self.allreduce_i64(s.len() as i64 + 1, ReduceOp::Max)? as usize;
        let mut padded = vec![0u8; maxlen];
        padded[..s.len()].copy_from_slice(s.as_bytes());
        let mut all = vec![0u8; maxlen * self.nprocs];
        self.allgather(&padded, &mut all)?;
        Ok(all
            .chunks_exact(maxlen)
            .map(|chunk| {
                let end = chunk.iter().position(|&b| b == 0).unwrap_or(maxlen);
                String::from_utf8_lossy(&chunk[..end]).into_owned()
            })
            .collect())
    }
}
