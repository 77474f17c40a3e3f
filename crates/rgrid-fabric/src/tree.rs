//! TCP tree overlay and the collectives that run over it.
//!
//! Both shapes are deterministic functions of `(ranks, rank)`, so every
//! participant computes an identical tree. The children of any rank cover a
//! contiguous range of ranks starting one past the parent; the first child
//! is the furthest away, the last the nearest. The collective algorithms
//! rely on this layout.
//!
//! Every payload on a tree link is prefixed by a `u32` header: `COLLECTIVE`
//! carries data, `ABORT` tears the whole tree down. A rank that reads an
//! abort mid-collective rebroadcasts it, closes its links, and surfaces
//! [`FabricError::PeerAbort`] so the top level can exit with success (the
//! abort originator is the failure reporter).

use std::net::{TcpListener, TcpStream};

use byteorder::{ByteOrder, LittleEndian};
use log::{debug, error};
use rgrid_core::ranges;

use crate::auth::{self, AuthParams};
use crate::config::FabricConfig;
use crate::error::{FabricError, Result};
use crate::fdio;
use crate::kvs::KeyValueStore;
use crate::net::{self, ENDPOINT_LEN, Endpoint};

/// Abort packet header.
pub const HEADER_ABORT: u32 = 0;
/// Collective packet header.
pub const HEADER_COLLECTIVE: u32 = 1;

/// Reduction operator for [`Tree::allreduce_i64`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReduceOp {
    Sum,
    Max,
}

/// One child position in a tree shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChildSlot {
    pub rank: usize,
    /// Number of ranks in the subtree rooted at this child.
    pub incl: usize,
}

/// Deterministic tree position for one rank.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TreeShape {
    pub ranks: usize,
    pub rank: usize,
    pub depth: usize,
    pub parent: Option<usize>,
    pub children: Vec<ChildSlot>,
}

impl TreeShape {
    /// Binomial tree: rank 0's children come from recursive midpoint
    /// halving, giving up to ⌈log₂ N⌉ children per rank.
    pub fn binomial(ranks: usize, rank: usize) -> TreeShape {
        let mut shape = TreeShape {
            ranks,
            rank,
            depth: 0,
            parent: None,
            children: Vec::new(),
        };
        let mut depth = 1;
        let mut low = 0;
        let mut high = ranks.saturating_sub(1);
        while high > low {
            let span = high - low;
            let mid = span / 2 + span % 2 + low;
            if low == rank {
                shape.children.push(ChildSlot {
                    rank: mid,
                    incl: high - mid + 1,
                });
            }
            if mid == rank {
                shape.depth = depth;
                shape.parent = Some(low);
            }
            if mid <= rank {
                low = mid;
            } else {
                high = mid - 1;
                depth += 1;
            }
        }
        shape
    }

    /// Balanced binary tree: up to two children per interior rank; the
    /// first child is the midpoint (furthest), the second the next rank up
    /// from the parent when that leaves room.
    pub fn binary(ranks: usize, rank: usize) -> TreeShape {
        let mut shape = TreeShape {
            ranks,
            rank,
            depth: 0,
            parent: None,
            children: Vec::new(),
        };
        let mut low = 0;
        let mut high = ranks.saturating_sub(1);
        while high > low {
            let span = high - low;
            let mid = span / 2 + span % 2 + low;
            if low == rank {
                shape.children.push(ChildSlot {
                    rank: mid,
                    incl: high - mid + 1,
                });
                let second = low + 1;
                if mid > second {
                    shape.children.push(ChildSlot {
                        rank: second,
                        incl: mid - second,
                    });
                }
                break;
            }
            shape.depth += 1;
            if mid <= rank {
                if mid == rank {
                    shape.parent = Some(low);
                }
                low = mid;
            } else {
                if low + 1 == rank {
                    shape.parent = Some(low);
                }
                low += 1;
                high = mid - 1;
            }
        }
        shape
    }

    /// Total ranks below this one.
    pub fn num_child_incl(&self) -> usize {
        self.children.iter().map(|c| c.incl).sum()
    }
}

/// One open connection in the tree, with a printable peer name for error
/// context.
struct Link {
    stream: TcpStream,
    name: String,
}

/// Per-process tree state: parent link, child links, open flag.
pub struct Tree {
    shape: TreeShape,
    parent: Option<Link>,
    children: Vec<Option<Link>>,
    is_open: bool,
    name: String,
    host: String,
}

enum Peer {
    Parent,
    Child(usize),
}

impl Tree {
    fn closed(shape: TreeShape) -> Tree {
        let nchildren = shape.children.len();
        let name = format!("rank {} of {}", shape.rank, shape.ranks);
        Tree {
            shape,
            parent: None,
            children: (0..nchildren).map(|_| None).collect(),
            is_open: false,
            name,
            host: net::hostname(),
        }
    }

    pub fn shape(&self) -> &TreeShape {
        &self.shape
    }

    pub fn rank(&self) -> usize {
        self.shape.rank
    }

    pub fn ranks(&self) -> usize {
        self.shape.ranks
    }

    pub fn is_open(&self) -> bool {
        self.is_open
    }

    /// Close every link without notifying peers.
    pub fn close(&mut self) {
        self.is_open = false;
        self.parent = None;
        for c in self.children.iter_mut() {
            *c = None;
        }
    }

    /// Write the abort opcode to the parent and every live child, then
    /// close all links.
    pub fn abort(&mut self) {
        let mut header = [0u8; 4];
        LittleEndian::write_u32(&mut header, HEADER_ABORT);
        if let Some(link) = self.parent.as_mut() {
            let _ = fdio::write_fd(&mut link.stream, &header);
        }
        for child in self.children.iter_mut().flatten() {
            let _ = fdio::write_fd(&mut child.stream, &header);
        }
        self.close();
    }

    /// Write one collective packet to a peer; failure aborts the tree.
    fn send(&mut self, peer: Peer, buf: &[u8]) -> Result<()> {
        let rc = match self.peer_link(&peer) {
            Some(link) => write_packet(&mut link.stream, buf),
            None => Err(FabricError::Protocol("peer not connected".into())),
        };
        if let Err(e) = rc {
            error!("{} writing to {}: {e}", self.name, self.peer_name(&peer));
            self.abort();
            return Err(e);
        }
        Ok(())
    }

    /// Read one collective packet from a peer; an abort packet or failure
    /// tears the tree down.
    fn recv(&mut self, peer: Peer, buf: &mut [u8]) -> Result<()> {
        let rc = match self.peer_link(&peer) {
            Some(link) => read_packet(&mut link.stream, buf),
            None => Err(FabricError::Protocol("peer not connected".into())),
        };
        if let Err(e) = rc {
            if !e.is_peer_abort() {
                error!("{} reading from {}: {e}", self.name, self.peer_name(&peer));
            }
            self.abort();
            return Err(e);
        }
        Ok(())
    }

    fn peer_link(&mut self, peer: &Peer) -> Option<&mut Link> {
        match peer {
            Peer::Parent => self.parent.as_mut(),
            Peer::Child(i) => self.children.get_mut(*i).and_then(Option::as_mut),
        }
    }

    fn peer_name(&self, peer: &Peer) -> String {
        match peer {
            Peer::Parent => match (&self.parent, self.shape.parent) {
                (Some(link), _) => link.name.clone(),
                (None, Some(rank)) => format!("parent rank {rank}"),
                (None, None) => "no parent".to_string(),
            },
            Peer::Child(i) => match self.children.get(*i).and_then(Option::as_ref) {
                Some(link) => link.name.clone(),
                None => format!("child rank {}", self.shape.children[*i].rank),
            },
        }
    }

    /// One-byte logical-AND sweep: every rank's success flag is reduced to
    /// the root and the verdict broadcast back. A false verdict anywhere
    /// aborts the tree on every rank; non-originators surface
    /// [`FabricError::PeerAbort`] so they exit with success.
    pub fn check(&mut self, value: bool) -> Result<()> {
        let mut all = value;
        for i in 0..self.children.len() {
            if self.children[i].is_some() {
                let mut buf = [0u8; 4];
                self.recv(Peer::Child(i), &mut buf)?;
                if LittleEndian::read_u32(&buf) == 0 {
                    all = false;
                }
            } else {
                // never connected to this child
                all = false;
            }
        }
        let mut buf = [0u8; 4];
        LittleEndian::write_u32(&mut buf, all as u32);
        if self.parent.is_some() {
            self.send(Peer::Parent, &buf)?;
            self.recv(Peer::Parent, &mut buf)?;
            all = LittleEndian::read_u32(&buf) != 0;
            LittleEndian::write_u32(&mut buf, all as u32);
        }
        for i in 0..self.children.len() {
            if self.children[i].is_some() {
                self.send(Peer::Child(i), &buf)?;
            }
        }
        if !all {
            self.abort();
            return if value {
                Err(FabricError::PeerAbort)
            } else {
                Err(FabricError::Protocol("tree check failed".into()))
            };
        }
        Ok(())
    }

    /// Barrier: the tree check with a success flag and no payload.
    pub fn barrier(&mut self) -> Result<()> {
        self.check(true)
    }

    /// Broadcast `buf` from rank 0 to every rank.
    pub fn bcast(&mut self, buf: &mut [u8]) -> Result<()> {
        if self.shape.rank != 0 {
            self.recv(Peer::Parent, buf)?;
        }
        for i in 0..self.children.len() {
            self.send(Peer::Child(i), buf)?;
        }
        self.check(true)
    }

    /// Gather `sendbuf` from every rank into `recvbuf` on rank 0, in rank
    /// order. `recvbuf` must hold `ranks * sendbuf.len()` bytes on rank 0.
    pub fn gather(&mut self, sendbuf: &[u8], recvbuf: &mut [u8]) -> Result<()> {
        let size = sendbuf.len();
        let bigcount = (self.shape.num_child_incl() + 1) * size;
        let mut tmp = if self.shape.rank != 0 {
            vec![0u8; bigcount]
        } else {
            Vec::new()
        };
        let big: &mut [u8] = if self.shape.rank == 0 {
            recvbuf
        } else {
            &mut tmp
        };
        big[..size].copy_from_slice(sendbuf);
        // last child is the nearest rank, so reverse order fills the buffer
        // in ascending rank order
        let mut offset = size;
        for i in (0..self.children.len()).rev() {
            let len = size * self.shape.children[i].incl;
            self.recv(Peer::Child(i), &mut big[offset..offset + len])?;
            offset += len;
        }
        if self.shape.rank != 0 {
            self.send(Peer::Parent, &big[..bigcount])?;
        }
        self.check(true)
    }

    /// Scatter `size`-byte chunks of `sendbuf` on rank 0 to every rank's
    /// `recvbuf`.
    pub fn scatter(&mut self, sendbuf: &[u8], size: usize, recvbuf: &mut [u8]) -> Result<()> {
        let bigcount = (self.shape.num_child_incl() + 1) * size;
        let big: Vec<u8> = if self.shape.rank == 0 {
            sendbuf[..bigcount].to_vec()
        } else {
            let mut tmp = vec![0u8; bigcount];
            self.recv(Peer::Parent, &mut tmp)?;
            tmp
        };
        for i in 0..self.children.len() {
            let child = self.shape.children[i];
            let start = size * (child.rank - self.shape.rank);
            self.send(Peer::Child(i), &big[start..start + size * child.incl])?;
        }
        recvbuf[..size].copy_from_slice(&big[..size]);
        self.check(true)
    }

    /// Gather to rank 0 then broadcast: every rank ends with all
    /// contributions in rank order.
    pub fn allgather(&mut self, sendbuf: &[u8], recvbuf: &mut [u8]) -> Result<()> {
        self.gather(sendbuf, recvbuf)?;
        self.bcast(recvbuf)
    }

    /// Each rank sends `size` bytes to every rank; `sendbuf` holds `ranks`
    /// chunks by destination, `recvbuf` receives `ranks` chunks by source.
    pub fn alltoall(&mut self, sendbuf: &[u8], size: usize, recvbuf: &mut [u8]) -> Result<()> {
        let ranks = self.shape.ranks;
        let incl = self.shape.num_child_incl();
        let mut tmp_recv = vec![0u8; incl * ranks * size];
        let mut offset = 0;
        let mut child_spans: Vec<(usize, usize)> = Vec::new(); // (offset, incl)
        for i in (0..self.children.len()).rev() {
            let child_incl = self.shape.children[i].incl;
            let len = ranks * size * child_incl;
            self.recv(Peer::Child(i), &mut tmp_recv[offset..offset + len])?;
            child_spans.push((offset, child_incl));
            offset += len;
        }
        // order everything by destination rank, interleaving our own chunk
        // ahead of each child block
        let mut tmp_send = vec![0u8; (incl + 1) * ranks * size];
        let mut out = 0;
        for dest in 0..ranks {
            tmp_send[out..out + size].copy_from_slice(&sendbuf[size * dest..size * (dest + 1)]);
            out += size;
            for &(span_offset, child_incl) in &child_spans {
                let src = span_offset + size * dest * child_incl;
                let len = size * child_incl;
                tmp_send[out..out + len].copy_from_slice(&tmp_recv[src..src + len]);
                out += len;
            }
        }
        if self.shape.rank != 0 {
            self.send(Peer::Parent, &tmp_send)?;
        }
        self.scatter(&tmp_send, size * ranks, recvbuf)?;
        self.check(true)
    }

    /// All-reduce one i64 (sum or max); every rank receives the result.
    pub fn allreduce_i64(&mut self, value: i64, op: ReduceOp) -> Result<i64> {
        let mut val = value;
        for i in (0..self.children.len()).rev() {
            let mut buf = [0u8; 8];
            self.recv(Peer::Child(i), &mut buf)?;
            let child = LittleEndian::read_i64(&buf);
            val = match op {
                ReduceOp::Sum => val + child,
                ReduceOp::Max => val.max(child),
            };
        }
        let mut buf = [0u8; 8];
        LittleEndian::write_i64(&mut buf, val);
        if self.shape.rank != 0 {
            self.send(Peer::Parent, &buf)?;
        }
        // the root's reduced value rides the broadcast down
        self.bcast(&mut buf)?;
        Ok(LittleEndian::read_i64(&buf))
    }

    /// Collect every rank's payload (sizes may differ per rank) into one
    /// buffer, byte-identical on all ranks. The concatenation order is the
    /// up-stream arrival order, not rank order.
    pub fn aggregate(&mut self, sendbuf: &[u8]) -> Result<Vec<u8>> {
        let total = self.allreduce_i64(sendbuf.len() as i64, ReduceOp::Sum)?;
        let mut recv = vec![0u8; total as usize];
        recv[..sendbuf.len()].copy_from_slice(sendbuf);
        let mut offset = sendbuf.len();
        for i in (0..self.children.len()).rev() {
            let mut lenbuf = [0u8; 8];
            self.recv(Peer::Child(i), &mut lenbuf)?;
            let incoming = LittleEndian::read_i64(&lenbuf) as usize;
            if offset + incoming > recv.len() {
                self.abort();
                return Err(FabricError::Protocol(format!(
                    "aggregate overflow: {incoming} bytes past {offset} of {total}"
                )));
            }
            self.recv(Peer::Child(i), &mut recv[offset..offset + incoming])?;
            offset += incoming;
        }
        if self.shape.rank != 0 {
            let mut lenbuf = [0u8; 8];
            LittleEndian::write_i64(&mut lenbuf, offset as i64);
            self.send(Peer::Parent, &lenbuf)?;
            self.send(Peer::Parent, &recv[..offset])?;
        }
        self.bcast(&mut recv)?;
        self.check(true)?;
        Ok(recv)
    }

    // ------------------------------------------------------------------
    // Wireup
    // ------------------------------------------------------------------

    /// Open the tree from a full endpoint table.
    ///
    /// The depth-parity schedule alternates connect/accept rounds so no two
    /// ranks ever dial each other simultaneously. The direction policy
    /// (`connect_down`) picks which side dials.
    pub fn open_via_table(
        cfg: &FabricConfig,
        shape: TreeShape,
        table: &[Endpoint],
        listener: &TcpListener,
        auth: &AuthParams,
    ) -> Result<Tree> {
        let mut tree = Tree::closed(shape);
        for iter in 0..2 {
            let connect_round = (tree.shape.depth + iter) % 2 == 1;
            let rc = if connect_round {
                if cfg.connect_down {
                    tree.connect_children_by_table(cfg, table, auth)
                } else {
                    tree.connect_parent_by_table(cfg, table, auth)
                }
            } else if cfg.connect_down {
                tree.accept_parent(listener, auth)
            } else {
                tree.accept_children(listener, auth)
            };
            if let Err(e) = rc {
                error!("{} wireup failed: {e}", tree.name);
                tree.abort();
                return Err(e);
            }
        }
        tree.is_open = true;
        tree.check(true)?;
        Ok(tree)
    }

    /// Open the tree through an external key-value store: publish our
    /// endpoint, barrier, read every peer, then run the table wireup.
    pub fn open_via_kvs(
        cfg: &FabricConfig,
        kvs: &mut dyn KeyValueStore,
        ranks: usize,
        rank: usize,
        auth: &AuthParams,
    ) -> Result<Tree> {
        let (listener, ep) = net::open_listener(None, 0)?;
        kvs.put(&format!("rgrid-ep-{rank}"), &ep.to_string())?;
        kvs.barrier()?;
        let mut table = Vec::with_capacity(ranks);
        for r in 0..ranks {
            let value = kvs.get(&format!("rgrid-ep-{r}"))?;
            table.push(parse_endpoint(&value)?);
        }
        let shape = TreeShape::binomial(ranks, rank);
        Tree::open_via_table(cfg, shape, &table, &listener, auth)
    }

    /// Open the tree via the launcher: gather every endpoint to rank 0
    /// through the flat star, then push the table down the tree as each
    /// parent dials its children.
    pub fn open_via_launcher(
        cfg: &FabricConfig,
        launcher: &mut crate::launcher::LauncherConn,
        auth: &AuthParams,
    ) -> Result<Tree> {
        let ranks = launcher.ranks();
        let rank = launcher.rank();
        let shape = TreeShape::binomial(ranks, rank);
        let (listener, ep) = net::open_listener(None, 0)?;

        let mut table = vec![0u8; ENDPOINT_LEN * ranks];
        launcher.gather(&ep.to_bytes(), &mut table, 0)?;

        let mut tree = Tree::closed(shape);
        if tree.shape.rank != 0 {
            // the parent forwards the full table right after dialing us
            if let Err(e) = tree
                .accept_parent(&listener, auth)
                .and_then(|()| tree.recv(Peer::Parent, &mut table))
            {
                error!("{} receiving endpoint table: {e}", tree.name);
                tree.abort();
                return Err(e);
            }
        }
        for i in 0..tree.children.len() {
            let child_rank = tree.shape.children[i].rank;
            let ep = Endpoint::from_bytes(&table[ENDPOINT_LEN * child_rank..]);
            if let Err(e) = tree
                .connect_child(cfg, i, ep, auth)
                .and_then(|()| tree.send(Peer::Child(i), &table))
            {
                error!("{} connecting child rank {child_rank}: {e}", tree.name);
                tree.abort();
                return Err(e);
            }
        }
        tree.is_open = true;
        tree.check(true)?;
        Ok(tree)
    }

    /// Open a tree where peers are located by hostname port scan (used by
    /// the leader tree of the shared-memory driver).
    pub fn open_via_nodelist_scan(
        cfg: &FabricConfig,
        nodelist: &str,
        portrange: &str,
        portoffset: usize,
        listener: &TcpListener,
        auth: &AuthParams,
        ranks: usize,
        rank: usize,
    ) -> Result<Tree> {
        let mut tree = Tree::closed(TreeShape::binomial(ranks, rank));
        for iter in 0..2 {
            let connect_round = (tree.shape.depth + iter) % 2 == 1;
            let rc = if connect_round {
                if cfg.connect_down {
                    tree.connect_children_by_scan(cfg, nodelist, portrange, portoffset, auth)
                } else {
                    tree.connect_parent_by_scan(cfg, nodelist, portrange, portoffset, auth)
                }
            } else if cfg.connect_down {
                tree.accept_parent(listener, auth)
            } else {
                tree.accept_children(listener, auth)
            };
            if let Err(e) = rc {
                error!("{} leader wireup failed: {e}", tree.name);
                tree.abort();
                return Err(e);
            }
        }
        tree.is_open = true;
        tree.check(true)?;
        Ok(tree)
    }

    /// Dial one child until it authenticates. With an open timeout the
    /// loop runs until the deadline; without one, a bounded number of
    /// passes keeps a dead endpoint from hanging wireup forever.
    fn connect_child(
        &mut self,
        cfg: &FabricConfig,
        i: usize,
        ep: Endpoint,
        auth: &AuthParams,
    ) -> Result<()> {
        let child_rank = self.shape.children[i].rank;
        let mut attempts = 0;
        loop {
            if cfg.open_timeout_exceeded() {
                return Err(FabricError::OpenTimeout);
            }
            attempts += 1;
            if let Ok(mut stream) = net::connect(cfg, ep.addr()) {
                if auth::authenticate_connect(&mut stream, auth).is_ok() {
                    self.children[i] = Some(Link {
                        stream,
                        name: format!("rank {child_rank} of {} at {ep}", self.shape.ranks),
                    });
                    return Ok(());
                }
                // authenticated too slowly or dialed a stranger; retry
            }
            if cfg.open_timeout_s < 0 && attempts >= cfg.connect_tries {
                return Err(FabricError::ConnectFailed(ep.to_string()));
            }
        }
    }

    fn connect_children_by_table(
        &mut self,
        cfg: &FabricConfig,
        table: &[Endpoint],
        auth: &AuthParams,
    ) -> Result<()> {
        for i in 0..self.children.len() {
            let ep = table[self.shape.children[i].rank];
            self.connect_child(cfg, i, ep, auth)?;
        }
        Ok(())
    }

    fn connect_parent_by_table(
        &mut self,
        cfg: &FabricConfig,
        table: &[Endpoint],
        auth: &AuthParams,
    ) -> Result<()> {
        let Some(parent_rank) = self.shape.parent else {
            return Ok(());
        };
        let ep = table[parent_rank];
        let mut attempts = 0;
        loop {
            if cfg.open_timeout_exceeded() {
                return Err(FabricError::OpenTimeout);
            }
            attempts += 1;
            let mut stream = net::connect(cfg, ep.addr())?;
            if auth::authenticate_connect(&mut stream, auth).is_ok() {
                return self.parent_exchange(stream, ep);
            }
            if cfg.open_timeout_s < 0 && attempts >= cfg.connect_tries {
                return Err(FabricError::AuthFailed);
            }
        }
    }

    /// Connect to our children by scanning their hostnames (reverse order:
    /// ascending rank performs measurably better on dense clusters).
    fn connect_children_by_scan(
        &mut self,
        cfg: &FabricConfig,
        nodelist: &str,
        portrange: &str,
        portoffset: usize,
        auth: &AuthParams,
    ) -> Result<()> {
        let nodes = ranges::nodelist_size(nodelist)?;
        for i in (0..self.children.len()).rev() {
            let child_rank = self.shape.children[i].rank;
            if child_rank >= nodes {
                return Err(FabricError::Protocol(format!(
                    "child rank {child_rank} out of range of {nodes} nodes"
                )));
            }
            let host = ranges::nodelist_nth(nodelist, child_rank + 1)?;
            let stream =
                net::connect_hostname(cfg, child_rank, &host, portrange, portoffset, auth)?;
            self.children[i] = Some(Link {
                stream,
                name: format!("rank {child_rank} of {} on {host}", self.shape.ranks),
            });
        }
        Ok(())
    }

    fn connect_parent_by_scan(
        &mut self,
        cfg: &FabricConfig,
        nodelist: &str,
        portrange: &str,
        portoffset: usize,
        auth: &AuthParams,
    ) -> Result<()> {
        let Some(parent_rank) = self.shape.parent else {
            return Ok(());
        };
        let host = ranges::nodelist_nth(nodelist, parent_rank + 1)?;
        let stream = net::connect_hostname(cfg, parent_rank, &host, portrange, portoffset, auth)?;
        let ep = Endpoint {
            ip: std::net::Ipv4Addr::LOCALHOST,
            port: 0,
        };
        self.parent_exchange_named(stream, format!("rank {parent_rank} on {host}"), ep)
    }

    /// After authenticating to our parent, exchange ranks and hostnames so
    /// it knows which child dialed in.
    fn parent_exchange(&mut self, stream: TcpStream, ep: Endpoint) -> Result<()> {
        let parent_rank = self.shape.parent.expect("non-root");
        self.parent_exchange_named(
            stream,
            format!("rank {parent_rank} of {} at {ep}", self.shape.ranks),
            ep,
        )
    }

    fn parent_exchange_named(
        &mut self,
        mut stream: TcpStream,
        name: String,
        _ep: Endpoint,
    ) -> Result<()> {
        let parent_rank = self.shape.parent.expect("non-root");
        let mut buf = [0u8; 4];
        read_packet(&mut stream, &mut buf)?;
        let connected = LittleEndian::read_u32(&buf) as usize;
        write_packet(&mut stream, &(self.shape.rank as u32).to_le_bytes())?;
        if connected != parent_rank {
            return Err(FabricError::Protocol(format!(
                "rank of parent {connected} does not match expected rank {parent_rank}"
            )));
        }
        // parent hostname, then ours
        let mut lenbuf = [0u8; 4];
        read_packet(&mut stream, &mut lenbuf)?;
        let host_len = LittleEndian::read_u32(&lenbuf) as usize;
        let mut host = vec![0u8; host_len];
        if host_len > 0 {
            read_packet(&mut stream, &mut host)?;
        }
        let ours = self.host.as_bytes().to_vec();
        write_packet(&mut stream, &(ours.len() as u32).to_le_bytes())?;
        if !ours.is_empty() {
            write_packet(&mut stream, &ours)?;
        }
        self.parent = Some(Link { stream, name });
        Ok(())
    }

    /// Accept one authenticated connection from our parent (used when
    /// parents dial children).
    fn accept_parent(&mut self, listener: &TcpListener, auth: &AuthParams) -> Result<()> {
        if self.shape.rank == 0 {
            return Ok(());
        }
        let (stream, ep) = net::accept_authed(listener, auth)?;
        let parent_rank = self.shape.parent.expect("non-root");
        self.parent = Some(Link {
            stream,
            name: format!("rank {parent_rank} of {} at {ep}", self.shape.ranks),
        });
        Ok(())
    }

    /// Accept authenticated connections from every child, learning which
    /// child each one is from the rank exchange.
    fn accept_children(&mut self, listener: &TcpListener, auth: &AuthParams) -> Result<()> {
        let mut remaining = self.children.iter().filter(|c| c.is_none()).count();
        while remaining > 0 {
            let (mut stream, ep) = net::accept_authed(listener, auth)?;
            // announce ourselves, then learn who dialed in
            write_packet(&mut stream, &(self.shape.rank as u32).to_le_bytes())?;
            let host = self.host.as_bytes();
            write_packet(&mut stream, &(host.len() as u32).to_le_bytes())?;
            if !host.is_empty() {
                write_packet(&mut stream, host)?;
            }
            let mut buf = [0u8; 4];
            read_packet(&mut stream, &mut buf)?;
            let rank = LittleEndian::read_u32(&buf) as usize;
            let mut lenbuf = [0u8; 4];
            read_packet(&mut stream, &mut lenbuf)?;
            let host_len = LittleEndian::read_u32(&lenbuf) as usize;
            let mut child_host = vec![0u8; host_len];
            if host_len > 0 {
                read_packet(&mut stream, &mut child_host)?;
            }
            let Some(index) = self
                .shape
                .children
                .iter()
                .position(|c| c.rank == rank)
            else {
                return Err(FabricError::Protocol(format!(
                    "unexpected child rank {rank} connected at {ep}"
                )));
            };
            debug!(
                "{} accepted child rank {rank} from {}",
                self.name,
                String::from_utf8_lossy(&child_host)
            );
            self.children[index] = Some(Link {
                stream,
                name: format!("rank {rank} of {} at {ep}", self.shape.ranks),
            });
            remaining -= 1;
        }
        Ok(())
    }
}

/// Write one header-prefixed packet.
fn write_packet(stream: &mut TcpStream, buf: &[u8]) -> Result<()> {
    let mut header = [0u8; 4];
    LittleEndian::write_u32(&mut header, HEADER_COLLECTIVE);
    fdio::write_fd(stream, &header)?;
    if !buf.is_empty() {
        fdio::write_fd(stream, buf)?;
    }
    Ok(())
}

/// Read one header-prefixed packet into `buf`.
fn read_packet(stream: &mut TcpStream, buf: &mut [u8]) -> Result<()> {
    let header = fdio::read_u32(stream)?;
    match header {
        HEADER_COLLECTIVE => {
            if !buf.is_empty() {
                fdio::read_fd(stream, buf)?;
            }
            Ok(())
        }
        HEADER_ABORT => Err(FabricError::PeerAbort),
        other => Err(FabricError::Protocol(format!(
            "unknown packet header {other}"
        ))),
    }
}

fn parse_endpoint(s: &str) -> Result<Endpoint> {
    let (ip, port) = s
        .split_once(':')
        .ok_or_else(|| FabricError::Protocol(format!("bad endpoint '{s}'")))?;
    Ok(Endpoint {
        ip: ip
            .parse()
            .map_err(|_| FabricError::Protocol(format!("bad endpoint ip '{s}'")))?,
        port: port
            .parse()
            .map_err(|_| FabricError::Protocol(format!("bad endpoint port '{s}'")))?,
    })
}
