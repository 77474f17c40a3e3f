//! Resource list: a collection of rnodes keyed by rank.
//!
//! Nodes are stored in a dense ordered map keyed by rank; every "all nodes"
//! walk is an in-order walk of that map. Operations that cannot preserve
//! invariants unwind to the pre-call state (`rerank`, `set_allocated`,
//! `free`).

use std::collections::{BTreeMap, BTreeSet};

use rgrid_core::{Hostlist, IdSet, IdsetFlags};
use serde_json::Value;

use crate::error::RsetError;
use crate::matcher::Constraint;
use crate::rnode::{CORE, Ignore, Rnode};
use crate::rv1::{RliteEntry, Rv1};

/// Characters rejected in property names (assignment side; `^` included).
const RESERVED_PROPERTY_CHARS: &[char] = &['^', '&', '\'', '"', '`', '|', '(', ')'];

/// Per-class verify policy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum VerifyMode {
    #[default]
    Strict,
    Ignore,
    AllowMissing,
    AllowExtra,
}

/// Verify policy per resource class.
#[derive(Debug, Clone, Copy, Default)]
pub struct VerifyConfig {
    pub hostname: VerifyMode,
    pub core: VerifyMode,
    pub gpu: VerifyMode,
}

/// Successful verify outcomes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VerifyOutcome {
    /// Actual matches expected exactly.
    Exact,
    /// Actual carries extra resources (summary attached).
    Extra(String),
}

/// A collection of resource nodes forming a resource set.
#[derive(Debug, Clone)]
pub struct Rlist {
    nodes: BTreeMap<u32, Rnode>,
    /// Resource classes exempt from dense remapping.
    noremap: BTreeSet<String>,
    pub nslots: Option<u64>,
    pub starttime: Option<f64>,
    pub expiration: Option<f64>,
    /// Opaque scheduler payload, preserved byte-for-byte.
    pub scheduling: Option<Value>,
}

impl Rlist {
    /// Create an empty resource list. `gpu` starts in the noremap set.
    pub fn new() -> Rlist {
        let mut noremap = BTreeSet::new();
        noremap.insert("gpu".to_string());
        Rlist {
            nodes: BTreeMap::new(),
            noremap,
            nslots: None,
            starttime: None,
            expiration: None,
            scheduling: None,
        }
    }

    /// Total core count across all nodes.
    pub fn total(&self) -> usize {
        self.nodes.values().map(Rnode::count).sum()
    }

    /// Available core count across up nodes.
    pub fn avail(&self) -> usize {
        self.nodes.values().map(Rnode::avail).sum()
    }

    /// Number of resource nodes.
    pub fn nnodes(&self) -> usize {
        self.nodes.len()
    }

    /// Total id count for one resource class.
    pub fn count(&self, class: &str) -> usize {
        self.nodes.values().map(|n| n.count_type(class)).sum()
    }

    pub fn find_rank(&self, rank: u32) -> Option<&Rnode> {
        self.nodes.get(&rank)
    }

    pub(crate) fn find_rank_mut(&mut self, rank: u32) -> Option<&mut Rnode> {
        self.nodes.get_mut(&rank)
    }

    /// In-rank-order node walk.
    pub fn nodes(&self) -> impl Iterator<Item = &Rnode> {
        self.nodes.values()
    }

    /// Add one rnode, merging child pools when the rank already exists.
    pub fn add_rnode(&mut self, n: Rnode) -> Result<(), RsetError> {
        match self.nodes.get_mut(&n.rank) {
            Some(found) => found.add(&n),
            None => {
                self.nodes.insert(n.rank, n);
                Ok(())
            }
        }
    }

    /// Append a node with hostname, rank, and core idset string.
    pub fn append_rank_cores(
        &mut self,
        hostname: Option<&str>,
        rank: u32,
        core_ids: &str,
    ) -> Result<(), RsetError> {
        self.add_rnode(Rnode::with_cores(hostname, rank, core_ids)?)
    }

    /// Add child resource ids to an existing rank.
    pub fn rank_add_child(&mut self, rank: u32, name: &str, ids: &str) -> Result<(), RsetError> {
        let n = self
            .find_rank_mut(rank)
            .ok_or(RsetError::UnknownRank(rank))?;
        n.add_child(name, ids)
    }

    fn copy_meta_from(&mut self, orig: &Rlist) {
        self.noremap = orig.noremap.clone();
        if self.nnodes() > 0 {
            self.scheduling = orig.scheduling.clone();
        }
    }

    fn copy_filtered<F>(&self, f: F) -> Rlist
    where
        F: Fn(&Rnode) -> Option<Rnode>,
    {
        let mut rl = Rlist::new();
        for n in self.nodes.values() {
            if let Some(copy) = f(n) {
                rl.nodes.insert(copy.rank, copy);
            }
        }
        rl.copy_meta_from(self);
        rl
    }

    /// Copy with all resources available. Resource-less nodes are dropped.
    pub fn copy_empty(&self) -> Rlist {
        self.copy_filtered(|n| {
            let c = n.copy_empty();
            (!c.is_empty()).then_some(c)
        })
    }

    /// Copy including only down nodes (fully available in the copy).
    pub fn copy_down(&self) -> Rlist {
        self.copy_filtered(|n| {
            if n.up {
                return None;
            }
            let c = n.copy_empty();
            (!c.is_empty()).then_some(c)
        })
    }

    /// Copy including only allocated resources.
    pub fn copy_allocated(&self) -> Rlist {
        self.copy_filtered(|n| {
            let c = n.copy_alloc();
            (!c.is_empty()).then_some(c)
        })
    }

    /// Copy retaining only `core` children.
    pub fn copy_cores(&self) -> Rlist {
        self.copy_filtered(|n| Some(n.copy_cores()))
    }

    /// Copy including only the ranks in `ranks`.
    pub fn copy_ranks(&self, ranks: &IdSet) -> Rlist {
        let mut rl = Rlist::new();
        for rank in ranks.iter() {
            if let Some(n) = self.nodes.get(&rank) {
                rl.nodes.insert(rank, n.clone());
            }
        }
        rl.copy_meta_from(self);
        rl
    }

    /// Copy including only nodes matching a compiled constraint.
    pub fn copy_constraint(&self, constraint: &Constraint) -> Rlist {
        self.copy_filtered(|n| constraint.matches(n).then(|| n.clone()))
    }

    /// Delete ranks; returns how many nodes were removed.
    pub fn remove_ranks(&mut self, ranks: &IdSet) -> usize {
        let mut count = 0;
        for rank in ranks.iter() {
            if self.nodes.remove(&rank).is_some() {
                count += 1;
            }
        }
        count
    }

    /// Renumber ranks densely from zero in ascending order, then remap each
    /// node's pools (classes in the noremap set keep their ids).
    pub fn remap(&mut self) {
        let noremap = self.noremap.clone();
        let old = std::mem::take(&mut self.nodes);
        for (new_rank, (_, mut n)) in old.into_iter().enumerate() {
            n.rank = new_rank as u32;
            n.remap(&noremap);
            self.nodes.insert(n.rank, n);
        }
    }

    /// Re-assign hostnames by rank order from a hostlist expression.
    pub fn assign_hosts(&mut self, hosts: &str) -> Result<(), RsetError> {
        let hl = Hostlist::decode(hosts).map_err(|e| RsetError::InvalidArgument(e.to_string()))?;
        if hl.count() != self.nnodes() {
            return Err(RsetError::InvalidArgument(format!(
                "hostlist has {} hosts for {} ranks",
                hl.count(),
                self.nnodes()
            )));
        }
        for (n, host) in self.nodes.values_mut().zip(hl.iter()) {
            n.hostname = Some(host);
        }
        Ok(())
    }

    /// Re-assign ranks by the position of each node's hostname in `hosts`.
    ///
    /// The whole operation either succeeds or leaves the list untouched.
    pub fn rerank(&mut self, hosts: &str) -> Result<(), RsetError> {
        let hl = Hostlist::decode(hosts).map_err(|e| RsetError::InvalidArgument(e.to_string()))?;
        if hl.count() > self.nnodes() {
            return Err(RsetError::TooManyHosts {
                hosts: hl.count(),
                nodes: self.nnodes(),
            });
        }
        if hl.count() < self.nnodes() {
            return Err(RsetError::TooFewHosts {
                hosts: hl.count(),
                nodes: self.nnodes(),
            });
        }
        // build the full mapping before touching any node
        let mut remaining: Vec<u32> = self.nodes.keys().copied().collect();
        let mut mapping: Vec<(u32, u32)> = Vec::with_capacity(remaining.len());
        for (new_rank, host) in hl.iter().enumerate() {
            let pos = remaining
                .iter()
                .position(|rank| self.nodes[rank].hostname.as_deref() == Some(host.as_str()))
                .ok_or_else(|| RsetError::HostNotFound(host.clone()))?;
            mapping.push((remaining.swap_remove(pos), new_rank as u32));
        }
        let mut old = std::mem::take(&mut self.nodes);
        for (old_rank, new_rank) in mapping {
            let mut n = old.remove(&old_rank).expect("mapping built from keys");
            n.rank = new_rank;
            self.nodes.insert(new_rank, n);
        }
        Ok(())
    }

    fn mark_state(&mut self, ids: &str, up: bool) -> Result<(), RsetError> {
        if ids == "all" {
            for n in self.nodes.values_mut() {
                n.up = up;
            }
            return Ok(());
        }
        let set = IdSet::decode(ids).map_err(|e| RsetError::InvalidArgument(e.to_string()))?;
        for rank in set.iter() {
            if let Some(n) = self.nodes.get_mut(&rank) {
                n.up = up;
            }
        }
        Ok(())
    }

    /// Mark ranks up (`"all"` for every node).
    pub fn mark_up(&mut self, ids: &str) -> Result<(), RsetError> {
        self.mark_state(ids, true)
    }

    /// Mark ranks down (`"all"` for every node).
    pub fn mark_down(&mut self, ids: &str) -> Result<(), RsetError> {
        self.mark_state(ids, false)
    }

    /// Append available resources of `other` (overlapping ranks merge).
    pub fn append(&mut self, other: &Rlist) -> Result<(), RsetError> {
        for n in other.nodes.values() {
            let copy = n.copy_avail();
            if copy.is_empty() {
                continue;
            }
            self.add_rnode(copy)?;
        }
        if self.scheduling.is_none() {
            self.scheduling = other.scheduling.clone();
        }
        Ok(())
    }

    /// Like append, but resources already present are tolerated.
    pub fn add(&mut self, other: &Rlist) -> Result<(), RsetError> {
        let diff = Rlist::diff(other, self);
        self.append(&diff)
    }

    /// Set difference `a − b`.
    pub fn diff(a: &Rlist, b: &Rlist) -> Rlist {
        let mut rl = Rlist::new();
        for n in a.nodes.values() {
            let copy = n.copy_avail();
            if !copy.is_empty() {
                rl.nodes.insert(copy.rank, copy);
            }
        }
        rl.copy_meta_from(a);
        for n in b.nodes.values() {
            if let Some(na) = rl.nodes.remove(&n.rank) {
                let d = Rnode::diff(&na, n);
                if !d.is_empty() {
                    rl.nodes.insert(d.rank, d);
                }
            }
        }
        rl
    }

    /// Set union: `diff(a, b)` appended with `b`.
    pub fn union(a: &Rlist, b: &Rlist) -> Result<Rlist, RsetError> {
        let mut result = Rlist::diff(a, b);
        result.append(b)?;
        Ok(result)
    }

    /// Set intersection.
    pub fn intersect(a: &Rlist, b: &Rlist) -> Result<Rlist, RsetError> {
        let mut result = Rlist::new();
        for n in b.nodes.values() {
            let Some(na) = a.nodes.get(&n.rank) else {
                continue;
            };
            let nx = Rnode::intersect(na, n)?;
            if !nx.is_empty() {
                result.add_rnode(nx)?;
            }
        }
        if result.nnodes() > 0 {
            result.scheduling = a.scheduling.clone();
        }
        result.noremap = a.noremap.clone();
        Ok(result)
    }

    /// Idset of all ranks.
    pub fn ranks(&self) -> IdSet {
        let mut ids = IdSet::new();
        for rank in self.nodes.keys() {
            let _ = ids.set(*rank);
        }
        ids
    }

    /// Hostlist of node hostnames in rank order; `None` when any node has
    /// no hostname assigned.
    pub fn nodelist(&self) -> Option<Hostlist> {
        let mut hl = Hostlist::new();
        for n in self.nodes.values() {
            hl.append_host(n.hostname.as_deref()?).ok()?;
        }
        Some(hl)
    }

    /// Idset of all ranks whose host matches any host in `hosts`.
    ///
    /// Every distinct host must resolve to at least one rank.
    pub fn hosts_to_ranks(&self, hosts: &str) -> Result<IdSet, RsetError> {
        let hl = Hostlist::decode(hosts).map_err(|e| RsetError::InvalidArgument(e.to_string()))?;
        let mut ids = IdSet::new();
        let mut missing = Hostlist::new();
        for host in hl.iter() {
            let mut count = 0;
            for n in self.nodes.values() {
                if n.hostname.as_deref() == Some(host.as_str()) {
                    let _ = ids.set(n.rank);
                    count += 1;
                }
            }
            if count == 0 {
                let _ = missing.append_host(&host);
            }
        }
        if !missing.is_empty() {
            return Err(RsetError::InvalidArgument(format!(
                "invalid hosts: {}",
                missing.encode()
            )));
        }
        Ok(ids)
    }

    /// Assign one property to a set of target ranks.
    pub fn add_property(&mut self, name: &str, targets: &str) -> Result<(), RsetError> {
        if let Some(c) = name.chars().find(|c| RESERVED_PROPERTY_CHARS.contains(c)) {
            return Err(RsetError::InvalidArgument(format!(
                "invalid character '{c}' in property \"{name}\""
            )));
        }
        let ids = IdSet::decode(targets)
            .map_err(|_| RsetError::InvalidArgument(format!("invalid idset string '{targets}'")))?;
        // validate all ranks before applying anything
        let mut unknown = IdSet::new();
        for rank in ids.iter() {
            if !self.nodes.contains_key(&rank) {
                let _ = unknown.set(rank);
            }
        }
        if !unknown.is_empty() {
            return Err(RsetError::InvalidArgument(format!(
                "rank{} {} not found in target resource list",
                if unknown.count() == 1 { "" } else { "s" },
                unknown.encode(IdsetFlags::RANGE)
            )));
        }
        for rank in ids.iter() {
            if let Some(n) = self.nodes.get_mut(&rank) {
                n.set_property(name);
            }
        }
        Ok(())
    }

    /// Assign properties from a JSON object of `name -> rank idset`.
    pub fn assign_properties(&mut self, properties: &Value) -> Result<(), RsetError> {
        let obj = properties
            .as_object()
            .ok_or_else(|| RsetError::InvalidArgument("properties must be an object".into()))?;
        // validate everything first so failure does not partially apply
        for (name, val) in obj {
            let s = val.as_str().ok_or_else(|| {
                RsetError::InvalidArgument(format!("properties value '{val}' not a string"))
            })?;
            if let Some(c) = name.chars().find(|c| RESERVED_PROPERTY_CHARS.contains(c)) {
                return Err(RsetError::InvalidArgument(format!(
                    "invalid character '{c}' in property \"{name}\""
                )));
            }
            IdSet::decode(s).map_err(|_| {
                RsetError::InvalidArgument(format!(
                    "invalid idset '{s}' specified for property \"{name}\""
                ))
            })?;
        }
        for (name, val) in obj {
            self.add_property(name, val.as_str().expect("validated above"))?;
        }
        Ok(())
    }

    /// Property name → idset of ranks carrying it.
    pub fn properties(&self) -> BTreeMap<String, IdSet> {
        let mut map: BTreeMap<String, IdSet> = BTreeMap::new();
        for n in self.nodes.values() {
            for p in n.properties() {
                let _ = map.entry(p.to_string()).or_default().set(n.rank);
            }
        }
        map
    }

    /// Encode properties as an RFC 20-style JSON object string.
    pub fn properties_encode(&self) -> String {
        let props = self.properties();
        let mut obj = serde_json::Map::new();
        for (name, ids) in props {
            obj.insert(name, Value::String(ids.encode(IdsetFlags::RANGE)));
        }
        Value::Object(obj).to_string()
    }

    /// Group nodes sharing identical pool state and up flag, in rank order.
    fn grouped(&self) -> Vec<(IdSet, &Rnode)> {
        let mut groups: Vec<(IdSet, &Rnode)> = Vec::new();
        for n in self.nodes.values() {
            match groups
                .iter_mut()
                .find(|(_, repr)| Rnode::same_shape(repr, n))
            {
                Some((ids, _)) => {
                    let _ = ids.set(n.rank);
                }
                None => {
                    let mut ids = IdSet::new();
                    let _ = ids.set(n.rank);
                    groups.push((ids, n));
                }
            }
        }
        groups
    }

    /// Serialize into the R version 1 JSON object.
    ///
    /// Only nodes with available resources contribute R_lite entries.
    pub fn to_rv1(&self) -> Value {
        let r_lite = self
            .grouped()
            .into_iter()
            .filter(|(_, n)| n.avail_total() > 0)
            .map(|(ids, n)| n.encode(&ids))
            .collect::<Vec<_>>();

        let mut execution = serde_json::Map::new();
        execution.insert("R_lite".into(), Value::Array(r_lite));
        if let Some(hl) = self.nodelist() {
            execution.insert("nodelist".into(), Value::Array(vec![hl.encode().into()]));
        }
        let props = self.properties();
        if !props.is_empty() {
            let mut obj = serde_json::Map::new();
            for (name, ids) in props {
                obj.insert(name, Value::String(ids.encode(IdsetFlags::RANGE)));
            }
            execution.insert("properties".into(), Value::Object(obj));
        }
        if let Some(t) = self.starttime {
            execution.insert("starttime".into(), serde_json::json!(t));
        }
        if let Some(t) = self.expiration {
            execution.insert("expiration".into(), serde_json::json!(t));
        }
        if let Some(n) = self.nslots {
            execution.insert("nslots".into(), serde_json::json!(n));
        }

        let mut top = serde_json::Map::new();
        top.insert("version".into(), serde_json::json!(1));
        top.insert("execution".into(), Value::Object(execution));
        if let Some(s) = &self.scheduling {
            top.insert("scheduling".into(), s.clone());
        }
        Value::Object(top)
    }

    /// Serialize to a compact R string.
    pub fn encode(&self) -> String {
        self.to_rv1().to_string()
    }

    /// De-serialize from a parsed R JSON value.
    pub fn from_json(o: &Value) -> Result<Rlist, RsetError> {
        let r: Rv1 = serde_json::from_value(o.clone())
            .map_err(|e| RsetError::InvalidArgument(e.to_string()))?;
        if r.version != 1 {
            return Err(RsetError::InvalidArgument(format!(
                "invalid version={}",
                r.version
            )));
        }
        let mut rl = Rlist::new();
        for entry in &r.execution.r_lite {
            rl.append_rlite(entry)?;
        }
        if let Some(nodelist) = &r.execution.nodelist {
            let mut hl = Hostlist::new();
            for s in nodelist {
                hl.append(s)
                    .map_err(|e| RsetError::InvalidArgument(e.to_string()))?;
            }
            if hl.count() != rl.nnodes() {
                return Err(RsetError::InvalidArgument(format!(
                    "nodelist has {} hosts for {} ranks",
                    hl.count(),
                    rl.nnodes()
                )));
            }
            for (n, host) in rl.nodes.values_mut().zip(hl.iter()) {
                n.hostname = Some(host);
            }
        }
        if let Some(props) = &r.execution.properties {
            for (name, targets) in props {
                rl.add_property(name, targets)?;
            }
        }
        rl.nslots = r.execution.nslots.filter(|&n| n > 0);
        rl.starttime = r.execution.starttime.filter(|&t| t > 0.0);
        rl.expiration = r.execution.expiration.filter(|&t| t > 0.0);
        rl.scheduling = r.scheduling;
        Ok(rl)
    }

    fn append_rlite(&mut self, entry: &RliteEntry) -> Result<(), RsetError> {
        let ranks = IdSet::decode(&entry.rank)
            .map_err(|e| RsetError::InvalidArgument(e.to_string()))?;
        for rank in ranks.iter() {
            let mut n = Rnode::new(None, rank);
            for (name, ids) in &entry.children {
                n.add_child(name, ids)?;
            }
            self.add_rnode(n)?;
        }
        Ok(())
    }

    /// De-serialize from an R string.
    pub fn from_r(s: &str) -> Result<Rlist, RsetError> {
        let o: Value =
            serde_json::from_str(s).map_err(|e| RsetError::InvalidArgument(e.to_string()))?;
        Rlist::from_json(&o)
    }

    /// Build from a resource config array of
    /// `{ "hosts": <hostlist>, "cores": <idset>, "gpus": <idset>?,
    ///    "properties": [<string>...]? }`.
    ///
    /// Host → rank assignment is positional over the union of all `hosts`
    /// fields; a host mentioned in more than one entry accumulates
    /// resources.
    pub fn from_config(conf: &Value) -> Result<Rlist, RsetError> {
        let entries = conf
            .as_array()
            .ok_or_else(|| RsetError::InvalidArgument("config must be an array".into()))?;
        let mut rl = Rlist::new();
        let mut hostmap = Hostlist::new();
        for (index, entry) in entries.iter().enumerate() {
            rl.config_add_entry(&mut hostmap, index, entry)?;
        }
        rl.config_check()?;
        Ok(rl)
    }

    fn config_add_entry(
        &mut self,
        hostmap: &mut Hostlist,
        index: usize,
        entry: &Value,
    ) -> Result<(), RsetError> {
        let hosts = entry
            .get("hosts")
            .and_then(Value::as_str)
            .ok_or_else(|| RsetError::InvalidArgument(format!("config[{index}]: missing hosts")))?;
        let hl = Hostlist::decode(hosts).map_err(|_| {
            RsetError::InvalidArgument(format!("config[{index}]: invalid hostlist '{hosts}'"))
        })?;
        if hl.is_empty() {
            return Err(RsetError::InvalidArgument(format!(
                "config[{index}]: empty hostlist specified"
            )));
        }
        let cores = match entry.get("cores").and_then(Value::as_str) {
            Some(s) => Some(IdSet::decode(s).map_err(|_| {
                RsetError::InvalidArgument(format!("config[{index}]: invalid idset cores='{s}'"))
            })?),
            None => None,
        };
        let gpus = match entry.get("gpus").and_then(Value::as_str) {
            Some(s) => Some(IdSet::decode(s).map_err(|_| {
                RsetError::InvalidArgument(format!("config[{index}]: invalid idset gpus='{s}'"))
            })?),
            None => None,
        };
        let properties = match entry.get("properties") {
            Some(Value::Array(arr)) => {
                let mut props = Vec::new();
                for p in arr {
                    let s = p.as_str().ok_or_else(|| {
                        RsetError::InvalidArgument(format!(
                            "config[{index}]: invalid property \"{p}\""
                        ))
                    })?;
                    if s.chars().any(|c| RESERVED_PROPERTY_CHARS.contains(&c)) {
                        return Err(RsetError::InvalidArgument(format!(
                            "config[{index}]: invalid property \"{s}\""
                        )));
                    }
                    props.push(s.to_string());
                }
                props
            }
            Some(_) => {
                return Err(RsetError::InvalidArgument(format!(
                    "config[{index}]: properties must be an array"
                )));
            }
            None => Vec::new(),
        };
        for host in hl.iter() {
            let rank = match hostmap.find(&host) {
                Some(rank) => rank as u32,
                None => {
                    hostmap
                        .append_host(&host)
                        .map_err(|e| RsetError::InvalidArgument(e.to_string()))?;
                    (hostmap.count() - 1) as u32
                }
            };
            let mut n = Rnode::new(Some(&host), rank);
            if let Some(ids) = &cores {
                n.add_child_idset(CORE, ids, ids)?;
            }
            if let Some(ids) = &gpus {
                n.add_child_idset("gpu", ids, ids)?;
            }
            for p in &properties {
                n.set_property(p);
            }
            self.add_rnode(n)?;
        }
        Ok(())
    }

    fn config_check(&self) -> Result<(), RsetError> {
        if self.nnodes() == 0 {
            return Err(RsetError::InvalidArgument("no hosts configured".into()));
        }
        let mut empty = Hostlist::new();
        for n in self.nodes.values() {
            if n.avail_total() == 0 {
                let _ = empty.append_host(n.hostname.as_deref().unwrap_or("unknown"));
            }
        }
        if !empty.is_empty() {
            return Err(RsetError::InvalidArgument(format!(
                "resource.config: {} assigned no resources",
                empty.encode()
            )));
        }
        Ok(())
    }

    /// Single-line human summary, grouping ranks with identical pools.
    pub fn dumps(&self) -> String {
        let mut out = String::new();
        for (ids, n) in self.grouped() {
            if n.avail_total() == 0 {
                continue;
            }
            if !out.is_empty() {
                out.push(' ');
            }
            out.push_str("rank");
            out.push_str(&ids.encode(IdsetFlags::RANGE | IdsetFlags::BRACKETS));
            out.push('/');
            out.push_str(&n.dumps_children());
        }
        out
    }

    fn alloc_rnode(&mut self, n: &Rnode) -> Result<(), RsetError> {
        let node = self
            .find_rank_mut(n.rank)
            .ok_or(RsetError::UnknownRank(n.rank))?;
        node.alloc_idset(&n.cores().avail)
    }

    fn free_rnode(&mut self, n: &Rnode) -> Result<(), RsetError> {
        let node = self
            .find_rank_mut(n.rank)
            .ok_or(RsetError::UnknownRank(n.rank))?;
        node.free_idset(&n.cores().ids)
    }

    /// Mark the resources of `alloc` as allocated here.
    ///
    /// On failure every node already marked is freed again.
    pub fn set_allocated(&mut self, alloc: &Rlist) -> Result<(), RsetError> {
        let mut done: Vec<&Rnode> = Vec::new();
        for n in alloc.nodes.values() {
            if let Err(e) = self.alloc_rnode(n) {
                for d in done {
                    let _ = self.free_rnode(d);
                }
                return Err(e);
            }
            done.push(n);
        }
        Ok(())
    }

    fn free_ex(&mut self, alloc: &Rlist, ignore_missing: bool) -> Result<(), RsetError> {
        let mut freed: Vec<&Rnode> = Vec::new();
        for n in alloc.nodes.values() {
            match self.free_rnode(n) {
                Ok(()) => freed.push(n),
                Err(RsetError::UnknownRank(_)) if ignore_missing => {}
                Err(e) => {
                    // roll forward: re-allocate everything already freed
                    for f in freed {
                        let _ = self.alloc_rnode(f);
                    }
                    return Err(e);
                }
            }
        }
        Ok(())
    }

    /// Free a previously-allocated resource set.
    pub fn free(&mut self, alloc: &Rlist) -> Result<(), RsetError> {
        self.free_ex(alloc, false)
    }

    /// Like [`Rlist::free`] but ranks no longer in the list (shrunk away)
    /// are ignored.
    pub fn free_tolerant(&mut self, alloc: &Rlist) -> Result<(), RsetError> {
        self.free_ex(alloc, true)
    }

    /// Verify resources in `actual` against the matching rank of
    /// `expected`. Supported on single-rank `actual` sets only.
    pub fn verify(
        expected: &Rlist,
        actual: &Rlist,
        config: &VerifyConfig,
    ) -> Result<VerifyOutcome, RsetError> {
        if actual.nnodes() != 1 {
            return Err(RsetError::InvalidArgument(
                "verification supported on single rank only".into(),
            ));
        }
        let n = actual.nodes.values().next().expect("one node");
        let exp = expected
            .find_rank(n.rank)
            .ok_or_else(|| RsetError::VerifyFailed(format!(
                "rank {} not found in expected ranks",
                n.rank
            )))?;
        if config.hostname == VerifyMode::Strict
            && Rnode::hostname_cmp(n, exp) != std::cmp::Ordering::Equal
        {
            return Err(RsetError::VerifyFailed(format!(
                "rank {} got hostname '{}', expected '{}'",
                n.rank,
                n.hostname.as_deref().unwrap_or("unknown"),
                exp.hostname.as_deref().unwrap_or("unknown")
            )));
        }
        let missing_mask = Ignore {
            core: matches!(config.core, VerifyMode::Ignore | VerifyMode::AllowMissing),
            gpu: matches!(config.gpu, VerifyMode::Ignore | VerifyMode::AllowMissing),
        };
        let diff = Rnode::diff_ex(exp, n, missing_mask);
        if !diff.is_empty() {
            return Err(RsetError::VerifyFailed(format!(
                "rank {} ({}) missing resources: {}",
                n.rank,
                n.hostname.as_deref().unwrap_or("unknown"),
                diff.copy_empty().dumps_children()
            )));
        }
        let extra_mask = Ignore {
            core: matches!(config.core, VerifyMode::Ignore | VerifyMode::AllowExtra),
            gpu: matches!(config.gpu, VerifyMode::Ignore | VerifyMode::AllowExtra),
        };
        let diff = Rnode::diff_ex(n, exp, extra_mask);
        if diff.is_empty() {
            Ok(VerifyOutcome::Exact)
        } else {
            Ok(VerifyOutcome::Extra(format!(
                "rank {} ({}) has extra resources: {}",
                n.rank,
                n.hostname.as_deref().unwrap_or("unknown"),
                diff.copy_empty().dumps_children()
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn four_by_four() -> Rlist {
        let mut rl = Rlist::new();
        for rank in 0..4 {
            rl.append_rank_cores(Some(&format!("n{rank}")), rank, "0-3")
                .unwrap();
        }
        rl
    }

    #[test]
    fn test_totals() {
        let rl = four_by_four();
        assert_eq!(rl.total(), 16);
        assert_eq!(rl.avail(), 16);
        assert_eq!(rl.nnodes(), 4);
        assert_eq!(rl.count(CORE), 16);
    }

    #[test]
    fn test_mark_down_up() {
        let mut rl = four_by_four();
        rl.mark_down("1,3").unwrap();
        assert_eq!(rl.avail(), 8);
        rl.mark_up("all").unwrap();
        assert_eq!(rl.avail(), 16);
        rl.mark_down("all").unwrap();
        assert_eq!(rl.avail(), 0);
        assert_eq!(rl.total(), 16);
    }

    #[test]
    fn test_ranks_nodelist() {
        let rl = four_by_four();
        assert_eq!(rl.ranks().encode(IdsetFlags::RANGE), "0-3");
        assert_eq!(rl.nodelist().unwrap().encode(), "n[0-3]");
    }

    #[test]
    fn test_append_merges_ranks() {
        let mut rl = four_by_four();
        let mut other = Rlist::new();
        other.append_rank_cores(Some("n0"), 0, "4-7").unwrap();
        rl.append(&other).unwrap();
        assert_eq!(rl.nnodes(), 4);
        assert_eq!(rl.total(), 20);
    }

    #[test]
    fn test_diff_union_intersect_laws() {
        let a = four_by_four();
        assert_eq!(Rlist::diff(&a, &a).nnodes(), 0);
        let u = Rlist::union(&a, &a).unwrap();
        assert_eq!(u.total(), a.total());
        assert_eq!(u.nnodes(), a.nnodes());
        let i = Rlist::intersect(&a, &a).unwrap();
        assert_eq!(i.total(), a.total());
    }

    #[test]
    fn test_remove_ranks() {
        let mut rl = four_by_four();
        let removed = rl.remove_ranks(&IdSet::decode("1,2,9").unwrap());
        assert_eq!(removed, 2);
        assert_eq!(rl.ranks().encode(IdsetFlags::RANGE), "0,3");
    }

    #[test]
    fn test_remap_dense() {
        let mut rl = Rlist::new();
        rl.append_rank_cores(Some("a"), 3, "2,4").unwrap();
        rl.append_rank_cores(Some("b"), 7, "0-1").unwrap();
        rl.remap();
        assert_eq!(rl.ranks().encode(IdsetFlags::RANGE), "0-1");
        assert_eq!(
            rl.find_rank(0).unwrap().cores().ids,
            IdSet::decode("0-1").unwrap()
        );
    }

    #[test]
    fn test_remap_noremap_gpu() {
        let mut rl = Rlist::new();
        rl.append_rank_cores(Some("a"), 0, "0-3").unwrap();
        rl.rank_add_child(0, "gpu", "2-3").unwrap();
        rl.remap();
        assert_eq!(
            rl.find_rank(0).unwrap().child("gpu").unwrap().ids,
            IdSet::decode("2-3").unwrap()
        );
    }

    #[test]
    fn test_rerank() {
        let mut rl = Rlist::new();
        for (rank, host) in ["a", "b", "c"].iter().enumerate() {
            rl.append_rank_cores(Some(host), rank as u32, "0-1").unwrap();
        }
        // too few hosts
        assert_eq!(
            rl.rerank("a,b"),
            Err(RsetError::TooFewHosts { hosts: 2, nodes: 3 })
        );
        // too many hosts
        assert_eq!(
            rl.rerank("a,b,c,d"),
            Err(RsetError::TooManyHosts { hosts: 4, nodes: 3 })
        );
        // unknown host, with rollback
        assert_eq!(rl.rerank("a,x,c"), Err(RsetError::HostNotFound("x".into())));
        assert_eq!(rl.find_rank(0).unwrap().hostname.as_deref(), Some("a"));
        // success swaps ranks
        rl.rerank("c,a,b").unwrap();
        assert_eq!(rl.find_rank(0).unwrap().hostname.as_deref(), Some("c"));
        assert_eq!(rl.find_rank(1).unwrap().hostname.as_deref(), Some("a"));
        assert_eq!(rl.find_rank(2).unwrap().hostname.as_deref(), Some("b"));
    }

    #[test]
    fn test_seed_encode_decode() {
        let r = r#"{"version":1,"execution":{"R_lite":[{"rank":"0-3","children":{"core":"0-3"}}],"nodelist":["n[0-3]"]}}"#;
        let rl = Rlist::from_r(r).unwrap();
        assert_eq!(rl.nnodes(), 4);
        assert_eq!(rl.count(CORE), 16);
        assert_eq!(rl.ranks().encode(IdsetFlags::RANGE), "0-3");
        assert_eq!(rl.nodelist().unwrap().encode(), "n[0-3]");
    }

    #[test]
    fn test_rv1_round_trip() {
        let mut rl = four_by_four();
        rl.rank_add_child(1, "gpu", "0-1").unwrap();
        rl.add_property("fast", "0,2").unwrap();
        rl.scheduling = Some(serde_json::json!({"opaque": [1, 2, 3]}));
        let r = rl.encode();
        let back = Rlist::from_r(&r).unwrap();
        assert_eq!(back.nnodes(), rl.nnodes());
        assert_eq!(back.total(), rl.total());
        assert_eq!(back.count("gpu"), 2);
        assert_eq!(back.properties(), rl.properties());
        assert_eq!(back.scheduling, rl.scheduling);
        // byte-identical second generation
        assert_eq!(back.encode(), r);
    }

    #[test]
    fn test_from_json_bad_version() {
        let r = r#"{"version":2,"execution":{"R_lite":[]}}"#;
        assert!(Rlist::from_r(r).is_err());
    }

    #[test]
    fn test_dumps() {
        let mut rl = four_by_four();
        rl.rank_add_child(3, "gpu", "0").unwrap();
        assert_eq!(rl.dumps(), "rank[0-2]/core[0-3] rank3/core[0-3],gpu0");
    }

    #[test]
    fn test_copy_allocated_and_free() {
        let mut rl = four_by_four();
        let before = rl.encode();
        let mut sub = Rlist::new();
        sub.append_rank_cores(Some("n1"), 1, "0-1").unwrap();
        rl.set_allocated(&sub).unwrap();
        assert_eq!(rl.avail(), 14);
        let allocd = rl.copy_allocated();
        assert_eq!(allocd.nnodes(), 1);
        assert_eq!(allocd.total(), 2);
        rl.free(&sub).unwrap();
        assert_eq!(rl.avail(), 16);
        assert_eq!(rl.encode(), before);
    }

    #[test]
    fn test_set_allocated_unwinds() {
        let mut rl = four_by_four();
        let mut sub = Rlist::new();
        sub.append_rank_cores(Some("n1"), 1, "0-1").unwrap();
        sub.append_rank_cores(Some("nope"), 9, "0-1").unwrap();
        assert!(rl.set_allocated(&sub).is_err());
        assert_eq!(rl.avail(), 16);
    }

    #[test]
    fn test_free_tolerant_ignores_missing_rank() {
        let mut rl = four_by_four();
        let mut sub = Rlist::new();
        sub.append_rank_cores(Some("n1"), 1, "0-1").unwrap();
        rl.set_allocated(&sub).unwrap();
        rl.remove_ranks(&IdSet::decode("1").unwrap());
        // rank 1 shrunk away; tolerant free ignores it
        rl.free_tolerant(&sub).unwrap();
        assert!(rl.free(&sub).is_err());
    }

    #[test]
    fn test_hosts_to_ranks() {
        let rl = four_by_four();
        let ids = rl.hosts_to_ranks("n1,n3").unwrap();
        assert_eq!(ids.encode(IdsetFlags::RANGE), "1,3");
        assert!(rl.hosts_to_ranks("n1,zzz").is_err());
    }

    #[test]
    fn test_copy_constraint() {
        let mut rl = four_by_four();
        rl.add_property("gpu", "0,2").unwrap();
        let c = Constraint::parse(&serde_json::json!({"properties": ["gpu"]})).unwrap();
        let copy = rl.copy_constraint(&c);
        assert_eq!(copy.ranks().encode(IdsetFlags::RANGE), "0,2");
        let c = Constraint::parse(&serde_json::json!({"properties": ["^gpu"]})).unwrap();
        let copy = rl.copy_constraint(&c);
        assert_eq!(copy.ranks().encode(IdsetFlags::RANGE), "1,3");
    }

    #[test]
    fn test_from_config() {
        let conf = serde_json::json!([
            { "hosts": "a[0-1]", "cores": "0-3", "properties": ["login"] },
            { "hosts": "a1", "gpus": "0" },
        ]);
        let rl = Rlist::from_config(&conf).unwrap();
        assert_eq!(rl.nnodes(), 2);
        assert_eq!(rl.count(CORE), 8);
        assert_eq!(rl.count("gpu"), 1);
        assert_eq!(rl.find_rank(1).unwrap().count_type("gpu"), 1);
        assert!(rl.find_rank(0).unwrap().has_property("login"));
    }

    #[test]
    fn test_from_config_no_resources() {
        let conf = serde_json::json!([{ "hosts": "a0" }]);
        assert!(Rlist::from_config(&conf).is_err());
        let conf = serde_json::json!([]);
        assert!(Rlist::from_config(&conf).is_err());
    }

    #[test]
    fn test_verify() {
        let rl = four_by_four();
        let mut actual = Rlist::new();
        actual.append_rank_cores(Some("n2"), 2, "0-3").unwrap();
        assert_eq!(
            Rlist::verify(&rl, &actual, &VerifyConfig::default()).unwrap(),
            VerifyOutcome::Exact
        );

        let mut fewer = Rlist::new();
        fewer.append_rank_cores(Some("n2"), 2, "0-1").unwrap();
        assert!(matches!(
            Rlist::verify(&rl, &fewer, &VerifyConfig::default()),
            Err(RsetError::VerifyFailed(_))
        ));

        let mut more = Rlist::new();
        more.append_rank_cores(Some("n2"), 2, "0-7").unwrap();
        assert!(matches!(
            Rlist::verify(&rl, &more, &VerifyConfig::default()).unwrap(),
            VerifyOutcome::Extra(_)
        ));

        // hostname mismatch is ignored when not strict
        let mut otherhost = Rlist::new();
        otherhost.append_rank_cores(Some("x2"), 2, "0-3").unwrap();
        assert!(Rlist::verify(&rl, &otherhost, &VerifyConfig::default()).is_err());
        let lax = VerifyConfig {
            hostname: VerifyMode::Ignore,
            ..Default::default()
        };
        assert_eq!(
            Rlist::verify(&rl, &otherhost, &lax).unwrap(),
            VerifyOutcome::Exact
        );
    }

    #[test]
    fn test_verify_allow_missing_gpu() {
        let mut expected = Rlist::new();
        expected.append_rank_cores(Some("n0"), 0, "0-3").unwrap();
        expected.rank_add_child(0, "gpu", "0-1").unwrap();
        let mut actual = Rlist::new();
        actual.append_rank_cores(Some("n0"), 0, "0-3").unwrap();
        assert!(Rlist::verify(&expected, &actual, &VerifyConfig::default()).is_err());
        let cfg = VerifyConfig {
            gpu: VerifyMode::AllowMissing,
            ..Default::default()
        };
        assert_eq!(
            Rlist::verify(&expected, &actual, &cfg).unwrap(),
            VerifyOutcome::Exact
        );
    }
}
