//! Resource node: one execution target with named child resource pools.
//!
//! A node always carries a `core` pool (possibly empty). Every pool keeps the
//! invariant `avail ⊆ ids`. Copies are deep; two rnodes never share pool
//! storage.

use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};

use rgrid_core::{IdSet, IdsetFlags};
use serde_json::{Value, json};

use crate::error::RsetError;

/// The resource class every node carries.
pub const CORE: &str = "core";

/// One child resource pool: total ids and the currently-available subset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RnodeChild {
    pub ids: IdSet,
    pub avail: IdSet,
}

impl RnodeChild {
    fn empty() -> RnodeChild {
        RnodeChild {
            ids: IdSet::new(),
            avail: IdSet::new(),
        }
    }

    /// Re-number `ids` to `[0, count-1]`, translating `avail` membership
    /// by position.
    fn remap(&mut self) {
        let count = self.ids.count();
        if count == 0 || (self.ids.first() == Some(0) && self.ids.last() == Some(count as u32 - 1))
        {
            return;
        }
        let mut avail = IdSet::new();
        for (n, id) in self.ids.iter().enumerate() {
            if self.avail.test(id) {
                let _ = avail.set(n as u32);
            }
        }
        let mut ids = IdSet::new();
        if count > 0 {
            let _ = ids.range_set(0, count as u32 - 1);
        }
        self.ids = ids;
        self.avail = avail;
    }
}

/// Resource classes skipped when subtracting in [`Rnode::diff_ex`] or when
/// comparing in verify.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Ignore {
    pub core: bool,
    pub gpu: bool,
}

impl Ignore {
    pub const NONE: Ignore = Ignore {
        core: false,
        gpu: false,
    };

    fn matches(&self, name: &str) -> bool {
        (self.core && name == CORE) || (self.gpu && name == "gpu")
    }
}

/// A single execution target.
#[derive(Debug, Clone, PartialEq)]
pub struct Rnode {
    pub rank: u32,
    pub hostname: Option<String>,
    pub up: bool,
    pub(crate) children: BTreeMap<String, RnodeChild>,
    pub(crate) properties: BTreeSet<String>,
}

impl Rnode {
    /// Create a node with an empty `core` pool installed.
    pub fn new(hostname: Option<&str>, rank: u32) -> Rnode {
        let mut children = BTreeMap::new();
        children.insert(CORE.to_string(), RnodeChild::empty());
        Rnode {
            rank,
            hostname: hostname.map(str::to_string),
            up: true,
            children,
            properties: BTreeSet::new(),
        }
    }

    /// Create a node whose `core` pool is the decoded idset string.
    pub fn with_cores(hostname: Option<&str>, rank: u32, ids: &str) -> Result<Rnode, RsetError> {
        let set = IdSet::decode(ids).map_err(|e| RsetError::InvalidArgument(e.to_string()))?;
        Ok(Rnode::with_core_idset(hostname, rank, &set))
    }

    /// Create a node whose `core` pool is `ids` (all available).
    pub fn with_core_idset(hostname: Option<&str>, rank: u32, ids: &IdSet) -> Rnode {
        let mut n = Rnode::new(hostname, rank);
        n.children.insert(
            CORE.to_string(),
            RnodeChild {
                ids: ids.clone(),
                avail: ids.clone(),
            },
        );
        n
    }

    /// Create a node with `count` cores numbered from zero.
    pub fn with_count(hostname: Option<&str>, rank: u32, count: u32) -> Rnode {
        let mut ids = IdSet::new();
        if count > 0 {
            let _ = ids.range_set(0, count - 1);
        }
        Rnode::with_core_idset(hostname, rank, &ids)
    }

    /// Add ids to the named child pool, creating the pool if needed.
    ///
    /// Merging ids that already exist in the pool is an error
    /// ([`RsetError::Overlap`]); pools stay disjoint per id.
    pub fn add_child(&mut self, name: &str, ids: &str) -> Result<(), RsetError> {
        let set = IdSet::decode(ids).map_err(|e| RsetError::InvalidArgument(e.to_string()))?;
        self.add_child_idset(name, &set, &set)
    }

    /// Like [`Rnode::add_child`] with explicit total and available sets.
    pub fn add_child_idset(
        &mut self,
        name: &str,
        ids: &IdSet,
        avail: &IdSet,
    ) -> Result<(), RsetError> {
        match self.children.get_mut(name) {
            None => {
                self.children.insert(
                    name.to_string(),
                    RnodeChild {
                        ids: ids.clone(),
                        avail: avail.clone(),
                    },
                );
                Ok(())
            }
            Some(c) => {
                // merge: incoming ids must be disjoint from the existing pool
                if !c.ids.is_empty() && IdSet::has_intersection(&c.ids, ids) {
                    return Err(RsetError::Overlap(name.to_string()));
                }
                c.ids.add(ids).expect("autogrow");
                c.avail.add(ids).expect("autogrow");
                Ok(())
            }
        }
    }

    /// Merge all children and properties of `other` into this node.
    pub fn add(&mut self, other: &Rnode) -> Result<(), RsetError> {
        for (name, c) in &other.children {
            self.add_child_idset(name, &c.ids, &c.avail)?;
        }
        for p in &other.properties {
            self.set_property(p);
        }
        Ok(())
    }

    /// Copy with every pool fully available.
    pub fn copy_empty(&self) -> Rnode {
        let mut n = self.clone();
        for c in n.children.values_mut() {
            c.avail = c.ids.clone();
        }
        n
    }

    /// Copy retaining only the available ids (`ids := avail`).
    pub fn copy_avail(&self) -> Rnode {
        let mut n = self.clone();
        for c in n.children.values_mut() {
            c.ids = c.avail.clone();
        }
        n
    }

    /// Copy retaining only the allocated ids (`ids := ids − avail`, all
    /// marked available in the copy).
    pub fn copy_alloc(&self) -> Rnode {
        let mut n = self.clone();
        for c in n.children.values_mut() {
            c.ids.subtract(&c.avail);
            c.avail = c.ids.clone();
        }
        n
    }

    /// Copy retaining only the `core` child.
    pub fn copy_cores(&self) -> Rnode {
        let mut n = self.clone();
        n.children.retain(|name, _| name == CORE);
        n
    }

    /// True when every pool is empty.
    pub fn is_empty(&self) -> bool {
        self.children.values().all(|c| c.ids.is_empty())
    }

    /// Set difference: subtract every pool of `b` from `a`.
    ///
    /// Non-core pools that become empty are dropped; `core` is retained even
    /// when empty. Pools named in `ignore` are cleared rather than
    /// subtracted.
    pub fn diff_ex(a: &Rnode, b: &Rnode, ignore: Ignore) -> Rnode {
        let mut n = a.clone();
        for (name, cb) in &b.children {
            if let Some(nc) = n.children.get_mut(name) {
                nc.ids.subtract(&cb.ids);
                nc.avail.subtract(&cb.avail);
            }
        }
        for (name, c) in n.children.iter_mut() {
            if ignore.matches(name) {
                *c = RnodeChild::empty();
            }
        }
        n.children
            .retain(|name, c| name == CORE || !c.ids.is_empty());
        n
    }

    /// Set difference with no ignored classes.
    pub fn diff(a: &Rnode, b: &Rnode) -> Rnode {
        Rnode::diff_ex(a, b, Ignore::NONE)
    }

    /// Child-wise intersection of both ids and avail.
    ///
    /// Requires matching rank and (when both are set) matching hostname.
    pub fn intersect(a: &Rnode, b: &Rnode) -> Result<Rnode, RsetError> {
        if a.rank != b.rank || Rnode::hostname_cmp(a, b) != Ordering::Equal {
            return Err(RsetError::InvalidArgument(format!(
                "cannot intersect rank {} with rank {}",
                a.rank, b.rank
            )));
        }
        let mut result = Rnode::new(a.hostname.as_deref(), a.rank);
        for (name, ca) in &a.children {
            if let Some(cb) = b.children.get(name) {
                let ids = IdSet::intersect(&ca.ids, &cb.ids);
                let avail = IdSet::intersect(&ca.avail, &cb.avail);
                if ids.is_empty() && avail.is_empty() {
                    continue;
                }
                result.add_child_idset(name, &ids, &avail)?;
            }
        }
        Ok(result)
    }

    /// Allocate the `count` lowest-numbered available core ids.
    pub fn alloc(&mut self, count: usize) -> Result<IdSet, RsetError> {
        if !self.up {
            return Err(RsetError::HostDown(self.rank));
        }
        let cores = self.cores_mut();
        if cores.avail.count() < count {
            return Err(RsetError::NoSpace);
        }
        let mut out = IdSet::new();
        let mut next = cores.avail.first();
        for _ in 0..count {
            let id = next.expect("avail count checked above");
            out.set(id).expect("autogrow");
            next = cores.avail.next(id);
            cores.avail.clear(id);
        }
        Ok(out)
    }

    /// Allocate a specific set of core ids.
    ///
    /// Every id must be in `ids` ([`RsetError::UnknownId`] otherwise) and in
    /// `avail` ([`RsetError::AlreadyAllocated`] otherwise).
    pub fn alloc_idset(&mut self, ids: &IdSet) -> Result<(), RsetError> {
        let cores = self.cores();
        for id in ids.iter() {
            if !cores.ids.test(id) {
                return Err(RsetError::UnknownId {
                    child: CORE.to_string(),
                    id,
                });
            }
            if !cores.avail.test(id) {
                return Err(RsetError::AlreadyAllocated(id));
            }
        }
        let cores = self.cores_mut();
        for id in ids.iter() {
            cores.avail.clear(id);
        }
        Ok(())
    }

    /// Return a specific set of core ids to the available pool.
    pub fn free_idset(&mut self, ids: &IdSet) -> Result<(), RsetError> {
        let cores = self.cores();
        for id in ids.iter() {
            if !cores.ids.test(id) {
                return Err(RsetError::UnknownId {
                    child: CORE.to_string(),
                    id,
                });
            }
            if cores.avail.test(id) {
                return Err(RsetError::AlreadyFree(id));
            }
        }
        let cores = self.cores_mut();
        for id in ids.iter() {
            let _ = cores.avail.set(id);
        }
        Ok(())
    }

    /// Available core count; zero when the node is down.
    pub fn avail(&self) -> usize {
        if self.up { self.cores().avail.count() } else { 0 }
    }

    /// Available ids across every pool; zero when the node is down.
    pub fn avail_total(&self) -> usize {
        if !self.up {
            return 0;
        }
        self.children.values().map(|c| c.avail.count()).sum()
    }

    /// Total core count.
    pub fn count(&self) -> usize {
        self.cores().ids.count()
    }

    /// Total id count for one resource class.
    pub fn count_type(&self, name: &str) -> usize {
        self.children.get(name).map_or(0, |c| c.ids.count())
    }

    /// Re-number every pool not named in `noremap` to a dense `[0, n-1]`.
    pub fn remap(&mut self, noremap: &BTreeSet<String>) {
        for (name, c) in self.children.iter_mut() {
            if !noremap.contains(name) {
                c.remap();
            }
        }
    }

    pub fn set_property(&mut self, name: &str) {
        self.properties.insert(name.to_string());
    }

    pub fn remove_property(&mut self, name: &str) {
        self.properties.remove(name);
    }

    pub fn has_property(&self, name: &str) -> bool {
        self.properties.contains(name)
    }

    pub fn properties(&self) -> impl Iterator<Item = &str> {
        self.properties.iter().map(String::as_str)
    }

    /// Order nodes by child-set equality, then by the first differing avail
    /// element (an exhausted set sorts before any real id).
    pub fn cmp_avail(a: &Rnode, b: &Rnode) -> Ordering {
        if a.children.len() != b.children.len() {
            return Ordering::Less;
        }
        for (name, ca) in &a.children {
            let Some(cb) = b.children.get(name) else {
                return Ordering::Less;
            };
            if ca.avail == cb.avail {
                continue;
            }
            let mut x = ca.avail.first();
            let mut y = cb.avail.first();
            loop {
                match (x, y) {
                    (None, None) => break,
                    (None, Some(_)) => return Ordering::Less,
                    (Some(_), None) => return Ordering::Greater,
                    (Some(i), Some(j)) if i != j => return i.cmp(&j),
                    (Some(i), Some(j)) => {
                        x = ca.avail.next(i);
                        y = cb.avail.next(j);
                    }
                }
            }
        }
        Ordering::Equal
    }

    /// Compare hostnames; a missing hostname on either side compares equal.
    pub fn hostname_cmp(a: &Rnode, b: &Rnode) -> Ordering {
        match (&a.hostname, &b.hostname) {
            (Some(x), Some(y)) => x.cmp(y),
            _ => Ordering::Equal,
        }
    }

    /// True when two nodes carry identical pool state and up flag
    /// (the grouping predicate for R_lite compression). Avail equality is
    /// [`Rnode::cmp_avail`]; total ids are compared on top since encode
    /// groups by both.
    pub(crate) fn same_shape(a: &Rnode, b: &Rnode) -> bool {
        a.up == b.up
            && Rnode::cmp_avail(a, b) == Ordering::Equal
            && a.children.iter().all(|(name, ca)| {
                b.children
                    .get(name)
                    .is_some_and(|cb| ca.ids == cb.ids)
            })
    }

    /// Encode as one R_lite entry covering `ranks`, emitting only pools
    /// with available ids (`core` is always present).
    pub fn encode(&self, ranks: &IdSet) -> Value {
        let mut children = serde_json::Map::new();
        for (name, c) in &self.children {
            if !c.avail.is_empty() || name == CORE {
                children.insert(
                    name.clone(),
                    Value::String(c.avail.encode(IdsetFlags::RANGE)),
                );
            }
        }
        json!({
            "rank": ranks.encode(IdsetFlags::RANGE),
            "children": Value::Object(children),
        })
    }

    /// Short form `core[0-3],gpu[0-1]` over available ids, core first,
    /// empty pools skipped.
    pub(crate) fn dumps_children(&self) -> String {
        let mut names: Vec<&String> = self.children.keys().collect();
        names.sort_by(|a, b| {
            if a.as_str() == CORE {
                Ordering::Less
            } else if b.as_str() == CORE {
                Ordering::Greater
            } else {
                a.cmp(b)
            }
        });
        let mut out = String::new();
        for name in names {
            let c = &self.children[name];
            if c.avail.is_empty() {
                continue;
            }
            if !out.is_empty() {
                out.push(',');
            }
            out.push_str(name);
            out.push_str(&c.avail.encode(IdsetFlags::RANGE | IdsetFlags::BRACKETS));
        }
        out
    }

    pub fn child(&self, name: &str) -> Option<&RnodeChild> {
        self.children.get(name)
    }

    pub fn children(&self) -> impl Iterator<Item = (&str, &RnodeChild)> {
        self.children.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub(crate) fn cores(&self) -> &RnodeChild {
        self.children.get(CORE).expect("core pool always present")
    }

    pub(crate) fn cores_mut(&mut self) -> &mut RnodeChild {
        self.children.get_mut(CORE).expect("core pool always present")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_has_core() {
        let n = Rnode::new(Some("foo0"), 0);
        assert!(n.child(CORE).is_some());
        assert!(n.is_empty());
        assert!(n.up);
    }

    #[test]
    fn test_with_cores() {
        let n = Rnode::with_cores(Some("foo0"), 0, "0-3").unwrap();
        assert_eq!(n.count(), 4);
        assert_eq!(n.avail(), 4);
        assert!(!n.is_empty());
    }

    #[test]
    fn test_add_child_overlap() {
        let mut n = Rnode::with_cores(None, 0, "0-3").unwrap();
        assert_eq!(n.add_child(CORE, "2-5"), Err(RsetError::Overlap(CORE.into())));
        n.add_child(CORE, "4-7").unwrap();
        assert_eq!(n.count(), 8);
    }

    #[test]
    fn test_alloc_lowest_first() {
        let mut n = Rnode::with_cores(None, 0, "0-3").unwrap();
        let ids = n.alloc(2).unwrap();
        assert_eq!(ids, IdSet::decode("0-1").unwrap());
        assert_eq!(n.avail(), 2);
        let ids = n.alloc(2).unwrap();
        assert_eq!(ids, IdSet::decode("2-3").unwrap());
        assert_eq!(n.alloc(1), Err(RsetError::NoSpace));
    }

    #[test]
    fn test_alloc_down_node() {
        let mut n = Rnode::with_cores(None, 3, "0-3").unwrap();
        n.up = false;
        assert_eq!(n.alloc(1), Err(RsetError::HostDown(3)));
        assert_eq!(n.avail(), 0);
        assert_eq!(n.avail_total(), 0);
    }

    #[test]
    fn test_alloc_free_idset() {
        let mut n = Rnode::with_cores(None, 0, "0-3").unwrap();
        let two = IdSet::decode("1,3").unwrap();
        n.alloc_idset(&two).unwrap();
        assert_eq!(n.avail(), 2);
        assert_eq!(n.alloc_idset(&two), Err(RsetError::AlreadyAllocated(1)));
        let bogus = IdSet::decode("9").unwrap();
        assert!(matches!(
            n.alloc_idset(&bogus),
            Err(RsetError::UnknownId { id: 9, .. })
        ));
        n.free_idset(&two).unwrap();
        assert_eq!(n.avail(), 4);
        assert_eq!(n.free_idset(&two), Err(RsetError::AlreadyFree(1)));
    }

    #[test]
    fn test_copies() {
        let mut n = Rnode::with_cores(None, 0, "0-3").unwrap();
        n.alloc_idset(&IdSet::decode("0-1").unwrap()).unwrap();

        let empty = n.copy_empty();
        assert_eq!(empty.avail(), 4);

        let avail = n.copy_avail();
        assert_eq!(avail.count(), 2);
        assert_eq!(avail.cores().ids, IdSet::decode("2-3").unwrap());

        let alloc = n.copy_alloc();
        assert_eq!(alloc.cores().ids, IdSet::decode("0-1").unwrap());
        assert_eq!(alloc.cores().avail, IdSet::decode("0-1").unwrap());
    }

    #[test]
    fn test_copy_cores_drops_gpu() {
        let mut n = Rnode::with_cores(None, 0, "0-3").unwrap();
        n.add_child("gpu", "0-1").unwrap();
        let c = n.copy_cores();
        assert!(c.child("gpu").is_none());
        assert_eq!(c.count(), 4);
    }

    #[test]
    fn test_diff_keeps_empty_core() {
        let a = Rnode::with_cores(None, 0, "0-3").unwrap();
        let d = Rnode::diff(&a, &a);
        assert!(d.is_empty());
        assert!(d.child(CORE).is_some());

        let mut b = Rnode::with_cores(None, 0, "0-1").unwrap();
        b.add_child("gpu", "0").unwrap();
        let mut a2 = a.clone();
        a2.add_child("gpu", "0").unwrap();
        let d = Rnode::diff(&a2, &b);
        assert_eq!(d.cores().ids, IdSet::decode("2-3").unwrap());
        // gpu went empty and is dropped
        assert!(d.child("gpu").is_none());
    }

    #[test]
    fn test_intersect_rank_mismatch() {
        let a = Rnode::with_cores(None, 0, "0-3").unwrap();
        let b = Rnode::with_cores(None, 1, "0-3").unwrap();
        assert!(Rnode::intersect(&a, &b).is_err());
    }

    #[test]
    fn test_intersect() {
        let a = Rnode::with_cores(None, 0, "0-3").unwrap();
        let b = Rnode::with_cores(None, 0, "2-5").unwrap();
        let x = Rnode::intersect(&a, &b).unwrap();
        assert_eq!(x.cores().ids, IdSet::decode("2-3").unwrap());
    }

    #[test]
    fn test_remap() {
        let mut n = Rnode::with_cores(None, 0, "2,4,6").unwrap();
        n.alloc_idset(&IdSet::decode("4").unwrap()).unwrap();
        n.remap(&BTreeSet::new());
        assert_eq!(n.cores().ids, IdSet::decode("0-2").unwrap());
        // id 4 was the second member, so position 1 is allocated
        assert_eq!(n.cores().avail, IdSet::decode("0,2").unwrap());
    }

    #[test]
    fn test_remap_noremap() {
        let mut n = Rnode::new(None, 0);
        n.add_child("gpu", "2-3").unwrap();
        let mut noremap = BTreeSet::new();
        noremap.insert("gpu".to_string());
        n.remap(&noremap);
        assert_eq!(n.child("gpu").unwrap().ids, IdSet::decode("2-3").unwrap());
    }

    #[test]
    fn test_properties() {
        let mut n = Rnode::new(None, 0);
        n.set_property("fast");
        assert!(n.has_property("fast"));
        n.set_property("fast"); // setting twice is not an error
        n.remove_property("fast");
        assert!(!n.has_property("fast"));
    }

    #[test]
    fn test_cmp_avail_ordering() {
        // identical avail sets compare equal
        let a = Rnode::with_cores(None, 0, "0-3").unwrap();
        let b = Rnode::with_cores(None, 1, "0-3").unwrap();
        assert_eq!(Rnode::cmp_avail(&a, &b), Ordering::Equal);

        // ordered by the first differing avail element
        let lo = Rnode::with_cores(None, 0, "0,2").unwrap();
        let hi = Rnode::with_cores(None, 1, "0,3").unwrap();
        assert_eq!(Rnode::cmp_avail(&lo, &hi), Ordering::Less);
        assert_eq!(Rnode::cmp_avail(&hi, &lo), Ordering::Greater);

        // an exhausted walk sorts before any real id
        let mut drained = Rnode::with_cores(None, 0, "0-1").unwrap();
        drained
            .alloc_idset(&IdSet::decode("0-1").unwrap())
            .unwrap();
        let full = Rnode::with_cores(None, 1, "0-1").unwrap();
        assert_eq!(Rnode::cmp_avail(&drained, &full), Ordering::Less);
        assert_eq!(Rnode::cmp_avail(&full, &drained), Ordering::Greater);

        // a shorter prefix of the same walk sorts before the longer one
        let mut prefix = Rnode::with_cores(None, 0, "0-3").unwrap();
        prefix.alloc_idset(&IdSet::decode("2-3").unwrap()).unwrap();
        let longer = Rnode::with_cores(None, 1, "0-3").unwrap();
        assert_eq!(Rnode::cmp_avail(&prefix, &longer), Ordering::Less);

        // differing child-set shapes never compare equal
        let mut gpu = Rnode::with_cores(None, 0, "0-3").unwrap();
        gpu.add_child("gpu", "0").unwrap();
        assert_ne!(Rnode::cmp_avail(&a, &gpu), Ordering::Equal);
    }

    #[test]
    fn test_dumps_children_core_first() {
        let mut n = Rnode::with_cores(None, 0, "0-3").unwrap();
        n.add_child("gpu", "0-1").unwrap();
        n.add_child("big", "7").unwrap();
        assert_eq!(n.dumps_children(), "core[0-3],big7,gpu[0-1]");
    }
}
