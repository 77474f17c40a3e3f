//! Slot allocation policies over a resource list.
//!
//! Each request asks for `nslots` slots of `slot_size` cores; a slot never
//! spans ranks. Placement picks, per slot, the first node of the policy's
//! ordering that can host it, so worst-fit spreads load and best-fit packs
//! it. A request that cannot complete unwinds every slot it placed.

use std::cmp::Ordering;
use std::collections::VecDeque;
use std::str::FromStr;

use serde_json::Value;

use crate::error::RsetError;
use crate::matcher::Constraint;
use crate::rlist::Rlist;
use crate::rnode::{CORE, Rnode};

/// Node ordering policy for slot placement.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum AllocMode {
    /// Least-utilized nodes first (spread).
    #[default]
    WorstFit,
    /// Most-utilized nodes first (pack).
    BestFit,
    /// Ascending rank order.
    FirstFit,
}

impl FromStr for AllocMode {
    type Err = RsetError;

    fn from_str(s: &str) -> Result<AllocMode, RsetError> {
        match s {
            "worst-fit" => Ok(AllocMode::WorstFit),
            "best-fit" => Ok(AllocMode::BestFit),
            "first-fit" => Ok(AllocMode::FirstFit),
            other => Err(RsetError::InvalidArgument(format!(
                "unknown allocation mode: {other}"
            ))),
        }
    }
}

impl std::fmt::Display for AllocMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            AllocMode::WorstFit => "worst-fit",
            AllocMode::BestFit => "best-fit",
            AllocMode::FirstFit => "first-fit",
        })
    }
}

/// One allocation request.
#[derive(Debug, Clone, Default)]
pub struct AllocInfo {
    /// Exact node count; zero means "any number of nodes".
    pub nnodes: usize,
    pub slot_size: usize,
    pub nslots: usize,
    pub mode: AllocMode,
    /// With `nnodes`, allocate whole nodes (idle nodes only).
    pub exclusive: bool,
    /// Optional RFC 31 constraint spec.
    pub constraints: Option<Value>,
}

fn by_rank(a: &Rnode, b: &Rnode) -> Ordering {
    a.rank.cmp(&b.rank)
}

fn by_avail(a: &Rnode, b: &Rnode) -> Ordering {
    a.avail().cmp(&b.avail()).then(by_rank(a, b))
}

/// Up nodes first, then most available cores first.
fn by_used(a: &Rnode, b: &Rnode) -> Ordering {
    b.up.cmp(&a.up)
        .then(b.avail().cmp(&a.avail()))
        .then(by_rank(a, b))
}

impl Rlist {
    /// Allocation front door.
    ///
    /// Validates the request, distinguishes a transient
    /// [`RsetError::NoSpace`] from a permanent [`RsetError::Unsatisfiable`]
    /// via a dry run against an empty all-up copy, and applies constraints
    /// by allocating on a filtered view whose decisions are promoted back
    /// into the live list.
    pub fn alloc(&mut self, ai: &AllocInfo) -> Result<Rlist, RsetError> {
        self.alloc_info_check(ai)?;
        match &ai.constraints {
            Some(spec) => self.alloc_constrained(ai, spec),
            None => match self.try_alloc(ai) {
                Err(RsetError::NoSpace) if !self.alloc_feasible(ai) => {
                    Err(RsetError::Unsatisfiable("unsatisfiable request".into()))
                }
                other => other,
            },
        }
    }

    fn alloc_constrained(&mut self, ai: &AllocInfo, spec: &Value) -> Result<Rlist, RsetError> {
        let constraint = Constraint::parse(spec)?;
        let mut view = self.copy_constraint(&constraint);
        if view.count(CORE) == 0 {
            return Err(RsetError::Unsatisfiable(
                "no resources satisfy provided constraints".into(),
            ));
        }
        match view.try_alloc(ai) {
            Ok(result) => {
                // promote decisions made on the filtered view into the live list
                self.set_allocated(&result)?;
                Ok(result)
            }
            Err(RsetError::NoSpace) if !view.alloc_feasible(ai) => Err(RsetError::Unsatisfiable(
                "unsatisfiable constrained request".into(),
            )),
            Err(e) => Err(e),
        }
    }

    fn alloc_info_check(&self, ai: &AllocInfo) -> Result<(), RsetError> {
        if ai.nslots == 0 || ai.slot_size == 0 {
            return Err(RsetError::InvalidArgument(format!(
                "invalid request: nslots={} slot_size={}",
                ai.nslots, ai.slot_size
            )));
        }
        if ai.exclusive && ai.nnodes == 0 {
            return Err(RsetError::InvalidArgument(
                "exclusive allocation only supported with nnodes".into(),
            ));
        }
        let total = ai.nslots * ai.slot_size;
        if total > self.total() {
            return Err(RsetError::Unsatisfiable("unsatisfiable request".into()));
        }
        if total > self.avail() {
            if !self.alloc_feasible(ai) {
                return Err(RsetError::Unsatisfiable("unsatisfiable request".into()));
            }
            return Err(RsetError::NoSpace);
        }
        Ok(())
    }

    /// Dry-run the request against an empty, all-up copy to distinguish
    /// "no space now" from "never satisfiable".
    fn alloc_feasible(&self, ai: &AllocInfo) -> bool {
        let mut all = self.copy_empty();
        if all.mark_up("all").is_err() {
            return false;
        }
        all.try_alloc(ai).is_ok()
    }

    fn try_alloc(&mut self, ai: &AllocInfo) -> Result<Rlist, RsetError> {
        let mut result = if ai.nnodes > 0 {
            self.alloc_nnodes(ai)?
        } else {
            self.alloc_slots(ai.mode, ai.slot_size, ai.nslots)?
        };
        result.nslots = Some(ai.nslots as u64);
        Ok(result)
    }

    /// Rank order under the given placement policy, recomputed from the
    /// current availability.
    fn policy_order(&self, mode: AllocMode) -> Vec<u32> {
        let mut nodes: Vec<&Rnode> = self.nodes().collect();
        match mode {
            AllocMode::FirstFit => nodes.sort_by(|a, b| by_rank(a, b)),
            AllocMode::BestFit => nodes.sort_by(|a, b| by_avail(a, b)),
            AllocMode::WorstFit => nodes.sort_by(|a, b| by_used(a, b)),
        }
        nodes.into_iter().map(|n| n.rank).collect()
    }

    /// Place `slots` slots, one at a time, each on the first node of the
    /// policy order that can host it.
    fn alloc_slots(
        &mut self,
        mode: AllocMode,
        slot_size: usize,
        slots: usize,
    ) -> Result<Rlist, RsetError> {
        let mut result = Rlist::new();
        for _ in 0..slots {
            if self.place_slot(mode, slot_size, &mut result).is_none() {
                // unwind everything placed so far
                let _ = self.free(&result);
                return Err(RsetError::NoSpace);
            }
        }
        Ok(result)
    }

    fn place_slot(&mut self, mode: AllocMode, slot_size: usize, result: &mut Rlist) -> Option<()> {
        for rank in self.policy_order(mode) {
            let node = self.find_rank_mut(rank)?;
            let hostname = node.hostname.clone();
            match node.alloc(slot_size) {
                Ok(ids) => {
                    let n = Rnode::with_core_idset(hostname.as_deref(), rank, &ids);
                    result.add_rnode(n).ok()?;
                    return Some(());
                }
                Err(RsetError::NoSpace) | Err(RsetError::HostDown(_)) => continue,
                Err(_) => return None,
            }
        }
        None
    }

    /// Allocate across exactly `nnodes` nodes.
    fn alloc_nnodes(&mut self, ai: &AllocInfo) -> Result<Rlist, RsetError> {
        if self.nnodes() < ai.nnodes {
            return Err(RsetError::NoSpace);
        }
        if ai.nslots < ai.nnodes {
            return Err(RsetError::InvalidArgument(format!(
                "nnodes ({}) cannot exceed nslots ({})",
                ai.nnodes, ai.nslots
            )));
        }
        if ai.exclusive {
            return self.alloc_nnodes_exclusive(ai.nnodes);
        }
        self.alloc_nnodes_spread(ai.nnodes, ai.slot_size, ai.nslots)
    }

    /// Whole-node allocation: the first `nnodes` fully-idle nodes in
    /// least-utilized order. Reaching a less-than-full candidate means no
    /// further idle node exists.
    fn alloc_nnodes_exclusive(&mut self, nnodes: usize) -> Result<Rlist, RsetError> {
        let order = self.policy_order(AllocMode::WorstFit);
        let mut result = Rlist::new();
        let mut taken: Vec<u32> = Vec::with_capacity(nnodes);
        for rank in order {
            if taken.len() == nnodes {
                break;
            }
            let node = self.find_rank_mut(rank).expect("rank from policy order");
            if node.avail() < node.count() {
                break;
            }
            let copy = node.clone();
            let all_cores = node.cores().ids.clone();
            node.alloc_idset(&all_cores)
                .expect("idle node allocates all cores");
            result.add_rnode(copy)?;
            taken.push(rank);
        }
        if taken.len() < nnodes {
            // free the nodes we already claimed
            let _ = self.free(&result);
            return Err(RsetError::NoSpace);
        }
        Ok(result)
    }

    /// Spread `nslots` slots over exactly `nnodes` up nodes: each placement
    /// goes to the head of the candidate queue, exhausted nodes drop out,
    /// others rotate to the back so every node receives a slot before any
    /// receives a second.
    fn alloc_nnodes_spread(
        &mut self,
        nnodes: usize,
        slot_size: usize,
        nslots: usize,
    ) -> Result<Rlist, RsetError> {
        let mut candidates: VecDeque<u32> = self
            .policy_order(AllocMode::WorstFit)
            .into_iter()
            .filter(|rank| self.find_rank(*rank).is_some_and(|n| n.up))
            .take(nnodes)
            .collect();
        if candidates.len() < nnodes {
            return Err(RsetError::NoSpace);
        }
        let mut result = Rlist::new();
        for _ in 0..nslots {
            let Some(rank) = candidates.pop_front() else {
                let _ = self.free(&result);
                return Err(RsetError::NoSpace);
            };
            let node = self.find_rank_mut(rank).expect("candidate rank exists");
            let hostname = node.hostname.clone();
            match node.alloc(slot_size) {
                Ok(ids) => {
                    let avail = node.avail();
                    result.add_rnode(Rnode::with_core_idset(hostname.as_deref(), rank, &ids))?;
                    if avail > 0 {
                        candidates.push_back(rank);
                    }
                }
                Err(_) => {
                    let _ = self.free(&result);
                    return Err(RsetError::NoSpace);
                }
            }
        }
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rgrid_core::{IdSet, IdsetFlags};

    fn grid(nodes: u32, cores: u32) -> Rlist {
        let mut rl = Rlist::new();
        for rank in 0..nodes {
            rl.add_rnode(Rnode::with_count(Some(&format!("n{rank}")), rank, cores))
                .unwrap();
        }
        rl
    }

    fn info(nnodes: usize, nslots: usize, slot_size: usize, mode: AllocMode) -> AllocInfo {
        AllocInfo {
            nnodes,
            nslots,
            slot_size,
            mode,
            ..Default::default()
        }
    }

    #[test]
    fn test_mode_from_str() {
        assert_eq!("worst-fit".parse::<AllocMode>().unwrap(), AllocMode::WorstFit);
        assert_eq!("best-fit".parse::<AllocMode>().unwrap(), AllocMode::BestFit);
        assert_eq!("first-fit".parse::<AllocMode>().unwrap(), AllocMode::FirstFit);
        assert!("middle-fit".parse::<AllocMode>().is_err());
    }

    #[test]
    fn test_invalid_requests() {
        let mut rl = grid(2, 2);
        assert!(matches!(
            rl.alloc(&info(0, 0, 1, AllocMode::WorstFit)),
            Err(RsetError::InvalidArgument(_))
        ));
        assert!(matches!(
            rl.alloc(&AllocInfo {
                nslots: 1,
                slot_size: 1,
                exclusive: true,
                ..Default::default()
            }),
            Err(RsetError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_worst_fit_spreads() {
        let mut rl = grid(4, 4);
        let result = rl.alloc(&info(0, 4, 1, AllocMode::WorstFit)).unwrap();
        assert_eq!(result.ranks().encode(IdsetFlags::RANGE), "0-3");
        for n in result.nodes() {
            assert_eq!(n.count(), 1);
        }
        assert_eq!(rl.avail(), 12);
    }

    #[test]
    fn test_first_fit_packs_by_rank() {
        let mut rl = grid(4, 4);
        let result = rl.alloc(&info(0, 4, 1, AllocMode::FirstFit)).unwrap();
        assert_eq!(result.ranks().encode(IdsetFlags::RANGE), "0");
        assert_eq!(rl.find_rank(0).unwrap().avail(), 0);
    }

    #[test]
    fn test_best_fit_prefers_loaded_node() {
        let mut rl = grid(4, 4);
        // rank 0 has only one core left
        rl.find_rank_mut(0)
            .unwrap()
            .alloc_idset(&IdSet::decode("0-2").unwrap())
            .unwrap();
        let result = rl.alloc(&info(0, 1, 1, AllocMode::BestFit)).unwrap();
        assert_eq!(result.ranks().encode(IdsetFlags::RANGE), "0");
        assert_eq!(rl.find_rank(0).unwrap().avail(), 0);
    }

    #[test]
    fn test_exclusive_nnodes_skips_nothing() {
        let mut rl = grid(3, 2);
        rl.find_rank_mut(1)
            .unwrap()
            .alloc_idset(&IdSet::decode("0").unwrap())
            .unwrap();
        let ai = AllocInfo {
            nnodes: 2,
            nslots: 2,
            slot_size: 2,
            exclusive: true,
            ..Default::default()
        };
        let result = rl.alloc(&ai).unwrap();
        assert_eq!(result.ranks().encode(IdsetFlags::RANGE), "0,2");
        // rank 1 untouched, ranks 0 and 2 fully allocated
        assert_eq!(rl.find_rank(1).unwrap().avail(), 1);
        assert_eq!(rl.find_rank(0).unwrap().avail(), 0);
        assert_eq!(rl.find_rank(2).unwrap().avail(), 0);
    }

    #[test]
    fn test_exclusive_fails_without_enough_idle() {
        let mut rl = grid(2, 2);
        rl.find_rank_mut(0)
            .unwrap()
            .alloc_idset(&IdSet::decode("0").unwrap())
            .unwrap();
        let ai = AllocInfo {
            nnodes: 2,
            nslots: 2,
            slot_size: 2,
            exclusive: true,
            ..Default::default()
        };
        assert_eq!(rl.alloc(&ai).unwrap_err(), RsetError::NoSpace);
        // unwound: nothing extra allocated
        assert_eq!(rl.avail(), 3);
    }

    #[test]
    fn test_nnodes_spread_round_robin() {
        let mut rl = grid(3, 4);
        let result = rl.alloc(&info(3, 6, 1, AllocMode::WorstFit)).unwrap();
        // every node got two slots before any third
        for n in result.nodes() {
            assert_eq!(n.count(), 2);
        }
    }

    #[test]
    fn test_nnodes_more_than_nodes() {
        let mut rl = grid(2, 4);
        assert_eq!(
            rl.alloc(&info(3, 3, 1, AllocMode::WorstFit)).unwrap_err(),
            RsetError::NoSpace
        );
    }

    #[test]
    fn test_nslots_less_than_nnodes() {
        let mut rl = grid(4, 4);
        assert!(matches!(
            rl.alloc(&info(4, 2, 1, AllocMode::WorstFit)),
            Err(RsetError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_overflow_vs_nospace() {
        let mut rl = grid(2, 4);
        // more than total: permanently unsatisfiable
        assert!(rl
            .alloc(&info(0, 16, 1, AllocMode::WorstFit))
            .unwrap_err()
            .is_unsatisfiable());
        // fits total but not current avail: transient
        rl.find_rank_mut(0)
            .unwrap()
            .alloc_idset(&IdSet::decode("0-3").unwrap())
            .unwrap();
        rl.find_rank_mut(1)
            .unwrap()
            .alloc_idset(&IdSet::decode("0-3").unwrap())
            .unwrap();
        assert_eq!(
            rl.alloc(&info(0, 4, 1, AllocMode::WorstFit)).unwrap_err(),
            RsetError::NoSpace
        );
        // a slot bigger than any node: unsatisfiable even though counts fit
        let mut rl = grid(2, 4);
        assert!(rl
            .alloc(&info(0, 1, 5, AllocMode::WorstFit))
            .unwrap_err()
            .is_unsatisfiable());
    }

    #[test]
    fn test_alloc_conservation() {
        let mut rl = grid(4, 4);
        let before = rl.encode();
        let avail = rl.avail();
        let result = rl.alloc(&info(0, 3, 2, AllocMode::WorstFit)).unwrap();
        assert_eq!(rl.avail(), avail - result.count(CORE));
        rl.free(&result).unwrap();
        assert_eq!(rl.encode(), before);
    }

    #[test]
    fn test_constrained_alloc() {
        let mut rl = grid(4, 4);
        rl.add_property("gpu", "0,2").unwrap();
        let ai = AllocInfo {
            nnodes: 2,
            nslots: 2,
            slot_size: 1,
            constraints: Some(serde_json::json!({"properties": ["gpu"]})),
            ..Default::default()
        };
        let result = rl.alloc(&ai).unwrap();
        assert_eq!(result.ranks().encode(IdsetFlags::RANGE), "0,2");
        // promoted into the live list
        assert_eq!(rl.avail(), 14);

        let ai = AllocInfo {
            nnodes: 2,
            nslots: 2,
            slot_size: 1,
            constraints: Some(serde_json::json!({"properties": ["^gpu"]})),
            ..Default::default()
        };
        let result = rl.alloc(&ai).unwrap();
        assert_eq!(result.ranks().encode(IdsetFlags::RANGE), "1,3");
    }

    #[test]
    fn test_constrained_unsatisfiable() {
        let mut rl = grid(4, 4);
        let ai = AllocInfo {
            nslots: 1,
            slot_size: 1,
            constraints: Some(serde_json::json!({"properties": ["nosuch"]})),
            ..Default::default()
        };
        assert!(rl.alloc(&ai).unwrap_err().is_unsatisfiable());
    }

    #[test]
    fn test_down_nodes_skipped() {
        let mut rl = grid(3, 2);
        rl.mark_down("0").unwrap();
        let result = rl.alloc(&info(0, 2, 2, AllocMode::FirstFit)).unwrap();
        assert_eq!(result.ranks().encode(IdsetFlags::RANGE), "1-2");
    }

    #[test]
    fn test_feasibility_monotone() {
        let mut rl = grid(2, 4);
        rl.mark_down("all").unwrap();
        // 8 cores exist but all down: transient
        assert_eq!(
            rl.alloc(&info(0, 8, 1, AllocMode::WorstFit)).unwrap_err(),
            RsetError::NoSpace
        );
        // 9 cores can never exist
        assert!(rl
            .alloc(&info(0, 9, 1, AllocMode::WorstFit))
            .unwrap_err()
            .is_unsatisfiable());
    }
}
