//! GC root bookkeeping and the liveness walk.

use log::info;

use crate::graph::ObjectGraph;
use crate::util::BitSet;
use crate::{HeapId, ObjectId};

/// Which objects queries may see, per the `set garbage` command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Visibility {
    /// Live and unreachable alike (`set garbage`).
    All,
    /// Live objects only (`set nogarbage`, the default).
    Live,
    /// Unreachable objects only (`set garbage only`).
    NonLive,
}

#[derive(Debug)]
pub struct GcRoots {
    /// Heap ids of declared roots, real and synthetic.
    hids: Vec<HeapId>,
    /// Live flags indexed by object id; empty until the walk runs.
    live: BitSet,
    num_live: u32,
    visibility: Visibility,
}

impl GcRoots {
    pub fn new() -> GcRoots {
        GcRoots {
            hids: Vec::new(),
            live: BitSet::new(0),
            num_live: 0,
            visibility: Visibility::All,
        }
    }

    pub fn add(&mut self, hid: HeapId) {
        self.hids.push(hid);
    }

    pub fn hids(&self) -> &[HeapId] {
        &self.hids
    }

    /// Mark every object reachable from the roots along forward edges.
    /// The master root (object id 1) is always live. Iterative DFS; root
    /// heap ids that resolve to nothing are ignored.
    pub fn find_live_objects(
        &mut self,
        graph: &ObjectGraph,
        resolver: impl Fn(HeapId) -> ObjectId,
        max_oid: ObjectId,
    ) {
        self.live = BitSet::new(max_oid as usize + 1);
        self.live.set(1);
        self.num_live = 1;

        let mut stack: Vec<ObjectId> = Vec::with_capacity(16 * 1024);
        for &root in &self.hids {
            stack.push(resolver(root));
            while let Some(oid) = stack.pop() {
                if oid == 0 || self.live.has(oid as usize) {
                    continue;
                }
                self.live.set(oid as usize);
                self.num_live += 1;
                stack.extend(graph.out_edges(oid));
            }
        }

        // Don't count the master root in what we report
        info!("{} of {} objects are live", self.num_live - 1, max_oid - 1);
        self.visibility = Visibility::Live;
    }

    pub fn set_visibility(&mut self, visibility: Visibility) {
        self.visibility = visibility;
    }

    pub fn visibility(&self) -> Visibility {
        self.visibility
    }

    pub fn is_live(&self, oid: ObjectId) -> bool {
        self.live.has(oid as usize)
    }

    /// Liveness predicate under the current visibility mode.
    pub fn can_see(&self, oid: ObjectId) -> bool {
        match self.visibility {
            Visibility::All => true,
            Visibility::Live => self.is_live(oid),
            Visibility::NonLive => !self.is_live(oid),
        }
    }
}

impl Default for GcRoots {
    fn default() -> Self {
        GcRoots::new()
    }
}
