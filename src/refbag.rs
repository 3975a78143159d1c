//! Per-worker accumulators of raw object references.
//!
//! While a segment decode worker scans payloads it knows the object id of
//! the referrer but only the heap id of the referee, because the heap-id
//! map is not usable until every object id has been assigned. References
//! are therefore banked as (object id, heap id) pairs and resolved in bulk
//! once the parse completes.

use log::info;
use rayon::prelude::*;

use crate::objectmap::ObjectMap;
use crate::util::ChunkedVec;
use crate::{HeapId, ObjectId};

/// An append-only pair of aligned lists. Ordering within a bag follows the
/// append order; bags are unordered among themselves.
#[derive(Default, Debug)]
pub struct RefBag {
    from: ChunkedVec<ObjectId>,
    to: ChunkedVec<HeapId>,
}

impl RefBag {
    pub fn new() -> RefBag {
        RefBag::default()
    }

    pub fn len(&self) -> usize {
        self.from.len()
    }

    pub fn is_empty(&self) -> bool {
        self.from.is_empty()
    }

    pub fn add(&mut self, from: ObjectId, to: HeapId) {
        self.from.push(from);
        self.to.push(to);
    }

    /// Aligned chunk pairs; `from` and `to` grow in lockstep so the chunk
    /// boundaries coincide.
    fn chunks(&self) -> impl Iterator<Item = (&[ObjectId], &[HeapId])> {
        self.from.chunks().zip(self.to.chunks())
    }

    /// The banked (referrer, referee) pairs in append order.
    pub fn pairs(&self) -> impl Iterator<Item = (ObjectId, HeapId)> + '_ {
        self.from.iter().copied().zip(self.to.iter().copied())
    }
}

/// Combine a set of bags into flat referrer / referee arrays, resolving
/// referee heap ids through the (finalized) object map. Unresolvable heap
/// ids become object id 0, which the graph traversal skips; their count is
/// reported for diagnostics. The bags are consumed and should be the last
/// holders of their memory.
pub fn merge_bags(bags: Vec<RefBag>, map: &ObjectMap) -> (Vec<ObjectId>, Vec<ObjectId>) {
    let total: usize = bags.iter().map(|bag| bag.len()).sum();
    info!("resolving {} references", total);

    let mut from = vec![0 as ObjectId; total];
    let mut to = vec![0 as ObjectId; total];

    // Carve the result arrays into one disjoint span per source chunk so
    // every chunk can be copied and resolved independently.
    let mut tasks = Vec::new();
    {
        let mut from_rest = from.as_mut_slice();
        let mut to_rest = to.as_mut_slice();
        for bag in &bags {
            for (src_from, src_to) in bag.chunks() {
                let (from_span, rest) =
                    std::mem::take(&mut from_rest).split_at_mut(src_from.len());
                from_rest = rest;
                let (to_span, rest) = std::mem::take(&mut to_rest).split_at_mut(src_to.len());
                to_rest = rest;
                tasks.push((from_span, to_span, src_from, src_to));
            }
        }
    }

    let unresolved: u64 = tasks
        .into_par_iter()
        .map(|(from_span, to_span, src_from, src_to)| {
            from_span.copy_from_slice(src_from);
            let mut misses = 0_u64;
            for (slot, &hid) in to_span.iter_mut().zip(src_to) {
                let oid = map.get(hid);
                if oid == 0 {
                    misses += 1;
                }
                *slot = oid;
            }
            misses
        })
        .sum();

    if unresolved > 0 {
        info!("{} references had no resolvable target", unresolved);
    }
    drop(bags);
    (from, to)
}
