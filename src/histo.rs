//! Match collectors, and the class histogram: instance and byte counts
//! per class, a la `jmap -histo`.

use std::io::{self, Write};

use itertools::Itertools;

use crate::commands::ThresholdDim;
use crate::heap::Heap;
use crate::util::BitSet;
use crate::ObjectId;

/// Anything that can receive the bound variables of a completed query
/// match. The histogram is one implementation; tests use recording
/// collectors.
pub trait Collector {
    fn collect(&mut self, args: &[ObjectId]);
}

struct ClassCount {
    name: String,
    count: u32,
    nbytes: u64,
}

/// Per-class instance and byte counts. Idempotent per object: a bit set
/// of seen object ids guarantees each object counts once even when a
/// query matches it along several paths.
pub struct Histo<'a> {
    heap: &'a Heap,
    /// Counts indexed by class id.
    counts: Vec<Option<ClassCount>>,
    known: BitSet,
}

impl<'a> Histo<'a> {
    pub fn new(heap: &'a Heap) -> Histo<'a> {
        Histo {
            heap,
            counts: (0..=heap.classes.max_cid()).map(|_| None).collect(),
            known: BitSet::new(heap.max_oid() as usize + 1),
        }
    }

    /// Count an object under its class, once.
    pub fn add(&mut self, oid: ObjectId) {
        if self.known.has(oid as usize) {
            return;
        }
        self.known.set(oid as usize);
        let cid = self.heap.cid_of(oid);
        let nbytes = self.heap.size_of(oid) as u64;
        let name = self
            .heap
            .classes
            .get(cid)
            .map_or_else(String::new, |c| c.name().clone());
        let slot = self.counts[cid as usize].get_or_insert_with(|| ClassCount {
            name,
            count: 0,
            nbytes: 0,
        });
        slot.count += 1;
        slot.nbytes += nbytes;
    }

    /// (instance count, total bytes) for a class, if any were collected.
    pub fn row(&self, name: &str) -> Option<(u32, u64)> {
        self.counts
            .iter()
            .flatten()
            .find(|slot| slot.name == name)
            .map(|slot| (slot.count, slot.nbytes))
    }

    /// Print the histogram: one row per class ordered by total bytes
    /// descending (ties by name), then a total row. Groups below the
    /// threshold are hidden but still contribute to the total.
    pub fn print<W: Write>(
        &self,
        out: &mut W,
        threshold: Option<(u64, ThresholdDim)>,
    ) -> io::Result<()> {
        let rows = self
            .counts
            .iter()
            .flatten()
            .sorted_by(|a, b| b.nbytes.cmp(&a.nbytes).then_with(|| a.name.cmp(&b.name)));

        let mut total_count = 0_u64;
        let mut total_bytes = 0_u64;
        for slot in rows {
            total_count += slot.count as u64;
            total_bytes += slot.nbytes;
            let visible = match threshold {
                None => true,
                Some((limit, ThresholdDim::Objects)) => slot.count as u64 >= limit,
                Some((limit, ThresholdDim::Bytes)) => slot.nbytes >= limit,
                // retained sizes are reserved and report as 0
                Some((limit, ThresholdDim::Retained)) => 0 >= limit,
            };
            if visible {
                writeln!(out, "{:>10} {:>10} {}", slot.count, slot.nbytes, slot.name)?;
            }
        }
        writeln!(out, "{:>10} {:>10} total", total_count, total_bytes)
    }
}

/// A query match is dropped unless every collected object is visible
/// under the current garbage mode; otherwise each object is counted.
impl<'a> Collector for Histo<'a> {
    fn collect(&mut self, args: &[ObjectId]) {
        if args.iter().any(|&oid| !self.heap.can_see(oid)) {
            return;
        }
        for &oid in args {
            self.add(oid);
        }
    }
}
