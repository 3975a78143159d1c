//! Path query evaluation.
//!
//! A query is a chain of steps; each object whose class matches the first
//! step seeds a pass down the chain, following outgoing or incoming edges
//! per step. A step with a doubled arrow treats instances of skipped
//! classes as transparent: their neighbors are explored by the same step
//! via an explicit stack. A per-step "touched" set (rolled back between
//! passes) keeps large skipped subgraphs from being re-walked within one
//! pass while leaving them discoverable from later seeds.

use crate::graph::ObjectGraph;
use crate::heap::Heap;
use crate::histo::Collector;
use crate::query::Query;
use crate::util::{BitSet, UndoableBitSet};
use crate::ObjectId;

/// Search state around one query step.
struct Finder {
    /// Class ids matching the step pattern, subclasses included.
    classes: BitSet,
    /// Direction of the arrow leading into this step.
    outbound: bool,
    /// Whether this step passes through skipped classes.
    skip: bool,
    /// Object currently considered at this step.
    focus: ObjectId,
    /// Pending neighbors of skipped objects, for this step.
    stack: Vec<ObjectId>,
    /// Objects already expanded at this step within the current pass.
    touched: UndoableBitSet,
}

struct Searcher<'q> {
    heap: &'q Heap,
    graph: &'q ObjectGraph,
    finders: Vec<Finder>,
    arg_indices: &'q [usize],
    funargs: Vec<ObjectId>,
}

/// Evaluate a query against the heap, handing each complete match's
/// collector arguments to `collector`.
pub fn search_heap(heap: &Heap, query: &Query, collector: &mut dyn Collector) {
    let graph = match heap.graph() {
        Some(graph) => graph,
        None => panic!("search invoked before the reference graph was built"),
    };
    if query.steps.is_empty() {
        return;
    }
    let max_oid = heap.max_oid();
    let finders = query
        .steps
        .iter()
        .enumerate()
        .map(|(i, step)| Finder {
            classes: heap.classes.cids_matching(&step.pattern),
            outbound: step.outbound,
            skip: step.skip && i > 0,
            focus: 0,
            stack: Vec::with_capacity(1024),
            touched: UndoableBitSet::new(max_oid as usize + 1),
        })
        .collect();
    let mut searcher = Searcher {
        heap,
        graph,
        finders,
        arg_indices: &query.arg_indices,
        funargs: vec![0; query.arg_indices.len()],
    };

    // Seed a pass for every object the first step matches. The loop runs
    // over the full object id space; objects with no references are still
    // legitimate single-step matches.
    for oid in 1..=max_oid {
        let cid = searcher.heap.cid_of(oid);
        if searcher.finders[0].classes.has(cid as usize) {
            searcher.check(0, oid, collector);
        }
    }
}

impl<'q> Searcher<'q> {
    /// Check an object at step `k`, plus everything queued behind it by
    /// skip expansion. The touched set rolls back when the pass ends so
    /// later seeds can revisit the same skipped structures.
    fn check(&mut self, k: usize, oid: ObjectId, collector: &mut dyn Collector) {
        let mark = self.finders[k].touched.mark();
        self.do_check(k, oid, collector);
        while let Some(queued) = self.finders[k].stack.pop() {
            self.do_check(k, queued, collector);
        }
        self.finders[k].touched.undo_to(mark);
    }

    fn do_check(&mut self, k: usize, oid: ObjectId, collector: &mut dyn Collector) {
        self.finders[k].focus = oid;
        let cid = self.heap.cid_of(oid);
        if self.finders[k].classes.has(cid as usize) {
            if k + 1 < self.finders.len() {
                // a match mid-chain: the next step considers the adjacent
                // nodes in its own direction
                let graph = self.graph;
                if self.finders[k + 1].outbound {
                    for dst in graph.out_edges(oid) {
                        self.check(k + 1, dst, collector);
                    }
                } else {
                    for dst in graph.in_edges(oid) {
                        self.check(k + 1, dst, collector);
                    }
                }
            } else {
                // the chain is complete; hand each argument step's focus
                // to the collector
                for (i, &step_index) in self.arg_indices.iter().enumerate() {
                    self.funargs[i] = self.finders[step_index].focus;
                }
                collector.collect(&self.funargs);
            }
        } else if self.finders[k].skip && self.heap.is_skipped(cid) {
            // transparent object: queue its neighbors for this same step,
            // once per pass
            if !self.finders[k].touched.has(oid) {
                self.finders[k].touched.set(oid);
                let graph = self.graph;
                if self.finders[k].outbound {
                    self.finders[k].stack.extend(graph.out_edges(oid));
                } else {
                    self.finders[k].stack.extend(graph.in_edges(oid));
                }
            }
        }
    }
}
