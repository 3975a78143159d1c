//! Immutable object reference graph.
//!
//! Adjacency lists for all nodes are merged into a single edge slice to
//! keep allocator and cache pressure low at heap scale: a per-node offset
//! table points into the slice (0 means "no edges") and a bitmap marks the
//! slot that starts each node's run, with one extra start bit terminating
//! the final run. Slot 0 of the edge slice is reserved. Forward and
//! reverse edge sets share the layout with the direction swapped.

use rayon::join;

use crate::util::BitSet;
use crate::ObjectId;

#[derive(Debug)]
pub struct ObjectGraph {
    max_node: ObjectId,
    outs: EdgeSet,
    ins: EdgeSet,
}

impl ObjectGraph {
    /// Build from parallel referrer/referee arrays. Zero-valued entries
    /// (unresolved references) are stored but skipped by traversal.
    pub fn new(from: Vec<ObjectId>, to: Vec<ObjectId>) -> ObjectGraph {
        let max = |nodes: &[ObjectId]| nodes.iter().copied().max().unwrap_or(0);
        let (max_from, max_to) = join(|| max(&from), || max(&to));
        ObjectGraph::with_max(from, to, max_from.max(max_to))
    }

    /// Build when the maximum node id is already known.
    pub fn with_max(from: Vec<ObjectId>, to: Vec<ObjectId>, max_node: ObjectId) -> ObjectGraph {
        let counter = |nodes: &[ObjectId]| {
            let mut counts = vec![0_u32; max_node as usize + 1];
            for &node in nodes {
                counts[node as usize] += 1;
            }
            counts
        };
        let (from_counts, to_counts) = join(|| counter(&from), || counter(&to));
        // The two edge sets are independent; build them as a task pair.
        // The count arrays are consumed (and the from/to arrays dropped on
        // return) so the transient memory is released before query time.
        let (outs, ins) = join(
            || EdgeSet::build(&from, &to, from_counts),
            || EdgeSet::build(&to, &from, to_counts),
        );
        ObjectGraph {
            max_node,
            outs,
            ins,
        }
    }

    pub fn max_node(&self) -> ObjectId {
        self.max_node
    }

    /// Total edge slots, unresolved entries included.
    pub fn edge_count(&self) -> usize {
        self.outs.edges.len() - 1
    }

    /// Nonzero targets of `node`'s outgoing references. Nodes beyond the
    /// graph's range simply have no edges.
    pub fn out_edges(&self, node: ObjectId) -> EdgeIter<'_> {
        self.outs.iter_from(node)
    }

    /// Nonzero sources of references to `node`.
    pub fn in_edges(&self, node: ObjectId) -> EdgeIter<'_> {
        self.ins.iter_from(node)
    }
}

#[derive(Debug)]
struct EdgeSet {
    /// Merged edge list; index 0 reserved.
    edges: Vec<ObjectId>,
    /// Offset of each node's run, or 0 if it has none.
    offsets: Vec<usize>,
    /// Marks offsets that begin a node's run, plus the terminator.
    is_start: BitSet,
}

impl EdgeSet {
    /// Lay out one direction. Consumes the count array: it is decremented
    /// in place while edges are placed, which reverses each run relative
    /// to input order (callers must not rely on run order).
    fn build(src: &[ObjectId], dst: &[ObjectId], mut counts: Vec<u32>) -> EdgeSet {
        let mut edges = vec![0 as ObjectId; src.len() + 1];
        let mut offsets = vec![0_usize; counts.len()];
        let mut is_start = BitSet::new(src.len() + 2);

        let mut offset = 1_usize;
        for (node, &count) in counts.iter().enumerate() {
            if count > 0 {
                offsets[node] = offset;
                is_start.set(offset);
                offset += count as usize;
            }
        }
        is_start.set(offset); // terminate the last run

        for (i, &node) in src.iter().enumerate() {
            let n = node as usize;
            counts[n] -= 1;
            edges[offsets[n] + counts[n] as usize] = dst[i];
        }

        EdgeSet {
            edges,
            offsets,
            is_start,
        }
    }

    /// First nonzero edge of a node and its position, or (0, 0).
    fn walk(&self, node: ObjectId) -> (ObjectId, usize) {
        let offset = match self.offsets.get(node as usize) {
            Some(&offset) if offset != 0 => offset,
            _ => return (0, 0),
        };
        let edge = self.edges[offset];
        if edge > 0 {
            (edge, offset)
        } else {
            self.next(offset)
        }
    }

    /// Next nonzero edge after `pos`, or (0, 0) at the end of the run.
    fn next(&self, mut pos: usize) -> (ObjectId, usize) {
        loop {
            pos += 1;
            if self.is_start.has(pos) {
                return (0, 0);
            }
            let edge = self.edges[pos];
            if edge > 0 {
                return (edge, pos);
            }
        }
    }

    fn iter_from(&self, node: ObjectId) -> EdgeIter<'_> {
        EdgeIter {
            set: self,
            cursor: self.walk(node),
        }
    }
}

/// Iterates the nonzero edges of one node's run.
pub struct EdgeIter<'a> {
    set: &'a EdgeSet,
    cursor: (ObjectId, usize),
}

impl<'a> Iterator for EdgeIter<'a> {
    type Item = ObjectId;

    fn next(&mut self) -> Option<ObjectId> {
        let (edge, pos) = self.cursor;
        if pos == 0 {
            return None;
        }
        self.cursor = self.set.next(pos);
        Some(edge)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use itertools::Itertools;

    /// Edge data from the graph-traversal scenario: node, then targets.
    const EDGES: &[&[u32]] = &[
        &[1, 2, 19, 23],
        &[2, 3, 6],
        &[3, 5],
        &[4],
        &[5, 4],
        &[6, 5, 7],
        &[7, 8, 9, 10],
        &[8, 6, 16],
        &[9, 18],
        &[10, 11, 14, 15],
        &[11, 12, 13],
        &[12],
        &[13],
        &[14],
        &[15],
        &[16, 17],
        &[17, 18],
        &[18],
        &[19, 20, 21, 22],
        &[20],
        &[21],
        &[22],
        &[23, 24],
        &[24, 25, 26],
        &[25, 26],
        &[26, 23],
    ];

    fn edge_arrays() -> (Vec<ObjectId>, Vec<ObjectId>) {
        let mut src = Vec::new();
        let mut dst = Vec::new();
        for list in EDGES {
            for &node in &list[1..] {
                src.push(list[0]);
                dst.push(node);
            }
        }
        (src, dst)
    }

    fn sorted_out(graph: &ObjectGraph, node: ObjectId) -> Vec<ObjectId> {
        graph.out_edges(node).sorted().collect()
    }

    #[test]
    fn forward_traversal_matches_input() {
        let (src, dst) = edge_arrays();
        let graph = ObjectGraph::new(src, dst);
        assert_eq!(26, graph.max_node());
        for list in EDGES {
            let expected: Vec<ObjectId> = list[1..].iter().copied().sorted().collect();
            assert_eq!(expected, sorted_out(&graph, list[0]), "node {}", list[0]);
        }
    }

    #[test]
    fn reverse_edges_mirror_forward() {
        let (src, dst) = edge_arrays();
        let graph = ObjectGraph::new(src.clone(), dst.clone());
        let mirror = ObjectGraph::new(dst, src);
        for node in 0..=graph.max_node() {
            assert_eq!(
                mirror.out_edges(node).sorted().collect_vec(),
                graph.in_edges(node).sorted().collect_vec(),
                "node {}",
                node
            );
        }
    }

    #[test]
    fn zero_targets_are_skipped() {
        // node 2 has targets {5, 0, 7}; the unresolved 0 must not surface
        let graph = ObjectGraph::new(vec![2, 2, 2, 3], vec![5, 0, 7, 2]);
        assert_eq!(vec![5, 7], sorted_out(&graph, 2));
        assert_eq!(vec![2], sorted_out(&graph, 3));
        // a node whose only edge is unresolved yields nothing
        let graph = ObjectGraph::new(vec![4], vec![0]);
        assert_eq!(0, graph.out_edges(4).count());
    }

    #[test]
    fn nodes_without_edges() {
        let graph = ObjectGraph::new(vec![1], vec![2]);
        assert_eq!(0, graph.out_edges(2).count());
        assert_eq!(vec![1], graph.in_edges(2).collect_vec());
        // beyond the graph's node range: no edges rather than a panic
        assert_eq!(0, graph.out_edges(1000).count());
    }
}
