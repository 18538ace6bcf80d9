use std::collections::BTreeSet;

use anyhow::{Result, ensure};

use crate::message::NodeId;

/// Undirected tree over nodes `0..len`.
///
/// Edges are checked as they are added, so the graph never holds a cycle.
/// It is a tree once [`TreeTopology::validate`] passes.
#[derive(Debug, Default, Clone)]
pub struct TreeTopology {
    len: u64,
    edges: BTreeSet<(NodeId, NodeId)>,
}

impl TreeTopology {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds `count` nodes and returns the id range they got.
    pub fn grow(&mut self, count: u64) -> std::ops::Range<NodeId> {
        let first = self.len;
        self.len += count;
        first..self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn contains(&self, id: NodeId) -> bool {
        id < self.len
    }

    pub fn add_edge(&mut self, a: NodeId, b: NodeId) -> Result<()> {
        ensure!(a != b, "node {a} cannot be its own neighbor");
        ensure!(self.contains(a), "node {a} does not exist");
        ensure!(self.contains(b), "node {b} does not exist");
        let edge = (a.min(b), a.max(b));
        ensure!(!self.edges.contains(&edge), "nodes {a} and {b} are already connected");
        ensure!(
            !self.connected(a, b),
            "connecting {a} and {b} would close a cycle"
        );
        self.edges.insert(edge);
        Ok(())
    }

    pub fn neighbors(&self, id: NodeId) -> impl Iterator<Item = NodeId> + '_ {
        self.edges.iter().filter_map(move |&(a, b)| {
            if a == id {
                Some(b)
            } else if b == id {
                Some(a)
            } else {
                None
            }
        })
    }

    /// Checks that every node is reachable from every other one.
    pub fn validate(&self) -> Result<()> {
        ensure!(!self.is_empty(), "no nodes have been created");
        // Acyclic by construction, so n - 1 edges means connected.
        ensure!(
            self.edges.len() as u64 == self.len - 1,
            "tree is not connected: {} nodes but {} edges",
            self.len,
            self.edges.len()
        );
        Ok(())
    }

    fn connected(&self, from: NodeId, to: NodeId) -> bool {
        let mut seen = BTreeSet::from([from]);
        let mut stack = vec![from];
        while let Some(current) = stack.pop() {
            if current == to {
                return true;
            }
            for next in self.neighbors(current) {
                if seen.insert(next) {
                    stack.push(next);
                }
            }
        }
        false
    }
}
