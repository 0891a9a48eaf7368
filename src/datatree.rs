//! DataTree - Novel prefix generation and search space bookkeeping
//!
//! The tree is a trie over every buffer the runner has executed. Each edge is one byte,
//! each node knows which bytes are legal at that position (all 256, a masked range for
//! `draw_bits`, or a single forced byte) and whether anything new can still be found
//! below it.
//!
//! Key components:
//! - Recording: inserts an executed path, stores its conclusion and propagates dead-ness
//! - Novel prefix generation: random walk that stops at the first unexplored edge
//! - Lookup: answers a buffer from a previously concluded path without running the test
//!
//! A node is *dead* once no continuation through it can produce a new execution. Leaves
//! that concluded (anything but an overrun) are dead, so are nodes at or below the
//! generation depth, and a node becomes dead once all of its legal edges are explored and
//! lead to dead children. Once the root is dead the search space is exhausted.

use std::collections::{BTreeMap, HashMap};

use log::warn;
use rand::seq::SliceRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::data::{ConjectureResult, InterestingOrigin, Status};

/// Index of a node in the tree's arena
pub type NodeId = usize;

const ROOT: NodeId = 0;

/// How an execution through a node ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Conclusion {
    pub status: Status,
    pub interesting_origin: Option<InterestingOrigin>,
}

/// Result of walking a buffer through the tree
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathLookup {
    /// The buffer extends a concluded path; the canonical bytes of that path
    Concluded(Vec<u8>),
    /// The buffer ends where the test is known to draw more
    Overrun,
    /// The tree cannot tell what the test would do
    Unknown,
}

/// Statistics about tree exploration for analysis and debugging
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TreeStats {
    pub total_nodes: usize,
    pub conclusion_nodes: usize,
    pub dead_nodes: usize,
    pub novel_prefixes_generated: usize,
    pub flaky_paths: usize,
}

/// Most nodes have zero or one child, so only branching nodes pay for a map.
#[derive(Debug, Clone, Default)]
enum Edges {
    #[default]
    Empty,
    Single(u8, NodeId),
    Many(Box<BTreeMap<u8, NodeId>>),
}

impl Edges {
    fn get(&self, byte: u8) -> Option<NodeId> {
        match self {
            Edges::Empty => None,
            Edges::Single(b, id) => (*b == byte).then_some(*id),
            Edges::Many(map) => map.get(&byte).copied(),
        }
    }

    fn insert(&mut self, byte: u8, id: NodeId) {
        match self {
            Edges::Empty => *self = Edges::Single(byte, id),
            Edges::Single(b, existing) => {
                let mut map = BTreeMap::new();
                map.insert(*b, *existing);
                map.insert(byte, id);
                *self = Edges::Many(Box::new(map));
            }
            Edges::Many(map) => {
                map.insert(byte, id);
            }
        }
    }

    fn len(&self) -> usize {
        match self {
            Edges::Empty => 0,
            Edges::Single(..) => 1,
            Edges::Many(map) => map.len(),
        }
    }

    fn is_empty(&self) -> bool {
        matches!(self, Edges::Empty)
    }

    fn children(&self) -> Box<dyn Iterator<Item = NodeId> + '_> {
        match self {
            Edges::Empty => Box::new(std::iter::empty()),
            Edges::Single(_, id) => Box::new(std::iter::once(*id)),
            Edges::Many(map) => Box::new(map.values().copied()),
        }
    }
}

#[derive(Debug, Clone)]
struct TreeNode {
    edges: Edges,
    /// Largest legal byte at this position
    max_byte: u8,
    forced: Option<u8>,
    dead: bool,
}

impl TreeNode {
    fn new(dead: bool) -> Self {
        Self {
            edges: Edges::Empty,
            max_byte: u8::MAX,
            forced: None,
            dead,
        }
    }

    fn is_saturated(&self) -> bool {
        match self.forced {
            Some(_) => !self.edges.is_empty(),
            None => self.edges.len() == self.max_byte as usize + 1,
        }
    }

    fn is_legal(&self, byte: u8) -> bool {
        match self.forced {
            Some(forced) => byte == forced,
            None => byte <= self.max_byte,
        }
    }
}

/// Trie of executed buffers with dead-subtree tracking
#[derive(Debug, Clone)]
pub struct DataTree {
    nodes: Vec<TreeNode>,
    conclusions: HashMap<NodeId, Conclusion>,
    generation_depth: usize,
    stats: TreeStats,
}

impl DataTree {
    /// Create an empty tree. Novel prefixes never reach `generation_depth` bytes.
    pub fn new(generation_depth: usize) -> Self {
        let mut tree = Self {
            nodes: Vec::new(),
            conclusions: HashMap::new(),
            generation_depth,
            stats: TreeStats::default(),
        };
        tree.push_node(0);
        tree
    }

    pub fn root(&self) -> NodeId {
        ROOT
    }

    /// Child reached from `node` along `byte`, if that edge has been explored.
    pub fn child(&self, node: NodeId, byte: u8) -> Option<NodeId> {
        self.nodes.get(node).and_then(|n| n.edges.get(byte))
    }

    pub fn is_dead(&self, node: NodeId) -> bool {
        self.nodes.get(node).map_or(false, |n| n.dead)
    }

    pub fn conclusion(&self, node: NodeId) -> Option<Conclusion> {
        self.conclusions.get(&node).copied()
    }

    /// True once every reachable behavior has been explored.
    pub fn is_exhausted(&self) -> bool {
        self.nodes[ROOT].dead
    }

    pub fn stats(&self) -> &TreeStats {
        &self.stats
    }

    /// Insert the path of a finished execution.
    ///
    /// The whole path is inserted even below nodes that are dead by depth: [`lookup`](Self::lookup)
    /// and the flakiness checks need the conclusion at its end.
    pub fn record(&mut self, result: &ConjectureResult) {
        let mut node = ROOT;
        let mut path = vec![ROOT];

        for (depth, &byte) in result.buffer.iter().enumerate() {
            if self.conclusions.contains_key(&node) {
                self.flaky(&result.buffer, depth);
                return;
            }

            let current = &mut self.nodes[node];
            current.max_byte = result.capped.get(&depth).copied().unwrap_or(u8::MAX);
            current.forced = result.forced.contains(&depth).then_some(byte);

            node = match self.nodes[node].edges.get(byte) {
                Some(child) => child,
                None => {
                    let child = self.push_node(depth + 1);
                    self.nodes[node].edges.insert(byte, child);
                    child
                }
            };
            path.push(node);
        }

        if result.status != Status::Overrun {
            let conclusion = Conclusion {
                status: result.status,
                interesting_origin: result.interesting_origin,
            };
            match self.conclusions.get(&node) {
                Some(existing) if *existing != conclusion => {
                    self.flaky(&result.buffer, result.buffer.len());
                    return;
                }
                Some(_) => {}
                None => {
                    if !self.nodes[node].edges.is_empty() {
                        self.flaky(&result.buffer, result.buffer.len());
                        return;
                    }
                    self.conclusions.insert(node, conclusion);
                    self.stats.conclusion_nodes += 1;
                }
            }
            self.kill(node);
        }

        for &id in path.iter().rev() {
            if self.nodes[id].dead {
                continue;
            }
            let n = &self.nodes[id];
            if n.is_saturated() && n.edges.children().all(|c| self.nodes[c].dead) {
                self.kill(id);
            } else {
                break;
            }
        }
    }

    /// Random prefix that ends on an edge no recorded execution has taken.
    ///
    /// Returns `None` once the tree is exhausted.
    pub fn generate_novel_prefix<R: Rng + ?Sized>(&mut self, rng: &mut R) -> Option<Vec<u8>> {
        if self.is_exhausted() {
            return None;
        }
        self.stats.novel_prefixes_generated += 1;

        let mut prefix = Vec::new();
        let mut node = ROOT;
        loop {
            let current = &self.nodes[node];
            let byte = match current.forced {
                Some(forced) => forced,
                None => {
                    let byte = rng.gen_range(0..=current.max_byte);
                    match current.edges.get(byte) {
                        Some(child) if self.nodes[child].dead => {
                            let options: Vec<u8> = (0..=current.max_byte)
                                .filter(|&b| current.edges.get(b).map_or(true, |c| !self.nodes[c].dead))
                                .collect();
                            *options.choose(rng)?
                        }
                        _ => byte,
                    }
                }
            };
            prefix.push(byte);
            match current.edges.get(byte) {
                Some(child) => node = child,
                None => return Some(prefix),
            }
        }
    }

    /// Walk `buffer` through the tree, applying forced bytes and masks as the test would.
    pub fn lookup(&self, buffer: &[u8]) -> PathLookup {
        let mut node = ROOT;
        let mut path = Vec::new();
        for &raw in buffer {
            if self.conclusions.contains_key(&node) {
                return PathLookup::Concluded(path);
            }
            let current = &self.nodes[node];
            let byte = current.forced.unwrap_or(raw & current.max_byte);
            if !current.is_legal(byte) {
                return PathLookup::Unknown;
            }
            match current.edges.get(byte) {
                Some(child) => {
                    path.push(byte);
                    node = child;
                }
                None => return PathLookup::Unknown,
            }
        }
        if self.conclusions.contains_key(&node) {
            PathLookup::Concluded(path)
        } else if !self.nodes[node].edges.is_empty() {
            PathLookup::Overrun
        } else {
            PathLookup::Unknown
        }
    }

    fn push_node(&mut self, depth: usize) -> NodeId {
        let dead = depth >= self.generation_depth;
        self.nodes.push(TreeNode::new(dead));
        self.stats.total_nodes += 1;
        if dead {
            self.stats.dead_nodes += 1;
        }
        self.nodes.len() - 1
    }

    fn kill(&mut self, node: NodeId) {
        if !self.nodes[node].dead {
            self.nodes[node].dead = true;
            self.stats.dead_nodes += 1;
        }
    }

    fn flaky(&mut self, buffer: &[u8], depth: usize) {
        self.stats.flaky_paths += 1;
        warn!(
            "inconsistent test behavior: execution of {} bytes disagrees with a recorded path at depth {}",
            buffer.len(),
            depth
        );
    }
}
