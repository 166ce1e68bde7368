//! Inter-procedural call-graph analysis.
//!
//! Builds a directed graph over the function set, derives entry points,
//! leaves, hubs, and call depths, groups related functions, and fills in
//! purpose annotations for functions whose role the graph makes obvious.

use std::collections::{BTreeMap, BTreeSet};

use log::{debug, info};
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::Direction;

use crate::analysis::Analyzer;
use crate::{Address, Function};

/// A function is a hub when more than this many functions call it.
const HIGHLY_CALLED_THRESHOLD: usize = 5;

/// Synchronous label propagation stops after this many rounds.
const MAX_PROPAGATION_ROUNDS: usize = 16;

/// Groups related functions given the call relation.
pub trait GroupingStrategy {
    fn name(&self) -> &'static str;

    /// Partition (or cover) the function set into named groups.
    fn group(
        &self,
        functions: &[Function],
        entry_points: &BTreeSet<Address>,
    ) -> BTreeMap<String, BTreeSet<Address>>;
}

/// Deterministic synchronous label propagation on the undirected
/// projection of the call graph. Every node starts as its own label;
/// each round a node adopts the most common label among its neighbors,
/// ties going to the smallest label.
pub struct LabelPropagation;

impl GroupingStrategy for LabelPropagation {
    fn name(&self) -> &'static str {
        "label-propagation"
    }

    fn group(
        &self,
        functions: &[Function],
        _entry_points: &BTreeSet<Address>,
    ) -> BTreeMap<String, BTreeSet<Address>> {
        let known: BTreeSet<Address> = functions.iter().map(|f| f.start_address).collect();
        let mut neighbors: BTreeMap<Address, BTreeSet<Address>> = BTreeMap::new();
        for f in functions {
            neighbors.entry(f.start_address).or_default();
            for &callee in &f.calls {
                if known.contains(&callee) && callee != f.start_address {
                    neighbors.entry(f.start_address).or_default().insert(callee);
                    neighbors.entry(callee).or_default().insert(f.start_address);
                }
            }
        }

        let mut labels: BTreeMap<Address, Address> =
            known.iter().map(|&a| (a, a)).collect();
        for _ in 0..MAX_PROPAGATION_ROUNDS {
            let mut next = labels.clone();
            let mut changed = false;
            for (&node, adj) in &neighbors {
                if adj.is_empty() {
                    continue;
                }
                let mut counts: BTreeMap<Address, usize> = BTreeMap::new();
                for n in adj {
                    *counts.entry(labels[n]).or_default() += 1;
                }
                // BTreeMap iteration is ascending, so ties resolve to the
                // smallest label.
                let best = counts
                    .iter()
                    .max_by(|a, b| a.1.cmp(b.1).then(b.0.cmp(a.0)))
                    .map(|(&l, _)| l)
                    .unwrap_or(labels[&node]);
                if best != labels[&node] {
                    next.insert(node, best);
                    changed = true;
                }
            }
            labels = next;
            if !changed {
                break;
            }
        }

        let name_of: BTreeMap<Address, &str> = functions
            .iter()
            .map(|f| (f.start_address, f.name.as_str()))
            .collect();
        let mut groups: BTreeMap<String, BTreeSet<Address>> = BTreeMap::new();
        for (&node, &label) in &labels {
            let name = name_of
                .get(&label)
                .map(|n| n.to_string())
                .unwrap_or_else(|| format!("group_{label:X}"));
            groups.entry(name).or_default().insert(node);
        }
        groups
    }
}

/// Fallback grouping: one bucket per entry point, filled by DFS over the
/// call relation in ascending entry order. The first entry to reach a
/// function claims it.
pub struct ReachabilityBuckets;

impl GroupingStrategy for ReachabilityBuckets {
    fn name(&self) -> &'static str {
        "reachability-buckets"
    }

    fn group(
        &self,
        functions: &[Function],
        entry_points: &BTreeSet<Address>,
    ) -> BTreeMap<String, BTreeSet<Address>> {
        let by_addr: BTreeMap<Address, &Function> =
            functions.iter().map(|f| (f.start_address, f)).collect();
        let mut claimed: BTreeSet<Address> = BTreeSet::new();
        let mut groups: BTreeMap<String, BTreeSet<Address>> = BTreeMap::new();

        for &entry in entry_points {
            let Some(entry_func) = by_addr.get(&entry) else {
                continue;
            };
            let group_name = entry_func
                .purpose
                .clone()
                .unwrap_or_else(|| entry_func.name.clone());
            let bucket = groups.entry(group_name).or_default();

            let mut to_visit = vec![entry];
            while let Some(current) = to_visit.pop() {
                if !claimed.insert(current) {
                    continue;
                }
                bucket.insert(current);
                if let Some(func) = by_addr.get(&current) {
                    for &call in &func.calls {
                        if by_addr.contains_key(&call) && !claimed.contains(&call) {
                            to_visit.push(call);
                        }
                    }
                }
            }
        }
        groups
    }
}

/// Call-graph analyzer; holds the derived sets for later reporting.
pub struct CallGraphAnalyzer {
    graph: DiGraph<Address, ()>,
    nodes: BTreeMap<Address, NodeIndex>,
    callers: BTreeMap<Address, BTreeSet<Address>>,
    entry_points: BTreeSet<Address>,
    leaves: BTreeSet<Address>,
    highly_called: BTreeSet<Address>,
    depths: BTreeMap<Address, u32>,
    groups: BTreeMap<String, BTreeSet<Address>>,
    strategy: Box<dyn GroupingStrategy>,
}

impl Default for CallGraphAnalyzer {
    fn default() -> Self {
        Self::new()
    }
}

impl CallGraphAnalyzer {
    pub fn new() -> Self {
        Self::with_strategy(Box::new(LabelPropagation))
    }

    pub fn with_strategy(strategy: Box<dyn GroupingStrategy>) -> Self {
        Self {
            graph: DiGraph::new(),
            nodes: BTreeMap::new(),
            callers: BTreeMap::new(),
            entry_points: BTreeSet::new(),
            leaves: BTreeSet::new(),
            highly_called: BTreeSet::new(),
            depths: BTreeMap::new(),
            groups: BTreeMap::new(),
            strategy,
        }
    }

    pub fn entry_points(&self) -> &BTreeSet<Address> {
        &self.entry_points
    }

    pub fn leaves(&self) -> &BTreeSet<Address> {
        &self.leaves
    }

    pub fn highly_called(&self) -> &BTreeSet<Address> {
        &self.highly_called
    }

    pub fn callers(&self, addr: Address) -> Option<&BTreeSet<Address>> {
        self.callers.get(&addr)
    }

    /// Maximum acyclic call-chain length from the function.
    pub fn call_depth(&self, addr: Address) -> Option<u32> {
        self.depths.get(&addr).copied()
    }

    pub fn groups(&self) -> &BTreeMap<String, BTreeSet<Address>> {
        &self.groups
    }

    fn build_graph(&mut self, functions: &[Function]) {
        self.graph = DiGraph::new();
        self.nodes.clear();
        self.callers.clear();
        for f in functions {
            let idx = self.graph.add_node(f.start_address);
            self.nodes.insert(f.start_address, idx);
        }
        for f in functions {
            let from = self.nodes[&f.start_address];
            for &callee in &f.calls {
                if let Some(&to) = self.nodes.get(&callee) {
                    self.graph.update_edge(from, to, ());
                    self.callers
                        .entry(callee)
                        .or_default()
                        .insert(f.start_address);
                }
            }
        }

        self.entry_points = functions
            .iter()
            .map(|f| f.start_address)
            .filter(|a| !self.callers.contains_key(a))
            .collect();
        self.leaves = functions
            .iter()
            .filter(|f| f.calls.is_empty())
            .map(|f| f.start_address)
            .collect();
        self.highly_called = self
            .callers
            .iter()
            .filter(|(_, callers)| callers.len() > HIGHLY_CALLED_THRESHOLD)
            .map(|(&a, _)| a)
            .collect();

        info!(
            "call graph: {} functions, {} entry points, {} leaves, {} hubs",
            functions.len(),
            self.entry_points.len(),
            self.leaves.len(),
            self.highly_called.len()
        );
    }

    fn compute_depths(&mut self, functions: &[Function]) {
        self.depths.clear();
        for f in functions {
            let mut visited = BTreeSet::new();
            let depth = self.dfs_depth(f.start_address, 0, &mut visited);
            self.depths.insert(f.start_address, depth);
        }
    }

    /// Visited-guarded DFS depth; cycles contribute no extra depth.
    fn dfs_depth(&self, addr: Address, depth: u32, visited: &mut BTreeSet<Address>) -> u32 {
        if !visited.insert(addr) {
            return depth;
        }
        let Some(&idx) = self.nodes.get(&addr) else {
            return depth;
        };
        let mut max_depth = depth;
        for succ in self.graph.neighbors_directed(idx, Direction::Outgoing) {
            let callee = self.graph[succ];
            if !visited.contains(&callee) {
                max_depth = max_depth.max(self.dfs_depth(callee, depth + 1, visited));
            }
        }
        max_depth
    }

    /// Fill in `purpose` for functions whose graph role is clear. Only
    /// empty purposes are written, so a second run is a no-op.
    fn annotate_purposes(&self, functions: &mut [Function]) {
        for f in functions.iter_mut() {
            if f.calls.contains(&f.start_address) {
                f.is_recursive = true;
                if f.purpose.is_none() {
                    f.purpose = Some("Recursive function".to_string());
                }
            }
        }
        for f in functions.iter_mut() {
            if f.purpose.is_some() {
                continue;
            }
            let addr = f.start_address;
            if self.highly_called.contains(&addr) {
                let count = self.callers.get(&addr).map(BTreeSet::len).unwrap_or(0);
                f.purpose = Some(format!(
                    "Utility function called by {count} other functions"
                ));
            } else if self.entry_points.contains(&addr) && !f.calls.is_empty() {
                f.purpose = Some("Entry point or major subsystem".to_string());
            } else if self.leaves.contains(&addr) {
                f.purpose = Some("Leaf function (performs simple operation)".to_string());
            }
        }
    }
}

impl Analyzer for CallGraphAnalyzer {
    fn name(&self) -> &'static str {
        "call-graph"
    }

    fn analyze(&mut self, functions: &mut [Function]) -> bool {
        self.build_graph(functions);
        self.compute_depths(functions);
        self.groups = self.strategy.group(functions, &self.entry_points);
        debug!(
            "{} produced {} function groups",
            self.strategy.name(),
            self.groups.len()
        );
        self.annotate_purposes(functions);
        true
    }
}
