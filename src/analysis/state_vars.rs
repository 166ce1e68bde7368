//! State-variable discovery and transition analysis.
//!
//! A memory cell written with several distinct immediates and compared
//! against immediates elsewhere behaves like a state variable. This pass
//! finds those cells, builds a transition graph per cell (read value to
//! written value, within a function or through its calls), and marks the
//! entry and exit values.

use std::collections::{BTreeMap, BTreeSet};

use log::info;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::Direction;

use crate::analysis::Analyzer;
use crate::{Address, Function, Instruction};

/// Minimum distinct written values for a cell to count as a state variable.
const MIN_DISTINCT_WRITES: usize = 2;

/// Transition summary for one state variable.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StateVariable {
    /// Every value seen in a write or comparison
    pub values: BTreeSet<i64>,
    /// (from, to) transition pairs
    pub transitions: BTreeSet<(i64, i64)>,
    /// Values never produced by a transition
    pub entry_states: BTreeSet<i64>,
    /// Values never consumed by a transition
    pub exit_states: BTreeSet<i64>,
    /// Functions that write this variable
    pub writers: BTreeSet<Address>,
}

/// Finds state variables and annotates the functions driving them.
#[derive(Debug, Default)]
pub struct StateVarAnalyzer {
    state_vars: BTreeMap<Address, StateVariable>,
}

impl StateVarAnalyzer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state_vars(&self) -> &BTreeMap<Address, StateVariable> {
        &self.state_vars
    }
}

/// `mov <size> ptr [0xNNNN], imm` destination and value.
fn immediate_write(insn: &Instruction) -> Option<(Address, i64)> {
    if insn.mnemonic != "mov" || !insn.operands.contains("ptr [") {
        return None;
    }
    let (dest, src) = insn.operands.split_once(',')?;
    let addr = memory_operand(dest)?;
    let value = crate::parse_immediate(src)?;
    Some((addr, value))
}

/// `cmp <size> ptr [0xNNNN], imm` source and value.
fn immediate_compare(insn: &Instruction) -> Option<(Address, i64)> {
    if insn.mnemonic != "cmp" || !insn.operands.contains("ptr [") {
        return None;
    }
    let (lhs, rhs) = insn.operands.split_once(',')?;
    let addr = memory_operand(lhs)?;
    let value = crate::parse_immediate(rhs)?;
    Some((addr, value))
}

fn memory_operand(s: &str) -> Option<Address> {
    let inner = s.split('[').nth(1)?.split(']').next()?.trim();
    crate::parse_literal_address(inner)
}

impl Analyzer for StateVarAnalyzer {
    fn name(&self) -> &'static str {
        "state-variables"
    }

    fn analyze(&mut self, functions: &mut [Function]) -> bool {
        // Per-function read and write sets for every written cell.
        let mut writes: BTreeMap<Address, BTreeMap<Address, BTreeSet<i64>>> = BTreeMap::new();
        let mut reads: BTreeMap<Address, BTreeMap<Address, BTreeSet<i64>>> = BTreeMap::new();
        for func in functions.iter() {
            for insn in &func.instructions {
                if let Some((cell, value)) = immediate_write(insn) {
                    writes
                        .entry(cell)
                        .or_default()
                        .entry(func.start_address)
                        .or_default()
                        .insert(value);
                }
                if let Some((cell, value)) = immediate_compare(insn) {
                    reads
                        .entry(cell)
                        .or_default()
                        .entry(func.start_address)
                        .or_default()
                        .insert(value);
                }
            }
        }

        self.state_vars.clear();
        for (&cell, writers) in &writes {
            let distinct: BTreeSet<i64> = writers.values().flatten().copied().collect();
            if distinct.len() < MIN_DISTINCT_WRITES || !reads.contains_key(&cell) {
                continue;
            }

            let cell_reads = &reads[&cell];
            let mut graph: DiGraph<i64, ()> = DiGraph::new();
            let mut nodes: BTreeMap<i64, NodeIndex> = BTreeMap::new();
            let mut values: BTreeSet<i64> = distinct.clone();
            values.extend(cell_reads.values().flatten().copied());
            for &v in &values {
                nodes.insert(v, graph.add_node(v));
            }

            // A function that both reads and writes the cell transitions
            // from each read value to each written value.
            for func in functions.iter() {
                let addr = func.start_address;
                let func_reads = cell_reads.get(&addr).cloned().unwrap_or_default();
                let func_writes = writers.get(&addr).cloned().unwrap_or_default();
                if !func_reads.is_empty() && !func_writes.is_empty() {
                    for &from in &func_reads {
                        for &to in &func_writes {
                            graph.update_edge(nodes[&from], nodes[&to], ());
                        }
                    }
                }
                // Readers that write nothing themselves transition through
                // the state-writing functions they call.
                if !func_reads.is_empty() && func_writes.is_empty() {
                    for &callee in &func.calls {
                        if let Some(callee_writes) = writers.get(&callee) {
                            for &from in &func_reads {
                                for &to in callee_writes {
                                    graph.update_edge(nodes[&from], nodes[&to], ());
                                }
                            }
                        }
                    }
                }
            }

            let mut var = StateVariable {
                values,
                writers: writers.keys().copied().collect(),
                ..Default::default()
            };
            for edge in graph.raw_edges() {
                var.transitions
                    .insert((graph[edge.source()], graph[edge.target()]));
            }
            for (&value, &idx) in &nodes {
                if graph.neighbors_directed(idx, Direction::Incoming).count() == 0 {
                    var.entry_states.insert(value);
                }
                if graph.neighbors_directed(idx, Direction::Outgoing).count() == 0 {
                    var.exit_states.insert(value);
                }
            }
            self.state_vars.insert(cell, var);
        }
        info!("identified {} state variables", self.state_vars.len());

        // Annotate writer functions.
        for func in functions.iter_mut() {
            for (&cell, var) in &self.state_vars {
                if !var.writers.contains(&func.start_address) {
                    continue;
                }
                let written: Vec<String> = func
                    .instructions
                    .iter()
                    .filter_map(immediate_write)
                    .filter(|(c, _)| *c == cell)
                    .map(|(_, v)| v.to_string())
                    .collect();
                if written.is_empty() {
                    continue;
                }
                if func.purpose.is_none() {
                    func.purpose = Some(if written.len() == 1 {
                        format!("Transitions state 0x{cell:X} to {}", written[0])
                    } else {
                        format!(
                            "State handler for 0x{cell:X}: {}",
                            written.join(", ")
                        )
                    });
                }
                let comment = format!("Sets state 0x{cell:X} to: {}", written.join(", "));
                if !func.comments.contains(&comment) {
                    func.comments.push(comment);
                }
            }
        }
        true
    }
}
