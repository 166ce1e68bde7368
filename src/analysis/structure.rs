//! Recovery of loops, conditionals, and switches from function CFGs.

use std::collections::{BTreeMap, BTreeSet};

use log::debug;

use crate::analysis::Analyzer;
use crate::{
    Address, BasicBlock, ControlFlowGraph, ExitKind, Function, HigherLevelStructure, LoopKind,
};

/// Recovers higher-level control structures for every function.
#[derive(Debug, Default)]
pub struct StructureAnalyzer;

impl StructureAnalyzer {
    pub fn new() -> Self {
        StructureAnalyzer
    }
}

impl Analyzer for StructureAnalyzer {
    fn name(&self) -> &'static str {
        "structure"
    }

    fn analyze(&mut self, functions: &mut [Function]) -> bool {
        for func in functions.iter_mut() {
            if let Some(cfg) = func.cfg.as_ref() {
                func.structures = recover_structures(cfg);
                debug!(
                    "{}: recovered {} structures",
                    func.name,
                    func.structures.len()
                );
            }
        }
        true
    }
}

/// Recover all structures from one CFG. The result is fully determined by
/// the CFG, so re-running replaces the list with an identical one.
pub fn recover_structures(cfg: &ControlFlowGraph) -> Vec<HigherLevelStructure> {
    let mut structures = Vec::new();

    let back_edges = find_back_edges(cfg);
    let mut loop_sources: BTreeSet<Address> = BTreeSet::new();
    for (header, source, body) in &back_edges {
        loop_sources.insert(*source);
        let exits = loop_exits(cfg, body);
        let kind = classify_loop(cfg, *header, *source);
        structures.push(HigherLevelStructure::Loop {
            header: *header,
            body: body.clone(),
            exits,
            kind,
        });
    }

    let (switches, switch_blocks) = find_switches(cfg);
    structures.extend(switches);

    for (start, block) in &cfg.blocks {
        if loop_sources.contains(start) || switch_blocks.contains(start) {
            continue;
        }
        if let Some(cond) = recover_conditional(cfg, block) {
            structures.push(cond);
        }
    }

    structures
}

/// Back edges found by a DFS with an explicit stack: an edge to a block
/// still on the traversal path closes a loop, whose body is the path
/// segment from the target (header) down to the edge's source.
fn find_back_edges(cfg: &ControlFlowGraph) -> Vec<(Address, Address, Vec<Address>)> {
    let mut back_edges = Vec::new();
    if !cfg.blocks.contains_key(&cfg.entry) {
        return back_edges;
    }

    let mut visited: BTreeSet<Address> = BTreeSet::new();
    let mut path: Vec<Address> = vec![cfg.entry];
    let mut on_path: BTreeSet<Address> = path.iter().copied().collect();
    let mut stack: Vec<(Address, usize)> = vec![(cfg.entry, 0)];

    while let Some(&mut (node, ref mut next_idx)) = stack.last_mut() {
        let succs = &cfg.blocks[&node].successors;
        if let Some(&succ) = succs.get(*next_idx) {
            *next_idx += 1;
            if on_path.contains(&succ) {
                let pos = path.iter().position(|&a| a == succ).unwrap();
                back_edges.push((succ, node, path[pos..].to_vec()));
            } else if !visited.contains(&succ) && cfg.blocks.contains_key(&succ) {
                path.push(succ);
                on_path.insert(succ);
                stack.push((succ, 0));
            }
        } else {
            visited.insert(node);
            on_path.remove(&node);
            path.pop();
            stack.pop();
        }
    }
    back_edges
}

/// Addresses outside the body that body blocks branch to.
fn loop_exits(cfg: &ControlFlowGraph, body: &[Address]) -> Vec<Address> {
    let body_set: BTreeSet<Address> = body.iter().copied().collect();
    let mut exits = Vec::new();
    for addr in body {
        if let Some(block) = cfg.blocks.get(addr) {
            for &succ in &block.successors {
                if !body_set.contains(&succ) && !exits.contains(&succ) {
                    exits.push(succ);
                }
            }
        }
    }
    exits
}

fn classify_loop(cfg: &ControlFlowGraph, header: Address, source: Address) -> LoopKind {
    // A counter initialization heading the loop suggests `for`. This is a
    // weak textual heuristic and is wrong for loops whose init sits in a
    // predecessor block.
    if let Some(first) = cfg.blocks.get(&header).and_then(|b| b.instructions.first()) {
        let looks_like_init = match first.mnemonic.as_str() {
            "mov" => first
                .operands
                .split_once(',')
                .is_some_and(|(d, s)| {
                    is_register_name(d.trim()) && crate::parse_immediate(s).is_some()
                }),
            "xor" => first
                .operands
                .split_once(',')
                .is_some_and(|(d, s)| d.trim() == s.trim() && is_register_name(d.trim())),
            _ => false,
        };
        if looks_like_init {
            return LoopKind::For;
        }
    }

    // Conditional back edge straight to the header reads as do-while.
    if let Some(terminal) = cfg.blocks.get(&source).and_then(|b| b.terminal()) {
        if terminal.exit_kind() == ExitKind::CondBranch && terminal.branch_target() == Some(header)
        {
            return LoopKind::DoWhile;
        }
    }
    LoopKind::While
}

fn is_register_name(s: &str) -> bool {
    matches!(
        s,
        "ax" | "bx" | "cx" | "dx" | "si" | "di" | "bp" | "sp"
            | "al" | "ah" | "bl" | "bh" | "cl" | "ch" | "dl" | "dh"
    )
}

fn reachable_from(cfg: &ControlFlowGraph, start: Address) -> BTreeSet<Address> {
    let mut seen = BTreeSet::new();
    let mut stack = vec![start];
    while let Some(addr) = stack.pop() {
        if !seen.insert(addr) {
            continue;
        }
        if let Some(block) = cfg.blocks.get(&addr) {
            for &succ in &block.successors {
                if !seen.contains(&succ) {
                    stack.push(succ);
                }
            }
        }
    }
    seen
}

/// A conditional-branch block becomes a Conditional: the branch target
/// side is "true", the fall-through side "false", and the merge point is
/// the lowest-addressed block reachable from both.
fn recover_conditional(
    cfg: &ControlFlowGraph,
    block: &BasicBlock,
) -> Option<HigherLevelStructure> {
    let terminal = block.terminal()?;
    if terminal.exit_kind() != ExitKind::CondBranch || block.successors.len() != 2 {
        return None;
    }
    let true_start = terminal.branch_target()?;
    let false_start = *block.successors.iter().find(|&&s| s != true_start)?;

    let reach_true = reachable_from(cfg, true_start);
    let reach_false = reachable_from(cfg, false_start);
    let merge = reach_true.intersection(&reach_false).next().copied();
    let true_blocks: Vec<Address> = reach_true.difference(&reach_false).copied().collect();
    let false_blocks: Vec<Address> = reach_false.difference(&reach_true).copied().collect();

    Some(HigherLevelStructure::Conditional {
        cond_block: block.start_address,
        true_blocks,
        false_blocks,
        merge,
    })
}

/// Detect `cmp reg, imm` / `je target` dispatch chains. Two or more
/// consecutive comparisons against the same operand read as a switch; the
/// fall-through after the last comparison is taken as the default.
fn find_switches(
    cfg: &ControlFlowGraph,
) -> (Vec<HigherLevelStructure>, BTreeSet<Address>) {
    // Flatten the CFG back to address order for the chain scan.
    let instructions: Vec<_> = cfg
        .blocks
        .values()
        .flat_map(|b| b.instructions.iter())
        .collect();

    let mut switches = Vec::new();
    let mut claimed_blocks: BTreeSet<Address> = BTreeSet::new();

    let mut i = 0;
    while i + 1 < instructions.len() {
        let mut cases: BTreeMap<i64, Vec<Address>> = BTreeMap::new();
        let mut scrutinee: Option<String> = None;
        let mut chain_blocks: Vec<Address> = Vec::new();
        let mut j = i;
        let mut last_je_end: Option<Address> = None;

        while j + 1 < instructions.len() {
            let (cmp, je) = (instructions[j], instructions[j + 1]);
            if cmp.mnemonic != "cmp" || je.mnemonic != "je" {
                break;
            }
            let Some((lhs, rhs)) = cmp.operands.split_once(',') else {
                break;
            };
            let lhs = lhs.trim().to_string();
            let rhs = rhs.trim();
            let Some(value) = crate::parse_immediate(rhs) else {
                break;
            };
            if let Some(prev) = &scrutinee {
                if *prev != lhs {
                    break;
                }
            } else {
                scrutinee = Some(lhs);
            }
            let Some(target) = je.branch_target() else {
                break;
            };
            if cfg.blocks.contains_key(&target) {
                cases.entry(value).or_default().push(target);
            }
            chain_blocks.push(block_of(cfg, cmp.address));
            last_je_end = Some(je.end_address());
            // next pair must start right after this je
            match instructions.get(j + 2) {
                Some(next) if next.address == je.end_address() => j += 2,
                _ => {
                    j += 2;
                    break;
                }
            }
        }

        if cases.len() >= 2 {
            let default = last_je_end.filter(|a| cfg.blocks.contains_key(a));
            let cond_block = chain_blocks[0];
            claimed_blocks.extend(chain_blocks.iter().copied());
            if let Some(d) = default {
                claimed_blocks.remove(&d);
            }
            switches.push(HigherLevelStructure::Switch {
                cond_block,
                cases,
                default,
                merge: None,
            });
            i = j;
        } else {
            i += 1;
        }
    }

    (switches, claimed_blocks)
}

/// Start address of the block containing `addr`.
fn block_of(cfg: &ControlFlowGraph, addr: Address) -> Address {
    cfg.blocks
        .range(..=addr)
        .next_back()
        .map(|(&start, _)| start)
        .unwrap_or(addr)
}
