//! Per-function control-flow graph construction.

use std::collections::BTreeSet;

use log::warn;

use crate::{Address, BasicBlock, ControlFlowGraph, ExitKind, Function};

/// Build the CFG for a function and record its cyclomatic complexity.
///
/// Block starts are the function start, every in-function branch target,
/// and every address following a branch, call, or return. Successor edges
/// are only added when the target is an actual block start; anything else
/// (targets into data, mid-instruction, or outside the function) is
/// dropped with a warning.
pub fn build_cfg(func: &mut Function) {
    if func.instructions.is_empty() {
        func.cfg = None;
        return;
    }

    let addrs: BTreeSet<Address> = func.instructions.iter().map(|i| i.address).collect();

    let mut starts = BTreeSet::new();
    starts.insert(func.instructions[0].address);
    for insn in &func.instructions {
        match insn.exit_kind() {
            ExitKind::CondBranch | ExitKind::Jump => {
                if let Some(target) = insn.branch_target() {
                    if addrs.contains(&target) {
                        starts.insert(target);
                    }
                }
                if addrs.contains(&insn.end_address()) {
                    starts.insert(insn.end_address());
                }
            }
            ExitKind::Call | ExitKind::Return => {
                if addrs.contains(&insn.end_address()) {
                    starts.insert(insn.end_address());
                }
            }
            ExitKind::FallThrough => {}
        }
    }

    let mut cfg = ControlFlowGraph::new(func.start_address);
    let mut current: Option<BasicBlock> = None;
    for insn in &func.instructions {
        if starts.contains(&insn.address) {
            if let Some(block) = current.take() {
                cfg.blocks.insert(block.start_address, block);
            }
            current = Some(BasicBlock::new(insn.address));
        }
        if let Some(block) = current.as_mut() {
            block.instructions.push(insn.clone());
        }
    }
    if let Some(block) = current.take() {
        cfg.blocks.insert(block.start_address, block);
    }

    // Successor edges, validated against the block map.
    let block_starts: BTreeSet<Address> = cfg.blocks.keys().copied().collect();
    for block in cfg.blocks.values_mut() {
        let Some(terminal) = block.instructions.last() else {
            continue;
        };
        let fall = terminal.end_address();
        let target = terminal.branch_target();
        let mut candidates: Vec<Address> = Vec::new();
        match terminal.exit_kind() {
            ExitKind::CondBranch => {
                candidates.extend(target);
                candidates.push(fall);
            }
            ExitKind::Jump => candidates.extend(target),
            ExitKind::Call | ExitKind::FallThrough => candidates.push(fall),
            ExitKind::Return => {}
        }
        for t in candidates {
            if block_starts.contains(&t) {
                block.add_successor(t);
            } else {
                warn!(
                    "block 0x{:X}: successor 0x{t:X} is not a block start, dropped",
                    block.start_address
                );
            }
        }
    }

    func.complexity = cfg.complexity();
    func.cfg = Some(cfg);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Instruction;

    fn insn(addr: Address, size: usize, mnemonic: &str, operands: &str) -> Instruction {
        Instruction::new(addr, vec![0x90; size], mnemonic, operands)
    }

    fn func_with(instructions: Vec<Instruction>) -> Function {
        let start = instructions[0].address;
        let end = instructions.last().unwrap().end_address();
        let mut f = Function::new("sub_test", start);
        f.end_address = end;
        f.instructions = instructions;
        f
    }

    #[test]
    fn test_conditional_branch_splits_three_ways() {
        // 0x0: cmp ax, 0
        // 0x2: je 0x6      -> succs {0x6, 0x4}
        // 0x4: mov ax, 1   -> falls into 0x6
        // 0x6: ret
        let mut f = func_with(vec![
            insn(0x0, 2, "cmp", "ax, 0"),
            insn(0x2, 2, "je", "0x6"),
            insn(0x4, 2, "mov", "ax, 1"),
            insn(0x6, 1, "ret", ""),
        ]);
        build_cfg(&mut f);
        let cfg = f.cfg.as_ref().unwrap();

        assert_eq!(cfg.entry, 0x0);
        assert_eq!(cfg.blocks.len(), 3);
        assert_eq!(cfg.blocks[&0x0].successors, vec![0x6, 0x4]);
        assert_eq!(cfg.blocks[&0x4].successors, vec![0x6]);
        assert!(cfg.blocks[&0x6].successors.is_empty());
        // 3 nodes, 3 edges
        assert_eq!(f.complexity, 2);
    }

    #[test]
    fn test_blocks_partition_instructions() {
        let mut f = func_with(vec![
            insn(0x0, 2, "mov", "ax, 1"),
            insn(0x2, 2, "jne", "0x0"),
            insn(0x4, 2, "call", "0x100"),
            insn(0x6, 1, "ret", ""),
        ]);
        build_cfg(&mut f);
        let cfg = f.cfg.as_ref().unwrap();

        let total: usize = cfg.blocks.values().map(|b| b.instructions.len()).sum();
        assert_eq!(total, 4);
        for (start, block) in &cfg.blocks {
            assert_eq!(*start, block.start_address);
            assert_eq!(block.instructions[0].address, *start);
        }
    }

    #[test]
    fn test_call_gets_fallthrough_edge_only() {
        let mut f = func_with(vec![
            insn(0x0, 3, "call", "0x50"),
            insn(0x3, 1, "ret", ""),
        ]);
        build_cfg(&mut f);
        let cfg = f.cfg.as_ref().unwrap();
        assert_eq!(cfg.blocks[&0x0].successors, vec![0x3]);
    }

    #[test]
    fn test_unresolvable_target_dropped_without_edge() {
        // jump out of the function: no successor, no panic
        let mut f = func_with(vec![
            insn(0x0, 2, "jmp", "0x4000"),
            insn(0x2, 1, "ret", ""),
        ]);
        build_cfg(&mut f);
        let cfg = f.cfg.as_ref().unwrap();
        assert!(cfg.blocks[&0x0].successors.is_empty());
    }

    #[test]
    fn test_jump_into_middle_of_instruction_dropped() {
        // target 0x1 is inside the 2-byte instruction at 0x0
        let mut f = func_with(vec![
            insn(0x0, 2, "mov", "ax, 1"),
            insn(0x2, 2, "jmp", "0x1"),
        ]);
        build_cfg(&mut f);
        let cfg = f.cfg.as_ref().unwrap();
        assert!(cfg.blocks[&0x2].successors.is_empty());
    }

    #[test]
    fn test_empty_function_has_no_cfg() {
        let mut f = Function::new("sub_0", 0);
        build_cfg(&mut f);
        assert!(f.cfg.is_none());
    }

    #[test]
    fn test_do_while_back_edge() {
        // 0x0: dec ax; 0x1: jne 0x0; 0x3: ret
        let mut f = func_with(vec![
            insn(0x0, 1, "dec", "ax"),
            insn(0x1, 2, "jne", "0x0"),
            insn(0x3, 1, "ret", ""),
        ]);
        build_cfg(&mut f);
        let cfg = f.cfg.as_ref().unwrap();
        assert_eq!(cfg.blocks[&0x0].successors, vec![0x0, 0x3]);
    }
}
