//! Function assembly: boundaries, instruction assignment, call collection.

use log::debug;

use crate::sweep::SweepResult;
use crate::{Address, Function};

/// Build the function set from sweep results.
///
/// Function boundaries are the half-open ranges between consecutive
/// candidate starts; the last function runs to `segment_end`. The entry
/// point's function is named `entry`, every other one `sub_<HEXADDR>`.
pub fn assemble_functions(
    result: &SweepResult,
    entry_point: Address,
    segment_end: Address,
) -> Vec<Function> {
    let starts: Vec<Address> = result.function_starts.iter().copied().collect();

    let mut functions: Vec<Function> = Vec::with_capacity(starts.len());
    for (i, &start) in starts.iter().enumerate() {
        let name = if start == entry_point {
            "entry".to_string()
        } else {
            format!("sub_{start:X}")
        };
        let mut func = Function::new(&name, start);
        func.end_address = starts.get(i + 1).copied().unwrap_or(segment_end);
        functions.push(func);
    }

    // Every instruction belongs to at most one function; the ranges are
    // disjoint, so a binary search on start address finds the owner.
    for insn in &result.instructions {
        let idx = match starts.binary_search(&insn.address) {
            Ok(i) => i,
            Err(0) => {
                debug!("instruction at 0x{:X} precedes first function, unassigned", insn.address);
                continue;
            }
            Err(i) => i - 1,
        };
        let func = &mut functions[idx];
        if !func.contains(insn.address) {
            continue;
        }
        if insn.mnemonic == "call" {
            if let Some(target) = insn.branch_target() {
                func.calls.push(target);
            }
        }
        func.instructions.push(insn.clone());
    }

    functions
}
