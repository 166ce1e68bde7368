//! Linear-sweep disassembly and function-start candidate discovery.

use std::collections::BTreeSet;

use log::{debug, warn};

use crate::parser::Segment;
use crate::{Address, Instruction, InstructionDecoder};

/// Output of one sweep over a code segment.
#[derive(Debug, Clone)]
pub struct SweepResult {
    /// Every byte of the segment, as instructions or raw-data bytes,
    /// in ascending address order
    pub instructions: Vec<Instruction>,
    /// Candidate function start addresses, sorted
    pub function_starts: BTreeSet<Address>,
}

/// Disassemble a code segment with a linear sweep.
///
/// Undecodable bytes degrade to one-byte `db` pseudo-instructions, so the
/// result covers the segment byte-for-byte with no gaps or overlaps.
/// Function-start candidates come from the entry point, `push bp` /
/// `mov bp, sp` prologues, and literal `call` targets. Candidates that
/// land mid-instruction in the swept stream are dropped.
pub fn sweep(
    image: &[u8],
    segment: &Segment,
    entry_point: Address,
    decoder: &dyn InstructionDecoder,
) -> SweepResult {
    let start = segment.start;
    let end = segment.start + segment.size as Address;
    debug!("sweeping segment {} [0x{start:X}, 0x{end:X})", segment.name);

    let mut instructions = Vec::new();
    let mut function_starts = BTreeSet::new();

    if (start..end).contains(&entry_point) {
        function_starts.insert(entry_point);
    } else {
        warn!("entry point 0x{entry_point:X} outside code segment, dropped");
    }

    let mut at = start;
    while at < end {
        let insn = match decoder.decode(image, at) {
            // A decode that runs past the segment boundary is torn; treat
            // the byte as data.
            Some(i) if i.end_address() <= end && i.size() > 0 => i,
            _ => {
                debug!("undecodable byte at 0x{at:X}, emitting raw data");
                Instruction::raw_byte(at, image[at as usize])
            }
        };

        match insn.mnemonic.as_str() {
            "call" => {
                if let Some(target) = insn.branch_target() {
                    if (start..end).contains(&target) {
                        function_starts.insert(target);
                    } else {
                        warn!(
                            "call at 0x{:X} targets 0x{target:X} outside segment, dropped",
                            insn.address
                        );
                    }
                } else {
                    debug!("indirect call at 0x{:X}: {}", insn.address, insn.operands);
                }
            }
            "int" => {
                debug!("interrupt at 0x{:X}: int {}", insn.address, insn.operands);
            }
            _ => {}
        }

        at = insn.end_address();
        instructions.push(insn);
    }

    // Prologue scan over adjacent pairs: push bp; mov bp, sp
    for pair in instructions.windows(2) {
        let (first, second) = (&pair[0], &pair[1]);
        if first.mnemonic == "push"
            && first.operands == "bp"
            && second.mnemonic == "mov"
            && second.operands.starts_with("bp, sp")
        {
            debug!("function prologue at 0x{:X}", first.address);
            function_starts.insert(first.address);
        }
    }

    // A call into the middle of another instruction cannot seed a
    // function; its start would never match a decoded block.
    let aligned: BTreeSet<Address> = instructions.iter().map(|i| i.address).collect();
    function_starts.retain(|s| {
        if aligned.contains(s) {
            true
        } else {
            warn!("candidate 0x{s:X} does not align with the instruction stream, dropped");
            false
        }
    });

    SweepResult {
        instructions,
        function_starts,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decoder::Real16Decoder;
    use crate::parser::SegmentKind;

    fn code_segment(start: Address, size: usize) -> Segment {
        Segment::new("CODE", start, size, SegmentKind::Code)
    }

    fn run_sweep(payload: &[u8], entry: Address) -> SweepResult {
        let decoder = Real16Decoder::new().unwrap();
        let segment = code_segment(0, payload.len());
        sweep(payload, &segment, entry, &decoder)
    }

    /// Instructions must tile the swept range exactly.
    fn assert_covers(result: &SweepResult, start: Address, end: Address) {
        let mut at = start;
        for insn in &result.instructions {
            assert_eq!(insn.address, at, "gap or overlap at 0x{at:X}");
            at = insn.end_address();
        }
        assert_eq!(at, end);
    }

    #[test]
    fn test_sweep_covers_every_byte() {
        // nop; mov ax, 0x1234; ret
        let payload = [0x90, 0xB8, 0x34, 0x12, 0xC3];
        let result = run_sweep(&payload, 0);
        assert_covers(&result, 0, payload.len() as Address);
        assert_eq!(result.instructions.len(), 3);
    }

    #[test]
    fn test_truncated_tail_degrades_to_raw_data() {
        // ret, then a mov opcode with its immediate cut off
        let payload = [0xC3, 0xB8];
        let result = run_sweep(&payload, 0);
        assert_covers(&result, 0, 2);
        assert!(result.instructions[1].is_raw_data());
        assert_eq!(result.instructions[1].bytes, vec![0xB8]);
    }

    #[test]
    fn test_prologue_candidate() {
        // push bp; mov bp, sp; pop bp; ret
        let payload = [0x55, 0x89, 0xE5, 0x5D, 0xC3];
        let result = run_sweep(&payload, 0);
        assert!(result.function_starts.contains(&0));
    }

    #[test]
    fn test_call_target_candidate() {
        // 0x0: call 0x4; 0x3: ret; 0x4: ret
        let payload = [0xE8, 0x01, 0x00, 0xC3, 0xC3];
        let result = run_sweep(&payload, 0);
        assert!(result.function_starts.contains(&0x4));
    }

    #[test]
    fn test_out_of_segment_call_target_dropped() {
        // call 0x1003 from a 5-byte segment
        let payload = [0xE8, 0x00, 0x10, 0xC3, 0xC3];
        let result = run_sweep(&payload, 0);
        assert_eq!(result.function_starts.iter().copied().collect::<Vec<_>>(), vec![0]);
    }

    #[test]
    fn test_misaligned_call_target_dropped() {
        // 0x0: call 0x4; 0x3: mov ax, 0x1234; 0x6: ret
        // the call lands inside the mov, so 0x4 is not a function start
        let payload = [0xE8, 0x01, 0x00, 0xB8, 0x34, 0x12, 0xC3];
        let result = run_sweep(&payload, 0);
        assert_eq!(result.function_starts.iter().copied().collect::<Vec<_>>(), vec![0]);
    }

    #[test]
    fn test_entry_outside_segment_dropped() {
        let payload = [0xC3];
        let result = run_sweep(&payload, 0x5000);
        assert!(result.function_starts.is_empty());
    }
}
