//! Capstone-based 16-bit x86 real-mode decoder.

use std::fmt;

use capstone::arch::x86::ArchMode as X86Mode;
use capstone::prelude::BuildsCapstone;
use capstone::Capstone;

use crate::{Address, Instruction, InstructionDecoder};

/// Longest x86 encoding we ever hand to capstone at once.
const MAX_INSTRUCTION_SIZE: usize = 16;

/// Errors that can occur while building or using the decoder.
#[derive(Debug, thiserror::Error)]
pub enum DecoderError {
    /// Capstone error
    #[error("Capstone error: {0}")]
    Capstone(#[from] capstone::Error),
}

/// A capstone handle configured for 16-bit x86.
pub struct Real16Decoder {
    cs: Capstone,
}

// SAFETY: the capstone handle is only read through `disasm_count`, never
// reconfigured after construction.
unsafe impl Send for Real16Decoder {}
unsafe impl Sync for Real16Decoder {}

impl Real16Decoder {
    /// Build a real-mode decoder.
    pub fn new() -> Result<Self, DecoderError> {
        let cs = Capstone::new()
            .x86()
            .mode(X86Mode::Mode16)
            .detail(false)
            .build()?;
        Ok(Self { cs })
    }
}

impl fmt::Display for Real16Decoder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Real16Decoder")
    }
}

impl fmt::Debug for Real16Decoder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Real16Decoder").finish()
    }
}

impl InstructionDecoder for Real16Decoder {
    fn decode(&self, image: &[u8], at: Address) -> Option<Instruction> {
        let offset = at as usize;
        if offset >= image.len() {
            return None;
        }

        let end = (offset + MAX_INSTRUCTION_SIZE).min(image.len());
        let slice = &image[offset..end];

        // Decode exactly one instruction, telling capstone the absolute
        // address so branch operands are printed as absolute targets.
        let insns = self.cs.disasm_count(slice, at as u64, 1).ok()?;
        let i = insns.iter().next()?;
        if i.address() != at as u64 {
            return None;
        }

        Some(Instruction::new(
            at,
            i.bytes().to_vec(),
            i.mnemonic().unwrap_or(""),
            i.op_str().unwrap_or(""),
        ))
    }
}
