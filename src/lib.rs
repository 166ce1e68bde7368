//! Core IR, traits, and error types for the retrodec decompiler.
//!
//! retrodec lifts 16-bit DOS MZ executables into an analyzable model:
//! a decoded instruction stream, functions with control-flow graphs,
//! inferred variables, a call graph, and recovered high-level structures.
//!
//! # Basic Usage
//!
//! ```rust,no_run
//! use std::fs;
//! use retrodec::pipeline::{Decompiler, Options};
//!
//! let image = fs::read("GAME.EXE").unwrap();
//! let decompiler = Decompiler::new(image, "GAME.EXE", Options::default());
//! let report = decompiler.decompile().unwrap();
//! println!("{} functions", report.functions.len());
//! ```

pub mod analysis;
pub mod assemble;
pub mod cfg;
pub mod dataflow;
pub mod decoder;
pub mod format;
pub mod parser;
pub mod pipeline;
pub mod sweep;

use std::collections::BTreeMap;
use std::fmt;

use serde::Serialize;

/// An address inside the loaded executable image.
pub type Address = u32;

/// How an instruction leaves its basic block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitKind {
    /// Conditional branch: taken target plus fall-through
    CondBranch,
    /// Unconditional jump
    Jump,
    /// Call: control returns to the fall-through address
    Call,
    /// Return from function
    Return,
    /// Plain instruction, control continues linearly
    FallThrough,
}

/// One decoded instruction (or one byte of undecodable raw data).
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Instruction {
    /// Address of the instruction
    pub address: Address,
    /// Raw bytes of the instruction
    pub bytes: Vec<u8>,
    /// Instruction mnemonic (e.g. "mov", "jne")
    pub mnemonic: String,
    /// Operands as printed by the decoder
    pub operands: String,
    /// Analyzer-attached annotation, if any
    pub comment: Option<String>,
}

impl Instruction {
    pub fn new(address: Address, bytes: Vec<u8>, mnemonic: &str, operands: &str) -> Self {
        Self {
            address,
            bytes,
            mnemonic: mnemonic.to_string(),
            operands: operands.to_string(),
            comment: None,
        }
    }

    /// Pseudo-instruction for a byte the decoder could not interpret.
    pub fn raw_byte(address: Address, byte: u8) -> Self {
        Self::new(address, vec![byte], "db", &format!("0x{byte:02X}"))
    }

    /// Size of the instruction in bytes.
    pub fn size(&self) -> usize {
        self.bytes.len()
    }

    /// Address of the first byte after this instruction.
    pub fn end_address(&self) -> Address {
        self.address + self.bytes.len() as Address
    }

    /// True if this is a raw-data pseudo-instruction.
    pub fn is_raw_data(&self) -> bool {
        self.mnemonic == "db"
    }

    /// Classify how control leaves this instruction.
    pub fn exit_kind(&self) -> ExitKind {
        let m = self.mnemonic.as_str();
        match m {
            "jmp" => ExitKind::Jump,
            "call" => ExitKind::Call,
            "ret" | "retf" | "retn" | "iret" => ExitKind::Return,
            "loop" | "loope" | "loopne" | "jcxz" => ExitKind::CondBranch,
            _ if m.starts_with('j') => ExitKind::CondBranch,
            _ => ExitKind::FallThrough,
        }
    }

    /// Literal branch or call target, if the operand is a plain address.
    ///
    /// Indirect targets (`jmp bx`, `call word ptr [0x1234]`) yield `None`.
    pub fn branch_target(&self) -> Option<Address> {
        match self.exit_kind() {
            ExitKind::CondBranch | ExitKind::Jump | ExitKind::Call => {
                parse_literal_address(&self.operands)
            }
            _ => None,
        }
    }
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.operands.is_empty() {
            write!(f, "{}", self.mnemonic)
        } else {
            write!(f, "{} {}", self.mnemonic, self.operands)
        }
    }
}

/// Parse an operand string that is exactly one literal address.
///
/// Accepts `0x1F3A` or bare hex. Register operands are rejected because
/// every 16-bit register name contains a non-hex character.
pub fn parse_literal_address(operand: &str) -> Option<Address> {
    let s = operand.trim();
    let digits = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")).unwrap_or(s);
    if digits.is_empty() || !digits.chars().all(|c| c.is_ascii_hexdigit()) {
        return None;
    }
    Address::from_str_radix(digits, 16).ok()
}

/// Parse an immediate operand as printed by the decoder.
///
/// Values below 10 are printed in plain decimal, everything else as
/// `0x`-prefixed hex.
pub fn parse_immediate(operand: &str) -> Option<i64> {
    let s = operand.trim();
    if let Some(hex) = s.strip_prefix("0x") {
        i64::from_str_radix(hex, 16).ok()
    } else {
        s.parse().ok()
    }
}

/// Decoder trait: decode one instruction from an image.
pub trait InstructionDecoder: Send + Sync {
    /// Decode a single instruction at offset `at` into the image.
    ///
    /// Returns `None` when the bytes at `at` do not form a valid instruction.
    fn decode(&self, image: &[u8], at: Address) -> Option<Instruction>;
}

/// A maximal straight-line run of instructions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BasicBlock {
    /// Address of the first instruction
    pub start_address: Address,
    /// Instructions in execution order
    pub instructions: Vec<Instruction>,
    /// Start addresses of successor blocks
    pub successors: Vec<Address>,
}

impl BasicBlock {
    pub fn new(start_address: Address) -> Self {
        Self {
            start_address,
            instructions: Vec::new(),
            successors: Vec::new(),
        }
    }

    /// Add a successor edge, ignoring duplicates.
    pub fn add_successor(&mut self, target: Address) {
        if !self.successors.contains(&target) {
            self.successors.push(target);
        }
    }

    /// The instruction that ends the block.
    pub fn terminal(&self) -> Option<&Instruction> {
        self.instructions.last()
    }

    /// Address of the first byte after the block.
    pub fn end_address(&self) -> Option<Address> {
        self.instructions.last().map(Instruction::end_address)
    }
}

/// Per-function control-flow graph keyed by block start address.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ControlFlowGraph {
    /// Entry block address; always the function's start address
    pub entry: Address,
    /// Blocks keyed by start address
    pub blocks: BTreeMap<Address, BasicBlock>,
}

impl ControlFlowGraph {
    pub fn new(entry: Address) -> Self {
        Self {
            entry,
            blocks: BTreeMap::new(),
        }
    }

    pub fn node_count(&self) -> usize {
        self.blocks.len()
    }

    pub fn edge_count(&self) -> usize {
        self.blocks.values().map(|b| b.successors.len()).sum()
    }

    /// Cyclomatic complexity: E - N + 2.
    pub fn complexity(&self) -> i32 {
        self.edge_count() as i32 - self.node_count() as i32 + 2
    }
}

/// Where a variable lives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum Storage {
    /// Absolute memory address
    Memory(Address),
    /// Named register
    Register(String),
}

/// A variable synthesized by the data-flow analyzer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Variable {
    pub name: String,
    pub storage: Storage,
    /// C-like type name ("char", "int", "long", "char[]", ...)
    pub type_name: String,
    /// Element size in bytes
    pub size: u32,
    pub is_array: bool,
    pub array_length: Option<u32>,
    pub is_struct: bool,
    pub struct_name: Option<String>,
    pub is_parameter: bool,
    pub is_return_value: bool,
    /// Instruction addresses that reference this variable
    pub references: Vec<Address>,
}

impl Variable {
    /// A memory variable with the given type.
    pub fn memory(name: &str, address: Address, type_name: &str, size: u32) -> Self {
        Self {
            name: name.to_string(),
            storage: Storage::Memory(address),
            type_name: type_name.to_string(),
            size,
            is_array: false,
            array_length: None,
            is_struct: false,
            struct_name: None,
            is_parameter: false,
            is_return_value: false,
            references: Vec::new(),
        }
    }

    /// A synthetic variable standing in for a register.
    pub fn register(name: &str, reg: &str) -> Self {
        Self {
            name: name.to_string(),
            storage: Storage::Register(reg.to_string()),
            type_name: "int".to_string(),
            size: 2,
            is_array: false,
            array_length: None,
            is_struct: false,
            struct_name: None,
            is_parameter: false,
            is_return_value: false,
            references: Vec::new(),
        }
    }

    /// The memory address, for memory-backed variables.
    pub fn address(&self) -> Option<Address> {
        match self.storage {
            Storage::Memory(a) => Some(a),
            Storage::Register(_) => None,
        }
    }
}

/// One field of a recognized in-memory structure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StructField {
    pub name: String,
    pub type_name: String,
    pub size: u32,
}

/// A structure recognized from base-register + offset access patterns.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StructDef {
    pub name: String,
    /// Base address the structure was observed at
    pub address: Address,
    /// Fields keyed by byte offset from the base
    pub fields: BTreeMap<u16, StructField>,
}

/// Loop flavor assigned by structure recovery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum LoopKind {
    While,
    DoWhile,
    For,
}

/// A control-flow structure recovered from a function's CFG.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum HigherLevelStructure {
    Loop {
        header: Address,
        body: Vec<Address>,
        exits: Vec<Address>,
        kind: LoopKind,
    },
    Conditional {
        cond_block: Address,
        true_blocks: Vec<Address>,
        false_blocks: Vec<Address>,
        merge: Option<Address>,
    },
    Switch {
        cond_block: Address,
        cases: BTreeMap<i64, Vec<Address>>,
        default: Option<Address>,
        merge: Option<Address>,
    },
}

/// One recovered function.
#[derive(Debug, Clone, Serialize)]
pub struct Function {
    pub name: String,
    pub start_address: Address,
    /// First address after the function (exclusive)
    pub end_address: Address,
    pub instructions: Vec<Instruction>,
    pub cfg: Option<ControlFlowGraph>,
    /// Start addresses of directly called functions, in call-site order
    pub calls: Vec<Address>,
    pub variables: BTreeMap<String, Variable>,
    pub purpose: Option<String>,
    pub comments: Vec<String>,
    pub structures: Vec<HigherLevelStructure>,
    pub struct_defs: BTreeMap<Address, StructDef>,
    pub is_recursive: bool,
    pub complexity: i32,
}

impl Function {
    pub fn new(name: &str, start_address: Address) -> Self {
        Self {
            name: name.to_string(),
            start_address,
            end_address: start_address,
            instructions: Vec::new(),
            cfg: None,
            calls: Vec::new(),
            variables: BTreeMap::new(),
            purpose: None,
            comments: Vec::new(),
            structures: Vec::new(),
            struct_defs: BTreeMap::new(),
            is_recursive: false,
            complexity: 1,
        }
    }

    /// True if `addr` falls inside this function's address range.
    pub fn contains(&self, addr: Address) -> bool {
        self.start_address <= addr && addr < self.end_address
    }
}

/// Error type for decompilation operations.
#[derive(Debug, thiserror::Error)]
pub enum AnalysisError {
    /// The input is not a valid MZ executable
    #[error("invalid MZ executable: {0}")]
    InvalidImage(String),

    /// Decoder construction or operation failed
    #[error("decoder error: {0}")]
    Decoder(String),

    /// I/O error while reading input or writing reports
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Report serialization failed
    #[error("report error: {0}")]
    Report(String),
}
