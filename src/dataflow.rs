//! Symbolic register/memory propagation and variable synthesis.
//!
//! The analyzer walks each function's CFG once, tracking which registers
//! and memory cells hold known constant values. It is intentionally
//! unsound: each block is processed a single time per walk (no fixed
//! point), which is enough to surface the variables a reader cares about
//! and always terminates on cyclic graphs.

use std::collections::{BTreeMap, BTreeSet};

use crate::{Address, Function, Instruction, Variable};

/// The 16-bit general registers, in display order.
pub const GENERAL_REGISTERS: [&str; 8] = ["ax", "bx", "cx", "dx", "si", "di", "bp", "sp"];

/// A known value in the sparse memory map.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryCell {
    Byte(u8),
    Word(u16),
}

/// Known register and memory contents at one program point.
///
/// `Clone` is the fork operation: forked copies never alias, so writes to
/// one branch's state are invisible to the other.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RegisterState {
    regs: [Option<u16>; GENERAL_REGISTERS.len()],
    pub flags: Option<u16>,
    pub memory: BTreeMap<Address, MemoryCell>,
}

fn reg_index(name: &str) -> Option<usize> {
    GENERAL_REGISTERS.iter().position(|r| *r == name)
}

/// Parent 16-bit register of an 8-bit half (`al` -> `ax`), with low flag.
fn half_register(name: &str) -> Option<(usize, bool)> {
    let mut chars = name.chars();
    let (first, second) = (chars.next()?, chars.next()?);
    if chars.next().is_some() {
        return None;
    }
    let low = match second {
        'l' => true,
        'h' => false,
        _ => return None,
    };
    if !matches!(first, 'a' | 'b' | 'c' | 'd') {
        return None;
    }
    let parent = format!("{first}x");
    reg_index(&parent).map(|i| (i, low))
}

impl RegisterState {
    pub fn new() -> Self {
        Self::default()
    }

    /// True if `name` is a general register or one of its 8-bit halves.
    pub fn is_register(name: &str) -> bool {
        reg_index(name).is_some() || half_register(name).is_some()
    }

    /// Current value of a register, if known.
    pub fn get(&self, name: &str) -> Option<u16> {
        if let Some(i) = reg_index(name) {
            return self.regs[i];
        }
        let (i, low) = half_register(name)?;
        let word = self.regs[i]?;
        Some(if low { word & 0xFF } else { (word >> 8) & 0xFF })
    }

    /// Set a register. Writes to 8-bit halves merge into the 16-bit
    /// parent, preserving the other half when it is known.
    pub fn set(&mut self, name: &str, value: u16) {
        if let Some(i) = reg_index(name) {
            self.regs[i] = Some(value);
            return;
        }
        if let Some((i, low)) = half_register(name) {
            let merged = match (self.regs[i], low) {
                (Some(word), true) => (word & 0xFF00) | (value & 0xFF),
                (Some(word), false) => ((value & 0xFF) << 8) | (word & 0xFF),
                (None, true) => value & 0xFF,
                (None, false) => (value & 0xFF) << 8,
            };
            self.regs[i] = Some(merged);
        }
    }

    pub fn write_memory(&mut self, address: Address, value: u16, size: u32) {
        let cell = if size == 1 {
            MemoryCell::Byte(value as u8)
        } else {
            MemoryCell::Word(value)
        };
        self.memory.insert(address, cell);
    }

    pub fn read_memory(&self, address: Address) -> Option<MemoryCell> {
        self.memory.get(&address).copied()
    }
}

/// Walks one function's CFG and synthesizes its variable table.
pub struct DataFlowAnalyzer<'a> {
    func: &'a Function,
    /// State observed on entry to each instruction
    register_states: BTreeMap<Address, RegisterState>,
    /// Memory addresses known at each instruction, including its own write
    memory_observations: BTreeMap<Address, BTreeSet<Address>>,
}

impl<'a> DataFlowAnalyzer<'a> {
    pub fn new(func: &'a Function) -> Self {
        Self {
            func,
            register_states: BTreeMap::new(),
            memory_observations: BTreeMap::new(),
        }
    }

    /// Run the walk and return the function's variables keyed by name.
    ///
    /// The result depends only on the function's instructions and CFG, so
    /// repeated runs produce identical tables.
    pub fn analyze(&mut self) -> BTreeMap<String, Variable> {
        self.register_states.clear();
        self.memory_observations.clear();
        let Some(cfg) = self.func.cfg.as_ref() else {
            return BTreeMap::new();
        };
        if cfg.blocks.is_empty() {
            return BTreeMap::new();
        }

        let mut visited: BTreeSet<Address> = BTreeSet::new();
        let mut stack: Vec<(Address, RegisterState)> = vec![(cfg.entry, RegisterState::new())];
        while let Some((addr, input)) = stack.pop() {
            if !visited.insert(addr) {
                continue;
            }
            let Some(block) = cfg.blocks.get(&addr) else {
                continue;
            };
            let mut state = input;
            for insn in &block.instructions {
                self.register_states.insert(insn.address, state.clone());
                process_instruction(insn, &mut state);
                for &mem_addr in state.memory.keys() {
                    self.memory_observations
                        .entry(mem_addr)
                        .or_default()
                        .insert(insn.address);
                }
            }
            // Reverse push so the first successor is explored first.
            for &succ in block.successors.iter().rev() {
                if !visited.contains(&succ) {
                    stack.push((succ, state.clone()));
                }
            }
        }

        self.identify_variables()
    }

    fn identify_variables(&self) -> BTreeMap<String, Variable> {
        let mut variables = BTreeMap::new();

        for (&mem_addr, refs) in &self.memory_observations {
            let name = format!("var_{mem_addr:X}");
            let (type_name, size, is_array) = infer_type(mem_addr, &self.func.instructions);
            let mut var = Variable::memory(&name, mem_addr, &type_name, size);
            var.is_array = is_array;
            var.references = refs.iter().copied().collect();
            variables.insert(name, var);
        }

        for reg in GENERAL_REGISTERS {
            let name = format!("reg_{reg}");
            variables.insert(name.clone(), Variable::register(&name, reg));
        }

        // Conventional PSP offsets every DOS program sees.
        let dos_variables: [(Address, &str, &str, u32); 5] = [
            (0x80, "cmd_line_len", "char", 1),
            (0x81, "cmd_line", "char[]", 127),
            (0x5C, "fcb1", "struct", 16),
            (0x6C, "fcb2", "struct", 16),
            (0x2C, "env_segment", "int", 2),
        ];
        for (addr, name, type_name, size) in dos_variables {
            if self.memory_observations.contains_key(&addr) {
                continue;
            }
            let full_name = format!("dos_{name}");
            let mut var = Variable::memory(&full_name, addr, type_name, size);
            if type_name.ends_with("[]") {
                var.is_array = true;
                var.array_length = Some(size);
                var.size = 1;
            }
            if type_name == "struct" {
                var.is_struct = true;
                var.struct_name = Some("FCB".to_string());
            }
            variables.insert(full_name, var);
        }

        variables
    }

    /// State observed on entry to the given instruction, if it was reached.
    pub fn state_at(&self, addr: Address) -> Option<&RegisterState> {
        self.register_states.get(&addr)
    }
}

/// Apply one instruction to the state. Only constant-carrying `mov` and
/// the `xor r, r` zeroing idiom are modeled; everything else leaves the
/// state untouched.
fn process_instruction(insn: &Instruction, state: &mut RegisterState) {
    let Some((dest, src)) = insn.operands.split_once(',') else {
        return;
    };
    let dest = dest.trim();
    let src = src.trim();

    match insn.mnemonic.as_str() {
        "mov" => {
            let value = if RegisterState::is_register(src) {
                state.get(src)
            } else {
                // immediates print as decimal below 10, hex above
                crate::parse_immediate(src).and_then(|v| u16::try_from(v).ok())
            };
            let Some(value) = value else { return };

            if RegisterState::is_register(dest) {
                state.set(dest, value);
            } else if let Some(addr) = memory_destination(dest) {
                let size = if dest.starts_with("byte") { 1 } else { 2 };
                state.write_memory(addr, value, size);
            }
        }
        "xor" => {
            if dest == src && RegisterState::is_register(dest) {
                state.set(dest, 0);
            }
        }
        _ => {}
    }
}

/// Literal address of a `ptr [0xNNNN]` destination, if that is what it is.
fn memory_destination(dest: &str) -> Option<Address> {
    if !dest.contains("ptr [") {
        return None;
    }
    let inner = dest.split('[').nth(1)?.split(']').next()?.trim();
    crate::parse_literal_address(inner)
}

/// Infer a variable's type from how the function's text uses its address.
///
/// The tightest `byte/word/dword ptr` qualifier wins; a string instruction
/// touching the address upgrades it to the matching array type. Untyped
/// addresses default by parity: even is word-sized, odd byte-sized.
fn infer_type(address: Address, instructions: &[Instruction]) -> (String, u32, bool) {
    // the decoder prints lowercase hex; accept either form
    let upper = format!("0x{address:X}");
    let lower = format!("0x{address:x}");
    let references = |operands: &str| operands.contains(&upper) || operands.contains(&lower);

    let mut result: Option<(String, u32)> = None;
    for insn in instructions {
        if !references(&insn.operands) {
            continue;
        }
        if insn.operands.contains("byte ptr") {
            result = Some(("char".to_string(), 1));
        } else if insn.operands.contains("word ptr") {
            result = Some(("int".to_string(), 2));
        } else if insn.operands.contains("dword ptr") {
            result = Some(("long".to_string(), 4));
        } else {
            continue;
        }
        break;
    }

    for insn in instructions {
        let element = match insn.mnemonic.as_str() {
            "movsb" | "stosb" | "lodsb" => Some(("char[]", 1)),
            "movsw" | "stosw" | "lodsw" => Some(("int[]", 2)),
            "movsd" | "stosd" | "lodsd" => Some(("long[]", 4)),
            _ => None,
        };
        if let Some((type_name, size)) = element {
            if references(&insn.operands) {
                return (type_name.to_string(), size, true);
            }
        }
    }

    if let Some((type_name, size)) = result {
        return (type_name, size, false);
    }
    if address % 2 == 0 {
        ("int".to_string(), 2, false)
    } else {
        ("char".to_string(), 1, false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cfg::build_cfg;
    use crate::Storage;

    fn insn(addr: Address, size: usize, mnemonic: &str, operands: &str) -> Instruction {
        Instruction::new(addr, vec![0x90; size], mnemonic, operands)
    }

    fn analyzed_func(instructions: Vec<Instruction>) -> Function {
        let start = instructions[0].address;
        let end = instructions.last().unwrap().end_address();
        let mut f = Function::new("sub_test", start);
        f.end_address = end;
        f.instructions = instructions;
        build_cfg(&mut f);
        f
    }

    #[test]
    fn test_clone_isolates_states() {
        let mut a = RegisterState::new();
        a.set("ax", 1);
        a.write_memory(0x200, 7, 2);
        let mut b = a.clone();
        b.set("ax", 2);
        b.write_memory(0x200, 9, 2);
        b.write_memory(0x300, 1, 1);

        assert_eq!(a.get("ax"), Some(1));
        assert_eq!(a.read_memory(0x200), Some(MemoryCell::Word(7)));
        assert_eq!(a.read_memory(0x300), None);
        assert_eq!(b.get("ax"), Some(2));
    }

    #[test]
    fn test_half_register_merge() {
        let mut s = RegisterState::new();
        s.set("ax", 0x1234);
        s.set("al", 0x56);
        assert_eq!(s.get("ax"), Some(0x1256));
        s.set("ah", 0x78);
        assert_eq!(s.get("ax"), Some(0x7856));
        assert_eq!(s.get("al"), Some(0x56));
        assert_eq!(s.get("ah"), Some(0x78));

        // unknown parent: the other half reads as zero
        let mut t = RegisterState::new();
        assert_eq!(t.get("bl"), None);
        t.set("bl", 0xAB);
        assert_eq!(t.get("bx"), Some(0x00AB));
        let mut u = RegisterState::new();
        u.set("ch", 0xCD);
        assert_eq!(u.get("cx"), Some(0xCD00));
    }

    #[test]
    fn test_xor_self_zeroes() {
        let mut s = RegisterState::new();
        process_instruction(&insn(0, 2, "xor", "ax, ax"), &mut s);
        assert_eq!(s.get("ax"), Some(0));
        // xor with a different register stays symbolic
        process_instruction(&insn(0, 2, "xor", "bx, cx"), &mut s);
        assert_eq!(s.get("bx"), None);
    }

    #[test]
    fn test_mov_chain_propagates_constants() {
        let mut s = RegisterState::new();
        process_instruction(&insn(0, 3, "mov", "ax, 0x1234"), &mut s);
        process_instruction(&insn(3, 2, "mov", "bx, ax"), &mut s);
        process_instruction(&insn(5, 4, "mov", "word ptr [0x200], bx"), &mut s);
        assert_eq!(s.read_memory(0x200), Some(MemoryCell::Word(0x1234)));
    }

    #[test]
    fn test_memory_variable_synthesis() {
        let f = analyzed_func(vec![
            insn(0x0, 6, "mov", "word ptr [0x200], 0x5"),
            insn(0x6, 1, "ret", ""),
        ]);
        let vars = DataFlowAnalyzer::new(&f).analyze();

        let var = &vars["var_200"];
        assert_eq!(var.storage, Storage::Memory(0x200));
        assert_eq!(var.type_name, "int");
        assert_eq!(var.size, 2);
        // visible at the write itself and in the state entering `ret`
        assert_eq!(var.references, vec![0x0, 0x6]);
    }

    #[test]
    fn test_decimal_immediate_propagates() {
        // small immediates print without the 0x prefix
        let f = analyzed_func(vec![
            insn(0x0, 6, "mov", "word ptr [0x200], 2"),
            insn(0x6, 3, "mov", "ax, 5"),
            insn(0x9, 4, "mov", "word ptr [0x202], ax"),
            insn(0xD, 1, "ret", ""),
        ]);
        let mut analyzer = DataFlowAnalyzer::new(&f);
        let vars = analyzer.analyze();

        assert!(vars.contains_key("var_200"));
        assert!(vars.contains_key("var_202"));
        let state = analyzer.state_at(0xD).unwrap();
        assert_eq!(state.read_memory(0x200), Some(MemoryCell::Word(2)));
        assert_eq!(state.read_memory(0x202), Some(MemoryCell::Word(5)));
    }

    #[test]
    fn test_byte_qualifier_wins_over_parity() {
        // even address, but accessed as byte ptr
        let f = analyzed_func(vec![
            insn(0x0, 5, "mov", "byte ptr [0x300], 0x1"),
            insn(0x5, 1, "ret", ""),
        ]);
        let vars = DataFlowAnalyzer::new(&f).analyze();
        assert_eq!(vars["var_300"].type_name, "char");
        assert_eq!(vars["var_300"].size, 1);
    }

    #[test]
    fn test_string_op_upgrades_to_array() {
        let f = analyzed_func(vec![
            insn(0x0, 5, "mov", "byte ptr [0x301], 0x1"),
            insn(0x5, 1, "lodsb", "al, byte ptr [0x301]"),
            insn(0x6, 1, "ret", ""),
        ]);
        let vars = DataFlowAnalyzer::new(&f).analyze();
        assert_eq!(vars["var_301"].type_name, "char[]");
        assert!(vars["var_301"].is_array);
    }

    #[test]
    fn test_register_and_dos_variables_present() {
        let f = analyzed_func(vec![insn(0x0, 1, "ret", "")]);
        let vars = DataFlowAnalyzer::new(&f).analyze();

        for reg in GENERAL_REGISTERS {
            assert!(vars.contains_key(&format!("reg_{reg}")), "missing reg_{reg}");
        }
        assert_eq!(vars["dos_cmd_line"].array_length, Some(127));
        assert!(vars["dos_fcb1"].is_struct);
        assert_eq!(vars["dos_env_segment"].type_name, "int");
    }

    #[test]
    fn test_dos_variable_skipped_when_address_observed() {
        let f = analyzed_func(vec![
            insn(0x0, 5, "mov", "byte ptr [0x80], 0x1"),
            insn(0x5, 1, "ret", ""),
        ]);
        let vars = DataFlowAnalyzer::new(&f).analyze();
        assert!(vars.contains_key("var_80"));
        assert!(!vars.contains_key("dos_cmd_line_len"));
    }

    #[test]
    fn test_analysis_terminates_on_cycle_and_is_deterministic() {
        // dec ax; jne 0x0; ret  -- a do-while back edge
        let f = analyzed_func(vec![
            insn(0x0, 1, "dec", "ax"),
            insn(0x1, 2, "jne", "0x0"),
            insn(0x3, 1, "ret", ""),
        ]);
        let first = DataFlowAnalyzer::new(&f).analyze();
        let second = DataFlowAnalyzer::new(&f).analyze();
        assert_eq!(first, second);
    }

    #[test]
    fn test_forked_branches_do_not_alias() {
        // 0x0: mov ax, 0x1
        // 0x3: je 0x9
        // 0x5: mov word ptr [0x400], ax   (true only on fall-through path)
        // 0x9: ret
        let f = analyzed_func(vec![
            insn(0x0, 3, "mov", "ax, 0x1"),
            insn(0x3, 2, "je", "0x9"),
            insn(0x5, 4, "mov", "word ptr [0x400], ax"),
            insn(0x9, 1, "ret", ""),
        ]);
        let mut analyzer = DataFlowAnalyzer::new(&f);
        let vars = analyzer.analyze();
        assert!(vars.contains_key("var_400"));
        // the state entering the branch target never saw the write
        // (whichever path reached `ret` first was cloned, not shared)
        let state = analyzer.state_at(0x5).unwrap();
        assert_eq!(state.read_memory(0x400), None);
    }
}
