//! Array and structure recognition from addressing patterns.
//!
//! Indexed access against a fixed base (`word ptr [si + 0x4000]`) marks
//! an array at that base. Small displacements off a base register
//! (`word ptr [bx + 4]`) mark structure fields, with the structure's
//! address recovered from the `mov <reg>, 0x...` that loaded the base.

use std::collections::{BTreeMap, BTreeSet};

use log::{debug, error, info};
use regex::Regex;

use crate::analysis::Analyzer;
use crate::{Address, Function, StructDef, StructField, Variable};

/// Displacements at or above this are treated as absolute array bases
/// rather than field offsets.
const STRUCT_OFFSET_LIMIT: u32 = 0x100;

/// Array length assumed when no neighboring base bounds the array.
const DEFAULT_ARRAY_LENGTH: u32 = 10;

const INDEXED_PATTERN: &str =
    r"(?:(byte|word|dword) )?ptr \[(?:([a-z]{2}) \+ (0x[0-9a-fA-F]+|\d+)|(0x[0-9a-fA-F]+) \+ ([a-z]{2}))\]";

/// Recognizes arrays and structures from memory access patterns.
pub struct DataStructAnalyzer {
    pattern: Option<Regex>,
}

impl DataStructAnalyzer {
    pub fn new() -> Self {
        Self {
            pattern: Regex::new(INDEXED_PATTERN).ok(),
        }
    }
}

impl Default for DataStructAnalyzer {
    fn default() -> Self {
        Self::new()
    }
}

/// An indexed access pulled out of one operand string.
struct IndexedAccess {
    register: String,
    displacement: u32,
    /// Element size implied by the size qualifier
    element_size: u32,
}

fn element_type(size: u32) -> &'static str {
    match size {
        1 => "char",
        4 => "long",
        _ => "int",
    }
}

fn parse_displacement(s: &str) -> Option<u32> {
    if let Some(hex) = s.strip_prefix("0x") {
        u32::from_str_radix(hex, 16).ok()
    } else {
        s.parse().ok()
    }
}

fn indexed_access(pattern: &Regex, operands: &str) -> Option<IndexedAccess> {
    let caps = pattern.captures(operands)?;
    let element_size = match caps.get(1).map(|m| m.as_str()) {
        Some("byte") => 1,
        Some("dword") => 4,
        _ => 2,
    };
    let (register, displacement) = if let Some(reg) = caps.get(2) {
        (reg.as_str(), caps.get(3)?.as_str())
    } else {
        (caps.get(5)?.as_str(), caps.get(4)?.as_str())
    };
    Some(IndexedAccess {
        register: register.to_string(),
        displacement: parse_displacement(displacement)?,
        element_size,
    })
}

/// The last literal loaded into `reg` before anything else clobbers it,
/// scanning the whole function. Good enough for the common
/// load-base-then-index idiom.
fn base_address_of(func: &Function, reg: &str) -> Option<Address> {
    let mut base = None;
    for insn in &func.instructions {
        if insn.mnemonic != "mov" {
            continue;
        }
        let Some((dest, src)) = insn.operands.split_once(',') else {
            continue;
        };
        if dest.trim() == reg {
            base = crate::parse_literal_address(src.trim());
        }
    }
    base
}

impl Analyzer for DataStructAnalyzer {
    fn name(&self) -> &'static str {
        "data-structures"
    }

    fn analyze(&mut self, functions: &mut [Function]) -> bool {
        let Some(pattern) = self.pattern.clone() else {
            error!("bad indexed-access pattern");
            return false;
        };

        // Pass 1: collect array bases globally so lengths can be bounded
        // by the next known base.
        let mut array_bases: BTreeMap<Address, u32> = BTreeMap::new();
        for func in functions.iter() {
            for insn in &func.instructions {
                let Some(access) = indexed_access(&pattern, &insn.operands) else {
                    continue;
                };
                if access.displacement >= STRUCT_OFFSET_LIMIT {
                    let size = array_bases.entry(access.displacement).or_insert(2);
                    // a byte or dword qualifier is more specific than the
                    // word default
                    if access.element_size != 2 {
                        *size = access.element_size;
                    }
                }
            }
        }

        let mut lengths: BTreeMap<Address, u32> = BTreeMap::new();
        let bases: Vec<Address> = array_bases.keys().copied().collect();
        for (i, &base) in bases.iter().enumerate() {
            let size = array_bases[&base];
            let length = bases
                .get(i + 1)
                .map(|&next| ((next - base) / size).clamp(1, 1024))
                .unwrap_or(DEFAULT_ARRAY_LENGTH);
            lengths.insert(base, length);
        }
        info!("identified {} arrays", array_bases.len());

        // Pass 2: per-function variables and structure definitions.
        for func in functions.iter_mut() {
            let mut field_offsets: BTreeMap<String, BTreeMap<u16, u32>> = BTreeMap::new();
            let mut seen_arrays: BTreeSet<Address> = BTreeSet::new();
            for insn in &func.instructions {
                let Some(access) = indexed_access(&pattern, &insn.operands) else {
                    continue;
                };
                if access.displacement >= STRUCT_OFFSET_LIMIT {
                    seen_arrays.insert(access.displacement);
                } else {
                    field_offsets
                        .entry(access.register.clone())
                        .or_default()
                        .insert(access.displacement as u16, access.element_size);
                }
            }

            for base in seen_arrays {
                let size = array_bases[&base];
                let type_name = format!("{}[]", element_type(size));
                let name = format!("var_{base:X}");
                let var = func
                    .variables
                    .entry(name.clone())
                    .or_insert_with(|| Variable::memory(&name, base, &type_name, size));
                var.type_name = type_name;
                var.size = size;
                var.is_array = true;
                var.array_length = Some(lengths[&base]);
            }

            for (reg, offsets) in field_offsets {
                // one offset is just pointer arithmetic, not a structure
                if offsets.len() < 2 {
                    continue;
                }
                let Some(base) = base_address_of(func, &reg) else {
                    debug!(
                        "{}: struct-like access via {reg} with no literal base",
                        func.name
                    );
                    continue;
                };
                let struct_name = format!("struct_{base:X}");
                let mut def = StructDef {
                    name: struct_name.clone(),
                    address: base,
                    fields: BTreeMap::new(),
                };
                for (&offset, &size) in &offsets {
                    def.fields.insert(
                        offset,
                        StructField {
                            name: format!("field_{offset:X}"),
                            type_name: element_type(size).to_string(),
                            size,
                        },
                    );
                }
                func.struct_defs.insert(base, def);

                let name = format!("var_{base:X}");
                let var = func
                    .variables
                    .entry(name.clone())
                    .or_insert_with(|| Variable::memory(&name, base, "struct", 2));
                var.type_name = "struct".to_string();
                var.is_struct = true;
                var.struct_name = Some(struct_name);
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Instruction;

    fn func(addr: Address, ops: &[(&str, &str)]) -> Function {
        let mut f = Function::new(&format!("sub_{addr:X}"), addr);
        f.end_address = addr + 0x20;
        f.instructions = ops
            .iter()
            .enumerate()
            .map(|(i, (m, o))| Instruction::new(addr + i as Address, vec![0x90], m, o))
            .collect();
        f
    }

    #[test]
    fn test_indexed_access_marks_array() {
        let mut functions = vec![func(
            0x100,
            &[("mov", "al, byte ptr [si + 0x4000]"), ("ret", "")],
        )];
        let mut analyzer = DataStructAnalyzer::new();
        assert!(analyzer.analyze(&mut functions));

        let var = &functions[0].variables["var_4000"];
        assert!(var.is_array);
        assert_eq!(var.type_name, "char[]");
        assert_eq!(var.size, 1);
        assert_eq!(var.array_length, Some(DEFAULT_ARRAY_LENGTH));
    }

    #[test]
    fn test_array_length_bounded_by_next_base() {
        let mut functions = vec![func(
            0x100,
            &[
                ("mov", "ax, word ptr [si + 0x4000]"),
                ("mov", "bx, word ptr [di + 0x4010]"),
                ("ret", ""),
            ],
        )];
        let mut analyzer = DataStructAnalyzer::new();
        analyzer.analyze(&mut functions);

        // 0x10 bytes of word elements before the next array starts
        let var = &functions[0].variables["var_4000"];
        assert_eq!(var.array_length, Some(8));
    }

    #[test]
    fn test_struct_recognized_from_two_field_offsets() {
        let mut functions = vec![func(
            0x100,
            &[
                ("mov", "bx, 0x2000"),
                ("mov", "ax, word ptr [bx + 2]"),
                ("mov", "cl, byte ptr [bx + 5]"),
                ("ret", ""),
            ],
        )];
        let mut analyzer = DataStructAnalyzer::new();
        analyzer.analyze(&mut functions);

        let def = &functions[0].struct_defs[&0x2000];
        assert_eq!(def.name, "struct_2000");
        assert_eq!(def.fields.len(), 2);
        assert_eq!(def.fields[&2].type_name, "int");
        assert_eq!(def.fields[&5].type_name, "char");
        assert_eq!(def.fields[&5].name, "field_5");

        let var = &functions[0].variables["var_2000"];
        assert!(var.is_struct);
        assert_eq!(var.struct_name.as_deref(), Some("struct_2000"));
    }

    #[test]
    fn test_single_offset_is_not_a_struct() {
        let mut functions = vec![func(
            0x100,
            &[("mov", "bx, 0x2000"), ("mov", "ax, word ptr [bx + 2]"), ("ret", "")],
        )];
        let mut analyzer = DataStructAnalyzer::new();
        analyzer.analyze(&mut functions);
        assert!(functions[0].struct_defs.is_empty());
    }

    #[test]
    fn test_struct_without_literal_base_is_skipped() {
        let mut functions = vec![func(
            0x100,
            &[
                ("mov", "ax, word ptr [bx + 2]"),
                ("mov", "cl, byte ptr [bx + 5]"),
                ("ret", ""),
            ],
        )];
        let mut analyzer = DataStructAnalyzer::new();
        analyzer.analyze(&mut functions);
        assert!(functions[0].struct_defs.is_empty());
    }

    #[test]
    fn test_reanalysis_is_idempotent() {
        let mut functions = vec![func(
            0x100,
            &[
                ("mov", "bx, 0x2000"),
                ("mov", "ax, word ptr [bx + 2]"),
                ("mov", "cl, byte ptr [bx + 5]"),
                ("mov", "al, byte ptr [si + 0x4000]"),
                ("ret", ""),
            ],
        )];
        let mut analyzer = DataStructAnalyzer::new();
        analyzer.analyze(&mut functions);
        let first = functions[0].clone();
        analyzer.analyze(&mut functions);
        assert_eq!(functions[0].variables, first.variables);
        assert_eq!(functions[0].struct_defs, first.struct_defs);
    }
}
