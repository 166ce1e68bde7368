//! Resource-file reference analysis.
//!
//! DOS games ship their assets as flat files next to the executable.
//! This pass matches extracted strings against the well-known resource
//! extensions, then ties functions to the resources whose string
//! addresses they reference.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use log::{error, info};
use regex::Regex;

use crate::analysis::Analyzer;
use crate::{Address, Function};

/// Resource extensions and what they hold.
pub const RESOURCE_EXTENSIONS: [(&str, &str); 10] = [
    (".CTR", "Control file"),
    (".PC4", "4-color graphics"),
    (".PC8", "8-color graphics"),
    (".SND", "Sound data"),
    (".ANI", "Animation data"),
    (".XMI", "MIDI music data"),
    (".16", "16-color graphics"),
    (".256", "256-color graphics"),
    (".GFT", "Game font"),
    (".GBT", "Game data table"),
];

const FILENAME_PATTERN: &str =
    r"(?i)([A-Z0-9_]+\.(CTR|PC4|PC8|SND|ANI|XMI|16|256|GFT|GBT))";

/// Ties functions to the resource files they reference.
pub struct ResourceAnalyzer {
    strings: BTreeMap<Address, String>,
    resource_dir: Option<PathBuf>,
    available_resources: Vec<PathBuf>,
    function_resources: BTreeMap<Address, BTreeSet<String>>,
    resource_functions: BTreeMap<String, BTreeSet<Address>>,
}

impl ResourceAnalyzer {
    pub fn new(strings: BTreeMap<Address, String>, resource_dir: Option<PathBuf>) -> Self {
        Self {
            strings,
            resource_dir,
            available_resources: Vec::new(),
            function_resources: BTreeMap::new(),
            resource_functions: BTreeMap::new(),
        }
    }

    /// Functions known to reference each resource file.
    pub fn resource_functions(&self) -> &BTreeMap<String, BTreeSet<Address>> {
        &self.resource_functions
    }

    pub fn available_resources(&self) -> &[PathBuf] {
        &self.available_resources
    }

    fn scan_resource_directory(&mut self, dir: &Path) {
        let mut stack = vec![dir.to_path_buf()];
        while let Some(current) = stack.pop() {
            let Ok(entries) = std::fs::read_dir(&current) else {
                continue;
            };
            for entry in entries.flatten() {
                let path = entry.path();
                if path.is_dir() {
                    stack.push(path);
                    continue;
                }
                let matches = path
                    .extension()
                    .and_then(|e| e.to_str())
                    .map(|e| {
                        let dotted = format!(".{}", e.to_uppercase());
                        RESOURCE_EXTENSIONS.iter().any(|(ext, _)| *ext == dotted)
                    })
                    .unwrap_or(false);
                if matches {
                    self.available_resources.push(path);
                }
            }
        }
        info!("found {} resource files on disk", self.available_resources.len());
    }
}

fn description_for(filename: &str) -> Option<&'static str> {
    let upper = filename.to_uppercase();
    RESOURCE_EXTENSIONS
        .iter()
        .find(|(ext, _)| upper.ends_with(ext))
        .map(|(_, desc)| *desc)
}

impl Analyzer for ResourceAnalyzer {
    fn name(&self) -> &'static str {
        "resources"
    }

    fn analyze(&mut self, functions: &mut [Function]) -> bool {
        let pattern = match Regex::new(FILENAME_PATTERN) {
            Ok(p) => p,
            Err(e) => {
                error!("bad resource filename pattern: {e}");
                return false;
            }
        };

        if let Some(dir) = self.resource_dir.clone() {
            if dir.is_dir() {
                self.scan_resource_directory(&dir);
            }
        }

        // String-table entries naming a resource file.
        let mut resource_strings: BTreeMap<Address, String> = BTreeMap::new();
        for (&addr, string) in &self.strings {
            if let Some(m) = pattern.captures(string) {
                resource_strings.insert(addr, m[1].to_string());
            }
        }
        info!("{} strings name resource files", resource_strings.len());

        self.function_resources.clear();
        self.resource_functions.clear();

        for func in functions.iter_mut() {
            let mut used: BTreeSet<String> = BTreeSet::new();
            for insn in &func.instructions {
                for (&addr, filename) in &resource_strings {
                    let upper = format!("0x{addr:X}");
                    let lower = format!("0x{addr:x}");
                    if insn.operands.contains(&upper) || insn.operands.contains(&lower) {
                        used.insert(filename.clone());
                    }
                }
            }
            if used.is_empty() {
                continue;
            }

            for resource in &used {
                self.resource_functions
                    .entry(resource.clone())
                    .or_default()
                    .insert(func.start_address);
            }

            let types: BTreeSet<&str> =
                used.iter().filter_map(|r| description_for(r)).collect();
            if func.purpose.is_none() {
                func.purpose = Some(if types.len() == 1 {
                    format!("Handles {} resources", types.iter().next().unwrap())
                } else {
                    format!(
                        "Handles multiple resource types: {}",
                        types.iter().copied().collect::<Vec<_>>().join(", ")
                    )
                });
            }
            let comment = format!(
                "Uses resources: {}",
                used.iter().cloned().collect::<Vec<_>>().join(", ")
            );
            if !func.comments.contains(&comment) {
                func.comments.push(comment);
            }

            self.function_resources.insert(func.start_address, used);
        }
        true
    }
}
