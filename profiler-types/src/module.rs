use serde::{Deserialize, Serialize};

use crate::ids::{Id, LongAddress, ModuleId};
use crate::symbol::Symbol;

/// One load/map event of a module into a process's address space. Created on
/// load, destroyed on unmap. A single module (by file identity) may have
/// many mappings over its lifetime, e.g. if it is unloaded and reloaded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleMapping {
    pub id: Id,
    pub module_id: ModuleId,
    pub base_address: LongAddress,
    pub path: String,
}

/// Immutable-once-populated metadata for a module: its symbols and the
/// source files they refer to. Joined against [`ModuleMapping`]s by
/// `module_id` to resolve an absolute address to a symbol.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ModuleMetadata {
    pub module_id: ModuleId,
    pub file_id: String,
    pub path: String,
    pub content_hash: u32,
    pub symbols: Vec<Symbol>,
    pub source_files: Vec<SourceFile>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceFile {
    pub id: u32,
    pub path: String,
}

impl ModuleMetadata {
    /// Symbols are unique on `(module_id, rva)`; this look-up assumes that
    /// invariant and returns the first (only) match.
    pub fn symbol_at_rva(&self, rva: u32) -> Option<&Symbol> {
        // Symbols can have a non-zero `size`; an address falls inside a
        // symbol if it is within [rva, rva + size). We pick the closest
        // symbol whose range contains the address, preferring exact starts.
        self.symbols
            .iter()
            .filter(|s| rva >= s.rva && (s.size == 0 || rva < s.rva + s.size))
            .max_by_key(|s| s.rva)
    }

    pub fn source_file(&self, id: u32) -> Option<&SourceFile> {
        self.source_files.iter().find(|f| f.id == id)
    }
}
