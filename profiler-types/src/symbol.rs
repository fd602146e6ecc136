use serde::{Deserialize, Serialize};

use crate::ids::{ModuleId, Rva};

/// A named function (or data) symbol at a module-relative offset. Unique on
/// `(module_id, rva)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Symbol {
    pub module_id: ModuleId,
    pub rva: Rva,
    pub size: u32,
    pub name: String,
    pub file_id: u32,
    pub line: u32,
}
