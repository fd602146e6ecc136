use profiler_types::{Id, LongAddress, ModuleId, ModuleMapping, ModuleMetadata, Rva};
use rustc_hash::FxHashMap;

/// Holds the set of currently known module mappings and metadata (4.L).
///
/// Mappings are kept sorted by base address so resolution is a binary
/// search, the same shape as the teacher's `LibMappings::convert_address`,
/// except a mapping's upper bound is unknown here (the data model carries
/// no size), so resolution picks the mapping with the greatest base address
/// not exceeding the queried address and trusts it unconditionally.
pub struct SymbolResolver {
    sorted_mappings: Vec<ModuleMapping>,
    metadata: FxHashMap<ModuleId, ModuleMetadata>,
}

impl Default for SymbolResolver {
    fn default() -> Self {
        Self::new()
    }
}

impl SymbolResolver {
    pub fn new() -> Self {
        SymbolResolver {
            sorted_mappings: Vec::new(),
            metadata: FxHashMap::default(),
        }
    }

    pub fn on_module_loaded(&mut self, mapping: ModuleMapping) {
        let insertion_index = match self
            .sorted_mappings
            .binary_search_by_key(&mapping.base_address, |m| m.base_address)
        {
            Ok(i) => {
                self.sorted_mappings.remove(i);
                i
            }
            Err(i) => i,
        };
        self.sorted_mappings.insert(insertion_index, mapping);
    }

    pub fn on_module_unloaded(&mut self, mapping_id: Id) {
        self.sorted_mappings.retain(|m| m.id != mapping_id);
    }

    pub fn set_metadata(&mut self, metadata: ModuleMetadata) {
        self.metadata.insert(metadata.module_id, metadata);
    }

    pub fn forget_metadata(&mut self, module_id: ModuleId) {
        self.metadata.remove(&module_id);
    }

    fn containing_mapping(&self, address: LongAddress) -> Option<&ModuleMapping> {
        let index = match self
            .sorted_mappings
            .binary_search_by_key(&address, |m| m.base_address)
        {
            Ok(exact) => exact,
            Err(0) => return None,
            Err(insertion_index) => insertion_index - 1,
        };
        self.sorted_mappings.get(index)
    }

    /// Resolves an absolute address to the `(module_id, rva)` it falls
    /// inside, or `None` if no loaded mapping claims it.
    pub fn resolve(&self, address: LongAddress) -> Option<(ModuleId, Rva)> {
        let mapping = self.containing_mapping(address)?;
        let rva = (address - mapping.base_address) as Rva;
        Some((mapping.module_id, rva))
    }

    /// Unknown addresses yield an empty string, per 4.L.
    pub fn symbol_name(&self, address: LongAddress) -> String {
        let Some((module_id, rva)) = self.resolve(address) else {
            return String::new();
        };
        let Some(metadata) = self.metadata.get(&module_id) else {
            return String::new();
        };
        metadata
            .symbol_at_rva(rva)
            .map(|s| s.name.clone())
            .unwrap_or_default()
    }

    /// `(path, line)` for the source location backing `address`, or `None`
    /// if the address, its module, or the symbol's file id is unknown.
    pub fn file_line(&self, address: LongAddress) -> Option<(String, u32)> {
        let (module_id, rva) = self.resolve(address)?;
        let metadata = self.metadata.get(&module_id)?;
        let symbol = metadata.symbol_at_rva(rva)?;
        let source_file = metadata.source_file(symbol.file_id)?;
        Some((source_file.path.clone(), symbol.line))
    }
}
