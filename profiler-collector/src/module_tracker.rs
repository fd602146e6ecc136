use std::collections::hash_map::Entry;
use std::hash::Hasher;

use parking_lot::Mutex;
use profiler_types::{Id, IdGenerator, LongAddress, ModuleId, ModuleMapping};
use rustc_hash::{FxHashMap, FxHasher};

use crate::error::{Error, Result};

/// Identifies a module by file, not by where it happens to be mapped, so
/// the same file reloaded at a different base address still gets the same
/// `ModuleId` (4.H). On unix this is `(dev, ino)`; elsewhere it falls back
/// to the canonicalized path, which is weaker (a file replaced in place
/// between unmap and remap would alias) but requires no extra dependency.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum FileIdentity {
    #[cfg(unix)]
    DeviceInode(u64, u64),
    Path(String),
}

fn file_identity(path: &str) -> FileIdentity {
    #[cfg(unix)]
    {
        use std::os::unix::fs::MetadataExt;
        if let Ok(meta) = std::fs::metadata(path) {
            return FileIdentity::DeviceInode(meta.dev(), meta.ino());
        }
    }
    FileIdentity::Path(path.to_string())
}

struct ModuleEntry {
    module_id: ModuleId,
    path: String,
    content_hash: Mutex<Option<u32>>,
}

/// Tracks module map/unmap notifications, assigns stable module IDs grouped
/// by file identity, and computes each module's content hash lazily on
/// first query rather than at map time, since most mapped modules are never
/// actually symbolized.
pub struct ModuleTracker {
    mapping_ids: IdGenerator,
    module_ids: IdGenerator,
    modules_by_identity: Mutex<FxHashMap<FileIdentity, ModuleEntry>>,
    live_mappings: Mutex<FxHashMap<Id, ModuleMapping>>,
    loaded_since_last_call: Mutex<Vec<ModuleMapping>>,
    unloaded_since_last_call: Mutex<Vec<Id>>,
}

impl Default for ModuleTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl ModuleTracker {
    pub fn new() -> Self {
        ModuleTracker {
            mapping_ids: IdGenerator::new(),
            module_ids: IdGenerator::new(),
            modules_by_identity: Mutex::new(FxHashMap::default()),
            live_mappings: Mutex::new(FxHashMap::default()),
            loaded_since_last_call: Mutex::new(Vec::new()),
            unloaded_since_last_call: Mutex::new(Vec::new()),
        }
    }

    /// Notifies the tracker that `path` was mapped at `base_address`.
    /// Returns the assigned mapping.
    pub fn on_module_loaded(&self, path: &str, base_address: LongAddress) -> ModuleMapping {
        let identity = file_identity(path);
        let module_id = {
            let mut modules = self.modules_by_identity.lock();
            match modules.entry(identity) {
                Entry::Occupied(e) => e.get().module_id,
                Entry::Vacant(e) => {
                    let module_id = ModuleId(self.module_ids.next().get());
                    e.insert(ModuleEntry {
                        module_id,
                        path: path.to_string(),
                        content_hash: Mutex::new(None),
                    });
                    module_id
                }
            }
        };

        let mapping = ModuleMapping {
            id: self.mapping_ids.next(),
            module_id,
            base_address,
            path: path.to_string(),
        };
        self.live_mappings.lock().insert(mapping.id, mapping.clone());
        self.loaded_since_last_call.lock().push(mapping.clone());
        mapping
    }

    /// Notifies the tracker that the mapping with this `id` was unmapped.
    /// A no-op if the id is unknown (already reported, or never loaded).
    pub fn on_module_unloaded(&self, mapping_id: Id) {
        if self.live_mappings.lock().remove(&mapping_id).is_some() {
            self.unloaded_since_last_call.lock().push(mapping_id);
        }
    }

    /// Drains the deltas accumulated since the last call, matching 4.H's
    /// `get_changes(loaded_out, unloaded_out)` contract.
    pub fn get_changes(&self) -> (Vec<ModuleMapping>, Vec<Id>) {
        let loaded = std::mem::take(&mut *self.loaded_since_last_call.lock());
        let unloaded = std::mem::take(&mut *self.unloaded_since_last_call.lock());
        (loaded, unloaded)
    }

    pub fn live_mapping(&self, mapping_id: Id) -> Option<ModuleMapping> {
        self.live_mappings.lock().get(&mapping_id).cloned()
    }

    /// Computes (and memoizes) `module_id`'s content hash by reading its
    /// backing file in full. Returns `None` if no module with this id has
    /// ever been loaded.
    pub fn content_hash(&self, module_id: ModuleId) -> Option<Result<u32>> {
        let modules = self.modules_by_identity.lock();
        let entry = modules.values().find(|e| e.module_id == module_id)?;

        let mut cached = entry.content_hash.lock();
        if let Some(hash) = *cached {
            return Some(Ok(hash));
        }
        let result = std::fs::read(&entry.path)
            .map(|bytes| {
                let mut hasher = FxHasher::default();
                hasher.write(&bytes);
                hasher.finish() as u32
            })
            .map_err(|source| {
                log::warn!("failed to hash module at {}: {source}", entry.path);
                Error::ModuleRead {
                    path: entry.path.clone(),
                    source,
                }
            });
        if let Ok(hash) = result {
            *cached = Some(hash);
        }
        Some(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reloading_the_same_file_reuses_the_module_id() {
        let tracker = ModuleTracker::new();
        let first = tracker.on_module_loaded("/lib/libfoo.so", 0x1000);
        tracker.on_module_unloaded(first.id);
        let second = tracker.on_module_loaded("/lib/libfoo.so", 0x2000);
        assert_eq!(first.module_id, second.module_id);
        assert_ne!(first.id, second.id);
    }

    #[test]
    fn distinct_files_get_distinct_module_ids() {
        let tracker = ModuleTracker::new();
        let a = tracker.on_module_loaded("/lib/a.so", 0x1000);
        let b = tracker.on_module_loaded("/lib/b.so", 0x2000);
        assert_ne!(a.module_id, b.module_id);
    }

    #[test]
    fn get_changes_drains_and_resets() {
        let tracker = ModuleTracker::new();
        let mapping = tracker.on_module_loaded("/lib/a.so", 0x1000);
        tracker.on_module_unloaded(mapping.id);

        let (loaded, unloaded) = tracker.get_changes();
        assert_eq!(loaded.len(), 1);
        assert_eq!(unloaded, vec![mapping.id]);

        let (loaded_again, unloaded_again) = tracker.get_changes();
        assert!(loaded_again.is_empty());
        assert!(unloaded_again.is_empty());
    }

    #[test]
    fn content_hash_is_memoized_and_stable() {
        let dir = std::env::temp_dir();
        let path = dir.join(format!("profiler-collector-test-{}.bin", std::process::id()));
        std::fs::write(&path, b"hello module bytes").unwrap();

        let tracker = ModuleTracker::new();
        let mapping = tracker.on_module_loaded(path.to_str().unwrap(), 0x1000);
        let first = tracker.content_hash(mapping.module_id).unwrap().unwrap();
        let second = tracker.content_hash(mapping.module_id).unwrap().unwrap();
        assert_eq!(first, second);

        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn content_hash_of_unknown_module_is_none() {
        let tracker = ModuleTracker::new();
        assert!(tracker.content_hash(ModuleId(999)).is_none());
    }
}
