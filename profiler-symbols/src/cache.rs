use std::path::Path;

use profiler_types::{ModuleId, ModuleMetadata, Rva, SourceFile, Symbol};
use std::sync::Mutex;

use rusqlite::{params, Connection, OpenFlags};
use rusqlite_migration::{Migrations, M};

use crate::error::{Error, Result};

/// Persistent store for module metadata and which RVAs were successfully
/// patched last session, backing the four tables in spec.md §6. Failures
/// here must never propagate into the ingest path (§7); callers are
/// expected to log and fall back to non-cached operation.
pub trait MetadataCache: Send + Sync {
    fn load_module(&self, module_id: ModuleId) -> Result<Option<ModuleMetadata>>;
    fn store_module(&self, metadata: &ModuleMetadata) -> Result<()>;
    fn cached_patches(&self, module_id: ModuleId) -> Result<Vec<Rva>>;
    fn record_patch(&self, module_id: ModuleId, rva: Rva) -> Result<()>;
    fn forget_module(&self, module_id: ModuleId) -> Result<()>;
}

fn migrations() -> Migrations<'static> {
    Migrations::new(vec![M::up(
        r#"
            CREATE TABLE module
            (
                id INTEGER PRIMARY KEY,
                hash INTEGER NOT NULL,
                path TEXT NOT NULL,
                file_id TEXT NOT NULL
            );
            CREATE TABLE symbol_info
            (
                module_id INTEGER NOT NULL REFERENCES module(id),
                rva INTEGER NOT NULL,
                size INTEGER NOT NULL,
                name TEXT NOT NULL,
                file_id INTEGER NOT NULL,
                line INTEGER NOT NULL
            );
            CREATE INDEX idx_symbol_info_module ON symbol_info(module_id);
            CREATE TABLE source_file
            (
                module_id INTEGER NOT NULL REFERENCES module(id),
                id INTEGER NOT NULL,
                path TEXT NOT NULL
            );
            CREATE INDEX idx_source_file_module ON source_file(module_id);
            CREATE TABLE cached_patch
            (
                id INTEGER PRIMARY KEY,
                module_id INTEGER NOT NULL REFERENCES module(id),
                rva INTEGER NOT NULL,
                UNIQUE(module_id, rva)
            );
        "#,
    )])
}

/// `rusqlite`-backed implementation of [`MetadataCache`].
pub struct SqliteMetadataCache {
    connection: Mutex<Connection>,
}

impl SqliteMetadataCache {
    pub fn open(path: &Path) -> Result<Self> {
        let mut connection = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )
        .map_err(Error::Query)?;
        connection
            .pragma_update(None, "journal_mode", "WAL")
            .map_err(Error::Query)?;
        migrations()
            .to_latest(&mut connection)
            .map_err(|source| Error::Open {
                path: path.display().to_string(),
                source,
            })?;
        Ok(SqliteMetadataCache {
            connection: Mutex::new(connection),
        })
    }

    pub fn open_in_memory() -> Result<Self> {
        let mut connection = Connection::open_in_memory().map_err(Error::Query)?;
        migrations()
            .to_latest(&mut connection)
            .map_err(|source| Error::Open {
                path: ":memory:".to_string(),
                source,
            })?;
        Ok(SqliteMetadataCache {
            connection: Mutex::new(connection),
        })
    }
}

impl MetadataCache for SqliteMetadataCache {
    fn load_module(&self, module_id: ModuleId) -> Result<Option<ModuleMetadata>> {
        let connection = self.connection.lock().unwrap();
        let row = connection
            .query_row(
                "SELECT hash, path, file_id FROM module WHERE id = ?1",
                params![module_id.0 as i64],
                |row| {
                    let hash: i64 = row.get(0)?;
                    let path: String = row.get(1)?;
                    let file_id: String = row.get(2)?;
                    Ok((hash as u32, path, file_id))
                },
            )
            .map(Some)
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(other),
            })?;
        let Some((content_hash, path, file_id)) = row else {
            return Ok(None);
        };

        let mut symbols_stmt = connection.prepare_cached(
            "SELECT rva, size, name, file_id, line FROM symbol_info WHERE module_id = ?1",
        )?;
        let symbols = symbols_stmt
            .query_map(params![module_id.0 as i64], |row| {
                Ok(Symbol {
                    module_id,
                    rva: row.get::<_, i64>(0)? as Rva,
                    size: row.get::<_, i64>(1)? as u32,
                    name: row.get(2)?,
                    file_id: row.get::<_, i64>(3)? as u32,
                    line: row.get::<_, i64>(4)? as u32,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        let mut files_stmt = connection
            .prepare_cached("SELECT id, path FROM source_file WHERE module_id = ?1")?;
        let source_files = files_stmt
            .query_map(params![module_id.0 as i64], |row| {
                Ok(SourceFile {
                    id: row.get::<_, i64>(0)? as u32,
                    path: row.get(1)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        Ok(Some(ModuleMetadata {
            module_id,
            file_id,
            path,
            content_hash,
            symbols,
            source_files,
        }))
    }

    fn store_module(&self, metadata: &ModuleMetadata) -> Result<()> {
        let connection = self.connection.lock().unwrap();
        connection.execute(
            "INSERT INTO module (id, hash, path, file_id) VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(id) DO UPDATE SET hash = ?2, path = ?3, file_id = ?4",
            params![
                metadata.module_id.0 as i64,
                metadata.content_hash as i64,
                metadata.path,
                metadata.file_id,
            ],
        )?;
        connection.execute(
            "DELETE FROM symbol_info WHERE module_id = ?1",
            params![metadata.module_id.0 as i64],
        )?;
        connection.execute(
            "DELETE FROM source_file WHERE module_id = ?1",
            params![metadata.module_id.0 as i64],
        )?;
        {
            let mut stmt = connection.prepare_cached(
                "INSERT INTO symbol_info (module_id, rva, size, name, file_id, line)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            )?;
            for symbol in &metadata.symbols {
                stmt.execute(params![
                    metadata.module_id.0 as i64,
                    symbol.rva as i64,
                    symbol.size as i64,
                    symbol.name,
                    symbol.file_id as i64,
                    symbol.line as i64,
                ])?;
            }
        }
        {
            let mut stmt = connection.prepare_cached(
                "INSERT INTO source_file (module_id, id, path) VALUES (?1, ?2, ?3)",
            )?;
            for source_file in &metadata.source_files {
                stmt.execute(params![
                    metadata.module_id.0 as i64,
                    source_file.id as i64,
                    source_file.path,
                ])?;
            }
        }
        Ok(())
    }

    fn cached_patches(&self, module_id: ModuleId) -> Result<Vec<Rva>> {
        let connection = self.connection.lock().unwrap();
        let mut stmt = connection
            .prepare_cached("SELECT rva FROM cached_patch WHERE module_id = ?1")?;
        let rvas = stmt
            .query_map(params![module_id.0 as i64], |row| {
                Ok(row.get::<_, i64>(0)? as Rva)
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rvas)
    }

    fn record_patch(&self, module_id: ModuleId, rva: Rva) -> Result<()> {
        let connection = self.connection.lock().unwrap();
        connection.execute(
            "INSERT INTO cached_patch (module_id, rva) VALUES (?1, ?2)
             ON CONFLICT(module_id, rva) DO NOTHING",
            params![module_id.0 as i64, rva as i64],
        )?;
        Ok(())
    }

    fn forget_module(&self, module_id: ModuleId) -> Result<()> {
        let connection = self.connection.lock().unwrap();
        connection.execute(
            "DELETE FROM cached_patch WHERE module_id = ?1",
            params![module_id.0 as i64],
        )?;
        connection.execute(
            "DELETE FROM symbol_info WHERE module_id = ?1",
            params![module_id.0 as i64],
        )?;
        connection.execute(
            "DELETE FROM source_file WHERE module_id = ?1",
            params![module_id.0 as i64],
        )?;
        connection.execute(
            "DELETE FROM module WHERE id = ?1",
            params![module_id.0 as i64],
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_metadata() -> ModuleMetadata {
        ModuleMetadata {
            module_id: ModuleId(140),
            file_id: "abc123".to_string(),
            path: "/lib/libfoo.so".to_string(),
            content_hash: 0xdead_beef,
            symbols: vec![Symbol {
                module_id: ModuleId(140),
                rva: 0x100,
                size: 0x20,
                name: "foo".to_string(),
                file_id: 1,
                line: 42,
            }],
            source_files: vec![SourceFile {
                id: 1,
                path: "foo.c".to_string(),
            }],
        }
    }

    #[test]
    fn store_then_load_round_trips() {
        let cache = SqliteMetadataCache::open_in_memory().unwrap();
        let metadata = sample_metadata();
        cache.store_module(&metadata).unwrap();

        let loaded = cache.load_module(ModuleId(140)).unwrap().unwrap();
        assert_eq!(loaded, metadata);
    }

    #[test]
    fn load_of_unknown_module_is_none() {
        let cache = SqliteMetadataCache::open_in_memory().unwrap();
        assert!(cache.load_module(ModuleId(999)).unwrap().is_none());
    }

    #[test]
    fn storing_again_replaces_symbols_and_source_files() {
        let cache = SqliteMetadataCache::open_in_memory().unwrap();
        cache.store_module(&sample_metadata()).unwrap();

        let mut updated = sample_metadata();
        updated.symbols.clear();
        cache.store_module(&updated).unwrap();

        let loaded = cache.load_module(ModuleId(140)).unwrap().unwrap();
        assert!(loaded.symbols.is_empty());
    }

    #[test]
    fn record_patch_is_idempotent_and_forget_clears_everything() {
        let cache = SqliteMetadataCache::open_in_memory().unwrap();
        cache.store_module(&sample_metadata()).unwrap();
        cache.record_patch(ModuleId(140), 0x100).unwrap();
        cache.record_patch(ModuleId(140), 0x100).unwrap();

        assert_eq!(cache.cached_patches(ModuleId(140)).unwrap(), vec![0x100]);

        cache.forget_module(ModuleId(140)).unwrap();
        assert!(cache.load_module(ModuleId(140)).unwrap().is_none());
        assert!(cache.cached_patches(ModuleId(140)).unwrap().is_empty());
    }
}
