//! RocksDB-backed key/value store.
//!
//! Values are LZ4-compressed (size-prepended) before they reach RocksDB, so
//! the large `document:{id}` records stay small on disk.
//!
//! Reference: Kleppmann: DDIA, Chapter 3 (LSM Trees, SSTables)

use rocksdb::{BlockBasedOptions, Cache, DBCompressionType, Options, WriteOptions, DB};
use serde::Deserialize;
use std::path::{Path, PathBuf};

use super::{KeyValueStore, StoreError};

/// Store configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Database directory (None = keep everything in memory)
    pub path: Option<PathBuf>,
    /// Block cache size in bytes (default: 64MB)
    pub block_cache_size: usize,
    /// Bloom filter bits per key (default: 10)
    pub bloom_filter_bits: i32,
    /// Enable fsync on every write (default: false)
    pub sync_writes: bool,
    /// Max open files for RocksDB (default: 512)
    pub max_open_files: i32,
    /// Write buffer size (default: 32MB)
    pub write_buffer_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: None,
            block_cache_size: 64 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 512,
            write_buffer_size: 32 * 1024 * 1024,
        }
    }
}

impl StoreConfig {
    /// Config for testing (small caches).
    pub fn for_testing(path: impl Into<PathBuf>) -> Self {
        Self {
            path: Some(path.into()),
            block_cache_size: 8 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 64,
            write_buffer_size: 4 * 1024 * 1024,
        }
    }
}

/// RocksDB key/value store.
pub struct RocksStore {
    db: DB,
    path: PathBuf,
    sync_writes: bool,
}

impl RocksStore {
    /// Open (or create) the database at `config.path`.
    pub fn open(config: StoreConfig) -> Result<Self, StoreError> {
        let path = config
            .path
            .clone()
            .ok_or_else(|| StoreError::Unavailable("no storage path configured".into()))?;

        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.set_max_open_files(config.max_open_files);
        opts.set_keep_log_file_num(5);
        opts.increase_parallelism(num_cpus());
        opts.set_write_buffer_size(config.write_buffer_size);

        let mut block_opts = BlockBasedOptions::default();
        let cache = Cache::new_lru_cache(config.block_cache_size);
        block_opts.set_block_cache(&cache);
        block_opts.set_bloom_filter(config.bloom_filter_bits as f64, false);
        block_opts.set_block_size(16 * 1024);
        opts.set_block_based_table_factory(&block_opts);

        // Values arrive LZ4-compressed already.
        opts.set_compression_type(DBCompressionType::None);

        let db = DB::open(&opts, &path)?;
        log::info!("Opened document store at {}", path.display());

        Ok(Self {
            db,
            path,
            sync_writes: config.sync_writes,
        })
    }

    /// Database directory.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn write_options(&self) -> WriteOptions {
        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.sync_writes);
        write_opts
    }
}

impl KeyValueStore for RocksStore {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        match self.db.get(key.as_bytes())? {
            Some(compressed) => lz4_flex::decompress_size_prepended(&compressed)
                .map(Some)
                .map_err(|e| StoreError::Compression(e.to_string())),
            None => Ok(None),
        }
    }

    fn set(&self, key: &str, value: &[u8]) -> Result<(), StoreError> {
        let compressed = lz4_flex::compress_prepend_size(value);
        self.db
            .put_opt(key.as_bytes(), &compressed, &self.write_options())?;
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.db.delete_opt(key.as_bytes(), &self.write_options())?;
        Ok(())
    }

    fn flush(&self) -> Result<(), StoreError> {
        self.db.flush()?;
        Ok(())
    }
}

/// Get number of CPU cores for RocksDB parallelism.
fn num_cpus() -> i32 {
    std::thread::available_parallelism()
        .map(|n| n.get() as i32)
        .unwrap_or(4)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_temp() -> (tempfile::TempDir, RocksStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = RocksStore::open(StoreConfig::for_testing(dir.path().join("db"))).unwrap();
        (dir, store)
    }

    #[test]
    fn test_store_open() {
        let (_dir, store) = open_temp();
        assert!(store.path().exists());
    }

    #[test]
    fn test_open_without_path_fails() {
        let result = RocksStore::open(StoreConfig::default());
        assert!(matches!(result, Err(StoreError::Unavailable(_))));
    }

    #[test]
    fn test_set_get_delete() {
        let (_dir, store) = open_temp();
        assert_eq!(store.get("document:x").unwrap(), None);

        store.set("document:x", b"first").unwrap();
        store.set("document:x", b"second").unwrap();
        assert_eq!(store.get("document:x").unwrap(), Some(b"second".to_vec()));

        store.delete("document:x").unwrap();
        assert_eq!(store.get("document:x").unwrap(), None);
    }

    #[test]
    fn test_values_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let config = StoreConfig::for_testing(dir.path().join("db"));
        {
            let store = RocksStore::open(config.clone()).unwrap();
            store.set("document:keep", b"durable").unwrap();
            store.flush().unwrap();
        }
        let store = RocksStore::open(config).unwrap();
        assert_eq!(store.get("document:keep").unwrap(), Some(b"durable".to_vec()));
    }

    #[test]
    fn test_large_value_compresses() {
        let (_dir, store) = open_temp();
        let value = vec![42u8; 1_000_000];
        store.set("big", &value).unwrap();
        let loaded = store.get("big").unwrap().unwrap();
        assert_eq!(loaded.len(), 1_000_000);
        assert_eq!(loaded[999_999], 42);
    }

    #[test]
    fn test_store_config_default() {
        let config = StoreConfig::default();
        assert!(config.path.is_none());
        assert_eq!(config.bloom_filter_bits, 10);
        assert!(!config.sync_writes);
    }
}
