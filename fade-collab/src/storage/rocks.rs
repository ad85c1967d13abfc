//! RocksDB-backed snapshot store.
//!
//! Column families:
//! - `snapshots` — bincode-encoded [`ProjectSnapshot`], LZ4 compressed
//! - `metadata`  — [`SnapshotMetadata`] per code (bincode)
//!
//! Both are keyed by the session code's bytes and written in one batch.

use std::path::{Path, PathBuf};

use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode,
    IteratorMode, Options, SingleThreaded, WriteBatch, WriteOptions,
};
use serde::{Deserialize, Serialize};

use super::{ProjectSnapshot, SnapshotStore, StoreError};

const CF_SNAPSHOTS: &str = "snapshots";
const CF_METADATA: &str = "metadata";

const COLUMN_FAMILIES: &[&str] = &[CF_SNAPSHOTS, CF_METADATA];

/// Store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Database directory path
    pub path: PathBuf,
    /// Block cache size in bytes (default: 64MB)
    pub block_cache_size: usize,
    /// Bloom filter bits per key (default: 10)
    pub bloom_filter_bits: i32,
    /// fsync on every write (default: true; saves are rare and user-initiated)
    pub sync_writes: bool,
    pub max_open_files: i32,
    /// Write buffer size per column family (default: 16MB)
    pub write_buffer_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("fade_data"),
            block_cache_size: 64 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: true,
            max_open_files: 256,
            write_buffer_size: 16 * 1024 * 1024,
        }
    }
}

impl StoreConfig {
    /// Small caches, no fsync.
    pub fn for_testing(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            block_cache_size: 8 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 64,
            write_buffer_size: 4 * 1024 * 1024,
        }
    }
}

/// Bookkeeping stored next to each snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotMetadata {
    pub code: String,
    pub file_count: u64,
    /// Encoded size before compression.
    pub raw_size: u64,
    pub compressed_size: u64,
    pub saved_at: u64,
}

fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, StoreError> {
    bincode::serde::encode_to_vec(value, bincode::config::standard())
        .map_err(|e| StoreError::SerializationError(e.to_string()))
}

fn decode<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> Result<T, StoreError> {
    let (value, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
        .map_err(|e| StoreError::DeserializationError(e.to_string()))?;
    Ok(value)
}

pub struct RocksSnapshotStore {
    db: DBWithThreadMode<SingleThreaded>,
    config: StoreConfig,
}

impl RocksSnapshotStore {
    /// Open the store, creating the database and column families if missing.
    pub fn open(config: StoreConfig) -> Result<Self, StoreError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_open_files(config.max_open_files);
        db_opts.set_keep_log_file_num(5);

        let cf_descriptors: Vec<ColumnFamilyDescriptor> = COLUMN_FAMILIES
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Self::cf_options(name, &config)))
            .collect();

        let db = DBWithThreadMode::<SingleThreaded>::open_cf_descriptors(
            &db_opts,
            &config.path,
            cf_descriptors,
        )?;
        log::info!("Opened snapshot store at {}", config.path.display());
        Ok(Self { db, config })
    }

    fn cf_options(name: &str, config: &StoreConfig) -> Options {
        let mut opts = Options::default();

        let mut block_opts = BlockBasedOptions::default();
        let cache = Cache::new_lru_cache(config.block_cache_size);
        block_opts.set_block_cache(&cache);
        block_opts.set_bloom_filter(config.bloom_filter_bits as f64, false);
        opts.set_block_based_table_factory(&block_opts);
        opts.set_write_buffer_size(config.write_buffer_size);

        match name {
            // Values are already LZ4 compressed.
            CF_SNAPSHOTS => opts.set_compression_type(DBCompressionType::None),
            _ => {
                opts.set_compression_type(DBCompressionType::Lz4);
                opts.optimize_for_point_lookup(config.block_cache_size as u64);
            }
        }
        opts
    }

    pub fn path(&self) -> &Path {
        &self.config.path
    }

    fn cf(&self, name: &str) -> Result<&rocksdb::ColumnFamily, StoreError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StoreError::DatabaseError(format!("Column family '{name}' not found")))
    }

    pub fn metadata(&self, code: &str) -> Result<Option<SnapshotMetadata>, StoreError> {
        let cf = self.cf(CF_METADATA)?;
        self.db
            .get_cf(cf, code.as_bytes())?
            .map(|bytes| decode(&bytes))
            .transpose()
    }

    /// Persist and return the metadata written.
    pub fn save_with_metadata(
        &self,
        code: &str,
        snapshot: &ProjectSnapshot,
    ) -> Result<SnapshotMetadata, StoreError> {
        let cf_snapshots = self.cf(CF_SNAPSHOTS)?;
        let cf_meta = self.cf(CF_METADATA)?;

        let raw = encode(snapshot)?;
        let compressed = lz4_flex::compress_prepend_size(&raw);
        let meta = SnapshotMetadata {
            code: code.to_owned(),
            file_count: snapshot.files.len() as u64,
            raw_size: raw.len() as u64,
            compressed_size: compressed.len() as u64,
            saved_at: snapshot.saved_at,
        };

        let mut batch = WriteBatch::default();
        batch.put_cf(cf_snapshots, code.as_bytes(), &compressed);
        batch.put_cf(cf_meta, code.as_bytes(), encode(&meta)?);

        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.config.sync_writes);
        self.db.write_opt(batch, &write_opts)?;

        log::debug!(
            "Saved snapshot {code}: {} files, {} → {} bytes",
            meta.file_count,
            meta.raw_size,
            meta.compressed_size
        );
        Ok(meta)
    }

    /// Flush memtables to disk.
    pub fn flush(&self) -> Result<(), StoreError> {
        for name in COLUMN_FAMILIES {
            self.db.flush_cf(self.cf(name)?)?;
        }
        Ok(())
    }
}

impl SnapshotStore for RocksSnapshotStore {
    fn save(&self, code: &str, snapshot: &ProjectSnapshot) -> Result<(), StoreError> {
        self.save_with_metadata(code, snapshot).map(|_| ())
    }

    fn load(&self, code: &str) -> Result<Option<ProjectSnapshot>, StoreError> {
        let cf = self.cf(CF_SNAPSHOTS)?;
        let Some(compressed) = self.db.get_cf(cf, code.as_bytes())? else {
            return Ok(None);
        };
        let raw = lz4_flex::decompress_size_prepended(&compressed)
            .map_err(|e| StoreError::CompressionError(e.to_string()))?;
        decode(&raw).map(Some)
    }

    fn delete(&self, code: &str) -> Result<bool, StoreError> {
        let cf_snapshots = self.cf(CF_SNAPSHOTS)?;
        let cf_meta = self.cf(CF_METADATA)?;
        if self.db.get_cf(cf_meta, code.as_bytes())?.is_none() {
            return Ok(false);
        }

        let mut batch = WriteBatch::default();
        batch.delete_cf(cf_snapshots, code.as_bytes());
        batch.delete_cf(cf_meta, code.as_bytes());
        self.db.write(batch)?;
        Ok(true)
    }

    fn list(&self) -> Result<Vec<String>, StoreError> {
        let cf = self.cf(CF_METADATA)?;
        let mut codes = Vec::new();
        for item in self.db.iterator_cf(cf, IteratorMode::Start) {
            let (key, _) = item?;
            let code = String::from_utf8(key.to_vec())
                .map_err(|e| StoreError::DeserializationError(e.to_string()))?;
            codes.push(code);
        }
        Ok(codes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_temp() -> (tempfile::TempDir, RocksSnapshotStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = RocksSnapshotStore::open(StoreConfig::for_testing(dir.path())).unwrap();
        (dir, store)
    }

    fn snapshot(files: &[(&str, &str)]) -> ProjectSnapshot {
        ProjectSnapshot {
            session_name: "demo".into(),
            files: files
                .iter()
                .map(|(p, c)| (p.to_string(), c.to_string()))
                .collect(),
            images: vec!["logo.png".into()],
            saved_at: 1_700_000_000_000,
        }
    }

    #[test]
    fn test_save_load() {
        let (_dir, store) = open_temp();
        let snap = snapshot(&[("src/main.rs", "fn main() {}\n"), ("README.md", "# demo")]);
        store.save("ABCDE", &snap).unwrap();
        assert_eq!(store.load("ABCDE").unwrap(), Some(snap));
        assert!(store.path().exists());
    }

    #[test]
    fn test_missing_code_is_none() {
        let (_dir, store) = open_temp();
        assert_eq!(store.load("NOPE1").unwrap(), None);
        assert_eq!(store.metadata("NOPE1").unwrap(), None);
        assert!(!store.delete("NOPE1").unwrap());
    }

    #[test]
    fn test_overwrite_keeps_latest() {
        let (_dir, store) = open_temp();
        store.save("ABCDE", &snapshot(&[("a", "1")])).unwrap();
        let newer = snapshot(&[("a", "2"), ("b", "3")]);
        store.save("ABCDE", &newer).unwrap();
        assert_eq!(store.load("ABCDE").unwrap(), Some(newer));
        assert_eq!(store.metadata("ABCDE").unwrap().unwrap().file_count, 2);
    }

    #[test]
    fn test_compression_metadata() {
        let (_dir, store) = open_temp();
        let body = "let x = 1;\n".repeat(2_000);
        let meta = store
            .save_with_metadata("ABCDE", &snapshot(&[("big.rs", &body)]))
            .unwrap();
        assert!(meta.compressed_size < meta.raw_size / 5);
        assert_eq!(store.metadata("ABCDE").unwrap(), Some(meta));
    }

    #[test]
    fn test_list_and_delete() {
        let (_dir, store) = open_temp();
        store.save("BBBBB", &snapshot(&[])).unwrap();
        store.save("AAAAA", &snapshot(&[])).unwrap();
        assert_eq!(store.list().unwrap(), vec!["AAAAA", "BBBBB"]);

        assert!(store.delete("AAAAA").unwrap());
        assert_eq!(store.list().unwrap(), vec!["BBBBB"]);
        assert_eq!(store.load("AAAAA").unwrap(), None);
    }

    #[test]
    fn test_reopen_persists() {
        let dir = tempfile::tempdir().unwrap();
        let snap = snapshot(&[("notes.txt", "persist me")]);
        {
            let store = RocksSnapshotStore::open(StoreConfig::for_testing(dir.path())).unwrap();
            store.save("ABCDE", &snap).unwrap();
            store.flush().unwrap();
        }
        let store = RocksSnapshotStore::open(StoreConfig::for_testing(dir.path())).unwrap();
        assert_eq!(store.load("ABCDE").unwrap(), Some(snap));
    }
}
