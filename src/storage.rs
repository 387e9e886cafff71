use crate::{
    error::SinkError,
    publisher::RecordStore,
    record::BlockRecord,
};
use alloy_primitives::B256;
use anyhow::{Context, Result};
use async_trait::async_trait;
use rocksdb::{ColumnFamilyDescriptor, Direction, IteratorMode, Options, WriteBatch, DB};
use serde::de::DeserializeOwned;
use std::sync::Arc;
use tracing::info;

const CF_BLOCK: &str = "block";
const CF_BLOCK_NUMBER: &str = "block_number";

// Records are stored with bincode; the number index key is
// `number BE (8) | hash (32)` with an empty value.

pub struct RocksStore {
    pub db: DB,
    path: String,
}

impl RocksStore {
    /// Perform database health check
    pub fn health_check(&self) -> Result<()> {
        let test_key = b"health_check";
        self.db.put(test_key, b"ok").with_context(|| "Database write test failed")?;
        let value = self.db.get(test_key).with_context(|| "Database read test failed")?;
        if value.as_deref() != Some(b"ok") {
            anyhow::bail!("Database read/write consistency check failed");
        }
        self.db.delete(test_key).with_context(|| "Database delete test failed")?;
        Ok(())
    }

    pub fn open(path: &str) -> Result<Self> {
        let cf_names = ["default", CF_BLOCK, CF_BLOCK_NUMBER];

        let mut cf_opts = Options::default();
        cf_opts.set_write_buffer_size(64 * 1024 * 1024); // 64MB
        cf_opts.set_max_write_buffer_number(2);
        cf_opts.set_target_file_size_base(64 * 1024 * 1024);

        let cf_descriptors: Vec<ColumnFamilyDescriptor> = cf_names
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, cf_opts.clone()))
            .collect();

        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);

        let wal_dir = format!("{path}/logs");
        std::fs::create_dir_all(&wal_dir).with_context(|| format!("Failed to create '{wal_dir}'"))?;
        db_opts.set_wal_dir(&wal_dir);

        // Rely on WAL + periodic fsync
        db_opts.set_use_fsync(false);
        db_opts.set_bytes_per_sync(8 * 1024 * 1024);
        db_opts.set_wal_bytes_per_sync(8 * 1024 * 1024);
        db_opts.set_max_background_jobs(4);
        db_opts.set_max_open_files(512);
        db_opts.set_wal_recovery_mode(rocksdb::DBRecoveryMode::TolerateCorruptedTailRecords);
        db_opts.set_keep_log_file_num(10);

        let db = DB::open_cf_descriptors(&db_opts, path, cf_descriptors)
            .with_context(|| format!("Failed to open database at '{path}'"))?;

        let store = RocksStore { db, path: path.to_string() };
        store.health_check().with_context(|| "Database health check failed during initialization")?;

        info!(path = %store.path, "record store opened");
        Ok(store)
    }

    pub fn get<T: DeserializeOwned>(&self, cf: &str, key: &[u8]) -> Result<Option<T>> {
        let handle = self.db.cf_handle(cf)
            .ok_or_else(|| anyhow::anyhow!("Column family '{}' not found", cf))?;
        match self.db.get_cf(handle, key)? {
            Some(value) => bincode::deserialize(&value)
                .map(Some)
                .with_context(|| format!("Failed to deserialize key '{}' in CF '{cf}'", hex::encode(key))),
            None => Ok(None),
        }
    }

    /// Persist a block record and its number index atomically.
    pub fn put_block_record(&self, record: &BlockRecord) -> Result<()> {
        let blocks = self.db.cf_handle(CF_BLOCK)
            .ok_or_else(|| anyhow::anyhow!("Column family '{}' not found", CF_BLOCK))?;
        let numbers = self.db.cf_handle(CF_BLOCK_NUMBER)
            .ok_or_else(|| anyhow::anyhow!("Column family '{}' not found", CF_BLOCK_NUMBER))?;
        let data = bincode::serialize(record)
            .with_context(|| format!("Failed to serialize block record {}", record.hash))?;

        let mut batch = WriteBatch::default();
        batch.put_cf(blocks, record.hash.as_slice(), &data);
        batch.put_cf(numbers, number_key(record.number, &record.hash), b"");
        self.db.write(batch).with_context(|| format!("Failed to write block record {}", record.hash))
    }

    pub fn get_block_record(&self, hash: &B256) -> Result<Option<BlockRecord>> {
        self.get(CF_BLOCK, hash.as_slice())
    }

    /// Every record stored for block `number`, one per distinct hash.
    pub fn find_by_number(&self, number: u64) -> Result<Vec<BlockRecord>> {
        let numbers = self.db.cf_handle(CF_BLOCK_NUMBER)
            .ok_or_else(|| anyhow::anyhow!("Column family '{}' not found", CF_BLOCK_NUMBER))?;
        let prefix = number.to_be_bytes();
        let iter = self.db.iterator_cf(numbers, IteratorMode::From(&prefix, Direction::Forward));

        let mut out = Vec::new();
        for item in iter {
            let (key, _) = item?;
            if key.len() != 40 || key[..8] != prefix {
                break;
            }
            let hash = B256::from_slice(&key[8..]);
            if let Some(record) = self.get_block_record(&hash)? {
                out.push(record);
            }
        }
        Ok(out)
    }

    pub fn block_count(&self) -> Result<u64> {
        let cf = self.db.cf_handle(CF_BLOCK)
            .ok_or_else(|| anyhow::anyhow!("Column family '{}' not found", CF_BLOCK))?;
        let mut count = 0;
        for item in self.db.iterator_cf(cf, IteratorMode::Start) {
            item?;
            count += 1;
        }
        Ok(count)
    }

    pub fn flush(&self) -> Result<()> {
        self.db.flush().with_context(|| "Failed to flush database")
    }
}

fn number_key(number: u64, hash: &B256) -> [u8; 40] {
    let mut key = [0u8; 40];
    key[..8].copy_from_slice(&number.to_be_bytes());
    key[8..].copy_from_slice(hash.as_slice());
    key
}

#[async_trait]
impl RecordStore for RocksStore {
    async fn insert_block_record(&self, record: &BlockRecord) -> Result<(), SinkError> {
        self.put_block_record(record).map_err(|e| SinkError::Rejected(format!("{e:#}")))
    }
}

pub fn open(cfg: &crate::config::Storage) -> Result<Arc<RocksStore>> {
    let store = RocksStore::open(&cfg.path).with_context(|| {
        format!("Record store failed to open at '{}' (another instance running? stale {}/LOCK?)", cfg.path, cfg.path)
    })?;
    Ok(Arc::new(store))
}
