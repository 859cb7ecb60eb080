//! redb-backed persistence for delivery records

use super::DeliveryRecord;
use redb::{Database, ReadableDatabase, ReadableTable, TableDefinition};
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;

/// Delivery records: key = order_id, value = JSON
const DELIVERY_RECORDS_TABLE: TableDefinition<&str, &[u8]> =
    TableDefinition::new("delivery_records");

#[derive(Debug, Error)]
pub enum TrackerError {
    #[error("Database error: {0}")]
    Database(#[from] redb::DatabaseError),

    #[error("Transaction error: {0}")]
    Transaction(#[from] redb::TransactionError),

    #[error("Table error: {0}")]
    Table(#[from] redb::TableError),

    #[error("Storage error: {0}")]
    Storage(#[from] redb::StorageError),

    #[error("Commit error: {0}")]
    Commit(#[from] redb::CommitError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type TrackerResult<T> = Result<T, TrackerError>;

#[derive(Clone)]
pub struct DeliveryStorage {
    db: Arc<Database>,
}

impl DeliveryStorage {
    /// Open or create database
    pub fn open(path: impl AsRef<Path>) -> TrackerResult<Self> {
        let db = Database::create(path)?;
        Self::init(db)
    }

    /// Open in-memory database (for testing)
    #[cfg(test)]
    pub fn open_in_memory() -> TrackerResult<Self> {
        let db =
            Database::builder().create_with_backend(redb::backends::InMemoryBackend::new())?;
        Self::init(db)
    }

    fn init(db: Database) -> TrackerResult<Self> {
        let write_txn = db.begin_write()?;
        {
            let _ = write_txn.open_table(DELIVERY_RECORDS_TABLE)?;
        }
        write_txn.commit()?;
        Ok(Self { db: Arc::new(db) })
    }

    /// Write a record, replacing any previous version
    pub fn put(&self, record: &DeliveryRecord) -> TrackerResult<()> {
        let value = serde_json::to_vec(record)?;
        let txn = self.db.begin_write()?;
        {
            let mut table = txn.open_table(DELIVERY_RECORDS_TABLE)?;
            table.insert(record.order_id.as_str(), value.as_slice())?;
        }
        txn.commit()?;
        Ok(())
    }

    #[cfg(test)]
    pub fn get(&self, order_id: &str) -> TrackerResult<Option<DeliveryRecord>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(DELIVERY_RECORDS_TABLE)?;

        match table.get(order_id)? {
            Some(guard) => Ok(Some(serde_json::from_slice(guard.value())?)),
            None => Ok(None),
        }
    }

    /// Load every record
    pub fn load_all(&self) -> TrackerResult<Vec<DeliveryRecord>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(DELIVERY_RECORDS_TABLE)?;

        let mut records = Vec::new();
        for result in table.iter()? {
            let (_, guard) = result?;
            records.push(serde_json::from_slice(guard.value())?);
        }
        Ok(records)
    }

    #[cfg(test)]
    pub fn count(&self) -> TrackerResult<u64> {
        use redb::ReadableTableMetadata;

        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(DELIVERY_RECORDS_TABLE)?;
        Ok(table.len()?)
    }
}
