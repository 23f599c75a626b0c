use parking_lot::RwLock;
use std::{collections::BTreeMap, fmt::Debug, sync::Arc};

/// Database error type.
#[derive(Debug, thiserror::Error, PartialEq, Eq, Clone)]
pub enum DatabaseError {
    /// Failed to read a value from the database.
    #[error("Database read error: {0}")]
    Read(String),
    /// Failed to write a batch into the database.
    #[error("Database write error: {0}")]
    Write(String),
    /// The database has been closed.
    #[error("Database is closed")]
    Closed,
}

/// A single mutation of a [`WriteBatch`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchOp {
    /// Store the value under the key.
    Put(Vec<u8>, Vec<u8>),
    /// Remove the key.
    Delete(Vec<u8>),
}

/// A set of mutations that is applied atomically by [`KeyValueStore::write_batch`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WriteBatch {
    ops: Vec<BatchOp>,
}

impl WriteBatch {
    /// Queue a put.
    pub fn put(&mut self, key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) {
        self.ops.push(BatchOp::Put(key.into(), value.into()));
    }

    /// Queue a delete.
    pub fn delete(&mut self, key: impl Into<Vec<u8>>) {
        self.ops.push(BatchOp::Delete(key.into()));
    }

    /// Number of queued mutations.
    pub fn len(&self) -> usize {
        self.ops.len()
    }

    /// Returns true if nothing has been queued.
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// The queued mutations in insertion order.
    pub fn ops(&self) -> &[BatchOp] {
        &self.ops
    }

    /// Consume the batch.
    pub fn into_ops(self) -> Vec<BatchOp> {
        self.ops
    }
}

/// An ordered byte key-value store with atomic batch writes.
pub trait KeyValueStore: Debug + Send + Sync {
    /// Read the value stored under `key`.
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, DatabaseError>;

    /// Apply all mutations of the batch atomically.
    fn write_batch(&self, batch: WriteBatch) -> Result<(), DatabaseError>;

    /// Returns true if a value is stored under `key`.
    fn has(&self, key: &[u8]) -> Result<bool, DatabaseError> {
        Ok(self.get(key)?.is_some())
    }

    /// Store a single value.
    fn put(&self, key: &[u8], value: &[u8]) -> Result<(), DatabaseError> {
        let mut batch = WriteBatch::default();
        batch.put(key, value);
        self.write_batch(batch)
    }

    /// Remove a single key.
    fn delete(&self, key: &[u8]) -> Result<(), DatabaseError> {
        let mut batch = WriteBatch::default();
        batch.delete(key);
        self.write_batch(batch)
    }
}

impl<T: KeyValueStore + ?Sized> KeyValueStore for Arc<T> {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, DatabaseError> {
        (**self).get(key)
    }

    fn write_batch(&self, batch: WriteBatch) -> Result<(), DatabaseError> {
        (**self).write_batch(batch)
    }
}

/// A [`KeyValueStore`] kept entirely in memory.
#[derive(Debug, Default)]
pub struct MemoryDatabase {
    inner: RwLock<BTreeMap<Vec<u8>, Vec<u8>>>,
}

impl MemoryDatabase {
    /// Create an empty database.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored keys.
    pub fn len(&self) -> usize {
        self.inner.read().len()
    }

    /// Returns true if nothing is stored.
    pub fn is_empty(&self) -> bool {
        self.inner.read().is_empty()
    }

    /// All keys starting with the given prefix.
    pub fn keys_with_prefix(&self, prefix: &[u8]) -> Vec<Vec<u8>> {
        self.inner
            .read()
            .range(prefix.to_vec()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(key, _)| key.clone())
            .collect()
    }
}

impl KeyValueStore for MemoryDatabase {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, DatabaseError> {
        Ok(self.inner.read().get(key).cloned())
    }

    fn write_batch(&self, batch: WriteBatch) -> Result<(), DatabaseError> {
        let mut inner = self.inner.write();
        for op in batch.into_ops() {
            match op {
                BatchOp::Put(key, value) => {
                    inner.insert(key, value);
                }
                BatchOp::Delete(key) => {
                    inner.remove(&key);
                }
            }
        }
        Ok(())
    }
}
