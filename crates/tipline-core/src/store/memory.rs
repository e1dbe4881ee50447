#![allow(clippy::disallowed_types, reason = "Synchronous in-memory operations only")]

use std::{
    collections::{BTreeMap, HashMap},
    sync::{Arc, Mutex},
};

use async_trait::async_trait;

use super::{Store, StoreError, WriteOp};

/// In-memory store implementation for testing and simulation
///
/// Uses a `BTreeMap` per collection so range queries come back in ID order.
/// All state is wrapped in Arc<Mutex<>> to allow Clone and concurrent
/// access; clones share the same underlying data. Thread-safe through
/// Mutex, but uses `lock().expect()` which will panic if the mutex is
/// poisoned - acceptable for test code.
///
/// Supports injected outages (`fail_next`) so retry behavior can be
/// exercised deterministically.
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<MemoryStoreInner>>,
}

#[derive(Default)]
struct MemoryStoreInner {
    /// Records per collection, ordered by ID
    collections: HashMap<String, BTreeMap<String, Vec<u8>>>,
    /// Number of upcoming operations that fail with `Unavailable`
    outage_remaining: u32,
}

impl MemoryStore {
    /// Create a new empty `MemoryStore`
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `count` operations fail with `StoreError::Unavailable`.
    ///
    /// # Panics
    ///
    /// Panics if the internal mutex is poisoned. Acceptable for test code.
    #[allow(clippy::expect_used)]
    pub fn fail_next(&self, count: u32) {
        self.inner.lock().expect("Mutex poisoned").outage_remaining = count;
    }

    /// Number of records in a collection.
    ///
    /// Useful for debugging and testing.
    ///
    /// # Panics
    ///
    /// Panics if the internal mutex is poisoned. Acceptable for test code.
    #[allow(clippy::expect_used)]
    pub fn record_count(&self, collection: &str) -> usize {
        let inner = self.inner.lock().expect("Mutex poisoned");
        inner.collections.get(collection).map_or(0, BTreeMap::len)
    }

    /// Overwrite a record in place, bypassing the `Store` trait.
    ///
    /// Exists so tamper-detection tests can mutate persisted audit entries
    /// the way an attacker with storage access would.
    ///
    /// # Panics
    ///
    /// Panics if the internal mutex is poisoned. Acceptable for test code.
    #[allow(clippy::expect_used)]
    pub fn corrupt(&self, collection: &str, id: &str, record: Vec<u8>) {
        let mut inner = self.inner.lock().expect("Mutex poisoned");
        inner.collections.entry(collection.to_string()).or_default().insert(id.to_string(), record);
    }

    #[allow(clippy::expect_used)]
    fn check_outage(&self) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().expect("Mutex poisoned");
        if inner.outage_remaining > 0 {
            inner.outage_remaining -= 1;
            return Err(StoreError::Unavailable("injected outage".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl Store for MemoryStore {
    /// # Panics
    ///
    /// Panics if the internal mutex is poisoned. Acceptable for test code.
    #[allow(clippy::expect_used)]
    async fn get(&self, collection: &str, id: &str) -> Result<Vec<u8>, StoreError> {
        self.check_outage()?;
        let inner = self.inner.lock().expect("Mutex poisoned");
        inner.collections.get(collection).and_then(|records| records.get(id)).cloned().ok_or_else(
            || StoreError::NotFound { collection: collection.to_string(), id: id.to_string() },
        )
    }

    /// # Panics
    ///
    /// Panics if the internal mutex is poisoned. Acceptable for test code.
    #[allow(clippy::expect_used)]
    async fn put(&self, collection: &str, id: &str, record: Vec<u8>) -> Result<(), StoreError> {
        self.check_outage()?;
        let mut inner = self.inner.lock().expect("Mutex poisoned");
        inner.collections.entry(collection.to_string()).or_default().insert(id.to_string(), record);
        Ok(())
    }

    /// # Panics
    ///
    /// Panics if the internal mutex is poisoned. Acceptable for test code.
    #[allow(clippy::expect_used)]
    async fn query_range(
        &self,
        collection: &str,
        start: &str,
        end: &str,
    ) -> Result<Vec<(String, Vec<u8>)>, StoreError> {
        self.check_outage()?;
        let inner = self.inner.lock().expect("Mutex poisoned");
        let Some(records) = inner.collections.get(collection) else {
            return Ok(Vec::new());
        };
        Ok(records
            .range(start.to_string()..=end.to_string())
            .map(|(id, record)| (id.clone(), record.clone()))
            .collect())
    }

    /// # Panics
    ///
    /// Panics if the internal mutex is poisoned. Acceptable for test code.
    #[allow(clippy::expect_used)]
    async fn batch_write(&self, ops: Vec<WriteOp>) -> Result<(), StoreError> {
        self.check_outage()?;
        let mut inner = self.inner.lock().expect("Mutex poisoned");
        for op in ops {
            match op {
                WriteOp::Put { collection, id, record } => {
                    inner.collections.entry(collection).or_default().insert(id, record);
                },
                WriteOp::Delete { collection, id } => {
                    if let Some(records) = inner.collections.get_mut(&collection) {
                        records.remove(&id);
                    }
                },
            }
        }
        Ok(())
    }
}
