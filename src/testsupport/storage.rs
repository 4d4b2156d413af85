//! An in-memory [`Storage`] fake backed by a `DashMap` instead of a real
//! disk, for use in tests.

use async_trait::async_trait;
use dashmap::DashMap;

use crate::error::RuntimeResult;
use crate::kv_storage::Storage;

#[derive(Default)]
pub struct InMemoryStorage {
    data: DashMap<Vec<u8>, Vec<u8>>,
}

impl InMemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Storage for InMemoryStorage {
    async fn put(&self, key: &[u8], value: &[u8], _durable: bool) -> RuntimeResult<()> {
        self.data.insert(key.to_vec(), value.to_vec());
        Ok(())
    }

    async fn get(&self, key: &[u8]) -> RuntimeResult<Option<Vec<u8>>> {
        Ok(self.data.get(key).map(|v| v.clone()))
    }

    async fn delete(&self, key: &[u8]) -> RuntimeResult<()> {
        self.data.remove(key);
        Ok(())
    }

    async fn scan_prefix(&self, prefix: &[u8]) -> RuntimeResult<Vec<(Vec<u8>, Vec<u8>)>> {
        let mut rows: Vec<(Vec<u8>, Vec<u8>)> = self
            .data
            .iter()
            .filter(|entry| entry.key().starts_with(prefix))
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();

        rows.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(rows)
    }
}
