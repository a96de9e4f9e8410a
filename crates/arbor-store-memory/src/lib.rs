#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **arbor-store-memory** – In-memory storage driver for the Arbor KVS.
//!
//! A fast, non-persistent backend suitable for testing and development.
//! All data is lost when the process terminates. Blobs are deduplicated by
//! construction: the map is keyed by blobref.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::RwLock;

use arbor_store_core::{Checkpoint, CheckpointStore, ContentStore};
use arbor_treeobj::{Blobref, HashAlgo};

/// An in-memory, non-persistent content and checkpoint store.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    blobs: Arc<RwLock<HashMap<Blobref, Vec<u8>>>>,
    checkpoint: Arc<RwLock<Option<Checkpoint>>>,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of distinct blobs held.
    pub async fn blob_count(&self) -> usize {
        self.blobs.read().await.len()
    }

    /// Drop all blobs and the checkpoint.
    pub async fn clear(&self) {
        self.blobs.write().await.clear();
        *self.checkpoint.write().await = None;
    }

    /// Insert a blob directly under a precomputed ref (test setup).
    pub async fn put_blob(&self, blobref: Blobref, data: Vec<u8>) {
        self.blobs.write().await.insert(blobref, data);
    }
}

#[async_trait]
impl ContentStore for MemoryStore {
    async fn load(&self, blobref: &Blobref) -> Result<Option<Vec<u8>>> {
        Ok(self.blobs.read().await.get(blobref).cloned())
    }

    async fn store(&self, algo: HashAlgo, data: Vec<u8>) -> Result<Blobref> {
        let blobref = algo.hash(&data);
        self.blobs.write().await.insert(blobref.clone(), data);
        Ok(blobref)
    }

    async fn flush(&self) -> Result<()> {
        Ok(())
    }
}

#[async_trait]
impl CheckpointStore for MemoryStore {
    async fn get(&self) -> Result<Option<Checkpoint>> {
        Ok(self.checkpoint.read().await.clone())
    }

    async fn put(&self, checkpoint: Checkpoint) -> Result<()> {
        *self.checkpoint.write().await = Some(checkpoint);
        Ok(())
    }
}
