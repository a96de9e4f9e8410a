#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **arbor-store-core** – Storage abstractions for the Arbor KVS.
//!
//! The engine treats byte persistence as an external collaborator: a
//! content-addressed blob store plus a small checkpoint service that
//! remembers the primary namespace's last published root. Drivers (memory,
//! disk, networked) implement these traits in separate crates.

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use arbor_treeobj::{Blobref, HashAlgo};

//─────────────────────────────
//  Content store
//─────────────────────────────

/// Content-addressed blob persistence.
///
/// `store` hashes with the instance's configured algorithm and returns the
/// resulting blobref; the engine cross-checks it against the ref it
/// computed locally, so a store that hashes differently is detected rather
/// than silently corrupting the tree.
#[async_trait]
pub trait ContentStore: Send + Sync {
    /// Load the blob named by `blobref`, or `None` if absent.
    async fn load(&self, blobref: &Blobref) -> Result<Option<Vec<u8>>>;

    /// Persist `data`, returning its blobref under `algo`.
    async fn store(&self, algo: HashAlgo, data: Vec<u8>) -> Result<Blobref>;

    /// Block until previously stored blobs are durable.
    async fn flush(&self) -> Result<()>;
}

//─────────────────────────────
//  Checkpoints
//─────────────────────────────

/// Checkpoint record for the primary namespace.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Root blobref at checkpoint time.
    pub rootref: Blobref,
    /// Root sequence number at checkpoint time.
    pub rootseq: u64,
    /// Wall-clock seconds since the epoch when the checkpoint was taken.
    pub timestamp: f64,
}

/// Durable storage for the primary namespace checkpoint.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Fetch the most recent checkpoint, if any.
    async fn get(&self) -> Result<Option<Checkpoint>>;

    /// Replace the stored checkpoint.
    async fn put(&self, checkpoint: Checkpoint) -> Result<()>;
}
