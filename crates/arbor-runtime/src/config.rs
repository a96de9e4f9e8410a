//! Runtime configuration.

use std::time::Duration;

use arbor_treeobj::HashAlgo;
use arbor_types::UserId;

/// Configuration for one KVS runtime instance (one rank).
#[derive(Debug, Clone)]
pub struct KvsConfig {
    /// This rank. Rank 0 holds the authoritative ready queues.
    pub rank: u32,
    /// Blobref hash algorithm shared by the whole instance.
    pub hash: HashAlgo,
    /// Byte length above which a `val` is stored as a single-blob `valref`.
    pub big_val_threshold: usize,
    /// Merge compatible neighbors on the ready queue before applying.
    pub transaction_merge: bool,
    /// Owner of the primary namespace.
    pub owner: UserId,
    /// Heartbeat sweep period; clamped to [1s, 30s].
    pub heartbeat_period: Duration,
    /// Checkpoint period for the primary namespace; `None` disables.
    pub checkpoint_period: Option<Duration>,
    /// Seconds of idleness after which a follower evicts a non-primary
    /// namespace.
    pub max_namespace_age: f64,
    /// Heartbeat epochs after which an unused cache entry may expire.
    pub max_lastuse_age: u64,
}

impl Default for KvsConfig {
    fn default() -> Self {
        Self {
            rank: 0,
            hash: HashAlgo::Sha1,
            big_val_threshold: 4096,
            transaction_merge: true,
            owner: UserId(0),
            heartbeat_period: Duration::from_secs(1),
            checkpoint_period: None,
            max_namespace_age: 3600.0,
            max_lastuse_age: 10,
        }
    }
}

impl KvsConfig {
    /// Heartbeat period clamped to the supported range.
    pub fn heartbeat_period_clamped(&self) -> Duration {
        self.heartbeat_period
            .clamp(Duration::from_secs(1), Duration::from_secs(30))
    }
}
