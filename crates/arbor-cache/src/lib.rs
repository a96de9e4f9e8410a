#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **arbor-cache** – In-memory content cache and stall framework.
//!
//! The cache maps blobrefs to entries holding raw bytes and/or a parsed
//! tree-object, with readiness bits (valid / dirty), per-entry wait queues,
//! and epoch-based LRU expiration. All state is owned by one reactor task;
//! nothing here is `Sync` and nothing needs to be.
//!
//! Waiters are id-keyed records managed by [`WaitMgr`]: an entry's wait
//! queue holds the ids, and readiness transitions *drain* them back to the
//! caller, which resolves them through the manager. That keeps ownership
//! single-sided: entries never call back into the engine.

mod entry;
mod wait;

pub use entry::CacheEntry;
pub use wait::{WaitId, WaitMgr, Waiter};

use std::collections::{HashMap, HashSet};

use arbor_treeobj::Blobref;

/// Why a cache entry could not be removed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum CacheError {
    /// Entry is dirty or has waiters attached.
    #[error("cache entry in use")]
    InUse,
}

/// Aggregate cache statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Total number of entries.
    pub count: usize,
    /// Entries awaiting a load (not yet valid).
    pub incomplete: usize,
    /// Entries awaiting a store (dirty).
    pub dirty: usize,
    /// Total raw bytes held.
    pub total_bytes: usize,
}

//─────────────────────────────
//  Cache container
//─────────────────────────────

/// Blobref-keyed content cache.
#[derive(Debug, Default)]
pub struct Cache {
    entries: HashMap<Blobref, CacheEntry>,
}

impl Cache {
    /// Create an empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of entries.
    pub fn count(&self) -> usize {
        self.entries.len()
    }

    /// Look up an entry, refreshing its last-used epoch (never backwards).
    pub fn lookup(&mut self, blobref: &Blobref, epoch: u64) -> Option<&mut CacheEntry> {
        self.entries.get_mut(blobref).map(|entry| {
            entry.touch(epoch);
            entry
        })
    }

    /// Look up an entry without refreshing its last-used epoch.
    pub fn peek(&self, blobref: &Blobref) -> Option<&CacheEntry> {
        self.entries.get(blobref)
    }

    /// True if an entry exists and holds valid content.
    pub fn is_valid(&self, blobref: &Blobref) -> bool {
        self.peek(blobref).map(CacheEntry::is_valid).unwrap_or(false)
    }

    /// Insert a placeholder entry if none exists; idempotent on blobref.
    ///
    /// Placeholders are created before a load RPC is issued so that
    /// concurrent stalls on the same ref share one in-flight request.
    pub fn insert(&mut self, blobref: &Blobref, epoch: u64) -> &mut CacheEntry {
        self.entries
            .entry(blobref.clone())
            .or_insert_with(|| CacheEntry::new(blobref.clone(), epoch))
    }

    /// Remove an entry. Fails with [`CacheError::InUse`] if the entry is
    /// dirty or has waiters; removing an absent blobref succeeds.
    pub fn remove(&mut self, blobref: &Blobref) -> Result<(), CacheError> {
        if let Some(entry) = self.entries.get(blobref) {
            if entry.is_dirty() || entry.has_waiters() {
                return Err(CacheError::InUse);
            }
            self.entries.remove(blobref);
        }
        Ok(())
    }

    /// Install raw content, marking the entry valid.
    ///
    /// Returns the drained `wait_valid` queue; the caller resolves those
    /// waiters through its [`WaitMgr`]. Inserts the entry if absent.
    pub fn set_raw(&mut self, blobref: &Blobref, data: Vec<u8>, epoch: u64) -> Vec<WaitId> {
        let entry = self.insert(blobref, epoch);
        entry.set_raw(data)
    }

    /// Install content with its already-parsed tree-object form.
    ///
    /// Used by the transaction engine, which has both representations in
    /// hand when it stages newly minted objects.
    pub fn set_content(
        &mut self,
        blobref: &Blobref,
        data: Vec<u8>,
        obj: arbor_treeobj::TreeObj,
        epoch: u64,
    ) -> Vec<WaitId> {
        let entry = self.insert(blobref, epoch);
        entry.set_content(data, obj)
    }

    /// Flip the dirty bit. A true→false transition drains `wait_notdirty`.
    pub fn set_dirty(&mut self, blobref: &Blobref, dirty: bool) -> Vec<WaitId> {
        match self.entries.get_mut(blobref) {
            Some(entry) => entry.set_dirty(dirty),
            None => Vec::new(),
        }
    }

    /// Clear the dirty bit without running waiters.
    ///
    /// Only for the store-failure path, after the waiters were drained with
    /// an error via [`Cache::drain_notdirty`].
    pub fn force_clear_dirty(&mut self, blobref: &Blobref) {
        if let Some(entry) = self.entries.get_mut(blobref) {
            entry.force_clear_dirty();
        }
    }

    /// Drain the `wait_valid` queue without a validity transition.
    ///
    /// Load-failure path: the caller resolves the waiters with the saved
    /// error, then removes the placeholder.
    pub fn drain_valid(&mut self, blobref: &Blobref) -> Vec<WaitId> {
        match self.entries.get_mut(blobref) {
            Some(entry) => entry.drain_wait_valid(),
            None => Vec::new(),
        }
    }

    /// Drain the `wait_notdirty` queue without a dirty transition.
    pub fn drain_notdirty(&mut self, blobref: &Blobref) -> Vec<WaitId> {
        match self.entries.get_mut(blobref) {
            Some(entry) => entry.drain_wait_notdirty(),
            None => Vec::new(),
        }
    }

    /// Enqueue a waiter on the entry's valid transition.
    ///
    /// The caller must bump the waiter's usecount in its [`WaitMgr`].
    pub fn wait_valid(&mut self, blobref: &Blobref, wait: WaitId) {
        if let Some(entry) = self.entries.get_mut(blobref) {
            entry.push_wait_valid(wait);
        }
    }

    /// Enqueue a waiter on the entry's dirty→clean transition.
    pub fn wait_notdirty(&mut self, blobref: &Blobref, wait: WaitId) {
        if let Some(entry) = self.entries.get_mut(blobref) {
            entry.push_wait_notdirty(wait);
        }
    }

    /// Drop the given waiter ids from every entry's queues.
    ///
    /// Disconnect path: the waiters were already destroyed in the manager;
    /// stale ids must not keep entries pinned.
    pub fn purge_waiters(&mut self, ids: &HashSet<WaitId>) {
        if ids.is_empty() {
            return;
        }
        for entry in self.entries.values_mut() {
            entry.purge_waiters(ids);
        }
    }

    /// Expire entries that are valid, not dirty, waiter-free, and last used
    /// more than `thresh` epochs ago. Returns the number removed.
    pub fn expire(&mut self, epoch: u64, thresh: u64) -> usize {
        let cutoff = epoch.saturating_sub(thresh);
        let before = self.entries.len();
        self.entries.retain(|_, entry| {
            !(entry.is_valid()
                && !entry.is_dirty()
                && !entry.has_waiters()
                && entry.lastused_epoch() < cutoff)
        });
        before - self.entries.len()
    }

    /// Aggregate statistics.
    pub fn stats(&self) -> CacheStats {
        let mut stats = CacheStats { count: self.entries.len(), ..Default::default() };
        for entry in self.entries.values() {
            if !entry.is_valid() {
                stats.incomplete += 1;
            }
            if entry.is_dirty() {
                stats.dirty += 1;
            }
            stats.total_bytes += entry.raw_len();
        }
        stats
    }
}
