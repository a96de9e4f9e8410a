//! Cache entries.

use arbor_treeobj::{Blobref, TreeObj};

use crate::WaitId;

/// One cache entry: raw bytes and/or a parsed tree-object, plus readiness
/// state and wait queues.
///
/// Lifecycle: created empty before a load RPC is issued; the invalid→valid
/// transition drains `wait_valid`; the dirty→clean transition drains
/// `wait_notdirty`.
#[derive(Debug)]
pub struct CacheEntry {
    blobref: Blobref,
    raw: Option<Vec<u8>>,
    obj: Option<TreeObj>,
    parse_failed: bool,
    dirty: bool,
    lastused_epoch: u64,
    wait_valid: Vec<WaitId>,
    wait_notdirty: Vec<WaitId>,
}

impl CacheEntry {
    pub(crate) fn new(blobref: Blobref, epoch: u64) -> Self {
        Self {
            blobref,
            raw: None,
            obj: None,
            parse_failed: false,
            dirty: false,
            lastused_epoch: epoch,
            wait_valid: Vec::new(),
            wait_notdirty: Vec::new(),
        }
    }

    /// Blobref this entry is keyed by.
    pub fn blobref(&self) -> &Blobref {
        &self.blobref
    }

    /// True once content is present. False means a load is in flight.
    pub fn is_valid(&self) -> bool {
        self.raw.is_some()
    }

    /// True while a store RPC is in flight for this entry.
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Last-used epoch, for LRU expiration.
    pub fn lastused_epoch(&self) -> u64 {
        self.lastused_epoch
    }

    /// True if any waiter is attached.
    pub fn has_waiters(&self) -> bool {
        !self.wait_valid.is_empty() || !self.wait_notdirty.is_empty()
    }

    /// Raw content, if valid.
    pub fn raw(&self) -> Option<&[u8]> {
        self.raw.as_deref()
    }

    /// Raw content length; 0 if not valid.
    pub fn raw_len(&self) -> usize {
        self.raw.as_ref().map(Vec::len).unwrap_or(0)
    }

    /// Parsed tree-object form of the content.
    ///
    /// Parsed lazily from the raw bytes on first access and cached. Returns
    /// `None` if the entry is not valid or the bytes are not a tree-object
    /// (raw blobs referenced by a valref are ordinary data).
    pub fn treeobj(&mut self) -> Option<&TreeObj> {
        if self.obj.is_none() && !self.parse_failed {
            match self.raw.as_deref().map(TreeObj::decode) {
                Some(Ok(obj)) => self.obj = Some(obj),
                Some(Err(_)) => self.parse_failed = true,
                None => return None,
            }
        }
        self.obj.as_ref()
    }

    pub(crate) fn touch(&mut self, epoch: u64) {
        self.lastused_epoch = self.lastused_epoch.max(epoch);
    }

    pub(crate) fn set_raw(&mut self, data: Vec<u8>) -> Vec<WaitId> {
        if self.raw.is_none() {
            self.raw = Some(data);
        }
        std::mem::take(&mut self.wait_valid)
    }

    pub(crate) fn set_content(&mut self, data: Vec<u8>, obj: TreeObj) -> Vec<WaitId> {
        if self.raw.is_none() {
            self.raw = Some(data);
            self.obj = Some(obj);
        }
        std::mem::take(&mut self.wait_valid)
    }

    pub(crate) fn set_dirty(&mut self, dirty: bool) -> Vec<WaitId> {
        let was_dirty = self.dirty;
        self.dirty = dirty;
        if was_dirty && !dirty {
            std::mem::take(&mut self.wait_notdirty)
        } else {
            Vec::new()
        }
    }

    pub(crate) fn force_clear_dirty(&mut self) {
        self.dirty = false;
    }

    pub(crate) fn push_wait_valid(&mut self, wait: WaitId) {
        self.wait_valid.push(wait);
    }

    pub(crate) fn push_wait_notdirty(&mut self, wait: WaitId) {
        self.wait_notdirty.push(wait);
    }

    pub(crate) fn drain_wait_valid(&mut self) -> Vec<WaitId> {
        std::mem::take(&mut self.wait_valid)
    }

    pub(crate) fn drain_wait_notdirty(&mut self) -> Vec<WaitId> {
        std::mem::take(&mut self.wait_notdirty)
    }

    pub(crate) fn purge_waiters(&mut self, ids: &std::collections::HashSet<WaitId>) {
        self.wait_valid.retain(|id| !ids.contains(id));
        self.wait_notdirty.retain(|id| !ids.contains(id));
    }
}
