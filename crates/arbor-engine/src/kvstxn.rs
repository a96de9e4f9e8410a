//! Transaction processing.
//!
//! A [`Kvstxn`] applies an ordered op list to a snapshot root by
//! copy-on-write and produces a new root blobref. Processing is a state
//! machine that can stall twice per pass (once to load missing referenced
//! blobs, once while freshly staged dirty entries flush to the content
//! store) and twice more for `SYNC` transactions (content flush, then
//! checkpoint). The caller drives it with [`Kvstxn::process`] until
//! [`TxnProcess::Finished`] or [`TxnProcess::Error`].
//!
//! [`KvstxnMgr`] owns the per-namespace ready queue and implements merging
//! of compatible neighbors plus the fallback ("unmerge") path taken when a
//! merged transaction fails.

use std::collections::BTreeMap;

use tracing::error;

use arbor_cache::{Cache, WaitId};
use arbor_treeobj::{Blobref, HashAlgo, TreeObj, TxnOp};
use arbor_types::{
    normalize_key, KvsError, COMMIT_FLAGS_MASK, COMMIT_NO_MERGE, COMMIT_SYNC, OP_APPEND,
    SYMLINK_CYCLE_LIMIT,
};

/// Result of one [`Kvstxn::process`] pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxnProcess {
    /// Processing failed; see [`Kvstxn::errnum`].
    Error,
    /// Stalled: load the refs from [`Kvstxn::missing_refs`] into the cache.
    LoadMissingRefs,
    /// Stalled: flush the entries from [`Kvstxn::dirty_cache_entries`].
    DirtyCacheEntries,
    /// Stalled: flush the content store, then call
    /// [`Kvstxn::sync_content_flushed`].
    SyncContentFlush,
    /// Stalled: checkpoint the new root, then call
    /// [`Kvstxn::sync_checkpointed`].
    SyncCheckpoint,
    /// Done; [`Kvstxn::newroot_ref`] is set.
    Finished,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Init,
    ApplyOps,
    Store,
    DirtyWait,
    SyncContentFlush,
    SyncCheckpoint,
    Finished,
}

enum OpOutcome {
    Applied,
    Stall(Vec<Blobref>),
}

//─────────────────────────────
//  Transaction
//─────────────────────────────

/// One processing transaction (possibly the merge of several).
#[derive(Debug)]
pub struct Kvstxn {
    ns_name: String,
    names: Vec<String>,
    ops: Vec<TxnOp>,
    flags: u32,
    internal_flags: u32,
    hash: HashAlgo,
    big_val_threshold: usize,

    state: State,
    errnum: Option<KvsError>,
    aux_errnum: Option<KvsError>,
    /// Head-of-queue transaction with waiters registered; skip until resumed.
    pub blocked: bool,

    rootcpy: Option<TreeObj>,
    current_op: usize,
    applied: Vec<bool>,
    missing_refs: Vec<Blobref>,
    dirty_entries: Vec<Blobref>,
    drained_waiters: Vec<WaitId>,
    newroot: Option<Blobref>,
    noop_stores: u64,

    components: Vec<Kvstxn>,
}

impl Kvstxn {
    fn new(
        ns_name: &str,
        name: &str,
        ops: Vec<TxnOp>,
        flags: u32,
        internal_flags: u32,
        hash: HashAlgo,
        big_val_threshold: usize,
    ) -> Self {
        let applied = vec![false; ops.len()];
        Self {
            ns_name: ns_name.to_string(),
            names: vec![name.to_string()],
            ops,
            flags,
            internal_flags,
            hash,
            big_val_threshold,
            state: State::Init,
            errnum: None,
            aux_errnum: None,
            blocked: false,
            rootcpy: None,
            current_op: 0,
            applied,
            missing_refs: Vec::new(),
            dirty_entries: Vec::new(),
            drained_waiters: Vec::new(),
            newroot: None,
            noop_stores: 0,
            components: Vec::new(),
        }
    }

    fn merged(components: Vec<Kvstxn>) -> Self {
        let first = &components[0];
        let mut merged = Kvstxn::new(
            &first.ns_name,
            &first.names[0],
            components.iter().flat_map(|c| c.ops.iter().cloned()).collect(),
            first.flags,
            first.internal_flags,
            first.hash,
            first.big_val_threshold,
        );
        merged.names = components.iter().flat_map(|c| c.names.iter().cloned()).collect();
        merged.components = components;
        merged
    }

    /// Namespace this transaction belongs to.
    pub fn namespace(&self) -> &str {
        &self.ns_name
    }

    /// Names of the client transactions folded in.
    pub fn names(&self) -> &[String] {
        &self.names
    }

    /// Operation list.
    pub fn ops(&self) -> &[TxnOp] {
        &self.ops
    }

    /// Transaction flags.
    pub fn flags(&self) -> u32 {
        self.flags
    }

    /// Internal flags (e.g. `INT_NO_PUBLISH`).
    pub fn internal_flags(&self) -> u32 {
        self.internal_flags
    }

    /// Error recorded by a failed pass.
    pub fn errnum(&self) -> Option<KvsError> {
        self.errnum
    }

    /// Error recorded while stalled (e.g. a failed load or store RPC).
    /// Checked by the apply loop before resuming processing.
    pub fn aux_errnum(&self) -> Option<KvsError> {
        self.aux_errnum
    }

    /// Record a stall-time error.
    pub fn set_aux_errnum(&mut self, errnum: KvsError) {
        if self.aux_errnum.is_none() {
            self.aux_errnum = Some(errnum);
        }
    }

    /// Normalized keys written by this transaction.
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.ops.iter().map(TxnOp::normalized_key).collect();
        keys.dedup();
        keys
    }

    /// New root blobref; set only once processing finished.
    pub fn newroot_ref(&self) -> Option<&Blobref> {
        if self.state == State::Finished {
            self.newroot.as_ref()
        } else {
            None
        }
    }

    /// Refs to load on a [`TxnProcess::LoadMissingRefs`] stall.
    pub fn missing_refs(&self) -> &[Blobref] {
        &self.missing_refs
    }

    /// Entries to flush on a [`TxnProcess::DirtyCacheEntries`] stall.
    pub fn dirty_cache_entries(&self) -> &[Blobref] {
        &self.dirty_entries
    }

    /// Valid-waiters drained while staging content; the caller must resolve
    /// them (staging can satisfy a ref someone else stalled on).
    pub fn take_drained_waiters(&mut self) -> Vec<WaitId> {
        std::mem::take(&mut self.drained_waiters)
    }

    /// True if a failed merged transaction can fall back to its components.
    pub fn fallback_mergeable(&self) -> bool {
        !self.components.is_empty()
    }

    /// Noop-store count: stages that found the blob already cached valid.
    pub fn noop_stores(&self) -> u64 {
        self.noop_stores
    }

    /// Mark the content-flush stall satisfied.
    pub fn sync_content_flushed(&mut self) {
        if self.state == State::SyncContentFlush {
            self.state = State::SyncCheckpoint;
        }
    }

    /// Mark the checkpoint stall satisfied.
    pub fn sync_checkpointed(&mut self) {
        if self.state == State::SyncCheckpoint {
            self.state = State::Finished;
        }
    }

    /// Release staged dirty entries after a failure.
    ///
    /// Drains each entry's not-dirty waiters (the caller resolves them with
    /// the error), force-clears the dirty bit, and removes entries that can
    /// be removed.
    pub fn cleanup_dirty_entries(&mut self, cache: &mut Cache) -> Vec<WaitId> {
        let mut drained = Vec::new();
        for blobref in self.dirty_entries.drain(..) {
            drained.extend(cache.drain_notdirty(&blobref));
            cache.force_clear_dirty(&blobref);
            let _ = cache.remove(&blobref);
        }
        drained
    }

    //─────────────────────────────
    //  Processing
    //─────────────────────────────

    /// Drive processing forward one pass against the namespace's current
    /// root. Stall results carry their inputs on the transaction; errors
    /// are sticky.
    pub fn process(&mut self, cache: &mut Cache, epoch: u64, root_ref: &Blobref) -> TxnProcess {
        if self.errnum.is_some() {
            return TxnProcess::Error;
        }
        loop {
            match self.state {
                State::Init => match self.load_root(cache, epoch, root_ref) {
                    Ok(true) => self.state = State::ApplyOps,
                    Ok(false) => return TxnProcess::LoadMissingRefs,
                    Err(errnum) => return self.fail(errnum),
                },
                State::ApplyOps => {
                    while self.current_op < self.ops.len() {
                        if self.applied[self.current_op] {
                            self.current_op += 1;
                            continue;
                        }
                        match self.apply_op(cache, epoch, self.current_op) {
                            Ok(OpOutcome::Applied) => {
                                self.applied[self.current_op] = true;
                                self.current_op += 1;
                            }
                            Ok(OpOutcome::Stall(refs)) => {
                                self.missing_refs = refs;
                                return TxnProcess::LoadMissingRefs;
                            }
                            Err(errnum) => return self.fail(errnum),
                        }
                    }
                    self.state = State::Store;
                }
                State::Store => match self.store_phase(cache, epoch) {
                    Ok(()) => self.state = State::DirtyWait,
                    Err(errnum) => return self.fail(errnum),
                },
                State::DirtyWait => {
                    let still_dirty = self
                        .dirty_entries
                        .iter()
                        .any(|r| cache.peek(r).map(|e| e.is_dirty()).unwrap_or(false));
                    if still_dirty {
                        return TxnProcess::DirtyCacheEntries;
                    }
                    if self.flags & COMMIT_SYNC != 0 {
                        self.state = State::SyncContentFlush;
                    } else {
                        self.state = State::Finished;
                    }
                }
                State::SyncContentFlush => return TxnProcess::SyncContentFlush,
                State::SyncCheckpoint => return TxnProcess::SyncCheckpoint,
                State::Finished => return TxnProcess::Finished,
            }
        }
    }

    fn fail(&mut self, errnum: KvsError) -> TxnProcess {
        self.errnum = Some(errnum);
        TxnProcess::Error
    }

    /// Returns Ok(true) when the root copy is in hand, Ok(false) on stall.
    fn load_root(&mut self, cache: &mut Cache, epoch: u64, root_ref: &Blobref) -> Result<bool, KvsError> {
        if self.rootcpy.is_some() {
            return Ok(true);
        }
        let Some(entry) = cache.lookup(root_ref, epoch).filter(|e| e.is_valid()) else {
            self.missing_refs = vec![root_ref.clone()];
            return Ok(false);
        };
        match entry.treeobj() {
            Some(obj) if obj.is_dir() => {
                self.rootcpy = Some(obj.clone());
                Ok(true)
            }
            // a root ref naming anything but a dir came from user input
            _ => Err(KvsError::Invalid),
        }
    }

    /// Stage raw bytes as a dirty cache entry, returning their blobref.
    fn stage_raw(&mut self, cache: &mut Cache, epoch: u64, data: Vec<u8>) -> Blobref {
        let blobref = self.hash.hash(&data);
        if cache.lookup(&blobref, epoch).map(|e| e.is_valid()).unwrap_or(false) {
            self.noop_stores += 1;
            return blobref;
        }
        self.drained_waiters.extend(cache.set_raw(&blobref, data, epoch));
        cache.set_dirty(&blobref, true);
        self.dirty_entries.push(blobref.clone());
        blobref
    }

    /// Stage a tree-object as a dirty cache entry, returning its blobref.
    fn stage_treeobj(&mut self, cache: &mut Cache, epoch: u64, obj: TreeObj) -> Result<Blobref, KvsError> {
        let (blobref, data) = obj.hash(self.hash)?;
        if cache.lookup(&blobref, epoch).map(|e| e.is_valid()).unwrap_or(false) {
            self.noop_stores += 1;
            return Ok(blobref);
        }
        self.drained_waiters.extend(cache.set_content(&blobref, data, obj, epoch));
        cache.set_dirty(&blobref, true);
        self.dirty_entries.push(blobref.clone());
        Ok(blobref)
    }

    //─────────────────────────────
    //  Copy-on-write op application
    //─────────────────────────────

    fn apply_op(&mut self, cache: &mut Cache, epoch: u64, index: usize) -> Result<OpOutcome, KvsError> {
        let op = self.ops[index].clone();
        op.validate().map_err(|_| KvsError::Proto)?;

        let (mut key, _) = normalize_key(&op.key);
        if key == "." {
            // the root itself is not writable as a value
            return Err(KvsError::Invalid);
        }

        let mut depth = 0u32;
        loop {
            match self.resolve_parent(cache, epoch, &key)? {
                Resolve::Stall(refs) => return Ok(OpOutcome::Stall(refs)),
                Resolve::Symlink(new_key) => {
                    if depth == SYMLINK_CYCLE_LIMIT {
                        return Err(KvsError::Loop);
                    }
                    depth += 1;
                    key = new_key;
                }
                Resolve::Parent => break,
            }
        }

        // the parent chain now exists inline; mutate the final component.
        // the root copy steps out of self so staging can borrow self freely
        let mut rootcpy = self.rootcpy.take().expect("root copy loaded");
        let result = self.apply_final(cache, epoch, &mut rootcpy, &key, op);
        self.rootcpy = Some(rootcpy);
        result?;
        Ok(OpOutcome::Applied)
    }

    fn apply_final(
        &mut self,
        cache: &mut Cache,
        epoch: u64,
        rootcpy: &mut TreeObj,
        key: &str,
        op: TxnOp,
    ) -> Result<(), KvsError> {
        let comps: Vec<&str> = key.split('.').collect();
        let (last, prefix) = comps.split_last().expect("normalized key is non-empty");
        let mut dir = rootcpy;
        for comp in prefix {
            let TreeObj::Dir(entries) = dir else { unreachable!("parent chain is inline dirs") };
            dir = entries.get_mut(*comp).expect("parent chain resolved");
        }
        let TreeObj::Dir(entries) = dir else { unreachable!("parent chain is inline dirs") };

        if op.flags & OP_APPEND != 0 {
            let Some(TreeObj::Val(data)) = op.dirent else {
                return Err(KvsError::Proto);
            };
            match entries.get(*last) {
                None => {
                    entries.insert(last.to_string(), TreeObj::Val(data));
                }
                Some(TreeObj::Val(_)) => {
                    let Some(TreeObj::Val(old)) = entries.remove(*last) else { unreachable!() };
                    let old_ref = self.stage_raw(cache, epoch, old);
                    let new_ref = self.stage_raw(cache, epoch, data);
                    entries.insert(last.to_string(), TreeObj::ValRef(vec![old_ref, new_ref]));
                }
                Some(TreeObj::ValRef(_)) => {
                    let new_ref = self.stage_raw(cache, epoch, data);
                    let Some(TreeObj::ValRef(mut refs)) = entries.remove(*last) else {
                        unreachable!()
                    };
                    refs.push(new_ref);
                    entries.insert(last.to_string(), TreeObj::ValRef(refs));
                }
                Some(TreeObj::Dir(_)) | Some(TreeObj::DirRef(_)) => return Err(KvsError::IsDir),
                Some(TreeObj::Symlink { .. }) => return Err(KvsError::NotSup),
            }
        } else {
            match op.dirent {
                Some(dirent) => {
                    entries.insert(last.to_string(), dirent);
                }
                None => {
                    entries.remove(*last);
                }
            }
        }
        Ok(())
    }

    /// Make `key`'s parent chain exist as inline dirs within the root copy,
    /// expanding dirrefs (loading their targets as needed) and creating
    /// missing intermediate directories.
    fn resolve_parent(&mut self, cache: &mut Cache, epoch: u64, key: &str) -> Result<Resolve, KvsError> {
        let comps: Vec<String> = key.split('.').map(str::to_string).collect();
        let prefix_len = comps.len() - 1;

        for i in 0..prefix_len {
            let comp = &comps[i];

            // inspect without holding a mutable borrow across the cache load
            enum Action {
                Descend,
                Create,
                Expand(Blobref),
                Follow(String),
            }
            let action = {
                let dir = self.dir_at(&comps[..i]);
                let TreeObj::Dir(entries) = dir else { unreachable!() };
                match entries.get(comp) {
                    Some(TreeObj::Dir(_)) => Action::Descend,
                    Some(TreeObj::DirRef(refs)) => {
                        if refs.len() != 1 {
                            error!(key, "dirref with invalid blobref count");
                            return Err(KvsError::NotRecoverable);
                        }
                        Action::Expand(refs[0].clone())
                    }
                    Some(TreeObj::Symlink { namespace: Some(_), .. }) => {
                        // a transaction is scoped to one namespace
                        return Err(KvsError::Invalid);
                    }
                    Some(TreeObj::Symlink { namespace: None, target }) => {
                        let mut rewritten = normalize_key(target).0;
                        for rest in &comps[i + 1..] {
                            if rewritten == "." {
                                rewritten = rest.clone();
                            } else {
                                rewritten.push('.');
                                rewritten.push_str(rest);
                            }
                        }
                        Action::Follow(normalize_key(&rewritten).0)
                    }
                    Some(TreeObj::Val(_)) | Some(TreeObj::ValRef(_)) | None => Action::Create,
                }
            };

            match action {
                Action::Descend => {}
                Action::Create => {
                    let dir = self.dir_at_mut(&comps[..i]);
                    let TreeObj::Dir(entries) = dir else { unreachable!() };
                    entries.insert(comp.clone(), TreeObj::empty_dir());
                }
                Action::Expand(blobref) => {
                    let Some(entry) = cache.lookup(&blobref, epoch).filter(|e| e.is_valid())
                    else {
                        return Ok(Resolve::Stall(vec![blobref]));
                    };
                    let loaded = match entry.treeobj() {
                        Some(obj) if obj.is_dir() => obj.clone(),
                        _ => {
                            error!(%blobref, "dirref names a non-directory object");
                            return Err(KvsError::NotRecoverable);
                        }
                    };
                    let dir = self.dir_at_mut(&comps[..i]);
                    let TreeObj::Dir(entries) = dir else { unreachable!() };
                    entries.insert(comp.clone(), loaded);
                }
                Action::Follow(new_key) => return Ok(Resolve::Symlink(new_key)),
            }
        }
        // follow a symlink sitting at the final component position? no:
        // writes replace whatever dirent is there, links included
        Ok(Resolve::Parent)
    }

    fn dir_at(&self, path: &[String]) -> &TreeObj {
        let mut dir = self.rootcpy.as_ref().expect("root copy loaded");
        for comp in path {
            let TreeObj::Dir(entries) = dir else { unreachable!() };
            dir = entries.get(comp).expect("prefix resolved");
        }
        dir
    }

    fn dir_at_mut(&mut self, path: &[String]) -> &mut TreeObj {
        let mut dir = self.rootcpy.as_mut().expect("root copy loaded");
        for comp in path {
            let TreeObj::Dir(entries) = dir else { unreachable!() };
            dir = entries.get_mut(comp).expect("prefix resolved");
        }
        dir
    }

    //─────────────────────────────
    //  Store phase
    //─────────────────────────────

    /// Collapse the rewritten tree back into content-addressed form: every
    /// inline dir becomes a stored blob referenced by a dirref, oversized
    /// vals become valrefs, and the root dir's blobref is the new root.
    fn store_phase(&mut self, cache: &mut Cache, epoch: u64) -> Result<(), KvsError> {
        let TreeObj::Dir(entries) = self.rootcpy.take().expect("root copy loaded") else {
            return Err(KvsError::NotRecoverable);
        };
        let mut stored = BTreeMap::new();
        for (name, child) in entries {
            stored.insert(name, self.store_obj(cache, epoch, child)?);
        }
        let newroot = self.stage_treeobj(cache, epoch, TreeObj::Dir(stored))?;
        self.newroot = Some(newroot);
        Ok(())
    }

    fn store_obj(&mut self, cache: &mut Cache, epoch: u64, obj: TreeObj) -> Result<TreeObj, KvsError> {
        match obj {
            TreeObj::Dir(entries) => {
                let mut stored = BTreeMap::new();
                for (name, child) in entries {
                    stored.insert(name, self.store_obj(cache, epoch, child)?);
                }
                let blobref = self.stage_treeobj(cache, epoch, TreeObj::Dir(stored))?;
                Ok(TreeObj::dirref(blobref))
            }
            TreeObj::Val(data) if data.len() > self.big_val_threshold => {
                let blobref = self.stage_raw(cache, epoch, data);
                Ok(TreeObj::ValRef(vec![blobref]))
            }
            other => Ok(other),
        }
    }
}

enum Resolve {
    Parent,
    Stall(Vec<Blobref>),
    Symlink(String),
}

//─────────────────────────────
//  Manager / ready queue
//─────────────────────────────

/// Per-namespace ready queue of transactions.
#[derive(Debug)]
pub struct KvstxnMgr {
    ns_name: String,
    is_primary: bool,
    hash: HashAlgo,
    big_val_threshold: usize,
    ready: std::collections::VecDeque<Kvstxn>,
    noop_stores: u64,
}

impl KvstxnMgr {
    /// Create a manager for one namespace.
    pub fn new(ns_name: &str, is_primary: bool, hash: HashAlgo, big_val_threshold: usize) -> Self {
        Self {
            ns_name: ns_name.to_string(),
            is_primary,
            hash,
            big_val_threshold,
            ready: std::collections::VecDeque::new(),
            noop_stores: 0,
        }
    }

    /// Validate and enqueue a transaction at the tail of the ready queue.
    pub fn add_transaction(
        &mut self,
        name: &str,
        ops: Vec<TxnOp>,
        flags: u32,
        internal_flags: u32,
    ) -> Result<(), KvsError> {
        if flags & !COMMIT_FLAGS_MASK != 0 {
            return Err(KvsError::Invalid);
        }
        if flags & COMMIT_SYNC != 0 && !self.is_primary {
            return Err(KvsError::Invalid);
        }
        self.ready.push_back(Kvstxn::new(
            &self.ns_name,
            name,
            ops,
            flags,
            internal_flags,
            self.hash,
            self.big_val_threshold,
        ));
        Ok(())
    }

    /// True if the head transaction can be processed now.
    pub fn transaction_ready(&self) -> bool {
        self.ready.front().map(|txn| !txn.blocked).unwrap_or(false)
    }

    /// Head of the ready queue; it stays at the head across stalls.
    pub fn ready_transaction(&mut self) -> Option<&mut Kvstxn> {
        self.ready.front_mut()
    }

    /// Number of queued transactions.
    pub fn ready_count(&self) -> usize {
        self.ready.len()
    }

    /// Aggregated noop-store count of removed transactions.
    pub fn noop_stores(&self) -> u64 {
        self.noop_stores
    }

    /// Reset the noop-store counter.
    pub fn clear_noop_stores(&mut self) {
        self.noop_stores = 0;
    }

    /// Coalesce a run of compatible transactions at the head of the queue
    /// into one. Neither side may carry `NO_MERGE` or `SYNC`, and flag sets
    /// must match exactly; the first incompatible neighbor ends the window.
    pub fn merge_ready_transactions(&mut self) {
        let mergeable = |txn: &Kvstxn, flags: u32, internal: u32| {
            txn.flags & (COMMIT_NO_MERGE | COMMIT_SYNC) == 0
                && txn.flags == flags
                && txn.internal_flags == internal
        };
        let Some(first) = self.ready.front() else {
            return;
        };
        if first.blocked || first.flags & (COMMIT_NO_MERGE | COMMIT_SYNC) != 0 {
            return;
        }
        let (flags, internal) = (first.flags, first.internal_flags);
        let mut run = 1;
        while run < self.ready.len() && mergeable(&self.ready[run], flags, internal) {
            run += 1;
        }
        if run == 1 {
            return;
        }
        let components: Vec<Kvstxn> = self.ready.drain(..run).collect();
        self.ready.push_front(Kvstxn::merged(components));
    }

    /// Remove the head transaction after processing.
    ///
    /// With `fallback` true (failed merged transaction), its components are
    /// reinserted at the head in order with `NO_MERGE` forced, so each can
    /// be retried, and fail, individually.
    pub fn remove_transaction(&mut self, fallback: bool) -> Option<Kvstxn> {
        let mut txn = self.ready.pop_front()?;
        self.noop_stores += txn.noop_stores;
        if fallback && txn.fallback_mergeable() {
            for mut component in txn.components.drain(..).rev() {
                component.flags |= COMMIT_NO_MERGE;
                self.ready.push_front(component);
            }
        }
        Some(txn)
    }
}
