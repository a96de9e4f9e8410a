//! Namespace roots and their manager.
//!
//! A root owns everything scoped to one namespace: the current snapshot
//! (ref, seq), the transaction ready queue, pending transaction-request
//! records (commit/fence callers awaiting finalization), version waiters,
//! and the setroot pause queue. Roots are looked up by name on every
//! resume; holders never keep references across suspension points.
//!
//! The type parameter `R` is the caller's reply handle: whatever the
//! runtime needs to answer a buffered request later.

use std::collections::{HashMap, VecDeque};

use arbor_treeobj::{Blobref, HashAlgo, TreeObj, TxnOp};
use arbor_types::{ClientId, Cred, KvsError, UserId, PRIMARY_NAMESPACE};

use crate::events::KvsEvent;
use crate::kvstxn::KvstxnMgr;

//─────────────────────────────
//  Version waiters
//─────────────────────────────

/// A wait-version request: fires at the first setroot with `seq >= target`.
#[derive(Debug)]
pub struct VersionWaiter<R> {
    /// Sequence number being waited for.
    pub seq: u64,
    /// Client the waiter belongs to, for disconnect cleanup.
    pub client: Option<ClientId>,
    /// Reply handle to answer with the reached (ref, seq).
    pub reply: R,
}

//─────────────────────────────
//  Transaction requests
//─────────────────────────────

/// A commit or fence accumulating requests until it can be enqueued.
///
/// Commits are fences with `nprocs == 1`. The record stays registered until
/// a setroot or error event carrying its name finalizes it; `processed`
/// guards against enqueueing the same record twice.
#[derive(Debug)]
pub struct TxnRequest<R> {
    name: String,
    nprocs: u32,
    flags: u32,
    count: u32,
    processed: bool,
    ops: Vec<TxnOp>,
    replies: Vec<R>,
}

impl<R> TxnRequest<R> {
    /// Create an empty record expecting `nprocs` participants.
    pub fn new(name: &str, nprocs: u32, flags: u32) -> Self {
        Self {
            name: name.to_string(),
            nprocs,
            flags,
            count: 0,
            processed: false,
            ops: Vec::new(),
            replies: Vec::new(),
        }
    }

    /// Transaction name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Expected participant count.
    pub fn nprocs(&self) -> u32 {
        self.nprocs
    }

    /// Flags shared by all participants.
    pub fn flags(&self) -> u32 {
        self.flags
    }

    /// True once all participants have contributed.
    pub fn count_reached(&self) -> bool {
        self.count == self.nprocs
    }

    /// True once the record's ops were handed to the ready queue.
    pub fn processed(&self) -> bool {
        self.processed
    }

    /// Mark the record as enqueued.
    pub fn set_processed(&mut self) {
        self.processed = true;
    }

    /// Accumulated operations, in participant arrival order.
    pub fn ops(&self) -> &[TxnOp] {
        &self.ops
    }

    /// Add one participant's contribution.
    ///
    /// `reply` is retained for finalization; relays contribute without one.
    pub fn add_request(&mut self, ops: Vec<TxnOp>, reply: Option<R>) -> Result<(), KvsError> {
        if self.count_reached() {
            return Err(KvsError::Overflow);
        }
        self.count += 1;
        self.ops.extend(ops);
        if let Some(reply) = reply {
            self.replies.push(reply);
        }
        Ok(())
    }

    /// Take the reply handles for finalization.
    pub fn take_replies(&mut self) -> Vec<R> {
        std::mem::take(&mut self.replies)
    }
}

//─────────────────────────────
//  Root
//─────────────────────────────

/// Per-namespace snapshot state.
#[derive(Debug)]
pub struct Root<R> {
    /// Namespace name.
    pub ns_name: String,
    /// True for the instance's primary namespace.
    pub is_primary: bool,
    /// Namespace owner; request credentials are checked against it.
    pub owner: UserId,
    /// Creation flags, echoed in getroot replies.
    pub flags: u32,
    /// Current snapshot sequence number.
    pub seq: u64,
    /// Current root blobref.
    pub rootref: Blobref,
    /// Ready queue and transaction processing for this namespace.
    pub txn_mgr: KvstxnMgr,
    /// Namespace is draining; no new work is accepted.
    pub remove: bool,
    /// Test hook: buffer incoming setroot events instead of applying them.
    pub setroot_pause: bool,
    /// Events buffered while paused, drained FIFO on unpause.
    pub setroot_queue: VecDeque<KvsEvent>,
    /// Reactor time of the last root update, for follower TTL eviction.
    pub last_update_secs: f64,
    /// True while this root sits on the apply work queue.
    pub on_work_queue: bool,

    transaction_requests: HashMap<String, TxnRequest<R>>,
    wait_version: Vec<VersionWaiter<R>>,
}

impl<R> Root<R> {
    fn new(
        hash: HashAlgo,
        big_val_threshold: usize,
        ns: &str,
        owner: UserId,
        flags: u32,
    ) -> Self {
        let is_primary = ns == PRIMARY_NAMESPACE;
        Self {
            ns_name: ns.to_string(),
            is_primary,
            owner,
            flags,
            seq: 0,
            // placeholder until the first setroot
            rootref: TreeObj::empty_dir().hash(hash).expect("empty dir hashes").0,
            txn_mgr: KvstxnMgr::new(ns, is_primary, hash, big_val_threshold),
            remove: false,
            setroot_pause: false,
            setroot_queue: VecDeque::new(),
            last_update_secs: 0.0,
            on_work_queue: false,
            transaction_requests: HashMap::new(),
            wait_version: Vec::new(),
        }
    }

    /// Check a request credential against this namespace's owner.
    pub fn check_user(&self, cred: Cred) -> Result<(), KvsError> {
        cred.authorize(self.owner)
    }

    /// Install a new snapshot if it advances the sequence (seq 0 installs
    /// the initial root unconditionally).
    ///
    /// Returns true if the root changed; the caller then drains version
    /// waiters and refreshes `last_update_secs`.
    pub fn setroot(&mut self, rootref: &Blobref, seq: u64) -> bool {
        if seq == 0 || seq > self.seq {
            self.rootref = rootref.clone();
            self.seq = seq;
            true
        } else {
            false
        }
    }

    /// Register a version waiter. Fails if the target was already reached;
    /// the caller should respond immediately instead.
    pub fn wait_version_add(&mut self, waiter: VersionWaiter<R>) -> Result<(), KvsError> {
        if self.seq >= waiter.seq {
            return Err(KvsError::Invalid);
        }
        let pos = self.wait_version.partition_point(|w| w.seq <= waiter.seq);
        self.wait_version.insert(pos, waiter);
        Ok(())
    }

    /// Detach waiters whose target has been reached, or all of them on
    /// namespace removal. The caller responds to each.
    pub fn wait_version_drain(&mut self, all: bool) -> Vec<VersionWaiter<R>> {
        if all {
            return std::mem::take(&mut self.wait_version);
        }
        let reached = self.wait_version.partition_point(|w| w.seq <= self.seq);
        self.wait_version.drain(..reached).collect()
    }

    /// Remove version waiters belonging to a disconnected client.
    pub fn wait_version_remove_client(&mut self, client: ClientId) -> usize {
        let before = self.wait_version.len();
        self.wait_version.retain(|w| w.client != Some(client));
        before - self.wait_version.len()
    }

    /// Number of registered version waiters.
    pub fn wait_version_count(&self) -> usize {
        self.wait_version.len()
    }

    /// Register a transaction request under its name.
    pub fn save_transaction_request(&mut self, request: TxnRequest<R>) -> Result<(), KvsError> {
        if self.transaction_requests.contains_key(request.name()) {
            return Err(KvsError::Exists);
        }
        self.transaction_requests.insert(request.name().to_string(), request);
        Ok(())
    }

    /// Look up a pending transaction request.
    pub fn transaction_request_mut(&mut self, name: &str) -> Option<&mut TxnRequest<R>> {
        self.transaction_requests.get_mut(name)
    }

    /// Remove a finalized transaction request.
    pub fn remove_transaction_request(&mut self, name: &str) -> Option<TxnRequest<R>> {
        self.transaction_requests.remove(name)
    }

    /// Names of requests that never reached the ready queue.
    ///
    /// On namespace removal these must be finalized with `NotSup`; ready
    /// transactions surface their error through the apply path instead.
    pub fn unprocessed_request_names(&self) -> Vec<String> {
        self.transaction_requests
            .values()
            .filter(|tr| !tr.processed())
            .map(|tr| tr.name().to_string())
            .collect()
    }

    /// Number of pending transaction requests.
    pub fn transaction_request_count(&self) -> usize {
        self.transaction_requests.len()
    }
}

//─────────────────────────────
//  Root manager
//─────────────────────────────

/// All namespace roots on this rank, plus the apply work queue.
#[derive(Debug)]
pub struct RootMgr<R> {
    hash: HashAlgo,
    big_val_threshold: usize,
    roots: HashMap<String, Root<R>>,
    work_queue: VecDeque<String>,
}

impl<R> RootMgr<R> {
    /// Create an empty manager; roots it mints share `hash` and the
    /// val→valref promotion threshold.
    pub fn new(hash: HashAlgo, big_val_threshold: usize) -> Self {
        Self { hash, big_val_threshold, roots: HashMap::new(), work_queue: VecDeque::new() }
    }

    /// Number of roots, draining ones included.
    pub fn root_count(&self) -> usize {
        self.roots.len()
    }

    /// Create a root. Fails with `Exists` if the name is present, even if
    /// that root is draining.
    pub fn create_root(
        &mut self,
        ns: &str,
        owner: UserId,
        flags: u32,
    ) -> Result<&mut Root<R>, KvsError> {
        if self.roots.contains_key(ns) {
            return Err(KvsError::Exists);
        }
        let root = Root::new(self.hash, self.big_val_threshold, ns, owner, flags);
        Ok(self.roots.entry(ns.to_string()).or_insert(root))
    }

    /// Drop a root entirely (the final step of removal).
    pub fn remove_root(&mut self, ns: &str) -> Option<Root<R>> {
        self.work_queue.retain(|name| name != ns);
        self.roots.remove(ns)
    }

    /// Look up a root, draining or not.
    pub fn lookup(&self, ns: &str) -> Option<&Root<R>> {
        self.roots.get(ns)
    }

    /// Look up a root, draining or not, mutably.
    pub fn lookup_mut(&mut self, ns: &str) -> Option<&mut Root<R>> {
        self.roots.get_mut(ns)
    }

    /// Look up a root, treating one marked for removal as absent.
    pub fn lookup_safe(&self, ns: &str) -> Option<&Root<R>> {
        self.roots.get(ns).filter(|root| !root.remove)
    }

    /// Mutable variant of [`RootMgr::lookup_safe`].
    pub fn lookup_safe_mut(&mut self, ns: &str) -> Option<&mut Root<R>> {
        self.roots.get_mut(ns).filter(|root| !root.remove)
    }

    /// Names of all roots (snapshot, for iteration that mutates).
    pub fn namespaces(&self) -> Vec<String> {
        self.roots.keys().cloned().collect()
    }

    /// Append a root to the work queue if not already on it.
    pub fn work_queue_append(&mut self, ns: &str) {
        if let Some(root) = self.roots.get_mut(ns) {
            if !root.on_work_queue {
                root.on_work_queue = true;
                self.work_queue.push_back(ns.to_string());
            }
        }
    }

    /// Drop a root from the work queue.
    pub fn work_queue_remove(&mut self, ns: &str) {
        if let Some(root) = self.roots.get_mut(ns) {
            root.on_work_queue = false;
        }
        self.work_queue.retain(|name| name != ns);
    }

    /// Consume the entire work queue, in order. Roots with work remaining
    /// after processing are re-appended by the apply loop.
    pub fn work_queue_take(&mut self) -> Vec<String> {
        let names: Vec<String> = self.work_queue.drain(..).collect();
        for ns in &names {
            if let Some(root) = self.roots.get_mut(ns) {
                root.on_work_queue = false;
            }
        }
        names
    }

    /// True if any root awaits an apply pass.
    pub fn work_pending(&self) -> bool {
        !self.work_queue.is_empty()
    }
}
