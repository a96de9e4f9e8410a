//! The reactor: one task owning all mutable engine state.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use anyhow::{bail, Context, Result};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use arbor_cache::{Cache, WaitId, WaitMgr};
use arbor_engine::{Kvstxn, KvsEvent, Lookup, LookupResult, RootMgr, TxnProcess, TxnRequest, VersionWaiter};
use arbor_store_core::{Checkpoint, CheckpointStore, ContentStore};
use arbor_treeobj::{Blobref, TreeObj, TxnOp};
use arbor_types::{
    ClientId, Cred, KvsError, Role, COMMIT_SYNC, INT_NO_PUBLISH, PRIMARY_NAMESPACE,
};

use crate::api::{
    KvsHandle, LookupPlusReply, LookupRequest, Msg, NamespaceInfo, Resp, RootInfo, RootReply,
    Stats, StatsNamespace,
};
use crate::config::KvsConfig;

//─────────────────────────────
//  Runtime handle
//─────────────────────────────

/// A running KVS instance (one rank).
pub struct KvsRuntime {
    handle: KvsHandle,
    task: JoinHandle<()>,
}

impl KvsRuntime {
    /// Start a runtime.
    ///
    /// Rank 0 stores the empty root directory, restores the primary
    /// namespace from the checkpoint service when one exists, and then
    /// serves requests. Follower ranks (`rank > 0`) need `upstream` to
    /// bootstrap namespaces and relay commits; all ranks of one instance
    /// share the same event `bus`.
    pub async fn start(
        config: KvsConfig,
        content: Arc<dyn ContentStore>,
        checkpoint: Arc<dyn CheckpointStore>,
        bus: broadcast::Sender<KvsEvent>,
        upstream: Option<KvsHandle>,
    ) -> Result<Self> {
        let (tx, rx) = mpsc::channel(1024);
        let handle = KvsHandle { tx: tx.clone(), bus: bus.clone() };

        let (empty_root_ref, empty_data) = TreeObj::empty_dir()
            .hash(config.hash)
            .expect("empty dir always hashes");
        let stored = content
            .store(config.hash, empty_data.clone())
            .await
            .context("storing initial root directory")?;
        if stored != empty_root_ref {
            bail!("content store hash mismatch: kvs={empty_root_ref} content={stored}");
        }

        let mut reactor = Reactor {
            rank: config.rank,
            checkpoint_period: config.checkpoint_period,
            cache: Cache::new(),
            waits: WaitMgr::new(),
            roots: RootMgr::new(config.hash, config.big_val_threshold),
            lookups: HashMap::new(),
            next_lookup_id: 1,
            ns_waiters: HashMap::new(),
            store_pending: HashSet::new(),
            content,
            checkpoint,
            bus,
            upstream,
            self_tx: tx,
            epoch: 1,
            start: Instant::now(),
            faults: 0,
            txn_seq: 0,
            checkpoint_seq: 0,
            empty_root_ref: empty_root_ref.clone(),
            config,
        };
        reactor.cache.set_raw(&empty_root_ref, empty_data, reactor.epoch);

        if reactor.rank == 0 {
            let (initial_ref, initial_seq) = match reactor.checkpoint.get().await? {
                Some(cp) => {
                    info!(rootref = %cp.rootref, rootseq = cp.rootseq,
                          "restored primary namespace from checkpoint");
                    (cp.rootref, cp.rootseq)
                }
                None => (empty_root_ref, 0),
            };
            let root = reactor
                .roots
                .create_root(PRIMARY_NAMESPACE, reactor.config.owner, 0)
                .expect("no roots yet");
            root.setroot(&initial_ref, initial_seq);
        }

        // subscribe before returning so no event published after start()
        // can be missed
        let bus_rx = reactor.bus.subscribe();
        let task = tokio::spawn(reactor.run(rx, bus_rx));
        Ok(Self { handle, task })
    }

    /// Handle for issuing requests.
    pub fn handle(&self) -> KvsHandle {
        self.handle.clone()
    }

    /// Stop the reactor; pending requests are drained with
    /// [`KvsError::NoSys`].
    pub async fn shutdown(self) {
        let _ = self.handle.tx.send(Msg::Shutdown).await;
        let _ = self.task.await;
    }
}

//─────────────────────────────
//  Reactor state
//─────────────────────────────

#[derive(Debug, Clone)]
enum ResumeAction {
    Lookup(u64),
    Apply(String),
}

struct PendingLookup {
    lookup: Lookup,
    resp: Resp<LookupPlusReply>,
    client: Option<ClientId>,
}

enum NsWaiter {
    Lookup(u64),
    Replay(Msg),
}

enum ApplyStep {
    Noop,
    StallLoad { refs: Vec<Blobref>, drained: Vec<WaitId> },
    StallDirty { refs: Vec<Blobref>, drained: Vec<WaitId> },
    Flush { drained: Vec<WaitId> },
    Checkpoint { rootref: Blobref, rootseq: u64, drained: Vec<WaitId> },
    Done {
        errnum: Option<KvsError>,
        fallback: bool,
        names: Vec<String>,
        keys: Vec<String>,
        newroot: Option<Blobref>,
        no_publish: bool,
        drained: Vec<WaitId>,
        cleanup_drained: Vec<WaitId>,
    },
}

struct Reactor {
    config: KvsConfig,
    rank: u32,
    checkpoint_period: Option<Duration>,

    cache: Cache,
    waits: WaitMgr<ResumeAction>,
    roots: RootMgr<Resp<RootReply>>,
    lookups: HashMap<u64, PendingLookup>,
    next_lookup_id: u64,
    ns_waiters: HashMap<String, Vec<NsWaiter>>,
    store_pending: HashSet<Blobref>,

    content: Arc<dyn ContentStore>,
    checkpoint: Arc<dyn CheckpointStore>,
    bus: broadcast::Sender<KvsEvent>,
    upstream: Option<KvsHandle>,
    self_tx: mpsc::Sender<Msg>,

    epoch: u64,
    start: Instant,
    faults: u64,
    txn_seq: u64,
    checkpoint_seq: u64,
    empty_root_ref: Blobref,
}

async fn maybe_tick(interval: &mut Option<tokio::time::Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

fn make_interval(period: Option<Duration>) -> Option<tokio::time::Interval> {
    period.map(|p| {
        let mut interval = tokio::time::interval(p);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        // the immediate first tick is not a useful checkpoint
        interval.reset();
        interval
    })
}

impl Reactor {
    async fn run(mut self, mut rx: mpsc::Receiver<Msg>, mut bus_rx: broadcast::Receiver<KvsEvent>) {
        let mut heartbeat = tokio::time::interval(self.config.heartbeat_period_clamped());
        heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut checkpoint_tick = make_interval(self.checkpoint_period);

        loop {
            tokio::select! {
                msg = rx.recv() => match msg {
                    None | Some(Msg::Shutdown) => break,
                    Some(Msg::ConfigReload { checkpoint_period, resp }) => {
                        self.checkpoint_period = checkpoint_period;
                        checkpoint_tick = make_interval(checkpoint_period);
                        let _ = resp.send(Ok(()));
                    }
                    Some(msg) => self.dispatch(msg),
                },
                event = bus_rx.recv() => match event {
                    Ok(event) => {
                        if event.from_rank() != self.rank {
                            self.handle_event(event);
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!(missed = n, "event bus receiver lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => {}
                },
                _ = heartbeat.tick() => self.heartbeat(),
                _ = maybe_tick(&mut checkpoint_tick) => self.checkpoint_kick(),
            }
            self.run_apply_loop();
        }
        self.drain_pending();
    }

    fn now_secs(&self) -> f64 {
        self.start.elapsed().as_secs_f64()
    }

    fn publish(&self, event: KvsEvent) {
        // no subscribers is fine (single-rank instance)
        let _ = self.bus.send(event);
    }

    //─────────────────────────────
    //  Request dispatch
    //─────────────────────────────

    fn dispatch(&mut self, msg: Msg) {
        match msg {
            Msg::Lookup { req, resp } => self.handle_lookup(req, resp),
            Msg::Commit { namespace, ops, flags, cred, client, resp } => {
                self.handle_commit(namespace, ops, flags, cred, client, resp)
            }
            Msg::Fence { req, resp } => self.handle_fence(req, resp),
            Msg::RelayCommit { namespace, name, ops, flags } => {
                self.handle_relaycommit(namespace, name, ops, flags)
            }
            Msg::RelayFence { namespace, name, nprocs, ops, flags } => {
                self.handle_relayfence(namespace, name, nprocs, ops, flags)
            }
            Msg::GetRoot { namespace, cred, resp } => self.handle_getroot(namespace, cred, resp),
            Msg::WaitVersion { namespace, rootseq, cred, client, resp } => {
                self.handle_wait_version(namespace, rootseq, cred, client, resp)
            }
            Msg::NamespaceCreate { namespace, rootref, owner, flags, resp } => {
                let _ = resp.send(self.namespace_create(&namespace, rootref, owner, flags));
            }
            Msg::NamespaceRemove { namespace, resp } => {
                let _ = resp.send(self.namespace_remove(&namespace));
            }
            Msg::NamespaceList { resp } => {
                let list = self
                    .roots
                    .namespaces()
                    .into_iter()
                    .filter_map(|ns| self.roots.lookup_safe(&ns))
                    .map(|root| NamespaceInfo {
                        namespace: root.ns_name.clone(),
                        owner: root.owner,
                        flags: root.flags,
                    })
                    .collect();
                let _ = resp.send(Ok(list));
            }
            Msg::Dropcache { resp } => {
                let size = self.cache.count();
                // next-epoch cutoff so even entries touched this epoch go
                let expired = self.cache.expire(self.epoch + 1, 0);
                info!(expired, size, "dropped cache entries");
                let _ = resp.send(Ok(expired));
            }
            Msg::SetrootPause { namespace, resp } => {
                let _ = resp.send(self.with_safe_root(&namespace, |root| {
                    root.setroot_pause = true;
                }));
            }
            Msg::SetrootUnpause { namespace, resp } => {
                let result = self.with_safe_root(&namespace, |root| {
                    root.setroot_pause = false;
                });
                if result.is_ok() {
                    self.drain_setroot_queue(&namespace);
                }
                let _ = resp.send(result);
            }
            Msg::StatsGet { resp } => {
                let _ = resp.send(Ok(self.stats()));
            }
            Msg::StatsClear { resp } => {
                self.faults = 0;
                for ns in self.roots.namespaces() {
                    if let Some(root) = self.roots.lookup_mut(&ns) {
                        root.txn_mgr.clear_noop_stores();
                    }
                }
                let _ = resp.send(Ok(()));
            }
            Msg::Disconnect { client } => self.handle_disconnect(client),

            Msg::LoadDone { blobref, result } => self.handle_load_done(blobref, result),
            Msg::StoreDone { blobref, result } => self.handle_store_done(blobref, result),
            Msg::FlushDone { namespace, ok } => self.handle_flush_done(&namespace, ok),
            Msg::CheckpointDone { namespace, ok } => self.handle_checkpoint_done(&namespace, ok),
            Msg::GetRootDone { namespace, result } => self.handle_getroot_done(namespace, result),
            // handled in the select loop
            Msg::ConfigReload { resp, .. } => {
                let _ = resp.send(Ok(()));
            }
            Msg::Shutdown => {}
        }
    }

    fn with_safe_root(
        &mut self,
        ns: &str,
        f: impl FnOnce(&mut arbor_engine::Root<Resp<RootReply>>),
    ) -> Result<(), KvsError> {
        match self.roots.lookup_safe_mut(ns) {
            Some(root) => {
                f(root);
                Ok(())
            }
            None => Err(KvsError::NotSup),
        }
    }

    fn stats(&self) -> Stats {
        let cache = self.cache.stats();
        let mut namespaces = std::collections::BTreeMap::new();
        for ns in self.roots.namespaces() {
            if let Some(root) = self.roots.lookup(&ns) {
                namespaces.insert(
                    ns,
                    StatsNamespace {
                        versionwaiters: root.wait_version_count(),
                        noop_stores: root.txn_mgr.noop_stores(),
                        transactions: root.transaction_request_count(),
                        readytransactions: root.txn_mgr.ready_count(),
                        store_revision: root.seq,
                    },
                );
            }
        }
        Stats {
            cache_count: cache.count,
            cache_incomplete: cache.incomplete,
            cache_dirty: cache.dirty,
            cache_bytes: cache.total_bytes,
            faults: self.faults,
            namespaces,
        }
    }

    //─────────────────────────────
    //  Content load / store plumbing
    //─────────────────────────────

    /// Attach `wait` to `blobref`, issuing a load RPC if the blob is not
    /// resident. No-op (no attach) when the entry is already valid.
    fn load_ref(&mut self, blobref: &Blobref, wait: WaitId) {
        match self.cache.lookup(blobref, self.epoch) {
            Some(entry) if entry.is_valid() => {}
            Some(_) => {
                // load already in flight; share it
                self.cache.wait_valid(blobref, wait);
                self.waits.incref(wait);
            }
            None => {
                self.cache.insert(blobref, self.epoch);
                self.cache.wait_valid(blobref, wait);
                self.waits.incref(wait);
                self.faults += 1;
                let content = self.content.clone();
                let tx = self.self_tx.clone();
                let blobref = blobref.clone();
                tokio::spawn(async move {
                    let result = content.load(&blobref).await.map_err(|e| e.to_string());
                    let _ = tx.send(Msg::LoadDone { blobref, result }).await;
                });
            }
        }
    }

    fn handle_load_done(&mut self, blobref: Blobref, result: Result<Option<Vec<u8>>, String>) {
        match result {
            Ok(Some(data)) => {
                let drained = self.cache.set_raw(&blobref, data, self.epoch);
                self.complete_waiters(drained, None);
            }
            Ok(None) => {
                warn!(%blobref, "blob not present in content store");
                self.load_error(&blobref, KvsError::NotFound);
            }
            Err(message) => {
                error!(%blobref, message, "content load failed");
                self.load_error(&blobref, KvsError::NoSys);
            }
        }
    }

    fn load_error(&mut self, blobref: &Blobref, errnum: KvsError) {
        let drained = self.cache.drain_valid(blobref);
        self.complete_waiters(drained, Some(errnum));
        if self.cache.remove(blobref).is_err() {
            error!(%blobref, "failed load left a pinned cache entry");
        }
    }

    /// Issue a store RPC for a dirty entry unless one is already in flight.
    fn store_ref(&mut self, blobref: &Blobref) {
        if self.store_pending.contains(blobref) {
            return;
        }
        let Some(data) = self
            .cache
            .peek(blobref)
            .and_then(|entry| entry.raw().map(<[u8]>::to_vec))
        else {
            error!(%blobref, "dirty entry has no content");
            return;
        };
        self.store_pending.insert(blobref.clone());
        let content = self.content.clone();
        let hash = self.config.hash;
        let tx = self.self_tx.clone();
        let blobref = blobref.clone();
        tokio::spawn(async move {
            let result = content.store(hash, data).await.map_err(|e| e.to_string());
            let _ = tx.send(Msg::StoreDone { blobref, result }).await;
        });
    }

    fn handle_store_done(&mut self, blobref: Blobref, result: Result<Blobref, String>) {
        self.store_pending.remove(&blobref);
        match result {
            Ok(stored) if stored == blobref => {
                let drained = self.cache.set_dirty(&blobref, false);
                self.complete_waiters(drained, None);
            }
            Ok(stored) => {
                error!(%blobref, %stored, "content store returned an inconsistent blobref");
                self.store_error(&blobref, KvsError::Proto);
            }
            Err(message) => {
                error!(%blobref, message, "content store failed");
                self.store_error(&blobref, KvsError::NoSys);
            }
        }
    }

    fn store_error(&mut self, blobref: &Blobref, errnum: KvsError) {
        let drained = self.cache.drain_notdirty(blobref);
        self.complete_waiters(drained, Some(errnum));
        self.cache.force_clear_dirty(blobref);
        let _ = self.cache.remove(blobref);
    }

    fn complete_waiters(&mut self, ids: Vec<WaitId>, errnum: Option<KvsError>) {
        for (action, errnum) in self.waits.complete(ids, errnum) {
            self.resume(action, errnum);
        }
    }

    fn resume(&mut self, action: ResumeAction, errnum: Option<KvsError>) {
        match action {
            ResumeAction::Lookup(id) => {
                if let (Some(errnum), Some(pending)) = (errnum, self.lookups.get_mut(&id)) {
                    pending.lookup.set_aux_errnum(errnum);
                }
                self.drive_lookup(id);
            }
            ResumeAction::Apply(ns) => {
                if let Some(root) = self.roots.lookup_mut(&ns) {
                    if let Some(txn) = root.txn_mgr.ready_transaction() {
                        if let Some(errnum) = errnum {
                            txn.set_aux_errnum(errnum);
                        }
                        txn.blocked = false;
                    }
                }
                self.kvstxn_apply(&ns);
            }
        }
    }

    //─────────────────────────────
    //  Lookup driving
    //─────────────────────────────

    fn handle_lookup(&mut self, req: LookupRequest, resp: Resp<LookupPlusReply>) {
        let ns = req
            .namespace
            .clone()
            .unwrap_or_else(|| PRIMARY_NAMESPACE.to_string());
        let lookup = Lookup::new(
            &ns,
            req.rootdir,
            req.rootseq.unwrap_or(0),
            &req.key,
            req.cred,
            req.flags,
            self.epoch,
        );
        let id = self.next_lookup_id;
        self.next_lookup_id += 1;
        self.lookups.insert(id, PendingLookup { lookup, resp, client: req.client });
        self.drive_lookup(id);
    }

    fn drive_lookup(&mut self, id: u64) {
        loop {
            let Some(pending) = self.lookups.get_mut(&id) else {
                return;
            };
            if let Some(errnum) = pending.lookup.aux_errnum() {
                let pending = self.lookups.remove(&id).expect("pending present");
                let _ = pending.resp.send(Err(errnum));
                return;
            }
            pending.lookup.set_epoch(self.epoch);
            match pending.lookup.process(&mut self.cache, &self.roots) {
                LookupResult::Finished => {
                    let pending = self.lookups.remove(&id).expect("pending present");
                    let val = pending.lookup.value().cloned();
                    let reply = LookupPlusReply {
                        errnum: val.is_none().then_some(KvsError::NotFound),
                        val,
                        rootseq: pending.lookup.root_seq(),
                        rootref: pending.lookup.root_ref().cloned(),
                    };
                    let _ = pending.resp.send(Ok(reply));
                    return;
                }
                LookupResult::Error => {
                    let pending = self.lookups.remove(&id).expect("pending present");
                    let _ = pending.resp.send(Err(pending.lookup.errnum()));
                    return;
                }
                LookupResult::LoadMissingNamespace => {
                    let missing = pending
                        .lookup
                        .missing_namespace()
                        .expect("stall names a namespace")
                        .to_string();
                    if self.rank == 0 || self.upstream.is_none() {
                        let pending = self.lookups.remove(&id).expect("pending present");
                        let _ = pending.resp.send(Err(KvsError::NotSup));
                        return;
                    }
                    self.ns_wait(missing, NsWaiter::Lookup(id));
                    return;
                }
                LookupResult::LoadMissingRefs => {
                    let refs = pending.lookup.missing_refs(&self.cache);
                    let client = pending.client;
                    let wait = self.waits.create(ResumeAction::Lookup(id), client);
                    for blobref in &refs {
                        self.load_ref(blobref, wait);
                    }
                    if self.waits.usecount(wait) == 0 {
                        // everything resident after all; retry immediately
                        self.waits.abandon(wait);
                        continue;
                    }
                    return;
                }
            }
        }
    }

    //─────────────────────────────
    //  Namespace bootstrap (rank > 0)
    //─────────────────────────────

    fn ns_wait(&mut self, ns: String, waiter: NsWaiter) {
        let queue = self.ns_waiters.entry(ns.clone()).or_default();
        let first = queue.is_empty();
        queue.push(waiter);
        if !first {
            return;
        }
        let upstream = self.upstream.clone().expect("follower has upstream");
        let cred = Cred::owner(self.config.owner.0);
        let tx = self.self_tx.clone();
        tokio::spawn(async move {
            let result = upstream.getroot(&ns, cred).await;
            let _ = tx.send(Msg::GetRootDone { namespace: ns, result }).await;
        });
    }

    fn handle_getroot_done(&mut self, namespace: String, result: Result<RootInfo, KvsError>) {
        let waiters = self.ns_waiters.remove(&namespace).unwrap_or_default();
        match result {
            Ok(info) => {
                if self.roots.lookup(&namespace).is_none() {
                    if let Err(errnum) =
                        self.roots.create_root(&namespace, info.owner, info.flags).map(|_| ())
                    {
                        error!(%namespace, %errnum, "creating follower root failed");
                        self.fail_ns_waiters(waiters, errnum);
                        return;
                    }
                }
                let now = self.now_secs();
                if let Some(root) = self.roots.lookup_mut(&namespace) {
                    if !root.remove && root.setroot(&info.rootref, info.rootseq) {
                        root.last_update_secs = now;
                    }
                }
                for waiter in waiters {
                    match waiter {
                        NsWaiter::Lookup(id) => self.drive_lookup(id),
                        NsWaiter::Replay(msg) => self.dispatch(msg),
                    }
                }
            }
            Err(errnum) => self.fail_ns_waiters(waiters, errnum),
        }
    }

    fn fail_ns_waiters(&mut self, waiters: Vec<NsWaiter>, errnum: KvsError) {
        for waiter in waiters {
            match waiter {
                NsWaiter::Lookup(id) => {
                    if let Some(pending) = self.lookups.remove(&id) {
                        let _ = pending.resp.send(Err(errnum));
                    }
                }
                NsWaiter::Replay(msg) => respond_err(msg, errnum),
            }
        }
    }

    //─────────────────────────────
    //  Commit / fence
    //─────────────────────────────

    fn handle_commit(
        &mut self,
        namespace: String,
        ops: Vec<TxnOp>,
        flags: u32,
        cred: Cred,
        client: Option<ClientId>,
        resp: Resp<RootReply>,
    ) {
        if cred.role == Role::User {
            if let Err(errnum) = guest_commit_authorize(&ops) {
                let _ = resp.send(Err(errnum));
                return;
            }
        }
        if self.roots.lookup_safe(&namespace).is_none() {
            if self.rank == 0 || self.upstream.is_none() {
                let _ = resp.send(Err(KvsError::NotSup));
            } else {
                self.ns_wait(
                    namespace.clone(),
                    NsWaiter::Replay(Msg::Commit { namespace, ops, flags, cred, client, resp }),
                );
            }
            return;
        }
        let root = self.roots.lookup_safe_mut(&namespace).expect("checked above");
        if let Err(errnum) = root.check_user(cred) {
            let _ = resp.send(Err(errnum));
            return;
        }

        let name = format!("{}-{}", self.rank, self.txn_seq);
        self.txn_seq += 1;
        let mut request = TxnRequest::new(&name, 1, flags);
        request.add_request(ops.clone(), Some(resp)).expect("fresh request");
        root.save_transaction_request(request).expect("name is unique");

        if self.rank == 0 {
            let root = self.roots.lookup_mut(&namespace).expect("checked above");
            root.transaction_request_mut(&name)
                .expect("just saved")
                .set_processed();
            if let Err(errnum) = root.txn_mgr.add_transaction(&name, ops, flags, 0) {
                self.finalize_transaction(&namespace, &name, Some(errnum));
                return;
            }
            self.roots.work_queue_append(&namespace);
        } else {
            let upstream = self.upstream.clone().expect("follower has upstream");
            tokio::spawn(async move {
                upstream.relay_commit(namespace, name, ops, flags).await;
            });
        }
    }

    fn handle_fence(&mut self, req: crate::api::FenceRequest, resp: Resp<RootReply>) {
        if req.cred.role == Role::User {
            if let Err(errnum) = guest_commit_authorize(&req.ops) {
                let _ = resp.send(Err(errnum));
                return;
            }
        }
        if self.roots.lookup_safe(&req.namespace).is_none() {
            if self.rank == 0 || self.upstream.is_none() {
                let _ = resp.send(Err(KvsError::NotSup));
            } else {
                self.ns_wait(req.namespace.clone(), NsWaiter::Replay(Msg::Fence { req, resp }));
            }
            return;
        }
        let root = self.roots.lookup_safe_mut(&req.namespace).expect("checked above");
        if let Err(errnum) = root.check_user(req.cred) {
            let _ = resp.send(Err(errnum));
            return;
        }

        if root.transaction_request_mut(&req.name).is_none() {
            root.save_transaction_request(TxnRequest::new(&req.name, req.nprocs, req.flags))
                .expect("checked absent");
        }
        let request = root.transaction_request_mut(&req.name).expect("present");
        if request.flags() != req.flags || request.nprocs() != req.nprocs {
            let _ = resp.send(Err(KvsError::Invalid));
            return;
        }
        if request.count_reached() {
            let _ = resp.send(Err(KvsError::Overflow));
            return;
        }
        request
            .add_request(req.ops.clone(), Some(resp))
            .expect("count checked above");

        if self.rank == 0 {
            self.fence_enqueue_if_ready(&req.namespace, &req.name);
        } else {
            let upstream = self.upstream.clone().expect("follower has upstream");
            let (namespace, name, nprocs, ops, flags) =
                (req.namespace, req.name, req.nprocs, req.ops, req.flags);
            tokio::spawn(async move {
                upstream.relay_fence(namespace, name, nprocs, ops, flags).await;
            });
        }
    }

    /// Move a fence whose participant count has been reached onto the
    /// ready queue (rank 0).
    fn fence_enqueue_if_ready(&mut self, namespace: &str, name: &str) {
        let Some(root) = self.roots.lookup_mut(namespace) else {
            return;
        };
        let Some(request) = root.transaction_request_mut(name) else {
            return;
        };
        if !request.count_reached() || request.processed() {
            return;
        }
        request.set_processed();
        let ops = request.ops().to_vec();
        let flags = request.flags();
        if let Err(errnum) = root.txn_mgr.add_transaction(name, ops, flags, 0) {
            self.finalize_transaction(namespace, name, Some(errnum));
            return;
        }
        self.roots.work_queue_append(namespace);
    }

    fn handle_relaycommit(&mut self, namespace: String, name: String, ops: Vec<TxnOp>, flags: u32) {
        let Some(root) = self.roots.lookup_safe_mut(&namespace) else {
            self.error_event_send(&namespace, vec![name], KvsError::NotSup);
            return;
        };
        if let Err(errnum) = root.txn_mgr.add_transaction(&name, ops, flags, 0) {
            self.error_event_send(&namespace, vec![name], errnum);
            return;
        }
        self.roots.work_queue_append(&namespace);
    }

    fn handle_relayfence(
        &mut self,
        namespace: String,
        name: String,
        nprocs: u32,
        ops: Vec<TxnOp>,
        flags: u32,
    ) {
        let Some(root) = self.roots.lookup_safe_mut(&namespace) else {
            self.error_event_send(&namespace, vec![name], KvsError::NotSup);
            return;
        };
        if root.transaction_request_mut(&name).is_none() {
            root.save_transaction_request(TxnRequest::new(&name, nprocs, flags))
                .expect("checked absent");
        }
        let request = root.transaction_request_mut(&name).expect("present");
        if request.flags() != flags || request.nprocs() != nprocs {
            self.error_event_send(&namespace, vec![name], KvsError::Invalid);
            return;
        }
        if request.count_reached() {
            self.error_event_send(&namespace, vec![name], KvsError::Overflow);
            return;
        }
        request.add_request(ops, None).expect("count checked above");
        self.fence_enqueue_if_ready(&namespace, &name);
    }

    //─────────────────────────────
    //  getroot / wait-version
    //─────────────────────────────

    fn handle_getroot(&mut self, namespace: String, cred: Cred, resp: Resp<RootInfo>) {
        match self.roots.lookup_safe(&namespace) {
            Some(root) => {
                if let Err(errnum) = root.check_user(cred) {
                    let _ = resp.send(Err(errnum));
                    return;
                }
                let _ = resp.send(Ok(RootInfo {
                    namespace: root.ns_name.clone(),
                    owner: root.owner,
                    rootseq: root.seq,
                    rootref: root.rootref.clone(),
                    flags: root.flags,
                }));
            }
            None => {
                if self.rank == 0 || self.upstream.is_none() {
                    let _ = resp.send(Err(KvsError::NotSup));
                } else {
                    self.ns_wait(
                        namespace.clone(),
                        NsWaiter::Replay(Msg::GetRoot { namespace, cred, resp }),
                    );
                }
            }
        }
    }

    fn handle_wait_version(
        &mut self,
        namespace: String,
        rootseq: u64,
        cred: Cred,
        client: Option<ClientId>,
        resp: Resp<RootReply>,
    ) {
        if self.roots.lookup_safe(&namespace).is_none() {
            if self.rank == 0 || self.upstream.is_none() {
                let _ = resp.send(Err(KvsError::NotSup));
            } else {
                self.ns_wait(
                    namespace.clone(),
                    NsWaiter::Replay(Msg::WaitVersion { namespace, rootseq, cred, client, resp }),
                );
            }
            return;
        }
        let root = self.roots.lookup_safe_mut(&namespace).expect("checked above");
        if let Err(errnum) = root.check_user(cred) {
            let _ = resp.send(Err(errnum));
            return;
        }
        if root.seq >= rootseq {
            let _ = resp.send(Ok(RootReply { rootref: root.rootref.clone(), rootseq: root.seq }));
            return;
        }
        root.wait_version_add(VersionWaiter { seq: rootseq, client, reply: resp })
            .expect("target not yet reached");
    }

    //─────────────────────────────
    //  Namespace lifecycle
    //─────────────────────────────

    fn namespace_create(
        &mut self,
        ns: &str,
        rootref: Option<Blobref>,
        owner: arbor_types::UserId,
        flags: u32,
    ) -> Result<(), KvsError> {
        if self.rank != 0 {
            return Err(KvsError::NotSup);
        }
        if self.roots.lookup(ns).is_some() {
            // identical name still draining also counts
            return Err(KvsError::Exists);
        }
        let rootref = rootref.unwrap_or_else(|| self.empty_root_ref.clone());
        rootref.validate().map_err(|_| KvsError::Invalid)?;
        let now = self.now_secs();
        let root = self.roots.create_root(ns, owner, flags).expect("checked absent");
        root.setroot(&rootref, 0);
        root.last_update_secs = now;
        let rootseq = root.seq;
        self.publish(KvsEvent::NamespaceCreated {
            namespace: ns.to_string(),
            rootref,
            rootseq,
            owner,
            from_rank: self.rank,
        });
        Ok(())
    }

    fn namespace_remove(&mut self, ns: &str) -> Result<(), KvsError> {
        if self.rank != 0 {
            return Err(KvsError::NotSup);
        }
        if ns.eq_ignore_ascii_case(PRIMARY_NAMESPACE) {
            return Err(KvsError::NotSup);
        }
        if self.roots.lookup_safe(ns).is_none() {
            // absent or already draining: silently succeed
            return Ok(());
        }
        self.publish(KvsEvent::NamespaceRemoved {
            namespace: ns.to_string(),
            from_rank: self.rank,
        });
        self.start_root_remove(ns);
        Ok(())
    }

    /// Flag a root as draining: detach it from the work queue, fail its
    /// version waiters, and fail transaction requests that never reached
    /// the ready queue. Ready transactions keep processing and surface
    /// `NotSup` through the apply path.
    fn start_root_remove(&mut self, ns: &str) {
        let Some(root) = self.roots.lookup_safe_mut(ns) else {
            return;
        };
        root.remove = true;
        let fired = root.wait_version_drain(true);
        let unprocessed = root.unprocessed_request_names();
        self.roots.work_queue_remove(ns);
        for waiter in fired {
            let _ = waiter.reply.send(Err(KvsError::NotSup));
        }
        for name in unprocessed {
            self.finalize_transaction(ns, &name, Some(KvsError::NotSup));
        }
    }

    /// Answer every caller registered under a transaction name.
    fn finalize_transaction(&mut self, ns: &str, name: &str, errnum: Option<KvsError>) {
        let Some(root) = self.roots.lookup_mut(ns) else {
            return;
        };
        let reply = RootReply { rootref: root.rootref.clone(), rootseq: root.seq };
        if let Some(mut request) = root.remove_transaction_request(name) {
            for resp in request.take_replies() {
                let _ = match errnum {
                    Some(errnum) => resp.send(Err(errnum)),
                    None => resp.send(Ok(reply.clone())),
                };
            }
        }
    }

    //─────────────────────────────
    //  Apply loop
    //─────────────────────────────

    fn run_apply_loop(&mut self) {
        loop {
            let work = self.roots.work_queue_take();
            if work.is_empty() {
                return;
            }
            for ns in work {
                self.apply_root(&ns);
            }
        }
    }

    fn apply_root(&mut self, ns: &str) {
        let merge = self.config.transaction_merge;
        let Some(root) = self.roots.lookup_mut(ns) else {
            return;
        };
        if merge {
            root.txn_mgr.merge_ready_transactions();
        }
        // a root marked for removal still drains its lingering ready
        // transactions here
        if root.txn_mgr.transaction_ready() {
            self.kvstxn_apply(ns);
        }
    }

    fn kvstxn_apply(&mut self, ns: &str) {
        let step = {
            let Some(root) = self.roots.lookup_mut(ns) else {
                warn!(%ns, "apply on unknown namespace");
                return;
            };
            let remove = root.remove;
            let rootref = root.rootref.clone();
            let rootseq = root.seq;
            match root.txn_mgr.ready_transaction() {
                None => ApplyStep::Noop,
                Some(txn) => {
                    let pre_errnum = if remove { Some(KvsError::NotSup) } else { txn.aux_errnum() };
                    if let Some(errnum) = pre_errnum {
                        Self::apply_error_step(&mut self.cache, txn, errnum)
                    } else {
                        match txn.process(&mut self.cache, self.epoch, &rootref) {
                            TxnProcess::Error => {
                                let errnum = txn.errnum().unwrap_or(KvsError::NotRecoverable);
                                Self::apply_error_step(&mut self.cache, txn, errnum)
                            }
                            TxnProcess::LoadMissingRefs => {
                                txn.blocked = true;
                                ApplyStep::StallLoad {
                                    refs: txn.missing_refs().to_vec(),
                                    drained: txn.take_drained_waiters(),
                                }
                            }
                            TxnProcess::DirtyCacheEntries => {
                                txn.blocked = true;
                                ApplyStep::StallDirty {
                                    refs: txn.dirty_cache_entries().to_vec(),
                                    drained: txn.take_drained_waiters(),
                                }
                            }
                            TxnProcess::SyncContentFlush => {
                                txn.blocked = true;
                                ApplyStep::Flush { drained: txn.take_drained_waiters() }
                            }
                            TxnProcess::SyncCheckpoint => {
                                txn.blocked = true;
                                let no_publish = txn.internal_flags() & INT_NO_PUBLISH != 0;
                                ApplyStep::Checkpoint {
                                    rootref: txn
                                        .newroot_ref()
                                        .expect("checkpoint follows store")
                                        .clone(),
                                    rootseq: if no_publish { rootseq } else { rootseq + 1 },
                                    drained: txn.take_drained_waiters(),
                                }
                            }
                            TxnProcess::Finished => ApplyStep::Done {
                                errnum: None,
                                fallback: false,
                                names: txn.names().to_vec(),
                                keys: txn.keys(),
                                newroot: txn.newroot_ref().cloned(),
                                no_publish: txn.internal_flags() & INT_NO_PUBLISH != 0,
                                drained: txn.take_drained_waiters(),
                                cleanup_drained: Vec::new(),
                            },
                        }
                    }
                }
            }
        };
        self.apply_step(ns, step);
    }

    fn apply_error_step(cache: &mut Cache, txn: &mut Kvstxn, errnum: KvsError) -> ApplyStep {
        let fallback = txn.fallback_mergeable()
            && !matches!(errnum, KvsError::NoMem | KvsError::NotSup);
        let cleanup_drained = txn.cleanup_dirty_entries(cache);
        ApplyStep::Done {
            errnum: Some(errnum),
            fallback,
            names: txn.names().to_vec(),
            keys: Vec::new(),
            newroot: None,
            no_publish: txn.internal_flags() & INT_NO_PUBLISH != 0,
            drained: txn.take_drained_waiters(),
            cleanup_drained,
        }
    }

    fn apply_step(&mut self, ns: &str, step: ApplyStep) {
        match step {
            ApplyStep::Noop => {
                self.roots.work_queue_remove(ns);
            }
            ApplyStep::StallLoad { refs, drained } => {
                self.complete_waiters(drained, None);
                let wait = self.waits.create(ResumeAction::Apply(ns.to_string()), None);
                for blobref in &refs {
                    self.load_ref(blobref, wait);
                }
                if self.waits.usecount(wait) == 0 {
                    self.waits.abandon(wait);
                    self.resume(ResumeAction::Apply(ns.to_string()), None);
                    return;
                }
                self.roots.work_queue_remove(ns);
            }
            ApplyStep::StallDirty { refs, drained } => {
                self.complete_waiters(drained, None);
                let wait = self.waits.create(ResumeAction::Apply(ns.to_string()), None);
                for blobref in &refs {
                    let dirty = self
                        .cache
                        .peek(blobref)
                        .map(|entry| entry.is_dirty())
                        .unwrap_or(false);
                    if !dirty {
                        continue;
                    }
                    self.cache.wait_notdirty(blobref, wait);
                    self.waits.incref(wait);
                    self.store_ref(blobref);
                }
                if self.waits.usecount(wait) == 0 {
                    self.waits.abandon(wait);
                    self.resume(ResumeAction::Apply(ns.to_string()), None);
                    return;
                }
                self.roots.work_queue_remove(ns);
            }
            ApplyStep::Flush { drained } => {
                self.complete_waiters(drained, None);
                let content = self.content.clone();
                let tx = self.self_tx.clone();
                let namespace = ns.to_string();
                tokio::spawn(async move {
                    let ok = content.flush().await.is_ok();
                    let _ = tx.send(Msg::FlushDone { namespace, ok }).await;
                });
                self.roots.work_queue_remove(ns);
            }
            ApplyStep::Checkpoint { rootref, rootseq, drained } => {
                self.complete_waiters(drained, None);
                let checkpoint = self.checkpoint.clone();
                let tx = self.self_tx.clone();
                let namespace = ns.to_string();
                let timestamp = SystemTime::now()
                    .duration_since(UNIX_EPOCH)
                    .map(|d| d.as_secs_f64())
                    .unwrap_or(0.0);
                tokio::spawn(async move {
                    let ok = checkpoint
                        .put(Checkpoint { rootref, rootseq, timestamp })
                        .await
                        .is_ok();
                    let _ = tx.send(Msg::CheckpointDone { namespace, ok }).await;
                });
                self.roots.work_queue_remove(ns);
            }
            ApplyStep::Done {
                errnum,
                fallback,
                names,
                keys,
                newroot,
                no_publish,
                drained,
                cleanup_drained,
            } => {
                self.complete_waiters(drained, None);
                self.complete_waiters(cleanup_drained, errnum);
                self.finish_transaction(ns, errnum, fallback, names, keys, newroot, no_publish);
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn finish_transaction(
        &mut self,
        ns: &str,
        errnum: Option<KvsError>,
        fallback: bool,
        names: Vec<String>,
        keys: Vec<String>,
        newroot: Option<Blobref>,
        no_publish: bool,
    ) {
        let now = self.now_secs();
        {
            let root = self.roots.lookup_mut(ns).expect("apply ran on this root");
            root.txn_mgr.remove_transaction(fallback && errnum.is_some());
        }

        match errnum {
            None => {
                if names.len() > 1 {
                    debug!(count = names.len(), "aggregated transactions");
                }
                if !no_publish {
                    let newroot = newroot.expect("finished transactions carry a new root");
                    let (rootseq, owner, fired) = {
                        let root = self.roots.lookup_mut(ns).expect("apply ran on this root");
                        let rootseq = root.seq + 1;
                        root.setroot(&newroot, rootseq);
                        root.last_update_secs = now;
                        (rootseq, root.owner, root.wait_version_drain(false))
                    };
                    for waiter in fired {
                        let _ = waiter
                            .reply
                            .send(Ok(RootReply { rootref: newroot.clone(), rootseq }));
                    }
                    for name in &names {
                        self.finalize_transaction(ns, name, None);
                    }
                    self.publish(KvsEvent::Setroot {
                        namespace: ns.to_string(),
                        rootseq,
                        rootref: newroot,
                        names,
                        keys,
                        owner,
                        from_rank: self.rank,
                    });
                } else {
                    for name in &names {
                        self.finalize_transaction(ns, name, None);
                    }
                }
            }
            Some(errnum) if !fallback => {
                self.error_event_send(ns, names, errnum);
            }
            Some(_) => {
                // fallback: components were reinserted at the head; the
                // individual retries produce the client-visible outcomes
            }
        }

        let root = self.roots.lookup_mut(ns).expect("apply ran on this root");
        if root.txn_mgr.transaction_ready() {
            self.roots.work_queue_append(ns);
        } else {
            self.roots.work_queue_remove(ns);
        }
    }

    /// Publish an error event and finalize the named transactions locally.
    fn error_event_send(&mut self, ns: &str, names: Vec<String>, errnum: KvsError) {
        for name in &names {
            self.finalize_transaction(ns, name, Some(errnum));
        }
        self.publish(KvsEvent::Error {
            namespace: ns.to_string(),
            names,
            errnum,
            from_rank: self.rank,
        });
    }

    fn handle_flush_done(&mut self, ns: &str, ok: bool) {
        if let Some(root) = self.roots.lookup_mut(ns) {
            if let Some(txn) = root.txn_mgr.ready_transaction() {
                if ok {
                    txn.sync_content_flushed();
                } else {
                    txn.set_aux_errnum(KvsError::NoSys);
                }
                txn.blocked = false;
            }
        }
        self.kvstxn_apply(ns);
    }

    fn handle_checkpoint_done(&mut self, ns: &str, ok: bool) {
        if let Some(root) = self.roots.lookup_mut(ns) {
            if let Some(txn) = root.txn_mgr.ready_transaction() {
                if ok {
                    txn.sync_checkpointed();
                } else {
                    txn.set_aux_errnum(KvsError::NoSys);
                }
                txn.blocked = false;
            }
        }
        self.kvstxn_apply(ns);
    }

    //─────────────────────────────
    //  Event consumption
    //─────────────────────────────

    fn handle_event(&mut self, event: KvsEvent) {
        match event {
            KvsEvent::Setroot { .. } => {
                let ns = event.namespace().to_string();
                let Some(root) = self.roots.lookup_mut(&ns) else {
                    return;
                };
                if root.setroot_pause {
                    root.setroot_queue.push_back(event);
                    return;
                }
                self.setroot_event_process(event);
            }
            KvsEvent::Error { namespace, names, errnum, .. } => {
                if self.roots.lookup(&namespace).is_none() {
                    return;
                }
                for name in names {
                    self.finalize_transaction(&namespace, &name, Some(errnum));
                }
            }
            KvsEvent::NamespaceRemoved { namespace, .. } => {
                if self.rank != 0 {
                    self.start_root_remove(&namespace);
                }
            }
            KvsEvent::NamespaceCreated { .. } => {}
        }
    }

    fn setroot_event_process(&mut self, event: KvsEvent) {
        let KvsEvent::Setroot { namespace, rootseq, rootref, names, .. } = event else {
            return;
        };
        let now = self.now_secs();
        let Some(root) = self.roots.lookup_mut(&namespace) else {
            return;
        };
        if root.remove {
            // late event on a draining namespace: the callers lose
            for name in names {
                self.finalize_transaction(&namespace, &name, Some(KvsError::NotSup));
            }
            return;
        }
        let fired = if root.setroot(&rootref, rootseq) {
            root.last_update_secs = now;
            root.wait_version_drain(false)
        } else {
            Vec::new()
        };
        for waiter in fired {
            let _ = waiter.reply.send(Ok(RootReply { rootref: rootref.clone(), rootseq }));
        }
        for name in names {
            self.finalize_transaction(&namespace, &name, None);
        }
    }

    fn drain_setroot_queue(&mut self, ns: &str) {
        loop {
            let Some(root) = self.roots.lookup_mut(ns) else {
                return;
            };
            let Some(event) = root.setroot_queue.pop_front() else {
                return;
            };
            self.setroot_event_process(event);
        }
    }

    //─────────────────────────────
    //  Heartbeat & checkpoint timers
    //─────────────────────────────

    fn heartbeat(&mut self) {
        self.epoch += 1;
        let now = self.now_secs();
        for ns in self.roots.namespaces() {
            let Some(root) = self.roots.lookup(&ns) else {
                continue;
            };
            let idle = root.wait_version_count() == 0
                && root.transaction_request_count() == 0
                && root.txn_mgr.ready_count() == 0;
            if root.remove {
                if idle {
                    debug!(%ns, "removing drained namespace");
                    self.roots.remove_root(&ns);
                }
            } else if self.rank != 0
                && !root.is_primary
                && idle
                && now - root.last_update_secs > self.config.max_namespace_age
            {
                debug!(%ns, "evicting idle follower namespace");
                self.start_root_remove(&ns);
            } else {
                let rootref = root.rootref.clone();
                self.cache.lookup(&rootref, self.epoch);
            }
        }
        self.cache.expire(self.epoch, self.config.max_lastuse_age);
    }

    /// Kick off a checkpoint: an internal empty transaction with sync
    /// semantics and no publication, so flushing and checkpointing ride
    /// the ordinary apply pipeline.
    fn checkpoint_kick(&mut self) {
        if self.rank != 0 {
            return;
        }
        let Some(root) = self.roots.lookup_safe_mut(PRIMARY_NAMESPACE) else {
            return;
        };
        let name = format!("checkpoint-{}", self.checkpoint_seq);
        self.checkpoint_seq += 1;
        if root
            .txn_mgr
            .add_transaction(&name, Vec::new(), COMMIT_SYNC, INT_NO_PUBLISH)
            .is_ok()
        {
            self.roots.work_queue_append(PRIMARY_NAMESPACE);
        }
    }

    //─────────────────────────────
    //  Disconnect & shutdown
    //─────────────────────────────

    fn handle_disconnect(&mut self, client: ClientId) {
        let removed = self.waits.remove_client(client);
        self.cache.purge_waiters(&removed);
        self.lookups.retain(|_, pending| pending.client != Some(client));
        for ns in self.roots.namespaces() {
            if let Some(root) = self.roots.lookup_mut(&ns) {
                root.wait_version_remove_client(client);
            }
        }
    }

    fn drain_pending(&mut self) {
        for (_, pending) in self.lookups.drain() {
            let _ = pending.resp.send(Err(KvsError::NoSys));
        }
        for ns in self.roots.namespaces() {
            let Some(root) = self.roots.lookup_mut(&ns) else {
                continue;
            };
            for waiter in root.wait_version_drain(true) {
                let _ = waiter.reply.send(Err(KvsError::NoSys));
            }
            let names: Vec<String> = root
                .unprocessed_request_names()
                .into_iter()
                .chain(root.txn_mgr.ready_transaction().map(|t| t.names().to_vec()).unwrap_or_default())
                .collect();
            for name in names {
                self.finalize_transaction(&ns, &name, Some(KvsError::NoSys));
            }
        }
    }
}

//─────────────────────────────
//  Guest authorization
//─────────────────────────────

/// A user-role commit may only write vals, empty dirs, or null entries.
fn guest_commit_authorize(ops: &[TxnOp]) -> Result<(), KvsError> {
    for op in ops {
        match &op.dirent {
            None | Some(TreeObj::Val(_)) => {}
            Some(TreeObj::Dir(entries)) if entries.is_empty() => {}
            Some(_) => return Err(KvsError::Perm),
        }
    }
    Ok(())
}

fn respond_err(msg: Msg, errnum: KvsError) {
    match msg {
        Msg::Lookup { resp, .. } => {
            let _ = resp.send(Err(errnum));
        }
        Msg::Commit { resp, .. } | Msg::Fence { resp, .. } | Msg::WaitVersion { resp, .. } => {
            let _ = resp.send(Err(errnum));
        }
        Msg::GetRoot { resp, .. } => {
            let _ = resp.send(Err(errnum));
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn guest_authorize_rules() {
        let algo = arbor_treeobj::HashAlgo::Sha1;
        let ok = vec![
            TxnOp::put("a", TreeObj::val(*b"1")),
            TxnOp::unlink("b"),
            TxnOp::put("c", TreeObj::empty_dir()),
        ];
        assert!(guest_commit_authorize(&ok).is_ok());

        for bad in [
            TxnOp::put("a", TreeObj::dirref(algo.hash(b"d"))),
            TxnOp::put("a", TreeObj::ValRef(vec![algo.hash(b"v")])),
            TxnOp::put("a", TreeObj::symlink(None, "b")),
        ] {
            assert_eq!(guest_commit_authorize(&[bad]).err(), Some(KvsError::Perm));
        }

        let mut entries = std::collections::BTreeMap::new();
        entries.insert("x".to_string(), TreeObj::val(*b"1"));
        let nonempty = TxnOp::put("a", TreeObj::Dir(entries));
        assert_eq!(guest_commit_authorize(&[nonempty]).err(), Some(KvsError::Perm));
    }
}
