//! RPC surface: request/reply shapes and the client handle.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc, oneshot};

use arbor_engine::KvsEvent;
use arbor_treeobj::{Blobref, TreeObj, TxnOp};
use arbor_types::{ClientId, Cred, KvsError, UserId};

pub(crate) type Resp<T> = oneshot::Sender<Result<T, KvsError>>;

//─────────────────────────────
//  Reply shapes
//─────────────────────────────

/// getroot reply.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RootInfo {
    /// Namespace name.
    pub namespace: String,
    /// Namespace owner.
    pub owner: UserId,
    /// Current snapshot sequence number.
    pub rootseq: u64,
    /// Current root blobref.
    pub rootref: Blobref,
    /// Namespace creation flags.
    pub flags: u32,
}

/// commit / fence / wait-version reply: the snapshot that satisfied the
/// request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RootReply {
    /// Root blobref.
    pub rootref: Blobref,
    /// Root sequence number.
    pub rootseq: u64,
}

/// lookup-plus reply: value or errno, plus the snapshot consulted.
#[derive(Debug, Clone, PartialEq)]
pub struct LookupPlusReply {
    /// The value, if the key exists.
    pub val: Option<TreeObj>,
    /// Set when `val` is absent (key not found).
    pub errnum: Option<KvsError>,
    /// Snapshot sequence the lookup ran against.
    pub rootseq: u64,
    /// Snapshot root the lookup ran against.
    pub rootref: Option<Blobref>,
}

/// One row of a namespace-list reply.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NamespaceInfo {
    /// Namespace name.
    pub namespace: String,
    /// Namespace owner.
    pub owner: UserId,
    /// Namespace creation flags.
    pub flags: u32,
}

/// Per-namespace counters in a stats reply.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StatsNamespace {
    /// Registered wait-version waiters.
    pub versionwaiters: usize,
    /// Stores skipped because the blob was already cached valid.
    pub noop_stores: u64,
    /// Pending transaction requests.
    pub transactions: usize,
    /// Transactions on the ready queue.
    pub readytransactions: usize,
    /// Current snapshot sequence number.
    pub store_revision: u64,
}

/// stats-get reply.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Stats {
    /// Cache entry count.
    pub cache_count: usize,
    /// Cache entries awaiting a load.
    pub cache_incomplete: usize,
    /// Cache entries awaiting a store.
    pub cache_dirty: usize,
    /// Total raw bytes cached.
    pub cache_bytes: usize,
    /// Content faults (load RPCs issued).
    pub faults: u64,
    /// Per-namespace counters.
    pub namespaces: BTreeMap<String, StatsNamespace>,
}

//─────────────────────────────
//  Request shapes
//─────────────────────────────

/// A lookup request.
#[derive(Debug, Clone)]
pub struct LookupRequest {
    /// Key to resolve.
    pub key: String,
    /// Namespace; `None` means the primary namespace.
    pub namespace: Option<String>,
    /// `LOOKUP_*` flags.
    pub flags: u32,
    /// Explicit root to read at, bypassing the namespace (and its security:
    /// possession of the ref pre-proves access).
    pub rootdir: Option<Blobref>,
    /// Sequence rider for `rootdir`, echoed in the reply.
    pub rootseq: Option<u64>,
    /// Request credential.
    pub cred: Cred,
    /// Connection identity, for disconnect cleanup.
    pub client: Option<ClientId>,
}

impl LookupRequest {
    /// Lookup `key` in the primary namespace with owner credentials.
    pub fn new(key: &str) -> Self {
        Self {
            key: key.to_string(),
            namespace: None,
            flags: 0,
            rootdir: None,
            rootseq: None,
            cred: Cred::owner(0),
            client: None,
        }
    }
}

/// A fence request (one participant's contribution).
#[derive(Debug, Clone)]
pub struct FenceRequest {
    /// Shared fence name.
    pub name: String,
    /// Total participant count.
    pub nprocs: u32,
    /// Namespace to commit into.
    pub namespace: String,
    /// `COMMIT_*` flags; must match across participants.
    pub flags: u32,
    /// This participant's operations.
    pub ops: Vec<TxnOp>,
    /// Request credential.
    pub cred: Cred,
    /// Connection identity, for disconnect cleanup.
    pub client: Option<ClientId>,
}

//─────────────────────────────
//  Reactor messages
//─────────────────────────────

pub(crate) enum Msg {
    Lookup { req: LookupRequest, resp: Resp<LookupPlusReply> },
    Commit {
        namespace: String,
        ops: Vec<TxnOp>,
        flags: u32,
        cred: Cred,
        client: Option<ClientId>,
        resp: Resp<RootReply>,
    },
    Fence { req: FenceRequest, resp: Resp<RootReply> },
    RelayCommit { namespace: String, name: String, ops: Vec<TxnOp>, flags: u32 },
    RelayFence {
        namespace: String,
        name: String,
        nprocs: u32,
        ops: Vec<TxnOp>,
        flags: u32,
    },
    GetRoot { namespace: String, cred: Cred, resp: Resp<RootInfo> },
    WaitVersion {
        namespace: String,
        rootseq: u64,
        cred: Cred,
        client: Option<ClientId>,
        resp: Resp<RootReply>,
    },
    NamespaceCreate {
        namespace: String,
        rootref: Option<Blobref>,
        owner: UserId,
        flags: u32,
        resp: Resp<()>,
    },
    NamespaceRemove { namespace: String, resp: Resp<()> },
    NamespaceList { resp: Resp<Vec<NamespaceInfo>> },
    Dropcache { resp: Resp<usize> },
    SetrootPause { namespace: String, resp: Resp<()> },
    SetrootUnpause { namespace: String, resp: Resp<()> },
    StatsGet { resp: Resp<Stats> },
    StatsClear { resp: Resp<()> },
    ConfigReload { checkpoint_period: Option<Duration>, resp: Resp<()> },
    Disconnect { client: ClientId },

    // completions of outbound work, delivered back to the reactor
    LoadDone { blobref: Blobref, result: Result<Option<Vec<u8>>, String> },
    StoreDone { blobref: Blobref, result: Result<Blobref, String> },
    FlushDone { namespace: String, ok: bool },
    CheckpointDone { namespace: String, ok: bool },
    GetRootDone { namespace: String, result: Result<RootInfo, KvsError> },
    Shutdown,
}

//─────────────────────────────
//  Client handle
//─────────────────────────────

/// Cheaply cloneable handle for talking to one runtime instance.
#[derive(Clone)]
pub struct KvsHandle {
    pub(crate) tx: mpsc::Sender<Msg>,
    pub(crate) bus: broadcast::Sender<KvsEvent>,
}

impl KvsHandle {
    async fn request<T>(
        &self,
        build: impl FnOnce(Resp<T>) -> Msg,
    ) -> Result<T, KvsError> {
        let (tx, rx) = oneshot::channel();
        self.tx.send(build(tx)).await.map_err(|_| KvsError::NoSys)?;
        rx.await.map_err(|_| KvsError::NoSys)?
    }

    /// Subscribe to the namespace event stream.
    pub fn subscribe(&self) -> broadcast::Receiver<KvsEvent> {
        self.bus.subscribe()
    }

    /// Resolve a key to its value. A missing key is [`KvsError::NotFound`].
    pub async fn lookup(&self, req: LookupRequest) -> Result<TreeObj, KvsError> {
        let reply = self.request(|resp| Msg::Lookup { req, resp }).await?;
        reply.val.ok_or_else(|| reply.errnum.unwrap_or(KvsError::NotFound))
    }

    /// Resolve a key, returning value-or-errno together with the snapshot
    /// consulted.
    pub async fn lookup_plus(&self, req: LookupRequest) -> Result<LookupPlusReply, KvsError> {
        self.request(|resp| Msg::Lookup { req, resp }).await
    }

    /// Commit a transaction; resolves once the namespace has advanced.
    pub async fn commit(
        &self,
        namespace: &str,
        ops: Vec<TxnOp>,
        flags: u32,
        cred: Cred,
    ) -> Result<RootReply, KvsError> {
        let namespace = namespace.to_string();
        self.request(|resp| Msg::Commit { namespace, ops, flags, cred, client: None, resp })
            .await
    }

    /// Contribute to an N-way fence; resolves when all participants have
    /// contributed and the combined transaction has been applied.
    pub async fn fence(&self, req: FenceRequest) -> Result<RootReply, KvsError> {
        self.request(|resp| Msg::Fence { req, resp }).await
    }

    /// Fetch a namespace's current root, bootstrapping it from upstream on
    /// follower ranks.
    pub async fn getroot(&self, namespace: &str, cred: Cred) -> Result<RootInfo, KvsError> {
        let namespace = namespace.to_string();
        self.request(|resp| Msg::GetRoot { namespace, cred, resp }).await
    }

    /// Resolve once the namespace reaches `rootseq`.
    pub async fn wait_version(
        &self,
        namespace: &str,
        rootseq: u64,
        cred: Cred,
        client: Option<ClientId>,
    ) -> Result<RootReply, KvsError> {
        let namespace = namespace.to_string();
        self.request(|resp| Msg::WaitVersion { namespace, rootseq, cred, client, resp })
            .await
    }

    /// Create a namespace (rank 0). `rootref` defaults to the empty
    /// directory.
    pub async fn namespace_create(
        &self,
        namespace: &str,
        rootref: Option<Blobref>,
        owner: UserId,
        flags: u32,
    ) -> Result<(), KvsError> {
        let namespace = namespace.to_string();
        self.request(|resp| Msg::NamespaceCreate { namespace, rootref, owner, flags, resp })
            .await
    }

    /// Remove a namespace (rank 0); quiet if absent.
    pub async fn namespace_remove(&self, namespace: &str) -> Result<(), KvsError> {
        let namespace = namespace.to_string();
        self.request(|resp| Msg::NamespaceRemove { namespace, resp }).await
    }

    /// List namespaces known to this rank.
    pub async fn namespace_list(&self) -> Result<Vec<NamespaceInfo>, KvsError> {
        self.request(|resp| Msg::NamespaceList { resp }).await
    }

    /// Expire every cache entry not in use; returns the count dropped.
    pub async fn dropcache(&self) -> Result<usize, KvsError> {
        self.request(|resp| Msg::Dropcache { resp }).await
    }

    /// Test hook: buffer setroot events for a namespace.
    pub async fn setroot_pause(&self, namespace: &str) -> Result<(), KvsError> {
        let namespace = namespace.to_string();
        self.request(|resp| Msg::SetrootPause { namespace, resp }).await
    }

    /// Test hook: drain buffered setroot events in FIFO order.
    pub async fn setroot_unpause(&self, namespace: &str) -> Result<(), KvsError> {
        let namespace = namespace.to_string();
        self.request(|resp| Msg::SetrootUnpause { namespace, resp }).await
    }

    /// Fetch cache and per-namespace counters.
    pub async fn stats_get(&self) -> Result<Stats, KvsError> {
        self.request(|resp| Msg::StatsGet { resp }).await
    }

    /// Reset counters.
    pub async fn stats_clear(&self) -> Result<(), KvsError> {
        self.request(|resp| Msg::StatsClear { resp }).await
    }

    /// Re-apply configuration (checkpoint period).
    pub async fn config_reload(
        &self,
        checkpoint_period: Option<Duration>,
    ) -> Result<(), KvsError> {
        self.request(|resp| Msg::ConfigReload { checkpoint_period, resp }).await
    }

    /// Tear down waiters registered on behalf of a disconnected client.
    pub async fn disconnect(&self, client: ClientId) {
        let _ = self.tx.send(Msg::Disconnect { client }).await;
    }

    pub(crate) async fn relay_commit(
        &self,
        namespace: String,
        name: String,
        ops: Vec<TxnOp>,
        flags: u32,
    ) {
        let _ = self.tx.send(Msg::RelayCommit { namespace, name, ops, flags }).await;
    }

    pub(crate) async fn relay_fence(
        &self,
        namespace: String,
        name: String,
        nprocs: u32,
        ops: Vec<TxnOp>,
        flags: u32,
    ) {
        let _ = self
            .tx
            .send(Msg::RelayFence { namespace, name, nprocs, ops, flags })
            .await;
    }
}
