#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **arbor-engine** – The KVS engine core.
//!
//! Deterministic, synchronous state machines over the content cache:
//!
//! - [`Lookup`]: a stallable, resumable walker resolving a
//!   (namespace, root, key) triple to a value, following symlinks across
//!   namespaces and surfacing missing-ref sets on cache misses.
//! - [`Kvstxn`] / [`KvstxnMgr`]: transaction processing against a snapshot
//!   root via copy-on-write, with merge and fallback of the ready queue.
//! - [`Root`] / [`RootMgr`]: per-namespace snapshot state, version waiters,
//!   pending transaction requests, and the apply work queue.
//!
//! Nothing in this crate performs I/O: every suspension point returns
//! control to the caller (the reactor), which loads or flushes blobs and
//! resumes the state machine. That split keeps the engine deterministic
//! and testable without a running reactor.

mod events;
mod kvstxn;
mod lookup;
mod root;

pub use events::KvsEvent;
pub use kvstxn::{Kvstxn, KvstxnMgr, TxnProcess};
pub use lookup::{Lookup, LookupResult};
pub use root::{Root, RootMgr, TxnRequest, VersionWaiter};
