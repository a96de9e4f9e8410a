#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **arbor-runtime** – The Arbor KVS runtime.
//!
//! One reactor task per rank owns every piece of mutable engine state: the
//! content cache, waiter registry, namespace roots, and in-flight lookups.
//! Requests arrive over an mpsc channel; outbound work (content store
//! loads/stores, flushes, checkpoints, upstream relays) runs in spawned
//! tasks whose completions are funneled back into the same channel. All
//! mutation therefore happens at reactor turns: the Rust rendition of a
//! single-threaded event loop.
//!
//! Rank 0 holds the authoritative ready queues and publishes
//! setroot/error/namespace events on a broadcast bus; follower ranks
//! consume those events to advance their snapshots, bootstrap unknown
//! namespaces with an upstream getroot, and relay commits and fences
//! upstream for application.

mod api;
mod config;
mod reactor;

pub use api::{
    FenceRequest, KvsHandle, LookupPlusReply, LookupRequest, NamespaceInfo, RootInfo,
    RootReply, Stats, StatsNamespace,
};
pub use config::KvsConfig;
pub use reactor::KvsRuntime;

pub use arbor_engine::KvsEvent;
