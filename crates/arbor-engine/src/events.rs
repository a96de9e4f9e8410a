//! Namespace events.
//!
//! Rank 0 publishes these after each applied transaction (or failure);
//! followers consume them to advance their snapshots and finalize local
//! transaction records. Events carry the origin rank so a rank can skip
//! its own publications on a shared bus.

use serde::{Deserialize, Serialize};

use arbor_treeobj::Blobref;
use arbor_types::{KvsError, UserId};

/// Fan-out events for one namespace.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum KvsEvent {
    /// A transaction completed; the namespace has a new root.
    Setroot {
        /// Namespace the event applies to.
        namespace: String,
        /// New snapshot sequence number.
        rootseq: u64,
        /// New root blobref.
        rootref: Blobref,
        /// Names of the transactions folded into this snapshot.
        names: Vec<String>,
        /// Keys written by those transactions.
        keys: Vec<String>,
        /// Namespace owner, for followers creating the root on demand.
        owner: UserId,
        /// Rank that published the event.
        from_rank: u32,
    },
    /// The named transactions failed.
    Error {
        /// Namespace the event applies to.
        namespace: String,
        /// Names of the failed transactions.
        names: Vec<String>,
        /// Error to deliver to their callers.
        errnum: KvsError,
        /// Rank that published the event.
        from_rank: u32,
    },
    /// A namespace was created.
    NamespaceCreated {
        /// New namespace name.
        namespace: String,
        /// Its initial root blobref.
        rootref: Blobref,
        /// Its initial sequence number.
        rootseq: u64,
        /// Its owner.
        owner: UserId,
        /// Rank that published the event.
        from_rank: u32,
    },
    /// A namespace was removed.
    NamespaceRemoved {
        /// Removed namespace name.
        namespace: String,
        /// Rank that published the event.
        from_rank: u32,
    },
}

impl KvsEvent {
    /// Namespace this event applies to.
    pub fn namespace(&self) -> &str {
        match self {
            KvsEvent::Setroot { namespace, .. }
            | KvsEvent::Error { namespace, .. }
            | KvsEvent::NamespaceCreated { namespace, .. }
            | KvsEvent::NamespaceRemoved { namespace, .. } => namespace,
        }
    }

    /// Rank that published this event.
    pub fn from_rank(&self) -> u32 {
        match self {
            KvsEvent::Setroot { from_rank, .. }
            | KvsEvent::Error { from_rank, .. }
            | KvsEvent::NamespaceCreated { from_rank, .. }
            | KvsEvent::NamespaceRemoved { from_rank, .. } => *from_rank,
        }
    }
}
