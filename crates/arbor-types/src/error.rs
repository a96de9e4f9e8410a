//! Crate-wide error taxonomy.
//!
//! Kinds, not payloads: the engine surfaces these unchanged to clients, so
//! variants must compare equal across a stall/replay boundary.

use serde::{Deserialize, Serialize};

/// Errors produced by the Arbor engine and surfaced over the RPC boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error, Serialize, Deserialize)]
pub enum KvsError {
    /// Malformed arguments, bad flags, or a root ref of the wrong type.
    #[error("invalid argument")]
    Invalid,
    /// Malformed operation or tree-object payload.
    #[error("protocol error")]
    Proto,
    /// Encoded form exceeds a fixed-size limit.
    #[error("value too large")]
    Overflow,
    /// Key not present. Only read APIs translate a null dirent into this.
    #[error("no such key")]
    NotFound,
    /// Namespace already exists (including one still draining).
    #[error("namespace exists")]
    Exists,
    /// Directory object where a value was required.
    #[error("is a directory")]
    IsDir,
    /// Non-directory object where a directory was required.
    #[error("not a directory")]
    NotDir,
    /// Symlink resolution exceeded the cycle limit.
    #[error("too many levels of symbolic links")]
    Loop,
    /// Credential check failed.
    #[error("permission denied")]
    Perm,
    /// Namespace draining, or operation unsupported on this rank.
    #[error("not supported")]
    NotSup,
    /// A loaded tree-object violates a shape invariant. Fatal to the
    /// request, not the process; always logged with detail.
    #[error("unrecoverable integrity error")]
    NotRecoverable,
    /// Internal sentinel returned while an operation is stalled.
    #[error("resource temporarily unavailable")]
    Again,
    /// Memory exhaustion reported by a collaborator.
    #[error("out of memory")]
    NoMem,
    /// Engine is shutting down; pending requests are drained with this.
    #[error("function not implemented")]
    NoSys,
}
