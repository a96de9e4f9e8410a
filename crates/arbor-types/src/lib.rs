#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **arbor-types** – Shared primitive data structures for the Arbor KVS.
//!
//! The crate is dependency-light and sits at the very bottom of the crate
//! graph so that *every* other crate can depend on it without causing cycles.
//! It intentionally makes no assumptions about I/O, hashing, or storage.

use serde::{Deserialize, Serialize};

mod error;
mod key;

pub use error::KvsError;
pub use key::normalize_key;

//─────────────────────────────
//  Core identifiers
//─────────────────────────────

/// Name of the primary namespace, present on every rank for the lifetime of
/// the instance.
pub const PRIMARY_NAMESPACE: &str = "primary";

/// Numeric user identity attached to requests and namespace ownership.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(pub u32);

/// Identifies a connected client for waiter cleanup on disconnect.
///
/// The transport hands every connection a unique id; waiters registered on
/// behalf of that connection carry it so they can be torn down together.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClientId(pub u64);

//─────────────────────────────
//  Credentials
//─────────────────────────────

/// Role carried by a request credential.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Role {
    /// Instance owner; passes all namespace ownership checks.
    Owner,
    /// Ordinary user; must match the namespace owner's userid.
    User,
}

/// Request credential, reduced to the pair the engine actually consults.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cred {
    /// Role of the requesting client.
    pub role: Role,
    /// Userid of the requesting client.
    pub userid: UserId,
}

impl Cred {
    /// Credential for the instance owner.
    pub fn owner(userid: u32) -> Self {
        Self { role: Role::Owner, userid: UserId(userid) }
    }

    /// Credential for an ordinary user.
    pub fn user(userid: u32) -> Self {
        Self { role: Role::User, userid: UserId(userid) }
    }

    /// Authorize this credential against a resource owned by `owner`.
    ///
    /// Owner-role credentials always pass; user-role credentials pass only
    /// when the userid matches.
    pub fn authorize(&self, owner: UserId) -> Result<(), KvsError> {
        match self.role {
            Role::Owner => Ok(()),
            Role::User if self.userid == owner => Ok(()),
            Role::User => Err(KvsError::Perm),
        }
    }
}

//─────────────────────────────
//  Request flags
//─────────────────────────────

/// Lookup: return the directory object itself.
pub const LOOKUP_READDIR: u32 = 1;
/// Lookup: return the symlink object instead of following it.
pub const LOOKUP_READLINK: u32 = 2;
/// Lookup: return the final dirent unchanged, whatever its type.
pub const LOOKUP_TREEOBJ: u32 = 4;

/// Commit: never merge this transaction with its queue neighbors.
pub const COMMIT_NO_MERGE: u32 = 1;
/// Commit: flush content and checkpoint before completing (primary only).
pub const COMMIT_SYNC: u32 = 2;

/// Valid bits for commit/fence flags.
pub const COMMIT_FLAGS_MASK: u32 = COMMIT_NO_MERGE | COMMIT_SYNC;

/// Internal: do not publish a setroot event when the transaction finishes.
pub const INT_NO_PUBLISH: u32 = 1;

/// Operation: append to the existing value rather than replacing it.
pub const OP_APPEND: u32 = 1;

/// Maximum symlink hops before a lookup fails with [`KvsError::Loop`].
pub const SYMLINK_CYCLE_LIMIT: u32 = 10;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cred_authorize() {
        let owner = UserId(1000);
        assert!(Cred::owner(0).authorize(owner).is_ok());
        assert!(Cred::user(1000).authorize(owner).is_ok());
        assert_eq!(Cred::user(1001).authorize(owner), Err(KvsError::Perm));
    }
}
