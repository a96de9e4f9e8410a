//! Transaction operations.

use serde::{Deserialize, Serialize};

use arbor_types::{normalize_key, KvsError, OP_APPEND};

use crate::TreeObj;

/// One mutation within a commit or fence: write, append, or unlink.
///
/// A `None` dirent unlinks the key. Operations arrive from untrusted
/// clients; [`TxnOp::validate`] gates them with `Proto` before the engine
/// looks at them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TxnOp {
    /// Key the operation applies to.
    pub key: String,
    /// Operation flags (`OP_APPEND`).
    pub flags: u32,
    /// Object to write, or `None` to unlink.
    pub dirent: Option<TreeObj>,
}

impl TxnOp {
    /// Write `dirent` at `key`.
    pub fn put(key: &str, dirent: TreeObj) -> Self {
        Self { key: key.to_string(), flags: 0, dirent: Some(dirent) }
    }

    /// Append the bytes of a `val` dirent to the value at `key`.
    pub fn append(key: &str, dirent: TreeObj) -> Self {
        Self { key: key.to_string(), flags: OP_APPEND, dirent: Some(dirent) }
    }

    /// Unlink `key`.
    pub fn unlink(key: &str) -> Self {
        Self { key: key.to_string(), flags: 0, dirent: None }
    }

    /// Check the decoded operation shape.
    pub fn validate(&self) -> Result<(), KvsError> {
        if self.key.is_empty() {
            return Err(KvsError::Proto);
        }
        if self.flags & !OP_APPEND != 0 {
            return Err(KvsError::Proto);
        }
        if let Some(dirent) = &self.dirent {
            dirent.validate()?;
        }
        Ok(())
    }

    /// Normalized form of the key.
    pub fn normalized_key(&self) -> String {
        normalize_key(&self.key).0
    }
}
