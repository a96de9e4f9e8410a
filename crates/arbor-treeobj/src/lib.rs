#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **arbor-treeobj** – Tree-object model and canonical codec for Arbor.
//!
//! The store is a persistent tree of immutable objects addressed by the hash
//! of their canonical encoding. This crate defines the tagged [`TreeObj`]
//! variant, its canonical JSON form (stable key ordering, so structurally
//! equal objects encode to identical bytes), [`Blobref`] digests, and the
//! transaction operation type decoded from commit requests.

mod blobref;
mod codec;
mod op;

pub use blobref::{Blobref, HashAlgo};
pub use op::TxnOp;

use std::collections::BTreeMap;

use arbor_types::KvsError;

//─────────────────────────────
//  Tree-object variant
//─────────────────────────────

/// A node of the store: a tagged, content-addressable variant.
///
/// `Dir` entries use a sorted map so that iteration order (and therefore
/// the canonical encoding) is deterministic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TreeObj {
    /// Leaf holding an opaque byte string.
    Val(Vec<u8>),
    /// Leaf whose value is the concatenation of the named raw blobs.
    ValRef(Vec<Blobref>),
    /// Directory node carrying inline entries.
    Dir(BTreeMap<String, TreeObj>),
    /// Directory indirection; exactly one blobref naming a `Dir`.
    DirRef(Vec<Blobref>),
    /// Symbolic link, optionally crossing into another namespace.
    Symlink {
        /// Target namespace, when the link crosses namespaces.
        namespace: Option<String>,
        /// Target key within the (possibly foreign) namespace.
        target: String,
    },
}

impl TreeObj {
    /// Create an empty directory.
    pub fn empty_dir() -> Self {
        TreeObj::Dir(BTreeMap::new())
    }

    /// Create a `val` from bytes.
    pub fn val(data: impl Into<Vec<u8>>) -> Self {
        TreeObj::Val(data.into())
    }

    /// Create a `dirref` pointing at a single directory blob.
    pub fn dirref(blobref: Blobref) -> Self {
        TreeObj::DirRef(vec![blobref])
    }

    /// Create a `valref` over an ordered blobref sequence.
    pub fn valref(blobrefs: Vec<Blobref>) -> Self {
        TreeObj::ValRef(blobrefs)
    }

    /// Create a symlink, optionally qualified by a namespace.
    pub fn symlink(namespace: Option<&str>, target: &str) -> Self {
        TreeObj::Symlink {
            namespace: namespace.map(str::to_string),
            target: target.to_string(),
        }
    }

    /// RFC-style type name of this variant.
    pub fn type_name(&self) -> &'static str {
        match self {
            TreeObj::Val(_) => "val",
            TreeObj::ValRef(_) => "valref",
            TreeObj::Dir(_) => "dir",
            TreeObj::DirRef(_) => "dirref",
            TreeObj::Symlink { .. } => "symlink",
        }
    }

    /// True if this object is a directory.
    pub fn is_dir(&self) -> bool {
        matches!(self, TreeObj::Dir(_))
    }

    /// True if this object is a directory indirection.
    pub fn is_dirref(&self) -> bool {
        matches!(self, TreeObj::DirRef(_))
    }

    /// True if this object is an inline value.
    pub fn is_val(&self) -> bool {
        matches!(self, TreeObj::Val(_))
    }

    /// True if this object is a value indirection.
    pub fn is_valref(&self) -> bool {
        matches!(self, TreeObj::ValRef(_))
    }

    /// True if this object is a symlink.
    pub fn is_symlink(&self) -> bool {
        matches!(self, TreeObj::Symlink { .. })
    }

    /// Number of entries (dir) or blobrefs (dirref/valref); 0 otherwise.
    pub fn count(&self) -> usize {
        match self {
            TreeObj::Dir(entries) => entries.len(),
            TreeObj::DirRef(refs) | TreeObj::ValRef(refs) => refs.len(),
            _ => 0,
        }
    }

    /// Peek a named entry of a directory.
    ///
    /// Returns `Err(NotDir)` if `self` is not a `Dir`.
    pub fn entry(&self, name: &str) -> Result<Option<&TreeObj>, KvsError> {
        match self {
            TreeObj::Dir(entries) => Ok(entries.get(name)),
            _ => Err(KvsError::NotDir),
        }
    }

    /// Validate the shape of this object and everything below it.
    ///
    /// A `dirref` must carry exactly one blobref; a `valref` at least one;
    /// every blobref must parse; directory entry names must not contain the
    /// path separator.
    pub fn validate(&self) -> Result<(), KvsError> {
        match self {
            TreeObj::Val(_) => Ok(()),
            TreeObj::ValRef(refs) => {
                if refs.is_empty() {
                    return Err(KvsError::Proto);
                }
                refs.iter().try_for_each(Blobref::validate)
            }
            TreeObj::DirRef(refs) => {
                if refs.len() != 1 {
                    return Err(KvsError::Proto);
                }
                refs[0].validate()
            }
            TreeObj::Dir(entries) => {
                for (name, obj) in entries {
                    if name.is_empty() || name.contains('.') {
                        return Err(KvsError::Proto);
                    }
                    obj.validate()?;
                }
                Ok(())
            }
            TreeObj::Symlink { namespace, target } => {
                if target.is_empty() {
                    return Err(KvsError::Proto);
                }
                if let Some(ns) = namespace {
                    if ns.is_empty() {
                        return Err(KvsError::Proto);
                    }
                }
                Ok(())
            }
        }
    }

    /// Canonical encoding of this object.
    pub fn encode(&self) -> Vec<u8> {
        codec::encode(self)
    }

    /// Decode the canonical form, validating shape.
    pub fn decode(data: &[u8]) -> Result<TreeObj, KvsError> {
        let obj = codec::decode(data)?;
        obj.validate()?;
        Ok(obj)
    }

    /// Validate, encode, and hash: the blobref of this object together with
    /// its canonical bytes.
    pub fn hash(&self, algo: HashAlgo) -> Result<(Blobref, Vec<u8>), KvsError> {
        self.validate()?;
        let data = self.encode();
        let blobref = algo.hash(&data);
        Ok((blobref, data))
    }
}
