//! Blobref digests and hash parameterization.

use std::fmt;

use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};

use arbor_types::KvsError;

/// Hash algorithm used to derive blobrefs from canonical encodings.
///
/// The algorithm is an instance-wide parameter; all blobrefs minted by one
/// instance share it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HashAlgo {
    /// SHA-1, the default (`sha1-` prefix).
    Sha1,
    /// BLAKE3 (`blake3-` prefix).
    Blake3,
}

impl Default for HashAlgo {
    fn default() -> Self {
        HashAlgo::Sha1
    }
}

impl HashAlgo {
    /// Prefix name used in the string form of a blobref.
    pub fn name(&self) -> &'static str {
        match self {
            HashAlgo::Sha1 => "sha1",
            HashAlgo::Blake3 => "blake3",
        }
    }

    /// Digest width in bytes.
    pub fn digest_len(&self) -> usize {
        match self {
            HashAlgo::Sha1 => 20,
            HashAlgo::Blake3 => 32,
        }
    }

    /// Look up an algorithm by its prefix name.
    pub fn from_name(name: &str) -> Result<Self, KvsError> {
        match name {
            "sha1" => Ok(HashAlgo::Sha1),
            "blake3" => Ok(HashAlgo::Blake3),
            _ => Err(KvsError::Invalid),
        }
    }

    /// Hash raw bytes into a blobref.
    pub fn hash(&self, data: &[u8]) -> Blobref {
        let digest = match self {
            HashAlgo::Sha1 => {
                let mut hasher = Sha1::new();
                hasher.update(data);
                hex::encode(hasher.finalize())
            }
            HashAlgo::Blake3 => blake3::hash(data).to_hex().to_string(),
        };
        Blobref(format!("{}-{}", self.name(), digest))
    }
}

//─────────────────────────────
//  Blobref
//─────────────────────────────

/// A fixed-width string digest naming an immutable byte blob.
///
/// String form is `<algo>-<hex digest>`. Equality of blobrefs implies
/// equality of content.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Blobref(pub(crate) String);

impl Blobref {
    /// Parse and validate a blobref string.
    pub fn parse(s: &str) -> Result<Self, KvsError> {
        let blobref = Blobref(s.to_string());
        blobref.validate()?;
        Ok(blobref)
    }

    /// Check the `<algo>-<hex>` shape without allocating.
    pub fn validate(&self) -> Result<(), KvsError> {
        let (name, digest) = self.0.split_once('-').ok_or(KvsError::Proto)?;
        let algo = HashAlgo::from_name(name).map_err(|_| KvsError::Proto)?;
        if digest.len() != algo.digest_len() * 2
            || !digest.bytes().all(|b| b.is_ascii_hexdigit())
        {
            return Err(KvsError::Proto);
        }
        Ok(())
    }

    /// Algorithm this blobref was minted with.
    pub fn algo(&self) -> Result<HashAlgo, KvsError> {
        let (name, _) = self.0.split_once('-').ok_or(KvsError::Proto)?;
        HashAlgo::from_name(name).map_err(|_| KvsError::Proto)
    }

    /// String form.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Blobref {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_is_deterministic() {
        let a = HashAlgo::Sha1.hash(b"abc");
        let b = HashAlgo::Sha1.hash(b"abc");
        assert_eq!(a, b);
        assert!(a.as_str().starts_with("sha1-"));
        assert_eq!(a.as_str().len(), "sha1-".len() + 40);
    }

    #[test]
    fn known_sha1_vector() {
        // sha1("abc")
        let r = HashAlgo::Sha1.hash(b"abc");
        assert_eq!(r.as_str(), "sha1-a9993e364706816aba3e25717850c26c9cd0d89d");
    }

    #[test]
    fn parse_rejects_malformed() {
        assert!(Blobref::parse("sha1-").is_err());
        assert!(Blobref::parse("nohyphen").is_err());
        assert!(Blobref::parse("md5-aabbccdd").is_err());
        assert!(Blobref::parse("sha1-zz93e364706816aba3e25717850c26c9cd0d89d0").is_err());
        assert!(Blobref::parse(HashAlgo::Blake3.hash(b"x").as_str()).is_ok());
    }
}
