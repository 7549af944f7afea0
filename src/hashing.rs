//! Tools for hashing everything we care about into a unique [`ObjectId`]

use std::fmt;

use anyhow::{Context, Result, ensure};
use data_encoding::HEXLOWER;
use sha1::{Digest, Sha1};

/// The length of an [`ObjectId`] in bytes.
pub const ID_LEN: usize = 20;

/// The 20-byte hash used to identify all objects in our system.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct ObjectId {
    digest: [u8; ID_LEN],
}

/// The ID an index entry carries before anything was ever stored for it.
pub const EMPTY_ID: ObjectId = ObjectId {
    digest: [0; ID_LEN],
};

impl ObjectId {
    /// Calculates an ID from the given bytes
    pub fn hash(bytes: &[u8]) -> Self {
        Self {
            digest: Sha1::digest(bytes).into(),
        }
    }

    /// Calculates an ID from several byte slices, fed to the hash in order.
    pub fn hash_parts(parts: &[&[u8]]) -> Self {
        let mut hasher = Sha1::new();
        for p in parts {
            hasher.update(p);
        }
        Self {
            digest: hasher.finalize().into(),
        }
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        ensure!(
            bytes.len() == ID_LEN,
            "Expected a {ID_LEN}-byte object ID, got {} bytes",
            bytes.len()
        );
        let mut digest = [0; ID_LEN];
        digest.copy_from_slice(bytes);
        Ok(Self { digest })
    }

    pub fn as_bytes(&self) -> &[u8; ID_LEN] {
        &self.digest
    }

    pub fn is_empty(&self) -> bool {
        *self == EMPTY_ID
    }

    /// Gets a git-like shortened version of the hash that's unique enough
    /// for most UI uses.
    pub fn short_name(&self) -> String {
        let mut full = format!("{self}");
        let _rest = full.split_off(8);
        full
    }
}

impl fmt::Debug for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{ digest: {} }}", HEXLOWER.encode(&self.digest))
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", HEXLOWER.encode(&self.digest))
    }
}

impl std::str::FromStr for ObjectId {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = HEXLOWER
            .decode(s.to_ascii_lowercase().as_bytes())
            .with_context(|| format!("Couldn't decode {s} as hex"))?;
        Self::from_bytes(&bytes)
    }
}
