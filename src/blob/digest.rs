use std::fmt::{Display, Formatter};
use std::str::FromStr;

use anyhow::{anyhow, Error, Result};
use serde::de::Error as DeError;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

const SHA256_PREFIX: &str = "sha256:";
const SHA256_HEX_LEN: usize = 64;

/// A `sha256:<hex>` content digest.
///
/// The hash part is always 64 lowercase hex characters; equality and hashing
/// work on that normalized form.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DescriptorDigest {
    hash: String,
}

impl DescriptorDigest {
    /// Parses a full digest such as `sha256:abcd...`.
    pub fn from_digest(digest: &str) -> Result<DescriptorDigest> {
        let hash = digest
            .strip_prefix(SHA256_PREFIX)
            .ok_or_else(|| anyhow!("invalid digest '{}': only sha256 is supported", digest))?;
        Self::from_hash(hash).map_err(|_| anyhow!("invalid digest '{}'", digest))
    }

    /// Builds a digest from the bare 64 character hex hash.
    pub fn from_hash(hash: &str) -> Result<DescriptorDigest> {
        if !is_sha256_hex(hash) {
            return Err(anyhow!("invalid sha256 hash '{}'", hash));
        }
        Ok(DescriptorDigest { hash: hash.to_string() })
    }

    pub(crate) fn from_raw_hash(raw: &[u8]) -> DescriptorDigest {
        DescriptorDigest { hash: hex::encode(raw) }
    }

    pub fn hash(&self) -> &str {
        &self.hash
    }

    /// First 12 characters of the hash, used in log lines.
    pub fn short_hash(&self) -> &str {
        &self.hash[..12]
    }
}

fn is_sha256_hex(hash: &str) -> bool {
    hash.len() == SHA256_HEX_LEN && hash.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
}

impl Display for DescriptorDigest {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}{}", SHA256_PREFIX, self.hash)
    }
}

impl FromStr for DescriptorDigest {
    type Err = Error;

    fn from_str(digest: &str) -> Result<Self, Self::Err> {
        DescriptorDigest::from_digest(digest)
    }
}

impl Serialize for DescriptorDigest {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for DescriptorDigest {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        DescriptorDigest::from_digest(&raw).map_err(D::Error::custom)
    }
}

/// Size and digest of a blob. A size of `-1` means the size is unknown.
#[derive(Clone, Debug)]
pub struct BlobDescriptor {
    size: i64,
    digest: DescriptorDigest,
}

impl BlobDescriptor {
    pub fn new(size: i64, digest: DescriptorDigest) -> BlobDescriptor {
        BlobDescriptor { size, digest }
    }

    pub fn with_unknown_size(digest: DescriptorDigest) -> BlobDescriptor {
        BlobDescriptor { size: -1, digest }
    }

    pub fn size(&self) -> i64 {
        self.size
    }

    pub fn digest(&self) -> &DescriptorDigest {
        &self.digest
    }

    pub fn has_size(&self) -> bool {
        self.size >= 0
    }
}

/// Two descriptors are equal only when both sizes are known and match.
/// An unknown-size descriptor therefore never equals anything, itself included.
impl PartialEq for BlobDescriptor {
    fn eq(&self, other: &Self) -> bool {
        self.has_size() && other.has_size() && self.size == other.size && self.digest == other.digest
    }
}

impl Display for BlobDescriptor {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "digest: {}, size: {}", self.digest, self.size)
    }
}
