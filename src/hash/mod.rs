//! Streaming, range-scoped, multi-algorithm hashing
//!
//! A single pass over a byte stream feeds every [`HashStrategy`] whose byte
//! range covers the current offset. Each strategy produces one [`Hash`].
//!
//! ```rust,ignore
//! use mediaferry::hash::{HashAlgorithm, HashEngine, HashStrategy};
//!
//! let strategies = [
//!     HashStrategy::whole(HashAlgorithm::Md5),
//!     HashStrategy::range(HashAlgorithm::Sha256, 0, 1_048_575)?,
//! ];
//! let hashes = HashEngine::default().digest(&mut reader, &strategies).await?;
//! ```

mod engine;
pub mod tree;

pub use engine::{HashEngine, HashingHandle, HashingReader, ReadTally, StreamHasher};
pub use tree::{TREE_HASH_CHUNK_SIZE, TreeHasher, tree_hash};

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use md5::Md5;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum HashError {
    #[error("unknown hash algorithm: {0}")]
    UnknownAlgorithm(String),

    #[error("invalid byte range: from {from} to {to}")]
    InvalidRange { from: u64, to: u64 },

    #[error("read failed after {position} bytes: {source}")]
    Read {
        position: u64,
        #[source]
        source: std::io::Error,
    },
}

pub type Result<T> = std::result::Result<T, HashError>;

/// Digest algorithms understood by the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "&'static str")]
pub enum HashAlgorithm {
    /// MD5, hex encoded
    Md5,
    /// MD5, base64 encoded (Content-MD5 header form)
    Md5Base64,
    /// SHA-256, hex encoded
    Sha256,
    /// Glacier SHA-256 tree-hash, hex encoded
    TreeHash,
}

impl HashAlgorithm {
    pub const fn as_str(&self) -> &'static str {
        match self {
            HashAlgorithm::Md5 => "MD5",
            HashAlgorithm::Md5Base64 => "MD5_BASE64",
            HashAlgorithm::Sha256 => "SHA256",
            HashAlgorithm::TreeHash => "TREE_HASH",
        }
    }
}

impl FromStr for HashAlgorithm {
    type Err = HashError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "MD5" => Ok(HashAlgorithm::Md5),
            "MD5_BASE64" => Ok(HashAlgorithm::Md5Base64),
            "SHA256" | "SHA-256" | "SHA_256" => Ok(HashAlgorithm::Sha256),
            "TREE_HASH" | "TREEHASH" => Ok(HashAlgorithm::TreeHash),
            _ => Err(HashError::UnknownAlgorithm(s.to_string())),
        }
    }
}

impl TryFrom<String> for HashAlgorithm {
    type Error = HashError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<HashAlgorithm> for &'static str {
    fn from(algorithm: HashAlgorithm) -> Self {
        algorithm.as_str()
    }
}

impl fmt::Display for HashAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A named-algorithm digest, optionally scoped to a byte range
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hash {
    pub hash_algorithm: HashAlgorithm,
    pub hash: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub offset: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub length: Option<u64>,
}

impl Hash {
    pub fn new(hash_algorithm: HashAlgorithm, hash: impl Into<String>) -> Self {
        Self {
            hash_algorithm,
            hash: hash.into(),
            offset: None,
            length: None,
        }
    }

    /// Same algorithm and value, ignoring range metadata. Hex values
    /// compare case-insensitively; base64 values exactly.
    pub fn matches(&self, other: &Hash) -> bool {
        if self.hash_algorithm != other.hash_algorithm {
            return false;
        }
        match self.hash_algorithm {
            HashAlgorithm::Md5Base64 => self.hash == other.hash,
            _ => self.hash.eq_ignore_ascii_case(&other.hash),
        }
    }
}

/// One digest to compute: an algorithm over a byte range of the stream.
///
/// `length == None` extends the range to end of stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HashStrategy {
    pub algorithm: HashAlgorithm,
    pub offset: u64,
    pub length: Option<u64>,
}

impl HashStrategy {
    /// Whole content
    pub fn whole(algorithm: HashAlgorithm) -> Self {
        Self {
            algorithm,
            offset: 0,
            length: None,
        }
    }

    /// Inclusive range `[from, to]`
    pub fn range(algorithm: HashAlgorithm, from: u64, to: u64) -> Result<Self> {
        if to < from {
            return Err(HashError::InvalidRange { from, to });
        }
        Ok(Self {
            algorithm,
            offset: from,
            length: Some(to - from + 1),
        })
    }

    /// Range given as offset and byte count; missing values default to the
    /// whole content. A zero length covers no bytes.
    pub fn span(algorithm: HashAlgorithm, offset: Option<u64>, length: Option<u64>) -> Self {
        Self {
            algorithm,
            offset: offset.unwrap_or(0),
            length,
        }
    }

    /// Exclusive end offset, `None` when unbounded
    pub(crate) fn end(&self) -> Option<u64> {
        self.length.map(|len| self.offset.saturating_add(len))
    }
}

/// Running digest for one algorithm
#[derive(Debug, Clone)]
pub(crate) enum Digester {
    Md5(Md5),
    Md5Base64(Md5),
    Sha256(Sha256),
    Tree(TreeHasher),
}

impl Digester {
    pub(crate) fn new(algorithm: HashAlgorithm) -> Self {
        match algorithm {
            HashAlgorithm::Md5 => Digester::Md5(Md5::new()),
            HashAlgorithm::Md5Base64 => Digester::Md5Base64(Md5::new()),
            HashAlgorithm::Sha256 => Digester::Sha256(Sha256::new()),
            HashAlgorithm::TreeHash => Digester::Tree(TreeHasher::new()),
        }
    }

    pub(crate) fn update(&mut self, data: &[u8]) {
        match self {
            Digester::Md5(h) | Digester::Md5Base64(h) => h.update(data),
            Digester::Sha256(h) => h.update(data),
            Digester::Tree(h) => h.update(data),
        }
    }

    pub(crate) fn finish(self) -> String {
        match self {
            Digester::Md5(h) => hex::encode(h.finalize()),
            Digester::Md5Base64(h) => BASE64.encode(h.finalize()),
            Digester::Sha256(h) => hex::encode(h.finalize()),
            Digester::Tree(h) => h.finish_hex(),
        }
    }
}

/// Digest an in-memory buffer with a single algorithm.
pub fn digest_bytes(algorithm: HashAlgorithm, data: &[u8]) -> String {
    let mut digester = Digester::new(algorithm);
    digester.update(data);
    digester.finish()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_algorithms() {
        assert_eq!("md5".parse::<HashAlgorithm>().unwrap(), HashAlgorithm::Md5);
        assert_eq!("SHA-256".parse::<HashAlgorithm>().unwrap(), HashAlgorithm::Sha256);
        assert_eq!("tree_hash".parse::<HashAlgorithm>().unwrap(), HashAlgorithm::TreeHash);
        assert!(matches!(
            "CRC32".parse::<HashAlgorithm>(),
            Err(HashError::UnknownAlgorithm(name)) if name == "CRC32"
        ));
    }

    #[test]
    fn test_known_vectors() {
        assert_eq!(
            digest_bytes(HashAlgorithm::Md5, b"abc"),
            "900150983cd24fb0d6963f7d28e17f72"
        );
        assert_eq!(
            digest_bytes(HashAlgorithm::Md5Base64, b""),
            "1B2M2Y8AsgTpgAmY7PhCfg=="
        );
        assert_eq!(
            digest_bytes(HashAlgorithm::Sha256, b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn test_hash_json_shape() {
        let hash = Hash {
            hash_algorithm: HashAlgorithm::Md5,
            hash: "abc".to_string(),
            offset: Some(0),
            length: None,
        };
        let json = serde_json::to_value(&hash).unwrap();
        assert_eq!(json["hash_algorithm"], "MD5");
        assert_eq!(json["offset"], 0);
        assert!(json.get("length").is_none());

        let err = serde_json::from_str::<Hash>(r#"{"hash_algorithm":"XXH","hash":"1"}"#);
        assert!(err.is_err());
    }

    #[test]
    fn test_strategy_ranges() {
        let full = HashStrategy::whole(HashAlgorithm::Md5);
        assert_eq!(full.end(), None);

        let ranged = HashStrategy::range(HashAlgorithm::Md5, 10, 19).unwrap();
        assert_eq!(ranged.end(), Some(20));

        let spanned = HashStrategy::span(HashAlgorithm::Md5, Some(10), Some(10));
        assert_eq!(spanned, ranged);

        let empty = HashStrategy::span(HashAlgorithm::Md5, Some(5), Some(0));
        assert_eq!(empty.end(), Some(5));

        assert!(HashStrategy::range(HashAlgorithm::Md5, 5, 4).is_err());
    }
}
