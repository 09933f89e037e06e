//! Content digests in `algorithm:hexvalue` form.

use std::{
    fmt,
    fs::File,
    io::Read,
    path::Path,
    str::FromStr,
};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256, Sha384, Sha512};

use crate::error::OutpackError;

const READ_BLOCK_SIZE: usize = 32 * 1024;

/// Digest algorithms outpack can compute.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HashAlgorithm {
    #[default]
    Sha256,
    Sha384,
    Sha512,
}

impl HashAlgorithm {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Sha256 => "sha256",
            Self::Sha384 => "sha384",
            Self::Sha512 => "sha512",
        }
    }
}

impl fmt::Display for HashAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for HashAlgorithm {
    type Err = OutpackError;

    fn from_str(value: &str) -> std::result::Result<Self, Self::Err> {
        match value {
            "sha256" => Ok(Self::Sha256),
            "sha384" => Ok(Self::Sha384),
            "sha512" => Ok(Self::Sha512),
            other => Err(OutpackError::UnsupportedAlgorithm(other.to_string())),
        }
    }
}

/// A digest tagged with the algorithm that produced it. Equality is exact on
/// both parts.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Hash {
    algorithm: String,
    value: String,
}

impl Hash {
    /// Build a hash from its parts; `value` is lower-cased hex.
    pub fn new(algorithm: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            algorithm: algorithm.into(),
            value: value.into(),
        }
    }

    #[must_use]
    pub fn algorithm(&self) -> &str {
        &self.algorithm
    }

    #[must_use]
    pub fn value(&self) -> &str {
        &self.value
    }

    /// The algorithm as a computable kind.
    pub fn algorithm_kind(&self) -> Result<HashAlgorithm, OutpackError> {
        self.algorithm.parse()
    }
}

impl fmt::Display for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.algorithm, self.value)
    }
}

impl FromStr for Hash {
    type Err = OutpackError;

    fn from_str(text: &str) -> std::result::Result<Self, Self::Err> {
        parse(text)
    }
}

impl TryFrom<String> for Hash {
    type Error = OutpackError;

    fn try_from(value: String) -> std::result::Result<Self, Self::Error> {
        parse(&value)
    }
}

impl From<Hash> for String {
    fn from(hash: Hash) -> Self {
        hash.to_string()
    }
}

/// Split `text` on its first `:` into algorithm and value.
pub fn parse(text: &str) -> Result<Hash, OutpackError> {
    match text.split_once(':') {
        Some((algorithm, value)) if !algorithm.is_empty() && !value.is_empty() => {
            Ok(Hash::new(algorithm, value))
        }
        _ => Err(OutpackError::MalformedHash(text.to_string())),
    }
}

#[must_use]
pub fn hash_bytes(algorithm: HashAlgorithm, data: &[u8]) -> Hash {
    let value = match algorithm {
        HashAlgorithm::Sha256 => hex::encode(Sha256::digest(data)),
        HashAlgorithm::Sha384 => hex::encode(Sha384::digest(data)),
        HashAlgorithm::Sha512 => hex::encode(Sha512::digest(data)),
    };
    Hash::new(algorithm.as_str(), value)
}

/// Hash a file on disk, reading it in fixed-size blocks.
pub fn hash_file(algorithm: HashAlgorithm, path: &Path) -> Result<Hash> {
    let file =
        File::open(path).with_context(|| format!("failed to open {} for hashing", path.display()))?;
    let value = match algorithm {
        HashAlgorithm::Sha256 => digest_reader::<Sha256>(file, path)?,
        HashAlgorithm::Sha384 => digest_reader::<Sha384>(file, path)?,
        HashAlgorithm::Sha512 => digest_reader::<Sha512>(file, path)?,
    };
    Ok(Hash::new(algorithm.as_str(), value))
}

fn digest_reader<D: Digest>(mut reader: impl Read, path: &Path) -> Result<String> {
    let mut hasher = D::new();
    let mut buf = [0u8; READ_BLOCK_SIZE];
    loop {
        let read = reader
            .read(&mut buf)
            .with_context(|| format!("failed to read {} for hashing", path.display()))?;
        if read == 0 {
            break;
        }
        hasher.update(&buf[..read]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Hash a file with the same algorithm as `expected` and check they agree.
pub fn validate_file(path: &Path, expected: &Hash, context: &str) -> Result<()> {
    let found = hash_file(expected.algorithm_kind()?, path)?;
    validate(&found, expected, context)?;
    Ok(())
}

pub fn validate(found: &Hash, expected: &Hash, context: &str) -> Result<(), OutpackError> {
    if found == expected {
        return Ok(());
    }
    Err(OutpackError::HashMismatch {
        context: context.to_string(),
        expected: expected.clone(),
        found: found.clone(),
    })
}
