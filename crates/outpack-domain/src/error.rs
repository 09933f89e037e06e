//! Error taxonomy shared by every outpack layer.
//!
//! Operations return `anyhow::Result`; the typed kinds below are attached at
//! the point of failure and can be recovered with
//! `err.downcast_ref::<OutpackError>()`.

use std::path::PathBuf;

use crate::hash::Hash;

pub mod codes {
    pub const MALFORMED_HASH: &str = "OP101";
    pub const UNSUPPORTED_ALGORITHM: &str = "OP102";
    pub const MALFORMED_ID: &str = "OP103";
    pub const HASH_MISMATCH: &str = "OP110";
    pub const HASH_NOT_FOUND: &str = "OP201";
    pub const ALREADY_EXISTS: &str = "OP202";
    pub const FILE_NOT_FOUND: &str = "OP203";
    pub const UNKNOWN_PACKET: &str = "OP301";
    pub const PACKET_EXISTS: &str = "OP302";
    pub const INVALID_METADATA: &str = "OP303";
    pub const NO_REPOSITORY: &str = "OP310";
    pub const INVALID_CONFIG: &str = "OP311";
    pub const IMMUTABLE_FILE: &str = "OP401";
    pub const ALREADY_FINALIZED: &str = "OP402";
    pub const INVALID_QUERY: &str = "OP501";
    pub const QUERY_CARDINALITY: &str = "OP502";
    pub const NOT_IMPLEMENTED: &str = "OP503";
    pub const LOCATION: &str = "OP601";
    pub const CONFLICTING_METADATA: &str = "OP602";
    pub const PACKETS_NOT_FOUND: &str = "OP603";
    pub const INCOMPLETE_TREE: &str = "OP604";
    pub const CANNOT_PUSH: &str = "OP605";
    pub const TRANSPORT: &str = "OP610";
}

/// Every failure kind surfaced by outpack operations.
#[derive(Debug, thiserror::Error, Clone, PartialEq)]
pub enum OutpackError {
    #[error("[OP101] malformed hash '{0}': expected 'algorithm:value'")]
    MalformedHash(String),
    #[error("[OP102] unsupported hash algorithm '{0}'")]
    UnsupportedAlgorithm(String),
    #[error("[OP103] malformed packet id '{0}'")]
    MalformedId(String),
    #[error("[OP110] hash of {context} does not match!\n - expected: {expected}\n - found:    {found}")]
    HashMismatch {
        context: String,
        expected: Hash,
        found: Hash,
    },

    #[error("[OP201] hash '{0}' not found in store")]
    HashNotFound(Hash),
    #[error("[OP202] refusing to overwrite existing file '{}'", .0.display())]
    AlreadyExists(PathBuf),
    #[error("[OP203] unable to copy file '{path}' from packet '{packet}': no valid copy found")]
    FileNotFound { packet: String, path: String },

    #[error("[OP301] unknown packet '{0}'")]
    UnknownPacket(String),
    #[error("[OP302] packet '{0}' has already been imported")]
    PacketExists(String),
    #[error("[OP303] invalid metadata for packet '{id}': {reason}")]
    InvalidMetadata { id: String, reason: String },
    #[error("[OP310] no outpack repository found at or above '{}'", .0.display())]
    NoRepositoryFound(PathBuf),
    #[error("[OP311] invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("[OP401] file '{0}' was modified after being marked immutable")]
    ImmutableFileModified(String),
    #[error("[OP401] file '{0}' was deleted after being marked immutable")]
    ImmutableFileDeleted(String),
    #[error("[OP402] packet '{0}' has already been finalized")]
    AlreadyFinalized(String),

    #[error("[OP501] invalid query '{query}': {reason}")]
    InvalidQuery { query: String, reason: String },
    #[error("[OP502] query '{query}' returned {count} packets but exactly one was required")]
    AmbiguousResult { query: String, count: usize },
    #[error("[OP502] query '{0}' is not guaranteed to return a single packet; wrap it in latest() or single()")]
    NotSingleValued(String),
    #[error("[OP502] query '{0}' did not match any packet")]
    NoMatch(String),
    #[error("[OP503] not implemented: {0}")]
    NotImplemented(String),

    #[error("[OP601] unknown location '{0}'")]
    UnknownLocation(String),
    #[error("[OP601] a location named '{0}' already exists")]
    LocationExists(String),
    #[error("[OP601] '{0}' is a reserved location name")]
    ReservedLocation(String),
    #[error("[OP601] invalid arguments for location '{name}': {reason}")]
    InvalidLocation { name: String, reason: String },
    #[error("[OP601] remote access is disabled; set allow_remote to pull packets")]
    RemoteAccessDisabled,
    #[error("[OP602] location '{location}' reports different metadata for {} already-known packet(s): {}", .packets.len(), .packets.join(", "))]
    ConflictingMetadata {
        location: String,
        packets: Vec<String>,
        hint: String,
    },
    #[error("[OP603] failed to find packet(s) at any searched location: {}", .ids.join(", "))]
    PackagesNotFound { ids: Vec<String>, hint: String },
    #[error("[OP604] this repository requires a complete tree; non-recursive pulls are not allowed")]
    IncompleteTreeNotAllowed,
    #[error("[OP605] cannot push file '{path}' (hash {hash}) from packet '{packet}': not available locally")]
    CannotPush {
        packet: String,
        path: String,
        hash: Hash,
    },
    #[error("[OP610] transport error at location '{location}': {reason}")]
    Transport { location: String, reason: String },
    #[error("[OP610] transport '{0}' is not available in this build")]
    UnsupportedTransport(String),
}

impl OutpackError {
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::MalformedHash(_) => codes::MALFORMED_HASH,
            Self::UnsupportedAlgorithm(_) => codes::UNSUPPORTED_ALGORITHM,
            Self::MalformedId(_) => codes::MALFORMED_ID,
            Self::HashMismatch { .. } => codes::HASH_MISMATCH,
            Self::HashNotFound(_) => codes::HASH_NOT_FOUND,
            Self::AlreadyExists(_) => codes::ALREADY_EXISTS,
            Self::FileNotFound { .. } => codes::FILE_NOT_FOUND,
            Self::UnknownPacket(_) => codes::UNKNOWN_PACKET,
            Self::PacketExists(_) => codes::PACKET_EXISTS,
            Self::InvalidMetadata { .. } => codes::INVALID_METADATA,
            Self::NoRepositoryFound(_) => codes::NO_REPOSITORY,
            Self::InvalidConfig(_) => codes::INVALID_CONFIG,
            Self::ImmutableFileModified(_) | Self::ImmutableFileDeleted(_) => {
                codes::IMMUTABLE_FILE
            }
            Self::AlreadyFinalized(_) => codes::ALREADY_FINALIZED,
            Self::InvalidQuery { .. } => codes::INVALID_QUERY,
            Self::AmbiguousResult { .. } | Self::NotSingleValued(_) | Self::NoMatch(_) => {
                codes::QUERY_CARDINALITY
            }
            Self::NotImplemented(_) => codes::NOT_IMPLEMENTED,
            Self::UnknownLocation(_)
            | Self::LocationExists(_)
            | Self::ReservedLocation(_)
            | Self::InvalidLocation { .. }
            | Self::RemoteAccessDisabled => codes::LOCATION,
            Self::ConflictingMetadata { .. } => codes::CONFLICTING_METADATA,
            Self::PackagesNotFound { .. } => codes::PACKETS_NOT_FOUND,
            Self::IncompleteTreeNotAllowed => codes::INCOMPLETE_TREE,
            Self::CannotPush { .. } => codes::CANNOT_PUSH,
            Self::Transport { .. } | Self::UnsupportedTransport(_) => codes::TRANSPORT,
        }
    }

    /// Suggested remediation, for the kinds that have one.
    #[must_use]
    pub fn hint(&self) -> Option<String> {
        match self {
            Self::ConflictingMetadata { hint, .. } | Self::PackagesNotFound { hint, .. } => {
                Some(hint.clone())
            }
            Self::HashMismatch { .. } => Some(
                "the content was corrupted or modified; re-fetch it from a trusted source"
                    .to_string(),
            ),
            Self::IncompleteTreeNotAllowed => {
                Some("pull with recursive enabled to fetch all dependencies".to_string())
            }
            Self::NotSingleValued(_) => {
                Some("use latest(...) or single(...) to select one packet".to_string())
            }
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conflicting_metadata_carries_hint() {
        let err = OutpackError::ConflictingMetadata {
            location: "server".to_string(),
            packets: vec!["20240101-000000-00000000".to_string()],
            hint: "remove location 'server'".to_string(),
        };
        assert_eq!(err.code(), codes::CONFLICTING_METADATA);
        assert_eq!(err.hint().as_deref(), Some("remove location 'server'"));
        assert!(err.to_string().contains("1 already-known packet(s)"));
    }

    #[test]
    fn hash_mismatch_reports_both_values() -> anyhow::Result<()> {
        let err = OutpackError::HashMismatch {
            context: "file 'data.csv'".to_string(),
            expected: "sha256:aa".parse()?,
            found: "sha256:bb".parse()?,
        };
        let message = err.to_string();
        assert!(message.contains("expected: sha256:aa"));
        assert!(message.contains("found:    sha256:bb"));
        assert!(err.hint().is_some());
        Ok(())
    }
}
