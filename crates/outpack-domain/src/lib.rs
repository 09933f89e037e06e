#![deny(clippy::all, warnings)]
#![allow(
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
    clippy::must_use_candidate,
    clippy::cast_precision_loss,
    clippy::module_name_repetitions
)]

//! Data model for outpack repositories: digests, packet ids, metadata,
//! configuration and the query language.

pub mod config;
pub mod error;
pub mod hash;
pub mod id;
pub mod metadata;
pub mod query;

pub use config::{
    Config, CoreConfig, HttpArgs, Location, LocationKind, PackitArgs, PathArgs, SshArgs,
    SshTarget, validate_location_name, LOCATION_LOCAL, LOCATION_ORPHAN, LOCATION_RESERVED,
};
pub use error::OutpackError;
pub use hash::{hash_bytes, hash_file, Hash, HashAlgorithm};
pub use id::{is_valid_id, new_id, validate_id};
pub use metadata::{
    canonical_json, unix_seconds, FileMapping, GitInfo, MetadataCore, PacketDepends,
    PacketFile, PacketLocation, ParameterValue, Parameters,
};
pub use query::{
    BooleanOperator, Literal, Lookup, Operand, Query, QueryNode, TestOperator,
};
