//! The packet descriptor written to the metadata ledger, plus location
//! records.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use anyhow::{Context, Result};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use time::OffsetDateTime;

use crate::error::OutpackError;
use crate::hash::{hash_bytes, Hash, HashAlgorithm};
use crate::id::validate_id;

pub const SCHEMA_VERSION: &str = "0.1.1";

/// Characters that are not allowed in a file name on at least one supported
/// platform.
const ILLEGAL_PATH_CHARS: &[char] = &['<', '>', ':', '"', '|', '?', '*', '\\'];
const RESERVED_NAMES: &[&str] = &[
    "CON", "PRN", "AUX", "NUL", "COM1", "COM2", "COM3", "COM4", "COM5", "COM6", "COM7", "COM8",
    "COM9", "LPT1", "LPT2", "LPT3", "LPT4", "LPT5", "LPT6", "LPT7", "LPT8", "LPT9",
];

/// A packet parameter value.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParameterValue {
    Bool(bool),
    Integer(i64),
    Float(f64),
    String(String),
}

impl ParameterValue {
    /// Numeric view used by ordering comparisons.
    #[must_use]
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Integer(value) => Some(*value as f64),
            Self::Float(value) => Some(*value),
            Self::Bool(_) | Self::String(_) => None,
        }
    }
}

impl fmt::Display for ParameterValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bool(value) => write!(f, "{value}"),
            Self::Integer(value) => write!(f, "{value}"),
            Self::Float(value) => write!(f, "{value}"),
            Self::String(value) => write!(f, "{value:?}"),
        }
    }
}

impl From<bool> for ParameterValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<i64> for ParameterValue {
    fn from(value: i64) -> Self {
        Self::Integer(value)
    }
}

impl From<f64> for ParameterValue {
    fn from(value: f64) -> Self {
        Self::Float(value)
    }
}

impl From<&str> for ParameterValue {
    fn from(value: &str) -> Self {
        Self::String(value.to_string())
    }
}

pub type Parameters = BTreeMap<String, ParameterValue>;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PacketFile {
    pub path: String,
    pub size: u64,
    pub hash: Hash,
}

/// One `here <- there` copy recorded against a dependency.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileMapping {
    pub here: String,
    pub there: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PacketDepends {
    pub packet: String,
    pub query: String,
    pub files: Vec<FileMapping>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GitInfo {
    pub sha: String,
    #[serde(default)]
    pub branch: Option<String>,
    #[serde(default)]
    pub url: Vec<String>,
}

/// Permanent description of a packet.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MetadataCore {
    pub schema_version: String,
    pub id: String,
    pub name: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub parameters: Parameters,
    pub time: BTreeMap<String, f64>,
    pub files: Vec<PacketFile>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub depends: Vec<PacketDepends>,
    #[serde(default)]
    pub git: Option<GitInfo>,
    #[serde(default)]
    pub custom: Option<BTreeMap<String, Value>>,
}

fn null_as_default<'de, D, T>(deserializer: D) -> std::result::Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

impl MetadataCore {
    pub fn from_json(text: &str) -> Result<Self> {
        serde_json::from_str(text).context("failed to parse packet metadata")
    }

    /// Canonical JSON encoding: keys sorted, no insignificant whitespace.
    pub fn to_canonical_json(&self) -> Result<String> {
        canonical_json(self)
    }

    /// Hash of the canonical encoding.
    pub fn content_hash(&self, algorithm: HashAlgorithm) -> Result<Hash> {
        Ok(hash_bytes(algorithm, self.to_canonical_json()?.as_bytes()))
    }

    #[must_use]
    pub fn file(&self, path: &str) -> Option<&PacketFile> {
        self.files.iter().find(|file| file.path == path)
    }

    /// Ids of the packets this one depends on, in recorded order.
    pub fn dependency_ids(&self) -> impl Iterator<Item = &str> {
        self.depends.iter().map(|dep| dep.packet.as_str())
    }

    /// Check the invariants that must hold before a packet is committed.
    pub fn validate(&self) -> Result<(), OutpackError> {
        let invalid = |reason: String| OutpackError::InvalidMetadata {
            id: self.id.clone(),
            reason,
        };
        validate_id(&self.id).map_err(|_| invalid("id is malformed".to_string()))?;
        if self.schema_version.is_empty() {
            return Err(invalid("schema_version is missing".to_string()));
        }
        validate_name(&self.name).map_err(invalid)?;
        for key in ["start", "end"] {
            if !self.time.contains_key(key) {
                return Err(invalid(format!("time.{key} is missing")));
            }
        }
        let mut seen = BTreeSet::new();
        for file in &self.files {
            validate_file_path(&file.path).map_err(invalid)?;
            if !seen.insert(file.path.as_str()) {
                return Err(invalid(format!("file '{}' is listed twice", file.path)));
            }
        }
        for dep in &self.depends {
            validate_id(&dep.packet)
                .map_err(|_| invalid(format!("dependency id '{}' is malformed", dep.packet)))?;
            for mapping in &dep.files {
                validate_file_path(&mapping.here).map_err(invalid)?;
            }
        }
        Ok(())
    }
}

/// Packet names become directory names in the archive.
pub fn validate_name(name: &str) -> Result<(), String> {
    if name.is_empty() {
        return Err("name is empty".to_string());
    }
    if name == "." || name == ".." || name.contains('/') {
        return Err(format!("name '{name}' is not a single path component"));
    }
    validate_component(name).map_err(|reason| format!("name '{name}' {reason}"))
}

/// Paths are relative, '/'-separated, and legal on every supported platform.
pub fn validate_file_path(path: &str) -> Result<(), String> {
    if path.is_empty() {
        return Err("file path is empty".to_string());
    }
    if path.starts_with('/') {
        return Err(format!("file path '{path}' must be relative"));
    }
    for component in path.split('/') {
        match component {
            "" => return Err(format!("file path '{path}' has an empty component")),
            "." | ".." => {
                return Err(format!(
                    "file path '{path}' must not contain '.' or '..' components"
                ))
            }
            _ => validate_component(component)
                .map_err(|reason| format!("file path '{path}' {reason}"))?,
        }
    }
    Ok(())
}

fn validate_component(component: &str) -> Result<(), String> {
    if let Some(ch) = component
        .chars()
        .find(|ch| ch.is_control() || ILLEGAL_PATH_CHARS.contains(ch))
    {
        return Err(format!("contains illegal character {ch:?}"));
    }
    if component.ends_with('.') || component.ends_with(' ') {
        return Err("must not end with '.' or a space".to_string());
    }
    let stem = component.split('.').next().unwrap_or(component);
    if RESERVED_NAMES
        .iter()
        .any(|reserved| reserved.eq_ignore_ascii_case(stem))
    {
        return Err(format!("uses reserved name '{stem}'"));
    }
    Ok(())
}

/// A location's claim to know a packet and its metadata hash.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PacketLocation {
    pub packet: String,
    pub time: f64,
    pub hash: Hash,
}

impl PacketLocation {
    #[must_use]
    pub fn now(packet: &str, hash: Hash) -> Self {
        Self {
            packet: packet.to_string(),
            time: unix_seconds(OffsetDateTime::now_utc()),
            hash,
        }
    }

    pub fn to_canonical_json(&self) -> Result<String> {
        canonical_json(self)
    }
}

/// Fractional seconds since the Unix epoch, the on-disk timestamp format.
#[must_use]
pub fn unix_seconds(time: OffsetDateTime) -> f64 {
    time.unix_timestamp_nanos() as f64 / 1e9
}

/// Serialize with sorted object keys and no whitespace.
pub fn canonical_json<T: Serialize>(value: &T) -> Result<String> {
    let mut value = serde_json::to_value(value).context("failed to encode canonical json")?;
    sort_json_value(&mut value);
    serde_json::to_string(&value).context("failed to encode canonical json")
}

fn sort_json_value(value: &mut Value) {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<_> = std::mem::take(map).into_iter().collect();
            entries.sort_by(|a, b| a.0.cmp(&b.0));
            for (_, v) in &mut entries {
                sort_json_value(v);
            }
            map.extend(entries);
        }
        Value::Array(items) => {
            for item in items {
                sort_json_value(item);
            }
        }
        _ => {}
    }
}
