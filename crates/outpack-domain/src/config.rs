//! Repository configuration (`.outpack/config.json`) and typed location
//! arguments.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use url::Url;

use crate::error::OutpackError;
use crate::hash::HashAlgorithm;

pub const CONFIG_SCHEMA_VERSION: &str = "0.1.1";
pub const LOCATION_LOCAL: &str = "local";
pub const LOCATION_ORPHAN: &str = "orphan";
pub const LOCATION_RESERVED: &[&str] = &[LOCATION_LOCAL, LOCATION_ORPHAN];

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Config {
    pub schema_version: String,
    pub core: CoreConfig,
    pub location: Vec<Location>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoreConfig {
    pub path_archive: Option<String>,
    pub use_file_store: bool,
    pub require_complete_tree: bool,
    #[serde(default)]
    pub hash_algorithm: HashAlgorithm,
}

impl Config {
    /// A fresh configuration with only the `local` location.
    pub fn new(core: CoreConfig) -> Result<Self, OutpackError> {
        let config = Self {
            schema_version: CONFIG_SCHEMA_VERSION.to_string(),
            core,
            location: vec![Location {
                name: LOCATION_LOCAL.to_string(),
                kind: LocationKind::Local,
            }],
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), OutpackError> {
        if self.core.path_archive.is_none() && !self.core.use_file_store {
            return Err(OutpackError::InvalidConfig(
                "at least one of 'path_archive' or 'use_file_store' must be enabled".to_string(),
            ));
        }
        if let Some(archive) = &self.core.path_archive {
            if archive.is_empty() {
                return Err(OutpackError::InvalidConfig(
                    "'path_archive' must not be empty".to_string(),
                ));
            }
        }
        let mut names = std::collections::BTreeSet::new();
        for location in &self.location {
            if !names.insert(location.name.as_str()) {
                return Err(OutpackError::InvalidConfig(format!(
                    "location '{}' is configured twice",
                    location.name
                )));
            }
        }
        Ok(())
    }

    #[must_use]
    pub fn location(&self, name: &str) -> Option<&Location> {
        self.location.iter().find(|location| location.name == name)
    }

    /// Names of every configured location, in configuration order.
    #[must_use]
    pub fn location_names(&self) -> Vec<String> {
        self.location.iter().map(|l| l.name.clone()).collect()
    }
}

/// A named source of packets.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawLocation", into = "RawLocation")]
pub struct Location {
    pub name: String,
    pub kind: LocationKind,
}

impl Location {
    pub fn new(name: impl Into<String>, kind: LocationKind) -> Result<Self, OutpackError> {
        let name = name.into();
        validate_location_name(&name)?;
        kind.validate(&name)?;
        Ok(Self { name, kind })
    }
}

/// Location names become directory names under `.outpack/location`.
pub fn validate_location_name(name: &str) -> Result<(), OutpackError> {
    let reason = if name.is_empty() {
        "name must not be empty"
    } else if name == "." || name == ".." {
        "name must not be '.' or '..'"
    } else if name.contains(['/', '\\']) {
        "name must not contain a path separator"
    } else if name.chars().any(char::is_control) {
        "name must not contain control characters"
    } else {
        return Ok(());
    };
    Err(OutpackError::InvalidLocation {
        name: name.to_string(),
        reason: reason.to_string(),
    })
}

/// The closed set of location types, each with its own arguments.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LocationKind {
    Local,
    Path(PathArgs),
    Ssh(SshArgs),
    Http(HttpArgs),
    Packit(PackitArgs),
}

impl LocationKind {
    #[must_use]
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Local => "local",
            Self::Path(_) => "path",
            Self::Ssh(_) => "ssh",
            Self::Http(_) => "http",
            Self::Packit(_) => "packit",
        }
    }

    fn validate(&self, name: &str) -> Result<(), OutpackError> {
        let invalid = |reason: String| OutpackError::InvalidLocation {
            name: name.to_string(),
            reason,
        };
        match self {
            Self::Local => Ok(()),
            Self::Path(args) => {
                if args.path.is_empty() {
                    Err(invalid("'path' must not be empty".to_string()))
                } else {
                    Ok(())
                }
            }
            Self::Ssh(args) => SshTarget::parse(&args.url).map(|_| ()).map_err(invalid),
            Self::Http(args) => parse_http_url(&args.url).map(|_| ()).map_err(invalid),
            Self::Packit(args) => parse_http_url(&args.url).map(|_| ()).map_err(invalid),
        }
    }
}

impl fmt::Display for LocationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.type_name())
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PathArgs {
    pub path: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SshArgs {
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub known_hosts: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HttpArgs {
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PackitArgs {
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
}

/// Parsed `ssh://[user@]host[:port]/path` target.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SshTarget {
    pub user: Option<String>,
    pub host: String,
    pub port: u16,
    /// Relative to the remote home directory unless absolute.
    pub path: String,
}

impl SshTarget {
    pub fn parse(url: &str) -> Result<Self, String> {
        let parsed = Url::parse(url).map_err(|err| format!("invalid url '{url}': {err}"))?;
        if parsed.scheme() != "ssh" {
            return Err(format!("url '{url}' must use the ssh:// scheme"));
        }
        let host = parsed
            .host_str()
            .filter(|host| !host.is_empty())
            .ok_or_else(|| format!("url '{url}' has no host"))?
            .to_string();
        let user = Some(parsed.username())
            .filter(|user| !user.is_empty())
            .map(str::to_string);
        let raw_path = parsed.path();
        let path = match raw_path.strip_prefix("//") {
            Some(absolute) => format!("/{absolute}"),
            None => raw_path.trim_start_matches('/').to_string(),
        };
        if path.is_empty() || path == "/" {
            return Err(format!("url '{url}' has no path"));
        }
        Ok(Self {
            user,
            host,
            port: parsed.port().unwrap_or(22),
            path,
        })
    }
}

fn parse_http_url(url: &str) -> Result<Url, String> {
    let parsed = Url::parse(url).map_err(|err| format!("invalid url '{url}': {err}"))?;
    match parsed.scheme() {
        "http" | "https" => Ok(parsed),
        other => Err(format!("url '{url}' has unsupported scheme '{other}'")),
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
struct RawLocation {
    name: String,
    #[serde(rename = "type")]
    location_type: String,
    #[serde(default)]
    args: Map<String, Value>,
}

impl TryFrom<RawLocation> for Location {
    type Error = OutpackError;

    fn try_from(raw: RawLocation) -> Result<Self, Self::Error> {
        fn args<T: serde::de::DeserializeOwned>(
            name: &str,
            args: Map<String, Value>,
        ) -> Result<T, OutpackError> {
            serde_json::from_value(Value::Object(args)).map_err(|err| {
                OutpackError::InvalidLocation {
                    name: name.to_string(),
                    reason: err.to_string(),
                }
            })
        }
        let name = raw.name;
        let kind = match raw.location_type.as_str() {
            "local" => LocationKind::Local,
            "path" => LocationKind::Path(args(&name, raw.args)?),
            "ssh" => LocationKind::Ssh(args(&name, raw.args)?),
            "http" => LocationKind::Http(args(&name, raw.args)?),
            "packit" => LocationKind::Packit(args(&name, raw.args)?),
            other => {
                return Err(OutpackError::InvalidLocation {
                    name,
                    reason: format!("unknown location type '{other}'"),
                })
            }
        };
        Location::new(name, kind)
    }
}

impl From<Location> for RawLocation {
    fn from(location: Location) -> Self {
        let location_type = location.kind.type_name().to_string();
        let args = match &location.kind {
            LocationKind::Local => Ok(Value::Object(Map::new())),
            LocationKind::Path(args) => serde_json::to_value(args),
            LocationKind::Ssh(args) => serde_json::to_value(args),
            LocationKind::Http(args) => serde_json::to_value(args),
            LocationKind::Packit(args) => serde_json::to_value(args),
        };
        let args = match args {
            Ok(Value::Object(map)) => map,
            _ => Map::new(),
        };
        Self {
            name: location.name,
            location_type,
            args,
        }
    }
}
