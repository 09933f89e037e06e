//! Building a packet in a working directory and committing it.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use outpack_domain::hash::hash_file;
use outpack_domain::metadata::{validate_file_path, SCHEMA_VERSION};
use outpack_domain::{
    canonical_json, new_id, unix_seconds, FileMapping, GitInfo, Hash, MetadataCore, OutpackError,
    PacketDepends, PacketFile, Parameters,
};
use serde_json::Value;
use time::OffsetDateTime;
use tracing::{debug, info};
use walkdir::WalkDir;

use crate::fs::write_atomic;
use crate::location::{build_pull_plan, pull_files, pull_packet};
use crate::root::Root;
use crate::search::{search_unique, SearchOptions};

/// Written into the working directory when a packet is finalized as failed.
pub const CANCELLED_METADATA_FILE: &str = "outpack.json";

/// Directories never collected into a packet.
const EXCLUDED_DIRS: &[&str] = &[".outpack", "__pycache__"];

/// A packet being assembled in `path`.
#[derive(Debug)]
pub struct Packet<'a> {
    root: &'a Root,
    id: String,
    name: String,
    parameters: Parameters,
    path: PathBuf,
    time_start: f64,
    depends: Vec<PacketDepends>,
    immutable: BTreeMap<String, Hash>,
    custom: BTreeMap<String, Value>,
    git: Option<GitInfo>,
    finalized: bool,
}

impl<'a> Packet<'a> {
    /// Begin a packet called `name` whose files are the contents of `path`.
    pub fn start(
        root: &'a Root,
        path: impl Into<PathBuf>,
        name: &str,
        parameters: Parameters,
    ) -> Result<Self> {
        outpack_domain::metadata::validate_name(name).map_err(|reason| {
            OutpackError::InvalidMetadata {
                id: String::new(),
                reason,
            }
        })?;
        let path = path.into();
        if !path.is_dir() {
            anyhow::bail!("packet source directory {} does not exist", path.display());
        }
        let id = new_id();
        debug!(packet = %id, name, "started packet");
        Ok(Self {
            root,
            id,
            name: name.to_string(),
            parameters,
            path,
            time_start: unix_seconds(OffsetDateTime::now_utc()),
            depends: Vec::new(),
            immutable: BTreeMap::new(),
            custom: BTreeMap::new(),
            git: None,
            finalized: false,
        })
    }

    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    #[must_use]
    pub fn parameters(&self) -> &Parameters {
        &self.parameters
    }

    /// Resolve `query` to one packet and copy files from it.
    ///
    /// `files` maps a destination path in this packet to a path in the
    /// upstream one. An upstream path ending in `/` copies everything under
    /// that directory. Copied files are sealed against modification.
    pub fn use_dependency(
        &mut self,
        query: &str,
        files: &[(&str, &str)],
        options: &SearchOptions,
    ) -> Result<String> {
        self.ensure_open()?;
        let id = search_unique(self.root, query, options, Some(&self.parameters))?;
        let complete = self.root.config().core.require_complete_tree;
        let mut unpacked = self.root.index().is_unpacked(&id)?;
        if !unpacked && complete {
            pull_packet(self.root, &[id.clone()], Some(true), options)?;
            unpacked = true;
        }

        let meta = self.root.index().metadata(&id)?;
        let mappings = expand_mappings(&meta, files)?;
        if unpacked {
            for mapping in &mappings {
                self.root
                    .export_file(&id, &mapping.there, &mapping.here, &self.path)?;
            }
        } else {
            let wanted: BTreeSet<Hash> = mappings
                .iter()
                .filter_map(|mapping| meta.file(&mapping.there))
                .map(|file| file.hash.clone())
                .collect();
            let plan = build_pull_plan(
                self.root,
                &[id.clone()],
                options.location.as_deref(),
                false,
                Some(&wanted),
            )?;
            let scoped = pull_files(self.root, &plan)?;
            for mapping in &mappings {
                let file = meta.file(&mapping.there).ok_or_else(|| OutpackError::FileNotFound {
                    packet: id.clone(),
                    path: mapping.there.clone(),
                })?;
                scoped
                    .store()
                    .get(&file.hash, &self.path.join(&mapping.here), true)?;
            }
        }
        for mapping in &mappings {
            self.mark_file_immutable(&mapping.here)?;
        }
        info!(packet = %self.id, dependency = %id, files = mappings.len(), "used dependency");
        self.depends.push(PacketDepends {
            packet: id.clone(),
            query: query.to_string(),
            files: mappings,
        });
        Ok(id)
    }

    /// Seal `path` on first call; later calls fail if it has changed.
    pub fn mark_file_immutable(&mut self, path: &str) -> Result<()> {
        let full = self.path.join(path);
        let hash = hash_file(self.root.hash_algorithm(), &full)
            .with_context(|| format!("failed to seal '{path}'"))?;
        match self.immutable.get(path) {
            Some(sealed) if *sealed != hash => {
                Err(OutpackError::ImmutableFileModified(path.to_string()).into())
            }
            Some(_) => Ok(()),
            None => {
                self.immutable.insert(path.to_string(), hash);
                Ok(())
            }
        }
    }

    pub fn add_custom(&mut self, key: &str, value: Value) -> Result<()> {
        if self.custom.contains_key(key) {
            return Err(OutpackError::InvalidMetadata {
                id: self.id.clone(),
                reason: format!("custom metadata '{key}' has already been added"),
            }
            .into());
        }
        self.custom.insert(key.to_string(), value);
        Ok(())
    }

    pub fn set_git(&mut self, git: GitInfo) {
        self.git = Some(git);
    }

    /// Hash the working directory, build the metadata and either commit the
    /// packet (`success`) or leave a cancelled marker behind.
    ///
    /// Can only be called once, whatever the outcome.
    pub fn finalize(&mut self, success: bool) -> Result<MetadataCore> {
        self.ensure_open()?;
        self.finalized = true;

        let files = self.collect_files()?;
        for (path, sealed) in &self.immutable {
            match files.iter().find(|file| &file.path == path) {
                None => return Err(OutpackError::ImmutableFileDeleted(path.clone()).into()),
                Some(file) if &file.hash != sealed => {
                    return Err(OutpackError::ImmutableFileModified(path.clone()).into())
                }
                Some(_) => {}
            }
        }

        let meta = MetadataCore {
            schema_version: SCHEMA_VERSION.to_string(),
            id: self.id.clone(),
            name: self.name.clone(),
            parameters: self.parameters.clone(),
            time: BTreeMap::from([
                ("start".to_string(), self.time_start),
                ("end".to_string(), unix_seconds(OffsetDateTime::now_utc())),
            ]),
            files,
            depends: self.depends.clone(),
            git: self.git.clone(),
            custom: (!self.custom.is_empty()).then(|| self.custom.clone()),
        };
        meta.validate()?;

        if success {
            self.root.insert_packet(&meta, &self.path)?;
        } else {
            write_atomic(
                &self.path.join(CANCELLED_METADATA_FILE),
                canonical_json(&meta)?.as_bytes(),
            )?;
            info!(packet = %self.id, "packet cancelled");
        }
        Ok(meta)
    }

    fn ensure_open(&self) -> Result<()> {
        if self.finalized {
            return Err(OutpackError::AlreadyFinalized(self.id.clone()).into());
        }
        Ok(())
    }

    fn collect_files(&self) -> Result<Vec<PacketFile>> {
        let algorithm = self.root.hash_algorithm();
        let walker = WalkDir::new(&self.path)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|entry| {
                !(entry.depth() > 0
                    && entry.file_type().is_dir()
                    && entry
                        .file_name()
                        .to_str()
                        .is_some_and(|name| EXCLUDED_DIRS.contains(&name)))
            });
        let mut files = Vec::new();
        for entry in walker {
            let entry =
                entry.with_context(|| format!("failed to walk {}", self.path.display()))?;
            if !entry.file_type().is_file() {
                continue;
            }
            let relative = entry
                .path()
                .strip_prefix(&self.path)
                .with_context(|| format!("{} escaped the packet", entry.path().display()))?;
            let path = relative_path(relative).ok_or_else(|| OutpackError::InvalidMetadata {
                id: self.id.clone(),
                reason: format!("file name {} is not valid unicode", relative.display()),
            })?;
            let size = entry
                .metadata()
                .with_context(|| format!("failed to stat {}", entry.path().display()))?
                .len();
            let hash = hash_file(algorithm, entry.path())?;
            files.push(PacketFile { path, size, hash });
        }
        Ok(files)
    }
}

fn relative_path(path: &Path) -> Option<String> {
    let parts: Option<Vec<&str>> = path.components().map(|part| part.as_os_str().to_str()).collect();
    parts.map(|parts| parts.join("/"))
}

/// Expand directory mappings (`there` ending in `/`) into one mapping per
/// upstream file.
fn expand_mappings(meta: &MetadataCore, files: &[(&str, &str)]) -> Result<Vec<FileMapping>> {
    let mut mappings = Vec::new();
    for (here, there) in files {
        if there.ends_with('/') {
            let matching: Vec<&PacketFile> = meta
                .files
                .iter()
                .filter(|file| file.path.starts_with(there))
                .collect();
            if matching.is_empty() {
                return Err(OutpackError::FileNotFound {
                    packet: meta.id.clone(),
                    path: (*there).to_string(),
                }
                .into());
            }
            let prefix = if here.is_empty() || here.ends_with('/') {
                (*here).to_string()
            } else {
                format!("{here}/")
            };
            for file in matching {
                let suffix = &file.path[there.len()..];
                mappings.push(FileMapping {
                    here: format!("{prefix}{suffix}"),
                    there: file.path.clone(),
                });
            }
        } else {
            if meta.file(there).is_none() {
                return Err(OutpackError::FileNotFound {
                    packet: meta.id.clone(),
                    path: (*there).to_string(),
                }
                .into());
            }
            mappings.push(FileMapping {
                here: (*here).to_string(),
                there: (*there).to_string(),
            });
        }
    }
    for mapping in &mappings {
        validate_file_path(&mapping.here).map_err(|reason| OutpackError::InvalidMetadata {
            id: meta.id.clone(),
            reason,
        })?;
    }
    Ok(mappings)
}
