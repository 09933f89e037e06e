use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use outpack_domain::{
    hash_bytes, Config, CoreConfig, Hash, HashAlgorithm, MetadataCore, OutpackError,
    PacketLocation, LOCATION_LOCAL,
};
use tracing::{debug, info};

use crate::fs::{copy_file, write_atomic};
use crate::index::{Index, LOCATION_DIR, METADATA_DIR};
use crate::store::{Archive, FileStore};

pub const OUTPACK_DIR: &str = ".outpack";
const CONFIG_FILE: &str = "config.json";
const FILES_DIR: &str = "files";

/// Settings for a new repository.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InitOptions {
    pub path_archive: Option<String>,
    pub use_file_store: bool,
    pub require_complete_tree: bool,
    pub hash_algorithm: HashAlgorithm,
}

impl Default for InitOptions {
    fn default() -> Self {
        Self {
            path_archive: Some("archive".to_string()),
            use_file_store: false,
            require_complete_tree: false,
            hash_algorithm: HashAlgorithm::Sha256,
        }
    }
}

impl From<InitOptions> for CoreConfig {
    fn from(options: InitOptions) -> Self {
        Self {
            path_archive: options.path_archive,
            use_file_store: options.use_file_store,
            require_complete_tree: options.require_complete_tree,
            hash_algorithm: options.hash_algorithm,
        }
    }
}

/// An open outpack repository.
#[derive(Debug)]
pub struct Root {
    path: PathBuf,
    config: Config,
    index: Index,
    files: Option<FileStore>,
    archive: Option<Archive>,
}

impl Root {
    /// Create a repository at `path`, or reopen one initialised with the
    /// same settings.
    pub fn init(path: impl AsRef<Path>, options: InitOptions) -> Result<Self> {
        let path = path.as_ref();
        let config = Config::new(options.into())?;
        let outpack = path.join(OUTPACK_DIR);
        if outpack.join(CONFIG_FILE).is_file() {
            let existing = Self::open(path, false)?;
            if existing.config.core != config.core {
                return Err(OutpackError::InvalidConfig(format!(
                    "a repository already exists at '{}' with different settings",
                    path.display()
                ))
                .into());
            }
            return Ok(existing);
        }
        for dir in [
            outpack.join(METADATA_DIR),
            outpack.join(LOCATION_DIR).join(LOCATION_LOCAL),
        ] {
            fs::create_dir_all(&dir)
                .with_context(|| format!("failed to create {}", dir.display()))?;
        }
        write_config(&outpack, &config)?;
        info!(path = %path.display(), "initialised outpack repository");
        Self::open(path, false)
    }

    /// Open the repository at `path`; with `locate`, search upwards for it.
    pub fn open(path: impl AsRef<Path>, locate: bool) -> Result<Self> {
        let requested = path.as_ref();
        let start = fs::canonicalize(requested).unwrap_or_else(|_| requested.to_path_buf());
        let found = if locate {
            start.ancestors().find(|dir| is_repository(dir))
        } else {
            Some(start.as_path()).filter(|dir| is_repository(dir))
        };
        let path = found
            .ok_or_else(|| OutpackError::NoRepositoryFound(requested.to_path_buf()))?
            .to_path_buf();

        let outpack = path.join(OUTPACK_DIR);
        let config_path = outpack.join(CONFIG_FILE);
        let text = fs::read_to_string(&config_path)
            .with_context(|| format!("failed to read {}", config_path.display()))?;
        let config: Config = serde_json::from_str(&text)
            .map_err(|err| OutpackError::InvalidConfig(err.to_string()))?;
        config.validate()?;

        let files = if config.core.use_file_store {
            Some(FileStore::open(outpack.join(FILES_DIR))?)
        } else {
            None
        };
        let archive = config
            .core
            .path_archive
            .as_ref()
            .map(|archive| Archive::new(path.join(archive)));
        let index = Index::new(&outpack)?;
        debug!(path = %path.display(), "opened outpack repository");
        Ok(Self {
            path,
            config,
            index,
            files,
            archive,
        })
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    #[must_use]
    pub fn outpack_dir(&self) -> PathBuf {
        self.path.join(OUTPACK_DIR)
    }

    #[must_use]
    pub fn config(&self) -> &Config {
        &self.config
    }

    #[must_use]
    pub fn index(&self) -> &Index {
        &self.index
    }

    #[must_use]
    pub fn files(&self) -> Option<&FileStore> {
        self.files.as_ref()
    }

    #[must_use]
    pub fn archive(&self) -> Option<&Archive> {
        self.archive.as_ref()
    }

    #[must_use]
    pub fn hash_algorithm(&self) -> HashAlgorithm {
        self.config.core.hash_algorithm
    }

    /// Copy file `there` of packet `id` to `dest_dir/here`.
    pub fn export_file(&self, id: &str, there: &str, here: &str, dest_dir: &Path) -> Result<PathBuf> {
        let meta = self.index.metadata(id)?;
        let not_found = || OutpackError::FileNotFound {
            packet: id.to_string(),
            path: there.to_string(),
        };
        let file = meta.file(there).ok_or_else(not_found)?;
        let dest = dest_dir.join(here);
        if let Some(store) = &self.files {
            if store.exists(&file.hash) {
                store.get(&file.hash, &dest, true)?;
                return Ok(dest);
            }
        }
        if let Some(src) = self.find_archive_file(&file.hash, &[id])? {
            copy_file(&src, &dest)?;
            return Ok(dest);
        }
        Err(not_found().into())
    }

    /// Search the archive for a valid copy of `hash`, trying `preferred`
    /// packets before every other unpacked packet.
    pub fn find_archive_file(&self, hash: &Hash, preferred: &[&str]) -> Result<Option<PathBuf>> {
        let Some(archive) = &self.archive else {
            return Ok(None);
        };
        let mut candidates: Vec<Arc<MetadataCore>> = Vec::new();
        for id in preferred {
            if let Ok(meta) = self.index.metadata(id) {
                candidates.push(meta);
            }
        }
        for id in self.index.unpacked()? {
            if preferred.contains(&id.as_str()) {
                continue;
            }
            candidates.push(self.index.metadata(&id)?);
        }
        archive.find_file(hash, candidates.iter().map(AsRef::as_ref))
    }

    /// Commit a finished packet whose files sit under `src_dir`.
    ///
    /// Bytes are stored first, then the metadata, then the `local` record,
    /// so an interrupted insert never leaves a record without its content.
    pub fn insert_packet(&self, meta: &MetadataCore, src_dir: &Path) -> Result<Hash> {
        meta.validate()?;
        if self.index.is_unpacked(&meta.id)? {
            return Err(OutpackError::PacketExists(meta.id.clone()).into());
        }
        if self.config.core.require_complete_tree {
            for dep in meta.dependency_ids() {
                if !self.index.is_unpacked(dep)? {
                    return Err(OutpackError::UnknownPacket(dep.to_string()).into());
                }
            }
        }
        if let Some(store) = &self.files {
            for file in &meta.files {
                store.put(&src_dir.join(&file.path), &file.hash, false)?;
            }
        }
        if let Some(archive) = &self.archive {
            archive.import(meta, src_dir)?;
        }
        let text = meta.to_canonical_json()?;
        let hash = hash_bytes(self.hash_algorithm(), text.as_bytes());
        self.write_metadata(&meta.id, &text)?;
        self.mark_known(&meta.id, &hash, LOCATION_LOCAL)?;
        info!(packet = %meta.id, name = %meta.name, "inserted packet");
        Ok(hash)
    }

    pub(crate) fn metadata_path(&self, id: &str) -> PathBuf {
        self.outpack_dir().join(METADATA_DIR).join(id)
    }

    pub(crate) fn location_dir(&self, name: &str) -> PathBuf {
        self.outpack_dir().join(LOCATION_DIR).join(name)
    }

    pub(crate) fn write_metadata(&self, id: &str, text: &str) -> Result<()> {
        write_atomic(&self.metadata_path(id), text.as_bytes())
    }

    /// Record that `location` holds packet `id` with metadata hash `hash`.
    pub(crate) fn mark_known(&self, id: &str, hash: &Hash, location: &str) -> Result<()> {
        self.write_location_record(location, &PacketLocation::now(id, hash.clone()))
    }

    pub(crate) fn write_location_record(&self, location: &str, record: &PacketLocation) -> Result<()> {
        write_atomic(
            &self.location_dir(location).join(&record.packet),
            record.to_canonical_json()?.as_bytes(),
        )?;
        debug!(packet = %record.packet, location, "recorded packet location");
        Ok(())
    }

    pub(crate) fn save_config(&mut self, config: Config) -> Result<()> {
        config.validate()?;
        write_config(&self.outpack_dir(), &config)?;
        self.config = config;
        Ok(())
    }
}

fn is_repository(dir: &Path) -> bool {
    dir.join(OUTPACK_DIR).join(CONFIG_FILE).is_file()
}

fn write_config(outpack: &Path, config: &Config) -> Result<()> {
    let mut text = serde_json::to_string_pretty(config).context("failed to encode config")?;
    text.push('\n');
    write_atomic(&outpack.join(CONFIG_FILE), text.as_bytes())
}

/// Anything that can be turned into an open [`Root`].
pub trait IntoRoot {
    fn into_root(self, locate: bool) -> Result<Root>;
}

impl IntoRoot for Root {
    fn into_root(self, _locate: bool) -> Result<Root> {
        Ok(self)
    }
}

impl IntoRoot for &Path {
    fn into_root(self, locate: bool) -> Result<Root> {
        Root::open(self, locate)
    }
}

impl IntoRoot for PathBuf {
    fn into_root(self, locate: bool) -> Result<Root> {
        Root::open(self, locate)
    }
}

impl IntoRoot for &str {
    fn into_root(self, locate: bool) -> Result<Root> {
        Root::open(self, locate)
    }
}

/// Open a repository from a path, or pass an open one through unchanged.
pub fn root_open(root: impl IntoRoot, locate: bool) -> Result<Root> {
    root.into_root(locate)
}
