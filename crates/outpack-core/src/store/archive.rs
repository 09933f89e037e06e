use std::path::{Path, PathBuf};

use anyhow::Result;
use outpack_domain::hash::hash_file;
use outpack_domain::{Hash, MetadataCore};
use tracing::{debug, warn};

use super::FileStore;
use crate::fs::copy_file;

/// Packet files laid out as `{name}/{id}/{path}`.
#[derive(Clone, Debug)]
pub struct Archive {
    root: PathBuf,
}

impl Archive {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    #[must_use]
    pub fn packet_dir(&self, meta: &MetadataCore) -> PathBuf {
        self.root.join(&meta.name).join(&meta.id)
    }

    #[must_use]
    pub fn path_for(&self, meta: &MetadataCore, path: &str) -> PathBuf {
        self.packet_dir(meta).join(path)
    }

    /// Copy every file listed in `meta` from `src_dir`.
    pub fn import(&self, meta: &MetadataCore, src_dir: &Path) -> Result<()> {
        for file in &meta.files {
            copy_file(&src_dir.join(&file.path), &self.path_for(meta, &file.path))?;
        }
        debug!(packet = %meta.id, files = meta.files.len(), "imported packet into archive");
        Ok(())
    }

    /// Materialise `meta` from blobs already present in `store`.
    pub fn import_from_store(&self, meta: &MetadataCore, store: &FileStore) -> Result<()> {
        for file in &meta.files {
            store.get(&file.hash, &self.path_for(meta, &file.path), true)?;
        }
        debug!(packet = %meta.id, files = meta.files.len(), "imported packet into archive from store");
        Ok(())
    }

    /// Find an on-disk copy of `hash` among `candidates`, in order.
    ///
    /// A copy only counts if its current content still hashes to `hash`;
    /// copies that were edited or truncated after import are skipped.
    pub fn find_file<'a>(
        &self,
        hash: &Hash,
        candidates: impl IntoIterator<Item = &'a MetadataCore>,
    ) -> Result<Option<PathBuf>> {
        let algorithm = hash.algorithm_kind()?;
        for meta in candidates {
            for file in meta.files.iter().filter(|file| &file.hash == hash) {
                let path = self.path_for(meta, &file.path);
                if !path.is_file() {
                    continue;
                }
                match hash_file(algorithm, &path) {
                    Ok(found) if &found == hash => return Ok(Some(path)),
                    Ok(found) => warn!(
                        path = %path.display(),
                        expected = %hash,
                        found = %found,
                        "rejecting modified archive file"
                    ),
                    Err(err) => warn!(
                        path = %path.display(),
                        error = %err,
                        "failed to hash archive file"
                    ),
                }
            }
        }
        Ok(None)
    }
}
