use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::io::ErrorKind;
use std::path::Path;

use anyhow::{Context, Result};
use outpack_domain::hash::validate;
use outpack_domain::{
    hash_bytes, Hash, MetadataCore, OutpackError, PacketFile, PacketLocation, LOCATION_LOCAL,
};
use tracing::debug;

use super::LocationDriver;
use crate::fs::copy_file;
use crate::root::Root;
use crate::store::FileStore;

/// Blobs pushed to a repository without a file store wait here until their
/// packet's metadata arrives.
const UPLOAD_DIR: &str = "upload";

/// A location that is another repository on the local filesystem.
#[derive(Debug)]
pub struct PathDriver {
    root: Root,
}

impl PathDriver {
    pub fn open(path: &Path) -> Result<Self> {
        let root = Root::open(path, false)
            .with_context(|| format!("failed to open path location {}", path.display()))?;
        Ok(Self { root })
    }

    fn upload_store(&self) -> Result<FileStore> {
        FileStore::open(self.root.outpack_dir().join(UPLOAD_DIR))
    }

    /// Where this repository keeps (or receives) blobs.
    fn blob_store(&self) -> Result<FileStore> {
        match self.root.files() {
            Some(store) => Ok(store.clone()),
            None => self.upload_store(),
        }
    }

    fn known_hashes(&self) -> Result<BTreeSet<Hash>> {
        let mut hashes = BTreeSet::new();
        for id in self.root.index().unpacked()? {
            let meta = self.root.index().metadata(&id)?;
            hashes.extend(meta.files.iter().map(|file| file.hash.clone()));
        }
        Ok(hashes)
    }
}

impl LocationDriver for PathDriver {
    fn list(&self) -> Result<BTreeMap<String, PacketLocation>> {
        self.root.index().location(LOCATION_LOCAL)
    }

    fn metadata(&self, ids: &[String]) -> Result<BTreeMap<String, String>> {
        let mut found = BTreeMap::new();
        for id in ids {
            let path = self.root.metadata_path(id);
            let text = match fs::read_to_string(&path) {
                Ok(text) => text,
                Err(err) if err.kind() == ErrorKind::NotFound => {
                    return Err(OutpackError::UnknownPacket(id.clone()).into())
                }
                Err(err) => {
                    return Err(err).with_context(|| format!("failed to read {}", path.display()))
                }
            };
            found.insert(id.clone(), text);
        }
        Ok(found)
    }

    fn fetch_file(&self, packet: &MetadataCore, file: &PacketFile, dest: &Path) -> Result<()> {
        if let Some(store) = self.root.files() {
            if store.exists(&file.hash) {
                return store.get(&file.hash, dest, true);
            }
        }
        match self.root.find_archive_file(&file.hash, &[packet.id.as_str()])? {
            Some(src) => copy_file(&src, dest),
            None => Err(OutpackError::HashNotFound(file.hash.clone()).into()),
        }
    }

    fn list_unknown_packets(&self, ids: &[String]) -> Result<Vec<String>> {
        let unpacked: BTreeSet<String> = self.root.index().unpacked()?.into_iter().collect();
        Ok(ids
            .iter()
            .filter(|id| !unpacked.contains(*id))
            .cloned()
            .collect())
    }

    fn list_unknown_files(&self, hashes: &[Hash]) -> Result<Vec<Hash>> {
        let store = self.blob_store()?;
        let known = if self.root.files().is_some() {
            BTreeSet::new()
        } else {
            self.known_hashes()?
        };
        Ok(hashes
            .iter()
            .filter(|hash| !store.exists(hash) && !known.contains(*hash))
            .cloned()
            .collect())
    }

    fn push_file(&self, path: &Path, hash: &Hash) -> Result<()> {
        self.blob_store()?.put(path, hash, false)?;
        Ok(())
    }

    /// Import a packet whose files have already been pushed.
    fn push_metadata(&self, path: &Path, hash: &Hash) -> Result<()> {
        let text = fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        let found = hash_bytes(hash.algorithm_kind()?, text.as_bytes());
        validate(&found, hash, &format!("metadata '{}'", path.display()))?;
        let meta = MetadataCore::from_json(&text)?;
        meta.validate()?;
        let index = self.root.index();
        if index.is_unpacked(&meta.id)? {
            debug!(packet = %meta.id, "packet already present at path location");
            return Ok(());
        }

        if let Some(archive) = self.root.archive() {
            let store = self.blob_store()?;
            for file in &meta.files {
                let dest = archive.path_for(&meta, &file.path);
                if store.exists(&file.hash) {
                    store.get(&file.hash, &dest, true)?;
                } else if let Some(src) = self.root.find_archive_file(&file.hash, &[])? {
                    copy_file(&src, &dest)?;
                } else {
                    return Err(OutpackError::HashNotFound(file.hash.clone()).into());
                }
            }
        } else if let Some(store) = self.root.files() {
            if let Some(file) = meta.files.iter().find(|file| !store.exists(&file.hash)) {
                return Err(OutpackError::HashNotFound(file.hash.clone()).into());
            }
        }
        self.root.write_metadata(&meta.id, &text)?;
        self.root.mark_known(&meta.id, hash, LOCATION_LOCAL)?;
        debug!(packet = %meta.id, "imported pushed packet");
        Ok(())
    }
}
