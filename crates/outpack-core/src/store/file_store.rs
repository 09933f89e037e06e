use std::collections::BTreeSet;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use outpack_domain::hash::{hash_file, validate, validate_file};
use outpack_domain::{Hash, HashAlgorithm, OutpackError};
use tempfile::{NamedTempFile, TempPath};
use tracing::debug;
use walkdir::WalkDir;

use crate::fs::{copy_file, make_read_only, remove_dir_all_writable};

const TMP_DIR: &str = "tmp";

/// Content-addressed blob store laid out as `{algorithm}/{xx}/{rest}`.
#[derive(Clone, Debug)]
pub struct FileStore {
    root: PathBuf,
}

impl FileStore {
    /// Open (creating if needed) a store rooted at `root`.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)
            .with_context(|| format!("failed to create file store at {}", root.display()))?;
        Ok(Self { root })
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    #[must_use]
    pub fn path_for(&self, hash: &Hash) -> PathBuf {
        let value = hash.value();
        let split = value.len().min(2);
        let (shard, rest) = value.split_at(split);
        self.root.join(hash.algorithm()).join(shard).join(rest)
    }

    #[must_use]
    pub fn exists(&self, hash: &Hash) -> bool {
        self.path_for(hash).is_file()
    }

    /// Install `src` under `hash`.
    ///
    /// The bytes are staged in the store's temp directory and verified before
    /// being renamed into place, so a blob is never visible under its final
    /// name with the wrong content. With `move_source` the source is consumed
    /// whether or not the blob was already present.
    pub fn put(&self, src: &Path, hash: &Hash, move_source: bool) -> Result<Hash> {
        let dest = self.path_for(hash);
        let context = format!("file '{}'", src.display());
        if dest.exists() {
            validate_file(src, hash, &context)?;
            debug!(hash = %hash, "blob already present in store");
            if move_source {
                fs::remove_file(src)
                    .with_context(|| format!("failed to remove {}", src.display()))?;
            }
            return Ok(hash.clone());
        }

        let staged = self.stage(src, hash, move_source)?;
        let found = hash_file(hash.algorithm_kind()?, staged.path())?;
        validate(&found, hash, &context)?;

        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        match staged.persist_noclobber(&dest) {
            Ok(_) => {}
            Err(err) if err.error.kind() == ErrorKind::AlreadyExists => {
                debug!(hash = %hash, "blob installed concurrently");
            }
            Err(err) => {
                return Err(err.error).with_context(|| {
                    format!("failed to install blob at {}", dest.display())
                })
            }
        }
        make_read_only(&dest)?;
        if move_source && src.exists() {
            fs::remove_file(src).with_context(|| format!("failed to remove {}", src.display()))?;
        }
        debug!(hash = %hash, "stored blob");
        Ok(hash.clone())
    }

    fn stage(&self, src: &Path, hash: &Hash, move_source: bool) -> Result<NamedTempFile> {
        let staged = NamedTempFile::new_in(self.tmp_dir()?)
            .context("failed to create staging file in store")?;
        if move_source {
            // Hash before moving so a mismatched source survives the failure.
            validate_file(src, hash, &format!("file '{}'", src.display()))?;
            if fs::rename(src, staged.path()).is_ok() {
                return Ok(staged);
            }
        }
        fs::copy(src, staged.path()).with_context(|| {
            format!("failed to stage {} into the file store", src.display())
        })?;
        Ok(staged)
    }

    /// Copy the blob for `hash` to `dest`.
    pub fn get(&self, hash: &Hash, dest: &Path, overwrite: bool) -> Result<()> {
        let src = self.path_for(hash);
        if !src.is_file() {
            return Err(OutpackError::HashNotFound(hash.clone()).into());
        }
        if dest.exists() && !overwrite {
            return Err(OutpackError::AlreadyExists(dest.to_path_buf()).into());
        }
        copy_file(&src, dest)
    }

    /// Every blob in the store, found by walking the algorithm directories.
    pub fn list(&self) -> Result<BTreeSet<Hash>> {
        let mut hashes = BTreeSet::new();
        for algorithm in crate::fs::list_dir_names(&self.root)? {
            if algorithm.parse::<HashAlgorithm>().is_err() {
                continue;
            }
            let base = self.root.join(&algorithm);
            for entry in WalkDir::new(&base).min_depth(2).max_depth(2) {
                let entry = entry
                    .with_context(|| format!("failed to walk {}", base.display()))?;
                if !entry.file_type().is_file() {
                    continue;
                }
                let shard = entry
                    .path()
                    .parent()
                    .and_then(Path::file_name)
                    .and_then(|name| name.to_str());
                let rest = entry.file_name().to_str();
                if let (Some(shard), Some(rest)) = (shard, rest) {
                    hashes.insert(Hash::new(algorithm.as_str(), format!("{shard}{rest}")));
                }
            }
        }
        Ok(hashes)
    }

    /// Remove the whole store, including read-only blobs.
    pub fn destroy(self) -> Result<()> {
        remove_dir_all_writable(&self.root)
    }

    /// A uniquely named staging file inside the store, deleted when dropped.
    pub fn scoped_temp_file(&self) -> Result<TempPath> {
        let file = NamedTempFile::new_in(self.tmp_dir()?)
            .context("failed to create temporary file in store")?;
        Ok(file.into_temp_path())
    }

    fn tmp_dir(&self) -> Result<PathBuf> {
        let dir = self.root.join(TMP_DIR);
        fs::create_dir_all(&dir)
            .with_context(|| format!("failed to create {}", dir.display()))?;
        Ok(dir)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use outpack_domain::hash_bytes;
    use tempfile::tempdir;

    fn store_with_source(contents: &[u8]) -> Result<(tempfile::TempDir, FileStore, PathBuf, Hash)> {
        let temp = tempdir()?;
        let store = FileStore::open(temp.path().join("files"))?;
        let src = temp.path().join("source.txt");
        fs::write(&src, contents)?;
        let hash = hash_bytes(HashAlgorithm::Sha256, contents);
        Ok((temp, store, src, hash))
    }

    #[test]
    fn put_is_idempotent() -> Result<()> {
        let (_temp, store, src, hash) = store_with_source(b"42\n")?;
        store.put(&src, &hash, false)?;
        store.put(&src, &hash, false)?;
        assert!(store.exists(&hash));
        assert_eq!(store.list()?, BTreeSet::from([hash.clone()]));
        let path = store.path_for(&hash);
        assert!(path.starts_with(store.root().join("sha256").join(&hash.value()[..2])));
        assert!(fs::metadata(&path)?.permissions().readonly());
        Ok(())
    }

    #[test]
    fn put_rejects_wrong_hash_and_leaves_store_unchanged() -> Result<()> {
        let (_temp, store, src, _) = store_with_source(b"42\n")?;
        let wrong = hash_bytes(HashAlgorithm::Sha256, b"43\n");
        let err = store.put(&src, &wrong, false).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<OutpackError>(),
            Some(OutpackError::HashMismatch { .. })
        ));
        assert!(!store.exists(&wrong));
        assert!(store.list()?.is_empty());

        let err = store.put(&src, &wrong, true).unwrap_err();
        assert!(err.downcast_ref::<OutpackError>().is_some());
        assert!(src.exists(), "mismatched source must not be consumed");
        Ok(())
    }

    #[test]
    fn put_with_move_consumes_source() -> Result<()> {
        let (temp, store, src, hash) = store_with_source(b"payload")?;
        store.put(&src, &hash, true)?;
        assert!(!src.exists());

        let again = temp.path().join("again.txt");
        fs::write(&again, b"payload")?;
        store.put(&again, &hash, true)?;
        assert!(!again.exists());
        assert_eq!(store.list()?.len(), 1);
        Ok(())
    }

    #[test]
    fn get_respects_overwrite() -> Result<()> {
        let (temp, store, src, hash) = store_with_source(b"data")?;
        let dest = temp.path().join("out").join("copy.txt");
        let missing = hash_bytes(HashAlgorithm::Sha256, b"missing");
        let err = store.get(&missing, &dest, false).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<OutpackError>(),
            Some(OutpackError::HashNotFound(_))
        ));

        store.put(&src, &hash, false)?;
        store.get(&hash, &dest, false)?;
        assert_eq!(fs::read(&dest)?, b"data");
        let err = store.get(&hash, &dest, false).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<OutpackError>(),
            Some(OutpackError::AlreadyExists(_))
        ));
        store.get(&hash, &dest, true)?;
        fs::write(&dest, b"edited")?;
        Ok(())
    }

    #[test]
    fn scoped_temp_file_is_removed_on_drop() -> Result<()> {
        let (_temp, store, _, _) = store_with_source(b"x")?;
        let path = {
            let temp = store.scoped_temp_file()?;
            fs::write(&temp, b"partial")?;
            temp.to_path_buf()
        };
        assert!(!path.exists());
        assert!(store.list()?.is_empty());
        Ok(())
    }

    #[test]
    fn destroy_removes_read_only_blobs() -> Result<()> {
        let (_temp, store, src, hash) = store_with_source(b"x")?;
        store.put(&src, &hash, false)?;
        let root = store.root().to_path_buf();
        store.destroy()?;
        assert!(!root.exists());
        Ok(())
    }
}
