//! Process-local cache over the metadata ledger and location records.
//!
//! The ledger is append-only in normal use, so [`Index::refresh`] only ever
//! adds entries it has not seen yet. [`Index::rebuild`] swaps in a freshly
//! scanned cache and is the only way deletions become visible.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use anyhow::{Context, Result};
use outpack_domain::{is_valid_id, MetadataCore, OutpackError, PacketLocation, LOCATION_LOCAL};
use tracing::{debug, warn};

use crate::fs::{list_dir_names, list_file_names};

pub(crate) const METADATA_DIR: &str = "metadata";
pub(crate) const LOCATION_DIR: &str = "location";

#[derive(Clone, Debug, Default)]
pub struct IndexData {
    pub metadata: BTreeMap<String, Arc<MetadataCore>>,
    pub location: BTreeMap<String, BTreeMap<String, PacketLocation>>,
}

impl IndexData {
    /// Ids recorded under the `local` location, sorted.
    #[must_use]
    pub fn unpacked(&self) -> BTreeSet<String> {
        self.location
            .get(LOCATION_LOCAL)
            .map(|records| records.keys().cloned().collect())
            .unwrap_or_default()
    }
}

#[derive(Debug)]
pub struct Index {
    outpack_dir: PathBuf,
    data: Mutex<IndexData>,
}

impl Index {
    /// Open an index over `.outpack` and populate it.
    pub fn new(outpack_dir: impl Into<PathBuf>) -> Result<Self> {
        let index = Self {
            outpack_dir: outpack_dir.into(),
            data: Mutex::new(IndexData::default()),
        };
        index.refresh()?;
        Ok(index)
    }

    /// Pick up ledger entries written since the last scan.
    pub fn refresh(&self) -> Result<()> {
        let mut data = self.lock();
        self.scan_into(&mut data)
    }

    /// Discard the cache and rescan from empty.
    pub fn rebuild(&self) -> Result<()> {
        let mut fresh = IndexData::default();
        self.scan_into(&mut fresh)?;
        *self.lock() = fresh;
        Ok(())
    }

    pub fn metadata(&self, id: &str) -> Result<Arc<MetadataCore>> {
        if let Some(meta) = self.lock().metadata.get(id) {
            return Ok(Arc::clone(meta));
        }
        self.refresh()?;
        self.lock()
            .metadata
            .get(id)
            .cloned()
            .ok_or_else(|| OutpackError::UnknownPacket(id.to_string()).into())
    }

    pub fn location(&self, name: &str) -> Result<BTreeMap<String, PacketLocation>> {
        Ok(self.snapshot()?.location.remove(name).unwrap_or_default())
    }

    pub fn all_locations(&self) -> Result<BTreeMap<String, BTreeMap<String, PacketLocation>>> {
        Ok(self.snapshot()?.location)
    }

    pub fn all_metadata(&self) -> Result<BTreeMap<String, Arc<MetadataCore>>> {
        Ok(self.snapshot()?.metadata)
    }

    /// Sorted ids of packets whose files are present in this repository.
    pub fn unpacked(&self) -> Result<Vec<String>> {
        Ok(self.snapshot()?.unpacked().into_iter().collect())
    }

    pub fn is_unpacked(&self, id: &str) -> Result<bool> {
        self.refresh()?;
        Ok(self
            .lock()
            .location
            .get(LOCATION_LOCAL)
            .is_some_and(|records| records.contains_key(id)))
    }

    /// Refresh, then copy out the whole cache.
    pub fn snapshot(&self) -> Result<IndexData> {
        let mut data = self.lock();
        self.scan_into(&mut data)?;
        Ok(data.clone())
    }

    fn lock(&self) -> MutexGuard<'_, IndexData> {
        self.data.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn scan_into(&self, data: &mut IndexData) -> Result<()> {
        let metadata_dir = self.outpack_dir.join(METADATA_DIR);
        let mut added = 0usize;
        for id in list_file_names(&metadata_dir)? {
            if !is_valid_id(&id) || data.metadata.contains_key(&id) {
                continue;
            }
            let Some(text) = read_entry(&metadata_dir.join(&id))? else {
                continue;
            };
            match MetadataCore::from_json(&text) {
                Ok(meta) => {
                    data.metadata.insert(id, Arc::new(meta));
                    added += 1;
                }
                Err(err) => warn!(packet = %id, error = %err, "skipping unreadable metadata"),
            }
        }

        let location_dir = self.outpack_dir.join(LOCATION_DIR);
        for name in list_dir_names(&location_dir)? {
            let dir = location_dir.join(&name);
            let records = data.location.entry(name.clone()).or_default();
            for id in list_file_names(&dir)? {
                if !is_valid_id(&id) || records.contains_key(&id) {
                    continue;
                }
                let Some(text) = read_entry(&dir.join(&id))? else {
                    continue;
                };
                match serde_json::from_str::<PacketLocation>(&text) {
                    Ok(record) => {
                        records.insert(id, record);
                        added += 1;
                    }
                    Err(err) => warn!(
                        location = %name,
                        packet = %id,
                        error = %err,
                        "skipping unreadable location record"
                    ),
                }
            }
        }
        if added > 0 {
            debug!(added, "index refreshed");
        }
        Ok(())
    }
}

/// Read a ledger file, treating one that vanished mid-scan as absent.
fn read_entry(path: &Path) -> Result<Option<String>> {
    match fs::read_to_string(path) {
        Ok(text) => Ok(Some(text)),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
        Err(err) => Err(err).with_context(|| format!("failed to read {}", path.display())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use outpack_domain::{canonical_json, hash_bytes, HashAlgorithm};
    use tempfile::tempdir;

    fn write_record(outpack: &Path, location: &str, id: &str) -> Result<()> {
        let dir = outpack.join(LOCATION_DIR).join(location);
        fs::create_dir_all(&dir)?;
        let record = PacketLocation::now(id, hash_bytes(HashAlgorithm::Sha256, id.as_bytes()));
        fs::write(dir.join(id), canonical_json(&record)?)?;
        Ok(())
    }

    #[test]
    fn refresh_is_monotonic_and_rebuild_sees_deletions() -> Result<()> {
        let temp = tempdir()?;
        let outpack = temp.path().join(".outpack");
        let first = Index::new(&outpack)?;
        assert!(first.unpacked()?.is_empty());

        write_record(&outpack, "local", "20240101-000000-00000002")?;
        write_record(&outpack, "local", "20240101-000000-00000001")?;
        write_record(&outpack, "server", "20240101-000000-00000003")?;
        fs::write(outpack.join(LOCATION_DIR).join("local").join("not-an-id"), "{}")?;

        assert_eq!(
            first.unpacked()?,
            vec!["20240101-000000-00000001", "20240101-000000-00000002"]
        );
        let second = Index::new(&outpack)?;
        assert_eq!(first.all_locations()?, second.all_locations()?);

        fs::remove_file(
            outpack
                .join(LOCATION_DIR)
                .join("local")
                .join("20240101-000000-00000001"),
        )?;
        first.refresh()?;
        assert_eq!(first.unpacked()?.len(), 2);
        second.rebuild()?;
        assert_eq!(second.unpacked()?, vec!["20240101-000000-00000002"]);
        assert!(second.location("server")?.contains_key("20240101-000000-00000003"));
        Ok(())
    }

    #[test]
    fn unknown_metadata_is_an_error() -> Result<()> {
        let temp = tempdir()?;
        let index = Index::new(temp.path())?;
        let err = index.metadata("20240101-000000-00000001").unwrap_err();
        assert!(matches!(
            err.downcast_ref::<OutpackError>(),
            Some(OutpackError::UnknownPacket(_))
        ));
        Ok(())
    }

    #[test]
    fn skips_unparseable_metadata() -> Result<()> {
        let temp = tempdir()?;
        let dir = temp.path().join(METADATA_DIR);
        fs::create_dir_all(&dir)?;
        fs::write(dir.join("20240101-000000-00000001"), "not json")?;
        let index = Index::new(temp.path())?;
        assert!(index.all_metadata()?.is_empty());
        Ok(())
    }
}
