use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use anyhow::{Context, Result};
use outpack_domain::hash::validate;
use outpack_domain::{
    hash_bytes, validate_id, Hash, MetadataCore, OutpackError, PacketFile, LOCATION_LOCAL,
};
use tempfile::TempDir;
use tracing::{debug, info, warn};

use super::{open_driver, resolve_locations};
use crate::fs::remove_dir_all_writable;
use crate::root::Root;
use crate::search::SearchOptions;
use crate::store::FileStore;

/// What one location contributed to a metadata pull.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PullMetadataSummary {
    pub location: String,
    /// Packets the location claims to hold.
    pub total: usize,
    /// Packets whose metadata was new to this repository.
    pub new: usize,
}

/// Fetch packet listings and any unseen metadata from `locations` (all
/// configured remotes when `None`).
pub fn pull_metadata(root: &Root, locations: Option<&[String]>) -> Result<Vec<PullMetadataSummary>> {
    let mut summaries = Vec::new();
    for location in resolve_locations(root, locations)? {
        let name = location.name.as_str();
        let driver = open_driver(root, &location)?;
        let available = driver.list()?;
        for (id, record) in &available {
            validate_id(id)?;
            if record.packet != *id {
                return Err(OutpackError::Transport {
                    location: name.to_string(),
                    reason: format!("listing for '{id}' describes packet '{}'", record.packet),
                }
                .into());
            }
        }

        let known = root.index().all_locations()?;
        let mut conflicts = BTreeSet::new();
        for (id, record) in &available {
            for records in known.values() {
                if let Some(existing) = records.get(id) {
                    if existing.hash != record.hash {
                        conflicts.insert(id.clone());
                    }
                }
            }
        }
        if !conflicts.is_empty() {
            return Err(OutpackError::ConflictingMetadata {
                location: name.to_string(),
                packets: conflicts.into_iter().collect(),
                hint: format!(
                    "this is likely to be a serious problem; consider removing location '{name}' \
                     and re-adding it once its metadata has been corrected"
                ),
            }
            .into());
        }

        let metadata = root.index().all_metadata()?;
        let new_ids: Vec<String> = available
            .keys()
            .filter(|id| !metadata.contains_key(*id))
            .cloned()
            .collect();
        let texts = driver.metadata(&new_ids)?;
        let mut verified = Vec::with_capacity(new_ids.len());
        for id in &new_ids {
            let text = texts.get(id).ok_or_else(|| OutpackError::Transport {
                location: name.to_string(),
                reason: format!("no metadata returned for packet '{id}'"),
            })?;
            let expected = &available[id].hash;
            let found = hash_bytes(expected.algorithm_kind()?, text.as_bytes());
            validate(&found, expected, &format!("metadata for '{id}' from location '{name}'"))?;
            let meta = MetadataCore::from_json(text)
                .with_context(|| format!("metadata for '{id}' from location '{name}'"))?;
            if meta.id != *id {
                return Err(OutpackError::InvalidMetadata {
                    id: id.clone(),
                    reason: format!("location '{name}' returned metadata for '{}'", meta.id),
                }
                .into());
            }
            meta.validate()?;
            verified.push((id, text));
        }
        for (id, text) in verified {
            root.write_metadata(id, text)?;
        }

        let seen = known.get(name);
        for (id, record) in &available {
            if seen.is_some_and(|records| records.contains_key(id)) {
                continue;
            }
            root.write_location_record(name, record)?;
        }
        root.index().refresh()?;
        info!(location = name, total = available.len(), new = new_ids.len(), "pulled metadata");
        summaries.push(PullMetadataSummary {
            location: name.to_string(),
            total: available.len(),
            new: new_ids.len(),
        });
    }
    Ok(summaries)
}

/// `ids` plus everything they depend on, transitively, sorted.
///
/// Ids order by creation time and a dependency always predates its
/// dependents, so the sorted order is also a valid import order.
pub fn find_all_dependencies(root: &Root, ids: &[String]) -> Result<Vec<String>> {
    let mut seen = BTreeSet::new();
    let mut pending: Vec<String> = ids.to_vec();
    while let Some(id) = pending.pop() {
        if seen.contains(&id) {
            continue;
        }
        let meta = root.index().metadata(&id)?;
        pending.extend(
            meta.dependency_ids()
                .filter(|dep| !seen.contains(*dep))
                .map(str::to_string),
        );
        seen.insert(id);
    }
    Ok(seen.into_iter().collect())
}

/// A packet to unpack, and where it was found.
#[derive(Clone, Debug, PartialEq)]
pub struct PlannedPacket {
    pub id: String,
    pub location: String,
    /// Metadata hash claimed by `location`.
    pub hash: Hash,
}

/// One blob to fetch, with the first location known to hold its packet.
#[derive(Clone, Debug, PartialEq)]
pub struct PlannedFile {
    pub packet: Arc<MetadataCore>,
    pub file: PacketFile,
    pub location: String,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct PullPlan {
    pub packets: Vec<PlannedPacket>,
    /// Needed only as dependencies of the requested packets.
    pub extra: Vec<String>,
    /// Already unpacked.
    pub skip: Vec<String>,
    pub files: Vec<PlannedFile>,
}

/// Work out which packets and files a pull must fetch, and from where.
///
/// `files` restricts the file list to the given hashes.
pub fn build_pull_plan(
    root: &Root,
    ids: &[String],
    locations: Option<&[String]>,
    recursive: bool,
    files: Option<&BTreeSet<Hash>>,
) -> Result<PullPlan> {
    let requested: BTreeSet<&String> = ids.iter().collect();
    let closure = if recursive {
        find_all_dependencies(root, ids)?
    } else {
        for id in ids {
            root.index().metadata(id)?;
        }
        requested.iter().map(|id| (*id).clone()).collect()
    };

    let unpacked: BTreeSet<String> = root.index().unpacked()?.into_iter().collect();
    let (skip, needed): (Vec<String>, Vec<String>) =
        closure.into_iter().partition(|id| unpacked.contains(id));
    let extra = needed
        .iter()
        .filter(|id| !requested.contains(id))
        .cloned()
        .collect();

    let candidates = resolve_locations(root, locations)?;
    let known = root.index().all_locations()?;
    let mut packets = Vec::with_capacity(needed.len());
    let mut missing = Vec::new();
    for id in &needed {
        let source = candidates.iter().find_map(|location| {
            known
                .get(&location.name)
                .and_then(|records| records.get(id))
                .map(|record| (location.name.clone(), record.hash.clone()))
        });
        match source {
            Some((location, hash)) => packets.push(PlannedPacket {
                id: id.clone(),
                location,
                hash,
            }),
            None => missing.push(id.clone()),
        }
    }
    if !missing.is_empty() {
        let hint = match locations {
            Some(names) => format!(
                "looked in location(s) {}; try searching all locations",
                names.join(", ")
            ),
            None => "do you need to pull metadata from your locations first?".to_string(),
        };
        return Err(OutpackError::PackagesNotFound { ids: missing, hint }.into());
    }

    let mut queued = BTreeSet::new();
    let mut planned_files = Vec::new();
    for packet in &packets {
        let meta = root.index().metadata(&packet.id)?;
        for file in &meta.files {
            if files.is_some_and(|wanted| !wanted.contains(&file.hash)) {
                continue;
            }
            if queued.insert(file.hash.clone()) {
                planned_files.push(PlannedFile {
                    packet: Arc::clone(&meta),
                    file: file.clone(),
                    location: packet.location.clone(),
                });
            }
        }
    }

    Ok(PullPlan {
        packets,
        extra,
        skip,
        files: planned_files,
    })
}

/// A file store that lives only as long as this handle when the repository
/// has no persistent store of its own.
#[derive(Debug)]
pub enum ScopedStore<'a> {
    Persistent(&'a FileStore),
    Temporary { store: FileStore, dir: Option<TempDir> },
}

impl ScopedStore<'_> {
    #[must_use]
    pub fn store(&self) -> &FileStore {
        match self {
            Self::Persistent(store) => *store,
            Self::Temporary { store, .. } => store,
        }
    }

    fn is_temporary(&self) -> bool {
        matches!(self, Self::Temporary { .. })
    }
}

impl Drop for ScopedStore<'_> {
    fn drop(&mut self) {
        if let Self::Temporary { dir, .. } = self {
            if let Some(dir) = dir.take() {
                if let Err(err) = remove_dir_all_writable(dir.path()) {
                    warn!(path = %dir.path().display(), error = %err, "failed to remove temporary store");
                }
            }
        }
    }
}

/// Fetch every file in `plan` into a store.
pub fn pull_files<'a>(root: &'a Root, plan: &PullPlan) -> Result<ScopedStore<'a>> {
    let scoped = match root.files() {
        Some(store) => ScopedStore::Persistent(store),
        None => {
            let dir = tempfile::Builder::new()
                .prefix(".pull-")
                .tempdir_in(root.outpack_dir())
                .context("failed to create temporary file store")?;
            ScopedStore::Temporary {
                store: FileStore::open(dir.path())?,
                dir: Some(dir),
            }
        }
    };
    let store = scoped.store();

    let mut on_disk = 0usize;
    let mut pending: BTreeMap<&str, Vec<&PlannedFile>> = BTreeMap::new();
    for planned in &plan.files {
        let hash = &planned.file.hash;
        if store.exists(hash) {
            on_disk += 1;
            continue;
        }
        if scoped.is_temporary() {
            if let Some(path) = root.find_archive_file(hash, &[])? {
                store.put(&path, hash, false)?;
                on_disk += 1;
                continue;
            }
        }
        pending.entry(planned.location.as_str()).or_default().push(planned);
    }
    if on_disk > 0 {
        info!(files = on_disk, "found files already on disk");
    }

    for (name, files) in pending {
        let location = root
            .config()
            .location(name)
            .ok_or_else(|| OutpackError::UnknownLocation(name.to_string()))?;
        let driver = open_driver(root, location)?;
        info!(location = name, files = files.len(), "fetching files");
        for planned in files {
            let temp = store.scoped_temp_file()?;
            driver.fetch_file(&planned.packet, &planned.file, &temp)?;
            store.put(&temp, &planned.file.hash, true)?;
            debug!(location = name, path = %planned.file.path, "fetched file");
        }
    }
    Ok(scoped)
}

/// Unpack `ids` (and, when recursive, their dependencies) from remote
/// locations. Returns the ids that were unpacked.
///
/// `recursive` defaults to the repository's complete-tree setting.
pub fn pull_packet(
    root: &Root,
    ids: &[String],
    recursive: Option<bool>,
    options: &SearchOptions,
) -> Result<Vec<String>> {
    let complete = root.config().core.require_complete_tree;
    let recursive = match recursive {
        None => complete,
        Some(false) if complete => return Err(OutpackError::IncompleteTreeNotAllowed.into()),
        Some(recursive) => recursive,
    };
    if !options.allow_remote {
        return Err(OutpackError::RemoteAccessDisabled.into());
    }
    if options.pull_metadata {
        pull_metadata(root, options.location.as_deref())?;
    }

    let plan = build_pull_plan(root, ids, options.location.as_deref(), recursive, None)?;
    if !plan.extra.is_empty() {
        info!(packets = plan.extra.len(), "also pulling dependencies");
    }
    if !plan.skip.is_empty() {
        info!(packets = plan.skip.len(), "skipping packets that are already unpacked");
    }
    if plan.packets.is_empty() {
        return Ok(Vec::new());
    }

    let scoped = pull_files(root, &plan)?;
    for packet in &plan.packets {
        let meta = root.index().metadata(&packet.id)?;
        if let Some(archive) = root.archive() {
            archive.import_from_store(&meta, scoped.store())?;
        }
        root.mark_known(&packet.id, &packet.hash, LOCATION_LOCAL)?;
    }
    drop(scoped);
    root.index().refresh()?;

    let pulled: Vec<String> = plan.packets.into_iter().map(|packet| packet.id).collect();
    info!(packets = pulled.len(), "unpacked packets");
    Ok(pulled)
}
