use std::collections::BTreeMap;
use std::fs;
use std::sync::Arc;

use anyhow::{Context, Result};
use outpack_domain::{hash_bytes, Hash, MetadataCore, OutpackError, PacketFile, LOCATION_RESERVED};
use tracing::info;

use super::{find_all_dependencies, open_driver};
use crate::root::Root;

/// What a push uploaded.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PushSummary {
    pub packets: usize,
    pub files: usize,
}

/// Send `ids` and all of their dependencies to `location`, uploading only
/// what it does not already have. Files go first so the remote never sees
/// metadata for a packet whose files are missing.
pub fn push(root: &Root, ids: &[String], location: &str) -> Result<PushSummary> {
    if LOCATION_RESERVED.contains(&location) {
        return Err(OutpackError::ReservedLocation(location.to_string()).into());
    }
    let target = root
        .config()
        .location(location)
        .ok_or_else(|| OutpackError::UnknownLocation(location.to_string()))?;
    let closure = find_all_dependencies(root, ids)?;
    let driver = open_driver(root, target)?;

    let packets = driver.list_unknown_packets(&closure)?;
    if packets.is_empty() {
        info!(location, "nothing to push");
        return Ok(PushSummary::default());
    }

    let mut owners: BTreeMap<Hash, (Arc<MetadataCore>, PacketFile)> = BTreeMap::new();
    let mut hashes = Vec::new();
    for id in &packets {
        let meta = root.index().metadata(id)?;
        for file in &meta.files {
            if !owners.contains_key(&file.hash) {
                hashes.push(file.hash.clone());
                owners.insert(file.hash.clone(), (Arc::clone(&meta), file.clone()));
            }
        }
    }

    let files = driver.list_unknown_files(&hashes)?;
    for hash in &files {
        let Some((meta, file)) = owners.get(hash) else {
            continue;
        };
        let local = root.files().map(|store| store.path_for(hash)).filter(|path| path.is_file());
        let path = match local {
            Some(path) => path,
            None => root
                .find_archive_file(hash, &[meta.id.as_str()])?
                .ok_or_else(|| OutpackError::CannotPush {
                    packet: meta.id.clone(),
                    path: file.path.clone(),
                    hash: hash.clone(),
                })?,
        };
        driver.push_file(&path, hash)?;
    }

    for id in &packets {
        let path = root.metadata_path(id);
        let text = fs::read(&path).with_context(|| format!("failed to read {}", path.display()))?;
        let hash = hash_bytes(root.hash_algorithm(), &text);
        driver.push_metadata(&path, &hash)?;
    }

    let summary = PushSummary {
        packets: packets.len(),
        files: files.len(),
    };
    info!(location, packets = summary.packets, files = summary.files, "pushed packets");
    Ok(summary)
}
