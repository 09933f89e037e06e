//! Locations: named sources of packets, the drivers that talk to them, and
//! the pull and push protocols built on top.

mod http;
mod path;
mod pull;
mod push;
mod ssh;

use std::collections::{BTreeMap, BTreeSet};
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use fs4::FileExt;
use outpack_domain::{
    validate_location_name, Hash, Location, LocationKind, MetadataCore, OutpackError,
    PacketFile, PacketLocation, LOCATION_ORPHAN, LOCATION_RESERVED,
};
use tracing::info;

use crate::fs::remove_dir_all_writable;
use crate::root::Root;

pub use http::HttpDriver;
pub use path::PathDriver;
pub use pull::{
    build_pull_plan, find_all_dependencies, pull_files, pull_metadata, pull_packet,
    PlannedFile, PlannedPacket, PullMetadataSummary, PullPlan, ScopedStore,
};
pub use push::{push, PushSummary};

const LOCK_FILE: &str = "location.lock";

/// Operations every transport provides. Drivers release their resources
/// when dropped.
pub trait LocationDriver {
    /// Every packet the location claims to hold.
    fn list(&self) -> Result<BTreeMap<String, PacketLocation>>;

    /// Raw metadata text for each of `ids`.
    fn metadata(&self, ids: &[String]) -> Result<BTreeMap<String, String>>;

    /// Download `file` of `packet` to `dest`.
    fn fetch_file(&self, packet: &MetadataCore, file: &PacketFile, dest: &Path) -> Result<()>;

    /// The subset of `ids` the location does not have unpacked.
    fn list_unknown_packets(&self, ids: &[String]) -> Result<Vec<String>>;

    /// The subset of `hashes` the location does not have.
    fn list_unknown_files(&self, hashes: &[Hash]) -> Result<Vec<Hash>>;

    fn push_file(&self, path: &Path, hash: &Hash) -> Result<()>;

    fn push_metadata(&self, path: &Path, hash: &Hash) -> Result<()>;
}

/// Connect to `location` using the driver for its kind.
pub fn open_driver(root: &Root, location: &Location) -> Result<Box<dyn LocationDriver>> {
    match &location.kind {
        LocationKind::Local => Err(OutpackError::InvalidLocation {
            name: location.name.clone(),
            reason: "the local location has no driver".to_string(),
        }
        .into()),
        LocationKind::Path(args) => Ok(Box::new(PathDriver::open(&resolve_path(
            root, &args.path,
        ))?)),
        LocationKind::Http(args) => Ok(Box::new(HttpDriver::http(
            &location.name,
            &args.url,
            args.token.clone(),
        )?)),
        LocationKind::Packit(args) => Ok(Box::new(HttpDriver::packit(
            &location.name,
            &args.url,
            args.token.clone(),
        )?)),
        LocationKind::Ssh(args) => ssh::open(&location.name, args),
    }
}

fn resolve_path(root: &Root, path: &str) -> PathBuf {
    let path = Path::new(path);
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        root.path().join(path)
    }
}

/// Configured locations matching `selector`, minus the pseudo-locations.
pub(crate) fn resolve_locations(root: &Root, selector: Option<&[String]>) -> Result<Vec<Location>> {
    let config = root.config();
    match selector {
        None => Ok(config
            .location
            .iter()
            .filter(|location| !LOCATION_RESERVED.contains(&location.name.as_str()))
            .cloned()
            .collect()),
        Some(names) => {
            let mut found = Vec::new();
            for name in names {
                if LOCATION_RESERVED.contains(&name.as_str()) {
                    continue;
                }
                let location = config
                    .location(name)
                    .ok_or_else(|| OutpackError::UnknownLocation(name.clone()))?;
                found.push(location.clone());
            }
            Ok(found)
        }
    }
}

/// Configure a new location.
pub fn location_add(root: &mut Root, name: &str, kind: LocationKind) -> Result<()> {
    if LOCATION_RESERVED.contains(&name) {
        return Err(OutpackError::ReservedLocation(name.to_string()).into());
    }
    if root.config().location(name).is_some() {
        return Err(OutpackError::LocationExists(name.to_string()).into());
    }
    let location = Location::new(name, kind)?;
    if let LocationKind::Path(args) = &location.kind {
        Root::open(resolve_path(root, &args.path), false)
            .with_context(|| format!("location '{name}' does not point at a repository"))?;
    }
    let mut config = root.config().clone();
    config.location.push(location);
    root.save_config(config)?;
    info!(location = name, "added location");
    Ok(())
}

/// Forget a location and everything learned from it.
///
/// Records of packets that only this location knew about, and that are not
/// unpacked here, move to `orphan` so their metadata stays discoverable.
/// Other processes reading the index concurrently are not locked out; their
/// next refresh may see the directory partly removed.
pub fn location_remove(root: &mut Root, name: &str) -> Result<()> {
    if LOCATION_RESERVED.contains(&name) {
        return Err(OutpackError::ReservedLocation(name.to_string()).into());
    }
    if root.config().location(name).is_none() {
        return Err(OutpackError::UnknownLocation(name.to_string()).into());
    }
    let _lock = LocationLock::acquire(&root.outpack_dir())?;

    let all = root.index().all_locations()?;
    let elsewhere: BTreeSet<&String> = all
        .iter()
        .filter(|(location, _)| location.as_str() != name)
        .flat_map(|(_, records)| records.keys())
        .collect();
    let mut orphaned = 0usize;
    if let Some(records) = all.get(name) {
        for (id, record) in records {
            if elsewhere.contains(id) {
                continue;
            }
            root.write_location_record(LOCATION_ORPHAN, record)?;
            orphaned += 1;
        }
    }
    remove_dir_all_writable(&root.location_dir(name))?;

    let mut config = root.config().clone();
    config.location.retain(|location| location.name != name);
    root.save_config(config)?;
    root.index().rebuild()?;
    info!(location = name, orphaned, "removed location");
    Ok(())
}

pub fn location_rename(root: &mut Root, old: &str, new: &str) -> Result<()> {
    for name in [old, new] {
        if LOCATION_RESERVED.contains(&name) {
            return Err(OutpackError::ReservedLocation(name.to_string()).into());
        }
    }
    if root.config().location(old).is_none() {
        return Err(OutpackError::UnknownLocation(old.to_string()).into());
    }
    if root.config().location(new).is_some() {
        return Err(OutpackError::LocationExists(new.to_string()).into());
    }
    validate_location_name(new)?;
    let _lock = LocationLock::acquire(&root.outpack_dir())?;

    let from = root.location_dir(old);
    if from.exists() {
        let to = root.location_dir(new);
        fs::rename(&from, &to).with_context(|| {
            format!("failed to rename {} to {}", from.display(), to.display())
        })?;
    }
    let mut config = root.config().clone();
    for location in &mut config.location {
        if location.name == old {
            location.name = new.to_string();
        }
    }
    root.save_config(config)?;
    root.index().rebuild()?;
    info!(from = old, to = new, "renamed location");
    Ok(())
}

/// Configured location names, `local` first.
#[must_use]
pub fn location_list(root: &Root) -> Vec<String> {
    root.config().location_names()
}

/// Exclusive advisory lock over location directory changes, held until
/// dropped.
#[derive(Debug)]
struct LocationLock {
    file: File,
}

impl LocationLock {
    fn acquire(outpack_dir: &Path) -> Result<Self> {
        let path = outpack_dir.join(LOCK_FILE);
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(true)
            .open(&path)
            .with_context(|| format!("failed to open {}", path.display()))?;
        file.lock_exclusive()
            .with_context(|| format!("failed to lock {}", path.display()))?;
        Ok(Self { file })
    }
}

impl Drop for LocationLock {
    fn drop(&mut self) {
        let _ = self.file.unlock();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::root::InitOptions;
    use outpack_domain::{PathArgs, LOCATION_LOCAL};
    use tempfile::tempdir;

    fn path_kind(path: &Path) -> LocationKind {
        LocationKind::Path(PathArgs {
            path: path.display().to_string(),
        })
    }

    #[test]
    fn names_that_escape_the_location_directory_are_rejected() -> Result<()> {
        let temp = tempdir()?;
        let upstream = temp.path().join("upstream");
        Root::init(&upstream, InitOptions::default())?;
        let mut root = Root::init(temp.path().join("here"), InitOptions::default())?;

        for name in ["../metadata", "a/b", ".."] {
            let err = location_add(&mut root, name, path_kind(&upstream)).unwrap_err();
            assert!(matches!(
                err.downcast_ref::<OutpackError>(),
                Some(OutpackError::InvalidLocation { .. })
            ));
        }
        location_add(&mut root, "upstream", path_kind(&upstream))?;
        let err = location_rename(&mut root, "upstream", "../metadata").unwrap_err();
        assert!(matches!(
            err.downcast_ref::<OutpackError>(),
            Some(OutpackError::InvalidLocation { .. })
        ));
        assert_eq!(location_list(&root), vec!["local", "upstream"]);
        assert!(root.outpack_dir().join("metadata").is_dir());
        Ok(())
    }

    #[test]
    fn add_rename_and_remove() -> Result<()> {
        let temp = tempdir()?;
        let upstream = temp.path().join("upstream");
        Root::init(&upstream, InitOptions::default())?;
        let mut root = Root::init(temp.path().join("here"), InitOptions::default())?;

        location_add(&mut root, "upstream", path_kind(&upstream))?;
        assert_eq!(location_list(&root), vec!["local", "upstream"]);

        let err = location_add(&mut root, "upstream", path_kind(&upstream)).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<OutpackError>(),
            Some(OutpackError::LocationExists(_))
        ));
        let err = location_add(&mut root, "orphan", path_kind(&upstream)).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<OutpackError>(),
            Some(OutpackError::ReservedLocation(_))
        ));
        assert!(location_add(&mut root, "nowhere", path_kind(&temp.path().join("missing"))).is_err());

        location_rename(&mut root, "upstream", "origin")?;
        assert_eq!(location_list(&root), vec!["local", "origin"]);
        let reopened = Root::open(root.path(), false)?;
        assert_eq!(location_list(&reopened), vec!["local", "origin"]);

        location_remove(&mut root, "origin")?;
        assert_eq!(location_list(&root), vec!["local"]);
        let err = location_remove(&mut root, "origin").unwrap_err();
        assert!(matches!(
            err.downcast_ref::<OutpackError>(),
            Some(OutpackError::UnknownLocation(_))
        ));
        let err = location_remove(&mut root, "local").unwrap_err();
        assert!(matches!(
            err.downcast_ref::<OutpackError>(),
            Some(OutpackError::ReservedLocation(_))
        ));
        Ok(())
    }

    #[test]
    fn local_location_has_no_driver() -> Result<()> {
        let temp = tempdir()?;
        let root = Root::init(temp.path(), InitOptions::default())?;
        let local = root
            .config()
            .location(LOCATION_LOCAL)
            .cloned()
            .context("local location missing")?;
        assert!(open_driver(&root, &local).is_err());
        Ok(())
    }
}
