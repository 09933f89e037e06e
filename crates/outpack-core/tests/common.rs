#![allow(dead_code)]

use std::{
    fs,
    path::{Path, PathBuf},
};

use outpack_core::domain::{
    new_id, LocationKind, MetadataCore, OutpackError, ParameterValue, Parameters, PathArgs,
};
use outpack_core::{location_add, InitOptions, Packet, Root, SearchOptions};
use tempfile::TempDir;

pub fn store_options() -> InitOptions {
    InitOptions {
        use_file_store: true,
        ..InitOptions::default()
    }
}

pub fn archive_options() -> InitOptions {
    InitOptions::default()
}

pub fn init_repo(temp: &TempDir, name: &str, options: InitOptions) -> Root {
    Root::init(temp.path().join(name), options).expect("init repository")
}

pub fn params(pairs: &[(&str, ParameterValue)]) -> Parameters {
    pairs
        .iter()
        .map(|(key, value)| ((*key).to_string(), value.clone()))
        .collect()
}

/// Commit a packet called `name` holding `files` (path, contents).
pub fn create_packet(
    root: &Root,
    name: &str,
    parameters: Parameters,
    files: &[(&str, &str)],
) -> MetadataCore {
    let src = scratch_dir(root);
    write_files(&src, files);
    let mut packet = Packet::start(root, &src, name, parameters).expect("start packet");
    let meta = packet.finalize(true).expect("finalize packet");
    fs::remove_dir_all(&src).expect("remove scratch dir");
    meta
}

/// Commit a packet that copies `data.txt` from each of `upstream`.
pub fn create_dependent(root: &Root, name: &str, upstream: &[impl AsRef<str>]) -> MetadataCore {
    let src = scratch_dir(root);
    let mut packet = Packet::start(root, &src, name, Parameters::new()).expect("start packet");
    for id in upstream {
        let id = id.as_ref();
        let here = format!("{id}.txt");
        packet
            .use_dependency(id, &[(here.as_str(), "data.txt")], &SearchOptions::default())
            .expect("use dependency");
    }
    let meta = packet.finalize(true).expect("finalize packet");
    fs::remove_dir_all(&src).expect("remove scratch dir");
    meta
}

pub fn scratch_dir(root: &Root) -> PathBuf {
    let parent = root.path().parent().expect("repository has a parent");
    let dir = parent.join(format!("src-{}", new_id()));
    fs::create_dir_all(&dir).expect("scratch dir");
    dir
}

pub fn write_files(dir: &Path, files: &[(&str, &str)]) {
    for (path, contents) in files {
        let dest = dir.join(path);
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent).expect("create parent");
        }
        fs::write(dest, contents).expect("write file");
    }
}

pub fn add_path_location(root: &mut Root, name: &str, target: &Root) {
    location_add(
        root,
        name,
        LocationKind::Path(PathArgs {
            path: target.path().display().to_string(),
        }),
    )
    .expect("add location");
}

pub fn remote_options(location: &str) -> SearchOptions {
    SearchOptions {
        location: Some(vec![location.to_string()]),
        allow_remote: true,
        pull_metadata: false,
    }
}

pub fn outpack_error(err: &anyhow::Error) -> &OutpackError {
    err.downcast_ref::<OutpackError>()
        .unwrap_or_else(|| panic!("expected an outpack error, got {err:#}"))
}
