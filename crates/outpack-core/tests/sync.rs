use std::collections::BTreeSet;
use std::fs;
use std::panic;

use httptest::{matchers::request, responders::*, Expectation, Server};
use outpack_core::domain::{
    hash_bytes, HashAlgorithm, HttpArgs, LocationKind, OutpackError, PacketLocation,
    Parameters, LOCATION_ORPHAN,
};
use outpack_core::{
    build_pull_plan, location_add, location_remove, pull_metadata, pull_packet, push,
    InitOptions, Packet, PushSummary, Root, SearchOptions,
};
use serde_json::json;

mod common;

use common::{
    add_path_location, archive_options, create_dependent, create_packet, init_repo,
    outpack_error, remote_options, scratch_dir, store_options,
};

#[test]
fn failed_pull_leaves_no_unpacked_entry() {
    let temp = tempfile::tempdir().expect("tempdir");
    let src = init_repo(&temp, "src", archive_options());
    let mut dst = init_repo(&temp, "dst", store_options());
    let meta = create_packet(&src, "data", Parameters::new(), &[("data.txt", "42\n")]);
    add_path_location(&mut dst, "src", &src);
    pull_metadata(&dst, None).expect("pull metadata");

    // the only copy upstream no longer matches its recorded hash
    let upstream = src.archive().expect("archive").path_for(&meta, "data.txt");
    fs::write(&upstream, "41\n").expect("corrupt upstream");

    let err = pull_packet(&dst, &[meta.id.clone()], None, &remote_options("src")).unwrap_err();
    assert!(matches!(outpack_error(&err), OutpackError::HashNotFound(_)));
    assert!(dst.index().unpacked().expect("unpacked").is_empty());
    assert!(!dst.index().is_unpacked(&meta.id).expect("unpacked"));
    let store = dst.files().expect("file store");
    assert!(store.list().expect("list").is_empty());
}

#[test]
fn pull_requires_remote_access_and_known_packets() {
    let temp = tempfile::tempdir().expect("tempdir");
    let src = init_repo(&temp, "src", archive_options());
    let mut dst = init_repo(&temp, "dst", archive_options());
    let meta = create_packet(&src, "data", Parameters::new(), &[("data.txt", "x")]);
    add_path_location(&mut dst, "src", &src);

    let err = pull_packet(&dst, &[meta.id.clone()], None, &SearchOptions::default()).unwrap_err();
    assert!(matches!(outpack_error(&err), OutpackError::RemoteAccessDisabled));

    // metadata was never pulled, so the packet is unknown here
    let err = pull_packet(&dst, &[meta.id.clone()], None, &remote_options("src")).unwrap_err();
    assert!(matches!(outpack_error(&err), OutpackError::UnknownPacket(_)));

    let options = SearchOptions {
        pull_metadata: true,
        ..remote_options("src")
    };
    let pulled = pull_packet(&dst, &[meta.id.clone()], None, &options).expect("pull");
    assert_eq!(pulled, vec![meta.id]);
}

#[test]
fn complete_tree_pulls_dependencies() {
    let temp = tempfile::tempdir().expect("tempdir");
    let src = init_repo(&temp, "src", store_options());
    let mut dst = init_repo(
        &temp,
        "dst",
        InitOptions {
            require_complete_tree: true,
            ..store_options()
        },
    );
    let a = create_packet(&src, "a", Parameters::new(), &[("data.txt", "a")]);
    let d = create_dependent(&src, "d", &[&a.id]);
    add_path_location(&mut dst, "src", &src);
    pull_metadata(&dst, None).expect("pull metadata");

    let err = pull_packet(&dst, &[d.id.clone()], Some(false), &remote_options("src")).unwrap_err();
    assert!(matches!(outpack_error(&err), OutpackError::IncompleteTreeNotAllowed));
    assert!(outpack_error(&err).hint().is_some());

    let pulled = pull_packet(&dst, &[d.id.clone()], None, &remote_options("src")).expect("pull");
    assert_eq!(pulled, vec![a.id.clone(), d.id.clone()]);
    assert_eq!(dst.index().unpacked().expect("unpacked"), vec![a.id, d.id]);
}

#[test]
fn incomplete_tree_pull_is_not_recursive() {
    let temp = tempfile::tempdir().expect("tempdir");
    let src = init_repo(&temp, "src", store_options());
    let mut dst = init_repo(&temp, "dst", archive_options());
    let a = create_packet(&src, "a", Parameters::new(), &[("data.txt", "a")]);
    let d = create_dependent(&src, "d", &[&a.id]);
    add_path_location(&mut dst, "src", &src);
    pull_metadata(&dst, None).expect("pull metadata");

    let pulled = pull_packet(&dst, &[d.id.clone()], None, &remote_options("src")).expect("pull");
    assert_eq!(pulled, vec![d.id.clone()]);
    assert!(!dst.index().is_unpacked(&a.id).expect("unpacked"));

    let pulled = pull_packet(&dst, &[d.id.clone()], Some(true), &remote_options("src"))
        .expect("recursive pull");
    assert_eq!(pulled, vec![a.id]);
}

#[test]
fn remote_dependency_files_are_fetched_without_unpacking() {
    let temp = tempfile::tempdir().expect("tempdir");
    let src = init_repo(&temp, "src", store_options());
    let mut dst = init_repo(&temp, "dst", archive_options());
    let upstream = create_packet(&src, "data", Parameters::new(), &[("data.txt", "remote\n")]);
    add_path_location(&mut dst, "src", &src);
    pull_metadata(&dst, None).expect("pull metadata");

    let work = scratch_dir(&dst);
    let mut packet = Packet::start(&dst, &work, "report", Parameters::new()).expect("start");
    packet
        .use_dependency(
            "latest(name == 'data')",
            &[("input.txt", "data.txt")],
            &remote_options("src"),
        )
        .expect("use remote dependency");
    assert_eq!(fs::read_to_string(work.join("input.txt")).expect("read"), "remote\n");
    assert!(!dst.index().is_unpacked(&upstream.id).expect("unpacked"));

    let meta = packet.finalize(true).expect("finalize");
    assert_eq!(meta.depends[0].packet, upstream.id);
}

#[test]
fn conflicting_metadata_is_rejected() {
    let temp = tempfile::tempdir().expect("tempdir");
    let src = init_repo(&temp, "src", archive_options());
    let mut dst = init_repo(&temp, "dst", archive_options());
    let meta = create_packet(&src, "data", Parameters::new(), &[("data.txt", "x")]);
    add_path_location(&mut dst, "src", &src);
    pull_metadata(&dst, None).expect("pull metadata");

    // an earlier pull recorded a different metadata hash for the same id
    let record = PacketLocation::now(&meta.id, hash_bytes(HashAlgorithm::Sha256, b"different"));
    fs::write(
        dst.outpack_dir().join("location").join("src").join(&meta.id),
        serde_json::to_string(&record).expect("encode record"),
    )
    .expect("write record");

    let dst = Root::open(dst.path(), false).expect("reopen");
    let err = pull_metadata(&dst, None).unwrap_err();
    let err = outpack_error(&err);
    assert!(matches!(
        err,
        OutpackError::ConflictingMetadata { location, packets, .. }
            if location == "src" && packets == &vec![meta.id.clone()]
    ));
    assert!(err.hint().is_some_and(|hint| hint.contains("removing location 'src'")));
}

#[test]
fn push_uploads_closure_to_path_location() {
    for remote_init in [archive_options(), store_options()] {
        let temp = tempfile::tempdir().expect("tempdir");
        let mut here = init_repo(&temp, "here", store_options());
        let remote = init_repo(&temp, "remote", remote_init);
        let a = create_packet(&here, "a", Parameters::new(), &[("data.txt", "a")]);
        let b = create_packet(&here, "b", Parameters::new(), &[("data.txt", "b")]);
        let d = create_dependent(&here, "d", &[&a.id, &b.id]);
        add_path_location(&mut here, "remote", &remote);

        let summary = push(&here, &[d.id.clone()], "remote").expect("push");
        assert_eq!(summary, PushSummary { packets: 3, files: 2 });

        let remote = Root::open(remote.path(), false).expect("reopen remote");
        let unpacked: BTreeSet<String> =
            remote.index().unpacked().expect("unpacked").into_iter().collect();
        assert_eq!(unpacked, BTreeSet::from([a.id.clone(), b.id.clone(), d.id.clone()]));
        let out = scratch_dir(&remote);
        let copy_name = format!("{}.txt", b.id);
        remote
            .export_file(&d.id, &copy_name, "copy.txt", &out)
            .expect("export pushed file");
        assert_eq!(fs::read_to_string(out.join("copy.txt")).expect("read"), "b");

        let again = push(&here, &[d.id.clone()], "remote").expect("push again");
        assert_eq!(again, PushSummary::default());
    }
}

#[test]
fn push_rejects_unknown_and_reserved_locations() {
    let temp = tempfile::tempdir().expect("tempdir");
    let here = init_repo(&temp, "here", store_options());
    let meta = create_packet(&here, "a", Parameters::new(), &[("data.txt", "a")]);

    let err = push(&here, &[meta.id.clone()], "local").unwrap_err();
    assert!(matches!(outpack_error(&err), OutpackError::ReservedLocation(_)));
    let err = push(&here, &[meta.id], "nowhere").unwrap_err();
    assert!(matches!(outpack_error(&err), OutpackError::UnknownLocation(_)));
}

#[test]
fn removing_location_orphans_packets_known_only_there() {
    let temp = tempfile::tempdir().expect("tempdir");
    let src = init_repo(&temp, "src", store_options());
    let mut dst = init_repo(&temp, "dst", archive_options());
    let kept = create_packet(&src, "a", Parameters::new(), &[("data.txt", "a")]);
    let remote_only = create_packet(&src, "b", Parameters::new(), &[("data.txt", "b")]);
    add_path_location(&mut dst, "src", &src);
    pull_metadata(&dst, None).expect("pull metadata");
    pull_packet(&dst, &[kept.id.clone()], None, &remote_options("src")).expect("pull");

    location_remove(&mut dst, "src").expect("remove location");

    let orphaned = dst.index().location(LOCATION_ORPHAN).expect("orphan records");
    assert_eq!(orphaned.keys().cloned().collect::<Vec<_>>(), vec![remote_only.id.clone()]);
    assert!(dst.index().location("src").expect("records").is_empty());
    assert!(!dst.outpack_dir().join("location").join("src").exists());
    assert!(dst.index().is_unpacked(&kept.id).expect("unpacked"));
    dst.index().metadata(&remote_only.id).expect("metadata stays known");

    let err = search_remote_after_removal(&dst).unwrap_err();
    assert!(matches!(outpack_error(&err), OutpackError::UnknownLocation(_)));
}

fn search_remote_after_removal(root: &Root) -> anyhow::Result<BTreeSet<String>> {
    outpack_core::search(root, "latest", &remote_options("src"), None)
}

#[test]
fn corrupted_archive_copies_are_never_exported() {
    let temp = tempfile::tempdir().expect("tempdir");
    let root = init_repo(&temp, "repo", archive_options());
    let first = create_packet(&root, "a", Parameters::new(), &[("data.txt", "shared\n")]);
    let hash = hash_bytes(HashAlgorithm::Sha256, b"shared\n");
    let archive = root.archive().expect("archive");
    let original = archive.path_for(&first, "data.txt");
    fs::write(&original, "shared").expect("truncate");

    assert_eq!(root.find_archive_file(&hash, &[]).expect("find"), None);
    let out = scratch_dir(&root);
    let err = root.export_file(&first.id, "data.txt", "copy.txt", &out).unwrap_err();
    assert!(matches!(outpack_error(&err), OutpackError::FileNotFound { .. }));
    assert!(!out.join("copy.txt").exists());

    let second = create_packet(&root, "b", Parameters::new(), &[("data.txt", "shared\n")]);
    let found = root.find_archive_file(&hash, &[first.id.as_str()]).expect("find");
    assert_eq!(found, Some(archive.path_for(&second, "data.txt")));
    root.export_file(&first.id, "data.txt", "copy.txt", &out).expect("export from other copy");
    assert_eq!(fs::read_to_string(out.join("copy.txt")).expect("read"), "shared\n");
}

#[test]
fn index_refresh_is_monotonic_and_rebuild_forgets() {
    let temp = tempfile::tempdir().expect("tempdir");
    let writer = init_repo(&temp, "repo", archive_options());
    let reader = Root::open(writer.path(), false).expect("open reader");
    let rebuilt = Root::open(writer.path(), false).expect("open second reader");

    let mut created = Vec::new();
    for n in 0..3 {
        let contents = n.to_string();
        created.push(create_packet(&writer, "data", Parameters::new(), &[("data.txt", contents.as_str())]).id);
        reader.index().refresh().expect("refresh");
    }
    let fresh = Root::open(writer.path(), false).expect("open fresh");
    assert_eq!(reader.index().unpacked().expect("unpacked"), created);
    assert_eq!(fresh.index().unpacked().expect("unpacked"), created);
    assert_eq!(rebuilt.index().unpacked().expect("unpacked"), created);

    let removed = created.remove(0);
    fs::remove_file(
        writer.outpack_dir().join("location").join("local").join(&removed),
    )
    .expect("remove record");

    reader.index().refresh().expect("refresh");
    assert!(reader.index().is_unpacked(&removed).expect("unpacked"));
    rebuilt.index().rebuild().expect("rebuild");
    assert!(!rebuilt.index().is_unpacked(&removed).expect("unpacked"));
    assert_eq!(rebuilt.index().unpacked().expect("unpacked"), created);
}

fn http_server() -> Option<Server> {
    match panic::catch_unwind(Server::run) {
        Ok(server) => Some(server),
        Err(_) => {
            eprintln!("skipping http test (httptest server unavailable)");
            None
        }
    }
}

/// A repository with one http location, `server`, pointing at `server`.
fn http_client(temp: &tempfile::TempDir, server: &Server) -> Root {
    let mut root = init_repo(temp, "repo", archive_options());
    location_add(
        &mut root,
        "server",
        LocationKind::Http(HttpArgs {
            url: server.url_str("/"),
            token: None,
        }),
    )
    .expect("add http location");
    root
}

fn serve_listing(server: &Server, packet: &str, text: &str) {
    let hash = hash_bytes(HashAlgorithm::Sha256, text.as_bytes());
    server.expect(
        Expectation::matching(request::method_path("GET", "/metadata/list")).respond_with(
            json_encoded(json!({
                "status": "success",
                "errors": null,
                "data": [{"packet": packet, "time": 1_704_110_400.5, "hash": hash.to_string()}]
            })),
        ),
    );
}

/// Everything under `dir`, relative to it.
fn tree(dir: &std::path::Path) -> BTreeSet<String> {
    walkdir::WalkDir::new(dir)
        .min_depth(1)
        .into_iter()
        .filter_map(Result::ok)
        .filter_map(|entry| {
            entry
                .path()
                .strip_prefix(dir)
                .ok()
                .map(|path| path.display().to_string())
        })
        .collect()
}

#[test]
fn remote_ids_that_are_not_packet_ids_are_rejected() {
    let Some(server) = http_server() else {
        return;
    };
    let temp = tempfile::tempdir().expect("tempdir");
    let root = http_client(&temp, &server);
    serve_listing(&server, "../../../escaped", "{}");
    let before = tree(temp.path());

    let err = pull_metadata(&root, None).unwrap_err();
    assert!(matches!(outpack_error(&err), OutpackError::MalformedId(id) if id == "../../../escaped"));
    assert_eq!(tree(temp.path()), before);
}

#[test]
fn remote_metadata_with_unsafe_paths_is_not_stored() {
    let Some(server) = http_server() else {
        return;
    };
    let temp = tempfile::tempdir().expect("tempdir");
    let root = http_client(&temp, &server);
    let id = "20240101-120000-0000abcd";
    let text = json!({
        "schema_version": "0.1.1",
        "id": id,
        "name": "data",
        "parameters": {},
        "time": {"start": 1.0, "end": 2.0},
        "files": [{
            "path": "../../outside.txt",
            "size": 1,
            "hash": hash_bytes(HashAlgorithm::Sha256, b"x").to_string()
        }],
        "depends": []
    })
    .to_string();
    serve_listing(&server, id, &text);
    server.expect(
        Expectation::matching(request::method_path("GET", format!("/metadata/{id}/text")))
            .respond_with(status_code(200).body(text.clone())),
    );
    let before = tree(temp.path());

    let err = pull_metadata(&root, None).unwrap_err();
    assert!(matches!(outpack_error(&err), OutpackError::InvalidMetadata { .. }));
    assert_eq!(tree(temp.path()), before);
    assert!(root.index().location("server").expect("records").is_empty());
}

#[test]
fn remote_metadata_must_match_its_listed_hash() {
    let Some(server) = http_server() else {
        return;
    };
    let temp = tempfile::tempdir().expect("tempdir");
    let root = http_client(&temp, &server);
    let id = "20240101-120000-0000abcd";
    serve_listing(&server, id, "{\"claimed\": true}");
    server.expect(
        Expectation::matching(request::method_path("GET", format!("/metadata/{id}/text")))
            .respond_with(status_code(200).body("{\"served\": true}")),
    );

    let err = pull_metadata(&root, None).unwrap_err();
    match outpack_error(&err) {
        OutpackError::HashMismatch { expected, found, .. } => {
            assert_eq!(*expected, hash_bytes(HashAlgorithm::Sha256, b"{\"claimed\": true}"));
            assert_eq!(*found, hash_bytes(HashAlgorithm::Sha256, b"{\"served\": true}"));
        }
        other => panic!("unexpected error: {other:?}"),
    }
    assert!(!root.outpack_dir().join("metadata").join(id).exists());
}

#[test]
fn plan_reports_packets_missing_from_searched_locations() {
    let temp = tempfile::tempdir().expect("tempdir");
    let first = init_repo(&temp, "first", archive_options());
    let second = init_repo(&temp, "second", archive_options());
    let mut dst = init_repo(&temp, "dst", archive_options());
    let meta = create_packet(&first, "data", Parameters::new(), &[("data.txt", "x")]);
    add_path_location(&mut dst, "first", &first);
    add_path_location(&mut dst, "second", &second);
    pull_metadata(&dst, None).expect("pull metadata");

    let only_second = vec!["second".to_string()];
    let err = build_pull_plan(&dst, &[meta.id.clone()], Some(&only_second), false, None)
        .unwrap_err();
    match outpack_error(&err) {
        OutpackError::PackagesNotFound { ids, hint } => {
            assert_eq!(ids, &vec![meta.id.clone()]);
            assert!(hint.contains("second"), "{hint}");
        }
        other => panic!("unexpected error: {other:?}"),
    }

    let plan = build_pull_plan(&dst, &[meta.id.clone()], None, false, None).expect("plan");
    assert_eq!(plan.packets[0].location, "first");
}

#[test]
fn push_fails_when_a_file_has_no_valid_local_copy() {
    let temp = tempfile::tempdir().expect("tempdir");
    let mut here = init_repo(&temp, "here", archive_options());
    let remote = init_repo(&temp, "remote", store_options());
    let meta = create_packet(&here, "a", Parameters::new(), &[("data.txt", "a\n")]);
    add_path_location(&mut here, "remote", &remote);
    let copy = here.archive().expect("archive").path_for(&meta, "data.txt");
    fs::write(&copy, "tampered\n").expect("corrupt archive copy");

    let err = push(&here, &[meta.id.clone()], "remote").unwrap_err();
    assert!(matches!(
        outpack_error(&err),
        OutpackError::CannotPush { packet, path, .. } if packet == &meta.id && path == "data.txt"
    ));
    let remote = Root::open(remote.path(), false).expect("reopen remote");
    assert!(remote.index().unpacked().expect("unpacked").is_empty());
}
