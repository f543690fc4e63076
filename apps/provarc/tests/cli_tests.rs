//! CLI tests: argument parsing and end-to-end command runs.

// Allow unwrap and panic in tests - these are standard for test code
#![allow(clippy::unwrap_used, clippy::panic)]

use clap::Parser;
use provarc::cli::{ArchiveFormat, Cli, Commands, execute, resolve_profile};
use provarc_core::primitives::{NODE_TYPE, USER_TYPE};
use provarc_core::{LinkRow, Profile, ProvarcError, Record, Session};
use std::fs;
use std::path::{Path, PathBuf};
use tempfile::tempdir;

const PARENT: &str = "0a1b2c3d-0000-4000-8000-000000000001";
const CHILD: &str = "1a1b2c3d-0000-4000-8000-000000000002";

fn store_args(root: &Path) -> Vec<String> {
    vec![
        "provarc".to_string(),
        "-q".to_string(),
        "-D".to_string(),
        root.join("provarc.redb").display().to_string(),
        "-R".to_string(),
        root.join("repository").display().to_string(),
    ]
}

fn run(root: &Path, args: &[&str]) -> Result<(), ProvarcError> {
    let mut argv = store_args(root);
    argv.extend(args.iter().map(|a| (*a).to_string()));
    execute(Cli::try_parse_from(argv).unwrap())
}

/// Two linked nodes under `root`; the session is closed on return.
fn populate(root: &Path) {
    let session = Session::open(Profile::in_dir(root)).unwrap();
    let mut w = session.store().begin_write().unwrap();
    let user = w
        .insert_record(USER_TYPE, &Record::new().with("email", "cli@lab.org"))
        .unwrap();
    let mut ids = Vec::new();
    for uuid in [PARENT, CHILD] {
        let node = Record::new()
            .with("uuid", uuid)
            .with("node_type", "data.int")
            .with_ref("user", Some(user));
        ids.push(w.insert_record(NODE_TYPE, &node).unwrap());
        let payload = session.repository().ensure_subtree(uuid).unwrap();
        fs::write(payload.join("value"), uuid).unwrap();
    }
    w.insert_link(&LinkRow::new(ids[0], ids[1], "input")).unwrap();
    w.commit().unwrap();
}

fn node_count(root: &Path) -> usize {
    Session::open(Profile::in_dir(root)).unwrap().status().unwrap().records[NODE_TYPE]
}

// =============================================================================
// PARSING
// =============================================================================

#[test]
fn test_export_flags_parse() {
    let cli = Cli::try_parse_from([
        "provarc", "export", "-o", "out.zip", "--node", "a", "--node", "b", "--group", "g",
        "--format", "zip", "--no-parents", "--forbidden-license", "GPL",
    ])
    .unwrap();

    match cli.command {
        Some(Commands::Export {
            output,
            nodes,
            groups,
            format,
            no_parents,
            no_calc_outputs,
            forbidden_licenses,
            ..
        }) => {
            assert_eq!(output, PathBuf::from("out.zip"));
            assert_eq!(nodes, vec!["a", "b"]);
            assert_eq!(groups, vec!["g"]);
            assert_eq!(format, ArchiveFormat::Zip);
            assert!(no_parents);
            assert!(!no_calc_outputs);
            assert_eq!(forbidden_licenses, vec!["GPL"]);
        }
        other => panic!("unexpected command: {:?}", other),
    }
}

#[test]
fn test_profile_file_and_overrides() {
    let temp = tempdir().unwrap();
    let profile_path = temp.path().join("profile.toml");
    let mut profile = Profile::in_dir(temp.path());
    profile.batch_size = 50;
    profile.save(&profile_path).unwrap();

    let path = profile_path.display().to_string();
    let cli = Cli::try_parse_from(["provarc", "--profile", path.as_str(), "status"]).unwrap();
    assert_eq!(resolve_profile(&cli).unwrap(), profile);

    let cli = Cli::try_parse_from(["provarc", "--profile", path.as_str(), "-D", "x.redb", "status"])
        .unwrap();
    let resolved = resolve_profile(&cli).unwrap();
    assert_eq!(resolved.database, PathBuf::from("x.redb"));
    assert_eq!(resolved.batch_size, 50);
}

// =============================================================================
// COMMANDS
// =============================================================================

#[test]
fn test_init_refuses_existing_store() {
    let temp = tempdir().unwrap();
    run(temp.path(), &["init"]).unwrap();
    assert!(temp.path().join("provarc.redb").exists());

    assert!(matches!(
        run(temp.path(), &["init"]),
        Err(ProvarcError::OutputExists(_))
    ));
    run(temp.path(), &["init", "--force"]).unwrap();
}

#[test]
fn test_init_force_wipes_records() {
    let temp = tempdir().unwrap();
    populate(temp.path());
    assert_eq!(node_count(temp.path()), 2);

    run(temp.path(), &["init", "--force"]).unwrap();
    assert_eq!(node_count(temp.path()), 0);
}

#[test]
fn test_export_then_import() {
    let temp = tempdir().unwrap();
    let source = temp.path().join("source");
    let dest = temp.path().join("dest");
    populate(&source);

    let archive = temp.path().join("child.tar.gz");
    let out = archive.display().to_string();
    run(&source, &["export", "-o", out.as_str(), "--node", CHILD]).unwrap();
    assert!(archive.exists());

    run(&dest, &["--json-mode", "inspect", "-i", out.as_str()]).unwrap();
    run(&dest, &["import", "-i", out.as_str()]).unwrap();
    assert_eq!(node_count(&dest), 2);

    // second run only matches what is already there
    run(&dest, &["import", "-i", out.as_str()]).unwrap();
    assert_eq!(node_count(&dest), 2);
}

#[test]
fn test_zip_export_without_parents() {
    let temp = tempdir().unwrap();
    let source = temp.path().join("source");
    let dest = temp.path().join("dest");
    populate(&source);

    let archive = temp.path().join("child.zip");
    let out = archive.display().to_string();
    run(
        &source,
        &["export", "-o", out.as_str(), "--node", CHILD, "--format", "zip", "--no-parents"],
    )
    .unwrap();

    // the incoming link names a node the archive does not carry
    assert!(matches!(
        run(&dest, &["import", "-i", out.as_str()]),
        Err(ProvarcError::DanglingReference { .. })
    ));
    run(&dest, &["import", "-i", out.as_str(), "--ignore-unknown-nodes"]).unwrap();
    assert_eq!(node_count(&dest), 1);
}

#[test]
fn test_export_unknown_uuid() {
    let temp = tempdir().unwrap();
    populate(temp.path());
    let out = temp.path().join("x.tar.gz").display().to_string();

    let err = run(
        temp.path(),
        &["export", "-o", out.as_str(), "--node", "ffffffff-0000-4000-8000-000000000000"],
    )
    .unwrap_err();
    assert!(matches!(err, ProvarcError::DanglingReference { ref uuids } if uuids.len() == 1));
}

#[test]
fn test_import_missing_input() {
    let temp = tempdir().unwrap();
    let missing = temp.path().join("absent.tar.gz").display().to_string();
    assert!(matches!(
        run(temp.path(), &["import", "-i", missing.as_str()]),
        Err(ProvarcError::Io(_))
    ));
}
