mod common;

use agricoll_sync::selector::{select_latest, ExportSuffixes, FileCategory, SelectError};
use tempfile::TempDir;

use common::{partner_directory, MemoryDirectory};

#[test]
fn selects_and_downloads_newest_pair() {
    let tmp = TempDir::new().expect("tempdir");
    let mut remote = MemoryDirectory::new()
        .with_file("a.csv.encrypted", 100, b"old data".to_vec())
        .with_file("b.csv.encrypted", 200, b"new data".to_vec())
        .with_file("a.csv.key.encrypted", 100, b"old key".to_vec())
        .with_file("b.csv.key.encrypted", 200, b"new key".to_vec());
    let suffixes = ExportSuffixes::default();

    let (suffix, excludes) = suffixes.selection(FileCategory::Data);
    let data = select_latest(&mut remote, "/out", suffix, &excludes, &tmp.path().join("d"))
        .expect("select data");
    assert_eq!(data.remote.filename, "b.csv.encrypted");
    assert_eq!(data.remote_path, "/out/b.csv.encrypted");
    assert_eq!(data.bytes, 8);
    assert_eq!(std::fs::read(&data.local_path).expect("read"), b"new data");

    let (suffix, excludes) = suffixes.selection(FileCategory::Key);
    let key = select_latest(&mut remote, "/out", suffix, &excludes, &tmp.path().join("k"))
        .expect("select key");
    assert_eq!(key.remote.filename, "b.csv.key.encrypted");
    assert_eq!(std::fs::read(&key.local_path).expect("read"), b"new key");
}

#[test]
fn newer_key_file_never_wins_data_selection() {
    let tmp = TempDir::new().expect("tempdir");
    let mut remote = MemoryDirectory::new()
        .with_file("export.csv.encrypted", 100, b"data".to_vec())
        .with_file("export.csv.key.encrypted", 999, b"key".to_vec());
    let data = select_latest(
        &mut remote,
        ".",
        ".encrypted",
        &[".key.encrypted"],
        &tmp.path().join("d"),
    )
    .expect("select");
    assert_eq!(data.remote.filename, "export.csv.encrypted");
}

#[test]
fn no_candidates_is_not_found() {
    let tmp = TempDir::new().expect("tempdir");
    let mut remote = MemoryDirectory::new()
        .with_file("only.key.encrypted", 100, b"key".to_vec())
        .with_file("notes.txt", 200, b"x".to_vec());
    let local = tmp.path().join("d");
    let err = select_latest(&mut remote, ".", ".encrypted", &[".key.encrypted"], &local)
        .expect_err("nothing to select");
    assert!(matches!(err, SelectError::NotFound { .. }));
    assert!(!local.exists());
}

#[test]
fn failed_download_leaves_no_partial_file() {
    let tmp = TempDir::new().expect("tempdir");
    let mut remote = partner_directory();
    remote.fail_fetch = true;
    let local = tmp.path().join("d");
    let err = select_latest(&mut remote, ".", ".encrypted", &[".key.encrypted"], &local)
        .expect_err("fetch fails");
    assert!(matches!(err, SelectError::Channel(_)));
    assert!(!local.exists());
}
