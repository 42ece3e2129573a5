//! Tests for file binding.
//!
//! Runs the substitute and restore cycle against a throwaway container
//! tree and checks the container ends up exactly as it started.

use std::fs;
use std::os::unix::fs::symlink;
use std::path::Path;

use udock::filebind::{FileBind, decode_path, encode_path};
use udock::{BIND_HOST_DIR, CONTAINER_ROOT_DIR};

fn container(dir: &Path) -> std::path::PathBuf {
    let root = dir.join(CONTAINER_ROOT_DIR);
    fs::create_dir_all(root.join("etc")).unwrap();
    fs::write(root.join("etc/passwd"), "root:x:0:0:root:/root:/bin/sh\n").unwrap();
    fs::write(root.join("etc/hosts.real"), "127.0.0.1 localhost\n").unwrap();
    symlink("hosts.real", root.join("etc/hosts")).unwrap();
    root
}

// =============================================================================
// Encoding Tests
// =============================================================================

#[test]
fn test_encoding_round_trip_odd_names() {
    for path in ["/etc/passwd", "/a#b/c%d", "/%23", "/x/#/y", "/ünï/çødé"] {
        let encoded = encode_path(path);
        assert!(!encoded.contains('/'), "{} must flatten", path);
        assert_eq!(decode_path(&encoded), path);
    }
}

// =============================================================================
// Start / Restore Tests
// =============================================================================

#[test]
fn test_start_substitutes_and_seeds_content() {
    let dir = tempfile::tempdir().unwrap();
    let tmp = tempfile::tempdir().unwrap();
    let root = container(dir.path());

    let mut fb = FileBind::new(dir.path(), tmp.path());
    let mappings = fb.start(&["/etc/passwd".to_string(), "/etc/hosts".to_string()]).unwrap();

    assert_eq!(mappings.len(), 2);
    assert!(mappings[0].existed && !mappings[0].was_symlink);
    assert!(mappings[1].existed && mappings[1].was_symlink);

    let link = fs::read_link(root.join("etc/passwd")).unwrap();
    assert_eq!(link.to_string_lossy(), format!("{}/{}", BIND_HOST_DIR, encode_path("/etc/passwd")));

    let seeded = fb.get_path("/etc/passwd").unwrap();
    assert_eq!(fs::read_to_string(seeded).unwrap(), "root:x:0:0:root:/root:/bin/sh\n");
    let hosts = fb.get_path("/etc/hosts").unwrap();
    assert_eq!(fs::read_to_string(hosts).unwrap(), "127.0.0.1 localhost\n");
}

#[test]
fn test_add_file_replaces_substitute() {
    let dir = tempfile::tempdir().unwrap();
    let tmp = tempfile::tempdir().unwrap();
    container(dir.path());
    let replacement = tmp.path().join("my_passwd");
    fs::write(&replacement, "user:x:1000:1000::/home/user:/bin/sh\n").unwrap();

    let mut fb = FileBind::new(dir.path(), tmp.path());
    fb.start(&["/etc/passwd".to_string()]).unwrap();
    fb.add_file(&replacement, "/etc/passwd").unwrap();

    let substitute = fb.get_path("/etc/passwd").unwrap();
    assert!(fs::read_to_string(substitute).unwrap().starts_with("user:"));
}

#[test]
fn test_restore_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let tmp = tempfile::tempdir().unwrap();
    let root = container(dir.path());

    let mut fb = FileBind::new(dir.path(), tmp.path());
    fb.start(&[
        "/etc/passwd".to_string(),
        "/etc/hosts".to_string(),
        "/etc/new.conf".to_string(),
    ])
    .unwrap();
    fb.finish();

    let mut fb = FileBind::new(dir.path(), tmp.path());
    fb.restore().unwrap();

    assert_eq!(
        fs::read_to_string(root.join("etc/passwd")).unwrap(),
        "root:x:0:0:root:/root:/bin/sh\n"
    );
    assert!(!root.join("etc/passwd").is_symlink());
    assert_eq!(fs::read_link(root.join("etc/hosts")).unwrap().to_string_lossy(), "hosts.real");
    assert!(fs::symlink_metadata(root.join("etc/new.conf")).is_err());
    assert!(!root.join(BIND_HOST_DIR.trim_start_matches('/')).exists());
    assert!(!fb.orig_dir().exists());
}

#[test]
fn test_second_start_keeps_first_originals() {
    let dir = tempfile::tempdir().unwrap();
    let tmp = tempfile::tempdir().unwrap();
    let root = container(dir.path());

    let mut fb = FileBind::new(dir.path(), tmp.path());
    fb.start(&["/etc/passwd".to_string()]).unwrap();
    fb.finish();
    let mappings = fb.start(&["/etc/passwd".to_string()]).unwrap();
    assert!(mappings[0].existed, "manifest entry must be reused");
    fb.finish();

    fb.restore().unwrap();
    assert!(root.join("etc/passwd").is_file());
    assert!(!root.join("etc/passwd").is_symlink());
}

#[test]
fn test_restore_without_binding_is_noop() {
    let dir = tempfile::tempdir().unwrap();
    let tmp = tempfile::tempdir().unwrap();
    let root = container(dir.path());

    FileBind::new(dir.path(), tmp.path()).restore().unwrap();
    assert!(root.join("etc/passwd").is_file());
}
