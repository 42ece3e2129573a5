//! Tests for the shared pre-run pipeline.
//!
//! Drives `EngineCommon::run_init` against a throwaway container and checks
//! user resolution, port policy and volume assembly without spawning a
//! backend.

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;
use std::sync::Arc;

use udock::repository::{ContainerMeta, ImageConfig};
use udock::{
    CONTAINER_ROOT_DIR, Config, EngineCommon, Error, HostInfo, LocalRepository, ModeTag, RunOptions,
};

struct Fixture {
    _topdir: tempfile::TempDir,
    config: Arc<Config>,
    repo: Arc<LocalRepository>,
    root: PathBuf,
}

fn fixture() -> Fixture {
    let topdir = tempfile::tempdir().unwrap();
    let mut config = Config::with_topdir(topdir.path());
    config.tmpdir = topdir.path().join("tmp");
    config.sysdirs_list = Vec::new();
    fs::create_dir_all(&config.tmpdir).unwrap();

    let repo = LocalRepository::new(&config);
    repo.setup().unwrap();
    let root = repo.create_container("c1").unwrap().join(CONTAINER_ROOT_DIR);
    for dir in ["bin", "etc", "root"] {
        fs::create_dir_all(root.join(dir)).unwrap();
    }
    fs::write(root.join("bin/sh"), "#!/bin/sh\n").unwrap();
    fs::set_permissions(root.join("bin/sh"), fs::Permissions::from_mode(0o755)).unwrap();
    fs::write(
        root.join("etc/passwd"),
        "root:x:0:0:root:/root:/bin/sh\nwww:x:33:33:web:/var/www:/usr/sbin/nologin\n",
    )
    .unwrap();
    fs::write(root.join("etc/group"), "root:x:0:\nwww:x:33:\n").unwrap();

    let meta = ContainerMeta::from_config(ImageConfig {
        cmd: Some(vec!["/bin/sh".into()]),
        exposed_ports: None,
        ..Default::default()
    });
    repo.save_container_meta("c1", &meta).unwrap();

    Fixture {
        _topdir: topdir,
        config: Arc::new(config),
        repo: Arc::new(repo),
        root,
    }
}

fn common(fx: &Fixture, mode: ModeTag, host_uid: u32, opt: RunOptions) -> EngineCommon {
    let host = HostInfo {
        uid: host_uid,
        gid: host_uid,
        groups: Vec::new(),
        username: "hostuser".to_string(),
        ..HostInfo::detect()
    };
    EngineCommon::new(Arc::clone(&fx.config), Arc::new(host), fx.repo.clone(), mode, opt)
}

// =============================================================================
// User Tests
// =============================================================================

#[test]
fn test_default_user_is_container_root() {
    let fx = fixture();
    let mut ec = common(&fx, ModeTag::P1, 1000, RunOptions::default());

    let root = ec.run_init("c1").unwrap();

    assert_eq!(root, fx.root);
    assert_eq!(ec.opt.user, "root");
    assert_eq!(ec.opt.uid, Some(0));
    assert_eq!(ec.opt.home, "/root");
    assert_eq!(ec.opt.cwd, "/root");
    assert_eq!(ec.exec_path, "/bin/sh");
    assert_eq!(ec.opt.env.get("PATH"), Some(fx.config.root_path.as_str()));
}

#[test]
fn test_named_user_from_container_passwd() {
    let fx = fixture();
    let opt = RunOptions {
        user: "www".into(),
        cwd: "/".into(),
        ..Default::default()
    };
    let mut ec = common(&fx, ModeTag::P1, 1000, opt);

    ec.run_init("c1").unwrap();

    assert_eq!(ec.opt.uid, Some(33));
    assert_eq!(ec.opt.gid, Some(33));
    assert_eq!(ec.opt.home, "/var/www");
    assert!(!ec.opt.hostauth);
}

#[test]
fn test_unknown_uid_gets_generated_account() {
    let fx = fixture();
    let opt = RunOptions {
        user: "1234".into(),
        cwd: "/".into(),
        ..Default::default()
    };
    let mut ec = common(&fx, ModeTag::P1, 1000, opt);

    ec.run_init("c1").unwrap();

    assert_eq!(ec.opt.user, "udoc1234");
    assert_eq!(ec.opt.home, "/home/udoc1234");
    assert!(ec.opt.hostauth);
    let passwd_binding = ec
        .opt
        .vol
        .iter()
        .find(|v| v.container_path == "/etc/passwd")
        .expect("generated passwd must be bound");
    let generated = fs::read_to_string(&passwd_binding.host_path).unwrap();
    assert!(generated.contains("udoc1234:x:1234:1234:"));
    assert!(generated.starts_with("root:x:0:0:"), "container accounts are kept");
}

#[test]
fn test_unknown_name_fails() {
    let fx = fixture();
    let opt = RunOptions {
        user: "ghost".into(),
        ..Default::default()
    };
    let mut ec = common(&fx, ModeTag::P1, 1000, opt);
    assert!(matches!(ec.run_init("c1"), Err(Error::UserNotFound(_))));
}

#[test]
fn test_hostauth_and_containerauth_conflict() {
    let fx = fixture();
    let opt = RunOptions {
        hostauth: true,
        containerauth: true,
        ..Default::default()
    };
    let mut ec = common(&fx, ModeTag::P1, 1000, opt);
    let err = ec.run_init("c1").unwrap_err();
    assert!(matches!(err, Error::InvalidOption(_)));
    assert_eq!(err.exit_code(), 3);
}

#[test]
fn test_fakechroot_runs_as_invoking_user() {
    let fx = fixture();
    let opt = RunOptions {
        user: "www".into(),
        cwd: "/".into(),
        ..Default::default()
    };
    let mut ec = common(&fx, ModeTag::F1, 4321, opt);

    ec.run_init("c1").unwrap();

    assert_eq!(ec.opt.uid, Some(4321));
    assert_eq!(ec.opt.gid, Some(4321));
    assert_eq!(ec.opt.user, "hostuser");
}

// =============================================================================
// Port Policy Tests
// =============================================================================

#[test]
fn test_privileged_port_rejected_for_user() {
    let fx = fixture();
    let opt = RunOptions {
        portsexp: vec!["80/tcp".into()],
        ..Default::default()
    };
    let mut ec = common(&fx, ModeTag::P1, 1000, opt);
    assert!(matches!(ec.run_init("c1"), Err(Error::PrivilegedPort { port: 80 })));
}

#[test]
fn test_privileged_port_remapped() {
    let fx = fixture();
    let opt = RunOptions {
        portsexp: vec!["80/tcp".into()],
        portsmap: vec!["8080:80".into()],
        ..Default::default()
    };
    let mut ec = common(&fx, ModeTag::P1, 1000, opt);
    assert!(ec.run_init("c1").is_ok());
}

#[test]
fn test_privileged_port_allowed_for_root() {
    let fx = fixture();
    let opt = RunOptions {
        portsexp: vec!["22".into()],
        ..Default::default()
    };
    let mut ec = common(&fx, ModeTag::P1, 0, opt);
    assert!(ec.run_init("c1").is_ok());
}

// =============================================================================
// Volume Tests
// =============================================================================

#[test]
fn test_singularity_creates_mount_points() {
    let fx = fixture();
    let data = tempfile::tempdir().unwrap();
    let mut opt = RunOptions::default();
    opt.add_volume(&format!("{}:/data", data.path().display())).unwrap();
    let mut ec = common(&fx, ModeTag::S1, 1000, opt);

    ec.run_init("c1").unwrap();

    assert!(fx.root.join("data").is_dir());
    assert_eq!(ec.is_mountpoint("/data"), Some(data.path().to_string_lossy().into_owned()));
}

#[test]
fn test_proot_creates_no_mount_points() {
    let fx = fixture();
    let data = tempfile::tempdir().unwrap();
    let mut opt = RunOptions::default();
    opt.add_volume(&format!("{}:/data", data.path().display())).unwrap();
    let mut ec = common(&fx, ModeTag::P1, 1000, opt);

    ec.run_init("c1").unwrap();

    assert!(!fx.root.join("data").exists());
}
