//! # Runc Engine - Modes R1, R2 and R3
//!
//! Runs the container with a rootless OCI runtime (`runc` or `crun`) inside
//! a user namespace that maps the invoking user to uid 0.
//!
//! ## Bundle Layout
//!
//! ```text
//! <container_dir>/
//! ├── config.json     # OCI spec, generated once and updated every run
//! ├── runc/           # runtime state (--root)
//! └── ROOT/           # rootfs
//! ```
//!
//! ## Volumes
//!
//! Directory volumes become bind mounts in `config.json` for the duration
//! of the run. Bind mounting a file needs a target file in the rootfs, so
//! file volumes (including generated passwd/group copies) go through
//! [`FileBind`]: the container file becomes a link into a directory that
//! is mounted from a per-run host directory.
//!
//! ## PRoot Overlay
//!
//! R2 and R3 run the command under PRoot inside the container, copied in
//! through the file binding at `/.udock-proot`. R3 also disables PRoot's
//! seccomp acceleration.

use std::io::IsTerminal;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{Level, debug, info, warn};

use crate::config::Config;
use crate::constants::{OCI_SPEC_FILE, PROOT_OVERLAY_PATH, RUNC_STATE_DIR};
use crate::engine::ExecutionEngine;
use crate::engines::common::{EngineCommon, build_command, select_executable};
use crate::engines::proot::{NoSeccompEnv, SeccompBypass, select_proot};
use crate::error::{Error, Result};
use crate::execmode::ModeTag;
use crate::filebind::FileBind;
use crate::oci::{OciCapabilities, OciIdMapping, OciSpec};
use crate::platform::HostInfo;
use crate::repository::Repository;

/// Locates the OCI runtime executable.
pub fn select_runc(config: &Config, host: &HostInfo, repo: &dyn Repository) -> Result<PathBuf> {
    let sfx = host.arch.binary_suffix();
    let bundled = vec![
        format!("runc-{}", sfx),
        "runc".to_string(),
        format!("crun-{}", sfx),
        "crun".to_string(),
    ];
    select_executable(
        "runc",
        &config.use_runc_executable,
        host,
        &["runc", "crun"],
        &repo.bindir(),
        &bundled,
    )
}

/// Rootless runc execution engine.
pub struct RuncEngine {
    common: EngineCommon,
    spec: Option<OciSpec>,
    filebind: Option<FileBind>,
    /// Mounts added for this run, removed from the spec afterwards.
    added_mounts: Vec<(String, String)>,
    seccomp_bypass: Arc<dyn SeccompBypass>,
}

impl RuncEngine {
    pub fn new(common: EngineCommon) -> Self {
        Self {
            common,
            spec: None,
            filebind: None,
            added_mounts: Vec::new(),
            seccomp_bypass: Arc::new(NoSeccompEnv),
        }
    }

    pub fn with_seccomp_bypass(mut self, bypass: Arc<dyn SeccompBypass>) -> Self {
        self.seccomp_bypass = bypass;
        self
    }

    /// The spec being prepared.
    pub fn spec(&self) -> Option<&OciSpec> {
        self.spec.as_ref()
    }

    fn spec_mut(&mut self) -> Result<&mut OciSpec> {
        self.spec
            .as_mut()
            .ok_or_else(|| Error::Internal("OCI spec not loaded".to_string()))
    }

    fn container_dir(&self) -> Result<PathBuf> {
        self.common
            .container_dir
            .clone()
            .ok_or_else(|| Error::ContainerNotFound(self.common.container_id.clone()))
    }

    /// Loads `config.json`, or generates a rootless default when it is
    /// missing or `new` is set.
    pub fn load_spec(&mut self, new: bool) -> Result<()> {
        let path = self.container_dir()?.join(OCI_SPEC_FILE);
        let spec = if !new && path.exists() {
            OciSpec::load(&path)?
        } else {
            debug!("Generating OCI spec {}", path.display());
            OciSpec::rootless_default(
                self.common.host.uid,
                self.common.host.gid,
                self.common.config.runc_nomqueue,
            )
        };
        self.spec = Some(spec);
        Ok(())
    }

    /// Writes the spec back to `config.json`.
    pub fn save_spec(&self) -> Result<()> {
        let path = self.container_dir()?.join(OCI_SPEC_FILE);
        match &self.spec {
            Some(spec) => spec.save(&path),
            None => Err(Error::SpecSaveFailed {
                path,
                reason: "no spec loaded".to_string(),
            }),
        }
    }

    /// The runtime maps only the invoking user, so the process runs as 0.
    pub fn uid_check(&mut self) {
        let opt = &mut self.common.opt;
        if opt.uid.is_some_and(|uid| uid != 0) {
            warn!("This execution mode only runs as root, ignoring user {}", opt.user);
            opt.uid = Some(0);
            opt.gid = Some(0);
        }
    }

    /// Copies the run options into the spec.
    pub fn set_spec(&mut self) -> Result<()> {
        let common = &self.common;
        let spec = self
            .spec
            .as_mut()
            .ok_or_else(|| Error::Internal("OCI spec not loaded".to_string()))?;
        let opt = &common.opt;

        let root = std::fs::canonicalize(&common.container_root)
            .unwrap_or_else(|_| common.container_root.clone());
        spec.root.path = root.to_string_lossy().into_owned();
        spec.root.readonly = false;
        spec.process.terminal = std::io::stdin().is_terminal();
        spec.process.cwd = opt.cwd.clone();
        spec.process.env = opt.env.list();
        spec.process.args = opt.cmd.clone();
        spec.process.user.uid = opt.uid.unwrap_or(0);
        spec.process.user.gid = opt.gid.unwrap_or(0);
        if !opt.hostname.is_empty() {
            spec.hostname = opt.hostname.clone();
        }
        if common.config.runc_nomqueue {
            spec.mounts.retain(|m| m.destination != "/dev/mqueue");
        }

        let linux = spec.linux.get_or_insert_with(Default::default);
        linux.uid_mappings = vec![OciIdMapping {
            container_id: 0,
            host_id: common.host.uid,
            size: 1,
        }];
        linux.gid_mappings = vec![OciIdMapping {
            container_id: 0,
            host_id: common.host.gid,
            size: 1,
        }];
        Ok(())
    }

    /// Grants the configured capability set.
    pub fn add_capabilities_spec(&mut self) -> Result<()> {
        let caps = self.common.config.runc_capabilities.clone();
        self.spec_mut()?.process.capabilities = Some(OciCapabilities {
            bounding: caps.clone(),
            effective: caps.clone(),
            inheritable: caps.clone(),
            permitted: caps.clone(),
            ambient: caps,
        });
        Ok(())
    }

    /// Adds a bind mount for this run.
    pub fn add_mount_spec(&mut self, host_path: &str, cont_path: &str, rw: bool) -> Result<()> {
        if self.spec_mut()?.add_mount(host_path, cont_path, rw) {
            self.added_mounts.push((host_path.to_string(), cont_path.to_string()));
        }
        Ok(())
    }

    /// Removes a bind mount; false if the spec had none.
    pub fn del_mount_spec(&mut self, host_path: &str, cont_path: &str) -> Result<bool> {
        let removed = self.spec_mut()?.del_mount(host_path, cont_path);
        self.added_mounts.retain(|(h, c)| !(h == host_path && c == cont_path));
        Ok(removed)
    }

    /// Adds directory volumes as mounts and binds file volumes, plus
    /// `extra_files` (host file, container path), through the file binding.
    pub fn add_volume_bindings(&mut self, extra_files: &[(PathBuf, String)]) -> Result<()> {
        let mut files: Vec<(PathBuf, String)> = Vec::new();
        for vol in self.common.opt.vol.clone() {
            let host = Path::new(&vol.host_path);
            if host.is_dir() {
                if vol.host_path == "/dev" {
                    warn!("Binding /dev is not supported by this execution mode");
                    continue;
                }
                if self.spec_mut()?.has_mount(&vol.container_path) {
                    debug!("{} already mounted by the spec", vol.container_path);
                    continue;
                }
                self.add_mount_spec(&vol.host_path, &vol.container_path, vol.is_rw())?;
            } else if host.is_file() {
                files.push((host.to_path_buf(), vol.container_path.clone()));
            }
        }
        files.extend(extra_files.iter().cloned());
        if files.is_empty() {
            return Ok(());
        }

        let container_dir = self.container_dir()?;
        let mut filebind = FileBind::new(&container_dir, &self.common.config.tmpdir);
        let cont_files: Vec<String> = files.iter().map(|(_, cont)| cont.clone()).collect();
        filebind.start(&cont_files)?;
        for (host, cont) in &files {
            filebind.add_file(host, cont)?;
        }
        let host_dir = filebind
            .host_bind_dir()
            .map(|p| p.to_string_lossy().into_owned())
            .ok_or_else(|| Error::FileBind("host bind dir missing".to_string()))?;
        self.filebind = Some(filebind);
        self.add_mount_spec(&host_dir, FileBind::bind_dir(), false)
    }

    /// Wraps the command in the PRoot overlay for R2 and R3.
    pub fn proot_overlay(&mut self) -> Result<()> {
        let mode = self.common.mode;
        if !matches!(mode, ModeTag::R2 | ModeTag::R3) {
            return Ok(());
        }
        let mut args = vec![
            PROOT_OVERLAY_PATH.to_string(),
            "-w".to_string(),
            self.common.opt.cwd.clone(),
        ];
        args.extend(self.common.opt.cmd.iter().cloned());
        let mut env = vec!["PROOT_TMP_DIR=/tmp".to_string()];
        if mode == ModeTag::R3 {
            env.extend(self.seccomp_bypass.env().into_iter().map(|(k, v)| format!("{}={}", k, v)));
        }

        let spec = self.spec_mut()?;
        spec.process.args = args;
        spec.process.env.extend(env);
        Ok(())
    }

    /// Command line for the runtime.
    pub fn build_argv(&mut self, runc: &Path) -> Result<Vec<String>> {
        let container_dir = self.container_dir()?;
        let state_dir = container_dir.join(RUNC_STATE_DIR);
        std::fs::create_dir_all(&state_dir)?;

        let mut argv = self.common.set_cpu_affinity();
        argv.push(runc.to_string_lossy().into_owned());
        if tracing::enabled!(Level::DEBUG) {
            argv.push("--debug".to_string());
        }
        argv.extend([
            "--root".to_string(),
            state_dir.to_string_lossy().into_owned(),
            "run".to_string(),
            "--bundle".to_string(),
            container_dir.to_string_lossy().into_owned(),
            format!("udock-{}", uuid::Uuid::now_v7().simple()),
        ]);
        Ok(argv)
    }

    /// Drops the per-run mounts and the file binding.
    pub fn cleanup(&mut self) -> Result<()> {
        if self.spec.is_some() {
            for (host, cont) in self.added_mounts.clone() {
                self.del_mount_spec(&host, &cont)?;
            }
            self.save_spec()?;
        }
        if let Some(filebind) = self.filebind.as_mut() {
            filebind.finish();
        }
        Ok(())
    }

    async fn run_prepared(&mut self, container_id: &str) -> Result<i32> {
        self.common.run_init(container_id)?;
        let runc = select_runc(&self.common.config, &self.common.host, self.common.repo.as_ref())?;

        self.load_spec(false)?;
        self.uid_check();
        self.common.run_env_set()?;
        self.set_spec()?;
        self.add_capabilities_spec()?;

        let mut extra_files = Vec::new();
        if matches!(self.common.mode, ModeTag::R2 | ModeTag::R3) {
            let proot = select_proot(&self.common.config, &self.common.host, self.common.repo.as_ref())?;
            extra_files.push((proot, PROOT_OVERLAY_PATH.to_string()));
        }
        self.add_volume_bindings(&extra_files)?;
        self.proot_overlay()?;
        self.save_spec()?;

        let argv = self.build_argv(&runc)?;
        self.common.run_banner();
        let cmd = build_command(&argv, &self.common.host_env())?;
        self.common.execute(cmd).await
    }
}

#[async_trait]
impl ExecutionEngine for RuncEngine {
    fn common(&self) -> &EngineCommon {
        &self.common
    }

    fn common_mut(&mut self) -> &mut EngineCommon {
        &mut self.common
    }

    async fn run(&mut self, container_id: &str) -> Result<i32> {
        if self.common.opt.location.is_some() {
            return Err(Error::InvalidOption(
                "runc modes need a repository container, not --location".to_string(),
            ));
        }
        let result = self.run_prepared(container_id).await;
        if let Err(e) = self.cleanup() {
            warn!("Cleanup after run failed: {}", e);
        }
        if let Ok(code) = &result {
            info!(container = %container_id, code, "Container exited");
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::options::RunOptions;
    use crate::repository::ContainerMeta;

    struct DirRepo(PathBuf);

    impl Repository for DirRepo {
        fn bindir(&self) -> PathBuf {
            self.0.join("bin")
        }
        fn libdir(&self) -> PathBuf {
            self.0.join("lib")
        }
        fn get_container_id(&self, _: &str) -> Option<String> {
            None
        }
        fn cd_container(&self, _: &str) -> Option<PathBuf> {
            None
        }
        fn get_container_name(&self, _: &str) -> Vec<String> {
            Vec::new()
        }
        fn get_container_attr(&self, _: &str) -> Option<(PathBuf, ContainerMeta)> {
            None
        }
    }

    fn engine(dir: &Path, mode: ModeTag) -> RuncEngine {
        let config = Config {
            tmpdir: dir.join("tmp"),
            ..Config::default()
        };
        std::fs::create_dir_all(dir.join("tmp")).unwrap();
        std::fs::create_dir_all(dir.join("c1/ROOT")).unwrap();
        let host = HostInfo {
            uid: 1000,
            gid: 1000,
            ..HostInfo::detect()
        };
        let mut common = EngineCommon::new(
            Arc::new(config),
            Arc::new(host),
            Arc::new(DirRepo(dir.to_path_buf())),
            mode,
            RunOptions::default(),
        );
        common.container_id = "c1".to_string();
        common.container_dir = Some(dir.join("c1"));
        common.container_root = dir.join("c1/ROOT");
        RuncEngine::new(common)
    }

    #[test]
    fn test_set_spec_maps_invoking_user() {
        let dir = tempfile::tempdir().unwrap();
        let mut eng = engine(dir.path(), ModeTag::R1);
        eng.common.opt.cmd = vec!["/bin/sh".into(), "-c".into(), "true".into()];
        eng.common.opt.cwd = "/srv".into();
        eng.common.opt.hostname = "box".into();
        eng.common.opt.env.append("LANG=C").unwrap();
        eng.common.opt.uid = Some(1000);
        eng.common.opt.user = "user1".into();
        eng.load_spec(false).unwrap();
        eng.uid_check();
        eng.set_spec().unwrap();

        let spec = eng.spec().unwrap();
        assert_eq!(spec.process.args, vec!["/bin/sh", "-c", "true"]);
        assert_eq!(spec.process.cwd, "/srv");
        assert_eq!(spec.hostname, "box");
        assert!(spec.process.env.iter().any(|e| e == "LANG=C"));
        assert_eq!(spec.process.user.uid, 0);
        let linux = spec.linux.as_ref().unwrap();
        assert_eq!(linux.uid_mappings[0].host_id, 1000);
        assert_eq!(linux.uid_mappings[0].container_id, 0);
        assert_eq!(linux.gid_mappings[0].host_id, 1000);
    }

    #[test]
    fn test_volume_mounts_are_per_run() {
        let dir = tempfile::tempdir().unwrap();
        let data = dir.path().join("data");
        std::fs::create_dir_all(&data).unwrap();
        let mut eng = engine(dir.path(), ModeTag::R1);
        eng.common.opt.add_volume(&format!("{}:/data", data.display())).unwrap();
        eng.common.opt.add_volume("/dev").unwrap();

        eng.load_spec(false).unwrap();
        let before = eng.spec().unwrap().mounts.len();
        eng.add_volume_bindings(&[]).unwrap();
        let spec = eng.spec().unwrap();
        assert!(spec.has_mount("/data"));
        assert_eq!(spec.mounts.len(), before + 1);

        eng.cleanup().unwrap();
        let saved = OciSpec::load(&dir.path().join("c1").join(OCI_SPEC_FILE)).unwrap();
        assert!(!saved.has_mount("/data"));
        assert_eq!(saved.mounts.len(), before);
    }

    #[test]
    fn test_file_volume_uses_filebind() {
        let dir = tempfile::tempdir().unwrap();
        let conf = dir.path().join("app.conf");
        std::fs::write(&conf, "key=value\n").unwrap();
        let mut eng = engine(dir.path(), ModeTag::R1);
        eng.common.opt.add_volume(&format!("{}:/etc/app.conf", conf.display())).unwrap();

        eng.load_spec(false).unwrap();
        eng.add_volume_bindings(&[]).unwrap();

        let root = dir.path().join("c1/ROOT");
        let link = std::fs::read_link(root.join("etc/app.conf")).unwrap();
        assert!(link.starts_with(FileBind::bind_dir()));
        assert!(eng.spec().unwrap().has_mount(FileBind::bind_dir()));
        let host_copy = eng.filebind.as_ref().unwrap().get_path("/etc/app.conf").unwrap();
        assert_eq!(std::fs::read_to_string(host_copy).unwrap(), "key=value\n");
    }

    #[test]
    fn test_proot_overlay_args() {
        let dir = tempfile::tempdir().unwrap();
        let mut eng = engine(dir.path(), ModeTag::R3);
        eng.common.opt.cmd = vec!["/bin/ls".into()];
        eng.common.opt.cwd = "/tmp".into();
        eng.load_spec(false).unwrap();
        eng.proot_overlay().unwrap();

        let process = &eng.spec().unwrap().process;
        assert_eq!(process.args, vec![PROOT_OVERLAY_PATH, "-w", "/tmp", "/bin/ls"]);
        assert!(process.env.contains(&"PROOT_NO_SECCOMP=1".to_string()));

        let mut r1 = engine(dir.path(), ModeTag::R1);
        r1.common.opt.cmd = vec!["/bin/ls".into()];
        r1.load_spec(true).unwrap();
        let before = r1.spec().unwrap().process.args.clone();
        r1.proot_overlay().unwrap();
        assert_eq!(r1.spec().unwrap().process.args, before);
    }

    #[test]
    fn test_capabilities() {
        let dir = tempfile::tempdir().unwrap();
        let mut eng = engine(dir.path(), ModeTag::R1);
        eng.load_spec(true).unwrap();
        eng.add_capabilities_spec().unwrap();
        let caps = eng.spec().unwrap().process.capabilities.clone().unwrap();
        assert_eq!(caps.bounding, eng.common.config.runc_capabilities);
        assert_eq!(caps.ambient, caps.effective);
    }
}
