//! # Singularity Engine - Mode S1
//!
//! Hands the container root to an installed Apptainer or Singularity as a
//! sandbox directory (`exec <options> <root>`, where the default
//! `singularity_options` supply `-w`). Volumes become `-B host:cont`
//! options; the mount points are created in the root beforehand because
//! unprivileged Singularity cannot create them itself.

use std::fs;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tracing::{Level, debug, warn};

use crate::config::Config;
use crate::engine::ExecutionEngine;
use crate::engines::common::{EngineCommon, build_command, select_executable};
use crate::error::Result;
use crate::fileutil;
use crate::platform::HostInfo;
use crate::repository::Repository;

/// Directories Singularity expects to find in a sandbox.
const SANDBOX_DIRS: &[&str] = &["/tmp", "/var/tmp", "/proc", "/sys", "/dev", "/home", "/etc"];

/// Locates the Apptainer/Singularity executable.
pub fn select_singularity(config: &Config, host: &HostInfo, repo: &dyn Repository) -> Result<PathBuf> {
    let bundled = vec![
        format!("singularity-{}", host.arch.binary_suffix()),
        "singularity".to_string(),
    ];
    select_executable(
        "singularity",
        &config.use_singularity_executable,
        host,
        &["apptainer", "singularity"],
        &repo.bindir(),
        &bundled,
    )
}

/// Singularity execution engine.
pub struct SingularityEngine {
    common: EngineCommon,
}

impl SingularityEngine {
    pub fn new(common: EngineCommon) -> Self {
        Self { common }
    }

    /// Creates the directories Singularity binds onto.
    pub fn make_container_directories(&self) -> Result<()> {
        let root = &self.common.container_root;
        let home = self.common.opt.home.as_str();
        for dir in SANDBOX_DIRS.iter().copied().chain((!home.is_empty()).then_some(home)) {
            let path = fileutil::resolve_in_root(root, dir);
            if !path.exists() {
                fs::create_dir_all(&path)?;
            }
        }
        Ok(())
    }

    /// `-B` options for the volumes, plus the home and temporary
    /// directories when no volume covers them.
    pub fn get_volume_bindings(&self) -> Vec<String> {
        let root = self.common.container_root.to_string_lossy();
        let home = self.common.opt.home.clone();
        let host_home = self.common.host.home.to_string_lossy().into_owned();

        let mut args = Vec::new();
        let (mut home_bound, mut tmp_bound, mut vartmp_bound) = (false, false, false);
        for vol in &self.common.opt.vol {
            let (host, cont) = vol.split();
            args.push("-B".to_string());
            args.push(format!("{}:{}", host, cont));
            if cont == home || (host == host_home && cont == host_home) {
                home_bound = true;
            }
            tmp_bound |= cont == "/tmp";
            vartmp_bound |= cont == "/var/tmp";
        }

        if !home_bound && !home.is_empty() {
            args.push("--home".to_string());
            args.push(format!("{}{}:{}", root, home, home));
        }
        if !tmp_bound {
            args.push("-B".to_string());
            args.push(format!("{}/tmp:/tmp", root));
        }
        if !vartmp_bound {
            args.push("-B".to_string());
            args.push(format!("{}/var/tmp:/var/tmp", root));
        }
        args
    }

    /// `--fakeroot` if root was asked for without being root on the host.
    fn uid_check(&self) -> Vec<String> {
        let opt = &self.common.opt;
        if opt.is_root() && !self.common.host.is_root() {
            return vec!["--fakeroot".to_string()];
        }
        if opt.uid.is_some_and(|uid| uid != 0 && uid != self.common.host.uid) {
            warn!("This execution mode runs as the invoking user, ignoring user {}", opt.user);
        }
        Vec::new()
    }

    /// Full command line for an initialized container.
    pub fn build_argv(&mut self, exe: &Path) -> Vec<String> {
        let mut argv = self.common.set_cpu_affinity();
        argv.push(exe.to_string_lossy().into_owned());
        if tracing::enabled!(Level::DEBUG) {
            argv.push("--debug".to_string());
        } else if HostInfo::has_option(exe, "--silent") {
            argv.push("--silent".to_string());
        }
        argv.push("exec".to_string());
        argv.extend(self.common.config.singularity_options.iter().cloned());
        argv.extend(self.get_volume_bindings());
        argv.extend(self.uid_check());

        let cwd = if self.common.opt.cwd.is_empty() {
            "/".to_string()
        } else {
            self.common.opt.cwd.clone()
        };
        argv.extend([
            "--pwd".to_string(),
            cwd,
            self.common.container_root.to_string_lossy().into_owned(),
        ]);
        argv.extend(self.common.opt.cmd.iter().cloned());
        argv
    }

    /// Host environment plus the container variables as `SINGULARITYENV_*`.
    pub fn build_env(&self) -> Vec<(String, String)> {
        let mut env = self.common.host_env();
        env.extend(
            self.common
                .opt
                .env
                .iter()
                .map(|(k, v)| (format!("SINGULARITYENV_{}", k), v.to_string())),
        );
        env
    }
}

#[async_trait]
impl ExecutionEngine for SingularityEngine {
    fn common(&self) -> &EngineCommon {
        &self.common
    }

    fn common_mut(&mut self) -> &mut EngineCommon {
        &mut self.common
    }

    async fn run(&mut self, container_id: &str) -> Result<i32> {
        // Nothing is created in the root unless a backend exists.
        let exe = select_singularity(
            &self.common.config,
            &self.common.host,
            self.common.repo.as_ref(),
        )?;
        self.common.run_init(container_id)?;
        self.make_container_directories()?;
        debug!("Singularity sandbox {}", self.common.container_root.display());

        self.common.run_env_set()?;
        let argv = self.build_argv(&exe);
        let env = self.build_env();

        self.common.run_banner();
        let cmd = build_command(&argv, &env)?;
        self.common.execute(cmd).await
    }
}
