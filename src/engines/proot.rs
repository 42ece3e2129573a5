//! # PRoot Engine - Modes P1 and P2
//!
//! Runs the container under PRoot, which emulates `chroot`, bind mounts and
//! uid 0 by tracing system calls. Nothing is changed inside the container
//! root, so switching to or from P1/P2 is cheap.
//!
//! ## Backend Selection
//!
//! | `use_proot_executable` | Search order                                 |
//! |------------------------|----------------------------------------------|
//! | `""`                   | `proot` on the host PATH, then bundled       |
//! | `"UDOCKER"`            | bundled only                                 |
//! | anything else          | that path                                    |
//!
//! Bundled names are tried as `proot-<arch>-4_8_0` (kernels from 4.8 on),
//! `proot-<arch>` and `proot`.
//!
//! ## Seccomp
//!
//! P1 lets PRoot use seccomp to skip tracing most system calls. P2 turns that
//! off through a [`SeccompBypass`] strategy, which by default exports
//! `PROOT_NO_SECCOMP=1`. `proot_noseccomp` in the configuration overrides the
//! mode: `Some(true)` always bypasses, `Some(false)` never does.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{Level, debug};

use crate::config::Config;
use crate::constants::PROOT_SECCOMP_KERNEL;
use crate::engine::ExecutionEngine;
use crate::engines::common::{EngineCommon, build_command, select_executable};
use crate::error::Result;
use crate::execmode::ModeTag;
use crate::platform::HostInfo;
use crate::repository::Repository;

/// Strategy used when PRoot must run without seccomp acceleration.
pub trait SeccompBypass: Send + Sync {
    fn name(&self) -> &str;

    /// One-off preparation when a container enters a bypassing mode.
    fn prepare(&self, _container_dir: &Path) -> Result<()> {
        Ok(())
    }

    /// Variables exported to PRoot.
    fn env(&self) -> Vec<(String, String)>;
}

/// Disables seccomp through PRoot's own environment switch.
#[derive(Debug, Clone, Default)]
pub struct NoSeccompEnv;

impl SeccompBypass for NoSeccompEnv {
    fn name(&self) -> &str {
        "proot-no-seccomp"
    }

    fn env(&self) -> Vec<(String, String)> {
        vec![("PROOT_NO_SECCOMP".to_string(), "1".to_string())]
    }
}

/// Locates the PRoot executable.
pub fn select_proot(config: &Config, host: &HostInfo, repo: &dyn Repository) -> Result<PathBuf> {
    let sfx = host.arch.binary_suffix();
    let mut bundled = Vec::new();
    if host.kernel_at_least(&PROOT_SECCOMP_KERNEL) {
        bundled.push(format!("proot-{}-4_8_0", sfx));
    }
    bundled.push(format!("proot-{}", sfx));
    bundled.push("proot".to_string());

    select_executable(
        "proot",
        &config.use_proot_executable,
        host,
        &["proot"],
        &repo.bindir(),
        &bundled,
    )
}

/// PRoot execution engine.
pub struct PRootEngine {
    common: EngineCommon,
    seccomp_bypass: Arc<dyn SeccompBypass>,
}

impl PRootEngine {
    pub fn new(common: EngineCommon) -> Self {
        Self {
            common,
            seccomp_bypass: Arc::new(NoSeccompEnv),
        }
    }

    pub fn with_seccomp_bypass(mut self, bypass: Arc<dyn SeccompBypass>) -> Self {
        self.seccomp_bypass = bypass;
        self
    }

    /// True if this run disables seccomp acceleration.
    pub fn bypass_seccomp(&self) -> bool {
        match self.common.config.proot_noseccomp {
            Some(forced) => forced,
            None => self.common.mode == ModeTag::P2,
        }
    }

    /// `-p cont:host` pairs plus `-n` for cooperative networking, if the
    /// PRoot build supports port mapping at all.
    fn network_map(&self, proot: &Path) -> Vec<String> {
        let mut args = Vec::new();
        for (cont, host) in self.common.get_portsmap(true) {
            args.push("-p".to_string());
            args.push(format!("{}:{}", cont, host));
        }
        if self.common.opt.netcoop && HostInfo::has_option(proot, "--netcoop") {
            args.push("-n".to_string());
        }
        if args.is_empty() || !HostInfo::has_option(proot, "--port") {
            return Vec::new();
        }
        args
    }

    /// Full command line for an initialized container.
    pub fn build_argv(&mut self, proot: &Path) -> Vec<String> {
        let mut argv = self.common.set_cpu_affinity();
        argv.push(proot.to_string_lossy().into_owned());

        if tracing::enabled!(Level::DEBUG) {
            argv.extend(["-v".to_string(), "9".to_string()]);
        }
        if self.common.config.proot_killonexit && HostInfo::has_option(proot, "--kill-on-exit") {
            argv.push("--kill-on-exit".to_string());
        }
        if !self.common.opt.kernel.is_empty() {
            argv.extend(["-k".to_string(), self.common.opt.kernel.clone()]);
        }

        let opt = &self.common.opt;
        if opt.is_root() {
            argv.push("-0".to_string());
        } else {
            argv.push("-i".to_string());
            argv.push(format!("{}:{}", opt.uid.unwrap_or(0), opt.gid.unwrap_or(0)));
        }
        argv.extend(self.network_map(proot));

        let opt = &self.common.opt;
        argv.extend([
            "-r".to_string(),
            self.common.container_root.to_string_lossy().into_owned(),
            "-w".to_string(),
            opt.cwd.clone(),
        ]);
        for vol in &opt.vol {
            argv.push("-b".to_string());
            argv.push(format!("{}:{}", vol.host_path, vol.container_path));
        }
        argv.extend(opt.cmd.iter().cloned());
        argv
    }

    /// Environment handed to PRoot, which passes it on to the container.
    pub fn build_env(&self) -> Vec<(String, String)> {
        let mut env = self.common.host_env();
        env.extend(
            self.common
                .opt
                .env
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string())),
        );
        env.push((
            "PROOT_TMP_DIR".to_string(),
            self.common.config.tmpdir.to_string_lossy().into_owned(),
        ));
        if self.bypass_seccomp() {
            debug!("Disabling seccomp via {}", self.seccomp_bypass.name());
            env.extend(self.seccomp_bypass.env());
        }
        env
    }
}

#[async_trait]
impl ExecutionEngine for PRootEngine {
    fn common(&self) -> &EngineCommon {
        &self.common
    }

    fn common_mut(&mut self) -> &mut EngineCommon {
        &mut self.common
    }

    async fn run(&mut self, container_id: &str) -> Result<i32> {
        self.common.run_init(container_id)?;
        let proot = select_proot(
            &self.common.config,
            &self.common.host,
            self.common.repo.as_ref(),
        )?;

        self.common.run_env_set()?;
        let argv = self.build_argv(&proot);
        let env = self.build_env();

        self.common.run_banner();
        let cmd = build_command(&argv, &env)?;
        self.common.execute(cmd).await
    }
}
