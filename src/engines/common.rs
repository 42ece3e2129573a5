//! Pipeline shared by every execution engine.
//!
//! [`EngineCommon::run_init`] prepares a container for one run and is the
//! first thing every backend calls:
//!
//! ```text
//! run_load_metadata ─► locate root ─► check_exposed_ports ─► setup_container_user
//!                                                                 │
//!        exec_path ◄─ check_executable ◄─ check_paths ◄─ set_volume_bindings
//! ```
//!
//! Each step reads and refines [`RunOptions`]. A failing step aborts the run
//! before anything is spawned.

use std::collections::BTreeMap;
use std::fs;
use std::os::unix::process::ExitStatusExt;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;

use tempfile::TempDir;
use tracing::{debug, info, warn};

use crate::auth::{NixAuthentication, PasswdEntry};
use crate::config::Config;
use crate::constants::{CONTAINER_ROOT_DIR, FIRST_UNPRIVILEGED_PORT, PROTECTED_CONTAINER_DIRS};
use crate::engine::EngineKind;
use crate::env::Uenv;
use crate::error::{Error, Result};
use crate::execmode::ModeTag;
use crate::filebind::FileBind;
use crate::fileutil;
use crate::mountpoint::MountPoint;
use crate::options::{RunOptions, UserSpec, validate_user_str};
use crate::platform::HostInfo;
use crate::repository::Repository;
use crate::volume::{AccessMode, BindingOrigin, VolumeBinding, cleanpath, is_protected};

/// Which bindings get a mount point created inside the root.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MountPolicy {
    /// The backend maps paths itself.
    None,
    /// Directories and files.
    All,
    /// Directories only; files are handled by file binding.
    DirsOnly,
}

impl MountPolicy {
    pub fn for_kind(kind: EngineKind) -> Self {
        match kind {
            EngineKind::PRoot | EngineKind::Fakechroot => Self::None,
            EngineKind::Runc => Self::DirsOnly,
            EngineKind::Singularity => Self::All,
        }
    }
}

/// State shared by the engines during one run.
pub struct EngineCommon {
    pub config: Arc<Config>,
    pub host: Arc<HostInfo>,
    pub repo: Arc<dyn Repository>,
    pub mode: ModeTag,
    pub opt: RunOptions,
    pub container_id: String,
    pub container_dir: Option<PathBuf>,
    pub container_root: PathBuf,
    pub container_names: Vec<String>,
    pub mountp: Option<MountPoint>,
    /// Container-absolute path of the program to run.
    pub exec_path: String,
    /// `host:container` auth files bound when `opt.hostauth` is set.
    pub hostauth_list: Vec<String>,
    pub mount_policy: MountPolicy,
    /// False for backends that cannot switch to another uid.
    pub root_capable: bool,
    auth_copies: Option<TempDir>,
}

impl EngineCommon {
    pub fn new(
        config: Arc<Config>,
        host: Arc<HostInfo>,
        repo: Arc<dyn Repository>,
        mode: ModeTag,
        opt: RunOptions,
    ) -> Self {
        let kind = mode.kind();
        Self {
            hostauth_list: config.hostauth_list.clone(),
            config,
            host,
            repo,
            mode,
            opt,
            container_id: String::new(),
            container_dir: None,
            container_root: PathBuf::new(),
            container_names: Vec::new(),
            mountp: None,
            exec_path: String::new(),
            mount_policy: MountPolicy::for_kind(kind),
            root_capable: kind != EngineKind::Fakechroot,
            auth_copies: None,
        }
    }

    // =========================================================================
    // Ports and CPU affinity
    // =========================================================================

    /// Published ports as a map. `by_container` keys it by container port,
    /// otherwise by host port. Malformed entries are ignored.
    pub fn get_portsmap(&self, by_container: bool) -> BTreeMap<u16, u16> {
        let mut portsmap = BTreeMap::new();
        for entry in &self.opt.portsmap {
            let spec = entry.split('/').next().unwrap_or_default();
            let Some((host, cont)) = spec.split_once(':') else {
                continue;
            };
            let (Ok(host), Ok(cont)) = (host.trim().parse::<u16>(), cont.trim().parse::<u16>())
            else {
                continue;
            };
            if by_container {
                portsmap.insert(cont, host);
            } else {
                portsmap.insert(host, cont);
            }
        }
        portsmap
    }

    /// Rejects binding privileged host ports unless running as root.
    pub fn check_exposed_ports(&self) -> Result<()> {
        if self.host.is_root() {
            return Ok(());
        }

        let mapped = self.get_portsmap(true);
        for entry in &self.opt.portsexp {
            let Ok(port) = entry.split('/').next().unwrap_or_default().parse::<u16>() else {
                continue;
            };
            let host_port = mapped.get(&port).copied().unwrap_or(port);
            if host_port < FIRST_UNPRIVILEGED_PORT {
                return Err(Error::PrivilegedPort { port: host_port });
            }
        }
        if let Some(port) = mapped.values().find(|p| **p < FIRST_UNPRIVILEGED_PORT) {
            return Err(Error::PrivilegedPort { port: *port });
        }
        if !self.opt.portsexp.is_empty() {
            debug!("Container exposes ports {:?}", self.opt.portsexp);
        }
        Ok(())
    }

    /// Command prefix pinning the run to `opt.cpuset`, from the first
    /// affinity tool found on the host.
    pub fn set_cpu_affinity(&mut self) -> Vec<String> {
        if self.opt.cpuset.is_empty() {
            return Vec::new();
        }
        for tool in &self.config.cpu_affinity_exec_tools {
            let Some(name) = tool.first() else { continue };
            let Some(exe) = self.host.find_exec(name) else {
                continue;
            };
            let mut argv = vec![exe.to_string_lossy().into_owned()];
            argv.extend(tool[1..].iter().map(|arg| {
                if arg == "%s" {
                    self.opt.cpuset.clone()
                } else {
                    arg.clone()
                }
            }));
            return argv;
        }
        warn!("No CPU affinity tool found, ignoring cpuset {}", self.opt.cpuset);
        self.opt.cpuset.clear();
        Vec::new()
    }

    // =========================================================================
    // Volumes
    // =========================================================================

    /// Host home directory to bind.
    pub fn get_bindhome(&self) -> String {
        if self.opt.bindhome {
            self.host.home.to_string_lossy().into_owned()
        } else {
            String::new()
        }
    }

    /// Container path bound to `host_path`.
    pub fn is_volume(&self, host_path: &str) -> Option<String> {
        let host_path = cleanpath(host_path);
        self.opt
            .vol
            .iter()
            .find(|v| cleanpath(&v.host_path) == host_path)
            .map(|v| v.container_path.clone())
    }

    /// Host path bound onto `cont_path`.
    pub fn is_mountpoint(&self, cont_path: &str) -> Option<String> {
        let cont_path = cleanpath(cont_path);
        self.opt
            .vol
            .iter()
            .find(|v| cleanpath(&v.container_path) == cont_path)
            .map(|v| v.host_path.clone())
    }

    /// Creates the mount point for a binding if the backend needs one.
    pub fn create_mountpoint(&mut self, host_path: &str, cont_path: &str, dirs_only: bool) -> Result<()> {
        let Some(mountp) = self.mountp.as_mut() else {
            return Ok(());
        };
        let host = Path::new(host_path);
        if dirs_only && !host.is_dir() {
            return Ok(());
        }
        mountp.create(host, cont_path)?;
        mountp.save(cont_path)
    }

    /// Validates the assembled bindings.
    ///
    /// Unusable implicit bindings are dropped quietly. An unusable explicit
    /// binding is dropped too, and the first such failure is returned once
    /// every binding has been looked at.
    pub fn check_volumes(&mut self) -> Result<()> {
        let mut failure: Option<Error> = None;
        let mut kept = Vec::with_capacity(self.opt.vol.len());

        for vol in std::mem::take(&mut self.opt.vol) {
            let reject = |reason: &str| Error::VolumeRejected {
                path: vol.to_string(),
                reason: reason.to_string(),
            };

            let problem = if !vol.host_path.starts_with('/') || !vol.container_path.starts_with('/') {
                Some(reject("paths must be absolute"))
            } else if !Path::new(&vol.host_path).exists() {
                Some(reject("host path does not exist"))
            } else if !vol.is_explicit() && is_protected(&vol.container_path, PROTECTED_CONTAINER_DIRS) {
                Some(reject("protected container path"))
            } else {
                None
            };

            match problem {
                Some(err) if vol.is_explicit() => {
                    warn!("{}", err);
                    failure.get_or_insert(err);
                }
                Some(err) => debug!("Dropping default binding: {}", err),
                None => kept.push(vol),
            }
        }

        let dirs_only = match self.mount_policy {
            MountPolicy::None => None,
            MountPolicy::All => Some(false),
            MountPolicy::DirsOnly => Some(true),
        };
        if let Some(dirs_only) = dirs_only {
            for vol in &kept {
                self.create_mountpoint(&vol.host_path, &vol.container_path, dirs_only)?;
            }
        }

        self.opt.vol = kept;
        failure.map_or(Ok(()), Err)
    }

    fn implicit_binding(path: &str, mode: AccessMode, origin: BindingOrigin) -> Option<VolumeBinding> {
        let mut vol = VolumeBinding::parse(path).ok()?.with_origin(origin);
        vol.mode = mode;
        Some(vol)
    }

    /// Assembles the binding list: default directories, home, auth files,
    /// then the explicit user bindings, minus anything listed in `novol`.
    pub fn set_volume_bindings(&mut self) -> Result<()> {
        let mut implicit = Vec::new();
        if !self.opt.nosysdirs {
            implicit.extend(self.config.sysdirs_list.iter().filter_map(|p| {
                Self::implicit_binding(p, AccessMode::ReadWrite, BindingOrigin::SysDir)
            }));
        }
        if self.opt.dri {
            implicit.extend(self.config.dri_list.iter().filter_map(|p| {
                Self::implicit_binding(p, AccessMode::ReadOnly, BindingOrigin::Dri)
            }));
        }
        let home = self.get_bindhome();
        if !home.is_empty() {
            implicit.extend(Self::implicit_binding(&home, AccessMode::ReadWrite, BindingOrigin::Home));
        }
        if self.opt.hostauth {
            implicit.extend(self.hostauth_list.iter().filter_map(|p| {
                Self::implicit_binding(p, AccessMode::ReadOnly, BindingOrigin::HostAuth)
            }));
        }

        let explicit: Vec<VolumeBinding> = std::mem::take(&mut self.opt.vol);
        implicit.retain(|i| !explicit.iter().any(|e| e.container_path == i.container_path));

        let novol: Vec<String> = self.opt.novol.iter().map(|p| cleanpath(p)).collect();
        let mut vols: Vec<VolumeBinding> = implicit.into_iter().chain(explicit).collect();
        vols.retain(|v| {
            let excluded = novol.contains(&v.host_path) || novol.contains(&v.container_path);
            if excluded {
                debug!("Volume {} excluded by novol", v);
            }
            !excluded
        });
        self.opt.vol = vols;
        self.check_volumes()
    }

    // =========================================================================
    // Paths and executable
    // =========================================================================

    /// Fills `PATH` and the working directory, and checks the latter exists.
    pub fn check_paths(&mut self) -> Result<()> {
        if self.opt.env.get("PATH").is_none() {
            let path = if self.opt.is_root() {
                self.config.root_path.clone()
            } else {
                self.config.user_path.clone()
            };
            self.opt.env.set("PATH", &path)?;
        }

        if self.opt.cwd.is_empty() {
            self.opt.cwd = if self.opt.home.is_empty() {
                "/".to_string()
            } else {
                self.opt.home.clone()
            };
        }
        let host_cwd = fileutil::cont2host(&self.container_root, &self.opt.cwd, &self.opt.vol);
        if !host_cwd.is_dir() {
            return Err(Error::InvalidWorkdir(self.opt.cwd.clone()));
        }
        Ok(())
    }

    /// Resolves the program to run and returns its container path.
    ///
    /// The entrypoint is merged into `opt.cmd` and cleared, so backends only
    /// ever look at `opt.cmd`.
    pub fn check_executable(&mut self) -> Result<String> {
        let mut argv = self.opt.entryp.clone().unwrap_or_default();
        argv.extend(self.opt.cmd.iter().cloned());
        if argv.is_empty() {
            argv = self.config.cmd.clone();
        }
        self.opt.cmd = argv;
        self.opt.entryp = Some(Vec::new());

        let name = self
            .opt
            .cmd
            .first()
            .cloned()
            .ok_or_else(|| Error::CommandNotFound(String::new()))?;
        let path = self.opt.env.get("PATH").unwrap_or_default().to_string();
        let exec_path = fileutil::find_exec_in_container(
            &self.container_root,
            &name,
            &path,
            &self.opt.cwd,
            &self.opt.vol,
        )
        .ok_or_else(|| Error::CommandNotFound(name.clone()))?;

        debug!("Executable {} resolved to {}", name, exec_path);
        self.exec_path = exec_path.clone();
        Ok(exec_path)
    }

    // =========================================================================
    // Metadata
    // =========================================================================

    /// Loads the container directory and merges image metadata into the
    /// options. Returns `None` when running a plain `location`.
    pub fn run_load_metadata(&mut self, container_id: &str) -> Result<Option<PathBuf>> {
        if self.opt.location.is_some() {
            return Ok(None);
        }

        let (container_dir, meta) = self
            .repo
            .get_container_attr(container_id)
            .ok_or_else(|| Error::MetadataNotFound(container_id.to_string()))?;
        if self.opt.nometa {
            return Ok(Some(container_dir));
        }

        if self.opt.user.is_empty() {
            self.opt.user = meta.user().unwrap_or_default();
        }
        if self.opt.cwd.is_empty() {
            self.opt.cwd = meta.working_dir().unwrap_or_default();
        }
        if self.opt.hostname.is_empty() {
            self.opt.hostname = meta.hostname().unwrap_or_default();
        }
        if self.opt.domain.is_empty() {
            self.opt.domain = meta.domainname().unwrap_or_default();
        }
        if self.opt.entryp.is_none() {
            self.opt.entryp = meta.entrypoint();
        }
        if self.opt.cmd.is_empty() {
            self.opt.cmd = meta.cmd().unwrap_or_default();
        }
        self.opt.portsexp.extend(meta.exposed_ports());
        self.opt.declared_volumes = meta.volumes();

        let mut env = Uenv::new();
        for entry in meta.env() {
            if let Err(e) = env.append(&entry) {
                warn!("Ignoring image environment entry: {}", e);
            }
        }
        env.extend(&self.opt.env);
        self.opt.env = env;

        Ok(Some(container_dir))
    }

    // =========================================================================
    // Users
    // =========================================================================

    /// passwd and group files describing the container's users.
    pub fn select_auth_files(&self) -> (PathBuf, PathBuf) {
        let filebind = self
            .container_dir
            .as_deref()
            .map(|dir| FileBind::new(dir, &self.config.tmpdir));

        let select = |cont_file: &str| -> PathBuf {
            let in_root = self.container_root.join(cont_file.trim_start_matches('/'));
            if in_root.is_symlink() {
                if let Some(orig) = filebind.as_ref().map(|fb| fb.orig_file(cont_file)) {
                    if orig.exists() {
                        return orig;
                    }
                }
            }
            if let Some(host) = self.is_mountpoint(cont_file) {
                return PathBuf::from(host);
            }
            let mapped = fileutil::cont2host(&self.container_root, cont_file, &self.opt.vol);
            if mapped.is_file() {
                return mapped;
            }
            in_root
        };

        (select("/etc/passwd"), select("/etc/group"))
    }

    fn apply_user(&mut self, entry: &PasswdEntry) {
        self.opt.user = entry.name.clone();
        self.opt.uid = Some(entry.uid);
        self.opt.gid = Some(entry.gid);
        if self.opt.home.is_empty() {
            self.opt.home = entry.home.clone();
        }
        if self.opt.shell.is_empty() {
            self.opt.shell = entry.shell.clone();
        }
        if self.opt.gecos.is_empty() {
            self.opt.gecos = entry.gecos.clone();
        }
    }

    /// Completes a user known only by uid with default account values.
    pub fn fill_user(&mut self) {
        let uid = self.opt.uid.unwrap_or(0);
        if self.opt.user.is_empty() || self.opt.user.chars().all(|c| c.is_ascii_digit() || c == ':') {
            self.opt.user = if uid == 0 {
                "root".to_string()
            } else {
                format!("udoc{}", uid)
            };
        }
        if self.opt.home.is_empty() {
            self.opt.home = if uid == 0 {
                "/root".to_string()
            } else {
                format!("/home/{}", self.opt.user)
            };
        }
        if self.opt.gid.is_none() {
            self.opt.gid = Some(uid);
        }
        if self.opt.shell.is_empty() {
            self.opt.shell = "/bin/sh".to_string();
        }
        if self.opt.gecos.is_empty() {
            self.opt.gecos = "*UDOCK*".to_string();
        }
    }

    /// Writes passwd and group copies that contain the run user and arranges
    /// for them to be bound over the container's own files.
    pub fn create_user(&mut self, source: &NixAuthentication) -> Result<()> {
        fs::create_dir_all(&self.config.tmpdir)?;
        let tmp = tempfile::Builder::new()
            .prefix("udock-auth-")
            .tempdir_in(&self.config.tmpdir)?;
        let passwd = tmp.path().join("passwd");
        let group = tmp.path().join("group");
        for (src, dst) in [(source.passwd_file(), &passwd), (source.group_file(), &group)] {
            if src.is_file() {
                fs::copy(src, dst)?;
            } else {
                fs::write(dst, "")?;
            }
        }

        let uid = self.opt.uid.unwrap_or(0);
        let gid = self.opt.gid.unwrap_or(uid);
        let auth = NixAuthentication::new(&passwd, &group);
        if auth.get_user(&UserSpec::Ids { uid, gid: None }).is_none() {
            auth.add_user(&PasswdEntry {
                name: self.opt.user.clone(),
                uid,
                gid,
                gecos: self.opt.gecos.clone(),
                home: self.opt.home.clone(),
                shell: self.opt.shell.clone(),
            })?;
        }
        if auth.get_group_by_gid(gid).is_none() {
            auth.add_group(&self.opt.user, gid, &[])?;
        }
        if uid == self.host.uid {
            for host_gid in &self.host.groups {
                if auth.get_group_by_gid(*host_gid).is_none() {
                    let name = NixAuthentication::host()
                        .get_group_by_gid(*host_gid)
                        .map(|g| g.name)
                        .unwrap_or_else(|| format!("udocg{}", host_gid));
                    if auth.get_group_by_name(&name).is_none() {
                        auth.add_group(&name, *host_gid, &[self.opt.user.clone()])?;
                    }
                }
            }
        }

        self.hostauth_list = vec![
            format!("{}:/etc/passwd", passwd.display()),
            format!("{}:/etc/group", group.display()),
        ];
        self.opt.hostauth = true;
        debug!("Generated auth files in {}", tmp.path().display());
        self.auth_copies = Some(tmp);
        Ok(())
    }

    /// Resolves the run user against the container (or host) accounts.
    pub fn setup_container_user(&mut self) -> Result<()> {
        if self.opt.hostauth && self.opt.containerauth {
            return Err(Error::InvalidOption(
                "--hostauth and --containerauth are mutually exclusive".to_string(),
            ));
        }
        let spec = validate_user_str(&self.opt.user)?;
        if !self.root_capable {
            return self.setup_container_user_noroot(spec);
        }
        let spec = spec.unwrap_or(UserSpec::Ids { uid: 0, gid: None });

        let auth = if self.opt.hostauth {
            NixAuthentication::host()
        } else {
            let (passwd, group) = self.select_auth_files();
            NixAuthentication::new(passwd, group)
        };

        if let Some(entry) = auth.get_user(&spec) {
            self.apply_user(&entry);
            if let UserSpec::Ids { gid: Some(gid), .. } = spec {
                self.opt.gid = Some(gid);
            }
            return Ok(());
        }

        match spec {
            UserSpec::Name(name) => Err(Error::UserNotFound(name)),
            UserSpec::Ids { uid, .. } if self.opt.containerauth || self.opt.hostauth => {
                Err(Error::UserNotFound(uid.to_string()))
            }
            UserSpec::Ids { uid, gid } => {
                self.opt.uid = Some(uid);
                self.opt.gid = gid;
                self.opt.user.clear();
                self.fill_user();
                self.create_user(&auth)
            }
        }
    }

    /// User setup for backends that always run as the invoking user.
    fn setup_container_user_noroot(&mut self, spec: Option<UserSpec>) -> Result<()> {
        let requested_other = match &spec {
            Some(UserSpec::Ids { uid, .. }) => *uid != self.host.uid,
            Some(UserSpec::Name(name)) => *name != self.host.username,
            None => false,
        };
        if requested_other {
            warn!("This execution mode cannot change uid, running as {}", self.host.uid);
        }
        self.opt.uid = Some(self.host.uid);
        self.opt.gid = Some(self.host.gid);

        let auth = if self.opt.hostauth {
            NixAuthentication::host()
        } else {
            let (passwd, group) = self.select_auth_files();
            NixAuthentication::new(passwd, group)
        };
        if let Some(entry) = auth.get_user(&UserSpec::Ids {
            uid: self.host.uid,
            gid: None,
        }) {
            self.apply_user(&entry);
            self.opt.gid = Some(self.host.gid);
            return Ok(());
        }
        if self.opt.containerauth {
            return Err(Error::UserNotFound(self.host.uid.to_string()));
        }

        self.opt.user = self.host.username.clone();
        self.fill_user();
        self.create_user(&auth)
    }

    // =========================================================================
    // Environment
    // =========================================================================

    /// Sets the standard variables seen inside every container.
    pub fn run_env_set(&mut self) -> Result<()> {
        let env = &mut self.opt.env;
        env.set("HOME", &self.opt.home)?;
        env.set("USER", &self.opt.user)?;
        env.set("LOGNAME", &self.opt.user)?;
        env.set("USERNAME", &self.opt.user)?;
        env.set("SHLVL", "0")?;
        env.set_if_absent("PS1", &format!("{}[{}] \\W $ ", self.opt.user, short_id(&self.container_id)))?;

        env.set("container_ruser", &self.host.username)?;
        env.set("container_root", &self.container_root.to_string_lossy())?;
        env.set("container_uuid", &self.container_id)?;
        env.set("container_execmode", self.mode.as_str())?;
        env.set("container_names", &self.container_names.join(" "))?;
        Ok(())
    }

    /// Host variables passed through to the backend process.
    pub fn host_env(&self) -> Vec<(String, String)> {
        self.host_env_from(std::env::vars())
    }

    /// [`host_env`](Self::host_env) over an explicit variable list.
    pub fn host_env_from(&self, vars: impl IntoIterator<Item = (String, String)>) -> Vec<(String, String)> {
        vars.into_iter()
            .filter(|(name, _)| self.opt.hostenv || self.config.valid_host_env.contains(name))
            .filter(|(name, _)| !self.config.invalid_host_env.contains(name))
            .collect()
    }

    // =========================================================================
    // Run
    // =========================================================================

    /// Prepares the container for one run and returns its root.
    pub fn run_init(&mut self, container_id: &str) -> Result<PathBuf> {
        self.container_id = container_id.to_string();
        self.container_dir = self.run_load_metadata(container_id)?;

        self.container_root = match (&self.opt.location, &self.container_dir) {
            (Some(location), _) => location.clone(),
            (None, Some(dir)) => dir.join(CONTAINER_ROOT_DIR),
            (None, None) => return Err(Error::ContainerNotFound(container_id.to_string())),
        };
        if !self.container_root.is_dir() {
            return Err(Error::ContainerNotFound(container_id.to_string()));
        }

        if self.opt.location.is_none() {
            self.container_names = self.repo.get_container_name(container_id);
        }
        if self.mount_policy != MountPolicy::None {
            if let Some(dir) = &self.container_dir {
                self.mountp = Some(MountPoint::new(dir, &self.container_root));
            }
        }

        self.check_exposed_ports()?;
        self.setup_container_user()?;
        self.set_volume_bindings()?;
        self.check_paths()?;
        self.check_executable()?;

        Ok(self.container_root.clone())
    }

    /// Logs the start of a run.
    pub fn run_banner(&self) {
        info!(
            container = %self.container_id,
            mode = %self.mode,
            user = %self.opt.user,
            "Executing {}",
            self.exec_path
        );
    }

    /// Exit code of a finished backend, `128 + signal` if it was killed.
    pub fn exit_status(status: ExitStatus) -> i32 {
        match (status.code(), status.signal()) {
            (Some(code), _) => code,
            (None, Some(signal)) => 128 + signal,
            (None, None) => 1,
        }
    }

    /// Spawns the backend with inherited stdio and waits for it.
    pub async fn execute(&self, mut cmd: tokio::process::Command) -> Result<i32> {
        debug!("Spawning {:?}", cmd.as_std());
        let status = cmd
            .stdin(Stdio::inherit())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .status()
            .await
            .map_err(|e| Error::ExecFailed {
                container: self.container_id.clone(),
                reason: e.to_string(),
            })?;
        let code = Self::exit_status(status);
        debug!(container = %self.container_id, code, "Backend exited");
        Ok(code)
    }
}

/// Picks a backend executable.
///
/// `configured` is the configuration value: empty searches `host_names` on
/// the host PATH and then the bundled names, `UDOCKER` only the bundled
/// names, anything else is taken as a path.
pub fn select_executable(
    tool: &str,
    configured: &str,
    host: &HostInfo,
    host_names: &[&str],
    bindir: &Path,
    bundled: &[String],
) -> Result<PathBuf> {
    let not_found = |hint: String| Error::BackendNotFound {
        tool: tool.to_string(),
        hint,
    };
    let find_bundled = || {
        fileutil::find_file_in_dir(bindir, bundled)
            .ok_or_else(|| not_found(format!("tried {:?} in {}", bundled, bindir.display())))
    };

    let exe = match configured {
        "" => match host_names.iter().find_map(|name| host.find_exec(name)) {
            Some(exe) => exe,
            None => find_bundled()?,
        },
        "UDOCKER" => find_bundled()?,
        path => {
            let path = PathBuf::from(path);
            if !path.exists() {
                return Err(not_found(format!("{} does not exist", path.display())));
            }
            path
        }
    };
    debug!("Using {} executable {}", tool, exe.display());
    Ok(exe)
}

/// Turns an argv and environment into a command with nothing else inherited.
pub fn build_command(argv: &[String], env: &[(String, String)]) -> Result<tokio::process::Command> {
    let (program, args) = argv
        .split_first()
        .ok_or_else(|| Error::Internal("empty backend command line".to_string()))?;
    let mut cmd = tokio::process::Command::new(program);
    cmd.args(args).env_clear().envs(env.iter().map(|(k, v)| (k, v)));
    Ok(cmd)
}

fn short_id(id: &str) -> &str {
    id.get(..8).unwrap_or(id)
}
