//! Process-wide configuration.
//!
//! Built once at start-up from defaults, an optional JSON file and `UDOCK_*`
//! environment variables, then shared read-only (usually as `Arc<Config>`)
//! by every component. Nothing mutates it after [`Config::load`] returns.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::constants::{
    DEFAULT_ACCESS_FILES, DEFAULT_CMD, DEFAULT_DRI_DIRS, DEFAULT_HOSTAUTH_FILES,
    DEFAULT_INVALID_HOST_ENV, DEFAULT_ROOT_PATH, DEFAULT_RUNC_CAPABILITIES, DEFAULT_SYSDIRS,
    DEFAULT_USER_PATH, DEFAULT_VALID_HOST_ENV,
};
use crate::error::{Error, Result};
use crate::execmode::ModeTag;

/// Name of the configuration file looked up in the top directory.
pub const CONFIG_FILE_NAME: &str = "udock.json";

/// Immutable configuration shared by all components.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Repository top directory.
    pub topdir: PathBuf,
    /// Bundled backend executables; `<topdir>/bin` when unset.
    pub bindir: Option<PathBuf>,
    /// Bundled libraries (libfakechroot); `<topdir>/lib` when unset.
    pub libdir: Option<PathBuf>,
    /// Scratch directory for per-run files.
    pub tmpdir: PathBuf,
    /// Mode used by containers without a mode tag.
    pub default_execution_mode: ModeTag,
    /// Command used when neither image nor user gives one.
    pub cmd: Vec<String>,
    pub root_path: String,
    pub user_path: String,
    pub sysdirs_list: Vec<String>,
    pub dri_list: Vec<String>,
    pub hostauth_list: Vec<String>,
    pub access_files: Vec<String>,
    /// CPU pinning tools in priority order; `%s` is replaced by the cpuset.
    pub cpu_affinity_exec_tools: Vec<Vec<String>>,
    pub valid_host_env: Vec<String>,
    pub invalid_host_env: Vec<String>,
    pub runc_capabilities: Vec<String>,
    /// Drop the `/dev/mqueue` mount from generated OCI specs.
    pub runc_nomqueue: bool,
    /// `""` searches the host PATH, `"UDOCKER"` forces the bundled binary,
    /// anything else is taken as a path.
    pub use_proot_executable: String,
    pub use_runc_executable: String,
    pub use_singularity_executable: String,
    pub proot_noseccomp: Option<bool>,
    pub proot_killonexit: bool,
    /// Preload library names or an absolute path.
    pub fakechroot_so: Vec<String>,
    pub fakechroot_expand_symlinks: Option<bool>,
    pub singularity_options: Vec<String>,
}

fn strings(list: &[&str]) -> Vec<String> {
    list.iter().map(|s| s.to_string()).collect()
}

impl Default for Config {
    fn default() -> Self {
        let topdir = dirs::home_dir()
            .map(|home| home.join(".udock"))
            .unwrap_or_else(|| PathBuf::from(".udock"));

        Self {
            topdir,
            bindir: None,
            libdir: None,
            tmpdir: std::env::temp_dir(),
            default_execution_mode: ModeTag::P1,
            cmd: strings(DEFAULT_CMD),
            root_path: DEFAULT_ROOT_PATH.to_string(),
            user_path: DEFAULT_USER_PATH.to_string(),
            sysdirs_list: strings(DEFAULT_SYSDIRS),
            dri_list: strings(DEFAULT_DRI_DIRS),
            hostauth_list: strings(DEFAULT_HOSTAUTH_FILES),
            access_files: strings(DEFAULT_ACCESS_FILES),
            cpu_affinity_exec_tools: vec![
                strings(&["numactl", "-C", "%s", "--"]),
                strings(&["taskset", "-c", "%s"]),
            ],
            valid_host_env: strings(DEFAULT_VALID_HOST_ENV),
            invalid_host_env: strings(DEFAULT_INVALID_HOST_ENV),
            runc_capabilities: strings(DEFAULT_RUNC_CAPABILITIES),
            runc_nomqueue: false,
            use_proot_executable: String::new(),
            use_runc_executable: String::new(),
            use_singularity_executable: String::new(),
            proot_noseccomp: None,
            proot_killonexit: true,
            fakechroot_so: Vec::new(),
            fakechroot_expand_symlinks: None,
            singularity_options: strings(&["-w"]),
        }
    }
}

impl Config {
    /// Creates the default configuration rooted at `topdir`.
    pub fn with_topdir(topdir: impl Into<PathBuf>) -> Self {
        Self {
            topdir: topdir.into(),
            ..Self::default()
        }
    }

    /// Loads defaults, then `path` (or `<topdir>/udock.json` if present),
    /// then `UDOCK_*` environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = Self::default();
        if let Ok(dir) = std::env::var("UDOCK_DIR") {
            config.topdir = PathBuf::from(dir);
        }

        let file = path
            .map(Path::to_path_buf)
            .unwrap_or_else(|| config.topdir.join(CONFIG_FILE_NAME));
        if file.is_file() {
            config = Self::from_file(&file)?;
        } else if path.is_some() {
            return Err(Error::Config {
                path: file,
                reason: "file not found".to_string(),
            });
        }

        config.apply_overrides(|key| std::env::var(key).ok())?;
        debug!("Configuration loaded, topdir {}", config.topdir.display());
        Ok(config)
    }

    /// Parses a JSON configuration file; absent keys keep their defaults.
    pub fn from_file(path: &Path) -> Result<Self> {
        let data = fs::read_to_string(path).map_err(|e| Error::Config {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        serde_json::from_str(&data).map_err(|e| Error::Config {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })
    }

    /// Applies environment style overrides looked up through `lookup`.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(dir) = lookup("UDOCK_DIR") {
            self.topdir = PathBuf::from(dir);
        }
        if let Some(dir) = lookup("UDOCK_BIN") {
            self.bindir = Some(PathBuf::from(dir));
        }
        if let Some(dir) = lookup("UDOCK_LIB") {
            self.libdir = Some(PathBuf::from(dir));
        }
        if let Some(dir) = lookup("UDOCK_TMP") {
            self.tmpdir = PathBuf::from(dir);
        }
        if let Some(mode) = lookup("UDOCK_DEFAULT_EXECUTION_MODE") {
            self.default_execution_mode = mode.parse()?;
        }
        if let Some(exe) = lookup("UDOCK_USE_PROOT_EXECUTABLE") {
            self.use_proot_executable = exe;
        }
        if let Some(exe) = lookup("UDOCK_USE_RUNC_EXECUTABLE") {
            self.use_runc_executable = exe;
        }
        if let Some(exe) = lookup("UDOCK_USE_SINGULARITY_EXECUTABLE") {
            self.use_singularity_executable = exe;
        }
        if let Some(lib) = lookup("UDOCK_FAKECHROOT_SO") {
            self.fakechroot_so = vec![lib];
        }
        if let Some(flag) = lookup("UDOCK_NOSECCOMP") {
            self.proot_noseccomp = Some(!matches!(flag.as_str(), "" | "0" | "false" | "no"));
        }
        Ok(())
    }

    /// Directory of bundled backend executables.
    pub fn bindir(&self) -> PathBuf {
        self.bindir.clone().unwrap_or_else(|| self.topdir.join("bin"))
    }

    /// Directory of bundled libraries.
    pub fn libdir(&self) -> PathBuf {
        self.libdir.clone().unwrap_or_else(|| self.topdir.join("lib"))
    }
}
