//! Dynamic loader and ELF interpreter patching for the Fakechroot modes.
//!
//! F2 runs every program through a private copy of the container's loader
//! whose built-in search paths (`/etc/ld.so.*`, `/lib`, `/usr`) are blanked
//! out, so library lookups only follow the `LD_LIBRARY_REAL` list set by the
//! engine. F3 additionally rewrites the `PT_INTERP` of every ELF file in the
//! root to the host path of that loader using `patchelf`.
//!
//! State kept in the container directory:
//!
//! | File          | Meaning                                           |
//! |---------------|---------------------------------------------------|
//! | `ld.so.orig`  | pristine loader, written once                     |
//! | `ld.so.path`  | container root the binaries were patched against  |
//! | `patch.time`  | seconds since the epoch of the last patch run     |

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::{SystemTime, UNIX_EPOCH};

use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::constants::{
    CONTAINER_ROOT_DIR, LD_SO_ORIG_FILE, LD_SO_PATH_FILE, PATCH_TIME_FILE,
};
use crate::error::{Error, Result};
use crate::fileutil;
use crate::platform::HostInfo;

/// Loader locations probed inside the container, in order.
const LOADER_CANDIDATES: &[&str] = &[
    "/lib64/ld-linux-x86-64.so.2",
    "/lib/ld-linux-aarch64.so.1",
    "/lib/ld-linux-armhf.so.3",
    "/lib/ld-linux.so.2",
    "/lib64/ld64.so.2",
    "/lib/ld-musl-x86_64.so.1",
    "/lib/ld-musl-aarch64.so.1",
];

/// Library directories searched when nothing else is configured.
const DEFAULT_LIB_DIRS: &[&str] = &["/lib64", "/usr/lib64", "/lib", "/usr/lib"];

/// Strings blanked in the loader copy.
const LOADER_SEARCH_PATHS: &[&[u8]] = &[b"\0/etc/ld.so", b"\0/lib", b"\0/usr"];

/// ELF patching operations used by mode transitions and the Fakechroot engine.
pub trait ElfPatch: Send + Sync {
    /// `patchelf` executable, bundled or from the host PATH.
    fn select_patchelf(&self) -> Option<PathBuf>;

    /// Host path of the container's dynamic loader.
    fn get_container_loader(&self) -> Option<PathBuf>;

    /// Container library directories mapped to host paths, `:` separated.
    fn get_ld_library_path(&self) -> String;

    /// Blanks the default search paths of the container loader.
    fn patch_ld(&self) -> Result<()>;

    /// Puts the saved pristine loader back; nothing to do if never patched.
    fn restore_ld(&self) -> Result<()>;

    /// Points every ELF interpreter at the host path of the loader.
    fn patch_binaries(&self) -> Result<()>;

    /// Reverts [`patch_binaries`](Self::patch_binaries).
    fn restore_binaries(&self) -> Result<()>;

    /// False if the binaries were patched for a different root path.
    fn check_container_path(&self) -> bool;

    /// Timestamp of the last patch run, `"0"` if never.
    fn get_patch_last_time(&self) -> String;
}

/// [`ElfPatch`] over a container directory.
#[derive(Debug, Clone)]
pub struct ElfPatcher {
    container_dir: PathBuf,
    container_root: PathBuf,
    bindir: PathBuf,
    arch_suffix: String,
    host_path: String,
}

impl ElfPatcher {
    pub fn new(container_dir: &Path, bindir: &Path, host: &HostInfo) -> Self {
        Self {
            container_dir: container_dir.to_path_buf(),
            container_root: container_dir.join(CONTAINER_ROOT_DIR),
            bindir: bindir.to_path_buf(),
            arch_suffix: host.arch.binary_suffix().to_string(),
            host_path: host.path.clone(),
        }
    }

    fn state_file(&self, name: &str) -> PathBuf {
        self.container_dir.join(name)
    }

    fn require_patchelf(&self) -> Result<PathBuf> {
        self.select_patchelf().ok_or_else(|| Error::BackendNotFound {
            tool: "patchelf".to_string(),
            hint: format!(
                "install patchelf or place patchelf-{} in {}",
                self.arch_suffix,
                self.bindir.display()
            ),
        })
    }

    /// Host path of the loader as a string, the interpreter F3 binaries use.
    fn host_loader(&self) -> Result<String> {
        self.get_container_loader()
            .map(|p| p.to_string_lossy().into_owned())
            .ok_or_else(|| Error::ElfPatch("no dynamic loader found in container".to_string()))
    }

    /// Overwrites every string starting with one of `patterns` by NULs.
    fn blank_strings(data: &mut [u8], patterns: &[&[u8]]) -> usize {
        let mut blanked = 0;
        for pattern in patterns {
            let mut pos = 0;
            while pos + pattern.len() <= data.len() {
                if &data[pos..pos + pattern.len()] == *pattern {
                    let mut end = pos + 1;
                    while end < data.len() && data[end] != 0 {
                        data[end] = 0;
                        end += 1;
                    }
                    blanked += 1;
                    pos = end;
                } else {
                    pos += 1;
                }
            }
        }
        blanked
    }

    /// Replaces `from` with the same-length `to` everywhere.
    fn replace_same_len(data: &mut [u8], from: &[u8], to: &[u8]) {
        debug_assert_eq!(from.len(), to.len());
        let mut pos = 0;
        while pos + from.len() <= data.len() {
            if &data[pos..pos + from.len()] == from {
                data[pos..pos + to.len()].copy_from_slice(to);
                pos += from.len();
            } else {
                pos += 1;
            }
        }
    }

    fn is_elf(path: &Path) -> bool {
        let mut magic = [0u8; 4];
        fs::File::open(path)
            .and_then(|mut f| std::io::Read::read_exact(&mut f, &mut magic))
            .map(|_| &magic == b"\x7fELF")
            .unwrap_or(false)
    }

    /// Regular ELF files under the root.
    fn elf_files(&self) -> Vec<PathBuf> {
        WalkDir::new(&self.container_root)
            .follow_links(false)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file())
            .filter(|e| {
                let is_lib = e.file_name().to_string_lossy().contains(".so");
                e.metadata()
                    .map(|m| is_lib || m.permissions().mode() & 0o111 != 0)
                    .unwrap_or(false)
            })
            .map(|e| e.into_path())
            .filter(|p| Self::is_elf(p))
            .collect()
    }

    fn print_interpreter(patchelf: &Path, file: &Path) -> Option<String> {
        let out = Command::new(patchelf)
            .arg("--print-interpreter")
            .arg(file)
            .stdin(Stdio::null())
            .stderr(Stdio::null())
            .output()
            .ok()?;
        if !out.status.success() {
            return None;
        }
        let interp = String::from_utf8_lossy(&out.stdout).trim().to_string();
        (!interp.is_empty()).then_some(interp)
    }

    fn set_interpreter(patchelf: &Path, file: &Path, interpreter: &str) -> bool {
        Command::new(patchelf)
            .arg("--set-interpreter")
            .arg(interpreter)
            .arg(file)
            .stdin(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .map(|s| s.success())
            .unwrap_or(false)
    }

    /// Directories named in `ld.so.conf`, following `include` lines.
    fn ld_so_conf_dirs(&self, conf: &str, depth: usize, dirs: &mut Vec<String>) {
        if depth > 4 {
            return;
        }
        let host_conf = fileutil::resolve_in_root(&self.container_root, conf);
        let Ok(data) = fs::read_to_string(&host_conf) else {
            return;
        };
        for line in data.lines() {
            let line = line.split('#').next().unwrap_or("").trim();
            if let Some(pattern) = line.strip_prefix("include") {
                for included in self.expand_include(conf, pattern.trim()) {
                    self.ld_so_conf_dirs(&included, depth + 1, dirs);
                }
            } else if line.starts_with('/') && !dirs.iter().any(|d| d == line) {
                dirs.push(line.to_string());
            }
        }
    }

    /// Expands a simple `dir/*.conf` include pattern to container paths.
    fn expand_include(&self, conf: &str, pattern: &str) -> Vec<String> {
        let pattern = if pattern.starts_with('/') {
            pattern.to_string()
        } else {
            let base = Path::new(conf)
                .parent()
                .map(|p| p.to_string_lossy().into_owned())
                .unwrap_or_default();
            format!("{}/{}", base, pattern)
        };
        let (dir, file_pat) = pattern.rsplit_once('/').unwrap_or(("/", pattern.as_str()));
        let Some((prefix, suffix)) = file_pat.split_once('*') else {
            return vec![pattern.clone()];
        };

        let host_dir = fileutil::resolve_in_root(&self.container_root, dir);
        let mut names: Vec<String> = fs::read_dir(host_dir)
            .map(|entries| {
                entries
                    .flatten()
                    .map(|e| e.file_name().to_string_lossy().into_owned())
                    .filter(|n| n.starts_with(prefix) && n.ends_with(suffix))
                    .collect()
            })
            .unwrap_or_default();
        names.sort();
        names.into_iter().map(|n| format!("{}/{}", dir, n)).collect()
    }
}

impl ElfPatch for ElfPatcher {
    fn select_patchelf(&self) -> Option<PathBuf> {
        let names = vec![format!("patchelf-{}", self.arch_suffix), "patchelf".to_string()];
        fileutil::find_file_in_dir(&self.bindir, &names)
            .filter(|p| fileutil::is_executable_file(p))
            .or_else(|| fileutil::find_in_path("patchelf", &self.host_path))
    }

    fn get_container_loader(&self) -> Option<PathBuf> {
        LOADER_CANDIDATES
            .iter()
            .map(|cand| fileutil::resolve_in_root(&self.container_root, cand))
            .find(|host| host.is_file())
    }

    fn get_ld_library_path(&self) -> String {
        let mut dirs = Vec::new();
        self.ld_so_conf_dirs("/etc/ld.so.conf", 0, &mut dirs);
        for dir in DEFAULT_LIB_DIRS {
            if !dirs.iter().any(|d| d == dir) {
                dirs.push(dir.to_string());
            }
        }
        dirs.iter()
            .map(|d| self.container_root.join(d.trim_start_matches('/')))
            .filter(|host| host.is_dir())
            .map(|host| host.to_string_lossy().into_owned())
            .collect::<Vec<_>>()
            .join(":")
    }

    fn patch_ld(&self) -> Result<()> {
        let loader = self
            .get_container_loader()
            .ok_or_else(|| Error::ElfPatch("no dynamic loader found in container".to_string()))?;
        let orig = self.state_file(LD_SO_ORIG_FILE);
        if !orig.exists() {
            fs::copy(&loader, &orig)?;
        }

        let mut data = fs::read(&orig)?;
        let blanked = Self::blank_strings(&mut data, LOADER_SEARCH_PATHS);
        Self::replace_same_len(&mut data, b"\0LD_LIBRARY_PATH\0", b"\0LD_LIBRARY_REAL\0");
        fs::write(&loader, &data)?;
        info!("Patched loader {} ({} search paths blanked)", loader.display(), blanked);
        Ok(())
    }

    fn restore_ld(&self) -> Result<()> {
        let orig = self.state_file(LD_SO_ORIG_FILE);
        if !orig.is_file() {
            debug!("Loader never patched, nothing to restore");
            return Ok(());
        }
        let loader = self
            .get_container_loader()
            .ok_or_else(|| Error::ElfPatch("no dynamic loader found in container".to_string()))?;
        fs::copy(&orig, &loader)?;
        info!("Restored loader {}", loader.display());
        Ok(())
    }

    fn patch_binaries(&self) -> Result<()> {
        let patchelf = self.require_patchelf()?;
        let loader = self.host_loader()?;

        let mut patched = 0;
        for file in self.elf_files() {
            if Self::print_interpreter(&patchelf, &file).is_some_and(|i| i != loader)
                && Self::set_interpreter(&patchelf, &file, &loader)
            {
                patched += 1;
            }
        }

        fs::write(
            self.state_file(LD_SO_PATH_FILE),
            self.container_root.to_string_lossy().as_bytes(),
        )?;
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        fs::write(self.state_file(PATCH_TIME_FILE), now.to_string())?;
        info!("Patched interpreter of {} binaries", patched);
        Ok(())
    }

    fn restore_binaries(&self) -> Result<()> {
        let path_file = self.state_file(LD_SO_PATH_FILE);
        let Ok(patched_root) = fs::read_to_string(&path_file) else {
            debug!("Binaries never patched, nothing to restore");
            return Ok(());
        };
        let patched_root = patched_root.trim().to_string();
        let patchelf = self.require_patchelf()?;

        let mut restored = 0;
        for file in self.elf_files() {
            let Some(interp) = Self::print_interpreter(&patchelf, &file) else {
                continue;
            };
            let Some(original) = interp.strip_prefix(&patched_root) else {
                continue;
            };
            if original.starts_with('/') && Self::set_interpreter(&patchelf, &file, original) {
                restored += 1;
            } else {
                warn!("Cannot restore interpreter of {}", file.display());
            }
        }

        fileutil::remove_if_exists(&path_file)?;
        fileutil::remove_if_exists(&self.state_file(PATCH_TIME_FILE))?;
        info!("Restored interpreter of {} binaries", restored);
        Ok(())
    }

    fn check_container_path(&self) -> bool {
        match fs::read_to_string(self.state_file(LD_SO_PATH_FILE)) {
            Ok(recorded) => {
                let canonical = |p: &Path| fs::canonicalize(p).unwrap_or_else(|_| p.to_path_buf());
                canonical(Path::new(recorded.trim())) == canonical(&self.container_root)
            }
            Err(_) => true,
        }
    }

    fn get_patch_last_time(&self) -> String {
        fs::read_to_string(self.state_file(PATCH_TIME_FILE))
            .map(|t| t.trim().to_string())
            .unwrap_or_else(|_| "0".to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixture() -> (tempfile::TempDir, ElfPatcher) {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("ROOT");
        fs::create_dir_all(root.join("lib64")).unwrap();
        fs::create_dir_all(root.join("usr/lib")).unwrap();
        let host = HostInfo {
            path: String::new(),
            ..HostInfo::detect()
        };
        let patcher = ElfPatcher::new(dir.path(), &dir.path().join("bin"), &host);
        (dir, patcher)
    }

    #[test]
    fn test_blank_strings() {
        let mut data = b"xx\0/lib/x86_64\0/etc/ld.so.cache\0keep\0".to_vec();
        let n = ElfPatcher::blank_strings(&mut data, LOADER_SEARCH_PATHS);
        assert_eq!(n, 2);
        assert_eq!(data.len(), 37);
        assert!(data.windows(4).any(|w| w == b"keep"));
        assert!(!data.windows(4).any(|w| w == b"/lib"));
    }

    #[test]
    fn test_patch_and_restore_ld() {
        let (dir, patcher) = fixture();
        let loader = dir.path().join("ROOT/lib64/ld-linux-x86-64.so.2");
        let original = b"\x7fELF\0/lib64/\0/usr/lib\0LD_LIBRARY_PATH\0".to_vec();
        fs::write(&loader, &original).unwrap();

        assert_eq!(patcher.get_container_loader(), Some(loader.clone()));
        patcher.patch_ld().unwrap();
        let patched = fs::read(&loader).unwrap();
        assert_eq!(patched.len(), original.len());
        assert!(patched.windows(15).any(|w| w == b"LD_LIBRARY_REAL"));
        assert!(dir.path().join(LD_SO_ORIG_FILE).is_file());

        // Patching twice starts from the saved original.
        patcher.patch_ld().unwrap();
        assert_eq!(fs::read(&loader).unwrap(), patched);

        patcher.restore_ld().unwrap();
        assert_eq!(fs::read(&loader).unwrap(), original);
    }

    #[test]
    fn test_restore_without_patch_is_noop() {
        let (_dir, patcher) = fixture();
        patcher.restore_ld().unwrap();
        patcher.restore_binaries().unwrap();
        assert!(patcher.check_container_path());
        assert_eq!(patcher.get_patch_last_time(), "0");
    }

    #[test]
    fn test_ld_library_path_follows_includes() {
        let (dir, patcher) = fixture();
        let root = dir.path().join("ROOT");
        fs::create_dir_all(root.join("etc/ld.so.conf.d")).unwrap();
        fs::create_dir_all(root.join("opt/lib")).unwrap();
        fs::write(root.join("etc/ld.so.conf"), "include ld.so.conf.d/*.conf\n").unwrap();
        fs::write(root.join("etc/ld.so.conf.d/opt.conf"), "# local\n/opt/lib\n").unwrap();

        let expected = [root.join("opt/lib"), root.join("lib64"), root.join("usr/lib")]
            .iter()
            .map(|p| p.to_string_lossy().into_owned())
            .collect::<Vec<_>>()
            .join(":");
        assert_eq!(patcher.get_ld_library_path(), expected);
    }

    #[test]
    fn test_loader_found_through_symlinked_topdir() {
        let dir = tempfile::tempdir().unwrap();
        let real = fs::canonicalize(dir.path()).unwrap().join("realtop");
        let root = real.join("ROOT");
        fs::create_dir_all(root.join("lib/x86_64-linux-gnu")).unwrap();
        fs::create_dir_all(root.join("lib64")).unwrap();
        fs::write(root.join("lib/x86_64-linux-gnu/ld-2.31.so"), b"\x7fELF\0/lib\0").unwrap();
        std::os::unix::fs::symlink(&real, dir.path().join("linktop")).unwrap();
        std::os::unix::fs::symlink(
            root.join("lib/x86_64-linux-gnu/ld-2.31.so"),
            root.join("lib64/ld-linux-x86-64.so.2"),
        )
        .unwrap();

        let linktop = dir.path().join("linktop");
        let patcher = ElfPatcher::new(&linktop, &linktop.join("bin"), &HostInfo::detect());
        assert_eq!(
            patcher.get_container_loader(),
            Some(linktop.join("ROOT/lib/x86_64-linux-gnu/ld-2.31.so"))
        );
        patcher.patch_ld().unwrap();

        fs::write(linktop.join(LD_SO_PATH_FILE), root.to_string_lossy().as_bytes()).unwrap();
        assert!(patcher.check_container_path());
    }

    #[test]
    fn test_check_container_path() {
        let (dir, patcher) = fixture();
        fs::write(dir.path().join(LD_SO_PATH_FILE), "/old/location/ROOT").unwrap();
        assert!(!patcher.check_container_path());
        fs::write(
            dir.path().join(LD_SO_PATH_FILE),
            dir.path().join("ROOT").to_string_lossy().as_bytes(),
        )
        .unwrap();
        assert!(patcher.check_container_path());
    }
}
