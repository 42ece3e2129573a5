//! Filesystem helpers working relative to a container root.
//!
//! Container paths are resolved on the host by walking them component by
//! component under the root, re-rooting absolute symlink targets, so a link
//! such as `/bin -> /usr/bin` inside the image never escapes to the host.

use std::collections::VecDeque;
use std::fs;
use std::os::unix::fs::{MetadataExt, PermissionsExt};
use std::path::{Path, PathBuf};

use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::constants::{LINKS_ROOT_FILE, MAX_SYMLINK_HOPS};
use crate::error::{Error, Result};
use crate::volume::{VolumeBinding, cleanpath};

/// True if `path` is a regular file with an execute bit.
pub fn is_executable_file(path: &Path) -> bool {
    fs::metadata(path)
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

/// Finds `name` on a host `PATH` string.
pub fn find_in_path(name: &str, path: &str) -> Option<PathBuf> {
    if name.contains('/') {
        let candidate = PathBuf::from(name);
        return is_executable_file(&candidate).then_some(candidate);
    }
    path.split(':')
        .filter(|dir| !dir.is_empty())
        .map(|dir| Path::new(dir).join(name))
        .find(|candidate| is_executable_file(candidate))
}

/// Returns the first of `names` that exists inside `dir`.
pub fn find_file_in_dir(dir: &Path, names: &[String]) -> Option<PathBuf> {
    names
        .iter()
        .map(|name| dir.join(name))
        .find(|candidate| candidate.exists())
}

/// Resolves a container path to a host path under `root`, following
/// symlinks inside the container.
pub fn resolve_in_root(root: &Path, cont_path: &str) -> PathBuf {
    // Converted links carry the canonical root, which differs from `root`
    // when the container directory is reached through a symlink.
    let mut host_roots = vec![root.to_string_lossy().into_owned()];
    if let Ok(canonical) = fs::canonicalize(root) {
        let canonical = canonical.to_string_lossy().into_owned();
        if canonical != host_roots[0] {
            host_roots.push(canonical);
        }
    }
    let mut resolved: Vec<String> = Vec::new();
    let mut pending: VecDeque<String> = cont_path.split('/').map(str::to_string).collect();
    let mut hops = 0;

    while let Some(part) = pending.pop_front() {
        match part.as_str() {
            "" | "." => continue,
            ".." => {
                resolved.pop();
                continue;
            }
            _ => {}
        }

        let mut host = root.to_path_buf();
        host.extend(&resolved);
        host.push(&part);

        let target = match fs::symlink_metadata(&host) {
            Ok(meta) if meta.file_type().is_symlink() && hops < MAX_SYMLINK_HOPS => {
                fs::read_link(&host).ok()
            }
            _ => None,
        };

        match target {
            Some(target) => {
                hops += 1;
                let mut target = target.to_string_lossy().into_owned();
                // Links already converted to host form point back into the root.
                let stripped = host_roots
                    .iter()
                    .filter_map(|host_root| target.strip_prefix(host_root.as_str()))
                    .find(|rest| rest.is_empty() || rest.starts_with('/'))
                    .map(|rest| format!("/{}", rest.trim_start_matches('/')));
                if let Some(stripped) = stripped {
                    target = stripped;
                }
                if target.starts_with('/') {
                    resolved.clear();
                }
                let mut next: VecDeque<String> = target.split('/').map(str::to_string).collect();
                next.extend(pending);
                pending = next;
            }
            None => resolved.push(part),
        }
    }

    let mut host = root.to_path_buf();
    host.extend(&resolved);
    host
}

/// Maps a container path to the host, honouring volume bindings first.
pub fn cont2host(root: &Path, cont_path: &str, vols: &[VolumeBinding]) -> PathBuf {
    let cont_path = cleanpath(cont_path);
    let mut best: Option<(&VolumeBinding, &str)> = None;
    for vol in vols {
        let prefix = vol.container_path.as_str();
        let rest = if cont_path == prefix {
            Some("")
        } else {
            cont_path
                .strip_prefix(prefix)
                .filter(|r| r.starts_with('/') || prefix == "/")
        };
        if let Some(rest) = rest {
            if best.is_none_or(|(b, _)| b.container_path.len() < prefix.len()) {
                best = Some((vol, rest));
            }
        }
    }

    match best {
        Some((vol, rest)) => {
            let rest = rest.trim_start_matches('/');
            if rest.is_empty() {
                PathBuf::from(&vol.host_path)
            } else {
                Path::new(&vol.host_path).join(rest)
            }
        }
        None => resolve_in_root(root, &cont_path),
    }
}

/// Searches an executable inside the container.
///
/// Names containing `/` are taken as paths (relative ones against `cwd`),
/// other names are looked up along the container `path`. Returns the
/// container-absolute path of the first executable regular file.
pub fn find_exec_in_container(
    root: &Path,
    name: &str,
    path: &str,
    cwd: &str,
    vols: &[VolumeBinding],
) -> Option<String> {
    let candidates: Vec<String> = if name.starts_with('/') {
        vec![cleanpath(name)]
    } else if name.contains('/') {
        vec![cleanpath(&format!("{}/{}", cwd, name))]
    } else {
        path.split(':')
            .filter(|dir| dir.starts_with('/'))
            .map(|dir| cleanpath(&format!("{}/{}", dir, name)))
            .collect()
    };

    candidates
        .into_iter()
        .find(|candidate| is_executable_file(&cont2host(root, candidate, vols)))
}

/// Copies `src` to `dst`, replacing whatever `dst` was (including a symlink).
pub fn copy_replace(src: &Path, dst: &Path) -> Result<()> {
    if fs::symlink_metadata(dst).is_ok() {
        fs::remove_file(dst)?;
    }
    if let Some(parent) = dst.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::copy(src, dst)?;
    Ok(())
}

/// Removes a file or symlink, ignoring a missing one.
pub fn remove_if_exists(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

// =============================================================================
// Link Conversion
// =============================================================================

/// Root recorded by [`record_link_root`], if links are in host form.
pub fn recorded_link_root(container_dir: &Path) -> Option<PathBuf> {
    let data = fs::read_to_string(container_dir.join(LINKS_ROOT_FILE)).ok()?;
    let root = data.trim();
    (!root.is_empty()).then(|| PathBuf::from(root))
}

/// Remembers the canonical `root` the links were converted against, or
/// forgets it when `root` is `None`.
pub fn record_link_root(container_dir: &Path, root: Option<&Path>) -> Result<()> {
    let file = container_dir.join(LINKS_ROOT_FILE);
    match root {
        Some(root) => {
            let root = fs::canonicalize(root).unwrap_or_else(|_| root.to_path_buf());
            fs::write(file, root.to_string_lossy().as_bytes())?;
            Ok(())
        }
        None => remove_if_exists(&file),
    }
}

/// Rewrites absolute symlinks under a container root.
pub trait LinkConvert: Send + Sync {
    /// `to_host = true` makes absolute links point at `root + target`,
    /// `false` strips that prefix again. Links owned by other users are left
    /// alone unless `force`. Paths in `exceptions` are skipped. Returns the
    /// links that were changed.
    fn links_conv(&self, to_host: bool, force: bool, exceptions: &[PathBuf])
    -> Result<Vec<PathBuf>>;
}

/// [`LinkConvert`] over a real container root.
#[derive(Debug, Clone)]
pub struct LinkConverter {
    root: PathBuf,
    /// Root the links were converted for, if the container has moved since.
    orig_root: Option<PathBuf>,
    uid: u32,
}

impl LinkConverter {
    pub fn new(root: impl Into<PathBuf>, uid: u32) -> Self {
        Self {
            root: root.into(),
            orig_root: None,
            uid,
        }
    }

    /// Also restores links that were converted under an older root path.
    pub fn with_orig_root(mut self, orig_root: Option<PathBuf>) -> Self {
        self.orig_root = orig_root;
        self
    }

    /// Refuses to touch trees that are obviously not container roots.
    fn is_safe_prefix(root: &Path) -> bool {
        root.is_absolute() && root.components().count() > 2
    }

    fn link_set(&self, link: &Path, root: &str) -> Option<PathBuf> {
        let target = fs::read_link(link).ok()?;
        let target = target.to_string_lossy();
        if !target.starts_with('/') || target.starts_with(root) {
            return None;
        }
        Some(PathBuf::from(format!("{}{}", root, target)))
    }

    fn link_restore(&self, link: &Path, root: &str) -> Option<PathBuf> {
        let target = fs::read_link(link).ok()?;
        let target = target.to_string_lossy();
        if !target.starts_with('/') {
            return None;
        }
        let orig = self
            .orig_root
            .as_ref()
            .map(|p| p.to_string_lossy().into_owned());
        let stripped = orig
            .as_deref()
            .and_then(|o| target.strip_prefix(o))
            .or_else(|| target.strip_prefix(root))?;
        if !stripped.starts_with('/') {
            return None;
        }
        Some(PathBuf::from(stripped))
    }

    fn apply(link: &Path, new_target: &Path, force: bool) -> Result<()> {
        let parent = link.parent().unwrap_or(Path::new("/"));
        let saved_mode = if force {
            let mode = fs::metadata(parent)?.permissions().mode();
            fs::set_permissions(parent, fs::Permissions::from_mode(mode | 0o700))?;
            Some(mode)
        } else {
            None
        };

        let result = fs::remove_file(link)
            .and_then(|_| std::os::unix::fs::symlink(new_target, link))
            .map_err(Error::from);

        if let Some(mode) = saved_mode {
            fs::set_permissions(parent, fs::Permissions::from_mode(mode))?;
        }
        result
    }
}

impl LinkConvert for LinkConverter {
    fn links_conv(
        &self,
        to_host: bool,
        force: bool,
        exceptions: &[PathBuf],
    ) -> Result<Vec<PathBuf>> {
        let root = fs::canonicalize(&self.root).unwrap_or_else(|_| self.root.clone());
        if !Self::is_safe_prefix(&root) {
            return Err(Error::LinkConversion(format!(
                "refusing to convert links outside of a container tree: {}",
                root.display()
            )));
        }
        let root_str = root.to_string_lossy().into_owned();

        let mut changed = Vec::new();
        for entry in WalkDir::new(&root).follow_links(false) {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    debug!("Skipping unreadable entry: {}", e);
                    continue;
                }
            };
            if !entry.path_is_symlink() || exceptions.iter().any(|p| p == entry.path()) {
                continue;
            }
            let Ok(meta) = entry.path().symlink_metadata() else {
                continue;
            };
            if !force && meta.uid() != self.uid {
                continue;
            }

            let new_target = if to_host {
                self.link_set(entry.path(), &root_str)
            } else {
                self.link_restore(entry.path(), &root_str)
            };
            if let Some(new_target) = new_target {
                match Self::apply(entry.path(), &new_target, force) {
                    Ok(()) => changed.push(entry.path().to_path_buf()),
                    Err(e) => warn!("Cannot convert link {}: {}", entry.path().display(), e),
                }
            }
        }

        debug!(
            "Converted {} links under {} (to_host={})",
            changed.len(),
            root.display(),
            to_host
        );
        Ok(changed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::symlink;

    fn make_exec(path: &Path) {
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, "#!/bin/sh\n").unwrap();
        fs::set_permissions(path, fs::Permissions::from_mode(0o755)).unwrap();
    }

    #[test]
    fn test_resolve_in_root_reroots_absolute_links() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        make_exec(&root.join("usr/bin/ls"));
        symlink("/usr/bin", root.join("bin")).unwrap();

        assert_eq!(resolve_in_root(root, "/bin/ls"), root.join("usr/bin/ls"));
    }

    #[test]
    fn test_cont2host_prefers_longest_volume() {
        let root = Path::new("/c/ROOT");
        let vols = vec![
            VolumeBinding::parse("/host/data:/data").unwrap(),
            VolumeBinding::parse("/host/deep:/data/deep").unwrap(),
        ];
        assert_eq!(cont2host(root, "/data/x", &vols), PathBuf::from("/host/data/x"));
        assert_eq!(cont2host(root, "/data/deep/y", &vols), PathBuf::from("/host/deep/y"));
        assert_eq!(cont2host(root, "/database", &vols), PathBuf::from("/c/ROOT/database"));
    }

    #[test]
    fn test_find_exec_in_container() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        make_exec(&root.join("bin/ls"));
        fs::write(root.join("bin/noexec"), "x").unwrap();

        let found = find_exec_in_container(root, "ls", "/usr/bin:/bin", "/", &[]);
        assert_eq!(found.as_deref(), Some("/bin/ls"));
        assert!(find_exec_in_container(root, "noexec", "/bin", "/", &[]).is_none());
        assert!(find_exec_in_container(root, "missing", "/bin", "/", &[]).is_none());
    }

    #[test]
    fn test_find_file_in_dir() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("proot"), "").unwrap();
        let names = vec!["proot-x86_64".to_string(), "proot".to_string()];
        assert_eq!(find_file_in_dir(dir.path(), &names), Some(dir.path().join("proot")));
        assert_eq!(find_file_in_dir(dir.path(), &names[..1]), None);
    }

    #[test]
    fn test_links_conv_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let root = fs::canonicalize(dir.path()).unwrap().join("ROOT");
        fs::create_dir_all(root.join("usr/lib")).unwrap();
        symlink("/usr/lib/libc.so.6", root.join("usr/lib/libc.so")).unwrap();
        symlink("relative", root.join("usr/lib/rel")).unwrap();

        // SAFETY: getuid cannot fail.
        let uid = unsafe { libc::getuid() };
        let conv = LinkConverter::new(&root, uid);

        let changed = conv.links_conv(true, false, &[]).unwrap();
        assert_eq!(changed, vec![root.join("usr/lib/libc.so")]);
        let converted = fs::read_link(root.join("usr/lib/libc.so")).unwrap();
        assert_eq!(converted, root.join("usr/lib/libc.so.6"));
        assert_eq!(fs::read_link(root.join("usr/lib/rel")).unwrap(), PathBuf::from("relative"));

        // Converting twice changes nothing.
        assert!(conv.links_conv(true, false, &[]).unwrap().is_empty());

        let restored = conv.links_conv(false, false, &[]).unwrap();
        assert_eq!(restored.len(), 1);
        assert_eq!(
            fs::read_link(root.join("usr/lib/libc.so")).unwrap(),
            PathBuf::from("/usr/lib/libc.so.6")
        );
    }

    #[test]
    fn test_resolve_in_root_through_symlinked_topdir() {
        let dir = tempfile::tempdir().unwrap();
        let real = fs::canonicalize(dir.path()).unwrap().join("realtop");
        let root = real.join("ROOT");
        fs::create_dir_all(root.join("lib64")).unwrap();
        make_exec(&root.join("lib/x86_64-linux-gnu/ld-2.31.so"));
        symlink(&real, dir.path().join("linktop")).unwrap();
        // Converted against the canonical root.
        symlink(
            root.join("lib/x86_64-linux-gnu/ld-2.31.so"),
            root.join("lib64/ld-linux-x86-64.so.2"),
        )
        .unwrap();

        let linked_root = dir.path().join("linktop/ROOT");
        assert_eq!(
            resolve_in_root(&linked_root, "/lib64/ld-linux-x86-64.so.2"),
            linked_root.join("lib/x86_64-linux-gnu/ld-2.31.so")
        );
    }

    #[test]
    fn test_links_restore_from_old_root() {
        let dir = tempfile::tempdir().unwrap();
        let root = fs::canonicalize(dir.path()).unwrap().join("ROOT");
        fs::create_dir_all(root.join("usr/lib")).unwrap();
        symlink("/old/place/ROOT/usr/lib/libc.so.6", root.join("usr/lib/libc.so")).unwrap();

        // SAFETY: getuid cannot fail.
        let uid = unsafe { libc::getuid() };
        let conv = LinkConverter::new(&root, uid);
        assert!(conv.links_conv(false, false, &[]).unwrap().is_empty());

        let conv = conv.with_orig_root(Some(PathBuf::from("/old/place/ROOT")));
        assert_eq!(conv.links_conv(false, false, &[]).unwrap().len(), 1);
        assert_eq!(
            fs::read_link(root.join("usr/lib/libc.so")).unwrap(),
            PathBuf::from("/usr/lib/libc.so.6")
        );
    }

    #[test]
    fn test_record_link_root() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(recorded_link_root(dir.path()), None);

        let root = dir.path().join("ROOT");
        fs::create_dir_all(&root).unwrap();
        record_link_root(dir.path(), Some(&root)).unwrap();
        assert_eq!(recorded_link_root(dir.path()), Some(fs::canonicalize(&root).unwrap()));

        record_link_root(dir.path(), None).unwrap();
        assert_eq!(recorded_link_root(dir.path()), None);
    }

    #[test]
    fn test_links_conv_refuses_shallow_root() {
        let conv = LinkConverter::new("/tmp", 0);
        assert!(conv.links_conv(true, false, &[]).is_err());
    }
}
