//! Per-file bind emulation.
//!
//! Backends without a usable mount namespace for single files (runc in
//! rootless mode) cannot bind `/etc/passwd` over the container's copy.
//! Instead the container file is moved aside and replaced by a symlink into
//! `/.bind_host_files`, a directory that *is* bind mounted from a per-run
//! host directory holding the substitute content.
//!
//! ```text
//! ROOT/etc/passwd  ->  /.bind_host_files/#etc#passwd
//! <container_dir>/.bind_orig_files/#etc#passwd      (the original)
//! <tmpdir>/udock-bind-XXXX/#etc#passwd              (mounted at /.bind_host_files)
//! ```
//!
//! File names in the flat directories come from [`encode_path`], which is a
//! bijection: `decode_path(encode_path(p)) == p` for every path.

use std::fs;
use std::os::unix::fs::symlink;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tempfile::TempDir;
use tracing::{debug, info, warn};

use crate::constants::{BIND_HOST_DIR, BIND_ORIG_DIR, CONTAINER_ROOT_DIR};
use crate::error::{Error, Result};
use crate::fileutil;
use crate::volume::cleanpath;

const MANIFEST_FILE: &str = ".manifest.json";

/// Flattens a path into a single file name (`/a/b` becomes `#a#b`).
///
/// `%` and `#` are escaped first so the mapping stays reversible.
pub fn encode_path(path: &str) -> String {
    path.replace('%', "%25").replace('#', "%23").replace('/', "#")
}

/// Inverse of [`encode_path`].
pub fn decode_path(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut rest = name;
    while let Some(c) = rest.chars().next() {
        if let Some(tail) = rest.strip_prefix("%23") {
            out.push('#');
            rest = tail;
        } else if let Some(tail) = rest.strip_prefix("%25") {
            out.push('%');
            rest = tail;
        } else {
            out.push(if c == '#' { '/' } else { c });
            rest = &rest[c.len_utf8()..];
        }
    }
    out
}

/// State of one substituted container file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileBindMapping {
    /// Container path of the substituted file.
    pub container_path: String,
    /// The container had an entry at this path before substitution.
    pub existed: bool,
    /// That entry was a symlink.
    pub was_symlink: bool,
}

/// File binding state of one container.
#[derive(Debug)]
pub struct FileBind {
    container_root: PathBuf,
    container_bind_dir: PathBuf,
    container_orig_dir: PathBuf,
    tmpdir: PathBuf,
    host_bind_dir: Option<TempDir>,
}

impl FileBind {
    /// File binding for the container in `container_dir`; per-run host
    /// directories are created under `tmpdir`.
    pub fn new(container_dir: &Path, tmpdir: &Path) -> Self {
        let container_root = container_dir.join(CONTAINER_ROOT_DIR);
        Self {
            container_bind_dir: container_root.join(BIND_HOST_DIR.trim_start_matches('/')),
            container_orig_dir: container_dir.join(BIND_ORIG_DIR.trim_start_matches('/')),
            container_root,
            tmpdir: tmpdir.to_path_buf(),
            host_bind_dir: None,
        }
    }

    /// Container-side directory the host bind dir is mounted on.
    pub fn bind_dir() -> &'static str {
        BIND_HOST_DIR
    }

    /// Where originals are kept.
    pub fn orig_dir(&self) -> &Path {
        &self.container_orig_dir
    }

    /// Preserved original of a substituted container file.
    pub fn orig_file(&self, cont_file: &str) -> PathBuf {
        self.container_orig_dir.join(encode_path(&cleanpath(cont_file)))
    }

    /// Per-run host directory, once [`start`](Self::start) ran.
    pub fn host_bind_dir(&self) -> Option<&Path> {
        self.host_bind_dir.as_ref().map(TempDir::path)
    }

    /// Creates the bind and orig directories. Idempotent.
    pub fn setup(&self) -> Result<()> {
        for dir in [&self.container_orig_dir, &self.container_bind_dir] {
            if !dir.is_dir() {
                fs::create_dir_all(dir).map_err(|e| {
                    Error::FileBind(format!("creating dir {}: {}", dir.display(), e))
                })?;
            }
        }
        Ok(())
    }

    fn load_manifest(&self) -> Vec<FileBindMapping> {
        fs::read_to_string(self.container_orig_dir.join(MANIFEST_FILE))
            .ok()
            .and_then(|data| serde_json::from_str(&data).ok())
            .unwrap_or_default()
    }

    fn save_manifest(&self, manifest: &[FileBindMapping]) -> Result<()> {
        let data = serde_json::to_string_pretty(manifest)?;
        fs::write(self.container_orig_dir.join(MANIFEST_FILE), data)?;
        Ok(())
    }

    fn container_entry(&self, cont_path: &str) -> PathBuf {
        self.container_root.join(cont_path.trim_start_matches('/'))
    }

    /// Moves the container entry aside and links it into the bind dir.
    fn substitute(&self, cont_path: &str) -> Result<FileBindMapping> {
        let encoded = encode_path(cont_path);
        let entry = self.container_entry(cont_path);
        let meta = fs::symlink_metadata(&entry).ok();
        let mapping = FileBindMapping {
            container_path: cont_path.to_string(),
            existed: meta.is_some(),
            was_symlink: meta.as_ref().is_some_and(|m| m.file_type().is_symlink()),
        };
        if meta.as_ref().is_some_and(|m| m.is_dir()) {
            return Err(Error::FileBind(format!("{} is a directory", cont_path)));
        }

        if mapping.existed {
            fs::rename(&entry, self.container_orig_dir.join(&encoded))?;
        } else if let Some(parent) = entry.parent() {
            fs::create_dir_all(parent)?;
        }
        symlink(format!("{}/{}", BIND_HOST_DIR, encoded), &entry)?;
        debug!("Substituted {} (symlink: {})", cont_path, mapping.was_symlink);
        Ok(mapping)
    }

    /// Content the original entry had, followed through symlinks.
    fn original_content(&self, mapping: &FileBindMapping) -> Option<PathBuf> {
        let orig = self.orig_file(&mapping.container_path);
        if !mapping.was_symlink {
            return orig.is_file().then_some(orig);
        }
        let target = fs::read_link(&orig).ok()?;
        let target = target.to_string_lossy();
        let cont_target = if target.starts_with('/') {
            target.into_owned()
        } else {
            let parent = Path::new(&mapping.container_path)
                .parent()
                .map(|p| p.to_string_lossy().into_owned())
                .unwrap_or_default();
            format!("{}/{}", parent, target)
        };
        let host = fileutil::resolve_in_root(&self.container_root, &cont_target);
        host.is_file().then_some(host)
    }

    /// Substitutes `files` (container paths) and creates the per-run host
    /// bind dir seeded with the original contents.
    pub fn start(&mut self, files: &[String]) -> Result<Vec<FileBindMapping>> {
        self.setup()?;
        let host_dir = tempfile::Builder::new()
            .prefix("udock-bind-")
            .tempdir_in(&self.tmpdir)
            .map_err(|e| Error::FileBind(format!("creating host bind dir: {}", e)))?;

        let mut manifest = self.load_manifest();
        let mut mappings = Vec::new();
        for file in files {
            let cont_path = cleanpath(file);
            let mapping = match manifest.iter().find(|m| m.container_path == cont_path) {
                Some(existing) => existing.clone(),
                None => {
                    let mapping = self.substitute(&cont_path)?;
                    manifest.push(mapping.clone());
                    self.save_manifest(&manifest)?;
                    mapping
                }
            };

            if let Some(content) = self.original_content(&mapping) {
                fs::copy(&content, host_dir.path().join(encode_path(&cont_path)))?;
            }
            mappings.push(mapping);
        }

        debug!("File binding started in {}", host_dir.path().display());
        self.host_bind_dir = Some(host_dir);
        Ok(mappings)
    }

    /// Makes `cont_file` show the content of `host_file` for this run.
    pub fn add_file(&self, host_file: &Path, cont_file: &str) -> Result<()> {
        let substitute = self
            .get_path(cont_file)
            .ok_or_else(|| Error::FileBind("file binding not started".to_string()))?;
        fileutil::copy_replace(host_file, &substitute)
    }

    /// Host-side substitute of `cont_file` in the per-run bind dir.
    pub fn get_path(&self, cont_file: &str) -> Option<PathBuf> {
        self.host_bind_dir()
            .map(|dir| dir.join(encode_path(&cleanpath(cont_file))))
    }

    /// Drops the per-run host bind dir.
    pub fn finish(&mut self) {
        self.host_bind_dir = None;
    }

    /// Puts every original back and removes the bind and orig dirs.
    /// Does nothing if no file was ever bound.
    pub fn restore(&mut self) -> Result<()> {
        if !self.container_orig_dir.is_dir() && !self.container_bind_dir.exists() {
            return Ok(());
        }

        let mut manifest = self.load_manifest();
        // Originals without a manifest entry were bound from regular files.
        if let Ok(entries) = fs::read_dir(&self.container_orig_dir) {
            for entry in entries.flatten() {
                let name = entry.file_name().to_string_lossy().into_owned();
                let cont_path = decode_path(&name);
                if name != MANIFEST_FILE && !manifest.iter().any(|m| m.container_path == cont_path)
                {
                    manifest.push(FileBindMapping {
                        container_path: cont_path,
                        existed: true,
                        was_symlink: false,
                    });
                }
            }
        }

        let mut failed = Vec::new();
        for mapping in &manifest {
            let entry = self.container_entry(&mapping.container_path);
            match fs::symlink_metadata(&entry) {
                Ok(meta) if meta.file_type().is_symlink() => fs::remove_file(&entry)?,
                Ok(_) => {
                    warn!(
                        "Not restoring {}: replaced inside the container",
                        mapping.container_path
                    );
                    continue;
                }
                Err(_) => {}
            }
            if mapping.existed {
                if let Err(e) = fs::rename(self.orig_file(&mapping.container_path), &entry) {
                    warn!("Error restoring bound file {}: {}", mapping.container_path, e);
                    failed.push(mapping.container_path.clone());
                }
            }
        }

        if self.container_bind_dir.exists() {
            fs::remove_dir_all(&self.container_bind_dir)?;
        }
        if !failed.is_empty() {
            return Err(Error::FileBind(format!("could not restore {:?}", failed)));
        }
        if self.container_orig_dir.exists() {
            fs::remove_dir_all(&self.container_orig_dir)?;
        }
        self.host_bind_dir = None;
        info!("File binding restored for {}", self.container_root.display());
        Ok(())
    }
}
