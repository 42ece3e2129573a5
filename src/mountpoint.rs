//! Mount point creation and bookkeeping.
//!
//! Backends that bind host paths need the target to exist inside the
//! container root. Targets created here are recorded under
//! `<container_dir>/mountpoints/` so later runs know which entries of the
//! root were made by us and may be removed again.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::constants::MOUNTPOINTS_DIR;
use crate::error::Result;
use crate::filebind::{decode_path, encode_path};
use crate::fileutil;

/// Mount point records of one container.
#[derive(Debug, Clone)]
pub struct MountPoint {
    container_root: PathBuf,
    mountpoints_dir: PathBuf,
    /// Container path to the host path of the created entry.
    created: BTreeMap<String, PathBuf>,
}

impl MountPoint {
    pub fn new(container_dir: &Path, container_root: &Path) -> Self {
        Self {
            container_root: container_root.to_path_buf(),
            mountpoints_dir: container_dir.join(MOUNTPOINTS_DIR),
            created: BTreeMap::new(),
        }
    }

    /// Makes `cont_path` exist inside the root, as a directory when
    /// `host_path` is one and as an empty file otherwise.
    pub fn create(&mut self, host_path: &Path, cont_path: &str) -> Result<()> {
        let target = fileutil::resolve_in_root(&self.container_root, cont_path);
        if fs::symlink_metadata(&target).is_ok() {
            return Ok(());
        }

        if host_path.is_dir() {
            fs::create_dir_all(&target)?;
        } else {
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::File::create(&target)?;
        }
        debug!("Created mount point {} for {}", cont_path, host_path.display());
        self.created.insert(cont_path.to_string(), target);
        Ok(())
    }

    /// Records a created mount point on disk.
    pub fn save(&self, cont_path: &str) -> Result<()> {
        if !self.created.contains_key(cont_path) {
            return Ok(());
        }
        fs::create_dir_all(&self.mountpoints_dir)?;
        fs::write(self.mountpoints_dir.join(encode_path(cont_path)), cont_path)?;
        Ok(())
    }

    /// Records every created mount point.
    pub fn save_all(&self) -> Result<()> {
        for cont_path in self.created.keys() {
            self.save(cont_path)?;
        }
        Ok(())
    }

    /// Container paths recorded on disk.
    pub fn load_all(&self) -> Vec<String> {
        let Ok(entries) = fs::read_dir(&self.mountpoints_dir) else {
            return Vec::new();
        };
        let mut paths: Vec<String> = entries
            .flatten()
            .map(|e| decode_path(&e.file_name().to_string_lossy()))
            .collect();
        paths.sort();
        paths
    }

    /// Removes a recorded mount point if it is still empty.
    pub fn delete(&mut self, cont_path: &str) -> Result<()> {
        let target = fileutil::resolve_in_root(&self.container_root, cont_path);
        if let Ok(meta) = fs::symlink_metadata(&target) {
            let removed = if meta.is_dir() {
                fs::remove_dir(&target)
            } else if meta.len() == 0 {
                fs::remove_file(&target)
            } else {
                Ok(())
            };
            if let Err(e) = removed {
                warn!("Mount point {} not removed: {}", cont_path, e);
            }
        }
        fileutil::remove_if_exists(&self.mountpoints_dir.join(encode_path(cont_path)))?;
        self.created.remove(cont_path);
        Ok(())
    }

    /// Removes every recorded mount point.
    pub fn delete_all(&mut self) -> Result<()> {
        // Deepest paths first so parents are empty when reached.
        let mut paths = self.load_all();
        paths.reverse();
        for cont_path in paths {
            self.delete(&cont_path)?;
        }
        Ok(())
    }
}
