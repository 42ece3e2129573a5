//! Local container repository.
//!
//! The execution core only needs a handful of repository operations:
//! resolving an id or name to its directory, listing name aliases and
//! reading the image metadata snapshot. They are expressed by the
//! [`Repository`] trait; [`LocalRepository`] implements them over
//!
//! ```text
//! <topdir>/containers/<id>/ROOT
//! <topdir>/containers/<id>/container.json
//! <topdir>/containers/<name> -> <id>
//! ```

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::constants::{
    CONTAINER_JSON_FILE, CONTAINER_ROOT_DIR, CONTAINERS_DIR, validate_container_id,
};
use crate::error::{Error, Result};

// =============================================================================
// Container Metadata
// =============================================================================

/// Docker image `config` section, as stored when the container was created.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ImageConfig {
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub working_dir: Option<String>,
    #[serde(default)]
    pub hostname: Option<String>,
    #[serde(default)]
    pub domainname: Option<String>,
    #[serde(default)]
    pub cmd: Option<Vec<String>>,
    #[serde(default)]
    pub entrypoint: Option<Vec<String>>,
    #[serde(default)]
    pub env: Option<Vec<String>>,
    #[serde(default)]
    pub volumes: Option<BTreeMap<String, serde_json::Value>>,
    #[serde(default)]
    pub exposed_ports: Option<BTreeMap<String, serde_json::Value>>,
}

/// Metadata snapshot of a container (`container.json`).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ContainerMeta {
    #[serde(default)]
    pub config: Option<ImageConfig>,
    #[serde(default)]
    pub container_config: Option<ImageConfig>,
}

impl ContainerMeta {
    /// Builds metadata from an image config section.
    pub fn from_config(config: ImageConfig) -> Self {
        Self {
            config: Some(config),
            container_config: None,
        }
    }

    /// Value of a field, from `config` first, then `container_config`.
    fn get_container_meta<T>(&self, field: impl Fn(&ImageConfig) -> Option<T>) -> Option<T> {
        self.config
            .as_ref()
            .and_then(&field)
            .or_else(|| self.container_config.as_ref().and_then(&field))
    }

    fn non_empty(value: &Option<String>) -> Option<String> {
        value.clone().filter(|v| !v.is_empty())
    }

    pub fn user(&self) -> Option<String> {
        self.get_container_meta(|c| Self::non_empty(&c.user))
    }

    pub fn working_dir(&self) -> Option<String> {
        self.get_container_meta(|c| Self::non_empty(&c.working_dir))
    }

    pub fn hostname(&self) -> Option<String> {
        self.get_container_meta(|c| Self::non_empty(&c.hostname))
    }

    pub fn domainname(&self) -> Option<String> {
        self.get_container_meta(|c| Self::non_empty(&c.domainname))
    }

    pub fn cmd(&self) -> Option<Vec<String>> {
        self.get_container_meta(|c| c.cmd.clone())
    }

    pub fn entrypoint(&self) -> Option<Vec<String>> {
        self.get_container_meta(|c| c.entrypoint.clone())
    }

    pub fn env(&self) -> Vec<String> {
        self.get_container_meta(|c| c.env.clone()).unwrap_or_default()
    }

    pub fn volumes(&self) -> Vec<String> {
        self.get_container_meta(|c| c.volumes.as_ref().map(|v| v.keys().cloned().collect()))
            .unwrap_or_default()
    }

    pub fn exposed_ports(&self) -> Vec<String> {
        self.get_container_meta(|c| {
            c.exposed_ports
                .as_ref()
                .map(|p| p.keys().cloned().collect())
        })
        .unwrap_or_default()
    }
}

// =============================================================================
// Repository
// =============================================================================

/// Repository operations used by the execution core.
pub trait Repository: Send + Sync {
    /// Bundled backend executables.
    fn bindir(&self) -> PathBuf;

    /// Bundled libraries.
    fn libdir(&self) -> PathBuf;

    /// Container id for an id or a name alias.
    fn get_container_id(&self, id_or_name: &str) -> Option<String>;

    /// Container directory for an id or a name alias.
    fn cd_container(&self, id_or_name: &str) -> Option<PathBuf>;

    /// Name aliases of a container.
    fn get_container_name(&self, id: &str) -> Vec<String>;

    /// Container directory and metadata, `None` when either is missing.
    fn get_container_attr(&self, id_or_name: &str) -> Option<(PathBuf, ContainerMeta)>;
}

/// Directory based repository.
#[derive(Debug, Clone)]
pub struct LocalRepository {
    topdir: PathBuf,
    bindir: PathBuf,
    libdir: PathBuf,
}

impl LocalRepository {
    /// Opens the repository described by `config`.
    pub fn new(config: &Config) -> Self {
        Self {
            topdir: config.topdir.clone(),
            bindir: config.bindir(),
            libdir: config.libdir(),
        }
    }

    /// Creates the repository directories.
    pub fn setup(&self) -> Result<()> {
        for dir in [self.containers_dir(), self.bindir.clone(), self.libdir.clone()] {
            fs::create_dir_all(&dir).map_err(|e| Error::Config {
                path: dir.clone(),
                reason: e.to_string(),
            })?;
        }
        info!("Repository ready at {}", self.topdir.display());
        Ok(())
    }

    pub fn topdir(&self) -> &Path {
        &self.topdir
    }

    pub fn containers_dir(&self) -> PathBuf {
        self.topdir.join(CONTAINERS_DIR)
    }

    /// Creates an empty container with its `ROOT` directory.
    pub fn create_container(&self, id: &str) -> Result<PathBuf> {
        validate_container_id(id).map_err(|reason| Error::InvalidContainerId {
            id: id.to_string(),
            reason: reason.to_string(),
        })?;
        let dir = self.containers_dir().join(id);
        fs::create_dir_all(dir.join(CONTAINER_ROOT_DIR))?;
        debug!("Created container directory {}", dir.display());
        Ok(dir)
    }

    /// Stores the metadata snapshot of a container.
    pub fn save_container_meta(&self, id: &str, meta: &ContainerMeta) -> Result<()> {
        let dir = self
            .cd_container(id)
            .ok_or_else(|| Error::ContainerNotFound(id.to_string()))?;
        let data = serde_json::to_string_pretty(meta)?;
        fs::write(dir.join(CONTAINER_JSON_FILE), data)?;
        Ok(())
    }

    /// Adds a name alias for a container.
    pub fn set_container_name(&self, id: &str, name: &str) -> Result<()> {
        validate_container_id(name).map_err(|reason| Error::InvalidContainerId {
            id: name.to_string(),
            reason: reason.to_string(),
        })?;
        let link = self.containers_dir().join(name);
        if fs::symlink_metadata(&link).is_ok() {
            return Err(Error::InvalidContainerId {
                id: name.to_string(),
                reason: "name already in use".to_string(),
            });
        }
        std::os::unix::fs::symlink(id, &link)?;
        Ok(())
    }
}

impl Repository for LocalRepository {
    fn bindir(&self) -> PathBuf {
        self.bindir.clone()
    }

    fn libdir(&self) -> PathBuf {
        self.libdir.clone()
    }

    fn get_container_id(&self, id_or_name: &str) -> Option<String> {
        validate_container_id(id_or_name).ok()?;
        let path = self.containers_dir().join(id_or_name);
        let meta = fs::symlink_metadata(&path).ok()?;
        if meta.file_type().is_symlink() {
            let target = fs::read_link(&path).ok()?;
            let id = target.file_name()?.to_string_lossy().into_owned();
            return self.containers_dir().join(&id).is_dir().then_some(id);
        }
        meta.is_dir().then(|| id_or_name.to_string())
    }

    fn cd_container(&self, id_or_name: &str) -> Option<PathBuf> {
        self.get_container_id(id_or_name)
            .map(|id| self.containers_dir().join(id))
    }

    fn get_container_name(&self, id: &str) -> Vec<String> {
        let Ok(entries) = fs::read_dir(self.containers_dir()) else {
            return Vec::new();
        };
        let mut names: Vec<String> = entries
            .flatten()
            .filter(|e| e.file_type().map(|t| t.is_symlink()).unwrap_or(false))
            .filter(|e| {
                fs::read_link(e.path())
                    .ok()
                    .and_then(|t| t.file_name().map(|n| n == id))
                    .unwrap_or(false)
            })
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        names
    }

    fn get_container_attr(&self, id_or_name: &str) -> Option<(PathBuf, ContainerMeta)> {
        let dir = self.cd_container(id_or_name)?;
        let data = fs::read_to_string(dir.join(CONTAINER_JSON_FILE)).ok()?;
        match serde_json::from_str(&data) {
            Ok(meta) => Some((dir, meta)),
            Err(e) => {
                warn!("Unreadable metadata for container {}: {}", id_or_name, e);
                None
            }
        }
    }
}
