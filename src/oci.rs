//! OCI runtime spec (`config.json`) model for the runc modes.
//!
//! Only the fields the engine edits are typed; everything else a runtime
//! generated (`linux.seccomp`, `process.rlimits`, annotations...) is kept in
//! flattened `extra` maps so a load/save cycle never drops it.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::debug;

use crate::error::{Error, Result};

/// OCI runtime spec version written into generated specs.
pub const OCI_RUNTIME_SPEC_VERSION: &str = "1.0.2";

// =============================================================================
// OCI Runtime Spec Types
// =============================================================================

/// OCI Runtime Spec.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OciSpec {
    pub oci_version: String,
    pub process: OciProcess,
    pub root: OciRoot,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub hostname: String,
    #[serde(default)]
    pub mounts: Vec<OciMount>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub linux: Option<OciLinux>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// OCI process config.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OciProcess {
    #[serde(default)]
    pub terminal: bool,
    pub user: OciUser,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: Vec<String>,
    #[serde(default = "default_cwd")]
    pub cwd: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub capabilities: Option<OciCapabilities>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

fn default_cwd() -> String {
    "/".to_string()
}

/// OCI user config.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OciUser {
    pub uid: u32,
    pub gid: u32,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub additional_gids: Vec<u32>,
}

/// Capability sets of the container process.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OciCapabilities {
    #[serde(default)]
    pub bounding: Vec<String>,
    #[serde(default)]
    pub effective: Vec<String>,
    #[serde(default)]
    pub inheritable: Vec<String>,
    #[serde(default)]
    pub permitted: Vec<String>,
    #[serde(default)]
    pub ambient: Vec<String>,
}

/// OCI root filesystem config.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OciRoot {
    pub path: String,
    #[serde(default)]
    pub readonly: bool,
}

/// OCI mount config.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OciMount {
    pub destination: String,
    #[serde(rename = "type", default)]
    pub mount_type: String,
    #[serde(default)]
    pub source: String,
    #[serde(default)]
    pub options: Vec<String>,
}

/// OCI Linux-specific config.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OciLinux {
    #[serde(default)]
    pub uid_mappings: Vec<OciIdMapping>,
    #[serde(default)]
    pub gid_mappings: Vec<OciIdMapping>,
    #[serde(default)]
    pub namespaces: Vec<OciNamespace>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub masked_paths: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub readonly_paths: Vec<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// User namespace id mapping.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OciIdMapping {
    #[serde(rename = "containerID")]
    pub container_id: u32,
    #[serde(rename = "hostID")]
    pub host_id: u32,
    pub size: u32,
}

/// OCI namespace config.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OciNamespace {
    #[serde(rename = "type")]
    pub ns_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
}

fn strings(list: &[&str]) -> Vec<String> {
    list.iter().map(|s| s.to_string()).collect()
}

impl OciMount {
    fn new(destination: &str, mount_type: &str, source: &str, options: &[&str]) -> Self {
        Self {
            destination: destination.to_string(),
            mount_type: mount_type.to_string(),
            source: source.to_string(),
            options: strings(options),
        }
    }

    /// Bind mount of a host path.
    pub fn bind(host_path: &str, cont_path: &str, rw: bool) -> Self {
        let mode = if rw { "rw" } else { "ro" };
        Self::new(
            cont_path,
            "none",
            host_path,
            &["rbind", "nosuid", "noexec", "nodev", mode],
        )
    }
}

impl OciSpec {
    /// Rootless spec equivalent to `runc spec --rootless` for the given
    /// host identity: the invoking user becomes root inside a user
    /// namespace.
    pub fn rootless_default(uid: u32, gid: u32, nomqueue: bool) -> Self {
        let mut mounts = vec![
            OciMount::new("/proc", "proc", "proc", &[]),
            OciMount::new(
                "/dev",
                "tmpfs",
                "tmpfs",
                &["nosuid", "strictatime", "mode=755", "size=65536k"],
            ),
            OciMount::new(
                "/dev/pts",
                "devpts",
                "devpts",
                &["nosuid", "noexec", "newinstance", "ptmxmode=0666", "mode=0620"],
            ),
            OciMount::new(
                "/dev/shm",
                "tmpfs",
                "shm",
                &["nosuid", "noexec", "nodev", "mode=1777", "size=65536k"],
            ),
            OciMount::new("/dev/mqueue", "mqueue", "mqueue", &["nosuid", "noexec", "nodev"]),
            OciMount::new("/sys", "none", "/sys", &["rbind", "nosuid", "noexec", "nodev", "ro"]),
        ];
        if nomqueue {
            mounts.retain(|m| m.destination != "/dev/mqueue");
        }

        let namespaces = ["pid", "ipc", "uts", "mount", "user"]
            .iter()
            .map(|ns| OciNamespace {
                ns_type: ns.to_string(),
                path: None,
            })
            .collect();

        Self {
            oci_version: OCI_RUNTIME_SPEC_VERSION.to_string(),
            process: OciProcess {
                terminal: true,
                user: OciUser::default(),
                args: strings(&["sh"]),
                env: strings(&[
                    "PATH=/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin",
                    "TERM=xterm",
                ]),
                cwd: default_cwd(),
                capabilities: None,
                extra: Map::new(),
            },
            root: OciRoot {
                path: "rootfs".to_string(),
                readonly: true,
            },
            hostname: "runc".to_string(),
            mounts,
            linux: Some(OciLinux {
                uid_mappings: vec![OciIdMapping {
                    container_id: 0,
                    host_id: uid,
                    size: 1,
                }],
                gid_mappings: vec![OciIdMapping {
                    container_id: 0,
                    host_id: gid,
                    size: 1,
                }],
                namespaces,
                masked_paths: strings(&[
                    "/proc/kcore",
                    "/proc/latency_stats",
                    "/proc/timer_list",
                    "/proc/sched_debug",
                    "/sys/firmware",
                ]),
                readonly_paths: strings(&[
                    "/proc/asound",
                    "/proc/bus",
                    "/proc/fs",
                    "/proc/irq",
                    "/proc/sys",
                    "/proc/sysrq-trigger",
                ]),
                extra: Map::new(),
            }),
            extra: Map::new(),
        }
    }

    /// Reads a spec file.
    pub fn load(path: &Path) -> Result<Self> {
        let data = fs::read_to_string(path).map_err(|e| Error::SpecLoadFailed {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        serde_json::from_str(&data).map_err(|e| Error::SpecLoadFailed {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })
    }

    /// Writes the spec file.
    pub fn save(&self, path: &Path) -> Result<()> {
        let data = serde_json::to_string_pretty(self).map_err(|e| Error::SpecSaveFailed {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        fs::write(path, data).map_err(|e| Error::SpecSaveFailed {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        debug!("Saved OCI spec {}", path.display());
        Ok(())
    }

    /// Appends a bind mount unless the same one is already present.
    pub fn add_mount(&mut self, host_path: &str, cont_path: &str, rw: bool) -> bool {
        let mount = OciMount::bind(host_path, cont_path, rw);
        if self.mounts.contains(&mount) {
            return false;
        }
        self.mounts.push(mount);
        true
    }

    /// Removes mounts matching both `host_path` and `cont_path`.
    pub fn del_mount(&mut self, host_path: &str, cont_path: &str) -> bool {
        let before = self.mounts.len();
        self.mounts
            .retain(|m| !(m.source == host_path && m.destination == cont_path));
        self.mounts.len() != before
    }

    /// True if a mount targets `cont_path`.
    pub fn has_mount(&self, cont_path: &str) -> bool {
        self.mounts.iter().any(|m| m.destination == cont_path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rootless_default_maps_invoking_user() {
        let spec = OciSpec::rootless_default(1000, 100, false);
        let linux = spec.linux.as_ref().unwrap();
        assert_eq!(linux.uid_mappings[0].host_id, 1000);
        assert_eq!(linux.gid_mappings[0].host_id, 100);
        assert!(linux.namespaces.iter().any(|n| n.ns_type == "user"));
        assert!(spec.has_mount("/dev/mqueue"));

        let spec = OciSpec::rootless_default(1000, 100, true);
        assert!(!spec.has_mount("/dev/mqueue"));
    }

    #[test]
    fn test_add_and_del_mount() {
        let mut spec = OciSpec::rootless_default(1000, 1000, false);
        let count = spec.mounts.len();

        assert!(spec.add_mount("/home/u/data", "/data", true));
        assert!(!spec.add_mount("/home/u/data", "/data", true));
        assert_eq!(spec.mounts.len(), count + 1);
        let added = spec.mounts.last().unwrap();
        assert_eq!(added.mount_type, "none");
        assert_eq!(added.options.last().map(String::as_str), Some("rw"));

        assert!(!spec.del_mount("/other", "/data"));
        assert!(spec.del_mount("/home/u/data", "/data"));
        assert_eq!(spec.mounts.len(), count);
    }

    #[test]
    fn test_unknown_keys_survive_round_trip() {
        let json = r#"{
            "ociVersion": "1.0.2",
            "process": {"user": {"uid": 0, "gid": 0}, "args": ["sh"], "cwd": "/",
                        "rlimits": [{"type": "RLIMIT_NOFILE", "hard": 1024, "soft": 1024}]},
            "root": {"path": "rootfs"},
            "linux": {"namespaces": [{"type": "user"}], "seccomp": {"defaultAction": "SCMP_ACT_ALLOW"}},
            "annotations": {"org.example": "1"}
        }"#;
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        fs::write(&path, json).unwrap();

        let spec = OciSpec::load(&path).unwrap();
        spec.save(&path).unwrap();
        let value: Value = serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(value["annotations"]["org.example"], "1");
        assert_eq!(value["process"]["rlimits"][0]["hard"], 1024);
        assert_eq!(value["linux"]["seccomp"]["defaultAction"], "SCMP_ACT_ALLOW");
    }

    #[test]
    fn test_load_missing_is_spec_error() {
        let err = OciSpec::load(Path::new("/nonexistent/config.json")).unwrap_err();
        assert_eq!(err.exit_code(), 4);
    }
}
