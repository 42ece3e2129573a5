//! # Execution Core Constants
//!
//! Fixed names, tags and default lists used by the execution engines. Values
//! that a user may reasonably want to change are only *defaults* here; the
//! effective values live in [`crate::config::Config`].
//!
//! ## Cross-References
//!
//! - [`crate::execmode`]: Uses the mode tags and the sidecar file name
//! - [`crate::filebind`]: Uses the bind directory names
//! - [`crate::engines`]: Uses the exit codes and default host lists

// =============================================================================
// Execution Modes
// =============================================================================

/// All valid execution mode tags, in display order.
pub const VALID_EXEC_MODES: [&str; 10] =
    ["P1", "P2", "F1", "F2", "F3", "F4", "R1", "R2", "R3", "S1"];

/// Mode used when a container has no readable mode tag.
pub const DEFAULT_EXEC_MODE: &str = "P1";

// =============================================================================
// Container Layout
// =============================================================================
//
// <topdir>/containers/<id>/
//     ROOT/                 container root filesystem
//     ROOT/.bind_host_files mount target for file binding (R* modes)
//     .bind_orig_files/     originals displaced by file binding
//     container.json        image metadata snapshot
//     execmode              one-line mode tag
//     config.json           OCI spec (R* modes)
//     mountpoints/          records of created mount points
// =============================================================================

/// Directory holding all containers under the top directory.
pub const CONTAINERS_DIR: &str = "containers";

/// Root filesystem directory inside a container directory.
pub const CONTAINER_ROOT_DIR: &str = "ROOT";

/// Image metadata snapshot inside a container directory.
pub const CONTAINER_JSON_FILE: &str = "container.json";

/// Execution mode sidecar file.
pub const EXECMODE_FILE: &str = "execmode";

/// OCI runtime spec file (runc modes).
pub const OCI_SPEC_FILE: &str = "config.json";

/// State directory handed to runc with `--root`.
pub const RUNC_STATE_DIR: &str = "runc";

/// Mount point records directory.
pub const MOUNTPOINTS_DIR: &str = "mountpoints";

/// File binding target directory, relative to the container root.
pub const BIND_HOST_DIR: &str = "/.bind_host_files";

/// Originals displaced by file binding, relative to the container directory.
pub const BIND_ORIG_DIR: &str = "/.bind_orig_files";

/// Copy of the unpatched dynamic loader (F2/F3 modes).
pub const LD_SO_ORIG_FILE: &str = "ld.so.orig";

/// Container root recorded when binaries were patched (F3 mode).
pub const LD_SO_PATH_FILE: &str = "ld.so.path";

/// Container root the absolute symlinks were converted against (F modes).
pub const LINKS_ROOT_FILE: &str = "links.root";

/// Timestamp of the last binary patching run.
pub const PATCH_TIME_FILE: &str = "patch.time";

/// Container-side location of the PRoot overlay used by R2/R3.
pub const PROOT_OVERLAY_PATH: &str = "/.udock-proot";

// =============================================================================
// Default Host Lists
// =============================================================================

/// Host paths bound into every container unless `nosysdirs`.
pub const DEFAULT_SYSDIRS: &[&str] = &[
    "/dev",
    "/proc",
    "/sys",
    "/etc/resolv.conf",
    "/etc/host.conf",
    "/lib/modules",
];

/// Direct rendering device directories bound with `dri`.
pub const DEFAULT_DRI_DIRS: &[&str] = &["/usr/lib64/dri", "/lib64/dri", "/usr/lib/dri", "/lib/dri"];

/// Authentication files bound with `hostauth`.
pub const DEFAULT_HOSTAUTH_FILES: &[&str] = &["/etc/passwd", "/etc/group"];

/// Files reported to fakechroot as accessible (MPI init workarounds).
pub const DEFAULT_ACCESS_FILES: &[&str] = &[
    "/sys/class/infiniband",
    "/sys/class/infiniband_verbs",
    "/sys/class/infiniband_mad",
];

/// Host environment variables passed through without `hostenv`.
pub const DEFAULT_VALID_HOST_ENV: &[&str] = &["TERM", "PATH", "PROOT_TMP_DIR"];

/// Host environment variables never passed through.
pub const DEFAULT_INVALID_HOST_ENV: &[&str] = &["VTE_VERSION"];

/// Container paths that implicit bindings may not shadow.
///
/// **Rationale**: default bindings come from host-wide lists; shadowing one
/// of these would replace the container's userland with the host's.
pub const PROTECTED_CONTAINER_DIRS: &[&str] =
    &["/", "/bin", "/sbin", "/lib", "/lib64", "/usr", "/etc", "/var"];

/// Capabilities granted to the runc process.
pub const DEFAULT_RUNC_CAPABILITIES: &[&str] = &[
    "CAP_KILL",
    "CAP_NET_BIND_SERVICE",
    "CAP_CHOWN",
    "CAP_DAC_OVERRIDE",
    "CAP_FOWNER",
    "CAP_FSETID",
    "CAP_SETUID",
    "CAP_SETGID",
    "CAP_SYS_CHROOT",
    "CAP_AUDIT_WRITE",
    "CAP_SETFCAP",
    "CAP_SETPCAP",
    "CAP_MKNOD",
    "CAP_NET_RAW",
];

/// PATH for uid 0 inside the container.
pub const DEFAULT_ROOT_PATH: &str = "/usr/sbin:/sbin:/usr/bin:/bin";

/// PATH for other users inside the container.
pub const DEFAULT_USER_PATH: &str = "/usr/local/bin:/usr/bin:/bin";

/// Command run when neither the image nor the user supplies one.
pub const DEFAULT_CMD: &[&str] = &["/bin/bash", "-i"];

/// Lowest unprivileged TCP/IP port.
pub const FIRST_UNPRIVILEGED_PORT: u16 = 1024;

/// Kernel version from which PRoot needs the newer seccomp handling.
pub const PROOT_SECCOMP_KERNEL: [u32; 3] = [4, 8, 0];

/// Maximum symlink hops when resolving a path inside a container root.
pub const MAX_SYMLINK_HOPS: usize = 40;

// =============================================================================
// Exit Codes
// =============================================================================

/// Configuration error (unknown mode, backend missing).
pub const EXIT_CONFIG_ERROR: i32 = 1;

/// Pre-run validation failed; nothing was spawned.
pub const EXIT_INIT_FAILED: i32 = 2;

/// Command line could not be used.
pub const EXIT_INVALID_OPTIONS: i32 = 3;

/// OCI spec could not be loaded or saved.
pub const EXIT_SPEC_FAILED: i32 = 4;

/// Backend process could not be executed.
pub const EXIT_EXEC_FAILED: i32 = 5;

// =============================================================================
// Container ID Validation
// =============================================================================

/// Maximum length of a container id or name.
pub const MAX_CONTAINER_ID_LEN: usize = 128;

/// Characters allowed in container ids and names.
pub const CONTAINER_NAME_VALID_CHARS: &str =
    "abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789-_.";

/// Validates a container id or name before it is used as a path component.
///
/// **Security**: ids are joined onto the repository directory, so `/` and
/// `..` must never get through.
#[must_use = "validation result must be checked"]
pub fn validate_container_id(id: &str) -> std::result::Result<(), &'static str> {
    if id.is_empty() {
        return Err("container ID cannot be empty");
    }
    if id.len() > MAX_CONTAINER_ID_LEN {
        return Err("container ID exceeds maximum length");
    }
    if id == "." || id == ".." {
        return Err("container ID cannot be a relative path component");
    }
    if !id.chars().all(|c| CONTAINER_NAME_VALID_CHARS.contains(c)) {
        return Err("container ID contains invalid characters");
    }
    Ok(())
}
