//! Error types for the execution core.

use std::path::PathBuf;

use crate::constants::{
    EXIT_CONFIG_ERROR, EXIT_EXEC_FAILED, EXIT_INIT_FAILED, EXIT_INVALID_OPTIONS,
    EXIT_SPEC_FAILED,
};

/// Result type alias for execution core operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while preparing or running a container.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    // =========================================================================
    // Configuration Errors
    // =========================================================================
    /// Unknown execution mode tag.
    #[error("invalid execution mode: {0}")]
    InvalidExecMode(String),

    /// Backend executable (proot, runc, singularity, patchelf) not found.
    #[error("{tool} executable not found: {hint}")]
    BackendNotFound { tool: String, hint: String },

    /// No usable fakechroot preload library.
    #[error("no libfakechroot found, tried: {0:?}")]
    FakechrootNotFound(Vec<String>),

    /// Configuration file could not be read or parsed.
    #[error("invalid configuration {path}: {reason}")]
    Config { path: PathBuf, reason: String },

    // =========================================================================
    // Container Errors
    // =========================================================================
    /// Container id or name does not resolve.
    #[error("container not found: {0}")]
    ContainerNotFound(String),

    /// Container has no stored attributes and no location override.
    #[error("container metadata not found: {0}")]
    MetadataNotFound(String),

    /// Container id failed validation.
    #[error("invalid container ID '{id}': {reason}")]
    InvalidContainerId { id: String, reason: String },

    // =========================================================================
    // Validation Errors
    // =========================================================================
    /// Volume string could not be parsed.
    #[error("invalid volume '{spec}': {reason}")]
    InvalidVolume { spec: String, reason: String },

    /// Volume binding rejected during validation.
    #[error("volume rejected {path}: {reason}")]
    VolumeRejected { path: String, reason: String },

    /// Malformed user string.
    #[error("invalid syntax for user: {0}")]
    InvalidUser(String),

    /// User lookup failed.
    #[error("user not found: {0}")]
    UserNotFound(String),

    /// Malformed environment variable.
    #[error("invalid environment variable: {0}")]
    InvalidEnv(String),

    /// Working directory does not exist in the container.
    #[error("invalid working directory: {0}")]
    InvalidWorkdir(String),

    /// Command not found or not executable inside the container.
    #[error("command not found/no execute bit set: {0}")]
    CommandNotFound(String),

    /// Command line option could not be used.
    #[error("invalid option: {0}")]
    InvalidOption(String),

    // =========================================================================
    // Privilege Policy Errors
    // =========================================================================
    /// Exposing a privileged port without real root.
    #[error("this container exposes privileged TCP/IP port {port}")]
    PrivilegedPort { port: u16 },

    // =========================================================================
    // Mode Transition Errors
    // =========================================================================
    /// A transition side effect failed; the mode was not persisted.
    #[error("execution mode transition failed at {action}: {reason}")]
    TransitionFailed { action: String, reason: String },

    /// The mode tag could not be written.
    #[error("failed to persist execution mode to {path}: {reason}")]
    ModePersistFailed { path: PathBuf, reason: String },

    /// File binding setup, start or restore failed.
    #[error("file binding failed: {0}")]
    FileBind(String),

    /// ELF loader or binary patching failed.
    #[error("ELF patching failed: {0}")]
    ElfPatch(String),

    /// Symbolic link conversion refused or failed.
    #[error("link conversion failed: {0}")]
    LinkConversion(String),

    // =========================================================================
    // OCI Spec Errors
    // =========================================================================
    /// OCI spec could not be generated or loaded.
    #[error("failed to load OCI spec {path}: {reason}")]
    SpecLoadFailed { path: PathBuf, reason: String },

    /// OCI spec could not be written.
    #[error("failed to save OCI spec {path}: {reason}")]
    SpecSaveFailed { path: PathBuf, reason: String },

    // =========================================================================
    // Execution Errors
    // =========================================================================
    /// Spawning the backend process failed.
    #[error("exec failed in container '{container}': {reason}")]
    ExecFailed { container: String, reason: String },

    // =========================================================================
    // I/O Errors
    // =========================================================================
    /// Generic I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(String),

    // =========================================================================
    // Internal Errors
    // =========================================================================
    /// Internal error (should not happen).
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Process exit code reserved for this error class.
    ///
    /// Codes stay in the 1-5 range so they can be told apart from the exit
    /// status of a container process, which is propagated unchanged.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::InvalidExecMode(_)
            | Self::BackendNotFound { .. }
            | Self::FakechrootNotFound(_)
            | Self::Config { .. } => EXIT_CONFIG_ERROR,

            Self::InvalidOption(_) => EXIT_INVALID_OPTIONS,

            Self::SpecLoadFailed { .. } | Self::SpecSaveFailed { .. } => EXIT_SPEC_FAILED,

            Self::ExecFailed { .. } | Self::InvalidEnv(_) => EXIT_EXEC_FAILED,

            _ => EXIT_INIT_FAILED,
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}
