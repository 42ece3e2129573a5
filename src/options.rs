//! Per-run options.
//!
//! [`RunOptions`] is rebuilt for every invocation and consumed top to bottom
//! by the common pipeline. Every flag defaults to off and every list to
//! empty, so `RunOptions::default()` is a minimal, unconfigured run.

use std::path::PathBuf;

use crate::env::Uenv;
use crate::error::{Error, Result};
use crate::volume::VolumeBinding;

/// A validated `--user` value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UserSpec {
    /// Named account.
    Name(String),
    /// Numeric uid with optional gid.
    Ids { uid: u32, gid: Option<u32> },
}

/// Validates a user string.
///
/// `""` means "not given" and yields `None`; `name`, `uid` and `uid:gid` are
/// accepted; anything else is an error.
pub fn validate_user_str(user: &str) -> Result<Option<UserSpec>> {
    if user.is_empty() {
        return Ok(None);
    }

    let mut chars = user.chars();
    let first_ok = chars
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_');
    if first_ok && chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-' || c == '.') {
        return Ok(Some(UserSpec::Name(user.to_string())));
    }

    let numeric = |s: &str| !s.is_empty() && s.chars().all(|c| c.is_ascii_digit());
    let (uid, gid) = match user.split_once(':') {
        Some((uid, gid)) if numeric(uid) && numeric(gid) => (uid, Some(gid)),
        None if numeric(user) => (user, None),
        _ => return Err(Error::InvalidUser(user.to_string())),
    };
    let parse = |s: &str| s.parse::<u32>().map_err(|_| Error::InvalidUser(user.to_string()));
    Ok(Some(UserSpec::Ids {
        uid: parse(uid)?,
        gid: gid.map(parse).transpose()?,
    }))
}

/// Options of one container run.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Volume bindings, explicit ones first.
    pub vol: Vec<VolumeBinding>,
    /// Paths (host or container side) that must not be bound.
    pub novol: Vec<String>,
    /// Container environment.
    pub env: Uenv,
    /// Pass the whole host environment to the backend.
    pub hostenv: bool,
    pub user: String,
    pub uid: Option<u32>,
    pub gid: Option<u32>,
    pub home: String,
    pub shell: String,
    pub gecos: String,
    pub cwd: String,
    pub hostname: String,
    pub domain: String,
    /// `None` uses the image entrypoint, `Some(vec![])` disables it.
    pub entryp: Option<Vec<String>>,
    pub cmd: Vec<String>,
    /// Published ports, `host:container[/proto]`.
    pub portsmap: Vec<String>,
    /// Exposed ports, `port[/proto]`.
    pub portsexp: Vec<String>,
    pub netcoop: bool,
    /// Identity comes from the host passwd/group.
    pub hostauth: bool,
    /// Use the container passwd/group as they are.
    pub containerauth: bool,
    pub bindhome: bool,
    pub nosysdirs: bool,
    pub nometa: bool,
    pub dri: bool,
    pub cpuset: String,
    /// Run a plain directory tree instead of a repository container.
    pub location: Option<PathBuf>,
    /// Kernel release emulated by PRoot.
    pub kernel: String,
    /// Volumes declared by the image metadata.
    pub declared_volumes: Vec<String>,
}

impl RunOptions {
    /// Parses and appends an explicit volume.
    pub fn add_volume(&mut self, spec: &str) -> Result<()> {
        self.vol.push(VolumeBinding::parse(spec)?);
        Ok(())
    }

    /// Sets the entrypoint from a command line string; an empty string
    /// disables the image entrypoint.
    pub fn set_entrypoint(&mut self, entrypoint: &str) {
        self.entryp = Some(entrypoint.split_whitespace().map(str::to_string).collect());
    }

    /// True if the container user is uid 0.
    pub fn is_root(&self) -> bool {
        self.uid == Some(0)
    }
}
