//! Volume binding strings and path normalisation.
//!
//! A binding is written `host[:container][:ro|rw]`; a missing container side
//! means "same path as on the host". Bindings remember where they came from
//! so the pipeline can treat user requests and implicit defaults differently.

use std::fmt;
use std::str::FromStr;

use crate::error::{Error, Result};

/// Access mode of a binding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AccessMode {
    #[default]
    ReadOnly,
    ReadWrite,
}

/// Where a binding was requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BindingOrigin {
    /// Given by the user with `-v`.
    #[default]
    Explicit,
    /// From the system directories list.
    SysDir,
    /// From the DRI device list.
    Dri,
    /// The invoking user's home (`bindhome`).
    Home,
    /// Host or generated passwd/group files (`hostauth`).
    HostAuth,
}

/// A `(host_path, container_path)` pair with its access mode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeBinding {
    pub host_path: String,
    pub container_path: String,
    pub mode: AccessMode,
    pub origin: BindingOrigin,
}

impl VolumeBinding {
    /// Parses a binding string as an explicit user request.
    pub fn parse(spec: &str) -> Result<Self> {
        let invalid = |reason: &str| Error::InvalidVolume {
            spec: spec.to_string(),
            reason: reason.to_string(),
        };

        let parts: Vec<&str> = spec.split(':').collect();
        let (host, cont, mode) = match parts.as_slice() {
            [host] => (*host, *host, None),
            [host, m @ ("ro" | "rw")] => (*host, *host, Some(*m)),
            [host, cont] => (*host, *cont, None),
            [host, cont, mode] => (*host, *cont, Some(*mode)),
            _ => return Err(invalid("too many ':' separators")),
        };

        if host.is_empty() {
            return Err(invalid("empty host path"));
        }
        let mode = match mode {
            None | Some("ro") => AccessMode::ReadOnly,
            Some("rw") => AccessMode::ReadWrite,
            Some(other) => return Err(invalid(&format!("unknown access mode '{}'", other))),
        };
        let cont = if cont.is_empty() { host } else { cont };

        Ok(Self {
            host_path: cleanpath(host),
            container_path: cleanpath(cont),
            mode,
            origin: BindingOrigin::Explicit,
        })
    }

    /// Marks the binding as coming from a default list.
    pub fn with_origin(mut self, origin: BindingOrigin) -> Self {
        self.origin = origin;
        self
    }

    /// True if the user asked for this binding.
    pub fn is_explicit(&self) -> bool {
        self.origin == BindingOrigin::Explicit
    }

    /// True if the binding is writable.
    pub fn is_rw(&self) -> bool {
        self.mode == AccessMode::ReadWrite
    }

    /// Split form, as used by backend argument strings.
    pub fn split(&self) -> (&str, &str) {
        (&self.host_path, &self.container_path)
    }
}

impl FromStr for VolumeBinding {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl fmt::Display for VolumeBinding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host_path, self.container_path)?;
        if self.is_rw() {
            f.write_str(":rw")?;
        }
        Ok(())
    }
}

/// Lexically normalises a path: collapses separators, drops `.`, resolves
/// `..` and strips any trailing `/`. Relative paths stay relative.
pub fn cleanpath(path: &str) -> String {
    let absolute = path.starts_with('/');
    let mut parts: Vec<&str> = Vec::new();
    for part in path.split('/') {
        match part {
            "" | "." => {}
            ".." => {
                if parts.last().is_some_and(|p| *p != "..") {
                    parts.pop();
                } else if !absolute {
                    parts.push("..");
                }
            }
            other => parts.push(other),
        }
    }
    let joined = parts.join("/");
    match (absolute, joined.is_empty()) {
        (true, _) => format!("/{}", joined),
        (false, true) => ".".to_string(),
        (false, false) => joined,
    }
}

/// True if `container_path` is one of `protected` after normalisation.
pub fn is_protected(container_path: &str, protected: &[&str]) -> bool {
    let path = cleanpath(container_path);
    protected.iter().any(|p| cleanpath(p) == path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_forms() {
        let v = VolumeBinding::parse("/home/user").unwrap();
        assert_eq!(v.split(), ("/home/user", "/home/user"));
        assert_eq!(v.mode, AccessMode::ReadOnly);

        let v = VolumeBinding::parse("/data:/mnt/data").unwrap();
        assert_eq!(v.split(), ("/data", "/mnt/data"));

        let v = VolumeBinding::parse("/data:/mnt/data:rw").unwrap();
        assert!(v.is_rw());

        let v = VolumeBinding::parse("/data:rw").unwrap();
        assert_eq!(v.split(), ("/data", "/data"));
        assert!(v.is_rw());
    }

    #[test]
    fn test_parse_rejects_bad_shapes() {
        assert!(VolumeBinding::parse(":/cont").is_err());
        assert!(VolumeBinding::parse("/a:/b:rx").is_err());
        assert!(VolumeBinding::parse("/a:/b:ro:x").is_err());
    }

    #[test]
    fn test_display_round_trip() {
        let v = VolumeBinding::parse("/data//x/:/mnt/:rw").unwrap();
        assert_eq!(v.to_string(), "/data/x:/mnt:rw");
        assert_eq!(v.to_string().parse::<VolumeBinding>().unwrap(), v);
    }

    #[test]
    fn test_cleanpath() {
        assert_eq!(cleanpath("/a//b/./c/"), "/a/b/c");
        assert_eq!(cleanpath("/a/b/../c"), "/a/c");
        assert_eq!(cleanpath("/../.."), "/");
        assert_eq!(cleanpath("a/../../b"), "../b");
        assert_eq!(cleanpath(""), ".");
    }

    #[test]
    fn test_is_protected() {
        assert!(is_protected("/usr/", &["/usr", "/etc"]));
        assert!(!is_protected("/usr/local", &["/usr", "/etc"]));
    }
}
