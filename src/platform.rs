//! Host and guest probes.
//!
//! [`HostInfo`] captures what the engines need to know about the machine
//! they run on (architecture, kernel, identity, PATH). It is detected once
//! and passed around by reference so tests can substitute their own values.
//! [`OsInfo`] answers the same kind of questions about a container root.

use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use tracing::debug;

use crate::auth::NixAuthentication;
use crate::fileutil;
use crate::options::UserSpec;

/// CPU architecture.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Arch {
    Amd64,
    I386,
    Arm64,
    Arm,
    Ppc64le,
    Unknown,
}

impl Arch {
    /// Docker style name ("amd64").
    pub fn as_str(&self) -> &'static str {
        match self {
            Arch::Amd64 => "amd64",
            Arch::I386 => "i386",
            Arch::Arm64 => "arm64",
            Arch::Arm => "arm",
            Arch::Ppc64le => "ppc64le",
            Arch::Unknown => "unknown",
        }
    }

    /// Suffix used by bundled binaries and libraries ("x86_64").
    pub fn binary_suffix(&self) -> &'static str {
        match self {
            Arch::Amd64 => "x86_64",
            Arch::I386 => "x86",
            Arch::Arm64 => "arm64",
            Arch::Arm => "arm",
            Arch::Ppc64le => "ppc64le",
            Arch::Unknown => "unknown",
        }
    }

    /// Maps an ELF `e_machine` value.
    fn from_elf_machine(machine: u16) -> Self {
        match machine {
            0x3e => Arch::Amd64,
            0x03 => Arch::I386,
            0xb7 => Arch::Arm64,
            0x28 => Arch::Arm,
            0x15 => Arch::Ppc64le,
            _ => Arch::Unknown,
        }
    }
}

impl std::fmt::Display for Arch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// Host
// =============================================================================

/// Detected host information.
#[derive(Debug, Clone)]
pub struct HostInfo {
    /// CPU architecture.
    pub arch: Arch,
    /// Kernel release (`uname -r`), if detectable.
    pub kernel_version: Option<String>,
    /// Real uid of the invoking user.
    pub uid: u32,
    /// Real gid of the invoking user.
    pub gid: u32,
    /// Supplementary group ids.
    pub groups: Vec<u32>,
    /// Login name of the invoking user.
    pub username: String,
    /// Home directory of the invoking user.
    pub home: PathBuf,
    /// Host node name.
    pub hostname: String,
    /// Host PATH used to find pinning tools and backends.
    pub path: String,
}

impl HostInfo {
    /// Detects the current host.
    pub fn detect() -> Self {
        let arch = Self::detect_arch();
        let kernel_version = Self::detect_kernel_version();
        // SAFETY: getuid/getgid cannot fail and touch no memory.
        let (uid, gid) = unsafe { (libc::getuid(), libc::getgid()) };

        let host_auth = NixAuthentication::host();
        let entry = host_auth.get_user(&UserSpec::Ids { uid, gid: None });
        let username = entry
            .as_ref()
            .map(|e| e.name.clone())
            .or_else(|| std::env::var("USER").ok())
            .unwrap_or_else(|| uid.to_string());
        let home = entry
            .map(|e| PathBuf::from(e.home))
            .or_else(dirs::home_dir)
            .unwrap_or_else(|| PathBuf::from("/"));

        let info = Self {
            arch,
            kernel_version,
            uid,
            gid,
            groups: Self::detect_groups(),
            username,
            home,
            hostname: Self::detect_hostname(),
            path: std::env::var("PATH").unwrap_or_default(),
        };
        debug!(
            "Host {} kernel {:?} uid {} gid {}",
            info.arch, info.kernel_version, info.uid, info.gid
        );
        info
    }

    /// Detects the CPU architecture.
    fn detect_arch() -> Arch {
        #[cfg(target_arch = "x86_64")]
        return Arch::Amd64;

        #[cfg(target_arch = "x86")]
        return Arch::I386;

        #[cfg(target_arch = "aarch64")]
        return Arch::Arm64;

        #[cfg(target_arch = "arm")]
        return Arch::Arm;

        #[cfg(target_arch = "powerpc64")]
        return Arch::Ppc64le;

        #[cfg(not(any(
            target_arch = "x86_64",
            target_arch = "x86",
            target_arch = "aarch64",
            target_arch = "arm",
            target_arch = "powerpc64"
        )))]
        return Arch::Unknown;
    }

    /// Detects kernel version.
    fn detect_kernel_version() -> Option<String> {
        Command::new("uname")
            .arg("-r")
            .output()
            .ok()
            .and_then(|o| String::from_utf8(o.stdout).ok())
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
    }

    fn detect_groups() -> Vec<u32> {
        // SAFETY: a zero-sized call only returns the number of groups.
        let count = unsafe { libc::getgroups(0, std::ptr::null_mut()) };
        if count <= 0 {
            return Vec::new();
        }
        let mut groups: Vec<libc::gid_t> = vec![0; count as usize];
        // SAFETY: the buffer holds exactly `count` entries.
        let filled = unsafe { libc::getgroups(count, groups.as_mut_ptr()) };
        if filled < 0 {
            return Vec::new();
        }
        groups.truncate(filled as usize);
        groups.into_iter().map(|g| g as u32).collect()
    }

    fn detect_hostname() -> String {
        let mut buf = [0u8; 256];
        // SAFETY: the pointer and length describe `buf`.
        let rc = unsafe { libc::gethostname(buf.as_mut_ptr().cast(), buf.len()) };
        if rc != 0 {
            return "localhost".to_string();
        }
        let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
        String::from_utf8_lossy(&buf[..end]).into_owned()
    }

    /// True when the invoking user is the real root.
    pub fn is_root(&self) -> bool {
        self.uid == 0
    }

    /// Kernel release as numeric components ("5.15.0-91" gives [5, 15, 0]).
    pub fn kernel_triplet(&self) -> Vec<u32> {
        self.kernel_version
            .as_deref()
            .map(parse_version)
            .unwrap_or_default()
    }

    /// True if the host kernel is at least `min`.
    pub fn kernel_at_least(&self, min: &[u32]) -> bool {
        let current = self.kernel_triplet();
        if current.is_empty() {
            return false;
        }
        for (i, want) in min.iter().enumerate() {
            let have = current.get(i).copied().unwrap_or(0);
            if have != *want {
                return have > *want;
            }
        }
        true
    }

    /// Finds an executable on the host PATH.
    pub fn find_exec(&self, name: &str) -> Option<PathBuf> {
        fileutil::find_in_path(name, &self.path)
    }

    /// True if `executable --help` mentions `option`.
    pub fn has_option(executable: &Path, option: &str) -> bool {
        let output = Command::new(executable)
            .arg("--help")
            .stdin(Stdio::null())
            .output();
        match output {
            Ok(out) => {
                let text = [out.stdout, out.stderr].concat();
                String::from_utf8_lossy(&text).contains(option)
            }
            Err(_) => false,
        }
    }
}

/// Parses the leading numeric components of a version string.
pub fn parse_version(version: &str) -> Vec<u32> {
    let mut parts = Vec::new();
    for piece in version.split('.') {
        let digits: String = piece.chars().take_while(|c| c.is_ascii_digit()).collect();
        if digits.is_empty() {
            break;
        }
        parts.push(digits.parse().unwrap_or(0));
        if digits.len() != piece.len() {
            break;
        }
    }
    parts
}

// =============================================================================
// Guest
// =============================================================================

/// What an executable inside the container is.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileKind {
    /// ELF object.
    Elf,
    /// Script with a `#!` line; interpreter path and optional argument.
    Script {
        interpreter: String,
        arg: Option<String>,
    },
    /// Anything else.
    Other,
}

/// Probes of a container root filesystem.
#[derive(Debug, Clone)]
pub struct OsInfo {
    root: PathBuf,
}

impl OsInfo {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Guest architecture, from the ELF header of a common binary.
    pub fn arch(&self) -> Arch {
        for candidate in ["/bin/sh", "/bin/bash", "/usr/bin/env", "/bin/busybox"] {
            let host_path = fileutil::resolve_in_root(&self.root, candidate);
            if let Some(arch) = elf_arch(&host_path) {
                return arch;
            }
        }
        Arch::Unknown
    }

    /// Distribution name and version ("Ubuntu", "22.04").
    pub fn osdistribution(&self) -> Option<(String, String)> {
        for release in ["/etc/os-release", "/usr/lib/os-release"] {
            let path = fileutil::resolve_in_root(&self.root, release);
            let Ok(data) = fs::read_to_string(&path) else {
                continue;
            };
            let mut name = String::new();
            let mut version = String::new();
            for line in data.lines() {
                if let Some((key, value)) = line.split_once('=') {
                    let value = value.trim().trim_matches('"').trim_matches('\'');
                    match key.trim() {
                        "NAME" => {
                            name = value.split_whitespace().next().unwrap_or("").to_string()
                        }
                        "VERSION_ID" => version = value.to_string(),
                        _ => {}
                    }
                }
            }
            if !name.is_empty() {
                return Some((name, version));
            }
        }

        let alpine = fileutil::resolve_in_root(&self.root, "/etc/alpine-release");
        fs::read_to_string(alpine)
            .ok()
            .map(|v| ("Alpine".to_string(), v.trim().to_string()))
    }

    /// Classifies a host-side path of a container file.
    pub fn file_kind(host_path: &Path) -> FileKind {
        let mut head = [0u8; 256];
        let read = fs::File::open(host_path)
            .and_then(|mut f| f.read(&mut head))
            .unwrap_or(0);
        let head = &head[..read];

        if head.starts_with(b"\x7fELF") {
            return FileKind::Elf;
        }
        if let Some(rest) = head.strip_prefix(b"#!") {
            let line_end = rest.iter().position(|&b| b == b'\n').unwrap_or(rest.len());
            let line = String::from_utf8_lossy(&rest[..line_end]);
            let mut parts = line.trim().splitn(2, char::is_whitespace);
            if let Some(interpreter) = parts.next().filter(|s| !s.is_empty()) {
                return FileKind::Script {
                    interpreter: interpreter.to_string(),
                    arg: parts
                        .next()
                        .map(|s| s.trim().to_string())
                        .filter(|s| !s.is_empty()),
                };
            }
        }
        FileKind::Other
    }
}

/// Reads the architecture from an ELF header.
fn elf_arch(path: &Path) -> Option<Arch> {
    let mut header = [0u8; 20];
    let mut file = fs::File::open(path).ok()?;
    file.read_exact(&mut header).ok()?;
    if &header[..4] != b"\x7fELF" {
        return None;
    }
    let raw = [header[18], header[19]];
    let machine = match header[5] {
        2 => u16::from_be_bytes(raw),
        _ => u16::from_le_bytes(raw),
    };
    Some(Arch::from_elf_machine(machine))
}
