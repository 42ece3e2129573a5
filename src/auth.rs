//! `/etc/passwd` and `/etc/group` handling for identity emulation.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::error::Result;
use crate::options::UserSpec;

/// One passwd line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PasswdEntry {
    pub name: String,
    pub uid: u32,
    pub gid: u32,
    pub gecos: String,
    pub home: String,
    pub shell: String,
}

impl PasswdEntry {
    fn parse(line: &str) -> Option<Self> {
        let fields: Vec<&str> = line.split(':').collect();
        if fields.len() < 7 || fields[0].is_empty() {
            return None;
        }
        Some(Self {
            name: fields[0].to_string(),
            uid: fields[2].parse().ok()?,
            gid: fields[3].parse().ok()?,
            gecos: fields[4].to_string(),
            home: fields[5].to_string(),
            shell: fields[6].to_string(),
        })
    }

    fn to_line(&self) -> String {
        format!(
            "{}:x:{}:{}:{}:{}:{}\n",
            self.name, self.uid, self.gid, self.gecos, self.home, self.shell
        )
    }
}

/// One group line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupEntry {
    pub name: String,
    pub gid: u32,
    pub members: Vec<String>,
}

impl GroupEntry {
    fn parse(line: &str) -> Option<Self> {
        let fields: Vec<&str> = line.split(':').collect();
        if fields.len() < 3 || fields[0].is_empty() {
            return None;
        }
        Some(Self {
            name: fields[0].to_string(),
            gid: fields[2].parse().ok()?,
            members: fields
                .get(3)
                .map(|m| {
                    m.split(',')
                        .filter(|s| !s.is_empty())
                        .map(str::to_string)
                        .collect()
                })
                .unwrap_or_default(),
        })
    }
}

/// A passwd/group file pair.
#[derive(Debug, Clone)]
pub struct NixAuthentication {
    passwd_file: PathBuf,
    group_file: PathBuf,
}

impl NixAuthentication {
    pub fn new(passwd_file: impl Into<PathBuf>, group_file: impl Into<PathBuf>) -> Self {
        Self {
            passwd_file: passwd_file.into(),
            group_file: group_file.into(),
        }
    }

    /// The host's own files.
    pub fn host() -> Self {
        Self::new("/etc/passwd", "/etc/group")
    }

    pub fn passwd_file(&self) -> &Path {
        &self.passwd_file
    }

    pub fn group_file(&self) -> &Path {
        &self.group_file
    }

    fn read_lines(path: &Path) -> Vec<String> {
        fs::read_to_string(path)
            .map(|data| data.lines().map(str::to_string).collect())
            .unwrap_or_default()
    }

    /// All parsable users; a missing file has none.
    pub fn users(&self) -> Vec<PasswdEntry> {
        Self::read_lines(&self.passwd_file)
            .iter()
            .filter_map(|l| PasswdEntry::parse(l))
            .collect()
    }

    /// All parsable groups; a missing file has none.
    pub fn groups(&self) -> Vec<GroupEntry> {
        Self::read_lines(&self.group_file)
            .iter()
            .filter_map(|l| GroupEntry::parse(l))
            .collect()
    }

    /// Looks a user up by name or uid.
    pub fn get_user(&self, spec: &UserSpec) -> Option<PasswdEntry> {
        self.users().into_iter().find(|u| match spec {
            UserSpec::Name(name) => &u.name == name,
            UserSpec::Ids { uid, .. } => u.uid == *uid,
        })
    }

    pub fn get_group_by_gid(&self, gid: u32) -> Option<GroupEntry> {
        self.groups().into_iter().find(|g| g.gid == gid)
    }

    pub fn get_group_by_name(&self, name: &str) -> Option<GroupEntry> {
        self.groups().into_iter().find(|g| g.name == name)
    }

    fn append_line(path: &Path, line: &str) -> Result<()> {
        let needs_newline = fs::read(path)
            .map(|data| !data.is_empty() && !data.ends_with(b"\n"))
            .unwrap_or(false);
        let mut file = OpenOptions::new().create(true).append(true).open(path)?;
        if needs_newline {
            file.write_all(b"\n")?;
        }
        file.write_all(line.as_bytes())?;
        Ok(())
    }

    /// Appends a user account.
    pub fn add_user(&self, entry: &PasswdEntry) -> Result<()> {
        debug!("Adding user {} ({}) to {}", entry.name, entry.uid, self.passwd_file.display());
        Self::append_line(&self.passwd_file, &entry.to_line())
    }

    /// Appends a group.
    pub fn add_group(&self, name: &str, gid: u32, members: &[String]) -> Result<()> {
        debug!("Adding group {} ({}) to {}", name, gid, self.group_file.display());
        let line = format!("{}:x:{}:{}\n", name, gid, members.join(","));
        Self::append_line(&self.group_file, &line)
    }
}
