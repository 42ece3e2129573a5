//! Ordered container environment.

use std::fmt;

use crate::error::{Error, Result};

/// `NAME=value` pairs in insertion order; setting an existing name replaces
/// its value in place.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Uenv {
    vars: Vec<(String, String)>,
}

/// True for `[A-Za-z_][A-Za-z0-9_]*`.
pub fn is_valid_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

impl Uenv {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds an environment from `NAME=value` strings.
    pub fn from_list<S: AsRef<str>>(entries: &[S]) -> Result<Self> {
        let mut env = Self::new();
        for entry in entries {
            env.append(entry.as_ref())?;
        }
        Ok(env)
    }

    /// Adds or replaces a `NAME=value` entry.
    pub fn append(&mut self, entry: &str) -> Result<()> {
        let (name, value) = entry
            .split_once('=')
            .ok_or_else(|| Error::InvalidEnv(entry.to_string()))?;
        self.set(name, value)
    }

    /// Adds or replaces `name`.
    pub fn set(&mut self, name: &str, value: &str) -> Result<()> {
        if !is_valid_name(name) {
            return Err(Error::InvalidEnv(format!("{}={}", name, value)));
        }
        match self.vars.iter_mut().find(|(n, _)| n == name) {
            Some(slot) => slot.1 = value.to_string(),
            None => self.vars.push((name.to_string(), value.to_string())),
        }
        Ok(())
    }

    /// Sets `name` only if it is not present yet.
    pub fn set_if_absent(&mut self, name: &str, value: &str) -> Result<()> {
        if self.get(name).is_some() {
            return Ok(());
        }
        self.set(name, value)
    }

    /// Value of `name`.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.vars
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }

    /// Removes `name`.
    pub fn remove(&mut self, name: &str) {
        self.vars.retain(|(n, _)| n != name);
    }

    /// Appends every entry of `other`, replacing duplicates.
    pub fn extend(&mut self, other: &Uenv) {
        for (name, value) in &other.vars {
            match self.vars.iter_mut().find(|(n, _)| n == name) {
                Some(slot) => slot.1 = value.clone(),
                None => self.vars.push((name.clone(), value.clone())),
            }
        }
    }

    /// `NAME=value` strings.
    pub fn list(&self) -> Vec<String> {
        self.vars.iter().map(|(n, v)| format!("{}={}", n, v)).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.vars.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }

    pub fn is_empty(&self) -> bool {
        self.vars.is_empty()
    }

    pub fn len(&self) -> usize {
        self.vars.len()
    }
}

impl fmt::Display for Uenv {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.list().join(" "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_replaces_in_place() {
        let mut env = Uenv::from_list(&["A=1", "B=2"]).unwrap();
        env.append("A=3").unwrap();
        assert_eq!(env.list(), vec!["A=3", "B=2"]);
    }

    #[test]
    fn test_value_may_contain_equals() {
        let env = Uenv::from_list(&["OPTS=a=b"]).unwrap();
        assert_eq!(env.get("OPTS"), Some("a=b"));
    }

    #[test]
    fn test_invalid_entries() {
        let mut env = Uenv::new();
        assert!(env.append("NOEQUALS").is_err());
        assert!(env.append("1BAD=x").is_err());
        assert!(env.append("BAD-NAME=x").is_err());
        assert!(env.is_empty());
    }

    #[test]
    fn test_extend_and_set_if_absent() {
        let mut meta = Uenv::from_list(&["PATH=/bin", "LANG=C"]).unwrap();
        let user = Uenv::from_list(&["LANG=pt_PT"]).unwrap();
        meta.extend(&user);
        meta.set_if_absent("PATH", "/usr/bin").unwrap();
        assert_eq!(meta.get("LANG"), Some("pt_PT"));
        assert_eq!(meta.get("PATH"), Some("/bin"));
    }
}
