//! # Fakechroot Engine - Modes F1 to F4
//!
//! Runs the container program directly on the host with `libfakechroot`
//! preloaded. The library rewrites path arguments of libc calls so the
//! program sees the container root as `/`. No uid switching is possible;
//! the run user is always the invoking user.
//!
//! ## Modes
//!
//! | Mode | Loader                     | Library search               |
//! |------|----------------------------|------------------------------|
//! | F1   | container loader, unpatched | `LD_LIBRARY_PATH`           |
//! | F2   | patched loader copy        | `LD_LIBRARY_REAL`             |
//! | F3   | ELF interpreters patched   | `LD_LIBRARY_REAL`             |
//! | F4   | like F3, patched lazily    | `LD_LIBRARY_REAL` + patchelf  |
//!
//! The root preparation for each mode happens in mode transitions; this
//! engine only exports the matching environment.
//!
//! ## Library Selection
//!
//! An absolute `fakechroot_so` is used as is, other configured names are
//! looked up in the library directory. Otherwise `libfakechroot.so` at the
//! top of the root wins, then the most specific match for the guest:
//! `libfakechroot-<Distro>-<version>-<arch>.so`, then with the major
//! version only, then without version, then `libfakechroot-<arch>.so` and
//! finally `libfakechroot.so`.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tracing::{Level, debug, warn};

use crate::config::Config;
use crate::elfpatcher::{ElfPatch, ElfPatcher};
use crate::engine::ExecutionEngine;
use crate::engines::common::{EngineCommon, build_command};
use crate::error::{Error, Result};
use crate::execmode::ModeTag;
use crate::fileutil;
use crate::platform::{Arch, FileKind, OsInfo};

const LIB_NAME: &str = "libfakechroot";
const DEFAULT_LIB: &str = "libfakechroot.so";

/// Locates the preload library for the container in `container_root`.
pub fn select_fakechroot_so(config: &Config, libdir: &Path, container_root: &Path, host_arch: Arch) -> Result<PathBuf> {
    if let Some(first) = config.fakechroot_so.first() {
        let path = Path::new(first);
        if path.is_absolute() && path.exists() {
            return Ok(path.to_path_buf());
        }
        return fileutil::find_file_in_dir(libdir, &config.fakechroot_so)
            .ok_or_else(|| Error::FakechrootNotFound(config.fakechroot_so.clone()));
    }

    let in_root = container_root.join(DEFAULT_LIB);
    if in_root.exists() {
        return Ok(in_root);
    }

    let guest = OsInfo::new(container_root);
    let sfx = match guest.arch() {
        Arch::Unknown => host_arch.binary_suffix(),
        arch => arch.binary_suffix(),
    };
    let mut names = Vec::new();
    if let Some((distro, version)) = guest.osdistribution() {
        let major = version.split('.').next().unwrap_or_default().to_string();
        if !version.is_empty() {
            names.push(format!("{}-{}-{}-{}.so", LIB_NAME, distro, version, sfx));
            if major != version {
                names.push(format!("{}-{}-{}-{}.so", LIB_NAME, distro, major, sfx));
            }
        }
        names.push(format!("{}-{}-{}.so", LIB_NAME, distro, sfx));
    }
    names.push(format!("{}-{}.so", LIB_NAME, sfx));
    names.push(DEFAULT_LIB.to_string());

    fileutil::find_file_in_dir(libdir, &names).ok_or(Error::FakechrootNotFound(names))
}

/// Fakechroot execution engine.
pub struct FakechrootEngine {
    common: EngineCommon,
    elf_patcher: Option<Box<dyn ElfPatch>>,
    recommend_expand_symlinks: bool,
}

impl FakechrootEngine {
    pub fn new(common: EngineCommon) -> Self {
        Self {
            common,
            elf_patcher: None,
            recommend_expand_symlinks: false,
        }
    }

    /// Uses `patcher` instead of one built for the container directory.
    pub fn with_elf_patcher(mut self, patcher: Box<dyn ElfPatch>) -> Self {
        self.elf_patcher = Some(patcher);
        self
    }

    fn patcher(&self) -> Result<&dyn ElfPatch> {
        self.elf_patcher
            .as_deref()
            .ok_or_else(|| Error::Internal("ELF patcher not initialized".to_string()))
    }

    /// Volume bindings as fakechroot sees them: host paths left untouched
    /// (`FAKECHROOT_EXCLUDE_PATH`) and `host!container` rewrites
    /// (`FAKECHROOT_DIR_MAP`), both `:` separated.
    pub fn get_volume_bindings(&mut self) -> (String, String) {
        let config = &self.common.config;
        let mut excluded = Vec::new();
        let mut mapped: BTreeMap<String, String> = BTreeMap::new();

        for vol in &self.common.opt.vol {
            let (host, cont) = vol.split();
            let same = host == cont;
            if same
                && (config.fakechroot_expand_symlinks == Some(false)
                    || config.sysdirs_list.iter().any(|d| d == host)
                    || !Path::new(host).is_dir())
            {
                excluded.push(host.to_string());
                continue;
            }
            let real = std::fs::canonicalize(host)
                .map(|p| p.to_string_lossy().into_owned())
                .unwrap_or_else(|_| host.to_string());
            mapped.insert(cont.to_string(), format!("{}!{}", real, cont));
            if !same {
                self.recommend_expand_symlinks = true;
            }
        }

        let dir_map: Vec<String> = mapped.into_values().rev().collect();
        (excluded.join(":"), dir_map.join(":"))
    }

    /// Container files from `access_files` that exist, `:` separated.
    pub fn get_access_filesok(&self) -> String {
        let root = &self.common.container_root;
        let vols = &self.common.opt.vol;
        self.common
            .config
            .access_files
            .iter()
            .filter(|cont| fileutil::cont2host(root, cont, vols).exists())
            .cloned()
            .collect::<Vec<_>>()
            .join(":")
    }

    /// Exports the preload configuration into the container environment.
    pub fn fakechroot_env_set(&mut self, fakechroot_so: &Path) -> Result<()> {
        let (exclude, dir_map) = self.get_volume_bindings();
        let access_filesok = self.get_access_filesok();
        let base = std::fs::canonicalize(&self.common.container_root)
            .unwrap_or_else(|_| self.common.container_root.clone());
        let expand_symlinks = self
            .common
            .config
            .fakechroot_expand_symlinks
            .unwrap_or(self.recommend_expand_symlinks);
        let tmp_is_volume = self.common.is_volume("/tmp").is_some();

        let mode = self.common.mode;
        let (loader, ld_library_path, patchelf, last_time) = {
            let patcher = self.patcher()?;
            let patchelf = if mode == ModeTag::F4 {
                Some(patcher.select_patchelf().ok_or_else(|| Error::BackendNotFound {
                    tool: "patchelf".to_string(),
                    hint: "F4 needs patchelf on the PATH or in the bin directory".to_string(),
                })?)
            } else {
                None
            };
            (
                patcher.get_container_loader(),
                patcher.get_ld_library_path(),
                patchelf,
                patcher.get_patch_last_time(),
            )
        };
        let loader = loader
            .map(|p| p.to_string_lossy().into_owned())
            .unwrap_or_default();

        let env = &mut self.common.opt.env;
        env.set("PWD", &self.common.opt.cwd)?;
        env.set("FAKECHROOT_BASE", &base.to_string_lossy())?;
        env.set("LD_PRELOAD", &fakechroot_so.to_string_lossy())?;
        env.set("FAKECHROOT_EXPAND_SYMLINKS", if expand_symlinks { "true" } else { "false" })?;
        if !tmp_is_volume {
            env.set("FAKECHROOT_AF_UNIX_PATH", &self.common.config.tmpdir.to_string_lossy())?;
        }
        if !exclude.is_empty() {
            env.set("FAKECHROOT_EXCLUDE_PATH", &exclude)?;
        }
        if !dir_map.is_empty() {
            env.set("FAKECHROOT_DIR_MAP", &dir_map)?;
        }
        if tracing::enabled!(Level::DEBUG) {
            env.set("FAKECHROOT_DEBUG", "true")?;
            env.set("LD_DEBUG", "libs")?;
        }
        if !access_filesok.is_empty() {
            env.set("FAKECHROOT_ACCESS_FILESOK", &access_filesok)?;
        }

        match mode {
            ModeTag::F1 => {
                env.set("FAKECHROOT_ELFLOADER", &loader)?;
                env.set("LD_LIBRARY_PATH", &ld_library_path)?;
            }
            ModeTag::F2 => {
                env.set("FAKECHROOT_ELFLOADER", &loader)?;
                env.set("LD_LIBRARY_REAL", &ld_library_path)?;
                env.set("LD_LIBRARY_PATH", &ld_library_path)?;
            }
            ModeTag::F3 => {
                env.set("LD_LIBRARY_REAL", &ld_library_path)?;
                env.set("LD_LIBRARY_PATH", &ld_library_path)?;
            }
            ModeTag::F4 => {
                env.set("LD_LIBRARY_REAL", &ld_library_path)?;
                env.set("LD_LIBRARY_PATH", &ld_library_path)?;
                if let Some(patchelf) = patchelf {
                    env.set("FAKECHROOT_PATCH_PATCHELF", &patchelf.to_string_lossy())?;
                }
                env.set("FAKECHROOT_PATCH_ELFLOADER", &loader)?;
                env.set("FAKECHROOT_PATCH_LAST_TIME", &last_time)?;
            }
            other => return Err(Error::InvalidExecMode(other.to_string())),
        }
        Ok(())
    }

    /// How to start the executable: scripts go through their interpreter
    /// mapped to the host, anything else is started by host path.
    pub fn run_add_script_support(&self, exec_path: &str) -> Vec<String> {
        let root = &self.common.container_root;
        let vols = &self.common.opt.vol;
        let host_path = fileutil::cont2host(root, exec_path, vols);

        match OsInfo::file_kind(&host_path) {
            FileKind::Script { interpreter, arg } => {
                let root_str = root.to_string_lossy();
                let interpreter = if interpreter.starts_with(root_str.as_ref()) {
                    interpreter
                } else {
                    fileutil::cont2host(root, &interpreter, vols)
                        .to_string_lossy()
                        .into_owned()
                };
                let mut argv = vec![interpreter];
                argv.extend(arg);
                argv.push(exec_path.to_string());
                argv
            }
            FileKind::Elf | FileKind::Other => vec![host_path.to_string_lossy().into_owned()],
        }
    }

    /// Full command line for an initialized container.
    pub fn build_argv(&mut self) -> Result<Vec<String>> {
        let mut argv = self.common.set_cpu_affinity();
        let env_exe = self
            .common
            .host
            .find_exec("env")
            .unwrap_or_else(|| PathBuf::from("/usr/bin/env"));
        argv.push(env_exe.to_string_lossy().into_owned());
        argv.push("-i".to_string());
        argv.extend(self.common.opt.env.list());

        if matches!(self.common.mode, ModeTag::F1 | ModeTag::F2) {
            if let Some(loader) = self.patcher()?.get_container_loader() {
                argv.push(loader.to_string_lossy().into_owned());
            }
        }
        argv.extend(self.run_add_script_support(&self.common.exec_path));
        argv.extend(self.common.opt.cmd.iter().skip(1).cloned());
        Ok(argv)
    }
}

#[async_trait]
impl ExecutionEngine for FakechrootEngine {
    fn common(&self) -> &EngineCommon {
        &self.common
    }

    fn common_mut(&mut self) -> &mut EngineCommon {
        &mut self.common
    }

    async fn run(&mut self, container_id: &str) -> Result<i32> {
        if self.common.opt.location.is_some() {
            return Err(Error::InvalidOption(
                "fakechroot modes need a repository container, not --location".to_string(),
            ));
        }
        if !self.common.opt.portsmap.is_empty() || self.common.opt.netcoop {
            warn!("Port mapping and --netcoop are not supported in {}", self.common.mode);
        }

        self.common.run_init(container_id)?;
        let container_dir = self
            .common
            .container_dir
            .clone()
            .ok_or_else(|| Error::ContainerNotFound(container_id.to_string()))?;
        if self.elf_patcher.is_none() {
            let patcher = ElfPatcher::new(&container_dir, &self.common.repo.bindir(), &self.common.host);
            self.elf_patcher = Some(Box::new(patcher));
        }
        let links_moved = fileutil::recorded_link_root(&container_dir).is_some_and(|recorded| {
            std::fs::canonicalize(&self.common.container_root).is_ok_and(|root| root != recorded)
        });
        if links_moved
            || (matches!(self.common.mode, ModeTag::F3 | ModeTag::F4) && !self.patcher()?.check_container_path())
        {
            warn!(
                "Container links or binaries were prepared for another path, run setup --execmode={} --force",
                self.common.mode
            );
        }

        let fakechroot_so = select_fakechroot_so(
            &self.common.config,
            &self.common.repo.libdir(),
            &self.common.container_root,
            self.common.host.arch,
        )?;
        debug!("Preloading {}", fakechroot_so.display());

        self.common.run_env_set()?;
        self.fakechroot_env_set(&fakechroot_so)?;
        let argv = self.build_argv()?;

        let host_cwd = fileutil::cont2host(&self.common.container_root, &self.common.opt.cwd, &self.common.opt.vol);
        self.common.run_banner();
        let mut cmd = build_command(&argv, &self.common.host_env())?;
        cmd.current_dir(host_cwd);
        self.common.execute(cmd).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::options::RunOptions;
    use crate::platform::HostInfo;
    use crate::repository::{ContainerMeta, Repository};
    use std::sync::Arc;

    struct NoRepo;

    impl Repository for NoRepo {
        fn bindir(&self) -> PathBuf {
            PathBuf::from("/nonexistent")
        }
        fn libdir(&self) -> PathBuf {
            PathBuf::from("/nonexistent")
        }
        fn get_container_id(&self, _: &str) -> Option<String> {
            None
        }
        fn cd_container(&self, _: &str) -> Option<PathBuf> {
            None
        }
        fn get_container_name(&self, _: &str) -> Vec<String> {
            Vec::new()
        }
        fn get_container_attr(&self, _: &str) -> Option<(PathBuf, ContainerMeta)> {
            None
        }
    }

    fn engine(config: Config) -> FakechrootEngine {
        FakechrootEngine::new(EngineCommon::new(
            Arc::new(config),
            Arc::new(HostInfo::detect()),
            Arc::new(NoRepo),
            ModeTag::F1,
            RunOptions::default(),
        ))
    }

    #[test]
    fn test_select_fakechroot_so_configured() {
        let dir = tempfile::tempdir().unwrap();
        let lib = dir.path().join("libfakechroot-custom.so");
        std::fs::write(&lib, "").unwrap();

        let config = Config {
            fakechroot_so: vec![lib.to_string_lossy().into_owned()],
            ..Config::default()
        };
        let found = select_fakechroot_so(&config, Path::new("/nonexistent"), dir.path(), Arch::Amd64).unwrap();
        assert_eq!(found, lib);

        let config = Config {
            fakechroot_so: vec!["libfakechroot-custom.so".to_string()],
            ..Config::default()
        };
        let found = select_fakechroot_so(&config, dir.path(), Path::new("/nonexistent"), Arch::Amd64).unwrap();
        assert_eq!(found, lib);
    }

    #[test]
    fn test_select_fakechroot_so_by_distro() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("ROOT");
        let libdir = dir.path().join("lib");
        std::fs::create_dir_all(root.join("etc")).unwrap();
        std::fs::create_dir_all(&libdir).unwrap();
        std::fs::write(root.join("etc/os-release"), "NAME=\"Ubuntu\"\nVERSION_ID=\"22.04\"\n").unwrap();
        let sfx = Arch::Amd64.binary_suffix();
        let major = libdir.join(format!("libfakechroot-Ubuntu-22-{}.so", sfx));
        std::fs::write(&major, "").unwrap();
        std::fs::write(libdir.join("libfakechroot.so"), "").unwrap();

        let config = Config::default();
        let found = select_fakechroot_so(&config, &libdir, &root, Arch::Amd64).unwrap();
        assert_eq!(found, major);

        std::fs::write(root.join("libfakechroot.so"), "").unwrap();
        let found = select_fakechroot_so(&config, &libdir, &root, Arch::Amd64).unwrap();
        assert_eq!(found, root.join("libfakechroot.so"));
    }

    #[test]
    fn test_select_fakechroot_so_missing() {
        let dir = tempfile::tempdir().unwrap();
        let err = select_fakechroot_so(&Config::default(), dir.path(), dir.path(), Arch::Amd64).unwrap_err();
        match err {
            Error::FakechrootNotFound(names) => assert!(names.contains(&DEFAULT_LIB.to_string())),
            other => panic!("unexpected error: {}", other),
        }
    }

    #[test]
    fn test_get_volume_bindings() {
        let dir = tempfile::tempdir().unwrap();
        let data = std::fs::canonicalize(dir.path()).unwrap().join("data");
        let other = std::fs::canonicalize(dir.path()).unwrap().join("other");
        std::fs::create_dir_all(&data).unwrap();
        std::fs::create_dir_all(&other).unwrap();
        let file = dir.path().join("file.txt");
        std::fs::write(&file, "x").unwrap();

        let mut eng = engine(Config {
            sysdirs_list: vec!["/dev".to_string()],
            ..Config::default()
        });
        let opt = &mut eng.common.opt;
        opt.add_volume("/dev").unwrap();
        opt.add_volume(&file.to_string_lossy()).unwrap();
        opt.add_volume(&format!("{}:/data", data.display())).unwrap();
        opt.add_volume(&format!("{}:/opt", other.display())).unwrap();

        let (exclude, dir_map) = eng.get_volume_bindings();
        assert_eq!(exclude, format!("/dev:{}", file.display()));
        assert_eq!(
            dir_map,
            format!("{}!/opt:{}!/data", other.display(), data.display())
        );
        assert!(eng.recommend_expand_symlinks);
    }

    #[test]
    fn test_get_volume_bindings_no_expand() {
        let dir = tempfile::tempdir().unwrap();
        let host = dir.path().to_string_lossy().into_owned();
        let mut eng = engine(Config {
            fakechroot_expand_symlinks: Some(false),
            ..Config::default()
        });
        eng.common.opt.add_volume(&host).unwrap();
        let (exclude, dir_map) = eng.get_volume_bindings();
        assert_eq!(exclude, host);
        assert!(dir_map.is_empty());
    }

    #[test]
    fn test_get_access_filesok() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("sys/class/net")).unwrap();
        let mut eng = engine(Config {
            access_files: vec!["/sys/class/net".to_string(), "/proc/nothing".to_string()],
            ..Config::default()
        });
        eng.common.container_root = dir.path().to_path_buf();
        assert_eq!(eng.get_access_filesok(), "/sys/class/net");
    }

    #[test]
    fn test_script_support() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().to_path_buf();
        std::fs::create_dir_all(root.join("bin")).unwrap();
        std::fs::write(root.join("bin/run.sh"), "#!/bin/sh -e\necho hi\n").unwrap();
        std::fs::write(root.join("bin/tool"), b"\x7fELF\x02\x01\x01").unwrap();

        let mut eng = engine(Config::default());
        eng.common.container_root = root.clone();

        let argv = eng.run_add_script_support("/bin/run.sh");
        assert_eq!(
            argv,
            vec![
                root.join("bin/sh").to_string_lossy().into_owned(),
                "-e".to_string(),
                "/bin/run.sh".to_string(),
            ]
        );
        let argv = eng.run_add_script_support("/bin/tool");
        assert_eq!(argv, vec![root.join("bin/tool").to_string_lossy().into_owned()]);
    }
}
