//! # Execution Modes
//!
//! Every container carries one execution mode tag in
//! `<container_dir>/execmode`. The tag selects the engine and describes how
//! the container root is currently prepared:
//!
//! | Tag | Engine      | Root state                                        |
//! |-----|-------------|---------------------------------------------------|
//! | P1  | PRoot       | pristine                                          |
//! | P2  | PRoot       | pristine, seccomp bypass prepared                 |
//! | F1  | Fakechroot  | absolute symlinks converted to host paths         |
//! | F2  | Fakechroot  | links converted, loader copy patched              |
//! | F3  | Fakechroot  | links converted, loader and ELF interpreters patched |
//! | F4  | Fakechroot  | links converted, binaries patched on demand       |
//! | R1  | runc        | file binding directories present                  |
//! | R2  | runc        | as R1, PRoot overlay                              |
//! | R3  | runc        | as R1, PRoot overlay without seccomp              |
//! | S1  | Singularity | pristine                                          |
//!
//! ## Transitions
//!
//! [`transition_plan`] lists the ordered actions that move a root from one
//! state to another. Every action is idempotent, so a transition that fails
//! half way can simply be retried. The new tag is only written once all
//! actions succeeded.
//!
//! ```text
//!  F3 ──► P1 :  RestoreBinaries → RestoreLoader → RestoreLinks
//!  P1 ──► F2 :  ConvertLinks → PatchLoader
//!  F1 ──► F3 :  PatchLoader → PatchBinaries
//!  R1 ──► S1 :  RestoreFileBind
//! ```

use std::fmt;
use std::fs;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, error, info};

use crate::config::Config;
use crate::constants::{CONTAINER_ROOT_DIR, EXECMODE_FILE};
use crate::elfpatcher::{ElfPatch, ElfPatcher};
use crate::engine::{EngineKind, ExecutionEngine};
use crate::engines::common::EngineCommon;
use crate::engines::proot::{NoSeccompEnv, SeccompBypass};
use crate::engines::{FakechrootEngine, PRootEngine, RuncEngine, SingularityEngine};
use crate::error::{Error, Result};
use crate::filebind::FileBind;
use crate::fileutil::{self, LinkConvert, LinkConverter};
use crate::options::RunOptions;
use crate::platform::HostInfo;
use crate::repository::Repository;

// =============================================================================
// Mode Tags
// =============================================================================

/// Execution mode tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum ModeTag {
    P1,
    P2,
    F1,
    F2,
    F3,
    F4,
    R1,
    R2,
    R3,
    S1,
}

impl ModeTag {
    pub const ALL: [ModeTag; 10] = [
        ModeTag::P1,
        ModeTag::P2,
        ModeTag::F1,
        ModeTag::F2,
        ModeTag::F3,
        ModeTag::F4,
        ModeTag::R1,
        ModeTag::R2,
        ModeTag::R3,
        ModeTag::S1,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ModeTag::P1 => "P1",
            ModeTag::P2 => "P2",
            ModeTag::F1 => "F1",
            ModeTag::F2 => "F2",
            ModeTag::F3 => "F3",
            ModeTag::F4 => "F4",
            ModeTag::R1 => "R1",
            ModeTag::R2 => "R2",
            ModeTag::R3 => "R3",
            ModeTag::S1 => "S1",
        }
    }

    /// Engine family of the tag.
    pub fn kind(&self) -> EngineKind {
        match self {
            ModeTag::P1 | ModeTag::P2 => EngineKind::PRoot,
            ModeTag::F1 | ModeTag::F2 | ModeTag::F3 | ModeTag::F4 => EngineKind::Fakechroot,
            ModeTag::R1 | ModeTag::R2 | ModeTag::R3 => EngineKind::Runc,
            ModeTag::S1 => EngineKind::Singularity,
        }
    }

    fn patches_loader(&self) -> bool {
        matches!(self, ModeTag::F2 | ModeTag::F3)
    }

    fn patches_binaries(&self) -> bool {
        *self == ModeTag::F3
    }
}

impl FromStr for ModeTag {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let upper = s.trim().to_ascii_uppercase();
        ModeTag::ALL
            .into_iter()
            .find(|tag| tag.as_str() == upper)
            .ok_or_else(|| Error::InvalidExecMode(s.to_string()))
    }
}

impl TryFrom<String> for ModeTag {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<ModeTag> for String {
    fn from(tag: ModeTag) -> Self {
        tag.as_str().to_string()
    }
}

impl fmt::Display for ModeTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// Transition Table
// =============================================================================

/// One step of a mode transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionAction {
    RestoreBinaries,
    RestoreLoader,
    RestoreLinks,
    ConvertLinks,
    PatchLoader,
    PatchBinaries,
    SetupFileBind,
    RestoreFileBind,
    PrepareSeccompBypass,
}

impl TransitionAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RestoreBinaries => "restore_binaries",
            Self::RestoreLoader => "restore_ld",
            Self::RestoreLinks => "restore_links",
            Self::ConvertLinks => "convert_links",
            Self::PatchLoader => "patch_ld",
            Self::PatchBinaries => "patch_binaries",
            Self::SetupFileBind => "filebind_setup",
            Self::RestoreFileBind => "filebind_restore",
            Self::PrepareSeccompBypass => "seccomp_bypass",
        }
    }
}

impl fmt::Display for TransitionAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

fn leave_actions(from: ModeTag, plan: &mut Vec<TransitionAction>) {
    match from.kind() {
        EngineKind::Fakechroot => {
            if from.patches_binaries() {
                plan.push(TransitionAction::RestoreBinaries);
            }
            if from.patches_loader() {
                plan.push(TransitionAction::RestoreLoader);
            }
            plan.push(TransitionAction::RestoreLinks);
        }
        EngineKind::Runc => plan.push(TransitionAction::RestoreFileBind),
        EngineKind::PRoot | EngineKind::Singularity => {}
    }
}

fn enter_actions(to: ModeTag, plan: &mut Vec<TransitionAction>) {
    match to.kind() {
        EngineKind::Fakechroot => {
            plan.push(TransitionAction::ConvertLinks);
            if to.patches_loader() {
                plan.push(TransitionAction::PatchLoader);
            }
            if to.patches_binaries() {
                plan.push(TransitionAction::PatchBinaries);
            }
        }
        EngineKind::Runc => plan.push(TransitionAction::SetupFileBind),
        EngineKind::PRoot => {
            if !plan.contains(&TransitionAction::RestoreLoader) {
                plan.push(TransitionAction::RestoreLoader);
            }
            if to == ModeTag::P2 {
                plan.push(TransitionAction::PrepareSeccompBypass);
            }
        }
        EngineKind::Singularity => {}
    }
}

/// Ordered actions that move a container root from `from` to `to`.
pub fn transition_plan(from: ModeTag, to: ModeTag) -> Vec<TransitionAction> {
    let mut plan = Vec::new();
    if from == to {
        return plan;
    }

    if from.kind() == to.kind() {
        match to.kind() {
            EngineKind::Fakechroot => {
                if from.patches_binaries() && !to.patches_binaries() {
                    plan.push(TransitionAction::RestoreBinaries);
                }
                if from.patches_loader() && !to.patches_loader() {
                    plan.push(TransitionAction::RestoreLoader);
                }
                if !from.patches_loader() && to.patches_loader() {
                    plan.push(TransitionAction::PatchLoader);
                }
                if !from.patches_binaries() && to.patches_binaries() {
                    plan.push(TransitionAction::PatchBinaries);
                }
            }
            EngineKind::PRoot => enter_actions(to, &mut plan),
            EngineKind::Runc | EngineKind::Singularity => {}
        }
        return plan;
    }

    leave_actions(from, &mut plan);
    enter_actions(to, &mut plan);
    plan
}

/// Full undo of `from` followed by full setup of `to`, used to repair a
/// root whose state no longer matches its tag.
pub fn forced_plan(from: ModeTag, to: ModeTag) -> Vec<TransitionAction> {
    let mut plan = Vec::new();
    leave_actions(from, &mut plan);
    enter_actions(to, &mut plan);
    plan
}

// =============================================================================
// Execution Mode
// =============================================================================

/// Execution mode of one container.
pub struct ExecutionMode {
    config: Arc<Config>,
    host: Arc<HostInfo>,
    repo: Arc<dyn Repository>,
    container_id: String,
    container_dir: PathBuf,
    elf_patcher: Box<dyn ElfPatch>,
    link_converter: Box<dyn LinkConvert>,
    seccomp_bypass: Arc<dyn SeccompBypass>,
}

impl ExecutionMode {
    /// Execution mode of `container_id`, which may be an id or a name.
    pub fn new(
        config: Arc<Config>,
        host: Arc<HostInfo>,
        repo: Arc<dyn Repository>,
        container_id: &str,
    ) -> Result<Self> {
        let container_dir = repo
            .cd_container(container_id)
            .ok_or_else(|| Error::ContainerNotFound(container_id.to_string()))?;
        let container_id = repo
            .get_container_id(container_id)
            .unwrap_or_else(|| container_id.to_string());

        let elf_patcher = ElfPatcher::new(&container_dir, &repo.bindir(), &host);
        let link_converter = LinkConverter::new(container_dir.join(CONTAINER_ROOT_DIR), host.uid)
            .with_orig_root(fileutil::recorded_link_root(&container_dir));
        Ok(Self {
            config,
            host,
            repo,
            container_id,
            container_dir,
            elf_patcher: Box::new(elf_patcher),
            link_converter: Box::new(link_converter),
            seccomp_bypass: Arc::new(NoSeccompEnv),
        })
    }

    /// Replaces the root preparation collaborators.
    pub fn with_collaborators(
        mut self,
        elf_patcher: Box<dyn ElfPatch>,
        link_converter: Box<dyn LinkConvert>,
        seccomp_bypass: Arc<dyn SeccompBypass>,
    ) -> Self {
        self.elf_patcher = elf_patcher;
        self.link_converter = link_converter;
        self.seccomp_bypass = seccomp_bypass;
        self
    }

    pub fn container_id(&self) -> &str {
        &self.container_id
    }

    fn mode_file(&self) -> PathBuf {
        self.container_dir.join(EXECMODE_FILE)
    }

    /// Current mode; the configured default when none was recorded.
    pub fn get_mode(&self) -> ModeTag {
        match fs::read_to_string(self.mode_file()) {
            Ok(data) => data.trim().parse().unwrap_or_else(|_| {
                debug!("Unrecognised execmode '{}', using default", data.trim());
                self.config.default_execution_mode
            }),
            Err(_) => self.config.default_execution_mode,
        }
    }

    /// Switches the container to `tag`.
    pub fn set_mode(&mut self, tag: &str) -> Result<()> {
        let to: ModeTag = tag.parse()?;
        let from = self.get_mode();
        self.apply(from, to, transition_plan(from, to))
    }

    /// Switches to `tag`, undoing and redoing the preparation even if the
    /// container already is in that mode.
    pub fn set_mode_forced(&mut self, tag: &str) -> Result<()> {
        let to: ModeTag = tag.parse()?;
        let from = self.get_mode();
        self.apply(from, to, forced_plan(from, to))
    }

    fn apply(&mut self, from: ModeTag, to: ModeTag, plan: Vec<TransitionAction>) -> Result<()> {
        debug!(container = %self.container_id, %from, %to, ?plan, "Mode transition");
        for action in plan {
            self.run_action(action).map_err(|e| Error::TransitionFailed {
                action: action.to_string(),
                reason: e.to_string(),
            })?;
        }

        let path = self.mode_file();
        if let Err(e) = fs::write(&path, to.as_str()) {
            error!("Failed to write execution mode to {}: {}", path.display(), e);
            return Err(Error::ModePersistFailed {
                path,
                reason: e.to_string(),
            });
        }
        if from != to {
            info!("Container {} execution mode {} -> {}", self.container_id, from, to);
        }
        Ok(())
    }

    fn run_action(&self, action: TransitionAction) -> Result<()> {
        match action {
            TransitionAction::RestoreBinaries => self.elf_patcher.restore_binaries(),
            TransitionAction::RestoreLoader => self.elf_patcher.restore_ld(),
            TransitionAction::RestoreLinks => {
                self.link_converter.links_conv(false, true, &[])?;
                fileutil::record_link_root(&self.container_dir, None)
            }
            TransitionAction::ConvertLinks => {
                self.link_converter.links_conv(true, true, &[])?;
                let root = self.container_dir.join(CONTAINER_ROOT_DIR);
                fileutil::record_link_root(&self.container_dir, Some(&root))
            }
            TransitionAction::PatchLoader => self.elf_patcher.patch_ld(),
            TransitionAction::PatchBinaries => self.elf_patcher.patch_binaries(),
            TransitionAction::SetupFileBind => FileBind::new(&self.container_dir, &self.config.tmpdir).setup(),
            TransitionAction::RestoreFileBind => {
                FileBind::new(&self.container_dir, &self.config.tmpdir).restore()
            }
            TransitionAction::PrepareSeccompBypass => self.seccomp_bypass.prepare(&self.container_dir),
        }
    }

    /// Engine for the current mode, ready to run with `opt`.
    pub fn get_engine(&self, opt: RunOptions) -> Box<dyn ExecutionEngine> {
        let mode = self.get_mode();
        let common = EngineCommon::new(
            Arc::clone(&self.config),
            Arc::clone(&self.host),
            Arc::clone(&self.repo),
            mode,
            opt,
        );
        debug!("Selected {} engine for mode {}", mode.kind(), mode);
        create_engine(common, Arc::clone(&self.seccomp_bypass))
    }
}

/// Engine for the mode recorded in `common`.
pub fn create_engine(common: EngineCommon, seccomp_bypass: Arc<dyn SeccompBypass>) -> Box<dyn ExecutionEngine> {
    match common.mode.kind() {
        EngineKind::PRoot => Box::new(PRootEngine::new(common).with_seccomp_bypass(seccomp_bypass)),
        EngineKind::Fakechroot => Box::new(FakechrootEngine::new(common)),
        EngineKind::Runc => Box::new(RuncEngine::new(common).with_seccomp_bypass(seccomp_bypass)),
        EngineKind::Singularity => Box::new(SingularityEngine::new(common)),
    }
}
