//! Execution engine trait.
//!
//! Every backend turns a prepared container into one running process:
//!
//! ```text
//! run(id) → EngineCommon::run_init(id) → backend setup → spawn → wait → exit code
//! ```
//!
//! # Implementations
//!
//! - `PRootEngine`: ptrace based chroot emulation (P1, P2)
//! - `FakechrootEngine`: `LD_PRELOAD` path rewriting (F1-F4)
//! - `RuncEngine`: rootless OCI runtime (R1-R3)
//! - `SingularityEngine`: external SIF runtime (S1)

use std::fmt;

use async_trait::async_trait;

use crate::engines::common::EngineCommon;
use crate::error::Result;
use crate::execmode::ModeTag;

/// Backend family of an execution mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EngineKind {
    PRoot,
    Fakechroot,
    Runc,
    Singularity,
}

impl EngineKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PRoot => "proot",
            Self::Fakechroot => "fakechroot",
            Self::Runc => "runc",
            Self::Singularity => "singularity",
        }
    }
}

impl fmt::Display for EngineKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A container execution backend.
#[async_trait]
pub trait ExecutionEngine: Send {
    /// Backend name.
    fn name(&self) -> &str {
        self.kind().as_str()
    }

    /// Backend family.
    fn kind(&self) -> EngineKind {
        self.common().mode.kind()
    }

    /// Mode the engine was created for.
    fn mode(&self) -> ModeTag {
        self.common().mode
    }

    /// Shared pipeline state.
    fn common(&self) -> &EngineCommon;

    /// Shared pipeline state, for setting run options before `run`.
    fn common_mut(&mut self) -> &mut EngineCommon;

    /// Prepares and runs the container.
    ///
    /// Validation failures return an error before anything is spawned. Once
    /// the backend is spawned its exit code is returned unchanged, a signal
    /// death as `128 + signal`.
    async fn run(&mut self, container_id: &str) -> Result<i32>;
}
