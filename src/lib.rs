//! # udock
//!
//! **Rootless Container Execution Engines**
//!
//! Runs a container root filesystem as an unprivileged user, without a
//! daemon and without creating kernel namespaces ourselves. The container
//! is simulated by one of four external backends, chosen per container by
//! its execution mode.
//!
//! # Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────┐
//! │                              udock                                  │
//! ├─────────────────────────────────────────────────────────────────────┤
//! │  ┌─────────────────────────────────────────────────────────────┐    │
//! │  │                 ExecutionMode (per container)               │    │
//! │  │   get_mode() │ set_mode(tag) │ transition_plan │ get_engine  │    │
//! │  └─────────────────────────────────────────────────────────────┘    │
//! │                              │                                      │
//! │  ┌───────────────────────────┼───────────────────────────────┐      │
//! │  │                  EngineCommon pipeline                    │      │
//! │  │  metadata → user → volumes → paths → executable → env     │      │
//! │  └───────────────────────────┼───────────────────────────────┘      │
//! │                              │                                      │
//! │  ┌───────────────────────────┼───────────────────────────────┐      │
//! │  │      Root preparation: FileBind │ ElfPatcher │ links      │      │
//! │  └───────────────────────────────────────────────────────────┘      │
//! ├─────────────────────────────────────────────────────────────────────┤
//! │                        Execution Engines                            │
//! │  ┌────────────┐  ┌──────────────┐  ┌────────────┐  ┌─────────────┐  │
//! │  │   PRoot    │  │  Fakechroot  │  │    runc    │  │ Singularity │  │
//! │  │   P1 P2    │  │ F1 F2 F3 F4  │  │  R1 R2 R3  │  │     S1      │  │
//! │  │  ptrace    │  │  LD_PRELOAD  │  │  userns    │  │  sandbox    │  │
//! │  └────────────┘  └──────────────┘  └────────────┘  └─────────────┘  │
//! └─────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use udock::{Config, ExecutionMode, HostInfo, LocalRepository, RunOptions};
//!
//! let config = Arc::new(Config::load(None)?);
//! let repo = Arc::new(LocalRepository::new(&config));
//! let mut mode = ExecutionMode::new(config, Arc::new(HostInfo::detect()), repo, "mycontainer")?;
//! mode.set_mode("F3")?;
//!
//! let mut opt = RunOptions::default();
//! opt.cmd = vec!["/bin/ls".into(), "/".into()];
//! let mut engine = mode.get_engine(opt);
//! let status = engine.run(mode.container_id()).await?;
//! ```
//!
//! # Security Model
//!
//! None of the engines is a security boundary. They exist to make an image
//! runnable, not to contain it. Policy is limited to not clobbering the
//! container's own system directories with implicit bindings and not
//! mapping privileged ports for unprivileged users.

pub mod auth;
pub mod cli;
pub mod config;
pub mod constants;
pub mod elfpatcher;
pub mod engine;
pub mod engines;
pub mod env;
pub mod error;
pub mod execmode;
pub mod filebind;
pub mod fileutil;
pub mod mountpoint;
pub mod oci;
pub mod options;
pub mod platform;
pub mod repository;
pub mod volume;

pub use config::Config;
pub use constants::*;
pub use engine::{EngineKind, ExecutionEngine};
pub use engines::{EngineCommon, FakechrootEngine, PRootEngine, RuncEngine, SingularityEngine};
pub use error::{Error, Result};
pub use execmode::{ExecutionMode, ModeTag, TransitionAction, transition_plan};
pub use filebind::FileBind;
pub use options::{RunOptions, UserSpec};
pub use platform::{Arch, HostInfo};
pub use repository::{LocalRepository, Repository};
pub use volume::VolumeBinding;
