//! Execution engine implementations.
//!
//! Each engine wraps one external backend and shares the preparation
//! pipeline in [`common`]. Engines are created per run through
//! [`ExecutionMode::get_engine`](crate::execmode::ExecutionMode::get_engine).

pub mod common;
pub mod fakechroot;
pub mod proot;
pub mod runc;
pub mod singularity;

pub use self::common::{EngineCommon, MountPolicy};
pub use self::fakechroot::FakechrootEngine;
pub use self::proot::{NoSeccompEnv, PRootEngine, SeccompBypass};
pub use self::runc::RuncEngine;
pub use self::singularity::SingularityEngine;
