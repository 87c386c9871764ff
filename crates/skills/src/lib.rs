//! Built-in native skills and imported skill packages for Toolmesh.
//!
//! Native skills are compiled into the binary and always available; imported
//! skill packages are declarative JSON manifests whose skills are backed by
//! HTTP endpoints. Both kinds implement the same `Callable` contract as
//! hypervisor-discovered tools — the registry is where the three sources
//! meet.

pub mod calc;
pub mod clock;
pub mod package;

use std::sync::Arc;

use toolmesh_core::tool::Callable;

pub use calc::CalcSkill;
pub use clock::ClockSkill;
pub use package::{load_packages_from_dir, PackagedSkill, PackagedSkillSpec, SkillPackage};

/// The default set of native skills.
pub fn native_skills() -> Vec<Arc<dyn Callable>> {
    vec![Arc::new(ClockSkill), Arc::new(CalcSkill)]
}
