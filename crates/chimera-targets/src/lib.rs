//! Chimera synthesis targets
//!
//! This crate handles:
//! - The programmable switch ASIC target and its match-unit constraints
//! - Software switch and packet core targets over the generic module set
//! - The controller target and the speculative hand-off rewrite

pub mod asic;
mod common;
pub mod controller;
pub mod software;

pub use asic::{switch_asic_target, AsicConfig, AsicIfElse, AsicIndexRefresh, Unimplemented};
pub use controller::{controller_target, HandOff};
pub use software::software_target;

use chimera_synth::{Target, TargetKind};

/// The full default target set: three entry dataplanes plus the controller.
pub fn default_targets() -> Vec<Target> {
    vec![
        switch_asic_target(AsicConfig::default()),
        software_target(TargetKind::SoftwareSwitch),
        software_target(TargetKind::PacketCore),
        controller_target(),
    ]
}
