//! Hardware virtualization: control structures, EPT and per-guest state.

pub mod ept;
pub mod guest;
pub mod vm_control;
pub mod vmcs;
