//! The abyss of kernel that operates hardwares.
//!
//! This crate holds the machine-facing vocabulary of the kernel: addresses,
//! register files, flag words, and the two capabilities the execution core
//! calls but never implements itself ([`PhysicalMemory`] and
//! [`HardwareContext`]). Everything that needs an instruction the compiler
//! cannot emit lives behind those traits.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod addressing;
pub mod interrupt;
#[cfg(any(test, feature = "mock"))]
pub mod mock;
pub mod platform;
pub mod x86_64;

pub use platform::{CpuidResult, HardwareContext, PhysicalMemory, VmxFailure};

/// Maximum number of CPU this kernel can support.
pub const MAX_CPU: usize = 8;
