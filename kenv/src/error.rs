//! Error types shared by the execution core.
use crate::vmx::vmcs::{BasicExitReason, InstructionError};
use core::fmt;

/// Failure of a lifecycle, loader or syscall operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KernelError {
    /// Every environment slot is in use.
    NoFreeEnv,
    /// A physical frame could not be allocated.
    NoMem,
    /// Stale or unknown identity, or the caller may not touch the target.
    BadEnv,
    /// The image is not a loadable executable.
    NotExec,
    /// Malformed argument.
    Inval,
    /// Short or failed read/write of backing storage.
    Io,
    /// No such file.
    BadPath,
}

impl KernelError {
    /// Errno-style code handed back through guest and user registers.
    pub const fn code(self) -> i64 {
        match self {
            Self::BadEnv => -2,
            Self::Inval => -3,
            Self::NoMem => -4,
            Self::NoFreeEnv => -5,
            Self::BadPath => -11,
            Self::NotExec => -14,
            Self::Io => -15,
        }
    }
}

impl fmt::Display for KernelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            Self::NoFreeEnv => "out of environments",
            Self::NoMem => "out of memory",
            Self::BadEnv => "bad environment",
            Self::NotExec => "file is not a valid executable",
            Self::Inval => "invalid parameter",
            Self::Io => "i/o error",
            Self::BadPath => "file or block not found",
        };
        f.write_str(msg)
    }
}

/// Possible errors of the paging structures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MappingError {
    /// Unaligned address
    Unaligned,
    /// Not exist
    NotExist,
    /// Has a duplicated mapping.
    Duplicated,
    /// An intermediate table could not be allocated.
    NoMem,
}

impl fmt::Display for MappingError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

impl From<MappingError> for KernelError {
    fn from(e: MappingError) -> Self {
        match e {
            MappingError::NoMem => KernelError::NoMem,
            _ => KernelError::Inval,
        }
    }
}

/// Possible errors while driving a guest.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmError {
    /// A VMX instruction failed.
    VmxOperationError(InstructionError),
    /// No handler emulates this exit.
    HandleVmexitFailed(BasicExitReason),
    /// The exit reason is not one the processor documents.
    UnknownExitReason(u16),
    /// The trapped instruction could not be decoded.
    FailedToDecodeInstruction,
    /// A kernel service called by a handler failed.
    Kernel(KernelError),
}

impl From<KernelError> for VmError {
    fn from(e: KernelError) -> Self {
        VmError::Kernel(e)
    }
}

impl From<MappingError> for VmError {
    fn from(e: MappingError) -> Self {
        VmError::Kernel(e.into())
    }
}

impl fmt::Display for VmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::VmxOperationError(e) => write!(f, "vmx instruction failed: {:?}", e),
            Self::HandleVmexitFailed(r) => write!(f, "unhandled vmexit: {:?}", r),
            Self::UnknownExitReason(r) => write!(f, "unknown exit reason {:#x}", r),
            Self::FailedToDecodeInstruction => f.write_str("failed to decode instruction"),
            Self::Kernel(e) => write!(f, "{}", e),
        }
    }
}
