use core::fmt;
use kenv::error::KernelError;

/// Failure while bootstrapping a guest.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoaderError {
    /// A kernel service or the file system refused.
    Kernel(KernelError),
    /// A file ended before the bytes the image promised.
    ShortRead { expected: usize, got: usize },
}

impl From<KernelError> for LoaderError {
    fn from(e: KernelError) -> Self {
        LoaderError::Kernel(e)
    }
}

impl LoaderError {
    /// Errno-style code, as the kernel reports it.
    pub fn code(self) -> i64 {
        match self {
            LoaderError::Kernel(e) => e.code(),
            LoaderError::ShortRead { .. } => KernelError::Io.code(),
        }
    }
}

impl fmt::Display for LoaderError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LoaderError::Kernel(e) => write!(f, "{}", e),
            LoaderError::ShortRead { expected, got } => {
                write!(f, "short read: {} of {} bytes", got, expected)
            }
        }
    }
}
