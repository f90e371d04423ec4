//! What the loader needs from the file system.

use crate::LoaderError;

/// An open file with a cursor.
pub trait File {
    /// Move the cursor to `offset` bytes from the start.
    fn seek(&mut self, offset: u64) -> Result<(), LoaderError>;

    /// Read at the cursor. Returns 0 at end of file.
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, LoaderError>;

    /// Fill `buf` completely or fail with [`LoaderError::ShortRead`].
    fn read_exact(&mut self, buf: &mut [u8]) -> Result<(), LoaderError> {
        let mut got = 0;
        while got < buf.len() {
            match self.read(&mut buf[got..])? {
                0 => {
                    return Err(LoaderError::ShortRead {
                        expected: buf.len(),
                        got,
                    })
                }
                n => got += n,
            }
        }
        Ok(())
    }
}

pub trait FileSystem {
    type File: File;

    /// Open `path` for reading.
    fn open(&self, path: &str) -> Result<Self::File, LoaderError>;

    /// Copy the file at `from` to a new file at `to`.
    fn copy(&self, from: &str, to: &str) -> Result<(), LoaderError>;
}
