//! Random-access, fixed-offset binary file I/O.
//!
//! This is the thin wrapper the rest of the crate addresses storage through. It does not know
//! anything about buckets, records, or hashing; it only knows how to create/open a file and
//! read or write bytes at a caller-supplied offset, extending the file on writes past the current
//! end. Every higher layer (`record`, `multimap`) addresses the file purely by offset.

use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::Path;

use quick_error::quick_error;

quick_error! {
    /// A `BinaryFile` I/O error.
    #[derive(Debug)]
    pub enum Error {
        /// The file has not been created or opened yet.
        NotOpen {
            display("binary file is not open")
            description("binary file is not open")
        }
        /// The underlying OS file operation failed.
        Io(err: std::io::Error) {
            from()
            display("I/O error: {}", err)
            description("I/O error")
        }
    }
}

/// A random-access file addressed by byte offset.
///
/// `BinaryFile` owns at most one open `std::fs::File`. `close` (and `Drop`) release it; every
/// other operation on a closed file fails with `Error::NotOpen`.
#[derive(Default)]
pub struct BinaryFile {
    file: Option<File>,
}

impl BinaryFile {
    /// Create a new, empty binary file at `path`, truncating any existing file.
    pub fn create_new<P: AsRef<Path>>(&mut self, path: P) -> Result<(), Error> {
        self.close();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        self.file = Some(file);
        Ok(())
    }

    /// Open an existing binary file at `path`. Fails if the file does not exist.
    pub fn open_existing<P: AsRef<Path>>(&mut self, path: P) -> Result<(), Error> {
        self.close();
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        self.file = Some(file);
        Ok(())
    }

    /// Release the underlying file handle, if any. Safe to call repeatedly.
    pub fn close(&mut self) {
        self.file = None;
    }

    /// Whether this `BinaryFile` currently has an open file.
    pub fn is_open(&self) -> bool {
        self.file.is_some()
    }

    /// Current length of the file, in bytes.
    pub fn file_length(&self) -> Result<u64, Error> {
        let file = self.file.as_ref().ok_or(Error::NotOpen)?;
        Ok(file.metadata()?.len())
    }

    /// Read exactly `buf.len()` bytes starting at `offset`. Fails if the read runs past the end
    /// of the file.
    pub fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<(), Error> {
        let file = self.file.as_ref().ok_or(Error::NotOpen)?;
        file.read_exact_at(buf, offset)?;
        Ok(())
    }

    /// Write `buf` at `offset`, extending the file if `offset + buf.len()` is past the current
    /// end.
    pub fn write_at(&self, buf: &[u8], offset: u64) -> Result<(), Error> {
        let file = self.file.as_ref().ok_or(Error::NotOpen)?;
        file.write_all_at(buf, offset)?;
        Ok(())
    }
}

impl Drop for BinaryFile {
    fn drop(&mut self) {
        self.close();
    }
}
