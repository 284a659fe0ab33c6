//! Abstract block I/O capability (spec §6).
//!
//! Mirrors the small positional-I/O vtable shared by every backend: callers
//! never care whether bytes come from a sparse extent, a flat file, or
//! something else, only that they can ask for the size and do positional
//! reads and writes against it.

use std::fs::File;
use std::os::unix::fs::FileExt;

use crate::error::{Error, Result};

/// Positional block I/O, implemented by every disk backend.
pub trait BlockIo {
    /// Total addressable size in bytes.
    fn get_size(&self) -> Result<u64>;

    /// Reads exactly `buf.len()` bytes starting at `offset`.
    fn pread(&self, buf: &mut [u8], offset: u64) -> Result<()>;

    /// Writes exactly `buf.len()` bytes starting at `offset`.
    fn pwrite(&self, buf: &[u8], offset: u64) -> Result<()>;

    /// Flushes and releases any resources held by the backend.
    fn close(&mut self) -> Result<()>;
}

impl BlockIo for File {
    fn get_size(&self) -> Result<u64> {
        Ok(self.metadata().map_err(Error::io_simple)?.len())
    }

    fn pread(&self, buf: &mut [u8], offset: u64) -> Result<()> {
        self.read_exact_at(buf, offset).map_err(|e| {
            if e.kind() == std::io::ErrorKind::UnexpectedEof {
                Error::corruption("short read: end of file reached before buffer was filled")
            } else {
                Error::io_simple(e)
            }
        })
    }

    fn pwrite(&self, buf: &[u8], offset: u64) -> Result<()> {
        self.write_all_at(buf, offset).map_err(Error::io_simple)
    }

    fn close(&mut self) -> Result<()> {
        self.sync_all().map_err(Error::io_simple)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_pread_pwrite_roundtrip() {
        let tmp = NamedTempFile::new().unwrap();
        let file = tmp.reopen().unwrap();
        file.pwrite(b"hello world", 10).unwrap();
        let mut buf = [0u8; 5];
        file.pread(&mut buf, 16).unwrap();
        assert_eq!(&buf, b"world");
    }

    #[test]
    fn test_get_size() {
        let mut tmp = NamedTempFile::new().unwrap();
        tmp.write_all(b"0123456789").unwrap();
        tmp.flush().unwrap();
        let file = tmp.reopen().unwrap();
        assert_eq!(BlockIo::get_size(&file).unwrap(), 10);
    }

    #[test]
    fn test_pread_past_eof_is_corruption() {
        let tmp = NamedTempFile::new().unwrap();
        let file = tmp.reopen().unwrap();
        let mut buf = [0u8; 16];
        let err = file.pread(&mut buf, 0).unwrap_err();
        assert!(matches!(err, Error::Corruption { .. }));
    }
}
