//! Flat (raw) disk backend (spec §4.G).
//!
//! Wraps a plain file and answers `next_data` queries using the host's
//! sparse-file primitives, so a copy driven against a flat source skips
//! holes instead of materializing zero runs.

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};
use crate::vmdk::block::BlockIo;

/// A flat (non-sparse-extent) disk image backed by a single file.
pub struct FlatBackend {
    file: File,
    size: u64,
    path: PathBuf,
}

impl FlatBackend {
    /// Opens an existing flat disk image.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = File::options()
            .read(true)
            .write(true)
            .open(&path)
            .map_err(|e| Error::io(e, &path))?;
        let size = BlockIo::get_size(&file)?;
        Ok(Self { file, size, path })
    }

    /// Creates a new flat disk image of `size` bytes, truncating any existing file.
    pub fn create(path: impl AsRef<Path>, size: u64) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)
            .map_err(|e| Error::io(e, &path))?;
        file.set_len(size).map_err(|e| Error::io(e, &path))?;
        Ok(Self { file, size, path })
    }

    /// Total size of the backing file in bytes.
    pub fn capacity(&self) -> u64 {
        self.size
    }

    /// Returns the next allocated byte range at or after `offset`, or
    /// `None` if there is no more allocated data before the end of the
    /// file (spec's `next_data` contract).
    #[cfg(unix)]
    pub fn next_data(&self, offset: u64) -> Result<Option<(u64, u64)>> {
        use std::os::unix::io::AsRawFd;

        if offset >= self.size {
            return Ok(None);
        }
        let fd = self.file.as_raw_fd();

        let data_start = unsafe { libc::lseek(fd, offset as i64, libc::SEEK_DATA) };
        if data_start < 0 {
            let err = std::io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::ENXIO) {
                return Ok(None);
            }
            return Err(Error::io(err, &self.path));
        }
        let data_start = data_start as u64;
        if data_start >= self.size {
            return Ok(None);
        }

        let hole_start = unsafe { libc::lseek(fd, data_start as i64, libc::SEEK_HOLE) };
        let end = if hole_start < 0 {
            let err = std::io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::ENXIO) {
                self.size
            } else {
                return Err(Error::io(err, &self.path));
            }
        } else {
            (hole_start as u64).min(self.size)
        };

        Ok(Some((data_start, end - data_start)))
    }

    /// Fallback for platforms without `SEEK_DATA`/`SEEK_HOLE`: treats the
    /// whole remaining file as one allocated range.
    #[cfg(not(unix))]
    pub fn next_data(&self, offset: u64) -> Result<Option<(u64, u64)>> {
        if offset >= self.size {
            Ok(None)
        } else {
            Ok(Some((offset, self.size - offset)))
        }
    }
}

impl BlockIo for FlatBackend {
    fn get_size(&self) -> Result<u64> {
        Ok(self.size)
    }

    fn pread(&self, buf: &mut [u8], offset: u64) -> Result<()> {
        self.file.pread(buf, offset)
    }

    fn pwrite(&self, buf: &[u8], offset: u64) -> Result<()> {
        self.file.pwrite(buf, offset)
    }

    fn close(&mut self) -> Result<()> {
        BlockIo::close(&mut self.file)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_create_then_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("flat.img");
        {
            let backend = FlatBackend::create(&path, 4096).unwrap();
            assert_eq!(backend.capacity(), 4096);
        }
        let backend = FlatBackend::open(&path).unwrap();
        assert_eq!(backend.capacity(), 4096);
    }

    #[test]
    fn test_pwrite_then_pread() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("flat.img");
        let backend = FlatBackend::create(&path, 4096).unwrap();
        backend.pwrite(b"payload", 100).unwrap();
        let mut buf = [0u8; 7];
        backend.pread(&mut buf, 100).unwrap();
        assert_eq!(&buf, b"payload");
    }

    #[cfg(unix)]
    #[test]
    fn test_next_data_skips_holes() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("sparse.img");
        let backend = FlatBackend::create(&path, 1 << 20).unwrap();
        // Write into the middle of the file; everything else stays a hole
        // on filesystems that support sparse files.
        backend.pwrite(b"data", 1 << 18).unwrap();

        let mut cursor = 0u64;
        let mut ranges = Vec::new();
        while let Some((start, len)) = backend.next_data(cursor).unwrap() {
            ranges.push((start, len));
            cursor = start + len;
        }
        // At minimum the written region must be reported somewhere, whether
        // the filesystem actually punches holes or reports the file as one
        // fully-allocated range.
        let covers_write = ranges
            .iter()
            .any(|&(start, len)| start <= (1 << 18) && (1 << 18) + 4 <= start + len);
        assert!(covers_write);
    }

    #[test]
    fn test_next_data_past_end_returns_none() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("flat.img");
        let backend = FlatBackend::create(&path, 100).unwrap();
        assert_eq!(backend.next_data(100).unwrap(), None);
        assert_eq!(backend.next_data(200).unwrap(), None);
    }
}
