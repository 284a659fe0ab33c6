//! Allocated-range copy driver (spec §4.H).
//!
//! Streams only the allocated portions of a source disk into a freshly
//! created stream-optimized destination, in fixed-size chunks, skipping
//! holes entirely rather than materializing and compressing runs of
//! zeros.

use std::path::Path;

use crate::error::{Error, Result};
use crate::vmdk::descriptor::DescriptorConfig;
use crate::vmdk::flat::FlatBackend;
use crate::vmdk::le::{ceil_div, SECTOR_SIZE};
use crate::vmdk::sparse::SparseReader;
use crate::vmdk::stream::StreamWriter;

/// Size of each chunk moved per `pread`/`pwrite` pair.
const COPY_CHUNK_SIZE: usize = 65536;

/// A disk backend the copy driver can read allocated ranges from.
pub trait CopySource {
    /// Total addressable size in bytes.
    fn capacity(&self) -> u64;
    /// Reads `buf.len()` bytes of virtual disk content starting at `offset`.
    fn pread(&mut self, buf: &mut [u8], offset: u64) -> Result<()>;
    /// Returns the next allocated byte range at or after `offset`.
    fn next_data(&self, offset: u64) -> Result<Option<(u64, u64)>>;
}

impl CopySource for SparseReader {
    fn capacity(&self) -> u64 {
        SparseReader::capacity(self)
    }

    fn pread(&mut self, buf: &mut [u8], offset: u64) -> Result<()> {
        let want = buf.len();
        let got = SparseReader::pread(self, buf, offset)?;
        if got != want {
            return Err(Error::corruption(format!(
                "short read from source at offset {offset}: expected {want} bytes, got {got}"
            )));
        }
        Ok(())
    }

    fn next_data(&self, offset: u64) -> Result<Option<(u64, u64)>> {
        Ok(SparseReader::next_data(self, offset))
    }
}

impl CopySource for FlatBackend {
    fn capacity(&self) -> u64 {
        FlatBackend::capacity(self)
    }

    fn pread(&mut self, buf: &mut [u8], offset: u64) -> Result<()> {
        crate::vmdk::block::BlockIo::pread(self, buf, offset)
    }

    fn next_data(&self, offset: u64) -> Result<Option<(u64, u64)>> {
        FlatBackend::next_data(self, offset)
    }
}

/// Streams every allocated range of `src` into `dst`, in
/// [`COPY_CHUNK_SIZE`]-byte pieces.
pub fn copy_data<S: CopySource>(dst: &mut StreamWriter, src: &mut S) -> Result<()> {
    let mut buf = vec![0u8; COPY_CHUNK_SIZE];
    let mut cursor = 0u64;

    while let Some((pos, len)) = src.next_data(cursor)? {
        let mut offset = pos;
        let mut remaining = len;
        while remaining > 0 {
            let chunk_len = std::cmp::min(remaining, COPY_CHUNK_SIZE as u64) as usize;
            src.pread(&mut buf[..chunk_len], offset)?;
            dst.pwrite(&buf[..chunk_len], offset)?;
            offset += chunk_len as u64;
            remaining -= chunk_len as u64;
        }
        cursor = pos + len;
    }
    Ok(())
}

/// Copies `src` into a new stream-optimized extent at `dst_path`,
/// aborting the destination (leaving no valid header behind) if the copy
/// fails partway through.
pub fn copy_disk<S: CopySource>(
    src: &mut S,
    dst_path: impl AsRef<Path>,
    config: DescriptorConfig,
) -> Result<()> {
    let capacity_sectors = ceil_div(src.capacity(), SECTOR_SIZE);
    let mut writer = StreamWriter::create(dst_path, capacity_sectors, config)?;
    match copy_data(&mut writer, src) {
        Ok(()) => writer.close(),
        Err(e) => {
            let _ = writer.abort();
            Err(e)
        }
    }
}
