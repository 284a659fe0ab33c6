//! Stream-optimized sparse extent reader (spec §4.E).
//!
//! Opens a sparse extent, loads its grain directory and all grain tables
//! up front (coalescing adjacent grain-table reads into single syscalls),
//! and answers positional reads and allocation queries against the
//! in-memory map without re-touching the directory.

use std::fs::File;
use std::path::Path;

use flate2::Decompress;

use crate::error::{Error, Result};
use crate::vmdk::block::BlockIo;
use crate::vmdk::gdgt::Gdgt;
use crate::vmdk::header::{self, Header};
use crate::vmdk::le::SECTOR_SIZE;

/// Grain table entry value meaning "no grain allocated".
const GRAIN_UNALLOCATED: u32 = 0;
/// Grain table entry value meaning "explicitly zeroed grain, no data on disk".
const GRAIN_ZERO: u32 = 1;

/// A reader over a stream-optimized sparse VMDK extent.
#[derive(Debug)]
pub struct SparseReader {
    file: File,
    header: Header,
    gdgt: Gdgt,
    grain_size_bytes: u64,
    /// One sector for the compressed-grain header plus room for the
    /// compressed payload to spill past it.
    read_buffer: Vec<u8>,
    /// Decompressed grain output, `grain_size` sectors.
    grain_buffer: Vec<u8>,
    decompress: Option<Decompress>,
}

impl SparseReader {
    /// Opens a sparse extent file. Rejects temporary ("kdmv") headers left
    /// behind by a writer that crashed before finalizing.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = File::open(&path).map_err(|e| Error::io(e, &path))?;

        let mut header_buf = [0u8; header::HEADER_SIZE];
        BlockIo::pread(&file, &mut header_buf, 0)?;
        let hdr = header::decode(&header_buf)?;

        let mut gdgt = Gdgt::build(&hdr)?;
        Self::load_directory(&file, &hdr, &mut gdgt)?;

        let grain_size_bytes = hdr.grain_size * SECTOR_SIZE;
        let (read_buffer, grain_buffer, decompress) = if hdr.is_compressed() {
            (
                vec![0u8; (hdr.grain_size + 1) as usize * SECTOR_SIZE as usize],
                vec![0u8; grain_size_bytes as usize],
                Some(Decompress::new(true)),
            )
        } else {
            (Vec::new(), Vec::new(), None)
        };

        Ok(Self {
            file,
            header: hdr,
            gdgt,
            grain_size_bytes,
            read_buffer,
            grain_buffer,
            decompress,
        })
    }

    fn load_directory(file: &File, hdr: &Header, gdgt: &mut Gdgt) -> Result<()> {
        let mut gd_bytes = vec![0u8; gdgt.gd_sectors as usize * SECTOR_SIZE as usize];
        BlockIo::pread(file, &mut gd_bytes, hdr.gd_offset * SECTOR_SIZE)
            .map_err(|_| Error::corruption("failed reading grain directory"))?;
        gdgt.load_gd_from_bytes(&gd_bytes);

        let gt_region_bytes = gdgt.gt_sectors as usize * SECTOR_SIZE as usize;
        let mut i = 0u32;
        while i < gdgt.gts {
            let loc = gdgt.gd_entry(i);
            if loc == 0 {
                i += 1;
                continue;
            }
            // Coalesce a run of grain tables whose on-disk locations are
            // themselves contiguous into a single positional read.
            let mut run_end = i + 1;
            while run_end < gdgt.gts {
                let expected = loc + (run_end - i) * gdgt.gt_sectors;
                if gdgt.gd_entry(run_end) == expected {
                    run_end += 1;
                } else {
                    break;
                }
            }
            let run_len = (run_end - i) as usize;
            let mut buf = vec![0u8; run_len * gt_region_bytes];
            BlockIo::pread(file, &mut buf, loc as u64 * SECTOR_SIZE)
                .map_err(|_| Error::corruption("failed reading grain table"))?;
            for k in 0..run_len as u32 {
                let start = k as usize * gt_region_bytes;
                gdgt.load_gt_from_bytes(i + k, &buf[start..start + gt_region_bytes]);
            }
            i = run_end;
        }
        Ok(())
    }

    /// Total addressable disk capacity in bytes.
    pub fn capacity(&self) -> u64 {
        self.header.capacity * SECTOR_SIZE
    }

    /// Returns the next allocated byte range at or after `offset`, or
    /// `None` once no more allocated grains remain.
    pub fn next_data(&self, offset: u64) -> Option<(u64, u64)> {
        let grain_bytes = self.grain_size_bytes;
        let mut grain_nr = offset / grain_bytes;
        let mut skip = offset % grain_bytes;
        let mut want = false;
        let mut start = 0u64;

        while grain_nr < self.gdgt.gtes {
            let empty = self.gdgt.gt_entry(grain_nr) == GRAIN_UNALLOCATED;
            if empty == want {
                if want {
                    let end = grain_nr * grain_bytes;
                    return Some((start, end - start));
                }
                start = grain_nr * grain_bytes + skip;
                want = true;
            }
            skip = 0;
            grain_nr += 1;
        }
        if want {
            let end = self.gdgt.last_grain_nr * grain_bytes + self.gdgt.last_grain_size as u64;
            return Some((start, end - start));
        }
        None
    }

    /// Reads up to `buf.len()` bytes of virtual disk content starting at
    /// `pos`, zero-filling unallocated or explicitly-zeroed grains and
    /// inflating compressed grains on demand.
    ///
    /// A request that starts at or past the extent's logical end, or whose
    /// range extends past it, is not an error: only the in-bounds prefix is
    /// serviced and the number of bytes actually written into `buf` is
    /// returned, which may be less than `buf.len()`.
    pub fn pread(&mut self, buf: &mut [u8], pos: u64) -> Result<usize> {
        let grain_bytes = self.grain_size_bytes;
        let mut grain_nr = pos / grain_bytes;
        let mut read_skip = pos % grain_bytes;
        let mut written = 0usize;

        while written < buf.len() {
            let grain_size = if grain_nr < self.gdgt.last_grain_nr {
                grain_bytes
            } else if grain_nr == self.gdgt.last_grain_nr {
                self.gdgt.last_grain_size as u64
            } else {
                0
            };
            if read_skip >= grain_size {
                break;
            }
            let read_len =
                std::cmp::min((buf.len() - written) as u64, grain_size - read_skip) as usize;

            let sect = self.gdgt.gt_entry(grain_nr);
            if sect == GRAIN_UNALLOCATED || sect == GRAIN_ZERO {
                buf[written..written + read_len].fill(0);
            } else if self.header.is_compressed() {
                self.read_compressed_grain(sect, grain_nr)?;
                buf[written..written + read_len].copy_from_slice(
                    &self.grain_buffer[read_skip as usize..read_skip as usize + read_len],
                );
            } else {
                BlockIo::pread(
                    &self.file,
                    &mut buf[written..written + read_len],
                    sect as u64 * SECTOR_SIZE + read_skip,
                )?;
            }

            written += read_len;
            grain_nr += 1;
            read_skip = 0;
        }
        Ok(written)
    }

    fn read_compressed_grain(&mut self, sect: u32, grain_nr: u64) -> Result<()> {
        BlockIo::pread(
            &self.file,
            &mut self.read_buffer[..SECTOR_SIZE as usize],
            sect as u64 * SECTOR_SIZE,
        )?;

        let (hdr_len, cmp_size) = if self.header.has_embedded_lba() {
            let lba = crate::vmdk::le::read_u64_le(&self.read_buffer, 0);
            if lba != grain_nr * self.header.grain_size {
                return Err(Error::corruption(format!(
                    "embedded LBA mismatch: expected grain {grain_nr}, header says {lba}"
                )));
            }
            (12usize, crate::vmdk::le::read_u32_le(&self.read_buffer, 8))
        } else {
            (4usize, crate::vmdk::le::read_u32_le(&self.read_buffer, 0))
        };

        let cmp_size = cmp_size as usize;
        if cmp_size > self.read_buffer.len() - hdr_len {
            return Err(Error::corruption("compressed grain size exceeds buffer"));
        }
        if hdr_len + cmp_size > SECTOR_SIZE as usize {
            let remaining = crate::vmdk::le::round_up(
                (hdr_len + cmp_size - SECTOR_SIZE as usize) as u64,
                SECTOR_SIZE,
            ) as usize;
            let spill_end = SECTOR_SIZE as usize + remaining;
            BlockIo::pread(
                &self.file,
                &mut self.read_buffer[SECTOR_SIZE as usize..spill_end],
                (sect as u64 + 1) * SECTOR_SIZE,
            )?;
        }

        let decompress = self
            .decompress
            .as_mut()
            .expect("compressed extent has a decompressor");
        decompress.reset(true);
        let before_out = decompress.total_out();
        decompress
            .decompress(
                &self.read_buffer[hdr_len..hdr_len + cmp_size],
                &mut self.grain_buffer,
                flate2::FlushDecompress::Finish,
            )
            .map_err(|e| Error::corruption(format!("inflate failed: {e}")))?;
        let produced = decompress.total_out() - before_out;

        let grain_size = if grain_nr < self.gdgt.last_grain_nr {
            self.grain_size_bytes
        } else {
            self.gdgt.last_grain_size as u64
        };
        if produced < grain_size {
            return Err(Error::corruption(
                "inflated grain shorter than declared grain length",
            ));
        }
        Ok(())
    }

    /// Releases the underlying file handle.
    pub fn close(mut self) -> Result<()> {
        BlockIo::close(&mut self.file)
    }
}

/// Reads just the magic number to decide whether `path` looks like a
/// sparse VMDK extent, without committing to a full open.
pub fn is_sparse_vmdk(path: &Path) -> Result<bool> {
    let file = File::open(path).map_err(|e| Error::io(e, path))?;
    let mut magic = [0u8; 4];
    if BlockIo::pread(&file, &mut magic, 0).is_err() {
        return Ok(false);
    }
    Ok(header::probe_magic(&magic) == Some(header::MAGIC))
}
