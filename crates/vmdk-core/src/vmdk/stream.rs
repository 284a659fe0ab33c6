//! Stream-optimized sparse extent writer (spec §4.F).
//!
//! Grains are written exactly once, in non-decreasing grain order, through
//! a single rolling grain-sized buffer: `pwrite` accumulates bytes into the
//! buffer for the grain currently "open", and a grain is compressed and
//! appended to the file only once a later write moves past it. This keeps
//! the writer append-only and lets the whole grain directory/table region
//! be emitted as one sequential write at `close` time.

use std::fs::{File, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use flate2::{Compress, Compression, FlushCompress};
use rand::{Rng, SeedableRng};

use crate::error::{Error, Result};
use crate::vmdk::block::BlockIo;
use crate::vmdk::descriptor::{make_descriptor, DescriptorConfig};
use crate::vmdk::gdgt::Gdgt;
use crate::vmdk::header::{self, compress_algorithm, flags, Header};
use crate::vmdk::le::{round_up, SECTOR_SIZE};

const DEFAULT_GRAIN_SIZE_SECTORS: u64 = 128;
const DEFAULT_NUM_GTES_PER_GT: u32 = 512;
const DESCRIPTOR_SIZE_SECTORS: u64 = 20;
const GRAIN_MARKER_EOS: u32 = 0;

fn deflate_bound(len: u64) -> u64 {
    // zlib's deflateBound formula plus the 2-byte zlib header and 4-byte
    // Adler-32 trailer this crate always emits (Compress::new(_, true)).
    len + (len >> 12) + (len >> 14) + (len >> 25) + 13 + 6
}

fn is_zeroed(data: &[u8]) -> bool {
    data.iter().all(|&b| b == 0)
}

/// A writer that creates a new stream-optimized sparse VMDK extent.
pub struct StreamWriter {
    file: File,
    path: PathBuf,
    header: Header,
    gdgt: Gdgt,
    config: DescriptorConfig,
    cur_sector: u64,
    grain_buffer: Vec<u8>,
    grain_buffer_nr: Option<u64>,
    grain_valid_start: u32,
    grain_valid_end: u32,
    compress: Compress,
    deflate_buffer: Vec<u8>,
}

impl StreamWriter {
    /// Creates a new stream-optimized extent at `path` sized for
    /// `capacity_sectors` sectors of virtual disk content.
    pub fn create(
        path: impl AsRef<Path>,
        capacity_sectors: u64,
        config: DescriptorConfig,
    ) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        let mut header = Header {
            version: header::SPARSE_VERSION_INCOMPAT_FLAGS,
            flags: flags::VALID_NEWLINE_DETECTOR | flags::COMPRESSED | flags::EMBEDDED_LBA,
            capacity: capacity_sectors,
            grain_size: DEFAULT_GRAIN_SIZE_SECTORS,
            descriptor_offset: 0,
            descriptor_size: 0,
            num_gtes_per_gt: DEFAULT_NUM_GTES_PER_GT,
            rgd_offset: 0,
            gd_offset: 0,
            over_head: 1,
            unclean_shutdown: 0,
            compress_algorithm: compress_algorithm::DEFLATE,
        };

        let mut gdgt = Gdgt::build(&header)?;

        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)
            .map_err(|e| Error::io(e, &path))?;

        header.descriptor_offset = header.over_head;
        header.descriptor_size = DESCRIPTOR_SIZE_SECTORS;
        header.over_head += header.descriptor_size;
        header.gd_offset = header.over_head;
        header.over_head += gdgt.gd_sectors as u64;
        header.over_head = gdgt.prefill_gd(header.over_head);
        let cur_sector = header.over_head;

        file.set_len(cur_sector * SECTOR_SIZE)
            .map_err(|e| Error::io(e, &path))?;
        file.seek(SeekFrom::Start(cur_sector * SECTOR_SIZE))
            .map_err(|e| Error::io(e, &path))?;

        let grain_size_bytes = header.grain_size * SECTOR_SIZE;
        let compress = Compress::new(Compression::best(), true);
        let deflate_cap = round_up(
            deflate_bound(grain_size_bytes) + 12,
            SECTOR_SIZE,
        ) as usize;

        Ok(Self {
            file,
            path,
            header,
            gdgt,
            config,
            cur_sector,
            grain_buffer: vec![0u8; grain_size_bytes as usize],
            grain_buffer_nr: None,
            grain_valid_start: 0,
            grain_valid_end: 0,
            compress,
            deflate_buffer: vec![0u8; deflate_cap],
        })
    }

    fn grain_len_bytes(&self, grain_nr: u64) -> u64 {
        if grain_nr < self.gdgt.last_grain_nr {
            self.header.grain_size * SECTOR_SIZE
        } else if grain_nr == self.gdgt.last_grain_nr {
            self.gdgt.last_grain_size as u64
        } else {
            0
        }
    }

    /// Zero-fills the parts of the current grain buffer that a partial
    /// write left untouched, so a later flush sees a fully-defined grain.
    fn fill_grain(&mut self) -> Result<()> {
        let grain_nr = match self.grain_buffer_nr {
            Some(nr) => nr,
            None => return Ok(()),
        };
        let len_bytes = self.grain_len_bytes(grain_nr);
        if self.grain_valid_start == 0 && self.grain_valid_end as u64 >= len_bytes {
            return Ok(());
        }
        if self.gdgt.gt_entry(grain_nr) != 0 {
            return Err(Error::unsupported(
                "read-modify-write of an already-written grain is not supported",
            ));
        }
        if self.grain_valid_start != 0 {
            self.grain_buffer[..self.grain_valid_start as usize].fill(0);
            self.grain_valid_start = 0;
        }
        if (self.grain_valid_end as u64) < len_bytes {
            self.grain_buffer[self.grain_valid_end as usize..len_bytes as usize].fill(0);
            self.grain_valid_end = len_bytes as u32;
        }
        Ok(())
    }

    /// Compresses and appends the current grain buffer to the file if it
    /// holds any non-zero content, recording its location in the grain
    /// table; an all-zero grain is left unallocated (reads back as zero).
    fn flush_grain(&mut self) -> Result<()> {
        let grain_nr = match self.grain_buffer_nr {
            Some(nr) => nr,
            None => return Ok(()),
        };
        if self.grain_valid_end == 0 {
            return Ok(());
        }
        self.fill_grain()?;

        if self.gdgt.gt_entry(grain_nr) != 0 {
            return Err(Error::unsupported("cannot update already written grain"));
        }

        let valid_len = self.grain_valid_end as usize;
        if is_zeroed(&self.grain_buffer[..valid_len]) {
            return Ok(());
        }

        self.gdgt.set_gt_entry(grain_nr, self.cur_sector as u32);

        self.compress.reset();
        self.deflate_buffer[..12].fill(0);
        crate::vmdk::le::write_u64_le(&mut self.deflate_buffer, 0, grain_nr * self.header.grain_size);

        let before_out = self.compress.total_out();
        self.compress
            .compress(
                &self.grain_buffer[..valid_len],
                &mut self.deflate_buffer[12..],
                FlushCompress::Finish,
            )
            .map_err(|e| Error::corruption(format!("deflate failed: {e}")))?;
        let produced = (self.compress.total_out() - before_out) as usize;
        crate::vmdk::le::write_u32_le(&mut self.deflate_buffer, 8, produced as u32);

        let mut data_len = 12 + produced;
        let rem = data_len % SECTOR_SIZE as usize;
        if rem != 0 {
            let pad = SECTOR_SIZE as usize - rem;
            self.deflate_buffer[data_len..data_len + pad].fill(0);
            data_len += pad;
        }

        self.file
            .write_all(&self.deflate_buffer[..data_len])
            .map_err(|e| Error::io(e, &self.path))?;
        self.cur_sector += data_len as u64 / SECTOR_SIZE;
        Ok(())
    }

    fn prepare_grain(&mut self, grain_nr: u64) -> Result<()> {
        if self.grain_buffer_nr != Some(grain_nr) {
            self.flush_grain()?;
            self.grain_buffer_nr = Some(grain_nr);
            self.grain_valid_start = 0;
            self.grain_valid_end = 0;
        }
        Ok(())
    }

    /// Writes `buf` at virtual disk byte offset `pos`. Writes must be
    /// issued at non-decreasing offsets; this holds for a single
    /// sequential pass over the disk and for the grain-aligned ranges a
    /// copy driver issues.
    pub fn pwrite(&mut self, buf: &[u8], pos: u64) -> Result<()> {
        let grain_bytes = self.header.grain_size * SECTOR_SIZE;
        let mut grain_nr = pos / grain_bytes;
        let mut update_start = (pos % grain_bytes) as u32;
        let mut written = 0usize;

        while written < buf.len() {
            self.prepare_grain(grain_nr)?;

            let mut update_len = grain_bytes as u32 - update_start;
            let remaining = (buf.len() - written) as u64;
            if remaining < update_len as u64 {
                update_len = remaining as u32;
            }
            let update_end = update_start + update_len;

            if self.grain_valid_end != 0
                && (update_end < self.grain_valid_start || update_start > self.grain_valid_end)
            {
                self.fill_grain()?;
            }

            let dst = &mut self.grain_buffer[update_start as usize..update_end as usize];
            dst.copy_from_slice(&buf[written..written + update_len as usize]);

            if update_start < self.grain_valid_start || self.grain_valid_end == 0 {
                self.grain_valid_start = update_start;
            }
            if update_end > self.grain_valid_end {
                self.grain_valid_end = update_end;
            }

            written += update_len as usize;
            grain_nr += 1;
            update_start = 0;
        }
        Ok(())
    }

    fn write_eos(&mut self) -> Result<()> {
        let mut buf = [0u8; SECTOR_SIZE as usize];
        // lba field carries the marker's declared length (0 for EOS).
        crate::vmdk::le::write_u64_le(&mut buf, 0, 0);
        crate::vmdk::le::write_u32_le(&mut buf, 12, GRAIN_MARKER_EOS);
        self.file.write_all(&buf).map_err(|e| Error::io(e, &self.path))
    }

    /// Flushes the last open grain, writes the grain directory/tables,
    /// the descriptor, and finalizes the header with the crash-consistent
    /// two-phase magic write (spec §5).
    pub fn close(mut self) -> Result<()> {
        self.flush_grain()?;
        self.write_eos()?;

        self.file
            .seek(SeekFrom::Start(self.header.gd_offset * SECTOR_SIZE))
            .map_err(|e| Error::io(e, &self.path))?;
        let gdgt_bytes = self.gdgt.to_bytes();
        self.file
            .write_all(&gdgt_bytes)
            .map_err(|e| Error::io(e, &self.path))?;

        let cid = match self.config.cid_override {
            Some(cid) => cid,
            None => random_cid(self.config.rng_seed),
        };
        let descriptor = make_descriptor(&self.path, self.header.capacity, cid, &self.config);
        BlockIo::pwrite(
            &self.file,
            descriptor.as_bytes(),
            self.header.descriptor_offset * SECTOR_SIZE,
        )?;

        let temp_header = header::encode(&self.header, true);
        BlockIo::pwrite(&self.file, &temp_header, 0)?;
        self.file.sync_all().map_err(|e| Error::io(e, &self.path))?;

        let real_header = header::encode(&self.header, false);
        BlockIo::pwrite(&self.file, &real_header, 0)?;
        self.file.sync_all().map_err(|e| Error::io(e, &self.path))?;

        Ok(())
    }

    /// Discards the in-progress extent without finalizing its header,
    /// so any later open reliably fails with an invalid-format error.
    pub fn abort(self) -> Result<()> {
        drop(self.file);
        Ok(())
    }
}

fn random_cid(seed: Option<u64>) -> u32 {
    let mut rng = match seed {
        Some(seed) => rand::rngs::StdRng::seed_from_u64(seed),
        None => rand::rngs::StdRng::from_entropy(),
    };
    loop {
        let cid: u32 = rng.gen();
        if cid != 0xFFFF_FFFF && cid != 0xFFFF_FFFE {
            return cid;
        }
    }
}
