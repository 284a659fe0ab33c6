//! Grain directory / grain table model (spec §3, §4.D).
//!
//! A single contiguous zero-initialized allocation backs both the grain
//! directory (GD) and every grain table (GT): the GD occupies the first
//! `gd_sectors` sectors, then each GT occupies `gt_sectors` sectors in
//! grain-directory order. This lets the writer emit the whole region with
//! one sequential write at finalize time, and lets the reader treat the GT
//! entries as a flat bit-vector for `next_data` (spec §9 "Allocation
//! pattern for GDGT").

use crate::error::{Error, Result};
use crate::vmdk::header::Header;
use crate::vmdk::le::{ceil_div, SECTOR_SIZE};

/// Number of `u32` grain-table/directory entries that fit in one sector.
const ENTRIES_PER_SECTOR: u64 = SECTOR_SIZE / 4;

fn is_pow2(value: u64) -> bool {
    value != 0 && (value & (value - 1)) == 0
}

/// In-memory grain directory and grain tables for one sparse extent.
#[derive(Debug)]
pub struct Gdgt {
    /// Total number of grain-table entries across all grains, including any
    /// partial final grain.
    pub gtes: u64,
    /// Number of grain tables.
    pub gts: u32,
    /// Sectors occupied by the grain directory.
    pub gd_sectors: u32,
    /// Sectors occupied by a single grain table.
    pub gt_sectors: u32,
    /// Grain-table entries per grain table (from the header).
    pub num_gtes_per_gt: u32,
    /// Grain number of the (possibly partial) last grain.
    pub last_grain_nr: u64,
    /// Byte length of the last grain if `capacity` isn't grain-aligned (0 otherwise).
    pub last_grain_size: u32,
    buf: Vec<u32>,
    gt_base: usize,
}

impl Gdgt {
    /// Computes geometry and allocates the backing buffer for `header`.
    pub fn build(header: &Header) -> Result<Self> {
        if header.grain_size < 1 || header.grain_size > 128 || !is_pow2(header.grain_size) {
            return Err(Error::unsupported(
                "grain size must be a power of two in [1, 128] sectors",
            ));
        }
        if header.num_gtes_per_gt < 128 || !is_pow2(header.num_gtes_per_gt as u64) {
            return Err(Error::unsupported(
                "numGTEsPerGT must be a power of two and at least 128",
            ));
        }

        let last_grain_nr = header.capacity / header.grain_size;
        let last_grain_size = ((header.capacity % header.grain_size) * SECTOR_SIZE) as u32;
        let gtes = last_grain_nr + if last_grain_size != 0 { 1 } else { 0 };
        let gts = ceil_div(gtes, header.num_gtes_per_gt as u64) as u32;
        let gd_sectors = ceil_div(gts as u64 * 4, SECTOR_SIZE) as u32;
        let gt_sectors = ceil_div(header.num_gtes_per_gt as u64 * 4, SECTOR_SIZE) as u32;

        let gd_capacity = gd_sectors as usize * ENTRIES_PER_SECTOR as usize;
        let gt_stride = gt_sectors as usize * ENTRIES_PER_SECTOR as usize;
        let total = gd_capacity + gt_stride * gts as usize;

        Ok(Self {
            gtes,
            gts,
            gd_sectors,
            gt_sectors,
            num_gtes_per_gt: header.num_gtes_per_gt,
            last_grain_nr,
            last_grain_size,
            buf: vec![0u32; total],
            gt_base: gd_capacity,
        })
    }

    fn gt_stride(&self) -> usize {
        self.gt_sectors as usize * ENTRIES_PER_SECTOR as usize
    }

    /// Writes sequential grain-table sector offsets into `gd[0..gts]`
    /// starting at `start_sector`, returning the sector immediately after
    /// the last grain table (spec §4.D `prefill_gd`).
    pub fn prefill_gd(&mut self, start_sector: u64) -> u64 {
        let mut gt_sector = start_sector;
        for i in 0..self.gts {
            self.buf[i as usize] = gt_sector as u32;
            gt_sector += self.gt_sectors as u64;
        }
        gt_sector
    }

    /// Returns the grain-table sector offset recorded at `gd` index `i`.
    pub fn gd_entry(&self, i: u32) -> u32 {
        self.buf[i as usize]
    }

    /// The full on-disk GD region (including sector padding past `gts`).
    pub fn gd_region(&self) -> &[u32] {
        &self.buf[..self.gt_base]
    }

    /// The full on-disk region for grain table `gt_index` (including any
    /// sector padding past `num_gtes_per_gt`, which is none given the
    /// power-of-two-and->=128 invariant).
    pub fn gt_region_mut(&mut self, gt_index: u32) -> &mut [u32] {
        let stride = self.gt_stride();
        let start = self.gt_base + gt_index as usize * stride;
        &mut self.buf[start..start + stride]
    }

    /// Decodes an on-disk GD sector region (`gd_sectors * 512` bytes) read
    /// from a file into the in-memory GD.
    pub fn load_gd_from_bytes(&mut self, bytes: &[u8]) {
        for (i, slot) in self.buf[..self.gt_base].iter_mut().enumerate() {
            *slot = crate::vmdk::le::read_u32_le(bytes, i * 4);
        }
    }

    /// Decodes an on-disk GT sector region (`gt_sectors * 512` bytes) read
    /// from a file into grain table `gt_index`.
    pub fn load_gt_from_bytes(&mut self, gt_index: u32, bytes: &[u8]) {
        let region = self.gt_region_mut(gt_index);
        for (i, slot) in region.iter_mut().enumerate() {
            *slot = crate::vmdk::le::read_u32_le(bytes, i * 4);
        }
    }

    /// Reads the grain-table entry for grain `grain_nr`.
    pub fn gt_entry(&self, grain_nr: u64) -> u32 {
        let gt_index = grain_nr / self.num_gtes_per_gt as u64;
        let gte_index = grain_nr % self.num_gtes_per_gt as u64;
        let stride = self.gt_stride();
        self.buf[self.gt_base + gt_index as usize * stride + gte_index as usize]
    }

    /// Sets the grain-table entry for grain `grain_nr`.
    pub fn set_gt_entry(&mut self, grain_nr: u64, value: u32) {
        let gt_index = grain_nr / self.num_gtes_per_gt as u64;
        let gte_index = grain_nr % self.num_gtes_per_gt as u64;
        let stride = self.gt_stride();
        self.buf[self.gt_base + gt_index as usize * stride + gte_index as usize] = value;
    }

    /// Serializes the GD followed by all GTs as one little-endian byte
    /// buffer, suitable for the single sequential write the writer
    /// performs at finalize time.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.buf.len() * 4);
        for entry in &self.buf {
            out.extend_from_slice(&entry.to_le_bytes());
        }
        out
    }

    /// Byte length of [`Gdgt::to_bytes`]'s output.
    pub fn region_len_bytes(&self) -> u64 {
        self.buf.len() as u64 * 4
    }
}
