//! Sparse extent header codec (spec §3, §4.B).
//!
//! Validates, parses, and emits the 512-byte on-disk header that begins
//! every sparse VMDK extent. All multi-byte fields are little-endian and
//! several 64-bit fields are naturally misaligned in the packed layout, so
//! access goes through [`crate::vmdk::le`] byte copies rather than casts.

use crate::error::{Error, Result};
use crate::vmdk::le::{read_u16_le, read_u32_le, read_u64_le, write_u16_le, write_u32_le, write_u64_le};

/// Size of the on-disk sparse extent header, in bytes.
pub const HEADER_SIZE: usize = 512;

/// ASCII "KDMV", stored little-endian as the first 4 bytes of the header.
pub const MAGIC: u32 = 0x564d444b;

/// Highest header version this codec understands.
pub const SPARSE_VERSION_INCOMPAT_FLAGS: u32 = 3;

/// Newline-detector bytes written when `VALID_NEWLINE_DETECTOR` is set.
const NEWLINE_DETECTOR: [u8; 4] = [b'\n', b' ', b'\r', b'\n'];

/// Flags in the sparse extent header.
pub mod flags {
    pub const VALID_NEWLINE_DETECTOR: u32 = 1 << 0;
    pub const USE_REDUNDANT: u32 = 1 << 1;
    pub const COMPRESSED: u32 = 1 << 16;
    pub const EMBEDDED_LBA: u32 = 1 << 17;
    /// Bits outside the compatible range; unknown bits here fail validation.
    pub const INCOMPAT_FLAGS: u32 = 0xFFFF0000;
}

/// Compression algorithm identifiers.
pub mod compress_algorithm {
    pub const NONE: u16 = 0;
    pub const DEFLATE: u16 = 1;
}

/// A decoded sparse extent header, all fields in host representation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub version: u32,
    pub flags: u32,
    pub capacity: u64,
    pub grain_size: u64,
    pub descriptor_offset: u64,
    pub descriptor_size: u64,
    pub num_gtes_per_gt: u32,
    pub rgd_offset: u64,
    pub gd_offset: u64,
    pub over_head: u64,
    pub unclean_shutdown: u8,
    pub compress_algorithm: u16,
}

impl Header {
    pub fn is_compressed(&self) -> bool {
        self.flags & flags::COMPRESSED != 0
    }

    pub fn has_embedded_lba(&self) -> bool {
        self.flags & flags::EMBEDDED_LBA != 0
    }
}

/// Reads just the 4-byte magic number from the start of a header buffer.
///
/// Used by callers (e.g. a copy driver probing an unknown path) who want to
/// decide whether to attempt a sparse-header parse without one.
pub fn probe_magic(first_bytes: &[u8]) -> Option<u32> {
    if first_bytes.len() < 4 {
        return None;
    }
    Some(read_u32_le(first_bytes, 0))
}

/// Decodes a 512-byte on-disk header buffer into a [`Header`].
pub fn decode(bytes: &[u8]) -> Result<Header> {
    if bytes.len() < HEADER_SIZE {
        return Err(Error::invalid_format("header shorter than 512 bytes"));
    }

    let magic = read_u32_le(bytes, 0);
    if magic != MAGIC {
        return Err(Error::invalid_format(format!(
            "bad magic: expected 0x{MAGIC:08x}, got 0x{magic:08x}"
        )));
    }

    let version = read_u32_le(bytes, 4);
    if version > SPARSE_VERSION_INCOMPAT_FLAGS {
        return Err(Error::invalid_format(format!(
            "unsupported header version {version}"
        )));
    }

    let hdr_flags = read_u32_le(bytes, 8);
    let incompat_mask = flags::INCOMPAT_FLAGS & !flags::COMPRESSED & !flags::EMBEDDED_LBA;
    if hdr_flags & incompat_mask != 0 {
        return Err(Error::invalid_format(format!(
            "unknown incompatible flag bits set: 0x{:08x}",
            hdr_flags & incompat_mask
        )));
    }

    let capacity = read_u64_le(bytes, 12);
    let grain_size = read_u64_le(bytes, 20);
    let descriptor_offset = read_u64_le(bytes, 28);
    let descriptor_size = read_u64_le(bytes, 36);
    let num_gtes_per_gt = read_u32_le(bytes, 44);
    let rgd_offset = read_u64_le(bytes, 48);
    let gd_offset = read_u64_le(bytes, 56);
    let over_head = read_u64_le(bytes, 64);
    let unclean_shutdown = bytes[72];

    if hdr_flags & flags::VALID_NEWLINE_DETECTOR != 0 {
        let detector = [bytes[73], bytes[74], bytes[75], bytes[76]];
        if detector != NEWLINE_DETECTOR {
            return Err(Error::invalid_format("invalid newline-detector bytes"));
        }
    }

    let compress_algorithm = read_u16_le(bytes, 77);

    if hdr_flags & flags::EMBEDDED_LBA != 0 && hdr_flags & flags::COMPRESSED == 0 {
        return Err(Error::invalid_format(
            "EMBEDDED_LBA set without COMPRESSED",
        ));
    }

    Ok(Header {
        version,
        flags: hdr_flags,
        capacity,
        grain_size,
        descriptor_offset,
        descriptor_size,
        num_gtes_per_gt,
        rgd_offset,
        gd_offset,
        over_head,
        unclean_shutdown,
        compress_algorithm,
    })
}

/// Encodes `header` into a 512-byte on-disk buffer.
///
/// When `temporary` is true, the magic is written XORed with `0x20202020`
/// (lowercase "kdmv"), marking the file as not-yet-finalized; a reader must
/// reject such a file (spec §4.B, §5 crash model).
pub fn encode(header: &Header, temporary: bool) -> [u8; HEADER_SIZE] {
    let mut buf = [0u8; HEADER_SIZE];

    let magic = if temporary { MAGIC ^ 0x2020_2020 } else { MAGIC };
    write_u32_le(&mut buf, 0, magic);
    write_u32_le(&mut buf, 4, header.version);
    write_u32_le(&mut buf, 8, header.flags);
    write_u64_le(&mut buf, 12, header.capacity);
    write_u64_le(&mut buf, 20, header.grain_size);
    write_u64_le(&mut buf, 28, header.descriptor_offset);
    write_u64_le(&mut buf, 36, header.descriptor_size);
    write_u32_le(&mut buf, 44, header.num_gtes_per_gt);
    write_u64_le(&mut buf, 48, header.rgd_offset);
    write_u64_le(&mut buf, 56, header.gd_offset);
    write_u64_le(&mut buf, 64, header.over_head);
    buf[72] = header.unclean_shutdown;
    buf[73] = NEWLINE_DETECTOR[0];
    buf[74] = NEWLINE_DETECTOR[1];
    buf[75] = NEWLINE_DETECTOR[2];
    buf[76] = NEWLINE_DETECTOR[3];
    write_u16_le(&mut buf, 77, header.compress_algorithm);

    buf
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_header() -> Header {
        Header {
            version: 3,
            flags: flags::VALID_NEWLINE_DETECTOR | flags::COMPRESSED | flags::EMBEDDED_LBA,
            capacity: 2048,
            grain_size: 128,
            descriptor_offset: 1,
            descriptor_size: 20,
            num_gtes_per_gt: 512,
            rgd_offset: 0,
            gd_offset: 21,
            over_head: 22,
            unclean_shutdown: 0,
            compress_algorithm: compress_algorithm::DEFLATE,
        }
    }

    #[test]
    fn test_roundtrip() {
        let header = sample_header();
        let buf = encode(&header, false);
        let decoded = decode(&buf).unwrap();
        assert_eq!(decoded, header);
    }

    #[test]
    fn test_temporary_magic_rejected() {
        let header = sample_header();
        let buf = encode(&header, true);
        assert_eq!(&buf[0..4], b"kdmv");
        let err = decode(&buf).unwrap_err();
        assert!(matches!(err, Error::InvalidFormat { .. }));
    }

    #[test]
    fn test_real_magic_accepted() {
        let header = sample_header();
        let buf = encode(&header, false);
        assert_eq!(&buf[0..4], b"KDMV");
        decode(&buf).unwrap();
    }

    #[test]
    fn test_bad_magic() {
        let buf = [0u8; HEADER_SIZE];
        let err = decode(&buf).unwrap_err();
        assert!(matches!(err, Error::InvalidFormat { .. }));
    }

    #[test]
    fn test_version_too_high() {
        let mut header = sample_header();
        header.version = 4;
        let buf = encode(&header, false);
        let err = decode(&buf).unwrap_err();
        assert!(matches!(err, Error::InvalidFormat { .. }));
    }

    #[test]
    fn test_unknown_incompatible_flag_rejected() {
        let mut header = sample_header();
        header.flags |= 1 << 20;
        let buf = encode(&header, false);
        let err = decode(&buf).unwrap_err();
        assert!(matches!(err, Error::InvalidFormat { .. }));
    }

    #[test]
    fn test_embedded_lba_requires_compressed() {
        let mut header = sample_header();
        header.flags = flags::VALID_NEWLINE_DETECTOR | flags::EMBEDDED_LBA;
        let buf = encode(&header, false);
        let err = decode(&buf).unwrap_err();
        assert!(matches!(err, Error::InvalidFormat { .. }));
    }

    #[test]
    fn test_invalid_newline_detector_rejected() {
        let header = sample_header();
        let mut buf = encode(&header, false);
        buf[73] = b'x';
        let err = decode(&buf).unwrap_err();
        assert!(matches!(err, Error::InvalidFormat { .. }));
    }

    #[test]
    fn test_newline_detector_ignored_when_flag_unset() {
        let mut header = sample_header();
        header.flags = flags::COMPRESSED | flags::EMBEDDED_LBA;
        let mut buf = encode(&header, false);
        buf[73] = b'x';
        decode(&buf).unwrap();
    }

    #[test]
    fn test_probe_magic() {
        let header = sample_header();
        let buf = encode(&header, false);
        assert_eq!(probe_magic(&buf), Some(MAGIC));
        assert_eq!(probe_magic(&[]), None);
    }
}
