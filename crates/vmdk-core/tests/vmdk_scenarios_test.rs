//! End-to-end scenarios covering the writer/reader's documented behavior
//! for empty disks, single and multiple grains, explicit-zero grains,
//! write-after-emit rejection, and a torn finalize.

use tempfile::tempdir;

use vmdk_core::vmdk::descriptor::DescriptorConfig;
use vmdk_core::vmdk::header;
use vmdk_core::vmdk::le::SECTOR_SIZE;
use vmdk_core::vmdk::sparse::SparseReader;
use vmdk_core::vmdk::stream::StreamWriter;
use vmdk_core::Error;

const DISK_SECTORS: u64 = 1_048_576 / 512;

#[test]
fn scenario_empty_disk() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("empty.vmdk");

    let writer = StreamWriter::create(&path, DISK_SECTORS, DescriptorConfig::default()).unwrap();
    writer.close().unwrap();

    let bytes = std::fs::read(&path).unwrap();
    assert_eq!(&bytes[0..4], b"KDMV");

    let mut reader = SparseReader::open(&path).unwrap();
    assert_eq!(reader.capacity(), 1_048_576);
    assert!(reader.next_data(0).is_none());

    let mut buf = [0xFFu8; 1024];
    reader.pread(&mut buf, 0).unwrap();
    assert!(buf.iter().all(|&b| b == 0));
}

#[test]
fn scenario_single_grain_at_origin() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("single_grain.vmdk");

    let mut writer = StreamWriter::create(&path, DISK_SECTORS, DescriptorConfig::default()).unwrap();
    writer.pwrite(&[0xABu8; 65536], 0).unwrap();
    writer.close().unwrap();

    let mut reader = SparseReader::open(&path).unwrap();
    assert_eq!(reader.next_data(0), Some((0, 65536)));

    let mut buf = [0u8; 65536];
    reader.pread(&mut buf, 0).unwrap();
    assert!(buf.iter().all(|&b| b == 0xAB));

    let mut tail = [0xFFu8; 1];
    reader.pread(&mut tail, 65536).unwrap();
    assert_eq!(tail[0], 0);
}

#[test]
fn scenario_grain_aligned_holes() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("holes.vmdk");

    let mut writer = StreamWriter::create(&path, DISK_SECTORS, DescriptorConfig::default()).unwrap();
    writer.pwrite(&[0x01u8; 65536], 0).unwrap();
    writer.pwrite(&[0x02u8; 65536], 131072).unwrap();
    writer.close().unwrap();

    let mut reader = SparseReader::open(&path).unwrap();
    assert_eq!(reader.next_data(0), Some((0, 65536)));
    assert_eq!(reader.next_data(65536), Some((131072, 65536)));

    let mut hole = [0xFFu8; 131072 - 65536];
    reader.pread(&mut hole, 65536).unwrap();
    assert!(hole.iter().all(|&b| b == 0));
}

#[test]
fn scenario_explicit_zero_grain_reads_as_zero_and_is_reported_allocated() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("explicit_zero.vmdk");

    // Build a normal extent with one real grain so a grain table exists,
    // then hand-patch that grain's table entry to the explicit-zero
    // sentinel (1) the format reserves for "allocated but known zero".
    let mut writer = StreamWriter::create(&path, DISK_SECTORS, DescriptorConfig::default()).unwrap();
    writer.pwrite(&[0x9u8; 65536], 0).unwrap();
    writer.close().unwrap();

    let bytes = std::fs::read(&path).unwrap();
    let hdr = header::decode(&bytes[..header::HEADER_SIZE]).unwrap();
    let gt_sector = hdr.gd_offset + 1; // single-GT layout: GD is 1 sector, GT follows immediately.
    let gte_offset = (gt_sector * SECTOR_SIZE) as usize;

    let mut patched = bytes.clone();
    patched[gte_offset..gte_offset + 4].copy_from_slice(&1u32.to_le_bytes());
    std::fs::write(&path, &patched).unwrap();

    let mut reader = SparseReader::open(&path).unwrap();
    assert_eq!(reader.next_data(0), Some((0, 65536)));
    let mut buf = [0xFFu8; 65536];
    reader.pread(&mut buf, 0).unwrap();
    assert!(buf.iter().all(|&b| b == 0));
}

#[test]
fn scenario_write_after_emit_is_rejected() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("wae.vmdk");

    let mut writer = StreamWriter::create(&path, DISK_SECTORS, DescriptorConfig::default()).unwrap();
    writer.pwrite(&[1u8; 65536], 0).unwrap();
    writer.pwrite(&[2u8; 65536], 65536).unwrap();

    let err = writer.pwrite(&[3u8; 65536], 0).unwrap_err();
    assert!(matches!(err, Error::Unsupported { .. }));
}

#[test]
fn scenario_torn_finalize_is_rejected_on_open() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("torn.vmdk");

    let mut writer = StreamWriter::create(&path, DISK_SECTORS, DescriptorConfig::default()).unwrap();
    writer.pwrite(&[7u8; 65536], 0).unwrap();
    writer.close().unwrap();

    // Simulate stopping between the temporary-magic write and the
    // real-magic rewrite: tables, descriptor and grains are all valid,
    // only the header's magic is still the XORed placeholder.
    let mut bytes = std::fs::read(&path).unwrap();
    let hdr = header::decode(&bytes[..header::HEADER_SIZE]).unwrap();
    let temp_header = header::encode(&hdr, true);
    bytes[..header::HEADER_SIZE].copy_from_slice(&temp_header);
    std::fs::write(&path, &bytes).unwrap();

    let err = SparseReader::open(&path).unwrap_err();
    assert!(matches!(err, Error::InvalidFormat { .. }));
}
