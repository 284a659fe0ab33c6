//! Integration tests for the stream-optimized VMDK writer and reader,
//! exercised end to end through real files on disk.

use tempfile::tempdir;

use vmdk_core::vmdk::descriptor::DescriptorConfig;
use vmdk_core::vmdk::header;
use vmdk_core::vmdk::le::SECTOR_SIZE;
use vmdk_core::vmdk::sparse::SparseReader;
use vmdk_core::vmdk::stream::StreamWriter;

const ONE_GIB_SECTORS: u64 = (1024 * 1024 * 1024) / 512;

#[test]
fn test_writer_magic_number_after_close() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("disk.vmdk");

    let writer = StreamWriter::create(&path, ONE_GIB_SECTORS, DescriptorConfig::default()).unwrap();
    writer.close().unwrap();

    let bytes = std::fs::read(&path).unwrap();
    assert!(bytes.len() >= header::HEADER_SIZE);
    assert_eq!(header::probe_magic(&bytes[..4]), Some(header::MAGIC));
}

#[test]
fn test_header_is_absent_before_close() {
    // A crash before close() must leave no valid header behind: create()
    // never writes header bytes, only close() does.
    let dir = tempdir().unwrap();
    let path = dir.path().join("disk.vmdk");

    let writer = StreamWriter::create(&path, ONE_GIB_SECTORS, DescriptorConfig::default()).unwrap();
    drop(writer);

    assert!(SparseReader::open(&path).is_err());
}

#[test]
fn test_write_then_read_back_grain_data() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("disk.vmdk");

    let mut writer = StreamWriter::create(&path, ONE_GIB_SECTORS, DescriptorConfig::default()).unwrap();
    let grain = vec![0xABu8; 64 * 1024];
    writer.pwrite(&grain, 0).unwrap();
    writer.close().unwrap();

    let mut reader = SparseReader::open(&path).unwrap();
    let mut readback = vec![0u8; grain.len()];
    reader.pread(&mut readback, 0).unwrap();
    assert_eq!(readback, grain);
}

#[test]
fn test_write_then_read_back_compressible_and_random_grains() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("disk.vmdk");

    let mut writer = StreamWriter::create(&path, ONE_GIB_SECTORS, DescriptorConfig::default()).unwrap();

    let zeros = vec![0u8; 64 * 1024];
    let mut pseudo_random = vec![0u8; 64 * 1024];
    for (i, byte) in pseudo_random.iter_mut().enumerate() {
        *byte = ((i * 17 + 31) % 256) as u8;
    }

    writer.pwrite(&zeros, 0).unwrap();
    writer.pwrite(&pseudo_random, 64 * 1024).unwrap();
    writer.close().unwrap();

    let mut reader = SparseReader::open(&path).unwrap();

    // An all-zero grain stays unallocated; its GT entry is never set.
    assert_eq!(reader.next_data(0), Some((64 * 1024, 64 * 1024)));

    let mut readback = vec![0u8; pseudo_random.len()];
    reader.pread(&mut readback, 64 * 1024).unwrap();
    assert_eq!(readback, pseudo_random);
}

#[test]
fn test_file_contains_more_than_just_the_header() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("disk.vmdk");

    let mut writer = StreamWriter::create(&path, ONE_GIB_SECTORS, DescriptorConfig::default()).unwrap();
    writer.pwrite(&[0xABu8; 64 * 1024], 0).unwrap();
    writer.close().unwrap();

    let metadata = std::fs::metadata(&path).unwrap();
    assert!(metadata.len() > SECTOR_SIZE);
}

#[test]
fn test_rewriting_an_already_flushed_grain_is_rejected() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("disk.vmdk");

    let mut writer = StreamWriter::create(&path, ONE_GIB_SECTORS, DescriptorConfig::default()).unwrap();
    writer.pwrite(&[1u8; 64 * 1024], 0).unwrap();
    writer.pwrite(&[2u8; 64 * 1024], 64 * 1024).unwrap();

    let err = writer.pwrite(&[3u8; 512], 0).unwrap_err();
    assert!(matches!(err, vmdk_core::Error::Unsupported { .. }));
}

#[test]
fn test_deterministic_cid_with_explicit_seed() {
    let dir = tempdir().unwrap();
    let path_a = dir.path().join("a.vmdk");
    let path_b = dir.path().join("b.vmdk");

    let config = DescriptorConfig {
        rng_seed: Some(99),
        ..Default::default()
    };

    StreamWriter::create(&path_a, ONE_GIB_SECTORS, config.clone())
        .unwrap()
        .close()
        .unwrap();
    StreamWriter::create(&path_b, ONE_GIB_SECTORS, config)
        .unwrap()
        .close()
        .unwrap();

    assert_eq!(std::fs::read(&path_a).unwrap(), std::fs::read(&path_b).unwrap());
}
