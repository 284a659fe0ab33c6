//! VMDK descriptor file parsing and generation.
//!
//! This module handles both directions: parsing a descriptor file's text
//! into structured metadata, and building the descriptor text a
//! stream-optimized writer embeds in its own extent.

use std::path::Path;

use rand::{Rng, SeedableRng};

use crate::error::{Error, Result};
use crate::vmdk::le::ceil_div;

/// Disk geometry uses a fixed heads/sectors-per-track pair; VMware
/// recommends this combination for anything over 4GB.
const GEOMETRY_HEADS: u32 = 255;
const GEOMETRY_SECTORS_PER_TRACK: u32 = 63;
const MAX_CYLINDERS: u64 = 65535;

/// Knobs that make descriptor generation deterministic for tests and
/// reproducible builds: an explicit CID, or a seed for the random content
/// IDs that would otherwise come from the OS RNG (spec §4.C, §9 determinism
/// note).
#[derive(Debug, Clone, Default)]
pub struct DescriptorConfig {
    /// Seeds the RNG used for the CID and long content ID when
    /// `cid_override` is not set. `None` uses OS entropy.
    pub rng_seed: Option<u64>,
    /// Forces the descriptor's CID instead of generating one.
    pub cid_override: Option<u32>,
    /// Overrides the `ddb.toolsVersion` field; defaults to a fixed
    /// placeholder when absent.
    pub tools_version: Option<String>,
}

/// Builds the self-describing descriptor text embedded in a
/// stream-optimized extent that references itself as its sole extent.
pub fn make_descriptor(
    extent_path: &Path,
    capacity_sectors: u64,
    cid: u32,
    config: &DescriptorConfig,
) -> String {
    let filename = extent_path
        .file_name()
        .map(|f| f.to_string_lossy().into_owned())
        .unwrap_or_else(|| extent_path.to_string_lossy().into_owned());

    let mut rng = match config.rng_seed {
        Some(seed) => rand::rngs::StdRng::seed_from_u64(seed),
        None => rand::rngs::StdRng::from_entropy(),
    };
    let long_content_id: [u32; 3] = [rng.gen(), rng.gen(), rng.gen()];

    let cylinders = if capacity_sectors > MAX_CYLINDERS * GEOMETRY_HEADS as u64 * GEOMETRY_SECTORS_PER_TRACK as u64
    {
        MAX_CYLINDERS
    } else {
        ceil_div(
            capacity_sectors,
            GEOMETRY_HEADS as u64 * GEOMETRY_SECTORS_PER_TRACK as u64,
        )
    };

    let tools_version = config.tools_version.as_deref().unwrap_or("2147483647");

    format!(
        "# Disk DescriptorFile\n\
version=1\n\
encoding=\"UTF-8\"\n\
CID={cid:08x}\n\
parentCID=ffffffff\n\
createType=\"streamOptimized\"\n\
\n\
# Extent description\n\
RW {capacity_sectors} SPARSE \"{filename}\"\n\
\n\
# The Disk Data Base\n\
#DDB\n\
\n\
ddb.longContentID = \"{:08x}{:08x}{:08x}{cid:08x}\"\n\
ddb.virtualHWVersion = \"4\"\n\
ddb.geometry.cylinders = \"{cylinders}\"\n\
ddb.geometry.heads = \"{GEOMETRY_HEADS}\"\n\
ddb.geometry.sectors = \"{GEOMETRY_SECTORS_PER_TRACK}\"\n\
ddb.adapterType = \"lsilogic\"\n\
ddb.toolsInstallType = \"4\"\n\
ddb.toolsVersion = \"{tools_version}\"\n",
        long_content_id[0], long_content_id[1], long_content_id[2],
    )
}

/// The type of a VMDK extent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtentType {
    /// Flat extent - raw disk data in a separate file.
    Flat,
    /// Sparse extent - uses grain tables for allocation.
    Sparse,
    /// Zero extent - represents zeroed data without storage.
    Zero,
    /// VMFS extent - VMware VMFS filesystem.
    Vmfs,
    /// VMFS sparse extent.
    VmfsSparse,
    /// VMFS raw device mapping.
    VmfsRdm,
    /// VMFS raw extent.
    VmfsRaw,
}

impl ExtentType {
    /// Parse an extent type from a string.
    fn from_str(s: &str) -> Result<Self> {
        match s.to_uppercase().as_str() {
            "FLAT" => Ok(ExtentType::Flat),
            "SPARSE" => Ok(ExtentType::Sparse),
            "ZERO" => Ok(ExtentType::Zero),
            "VMFS" => Ok(ExtentType::Vmfs),
            "VMFSSPARSE" => Ok(ExtentType::VmfsSparse),
            "VMFSRDM" => Ok(ExtentType::VmfsRdm),
            "VMFSRAW" => Ok(ExtentType::VmfsRaw),
            _ => Err(Error::invalid_format(format!("unknown extent type: {}", s))),
        }
    }
}

/// A VMDK extent entry describing a portion of the disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Extent {
    /// Access mode (e.g., "RW" for read-write, "RDONLY" for read-only).
    pub access: String,
    /// Size of this extent in 512-byte sectors.
    pub size_sectors: u64,
    /// Type of the extent.
    pub extent_type: ExtentType,
    /// Filename of the extent file.
    pub filename: String,
    /// Offset within the extent file (in sectors).
    pub offset: u64,
}

/// Parsed VMDK descriptor containing disk metadata.
#[derive(Debug, Clone)]
pub struct VmdkDescriptor {
    /// Descriptor format version.
    pub version: u32,
    /// Content ID for change tracking.
    pub cid: u32,
    /// Parent content ID for delta disks.
    pub parent_cid: u32,
    /// The type of VMDK (e.g., "monolithicFlat", "twoGbMaxExtentSparse").
    pub create_type: String,
    /// List of extent entries.
    pub extents: Vec<Extent>,
    /// Disk geometry: cylinders.
    pub cylinders: u64,
    /// Disk geometry: heads.
    pub heads: u32,
    /// Disk geometry: sectors per track.
    pub sectors: u32,
    /// Virtual hardware version.
    pub hw_version: String,
    /// Disk adapter type (e.g., "lsilogic", "ide", "buslogic").
    pub adapter_type: String,
}

impl VmdkDescriptor {
    /// Calculate the total disk size in bytes.
    pub fn disk_size_bytes(&self) -> u64 {
        self.disk_size_sectors() * 512
    }

    /// Calculate the total disk size in sectors.
    pub fn disk_size_sectors(&self) -> u64 {
        self.extents.iter().map(|e| e.size_sectors).sum()
    }
}

/// Parse a VMDK descriptor from its text content.
///
/// # Arguments
///
/// * `content` - The text content of the VMDK descriptor file.
///
/// # Returns
///
/// A `VmdkDescriptor` containing the parsed metadata.
///
/// # Errors
///
/// Returns an error if the descriptor format is invalid or required fields are missing.
pub fn parse_descriptor(content: &str) -> Result<VmdkDescriptor> {
    let mut version = 1;
    let mut cid = 0u32;
    let mut parent_cid = 0xffffffffu32;
    let mut create_type = String::new();
    let mut extents = Vec::new();
    let mut cylinders = 0u64;
    let mut heads = 0u32;
    let mut sectors = 0u32;
    let mut hw_version = String::new();
    let mut adapter_type = String::new();

    for line in content.lines() {
        let line = line.trim();

        // Skip empty lines and comments
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        // Check for extent line (starts with access mode)
        if line.starts_with("RW ") || line.starts_with("RDONLY ") || line.starts_with("NOACCESS ") {
            let extent = parse_extent_line(line)?;
            extents.push(extent);
            continue;
        }

        // Parse key=value or key = value pairs
        if let Some((key, value)) = parse_key_value(line) {
            match key.as_str() {
                "version" => {
                    version = value
                        .parse()
                        .map_err(|_| Error::invalid_format(format!("invalid version: {}", value)))?;
                }
                "CID" => {
                    cid = u32::from_str_radix(&value, 16)
                        .map_err(|_| Error::invalid_format(format!("invalid CID: {}", value)))?;
                }
                "parentCID" => {
                    parent_cid = u32::from_str_radix(&value, 16)
                        .map_err(|_| Error::invalid_format(format!("invalid parentCID: {}", value)))?;
                }
                "createType" => {
                    create_type = value;
                }
                "ddb.virtualHWVersion" => {
                    hw_version = value;
                }
                "ddb.geometry.cylinders" => {
                    cylinders = value
                        .parse()
                        .map_err(|_| Error::invalid_format(format!("invalid cylinders: {}", value)))?;
                }
                "ddb.geometry.heads" => {
                    heads = value
                        .parse()
                        .map_err(|_| Error::invalid_format(format!("invalid heads: {}", value)))?;
                }
                "ddb.geometry.sectors" => {
                    sectors = value
                        .parse()
                        .map_err(|_| Error::invalid_format(format!("invalid sectors: {}", value)))?;
                }
                "ddb.adapterType" => {
                    adapter_type = value;
                }
                _ => {
                    // Ignore unknown keys
                }
            }
        }
    }

    Ok(VmdkDescriptor {
        version,
        cid,
        parent_cid,
        create_type,
        extents,
        cylinders,
        heads,
        sectors,
        hw_version,
        adapter_type,
    })
}

/// Parse a key=value or key = value line.
///
/// Returns None if the line doesn't contain an equals sign.
fn parse_key_value(line: &str) -> Option<(String, String)> {
    let eq_pos = line.find('=')?;
    let key = line[..eq_pos].trim().to_string();
    let mut value = line[eq_pos + 1..].trim().to_string();

    // Remove surrounding quotes if present
    if value.starts_with('"') && value.ends_with('"') && value.len() >= 2 {
        value = value[1..value.len() - 1].to_string();
    }

    Some((key, value))
}

/// Parse an extent line like: "RW 838860800 FLAT "TestVM-flat.vmdk" 0"
fn parse_extent_line(line: &str) -> Result<Extent> {
    // Extent format: ACCESS SIZE TYPE "FILENAME" OFFSET
    // The filename is quoted, so we need to handle that specially

    let parts: Vec<&str> = line.split_whitespace().collect();
    if parts.len() < 4 {
        return Err(Error::invalid_format(format!("invalid extent line: {}", line)));
    }

    let access = parts[0].to_string();
    let size_sectors: u64 = parts[1]
        .parse()
        .map_err(|_| Error::invalid_format(format!("invalid extent size: {}", parts[1])))?;
    let extent_type = ExtentType::from_str(parts[2])?;

    // Find the quoted filename - it could span multiple "parts" if filename has spaces
    let rest_of_line = line
        .split_whitespace()
        .skip(3)
        .collect::<Vec<&str>>()
        .join(" ");

    let (filename, offset_str) = parse_quoted_filename_and_offset(&rest_of_line)?;

    // Sparse extent lines (stream-optimized, monolithicSparse) carry no
    // trailing offset field; only flat/VMFS extents split across files do.
    let offset: u64 = if offset_str.is_empty() {
        0
    } else {
        offset_str
            .parse()
            .map_err(|_| Error::invalid_format(format!("invalid extent offset: {}", offset_str)))?
    };

    Ok(Extent {
        access,
        size_sectors,
        extent_type,
        filename,
        offset,
    })
}

/// Parse a quoted filename followed by an offset from a string like: "filename.vmdk" 0
fn parse_quoted_filename_and_offset(s: &str) -> Result<(String, String)> {
    let s = s.trim();

    if !s.starts_with('"') {
        return Err(Error::invalid_format(format!("expected quoted filename, got: {}", s)));
    }

    // Find the closing quote
    let end_quote = s[1..]
        .find('"')
        .ok_or_else(|| Error::invalid_format(format!("unclosed quote in: {}", s)))?
        + 1;

    let filename = s[1..end_quote].to_string();
    let offset_str = s[end_quote + 1..].trim().to_string();

    Ok((filename, offset_str))
}
