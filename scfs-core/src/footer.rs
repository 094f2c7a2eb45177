//! On-disk layout of a lower file:
//!
//! ```text
//! [cluster 0][cluster 1]...[cluster N-1][ClusterDescriptor; N][Footer]
//! ```
//!
//! Every cluster payload starts on a 4-byte boundary. All integers are little-endian.

use std::io::Cursor;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use crate::compression::CompressionType;
use crate::error::{Error, Result};

/// `"SCFS"` read as a little-endian u32.
pub const SCFS_MAGIC: u32 = u32::from_le_bytes(*b"SCFS");

pub const FOOTER_SIZE: usize = 24;
pub const CLUSTER_DESCRIPTOR_SIZE: usize = 8;

pub const PAGE_SIZE: usize = 4096;
pub const CLUSTER_SIZE_MIN: u32 = 4096;
pub const CLUSTER_SIZE_MAX: u32 = 16384;
pub const DEFAULT_CLUSTER_SIZE: u32 = CLUSTER_SIZE_MAX;

/// Payload alignment inside the lower file.
pub const CLUSTER_ALIGNMENT: u64 = 4;

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct Footer {
    pub footer_size: u32,
    pub cluster_size: u32,
    pub original_file_size: i64,
    pub comp_type: CompressionType,
    pub magic: u32,
}

impl Footer {
    pub fn new(
        cluster_count: usize,
        cluster_size: u32,
        original_file_size: u64,
        comp_type: CompressionType,
    ) -> Footer {
        Footer {
            footer_size: (FOOTER_SIZE + cluster_count * CLUSTER_DESCRIPTOR_SIZE) as u32,
            cluster_size,
            original_file_size: original_file_size as i64,
            comp_type,
            magic: SCFS_MAGIC,
        }
    }

    /// Number of descriptors stored in front of the fixed footer.
    #[inline(always)]
    pub fn cluster_count(&self) -> usize {
        (self.footer_size as usize - FOOTER_SIZE) / CLUSTER_DESCRIPTOR_SIZE
    }

    #[inline(always)]
    pub fn original_size(&self) -> u64 {
        self.original_file_size as u64
    }

    /// A footer with no descriptor array describing a non-empty file marks it stored verbatim.
    #[inline(always)]
    pub fn is_compressed(&self) -> bool {
        self.footer_size as usize > FOOTER_SIZE || self.original_file_size == 0
    }
}

/// Location of one cluster payload inside the lower file.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Default)]
pub struct ClusterDescriptor {
    pub offset: u32,
    pub size: u32,
}

impl ClusterDescriptor {
    /// First byte after this payload, padded to the next aligned boundary.
    #[inline(always)]
    pub fn next_offset(&self) -> u64 {
        align_up(self.offset as u64 + self.size as u64)
    }
}

/// Byte offset of page `index`, or `None` for pages past the addressable range.
#[inline(always)]
pub fn page_offset(index: u64) -> Option<u64> {
    index.checked_mul(PAGE_SIZE as u64)
}

#[inline(always)]
pub fn align_up(pos: u64) -> u64 {
    let diff = pos % CLUSTER_ALIGNMENT;
    if diff == 0 {
        pos
    } else {
        pos + (CLUSTER_ALIGNMENT - diff)
    }
}

/// Number of clusters needed to hold `file_size` bytes.
#[inline(always)]
pub fn total_cluster_count(file_size: u64, cluster_size: u32) -> u64 {
    let cluster_size = cluster_size as u64;
    (file_size + cluster_size - 1) / cluster_size
}

pub fn encode_footer(footer: &Footer) -> [u8; FOOTER_SIZE] {
    let mut buf = [0u8; FOOTER_SIZE];
    let mut writer = Cursor::new(&mut buf[..]);

    // Writing into a fixed-size array of exactly the right length cannot fail.
    let _ = writer.write_u32::<LittleEndian>(footer.footer_size);
    let _ = writer.write_u32::<LittleEndian>(footer.cluster_size);
    let _ = writer.write_i64::<LittleEndian>(footer.original_file_size);
    let _ = writer.write_u32::<LittleEndian>(footer.comp_type.id());
    let _ = writer.write_u32::<LittleEndian>(footer.magic);

    buf
}

pub fn decode_footer(bytes: &[u8]) -> Result<Footer> {
    if bytes.len() < FOOTER_SIZE {
        return Err(Error::corrupt(format!(
            "footer needs {} bytes, got {}",
            FOOTER_SIZE,
            bytes.len()
        )));
    }

    let mut reader = Cursor::new(&bytes[..FOOTER_SIZE]);
    let footer_size = reader.read_u32::<LittleEndian>()?;
    let cluster_size = reader.read_u32::<LittleEndian>()?;
    let original_file_size = reader.read_i64::<LittleEndian>()?;
    let comp_type = CompressionType::from_id(reader.read_u32::<LittleEndian>()?);
    let magic = reader.read_u32::<LittleEndian>()?;

    if magic != SCFS_MAGIC {
        return Err(Error::corrupt(format!("invalid footer magic {:#x}", magic)));
    }

    if (footer_size as usize) < FOOTER_SIZE {
        return Err(Error::corrupt(format!(
            "footer size {} below minimum {}",
            footer_size, FOOTER_SIZE
        )));
    }

    if (footer_size as usize - FOOTER_SIZE) % CLUSTER_DESCRIPTOR_SIZE != 0 {
        return Err(Error::corrupt(format!(
            "footer size {} does not hold whole cluster descriptors",
            footer_size
        )));
    }

    if cluster_size < CLUSTER_SIZE_MIN
        || cluster_size > CLUSTER_SIZE_MAX
        || !cluster_size.is_power_of_two()
    {
        return Err(Error::corrupt(format!(
            "invalid cluster size {}",
            cluster_size
        )));
    }

    if original_file_size < 0 {
        return Err(Error::corrupt(format!(
            "negative file size {}",
            original_file_size
        )));
    }

    Ok(Footer {
        footer_size,
        cluster_size,
        original_file_size,
        comp_type,
        magic,
    })
}

/// Reads descriptor `index` out of an encoded descriptor array.
///
/// The caller bounds-checks `index` against the array length.
#[inline(always)]
pub fn cluster_descriptor_at(array: &[u8], index: usize) -> ClusterDescriptor {
    let start = index * CLUSTER_DESCRIPTOR_SIZE;
    let mut reader = &array[start..start + CLUSTER_DESCRIPTOR_SIZE];

    // The slice is exactly eight bytes long.
    ClusterDescriptor {
        offset: reader.read_u32::<LittleEndian>().unwrap_or_default(),
        size: reader.read_u32::<LittleEndian>().unwrap_or_default(),
    }
}

pub fn encode_descriptors(descriptors: &[ClusterDescriptor], out: &mut Vec<u8>) {
    out.reserve(descriptors.len() * CLUSTER_DESCRIPTOR_SIZE);
    for descriptor in descriptors {
        out.extend_from_slice(&descriptor.offset.to_le_bytes());
        out.extend_from_slice(&descriptor.size.to_le_bytes());
    }
}

pub fn decode_descriptors(array: &[u8]) -> Result<Vec<ClusterDescriptor>> {
    if array.len() % CLUSTER_DESCRIPTOR_SIZE != 0 {
        return Err(Error::corrupt(format!(
            "descriptor array of {} bytes is not a whole number of entries",
            array.len()
        )));
    }

    Ok((0..array.len() / CLUSTER_DESCRIPTOR_SIZE)
        .map(|i| cluster_descriptor_at(array, i))
        .collect())
}
