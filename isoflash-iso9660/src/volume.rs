//! Primary volume descriptor parsing

use crate::{error::FormatError, SECTOR_SIZE};

const MAGIC: &[u8; 5] = b"CD001";
const MAGIC_OFFSET: usize = 1;

const LABEL_OFFSET: usize = 40;
const LABEL_LEN: usize = 32;

const ROOT_EXTENT_OFFSET: usize = 158;
const ROOT_SIZE_OFFSET: usize = 166;

const CREATED_OFFSET: usize = 813;
const CREATED_LEN: usize = 17;

pub(crate) fn read_u32_le(data: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes([
        data[offset],
        data[offset + 1],
        data[offset + 2],
        data[offset + 3],
    ])
}

fn ascii_field(data: &[u8]) -> String {
    data.iter()
        .copied()
        .filter(u8::is_ascii)
        .map(char::from)
        .collect()
}

/// The fixed 2048-byte descriptor at logical sector 16 of the image
#[derive(Clone, Debug)]
pub struct VolumeDescriptor {
    /// Volume identifier, trimmed of trailing padding
    pub label: Option<String>,

    /// Starting sector of the root directory extent
    pub root_extent_lba: u32,

    /// Size of the root directory extent, in bytes
    pub root_extent_size: u32,

    /// Raw 17-character ASCII creation timestamp
    pub created: Option<String>,
}

impl VolumeDescriptor {
    /// Parses the descriptor out of its 2048-byte sector.
    ///
    /// # Errors
    ///
    /// [`FormatError::BadSignature`] if the magic bytes don't match.
    ///
    /// # Panics
    ///
    /// If the sector buffer is shorter than [`SECTOR_SIZE`].
    pub fn parse(sector: &[u8]) -> Result<Self, FormatError> {
        assert!(sector.len() >= SECTOR_SIZE, "descriptor sector too short");

        if &sector[MAGIC_OFFSET..MAGIC_OFFSET + MAGIC.len()] != MAGIC {
            return Err(FormatError::BadSignature);
        }

        let label = ascii_field(&sector[LABEL_OFFSET..LABEL_OFFSET + LABEL_LEN]);
        let label = label.trim_end_matches([' ', '\0']);

        let created = ascii_field(&sector[CREATED_OFFSET..CREATED_OFFSET + CREATED_LEN]);
        let created = created.trim_matches(['\0', ' ']);

        Ok(Self {
            label: (!label.is_empty()).then(|| label.to_owned()),
            root_extent_lba: read_u32_le(sector, ROOT_EXTENT_OFFSET),
            root_extent_size: read_u32_le(sector, ROOT_SIZE_OFFSET),
            created: (!created.is_empty()).then(|| created.to_owned()),
        })
    }
}
