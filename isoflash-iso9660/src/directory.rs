//! Directory record scanning
//!
//! Directory extents hold a packed sequence of variable-length records.
//! A record length of zero means the rest of the current 2048-byte sector
//! is padding and scanning resumes at the next sector boundary.

use crate::{volume::read_u32_le, SECTOR_SIZE};

/// Fixed header bytes before the file identifier.
const HEADER_LEN: usize = 33;

const EXTENT_OFFSET: usize = 2;
const SIZE_OFFSET: usize = 10;
const FLAGS_OFFSET: usize = 25;
const ID_LEN_OFFSET: usize = 32;

const FLAG_DIRECTORY: u8 = 0x02;

/// One parsed directory record
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct DirectoryRecord {
    /// Starting sector of the entry's data extent
    pub extent_lba: u32,

    /// Length of the entry's data, in bytes
    pub size: u32,

    /// Whether the entry is a subdirectory
    pub is_directory: bool,

    /// Cleaned identifier; `None` for `.` / `..` self-references
    pub identifier: Option<String>,
}

/// Strips the `;version` suffix and non-ASCII or separator bytes from a
/// raw identifier. Self-references (`.`, `..`, the null byte) and
/// identifiers that clean down to nothing come back as `None`.
fn clean_identifier(raw: &[u8]) -> Option<String> {
    let name: String = raw
        .iter()
        .copied()
        .filter(|b| b.is_ascii() && !b.is_ascii_control() && !matches!(b, b'/' | b'\\'))
        .map(char::from)
        .collect();

    let name = name.split(';').next().unwrap_or_default();

    match name {
        "" | "." | ".." => None,
        _ => Some(name.to_owned()),
    }
}

/// Outcome of scanning one record position
#[derive(Debug)]
pub(crate) enum ScanStep {
    /// A record was parsed; scanning continues at the returned offset
    Record(DirectoryRecord, usize),

    /// Sector padding; scanning continues at the returned offset
    Padding(usize),

    /// The extent (or a damaged tail of it) ends here
    End,
}

/// Scans the record starting at `offset` within a directory extent.
///
/// A record overrunning the remaining buffer ends the scan silently: a
/// damaged directory yields a partial listing, not a failure, since other
/// directories may still be intact.
pub(crate) fn scan_record(data: &[u8], offset: usize) -> ScanStep {
    if offset >= data.len() || offset + HEADER_LEN > data.len() {
        return ScanStep::End;
    }

    let record_len = usize::from(data[offset]);
    if record_len == 0 {
        let within_sector = offset % SECTOR_SIZE;
        if within_sector == 0 {
            return ScanStep::End;
        }

        return ScanStep::Padding(offset + (SECTOR_SIZE - within_sector));
    }

    if offset + record_len > data.len() {
        return ScanStep::End;
    }

    let record = &data[offset..offset + record_len];

    let id_len = usize::from(record[ID_LEN_OFFSET]);
    let identifier = if id_len > 0 && HEADER_LEN + id_len <= record_len {
        clean_identifier(&record[HEADER_LEN..HEADER_LEN + id_len])
    } else {
        None
    };

    ScanStep::Record(
        DirectoryRecord {
            extent_lba: read_u32_le(record, EXTENT_OFFSET),
            size: read_u32_le(record, SIZE_OFFSET),
            is_directory: record[FLAGS_OFFSET] & FLAG_DIRECTORY != 0,
            identifier,
        },
        offset + record_len,
    )
}
