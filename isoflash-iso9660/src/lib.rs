#![doc = include_str!("../README.md")]

use std::{
    fs::File,
    io::{Read as _, Seek as _, SeekFrom},
    path::{Path, PathBuf},
};

use log::warn;

pub mod error;

mod directory;
mod extract;
mod volume;

pub use directory::DirectoryRecord;
pub use error::{ExtractError, FormatError};
pub use extract::{extract, ExtractPolicy, ExtractSummary};
pub use volume::VolumeDescriptor;

use directory::{scan_record, ScanStep};

/// ISO 9660 logical sector size, in bytes.
pub const SECTOR_SIZE: usize = 2048;

/// Sector holding the primary volume descriptor.
const PVD_SECTOR: u64 = 16;

/// Sector holding the El Torito boot record volume descriptor.
const BOOT_RECORD_SECTOR: u64 = 17;

const EL_TORITO_MAGIC: &[u8] = b"EL TORITO SPECIFICATION";

/// Conventional boot sector location and trailing marker.
const BOOT_SECTOR_OFFSET: u64 = 0x8000;
const BOOT_SECTOR_LEN: usize = 512;
const BOOT_SECTOR_MAGIC: [u8; 2] = [0x55, 0xaa];

/// Kind of a directory tree entry
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum EntryKind {
    /// Regular file
    File,

    /// Directory
    Directory,
}

/// One entry of the image's directory tree
#[derive(Clone, Debug)]
pub struct Entry {
    /// Path relative to the image root
    pub path: PathBuf,

    /// File or directory
    pub kind: EntryKind,

    /// Starting sector of the entry's data extent
    pub extent_lba: u32,

    /// Length of the entry's data, in bytes
    pub size: u32,
}

/// Summary information about an image file
#[derive(Clone, Debug)]
pub struct ImageInfo {
    /// Image file size, in bytes
    pub size_bytes: u64,

    /// Volume label, if any
    pub label: Option<String>,

    /// Whether boot evidence was found
    pub bootable: bool,

    /// Raw creation timestamp field, if any
    pub created: Option<String>,
}

/// An open handle on a validated ISO 9660 image
#[derive(Debug)]
pub struct IsoImage {
    file: File,
    descriptor: VolumeDescriptor,
}

impl IsoImage {
    /// Opens an image file and parses its primary volume descriptor.
    ///
    /// # Errors
    ///
    /// [`FormatError::NotFound`] if the path doesn't exist,
    /// [`FormatError::Truncated`] if the image ends before sector 16,
    /// [`FormatError::BadSignature`] if the magic bytes don't match.
    pub fn open(path: &Path) -> Result<Self, FormatError> {
        if !path.exists() {
            return Err(FormatError::NotFound);
        }

        let mut file = File::open(path)?;

        let mut sector = vec![0_u8; SECTOR_SIZE];
        read_exact_at(&mut file, PVD_SECTOR * SECTOR_SIZE as u64, &mut sector)
            .ok_or(FormatError::Truncated)??;

        let descriptor = VolumeDescriptor::parse(&sector)?;

        Ok(Self { file, descriptor })
    }

    /// Returns the parsed volume descriptor.
    #[must_use]
    pub fn descriptor(&self) -> &VolumeDescriptor {
        &self.descriptor
    }

    /// Returns the volume label, trimmed of trailing padding.
    #[must_use]
    pub fn label(&self) -> Option<&str> {
        self.descriptor.label.as_deref()
    }

    /// Returns the raw creation timestamp field.
    #[must_use]
    pub fn created(&self) -> Option<&str> {
        self.descriptor.created.as_deref()
    }

    /// Checks for evidence that the image boots: an El Torito boot record
    /// at sector 17, or a 0x55AA marker closing the conventional boot
    /// sector. Absence of both is advisory, never an error.
    pub fn is_bootable(&mut self) -> bool {
        let mut sector = vec![0_u8; SECTOR_SIZE];
        if let Some(Ok(())) = read_exact_at(
            &mut self.file,
            BOOT_RECORD_SECTOR * SECTOR_SIZE as u64,
            &mut sector,
        ) {
            if sector
                .windows(EL_TORITO_MAGIC.len())
                .any(|w| w == EL_TORITO_MAGIC)
            {
                return true;
            }
        }

        let mut boot_sector = [0_u8; BOOT_SECTOR_LEN];
        if let Some(Ok(())) = read_exact_at(&mut self.file, BOOT_SECTOR_OFFSET, &mut boot_sector) {
            return boot_sector[BOOT_SECTOR_LEN - 2..] == BOOT_SECTOR_MAGIC;
        }

        false
    }

    /// Gathers the one-call summary of the image.
    ///
    /// # Errors
    ///
    /// If the image file's metadata can't be read.
    pub fn info(&mut self) -> Result<ImageInfo, FormatError> {
        let size_bytes = self.file.metadata()?.len();

        Ok(ImageInfo {
            size_bytes,
            label: self.descriptor.label.clone(),
            bootable: self.is_bootable(),
            created: self.descriptor.created.clone(),
        })
    }

    /// Walks the directory tree lazily, depth-first and pre-order,
    /// starting below the root (the root itself is not enumerated).
    ///
    /// The iterator is single-pass and not restartable; call `entries`
    /// again to walk the image anew. Damaged directories truncate their
    /// own listing silently rather than aborting the walk.
    pub fn entries(&mut self) -> Entries<'_> {
        let root_lba = self.descriptor.root_extent_lba;
        let root_size = self.descriptor.root_extent_size;

        let mut entries = Entries {
            image: self,
            stack: Vec::new(),
        };
        entries.descend(PathBuf::new(), root_lba, root_size);

        entries
    }

    /// Copies exactly `size` bytes starting at sector `lba` into `writer`,
    /// in 8 KiB chunks.
    ///
    /// # Errors
    ///
    /// If reading the image or writing the destination fails; a short read
    /// surfaces as [`std::io::ErrorKind::UnexpectedEof`].
    pub fn copy_extent_to(
        &mut self,
        lba: u32,
        size: u32,
        writer: &mut impl std::io::Write,
    ) -> Result<(), std::io::Error> {
        const CHUNK: usize = 8192;

        self.file
            .seek(SeekFrom::Start(u64::from(lba) * SECTOR_SIZE as u64))?;

        let mut buf = [0_u8; CHUNK];
        let mut remaining = size as usize;
        while remaining > 0 {
            let want = remaining.min(CHUNK);
            self.file.read_exact(&mut buf[..want])?;
            writer.write_all(&buf[..want])?;
            remaining -= want;
        }

        Ok(())
    }

    fn read_extent(&mut self, lba: u32, size: u32) -> Result<Vec<u8>, std::io::Error> {
        self.file
            .seek(SeekFrom::Start(u64::from(lba) * SECTOR_SIZE as u64))?;

        let mut data = vec![0_u8; size as usize];
        self.file.read_exact(&mut data)?;

        Ok(data)
    }
}

/// Seeks and fills `buf`; `None` stands for a short read.
fn read_exact_at(
    file: &mut File,
    offset: u64,
    buf: &mut [u8],
) -> Option<Result<(), std::io::Error>> {
    if let Err(e) = file.seek(SeekFrom::Start(offset)) {
        return Some(Err(e));
    }

    match file.read_exact(buf) {
        Ok(()) => Some(Ok(())),
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => None,
        Err(e) => Some(Err(e)),
    }
}

struct Frame {
    data: Vec<u8>,
    offset: usize,
    path: PathBuf,
}

/// Lazy pre-order walk over an image's directory tree
///
/// Created by [`IsoImage::entries`].
pub struct Entries<'a> {
    image: &'a mut IsoImage,
    stack: Vec<Frame>,
}

impl Entries<'_> {
    fn descend(&mut self, path: PathBuf, lba: u32, size: u32) {
        match self.image.read_extent(lba, size) {
            Ok(data) => self.stack.push(Frame {
                data,
                offset: 0,
                path,
            }),
            Err(e) => {
                warn!(
                    "Couldn't read directory extent at sector {lba}: {e}. Skipping its contents."
                );
            }
        }
    }
}

impl core::fmt::Debug for Entries<'_> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Entries")
            .field("depth", &self.stack.len())
            .finish_non_exhaustive()
    }
}

impl Iterator for Entries<'_> {
    type Item = Entry;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let frame = self.stack.last_mut()?;

            let record = match scan_record(&frame.data, frame.offset) {
                ScanStep::Record(record, next_offset) => {
                    frame.offset = next_offset;
                    record
                }
                ScanStep::Padding(next_offset) => {
                    frame.offset = next_offset;
                    continue;
                }
                ScanStep::End => {
                    self.stack.pop();
                    continue;
                }
            };

            let Some(name) = record.identifier else {
                continue;
            };

            let path = frame.path.join(&name);

            if record.is_directory {
                if record.size > 0 {
                    self.descend(path.clone(), record.extent_lba, record.size);
                }

                return Some(Entry {
                    path,
                    kind: EntryKind::Directory,
                    extent_lba: record.extent_lba,
                    size: record.size,
                });
            }

            return Some(Entry {
                path,
                kind: EntryKind::File,
                extent_lba: record.extent_lba,
                size: record.size,
            });
        }
    }
}
