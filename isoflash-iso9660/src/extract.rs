//! Materializing an image's tree into a destination directory

use std::{
    fs::{self, File},
    io,
    path::{Component, Path, PathBuf},
};

use log::{debug, warn};

use crate::{error::ExtractError, Entry, EntryKind, IsoImage};

/// Files are counted and progress reported every this many files.
const PROGRESS_EVERY: u64 = 10;

/// What to do when a single entry fails to extract
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum ExtractPolicy {
    /// Log the failure, record the path in the summary, keep going
    #[default]
    BestEffort,

    /// Abort the extraction on the first per-file failure
    FailFast,
}

/// What an extraction accomplished
#[derive(Debug, Default)]
pub struct ExtractSummary {
    /// Number of files written
    pub files: u64,

    /// Total bytes written
    pub bytes: u64,

    /// Entries abandoned under [`ExtractPolicy::BestEffort`]
    pub skipped: Vec<PathBuf>,
}

/// Extracts every entry of the image below `dest`, creating directories
/// before their children and copying file data in bounded chunks.
///
/// `on_file` is called with the running file count after every tenth
/// file. Per-file failures follow `policy`; failures to create the
/// destination root or to walk the tree are always fatal.
///
/// # Errors
///
/// [`ExtractError::Io`] on fatal I/O failure, and under
/// [`ExtractPolicy::FailFast`] the first per-file failure as
/// [`ExtractError::File`] or [`ExtractError::PathEscape`].
pub fn extract(
    image: &mut IsoImage,
    dest: &Path,
    policy: ExtractPolicy,
    on_file: &mut dyn FnMut(u64),
) -> Result<ExtractSummary, ExtractError> {
    fs::create_dir_all(dest)?;

    // The walk borrows the image, the file copies below need it back.
    let entries: Vec<Entry> = image.entries().collect();

    let mut summary = ExtractSummary::default();

    for entry in entries {
        match extract_entry(image, dest, &entry) {
            Ok(()) => {
                if entry.kind == EntryKind::File {
                    summary.files += 1;
                    summary.bytes += u64::from(entry.size);

                    if summary.files % PROGRESS_EVERY == 0 {
                        on_file(summary.files);
                    }
                }
            }
            Err(e) => match policy {
                ExtractPolicy::BestEffort => {
                    warn!("Skipping {}: {e}", entry.path.display());
                    summary.skipped.push(entry.path);
                }
                ExtractPolicy::FailFast => return Err(e),
            },
        }
    }

    on_file(summary.files);

    Ok(summary)
}

/// Joins `path` under `root`, refusing anything that isn't a plain
/// descending relative path.
fn join_checked(root: &Path, path: &Path) -> Result<PathBuf, ExtractError> {
    if path
        .components()
        .any(|c| !matches!(c, Component::Normal(_)))
    {
        return Err(ExtractError::PathEscape(path.to_path_buf()));
    }

    Ok(root.join(path))
}

fn extract_entry(image: &mut IsoImage, dest: &Path, entry: &Entry) -> Result<(), ExtractError> {
    let target = join_checked(dest, &entry.path)?;

    match entry.kind {
        EntryKind::Directory => {
            fs::create_dir_all(&target).map_err(|source| ExtractError::File {
                path: entry.path.clone(),
                source,
            })?;
        }
        EntryKind::File => {
            debug!(
                "Extracting {} ({} bytes)",
                entry.path.display(),
                entry.size
            );

            write_file(image, entry, &target).map_err(|source| ExtractError::File {
                path: entry.path.clone(),
                source,
            })?;
        }
    }

    Ok(())
}

fn write_file(image: &mut IsoImage, entry: &Entry, target: &Path) -> Result<(), io::Error> {
    if let Some(parent) = target.parent() {
        fs::create_dir_all(parent)?;
    }

    let mut out = File::create(target)?;
    image.copy_extent_to(entry.extent_lba, entry.size, &mut out)?;

    Ok(())
}
