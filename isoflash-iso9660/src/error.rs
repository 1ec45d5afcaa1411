//! Error types for image parsing and extraction

use std::{io, path::PathBuf};

/// The image file does not parse as ISO 9660
#[derive(Debug, thiserror::Error)]
pub enum FormatError {
    /// The image file does not exist
    #[error("image file not found")]
    NotFound,

    /// The magic bytes at sector 16 are not `CD001`
    #[error("invalid ISO 9660 signature")]
    BadSignature,

    /// The image ends before a fixed structure it must contain
    #[error("image truncated")]
    Truncated,

    /// Any other I/O failure while reading the image
    #[error("I/O error reading image")]
    Io(#[from] io::Error),
}

/// Extraction failed as a whole
///
/// Per-file failures under [`ExtractPolicy::BestEffort`] are collected in
/// the [`ExtractSummary`] instead of being raised.
///
/// [`ExtractPolicy::BestEffort`]: crate::ExtractPolicy::BestEffort
/// [`ExtractSummary`]: crate::ExtractSummary
#[derive(Debug, thiserror::Error)]
pub enum ExtractError {
    /// Creating the destination root or walking the tree failed
    #[error("I/O error during extraction")]
    Io(#[from] io::Error),

    /// A single entry failed under [`ExtractPolicy::FailFast`]
    ///
    /// [`ExtractPolicy::FailFast`]: crate::ExtractPolicy::FailFast
    #[error("failed to extract {path}")]
    File {
        /// Entry path relative to the destination root
        path: PathBuf,

        /// Underlying failure
        #[source]
        source: io::Error,
    },

    /// An entry path would land outside the destination root
    #[error("entry path {0} escapes the destination root")]
    PathEscape(PathBuf),
}
