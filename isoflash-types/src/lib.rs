#![doc = include_str!("../README.md")]

use core::fmt;

use serde::Serialize;

/// FAT32 volume labels are capped at 11 characters.
pub const MAX_LABEL_LEN: usize = 11;

/// Partition table scheme written to the target device
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, clap::ValueEnum)]
#[clap(rename_all = "lower")]
pub enum PartitionScheme {
    /// Master Boot Record partition table
    Mbr,

    /// GUID Partition Table
    Gpt,
}

impl fmt::Display for PartitionScheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Mbr => "MBR",
            Self::Gpt => "GPT",
        })
    }
}

/// Firmware the provisioned media is expected to boot on
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, clap::ValueEnum)]
#[clap(rename_all = "kebab-case")]
pub enum TargetSystem {
    /// Either BIOS or UEFI firmware
    BiosOrUefi,

    /// UEFI firmware only
    UefiOnly,

    /// Legacy BIOS firmware only
    BiosLegacy,
}

impl fmt::Display for TargetSystem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::BiosOrUefi => "BIOS or UEFI",
            Self::UefiOnly => "UEFI",
            Self::BiosLegacy => "BIOS (Legacy)",
        })
    }
}

/// Filesystem created on the target partition
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, clap::ValueEnum)]
#[clap(rename_all = "lower")]
pub enum FilesystemKind {
    /// FAT32, the broadly supported baseline
    Fat32,

    /// NTFS
    Ntfs,
}

impl fmt::Display for FilesystemKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Fat32 => "FAT32",
            Self::Ntfs => "NTFS",
        })
    }
}

/// Configuration rejected before any destructive operation
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The scheme / target system / filesystem combination can't boot
    #[error("{scheme} with {target} does not support {filesystem}")]
    Unsupported {
        /// Requested partition scheme
        scheme: PartitionScheme,

        /// Requested target system
        target: TargetSystem,

        /// Requested filesystem
        filesystem: FilesystemKind,
    },

    /// The volume label exceeds the FAT32 limit
    #[error("volume label {0:?} is longer than {MAX_LABEL_LEN} characters")]
    LabelTooLong(String),
}

/// Immutable description of one provisioning run, validated once against
/// the compatibility matrix before the run touches the device.
#[derive(Clone, Debug)]
pub struct ProvisioningConfig {
    /// Partition table scheme
    pub scheme: PartitionScheme,

    /// Target firmware
    pub target: TargetSystem,

    /// Filesystem for the data partition
    pub filesystem: FilesystemKind,

    /// Volume label, at most [`MAX_LABEL_LEN`] characters
    pub label: String,
}

impl ProvisioningConfig {
    /// Creates a configuration, checking the label length up front.
    ///
    /// # Errors
    ///
    /// [`ConfigError::LabelTooLong`] if the label exceeds the FAT32 limit.
    pub fn new(
        scheme: PartitionScheme,
        target: TargetSystem,
        filesystem: FilesystemKind,
        label: &str,
    ) -> Result<Self, ConfigError> {
        if label.chars().count() > MAX_LABEL_LEN {
            return Err(ConfigError::LabelTooLong(label.to_owned()));
        }

        Ok(Self {
            scheme,
            target,
            filesystem,
            label: label.to_owned(),
        })
    }

    /// Checks the scheme / target / filesystem combination against the
    /// compatibility matrix. Combinations outside the matrix silently
    /// produce unbootable media, so they are refused before formatting.
    ///
    /// # Errors
    ///
    /// [`ConfigError::Unsupported`] for any combination outside the matrix.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let ok = match (self.scheme, self.target) {
            (PartitionScheme::Mbr, TargetSystem::BiosOrUefi) => {
                self.filesystem == FilesystemKind::Fat32
            }
            (PartitionScheme::Mbr, TargetSystem::BiosLegacy) => true,
            (PartitionScheme::Gpt, TargetSystem::UefiOnly) => {
                self.filesystem == FilesystemKind::Fat32
            }
            (PartitionScheme::Mbr, TargetSystem::UefiOnly)
            | (PartitionScheme::Gpt, TargetSystem::BiosOrUefi | TargetSystem::BiosLegacy) => false,
        };

        if ok {
            Ok(())
        } else {
            Err(ConfigError::Unsupported {
                scheme: self.scheme,
                target: self.target,
                filesystem: self.filesystem,
            })
        }
    }
}
