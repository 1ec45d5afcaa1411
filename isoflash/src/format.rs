//! Target device partitioning and formatting
//!
//! Formatting is an ordered list of strategies, each declaring which
//! scheme / filesystem combinations it can produce. The primary strategy
//! rebuilds the partition table; the fallback reformats whatever first
//! partition already exists, forced to FAT32 as the most broadly
//! supported baseline.

use std::{
    io,
    path::{Path, PathBuf},
    process::Command,
    time::Duration,
};

use log::{debug, info, warn};
use types::{FilesystemKind, PartitionScheme, ProvisioningConfig};

use crate::{device::TargetDevice, util::run_with_timeout};

/// Whole-sequence bound for one formatting strategy.
const FORMAT_TIMEOUT: Duration = Duration::from_secs(180);

/// Both formatting strategies failed
#[derive(Debug, thiserror::Error)]
pub(crate) enum FormatOpError {
    /// An external tool exited unsuccessfully
    #[error("`{command}` failed: {detail}")]
    CommandFailed {
        /// The tool that failed
        command: String,

        /// Exit status and captured stderr
        detail: String,
    },

    /// Spawning a tool, or its timeout, failed the strategy
    #[error("couldn't run formatting tools")]
    Io(#[from] io::Error),

    /// The fallback needed an existing partition and found none
    #[error(transparent)]
    Device(#[from] crate::device::DeviceError),

    /// Every strategy in the list failed
    #[error("all formatting strategies failed on {0}")]
    AllFailed(PathBuf),
}

fn run_tool(cmd: &mut Command, input: Option<&str>, name: &str) -> Result<(), FormatOpError> {
    let output = run_with_timeout(cmd, input, FORMAT_TIMEOUT)?;

    if !output.status.success() {
        return Err(FormatOpError::CommandFailed {
            command: name.to_owned(),
            detail: format!(
                "{}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            ),
        });
    }

    Ok(())
}

/// Derives the first partition's device node from the disk node.
fn partition_node(disk: &Path, index: u32) -> PathBuf {
    let disk_str = disk.to_string_lossy();

    // /dev/mmcblk0 and /dev/nvme0n1 take a "p" separator, /dev/sdb doesn't.
    if disk_str.ends_with(|c: char| c.is_ascii_digit()) {
        PathBuf::from(format!("{disk_str}p{index}"))
    } else {
        PathBuf::from(format!("{disk_str}{index}"))
    }
}

fn mkfs(partition: &Path, filesystem: FilesystemKind, label: &str) -> Result<(), FormatOpError> {
    match filesystem {
        FilesystemKind::Fat32 => {
            debug!("Creating FAT32 filesystem on {}", partition.display());

            run_tool(
                Command::new("mkfs.vfat")
                    .args(["-F", "32", "-n", label])
                    .arg(partition.as_os_str()),
                None,
                "mkfs.vfat",
            )
        }
        FilesystemKind::Ntfs => {
            debug!("Creating NTFS filesystem on {}", partition.display());

            run_tool(
                Command::new("mkfs.ntfs")
                    .args(["-f", "-L", label])
                    .arg(partition.as_os_str()),
                None,
                "mkfs.ntfs",
            )
        }
    }
}

/// One way of producing a formatted partition on a disk
pub(crate) trait FormatStrategy {
    /// Strategy name, for logs.
    fn name(&self) -> &'static str;

    /// Whether this strategy can produce the requested combination.
    fn supports(&self, scheme: PartitionScheme, filesystem: FilesystemKind) -> bool;

    /// Produces a formatted partition and returns its device node.
    ///
    /// # Errors
    ///
    /// If any of the strategy's external tools fails or times out.
    fn format(
        &self,
        target: &TargetDevice,
        config: &ProvisioningConfig,
    ) -> Result<PathBuf, FormatOpError>;
}

/// Primary strategy: wipe the disk, script a fresh single-partition table
/// through sfdisk (the scripted partitioning subsystem), then mkfs.
#[derive(Debug)]
pub(crate) struct SfdiskStrategy;

impl SfdiskStrategy {
    fn script(config: &ProvisioningConfig) -> String {
        match config.scheme {
            // One primary partition covering the disk, marked active.
            // Type c is W95 FAT32 (LBA), type 7 is NTFS.
            PartitionScheme::Mbr => {
                let part_type = match config.filesystem {
                    FilesystemKind::Fat32 => "c",
                    FilesystemKind::Ntfs => "7",
                };

                format!("label: dos\n- - {part_type} *\n")
            }
            // The matrix only lets FAT32 through here; U is the EFI
            // System Partition type.
            PartitionScheme::Gpt => "label: gpt\n- - U -\n".to_owned(),
        }
    }
}

impl FormatStrategy for SfdiskStrategy {
    fn name(&self) -> &'static str {
        "sfdisk"
    }

    fn supports(&self, _scheme: PartitionScheme, _filesystem: FilesystemKind) -> bool {
        true
    }

    fn format(
        &self,
        target: &TargetDevice,
        config: &ProvisioningConfig,
    ) -> Result<PathBuf, FormatOpError> {
        info!(
            "Partitioning {} as {} with one {} partition",
            target.disk.display(),
            config.scheme,
            config.filesystem
        );

        run_tool(
            Command::new("wipefs").arg("-a").arg(target.disk.as_os_str()),
            None,
            "wipefs",
        )?;

        run_tool(
            Command::new("sfdisk")
                .arg("--wipe")
                .arg("always")
                .arg(target.disk.as_os_str()),
            Some(&Self::script(config)),
            "sfdisk",
        )?;

        // Give the kernel a moment to publish the new partition node.
        if let Err(e) = run_with_timeout(
            Command::new("udevadm").arg("settle"),
            None,
            Duration::from_secs(10),
        ) {
            debug!("udevadm settle didn't complete: {e}");
        }

        let partition = partition_node(&target.disk, 1);
        mkfs(&partition, config.filesystem, &config.label)?;

        Ok(partition)
    }
}

/// Fallback strategy: leave the partition table alone and reformat the
/// existing first partition, forced to FAT32 whatever was requested.
#[derive(Debug)]
pub(crate) struct PlainMkfsStrategy;

impl FormatStrategy for PlainMkfsStrategy {
    fn name(&self) -> &'static str {
        "plain-mkfs"
    }

    fn supports(&self, _scheme: PartitionScheme, _filesystem: FilesystemKind) -> bool {
        // The scheme is whatever is already on the disk, and the
        // filesystem is downgraded, so nothing is refused.
        true
    }

    fn format(
        &self,
        target: &TargetDevice,
        config: &ProvisioningConfig,
    ) -> Result<PathBuf, FormatOpError> {
        let partition = target.first_partition()?;

        if config.filesystem != FilesystemKind::Fat32 {
            warn!(
                "Falling back to FAT32 on {} instead of {}",
                partition.display(),
                config.filesystem
            );
        }

        mkfs(&partition, FilesystemKind::Fat32, &config.label)?;

        Ok(partition)
    }
}

/// Formats a device for a run
pub(crate) trait DeviceFormatter {
    /// Produces a formatted partition on the target, returning its node.
    ///
    /// # Errors
    ///
    /// [`FormatOpError::AllFailed`] once every usable strategy failed.
    fn format(
        &mut self,
        target: &TargetDevice,
        config: &ProvisioningConfig,
    ) -> Result<PathBuf, FormatOpError>;
}

/// Walks the strategy list in order, falling through on failure
#[derive(Debug)]
pub(crate) struct StrategyFormatter {
    strategies: Vec<Box<dyn FormatStrategy>>,
}

impl core::fmt::Debug for Box<dyn FormatStrategy> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.name())
    }
}

impl Default for StrategyFormatter {
    fn default() -> Self {
        Self {
            strategies: vec![Box::new(SfdiskStrategy), Box::new(PlainMkfsStrategy)],
        }
    }
}

impl DeviceFormatter for StrategyFormatter {
    fn format(
        &mut self,
        target: &TargetDevice,
        config: &ProvisioningConfig,
    ) -> Result<PathBuf, FormatOpError> {
        for strategy in &self.strategies {
            if !strategy.supports(config.scheme, config.filesystem) {
                debug!(
                    "Strategy {} doesn't support {} / {}, skipping",
                    strategy.name(),
                    config.scheme,
                    config.filesystem
                );
                continue;
            }

            match strategy.format(target, config) {
                Ok(partition) => {
                    info!(
                        "Strategy {} formatted {}",
                        strategy.name(),
                        partition.display()
                    );

                    return Ok(partition);
                }
                Err(e) => {
                    warn!("Strategy {} failed: {e}. Trying the next one.", strategy.name());
                }
            }
        }

        Err(FormatOpError::AllFailed(target.disk.clone()))
    }
}
