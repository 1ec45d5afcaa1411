//! Removable device enumeration and explicit target resolution
//!
//! The device a run destroys is always resolved once, up front, from the
//! caller-supplied path. Zero or several candidates are typed errors; the
//! code never guesses a disk.

use std::{
    io,
    path::{Path, PathBuf},
    process::Command,
    time::Duration,
};

use log::debug;
use serde::Deserialize;

use crate::util::run_with_timeout;

const LSBLK_TIMEOUT: Duration = Duration::from_secs(30);

/// Resolving or querying the target device failed
#[derive(Debug, thiserror::Error)]
pub(crate) enum DeviceError {
    /// No attached removable disk matches the given path
    #[error("no removable device matches {0}")]
    NotFound(PathBuf),

    /// Several attached removable disks match the given path
    #[error("device {path} is ambiguous: matches {candidates:?}")]
    Ambiguous {
        /// The path as given
        path: PathBuf,

        /// Every matching device
        candidates: Vec<PathBuf>,
    },

    /// The device carries no partition to work with
    #[error("device {0} has no partition")]
    NoPartition(PathBuf),

    /// lsblk's output didn't parse
    #[error("couldn't parse device listing")]
    Parse(#[from] serde_json::Error),

    /// Running the enumeration tool failed
    #[error("couldn't enumerate block devices")]
    Io(#[from] io::Error),
}

#[derive(Debug, Deserialize)]
struct LsblkPartition {
    path: PathBuf,
}

#[derive(Debug, Deserialize)]
struct LsblkDevice {
    path: PathBuf,

    #[serde(default)]
    rm: bool,

    #[serde(default)]
    label: Option<String>,

    #[serde(default)]
    size: u64,

    #[serde(default, rename = "children")]
    parts: Vec<LsblkPartition>,
}

#[derive(Debug, Deserialize)]
struct LsblkOutput {
    #[serde(rename = "blockdevices")]
    devices: Vec<LsblkDevice>,
}

/// One attached removable disk, as the enumeration boundary reports it
#[derive(Clone, Debug)]
pub(crate) struct RemovableDevice {
    /// Device node path
    pub(crate) path: PathBuf,

    /// Filesystem label of the first labelled child, if any
    pub(crate) label: Option<String>,

    /// Device capacity, in bytes
    pub(crate) size_bytes: u64,
}

fn lsblk(device: Option<&Path>) -> Result<Vec<LsblkDevice>, DeviceError> {
    let mut cmd = Command::new("lsblk");
    cmd.args(["--bytes", "--json", "--paths", "--output-all"]);

    if let Some(device) = device {
        cmd.arg(device.as_os_str());
    }

    let output = run_with_timeout(&mut cmd, None, LSBLK_TIMEOUT)?;
    if !output.status.success() {
        return Err(io::Error::other(format!("lsblk exited with {}", output.status)).into());
    }

    let parsed: LsblkOutput = serde_json::from_slice(&output.stdout)?;

    Ok(parsed.devices)
}

/// Lists the currently attached removable disks.
pub(crate) fn removable_devices() -> Result<Vec<RemovableDevice>, DeviceError> {
    let devices = lsblk(None)?
        .into_iter()
        .filter(|d| d.rm)
        .map(|d| RemovableDevice {
            path: d.path,
            label: d.label,
            size_bytes: d.size,
        })
        .collect();

    debug!("Removable devices: {devices:?}");

    Ok(devices)
}

/// The explicit identity of the disk a run operates on
#[derive(Clone, Debug)]
pub(crate) struct TargetDevice {
    /// Whole-disk device node
    pub(crate) disk: PathBuf,
}

impl TargetDevice {
    /// Resolves a caller-supplied path against the attached removable
    /// disks. The path must match exactly one of them, either verbatim or
    /// by device name (`sdb` for `/dev/sdb`).
    ///
    /// # Errors
    ///
    /// [`DeviceError::NotFound`] or [`DeviceError::Ambiguous`] when the
    /// match isn't exactly one device.
    pub(crate) fn resolve(path: &Path) -> Result<Self, DeviceError> {
        let removable = removable_devices()?;

        let candidates: Vec<PathBuf> = removable
            .into_iter()
            .map(|d| d.path)
            .filter(|p| p == path || p.file_name() == path.file_name())
            .collect();

        match candidates.as_slice() {
            [] => Err(DeviceError::NotFound(path.to_path_buf())),
            [disk] => Ok(Self { disk: disk.clone() }),
            _ => Err(DeviceError::Ambiguous {
                path: path.to_path_buf(),
                candidates,
            }),
        }
    }

    /// Returns the device's first partition node, re-read from the
    /// enumeration boundary.
    ///
    /// # Errors
    ///
    /// [`DeviceError::NoPartition`] when the disk has none.
    pub(crate) fn first_partition(&self) -> Result<PathBuf, DeviceError> {
        let devices = lsblk(Some(&self.disk))?;

        devices
            .into_iter()
            .next()
            .and_then(|d| d.parts.into_iter().next())
            .map(|p| p.path)
            .ok_or_else(|| DeviceError::NoPartition(self.disk.clone()))
    }
}
