//! Mount-point ownership for the freshly formatted partition

use std::{
    io,
    path::{Path, PathBuf},
};

use log::{debug, error};
use sys_mount::{FilesystemType, Mount, Unmount as _, UnmountFlags};
use tempfile::TempDir;

/// A filesystem root populated by the copy stage
pub(crate) trait MountedVolume {
    /// The directory the volume is reachable at.
    fn root(&self) -> &Path;
}

/// Mounts partitions somewhere a run can write to
pub(crate) trait PartitionMounter {
    /// Mounts `partition` and hands back a guard that unmounts on drop.
    ///
    /// # Errors
    ///
    /// If creating the mount point or mounting fails.
    fn mount(&mut self, partition: &Path) -> Result<Box<dyn MountedVolume>, io::Error>;
}

/// The real mounter: a run-owned temporary mount point plus a
/// [`sys_mount::Mount`] with unmount-on-drop.
#[derive(Debug)]
pub(crate) struct SysMounter;

struct MountedPartition {
    dev: PathBuf,
    mount: Mount,

    // Dropped last, after the unmount.
    dir: TempDir,
}

impl MountedVolume for MountedPartition {
    fn root(&self) -> &Path {
        self.dir.path()
    }
}

impl Drop for MountedPartition {
    fn drop(&mut self) {
        debug!(
            "Unmounting {} from {}",
            self.dev.display(),
            self.dir.path().display()
        );

        let res = self.mount.unmount(UnmountFlags::DETACH);
        if let Err(e) = res {
            error!("Couldn't unmount {}: {e}", self.dev.display());
        }
    }
}

impl PartitionMounter for SysMounter {
    fn mount(&mut self, partition: &Path) -> Result<Box<dyn MountedVolume>, io::Error> {
        let dir = TempDir::new()?;

        debug!(
            "Mounting {} on {}",
            partition.display(),
            dir.path().display()
        );

        let mount = Mount::builder()
            .fstype(FilesystemType::Set(&["vfat", "ntfs"]))
            .mount(partition, dir.path())?;

        Ok(Box::new(MountedPartition {
            dev: partition.to_path_buf(),
            mount,
            dir,
        }))
    }
}
