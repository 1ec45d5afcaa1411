//! Boot finalization
//!
//! Inspects the populated volume for known boot markers and marks the
//! first partition active. By contract this never fails the run: every
//! error here is logged and swallowed, since plenty of bootable images
//! use boot mechanisms this check doesn't enumerate.

use std::{fs, path::Path, process::Command, time::Duration};

use log::{info, warn};
use types::{PartitionScheme, TargetSystem};

use crate::{device::TargetDevice, util::run_with_timeout};

const ACTIVATE_TIMEOUT: Duration = Duration::from_secs(60);

/// Boot markers recognized at the volume root.
const BOOT_MARKERS: [&str; 4] = ["bootmgr", "boot", "efi", "isolinux"];

/// What the finalizer observed on the populated volume
#[derive(Clone, Debug, Default)]
pub(crate) struct BootEvidence {
    /// The recognized markers present at the volume root
    pub(crate) markers: Vec<String>,
}

/// Scans the volume root for the known boot markers, first path level
/// only, case-insensitively.
fn scan_markers(mount_root: &Path) -> Vec<String> {
    let entries = match fs::read_dir(mount_root) {
        Ok(entries) => entries,
        Err(e) => {
            warn!("Couldn't scan {} for boot markers: {e}", mount_root.display());
            return Vec::new();
        }
    };

    let mut markers = Vec::new();
    for entry in entries.flatten() {
        let name = entry.file_name().to_string_lossy().to_lowercase();

        if BOOT_MARKERS.contains(&name.as_str()) && !markers.contains(&name) {
            markers.push(name);
        }
    }

    markers.sort_unstable();
    markers
}

fn mark_partition_active(disk: &Path) {
    let res = run_with_timeout(
        Command::new("sfdisk")
            .arg("--activate")
            .arg(disk.as_os_str())
            .arg("1"),
        None,
        ACTIVATE_TIMEOUT,
    );

    match res {
        Ok(output) if output.status.success() => {
            info!("Marked partition 1 on {} active", disk.display());
        }
        Ok(output) => {
            warn!(
                "Couldn't mark partition 1 on {} active: {}",
                disk.display(),
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        Err(e) => {
            warn!("Couldn't mark partition 1 on {} active: {e}", disk.display());
        }
    }
}

/// The active flag only exists in an MBR; UEFI-only targets boot off the
/// ESP type instead, so activation is skipped for them.
fn needs_active_flag(scheme: PartitionScheme, system: TargetSystem) -> bool {
    scheme == PartitionScheme::Mbr && system != TargetSystem::UefiOnly
}

/// Finalizes boot metadata on the populated device. Infallible by design;
/// the returned evidence is advisory.
///
/// Partition 1 is marked active only for MBR runs targeting a BIOS-capable
/// system; GPT has no active flag and UEFI-only targets don't consult it.
pub(crate) fn finalize(
    target: &TargetDevice,
    scheme: PartitionScheme,
    system: TargetSystem,
    mount_root: &Path,
) -> BootEvidence {
    let markers = scan_markers(mount_root);

    if markers.is_empty() {
        info!("No recognized boot markers found; the image may use another boot mechanism");
    } else {
        info!("Boot markers found: {markers:?}");
    }

    if needs_active_flag(scheme, system) {
        mark_partition_active(&target.disk);
    }

    BootEvidence { markers }
}

#[cfg(test)]
mod tests {
    use std::fs::File;

    use super::*;
    use test_log::test;

    #[test]
    fn finds_markers_case_insensitively() {
        let root = tempfile::tempdir().unwrap();
        fs::create_dir(root.path().join("EFI")).unwrap();
        fs::create_dir(root.path().join("boot")).unwrap();
        File::create(root.path().join("BOOTMGR")).unwrap();
        File::create(root.path().join("README.TXT")).unwrap();

        let markers = scan_markers(root.path());
        assert_eq!(markers, vec!["boot", "bootmgr", "efi"]);
    }

    #[test]
    fn missing_markers_are_empty_not_fatal() {
        let root = tempfile::tempdir().unwrap();
        File::create(root.path().join("DATA.BIN")).unwrap();

        assert!(scan_markers(root.path()).is_empty());
    }

    #[test]
    fn scanning_is_idempotent() {
        let root = tempfile::tempdir().unwrap();
        fs::create_dir(root.path().join("isolinux")).unwrap();

        let first = scan_markers(root.path());
        let second = scan_markers(root.path());
        assert_eq!(first, second);
    }

    #[test]
    fn unreadable_root_yields_no_markers() {
        assert!(scan_markers(Path::new("/nonexistent/volume")).is_empty());
    }

    #[test]
    fn active_flag_is_mbr_bios_only() {
        assert!(needs_active_flag(
            PartitionScheme::Mbr,
            TargetSystem::BiosOrUefi
        ));
        assert!(needs_active_flag(
            PartitionScheme::Mbr,
            TargetSystem::BiosLegacy
        ));

        assert!(!needs_active_flag(
            PartitionScheme::Mbr,
            TargetSystem::UefiOnly
        ));
        assert!(!needs_active_flag(
            PartitionScheme::Gpt,
            TargetSystem::UefiOnly
        ));
    }
}
