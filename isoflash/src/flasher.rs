//! The provisioning run: format, stage, extract, copy, finalize
//!
//! One strictly sequential pass per target device. The staging directory
//! is a [`tempfile::TempDir`], so its removal on every exit path is a
//! property of scope, not of error-handler placement.

use std::{
    fs::{self, File},
    io::{self, Read as _, Write as _},
    path::{Path, PathBuf},
    thread,
};

use iso9660::{extract, ExtractError, ExtractPolicy, ExtractSummary, FormatError, IsoImage};
use log::{debug, info, warn};
use types::{ConfigError, ProvisioningConfig};

use crate::{
    boot::{self, BootEvidence},
    device::{DeviceError, TargetDevice},
    format::{DeviceFormatter, FormatOpError, StrategyFormatter},
    mount::{PartitionMounter, SysMounter},
    progress::{Band, ProgressSink},
};

const COPY_CHUNK: usize = 8192;

/// The stage a run is in, in order; runs never branch back.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum Stage {
    /// Gate against the compatibility matrix and the image signature
    ValidatingConfig,

    /// Partition and format the target device
    Formatting,

    /// Create the run-owned staging directory
    CreatingStaging,

    /// Extract the image into staging
    Extracting,

    /// Copy the staged tree onto the device
    Copying,

    /// Inspect boot markers and mark the partition active
    Finalizing,

    /// Remove the staging directory
    CleaningUp,
}

impl core::fmt::Display for Stage {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(match self {
            Self::ValidatingConfig => "validating the configuration",
            Self::Formatting => "formatting the target device",
            Self::CreatingStaging => "creating the staging directory",
            Self::Extracting => "extracting the image",
            Self::Copying => "copying to the device",
            Self::Finalizing => "finalizing boot metadata",
            Self::CleaningUp => "cleaning up",
        })
    }
}

/// Whatever terminated a stage
#[derive(Debug, thiserror::Error)]
pub(crate) enum StageError {
    /// The configuration failed the compatibility matrix
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// The image doesn't parse as ISO 9660
    #[error(transparent)]
    Image(#[from] FormatError),

    /// Every formatting strategy failed
    #[error(transparent)]
    Format(#[from] FormatOpError),

    /// Extraction failed as a whole
    #[error(transparent)]
    Extract(#[from] ExtractError),

    /// The target device couldn't be queried
    #[error(transparent)]
    Device(#[from] DeviceError),

    /// Any other I/O failure
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// A run's terminal failure, carrying the stage it happened in
#[derive(Debug, thiserror::Error)]
#[error("error while {stage}: {source}")]
pub(crate) struct ProvisioningError {
    /// The stage that failed
    pub(crate) stage: Stage,

    /// What failed it
    #[source]
    pub(crate) source: StageError,
}

/// What a successful run accomplished
#[derive(Debug)]
pub(crate) struct FlashReport {
    /// Extraction counters, including paths skipped under best-effort
    pub(crate) extracted: ExtractSummary,

    /// Files copied onto the device
    pub(crate) copied_files: u64,

    /// Paths skipped during the copy under best-effort
    pub(crate) copy_skipped: Vec<PathBuf>,

    /// Advisory boot evidence from the finalizer
    pub(crate) boot: BootEvidence,
}

impl FlashReport {
    /// Every path abandoned by the run's best-effort stages.
    pub(crate) fn skipped(&self) -> impl Iterator<Item = &PathBuf> {
        self.extracted.skipped.iter().chain(self.copy_skipped.iter())
    }
}

/// Runs the whole provisioning pipeline against a resolved target.
///
/// Progress lands on `progress` from the calling thread at stage-defined
/// checkpoints; on failure the final report is `0%` with the error text.
///
/// # Errors
///
/// The first stage-level failure, tagged with its [`Stage`]. Per-file
/// failures under [`ExtractPolicy::BestEffort`] don't fail the run and
/// are listed in the [`FlashReport`] instead.
pub(crate) fn run(
    image_path: &Path,
    target: &TargetDevice,
    config: &ProvisioningConfig,
    policy: ExtractPolicy,
    progress: &mut dyn ProgressSink,
) -> Result<FlashReport, ProvisioningError> {
    run_with(
        &mut StrategyFormatter::default(),
        &mut SysMounter,
        None,
        image_path,
        target,
        config,
        policy,
        progress,
    )
}

/// Runs the pipeline on a dedicated worker thread.
///
/// There is exactly one worker per run, and the run owns its progress
/// state for its whole lifetime; callers must not start a second run
/// against the same device while one is in flight.
pub(crate) fn spawn_run(
    image_path: PathBuf,
    target: TargetDevice,
    config: ProvisioningConfig,
    policy: ExtractPolicy,
    mut progress: impl FnMut(u8, &str) + Send + 'static,
) -> thread::JoinHandle<Result<FlashReport, ProvisioningError>> {
    thread::spawn(move || run(&image_path, &target, &config, policy, &mut progress))
}

#[allow(clippy::too_many_arguments)]
pub(crate) fn run_with(
    formatter: &mut dyn DeviceFormatter,
    mounter: &mut dyn PartitionMounter,
    staging_in: Option<&Path>,
    image_path: &Path,
    target: &TargetDevice,
    config: &ProvisioningConfig,
    policy: ExtractPolicy,
    progress: &mut dyn ProgressSink,
) -> Result<FlashReport, ProvisioningError> {
    let result = drive(
        formatter, mounter, staging_in, image_path, target, config, policy, progress,
    );

    match result {
        Ok(report) => {
            progress.report(100, "Flash completed successfully!");
            Ok(report)
        }
        Err(e) => {
            // Progress isn't left at its last partial value: a failed run
            // ends at 0 so nobody mistakes it for a completed one.
            progress.report(0, &format!("Error: {e}"));
            Err(e)
        }
    }
}

fn fail(stage: Stage) -> impl FnOnce(StageError) -> ProvisioningError {
    move |source| ProvisioningError { stage, source }
}

#[allow(clippy::too_many_arguments)]
fn drive(
    formatter: &mut dyn DeviceFormatter,
    mounter: &mut dyn PartitionMounter,
    staging_in: Option<&Path>,
    image_path: &Path,
    target: &TargetDevice,
    config: &ProvisioningConfig,
    policy: ExtractPolicy,
    progress: &mut dyn ProgressSink,
) -> Result<FlashReport, ProvisioningError> {
    let mut stage = Stage::ValidatingConfig;
    progress.report(Band::VALIDATE.start(), "Validating inputs...");

    config
        .validate()
        .map_err(StageError::from)
        .map_err(fail(stage))?;

    // The signature gate runs before anything destructive.
    let mut image = IsoImage::open(image_path)
        .map_err(StageError::from)
        .map_err(fail(stage))?;

    info!(
        "Flashing {} (label {:?}) to {}",
        image_path.display(),
        image.label(),
        target.disk.display()
    );

    stage = Stage::Formatting;
    progress.report(Band::FORMAT.start(), "Preparing USB drive...");

    let partition = formatter
        .format(target, config)
        .map_err(StageError::from)
        .map_err(fail(stage))?;

    let volume = mounter
        .mount(&partition)
        .map_err(StageError::from)
        .map_err(fail(stage))?;

    stage = Stage::CreatingStaging;
    progress.report(Band::STAGING.start(), "Creating temporary folder...");

    let mut staging = tempfile::Builder::new();
    staging.prefix(".iso_extract_");
    let staging = match staging_in {
        Some(parent) => staging.tempdir_in(parent),
        None => staging.tempdir(),
    }
    .map_err(StageError::from)
    .map_err(fail(stage))?;

    debug!("Staging directory is {}", staging.path().display());

    stage = Stage::Extracting;
    progress.report(
        Band::EXTRACT.start(),
        "Extracting ISO to temporary folder...",
    );

    let extracted = extract(&mut image, staging.path(), policy, &mut |files| {
        progress.report(
            Band::EXTRACT.at(files, 100),
            &format!("Extracting files... ({files} files)"),
        );
    })
    .map_err(StageError::from)
    .map_err(fail(stage))?;

    stage = Stage::Copying;
    progress.report(Band::COPY.start(), "Copying files to USB drive...");

    let copied = copy_tree(staging.path(), volume.root(), policy, progress).map_err(fail(stage))?;

    stage = Stage::Finalizing;
    progress.report(Band::FINALIZE.start(), "Making drive bootable...");

    let boot = boot::finalize(target, config.scheme, config.target, volume.root());

    stage = Stage::CleaningUp;
    progress.report(Band::CLEANUP.start(), "Cleaning up temporary files...");

    // Explicit removal; the TempDir guard is the backstop for the error
    // paths above.
    staging
        .close()
        .map_err(StageError::from)
        .map_err(fail(stage))?;

    drop(volume);

    Ok(FlashReport {
        extracted,
        copied_files: copied.copied,
        copy_skipped: copied.skipped,
        boot,
    })
}

#[derive(Debug, Default)]
struct CopyOutcome {
    copied: u64,
    skipped: Vec<PathBuf>,
}

fn count_files(dir: &Path) -> Result<u64, io::Error> {
    let mut count = 0;
    for entry in fs::read_dir(dir)? {
        let entry = entry?;

        if entry.file_type()?.is_dir() {
            count += count_files(&entry.path())?;
        } else {
            count += 1;
        }
    }

    Ok(count)
}

/// Copies one file in bounded chunks, the same discipline extraction
/// uses against the image.
fn copy_file_chunked(src: &Path, dst: &Path) -> Result<(), io::Error> {
    let mut reader = File::open(src)?;
    let mut writer = File::create(dst)?;

    let mut buf = [0_u8; COPY_CHUNK];
    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }

        writer.write_all(&buf[..n])?;
    }

    Ok(())
}

/// Mirrors the staged tree onto the mounted volume. Directory creation
/// failures are structural and fatal; per-file failures follow `policy`.
fn copy_tree(
    src_root: &Path,
    dst_root: &Path,
    policy: ExtractPolicy,
    progress: &mut dyn ProgressSink,
) -> Result<CopyOutcome, StageError> {
    let total = count_files(src_root)?;
    let mut outcome = CopyOutcome::default();

    copy_dir(src_root, dst_root, src_root, policy, total, &mut outcome, progress)?;

    Ok(outcome)
}

#[allow(clippy::too_many_arguments)]
fn copy_dir(
    src: &Path,
    dst: &Path,
    src_root: &Path,
    policy: ExtractPolicy,
    total: u64,
    outcome: &mut CopyOutcome,
    progress: &mut dyn ProgressSink,
) -> Result<(), StageError> {
    fs::create_dir_all(dst)?;

    for entry in fs::read_dir(src)? {
        let entry = entry?;
        let src_path = entry.path();
        let dst_path = dst.join(entry.file_name());

        if entry.file_type()?.is_dir() {
            copy_dir(
                &src_path, &dst_path, src_root, policy, total, outcome, progress,
            )?;
            continue;
        }

        match copy_file_chunked(&src_path, &dst_path) {
            Ok(()) => {
                outcome.copied += 1;
                progress.report(
                    Band::COPY.at(outcome.copied, total),
                    &format!("Copying to USB... ({}/{total})", outcome.copied),
                );
            }
            Err(e) => {
                let rel = src_path
                    .strip_prefix(src_root)
                    .unwrap_or(&src_path)
                    .to_path_buf();

                match policy {
                    ExtractPolicy::BestEffort => {
                        warn!("Skipping {}: {e}", rel.display());
                        outcome.skipped.push(rel);
                    }
                    ExtractPolicy::FailFast => {
                        return Err(ExtractError::File {
                            path: rel,
                            source: e,
                        }
                        .into());
                    }
                }
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use std::fs;

    use test_log::test;
    use types::{FilesystemKind, PartitionScheme, TargetSystem};

    use super::*;
    use crate::mount::MountedVolume;

    struct StubFormatter {
        fail: bool,
        partition: PathBuf,
        calls: usize,
    }

    impl StubFormatter {
        fn ok(partition: &Path) -> Self {
            Self {
                fail: false,
                partition: partition.to_path_buf(),
                calls: 0,
            }
        }

        fn failing() -> Self {
            Self {
                fail: true,
                partition: PathBuf::new(),
                calls: 0,
            }
        }
    }

    impl DeviceFormatter for StubFormatter {
        fn format(
            &mut self,
            target: &TargetDevice,
            _config: &ProvisioningConfig,
        ) -> Result<PathBuf, FormatOpError> {
            self.calls += 1;

            if self.fail {
                Err(FormatOpError::AllFailed(target.disk.clone()))
            } else {
                Ok(self.partition.clone())
            }
        }
    }

    struct StubVolume(PathBuf);

    impl MountedVolume for StubVolume {
        fn root(&self) -> &Path {
            &self.0
        }
    }

    struct StubMounter {
        root: PathBuf,
    }

    impl PartitionMounter for StubMounter {
        fn mount(&mut self, _partition: &Path) -> Result<Box<dyn MountedVolume>, io::Error> {
            Ok(Box::new(StubVolume(self.root.clone())))
        }
    }

    fn write_record(data: &mut [u8], offset: &mut usize, lba: u32, size: u32, flags: u8, name: &[u8]) {
        let mut len = 33 + name.len();
        if len % 2 != 0 {
            len += 1;
        }

        let rec = &mut data[*offset..*offset + len];
        rec[0] = u8::try_from(len).unwrap();
        rec[2..6].copy_from_slice(&lba.to_le_bytes());
        rec[10..14].copy_from_slice(&size.to_le_bytes());
        rec[25] = flags;
        rec[32] = u8::try_from(name.len()).unwrap();
        rec[33..33 + name.len()].copy_from_slice(name);

        *offset += len;
    }

    /// One-file ISO: PVD at 16, root directory at 18, `A.TXT` at 19.
    fn test_iso(dir: &Path) -> PathBuf {
        let mut data = vec![0_u8; 20 * 2048];

        let pvd = 16 * 2048;
        data[pvd] = 1;
        data[pvd + 1..pvd + 6].copy_from_slice(b"CD001");
        data[pvd + 40..pvd + 47].copy_from_slice(b"TESTVOL");
        data[pvd + 47..pvd + 72].fill(b' ');
        data[pvd + 158..pvd + 162].copy_from_slice(&18_u32.to_le_bytes());
        data[pvd + 166..pvd + 170].copy_from_slice(&2048_u32.to_le_bytes());

        let mut offset = 18 * 2048;
        write_record(&mut data, &mut offset, 18, 2048, 0x02, b"\x00");
        write_record(&mut data, &mut offset, 18, 2048, 0x02, b"\x01");
        write_record(&mut data, &mut offset, 19, 10, 0x00, b"A.TXT;1");
        data[19 * 2048..19 * 2048 + 10].copy_from_slice(b"0123456789");

        let path = dir.join("test.iso");
        fs::write(&path, &data).unwrap();
        path
    }

    fn target() -> TargetDevice {
        TargetDevice {
            disk: PathBuf::from("/dev/null"),
        }
    }

    fn gpt_config() -> ProvisioningConfig {
        ProvisioningConfig::new(
            PartitionScheme::Gpt,
            TargetSystem::UefiOnly,
            FilesystemKind::Fat32,
            "TESTVOL",
        )
        .unwrap()
    }

    fn staging_leftovers(parent: &Path) -> usize {
        fs::read_dir(parent).unwrap().count()
    }

    #[test]
    fn invalid_config_rejected_before_formatting() {
        let scratch = tempfile::tempdir().unwrap();
        let image = test_iso(scratch.path());

        let config = ProvisioningConfig::new(
            PartitionScheme::Mbr,
            TargetSystem::BiosOrUefi,
            FilesystemKind::Ntfs,
            "TESTVOL",
        )
        .unwrap();

        let mut formatter = StubFormatter::failing();
        let mut mounter = StubMounter {
            root: scratch.path().join("vol"),
        };

        let mut reports = Vec::new();
        let err = run_with(
            &mut formatter,
            &mut mounter,
            None,
            &image,
            &target(),
            &config,
            ExtractPolicy::BestEffort,
            &mut |p: u8, s: &str| reports.push((p, s.to_owned())),
        )
        .unwrap_err();

        assert_eq!(err.stage, Stage::ValidatingConfig);
        assert_eq!(formatter.calls, 0, "formatting must not run");

        let last = reports.last().unwrap();
        assert_eq!(last.0, 0);
        assert!(last.1.starts_with("Error: "), "got {:?}", last.1);
    }

    #[test]
    fn bad_signature_rejected_before_formatting() {
        let scratch = tempfile::tempdir().unwrap();
        let image = test_iso(scratch.path());

        let mut data = fs::read(&image).unwrap();
        data[16 * 2048 + 1] = b'X';
        fs::write(&image, &data).unwrap();

        let mut formatter = StubFormatter::failing();
        let mut mounter = StubMounter {
            root: scratch.path().join("vol"),
        };

        let err = run_with(
            &mut formatter,
            &mut mounter,
            None,
            &image,
            &target(),
            &gpt_config(),
            ExtractPolicy::BestEffort,
            &mut crate::progress::Discard,
        )
        .unwrap_err();

        assert_eq!(err.stage, Stage::ValidatingConfig);
        assert!(matches!(
            err.source,
            StageError::Image(FormatError::BadSignature)
        ));
        assert_eq!(formatter.calls, 0);
    }

    #[test]
    fn format_failure_is_fatal() {
        let scratch = tempfile::tempdir().unwrap();
        let image = test_iso(scratch.path());
        let staging_parent = tempfile::tempdir().unwrap();

        let mut formatter = StubFormatter::failing();
        let mut mounter = StubMounter {
            root: scratch.path().join("vol"),
        };

        let err = run_with(
            &mut formatter,
            &mut mounter,
            Some(staging_parent.path()),
            &image,
            &target(),
            &gpt_config(),
            ExtractPolicy::BestEffort,
            &mut crate::progress::Discard,
        )
        .unwrap_err();

        assert_eq!(err.stage, Stage::Formatting);
        assert_eq!(staging_leftovers(staging_parent.path()), 0);
    }

    #[test]
    fn staging_removed_after_extract_failure() {
        let scratch = tempfile::tempdir().unwrap();
        let image = test_iso(scratch.path());
        let staging_parent = tempfile::tempdir().unwrap();
        let volume_root = tempfile::tempdir().unwrap();

        // Point A.TXT's extent past the end of the image.
        let mut data = fs::read(&image).unwrap();
        let record = 18 * 2048 + 68;
        data[record + 2..record + 6].copy_from_slice(&4000_u32.to_le_bytes());
        fs::write(&image, &data).unwrap();

        let mut formatter = StubFormatter::ok(&scratch.path().join("part"));
        let mut mounter = StubMounter {
            root: volume_root.path().to_path_buf(),
        };

        let err = run_with(
            &mut formatter,
            &mut mounter,
            Some(staging_parent.path()),
            &image,
            &target(),
            &gpt_config(),
            ExtractPolicy::FailFast,
            &mut crate::progress::Discard,
        )
        .unwrap_err();

        assert_eq!(err.stage, Stage::Extracting);
        assert_eq!(staging_leftovers(staging_parent.path()), 0);
    }

    #[test]
    fn staging_removed_after_copy_failure() {
        let scratch = tempfile::tempdir().unwrap();
        let image = test_iso(scratch.path());
        let staging_parent = tempfile::tempdir().unwrap();

        // The "mount root" is a plain file, so every copy into it fails.
        let bogus_root = scratch.path().join("not-a-dir");
        fs::write(&bogus_root, b"occupied").unwrap();

        let mut formatter = StubFormatter::ok(&scratch.path().join("part"));
        let mut mounter = StubMounter { root: bogus_root };

        let mut reports = Vec::new();
        let err = run_with(
            &mut formatter,
            &mut mounter,
            Some(staging_parent.path()),
            &image,
            &target(),
            &gpt_config(),
            ExtractPolicy::FailFast,
            &mut |p: u8, s: &str| reports.push((p, s.to_owned())),
        )
        .unwrap_err();

        assert_eq!(err.stage, Stage::Copying);
        assert_eq!(
            staging_leftovers(staging_parent.path()),
            0,
            "staging directory must not survive a failed run"
        );

        let last = reports.last().unwrap();
        assert_eq!(last.0, 0);
        assert!(last.1.contains("copying to the device"));
    }

    #[test]
    fn successful_run_copies_and_reports() {
        let scratch = tempfile::tempdir().unwrap();
        let image = test_iso(scratch.path());
        let staging_parent = tempfile::tempdir().unwrap();
        let volume_root = tempfile::tempdir().unwrap();

        let mut formatter = StubFormatter::ok(&scratch.path().join("part"));
        let mut mounter = StubMounter {
            root: volume_root.path().to_path_buf(),
        };

        let mut reports = Vec::new();
        let report = run_with(
            &mut formatter,
            &mut mounter,
            Some(staging_parent.path()),
            &image,
            &target(),
            &gpt_config(),
            ExtractPolicy::BestEffort,
            &mut |p: u8, s: &str| reports.push((p, s.to_owned())),
        )
        .unwrap();

        assert_eq!(formatter.calls, 1);
        assert_eq!(report.extracted.files, 1);
        assert_eq!(report.extracted.bytes, 10);
        assert_eq!(report.copied_files, 1);
        assert_eq!(report.skipped().count(), 0);

        let copied = fs::read(volume_root.path().join("A.TXT")).unwrap();
        assert_eq!(copied, b"0123456789");

        assert_eq!(staging_leftovers(staging_parent.path()), 0);

        let last = reports.last().unwrap();
        assert_eq!(last, &(100, "Flash completed successfully!".to_owned()));

        let mut previous = 0;
        for (percent, _) in &reports {
            assert!(*percent >= previous, "progress went backwards");
            previous = *percent;
        }
    }

    #[test]
    fn best_effort_survives_unreadable_entries() {
        let scratch = tempfile::tempdir().unwrap();
        let image = test_iso(scratch.path());
        let volume_root = tempfile::tempdir().unwrap();

        // Squat the destination file name with a directory so the single
        // file copy fails while the run keeps going.
        fs::create_dir(volume_root.path().join("A.TXT")).unwrap();

        let mut formatter = StubFormatter::ok(&scratch.path().join("part"));
        let mut mounter = StubMounter {
            root: volume_root.path().to_path_buf(),
        };

        let report = run_with(
            &mut formatter,
            &mut mounter,
            None,
            &image,
            &target(),
            &gpt_config(),
            ExtractPolicy::BestEffort,
            &mut crate::progress::Discard,
        )
        .unwrap();

        assert_eq!(report.copied_files, 0);
        let skipped: Vec<_> = report.skipped().collect();
        assert_eq!(skipped, vec![&PathBuf::from("A.TXT")]);
    }
}
