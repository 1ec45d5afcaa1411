#![doc = include_str!("../../README.md")]

use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};
use iso9660::{EntryKind, ExtractPolicy, IsoImage};
use log::info;
use types::{FilesystemKind, PartitionScheme, ProvisioningConfig, TargetSystem, MAX_LABEL_LEN};

mod boot;
mod device;
mod flasher;
mod format;
mod mount;
mod progress;
mod util;

use crate::device::TargetDevice;

#[derive(Parser)]
#[command(version, about = "ISO Image to Bootable USB Utility")]
struct Cli {
    #[command(subcommand)]
    command: CliCommand,
}

#[derive(Subcommand)]
enum CliCommand {
    /// Print image metadata
    Inspect {
        #[arg(help = "ISO Image Path")]
        image: PathBuf,
    },

    /// List the image's directory tree
    List {
        #[arg(help = "ISO Image Path")]
        image: PathBuf,
    },

    /// Extract the image into a directory
    Extract {
        #[arg(help = "ISO Image Path")]
        image: PathBuf,

        #[arg(help = "Output Directory")]
        output_dir: PathBuf,

        #[arg(long, help = "Abort on the first unreadable entry")]
        fail_fast: bool,
    },

    /// List attached removable devices
    Devices,

    /// Write the image to a removable device and make it bootable
    Flash {
        #[arg(help = "ISO Image Path")]
        image: PathBuf,

        #[arg(help = "Target Device Node (e.g. /dev/sdb)")]
        device: PathBuf,

        #[arg(long, value_enum, default_value = "mbr")]
        scheme: PartitionScheme,

        #[arg(long, value_enum, default_value = "bios-or-uefi")]
        target: TargetSystem,

        #[arg(long, value_enum, default_value = "fat32")]
        fs: FilesystemKind,

        #[arg(long, help = "Volume label (defaults to the image's label)")]
        label: Option<String>,

        #[arg(long, help = "Abort on the first unreadable entry")]
        fail_fast: bool,
    },
}

fn policy(fail_fast: bool) -> ExtractPolicy {
    if fail_fast {
        ExtractPolicy::FailFast
    } else {
        ExtractPolicy::BestEffort
    }
}

fn inspect(path: &Path) -> Result<(), anyhow::Error> {
    let mut image = IsoImage::open(path)?;
    let info = image.info()?;

    println!("{}: valid ISO 9660 image", path.display());
    println!("  Label:    {}", info.label.as_deref().unwrap_or("(none)"));
    println!("  Size:     {} bytes", info.size_bytes);
    println!("  Bootable: {}", if info.bootable { "yes" } else { "no" });
    println!(
        "  Created:  {}",
        info.created.as_deref().unwrap_or("(unset)")
    );

    Ok(())
}

fn list(path: &Path) -> Result<(), anyhow::Error> {
    let mut image = IsoImage::open(path)?;

    for entry in image.entries() {
        match entry.kind {
            EntryKind::Directory => println!("d {:>10} {}/", "", entry.path.display()),
            EntryKind::File => println!("f {:>10} {}", entry.size, entry.path.display()),
        }
    }

    Ok(())
}

fn extract_to(path: &Path, output_dir: &Path, fail_fast: bool) -> Result<(), anyhow::Error> {
    let mut image = IsoImage::open(path)?;

    let summary = iso9660::extract(&mut image, output_dir, policy(fail_fast), &mut |files| {
        info!("Extracted {files} files");
    })?;

    println!(
        "Extracted {} files ({} bytes) to {}",
        summary.files,
        summary.bytes,
        output_dir.display()
    );

    for skipped in &summary.skipped {
        println!("  skipped: {}", skipped.display());
    }

    Ok(())
}

fn devices() -> Result<(), anyhow::Error> {
    let devices = device::removable_devices()?;

    if devices.is_empty() {
        println!("No removable devices attached");
        return Ok(());
    }

    for dev in devices {
        println!(
            "{} {:>14} bytes  {}",
            dev.path.display(),
            dev.size_bytes,
            dev.label.as_deref().unwrap_or("-")
        );
    }

    Ok(())
}

/// A label the user didn't pick explicitly: the image's own, cut down to
/// what FAT32 accepts, or a bland default.
fn derive_label(image: &IsoImage) -> String {
    image
        .label()
        .map(|l| l.chars().take(MAX_LABEL_LEN).collect::<String>())
        .filter(|l| !l.is_empty())
        .unwrap_or_else(|| String::from("BOOTABLE"))
}

#[allow(clippy::too_many_arguments)]
fn flash(
    image_path: &Path,
    device_path: &Path,
    scheme: PartitionScheme,
    system: TargetSystem,
    fs: FilesystemKind,
    label: Option<String>,
    fail_fast: bool,
) -> Result<(), anyhow::Error> {
    if !nix::unistd::Uid::effective().is_root() {
        anyhow::bail!("flashing repartitions {}; run as root", device_path.display());
    }

    let label = match label {
        Some(label) => label,
        None => derive_label(&IsoImage::open(image_path)?),
    };

    let config = ProvisioningConfig::new(scheme, system, fs, &label)?;
    let target = TargetDevice::resolve(device_path)?;

    let worker = flasher::spawn_run(
        image_path.to_path_buf(),
        target,
        config,
        policy(fail_fast),
        |percent, status| println!("[{percent:>3}%] {status}"),
    );

    let report = worker
        .join()
        .map_err(|_| anyhow::anyhow!("provisioning worker panicked"))??;

    let skipped: Vec<_> = report.skipped().collect();
    if !skipped.is_empty() {
        println!("{} entries were skipped:", skipped.len());
        for path in skipped {
            println!("  {}", path.display());
        }
    }

    if !report.boot.markers.is_empty() {
        println!("Boot markers found: {}", report.boot.markers.join(", "));
    }

    Ok(())
}

fn main() -> Result<(), anyhow::Error> {
    env_logger::init();

    let cli = Cli::parse();

    info!(
        "Running {} {}",
        env!("CARGO_CRATE_NAME"),
        env!("CARGO_PKG_VERSION")
    );

    match cli.command {
        CliCommand::Inspect { image } => inspect(&image),
        CliCommand::List { image } => list(&image),
        CliCommand::Extract {
            image,
            output_dir,
            fail_fast,
        } => extract_to(&image, &output_dir, fail_fast),
        CliCommand::Devices => devices(),
        CliCommand::Flash {
            image,
            device,
            scheme,
            target,
            fs,
            label,
            fail_fast,
        } => flash(&image, &device, scheme, target, fs, label, fail_fast),
    }
}
