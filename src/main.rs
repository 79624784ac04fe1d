use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};

use swraid::device::DiskFiles;
use swraid::raid::{RaidVolume, Status};

#[derive(Parser)]
#[command(name = "swraid", about = "Software RAID-5 volume manager over file-backed disks")]
struct Cli {
    /// Directory holding the device files.
    #[arg(short, long)]
    dir: PathBuf,

    /// Number of devices in the array.
    #[arg(short = 'n', long, default_value_t = 4)]
    devices: usize,

    /// Sectors per device.
    #[arg(short, long, default_value_t = 8192)]
    sectors: usize,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create the device files and format a fresh array on them.
    Create,
    /// Start an existing array, print its state and stop it again.
    Info,
    /// Rebuild a degraded array onto its failed device.
    Resync,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Create => {
            let disks = DiskFiles::create(&cli.dir, cli.devices, cli.sectors)
                .context("creating device files")?;
            if !RaidVolume::create(&disks) {
                bail!("too many device faults while formatting the array");
            }
            println!(
                "created {} devices x {} sectors in {}",
                cli.devices,
                cli.sectors,
                cli.dir.display()
            );
        }
        Command::Info => {
            let disks = Arc::new(
                DiskFiles::open(&cli.dir, cli.devices, cli.sectors)
                    .context("opening device files")?,
            );
            let mut vol = RaidVolume::new();
            let status = vol.start(disks);
            println!("status: {:?}", status);
            println!("size:   {} sectors", vol.size());
            if let Some(failed) = vol.failed_device() {
                println!("failed: device {failed}");
            }
            vol.stop();
        }
        Command::Resync => {
            let disks = Arc::new(
                DiskFiles::open(&cli.dir, cli.devices, cli.sectors)
                    .context("opening device files")?,
            );
            let mut vol = RaidVolume::new();
            match vol.start(disks) {
                Status::Degraded => {
                    let status = vol.resync();
                    println!("resync finished: {:?}", status);
                }
                status => println!("nothing to resync, array is {:?}", status),
            }
            vol.stop();
        }
    }
    Ok(())
}
