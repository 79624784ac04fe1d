//! Block device backends.
//!
//! The RAID volume only ever talks to a [`BlockDevice`]: a fixed set of
//! equally sized devices supporting per-sector reads and writes. A call that
//! transfers fewer sectors than requested is the sole failure signal; there
//! are no error codes at this layer.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use thiserror::Error;

use crate::raid::SECTOR_SIZE;

pub trait BlockDevice: Send + Sync {
    fn device_count(&self) -> usize;

    fn sectors_per_device(&self) -> usize;

    /// Read `buf.len() / SECTOR_SIZE` sectors starting at `sector` on
    /// `device`. Returns the number of sectors actually read.
    fn read(&self, device: usize, sector: usize, buf: &mut [u8]) -> usize;

    /// Write `buf.len() / SECTOR_SIZE` sectors starting at `sector` on
    /// `device`. Returns the number of sectors actually written.
    fn write(&self, device: usize, sector: usize, buf: &[u8]) -> usize;
}

/// Errors opening or creating the raw storage behind a device set. The data
/// path never produces these; per-call failures are reported as short counts.
#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("raw storage access error")]
    Io(#[from] std::io::Error),
    #[error("device file {path} has {found} bytes, expected {expected}")]
    WrongSize {
        path: PathBuf,
        expected: u64,
        found: u64,
    },
}

fn request_sectors(buf_len: usize, device: usize, sector: usize, devices: usize, sectors: usize) -> Option<usize> {
    if buf_len == 0 || buf_len % SECTOR_SIZE != 0 {
        return None;
    }
    let count = buf_len / SECTOR_SIZE;
    if device >= devices || sector + count > sectors {
        return None;
    }
    Some(count)
}

/// One file per device under a common directory, each `sectors * SECTOR_SIZE`
/// bytes long. Files are held open for the lifetime of the handle and closed
/// on drop.
pub struct DiskFiles {
    files: Vec<Mutex<File>>,
    devices: usize,
    sectors: usize,
}

impl DiskFiles {
    fn file_path(dir: &Path, device: usize) -> PathBuf {
        dir.join(format!("disk-{device:04}"))
    }

    /// Create and zero-fill a fresh set of device files.
    pub fn create(dir: &Path, devices: usize, sectors: usize) -> Result<Self, DeviceError> {
        let zero = vec![0u8; SECTOR_SIZE];
        let mut files = Vec::with_capacity(devices);
        for i in 0..devices {
            let mut file = OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(true)
                .open(Self::file_path(dir, i))?;
            for _ in 0..sectors {
                file.write_all(&zero)?;
            }
            files.push(Mutex::new(file));
        }
        Ok(Self {
            files,
            devices,
            sectors,
        })
    }

    /// Open an existing set of device files, checking their size.
    pub fn open(dir: &Path, devices: usize, sectors: usize) -> Result<Self, DeviceError> {
        let expected = (sectors * SECTOR_SIZE) as u64;
        let mut files = Vec::with_capacity(devices);
        for i in 0..devices {
            let path = Self::file_path(dir, i);
            let file = OpenOptions::new().read(true).write(true).open(&path)?;
            let found = file.metadata()?.len();
            if found != expected {
                return Err(DeviceError::WrongSize {
                    path,
                    expected,
                    found,
                });
            }
            files.push(Mutex::new(file));
        }
        Ok(Self {
            files,
            devices,
            sectors,
        })
    }
}

impl BlockDevice for DiskFiles {
    fn device_count(&self) -> usize {
        self.devices
    }

    fn sectors_per_device(&self) -> usize {
        self.sectors
    }

    fn read(&self, device: usize, sector: usize, buf: &mut [u8]) -> usize {
        let Some(count) = request_sectors(buf.len(), device, sector, self.devices, self.sectors)
        else {
            return 0;
        };
        let mut file = match self.files[device].lock() {
            Ok(file) => file,
            Err(_) => return 0,
        };
        if file
            .seek(SeekFrom::Start((sector * SECTOR_SIZE) as u64))
            .is_err()
        {
            return 0;
        }
        match file.read_exact(buf) {
            Ok(()) => count,
            Err(_) => 0,
        }
    }

    fn write(&self, device: usize, sector: usize, buf: &[u8]) -> usize {
        let Some(count) = request_sectors(buf.len(), device, sector, self.devices, self.sectors)
        else {
            return 0;
        };
        let mut file = match self.files[device].lock() {
            Ok(file) => file,
            Err(_) => return 0,
        };
        if file
            .seek(SeekFrom::Start((sector * SECTOR_SIZE) as u64))
            .is_err()
        {
            return 0;
        }
        match file.write_all(buf) {
            Ok(()) => count,
            Err(_) => 0,
        }
    }
}

/// In-memory device set with per-device crash injection. Once a device is
/// failed, every call against it returns 0 sectors until it is healed, which
/// models pulling a disk and later plugging in a replacement.
pub struct SimDisks {
    data: Vec<Mutex<Vec<u8>>>,
    failed: Vec<AtomicBool>,
    devices: usize,
    sectors: usize,
}

impl SimDisks {
    pub fn new(devices: usize, sectors: usize) -> Self {
        Self {
            data: (0..devices)
                .map(|_| Mutex::new(vec![0u8; sectors * SECTOR_SIZE]))
                .collect(),
            failed: (0..devices).map(|_| AtomicBool::new(false)).collect(),
            devices,
            sectors,
        }
    }

    pub fn fail_device(&self, device: usize) {
        self.failed[device].store(true, Ordering::Relaxed);
    }

    /// Bring a device back online without restoring its content.
    pub fn heal_device(&self, device: usize) {
        self.failed[device].store(false, Ordering::Relaxed);
    }

    /// Overwrite a device with garbage, as a replacement disk would contain.
    pub fn scramble_device(&self, device: usize, fill: u8) {
        let mut data = self.data[device].lock().unwrap();
        data.fill(fill);
    }
}

impl BlockDevice for SimDisks {
    fn device_count(&self) -> usize {
        self.devices
    }

    fn sectors_per_device(&self) -> usize {
        self.sectors
    }

    fn read(&self, device: usize, sector: usize, buf: &mut [u8]) -> usize {
        let Some(count) = request_sectors(buf.len(), device, sector, self.devices, self.sectors)
        else {
            return 0;
        };
        if self.failed[device].load(Ordering::Relaxed) {
            return 0;
        }
        let data = self.data[device].lock().unwrap();
        let start = sector * SECTOR_SIZE;
        buf.copy_from_slice(&data[start..start + buf.len()]);
        count
    }

    fn write(&self, device: usize, sector: usize, buf: &[u8]) -> usize {
        let Some(count) = request_sectors(buf.len(), device, sector, self.devices, self.sectors)
        else {
            return 0;
        };
        if self.failed[device].load(Ordering::Relaxed) {
            return 0;
        }
        let mut data = self.data[device].lock().unwrap();
        let start = sector * SECTOR_SIZE;
        data[start..start + buf.len()].copy_from_slice(buf);
        count
    }
}
