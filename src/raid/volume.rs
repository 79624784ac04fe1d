//! The RAID-5 volume: lifecycle, healthy and degraded data paths, resync.

use std::sync::Arc;

use log::{info, warn};

use crate::device::BlockDevice;
use crate::raid::{
    Layout, Status, INIT_TIMESTAMP, MAX_RAID_DEVICES, MIN_RAID_DEVICES, SECTOR_SIZE,
};

fn timestamp_sector(time: u64) -> [u8; SECTOR_SIZE] {
    let mut buf = [0u8; SECTOR_SIZE];
    buf[..8].copy_from_slice(&time.to_le_bytes());
    buf
}

fn parse_timestamp(buf: &[u8; SECTOR_SIZE]) -> u64 {
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&buf[..8]);
    u64::from_le_bytes(raw)
}

fn xor_into(acc: &mut [u8], src: &[u8]) {
    for (a, s) in acc.iter_mut().zip(src) {
        *a ^= *s;
    }
}

fn geometry_ok(devices: usize, sectors: usize) -> bool {
    (MIN_RAID_DEVICES..=MAX_RAID_DEVICES).contains(&devices) && sectors >= 2
}

/// A RAID-5 array over an injected [`BlockDevice`].
///
/// The volume is constructed unbound and `Stopped`; `start` binds it to a
/// device set and derives the initial status from the persisted timestamps,
/// `stop` persists a fresh timestamp and releases the binding. Calls are not
/// internally synchronized; a shared volume must be serialized by the caller.
///
/// Error handling is status-based throughout: a device call transferring
/// fewer sectors than requested is the only fault primitive, and it feeds the
/// `Stopped / Ok / Degraded / Failed` state machine instead of surfacing as a
/// Rust error. The first faulting device degrades the array, a fault on a
/// second distinct device fails it for good.
pub struct RaidVolume {
    dev: Option<Arc<dyn BlockDevice>>,
    layout: Layout,
    status: Status,
    time: u64,
    failed: Option<usize>,
}

impl Default for RaidVolume {
    fn default() -> Self {
        Self::new()
    }
}

impl RaidVolume {
    pub fn new() -> Self {
        Self {
            dev: None,
            layout: Layout::new(0, 0),
            status: Status::Stopped,
            time: INIT_TIMESTAMP,
            failed: None,
        }
    }

    /// Format a fresh array by stamping the reserved sector of every device.
    ///
    /// Mirrors the single-fault policy of the data path: succeeds if at most
    /// one device fails to take the stamp.
    pub fn create(dev: &dyn BlockDevice) -> bool {
        let devices = dev.device_count();
        let sectors = dev.sectors_per_device();
        if !geometry_ok(devices, sectors) {
            return false;
        }
        let stamp = timestamp_sector(INIT_TIMESTAMP);
        let reserved = sectors - 1;
        let mut faulted = false;
        for i in 0..devices {
            if dev.write(i, reserved, &stamp) != 1 {
                if faulted {
                    return false;
                }
                faulted = true;
            }
        }
        true
    }

    /// Bind the volume to a device set and decide how the array came back up.
    ///
    /// Reads the timestamp from every device's reserved sector:
    /// two or more unreadable devices fail the array; one unreadable device
    /// is tolerated if the survivors agree; with all devices readable, a
    /// single minority timestamp marks that device failed and the majority
    /// value is adopted, while any deeper split is unrecoverable.
    pub fn start(&mut self, dev: Arc<dyn BlockDevice>) -> Status {
        let devices = dev.device_count();
        let sectors = dev.sectors_per_device();
        if !geometry_ok(devices, sectors) {
            self.status = Status::Failed;
            return self.status;
        }
        self.layout = Layout::new(devices, sectors);
        self.time = INIT_TIMESTAMP;
        self.failed = None;

        let reserved = self.layout.reserved_sector();
        let mut buf = [0u8; SECTOR_SIZE];
        let mut stamps: Vec<Option<u64>> = Vec::with_capacity(devices);
        for i in 0..devices {
            if dev.read(i, reserved, &mut buf) == 1 {
                stamps.push(Some(parse_timestamp(&buf)));
            } else {
                stamps.push(None);
            }
        }
        self.dev = Some(dev);

        let unreadable: Vec<usize> = (0..devices).filter(|i| stamps[*i].is_none()).collect();
        self.status = match unreadable.len() {
            0 => {
                let stamps: Vec<u64> = stamps.into_iter().flatten().collect();
                self.adopt_majority(&stamps)
            }
            1 => {
                let mut readable = stamps.iter().flatten();
                match readable.next() {
                    Some(&first) if readable.all(|s| *s == first) => {
                        self.failed = Some(unreadable[0]);
                        self.time = first;
                        Status::Degraded
                    }
                    _ => Status::Failed,
                }
            }
            _ => Status::Failed,
        };
        info!(
            "started {}x{} array: {:?}, failed device {:?}",
            devices, sectors, self.status, self.failed
        );
        self.status
    }

    /// Timestamp vote over a fully readable device set. At most two distinct
    /// values are considered; a genuine majority (all devices but one) marks
    /// the odd one out as failed.
    fn adopt_majority(&mut self, stamps: &[u64]) -> Status {
        let first = stamps[0];
        if stamps.iter().all(|s| *s == first) {
            self.time = first;
            return Status::Ok;
        }
        let mut count_first = 0;
        let mut second = None;
        for s in stamps {
            if *s == first {
                count_first += 1;
            } else if second.is_none() {
                second = Some(*s);
            } else if Some(*s) != second {
                return Status::Failed;
            }
        }
        let majority = if count_first == stamps.len() - 1 {
            first
        } else if count_first == 1 {
            match second {
                Some(s) => s,
                None => return Status::Failed,
            }
        } else {
            return Status::Failed;
        };
        for (i, s) in stamps.iter().enumerate() {
            if *s != majority {
                self.failed = Some(i);
            }
        }
        self.time = majority;
        Status::Degraded
    }

    /// Bump the timestamp, persist it on every non-failed device and release
    /// the binding. Write failures here are ignored: the device that missed
    /// the stamp will show up as the minority on the next `start`.
    pub fn stop(&mut self) -> Status {
        if let Some(dev) = self.dev.take() {
            self.time += 1;
            let stamp = timestamp_sector(self.time);
            let reserved = self.layout.reserved_sector();
            for i in 0..self.layout.devices {
                if self.failed == Some(i) {
                    continue;
                }
                dev.write(i, reserved, &stamp);
            }
        }
        self.failed = None;
        self.status = Status::Stopped;
        self.status
    }

    pub fn status(&self) -> Status {
        self.status
    }

    /// Usable capacity in logical sectors, 0 while unbound.
    pub fn size(&self) -> usize {
        if self.dev.is_some() {
            self.layout.size()
        } else {
            0
        }
    }

    /// The device currently marked failed, if any.
    pub fn failed_device(&self) -> Option<usize> {
        self.failed
    }

    /// Shared fault transition: first faulting device degrades the array, a
    /// second distinct one fails it, repeats on the known-failed device do
    /// not escalate.
    fn record_fault(&mut self, device: usize) -> Status {
        match self.failed {
            Some(f) if f == device => {}
            Some(f) => {
                warn!("device {device} faulted while {f} is already out, array failed");
                self.status = Status::Failed;
            }
            None => {
                warn!("device {device} faulted, array degraded");
                self.failed = Some(device);
                self.status = Status::Degraded;
            }
        }
        self.status
    }

    fn online(&self) -> bool {
        matches!(self.status, Status::Ok | Status::Degraded)
    }

    /// Validate and clamp a request. Returns the sector count to process.
    fn request_count(&self, sec_nr: usize, buf_len: usize) -> Option<usize> {
        if !self.online() || buf_len == 0 || buf_len % SECTOR_SIZE != 0 {
            return None;
        }
        let size = self.layout.size();
        if sec_nr >= size {
            return None;
        }
        // Requests running past the end are truncated, not rejected.
        Some((buf_len / SECTOR_SIZE).min(size - sec_nr))
    }

    /// Read `buf.len() / SECTOR_SIZE` logical sectors starting at `sec_nr`.
    ///
    /// `buf` must be a nonzero multiple of [`SECTOR_SIZE`]; a request past
    /// the end of the volume is clamped. Fails fast unless the array is `Ok`
    /// or `Degraded`. A device fault mid-call aborts the remaining sectors;
    /// sectors already copied out stay as read.
    pub fn read(&mut self, sec_nr: usize, buf: &mut [u8]) -> bool {
        let Some(count) = self.request_count(sec_nr, buf.len()) else {
            return false;
        };
        let Some(dev) = self.dev.clone() else {
            return false;
        };
        for i in 0..count {
            let out = &mut buf[i * SECTOR_SIZE..(i + 1) * SECTOR_SIZE];
            if !self.read_sector(dev.as_ref(), sec_nr + i, out) {
                return false;
            }
        }
        true
    }

    fn read_sector(&mut self, dev: &dyn BlockDevice, logical: usize, out: &mut [u8]) -> bool {
        let loc = self.layout.locate(logical);
        if self.failed == Some(loc.data_dev) {
            return self.reconstruct_sector(dev, loc.data_dev, loc.stripe, out);
        }
        if dev.read(loc.data_dev, loc.stripe, out) != 1 {
            self.record_fault(loc.data_dev);
            return false;
        }
        true
    }

    /// Rebuild the content of `missing` at `stripe` by XOR-folding the same
    /// physical sector on every other device into `out`.
    fn reconstruct_sector(
        &mut self,
        dev: &dyn BlockDevice,
        missing: usize,
        stripe: usize,
        out: &mut [u8],
    ) -> bool {
        out.fill(0);
        let mut scratch = [0u8; SECTOR_SIZE];
        for d in 0..self.layout.devices {
            if d == missing {
                continue;
            }
            if dev.read(d, stripe, &mut scratch) != 1 {
                self.record_fault(d);
                return false;
            }
            xor_into(out, &scratch);
        }
        true
    }

    /// Write `buf.len() / SECTOR_SIZE` logical sectors starting at `sec_nr`.
    ///
    /// Same contract as [`RaidVolume::read`]: clamp past the end, fail fast
    /// when not `Ok`/`Degraded`, abort on a device fault. Sectors committed
    /// before a mid-call fault are not rolled back.
    pub fn write(&mut self, sec_nr: usize, buf: &[u8]) -> bool {
        let Some(count) = self.request_count(sec_nr, buf.len()) else {
            return false;
        };
        let Some(dev) = self.dev.clone() else {
            return false;
        };
        for i in 0..count {
            let data = &buf[i * SECTOR_SIZE..(i + 1) * SECTOR_SIZE];
            if !self.write_sector(dev.as_ref(), sec_nr + i, data) {
                return false;
            }
        }
        true
    }

    fn write_sector(&mut self, dev: &dyn BlockDevice, logical: usize, data: &[u8]) -> bool {
        let loc = self.layout.locate(logical);

        if self.failed == Some(loc.data_dev) {
            // The data sector itself is gone: fold the survivors to recover
            // its old value, then refresh parity alone. Resync will put the
            // data back once the device is replaced.
            let mut old_data = [0u8; SECTOR_SIZE];
            let mut old_parity = [0u8; SECTOR_SIZE];
            let mut scratch = [0u8; SECTOR_SIZE];
            for d in 0..self.layout.devices {
                if d == loc.data_dev {
                    continue;
                }
                if dev.read(d, loc.stripe, &mut scratch) != 1 {
                    self.record_fault(d);
                    return false;
                }
                if d == loc.parity_dev {
                    old_parity = scratch;
                }
                xor_into(&mut old_data, &scratch);
            }
            let mut new_parity = [0u8; SECTOR_SIZE];
            for i in 0..SECTOR_SIZE {
                new_parity[i] = old_parity[i] ^ old_data[i] ^ data[i];
            }
            if dev.write(loc.parity_dev, loc.stripe, &new_parity) != 1 {
                self.record_fault(loc.parity_dev);
                return false;
            }
            return true;
        }

        let mut old_data = [0u8; SECTOR_SIZE];
        if dev.read(loc.data_dev, loc.stripe, &mut old_data) != 1 {
            self.record_fault(loc.data_dev);
            return false;
        }
        if dev.write(loc.data_dev, loc.stripe, data) != 1 {
            self.record_fault(loc.data_dev);
            return false;
        }
        if self.failed == Some(loc.parity_dev) {
            // Parity lives on the failed device; resync rebuilds it.
            return true;
        }
        let mut old_parity = [0u8; SECTOR_SIZE];
        if dev.read(loc.parity_dev, loc.stripe, &mut old_parity) != 1 {
            self.record_fault(loc.parity_dev);
            return false;
        }
        let mut new_parity = [0u8; SECTOR_SIZE];
        for i in 0..SECTOR_SIZE {
            new_parity[i] = old_parity[i] ^ old_data[i] ^ data[i];
        }
        if dev.write(loc.parity_dev, loc.stripe, &new_parity) != 1 {
            self.record_fault(loc.parity_dev);
            return false;
        }
        true
    }

    /// Rebuild a degraded array onto its (replaced) failed device.
    ///
    /// Reconstructs every physical sector of the failed device from the
    /// survivors and writes it back. A read fault among the survivors is a
    /// second independent failure and fails the array; a write fault on the
    /// recovering device leaves it `Degraded` for a later retry. On full
    /// success the recovered device is stamped with the current timestamp
    /// and the array returns to `Ok`. In any other status this is a no-op
    /// returning the current status.
    pub fn resync(&mut self) -> Status {
        if self.status != Status::Degraded {
            return self.status;
        }
        let Some(dev) = self.dev.clone() else {
            return self.status;
        };
        let Some(target) = self.failed else {
            return self.status;
        };

        let mut rebuilt = [0u8; SECTOR_SIZE];
        for stripe in 0..self.layout.sectors - 1 {
            if !self.reconstruct_sector(dev.as_ref(), target, stripe, &mut rebuilt) {
                // A survivor just died; nothing left to rebuild from.
                return self.status;
            }
            if dev.write(target, stripe, &rebuilt) != 1 {
                info!("resync of device {target} interrupted at stripe {stripe}");
                return self.status;
            }
        }
        let stamp = timestamp_sector(self.time);
        if dev.write(target, self.layout.reserved_sector(), &stamp) != 1 {
            info!("resync of device {target} could not stamp the reserved sector");
            return self.status;
        }
        self.failed = None;
        self.status = Status::Ok;
        info!("resync complete, device {target} back online");
        self.status
    }
}
