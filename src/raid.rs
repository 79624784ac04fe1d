//! RAID-5 core types: array status, striping/parity layout math.

pub mod volume;

pub use volume::RaidVolume;

/// Size of one physical sector in bytes.
pub const SECTOR_SIZE: usize = 512;
/// Upper bound on array width, matching the on-disk format limits.
pub const MAX_RAID_DEVICES: usize = 16;
/// RAID-5 needs at least two data devices plus parity.
pub const MIN_RAID_DEVICES: usize = 3;
/// Timestamp written by `create`.
pub const INIT_TIMESTAMP: u64 = 1;

/// State of the volume as a whole.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Stopped,
    Ok,
    Degraded,
    Failed,
}

/// Placement of one logical sector inside the array.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Location {
    pub data_dev: usize,
    pub parity_dev: usize,
    pub stripe: usize,
}

/// Striping geometry of a bound array: pure math, no I/O.
///
/// The last physical sector of every device is reserved for the timestamp,
/// so one stripe holds `devices - 1` data sectors and the usable capacity is
/// `(devices - 1) * (sectors - 1)` logical sectors.
#[derive(Debug, Clone, Copy)]
pub struct Layout {
    pub devices: usize,
    pub sectors: usize,
}

impl Layout {
    pub fn new(devices: usize, sectors: usize) -> Self {
        Self { devices, sectors }
    }

    /// Device holding the parity sector of `stripe`. Rotates over all
    /// devices with period `devices`.
    pub fn parity_dev(&self, stripe: usize) -> usize {
        (self.devices - 1) - (stripe % self.devices)
    }

    /// Map a logical sector to its data device, parity device and physical
    /// stripe index.
    pub fn locate(&self, logical: usize) -> Location {
        let stripe = logical / (self.devices - 1);
        let parity_dev = self.parity_dev(stripe);
        let mut data_dev = logical % (self.devices - 1);
        if data_dev >= parity_dev {
            data_dev += 1;
        }
        Location {
            data_dev,
            parity_dev,
            stripe,
        }
    }

    /// Usable capacity in logical sectors.
    pub fn size(&self) -> usize {
        (self.devices - 1) * (self.sectors - 1)
    }

    /// Physical sector index reserved for the timestamp.
    pub fn reserved_sector(&self) -> usize {
        self.sectors - 1
    }
}
