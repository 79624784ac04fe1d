use std::sync::Arc;

use rand::{Rng, RngCore};

use swraid::device::SimDisks;
use swraid::raid::{RaidVolume, Status, SECTOR_SIZE};

fn main() {
    fuzz_volume(4, 128, 60);
    fuzz_volume(5, 64, 60);
    fuzz_volume(8, 32, 60);
}

/// Drive read traffic until the volume notices the injected fault. Reads
/// leave the array content untouched, so the shadow model stays valid.
fn discover_fault(vol: &mut RaidVolume) {
    let mut buf = [0u8; SECTOR_SIZE];
    for sec in 0..vol.size() {
        if !vol.read(sec, &mut buf) {
            break;
        }
    }
    assert_eq!(vol.status(), Status::Degraded);
}

fn assert_matches_model(vol: &mut RaidVolume, model: &[u8]) {
    let mut buf = [0u8; SECTOR_SIZE];
    for sec in 0..vol.size() {
        assert!(vol.read(sec, &mut buf), "read of sector {sec} failed");
        assert_eq!(
            buf,
            model[sec * SECTOR_SIZE..(sec + 1) * SECTOR_SIZE],
            "sector {sec} diverged from the model"
        );
    }
}

fn fuzz_volume(devices: usize, sectors: usize, rounds: usize) {
    let mut rng = rand::thread_rng();
    let disks = Arc::new(SimDisks::new(devices, sectors));
    assert!(RaidVolume::create(disks.as_ref()));
    let mut vol = RaidVolume::new();
    assert_eq!(vol.start(disks.clone()), Status::Ok);

    let size = vol.size();
    let mut model = vec![0u8; size * SECTOR_SIZE];
    let mut dead: Option<usize> = None;

    for round in 0..rounds {
        println!("Fuzz volume {devices}x{sectors} round {round}");

        for _ in 0..16 {
            let sec = rng.gen_range(0..size);
            let count = rng.gen_range(1..=4).min(size - sec);
            let mut data = vec![0u8; count * SECTOR_SIZE];
            rng.fill_bytes(&mut data);
            assert!(vol.write(sec, &data), "write of {count} sectors at {sec} failed");
            model[sec * SECTOR_SIZE..(sec + count) * SECTOR_SIZE].copy_from_slice(&data);
        }

        assert_matches_model(&mut vol, &model);

        if dead.is_none() && rng.gen_bool(0.3) {
            let victim = rng.gen_range(0..devices);
            disks.fail_device(victim);
            discover_fault(&mut vol);
            assert_eq!(vol.failed_device(), Some(victim));
            dead = Some(victim);
            assert_matches_model(&mut vol, &model);
        }

        if let Some(victim) = dead {
            if rng.gen_bool(0.4) {
                disks.heal_device(victim);
                disks.scramble_device(victim, rng.gen());
                assert_eq!(vol.resync(), Status::Ok);
                assert_eq!(vol.failed_device(), None);
                dead = None;
                assert_matches_model(&mut vol, &model);
            }
        }

        if rng.gen_bool(0.15) {
            assert_eq!(vol.stop(), Status::Stopped);
            vol = RaidVolume::new();
            let expected = if dead.is_some() {
                Status::Degraded
            } else {
                Status::Ok
            };
            assert_eq!(vol.start(disks.clone()), expected);
            assert_eq!(vol.failed_device(), dead);
            assert_matches_model(&mut vol, &model);
        }
    }
    vol.stop();
}
