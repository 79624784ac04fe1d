use std::sync::Arc;
use std::time::Duration;

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use rand::RngCore;

use swraid::device::SimDisks;
use swraid::raid::{RaidVolume, Status, SECTOR_SIZE};

const DEVICES: usize = 6;
const SECTORS: usize = 1024;

fn criterion_benches(c: &mut Criterion) {
    criterion_write(c);
    criterion_degraded_read(c);
    criterion_resync(c);
}

fn prepare() -> (Arc<SimDisks>, RaidVolume) {
    let mut rng = rand::thread_rng();
    let disks = Arc::new(SimDisks::new(DEVICES, SECTORS));
    assert!(RaidVolume::create(disks.as_ref()));
    let mut vol = RaidVolume::new();
    assert_eq!(vol.start(disks.clone()), Status::Ok);

    let mut data = vec![0u8; SECTOR_SIZE];
    for sec in 0..vol.size() {
        rng.fill_bytes(&mut data);
        assert!(vol.write(sec, &data));
    }
    (disks, vol)
}

fn criterion_write(c: &mut Criterion) {
    let mut group = c.benchmark_group("write");
    group.sample_size(10).measurement_time(Duration::from_secs(10));
    let (_disks, mut vol) = prepare();
    let data = vec![0xa5u8; SECTOR_SIZE];
    let size = vol.size();
    let mut sec = 0;

    group.bench_function("healthy rmw", |b| {
        b.iter(|| {
            sec = (sec + 1) % size;
            assert!(vol.write(black_box(sec), &data));
        })
    });
    group.finish();
}

fn criterion_degraded_read(c: &mut Criterion) {
    let mut group = c.benchmark_group("read");
    group.sample_size(10).measurement_time(Duration::from_secs(10));
    let (disks, mut vol) = prepare();
    let mut buf = vec![0u8; SECTOR_SIZE];

    group.bench_function("healthy", |b| {
        b.iter(|| assert!(vol.read(black_box(0), &mut buf)))
    });

    disks.fail_device(0);
    // Sector 0 lives on device 0, so one read trips the fault.
    assert!(!vol.read(0, &mut buf));
    assert_eq!(vol.status(), Status::Degraded);

    group.bench_function("reconstructing", |b| {
        b.iter(|| assert!(vol.read(black_box(0), &mut buf)))
    });
    group.finish();
}

fn criterion_resync(c: &mut Criterion) {
    let mut group = c.benchmark_group("resync");
    group.sample_size(10).measurement_time(Duration::from_secs(20));
    let (disks, mut vol) = prepare();
    let mut buf = vec![0u8; SECTOR_SIZE];

    group.bench_function("full rebuild", |b| {
        b.iter(|| {
            disks.fail_device(0);
            assert!(!vol.read(0, &mut buf));
            disks.heal_device(0);
            disks.scramble_device(0, 0xee);
            assert_eq!(vol.resync(), Status::Ok);
        })
    });
    group.finish();
}

criterion_group!(benches, criterion_benches);
criterion_main!(benches);
