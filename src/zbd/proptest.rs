//! Property-Based Tests for the Zone Adaptation Core
//!
//! Uses proptest to verify the zone table and adjuster invariants across
//! arbitrary geometries and write-pointer states.
//!
//! # Test Properties
//!
//! 1. **Layout**: adjacent zones tile the device exactly, sentinel included
//! 2. **Pointer bounds**: `start <= wp <= start + zone_size` at all times
//! 3. **Write completion**: the pointer lands at the request end, capped at
//!    the zone boundary, and the request started at the old pointer
//! 4. **Reads**: adjusted reads never cross a write pointer
//! 5. **Reset**: `file_reset` empties every touched zone and is idempotent
//! 6. **Locking**: no zone lock survives an adjust/complete cycle

#![cfg(test)]

use proptest::prelude::*;
use std::sync::Arc;

use crate::device::mock::MockZonedDevice;
use crate::device::SECTOR_SHIFT;
use crate::workload::{DirectionMask, FileKind, IoUnit, Job, JobFile, JobOptions, WorkloadKind};
use crate::zbd::builder::create_zone_table;
use crate::zbd::{adjust_block, file_reset, AdjustAction};

const MIN_BS: u64 = 4096;
const MIN_BS_SECTORS: u64 = MIN_BS >> SECTOR_SHIFT;

// =============================================================================
// Strategies
// =============================================================================

/// Geometries mixing power-of-two and non-power-of-two zone sizes, so both
/// the shift and the division index paths are exercised.
fn geometry_strategy() -> impl Strategy<Value = (u32, u64)> {
    (1u32..=24, prop::sample::select(vec![16u64, 24, 40, 2048, 3 * 2048]))
}

/// Per-zone write pointer offsets, as whole minimum blocks.
fn wp_blocks_strategy(nr_zones: u32, zone_size: u64) -> impl Strategy<Value = Vec<u64>> {
    let max_blocks = zone_size / MIN_BS_SECTORS;
    prop::collection::vec(0..=max_blocks, nr_zones as usize)
}

fn build_job(nr_zones: u32, zone_size: u64, wp_blocks: &[u64], opts: JobOptions) -> Job {
    let dev = Arc::new(MockZonedDevice::host_managed(nr_zones, zone_size));
    for (idx, blocks) in wp_blocks.iter().enumerate() {
        let start = idx as u64 * zone_size;
        dev.set_wp(idx as u32, start + blocks * MIN_BS_SECTORS);
    }
    let mut file = JobFile::new(
        "/dev/nullb0",
        FileKind::BlockDevice,
        u64::from(nr_zones) * (zone_size << SECTOR_SHIFT),
    )
    .with_device(dev.clone());
    let table = create_zone_table(&opts, &file, dev.as_ref()).unwrap();
    file.zone_table = Some(Arc::new(table));
    Job::new(opts).with_files(vec![file])
}

fn writer_opts() -> JobOptions {
    let mut opts = JobOptions::zbd();
    opts.directions = DirectionMask::write_only();
    opts.odirect = true;
    opts
}

// =============================================================================
// Layout Properties
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(100))]

    /// Property: zones tile the device exactly and pointers stay in bounds,
    /// for any geometry and any pointer state.
    #[test]
    fn prop_table_layout_invariants(
        (nr_zones, zone_size) in geometry_strategy(),
        seed in any::<u64>(),
    ) {
        let wp_blocks: Vec<u64> = (0..nr_zones)
            .map(|i| (seed.rotate_left(i) % (zone_size / MIN_BS_SECTORS + 1)))
            .collect();
        let job = build_job(nr_zones, zone_size, &wp_blocks, writer_opts());
        let table = job.files[0].zone_table.as_ref().unwrap();

        prop_assert_eq!(table.nr_zones(), nr_zones);
        for idx in 0..nr_zones {
            let z = table.zone(idx);
            prop_assert_eq!(table.next_start(idx), z.start() + zone_size);
            prop_assert!(z.start() <= z.wp());
            prop_assert!(z.wp() <= z.start() + zone_size);
        }
        // The sentinel closes the zoned range.
        prop_assert_eq!(
            table.zone(nr_zones).start(),
            u64::from(nr_zones) * zone_size
        );
    }

    /// Property: for power-of-two zone sizes the shift path and the plain
    /// division agree on every offset, sentinel clamping included.
    #[test]
    fn prop_zone_index_shift_agrees_with_division(
        nr_zones in 1u32..=24,
        zone_size in prop::sample::select(vec![16u64, 2048, 1 << 14]),
        offset in any::<u64>(),
    ) {
        let wp_blocks = vec![0; nr_zones as usize];
        let job = build_job(nr_zones, zone_size, &wp_blocks, writer_opts());
        let table = job.files[0].zone_table.as_ref().unwrap();

        let device_bytes = u64::from(nr_zones) * (zone_size << SECTOR_SHIFT);
        let offset = offset % (device_bytes * 2 + 1);
        let divided = ((offset >> SECTOR_SHIFT) / zone_size).min(u64::from(nr_zones)) as u32;
        prop_assert_eq!(table.zone_index_of(offset), divided);
    }
}

// =============================================================================
// Adjustment Properties
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(100))]

    /// Property: a successful write completion leaves the pointer at the
    /// request end (capped at the boundary), and the request itself was
    /// issued at the old pointer.
    #[test]
    fn prop_write_completion_advances_wp(
        wp_blocks in wp_blocks_strategy(4, 2048),
        buflen_blocks in 1u64..=64,
        target_zone in 0u32..4,
    ) {
        let job = build_job(4, 2048, &wp_blocks, writer_opts());
        let file = &job.files[0];
        let table = file.zone_table.as_ref().unwrap().clone();

        let mut io = IoUnit::write(
            u64::from(target_zone) * table.zone_size_bytes(),
            buflen_blocks * MIN_BS,
        );
        match adjust_block(&job, file, &mut io) {
            AdjustAction::AcceptReserved(res) => {
                let zone_idx = table.zone_index_of(io.offset);
                let old_wp = table.zone(zone_idx).wp();
                prop_assert_eq!(io.offset, old_wp << SECTOR_SHIFT);
                prop_assert_eq!(io.buflen % MIN_BS, 0);

                res.complete(&io, true);
                let expect = ((io.offset + io.buflen) >> SECTOR_SHIFT)
                    .min(table.next_start(zone_idx));
                prop_assert_eq!(table.zone(zone_idx).wp(), expect);
            }
            AdjustAction::Accept => prop_assert!(false, "write on a sequential zone must reserve"),
            AdjustAction::Eof => {
                // Only possible when the request exceeds the zone size.
                prop_assert!(buflen_blocks * MIN_BS > table.zone_size_bytes());
            }
        }

        for idx in 0..table.nr_zones() {
            let z = table.zone(idx);
            prop_assert!(z.start() <= z.wp() && z.wp() <= z.start() + table.zone_size());
        }
    }

    /// Property: an adjusted random read never crosses the write pointer
    /// of the zone it lands in, whichever zone that ends up being.
    #[test]
    fn prop_random_read_stays_below_wp(
        wp_blocks in wp_blocks_strategy(4, 2048),
        offset_blocks in 0u64..(4 * 2048 / MIN_BS_SECTORS),
    ) {
        let mut opts = JobOptions::zbd();
        opts.workload = WorkloadKind::Random;
        let job = build_job(4, 2048, &wp_blocks, opts);
        let file = &job.files[0];
        let table = file.zone_table.as_ref().unwrap().clone();

        let mut io = IoUnit::read(offset_blocks * MIN_BS, MIN_BS);
        match adjust_block(&job, file, &mut io) {
            AdjustAction::AcceptReserved(res) => {
                let zone_idx = table.zone_index_of(io.offset);
                let z = table.zone(zone_idx);
                prop_assert!(io.offset >= z.start_bytes());
                prop_assert!((io.offset + io.buflen) >> SECTOR_SHIFT <= z.wp());
                res.complete(&io, true);
            }
            AdjustAction::Eof => {
                // Legal only when no zone holds a full block of data.
                prop_assert!(wp_blocks.iter().all(|&b| b == 0));
            }
            AdjustAction::Accept => prop_assert!(false, "read on a sequential zone must reserve"),
        }
    }

    /// Property: two successive adjustments of the same random read, with
    /// no intervening writes, both land inside the same readable window.
    #[test]
    fn prop_repeated_random_read_stays_in_window(
        wp_blocks in prop::collection::vec(1u64..=(2048 / MIN_BS_SECTORS), 4),
        offset_blocks in 0u64..(4 * 2048 / MIN_BS_SECTORS),
    ) {
        let mut opts = JobOptions::zbd();
        opts.workload = WorkloadKind::Random;
        let job = build_job(4, 2048, &wp_blocks, opts);
        let file = &job.files[0];
        let table = file.zone_table.as_ref().unwrap().clone();

        let orig = IoUnit::read(offset_blocks * MIN_BS, MIN_BS);
        for _ in 0..2 {
            let mut io = orig;
            let action = adjust_block(&job, file, &mut io);
            let zone_idx = table.zone_index_of(io.offset);
            let z = table.zone(zone_idx);
            prop_assert!(io.offset >= z.start_bytes());
            prop_assert!((io.offset + io.buflen) >> SECTOR_SHIFT <= z.wp());
            if let Some(res) = action.into_reservation() {
                res.complete(&io, true);
            }
        }
    }

    /// Property: file_reset empties every zone the range covers, clears
    /// the replay ordinals, and applying it twice changes nothing more.
    #[test]
    fn prop_file_reset_empties_and_is_idempotent(
        (nr_zones, zone_size) in geometry_strategy(),
        seed in any::<u64>(),
    ) {
        let wp_blocks: Vec<u64> = (0..nr_zones)
            .map(|i| (seed.rotate_left(i) % (zone_size / MIN_BS_SECTORS + 1)))
            .collect();
        let mut opts = writer_opts();
        opts.verify = true;
        let job = build_job(nr_zones, zone_size, &wp_blocks, opts);
        let file = &job.files[0];
        let table = file.zone_table.as_ref().unwrap();

        file_reset(&job, file).unwrap();
        for z in table.zones() {
            prop_assert_eq!(z.wp(), z.start());
            prop_assert_eq!(z.verify_block(), 0);
        }

        let first: Vec<_> = table.zones().map(|z| z.snapshot().wp).collect();
        file_reset(&job, file).unwrap();
        let second: Vec<_> = table.zones().map(|z| z.snapshot().wp).collect();
        prop_assert_eq!(first, second);
    }

    /// Property: whatever the adjuster decides, after the reservation (if
    /// any) completes, no zone lock is left held.
    #[test]
    fn prop_no_lock_survives_adjust_complete_cycle(
        wp_blocks in wp_blocks_strategy(4, 2048),
        offset_blocks in 0u64..(4 * 2048 / MIN_BS_SECTORS),
        write in any::<bool>(),
        success in any::<bool>(),
    ) {
        let mut opts = writer_opts();
        opts.workload = WorkloadKind::Random;
        opts.directions = DirectionMask::read_write();
        let job = build_job(4, 2048, &wp_blocks, opts);
        let file = &job.files[0];
        let table = file.zone_table.as_ref().unwrap().clone();

        let mut io = if write {
            IoUnit::write(offset_blocks * MIN_BS, MIN_BS)
        } else {
            IoUnit::read(offset_blocks * MIN_BS, MIN_BS)
        };
        let action = adjust_block(&job, file, &mut io);
        if let Some(res) = action.into_reservation() {
            res.complete(&io, success);
        }

        for idx in 0..table.nr_zones() {
            prop_assert!(!table.zone(idx).lock.is_locked());
        }
    }
}
