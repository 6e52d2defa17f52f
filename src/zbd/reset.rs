//! Zone reset engine
//!
//! Resets run both up-front (before a verifying write pass, so no reset
//! has to happen mid-run and destroy verification data) and on demand
//! (when the adjuster finds a zone full or flagged). Contiguous runs of
//! zones are coalesced into single device calls.
//!
//! If the device reset fails, the in-memory write pointers of the affected
//! zones are deliberately left unchanged: the device state is unknown, the
//! table keeps its last known value, and the next write routed to the zone
//! retries the reset.

use tracing::{debug, error};

use crate::device::SECTOR_SHIFT;
use crate::error::{Error, Result};
use crate::workload::{Job, JobFile, RunState};

use super::zone::ZoneTable;

fn device_reset(file: &JobFile, table: &ZoneTable, sector: u64, nr_sectors: u64) -> Result<()> {
    debug_assert!(file.contains_offset(((sector + nr_sectors) << SECTOR_SHIFT) - 1));
    if !table.model().is_zoned() {
        // Regular device simulating zones: nothing to tell the hardware.
        return Ok(());
    }
    let dev = file.device.as_ref().ok_or_else(|| {
        Error::Config(format!("{}: no device handle for zone reset", file.name))
    })?;
    dev.reset_range(sector, nr_sectors).map_err(|e| {
        error!(
            file = %file.name,
            sector,
            nr_sectors,
            error = %e,
            "resetting write pointers failed"
        );
        e
    })
}

/// Device reset plus in-memory rewind for a span whose zone locks the
/// caller already holds.
fn reset_range_locked(file: &JobFile, table: &ZoneTable, sector: u64, nr_sectors: u64) -> Result<()> {
    device_reset(file, table, sector, nr_sectors)?;
    let zb = table.zone_index_of(sector << SECTOR_SHIFT);
    let ze = table.zone_index_of((sector + nr_sectors) << SECTOR_SHIFT);
    for idx in zb..ze {
        let z = table.zone(idx);
        z.set_wp(z.start());
        z.clear_verify_block();
    }
    Ok(())
}

/// Reset a single zone whose lock the caller holds. Used by the adjuster
/// when a write lands in a zone that is full or flagged for reset.
pub(crate) fn reset_zone_locked(file: &JobFile, table: &ZoneTable, idx: u32) -> Result<()> {
    debug!(file = %file.name, zone = idx, "resetting wp of zone");
    let start = table.zone(idx).start();
    reset_range_locked(file, table, start, table.next_start(idx) - start)
}

/// Reset every zone in `[sector, sector + nr_sectors)`, locking each
/// covered zone around its in-memory rewind. The span must lie within the
/// file's I/O range and cover whole zones.
pub fn reset_range(file: &JobFile, sector: u64, nr_sectors: u64) -> Result<()> {
    let Some(table) = &file.zone_table else {
        return Ok(());
    };
    device_reset(file, table, sector, nr_sectors)?;
    let zb = table.zone_index_of(sector << SECTOR_SHIFT);
    let ze = table.zone_index_of((sector + nr_sectors) << SECTOR_SHIFT);
    for idx in zb..ze {
        let z = table.zone(idx);
        z.lock.lock();
        z.set_wp(z.start());
        z.clear_verify_block();
        z.lock.unlock();
    }
    Ok(())
}

/// Walk zones `[zb, ze)` and reset the ones that need it, coalescing
/// contiguous runs into single device calls.
///
/// With `all_zones` set, a sequential zone needs resetting iff its write
/// pointer has moved; otherwise only if the job writes and the pointer is
/// not a multiple of the minimum write block size (a partial block at the
/// pointer could never be overwritten in place). Every examined zone stays
/// locked until the whole walk completes, so no other context can move a
/// write pointer during the decision window.
pub fn reset_zones(job: &Job, file: &JobFile, zb: u32, ze: u32, all_zones: bool) -> Result<()> {
    let Some(table) = &file.zone_table else {
        return Ok(());
    };
    debug!(file = %file.name, zb, ze, all_zones, "examining zones");
    let min_bs_sectors = job.options.min_bs.write >> SECTOR_SHIFT;
    let mut result = Ok(());
    let mut run_start: Option<u32> = None;

    let flush = |run: u32, end: u32, result: &mut Result<()>| {
        debug!(file = %file.name, from = run, to = end, "resetting zones");
        let sector = table.zone(run).start();
        let nr_sectors = table.zone(end).start() - sector;
        if let Err(e) = reset_range_locked(file, table, sector, nr_sectors) {
            *result = Err(e);
        }
    };

    for idx in zb..ze {
        let z = table.zone(idx);
        z.lock.lock();
        if z.is_sequential() {
            let reset_wp = if all_zones {
                z.wp() != z.start()
            } else {
                job.options.directions.writes()
                    && min_bs_sectors != 0
                    && z.wp() % min_bs_sectors != 0
            };
            match run_start {
                None if reset_wp => run_start = Some(idx),
                Some(run) if !reset_wp => {
                    flush(run, idx, &mut result);
                    run_start = None;
                }
                _ => {}
            }
        } else if let Some(run) = run_start {
            flush(run, idx, &mut result);
            run_start = None;
        }
    }
    if let Some(run) = run_start {
        flush(run, ze, &mut result);
    }

    for idx in zb..ze {
        table.zone(idx).lock.unlock();
    }
    result
}

/// Pre-reset the zones covering the file's I/O range before the run
/// starts. When a verifying write pass is about to begin, every touched
/// zone is emptied so no mid-write reset destroys verification data.
pub fn file_reset(job: &Job, file: &JobFile) -> Result<()> {
    let Some(table) = &file.zone_table else {
        return Ok(());
    };
    let zb = table.zone_index_of(file.file_offset);
    let ze = table.zone_index_of(file.file_offset + file.io_size);
    let all_zones = job.options.verify
        && job.options.directions.writes()
        && job.run_state() != RunState::Verifying;
    reset_zones(job, file, zb, ze, all_zones)
}
