//! Request adjustment and completion
//!
//! Every candidate I/O unit flows through [`adjust_block`] before
//! submission. Conventional zones pass through untouched. For sequential
//! zones the adjuster rewrites the offset (and possibly the length), may
//! substitute a different zone entirely, and returns a [`ZoneReservation`]
//! that owns the zone lock. The submission path stores the reservation in
//! the I/O unit; the completion path consumes it, which updates the write
//! pointer and releases the lock. Exactly one release happens per
//! reservation, by construction.

use std::sync::Arc;

use tracing::{debug, error};

use crate::device::SECTOR_SHIFT;
use crate::workload::{IoDirection, IoUnit, Job, JobFile, RunState};

use super::reset;
use super::zone::ZoneTable;

// =============================================================================
// Adjustment Outcome
// =============================================================================

/// Outcome of adjusting one I/O unit.
pub enum AdjustAction {
    /// Issue as-is; no zone lock is held (conventional zone, or a read
    /// allowed past the write pointer)
    Accept,

    /// Issue the (possibly rewritten) request; the reservation holds the
    /// target zone's lock until completion
    AcceptReserved(ZoneReservation),

    /// The request cannot be mapped to any legal zone; the generator
    /// should treat it as a soft end-of-file
    Eof,
}

impl AdjustAction {
    pub fn is_accepted(&self) -> bool {
        !matches!(self, AdjustAction::Eof)
    }

    pub fn is_eof(&self) -> bool {
        matches!(self, AdjustAction::Eof)
    }

    /// Take the reservation, if this outcome carries one.
    pub fn into_reservation(self) -> Option<ZoneReservation> {
        match self {
            AdjustAction::AcceptReserved(res) => Some(res),
            _ => None,
        }
    }
}

impl std::fmt::Debug for AdjustAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AdjustAction::Accept => write!(f, "Accept"),
            AdjustAction::AcceptReserved(res) => {
                write!(f, "AcceptReserved(zone {})", res.zone_index())
            }
            AdjustAction::Eof => write!(f, "Eof"),
        }
    }
}

// =============================================================================
// Zone Reservation
// =============================================================================

/// Ownership of one sequential zone's lock, handed from the adjustment
/// thread to whichever thread completes the I/O.
///
/// [`ZoneReservation::complete`] applies the write-pointer update and
/// consumes the reservation; dropping it without completing releases the
/// lock without advancing the pointer, so an engine that abandons a
/// request cannot wedge the zone.
pub struct ZoneReservation {
    table: Arc<ZoneTable>,
    zone_idx: u32,
}

impl ZoneReservation {
    fn acquire(table: Arc<ZoneTable>, zone_idx: u32) -> Self {
        table.zone(zone_idx).lock.lock();
        Self { table, zone_idx }
    }

    /// Index of the reserved zone.
    pub fn zone_index(&self) -> u32 {
        self.zone_idx
    }

    /// Record the completion of the reserved I/O unit and release the
    /// zone. On a successful write the write pointer advances to the end
    /// of the request, capped at the zone boundary in case the submitted
    /// length was larger than the remainder.
    pub fn complete(self, io: &IoUnit, success: bool) {
        let zone_idx = self.table.zone_index_of(io.offset);
        debug_assert_eq!(zone_idx, self.zone_idx);
        debug_assert!(zone_idx < self.table.nr_zones());
        let z = self.table.zone(zone_idx);
        if !z.is_sequential() {
            // Reservations are only created for sequential zones.
            return;
        }
        if success {
            match io.ddir {
                IoDirection::Write => {
                    let end = (io.offset + io.buflen) >> SECTOR_SHIFT;
                    z.set_wp(end.min(self.table.next_start(zone_idx)));
                }
                IoDirection::Trim => {
                    // Trim semantics include the reset; the device has
                    // already rewound the zone.
                    debug_assert_eq!(z.wp(), z.start());
                }
                _ => {}
            }
        }
        // Dropping `self` releases the zone lock.
    }
}

impl Drop for ZoneReservation {
    fn drop(&mut self) {
        self.table.zone(self.zone_idx).lock.unlock();
    }
}

impl std::fmt::Debug for ZoneReservation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ZoneReservation")
            .field("zone_idx", &self.zone_idx)
            .finish()
    }
}

// =============================================================================
// Adjustment
// =============================================================================

/// Adjust the offset and length of an I/O unit as necessary for zoned
/// devices.
///
/// Returns [`AdjustAction::AcceptReserved`] if and only if the resolved
/// zone is sequential; the reservation then holds that zone's lock and the
/// zone is the one containing `io.offset` on return.
pub fn adjust_block(job: &Job, file: &JobFile, io: &mut IoUnit) -> AdjustAction {
    let Some(table) = &file.zone_table else {
        return AdjustAction::Accept;
    };
    debug_assert!(file.contains_offset(io.offset));
    debug_assert!(io.buflen > 0 || !io.ddir.transfers_data());

    let zone_idx = table.zone_index_of(io.offset);

    // Conventional zones (and the sentinel) take arbitrary I/O as-is.
    if !table.zone(zone_idx).is_sequential() {
        return AdjustAction::Accept;
    }

    // Reads past the write pointer don't hit the medium, but the job may
    // ask for them anyway.
    if !table.zone(zone_idx).is_offline()
        && io.ddir == IoDirection::Read
        && job.options.read_beyond_wp
    {
        return AdjustAction::Accept;
    }

    let res = ZoneReservation::acquire(Arc::clone(table), zone_idx);
    match io.ddir {
        IoDirection::Read => adjust_read(job, file, table, io, res),
        IoDirection::Write => adjust_write(job, file, table, io, res),
        // Trim returns a zone to empty; it and the sync directions keep
        // the reservation so completion ordering matches writes.
        _ => AdjustAction::AcceptReserved(res),
    }
}

/// The k-th verification read in a zone must target the same offset the
/// k-th write did, so verification replays the write order via the per-zone
/// ordinal. The caller holds the zone's lock.
fn replay_write_order(job: &Job, file: &JobFile, table: &ZoneTable, io: &mut IoUnit, zone_idx: u32) {
    let min_bs = job.options.min_bs.write;
    let z = table.zone(zone_idx);
    let block = z.take_verify_block();
    if u64::from(block) * min_bs >= table.zone_size_bytes() {
        error!(
            file = %file.name,
            zone = zone_idx,
            block,
            min_bs,
            "verify replay ran past the zone end"
        );
    }
    io.offset = z.start_bytes() + u64::from(block) * min_bs;
}

fn adjust_read(
    job: &Job,
    file: &JobFile,
    table: &Arc<ZoneTable>,
    io: &mut IoUnit,
    res: ZoneReservation,
) -> AdjustAction {
    let min_bs = job.options.min_bs.read;
    let mut res = res;
    let mut zone_idx = res.zone_index();

    if job.run_state() == RunState::Verifying {
        replay_write_order(job, file, table, io, zone_idx);
        return AdjustAction::AcceptReserved(res);
    }

    let z = table.zone(zone_idx);
    if !z.is_offline() {
        // Readable span below the write pointer, minus the request.
        let data = (z.wp() - z.start()) << SECTOR_SHIFT;
        let range = data as i64 - io.buflen as i64;
        if job.random() && range >= 0 {
            let zone_start = z.start_bytes();
            io.offset = zone_start + ((io.offset - zone_start) % (range as u64 + 1)) / min_bs * min_bs;
            debug_assert!(zone_start <= io.offset);
            debug_assert!(io.offset + io.buflen <= z.wp() << SECTOR_SHIFT);
            return AdjustAction::AcceptReserved(res);
        }
    }

    if z.is_offline() || (io.offset + io.buflen) >> SECTOR_SHIFT > z.wp() {
        // This zone can't serve the read. Release it before probing the
        // neighbors so lock acquisition stays ordered by zone index.
        drop(res);
        let zl = table.zone_index_of(file.file_offset + file.io_size);
        match find_zone(job, file, table, io, zone_idx, zl) {
            Some(substitute) => {
                zone_idx = substitute.zone_index();
                io.offset = table.zone(zone_idx).start_bytes();
                res = substitute;
            }
            None => {
                debug!(
                    file = %file.name,
                    offset = io.offset,
                    buflen = io.buflen,
                    "no zone holds enough readable data"
                );
                return AdjustAction::Eof;
            }
        }
    }

    if (io.offset + io.buflen) >> SECTOR_SHIFT > table.zone(zone_idx).wp() {
        debug!(
            file = %file.name,
            offset = io.offset,
            buflen = io.buflen,
            wp = table.zone(zone_idx).wp(),
            "read does not fit below the write pointer"
        );
        return AdjustAction::Eof;
    }
    AdjustAction::AcceptReserved(res)
}

fn adjust_write(
    job: &Job,
    file: &JobFile,
    table: &Arc<ZoneTable>,
    io: &mut IoUnit,
    res: ZoneReservation,
) -> AdjustAction {
    let min_bs = job.options.min_bs.write;
    let zone_idx = res.zone_index();
    let z = table.zone(zone_idx);
    let orig_len = io.buflen;

    if io.buflen > table.zone_size_bytes() {
        return AdjustAction::Eof;
    }

    // Reset the zone first if it was flagged, or if not even one minimum
    // block fits before its end.
    if z.reset_pending() || table.zone_full(z, min_bs) {
        // Verifying jobs pre-reset in file_reset; a reset here would
        // destroy data that is still due to be verified.
        debug_assert!(!job.options.verify);
        // Earlier writes to this zone may still be in flight and the
        // reset below is synchronous: drain them first.
        job.quiesce();
        z.clear_reset_request();
        if reset::reset_zone_locked(file, table, zone_idx).is_err() {
            return AdjustAction::Eof;
        }
    }

    // Sequential zones take writes only at the write pointer.
    debug_assert!(!table.zone_full(z, min_bs));
    io.offset = z.wp() << SECTOR_SHIFT;
    if !file.contains_offset(io.offset) {
        debug!(
            file = %file.name,
            offset = io.offset,
            "dropped request with write pointer outside the I/O range"
        );
        return AdjustAction::Eof;
    }

    // Trim the request to the zone remainder, keeping it a multiple of
    // the minimum block size. Give up if shrinking leaves less than one
    // block.
    let remainder = (table.next_start(zone_idx) << SECTOR_SHIFT) - io.offset;
    let new_len = io.buflen.min(remainder) / min_bs * min_bs;
    if new_len == io.buflen {
        return AdjustAction::AcceptReserved(res);
    }
    if new_len >= min_bs {
        io.buflen = new_len;
        debug!(from = orig_len, to = new_len, "shrunk write to zone remainder");
        return AdjustAction::AcceptReserved(res);
    }
    error!(
        file = %file.name,
        remainder,
        min_bs,
        "zone remainder smaller than minimum block size"
    );
    AdjustAction::Eof
}

/// Find another zone with at least one full block of data below its write
/// pointer. The search walks outward from `zb`: upward toward `zl` and,
/// for random workloads, downward toward the start of the file's range.
/// Sequential workloads never probe downward and give up outright when the
/// upward walk reaches an offline zone, even if zones with data lie beyond
/// it.
///
/// Returns the substitute zone's reservation, lock held.
fn find_zone(
    job: &Job,
    file: &JobFile,
    table: &Arc<ZoneTable>,
    io: &IoUnit,
    zb: u32,
    zl: u32,
) -> Option<ZoneReservation> {
    let min_bs_sectors = job.options.min_bs.for_dir(io.ddir) >> SECTOR_SHIFT;
    let zf = i64::from(table.zone_index_of(file.file_offset));
    let random = job.random();

    let mut z1 = zb + 1;
    let mut z2 = i64::from(zb) - 1;
    while z1 < zl || z2 >= zf {
        if z1 < zl && !table.zone(z1).is_offline() {
            let res = ZoneReservation::acquire(Arc::clone(table), z1);
            let z = table.zone(z1);
            if z.start() + min_bs_sectors <= z.wp() {
                return Some(res);
            }
            drop(res);
        } else if !random {
            break;
        }
        if random && z2 >= zf {
            let idx = z2 as u32;
            if !table.zone(idx).is_offline() {
                let res = ZoneReservation::acquire(Arc::clone(table), idx);
                let z = table.zone(idx);
                if z.start() + min_bs_sectors <= z.wp() {
                    return Some(res);
                }
                drop(res);
            }
        }
        z1 += 1;
        z2 -= 1;
    }
    debug!(file = %file.name, "adjusting read offset to another zone failed");
    None
}
