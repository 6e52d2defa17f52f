//! Per-zone state and the zone table
//!
//! Sector fields (`start`, `wp`, `zone_size`) are in 512-byte units; I/O
//! offsets and lengths arriving from the generator are in bytes. The table
//! mirrors the device: one record per zone plus one sentinel whose `start`
//! is the exclusive upper sector bound of the zoned range, which keeps
//! "next zone start" lookups branch-free.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};

use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};

use crate::device::{ZoneCondition, ZoneType, ZonedModel, SECTOR_SHIFT};

// =============================================================================
// Zone Lock
// =============================================================================

/// Ownable per-zone exclusion primitive.
///
/// Unlike a standard mutex guard, ownership is not tied to a stack frame:
/// the adjuster acquires the lock on a submission thread and a completion
/// on another thread releases it (see [`crate::zbd::ZoneReservation`]).
/// Non-recursive: helpers are passed the fact that the lock is held instead
/// of re-acquiring it.
pub(crate) struct ZoneLock {
    held: Mutex<bool>,
    unlocked: Condvar,
}

impl ZoneLock {
    fn new() -> Self {
        Self {
            held: Mutex::new(false),
            unlocked: Condvar::new(),
        }
    }

    /// Block until the lock is acquired.
    pub(crate) fn lock(&self) {
        let mut held = self.held.lock();
        while *held {
            self.unlocked.wait(&mut held);
        }
        *held = true;
    }

    /// Acquire the lock if it is free.
    #[allow(dead_code)]
    pub(crate) fn try_lock(&self) -> bool {
        let mut held = self.held.lock();
        if *held {
            false
        } else {
            *held = true;
            true
        }
    }

    /// Release the lock. The caller must hold it.
    pub(crate) fn unlock(&self) {
        let mut held = self.held.lock();
        debug_assert!(*held, "unlock of a zone lock that is not held");
        *held = false;
        self.unlocked.notify_one();
    }

    #[cfg(test)]
    pub(crate) fn is_locked(&self) -> bool {
        *self.held.lock()
    }
}

// =============================================================================
// Zone
// =============================================================================

/// State of one device zone.
///
/// `start`, type, and condition are fixed at table build time. The write
/// pointer, deferred-reset flag, and verify ordinal mutate during the run,
/// always under the zone lock; they are atomics so that unlocked readers
/// (the adjuster probing candidate zones) observe consistent values.
pub struct Zone {
    start: u64,
    ztype: ZoneType,
    cond: ZoneCondition,
    wp: AtomicU64,
    reset_zone: AtomicBool,
    verify_block: AtomicU32,
    pub(crate) lock: ZoneLock,
}

impl Zone {
    pub(crate) fn new(start: u64, ztype: ZoneType, cond: ZoneCondition, wp: u64) -> Self {
        Self {
            start,
            ztype,
            cond,
            wp: AtomicU64::new(wp),
            reset_zone: AtomicBool::new(false),
            verify_block: AtomicU32::new(0),
            lock: ZoneLock::new(),
        }
    }

    /// The past-the-end sentinel. Only `start` is meaningful.
    pub(crate) fn sentinel(start: u64) -> Self {
        Self::new(start, ZoneType::Conventional, ZoneCondition::NotWp, start)
    }

    /// Starting sector.
    pub fn start(&self) -> u64 {
        self.start
    }

    /// Starting byte offset.
    pub fn start_bytes(&self) -> u64 {
        self.start << SECTOR_SHIFT
    }

    pub fn ztype(&self) -> ZoneType {
        self.ztype
    }

    pub fn cond(&self) -> ZoneCondition {
        self.cond
    }

    /// Current write pointer in sectors.
    pub fn wp(&self) -> u64 {
        self.wp.load(Ordering::Acquire)
    }

    pub(crate) fn set_wp(&self, wp: u64) {
        self.wp.store(wp, Ordering::Release);
    }

    pub fn is_sequential(&self) -> bool {
        self.ztype.is_sequential()
    }

    pub fn is_offline(&self) -> bool {
        self.cond == ZoneCondition::Offline
    }

    /// Raise the deferred-reset flag; the adjuster consumes it on the next
    /// write routed to this zone.
    pub fn request_reset(&self) {
        self.reset_zone.store(true, Ordering::Release);
    }

    pub fn reset_pending(&self) -> bool {
        self.reset_zone.load(Ordering::Acquire)
    }

    pub(crate) fn clear_reset_request(&self) {
        self.reset_zone.store(false, Ordering::Release);
    }

    /// Replay ordinal of the next verification read in this zone.
    pub fn verify_block(&self) -> u32 {
        self.verify_block.load(Ordering::Acquire)
    }

    /// Return the current ordinal and advance it.
    pub(crate) fn take_verify_block(&self) -> u32 {
        self.verify_block.fetch_add(1, Ordering::AcqRel)
    }

    pub(crate) fn clear_verify_block(&self) {
        self.verify_block.store(0, Ordering::Release);
    }

    /// Point-in-time copy of the mutable state, for logging and stats.
    pub fn snapshot(&self) -> ZoneSnapshot {
        ZoneSnapshot {
            start: self.start,
            ztype: self.ztype,
            cond: self.cond,
            wp: self.wp(),
            reset_pending: self.reset_pending(),
            verify_block: self.verify_block(),
        }
    }
}

impl std::fmt::Debug for Zone {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Zone")
            .field("start", &self.start)
            .field("ztype", &self.ztype)
            .field("cond", &self.cond)
            .field("wp", &self.wp())
            .finish()
    }
}

/// Serializable copy of one zone's state.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ZoneSnapshot {
    pub start: u64,
    pub ztype: ZoneType,
    pub cond: ZoneCondition,
    pub wp: u64,
    pub reset_pending: bool,
    pub verify_block: u32,
}

// =============================================================================
// Zone Table
// =============================================================================

/// Per-device zone table: `nr_zones` real zones plus the sentinel.
///
/// Shared across every file that targets the same device path via
/// `Arc<ZoneTable>`; the strong count is the table's refcount and the last
/// drop tears it down.
pub struct ZoneTable {
    /// Uniform zone length in sectors
    zone_size: u64,
    /// log2 of the zone length in bytes, when it is a power of two
    zone_size_log2: Option<u32>,
    nr_zones: u32,
    model: ZonedModel,
    /// `nr_zones + 1` entries; the last is the sentinel
    zones: Box<[Zone]>,
}

impl ZoneTable {
    /// Build a table from real zones in ascending order. The sentinel is
    /// appended here.
    pub(crate) fn new(model: ZonedModel, zone_size: u64, zones: Vec<Zone>) -> Self {
        debug_assert!(!zones.is_empty());
        debug_assert!(zone_size > 0);
        let nr_zones = zones.len() as u32;
        let sentinel_start = zones.last().map(|z| z.start() + zone_size).unwrap_or(0);
        let mut zones = zones;
        zones.push(Zone::sentinel(sentinel_start));
        let zone_size_bytes = zone_size << SECTOR_SHIFT;
        let zone_size_log2 = zone_size_bytes
            .is_power_of_two()
            .then(|| zone_size_bytes.trailing_zeros());
        Self {
            zone_size,
            zone_size_log2,
            nr_zones,
            model,
            zones: zones.into_boxed_slice(),
        }
    }

    /// Uniform zone length in sectors.
    pub fn zone_size(&self) -> u64 {
        self.zone_size
    }

    /// Uniform zone length in bytes.
    pub fn zone_size_bytes(&self) -> u64 {
        self.zone_size << SECTOR_SHIFT
    }

    /// Count of real zones (the sentinel excluded).
    pub fn nr_zones(&self) -> u32 {
        self.nr_zones
    }

    pub fn model(&self) -> ZonedModel {
        self.model
    }

    /// Convert a byte offset into a zone index. Offsets in the first
    /// `zone_size` bytes past the device end map to the sentinel index.
    pub fn zone_index_of(&self, offset: u64) -> u32 {
        let idx = match self.zone_size_log2 {
            Some(log2) => offset >> log2,
            None => (offset >> SECTOR_SHIFT) / self.zone_size,
        };
        (idx as u32).min(self.nr_zones)
    }

    /// Zone record by index; `nr_zones` yields the sentinel.
    pub fn zone(&self, idx: u32) -> &Zone {
        &self.zones[idx as usize]
    }

    /// Starting sector of the zone after `idx`. Valid for every real zone;
    /// for the last one this is the sentinel's start.
    pub fn next_start(&self, idx: u32) -> u64 {
        self.zones[idx as usize + 1].start()
    }

    /// Iterate over the real zones.
    pub fn zones(&self) -> impl Iterator<Item = &Zone> {
        self.zones[..self.nr_zones as usize].iter()
    }

    /// Whether `required` more bytes would overrun a sequential zone's end.
    /// The caller must hold the zone's lock for the answer to be stable.
    pub fn zone_full(&self, z: &Zone, required: u64) -> bool {
        debug_assert_eq!(required & (crate::device::SECTOR_SIZE - 1), 0);
        z.is_sequential() && z.wp() + (required >> SECTOR_SHIFT) > z.start() + self.zone_size
    }

    /// Serializable copy of the whole table.
    pub fn snapshot(&self) -> ZoneTableSnapshot {
        ZoneTableSnapshot {
            zone_size: self.zone_size,
            nr_zones: self.nr_zones,
            model: self.model,
            zones: self.zones().map(Zone::snapshot).collect(),
        }
    }
}

impl std::fmt::Debug for ZoneTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ZoneTable")
            .field("zone_size", &self.zone_size)
            .field("nr_zones", &self.nr_zones)
            .field("model", &self.model)
            .finish()
    }
}

/// Serializable copy of a zone table's state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ZoneTableSnapshot {
    pub zone_size: u64,
    pub nr_zones: u32,
    pub model: ZonedModel,
    pub zones: Vec<ZoneSnapshot>,
}
