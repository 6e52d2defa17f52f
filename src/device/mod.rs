//! Zoned block device abstraction
//!
//! The adaptation core never talks to the kernel directly. Everything it
//! needs from a device — the zoning model, the zone report, the zone reset —
//! goes through the [`ZonedDevice`] trait, so the same policy code runs
//! against a real Linux block device ([`linux::LinuxBlockDevice`]) or an
//! in-memory test double ([`mock::MockZonedDevice`]).
//!
//! All sector quantities use 512-byte units, matching the kernel's zone
//! report ABI.

use serde::{Deserialize, Serialize};

use crate::error::Result;

#[cfg(target_os = "linux")]
pub mod linux;
#[cfg(any(test, feature = "mock-device"))]
pub mod mock;

/// Shift converting 512-byte sectors to bytes.
pub const SECTOR_SHIFT: u32 = 9;

/// Size of one sector in bytes.
pub const SECTOR_SIZE: u64 = 1 << SECTOR_SHIFT;

// =============================================================================
// Zoning Model
// =============================================================================

/// Zoning model reported by a block device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum ZonedModel {
    /// Regular block device; zone semantics are simulated in software
    #[default]
    None,

    /// Host-aware: sequential writes preferred, in-place writes tolerated
    HostAware,

    /// Host-managed: out-of-order writes to sequential zones are rejected
    HostManaged,
}

impl ZonedModel {
    /// Whether the device itself understands zone commands.
    pub fn is_zoned(&self) -> bool {
        matches!(self, ZonedModel::HostAware | ZonedModel::HostManaged)
    }
}

impl std::fmt::Display for ZonedModel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ZonedModel::None => write!(f, "none"),
            ZonedModel::HostAware => write!(f, "host-aware"),
            ZonedModel::HostManaged => write!(f, "host-managed"),
        }
    }
}

// =============================================================================
// Zone Descriptors
// =============================================================================

/// Type of a zone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ZoneType {
    /// Arbitrary in-place I/O permitted
    Conventional,

    /// Writes accepted only at the write pointer
    SeqWriteReq,
}

impl ZoneType {
    /// Map a raw kernel zone type. Sequential-write-preferred zones (raw
    /// value 3, reported by host-aware drives) accept in-place writes, so
    /// they are folded into [`ZoneType::Conventional`].
    pub fn from_raw(raw: u8) -> Option<Self> {
        match raw {
            1 | 3 => Some(ZoneType::Conventional),
            2 => Some(ZoneType::SeqWriteReq),
            _ => None,
        }
    }

    /// Whether writes must land on the write pointer.
    pub fn is_sequential(&self) -> bool {
        matches!(self, ZoneType::SeqWriteReq)
    }
}

/// Operational condition of a zone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum ZoneCondition {
    /// Zone has no write pointer (conventional zones)
    NotWp,

    /// Zone is empty
    #[default]
    Empty,

    /// Zone was implicitly opened by a write
    ImpOpen,

    /// Zone was explicitly opened
    ExpOpen,

    /// Zone was closed with data below the write pointer
    Closed,

    /// Zone is read-only
    ReadOnly,

    /// Write pointer is at the zone end
    Full,

    /// Zone is dead: no reads, no writes
    Offline,
}

impl ZoneCondition {
    /// Map a raw kernel zone condition.
    pub fn from_raw(raw: u8) -> Option<Self> {
        match raw {
            0x0 => Some(ZoneCondition::NotWp),
            0x1 => Some(ZoneCondition::Empty),
            0x2 => Some(ZoneCondition::ImpOpen),
            0x3 => Some(ZoneCondition::ExpOpen),
            0x4 => Some(ZoneCondition::Closed),
            0xd => Some(ZoneCondition::ReadOnly),
            0xe => Some(ZoneCondition::Full),
            0xf => Some(ZoneCondition::Offline),
            _ => None,
        }
    }
}

/// One record of a zone report, in 512-byte-sector units.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ZoneReportEntry {
    /// Starting sector of the zone
    pub start: u64,

    /// Zone length in sectors
    pub len: u64,

    /// Current write pointer in sectors
    pub wp: u64,

    /// Zone type
    pub ztype: ZoneType,

    /// Zone condition
    pub cond: ZoneCondition,
}

// =============================================================================
// Device Trait
// =============================================================================

/// The device operations the adaptation core consumes.
///
/// Implementations must be usable from multiple worker threads at once; the
/// core serializes conflicting zone operations itself via per-zone locks.
pub trait ZonedDevice: Send + Sync {
    /// Report the device's zoning model.
    fn model(&self) -> Result<ZonedModel>;

    /// Total device capacity in 512-byte sectors.
    fn capacity_sectors(&self) -> Result<u64>;

    /// Read up to `max` zone records starting at `start_sector`. Callers
    /// re-issue with an advanced start sector until all zones are read.
    fn report_zones(&self, start_sector: u64, max: usize) -> Result<Vec<ZoneReportEntry>>;

    /// Reset every zone fully contained in `[sector, sector + nr_sectors)`.
    /// Partial-zone spans are not supported.
    fn reset_range(&self, sector: u64, nr_sectors: u64) -> Result<()>;
}
