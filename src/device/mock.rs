//! Mock zoned device for testing without real hardware
//!
//! Provides an in-memory implementation of [`ZonedDevice`] with the same
//! observable behavior as a Linux zoned block device. Use this for:
//!
//! - Unit testing the zone table builder, reset engine, and adjuster
//! - Property tests that need arbitrary zone geometries
//! - CI pipelines with no zoned hardware (or no block devices at all)
//!
//! Fault injection covers the two ioctls the core depends on, so error
//! paths (report failure, reset failure) are testable too.

use std::sync::atomic::{AtomicBool, Ordering};

use nix::errno::Errno;
use parking_lot::Mutex;

use crate::error::{Error, Result};

use super::{ZoneCondition, ZoneReportEntry, ZoneType, ZonedDevice, ZonedModel};

#[derive(Debug, Clone, Copy)]
struct MockZone {
    start: u64,
    wp: u64,
    ztype: ZoneType,
    cond: ZoneCondition,
}

/// In-memory zoned block device.
pub struct MockZonedDevice {
    model: ZonedModel,
    zone_size: u64,
    capacity: u64,
    zones: Mutex<Vec<MockZone>>,
    reset_spans: Mutex<Vec<(u64, u64)>>,
    fail_report: AtomicBool,
    fail_reset: AtomicBool,
}

impl MockZonedDevice {
    /// Create a zoned device with `nr_zones` empty sequential zones of
    /// `zone_size` sectors each.
    pub fn new(model: ZonedModel, nr_zones: u32, zone_size: u64) -> Self {
        assert!(model.is_zoned(), "use MockZonedDevice::regular for model none");
        let zones = (0..u64::from(nr_zones))
            .map(|i| MockZone {
                start: i * zone_size,
                wp: i * zone_size,
                ztype: ZoneType::SeqWriteReq,
                cond: ZoneCondition::Empty,
            })
            .collect();
        Self {
            model,
            zone_size,
            capacity: u64::from(nr_zones) * zone_size,
            zones: Mutex::new(zones),
            reset_spans: Mutex::new(Vec::new()),
            fail_report: AtomicBool::new(false),
            fail_reset: AtomicBool::new(false),
        }
    }

    /// Create a host-managed device, the common test configuration.
    pub fn host_managed(nr_zones: u32, zone_size: u64) -> Self {
        Self::new(ZonedModel::HostManaged, nr_zones, zone_size)
    }

    /// Create a regular (non-zoned) device of `capacity` sectors. Zone
    /// reports fail the way they do on real regular devices.
    pub fn regular(capacity: u64) -> Self {
        Self {
            model: ZonedModel::None,
            zone_size: 0,
            capacity,
            zones: Mutex::new(Vec::new()),
            reset_spans: Mutex::new(Vec::new()),
            fail_report: AtomicBool::new(false),
            fail_reset: AtomicBool::new(false),
        }
    }

    // =========================================================================
    // Test Setup
    // =========================================================================

    /// Set a zone's write pointer (absolute sectors).
    pub fn set_wp(&self, idx: u32, wp: u64) {
        let mut zones = self.zones.lock();
        let z = &mut zones[idx as usize];
        assert!(z.start <= wp && wp <= z.start + self.zone_size);
        z.wp = wp;
        z.cond = if wp == z.start {
            ZoneCondition::Empty
        } else if wp == z.start + self.zone_size {
            ZoneCondition::Full
        } else {
            ZoneCondition::ImpOpen
        };
    }

    /// Override a zone's condition.
    pub fn set_cond(&self, idx: u32, cond: ZoneCondition) {
        self.zones.lock()[idx as usize].cond = cond;
    }

    /// Turn a zone into a conventional zone.
    pub fn set_conventional(&self, idx: u32) {
        let mut zones = self.zones.lock();
        let z = &mut zones[idx as usize];
        z.ztype = ZoneType::Conventional;
        z.cond = ZoneCondition::NotWp;
        z.wp = z.start;
    }

    /// Make every subsequent zone report fail with EIO.
    pub fn fail_reports(&self, fail: bool) {
        self.fail_report.store(fail, Ordering::Relaxed);
    }

    /// Make every subsequent zone reset fail with EIO.
    pub fn fail_resets(&self, fail: bool) {
        self.fail_reset.store(fail, Ordering::Relaxed);
    }

    // =========================================================================
    // Test Observation
    // =========================================================================

    /// Sector spans passed to `reset_range`, in call order.
    pub fn reset_spans(&self) -> Vec<(u64, u64)> {
        self.reset_spans.lock().clone()
    }

    /// Number of `reset_range` calls issued so far.
    pub fn reset_calls(&self) -> usize {
        self.reset_spans.lock().len()
    }

    /// Current write pointer of a zone, as the device sees it.
    pub fn device_wp(&self, idx: u32) -> u64 {
        self.zones.lock()[idx as usize].wp
    }
}

impl ZonedDevice for MockZonedDevice {
    fn model(&self) -> Result<ZonedModel> {
        Ok(self.model)
    }

    fn capacity_sectors(&self) -> Result<u64> {
        Ok(self.capacity)
    }

    fn report_zones(&self, start_sector: u64, max: usize) -> Result<Vec<ZoneReportEntry>> {
        if self.fail_report.load(Ordering::Relaxed) {
            return Err(Error::Ioctl {
                op: "BLKREPORTZONE",
                source: Errno::EIO,
            });
        }
        if !self.model.is_zoned() {
            // Regular devices don't implement the report ioctl.
            return Err(Error::Ioctl {
                op: "BLKREPORTZONE",
                source: Errno::ENOTTY,
            });
        }
        let zones = self.zones.lock();
        Ok(zones
            .iter()
            .filter(|z| z.start + self.zone_size > start_sector)
            .take(max)
            .map(|z| ZoneReportEntry {
                start: z.start,
                len: self.zone_size,
                wp: z.wp,
                ztype: z.ztype,
                cond: z.cond,
            })
            .collect())
    }

    fn reset_range(&self, sector: u64, nr_sectors: u64) -> Result<()> {
        if self.fail_reset.load(Ordering::Relaxed) {
            return Err(Error::Ioctl {
                op: "BLKRESETZONE",
                source: Errno::EIO,
            });
        }
        if !self.model.is_zoned() {
            return Err(Error::Ioctl {
                op: "BLKRESETZONE",
                source: Errno::ENOTTY,
            });
        }
        if sector % self.zone_size != 0 || nr_sectors % self.zone_size != 0 {
            // Partial-zone spans are rejected by the kernel.
            return Err(Error::Ioctl {
                op: "BLKRESETZONE",
                source: Errno::EINVAL,
            });
        }
        let mut zones = self.zones.lock();
        for z in zones
            .iter_mut()
            .filter(|z| z.start >= sector && z.start < sector + nr_sectors)
        {
            if z.ztype.is_sequential() {
                z.wp = z.start;
                z.cond = ZoneCondition::Empty;
            }
        }
        self.reset_spans.lock().push((sector, nr_sectors));
        Ok(())
    }
}
