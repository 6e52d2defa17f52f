//! Zoned Block Device I/O Adaptation
//!
//! Retargets the raw read/write/trim requests of a zone-oblivious workload
//! generator so that every issued request is legal on a host-aware or
//! host-managed zoned block device, preserving the sequential-write-pointer
//! discipline the device demands.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │                      Zone Adaptation Core                            │
//! ├──────────────────────────────────────────────────────────────────────┤
//! │                                                                      │
//! │  ┌─────────────┐   ┌──────────────┐   ┌──────────────────────────┐   │
//! │  │   Builder   │──▶│  Zone Table  │◀──│   Reset Engine           │   │
//! │  │ (discovery) │   │ (wp + locks) │   │ (up-front + on demand)   │   │
//! │  └─────────────┘   └──────┬───────┘   └──────────────────────────┘   │
//! │                           │                                          │
//! │                           ▼                                          │
//! │                 ┌───────────────────┐     ┌──────────────────────┐   │
//! │   I/O unit ────▶│     Adjuster      │────▶│   ZoneReservation    │   │
//! │                 │ (rewrite offset,  │     │ (lock handed off to  │   │
//! │                 │  length, or zone) │     │  the completion)     │   │
//! │                 └───────────────────┘     └──────────────────────┘   │
//! │                                                                      │
//! └──────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Components
//!
//! - **Zone table** (`zone.rs`): one record per device zone plus a sentinel,
//!   each with its own lock and write pointer.
//! - **Builder** (`builder.rs`): discovers the zoning model, materializes
//!   the table from the device's zone report (or synthesizes one for
//!   regular devices), and shares tables across files by device path.
//! - **Validation** (`validate.rs`): direct-I/O requirement, range rounding
//!   to zone boundaries, block-size divisibility.
//! - **Reset engine** (`reset.rs`): coalesced zone resets, up-front before
//!   verifying write passes and on demand from the write path.
//! - **Adjuster** (`adjust.rs`): the per-request policy core and the
//!   lock-handoff reservation consumed on completion.
//!
//! # Usage
//!
//! ```rust,ignore
//! use zonebench::workload::{Job, JobOptions, IoUnit};
//! use zonebench::zbd::{self, AdjustAction, ZoneTableRegistry};
//!
//! let registry = ZoneTableRegistry::new();
//! zbd::init(&mut job, &registry)?;
//! for file in &job.files {
//!     zbd::file_reset(&job, file)?;
//! }
//!
//! let mut io = IoUnit::write(offset, buflen);
//! match zbd::adjust_block(&job, &job.files[0], &mut io) {
//!     AdjustAction::Accept => { /* submit io as-is */ }
//!     AdjustAction::AcceptReserved(res) => {
//!         // submit io; on completion: res.complete(&io, success)
//!     }
//!     AdjustAction::Eof => { /* soft end-of-file for this request */ }
//! }
//! ```

pub mod adjust;
pub mod builder;
pub mod reset;
pub mod zone;

mod validate;

#[cfg(test)]
mod proptest;

pub use adjust::{adjust_block, AdjustAction, ZoneReservation};
pub use builder::{create_zone_table, ZoneTableRegistry};
pub use reset::{file_reset, reset_range, reset_zones};
pub use zone::{Zone, ZoneSnapshot, ZoneTable, ZoneTableSnapshot};

use tracing::instrument;

use crate::device::SECTOR_SHIFT;
use crate::error::{Error, Result};
use crate::workload::{FileKind, Job, ZoneMode};

/// Build (or share) the zone table of every block-device file in the job,
/// then validate the configuration against the resulting geometry.
///
/// Idempotent per file: files that already carry a table are left alone,
/// and files naming an already-known device share its table through the
/// registry. Must run before any I/O is issued.
#[instrument(skip_all)]
pub fn init(job: &mut Job, registry: &ZoneTableRegistry) -> Result<()> {
    job.options.validate()?;
    if job.options.zone_mode != ZoneMode::Zbd {
        return Ok(());
    }

    let options = job.options.clone();
    for file in &mut job.files {
        if file.kind != FileKind::BlockDevice || file.zone_table.is_some() {
            continue;
        }
        let dev = file.device.clone().ok_or_else(|| {
            Error::Config(format!(
                "{}: zbd mode requires an open device handle",
                file.name
            ))
        })?;
        if file.real_file_size == 0 {
            file.real_file_size = dev.capacity_sectors()? << SECTOR_SHIFT;
            if file.io_size == 0 {
                file.io_size = file.real_file_size - file.file_offset;
            }
        }
        file.zone_table = Some(registry.get_or_build(&options, file, dev.as_ref())?);
    }

    validate::verify_direct_io(job)?;
    validate::verify_sizes(job)?;
    validate::verify_block_sizes(job)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::mock::MockZonedDevice;
    use crate::workload::{DirectionMask, JobFile, JobOptions};
    use std::sync::Arc;

    const ZS: u64 = 1 << 11; // 1 MiB zones in sectors
    const ZS_BYTES: u64 = ZS << 9;

    fn block_file(dev: &Arc<MockZonedDevice>, size_bytes: u64) -> JobFile {
        JobFile::new("/dev/nullb0", FileKind::BlockDevice, size_bytes).with_device(dev.clone())
    }

    #[test]
    fn test_init_builds_tables_and_validates() {
        let registry = ZoneTableRegistry::new();
        let dev = Arc::new(MockZonedDevice::host_managed(8, ZS));
        let mut job = Job::new(JobOptions::zbd())
            .with_files(vec![block_file(&dev, 8 * ZS_BYTES)]);

        init(&mut job, &registry).unwrap();
        let table = job.files[0].zone_table.as_ref().unwrap();
        assert_eq!(table.nr_zones(), 8);
        assert_eq!(registry.live_tables(), 1);
    }

    #[test]
    fn test_init_is_idempotent_per_file() {
        let registry = ZoneTableRegistry::new();
        let dev = Arc::new(MockZonedDevice::host_managed(8, ZS));
        let mut job = Job::new(JobOptions::zbd())
            .with_files(vec![block_file(&dev, 8 * ZS_BYTES)]);

        init(&mut job, &registry).unwrap();
        let first = job.files[0].zone_table.clone().unwrap();
        init(&mut job, &registry).unwrap();
        assert!(Arc::ptr_eq(&first, job.files[0].zone_table.as_ref().unwrap()));
    }

    #[test]
    fn test_init_shares_tables_between_files_of_one_device() {
        let registry = ZoneTableRegistry::new();
        let dev = Arc::new(MockZonedDevice::host_managed(8, ZS));
        let mut job = Job::new(JobOptions::zbd()).with_files(vec![
            block_file(&dev, 8 * ZS_BYTES),
            block_file(&dev, 8 * ZS_BYTES),
        ]);

        init(&mut job, &registry).unwrap();
        let a = job.files[0].zone_table.as_ref().unwrap();
        let b = job.files[1].zone_table.as_ref().unwrap();
        assert!(Arc::ptr_eq(a, b));
        assert_eq!(registry.live_tables(), 1);
    }

    #[test]
    fn test_init_skips_non_zbd_jobs_and_regular_files() {
        let registry = ZoneTableRegistry::new();
        let dev = Arc::new(MockZonedDevice::host_managed(8, ZS));

        let mut job = Job::new(JobOptions::default())
            .with_files(vec![block_file(&dev, 8 * ZS_BYTES)]);
        init(&mut job, &registry).unwrap();
        assert!(job.files[0].zone_table.is_none());

        let file = JobFile::new("data.bin", FileKind::Regular, 8 * ZS_BYTES);
        let mut job = Job::new(JobOptions::zbd()).with_files(vec![file]);
        init(&mut job, &registry).unwrap();
        assert!(job.files[0].zone_table.is_none());
    }

    #[test]
    fn test_init_rejects_buffered_host_managed_writers() {
        let registry = ZoneTableRegistry::new();
        let dev = Arc::new(MockZonedDevice::host_managed(8, ZS));
        let mut opts = JobOptions::zbd();
        opts.directions = DirectionMask::write_only();
        let mut job = Job::new(opts).with_files(vec![block_file(&dev, 8 * ZS_BYTES)]);

        assert!(matches!(
            init(&mut job, &registry),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn test_init_sizes_file_from_device_capacity() {
        let registry = ZoneTableRegistry::new();
        let dev = Arc::new(MockZonedDevice::host_managed(8, ZS));
        let mut job = Job::new(JobOptions::zbd())
            .with_files(vec![block_file(&dev, 0)]);

        init(&mut job, &registry).unwrap();
        let file = &job.files[0];
        assert_eq!(file.real_file_size, 8 * ZS_BYTES);
        assert_eq!(file.io_size, 8 * ZS_BYTES);
        assert_eq!(file.zone_table.as_ref().unwrap().nr_zones(), 8);
    }

    #[test]
    fn test_dropping_last_handle_tears_table_down() {
        let registry = ZoneTableRegistry::new();
        let dev = Arc::new(MockZonedDevice::host_managed(8, ZS));
        let mut job = Job::new(JobOptions::zbd())
            .with_files(vec![block_file(&dev, 8 * ZS_BYTES)]);
        init(&mut job, &registry).unwrap();
        assert_eq!(registry.live_tables(), 1);

        job.files[0].zone_table = None;
        assert_eq!(registry.live_tables(), 0);
    }
}
