//! Linux block device backend
//!
//! Talks to the kernel the same way blktests-era tooling does: the zoning
//! model comes from the per-device sysfs attribute
//! `/sys/dev/block/<major>:<minor>/queue/zoned`, zone descriptors from the
//! `BLKREPORTZONE` ioctl, and resets from `BLKRESETZONE`.

use std::fs::{self, File, OpenOptions};
use std::mem;
use std::os::unix::fs::MetadataExt;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::error::{Error, Result};

use super::{ZoneCondition, ZoneReportEntry, ZoneType, ZonedDevice, ZonedModel, SECTOR_SHIFT};

/// FFI definitions mirroring `<linux/blkzoned.h>` and `<linux/fs.h>`. The
/// ioctls can't go in libc because they use Nix's macros, and the structs
/// are not a stable interface the kernel exports to crates.
#[doc(hidden)]
mod ffi {
    use nix::{ioctl_read, ioctl_readwrite, ioctl_write_ptr};

    #[repr(C)]
    #[derive(Clone, Copy)]
    #[doc(hidden)]
    pub struct blk_zone {
        pub start: u64,
        pub len: u64,
        pub wp: u64,
        pub zone_type: u8,
        pub cond: u8,
        pub non_seq: u8,
        pub reset: u8,
        pub resv: [u8; 4],
        pub capacity: u64,
        pub reserved: [u8; 24],
    }

    #[repr(C)]
    #[doc(hidden)]
    pub struct blk_zone_report {
        pub sector: u64,
        pub nr_zones: u32,
        pub flags: u32,
        // struct blk_zone zones[] follows the header in memory.
    }

    #[repr(C)]
    #[doc(hidden)]
    pub struct blk_zone_range {
        pub sector: u64,
        pub nr_sectors: u64,
    }

    ioctl_read! {
        /// BLKGETSIZE64: device size in bytes
        #[doc(hidden)]
        blkgetsize64, 0x12, 114, u64
    }

    ioctl_readwrite! {
        /// BLKREPORTZONE: read zone descriptors
        #[doc(hidden)]
        blkreportzone, 0x12, 130, blk_zone_report
    }

    ioctl_write_ptr! {
        /// BLKRESETZONE: reset all zones in a sector range
        #[doc(hidden)]
        blkresetzone, 0x12, 131, blk_zone_range
    }
}

/// Upper bound on zone records fetched per `BLKREPORTZONE` call.
const REPORT_CHUNK_ZONES: usize = 4096;

/// A real zoned (or regular) block device.
pub struct LinuxBlockDevice {
    file: File,
    path: PathBuf,
}

impl LinuxBlockDevice {
    /// Open a block device node. The descriptor is opened read-write
    /// because `BLKRESETZONE` requires write permission.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new().read(true).write(true).open(&path)?;
        Ok(Self { file, path })
    }

    /// The device node this handle refers to.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn sysfs_zoned_attr_path(&self) -> Result<PathBuf> {
        let meta = fs::metadata(&self.path)?;
        let rdev = meta.rdev();
        let major = nix::sys::stat::major(rdev);
        let minor = nix::sys::stat::minor(rdev);
        Ok(PathBuf::from(format!(
            "/sys/dev/block/{major}:{minor}/queue/zoned"
        )))
    }
}

/// Interpret the first line of the sysfs `queue/zoned` attribute. Anything
/// other than the two literal zoned strings means a regular device.
fn parse_zoned_model(attr: &str) -> ZonedModel {
    match attr.lines().next().map(str::trim) {
        Some("host-aware") => ZonedModel::HostAware,
        Some("host-managed") => ZonedModel::HostManaged,
        _ => ZonedModel::None,
    }
}

fn entry_from_raw(path: &Path, raw: &ffi::blk_zone) -> Result<ZoneReportEntry> {
    let ztype = ZoneType::from_raw(raw.zone_type).ok_or_else(|| {
        Error::Io(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("{}: unknown zone type {}", path.display(), raw.zone_type),
        ))
    })?;
    let cond = ZoneCondition::from_raw(raw.cond).ok_or_else(|| {
        Error::Io(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("{}: unknown zone condition {}", path.display(), raw.cond),
        ))
    })?;
    Ok(ZoneReportEntry {
        start: raw.start,
        len: raw.len,
        wp: raw.wp,
        ztype,
        cond,
    })
}

impl ZonedDevice for LinuxBlockDevice {
    fn model(&self) -> Result<ZonedModel> {
        let attr_path = self.sysfs_zoned_attr_path()?;
        let model = match fs::read_to_string(&attr_path) {
            Ok(attr) => parse_zoned_model(&attr),
            // No queue/zoned attribute: old kernel or not a block device
            // queue. Either way the device can't execute zone commands.
            Err(ref e) if e.kind() == std::io::ErrorKind::NotFound => ZonedModel::None,
            Err(e) => return Err(e.into()),
        };
        debug!(path = %self.path.display(), %model, "zbd model");
        Ok(model)
    }

    fn capacity_sectors(&self) -> Result<u64> {
        let mut bytes: u64 = 0;
        unsafe { ffi::blkgetsize64(self.file.as_raw_fd(), &mut bytes) }.map_err(|source| {
            Error::Ioctl {
                op: "BLKGETSIZE64",
                source,
            }
        })?;
        Ok(bytes >> SECTOR_SHIFT)
    }

    fn report_zones(&self, start_sector: u64, max: usize) -> Result<Vec<ZoneReportEntry>> {
        let nr = max.min(REPORT_CHUNK_ZONES);
        let hdr_len = mem::size_of::<ffi::blk_zone_report>();
        let buf_len = hdr_len + nr * mem::size_of::<ffi::blk_zone>();
        // u64 backing storage keeps the header and zone records aligned.
        let mut buf: Vec<u64> = vec![0; buf_len.div_ceil(mem::size_of::<u64>())];
        let hdr = buf.as_mut_ptr() as *mut ffi::blk_zone_report;

        unsafe {
            (*hdr).sector = start_sector;
            (*hdr).nr_zones = nr as u32;
            ffi::blkreportzone(self.file.as_raw_fd(), hdr)
        }
        .map_err(|source| Error::Ioctl {
            op: "BLKREPORTZONE",
            source,
        })?;

        let returned = unsafe { (*hdr).nr_zones } as usize;
        let zones = unsafe { (hdr as *const u8).add(hdr_len) as *const ffi::blk_zone };
        (0..returned.min(nr))
            .map(|i| entry_from_raw(&self.path, unsafe { &*zones.add(i) }))
            .collect()
    }

    fn reset_range(&self, sector: u64, nr_sectors: u64) -> Result<()> {
        let range = ffi::blk_zone_range { sector, nr_sectors };
        unsafe { ffi::blkresetzone(self.file.as_raw_fd(), &range) }.map_err(|source| {
            Error::Ioctl {
                op: "BLKRESETZONE",
                source,
            }
        })?;
        Ok(())
    }
}
