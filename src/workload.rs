//! Workload-facing types
//!
//! The upstream generator produces raw I/O units without any knowledge of
//! zone constraints; the types here are the contract between that generator
//! and the adaptation core: job options, per-file state, the I/O unit that
//! flows through [`crate::zbd::adjust_block`], and the quiesce hook the I/O
//! engine registers so the core can drain in-flight writes before a
//! synchronous zone reset.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use nix::errno::Errno;
use serde::{Deserialize, Serialize};

use crate::device::ZonedDevice;
use crate::error::{Error, Result};
use crate::zbd::ZoneTable;

// =============================================================================
// Directions
// =============================================================================

/// Direction of one I/O unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum IoDirection {
    Read,
    Write,
    Trim,
    Sync,
    DataSync,
    Wait,
}

impl IoDirection {
    /// Whether this direction transfers data to or from the medium.
    pub fn transfers_data(&self) -> bool {
        matches!(self, IoDirection::Read | IoDirection::Write | IoDirection::Trim)
    }
}

/// Which data directions a job issues.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectionMask {
    pub read: bool,
    pub write: bool,
    pub trim: bool,
}

impl DirectionMask {
    pub fn read_only() -> Self {
        Self { read: true, write: false, trim: false }
    }

    pub fn write_only() -> Self {
        Self { read: false, write: true, trim: false }
    }

    pub fn read_write() -> Self {
        Self { read: true, write: true, trim: false }
    }

    /// Whether the job issues writes at all.
    pub fn writes(&self) -> bool {
        self.write
    }
}

impl Default for DirectionMask {
    fn default() -> Self {
        Self::read_only()
    }
}

/// Per-direction block sizes in bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockSizes {
    pub read: u64,
    pub write: u64,
    pub trim: u64,
}

impl BlockSizes {
    /// Uniform block size across all data directions.
    pub fn uniform(bs: u64) -> Self {
        Self { read: bs, write: bs, trim: bs }
    }

    /// Block size for a data direction. Non-data directions carry no
    /// payload and are never consulted.
    pub fn for_dir(&self, dir: IoDirection) -> u64 {
        match dir {
            IoDirection::Read => self.read,
            IoDirection::Trim => self.trim,
            _ => self.write,
        }
    }

    pub(crate) fn each(&self) -> [u64; 3] {
        [self.read, self.write, self.trim]
    }
}

impl Default for BlockSizes {
    fn default() -> Self {
        Self::uniform(4096)
    }
}

// =============================================================================
// Job Options
// =============================================================================

/// Zone handling mode. The adaptation core engages only for [`ZoneMode::Zbd`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum ZoneMode {
    #[default]
    None,
    Zbd,
}

/// Offset selection pattern of the workload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum WorkloadKind {
    #[default]
    Sequential,
    Random,
}

/// Job configuration recognized by the adaptation core.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobOptions {
    /// Zone handling mode; must be `Zbd` for this core to engage
    pub zone_mode: ZoneMode,

    /// Zone size in bytes. Zero means "derive from the device"; mandatory
    /// non-zero for regular block devices simulating zone semantics.
    pub zone_size: u64,

    /// Whether written data is verified (enables pre-reset and replay
    /// ordering)
    pub verify: bool,

    /// Allow reads past a zone's write pointer
    pub read_beyond_wp: bool,

    /// Direct (unbuffered) I/O
    pub odirect: bool,

    /// Offset selection pattern
    pub workload: WorkloadKind,

    /// Data directions the job issues
    pub directions: DirectionMask,

    /// Minimum block size per direction, bytes
    pub min_bs: BlockSizes,

    /// Maximum block size per direction, bytes
    pub max_bs: BlockSizes,

    /// Errno values the device uses to reject unaligned zone writes
    pub unaligned_write_errnos: Vec<i32>,
}

impl Default for JobOptions {
    fn default() -> Self {
        Self {
            zone_mode: ZoneMode::None,
            zone_size: 0,
            verify: false,
            read_beyond_wp: false,
            odirect: false,
            workload: WorkloadKind::Sequential,
            directions: DirectionMask::default(),
            min_bs: BlockSizes::default(),
            max_bs: BlockSizes::default(),
            unaligned_write_errnos: vec![Errno::EIO as i32, Errno::EREMOTEIO as i32],
        }
    }
}

impl JobOptions {
    /// Options with the zoned-block-device core engaged.
    pub fn zbd() -> Self {
        Self { zone_mode: ZoneMode::Zbd, ..Default::default() }
    }

    /// Zbd options with an explicit zone size in bytes.
    pub fn zbd_with_zone_size(zone_size: u64) -> Self {
        Self { zone_size, ..Self::zbd() }
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        if self.zone_mode == ZoneMode::Zbd && self.zone_size != 0 && self.zone_size < 512 {
            return Err(Error::Config(
                "zone size must be at least 512 bytes for zone_mode=zbd".into(),
            ));
        }
        for (min, max) in self.min_bs.each().into_iter().zip(self.max_bs.each()) {
            if min == 0 {
                return Err(Error::Config("block sizes must be non-zero".into()));
            }
            if max < min {
                return Err(Error::Config("max_bs must be >= min_bs".into()));
            }
        }
        Ok(())
    }

    /// Classify an I/O error as a zone-alignment rejection, so the
    /// generator can suppress retries of legitimately-rejected writes.
    pub fn is_unaligned_write_error(&self, errno: i32) -> bool {
        self.unaligned_write_errnos.contains(&errno)
    }
}

// =============================================================================
// Files
// =============================================================================

/// Kind of file the generator targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FileKind {
    BlockDevice,
    Regular,
}

/// Per-file state: the target, its I/O range, and (after init) its zone
/// table handle.
pub struct JobFile {
    /// Device path or file name; also the zone table sharing key
    pub name: String,

    /// Kind of target
    pub kind: FileKind,

    /// Start of the I/O range in bytes; rounded up to a zone boundary by
    /// validation when the range covers sequential zones
    pub file_offset: u64,

    /// Length of the I/O range in bytes; rounded down likewise
    pub io_size: u64,

    /// Total file/device size in bytes
    pub real_file_size: u64,

    /// Open device handle; required for block devices in zbd mode
    pub device: Option<Arc<dyn ZonedDevice>>,

    /// Zone table, populated by [`crate::zbd::init`]. Dropping the last
    /// handle for a device tears the table down.
    pub zone_table: Option<Arc<ZoneTable>>,
}

impl JobFile {
    /// A file spanning the whole target.
    pub fn new(name: impl Into<String>, kind: FileKind, real_file_size: u64) -> Self {
        Self {
            name: name.into(),
            kind,
            file_offset: 0,
            io_size: real_file_size,
            real_file_size,
            device: None,
            zone_table: None,
        }
    }

    /// Attach the open device handle.
    pub fn with_device(mut self, device: Arc<dyn ZonedDevice>) -> Self {
        self.device = Some(device);
        self
    }

    /// Restrict the I/O range.
    pub fn with_range(mut self, file_offset: u64, io_size: u64) -> Self {
        self.file_offset = file_offset;
        self.io_size = io_size;
        self
    }

    /// Whether a byte offset falls inside the file's I/O range.
    pub fn contains_offset(&self, offset: u64) -> bool {
        offset.wrapping_sub(self.file_offset) < self.io_size
    }
}

impl std::fmt::Debug for JobFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobFile")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("file_offset", &self.file_offset)
            .field("io_size", &self.io_size)
            .field("real_file_size", &self.real_file_size)
            .field("zone_table", &self.zone_table.is_some())
            .finish()
    }
}

// =============================================================================
// Job
// =============================================================================

/// Phase the job is currently executing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum RunState {
    #[default]
    Running,
    Verifying,
}

/// Hook the I/O engine registers so the core can block until all in-flight
/// I/O issued by this job has completed. Invoked only on the write path,
/// immediately before a synchronous zone reset.
pub trait Quiesce: Send + Sync {
    fn quiesce(&self);
}

/// One generator job: options, files, and run state shared with the engine
/// threads.
pub struct Job {
    pub options: JobOptions,
    pub files: Vec<JobFile>,
    run_state: AtomicU8,
    quiesce: Option<Arc<dyn Quiesce>>,
}

impl Job {
    pub fn new(options: JobOptions) -> Self {
        Self {
            options,
            files: Vec::new(),
            run_state: AtomicU8::new(RunState::Running as u8),
            quiesce: None,
        }
    }

    pub fn with_files(mut self, files: Vec<JobFile>) -> Self {
        self.files = files;
        self
    }

    /// Register the engine's quiesce hook.
    pub fn set_quiesce(&mut self, quiesce: Arc<dyn Quiesce>) {
        self.quiesce = Some(quiesce);
    }

    /// Current phase. Engine threads read this on every adjustment.
    pub fn run_state(&self) -> RunState {
        if self.run_state.load(Ordering::Acquire) == RunState::Verifying as u8 {
            RunState::Verifying
        } else {
            RunState::Running
        }
    }

    /// Switch phase; the generator calls this between the write pass and
    /// the verification pass.
    pub fn set_run_state(&self, state: RunState) {
        self.run_state.store(state as u8, Ordering::Release);
    }

    /// Whether offsets are selected at random.
    pub fn random(&self) -> bool {
        self.options.workload == WorkloadKind::Random
    }

    /// Drain in-flight I/O via the registered hook, if any.
    pub(crate) fn quiesce(&self) {
        if let Some(q) = &self.quiesce {
            q.quiesce();
        }
    }
}

impl std::fmt::Debug for Job {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Job")
            .field("options", &self.options)
            .field("files", &self.files)
            .field("run_state", &self.run_state())
            .finish()
    }
}

// =============================================================================
// I/O Unit
// =============================================================================

/// One candidate request produced by the generator. The adjuster may
/// rewrite `offset` and `buflen` in place.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IoUnit {
    pub ddir: IoDirection,
    /// Byte offset into the file
    pub offset: u64,
    /// Payload length in bytes
    pub buflen: u64,
}

impl IoUnit {
    pub fn new(ddir: IoDirection, offset: u64, buflen: u64) -> Self {
        Self { ddir, offset, buflen }
    }

    pub fn read(offset: u64, buflen: u64) -> Self {
        Self::new(IoDirection::Read, offset, buflen)
    }

    pub fn write(offset: u64, buflen: u64) -> Self {
        Self::new(IoDirection::Write, offset, buflen)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_options_validate() {
        assert!(JobOptions::default().validate().is_ok());
        assert!(JobOptions::zbd().validate().is_ok());

        let opts = JobOptions::zbd_with_zone_size(256);
        assert!(opts.validate().is_err());

        let mut opts = JobOptions::zbd();
        opts.min_bs = BlockSizes::uniform(0);
        assert!(opts.validate().is_err());

        let mut opts = JobOptions::zbd();
        opts.max_bs = BlockSizes::uniform(2048);
        opts.min_bs = BlockSizes::uniform(4096);
        assert!(opts.validate().is_err());
    }

    #[test]
    fn test_unaligned_write_classification() {
        let opts = JobOptions::zbd();
        assert!(opts.is_unaligned_write_error(Errno::EIO as i32));
        assert!(opts.is_unaligned_write_error(Errno::EREMOTEIO as i32));
        assert!(!opts.is_unaligned_write_error(Errno::ENOSPC as i32));

        let mut opts = JobOptions::zbd();
        opts.unaligned_write_errnos = vec![Errno::EINVAL as i32];
        assert!(opts.is_unaligned_write_error(Errno::EINVAL as i32));
        assert!(!opts.is_unaligned_write_error(Errno::EIO as i32));
    }

    #[test]
    fn test_file_contains_offset() {
        let f = JobFile::new("/dev/nullb0", FileKind::BlockDevice, 1 << 30)
            .with_range(1 << 20, 1 << 20);
        assert!(!f.contains_offset(0));
        assert!(f.contains_offset(1 << 20));
        assert!(f.contains_offset((2 << 20) - 1));
        assert!(!f.contains_offset(2 << 20));
    }

    #[test]
    fn test_run_state_transition() {
        let job = Job::new(JobOptions::zbd());
        assert_eq!(job.run_state(), RunState::Running);
        job.set_run_state(RunState::Verifying);
        assert_eq!(job.run_state(), RunState::Verifying);
    }

    #[test]
    fn test_block_sizes_per_direction() {
        let bs = BlockSizes { read: 4096, write: 8192, trim: 16384 };
        assert_eq!(bs.for_dir(IoDirection::Read), 4096);
        assert_eq!(bs.for_dir(IoDirection::Write), 8192);
        assert_eq!(bs.for_dir(IoDirection::Trim), 16384);
    }
}
