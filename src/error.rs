//! Error types for the zoned block device adaptation core

use thiserror::Error;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while building zone tables, validating job
/// configuration, or resetting zones.
///
/// Per-request outcomes are not errors: a request that cannot be mapped to
/// any legal zone is reported as [`crate::zbd::AdjustAction::Eof`] and the
/// generator treats it as a soft end-of-file.
#[derive(Error, Debug)]
pub enum Error {
    /// I/O error (open, stat, sysfs reads)
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// An ioctl against the block device failed
    #[error("{op} ioctl failed: {source}")]
    Ioctl {
        op: &'static str,
        #[source]
        source: nix::Error,
    },

    // =========================================================================
    // Configuration Errors
    // =========================================================================
    /// Invalid or inconsistent job configuration
    #[error("configuration error: {0}")]
    Config(String),

    /// The configured zone size disagrees with the device's zone size
    #[error("configured zone size {configured} does not match device zone size {device}")]
    ZoneSizeMismatch { configured: u64, device: u64 },

    /// A block size does not divide the zone size
    #[error("{file}: block size {block_size} is not a divisor of the zone size {zone_size}")]
    BlockSize {
        file: String,
        block_size: u64,
        zone_size: u64,
    },

    /// Rounding the I/O range to zone boundaries emptied it
    #[error("{file}: io_size must be at least one zone")]
    RangeTooSmall { file: String },

    // =========================================================================
    // Geometry Errors
    // =========================================================================
    /// The device reported zones that violate the uniform-layout invariant
    #[error("{file}: invalid zone data for zone {zone}")]
    InvalidZoneData { file: String, zone: u32 },
}
