//! Job configuration validation against zone geometry
//!
//! Runs once, after every file's zone table exists and before any I/O is
//! issued. Range rounding mutates the files in place; everything else is
//! a pass/fail check.

use tracing::info;

use crate::device::{ZonedModel, SECTOR_SHIFT};
use crate::error::{Error, Result};
use crate::workload::{Job, JobFile};

use super::zone::ZoneTable;

/// Writers targeting host-managed drives must bypass the page cache:
/// buffered writeback reorders requests, which the drive rejects.
pub(crate) fn verify_direct_io(job: &Job) -> Result<()> {
    if job.options.odirect || !job.options.directions.writes() {
        return Ok(());
    }
    for file in &job.files {
        if let Some(table) = &file.zone_table {
            if table.model() == ZonedModel::HostManaged {
                return Err(Error::Config(format!(
                    "{}: direct I/O is mandatory for writing to host-managed zoned devices",
                    file.name
                )));
            }
        }
    }
    Ok(())
}

/// Whether the file's I/O range covers at least one sequential zone.
fn is_seq_job(file: &JobFile, table: &ZoneTable) -> bool {
    if file.io_size == 0 {
        return false;
    }
    let zb = table.zone_index_of(file.file_offset);
    let ze = table.zone_index_of(file.file_offset + file.io_size - 1);
    (zb..=ze).any(|idx| idx < table.nr_zones() && table.zone(idx).is_sequential())
}

/// Round each file's I/O range to zone boundaries: offset up to the next
/// zone start, size down to the previous boundary. A range that no longer
/// spans a full zone is an error.
pub(crate) fn verify_sizes(job: &mut Job) -> Result<()> {
    for file in &mut job.files {
        let Some(table) = file.zone_table.clone() else {
            continue;
        };
        if file.file_offset >= file.real_file_size {
            continue;
        }
        if !is_seq_job(file, &table) {
            continue;
        }

        let zb = table.zone_index_of(file.file_offset);
        if file.file_offset != table.zone(zb).start_bytes() {
            let new_offset = table.next_start(zb) << SECTOR_SHIFT;
            if new_offset >= file.file_offset + file.io_size {
                return Err(Error::RangeTooSmall {
                    file: file.name.clone(),
                });
            }
            info!(
                file = %file.name,
                from = file.file_offset,
                to = new_offset,
                "rounded up offset to zone boundary"
            );
            file.io_size -= new_offset - file.file_offset;
            file.file_offset = new_offset;
        }

        let ze = table.zone_index_of(file.file_offset + file.io_size);
        let new_end = table.zone(ze).start_bytes();
        if file.file_offset + file.io_size != new_end {
            if new_end <= file.file_offset {
                return Err(Error::RangeTooSmall {
                    file: file.name.clone(),
                });
            }
            info!(
                file = %file.name,
                from = file.io_size,
                to = new_end - file.file_offset,
                "rounded down io_size to zone boundary"
            );
            file.io_size = new_end - file.file_offset;
        }
    }
    Ok(())
}

/// With verification enabled, the replay ordering only works if every
/// block size tiles the zone exactly.
pub(crate) fn verify_block_sizes(job: &Job) -> Result<()> {
    if !job.options.verify {
        return Ok(());
    }
    for file in &job.files {
        let Some(table) = &file.zone_table else {
            continue;
        };
        let zone_size = table.zone_size_bytes();
        for bs in job
            .options
            .min_bs
            .each()
            .into_iter()
            .chain(job.options.max_bs.each())
        {
            if bs != 0 && zone_size % bs != 0 {
                return Err(Error::BlockSize {
                    file: file.name.clone(),
                    block_size: bs,
                    zone_size,
                });
            }
        }
    }
    Ok(())
}
