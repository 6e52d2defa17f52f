//! Zone table discovery and sharing
//!
//! Builds the per-device [`ZoneTable`]: from the device's own zone report
//! for host-aware/host-managed drives, or synthesized from the configured
//! zone size for regular devices running a zoned workload. Tables are
//! shared across every file that names the same device path through a
//! [`ZoneTableRegistry`], so concurrent generators agree on one write
//! pointer per zone.

use std::sync::{Arc, Weak};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tracing::{debug, info, warn};

use crate::device::{ZoneCondition, ZonedDevice, ZonedModel, SECTOR_SHIFT};
use crate::error::{Error, Result};
use crate::workload::{JobFile, JobOptions};

use super::zone::{Zone, ZoneTable};

/// Upper bound on zone records requested per report call.
const REPORT_CHUNK_ZONES: usize = 4096;

/// Build a zone table for `file`, consulting the device's zoning model.
pub fn create_zone_table(
    options: &JobOptions,
    file: &JobFile,
    dev: &dyn ZonedDevice,
) -> Result<ZoneTable> {
    let model = dev.model()?;
    let table = match model {
        ZonedModel::HostAware | ZonedModel::HostManaged => {
            parse_zone_table(options, file, dev, model)?
        }
        ZonedModel::None => synthesize_zone_table(options, file)?,
    };
    info!(
        file = %file.name,
        %model,
        zones = table.nr_zones(),
        zone_size = table.zone_size(),
        "built zone table"
    );
    Ok(table)
}

/// Materialize the table from the device's zone report, iterating until
/// every zone backing the file has been read.
fn parse_zone_table(
    options: &JobOptions,
    file: &JobFile,
    dev: &dyn ZonedDevice,
    model: ZonedModel,
) -> Result<ZoneTable> {
    let mut batch = dev.report_zones(0, REPORT_CHUNK_ZONES).map_err(|e| {
        warn!(file = %file.name, error = %e, "zone report failed");
        e
    })?;
    let first = batch.first().ok_or_else(|| Error::InvalidZoneData {
        file: file.name.clone(),
        zone: 0,
    })?;

    let zone_size = first.len;
    if zone_size == 0 {
        return Err(Error::InvalidZoneData {
            file: file.name.clone(),
            zone: 0,
        });
    }
    if options.zone_size != 0 && options.zone_size != zone_size << SECTOR_SHIFT {
        return Err(Error::ZoneSizeMismatch {
            configured: options.zone_size,
            device: zone_size << SECTOR_SHIFT,
        });
    }

    let nr_zones = ((file.real_file_size >> SECTOR_SHIFT).div_ceil(zone_size)) as u32;
    debug!(
        file = %file.name,
        nr_zones,
        zone_size_kib = (zone_size << SECTOR_SHIFT) >> 10,
        "parsing device zone report"
    );

    let mut zones: Vec<Zone> = Vec::with_capacity(nr_zones as usize + 1);
    while (zones.len() as u32) < nr_zones {
        if batch.is_empty() {
            // The device stopped reporting before covering its capacity.
            return Err(Error::InvalidZoneData {
                file: file.name.clone(),
                zone: zones.len() as u32,
            });
        }
        let batch_end = batch[batch.len() - 1].start + batch[batch.len() - 1].len;
        for entry in batch.iter().take(nr_zones as usize - zones.len()) {
            let wp = match entry.cond {
                ZoneCondition::NotWp => entry.start,
                ZoneCondition::Full => entry.start + zone_size,
                _ => {
                    debug_assert!(entry.start <= entry.wp);
                    debug_assert!(entry.wp <= entry.start + zone_size);
                    entry.wp
                }
            };
            if let Some(prev) = zones.last() {
                if entry.start != prev.start() + zone_size {
                    return Err(Error::InvalidZoneData {
                        file: file.name.clone(),
                        zone: zones.len() as u32,
                    });
                }
            }
            zones.push(Zone::new(entry.start, entry.ztype, entry.cond, wp));
        }
        if (zones.len() as u32) < nr_zones {
            batch = dev.report_zones(batch_end, REPORT_CHUNK_ZONES).map_err(|e| {
                warn!(file = %file.name, sector = batch_end, error = %e, "zone report failed");
                e
            })?;
        }
    }

    Ok(ZoneTable::new(model, zone_size, zones))
}

/// Synthesize a table for a regular block device so a zoned workload can
/// run against it. Every zone starts out sequential and nominally full;
/// the up-front file reset empties the zones the run touches.
fn synthesize_zone_table(options: &JobOptions, file: &JobFile) -> Result<ZoneTable> {
    if options.zone_size == 0 {
        return Err(Error::Config(format!(
            "{}: specifying the zone size is mandatory for regular block devices",
            file.name
        )));
    }
    let zone_size = options.zone_size >> SECTOR_SHIFT;
    let nr_zones = ((file.real_file_size >> SECTOR_SHIFT).div_ceil(zone_size)) as u32;
    if nr_zones == 0 {
        return Err(Error::Config(format!(
            "{}: file is smaller than one zone",
            file.name
        )));
    }
    let zones = (0..u64::from(nr_zones))
        .map(|i| {
            let start = i * zone_size;
            Zone::new(
                start,
                crate::device::ZoneType::SeqWriteReq,
                ZoneCondition::Empty,
                start + zone_size,
            )
        })
        .collect();
    Ok(ZoneTable::new(ZonedModel::None, zone_size, zones))
}

// =============================================================================
// Sharing Registry
// =============================================================================

/// Keys zone tables by device path so every file naming the same device
/// shares one table. Holds only weak references: dropping the last file
/// handle tears the table down, and a later init rebuilds it fresh.
#[derive(Default)]
pub struct ZoneTableRegistry {
    tables: DashMap<String, Weak<ZoneTable>>,
}

impl ZoneTableRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fetch the shared table for `file`, building it on first use.
    pub fn get_or_build(
        &self,
        options: &JobOptions,
        file: &JobFile,
        dev: &dyn ZonedDevice,
    ) -> Result<Arc<ZoneTable>> {
        match self.tables.entry(file.name.clone()) {
            Entry::Occupied(mut occupied) => {
                if let Some(table) = occupied.get().upgrade() {
                    debug!(file = %file.name, "sharing existing zone table");
                    return Ok(table);
                }
                let table = Arc::new(create_zone_table(options, file, dev)?);
                occupied.insert(Arc::downgrade(&table));
                Ok(table)
            }
            Entry::Vacant(vacant) => {
                let table = Arc::new(create_zone_table(options, file, dev)?);
                vacant.insert(Arc::downgrade(&table));
                Ok(table)
            }
        }
    }

    /// Number of live (upgradeable) entries, mostly for tests and stats.
    pub fn live_tables(&self) -> usize {
        self.tables
            .iter()
            .filter(|entry| entry.value().strong_count() > 0)
            .count()
    }
}
