//! Capacity Calculator
//!
//! Turns the region topology into the largest namespace that can currently be
//! created. A region only grants sizes that are a multiple of
//! `align * interleave_ways`, so every free extent is floored to that unit
//! before it is considered; reporting the raw extent would promise capacity
//! the hardware then refuses.

use crate::ndctl::{Bus, NamespaceMode, Region};
use std::collections::BTreeMap;

/// Largest creatable namespace size, per allocation mode.
pub type CapacityReport = BTreeMap<NamespaceMode, u64>;

/// Rounds `value` down to a multiple of `unit`. A zero unit yields zero.
pub fn align_down(value: u64, unit: u64) -> u64 {
    if unit == 0 {
        return 0;
    }
    value / unit * unit
}

/// Free extent of `region` that can actually be allocated with `align`.
pub fn region_capacity(region: &Region, align: u64) -> u64 {
    let unit = align.saturating_mul(region.interleave_ways.max(1));
    align_down(region.max_available_extent, unit)
}

/// Maximum aligned free extent across every region on every bus.
pub fn max_aligned_extent(buses: &[Bus], align: u64) -> u64 {
    buses
        .iter()
        .flat_map(|bus| bus.regions.iter())
        .map(|region| region_capacity(region, align))
        .max()
        .unwrap_or(0)
}

/// Reports the same capacity for every supported mode.
///
/// Modes are not accounted independently; a namespace created in one mode
/// reduces what is reported for all of them.
pub fn report(capacity: u64) -> CapacityReport {
    NamespaceMode::SUPPORTED
        .iter()
        .map(|mode| (*mode, capacity))
        .collect()
}
