//! Parsers for the probe's line-oriented record formats.
//!
//! Coverage records are `ADDR COUNT` (hex address, decimal count), taint
//! records are `OFFSET VALUE` (both decimal). Malformed records are skipped
//! with a debug note; they never fail an execution.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use crate::executor::PutFeedback;

/// Basic-block coverage as an address → hit-count map.
pub fn parse_bb_cov(feedback: &PutFeedback) -> BTreeMap<u64, u32> {
    let mut cov = BTreeMap::new();
    let text = String::from_utf8_lossy(feedback.bytes());

    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let mut fields = line.split_whitespace();
        let (Some(addr), Some(count)) = (fields.next(), fields.next()) else {
            log::debug!("malformed coverage record: {line:?}");
            continue;
        };
        let addr = addr.strip_prefix("0x").unwrap_or(addr);
        match (u64::from_str_radix(addr, 16), count.parse::<u32>()) {
            (Ok(addr), Ok(count)) => {
                let entry = cov.entry(addr).or_insert(0u32);
                *entry = entry.saturating_add(count);
            }
            _ => log::debug!("malformed coverage record: {line:?}"),
        }
    }
    cov
}

/// Taint feedback as an offset → set-of-observed-values map.
pub fn parse_taint(feedback: &PutFeedback) -> HashMap<usize, BTreeSet<u8>> {
    let mut taint: HashMap<usize, BTreeSet<u8>> = HashMap::new();
    let text = String::from_utf8_lossy(feedback.bytes());

    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let mut fields = line.split_whitespace();
        let (Some(offset), Some(value)) = (fields.next(), fields.next()) else {
            log::debug!("malformed taint record: {line:?}");
            continue;
        };
        match (offset.parse::<usize>(), value.parse::<u8>()) {
            (Ok(offset), Ok(value)) => {
                taint.entry(offset).or_default().insert(value);
            }
            _ => log::debug!("malformed taint record: {line:?}"),
        }
    }
    taint
}

/// Fold an address → count map into the dense bitmap the queue indexes
/// (index = address modulo `map_size`, counts saturate at 255).
pub fn cov_to_bitmap(cov: &BTreeMap<u64, u32>, map_size: usize) -> Vec<u8> {
    let mut bitmap = vec![0u8; map_size];
    for (&addr, &count) in cov {
        let slot = &mut bitmap[(addr as usize) % map_size];
        *slot = slot.saturating_add(count.min(255) as u8);
    }
    bitmap
}
