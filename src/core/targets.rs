//! The victim table for an interception session.
//!
//! A dense array of at most [`config::MAX_TARGETS`] entries, installed once
//! by the coordinator and treated as read-only by the workers. Only the
//! per-entry `active` flags change after installation (coordinator
//! deactivation), so they are atomics; everything else is plain data.
//! MAC lookup is a linear scan, which is cheap at this size.

use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use pnet::util::MacAddr;

use crate::config;
use crate::inventory::ScanResult;

/// An active victim. Forged replies are sent to every entry whose `active`
/// flag is set, once per poisoning cycle.
#[derive(Debug)]
pub struct Target {
    ip: Ipv4Addr,
    mac: MacAddr,
    active: AtomicBool,
}

impl Target {
    pub fn ip(&self) -> Ipv4Addr {
        self.ip
    }

    pub fn mac(&self) -> MacAddr {
        self.mac
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Relaxed)
    }

    /// Clearing the flag stops forged replies to this entry within one
    /// poisoning interval.
    pub fn deactivate(&self) {
        self.active.store(false, Ordering::Relaxed);
    }
}

/// The session's victim set, in installation order.
///
/// `count` is the table's logical length. It equals the entry count from
/// installation until [`TargetTable::clear`] zeroes it during forced
/// teardown; the backing entries are never touched after install, so
/// concurrent readers only ever race on atomics.
#[derive(Debug, Default)]
pub struct TargetTable {
    entries: Vec<Target>,
    count: AtomicUsize,
}

impl TargetTable {
    /// Build a table from scan-result indices.
    ///
    /// Every index is validated against the scan result; invalid indices are
    /// skipped with a warning, and anything beyond the cap is truncated.
    /// A target whose address does not appear in the originating scan can
    /// therefore never be installed.
    pub fn install(scan: &ScanResult, indices: &[usize]) -> Self {
        let mut entries = Vec::new();
        for &idx in indices {
            if entries.len() >= config::MAX_TARGETS {
                tracing::warn!(
                    "target cap reached, truncating to {} (requested {})",
                    config::MAX_TARGETS,
                    indices.len()
                );
                break;
            }
            let Some(device) = scan.devices.get(idx) else {
                tracing::warn!("invalid target index {}, skipping", idx + 1);
                continue;
            };
            entries.push(Target {
                ip: device.ip,
                mac: device.mac,
                active: AtomicBool::new(true),
            });
        }
        tracing::info!("installed {} target(s)", entries.len());
        let count = AtomicUsize::new(entries.len());
        Self { entries, count }
    }

    pub fn len(&self) -> usize {
        self.count.load(Ordering::Relaxed)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, index: usize) -> Option<&Target> {
        self.entries[..self.len()].get(index)
    }

    /// Iterate over the active entries in installation order.
    pub fn iter_active(&self) -> impl Iterator<Item = (usize, &Target)> {
        self.entries[..self.len()]
            .iter()
            .enumerate()
            .filter(|(_, t)| t.is_active())
    }

    pub fn active_count(&self) -> usize {
        self.iter_active().count()
    }

    /// Index of the active entry with the given MAC, if any.
    pub fn find_by_mac(&self, mac: MacAddr) -> Option<usize> {
        self.entries[..self.len()]
            .iter()
            .position(|t| t.is_active() && t.mac == mac)
    }

    pub fn deactivate_all(&self) {
        for t in &self.entries {
            t.deactivate();
        }
    }

    /// Zero the target count on top of deactivating every entry. Forced
    /// teardown uses this: afterwards the table is empty to every reader,
    /// even one still holding a stale index.
    pub fn clear(&self) {
        self.deactivate_all();
        self.count.store(0, Ordering::Relaxed);
    }
}
