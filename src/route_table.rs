//! Per-destination routing state.
//!
//! One entry per possible destination, indexed directly by node id. An entry
//! is valid while it has a non-zero sequence number, a next hop, and a
//! last-update time inside the route timeout. Updates go through a single
//! replacement rule keyed on destination sequence numbers, so stale
//! information can never displace fresher state.

use embassy_time::{Duration, Instant};

use crate::MAX_MESH_NODES;

/// Routing state for one destination.
#[derive(Clone, Copy)]
#[cfg_attr(feature = "std", derive(Debug))]
pub struct RouteEntry {
    pub next_hop: Option<u8>,
    pub hop_count: u8,
    /// Destination sequence number; zero means never installed.
    pub seq: u32,
    pub last_update: Instant,
}

impl RouteEntry {
    fn empty(now: Instant) -> Self {
        RouteEntry {
            next_hop: None,
            hop_count: 0,
            seq: 0,
            last_update: now,
        }
    }
}

/// Fixed-size route table indexed by destination node id.
pub struct RouteTable {
    entries: [RouteEntry; MAX_MESH_NODES],
    timeout: Duration,
}

impl RouteTable {
    pub fn new(timeout: Duration, now: Instant) -> Self {
        RouteTable {
            entries: [RouteEntry::empty(now); MAX_MESH_NODES],
            timeout,
        }
    }

    fn is_valid(&self, entry: &RouteEntry, now: Instant) -> bool {
        entry.seq != 0
            && entry.next_hop.is_some()
            && now.saturating_duration_since(entry.last_update) <= self.timeout
    }

    /// Whether a usable route to `dest` exists right now.
    pub fn has(&self, dest: u8, now: Instant) -> bool {
        self.lookup(dest, now).is_some()
    }

    /// Returns the entry for `dest` if it is currently valid.
    pub fn lookup(&self, dest: u8, now: Instant) -> Option<RouteEntry> {
        let entry = self.entries.get(dest as usize)?;
        if self.is_valid(entry, now) {
            Some(*entry)
        } else {
            None
        }
    }

    /// Offers `(next_hop, hop_count, seq)` for `dest`.
    ///
    /// Accepted when the current entry is invalid, the offer carries a newer
    /// sequence number, or an equally fresh offer is strictly shorter. All
    /// other offers lose. Returns whether the offer was installed.
    pub fn update(&mut self, dest: u8, next_hop: u8, hop_count: u8, seq: u32, now: Instant) -> bool {
        let valid = self
            .entries
            .get(dest as usize)
            .map(|e| self.is_valid(e, now))
            .unwrap_or(false);
        let Some(entry) = self.entries.get_mut(dest as usize) else {
            return false;
        };
        let accept = !valid || seq > entry.seq || (seq == entry.seq && hop_count < entry.hop_count);
        if accept {
            *entry = RouteEntry {
                next_hop: Some(next_hop),
                hop_count,
                seq,
                last_update: now,
            };
        }
        accept
    }

    /// Drops the route to `dest` immediately (route error handling).
    pub fn invalidate(&mut self, dest: u8) {
        if let Some(entry) = self.entries.get_mut(dest as usize) {
            entry.next_hop = None;
        }
    }

    /// Invalidates every entry past the route timeout. Idempotent, safe on
    /// every tick.
    pub fn cleanup(&mut self, now: Instant) {
        let timeout = self.timeout;
        for entry in self.entries.iter_mut() {
            if entry.next_hop.is_some() && now.saturating_duration_since(entry.last_update) > timeout {
                entry.next_hop = None;
            }
        }
    }
}
