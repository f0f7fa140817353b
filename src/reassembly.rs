//! Fragment reassembly for large messages.
//!
//! Fragments of one message share a `base_seq`; slots are keyed by
//! `(peer endpoint, base_seq)` so that connection identity stays purely
//! address-based. Arrival order is arbitrary. A slot completes once the
//! received ranges cover `[0, total_size)` without a gap.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use crate::packet::FragmentPayload;

/// A slot is discarded this long after its first fragment arrived.
pub const FRAGMENT_TIMEOUT: Duration = Duration::from_secs(1);
/// Upper bound on a reassembled message, mirroring the stream accumulator cap.
pub const MAX_MESSAGE_SIZE: usize = 64 * 1024;

/// Result of feeding one fragment into the assembler.
#[derive(Debug, PartialEq, Eq)]
pub enum FragmentOutcome {
    /// Fragment accepted, message still incomplete
    Stored,
    /// Message fully reassembled
    Complete(Vec<u8>),
    /// Fragment rejected (inconsistent metadata, overflow, or conflicting bytes)
    Rejected,
}

struct Slot {
    data: Vec<u8>,
    /// Sorted, non-overlapping received ranges, merged when adjacent
    ranges: Vec<(usize, usize)>,
    total_size: usize,
    first_fragment: Instant,
}

impl Slot {
    fn covered(&self) -> usize {
        self.ranges.iter().map(|(s, e)| e - s).sum()
    }

    fn is_complete(&self) -> bool {
        self.ranges.len() == 1 && self.ranges[0] == (0, self.total_size)
    }

    /// Insert `[start, end)`; overlapping bytes must match what is already
    /// stored byte for byte.
    fn insert(&mut self, start: usize, bytes: &[u8]) -> bool {
        let end = start + bytes.len();
        for &(s, e) in &self.ranges {
            let lo = s.max(start);
            let hi = e.min(end);
            if lo < hi && self.data[lo..hi] != bytes[lo - start..hi - start] {
                return false;
            }
        }

        let fresh: usize = {
            let mut overlap = 0;
            for &(s, e) in &self.ranges {
                let lo = s.max(start);
                let hi = e.min(end);
                if lo < hi {
                    overlap += hi - lo;
                }
            }
            bytes.len() - overlap
        };
        if self.covered() + fresh > self.total_size {
            return false;
        }

        self.data[start..end].copy_from_slice(bytes);
        self.ranges.push((start, end));
        self.ranges.sort_unstable();
        let mut merged: Vec<(usize, usize)> = Vec::with_capacity(self.ranges.len());
        for &(s, e) in &self.ranges {
            match merged.last_mut() {
                Some(last) if s <= last.1 => last.1 = last.1.max(e),
                _ => merged.push((s, e)),
            }
        }
        self.ranges = merged;
        true
    }
}

/// Fragment reassembly table for all peers of one socket.
#[derive(Default)]
pub struct Assembler {
    slots: HashMap<(SocketAddr, u32), Slot>,
}

impl Assembler {
    /// Create an empty assembler.
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one fragment from `peer`, using `now` for slot aging.
    pub fn insert(&mut self, peer: SocketAddr, frag: FragmentPayload, now: Instant) -> FragmentOutcome {
        let total_size = frag.total_size as usize;
        let offset = frag.offset as usize;
        if total_size == 0
            || total_size > MAX_MESSAGE_SIZE
            || offset.checked_add(frag.data.len()).map_or(true, |end| end > total_size)
        {
            return FragmentOutcome::Rejected;
        }

        let key = (peer, frag.base_seq);
        let slot = self.slots.entry(key).or_insert_with(|| Slot {
            data: vec![0; total_size],
            ranges: Vec::new(),
            total_size,
            first_fragment: now,
        });
        if slot.total_size != total_size {
            return FragmentOutcome::Rejected;
        }
        if !slot.insert(offset, &frag.data) {
            return FragmentOutcome::Rejected;
        }
        if slot.is_complete() {
            let slot = self.slots.remove(&key).expect("slot present");
            return FragmentOutcome::Complete(slot.data);
        }
        FragmentOutcome::Stored
    }

    /// Discard slots older than [`FRAGMENT_TIMEOUT`].
    pub fn sweep(&mut self, now: Instant) {
        self.slots
            .retain(|_, slot| now.duration_since(slot.first_fragment) < FRAGMENT_TIMEOUT);
    }

    /// Drop every slot belonging to `peer`.
    pub fn forget_peer(&mut self, peer: &SocketAddr) {
        self.slots.retain(|(p, _), _| p != peer);
    }

    /// Number of in-progress reassembly slots.
    pub fn pending(&self) -> usize {
        self.slots.len()
    }
}
