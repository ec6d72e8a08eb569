use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::error::{Error, Result};
use crate::layout::{SegmentId, SegmentSpace, RESERVED_SEGMENTS};

const WORD_BITS: usize = u64::BITS as usize;

struct UsageBits {
    words: Vec<u64>,
    used: usize,
}

impl UsageBits {
    fn is_set(&self, index: usize) -> bool {
        self.words[index / WORD_BITS] & (1u64 << (index % WORD_BITS)) != 0
    }

    fn set(&mut self, index: usize) {
        self.words[index / WORD_BITS] |= 1u64 << (index % WORD_BITS);
        self.used += 1;
    }

    fn clear(&mut self, index: usize) {
        self.words[index / WORD_BITS] &= !(1u64 << (index % WORD_BITS));
        self.used -= 1;
    }
}

/// Segment usage table: one bit per physical segment, set = allocated.
///
/// All bit scans and updates happen under a single allocation lock.
pub struct SegmentAllocator {
    total: usize,
    bits: Mutex<UsageBits>,
}

impl SegmentAllocator {
    /// Track `total` segments. The metadata segments are marked used.
    pub fn new(total: usize) -> Self {
        let words = total.div_ceil(WORD_BITS);
        let mut bits = UsageBits {
            words: vec![0; words],
            used: 0,
        };
        // Bits past `total` in the last word stay set so scans never return them.
        let tail = total % WORD_BITS;
        if tail != 0 {
            bits.words[words - 1] = !0u64 << tail;
        }
        for segment in 0..(RESERVED_SEGMENTS as usize).min(total) {
            bits.set(segment);
        }

        Self {
            total,
            bits: Mutex::new(bits),
        }
    }

    /// Claim the lowest free segment for `space`.
    pub fn allocate(&self, space: SegmentSpace) -> Result<SegmentId> {
        let mut bits = self.bits.lock();
        let found = bits
            .words
            .iter()
            .enumerate()
            .find(|(_, word)| **word != u64::MAX)
            .map(|(i, word)| i * WORD_BITS + (!*word).trailing_zeros() as usize);

        match found {
            Some(index) if index < self.total => {
                bits.set(index);
                trace!(segment = index, %space, "allocated segment");
                Ok(index as SegmentId)
            }
            _ => {
                debug!(%space, total = self.total, "segment allocator exhausted");
                Err(Error::OutOfSpace)
            }
        }
    }

    /// Return a segment to the free pool. Returns whether it was allocated.
    pub fn release(&self, segment: SegmentId) -> bool {
        let index = segment as usize;
        if index < RESERVED_SEGMENTS as usize || index >= self.total {
            return false;
        }
        let mut bits = self.bits.lock();
        if !bits.is_set(index) {
            return false;
        }
        bits.clear(index);
        true
    }

    /// Record a segment found in a recovered address table.
    pub fn mark_used(&self, segment: SegmentId) -> Result<()> {
        let index = segment as usize;
        if index < RESERVED_SEGMENTS as usize || index >= self.total {
            return Err(Error::corruption(format!(
                "segment {segment} is outside the allocatable range"
            )));
        }
        let mut bits = self.bits.lock();
        if bits.is_set(index) {
            return Err(Error::corruption(format!(
                "segment {segment} is claimed more than once"
            )));
        }
        bits.set(index);
        Ok(())
    }

    /// Whether `segment` is claimed. Out-of-range ids are reported as free.
    pub fn is_used(&self, segment: SegmentId) -> bool {
        let index = segment as usize;
        index < self.total && self.bits.lock().is_set(index)
    }

    /// Segments tracked, reserved ones included.
    pub fn total(&self) -> usize {
        self.total
    }

    /// Segments still available to claim.
    pub fn free_count(&self) -> usize {
        self.total - self.bits.lock().used
    }
}
