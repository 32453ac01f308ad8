//! The sorting-stage memory arena.
//!
//! Stage 2 processes several bins at once, each needing a span of working
//! memory for up to six named slots. The arena owns one budget shared by all
//! bins: `init` reserves a whole span (blocking until enough other spans are
//! released), `alloc` carves live slots out of a span, and dropping the last
//! slot buffer of a touched span releases it and wakes waiters. In non-strict
//! mode a span larger than the budget grows the budget; in strict mode such
//! bins are rejected so the caller can divert them to the sub-bin pipeline.
//!
//! Slot lifetimes never overlap beyond the phase plan captured by
//! [`required_bytes`], which mirrors the two-part estimate the bin manager
//! uses to order bins.

use crate::error::{CounterError, Result};
use crate::pools::AlignedBuf;
use std::collections::HashMap;
use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Condvar, Mutex};

pub const ARENA_ALIGNMENT: usize = 0x100;

pub fn round_up_to_alignment(x: usize) -> usize {
    (x + ARENA_ALIGNMENT - 1) / ARENA_ALIGNMENT * ARENA_ALIGNMENT
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ArenaSlot {
    InputFile,
    InputArray,
    TmpArray,
    Suffix,
    Lut,
    KxmerCounters,
}

/// Span estimate for one bin, split the way the phases overlap: `part1`
/// covers the sort-resident side, `part2` the streaming side. Which sizes
/// land where depends on whether the radix pass count is even (the sorted
/// result then rests in the input array rather than the tmp array).
pub fn required_bytes(
    rec_bytes: usize,
    file_size: usize,
    kxmers_size: usize,
    out_buffer_size: usize,
    kxmer_counters_size: usize,
    lut_size: usize,
) -> usize {
    let file_size = round_up_to_alignment(file_size);
    let kxmers_size = round_up_to_alignment(kxmers_size);
    let out_buffer_size = round_up_to_alignment(out_buffer_size);
    let kxmer_counters_size = round_up_to_alignment(kxmer_counters_size);
    let lut_size = round_up_to_alignment(lut_size);

    let (part1, part2) = if rec_bytes % 2 == 0 {
        (
            kxmers_size + kxmer_counters_size,
            (file_size.max(kxmers_size)).max(out_buffer_size + lut_size),
        )
    } else {
        (
            (kxmers_size + kxmer_counters_size).max(file_size),
            kxmers_size.max(out_buffer_size + lut_size),
        )
    };
    part1 + part2
}

struct SpanState {
    reserved: usize,
    live_bytes: usize,
    live_slots: HashMap<ArenaSlot, usize>,
    touched: bool,
}

struct ArenaState {
    total: usize,
    used: usize,
    bins: HashMap<u32, SpanState>,
}

struct ArenaInner {
    state: Mutex<ArenaState>,
    released: Condvar,
    strict: bool,
}

#[derive(Clone)]
pub struct SortArena {
    inner: Arc<ArenaInner>,
}

/// A named slot buffer; dropping it frees the slot (and possibly the span).
pub struct ArenaBuf {
    buf: AlignedBuf,
    arena: Arc<ArenaInner>,
    bin_id: u32,
    slot: ArenaSlot,
}

impl SortArena {
    pub fn new(total: usize, strict: bool) -> SortArena {
        SortArena {
            inner: Arc::new(ArenaInner {
                state: Mutex::new(ArenaState {
                    total,
                    used: 0,
                    bins: HashMap::new(),
                }),
                released: Condvar::new(),
                strict,
            }),
        }
    }

    pub fn total(&self) -> usize {
        self.inner.state.lock().unwrap().total
    }

    /// Reserve a whole span. Returns false when the bin can never fit
    /// (strict mode only); blocks while other bins hold the budget.
    pub fn init(&self, bin_id: u32, required: usize) -> bool {
        let mut state = self.inner.state.lock().unwrap();
        if required > state.total {
            if self.inner.strict {
                return false;
            }
            state.total = required;
        }
        while state.used + required > state.total {
            state = self.inner.released.wait(state).unwrap();
        }
        state.used += required;
        state.bins.insert(
            bin_id,
            SpanState {
                reserved: required,
                live_bytes: 0,
                live_slots: HashMap::new(),
                touched: false,
            },
        );
        true
    }

    /// Grow a span reserved by [`Self::init`], e.g. once exact sizes are
    /// known after reading the bin file. Returns false in strict mode when
    /// the new size exceeds the budget.
    pub fn extend(&self, bin_id: u32, new_required: usize) -> bool {
        let mut state = self.inner.state.lock().unwrap();
        let reserved = state.bins.get(&bin_id).map(|s| s.reserved).unwrap_or(0);
        if new_required <= reserved {
            return true;
        }
        let delta = new_required - reserved;
        if new_required > state.total {
            if self.inner.strict {
                return false;
            }
            state.total = state.used - reserved + new_required;
        }
        while state.used + delta > state.total {
            state = self.inner.released.wait(state).unwrap();
        }
        state.used += delta;
        state.bins.get_mut(&bin_id).expect("span initialized").reserved = new_required;
        true
    }

    /// Shrink a span to its live slots, releasing the working slack. Called
    /// once a bin's output sits in the completer queue, so bins waiting for
    /// the in-order completer only pin their suffix and LUT bytes.
    pub fn trim(&self, bin_id: u32) {
        let mut state = self.inner.state.lock().unwrap();
        if let Some(span) = state.bins.get_mut(&bin_id) {
            if span.live_bytes < span.reserved {
                let delta = span.reserved - span.live_bytes;
                span.reserved = span.live_bytes;
                state.used -= delta;
                self.inner.released.notify_all();
            }
        }
    }

    /// Carve a live slot out of the bin's span.
    pub fn alloc(&self, bin_id: u32, slot: ArenaSlot, bytes: usize) -> Result<ArenaBuf> {
        let rounded = round_up_to_alignment(bytes);
        {
            let mut state = self.inner.state.lock().unwrap();
            let span = state
                .bins
                .get_mut(&bin_id)
                .ok_or_else(|| CounterError::Internal(format!("no span for bin {}", bin_id)))?;
            if span.live_bytes + rounded > span.reserved {
                return Err(CounterError::Internal(format!(
                    "bin {} slot {:?} overflows its span ({} + {} > {})",
                    bin_id, slot, span.live_bytes, rounded, span.reserved
                )));
            }
            if span.live_slots.contains_key(&slot) {
                return Err(CounterError::Internal(format!(
                    "bin {} slot {:?} allocated twice",
                    bin_id, slot
                )));
            }
            span.live_bytes += rounded;
            span.live_slots.insert(slot, rounded);
            span.touched = true;
        }
        Ok(ArenaBuf {
            buf: AlignedBuf::new(bytes),
            arena: Arc::clone(&self.inner),
            bin_id,
            slot,
        })
    }

    #[cfg(test)]
    fn used(&self) -> usize {
        self.inner.state.lock().unwrap().used
    }
}

impl Drop for ArenaBuf {
    fn drop(&mut self) {
        let mut state = self.arena.state.lock().unwrap();
        if let Some(span) = state.bins.get_mut(&self.bin_id) {
            if let Some(bytes) = span.live_slots.remove(&self.slot) {
                span.live_bytes -= bytes;
            }
            if span.touched && span.live_slots.is_empty() {
                let reserved = span.reserved;
                state.bins.remove(&self.bin_id);
                state.used -= reserved;
                self.arena.released.notify_all();
            }
        }
    }
}

impl ArenaBuf {
    pub fn as_slice_of<T: Copy>(&mut self) -> &mut [T] {
        self.buf.as_slice_of()
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }
}

impl Deref for ArenaBuf {
    type Target = [u8];
    fn deref(&self) -> &[u8] {
        &self.buf
    }
}

impl DerefMut for ArenaBuf {
    fn deref_mut(&mut self) -> &mut [u8] {
        &mut self.buf
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn required_bytes_parity_test() {
        // rounded sizes: file 5120, kxmers 2048, out 512, counters 512, lut 256
        let odd = required_bytes(7, 5000, 2000, 500, 400, 100);
        let even = required_bytes(8, 5000, 2000, 500, 400, 100);
        // odd folds the file into part1: max(2560, 5120) + max(2048, 768)
        assert_eq!(odd, 5120 + 2048);
        // even keeps it in part2: 2560 + max(5120, 768)
        assert_eq!(even, 2560 + 5120);
    }

    #[test]
    fn span_lifecycle_test() {
        let arena = SortArena::new(1 << 20, false);
        assert!(arena.init(3, 4096));
        let a = arena.alloc(3, ArenaSlot::InputFile, 1024).unwrap();
        let b = arena.alloc(3, ArenaSlot::InputArray, 1024).unwrap();
        drop(a);
        assert!(arena.used() > 0);
        drop(b);
        assert_eq!(arena.used(), 0);
    }

    #[test]
    fn overflowing_slot_rejected_test() {
        let arena = SortArena::new(1 << 20, false);
        assert!(arena.init(1, 1024));
        assert!(arena.alloc(1, ArenaSlot::InputFile, 4096).is_err());
    }

    #[test]
    fn extend_grows_span_test() {
        let arena = SortArena::new(1 << 20, false);
        assert!(arena.init(5, 1024));
        assert!(arena.extend(5, 4096));
        let a = arena.alloc(5, ArenaSlot::InputFile, 3000).unwrap();
        drop(a);
        assert_eq!(arena.used(), 0);

        let strict = SortArena::new(2048, true);
        assert!(strict.init(6, 1024));
        assert!(!strict.extend(6, 4096));
    }

    #[test]
    fn trim_releases_slack_test() {
        let arena = SortArena::new(1 << 20, false);
        assert!(arena.init(7, 8192));
        let kept = arena.alloc(7, ArenaSlot::Suffix, 512).unwrap();
        arena.trim(7);
        assert_eq!(arena.used(), 512);
        drop(kept);
        assert_eq!(arena.used(), 0);
    }

    #[test]
    fn strict_mode_rejects_oversized_test() {
        let arena = SortArena::new(1024, true);
        assert!(!arena.init(0, 4096));
        let arena = SortArena::new(1024, false);
        assert!(arena.init(0, 4096)); // non-strict grows instead
        assert_eq!(arena.total(), 4096);
    }

    #[test]
    fn init_blocks_until_release_test() {
        let arena = SortArena::new(1024, false);
        assert!(arena.init(0, 1024));
        let buf = arena.alloc(0, ArenaSlot::Lut, 64).unwrap();
        let arena_clone = arena.clone();
        let th = std::thread::spawn(move || {
            assert!(arena_clone.init(1, 512));
            let b = arena_clone.alloc(1, ArenaSlot::Lut, 64).unwrap();
            drop(b);
        });
        std::thread::sleep(std::time::Duration::from_millis(20));
        drop(buf); // releases span 0, unblocks the waiter
        th.join().unwrap();
    }
}
