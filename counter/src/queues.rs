//! Blocking queues wiring the pipeline stages together.
//!
//! Every queue is a mutex+condvar FIFO. Producers register up front and call
//! `mark_completed` when done; `pop` returns `None` once the queue is empty
//! and no producer remains. `ignore_rest` flips cancellation: queued items
//! are dropped on the spot (their pooled buffers return via `Drop`) and all
//! further pushes are refused, so a failing stage drains the whole pipeline.

use crate::arena::ArenaBuf;
use crate::pools::Block;
use ktio::seq::Compression;
use std::collections::{BTreeMap, VecDeque};
use std::sync::{Condvar, Mutex};

struct QueueState<T> {
    items: VecDeque<T>,
    producers: usize,
    ignore: bool,
}

pub struct Queue<T> {
    state: Mutex<QueueState<T>>,
    popped: Condvar,
    pushed: Condvar,
    cap: usize,
}

impl<T> Queue<T> {
    pub fn bounded(cap: usize, producers: usize) -> Queue<T> {
        Queue {
            state: Mutex::new(QueueState {
                items: VecDeque::new(),
                producers,
                ignore: false,
            }),
            popped: Condvar::new(),
            pushed: Condvar::new(),
            cap,
        }
    }

    pub fn unbounded(producers: usize) -> Queue<T> {
        Queue::bounded(usize::MAX, producers)
    }

    /// Blocks while the queue is full. Returns false when the queue is in
    /// ignore mode and the item was dropped.
    pub fn push(&self, item: T) -> bool {
        let mut state = self.state.lock().unwrap();
        while state.items.len() >= self.cap && !state.ignore {
            state = self.popped.wait(state).unwrap();
        }
        if state.ignore {
            return false;
        }
        state.items.push_back(item);
        self.pushed.notify_one();
        true
    }

    /// Blocks until an item arrives; `None` once drained and completed.
    pub fn pop(&self) -> Option<T> {
        let mut state = self.state.lock().unwrap();
        loop {
            if let Some(item) = state.items.pop_front() {
                self.popped.notify_one();
                return Some(item);
            }
            if state.producers == 0 || state.ignore {
                return None;
            }
            state = self.pushed.wait(state).unwrap();
        }
    }

    pub fn mark_completed(&self) {
        let mut state = self.state.lock().unwrap();
        state.producers = state.producers.saturating_sub(1);
        if state.producers == 0 {
            self.pushed.notify_all();
        }
    }

    pub fn ignore_rest(&self) {
        let mut state = self.state.lock().unwrap();
        state.ignore = true;
        state.items.clear();
        self.pushed.notify_all();
        self.popped.notify_all();
    }
}

/// FIFO of input paths shared by the reader threads.
pub struct InputFilesQueue {
    state: Mutex<(VecDeque<String>, bool)>,
}

impl InputFilesQueue {
    pub fn new(paths: Vec<String>) -> InputFilesQueue {
        InputFilesQueue {
            state: Mutex::new((paths.into(), false)),
        }
    }

    pub fn pop(&self) -> Option<String> {
        let mut state = self.state.lock().unwrap();
        if state.1 {
            return None;
        }
        state.0.pop_front()
    }

    pub fn ignore_rest(&self) {
        let mut state = self.state.lock().unwrap();
        state.1 = true;
        state.0.clear();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilePart {
    Begin,
    Middle,
    End,
}

/// Raw file bytes as read from disk, before decompression.
pub struct BinaryPack {
    pub data: Block,
    pub file_part: FilePart,
    pub compression: Compression,
    pub path: String,
}

pub type BinaryPackQueue = Queue<BinaryPack>;

/// A record-aligned slice of decompressed input.
pub struct Part {
    pub data: Vec<u8>,
}

pub type PartQueue = Queue<Part>;

/// Part queue for the statistics pass: stops accepting once the sampled
/// byte budget is consumed, so readers can drop the rest of the input.
pub struct StatsPartQueue {
    queue: PartQueue,
    budget: Mutex<u64>,
}

impl StatsPartQueue {
    pub fn new(cap: usize, producers: usize, budget_bytes: u64) -> StatsPartQueue {
        StatsPartQueue {
            queue: Queue::bounded(cap, producers),
            budget: Mutex::new(budget_bytes),
        }
    }

    /// False once the budget is spent; the part is dropped in that case.
    pub fn push(&self, part: Part) -> bool {
        {
            let mut left = self.budget.lock().unwrap();
            if *left == 0 {
                return false;
            }
            *left = left.saturating_sub(part.data.len() as u64);
        }
        self.queue.push(part)
    }

    pub fn pop(&self) -> Option<Part> {
        self.queue.pop()
    }

    pub fn mark_completed(&self) {
        self.queue.mark_completed();
    }

    pub fn ignore_rest(&self) {
        self.queue.ignore_rest();
    }
}

/// A filled collector buffer on its way to the storer.
pub struct BinPart {
    pub bin_id: u32,
    pub data: Block,
    /// (byte span, k+x-mer records in the span) per expander pack
    pub expander_parts: Vec<(u64, u64)>,
}

pub type BinPartQueue = Queue<BinPart>;

/// One bin loaded into the arena, ready to sort.
pub struct BinJob {
    pub bin_id: u32,
    pub data: Option<ArenaBuf>,
    pub size: u64,
    pub n_rec: u64,
    pub n_plus_x_recs: u64,
}

/// Sorted and compacted output of one bin.
pub struct CompletedBin {
    pub bin_id: u32,
    pub suffix: Option<ArenaBuf>,
    /// (start, end) byte ranges of `suffix` holding real output
    pub packs: Vec<(u64, u64)>,
    pub lut: Option<ArenaBuf>,
    pub n_unique: u64,
    pub n_cutoff_min: u64,
    pub n_cutoff_max: u64,
    pub n_total: u64,
    /// bin was handed to the strict-memory stage instead
    pub diverted: bool,
}

impl CompletedBin {
    pub fn diverted(bin_id: u32) -> CompletedBin {
        CompletedBin {
            bin_id,
            suffix: None,
            packs: Vec::new(),
            lut: None,
            n_unique: 0,
            n_cutoff_min: 0,
            n_cutoff_max: 0,
            n_total: 0,
            diverted: true,
        }
    }
}

/// Hands completed bins to the completer in ascending bin order.
pub struct KmerQueue {
    state: Mutex<(BTreeMap<u32, CompletedBin>, usize)>,
    pushed: Condvar,
}

impl KmerQueue {
    pub fn new(producers: usize) -> KmerQueue {
        KmerQueue {
            state: Mutex::new((BTreeMap::new(), producers)),
            pushed: Condvar::new(),
        }
    }

    pub fn push(&self, bin: CompletedBin) {
        let mut state = self.state.lock().unwrap();
        state.0.insert(bin.bin_id, bin);
        self.pushed.notify_all();
    }

    /// Blocks until bin `next` arrives. `None` when every producer finished
    /// without delivering it.
    pub fn pop_in_order(&self, next: u32) -> Option<CompletedBin> {
        let mut state = self.state.lock().unwrap();
        loop {
            if let Some(bin) = state.0.remove(&next) {
                return Some(bin);
            }
            if state.1 == 0 {
                return None;
            }
            state = self.pushed.wait(state).unwrap();
        }
    }

    pub fn mark_completed(&self) {
        let mut state = self.state.lock().unwrap();
        state.1 = state.1.saturating_sub(1);
        if state.1 == 0 {
            self.pushed.notify_all();
        }
    }
}

/// Output of the strict-memory merger for one oversized bin, consumed by
/// completer phase 2.
pub struct BigBinKmerPart {
    pub bin_id: u32,
    pub suffix: Vec<u8>,
    pub lut: Vec<u64>,
    pub n_unique: u64,
    pub n_cutoff_min: u64,
    pub n_cutoff_max: u64,
    pub n_total: u64,
}

pub type BigBinKmerPartQueue = Queue<BigBinKmerPart>;

/// Bins too large for the arena, queued for the strict-memory stage.
pub struct TooLargeBinsQueue {
    bins: Mutex<VecDeque<u32>>,
}

impl TooLargeBinsQueue {
    pub fn new() -> TooLargeBinsQueue {
        TooLargeBinsQueue {
            bins: Mutex::new(VecDeque::new()),
        }
    }

    pub fn insert(&self, bin_id: u32) {
        self.bins.lock().unwrap().push_back(bin_id);
    }

    pub fn pop(&self) -> Option<u32> {
        self.bins.lock().unwrap().pop_front()
    }

    pub fn is_empty(&self) -> bool {
        self.bins.lock().unwrap().is_empty()
    }
}

impl Default for TooLargeBinsQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn queue_completion_test() {
        let q: Queue<u32> = Queue::unbounded(1);
        q.push(1);
        q.push(2);
        q.mark_completed();
        assert_eq!(q.pop(), Some(1));
        assert_eq!(q.pop(), Some(2));
        assert_eq!(q.pop(), None);
    }

    #[test]
    fn queue_ignore_rest_test() {
        let q: Queue<u32> = Queue::unbounded(1);
        q.push(1);
        q.ignore_rest();
        assert!(!q.push(2));
        assert_eq!(q.pop(), None);
    }

    #[test]
    fn bounded_queue_backpressure_test() {
        let q: Arc<Queue<u32>> = Arc::new(Queue::bounded(1, 1));
        q.push(1);
        let q2 = Arc::clone(&q);
        let th = std::thread::spawn(move || {
            q2.push(2); // must wait for the pop below
            q2.mark_completed();
        });
        std::thread::sleep(std::time::Duration::from_millis(20));
        assert_eq!(q.pop(), Some(1));
        th.join().unwrap();
        assert_eq!(q.pop(), Some(2));
        assert_eq!(q.pop(), None);
    }

    #[test]
    fn kmer_queue_orders_bins_test() {
        let q = KmerQueue::new(1);
        q.push(CompletedBin::diverted(2));
        q.push(CompletedBin::diverted(0));
        q.push(CompletedBin::diverted(1));
        q.mark_completed();
        for expect in 0..3 {
            let bin = q.pop_in_order(expect).unwrap();
            assert_eq!(bin.bin_id, expect);
        }
        assert!(q.pop_in_order(3).is_none());
    }

    #[test]
    fn stats_queue_budget_test() {
        let q = StatsPartQueue::new(16, 1, 10);
        assert!(q.push(Part { data: vec![0; 8] }));
        // budget not yet exhausted, this one still goes through
        assert!(q.push(Part { data: vec![0; 8] }));
        assert!(!q.push(Part { data: vec![0; 8] }));
    }
}
