//! Merging sorted k+x-mer runs into (k-mer, count) output.
//!
//! A sorted bin is a union of runs: records grouped by their tie-break
//! field, then recursively by leading extension symbols. Within one run,
//! stripping the run's fixed number of trailing bases yields k-mers in
//! ascending order, so a heap over the runs streams the whole bin in
//! k-prefix order. Equal k-mers are compacted, cutoffs and saturation
//! applied, suffix bytes emitted and the prefix LUT bumped.

use crate::shared::SharedSlice;
use kmer::words::KmerWords;
use std::collections::VecDeque;
use std::sync::Mutex;

const COMPACT_CUMSUM_PART_SIZE: u64 = 1 << 10;

#[derive(Debug, Clone, Copy)]
pub struct SubArrayDesc {
    pub start: u64,
    pub end: u64,
    pub shr: u32,
    pub counters_sum: u64,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct MergeStats {
    pub n_unique: u64,
    pub n_cutoff_min: u64,
    pub n_cutoff_max: u64,
    pub n_total: u64,
}

impl MergeStats {
    pub fn absorb(&mut self, other: &MergeStats) {
        self.n_unique += other.n_unique;
        self.n_cutoff_min += other.n_cutoff_min;
        self.n_cutoff_max += other.n_cutoff_max;
        self.n_total += other.n_total;
    }
}

#[derive(Debug, Clone, Copy)]
pub struct MergeParams {
    pub kmer_len: usize,
    pub lut_prefix_len: usize,
    pub cutoff_min: u32,
    pub cutoff_max: u64,
    pub counter_max: u64,
    pub counter_size: usize,
}

/// Heap of sorted runs, popping k-mers in ascending order.
pub struct KxmerSet<'a, const W: usize> {
    descs: Vec<(u64, u64, u32)>, // start, end, shr
    heap: Vec<(KmerWords<W>, u32)>,
    mask: KmerWords<W>,
    buffer: &'a [KmerWords<W>],
}

impl<'a, const W: usize> KxmerSet<'a, W> {
    pub fn new(kmer_len: usize, buffer: &'a [KmerWords<W>]) -> Self {
        KxmerSet {
            descs: Vec::new(),
            heap: vec![(KmerWords::zero(), 0)], // slot 0 unused
            mask: KmerWords::n_ones(2 * kmer_len as u32),
            buffer,
        }
    }

    pub fn init_add(&mut self, start: u64, end: u64, shr: u32) {
        if start >= end {
            return;
        }
        let kmer = KmerWords::from_kxmer(&self.buffer[start as usize], shr, &self.mask);
        let desc_id = self.descs.len() as u32;
        self.descs.push((start, end, shr));
        self.heap.push((kmer, desc_id));
        let mut child = self.heap.len() - 1;
        while child > 1 && self.heap[child].0 < self.heap[child / 2].0 {
            self.heap.swap(child, child / 2);
            child /= 2;
        }
    }

    /// Pop the minimum k-mer; also yields the record index its counter
    /// lives at.
    pub fn get_min(&mut self) -> Option<(u64, KmerWords<W>)> {
        if self.heap.len() <= 1 {
            return None;
        }
        let (kmer, desc_id) = self.heap[1];
        let counter_pos = self.descs[desc_id as usize].0;

        // refill the root from the popped run, or shrink the heap
        let desc = &mut self.descs[desc_id as usize];
        desc.0 += 1;
        let replacement = if desc.0 < desc.1 {
            let next =
                KmerWords::from_kxmer(&self.buffer[desc.0 as usize], desc.2, &self.mask);
            (next, desc_id)
        } else {
            let last = self.heap.pop().expect("non-empty heap");
            if self.heap.len() <= 1 {
                return Some((counter_pos, kmer));
            }
            last
        };
        self.heap[1] = replacement;
        self.sift_down(1);
        Some((counter_pos, kmer))
    }

    fn sift_down(&mut self, mut parent: usize) {
        let len = self.heap.len();
        loop {
            let left = parent * 2;
            if left >= len {
                break;
            }
            let right = left + 1;
            let smaller = if right < len && self.heap[right].0 < self.heap[left].0 {
                right
            } else {
                left
            };
            if self.heap[smaller].0 < self.heap[parent].0 {
                self.heap.swap(parent, smaller);
                parent = smaller;
            } else {
                break;
            }
        }
    }
}

/// Chunked cumulative sums over the pre-compacted record counters, enough to
/// count k-mer instances in any record range.
pub struct CounterCumsum<'a> {
    counters: &'a [u32],
    chunk_totals: Vec<u64>,
}

impl<'a> CounterCumsum<'a> {
    pub fn new(counters: &'a [u32]) -> Self {
        let n_chunks = (counters.len() as u64 + COMPACT_CUMSUM_PART_SIZE - 1)
            / COMPACT_CUMSUM_PART_SIZE;
        let mut chunk_totals = Vec::with_capacity(n_chunks as usize);
        let mut acc = 0u64;
        for chunk in counters.chunks(COMPACT_CUMSUM_PART_SIZE as usize) {
            acc += chunk.iter().map(|&c| c as u64).sum::<u64>();
            chunk_totals.push(acc);
        }
        CounterCumsum {
            counters,
            chunk_totals,
        }
    }

    /// Sum of counters[0..pos].
    pub fn get(&self, pos: u64) -> u64 {
        if pos == 0 {
            return 0;
        }
        let last = pos - 1;
        let chunk = last / COMPACT_CUMSUM_PART_SIZE;
        let mut res = if chunk > 0 {
            self.chunk_totals[(chunk - 1) as usize]
        } else {
            0
        };
        for i in chunk * COMPACT_CUMSUM_PART_SIZE..=last {
            res += self.counters[i as usize] as u64;
        }
        res
    }
}

/// Cuts the run set into balanced parts for the merger threads; every part
/// covers one k-mer interval across all runs and owns an exclusive output
/// byte range.
pub struct SubArrayDescGenerator {
    parts: Mutex<VecDeque<(Vec<SubArrayDesc>, u64)>>,
}

impl SubArrayDescGenerator {
    pub fn new<const W: usize>(
        kmer_len: usize,
        n_parts: usize,
        sub_array_descs: &[SubArrayDesc],
        buffer: &[KmerWords<W>],
        counters: &[u32],
        cutoff_min: u32,
        rec_len: usize,
    ) -> SubArrayDescGenerator {
        if sub_array_descs.is_empty() {
            return SubArrayDescGenerator {
                parts: Mutex::new(VecDeque::new()),
            };
        }
        let cumsum = CounterCumsum::new(counters);
        let mask = KmerWords::<W>::n_ones(2 * kmer_len as u32);

        let biggest_id = sub_array_descs
            .iter()
            .enumerate()
            .max_by_key(|(_, d)| d.end - d.start)
            .map(|(i, _)| i)
            .unwrap_or(0);

        let mut work: Vec<SubArrayDesc> = sub_array_descs.to_vec();
        let mut parts: VecDeque<Vec<SubArrayDesc>> = VecDeque::new();
        let mut parts_left = n_parts;

        while parts_left > 1 {
            let big = &work[biggest_id];
            if big.end <= big.start {
                break;
            }
            let split_at = big.start + (big.end - big.start) / parts_left as u64;
            let split_kmer = KmerWords::from_kxmer(
                &buffer[split_at as usize],
                work[biggest_id].shr,
                &mask,
            );

            let mut current = Vec::with_capacity(work.len());
            for desc in work.iter_mut() {
                let new_end = lower_bound(buffer, desc.start, desc.end, desc.shr, &mask, &split_kmer);
                current.push(SubArrayDesc {
                    start: desc.start,
                    end: new_end,
                    shr: desc.shr,
                    counters_sum: cumsum.get(new_end) - cumsum.get(desc.start),
                });
                desc.start = new_end;
            }
            parts.push_back(current);
            parts_left -= 1;
        }
        for desc in work.iter_mut() {
            desc.counters_sum = cumsum.get(desc.end) - cumsum.get(desc.start);
        }
        parts.push_back(work);

        // assign exclusive output ranges in part order
        let mut out_start = 0u64;
        let mut queue = VecDeque::with_capacity(parts.len());
        for part in parts {
            let n_recs: u64 = part.iter().map(|d| d.counters_sum).sum();
            let this_start = out_start;
            out_start += (n_recs / cutoff_min.max(1) as u64) * rec_len as u64;
            queue.push_back((part, this_start));
        }
        SubArrayDescGenerator {
            parts: Mutex::new(queue),
        }
    }

    pub fn next(&self) -> Option<(Vec<SubArrayDesc>, u64)> {
        self.parts.lock().unwrap().pop_front()
    }
}

fn lower_bound<const W: usize>(
    buffer: &[KmerWords<W>],
    mut lo: u64,
    mut hi: u64,
    shr: u32,
    mask: &KmerWords<W>,
    split: &KmerWords<W>,
) -> u64 {
    while lo < hi {
        let mid = (lo + hi) / 2;
        let val = KmerWords::from_kxmer(&buffer[mid as usize], shr, mask);
        if val < *split {
            lo = mid + 1;
        } else {
            hi = mid;
        }
    }
    hi
}

/// Serialized updates of the prefixes shared between part boundaries;
/// interior prefixes belong to exactly one part and are bumped lock-free.
pub struct LutUpdater<'a> {
    lut: SharedSlice<'a, u64>,
    mtx: Mutex<()>,
}

impl<'a> LutUpdater<'a> {
    pub fn new(lut: &'a mut [u64]) -> Self {
        LutUpdater {
            lut: SharedSlice::new(lut),
            mtx: Mutex::new(()),
        }
    }

    /// The calling part owns `prefix` exclusively.
    #[inline]
    fn bump_exclusive(&self, prefix: u64) {
        unsafe {
            let v = self.lut.get(prefix as usize);
            self.lut.set(prefix as usize, v + 1);
        }
    }

    fn add_shared(&self, prefix: u64, val: u64) {
        let _guard = self.mtx.lock().unwrap();
        unsafe {
            let v = self.lut.get(prefix as usize);
            self.lut.set(prefix as usize, v + val);
        }
    }
}

/// Merge one part: stream its runs in order, compact equal k-mers, apply
/// cutoffs, emit suffix records. Returns the output byte range written.
#[allow(clippy::too_many_arguments)]
pub fn merge_part<const W: usize>(
    desc: &[SubArrayDesc],
    out_start: u64,
    buffer: &[KmerWords<W>],
    counters: &[u32],
    params: &MergeParams,
    lut_updater: &LutUpdater,
    out: SharedSlice<'_, u8>,
    stats: &mut MergeStats,
) -> Option<(u64, u64)> {
    let mut kxmer_set = KxmerSet::<W>::new(params.kmer_len, buffer);
    let mask = KmerWords::<W>::n_ones(2 * params.kmer_len as u32);

    let suffix_len_bits = ((params.kmer_len - params.lut_prefix_len) * 2) as u32;
    let kmer_bytes = (suffix_len_bits / 8) as usize;

    let mut last_prefix = 0u64;
    let mut last_prefix_n_recs = 0u64;
    let mut first_prefix = 1u64 << (2 * params.lut_prefix_len);
    let mut first_prefix_n_recs = 0u64;

    for d in desc {
        if d.end > d.start {
            kxmer_set.init_add(d.start, d.end, d.shr);
            let candidate_min = KmerWords::from_kxmer(&buffer[d.start as usize], d.shr, &mask);
            let candidate_max =
                KmerWords::from_kxmer(&buffer[(d.end - 1) as usize], d.shr, &mask);
            last_prefix = last_prefix.max(candidate_max.remove_suffix(suffix_len_bits));
            first_prefix = first_prefix.min(candidate_min.remove_suffix(suffix_len_bits));
        }
    }

    let mut out_pos = out_start;
    let (mut counter_pos, mut kmer) = kxmer_set.get_min()?;
    let mut count = counters[counter_pos as usize] as u64;

    let emit = |kmer: &KmerWords<W>, count: u64, out_pos: &mut u64, stats: &mut MergeStats,
                    last_recs: &mut u64, first_recs: &mut u64| {
        stats.n_total += count;
        stats.n_unique += 1;
        if count < params.cutoff_min as u64 {
            stats.n_cutoff_min += 1;
        } else if count > params.cutoff_max {
            stats.n_cutoff_max += 1;
        } else {
            let count = count.min(params.counter_max);
            let prefix = kmer.remove_suffix(suffix_len_bits);
            if prefix == last_prefix {
                *last_recs += 1;
            } else if prefix == first_prefix {
                *first_recs += 1;
            } else {
                lut_updater.bump_exclusive(prefix);
            }
            for j in (0..kmer_bytes).rev() {
                unsafe { out.set(*out_pos as usize, kmer.get_byte(j)) };
                *out_pos += 1;
            }
            for j in 0..params.counter_size {
                unsafe { out.set(*out_pos as usize, ((count >> (j * 8)) & 0xFF) as u8) };
                *out_pos += 1;
            }
        }
    };

    while let Some((next_pos, next_kmer)) = kxmer_set.get_min() {
        if kmer == next_kmer {
            count += counters[next_pos as usize] as u64;
        } else {
            emit(&kmer, count, &mut out_pos, stats, &mut last_prefix_n_recs, &mut first_prefix_n_recs);
            count = counters[next_pos as usize] as u64;
            kmer = next_kmer;
        }
        counter_pos = next_pos;
    }
    let _ = counter_pos;
    emit(&kmer, count, &mut out_pos, stats, &mut last_prefix_n_recs, &mut first_prefix_n_recs);

    lut_updater.add_shared(last_prefix, last_prefix_n_recs);
    if first_prefix != last_prefix {
        lut_updater.add_shared(first_prefix, first_prefix_n_recs);
    }
    Some((out_start, out_pos))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rec(v: u64) -> KmerWords<1> {
        KmerWords { data: [v] }
    }

    #[test]
    fn kxmer_set_merges_sorted_runs_test() {
        // two runs of plain k-mers (shr = 0), k = 4
        let buffer = vec![rec(1), rec(5), rec(9), rec(2), rec(5), rec(11)];
        let mut set = KxmerSet::new(4, &buffer);
        set.init_add(0, 3, 0);
        set.init_add(3, 6, 0);
        let mut got = Vec::new();
        while let Some((_, k)) = set.get_min() {
            got.push(k.data[0]);
        }
        assert_eq!(got, vec![1, 2, 5, 5, 9, 11]);
    }

    #[test]
    fn kxmer_set_strips_extensions_test() {
        // one run with shr = 1: records carry one extension base
        let k = 3;
        // bases: kmer 0b010101 with extension 0b11 -> record 0b01010111
        let buffer = vec![rec(0b0101_0111), rec(0b1101_0100)];
        let mut set = KxmerSet::new(k, &buffer);
        set.init_add(0, 2, 1);
        let (_, a) = set.get_min().unwrap();
        let (_, b) = set.get_min().unwrap();
        assert_eq!(a.data[0], 0b01_0101);
        assert_eq!(b.data[0], 0b11_0101);
    }

    #[test]
    fn counter_cumsum_test() {
        let counters: Vec<u32> = (0..5000).map(|i| (i % 5) as u32 + 1).collect();
        let cs = CounterCumsum::new(&counters);
        for pos in [0u64, 1, 1023, 1024, 1025, 2048, 4999, 5000] {
            let expect: u64 = counters[..pos as usize].iter().map(|&c| c as u64).sum();
            assert_eq!(cs.get(pos), expect, "pos {}", pos);
        }
    }

    #[test]
    fn generator_partitions_cover_everything_test() {
        let buffer: Vec<KmerWords<1>> = (0..1000u64).map(rec).collect();
        let counters = vec![1u32; 1000];
        let descs = vec![SubArrayDesc {
            start: 0,
            end: 1000,
            shr: 0,
            counters_sum: 0,
        }];
        let gen = SubArrayDescGenerator::new(8, 4, &descs, &buffer, &counters, 1, 3);
        let mut covered = 0u64;
        let mut n_parts = 0;
        while let Some((part, _)) = gen.next() {
            for d in &part {
                covered += d.end - d.start;
            }
            n_parts += 1;
        }
        assert_eq!(n_parts, 4);
        assert_eq!(covered, 1000);
    }

    #[test]
    fn merge_part_compacts_and_cuts_test() {
        // k = 8, lut prefix 4 -> one suffix byte per record
        let buffer = vec![rec(7), rec(7), rec(9), rec(300)];
        let counters = vec![2u32, 3, 1, 5];
        let descs = vec![SubArrayDesc {
            start: 0,
            end: 4,
            shr: 0,
            counters_sum: 11,
        }];
        let params = MergeParams {
            kmer_len: 8,
            lut_prefix_len: 4,
            cutoff_min: 2,
            cutoff_max: 1000,
            counter_max: 4,
            counter_size: 1,
        };
        let mut lut = vec![0u64; 256];
        let mut out = vec![0u8; 64];
        let mut stats = MergeStats::default();
        let updater = LutUpdater::new(&mut lut);
        let range = merge_part::<1>(
            &descs,
            0,
            &buffer,
            &counters,
            &params,
            &updater,
            SharedSlice::new(&mut out),
            &mut stats,
        )
        .unwrap();
        // kmer 7 count 5 (saturated to 4), kmer 9 count 1 (below min),
        // kmer 300 count 5 (saturated to 4)
        assert_eq!(stats.n_unique, 3);
        assert_eq!(stats.n_cutoff_min, 1);
        assert_eq!(stats.n_total, 11);
        assert_eq!(range, (0, 4));
        assert_eq!(&out[..4], &[7, 4, (300u32 % 256) as u8, 4]);
        // prefixes: 7>>8 = 0 and 300>>8 = 1 each saw one record
        assert_eq!(lut[0], 1);
        assert_eq!(lut[1], 1);
    }
}
