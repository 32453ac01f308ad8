//! Per-bin sorting and compaction.
//!
//! Expand the bin file into sortable records, radix-sort them, pre-compact
//! exact duplicates, then stream the k-prefix order through the run merger
//! applying cutoffs and saturation. The arena slots are claimed and released
//! phase by phase so the live set always fits the span the bin manager
//! reserved.

use crate::arena::{ArenaSlot, SortArena};
use crate::bins::BinTable;
use crate::error::{CounterError, Result};
use crate::expander;
use crate::kxmer_set::{
    merge_part, LutUpdater, MergeParams, MergeStats, SubArrayDesc, SubArrayDescGenerator,
};
use crate::queues::{BinJob, CompletedBin, KmerQueue};
use crate::radix::radix_sort_msd;
use crate::shared::SharedSlice;
use crate::sorters::SortersManager;
use kmer::words::KmerWords;
use std::sync::Mutex;

#[derive(Debug, Clone, Copy)]
pub struct SorterParams {
    pub kmer_len: usize,
    pub max_x: u32,
    pub both_strands: bool,
    pub cutoff_min: u32,
    pub cutoff_max: u64,
    pub counter_max: u64,
    pub lut_prefix_len: usize,
    pub counter_size: usize,
}

impl SorterParams {
    fn merge_params(&self) -> MergeParams {
        MergeParams {
            kmer_len: self.kmer_len,
            lut_prefix_len: self.lut_prefix_len,
            cutoff_min: self.cutoff_min,
            cutoff_max: self.cutoff_max,
            counter_max: self.counter_max,
            counter_size: self.counter_size,
        }
    }
}

pub fn sorter_loop<const W: usize>(
    params: &SorterParams,
    manager: &SortersManager,
    table: &BinTable,
    arena: &SortArena,
    kmer_queue: &KmerQueue,
) -> Result<()> {
    while let Some((job, n_threads)) = manager.get_next() {
        let outcome = process_bin::<W>(params, job, n_threads, table, arena);
        manager.return_threads(n_threads);
        kmer_queue.push(outcome?);
    }
    Ok(())
}

fn process_bin<const W: usize>(
    params: &SorterParams,
    mut job: BinJob,
    n_threads: usize,
    table: &BinTable,
    arena: &SortArena,
) -> Result<CompletedBin> {
    let bin_id = job.bin_id;
    let k = params.kmer_len;
    let kxmer_mode = params.max_x > 0;
    let (sort_recs, rec_bytes) = if kxmer_mode {
        (
            job.n_plus_x_recs as usize,
            (k + params.max_x as usize + 1 + 3) / 4,
        )
    } else {
        (job.n_rec as usize, (k + 3) / 4)
    };

    let lut_recs = 1usize << (2 * params.lut_prefix_len);

    if sort_recs == 0 {
        drop(job.data.take());
        let lut_buf = arena.alloc(bin_id, ArenaSlot::Lut, lut_recs * 8)?;
        let suffix = arena.alloc(bin_id, ArenaSlot::Suffix, 0)?;
        arena.trim(bin_id);
        return Ok(CompletedBin {
            bin_id,
            suffix: Some(suffix),
            packs: Vec::new(),
            lut: Some(lut_buf),
            n_unique: 0,
            n_cutoff_min: 0,
            n_cutoff_max: 0,
            n_total: 0,
            diverted: false,
        });
    }

    let record_size = std::mem::size_of::<KmerWords<W>>();
    let expander_parts = table.take_expander_parts(bin_id);

    // expand while the file slot is live, then let it go
    let mut input_buf = arena.alloc(bin_id, ArenaSlot::InputArray, sort_recs * record_size)?;
    let real_recs = {
        let input: &mut [KmerWords<W>] = input_buf.as_slice_of();
        let data = job.data.as_deref().unwrap_or(&[]);
        match (kxmer_mode, params.both_strands) {
            (true, true) => expander::expand_kxmers_both_parallel(
                data,
                expander_parts,
                k,
                params.max_x,
                &mut input[..sort_recs],
                sort_recs,
                n_threads,
            ),
            (true, false) => expander::expand_kxmers_all(data, k, params.max_x, input),
            (false, true) => expander::expand_kmers_both(data, k, input),
            (false, false) => expander::expand_kmers_all(data, k, input),
        }
    };
    drop(job.data.take());
    if real_recs > sort_recs {
        return Err(CounterError::Internal(format!(
            "bin {} expanded to {} records, {} were counted",
            bin_id, real_recs, sort_recs
        )));
    }

    let mut tmp_buf = arena.alloc(bin_id, ArenaSlot::TmpArray, sort_recs * record_size)?;
    {
        let input: &mut [KmerWords<W>] = input_buf.as_slice_of();
        let tmp: &mut [KmerWords<W>] = tmp_buf.as_slice_of();
        radix_sort_msd(
            &mut input[..real_recs],
            &mut tmp[..real_recs],
            rec_bytes,
            n_threads,
        );
    }
    let result_in_input = rec_bytes % 2 == 0;
    let (mut result_buf, other_buf) = if result_in_input {
        (input_buf, tmp_buf)
    } else {
        (tmp_buf, input_buf)
    };
    drop(other_buf);

    let max_out_recs = (job.n_rec + 1) / params.cutoff_min.max(1) as u64;
    let kmer_bytes = (k - params.lut_prefix_len) / 4;
    let out_size = max_out_recs as usize * (kmer_bytes + params.counter_size);
    let mut stats = MergeStats::default();
    let mut packs: Vec<(u64, u64)>;
    let mut suffix_buf;
    let mut lut_buf;

    if kxmer_mode {
        let mut counters_buf =
            arena.alloc(bin_id, ArenaSlot::KxmerCounters, sort_recs * 4)?;
        let compacted = {
            let buffer: &mut [KmerWords<W>] = result_buf.as_slice_of();
            let counters: &mut [u32] = counters_buf.as_slice_of();
            pre_compact(&mut buffer[..real_recs], &mut counters[..real_recs], n_threads)
        };
        suffix_buf = arena.alloc(bin_id, ArenaSlot::Suffix, out_size)?;
        lut_buf = arena.alloc(bin_id, ArenaSlot::Lut, lut_recs * 8)?;

        let buffer: &mut [KmerWords<W>] = result_buf.as_slice_of();
        let buffer = &buffer[..compacted];
        let counters: &mut [u32] = counters_buf.as_slice_of();
        let counters = &counters[..compacted];

        // records group by their tie-break field first
        let mut pos = [0u64; 5];
        pos[4] = compacted as u64;
        for i in 1..4u32 {
            pos[i as usize] =
                find_first_symb_occur(buffer, pos[i as usize - 1], compacted as u64, 0, i as u8, k, params.max_x);
        }
        let mut descs: Vec<SubArrayDesc> = Vec::new();
        for i in 1..5u32 {
            // a non-empty group implies its tie-break value <= max_x
            if pos[i as usize - 1] == pos[i as usize] {
                continue;
            }
            init_kxmer_runs(
                buffer,
                pos[i as usize - 1],
                pos[i as usize],
                params.max_x + 2 - i,
                i,
                k,
                params.max_x,
                &mut descs,
            );
        }

        let rec_len = kmer_bytes + params.counter_size;
        let generator = SubArrayDescGenerator::new(
            k,
            8 * n_threads,
            &descs,
            buffer,
            counters,
            params.cutoff_min,
            rec_len,
        );
        let merge_params = params.merge_params();
        let lut: &mut [u64] = lut_buf.as_slice_of();
        let lut_updater = LutUpdater::new(lut);
        let out_shared = SharedSlice::new(&mut suffix_buf[..]);
        let collected: Mutex<(MergeStats, Vec<(u64, u64)>)> =
            Mutex::new((MergeStats::default(), Vec::new()));
        rayon::scope(|scope| {
            for _ in 0..n_threads.max(1) {
                scope.spawn(|_| {
                    let mut local_stats = MergeStats::default();
                    let mut local_packs = Vec::new();
                    while let Some((part, out_start)) = generator.next() {
                        if let Some(range) = merge_part(
                            &part,
                            out_start,
                            buffer,
                            counters,
                            &merge_params,
                            &lut_updater,
                            out_shared,
                            &mut local_stats,
                        ) {
                            local_packs.push(range);
                        }
                    }
                    let mut collected = collected.lock().unwrap();
                    collected.0.absorb(&local_stats);
                    collected.1.extend(local_packs);
                });
            }
        });
        let (merged_stats, mut merged_packs) = collected.into_inner().unwrap();
        stats = merged_stats;
        merged_packs.sort_unstable();
        packs = merged_packs;
        drop(counters_buf);
    } else {
        suffix_buf = arena.alloc(bin_id, ArenaSlot::Suffix, out_size)?;
        lut_buf = arena.alloc(bin_id, ArenaSlot::Lut, lut_recs * 8)?;
        let buffer: &mut [KmerWords<W>] = result_buf.as_slice_of();
        let lut: &mut [u64] = lut_buf.as_slice_of();
        let out_pos = compact_kmers(
            &buffer[..real_recs],
            params,
            lut,
            &mut suffix_buf[..],
            &mut stats,
        );
        packs = vec![(0, out_pos)];
        if out_pos == 0 {
            packs.clear();
        }
    }
    drop(result_buf);
    arena.trim(bin_id);

    Ok(CompletedBin {
        bin_id,
        suffix: Some(suffix_buf),
        packs,
        lut: Some(lut_buf),
        n_unique: stats.n_unique,
        n_cutoff_min: stats.n_cutoff_min,
        n_cutoff_max: stats.n_cutoff_max,
        n_total: stats.n_total,
        diverted: false,
    })
}

/// Deduplicate equal neighbouring records, recording multiplicities.
/// Returns the compacted record count.
pub fn pre_compact<const W: usize>(
    buffer: &mut [KmerWords<W>],
    counters: &mut [u32],
    n_threads: usize,
) -> usize {
    let total = buffer.len();
    if total == 0 {
        return 0;
    }
    let n_threads = n_threads.clamp(1, total);
    let per_thread = total / n_threads;
    let mut start_end = vec![(0usize, 0usize); n_threads];

    {
        let buf_shared = SharedSlice::new(buffer);
        let cnt_shared = SharedSlice::new(counters);
        let starts: Vec<(usize, usize)> = (0..n_threads)
            .map(|idx| {
                let start = idx * per_thread;
                let end = if idx == n_threads - 1 {
                    total
                } else {
                    (idx + 1) * per_thread
                };
                (start, end)
            })
            .collect();
        let results: Mutex<&mut Vec<(usize, usize)>> = Mutex::new(&mut start_end);
        rayon::scope(|scope| {
            for (idx, &(start, end)) in starts.iter().enumerate() {
                let results = &results;
                scope.spawn(move |_| {
                    let compacted_end = if start < end {
                        let buf = unsafe { buf_shared.slice_mut(start, end) };
                        let cnt = unsafe { cnt_shared.slice_mut(start, end) };
                        compact_range(buf, cnt) + start
                    } else {
                        end
                    };
                    results.lock().unwrap()[idx] = (start, compacted_end);
                });
            }
        });
    }

    // stitch the per-thread prefixes together
    let mut compacted_count = start_end[0].1;
    for i in 1..n_threads {
        let (mut seg_start, seg_end) = start_end[i];
        if seg_end <= seg_start {
            continue;
        }
        if compacted_count > 0 && buffer[compacted_count - 1] == buffer[seg_start] {
            counters[compacted_count - 1] += counters[seg_start];
            seg_start += 1;
        }
        let n_elems = seg_end - seg_start;
        if n_elems == 0 {
            continue;
        }
        buffer.copy_within(seg_start..seg_end, compacted_count);
        counters.copy_within(seg_start..seg_end, compacted_count);
        compacted_count += n_elems;
    }
    compacted_count
}

fn compact_range<const W: usize>(buffer: &mut [KmerWords<W>], counters: &mut [u32]) -> usize {
    let mut compacted_pos = 0usize;
    let mut act_kmer = buffer[0];
    counters[0] = 1;
    for i in 1..buffer.len() {
        if act_kmer == buffer[i] {
            counters[compacted_pos] += 1;
        } else {
            buffer[compacted_pos] = act_kmer;
            compacted_pos += 1;
            counters[compacted_pos] = 1;
            act_kmer = buffer[i];
        }
    }
    buffer[compacted_pos] = act_kmer;
    compacted_pos + 1
}

/// First position in [start, end) whose symbol at `offset` (counted from the
/// top of the record) is at least `symb`.
pub fn find_first_symb_occur<const W: usize>(
    buffer: &[KmerWords<W>],
    mut start: u64,
    mut end: u64,
    offset: u32,
    symb: u8,
    kmer_len: usize,
    max_x: u32,
) -> u64 {
    let kxmer_offset = 2 * (kmer_len as u32 + max_x - offset);
    while start < end {
        let middle = (start + end) / 2;
        if buffer[middle as usize].get_2bits(kxmer_offset) < symb {
            start = middle + 1;
        } else {
            end = middle;
        }
    }
    end
}

/// Register the runs of one tie-break group: the group itself (stripping
/// `shr` extension bases yields the first k-mer of each record), then the
/// later k-mers via recursively finer leading-symbol partitions.
#[allow(clippy::too_many_arguments)]
pub fn init_kxmer_runs<const W: usize>(
    buffer: &[KmerWords<W>],
    start: u64,
    end: u64,
    offset: u32,
    depth: u32,
    kmer_len: usize,
    max_x: u32,
    runs: &mut Vec<SubArrayDesc>,
) {
    if start == end {
        return;
    }
    let shr = max_x + 1 - offset;
    runs.push(SubArrayDesc {
        start,
        end,
        shr,
        counters_sum: 0,
    });
    if depth > 1 {
        let mut pos = [0u64; 5];
        pos[0] = start;
        pos[4] = end;
        for i in 1..4u32 {
            pos[i as usize] =
                find_first_symb_occur(buffer, pos[i as usize - 1], end, offset, i as u8, kmer_len, max_x);
        }
        for i in 1..5usize {
            init_kxmer_runs(
                buffer,
                pos[i - 1],
                pos[i],
                offset + 1,
                depth - 1,
                kmer_len,
                max_x,
                runs,
            );
        }
    }
}

/// Plain-k-mer compaction: a linear scan over the sorted records.
fn compact_kmers<const W: usize>(
    buffer: &[KmerWords<W>],
    params: &SorterParams,
    lut: &mut [u64],
    out: &mut [u8],
    stats: &mut MergeStats,
) -> u64 {
    let kmer_symbols = params.kmer_len - params.lut_prefix_len;
    let kmer_bytes = kmer_symbols / 4;
    let mut out_pos = 0usize;

    if buffer.is_empty() {
        return 0;
    }
    let mut emit = |kmer: &KmerWords<W>, count: u64| {
        stats.n_unique += 1;
        if count < params.cutoff_min as u64 {
            stats.n_cutoff_min += 1;
        } else if count > params.cutoff_max {
            stats.n_cutoff_max += 1;
        } else {
            let count = count.min(params.counter_max);
            for j in (0..kmer_bytes).rev() {
                out[out_pos] = kmer.get_byte(j);
                out_pos += 1;
            }
            for j in 0..params.counter_size {
                out[out_pos] = ((count >> (j * 8)) & 0xFF) as u8;
                out_pos += 1;
            }
            lut[kmer.remove_suffix(2 * kmer_symbols as u32) as usize] += 1;
        }
    };

    let mut act_kmer = &buffer[0];
    let mut count = 1u64;
    stats.n_total = buffer.len() as u64;
    for rec in &buffer[1..] {
        if act_kmer == rec {
            count += 1;
        } else {
            emit(act_kmer, count);
            act_kmer = rec;
            count = 1;
        }
    }
    emit(act_kmer, count);
    out_pos as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rec(v: u64) -> KmerWords<1> {
        KmerWords { data: [v] }
    }

    #[test]
    fn pre_compact_test() {
        let mut buffer = vec![rec(1), rec(1), rec(2), rec(2), rec(2), rec(7)];
        let mut counters = vec![0u32; 6];
        let n = pre_compact(&mut buffer, &mut counters, 1);
        assert_eq!(n, 3);
        assert_eq!(&counters[..3], &[2, 3, 1]);
        assert_eq!(buffer[0], rec(1));
        assert_eq!(buffer[1], rec(2));
        assert_eq!(buffer[2], rec(7));
    }

    #[test]
    fn pre_compact_parallel_matches_serial_test() {
        let vals: Vec<u64> = (0..10_000).map(|i| (i / 7) as u64).collect();
        let mut b1: Vec<KmerWords<1>> = vals.iter().map(|&v| rec(v)).collect();
        let mut b2 = b1.clone();
        let mut c1 = vec![0u32; vals.len()];
        let mut c2 = vec![0u32; vals.len()];
        let n1 = pre_compact(&mut b1, &mut c1, 1);
        let n2 = pre_compact(&mut b2, &mut c2, 4);
        assert_eq!(n1, n2);
        assert_eq!(&b1[..n1], &b2[..n2]);
        assert_eq!(&c1[..n1], &c2[..n2]);
    }

    #[test]
    fn find_first_symb_occur_test() {
        // k = 3, max_x = 0: offset 0 reads the 2 bits at position 6
        let buffer: Vec<KmerWords<1>> = (0..16u64).map(|v| rec(v << 4)).collect();
        // records sorted; symbol at offset 0 is v >> 2
        let p = find_first_symb_occur(&buffer, 0, 16, 0, 2, 3, 0);
        assert_eq!(p, 8);
        let p = find_first_symb_occur(&buffer, 0, 16, 0, 0, 3, 0);
        assert_eq!(p, 0);
    }

    #[test]
    fn init_kxmer_runs_counts_test() {
        // a group with tie-break c at depth c+1 produces (4^(c+1) - 1) / 3
        // runs at most; with a full spread of leading symbols exactly that
        let buffer: Vec<KmerWords<1>> = (0..64u64).map(|v| rec(v << 2)).collect();
        let mut runs = Vec::new();
        // k = 2, max_x = 1: group of x-field = 1 at depth 2
        init_kxmer_runs(&buffer, 0, 64, 1, 2, 2, 1, &mut runs);
        assert_eq!(runs.len(), 1 + 4);
        assert_eq!(runs[0].shr, 1);
        for run in &runs[1..] {
            assert_eq!(run.shr, 0);
        }
    }

    #[test]
    fn compact_kmers_applies_cutoffs_test() {
        let params = SorterParams {
            kmer_len: 8,
            max_x: 0,
            both_strands: false,
            cutoff_min: 2,
            cutoff_max: 3,
            counter_max: 2,
            lut_prefix_len: 4,
            counter_size: 1,
        };
        let buffer = vec![rec(5), rec(5), rec(5), rec(6), rec(9), rec(9), rec(9), rec(9)];
        let mut lut = vec![0u64; 256];
        let mut out = vec![0u8; 64];
        let mut stats = MergeStats::default();
        let written = compact_kmers(&buffer, &params, &mut lut, &mut out, &mut stats);
        // 5 x3 passes (saturated to 2); 6 x1 below min; 9 x4 above max
        assert_eq!(stats.n_unique, 3);
        assert_eq!(stats.n_cutoff_min, 1);
        assert_eq!(stats.n_cutoff_max, 1);
        assert_eq!(stats.n_total, 8);
        assert_eq!(written, 2);
        assert_eq!(&out[..2], &[5, 2]);
        assert_eq!(lut[0], 1);
    }
}
