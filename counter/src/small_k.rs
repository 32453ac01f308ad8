//! The small-k fast path: direct 4^k count tables.
//!
//! When the whole table fits comfortably in memory there is nothing to
//! partition: splitters bump flat per-thread arrays, the arrays are summed,
//! and a dedicated completer walks the table in k-mer order writing the same
//! database layout as the general pipeline.

use crate::error::Result;
use crate::kxmer_set::MergeStats;
use crate::output::{DbHeader, DbWriter};
use crate::splitter::RecordTokenizer;
use kmer::CODE_N;
use ktio::seq::SeqFormat;
use std::path::Path;

pub trait SmallCounter: Copy + Default + Send + Sync {
    fn inc(&mut self);
    fn add(&mut self, other: Self);
    fn get(self) -> u64;
}

impl SmallCounter for u32 {
    fn inc(&mut self) {
        *self = self.wrapping_add(1);
    }
    fn add(&mut self, other: Self) {
        *self = self.wrapping_add(other);
    }
    fn get(self) -> u64 {
        self as u64
    }
}

impl SmallCounter for u64 {
    fn inc(&mut self) {
        *self += 1;
    }
    fn add(&mut self, other: Self) {
        *self += other;
    }
    fn get(self) -> u64 {
        self
    }
}

pub struct SmallKSplitter<C: SmallCounter> {
    kmer_len: usize,
    both_strands: bool,
    format: SeqFormat,
    pub counts: Vec<C>,
    pub total_kmers: u64,
    pub n_reads: u64,
}

impl<C: SmallCounter> SmallKSplitter<C> {
    pub fn new(kmer_len: usize, both_strands: bool, format: SeqFormat) -> SmallKSplitter<C> {
        SmallKSplitter {
            kmer_len,
            both_strands,
            format,
            counts: vec![C::default(); 1usize << (2 * kmer_len)],
            total_kmers: 0,
            n_reads: 0,
        }
    }

    pub fn process_part(&mut self, part: &[u8], seq: &mut Vec<u8>) -> Result<()> {
        let mut tokenizer = RecordTokenizer::new(self.format, part, self.both_strands);
        while tokenizer.next_into(seq) {
            if self.format != SeqFormat::MultiFasta {
                self.n_reads += 1;
            }
            self.process_sequence(seq);
        }
        Ok(())
    }

    fn process_sequence(&mut self, seq: &mut [u8]) {
        let k = self.kmer_len;
        if seq.len() < k {
            return;
        }
        let mask = (1u64 << (2 * k)) - 1;
        let shift = (k as u64 - 1) * 2;
        let mut kmer_str = 0u64;
        let mut kmer_rev = 0u64;
        let mut omit_next_n_kmers = 0usize;

        // seed the first k-1 symbols
        for (i, c) in seq.iter_mut().enumerate().take(k - 1) {
            if *c >= CODE_N {
                *c = 0;
                omit_next_n_kmers = i + 1;
            }
            kmer_str = (kmer_str << 2) | *c as u64;
            if self.both_strands {
                kmer_rev |= ((3 - *c) as u64) << (2 * (i + 1));
            }
        }
        for i in k - 1..seq.len() {
            let c = &mut seq[i];
            if *c >= CODE_N {
                *c = 0;
                omit_next_n_kmers = k;
            }
            kmer_str = ((kmer_str << 2) | *c as u64) & mask;
            kmer_rev = (kmer_rev >> 2) | (((3 - *c) as u64) << shift);
            if omit_next_n_kmers > 0 {
                omit_next_n_kmers -= 1;
                continue;
            }
            let idx = if self.both_strands {
                kmer_str.min(kmer_rev)
            } else {
                kmer_str
            };
            self.counts[idx as usize].inc();
            self.total_kmers += 1;
        }
    }

    pub fn absorb(&mut self, other: &SmallKSplitter<C>) {
        for (a, &b) in self.counts.iter_mut().zip(other.counts.iter()) {
            a.add(b);
        }
        self.total_kmers += other.total_kmers;
        self.n_reads += other.n_reads;
    }
}

/// LUT prefix choice for the single-table database; unlike the general
/// path a prefix as long as the whole k-mer is allowed.
fn choose_small_lut_prefix_len(n_recs: u64, kmer_len: usize) -> usize {
    let mut best = kmer_len;
    let mut best_mem = u64::MAX;
    for lut_prefix_len in 1..=kmer_len.min(15) {
        let suffix_len = kmer_len - lut_prefix_len;
        if suffix_len % 4 != 0 {
            continue;
        }
        let mem = n_recs * (suffix_len as u64 / 4) + (1u64 << (2 * lut_prefix_len)) * 8;
        if mem < best_mem {
            best = lut_prefix_len;
            best_mem = mem;
        }
    }
    best
}

#[allow(clippy::too_many_arguments)]
pub fn complete_small_k<C: SmallCounter>(
    counts: &[C],
    kmer_len: usize,
    signature_len: usize,
    cutoff_min: u32,
    cutoff_max: u64,
    counter_max: u64,
    counter_size: usize,
    both_strands: bool,
    output_base: &Path,
) -> Result<MergeStats> {
    let mut stats = MergeStats::default();
    let mut surviving = 0u64;
    for &c in counts {
        let count = c.get();
        if count > 0 {
            stats.n_unique += 1;
            stats.n_total += count;
            if count < cutoff_min as u64 {
                stats.n_cutoff_min += 1;
            } else if count > cutoff_max {
                stats.n_cutoff_max += 1;
            } else {
                surviving += 1;
            }
        }
    }

    let lut_prefix_len = choose_small_lut_prefix_len(surviving, kmer_len);
    let suffix_symbols = kmer_len - lut_prefix_len;
    let suffix_bytes = suffix_symbols / 4;
    let mut lut = vec![0u64; 1usize << (2 * lut_prefix_len)];

    let mut writer = DbWriter::create(output_base)?;
    let mut record = Vec::with_capacity(suffix_bytes + counter_size);
    for (idx, &c) in counts.iter().enumerate() {
        let count = c.get();
        if count < cutoff_min.max(1) as u64 || count > cutoff_max {
            continue;
        }
        let count = count.min(counter_max);
        record.clear();
        for byte in (0..suffix_bytes).rev() {
            record.push(((idx >> (8 * byte)) & 0xFF) as u8);
        }
        for b in 0..counter_size {
            record.push(((count >> (8 * b)) & 0xFF) as u8);
        }
        writer.write_suffix_data(&record)?;
        lut[idx >> (2 * suffix_symbols)] += 1;
    }
    writer.write_lut(&mut lut)?;

    let header = DbHeader {
        kmer_len: kmer_len as u32,
        counter_size: counter_size as u32,
        lut_prefix_len: lut_prefix_len as u32,
        signature_len: signature_len as u32,
        cutoff_min,
        cutoff_max: cutoff_max.min(u32::MAX as u64) as u32,
        counted: surviving,
        no_canonical: !both_strands,
    };
    let sig_map = vec![0u32; (1usize << (2 * signature_len)) + 1];
    writer.finish(&header, &sig_map)?;
    Ok(stats)
}
