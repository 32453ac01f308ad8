//! Signature statistics, the first pass over a sampled input prefix.
//!
//! Stats splitters run the exact super-k-mer walk of the main splitter but
//! only histogram how many k-mers each signature would receive. The mapper
//! balances bins from the merged histogram.

use crate::error::Result;
use crate::splitter::{RecordTokenizer, Splitter, SuperKmerSink};
use kmer::mmer::MmerNorm;
use ktio::seq::SeqFormat;

struct StatsSink<'a> {
    kmer_len: usize,
    stats: &'a mut [u64],
}

impl SuperKmerSink for StatsSink<'_> {
    fn flush_super_kmer(&mut self, signature: u32, seq: &[u8]) -> Result<()> {
        self.stats[signature as usize] += (seq.len() - self.kmer_len + 1) as u64;
        Ok(())
    }
}

pub struct StatsSplitter {
    splitter: Splitter,
    kmer_len: usize,
    format: SeqFormat,
    both_strands: bool,
    pub stats: Vec<u64>,
}

impl StatsSplitter {
    pub fn new(
        kmer_len: usize,
        norm: &'static MmerNorm,
        format: SeqFormat,
        both_strands: bool,
    ) -> StatsSplitter {
        StatsSplitter {
            splitter: Splitter::new(kmer_len, norm),
            kmer_len,
            format,
            both_strands,
            stats: vec![0u64; norm.map_size()],
        }
    }

    pub fn process_part(&mut self, part: &[u8], seq: &mut Vec<u8>) -> Result<()> {
        let mut tokenizer = RecordTokenizer::new(self.format, part, self.both_strands);
        let mut sink = StatsSink {
            kmer_len: self.kmer_len,
            stats: &mut self.stats,
        };
        while tokenizer.next_into(seq) {
            self.splitter.split_sequence(seq, &mut sink)?;
        }
        Ok(())
    }
}

/// Element-wise merge of per-thread histograms.
pub fn merge_stats(target: &mut [u64], other: &[u64]) {
    for (t, o) in target.iter_mut().zip(other.iter()) {
        *t += *o;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stats_count_all_kmers_test() {
        let norm = MmerNorm::get(5);
        let mut splitter = StatsSplitter::new(9, norm, SeqFormat::Fasta, true);
        let part = b">r\nATCGGCTAAGCTTAGGCTAGCTAGGCATCGG\n";
        let mut seq = Vec::new();
        splitter.process_part(part, &mut seq).unwrap();
        let total: u64 = splitter.stats.iter().sum();
        // 31 bases, k = 9 -> 23 k-mers counted across all signatures
        assert_eq!(total, 23);
    }

    #[test]
    fn merge_stats_test() {
        let mut a = vec![1, 2, 3];
        merge_stats(&mut a, &[10, 0, 5]);
        assert_eq!(a, vec![11, 2, 8]);
    }
}
