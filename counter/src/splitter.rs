//! The splitter: record tokenizing and super-k-mer routing.
//!
//! A splitter walks each sequence once, maintaining the signature of the
//! current super-k-mer run and the rightmost m-mer. A run is flushed to its
//! bin when a smaller signature appears, when the active signature's window
//! slides out of the current k-mer, at N symbols, at the super-k-mer length
//! cap and at sequence end.

use crate::error::Result;
use kmer::mmer::{Mmer, MmerNorm};
use kmer::{CODE_N, SEQ_NT4_TABLE};
use ktio::seq::SeqFormat;

use crate::params::MAX_EXTRA_SYMBOLS;

/// 4-bit BAM base codes to our 2-bit codes ("=ACMGRSVTWYHKDBN").
const BAM_CODES: [u8; 16] = [4, 0, 1, 4, 2, 4, 4, 4, 3, 4, 4, 4, 4, 4, 4, 4];
/// Same, complemented, for reverse-flagged reads ("=TGMCRSVAWYHKDBN").
const BAM_CODES_REV: [u8; 16] = [4, 3, 2, 4, 1, 4, 4, 4, 0, 4, 4, 4, 4, 4, 4, 4];

/// Pulls sequences (as 2-bit codes, [`CODE_N`] for anything else) out of one
/// record-aligned part.
pub struct RecordTokenizer<'a> {
    format: SeqFormat,
    part: &'a [u8],
    pos: usize,
    both_strands: bool,
}

impl<'a> RecordTokenizer<'a> {
    pub fn new(format: SeqFormat, part: &'a [u8], both_strands: bool) -> Self {
        RecordTokenizer {
            format,
            part,
            pos: 0,
            both_strands,
        }
    }

    /// Appends the next sequence into `seq`; false when the part is done.
    /// Returns whether a fresh read record started (multiline FASTA keeps
    /// feeding chunks of the same logical sequence).
    pub fn next_into(&mut self, seq: &mut Vec<u8>) -> bool {
        seq.clear();
        match self.format {
            SeqFormat::Fasta => self.next_fasta(seq),
            SeqFormat::MultiFasta => self.next_multi_fasta(seq),
            SeqFormat::Fastq => self.next_fastq(seq),
            SeqFormat::Bam => self.next_bam(seq),
        }
    }

    fn skip_line(&mut self) {
        while self.pos < self.part.len() && self.part[self.pos] != b'\n' {
            self.pos += 1;
        }
        if self.pos < self.part.len() {
            self.pos += 1;
        }
    }

    fn next_fasta(&mut self, seq: &mut Vec<u8>) -> bool {
        if self.pos >= self.part.len() || self.part[self.pos] != b'>' {
            return false;
        }
        self.skip_line();
        // sequence may wrap over several lines, up to the next header
        while self.pos < self.part.len() && self.part[self.pos] != b'>' {
            let c = self.part[self.pos];
            if c >= 32 {
                seq.push(SEQ_NT4_TABLE[c as usize]);
            }
            self.pos += 1;
        }
        true
    }

    fn next_multi_fasta(&mut self, seq: &mut Vec<u8>) -> bool {
        if self.pos >= self.part.len() {
            return false;
        }
        if self.part[self.pos] == b'>' {
            self.skip_line();
        }
        while self.pos < self.part.len() && self.part[self.pos] != b'>' {
            let c = self.part[self.pos];
            if c >= 32 {
                seq.push(SEQ_NT4_TABLE[c as usize]);
            }
            self.pos += 1;
        }
        true
    }

    fn next_fastq(&mut self, seq: &mut Vec<u8>) -> bool {
        if self.pos >= self.part.len() || self.part[self.pos] != b'@' {
            return false;
        }
        self.skip_line();
        while self.pos < self.part.len() {
            let c = self.part[self.pos];
            if c < 32 {
                break;
            }
            seq.push(SEQ_NT4_TABLE[c as usize]);
            self.pos += 1;
        }
        self.skip_line_end();
        // separator line starts with '+'
        if self.pos >= self.part.len() || self.part[self.pos] != b'+' {
            return !seq.is_empty();
        }
        self.skip_line();
        // quality line has the sequence's length
        self.pos = (self.pos + seq.len()).min(self.part.len());
        self.skip_line_end();
        true
    }

    fn skip_line_end(&mut self) {
        while self.pos < self.part.len() && self.part[self.pos] < 32 {
            self.pos += 1;
        }
    }

    fn next_bam(&mut self, seq: &mut Vec<u8>) -> bool {
        while self.pos + 4 <= self.part.len() {
            let block_size = u32::from_le_bytes(
                self.part[self.pos..self.pos + 4].try_into().expect("4 bytes"),
            ) as usize;
            self.pos += 4;
            let record_start = self.pos;
            if record_start + block_size > self.part.len() {
                return false;
            }
            let rec = &self.part[record_start..record_start + block_size];

            let bin_mq_nl = u32::from_le_bytes(rec[8..12].try_into().expect("4 bytes"));
            let l_read_name = (bin_mq_nl & 0xFF) as usize;
            let flag_nc = u32::from_le_bytes(rec[12..16].try_into().expect("4 bytes"));
            let n_cigar_op = (flag_nc & 0xFFFF) as usize;
            let flags = flag_nc >> 16;
            let l_seq = i32::from_le_bytes(rec[16..20].try_into().expect("4 bytes")) as usize;

            // skip secondary (bit 8) and supplementary (bit 11) alignments;
            // duplicate-flagged reads (bit 10) are intentionally kept
            let exclude = ((flags >> 8) & 1) != 0 || ((flags >> 11) & 1) != 0;
            self.pos = record_start + block_size;
            if exclude {
                continue;
            }

            let seq_off = 32 + l_read_name + 4 * n_cigar_op;
            let packed = &rec[seq_off..seq_off + (l_seq + 1) / 2];
            let is_rev_comp = ((flags >> 4) & 1) != 0;
            if !self.both_strands && is_rev_comp {
                // recover the original strand when counting all k-mers
                seq.resize(l_seq, 0);
                let mut out = l_seq;
                for (i, &byte) in packed.iter().enumerate() {
                    out -= 1;
                    seq[out] = BAM_CODES_REV[(byte >> 4) as usize];
                    if 2 * i + 1 < l_seq {
                        out -= 1;
                        seq[out] = BAM_CODES_REV[(byte & 15) as usize];
                    }
                }
            } else {
                for (i, &byte) in packed.iter().enumerate() {
                    seq.push(BAM_CODES[(byte >> 4) as usize]);
                    if 2 * i + 1 < l_seq {
                        seq.push(BAM_CODES[(byte & 15) as usize]);
                    }
                }
            }
            return true;
        }
        false
    }
}

/// Receives finished super-k-mer runs; the statistics pass counts them,
/// the main pass packs them into bin collectors.
pub trait SuperKmerSink {
    fn flush_super_kmer(&mut self, signature: u32, seq: &[u8]) -> Result<()>;
}

pub struct Splitter {
    kmer_len: usize,
    norm: &'static MmerNorm,
}

impl Splitter {
    pub fn new(kmer_len: usize, norm: &'static MmerNorm) -> Splitter {
        Splitter { kmer_len, norm }
    }

    /// Walk one sequence, delimiting super-k-mers by minimiser signature.
    pub fn split_sequence(&self, seq: &[u8], sink: &mut impl SuperKmerSink) -> Result<()> {
        let k = self.kmer_len;
        let sl = self.norm.len();
        if seq.len() < k {
            return Ok(());
        }
        let mut current_signature = Mmer::new(self.norm);
        let mut end_mmer = Mmer::new(self.norm);

        let mut i: usize = 0;
        let mut len: usize = 0;
        let mut signature_start_pos: usize;

        'outer: while i + k - 1 < seq.len() {
            // build the first signature after an N or at the read beginning
            let mut contains_n = false;
            for _ in 0..sl {
                if seq[i] >= CODE_N {
                    contains_n = true;
                    break;
                }
                i += 1;
            }
            // the signature is shorter than the k-mer, so an N in it is an N
            // in the k-mer as well
            if contains_n {
                i += 1;
                len = 0;
                continue;
            }
            len = sl;
            signature_start_pos = i - sl;
            current_signature.insert_seq(&seq[signature_start_pos..]);
            end_mmer.set(&current_signature);

            while i < seq.len() {
                if seq[i] >= CODE_N {
                    if len >= k {
                        sink.flush_super_kmer(current_signature.get(), &seq[i - len..i])?;
                    }
                    len = 0;
                    i += 1;
                    continue 'outer;
                }
                end_mmer.insert(seq[i]);
                if end_mmer < current_signature {
                    // a smaller signature ends the current run
                    if len >= k {
                        sink.flush_super_kmer(current_signature.get(), &seq[i - len..i])?;
                        len = k - 1;
                    }
                    current_signature.set(&end_mmer);
                    signature_start_pos = i + 1 - sl;
                } else if end_mmer == current_signature {
                    current_signature.set(&end_mmer);
                    signature_start_pos = i + 1 - sl;
                } else if signature_start_pos + k - 1 < i {
                    // the signature window slid out, rescan the k-window
                    sink.flush_super_kmer(current_signature.get(), &seq[i - len..i])?;
                    len = k - 1;
                    signature_start_pos += 1;
                    end_mmer.insert_seq(&seq[signature_start_pos..]);
                    current_signature.set(&end_mmer);
                    for j in signature_start_pos + sl..=i {
                        end_mmer.insert(seq[j]);
                        if end_mmer <= current_signature {
                            current_signature.set(&end_mmer);
                            signature_start_pos = j + 1 - sl;
                        }
                    }
                }
                len += 1;
                if len == k + MAX_EXTRA_SYMBOLS {
                    // length byte is full, restart keeping a k-1 overlap
                    sink.flush_super_kmer(current_signature.get(), &seq[i + 1 - len..=i])?;
                    i -= k - 2;
                    len = 0;
                    continue 'outer;
                }
                i += 1;
            }
            break;
        }
        if len >= k {
            sink.flush_super_kmer(current_signature.get(), &seq[i - len..i])?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    struct Recorder {
        k: usize,
        runs: Vec<(u32, Vec<u8>)>,
    }

    impl SuperKmerSink for Recorder {
        fn flush_super_kmer(&mut self, signature: u32, seq: &[u8]) -> Result<()> {
            assert!(seq.len() >= self.k);
            self.runs.push((signature, seq.to_vec()));
            Ok(())
        }
    }

    fn codes(s: &str) -> Vec<u8> {
        s.bytes().map(|b| SEQ_NT4_TABLE[b as usize]).collect()
    }

    /// Count k-mers the slow way from the recorded super-k-mers.
    fn kmers_from_runs(runs: &[(u32, Vec<u8>)], k: usize) -> HashMap<Vec<u8>, u64> {
        let mut out: HashMap<Vec<u8>, u64> = HashMap::new();
        for (_, run) in runs {
            for w in run.windows(k) {
                *out.entry(w.to_vec()).or_default() += 1;
            }
        }
        out
    }

    /// Oracle: k-mers straight from the sequence, skipping N windows.
    fn kmers_direct(seq: &[u8], k: usize) -> HashMap<Vec<u8>, u64> {
        let mut out: HashMap<Vec<u8>, u64> = HashMap::new();
        for w in seq.windows(k) {
            if w.iter().all(|&c| c < CODE_N) {
                *out.entry(w.to_vec()).or_default() += 1;
            }
        }
        out
    }

    fn check(seq_str: &str, k: usize) {
        let seq = codes(seq_str);
        let splitter = Splitter::new(k, MmerNorm::get(5));
        let mut rec = Recorder { k, runs: Vec::new() };
        splitter.split_sequence(&seq, &mut rec).unwrap();
        assert_eq!(kmers_from_runs(&rec.runs, k), kmers_direct(&seq, k));
    }

    #[test]
    fn covers_every_kmer_exactly_once_test() {
        check("ACGTACGTACGTACGTACGT", 7);
        check("GGGGGGGGGGGGGGGGGGGG", 7);
        check("ATCGGCTAAGCTTAGGCTAGCTAGGCATCGGATCAGTTTCAG", 9);
    }

    #[test]
    fn n_symbols_reset_runs_test() {
        check("ACGTACNGTACGTACGTNNACGTACGTACGT", 7);
        check("NNNNNNNN", 6);
        check("ACGTNACGT", 6);
    }

    #[test]
    fn short_sequence_emits_nothing_test() {
        let splitter = Splitter::new(9, MmerNorm::get(5));
        let mut rec = Recorder { k: 9, runs: Vec::new() };
        splitter.split_sequence(&codes("ACGTACGT"), &mut rec).unwrap();
        assert!(rec.runs.is_empty());
    }

    #[test]
    fn long_run_respects_length_cap_test() {
        let long: String = std::iter::repeat("ACGT").take(300).collect();
        let seq = codes(&long);
        let k = 15;
        let splitter = Splitter::new(k, MmerNorm::get(5));
        let mut rec = Recorder { k, runs: Vec::new() };
        splitter.split_sequence(&seq, &mut rec).unwrap();
        for (_, run) in &rec.runs {
            assert!(run.len() <= k + MAX_EXTRA_SYMBOLS);
        }
        assert_eq!(kmers_from_runs(&rec.runs, k), kmers_direct(&seq, k));
    }

    #[test]
    fn fastq_tokenizer_test() {
        let part = b"@r1\nACGT\n+\n!!!!\n@r2\nGGNCC\n+r2\n#####\n";
        let mut tok = RecordTokenizer::new(SeqFormat::Fastq, part, true);
        let mut seq = Vec::new();
        assert!(tok.next_into(&mut seq));
        assert_eq!(seq, codes("ACGT"));
        assert!(tok.next_into(&mut seq));
        assert_eq!(seq, codes("GGNCC"));
        assert!(!tok.next_into(&mut seq));
    }

    #[test]
    fn fasta_tokenizer_multiline_record_test() {
        let part = b">r1\nACGT\nTTAA\n>r2\nGGGG\n";
        let mut tok = RecordTokenizer::new(SeqFormat::Fasta, part, true);
        let mut seq = Vec::new();
        assert!(tok.next_into(&mut seq));
        assert_eq!(seq, codes("ACGTTTAA"));
        assert!(tok.next_into(&mut seq));
        assert_eq!(seq, codes("GGGG"));
        assert!(!tok.next_into(&mut seq));
    }

    #[test]
    fn bam_tokenizer_test() {
        // two records: one plain, one flagged secondary (skipped)
        let mut part = Vec::new();
        for (flags, bases) in [(0u16, [1u8, 2, 4, 8]), (0x100, [1, 1, 1, 1])] {
            let mut rec = Vec::new();
            rec.extend_from_slice(&[0u8; 8]); // refID, pos
            rec.extend_from_slice(&(2u32).to_le_bytes()); // bin_mq_nl: l_read_name=2
            rec.extend_from_slice(&(((flags as u32) << 16) | 0).to_le_bytes());
            rec.extend_from_slice(&4i32.to_le_bytes()); // l_seq
            rec.extend_from_slice(&[0u8; 12]); // next_refID, next_pos, tlen
            rec.extend_from_slice(b"r\0"); // read name
            let b0 = (bases[0] << 4) | bases[1];
            let b1 = (bases[2] << 4) | bases[3];
            rec.push(b0);
            rec.push(b1);
            rec.extend_from_slice(&[0xFF; 4]); // qualities
            part.extend_from_slice(&(rec.len() as u32).to_le_bytes());
            part.extend_from_slice(&rec);
        }
        let mut tok = RecordTokenizer::new(SeqFormat::Bam, &part, true);
        let mut seq = Vec::new();
        assert!(tok.next_into(&mut seq));
        assert_eq!(seq, codes("ACGT"));
        assert!(!tok.next_into(&mut seq));
    }
}
