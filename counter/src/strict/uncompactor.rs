//! Sub-bin expansion: one chunk of super-k-mers into k+x-mer records.

use crate::expander;
use crate::shared::SharedSlice;
use crate::sorter::SorterParams;
use kmer::words::KmerWords;

/// Total k-mers and exact forward-mode record count in a chunk.
fn scan_chunk(chunk: &[u8], kmer_len: usize, max_x: u32) -> (usize, usize) {
    let mut n_kmers = 0usize;
    let mut n_fwd_recs = 0usize;
    let mut pos = 0usize;
    while pos < chunk.len() {
        let additional = chunk[pos] as usize;
        n_kmers += additional + 1;
        n_fwd_recs += 1 + additional / (max_x as usize + 1);
        pos += 1 + (kmer_len + additional + 3) / 4;
    }
    (n_kmers, n_fwd_recs)
}

pub fn expand_sub_bin<const W: usize>(chunk: &[u8], params: &SorterParams) -> Vec<KmerWords<W>> {
    let (n_kmers, n_fwd_recs) = scan_chunk(chunk, params.kmer_len, params.max_x.max(1));
    match (params.max_x > 0, params.both_strands) {
        (true, true) => {
            // k-mer count bounds the record count; ties leave slack
            let mut out = vec![KmerWords::<W>::zero(); n_kmers];
            let fakes = expander::expand_kxmers_both_range(
                chunk,
                0,
                chunk.len(),
                params.kmer_len,
                params.max_x,
                SharedSlice::new(&mut out),
                0,
                n_kmers,
            );
            out.truncate(n_kmers - fakes);
            out
        }
        (true, false) => {
            let mut out = vec![KmerWords::<W>::zero(); n_fwd_recs];
            let n = expander::expand_kxmers_all(chunk, params.kmer_len, params.max_x, &mut out);
            out.truncate(n);
            out
        }
        (false, true) => {
            let mut out = vec![KmerWords::<W>::zero(); n_kmers];
            let n = expander::expand_kmers_both(chunk, params.kmer_len, &mut out);
            out.truncate(n);
            out
        }
        (false, false) => {
            let mut out = vec![KmerWords::<W>::zero(); n_kmers];
            let n = expander::expand_kmers_all(chunk, params.kmer_len, &mut out);
            out.truncate(n);
            out
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scan_chunk_test() {
        // two super-k-mers of k = 8 with 0 and 5 extra symbols
        let mut chunk = vec![0u8, 0xAA, 0xBB];
        chunk.extend_from_slice(&[5, 0xAA, 0xBB, 0xCC, 0x40]);
        let (n_kmers, n_recs) = scan_chunk(&chunk, 8, 3);
        assert_eq!(n_kmers, 1 + 6);
        assert_eq!(n_recs, 1 + (1 + 5 / 4));
    }
}
