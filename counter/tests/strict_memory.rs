//! The strict-memory sub-bin pipeline, driven end to end over a real bin.

use counter::bins::BinTable;
use counter::cancel::Cancel;
use counter::collector::KmerBinCollector;
use counter::pools::BlockPool;
use counter::progress::Progress;
use counter::queues::{BigBinKmerPartQueue, Queue, TooLargeBinsQueue};
use counter::sorter::SorterParams;
use counter::storer::storer_loop;
use counter::strict::{process_too_large_bins, StrictParams};
use kmer::SEQ_NT4_TABLE;
use std::collections::HashMap;
use std::sync::Arc;

fn codes(s: &str) -> Vec<u8> {
    s.bytes().map(|b| SEQ_NT4_TABLE[b as usize]).collect()
}

#[test]
fn oversized_bin_reprocessed_in_sub_bins_test() {
    let dir = std::env::temp_dir().join("diskmer_strict_e2e");
    ktio::fops::create_directory(&dir).unwrap();

    let params = SorterParams {
        kmer_len: 15,
        max_x: 3,
        both_strands: false,
        cutoff_min: 2,
        cutoff_max: 1_000_000,
        counter_max: 255,
        lut_prefix_len: 3,
        counter_size: 1,
    };

    // build one bin the stage-1 way: collector -> storer -> temp bin
    let table = Arc::new(BinTable::new(1, &dir, false, false));
    let pool = Arc::new(BlockPool::new(4, 1 << 12));
    let queue = Arc::new(Queue::unbounded(1));
    let mut collector = KmerBinCollector::new(
        0,
        params.kmer_len,
        params.max_x,
        params.both_strands,
        pool,
        Arc::clone(&queue),
        Arc::clone(&table),
    );
    let seqs = [
        "ATCGGCTAAGCTTAGGCTAGCTAGGCATCGG",
        "ATCGGCTAAGCTTAGGCTAGCTAGGCATCGG",
        "GGCATGCAAGTCCAATCGGGCATAAGCATTA",
        "ACGTACGTACGTACGTACGTACGT",
    ];
    let mut oracle: HashMap<u64, u64> = HashMap::new();
    for seq in &seqs {
        let c = codes(seq);
        collector.put_extended_kmer(&c).unwrap();
        for w in c.windows(params.kmer_len) {
            let mut v = 0u64;
            for &s in w {
                v = (v << 2) | s as u64;
            }
            *oracle.entry(v).or_default() += 1;
        }
    }
    collector.flush().unwrap();
    queue.mark_completed();
    storer_loop(&queue, &table, &Progress::hidden()).unwrap();

    // divert it through the strict pipeline, forcing several tiny sub-bins
    let strict = StrictParams {
        sorter: params,
        sub_bin_part_size: 24,
        n_uncompactors: 2,
        n_sorting_threads: 1,
        n_mergers: 1,
    };
    let too_large = TooLargeBinsQueue::new();
    too_large.insert(0);
    let out_queue: BigBinKmerPartQueue = Queue::unbounded(1);
    process_too_large_bins::<1>(
        &strict,
        &too_large,
        &table,
        &out_queue,
        &dir,
        &Progress::hidden(),
        &Cancel::new(),
    )
    .unwrap();
    out_queue.mark_completed();
    let part = out_queue.pop().unwrap();

    // decode the merged pack back into (k-mer, count)
    let suffix_symbols = params.kmer_len - params.lut_prefix_len;
    let suffix_bytes = suffix_symbols / 4;
    let rec_len = suffix_bytes + params.counter_size;
    let mut got: HashMap<u64, u64> = HashMap::new();
    let mut offset = 0usize;
    for (prefix, &n) in part.lut.iter().enumerate() {
        for _ in 0..n {
            let rec = &part.suffix[offset..offset + rec_len];
            // suffix bytes sit big-endian below the prefix bases
            let mut suffix_val = 0u64;
            for &b in &rec[..suffix_bytes] {
                suffix_val = (suffix_val << 8) | b as u64;
            }
            let kmer = ((prefix as u64) << (2 * suffix_symbols)) | suffix_val;
            got.insert(kmer, rec[suffix_bytes] as u64);
            offset += rec_len;
        }
    }

    let expect: HashMap<u64, u64> = oracle
        .into_iter()
        .filter(|(_, c)| *c >= params.cutoff_min as u64)
        .collect();
    assert_eq!(got, expect);
    assert_eq!(part.n_cutoff_min as usize, {
        // everything unique to one read occurs once and falls below min
        part.n_unique as usize - expect.len()
    });
}
