//! Strict-memory sub-pipeline for bins that do not fit the arena.
//!
//! An oversized bin streams through a second, fixed-budget pipeline: the
//! reader cuts the bin file into super-k-mer-aligned sub-bin chunks, the
//! uncompactor expands each chunk into k+x-mer records, the sorter sorts and
//! compacts each chunk into its own (suffix, u32 count) temp file with a
//! per-sub-bin LUT, and the merger k-way merges a bin's sub-bin files into
//! the final output pack, where cutoffs and saturation finally apply.

mod merger;
mod sorter;
mod uncompactor;

pub use merger::merge_sub_bins;
pub use sorter::{sort_sub_bin, SubBinDesc};
pub use uncompactor::expand_sub_bin;

use crate::bins::BinTable;
use crate::cancel::Cancel;
use crate::error::{CounterError, Result};
use crate::progress::Progress;
use crate::queues::{BigBinKmerPartQueue, Queue, TooLargeBinsQueue};
use crate::sorter::SorterParams;
use std::io::Read;
use std::path::Path;
use std::sync::Mutex;

/// The smallest number of sub-bins an oversized bin is cut into; beyond
/// that the chunk budget decides.
const MIN_SUB_BINS: u64 = 3;

pub struct StrictParams {
    pub sorter: SorterParams,
    pub sub_bin_part_size: usize,
    pub n_uncompactors: usize,
    pub n_sorting_threads: usize,
    pub n_mergers: usize,
}

/// Cut the bin byte stream after the last whole super-k-mer within the
/// budget. Returns the chunk, or `None` at end of stream.
fn next_sub_bin_chunk(
    reader: &mut impl Read,
    carry: &mut Vec<u8>,
    kmer_len: usize,
    budget: usize,
) -> std::io::Result<Option<Vec<u8>>> {
    let mut chunk = std::mem::take(carry);
    let mut target = budget.max(2 + kmer_len / 4);
    let mut eof = false;
    loop {
        while chunk.len() < target && !eof {
            let old = chunk.len();
            chunk.resize(target, 0);
            let n = reader.read(&mut chunk[old..])?;
            chunk.truncate(old + n);
            if n == 0 {
                eof = true;
            }
        }
        if chunk.is_empty() {
            return Ok(None);
        }
        // find the last whole record: records parse forward from the start
        let mut pos = 0usize;
        while pos < chunk.len() {
            let additional = chunk[pos] as usize;
            let rec_bytes = 1 + (kmer_len + additional + 3) / 4;
            if pos + rec_bytes > chunk.len() {
                break;
            }
            pos += rec_bytes;
        }
        if pos > 0 || eof {
            *carry = chunk.split_off(pos);
            if chunk.is_empty() {
                return Ok(None);
            }
            return Ok(Some(chunk));
        }
        // a record longer than the budget, keep reading
        target *= 2;
    }
}

/// Process every diverted bin; completer phase 2 consumes the results.
pub fn process_too_large_bins<const W: usize>(
    params: &StrictParams,
    too_large: &TooLargeBinsQueue,
    table: &BinTable,
    out_queue: &BigBinKmerPartQueue,
    working_dir: &Path,
    progress: &Progress,
    cancel: &Cancel,
) -> Result<()> {
    let n_workers = params.n_uncompactors.max(1);
    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(n_workers + 1)
        .build()
        .map_err(|e| CounterError::Internal(format!("thread pool: {}", e)))?;

    while let Some(bin_id) = too_large.pop() {
        if cancel.is_set() {
            break;
        }
        progress.tick(format!("Strict-memory pass: bin {}", bin_id));
        let stats = table.stats(bin_id);
        let mut stream = table.open_stream(bin_id)?;

        let budget = (stats.size / MIN_SUB_BINS)
            .min(params.sub_bin_part_size as u64)
            .max(1) as usize;

        let chunk_queue: Queue<(u32, Vec<u8>)> = Queue::bounded(n_workers + 1, 1);
        let descs: Mutex<Vec<SubBinDesc>> = Mutex::new(Vec::new());
        let first_error: Mutex<Option<CounterError>> = Mutex::new(None);
        let report = |e: CounterError| {
            first_error.lock().unwrap().get_or_insert(e);
            cancel.set();
            chunk_queue.ignore_rest();
        };

        pool.scope(|scope| {
            // reader
            scope.spawn(|_| {
                let mut carry = Vec::new();
                let mut sub_bin_id = 0u32;
                loop {
                    match next_sub_bin_chunk(
                        &mut stream,
                        &mut carry,
                        params.sorter.kmer_len,
                        budget,
                    ) {
                        Ok(Some(chunk)) => {
                            if !chunk_queue.push((sub_bin_id, chunk)) {
                                break;
                            }
                            sub_bin_id += 1;
                        }
                        Ok(None) => break,
                        Err(e) => {
                            report(CounterError::temp(format!("bin {}", bin_id), e));
                            break;
                        }
                    }
                }
                chunk_queue.mark_completed();
            });
            // uncompactor + sorter workers
            for _ in 0..n_workers {
                scope.spawn(|_| {
                    while let Some((sub_bin_id, chunk)) = chunk_queue.pop() {
                        let result = (|| -> Result<SubBinDesc> {
                            let records = expand_sub_bin::<W>(&chunk, &params.sorter);
                            sort_sub_bin::<W>(
                                records,
                                bin_id,
                                sub_bin_id,
                                &params.sorter,
                                params.n_sorting_threads,
                                working_dir,
                            )
                        })();
                        match result {
                            Ok(desc) => descs.lock().unwrap().push(desc),
                            Err(e) => report(e),
                        }
                    }
                });
            }
        });
        if let Some(e) = first_error.into_inner().unwrap() {
            return Err(e);
        }

        let mut descs = descs.into_inner().unwrap();
        descs.sort_by_key(|d| d.sub_bin_id);
        let part = merge_sub_bins::<W>(bin_id, &descs, &params.sorter)?;
        out_queue.push(part);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sub_bin_chunking_respects_record_boundaries_test() {
        // records: length byte 0 with k = 8 -> 1 + 2 bytes each
        let mut data = Vec::new();
        for i in 0..10u8 {
            data.extend_from_slice(&[0, i, i]);
        }
        let mut rd: &[u8] = &data;
        let mut carry = Vec::new();
        let mut total = 0;
        while let Some(chunk) = next_sub_bin_chunk(&mut rd, &mut carry, 8, 7).unwrap() {
            assert_eq!(chunk.len() % 3, 0);
            total += chunk.len();
        }
        assert_eq!(total, data.len());
    }
}
