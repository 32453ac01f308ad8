//! The pipeline controller.
//!
//! Wires the stages together: the statistics pass, the partitioning stage
//! (readers, tokenizers, splitters, storer), the sorting stage (bin reader,
//! sorters, completer phase 1), the optional strict-memory stage and the
//! completer's final phase. Stage thread groups run as scoped OS threads;
//! the parallel kernels inside a stage use rayon. A failing worker sets the
//! cancel flag and every queue drains.

use crate::bins::BinTable;
use crate::cancel::Cancel;
use crate::collector::{BinSink, KmerBinCollector};
use crate::completer::Completer;
use crate::error::{CounterError, Result};
use crate::input::{reader_loop, tokenizer_loop, PartSink};
use crate::kxmer_set::MergeStats;
use crate::mapper::SignatureMapper;
use crate::output::choose_lut_prefix_len;
use crate::params::{Params, Resolved, STATS_INPUT_SIZE};
use crate::pools::BlockPool;
use crate::progress::Progress;
use crate::queues::{
    BigBinKmerPartQueue, BinPartQueue, BinaryPackQueue, InputFilesQueue, KmerQueue, PartQueue,
    Queue, StatsPartQueue, TooLargeBinsQueue,
};
use crate::small_k::{complete_small_k, SmallKSplitter};
use crate::sorter::{sorter_loop, SorterParams};
use crate::sorters::SortersManager;
use crate::splitter::{RecordTokenizer, Splitter};
use crate::stats::{merge_stats, StatsSplitter};
use crate::storer::storer_loop;
use crate::strict::{process_too_large_bins, StrictParams};
use kmer::dispatch_kmer_width;
use kmer::mmer::MmerNorm;
use ktio::seq::{Compression, SeqFormat};
use std::sync::{Arc, Mutex};

/// Final run statistics, the library's answer to a counting request.
#[derive(Debug, Clone, Copy, Default)]
pub struct CountsSummary {
    pub n_reads: u64,
    pub n_unique: u64,
    pub n_below_min: u64,
    pub n_above_max: u64,
    pub n_total_kmers: u64,
}

impl CountsSummary {
    fn from_stats(n_reads: u64, stats: &MergeStats) -> CountsSummary {
        CountsSummary {
            n_reads,
            n_unique: stats.n_unique,
            n_below_min: stats.n_cutoff_min,
            n_above_max: stats.n_cutoff_max,
            n_total_kmers: stats.n_total,
        }
    }
}

/// Count the k-mers of every input file into the output database.
pub fn count(params: &Params) -> Result<CountsSummary> {
    let resolved = params.resolve()?;
    ktio::fops::create_directory(&params.working_dir)
        .map_err(|e| CounterError::temp(params.working_dir.display(), e))?;

    if params.file_format == SeqFormat::Bam {
        for path in &params.input_paths {
            let ok = ktio::bgzf::has_bam_eof_marker(std::path::Path::new(path))
                .map_err(|e| CounterError::Input(ktio::SeqError::io(path, e)))?;
            if !ok {
                return Err(CounterError::Input(ktio::SeqError::BamEof(path.clone())));
            }
        }
    }

    let summary = if resolved.small_k {
        run_small_k(params, &resolved)?
    } else {
        dispatch_kmer_width!(resolved.kmer_words, run_general, params, &resolved)?
    };

    if params.kff_output {
        let kff_path = params.output_base.with_extension("kff");
        crate::kff::write_kff(&params.output_base, &kff_path, params.counter_max)?;
    }
    if let Some(json_path) = &params.json_summary {
        write_json_summary(json_path, &summary)?;
    }
    Ok(summary)
}

fn write_json_summary(path: &std::path::Path, summary: &CountsSummary) -> Result<()> {
    let text = format!(
        "{{\n  \"n_reads\": {},\n  \"n_unique\": {},\n  \"n_below_min\": {},\n  \"n_above_max\": {},\n  \"n_total_kmers\": {}\n}}\n",
        summary.n_reads,
        summary.n_unique,
        summary.n_below_min,
        summary.n_above_max,
        summary.n_total_kmers
    );
    std::fs::write(path, text).map_err(|e| CounterError::output(path.display(), e))
}

fn predicted_input_size(params: &Params) -> u64 {
    params
        .input_paths
        .iter()
        .map(|p| {
            let size = std::fs::metadata(p).map(|m| m.len()).unwrap_or(0);
            match Compression::get(p) {
                Compression::Plain => size,
                _ => size * 4,
            }
        })
        .sum()
}

struct WorkerErrors {
    first: Mutex<Option<CounterError>>,
    cancel: Arc<Cancel>,
}

impl WorkerErrors {
    fn new(cancel: Arc<Cancel>) -> WorkerErrors {
        WorkerErrors {
            first: Mutex::new(None),
            cancel,
        }
    }

    fn check<T>(&self, result: Result<T>) -> Option<T> {
        match result {
            Ok(v) => Some(v),
            Err(e) => {
                self.first.lock().unwrap().get_or_insert(e);
                self.cancel.set();
                None
            }
        }
    }

    fn into_result(self) -> Result<()> {
        match self.first.into_inner().unwrap() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

/// First pass: sample the input and histogram signatures.
fn run_stats_pass(params: &Params, resolved: &Resolved, norm: &'static MmerNorm) -> Result<Vec<u64>> {
    let budget = STATS_INPUT_SIZE.max(predicted_input_size(params) / 100);
    let files = InputFilesQueue::new(params.input_paths.clone());
    let pool = BlockPool::new(resolved.input_pack_blocks, resolved.input_part_size);
    let pack_queues: Vec<BinaryPackQueue> = (0..resolved.n_readers)
        .map(|_| Queue::bounded(4, 1))
        .collect();
    let parts = StatsPartQueue::new(2 * resolved.n_splitters + 4, resolved.n_readers, budget);
    let cancel = Arc::new(Cancel::new());
    let errors = WorkerErrors::new(Arc::clone(&cancel));
    let stats = Mutex::new(vec![0u64; norm.map_size()]);

    std::thread::scope(|scope| {
        let files = &files;
        let pool = &pool;
        let cancel = &cancel;
        let errors = &errors;
        let parts = &parts;
        let stats = &stats;
        for pack_queue in &pack_queues {
            scope.spawn(move || {
                let r = reader_loop(files, pack_queue, pool, cancel);
                pack_queue.mark_completed();
                errors.check(r);
            });
            scope.spawn(move || {
                let r = tokenizer_loop(
                    pack_queue,
                    PartSink::Stats(parts),
                    params.file_format,
                    params.kmer_len,
                    resolved.input_part_size,
                    cancel,
                );
                parts.mark_completed();
                if r.is_err() {
                    files.ignore_rest();
                    pack_queue.ignore_rest();
                }
                errors.check(r);
            });
        }
        for _ in 0..resolved.n_splitters {
            scope.spawn(move || {
                let mut splitter = StatsSplitter::new(
                    params.kmer_len,
                    norm,
                    params.file_format,
                    params.both_strands,
                );
                let mut seq = Vec::new();
                while let Some(part) = parts.pop() {
                    if errors.check(splitter.process_part(&part.data, &mut seq)).is_none() {
                        parts.ignore_rest();
                        break;
                    }
                }
                merge_stats(&mut stats.lock().unwrap(), &splitter.stats);
            });
        }
    });
    errors.into_result()?;
    Ok(stats.into_inner().unwrap())
}

/// Shared stage-1 scaffolding: readers and tokenizers feeding a part queue,
/// with `splitter_fn` run once per splitter slot.
fn run_partitioning<F>(params: &Params, resolved: &Resolved, splitter_fn: F) -> Result<u64>
where
    F: Fn(&PartQueue) -> Result<u64> + Sync,
{
    let files = InputFilesQueue::new(params.input_paths.clone());
    let pool = BlockPool::new(resolved.input_pack_blocks, resolved.input_part_size);
    let pack_queues: Vec<BinaryPackQueue> = (0..resolved.n_readers)
        .map(|_| Queue::bounded(4, 1))
        .collect();
    let parts: PartQueue = Queue::bounded(2 * resolved.n_splitters + 4, resolved.n_readers);
    let cancel = Arc::new(Cancel::new());
    let errors = WorkerErrors::new(Arc::clone(&cancel));
    let n_reads = Mutex::new(0u64);

    std::thread::scope(|scope| {
        let files = &files;
        let pool = &pool;
        let cancel = &cancel;
        let errors = &errors;
        let parts = &parts;
        let n_reads = &n_reads;
        let splitter_fn = &splitter_fn;
        for pack_queue in &pack_queues {
            scope.spawn(move || {
                let r = reader_loop(files, pack_queue, pool, cancel);
                pack_queue.mark_completed();
                errors.check(r);
            });
            scope.spawn(move || {
                let r = tokenizer_loop(
                    pack_queue,
                    PartSink::Main(parts),
                    params.file_format,
                    params.kmer_len,
                    resolved.input_part_size,
                    cancel,
                );
                parts.mark_completed();
                if r.is_err() {
                    files.ignore_rest();
                    pack_queue.ignore_rest();
                    parts.ignore_rest();
                }
                errors.check(r);
            });
        }
        for _ in 0..resolved.n_splitters {
            scope.spawn(move || {
                if let Some(reads) = errors.check(splitter_fn(parts)) {
                    *n_reads.lock().unwrap() += reads;
                } else {
                    parts.ignore_rest();
                }
            });
        }
    });
    errors.into_result()?;
    Ok(n_reads.into_inner().unwrap())
}

fn run_small_k(params: &Params, resolved: &Resolved) -> Result<CountsSummary> {
    // counter width follows the cutoff range
    if resolved.small_k_counter_bytes == 4 {
        run_small_k_typed::<u32>(params, resolved)
    } else {
        run_small_k_typed::<u64>(params, resolved)
    }
}

fn run_small_k_typed<C: crate::small_k::SmallCounter>(
    params: &Params,
    resolved: &Resolved,
) -> Result<CountsSummary> {
    let merged: Mutex<Option<SmallKSplitter<C>>> = Mutex::new(None);
    let n_reads = run_partitioning(params, resolved, |parts| {
        let mut splitter: SmallKSplitter<C> =
            SmallKSplitter::new(params.kmer_len, params.both_strands, params.file_format);
        let mut seq = Vec::new();
        while let Some(part) = parts.pop() {
            splitter.process_part(&part.data, &mut seq)?;
        }
        let reads = splitter.n_reads;
        let mut merged = merged.lock().unwrap();
        match merged.as_mut() {
            Some(target) => target.absorb(&splitter),
            None => *merged = Some(splitter),
        }
        Ok(reads)
    })?;

    let merged = merged.into_inner().unwrap().unwrap_or_else(|| {
        SmallKSplitter::new(params.kmer_len, params.both_strands, params.file_format)
    });
    let stats = complete_small_k(
        &merged.counts,
        params.kmer_len,
        params.signature_len,
        params.cutoff_min,
        params.cutoff_max,
        params.counter_max,
        resolved.counter_bytes,
        params.both_strands,
        &params.output_base,
    )?;
    Ok(CountsSummary::from_stats(n_reads, &stats))
}

fn run_general<const W: usize>(params: &Params, resolved: &Resolved) -> Result<CountsSummary> {
    let norm = MmerNorm::get(params.signature_len);
    let progress = if params.verbose {
        Progress::spinner("Counting")
    } else {
        Progress::hidden()
    };

    // ***** Stage 0: signature statistics and the bin map *****
    let stats = run_stats_pass(params, resolved, norm)?;
    let mapper = SignatureMapper::new(norm, params.n_bins as u32, &stats);

    // ***** Stage 1: partitioning *****
    let table = Arc::new(BinTable::new(
        params.n_bins as u32,
        &params.working_dir,
        params.mem_mode,
        params.keep_intermediates,
    ));
    let bin_pool = Arc::new(BlockPool::new(resolved.bin_pool_blocks, resolved.bin_part_size));
    let bin_parts: Arc<BinPartQueue> =
        Arc::new(Queue::bounded(params.n_bins + 16, resolved.n_splitters));

    let n_reads = {
        let table = Arc::clone(&table);
        let storer_table = Arc::clone(&table);
        let storer_queue = Arc::clone(&bin_parts);
        let storer_progress = &progress;
        let storer_error: Mutex<Option<CounterError>> = Mutex::new(None);

        let n_reads = std::thread::scope(|scope| -> Result<u64> {
            let storer = scope.spawn(|| {
                if let Err(e) = storer_loop(&storer_queue, &storer_table, storer_progress) {
                    storer_queue.ignore_rest();
                    *storer_error.lock().unwrap() = Some(e);
                }
            });
            let n_reads = run_partitioning(params, resolved, |parts| {
                let splitter = Splitter::new(params.kmer_len, norm);
                let mut collectors: Vec<KmerBinCollector> = (0..params.n_bins as u32)
                    .map(|bin_id| {
                        KmerBinCollector::new(
                            bin_id,
                            params.kmer_len,
                            resolved.max_x,
                            params.both_strands,
                            Arc::clone(&bin_pool),
                            Arc::clone(&bin_parts),
                            Arc::clone(&table),
                        )
                    })
                    .collect();
                let mut n_reads = 0u64;
                let mut seq = Vec::new();
                while let Some(part) = parts.pop() {
                    let mut tokenizer =
                        RecordTokenizer::new(params.file_format, &part.data, params.both_strands);
                    while tokenizer.next_into(&mut seq) {
                        if params.file_format != SeqFormat::MultiFasta {
                            n_reads += 1;
                        }
                        let mut sink = BinSink {
                            mapper: &mapper,
                            collectors: &mut collectors,
                        };
                        splitter.split_sequence(&seq, &mut sink)?;
                    }
                }
                for collector in collectors.iter_mut() {
                    collector.flush()?;
                }
                Ok(n_reads)
            });
            // all splitters flushed and marked completed inside
            for _ in 0..resolved.n_splitters {
                bin_parts.mark_completed();
            }
            storer.join().expect("storer thread");
            n_reads
        })?;
        if let Some(e) = storer_error.into_inner().unwrap() {
            return Err(e);
        }
        n_reads
    };

    // ***** Stage 2: sorting and completion *****
    let lut_prefix_len = choose_lut_prefix_len(n_reads.max(1), params.n_bins, params.kmer_len);
    let sorter_params = SorterParams {
        kmer_len: params.kmer_len,
        max_x: resolved.max_x,
        both_strands: params.both_strands,
        cutoff_min: params.cutoff_min,
        cutoff_max: params.cutoff_max,
        counter_max: params.counter_max,
        lut_prefix_len,
        counter_size: resolved.counter_bytes,
    };

    let sorted_bins = table.sorted_req_sizes(
        resolved.max_x,
        W * 8,
        params.cutoff_min,
        params.cutoff_max,
        params.counter_max,
        lut_prefix_len,
        params.kmer_len,
    );
    let stage2_need: u64 = sorted_bins.iter().map(|b| b.1.required).sum::<u64>().max(16 << 20);
    let arena_total = (resolved.max_mem_stage2 as u64).min(stage2_need) as usize;
    let arena = crate::arena::SortArena::new(arena_total, params.strict_memory);
    let manager = SortersManager::new(resolved.n_sorters, arena_total as u64);
    let n_sorter_threads = resolved.n_sorters.min(sorted_bins.len().max(1));
    let kmer_queue = KmerQueue::new(n_sorter_threads + 1);
    let too_large = TooLargeBinsQueue::new();
    let mut completer = Completer::new(&params.output_base, &mapper)?;

    let progress2 = if params.verbose {
        Progress::percent("Stage 2", table.n_rec_sum())
    } else {
        Progress::hidden()
    };
    let cancel = Arc::new(Cancel::new());
    let errors = WorkerErrors::new(Arc::clone(&cancel));
    let completer_ref = &mut completer;
    let errors_ref = &errors;
    let kmer_queue_ref = &kmer_queue;
    let n_bins = params.n_bins as u32;

    std::thread::scope(|scope| {
        scope.spawn(|| {
            let r = crate::bin_reader::bin_reader_loop(
                &sorted_bins,
                &table,
                &arena,
                &manager,
                &kmer_queue,
                &too_large,
                &progress2,
            );
            if r.is_err() {
                // unblock any sorter waiting for more bins
                manager.notify_queue_completed();
            }
            kmer_queue.mark_completed();
            errors.check(r);
        });
        for _ in 0..n_sorter_threads {
            scope.spawn(|| {
                let r = sorter_loop::<W>(&sorter_params, &manager, &table, &arena, &kmer_queue);
                kmer_queue.mark_completed();
                errors.check(r);
            });
        }
        scope.spawn(move || {
            let r = completer_ref.first_stage(kmer_queue_ref, n_bins);
            errors_ref.check(r);
        });
    });
    errors.into_result()?;

    // ***** Strict-memory stage for diverted bins *****
    if params.strict_memory && !too_large.is_empty() {
        let strict_params = StrictParams {
            sorter: sorter_params,
            sub_bin_part_size: resolved.sm_sub_bin_part_size,
            n_uncompactors: resolved.sm_uncompactor_threads,
            n_sorting_threads: resolved.sm_sorting_threads,
            n_mergers: resolved.sm_merger_threads,
        };
        let out_queue: BigBinKmerPartQueue =
            Queue::bounded(4, strict_params.n_mergers.max(1));
        let cancel = Arc::new(Cancel::new());
        let errors = WorkerErrors::new(Arc::clone(&cancel));
        let completer_ref = &mut completer;
        let errors_ref = &errors;
        let out_queue_ref = &out_queue;

        std::thread::scope(|scope| {
            for _ in 0..strict_params.n_mergers.max(1) {
                scope.spawn(|| {
                    let r = process_too_large_bins::<W>(
                        &strict_params,
                        &too_large,
                        &table,
                        &out_queue,
                        &params.working_dir,
                        &progress,
                        &cancel,
                    );
                    out_queue.mark_completed();
                    errors.check(r);
                });
            }
            scope.spawn(move || {
                let r = completer_ref.second_stage(out_queue_ref);
                errors_ref.check(r);
            });
        });
        errors.into_result()?;
    }

    let final_stats = completer.finish(
        params.kmer_len,
        resolved.counter_bytes,
        lut_prefix_len,
        params.signature_len,
        params.cutoff_min,
        params.cutoff_max,
        params.both_strands,
    )?;
    progress.finish();
    progress2.finish();
    Ok(CountsSummary::from_stats(n_reads, &final_stats))
}
