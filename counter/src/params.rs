use crate::error::{CounterError, Result};
use kmer::words::words_for_k;
use ktio::seq::SeqFormat;
use std::path::PathBuf;

pub const MIN_K: usize = 1;
pub const MAX_K: usize = 256;
pub const MIN_N_BINS: usize = 64;
pub const MAX_N_BINS: usize = 2000;
pub const MIN_SIGNATURE_LEN: usize = 5;
pub const MAX_SIGNATURE_LEN: usize = 11;

/// Largest k handled by the direct-table fast path.
pub const SMALL_K_LIMIT: usize = 13;

/// Extension bases carried by k+x-mer records.
pub const KMER_X: u32 = 3;

/// Lower bound for the byte budget of the signature-statistics pass.
pub const STATS_INPUT_SIZE: u64 = 1 << 28;

/// One super-k-mer may carry at most this many symbols past k.
pub const MAX_EXTRA_SYMBOLS: usize = 254;

/// User-facing parameters, the CLI's view of a counting run.
#[derive(Debug, Clone)]
pub struct Params {
    pub input_paths: Vec<String>,
    pub output_base: PathBuf,
    pub working_dir: PathBuf,
    pub kmer_len: usize,
    pub signature_len: usize,
    pub max_mem_gb: u64,
    pub cutoff_min: u32,
    pub cutoff_max: u64,
    pub counter_max: u64,
    /// count canonical representations (min of k-mer and its revcomp)
    pub both_strands: bool,
    pub file_format: SeqFormat,
    pub n_bins: usize,
    pub n_threads: usize,
    pub n_readers: usize,
    pub n_splitters: usize,
    pub n_sorters: usize,
    pub strict_memory: bool,
    /// keep temporary bins in RAM instead of the working directory
    pub mem_mode: bool,
    pub sm_sorting_threads: usize,
    pub sm_uncompactor_threads: usize,
    pub sm_merger_threads: usize,
    pub keep_intermediates: bool,
    pub kff_output: bool,
    pub json_summary: Option<PathBuf>,
    pub verbose: bool,
}

impl Default for Params {
    fn default() -> Self {
        Params {
            input_paths: Vec::new(),
            output_base: PathBuf::new(),
            working_dir: std::env::temp_dir(),
            kmer_len: 25,
            signature_len: 9,
            max_mem_gb: 12,
            cutoff_min: 2,
            cutoff_max: 1_000_000_000,
            counter_max: 255,
            both_strands: true,
            file_format: SeqFormat::Fastq,
            n_bins: 512,
            n_threads: 0,
            n_readers: 0,
            n_splitters: 0,
            n_sorters: 0,
            strict_memory: false,
            mem_mode: false,
            sm_sorting_threads: 0,
            sm_uncompactor_threads: 0,
            sm_merger_threads: 0,
            keep_intermediates: false,
            kff_output: false,
            json_summary: None,
            verbose: false,
        }
    }
}

/// Budgets and thread counts derived from [`Params`], fixed for a whole run.
#[derive(Debug, Clone)]
pub struct Resolved {
    pub kmer_words: usize,
    pub max_x: u32,
    pub n_threads: usize,
    pub n_readers: usize,
    pub n_splitters: usize,
    pub n_sorters: usize,
    pub sm_sorting_threads: usize,
    pub sm_uncompactor_threads: usize,
    pub sm_merger_threads: usize,
    pub bin_part_size: usize,
    pub input_part_size: usize,
    pub input_pack_blocks: usize,
    pub bin_pool_blocks: usize,
    pub max_mem_stage2: usize,
    pub small_k: bool,
    pub small_k_counter_bytes: usize,
    pub counter_bytes: usize,
    /// strict-memory sub-pool carving, bytes
    pub sm_sub_bin_part_size: usize,
}

fn byte_log(x: u64) -> usize {
    if x < 1 << 8 {
        1
    } else if x < 1 << 16 {
        2
    } else if x < 1 << 24 {
        3
    } else {
        4
    }
}

pub fn counter_size_bytes(cutoff_max: u64, counter_max: u64) -> usize {
    byte_log(cutoff_max).min(byte_log(counter_max))
}

impl Params {
    pub fn validate(&self) -> Result<()> {
        let err = |msg: String| Err(CounterError::Config(msg));
        if self.input_paths.is_empty() {
            return err("no input files".into());
        }
        if !(MIN_K..=MAX_K).contains(&self.kmer_len) {
            return err(format!("k must be in {}..={}", MIN_K, MAX_K));
        }
        if !(MIN_SIGNATURE_LEN..=MAX_SIGNATURE_LEN).contains(&self.signature_len) {
            return err(format!(
                "signature length must be in {}..={}",
                MIN_SIGNATURE_LEN, MAX_SIGNATURE_LEN
            ));
        }
        if self.signature_len >= self.kmer_len && self.kmer_len > SMALL_K_LIMIT {
            return err("signature length must be smaller than k".into());
        }
        if !(MIN_N_BINS..=MAX_N_BINS).contains(&self.n_bins) {
            return err(format!("bins must be in {}..={}", MIN_N_BINS, MAX_N_BINS));
        }
        if self.max_mem_gb == 0 {
            return err("memory budget must be at least 1 GB".into());
        }
        if self.cutoff_min == 0 || self.cutoff_max == 0 || self.counter_max == 0 {
            return err("cutoffs and counter maximum must be positive".into());
        }
        if self.cutoff_min as u64 > self.cutoff_max {
            return err("cutoff-min above cutoff-max".into());
        }
        Ok(())
    }

    pub fn resolve(&self) -> Result<Resolved> {
        self.validate()?;

        let n_threads = if self.n_threads > 0 {
            self.n_threads
        } else {
            std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1)
        };

        let any_compressed = self
            .input_paths
            .iter()
            .any(|p| !matches!(ktio::seq::Compression::get(p), ktio::seq::Compression::Plain));
        let n_readers = if self.n_readers > 0 {
            self.n_readers
        } else if any_compressed || self.file_format == SeqFormat::Bam {
            (n_threads / 4).clamp(1, self.input_paths.len().max(1))
        } else {
            1
        };
        let n_splitters = if self.n_splitters > 0 {
            self.n_splitters
        } else {
            (n_threads.saturating_sub(n_readers)).max(1)
        };
        let n_sorters = if self.n_sorters > 0 { self.n_sorters } else { n_threads };

        let kmer_words = words_for_k(self.kmer_len);
        // room left in the top word bounds how many extension bases fit
        let slack = (32 * kmer_words).saturating_sub(self.kmer_len + 1) as u32;
        let max_x = slack.min(KMER_X);

        let total_mem = self.max_mem_gb << 30;
        let bin_part_size = 1usize << 16;
        let input_part_size = 1usize << 23;
        let input_pack_blocks = (2 * n_readers + 2).max(4);
        // every splitter may hold one buffer per bin, plus the queued parts
        let bin_pool_blocks = n_splitters * self.n_bins + self.n_bins + 16;

        let stage1_fixed = (input_pack_blocks * input_part_size
            + bin_pool_blocks * bin_part_size) as u64;
        let max_mem_stage2 = (total_mem.saturating_sub(stage1_fixed / 4))
            .max(64 << 20) as usize;

        let small_k_counter_bytes = if self.cutoff_max < u32::MAX as u64 { 4 } else { 8 };
        let small_k = self.kmer_len <= SMALL_K_LIMIT
            && (4u64.pow(self.kmer_len as u32) * small_k_counter_bytes as u64) < total_mem / 2;

        Ok(Resolved {
            kmer_words,
            max_x,
            n_threads,
            n_readers,
            n_splitters,
            n_sorters,
            sm_sorting_threads: if self.sm_sorting_threads > 0 {
                self.sm_sorting_threads
            } else {
                n_threads.min(16)
            },
            sm_uncompactor_threads: if self.sm_uncompactor_threads > 0 {
                self.sm_uncompactor_threads
            } else {
                (n_threads / 2).clamp(1, 16)
            },
            sm_merger_threads: if self.sm_merger_threads > 0 {
                self.sm_merger_threads
            } else {
                1
            },
            bin_part_size,
            input_part_size,
            input_pack_blocks,
            bin_pool_blocks,
            max_mem_stage2,
            small_k,
            small_k_counter_bytes,
            counter_bytes: counter_size_bytes(self.cutoff_max, self.counter_max),
            sm_sub_bin_part_size: (max_mem_stage2 / 8).clamp(16 << 20, 256 << 20),
        })
    }
}
