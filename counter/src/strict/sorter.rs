//! Sub-bin sorting: sort one chunk's records, compact them without cutoffs
//! and write the (suffix, u32 count) run plus its LUT to a sub-bin file.
//!
//! Cutoffs cannot apply here since one k-mer's occurrences spread over many
//! sub-bins; the merger applies them at the very end. Each sub-bin picks its
//! own LUT prefix length, minimizing its file size.

use crate::error::{CounterError, Result};
use crate::kxmer_set::{merge_part, LutUpdater, MergeParams, MergeStats, SubArrayDesc};
use crate::radix::radix_sort_msd;
use crate::shared::SharedSlice;
use crate::sorter::{init_kxmer_runs, pre_compact, SorterParams};
use kmer::words::KmerWords;
use std::io::Write;
use std::path::{Path, PathBuf};

/// Counter width inside sub-bin files, before any saturation.
pub const SUB_BIN_COUNTER_SIZE: usize = 4;

#[derive(Debug, Clone)]
pub struct SubBinDesc {
    pub sub_bin_id: u32,
    pub path: PathBuf,
    pub n_recs: u64,
    pub lut_prefix_len: usize,
}

fn choose_sub_bin_lut_prefix_len(n_recs: u64, kmer_len: usize) -> usize {
    let mut best = 2usize;
    let mut best_mem = u64::MAX;
    for lut_prefix_len in 2..13usize.min(kmer_len) {
        let suffix_len = kmer_len - lut_prefix_len;
        if suffix_len % 4 != 0 {
            continue;
        }
        let mem = n_recs * (suffix_len as u64 / 4 + SUB_BIN_COUNTER_SIZE as u64)
            + (1u64 << (2 * lut_prefix_len)) * 8;
        if mem < best_mem {
            best = lut_prefix_len;
            best_mem = mem;
        }
    }
    best
}

pub fn sort_sub_bin<const W: usize>(
    mut records: Vec<KmerWords<W>>,
    bin_id: u32,
    sub_bin_id: u32,
    params: &SorterParams,
    n_threads: usize,
    working_dir: &Path,
) -> Result<SubBinDesc> {
    let k = params.kmer_len;
    let rec_bytes = if params.max_x > 0 {
        (k + params.max_x as usize + 1 + 3) / 4
    } else {
        (k + 3) / 4
    };

    let mut tmp = vec![KmerWords::<W>::zero(); records.len()];
    radix_sort_msd(&mut records, &mut tmp, rec_bytes, n_threads);
    let mut buffer = if rec_bytes % 2 == 0 { records } else { tmp };

    let mut counters = vec![0u32; buffer.len()];
    let compacted = pre_compact(&mut buffer, &mut counters, n_threads);
    let buffer = &buffer[..compacted];
    let counters = &counters[..compacted];

    let mut runs: Vec<SubArrayDesc> = Vec::new();
    if params.max_x > 0 {
        let mut pos = [0u64; 5];
        pos[4] = compacted as u64;
        for i in 1..4u32 {
            pos[i as usize] = crate::sorter::find_first_symb_occur(
                buffer,
                pos[i as usize - 1],
                compacted as u64,
                0,
                i as u8,
                k,
                params.max_x,
            );
        }
        for i in 1..5u32 {
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
                &mut runs,
            );
        }
    } else if compacted > 0 {
        runs.push(SubArrayDesc {
            start: 0,
            end: compacted as u64,
            shr: 0,
            counters_sum: 0,
        });
    }

    let run_instances: u64 = runs.iter().map(|r| r.end - r.start).sum();
    let lut_prefix_len = choose_sub_bin_lut_prefix_len(run_instances, k);
    let rec_len = (k - lut_prefix_len) / 4 + SUB_BIN_COUNTER_SIZE;
    let merge_params = MergeParams {
        kmer_len: k,
        lut_prefix_len,
        cutoff_min: 1,
        cutoff_max: u64::MAX,
        counter_max: u64::MAX,
        counter_size: SUB_BIN_COUNTER_SIZE,
    };

    let mut lut = vec![0u64; 1 << (2 * lut_prefix_len)];
    let mut out = vec![0u8; run_instances as usize * rec_len];
    let mut stats = MergeStats::default();
    let written = {
        let lut_updater = LutUpdater::new(&mut lut);
        merge_part(
            &runs,
            0,
            buffer,
            counters,
            &merge_params,
            &lut_updater,
            SharedSlice::new(&mut out),
            &mut stats,
        )
        .map(|(_, end)| end)
        .unwrap_or(0)
    };

    let path = ktio::fops::sub_bin_file_path(working_dir, bin_id, sub_bin_id);
    let mut file = std::fs::File::create(&path)
        .map_err(|e| CounterError::temp(path.display(), e))?;
    file.write_all(&out[..written as usize])
        .map_err(|e| CounterError::temp(path.display(), e))?;
    let mut lut_bytes = Vec::with_capacity(lut.len() * 8);
    for entry in &lut {
        lut_bytes.extend_from_slice(&entry.to_le_bytes());
    }
    file.write_all(&lut_bytes)
        .map_err(|e| CounterError::temp(path.display(), e))?;

    Ok(SubBinDesc {
        sub_bin_id,
        path,
        n_recs: stats.n_unique,
        lut_prefix_len,
    })
}
