//! Sub-bin merging: k-way merge of a bin's sorted sub-bin files into the
//! final output pack, applying cutoffs and saturation.

use crate::error::{CounterError, Result};
use crate::queues::BigBinKmerPart;
use crate::sorter::SorterParams;
use crate::strict::sorter::{SubBinDesc, SUB_BIN_COUNTER_SIZE};
use kmer::words::KmerWords;
use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::fs::File;
use std::io::{BufReader, Read, Seek, SeekFrom};

/// Streams (k-mer, count) records of one sub-bin file in ascending order.
struct SubBinStream<const W: usize> {
    reader: BufReader<File>,
    desc: SubBinDesc,
    /// per-prefix record counts, walked front to back
    lut: Vec<u64>,
    prefix: usize,
    left_in_prefix: u64,
    suffix_bytes: usize,
    kmer_len: usize,
}

impl<const W: usize> SubBinStream<W> {
    fn open(desc: &SubBinDesc, kmer_len: usize) -> Result<SubBinStream<W>> {
        let mut file =
            File::open(&desc.path).map_err(|e| CounterError::temp(desc.path.display(), e))?;
        let lut_entries = 1usize << (2 * desc.lut_prefix_len);
        file.seek(SeekFrom::End(-(lut_entries as i64 * 8)))
            .map_err(|e| CounterError::temp(desc.path.display(), e))?;
        let mut lut_bytes = vec![0u8; lut_entries * 8];
        file.read_exact(&mut lut_bytes)
            .map_err(|e| CounterError::temp(desc.path.display(), e))?;
        let lut: Vec<u64> = lut_bytes
            .chunks_exact(8)
            .map(|c| u64::from_le_bytes(c.try_into().expect("8 bytes")))
            .collect();
        file.seek(SeekFrom::Start(0))
            .map_err(|e| CounterError::temp(desc.path.display(), e))?;
        Ok(SubBinStream {
            reader: BufReader::new(file),
            desc: desc.clone(),
            lut,
            prefix: 0,
            left_in_prefix: 0,
            suffix_bytes: (kmer_len - desc.lut_prefix_len) / 4,
            kmer_len,
        })
    }

    fn next(&mut self) -> Result<Option<(KmerWords<W>, u64)>> {
        while self.left_in_prefix == 0 {
            if self.prefix >= self.lut.len() {
                return Ok(None);
            }
            self.left_in_prefix = self.lut[self.prefix];
            self.prefix += 1;
        }
        self.left_in_prefix -= 1;

        let mut rec = vec![0u8; self.suffix_bytes + SUB_BIN_COUNTER_SIZE];
        self.reader
            .read_exact(&mut rec)
            .map_err(|e| CounterError::temp(self.desc.path.display(), e))?;

        let mut kmer = KmerWords::<W>::load(&rec[..self.suffix_bytes]);
        let prefix_val = (self.prefix - 1) as u64;
        let suffix_bits = (self.kmer_len - self.desc.lut_prefix_len) as u32 * 2;
        // place the prefix above the suffix bases
        let word = (suffix_bits / 64) as usize;
        let bit = suffix_bits % 64;
        kmer.data[word] |= prefix_val << bit;
        if bit > 0 && word + 1 < W && 2 * self.desc.lut_prefix_len as u32 + bit > 64 {
            kmer.data[word + 1] |= prefix_val >> (64 - bit);
        }

        let count = u32::from_le_bytes(
            rec[self.suffix_bytes..].try_into().expect("4 bytes"),
        ) as u64;
        Ok(Some((kmer, count)))
    }
}

/// Merge the sorted sub-bins of one oversized bin into the pack the
/// completer's second phase writes out.
pub fn merge_sub_bins<const W: usize>(
    bin_id: u32,
    descs: &[SubBinDesc],
    params: &SorterParams,
) -> Result<BigBinKmerPart> {
    let mut streams: Vec<SubBinStream<W>> = Vec::with_capacity(descs.len());
    for desc in descs {
        streams.push(SubBinStream::open(desc, params.kmer_len)?);
    }

    let mut heap: BinaryHeap<Reverse<(KmerWords<W>, usize)>> = BinaryHeap::new();
    let mut counts: Vec<u64> = vec![0; streams.len()];
    for (idx, stream) in streams.iter_mut().enumerate() {
        if let Some((kmer, count)) = stream.next()? {
            counts[idx] = count;
            heap.push(Reverse((kmer, idx)));
        }
    }

    let suffix_symbols = params.kmer_len - params.lut_prefix_len;
    let suffix_bytes = suffix_symbols / 4;
    let mut part = BigBinKmerPart {
        bin_id,
        suffix: Vec::new(),
        lut: vec![0u64; 1 << (2 * params.lut_prefix_len)],
        n_unique: 0,
        n_cutoff_min: 0,
        n_cutoff_max: 0,
        n_total: 0,
    };

    let emit = |kmer: &KmerWords<W>, count: u64, part: &mut BigBinKmerPart| {
        part.n_total += count;
        part.n_unique += 1;
        if count < params.cutoff_min as u64 {
            part.n_cutoff_min += 1;
        } else if count > params.cutoff_max {
            part.n_cutoff_max += 1;
        } else {
            let count = count.min(params.counter_max);
            for j in (0..suffix_bytes).rev() {
                part.suffix.push(kmer.get_byte(j));
            }
            for b in 0..params.counter_size {
                part.suffix.push(((count >> (8 * b)) & 0xFF) as u8);
            }
            part.lut[kmer.remove_suffix(suffix_symbols as u32 * 2) as usize] += 1;
        }
    };

    let mut active: Option<(KmerWords<W>, u64)> = None;
    while let Some(Reverse((kmer, idx))) = heap.pop() {
        let count = counts[idx];
        match &mut active {
            Some((act, act_count)) if *act == kmer => *act_count += count,
            Some((act, act_count)) => {
                let (act, act_count) = (*act, *act_count);
                emit(&act, act_count, &mut part);
                active = Some((kmer, count));
            }
            None => active = Some((kmer, count)),
        }
        if let Some((next_kmer, next_count)) = streams[idx].next()? {
            counts[idx] = next_count;
            heap.push(Reverse((next_kmer, idx)));
        }
    }
    if let Some((act, act_count)) = active {
        emit(&act, act_count, &mut part);
    }

    for desc in descs {
        ktio::fops::delete_file_if_exists(&desc.path)
            .map_err(|e| CounterError::temp(desc.path.display(), e))?;
    }
    Ok(part)
}
