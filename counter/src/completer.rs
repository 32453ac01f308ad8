//! The completer: streams finished bins into the output database.
//!
//! Phase 1 runs alongside the sorters, consuming bins in ascending id order.
//! Phase 2 runs after the strict-memory stage and appends the oversized
//! bins, then seals both files with the signature map and the header.

use crate::error::Result;
use crate::kxmer_set::MergeStats;
use crate::mapper::SignatureMapper;
use crate::output::{DbHeader, DbWriter};
use crate::queues::{BigBinKmerPartQueue, KmerQueue};
use std::path::Path;

pub struct Completer<'a> {
    writer: DbWriter,
    mapper: &'a SignatureMapper,
    sig_map: Vec<u32>,
    lut_pos: u32,
    pub stats: MergeStats,
}

impl<'a> Completer<'a> {
    pub fn new(output_base: &Path, mapper: &'a SignatureMapper) -> Result<Completer<'a>> {
        Ok(Completer {
            writer: DbWriter::create(output_base)?,
            mapper,
            sig_map: vec![0u32; mapper.map_size()],
            lut_pos: 0,
            stats: MergeStats::default(),
        })
    }

    fn assign_lut_pos(&mut self, bin_id: u32) {
        for (sig, entry) in self.sig_map.iter_mut().enumerate() {
            if self.mapper.bin_id(sig as u32) == bin_id {
                *entry = self.lut_pos;
            }
        }
        self.lut_pos += 1;
    }

    /// Consume every bin of the sorting stage in ascending order; diverted
    /// bins are left for phase 2.
    pub fn first_stage(&mut self, kmer_queue: &KmerQueue, n_bins: u32) -> Result<()> {
        for next in 0..n_bins {
            let Some(mut bin) = kmer_queue.pop_in_order(next) else {
                break;
            };
            if bin.diverted {
                continue;
            }
            if let Some(suffix) = bin.suffix.take() {
                for &(start, end) in &bin.packs {
                    self.writer
                        .write_suffix_data(&suffix[start as usize..end as usize])?;
                }
            }
            if let Some(mut lut) = bin.lut.take() {
                self.writer.write_lut(lut.as_slice_of::<u64>())?;
            }
            self.stats.n_unique += bin.n_unique;
            self.stats.n_cutoff_min += bin.n_cutoff_min;
            self.stats.n_cutoff_max += bin.n_cutoff_max;
            self.stats.n_total += bin.n_total;
            self.assign_lut_pos(bin.bin_id);
        }
        Ok(())
    }

    /// Consume the strict-memory merger output.
    pub fn second_stage(&mut self, queue: &BigBinKmerPartQueue) -> Result<()> {
        while let Some(mut part) = queue.pop() {
            self.writer.write_suffix_data(&part.suffix)?;
            self.writer.write_lut(&mut part.lut)?;
            self.stats.n_unique += part.n_unique;
            self.stats.n_cutoff_min += part.n_cutoff_min;
            self.stats.n_cutoff_max += part.n_cutoff_max;
            self.stats.n_total += part.n_total;
            self.assign_lut_pos(part.bin_id);
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    pub fn finish(
        self,
        kmer_len: usize,
        counter_size: usize,
        lut_prefix_len: usize,
        signature_len: usize,
        cutoff_min: u32,
        cutoff_max: u64,
        both_strands: bool,
    ) -> Result<MergeStats> {
        let header = DbHeader {
            kmer_len: kmer_len as u32,
            counter_size: counter_size as u32,
            lut_prefix_len: lut_prefix_len as u32,
            signature_len: signature_len as u32,
            cutoff_min,
            cutoff_max: cutoff_max.min(u32::MAX as u64) as u32,
            counted: self
                .stats
                .n_unique
                .saturating_sub(self.stats.n_cutoff_min + self.stats.n_cutoff_max),
            no_canonical: !both_strands,
        };
        self.writer.finish(&header, &self.sig_map)?;
        Ok(self.stats)
    }
}
