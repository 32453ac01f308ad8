//! Per-bin super-k-mer collectors.
//!
//! Each splitter thread owns one collector per bin. A collector packs
//! super-k-mers into a pool block (length byte + 2-bit packed bases), keeps
//! the expander-part ranges that later parallelize stage-2 expansion, and
//! counts the records the bin will expand to.

use crate::bins::BinTable;
use crate::error::Result;
use crate::mapper::SignatureMapper;
use crate::pools::{Block, BlockPool};
use crate::queues::{BinPart, BinPartQueue};
use crate::splitter::SuperKmerSink;
use std::sync::Arc;

/// Super-k-mers per expander pack.
const MAX_SUPER_KMERS_EXPANDER_PACK: u32 = 1 << 12;

#[derive(PartialEq, Clone, Copy)]
enum StrandState {
    KmerSmaller,
    RevSmaller,
    Equals,
}

pub struct KmerBinCollector {
    bin_id: u32,
    kmer_len: usize,
    max_x: u32,
    both_strands: bool,
    pool: Arc<BlockPool>,
    queue: Arc<BinPartQueue>,
    table: Arc<BinTable>,
    buffer: Option<Block>,
    buffer_pos: usize,
    n_recs: u64,
    n_plus_x_recs: u64,
    n_super_kmers: u64,
    super_kmer_no: u32,
    prev_pos: u64,
    prev_n_plus_x_recs: u64,
    expander_parts: Vec<(u64, u64)>,
}

impl KmerBinCollector {
    pub fn new(
        bin_id: u32,
        kmer_len: usize,
        max_x: u32,
        both_strands: bool,
        pool: Arc<BlockPool>,
        queue: Arc<BinPartQueue>,
        table: Arc<BinTable>,
    ) -> KmerBinCollector {
        KmerBinCollector {
            bin_id,
            kmer_len,
            max_x,
            both_strands,
            pool,
            queue,
            table,
            buffer: None,
            buffer_pos: 0,
            n_recs: 0,
            n_plus_x_recs: 0,
            n_super_kmers: 0,
            super_kmer_no: 0,
            prev_pos: 0,
            prev_n_plus_x_recs: 0,
            expander_parts: Vec::new(),
        }
    }

    pub fn put_extended_kmer(&mut self, seq: &[u8]) -> Result<()> {
        let n = seq.len();
        if self.super_kmer_no >= MAX_SUPER_KMERS_EXPANDER_PACK {
            self.expander_parts.push((
                self.buffer_pos as u64 - self.prev_pos,
                self.n_plus_x_recs - self.prev_n_plus_x_recs,
            ));
            self.prev_pos = self.buffer_pos as u64;
            self.prev_n_plus_x_recs = self.n_plus_x_recs;
            self.super_kmer_no = 0;
        }
        let bytes = 1 + (n + 3) / 4;
        if self.buffer.is_none() {
            self.buffer = Some(self.pool.reserve());
        }
        if self.buffer_pos + bytes > self.buffer.as_ref().expect("buffer").len() {
            self.flush()?;
            self.buffer = Some(self.pool.reserve());
        }

        let buffer = self.buffer.as_mut().expect("buffer");
        buffer[self.buffer_pos] = (n - self.kmer_len) as u8;
        self.buffer_pos += 1;
        let mut chunks = seq.chunks_exact(4);
        for quad in &mut chunks {
            buffer[self.buffer_pos] = (quad[0] << 6) | (quad[1] << 4) | (quad[2] << 2) | quad[3];
            self.buffer_pos += 1;
        }
        let rest = chunks.remainder();
        if !rest.is_empty() {
            let mut byte = 0u8;
            for (idx, &s) in rest.iter().enumerate() {
                byte |= s << (6 - 2 * idx);
            }
            buffer[self.buffer_pos] = byte;
            self.buffer_pos += 1;
        }

        self.super_kmer_no += 1;
        self.n_super_kmers += 1;
        self.n_recs += (n - self.kmer_len + 1) as u64;
        if self.max_x > 0 {
            // for max_x = 0 plain k-mers (not k+x-mers) get sorted
            if !self.both_strands {
                self.n_plus_x_recs += 1 + ((n - self.kmer_len) / (self.max_x as usize + 1)) as u64;
            } else {
                self.update_n_plus_x_recs(seq);
            }
        }
        Ok(())
    }

    /// Count the k+x-mer records a canonical expansion will emit: a record
    /// ends whenever the canonical strand flips or x reaches max_x. The
    /// strand here is tracked through one-byte proxies of both ends, which
    /// over-counts ties; the expander pads the difference with fake records.
    fn update_n_plus_x_recs(&mut self, seq: &[u8]) {
        let k = self.kmer_len;
        let n = seq.len();
        let divide_factor = (self.max_x + 1) as u64;

        let mut kmer = (seq[0] << 6) | (seq[1] << 4) | (seq[2] << 2) | seq[3];
        let mut rev = ((3 - seq[k - 1]) << 6)
            | ((3 - seq[k - 2]) << 4)
            | ((3 - seq[k - 3]) << 2)
            | (3 - seq[k - 4]);
        let mut kmer_pos = 4;
        let mut rev_pos = k;
        let mut x = 0u64;

        let state_of = |kmer: u8, rev: u8| {
            if kmer < rev {
                StrandState::KmerSmaller
            } else if rev < kmer {
                StrandState::RevSmaller
            } else {
                StrandState::Equals
            }
        };
        let mut current_state = state_of(kmer, rev);

        for _ in 0..n - k {
            rev = (rev >> 2) | ((3 - seq[rev_pos]) << 6);
            rev_pos += 1;
            kmer = (kmer << 2) | seq[kmer_pos];
            kmer_pos += 1;

            let new_state = state_of(kmer, rev);
            if new_state == current_state {
                if current_state == StrandState::Equals {
                    self.n_plus_x_recs += 1;
                } else {
                    x += 1;
                }
            } else {
                current_state = new_state;
                self.n_plus_x_recs += 1 + x / divide_factor;
                x = 0;
            }
        }
        self.n_plus_x_recs += 1 + x / divide_factor;
    }

    pub fn flush(&mut self) -> Result<()> {
        let Some(mut buffer) = self.buffer.take() else {
            return Ok(());
        };
        if self.prev_pos < self.buffer_pos as u64 {
            self.expander_parts.push((
                self.buffer_pos as u64 - self.prev_pos,
                self.n_plus_x_recs - self.prev_n_plus_x_recs,
            ));
        }
        self.prev_pos = 0;
        self.prev_n_plus_x_recs = 0;
        self.super_kmer_no = 0;

        buffer.used = self.buffer_pos;
        self.queue.push(BinPart {
            bin_id: self.bin_id,
            data: buffer,
            expander_parts: std::mem::take(&mut self.expander_parts),
        });
        self.table
            .add_counts(self.bin_id, self.n_recs, self.n_plus_x_recs, self.n_super_kmers);
        self.buffer_pos = 0;
        self.n_recs = 0;
        self.n_plus_x_recs = 0;
        self.n_super_kmers = 0;
        Ok(())
    }
}

/// Routes finished super-k-mers to the collector of their signature's bin.
pub struct BinSink<'a> {
    pub mapper: &'a SignatureMapper,
    pub collectors: &'a mut [KmerBinCollector],
}

impl SuperKmerSink for BinSink<'_> {
    fn flush_super_kmer(&mut self, signature: u32, seq: &[u8]) -> Result<()> {
        let bin_id = self.mapper.bin_id(signature);
        self.collectors[bin_id as usize].put_extended_kmer(seq)
    }
}
