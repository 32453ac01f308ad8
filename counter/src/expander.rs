//! Expansion of packed super-k-mers into sortable records.
//!
//! With max_x = 0 every k-mer becomes one record. Otherwise consecutive
//! k-mers sharing a strand are folded into k+x-mer records: the k-prefix
//! plus up to max_x extension bases, with the real extension count stored in
//! the 2 bits above the base field. The record count per bin was already
//! determined by the collector; parallel expansion may emit fewer records
//! than budgeted (strand ties), leaving gaps that are closed after the join.

use crate::shared::SharedSlice;
use kmer::words::{KmerWords, REV_BYTE};
use std::sync::Mutex;

struct ByteCursor<'a> {
    data: &'a [u8],
    pos: usize,
    byte_shift: u32,
}

impl<'a> ByteCursor<'a> {
    #[inline]
    fn next_symb(&mut self) -> u64 {
        let symb = (self.data[self.pos] >> self.byte_shift) & 3;
        if self.byte_shift == 0 {
            self.pos += 1;
            self.byte_shift = 6;
        } else {
            self.byte_shift -= 2;
        }
        symb as u64
    }
}

/// Read the record header: length code plus the packed k-prefix, forward
/// and (optionally) reverse-complemented. Returns the extension count.
fn load_prefix<const W: usize>(
    cursor: &mut ByteCursor,
    kmer_len: usize,
    kmer_mask: &KmerWords<W>,
    kmer: &mut KmerWords<W>,
    rev_kmer: Option<&mut KmerWords<W>>,
) -> u32 {
    let additional_symbols = cursor.data[cursor.pos] as u32;
    cursor.pos += 1;
    kmer.clear();
    let kmer_bytes = (kmer_len + 3) / 4;
    if let Some(rev) = rev_kmer {
        rev.clear();
        for i in 0..kmer_bytes {
            kmer.set_byte(8 * W - 1 - i, cursor.data[cursor.pos + i]);
            rev.set_byte(i, REV_BYTE[cursor.data[cursor.pos + i] as usize]);
        }
    } else {
        for i in 0..kmer_bytes {
            kmer.set_byte(8 * W - 1 - i, cursor.data[cursor.pos + i]);
        }
    }
    cursor.pos += kmer_bytes;
    cursor.byte_shift = 6 - (kmer_len % 4) as u32 * 2;
    if cursor.byte_shift != 6 {
        // the partial byte still holds the first extension bases
        cursor.pos -= 1;
    }
    let kmer_shr = (W * 32 - kmer_len) as u32;
    if kmer_shr > 0 {
        kmer.shr(kmer_shr);
    }
    kmer.mask(kmer_mask);
    additional_symbols
}

#[inline]
fn finish_record(cursor: &mut ByteCursor) {
    if cursor.byte_shift != 6 {
        cursor.pos += 1;
    }
}

/// Plain k-mer records, forward strand only.
pub fn expand_kmers_all<const W: usize>(
    data: &[u8],
    kmer_len: usize,
    out: &mut [KmerWords<W>],
) -> usize {
    let kmer_mask = KmerWords::<W>::n_ones(2 * kmer_len as u32);
    let mut cursor = ByteCursor {
        data,
        pos: 0,
        byte_shift: 6,
    };
    let mut written = 0;
    let mut kmer = KmerWords::<W>::zero();
    while cursor.pos < data.len() {
        let additional = load_prefix(&mut cursor, kmer_len, &kmer_mask, &mut kmer, None);
        out[written] = kmer;
        written += 1;
        for _ in 0..additional {
            let symb = cursor.next_symb();
            kmer.shl_insert_2bits(symb);
            kmer.mask(&kmer_mask);
            out[written] = kmer;
            written += 1;
        }
        finish_record(&mut cursor);
    }
    written
}

/// Plain canonical k-mer records.
pub fn expand_kmers_both<const W: usize>(
    data: &[u8],
    kmer_len: usize,
    out: &mut [KmerWords<W>],
) -> usize {
    let kmer_mask = KmerWords::<W>::n_ones(2 * kmer_len as u32);
    let rev_shift = (kmer_len as u32 - 1) * 2;
    let mut cursor = ByteCursor {
        data,
        pos: 0,
        byte_shift: 6,
    };
    let mut written = 0;
    let mut kmer = KmerWords::<W>::zero();
    let mut rev_kmer = KmerWords::<W>::zero();
    while cursor.pos < data.len() {
        let additional =
            load_prefix(&mut cursor, kmer_len, &kmer_mask, &mut kmer, Some(&mut rev_kmer));
        rev_kmer.mask(&kmer_mask);
        out[written] = if kmer < rev_kmer { kmer } else { rev_kmer };
        written += 1;
        for _ in 0..additional {
            let symb = cursor.next_symb();
            kmer.shl_insert_2bits(symb);
            kmer.mask(&kmer_mask);
            rev_kmer.shr_insert_2bits(3 - symb, rev_shift);
            out[written] = if kmer < rev_kmer { kmer } else { rev_kmer };
            written += 1;
        }
        finish_record(&mut cursor);
    }
    written
}

/// k+x-mer records, forward strand only: every max_x+1 symbols fold into one
/// fully-extended record, plus a shorter trailing record for leftovers.
pub fn expand_kxmers_all<const W: usize>(
    data: &[u8],
    kmer_len: usize,
    max_x: u32,
    out: &mut [KmerWords<W>],
) -> usize {
    let kmer_mask = KmerWords::<W>::n_ones(2 * kmer_len as u32);
    let kxmer_mask = KmerWords::<W>::n_ones(2 * (kmer_len as u32 + max_x));
    let x_field_pos = 2 * (kmer_len as u32 + max_x);
    let mut cursor = ByteCursor {
        data,
        pos: 0,
        byte_shift: 6,
    };
    let mut written = 0;
    let mut kxmer = KmerWords::<W>::zero();
    while cursor.pos < data.len() {
        let mut additional = load_prefix(&mut cursor, kmer_len, &kmer_mask, &mut kxmer, None);

        let first_x = max_x.min(additional);
        for _ in 0..first_x {
            let symb = cursor.next_symb();
            kxmer.shl_insert_2bits(symb);
        }
        kxmer.set_2bits(first_x as u64, x_field_pos);
        out[written] = kxmer;
        written += 1;
        kxmer.mask(&kxmer_mask);
        additional -= first_x;

        let kxmers_count = additional / (max_x + 1);
        let mut kxmer_rest = additional % (max_x + 1);
        for _ in 0..kxmers_count {
            for _ in 0..max_x + 1 {
                let symb = cursor.next_symb();
                kxmer.shl_insert_2bits(symb);
            }
            kxmer.mask(&kxmer_mask);
            kxmer.set_2bits(max_x as u64, x_field_pos);
            out[written] = kxmer;
            written += 1;
            kxmer.mask(&kxmer_mask);
        }
        if kxmer_rest > 0 {
            let symb = cursor.next_symb();
            kxmer.shl_insert_2bits(symb);
            kxmer.mask(&kmer_mask);
            kxmer_rest -= 1;
            for _ in 0..kxmer_rest {
                let symb = cursor.next_symb();
                kxmer.shl_insert_2bits(symb);
            }
            kxmer.set_2bits(kxmer_rest as u64, x_field_pos);
            out[written] = kxmer;
            written += 1;
        }
        finish_record(&mut cursor);
    }
    written
}

/// Canonical k+x-mer expansion of one byte range of the bin file into one
/// output slot range. Returns the number of unused slots (fake records).
///
/// # Safety contract
/// `out[output_start..output_end)` is owned exclusively by this call.
#[allow(clippy::too_many_arguments)]
pub fn expand_kxmers_both_range<const W: usize>(
    data: &[u8],
    byte_start: usize,
    byte_end: usize,
    kmer_len: usize,
    max_x: u32,
    out: SharedSlice<'_, KmerWords<W>>,
    output_start: usize,
    output_end: usize,
) -> usize {
    let kmer_mask = KmerWords::<W>::n_ones(2 * kmer_len as u32);
    let rev_shift = (kmer_len as u32) * 2 - 2;
    let x_field_pos = 2 * (kmer_len as u32 + max_x);
    let mut cursor = ByteCursor {
        data: &data[..byte_end],
        pos: byte_start,
        byte_shift: 6,
    };
    let mut out_pos = output_start;
    let mut kmer = KmerWords::<W>::zero();
    let mut rev_kmer = KmerWords::<W>::zero();

    while cursor.pos < byte_end {
        let additional =
            load_prefix(&mut cursor, kmer_len, &kmer_mask, &mut kmer, Some(&mut rev_kmer));
        rev_kmer.mask(&kmer_mask);

        let mut kmer_lower = kmer < rev_kmer;
        let mut x: u32 = 0;
        let mut record = if kmer_lower { kmer } else { rev_kmer };

        let mut symbols_left = additional;
        while symbols_left > 0 {
            let symb = cursor.next_symb();
            kmer.shl_insert_2bits(symb);
            kmer.mask(&kmer_mask);
            rev_kmer.shr_insert_2bits(3 - symb, rev_shift);
            symbols_left -= 1;

            if kmer_lower {
                if kmer < rev_kmer {
                    record.shl_insert_2bits(symb);
                    x += 1;
                    if x == max_x {
                        if symbols_left == 0 {
                            break;
                        }
                        record.set_2bits(x as u64, x_field_pos);
                        unsafe { out.set(out_pos, record) };
                        out_pos += 1;
                        x = 0;

                        let symb = cursor.next_symb();
                        kmer.shl_insert_2bits(symb);
                        kmer.mask(&kmer_mask);
                        rev_kmer.shr_insert_2bits(3 - symb, rev_shift);
                        symbols_left -= 1;

                        kmer_lower = kmer < rev_kmer;
                        record = if kmer_lower { kmer } else { rev_kmer };
                    }
                } else {
                    record.set_2bits(x as u64, x_field_pos);
                    unsafe { out.set(out_pos, record) };
                    out_pos += 1;
                    x = 0;
                    kmer_lower = false;
                    record = rev_kmer;
                }
            } else if !(kmer < rev_kmer) {
                // reverse-strand records grow upward from the k-prefix
                record.set_2bits((3 - symb) as u64, 2 * kmer_len as u32 + 2 * x);
                x += 1;
                if x == max_x {
                    if symbols_left == 0 {
                        break;
                    }
                    record.set_2bits(x as u64, x_field_pos);
                    unsafe { out.set(out_pos, record) };
                    out_pos += 1;
                    x = 0;

                    let symb = cursor.next_symb();
                    kmer.shl_insert_2bits(symb);
                    kmer.mask(&kmer_mask);
                    rev_kmer.shr_insert_2bits(3 - symb, rev_shift);
                    symbols_left -= 1;

                    kmer_lower = kmer < rev_kmer;
                    record = if kmer_lower { kmer } else { rev_kmer };
                }
            } else {
                record.set_2bits(x as u64, x_field_pos);
                unsafe { out.set(out_pos, record) };
                out_pos += 1;
                x = 0;
                record = kmer;
                kmer_lower = true;
            }
        }
        record.set_2bits(x as u64, x_field_pos);
        unsafe { out.set(out_pos, record) };
        out_pos += 1;

        finish_record(&mut cursor);
    }
    output_end - out_pos
}

/// Splits the bin file into the collector's expander packs, handing each
/// thread a byte range and its pre-counted output slot range.
pub struct ExpanderPackQueue {
    state: Mutex<(usize, usize, std::collections::VecDeque<(u64, u64)>)>,
}

impl ExpanderPackQueue {
    pub fn new(parts: Vec<(u64, u64)>) -> ExpanderPackQueue {
        ExpanderPackQueue {
            state: Mutex::new((0, 0, parts.into())),
        }
    }

    pub fn pop(&self) -> Option<(usize, usize, usize, usize)> {
        let mut state = self.state.lock().unwrap();
        let (bytes, recs) = state.2.pop_front()?;
        let start = state.0;
        let output_start = state.1;
        state.0 += bytes as usize;
        state.1 += recs as usize;
        Some((start, state.0, output_start, state.1))
    }
}

/// Canonical k+x-mer expansion over all expander packs with `n_threads`
/// workers. Gaps left by over-budgeted packs are closed by a two-pointer
/// pass; returns the number of real records.
pub fn expand_kxmers_both_parallel<const W: usize>(
    data: &[u8],
    expander_parts: Vec<(u64, u64)>,
    kmer_len: usize,
    max_x: u32,
    out: &mut [KmerWords<W>],
    n_plus_x_recs: usize,
    n_threads: usize,
) -> usize {
    if data.is_empty() {
        return 0;
    }
    if n_threads <= 1 || expander_parts.len() <= 1 {
        let shared = SharedSlice::new(out);
        let fake = expand_kxmers_both_range(
            data,
            0,
            data.len(),
            kmer_len,
            max_x,
            shared,
            0,
            n_plus_x_recs,
        );
        return n_plus_x_recs - fake;
    }

    let queue = ExpanderPackQueue::new(expander_parts);
    let shared = SharedSlice::new(out);
    let regions: Mutex<Vec<(usize, usize)>> = Mutex::new(Vec::new());
    let fake_total = std::sync::atomic::AtomicUsize::new(0);

    rayon::scope(|scope| {
        for _ in 0..n_threads {
            scope.spawn(|_| {
                let mut local_regions = Vec::new();
                let mut local_fakes = 0usize;
                while let Some((start, end, out_start, out_end)) = queue.pop() {
                    let fakes = expand_kxmers_both_range(
                        data, start, end, kmer_len, max_x, shared, out_start, out_end,
                    );
                    local_fakes += fakes;
                    local_regions.push((out_start, out_end - fakes));
                }
                fake_total.fetch_add(local_fakes, std::sync::atomic::Ordering::Relaxed);
                regions.lock().unwrap().extend(local_regions);
            });
        }
    });

    let mut filled_regions = regions.into_inner().unwrap();
    filled_regions.sort_unstable();
    close_gaps(out, &filled_regions);
    n_plus_x_recs - fake_total.load(std::sync::atomic::Ordering::Relaxed)
}

/// Move records from the tail into the gaps between filled regions.
fn close_gaps<const W: usize>(out: &mut [KmerWords<W>], filled_regions: &[(usize, usize)]) {
    if filled_regions.is_empty() {
        return;
    }
    let mut first_gap = filled_regions[0].1;
    let mut next_region = 1usize;
    let mut back_region = filled_regions.len() as i64 - 1;
    let mut last_elem = filled_regions[back_region as usize].1 as i64 - 1;

    loop {
        while next_region < filled_regions.len() && first_gap >= filled_regions[next_region].0 {
            first_gap = filled_regions[next_region].1;
            next_region += 1;
        }
        while back_region >= 0 && last_elem < filled_regions[back_region as usize].0 as i64 {
            back_region -= 1;
            if back_region >= 0 {
                last_elem = filled_regions[back_region as usize].1 as i64 - 1;
            }
        }
        if back_region < 0 || first_gap as i64 >= last_elem {
            break;
        }
        out[first_gap] = out[last_elem as usize];
        first_gap += 1;
        last_elem -= 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bins::BinTable;
    use crate::collector::KmerBinCollector;
    use crate::pools::BlockPool;
    use crate::queues::Queue;
    use std::collections::HashMap;
    use std::sync::Arc;

    fn pack_super_kmer(seq: &[u8], k: usize) -> Vec<u8> {
        let mut out = vec![(seq.len() - k) as u8];
        for quad in seq.chunks(4) {
            let mut byte = 0u8;
            for (i, &s) in quad.iter().enumerate() {
                byte |= s << (6 - 2 * i);
            }
            out.push(byte);
        }
        out
    }

    fn decode<const W: usize>(rec: &KmerWords<W>, k: usize, max_x: u32) -> Vec<u64> {
        // every k+x-mer record carries x+1 k-mers
        let x = rec.get_2bits(2 * (k as u32 + max_x)) as u32;
        let mask = KmerWords::<W>::n_ones(2 * k as u32);
        (0..=x)
            .map(|shr| {
                let kmer = KmerWords::from_kxmer(rec, x - shr, &mask);
                kmer.data[0]
            })
            .collect()
    }

    fn oracle_forward(seq: &[u8], k: usize) -> HashMap<u64, u64> {
        let mut out = HashMap::new();
        for w in seq.windows(k) {
            let mut v = 0u64;
            for &s in w {
                v = (v << 2) | s as u64;
            }
            *out.entry(v).or_default() += 1;
        }
        out
    }

    fn oracle_canonical(seq: &[u8], k: usize) -> HashMap<u64, u64> {
        let mut out = HashMap::new();
        for w in seq.windows(k) {
            let mut f = 0u64;
            let mut r = 0u64;
            for (i, &s) in w.iter().enumerate() {
                f = (f << 2) | s as u64;
                r |= ((3 - s) as u64) << (2 * i);
            }
            *out.entry(f.min(r)).or_default() += 1;
        }
        out
    }

    #[test]
    fn expand_kmers_all_matches_oracle_test() {
        let seq: Vec<u8> = b"ACGTTGCATCGGATG"
            .iter()
            .map(|&b| kmer::SEQ_NT4_TABLE[b as usize])
            .collect();
        let k = 7;
        let data = pack_super_kmer(&seq, k);
        let mut out = vec![KmerWords::<1>::zero(); seq.len() - k + 1];
        let n = expand_kmers_all(&data, k, &mut out);
        assert_eq!(n, seq.len() - k + 1);
        let mut got: HashMap<u64, u64> = HashMap::new();
        for rec in &out {
            *got.entry(rec.data[0]).or_default() += 1;
        }
        assert_eq!(got, oracle_forward(&seq, k));
    }

    #[test]
    fn expand_kxmers_all_covers_all_kmers_test() {
        let seq: Vec<u8> = b"ACGTTGCATCGGATGCATTGCA"
            .iter()
            .map(|&b| kmer::SEQ_NT4_TABLE[b as usize])
            .collect();
        let k = 7;
        let max_x = 3;
        let data = pack_super_kmer(&seq, k);
        let n_kmers = seq.len() - k + 1;
        let expected_recs = 1 + (seq.len() - k) / (max_x as usize + 1);
        let mut out = vec![KmerWords::<1>::zero(); expected_recs];
        let n = expand_kxmers_all(&data, k, max_x, &mut out);
        assert_eq!(n, expected_recs);
        let mut got: HashMap<u64, u64> = HashMap::new();
        let mut total = 0;
        for rec in &out {
            for v in decode(rec, k, max_x) {
                *got.entry(v).or_default() += 1;
                total += 1;
            }
        }
        assert_eq!(total, n_kmers);
        assert_eq!(got, oracle_forward(&seq, k));
    }

    /// Collector-counted records and expander-emitted records must agree
    /// (emitted + fakes == counted), and the decoded canonical k-mers must
    /// match a direct count.
    #[test]
    fn canonical_expansion_agrees_with_collector_test() {
        let seqs: Vec<Vec<u8>> = [
            &b"ACGTTGCATCGGATGCATTGCAAC"[..],
            &b"TTTTTTTTTTTTTTTTTT"[..],
            &b"ACGTACGTACGTACGTACGT"[..],
            &b"GGCATGCAAGTCCAATCGGGCATAAGCAT"[..],
        ]
        .iter()
        .map(|s| s.iter().map(|&b| kmer::SEQ_NT4_TABLE[b as usize]).collect())
        .collect();
        let k = 7;
        let max_x = 3;

        let pool = Arc::new(BlockPool::new(2, 1 << 12));
        let queue = Arc::new(Queue::unbounded(1));
        let dir = std::env::temp_dir().join("expander_test");
        ktio::fops::create_directory(&dir).unwrap();
        let table = Arc::new(BinTable::new(1, &dir, true, false));
        let mut collector = KmerBinCollector::new(
            0,
            k,
            max_x,
            true,
            pool,
            Arc::clone(&queue),
            Arc::clone(&table),
        );
        for seq in &seqs {
            collector.put_extended_kmer(seq).unwrap();
        }
        collector.flush().unwrap();
        queue.mark_completed();
        let part = queue.pop().unwrap();
        let data = part.data.filled().to_vec();
        let n_plus_x = table.stats(0).n_plus_x_recs as usize;
        let parts = part.expander_parts.clone();

        let mut out = vec![KmerWords::<1>::zero(); n_plus_x];
        let real = expand_kxmers_both_parallel(&data, parts, k, max_x, &mut out, n_plus_x, 1);
        assert!(real <= n_plus_x);

        let mut got: HashMap<u64, u64> = HashMap::new();
        for rec in &out[..real] {
            for v in decode(rec, k, max_x) {
                *got.entry(v).or_default() += 1;
            }
        }
        let mut expect: HashMap<u64, u64> = HashMap::new();
        for seq in &seqs {
            for (kmer, cnt) in oracle_canonical(seq, k) {
                *expect.entry(kmer).or_default() += cnt;
            }
        }
        assert_eq!(got, expect);
    }

    #[test]
    fn close_gaps_test() {
        let mut data: Vec<KmerWords<1>> = (0..10u64)
            .map(|v| KmerWords { data: [v] })
            .collect();
        // regions: [0,3) filled of [0,5), [5,8) filled of [5,10)
        // gap at 3,4 should receive the tail records 7,6
        close_gaps(&mut data, &[(0, 3), (5, 8)]);
        let vals: Vec<u64> = data[..6].iter().map(|r| r.data[0]).collect();
        assert_eq!(vals, vec![0, 1, 2, 7, 6, 5]);
    }
}
