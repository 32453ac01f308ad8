//! The output database: a prefix file and a suffix file sharing a basename.
//!
//! Suffix file: `KMCS` marker, then (suffix bytes, counter bytes) records in
//! k-prefix order per bin, then `KMCS`. Prefix file: `KMCP`, one cumulative
//! record-index LUT block per processed bin, the total record count, the
//! signature-to-bin table, a fixed-layout header and `KMCP`. Little-endian
//! throughout. The reader side drives the dump command and the tests.

use crate::error::{CounterError, Result};
use std::fs::File;
use std::io::{BufWriter, Read, Write};
use std::path::{Path, PathBuf};

pub const PREFIX_EXT: &str = "dkc_pre";
pub const SUFFIX_EXT: &str = "dkc_suf";
pub const FORMAT_VERSION: u32 = 0x200;

const MARKER_PRE: &[u8; 4] = b"KMCP";
const MARKER_SUF: &[u8; 4] = b"KMCS";

#[derive(Debug, Clone)]
pub struct DbHeader {
    pub kmer_len: u32,
    pub counter_size: u32,
    pub lut_prefix_len: u32,
    pub signature_len: u32,
    pub cutoff_min: u32,
    pub cutoff_max: u32,
    pub counted: u64,
    pub no_canonical: bool,
}

pub fn db_paths(base: &Path) -> (PathBuf, PathBuf) {
    (
        base.with_extension(PREFIX_EXT),
        base.with_extension(SUFFIX_EXT),
    )
}

pub struct DbWriter {
    out_pre: BufWriter<File>,
    out_suf: BufWriter<File>,
    pre_path: PathBuf,
    suf_path: PathBuf,
    n_recs: u64,
}

impl DbWriter {
    pub fn create(base: &Path) -> Result<DbWriter> {
        let (pre_path, suf_path) = db_paths(base);
        let pre = File::create(&pre_path).map_err(|e| CounterError::output(pre_path.display(), e))?;
        let suf = File::create(&suf_path).map_err(|e| CounterError::output(suf_path.display(), e))?;
        let mut writer = DbWriter {
            out_pre: BufWriter::new(pre),
            out_suf: BufWriter::new(suf),
            pre_path,
            suf_path,
            n_recs: 0,
        };
        writer.pre(MARKER_PRE)?;
        writer.suf(MARKER_SUF)?;
        Ok(writer)
    }

    fn pre(&mut self, bytes: &[u8]) -> Result<()> {
        self.out_pre
            .write_all(bytes)
            .map_err(|e| CounterError::output(self.pre_path.display(), e))
    }

    fn suf(&mut self, bytes: &[u8]) -> Result<()> {
        self.out_suf
            .write_all(bytes)
            .map_err(|e| CounterError::output(self.suf_path.display(), e))
    }

    pub fn write_suffix_data(&mut self, bytes: &[u8]) -> Result<()> {
        self.suf(bytes)
    }

    /// Replace per-prefix counts with the running record index and append
    /// the block to the prefix file.
    pub fn write_lut(&mut self, lut: &mut [u64]) -> Result<()> {
        for entry in lut.iter_mut() {
            let count = *entry;
            *entry = self.n_recs;
            self.n_recs += count;
        }
        let mut bytes = Vec::with_capacity(lut.len() * 8);
        for entry in lut.iter() {
            bytes.extend_from_slice(&entry.to_le_bytes());
        }
        self.pre(&bytes)
    }

    pub fn finish(mut self, header: &DbHeader, sig_map: &[u32]) -> Result<()> {
        self.suf(MARKER_SUF)?;

        let total = self.n_recs;
        self.pre(&total.to_le_bytes())?;
        let mut map_bytes = Vec::with_capacity(sig_map.len() * 4);
        for &entry in sig_map {
            map_bytes.extend_from_slice(&entry.to_le_bytes());
        }
        self.pre(&map_bytes)?;

        let mut offset = 0u32;
        let mut head = Vec::new();
        for value in [
            header.kmer_len,
            0, // mode, always plain counting
            header.counter_size,
            header.lut_prefix_len,
            header.signature_len,
            header.cutoff_min,
            header.cutoff_max,
        ] {
            head.extend_from_slice(&value.to_le_bytes());
            offset += 4;
        }
        head.extend_from_slice(&header.counted.to_le_bytes());
        offset += 8;
        head.push(header.no_canonical as u8);
        offset += 1;
        head.extend_from_slice(&[0u8; 27]);
        offset += 27;
        head.extend_from_slice(&FORMAT_VERSION.to_le_bytes());
        offset += 4;
        head.extend_from_slice(&offset.to_le_bytes());
        head.extend_from_slice(MARKER_PRE);
        self.pre(&head)?;

        self.out_pre
            .flush()
            .map_err(|e| CounterError::output(self.pre_path.display(), e))?;
        self.out_suf
            .flush()
            .map_err(|e| CounterError::output(self.suf_path.display(), e))?;
        Ok(())
    }
}

/// In-memory view of a produced database.
pub struct DbReader {
    pub header: DbHeader,
    /// flattened per-bin LUT blocks, cumulative record indices
    luts: Vec<u64>,
    total: u64,
    suffix_data: Vec<u8>,
}

impl DbReader {
    pub fn open(base: &Path) -> Result<DbReader> {
        let (pre_path, suf_path) = db_paths(base);
        let pre = read_file(&pre_path)?;
        let suf = read_file(&suf_path)?;

        if pre.len() < 16 || &pre[..4] != MARKER_PRE || &pre[pre.len() - 4..] != MARKER_PRE {
            return Err(bad_db(&pre_path, "prefix markers missing"));
        }
        if suf.len() < 8 || &suf[..4] != MARKER_SUF || &suf[suf.len() - 4..] != MARKER_SUF {
            return Err(bad_db(&suf_path, "suffix markers missing"));
        }

        let header_offset =
            read_u32(&pre, pre.len() - 8) as usize;
        let header_start = pre
            .len()
            .checked_sub(8 + header_offset)
            .ok_or_else(|| bad_db(&pre_path, "bad header offset"))?;
        let header = DbHeader {
            kmer_len: read_u32(&pre, header_start),
            counter_size: read_u32(&pre, header_start + 8),
            lut_prefix_len: read_u32(&pre, header_start + 12),
            signature_len: read_u32(&pre, header_start + 16),
            cutoff_min: read_u32(&pre, header_start + 20),
            cutoff_max: read_u32(&pre, header_start + 24),
            counted: read_u64(&pre, header_start + 28),
            no_canonical: pre[header_start + 36] != 0,
        };

        let sig_map_entries = (1usize << (2 * header.signature_len)) + 1;
        let sig_map_start = header_start - 4 * sig_map_entries;
        let total_start = sig_map_start - 8;
        let total = read_u64(&pre, total_start);

        let lut_area = &pre[4..total_start];
        if lut_area.len() % 8 != 0 {
            return Err(bad_db(&pre_path, "misaligned LUT area"));
        }
        let luts: Vec<u64> = lut_area
            .chunks_exact(8)
            .map(|c| u64::from_le_bytes(c.try_into().expect("8 bytes")))
            .collect();

        let lut_block = 1usize << (2 * header.lut_prefix_len);
        if !luts.is_empty() && luts.len() % lut_block != 0 {
            return Err(bad_db(&pre_path, "LUT area not block aligned"));
        }

        Ok(DbReader {
            header,
            luts,
            total,
            suffix_data: suf[4..suf.len() - 4].to_vec(),
        })
    }

    pub fn total_records(&self) -> u64 {
        self.total
    }

    /// All (k-mer, count) pairs in database order.
    pub fn records(&self) -> Result<Vec<(String, u64)>> {
        let k = self.header.kmer_len as usize;
        let lpl = self.header.lut_prefix_len as usize;
        let suffix_symbols = k - lpl;
        let suffix_bytes = suffix_symbols / 4;
        let rec_len = suffix_bytes + self.header.counter_size as usize;

        if self.suffix_data.len() != rec_len * self.total as usize {
            return Err(CounterError::Internal(format!(
                "suffix file holds {} bytes, expected {} records of {} bytes",
                self.suffix_data.len(),
                self.total,
                rec_len
            )));
        }

        let lut_block = 1usize << (2 * lpl);
        let mut out = Vec::with_capacity(self.total as usize);
        let mut bounds = self.luts.clone();
        bounds.push(self.total);

        for j in 0..self.luts.len() {
            let prefix = (j % lut_block) as u64;
            for i in bounds[j]..bounds[j + 1] {
                let rec = &self.suffix_data[i as usize * rec_len..(i as usize + 1) * rec_len];
                let mut text = String::with_capacity(k);
                text.push_str(&kmer::numeric_to_kmer(prefix, lpl));
                for &byte in &rec[..suffix_bytes] {
                    text.push_str(&kmer::numeric_to_kmer(byte as u64, 4));
                }
                let mut count = 0u64;
                for (b, &byte) in rec[suffix_bytes..].iter().enumerate() {
                    count |= (byte as u64) << (8 * b);
                }
                out.push((text, count));
            }
        }
        Ok(out)
    }
}

fn read_file(path: &Path) -> Result<Vec<u8>> {
    let mut data = Vec::new();
    File::open(path)
        .and_then(|mut f| f.read_to_end(&mut data))
        .map_err(|e| CounterError::output(path.display(), e))?;
    Ok(data)
}

fn bad_db(path: &Path, what: &str) -> CounterError {
    CounterError::Internal(format!("{}: {}", path.display(), what))
}

fn read_u32(data: &[u8], at: usize) -> u32 {
    u32::from_le_bytes(data[at..at + 4].try_into().expect("4 bytes"))
}

fn read_u64(data: &[u8], at: usize) -> u64 {
    u64::from_le_bytes(data[at..at + 8].try_into().expect("8 bytes"))
}

/// Pick the LUT prefix length minimizing estimated database size, over
/// choices that leave the suffix a whole number of bytes.
pub fn choose_lut_prefix_len(n_recs_estimate: u64, n_bins: usize, kmer_len: usize) -> usize {
    let mut best = 0usize;
    let mut best_mem = u64::MAX;
    for lut_prefix_len in 2..16usize.min(kmer_len) {
        let suffix_len = kmer_len - lut_prefix_len;
        if suffix_len % 4 != 0 {
            continue;
        }
        let est_suf_mem = n_recs_estimate * suffix_len as u64;
        let lut_mem = n_bins as u64 * (1u64 << (2 * lut_prefix_len)) * 8;
        if est_suf_mem + lut_mem < best_mem {
            best = lut_prefix_len;
            best_mem = est_suf_mem + lut_mem;
        }
    }
    best
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_read_roundtrip_test() {
        let base = std::env::temp_dir().join("output_rt_test");
        let mut writer = DbWriter::create(&base).unwrap();
        // k = 8, lpl = 4 -> 1 suffix byte + 1 counter byte
        // bin 0: kmers 0x0102 (prefix 1, suffix 2) count 3; 0x0a0b count 2
        writer.write_suffix_data(&[0x02, 3, 0x0b, 2]).unwrap();
        let mut lut = vec![0u64; 256];
        lut[0x01] = 1;
        lut[0x0a] = 1;
        writer.write_lut(&mut lut).unwrap();
        let header = DbHeader {
            kmer_len: 8,
            counter_size: 1,
            lut_prefix_len: 4,
            signature_len: 5,
            cutoff_min: 1,
            cutoff_max: 255,
            counted: 2,
            no_canonical: true,
        };
        let sig_map = vec![0u32; (1 << 10) + 1];
        writer.finish(&header, &sig_map).unwrap();

        let reader = DbReader::open(&base).unwrap();
        assert_eq!(reader.header.kmer_len, 8);
        assert_eq!(reader.header.counter_size, 1);
        assert!(reader.header.no_canonical);
        assert_eq!(reader.total_records(), 2);
        let records = reader.records().unwrap();
        assert_eq!(
            records,
            vec![("AAACAAAG".to_string(), 3), ("AAGGAAGT".to_string(), 2)]
        );
    }

    #[test]
    fn choose_lut_prefix_len_test() {
        // small inputs favour small LUTs, and the suffix stays byte aligned
        let lpl = choose_lut_prefix_len(100, 64, 24);
        assert_eq!((24 - lpl) % 4, 0);
        assert!(lpl >= 2);
        let big = choose_lut_prefix_len(1 << 40, 512, 24);
        assert!(big >= lpl);
    }
}
