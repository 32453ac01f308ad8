//! Bin descriptors and temporary bin storage.
//!
//! Each bin owns one append-only temporary file (or a RAM buffer in memory
//! mode) plus counters filled by the collectors and the storer. The table is
//! a concurrent map; each field has a single mutating stage at a time.

use crate::arena;
use crate::error::{CounterError, Result};
use crate::params::counter_size_bytes;
use scc::HashMap as SccMap;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, Default)]
pub struct BinStats {
    pub size: u64,
    pub n_rec: u64,
    pub n_plus_x_recs: u64,
    pub n_super_kmers: u64,
}

enum TempBin {
    Unopened,
    Disk { path: PathBuf, file: File },
    Ram { data: Vec<u8> },
}

struct BinEntry {
    stats: BinStats,
    file: TempBin,
    expander_parts: Vec<(u64, u64)>,
}

pub struct BinTable {
    bins: SccMap<u32, BinEntry>,
    n_bins: u32,
    working_dir: PathBuf,
    mem_mode: bool,
    keep_intermediates: bool,
}

/// Arena slot sizes needed to sort one bin.
#[derive(Debug, Clone, Copy)]
pub struct BinSizes {
    pub file_size: u64,
    pub input_kmer_size: u64,
    pub out_buffer_size: u64,
    pub kxmer_counter_size: u64,
    pub lut_size: u64,
    pub rec_bytes: usize,
    pub required: u64,
}

impl BinTable {
    pub fn new(
        n_bins: u32,
        working_dir: &Path,
        mem_mode: bool,
        keep_intermediates: bool,
    ) -> BinTable {
        let bins = SccMap::new();
        for bin_id in 0..n_bins {
            let _ = bins.insert(
                bin_id,
                BinEntry {
                    stats: BinStats::default(),
                    file: TempBin::Unopened,
                    expander_parts: Vec::new(),
                },
            );
        }
        BinTable {
            bins,
            n_bins,
            working_dir: working_dir.to_path_buf(),
            mem_mode,
            keep_intermediates,
        }
    }

    pub fn n_bins(&self) -> u32 {
        self.n_bins
    }

    /// Collector-side accumulation at flush time.
    pub fn add_counts(&self, bin_id: u32, n_rec: u64, n_plus_x_recs: u64, n_super_kmers: u64) {
        self.bins
            .update(&bin_id, |_, e| {
                e.stats.n_rec += n_rec;
                e.stats.n_plus_x_recs += n_plus_x_recs;
                e.stats.n_super_kmers += n_super_kmers;
            })
            .expect("bin registered");
    }

    /// Storer-side append of one flushed part.
    pub fn append(&self, bin_id: u32, bytes: &[u8], expander_parts: Vec<(u64, u64)>) -> Result<()> {
        let mut result = Ok(());
        self.bins
            .update(&bin_id, |_, e| {
                result = Self::append_entry(
                    e,
                    bytes,
                    &self.working_dir,
                    bin_id,
                    self.mem_mode,
                );
                e.expander_parts.extend(expander_parts.iter().copied());
            })
            .expect("bin registered");
        result
    }

    fn append_entry(
        entry: &mut BinEntry,
        bytes: &[u8],
        working_dir: &Path,
        bin_id: u32,
        mem_mode: bool,
    ) -> Result<()> {
        if let TempBin::Unopened = entry.file {
            entry.file = if mem_mode {
                TempBin::Ram { data: Vec::new() }
            } else {
                let path = ktio::fops::bin_file_path(working_dir, bin_id);
                let file = OpenOptions::new()
                    .create(true)
                    .truncate(true)
                    .write(true)
                    .open(&path)
                    .map_err(|e| CounterError::temp(path.display(), e))?;
                TempBin::Disk { path, file }
            };
        }
        match &mut entry.file {
            TempBin::Disk { path, file } => file
                .write_all(bytes)
                .map_err(|e| CounterError::temp(path.display(), e))?,
            TempBin::Ram { data } => data.extend_from_slice(bytes),
            TempBin::Unopened => unreachable!(),
        }
        entry.stats.size += bytes.len() as u64;
        Ok(())
    }

    pub fn stats(&self, bin_id: u32) -> BinStats {
        self.bins
            .read(&bin_id, |_, e| e.stats)
            .expect("bin registered")
    }

    pub fn n_rec_sum(&self) -> u64 {
        let mut sum = 0;
        self.bins.scan(|_, e| sum += e.stats.n_rec);
        sum
    }

    pub fn take_expander_parts(&self, bin_id: u32) -> Vec<(u64, u64)> {
        self.bins
            .update(&bin_id, |_, e| std::mem::take(&mut e.expander_parts))
            .expect("bin registered")
    }

    /// Read the whole temporary bin back and delete it (unless retained).
    pub fn read_and_remove(&self, bin_id: u32, out: &mut [u8]) -> Result<()> {
        let mut taken = TempBin::Unopened;
        self.bins
            .update(&bin_id, |_, e| {
                taken = std::mem::replace(&mut e.file, TempBin::Unopened);
            })
            .expect("bin registered");
        match taken {
            TempBin::Unopened => Ok(()),
            TempBin::Ram { data } => {
                if data.len() != out.len() {
                    return Err(CounterError::Internal(format!(
                        "bin {} size mismatch: {} vs {}",
                        bin_id,
                        data.len(),
                        out.len()
                    )));
                }
                out.copy_from_slice(&data);
                Ok(())
            }
            TempBin::Disk { path, file } => {
                drop(file);
                let map = ktio::mmap::mmap_file_ro(&path)?;
                if map.len() != out.len() {
                    return Err(CounterError::Internal(format!(
                        "corrupted bin file {}: {} bytes, expected {}",
                        path.display(),
                        map.len(),
                        out.len()
                    )));
                }
                out.copy_from_slice(&map);
                drop(map);
                if !self.keep_intermediates {
                    ktio::fops::delete_file_if_exists(&path)
                        .map_err(|e| CounterError::temp(path.display(), e))?;
                }
                Ok(())
            }
        }
    }

    /// Take the temporary bin for streaming; used by the strict-memory
    /// stage which cannot afford the whole bin in one buffer.
    pub fn open_stream(&self, bin_id: u32) -> Result<BinStream> {
        let mut taken = TempBin::Unopened;
        self.bins
            .update(&bin_id, |_, e| {
                taken = std::mem::replace(&mut e.file, TempBin::Unopened);
            })
            .expect("bin registered");
        match taken {
            TempBin::Unopened => Ok(BinStream::Ram {
                data: Vec::new(),
                pos: 0,
            }),
            TempBin::Ram { data } => Ok(BinStream::Ram { data, pos: 0 }),
            TempBin::Disk { path, file } => {
                drop(file);
                let file = File::open(&path).map_err(|e| CounterError::temp(path.display(), e))?;
                Ok(BinStream::Disk {
                    file,
                    path,
                    keep: self.keep_intermediates,
                })
            }
        }
    }

    /// Size the arena span of every bin and order them largest first.
    #[allow(clippy::too_many_arguments)]
    pub fn sorted_req_sizes(
        &self,
        max_x: u32,
        kmer_t_bytes: usize,
        cutoff_min: u32,
        cutoff_max: u64,
        counter_max: u64,
        lut_prefix_len: usize,
        kmer_len: usize,
    ) -> Vec<(u32, BinSizes)> {
        let mut sizes = Vec::with_capacity(self.n_bins as usize);
        for bin_id in 0..self.n_bins {
            let stats = self.stats(bin_id);
            let (input_recs, kxmer_counter_size, kxmer_symbols) = if max_x > 0 {
                (
                    stats.n_plus_x_recs,
                    stats.n_plus_x_recs * std::mem::size_of::<u32>() as u64,
                    kmer_len + max_x as usize + 1,
                )
            } else {
                (stats.n_rec, 0, kmer_len)
            };
            let input_kmer_size = input_recs * kmer_t_bytes as u64;
            let max_out_recs = (stats.n_rec + 1) / cutoff_min.max(1) as u64;
            let counter_size = counter_size_bytes(cutoff_max, counter_max) as u64;
            let kmer_bytes = ((kmer_len - lut_prefix_len) / 4) as u64;
            let out_buffer_size = max_out_recs * (kmer_bytes + counter_size);
            let rec_bytes = (kxmer_symbols + 3) / 4;
            let lut_size = (1u64 << (2 * lut_prefix_len)) * 8;

            let required = arena::required_bytes(
                rec_bytes,
                stats.size as usize,
                input_kmer_size as usize,
                out_buffer_size as usize,
                kxmer_counter_size as usize,
                lut_size as usize,
            ) as u64;

            sizes.push((
                bin_id,
                BinSizes {
                    file_size: stats.size,
                    input_kmer_size,
                    out_buffer_size,
                    kxmer_counter_size,
                    lut_size,
                    rec_bytes,
                    required,
                },
            ));
        }
        sizes.sort_by(|a, b| b.1.required.cmp(&a.1.required).then(a.0.cmp(&b.0)));
        sizes
    }
}

/// Sequential reader over one temporary bin, deleting the file once done.
pub enum BinStream {
    Disk {
        file: File,
        path: PathBuf,
        keep: bool,
    },
    Ram {
        data: Vec<u8>,
        pos: usize,
    },
}

impl std::io::Read for BinStream {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        match self {
            BinStream::Disk { file, .. } => std::io::Read::read(file, buf),
            BinStream::Ram { data, pos } => {
                let n = (data.len() - *pos).min(buf.len());
                buf[..n].copy_from_slice(&data[*pos..*pos + n]);
                *pos += n;
                Ok(n)
            }
        }
    }
}

impl Drop for BinStream {
    fn drop(&mut self) {
        if let BinStream::Disk { path, keep, .. } = self {
            if !*keep {
                let _ = ktio::fops::delete_file_if_exists(&path);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table(dir: &str, mem: bool) -> BinTable {
        let path = std::env::temp_dir().join(dir);
        ktio::fops::create_directory(&path).unwrap();
        BinTable::new(4, &path, mem, false)
    }

    #[test]
    fn append_and_read_back_ram_test() {
        let t = table("bins_ram_test", true);
        t.append(1, b"abcd", vec![(4, 2)]).unwrap();
        t.append(1, b"efgh", vec![(4, 3)]).unwrap();
        assert_eq!(t.stats(1).size, 8);
        assert_eq!(t.take_expander_parts(1), vec![(4, 2), (4, 3)]);
        let mut out = vec![0u8; 8];
        t.read_and_remove(1, &mut out).unwrap();
        assert_eq!(&out, b"abcdefgh");
    }

    #[test]
    fn append_and_read_back_disk_test() {
        let t = table("bins_disk_test", false);
        t.append(2, b"0123456789", Vec::new()).unwrap();
        let mut out = vec![0u8; 10];
        t.read_and_remove(2, &mut out).unwrap();
        assert_eq!(&out, b"0123456789");
        // the temp file is gone
        let path = ktio::fops::bin_file_path(&std::env::temp_dir().join("bins_disk_test"), 2);
        assert!(!path.exists());
    }

    #[test]
    fn sorted_req_sizes_orders_desc_test() {
        let t = table("bins_sort_test", true);
        t.add_counts(0, 10, 12, 1);
        t.append(0, &[0u8; 64], Vec::new()).unwrap();
        t.add_counts(3, 1000, 1200, 10);
        t.append(3, &[0u8; 4096], Vec::new()).unwrap();
        let sizes = t.sorted_req_sizes(3, 8, 1, 1_000_000_000, 255, 4, 25);
        assert_eq!(sizes[0].0, 3);
        assert!(sizes[0].1.required >= sizes[1].1.required);
        assert_eq!(sizes.len(), 4);
    }
}
