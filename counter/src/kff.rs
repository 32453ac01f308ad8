//! KFF v1 re-packaging of a finished database.
//!
//! Header with the 2-bit encoding and flags, one `v` section naming `k`,
//! `max`, `data_size` and `ordered`, one `r` section of (k-mer, counter)
//! blocks, an `i` index section and a footer `v` section, `KFF` magic at
//! both ends. All integers big-endian, unlike the native database.

use crate::error::{CounterError, Result};
use crate::output::DbReader;
use kmer::SEQ_NT4_TABLE;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

const VER_MAJOR: u8 = 1;
const VER_MINOR: u8 = 0;
/// A=0 C=1 G=2 T=3, two bits each, stated high to low.
const ENCODING: u8 = 0b0001_1011;

struct KffOut {
    out: BufWriter<File>,
    path: String,
    written: u64,
}

impl KffOut {
    fn write(&mut self, bytes: &[u8]) -> Result<()> {
        self.out
            .write_all(bytes)
            .map_err(|e| CounterError::output(&self.path, e))?;
        self.written += bytes.len() as u64;
        Ok(())
    }

    fn write_u64(&mut self, value: u64) -> Result<()> {
        self.write(&value.to_be_bytes())
    }

    fn write_var(&mut self, name: &str, value: u64) -> Result<()> {
        self.write(name.as_bytes())?;
        self.write(&[0])?;
        self.write_u64(value)
    }
}

pub fn write_kff(db_base: &Path, kff_path: &Path, counter_max: u64) -> Result<()> {
    let reader = DbReader::open(db_base)?;
    let k = reader.header.kmer_len as usize;
    let counter_size = reader.header.counter_size as usize;
    let kmer_bytes = (k + 3) / 4;

    let file =
        File::create(kff_path).map_err(|e| CounterError::output(kff_path.display(), e))?;
    let mut out = KffOut {
        out: BufWriter::new(file),
        path: kff_path.display().to_string(),
        written: 0,
    };
    let mut section_index: Vec<(u8, u64)> = Vec::new();

    out.write(b"KFF")?;
    out.write(&[VER_MAJOR, VER_MINOR, ENCODING])?;
    let unique_kmers = 1u8;
    let canonical = !reader.header.no_canonical as u8;
    out.write(&[unique_kmers, canonical])?;
    out.write(&0u32.to_be_bytes())?; // free block size

    // variables section
    section_index.push((b'v', out.written));
    out.write(b"v")?;
    let vars = [
        ("k", k as u64),
        ("max", 1),
        ("data_size", counter_size as u64),
        ("ordered", 1),
    ];
    out.write_u64(vars.len() as u64)?;
    for (name, value) in vars {
        out.write_var(name, value)?;
    }

    // raw section with every record
    let records = reader.records()?;
    section_index.push((b'r', out.written));
    out.write(b"r")?;
    out.write_u64(records.len() as u64)?;
    let mut packed = vec![0u8; kmer_bytes];
    for (kmer_text, count) in &records {
        packed.iter_mut().for_each(|b| *b = 0);
        for (i, ch) in kmer_text.bytes().enumerate() {
            let code = SEQ_NT4_TABLE[ch as usize];
            packed[i / 4] |= code << (6 - 2 * (i % 4));
        }
        out.write(&packed)?;
        out.write(&count.to_be_bytes()[8 - counter_size..])?;
    }

    // index section, relative offsets from the index end
    let index_start = out.written;
    let nb_sections = section_index.len() as u64 + 1; // +1 for the footer
    let index_size = 1 + 8 + nb_sections * 9 + 8;
    let index_end = index_start + index_size;
    out.write(b"i")?;
    out.write_u64(nb_sections)?;
    for (kind, pos) in &section_index {
        out.write(&[*kind])?;
        out.write_u64((*pos as i64 - index_end as i64) as u64)?;
    }
    out.write(&[b'v'])?;
    out.write_u64(0)?; // the footer follows immediately
    out.write_u64(0)?; // no next index

    // footer
    let mut footer = vec![
        ("first_index".to_string(), index_start),
        ("min_count".to_string(), reader.header.cutoff_min as u64),
        ("max_count".to_string(), counter_max),
        ("counter_size".to_string(), counter_size as u64),
    ];
    let mut footer_size = 1 + 8;
    for (name, _) in &footer {
        footer_size += name.len() as u64 + 1 + 8;
    }
    footer_size += "footer_size".len() as u64 + 1 + 8;
    footer.push(("footer_size".to_string(), footer_size));

    out.write(b"v")?;
    out.write_u64(footer.len() as u64)?;
    for (name, value) in &footer {
        out.write_var(name, *value)?;
    }
    out.write(b"KFF")?;
    out.out
        .flush()
        .map_err(|e| CounterError::output(kff_path.display(), e))?;
    Ok(())
}
