//! Record-aligned chunking of decompressed input.
//!
//! Splitter threads work on independent byte parts, so a part must never end
//! in the middle of a record. The chunker reads a target amount of bytes,
//! cuts after the last complete record and carries the remainder into the
//! next part. Multiline FASTA is cut at line boundaries instead, and the last
//! k−1 sequence bases are re-emitted at the head of the following part so
//! k-mers straddling the cut are not lost.

use crate::seq::SeqFormat;
use std::collections::VecDeque;
use std::io::Read;

pub struct Chunker {
    format: SeqFormat,
    kmer_len: usize,
    tail: Vec<u8>,
    carry: VecDeque<u8>,
    eof: bool,
}

impl Chunker {
    pub fn new(format: SeqFormat, kmer_len: usize) -> Self {
        Chunker {
            format,
            kmer_len,
            tail: Vec::new(),
            carry: VecDeque::with_capacity(kmer_len.saturating_sub(1)),
            eof: false,
        }
    }

    /// Produce the next record-aligned part of roughly `part_size` bytes.
    /// Returns `None` once the stream and the held-back tail are exhausted.
    pub fn next_part(
        &mut self,
        reader: &mut dyn Read,
        part_size: usize,
    ) -> std::io::Result<Option<Vec<u8>>> {
        if self.eof && self.tail.is_empty() {
            return Ok(None);
        }
        let mut buf = std::mem::take(&mut self.tail);
        let mut target = part_size.max(1);
        let cut = loop {
            while buf.len() < target && !self.eof {
                let old_len = buf.len();
                buf.resize(target, 0);
                let n = read_some(reader, &mut buf[old_len..])?;
                buf.truncate(old_len + n);
                if n == 0 {
                    self.eof = true;
                }
            }
            if self.eof {
                break buf.len();
            }
            if let Some(c) = find_cut(self.format, &buf) {
                break c;
            }
            // no record boundary in sight, keep reading
            target *= 2;
        };
        self.tail = buf.split_off(cut);
        if buf.is_empty() && self.tail.is_empty() {
            return Ok(None);
        }

        if self.format == SeqFormat::MultiFasta {
            let mut part = Vec::with_capacity(self.carry.len() + buf.len());
            part.extend(self.carry.iter());
            part.extend_from_slice(&buf);
            self.update_carry(&part);
            Ok(Some(part))
        } else {
            Ok(Some(buf))
        }
    }

    // Track the trailing k-1 sequence bases, reset at each header.
    fn update_carry(&mut self, part: &[u8]) {
        let keep = self.kmer_len.saturating_sub(1);
        if keep == 0 {
            return;
        }
        let mut i = 0;
        while i < part.len() {
            let b = part[i];
            if b == b'>' {
                self.carry.clear();
                while i < part.len() && part[i] != b'\n' {
                    i += 1;
                }
            } else if b.is_ascii_alphabetic() {
                if self.carry.len() == keep {
                    self.carry.pop_front();
                }
                self.carry.push_back(b);
            }
            i += 1;
        }
    }
}

fn read_some(reader: &mut dyn Read, buf: &mut [u8]) -> std::io::Result<usize> {
    loop {
        match reader.read(buf) {
            Ok(n) => return Ok(n),
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
}

/// Position right after the last complete record, if any.
fn find_cut(format: SeqFormat, buf: &[u8]) -> Option<usize> {
    match format {
        SeqFormat::Fastq => {
            let mut lines = 0usize;
            let mut cut = None;
            for (i, &b) in buf.iter().enumerate() {
                if b == b'\n' {
                    lines += 1;
                    if lines % 4 == 0 {
                        cut = Some(i + 1);
                    }
                }
            }
            cut
        }
        SeqFormat::Fasta => {
            // cut just before the last header so all earlier records are whole
            buf.windows(2)
                .rposition(|w| w == b"\n>")
                .map(|i| i + 1)
                .filter(|&c| c > 1)
        }
        SeqFormat::MultiFasta => buf.iter().rposition(|&b| b == b'\n').map(|i| i + 1),
        SeqFormat::Bam => unreachable!("BAM input is chunked by the BGZF reader"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fastq_cut_test() {
        let data = b"@r1\nACGT\n+\n!!!!\n@r2\nGG";
        assert_eq!(find_cut(SeqFormat::Fastq, data), Some(15));
    }

    #[test]
    fn fasta_cut_test() {
        let data = b">a\nACGT\n>b\nGGGG\n";
        assert_eq!(find_cut(SeqFormat::Fasta, data), Some(8));
    }

    #[test]
    fn chunker_yields_whole_records_test() {
        let data = b"@r1\nACGT\n+\n!!!!\n@r2\nGGCC\n+\n####\n@r3\nTTTT\n+\n!!!!\n";
        let mut rd: &[u8] = data;
        let mut ch = Chunker::new(SeqFormat::Fastq, 3);
        let mut parts = Vec::new();
        while let Some(p) = ch.next_part(&mut rd, 20).unwrap() {
            assert!(p.starts_with(b"@"));
            parts.push(p);
        }
        let total: usize = parts.iter().map(|p| p.len()).sum();
        assert_eq!(total, data.len());
        assert!(parts.len() > 1);
    }

    #[test]
    fn multifasta_carry_test() {
        let data = b">chr\nACGTA\nCGTAC\nGTACG\nTACGT\n";
        let mut rd: &[u8] = data;
        let mut ch = Chunker::new(SeqFormat::MultiFasta, 5);
        let mut parts = Vec::new();
        while let Some(p) = ch.next_part(&mut rd, 14).unwrap() {
            parts.push(p);
        }
        assert!(parts.len() > 1);
        // every part repeats the previous part's last 4 sequence bases, so
        // k-mers straddling the cut survive
        for pair in parts.windows(2) {
            let prev_bases: Vec<u8> = pair[0]
                .iter()
                .copied()
                .filter(|b| b.is_ascii_uppercase())
                .collect();
            let tail: Vec<u8> = prev_bases[prev_bases.len().saturating_sub(4)..].to_vec();
            assert!(
                pair[1].starts_with(&tail),
                "part {:?} does not start with {:?}",
                String::from_utf8_lossy(&pair[1]),
                String::from_utf8_lossy(&tail)
            );
        }
    }
}
