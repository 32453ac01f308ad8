//! BGZF (blocked gzip) decoding for BAM input.
//!
//! A BAM file is a series of BGZF members, each a gzip member carrying a
//! `BC` extra subfield with the compressed block size, terminated by a fixed
//! 28-byte empty block. [`BgzfReader`] exposes the concatenated uncompressed
//! stream; [`BamChunker`] skips the BAM header and cuts the stream into
//! alignment-record-aligned parts for the splitters.

use crate::SeqError;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;

/// The required terminator block of every BAM file.
pub const BGZF_EOF_MARKER: [u8; 28] = [
    0x1f, 0x8b, 0x08, 0x04, 0x00, 0x00, 0x00, 0x00, 0x00, 0xff, 0x06, 0x00, 0x42, 0x43, 0x02,
    0x00, 0x1b, 0x00, 0x03, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
];

pub fn has_bam_eof_marker(path: &Path) -> std::io::Result<bool> {
    let mut file = File::open(path)?;
    let len = file.metadata()?.len();
    if len < 28 {
        return Ok(false);
    }
    file.seek(SeekFrom::End(-28))?;
    let mut tail = [0u8; 28];
    file.read_exact(&mut tail)?;
    Ok(tail == BGZF_EOF_MARKER)
}

pub struct BgzfReader<R: Read> {
    inner: R,
    path: String,
    block: Vec<u8>,
    pos: usize,
    finished: bool,
}

impl<R: Read> BgzfReader<R> {
    pub fn new(inner: R, path: impl Into<String>) -> Self {
        BgzfReader {
            inner,
            path: path.into(),
            block: Vec::new(),
            pos: 0,
            finished: false,
        }
    }

    fn bad(&self, what: &str) -> SeqError {
        SeqError::Decompress(format!("{}: {}", self.path, what))
    }

    fn next_block(&mut self) -> Result<bool, SeqError> {
        let mut header = [0u8; 12];
        match read_full(&mut self.inner, &mut header)
            .map_err(|e| SeqError::io(&self.path, e))?
        {
            0 => {
                self.finished = true;
                return Ok(false);
            }
            12 => {}
            _ => return Err(self.bad("truncated BGZF header")),
        }
        if header[0] != 0x1f || header[1] != 0x8b || header[2] != 0x08 || header[3] & 4 == 0 {
            return Err(self.bad("not a BGZF block"));
        }
        let xlen = u16::from_le_bytes([header[10], header[11]]) as usize;
        let mut extra = vec![0u8; xlen];
        read_exact_or(&mut self.inner, &mut extra, &self.path)?;
        let mut bsize: Option<usize> = None;
        let mut i = 0;
        while i + 4 <= extra.len() {
            let slen = u16::from_le_bytes([extra[i + 2], extra[i + 3]]) as usize;
            if extra[i] == b'B' && extra[i + 1] == b'C' && slen == 2 {
                bsize = Some(u16::from_le_bytes([extra[i + 4], extra[i + 5]]) as usize + 1);
            }
            i += 4 + slen;
        }
        let bsize = bsize.ok_or_else(|| self.bad("missing BC subfield"))?;
        let cdata_len = bsize
            .checked_sub(12 + xlen + 8)
            .ok_or_else(|| self.bad("impossible BSIZE"))?;
        let mut cdata = vec![0u8; cdata_len];
        read_exact_or(&mut self.inner, &mut cdata, &self.path)?;
        let mut trailer = [0u8; 8];
        read_exact_or(&mut self.inner, &mut trailer, &self.path)?;
        let isize = u32::from_le_bytes([trailer[4], trailer[5], trailer[6], trailer[7]]) as usize;

        self.block.clear();
        self.block.reserve(isize);
        let mut decomp = flate2::Decompress::new(false);
        decomp
            .decompress_vec(&cdata, &mut self.block, flate2::FlushDecompress::Finish)
            .map_err(|e| SeqError::Decompress(format!("{}: {}", self.path, e)))?;
        if self.block.len() != isize {
            return Err(self.bad("BGZF block size mismatch"));
        }
        self.pos = 0;
        Ok(true)
    }

    /// Fill `buf` completely or return the number of bytes before EOF.
    pub fn read_uncompressed(&mut self, buf: &mut [u8]) -> Result<usize, SeqError> {
        let mut written = 0;
        while written < buf.len() {
            if self.pos >= self.block.len() {
                if self.finished || !self.next_block()? {
                    break;
                }
                continue; // empty blocks (the EOF marker) are skipped here
            }
            let n = (self.block.len() - self.pos).min(buf.len() - written);
            buf[written..written + n].copy_from_slice(&self.block[self.pos..self.pos + n]);
            self.pos += n;
            written += n;
        }
        Ok(written)
    }
}

fn read_full(reader: &mut impl Read, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut n = 0;
    while n < buf.len() {
        match reader.read(&mut buf[n..]) {
            Ok(0) => break,
            Ok(m) => n += m,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(n)
}

fn read_exact_or(reader: &mut impl Read, buf: &mut [u8], path: &str) -> Result<(), SeqError> {
    match read_full(reader, buf) {
        Ok(n) if n == buf.len() => Ok(()),
        Ok(_) => Err(SeqError::Decompress(format!("{}: truncated BGZF block", path))),
        Err(e) => Err(SeqError::io(path, e)),
    }
}

/// Alignment-record-aligned parts of the uncompressed BAM stream. Each part
/// is a concatenation of `block_size`-prefixed alignment records, exactly as
/// they appear in the file after the header section.
pub struct BamChunker<R: Read> {
    bgzf: BgzfReader<R>,
    path: String,
    header_done: bool,
    eof: bool,
}

impl<R: Read> BamChunker<R> {
    pub fn new(inner: R, path: impl Into<String>) -> Self {
        let path = path.into();
        BamChunker {
            bgzf: BgzfReader::new(inner, path.clone()),
            path,
            header_done: false,
            eof: false,
        }
    }

    fn skip_header(&mut self) -> Result<(), SeqError> {
        let mut magic = [0u8; 4];
        self.read_exact(&mut magic)?;
        if &magic != b"BAM\x01" {
            return Err(SeqError::Format(format!("{}: not a BAM file", self.path)));
        }
        let l_text = self.read_i32()?;
        self.skip(l_text as usize)?;
        let n_ref = self.read_i32()?;
        for _ in 0..n_ref {
            let l_name = self.read_i32()?;
            self.skip(l_name as usize + 4)?;
        }
        Ok(())
    }

    fn read_exact(&mut self, buf: &mut [u8]) -> Result<(), SeqError> {
        let n = self.bgzf.read_uncompressed(buf)?;
        if n != buf.len() {
            return Err(SeqError::Record {
                format: "BAM",
                offset: 0,
            });
        }
        Ok(())
    }

    fn read_i32(&mut self) -> Result<i32, SeqError> {
        let mut b = [0u8; 4];
        self.read_exact(&mut b)?;
        Ok(i32::from_le_bytes(b))
    }

    fn skip(&mut self, mut n: usize) -> Result<(), SeqError> {
        let mut sink = [0u8; 4096];
        while n > 0 {
            let take = n.min(sink.len());
            self.read_exact(&mut sink[..take])?;
            n -= take;
        }
        Ok(())
    }

    pub fn next_part(&mut self, part_size: usize) -> Result<Option<Vec<u8>>, SeqError> {
        if self.eof {
            return Ok(None);
        }
        if !self.header_done {
            self.skip_header()?;
            self.header_done = true;
        }
        let mut part = Vec::with_capacity(part_size + 4096);
        while part.len() < part_size {
            let mut size_bytes = [0u8; 4];
            let n = self.bgzf.read_uncompressed(&mut size_bytes)?;
            if n == 0 {
                self.eof = true;
                break;
            }
            if n != 4 {
                return Err(SeqError::Record {
                    format: "BAM",
                    offset: part.len() as u64,
                });
            }
            let block_size = u32::from_le_bytes(size_bytes) as usize;
            part.extend_from_slice(&size_bytes);
            let start = part.len();
            part.resize(start + block_size, 0);
            self.read_exact(&mut part[start..])?;
        }
        if part.is_empty() {
            Ok(None)
        } else {
            Ok(Some(part))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn bgzf_block(payload: &[u8]) -> Vec<u8> {
        let mut comp = flate2::Compress::new(flate2::Compression::default(), false);
        let mut cdata = Vec::with_capacity(payload.len() + 64);
        comp.compress_vec(payload, &mut cdata, flate2::FlushCompress::Finish)
            .unwrap();
        let bsize = (12 + 6 + cdata.len() + 8 - 1) as u16;
        let mut out = Vec::new();
        out.extend_from_slice(&[0x1f, 0x8b, 0x08, 0x04, 0, 0, 0, 0, 0, 0xff]);
        out.extend_from_slice(&6u16.to_le_bytes());
        out.extend_from_slice(&[b'B', b'C', 2, 0]);
        out.extend_from_slice(&bsize.to_le_bytes());
        out.extend_from_slice(&cdata);
        let mut crc = flate2::Crc::new();
        crc.update(payload);
        out.extend_from_slice(&crc.sum().to_le_bytes());
        out.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        out
    }

    #[test]
    fn bgzf_roundtrip_test() {
        let mut data = bgzf_block(b"hello bgzf ");
        data.write_all(&bgzf_block(b"blocks")).unwrap();
        data.extend_from_slice(&BGZF_EOF_MARKER);
        let mut reader = BgzfReader::new(&data[..], "test.bam");
        let mut out = vec![0u8; 64];
        let n = reader.read_uncompressed(&mut out).unwrap();
        assert_eq!(&out[..n], b"hello bgzf blocks");
    }

    #[test]
    fn eof_marker_is_valid_block_test() {
        let mut reader = BgzfReader::new(&BGZF_EOF_MARKER[..], "eof.bam");
        let mut out = vec![0u8; 8];
        assert_eq!(reader.read_uncompressed(&mut out).unwrap(), 0);
    }
}
