//! Streaming decompression over queued byte packs.
//!
//! Readers hand compressed file bytes to the tokenizer stage in fixed-size
//! packs. [`PackChain`] glues a stream of packs back into a `Read`, and
//! [`decoded_reader`] layers the right decoder on top. The multi-stream
//! decoders restart on concatenated gzip/bzip2 members.

use crate::seq::Compression;
use std::io::Read;

/// A `Read` over a sequence of owned byte packs. Packs are dropped as soon
/// as they are consumed, which is what returns pooled buffers to their pool.
pub struct PackChain<I, B>
where
    I: Iterator<Item = B>,
    B: AsRef<[u8]>,
{
    packs: I,
    current: Option<B>,
    pos: usize,
}

impl<I, B> PackChain<I, B>
where
    I: Iterator<Item = B>,
    B: AsRef<[u8]>,
{
    pub fn new(packs: I) -> Self {
        PackChain {
            packs,
            current: None,
            pos: 0,
        }
    }
}

impl<I, B> Read for PackChain<I, B>
where
    I: Iterator<Item = B>,
    B: AsRef<[u8]>,
{
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        loop {
            if self.current.is_none() {
                self.current = self.packs.next();
                self.pos = 0;
                if self.current.is_none() {
                    return Ok(0);
                }
            }
            let done = {
                let data = self.current.as_ref().unwrap().as_ref();
                if self.pos < data.len() {
                    let n = (data.len() - self.pos).min(buf.len());
                    buf[..n].copy_from_slice(&data[self.pos..self.pos + n]);
                    self.pos += n;
                    return Ok(n);
                }
                true
            };
            if done {
                self.current = None;
            }
        }
    }
}

pub fn decoded_reader<'a>(
    compression: Compression,
    inner: impl Read + Send + 'a,
) -> Box<dyn Read + Send + 'a> {
    match compression {
        Compression::Plain => Box::new(inner),
        Compression::Gzip => Box::new(flate2::read::MultiGzDecoder::new(inner)),
        Compression::Bzip2 => Box::new(bzip2::read::MultiBzDecoder::new(inner)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn pack_chain_test() {
        let packs: Vec<Vec<u8>> = vec![b"abc".to_vec(), vec![], b"defg".to_vec()];
        let mut r = PackChain::new(packs.into_iter());
        let mut out = Vec::new();
        r.read_to_end(&mut out).unwrap();
        assert_eq!(out, b"abcdefg");
    }

    #[test]
    fn bzip2_roundtrip_test() {
        let mut enc = bzip2::write::BzEncoder::new(Vec::new(), bzip2::Compression::default());
        enc.write_all(b"ACGTACGTACGT").unwrap();
        let data = enc.finish().unwrap();
        let mut dec = decoded_reader(Compression::Bzip2, &data[..]);
        let mut out = Vec::new();
        dec.read_to_end(&mut out).unwrap();
        assert_eq!(out, b"ACGTACGTACGT");
    }

    #[test]
    fn multi_stream_gzip_test() {
        let mut data = Vec::new();
        for part in [&b"hello "[..], &b"world"[..]] {
            let mut enc =
                flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
            enc.write_all(part).unwrap();
            data.extend(enc.finish().unwrap());
        }
        let packs: Vec<Vec<u8>> = data.chunks(7).map(|c| c.to_vec()).collect();
        let chain = PackChain::new(packs.into_iter());
        let mut dec = decoded_reader(Compression::Gzip, chain);
        let mut out = Vec::new();
        dec.read_to_end(&mut out).unwrap();
        assert_eq!(out, b"hello world");
    }
}
