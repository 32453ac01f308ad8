//! Stage-1 input pipeline: readers and tokenizers.
//!
//! Reader threads pull file names from the shared FIFO and push raw byte
//! packs (pool blocks tagged Begin/Middle/End) onto their own binary-pack
//! queue, so decompression state stays per stream. Tokenizer threads rebuild
//! a byte stream per file, layer the right decoder on top and emit
//! record-aligned parts for the splitters.

use crate::cancel::Cancel;
use crate::error::Result;
use crate::pools::BlockPool;
use crate::queues::{BinaryPack, BinaryPackQueue, FilePart, Part, PartQueue, StatsPartQueue};
use ktio::chunk::Chunker;
use ktio::decomp::decoded_reader;
use ktio::seq::{Compression, SeqFormat};
use ktio::SeqError;
use std::fs::File;
use std::io::Read;

/// Where tokenizers deliver parts; the stats pass swaps in the budgeted queue.
pub enum PartSink<'a> {
    Main(&'a PartQueue),
    Stats(&'a StatsPartQueue),
}

impl PartSink<'_> {
    fn push(&self, part: Part) -> bool {
        match self {
            PartSink::Main(q) => q.push(part),
            PartSink::Stats(q) => q.push(part),
        }
    }
}

/// One reader slot: stream files into fixed-size packs.
pub fn reader_loop(
    files: &crate::queues::InputFilesQueue,
    pack_queue: &BinaryPackQueue,
    pool: &BlockPool,
    cancel: &Cancel,
) -> Result<()> {
    while let Some(path) = files.pop() {
        if cancel.is_set() {
            break;
        }
        let compression = Compression::get(&path);
        let mut file = File::open(&path).map_err(|_| SeqError::Open(path.clone()))?;
        let mut first = true;
        loop {
            let mut block = pool.reserve();
            let n = read_full(&mut file, &mut block).map_err(|e| SeqError::io(&path, e))?;
            block.used = n;
            let eof = n < block.len();
            let tag = if eof {
                FilePart::End
            } else if first {
                FilePart::Begin
            } else {
                FilePart::Middle
            };
            // a file fitting one pack still needs its Begin metadata
            let tag = if first && eof { FilePart::Begin } else { tag };
            let emitted_end = matches!(tag, FilePart::End) || (first && eof);
            let accepted = pack_queue.push(BinaryPack {
                data: block,
                file_part: tag,
                compression,
                path: path.clone(),
            });
            if !accepted {
                files.ignore_rest();
                return Ok(());
            }
            if first && eof {
                // terminate the single-pack file explicitly
                let mut end = pool.reserve();
                end.used = 0;
                pack_queue.push(BinaryPack {
                    data: end,
                    file_part: FilePart::End,
                    compression,
                    path: path.clone(),
                });
            }
            first = false;
            if emitted_end {
                break;
            }
        }
    }
    Ok(())
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

/// Byte stream of a single file rebuilt from its packs.
struct PackStream<'a> {
    queue: &'a BinaryPackQueue,
    current: Option<BinaryPack>,
    pos: usize,
    file_done: bool,
}

impl<'a> PackStream<'a> {
    fn new(queue: &'a BinaryPackQueue) -> Self {
        PackStream {
            queue,
            current: None,
            pos: 0,
            file_done: true,
        }
    }

    /// Advance to the next file's Begin pack, skipping leftovers of a file
    /// that was not consumed to its end.
    fn next_file(&mut self) -> Option<(Compression, String)> {
        loop {
            let pack = match self.current.take() {
                Some(p) => p,
                None => self.queue.pop()?,
            };
            self.pos = 0;
            if pack.file_part == FilePart::Begin {
                self.file_done = false;
                let meta = (pack.compression, pack.path.clone());
                self.current = Some(pack);
                return Some(meta);
            }
        }
    }
}

impl Read for PackStream<'_> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        loop {
            if self.file_done {
                return Ok(0);
            }
            if let Some(pack) = &self.current {
                let data = pack.data.filled();
                if self.pos < data.len() {
                    let n = (data.len() - self.pos).min(buf.len());
                    buf[..n].copy_from_slice(&data[self.pos..self.pos + n]);
                    self.pos += n;
                    return Ok(n);
                }
                if pack.file_part == FilePart::End {
                    self.file_done = true;
                    self.current = None;
                    return Ok(0);
                }
                self.current = None;
            }
            self.current = self.queue.pop();
            self.pos = 0;
            if self.current.is_none() {
                self.file_done = true;
                return Ok(0);
            }
        }
    }
}

/// One tokenizer slot: decompress and cut into record-aligned parts.
pub fn tokenizer_loop(
    pack_queue: &BinaryPackQueue,
    sink: PartSink<'_>,
    format: SeqFormat,
    kmer_len: usize,
    part_size: usize,
    cancel: &Cancel,
) -> Result<()> {
    let mut stream = PackStream::new(pack_queue);
    while let Some((compression, path)) = stream.next_file() {
        if cancel.is_set() {
            break;
        }
        if format == SeqFormat::Bam {
            let mut bam = ktio::bgzf::BamChunker::new(&mut stream, path);
            while let Some(data) = bam.next_part(part_size)? {
                if !sink.push(Part { data }) {
                    // consumer stopped (budget spent or cancelled); unblock
                    // the reader and drop the remaining packs
                    pack_queue.ignore_rest();
                    return Ok(());
                }
            }
        } else {
            let mut reader = decoded_reader(compression, &mut stream);
            let mut chunker = Chunker::new(format, kmer_len);
            loop {
                let part = chunker
                    .next_part(&mut reader, part_size)
                    .map_err(|e| SeqError::io(&path, e))?;
                match part {
                    Some(data) => {
                        if !sink.push(Part { data }) {
                            pack_queue.ignore_rest();
                            return Ok(());
                        }
                    }
                    None => break,
                }
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queues::{InputFilesQueue, Queue};

    #[test]
    fn reader_tokenizer_roundtrip_test() {
        let dir = std::env::temp_dir().join("counter_input_test");
        ktio::fops::create_directory(&dir).unwrap();
        let path = dir.join("reads.fq");
        let payload = b"@r1\nACGT\n+\n!!!!\n@r2\nGGCC\n+\n####\n";
        std::fs::write(&path, payload).unwrap();

        let files = InputFilesQueue::new(vec![path.display().to_string()]);
        let pool = BlockPool::new(4, 16);
        let packs: BinaryPackQueue = Queue::bounded(8, 1);
        let parts: PartQueue = Queue::bounded(8, 1);
        let cancel = Cancel::new();

        std::thread::scope(|scope| {
            scope.spawn(|| {
                reader_loop(&files, &packs, &pool, &cancel).unwrap();
                packs.mark_completed();
            });
            scope.spawn(|| {
                tokenizer_loop(
                    &packs,
                    PartSink::Main(&parts),
                    SeqFormat::Fastq,
                    3,
                    16,
                    &cancel,
                )
                .unwrap();
                parts.mark_completed();
            });
            let mut all = Vec::new();
            while let Some(p) = parts.pop() {
                all.extend(p.data);
            }
            assert_eq!(all, payload);
        });
        ktio::fops::delete_file_if_exists(&path).unwrap();
    }
}
