use crate::SeqError;
use bio::io::fasta::{Reader as FastaReader, Records as FastaRecords};
use bio::io::fastq::{Reader as FastqReader, Records as FastqRecords};
use std::fs::File;
use std::io::{self, BufRead, BufReader, Read};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeqFormat {
    /// FASTA with one sequence line per record
    Fasta,
    /// FASTA with sequences spanning many lines, split on `>` only
    MultiFasta,
    Fastq,
    Bam,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compression {
    Plain,
    Gzip,
    Bzip2,
}

impl Compression {
    pub fn get(path: &str) -> Compression {
        if path.ends_with(".gz") {
            Compression::Gzip
        } else if path.ends_with(".bz2") {
            Compression::Bzip2
        } else {
            Compression::Plain
        }
    }

    pub fn strip(path: &str) -> &str {
        path.trim_end_matches(".gz").trim_end_matches(".bz2")
    }
}

impl SeqFormat {
    pub fn get(path: &str) -> Option<SeqFormat> {
        let path = Compression::strip(path);
        if path.ends_with(".fq") || path.ends_with(".fastq") {
            return Some(SeqFormat::Fastq);
        } else if path.ends_with(".fasta") || path.ends_with(".fa") || path.ends_with(".fna") {
            return Some(SeqFormat::Fasta);
        } else if path.ends_with(".bam") {
            return Some(SeqFormat::Bam);
        }
        None
    }
}

// Record set entries of type R, which implement BufRead trait (stdin/file)
pub enum RecordSet<R: BufRead> {
    Fasta(FastaRecords<BufReader<R>>),
    Fastq(FastqRecords<BufReader<R>>),
}

pub struct Sequence {
    pub n: usize,
    pub id: String,
    pub seq: Vec<u8>,
}

pub struct SeqStats {
    pub seq_count: usize,
    pub total_length: usize,
}

/// High-level record iterator used by the dump path and as a test oracle.
/// The counting pipeline itself reads files through the pack/chunk layer.
pub struct Sequences<R: BufRead> {
    pub current_record: usize,
    pub records: RecordSet<R>,
}

impl<R: BufRead> Sequences<R> {
    pub fn new(format: SeqFormat, reader: R) -> Result<Self, SeqError> {
        match format {
            SeqFormat::Fastq => {
                let fastq_reader = FastqReader::new(reader);
                Ok(Sequences {
                    current_record: 0,
                    records: RecordSet::Fastq(fastq_reader.records()),
                })
            }
            SeqFormat::Fasta | SeqFormat::MultiFasta => {
                let fasta_reader = FastaReader::new(reader);
                Ok(Sequences {
                    current_record: 0,
                    records: RecordSet::Fasta(fasta_reader.records()),
                })
            }
            SeqFormat::Bam => Err(SeqError::Format(
                "BAM records are only consumed by the counting pipeline".to_owned(),
            )),
        }
    }

    pub fn seq_stats(format: SeqFormat, reader: R) -> Result<SeqStats, SeqError> {
        let mut total_length = 0_usize;
        let mut seq_count = 0_usize;

        for record in Sequences::new(format, reader)? {
            total_length += record.seq.len();
            seq_count += 1;
        }

        Ok(SeqStats {
            seq_count,
            total_length,
        })
    }
}

impl<R: BufRead> Iterator for Sequences<R> {
    type Item = Sequence;

    fn next(&mut self) -> Option<Self::Item> {
        // records do not have a common trait to get id and seq, match instead
        match self.records {
            RecordSet::Fastq(ref mut records) => {
                let record = records.next()?.ok()?;
                self.current_record += 1;
                Some(Sequence {
                    n: self.current_record - 1,
                    id: record.id().to_string(),
                    seq: record.seq().to_vec(),
                })
            }
            RecordSet::Fasta(ref mut records) => {
                let record = records.next()?.ok()?;
                self.current_record += 1;
                Some(Sequence {
                    n: self.current_record - 1,
                    id: record.id().to_string(),
                    seq: record.seq().to_vec(),
                })
            }
        }
    }
}

pub fn get_reader(path: &str) -> Result<BufReader<Box<dyn Read + Sync + Send>>, SeqError> {
    if path == "-" {
        let stdin = io::stdin();
        return Ok(BufReader::new(Box::new(stdin)));
    }
    let file = File::open(path).map_err(|_| SeqError::Open(path.to_owned()))?;
    match Compression::get(path) {
        Compression::Gzip => {
            let decoder = flate2::read::MultiGzDecoder::new(file);
            Ok(BufReader::new(Box::new(decoder)))
        }
        Compression::Bzip2 => {
            let decoder = bzip2::read::MultiBzDecoder::new(file);
            Ok(BufReader::new(Box::new(decoder)))
        }
        Compression::Plain => Ok(BufReader::new(Box::new(file))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_detect_test() {
        assert!(matches!(SeqFormat::get("x.fq.gz"), Some(SeqFormat::Fastq)));
        assert!(matches!(SeqFormat::get("x.fasta"), Some(SeqFormat::Fasta)));
        assert!(matches!(SeqFormat::get("x.fna.bz2"), Some(SeqFormat::Fasta)));
        assert!(matches!(SeqFormat::get("x.bam"), Some(SeqFormat::Bam)));
        assert!(SeqFormat::get("x.txt").is_none());
    }

    #[test]
    fn compression_detect_test() {
        assert_eq!(Compression::get("a.fq.gz"), Compression::Gzip);
        assert_eq!(Compression::get("a.fq.bz2"), Compression::Bzip2);
        assert_eq!(Compression::get("a.fq"), Compression::Plain);
    }

    #[test]
    fn load_fa_stdin_test() {
        let input = ">Record_1\nACGTACGTACGT";
        let reader = BufReader::new(input.as_bytes());
        let mut seqs = Sequences::new(SeqFormat::Fasta, reader).unwrap();
        let record_1 = seqs.next().unwrap();
        assert_eq!("Record_1", record_1.id);
        assert_eq!(b"ACGTACGTACGT".to_vec(), record_1.seq);
        assert!(seqs.next().is_none());
    }

    #[test]
    fn load_fq_test() {
        let input = "@Read_1\nACGT\n+\n!!!!\n@Read_2\nGGCC\n+\n####\n";
        let reader = BufReader::new(input.as_bytes());
        let seqs: Vec<_> = Sequences::new(SeqFormat::Fastq, reader).unwrap().collect();
        assert_eq!(seqs.len(), 2);
        assert_eq!(seqs[1].seq, b"GGCC".to_vec());
    }
}
