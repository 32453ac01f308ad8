pub mod bgzf;
pub mod chunk;
pub mod decomp;
pub mod fops;
pub mod mmap;
pub mod seq;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SeqError {
    #[error("unable to open: {0}")]
    Open(String),
    #[error("unsupported input format: {0}")]
    Format(String),
    #[error("i/o error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("malformed compressed stream: {0}")]
    Decompress(String),
    #[error("malformed {format} record near byte {offset}")]
    Record { format: &'static str, offset: u64 },
    #[error("BAM end-of-file marker missing in {0}")]
    BamEof(String),
}

impl SeqError {
    pub fn io(path: impl AsRef<str>, source: std::io::Error) -> Self {
        SeqError::Io {
            path: path.as_ref().to_owned(),
            source,
        }
    }
}
