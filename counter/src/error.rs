use thiserror::Error;

#[derive(Debug, Error)]
pub enum CounterError {
    #[error("input error: {0}")]
    Input(#[from] ktio::SeqError),
    #[error("temporary file error on {path}: {source}")]
    Temp {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("output error on {path}: {source}")]
    Output {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("out of memory: {0}")]
    Memory(String),
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("internal invariant violated: {0}")]
    Internal(String),
}

impl CounterError {
    pub fn temp(path: impl std::fmt::Display, source: std::io::Error) -> Self {
        CounterError::Temp {
            path: path.to_string(),
            source,
        }
    }

    pub fn output(path: impl std::fmt::Display, source: std::io::Error) -> Self {
        CounterError::Output {
            path: path.to_string(),
            source,
        }
    }
}

pub type Result<T> = std::result::Result<T, CounterError>;
