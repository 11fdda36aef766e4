use std::fmt;
use std::io;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PargzError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Out of range: {0}")]
    OutOfRange(String),

    #[error("Invalid gzip header: {0}")]
    InvalidHeader(String),

    #[error("Invalid code lengths in precode")]
    InvalidCodeLengths,

    #[error("Bloating Huffman coding in precode")]
    BloatingHuffmanCoding,

    #[error("Decode error: {0}")]
    Decode(String),

    /// The task backing a result handle was discarded before it ran,
    /// e.g. because the thread pool was stopped with the task still queued.
    #[error("Task was dropped before producing a result")]
    BrokenTask,

    #[error("Internal logic error: {0}")]
    Logic(String),
}

impl PargzError {
    pub fn invalid_argument<T: fmt::Display>(msg: T) -> Self {
        PargzError::InvalidArgument(msg.to_string())
    }

    pub fn out_of_range<T: fmt::Display>(msg: T) -> Self {
        PargzError::OutOfRange(msg.to_string())
    }

    pub fn invalid_header<T: fmt::Display>(msg: T) -> Self {
        PargzError::InvalidHeader(msg.to_string())
    }

    pub fn decode<T: fmt::Display>(msg: T) -> Self {
        PargzError::Decode(msg.to_string())
    }

    pub fn logic<T: fmt::Display>(msg: T) -> Self {
        PargzError::Logic(msg.to_string())
    }
}

pub type PargzResult<T> = Result<T, PargzError>;
