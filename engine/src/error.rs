use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed frame: {0}")]
    MalformedFrame(String),

    #[error("unexpected field: {0}")]
    UnexpectedField(String),

    #[error("corrupt index: {0}")]
    CorruptIndex(String),

    #[error("compression error: {0}")]
    Compression(String),

    #[error("scan cancelled")]
    Cancelled,
}

impl Error {
    /// True for sidecar failures that a caller should treat as "no data"
    /// rather than aborting the whole chunk or scan.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::Io(e) if e.kind() == std::io::ErrorKind::NotFound)
    }
}
