use std::io;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DizError {
    /// The container is not a readable archive, or one of its trailers is
    /// missing or corrupt.
    #[error("malformed container: {0}")]
    Format(String),

    #[error("entry already exists: {0}")]
    EntryExists(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("invalid digest: {0}")]
    InvalidDigest(String),

    #[error("oci spec error: {0}")]
    OciSpec(#[from] oci_spec::OciSpecError),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

impl DizError {
    pub fn format(msg: impl Into<String>) -> Self {
        DizError::Format(msg.into())
    }
}

impl From<DizError> for io::Error {
    fn from(err: DizError) -> Self {
        match err {
            DizError::Io(err) => err,
            other => io::Error::other(other),
        }
    }
}

pub type Result<T> = std::result::Result<T, DizError>;
