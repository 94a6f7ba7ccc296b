use thiserror::Error;

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Sled error: {0}")]
    SledError(String),

    #[error("Codec error: {0}")]
    CodecError(String),

    #[error("Storage quota exceeded: at most {limit} pending operations")]
    QuotaExceeded { limit: usize },

    #[error("Corrupt record: {0}")]
    CorruptRecord(String),
}

pub(crate) fn sled_err(e: sled::Error) -> StorageError {
    StorageError::SledError(e.to_string())
}
