use thiserror::Error;

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Deserialization error: {0}")]
    Deserialization(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Cache is full ({0} live entries)")]
    CapacityExceeded(usize),
}

pub type CacheResult<T> = Result<T, CacheError>;
