// src/core/errors.rs

//! Defines the primary error type for the entire application.

use std::sync::Arc;
use thiserror::Error;

/// The main error enum, representing all possible failures within the proxy.
/// Using `thiserror` allows for clean error definitions and automatic `From` trait implementations.
#[derive(Error, Debug, Clone)]
pub enum ProxyError {
    #[error("IO Error: {0}")]
    Io(Arc<std::io::Error>),

    #[error("The request wasn't saved in the cache")]
    ItemNotFound,

    #[error("Data is smaller than the range requested")]
    WrongRange,

    #[error("The disk items are immutable")]
    ItemDiskWrite,

    #[error("The bytes read don't match with the body size definition")]
    ReadingItemDisk,

    #[error("The ttl is out of the possible ranges")]
    InvalidTtl,

    #[error("Invalid range")]
    InvalidRange,

    #[error("No range")]
    NoRange,

    #[error("Header parse error: {0}")]
    HeaderParse(String),

    #[error("Backend error: {0}")]
    Backend(String),

    #[error("Rate limited")]
    RateLimited,

    #[error("Config error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<std::io::Error> for ProxyError {
    fn from(err: std::io::Error) -> Self {
        ProxyError::Io(Arc::new(err))
    }
}

impl From<toml::de::Error> for ProxyError {
    fn from(err: toml::de::Error) -> Self {
        ProxyError::Config(err.to_string())
    }
}

impl From<humantime::DurationError> for ProxyError {
    fn from(err: humantime::DurationError) -> Self {
        ProxyError::Config(err.to_string())
    }
}
