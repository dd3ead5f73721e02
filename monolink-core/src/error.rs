use std::io;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("invalid config: {0}")]
    Config(String),
    #[error("bind error: {0}")]
    Bind(#[source] io::Error),
    #[error("conn closed")]
    ConnectionClosed,
    #[error("write blocking")]
    WriteBlocking,
    #[error("Io error: {0}")]
    Io(#[from] io::Error),
}

impl Error {
    /// Capacity errors leave the connection alive, the caller may retry.
    pub fn is_blocking(&self) -> bool {
        matches!(self, Error::WriteBlocking)
    }

    pub fn is_closed(&self) -> bool {
        matches!(self, Error::ConnectionClosed)
    }
}
