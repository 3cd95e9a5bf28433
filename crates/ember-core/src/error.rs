// src/error.rs
use crate::http::parser::ParseError;
use std::io;
use thiserror::Error;

/// Central error type for the ember engine.
#[derive(Debug, Error)]
pub enum EmberError {
    /// Underlying I/O error from the OS or network.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Malformed HTTP request.
    #[error("parse error: {0}")]
    Parse(#[from] ParseError),

    /// The connection table reached its maximum capacity.
    #[error("connection table is full")]
    SlabFull,

    /// The worker pool no longer accepts tasks.
    #[error("worker pool is stopped")]
    PoolStopped,

    /// A fixed-size buffer could not take the whole append.
    #[error("buffer is full")]
    BufferFull,

    /// Invalid server configuration.
    #[error("configuration error: {0}")]
    Config(String),

    /// The credential store failed.
    #[error("credential store error: {0}")]
    Credential(String),

    /// A background worker or task panicked.
    #[error("worker panic: {0}")]
    WorkerPanic(String),
}

pub type EmberResult<T> = Result<T, EmberError>;
