// src/error.rs
use ember_core::EmberError;
use std::io;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("password hashing failed: {0}")]
    Hash(String),

    #[error("user backend I/O error: {0}")]
    Backend(#[from] io::Error),

    #[error("malformed user record: {0}")]
    Malformed(String),

    #[error("no backend connection became free within {0:?}")]
    PoolExhausted(std::time::Duration),
}

impl From<AuthError> for EmberError {
    fn from(err: AuthError) -> Self {
        EmberError::Credential(err.to_string())
    }
}

pub type AuthResult<T> = Result<T, AuthError>;
