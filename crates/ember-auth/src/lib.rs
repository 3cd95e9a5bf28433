// src/lib.rs
pub mod backend;
pub mod error;
pub mod password;
pub mod pool;
pub mod store;

// Re-exports for users
pub use backend::{FileBackend, MemoryBackend, UserBackend};
pub use error::{AuthError, AuthResult};
pub use password::{hash_password, verify_password};
pub use pool::{ConnPool, PooledConn};
pub use store::UserStore;

use ember_core::CredentialStore;
use std::path::Path;
use std::sync::Arc;

/// Builds the credential store the server runs with: a flat user file when
/// `users_file` is set, otherwise an in-memory table.
pub fn open_store(
    users_file: Option<&Path>,
    pool_size: usize,
) -> AuthResult<Arc<dyn CredentialStore>> {
    let pool_size = pool_size.max(1);
    match users_file {
        Some(path) => {
            let backend = FileBackend::new(path);
            let pool = ConnPool::build(pool_size, || Ok(backend.clone()))?;
            Ok(Arc::new(UserStore::new(pool)?))
        }
        None => {
            let backend = MemoryBackend::new();
            let pool = ConnPool::build(pool_size, || Ok(backend.clone()))?;
            Ok(Arc::new(UserStore::new(pool)?))
        }
    }
}
