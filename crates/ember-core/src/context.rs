// src/context.rs
use crate::credentials::{CredentialStore, InMemoryCredentials};
use crate::metrics::ServerMetrics;
use crate::resource::FileStore;
use std::sync::Arc;

pub const DEFAULT_READ_BUFFER: usize = 2048;
pub const DEFAULT_WRITE_BUFFER: usize = 1024;

/// State shared by the reactor and every worker of one server instance.
pub struct ServerContext {
    pub files: FileStore,
    pub credentials: Arc<dyn CredentialStore>,
    pub metrics: ServerMetrics,
    pub read_buffer_size: usize,
    pub write_buffer_size: usize,
}

impl ServerContext {
    pub fn new(files: FileStore, credentials: Arc<dyn CredentialStore>) -> Self {
        Self {
            files,
            credentials,
            metrics: ServerMetrics::new(),
            read_buffer_size: DEFAULT_READ_BUFFER,
            write_buffer_size: DEFAULT_WRITE_BUFFER,
        }
    }

    /// Context over `root` with an empty in-memory user table.
    pub fn with_root(root: impl Into<std::path::PathBuf>) -> Self {
        Self::new(FileStore::new(root), Arc::new(InMemoryCredentials::new()))
    }

    pub fn buffers(mut self, read: usize, write: usize) -> Self {
        self.read_buffer_size = read;
        self.write_buffer_size = write;
        self
    }
}

impl std::fmt::Debug for ServerContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerContext")
            .field("files", &self.files)
            .field("read_buffer_size", &self.read_buffer_size)
            .field("write_buffer_size", &self.write_buffer_size)
            .finish_non_exhaustive()
    }
}
