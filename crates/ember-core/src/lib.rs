// src/lib.rs
pub mod buffer;
pub mod config;
pub mod context;
pub mod credentials;
pub mod error;
pub mod http;
pub mod logging;
pub mod metrics;
pub mod pool;
pub mod reactor;
pub mod resource;
pub mod server;
pub mod slab;
pub mod syscalls;
pub mod timer;

// Re-exports for users
pub use config::ServerConfig;
pub use context::ServerContext;
pub use credentials::{CredentialStore, InMemoryCredentials};
pub use error::{EmberError, EmberResult};
pub use pool::{PoolConfig, WorkerPool};
pub use reactor::{Notifier, Reactor};
pub use server::{Server, ServerHandle};
pub use timer::TimerHeap;
