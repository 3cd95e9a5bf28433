//! Logging and tracing initialization for Ember.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use ember_core::{ServerConfig, Server, logging::init_logging};
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     // Initialize logging before the server spawns its threads
//!     init_logging();
//!
//!     let server = Server::new(ServerConfig::from_env())?;
//!     server.serve()?;
//!     Ok(())
//! }
//! ```
//!
//! ## Configuration
//!
//! The logging level can be controlled via the `RUST_LOG` environment variable:
//!
//! ```bash
//! # Per-connection lifecycle (accept, keep-alive reuse, eviction)
//! RUST_LOG=debug ember
//!
//! # Only warnings and errors (production)
//! RUST_LOG=warn ember
//!
//! # Fine-grained control
//! RUST_LOG=ember_core::pool=debug,ember_auth=warn ember
//! ```

use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

fn filter_or(level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level))
}

/// Initialize logging at `info`, overridable through `RUST_LOG`.
///
/// # Panics
///
/// This function will panic if a global subscriber is already set. Only call
/// it once at startup.
pub fn init_logging() {
    init_logging_with_level("info");
}

/// Initialize logging with a specific default level. `RUST_LOG` still wins
/// when it is set.
///
/// # Panics
///
/// This function will panic if called multiple times.
pub fn init_logging_with_level(level: &str) {
    tracing_subscriber::registry()
        .with(filter_or(level))
        .with(tracing_subscriber::fmt::layer().with_thread_names(true))
        .init();
}

/// Initialize pretty-formatted logging (recommended for development).
///
/// Thread names (`ember-reactor`, `ember-worker-N`, `ember-pool-manager`,
/// `ember-signals`) are shown next to each event.
///
/// # Panics
///
/// This function will panic if called multiple times.
pub fn init_logging_pretty() {
    tracing_subscriber::registry()
        .with(filter_or("info"))
        .with(
            tracing_subscriber::fmt::layer()
                .pretty()
                .with_line_number(true)
                .with_thread_names(true)
                .with_target(true),
        )
        .init();
}

/// Initialize JSON-formatted logging (recommended for production).
///
/// # Panics
///
/// This function will panic if called multiple times.
pub fn init_logging_json() {
    tracing_subscriber::registry()
        .with(filter_or("info"))
        .with(tracing_subscriber::fmt::layer().json().with_thread_names(true))
        .init();
}
