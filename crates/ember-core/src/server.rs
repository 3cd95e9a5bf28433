// src/server.rs
use crate::config::ServerConfig;
use crate::context::ServerContext;
use crate::credentials::{CredentialStore, InMemoryCredentials};
use crate::error::{EmberError, EmberResult};
use crate::reactor::{Notifier, Reactor, SIG_STOP, SIG_TICK};
use crate::resource::FileStore;
use crate::syscalls;
use signal_hook::consts::{SIGALRM, SIGINT, SIGTERM};
use signal_hook::iterator::Signals;
use std::net::SocketAddr;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{info, warn};

pub struct Server {
    config: ServerConfig,
    credentials: Arc<dyn CredentialStore>,
}

impl Server {
    pub fn new(config: ServerConfig) -> EmberResult<Self> {
        config.validate()?;
        Ok(Self {
            config,
            credentials: Arc::new(InMemoryCredentials::new()),
        })
    }

    /// Replaces the default in-memory user table.
    pub fn credentials(mut self, store: Arc<dyn CredentialStore>) -> Self {
        self.credentials = store;
        self
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    fn context(&self) -> Arc<ServerContext> {
        Arc::new(
            ServerContext::new(
                FileStore::new(self.config.root.clone()),
                Arc::clone(&self.credentials),
            )
            .buffers(self.config.read_buffer_size, self.config.write_buffer_size),
        )
    }

    fn launch(self, use_alarm: bool) -> EmberResult<ServerHandle> {
        let ctx = self.context();
        let mut reactor = Reactor::new(&self.config, Arc::clone(&ctx))?;
        reactor.use_alarm(use_alarm);
        let local_addr = reactor.local_addr()?;
        let notifier = reactor.notifier();

        info!(
            "Starting ember on {} (root {}, {}-{} workers)",
            local_addr,
            self.config.root.display(),
            self.config.min_workers,
            self.config.max_workers
        );

        let thread = thread::Builder::new()
            .name("ember-reactor".to_string())
            .spawn(move || reactor.run())?;

        Ok(ServerHandle {
            local_addr,
            notifier,
            ctx,
            thread: Some(thread),
        })
    }

    /// Runs the server on a background thread. Idle connections are swept
    /// once per tick without any process-wide signal handling.
    pub fn start(self) -> EmberResult<ServerHandle> {
        self.launch(false)
    }

    /// Runs the server until SIGTERM or SIGINT. SIGALRM drives the idle
    /// sweep and SIGPIPE is ignored.
    pub fn serve(self) -> EmberResult<()> {
        syscalls::ignore_sigpipe();
        let mut signals = Signals::new([SIGALRM, SIGTERM, SIGINT])?;
        let signals_handle = signals.handle();

        let handle = self.launch(true)?;
        let notifier = handle.notifier();
        let forwarder = thread::Builder::new()
            .name("ember-signals".to_string())
            .spawn(move || {
                for signal in signals.forever() {
                    let byte = if signal == SIGALRM { SIG_TICK } else { SIG_STOP };
                    if byte == SIG_STOP {
                        info!("Received signal {}, shutting down", signal);
                    }
                    if let Err(e) = notifier.send(byte) {
                        warn!("Forwarding signal {} failed: {}", signal, e);
                    }
                }
            })?;

        let result = handle.join();
        signals_handle.close();
        if forwarder.join().is_err() {
            warn!("signal forwarder panicked");
        }
        result
    }
}

/// A server running on its own reactor thread.
pub struct ServerHandle {
    local_addr: SocketAddr,
    notifier: Notifier,
    ctx: Arc<ServerContext>,
    thread: Option<JoinHandle<EmberResult<()>>>,
}

impl ServerHandle {
    /// Bound address; resolves an ephemeral port.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn notifier(&self) -> Notifier {
        self.notifier.clone()
    }

    pub fn context(&self) -> &Arc<ServerContext> {
        &self.ctx
    }

    /// Asks the reactor to stop. Returns immediately.
    pub fn shutdown(&self) -> EmberResult<()> {
        Ok(self.notifier.terminate()?)
    }

    /// Waits for the reactor thread to finish.
    pub fn join(mut self) -> EmberResult<()> {
        self.wait()
    }

    fn wait(&mut self) -> EmberResult<()> {
        match self.thread.take() {
            Some(thread) => thread
                .join()
                .map_err(|_| EmberError::WorkerPanic("reactor thread panicked".to_string()))?,
            None => Ok(()),
        }
    }
}

impl Drop for ServerHandle {
    fn drop(&mut self) {
        if self.thread.is_some() {
            if let Err(e) = self.notifier.terminate() {
                // The reactor never hears the stop byte; joining would hang
                warn!("Stopping the reactor failed: {}", e);
                return;
            }
            if let Err(e) = self.wait() {
                warn!("Reactor exited with error: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dropping_the_handle_stops_the_reactor() {
        let dir = tempfile::tempdir().unwrap();
        let config = ServerConfig {
            host: "127.0.0.1".to_string(),
            port: 0,
            root: dir.path().to_path_buf(),
            min_workers: 1,
            max_workers: 1,
            max_connections: 4,
            ..ServerConfig::default()
        };
        let handle = Server::new(config).unwrap().start().unwrap();
        let notifier = handle.notifier();
        drop(handle);
        // The reactor has exited and closed the read end of its pipe
        assert!(notifier.tick().is_err());
    }
}
