use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum};
use ember_auth::{ConnPool, FileBackend, UserStore};
use ember_core::logging::{init_logging_json, init_logging_pretty, init_logging_with_level};
use ember_core::{CredentialStore, Server, ServerConfig};
use std::path::PathBuf;
use tracing::info;

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[derive(Parser)]
#[command(name = "ember")]
#[command(about = "Edge-triggered static file server with form login")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    #[command(flatten)]
    serve: ServeArgs,

    /// Log output format
    #[arg(long, value_enum, default_value = "plain", global = true)]
    log_format: LogFormat,

    /// Default log level when RUST_LOG is unset
    #[arg(long, default_value = "info", global = true)]
    log_level: String,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the server (default)
    Serve,
    /// Add a user to the users file
    AddUser {
        /// Users file to append to
        #[arg(long, env = "EMBER_USERS_FILE")]
        users_file: PathBuf,
        name: String,
        password: String,
    },
}

#[derive(clap::Args)]
struct ServeArgs {
    /// Listen host
    #[arg(long, env = "EMBER_HOST")]
    host: Option<String>,

    /// Listen port
    #[arg(short, long, env = "EMBER_PORT")]
    port: Option<u16>,

    /// Directory served as the site root
    #[arg(long, env = "EMBER_ROOT")]
    root: Option<PathBuf>,

    /// Idle sweep interval in seconds
    #[arg(long, env = "EMBER_TICK_SECS")]
    tick_secs: Option<u64>,

    /// Maximum concurrent connections
    #[arg(long, env = "EMBER_MAX_CONNECTIONS")]
    max_connections: Option<usize>,

    /// Workers kept when idle
    #[arg(long, env = "EMBER_MIN_WORKERS")]
    min_workers: Option<usize>,

    /// Upper bound on workers
    #[arg(long, env = "EMBER_MAX_WORKERS")]
    max_workers: Option<usize>,

    /// Flat user file (in-memory users when unset)
    #[arg(long, env = "EMBER_USERS_FILE")]
    users_file: Option<PathBuf>,
}

#[derive(Clone, Copy, ValueEnum)]
enum LogFormat {
    Plain,
    Pretty,
    Json,
}

impl ServeArgs {
    fn apply(self, config: &mut ServerConfig) {
        if let Some(host) = self.host {
            config.host = host;
        }
        if let Some(port) = self.port {
            config.port = port;
        }
        if let Some(root) = self.root {
            config.root = root;
        }
        if let Some(tick) = self.tick_secs {
            config.tick_secs = tick;
        }
        if let Some(max) = self.max_connections {
            config.max_connections = max;
        }
        if let Some(min) = self.min_workers {
            config.min_workers = min;
            config.max_workers = config.max_workers.max(min);
        }
        if let Some(max) = self.max_workers {
            config.max_workers = max;
        }
        if self.users_file.is_some() {
            config.users_file = self.users_file;
        }
    }
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.log_format {
        LogFormat::Plain => init_logging_with_level(&cli.log_level),
        LogFormat::Pretty => init_logging_pretty(),
        LogFormat::Json => init_logging_json(),
    }

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => serve(cli.serve),
        Commands::AddUser {
            users_file,
            name,
            password,
        } => add_user(users_file, &name, &password),
    }
}

fn serve(args: ServeArgs) -> anyhow::Result<()> {
    let mut config = ServerConfig::from_env();
    args.apply(&mut config);
    config.validate().context("invalid configuration")?;

    let store = ember_auth::open_store(config.users_file.as_deref(), config.user_pool_size)
        .context("opening the user store")?;

    Server::new(config)?.credentials(store).serve()?;
    info!("ember stopped");
    Ok(())
}

fn add_user(users_file: PathBuf, name: &str, password: &str) -> anyhow::Result<()> {
    let store = UserStore::new(ConnPool::new(vec![FileBackend::new(&users_file)]))
        .with_context(|| format!("reading {}", users_file.display()))?;
    if !store.insert(name, password)? {
        anyhow::bail!("user {:?} already exists", name);
    }
    println!("Added {} to {}", name, users_file.display());
    Ok(())
}
