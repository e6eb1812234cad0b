use std::{
    fs::{self, File},
    path::PathBuf,
    process,
};

use clap::{ArgAction, Args, Parser, Subcommand};
use rpmspec_lsp_client::{
    transport::{self, InitialConnectPolicy},
    ClientConfig, ConnectOutcome, Extension, Result,
};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "rpmspec-lsp-client")]
#[command(about = "Connect to an RPM spec language server over TCP")]
struct Cli {
    #[command(flatten)]
    options: Options,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct Options {
    /// JSON configuration file
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Server host
    #[arg(long, global = true)]
    host: Option<String>,
    /// Server port
    #[arg(long, global = true)]
    port: Option<u16>,
    /// Delay before reconnecting after a close, in milliseconds
    #[arg(long, global = true)]
    reconnect_delay_ms: Option<u64>,
    /// Give up if the first connect attempt fails
    #[arg(long, global = true)]
    fail_fast: bool,
    /// Increase logging verbosity (warn, info, debug)
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,
    /// File to log to
    #[arg(long, global = true)]
    log_file: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Keep a client connected until interrupted
    Run,
    /// Try a single connection and report the outcome
    Probe,
}

const LOG_LEVELS: [&str; 3] = ["warn", "info", "debug"];

fn default_log_file() -> PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("rpmspec-lsp-client/client.log")
}

fn init_tracing(options: &Options) -> Result<()> {
    let path = options.log_file.clone().unwrap_or_else(default_log_file);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let log_file = File::create(&path)?;

    let level = LOG_LEVELS[usize::from(options.verbose).min(LOG_LEVELS.len() - 1)];
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("rpmspec_lsp_client={level}")));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(log_file)
        .with_ansi(false)
        .with_target(false)
        .init();
    Ok(())
}

fn load_config(options: &Options) -> Result<ClientConfig> {
    let mut config = match &options.config {
        Some(path) => ClientConfig::load(path)?,
        None => ClientConfig::default(),
    };
    if let Some(host) = &options.host {
        config.host.clone_from(host);
    }
    if let Some(port) = options.port {
        config.port = port;
    }
    if let Some(delay) = options.reconnect_delay_ms {
        config.reconnect_delay_ms = delay;
    }
    if options.fail_fast {
        config.initial_connect = InitialConnectPolicy::FailFast;
    }
    Ok(config)
}

async fn run(config: ClientConfig) -> Result<()> {
    let mut extension = Extension::new(config);
    extension.activate()?;
    eprintln!(
        "{} connecting to {}:{} (Ctrl-C to stop)",
        extension.config().display_name(),
        extension.config().host,
        extension.config().port
    );

    tokio::signal::ctrl_c().await?;
    extension.deactivate().await
}

async fn probe(config: &ClientConfig) -> Result<()> {
    let address = config.address();
    match transport::connect(&address).await {
        ConnectOutcome::Connected(stream) => {
            println!("connected to {address} ({})", stream.local_addr()?);
            Ok(())
        }
        ConnectOutcome::ConnectFailed(e) => Err(e.into()),
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    if let Err(e) = init_tracing(&cli.options) {
        eprintln!("Error: cannot set up logging: {e}");
        process::exit(1);
    }

    let result = match load_config(&cli.options) {
        Ok(config) => match cli.command {
            Commands::Run => run(config).await,
            Commands::Probe => probe(&config).await,
        },
        Err(e) => Err(e),
    };

    if let Err(e) = result {
        eprintln!("Error: {e}");
        process::exit(1);
    }
}
