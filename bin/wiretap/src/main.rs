//! Wiretap command-line tool.
//!
//! Runs a tap between clients and a server, plus the echo server and client
//! used to try one out.
//!
//! # Examples
//!
//! ```bash
//! # Relay local port 15432 to a database, logging payloads
//! wiretap relay --remote-host db.internal --remote-port 5432 --local-port 15432 -v 2 --log-file tap.log
//!
//! # Same, from a config file
//! wiretap --config tap.yaml relay
//!
//! # Echo server that upper-cases everything
//! wiretap echo --port 9998 --transform upper
//!
//! # Send two messages and print the replies
//! wiretap send --port 9998 hello world
//!
//! # Validate a config file
//! wiretap check-config tap.yaml
//! ```

use anyhow::{Context, Result};
use clap::{Args as ClapArgs, Parser, Subcommand};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;
use wiretap::{CancellationToken, Tap, TapConfig, TapMode, Verbosity};
use wiretap_connectors::echo::{EchoClient, EchoConfig, EchoServer, Reply, Transform};

/// How long in-flight connections get after Ctrl-C before the process exits.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

#[derive(Debug, Parser)]
#[command(name = "wiretap")]
#[command(about = "Transparent TCP relay with message interception hooks")]
#[command(version)]
struct Args {
    /// YAML config file for the relay (flags override its values)
    #[arg(long, short = 'c', env = "WIRETAP_CONFIG", global = true)]
    config: Option<PathBuf>,

    /// Diagnostic log filter, e.g. "info" or "wiretap=debug" (RUST_LOG also applies)
    #[arg(long, default_value = "warn", global = true)]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Relay clients to a remote server
    Relay(RelayArgs),

    /// Run an echo server (a tap in sink mode)
    Echo {
        /// Port to listen on
        #[arg(long, short, default_value = "9998")]
        port: u16,

        /// Interface to bind
        #[arg(long, default_value = "0.0.0.0")]
        host: String,

        /// Transform mode: none, upper, lower, reverse
        #[arg(long, default_value = "none")]
        transform: Transform,

        /// Verbosity: 0 silent, 1 normal, 2 debug
        #[arg(long, short, default_value = "1")]
        verbose: u8,
    },

    /// Send messages and print each reply
    Send {
        /// Host to connect to
        #[arg(long, default_value = "localhost")]
        host: String,

        /// Port to connect to
        #[arg(long, short)]
        port: u16,

        /// Reply timeout in milliseconds (0 = wait forever)
        #[arg(long, default_value = "5000")]
        timeout: u64,

        /// Messages to send, one request each
        #[arg(required = true)]
        messages: Vec<String>,
    },

    /// Validate a config file and print the effective settings
    CheckConfig {
        /// Path to the YAML config
        path: PathBuf,
    },
}

#[derive(Debug, Default, ClapArgs)]
struct RelayArgs {
    /// Server host
    #[arg(long)]
    remote_host: Option<String>,

    /// Server port
    #[arg(long)]
    remote_port: Option<u16>,

    /// Port to listen on (default: the server port)
    #[arg(long, short = 'l')]
    local_port: Option<u16>,

    /// Interface to bind
    #[arg(long)]
    bind_host: Option<String>,

    /// Verbosity: 0 silent, 1 normal, 2 debug
    #[arg(long, short)]
    verbose: Option<u8>,

    /// Append events to this file
    #[arg(long)]
    log_file: Option<String>,

    /// Seconds to wait before each read so fragments coalesce
    #[arg(long)]
    defrag_delay: Option<f64>,

    /// Serve one connection at a time
    #[arg(long)]
    serial: bool,

    /// Cap on concurrently relayed connections
    #[arg(long)]
    max_parallel: Option<usize>,

    /// Rewrite client-to-server text: none, upper, lower, reverse
    #[arg(long)]
    send_transform: Option<Transform>,

    /// Rewrite server-to-client text: none, upper, lower, reverse
    #[arg(long)]
    receive_transform: Option<Transform>,
}

/// Merge the config file (if any) with command-line flags.
fn build_relay_config(file: Option<TapConfig>, args: &RelayArgs) -> Result<TapConfig> {
    let mut config = match file {
        Some(config) => config,
        None => {
            let host = args
                .remote_host
                .clone()
                .context("--remote-host is required without a config file")?;
            let port = args
                .remote_port
                .context("--remote-port is required without a config file")?;
            TapConfig::relay(host, port)
        }
    };

    if let TapMode::Relay {
        remote_host,
        remote_port,
    } = &mut config.mode
    {
        if let Some(host) = &args.remote_host {
            *remote_host = host.clone();
        }
        if let Some(port) = args.remote_port {
            *remote_port = port;
        }
    }
    if let Some(port) = args.local_port {
        config.local_port = Some(port);
    }
    if let Some(host) = &args.bind_host {
        config.bind_host = host.clone();
    }
    if let Some(level) = args.verbose {
        config.verbosity = Verbosity::from(level);
    }
    if let Some(path) = &args.log_file {
        config.log_file = Some(path.clone());
    }
    if let Some(delay) = args.defrag_delay {
        config.defrag_delay_secs = delay;
    }
    if args.serial {
        config.parallel = false;
    }
    if let Some(max) = args.max_parallel {
        config.max_parallel_connections = Some(max);
    }

    config.validate()?;
    Ok(config)
}

/// Serve `tap` until Ctrl-C.
async fn serve_until_ctrl_c(tap: &Tap) -> Result<()> {
    let shutdown = CancellationToken::new();
    let bound = tap.bind().await?;
    let mut server = tokio::spawn(bound.serve(shutdown.clone()));

    tokio::select! {
        result = &mut server => {
            return match result {
                Ok(result) => result.map_err(Into::into),
                Err(e) => Err(anyhow::anyhow!("accept loop panicked: {}", e)),
            };
        }
        signal = tokio::signal::ctrl_c() => {
            signal?;
            info!("Ctrl-C received, shutting down");
        }
    }

    shutdown.cancel();
    if tokio::time::timeout(SHUTDOWN_GRACE, server).await.is_err() {
        error!("Accept loop did not stop in time");
    }
    Ok(())
}

async fn cmd_relay(config_path: Option<PathBuf>, args: RelayArgs) -> Result<()> {
    let file = config_path
        .map(|path| {
            TapConfig::load(&path).with_context(|| format!("Failed to load {}", path.display()))
        })
        .transpose()?;
    let config = build_relay_config(file, &args)?;

    info!(
        local = %config.bind_address(),
        remote = ?config.remote_address(),
        parallel = config.parallel,
        "Starting relay"
    );

    let tap = Tap::from_config(config)?;
    if let Some(transform) = args.send_transform {
        tap.send_callback(transform.callback());
    }
    if let Some(transform) = args.receive_transform {
        tap.receive_callback(transform.callback());
    }

    serve_until_ctrl_c(&tap).await
}

async fn cmd_echo(host: String, port: u16, transform: Transform, verbose: u8) -> Result<()> {
    info!(host = %host, port = port, transform = %transform, "Starting echo server");

    let server = EchoServer::new(EchoConfig::new(host, port).with_transform(transform))?;
    server.tap().verbose(verbose);

    println!("Echo server on port {} (transform: {}). Ctrl+C to exit.", port, transform);
    serve_until_ctrl_c(server.tap()).await
}

async fn cmd_send(host: String, port: u16, timeout: u64, messages: Vec<String>) -> Result<()> {
    let config = EchoConfig::client(host, port).with_read_timeout(timeout);
    let mut client = EchoClient::connect(config).await?;

    for message in &messages {
        match client.send_and_receive(message).await? {
            Reply::Message(bytes) => println!("{}", String::from_utf8_lossy(&bytes)),
            Reply::Disconnected => {
                println!("(disconnected)");
                return Ok(());
            }
        }
    }

    client.disconnect().await
}

fn cmd_check_config(path: PathBuf) -> Result<()> {
    let config =
        TapConfig::load(&path).with_context(|| format!("Failed to load {}", path.display()))?;

    println!("Config OK: {}", path.display());
    println!("  Listen:    {}", config.bind_address());
    println!(
        "  Target:    {}",
        config.remote_address().as_deref().unwrap_or("sink")
    );
    println!("  Verbosity: {}", config.verbosity.level());
    println!("  Parallel:  {}", config.parallel);
    println!("  Defrag:    {}s", config.defrag_delay_secs);
    println!(
        "  Log file:  {}",
        config.log_file.as_deref().unwrap_or("(none)")
    );
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(EnvFilter::from_default_env().add_directive(args.log_level.parse()?))
        .init();

    match args.command {
        Command::Relay(relay) => {
            cmd_relay(args.config, relay).await?;
        }
        Command::Echo {
            port,
            host,
            transform,
            verbose,
        } => {
            cmd_echo(host, port, transform, verbose).await?;
        }
        Command::Send {
            host,
            port,
            timeout,
            messages,
        } => {
            cmd_send(host, port, timeout, messages).await?;
        }
        Command::CheckConfig { path } => {
            cmd_check_config(path)?;
        }
    }

    Ok(())
}
