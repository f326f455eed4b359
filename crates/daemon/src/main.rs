//! Shellwire
//!
//! Echo server and client for the Shellwire session protocol.

use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use daemon::config::{default_config_path, Config};
use daemon::server::EchoServer;
use daemon::{client, host_key};
use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::TcpListener;

/// Shellwire - encrypted remote shell sessions over TCP.
#[derive(Parser, Debug)]
#[command(name = "shellwire")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands.
#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Run the echo server
    Serve {
        /// Address to listen on (overrides the config file)
        #[arg(long, short, value_name = "ADDR")]
        listen: Option<String>,
    },

    /// Connect to a server and echo stdin, or a single message
    Connect {
        /// Server address (defaults to the configured listen address)
        address: Option<String>,

        /// User name to authenticate as
        #[arg(long, short)]
        user: Option<String>,

        /// Password to authenticate with
        #[arg(long, short)]
        password: Option<String>,

        /// Send this message, print the echo and exit
        #[arg(long, short)]
        message: Option<String>,

        /// Expected host key fingerprint (SHA256:...)
        #[arg(long, value_name = "FINGERPRINT")]
        pin: Option<String>,
    },

    /// Print the host key fingerprint, generating the key if needed
    Fingerprint,

    /// Write a configuration file with default values
    InitConfig {
        /// Overwrite an existing file
        #[arg(long, short)]
        force: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config_path = cli.config.clone().unwrap_or_else(default_config_path);

    let mut config = Config::load(&config_path)?;
    config.apply_env_overrides();

    // Initialize tracing
    let filter = if cli.verbose {
        "debug".to_string()
    } else {
        config.daemon.log_level.to_lowercase()
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();
    tracing::debug!(path = %config_path.display(), "Configuration loaded");

    match cli.command {
        Commands::Serve { listen } => {
            if let Some(listen) = listen {
                config.server.listen = listen;
            }
            config.validate()?;
            serve(&config).await
        }
        Commands::Connect {
            address,
            user,
            password,
            message,
            pin,
        } => {
            if let Some(user) = user {
                config.client.username = user;
            }
            if password.is_some() {
                config.client.password = password;
            }
            if pin.is_some() {
                config.session.expected_host_key = pin;
            }
            config.validate()?;
            let address = address.unwrap_or_else(|| config.server.listen.clone());
            connect(&config, &address, message.as_deref()).await
        }
        Commands::Fingerprint => {
            config.validate()?;
            let identity = host_key::load_or_generate(&config.daemon.host_key_path)?;
            println!("{}", identity.fingerprint());
            Ok(())
        }
        Commands::InitConfig { force } => {
            if config_path.exists() && !force {
                anyhow::bail!(
                    "{} already exists; use --force to overwrite",
                    config_path.display()
                );
            }
            Config::default().save(&config_path)?;
            println!("Wrote {}", config_path.display());
            Ok(())
        }
    }
}

async fn serve(config: &Config) -> Result<()> {
    if config.server.users.is_empty() {
        tracing::warn!("No users configured; every authentication attempt will be rejected");
    }

    let identity = host_key::load_or_generate(&config.daemon.host_key_path)?;
    let addr = config.listen_addr()?;
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {addr}"))?;

    EchoServer::new(config, identity).run(listener).await
}

async fn connect(config: &Config, address: &str, message: Option<&str>) -> Result<()> {
    let addr = resolve(address).await?;
    let mut conn = client::connect(addr, config).await?;

    let mut stdout = tokio::io::stdout();
    match message {
        Some(message) => {
            let reply = client::echo(&mut conn, message.as_bytes()).await?;
            stdout.write_all(&reply).await?;
            stdout.write_all(b"\n").await?;
            stdout.flush().await?;
        }
        None => {
            let stdin = BufReader::new(tokio::io::stdin());
            client::relay(&mut conn, stdin, &mut stdout).await?;
        }
    }

    let stats = conn.stats();
    conn.shutdown().context("Failed to shut down connection")?;
    tracing::debug!(
        tx_bytes = stats.tx_bytes,
        rx_bytes = stats.rx_bytes,
        key_exchanges = conn.key_exchanges(),
        "Disconnected"
    );
    Ok(())
}

async fn resolve(address: &str) -> Result<SocketAddr> {
    tokio::net::lookup_host(address)
        .await
        .with_context(|| format!("Failed to resolve {address}"))?
        .next()
        .with_context(|| format!("No addresses found for {address}"))
}
