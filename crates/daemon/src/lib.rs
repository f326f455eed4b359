//! # Shellwire Daemon Library
//!
//! Command-line front end for the `session` engine: an echo server that
//! accepts password-authenticated connections over TCP, and a client that
//! talks to it.
//!
//! ## Modules
//!
//! - [`config`]: TOML configuration with environment overrides
//! - [`host_key`]: persistent server host key
//! - [`net`]: tokio TCP transport and async drivers
//! - [`server`]: task-per-connection echo server
//! - [`client`]: echo client
//!
//! ## Example
//!
//! ```no_run
//! use daemon::config::Config;
//! use daemon::server::EchoServer;
//! use tokio::net::TcpListener;
//!
//! # #[tokio::main]
//! # async fn main() -> anyhow::Result<()> {
//! let config = Config::load_default()?;
//! let identity = daemon::host_key::load_or_generate(&config.daemon.host_key_path)?;
//! let listener = TcpListener::bind(config.listen_addr()?).await?;
//! EchoServer::new(&config, identity).run(listener).await?;
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod config;
pub mod host_key;
pub mod net;
pub mod server;

pub use config::Config;
pub use server::{EchoServer, EchoSummary};
