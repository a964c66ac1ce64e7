use std::{net::SocketAddr, time::Duration};

use anyhow::{ensure, Context};
use axum::http::HeaderValue;
use callbox_core::negotiation::DEFAULT_MAX_PENDING_CANDIDATES;
use clap::{Args, Parser, Subcommand};

const DEFAULT_LISTEN_ADDR: &str = "0.0.0.0:5000";
const DEFAULT_OUTBOUND_BUFFER: usize = 256;

#[derive(Debug, Parser)]
#[command(
    name = "callbox-server",
    author,
    version,
    about = "Signaling relay for one-to-one WebRTC calls"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,

    #[command(flatten)]
    pub server: ServerArgs,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Connect to a running relay, register, and print the user list.
    Probe(ProbeArgs),
}

#[derive(Debug, Args)]
pub struct ServerArgs {
    /// Address to bind the HTTP and websocket listener to.
    #[arg(long, env = "CALLBOX_LISTEN_ADDR", default_value = DEFAULT_LISTEN_ADDR)]
    pub listen_addr: String,

    /// Comma-separated list of allowed CORS origins, or `*`.
    #[arg(long, env = "CALLBOX_ALLOWED_ORIGINS", default_value = "*")]
    pub allowed_origins: String,

    /// ICE candidates held per direction while a call is ringing.
    #[arg(
        long,
        env = "CALLBOX_MAX_PENDING_CANDIDATES",
        default_value_t = DEFAULT_MAX_PENDING_CANDIDATES
    )]
    pub max_pending_candidates: usize,

    /// Frames buffered per connection before delivery to it fails.
    #[arg(long, env = "CALLBOX_OUTBOUND_BUFFER", default_value_t = DEFAULT_OUTBOUND_BUFFER)]
    pub outbound_buffer: usize,

    /// Grace period applied during shutdown.
    #[arg(long, env = "CALLBOX_SHUTDOWN_GRACE_SECS", default_value_t = 2)]
    pub shutdown_grace_secs: u64,
}

#[derive(Debug, Args)]
pub struct ProbeArgs {
    /// Relay websocket endpoint.
    #[arg(long, default_value = "ws://127.0.0.1:5000/ws")]
    pub url: String,

    /// User id to register with (random when omitted).
    #[arg(long)]
    pub user_id: Option<String>,

    #[arg(long, default_value = "callbox probe")]
    pub display_name: String,

    /// Give up after this many seconds.
    #[arg(long, default_value_t = 5)]
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AllowedOrigins {
    Any,
    List(Vec<HeaderValue>),
}

impl AllowedOrigins {
    fn parse(raw: &str) -> anyhow::Result<Self> {
        let entries: Vec<&str> = raw
            .split(',')
            .map(str::trim)
            .filter(|entry| !entry.is_empty())
            .collect();
        if entries.is_empty() || entries.contains(&"*") {
            return Ok(AllowedOrigins::Any);
        }
        let origins = entries
            .into_iter()
            .map(|origin| {
                HeaderValue::from_str(origin)
                    .with_context(|| format!("invalid allowed origin: {origin}"))
            })
            .collect::<anyhow::Result<Vec<_>>>()?;
        Ok(AllowedOrigins::List(origins))
    }
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub listen_addr: SocketAddr,
    pub allowed_origins: AllowedOrigins,
    pub max_pending_candidates: usize,
    pub outbound_buffer: usize,
    pub shutdown_grace: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 5000)),
            allowed_origins: AllowedOrigins::Any,
            max_pending_candidates: DEFAULT_MAX_PENDING_CANDIDATES,
            outbound_buffer: DEFAULT_OUTBOUND_BUFFER,
            shutdown_grace: Duration::from_secs(2),
        }
    }
}

impl TryFrom<ServerArgs> for ServerConfig {
    type Error = anyhow::Error;

    fn try_from(args: ServerArgs) -> Result<Self, Self::Error> {
        let listen_addr: SocketAddr = args
            .listen_addr
            .parse()
            .with_context(|| format!("invalid listen address: {}", args.listen_addr))?;
        ensure!(
            args.max_pending_candidates > 0,
            "max pending candidates must be at least 1"
        );
        ensure!(args.outbound_buffer > 0, "outbound buffer must be at least 1");

        Ok(ServerConfig {
            listen_addr,
            allowed_origins: AllowedOrigins::parse(&args.allowed_origins)?,
            max_pending_candidates: args.max_pending_candidates,
            outbound_buffer: args.outbound_buffer,
            shutdown_grace: Duration::from_secs(args.shutdown_grace_secs),
        })
    }
}
