//! instant-relay — standalone relay for shared text sessions.
//!
//! Accepts WebSocket connections, assigns client ids and routes protocol
//! messages between them. Holds no document state.

use clap::Parser;
use log::info;

use instant_collab::server::{RelayServer, ServerConfig, DEFAULT_PORT};

/// Relay server for collaborative text editing.
#[derive(Parser, Debug)]
#[command(name = "instant-relay", version, about)]
struct Cli {
    /// Interface to listen on
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    /// Port to listen on
    #[arg(short, long, default_value_t = DEFAULT_PORT, env = "INSTANT_PORT")]
    port: u16,

    /// First client id handed out
    #[arg(long, default_value_t = 100)]
    base_client_id: u32,

    /// Per-connection outbound queue capacity
    #[arg(long, default_value_t = 256)]
    outbound_capacity: usize,
}

impl Cli {
    fn server_config(&self) -> ServerConfig {
        ServerConfig {
            bind_addr: format!("{}:{}", self.host, self.port),
            base_client_id: self.base_client_id,
            outbound_capacity: self.outbound_capacity,
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let server = RelayServer::bind(cli.server_config()).await?;
    info!("Starting instant-relay on {}", server.local_addr()?);

    tokio::select! {
        result = server.run() => result.map_err(|e| e as Box<dyn std::error::Error>)?,
        _ = tokio::signal::ctrl_c() => info!("Shutting down"),
    }
    Ok(())
}
