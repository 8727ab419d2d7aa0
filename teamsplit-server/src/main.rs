//! TeamSplit coordination server.
//!
//! Serves the shared match document over WebSocket. Set `RUST_LOG=info` (or
//! `debug`) to see claims, joins and assignments as they happen.

use clap::Parser;
use log::{error, info};
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use teamsplit_collab::server::{ServerConfig, SyncServer};
use teamsplit_collab::verification::VerificationConfig;

#[derive(Parser, Debug)]
#[command(author, version, about = "Match coordination server", long_about = None)]
struct Args {
    /// Address to listen on
    #[arg(long, default_value = "127.0.0.1:9090")]
    bind: String,

    /// Directory for the state snapshot; omit to keep state in memory
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Snapshots buffered per session before it is resynced
    #[arg(long, default_value_t = 256)]
    broadcast_capacity: usize,

    /// Optimistic write attempts before giving up
    #[arg(long, default_value_t = 16)]
    max_write_attempts: u32,

    /// Accept raw claims without a verification code
    #[arg(long)]
    no_verification: bool,

    /// Verification code lifetime in seconds
    #[arg(long, default_value_t = 300)]
    code_ttl_secs: u64,
}

impl Args {
    fn into_config(self) -> ServerConfig {
        ServerConfig {
            bind_addr: self.bind,
            broadcast_capacity: self.broadcast_capacity,
            max_write_attempts: self.max_write_attempts,
            require_verification: !self.no_verification,
            verification: VerificationConfig {
                code_ttl: Duration::from_secs(self.code_ttl_secs),
                ..VerificationConfig::default()
            },
            storage_path: self.data_dir,
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    env_logger::init();

    let config = Args::parse().into_config();
    match &config.storage_path {
        Some(dir) => info!("Persisting state under {}", dir.display()),
        None => info!("No --data-dir given; state is kept in memory only"),
    }

    let server = match SyncServer::new(config) {
        Ok(server) => server,
        Err(e) => {
            error!("Failed to open state: {e}");
            return ExitCode::FAILURE;
        }
    };

    if let Err(e) = server.run().await {
        error!("Server stopped: {e}");
        return ExitCode::FAILURE;
    }
    ExitCode::SUCCESS
}
