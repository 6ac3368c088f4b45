//! Command-line arguments and the configuration resolved from them.

use clap::{Parser, Subcommand};
use fsync_core::{DEFAULT_PORT, MAX_CHUNK_SIZE, PeerAddress, SyncConfig};
use std::path::PathBuf;
use std::time::Duration;

use crate::persistence::default_peers_path;

#[derive(Parser, Debug)]
#[command(name = "fsync")]
#[command(version, about = "Push the files a peer is missing over an encrypted LAN connection")]
pub struct Args {
    /// Directory to sync (flat, not recursive)
    #[arg(short, long, env = "FSYNC_DIR", default_value = ".", global = true)]
    pub dir: PathBuf,

    /// Peer list file
    #[arg(long, env = "FSYNC_PEERS_FILE", global = true)]
    pub peers_file: Option<PathBuf>,

    /// Seconds to wait on any network operation (0 waits forever)
    #[arg(long, env = "FSYNC_TIMEOUT", default_value_t = 30, global = true)]
    pub timeout: u64,

    /// Seconds to wait for the listener to accept or decline (0 waits forever)
    #[arg(long, env = "FSYNC_CONFIRM_TIMEOUT", default_value_t = 300, global = true)]
    pub confirm_timeout: u64,

    /// Enable verbose logging
    #[arg(long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Wait for one peer and receive the files it offers
    Listen {
        /// Port to listen on
        #[arg(short, long, default_value_t = DEFAULT_PORT)]
        port: u16,

        /// Address to bind
        #[arg(long, default_value = "0.0.0.0")]
        host: String,

        /// Accept every offer without prompting
        #[arg(short, long)]
        yes: bool,
    },

    /// Send files to one peer, or to every registered peer
    Sync {
        /// Peer as HOST or HOST:PORT (default: the registered peer list)
        #[arg(short, long)]
        peer: Option<PeerAddress>,

        /// File names or globs to offer (default: the whole directory)
        patterns: Vec<String>,
    },

    /// Add a peer to the peer list
    Register {
        host: String,
        #[arg(default_value_t = DEFAULT_PORT)]
        port: u16,
    },

    /// Print registered peers
    Peers,
}

/// Settings shared by every command.
#[derive(Debug, Clone)]
pub struct Config {
    pub dir: PathBuf,
    pub peers_file: PathBuf,
    pub io_timeout: Option<Duration>,
    pub confirm_timeout: Option<Duration>,
    pub verbose: bool,
}

impl Config {
    pub fn from_args(args: &Args) -> Self {
        Self {
            dir: args.dir.clone(),
            peers_file: args.peers_file.clone().unwrap_or_else(default_peers_path),
            io_timeout: seconds(args.timeout),
            confirm_timeout: seconds(args.confirm_timeout),
            verbose: args.verbose,
        }
    }

    pub fn sync_config(&self) -> SyncConfig {
        SyncConfig {
            io_timeout: self.io_timeout,
            confirm_timeout: self.confirm_timeout,
            max_chunk_size: MAX_CHUNK_SIZE,
        }
    }
}

/// `0` disables the deadline.
fn seconds(secs: u64) -> Option<Duration> {
    (secs > 0).then(|| Duration::from_secs(secs))
}
