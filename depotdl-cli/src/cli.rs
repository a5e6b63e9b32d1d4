/*!
The `cli` module provides the data types used for parsing the command line
arguments, along with small helpers for turning them into what the
`depotdl` engine expects.
*/

use anyhow::{anyhow, Result};
use clap::AppSettings;
use structopt::StructOpt;

use std::path::PathBuf;

/// Indicates which subcommand the user has chosen.
#[derive(StructOpt, Debug, Clone)]
pub enum Command {
    /// Downloads every depot of an app directory holding manifests and a
    /// config.vdf with their decryption keys
    App {
        /// Directory containing *.manifest files and config.vdf
        #[structopt(short = "p", long)]
        app_path: PathBuf,
    },
    /// Downloads specific depots from manifest / key pairs
    Depot {
        /// Manifest files, paired positionally with --depot-key
        #[structopt(short = "m", long = "manifest-path", required = true)]
        manifest_path: Vec<PathBuf>,
        /// Hex encoded depot keys, paired positionally with --manifest-path
        #[structopt(short = "k", long = "depot-key", required = true)]
        depot_key: Vec<String>,
    },
}

/// Struct for holding the options the user has selected
#[derive(StructOpt, Debug)]
#[structopt(
    name = "depotdl",
    about = "Downloads the contents of Steam depots from the content CDN",
    author = env!("CARGO_PKG_AUTHORS"),
    global_setting(AppSettings::ColoredHelp),
)]
pub struct Opt {
    /// Number of chunk download workers to run at once
    #[structopt(short = "t", long, default_value = "32")]
    pub thread_num: usize,
    /// Directory to reconstruct the depot under
    #[structopt(short = "o", long)]
    pub save_path: Option<PathBuf>,
    /// Log in anonymously and manage CDN auth tokens per endpoint
    #[structopt(short = "c", long)]
    pub login_anonymous: bool,
    /// Content server base URLs to use ahead of the directory.
    /// Repeatable; each value may hold several URLs separated by commas
    #[structopt(short = "s", long = "server")]
    pub server_list: Vec<String>,
    /// Log level (ERROR, WARN, INFO, DEBUG or TRACE)
    #[structopt(short = "l", long, default_value = "INFO")]
    pub level: String,
    /// Transport level retries per HTTP attempt
    #[structopt(short = "r", long, default_value = "3")]
    pub retry_num: u32,
    /// Operation to perform
    #[structopt(subcommand)]
    pub command: Command,
}

impl Opt {
    /// The deduplicated, comma-split server list
    pub fn servers(&self) -> Vec<String> {
        let mut servers: Vec<String> = Vec::new();
        for entry in &self.server_list {
            for part in entry.split(',') {
                let part = part.trim();
                if !part.is_empty() && !servers.iter().any(|known| known == part) {
                    servers.push(part.to_string());
                }
            }
        }
        servers
    }

    /// The `--level` argument as a tracing level
    pub fn log_level(&self) -> Result<tracing::Level> {
        self.level
            .parse()
            .map_err(|_| anyhow!("unknown log level {:?}", self.level))
    }
}
