use anyhow::Result;
use clap::{Parser, Subcommand};

use crate::config::Config;

#[derive(Parser, Debug)]
#[command(
    name = "gangway",
    version,
    about = "Terminal gateway relaying SSH and browser sessions into container workloads"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// SSH front door serving the relay menu on port 22
    Relay {
        /// Address to listen on
        #[arg(long)]
        ip: String,
    },

    /// Browser front door (/ws, /key)
    Web {
        /// Listen address
        #[arg(long, default_value = "0.0.0.0:9999")]
        addr: String,
    },

    /// Container-exec bridge (/term) on a backend node
    Backend {
        /// Listen address
        #[arg(long, default_value = "0.0.0.0:2356")]
        addr: String,
    },
}

pub async fn run(cli: Cli) -> Result<()> {
    let cfg = Config::from_env();
    match cli.command {
        Commands::Relay { ip } => crate::ssh::serve(&ip, cfg).await,
        Commands::Web { addr } => crate::web::serve(&addr, cfg).await,
        Commands::Backend { addr } => crate::bridge::serve(&addr).await,
    }
}
