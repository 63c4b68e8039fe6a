use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use colored::Colorize;

mod commands;
mod output;

/// itemstore - inspect and modify items through the configured backend
#[derive(Parser)]
#[command(name = "itemstore")]
#[command(version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Configuration file; defaults to ./config.toml and the XDG config dir
    #[arg(short, long, global = true, env = "ITEMSTORE_CONFIG", value_name = "FILE")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Check that the backend is reachable
    Ping,
    /// Create an item
    Create {
        #[arg(long)]
        name: String,
        #[arg(long)]
        price: f64,
    },
    /// Show one item
    Get { id: u64 },
    /// Replace name and price of an item at a known version
    Update {
        id: u64,
        /// New name; keeps the stored name when omitted
        #[arg(long)]
        name: Option<String>,
        /// New price; keeps the stored price when omitted
        #[arg(long)]
        price: Option<f64>,
        /// Version the change was based on
        #[arg(long)]
        version: u64,
    },
    /// Delete an item
    Delete { id: u64 },
    /// List items matching every given filter
    List(ListArgs),
    /// Liveness and readiness report
    Health,
}

#[derive(Args, Debug, Default)]
pub struct ListArgs {
    /// Case-insensitive substring of the name
    #[arg(long, conflicts_with = "name_exact")]
    name: Option<String>,
    /// Exact name
    #[arg(long)]
    name_exact: Option<String>,
    #[arg(long)]
    min_price: Option<f64>,
    #[arg(long)]
    max_price: Option<f64>,
    /// Page size; 0 returns everything
    #[arg(long, default_value_t = 0)]
    limit: u32,
    #[arg(long, default_value_t = 0)]
    offset: u32,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    match commands::execute(cli).await {
        Ok(()) => std::process::exit(0),
        Err(e) => {
            eprintln!("{} {}", "Error:".red().bold(), e);
            for cause in e.chain().skip(1) {
                eprintln!("\n{} {}", "Caused by:".yellow(), cause);
            }
            std::process::exit(1);
        }
    }
}
