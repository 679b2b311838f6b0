use std::net::SocketAddr;
use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

#[derive(Parser)]
#[command(name = "ark", about = "ark: versioned object storage over HTTP", version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    #[arg(short, long, global = true)]
    pub verbose: bool,
}

#[derive(Subcommand)]
pub enum Command {
    /// Start the HTTP server
    Serve(ServeArgs),
    /// Print the effective configuration as TOML
    Config(ServeArgs),
    /// List upload sessions recorded in a journal
    Sessions(JournalArgs),
    /// Rewrite a journal to hold only live sessions
    Compact(JournalArgs),
}

/// Settings shared by `serve` and `config`. Flags override the config file.
#[derive(Args, Default)]
pub struct ServeArgs {
    /// TOML config file
    #[arg(short, long)]
    pub config: Option<PathBuf>,
    #[arg(long)]
    pub bind: Option<SocketAddr>,
    /// Directory holding objects and uploads
    #[arg(long)]
    pub root: Option<PathBuf>,
    #[arg(long)]
    pub storage_root_id: Option<String>,
    /// Session journal file
    #[arg(long)]
    pub journal: Option<PathBuf>,
    /// Serve another storage root, as ID=DIR. Repeatable.
    #[arg(long = "extra-root", value_name = "ID=DIR", value_parser = parse_root)]
    pub extra_roots: Vec<(String, PathBuf)>,
    /// Refuse uploads
    #[arg(long)]
    pub no_uploads: bool,
    /// Require a bearer token on every request
    #[arg(long)]
    pub require_auth: bool,
}

fn parse_root(s: &str) -> Result<(String, PathBuf), String> {
    match s.split_once('=') {
        Some((id, dir)) if !id.is_empty() && !dir.is_empty() => {
            Ok((id.to_string(), PathBuf::from(dir)))
        }
        _ => Err(format!("expected ID=DIR, got {s:?}")),
    }
}

#[derive(Args)]
pub struct JournalArgs {
    pub path: PathBuf,
}
